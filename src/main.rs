use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use page_mirror::config::{Settings, SnapshotConfig};
use page_mirror::downloader::{decode_html, ResourceFetcher};
use page_mirror::{MirrorCommand, SnapshotJob, TerminalProgress, TextJob};

#[tokio::main]
async fn main() -> Result<()> {
    let args = MirrorCommand::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!(?args, "CLI arguments parsed");

    let mut settings = match &args.config {
        Some(path) => Settings::from_json_file(path)?,
        None => Settings::default(),
    };
    args.apply_to(&mut settings);
    settings.validate()?;

    let html = match &args.input {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read input file: {:?}", path))?;
            decode_html(&bytes, None)
        }
        None => fetch_page(&args.url, &settings.snapshot).await?,
    };

    println!("🚀 Mirroring: {}", args.url.blue());
    println!("📁 Output directory: {:?}", args.output_dir);

    if args.wants_snapshot() {
        let progress = Arc::new(TerminalProgress::new());
        let report = SnapshotJob::new(&args.url, &args.output_dir, settings.snapshot.clone())?
            .with_progress(progress.clone())
            .run(&html)
            .await?;
        progress.finish();

        println!(
            "✅ Saved {} ({} resources, {} from cache)",
            report.entry_path.display().to_string().green(),
            report.resources.len(),
            report.cache_hits
        );
        for failure in &report.failures {
            eprintln!("⚠️  {} {}: {}", failure.category, failure.source.yellow(), failure.error);
        }
    }

    if args.wants_text() {
        let progress = Arc::new(TerminalProgress::new());
        let report = TextJob::new(
            &args.url,
            &args.output_dir,
            settings.text.clone(),
            settings.snapshot.clone(),
        )?
        .with_progress(progress.clone())
        .run(&html)
        .await?;
        progress.finish();

        println!(
            "📝 Text saved to {} ({} elements)",
            report.output_path.display().to_string().green(),
            report.elements
        );
    }

    Ok(())
}

async fn fetch_page(url: &str, config: &SnapshotConfig) -> Result<String> {
    let url = Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    info!(%url, "fetching page");
    let body = ResourceFetcher::new(config)?
        .fetch_direct(&url)
        .await
        .into_result(url.as_str())
        .with_context(|| format!("Failed to fetch {url}"))?;
    Ok(decode_html(&body.bytes, body.content_type.as_deref()))
}
