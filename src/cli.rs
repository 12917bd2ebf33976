use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::{Settings, TextFormat, UnresolvedPolicy};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum TextFormatArg {
    Markdown,
    Plain,
}

impl From<TextFormatArg> for TextFormat {
    fn from(arg: TextFormatArg) -> Self {
        match arg {
            TextFormatArg::Markdown => TextFormat::Markdown,
            TextFormatArg::Plain => TextFormat::PlainText,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "page-mirror",
    about = "Saves a web page as a self-contained, browsable local copy",
    version,
    long_about = "Downloads every stylesheet, script, image, font and media file a page references, \
                  stores them under resources/, and rewrites the page so it opens offline. \
                  Can also extract the readable text of the page."
)]
pub struct MirrorCommand {
    /// The URL of the page; also the base for relative references
    #[arg(required = true)]
    pub url: String,

    /// Output directory for the mirror
    #[arg(short, long, default_value = "./mirrored_page")]
    pub output_dir: PathBuf,

    /// Read the page HTML from this file instead of fetching the URL
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// JSON settings file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent resource downloads
    #[arg(short = 'c', long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub concurrency: Option<usize>,

    /// Total timeout per request in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Connect timeout per request in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Attempts per resource, including the first
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_retries: Option<u32>,

    /// Base delay between attempts in seconds (grows linearly)
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Also extract the page text into text/
    #[arg(long)]
    pub extract_text: bool,

    /// Only extract text, do not mirror
    #[arg(long)]
    pub text_only: bool,

    /// Format of the extracted text
    #[arg(long, value_enum)]
    pub text_format: Option<TextFormatArg>,

    /// Embed images in the extracted text
    #[arg(long)]
    pub keep_images: bool,

    /// Keep tables in the extracted text
    #[arg(long)]
    pub keep_tables: bool,

    /// Keep links in the extracted text
    #[arg(long)]
    pub keep_links: bool,

    /// Validate TLS certificates when fetching resources
    #[arg(long)]
    pub strict_tls: bool,

    /// Leave references that could not be downloaded as they were
    #[arg(long)]
    pub leave_unresolved: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl MirrorCommand {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn wants_snapshot(&self) -> bool {
        !self.text_only
    }

    pub fn wants_text(&self) -> bool {
        self.extract_text || self.text_only
    }

    /// Applies flags on top of settings loaded from a file or defaults.
    pub fn apply_to(&self, settings: &mut Settings) {
        let snapshot = &mut settings.snapshot;
        if let Some(concurrency) = self.concurrency {
            snapshot.concurrency_limit = concurrency;
        }
        if let Some(timeout) = self.timeout {
            snapshot.fetch_timeout_seconds = timeout;
        }
        if let Some(timeout) = self.connect_timeout {
            snapshot.connect_timeout_seconds = timeout;
        }
        if let Some(retries) = self.max_retries {
            snapshot.max_retries = retries;
        }
        if let Some(delay) = self.retry_delay {
            snapshot.retry_base_delay_seconds = delay;
        }
        if self.strict_tls {
            snapshot.accept_invalid_certs = false;
        }
        if self.leave_unresolved {
            snapshot.unresolved = UnresolvedPolicy::Untouched;
        }

        let text = &mut settings.text;
        if let Some(format) = self.text_format {
            text.format = format.into();
        }
        text.keep_images |= self.keep_images;
        text.keep_tables |= self.keep_tables;
        text.keep_links |= self.keep_links;
    }
}
