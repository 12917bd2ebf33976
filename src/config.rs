use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "PageMirror/1.0";

/// What to write back for a network reference that could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UnresolvedPolicy {
    /// Rewrite to the absolute URL so the mirror falls back to the network.
    #[default]
    AbsoluteUrl,
    /// Leave the attribute exactly as it was in the source document.
    Untouched,
}

/// Tunables for one snapshot job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotConfig {
    pub concurrency_limit: usize,
    pub fetch_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// Total attempts per network resource, including the first one.
    pub max_retries: u32,
    pub retry_base_delay_seconds: u64,
    pub entry_file: String,
    pub user_agent: String,
    pub unresolved: UnresolvedPolicy,
    /// Skip certificate validation when fetching static assets.
    pub accept_invalid_certs: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            fetch_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            max_retries: 3,
            retry_base_delay_seconds: 1,
            entry_file: "index.html".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            unresolved: UnresolvedPolicy::AbsoluteUrl,
            accept_invalid_certs: true,
        }
    }
}

impl SnapshotConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TextFormat {
    /// Markdown with images embedded as `data:` URIs.
    #[default]
    Markdown,
    PlainText,
}

impl TextFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TextFormat::Markdown => "md",
            TextFormat::PlainText => "txt",
        }
    }
}

/// Options for the text extraction pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextConfig {
    /// Paragraphs at or below this many characters are dropped as UI noise.
    pub min_paragraph_chars: usize,
    pub keep_images: bool,
    pub keep_tables: bool,
    pub keep_links: bool,
    pub keep_lists: bool,
    pub keep_main_content: bool,
    pub remove_ads: bool,
    pub remove_menus: bool,
    pub remove_headers: bool,
    pub remove_footers: bool,
    pub format: TextFormat,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            min_paragraph_chars: 20,
            keep_images: false,
            keep_tables: false,
            keep_links: false,
            keep_lists: true,
            keep_main_content: true,
            remove_ads: true,
            remove_menus: true,
            remove_headers: true,
            remove_footers: true,
            format: TextFormat::Markdown,
        }
    }
}

/// Everything a config file can set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub snapshot: SnapshotConfig,
    pub text: TextConfig,
}

impl Settings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.concurrency_limit == 0 {
            bail!("concurrencyLimit must be at least 1");
        }
        if self.snapshot.max_retries == 0 {
            bail!("maxRetries must be at least 1 (it counts the first attempt)");
        }
        if self.snapshot.entry_file.is_empty() || self.snapshot.entry_file.contains('/') {
            bail!("entryFile must be a plain file name");
        }
        Ok(())
    }
}
