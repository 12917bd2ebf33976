pub mod classifier;
pub mod cli;
pub mod config;
pub mod downloader;
pub mod error;
pub mod file_manager;
pub mod html_parser;
pub mod progress;
pub mod rewriter;
pub mod snapshot;
pub mod text_extract;

// Re-export main types for convenience
pub use classifier::{Classified, DataUri, ResourceCategory, UriClassifier};
pub use cli::MirrorCommand;
pub use config::{Settings, SnapshotConfig, TextConfig, TextFormat, UnresolvedPolicy};
pub use downloader::{decode_html, FetchOutcome, FetchReport, ResourceFetcher, RetryPolicy};
pub use error::{JobError, ReferenceError};
pub use file_manager::{LocalStore, PathPlanner, ResolvedResource};
pub use html_parser::{scan, HtmlDocument, Locator, ResourceReference};
pub use progress::{ProgressReporter, TerminalProgress};
pub use snapshot::{SnapshotJob, SnapshotReport};
pub use text_extract::{ExtractedDocument, TextElement, TextExtractor, TextJob};
