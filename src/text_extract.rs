//! Readable-text extraction: headings, paragraphs, lists and, when enabled,
//! images, tables and links, rendered as Markdown or plain text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use select::document::Document;
use select::node::Node;
use select::predicate::{Attr, Class, Element, Name};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::{Classified, UriClassifier};
use crate::config::{SnapshotConfig, TextConfig, TextFormat};
use crate::downloader::{FetchOutcome, ResourceFetcher};
use crate::error::JobError;
use crate::file_manager::sanitize_file_name;
use crate::progress::{NoProgress, ProgressReporter, ProgressTracker};

pub const TEXT_DIR: &str = "text";

const ALWAYS_REMOVED: &[&str] = &["script", "style", "noscript", "template"];
const AD_WORDS: &[&str] = &[
    "ad",
    "ads",
    "advert",
    "advertisement",
    "banner",
    "sponsor",
    "sponsored",
    "commercial",
];
const MENU_TAGS: &[&str] = &["nav", "menu"];
const MENU_WORDS: &[&str] = &["menu", "nav", "navigation", "navbar"];
const HEADER_WORDS: &[&str] = &["header", "top-bar", "topbar"];
const FOOTER_WORDS: &[&str] = &["footer", "bottom"];
const DEFAULT_ALT: &str = "Image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageElement {
    pub src: String,
    pub alt: String,
    /// Filled in by [`embed_images`]; images that stay `None` are dropped on render.
    pub embedded: Option<EmbeddedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextElement {
    Heading { level: u8, text: String },
    Paragraph(String),
    Image(ImageElement),
    Table(Vec<Vec<String>>),
    Link { text: String, href: String },
    List { ordered: bool, items: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub title: Option<String>,
    pub elements: Vec<TextElement>,
}

impl ExtractedDocument {
    pub fn images(&self) -> impl Iterator<Item = &ImageElement> {
        self.elements.iter().filter_map(|e| match e {
            TextElement::Image(image) => Some(image),
            _ => None,
        })
    }
}

/// Classifies the nodes of one page into [`TextElement`]s.
pub struct TextExtractor<'a> {
    config: &'a TextConfig,
}

impl<'a> TextExtractor<'a> {
    pub fn new(config: &'a TextConfig) -> Self {
        Self { config }
    }

    pub fn extract(&self, html: &str) -> ExtractedDocument {
        let document = Document::from(html);

        let title = document
            .find(Name("title"))
            .next()
            .map(|t| collapse_whitespace(&t.text()))
            .filter(|t| !t.is_empty());

        let scope = if self.config.keep_main_content {
            self.main_region(&document)
        } else {
            None
        };
        if let Some(region) = scope {
            debug!(tag = region.name().unwrap_or(""), "restricting to main content");
        }

        let candidates: Vec<Node<'_>> = match scope {
            Some(region) => region.find(Element).collect(),
            None => document.find(Element).collect(),
        };

        let elements = candidates
            .into_iter()
            .filter(|node| !self.is_excluded(*node))
            .filter_map(|node| self.classify(node))
            .collect();

        ExtractedDocument { title, elements }
    }

    fn main_region<'d>(&self, document: &'d Document) -> Option<Node<'d>> {
        let not_excluded = |node: &Node<'d>| !self.is_excluded(*node);
        document
            .find(Name("main"))
            .find(not_excluded)
            .or_else(|| document.find(Name("article")).find(not_excluded))
            .or_else(|| document.find(Attr("id", "content")).find(not_excluded))
            .or_else(|| document.find(Class("content")).find(not_excluded))
            .or_else(|| document.find(Attr("id", "main")).find(not_excluded))
            .or_else(|| document.find(Class("main")).find(not_excluded))
    }

    fn classify(&self, node: Node<'_>) -> Option<TextElement> {
        let name = node.name()?;
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse().ok()?;
                let text = self.visible_text(node);
                (!text.is_empty()).then_some(TextElement::Heading { level, text })
            }
            "p" => {
                let text = self.visible_text(node);
                (text.chars().count() > self.config.min_paragraph_chars)
                    .then_some(TextElement::Paragraph(text))
            }
            "img" if self.config.keep_images => {
                let src = node.attr("src").map(str::trim).filter(|s| !s.is_empty())?;
                let alt = node
                    .attr("alt")
                    .map(collapse_whitespace)
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| DEFAULT_ALT.to_string());
                Some(TextElement::Image(ImageElement {
                    src: src.to_string(),
                    alt,
                    embedded: None,
                }))
            }
            "table" if self.config.keep_tables => {
                let rows: Vec<Vec<String>> = node
                    .find(Name("tr"))
                    .map(|row| {
                        row.find(Element)
                            .filter(|cell| matches!(cell.name(), Some("td" | "th")))
                            .map(|cell| self.visible_text(cell))
                            .collect::<Vec<_>>()
                    })
                    .filter(|cells| !cells.is_empty())
                    .collect();
                (!rows.is_empty()).then_some(TextElement::Table(rows))
            }
            "a" if self.config.keep_links => {
                let text = self.visible_text(node);
                let href = node.attr("href").map(str::trim).unwrap_or("");
                (!text.is_empty() && !href.is_empty()).then(|| TextElement::Link {
                    text,
                    href: href.to_string(),
                })
            }
            "ul" | "ol" if self.config.keep_lists => {
                let items: Vec<String> = node
                    .find(Name("li"))
                    .filter(|li| !self.is_excluded(*li))
                    .map(|li| self.visible_text(li))
                    .filter(|text| !text.is_empty())
                    .collect();
                (!items.is_empty()).then_some(TextElement::List {
                    ordered: name == "ol",
                    items,
                })
            }
            _ => None,
        }
    }

    /// True if the node or any ancestor is boilerplate under the current options.
    fn is_excluded(&self, node: Node<'_>) -> bool {
        std::iter::successors(Some(node), |n| n.parent()).any(|n| self.is_removed(n))
    }

    fn is_removed(&self, node: Node<'_>) -> bool {
        let Some(name) = node.name() else {
            return false;
        };
        if ALWAYS_REMOVED.contains(&name) {
            return true;
        }
        let class = node.attr("class").unwrap_or("");
        let config = self.config;
        (config.remove_ads && class_matches(class, AD_WORDS))
            || (config.remove_menus && (MENU_TAGS.contains(&name) || class_matches(class, MENU_WORDS)))
            || (config.remove_headers && (name == "header" || class_matches(class, HEADER_WORDS)))
            || (config.remove_footers && (name == "footer" || class_matches(class, FOOTER_WORDS)))
    }

    /// Text of the node without removed descendants, whitespace collapsed.
    fn visible_text(&self, node: Node<'_>) -> String {
        let mut raw = String::new();
        self.collect_text(node, &mut raw);
        collapse_whitespace(&raw)
    }

    fn collect_text(&self, node: Node<'_>, out: &mut String) {
        for child in node.children() {
            if let Some(text) = child.as_text() {
                out.push_str(text);
            } else if child.name().is_some() && !self.is_removed(child) {
                self.collect_text(child, out);
                if matches!(child.name(), Some("br" | "p" | "li" | "div" | "td" | "th")) {
                    out.push(' ');
                }
            }
        }
    }
}

/// Whether any class token, or any `-`/`_` separated part of one, is in `words`.
fn class_matches(class: &str, words: &[&str]) -> bool {
    class.split_whitespace().any(|token| {
        let token = token.to_ascii_lowercase();
        words.contains(&token.as_str())
            || token
                .split(['-', '_'])
                .any(|part| words.contains(&part))
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fetches or decodes every kept image, one at a time, outside the snapshot pool.
///
/// Returns how many images were embedded.
pub async fn embed_images(
    document: &mut ExtractedDocument,
    classifier: &UriClassifier,
    fetcher: &ResourceFetcher,
) -> usize {
    let mut embedded = 0;
    for element in &mut document.elements {
        let TextElement::Image(image) = element else {
            continue;
        };
        let source = match classifier.classify(&image.src) {
            Ok(source) => source,
            Err(e) => {
                warn!(src = %image.src, error = %e, "image skipped");
                continue;
            }
        };
        let (report, fallback_mime) = match &source {
            Classified::Data(data) => (fetcher.decode_data(data), Some(data.mime.clone())),
            Classified::Network(url) => (fetcher.fetch_direct(url).await, None),
        };
        match report.outcome {
            FetchOutcome::Success(body) => {
                let mime = body
                    .content_type
                    .or(fallback_mime)
                    .unwrap_or_else(|| {
                        mime_guess::from_path(&image.src)
                            .first_or_octet_stream()
                            .to_string()
                    });
                image.embedded = Some(EmbeddedImage {
                    mime,
                    bytes: body.bytes,
                });
                embedded += 1;
            }
            FetchOutcome::PermanentFailure(reason) | FetchOutcome::TransientFailure(reason) => {
                warn!(src = %image.src, %reason, "image could not be embedded");
            }
        }
    }
    embedded
}

pub fn render(document: &ExtractedDocument, format: TextFormat) -> String {
    match format {
        TextFormat::Markdown => render_markdown(document),
        TextFormat::PlainText => render_plain_text(document),
    }
}

/// Markdown with images inlined as base64 `data:` URIs.
pub fn render_markdown(document: &ExtractedDocument) -> String {
    let mut blocks = Vec::new();
    if let Some(title) = &document.title {
        blocks.push(format!("# {title}"));
    }
    for element in &document.elements {
        match element {
            TextElement::Heading { level, text } => {
                blocks.push(format!("{} {}", "#".repeat(*level as usize), text))
            }
            TextElement::Paragraph(text) => blocks.push(text.clone()),
            TextElement::Image(ImageElement {
                alt,
                embedded: Some(image),
                ..
            }) => blocks.push(format!(
                "![{}](data:{};base64,{})",
                alt.replace(['[', ']'], ""),
                image.mime,
                STANDARD.encode(&image.bytes)
            )),
            TextElement::Image(_) => {}
            TextElement::Table(rows) => blocks.push(markdown_table(rows)),
            TextElement::Link { text, href } => blocks.push(format!("[{text}]({href})")),
            TextElement::List { ordered, items } => blocks.push(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        if *ordered {
                            format!("{}. {item}", i + 1)
                        } else {
                            format!("- {item}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        }
    }
    let mut out = blocks.join("\n\n");
    out.push('\n');
    out
}

fn markdown_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let line = |cells: &[String]| {
        let mut padded: Vec<String> = cells.iter().map(|c| c.replace('|', "\\|")).collect();
        padded.resize(columns, String::new());
        format!("| {} |", padded.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    if let Some((header, body)) = rows.split_first() {
        lines.push(line(header.as_slice()));
        lines.push(format!("|{}", " --- |".repeat(columns)));
        lines.extend(body.iter().map(|row| line(row.as_slice())));
    }
    lines.join("\n")
}

/// Plain text: `#` headings, paragraphs, `text <href>` links, one block per list item.
/// Images and tables are left out.
pub fn render_plain_text(document: &ExtractedDocument) -> String {
    let mut blocks = Vec::new();
    for element in &document.elements {
        match element {
            TextElement::Heading { level, text } => {
                blocks.push(format!("\n{} {}\n", "#".repeat(*level as usize), text))
            }
            TextElement::Paragraph(text) => blocks.push(text.clone()),
            TextElement::Link { text, href } => blocks.push(format!("{text} <{href}>")),
            TextElement::List { ordered, items } => {
                for (i, item) in items.iter().enumerate() {
                    if *ordered {
                        blocks.push(format!("{}. {item}", i + 1));
                    } else {
                        blocks.push(format!("* {item}"));
                    }
                }
            }
            TextElement::Image(_) | TextElement::Table(_) => {}
        }
    }
    blocks.join("\n\n")
}

#[derive(Debug)]
pub struct TextReport {
    pub output_path: PathBuf,
    pub elements: usize,
    pub images_embedded: usize,
}

/// Extracts one page's text into `<root>/text/<host>_content.<ext>`.
pub struct TextJob {
    classifier: UriClassifier,
    output_root: PathBuf,
    config: TextConfig,
    fetch_config: SnapshotConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl TextJob {
    pub fn new(
        base_url: &str,
        output_root: impl Into<PathBuf>,
        config: TextConfig,
        fetch_config: SnapshotConfig,
    ) -> Result<Self, JobError> {
        Ok(Self {
            classifier: UriClassifier::new(base_url)?,
            output_root: output_root.into(),
            config,
            fetch_config,
            progress: Arc::new(NoProgress),
        })
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn output_path(&self) -> PathBuf {
        let host = self
            .classifier
            .base_url()
            .host_str()
            .map(sanitize_file_name)
            .unwrap_or_else(|| "unknown_domain".to_string());
        self.output_root
            .join(TEXT_DIR)
            .join(format!("{host}_content.{}", self.config.format.extension()))
    }

    pub async fn run(&self, html: &str) -> Result<TextReport, JobError> {
        let tracker = ProgressTracker::new(self.progress.clone());
        tracker.report(0.0, "Preparing text extraction");

        let result = self.run_phases(html, &tracker).await;
        match &result {
            Ok(report) => {
                info!(
                    path = %report.output_path.display(),
                    elements = report.elements,
                    images = report.images_embedded,
                    "text extraction complete"
                );
                tracker.report(100.0, "Text extraction complete");
            }
            Err(e) => tracker.report(100.0, &format!("Text extraction failed: {e}")),
        }
        result
    }

    async fn run_phases(&self, html: &str, tracker: &ProgressTracker) -> Result<TextReport, JobError> {
        tracker.report(20.0, "Removing boilerplate");
        let mut document = TextExtractor::new(&self.config).extract(html);

        tracker.report(40.0, "Extracting content");
        let images_embedded = if document.images().next().is_some() {
            let fetcher = ResourceFetcher::new(&self.fetch_config)?;
            embed_images(&mut document, &self.classifier, &fetcher).await
        } else {
            0
        };

        tracker.report(60.0, "Formatting");
        let rendered = render(&document, self.config.format);

        tracker.report(80.0, "Saving file");
        let output_path = self.output_path();
        let write = || -> std::io::Result<()> {
            if let Some(parent) = output_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&output_path, rendered.as_bytes())
        };
        write().map_err(|source| JobError::Output {
            path: output_path.clone(),
            source,
        })?;

        Ok(TextReport {
            output_path,
            elements: document.elements.len(),
            images_embedded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"
        <html>
        <head><title> My   Page </title><style>p { color: red }</style></head>
        <body>
            <header><h1>Site name</h1></header>
            <nav><ul><li>Home</li><li>About</li></ul></nav>
            <div class="ad-slot"><p>Buy now, this offer will not last long at all!</p></div>
            <main>
                <h2>Introduction</h2>
                <p>Short one.</p>
                <p>This paragraph is long enough to be kept by the extractor.</p>
                <ol><li>First</li><li>Second <b>item</b></li></ol>
                <img src="data:image/png;base64,AAAA" alt="Chart">
                <table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table>
                <a href="https://example.com/more">Read more</a>
                <script>document.write("nope")</script>
            </main>
            <footer><p>Copyright notice with plenty of characters in it.</p></footer>
        </body>
        </html>
    "#;

    fn everything() -> TextConfig {
        TextConfig {
            keep_images: true,
            keep_tables: true,
            keep_links: true,
            ..TextConfig::default()
        }
    }

    #[test]
    fn test_defaults_keep_main_content_only() {
        let config = TextConfig::default();
        let doc = TextExtractor::new(&config).extract(ARTICLE);

        assert_eq!(doc.title.as_deref(), Some("My Page"));
        assert_eq!(
            doc.elements,
            vec![
                TextElement::Heading {
                    level: 2,
                    text: "Introduction".to_string()
                },
                TextElement::Paragraph(
                    "This paragraph is long enough to be kept by the extractor.".to_string()
                ),
                TextElement::List {
                    ordered: true,
                    items: vec!["First".to_string(), "Second item".to_string()]
                },
            ]
        );
    }

    #[test]
    fn test_optional_elements_are_gated() {
        let config = everything();
        let doc = TextExtractor::new(&config).extract(ARTICLE);

        assert!(doc.elements.contains(&TextElement::Table(vec![
            vec!["k".to_string(), "v".to_string()],
            vec!["a".to_string(), "1".to_string()],
        ])));
        assert!(doc.elements.contains(&TextElement::Link {
            text: "Read more".to_string(),
            href: "https://example.com/more".to_string(),
        }));
        assert_eq!(doc.images().count(), 1);
        assert_eq!(doc.images().next().unwrap().alt, "Chart");
    }

    #[test]
    fn test_boilerplate_removal_can_be_disabled() {
        let config = TextConfig {
            keep_main_content: false,
            remove_ads: false,
            remove_menus: false,
            remove_headers: false,
            remove_footers: false,
            ..TextConfig::default()
        };
        let doc = TextExtractor::new(&config).extract(ARTICLE);

        let has = |needle: &str| {
            doc.elements.iter().any(|e| match e {
                TextElement::Heading { text, .. } | TextElement::Paragraph(text) => text.contains(needle),
                TextElement::List { items, .. } => items.iter().any(|i| i.contains(needle)),
                _ => false,
            })
        };
        assert!(has("Site name"));
        assert!(has("Home"));
        assert!(has("Buy now"));
        assert!(has("Copyright"));
        assert!(!has("nope"));
    }

    #[test]
    fn test_class_matching_uses_whole_words() {
        assert!(class_matches("top ad-slot", AD_WORDS));
        assert!(class_matches("Sponsored", AD_WORDS));
        assert!(!class_matches("shadow header-ish", AD_WORDS));
        assert!(!class_matches("download", AD_WORDS));
        assert!(class_matches("site_navbar", MENU_WORDS));
        assert!(class_matches("top-bar", HEADER_WORDS));
    }

    #[test]
    fn test_render_markdown() {
        let doc = ExtractedDocument {
            title: Some("T".to_string()),
            elements: vec![
                TextElement::Heading {
                    level: 2,
                    text: "H".to_string(),
                },
                TextElement::Image(ImageElement {
                    src: "x.png".to_string(),
                    alt: "pic".to_string(),
                    embedded: Some(EmbeddedImage {
                        mime: "image/png".to_string(),
                        bytes: vec![0, 0, 0],
                    }),
                }),
                TextElement::Image(ImageElement {
                    src: "broken.png".to_string(),
                    alt: "gone".to_string(),
                    embedded: None,
                }),
                TextElement::Table(vec![
                    vec!["a".to_string(), "b|c".to_string()],
                    vec!["1".to_string()],
                ]),
                TextElement::List {
                    ordered: false,
                    items: vec!["x".to_string(), "y".to_string()],
                },
            ],
        };

        assert_eq!(
            render_markdown(&doc),
            "# T\n\n## H\n\n![pic](data:image/png;base64,AAAA)\n\n\
             | a | b\\|c |\n| --- | --- |\n| 1 |  |\n\n- x\n- y\n"
        );
    }

    #[test]
    fn test_render_plain_text_layout() {
        let doc = ExtractedDocument {
            title: Some("ignored".to_string()),
            elements: vec![
                TextElement::Heading {
                    level: 1,
                    text: "Top".to_string(),
                },
                TextElement::Paragraph("Body".to_string()),
                TextElement::Link {
                    text: "More".to_string(),
                    href: "https://x.test/".to_string(),
                },
                TextElement::List {
                    ordered: true,
                    items: vec!["one".to_string(), "two".to_string()],
                },
            ],
        };

        assert_eq!(
            render_plain_text(&doc),
            "\n# Top\n\n\nBody\n\nMore <https://x.test/>\n\n1. one\n\n2. two"
        );
    }

    #[tokio::test]
    async fn test_data_uri_images_embed_without_network() {
        let config = everything();
        let mut doc = TextExtractor::new(&config).extract(ARTICLE);
        let classifier = UriClassifier::new("https://example.com/").unwrap();
        let fetcher = ResourceFetcher::new(&SnapshotConfig::default()).unwrap();

        assert_eq!(embed_images(&mut doc, &classifier, &fetcher).await, 1);
        let image = doc.images().next().unwrap();
        assert_eq!(
            image.embedded,
            Some(EmbeddedImage {
                mime: "image/png".to_string(),
                bytes: vec![0, 0, 0],
            })
        );
    }

    #[tokio::test]
    async fn test_job_writes_into_text_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let job = TextJob::new(
            "https://news.example.com/a/b",
            temp_dir.path(),
            TextConfig::default(),
            SnapshotConfig::default(),
        )
        .unwrap();

        let report = job.run(ARTICLE).await.unwrap();

        assert_eq!(
            report.output_path,
            temp_dir.path().join("text").join("news.example.com_content.md")
        );
        let written = std::fs::read_to_string(&report.output_path).unwrap();
        assert!(written.starts_with("# My Page\n\n## Introduction"));
        assert_eq!(report.images_embedded, 0);
    }
}
