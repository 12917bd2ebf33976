use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, serialize, Attribute, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use regex::Regex;
use std::ops::Range;
use std::rc::Rc;
use std::sync::OnceLock;
use tracing::debug;

use crate::classifier::{is_data_uri, ResourceCategory};
use crate::error::ReferenceError;

/// Position of a node in the document's pre-order traversal.
///
/// Parsing the same markup twice yields the same ids, so ids taken from one
/// parse can be applied to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Parsed HTML tree with a stable node index.
pub struct HtmlDocument {
    dom: RcDom,
    nodes: Vec<Handle>,
}

impl HtmlDocument {
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        Self::from_dom(dom)
    }

    pub fn from_dom(dom: RcDom) -> Self {
        let mut nodes = Vec::new();
        collect_nodes(&dom.document, &mut nodes);
        Self { dom, nodes }
    }

    pub fn node(&self, id: NodeId) -> Option<&Handle> {
        self.nodes.get(id.0)
    }

    pub fn dom_mut(&mut self) -> &mut RcDom {
        &mut self.dom
    }

    /// First element with the given local name, in document order.
    pub fn find_element(&self, name: &str) -> Option<Handle> {
        self.nodes
            .iter()
            .find(|node| element_name(node) == Some(name))
            .cloned()
    }

    /// Id of `node`, searching only the subtree that starts at `ancestor`.
    pub fn descendant_id(&self, ancestor: NodeId, node: &Handle) -> Option<NodeId> {
        self.nodes
            .get(ancestor.0..)?
            .iter()
            .position(|candidate| Rc::ptr_eq(candidate, node))
            .map(|offset| NodeId(ancestor.0 + offset))
    }

    /// Iterates `(id, handle)` over every node in document order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Handle)> {
        self.nodes.iter().enumerate().map(|(i, h)| (NodeId(i), h))
    }

    pub fn to_html(&self) -> std::io::Result<String> {
        let document: SerializableHandle = self.dom.document.clone().into();
        let mut bytes = Vec::new();
        serialize(&mut bytes, &document, Default::default())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn collect_nodes(handle: &Handle, out: &mut Vec<Handle>) {
    out.push(handle.clone());
    for child in handle.children.borrow().iter() {
        collect_nodes(child, out);
    }
}

pub fn element_name(handle: &Handle) -> Option<&str> {
    match handle.data {
        NodeData::Element { ref name, .. } => Some(&*name.local),
        _ => None,
    }
}

pub fn attr_value(handle: &Handle, attr: &str) -> Option<String> {
    match handle.data {
        NodeData::Element { ref attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|a: &&Attribute| &*a.name.local == attr)
            .map(|a| a.value.to_string()),
        _ => None,
    }
}

/// Where a reference lives, precisely enough to write a new value back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Whole-attribute value, e.g. `src` or `href`.
    Attribute { node: NodeId, attr: &'static str },
    /// One candidate URL inside a `srcset` list.
    Srcset { node: NodeId, attr: &'static str },
    /// One `url(...)` inside an inline `style` attribute.
    InlineStyle { node: NodeId },
    /// One `url(...)` inside the text node of a `<style>` element.
    StyleText { node: NodeId },
}

impl Locator {
    pub fn node(&self) -> NodeId {
        match *self {
            Locator::Attribute { node, .. }
            | Locator::Srcset { node, .. }
            | Locator::InlineStyle { node }
            | Locator::StyleText { node } => node,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub category: ResourceCategory,
    pub locator: Locator,
    /// URL or data URI exactly as it appears in the document.
    pub raw_value: String,
}

/// References found in one document, plus the values that were skipped.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub references: Vec<ResourceReference>,
    pub skipped: Vec<ReferenceError>,
}

/// Element kinds the scanner cares about, resolved once per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Stylesheet,
    FontLink,
    IconLink,
    Script,
    Img,
    Video,
    Audio,
    Source,
    Style,
    Other,
}

#[derive(Debug, Clone, Copy)]
enum ValueShape {
    Single,
    Srcset,
}

#[derive(Debug, Clone, Copy)]
struct AttrRule {
    attr: &'static str,
    category: ResourceCategory,
    shape: ValueShape,
}

const fn single(attr: &'static str, category: ResourceCategory) -> AttrRule {
    AttrRule {
        attr,
        category,
        shape: ValueShape::Single,
    }
}

const fn srcset(attr: &'static str, category: ResourceCategory) -> AttrRule {
    AttrRule {
        attr,
        category,
        shape: ValueShape::Srcset,
    }
}

impl ElementKind {
    pub fn of(handle: &Handle) -> Self {
        let Some(name) = element_name(handle) else {
            return ElementKind::Other;
        };

        match name {
            "link" => {
                let rel = attr_value(handle, "rel").unwrap_or_default().to_ascii_lowercase();
                let rel_tokens: Vec<&str> = rel.split_ascii_whitespace().collect();
                let preload_as = attr_value(handle, "as").unwrap_or_default();

                if rel_tokens.contains(&"stylesheet") {
                    ElementKind::Stylesheet
                } else if rel_tokens.contains(&"font")
                    || (rel_tokens.contains(&"preload") && preload_as.eq_ignore_ascii_case("font"))
                {
                    ElementKind::FontLink
                } else if rel_tokens
                    .iter()
                    .any(|t| *t == "icon" || t.starts_with("apple-touch-icon"))
                {
                    ElementKind::IconLink
                } else {
                    ElementKind::Other
                }
            }
            "script" => ElementKind::Script,
            "img" => ElementKind::Img,
            "video" => ElementKind::Video,
            "audio" => ElementKind::Audio,
            "source" => ElementKind::Source,
            "style" => ElementKind::Style,
            _ => ElementKind::Other,
        }
    }

    fn rules(&self) -> &'static [AttrRule] {
        match self {
            ElementKind::Stylesheet => STYLESHEET_RULES,
            ElementKind::FontLink => FONT_LINK_RULES,
            ElementKind::IconLink => ICON_LINK_RULES,
            ElementKind::Script => SCRIPT_RULES,
            ElementKind::Img => IMG_RULES,
            ElementKind::Video => VIDEO_RULES,
            ElementKind::Audio => AUDIO_RULES,
            ElementKind::Source => SOURCE_RULES,
            ElementKind::Style | ElementKind::Other => &[],
        }
    }
}

const STYLESHEET_RULES: &[AttrRule] = &[single("href", ResourceCategory::Css)];
const FONT_LINK_RULES: &[AttrRule] = &[single("href", ResourceCategory::Font)];
const ICON_LINK_RULES: &[AttrRule] = &[single("href", ResourceCategory::Image)];
const SCRIPT_RULES: &[AttrRule] = &[single("src", ResourceCategory::Js)];
const IMG_RULES: &[AttrRule] = &[
    single("src", ResourceCategory::Image),
    srcset("srcset", ResourceCategory::Image),
];
const VIDEO_RULES: &[AttrRule] = &[
    single("src", ResourceCategory::Media),
    single("poster", ResourceCategory::Image),
];
const AUDIO_RULES: &[AttrRule] = &[single("src", ResourceCategory::Media)];
const SOURCE_RULES: &[AttrRule] = &[
    single("src", ResourceCategory::Media),
    srcset("srcset", ResourceCategory::Image),
];

/// Walks the tree and lists every static resource reference in document order.
pub fn scan(doc: &HtmlDocument) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for (id, handle) in doc.nodes() {
        let kind = ElementKind::of(handle);

        for rule in kind.rules() {
            let Some(value) = attr_value(handle, rule.attr) else {
                continue;
            };
            match rule.shape {
                ValueShape::Single => outcome.push(
                    rule.category,
                    Locator::Attribute {
                        node: id,
                        attr: rule.attr,
                    },
                    value.trim(),
                ),
                ValueShape::Srcset => {
                    for range in srcset_candidates(&value) {
                        outcome.push(
                            rule.category,
                            Locator::Srcset {
                                node: id,
                                attr: rule.attr,
                            },
                            &value[range],
                        );
                    }
                }
            }
        }

        if let Some(style) = attr_value(handle, "style") {
            for range in css_urls(&style) {
                let raw = &style[range];
                outcome.push(css_category(raw), Locator::InlineStyle { node: id }, raw);
            }
        }

        if kind == ElementKind::Style {
            for child in handle.children.borrow().iter() {
                if let NodeData::Text { ref contents } = child.data {
                    let Some(text_id) = doc.descendant_id(id, child) else {
                        continue;
                    };
                    let css = contents.borrow().to_string();
                    for range in css_urls(&css) {
                        let raw = &css[range];
                        outcome.push(css_category(raw), Locator::StyleText { node: text_id }, raw);
                    }
                }
            }
        }
    }

    debug!(
        references = outcome.references.len(),
        skipped = outcome.skipped.len(),
        "scanned document"
    );
    outcome
}

impl ScanOutcome {
    fn push(&mut self, category: ResourceCategory, locator: Locator, raw: &str) {
        match check_reference(raw) {
            Ok(()) => self.references.push(ResourceReference {
                category,
                locator,
                raw_value: raw.to_string(),
            }),
            Err(err) => self.skipped.push(err),
        }
    }
}

fn check_reference(raw: &str) -> Result<(), ReferenceError> {
    if raw.is_empty() {
        return Err(ReferenceError::scan(raw, "empty reference"));
    }
    if raw.starts_with('#') {
        return Err(ReferenceError::scan(raw, "fragment-only reference"));
    }
    let lowered = raw.to_ascii_lowercase();
    for scheme in ["javascript:", "mailto:", "about:", "blob:", "tel:"] {
        if lowered.starts_with(scheme) {
            return Err(ReferenceError::scan(raw, "unsupported scheme"));
        }
    }
    Ok(())
}

fn css_category(raw: &str) -> ResourceCategory {
    if is_data_uri(raw) {
        let mime = raw[5..].split([';', ',']).next().unwrap_or("");
        ResourceCategory::for_css_url(mime, true)
    } else {
        let path = raw.split(['?', '#']).next().unwrap_or(raw);
        ResourceCategory::for_css_url(path, false)
    }
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Quoted forms may contain parentheses; the bare form may not.
        Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^'")\s]+))\s*\)"#)
            .expect("url() pattern is a valid regex")
    })
}

/// Byte ranges of the URL inside every `url(...)` in a CSS fragment.
///
/// Single quotes, double quotes and bare values are all accepted; the range
/// excludes the quotes and surrounding whitespace.
pub fn css_urls(css: &str) -> Vec<Range<usize>> {
    css_url_regex()
        .captures_iter(css)
        .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)).or_else(|| cap.get(3)))
        .filter_map(|m| {
            let value = m.as_str();
            let start = m.start() + (value.len() - value.trim_start().len());
            let end = m.end() - (value.len() - value.trim_end().len());
            (start < end).then_some(start..end)
        })
        .collect()
}

/// Byte ranges of each candidate URL in a `srcset` value.
///
/// Descriptors (`1x`, `480w`) are not part of the ranges. Commas inside a
/// URL, as in data URIs, are kept with the URL.
pub fn srcset_candidates(value: &str) -> Vec<Range<usize>> {
    let bytes = value.as_bytes();
    let mut ranges = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let mut end = pos;
        let mut candidate_closed = false;
        while end > start && bytes[end - 1] == b',' {
            end -= 1;
            candidate_closed = true;
        }
        if end > start {
            ranges.push(start..end);
        }

        if !candidate_closed {
            // Skip descriptors up to the next comma outside parentheses.
            let mut depth = 0usize;
            while pos < bytes.len() {
                match bytes[pos] {
                    b'(' => depth += 1,
                    b')' => depth = depth.saturating_sub(1),
                    b',' if depth == 0 => break,
                    _ => {}
                }
                pos += 1;
            }
        }
    }

    ranges
}
