use html5ever::tendril::StrTendril;
use html5ever::tree_builder::{ElementFlags, NodeOrText, TreeSink};
use html5ever::{Attribute, LocalName, Namespace, QualName};
use markup5ever_rcdom::{Handle, NodeData};
use std::ops::Range;
use tracing::debug;

use crate::html_parser::{
    attr_value, css_urls, element_name, srcset_candidates, HtmlDocument, Locator,
    ResourceReference,
};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// New value for one reference.
#[derive(Debug, Clone, Copy)]
pub struct Rewrite<'a> {
    pub reference: &'a ResourceReference,
    pub replacement: &'a str,
}

/// Applies rewrites in the order given and returns how many changed the tree.
///
/// Whole attributes are replaced; inside `srcset`, `style` and `<style>` text
/// only the matching URL is swapped and everything around it is kept.
pub fn apply_rewrites(doc: &HtmlDocument, rewrites: &[Rewrite<'_>]) -> usize {
    let mut applied = 0;
    for rewrite in rewrites {
        let Some(handle) = doc.node(rewrite.reference.locator.node()) else {
            debug!(locator = ?rewrite.reference.locator, "locator points outside the document");
            continue;
        };
        let raw = rewrite.reference.raw_value.as_str();
        let changed = match rewrite.reference.locator {
            Locator::Attribute { attr, .. } => set_attr(handle, attr, rewrite.replacement),
            Locator::Srcset { attr, .. } => update_attr(handle, attr, |value| {
                replace_matching(value, srcset_candidates(value), raw, rewrite.replacement)
            }),
            Locator::InlineStyle { .. } => update_attr(handle, "style", |value| {
                replace_matching(value, css_urls(value), raw, rewrite.replacement)
            }),
            Locator::StyleText { .. } => update_text(handle, |css| {
                replace_matching(css, css_urls(css), raw, rewrite.replacement)
            }),
        };
        if changed {
            applied += 1;
        }
    }
    applied
}

fn replace_matching(
    value: &str,
    ranges: Vec<Range<usize>>,
    raw: &str,
    replacement: &str,
) -> Option<String> {
    let mut out = value.to_string();
    let mut changed = false;
    for range in ranges.into_iter().rev() {
        if &value[range.clone()] == raw {
            out.replace_range(range, replacement);
            changed = true;
        }
    }
    changed.then_some(out)
}

fn set_attr(handle: &Handle, name: &str, value: &str) -> bool {
    update_attr(handle, name, |_| Some(value.to_string()))
}

fn update_attr(handle: &Handle, name: &str, f: impl FnOnce(&str) -> Option<String>) -> bool {
    let NodeData::Element { ref attrs, .. } = handle.data else {
        return false;
    };
    let mut attrs = attrs.borrow_mut();
    let Some(attr) = attrs.iter_mut().find(|a| &*a.name.local == name) else {
        return false;
    };
    match f(&attr.value) {
        Some(new_value) if *attr.value != *new_value => {
            attr.value = StrTendril::from_slice(&new_value);
            true
        }
        _ => false,
    }
}

fn update_text(handle: &Handle, f: impl FnOnce(&str) -> Option<String>) -> bool {
    let NodeData::Text { ref contents } = handle.data else {
        return false;
    };
    let mut contents = contents.borrow_mut();
    match f(&contents) {
        Some(new_text) => {
            *contents = StrTendril::from_slice(&new_text);
            true
        }
        None => false,
    }
}

const UTF8_CHARSET: &str = "utf-8";
const UTF8_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Adds `charset`, `viewport` and `generator` meta tags at the top of `<head>`.
///
/// The output is always written as UTF-8, so any existing charset
/// declaration is rewritten to `utf-8`. An existing viewport is kept and an
/// existing generator is overwritten. Node ids are not valid after this call.
pub fn inject_metadata(doc: &mut HtmlDocument, generator: &str) {
    let Some(head) = doc.find_element("head") else {
        debug!("document has no <head>, skipping metadata");
        return;
    };

    let metas: Vec<Handle> = doc
        .nodes()
        .map(|(_, h)| h)
        .filter(|h| element_name(h) == Some("meta"))
        .cloned()
        .collect();
    let mut has_charset = false;
    for meta in &metas {
        if attr_value(meta, "charset").is_some() {
            set_attr(meta, "charset", UTF8_CHARSET);
            has_charset = true;
        }
        let content_type = attr_value(meta, "http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("content-type"));
        if content_type {
            set_attr(meta, "content", UTF8_CONTENT_TYPE);
            has_charset = true;
        }
    }
    let named = |name: &str| {
        metas.iter().find(|m| {
            attr_value(m, "name").is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
    };
    let has_viewport = named("viewport").is_some();
    let existing_generator = named("generator").cloned();

    let mut new_tags: Vec<Vec<(&str, &str)>> = Vec::new();
    if !has_charset {
        new_tags.push(vec![("charset", UTF8_CHARSET)]);
    }
    if !has_viewport {
        new_tags.push(vec![
            ("name", "viewport"),
            ("content", "width=device-width, initial-scale=1"),
        ]);
    }
    match existing_generator {
        Some(meta) => {
            set_attr(&meta, "content", generator);
        }
        None => new_tags.push(vec![("name", "generator"), ("content", generator)]),
    }

    let first_child = head.children.borrow().first().cloned();
    let dom = doc.dom_mut();
    for attrs in new_tags {
        let meta = dom.create_element(
            html_name("meta"),
            attrs
                .into_iter()
                .map(|(name, value)| Attribute {
                    name: QualName::new(None, Namespace::from(""), LocalName::from(name)),
                    value: StrTendril::from_slice(value),
                })
                .collect(),
            ElementFlags::default(),
        );
        match &first_child {
            Some(sibling) => dom.append_before_sibling(sibling, NodeOrText::AppendNode(meta)),
            None => dom.append(&head, NodeOrText::AppendNode(meta)),
        }
    }
}

fn html_name(local: &str) -> QualName {
    QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html_parser::scan;

    fn rewrite_all(html: &str, mapping: &[(&str, &str)]) -> String {
        let doc = HtmlDocument::parse(html);
        let outcome = scan(&doc);
        let rewrites: Vec<Rewrite<'_>> = outcome
            .references
            .iter()
            .filter_map(|reference| {
                mapping
                    .iter()
                    .find(|(raw, _)| *raw == reference.raw_value)
                    .map(|&(_, replacement)| Rewrite {
                        reference,
                        replacement,
                    })
            })
            .collect();
        apply_rewrites(&doc, &rewrites);
        doc.to_html().unwrap()
    }

    #[test]
    fn test_plain_attributes_are_replaced_whole() {
        let html = rewrite_all(
            r#"<link rel="stylesheet" href="/s.css"><script src="app.js"></script>"#,
            &[("/s.css", "resources/css/s.css"), ("app.js", "resources/js/app.js")],
        );
        assert!(html.contains(r#"href="resources/css/s.css""#));
        assert!(html.contains(r#"src="resources/js/app.js""#));
    }

    #[test]
    fn test_srcset_only_resolved_candidate_changes() {
        let html = rewrite_all(
            r#"<img srcset="a.png 1x, b.png 2x">"#,
            &[("a.png", "resources/images/a.png")],
        );
        assert!(html.contains(r#"srcset="resources/images/a.png 1x, b.png 2x""#), "{html}");
    }

    #[test]
    fn test_inline_style_keeps_surrounding_text() {
        let html = rewrite_all(
            r#"<div style="color: red; background: url('/bg.png') no-repeat"></div>"#,
            &[("/bg.png", "resources/images/bg.png")],
        );
        assert!(
            html.contains(r#"style="color: red; background: url('resources/images/bg.png') no-repeat""#),
            "{html}"
        );
    }

    #[test]
    fn test_style_element_text_is_rewritten() {
        let html = rewrite_all(
            "<style>h1 { background: url(/h.png) } p { background: url(/p.png) }</style>",
            &[("/p.png", "resources/images/p.png")],
        );
        assert!(html.contains("url(/h.png)"));
        assert!(html.contains("url(resources/images/p.png)"));
    }

    #[test]
    fn test_svg_style_text_is_rewritten_past_element_children() {
        let html = rewrite_all(
            "<svg><style><g></g>.a { fill: url(/paint.png) }</style></svg>",
            &[("/paint.png", "resources/images/paint.png")],
        );
        assert!(html.contains("url(resources/images/paint.png)"));
        assert!(!html.contains("url(/paint.png)"));
    }

    #[test]
    fn test_unmapped_references_are_untouched() {
        let source = r#"<img src="/keep.png">"#;
        let html = rewrite_all(source, &[]);
        assert!(html.contains(r#"src="/keep.png""#));
    }

    #[test]
    fn test_inject_metadata_adds_missing_tags_first_in_head() {
        let mut doc = HtmlDocument::parse("<html><head><title>t</title></head><body></body></html>");
        inject_metadata(&mut doc, "page-mirror");
        let html = doc.to_html().unwrap();

        let charset = html.find(r#"<meta charset="utf-8">"#).unwrap();
        let viewport = html.find(r#"name="viewport""#).unwrap();
        let generator = html.find(r#"<meta name="generator" content="page-mirror">"#).unwrap();
        let title = html.find("<title>").unwrap();
        assert!(charset < viewport && viewport < generator && generator < title);
    }

    #[test]
    fn test_inject_metadata_respects_existing_tags() {
        let mut doc = HtmlDocument::parse(
            r#"<head><meta charset="iso-8859-1"><meta name="generator" content="WordPress"></head>"#,
        );
        inject_metadata(&mut doc, "page-mirror");
        let html = doc.to_html().unwrap();

        assert_eq!(html.matches("charset=").count(), 1);
        assert!(html.contains(r#"charset="utf-8""#));
        assert!(!html.contains("iso-8859-1"));
        assert!(html.contains(r#"content="page-mirror""#));
        assert!(!html.contains("WordPress"));
    }

    #[test]
    fn test_inject_metadata_rewrites_http_equiv_content_type() {
        let mut doc = HtmlDocument::parse(
            r#"<head><meta http-equiv="Content-Type" content="text/html; charset=gb2312"><title>t</title></head>"#,
        );
        inject_metadata(&mut doc, "page-mirror");
        let html = doc.to_html().unwrap();

        assert!(html.contains(r#"content="text/html; charset=utf-8""#));
        assert!(!html.contains("gb2312"));
        assert!(!html.contains(r#"<meta charset="#));
    }
}
