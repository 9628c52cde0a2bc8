//! Page-metadata extraction: title, description, icon and JSON-LD blocks,
//! each with a fixed fallback ladder.

use scraper::{ElementRef, Html, Selector};
use url::Url;
use urlcast_core::PageMetadata;

pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Collapse a string to a single line: trim, turn CR/LF/TAB/VT/FF into
/// spaces, squeeze space runs down to one.
pub fn flatten(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for ch in s.trim().chars() {
        let ch = match ch {
            '\r' | '\n' | '\t' | '\u{0b}' | '\u{0c}' => ' ',
            c => c,
        };
        if ch == ' ' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out
}

/// Extract metadata from decoded HTML. `base_url` anchors relative icon
/// references and supplies the `/favicon.ico` default.
pub fn extract(html: &str, base_url: &Url) -> PageMetadata {
    let doc = Html::parse_document(html);

    let title = extract_title(&doc).map(|t| flatten(&t)).filter(|t| !t.is_empty());
    let description = extract_description(&doc, title.as_deref());
    let icon = extract_icon(&doc, base_url);
    let jsonlds = extract_jsonlds(&doc);

    PageMetadata {
        title,
        description,
        icon,
        jsonlds,
    }
}

fn select_first<'a>(doc: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(css).ok()?;
    doc.select(&sel).next()
}

fn first_attr(doc: &Html, css: &str, attr: &str) -> Option<String> {
    select_first(doc, css)
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.to_string())
}

fn extract_title(doc: &Html) -> Option<String> {
    if let Some(el) = select_first(doc, "title") {
        let text: String = el.text().collect();
        if !text.trim().is_empty() {
            return Some(text);
        }
    }
    first_attr(doc, r#"meta[property="og:title"]"#, "content").filter(|t| !t.trim().is_empty())
}

fn extract_description(doc: &Html, title: Option<&str>) -> Option<String> {
    let mut description = first_attr(doc, r#"meta[name="description"]"#, "content")
        .filter(|d| !d.is_empty())
        // A description that just repeats the title adds nothing.
        .filter(|d| Some(flatten(d).as_str()) != title);

    if description.is_none() {
        description = joined_attr(doc, r#"meta[property="og:description"]"#, "content");
    }
    if description.is_none() {
        description = select_first(doc, r#"body [class="content"]"#).map(leaf_text);
        description = description.filter(|d| !d.is_empty());
    }
    if description.is_none() {
        description = select_first(doc, r#"body [id="content"]"#).map(leaf_text);
        description = description.filter(|d| !d.is_empty());
    }
    if description.is_none() {
        description = select_first(doc, "body").map(leaf_text);
        description = description.filter(|d| !d.is_empty());
    }

    description
        .map(|d| flatten(&d))
        .filter(|d| !d.is_empty())
        .map(|d| {
            if d.chars().count() > MAX_DESCRIPTION_CHARS {
                d.chars().take(MAX_DESCRIPTION_CHARS).collect()
            } else {
                d
            }
        })
}

/// Concatenate the attribute values of every match, space-separated.
fn joined_attr(doc: &Html, css: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    let joined = doc
        .select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Text of leaf descendant elements (no element children), script and style
/// excluded. Text nodes are joined with single spaces.
fn leaf_text(root: ElementRef) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        if node.id() == root.id() {
            continue;
        }
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        let name = el.value().name();
        if name == "script" || name == "style" {
            continue;
        }
        if el.children().any(|c| c.value().is_element()) {
            continue;
        }
        for t in el.text() {
            parts.push(t);
        }
    }
    parts.join(" ")
}

const ICON_LINK_RELS: [&str; 4] = [
    "shortcut icon",
    "icon",
    "apple-touch-icon-precomposed",
    "apple-touch-icon",
];

fn extract_icon(doc: &Html, base_url: &Url) -> Option<String> {
    let mut raw = None;
    for rel in ICON_LINK_RELS {
        raw = first_attr(doc, &format!(r#"link[rel="{rel}"]"#), "href");
        if raw.is_some() {
            break;
        }
    }
    if raw.is_none() {
        raw = first_attr(doc, r#"meta[property="og:image"]"#, "content");
    }

    raw.and_then(|r| {
        let r = r.strip_prefix("./").unwrap_or(&r);
        base_url.join(r).ok().map(|u| u.to_string())
    })
    .or_else(|| base_url.join("/favicon.ico").ok().map(|u| u.to_string()))
}

fn extract_jsonlds(doc: &Html) -> Vec<serde_json::Value> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        let text: String = el.text().collect();
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed json-ld block");
            }
        }
    }
    out
}
