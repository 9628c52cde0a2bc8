//! Character-encoding detection for fetched HTML bodies.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use scraper::{Html, Selector};

/// Decide the charset of an HTML byte stream. First match wins:
///
/// 1. the bytes decode as UTF-8 without error;
/// 2. a `<meta http-equiv="Content-Type">` charset parameter, read from a
///    provisional latin-1 parse;
/// 3. a `<meta charset="...">` attribute;
/// 4. latin-1.
///
/// "latin-1" resolves to windows-1252, the WHATWG superset that iso-8859-1
/// labels map to.
pub fn detect(bytes: &[u8]) -> &'static Encoding {
    if std::str::from_utf8(bytes).is_ok() {
        return UTF_8;
    }

    // Latin-1 decoding never fails, so declared charsets stay readable even
    // when the body itself is not.
    let (provisional, _, _) = WINDOWS_1252.decode(bytes);
    let doc = Html::parse_document(&provisional);

    if let Ok(sel) = Selector::parse("head meta[http-equiv]") {
        for el in doc.select(&sel) {
            let is_content_type = el
                .value()
                .attr("http-equiv")
                .map(|v| v.trim().eq_ignore_ascii_case("content-type"))
                .unwrap_or(false);
            if !is_content_type {
                continue;
            }
            if let Some(label) = el.value().attr("content").and_then(charset_param) {
                if let Some(enc) = Encoding::for_label(label.as_bytes()) {
                    return enc;
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("head meta[charset]") {
        for el in doc.select(&sel) {
            if let Some(label) = el.value().attr("charset") {
                if let Some(enc) = Encoding::for_label(label.trim().as_bytes()) {
                    return enc;
                }
            }
        }
    }

    WINDOWS_1252
}

/// Detect and decode in one step.
pub fn decode(bytes: &[u8]) -> String {
    let (text, _, _) = detect(bytes).decode(bytes);
    text.into_owned()
}

/// Pull the `charset` parameter out of a Content-Type value like
/// `text/html; charset=Shift_JIS`.
fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let v = v.trim().trim_matches('"').trim_matches('\'').trim();
        if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    })
}
