use std::io::Cursor;

/// Convert HTML to readable plain text.
///
/// Deterministic and "good enough"; not a readability engine. Callers bound the output.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

/// Best-effort page title: `<title>`, then the first `<h1>`.
pub fn html_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    for sel in ["title", "h1"] {
        let Ok(selector) = html_scraper::Selector::parse(sel) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            let t = norm_ws(&el.text().collect::<String>());
            if !t.is_empty() {
                return Some(t);
            }
        }
    }
    None
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse runs of blank lines and trim trailing whitespace per line.
pub fn tidy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("html") {
            return true;
        }
        if ct.starts_with("text/") || ct.contains("json") || ct.contains("markdown") {
            return false;
        }
    }
    let head: String = body.chars().take(512).collect::<String>().to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype html")
}

fn is_textual(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("markdown")
        }
    }
}

/// Extract `(title, text)` from a response body.
///
/// Errors are short stable codes so callers can log them without new enums.
pub fn extract_page(
    content_type: Option<&str>,
    bytes: &[u8],
    width: usize,
) -> Result<(Option<String>, String), &'static str> {
    if !is_textual(content_type) {
        return Err("unsupported_content_type");
    }
    let body = String::from_utf8_lossy(bytes);
    let (title, text) = if looks_like_html(content_type, &body) {
        (html_title(&body), tidy_text(&html_to_text(&body, width)))
    } else {
        (None, tidy_text(&body))
    };
    if text.is_empty() {
        return Err("empty_extraction");
    }
    Ok((title, text))
}
