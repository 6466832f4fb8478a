//! Text and timestamp normalization shared by the adapters

use regex::Regex;
use scraper::Html;
use std::sync::LazyLock;
use tracing::warn;

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static BLOCK_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(p|div|li|h[1-6])>").expect("valid regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(\s*\n)+").expect("valid regex"));

/// Render an HTML fragment as plain text
///
/// `<br>` becomes a newline and closing block tags a blank line; entities
/// are decoded and runs of blank lines collapse to one.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return html.trim().to_string();
    }

    let with_breaks = LINE_BREAK.replace_all(html, "\n");
    let with_blocks = BLOCK_END.replace_all(&with_breaks, "$0\n\n");

    let fragment = Html::parse_fragment(&with_blocks);
    let text: String = fragment.root_element().text().collect();

    BLANK_LINES
        .replace_all(text.trim(), "\n\n")
        .trim()
        .to_string()
}

/// `title`, then a blank line and `body` when there is one
pub fn compose_content(title: &str, body: &str) -> String {
    let title = title.trim();
    let body = body.trim();
    match (title.is_empty(), body.is_empty()) {
        (_, true) => title.to_string(),
        (true, false) => body.to_string(),
        (false, false) => format!("{}\n\n{}", title, body),
    }
}

/// Append ` #tag` for every tag, with inner spaces turned into underscores
pub fn append_hashtags<S: AsRef<str>>(content: &str, tags: &[S]) -> String {
    let mut out = content.to_string();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            continue;
        }
        out.push_str(" #");
        out.push_str(&tag.replace(' ', "_"));
    }
    out
}

/// Keep the first `max_chars` characters, marking the cut with "..."
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...", head)
}

/// Last non-empty path segment of a URL
pub fn slug_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// Parse a timestamp as RFC 3339, then each chrono format in turn
///
/// Formats without an offset are read as UTC; date-only formats as midnight.
pub fn parse_timestamp(value: &str, formats: &[&str]) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }

    for format in formats {
        if let Ok(dt) = chrono::DateTime::parse_from_str(value, format) {
            return Some(dt.timestamp());
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc().timestamp());
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
        }
    }

    None
}

/// [`parse_timestamp`], falling back to the current time
pub fn timestamp_or_now(value: &str, formats: &[&str]) -> i64 {
    parse_timestamp(value, formats).unwrap_or_else(|| {
        warn!(value, "Unparseable timestamp, using current time");
        chrono::Utc::now().timestamp()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("plain text"), "plain text");
        assert_eq!(
            strip_html("<p>Hello &amp; <b>welcome</b></p><p>Second</p>"),
            "Hello & welcome\n\nSecond"
        );
        assert_eq!(strip_html("line one<br>line two<br />three"), "line one\nline two\nthree");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn test_compose_content() {
        assert_eq!(compose_content("Title", "Body"), "Title\n\nBody");
        assert_eq!(compose_content("Title", "  "), "Title");
        assert_eq!(compose_content("", "Body"), "Body");
    }

    #[test]
    fn test_append_hashtags() {
        assert_eq!(
            append_hashtags("Art", &["digital art", "fox", ""]),
            "Art #digital_art #fox"
        );
        let none: [&str; 0] = [];
        assert_eq!(append_hashtags("Art", &none), "Art");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 97), "short");
        let long = "a".repeat(120);
        let cut = truncate_with_ellipsis(&long, 97);
        assert_eq!(cut.len(), 100);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_with_ellipsis("ééééé", 2), "éé...");
    }

    #[test]
    fn test_slug_from_url() {
        assert_eq!(
            slug_from_url("https://www.deviantart.com/artist/art/Some-Piece-123456").as_deref(),
            Some("Some-Piece-123456")
        );
        assert_eq!(
            slug_from_url("https://example.com/a/b/").as_deref(),
            Some("b")
        );
        assert_eq!(slug_from_url("not a url"), None);
        assert_eq!(slug_from_url("https://example.com/"), None);
    }

    #[test]
    fn test_parse_timestamp_chain() {
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z", &[]), Some(1704164645));
        assert_eq!(
            parse_timestamp("2024-01-02T03:04:05+0000", &["%Y-%m-%dT%H:%M:%S%z"]),
            Some(1704164645)
        );
        assert_eq!(
            parse_timestamp("Jan 2, 2024 03:04:05 AM", &["%b %e, %Y %I:%M:%S %p"]),
            Some(1704164645)
        );
        assert_eq!(parse_timestamp("2024-01-02", &["%Y-%m-%d"]), Some(1704153600));
        assert_eq!(parse_timestamp("yesterday", &["%Y-%m-%d"]), None);
    }

    #[test]
    fn test_timestamp_or_now_falls_back() {
        let before = chrono::Utc::now().timestamp();
        let ts = timestamp_or_now("garbage", &[]);
        assert!(ts >= before);
    }
}
