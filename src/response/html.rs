//! HTML responses where JSON was expected.
//!
//! Geo-blocking, WAF challenges and maintenance pages usually come back as
//! HTML, sometimes with a 200 status. They are always errors.

use crate::error::{ErrorKind, NormalizedError};

const PREVIEW_CHARS: usize = 200;

/// Whether the response is an HTML page.
pub fn is_html(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html")) {
        return true;
    }
    let head: String = body
        .trim_start()
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    ["<!doctype", "<html", "<head", "<body"]
        .iter()
        .any(|tag| head.starts_with(tag))
}

/// Text of the first `<title>` element.
pub fn title(body: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let text = collapse_whitespace(&body[start..end]);
    (!text.is_empty()).then_some(text)
}

/// A short, whitespace-collapsed prefix of the body.
pub fn preview(body: &str) -> String {
    collapse_whitespace(body).chars().take(PREVIEW_CHARS).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Likely causes, most specific first.
pub fn hints(status: u16, body: &str) -> Vec<String> {
    let lower = body.to_ascii_lowercase();
    let mut hints = Vec::new();
    if status == 451 || status == 403 || lower.contains("restricted") || lower.contains("not available in your") {
        hints.push("The exchange may be blocking requests from this region or IP address.".to_string());
    }
    if lower.contains("cloudflare") || lower.contains("cf-ray") || lower.contains("captcha") {
        hints.push("A CDN or WAF challenge intercepted the request.".to_string());
    }
    if lower.contains("maintenance") {
        hints.push("The exchange may be under maintenance.".to_string());
    }
    if hints.is_empty() {
        hints.push("An HTML page was returned instead of an API response; check the base URL.".to_string());
    }
    hints
}

/// Build the `AccessRestricted` error for an HTML response.
pub fn access_restricted(exchange: &str, status: u16, body: &str) -> NormalizedError {
    let title = title(body);
    let message = match &title {
        Some(title) => format!("HTTP {status}: received HTML page \"{title}\""),
        None => format!("HTTP {status}: received HTML page"),
    };
    NormalizedError::new(
        exchange,
        ErrorKind::AccessRestricted {
            title,
            body_preview: preview(body),
            hints: hints(status, body),
        },
        message,
    )
}
