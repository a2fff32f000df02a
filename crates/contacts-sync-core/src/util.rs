//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};

use reqwest::StatusCode;
use serde::Deserialize;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Stable, non-reversible tag for an owner identifier in log lines.
pub fn owner_fingerprint(owner_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    owner_id.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorField>,
    error_description: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiErrorField {
    Text(String),
    Detailed { message: Option<String> },
}

/// Render an HTTP error body into a short message with the status code.
///
/// Understands the OAuth (`error`/`error_description`), Google API
/// (`error.message`) and registry (`message`) error shapes.
pub fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        let nested = payload.error.and_then(|field| match field {
            ApiErrorField::Text(text) => Some(text),
            ApiErrorField::Detailed { message } => message,
        });
        if let Some(message) = payload.error_description.or(payload.message).or(nested) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn owner_fingerprint_is_stable() {
        assert_eq!(owner_fingerprint("owner-a"), owner_fingerprint("owner-a"));
        assert_ne!(owner_fingerprint("owner-a"), owner_fingerprint("owner-b"));
    }

    #[test]
    fn parse_api_error_prefers_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#;
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, body),
            "Token has been expired or revoked. (400)"
        );
    }

    #[test]
    fn parse_api_error_reads_google_nested_message() {
        let body = r#"{"error":{"code":410,"message":"Sync token is expired.","status":"FAILED_PRECONDITION"}}"#;
        assert_eq!(
            parse_api_error(StatusCode::GONE, body),
            "Sync token is expired. (410)"
        );
    }

    #[test]
    fn parse_api_error_falls_back_to_status() {
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
    }
}
