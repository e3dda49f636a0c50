//! Human-readable summaries of failed responses from the sync server.

use reqwest::StatusCode;
use serde::Deserialize;

// Server bodies can be whole HTML error pages
const MAX_BODY_CHARS: usize = 180;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Summarize a non-success response for logs and `Error::Network`.
///
/// Prefers the `message`/`error` field of a JSON body, else the start of
/// the raw body, else the bare status.
pub fn describe_failure(status: StatusCode, body: &str) -> String {
    let code = status.as_u16();
    if let Ok(ErrorBody { error, message }) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(reason) = message.or(error) {
            return format!("{} ({code})", reason.trim());
        }
    }

    let excerpt: String = body.trim().chars().take(MAX_BODY_CHARS).collect();
    if excerpt.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("{excerpt} ({code})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_json_reason() {
        assert_eq!(
            describe_failure(StatusCode::BAD_REQUEST, r#"{"error":"Missing timestamp"}"#),
            "Missing timestamp (400)"
        );
        assert_eq!(
            describe_failure(StatusCode::CONFLICT, r#"{"message":" stale ","error":"x"}"#),
            "stale (409)"
        );
    }

    #[test]
    fn falls_back_to_status_or_excerpt() {
        assert_eq!(describe_failure(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");

        let page = format!("<html>{}</html>", "x".repeat(400));
        let described = describe_failure(StatusCode::SERVICE_UNAVAILABLE, &page);
        assert!(described.ends_with(" (503)"));
        assert_eq!(described.chars().count(), MAX_BODY_CHARS + " (503)".len());
    }
}
