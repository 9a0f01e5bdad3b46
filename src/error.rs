//! Crate-level error type.

use thiserror::Error;

/// Warning glyph prefixed to every user-visible failure bubble.
pub const WARNING_GLYPH: &str = "⚠️";

/// Errors surfaced by the query client, the socket client and configuration.
///
/// Each variant carries enough context to diagnose the failure without
/// needing to inspect the originating error directly.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The request never produced a response (DNS, refused, reset, timeout).
    #[error("connection failed to {url}: {detail}")]
    Transport { url: String, detail: String },

    /// The server replied with a non-2xx status code.
    #[error("HTTP {status} from {url}")]
    Http {
        status: u16,
        url: String,
        /// `error` or `detail` field from the response body, when present.
        detail: Option<String>,
    },

    #[error("unauthorized request to {url}")]
    Unauthorized { url: String },

    /// A body or frame could not be parsed as the expected JSON shape.
    #[error("could not decode {context}: {detail}")]
    Decode { context: String, detail: String },

    /// The backend answered but reported `success: false`.
    #[error("{0}")]
    Application(String),

    #[error("WebSocket is not connected")]
    NotConnected,

    /// The socket gave up after the configured number of reconnect attempts.
    #[error("WebSocket disconnected permanently after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Text for the assistant bubble that replaces a failed answer.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Http {
                detail: Some(detail),
                ..
            } if !detail.trim().is_empty() => format!("{WARNING_GLYPH} {detail}"),
            ChatError::Http { status, .. } => {
                format!("{WARNING_GLYPH} Sorry, the query failed. Status: {status}")
            }
            ChatError::Transport { .. } => format!(
                "{WARNING_GLYPH} Could not reach the API server. Check the network connection or confirm the service is running."
            ),
            ChatError::Application(e) if e.trim().is_empty() => {
                format!("{WARNING_GLYPH} Invalid response from API")
            }
            other => format!("{WARNING_GLYPH} {other}"),
        }
    }

    /// True for failures that happened below the application layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Transport { .. } | ChatError::NotConnected | ChatError::ReconnectExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_with_detail_uses_detail() {
        let e = ChatError::Http {
            status: 500,
            url: "http://x/query".into(),
            detail: Some("database offline".into()),
        };
        assert_eq!(e.user_message(), "⚠️ database offline");
    }

    #[test]
    fn http_without_detail_reports_status() {
        let e = ChatError::Http {
            status: 502,
            url: "http://x/query".into(),
            detail: None,
        };
        assert_eq!(e.user_message(), "⚠️ Sorry, the query failed. Status: 502");
    }

    #[test]
    fn http_blank_detail_falls_back_to_status() {
        let e = ChatError::Http {
            status: 400,
            url: "u".into(),
            detail: Some("  ".into()),
        };
        assert!(e.user_message().ends_with("Status: 400"));
    }

    #[test]
    fn transport_message_mentions_server() {
        let e = ChatError::Transport {
            url: "http://localhost:8000".into(),
            detail: "refused".into(),
        };
        assert!(e.user_message().starts_with(WARNING_GLYPH));
        assert!(e.user_message().contains("Could not reach the API server"));
        assert!(e.is_transport());
    }

    #[test]
    fn application_error_passes_text_through() {
        let e = ChatError::Application("stock code not found".into());
        assert_eq!(e.user_message(), "⚠️ stock code not found");
        assert!(!e.is_transport());
    }

    #[test]
    fn empty_application_error_has_fallback() {
        let e = ChatError::Application(String::new());
        assert_eq!(e.user_message(), "⚠️ Invalid response from API");
    }

    #[test]
    fn every_message_starts_with_glyph() {
        let all = [
            ChatError::NotConnected,
            ChatError::ReconnectExhausted { attempts: 5 },
            ChatError::Config("bad".into()),
            ChatError::Unauthorized { url: "u".into() },
            ChatError::Decode {
                context: "body".into(),
                detail: "eof".into(),
            },
        ];
        for e in all {
            assert!(e.user_message().starts_with(WARNING_GLYPH), "{e:?}");
        }
    }
}
