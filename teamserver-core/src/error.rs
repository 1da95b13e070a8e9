//! Error taxonomy shared by every teamserver crate.
//!
//! Library boundaries return [`Result`]; internal codec helpers keep using
//! `anyhow` and are folded into [`Error::Transport`] when they cross a
//! public API.

use thiserror::Error;

/// Errors surfaced by the teamserver connection layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing, ambiguous or invalid connection descriptor / configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authority or leaf certificate generation, parsing or persistence failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The call could not be authenticated. The message never says why.
    #[error("authentication failed")]
    Authentication,

    /// A listener could not be bound or served.
    #[error("listener error: {0}")]
    Listener(String),

    /// Unknown job ID, user or certificate.
    #[error("{0} not found")]
    NotFound(String),

    /// A transport handler was driven out of order.
    #[error("invalid state: cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Server initialization failed; every caller sees the same failure.
    #[error("server initialization failed: {0}")]
    Init(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The remote side answered a call with an error frame.
    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an `anyhow` chain coming out of the wire/transport helpers.
    pub fn transport(err: &anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_error_does_not_leak_details() {
        assert_eq!(Error::Authentication.to_string(), "authentication failed");
    }

    #[test]
    fn invalid_state_names_operation_and_state() {
        let err = Error::InvalidState {
            op: "serve",
            state: "initialized".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state: cannot serve while initialized"
        );
    }

    #[test]
    fn transport_keeps_context_chain() {
        let inner = anyhow::anyhow!("connection reset").context("failed to read frame");
        let err = Error::transport(&inner);
        assert!(err.to_string().contains("failed to read frame"));
        assert!(err.to_string().contains("connection reset"));
    }
}
