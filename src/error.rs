//! Error taxonomy shared by connectors, the registry, and the HTTP layer.
//!
//! Connector-facing failures are typed so the HTTP layer can map them onto
//! the right status codes; everything infrastructural travels as
//! [`anyhow::Error`] and surfaces as an opaque internal error.

use thiserror::Error;

/// Errors raised by connector code and the source lifecycle.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The submitted configuration is rejected. The source row must not be
    /// created. Surfaced verbatim to the user.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An expected operational failure whose message is safe to show the
    /// user as-is (HTTP 501 on the wire).
    #[error("{0}")]
    Known(String),

    /// Upstream hiccup (network error, 429, 5xx). Retried by the connector
    /// first; a task that still fails is re-queued by the worker until its
    /// attempt budget runs out.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// A task named a method the connector never declared.
    #[error("unknown task method: {0}")]
    UnknownMethod(String),

    /// Anything else; logged with its chain and reported opaquely.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        ConnectorError::Transient(err.to_string())
    }
}

impl From<sqlx::Error> for ConnectorError {
    fn from(err: sqlx::Error) -> Self {
        ConnectorError::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_message_passes_through() {
        let err = ConnectorError::Known("token not yet propagated".to_string());
        assert_eq!(err.to_string(), "token not yet propagated");
    }

    #[test]
    fn test_invalid_config_is_prefixed() {
        let err = ConnectorError::InvalidConfig("url is required".to_string());
        assert!(err.to_string().contains("invalid configuration"));
    }
}
