use std::sync::Arc;

/// Result type used throughout the crate.
///
/// A standard Rust `Result` whose error variant is the crate-wide [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors surfaced by synchronization and reporting.
///
/// No error is fatal: every failure leaves prior good state untouched (old flags retained,
/// queued events retained) and the system remains eligible for the next scheduled attempt.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted while the component was offline.
    #[error("operation attempted while offline")]
    Offline,

    /// A message body was missing or failed to parse. Carries the raw payload when one was
    /// received.
    #[error("malformed or missing message body")]
    Data(Option<Vec<u8>>),

    /// The server responded with a non-success HTTP status.
    #[error("unexpected response status {status}")]
    Response {
        /// HTTP status code of the response.
        status: u16,
    },

    /// Connection-level transport failure.
    #[error(transparent)]
    Request(Arc<dyn std::error::Error + Send + Sync>),

    /// The push stream delivered an explicit error message.
    #[error("stream reported an error: {message}")]
    Event {
        /// Raw message carried by the stream error.
        message: String,
        /// HTTP status associated with the error, when the stream reported one.
        status: Option<u16>,
    },

    /// The push stream delivered a named message this client does not understand.
    #[error("unknown stream event type {0:?}")]
    UnknownEventType(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// An I/O error (e.g., a background thread failed to start).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Whether this error indicates the SDK key was rejected by the server. Unauthorized errors
    /// are terminal: the caller should stop retrying and surface the condition.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::Response { status } => *status == 401,
            Error::Event { status, .. } => *status == Some(401),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Request(Arc::new(value.without_url()))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn unauthorized_detection() {
        assert!(Error::Response { status: 401 }.is_unauthorized());
        assert!(Error::Event {
            message: "bad key".to_owned(),
            status: Some(401)
        }
        .is_unauthorized());

        assert!(!Error::Response { status: 500 }.is_unauthorized());
        assert!(!Error::Event {
            message: "oops".to_owned(),
            status: None
        }
        .is_unauthorized());
        assert!(!Error::Offline.is_unauthorized());
    }
}
