use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    Protocol(String),

    #[error("Invalid PROXY header: {0}")]
    ProxyHeader(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PostError>;

/// Error returned by a [`MailHandler`](crate::smtp::MailHandler) callback.
///
/// The code is optional; each call site picks its own default (550 for
/// envelope commands, 535 for authentication, 450 for message data, 554 for
/// connection admission).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct Rejection {
    pub code: Option<u16>,
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Response code to send, falling back to `default` when the handler
    /// did not pick one.
    pub fn code_or(&self, default: u16) -> u16 {
        self.code.unwrap_or(default)
    }
}
