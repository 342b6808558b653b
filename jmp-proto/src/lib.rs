pub mod auth;
pub mod framing;
pub mod messages;
pub mod stream;

pub use auth::*;
pub use framing::*;
pub use messages::*;
pub use stream::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("no open connection")]
    NotConnected,

    #[error("host is not configured")]
    NotConfigured,

    #[error("TLS upgrade failed: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
