//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    /// For starter, to remove as code matures.
    #[error("Static error: {0}")]
    Static(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Indicates that the Id bytes are not exactly 20 bytes long.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    /// A key was not a 40 character hex string.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// No response arrived before the request timeout elapsed.
    #[error("Request timed out")]
    Timeout,

    /// The transport was shut down while the request was pending.
    #[error("Transport closed")]
    TransportClosed,

    #[error("Failed to parse packet bytes: {0}")]
    Decode(#[from] serde_json::Error),
}
