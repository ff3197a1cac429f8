/// Error types surfaced while setting up a shuffle round
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShuffleError {
    /// Invalid parameter provided (e.g., zero pool amount, dust-sized fixed amount)
    InvalidParameter(String),
    /// An address hook was not supplied or failed to produce an address
    Hook(String),
    /// An address could not be parsed or belongs to another network
    Address(String),
    /// A key could not be parsed or derived
    Key(String),
    /// Serialization/deserialization error
    SerializationError(String),
    /// Filesystem error while writing diagnostics
    Io(String),
}

impl fmt::Display for ShuffleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShuffleError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ShuffleError::Hook(msg) => write!(f, "Address hook error: {}", msg),
            ShuffleError::Address(msg) => write!(f, "Address error: {}", msg),
            ShuffleError::Key(msg) => write!(f, "Key error: {}", msg),
            ShuffleError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            ShuffleError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ShuffleError {}

impl From<bitcoin::secp256k1::Error> for ShuffleError {
    fn from(err: bitcoin::secp256k1::Error) -> Self {
        ShuffleError::Key(err.to_string())
    }
}

impl From<serde_json::Error> for ShuffleError {
    fn from(err: serde_json::Error) -> Self {
        ShuffleError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ShuffleError {
    fn from(err: std::io::Error) -> Self {
        ShuffleError::Io(err.to_string())
    }
}
