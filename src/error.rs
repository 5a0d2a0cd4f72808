//! Error types for pubsub-rpc.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Protocol metadata that could not be interpreted.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// No reply arrived within the allotted time.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Nobody subscribed to the channel before the wait elapsed.
    #[error("No subscribers on channel '{0}'")]
    NoSubscribers(String),

    /// The remote service answered with a typed failure.
    #[error("Remote error ({code}): {message}")]
    Remote {
        /// Failure code carried in the reply metadata.
        code: String,
        /// Human readable description from the reply payload.
        message: String,
    },

    /// Protobuf decode error.
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// No decoder is registered for a type tag.
    #[error("Unknown payload type '{0}'")]
    UnknownType(String),

    /// A payload carried a different type tag than the one expected.
    #[error("Expected payload type '{expected}', got '{actual}'")]
    TypeMismatch {
        /// Tag the caller asked for.
        expected: String,
        /// Tag found on the message.
        actual: String,
    },

    /// Transport level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The component was shut down.
    #[error("Closed")]
    Closed,
}

impl Error {
    /// Create a malformed-input error.
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
