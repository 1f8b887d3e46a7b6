use crate::shape::Shape;

/// All errors that can occur within syncbn.
///
/// Validation errors (rank, device, channel count, sample count) are raised
/// locally, before any collective operation is issued. Transport errors are
/// propagated unchanged and never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Normalization needs at least a batch and a channel dimension.
    #[error("expected at least 2D input (got {got}D input)")]
    InvalidInputRank { got: usize },

    /// The input does not live on the device the communicator operates on.
    #[error("expected input on device {expected}, got {got}")]
    NotOnExpectedDevice { expected: String, got: String },

    /// Per-channel variance is undefined for a single sample.
    #[error("expected more than 1 value per channel when training, got input size {size}")]
    InsufficientSamples { size: usize },

    /// A collective operation failed inside the transport.
    #[error("collective '{name}' failed: {reason}")]
    TransportFailure { name: String, reason: String },

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Input channel count differs from the module's feature count.
    #[error("channel mismatch: expected {expected} channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a transport error for the collective named `name`.
    pub fn transport(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TransportFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout syncbn.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
