//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the engine
///
/// Clone is required so a de-duplicated fetch can hand the same failure
/// to every co-waiter; IO errors are carried as their message for that
/// reason.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Caller error: empty key, missing callback. Fails fast, no I/O attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Non-success response from the fetch source.
    #[error("transport error: status {status} for `{key}`")]
    Transport { key: String, status: u16 },

    /// Cooperative cancellation. Not a failure; never logged as one.
    #[error("cancelled")]
    Cancelled,

    /// Malformed payload that could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The runtime does not support the requested codec; the caller
    /// must retry with the uncompressed variant.
    #[error("codec `{0}` not supported by this runtime")]
    UnsupportedCodec(&'static str),

    /// The background worker died; pending jobs carry this error.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// True for cancellation, which callers suppress rather than report.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_a_failure() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::InvalidArgument("key").is_cancelled());
        assert!(
            !Error::Transport {
                key: "chunks/0_0.jsonl".into(),
                status: 404
            }
            .is_cancelled()
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_errors_clone_for_dedup_fanout() {
        let err = Error::Transport {
            key: "assets/x.jsonl".into(),
            status: 500,
        };
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
    }
}
