//! Error taxonomy for the protocol stack.
//!
//! Fatal errors (malformed bytes, transport failures) tear the connection
//! down and fail every pending operation; the rest leave the connection
//! usable and only fail the operation that hit them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bytes on the wire: bad length field, unknown message type,
    /// count exceeding the remaining payload. Always fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer answered a request with Rerror.
    #[error("remote error: {0}")]
    Remote(String),

    /// A walk stopped before the end of the path. Carries the first
    /// path element that could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Replies that are well-formed on the wire but impossible for the
    /// state we are in: wrong reply type for the request, short write,
    /// more data returned than asked for.
    #[error("inconsistent reply: {0}")]
    Consistency(String),

    /// Caller misuse: binding a fid twice, re-opening under a different
    /// mode, exhausting the tag or fid space.
    #[error("usage error: {0}")]
    Usage(String),

    /// The operation was cancelled by a flush.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation outlived its configured deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The connection is gone; carries the teardown reason.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Transport failure. Always fatal.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the connection that produced this error is still usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Io(_) | Error::ConnectionClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol("bad length".into()).is_fatal());
        assert!(Error::ConnectionClosed("reader gone".into()).is_fatal());
        assert!(!Error::Remote("no such file".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::NotFound("b".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::NotFound("b".into());
        assert!(err.to_string().contains('b'));

        let err = Error::Remote("permission denied".into());
        assert!(err.to_string().contains("permission denied"));
    }
}
