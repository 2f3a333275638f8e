//! Error types for rabbit-engine.

use thiserror::Error;

use crate::status::Status;

/// Errors raised by the incremental frame decoder.
///
/// Any of these on a partially-consumed stream leaves the codec in an
/// unrecoverable position, so the tunnel is closed rather than resynced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Start line is empty, not UTF-8, or not a known verb/status.
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    /// Header line is not `Key: Value` with a `[A-Za-z0-9-]+` key and a
    /// printable-ASCII value.
    #[error("bad header: {0}")]
    BadHeader(String),

    /// Header block exceeded the limit without an `End:` sentinel.
    #[error("missing End: sentinel")]
    MissingEnd,

    /// Stream ended inside a declared body.
    #[error("body ended {remaining} bytes short")]
    BodyTooShort { remaining: usize },

    /// `Length:` value is not a valid byte count.
    #[error("bad Length header: {0}")]
    BadLength(String),

    /// `Length:` and `Transfer:` present on the same frame.
    #[error("Length and Transfer are mutually exclusive")]
    MixedTransfer,

    /// A line terminated by a bare LF instead of CRLF.
    #[error("bare LF in frame")]
    BareLineFeed,

    /// Declared body exceeds the non-chunked limit.
    #[error("frame-too-large: {size} exceeds {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// A `text/*` body failed UTF-8 validation.
    #[error("text body is not valid UTF-8")]
    BodyNotUtf8,
}

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum RabbitError {
    /// Codec-level failure; the tunnel state is unrecoverable.
    #[error("malformed frame: {0}")]
    Malformed(#[from] ParseError),

    /// Lane/seq/credit discipline violated by the peer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Identity proof required or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The principal may not apply this verb to this selector.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Selector does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// Inbound `Seq:` did not match the expected position.
    #[error("out of order on lane {lane}: expected seq {expected}, got {got}")]
    OutOfOrder { lane: u16, expected: u64, got: u64 },

    /// A precondition (e.g. hop limit) failed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Lane quota or subscriber inflight limit exceeded.
    #[error("flow limit: {0}")]
    FlowLimit(String),

    /// Handshake negotiation failed.
    #[error("bad hello: {0}")]
    BadHello(String),

    /// A request deadline expired.
    #[error("request timed out")]
    Timeout,

    /// The operation was canceled by `CANCEL`, a local timeout, or close.
    #[error("canceled")]
    Canceled,

    /// The peer is temporarily unable to serve.
    #[error("busy: {0}")]
    Busy(String),

    /// Handler failure mapped at the dispatcher boundary.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}

impl RabbitError {
    /// Status line this error surfaces as on the wire.
    pub fn status(&self) -> Status {
        match self {
            RabbitError::Malformed(ParseError::FrameTooLarge { .. }) => Status::FRAME_TOO_LARGE,
            RabbitError::Malformed(_) => Status::BAD_REQUEST,
            RabbitError::ProtocolViolation(_) => Status::BAD_REQUEST,
            RabbitError::Unauthorized(_) => Status::AUTH_REQUIRED,
            RabbitError::Forbidden(_) => Status::FORBIDDEN,
            RabbitError::NotFound(_) => Status::MISSING,
            RabbitError::OutOfOrder { .. } => Status::OUT_OF_ORDER,
            RabbitError::Precondition(_) => Status::PRECONDITION,
            RabbitError::FlowLimit(_) => Status::FLOW_LIMIT,
            RabbitError::BadHello(_) => Status::BAD_HELLO,
            RabbitError::Timeout => Status::TIMEOUT,
            RabbitError::Canceled => Status::CANCELED,
            RabbitError::Busy(_) => Status::BUSY,
            RabbitError::Internal(_) => Status::INTERNAL,
            RabbitError::Io(_) | RabbitError::ConnectionClosed => Status::INTERNAL,
        }
    }

    /// Whether this error closes the whole tunnel rather than one lane.
    pub fn is_tunnel_fatal(&self) -> bool {
        matches!(
            self,
            RabbitError::Malformed(_)
                | RabbitError::BadHello(_)
                | RabbitError::Io(_)
                | RabbitError::ConnectionClosed
        )
    }
}

/// Result type alias using RabbitError.
pub type Result<T> = std::result::Result<T, RabbitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RabbitError::Timeout.status().code(), 408);
        assert_eq!(RabbitError::Canceled.status().code(), 499);
        assert_eq!(RabbitError::NotFound("x".into()).status().code(), 404);
        assert_eq!(
            RabbitError::OutOfOrder { lane: 1, expected: 2, got: 3 }
                .status()
                .code(),
            409
        );
        assert_eq!(
            RabbitError::Malformed(ParseError::MissingEnd).status().code(),
            400
        );
    }

    #[test]
    fn test_frame_too_large_reason() {
        let err = RabbitError::Malformed(ParseError::FrameTooLarge { size: 2, limit: 1 });
        assert_eq!(err.status().phrase(), "frame-too-large");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RabbitError::Malformed(ParseError::BareLineFeed).is_tunnel_fatal());
        assert!(RabbitError::ConnectionClosed.is_tunnel_fatal());
        assert!(!RabbitError::NotFound("x".into()).is_tunnel_fatal());
        assert!(!RabbitError::Timeout.is_tunnel_fatal());
    }
}
