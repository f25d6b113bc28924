use thiserror::Error;

/// Classification of parse-layer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// MySQL packet structure violated (framing, field layout)
    MalformedPacket,
    /// SQL rejected by the classifier (empty, comments-only, multi-statement)
    InvalidSql,
    /// Command byte outside the accepted subset
    UnsupportedCommand,
    /// Internal precondition violation
    InternalError,
}

/// Error returned by the protocol and parser layers.
///
/// `context` carries the offending input fragment or OS error text for
/// logging; it is never sent to the client.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub context: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn malformed(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::MalformedPacket, message, context)
    }

    pub fn invalid_sql(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::InvalidSql, message, context)
    }

    pub fn unsupported_command(message: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::UnsupportedCommand, message, "")
    }

    pub fn internal(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::InternalError, message, context)
    }
}
