use thiserror::Error;

/// Errors produced while decoding RPC frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The negotiation frame did not start with `SSTARRPC`.
    #[error("bad negotiation magic")]
    BadMagic,
    /// A request carried a non-positive msg_id.
    #[error("invalid msg_id {0}")]
    InvalidMsgId(i64),
    /// An exception body carried an unknown type tag.
    #[error("unknown exception type {0}")]
    UnknownExceptionType(u32),
    /// An exception body was shorter than its type requires.
    #[error("truncated exception body")]
    TruncatedException,
    /// A user exception string was not valid UTF-8.
    #[error("exception message is not utf-8")]
    BadUtf8,
}
