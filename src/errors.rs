use crate::query;
use std::{error, fmt};

/// Reasons a request fails to parse. Every variant surfaces to the peer
/// as a `400 Bad Request`; the distinction exists for diagnostics and
/// for the parser tests to pin down exactly which rule fired.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    Query(query::Error),

    InvalidVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,

    BodyTooLarge,
    MissingHost,
    UnsupportedTransferEncoding,
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidMethod => write!(f, "invalid request method"),
            ErrorKind::InvalidUrl => write!(f, "invalid request URL"),
            ErrorKind::Query(err) => write!(f, "invalid query string: {}", err),
            ErrorKind::InvalidVersion => write!(f, "invalid HTTP version"),
            ErrorKind::InvalidHeader => write!(f, "invalid header"),
            ErrorKind::TooManyHeaders => write!(f, "too many headers"),
            ErrorKind::InvalidContentLength => write!(f, "invalid Content-Length"),
            ErrorKind::BodyTooLarge => write!(f, "request body too large"),
            ErrorKind::MissingHost => write!(f, "Host header required for HTTP/1.1"),
            ErrorKind::UnsupportedTransferEncoding => {
                write!(f, "Transfer-Encoding is not supported")
            }
        }
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}

/// The failure payload of a [`Completion`](crate::Completion).
///
/// When a handler's completion fails and the response has not been sent
/// yet, the server answers `500` with this message as the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    #[inline]
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl error::Error for HandlerError {}
impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
