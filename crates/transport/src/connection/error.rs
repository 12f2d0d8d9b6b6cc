use std::io;
use thiserror::Error;

use crate::networking::NetError;

/// Failures of a [`ResponseStream`](super::ResponseStream) write or flush.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("the response stream no longer accepts writes")]
    Disposed,

    #[error("the request has been aborted")]
    Aborted,

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("no pooled memory left for the response bytes")]
    PoolExhausted,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl StreamError {
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

impl From<NetError> for StreamError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Aborted | NetError::Disposed => StreamError::Aborted,
            NetError::Io { source } => StreamError::Io { source },
            other => StreamError::io(io::Error::other(other)),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io { source } => source,
            StreamError::Disposed => io::Error::new(io::ErrorKind::NotConnected, e),
            StreamError::Aborted => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            StreamError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            StreamError::PoolExhausted => io::Error::new(io::ErrorKind::OutOfMemory, e),
        }
    }
}

/// Request line failures, local to the connection they happened on.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid request target: {reason}")]
    InvalidTarget { reason: String },

    #[error("invalid http version")]
    InvalidVersion,

    #[error("request line too long, current: {current_size} exceed the limit {max_size}")]
    TooLongRequestLine { current_size: usize, max_size: usize },

    #[error("header section too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },
}

impl ParseError {
    pub fn invalid_target<S: ToString>(str: S) -> Self {
        Self::InvalidTarget { reason: str.to_string() }
    }

    pub fn too_long_request_line(current_size: usize, max_size: usize) -> Self {
        Self::TooLongRequestLine { current_size, max_size }
    }

    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_map_to_io_kinds() {
        assert_eq!(io::Error::from(StreamError::Disposed).kind(), io::ErrorKind::NotConnected);
        assert_eq!(io::Error::from(StreamError::Aborted).kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(io::Error::from(StreamError::Aborted).to_string(), "the request has been aborted");
        assert_eq!(io::Error::from(StreamError::PoolExhausted).kind(), io::ErrorKind::OutOfMemory);

        let source = io::Error::new(io::ErrorKind::BrokenPipe, "peer gone");
        assert_eq!(io::Error::from(StreamError::io(source)).kind(), io::ErrorKind::BrokenPipe);
    }
}
