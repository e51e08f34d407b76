use thiserror::Error;

/// Errors produced by the espterm session layer.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("connection timed out")]
    ConnectTimeout,

    #[error("connection refused")]
    ConnectRefused,

    #[error("connect error: {0}")]
    ConnectFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TermError {
    /// Classify an I/O error raised while establishing a connection.
    pub fn from_connect(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TermError::ConnectRefused,
            std::io::ErrorKind::TimedOut => TermError::ConnectTimeout,
            _ => TermError::ConnectFailed(err.to_string()),
        }
    }
}

pub type TermResult<T> = Result<T, TermError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn classify_refused() {
        let err = TermError::from_connect(Error::from(ErrorKind::ConnectionRefused));
        assert!(matches!(err, TermError::ConnectRefused));
    }

    #[test]
    fn classify_os_timeout() {
        let err = TermError::from_connect(Error::from(ErrorKind::TimedOut));
        assert!(matches!(err, TermError::ConnectTimeout));
    }

    #[test]
    fn classify_other_keeps_reason() {
        let err = TermError::from_connect(Error::new(ErrorKind::Other, "no route to host"));
        assert_eq!(err.to_string(), "connect error: no route to host");
    }
}
