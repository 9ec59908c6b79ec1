use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Protocol error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// A frame was structurally fine but unacceptable (size, version).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The worker processed the request and reported a failure.
    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid socket path: {0}")]
    InvalidSocketPath(String),
}

impl ControlError {
    /// The worker is not running, as opposed to having answered badly.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::InvalidSocketPath(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_socket_is_unreachable() {
        let e = ControlError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(e.is_unreachable());
        assert!(!ControlError::Timeout.is_unreachable());
        assert!(!ControlError::Server("no".into()).is_unreachable());
    }
}
