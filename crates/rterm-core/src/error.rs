use thiserror::Error;

/// Errors produced by the rterm shell relay.
#[derive(Debug, Error)]
pub enum RtermError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RtermError {
    /// Whether this error only marks the end of a connection's lifecycle.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            RtermError::PeerClosed => true,
            RtermError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type RtermResult<T> = Result<T, RtermError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_and_broken_pipe_count_as_peer_closed() {
        let reset = RtermError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        let pipe = RtermError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(reset.is_peer_closed());
        assert!(pipe.is_peer_closed());
        assert!(RtermError::PeerClosed.is_peer_closed());
    }

    #[test]
    fn spawn_and_timeout_are_real_errors() {
        assert!(!RtermError::Spawn("no such file".into()).is_peer_closed());
        assert!(!RtermError::Timeout.is_peer_closed());
        let other = RtermError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!other.is_peer_closed());
    }
}
