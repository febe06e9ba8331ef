use thiserror::Error;

/// Errors surfaced by the bridge. `Clone` so a failure can sit inside
/// [`crate::ServiceState::Failure`] and be handed to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    ConnectionFailure(String),
    #[error("version mismatch: requested {requested}, remote reports {actual}")]
    VersionMismatch { requested: i32, actual: i32 },
    #[error("remote process died")]
    RemoteDeath,
    #[error("privileged channel is not connected")]
    NotConnected,
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("remote call failed: {0}")]
    Remote(String),
}

impl BridgeError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionFailure(_) | BridgeError::VersionMismatch { .. }
        )
    }
}

impl From<tonic::Status> for BridgeError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => BridgeError::ConnectionFailure(status.message().into()),
            tonic::Code::InvalidArgument => BridgeError::InvalidArgument(status.message().into()),
            _ => BridgeError::Remote(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

impl From<tonic::transport::Error> for BridgeError {
    fn from(err: tonic::transport::Error) -> Self {
        BridgeError::ConnectionFailure(err.to_string())
    }
}
