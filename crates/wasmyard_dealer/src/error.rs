use thiserror::Error;

pub type DealerResult<T> = Result<T, DealerError>;

#[derive(Debug, Error)]
pub enum DealerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("runtime failure: {0}")]
    Internal(String),

    #[error("failed to connect to the wasmdealer: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("wasmdealer rpc failed: {0}")]
    Rpc(tonic::Status),
}

impl DealerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            DealerError::NotFound(_) => true,
            DealerError::Rpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            DealerError::AlreadyExists(_) => true,
            DealerError::Rpc(status) => status.code() == tonic::Code::AlreadyExists,
            _ => false,
        }
    }

    /// Maps a client-side RPC status back into the matching error variant so
    /// callers can branch on the kind instead of on gRPC codes.
    pub fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => DealerError::NotFound(status.message().to_string()),
            tonic::Code::AlreadyExists => DealerError::AlreadyExists(status.message().to_string()),
            tonic::Code::InvalidArgument => {
                DealerError::InvalidArgument(status.message().to_string())
            }
            tonic::Code::FailedPrecondition => {
                DealerError::FailedPrecondition(status.message().to_string())
            }
            _ => DealerError::Rpc(status),
        }
    }
}

impl From<DealerError> for tonic::Status {
    fn from(err: DealerError) -> Self {
        match err {
            DealerError::NotFound(msg) => tonic::Status::not_found(msg),
            DealerError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            DealerError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            DealerError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            DealerError::Internal(msg) => tonic::Status::internal(msg),
            DealerError::Transport(e) => tonic::Status::unavailable(e.to_string()),
            DealerError::Rpc(status) => status,
        }
    }
}
