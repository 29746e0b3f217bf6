use thiserror::Error;
use wasmyard_dealer::DealerError;

pub type YardResult<T> = Result<T, YardError>;

#[derive(Debug, Error)]
pub enum YardError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Internal(String),
}

impl YardError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        YardError::NotFound(format!("{what} not found"))
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        YardError::AlreadyExists(format!("{what} already exists"))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        YardError::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        YardError::FailedPrecondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        YardError::Internal(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, YardError::NotFound(_))
    }

    /// Wraps the error with a short context string, preserving the kind so
    /// the gRPC status code survives.
    pub fn context(self, msg: impl std::fmt::Display) -> Self {
        match self {
            YardError::NotFound(inner) => YardError::NotFound(format!("{msg}: {inner}")),
            YardError::AlreadyExists(inner) => YardError::AlreadyExists(format!("{msg}: {inner}")),
            YardError::InvalidArgument(inner) => {
                YardError::InvalidArgument(format!("{msg}: {inner}"))
            }
            YardError::FailedPrecondition(inner) => {
                YardError::FailedPrecondition(format!("{msg}: {inner}"))
            }
            YardError::Internal(inner) => YardError::Internal(format!("{msg}: {inner}")),
        }
    }
}

impl From<DealerError> for YardError {
    fn from(err: DealerError) -> Self {
        match err {
            DealerError::NotFound(msg) => YardError::NotFound(msg),
            DealerError::AlreadyExists(msg) => YardError::AlreadyExists(msg),
            DealerError::InvalidArgument(msg) => YardError::InvalidArgument(msg),
            DealerError::FailedPrecondition(msg) => YardError::FailedPrecondition(msg),
            other => YardError::Internal(other.to_string()),
        }
    }
}

impl From<YardError> for tonic::Status {
    fn from(err: YardError) -> Self {
        match err {
            YardError::NotFound(msg) => tonic::Status::not_found(msg),
            YardError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            YardError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            YardError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            YardError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}

impl From<std::io::Error> for YardError {
    fn from(err: std::io::Error) -> Self {
        YardError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for YardError {
    fn from(err: serde_json::Error) -> Self {
        YardError::Internal(format!("serialization failed: {err}"))
    }
}
