use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// How far an error is allowed to travel (see the propagation rules on [`AppError::kind`])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resolved locally and reported to the immediate caller
    Local,
    /// A race with another writer; reconcile by refreshing, never alarm
    Benign,
    /// Network/subscription failure; retryable, stale state is preserved
    Transport,
}

/// Attachment and draft checks that run before any network call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file {name} is {size} bytes, limit is {max} bytes")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("file {name} has disallowed type {mime}")]
    MimeNotAllowed { name: String, mime: String },

    #[error("{count} files attached, limit is {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("file {name} is empty")]
    EmptyFile { name: String },

    #[error("message has neither text nor attachments")]
    EmptyMessage,

    #[error("reply target {0} is not a message in this conversation")]
    InvalidReply(uuid::Uuid),
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("only the original sender may change this message")]
    NotAuthor,

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Transport(format!("postgres: {e}"))
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Transport(format!("pool: {e}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Transport(format!("redis: {e}"))
    }
}

impl<E, R> From<aws_sdk_s3::error::SdkError<E, R>> for AppError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    fn from(e: aws_sdk_s3::error::SdkError<E, R>) -> Self {
        AppError::Transport(format!("s3: {}", aws_sdk_s3::error::DisplayErrorContext(&e)))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Transport(format!("decode: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout
    }
}

impl AppError {
    /// Returns whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::Timeout)
    }

    /// Validation/authorization errors stay with the caller, `NotFound` and
    /// `Conflict` are races, everything network-shaped is transport.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound | AppError::Conflict(_) => ErrorKind::Benign,
            AppError::Transport(_) | AppError::Timeout => ErrorKind::Transport,
            AppError::Validation(_)
            | AppError::NotAuthor
            | AppError::Config(_)
            | AppError::Unsupported(_) => ErrorKind::Local,
        }
    }
}
