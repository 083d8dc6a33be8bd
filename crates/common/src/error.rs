use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("data error: {0}")]
    Data(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notify error: {0}")]
    Notify(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
