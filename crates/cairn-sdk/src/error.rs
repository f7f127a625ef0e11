use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mapping error: {0}")]
    Orm(#[from] cairn_orm::OrmError),
}

pub type SdkResult<T> = Result<T, SdkError>;
