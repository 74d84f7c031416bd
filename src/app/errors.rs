#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("item not found")]
    NotFound,

    #[error("{0}")]
    Invalid(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> AppError {
        AppError::Invalid(message.into())
    }
}
