#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid username: {0}")]
    InvalidKey(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
