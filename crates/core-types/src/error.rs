use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("Arithmetic overflow in {0}")]
    Overflow(String),
}
