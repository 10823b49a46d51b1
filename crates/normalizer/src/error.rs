use core_types::{CoreError, Exchange, PayloadKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{exchange} payload of kind {kind:?} cannot be normalized here")]
    UnexpectedPayload { exchange: Exchange, kind: PayloadKind },

    #[error("Missing field `{field}` in {context}")]
    MissingField { field: String, context: String },

    #[error("Field `{field}` is not a decimal: {value}")]
    InvalidNumber { field: String, value: String },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Unexpected payload shape: {0}")]
    InvalidShape(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}
