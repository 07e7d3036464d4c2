use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolbridgeError {
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("table '{0}' is not allowed")]
    TableNotAllowed(String),
    #[error("invalid column name '{0}'")]
    ColumnNameInvalid(String),
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
    #[error("invalid tool parameters: {0}")]
    InvalidParams(String),
    #[error("prompt rejected: {0}")]
    PromptRejected(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("completion request failed: {0}")]
    CompletionFailed(String),
    #[error("worker runtime unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ToolbridgeError>;
