use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task {name} failed: {reason}")]
    Join { name: String, reason: String },

    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}
