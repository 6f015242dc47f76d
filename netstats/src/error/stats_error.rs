use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StatsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Stable numeric code reported to callers.
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation(_) => 2_100_001,
            Self::Permission(_) => 2_100_002,
            Self::State(_) => 2_100_003,
            Self::Io(_) => 2_100_004,
            Self::NotFound(_) => 2_100_005,
        }
    }
}

impl From<std::io::Error> for StatsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<sea_orm::DbErr> for StatsError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Io(format!("database: {err}"))
    }
}

impl From<common::CommonError> for StatsError {
    fn from(err: common::CommonError) -> Self {
        Self::Io(err.to_string())
    }
}
