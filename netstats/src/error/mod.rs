mod stats_error;

pub use stats_error::StatsError;
pub type Result<T> = std::result::Result<T, StatsError>;
