mod classifier_config;
mod counters_config;
mod sim_config;
mod stats_config;

pub use classifier_config::ClassifierConfig;
pub use counters_config::CountersConfig;
pub use sim_config::SimConfig;
pub use stats_config::{StatsConfig, StorageKind};
