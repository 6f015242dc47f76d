use serde::{Deserialize, Serialize};

/// Initial quota settings of one SIM slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub sim_id: u32,

    #[serde(default = "default_begin_day")]
    pub begin_day: u8,

    #[serde(default)]
    pub unlimited: bool,

    #[serde(default)]
    pub notify_type: u8,

    #[serde(default)]
    pub monthly_limit_bytes: Option<u64>,

    #[serde(default)]
    pub monthly_mark_percent: Option<u16>,

    #[serde(default)]
    pub daily_mark_percent: Option<u16>,
}

fn default_begin_day() -> u8 {
    1
}
