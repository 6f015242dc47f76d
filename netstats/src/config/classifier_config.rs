use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Account anchor apps under SimBasic/Sim2Basic instead of their SIM profile.
    #[serde(default)]
    pub display_anchor_separately: bool,

    /// Package names of the SIM profile apps.
    #[serde(default)]
    pub sim_packages: Vec<String>,

    #[serde(default)]
    pub sim2_packages: Vec<String>,

    #[serde(default)]
    pub sim_anchor_packages: Vec<String>,

    #[serde(default)]
    pub sim2_anchor_packages: Vec<String>,

    #[serde(default = "default_sim_install_source")]
    pub sim_install_source: String,

    #[serde(default = "default_sim2_install_source")]
    pub sim2_install_source: String,

    #[serde(default = "default_install_source")]
    pub default_install_source: String,
}

fn default_sim_install_source() -> String {
    "sim".to_string()
}

fn default_sim2_install_source() -> String {
    "sim2".to_string()
}

fn default_install_source() -> String {
    "default".to_string()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            display_anchor_separately: false,
            sim_packages: Vec::new(),
            sim2_packages: Vec::new(),
            sim_anchor_packages: Vec::new(),
            sim2_anchor_packages: Vec::new(),
            sim_install_source: default_sim_install_source(),
            sim2_install_source: default_sim2_install_source(),
            default_install_source: default_install_source(),
        }
    }
}
