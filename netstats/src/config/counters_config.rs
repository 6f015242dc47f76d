use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersConfig {
    /// Root of the per-interface statistics tree.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,

    /// Carrier ident of each cellular interface.
    #[serde(default)]
    pub iface_idents: HashMap<String, String>,

    /// Interfaces whose shared traffic is billed to the carrier.
    #[serde(default = "default_cellular_prefix")]
    pub cellular_prefix: String,
}

fn default_sysfs_root() -> String {
    "/sys/class/net".to_string()
}

fn default_cellular_prefix() -> String {
    "rmnet".to_string()
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            iface_idents: HashMap::new(),
            cellular_prefix: default_cellular_prefix(),
        }
    }
}
