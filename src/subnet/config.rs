use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY_PATH: &str = "subnets.csv";
pub const DEFAULT_CONFIG_PATH: &str = "ovpn-subnets.json";

/// How a dotted-decimal netmask is turned into a prefix length.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetmaskPolicy {
    /// Reject masks whose set bits are not contiguous from the top.
    #[default]
    Strict,
    /// Count the set bits, whatever their position.
    Permissive,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(rename = "RegistryPath", default)]
    pub registry_path: Option<PathBuf>,

    #[serde(rename = "NetmaskPolicy", default)]
    pub netmask_policy: NetmaskPolicy,
}

impl Config {
    /// Reads the config file at `path`. A missing file yields the default
    /// config unless `required` is set.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound && !required => {
                return Ok(Config::default())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("open config {}", path.display()))
            }
        };
        let cfg = serde_json::from_reader(file)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn get_registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH))
    }
}
