use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use silo_core::ClusterConfig;
use silo_core::config::ConfigUpdate;
use uuid::Uuid;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const NODE_ID_FILE: &str = "node_id";
const OVERRIDE_FILE: &str = "override.toml";

/// Daemon configuration loaded from TOML, layered default → file →
/// persisted local overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Local daemon settings.
    pub daemon: DaemonConfig,
    /// Cluster-wide defaults used when founding a cluster (replaced by the
    /// primary's config after joining).
    pub cluster: ClusterConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("default config to parse")
    }
}

/// Local daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Hostname advertised to the cluster.
    pub host: String,
    /// Public port; intra-control and intra-data listen on port+1/port+2.
    pub port: u16,
    /// Directory holding the persisted node id and local overrides.
    pub state_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            state_dir: None,
        }
    }
}

impl CliConfig {
    /// Loads configuration: defaults, then the optional file, then the
    /// persisted override layer from `state_dir`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let file: Self =
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            config = file;
        }
        if let Some(dir) = config.daemon.state_dir.clone() {
            let override_path = dir.join(OVERRIDE_FILE);
            if override_path.exists() {
                let raw = fs::read_to_string(&override_path)
                    .with_context(|| format!("reading overrides {}", override_path.display()))?;
                let upd: ConfigUpdate = toml::from_str(&raw)
                    .with_context(|| format!("parsing {}", override_path.display()))?;
                config.cluster.apply(&upd);
            }
        }
        Ok(config)
    }

    /// Persists a local override layer merged over the cluster config on
    /// every subsequent start.
    pub fn save_override(&self, upd: &ConfigUpdate) -> Result<()> {
        let dir = self
            .daemon
            .state_dir
            .as_ref()
            .context("no state directory configured")?;
        fs::create_dir_all(dir)?;
        let path = dir.join(OVERRIDE_FILE);
        fs::write(&path, toml::to_string_pretty(upd)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Loads the node's persisted identity, generating and persisting a fresh
/// one on first startup. The id never changes for the node's lifetime.
pub fn load_or_create_node_id(state_dir: Option<&Path>) -> Result<String> {
    let Some(dir) = state_dir else {
        // No state directory: ephemeral identity (tests, one-shot runs).
        return Ok(generate_node_id());
    };
    let path = dir.join(NODE_ID_FILE);
    if path.exists() {
        let id = fs::read_to_string(&path)
            .with_context(|| format!("reading node id {}", path.display()))?;
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = generate_node_id();
    fs::create_dir_all(dir)?;
    fs::write(&path, &id).with_context(|| format!("persisting node id {}", path.display()))?;
    Ok(id)
}

fn generate_node_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_parses() {
        let config = CliConfig::default();
        assert_eq!(config.daemon.port, 8080);
        assert!(config.cluster.rebalance.enabled);
        assert_eq!(config.cluster.ic.size, 3);
    }

    #[test]
    fn node_id_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_node_id(Some(dir.path())).unwrap();
        let second = load_or_create_node_id(Some(dir.path())).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
    }

    #[test]
    fn overrides_layer_over_cluster_config() {
        let dir = TempDir::new().unwrap();
        let mut config = CliConfig::default();
        config.daemon.state_dir = Some(dir.path().to_path_buf());
        let upd = ConfigUpdate {
            rebalance_enabled: Some(false),
            ..Default::default()
        };
        config.save_override(&upd).unwrap();

        // Reload: the override applies on top of defaults.
        let config_path = dir.path().join("silo.toml");
        fs::write(
            &config_path,
            format!("[daemon]\nstate_dir = {:?}\n", dir.path()),
        )
        .unwrap();
        let reloaded = CliConfig::load(Some(&config_path)).unwrap();
        assert!(!reloaded.cluster.rebalance.enabled);
    }
}
