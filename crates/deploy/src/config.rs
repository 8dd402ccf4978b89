//! Deployment configuration.
//!
//! Layers, lowest to highest precedence: built-in defaults, an optional TOML
//! file, then `ROLLSTACK_*` environment variables (nested keys separated by
//! `__`, e.g. `ROLLSTACK_ORBIT__PARENT_CHAIN_RPC`). The resolved configuration
//! of a run is saved next to its artifacts as [`CONFIG_FILENAME`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    provision::{DEFAULT_SERVICE_LOG_DIR, DEFAULT_UNIT_DIR},
    readiness::ReadinessPolicy,
};

/// Name of the resolved configuration saved in the working directory.
pub const CONFIG_FILENAME: &str = "Rollstack.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "ROLLSTACK_";

/// Default working directory for deployment artifacts.
pub const DEFAULT_WORKDIR: &str = "/opt/rollstack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Root of every artifact a run produces.
    pub workdir: PathBuf,
    /// Where systemd unit files are installed.
    pub unit_dir: PathBuf,
    /// Where services append their output.
    pub service_log_dir: PathBuf,
    pub readiness: ReadinessPolicy,
    pub orbit: OrbitConfig,
    pub op_stack: OpStackConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            service_log_dir: PathBuf::from(DEFAULT_SERVICE_LOG_DIR),
            readiness: ReadinessPolicy::default(),
            orbit: OrbitConfig::default(),
            op_stack: OpStackConfig::default(),
        }
    }
}

/// Settings of the Orbit deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrbitConfig {
    /// Repository holding the chain deployment scripts.
    pub repo_url: String,
    /// Checkout directory, relative to the working directory.
    pub repo_dir: PathBuf,
    /// RPC of the parent chain the rollup settles on.
    pub parent_chain_rpc: String,
    /// RPC of the node started by `docker compose`. Not probed when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_rpc_url: Option<String>,
    /// Upper bound for `yarn dev`, in seconds.
    pub deploy_timeout_secs: u64,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/OffchainLabs/orbit-setup-script.git".to_string(),
            repo_dir: PathBuf::from("orbit-setup-script"),
            parent_chain_rpc: "https://sepolia-rollup.arbitrum.io/rpc".to_string(),
            node_rpc_url: Some("http://127.0.0.1:8449".to_string()),
            deploy_timeout_secs: 1800,
        }
    }
}

/// Settings of the OP Stack deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStackConfig {
    /// Release archive of `op-deployer`.
    pub op_deployer_url: String,
    /// Where `op-deployer` is installed. Must be on `PATH`.
    pub install_dir: PathBuf,
    /// `op-deployer init --intent-type`.
    pub intent_type: String,
    pub binaries: OpBinaries,
    pub ports: OpPorts,
    /// L1 beacon endpoint for op-node. May reference `${L1_RPC_URL}`.
    pub l1_beacon_url: String,
    /// Dispute game type used by op-proposer.
    pub game_type: u32,
    pub proposal_interval: String,
    /// op-geth garbage collection mode (full, archive).
    pub gcmode: String,
    /// L1 confirmations op-node waits for before deriving from a block.
    pub l1_confs: u64,
    /// How op-batcher posts batches (blobs, calldata).
    pub data_availability_type: String,
    /// Upper bound on a batcher channel, in L1 blocks.
    pub max_channel_duration: u64,
    /// Appended verbatim to each service's command line.
    pub extra_args: OpExtraArgs,
}

impl Default for OpStackConfig {
    fn default() -> Self {
        Self {
            op_deployer_url: "https://github.com/ethereum-optimism/optimism/releases/download/op-deployer%2Fv0.4.0/op-deployer-0.4.0-linux-amd64.tar.gz".to_string(),
            install_dir: PathBuf::from("/usr/local/bin"),
            intent_type: "custom".to_string(),
            binaries: OpBinaries::default(),
            ports: OpPorts::default(),
            l1_beacon_url: "${L1_RPC_URL}".to_string(),
            game_type: 1,
            proposal_interval: "1h".to_string(),
            gcmode: "archive".to_string(),
            l1_confs: 4,
            data_availability_type: "blobs".to_string(),
            max_channel_duration: 25,
            extra_args: OpExtraArgs::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpExtraArgs {
    pub geth: Vec<String>,
    pub op_node: Vec<String>,
    pub op_batcher: Vec<String>,
    pub op_proposer: Vec<String>,
}

/// Executables of the OP Stack services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpBinaries {
    pub geth: String,
    pub op_node: String,
    pub op_batcher: String,
    pub op_proposer: String,
}

impl Default for OpBinaries {
    fn default() -> Self {
        Self {
            geth: "/usr/local/bin/geth".to_string(),
            op_node: "/usr/local/bin/op-node".to_string(),
            op_batcher: "/usr/local/bin/op-batcher".to_string(),
            op_proposer: "/usr/local/bin/op-proposer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPorts {
    pub geth_http: u16,
    pub geth_ws: u16,
    pub geth_authrpc: u16,
    pub op_node_rpc: u16,
    pub op_batcher_rpc: u16,
    pub op_proposer_rpc: u16,
}

impl Default for OpPorts {
    fn default() -> Self {
        Self {
            geth_http: 8545,
            geth_ws: 8546,
            geth_authrpc: 8551,
            op_node_rpc: 8547,
            op_batcher_rpc: 8548,
            op_proposer_rpc: 8560,
        }
    }
}

impl DeployConfig {
    /// Resolve the layered configuration.
    ///
    /// A missing `file` is an error only when it was given explicitly.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        if let Some(path) = file {
            anyhow::ensure!(
                path.is_file(),
                "Configuration file not found: {}",
                path.display()
            );
        }
        Self::figment(file).extract().context("Failed to load configuration")
    }

    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(DeployConfig::default()));

        match file {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                if let Some(path) = default_config_path() {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Save the resolved configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deploy config to TOML")?;
        crate::fs::FsHandler::write_atomic(path, content.as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Save to [`CONFIG_FILENAME`] in the working directory.
    pub fn save_config(&self) -> Result<PathBuf> {
        let config_path = self.workdir.join(CONFIG_FILENAME);
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    /// Directory of run logs.
    pub fn log_dir(&self) -> PathBuf {
        self.workdir.join("logs")
    }

    /// The single credentials file shared by every deployment in this workdir.
    pub fn credentials_file(&self) -> PathBuf {
        self.workdir.join("credentials.env")
    }
}

/// `<config dir>/rollstack/Rollstack.toml`, e.g. `~/.config/rollstack/Rollstack.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rollstack").join(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_file_overrides_defaults() {
        let tmp_dir = TempDir::new("rollstack-config").unwrap();
        let path = tmp_dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
workdir = "/srv/chain"

[orbit]
parent_chain_rpc = "http://10.0.0.2:8547"

[op_stack.ports]
geth_http = 9545
"#,
        )
        .unwrap();

        let config: DeployConfig = DeployConfig::figment(Some(&path)).extract().unwrap();
        assert_eq!(config.workdir, PathBuf::from("/srv/chain"));
        assert_eq!(config.orbit.parent_chain_rpc, "http://10.0.0.2:8547");
        assert_eq!(config.op_stack.ports.geth_http, 9545);
        assert_eq!(config.op_stack.ports.geth_authrpc, 8551);
        assert_eq!(config.unit_dir, PathBuf::from(DEFAULT_UNIT_DIR));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let tmp_dir = TempDir::new("rollstack-config").unwrap();
        assert!(DeployConfig::load(Some(&tmp_dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp_dir = TempDir::new("rollstack-config").unwrap();
        let config = DeployConfig {
            workdir: tmp_dir.path().to_path_buf(),
            ..Default::default()
        };

        let path = config.save_config().unwrap();
        assert_eq!(path, tmp_dir.path().join(CONFIG_FILENAME));

        let reloaded: DeployConfig = DeployConfig::figment(Some(&path)).extract().unwrap();
        assert_eq!(reloaded, config);
    }
}
