//! The concrete deployments rollstack knows how to run.

pub mod cmd;
pub mod op_stack;
pub mod orbit;

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::PathBuf,
};

use anyhow::Context;
use strum::{Display, EnumString};

use crate::{
    config::DeployConfig,
    context::PipelineContext,
    credentials::{CredentialStore, Role},
    fs::FsHandler,
    orchestrator::{BuiltinTask, Pipeline},
};

/// Deployment variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Plan {
    Orbit,
    OpStack,
}

impl Plan {
    pub fn pipeline(&self, config: &DeployConfig) -> Pipeline {
        match self {
            Plan::Orbit => orbit::pipeline(config),
            Plan::OpStack => op_stack::pipeline(config),
        }
    }
}

/// Load (or generate) the run's keys and publish them to the context.
pub struct CredentialsTask {
    store: CredentialStore,
}

impl CredentialsTask {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }
}

impl BuiltinTask for CredentialsTask {
    fn name(&self) -> &str {
        "credentials"
    }

    fn provides(&self) -> Vec<String> {
        self.store
            .roles()
            .iter()
            .flat_map(|role| [role.private_key_var(), role.address_var()])
            .collect()
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        if self.store.is_complete() {
            tracing::info!(path = %self.store.path().display(), "Reusing existing credentials");
        }
        let credentials = self.store.load_or_generate()?;
        credentials.export(ctx)?;
        Ok(())
    }
}

/// Persist the resolved configuration next to the deployment artifacts.
pub struct SaveConfigTask {
    config: DeployConfig,
}

impl SaveConfigTask {
    pub fn new(config: DeployConfig) -> Self {
        Self { config }
    }
}

impl BuiltinTask for SaveConfigTask {
    fn name(&self) -> &str {
        "save-config"
    }

    fn run(&self, _ctx: &mut PipelineContext) -> anyhow::Result<()> {
        FsHandler::ensure_dir(&self.config.workdir)?;
        self.config.save_config()?;
        Ok(())
    }
}

/// Resolve the address other hosts reach this machine on, as `NODE_IP`.
pub struct NodeIpTask;

impl NodeIpTask {
    /// The source address of the default route. No packet is sent.
    fn detect() -> anyhow::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("Failed to bind UDP socket")?;
        socket
            .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
            .context("No route to the public internet")?;
        Ok(socket.local_addr()?.ip())
    }
}

impl BuiltinTask for NodeIpTask {
    fn name(&self) -> &str {
        "node-ip"
    }

    fn provides(&self) -> Vec<String> {
        vec!["NODE_IP".to_string()]
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let ip = Self::detect().unwrap_or_else(|e| {
            tracing::warn!(err = %format!("{e:#}"), "Could not detect node IP, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        tracing::info!(node_ip = %ip, "Node IP resolved");
        ctx.overwrite("NODE_IP", ip.to_string());
        Ok(())
    }
}

/// Write the public facts of a deployment (never its keys) to a TOML file.
pub struct SummaryTask {
    path: PathBuf,
    keys: Vec<String>,
    /// Extra entries, rendered against the context.
    extra: Vec<(String, String)>,
}

impl SummaryTask {
    pub fn new(path: impl Into<PathBuf>, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path: path.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            extra: Vec::new(),
        }
    }

    pub fn entry(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.extra.push((key.into(), template.into()));
        self
    }
}

impl BuiltinTask for SummaryTask {
    fn name(&self) -> &str {
        "deployment-summary"
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let mut summary = BTreeMap::new();
        for key in &self.keys {
            if key.ends_with("_PRIVATE_KEY") {
                continue;
            }
            if let Some(value) = ctx.get(key) {
                summary.insert(key.to_lowercase(), value.clone());
            }
        }
        for (key, template) in &self.extra {
            summary.insert(key.clone(), ctx.render(template)?);
        }

        let content = toml::to_string_pretty(&summary).context("Failed to serialize deployment summary")?;
        FsHandler::write_atomic(&self.path, content.as_bytes())?;
        tracing::info!(path = %self.path.display(), "Deployment summary written");
        Ok(())
    }
}

/// Addresses exported by the credentials of `roles`.
fn address_keys(roles: &[Role]) -> Vec<String> {
    roles.iter().map(Role::address_var).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempdir::TempDir;

    #[test]
    fn test_plan_names() {
        assert_eq!(Plan::from_str("op-stack").unwrap(), Plan::OpStack);
        assert_eq!(Plan::Orbit.to_string(), "orbit");
    }

    #[test]
    fn test_node_ip_is_set() {
        let mut ctx = PipelineContext::new();
        NodeIpTask.run(&mut ctx).unwrap();
        assert!(ctx.require("NODE_IP").unwrap().parse::<IpAddr>().is_ok());
    }

    #[test]
    fn test_summary_skips_private_keys() {
        let tmp_dir = TempDir::new("rollstack-summary").unwrap();
        let path = tmp_dir.path().join("deployment.toml");

        let mut ctx = PipelineContext::new();
        ctx.set("CHAIN_ID", "999").unwrap();
        ctx.set("DEPLOYER_PRIVATE_KEY", "0xsecret").unwrap();
        ctx.set("NODE_IP", "10.0.0.5").unwrap();

        SummaryTask::new(&path, ["CHAIN_ID", "DEPLOYER_PRIVATE_KEY", "TX_HASH"])
            .entry("rpc_url", "http://${NODE_IP}:8545")
            .run(&mut ctx)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let summary: BTreeMap<String, String> = toml::from_str(&content).unwrap();
        assert_eq!(summary.get("chain_id").map(String::as_str), Some("999"));
        assert_eq!(
            summary.get("rpc_url").map(String::as_str),
            Some("http://10.0.0.5:8545")
        );
        assert!(!content.contains("0xsecret"));
        assert!(!summary.contains_key("tx_hash"));
    }
}
