use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rollstack_deploy::{
    Plan,
    plans::{op_stack, orbit},
};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "rollstack")]
#[command(
    author,
    version,
    about = "Deploy an Arbitrum Orbit or OP Stack rollup on this host"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "ROLLSTACK_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Rollstack.toml configuration file.
    ///
    /// If not provided, `~/.config/rollstack/Rollstack.toml` is used when present.
    #[arg(long, alias = "conf", global = true, env = "ROLLSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory of every artifact produced by the deployment.
    #[arg(long, global = true, env = "ROLLSTACK_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Run without root privileges.
    ///
    /// Steps writing to system locations will most likely fail.
    #[arg(long, global = true, env = "ROLLSTACK_SKIP_PRIVILEGE_CHECK")]
    pub skip_privilege_check: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy an Arbitrum Orbit chain with the orbit setup scripts.
    Orbit {
        /// Chain ID of the new rollup.
        chain_id: String,
        /// Name of the new rollup.
        chain_name: String,
    },
    /// Deploy an OP Stack chain and run its services under systemd.
    OpStack {
        /// Chain ID of the settlement layer.
        l1_chain_id: String,
        /// Chain ID of the new rollup.
        l2_chain_id: String,
        /// RPC endpoint of the settlement layer.
        l1_rpc_url: String,
        /// System user the services run as.
        username: String,
    },
}

impl Command {
    pub fn plan(&self) -> Plan {
        match self {
            Command::Orbit { .. } => Plan::Orbit,
            Command::OpStack { .. } => Plan::OpStack,
        }
    }

    /// Positional arguments, keyed as the pipeline expects them.
    pub fn arguments(&self) -> Vec<(&'static str, String)> {
        match self {
            Command::Orbit {
                chain_id,
                chain_name,
            } => vec![
                (orbit::CHAIN_ID, chain_id.clone()),
                (orbit::CHAIN_NAME, chain_name.clone()),
            ],
            Command::OpStack {
                l1_chain_id,
                l2_chain_id,
                l1_rpc_url,
                username,
            } => vec![
                (op_stack::L1_CHAIN_ID, l1_chain_id.clone()),
                (op_stack::L2_CHAIN_ID, l2_chain_id.clone()),
                (op_stack::L1_RPC_URL, l1_rpc_url.clone()),
                (op_stack::USERNAME, username.clone()),
            ],
        }
    }
}
