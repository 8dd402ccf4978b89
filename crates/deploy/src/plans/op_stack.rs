//! OP Stack chain deployment.
//!
//! Installs `op-deployer`, deploys the L1 contracts for a new L2 chain,
//! generates its genesis and rollup configuration, initializes op-geth and
//! runs op-geth, op-node, op-batcher and op-proposer as systemd services.

use std::path::{Path, PathBuf};

use anyhow::Context;
use toml::{Table, Value};

use crate::{
    config::DeployConfig,
    context::PipelineContext,
    credentials::{CredentialStore, Role},
    fs::FsHandler,
    orchestrator::{ArgKind, BuiltinTask, Pipeline},
    provision::ServiceSpec,
    readiness::ReadinessProbe,
    step::{CommandSpec, Precondition, Step},
};

use super::{
    CredentialsTask, NodeIpTask, SaveConfigTask, SummaryTask, address_keys,
    cmd::{GethCmdBuilder, OpBatcherCmdBuilder, OpNodeCmdBuilder, OpProposerCmdBuilder},
};

pub const L1_CHAIN_ID: &str = "L1_CHAIN_ID";
pub const L2_CHAIN_ID: &str = "L2_CHAIN_ID";
pub const L1_RPC_URL: &str = "L1_RPC_URL";
pub const USERNAME: &str = "USERNAME";

/// Context key of the DisputeGameFactory proxy address.
pub const DISPUTE_GAME_FACTORY: &str = "DISPUTE_GAME_FACTORY_ADDRESS";

const ROLES: [Role; 5] = [
    Role::Deployer,
    Role::Batcher,
    Role::Proposer,
    Role::Sequencer,
    Role::Challenger,
];

const DGF_POINTER: &str = "/opChainDeployments/0/DisputeGameFactoryProxy";

/// Files and directories of an OP Stack deployment.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    /// `op-deployer` working directory (intent and state).
    pub deployer: PathBuf,
    pub genesis: PathBuf,
    pub rollup: PathBuf,
    pub jwt_secret: PathBuf,
    pub datadir: PathBuf,
    /// Environment file shared by the services. Holds their keys.
    pub env_file: PathBuf,
}

impl Layout {
    pub fn new(workdir: &Path) -> Self {
        let root = workdir.join("op-stack");
        Self {
            deployer: root.join("deployer"),
            genesis: root.join("genesis.json"),
            rollup: root.join("rollup.json"),
            jwt_secret: root.join("jwt.txt"),
            datadir: root.join("datadir"),
            env_file: root.join("op-stack.env"),
            root,
        }
    }

    pub fn intent(&self) -> PathBuf {
        self.deployer.join("intent.toml")
    }

    pub fn state(&self) -> PathBuf {
        self.deployer.join("state.json")
    }
}

pub fn pipeline(config: &DeployConfig) -> Pipeline {
    let op = &config.op_stack;
    let layout = Layout::new(&config.workdir);
    let deployer_workdir = layout.deployer.display().to_string();
    let tarball = layout.root.join("op-deployer.tar.gz");
    let installed = || Precondition::BinariesOnPath(vec!["op-deployer".to_string()]);

    let inspect = |what: &str, output: &Path| {
        Step::new(
            format!("inspect-{what}"),
            CommandSpec::new("op-deployer")
                .args(["inspect", what, "--workdir", deployer_workdir.as_str()])
                .arg("${L2_CHAIN_ID}"),
        )
        .stdout_to(output)
        .skip_if(Precondition::FileNonEmpty(output.to_path_buf()))
    };

    let mut pipeline = Pipeline::new("op-stack")
        .argument(L1_CHAIN_ID, ArgKind::ChainId)
        .argument(L2_CHAIN_ID, ArgKind::ChainId)
        .argument(L1_RPC_URL, ArgKind::Url)
        .argument(USERNAME, ArgKind::Name)
        .requires_root()
        .task(SaveConfigTask::new(config.clone()))
        .task(PrepareDirsTask {
            dirs: vec![
                layout.root.clone(),
                layout.deployer.clone(),
                config.service_log_dir.clone(),
            ],
        })
        .command(
            Step::new(
                "download-op-deployer",
                CommandSpec::new("curl")
                    .args(["-fsSL", "--create-dirs", "-o"])
                    .arg(tarball.display().to_string())
                    .arg(op.op_deployer_url.as_str()),
            )
            .skip_if(installed()),
        )
        .command(
            Step::new(
                "install-op-deployer",
                CommandSpec::new("tar")
                    .arg("-xzf")
                    .arg(tarball.display().to_string())
                    .arg("-C")
                    .arg(op.install_dir.display().to_string())
                    .args(["--strip-components=1", "--wildcards", "*/op-deployer"]),
            )
            .skip_if(installed()),
        )
        .task(CredentialsTask::new(
            CredentialStore::new(config.credentials_file(), ROLES).with_env_overrides(),
        ))
        .command(
            Step::new(
                "op-deployer-init",
                CommandSpec::new("op-deployer")
                    .args(["init", "--l1-chain-id", "${L1_CHAIN_ID}"])
                    .args(["--l2-chain-ids", "${L2_CHAIN_ID}"])
                    .args(["--workdir", deployer_workdir.as_str()])
                    .args(["--intent-type", op.intent_type.as_str()]),
            )
            .skip_if(Precondition::FileExists(layout.intent())),
        )
        .task(IntentRolesTask {
            intent: layout.intent(),
        })
        .command(
            Step::new(
                "op-deployer-apply",
                CommandSpec::new("op-deployer")
                    .args(["apply", "--workdir", deployer_workdir.as_str()])
                    .args(["--l1-rpc-url", "${L1_RPC_URL}"])
                    .args(["--private-key", "${DEPLOYER_PRIVATE_KEY}"]),
            )
            .skip_if(Precondition::JsonValueAt {
                file: layout.state(),
                pointer: DGF_POINTER.to_string(),
            }),
        )
        .command(inspect("genesis", &layout.genesis))
        .command(inspect("rollup", &layout.rollup))
        .task(JwtSecretTask {
            path: layout.jwt_secret.clone(),
        })
        .task(DisputeGameFactoryTask {
            state: layout.state(),
        })
        .command(
            Step::new(
                "geth-init",
                CommandSpec::new(op.binaries.geth.as_str())
                    .args(["init", "--state.scheme", "hash", "--datadir"])
                    .arg(layout.datadir.display().to_string())
                    .arg(layout.genesis.display().to_string()),
            )
            .skip_if(Precondition::DirExists(layout.datadir.join("geth").join("chaindata"))),
        )
        .task(ServicesEnvTask {
            path: layout.env_file.clone(),
        })
        .command(Step::new(
            "chown",
            CommandSpec::new("chown")
                .args(["-R", "${USERNAME}:"])
                .arg(layout.root.display().to_string()),
        ));

    for spec in services(config, &layout) {
        pipeline = pipeline.service(spec);
    }

    let ports = op.ports;
    pipeline
        .probe(
            ReadinessProbe::json_rpc(format!("http://127.0.0.1:{}", ports.geth_http))
                .with_chain_id("${L2_CHAIN_ID}"),
        )
        .probe(ReadinessProbe::tcp(format!("127.0.0.1:{}", ports.op_node_rpc)))
        .finalize(NodeIpTask)
        .finalize(
            SummaryTask::new(
                config.workdir.join("op-stack-deployment.toml"),
                [L1_CHAIN_ID, L2_CHAIN_ID, L1_RPC_URL, DISPUTE_GAME_FACTORY, "NODE_IP"]
                    .into_iter()
                    .map(String::from)
                    .chain(address_keys(&ROLES)),
            )
            .entry("l2_rpc_url", format!("http://${{NODE_IP}}:{}", ports.geth_http))
            .entry("l2_ws_url", format!("ws://${{NODE_IP}}:{}", ports.geth_ws))
            .entry("op_node_rpc_url", format!("http://${{NODE_IP}}:{}", ports.op_node_rpc)),
        )
}

/// The four long-running OP Stack services.
fn services(config: &DeployConfig, layout: &Layout) -> Vec<ServiceSpec> {
    let op = &config.op_stack;
    let ports = op.ports;
    let l2_rpc = format!("http://127.0.0.1:{}", ports.geth_http);
    let rollup_rpc = format!("http://127.0.0.1:{}", ports.op_node_rpc);

    let service = |name: &str, executable: &str, description: &str| {
        ServiceSpec::new(name, &layout.root, executable)
            .description(description)
            .user("${USERNAME}")
            .environment_file(&layout.env_file)
            .log_dir(&config.service_log_dir)
    };

    vec![
        service("op-geth", &op.binaries.geth, "OP Stack execution client (op-geth)").args(
            GethCmdBuilder::new(&layout.datadir, &layout.jwt_secret, "${L2_CHAIN_ID}")
                .http("0.0.0.0", ports.geth_http)
                .ws_port(ports.geth_ws)
                .authrpc_port(ports.geth_authrpc)
                .gcmode(op.gcmode.as_str())
                .extra_args(&op.extra_args.geth)
                .build(),
        ),
        service("op-node", &op.binaries.op_node, "OP Stack rollup node (op-node)")
            .after("op-geth")
            .args(
                OpNodeCmdBuilder::new(
                    "${L1_RPC_URL}",
                    op.l1_beacon_url.as_str(),
                    format!("http://127.0.0.1:{}", ports.geth_authrpc),
                    &layout.jwt_secret,
                    &layout.rollup,
                )
                .rpc_port(ports.op_node_rpc)
                .l1_confs(op.l1_confs)
                .extra_args(&op.extra_args.op_node)
                .build(),
            ),
        service("op-batcher", &op.binaries.op_batcher, "OP Stack batch submitter (op-batcher)")
            .after("op-node")
            .args(
                OpBatcherCmdBuilder::new("${L1_RPC_URL}", l2_rpc.as_str(), rollup_rpc.as_str())
                    .rpc_port(ports.op_batcher_rpc)
                    .data_availability_type(op.data_availability_type.as_str())
                    .max_channel_duration(op.max_channel_duration)
                    .extra_args(&op.extra_args.op_batcher)
                    .build(),
            ),
        service("op-proposer", &op.binaries.op_proposer, "OP Stack output proposer (op-proposer)")
            .after("op-node")
            .args(
                OpProposerCmdBuilder::new("${L1_RPC_URL}", rollup_rpc.as_str(), "${DISPUTE_GAME_FACTORY_ADDRESS}")
                    .game_type(op.game_type)
                    .proposal_interval(op.proposal_interval.as_str())
                    .rpc_port(ports.op_proposer_rpc)
                    .extra_args(&op.extra_args.op_proposer)
                    .build(),
            ),
    ]
}

/// Create the directories the deployment writes into.
struct PrepareDirsTask {
    dirs: Vec<PathBuf>,
}

impl BuiltinTask for PrepareDirsTask {
    fn name(&self) -> &str {
        "prepare-directories"
    }

    fn run(&self, _ctx: &mut PipelineContext) -> anyhow::Result<()> {
        for dir in &self.dirs {
            FsHandler::ensure_dir(dir)?;
        }
        Ok(())
    }
}

/// Point every role of the intent file at the deployment's accounts.
pub struct IntentRolesTask {
    pub intent: PathBuf,
}

impl IntentRolesTask {
    fn update(intent: &mut Table, ctx: &PipelineContext) -> anyhow::Result<()> {
        let address = |role: Role| -> anyhow::Result<Value> {
            Ok(Value::String(ctx.require(&role.address_var())?.to_string()))
        };

        let chains = intent
            .get_mut("chains")
            .and_then(Value::as_array_mut)
            .context("intent.toml has no [[chains]] entry")?;

        for chain in chains {
            let chain = chain
                .as_table_mut()
                .context("[[chains]] entry is not a table")?;

            for key in [
                "baseFeeVaultRecipient",
                "l1FeeVaultRecipient",
                "sequencerFeeVaultRecipient",
            ] {
                chain.insert(key.to_string(), address(Role::Deployer)?);
            }

            // A custom intent leaves these at zero.
            for (key, default) in [
                ("eip1559DenominatorCanyon", 250),
                ("eip1559Denominator", 50),
                ("eip1559Elasticity", 6),
            ] {
                if chain.get(key).and_then(Value::as_integer).unwrap_or(0) == 0 {
                    chain.insert(key.to_string(), Value::Integer(default));
                }
            }

            let roles = chain
                .entry("roles")
                .or_insert(Value::Table(Table::new()))
                .as_table_mut()
                .context("chain roles are not a table")?;

            for (key, role) in [
                ("l1ProxyAdminOwner", Role::Deployer),
                ("l2ProxyAdminOwner", Role::Deployer),
                ("systemConfigOwner", Role::Deployer),
                ("unsafeBlockSigner", Role::Sequencer),
                ("batcher", Role::Batcher),
                ("proposer", Role::Proposer),
                ("challenger", Role::Challenger),
            ] {
                roles.insert(key.to_string(), address(role)?);
            }
        }

        if let Some(superchain) = intent
            .get_mut("superchainRoles")
            .and_then(Value::as_table_mut)
        {
            for (key, role) in [
                ("proxyAdminOwner", Role::Deployer),
                ("protocolVersionsOwner", Role::Deployer),
                ("guardian", Role::Deployer),
                ("challenger", Role::Challenger),
            ] {
                superchain.insert(key.to_string(), address(role)?);
            }
        }

        Ok(())
    }
}

impl BuiltinTask for IntentRolesTask {
    fn name(&self) -> &str {
        "intent-roles"
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(&self.intent)
            .with_context(|| format!("Failed to read intent file {}", self.intent.display()))?;
        let mut intent: Table =
            toml::from_str(&content).context("Failed to parse intent file as TOML")?;

        Self::update(&mut intent, ctx)?;

        let updated = toml::to_string_pretty(&intent).context("Failed to serialize intent file")?;
        if updated == content {
            tracing::debug!(path = %self.intent.display(), "Intent roles already up to date");
            return Ok(());
        }

        FsHandler::write_atomic(&self.intent, updated.as_bytes())?;
        tracing::info!(path = %self.intent.display(), "Intent roles updated with deployment accounts");
        Ok(())
    }
}

/// Shared secret of the Engine API between op-geth and op-node.
pub struct JwtSecretTask {
    pub path: PathBuf,
}

impl JwtSecretTask {
    fn generate() -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        let secret: [u8; 32] = rng.random();
        hex::encode(secret)
    }
}

impl BuiltinTask for JwtSecretTask {
    fn name(&self) -> &str {
        "jwt-secret"
    }

    fn precondition(&self) -> Option<Precondition> {
        Some(Precondition::FileNonEmpty(self.path.clone()))
    }

    fn run(&self, _ctx: &mut PipelineContext) -> anyhow::Result<()> {
        FsHandler::write_private(&self.path, Self::generate().as_bytes())
            .with_context(|| format!("Failed to write JWT secret {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "JWT secret written");
        Ok(())
    }
}

/// Read the DisputeGameFactory proxy address recorded by `op-deployer apply`.
pub struct DisputeGameFactoryTask {
    pub state: PathBuf,
}

impl BuiltinTask for DisputeGameFactoryTask {
    fn name(&self) -> &str {
        "dispute-game-factory"
    }

    fn provides(&self) -> Vec<String> {
        vec![DISPUTE_GAME_FACTORY.to_string()]
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(&self.state)
            .context("Failed to read state.json for DisputeGameFactory address")?;
        let state: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse state.json")?;

        let address = state
            .pointer(DGF_POINTER)
            .and_then(serde_json::Value::as_str)
            .context("DisputeGameFactory address not found in state.json")?;

        tracing::info!(address, "DisputeGameFactory proxy found");
        ctx.set(DISPUTE_GAME_FACTORY, address)?;
        Ok(())
    }
}

/// Environment file read by every service. Carries their private keys, so
/// none of them ends up in a unit file or a process listing.
pub struct ServicesEnvTask {
    pub path: PathBuf,
}

impl ServicesEnvTask {
    fn render(ctx: &PipelineContext) -> anyhow::Result<String> {
        let key = |role: Role| -> anyhow::Result<String> {
            Ok(ctx.require(&role.private_key_var())?.to_string())
        };

        let entries = [
            (L1_RPC_URL, ctx.require(L1_RPC_URL)?.to_string()),
            (L1_CHAIN_ID, ctx.require(L1_CHAIN_ID)?.to_string()),
            (L2_CHAIN_ID, ctx.require(L2_CHAIN_ID)?.to_string()),
            (DISPUTE_GAME_FACTORY, ctx.require(DISPUTE_GAME_FACTORY)?.to_string()),
            (
                "OP_NODE_P2P_SEQUENCER_KEY",
                key(Role::Sequencer)?.trim_start_matches("0x").to_string(),
            ),
            ("OP_BATCHER_PRIVATE_KEY", key(Role::Batcher)?),
            ("OP_PROPOSER_PRIVATE_KEY", key(Role::Proposer)?),
        ];

        let mut content = String::from("# Generated by rollstack. Read by the OP Stack services.\n");
        for (name, value) in entries {
            content.push_str(&format!("{name}={value}\n"));
        }
        Ok(content)
    }
}

impl BuiltinTask for ServicesEnvTask {
    fn name(&self) -> &str {
        "services-env"
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let content = Self::render(ctx)?;
        FsHandler::write_private(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}
