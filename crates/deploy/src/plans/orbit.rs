//! Arbitrum Orbit chain deployment.
//!
//! Clones the setup scripts, fills their `.env`, deploys the rollup contracts
//! with `yarn dev`, feeds the deployment transaction hash back into `.env`,
//! generates the node configuration and starts the node with Docker Compose.

use std::time::Duration;

use crate::{
    config::DeployConfig,
    credentials::{CredentialStore, Role},
    extract::Pattern,
    orchestrator::{ArgKind, Pipeline},
    patch::ConfigPatch,
    readiness::ReadinessProbe,
    step::{CommandSpec, Precondition, Step},
};

use super::{CredentialsTask, SaveConfigTask, SummaryTask, address_keys};

pub const CHAIN_ID: &str = "CHAIN_ID";
pub const CHAIN_NAME: &str = "CHAIN_NAME";

/// Context key of the rollup deployment transaction hash.
pub const TX_HASH: &str = "TX_HASH";

const ROLES: [Role; 1] = [Role::Deployer];

pub fn pipeline(config: &DeployConfig) -> Pipeline {
    let orbit = &config.orbit;
    let repo_dir = config.workdir.join(&orbit.repo_dir);
    let env_file = repo_dir.join(".env");
    let in_repo = |program: &str| CommandSpec::new(program).cwd(&repo_dir);

    let mut pipeline = Pipeline::new("orbit")
        .argument(CHAIN_ID, ArgKind::ChainId)
        .argument(CHAIN_NAME, ArgKind::Name)
        .requires_root()
        .task(SaveConfigTask::new(config.clone()))
        .command(
            Step::new(
                "clone",
                CommandSpec::new("git")
                    .args(["clone", "--depth", "1"])
                    .arg(orbit.repo_url.as_str())
                    .arg(repo_dir.display().to_string()),
            )
            .skip_if(Precondition::DirExists(repo_dir.clone())),
        )
        .command(
            Step::new("install-dependencies", in_repo("yarn").arg("install"))
                .skip_if(Precondition::DirExists(repo_dir.join("node_modules"))),
        )
        .task(CredentialsTask::new(
            CredentialStore::new(config.credentials_file(), ROLES).with_env_overrides(),
        ))
        .command(
            Step::new("prepare-env", in_repo("cp").args([".env.example", ".env"]))
                .skip_if(Precondition::FileExists(env_file.clone())),
        )
        .patch(
            "configure-env",
            ConfigPatch::new(&env_file)
                .set(CHAIN_ID, "${CHAIN_ID}")
                .set(CHAIN_NAME, "${CHAIN_NAME}")
                .set("PARENT_CHAIN_RPC", orbit.parent_chain_rpc.as_str())
                .set("DEPLOYER_PRIVATE_KEY", "${DEPLOYER_PRIVATE_KEY}")
                .delete(TX_HASH)
                .private(),
        )
        .command(
            Step::new("deploy-rollup", in_repo("yarn").arg("dev"))
                .capture(TX_HASH, Pattern::TxHash)
                .timeout(Duration::from_secs(orbit.deploy_timeout_secs)),
        )
        .patch(
            "record-tx-hash",
            ConfigPatch::new(&env_file)
                .insert(TX_HASH, "${TX_HASH}")
                .private(),
        )
        .command(Step::new(
            "prepare-node-config",
            in_repo("yarn").arg("prepare-node-config"),
        ))
        .command(Step::new(
            "start-node",
            in_repo("docker").args(["compose", "up", "-d"]),
        ))
        .finalize(SummaryTask::new(
            config.workdir.join("orbit-deployment.toml"),
            [CHAIN_ID, CHAIN_NAME, TX_HASH]
                .into_iter()
                .map(String::from)
                .chain(address_keys(&ROLES)),
        ));

    if let Some(url) = &orbit.node_rpc_url {
        pipeline = pipeline.probe(ReadinessProbe::json_rpc(url.as_str()).with_chain_id("${CHAIN_ID}"));
    }

    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let pipeline = pipeline(&DeployConfig::default());
        let names: Vec<&str> = pipeline.stage_names().collect();
        assert_eq!(
            names,
            vec![
                "save-config",
                "clone",
                "install-dependencies",
                "credentials",
                "prepare-env",
                "configure-env",
                "deploy-rollup",
                "record-tx-hash",
                "prepare-node-config",
                "start-node",
            ]
        );
        assert!(pipeline.requires_root);
        assert_eq!(pipeline.probes.len(), 1);
        assert!(pipeline.services.is_empty());
    }
}
