//! Command line builders for the OP Stack services.
//!
//! Builders produce the argument vector only; the executable comes from
//! [`crate::config::OpBinaries`]. Values may contain `${KEY}` placeholders,
//! which are resolved when the service unit is rendered. Private keys are
//! never put on a command line: the services read them from their
//! environment file.

use std::path::{Path, PathBuf};

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Builder for op-geth commands.
#[derive(Debug, Clone)]
pub struct GethCmdBuilder {
    datadir: PathBuf,
    jwt_secret: PathBuf,
    network_id: String,
    http_addr: String,
    http_port: u16,
    ws_port: u16,
    authrpc_port: u16,
    http_api: String,
    gcmode: String,
    extra_args: Vec<String>,
}

impl GethCmdBuilder {
    pub fn new(
        datadir: impl Into<PathBuf>,
        jwt_secret: impl Into<PathBuf>,
        network_id: impl Into<String>,
    ) -> Self {
        Self {
            datadir: datadir.into(),
            jwt_secret: jwt_secret.into(),
            network_id: network_id.into(),
            http_addr: "0.0.0.0".to_string(),
            http_port: 8545,
            ws_port: 8546,
            authrpc_port: 8551,
            http_api: "web3,debug,eth,txpool,net,engine".to_string(),
            gcmode: "archive".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn http(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.http_addr = addr.into();
        self.http_port = port;
        self
    }

    pub fn ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    pub fn authrpc_port(mut self, port: u16) -> Self {
        self.authrpc_port = port;
        self
    }

    /// Set the garbage collection mode (full, archive).
    pub fn gcmode(mut self, mode: impl Into<String>) -> Self {
        self.gcmode = mode.into();
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "--datadir".to_string(),
            path_arg(&self.datadir),
            "--networkid".to_string(),
            self.network_id,
            // HTTP
            "--http".to_string(),
            "--http.addr".to_string(),
            self.http_addr.clone(),
            "--http.port".to_string(),
            self.http_port.to_string(),
            "--http.vhosts".to_string(),
            "*".to_string(),
            "--http.corsdomain".to_string(),
            "*".to_string(),
            "--http.api".to_string(),
            self.http_api.clone(),
            // WebSocket
            "--ws".to_string(),
            "--ws.addr".to_string(),
            self.http_addr,
            "--ws.port".to_string(),
            self.ws_port.to_string(),
            "--ws.origins".to_string(),
            "*".to_string(),
            "--ws.api".to_string(),
            self.http_api,
            // Engine API, only reachable by the local op-node
            "--authrpc.addr".to_string(),
            "127.0.0.1".to_string(),
            "--authrpc.port".to_string(),
            self.authrpc_port.to_string(),
            "--authrpc.vhosts".to_string(),
            "*".to_string(),
            "--authrpc.jwtsecret".to_string(),
            path_arg(&self.jwt_secret),
            "--syncmode".to_string(),
            "full".to_string(),
            "--gcmode".to_string(),
            self.gcmode,
            "--nodiscover".to_string(),
            "--maxpeers".to_string(),
            "0".to_string(),
            "--rollup.disabletxpoolgossip".to_string(),
        ];

        cmd.extend(self.extra_args);
        cmd
    }
}

/// Builder for op-node commands. The node always runs as the sequencer.
#[derive(Debug, Clone)]
pub struct OpNodeCmdBuilder {
    l1_rpc: String,
    l1_beacon: String,
    l2_engine_rpc: String,
    jwt_secret: PathBuf,
    rollup_config: PathBuf,
    rpc_port: u16,
    l1_confs: u64,
    extra_args: Vec<String>,
}

impl OpNodeCmdBuilder {
    pub fn new(
        l1_rpc: impl Into<String>,
        l1_beacon: impl Into<String>,
        l2_engine_rpc: impl Into<String>,
        jwt_secret: impl Into<PathBuf>,
        rollup_config: impl Into<PathBuf>,
    ) -> Self {
        Self {
            l1_rpc: l1_rpc.into(),
            l1_beacon: l1_beacon.into(),
            l2_engine_rpc: l2_engine_rpc.into(),
            jwt_secret: jwt_secret.into(),
            rollup_config: rollup_config.into(),
            rpc_port: 8547,
            l1_confs: 4,
            extra_args: Vec::new(),
        }
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn l1_confs(mut self, confs: u64) -> Self {
        self.l1_confs = confs;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "--l1".to_string(),
            self.l1_rpc,
            "--l1.beacon".to_string(),
            self.l1_beacon,
            "--l1.rpckind".to_string(),
            "standard".to_string(),
            "--l2".to_string(),
            self.l2_engine_rpc,
            "--l2.jwt-secret".to_string(),
            path_arg(&self.jwt_secret),
            "--rollup.config".to_string(),
            path_arg(&self.rollup_config),
            "--rpc.addr".to_string(),
            "0.0.0.0".to_string(),
            "--rpc.port".to_string(),
            self.rpc_port.to_string(),
            "--rpc.enable-admin".to_string(),
            "--p2p.disable".to_string(),
            "--verifier.l1-confs".to_string(),
            self.l1_confs.to_string(),
            // The sequencer key comes from OP_NODE_P2P_SEQUENCER_KEY.
            "--sequencer.enabled".to_string(),
            "--sequencer.l1-confs".to_string(),
            (self.l1_confs + 1).to_string(),
        ];

        cmd.extend(self.extra_args);
        cmd
    }
}

/// Builder for op-batcher commands.
#[derive(Debug, Clone)]
pub struct OpBatcherCmdBuilder {
    l1_eth_rpc: String,
    l2_eth_rpc: String,
    rollup_rpc: String,
    rpc_port: u16,
    data_availability_type: String,
    max_channel_duration: u64,
    sub_safety_margin: u64,
    poll_interval: String,
    extra_args: Vec<String>,
}

impl OpBatcherCmdBuilder {
    pub fn new(
        l1_eth_rpc: impl Into<String>,
        l2_eth_rpc: impl Into<String>,
        rollup_rpc: impl Into<String>,
    ) -> Self {
        Self {
            l1_eth_rpc: l1_eth_rpc.into(),
            l2_eth_rpc: l2_eth_rpc.into(),
            rollup_rpc: rollup_rpc.into(),
            rpc_port: 8548,
            data_availability_type: "blobs".to_string(),
            max_channel_duration: 25,
            sub_safety_margin: 6,
            poll_interval: "1s".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    /// Set the data availability type (blobs, calldata).
    pub fn data_availability_type(mut self, da_type: impl Into<String>) -> Self {
        self.data_availability_type = da_type.into();
        self
    }

    pub fn max_channel_duration(mut self, blocks: u64) -> Self {
        self.max_channel_duration = blocks;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "--l1-eth-rpc".to_string(),
            self.l1_eth_rpc,
            "--l2-eth-rpc".to_string(),
            self.l2_eth_rpc,
            "--rollup-rpc".to_string(),
            self.rollup_rpc,
            "--rpc.addr".to_string(),
            "0.0.0.0".to_string(),
            "--rpc.port".to_string(),
            self.rpc_port.to_string(),
            "--rpc.enable-admin".to_string(),
            "--data-availability-type".to_string(),
            self.data_availability_type,
            "--max-channel-duration".to_string(),
            self.max_channel_duration.to_string(),
            "--sub-safety-margin".to_string(),
            self.sub_safety_margin.to_string(),
            "--poll-interval".to_string(),
            self.poll_interval,
            "--num-confirmations".to_string(),
            "1".to_string(),
            "--safe-abort-nonce-too-low-count".to_string(),
            "3".to_string(),
            "--resubmission-timeout".to_string(),
            "30s".to_string(),
        ];

        cmd.extend(self.extra_args);
        cmd
    }
}

/// Builder for op-proposer commands.
#[derive(Debug, Clone)]
pub struct OpProposerCmdBuilder {
    l1_eth_rpc: String,
    rollup_rpc: String,
    game_factory_address: String,
    game_type: u32,
    proposal_interval: String,
    rpc_port: u16,
    extra_args: Vec<String>,
}

impl OpProposerCmdBuilder {
    pub fn new(
        l1_eth_rpc: impl Into<String>,
        rollup_rpc: impl Into<String>,
        game_factory_address: impl Into<String>,
    ) -> Self {
        Self {
            l1_eth_rpc: l1_eth_rpc.into(),
            rollup_rpc: rollup_rpc.into(),
            game_factory_address: game_factory_address.into(),
            game_type: 1,
            proposal_interval: "1h".to_string(),
            rpc_port: 8560,
            extra_args: Vec::new(),
        }
    }

    pub fn game_type(mut self, game_type: u32) -> Self {
        self.game_type = game_type;
        self
    }

    pub fn proposal_interval(mut self, interval: impl Into<String>) -> Self {
        self.proposal_interval = interval.into();
        self
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "--l1-eth-rpc".to_string(),
            self.l1_eth_rpc,
            "--rollup-rpc".to_string(),
            self.rollup_rpc,
            "--game-factory-address".to_string(),
            self.game_factory_address,
            "--game-type".to_string(),
            self.game_type.to_string(),
            "--proposal-interval".to_string(),
            self.proposal_interval,
            "--poll-interval".to_string(),
            "12s".to_string(),
            "--rpc.port".to_string(),
            self.rpc_port.to_string(),
            "--num-confirmations".to_string(),
            "1".to_string(),
        ];

        cmd.extend(self.extra_args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of<'a>(cmd: &'a [String], flag: &str) -> Option<&'a str> {
        cmd.iter()
            .position(|arg| arg == flag)
            .and_then(|i| cmd.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_geth_cmd_builder() {
        let cmd = GethCmdBuilder::new("/opt/rollstack/op-stack/datadir", "/opt/rollstack/op-stack/jwt.txt", "${L2_CHAIN_ID}")
            .http("0.0.0.0", 9545)
            .build();

        assert_eq!(value_of(&cmd, "--networkid"), Some("${L2_CHAIN_ID}"));
        assert_eq!(value_of(&cmd, "--http.port"), Some("9545"));
        assert_eq!(value_of(&cmd, "--authrpc.addr"), Some("127.0.0.1"));
        assert_eq!(
            value_of(&cmd, "--authrpc.jwtsecret"),
            Some("/opt/rollstack/op-stack/jwt.txt")
        );
        assert!(cmd.contains(&"--rollup.disabletxpoolgossip".to_string()));
    }

    #[test]
    fn test_op_node_cmd_builder() {
        let sequencer = OpNodeCmdBuilder::new(
            "${L1_RPC_URL}",
            "${L1_RPC_URL}",
            "http://127.0.0.1:8551",
            "/data/jwt.txt",
            "/data/rollup.json",
        )
        .build();
        assert_eq!(value_of(&sequencer, "--l1"), Some("${L1_RPC_URL}"));
        assert_eq!(value_of(&sequencer, "--sequencer.l1-confs"), Some("5"));
        assert!(sequencer.contains(&"--sequencer.enabled".to_string()));

        let cautious = OpNodeCmdBuilder::new("l1", "beacon", "engine", "jwt", "rollup")
            .l1_confs(10)
            .build();
        assert_eq!(value_of(&cautious, "--verifier.l1-confs"), Some("10"));
        assert_eq!(value_of(&cautious, "--sequencer.l1-confs"), Some("11"));
    }

    #[test]
    fn test_op_batcher_cmd_builder() {
        let cmd = OpBatcherCmdBuilder::new(
            "http://localhost:8545",
            "http://localhost:9545",
            "http://localhost:7545",
        )
        .data_availability_type("calldata")
        .max_channel_duration(5)
        .build();

        assert_eq!(value_of(&cmd, "--data-availability-type"), Some("calldata"));
        assert_eq!(value_of(&cmd, "--max-channel-duration"), Some("5"));
        assert!(!cmd.iter().any(|arg| arg.contains("private-key")));
    }

    #[test]
    fn test_op_proposer_cmd_builder() {
        let cmd = OpProposerCmdBuilder::new("l1", "rollup", "${DISPUTE_GAME_FACTORY_ADDRESS}")
            .game_type(254)
            .proposal_interval("10m")
            .extra_args(["--allow-non-finalized"])
            .build();

        assert_eq!(
            value_of(&cmd, "--game-factory-address"),
            Some("${DISPUTE_GAME_FACTORY_ADDRESS}")
        );
        assert_eq!(value_of(&cmd, "--game-type"), Some("254"));
        assert_eq!(cmd.last().map(String::as_str), Some("--allow-non-finalized"));
    }
}
