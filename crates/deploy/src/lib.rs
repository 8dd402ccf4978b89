//! rollstack-deploy - Deployment library for rollup chains.
//!
//! A deployment is a [`Pipeline`]: validated arguments, an ordered list of
//! idempotent stages, the services it leaves running under systemd and the
//! readiness probes that confirm they came up.

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod extract;
mod fs;
pub mod guard;
pub mod orchestrator;
pub mod patch;
pub mod plans;
pub mod provision;
pub mod readiness;
pub mod rpc;
pub mod runlog;
pub mod runner;
pub mod step;

pub use config::{CONFIG_FILENAME, DeployConfig, OpStackConfig, OrbitConfig};
pub use context::PipelineContext;
pub use credentials::{Account, CredentialStore, Credentials, Role};
pub use error::{ContextError, DeployError, ValidationError};
pub use fs::FsHandler;
pub use orchestrator::{
    ArgKind, BuiltinTask, CancelToken, Orchestrator, Pipeline, PipelineReport, PipelineState,
    RunOptions, StageKind, StageOutcome, StageStatus,
};
pub use plans::Plan;
pub use provision::{InitSystem, ServiceSpec, Systemd};
pub use readiness::{ReadinessPolicy, ReadinessProbe};
pub use runner::{CommandExecutor, CommandOutput, SystemExecutor};
pub use step::{CommandSpec, Precondition, Step};
