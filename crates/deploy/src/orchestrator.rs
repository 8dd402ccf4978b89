//! Deployment pipeline definition and the state machine that runs it.
//!
//! A run goes `Validating → Provisioning(stage) → Finalizing → Done`, or to
//! `Aborted` on the first error. Validation has no side effects: the run log
//! is only opened once the arguments, privileges and every template of the
//! pipeline have been checked.

use std::{
    ffi::OsString,
    fmt,
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use regex::Regex;
use tokio::sync::watch;

use crate::{
    context::PipelineContext,
    error::{ContextError, DeployError, ValidationError},
    extract::extract,
    guard::IdempotencyGuard,
    patch::{ConfigPatch, patch, patch_private},
    provision::{InitSystem, ProvisionReport, ServiceProvisioner, ServiceSpec},
    readiness::{ReadinessPolicy, ReadinessProbe, wait_ready},
    runlog::RunLog,
    runner::{CommandExecutor, StepRunner},
    step::{Precondition, Step},
};

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex"));

/// Placeholder stored in the shadow context while checking templates.
const PENDING: &str = "<pending>";

/// Expected shape of a positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Any non-empty value.
    Text,
    /// A positive decimal chain ID.
    ChainId,
    /// An `http(s)://` or `ws(s)://` endpoint.
    Url,
    /// A name usable in file paths and unit files (chain name, user name).
    Name,
}

/// A positional argument the pipeline requires in its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argument {
    pub name: &'static str,
    pub kind: ArgKind,
}

impl Argument {
    fn check(&self, value: &str) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidArgument {
            name: self.name.to_string(),
            reason: reason.to_string(),
        };

        match self.kind {
            ArgKind::Text => Ok(()),
            ArgKind::ChainId => match value.parse::<u64>() {
                Ok(0) => Err(invalid("chain ID must be positive")),
                Ok(_) => Ok(()),
                Err(_) => Err(invalid("expected a decimal chain ID")),
            },
            ArgKind::Url => {
                let url = url::Url::parse(value).map_err(|e| invalid(&e.to_string()))?;
                match url.scheme() {
                    "http" | "https" | "ws" | "wss" => Ok(()),
                    scheme => Err(invalid(&format!("unsupported scheme `{scheme}`"))),
                }
            }
            ArgKind::Name => {
                if NAME.is_match(value) {
                    Ok(())
                } else {
                    Err(invalid("only letters, digits, `_`, `.` and `-` are allowed"))
                }
            }
        }
    }
}

/// Work done in-process rather than by an external command.
pub trait BuiltinTask: Send + Sync {
    fn name(&self) -> &str;

    /// Skip the task when this already holds.
    fn precondition(&self) -> Option<Precondition> {
        None
    }

    /// Context keys this task sets, so later templates may reference them.
    fn provides(&self) -> Vec<String> {
        Vec::new()
    }

    fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<()>;
}

/// One entry of the provisioning sequence.
pub enum Stage {
    Command(Step),
    Patch { name: String, patch: ConfigPatch },
    Task(Box<dyn BuiltinTask>),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::Command(step) => &step.name,
            Stage::Patch { name, .. } => name,
            Stage::Task(task) => task.name(),
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            Stage::Command(_) => StageKind::Command,
            Stage::Patch { .. } => StageKind::Patch,
            Stage::Task(_) => StageKind::Task,
        }
    }

    /// Resolve every template of the stage against `ctx` without running it.
    fn check_templates(&self, ctx: &PipelineContext) -> Result<(), ContextError> {
        match self {
            Stage::Command(step) => step.resolve(ctx).map(|_| ()),
            Stage::Patch { patch, .. } => patch.resolve(ctx).map(|_| ()),
            Stage::Task(_) => Ok(()),
        }
    }

    fn provides(&self) -> Vec<String> {
        match self {
            Stage::Command(step) => step.capture.iter().map(|c| c.key.clone()).collect(),
            Stage::Patch { .. } => Vec::new(),
            Stage::Task(task) => task.provides(),
        }
    }
}

/// A complete deployment: arguments, ordered stages and the services it leaves running.
pub struct Pipeline {
    pub name: String,
    pub arguments: Vec<Argument>,
    pub requires_root: bool,
    pub stages: Vec<Stage>,
    pub services: Vec<ServiceSpec>,
    pub probes: Vec<ReadinessProbe>,
    /// Tasks run once services are up and ready.
    pub finalize: Vec<Box<dyn BuiltinTask>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            requires_root: false,
            stages: Vec::new(),
            services: Vec::new(),
            probes: Vec::new(),
            finalize: Vec::new(),
        }
    }

    pub fn argument(mut self, name: &'static str, kind: ArgKind) -> Self {
        self.arguments.push(Argument { name, kind });
        self
    }

    pub fn requires_root(mut self) -> Self {
        self.requires_root = true;
        self
    }

    pub fn command(mut self, step: Step) -> Self {
        self.stages.push(Stage::Command(step));
        self
    }

    pub fn patch(mut self, name: impl Into<String>, patch: ConfigPatch) -> Self {
        self.stages.push(Stage::Patch {
            name: name.into(),
            patch,
        });
        self
    }

    pub fn task(mut self, task: impl BuiltinTask + 'static) -> Self {
        self.stages.push(Stage::Task(Box::new(task)));
        self
    }

    pub fn service(mut self, spec: ServiceSpec) -> Self {
        self.services.push(spec);
        self
    }

    pub fn probe(mut self, probe: ReadinessProbe) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn finalize(mut self, task: impl BuiltinTask + 'static) -> Self {
        self.finalize.push(Box::new(task));
        self
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(Stage::name)
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Validating,
    Provisioning { stage: String },
    Finalizing,
    Done,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Validating => write!(f, "validating"),
            PipelineState::Provisioning { stage } => write!(f, "provisioning ({stage})"),
            PipelineState::Finalizing => write!(f, "finalizing"),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StageKind {
    Command,
    Patch,
    Task,
}

/// What happened to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StageStatus {
    /// Executed successfully.
    Ran,
    /// Precondition already held.
    Skipped,
    /// Patch applied, file rewritten.
    Patched,
    /// Patch applied, file already up to date.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub state: PipelineState,
    pub stages: Vec<StageOutcome>,
    pub services: ProvisionReport,
    pub log_path: Option<PathBuf>,
    pub context: PipelineContext,
}

/// Cooperative cancellation, checked between stages. A running command
/// stage is interrupted.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Knobs of a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory of the run log. `None` keeps the log in `tracing` only.
    pub log_dir: Option<PathBuf>,
    /// Whether the caller has root privileges (or chose to skip the check).
    pub privileged: bool,
    pub readiness: ReadinessPolicy,
    /// Overrides `PATH` for binary preconditions.
    pub search_path: Option<OsString>,
    pub cancel: CancelToken,
}

/// Runs a [`Pipeline`] against external commands and an init system.
pub struct Orchestrator<E, I> {
    executor: E,
    init: I,
    options: RunOptions,
}

impl<E: CommandExecutor, I: InitSystem> Orchestrator<E, I> {
    pub fn new(executor: E, init: I, options: RunOptions) -> Self {
        Self {
            executor,
            init,
            options,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.options.cancel
    }

    /// Run `pipeline` with `ctx` holding its positional arguments.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        mut ctx: PipelineContext,
    ) -> Result<PipelineReport, DeployError> {
        tracing::info!(pipeline = %pipeline.name, state = %PipelineState::Validating, "Starting deployment");

        if let Err(e) = self.validate(pipeline, &ctx) {
            tracing::error!(pipeline = %pipeline.name, state = %PipelineState::Aborted, err = %e, "Validation failed");
            return Err(e);
        }

        let log = match &self.options.log_dir {
            Some(dir) => RunLog::open(RunLog::default_path(dir)).map_err(|error| DeployError::Task {
                stage: "run log".to_string(),
                error,
            })?,
            None => RunLog::disabled(),
        };
        if let Some(path) = log.path() {
            tracing::info!(path = %path.display(), "Run log opened");
        }
        log.info(format!("Starting {} deployment", pipeline.name));

        let mut report = PipelineReport {
            pipeline: pipeline.name.clone(),
            state: PipelineState::Validating,
            stages: Vec::new(),
            services: ProvisionReport::default(),
            log_path: log.path().map(PathBuf::from),
            context: PipelineContext::new(),
        };

        match self.execute(pipeline, &mut ctx, &log, &mut report).await {
            Ok(()) => {
                self.transition(&mut report.state, PipelineState::Done);
                log.success(format!("{} deployment complete", pipeline.name));
                report.context = ctx;
                Ok(report)
            }
            Err(e) => {
                let at = report.state.clone();
                self.transition(&mut report.state, PipelineState::Aborted);
                log.error(format!("Deployment aborted while {at}: {e}"));
                Err(e)
            }
        }
    }

    /// Pre-flight checks. Performs no side effect.
    fn validate(&self, pipeline: &Pipeline, ctx: &PipelineContext) -> Result<(), DeployError> {
        for argument in &pipeline.arguments {
            let value = ctx
                .require(argument.name)
                .map_err(|_| ValidationError::MissingArgument(argument.name.to_string()))?;
            argument.check(value)?;
        }

        if pipeline.requires_root && !self.options.privileged {
            return Err(ValidationError::InsufficientPrivilege.into());
        }

        // Every template must be resolvable by the time its stage runs.
        let mut shadow = ctx.clone();
        for stage in &pipeline.stages {
            stage
                .check_templates(&shadow)
                .map_err(|source| DeployError::Context {
                    stage: stage.name().to_string(),
                    source,
                })?;
            for key in stage.provides() {
                if !shadow.contains_key(&key) {
                    shadow.overwrite(key, PENDING);
                }
            }
        }
        for spec in &pipeline.services {
            spec.resolve(&shadow).map_err(|source| DeployError::Context {
                stage: spec.name.clone(),
                source,
            })?;
        }
        for probe in &pipeline.probes {
            probe.resolve(&shadow).map_err(|source| DeployError::Context {
                stage: probe.to_string(),
                source,
            })?;
        }

        Ok(())
    }

    async fn execute(
        &self,
        pipeline: &Pipeline,
        ctx: &mut PipelineContext,
        log: &RunLog,
        report: &mut PipelineReport,
    ) -> Result<(), DeployError> {
        let mut guard = IdempotencyGuard::new(log);
        if let Some(search_path) = &self.options.search_path {
            guard = guard.with_search_path(search_path.clone());
        }
        let runner = StepRunner::new(&self.executor, log);

        for stage in &pipeline.stages {
            self.check_cancelled(stage.name(), log)?;
            self.transition(
                &mut report.state,
                PipelineState::Provisioning {
                    stage: stage.name().to_string(),
                },
            );

            let status = match stage {
                Stage::Command(step) => {
                    tokio::select! {
                        status = self.run_step(step, ctx, &guard, &runner, log) => status?,
                        () = self.options.cancel.cancelled() => {
                            log.warn(format!("Cancellation requested, stopping {}", step.name));
                            return Err(DeployError::Interrupted(step.name.clone()));
                        }
                    }
                }
                Stage::Patch { name, patch } => apply_patch(name, patch, ctx, log)?,
                Stage::Task(task) => run_task(task.as_ref(), ctx, &guard, log)?,
            };

            report.stages.push(StageOutcome {
                name: stage.name().to_string(),
                kind: stage.kind(),
                status,
            });
        }

        self.check_cancelled("finalizing", log)?;
        self.transition(&mut report.state, PipelineState::Finalizing);

        if !pipeline.services.is_empty() {
            let specs = pipeline
                .services
                .iter()
                .map(|spec| {
                    spec.resolve(ctx).map_err(|source| DeployError::Context {
                        stage: spec.name.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            report.services = ServiceProvisioner::new(&self.init, log)
                .provision(&specs)
                .await?;
        }

        for probe in &pipeline.probes {
            let probe = probe.resolve(ctx).map_err(|source| DeployError::Context {
                stage: probe.to_string(),
                source,
            })?;
            log.info(format!("Waiting for {probe}"));
            wait_ready(&probe, &self.options.readiness)
                .await
                .inspect_err(|e| log.error(e.to_string()))?;
            log.success(format!("{probe} is ready"));
        }

        for task in &pipeline.finalize {
            self.check_cancelled(task.name(), log)?;
            run_task(task.as_ref(), ctx, &guard, log)?;
        }

        Ok(())
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut PipelineContext,
        guard: &IdempotencyGuard<'_>,
        runner: &StepRunner<'_, E>,
        log: &RunLog,
    ) -> Result<StageStatus, DeployError> {
        if guard.should_skip(step) {
            return Ok(StageStatus::Skipped);
        }

        let resolved = step.resolve(ctx).map_err(|source| DeployError::Context {
            stage: step.name.clone(),
            source,
        })?;
        let output = runner.run(&resolved).await?;

        if let Some(capture) = &step.capture {
            let value = extract(&output.combined, &capture.pattern).map_err(|source| {
                log.error(format!("[{}] Could not extract {}: {}", step.name, capture.key, source));
                DeployError::Extraction {
                    step: step.name.clone(),
                    source,
                }
            })?;

            log.info(format!("[{}] Captured {}={}", step.name, capture.key, value));
            if capture.overwrite {
                ctx.overwrite(capture.key.clone(), value);
            } else {
                ctx.set(capture.key.clone(), value)
                    .map_err(|source| DeployError::Context {
                        stage: step.name.clone(),
                        source,
                    })?;
            }
        }

        Ok(StageStatus::Ran)
    }

    fn check_cancelled(&self, next: &str, log: &RunLog) -> Result<(), DeployError> {
        if self.options.cancel.is_cancelled() {
            log.warn(format!("Cancellation requested, stopping before {next}"));
            return Err(DeployError::Cancelled(next.to_string()));
        }
        Ok(())
    }

    fn transition(&self, state: &mut PipelineState, next: PipelineState) {
        tracing::debug!(from = %state, to = %next, "Pipeline state transition");
        *state = next;
    }
}

fn apply_patch(
    name: &str,
    config: &ConfigPatch,
    ctx: &PipelineContext,
    log: &RunLog,
) -> Result<StageStatus, DeployError> {
    let resolved = config.resolve(ctx).map_err(|source| DeployError::Context {
        stage: name.to_string(),
        source,
    })?;

    log.info(format!(
        "[{name}] Patching {} ({} change(s))",
        resolved.target_file.display(),
        resolved.ops.len()
    ));
    let summary = if resolved.private {
        patch_private(&resolved.target_file, &resolved.ops)
    } else {
        patch(&resolved.target_file, &resolved.ops)
    }
    .inspect_err(|e| log.error(e.to_string()))?;

    for key in &summary.missing {
        log.warn(format!(
            "[{name}] Key {key} not present in {}, left absent",
            resolved.target_file.display()
        ));
    }

    if summary.changed {
        log.success(format!("[{name}] Patched"));
        Ok(StageStatus::Patched)
    } else {
        log.info(format!("[{name}] Already up to date"));
        Ok(StageStatus::Unchanged)
    }
}

fn run_task(
    task: &dyn BuiltinTask,
    ctx: &mut PipelineContext,
    guard: &IdempotencyGuard<'_>,
    log: &RunLog,
) -> Result<StageStatus, DeployError> {
    if task.precondition().is_some_and(|p| guard.holds(&p)) {
        log.info(format!("[{}] Already present, skipping", task.name()));
        return Ok(StageStatus::Skipped);
    }

    log.info(format!("[{}] Running", task.name()));
    task.run(ctx).map_err(|error| {
        log.error(format!("[{}] Failed: {error:#}", task.name()));
        DeployError::Task {
            stage: task.name().to_string(),
            error,
        }
    })?;
    log.success(format!("[{}] Completed", task.name()));

    Ok(StageStatus::Ran)
}
