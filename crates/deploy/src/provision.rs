//! Service provisioning through the init system.
//!
//! Each [`ServiceSpec`] is rendered into a systemd unit, written to the unit
//! directory, then enabled and started. Services are independent: a failure
//! on one of them is recorded and the next one is still attempted.

use std::{
    fmt::Write as _,
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    context::PipelineContext,
    error::{ContextError, ProvisionFailure},
    fs::FsHandler,
    runlog::RunLog,
    runner::CommandExecutor,
    step::CommandSpec,
};

/// Default directory for unit files.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Default directory service output is appended to.
pub const DEFAULT_SERVICE_LOG_DIR: &str = "/var/log/rollstack";

/// Default delay before restarting a failed service.
pub const DEFAULT_RESTART_BACKOFF_SECS: u64 = 5;

/// How the init system supervises a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "policy")]
pub enum RestartPolicy {
    No,
    OnFailure { backoff_secs: u64 },
    Always { backoff_secs: u64 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure {
            backoff_secs: DEFAULT_RESTART_BACKOFF_SECS,
        }
    }
}

/// A long-running process handed to the init system.
///
/// String fields may contain `${KEY}` placeholders, resolved with
/// [`ServiceSpec::resolve`] once the pipeline has produced every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub working_directory: PathBuf,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_file: Option<PathBuf>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub log_file: PathBuf,
    /// Units this service starts after.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl ServiceSpec {
    /// A service named `name` running `executable`, logging under [`DEFAULT_SERVICE_LOG_DIR`].
    pub fn new(
        name: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        executable: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            log_file: Path::new(DEFAULT_SERVICE_LOG_DIR).join(format!("{name}.log")),
            name,
            user: None,
            working_directory: working_directory.into(),
            executable: executable.into(),
            args: Vec::new(),
            environment_file: None,
            restart_policy: RestartPolicy::default(),
            after: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn environment_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.environment_file = Some(path.into());
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn log_dir(mut self, dir: &Path) -> Self {
        self.log_file = dir.join(format!("{}.log", self.name));
        self
    }

    pub fn after(mut self, unit: impl Into<String>) -> Self {
        self.after.push(unit.into());
        self
    }

    /// Resolve every placeholder against `ctx`.
    pub fn resolve(&self, ctx: &PipelineContext) -> Result<ServiceSpec, ContextError> {
        let render_path = |path: &Path| ctx.render(&path.to_string_lossy()).map(PathBuf::from);

        Ok(ServiceSpec {
            name: self.name.clone(),
            description: ctx.render(&self.description)?,
            user: self.user.as_deref().map(|u| ctx.render(u)).transpose()?,
            working_directory: render_path(self.working_directory.as_path())?,
            executable: ctx.render(&self.executable)?,
            args: self
                .args
                .iter()
                .map(|arg| ctx.render(arg))
                .collect::<Result<_, _>>()?,
            environment_file: self
                .environment_file
                .as_deref()
                .map(|path| render_path(path))
                .transpose()?,
            restart_policy: self.restart_policy,
            log_file: render_path(self.log_file.as_path())?,
            after: self.after.clone(),
        })
    }

    /// Render the systemd unit description.
    pub fn render_unit(&self) -> String {
        let mut unit = String::new();

        let mut after = vec!["network-online.target".to_string()];
        after.extend(self.after.iter().map(|name| unit_file_name(name)));

        let _ = writeln!(unit, "[Unit]");
        let _ = writeln!(unit, "Description={}", self.description);
        let _ = writeln!(unit, "After={}", after.join(" "));
        let _ = writeln!(unit, "Wants=network-online.target");
        let _ = writeln!(unit);
        let _ = writeln!(unit, "[Service]");
        let _ = writeln!(unit, "Type=simple");
        if let Some(user) = &self.user {
            let _ = writeln!(unit, "User={user}");
        }
        let _ = writeln!(unit, "WorkingDirectory={}", self.working_directory.display());
        if let Some(env_file) = &self.environment_file {
            let _ = writeln!(unit, "EnvironmentFile={}", env_file.display());
        }

        let mut exec_start = quote_exec_arg(&self.executable);
        for arg in &self.args {
            exec_start.push(' ');
            exec_start.push_str(&quote_exec_arg(arg));
        }
        let _ = writeln!(unit, "ExecStart={exec_start}");

        match self.restart_policy {
            RestartPolicy::No => {
                let _ = writeln!(unit, "Restart=no");
            }
            RestartPolicy::OnFailure { backoff_secs } => {
                let _ = writeln!(unit, "Restart=on-failure");
                let _ = writeln!(unit, "RestartSec={backoff_secs}");
            }
            RestartPolicy::Always { backoff_secs } => {
                let _ = writeln!(unit, "Restart=always");
                let _ = writeln!(unit, "RestartSec={backoff_secs}");
            }
        }

        let _ = writeln!(unit, "StandardOutput=append:{}", self.log_file.display());
        let _ = writeln!(unit, "StandardError=append:{}", self.log_file.display());
        let _ = writeln!(unit);
        let _ = writeln!(unit, "[Install]");
        let _ = writeln!(unit, "WantedBy=multi-user.target");

        unit
    }
}

/// `<name>.service`, unless `name` already carries a unit suffix.
pub fn unit_file_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

/// Quote one `ExecStart=` word following systemd's rules.
pub fn quote_exec_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");

    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if !needs_quotes {
        return escaped;
    }

    let mut quoted = String::with_capacity(escaped.len() + 2);
    quoted.push('"');
    for c in escaped.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// The service-management collaborator.
pub trait InitSystem: Send + Sync {
    /// Persist a unit description. Returns where it was written.
    fn install(&self, unit_name: &str, contents: &str) -> impl Future<Output = anyhow::Result<PathBuf>> + Send;

    /// Make the init system pick up installed units.
    fn reload(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enable the unit at boot and start it now.
    fn enable_and_start(&self, unit_name: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// systemd, driven through `systemctl`.
#[derive(Debug, Clone)]
pub struct Systemd<E> {
    unit_dir: PathBuf,
    executor: E,
}

impl<E: CommandExecutor> Systemd<E> {
    pub fn new(unit_dir: impl Into<PathBuf>, executor: E) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            executor,
        }
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    async fn systemctl(&self, args: &[&str]) -> anyhow::Result<()> {
        let command = CommandSpec::new("systemctl").args(args.iter().copied());
        let output = self
            .executor
            .execute(&command)
            .await
            .with_context(|| format!("Failed to run `{}`", command.display()))?;

        if !output.success() {
            anyhow::bail!(
                "`{}` exited with {:?}: {}",
                command.display(),
                output.exit_code,
                output.combined.trim()
            );
        }

        Ok(())
    }
}

impl<E: CommandExecutor> InitSystem for Systemd<E> {
    async fn install(&self, unit_name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        FsHandler::ensure_dir(&self.unit_dir)?;
        let path = self.unit_dir.join(unit_file_name(unit_name));
        FsHandler::write_atomic(&path, contents.as_bytes())
            .with_context(|| format!("Failed to write unit {}", path.display()))?;
        Ok(path)
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn enable_and_start(&self, unit_name: &str) -> anyhow::Result<()> {
        let unit = unit_file_name(unit_name);
        self.systemctl(&["enable", &unit]).await?;
        self.systemctl(&["start", &unit]).await
    }
}

/// Services that were installed and started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub units: Vec<PathBuf>,
    pub started: Vec<String>,
}

/// Renders, installs and starts services.
pub struct ServiceProvisioner<'a, I> {
    init: &'a I,
    log: &'a RunLog,
}

impl<'a, I: InitSystem> ServiceProvisioner<'a, I> {
    pub fn new(init: &'a I, log: &'a RunLog) -> Self {
        Self { init, log }
    }

    /// Provision every spec, in order.
    ///
    /// A failing service does not prevent the next ones from being attempted;
    /// the result is an error naming every service that failed.
    pub async fn provision(&self, specs: &[ServiceSpec]) -> Result<ProvisionReport, ProvisionFailure> {
        let mut report = ProvisionReport::default();
        let mut failures = Vec::new();
        let mut installed = Vec::new();

        for spec in specs {
            self.log.info(format!("[{}] Installing service unit", spec.name));
            match self.init.install(&spec.name, &spec.render_unit()).await {
                Ok(path) => {
                    tracing::debug!(service = %spec.name, unit = %path.display(), "Unit installed");
                    report.units.push(path);
                    installed.push(spec);
                }
                Err(e) => self.record_failure(&mut failures, &spec.name, e),
            }
        }

        if !installed.is_empty() {
            if let Err(e) = self.init.reload().await {
                for spec in installed.drain(..) {
                    self.record_failure(&mut failures, &spec.name, anyhow::anyhow!("{e:#}"));
                }
            }
        }

        for spec in installed {
            match self.init.enable_and_start(&spec.name).await {
                Ok(()) => {
                    self.log.success(format!("[{}] Service started", spec.name));
                    report.started.push(spec.name.clone());
                }
                Err(e) => self.record_failure(&mut failures, &spec.name, e),
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ProvisionFailure { failures })
        }
    }

    fn record_failure(&self, failures: &mut Vec<(String, String)>, service: &str, err: anyhow::Error) {
        let reason = format!("{err:#}");
        self.log
            .error(format!("[{service}] Service failed to start: {reason}"));
        failures.push((service.to_string(), reason));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use tempdir::TempDir;

    fn geth_spec() -> ServiceSpec {
        ServiceSpec::new("op-geth", "/opt/rollup", "/usr/local/bin/geth")
            .description("OP Stack execution client")
            .user("ubuntu")
            .environment_file("/opt/rollup/.env")
            .args(["--datadir", "/opt/rollup/data", "--http.api", "eth,net web3"])
    }

    #[test]
    fn test_render_unit() {
        let unit = geth_spec().render_unit();

        assert!(unit.starts_with("[Unit]\nDescription=OP Stack execution client\n"));
        assert!(unit.contains("\nUser=ubuntu\n"));
        assert!(unit.contains("\nWorkingDirectory=/opt/rollup\n"));
        assert!(unit.contains("\nEnvironmentFile=/opt/rollup/.env\n"));
        assert!(unit.contains(
            "\nExecStart=/usr/local/bin/geth --datadir /opt/rollup/data --http.api \"eth,net web3\"\n"
        ));
        assert!(unit.contains("\nRestart=on-failure\nRestartSec=5\n"));
        assert!(unit.contains("\nStandardOutput=append:/var/log/rollstack/op-geth.log\n"));
        assert!(unit.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_render_dependencies() {
        let unit = ServiceSpec::new("op-node", "/opt", "op-node")
            .after("op-geth")
            .restart_policy(RestartPolicy::No)
            .render_unit();
        assert!(unit.contains("\nAfter=network-online.target op-geth.service\n"));
        assert!(unit.contains("\nRestart=no\n"));
        assert!(!unit.contains("RestartSec"));
    }

    #[test]
    fn test_quote_exec_arg() {
        assert_eq!(quote_exec_arg("--http"), "--http");
        assert_eq!(quote_exec_arg(""), "\"\"");
        assert_eq!(quote_exec_arg("a b"), "\"a b\"");
        assert_eq!(quote_exec_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_exec_arg("$HOME"), "$$HOME");
        assert_eq!(quote_exec_arg("100%"), "100%%");
    }

    #[test]
    fn test_resolve() {
        let mut ctx = PipelineContext::new();
        ctx.set("USERNAME", "ubuntu").unwrap();
        ctx.set("BATCHER_PRIVATE_KEY", "0xabc").unwrap();

        let spec = ServiceSpec::new("op-batcher", "/opt", "op-batcher")
            .user("${USERNAME}")
            .args(["--private-key", "${BATCHER_PRIVATE_KEY}"])
            .resolve(&ctx)
            .unwrap();
        assert_eq!(spec.user.as_deref(), Some("ubuntu"));
        assert_eq!(spec.args, vec!["--private-key", "0xabc"]);

        let err = ServiceSpec::new("x", "/opt", "${MISSING}").resolve(&ctx).unwrap_err();
        assert_eq!(err, ContextError::Missing("MISSING".to_string()));
    }

    /// Init system recording calls, failing to start the listed units.
    #[derive(Default)]
    struct RecordingInit {
        failing: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl InitSystem for RecordingInit {
        async fn install(&self, unit_name: &str, _contents: &str) -> anyhow::Result<PathBuf> {
            self.calls.lock().unwrap().push(format!("install {unit_name}"));
            Ok(PathBuf::from(unit_file_name(unit_name)))
        }

        async fn reload(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("reload".to_string());
            Ok(())
        }

        async fn enable_and_start(&self, unit_name: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("start {unit_name}"));
            if self.failing.iter().any(|failing| *failing == unit_name) {
                anyhow::bail!("unit {unit_name} exited with status 1");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_services() {
        let init = RecordingInit {
            failing: vec!["op-node"],
            ..Default::default()
        };
        let log = RunLog::disabled();
        let specs = vec![
            ServiceSpec::new("op-geth", "/opt", "geth"),
            ServiceSpec::new("op-node", "/opt", "op-node"),
            ServiceSpec::new("op-batcher", "/opt", "op-batcher"),
        ];

        let failure = ServiceProvisioner::new(&init, &log)
            .provision(&specs)
            .await
            .unwrap_err();

        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].0, "op-node");
        assert_eq!(
            *init.calls.lock().unwrap(),
            vec![
                "install op-geth",
                "install op-node",
                "install op-batcher",
                "reload",
                "start op-geth",
                "start op-node",
                "start op-batcher",
            ]
        );
    }

    #[tokio::test]
    async fn test_all_services_started() {
        let init = RecordingInit::default();
        let log = RunLog::disabled();
        let specs = vec![ServiceSpec::new("op-geth", "/opt", "geth")];

        let report = ServiceProvisioner::new(&init, &log)
            .provision(&specs)
            .await
            .unwrap();
        assert_eq!(report.started, vec!["op-geth".to_string()]);
        assert_eq!(report.units, vec![PathBuf::from("op-geth.service")]);
    }

    #[tokio::test]
    async fn test_systemd_writes_unit_file() {
        let tmp_dir = TempDir::new("rollstack-units").unwrap();
        let systemd = Systemd::new(tmp_dir.path(), crate::runner::SystemExecutor);

        let spec = geth_spec();
        let path = systemd.install(&spec.name, &spec.render_unit()).await.unwrap();

        assert_eq!(path, tmp_dir.path().join("op-geth.service"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), spec.render_unit());
    }
}
