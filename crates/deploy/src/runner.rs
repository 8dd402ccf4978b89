//! Execution of external commands.

use std::{future::Future, io, process::Stdio, sync::Arc};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    error::StepFailure,
    fs::FsHandler,
    runlog::RunLog,
    step::{CommandSpec, Step},
};

/// Number of trailing output lines surfaced when a step fails.
pub const LOG_EXCERPT_LINES: usize = 20;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Standard output only.
    pub stdout: String,
    /// Standard output and standard error, interleaved in arrival order.
    pub combined: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a fully resolved command and captures its output.
///
/// This is the seam between the pipeline and the outside world: the
/// [`SystemExecutor`] spawns real processes, tests script their own.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &CommandSpec) -> impl Future<Output = io::Result<CommandOutput>> + Send;
}

impl<T: CommandExecutor> CommandExecutor for Arc<T> {
    fn execute(&self, command: &CommandSpec) -> impl Future<Output = io::Result<CommandOutput>> + Send {
        (**self).execute(command)
    }
}

/// Spawns commands as child processes of this one.
///
/// Each command leads its own process group. When the execution future is
/// dropped before the command finished (timeout, cancellation) the whole
/// group is killed, so helpers spawned by the command do not outlive it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

/// Kills a process group when dropped, unless disarmed.
struct GroupKiller {
    pgid: Option<u32>,
}

impl GroupKiller {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKiller {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            tracing::debug!(pgid, "Killing process group of an unfinished command");
            // SAFETY: killpg only sends a signal. The group is led by a child
            // that has not been reaped yet, so the id cannot have been reused.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl CommandExecutor for SystemExecutor {
    async fn execute(&self, command: &CommandSpec) -> io::Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        // Declared after `child` so it runs first on drop, while the leader is unreaped.
        let mut killer = GroupKiller { pgid: child.id() };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = BufReader::new(stderr);
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let (mut out_done, mut err_done) = (false, false);
        let mut output = CommandOutput::default();

        while !(out_done && err_done) {
            tokio::select! {
                read = out_reader.read_until(b'\n', &mut out_buf), if !out_done => {
                    if read? == 0 {
                        out_done = true;
                    } else {
                        let line = String::from_utf8_lossy(&out_buf).into_owned();
                        out_buf.clear();
                        tracing::debug!(program = %command.program, "{}", line.trim_end());
                        output.stdout.push_str(&line);
                        output.combined.push_str(&line);
                    }
                }
                read = err_reader.read_until(b'\n', &mut err_buf), if !err_done => {
                    if read? == 0 {
                        err_done = true;
                    } else {
                        let line = String::from_utf8_lossy(&err_buf).into_owned();
                        err_buf.clear();
                        tracing::debug!(program = %command.program, stream = "stderr", "{}", line.trim_end());
                        output.combined.push_str(&line);
                    }
                }
            }
        }

        let status = child.wait().await?;
        killer.disarm();
        output.exit_code = status.code();

        Ok(output)
    }
}

/// Runs steps through a [`CommandExecutor`] and records them in the run log.
pub struct StepRunner<'a, E> {
    executor: &'a E,
    log: &'a RunLog,
}

impl<'a, E: CommandExecutor> StepRunner<'a, E> {
    pub fn new(executor: &'a E, log: &'a RunLog) -> Self {
        Self { executor, log }
    }

    /// Run a step whose command is already resolved.
    ///
    /// A non-zero exit, a spawn error or a timeout yields a [`StepFailure`]
    /// carrying the tail of the output.
    pub async fn run(&self, step: &Step) -> Result<CommandOutput, StepFailure> {
        self.log
            .info(format!("[{}] Running: {}", step.name, step.command.display()));

        let execution = self.executor.execute(&step.command);
        let result = match step.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(self.fail(step, None, format!("timed out after {limit:?}")));
                }
            },
            None => execution.await,
        };

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                return Err(self.fail(
                    step,
                    None,
                    format!("failed to run `{}`: {}", step.command.program, e),
                ));
            }
        };

        self.log.output(&step.name, &output.combined);

        if !output.success() {
            return Err(self.fail(step, output.exit_code, excerpt(&output.combined)));
        }

        if let Some(path) = &step.stdout_to {
            FsHandler::write_atomic(path, output.stdout.as_bytes()).map_err(|e| {
                self.fail(
                    step,
                    output.exit_code,
                    format!("failed to write output to {}: {:#}", path.display(), e),
                )
            })?;
        }

        self.log.success(format!("[{}] Completed", step.name));
        Ok(output)
    }

    fn fail(&self, step: &Step, exit_code: Option<i32>, log_excerpt: String) -> StepFailure {
        let failure = StepFailure {
            step_name: step.name.clone(),
            exit_code,
            log_excerpt,
        };
        self.log.error(failure.to_string());
        failure
    }
}

/// The last [`LOG_EXCERPT_LINES`] lines of `output`.
pub fn excerpt(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(LOG_EXCERPT_LINES);
    lines[start..].join("\n")
}
