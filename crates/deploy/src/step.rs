//! Data model for the commands a pipeline runs.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{context::PipelineContext, error::ContextError, extract::Pattern};

/// An external command: a program and an explicit argument vector.
///
/// Arguments, the working directory and environment values may contain
/// `${KEY}` placeholders that are resolved against the [`PipelineContext`]
/// right before execution. Nothing is ever handed to a shell for re-parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Resolve every placeholder against `ctx`.
    pub fn resolve(&self, ctx: &PipelineContext) -> Result<CommandSpec, ContextError> {
        let args = self
            .args
            .iter()
            .map(|arg| ctx.render(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = self
            .cwd
            .as_ref()
            .map(|cwd| ctx.render(&cwd.to_string_lossy()).map(PathBuf::from))
            .transpose()?;

        let env = self
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), ctx.render(value)?)))
            .collect::<Result<Vec<_>, ContextError>>()?;

        Ok(CommandSpec {
            program: ctx.render(&self.program)?,
            args,
            cwd,
            env,
        })
    }

    /// Human-readable command line for logs. Not meant to be executed.
    ///
    /// Arguments following a flag that looks like a secret are masked.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut mask_next = false;

        for arg in &self.args {
            if mask_next {
                parts.push("<redacted>".to_string());
                mask_next = false;
                continue;
            }
            mask_next = is_secret_flag(arg);
            if arg.contains(char::is_whitespace) {
                parts.push(format!("{arg:?}"));
            } else {
                parts.push(arg.clone());
            }
        }

        parts.join(" ")
    }
}

fn is_secret_flag(arg: &str) -> bool {
    arg.starts_with('-') && (arg.contains("private-key") || arg.contains("secret"))
}

/// Condition under which a step has already been carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// The directory exists (e.g. a cloned repository).
    DirExists(PathBuf),
    /// The file exists, whatever its content.
    FileExists(PathBuf),
    /// The file exists and is not empty (e.g. generated credentials).
    FileNonEmpty(PathBuf),
    /// Every binary is found on `PATH` (e.g. an installed toolchain).
    BinariesOnPath(Vec<String>),
    /// A unit file with this name is installed in the unit directory.
    UnitInstalled { unit_dir: PathBuf, name: String },
    /// The JSON file holds a non-null value at `pointer` (RFC 6901), e.g. a
    /// contract address recorded by a deployment tool.
    JsonValueAt { file: PathBuf, pointer: String },
}

/// Extract a value from a step's output into the context.
#[derive(Debug, Clone)]
pub struct Capture {
    pub key: String,
    pub pattern: Pattern,
    /// Replace a value set by an earlier stage instead of failing.
    pub overwrite: bool,
}

/// A named command run by the pipeline.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub command: CommandSpec,
    pub precondition: Option<Precondition>,
    pub capture: Option<Capture>,
    /// Write the captured standard output to this file (the `> file` of a script).
    pub stdout_to: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            precondition: None,
            capture: None,
            stdout_to: None,
            timeout: None,
        }
    }

    /// Skip the step when `precondition` already holds.
    pub fn skip_if(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Store the first match of `pattern` in the output under `key`.
    pub fn capture(mut self, key: impl Into<String>, pattern: Pattern) -> Self {
        self.capture = Some(Capture {
            key: key.into(),
            pattern,
            overwrite: false,
        });
        self
    }

    /// Like [`Step::capture`], but supersedes an existing value.
    pub fn capture_overwrite(mut self, key: impl Into<String>, pattern: Pattern) -> Self {
        self.capture = Some(Capture {
            key: key.into(),
            pattern,
            overwrite: true,
        });
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy of this step with its command resolved against `ctx`.
    pub fn resolve(&self, ctx: &PipelineContext) -> Result<Step, ContextError> {
        Ok(Step {
            command: self.command.resolve(ctx)?,
            ..self.clone()
        })
    }
}
