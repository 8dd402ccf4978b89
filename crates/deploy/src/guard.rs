//! Skip steps whose effect is already in place, so a failed run can simply be re-run.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{fs::FsHandler, provision::unit_file_name, runlog::RunLog, step::Precondition, step::Step};

/// Evaluates step preconditions right before the runner would execute them.
pub struct IdempotencyGuard<'a> {
    log: &'a RunLog,
    search_path: Option<OsString>,
}

impl<'a> IdempotencyGuard<'a> {
    /// A guard that resolves binaries against the `PATH` of this process.
    pub fn new(log: &'a RunLog) -> Self {
        Self {
            log,
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Resolve binaries against `search_path` instead of `PATH`.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    /// Whether `step` can be skipped because its precondition already holds.
    pub fn should_skip(&self, step: &Step) -> bool {
        let Some(precondition) = &step.precondition else {
            return false;
        };

        let holds = self.holds(precondition);
        if holds {
            self.log
                .info(format!("[{}] Already present, skipping", step.name));
        }
        holds
    }

    pub fn holds(&self, precondition: &Precondition) -> bool {
        match precondition {
            Precondition::DirExists(path) => path.is_dir(),
            Precondition::FileExists(path) => path.is_file(),
            Precondition::FileNonEmpty(path) => FsHandler::is_non_empty_file(path),
            Precondition::BinariesOnPath(names) => names
                .iter()
                .all(|name| self.find_binary(name).is_some()),
            Precondition::UnitInstalled { unit_dir, name } => {
                unit_dir.join(unit_file_name(name)).is_file()
            }
            Precondition::JsonValueAt { file, pointer } => json_value_at(file, pointer),
        }
    }

    /// Locate `name` the way a shell would.
    pub fn find_binary(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            return is_executable(&path).then_some(path);
        }

        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

fn json_value_at(file: &Path, pointer: &str) -> bool {
    let Ok(content) = std::fs::read_to_string(file) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(value) => value.pointer(pointer).is_some_and(|v| !v.is_null()),
        Err(e) => {
            tracing::debug!(file = %file.display(), err = %e, "Not valid JSON");
            false
        }
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}
