//! In-place edits of flat `KEY=value` configuration files.
//!
//! Only the lines assigning a patched key change. Every other byte of the
//! file, including line endings, comments, quoting and a missing final
//! newline, round-trips untouched. A file is rewritten at most once per
//! patch, through a temporary file and a rename, so it is never observed
//! half-patched.

use std::path::{Path, PathBuf};

use crate::{
    context::PipelineContext,
    error::{ContextError, PatchFailure},
    fs::FsHandler,
};

/// One edit applied to a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Rewrite the lines assigning `key`. An absent key is left absent.
    Set { key: String, value: String },
    /// Remove every line assigning `key`. An absent key is a no-op.
    Delete { key: String },
    /// Rewrite `key` when present, append it otherwise.
    Insert { key: String, value: String },
}

impl PatchOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        PatchOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        PatchOp::Delete { key: key.into() }
    }

    pub fn insert(key: impl Into<String>, value: impl Into<String>) -> Self {
        PatchOp::Insert {
            key: key.into(),
            value: value.into(),
        }
    }

    fn key(&self) -> &str {
        match self {
            PatchOp::Set { key, .. } | PatchOp::Delete { key } | PatchOp::Insert { key, .. } => key,
        }
    }
}

/// A set of edits for one file. Values may contain `${KEY}` placeholders.
#[derive(Debug, Clone)]
pub struct ConfigPatch {
    pub target_file: PathBuf,
    pub ops: Vec<PatchOp>,
    /// The file holds secrets and is kept readable by its owner only.
    pub private: bool,
}

impl ConfigPatch {
    pub fn new(target_file: impl Into<PathBuf>) -> Self {
        Self {
            target_file: target_file.into(),
            ops: Vec::new(),
            private: false,
        }
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(PatchOp::set(key, value));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(PatchOp::delete(key));
        self
    }

    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(PatchOp::insert(key, value));
        self
    }

    /// Resolve the target path and every value against `ctx`.
    pub fn resolve(&self, ctx: &PipelineContext) -> Result<ConfigPatch, ContextError> {
        let ops = self
            .ops
            .iter()
            .map(|op| {
                Ok(match op {
                    PatchOp::Set { key, value } => PatchOp::set(key, ctx.render(value)?),
                    PatchOp::Delete { key } => PatchOp::delete(key),
                    PatchOp::Insert { key, value } => PatchOp::insert(key, ctx.render(value)?),
                })
            })
            .collect::<Result<Vec<_>, ContextError>>()?;

        Ok(ConfigPatch {
            target_file: PathBuf::from(ctx.render(&self.target_file.to_string_lossy())?),
            ops,
            private: self.private,
        })
    }
}

/// What a patch did to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    /// Whether the file content changed (and was rewritten).
    pub changed: bool,
    /// Keys of `Set` operations that matched no line.
    pub missing: Vec<String>,
    /// Number of lines removed by `Delete` operations.
    pub deleted: usize,
}

/// Apply `ops`, in order, to the file at `file`.
pub fn patch(file: &Path, ops: &[PatchOp]) -> Result<PatchSummary, PatchFailure> {
    patch_file(file, ops, false)
}

/// Like [`patch`], and leave the file readable by its owner only.
///
/// The restriction applies even when no edit was needed.
pub fn patch_private(file: &Path, ops: &[PatchOp]) -> Result<PatchSummary, PatchFailure> {
    patch_file(file, ops, true)
}

fn patch_file(file: &Path, ops: &[PatchOp], private: bool) -> Result<PatchSummary, PatchFailure> {
    let failure = |reason: String| PatchFailure {
        file: file.to_path_buf(),
        reason,
    };

    let original = std::fs::read_to_string(file).map_err(|e| failure(e.to_string()))?;
    let (patched, summary) = apply(&original, ops).map_err(failure)?;

    if !summary.changed {
        if private {
            FsHandler::restrict_to_owner(file).map_err(|e| failure(format!("{e:#}")))?;
        }
        tracing::debug!(file = %file.display(), "Configuration already up to date");
        return Ok(summary);
    }

    let written = if private {
        FsHandler::write_private(file, patched.as_bytes())
    } else {
        FsHandler::write_atomic(file, patched.as_bytes())
    };
    written.map_err(|e| failure(format!("{e:#}")))?;

    tracing::debug!(
        file = %file.display(),
        ops = ops.len(),
        missing = ?summary.missing,
        deleted = summary.deleted,
        "Configuration patched"
    );

    Ok(summary)
}

/// Delete every line assigning `key`. Deleting an absent key leaves the file unchanged.
pub fn delete_key(file: &Path, key: &str) -> Result<PatchSummary, PatchFailure> {
    patch(file, &[PatchOp::delete(key)])
}

/// Pure text transformation behind [`patch`].
fn apply(original: &str, ops: &[PatchOp]) -> Result<(String, PatchSummary), String> {
    for op in ops {
        validate_key(op.key())?;
        if let PatchOp::Set { key, value } | PatchOp::Insert { key, value } = op {
            if value.contains(['\n', '\r']) {
                return Err(format!("value for `{key}` spans multiple lines"));
            }
        }
    }

    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = original.split_inclusive('\n').map(str::to_string).collect();
    let mut summary = PatchSummary::default();

    for op in ops {
        match op {
            PatchOp::Set { key, value } => {
                if !rewrite(&mut lines, key, value) {
                    tracing::warn!(key = %key, "Key not declared in configuration, leaving it absent");
                    summary.missing.push(key.clone());
                }
            }
            PatchOp::Delete { key } => {
                let before = lines.len();
                lines.retain(|line| !assigns(line, key));
                summary.deleted += before - lines.len();
            }
            PatchOp::Insert { key, value } => {
                if !rewrite(&mut lines, key, value) {
                    if let Some(last) = lines.last_mut() {
                        if !last.ends_with('\n') {
                            last.push_str(newline);
                        }
                    }
                    lines.push(format!("{key}={value}{newline}"));
                }
            }
        }
    }

    let patched = lines.concat();
    summary.changed = patched != original;
    Ok((patched, summary))
}

fn validate_key(key: &str) -> Result<(), String> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid key `{key}`"))
    }
}

/// Rewrite every line assigning `key`. Returns whether any line matched.
fn rewrite(lines: &mut [String], key: &str, value: &str) -> bool {
    let mut found = false;

    for line in lines.iter_mut() {
        if let Some(prefix_len) = assignment_prefix(line, key) {
            let ending = split_ending(line).1;
            *line = format!("{}{key}={value}{ending}", &line[..prefix_len]);
            found = true;
        }
    }

    found
}

fn assigns(line: &str, key: &str) -> bool {
    assignment_prefix(line, key).is_some()
}

/// Length of the text before `key` when `line` assigns `key`.
///
/// Accepts leading whitespace and an `export ` prefix; the key comparison is
/// exact and case-sensitive.
fn assignment_prefix(line: &str, key: &str) -> Option<usize> {
    let (body, _) = split_ending(line);
    let trimmed = body.trim_start();
    let mut prefix_len = body.len() - trimmed.len();

    let rest = match trimmed.strip_prefix("export ") {
        Some(after_export) => {
            let after = after_export.trim_start();
            prefix_len += trimmed.len() - after.len();
            after
        }
        None => trimmed,
    };

    rest.strip_prefix(key)
        .filter(|after_key| after_key.starts_with('='))
        .map(|_| prefix_len)
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    const ENV: &str = "# Chain settings\nCHAIN_ID=old\nCHAIN_NAME=\"my chain\"\n\n  export PARENT_RPC=http://x\nchain_id=lower\nTX_HASH=0xdead\n";

    #[test]
    fn test_set_rewrites_only_target_line() {
        let (patched, summary) = apply(ENV, &[PatchOp::set("CHAIN_ID", "12345")]).unwrap();

        assert_eq!(patched, ENV.replace("CHAIN_ID=old", "CHAIN_ID=12345"));
        assert!(summary.changed);
        assert!(summary.missing.is_empty());
    }

    #[test]
    fn test_set_is_idempotent() {
        let ops = [PatchOp::set("CHAIN_ID", "12345")];
        let (once, _) = apply(ENV, &ops).unwrap();
        let (twice, summary) = apply(&once, &ops).unwrap();

        assert_eq!(once, twice);
        assert!(!summary.changed);
    }

    #[test]
    fn test_set_absent_key_is_not_inserted() {
        let (patched, summary) = apply(ENV, &[PatchOp::set("NEW_KEY", "1")]).unwrap();

        assert_eq!(patched, ENV);
        assert_eq!(summary.missing, vec!["NEW_KEY".to_string()]);
        assert!(!summary.changed);
    }

    #[test]
    fn test_export_prefix_and_indent_preserved() {
        let (patched, _) = apply(ENV, &[PatchOp::set("PARENT_RPC", "http://l1:8545")]).unwrap();
        assert!(patched.contains("\n  export PARENT_RPC=http://l1:8545\n"));
    }

    #[test]
    fn test_key_case_is_exact() {
        let (patched, _) = apply(ENV, &[PatchOp::set("chain_id", "x")]).unwrap();
        assert!(patched.contains("CHAIN_ID=old\n"));
        assert!(patched.contains("chain_id=x\n"));
    }

    #[test]
    fn test_key_prefix_does_not_match() {
        let (patched, summary) = apply("CHAIN_ID_OLD=1\n", &[PatchOp::set("CHAIN_ID", "2")]).unwrap();
        assert_eq!(patched, "CHAIN_ID_OLD=1\n");
        assert_eq!(summary.missing, vec!["CHAIN_ID".to_string()]);
    }

    #[test]
    fn test_delete() {
        let (patched, summary) = apply(ENV, &[PatchOp::delete("TX_HASH")]).unwrap();
        assert_eq!(patched, ENV.replace("TX_HASH=0xdead\n", ""));
        assert_eq!(summary.deleted, 1);

        let (unchanged, summary) = apply(ENV, &[PatchOp::delete("MISSING")]).unwrap();
        assert_eq!(unchanged, ENV);
        assert!(!summary.changed);
    }

    #[test]
    fn test_insert_after_delete() {
        let ops = [PatchOp::delete("TX_HASH"), PatchOp::insert("TX_HASH", "0xbeef")];
        let (patched, _) = apply(ENV, &ops).unwrap();
        assert!(patched.ends_with("chain_id=lower\nTX_HASH=0xbeef\n"));
    }

    #[test]
    fn test_insert_preserves_crlf_and_missing_newline() {
        let (patched, _) = apply("A=1\r\nB=2", &[PatchOp::insert("C", "3")]).unwrap();
        assert_eq!(patched, "A=1\r\nB=2\r\nC=3\r\n");

        let (patched, _) = apply("A=1\r\nB=2", &[PatchOp::set("A", "9")]).unwrap();
        assert_eq!(patched, "A=9\r\nB=2");
    }

    #[test]
    fn test_multiline_value_rejected() {
        assert!(apply(ENV, &[PatchOp::set("CHAIN_ID", "1\n2")]).is_err());
        assert!(apply(ENV, &[PatchOp::set("", "1")]).is_err());
    }

    #[test]
    fn test_patch_file() {
        let tmp_dir = TempDir::new("rollstack-patch").unwrap();
        let path = tmp_dir.path().join(".env");
        std::fs::write(&path, ENV).unwrap();

        let summary = patch(&path, &[PatchOp::set("CHAIN_ID", "12345")]).unwrap();
        assert!(summary.changed);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            ENV.replace("CHAIN_ID=old", "CHAIN_ID=12345")
        );

        let summary = delete_key(&path, "NOT_THERE").unwrap();
        assert!(!summary.changed);
    }

    #[cfg(unix)]
    #[test]
    fn test_patch_private_restricts_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp_dir = TempDir::new("rollstack-patch").unwrap();
        let path = tmp_dir.path().join(".env");
        std::fs::write(&path, ENV).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let mode = || std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;

        let summary = patch_private(&path, &[PatchOp::set("CHAIN_ID", "12345")]).unwrap();
        assert!(summary.changed);
        assert_eq!(mode(), 0o600);

        // An up to date file copied with a wider mode is restricted too.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let summary = patch_private(&path, &[PatchOp::set("CHAIN_ID", "12345")]).unwrap();
        assert!(!summary.changed);
        assert_eq!(mode(), 0o600);
    }

    #[test]
    fn test_patch_missing_file() {
        let tmp_dir = TempDir::new("rollstack-patch").unwrap();
        let err = patch(&tmp_dir.path().join("nope.env"), &[PatchOp::set("A", "1")]).unwrap_err();
        assert!(err.file.ends_with("nope.env"));
    }

    #[test]
    fn test_resolve_templates() {
        let mut ctx = PipelineContext::new();
        ctx.set("TX_HASH", "0xabc").unwrap();
        ctx.set("WORKDIR", "/srv").unwrap();

        let resolved = ConfigPatch::new("${WORKDIR}/.env")
            .delete("TX_HASH")
            .insert("TX_HASH", "${TX_HASH}")
            .resolve(&ctx)
            .unwrap();

        assert_eq!(resolved.target_file, PathBuf::from("/srv/.env"));
        assert_eq!(
            resolved.ops,
            vec![PatchOp::delete("TX_HASH"), PatchOp::insert("TX_HASH", "0xabc")]
        );
    }
}
