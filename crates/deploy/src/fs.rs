//! File system utils.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::watch;

pub struct FsHandler;

impl FsHandler {
    /// Create a directory (and its parents) if it doesn't exist.
    pub fn ensure_dir(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        tracing::trace!(path = %path.display(), "Directory ready");
        Ok(())
    }

    /// Whether `path` is a file with at least one byte in it.
    pub fn is_non_empty_file(path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false)
    }

    /// Replace the content of `path` without ever exposing a partially written file.
    ///
    /// The content goes to a sibling temporary file first, which then takes
    /// the place of the target. Permissions of an existing target are kept.
    pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        let permissions = std::fs::metadata(path)
            .map(|metadata| metadata.permissions())
            .ok()
            .or_else(default_permissions);
        Self::replace(path, contents, permissions)
    }

    /// Write a file readable by its owner only (credentials, JWT secrets).
    ///
    /// The content is never readable by anyone else, not even while it is
    /// being written.
    pub fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Self::ensure_dir(parent)?;
        }
        Self::replace(path, contents, None)
    }

    /// Restrict an existing file to its owner.
    pub fn restrict_to_owner(path: &Path) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Create a new file readable by its owner only.
    ///
    /// Fails when anything already exists at `path`, a dangling symlink included.
    pub fn create_private(path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }

    /// Write `contents` to a fresh owner-only temporary file, widen it to
    /// `permissions` if given, then rename it over `path`.
    fn replace(
        path: &Path,
        contents: &[u8],
        permissions: Option<std::fs::Permissions>,
    ) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .context("Target path must name a file")?
            .to_string_lossy();
        let tmp_path = parent.join(format!(
            ".{file_name}.{:016x}.rollstack-tmp",
            rand::random::<u64>()
        ));

        let mut file = Self::create_private(&tmp_path)
            .with_context(|| format!("Failed to create temporary file {}", tmp_path.display()))?;

        let written = file
            .write_all(contents)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("Failed to write temporary file {}", tmp_path.display()))
            .and_then(|()| match permissions {
                Some(permissions) => std::fs::set_permissions(&tmp_path, permissions)
                    .context("Failed to copy permissions to temporary file"),
                None => Ok(()),
            })
            .and_then(|()| {
                std::fs::rename(&tmp_path, path)
                    .with_context(|| format!("Failed to replace {}", path.display()))
            });

        if written.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        written
    }

    /// Wait for a file to be created with a timeout.
    ///
    /// This function uses file system watching (via notify crate) to efficiently
    /// wait for a file to appear.
    pub async fn wait_for_file(path: &PathBuf, timeout: Duration) -> anyhow::Result<()> {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!("File already exists: {}", path.display());
            return Ok(());
        }

        tracing::debug!("Waiting for file: {}", path.display());

        let parent = path
            .parent()
            .context("File path must have a parent directory")?;

        let (tx, mut rx) = watch::channel(None);

        let path_watcher = path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if (event.kind.is_create() || event.kind.is_modify()) && event.paths.contains(&path_watcher) => {
                    tracing::debug!(event = ?event, path = ?path_watcher.display(), "File detected");

                    if let Err(e) = tx.send(Some(event.clone())) {
                        tracing::error!(err = ?e, event = ?event, path = ?path_watcher.display(), "Failed to send event to channel");
                    }
                }
                Ok(event) => {
                    tracing::trace!(event = ?event, path = ?path_watcher.display(), "Ignored event emitted by file watcher");
                }
                Err(e) => {
                    tracing::error!(err = ?e, path = ?path_watcher.display(), "Failed to watch directory");
                }
            })
            .context("Failed to create file watcher")?;

        watcher
            .watch(parent, RecursiveMode::NonRecursive)
            .context("Failed to watch directory")?;

        // The file may have appeared between the first check and the watch.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        tokio::time::timeout(timeout, async {
            rx.changed()
                .await
                .map_err(|e| anyhow::anyhow!("File watcher channel closed: {}", e))
        })
        .await
        .context(format!("Timeout waiting for file: {}", path.display()))??;

        // File watcher may trigger on creation before the writer has finished.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(())
    }
}

/// Mode of a newly created, non-secret file.
#[cfg(unix)]
fn default_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<std::fs::Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("config.env");

        FsHandler::write_atomic(&path, b"A=1\n").unwrap();
        FsHandler::write_atomic(&path, b"A=2\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A=2\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("secrets").join("keys.env");

        FsHandler::write_private(&path, b"KEY=1\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_replaces_wider_file() {
        use std::os::unix::fs::PermissionsExt;

        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join(".env");
        std::fs::write(&path, "KEY=\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        FsHandler::write_private(&path, b"KEY=secret\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "KEY=secret\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_create_private_is_owner_only_and_exclusive() {
        use std::os::unix::fs::PermissionsExt;

        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join(".keys.env.tmp");

        drop(FsHandler::create_private(&path).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let err = FsHandler::create_private(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        // A planted symlink is refused instead of followed.
        let leak = tmp_dir.path().join("leak.txt");
        let link = tmp_dir.path().join(".keys.env.link");
        std::os::unix::fs::symlink(&leak, &link).unwrap();
        assert!(FsHandler::create_private(&link).is_err());
        assert!(!leak.exists());
    }

    #[test]
    fn test_write_leaves_no_temporary_files() {
        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("credentials.env");

        FsHandler::write_private(&path, b"A=1\n").unwrap();
        FsHandler::write_atomic(&path, b"A=2\n").unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("credentials.env")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_new_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("rollup.json");

        FsHandler::write_atomic(&path, b"{}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_is_non_empty_file() {
        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("empty");

        assert!(!FsHandler::is_non_empty_file(&path));
        std::fs::write(&path, "").unwrap();
        assert!(!FsHandler::is_non_empty_file(&path));
        std::fs::write(&path, "x").unwrap();
        assert!(FsHandler::is_non_empty_file(&path));
        assert!(!FsHandler::is_non_empty_file(tmp_dir.path()));
    }

    #[tokio::test]
    async fn test_wait_for_file() {
        let tmp_dir = TempDir::new("rollstack-fs").unwrap();
        let path = tmp_dir.path().join("ready");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::fs::write(writer_path, "ok").unwrap();
        });

        FsHandler::wait_for_file(&path, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
