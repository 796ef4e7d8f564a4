//! Single-instance guard.
//!
//! Two dfmd processes rewriting the same NAT table would undo each other's
//! work, so the daemon holds a [`PidFile`] for as long as it runs.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;

/// PID file owned by this process. Dropping it removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates `path` and writes the current PID into it.
    ///
    /// The file is created with `create_new`, so an existing file (another
    /// instance, or a stale file after a crash) is an error that names the
    /// recorded PID. Missing parent directories are created with mode 0o700,
    /// the file itself gets 0o600.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let recorded = fs::read_to_string(&path).unwrap_or_else(|_| "unknown".to_owned());
                return Err(anyhow::anyhow!(
                    "PID file {} already exists with PID: {}. Is another instance running?",
                    path.display(),
                    recorded.trim()
                ));
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to create PID file {}: {}",
                    path.display(),
                    e
                ));
            }
        };

        // 이제부터 실패하면 Drop이 파일을 지운다
        let pid_file = Self { path };

        if !file.metadata()?.is_file() {
            return Err(anyhow::anyhow!(
                "PID file {} is not a regular file",
                pid_file.path.display()
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        let pid = std::process::id();
        writeln!(file, "{pid}")?;

        tracing::info!(pid, path = %pid_file.path.display(), "PID file written");
        Ok(pid_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "PID file removed"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove PID file"
            ),
        }
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().mode(0o700).recursive(true).create(dir)?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
