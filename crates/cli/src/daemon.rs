//! Process lifecycle for `notifyd start` and `notifyd serve`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::signal;
use tracing::{debug, warn};

use crate::config::Config;

/// `~/.notifyd/notifyd.pid`, or `./notifyd.pid` without `HOME`.
pub fn default_pid_path() -> PathBuf {
    Config::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notifyd.pid")
}

/// Process id record held for the lifetime of a `start` run.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Records the current process id at `path`, creating parent directories.
    ///
    /// A leftover file from a run that never reached [`PidFile::remove`] is
    /// overwritten.
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Ok(previous) = tokio::fs::read_to_string(&path).await {
            warn!(
                previous = previous.trim(),
                "Overwriting stale PID file {}",
                path.display()
            );
        }
        tokio::fs::write(&path, format!("{}\n", std::process::id())).await?;
        debug!(pid = std::process::id(), "PID file at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("PID file removed: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove PID file {}: {e}", self.path.display()),
        }
    }
}

/// Signal that ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    pub fn as_str(self) -> &'static str {
        match self {
            Shutdown::Interrupt => "SIGINT",
            Shutdown::Terminate => "SIGTERM",
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM; Ctrl-C only on non-unix targets.
pub async fn shutdown_signal() -> io::Result<Shutdown> {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = signal::ctrl_c() => interrupted.map(|()| Shutdown::Interrupt),
            _ = terminate.recv() => Ok(Shutdown::Terminate),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| Shutdown::Interrupt)
    }
}
