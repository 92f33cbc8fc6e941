//! Proxy core run as a child process
//!
//! A descriptor number only means something inside the process that owns it,
//! so a core that is told to adopt the interface by number has to share or
//! inherit the bridge's descriptor table. [`CoreProcess`] spawns the core with
//! the interface descriptor inherited at the same number, and closes the
//! bridge's own copy right after the spawn. Terminating the child is then
//! what releases the interface.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Proxy core child process
pub struct CoreProcess {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    grace: Duration,
    child: Mutex<Option<Child>>,
}

impl CoreProcess {
    /// `command` is the program followed by its arguments
    pub fn new(command: &[String], working_dir: impl AsRef<Path>) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(Error::Config("core command is empty".into()));
        };
        if program.trim().is_empty() {
            return Err(Error::Config("core command has no program".into()));
        }

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: working_dir.as_ref().to_path_buf(),
            grace: DEFAULT_TERMINATE_GRACE,
            child: Mutex::new(None),
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Spawn the core with `fd` inherited at the same number
    ///
    /// Returns that number. The bridge's copy is closed once the child exists,
    /// and also when the spawn fails.
    pub async fn spawn_with(&self, fd: OwnedFd) -> Result<RawFd> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(Error::InvalidState("proxy core process already running".into()));
        }

        let raw = fd.as_raw_fd();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe fcntl calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            Error::Core(format!("failed to spawn proxy core '{}': {}", self.program, e))
        })?;
        drop(fd);

        log::info!(
            "Proxy core '{}' started (pid {}) with TUN descriptor {}",
            self.program,
            child.id().unwrap_or_default(),
            raw
        );
        *slot = Some(child);
        Ok(raw)
    }

    /// Check the child exists and has not exited
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// SIGTERM the child, then SIGKILL it after the grace period
    ///
    /// Returns once the child has been reaped; without a child it does nothing.
    pub async fn terminate(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to our own, not yet reaped, child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => log::info!("Proxy core '{}' exited: {}", self.program, status),
            Ok(Err(e)) => log::warn!("Failed to wait for proxy core: {}", e),
            Err(_) => {
                log::warn!(
                    "Proxy core '{}' ignored SIGTERM for {:?}, killing it",
                    self.program,
                    self.grace
                );
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill proxy core: {}", e);
                }
            }
        }
    }
}
