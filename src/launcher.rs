//! Child process abstraction used by the supervisor
//!
//! A [`Launcher`] spawns one application process and hands back a
//! [`LaunchedProcess`]: its pid, a control handle for signalling, and a
//! oneshot receiver that fires exactly once when the process exits. The
//! supervisor only ever reacts to that notification, so tests can drive it
//! with a fake launcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Signals the core sends to child processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Send `signal` to `pid`. Returns false if the process could not be signalled
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) has no memory safety preconditions
    unsafe { libc::kill(pid, sig) == 0 }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: Signal) -> bool {
    false
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit info for a process whose status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Everything needed to spawn one application process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub app: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Standard output is appended here
    pub stdout_log: PathBuf,
    /// Standard error is appended here
    pub stderr_log: PathBuf,
}

/// Signalling handle for a launched process
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit; escalates to a hard kill after the launcher's grace period
    fn terminate(&self);
}

pub struct LaunchedProcess {
    pub pid: u32,
    pub control: Arc<dyn ProcessControl>,
    /// Fires once with the exit status
    pub exited: oneshot::Receiver<ExitInfo>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess>;
}

/// Launches real OS processes
pub struct SystemLauncher {
    kill_grace: Duration,
}

impl SystemLauncher {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

struct ChildControl {
    pid: u32,
    terminate: Arc<Notify>,
}

impl ProcessControl for ChildControl {
    fn terminate(&self) {
        if !send_signal(self.pid, Signal::Terminate) {
            debug!(pid = self.pid, "SIGTERM not delivered");
        }
        self.terminate.notify_one();
    }
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess> {
        let stdout = open_log(&spec.stdout_log)?;
        let stderr = open_log(&spec.stderr_log)?;

        info!(
            app = %spec.app,
            program = %spec.program,
            args = ?spec.args,
            cwd = %spec.cwd.display(),
            "Spawning application process"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Process exited before its pid was read"))?;

        let terminate = Arc::new(Notify::new());
        let (exit_tx, exited) = oneshot::channel();
        let grace = self.kill_grace;
        let app = spec.app.clone();
        let term = Arc::clone(&terminate);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = term.notified() => {
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(
                                app = %app,
                                pid,
                                grace_period_secs = grace.as_secs(),
                                "Grace period exceeded, sending SIGKILL"
                            );
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from_status(&status),
                Err(e) => {
                    warn!(app = %app, pid, error = %e, "Error waiting for process");
                    ExitInfo::unknown()
                }
            };
            debug!(app = %app, pid, exit = %info, "Process exited");
            let _ = exit_tx.send(info);
        });

        Ok(LaunchedProcess {
            pid,
            control: Arc::new(ChildControl { pid, terminate }),
            exited,
        })
    }
}

/// Run a command to completion, killing it if it outlives `timeout`
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    env: &[(&str, &str)],
    timeout: Duration,
) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("Failed to run {}", program)),
        Err(_) => anyhow::bail!("{} timed out after {}s", program, timeout.as_secs()),
    }
}
