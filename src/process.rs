use crate::app::{AppRepository, AppStatus, Application};
use crate::config::SupervisorConfig;
use crate::detector::{entry_point, has_script, read_manifest};
use crate::error::{HostError, HostResult};
use crate::launcher::{ExitInfo, LaunchSpec, Launcher, ProcessControl};
use crate::logs::{self, LogStream};
use crate::ports::PortAllocator;
use crate::routes::RouteManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Liveness of one application as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppState {
    pub running: bool,
    pub pid: Option<u32>,
}

impl AppState {
    fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
        }
    }
}

/// Dashboard counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

/// A supervised child process. Never persisted
struct ProcessHandle {
    /// Distinguishes successive processes of the same application
    instance: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    control: Arc<dyn ProcessControl>,
    /// Flips to true once the exit notification has been handled
    done: watch::Receiver<bool>,
}

/// Owns the table of live application processes.
///
/// Like the rest of the service, `Supervisor` is shared behind an `Arc`;
/// [`new`](Supervisor::new) returns one directly because exit watchers need
/// their own reference.
///
/// Lifecycle operations on one application are serialized by a per-name
/// async lock. Exit notifications go through the same lock and are matched
/// against the handle's instance number, so a late notification from a
/// previous process can never mark a fresh one as stopped.
pub struct Supervisor {
    repo: AppRepository,
    launcher: Arc<dyn Launcher>,
    ports: Arc<PortAllocator>,
    routes: RouteManager,
    config: SupervisorConfig,
    handles: Mutex<HashMap<String, ProcessHandle>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_instance: AtomicU64,
}

impl Supervisor {
    pub fn new(
        repo: AppRepository,
        launcher: Arc<dyn Launcher>,
        ports: Arc<PortAllocator>,
        routes: RouteManager,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            launcher,
            ports,
            routes,
            config,
            handles: Mutex::new(HashMap::new()),
            locks: DashMap::new(),
            next_instance: AtomicU64::new(1),
        })
    }

    pub fn repo(&self) -> &AppRepository {
        &self.repo
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(name.to_string()).or_default().clone()
    }

    fn find_app(&self, name: &str) -> HostResult<Application> {
        self.repo
            .find(name)?
            .ok_or_else(|| HostError::NotFound(name.to_string()))
    }

    fn live_state(&self, name: &str) -> Option<AppState> {
        self.handles.lock().get(name).map(|h| AppState {
            running: true,
            pid: Some(h.pid),
        })
    }

    /// Whether a process is currently tracked for `name`
    pub fn is_running(&self, name: &str) -> bool {
        self.handles.lock().contains_key(name)
    }

    /// Start the application; returns the current state if it is already running
    pub async fn start(self: &Arc<Self>, name: &str) -> HostResult<AppState> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let app = self.find_app(name)?;
        if let Some(state) = self.live_state(name) {
            debug!(app = %name, pid = ?state.pid, "Already running");
            return Ok(state);
        }

        let (program, args) = launch_command(&app)?;
        let spec = LaunchSpec {
            app: app.name.clone(),
            program,
            args,
            cwd: app.source_dir.clone(),
            env: vec![
                ("PORT".to_string(), app.port.to_string()),
                ("NODE_ENV".to_string(), "production".to_string()),
            ],
            stdout_log: logs::log_path(&app.root_dir, LogStream::Out),
            stderr_log: logs::log_path(&app.root_dir, LogStream::Error),
        };

        let launched = match self.launcher.launch(spec).await {
            Ok(l) => l,
            Err(e) => {
                error!(app = %name, error = %e, "Failed to start application");
                self.repo.set_stopped(name)?;
                return Err(e.context(format!("failed to start {}", name)).into());
            }
        };

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let pid = launched.pid;
        let (done_tx, done_rx) = watch::channel(false);

        self.handles.lock().insert(
            name.to_string(),
            ProcessHandle {
                instance,
                pid,
                started_at: Utc::now(),
                control: launched.control,
                done: done_rx,
            },
        );

        if let Err(e) = self.repo.set_running(name, pid) {
            // Keep the table and the store consistent
            if let Some(handle) = self.handles.lock().remove(name) {
                handle.control.terminate();
            }
            return Err(e.into());
        }
        info!(app = %name, pid, port = app.port, "Application started");

        let supervisor = Arc::clone(self);
        let name_owned = name.to_string();
        let exited = launched.exited;
        tokio::spawn(async move {
            let exit = exited.await.unwrap_or_else(|_| ExitInfo::unknown());
            supervisor.handle_exit(&name_owned, instance, exit).await;
            let _ = done_tx.send(true);
        });

        Ok(AppState {
            running: true,
            pid: Some(pid),
        })
    }

    /// Apply an exit notification for process `instance` of `name`
    async fn handle_exit(&self, name: &str, instance: u64, exit: ExitInfo) {
        // No lock entry means the application was deleted while the process wound down
        let Some(lock) = self.locks.get(name).map(|l| Arc::clone(l.value())) else {
            debug!(app = %name, instance, exit = %exit, "Ignoring exit of deleted application");
            return;
        };
        let _guard = lock.lock().await;

        let current = {
            let mut handles = self.handles.lock();
            match handles.get(name) {
                Some(h) if h.instance == instance => handles.remove(name),
                _ => None,
            }
        };

        let Some(handle) = current else {
            debug!(app = %name, instance, exit = %exit, "Ignoring exit of untracked process");
            return;
        };

        let uptime = Utc::now() - handle.started_at;
        info!(
            app = %name,
            pid = handle.pid,
            exit = %exit,
            uptime_secs = uptime.num_seconds(),
            "Application exited"
        );
        if let Err(e) = self.repo.set_stopped(name) {
            error!(app = %name, error = %e, "Failed to record application exit");
        }
    }

    /// Remove the handle and signal the process. Must be called with the app lock held
    fn stop_locked(&self, name: &str) -> Option<watch::Receiver<bool>> {
        let handle = self.handles.lock().remove(name)?;
        info!(app = %name, pid = handle.pid, "Sending SIGTERM to application");
        handle.control.terminate();
        Some(handle.done)
    }

    /// Stop the application. Succeeds when it is not running
    pub async fn stop(&self, name: &str) -> HostResult<AppState> {
        self.stop_inner(name).await.map(|_| AppState::stopped())
    }

    async fn stop_inner(&self, name: &str) -> HostResult<Option<watch::Receiver<bool>>> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let done = self.stop_locked(name);
        let found = self.repo.set_stopped(name)?;
        if !found && done.is_none() {
            return Err(HostError::NotFound(name.to_string()));
        }
        info!(app = %name, "Application stopped");
        Ok(done)
    }

    /// Stop, wait for the old process to exit (bounded by the restart grace), then start
    pub async fn restart(self: &Arc<Self>, name: &str) -> HostResult<AppState> {
        if let Some(mut done) = self.stop_inner(name).await? {
            let grace = self.config.restart_grace();
            if tokio::time::timeout(grace, done.wait_for(|d| *d)).await.is_err() {
                warn!(
                    app = %name,
                    grace_ms = grace.as_millis() as u64,
                    "Previous process still running, starting anyway"
                );
            }
        }
        self.start(name).await
    }

    pub fn status(&self, name: &str) -> HostResult<AppState> {
        self.find_app(name)?;
        Ok(self.live_state(name).unwrap_or_else(AppState::stopped))
    }

    /// Every record, with status and pid taken from the live process table
    pub fn list_all(&self) -> HostResult<Vec<Application>> {
        let mut apps = self.repo.list()?;
        let handles = self.handles.lock();
        for app in &mut apps {
            match handles.get(&app.name) {
                Some(h) => {
                    app.status = AppStatus::Running;
                    app.pid = Some(h.pid);
                }
                None => {
                    app.status = AppStatus::Stopped;
                    app.pid = None;
                }
            }
        }
        Ok(apps)
    }

    pub fn stats(&self) -> HostResult<AppStats> {
        let apps = self.repo.list()?;
        let handles = self.handles.lock();
        let running = apps.iter().filter(|a| handles.contains_key(&a.name)).count();
        Ok(AppStats {
            total: apps.len(),
            running,
            stopped: apps.len() - running,
        })
    }

    /// Stop the application if needed, then release everything it owns
    pub async fn delete_application(&self, name: &str) -> HostResult<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let app = self.find_app(name)?;
        self.stop_locked(name);
        self.repo.set_stopped(name)?;

        if let Err(e) = self.ports.release(app.port).await {
            warn!(app = %name, port = app.port, error = %e, "Failed to release port");
        }

        match tokio::fs::remove_dir_all(&app.root_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(app = %name, path = %app.root_dir.display(), error = %e, "Failed to remove application root")
            }
        }
        if let Err(e) = self.routes.remove(name).await {
            warn!(app = %name, error = %e, "Failed to remove route config");
        }
        self.repo.delete(name)?;
        self.routes.reload();

        drop(_guard);
        self.locks.remove(name);
        info!(app = %name, port = app.port, "Application deleted");
        Ok(())
    }

    pub async fn get_logs(&self, name: &str, stream: LogStream, lines: usize) -> HostResult<String> {
        let app = self.find_app(name)?;
        Ok(logs::tail(&logs::log_path(&app.root_dir, stream), lines).await?)
    }

    /// Mark every persisted record stopped; run once at service start, when no process is tracked
    pub fn reconcile(&self) -> HostResult<usize> {
        let mut fixed = 0;
        for app in self.repo.list()? {
            if app.status != AppStatus::Stopped || app.pid.is_some() {
                self.repo.set_stopped(&app.name)?;
                fixed += 1;
            }
        }
        if fixed > 0 {
            info!(count = fixed, "Marked previously running applications as stopped");
        }
        Ok(fixed)
    }

    /// Signal every tracked process; used on shutdown
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.handles.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(app = %name, error = %e, "Failed to stop application");
            }
        }
    }
}

/// Pick the program and arguments that start an application
fn launch_command(app: &Application) -> HostResult<(String, Vec<String>)> {
    let manifest = read_manifest(&app.source_dir);

    if manifest.as_ref().map_or(false, |m| has_script(m, "start")) {
        return Ok(("npm".to_string(), vec!["start".to_string()]));
    }

    if let Some(command) = &app.project_info.start_command {
        let mut parts = shell_words::split(command)
            .map_err(|e| HostError::invalid(format!("bad start command {:?}: {}", command, e)))?;
        if !parts.is_empty() {
            let program = parts.remove(0);
            return Ok((program, parts));
        }
    }

    let entry = manifest
        .as_ref()
        .map(entry_point)
        .unwrap_or_else(|| "index.js".to_string());
    Ok(("node".to_string(), vec![entry]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::sample;
    use crate::config::PortRange;
    use crate::detector::ProjectInfo;
    use crate::launcher::LaunchedProcess;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Launcher whose processes ignore SIGTERM until the test delivers an exit
    #[derive(Default)]
    struct LingeringLauncher {
        exits: Mutex<Vec<oneshot::Sender<ExitInfo>>>,
    }

    struct IgnoreTerminate;

    impl ProcessControl for IgnoreTerminate {
        fn terminate(&self) {}
    }

    #[async_trait::async_trait]
    impl Launcher for LingeringLauncher {
        async fn launch(&self, _spec: LaunchSpec) -> anyhow::Result<LaunchedProcess> {
            let (tx, rx) = oneshot::channel();
            self.exits.lock().push(tx);
            Ok(LaunchedProcess {
                pid: 4242,
                control: Arc::new(IgnoreTerminate),
                exited: rx,
            })
        }
    }

    #[test]
    fn test_launch_command_prefers_start_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"start": "node server.js"}}"#,
        )
        .unwrap();
        let mut app = sample("a", 3001);
        app.source_dir = dir.path().to_path_buf();
        app.project_info.start_command = Some("npx next start".to_string());

        let (program, args) = launch_command(&app).unwrap();
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["start"]);
    }

    #[test]
    fn test_launch_command_uses_detected_command() {
        let dir = TempDir::new().unwrap();
        let mut app = sample("a", 3001);
        app.source_dir = dir.path().to_path_buf();
        app.project_info = ProjectInfo {
            start_command: Some("npx next start".to_string()),
            ..ProjectInfo::unknown()
        };

        let (program, args) = launch_command(&app).unwrap();
        assert_eq!(program, "npx");
        assert_eq!(args, vec!["next", "start"]);
    }

    #[test]
    fn test_launch_command_falls_back_to_entry_point() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"main": "bot.js"}"#).unwrap();
        let mut app = sample("a", 3001);
        app.source_dir = dir.path().to_path_buf();

        assert_eq!(
            launch_command(&app).unwrap(),
            ("node".to_string(), vec!["bot.js".to_string()])
        );

        let empty = TempDir::new().unwrap();
        app.source_dir = empty.path().to_path_buf();
        assert_eq!(
            launch_command(&app).unwrap(),
            ("node".to_string(), vec!["index.js".to_string()])
        );
    }

    struct Fixture {
        dir: TempDir,
        repo: AppRepository,
        ports: Arc<PortAllocator>,
        launcher: Arc<LingeringLauncher>,
        supervisor: Arc<Supervisor>,
    }

    /// One registered app "blog" behind a supervisor with a lingering launcher
    async fn fixture(range: PortRange) -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = AppRepository::new(Arc::new(MemoryStore::new()));
        let ports = Arc::new(
            PortAllocator::open(dir.path().join("data/ports.json"), range)
                .await
                .unwrap(),
        );
        let port = ports.allocate("blog").await.unwrap();
        let mut app = sample("blog", port);
        app.root_dir = dir.path().join("blog");
        app.source_dir = app.root_dir.join("source");
        std::fs::create_dir_all(&app.source_dir).unwrap();
        repo.insert(&app).unwrap();

        let launcher = Arc::new(LingeringLauncher::default());
        let supervisor = Supervisor::new(
            repo.clone(),
            launcher.clone(),
            Arc::clone(&ports),
            RouteManager::new(dir.path().join("nginx")),
            SupervisorConfig::default(),
        );
        Fixture {
            dir,
            repo,
            ports,
            launcher,
            supervisor,
        }
    }

    #[tokio::test]
    async fn test_exit_after_delete_does_not_recreate_lock() {
        let f = fixture(PortRange::new(46000, 46009)).await;

        f.supervisor.start("blog").await.unwrap();
        f.supervisor.delete_application("blog").await.unwrap();
        assert!(!f.supervisor.locks.contains_key("blog"));
        assert!(f.repo.find("blog").unwrap().is_none());
        assert!(f.ports.list_used().await.is_empty());

        // The process only now gets around to exiting
        for tx in f.launcher.exits.lock().drain(..) {
            let _ = tx.send(ExitInfo::unknown());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!f.supervisor.locks.contains_key("blog"));
        assert!(!f.supervisor.is_running("blog"));
    }

    #[tokio::test]
    async fn test_delete_finishes_when_port_release_fails() {
        let f = fixture(PortRange::new(46010, 46019)).await;
        f.supervisor.start("blog").await.unwrap();

        // A directory where the ledger file should be makes the rewrite fail
        let ledger = f.dir.path().join("data/ports.json");
        std::fs::remove_file(&ledger).unwrap();
        std::fs::create_dir_all(ledger.join("occupied")).unwrap();

        f.supervisor.delete_application("blog").await.unwrap();

        assert!(!f.supervisor.is_running("blog"));
        assert!(f.repo.find("blog").unwrap().is_none());
        assert!(!f.dir.path().join("blog").exists());
    }
}
