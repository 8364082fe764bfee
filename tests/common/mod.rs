//! Fakes and fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use hostgate::app::AppRepository;
use hostgate::config::{DeployConfig, PortRange, SupervisorConfig};
use hostgate::deploy::Deployer;
use hostgate::launcher::{ExitInfo, LaunchSpec, LaunchedProcess, Launcher, ProcessControl};
use hostgate::ports::PortAllocator;
use hostgate::process::Supervisor;
use hostgate::quota::{QuotaOracle, Unlimited};
use hostgate::routes::RouteManager;
use hostgate::source::SourceFetcher;
use hostgate::store::MemoryStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

type ExitSenders = Arc<Mutex<HashMap<u32, oneshot::Sender<ExitInfo>>>>;

/// Launcher that hands out fake pids and lets the test decide when processes exit
pub struct FakeLauncher {
    next_pid: AtomicU32,
    launches: Mutex<Vec<LaunchSpec>>,
    exits: ExitSenders,
    terminated: Arc<Mutex<Vec<u32>>>,
    /// When false, terminate() records the request but the process keeps running
    exit_on_terminate: bool,
    pub fail: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Processes ignore SIGTERM until [`exit`](Self::exit) is called
    pub fn lingering() -> Arc<Self> {
        Self::build(false)
    }

    fn build(exit_on_terminate: bool) -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(10_000),
            launches: Mutex::new(Vec::new()),
            exits: Arc::new(Mutex::new(HashMap::new())),
            terminated: Arc::new(Mutex::new(Vec::new())),
            exit_on_terminate,
            fail: AtomicBool::new(false),
        })
    }

    /// Deliver an exit notification for `pid`; false if it already exited
    pub fn exit(&self, pid: u32, code: i32) -> bool {
        match self.exits.lock().remove(&pid) {
            Some(tx) => tx
                .send(ExitInfo {
                    code: Some(code),
                    signal: None,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

struct FakeControl {
    pid: u32,
    exits: ExitSenders,
    terminated: Arc<Mutex<Vec<u32>>>,
    exit_on_terminate: bool,
}

impl ProcessControl for FakeControl {
    fn terminate(&self) {
        self.terminated.lock().push(self.pid);
        if self.exit_on_terminate {
            if let Some(tx) = self.exits.lock().remove(&self.pid) {
                let _ = tx.send(ExitInfo {
                    code: None,
                    signal: Some(15),
                });
            }
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<LaunchedProcess> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("spawn refused");
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.exits.lock().insert(pid, tx);
        self.launches.lock().push(spec);
        Ok(LaunchedProcess {
            pid,
            control: Arc::new(FakeControl {
                pid,
                exits: Arc::clone(&self.exits),
                terminated: Arc::clone(&self.terminated),
                exit_on_terminate: self.exit_on_terminate,
            }),
            exited: rx,
        })
    }
}

/// Fetcher that writes a fixed file set instead of cloning or unzipping
#[derive(Default)]
pub struct FakeFetcher {
    files: Vec<(String, String)>,
    /// Archive contents are nested under this directory, like a zipped folder
    wrapper: Option<String>,
    fail: Option<String>,
    pub remote_calls: AtomicUsize,
    pub archive_calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn wrapped_in(mut self, dir: &str) -> Self {
        self.wrapper = Some(dir.to_string());
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn write_files(&self, dest: &Path) -> anyhow::Result<()> {
        let base = match &self.wrapper {
            Some(w) => dest.join(w),
            None => dest.to_path_buf(),
        };
        std::fs::create_dir_all(&base)?;
        for (path, content) in &self.files {
            let target = base.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch_remote(&self, _url: &str, dest: &Path) -> anyhow::Result<()> {
        self.remote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail {
            // A failed clone can leave a partial checkout behind
            std::fs::create_dir_all(dest.join(".git"))?;
            anyhow::bail!("{}", message);
        }
        self.write_files(dest)
    }

    async fn extract_archive(&self, _archive: &Path, dest: &Path) -> anyhow::Result<()> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail {
            anyhow::bail!("{}", message);
        }
        self.write_files(dest)
    }
}

/// A complete platform wired to fakes under one temporary directory
pub struct Platform {
    pub dir: TempDir,
    pub repo: AppRepository,
    pub ports: Arc<PortAllocator>,
    pub routes: RouteManager,
    pub launcher: Arc<FakeLauncher>,
    pub supervisor: Arc<Supervisor>,
    pub deployer: Arc<Deployer>,
    pub fetcher: Arc<FakeFetcher>,
}

pub struct PlatformBuilder {
    range: PortRange,
    fetcher: FakeFetcher,
    launcher: Arc<FakeLauncher>,
    quota: Arc<dyn QuotaOracle>,
    deploy: DeployConfig,
    supervisor: SupervisorConfig,
}

impl PlatformBuilder {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            fetcher: FakeFetcher::with_files(&[("index.html", "<h1>hi</h1>")]),
            launcher: FakeLauncher::new(),
            quota: Arc::new(Unlimited),
            deploy: DeployConfig {
                base_domain: "apps.test".to_string(),
                ..Default::default()
            },
            supervisor: SupervisorConfig {
                restart_grace_ms: 200,
                kill_grace_secs: 1,
            },
        }
    }

    pub fn fetcher(mut self, fetcher: FakeFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn launcher(mut self, launcher: Arc<FakeLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaOracle>) -> Self {
        self.quota = quota;
        self
    }

    pub fn deploy_config(mut self, f: impl FnOnce(&mut DeployConfig)) -> Self {
        f(&mut self.deploy);
        self
    }

    pub async fn build(self) -> Platform {
        let dir = TempDir::new().unwrap();
        let repo = AppRepository::new(Arc::new(MemoryStore::new()));
        self.build_with(dir, repo).await
    }

    /// Build on a caller-provided repository, e.g. to share it with a quota oracle
    pub async fn build_with(self, dir: TempDir, repo: AppRepository) -> Platform {
        let ports = Arc::new(
            PortAllocator::open(dir.path().join("data/ports.json"), self.range)
                .await
                .unwrap(),
        );
        let routes = RouteManager::new(dir.path().join("nginx"));
        let supervisor = Supervisor::new(
            repo.clone(),
            self.launcher.clone(),
            Arc::clone(&ports),
            routes.clone(),
            self.supervisor,
        );
        let fetcher = Arc::new(self.fetcher);
        let deployer = Arc::new(Deployer::new(
            self.deploy,
            dir.path().join("sites"),
            repo.clone(),
            Arc::clone(&ports),
            routes.clone(),
            fetcher.clone(),
            self.quota,
            Arc::clone(&supervisor),
        ));
        Platform {
            dir,
            repo,
            ports,
            routes,
            launcher: self.launcher,
            supervisor,
            deployer,
            fetcher,
        }
    }
}

impl Platform {
    pub fn apps_dir(&self) -> PathBuf {
        self.dir.path().join("sites")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("uploads");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a placeholder upload and return its path
    pub fn upload(&self, name: &str) -> PathBuf {
        let path = self.uploads_dir().join(name);
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        path
    }
}

/// Let spawned exit watchers run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
