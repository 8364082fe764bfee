//! Deploy pipeline
//!
//! A deploy walks a fixed sequence of stages:
//!
//! ```text
//! acquiring -> detecting -> installing -> building -> allocating
//!           -> configuring -> registering -> starting -> done
//! ```
//!
//! Any hard failure from `acquiring` through `allocating` moves the run to
//! `aborted` and removes everything the run created. Install and build
//! failures are collected as warnings instead. Once a record is registered it
//! is never rolled back, even if the final start fails.

use crate::app::{AppRepository, AppSource, AppStatus, Application};
use crate::config::DeployConfig;
use crate::detector::{self, ProjectInfo};
use crate::error::{HostError, HostResult};
use crate::launcher::run_with_timeout;
use crate::names::{normalize, validate_app_name, validate_remote_ref};
use crate::ports::PortAllocator;
use crate::process::Supervisor;
use crate::quota::QuotaOracle;
use crate::routes::{self, RouteManager, RouteOptions};
use crate::source::{hoist_single_wrapper, SourceFetcher};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Acquiring,
    Detecting,
    Installing,
    Building,
    Allocating,
    Configuring,
    Registering,
    Starting,
    Done,
    Aborted,
}

impl DeployStage {
    /// Successor on the success path
    pub fn next(self) -> Option<DeployStage> {
        use DeployStage::*;
        match self {
            Acquiring => Some(Detecting),
            Detecting => Some(Installing),
            Installing => Some(Building),
            Building => Some(Allocating),
            Allocating => Some(Configuring),
            Configuring => Some(Registering),
            Registering => Some(Starting),
            Starting => Some(Done),
            Done | Aborted => None,
        }
    }

    /// Stages whose failure rolls the whole deploy back
    pub fn can_abort(self) -> bool {
        matches!(
            self,
            DeployStage::Acquiring
                | DeployStage::Detecting
                | DeployStage::Installing
                | DeployStage::Building
                | DeployStage::Allocating
        )
    }

    pub fn can_advance_to(self, to: DeployStage) -> bool {
        self.next() == Some(to) || (to == DeployStage::Aborted && self.can_abort())
    }
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployStage::Acquiring => "acquiring",
            DeployStage::Detecting => "detecting",
            DeployStage::Installing => "installing",
            DeployStage::Building => "building",
            DeployStage::Allocating => "allocating",
            DeployStage::Configuring => "configuring",
            DeployStage::Registering => "registering",
            DeployStage::Starting => "starting",
            DeployStage::Done => "done",
            DeployStage::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Tracks the stage of one deploy and records every transition
#[derive(Debug)]
pub struct DeployRun {
    app: String,
    stage: DeployStage,
    history: Vec<DeployStage>,
}

impl DeployRun {
    pub fn new(app: &str) -> Self {
        Self {
            app: app.to_string(),
            stage: DeployStage::Acquiring,
            history: vec![DeployStage::Acquiring],
        }
    }

    pub fn stage(&self) -> DeployStage {
        self.stage
    }

    pub fn history(&self) -> &[DeployStage] {
        &self.history
    }

    pub fn advance(&mut self, to: DeployStage) -> HostResult<()> {
        if !self.stage.can_advance_to(to) {
            return Err(HostError::Internal(anyhow::anyhow!(
                "invalid deploy transition {} -> {}",
                self.stage,
                to
            )));
        }
        debug!(app = %self.app, from = %self.stage, to = %to, "Deploy stage");
        self.stage = to;
        self.history.push(to);
        Ok(())
    }
}

/// Non-fatal problem recorded during a deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployWarning {
    pub stage: DeployStage,
    pub message: String,
}

/// Result of a deploy that produced a record
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub app: Application,
    pub warnings: Vec<DeployWarning>,
    /// Set when the record was created but the process did not start
    pub start_error: Option<String>,
    pub stages: Vec<DeployStage>,
}

/// Per-request deploy settings
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Identity checked against the quota oracle and stored as the record owner
    pub caller: String,
    /// Public hostname to serve instead of `<name>.<base_domain>`
    pub custom_domain: Option<String>,
}

impl DeployOptions {
    pub fn for_caller(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            custom_domain: None,
        }
    }
}

/// Answer to a name availability query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameCheck {
    pub available: bool,
    pub normalized: String,
}

enum Acquire<'a> {
    Remote(&'a str),
    Archive(&'a Path),
}

/// Removes a name from the in-flight set when the deploy ends
struct Reservation<'a> {
    in_flight: &'a DashMap<String, ()>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.name);
    }
}

/// Runs deploys against shared platform services
pub struct Deployer {
    config: DeployConfig,
    apps_dir: PathBuf,
    repo: AppRepository,
    ports: Arc<PortAllocator>,
    routes: RouteManager,
    fetcher: Arc<dyn SourceFetcher>,
    quota: Arc<dyn QuotaOracle>,
    supervisor: Arc<Supervisor>,
    /// Names claimed by deploys that have not registered yet
    in_flight: DashMap<String, ()>,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DeployConfig,
        apps_dir: impl Into<PathBuf>,
        repo: AppRepository,
        ports: Arc<PortAllocator>,
        routes: RouteManager,
        fetcher: Arc<dyn SourceFetcher>,
        quota: Arc<dyn QuotaOracle>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            config,
            apps_dir: apps_dir.into(),
            repo,
            ports,
            routes,
            fetcher,
            quota,
            supervisor,
            in_flight: DashMap::new(),
        }
    }

    /// Whether `raw` would be accepted as a new application name
    pub fn check_name(&self, raw: &str) -> HostResult<NameCheck> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Ok(NameCheck {
                available: false,
                normalized,
            });
        }
        let available = !self.repo.exists(&normalized)?
            && !self.in_flight.contains_key(&normalized)
            && !self.apps_dir.join(&normalized).exists();
        Ok(NameCheck {
            available,
            normalized,
        })
    }

    /// Clone `reference` and deploy it as `raw_name`
    pub async fn deploy_from_remote(
        &self,
        reference: &str,
        raw_name: &str,
        options: &DeployOptions,
    ) -> HostResult<DeployOutcome> {
        let name = validate_app_name(raw_name)?;
        let url = validate_remote_ref(reference)?;
        self.validate_options(options)?;

        let _reservation = self.admit(&name, &options.caller)?;
        info!(app = %name, url = %url, "Deploying from repository");

        self.run(
            &name,
            Acquire::Remote(url.as_str()),
            AppSource::Git {
                repo_url: url.to_string(),
            },
            options,
        )
        .await
    }

    /// Extract the uploaded archive at `archive` and deploy it as `raw_name`.
    ///
    /// The archive is consumed: it is deleted whether the deploy succeeds or not.
    pub async fn deploy_from_archive(
        &self,
        archive: &Path,
        raw_name: &str,
        options: &DeployOptions,
    ) -> HostResult<DeployOutcome> {
        if !archive.is_file() {
            return Err(HostError::invalid(format!(
                "uploaded archive {} not found",
                archive.display()
            )));
        }

        let admitted = validate_app_name(raw_name).and_then(|name| {
            self.validate_options(options)?;
            let reservation = self.admit(&name, &options.caller)?;
            Ok((name, reservation))
        });
        let (name, _reservation) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                remove_archive(archive).await;
                return Err(e);
            }
        };
        info!(app = %name, archive = %archive.display(), "Deploying from archive");

        self.run(&name, Acquire::Archive(archive), AppSource::Archive, options)
            .await
    }

    fn validate_options(&self, options: &DeployOptions) -> HostResult<()> {
        match &options.custom_domain {
            Some(domain) if !routes::is_valid_domain(domain) => Err(HostError::invalid(format!(
                "invalid custom domain \"{}\"",
                domain
            ))),
            _ => Ok(()),
        }
    }

    /// Quota and uniqueness checks, then claim the name for this deploy
    fn admit(&self, name: &str, caller: &str) -> HostResult<Reservation<'_>> {
        let quota = self.quota.quota(caller)?;
        if quota.exceeded() {
            warn!(caller = %caller, used = quota.app_count, max = quota.max_apps, "Deploy rejected by quota");
            return Err(HostError::QuotaExceeded {
                used: quota.app_count,
                max: quota.max_apps,
            });
        }

        let reservation = match self.in_flight.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(HostError::NameConflict(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Reservation {
                    in_flight: &self.in_flight,
                    name: name.to_string(),
                }
            }
        };

        // An orphaned root on disk would otherwise be shared with the new record
        if self.repo.exists(name)? || self.apps_dir.join(name).exists() {
            return Err(HostError::NameConflict(name.to_string()));
        }
        Ok(reservation)
    }

    async fn run(
        &self,
        name: &str,
        acquire: Acquire<'_>,
        source: AppSource,
        options: &DeployOptions,
    ) -> HostResult<DeployOutcome> {
        let mut run = DeployRun::new(name);
        let mut warnings = Vec::new();
        let root_dir = self.apps_dir.join(name);
        let source_dir = root_dir.join("source");
        let archive = match acquire {
            Acquire::Archive(path) => Some(path),
            Acquire::Remote(_) => None,
        };

        // Acquiring
        if let Err(e) = self.acquire(&acquire, &root_dir, &source_dir).await {
            error!(app = %name, error = %format!("{:#}", e), "Source acquisition failed");
            self.abort(&mut run, &root_dir, archive).await;
            return Err(HostError::AcquisitionFailure(format!("{:#}", e)));
        }
        if let Some(archive) = archive {
            remove_archive(archive).await;
        }

        // Detecting
        run.advance(DeployStage::Detecting)?;
        let project = detector::detect(&source_dir);
        info!(app = %name, kind = %project.kind, "Project type detected");

        let has_manifest = source_dir.join("package.json").is_file();

        // Installing
        run.advance(DeployStage::Installing)?;
        if has_manifest {
            if let Err(message) = self
                .run_step(name, &self.config.install_command, &source_dir, self.config.install_timeout())
                .await
            {
                warn!(app = %name, error = %message, "Dependency install failed, continuing");
                warnings.push(DeployWarning {
                    stage: DeployStage::Installing,
                    message,
                });
            }
        }

        // Building
        run.advance(DeployStage::Building)?;
        if let (true, Some(build)) = (has_manifest, project.build_command.as_deref()) {
            if let Err(message) = self
                .run_step(name, build, &source_dir, self.config.build_timeout())
                .await
            {
                warn!(app = %name, error = %message, "Build failed, continuing");
                warnings.push(DeployWarning {
                    stage: DeployStage::Building,
                    message,
                });
            }
        }

        // Allocating
        run.advance(DeployStage::Allocating)?;
        let port = match self.ports.allocate(name).await {
            Ok(port) => port,
            Err(e) => {
                error!(app = %name, error = %e, "Port allocation failed");
                self.abort(&mut run, &root_dir, None).await;
                return Err(e);
            }
        };

        // Configuring
        run.advance(DeployStage::Configuring)?;
        let domain = options
            .custom_domain
            .clone()
            .unwrap_or_else(|| routes::subdomain(name, &self.config.base_domain));
        if let Err(e) = self.configure_route(name, port, &domain, options).await {
            warn!(app = %name, error = %format!("{:#}", e), "Route config not written");
            warnings.push(DeployWarning {
                stage: DeployStage::Configuring,
                message: format!("{:#}", e),
            });
        }

        // Registering
        run.advance(DeployStage::Registering)?;
        let now = Utc::now();
        let app = Application {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner: options.caller.clone(),
            port,
            domain,
            project_type: project.kind,
            project_info: project.clone(),
            source,
            source_dir: source_dir.clone(),
            root_dir: root_dir.clone(),
            status: AppStatus::Stopped,
            pid: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.repo.insert(&app) {
            error!(app = %name, error = %e, "Failed to register application, rolling back");
            self.rollback_unregistered(name, port, &root_dir).await;
            return Err(e.into());
        }
        info!(app = %name, port, domain = %app.domain, "Application registered");

        // Starting
        run.advance(DeployStage::Starting)?;
        let start_error = self.auto_start(name, &project, &warnings).await;

        run.advance(DeployStage::Done)?;
        let app = match self.repo.find(name) {
            Ok(Some(stored)) => stored,
            _ => app,
        };
        info!(app = %name, warnings = warnings.len(), "Deploy finished");

        Ok(DeployOutcome {
            app,
            warnings,
            start_error,
            stages: run.history().to_vec(),
        })
    }

    async fn acquire(
        &self,
        acquire: &Acquire<'_>,
        root_dir: &Path,
        source_dir: &Path,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(root_dir).await?;
        match acquire {
            Acquire::Remote(url) => self.fetcher.fetch_remote(url, source_dir).await,
            Acquire::Archive(archive) => {
                self.fetcher.extract_archive(archive, source_dir).await?;
                hoist_single_wrapper(source_dir).await?;
                Ok(())
            }
        }
    }

    /// Run an install or build command in the source tree; errors come back as warning text
    async fn run_step(
        &self,
        app: &str,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<(), String> {
        let parts = shell_words::split(command).map_err(|e| format!("{}: {}", command, e))?;
        let Some((program, args)) = parts.split_first() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        info!(app = %app, command = %command, "Running");
        let output = run_with_timeout(program, &args, Some(cwd), &[], timeout)
            .await
            .map_err(|e| format!("{}: {:#}", command, e))?;

        if output.status.success() {
            debug!(app = %app, command = %command, "Completed");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "{} exited with {}: {}",
                command,
                output.status,
                excerpt(stderr.trim(), 500)
            ))
        }
    }

    async fn configure_route(
        &self,
        name: &str,
        port: u16,
        domain: &str,
        options: &DeployOptions,
    ) -> anyhow::Result<()> {
        let route_options = RouteOptions {
            tls: self.config.tls,
            custom_domain: options.custom_domain.clone(),
            cert_dir: self.config.cert_dir.clone(),
        };
        let text = routes::generate(name, port, domain, &route_options);
        self.routes.save(name, &text).await?;
        self.routes.reload();
        if self.config.tls {
            self.routes.setup_tls(domain, &self.config.tls_email);
        }
        Ok(())
    }

    async fn auto_start(
        &self,
        name: &str,
        project: &ProjectInfo,
        warnings: &[DeployWarning],
    ) -> Option<String> {
        if !self.config.auto_start {
            debug!(app = %name, "Auto-start disabled");
            return None;
        }
        let build_failed = warnings
            .iter()
            .any(|w| matches!(w.stage, DeployStage::Installing | DeployStage::Building));
        if build_failed && !self.config.start_after_failed_build {
            info!(app = %name, "Skipping auto-start after failed install/build");
            return None;
        }

        match self.supervisor.start(name).await {
            Ok(_) => None,
            Err(e) => {
                error!(app = %name, kind = %project.kind, error = %e, "Deployed but failed to start");
                Some(e.to_string())
            }
        }
    }

    /// Roll back a run that failed before a record existed
    async fn abort(&self, run: &mut DeployRun, root_dir: &Path, archive: Option<&Path>) {
        let failed_at = run.stage();
        if let Err(e) = run.advance(DeployStage::Aborted) {
            error!(error = %e, "Abort from a non-abortable stage");
        }
        remove_root(root_dir).await;
        if let Some(archive) = archive {
            remove_archive(archive).await;
        }
        info!(stage = %failed_at, root = %root_dir.display(), "Deploy aborted, cleaned up");
    }

    async fn rollback_unregistered(&self, name: &str, port: u16, root_dir: &Path) {
        if let Err(e) = self.ports.release(port).await {
            warn!(app = %name, port, error = %e, "Failed to release port during rollback");
        }
        if let Err(e) = self.routes.remove(name).await {
            warn!(app = %name, error = %e, "Failed to remove route config during rollback");
        }
        remove_root(root_dir).await;
    }
}

async fn remove_root(root_dir: &Path) {
    match tokio::fs::remove_dir_all(root_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %root_dir.display(), error = %e, "Failed to remove application root"),
    }
}

async fn remove_archive(archive: &Path) {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => debug!(archive = %archive.display(), "Archive removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(archive = %archive.display(), error = %e, "Failed to remove archive"),
    }
}

/// Last `max` bytes of `text`, cut on a char boundary
fn excerpt(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path_transitions() {
        let mut run = DeployRun::new("app");
        let mut stage = DeployStage::Acquiring;
        while let Some(next) = stage.next() {
            run.advance(next).unwrap();
            stage = next;
        }
        assert_eq!(run.stage(), DeployStage::Done);
        assert_eq!(run.history().len(), 9);
    }

    #[test]
    fn test_abort_only_up_to_allocating() {
        use DeployStage::*;
        for stage in [Acquiring, Detecting, Installing, Building, Allocating] {
            assert!(stage.can_advance_to(Aborted), "{}", stage);
        }
        for stage in [Configuring, Registering, Starting, Done, Aborted] {
            assert!(!stage.can_advance_to(Aborted), "{}", stage);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut run = DeployRun::new("app");
        assert!(run.advance(DeployStage::Building).is_err());
        assert_eq!(run.stage(), DeployStage::Acquiring);

        run.advance(DeployStage::Aborted).unwrap();
        assert!(run.advance(DeployStage::Detecting).is_err());
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(
            serde_json::to_value(DeployStage::Allocating).unwrap(),
            "allocating"
        );
        assert_eq!(DeployStage::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("0123456789", 4), "6789");
        assert_eq!(excerpt("aé", 1), "");
    }
}
