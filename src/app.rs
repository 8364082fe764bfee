//! Application records and typed access to the `Applications` collection

use crate::detector::{ProjectInfo, ProjectKind};
use crate::store::{Filter, RecordStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Collection holding one record per deployed application
pub const APPLICATIONS: &str = "Applications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppStatus::Stopped => write!(f, "stopped"),
            AppStatus::Running => write!(f, "running"),
        }
    }
}

/// Where the application's source came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppSource {
    Git { repo_url: String },
    Archive,
}

/// Durable descriptor of one deployed application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    /// Canonical name, unique across records
    pub name: String,
    /// Caller that deployed the application, used for quota accounting
    pub owner: String,
    pub port: u16,
    pub domain: String,
    pub project_type: ProjectKind,
    pub project_info: ProjectInfo,
    pub source: AppSource,
    /// Working directory of the application
    pub source_dir: PathBuf,
    /// Per-application root; contains `source/` and `logs/`
    pub root_dir: PathBuf,
    pub status: AppStatus,
    /// Present only while running
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed wrapper around the record store
#[derive(Clone)]
pub struct AppRepository {
    store: Arc<dyn RecordStore>,
}

impl AppRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    fn by_name(name: &str) -> Filter {
        Filter::eq("name", name)
    }

    pub fn find(&self, name: &str) -> Result<Option<Application>> {
        self.store
            .find_one(APPLICATIONS, &Self::by_name(name))?
            .map(|v| serde_json::from_value(v).context("Malformed application record"))
            .transpose()
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.count(APPLICATIONS, &Self::by_name(name))? > 0)
    }

    pub fn insert(&self, app: &Application) -> Result<()> {
        self.store
            .insert(APPLICATIONS, serde_json::to_value(app)?)
            .with_context(|| format!("Failed to persist application {}", app.name))
    }

    /// Record a freshly spawned process
    pub fn set_running(&self, name: &str, pid: u32) -> Result<bool> {
        let changed = self.store.update(
            APPLICATIONS,
            &Self::by_name(name),
            json!({
                "status": AppStatus::Running,
                "pid": pid,
                "updated_at": Utc::now(),
            }),
        )?;
        Ok(changed > 0)
    }

    /// Mark stopped and clear the process id
    pub fn set_stopped(&self, name: &str) -> Result<bool> {
        let changed = self.store.update(
            APPLICATIONS,
            &Self::by_name(name),
            json!({
                "status": AppStatus::Stopped,
                "pid": null,
                "updated_at": Utc::now(),
            }),
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.store.delete(APPLICATIONS, &Self::by_name(name))? > 0)
    }

    pub fn list(&self) -> Result<Vec<Application>> {
        self.store
            .find_many(APPLICATIONS, &Filter::all())?
            .into_iter()
            .map(|v| serde_json::from_value(v).context("Malformed application record"))
            .collect()
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count(APPLICATIONS, &Filter::all())
    }

    pub fn count_owned_by(&self, owner: &str) -> Result<usize> {
        self.store.count(APPLICATIONS, &Filter::eq("owner", owner))
    }
}
