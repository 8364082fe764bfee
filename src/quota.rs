//! Authorization and quota oracle consulted before a deploy

use crate::app::AppRepository;

/// Current usage and limit for one caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub app_count: usize,
    /// Maximum number of applications; 0 means unlimited
    pub max_apps: usize,
}

impl Quota {
    pub fn exceeded(&self) -> bool {
        self.max_apps > 0 && self.app_count >= self.max_apps
    }
}

/// Answers "what may this caller still deploy"
pub trait QuotaOracle: Send + Sync {
    fn quota(&self, caller: &str) -> anyhow::Result<Quota>;
}

/// Oracle that never limits anyone
pub struct Unlimited;

impl QuotaOracle for Unlimited {
    fn quota(&self, _caller: &str) -> anyhow::Result<Quota> {
        Ok(Quota {
            app_count: 0,
            max_apps: 0,
        })
    }
}

/// Counts the caller's applications in the record store against a flat limit
pub struct StoreQuota {
    repo: AppRepository,
    max_apps: usize,
}

impl StoreQuota {
    pub fn new(repo: AppRepository, max_apps: usize) -> Self {
        Self { repo, max_apps }
    }
}

impl QuotaOracle for StoreQuota {
    fn quota(&self, caller: &str) -> anyhow::Result<Quota> {
        Ok(Quota {
            app_count: self.repo.count_owned_by(caller)?,
            max_apps: self.max_apps,
        })
    }
}
