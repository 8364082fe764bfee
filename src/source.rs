//! Source acquisition: shallow git clones and archive extraction

use crate::launcher::run_with_timeout;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Populates a working directory with application source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Shallow-clone `url` into `dest`, which must not exist yet
    async fn fetch_remote(&self, url: &str, dest: &Path) -> Result<()>;

    /// Extract `archive` into `dest`
    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Fetcher that shells out to `git` and `unzip`
pub struct CliFetcher {
    clone_timeout: Duration,
    extract_timeout: Duration,
}

impl CliFetcher {
    pub fn new(clone_timeout: Duration) -> Self {
        Self {
            clone_timeout,
            extract_timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl SourceFetcher for CliFetcher {
    async fn fetch_remote(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url = %url, dest = %dest.display(), "Cloning repository");

        let dest_arg = dest.to_string_lossy();
        let output = run_with_timeout(
            "git",
            &["clone", "--depth", "1", "--", url, &dest_arg],
            None,
            // Never block on a credential prompt
            &[("GIT_TERMINAL_PROMPT", "0")],
            self.clone_timeout,
        )
        .await
        .context("git clone failed")?;

        if !output.status.success() {
            anyhow::bail!(
                "git clone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<()> {
        info!(archive = %archive.display(), dest = %dest.display(), "Extracting archive");

        tokio::fs::create_dir_all(dest).await?;
        let archive_arg = archive.to_string_lossy();
        let dest_arg = dest.to_string_lossy();
        let output = run_with_timeout(
            "unzip",
            &["-q", "-o", &archive_arg, "-d", &dest_arg],
            None,
            &[],
            self.extract_timeout,
        )
        .await
        .context("unzip failed")?;

        if !output.status.success() {
            anyhow::bail!(
                "unzip exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// If `dir` holds exactly one entry and it is a directory, move its contents up a level.
///
/// Returns whether a wrapper was removed.
pub async fn hoist_single_wrapper(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    let Some(first) = entries.next_entry().await? else {
        return Ok(false);
    };
    if entries.next_entry().await?.is_some() || !first.file_type().await?.is_dir() {
        return Ok(false);
    }

    // Move the wrapper aside first so a child sharing its name cannot collide
    let wrapper = dir.join(format!(".hoist-{}", uuid::Uuid::new_v4()));
    tokio::fs::rename(first.path(), &wrapper).await?;

    let mut children = tokio::fs::read_dir(&wrapper).await?;
    while let Some(child) = children.next_entry().await? {
        tokio::fs::rename(child.path(), dir.join(child.file_name())).await?;
    }
    tokio::fs::remove_dir(&wrapper).await?;

    debug!(
        dir = %dir.display(),
        wrapper = %first.file_name().to_string_lossy(),
        "Hoisted archive wrapper directory"
    );
    Ok(true)
}
