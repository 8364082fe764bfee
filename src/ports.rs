//! Port allocation for deployed applications
//!
//! Every deployed application owns one loopback port from a configured range
//! for its whole lifetime. Allocations are recorded in a small JSON ledger
//! next to the database so they survive restarts; a port goes back to the
//! pool only when its application is deleted.

use crate::config::PortRange;
use crate::error::{HostError, HostResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk ledger format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ledger {
    used_ports: BTreeSet<u16>,
    #[serde(default)]
    port_range: Option<PortRange>,
}

/// Hands out one unused, bindable port per application
pub struct PortAllocator {
    ledger_path: PathBuf,
    range: PortRange,
    /// Guards the scan-and-reserve sequence; also the in-memory view of the ledger
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Open the ledger at `ledger_path`, creating an empty one if it does not exist
    pub async fn open(ledger_path: impl Into<PathBuf>, range: PortRange) -> anyhow::Result<Self> {
        let ledger_path = ledger_path.into();
        let used = match tokio::fs::read_to_string(&ledger_path).await {
            Ok(content) => {
                let ledger: Ledger = serde_json::from_str(&content).with_context(|| {
                    format!("Failed to parse port ledger {}", ledger_path.display())
                })?;
                if let Some(stored) = ledger.port_range {
                    if stored != range {
                        warn!(
                            stored_min = stored.min,
                            stored_max = stored.max,
                            min = range.min,
                            max = range.max,
                            "Port range changed since the ledger was written"
                        );
                    }
                }
                ledger.used_ports
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read port ledger {}", ledger_path.display())
                })
            }
        };

        let allocator = Self {
            ledger_path,
            range,
            used: Mutex::new(used),
        };
        {
            let used = allocator.used.lock().await;
            allocator.persist(&used).await?;
            debug!(count = used.len(), "Port ledger loaded");
        }
        Ok(allocator)
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Reserve the lowest port in range that is neither in the ledger nor bound by anyone else
    pub async fn allocate(&self, app_name: &str) -> HostResult<u16> {
        let mut used = self.used.lock().await;

        for port in self.range.min..=self.range.max {
            if used.contains(&port) {
                continue;
            }
            if !is_port_available(port) {
                debug!(port, "Port in use outside the ledger, skipping");
                continue;
            }

            used.insert(port);
            if let Err(e) = self.persist(&used).await {
                used.remove(&port);
                return Err(e.into());
            }
            info!(app = %app_name, port, "Port allocated");
            return Ok(port);
        }

        Err(HostError::NoPortAvailable {
            min: self.range.min,
            max: self.range.max,
        })
    }

    /// Return a port to the pool. Releasing a port that is not allocated is a no-op
    pub async fn release(&self, port: u16) -> HostResult<()> {
        let mut used = self.used.lock().await;
        if !used.remove(&port) {
            debug!(port, "Release of unallocated port ignored");
            return Ok(());
        }
        if let Err(e) = self.persist(&used).await {
            used.insert(port);
            return Err(e.into());
        }
        info!(port, "Port released");
        Ok(())
    }

    pub async fn list_used(&self) -> BTreeSet<u16> {
        self.used.lock().await.clone()
    }

    async fn persist(&self, used: &BTreeSet<u16>) -> anyhow::Result<()> {
        let ledger = Ledger {
            used_ports: used.clone(),
            port_range: Some(self.range),
        };
        let json = serde_json::to_string_pretty(&ledger)?;

        if let Some(parent) = self.ledger_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write then rename so a crash never leaves a torn ledger
        let tmp = self.ledger_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.ledger_path)
            .await
            .with_context(|| format!("Failed to replace {}", self.ledger_path.display()))?;
        Ok(())
    }
}

/// Check whether a port can be bound on the loopback interface right now
fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Find a contiguous block of currently free ports so tests don't collide with the host
    fn free_range(len: u16) -> PortRange {
        let mut start = 41000;
        'outer: while start < 60000 {
            for port in start..start + len {
                if !is_port_available(port) {
                    start = port + 1;
                    continue 'outer;
                }
            }
            return PortRange::new(start, start + len - 1);
        }
        panic!("no free port block");
    }

    #[tokio::test]
    async fn test_allocate_ascending_and_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ports.json");
        let range = free_range(5);

        let ports = PortAllocator::open(&path, range).await.unwrap();
        let a = ports.allocate("a").await.unwrap();
        let b = ports.allocate("b").await.unwrap();
        assert_eq!(a, range.min);
        assert_eq!(b, range.min + 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let ledger: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(ledger["usedPorts"], serde_json::json!([a, b]));
        assert_eq!(ledger["portRange"]["min"], range.min);

        // Reopen sees the same allocations
        let reopened = PortAllocator::open(&path, range).await.unwrap();
        assert_eq!(reopened.list_used().await, BTreeSet::from([a, b]));
        assert_eq!(reopened.allocate("c").await.unwrap(), range.min + 2);
    }

    #[tokio::test]
    async fn test_skips_ports_bound_outside_ledger() {
        let dir = TempDir::new().unwrap();
        let range = free_range(3);
        let _squatter = std::net::TcpListener::bind(("127.0.0.1", range.min)).unwrap();

        let ports = PortAllocator::open(dir.path().join("ports.json"), range)
            .await
            .unwrap();
        let port = ports.allocate("app").await.unwrap();
        assert_eq!(port, range.min + 1);
    }

    #[tokio::test]
    async fn test_exhaustion_fails() {
        let dir = TempDir::new().unwrap();
        let range = free_range(2);
        let ports = PortAllocator::open(dir.path().join("ports.json"), range)
            .await
            .unwrap();

        ports.allocate("a").await.unwrap();
        ports.allocate("b").await.unwrap();
        let err = ports.allocate("c").await.unwrap_err();
        assert!(matches!(err, HostError::NoPortAvailable { .. }));
        assert_eq!(ports.list_used().await.len(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_reusable() {
        let dir = TempDir::new().unwrap();
        let range = free_range(3);
        let ports = PortAllocator::open(dir.path().join("ports.json"), range)
            .await
            .unwrap();

        let p = ports.allocate("a").await.unwrap();
        ports.release(p).await.unwrap();
        ports.release(p).await.unwrap();
        ports.release(range.max).await.unwrap();
        assert!(ports.list_used().await.is_empty());

        assert_eq!(ports.allocate("b").await.unwrap(), p);
    }
}
