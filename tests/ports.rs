//! Port allocator behavior under concurrency and across restarts

use hostgate::config::PortRange;
use hostgate::error::HostError;
use hostgate::ports::PortAllocator;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_concurrent_allocations_are_unique() {
    let dir = TempDir::new().unwrap();
    let range = PortRange::new(44000, 44031);
    let ports = Arc::new(
        PortAllocator::open(dir.path().join("ports.json"), range)
            .await
            .unwrap(),
    );

    let handles: Vec<_> = (0..24)
        .map(|i| {
            let ports = Arc::clone(&ports);
            tokio::spawn(async move { ports.allocate(&format!("app-{}", i)).await })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        let port = handle.await.unwrap().unwrap();
        assert!(range.contains(port));
        assert!(seen.insert(port), "port {} handed out twice", port);
    }
    assert_eq!(ports.list_used().await, seen);
}

#[tokio::test]
async fn test_ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let ledger = dir.path().join("data").join("ports.json");
    let range = PortRange::new(44040, 44049);

    let first = {
        let ports = PortAllocator::open(&ledger, range).await.unwrap();
        let a = ports.allocate("a").await.unwrap();
        let b = ports.allocate("b").await.unwrap();
        ports.release(a).await.unwrap();
        b
    };

    let reopened = PortAllocator::open(&ledger, range).await.unwrap();
    assert_eq!(reopened.list_used().await, BTreeSet::from([first]));

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&ledger).unwrap()).unwrap();
    assert_eq!(raw["usedPorts"], serde_json::json!([first]));
    assert_eq!(raw["portRange"]["min"], 44040);
}

#[tokio::test]
async fn test_exhaustion_and_release() {
    let dir = TempDir::new().unwrap();
    let range = PortRange::new(44050, 44051);
    let ports = PortAllocator::open(dir.path().join("ports.json"), range)
        .await
        .unwrap();

    let a = ports.allocate("a").await.unwrap();
    let _b = ports.allocate("b").await.unwrap();
    assert!(matches!(
        ports.allocate("c").await,
        Err(HostError::NoPortAvailable {
            min: 44050,
            max: 44051
        })
    ));

    ports.release(a).await.unwrap();
    // Releasing twice is harmless
    ports.release(a).await.unwrap();
    assert_eq!(ports.allocate("c").await.unwrap(), a);
}

#[tokio::test]
async fn test_bound_port_is_skipped() {
    let dir = TempDir::new().unwrap();
    let Ok(listener) = std::net::TcpListener::bind("127.0.0.1:44060") else {
        eprintln!("Skipping test: port 44060 unavailable");
        return;
    };
    let range = PortRange::new(44060, 44062);
    let ports = PortAllocator::open(dir.path().join("ports.json"), range)
        .await
        .unwrap();

    let port = ports.allocate("a").await.unwrap();
    assert_ne!(port, 44060);
    drop(listener);
}
