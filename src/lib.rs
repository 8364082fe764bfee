//! Hostgate - deploy and supervise small web applications on a single host
//!
//! This library provides:
//! - Deploys from a public git repository or an uploaded zip archive
//! - Project detection and install/build steps for Node-style projects
//! - Port allocation with a durable ledger
//! - nginx route config generation per application
//! - Supervision of one long-running process per application
//! - A sandboxed interactive shell channel over WebSocket

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod deploy;
pub mod detector;
pub mod error;
pub mod launcher;
pub mod logs;
pub mod names;
pub mod ports;
pub mod process;
pub mod quota;
pub mod routes;
pub mod shell;
pub mod source;
pub mod store;
