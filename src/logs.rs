//! Per-application log files

use crate::error::HostError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default number of lines returned by a log query
pub const DEFAULT_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Out,
    Error,
}

impl LogStream {
    pub fn file_name(&self) -> &'static str {
        match self {
            LogStream::Out => "out.log",
            LogStream::Error => "error.log",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out" | "stdout" => Ok(LogStream::Out),
            "error" | "err" | "stderr" => Ok(LogStream::Error),
            other => Err(HostError::invalid(format!(
                "unknown log stream \"{}\" (expected out or error)",
                other
            ))),
        }
    }
}

/// Log directory under an application root
pub fn log_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn log_path(root: &Path, stream: LogStream) -> PathBuf {
    log_dir(root).join(stream.file_name())
}

/// Bytes read per step when scanning a log backwards
const TAIL_CHUNK: u64 = 8 * 1024;

/// Last `lines` lines of a log file; a missing file reads as empty
///
/// Reads backwards from the end in fixed-size chunks, so the cost depends on
/// the lines requested rather than on how large the log has grown.
pub async fn tail(path: &Path, lines: usize) -> anyhow::Result<String> {
    if lines == 0 {
        return Ok(String::new());
    }
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open log {}", path.display()))
        }
    };
    let len = file
        .metadata()
        .await
        .with_context(|| format!("Failed to stat log {}", path.display()))?
        .len();

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0;
    // One newline more than requested marks the start of the first wanted line
    while pos > 0 && newlines <= lines {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        let mut chunk = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(pos)).await?;
        file.read_exact(&mut chunk)
            .await
            .with_context(|| format!("Failed to read log {}", path.display()))?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }
    Ok(last_lines(&String::from_utf8_lossy(&buf), lines))
}

fn last_lines(content: &str, lines: usize) -> String {
    if lines == 0 {
        return String::new();
    }
    let content = content.strip_suffix('\n').unwrap_or(content);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
