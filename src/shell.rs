//! Sandboxed interactive shell channel
//!
//! Each connection gets a [`ShellSession`] bound to one application's source
//! directory. Commands are screened for shell syntax, tokenized on
//! whitespace and checked against a fixed allowlist before being spawned
//! directly (never through a shell). At most one command runs per session.

use crate::app::Application;
use crate::config::ShellConfig;
use crate::launcher::{send_signal, Signal};
use crate::logs::{self, LogStream};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Characters that only mean something to a shell
const BLOCKED_CHARS: &[char] = &[';', '&', '|', '`', '$', '>', '<', '(', ')', '\n', '\r'];

/// Words rejected anywhere in a command line
const BLOCKED_WORDS: &[&str] = &[
    // nested shells and evaluation
    "sh", "bash", "zsh", "fish", "dash", "eval", "exec", "source",
    // destructive or privileged
    "rm", "sudo", "su", "doas", "chmod", "chown", "chgrp", "passwd", "dd", "mkfs", "format",
    "shutdown", "reboot",
    // network fetchers and other interpreters
    "curl", "wget", "python", "python3", "perl", "ruby", "php", "lua",
];

/// Allowed base commands and, where restricted, their permitted sub-command prefixes
const ALLOWED: &[(&str, Option<&[&str]>)] = &[
    (
        "npm",
        Some(&[
            "start", "install", "test", "run dev", "run build", "run start", "ls", "list",
            "outdated", "version", "-v", "--version",
        ]),
    ),
    (
        "node",
        Some(&[
            "index.js", "server.js", "main.js", "app.js", "bot.js", "--version", "-v",
        ]),
    ),
    ("ls", None),
    ("cat", None),
    ("head", None),
    ("tail", None),
    ("pwd", None),
    ("clear", None),
    ("ps", Some(&["aux", "-a"])),
];

/// Commands that read files and so must stay inside the working directory
const PATH_SCOPED: &[&str] = &["ls", "cat", "head", "tail"];

const NODE_EVAL_FLAGS: &[&str] = &["-e", "--eval", "-p", "--print"];

const NPM_DENIED: &[&str] = &["set", "config", "exec", "npx"];

/// Why a command line was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("Empty command")]
    Empty,

    #[error("Command contains blocked pattern for security reasons")]
    BlockedPattern,

    #[error("Command '{0}' is not allowed. Use: npm, node, ls, cat, head, tail, pwd, clear, ps")]
    NotAllowed(String),

    #[error("node -e/--eval/-p/--print is not allowed for security reasons")]
    InlineEval,

    #[error("npm {0} is not allowed for security reasons")]
    NpmDenied(String),

    #[error("Subcommand not allowed. For {command}, use: {allowed}")]
    Subcommand { command: String, allowed: String },

    #[error("Path '{0}' is outside the application directory")]
    PathEscape(String),
}

/// A command line that passed the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Allowlist check for shell channel commands
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandPolicy;

impl CommandPolicy {
    pub fn validate(&self, command: &str) -> Result<ValidatedCommand, PolicyViolation> {
        let command = command.trim();
        if command.is_empty() {
            return Err(PolicyViolation::Empty);
        }

        screen(command)?;

        let mut tokens = command.split_whitespace();
        let first = tokens.next().ok_or(PolicyViolation::Empty)?;
        let base = first.rsplit('/').next().unwrap_or(first).to_string();
        let args: Vec<String> = tokens.map(str::to_string).collect();

        let Some((_, sub)) = ALLOWED.iter().find(|(name, _)| *name == base) else {
            return Err(PolicyViolation::NotAllowed(base));
        };

        if base == "node"
            && args
                .iter()
                .any(|a| NODE_EVAL_FLAGS.iter().any(|flag| a.starts_with(flag)))
        {
            return Err(PolicyViolation::InlineEval);
        }
        if base == "npm" {
            if let Some(denied) = args.iter().find(|a| NPM_DENIED.contains(&a.as_str())) {
                return Err(PolicyViolation::NpmDenied(denied.clone()));
            }
        }

        if let (Some(prefixes), false) = (sub, args.is_empty()) {
            let permitted = prefixes.iter().any(|prefix| {
                let want: Vec<&str> = prefix.split_whitespace().collect();
                args.len() >= want.len() && args.iter().zip(&want).all(|(a, w)| a == w)
            });
            if !permitted {
                return Err(PolicyViolation::Subcommand {
                    command: base,
                    allowed: prefixes.join(", "),
                });
            }
        }

        if PATH_SCOPED.contains(&base.as_str()) {
            for arg in args.iter().filter(|a| !a.starts_with('-')) {
                let escapes = arg.starts_with('/')
                    || arg.starts_with('~')
                    || arg.split('/').any(|part| part == "..");
                if escapes {
                    return Err(PolicyViolation::PathEscape(arg.clone()));
                }
            }
        }

        Ok(ValidatedCommand {
            program: base,
            args,
        })
    }
}

/// Resolve the path arguments of file-reading commands against `root` and
/// reject any that land outside it, including through symlinks
pub fn confine_paths(root: &Path, command: &ValidatedCommand) -> Result<(), PolicyViolation> {
    if !PATH_SCOPED.contains(&command.program.as_str()) {
        return Ok(());
    }
    let mut base: Option<PathBuf> = None;
    for arg in command.args.iter().filter(|a| !a.starts_with('-')) {
        // Nothing to read behind an argument that does not resolve (e.g. a line count)
        let Ok(target) = std::fs::canonicalize(root.join(arg)) else {
            continue;
        };
        if base.is_none() {
            base = Some(
                std::fs::canonicalize(root).map_err(|_| PolicyViolation::PathEscape(arg.clone()))?,
            );
        }
        if let Some(base) = &base {
            if !target.starts_with(base) {
                return Err(PolicyViolation::PathEscape(arg.clone()));
            }
        }
    }
    Ok(())
}

/// Reject shell metacharacters and blocked words
fn screen(command: &str) -> Result<(), PolicyViolation> {
    if command.contains(BLOCKED_CHARS) {
        return Err(PolicyViolation::BlockedPattern);
    }
    let blocked = command
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .any(|word| BLOCKED_WORDS.contains(&word.to_ascii_lowercase().as_str()));
    if blocked {
        return Err(PolicyViolation::BlockedPattern);
    }
    Ok(())
}

/// Client to server frames
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Command { command: String },
    Signal { signal: String },
}

/// Server to client frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Log snapshot, sent once on connect
    Logs { out: String, error: String },
    Output { content: String },
    Error { content: String },
}

impl ServerMessage {
    fn output(content: impl Into<String>) -> Self {
        ServerMessage::Output {
            content: content.into(),
        }
    }

    fn error(content: impl Into<String>) -> Self {
        ServerMessage::Error {
            content: content.into(),
        }
    }

    fn notice(text: &str) -> Self {
        ServerMessage::error(format!("\x1b[31m{}\x1b[0m\r\n", text))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","content":"serialization failure"}"#.to_string()
        })
    }
}

/// Convert line endings to CRLF for terminal rendering
fn normalize_newlines(chunk: &str) -> String {
    chunk.replace("\r\n", "\n").replace('\n', "\r\n")
}

struct ActiveCommand {
    pid: u32,
    terminate: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ActiveCommand {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn terminate(&self) {
        send_signal(self.pid, Signal::Terminate);
        self.terminate.notify_one();
    }
}

/// One shell connection scoped to an application's working directory
pub struct ShellSession {
    app: String,
    cwd: PathBuf,
    policy: CommandPolicy,
    tx: mpsc::UnboundedSender<ServerMessage>,
    kill_grace: Duration,
    active: Option<ActiveCommand>,
}

impl ShellSession {
    /// Send the log snapshot and banner, then return a session ready for commands
    pub async fn open(
        app: &Application,
        config: &ShellConfig,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        info!(app = %app.name, "Shell session opened");

        let tail = |stream| {
            let path = logs::log_path(&app.root_dir, stream);
            async move { logs::tail(&path, config.log_tail_lines).await }
        };
        match (tail(LogStream::Out).await, tail(LogStream::Error).await) {
            (Ok(out), Ok(error)) => {
                let _ = tx.send(ServerMessage::Logs { out, error });
            }
            (Err(e), _) | (_, Err(e)) => {
                let _ = tx.send(ServerMessage::error(format!("Failed to load logs: {}", e)));
            }
        }

        let _ = tx.send(ServerMessage::output(format!(
            "\x1b[32m✓ Terminal ready for {}\x1b[0m\r\n",
            app.name
        )));
        let _ = tx.send(ServerMessage::output(format!(
            "\x1b[36mWorking directory: {}\x1b[0m\r\n\r\n",
            app.source_dir.display()
        )));

        Self {
            app: app.name.clone(),
            cwd: app.source_dir.clone(),
            policy: CommandPolicy,
            tx,
            kill_grace: config.kill_grace(),
            active: None,
        }
    }

    /// Handle one raw text frame from the client
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                debug!(app = %self.app, error = %e, "Malformed shell frame");
                self.send(ServerMessage::notice(&format!("Invalid message: {}", e)));
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Command { command } => self.run_command(&command).await,
            ClientMessage::Signal { signal } => self.signal(&signal),
        }
    }

    /// Whether a command spawned by this session is still running
    pub fn is_busy(&self) -> bool {
        self.active.as_ref().map_or(false, ActiveCommand::is_running)
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    async fn run_command(&mut self, command: &str) {
        let command = command.trim();
        if command.is_empty() {
            return;
        }

        let validated = match self
            .policy
            .validate(command)
            .and_then(|v| confine_paths(&self.cwd, &v).map(|()| v))
        {
            Ok(v) => v,
            Err(violation) => {
                info!(app = %self.app, command = %command, reason = %violation, "Shell command rejected");
                self.send(ServerMessage::notice(&violation.to_string()));
                return;
            }
        };

        self.send(ServerMessage::output(format!("\x1b[33m$ {}\x1b[0m\r\n", command)));

        if let Some(previous) = self.active.take() {
            if previous.is_running() {
                debug!(app = %self.app, pid = previous.pid, "Terminating previous shell command");
                previous.terminate();
            }
        }

        if validated.program == "clear" {
            self.send(ServerMessage::output("\x1b[2J\x1b[H"));
            return;
        }

        match self.spawn(&validated) {
            Ok(active) => self.active = Some(active),
            Err(e) => {
                warn!(app = %self.app, command = %command, error = %e, "Shell command failed to spawn");
                self.send(ServerMessage::notice(&format!("Error: {}", e)));
            }
        }
    }

    fn spawn(&self, command: &ValidatedCommand) -> std::io::Result<ActiveCommand> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.cwd)
            .env("TERM", "xterm-256color")
            .env("FORCE_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or(0);
        debug!(app = %self.app, pid, program = %command.program, "Shell command spawned");

        let stdout = child.stdout.take().map(|out| {
            let tx = self.tx.clone();
            tokio::spawn(forward(out, tx, |content| ServerMessage::Output { content }))
        });
        let stderr = child.stderr.take().map(|err| {
            let tx = self.tx.clone();
            tokio::spawn(forward(err, tx, |content| ServerMessage::Error { content }))
        });

        let terminate = Arc::new(Notify::new());
        let term = Arc::clone(&terminate);
        let tx = self.tx.clone();
        let grace = self.kill_grace;

        let task = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = term.notified() => {
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
            };

            // Let readers drain what the process wrote before it exited
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
            }

            let code = match &status {
                Ok(s) => s
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "null".to_string()),
                Err(_) => "null".to_string(),
            };
            let _ = tx.send(ServerMessage::output(format!(
                "\r\n\x1b[90m[Process exited with code {}]\x1b[0m\r\n",
                code
            )));
        });

        Ok(ActiveCommand {
            pid,
            terminate,
            task,
        })
    }

    fn signal(&mut self, signal: &str) {
        let Some(active) = self.active.as_ref().filter(|a| a.is_running()) else {
            return;
        };
        match signal {
            "SIGINT" => {
                send_signal(active.pid, Signal::Interrupt);
                self.send(ServerMessage::output("\r\n\x1b[33m^C\x1b[0m\r\n"));
            }
            "SIGTERM" => active.terminate(),
            other => self.send(ServerMessage::notice(&format!("Unsupported signal {}", other))),
        }
    }

    /// Terminate any running command; called when the channel closes
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            if active.is_running() {
                active.terminate();
            }
        }
        info!(app = %self.app, "Shell session closed");
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            if active.is_running() {
                active.terminate();
            }
        }
    }
}

/// Stream a child pipe to the client line by line
async fn forward<R>(
    pipe: R,
    tx: mpsc::UnboundedSender<ServerMessage>,
    wrap: fn(String) -> ServerMessage,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let chunk = normalize_newlines(&String::from_utf8_lossy(&buf));
                if tx.send(wrap(chunk)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        CommandPolicy
    }

    #[test]
    fn test_allows_listed_commands() {
        let p = policy();
        let ok = [
            "ls",
            "ls -la src",
            "/bin/ls",
            "cat package.json",
            "tail -n 20 logs.txt",
            "pwd",
            "npm install",
            "npm install express",
            "npm run build",
            "npm --version",
            "node index.js",
            "node server.js --port 3000",
            "ps aux",
            "clear",
        ];
        for cmd in ok {
            assert!(p.validate(cmd).is_ok(), "rejected {:?}: {:?}", cmd, p.validate(cmd));
        }

        let v = p.validate("/usr/bin/ls  -la").unwrap();
        assert_eq!(v.program, "ls");
        assert_eq!(v.args, vec!["-la"]);
    }

    #[test]
    fn test_blocks_dangerous_syntax() {
        let p = policy();
        for cmd in [
            "rm -rf /",
            "ls; rm -rf /",
            "ls && whoami",
            "ls || whoami",
            "cat a | sh",
            "echo $(id)",
            "cat `id`",
            "ls > out.txt",
            "cat < /etc/passwd",
            "bash",
            "node index.js & sleep 1",
            "sudo ls",
            "chmod 777 x",
            "python app.py",
            "cat /bin/sh",
            "npm install\nrm -rf /",
        ] {
            assert_eq!(
                p.validate(cmd),
                Err(PolicyViolation::BlockedPattern),
                "accepted {:?}",
                cmd
            );
        }
    }

    #[test]
    fn test_rejects_unlisted_commands() {
        assert_eq!(
            policy().validate("whoami"),
            Err(PolicyViolation::NotAllowed("whoami".to_string()))
        );
        assert!(matches!(
            policy().validate("/tmp/evil/ls-like"),
            Err(PolicyViolation::NotAllowed(_))
        ));
    }

    #[test]
    fn test_sub_command_restrictions() {
        let p = policy();
        assert!(matches!(
            p.validate("npm publish"),
            Err(PolicyViolation::Subcommand { .. })
        ));
        assert!(matches!(
            p.validate("npm run deploy"),
            Err(PolicyViolation::Subcommand { .. })
        ));
        assert!(matches!(
            p.validate("npm installx"),
            Err(PolicyViolation::Subcommand { .. })
        ));
        assert!(matches!(
            p.validate("ps -ef"),
            Err(PolicyViolation::Subcommand { .. })
        ));
        assert!(matches!(
            p.validate("node other.js"),
            Err(PolicyViolation::Subcommand { .. })
        ));
    }

    #[test]
    fn test_specific_denials() {
        let p = policy();
        assert_eq!(p.validate("node -e 1"), Err(PolicyViolation::InlineEval));
        assert_eq!(
            p.validate("node index.js --print"),
            Err(PolicyViolation::InlineEval)
        );
        assert_eq!(
            p.validate("npm config list"),
            Err(PolicyViolation::NpmDenied("config".to_string()))
        );
        assert_eq!(
            p.validate("npm install npx"),
            Err(PolicyViolation::NpmDenied("npx".to_string()))
        );
    }

    #[test]
    fn test_path_scoping() {
        let p = policy();
        assert!(matches!(
            p.validate("cat /etc/hostname"),
            Err(PolicyViolation::PathEscape(_))
        ));
        assert!(matches!(
            p.validate("ls ../other-app"),
            Err(PolicyViolation::PathEscape(_))
        ));
        assert!(matches!(
            p.validate("head src/../../x"),
            Err(PolicyViolation::PathEscape(_))
        ));
        assert!(matches!(
            p.validate("ls ~"),
            Err(PolicyViolation::PathEscape(_))
        ));
        assert!(p.validate("cat ./src/index.js").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_cannot_leave_the_app_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("src")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "outside").unwrap();
        std::fs::write(source.join("src/index.js"), "inside").unwrap();
        std::os::unix::fs::symlink("../secret.txt", source.join("leak")).unwrap();
        std::os::unix::fs::symlink(dir.path(), source.join("parent")).unwrap();
        std::os::unix::fs::symlink("src/index.js", source.join("entry")).unwrap();

        let p = policy();
        let check = |cmd: &str| confine_paths(&source, &p.validate(cmd).unwrap());

        assert_eq!(
            check("cat leak"),
            Err(PolicyViolation::PathEscape("leak".to_string()))
        );
        assert!(matches!(check("ls parent"), Err(PolicyViolation::PathEscape(_))));
        assert!(matches!(
            check("tail -n 5 parent/secret.txt"),
            Err(PolicyViolation::PathEscape(_))
        ));

        assert_eq!(check("cat entry"), Ok(()));
        assert_eq!(check("head -n 5 src/index.js"), Ok(()));
        assert_eq!(check("cat missing.txt"), Ok(()));
        assert_eq!(check("ps aux"), Ok(()));
    }

    #[test]
    fn test_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"command","command":"ls"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                command: "ls".to_string()
            }
        );
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"signal","signal":"SIGINT"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Signal { .. }));

        let json = ServerMessage::Logs {
            out: "a".to_string(),
            error: String::new(),
        }
        .to_json();
        assert_eq!(json, r#"{"type":"logs","out":"a","error":""}"#);
        assert_eq!(
            ServerMessage::output("x").to_json(),
            r#"{"type":"output","content":"x"}"#
        );
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines("a\nb\r\n"), "a\r\nb\r\n");
        assert_eq!(normalize_newlines("plain"), "plain");
    }
}
