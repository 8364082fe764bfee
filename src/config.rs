use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the deploy platform
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem and database locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Port range handed out to deployed applications
    #[serde(default)]
    pub ports: PortRange,

    /// Deploy pipeline settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Interactive shell channel settings
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 5000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token for the API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Caller identity used for quota checks when a request carries no X-Caller header
    #[serde(default = "default_caller")]
    pub default_caller: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            admin_token: None,
            default_caller: default_caller(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the port ledger and the database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name, relative to `data_dir`
    #[serde(default = "default_database")]
    pub database: String,

    /// Parent of every per-application root
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// Where uploaded archives land before extraction
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    /// Where route config artifacts are written
    #[serde(default = "default_routes_dir")]
    pub routes_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ports.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            apps_dir: default_apps_dir(),
            uploads_dir: default_uploads_dir(),
            routes_dir: default_routes_dir(),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PortRange {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Base domain; applications are published as `<name>.<base_domain>`
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Dependency install command, run when a manifest exists
    #[serde(default = "default_install_command")]
    pub install_command: String,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    /// Start the application at the end of a deploy (default: true)
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Still auto-start when install or build reported a warning (default: true)
    #[serde(default = "default_true")]
    pub start_after_failed_build: bool,

    /// Emit TLS stanzas in route configs (default: false)
    #[serde(default)]
    pub tls: bool,

    /// Directory holding externally provisioned certificates, one subdirectory per domain
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Contact email used in the simulated certificate request
    #[serde(default = "default_tls_email")]
    pub tls_email: String,

    /// Application quota for the built-in oracle (0 = unlimited)
    #[serde(default)]
    pub max_apps: usize,
}

impl DeployConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout(),
            build_timeout_secs: default_build_timeout(),
            clone_timeout_secs: default_clone_timeout(),
            auto_start: true,
            start_after_failed_build: true,
            tls: false,
            cert_dir: default_cert_dir(),
            tls_email: default_tls_email(),
            max_apps: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on how long restart waits for the previous instance to exit
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

impl SupervisorConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_grace_ms: default_restart_grace(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShellConfig {
    /// Lines of each log stream sent when a shell connects
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Grace period between SIGTERM and SIGKILL for shell commands
    #[serde(default = "default_shell_kill_grace")]
    pub kill_grace_ms: u64,
}

impl ShellConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: default_log_tail_lines(),
            kill_grace_ms: default_shell_kill_grace(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_caller() -> String {
    "admin".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database() -> String {
    "hostgate.db".to_string()
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("./sites")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_routes_dir() -> PathBuf {
    PathBuf::from("./nginx")
}

fn default_port_min() -> u16 {
    3001
}

fn default_port_max() -> u16 {
    4000
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_install_command() -> String {
    "npm install --production".to_string()
}

fn default_install_timeout() -> u64 {
    300 // 5 minutes
}

fn default_build_timeout() -> u64 {
    600 // 10 minutes
}

fn default_clone_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_cert_dir() -> String {
    "/etc/letsencrypt/live".to_string()
}

fn default_tls_email() -> String {
    "admin@example.com".to_string()
}

fn default_restart_grace() -> u64 {
    1000
}

fn default_kill_grace() -> u64 {
    10
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_shell_kill_grace() -> u64 {
    2000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.min == 0 {
            errors.push("ports.min must be greater than 0".to_string());
        }
        if self.ports.min > self.ports.max {
            errors.push(format!(
                "ports.min ({}) must not exceed ports.max ({})",
                self.ports.min, self.ports.max
            ));
        }
        if self.deploy.base_domain.trim().is_empty() {
            errors.push("deploy.base_domain must not be empty".to_string());
        }
        if self.deploy.install_command.trim().is_empty() {
            errors.push("deploy.install_command must not be empty".to_string());
        } else if shell_words::split(&self.deploy.install_command).is_err() {
            errors.push("deploy.install_command has unbalanced quotes".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
