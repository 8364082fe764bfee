//! Reverse-proxy route configuration
//!
//! Produces nginx server blocks that forward a public hostname to an
//! application's loopback port. Generation is pure text; [`RouteManager`]
//! only writes and removes the artifacts. Proxy reload and certificate
//! issuance are logged, never executed.

use anyhow::Context;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-route generation options
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Emit an HTTPS server block and redirect plain HTTP to it
    pub tls: bool,
    /// Serve this hostname instead of the derived one
    pub custom_domain: Option<String>,
    /// Directory holding `<domain>/fullchain.pem` and `<domain>/privkey.pem`
    pub cert_dir: String,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            tls: false,
            custom_domain: None,
            cert_dir: "/etc/letsencrypt/live".to_string(),
        }
    }
}

/// Public hostname derived from an application name
pub fn subdomain(app_name: &str, base_domain: &str) -> String {
    let label: String = app_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{}.{}", label, base_domain)
}

/// Check a fully qualified hostname: dot-separated labels of 1-63 alphanumerics
/// or inner hyphens, at least two labels, and a top-level label of 2+ characters
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    labels.iter().all(|l| label_ok(l)) && labels.last().map_or(false, |tld| tld.len() >= 2)
}

/// Command an operator would run to obtain a certificate for `domain`
pub fn certbot_command(domain: &str, email: &str) -> String {
    format!(
        "sudo certbot --nginx -d {} --non-interactive --agree-tos -m {}",
        domain, email
    )
}

fn upstream_name(app_name: &str) -> String {
    format!("upstream_{}", app_name.replace('-', "_"))
}

fn write_location(out: &mut String, upstream: &str) {
    let _ = write!(
        out,
        r#"    location / {{
        proxy_pass http://{upstream};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
        proxy_read_timeout 86400;
    }}
"#
    );
}

/// Render the route config for one application
pub fn generate(app_name: &str, port: u16, hostname: &str, options: &RouteOptions) -> String {
    let server_name = options.custom_domain.as_deref().unwrap_or(hostname);
    let upstream = upstream_name(app_name);
    let mut out = String::new();

    let _ = write!(
        out,
        "# Route for {app_name}\n\
         \n\
         upstream {upstream} {{\n    server 127.0.0.1:{port};\n    keepalive 64;\n}}\n\
         \n\
         server {{\n    listen 80;\n    server_name {server_name};\n\n"
    );

    if options.tls {
        out.push_str("    return 301 https://$server_name$request_uri;\n");
    } else {
        write_location(&mut out, &upstream);
    }
    out.push_str("}\n");

    if options.tls {
        let cert_dir = options.cert_dir.trim_end_matches('/');
        let _ = write!(
            out,
            "\nserver {{\n    listen 443 ssl http2;\n    server_name {server_name};\n\n\
             \x20   ssl_certificate {cert_dir}/{server_name}/fullchain.pem;\n\
             \x20   ssl_certificate_key {cert_dir}/{server_name}/privkey.pem;\n\
             \x20   ssl_session_timeout 1d;\n\
             \x20   ssl_session_cache shared:SSL:50m;\n\
             \x20   ssl_session_tickets off;\n\n\
             \x20   ssl_protocols TLSv1.2 TLSv1.3;\n\
             \x20   ssl_ciphers ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256;\n\
             \x20   ssl_prefer_server_ciphers off;\n\n\
             \x20   add_header Strict-Transport-Security \"max-age=63072000\" always;\n\n"
        );
        write_location(&mut out, &upstream);
        out.push_str("}\n");
    }

    out
}

/// Result of a simulated certificate setup
#[derive(Debug, Clone, serde::Serialize)]
pub struct TlsSetup {
    pub domain: String,
    pub command: String,
}

/// Owns the directory of route artifacts, one `<app>.conf` per application
#[derive(Debug, Clone)]
pub struct RouteManager {
    dir: PathBuf,
}

impl RouteManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, app_name: &str) -> PathBuf {
        self.dir.join(format!("{}.conf", app_name))
    }

    /// Write (or overwrite) the artifact for an application
    pub async fn save(&self, app_name: &str, config: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path(app_name);
        tokio::fs::write(&path, config)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(app = %app_name, path = %path.display(), "Route config saved");
        Ok(path)
    }

    /// Delete the artifact; a missing file is not an error
    pub async fn remove(&self, app_name: &str) -> anyhow::Result<()> {
        let path = self.path(app_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(app = %app_name, "Route config removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Proxy reload is not performed; the artifact directory is the interface
    pub fn reload(&self) {
        debug!(dir = %self.dir.display(), "Proxy reload requested (simulated)");
    }

    /// Log the certificate request that would be issued for `domain`
    pub fn setup_tls(&self, domain: &str, email: &str) -> TlsSetup {
        let command = certbot_command(domain, email);
        info!(domain = %domain, command = %command, "TLS setup requested (simulated)");
        TlsSetup {
            domain: domain.to_string(),
            command,
        }
    }
}
