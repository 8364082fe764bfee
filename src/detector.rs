//! Project detection
//!
//! Classifies an acquired source tree from its `package.json` manifest (or the
//! lack of one) and proposes build and start commands. Classification only
//! informs later stages; it never fails a deploy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Server-side rendering frameworks
const SSR_FRAMEWORKS: &[&str] = &["next", "nuxt"];

/// Client bundlers with a preview server
const BUNDLERS: &[&str] = &["vite"];

/// HTTP server libraries
const WEB_SERVERS: &[&str] = &["express", "fastify", "koa"];

/// Runtime family of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectKind {
    FrameworkSsr,
    SpaBundled,
    HttpService,
    BackgroundWorker,
    GenericRuntime,
    StaticSite,
    Unknown,
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectKind::FrameworkSsr => "framework-ssr",
            ProjectKind::SpaBundled => "spa-bundled",
            ProjectKind::HttpService => "http-service",
            ProjectKind::BackgroundWorker => "background-worker",
            ProjectKind::GenericRuntime => "generic-runtime",
            ProjectKind::StaticSite => "static-site",
            ProjectKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Manifest metadata carried on the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Entry point used when no start script exists
    pub main: String,
}

/// Detection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub kind: ProjectKind,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub display_name: String,
    pub description: String,
    /// Port the framework listens on by default; `None` for non-network workers
    pub default_port: Option<u16>,
    #[serde(default)]
    pub package: Option<PackageInfo>,
}

impl ProjectInfo {
    fn new(kind: ProjectKind, display_name: &str, description: &str) -> Self {
        Self {
            kind,
            build_command: None,
            start_command: None,
            display_name: display_name.to_string(),
            description: description.to_string(),
            default_port: None,
            package: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(ProjectKind::Unknown, "Unknown", "Project type not recognized")
    }
}

/// Read and parse `package.json` at the project root, if any
pub fn read_manifest(dir: &Path) -> Option<Value> {
    let path = dir.join("package.json");
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<Value>(&content) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => {
            warn!(path = %path.display(), "package.json is not an object");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse package.json");
            None
        }
    }
}

/// Whether the manifest declares the named script
pub fn has_script(manifest: &Value, script: &str) -> bool {
    manifest
        .get("scripts")
        .and_then(|s| s.get(script))
        .map_or(false, |v| v.is_string())
}

/// Classify the project rooted at `dir`
pub fn detect(dir: &Path) -> ProjectInfo {
    let info = match read_manifest(dir) {
        Some(manifest) => {
            let mut info = analyze_manifest(&manifest);
            info.package = Some(package_info(&manifest));
            info
        }
        // A malformed manifest falls through to the static check like a missing one
        None if dir.join("index.html").is_file() => {
            ProjectInfo::new(
                ProjectKind::StaticSite,
                "Static HTML Website",
                "Static HTML served without a build step",
            )
        }
        None => ProjectInfo::unknown(),
    };

    debug!(dir = %dir.display(), kind = %info.kind, "Project detected");
    info
}

fn analyze_manifest(manifest: &Value) -> ProjectInfo {
    let has_dep = |dep: &str| {
        ["dependencies", "devDependencies"].iter().any(|section| {
            manifest
                .get(section)
                .and_then(|deps| deps.get(dep))
                .is_some()
        })
    };
    let has_any = |deps: &[&str]| deps.iter().any(|d| has_dep(d));
    let has_build = has_script(manifest, "build");
    let has_start = has_script(manifest, "start");
    let build_script = || has_build.then(|| "npm run build".to_string());

    if let Some(framework) = SSR_FRAMEWORKS.iter().find(|d| has_dep(d)) {
        let mut info = ProjectInfo::new(
            ProjectKind::FrameworkSsr,
            framework_display_name(framework),
            "Server-rendered web application",
        );
        info.build_command = Some(if has_build {
            "npm run build".to_string()
        } else {
            format!("npx {} build", framework)
        });
        info.start_command = Some(if has_start {
            "npm start".to_string()
        } else {
            format!("npx {} start", framework)
        });
        info.default_port = Some(3000);
        return info;
    }

    if has_any(BUNDLERS) {
        let mut info = ProjectInfo::new(
            ProjectKind::SpaBundled,
            "Vite",
            "Bundled single-page application",
        );
        info.build_command = Some("npm run build".to_string());
        info.start_command = Some("npm run preview".to_string());
        info.default_port = Some(4173);
        return info;
    }

    if has_any(WEB_SERVERS) {
        let mut info = ProjectInfo::new(
            ProjectKind::HttpService,
            "HTTP Service",
            "Backend HTTP API",
        );
        info.build_command = build_script();
        info.start_command = Some(if has_start {
            "npm start".to_string()
        } else {
            format!("node {}", entry_point(manifest))
        });
        info.default_port = Some(3000);
        return info;
    }

    if has_start {
        let mut info = ProjectInfo::new(
            ProjectKind::BackgroundWorker,
            "Background Worker",
            "Long-running script or bot without an HTTP listener",
        );
        info.build_command = build_script();
        info.start_command = Some("npm start".to_string());
        return info;
    }

    let mut info = ProjectInfo::new(
        ProjectKind::GenericRuntime,
        "Node.js Project",
        "Generic Node.js project",
    );
    info.build_command = build_script();
    info.start_command = Some(format!("node {}", entry_point(manifest)));
    info.default_port = Some(3000);
    info
}

fn framework_display_name(dep: &str) -> &'static str {
    match dep {
        "next" => "Next.js",
        "nuxt" => "Nuxt",
        _ => "SSR Framework",
    }
}

/// Declared `main` entry point, defaulting to `index.js`
pub fn entry_point(manifest: &Value) -> String {
    manifest
        .get("main")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or("index.js")
        .to_string()
}

fn package_info(manifest: &Value) -> PackageInfo {
    let field = |key: &str, default: &str| {
        manifest
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };
    PackageInfo {
        name: field("name", "unnamed"),
        version: field("version", "1.0.0"),
        description: field("description", ""),
        main: entry_point(manifest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(manifest: Option<&str>, index_html: bool) -> TempDir {
        let dir = TempDir::new().unwrap();
        if let Some(m) = manifest {
            std::fs::write(dir.path().join("package.json"), m).unwrap();
        }
        if index_html {
            std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        }
        dir
    }

    #[test]
    fn test_detect_ssr_framework() {
        let dir = project(
            Some(r#"{"dependencies": {"next": "14.0.0", "react": "18"}, "scripts": {"build": "next build"}}"#),
            false,
        );
        let info = detect(dir.path());
        assert_eq!(info.kind, ProjectKind::FrameworkSsr);
        assert_eq!(info.build_command.as_deref(), Some("npm run build"));
        assert_eq!(info.start_command.as_deref(), Some("npx next start"));
        assert_eq!(info.default_port, Some(3000));
    }

    #[test]
    fn test_detect_bundler_from_dev_dependencies() {
        let dir = project(Some(r#"{"devDependencies": {"vite": "5"}}"#), true);
        let info = detect(dir.path());
        assert_eq!(info.kind, ProjectKind::SpaBundled);
        assert_eq!(info.start_command.as_deref(), Some("npm run preview"));
        assert_eq!(info.default_port, Some(4173));
    }

    #[test]
    fn test_detect_http_service_without_start_script() {
        let dir = project(
            Some(r#"{"main": "server.js", "dependencies": {"express": "4"}}"#),
            false,
        );
        let info = detect(dir.path());
        assert_eq!(info.kind, ProjectKind::HttpService);
        assert_eq!(info.start_command.as_deref(), Some("node server.js"));
        assert_eq!(info.build_command, None);
    }

    #[test]
    fn test_detect_background_worker() {
        let dir = project(
            Some(r#"{"name": "bot", "scripts": {"start": "node bot.js"}, "dependencies": {"discord.js": "14"}}"#),
            false,
        );
        let info = detect(dir.path());
        assert_eq!(info.kind, ProjectKind::BackgroundWorker);
        assert_eq!(info.default_port, None);
        assert_eq!(info.start_command.as_deref(), Some("npm start"));
        assert_eq!(info.package.unwrap().name, "bot");
    }

    #[test]
    fn test_detect_generic_runtime() {
        let dir = project(Some(r#"{"scripts": {"build": "tsc"}}"#), false);
        let info = detect(dir.path());
        assert_eq!(info.kind, ProjectKind::GenericRuntime);
        assert_eq!(info.build_command.as_deref(), Some("npm run build"));
        assert_eq!(info.start_command.as_deref(), Some("node index.js"));
        let package = info.package.unwrap();
        assert_eq!(package.name, "unnamed");
        assert_eq!(package.version, "1.0.0");
    }

    #[test]
    fn test_detect_static_and_unknown() {
        let static_site = project(None, true);
        assert_eq!(detect(static_site.path()).kind, ProjectKind::StaticSite);

        let empty = project(None, false);
        assert_eq!(detect(empty.path()).kind, ProjectKind::Unknown);
    }

    #[test]
    fn test_malformed_manifest_falls_through() {
        let dir = project(Some("{ not json"), true);
        assert_eq!(detect(dir.path()).kind, ProjectKind::StaticSite);
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let v = serde_json::to_value(ProjectKind::BackgroundWorker).unwrap();
        assert_eq!(v, "background-worker");
        assert_eq!(ProjectKind::FrameworkSsr.to_string(), "framework-ssr");
    }
}
