//! HTTP lifecycle API and WebSocket shell endpoint
//!
//! A thin adapter over [`Deployer`] and [`Supervisor`]. Every route except
//! `/health` requires `Authorization: Bearer <token>`. The caller identity
//! used for quotas comes from the `X-Caller` header.

use crate::app::Application;
use crate::config::{ServerConfig, ShellConfig};
use crate::deploy::{DeployOptions, Deployer};
use crate::error::{ErrorCode, ErrorResponse, HostError, HostResult};
use crate::logs::{LogStream, DEFAULT_TAIL_LINES};
use crate::process::Supervisor;
use crate::shell::{ServerMessage, ShellSession};
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, AUTHORIZATION, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    UPGRADE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CALLER_HEADER: &str = "x-caller";

/// Helper to create a JSON response - infallible with valid StatusCode
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: &HostError) -> Response<Full<Bytes>> {
    let body = err.to_response();
    json_response(err.code().status_code(), body.to_json())
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

fn ok_json<T: Serialize>(status: StatusCode, data: T) -> HostResult<Response<Full<Bytes>>> {
    let body = serde_json::to_string(&ApiResponse::ok(data))
        .map_err(|e| HostError::Internal(e.into()))?;
    Ok(json_response(status, body))
}

#[derive(Debug, Deserialize)]
struct GitDeployRequest {
    repo_url: String,
    app_name: String,
    #[serde(default)]
    custom_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDeployRequest {
    /// Path of the uploaded archive, relative to the uploads directory
    archive_path: String,
    app_name: String,
    #[serde(default)]
    custom_domain: Option<String>,
}

/// Services the API dispatches to
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    pub deployer: Arc<Deployer>,
    pub uploads_dir: PathBuf,
    pub shell: ShellConfig,
    pub default_caller: String,
}

/// Lifecycle API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
    auth_token: Arc<String>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        server: &ServerConfig,
        bind_addr: SocketAddr,
        state: ApiState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            auth_token: Arc::new(server.admin_token.clone().unwrap_or_default()),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, version = VERSION, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state, token).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    _addr: SocketAddr,
    state: Arc<ApiState>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = Arc::clone(&auth_token);
        async move { handle_request(req, state, token).await }
    });

    // Upgrades are needed for the terminal endpoint
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    if expected_token.is_empty() {
        return false;
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map_or(false, |token| token == expected_token)
}

fn caller(headers: &HeaderMap, default_caller: &str) -> String {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default_caller)
        .to_string()
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Resolve an upload path, refusing anything outside `uploads_dir`
fn resolve_upload(uploads_dir: &Path, relative: &str) -> HostResult<PathBuf> {
    let rel = Path::new(relative);
    let inside = !relative.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !inside {
        return Err(HostError::invalid(format!(
            "archive path \"{}\" must be relative to the uploads directory",
            relative
        )));
    }
    Ok(uploads_dir.join(rel))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.to_lowercase().contains("upgrade"));
    let is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case("websocket"));
    has_upgrade_connection && is_websocket
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> HostResult<T> {
    let body = req
        .collect()
        .await
        .map_err(|e| HostError::invalid(format!("Failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| HostError::invalid(format!("Invalid JSON: {}", e)))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    if method == Method::GET && path == "/health" {
        let body = serde_json::json!({ "status": "ok", "version": VERSION });
        return Ok(json_response(StatusCode::OK, body.to_string()));
    }

    if !check_auth(req.headers(), &auth_token) {
        warn!(%path, "Unauthorized API request");
        let body = ErrorResponse::new(ErrorCode::Unauthorized, "unauthorized");
        return Ok(json_response(StatusCode::UNAUTHORIZED, body.to_json()));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["apps"]) => list_apps(&state),
        (&Method::GET, ["stats"]) => state
            .supervisor
            .stats()
            .and_then(|stats| ok_json(StatusCode::OK, stats)),
        (&Method::GET, ["check-name", name]) => state
            .deployer
            .check_name(name)
            .and_then(|check| ok_json(StatusCode::OK, check)),
        (&Method::GET, ["apps", name]) => get_app(&state, name),
        (&Method::GET, ["apps", name, "logs"]) => {
            get_logs(&state, name, req.uri().query()).await
        }
        (&Method::POST, ["apps", name, "start"]) => match state.supervisor.start(name).await {
            Ok(s) => ok_json(StatusCode::OK, s),
            Err(e) => Err(e),
        },
        (&Method::POST, ["apps", name, "stop"]) => match state.supervisor.stop(name).await {
            Ok(s) => ok_json(StatusCode::OK, s),
            Err(e) => Err(e),
        },
        (&Method::POST, ["apps", name, "restart"]) => {
            match state.supervisor.restart(name).await {
                Ok(s) => ok_json(StatusCode::OK, s),
                Err(e) => Err(e),
            }
        }
        (&Method::DELETE, ["apps", name]) => {
            match state.supervisor.delete_application(name).await {
                Ok(()) => ok_json(StatusCode::OK, serde_json::json!({ "deleted": name })),
                Err(e) => Err(e),
            }
        }
        (&Method::POST, ["deploy", "git"]) => {
            let caller = caller(req.headers(), &state.default_caller);
            deploy_git(&state, caller, req).await
        }
        (&Method::POST, ["deploy", "archive"]) => {
            let caller = caller(req.headers(), &state.default_caller);
            deploy_archive(&state, caller, req).await
        }
        (&Method::GET, ["ws", "terminal", name]) => {
            let name = name.to_string();
            open_terminal(&state, &name, req)
        }
        _ => {
            let body = ErrorResponse::new(ErrorCode::NotFound, "not found");
            return Ok(json_response(StatusCode::NOT_FOUND, body.to_json()));
        }
    };

    Ok(result.unwrap_or_else(|e| {
        match &e {
            HostError::Internal(inner) => error!(%method, %path, error = %inner, "API error"),
            other => debug!(%method, %path, error = %other, "API request rejected"),
        }
        error_response(&e)
    }))
}

fn list_apps(state: &ApiState) -> HostResult<Response<Full<Bytes>>> {
    let apps = state.supervisor.list_all()?;
    ok_json(StatusCode::OK, apps)
}

fn get_app(state: &ApiState, name: &str) -> HostResult<Response<Full<Bytes>>> {
    let app = find_app(state, name)?;
    let status = state.supervisor.status(name)?;
    ok_json(
        StatusCode::OK,
        serde_json::json!({ "app": app, "running": status.running, "pid": status.pid }),
    )
}

fn find_app(state: &ApiState, name: &str) -> HostResult<Application> {
    state
        .supervisor
        .repo()
        .find(name)?
        .ok_or_else(|| HostError::NotFound(name.to_string()))
}

async fn get_logs(
    state: &ApiState,
    name: &str,
    query: Option<&str>,
) -> HostResult<Response<Full<Bytes>>> {
    let stream = match query_param(query, "stream") {
        Some(s) => s.parse::<LogStream>()?,
        None => LogStream::Out,
    };
    let lines = match query_param(query, "lines") {
        Some(n) => n
            .parse::<usize>()
            .map_err(|_| HostError::invalid(format!("invalid line count \"{}\"", n)))?,
        None => DEFAULT_TAIL_LINES,
    };
    let logs = state.supervisor.get_logs(name, stream, lines).await?;
    ok_json(
        StatusCode::OK,
        serde_json::json!({ "stream": stream, "lines": lines, "logs": logs }),
    )
}

async fn deploy_git(
    state: &ApiState,
    caller: String,
    req: Request<Incoming>,
) -> HostResult<Response<Full<Bytes>>> {
    let body: GitDeployRequest = read_json(req).await?;
    let options = DeployOptions {
        caller,
        custom_domain: body.custom_domain,
    };
    let outcome = state
        .deployer
        .deploy_from_remote(&body.repo_url, &body.app_name, &options)
        .await?;
    ok_json(StatusCode::CREATED, outcome)
}

async fn deploy_archive(
    state: &ApiState,
    caller: String,
    req: Request<Incoming>,
) -> HostResult<Response<Full<Bytes>>> {
    let body: ArchiveDeployRequest = read_json(req).await?;
    let archive = resolve_upload(&state.uploads_dir, &body.archive_path)?;
    let options = DeployOptions {
        caller,
        custom_domain: body.custom_domain,
    };
    let outcome = state
        .deployer
        .deploy_from_archive(&archive, &body.app_name, &options)
        .await?;
    ok_json(StatusCode::CREATED, outcome)
}

/// Answer the WebSocket handshake and hand the upgraded stream to a shell session
fn open_terminal(
    state: &ApiState,
    name: &str,
    req: Request<Incoming>,
) -> HostResult<Response<Full<Bytes>>> {
    let app = find_app(state, name)?;
    if !is_upgrade_request(req.headers()) {
        return Err(HostError::invalid("expected a WebSocket upgrade request"));
    }
    let accept = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .ok_or_else(|| HostError::invalid("missing Sec-WebSocket-Key header"))?;

    let shell = state.shell.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                run_terminal(ws, app, shell).await;
            }
            Err(e) => {
                error!(app = %app.name, error = %e, "Failed to upgrade terminal connection");
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("valid switching protocols response"))
}

/// Pump frames between a WebSocket and a [`ShellSession`] until either side closes
pub async fn run_terminal<S>(ws: WebSocketStream<S>, app: Application, config: ShellConfig)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = ShellSession::open(&app, &config, tx).await;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(app = %app.name, error = %e, "Terminal connection error");
                break;
            }
        }
    }

    session.close();
    drop(session);
    // The writer drains once the last running command drops its sender
    drop(writer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_check_auth() {
        let h = headers(&[("authorization", "Bearer secret")]);
        assert!(check_auth(&h, "secret"));
        assert!(!check_auth(&h, "other"));
        assert!(!check_auth(&headers(&[("authorization", "secret")]), "secret"));
        assert!(!check_auth(&HeaderMap::new(), "secret"));
        // An unset token never authorizes
        assert!(!check_auth(&headers(&[("authorization", "Bearer ")]), ""));
    }

    #[test]
    fn test_caller_header() {
        assert_eq!(caller(&headers(&[("x-caller", "alice")]), "admin"), "alice");
        assert_eq!(caller(&headers(&[("x-caller", "  ")]), "admin"), "admin");
        assert_eq!(caller(&HeaderMap::new(), "admin"), "admin");
    }

    #[test]
    fn test_query_param() {
        let q = Some("stream=error&lines=20");
        assert_eq!(query_param(q, "stream").as_deref(), Some("error"));
        assert_eq!(query_param(q, "lines").as_deref(), Some("20"));
        assert_eq!(query_param(q, "other"), None);
        assert_eq!(query_param(None, "stream"), None);
    }

    #[test]
    fn test_resolve_upload() {
        let dir = Path::new("/srv/uploads");
        assert_eq!(
            resolve_upload(dir, "abc.zip").unwrap(),
            PathBuf::from("/srv/uploads/abc.zip")
        );
        assert!(resolve_upload(dir, "../etc/passwd").is_err());
        assert!(resolve_upload(dir, "/etc/passwd").is_err());
        assert!(resolve_upload(dir, "").is_err());
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_upgrade_request(&headers(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&headers(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c"),
        ])));
    }
}
