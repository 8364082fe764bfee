use hostgate::api::{ApiServer, ApiState, VERSION};
use hostgate::app::AppRepository;
use hostgate::config::Config;
use hostgate::db::SqliteStore;
use hostgate::deploy::Deployer;
use hostgate::launcher::SystemLauncher;
use hostgate::ports::PortAllocator;
use hostgate::process::Supervisor;
use hostgate::quota::{QuotaOracle, StoreQuota, Unlimited};
use hostgate::routes::RouteManager;
use hostgate::source::CliFetcher;
use hostgate::store::RecordStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "hostgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if explicit_path.is_some() || config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    info!(
        version = VERSION,
        ports = %format!("{}-{}", config.ports.min, config.ports.max),
        base_domain = %config.deploy.base_domain,
        apps_dir = %config.storage.apps_dir.display(),
        "Starting hostgate"
    );

    for dir in [
        &config.storage.data_dir,
        &config.storage.apps_dir,
        &config.storage.uploads_dir,
        &config.storage.routes_dir,
    ] {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e)
        })?;
    }

    let db_path = config.storage.database_path();
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Record store opened");
    let repo = AppRepository::new(store);

    let ports = Arc::new(PortAllocator::open(config.storage.ledger_path(), config.ports).await?);
    let routes = RouteManager::new(&config.storage.routes_dir);
    info!(
        ledger = %ports.ledger_path().display(),
        range = %format!("{}-{}", ports.range().min, ports.range().max),
        routes = %routes.dir().display(),
        "Port ledger and route directory ready"
    );
    let launcher = Arc::new(SystemLauncher::new(config.supervisor.kill_grace()));

    let supervisor = Supervisor::new(
        repo.clone(),
        launcher,
        Arc::clone(&ports),
        routes.clone(),
        config.supervisor.clone(),
    );

    // Nothing survives a restart of this process
    let reconciled = supervisor.reconcile()?;
    info!(count = reconciled, "Reconciled application records");

    let quota: Arc<dyn QuotaOracle> = if config.deploy.max_apps > 0 {
        Arc::new(StoreQuota::new(repo.clone(), config.deploy.max_apps))
    } else {
        Arc::new(Unlimited)
    };

    let deployer = Arc::new(Deployer::new(
        config.deploy.clone(),
        &config.storage.apps_dir,
        repo,
        ports,
        routes,
        Arc::new(CliFetcher::new(config.deploy.clone_timeout())),
        quota,
        Arc::clone(&supervisor),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    if config.server.admin_token.is_none() {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure admin_token to set a fixed value)");
        config.server.admin_token = Some(token);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = ApiState {
        supervisor: Arc::clone(&supervisor),
        deployer,
        uploads_dir: config.storage.uploads_dir.clone(),
        shell: config.shell.clone(),
        default_caller: config.server.default_caller.clone(),
    };
    let api_server = ApiServer::new(&config.server, bind_addr, state, shutdown_rx);

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all applications...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}
