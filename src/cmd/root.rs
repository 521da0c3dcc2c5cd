//! Main daemon command - starts the engine server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_engine::config::Configuration;
use warden_engine::database::Database;
use warden_engine::docker::DockerGateway;
use warden_engine::extensions::ExtensionSyncer;
use warden_engine::janitor::{Janitor, JanitorSettings};
use warden_engine::policy::{ResourcePolicy, SecurityProfile};
use warden_engine::pool::{ContainerPool, PoolSettings};
use warden_engine::registry::SessionRegistry;
use warden_engine::router::{self, AppState};

/// Run the main daemon
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded successfully");
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Data directory: {}", config.system.data_directory.display());
    info!("  Docker image: {}", config.docker.image);

    let db_path = config.system.root_directory.join("warden.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!("Database opened at {:?}", db_path);

    let runtime = Arc::new(DockerGateway::connect()?);

    let policy = Arc::new(ResourcePolicy::new(SecurityProfile {
        seccomp_profile: config.system.seccomp_profile.clone(),
        apparmor_profile: config.system.apparmor_profile.clone(),
    }));

    let extensions = Arc::new(ExtensionSyncer::new(config.system.extensions_directory.clone()));

    let pool_settings = PoolSettings {
        image: config.docker.image.clone(),
        network: config.docker.network.clone(),
        data_root: config.system.data_directory.clone(),
        readiness_timeout: Duration::from_secs(config.docker.readiness_timeout_secs),
        stop_timeout_secs: config.docker.stop_timeout_secs,
    };
    let pool = Arc::new(ContainerPool::new(runtime, db.clone(), policy, extensions, pool_settings));

    info!("Restoring container records from persistence...");
    pool.restore_from_persistence().await?;

    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(config.sessions.completion_grace_secs)));

    let janitor_settings = JanitorSettings::from_config(&config.janitor, &config.pool);
    let janitor = Arc::new(Janitor::new(pool.clone(), registry.clone(), db.clone(), janitor_settings));
    janitor.start().await;
    info!("Janitor started");

    let state = AppState { pool: pool.clone(), registry: registry.clone(), config: config.clone() };
    let app = router::build_router(state);

    let shutdown_token = CancellationToken::new();

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .expect("Invalid bind address");

    let shutdown_janitor = janitor.clone();
    let shutdown_token_clone = shutdown_token.clone();
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        warn!("Received shutdown signal, stopping engine...");

        shutdown_token_clone.cancel();
        shutdown_janitor.stop().await;

        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    if config.api.ssl.enabled {
        info!("Starting HTTPS server on {} (SSL enabled)", bind_addr);
        info!("  Certificate: {}", config.api.ssl.cert);
        info!("  Key: {}", config.api.ssl.key);

        let tls_config = RustlsConfig::from_pem_file(&config.api.ssl.cert, &config.api.ssl.key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load TLS config: {}", e))?;

        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!("Starting HTTP server on {} (SSL disabled)", bind_addr);

        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    info!("Engine stopped");
    Ok(())
}
