use anyhow::{Context, Result};
use conduit::api::WebhookAppState;
use conduit::config::{load_config, shared_runtime_config, ConduitConfig};
use conduit::credentials::CredentialStore;
use conduit::integration::{IntegrationStore, SqliteIntegrationStore};
use conduit::queue::Dispatcher;
use conduit::rate_limit::RateLimiters;
use connector_manager::api::create_router;
use connector_manager::{
    register_job_handlers, spawn_status_listener, ConnectorRegistry, IntegrationManager,
    ManagerConfig,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_manager=info,conduit=info".into()),
        )
        .init();

    info!("Connector manager starting...");

    let mut config = match std::env::var("CONDUIT_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            info!("CONDUIT_CONFIG not set, using defaults");
            ConduitConfig::default()
        }
    };

    if let Ok(port) = std::env::var("CONDUIT_PORT") {
        config.server.port = port
            .parse()
            .context("CONDUIT_PORT must be a valid port number")?;
    }

    info!(
        host = %config.server.host,
        port = config.server.port,
        integrations_db = %config.storage.integrations_db,
        "Configuration loaded"
    );

    let store: Arc<dyn IntegrationStore> = Arc::new(
        SqliteIntegrationStore::new(&config.storage.integrations_db)
            .context("Failed to open integration store")?,
    );

    let credential_store = match std::env::var("CONDUIT_ENCRYPTION_KEY") {
        Ok(key) => Some(Arc::new(
            CredentialStore::new(&config.storage.credentials_db, &key)
                .context("Failed to initialize credential store")?,
        )),
        Err(_) => {
            warn!("CONDUIT_ENCRYPTION_KEY not set, credentials will not be persisted");
            None
        }
    };

    let dispatcher = Dispatcher::new(
        config.queues.dispatcher_config(),
        config.queues.definitions(),
    );
    dispatcher.start();

    let operation_timeout = Duration::from_millis(config.sync.operation_timeout_ms);
    let registry = Arc::new(ConnectorRegistry::with_builtin_connectors(operation_timeout));
    info!(providers = ?registry.providers(), "Connector registry ready");

    let manager = Arc::new(IntegrationManager::new(
        Arc::clone(&registry),
        dispatcher.clone(),
        Arc::clone(&store),
        credential_store,
        ManagerConfig::from_sync_config(&config.sync),
    ));
    register_job_handlers(&manager).context("Failed to register job handlers")?;
    let status_listener = spawn_status_listener(manager.subscribe(), Arc::clone(&store));

    let restored = manager
        .restore()
        .await
        .context("Failed to restore integrations")?;
    info!(restored, "Integrations restored");

    let limiters = Arc::new(RateLimiters::from_config(&config.rate_limits));
    let idle_ttl = Duration::from_secs(config.rate_limits.idle_ttl_secs);
    let purge_every = Duration::from_secs(config.rate_limits.purge_interval_secs.max(1));
    let purge_limiters = Arc::clone(&limiters);
    let purge_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_every);
        loop {
            ticker.tick().await;
            let purged = purge_limiters.purge_idle(idle_ttl);
            if purged > 0 {
                tracing::debug!(purged, "Purged idle rate limit buckets");
            }
        }
    });

    let mut providers: HashSet<String> = registry.providers().into_iter().collect();
    providers.extend(config.webhooks.secrets.keys().cloned());

    let webhooks = WebhookAppState {
        dispatcher: dispatcher.clone(),
        store: Arc::clone(&store),
        runtime_config: shared_runtime_config(&config),
        secrets: Arc::new(config.webhooks.secrets.clone()),
        providers: Arc::new(providers),
    };

    let router = create_router(Arc::clone(&manager), webhooks, limiters);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Conduit API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "API server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    purge_handle.abort();
    manager.shutdown().await;
    dispatcher.close().await;
    status_listener.abort();
    info!("Connector manager stopped");

    Ok(())
}
