use anyhow::{Context, Result};
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use upload_portal::{backends, config, db, portal::Portal};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Starting upload-portal with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url, cfg.max_connections).await?;
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object stores ---
    let buffer = backends::from_config(&cfg.buffer)
        .await
        .context("initializing buffer backend")?;
    let durable = backends::from_config(&cfg.durable)
        .await
        .context("initializing durable backend")?;
    tracing::info!(
        buffer = buffer.backend_name(),
        durable = durable.backend_name(),
        "object stores ready"
    );

    // --- Initialize core services ---
    let portal = Portal::build(&cfg, db, buffer, durable).await?;
    portal.start().await?;
    let app = portal.router();

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    portal.shutdown().await;
    Ok(())
}
