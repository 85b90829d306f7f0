use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use storefront_api::{
    app_router,
    config::{init_tracing, load_config},
    db, events, AppServices, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(&config.log_level, config.log_json);

    info!(
        environment = %config.environment,
        "starting storefront-api v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = db::connect(&config)
        .await
        .context("failed to connect to database")?;
    if config.auto_schema {
        db::ensure_schema(&db)
            .await
            .context("failed to create schema")?;
        info!("schema ensured from entity definitions");
    }
    let db = Arc::new(db);

    let (event_sender, event_rx) = events::channel(1024);
    tokio::spawn(events::process_events(event_rx));

    let config = Arc::new(config);
    let services = Arc::new(AppServices::build(db.clone(), &config, event_sender));
    let state = AppState {
        db,
        config: config.clone(),
        services,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", addr);

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
