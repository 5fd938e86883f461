#![forbid(unsafe_code)]

//! Identity reconciliation HTTP service entry point.

use identity_core::db::open_db_with;
use identity_core::init_logging;
use identity_http::config::Config;
use identity_http::{router, AppState};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    if let Some(log_dir) = config.log_dir.as_deref() {
        init_logging(&config.log_level, log_dir)?;
    }

    // Fail fast on an unusable database instead of on the first request.
    drop(open_db_with(&config.db_path, config.busy_timeout)?);

    let app = router(AppState::from_config(&config));
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        "event=server_start module=http status=ok bind={} max_attempts={} request_timeout_ms={}",
        config.bind,
        config.max_attempts,
        config.request_timeout.as_millis()
    );
    println!(
        "identity_http listening on http://{} (db={})",
        config.bind,
        config.db_path.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("event=server_stop module=http status=ok");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        eprintln!("identity_http failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
