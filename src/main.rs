use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use turfbook::api::{self, AppState};
use turfbook::compactor;
use turfbook::config::{Config, GatewayKind};
use turfbook::model::now_ms;
use turfbook::payment::{PaymentGateway, ProofVerifier, RazorpayGateway, SandboxGateway};
use turfbook::reservation::ReservationCommitter;
use turfbook::store::WalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    turfbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(WalStore::open(&config.wal_path(), config.lock_timeout)?);
    let verifier = ProofVerifier::new(config.gateway_secret.clone());
    let gateway: Arc<dyn PaymentGateway> = match (config.gateway, &config.gateway_key_id) {
        (GatewayKind::Razorpay, Some(key_id)) => Arc::new(RazorpayGateway::new(
            &config.gateway_url,
            key_id.clone(),
            config.gateway_secret.clone(),
            config.currency.clone(),
            config.gateway_timeout,
        )?),
        _ => Arc::new(SandboxGateway::new(config.currency.clone(), verifier.clone())),
    };
    let calendar = config.calendar()?;
    let committer = Arc::new(ReservationCommitter::new(
        store.clone(),
        gateway.clone(),
        verifier,
        calendar.clone(),
        config.cancellation_policy(),
    ));

    let compactor_handle = tokio::spawn(compactor::run_compactor(
        store.clone(),
        config.compact_threshold,
    ));

    let state = AppState {
        committer,
        store: store.clone(),
        gateway,
        calendar,
        clock: Arc::new(now_ms),
    };
    let app = api::router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("turfbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  gateway: {:?}", config.gateway);
    info!("  hours: {:02}:00 -> {:02}:00", config.open_hour, config.close_hour);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, flushing WAL");
    compactor_handle.abort();
    store.shutdown().await?;
    info!("turfbook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
