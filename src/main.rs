//! Speedtest Server entry point.

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use speedtest_server::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let state = speedtest_server::app_state(&config)?;
    state.start();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent_requests = config.max_concurrent_requests,
        per_client_limit = config.rate_limit_per_client,
        global_limit = config.rate_limit_global,
        admin = config.enable_admin,
        "Speedtest Server starting",
    );

    let app = speedtest_server::router(state.clone());

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Speedtest Server ready");

    let signal_state = state.clone();
    let served = speedtest_server::serve(listener, app, async move {
        shutdown_signal().await;
        // Ends open download bodies so connections can drain.
        signal_state.cancel_requests();
    })
    .await;

    // Stops the reaper and drains the event queue.
    state.shutdown().await;
    tracing::info!("Speedtest Server shut down");

    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
