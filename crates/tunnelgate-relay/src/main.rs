//! The gateway binary: wires the registry, inspector, and stats into one
//! axum `Router` (built by the library crate), bound on both the public
//! HTTP port and the dedicated control-channel port (spec §6), and drives
//! the periodic inspector retention sweep alongside graceful shutdown.
//!
//! Structured the way the teacher's `relay/src/main.rs` builds its
//! `AppState`/`Router` and binds a single `TcpListener` — generalized to two
//! listeners sharing one `Router` (one for public/API traffic, one
//! dedicated to control-channel connections) and a graceful-shutdown future
//! instead of a bare `axum::serve(...).await?`.

use anyhow::Result;
use tracing::info;
use tunnelgate_relay::{build_router, config::Config, spawn_retention_sweep, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("tunnelgate_relay=info").init();

    let config = Config::from_env();
    let public_domain = config.public_domain.clone();
    let state = AppState::new(config);
    let registry = state.registry.clone();

    spawn_retention_sweep(state.inspector.clone());

    let http_addr = format!("{}:{}", state.config.bind_host, state.config.http_port);
    let control_addr = format!("{}:{}", state.config.bind_host, state.config.control_port);

    info!("tunnelgate relay: public surface on {http_addr}, control channel on {control_addr}, domain {public_domain}");

    let app = build_router(state);

    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    let control_listener = tokio::net::TcpListener::bind(&control_addr).await?;

    let http_app = app.clone();
    let control_app = app;

    // A single signal fan out to three waiters: the two listeners' graceful
    // drain, and the registry teardown that fails every outstanding pending
    // request with "Server shutdown" (spec §5) instead of letting it hang
    // until its own per-request timeout.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx.clone()));

    let mut http_shutdown = shutdown_tx.subscribe();
    let mut control_shutdown = shutdown_tx.subscribe();
    let mut cleanup_shutdown = shutdown_tx.subscribe();

    let cleanup = tokio::spawn(async move {
        let _ = cleanup_shutdown.recv().await;
        for tunnel in registry.close_all() {
            tunnel.pending.fail_all_with("Server shutdown");
        }
    });

    let http_server = axum::serve(http_listener, http_app).with_graceful_shutdown(async move {
        let _ = http_shutdown.recv().await;
    });
    let control_server = axum::serve(control_listener, control_app).with_graceful_shutdown(async move {
        let _ = control_shutdown.recv().await;
    });

    tokio::try_join!(http_server, control_server)?;
    let _ = cleanup.await;
    info!("tunnelgate relay shut down");
    Ok(())
}

/// Waits for SIGINT (Ctrl-C) or, on Unix, SIGTERM — whichever arrives
/// first — then broadcasts once to every subscriber (spec §6 exit codes:
/// signal-triggered shutdown returns 0, not a panic).
async fn wait_for_shutdown_signal(tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
    let _ = tx.send(());
}
