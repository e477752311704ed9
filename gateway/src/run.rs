use alloc::string;
use core::net::{IpAddr, SocketAddr};
use std::path::Path;

use eyre::WrapErr as _;
use tokio::{net, signal};
use tracing::{info, warn};

use crate::{config, http, state};

/// Creates a future that resolves when a shutdown signal is received.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    res = signal::ctrl_c() => drop(res),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, only Ctrl-C stops the server");
                drop(signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

/// Loads the configuration, prepares the state and serves until shutdown.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the cluster
/// connection cannot be set up, or the server cannot bind.
pub async fn start(
    config_path: &Path,
    port_override: Option<u16>,
    bind_override: Option<&str>,
) -> eyre::Result<()> {
    let config = config::load(config_path).await?;
    let app_state = state::initialize(&config).await?;

    // Apply optional overrides from CLI/tests
    let listen_port = port_override.unwrap_or(config.server.port);
    let bind_str = bind_override.map_or_else(
        || config.server.bind.clone(),
        string::ToString::to_string,
    );
    let listen_ip: IpAddr = bind_str
        .parse()
        .wrap_err_with(|| format!("Invalid bind address '{bind_str}'"))?;
    let addr = SocketAddr::from((listen_ip, listen_port));

    let app = http::create_app(app_state);
    let listener = net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("Received shutdown, shutting down");
        })
        .await?;
    Ok(())
}
