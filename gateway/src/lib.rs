//! Library entry for the `kubeconsole_gateway` crate.
//!
//! Exposes `inner_main` so the workspace-level shim binary can call into the
//! gateway logic.
//!
//! The gateway sits in front of the console's API handlers: it authenticates
//! browser sessions against an OIDC provider, maps verified claims to a cluster
//! identity through configured policy expressions, and hands every request a
//! Kubernetes client that impersonates that identity.

extern crate alloc;
extern crate core;

pub mod cli;
pub mod cluster;
pub mod config;
pub mod expr;
pub mod http;
pub mod identity;
pub mod policy;
pub mod run;
pub mod state;

use std::sync::Once;

use eyre::{Result, WrapErr as _};
use tracing::{Instrument as _, debug, info};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, LogFormat};

static INIT_TRACING: Once = Once::new();
static INIT_RUSTLS: Once = Once::new();

/// The gateway's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Serve(args) => {
            init_tracing(args.log_format);
            install_crypto_provider();

            let startup_span = tracing::info_span!(
                "gateway.startup",
                config = %args.config.display(),
                pid = ?std::process::id(),
                version = env!("CARGO_PKG_VERSION"),
            );
            info!(parent: &startup_span, "Starting gateway");

            run::start(&args.config, args.port, args.bind.as_deref())
                .instrument(startup_span)
                .await
        }
        Command::CheckConfig(args) => {
            init_tracing(LogFormat::Compact);
            let config = config::load(&args.config).await?;
            state::check(&config).wrap_err_with(|| {
                format!("configuration at {} is invalid", args.config.display())
            })?;
            info!(config = %args.config.display(), "configuration is valid");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    INIT_TRACING.call_once(move || {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_timer(ChronoLocal::rfc_3339());

        match format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

/// Installs the OpenSSL-backed rustls provider for this process.
///
/// Both the OIDC HTTP client and the Kubernetes client pick up the process
/// default, so this has to run before either is built. Repeated calls are no-ops.
pub fn install_crypto_provider() {
    INIT_RUSTLS.call_once(|| {
        if rustls_openssl::default_provider().install_default().is_err() {
            debug!("a rustls crypto provider was already installed");
        }
    });
}
