//! Reading the gateway config from disk.

use std::path::Path;

use eyre::WrapErr as _;
use tokio::fs;

use crate::config::GatewayConfig;

/// Reads and parses the gateway config from a TOML file.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub async fn load<P: AsRef<Path>>(path: P) -> eyre::Result<GatewayConfig> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).await.wrap_err(format!(
        "Failed to read config file at: {}",
        path_ref.display()
    ))?;
    parse(&content).wrap_err(format!(
        "Failed to parse config as TOML at: {}",
        path_ref.display()
    ))
}

/// Parses a config from TOML text.
///
/// # Errors
///
/// Returns an error if the text is not valid TOML or does not match the config schema.
pub fn parse(content: &str) -> eyre::Result<GatewayConfig> {
    Ok(toml::from_str(content)?)
}
