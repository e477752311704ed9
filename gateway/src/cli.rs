//! Command-line interface definitions for the gateway.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway HTTP server.
    Serve(ServeArgs),

    /// Load the configuration and compile every policy expression, then exit.
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Path to the configuration file
    #[arg(short, long, env = "KUBECONSOLE_CONFIG", default_value = "kubeconsole.toml")]
    pub config: PathBuf,

    /// Optional override for the listen port (overrides port in config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Optional override for the bind address (overrides bind in config)
    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

#[derive(Debug, Parser)]
pub struct CheckConfigArgs {
    /// Path to the configuration file
    #[arg(short, long, env = "KUBECONSOLE_CONFIG", default_value = "kubeconsole.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_overrides() {
        let cli = Cli::parse_from([
            "console-gateway",
            "serve",
            "--config",
            "/etc/kubeconsole.toml",
            "--port",
            "9000",
            "--log-format",
            "json",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.config, PathBuf::from("/etc/kubeconsole.toml"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.bind, None);
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
