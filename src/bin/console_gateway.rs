//! Shim binary that calls into the `kubeconsole_gateway` library's `inner_main`.
use clap::Parser as _;
use eyre::Result;
use kubeconsole_gateway::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    kubeconsole_gateway::inner_main(Cli::parse()).await
}
