//! Gateway CLI entrypoint for the `kubeconsole_gateway` binary.

use clap::Parser as _;
use eyre::Result;
use kubeconsole_gateway::{cli::Cli, inner_main};

#[tokio::main]
async fn main() -> Result<()> {
    inner_main(Cli::parse()).await
}
