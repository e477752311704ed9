//! Configuration for the gateway: data types and loading of the TOML file.

mod loader;
mod types;

pub use loader::*;
pub use types::*;
