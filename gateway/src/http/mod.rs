//! HTTP surface of the gateway: authentication, the console API and the UI shell.

pub mod api;
pub mod assets;
pub mod auth;
pub mod server;

pub(crate) use server::router::create_app;
