//! Everything that talks to the Kubernetes API on behalf of a user.

pub mod actions;
pub mod cache;
pub mod rbac;
pub mod retry;

pub use cache::{ClientCache, ClientFactory, UserClients};
pub use rbac::{AccessReviewer, KubeReviewer, NamespaceAccess, RbacError};
