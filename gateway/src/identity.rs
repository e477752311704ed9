//! The Kubernetes identity a request acts as.

use alloc::collections::BTreeSet;
use core::fmt::{self, Write as _};

use serde::Serialize;

/// A username plus group set, as sent in impersonation headers.
///
/// Groups are kept sorted and deduplicated, so equality ignores the order in
/// which a provider or configuration listed them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub username: String,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new<I, G>(username: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<String>,
    {
        Self {
            username: username.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Cache key that encodes this identity without delimiter ambiguity.
    pub fn key(&self) -> IdentityKey {
        let mut key = String::new();
        push_field(&mut key, &self.username);
        for group in &self.groups {
            key.push('\n');
            push_field(&mut key, group);
        }
        IdentityKey(key)
    }
}

fn push_field(out: &mut String, value: &str) {
    // Writing to a String cannot fail.
    let _ = write!(out, "{}:{value}", value.len());
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username)?;
        if !self.groups.is_empty() {
            let groups: Vec<&str> = self.groups.iter().map(String::as_str).collect();
            write!(f, " (groups: {})", groups.join(", "))?;
        }
        Ok(())
    }
}

/// Length-prefixed encoding of an [`Identity`], used to key per-identity clients.
///
/// Each field is written as `<byte length>:<value>`, the username first and then
/// every group in sorted order, separated by newlines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
