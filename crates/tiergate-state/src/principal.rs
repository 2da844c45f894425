//! Authenticated identity of an SSH connection.

use serde::Serialize;

/// A user resolved from a presented public key.
///
/// Built once per connection and never mutated.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Principal {
    /// Configuration id (`[users.<id>]`).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Fingerprint of the presented key.
    pub fingerprint: String,
    /// Leading characters of the configured key, for greetings.
    pub key_prefix: String,
    /// Job-name prefixes this principal owns.
    pub prefixes: Vec<String>,
}

impl Principal {
    /// Whether `job` starts with one of the principal's prefixes.
    pub fn owns(&self, job: &str) -> bool {
        has_prefix(job, &self.prefixes)
    }

    /// A principal without prefixes may connect but cannot act.
    pub fn is_authorized(&self) -> bool {
        !self.prefixes.is_empty()
    }
}

/// Whether `name` starts with any of `prefixes`.
pub fn has_prefix(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}
