//! Privileged helper containers for network diagnostics.
//!
//! A helper shares the host's network, pid and user namespaces, runs one
//! bounded command, and is removed afterwards on every path: explicitly when
//! the bridge finishes, or from [`HelperGuard`]'s `Drop` if the bridge future
//! is dropped mid-session.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::runtime::{ContainerRuntime, HelperSpec};

const TCPDUMP_BINDS: &[&str] = &[
    "/usr/sbin/tcpdump:/usr/sbin/tcpdump",
    "/lib64:/lib64",
    "/etc/passwd:/etc/passwd",
    "/usr/sbin/ifconfig:/usr/sbin/ifconfig",
];

const IPSET_BINDS: &[&str] = &["/usr/sbin/ipset:/usr/sbin/ipset", "/lib64:/lib64"];

fn binds(list: &[&str]) -> Vec<String> {
    list.iter().map(|b| b.to_string()).collect()
}

/// Packet capture inside the target's network namespace.
pub fn tcpdump_spec(image: &str, pid: i64, capture_secs: u64) -> HelperSpec {
    HelperSpec {
        image: image.to_string(),
        cmd: [
            "nsenter",
            "-t",
            &pid.to_string(),
            "-n",
            "-p",
            "timeout",
            &capture_secs.to_string(),
            "/usr/sbin/tcpdump",
            "-n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        tty: true,
        binds: binds(TCPDUMP_BINDS),
    }
}

/// List the firewall set entries that mention `ip`.
pub fn ipset_list_spec(image: &str, set: &str, ip: &str) -> HelperSpec {
    HelperSpec {
        image: image.to_string(),
        cmd: vec![
            "/bin/bash".into(),
            "-c".into(),
            format!("/usr/sbin/ipset -r list {set} | grep {ip}"),
        ],
        tty: true,
        binds: binds(IPSET_BINDS),
    }
}

/// Add `ip,<entry>` to the firewall set with a timeout.
pub fn ipset_add_spec(image: &str, set: &str, ip: &str, entry: &str, timeout_secs: u64) -> HelperSpec {
    HelperSpec {
        image: image.to_string(),
        cmd: vec![
            "/bin/bash".into(),
            "-c".into(),
            format!("/usr/sbin/ipset add {set} {ip},{entry} timeout {timeout_secs}"),
        ],
        tty: true,
        binds: binds(IPSET_BINDS),
    }
}

/// Accept only `proto:port,…` style tokens; the value ends up in a shell line.
pub fn validate_ipset_entry(entry: &str) -> BridgeResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || ".,:/_-".contains(c);
    if entry.is_empty() || !entry.contains(',') || !entry.chars().all(allowed) {
        return Err(BridgeError::InvalidArgument(format!(
            "ipset entry must be one comma-separated token, got {entry:?}"
        )));
    }
    Ok(())
}

/// An address taken from the runtime, checked before it reaches a shell line.
pub(crate) fn validate_address(ip: &str) -> bool {
    !ip.is_empty() && ip.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

/// Removes a helper container when dropped, unless already removed.
pub struct HelperGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl HelperGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    /// Remove the container now and disarm the guard.
    pub async fn remove(mut self) {
        if let Some(id) = self.id.take() {
            match self.runtime.remove_container(&id).await {
                Ok(()) => debug!(container = %id, "helper container removed"),
                Err(e) => warn!(container = %id, error = %e, "failed to remove helper container"),
            }
        }
    }
}

impl Drop for HelperGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match runtime.remove_container(&id).await {
                        Ok(()) => debug!(container = %id, "helper container removed after abort"),
                        Err(e) => warn!(container = %id, error = %e, "failed to remove helper container"),
                    }
                });
            }
            Err(_) => warn!(container = %id, "no runtime to remove helper container, leaked"),
        }
    }
}
