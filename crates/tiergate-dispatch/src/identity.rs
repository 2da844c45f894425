//! Public key → [`Principal`].

use std::net::SocketAddr;

use tracing::{info, warn};

use tiergate_config::{GatewayConfig, normalize_key};
use tiergate_state::Principal;

use crate::AUDIT;

/// Characters of the configured key shown back to the user.
const KEY_PREFIX_LEN: usize = 30;

/// Resolve a presented key against the configured users.
///
/// `key` is the authorized_keys form of the client key and `fingerprint` its
/// digest, both logged on every attempt. A known key whose groups expand to
/// no prefixes still yields a principal; it simply owns nothing.
pub fn resolve_principal(
    config: &GatewayConfig,
    key: &str,
    fingerprint: &str,
    remote: Option<SocketAddr>,
) -> Option<Principal> {
    let remote = remote.map(|addr| addr.to_string()).unwrap_or_default();
    let Some((id, user)) = config.user_by_key(key) else {
        warn!(target: AUDIT, %remote, fingerprint, key = %normalize_key(key), "unknown key");
        return None;
    };

    let prefixes = config.expand_prefix_groups(&user.prefix);
    let configured = normalize_key(&user.key);
    let principal = Principal {
        id: id.to_string(),
        name: user.name.clone(),
        fingerprint: fingerprint.to_string(),
        key_prefix: configured.chars().take(KEY_PREFIX_LEN).collect(),
        prefixes,
    };

    if principal.is_authorized() {
        info!(target: AUDIT, %remote, fingerprint, user = %principal.id, prefixes = ?principal.prefixes, "key accepted");
    } else {
        warn!(target: AUDIT, %remote, fingerprint, user = %principal.id, "key accepted without prefixes");
    }
    Some(principal)
}
