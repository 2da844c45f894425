//! tiergate.toml configuration schema.
//!
//! The file is parsed once into typed records and validated before any
//! component sees it. Components read it through the accessors on
//! [`GatewayConfig`]; nothing walks the raw TOML tree.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Name of the synthetic tier that unions every configured tier.
pub const ALL_TIERS: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub tiers: BTreeMap<String, TierConfig>,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default)]
    pub prefix: BTreeMap<String, PrefixGroup>,
    #[serde(default)]
    pub alias: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub bind: SocketAddr,
    pub host_key: PathBuf,
    #[serde(default = "default_docker_port")]
    pub docker_port: u16,
    #[serde(default = "default_docker_api")]
    pub docker_api: String,
    #[serde(default = "default_nomad_binary")]
    pub nomad_binary: PathBuf,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
    #[serde(default = "default_exec_poll_ms")]
    pub exec_poll_ms: u64,
    #[serde(default = "default_capture_secs")]
    pub capture_secs: u64,
    #[serde(default = "default_log_tail")]
    pub log_tail: u32,
    #[serde(default = "default_firewall_set")]
    pub firewall_set: String,
    #[serde(default = "default_firewall_timeout_secs")]
    pub firewall_timeout_secs: u64,
    /// How long a built snapshot may be reused. Zero refreshes on every command.
    #[serde(default)]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// One orchestrator endpoint and the slice of the job namespace it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub prefix: Vec<String>,
    /// Listing commands bound to this tier (e.g. `psp`).
    #[serde(default)]
    pub alias: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub name: String,
    /// authorized_keys style line: `<type> <base64> [comment]`.
    pub key: String,
    /// Names of prefix groups, expanded through `[prefix.<group>]`.
    #[serde(default)]
    pub prefix: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefixGroup {
    pub prefix: Vec<String>,
}

fn default_docker_port() -> u16 {
    2376
}

fn default_docker_api() -> String {
    "1.41".to_string()
}

fn default_nomad_binary() -> PathBuf {
    PathBuf::from("nomad")
}

fn default_helper_image() -> String {
    "centos:7".to_string()
}

fn default_restart_settle_secs() -> u64 {
    5
}

fn default_exec_poll_ms() -> u64 {
    1000
}

fn default_capture_secs() -> u64 {
    30
}

fn default_log_tail() -> u32 {
    100
}

fn default_firewall_set() -> String {
    "containerports".to_string()
}

fn default_firewall_timeout_secs() -> u64 {
    300
}

fn default_reload_poll_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Reduce an authorized_keys line to `<type> <base64>`, dropping any comment.
pub fn normalize_key(line: &str) -> String {
    line.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

impl GatewayConfig {
    /// Read, parse and validate a configuration file.
    pub fn from_file(path: &Path, reserved: &[&str]) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, reserved)
    }

    /// Parse and validate configuration text.
    ///
    /// `reserved` lists command names tier aliases and `[alias]` entries
    /// may not take over.
    pub fn from_toml_str(content: &str, reserved: &[&str]) -> ConfigResult<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate(reserved)?;
        Ok(config)
    }

    pub fn validate(&self, reserved: &[&str]) -> ConfigResult<()> {
        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }

        for (name, tier) in &self.tiers {
            if name == ALL_TIERS {
                return Err(ConfigError::ReservedTier(name.clone()));
            }
            let uri: http::Uri = tier.url.parse().map_err(|e: http::uri::InvalidUri| {
                ConfigError::InvalidUrl {
                    tier: name.clone(),
                    url: tier.url.clone(),
                    reason: e.to_string(),
                }
            })?;
            if uri.scheme_str() != Some("http") || uri.host().is_none() {
                return Err(ConfigError::InvalidUrl {
                    tier: name.clone(),
                    url: tier.url.clone(),
                    reason: "expected http://host[:port]".to_string(),
                });
            }
        }

        self.check_prefix_overlap()?;
        self.check_command_names(reserved)?;

        let mut seen_keys: HashMap<String, &str> = HashMap::new();
        for (id, user) in &self.users {
            for group in &user.prefix {
                if !self.prefix.contains_key(group) {
                    return Err(ConfigError::UnknownPrefixGroup {
                        user: id.clone(),
                        group: group.clone(),
                    });
                }
            }
            if let Some(first) = seen_keys.insert(normalize_key(&user.key), id) {
                return Err(ConfigError::DuplicateKey {
                    first: first.to_string(),
                    second: id.clone(),
                });
            }
        }

        self.general.docker_api_version()?;
        Ok(())
    }

    /// Tiers partition the job namespace, so no prefix of one tier may be a
    /// prefix of (or equal to) a prefix of another.
    fn check_prefix_overlap(&self) -> ConfigResult<()> {
        let tiers: Vec<(&String, &TierConfig)> = self.tiers.iter().collect();
        for (i, (first, a)) in tiers.iter().enumerate() {
            for (second, b) in &tiers[i + 1..] {
                for pa in &a.prefix {
                    for pb in &b.prefix {
                        if pa.starts_with(pb.as_str()) || pb.starts_with(pa.as_str()) {
                            return Err(ConfigError::OverlappingPrefixes {
                                first: (*first).clone(),
                                second: (*second).clone(),
                                first_prefix: pa.clone(),
                                second_prefix: pb.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_command_names(&self, reserved: &[&str]) -> ConfigResult<()> {
        let mut taken: HashMap<String, String> = reserved
            .iter()
            .map(|name| (name.to_string(), "built-in".to_string()))
            .collect();

        for (tier, config) in &self.tiers {
            for name in &config.alias {
                let owner = format!("tier `{tier}`");
                if taken.insert(name.clone(), owner.clone()).is_some() {
                    return Err(ConfigError::DuplicateCommand {
                        name: name.clone(),
                        owner,
                    });
                }
            }
        }

        for (name, expansion) in &self.alias {
            if expansion.split_whitespace().next().is_none() {
                return Err(ConfigError::EmptyAlias(name.clone()));
            }
            if taken.contains_key(name) {
                return Err(ConfigError::DuplicateCommand {
                    name: name.clone(),
                    owner: "[alias]".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }

    pub fn tier_names(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }

    /// The tier owning `job`, if any tier's prefixes match it.
    ///
    /// There is no fallback tier: `None` must be treated as unauthorized.
    pub fn tier_for_job(&self, job: &str) -> Option<(&str, &TierConfig)> {
        self.tiers
            .iter()
            .find(|(_, tier)| tier.prefix.iter().any(|p| job.starts_with(p.as_str())))
            .map(|(name, tier)| (name.as_str(), tier))
    }

    /// The tier whose listing alias is `command`.
    pub fn tier_for_listing(&self, command: &str) -> Option<&str> {
        self.tiers
            .iter()
            .find(|(_, tier)| tier.alias.iter().any(|a| a == command))
            .map(|(name, _)| name.as_str())
    }

    /// Token expansion for a configured alias.
    pub fn alias_tokens(&self, name: &str) -> Option<Vec<String>> {
        self.alias
            .get(name)
            .map(|line| line.split_whitespace().map(str::to_string).collect())
    }

    /// Look up the user whose configured key matches `key`.
    pub fn user_by_key(&self, key: &str) -> Option<(&str, &UserConfig)> {
        let wanted = normalize_key(key);
        self.users
            .iter()
            .find(|(_, user)| normalize_key(&user.key) == wanted)
            .map(|(id, user)| (id.as_str(), user))
    }

    /// Expand prefix-group names into their concrete job prefixes.
    ///
    /// Unknown groups contribute nothing; duplicates are kept.
    pub fn expand_prefix_groups(&self, groups: &[String]) -> Vec<String> {
        groups
            .iter()
            .filter_map(|group| self.prefix.get(group))
            .flat_map(|group| group.prefix.iter().cloned())
            .collect()
    }
}

impl GeneralConfig {
    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }

    pub fn exec_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exec_poll_ms.max(1))
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn reload_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reload_poll_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Parse `docker_api` into `(major, minor)`.
    pub fn docker_api_version(&self) -> ConfigResult<(usize, usize)> {
        let invalid = || ConfigError::InvalidApiVersion(self.docker_api.clone());
        let (major, minor) = self.docker_api.split_once('.').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok((major, minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVED: &[&str] = &["ps", "exec", "logs"];

    fn base() -> String {
        r#"
[general]
bind = "0.0.0.0:2222"
host_key = "/etc/tiergate/host_key"

[tiers.test]
url = "http://nomad-test:4646"
prefix = ["t-"]
alias = ["pst"]

[tiers.production]
url = "http://nomad-prod:4646"
token = "secret"
prefix = ["p-", "web-"]
alias = ["psp"]

[users.alice]
name = "Alice"
key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIalice alice@laptop"
prefix = ["web"]

[prefix.web]
prefix = ["web-", "t-web-"]

[alias]
ll = "ps -l"
"#
        .to_string()
    }

    #[test]
    fn parse_with_defaults() {
        let config = GatewayConfig::from_toml_str(&base(), RESERVED).unwrap();
        assert_eq!(config.general.docker_port, 2376);
        assert_eq!(config.general.restart_settle(), Duration::from_secs(5));
        assert_eq!(config.general.docker_api_version().unwrap(), (1, 41));
        assert_eq!(config.tiers.len(), 2);
    }

    #[test]
    fn tier_for_job_matches_prefix() {
        let config = GatewayConfig::from_toml_str(&base(), RESERVED).unwrap();
        assert_eq!(config.tier_for_job("web-frontend").map(|t| t.0), Some("production"));
        assert_eq!(config.tier_for_job("t-web-frontend").map(|t| t.0), Some("test"));
        assert!(config.tier_for_job("other").is_none());
    }

    #[test]
    fn overlapping_tier_prefixes_rejected() {
        let text = base().replace(r#"prefix = ["t-"]"#, r#"prefix = ["web"]"#);
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingPrefixes { .. }));
    }

    #[test]
    fn reserved_tier_name_rejected() {
        let text = base().replace("[tiers.test]", "[tiers.all]");
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedTier(_)));
    }

    #[test]
    fn non_http_url_rejected() {
        let text = base().replace("http://nomad-test:4646", "unix:///var/run/nomad.sock");
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn tier_alias_cannot_shadow_builtin() {
        let text = base().replace(r#"alias = ["pst"]"#, r#"alias = ["ps"]"#);
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCommand { .. }));
    }

    #[test]
    fn alias_cannot_shadow_tier_listing() {
        let text = base().replace(r#"ll = "ps -l""#, r#"psp = "ps""#);
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCommand { .. }));
    }

    #[test]
    fn unknown_prefix_group_rejected() {
        let text = base().replace(r#"prefix = ["web"]"#, r#"prefix = ["nope"]"#);
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPrefixGroup { .. }));
    }

    #[test]
    fn user_lookup_ignores_comment() {
        let config = GatewayConfig::from_toml_str(&base(), RESERVED).unwrap();
        let (id, user) = config
            .user_by_key("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIalice\n")
            .unwrap();
        assert_eq!(id, "alice");
        assert_eq!(user.name, "Alice");
        assert!(config.user_by_key("ssh-ed25519 AAAAother").is_none());
    }

    #[test]
    fn prefix_groups_expand() {
        let config = GatewayConfig::from_toml_str(&base(), RESERVED).unwrap();
        let prefixes = config.expand_prefix_groups(&["web".to_string(), "missing".to_string()]);
        assert_eq!(prefixes, vec!["web-".to_string(), "t-web-".to_string()]);
    }

    #[test]
    fn alias_tokens_split() {
        let config = GatewayConfig::from_toml_str(&base(), RESERVED).unwrap();
        assert_eq!(
            config.alias_tokens("ll"),
            Some(vec!["ps".to_string(), "-l".to_string()])
        );
        assert_eq!(config.tier_for_listing("psp"), Some("production"));
    }

    #[test]
    fn invalid_api_version() {
        let text = base().replace(
            "host_key = \"/etc/tiergate/host_key\"",
            "host_key = \"/k\"\ndocker_api = \"latest\"",
        );
        let err = GatewayConfig::from_toml_str(&text, RESERVED).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiVersion(_)));
    }
}
