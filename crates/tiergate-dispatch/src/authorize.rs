//! Tier and target resolution, and the prefix ACL.
//!
//! Every path that names a job ends in [`Principal::owns`]. A job that no
//! tier claims never resolves to a usable tier: it is rejected, not routed
//! to a default.

use tiergate_config::{ALL_TIERS, GatewayConfig};
use tiergate_state::{ClusterSnapshot, Principal, StateError};

use crate::parser::{CommandRecord, Rejection, Target};

fn not_authorized(action: &str, what: &str) -> Rejection {
    Rejection::new("not authorized", format!("Not authorized to {action} {what}"))
}

/// Resolve the tier and target of a parsed command and apply the ACL.
pub fn authorize(
    record: &mut CommandRecord,
    config: &GatewayConfig,
    principal: &Principal,
    snapshot: &ClusterSnapshot,
) -> Result<(), Rejection> {
    if record.name == "raw" {
        return authorize_raw(record, config, principal);
    }
    ensure_prefixes(principal)?;

    match record.name.as_str() {
        "ps" | "pstree" | "batch" => {
            record.tier = Some(ALL_TIERS.to_string());
        }
        "info" => {
            let job = first_arg(record)?;
            if !principal.owns(&job) {
                return Err(not_authorized("info", &job));
            }
            record.tier = Some(ALL_TIERS.to_string());
            record.target = Some(Target::Job {
                tier: ALL_TIERS.to_string(),
                job,
                group: None,
            });
        }
        "stop" | "inspect" | "restart" => {
            let arg = first_arg(record)?;
            let (token, group) = match (record.name.as_str(), arg.split_once('/')) {
                ("restart", Some((job, group))) => (job.to_string(), Some(group.to_string())),
                _ => (arg.clone(), None),
            };
            let (tier, job) = resolve_job(config, principal, snapshot, &record.name, &token)?;
            record.tier = Some(tier.clone());
            record.target = Some(Target::Job { tier, job, group });
        }
        "exec" | "attach" | "logs" | "tail" | "di" | "tcpdump" | "ipset" => {
            let id = first_arg(record)?;
            let handle = match snapshot.resolve(&id) {
                Ok(handle) => handle.clone(),
                Err(StateError::StaleHandle { .. }) => {
                    return Err(Rejection::new(
                        "stale short id",
                        format!("stale short id {id}, re-run ps"),
                    ));
                }
                Err(_) => {
                    return Err(Rejection::new(
                        "unknown short id",
                        format!("No such ExecID {id} found!"),
                    ));
                }
            };
            if !principal.owns(&handle.job_id) {
                return Err(not_authorized(&record.name, &id));
            }
            record.tier = Some(handle.tier.clone());
            record.target = Some(Target::Allocation(handle));
        }
        "rawl" => authorize_rawl(record, config, principal, snapshot)?,
        listing => {
            let tier = config
                .tier_for_listing(listing)
                .ok_or_else(|| Rejection::new("unknown command", format!("Unknown command {listing}")))?;
            record.tier = Some(tier.to_string());
        }
    }
    Ok(())
}

/// `raw <tier|all> <nomad args…>` needs no snapshot, only the `raw` grant.
pub fn authorize_raw(
    record: &mut CommandRecord,
    config: &GatewayConfig,
    principal: &Principal,
) -> Result<(), Rejection> {
    ensure_prefixes(principal)?;
    if !principal.owns("raw") {
        return Err(Rejection::new("raw not granted", "Not authorized to run raw"));
    }
    let requested = first_arg(record)?;
    let tier = if requested == ALL_TIERS {
        // `raw all status <job>`: the job picks the tier.
        record
            .arg(2)
            .and_then(|job| config.tier_for_job(job))
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| {
                Rejection::new("no tier", format!("Cannot determine tier for `{}`", record.line()))
            })?
    } else {
        known_tier(config, &requested)?
    };
    let args = record.args[1..].to_vec();
    record.tier = Some(tier.clone());
    record.target = Some(Target::Passthrough { tier, args });
    Ok(())
}

/// The two passthrough forms allowed without the `raw` grant:
/// `rawl <tier> status <job>` and `rawl <tier> deployment promote|fail <id>`.
fn authorize_rawl(
    record: &mut CommandRecord,
    config: &GatewayConfig,
    principal: &Principal,
    snapshot: &ClusterSnapshot,
) -> Result<(), Rejection> {
    let requested = first_arg(record)?;
    let (job, args) = match record.arg(1) {
        Some("status") => {
            let [_, _, job] = record.args.as_slice() else {
                return Err(Rejection::new("bad rawl", "Usage: rawl <tier> status <job>"));
            };
            if !principal.owns(job) {
                return Err(not_authorized("inspect", job));
            }
            (job.clone(), vec!["status".to_string(), job.clone()])
        }
        Some("deployment") => {
            let [_, _, action, id] = record.args.as_slice() else {
                return Err(Rejection::new(
                    "bad rawl",
                    "Usage: rawl <tier> deployment promote|fail <deployment id>",
                ));
            };
            if action != "promote" && action != "fail" {
                return Err(Rejection::new("bad rawl", format!("Invalid command {action}")));
            }
            let deployment = snapshot.all().deployments.get(id).ok_or_else(|| {
                Rejection::new("unknown deployment", format!("Non-existing deployment ID {id}"))
            })?;
            if !principal.owns(&deployment.job_id) {
                return Err(not_authorized("deployment of", &deployment.job_id));
            }
            (
                deployment.job_id.clone(),
                vec!["deployment".to_string(), action.clone(), id.clone()],
            )
        }
        _ => {
            return Err(Rejection::new(
                "bad rawl",
                "rawl supports `status <job>` and `deployment promote|fail <id>`",
            ));
        }
    };

    let tier = if requested == ALL_TIERS {
        config
            .tier_for_job(&job)
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| Rejection::new("no tier", format!("Invalid job id provided: {job}")))?
    } else {
        known_tier(config, &requested)?
    };
    record.tier = Some(tier.clone());
    record.target = Some(Target::Passthrough { tier, args });
    Ok(())
}

/// A job name or short id → `(tier, job)`, owned by `principal`.
fn resolve_job(
    config: &GatewayConfig,
    principal: &Principal,
    snapshot: &ClusterSnapshot,
    action: &str,
    token: &str,
) -> Result<(String, String), Rejection> {
    if let Some(handle) = snapshot.index().get(token) {
        if !principal.owns(&handle.job_id) {
            return Err(not_authorized(action, token));
        }
        return Ok((handle.tier.clone(), handle.job_id.clone()));
    }

    if !principal.owns(token) {
        return Err(not_authorized(action, token));
    }
    match config.tier_for_job(token) {
        Some((tier, _)) => Ok((tier.to_string(), token.to_string())),
        None => Err(Rejection::new("no tier", format!("Invalid job id provided: {token}"))),
    }
}

fn ensure_prefixes(principal: &Principal) -> Result<(), Rejection> {
    if principal.is_authorized() {
        Ok(())
    } else {
        Err(Rejection::new(
            "no prefixes",
            format!("No job prefixes granted to {}", principal.name),
        ))
    }
}

fn first_arg(record: &CommandRecord) -> Result<String, Rejection> {
    record
        .arg(0)
        .map(str::to_string)
        .ok_or_else(|| Rejection::new("missing argument", format!("Extra arg needed for {}", record.name)))
}

fn known_tier(config: &GatewayConfig, name: &str) -> Result<String, Rejection> {
    config
        .tier(name)
        .map(|_| name.to_string())
        .ok_or_else(|| Rejection::new("unknown tier", format!("Unknown tier {name}")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::parser::{BUILTIN_COMMANDS, parse};
    use tiergate_state::{
        Allocation, Deployment, DeploymentStatus, TaskState, TierSnapshot, short_id,
    };

    fn config() -> GatewayConfig {
        GatewayConfig::from_toml_str(
            r#"
[general]
bind = "127.0.0.1:2222"
host_key = "/tmp/k"

[tiers.production]
url = "http://prod:4646"
prefix = ["web-", "db-"]
alias = ["psp"]

[tiers.test]
url = "http://test:4646"
prefix = ["t-"]
"#,
            BUILTIN_COMMANDS,
        )
        .unwrap()
    }

    fn principal(prefixes: &[&str]) -> Principal {
        Principal {
            id: "alice".into(),
            name: "Alice".into(),
            fingerprint: "SHA256:x".into(),
            key_prefix: "ssh-ed25519 AAAA".into(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn alloc(id: &str, job: &str) -> Allocation {
        Allocation {
            id: id.into(),
            job_id: job.into(),
            task_group: "app".into(),
            client_status: "running".into(),
            task_states: [("server".to_string(), TaskState::default())].into(),
            ..Default::default()
        }
    }

    fn snapshot() -> ClusterSnapshot {
        let mut prod = TierSnapshot::empty("production");
        prod.set_allocations([alloc("a1", "web-api"), alloc("a2", "db-main")]);
        prod.deployments.insert(
            "d1".into(),
            Deployment {
                id: "d1".into(),
                job_id: "web-api".into(),
                status: DeploymentStatus::Running,
                status_description: String::new(),
            },
        );
        prod.index_handles();
        ClusterSnapshot::assemble(
            BTreeMap::from([
                ("production".to_string(), prod),
                ("test".to_string(), TierSnapshot::empty("test")),
            ]),
            None,
        )
    }

    fn run(line: &str, who: &Principal) -> Result<CommandRecord, Rejection> {
        let config = config();
        let tokens = line.split_whitespace().map(str::to_string).collect();
        let mut record = parse(&config, tokens, true)?;
        authorize(&mut record, &config, who, &snapshot())?;
        Ok(record)
    }

    #[test]
    fn short_id_resolves_to_tier_tagged_handle() {
        let id = short_id("server", "a1");
        let record = run(&format!("exec {id}"), &principal(&["web-"])).unwrap();
        assert_eq!(record.tier.as_deref(), Some("production"));
        match record.target {
            Some(Target::Allocation(handle)) => assert_eq!(handle.job_id, "web-api"),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn short_id_outside_prefixes_is_refused() {
        let id = short_id("server", "a2");
        let err = run(&format!("logs {id}"), &principal(&["web-"])).unwrap_err();
        assert_eq!(err.message, format!("Not authorized to logs {id}"));
    }

    #[test]
    fn unknown_short_id() {
        let err = run("attach 0000000000", &principal(&["web-"])).unwrap_err();
        assert_eq!(err.reason, "unknown short id");
    }

    #[test]
    fn retired_short_id_is_reported_stale() {
        let config = config();
        let previous = snapshot();
        let id = short_id("server", "a1");
        let mut prod = TierSnapshot::empty("production");
        prod.set_allocations([alloc("a3", "web-api")]);
        prod.index_handles();
        let next = ClusterSnapshot::assemble(
            BTreeMap::from([("production".to_string(), prod)]),
            Some(previous.index()),
        );
        let mut record = parse(&config, vec!["tail".into(), id], false).unwrap();
        let err = authorize(&mut record, &config, &principal(&["web-"]), &next).unwrap_err();
        assert_eq!(err.reason, "stale short id");
    }

    #[test]
    fn job_resolves_through_tier_prefix() {
        let record = run("stop db-main", &principal(&["db-"])).unwrap();
        assert_eq!(
            record.target,
            Some(Target::Job {
                tier: "production".into(),
                job: "db-main".into(),
                group: None
            })
        );
    }

    #[test]
    fn job_without_tier_is_rejected_not_defaulted() {
        let err = run("inspect x-orphan", &principal(&["x-"])).unwrap_err();
        assert_eq!(err.message, "Invalid job id provided: x-orphan");
    }

    #[test]
    fn unowned_job_is_refused_before_tier_lookup() {
        let err = run("stop web-api", &principal(&["db-"])).unwrap_err();
        assert_eq!(err.message, "Not authorized to stop web-api");
    }

    #[test]
    fn restart_group_syntax() {
        let record = run("restart web-api/app", &principal(&["web-"])).unwrap();
        assert_eq!(
            record.target,
            Some(Target::Job {
                tier: "production".into(),
                job: "web-api".into(),
                group: Some("app".into())
            })
        );
    }

    #[test]
    fn restart_by_short_id_acts_on_owning_job() {
        let id = short_id("server", "a1");
        let record = run(&format!("restart {id}"), &principal(&["web-"])).unwrap();
        assert!(matches!(record.target, Some(Target::Job { ref job, .. }) if job == "web-api"));
    }

    #[test]
    fn principal_without_prefixes_cannot_act() {
        let err = run("ps", &principal(&[])).unwrap_err();
        assert_eq!(err.reason, "no prefixes");
    }

    #[test]
    fn listing_alias_selects_tier() {
        let record = run("psp", &principal(&["web-"])).unwrap();
        assert_eq!(record.tier.as_deref(), Some("production"));
        let record = run("ps web", &principal(&["web-"])).unwrap();
        assert_eq!(record.tier.as_deref(), Some(ALL_TIERS));
    }

    #[test]
    fn raw_requires_grant() {
        let err = run("raw production status", &principal(&["web-"])).unwrap_err();
        assert_eq!(err.message, "Not authorized to run raw");

        let record = run("raw production job status", &principal(&["web-", "raw"])).unwrap();
        assert_eq!(
            record.target,
            Some(Target::Passthrough {
                tier: "production".into(),
                args: vec!["job".into(), "status".into()]
            })
        );
    }

    #[test]
    fn raw_all_picks_tier_from_job() {
        let record = run("raw all status t-worker", &principal(&["ra"])).unwrap();
        assert_eq!(record.tier.as_deref(), Some("test"));
        let err = run("raw all status zzz", &principal(&["raw"])).unwrap_err();
        assert_eq!(err.reason, "no tier");
        let err = run("raw staging job status", &principal(&["raw"])).unwrap_err();
        assert_eq!(err.reason, "unknown tier");
    }

    #[test]
    fn rawl_status_needs_ownership_only() {
        let record = run("rawl all status web-api", &principal(&["web-"])).unwrap();
        assert_eq!(
            record.target,
            Some(Target::Passthrough {
                tier: "production".into(),
                args: vec!["status".into(), "web-api".into()]
            })
        );
        let err = run("rawl production status db-main", &principal(&["web-"])).unwrap_err();
        assert_eq!(err.reason, "not authorized");
    }

    #[test]
    fn rawl_deployment_checks_snapshot() {
        let who = principal(&["web-"]);
        let record = run("rawl production deployment promote d1", &who).unwrap();
        assert_eq!(
            record.target,
            Some(Target::Passthrough {
                tier: "production".into(),
                args: vec!["deployment".into(), "promote".into(), "d1".into()]
            })
        );
        assert_eq!(
            run("rawl production deployment promote d9", &who).unwrap_err().reason,
            "unknown deployment"
        );
        assert_eq!(
            run("rawl production deployment pause d1", &who).unwrap_err().reason,
            "bad rawl"
        );
        assert_eq!(
            run("rawl production deployment promote d1", &principal(&["db-"]))
                .unwrap_err()
                .reason,
            "not authorized"
        );
    }
}
