//! One SSH exec request, from tokens to exit status.
//!
//! ```text
//! tokens ─► parse ─► snapshot ─► authorize ─► audit ─► execute
//!             │                      │                   ├─ listings (render)
//!             └──── Rejection ◄──────┘                   ├─ JobControl (stop/restart/inspect)
//!                   (exit 1)                             ├─ Bridge (exec/attach/logs/di/diagnostics)
//!                                                        └─ nomad cli passthrough (raw/rawl)
//! ```
//!
//! Acceptance is logged before the action runs.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{info, warn};

use tiergate_bridge::{
    Bridge, BridgeSettings, Diagnostic, RuntimeConnector, SessionIo, SessionOutput,
};
use tiergate_config::{ALL_TIERS, GatewayConfig};
use tiergate_orchestrator::{Aggregator, JobControl};
use tiergate_state::{AllocationHandle, ClusterSnapshot, Principal};

use crate::AUDIT;
use crate::authorize::{authorize, authorize_raw};
use crate::error::{DispatchError, DispatchResult};
use crate::parser::{CommandRecord, Rejection, Target, parse};
use crate::raw::run_passthrough;
use crate::render::{ListingScope, render_batch, render_info, render_ps, render_pstree};

/// Shared by every session. Holds no per-session state.
pub struct Dispatcher {
    aggregator: Arc<Aggregator>,
    runtime: Arc<dyn RuntimeConnector>,
}

impl Dispatcher {
    pub fn new(aggregator: Arc<Aggregator>, runtime: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            aggregator,
            runtime,
        }
    }

    /// Run a command to completion and return the exit status for the client.
    pub async fn run(
        &self,
        config: &GatewayConfig,
        principal: &Principal,
        tokens: Vec<String>,
        io: SessionIo,
    ) -> u32 {
        let typed = tokens.join(" ");
        let mut record = match parse(config, tokens, io.tty()) {
            Ok(record) => record,
            Err(rejection) => return reject(principal, &typed, rejection, &io).await,
        };

        let snapshot = match record.name.as_str() {
            "raw" => None,
            _ => Some(self.aggregator.snapshot(config).await),
        };
        let verdict = match &snapshot {
            Some(snapshot) => authorize(&mut record, config, principal, snapshot),
            None => authorize_raw(&mut record, config, principal),
        };
        if let Err(rejection) = verdict {
            return reject(principal, &record.line(), rejection, &io).await;
        }

        info!(
            target: AUDIT,
            user = %principal.id,
            command = %record.line(),
            tier = record.tier.as_deref().unwrap_or_default(),
            "command accepted"
        );

        let output = io.output.clone();
        let result = match (&record.target, &snapshot) {
            (Some(Target::Passthrough { tier, args }), _) => {
                self.passthrough(config, tier, args, &io).await
            }
            (_, Some(snapshot)) => self.execute(config, principal, &record, snapshot, io).await,
            // `raw` always resolves to a passthrough.
            (_, None) => Ok(1),
        };

        match result {
            Ok(status) => status,
            Err(e) => {
                warn!(user = %principal.id, command = %record.line(), error = %e, "command failed");
                let _ = output
                    .send(SessionOutput::Stdout(Bytes::from(format!("{e}\n"))))
                    .await;
                1
            }
        }
    }

    async fn execute(
        &self,
        config: &GatewayConfig,
        principal: &Principal,
        record: &CommandRecord,
        snapshot: &ClusterSnapshot,
        io: SessionIo,
    ) -> DispatchResult<u32> {
        match (record.name.as_str(), &record.target) {
            ("stop", Some(Target::Job { tier, job, .. })) => self.stop(config, tier, job, &io).await,
            ("restart", Some(Target::Job { tier, job, group })) => {
                self.restart(config, tier, job, group.as_deref(), &io).await
            }
            ("inspect", Some(Target::Job { tier, job, .. })) => {
                self.inspect(config, tier, job, &io).await
            }
            ("info", Some(Target::Job { job, .. })) => {
                io.say(render_info(snapshot.all(), job, Utc::now())).await;
                Ok(0)
            }
            (_, Some(Target::Allocation(handle))) => {
                self.bridge(config, principal, record, handle, io).await
            }
            _ => self.listing(config, principal, record, snapshot, &io).await,
        }
    }

    async fn listing(
        &self,
        config: &GatewayConfig,
        principal: &Principal,
        record: &CommandRecord,
        snapshot: &ClusterSnapshot,
        io: &SessionIo,
    ) -> DispatchResult<u32> {
        let tier = record.tier.as_deref().unwrap_or(ALL_TIERS);
        let tier_prefixes = match tier {
            ALL_TIERS => None,
            name => Some(
                config
                    .tier(name)
                    .map(|t| t.prefix.as_slice())
                    .ok_or_else(|| DispatchError::UnknownTier(name.to_string()))?,
            ),
        };
        let scope = ListingScope {
            principal,
            tier_prefixes,
            // Flags such as `-l` from an alias are not filters.
            filter: record.args.iter().map(String::as_str).find(|a| !a.starts_with('-')),
        };

        let view = snapshot.tier(tier)?;
        let now = Utc::now();
        let text = match record.name.as_str() {
            "pstree" => render_pstree(view, &scope, now),
            "batch" => render_batch(view, &scope, now),
            _ => render_ps(view, &scope, now),
        };
        io.say(text).await;
        Ok(0)
    }

    fn job_control(&self, config: &GatewayConfig, tier: &str) -> DispatchResult<JobControl> {
        let tier_config = config
            .tier(tier)
            .ok_or_else(|| DispatchError::UnknownTier(tier.to_string()))?;
        let api = self.aggregator.connect(tier, tier_config)?;
        Ok(JobControl::new(api, config.general.restart_settle()))
    }

    async fn stop(&self, config: &GatewayConfig, tier: &str, job: &str, io: &SessionIo) -> DispatchResult<u32> {
        let control = self.job_control(config, tier)?;
        match control.stop(job).await {
            Ok(()) => {
                info!(target: AUDIT, tier, job, "job stopped");
                io.say(format!("Job {job} stopped")).await;
                Ok(0)
            }
            Err(e) => {
                warn!(target: AUDIT, tier, job, error = %e, "job failed to stop");
                io.say(format!("Job {job} failed to stop: {e}")).await;
                Ok(1)
            }
        }
    }

    async fn restart(
        &self,
        config: &GatewayConfig,
        tier: &str,
        job: &str,
        group: Option<&str>,
        io: &SessionIo,
    ) -> DispatchResult<u32> {
        let control = self.job_control(config, tier)?;
        let (kind, label, result) = match group {
            Some(group) => (
                "Taskgroup",
                format!("{job}/{group}"),
                control.restart_group(job, group).await,
            ),
            None => ("Job", job.to_string(), control.restart(job).await),
        };
        match result {
            Ok(()) => {
                info!(target: AUDIT, tier, subject = %label, "restarted");
                io.say(format!("{kind} {label} restarted")).await;
                Ok(0)
            }
            Err(e) => {
                warn!(target: AUDIT, tier, subject = %label, error = %e, "restart failed");
                io.say(format!("{kind} {label} failed to restart: {e}")).await;
                Ok(1)
            }
        }
    }

    async fn inspect(&self, config: &GatewayConfig, tier: &str, job: &str, io: &SessionIo) -> DispatchResult<u32> {
        let text = self.job_control(config, tier)?.inspect(job).await?;
        io.say(text).await;
        Ok(0)
    }

    async fn bridge(
        &self,
        config: &GatewayConfig,
        principal: &Principal,
        record: &CommandRecord,
        handle: &AllocationHandle,
        io: SessionIo,
    ) -> DispatchResult<u32> {
        let bridge = Bridge::new(self.runtime.clone(), BridgeSettings::from_general(&config.general));
        let status = match record.name.as_str() {
            "exec" => {
                io.say(format!(
                    "Welcome {} ({}, {})\nYou have access to [{}]",
                    principal.name,
                    principal.id,
                    principal.key_prefix,
                    principal.prefixes.join(" ")
                ))
                .await;
                let cmd = record.args.get(1..).unwrap_or_default().to_vec();
                bridge.exec(handle, cmd, io).await?
            }
            "attach" => bridge.attach(handle, io).await?,
            "logs" => bridge.logs(handle, false, io).await?,
            "tail" => bridge.logs(handle, true, io).await?,
            "di" => bridge.inspect(handle, io).await?,
            "tcpdump" => bridge.diagnose(handle, Diagnostic::Tcpdump, io).await?,
            "ipset" => {
                let diagnostic = match record.arg(1) {
                    Some(entry) => Diagnostic::IpsetAdd(entry.to_string()),
                    None => Diagnostic::IpsetList,
                };
                bridge.diagnose(handle, diagnostic, io).await?
            }
            other => {
                io.say(format!("{other} does not take an exec id")).await;
                1
            }
        };
        info!(user = %principal.id, command = %record.name, short_id = %handle.short_id, status, "session finished");
        Ok(status)
    }

    async fn passthrough(
        &self,
        config: &GatewayConfig,
        tier: &str,
        args: &[String],
        io: &SessionIo,
    ) -> DispatchResult<u32> {
        let tier_config = config
            .tier(tier)
            .ok_or_else(|| DispatchError::UnknownTier(tier.to_string()))?;
        Ok(run_passthrough(&config.general.nomad_binary, tier_config, args, io).await)
    }
}

async fn reject(principal: &Principal, command: &str, rejection: Rejection, io: &SessionIo) -> u32 {
    warn!(
        target: AUDIT,
        user = %principal.id,
        command,
        reason = rejection.reason,
        "command rejected"
    );
    io.say(rejection.message).await;
    1
}
