//! Text listings: `ps`, tier listings, `pstree`, `info` and `batch`.
//!
//! Renderers are pure functions of a [`TierSnapshot`] and the current time.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use tiergate_state::{Allocation, Principal, TaskState, TierSnapshot, short_id};

/// Which jobs a listing may show.
#[derive(Debug, Clone, Copy)]
pub struct ListingScope<'a> {
    pub principal: &'a Principal,
    /// Set for tier listings: jobs must also match one of these.
    pub tier_prefixes: Option<&'a [String]>,
    /// Substring a job name must contain.
    pub filter: Option<&'a str>,
}

impl ListingScope<'_> {
    pub fn admits(&self, job: &str) -> bool {
        self.principal.owns(job)
            && self
                .tier_prefixes
                .is_none_or(|prefixes| prefixes.iter().any(|p| job.starts_with(p.as_str())))
            && self.filter.is_none_or(|f| job.contains(f))
    }
}

// ── Table layout ──────────────────────────────────────────────────

/// Column-aligned rows separated by `|`.
#[derive(Debug, Default)]
pub struct Table {
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: &[&str]) -> Self {
        let mut table = Self::new();
        table.push(header.iter().map(|h| h.to_string()).collect());
        table
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let columns = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut widths = vec![0; columns];
        for row in &self.rows {
            // The last cell of a row is never padded, so it does not widen its column.
            for (i, cell) in row.iter().enumerate().take(row.len().saturating_sub(1)) {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let mut out = String::new();
        for row in &self.rows {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i + 1 == row.len() {
                    line.push_str(cell);
                } else {
                    line.push_str(&format!("{cell:<width$}|", width = widths[i] + 1));
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

// ── Formatting helpers ────────────────────────────────────────────

/// Binary byte units: `512 B`, `1.5 KiB`, `64 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.0} {}", UNITS[unit])
    }
}

fn format_span(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// Time since a unix-nanosecond timestamp, e.g. `3m ago`.
pub fn format_age(now: DateTime<Utc>, nanos: i64) -> String {
    if nanos <= 0 {
        return "never".to_string();
    }
    let then = DateTime::from_timestamp_nanos(nanos);
    format!("{} ago", format_span((now - then).num_seconds()))
}

/// Time until `next`, e.g. `in 2h`.
pub fn format_until(now: DateTime<Utc>, next: DateTime<Utc>) -> String {
    format!("in {}", format_span((next - now).num_seconds()))
}

/// Next launch of a periodic job after `after`, in UTC.
///
/// Five-field specs get a leading seconds field.
pub fn next_launch(spec: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expression = if spec.split_whitespace().count() == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    let schedule = cron::Schedule::from_str(&expression).ok()?;
    schedule.after(&after).next()
}

/// Flags shown in the `Extra` column of `ps`.
pub fn task_flags(alloc: &Allocation, state: &TaskState) -> String {
    let mut flags: Vec<&str> = Vec::new();
    match alloc.client_status.as_str() {
        "failed" => flags.push("F"),
        "pending" => flags.push("P"),
        _ => {}
    }
    for event in &state.events {
        match event.r#type.as_str() {
            "Terminated" if event.display_message.contains("OOM") => flags.push("O"),
            "Terminated" => flags.push("T"),
            "Not Restarting" => flags.push("NR"),
            "Killing" if event.display_message.contains("vault") => flags.push("KV"),
            "Alloc Unhealthy" => flags.push("U"),
            _ => {}
        }
    }
    flags.join(",")
}

fn memory(snapshot: &TierSnapshot, alloc: &Allocation) -> (u64, u64) {
    snapshot
        .stats
        .get(&alloc.id)
        .map(|s| (s.resource_usage.memory_stats.rss, s.resource_usage.memory_stats.max_usage))
        .unwrap_or_default()
}

fn cpu(snapshot: &TierSnapshot, alloc: &Allocation) -> String {
    let ticks = snapshot
        .stats
        .get(&alloc.id)
        .map(|s| s.resource_usage.cpu_stats.total_ticks)
        .unwrap_or_default();
    format!("{:.0}", ticks.floor())
}

// ── Listings ──────────────────────────────────────────────────────

pub fn render_ps(snapshot: &TierSnapshot, scope: &ListingScope<'_>, now: DateTime<Utc>) -> String {
    let mut table = Table::with_header(&[
        "Exec ID", "Job/Task", "Node", "Uptime", "CPU", "Mem(max)", "Extra",
    ]);

    for (job, allocs) in snapshot.allocations.iter().filter(|(job, _)| scope.admits(job)) {
        let badge = snapshot.deployment_badge(job).map(|b| b.as_str()).unwrap_or("");
        let title = format!("{job} {badge}").trim_end().to_string();
        table.push(vec![
            String::new(),
            title,
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ]);

        for alloc in allocs {
            let (rss, max) = memory(snapshot, alloc);
            for (task, state) in &alloc.task_states {
                table.push(vec![
                    short_id(task, &alloc.id),
                    task.clone(),
                    snapshot.node_name(&alloc.node_id).unwrap_or_default().to_string(),
                    format_age(now, alloc.modify_time),
                    cpu(snapshot, alloc),
                    format!("{}({})", format_bytes(rss), format_bytes(max)),
                    task_flags(alloc, state),
                ]);
            }
        }
    }
    table.render()
}

fn branch(last: bool) -> &'static str {
    if last { "└── " } else { "├── " }
}

fn indent(last: bool) -> &'static str {
    if last { "    " } else { "│   " }
}

pub fn render_pstree(snapshot: &TierSnapshot, scope: &ListingScope<'_>, now: DateTime<Utc>) -> String {
    let jobs: Vec<_> = snapshot
        .allocations
        .iter()
        .filter(|(job, _)| scope.admits(job))
        .collect();

    let mut out = String::from(".\n");
    for (j, (job, allocs)) in jobs.iter().enumerate() {
        let last_job = j + 1 == jobs.len();
        out.push_str(&format!("{}{job}\n", branch(last_job)));

        let mut groups: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
        for alloc in allocs.iter() {
            groups.entry(alloc.task_group.as_str()).or_default().push(alloc);
        }

        for (g, (group, allocs)) in groups.iter().enumerate() {
            let last_group = g + 1 == groups.len();
            out.push_str(&format!("{}{}{group}\n", indent(last_job), branch(last_group)));

            let leaves: Vec<String> = allocs
                .iter()
                .flat_map(|alloc| {
                    let (_, max) = memory(snapshot, alloc);
                    alloc.task_states.keys().map(move |task| {
                        format!(
                            "[{}]  {task} ({}) {}",
                            short_id(task, &alloc.id),
                            format_age(now, alloc.modify_time),
                            format_bytes(max)
                        )
                    })
                })
                .collect();
            for (l, leaf) in leaves.iter().enumerate() {
                let last_leaf = l + 1 == leaves.len();
                out.push_str(&format!(
                    "{}{}{}{leaf}\n",
                    indent(last_job),
                    indent(last_group),
                    branch(last_leaf)
                ));
            }
        }
    }
    out
}

/// Per-task detail for one job, including the task event history.
pub fn render_info(snapshot: &TierSnapshot, job: &str, now: DateTime<Utc>) -> String {
    let Some(allocs) = snapshot.allocations.get(job) else {
        return format!("No allocations for {job}\n");
    };

    let mut table = Table::new();
    for alloc in allocs {
        let (rss, max) = memory(snapshot, alloc);
        for (task, state) in &alloc.task_states {
            table.push(vec![
                short_id(task, &alloc.id),
                alloc.client_status.clone(),
                format_age(now, alloc.modify_time),
                format!("{}/{task}", alloc.task_group),
            ]);
            table.push(vec![
                String::new(),
                snapshot.node_name(&alloc.node_id).unwrap_or_default().to_string(),
                format!("{} MHz", cpu(snapshot, alloc)),
                format!("{}({})", format_bytes(rss), format_bytes(max)),
            ]);
            for event in &state.events {
                table.push(vec![
                    String::new(),
                    format_age(now, event.time),
                    event.r#type.clone(),
                    event.display_message.clone(),
                ]);
            }
            table.push(vec![String::new(); 4]);
        }
    }
    table.render()
}

/// Periodic jobs with their next launch.
pub fn render_batch(snapshot: &TierSnapshot, scope: &ListingScope<'_>, now: DateTime<Utc>) -> String {
    let mut table = Table::with_header(&["Job ID", "Next", "", "Config"]);
    for (job, definition) in snapshot.periodic.iter().filter(|(job, _)| scope.admits(job)) {
        let spec = definition
            .periodic
            .as_ref()
            .map(|p| p.spec.as_str())
            .unwrap_or_default();
        match next_launch(spec, now) {
            Some(next) => table.push(vec![
                job.clone(),
                format_until(now, next),
                next.to_rfc3339(),
                spec.to_string(),
            ]),
            None => table.push(vec![
                job.clone(),
                "-".to_string(),
                "invalid schedule".to_string(),
                spec.to_string(),
            ]),
        }
    }
    table.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tiergate_state::{
        AllocStats, CpuStats, Deployment, DeploymentStatus, JobDefinition, MemoryStats, Node,
        PeriodicConfig, ResourceUsage, TaskEvent,
    };

    const MIB: u64 = 1024 * 1024;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn nanos(at: DateTime<Utc>) -> i64 {
        at.timestamp_nanos_opt().unwrap()
    }

    fn principal(prefixes: &[&str]) -> Principal {
        Principal {
            id: "alice".into(),
            name: "Alice".into(),
            fingerprint: String::new(),
            key_prefix: String::new(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn alloc(id: &str, job: &str, status: &str, events: Vec<TaskEvent>) -> Allocation {
        Allocation {
            id: id.into(),
            job_id: job.into(),
            task_group: "app".into(),
            node_id: "n1".into(),
            client_status: status.into(),
            modify_time: nanos(now() - Duration::minutes(3)),
            task_states: [(
                "server".to_string(),
                TaskState {
                    events,
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        }
    }

    fn event(kind: &str, message: &str) -> TaskEvent {
        TaskEvent {
            r#type: kind.into(),
            time: nanos(now() - Duration::hours(2)),
            display_message: message.into(),
        }
    }

    fn snapshot() -> TierSnapshot {
        let mut s = TierSnapshot::empty("production");
        s.nodes.insert(
            "n1".into(),
            Node {
                id: "n1".into(),
                name: "node-1".into(),
                ..Default::default()
            },
        );
        s.set_allocations([
            alloc("a1", "web-api", "running", vec![]),
            alloc(
                "a2",
                "web-worker",
                "failed",
                vec![event("Terminated", "OOM Killed"), event("Not Restarting", "")],
            ),
            alloc("a3", "db-main", "running", vec![]),
        ]);
        s.stats.insert(
            "a1".into(),
            AllocStats {
                resource_usage: ResourceUsage {
                    memory_stats: MemoryStats {
                        rss: 64 * MIB,
                        max_usage: 128 * MIB,
                    },
                    cpu_stats: CpuStats {
                        total_ticks: 1234.7,
                        percent: 3.0,
                    },
                },
                timestamp: 0,
            },
        );
        for (id, job, status) in [
            ("d1", "web-api", DeploymentStatus::Successful),
            ("d2", "web-worker", DeploymentStatus::Successful),
            ("d3", "web-worker", DeploymentStatus::Failed),
        ] {
            s.deployments.insert(
                id.into(),
                Deployment {
                    id: id.into(),
                    job_id: job.into(),
                    status,
                    status_description: String::new(),
                },
            );
        }
        s
    }

    fn cells(line: &str) -> Vec<String> {
        line.split('|').map(|c| c.trim().to_string()).collect()
    }

    #[test]
    fn table_pads_all_but_last_column() {
        let mut table = Table::with_header(&["A", "Long"]);
        table.push(vec!["xyz".into(), "b".into()]);
        assert_eq!(table.render(), "A   |Long\nxyz |b\n");
    }

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(64 * MIB), "64 MiB");
        assert_eq!(format_bytes(1536 * MIB), "1.5 GiB");
    }

    #[test]
    fn ages_and_countdowns() {
        assert_eq!(format_age(now(), 0), "never");
        assert_eq!(format_age(now(), nanos(now() - Duration::seconds(30))), "30s ago");
        assert_eq!(format_age(now(), nanos(now() - Duration::hours(5))), "5h ago");
        assert_eq!(format_until(now(), now() + Duration::days(2)), "in 2d");
    }

    #[test]
    fn next_launch_accepts_five_field_specs() {
        let next = next_launch("*/15 * * * *", now()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 15, 0).unwrap());
        assert!(next_launch("not a schedule", now()).is_none());
    }

    #[test]
    fn flags_follow_status_and_events() {
        let s = snapshot();
        let worker = &s.allocations["web-worker"][0];
        assert_eq!(task_flags(worker, &worker.task_states["server"]), "F,O,NR");

        let pending = alloc("a9", "web-x", "pending", vec![event("Killing", "vault token revoked")]);
        assert_eq!(task_flags(&pending, &pending.task_states["server"]), "P,KV");
    }

    #[test]
    fn ps_shows_only_owned_jobs_with_badges() {
        let who = principal(&["web-"]);
        let scope = ListingScope {
            principal: &who,
            tier_prefixes: None,
            filter: Some("web-"),
        };
        let out = render_ps(&snapshot(), &scope, now());
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(
            cells(lines[0]),
            vec!["Exec ID", "Job/Task", "Node", "Uptime", "CPU", "Mem(max)", "Extra"]
        );
        assert_eq!(cells(lines[1])[1], "web-api OK");
        assert_eq!(
            cells(lines[2]),
            vec![
                short_id("server", "a1"),
                "server".to_string(),
                "node-1".to_string(),
                "3m ago".to_string(),
                "1234".to_string(),
                "64 MiB(128 MiB)".to_string(),
                String::new(),
            ]
        );
        assert_eq!(cells(lines[3])[1], "web-worker FAIL");
        assert_eq!(cells(lines[4])[6], "F,O,NR");
        assert_eq!(lines.len(), 5);
        assert!(!out.contains("db-main"));
    }

    #[test]
    fn tier_listing_applies_tier_prefixes() {
        let who = principal(&["web-", "db-"]);
        let tier = vec!["db-".to_string()];
        let scope = ListingScope {
            principal: &who,
            tier_prefixes: Some(&tier),
            filter: None,
        };
        let out = render_ps(&snapshot(), &scope, now());
        assert!(out.contains("db-main"));
        assert!(!out.contains("web-api"));
    }

    #[test]
    fn pstree_groups_by_task_group() {
        let who = principal(&["web-"]);
        let scope = ListingScope {
            principal: &who,
            tier_prefixes: None,
            filter: Some("api"),
        };
        let out = render_pstree(&snapshot(), &scope, now());
        let expected = format!(
            ".\n└── web-api\n    └── app\n        └── [{}]  server (3m ago) 128 MiB\n",
            short_id("server", "a1")
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn info_lists_events() {
        let out = render_info(&snapshot(), "web-worker", now());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            cells(lines[0]),
            vec![short_id("server", "a2"), "failed".into(), "3m ago".into(), "app/server".into()]
        );
        assert_eq!(cells(lines[1])[1], "node-1");
        assert_eq!(cells(lines[1])[2], "0 MHz");
        assert_eq!(cells(lines[2])[1..], ["2h ago", "Terminated", "OOM Killed"]);
        assert_eq!(render_info(&snapshot(), "nope", now()), "No allocations for nope\n");
    }

    #[test]
    fn batch_shows_next_launch() {
        let mut s = snapshot();
        s.periodic.insert(
            "web-report".into(),
            JobDefinition {
                id: "web-report".into(),
                periodic: Some(PeriodicConfig {
                    spec: "0 14 * * *".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        s.periodic.insert(
            "db-vacuum".into(),
            JobDefinition {
                id: "db-vacuum".into(),
                periodic: Some(PeriodicConfig {
                    spec: "0 3 * * *".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let who = principal(&["web-"]);
        let scope = ListingScope {
            principal: &who,
            tier_prefixes: None,
            filter: None,
        };
        let out = render_batch(&s, &scope, now());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(cells(lines[0]), vec!["Job ID", "Next", "", "Config"]);
        assert_eq!(
            cells(lines[1]),
            vec!["web-report", "in 2h", "2024-03-01T14:00:00+00:00", "0 14 * * *"]
        );
        assert_eq!(lines.len(), 2);
    }
}
