//! Bridged sessions: exec, attach, logs, inspect and diagnostic helpers.
//!
//! ```text
//!  SSH client ──input──►  pump_input  ──► runtime stdin
//!  SSH client ◄─output──  pump_output ◄── runtime stdout/stderr
//!  window-change ───────► pump_resize ──► resize_exec / resize_container
//!                         wait / poll ──► exit status
//! ```
//!
//! Every entry point returns the exit status to report to the SSH client.
//! [`DISCONNECTED`] is used whenever the remote outcome is unknown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tiergate_config::GeneralConfig;
use tiergate_state::AllocationHandle;

use crate::error::{BridgeError, BridgeResult, RuntimeError};
use crate::helper::{
    HelperGuard, ipset_add_spec, ipset_list_spec, tcpdump_spec, validate_address,
    validate_ipset_entry,
};
use crate::relay::{RelayEnd, ResizeTarget, drain_and_close, pump_input, pump_output, pump_resize};
use crate::runtime::{ContainerRuntime, ExecSpec, HelperSpec, OutputChunk, RuntimeConnector};
use crate::session::{SessionIo, SessionOutput};

/// Exit status when the session ended without a remote result.
pub const DISCONNECTED: u32 = 255;

/// Command run by `exec` when none is given.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// How long trailing output may take to arrive once the outcome is known.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub exec_poll: Duration,
    pub log_tail: u32,
    pub helper_image: String,
    pub capture_secs: u64,
    pub firewall_set: String,
    pub firewall_timeout_secs: u64,
}

impl BridgeSettings {
    pub fn from_general(general: &GeneralConfig) -> Self {
        Self {
            exec_poll: general.exec_poll_interval(),
            log_tail: general.log_tail,
            helper_image: general.helper_image.clone(),
            capture_secs: general.capture_secs,
            firewall_set: general.firewall_set.clone(),
            firewall_timeout_secs: general.firewall_timeout_secs,
        }
    }
}

/// Which diagnostic a helper container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    Tcpdump,
    IpsetList,
    IpsetAdd(String),
}

/// Map a runtime exit code onto an SSH exit status.
fn exit_status(code: i64) -> u32 {
    u32::try_from(code).unwrap_or(DISCONNECTED)
}

pub struct Bridge {
    connector: Arc<dyn RuntimeConnector>,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(connector: Arc<dyn RuntimeConnector>, settings: BridgeSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Connect to the handle's node and find its container.
    async fn locate(
        &self,
        handle: &AllocationHandle,
        io: &SessionIo,
    ) -> BridgeResult<(Arc<dyn ContainerRuntime>, String)> {
        let node = handle
            .node_name
            .as_deref()
            .ok_or_else(|| BridgeError::NoNode(handle.alloc_id.clone()))?;
        let runtime = self.connector.connect(node)?;

        let wanted = format!("/{}-{}", handle.task, handle.alloc_id);
        let containers = runtime.list_containers().await?;
        let container = containers
            .into_iter()
            .find(|c| c.names.first() == Some(&wanted))
            .ok_or_else(|| BridgeError::ContainerNotFound(wanted.clone()))?;

        debug!(container = %wanted, id = %short(&container.id), node, "container located");
        io.say(format!("welcome to {} on {}", handle.task, node)).await;
        Ok((runtime, container.id))
    }

    /// Run `cmd` (default shell) inside the container as root.
    pub async fn exec(
        &self,
        handle: &AllocationHandle,
        cmd: Vec<String>,
        mut io: SessionIo,
    ) -> BridgeResult<u32> {
        let (runtime, container) = self.locate(handle, &io).await?;
        let tty = io.tty();
        let cmd = if cmd.is_empty() {
            vec![DEFAULT_SHELL.to_string()]
        } else {
            cmd
        };

        let spec = ExecSpec {
            cmd,
            tty,
            user: Some("root".to_string()),
        };
        let exec_id = runtime.create_exec(&container, &spec).await?;
        let stream = runtime.start_exec(&exec_id, tty).await?;
        info!(exec = %short(&exec_id), container = %short(&container), cmd = ?spec.cmd, "exec started");

        let mut relays = JoinSet::new();
        relays.spawn(pump_output(stream.output, io.output.clone()));
        relays.spawn(pump_input(std::mem::replace(&mut io.input, closed_input()), stream.input));
        if let Some(sizes) = io.resize.take() {
            relays.spawn(pump_resize(runtime.clone(), ResizeTarget::Exec(exec_id.clone()), sizes));
        }

        let mut disconnect = io.disconnect.clone();
        let mut poll = tokio::time::interval(self.settings.exec_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut output_done = false;
        let outcome = loop {
            tokio::select! {
                _ = SessionIo::disconnected(&mut disconnect) => {
                    info!(exec = %short(&exec_id), "client disconnected during exec");
                    break Ok(DISCONNECTED);
                }
                Some(joined) = relays.join_next() => match joined {
                    // A closed output stream alone does not end the exec; its exit code does.
                    Ok(RelayEnd::Output(Ok(()))) => output_done = true,
                    Ok(RelayEnd::Output(Err(e))) => {
                        output_done = true;
                        break Err(BridgeError::from(e));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "relay task failed");
                        break Err(RuntimeError::Api(e.to_string()).into());
                    }
                },
                _ = poll.tick() => {
                    match runtime.inspect_exec(&exec_id).await {
                        Ok(state) if !state.running => {
                            break Ok(state.exit_code.map(exit_status).unwrap_or(DISCONNECTED));
                        }
                        Ok(_) => {}
                        Err(e) => break Err(BridgeError::from(e)),
                    }
                }
            }
        };

        let grace = if output_done { Duration::ZERO } else { OUTPUT_GRACE };
        drain_and_close(&mut relays, grace).await;
        match &outcome {
            Ok(status) => info!(exec = %short(&exec_id), status, "exec finished"),
            Err(e) => warn!(exec = %short(&exec_id), error = %e, "exec failed"),
        }
        outcome
    }

    /// Attach to the container's own stdio.
    pub async fn attach(&self, handle: &AllocationHandle, mut io: SessionIo) -> BridgeResult<u32> {
        let (runtime, container) = self.locate(handle, &io).await?;
        let stream = runtime.attach_container(&container, true).await?;
        info!(container = %short(&container), "attached");

        let mut relays = JoinSet::new();
        relays.spawn(pump_output(stream.output, io.output.clone()));
        relays.spawn(pump_input(std::mem::replace(&mut io.input, closed_input()), stream.input));
        if let Some(sizes) = io.resize.take() {
            relays.spawn(pump_resize(runtime.clone(), ResizeTarget::Container(container.clone()), sizes));
        }
        let waiter = runtime.clone();
        let id = container.clone();
        relays.spawn(async move { RelayEnd::Wait(waiter.wait_container(&id).await) });

        race(&mut relays, &mut io).await
    }

    /// Stream recent logs, and keep following if `follow`.
    pub async fn logs(&self, handle: &AllocationHandle, follow: bool, io: SessionIo) -> BridgeResult<u32> {
        let (runtime, container) = self.locate(handle, &io).await?;
        let mut stream = runtime
            .logs(&container, follow, self.settings.log_tail)
            .await?;
        let mut disconnect = io.disconnect.clone();

        loop {
            tokio::select! {
                _ = SessionIo::disconnected(&mut disconnect) => return Ok(DISCONNECTED),
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        let out = match chunk {
                            OutputChunk::Stdout(b) => SessionOutput::Stdout(b),
                            OutputChunk::Stderr(b) => SessionOutput::Stderr(b),
                        };
                        if io.output.send(out).await.is_err() {
                            return Ok(DISCONNECTED);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(0),
                },
            }
        }
    }

    /// Pretty-printed container inspect document.
    pub async fn inspect(&self, handle: &AllocationHandle, io: SessionIo) -> BridgeResult<u32> {
        let (runtime, container) = self.locate(handle, &io).await?;
        let details = runtime.inspect_container(&container).await?;

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        details
            .raw
            .serialize(&mut serializer)
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        io.say(String::from_utf8_lossy(&out).into_owned()).await;
        Ok(0)
    }

    /// Run a diagnostic in a helper container next to the target.
    pub async fn diagnose(
        &self,
        handle: &AllocationHandle,
        diagnostic: Diagnostic,
        io: SessionIo,
    ) -> BridgeResult<u32> {
        if let Diagnostic::IpsetAdd(entry) = &diagnostic {
            validate_ipset_entry(entry)?;
        }
        let (runtime, container) = self.locate(handle, &io).await?;
        let details = runtime.inspect_container(&container).await?;
        let s = &self.settings;

        let spec = match &diagnostic {
            Diagnostic::Tcpdump => {
                let pid = details
                    .pid
                    .filter(|pid| *pid > 0)
                    .ok_or_else(|| BridgeError::NoProcess(container.clone()))?;
                tcpdump_spec(&s.helper_image, pid, s.capture_secs)
            }
            Diagnostic::IpsetList | Diagnostic::IpsetAdd(_) => {
                let ip = details
                    .global_ipv6
                    .filter(|ip| validate_address(ip))
                    .ok_or_else(|| BridgeError::NoAddress(container.clone()))?;
                match &diagnostic {
                    Diagnostic::IpsetAdd(entry) => ipset_add_spec(
                        &s.helper_image,
                        &s.firewall_set,
                        &ip,
                        entry,
                        s.firewall_timeout_secs,
                    ),
                    _ => ipset_list_spec(&s.helper_image, &s.firewall_set, &ip),
                }
            }
        };
        self.run_helper(runtime, spec, io).await
    }

    async fn run_helper(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        spec: HelperSpec,
        mut io: SessionIo,
    ) -> BridgeResult<u32> {
        let id = runtime.create_container(&spec).await?;
        let guard = HelperGuard::new(runtime.clone(), id.clone());
        info!(helper = %short(&id), image = %spec.image, cmd = ?spec.cmd, "helper container created");

        let outcome = async {
            let stream = runtime.attach_container(&id, false).await?;
            runtime.start_container(&id).await?;

            let mut relays = JoinSet::new();
            relays.spawn(pump_output(stream.output, io.output.clone()));
            if let Some(sizes) = io.resize.take() {
                relays.spawn(pump_resize(runtime.clone(), ResizeTarget::Container(id.clone()), sizes));
            }
            let waiter = runtime.clone();
            let wait_id = id.clone();
            relays.spawn(async move { RelayEnd::Wait(waiter.wait_container(&wait_id).await) });
            race(&mut relays, &mut io).await
        }
        .await;

        guard.remove().await;
        outcome
    }
}

/// Wait for the first deciding event of an attached session, then tear down.
///
/// Output ending first leaves the status at [`DISCONNECTED`].
async fn race(relays: &mut JoinSet<RelayEnd>, io: &mut SessionIo) -> BridgeResult<u32> {
    let mut disconnect = io.disconnect.clone();
    let mut output_done = false;

    let outcome = loop {
        tokio::select! {
            _ = SessionIo::disconnected(&mut disconnect) => break Ok(DISCONNECTED),
            joined = relays.join_next() => match joined {
                None => break Ok(DISCONNECTED),
                Some(Ok(RelayEnd::Output(Ok(())))) => {
                    output_done = true;
                    break Ok(DISCONNECTED);
                }
                Some(Ok(RelayEnd::Output(Err(e)))) => {
                    output_done = true;
                    break Err(BridgeError::from(e));
                }
                Some(Ok(RelayEnd::Wait(Ok(code)))) => break Ok(exit_status(code)),
                Some(Ok(RelayEnd::Wait(Err(e)))) => break Err(BridgeError::from(e)),
                Some(Ok(RelayEnd::Input | RelayEnd::Resize)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "relay task failed");
                    break Err(RuntimeError::Api(e.to_string()).into());
                }
            },
        }
    };

    let grace = if output_done { Duration::ZERO } else { OUTPUT_GRACE };
    drain_and_close(relays, grace).await;
    outcome
}

/// Stand-in receiver once the real input has been handed to a relay.
fn closed_input() -> tokio::sync::mpsc::Receiver<bytes::Bytes> {
    let (_, rx) = tokio::sync::mpsc::channel(1);
    rx
}

/// First 10 characters of a runtime id, for logs.
fn short(id: &str) -> &str {
    id.get(..10).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::memory::{MemoryConnector, MemoryRuntime, WaitScript};
    use crate::session::{SessionHarness, WindowSize};

    fn handle(node: Option<&str>) -> AllocationHandle {
        AllocationHandle {
            short_id: "abcdef0123".into(),
            task: "server".into(),
            alloc_id: "a1".into(),
            tier: "production".into(),
            job_id: "web-api".into(),
            task_group: "app".into(),
            node_id: "n1".into(),
            node_name: node.map(str::to_string),
        }
    }

    fn settings() -> BridgeSettings {
        BridgeSettings {
            exec_poll: Duration::from_secs(1),
            log_tail: 100,
            helper_image: "centos:7".into(),
            capture_secs: 30,
            firewall_set: "containerports".into(),
            firewall_timeout_secs: 300,
        }
    }

    fn bridge(runtime: MemoryRuntime) -> (Bridge, Arc<MemoryRuntime>, MemoryConnector) {
        let runtime = Arc::new(runtime);
        let connector = MemoryConnector::new(runtime.clone());
        (
            Bridge::new(Arc::new(connector.clone()), settings()),
            runtime,
            connector,
        )
    }

    fn out(text: &'static str) -> OutputChunk {
        OutputChunk::Stdout(Bytes::from_static(text.as_bytes()))
    }

    #[tokio::test(start_paused = true)]
    async fn exec_polls_until_exit() {
        let (bridge, runtime, connector) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_exec(vec![out("hi\n")], 2, 3),
        );
        let (io, mut harness) = SessionHarness::new(true);
        harness.input.send(Bytes::from_static(b"ls\n")).await.unwrap();
        let resize = harness.resize.clone().unwrap();
        resize.send(WindowSize { cols: 120, rows: 40 }).await.unwrap();

        let status = bridge.exec(&handle(Some("node-1")), vec![], io).await.unwrap();

        assert_eq!(status, 3);
        assert_eq!(runtime.inspect_exec_calls(), 3);
        assert_eq!(connector.hosts(), vec!["node-1".to_string()]);
        let exec = &runtime.execs()[0];
        assert_eq!(exec.cmd, vec![DEFAULT_SHELL.to_string()]);
        assert_eq!(exec.user.as_deref(), Some("root"));
        assert!(exec.tty);
        assert_eq!(runtime.stdin(), b"ls\n");
        assert_eq!(runtime.resizes(), vec![WindowSize { cols: 120, rows: 40 }]);

        let stdout = harness.stdout();
        assert!(stdout.starts_with("welcome to server on node-1\n"));
        assert!(stdout.contains("hi\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn exec_ends_when_output_stream_fails() {
        let (bridge, _, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_exec(vec![out("partial\n")], u32::MAX, 0)
                .fail_exec_output("connection reset"),
        );
        let (io, mut harness) = SessionHarness::new(true);

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            bridge.exec(&handle(Some("node-1")), vec![], io),
        )
        .await
        .expect("exec should end once its output stream fails");

        let err = result.unwrap_err();
        assert!(matches!(err, BridgeError::Runtime(RuntimeError::Api(ref m)) if m == "connection reset"));
        assert!(harness.stdout().contains("partial\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn exec_outlives_closed_output_until_exit() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_exec(vec![out("done\n")], 3, 4)
                .close_exec_output(),
        );
        let (io, _harness) = SessionHarness::new(false);
        let status = bridge.exec(&handle(Some("node-1")), vec![], io).await.unwrap();
        assert_eq!(status, 4);
        assert_eq!(runtime.inspect_exec_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_runs_given_command_without_tty() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_exec(vec![], 0, 0),
        );
        let (io, _harness) = SessionHarness::new(false);
        let cmd = vec!["ls".to_string(), "-l".to_string()];
        let status = bridge.exec(&handle(Some("node-1")), cmd.clone(), io).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(runtime.execs()[0].cmd, cmd);
        assert!(!runtime.execs()[0].tty);
    }

    #[tokio::test]
    async fn missing_container_is_not_found() {
        let (bridge, _, _) = bridge(MemoryRuntime::new().with_task("c1", "server", "other"));
        let (io, _harness) = SessionHarness::new(true);
        let err = bridge.exec(&handle(Some("node-1")), vec![], io).await.unwrap_err();
        assert!(matches!(err, BridgeError::ContainerNotFound(ref name) if name == "/server-a1"));
    }

    #[tokio::test]
    async fn unknown_node_is_rejected() {
        let (bridge, _, connector) = bridge(MemoryRuntime::new());
        let (io, _harness) = SessionHarness::new(true);
        let err = bridge.attach(&handle(None), io).await.unwrap_err();
        assert!(matches!(err, BridgeError::NoNode(_)));
        assert!(connector.hosts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exec_disconnect_tears_down() {
        let (bridge, _, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_exec(vec![], u32::MAX, 0),
        );
        let (io, harness) = SessionHarness::new(true);
        let session = tokio::spawn(async move { bridge.exec(&handle(Some("node-1")), vec![], io).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.disconnect.send(true).unwrap();
        assert_eq!(session.await.unwrap().unwrap(), DISCONNECTED);
    }

    #[tokio::test]
    async fn attach_reports_wait_result() {
        let (bridge, _, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![out("log line\n")], true)
                .script_wait(WaitScript::Exit(7)),
        );
        let (io, _harness) = SessionHarness::new(true);
        let status = bridge.attach(&handle(Some("node-1")), io).await.unwrap();
        assert_eq!(status, 7);
    }

    #[tokio::test]
    async fn attach_output_end_without_result_is_disconnected() {
        let (bridge, _, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![out("bye\n")], false)
                .script_wait(WaitScript::Never),
        );
        let (io, mut harness) = SessionHarness::new(false);
        let status = bridge.attach(&handle(Some("node-1")), io).await.unwrap();
        assert_eq!(status, DISCONNECTED);
        assert!(harness.stdout().contains("bye\n"));
    }

    #[tokio::test]
    async fn logs_use_tail_window() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_logs(
                    vec![out("one\n"), OutputChunk::Stderr(Bytes::from_static(b"two\n"))],
                    false,
                ),
        );
        let (io, mut harness) = SessionHarness::new(false);
        let status = bridge.logs(&handle(Some("node-1")), true, io).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(runtime.log_requests(), vec![(true, 100)]);
        let (stdout, stderr) = harness.drain();
        assert!(stdout.ends_with("one\n"));
        assert_eq!(stderr, "two\n");
    }

    #[tokio::test]
    async fn follow_stops_on_disconnect() {
        let (bridge, _, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_logs(vec![out("one\n")], true),
        );
        let (io, harness) = SessionHarness::new(false);
        let session = tokio::spawn(async move { bridge.logs(&handle(Some("node-1")), true, io).await });
        tokio::task::yield_now().await;
        harness.disconnect.send(true).unwrap();
        assert_eq!(session.await.unwrap().unwrap(), DISCONNECTED);
    }

    #[tokio::test]
    async fn inspect_pretty_prints() {
        let (bridge, _, _) = bridge(MemoryRuntime::new().with_task("c1", "server", "a1"));
        let (io, mut harness) = SessionHarness::new(false);
        assert_eq!(bridge.inspect(&handle(Some("node-1")), io).await.unwrap(), 0);
        let stdout = harness.stdout();
        assert!(stdout.contains("{\n   \"Id\": \"c1\""));
    }

    // ── Helper container cleanup ──────────────────────────────────

    #[tokio::test]
    async fn helper_removed_after_normal_exit() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![out("10.0.0.1 > 10.0.0.2\n")], true)
                .script_wait(WaitScript::Exit(0)),
        );
        let (io, _harness) = SessionHarness::new(true);
        let status = bridge
            .diagnose(&handle(Some("node-1")), Diagnostic::Tcpdump, io)
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert!(runtime.live_helpers().is_empty());
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn helper_removed_after_bounded_duration() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![], true)
                .script_wait(WaitScript::After(Duration::from_secs(30), 124)),
        );
        let (io, _harness) = SessionHarness::new(true);
        let status = bridge
            .diagnose(&handle(Some("node-1")), Diagnostic::Tcpdump, io)
            .await
            .unwrap();
        assert_eq!(status, 124);
        assert!(runtime.live_helpers().is_empty());
    }

    #[tokio::test]
    async fn helper_removed_after_disconnect() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![], true)
                .script_wait(WaitScript::Never),
        );
        let (io, harness) = SessionHarness::new(true);
        let session = tokio::spawn(async move {
            bridge
                .diagnose(&handle(Some("node-1")), Diagnostic::IpsetList, io)
                .await
        });
        while runtime.live_helpers().is_empty() {
            tokio::task::yield_now().await;
        }
        harness.disconnect.send(true).unwrap();
        assert_eq!(session.await.unwrap().unwrap(), DISCONNECTED);
        assert!(runtime.live_helpers().is_empty());
    }

    #[tokio::test]
    async fn helper_removed_when_session_task_is_aborted() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![], true)
                .script_wait(WaitScript::Never),
        );
        let (io, _harness) = SessionHarness::new(true);
        let session = tokio::spawn(async move {
            bridge
                .diagnose(&handle(Some("node-1")), Diagnostic::Tcpdump, io)
                .await
        });
        while runtime.live_helpers().is_empty() {
            tokio::task::yield_now().await;
        }
        session.abort();
        let _ = session.await;
        for _ in 0..10 {
            if runtime.live_helpers().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(runtime.live_helpers().is_empty());
    }

    #[tokio::test]
    async fn ipset_add_validates_before_creating_anything() {
        let (bridge, runtime, connector) = bridge(MemoryRuntime::new().with_task("c1", "server", "a1"));
        let (io, _harness) = SessionHarness::new(true);
        let err = bridge
            .diagnose(
                &handle(Some("node-1")),
                Diagnostic::IpsetAdd("tcp:80 ; reboot".into()),
                io,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert!(connector.hosts().is_empty());
        assert!(runtime.removed().is_empty());
    }

    #[tokio::test]
    async fn ipset_add_targets_container_address() {
        let (bridge, runtime, _) = bridge(
            MemoryRuntime::new()
                .with_task("c1", "server", "a1")
                .script_attach(vec![], true)
                .script_wait(WaitScript::Never),
        );
        let (io, harness) = SessionHarness::new(true);
        let session = tokio::spawn(async move {
            bridge
                .diagnose(
                    &handle(Some("node-1")),
                    Diagnostic::IpsetAdd("tcp:8080,".into()),
                    io,
                )
                .await
        });
        while runtime.helper_specs().is_empty() {
            tokio::task::yield_now().await;
        }
        let spec = &runtime.helper_specs()[0];
        assert_eq!(
            spec.cmd[2],
            "/usr/sbin/ipset add containerports 2001:db8::42,tcp:8080, timeout 300"
        );
        harness.disconnect.send(true).unwrap();
        session.await.unwrap().unwrap();
        assert!(runtime.live_helpers().is_empty());
    }
}
