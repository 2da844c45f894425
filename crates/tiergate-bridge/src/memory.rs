//! In-memory container runtime used by tests.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::io::AsyncWrite;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    AttachedStream, ContainerDetails, ContainerRuntime, ContainerSummary, ExecSpec, ExecState,
    HelperSpec, OutputChunk, OutputStream, RuntimeConnector,
};
use crate::session::WindowSize;

/// How `wait_container` resolves.
#[derive(Debug, Clone, Copy)]
pub enum WaitScript {
    Exit(i64),
    After(Duration, i64),
    Never,
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub name: String,
    pub pid: Option<i64>,
    pub global_ipv6: Option<String>,
    pub helper: Option<HelperSpec>,
}

#[derive(Debug)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    next_id: u64,
    exec_output: Vec<OutputChunk>,
    exec_polls_running: u32,
    exec_exit: i64,
    exec_hold_open: bool,
    exec_failure: Option<String>,
    attach_output: Vec<OutputChunk>,
    attach_hold_open: bool,
    wait: WaitScript,
    logs: Vec<OutputChunk>,
    logs_hold_open: bool,
    log_requests: Vec<(bool, u32)>,
    execs: Vec<ExecSpec>,
    resizes: Vec<WindowSize>,
    removed: Vec<String>,
    inspect_exec_calls: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            containers: BTreeMap::new(),
            next_id: 0,
            exec_output: Vec::new(),
            exec_polls_running: 0,
            exec_exit: 0,
            exec_hold_open: true,
            exec_failure: None,
            attach_output: Vec::new(),
            attach_hold_open: true,
            wait: WaitScript::Never,
            logs: Vec::new(),
            logs_hold_open: false,
            log_requests: Vec::new(),
            execs: Vec::new(),
            resizes: Vec::new(),
            removed: Vec::new(),
            inspect_exec_calls: 0,
        }
    }
}

/// A scriptable single-host runtime.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    stdin: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a running container named `/<task>-<alloc_id>`.
    pub fn with_task(self, id: &str, task: &str, alloc_id: &str) -> Self {
        self.lock().containers.insert(
            id.to_string(),
            MemoryContainer {
                name: format!("/{task}-{alloc_id}"),
                pid: Some(4242),
                global_ipv6: Some("2001:db8::42".to_string()),
                helper: None,
            },
        );
        self
    }

    /// Exec output, then `polls_running` polls before exiting with `exit`.
    pub fn script_exec(self, output: Vec<OutputChunk>, polls_running: u32, exit: i64) -> Self {
        {
            let mut state = self.lock();
            state.exec_output = output;
            state.exec_polls_running = polls_running;
            state.exec_exit = exit;
        }
        self
    }

    /// End the exec output stream with `message` after the scripted chunks.
    pub fn fail_exec_output(self, message: &str) -> Self {
        self.lock().exec_failure = Some(message.to_string());
        self
    }

    /// Close the exec output stream after the scripted chunks.
    pub fn close_exec_output(self) -> Self {
        self.lock().exec_hold_open = false;
        self
    }

    pub fn script_attach(self, output: Vec<OutputChunk>, hold_open: bool) -> Self {
        {
            let mut state = self.lock();
            state.attach_output = output;
            state.attach_hold_open = hold_open;
        }
        self
    }

    pub fn script_wait(self, wait: WaitScript) -> Self {
        self.lock().wait = wait;
        self
    }

    pub fn script_logs(self, output: Vec<OutputChunk>, hold_open: bool) -> Self {
        {
            let mut state = self.lock();
            state.logs = output;
            state.logs_hold_open = hold_open;
        }
        self
    }

    /// Ids of helper containers that still exist.
    pub fn live_helpers(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, c)| c.helper.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids passed to `remove_container`, in order.
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn execs(&self) -> Vec<ExecSpec> {
        self.lock().execs.clone()
    }

    pub fn resizes(&self) -> Vec<WindowSize> {
        self.lock().resizes.clone()
    }

    pub fn log_requests(&self) -> Vec<(bool, u32)> {
        self.lock().log_requests.clone()
    }

    pub fn inspect_exec_calls(&self) -> u32 {
        self.lock().inspect_exec_calls
    }

    /// Specs of helpers that still exist.
    pub fn helper_specs(&self) -> Vec<HelperSpec> {
        self.lock()
            .containers
            .values()
            .filter_map(|c| c.helper.clone())
            .collect()
    }

    /// Bytes written to any stdin stream.
    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn output(chunks: Vec<OutputChunk>, hold_open: bool) -> OutputStream {
        let items = stream::iter(chunks.into_iter().map(Ok::<_, RuntimeError>));
        if hold_open {
            items.chain(stream::pending()).boxed()
        } else {
            items.boxed()
        }
    }

    fn attached(&self, chunks: Vec<OutputChunk>, hold_open: bool) -> AttachedStream {
        AttachedStream {
            output: Self::output(chunks, hold_open),
            input: Box::pin(CaptureWriter(self.stdin.clone())),
        }
    }

    fn container(&self, id: &str) -> RuntimeResult<MemoryContainer> {
        self.lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.name.clone()],
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let c = self.container(id)?;
        Ok(ContainerDetails {
            pid: c.pid,
            global_ipv6: c.global_ipv6.clone(),
            raw: serde_json::json!({"Id": id, "Name": c.name, "State": {"Pid": c.pid}}),
        })
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        self.container(container)?;
        let mut state = self.lock();
        state.execs.push(spec.clone());
        Ok(format!("exec-{}", state.execs.len()))
    }

    async fn start_exec(&self, _exec_id: &str, _tty: bool) -> RuntimeResult<AttachedStream> {
        let (chunks, hold_open, failure) = {
            let state = self.lock();
            (state.exec_output.clone(), state.exec_hold_open, state.exec_failure.clone())
        };
        let Some(message) = failure else {
            return Ok(self.attached(chunks, hold_open));
        };
        let items = stream::iter(chunks.into_iter().map(Ok::<_, RuntimeError>))
            .chain(stream::once(async move { Err(RuntimeError::Api(message)) }))
            .chain(stream::pending());
        Ok(AttachedStream {
            output: items.boxed(),
            input: Box::pin(CaptureWriter(self.stdin.clone())),
        })
    }

    async fn resize_exec(&self, _exec_id: &str, size: WindowSize) -> RuntimeResult<()> {
        self.lock().resizes.push(size);
        Ok(())
    }

    async fn inspect_exec(&self, _exec_id: &str) -> RuntimeResult<ExecState> {
        let mut state = self.lock();
        state.inspect_exec_calls += 1;
        if state.exec_polls_running > 0 {
            state.exec_polls_running -= 1;
            return Ok(ExecState {
                running: true,
                exit_code: None,
            });
        }
        Ok(ExecState {
            running: false,
            exit_code: Some(state.exec_exit),
        })
    }

    async fn attach_container(&self, id: &str, _stdin: bool) -> RuntimeResult<AttachedStream> {
        self.container(id)?;
        let (chunks, hold_open) = {
            let state = self.lock();
            (state.attach_output.clone(), state.attach_hold_open)
        };
        Ok(self.attached(chunks, hold_open))
    }

    async fn resize_container(&self, _id: &str, size: WindowSize) -> RuntimeResult<()> {
        self.lock().resizes.push(size);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        self.container(id)?;
        let wait = self.lock().wait;
        match wait {
            WaitScript::Exit(code) => Ok(code),
            WaitScript::After(delay, code) => {
                tokio::time::sleep(delay).await;
                Ok(code)
            }
            WaitScript::Never => std::future::pending().await,
        }
    }

    async fn logs(&self, id: &str, follow: bool, tail: u32) -> RuntimeResult<OutputStream> {
        self.container(id)?;
        let mut state = self.lock();
        state.log_requests.push((follow, tail));
        Ok(Self::output(state.logs.clone(), state.logs_hold_open))
    }

    async fn create_container(&self, spec: &HelperSpec) -> RuntimeResult<String> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("helper{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                name: format!("/{id}"),
                pid: None,
                global_ipv6: None,
                helper: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.container(id).map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.removed.push(id.to_string());
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

/// Hands out the same [`MemoryRuntime`] for every host.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pub runtime: Arc<MemoryRuntime>,
    hosts: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnector {
    pub fn new(runtime: Arc<MemoryRuntime>) -> Self {
        Self {
            runtime,
            hosts: Arc::default(),
        }
    }

    /// Hosts connected to, in order.
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RuntimeConnector for MemoryConnector {
    fn connect(&self, host: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(host.to_string());
        Ok(self.runtime.clone())
    }
}
