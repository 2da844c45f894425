//! The container runtime operations the bridge consumes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use tokio::io::AsyncWrite;

use crate::error::RuntimeResult;
use crate::session::WindowSize;

/// One piece of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = RuntimeResult<OutputChunk>> + Send>>;

/// Both directions of an attached exec or container stream.
pub struct AttachedStream {
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the runtime, with a leading `/`.
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub pid: Option<i64>,
    pub global_ipv6: Option<String>,
    /// The full inspect document.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// A privileged, host-namespaced helper container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
}

/// Docker-style container runtime on one host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Running containers.
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails>;

    /// Create an exec instance and return its id.
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<String>;

    async fn start_exec(&self, exec_id: &str, tty: bool) -> RuntimeResult<AttachedStream>;

    async fn resize_exec(&self, exec_id: &str, size: WindowSize) -> RuntimeResult<()>;

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<ExecState>;

    async fn attach_container(&self, id: &str, stdin: bool) -> RuntimeResult<AttachedStream>;

    async fn resize_container(&self, id: &str, size: WindowSize) -> RuntimeResult<()>;

    /// Resolves with the exit code once the container stops.
    async fn wait_container(&self, id: &str) -> RuntimeResult<i64>;

    /// The last `tail` lines, then new output as it arrives if `follow`.
    async fn logs(&self, id: &str, follow: bool, tail: u32) -> RuntimeResult<OutputStream>;

    async fn create_container(&self, spec: &HelperSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;
}

/// Opens a runtime handle for a node.
pub trait RuntimeConnector: Send + Sync + 'static {
    fn connect(&self, host: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>>;
}
