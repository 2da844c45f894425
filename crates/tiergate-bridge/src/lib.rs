//! tiergate-bridge — pipes SSH sessions into containers.
//!
//! The bridge resolves an [`AllocationHandle`](tiergate_state::AllocationHandle)
//! to a live container on its node, then relays the session's stdio to an
//! exec instance, the container's own stream, its logs, or a short-lived
//! privileged helper container.
//!
//! The runtime sits behind [`ContainerRuntime`]; [`DockerRuntime`] speaks the
//! Docker Engine API through bollard.

pub mod bridge;
pub mod docker;
pub mod error;
pub mod helper;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
mod relay;
pub mod runtime;
pub mod session;

pub use bridge::{Bridge, BridgeSettings, DEFAULT_SHELL, DISCONNECTED, Diagnostic};
pub use docker::{DockerConnector, DockerRuntime};
pub use error::{BridgeError, BridgeResult, RuntimeError, RuntimeResult};
pub use helper::{HelperGuard, validate_ipset_entry};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryRuntime, WaitScript};
pub use runtime::{
    AttachedStream, ContainerDetails, ContainerRuntime, ContainerSummary, ExecSpec, ExecState,
    HelperSpec, OutputChunk, OutputStream, RuntimeConnector,
};
#[cfg(any(test, feature = "test-util"))]
pub use session::SessionHarness;
pub use session::{SessionIo, SessionOutput, WindowSize};
