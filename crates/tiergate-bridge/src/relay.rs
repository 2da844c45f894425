//! Stream relays between a session and the runtime.
//!
//! Each relay runs as a task in a `JoinSet` owned by the bridge call that
//! started it. The set is always drained or aborted before that call
//! returns, so no relay outlives its session.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::RuntimeResult;
use crate::runtime::{ContainerRuntime, OutputChunk, OutputStream};
use crate::session::{SessionOutput, WindowSize};

/// How a relay task finished.
#[derive(Debug)]
pub(crate) enum RelayEnd {
    Output(RuntimeResult<()>),
    Input,
    Resize,
    Wait(RuntimeResult<i64>),
}

/// What window changes apply to.
#[derive(Debug, Clone)]
pub(crate) enum ResizeTarget {
    Exec(String),
    Container(String),
}

/// Runtime output → session output.
pub(crate) async fn pump_output(
    mut output: OutputStream,
    session: mpsc::Sender<SessionOutput>,
) -> RelayEnd {
    while let Some(item) = output.next().await {
        let chunk = match item {
            Ok(OutputChunk::Stdout(bytes)) => SessionOutput::Stdout(bytes),
            Ok(OutputChunk::Stderr(bytes)) => SessionOutput::Stderr(bytes),
            Err(e) => return RelayEnd::Output(Err(e)),
        };
        if session.send(chunk).await.is_err() {
            // Client side is gone; nothing left to deliver to.
            break;
        }
    }
    RelayEnd::Output(Ok(()))
}

/// Session input → runtime input. Closes the runtime's stdin on client EOF.
pub(crate) async fn pump_input(
    mut input: mpsc::Receiver<Bytes>,
    mut writer: Pin<Box<dyn AsyncWrite + Send>>,
) -> RelayEnd {
    while let Some(data) = input.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(error = %e, "runtime stdin closed");
            return RelayEnd::Input;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "failed to close runtime stdin");
    }
    RelayEnd::Input
}

/// Session window changes → runtime resize calls.
pub(crate) async fn pump_resize(
    runtime: Arc<dyn ContainerRuntime>,
    target: ResizeTarget,
    mut sizes: mpsc::Receiver<WindowSize>,
) -> RelayEnd {
    while let Some(size) = sizes.recv().await {
        let result = match &target {
            ResizeTarget::Exec(id) => runtime.resize_exec(id, size).await,
            ResizeTarget::Container(id) => runtime.resize_container(id, size).await,
        };
        if let Err(e) = result {
            warn!(?target, error = %e, "resize failed, no further resizes forwarded");
            break;
        }
    }
    RelayEnd::Resize
}

/// Give the output relay up to `grace` to flush, then stop everything.
pub(crate) async fn drain_and_close(relays: &mut JoinSet<RelayEnd>, grace: Duration) {
    let flush = async {
        while let Some(joined) = relays.join_next().await {
            if let Ok(RelayEnd::Output(_)) = joined {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(grace, flush).await;
    relays.abort_all();
    while relays.join_next().await.is_some() {}
}
