//! The SSH side of a bridged session, as channels.
//!
//! The daemon owns the SSH channel. It feeds client data, window changes and
//! disconnects in through [`SessionIo`], and forwards everything the bridge
//! sends on `output` back to the client.

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    /// Clamp SSH's 32-bit dimensions to what the runtime accepts.
    pub fn from_ssh(cols: u32, rows: u32) -> Self {
        Self {
            cols: u16::try_from(cols).unwrap_or(u16::MAX),
            rows: u16::try_from(rows).unwrap_or(u16::MAX),
        }
    }
}

/// Bytes destined for the SSH client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub struct SessionIo {
    pub output: mpsc::Sender<SessionOutput>,
    /// Client data. Closed when the client sends EOF.
    pub input: mpsc::Receiver<Bytes>,
    /// Window changes, only present when a pty was negotiated.
    pub resize: Option<mpsc::Receiver<WindowSize>>,
    /// Flips to `true` when the client goes away.
    pub disconnect: watch::Receiver<bool>,
}

impl SessionIo {
    pub fn tty(&self) -> bool {
        self.resize.is_some()
    }

    /// Write a line of text to the client's stdout.
    pub async fn say(&self, line: impl Into<String>) {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let _ = self.output.send(SessionOutput::Stdout(Bytes::from(line))).await;
    }

    /// Resolves once the client has disconnected.
    pub async fn disconnected(disconnect: &mut watch::Receiver<bool>) {
        // A dropped sender also means the session is gone.
        let _ = disconnect.wait_for(|gone| *gone).await;
    }
}

/// Test-side ends of a [`SessionIo`].
#[cfg(any(test, feature = "test-util"))]
pub struct SessionHarness {
    pub output: mpsc::Receiver<SessionOutput>,
    pub input: mpsc::Sender<Bytes>,
    pub resize: Option<mpsc::Sender<WindowSize>>,
    pub disconnect: watch::Sender<bool>,
}

#[cfg(any(test, feature = "test-util"))]
impl SessionHarness {
    pub fn new(tty: bool) -> (SessionIo, SessionHarness) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = if tty {
            let (tx, rx) = mpsc::channel(16);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (gone_tx, gone_rx) = watch::channel(false);
        (
            SessionIo {
                output: out_tx,
                input: in_rx,
                resize: resize_rx,
                disconnect: gone_rx,
            },
            SessionHarness {
                output: out_rx,
                input: in_tx,
                resize: resize_tx,
                disconnect: gone_tx,
            },
        )
    }

    /// Everything written to stdout so far, as text.
    pub fn stdout(&mut self) -> String {
        let mut text = String::new();
        while let Ok(chunk) = self.output.try_recv() {
            if let SessionOutput::Stdout(bytes) = chunk {
                text.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        text
    }

    /// Everything written so far, split by stream.
    pub fn drain(&mut self) -> (String, String) {
        let (mut out, mut err) = (String::new(), String::new());
        while let Ok(chunk) = self.output.try_recv() {
            match chunk {
                SessionOutput::Stdout(b) => out.push_str(&String::from_utf8_lossy(&b)),
                SessionOutput::Stderr(b) => err.push_str(&String::from_utf8_lossy(&b)),
            }
        }
        (out, err)
    }
}
