//! SSH server glue: public-key auth, one command per exec channel.
//!
//! ```text
//! client ──auth_publickey──► resolve_principal
//!        ──pty_request─────► window size kept for the channel
//!        ──exec_request────► spawn: Dispatcher::run ─► SessionOutput ─► channel data
//!        ──data / eof──────► SessionIo::input
//!        ──window_change───► SessionIo::resize
//!        ──close / drop────► SessionIo::disconnect
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tiergate_bridge::{SessionIo, SessionOutput, WindowSize};
use tiergate_config::{ConfigStore, GatewayConfig};
use tiergate_dispatch::{AUDIT, Dispatcher, allowed_commands, split_command_line};
use tiergate_state::Principal;

/// Hands out one [`Connection`] per TCP client.
pub struct Gateway {
    store: ConfigStore,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    pub fn new(store: ConfigStore, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }
}

impl Server for Gateway {
    type Handler = Connection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Connection {
        debug!(peer = ?peer, "client connected");
        Connection {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            peer,
            principal: None,
            channels: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    window: Option<WindowSize>,
    input: Option<mpsc::Sender<Bytes>>,
    resize: Option<mpsc::Sender<WindowSize>>,
    disconnect: Option<watch::Sender<bool>>,
}

impl ChannelState {
    fn hang_up(&mut self) {
        self.input = None;
        self.resize = None;
        if let Some(disconnect) = self.disconnect.take() {
            let _ = disconnect.send(true);
        }
    }
}

/// State of one SSH connection.
pub struct Connection {
    store: ConfigStore,
    dispatcher: Arc<Dispatcher>,
    peer: Option<SocketAddr>,
    principal: Option<Principal>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for state in self.channels.values_mut() {
            state.hang_up();
        }
        debug!(peer = ?self.peer, "client disconnected");
    }
}

/// `<type> <base64>`, the form configured keys are compared in.
fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

#[async_trait]
impl Handler for Connection {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let config = self.store.current();
        let fingerprint = format!("SHA256:{}", key.fingerprint());
        debug!(ssh_user = user, %fingerprint, "public key offered");

        match tiergate_dispatch::resolve_principal(&config, &authorized_key_line(key), &fingerprint, self.peer) {
            Some(principal) => {
                self.principal = Some(principal);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(term, col_width, row_height, "pty requested");
        self.channels.entry(channel).or_default().window =
            Some(WindowSize::from_ssh(col_width, row_height));
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let size = WindowSize::from_ssh(col_width, row_height);
            state.window = Some(size);
            if let Some(resize) = &state.resize {
                let _ = resize.try_send(size);
            }
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let config = self.store.current();
        let usage = format!("Only [{}] commands supported\n", allowed_commands(&config).join(" "));
        session.channel_success(channel);
        session.data(channel, CryptoVec::from_slice(usage.as_bytes()));
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(principal) = self.principal.clone() else {
            session.channel_failure(channel);
            return Ok(());
        };
        session.channel_success(channel);

        let line = String::from_utf8_lossy(data).into_owned();
        let state = self.channels.entry(channel).or_default();
        if state.disconnect.is_some() {
            warn!(user = %principal.id, "second exec on one channel ignored");
            return Ok(());
        }

        let (output_tx, output_rx) = mpsc::channel(256);
        let (input_tx, input_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = match state.window {
            Some(size) => {
                let (tx, rx) = mpsc::channel(16);
                let _ = tx.try_send(size);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        state.input = Some(input_tx);
        state.resize = resize_tx;
        state.disconnect = Some(disconnect_tx);

        let io = SessionIo {
            output: output_tx,
            input: input_rx,
            resize: resize_rx,
            disconnect: disconnect_rx,
        };
        tokio::spawn(run_command(
            self.dispatcher.clone(),
            self.store.current(),
            principal,
            line,
            io,
            output_rx,
            session.handle(),
            channel,
        ));
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(input) = self.channels.get(&channel).and_then(|s| s.input.as_ref()) {
            forward_input(input, data, channel);
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(mut state) = self.channels.remove(&channel) {
            state.hang_up();
        }
        Ok(())
    }
}

/// Queue client bytes for the running command. Returns whether they were queued.
///
/// Never waits: this connection's event loop also delivers the command's
/// output, so blocking here could stall both directions.
fn forward_input(input: &mpsc::Sender<Bytes>, data: &[u8], channel: impl fmt::Debug) -> bool {
    match input.try_send(Bytes::copy_from_slice(data)) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(?channel, bytes = dropped.len(), "client input dropped, command is not reading");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(?channel, "client input after the command stopped reading");
            false
        }
    }
}

/// Run one command and relay its output until every writer is gone.
#[allow(clippy::too_many_arguments)]
async fn run_command(
    dispatcher: Arc<Dispatcher>,
    config: Arc<GatewayConfig>,
    principal: Principal,
    line: String,
    io: SessionIo,
    mut output: mpsc::Receiver<SessionOutput>,
    handle: Handle,
    channel: ChannelId,
) {
    let user = principal.id.clone();
    let command = tokio::spawn(async move {
        match split_command_line(&line) {
            Ok(tokens) => dispatcher.run(&config, &principal, tokens, io).await,
            Err(rejection) => {
                warn!(target: AUDIT, user = %principal.id, command = %line, reason = rejection.reason, "command rejected");
                io.say(rejection.message).await;
                1
            }
        }
    });

    while let Some(chunk) = output.recv().await {
        let sent = match chunk {
            SessionOutput::Stdout(bytes) => handle.data(channel, CryptoVec::from_slice(&bytes)).await,
            SessionOutput::Stderr(bytes) => {
                handle.extended_data(channel, 1, CryptoVec::from_slice(&bytes)).await
            }
        };
        if sent.is_err() {
            debug!(%user, "channel closed while writing output");
            break;
        }
    }
    drop(output);

    let status = match command.await {
        Ok(status) => status,
        Err(e) => {
            warn!(%user, error = %e, "command task failed");
            1
        }
    };
    info!(%user, status, "session closed");

    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
