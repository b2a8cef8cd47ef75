//! One management connection from handshake to teardown.
//!
//! A [`Session`] owns the framed stream and runs a single task that races
//! inbound frames, local commands and three timers:
//!
//! - keepalive send, armed as soon as the transport is up. If it fires
//!   before the handshake finished the connection is abandoned.
//! - keepalive wait, armed while a keepalive or reidentify RPC is in
//!   flight. Expiry aborts the connection.
//! - reidentify, derived from the license recheck deadline (primary only).
//!
//! The send and wait timers never run together, and at most one keepalive
//! or reidentify RPC is outstanding at any time.

use crate::clock::Clock;
use crate::errors::FailureReason;
use crate::license::LicenseBook;
use crate::manager::Master;
use crate::protocol::codec::{decode_frame, encode_frame, framed, FramedStream};
use crate::protocol::models::{
    ConnectivityStatus, Frame, IdentifyArgs, IdentifyResult, RemoteError, RemoteErrorKind,
    Request, Response, VersionArgs, PROTOCOL_VERSION,
};
use crate::config::ManagementConfig;
use crate::GatesyncError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Idle,
    /// Transport being established.
    Connecting,
    /// Version sent, waiting for the answer.
    AwaitingVersion,
    /// Identify sent, waiting for the answer.
    AwaitingIdentify,
    /// Handshake complete.
    Ready,
    /// Local disconnect in progress.
    Disconnecting,
}

/// Observable channel state, published through a watch channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Latest identify result of the live connection.
    pub identify: Option<IdentifyResult>,
    /// Why the last connection or attempt ended.
    pub last_failure: Option<FailureReason>,
    /// Number of connections or attempts that ended so far.
    pub failures: u64,
    /// Set once the channel was stopped locally.
    pub stopped: bool,
}

impl ChannelStatus {
    /// Whether the handshake completed.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready && self.identify.is_some()
    }

    /// Connectivity view for status displays.
    pub fn connectivity(&self) -> ConnectivityStatus {
        match (&self.identify, self.state) {
            (Some(result), ConnectionState::Ready) => ConnectivityStatus::from_identify(result),
            _ => ConnectivityStatus::default(),
        }
    }
}

/// Supplies the gateway's side of the handshake.
pub trait IdentitySource: Send + Sync {
    /// Arguments for `Version`.
    fn version_args(&self) -> VersionArgs;

    /// Arguments for `Identify`.
    fn identify_args(&self, primary: bool) -> IdentifyArgs;

    /// Keep the cookie handed out by the server for the next identify.
    fn remember_cookie(&self, _cookie: &str) {}
}

/// Identity with fixed arguments and an in-memory cookie.
#[derive(Debug)]
pub struct StaticIdentity {
    info: String,
    args: IdentifyArgs,
    cookie: Mutex<String>,
}

impl StaticIdentity {
    /// Create from a client description and identify template.
    pub fn new(info: impl Into<String>, args: IdentifyArgs) -> Self {
        let cookie = Mutex::new(args.cookie_uuid.clone());
        Self {
            info: info.into(),
            args,
            cookie,
        }
    }
}

impl IdentitySource for StaticIdentity {
    fn version_args(&self) -> VersionArgs {
        VersionArgs {
            version: PROTOCOL_VERSION,
            info: self.info.clone(),
        }
    }

    fn identify_args(&self, primary: bool) -> IdentifyArgs {
        let mut args = self.args.clone();
        args.is_primary = primary;
        args.cookie_uuid = self
            .cookie
            .lock()
            .map(|cookie| cookie.clone())
            .unwrap_or_default();
        args
    }

    fn remember_cookie(&self, cookie: &str) {
        if let Ok(mut current) = self.cookie.lock() {
            *current = cookie.to_string();
        }
    }
}

/// Collaborators a session reports to.
#[derive(Clone)]
pub struct SessionContext {
    /// License persistence.
    pub license: Arc<LicenseBook>,
    /// Connection event sink.
    pub master: Arc<dyn Master>,
    /// Handshake arguments.
    pub identity: Arc<dyn IdentitySource>,
    /// Wall clock for license deadlines.
    pub clock: Arc<dyn Clock>,
    /// Published status.
    pub status: Arc<watch::Sender<ChannelStatus>>,
}

impl SessionContext {
    /// Create a context with a fresh status channel.
    pub fn new(
        license: Arc<LicenseBook>,
        master: Arc<dyn Master>,
        identity: Arc<dyn IdentitySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        Self {
            license,
            master,
            identity,
            clock,
            status: Arc::new(status),
        }
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }
}

/// Delay until the next scheduled reidentify.
///
/// The server's recheck deadline, clamped to `[min, max]`. A deadline in
/// the past yields `min`.
pub fn reidentify_delay(
    recheck_latest_at: DateTime<Utc>,
    now: DateTime<Utc>,
    min: Duration,
    max: Duration,
) -> Duration {
    (recheck_latest_at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(min, max)
}

enum Command {
    Reidentify,
    TestLicense(oneshot::Sender<Result<String, GatesyncError>>),
    Disconnect,
}

/// Command side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

/// Receiving side handed to [`Session::new`].
pub struct SessionCommands {
    rx: mpsc::Receiver<Command>,
}

/// Create a connected handle and command receiver.
pub fn session_channel() -> (SessionHandle, SessionCommands) {
    let (tx, rx) = mpsc::channel(8);
    (SessionHandle { tx }, SessionCommands { rx })
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), GatesyncError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| GatesyncError::Disconnected)
    }

    /// Identify again now, replacing the scheduled reidentify.
    pub async fn trigger_reidentify(&self) -> Result<(), GatesyncError> {
        self.send(Command::Reidentify).await
    }

    /// Ask the server for a demo license key.
    pub async fn request_test_license(&self) -> Result<String, GatesyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TestLicense(tx)).await?;
        rx.await.map_err(|_| GatesyncError::Disconnected)?
    }

    /// Close the connection.
    pub async fn disconnect(&self) -> Result<(), GatesyncError> {
        self.send(Command::Disconnect).await
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Whether the handshake completed before the end.
    pub reached_ready: bool,
    /// Why the session ended.
    pub reason: FailureReason,
}

enum Pending {
    Version,
    Identify { initial: bool },
    Keepalive,
    TestLicense(oneshot::Sender<Result<String, GatesyncError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Idle,
    Keepalive,
    Reidentify,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A management connection over an established transport.
pub struct Session<S> {
    framed: FramedStream<S>,
    config: ManagementConfig,
    primary: bool,
    ctx: SessionContext,
    commands: mpsc::Receiver<Command>,
    state: ConnectionState,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    probe: Probe,
    keepalive_send_at: Option<Instant>,
    keepalive_wait_until: Option<Instant>,
    reidentify_at: Option<Instant>,
    reidentify_due: bool,
    reached_ready: bool,
    license_key: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wrap an established transport.
    pub fn new(
        stream: S,
        config: ManagementConfig,
        primary: bool,
        ctx: SessionContext,
        commands: SessionCommands,
    ) -> Self {
        Self {
            framed: framed(stream),
            config,
            primary,
            ctx,
            commands: commands.rx,
            state: ConnectionState::Connecting,
            next_id: 0,
            pending: HashMap::new(),
            probe: Probe::Idle,
            keepalive_send_at: None,
            keepalive_wait_until: None,
            reidentify_at: None,
            reidentify_due: false,
            reached_ready: false,
            license_key: String::new(),
        }
    }

    /// Run the handshake and serve the connection until it ends.
    pub async fn run(mut self) -> SessionOutcome {
        let reason = self.drive().await;
        debug!(reason = %reason, reached_ready = self.reached_ready, "management session ended");
        SessionOutcome {
            reached_ready: self.reached_ready,
            reason,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.ctx.set_state(state);
    }

    async fn drive(&mut self) -> FailureReason {
        // 1. Keepalive timer doubles as the handshake bound
        self.keepalive_send_at = Some(Instant::now() + self.config.keepalive_interval);
        self.set_state(ConnectionState::AwaitingVersion);

        // 2. Version first
        let version = self.ctx.identity.version_args();
        if let Err(reason) = self.call(Request::Version(version), Pending::Version).await {
            return reason;
        }

        // 3. Event loop
        loop {
            let send_at = self.keepalive_send_at;
            let wait_until = self.keepalive_wait_until;
            let reidentify_at = self.reidentify_at;

            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Err(FailureReason::Disconnected),
                },
                incoming = self.framed.next() => match incoming {
                    None => Err(FailureReason::PeerClosed),
                    Some(Err(e)) => Err(FailureReason::Transport(format!("read failed: {}", e))),
                    Some(Ok(bytes)) => self.on_frame(&bytes).await,
                },
                _ = sleep_until_opt(send_at) => self.on_keepalive_due().await,
                _ = sleep_until_opt(wait_until) => {
                    warn!(probe = ?self.probe, "management server did not answer in time");
                    Err(FailureReason::KeepaliveTimeout)
                }
                _ = sleep_until_opt(reidentify_at) => {
                    self.reidentify_at = None;
                    self.reidentify_due = true;
                    self.start_reidentify_if_due().await
                }
            };

            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), FailureReason> {
        let body = encode_frame(&frame).map_err(FailureReason::from)?;
        self.framed
            .send(body)
            .await
            .map_err(|e| FailureReason::Transport(format!("write failed: {}", e)))
    }

    async fn call(&mut self, request: Request, pending: Pending) -> Result<(), FailureReason> {
        self.next_id += 1;
        let id = self.next_id;
        debug!(id, command = request.command(), "sending request");
        self.pending.insert(id, pending);
        self.send(Frame::Request { id, request }).await
    }

    async fn send_identify(&mut self, initial: bool) -> Result<(), FailureReason> {
        let args = self.ctx.identity.identify_args(self.primary);
        self.license_key = args.license_key.clone();
        self.call(Request::Identify(args), Pending::Identify { initial })
            .await
    }

    fn begin_probe(&mut self, probe: Probe) {
        self.probe = probe;
        self.keepalive_send_at = None;
        self.keepalive_wait_until = Some(Instant::now() + self.config.keepalive_wait);
    }

    fn end_probe(&mut self) {
        self.probe = Probe::Idle;
        self.keepalive_wait_until = None;
        self.keepalive_send_at = Some(Instant::now() + self.config.keepalive_interval);
    }

    async fn on_keepalive_due(&mut self) -> Result<(), FailureReason> {
        if self.state != ConnectionState::Ready {
            warn!(state = ?self.state, "handshake did not complete within the keepalive interval");
            return Err(FailureReason::HandshakeTimeout);
        }
        self.keepalive_send_at = None;
        if self.probe != Probe::Idle {
            return Ok(());
        }
        self.begin_probe(Probe::Keepalive);
        self.call(Request::Keepalive, Pending::Keepalive).await
    }

    async fn start_reidentify_if_due(&mut self) -> Result<(), FailureReason> {
        if !self.reidentify_due
            || self.state != ConnectionState::Ready
            || self.probe != Probe::Idle
        {
            return Ok(());
        }
        self.reidentify_due = false;
        info!("reidentifying to management server");
        self.begin_probe(Probe::Reidentify);
        self.send_identify(false).await
    }

    fn request_reidentify_now(&mut self) {
        self.reidentify_at = None;
        self.reidentify_due = true;
    }

    async fn on_command(&mut self, command: Command) -> Result<(), FailureReason> {
        match command {
            Command::Reidentify => {
                self.request_reidentify_now();
                self.start_reidentify_if_due().await
            }
            Command::TestLicense(reply) => {
                if self.state != ConnectionState::Ready {
                    let _ = reply.send(Err(GatesyncError::Disconnected));
                    return Ok(());
                }
                self.call(Request::RequestTestLicense, Pending::TestLicense(reply))
                    .await
            }
            Command::Disconnect => {
                info!("closing management connection");
                self.set_state(ConnectionState::Disconnecting);
                if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
                    debug!(error = %e, "close failed");
                }
                Err(FailureReason::Disconnected)
            }
        }
    }

    async fn on_frame(&mut self, body: &[u8]) -> Result<(), FailureReason> {
        match decode_frame(body).map_err(FailureReason::from)? {
            Frame::Request { id, request } => self.on_server_request(id, request).await,
            Frame::Response { id, response } => self.on_response(id, response).await,
            Frame::Error { id, error } => self.on_error(id, error),
        }
    }

    async fn on_server_request(&mut self, id: u64, request: Request) -> Result<(), FailureReason> {
        match request {
            Request::Keepalive => {
                debug!(id, "keepalive from server");
                self.send(Frame::Response {
                    id,
                    response: Response::Keepalive,
                })
                .await
            }
            Request::RequestReidentify(args) => {
                info!(reason = %args.reason, "server requested reidentify");
                self.send(Frame::Response {
                    id,
                    response: Response::RequestReidentify,
                })
                .await?;
                self.request_reidentify_now();
                self.start_reidentify_if_due().await
            }
            other => {
                warn!(id, command = other.command(), "unexpected request from server");
                self.send(Frame::Error {
                    id,
                    error: RemoteError::new(RemoteErrorKind::ProtocolState),
                })
                .await
            }
        }
    }

    async fn on_response(&mut self, id: u64, response: Response) -> Result<(), FailureReason> {
        let pending = self.pending.remove(&id).ok_or_else(|| {
            FailureReason::ProtocolViolation(format!("response to unknown request {}", id))
        })?;

        match (pending, response) {
            (Pending::Version, Response::Version(reply)) => {
                debug!(server = %reply.info, "version accepted");
                self.set_state(ConnectionState::AwaitingIdentify);
                self.send_identify(true).await
            }
            (Pending::Identify { initial }, Response::Identify(result)) => {
                self.on_identify(*result, initial).await;
                if !initial {
                    self.end_probe();
                }
                Ok(())
            }
            (Pending::Keepalive, Response::Keepalive) => {
                debug!("keepalive answered");
                self.end_probe();
                self.start_reidentify_if_due().await
            }
            (Pending::TestLicense(reply), Response::RequestTestLicense(granted)) => {
                info!("test license granted");
                let _ = reply.send(Ok(granted.license_key));
                Ok(())
            }
            (_, response) => Err(FailureReason::ProtocolViolation(format!(
                "mismatched response to request {}: {:?}",
                id, response
            ))),
        }
    }

    fn on_error(&mut self, id: u64, error: RemoteError) -> Result<(), FailureReason> {
        let pending = self.pending.remove(&id).ok_or_else(|| {
            FailureReason::ProtocolViolation(format!("error for unknown request {}", id))
        })?;
        warn!(id, kind = %error.kind, detail = ?error.detail, "management server returned error");

        match pending {
            Pending::TestLicense(reply) => {
                let _ = reply.send(Err(GatesyncError::Remote {
                    kind: error.kind,
                    detail: error.detail,
                }));
                Ok(())
            }
            Pending::Version | Pending::Identify { .. } | Pending::Keepalive => {
                Err(FailureReason::Remote {
                    kind: error.kind,
                    detail: error.detail,
                })
            }
        }
    }

    async fn on_identify(&mut self, result: IdentifyResult, initial: bool) {
        let now = self.ctx.clock.now_utc();

        // 1. License parameters
        if let Err(e) = self
            .ctx
            .license
            .apply_identify(&result, &self.license_key, now)
            .await
        {
            warn!(error = %e, "failed to store license parameters");
        }
        self.ctx.identity.remember_cookie(&result.cookie_uuid);

        // 2. Next reidentify
        if self.primary {
            let delay = reidentify_delay(
                result.license_recheck_latest_at,
                now,
                self.config.reidentify_min,
                self.config.reidentify_max,
            );
            debug!(delay_secs = delay.as_secs(), "reidentify scheduled");
            self.reidentify_at = Some(Instant::now() + delay);
        }

        // 3. Publish and notify
        self.ctx
            .status
            .send_modify(|status| status.identify = Some(result.clone()));
        if initial {
            self.reached_ready = true;
            self.set_state(ConnectionState::Ready);
            info!(
                behind_nat = result.behind_nat,
                server = %result.server_info,
                "management connection ready"
            );
            self.ctx.master.connection_up(&result).await;
        } else {
            self.ctx.master.reidentified(&result).await;
        }
    }
}
