//! Reconnect supervision for the management channel.
//!
//! The primary channel reconnects forever with exponential backoff; the
//! backoff only resets after a connection reached Ready. A one-off
//! connection runs a single attempt. Every failure is reported to the
//! [`Master`](crate::manager::Master) and, for an authoritative
//! `InvalidLicense`, invalidates the stored license.

use crate::client::backoff::Backoff;
use crate::client::session::{
    session_channel, ChannelStatus, ConnectionState, Session, SessionContext, SessionHandle,
    SessionOutcome,
};
use crate::client::transport::Connector;
use crate::config::ManagementConfig;
use crate::errors::FailureReason;
use crate::protocol::models::IdentifyResult;
use crate::GatesyncError;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type CurrentSession = Arc<Mutex<Option<SessionHandle>>>;

/// Supervised management channel.
pub struct ManagementChannel {
    config: ManagementConfig,
    ctx: SessionContext,
    connector: Arc<dyn Connector>,
    current: CurrentSession,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagementChannel {
    /// Create an idle channel.
    pub fn new(config: ManagementConfig, ctx: SessionContext, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            ctx,
            connector,
            current: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Start the primary channel with automatic reconnect.
    ///
    /// Does nothing while a previous start is still running.
    pub fn start_primary(&self) -> Result<(), GatesyncError> {
        self.spawn(true)
    }

    /// Run a single non-primary connection attempt.
    pub fn connect_once(&self) -> Result<(), GatesyncError> {
        self.spawn(false)
    }

    fn spawn(&self, primary: bool) -> Result<(), GatesyncError> {
        let mut task = self.task.lock().map_err(|_| poisoned())?;
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            warn!("management channel already running");
            return Ok(());
        }

        self.ctx.status.send_modify(|status| status.stopped = false);
        let connector = self.connector.clone();
        let config = self.config.clone();
        let ctx = self.ctx.clone();
        let current = self.current.clone();
        *task = Some(tokio::spawn(async move {
            if primary {
                primary_loop(connector, config, ctx, current).await;
            } else {
                attempt(connector.as_ref(), &config, false, &ctx, &current).await;
            }
        }));
        Ok(())
    }

    /// Wait until the channel is Ready.
    ///
    /// Resolves with the identify result, or fails when the next attempt
    /// fails or the channel is stopped.
    pub async fn wait_ready(&self) -> Result<IdentifyResult, GatesyncError> {
        let mut rx = self.ctx.subscribe();
        let failures_before = rx.borrow().failures;
        let status = rx
            .wait_for(|status| {
                status.is_ready() || status.stopped || status.failures > failures_before
            })
            .await
            .map_err(|_| GatesyncError::Disconnected)?
            .clone();

        if let (true, Some(result)) = (status.is_ready(), status.identify) {
            return Ok(result);
        }
        if status.stopped {
            return Err(GatesyncError::Disconnected);
        }
        Err(GatesyncError::ConnectionFailed(
            status.last_failure.unwrap_or(FailureReason::Disconnected),
        ))
    }

    /// Stop the channel, cancelling the live connection, any attempt in
    /// flight and any scheduled reconnect.
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Ok(mut current) = self.current.lock() {
            current.take();
        }
        let Some(task) = task else {
            return;
        };

        let was_running = !task.is_finished();
        task.abort();
        let _ = task.await;

        self.ctx.status.send_modify(|status| {
            status.state = ConnectionState::Idle;
            status.identify = None;
            status.stopped = true;
        });
        if was_running {
            info!("management channel stopped");
            self.ctx
                .master
                .connection_down(&FailureReason::Disconnected)
                .await;
        }
    }

    fn session(&self) -> Result<SessionHandle, GatesyncError> {
        self.current
            .lock()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(GatesyncError::Disconnected)
    }

    /// Identify again on the live connection.
    pub async fn trigger_reidentify(&self) -> Result<(), GatesyncError> {
        self.session()?.trigger_reidentify().await
    }

    /// Ask the server for a demo license key on the live connection.
    pub async fn request_test_license(&self) -> Result<String, GatesyncError> {
        self.session()?.request_test_license().await
    }

    /// Snapshot of the channel status.
    pub fn status(&self) -> ChannelStatus {
        self.ctx.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.ctx.subscribe()
    }
}

fn poisoned() -> GatesyncError {
    GatesyncError::Io("management channel lock poisoned".to_string())
}

async fn primary_loop(
    connector: Arc<dyn Connector>,
    config: ManagementConfig,
    ctx: SessionContext,
    current: CurrentSession,
) {
    let mut backoff = Backoff::new(&config.backoff);
    loop {
        let outcome = attempt(connector.as_ref(), &config, true, &ctx, &current).await;
        if outcome.reason.is_local_disconnect() {
            return;
        }
        if outcome.reached_ready {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting to management server");
        tokio::time::sleep(delay).await;
    }
}

async fn attempt(
    connector: &dyn Connector,
    config: &ManagementConfig,
    primary: bool,
    ctx: &SessionContext,
    current: &CurrentSession,
) -> SessionOutcome {
    ctx.set_state(ConnectionState::Connecting);

    let outcome = match connector.connect().await {
        Err(e) => SessionOutcome {
            reached_ready: false,
            reason: FailureReason::from(e),
        },
        Ok(stream) => {
            let (handle, commands) = session_channel();
            if let Ok(mut slot) = current.lock() {
                *slot = Some(handle);
            }
            let outcome = Session::new(stream, config.clone(), primary, ctx.clone(), commands)
                .run()
                .await;
            if let Ok(mut slot) = current.lock() {
                slot.take();
            }
            outcome
        }
    };

    report_failure(ctx, &outcome.reason).await;
    outcome
}

async fn report_failure(ctx: &SessionContext, reason: &FailureReason) {
    match reason {
        FailureReason::CertificateRejected(detail) => {
            error!(detail = %detail, "management server certificate rejected")
        }
        FailureReason::Disconnected => info!("management connection closed"),
        other => warn!(reason = %other, "management connection failed"),
    }

    if reason.invalidates_license() {
        if let Err(e) = ctx.license.invalidate(ctx.clock.now_utc()).await {
            warn!(error = %e, "failed to invalidate license");
        }
    }

    ctx.status.send_modify(|status| {
        status.state = ConnectionState::Idle;
        status.identify = None;
        status.last_failure = Some(reason.clone());
        status.failures += 1;
    });
    ctx.master.connection_down(reason).await;
}
