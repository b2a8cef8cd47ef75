//! Scripted management server and recording collaborators for tests.

use crate::clock::MockClock;
use crate::errors::FailureReason;
use crate::license::{LicenseBook, MemoryLicenseStore};
use crate::manager::Master;
use crate::protocol::codec::{decode_frame, encode_frame, framed};
use crate::protocol::models::{
    sample_identify_result, Frame, IdentifyArgs, IdentifyResult, RemoteError, RemoteErrorKind,
    Request, Response, TestLicenseReply, VersionReply,
};
use crate::client::session::{ChannelStatus, SessionContext, StaticIdentity};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};

pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
}

/// How the scripted server answers.
#[derive(Clone)]
pub(crate) struct Script {
    pub answer_version: bool,
    pub answer_keepalive: bool,
    pub version_error: Option<RemoteErrorKind>,
    pub identify_error: Option<RemoteErrorKind>,
    pub identify_result: IdentifyResult,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            answer_version: true,
            answer_keepalive: true,
            version_error: None,
            identify_error: None,
            identify_result: sample_identify_result(now()),
        }
    }
}

/// What the scripted server saw.
#[derive(Default)]
pub(crate) struct ServerLog {
    pub versions: AtomicUsize,
    pub identifies: AtomicUsize,
    pub keepalives: AtomicUsize,
    pub replies: AtomicUsize,
    pub identify_args: Mutex<Vec<IdentifyArgs>>,
}

impl ServerLog {
    pub fn identifies(&self) -> usize {
        self.identifies.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub fn replies(&self) -> usize {
        self.replies.load(Ordering::SeqCst)
    }
}

/// Serve one connection until the client goes away.
///
/// Requests pushed through `push` are sent to the client as
/// server-initiated calls.
pub(crate) async fn serve(
    stream: DuplexStream,
    script: Script,
    log: Arc<ServerLog>,
    mut push: mpsc::UnboundedReceiver<Request>,
) {
    let mut framed = framed(stream);
    let mut next_id = 1_000u64;
    let mut push_open = true;
    loop {
        tokio::select! {
            pushed = push.recv(), if push_open => {
                let Some(request) = pushed else {
                    push_open = false;
                    continue;
                };
                next_id += 1;
                let frame = Frame::Request { id: next_id, request };
                if framed.send(encode_frame(&frame).unwrap()).await.is_err() {
                    return;
                }
            }
            incoming = framed.next() => {
                let Some(Ok(bytes)) = incoming else { return };
                let frame = decode_frame(&bytes).unwrap();
                let reply = match frame {
                    Frame::Request { id, request } => answer(id, request, &script, &log),
                    Frame::Response { .. } | Frame::Error { .. } => {
                        log.replies.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                };
                if let Some(reply) = reply {
                    if framed.send(encode_frame(&reply).unwrap()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn answer(id: u64, request: Request, script: &Script, log: &ServerLog) -> Option<Frame> {
    let error = |kind| Frame::Error {
        id,
        error: RemoteError::new(kind),
    };
    match request {
        Request::Version(_) => {
            log.versions.fetch_add(1, Ordering::SeqCst);
            if !script.answer_version {
                return None;
            }
            Some(match script.version_error {
                Some(kind) => error(kind),
                None => Frame::Response {
                    id,
                    response: Response::Version(VersionReply {
                        info: "scripted".to_string(),
                    }),
                },
            })
        }
        Request::Identify(args) => {
            log.identifies.fetch_add(1, Ordering::SeqCst);
            log.identify_args.lock().unwrap().push(args);
            Some(match script.identify_error {
                Some(kind) => error(kind),
                None => Frame::Response {
                    id,
                    response: Response::Identify(Box::new(script.identify_result.clone())),
                },
            })
        }
        Request::Keepalive => {
            log.keepalives.fetch_add(1, Ordering::SeqCst);
            script.answer_keepalive.then_some(Frame::Response {
                id,
                response: Response::Keepalive,
            })
        }
        Request::RequestTestLicense => Some(Frame::Response {
            id,
            response: Response::RequestTestLicense(TestLicenseReply {
                license_key: "TEST-KEY".to_string(),
            }),
        }),
        Request::RequestReidentify(_) => Some(error(RemoteErrorKind::ProtocolState)),
    }
}

/// Master that records callbacks.
#[derive(Default)]
pub(crate) struct RecordingMaster {
    pub events: Mutex<Vec<String>>,
}

impl RecordingMaster {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Master for RecordingMaster {
    async fn connection_up(&self, _result: &IdentifyResult) {
        self.events.lock().unwrap().push("up".to_string());
    }

    async fn connection_down(&self, reason: &FailureReason) {
        self.events.lock().unwrap().push(format!("down: {}", reason));
    }

    async fn reidentified(&self, _result: &IdentifyResult) {
        self.events.lock().unwrap().push("reidentified".to_string());
    }
}

/// Collaborators shared by a session or supervisor under test.
pub(crate) struct Harness {
    pub store: Arc<MemoryLicenseStore>,
    pub master: Arc<RecordingMaster>,
    #[allow(dead_code)]
    pub clock: Arc<MockClock>,
    pub ctx: SessionContext,
    pub status: watch::Receiver<ChannelStatus>,
}

pub(crate) fn harness() -> Harness {
    let store = Arc::new(MemoryLicenseStore::new());
    let master = Arc::new(RecordingMaster::default());
    let clock = Arc::new(MockClock::new(now()));
    let identity = Arc::new(StaticIdentity::new(
        "gatesync test",
        IdentifyArgs {
            is_primary: false,
            license_key: "KEY-1".to_string(),
            boot_uuid: "boot".to_string(),
            installation_uuid: "install".to_string(),
            cookie_uuid: String::new(),
            address: "10.0.0.1".to_string(),
            port: 0,
            software_version: "1.0".to_string(),
            software_build_info: "test".to_string(),
            hardware_type: "virtual".to_string(),
            hardware_info: String::new(),
            automatic_updates: true,
            is_live_cd: false,
        },
    ));
    let license = Arc::new(LicenseBook::new(store.clone(), Duration::from_secs(3600)));
    let ctx = SessionContext::new(license, master.clone(), identity, clock.clone());
    let status = ctx.subscribe();
    Harness {
        store,
        master,
        clock,
        ctx,
        status,
    }
}
