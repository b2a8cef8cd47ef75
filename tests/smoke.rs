//! End-to-end smoke test over the public API with an in-process server.

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use gatesync::client::transport::{BoxedStream, Connector};
use gatesync::devices::records::{MemoryDeviceStore, SessionCategory};
use gatesync::devices::system::{SystemDevice, SystemDevices};
use gatesync::license::MemoryLicenseStore;
use gatesync::protocol::codec::{decode_frame, encode_frame, framed};
use gatesync::protocol::models::{
    Frame, IdentifyArgs, IdentifyResult, LicenseStatus, Request, Response, VersionReply,
};
use gatesync::{
    FailureReason, GatesyncConfig, GatesyncError, GatewayManager, GatewayParts, LicenseStore,
    Master, StaticIdentity, SystemClock,
};
use std::sync::{Arc, Mutex};

fn identify_result() -> IdentifyResult {
    let now = Utc::now();
    IdentifyResult {
        software_build_info: String::new(),
        server_info: "smoke".to_string(),
        cookie_uuid: "cookie".to_string(),
        client_address_seen_by_server: "203.0.113.9".to_string(),
        client_port_seen_by_server: 5000,
        behind_nat: false,
        license_max_remote_access_connections: 5,
        license_max_site_to_site_connections: 1,
        license_validity_start: now - chrono::Duration::days(1),
        license_validity_end: now + chrono::Duration::days(1),
        license_recheck_latest_at: now + chrono::Duration::hours(1),
        license_string: "5/1".to_string(),
        license_status: LicenseStatus::Valid,
        is_demo_license: false,
        demo_validity_start: None,
        demo_validity_end: None,
        current_utc_time: now,
        update_available: false,
        update_needed: false,
        update_immediately: false,
        update_forced: false,
        change_log: String::new(),
    }
}

struct InProcessServer;

#[async_trait]
impl Connector for InProcessServer {
    async fn connect(&self) -> Result<BoxedStream, GatesyncError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut framed = framed(server);
            while let Some(Ok(bytes)) = framed.next().await {
                let Ok(Frame::Request { id, request }) = decode_frame(&bytes) else {
                    continue;
                };
                let response = match request {
                    Request::Version(_) => Response::Version(VersionReply {
                        info: "smoke".to_string(),
                    }),
                    Request::Identify(_) => Response::Identify(Box::new(identify_result())),
                    Request::Keepalive => Response::Keepalive,
                    _ => continue,
                };
                let frame = Frame::Response { id, response };
                if framed.send(encode_frame(&frame).unwrap()).await.is_err() {
                    return;
                }
            }
        });
        Ok(Box::new(client))
    }
}

struct NoDevices;

#[async_trait]
impl SystemDevices for NoDevices {
    async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError> {
        Ok(Vec::new())
    }

    async fn kill_device(&self, _name: &str) -> Result<(), GatesyncError> {
        Ok(())
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

#[async_trait]
impl Master for Events {
    async fn connection_up(&self, _result: &IdentifyResult) {
        self.0.lock().unwrap().push("up".to_string());
    }

    async fn connection_down(&self, reason: &FailureReason) {
        self.0.lock().unwrap().push(format!("down: {}", reason));
    }
}

fn identity() -> StaticIdentity {
    StaticIdentity::new(
        "smoke test",
        IdentifyArgs {
            is_primary: true,
            license_key: "SMOKE-KEY".to_string(),
            boot_uuid: "boot".to_string(),
            installation_uuid: "install".to_string(),
            cookie_uuid: String::new(),
            address: "127.0.0.1".to_string(),
            port: 0,
            software_version: "1.0".to_string(),
            software_build_info: String::new(),
            hardware_type: "test".to_string(),
            hardware_info: String::new(),
            automatic_updates: false,
            is_live_cd: false,
        },
    )
}

#[test]
fn crate_compiles() {
    let _ = std::any::type_name::<gatesync::GatesyncConfig>();
    let _ = std::any::type_name::<gatesync::GatesyncError>();
}

#[tokio::test(start_paused = true)]
async fn manager_connects_stores_license_and_admits() {
    let license_store = Arc::new(MemoryLicenseStore::new());
    let master = Arc::new(Events::default());
    let parts = GatewayParts {
        license_store: license_store.clone(),
        device_store: Arc::new(MemoryDeviceStore::new()),
        system: Arc::new(NoDevices),
        connector: Arc::new(InProcessServer),
        identity: Arc::new(identity()),
        master: master.clone(),
        clock: Arc::new(SystemClock),
    };
    let manager = GatewayManager::from_parts(GatesyncConfig::default(), parts).unwrap();
    manager.start().unwrap();

    let result = manager.channel().wait_ready().await.unwrap();
    assert_eq!(result.license_max_remote_access_connections, 5);
    assert!(manager.channel().status().connectivity().connected);

    let record = license_store.get_license().await.unwrap().unwrap();
    assert_eq!(record.license_key, "SMOKE-KEY");
    assert!(manager.admit_new_session(SessionCategory::RemoteAccess).await);
    assert!(manager.admit_new_session(SessionCategory::SiteToSite).await);

    manager.stop().await;
    let events = master.0.lock().unwrap().clone();
    assert_eq!(events, vec!["up".to_string(), "down: disconnected".to_string()]);
}
