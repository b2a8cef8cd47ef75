//! Periodic reconciliation of system devices against persisted records.
//!
//! The kernel's device list and the persisted records are updated by
//! different actors (pppd scripts, crashes, restarts) and routinely disagree
//! for a moment. A device or record is only acted upon after it has been
//! orphaned for several consecutive rounds.

use crate::clock::Clock;
use crate::config::ReconcileConfig;
use crate::devices::records::{DeviceRecord, DeviceStore, LinkRecord, LinkRole};
use crate::devices::system::{is_session_device, SystemDevice, SystemDevices};
use crate::GatesyncError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Consecutive-round orphan counts keyed by device name.
#[derive(Debug, Default, Clone)]
pub struct FailureCounters {
    counts: HashMap<String, u32>,
}

impl FailureCounters {
    /// Record one round: every orphan gets one more failure, every name
    /// that is no longer orphaned is forgotten.
    pub fn record_round(&mut self, orphans: &HashSet<String>) {
        let mut next = HashMap::with_capacity(orphans.len());
        for name in orphans {
            let count = self.counts.get(name).copied().unwrap_or(0) + 1;
            next.insert(name.clone(), count);
        }
        for name in self.counts.keys() {
            if !orphans.contains(name) {
                info!(device = %name, "device back in sync");
            }
        }
        self.counts = next;
    }

    /// Failures recorded for a name.
    pub fn get(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// Forget a name after it was dealt with.
    pub fn remove(&mut self, name: &str) {
        self.counts.remove(name);
    }

    /// Names at or above `limit`, sorted for stable processing order.
    pub fn at_limit(&self, limit: u32) -> Vec<String> {
        let mut names: Vec<String> = self
            .counts
            .iter()
            .filter(|(_, count)| **count >= limit)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of tracked names.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// What one round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// System devices killed for lacking a record.
    pub killed: Vec<String>,
    /// Records deleted for lacking a system device.
    pub deleted: Vec<String>,
    /// Matched records whose counters were refreshed.
    pub updated: usize,
    /// Records that became active this round.
    pub became_active: Vec<String>,
    /// Records that became inactive this round.
    pub became_inactive: Vec<String>,
    /// Session devices currently up.
    pub system_devices: usize,
    /// Records after the round.
    pub records: usize,
}

/// Liveness rule: the least recently changed direction decides.
pub fn is_alive(record: &DeviceRecord, now: DateTime<Utc>, idle: Duration) -> bool {
    let oldest = record.rx.last_change_at.min(record.tx.last_change_at);
    let idle = chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now - oldest <= idle
}

/// The reconciliation job.
pub struct DeviceReconciler {
    config: ReconcileConfig,
    system: Arc<dyn SystemDevices>,
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    system_orphans: FailureCounters,
    store_orphans: FailureCounters,
}

impl DeviceReconciler {
    /// Create a reconciler.
    pub fn new(
        config: ReconcileConfig,
        system: Arc<dyn SystemDevices>,
        store: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            system,
            store,
            clock,
            system_orphans: FailureCounters::default(),
            store_orphans: FailureCounters::default(),
        }
    }

    /// Orphan counts for system devices lacking a record.
    pub fn system_orphans(&self) -> &FailureCounters {
        &self.system_orphans
    }

    /// Orphan counts for records lacking a system device.
    pub fn store_orphans(&self) -> &FailureCounters {
        &self.store_orphans
    }

    /// Run one round.
    ///
    /// # Errors
    /// Fails only when the snapshot or the record listing cannot be read.
    /// Per-device failures are logged and the round carries on.
    pub async fn reconcile_once(&mut self) -> Result<ReconcileReport, GatesyncError> {
        let now = self.clock.now_utc();
        let mut report = ReconcileReport::default();

        // 1. Snapshot both sides
        let snapshot = self.system.snapshot().await?;
        let (sessions, links) = self.split_snapshot(snapshot);
        report.system_devices = sessions.len();

        let records = self.store.list_devices().await?;
        let record_names: HashSet<String> = records.iter().map(|r| r.name.clone()).collect();

        // 2. Pass A: system devices without a record
        let system_orphans: HashSet<String> = sessions
            .keys()
            .filter(|name| !record_names.contains(*name))
            .cloned()
            .collect();
        self.system_orphans.record_round(&system_orphans);
        for name in self.system_orphans.at_limit(self.config.system_failure_limit) {
            warn!(device = %name, failures = self.system_orphans.get(&name), "killing device without record");
            match self.system.kill_device(&name).await {
                Ok(()) => {
                    self.system_orphans.remove(&name);
                    report.killed.push(name);
                }
                Err(e) => warn!(device = %name, error = %e, "kill failed, retrying next round"),
            }
        }

        // 3. Pass B: records without a system device
        let store_orphans: HashSet<String> = record_names
            .iter()
            .filter(|name| !sessions.contains_key(*name))
            .cloned()
            .collect();
        self.store_orphans.record_round(&store_orphans);
        for name in self.store_orphans.at_limit(self.config.store_failure_limit) {
            warn!(device = %name, failures = self.store_orphans.get(&name), "deleting record without device");
            match self.store.delete_device(&name).await {
                Ok(()) => {
                    self.store_orphans.remove(&name);
                    // A lingering pppd may still own the vanished device.
                    if let Err(e) = self.system.kill_device(&name).await {
                        debug!(device = %name, error = %e, "cleanup kill found nothing to kill");
                    }
                    report.deleted.push(name);
                }
                Err(e) => warn!(device = %name, error = %e, "record delete failed, retrying next round"),
            }
        }

        // 4. Counters and liveness for the remaining records. Each change is
        // applied to the record as stored now, so records deleted or edited
        // while this round awaited the system are not written back.
        let idle = self.config.idle_interval;
        for name in records.iter().map(|r| &r.name) {
            if report.deleted.contains(name) {
                continue;
            }
            let device = sessions.get(name);
            let mut transition = None;
            let updated = self
                .store
                .update_device(name, &mut |record| {
                    if let Some(device) = device {
                        apply_sample(record, device, now);
                    }
                    let alive = is_alive(record, now, idle);
                    if alive != record.active {
                        record.active = alive;
                        transition = Some(alive);
                    }
                })
                .await;

            match updated {
                Ok(Some(_)) => {
                    if device.is_some() {
                        report.updated += 1;
                    } else {
                        debug!(device = %name, "record not matched this round");
                    }
                    match transition {
                        Some(true) => {
                            info!(device = %name, "device became active");
                            report.became_active.push(name.clone());
                        }
                        Some(false) => {
                            info!(device = %name, "device became inactive");
                            report.became_inactive.push(name.clone());
                        }
                        None => {}
                    }
                }
                Ok(None) => debug!(device = %name, "record removed during round"),
                Err(e) => warn!(device = %name, error = %e, "failed to update device record"),
            }
        }
        report.records = record_names.len() - report.deleted.len();

        // 5. Public and private links
        for (role, device) in links {
            if let Err(e) = self.update_link(role, &device, now).await {
                warn!(link = %device.name, role = ?role, error = %e, "failed to update link record");
            }
        }

        debug!(
            killed = report.killed.len(),
            deleted = report.deleted.len(),
            updated = report.updated,
            "reconcile round done"
        );
        Ok(report)
    }

    fn split_snapshot(
        &self,
        snapshot: Vec<SystemDevice>,
    ) -> (HashMap<String, SystemDevice>, Vec<(LinkRole, SystemDevice)>) {
        let mut sessions = HashMap::new();
        let mut links = Vec::new();
        for device in snapshot {
            if self.config.public_interface.as_deref() == Some(device.name.as_str()) {
                links.push((LinkRole::Public, device));
            } else if self.config.private_interface.as_deref() == Some(device.name.as_str()) {
                links.push((LinkRole::Private, device));
            } else if is_session_device(&device.name, &self.config.session_device_prefix) {
                sessions.insert(device.name.clone(), device);
            }
        }
        (sessions, links)
    }

    async fn update_link(
        &self,
        role: LinkRole,
        device: &SystemDevice,
        now: DateTime<Utc>,
    ) -> Result<(), GatesyncError> {
        let mut link = match self.store.get_link(role).await? {
            Some(link) if link.name == device.name => link,
            Some(_) | None => {
                info!(link = %device.name, role = ?role, "tracking new link");
                let mut link = LinkRecord::new(role, device.name.clone(), now);
                // First sample only sets the baseline.
                link.rx.bytes = device.rx_bytes.unwrap_or(0);
                link.rx.packets = device.rx_packets.unwrap_or(0);
                link.tx.bytes = device.tx_bytes.unwrap_or(0);
                link.tx.packets = device.tx_packets.unwrap_or(0);
                link.mtu = device.mtu;
                link.mac = device.mac.clone();
                return self.store.put_link(&link).await;
            }
        };

        link.rx
            .observe_interval(device.rx_bytes, device.rx_packets, now);
        link.tx
            .observe_interval(device.tx_bytes, device.tx_packets, now);
        if device.mtu.is_some() {
            link.mtu = device.mtu;
        }
        if device.mac.is_some() {
            link.mac = device.mac.clone();
        }
        self.store.put_link(&link).await
    }

    /// Run rounds on a fixed tick until the task is aborted.
    ///
    /// Rounds never overlap; ticks missed while a slow round runs are
    /// skipped. A failed round is logged and the loop carries on.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_secs = self.config.tick.as_secs(), "device reconciler started");
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile_once().await {
                    warn!(error = %e, "reconcile round failed");
                }
            }
        })
    }
}

fn apply_sample(record: &mut DeviceRecord, device: &SystemDevice, now: DateTime<Utc>) {
    record.rx.observe(device.rx_bytes, device.rx_packets, now);
    record.tx.observe(device.tx_bytes, device.tx_packets, now);
    if device.mtu.is_some() {
        record.mtu = device.mtu;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::devices::records::{ConnectionType, MemoryDeviceStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSystem {
        devices: Mutex<Vec<SystemDevice>>,
        killed: Mutex<Vec<String>>,
    }

    impl FakeSystem {
        fn set(&self, devices: Vec<SystemDevice>) {
            *self.devices.lock().unwrap() = devices;
        }

        fn killed(&self) -> Vec<String> {
            self.killed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SystemDevices for FakeSystem {
        async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError> {
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn kill_device(&self, name: &str) -> Result<(), GatesyncError> {
            self.killed.lock().unwrap().push(name.to_string());
            let mut devices = self.devices.lock().unwrap();
            devices.retain(|d| d.name != name);
            Ok(())
        }
    }

    fn dev(name: &str, rx: u64, tx: u64) -> SystemDevice {
        SystemDevice {
            name: name.to_string(),
            rx_bytes: Some(rx),
            rx_packets: Some(rx / 100),
            tx_bytes: Some(tx),
            tx_packets: Some(tx / 100),
            mtu: Some(1400),
            mac: None,
            link_type: Some("ppp".to_string()),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    struct Harness {
        system: Arc<FakeSystem>,
        store: Arc<MemoryDeviceStore>,
        clock: Arc<MockClock>,
        reconciler: DeviceReconciler,
    }

    fn harness(config: ReconcileConfig) -> Harness {
        let system = Arc::new(FakeSystem::default());
        let store = Arc::new(MemoryDeviceStore::new());
        let clock = Arc::new(MockClock::new(t0()));
        let reconciler = DeviceReconciler::new(config, system.clone(), store.clone(), clock.clone());
        Harness {
            system,
            store,
            clock,
            reconciler,
        }
    }

    #[test]
    fn test_failure_counters_rebuilt_each_round() {
        let mut counters = FailureCounters::default();
        let a: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        counters.record_round(&a);
        counters.record_round(&a);
        assert_eq!(counters.get("a"), 2);

        let only_b: HashSet<String> = ["b".to_string()].into();
        counters.record_round(&only_b);
        assert_eq!(counters.get("a"), 0);
        assert_eq!(counters.get("b"), 3);
        assert_eq!(counters.at_limit(3), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_unrecorded_device_killed_after_limit() {
        let mut h = harness(ReconcileConfig::default());
        h.system.set(vec![dev("l2tp0-1", 0, 0)]);

        h.reconciler.reconcile_once().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.system.killed().is_empty());
        assert_eq!(h.reconciler.system_orphans().get("l2tp0-1"), 2);

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.killed, vec!["l2tp0-1".to_string()]);
        assert_eq!(h.system.killed(), vec!["l2tp0-1".to_string()]);
        assert!(h.reconciler.system_orphans().is_empty());
    }

    #[tokio::test]
    async fn test_record_appearing_resets_counter() {
        let mut h = harness(ReconcileConfig::default());
        h.system.set(vec![dev("l2tp0-1", 0, 0)]);
        h.reconciler.reconcile_once().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store
            .put_device(&DeviceRecord::new("l2tp0-1", ConnectionType::RemoteAccess, false, t0()))
            .await
            .unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.system.killed().is_empty());
        assert_eq!(h.reconciler.system_orphans().get("l2tp0-1"), 0);
    }

    #[tokio::test]
    async fn test_stale_record_deleted_after_limit() {
        let mut h = harness(ReconcileConfig::default());
        h.store
            .put_device(&DeviceRecord::new("l2tp0-9", ConnectionType::SiteToSiteClient, false, t0()))
            .await
            .unwrap();

        h.reconciler.reconcile_once().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.store.get_device("l2tp0-9").await.unwrap().is_some());

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.deleted, vec!["l2tp0-9".to_string()]);
        assert!(h.store.get_device("l2tp0-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_reappearing_clears_record_orphan() {
        let mut h = harness(ReconcileConfig::default());
        h.store
            .put_device(&DeviceRecord::new("l2tp0-9", ConnectionType::RemoteAccess, false, t0()))
            .await
            .unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.system.set(vec![dev("l2tp0-9", 10, 10)]);
        h.reconciler.reconcile_once().await.unwrap();
        h.system.set(vec![]);
        h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(h.reconciler.store_orphans().get("l2tp0-9"), 1);
        assert!(h.store.get_device("l2tp0-9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counters_and_liveness() {
        let mut h = harness(ReconcileConfig::default());
        h.store
            .put_device(&DeviceRecord::new("l2tp0-1", ConnectionType::RemoteAccess, false, t0()))
            .await
            .unwrap();
        h.system.set(vec![dev("l2tp0-1", 1000, 2000)]);

        h.clock.advance(chrono::Duration::minutes(1));
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.updated, 1);
        let record = h.store.get_device("l2tp0-1").await.unwrap().unwrap();
        assert_eq!(record.rx.bytes, 1000);
        assert_eq!(record.tx.bytes, 2000);
        assert_eq!(record.rx.last_change_at, t0() + chrono::Duration::minutes(1));
        assert_eq!(record.mtu, Some(1400));
        assert!(record.active);

        // rx keeps flowing, tx goes quiet
        for minute in 2..=32 {
            h.clock.set(t0() + chrono::Duration::minutes(minute));
            h.system.set(vec![dev("l2tp0-1", 1000 + minute as u64 * 10, 2000)]);
            h.reconciler.reconcile_once().await.unwrap();
        }
        let record = h.store.get_device("l2tp0-1").await.unwrap().unwrap();
        assert_eq!(record.tx.last_change_at, t0() + chrono::Duration::minutes(1));
        assert!(!record.active);
    }

    #[tokio::test]
    async fn test_wrapped_sample_extends_counter() {
        let mut h = harness(ReconcileConfig::default());
        let mut record = DeviceRecord::new("l2tp0-1", ConnectionType::RemoteAccess, false, t0());
        record.rx.bytes = (1u64 << 32) - 10;
        h.store.put_device(&record).await.unwrap();
        h.system.set(vec![dev("l2tp0-1", 90, 0)]);

        h.reconciler.reconcile_once().await.unwrap();
        let record = h.store.get_device("l2tp0-1").await.unwrap().unwrap();
        assert_eq!(record.rx.bytes, (1u64 << 32) + 90);
    }

    /// Kernel whose kill primitive races an ip-down handler on the store.
    struct RacingSystem {
        devices: Vec<SystemDevice>,
        store: Arc<MemoryDeviceStore>,
    }

    #[async_trait]
    impl SystemDevices for RacingSystem {
        async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError> {
            Ok(self.devices.clone())
        }

        async fn kill_device(&self, _name: &str) -> Result<(), GatesyncError> {
            self.store.delete_device("l2tp0-1").await?;
            self.store
                .update_device("l2tp0-3", &mut |r| r.restricted = true)
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_round_keeps_store_changes_made_during_kill() {
        let store = Arc::new(MemoryDeviceStore::new());
        for name in ["l2tp0-1", "l2tp0-3"] {
            store
                .put_device(&DeviceRecord::new(name, ConnectionType::RemoteAccess, false, t0()))
                .await
                .unwrap();
        }
        let system = Arc::new(RacingSystem {
            devices: vec![
                dev("l2tp0-1", 100, 100),
                dev("l2tp0-2", 0, 0),
                dev("l2tp0-3", 500, 700),
            ],
            store: store.clone(),
        });
        let clock = Arc::new(MockClock::new(t0()));
        let mut reconciler =
            DeviceReconciler::new(ReconcileConfig::default(), system, store.clone(), clock);

        reconciler.reconcile_once().await.unwrap();
        reconciler.reconcile_once().await.unwrap();
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.killed, vec!["l2tp0-2".to_string()]);

        assert!(store.get_device("l2tp0-1").await.unwrap().is_none());
        let survivor = store.get_device("l2tp0-3").await.unwrap().unwrap();
        assert!(survivor.restricted);
        assert_eq!(survivor.rx.bytes, 500);
        assert_eq!(survivor.tx.bytes, 700);
    }

    #[test]
    fn test_liveness_uses_older_direction() {
        let now = t0();
        let mut record = DeviceRecord::new("l2tp0-1", ConnectionType::RemoteAccess, false, now);
        record.rx.last_change_at = now - chrono::Duration::minutes(29);
        record.tx.last_change_at = now - chrono::Duration::minutes(1);
        assert!(is_alive(&record, now, Duration::from_secs(30 * 60)));

        record.rx.last_change_at = now - chrono::Duration::minutes(31);
        record.tx.last_change_at = now - chrono::Duration::minutes(31);
        assert!(!is_alive(&record, now, Duration::from_secs(30 * 60)));

        record.rx.last_change_at = now - chrono::Duration::minutes(30);
        record.tx.last_change_at = now;
        assert!(is_alive(&record, now, Duration::from_secs(30 * 60)));
    }

    #[tokio::test]
    async fn test_links_tracked_and_never_evicted() {
        let mut config = ReconcileConfig::default();
        config.public_interface = Some("eth0".to_string());
        config.private_interface = Some("eth1".to_string());
        let mut h = harness(config);

        let mut eth0 = dev("eth0", 1000, 1000);
        eth0.mac = Some("52:54:00:12:34:56".to_string());
        h.system.set(vec![eth0.clone(), dev("eth1", 0, 0)]);
        h.reconciler.reconcile_once().await.unwrap();

        let public = h.store.get_link(LinkRole::Public).await.unwrap().unwrap();
        assert_eq!(public.rx.bytes, 1000);
        assert_eq!(public.rx.rate_current, 0.0);

        h.clock.advance(chrono::Duration::seconds(10));
        eth0.rx_bytes = Some(3000);
        h.system.set(vec![eth0]);
        for _ in 0..5 {
            h.reconciler.reconcile_once().await.unwrap();
        }
        let public = h.store.get_link(LinkRole::Public).await.unwrap().unwrap();
        assert_eq!(public.rx.bytes, 3000);
        assert_eq!(public.rx.rate_maximum, 200.0);
        assert!(h.store.get_link(LinkRole::Private).await.unwrap().is_some());
        assert!(h.system.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_runs_rounds() {
        let h = harness(ReconcileConfig::default());
        h.system.set(vec![dev("l2tp0-1", 0, 0)]);
        let system = h.system.clone();
        let handle = h.reconciler.spawn();

        // first tick fires immediately, two more after 60s each
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(system.killed(), vec!["l2tp0-1".to_string()]);
        handle.abort();
    }
}
