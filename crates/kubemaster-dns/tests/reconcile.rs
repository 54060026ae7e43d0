//! End-to-end reconciliation against an in-memory store and a scripted node
//! event stream.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kubemaster_dns::etcd::{CoordinationStore, KeepAliveAck, KeepAliveStream, LeaseId, StoreError};
use kubemaster_dns::nodes::{NodeEvent, NodeEventStream, NodeInfo, NodeSource, SourceError};
use kubemaster_dns::{
    LeaseManager, NodeWatcher, ReconcileConfig, ReconciliationController, Termination,
    WatcherConfig,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type EventTx = mpsc::UnboundedSender<Result<NodeEvent, SourceError>>;

#[derive(Default)]
struct MemoryState {
    next_lease: LeaseId,
    kv: BTreeMap<String, (String, LeaseId)>,
    keepers: BTreeMap<LeaseId, mpsc::UnboundedSender<KeepAliveAck>>,
    granted: Vec<(LeaseId, i64)>,
    revoked: Vec<LeaseId>,
}

/// Coordination store that keeps everything in a map.
#[derive(Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn records(&self) -> BTreeMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .kv
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    fn latest_lease(&self) -> Option<LeaseId> {
        self.state.lock().unwrap().granted.last().map(|(id, _)| *id)
    }

    fn grants(&self) -> usize {
        self.state.lock().unwrap().granted.len()
    }

    fn revoked(&self) -> Vec<LeaseId> {
        self.state.lock().unwrap().revoked.clone()
    }

    /// Simulate losing the keep-alive session of `lease`.
    fn drop_keep_alive(&self, lease: LeaseId) {
        self.state.lock().unwrap().keepers.remove(&lease);
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_lease += 1;
        let id = state.next_lease;
        state.granted.push((id, ttl));
        Ok(id)
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.kv.insert(key.to_string(), (value.to_string(), lease));
        Ok(())
    }

    async fn open_keep_alive(
        &self,
        lease: LeaseId,
        ttl: i64,
    ) -> Result<KeepAliveStream, StoreError> {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(KeepAliveAck { ttl })
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        self.state.lock().unwrap().keepers.insert(lease, tx);
        Ok(rx.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.kv.retain(|_, (_, owner)| *owner != lease);
        state.keepers.remove(&lease);
        state.revoked.push(lease);
        Ok(())
    }
}

struct ScriptedSource {
    events: Mutex<Option<NodeEventStream>>,
}

impl NodeSource for ScriptedSource {
    fn watch_nodes(&self, _label_selector: &str) -> NodeEventStream {
        self.events
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| futures::stream::pending().boxed())
    }
}

fn node(name: &str, ready: bool, ip: &str) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        ready,
        addresses: vec![
            ("Hostname".to_string(), name.to_string()),
            ("InternalIP".to_string(), ip.to_string()),
        ],
    }
}

fn listing(tx: &EventTx, nodes: Vec<NodeInfo>) {
    tx.unbounded_send(Ok(NodeEvent::Init)).unwrap();
    for n in nodes {
        tx.unbounded_send(Ok(NodeEvent::InitApply(n))).unwrap();
    }
    tx.unbounded_send(Ok(NodeEvent::InitDone)).unwrap();
}

fn record(ip: &str, ttl: i64) -> String {
    format!(r#"{{"host":"{}","ttl":{}}}"#, ip, ttl)
}

struct Running {
    store: Arc<MemoryStore>,
    events: EventTx,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Termination>,
}

fn start(config: ReconcileConfig) -> Running {
    let (events, rx) = mpsc::unbounded();
    let source = ScriptedSource {
        events: Mutex::new(Some(rx.boxed())),
    };
    let watcher = NodeWatcher::new(WatcherConfig::default(), Arc::new(source));

    let store = Arc::new(MemoryStore::default());
    let lease = LeaseManager::new(store.clone());
    let mut controller = ReconciliationController::new(config, watcher, lease);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { controller.run(&token).await.unwrap() });

    Running {
        store,
        events,
        cancel,
        handle,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn config(ttl: i64) -> ReconcileConfig {
    ReconcileConfig {
        dns_ttl: ttl,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_publishes_tracks_and_recovers() {
    let running = start(config(30));
    let store = running.store.clone();

    listing(
        &running.events,
        vec![
            node("cp-1", true, "10.0.0.2"),
            node("cp-2", true, "10.0.0.1"),
            node("cp-3", false, "10.0.0.9"),
        ],
    );

    let expected: BTreeMap<String, String> = [
        ("/skydns/local/kubemaster/x1".to_string(), record("10.0.0.1", 30)),
        ("/skydns/local/kubemaster/x2".to_string(), record("10.0.0.2", 30)),
    ]
    .into_iter()
    .collect();
    eventually("initial records", || store.records() == expected).await;
    assert_eq!(store.state.lock().unwrap().granted, vec![(1, 30)]);

    // A node becoming ready replaces the lease.
    running
        .events
        .unbounded_send(Ok(NodeEvent::Apply(node("cp-3", true, "10.0.0.9"))))
        .unwrap();
    eventually("second lease", || store.grants() == 2).await;
    eventually("third record", || store.records().len() == 3).await;
    assert_eq!(store.revoked(), vec![1]);
    assert_eq!(
        store.records().get("/skydns/local/kubemaster/x3"),
        Some(&record("10.0.0.9", 30))
    );

    // Losing the keep-alive republishes without a revoke.
    let lease = store.latest_lease().unwrap();
    store.drop_keep_alive(lease);
    eventually("third lease", || store.grants() == 3).await;
    assert_eq!(store.revoked(), vec![1]);

    running.cancel.cancel();
    assert_eq!(running.handle.await.unwrap(), Termination::Cancelled);
}

#[tokio::test]
async fn test_short_ttl_is_clamped() {
    let running = start(config(2));
    let store = running.store.clone();

    listing(&running.events, vec![node("cp-1", true, "10.0.0.1")]);
    eventually("records", || store.records().len() == 1).await;

    // The record keeps the configured TTL; only the lease is clamped.
    assert_eq!(store.state.lock().unwrap().granted[0], (1, 1));
    assert_eq!(
        store.records().get("/skydns/local/kubemaster/x1"),
        Some(&record("10.0.0.1", 2))
    );

    running.cancel.cancel();
    assert_eq!(running.handle.await.unwrap(), Termination::Cancelled);
}

#[tokio::test]
async fn test_watch_errors_stop_controller() {
    let running = start(config(30));
    let store = running.store.clone();

    listing(&running.events, vec![node("cp-1", true, "10.0.0.1")]);
    eventually("records", || store.records().len() == 1).await;

    for _ in 0..3 {
        running
            .events
            .unbounded_send(Err(SourceError::Unavailable("connection refused".to_string())))
            .unwrap();
    }

    let reason = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, Termination::WatcherFailed);
    assert!(store.revoked().is_empty());
}
