//! Node watcher
//!
//! Maintains the sorted set of ready control-plane addresses. Every event
//! recomputes the set from the local node cache; only a change in the
//! mutated node's own contribution (or a relist that alters the set) is
//! announced on the change channel. Three consecutive watch errors trip the
//! breaker: the fatal channel fires once and processing stops for good.

use super::health::WatcherHealth;
use super::source::{NodeEvent, NodeEventStream, NodeInfo, NodeSource, SourceError};
use crate::config::WatcherConfig;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("node addresses have not been synchronized yet")]
    NotSynced,
    #[error("node watch failed {errors} consecutive times")]
    Fatal { errors: u32 },
    #[error("node watch stream ended")]
    StreamEnded,
    #[error("node watcher already started")]
    AlreadyStarted,
    #[error("node watch cancelled")]
    Cancelled,
}

/// Nodes seen by the watch, keyed by name.
#[derive(Debug, Default)]
struct NodeCache {
    nodes: BTreeMap<String, NodeInfo>,
    /// Listing in progress, swapped in on `InitDone`
    relist: Option<BTreeMap<String, NodeInfo>>,
}

/// Result of folding one event into the watch state.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Updated { snapshot: Vec<String>, notify: bool },
    Fatal { errors: u32 },
}

/// Event-processing state owned by the watch task.
struct WatchState {
    address_type: String,
    cache: NodeCache,
    health: WatcherHealth,
    synced: bool,
    snapshot: Vec<String>,
}

impl WatchState {
    fn new(config: &WatcherConfig) -> Self {
        Self {
            address_type: config.address_type.clone(),
            cache: NodeCache::default(),
            health: WatcherHealth::new(config.error_threshold),
            synced: false,
            snapshot: Vec::new(),
        }
    }

    fn contribution(&self, node: Option<&NodeInfo>) -> Option<String> {
        node.and_then(|n| n.published_address(&self.address_type))
            .map(str::to_string)
    }

    fn recompute(&mut self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .cache
            .nodes
            .values()
            .filter_map(|node| node.published_address(&self.address_type))
            .map(str::to_string)
            .collect();
        addresses.sort();
        addresses.dedup();
        self.snapshot = addresses.clone();
        addresses
    }

    fn warn_if_unaddressable(&self, node: &NodeInfo) {
        if node.address(&self.address_type).is_none() {
            warn!(
                node = %node.name,
                address_type = %self.address_type,
                "Node has no address of the configured type, skipping"
            );
        }
    }

    fn on_event(&mut self, event: Result<NodeEvent, SourceError>) -> Outcome {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                let tripped = self.health.record_error();
                let errors = self.health.consecutive_errors();
                warn!(error = %e, consecutive_errors = errors, "Node watch error");
                return if tripped {
                    Outcome::Fatal { errors }
                } else {
                    Outcome::Unchanged
                };
            }
        };

        match event {
            NodeEvent::Init => {
                debug!("Node listing started");
                self.cache.relist = Some(BTreeMap::new());
                Outcome::Unchanged
            }
            NodeEvent::InitApply(node) => {
                self.warn_if_unaddressable(&node);
                self.cache
                    .relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(node.name.clone(), node);
                Outcome::Unchanged
            }
            NodeEvent::InitDone => {
                if let Some(listing) = self.cache.relist.take() {
                    self.cache.nodes = listing;
                }
                self.health.record_sync();

                let previous = std::mem::take(&mut self.snapshot);
                let snapshot = self.recompute();
                let notify = self.synced && previous != snapshot;
                self.synced = true;
                debug!(nodes = self.cache.nodes.len(), addresses = ?snapshot, "Node listing complete");
                Outcome::Updated { snapshot, notify }
            }
            NodeEvent::Apply(node) => {
                self.health.record_sync();
                self.warn_if_unaddressable(&node);

                let before = self.contribution(self.cache.nodes.get(&node.name));
                let after = self.contribution(Some(&node));
                debug!(node = %node.name, ready = node.ready, "Node applied");
                self.cache.nodes.insert(node.name.clone(), node);

                let snapshot = self.recompute();
                Outcome::Updated {
                    snapshot,
                    notify: self.synced && before != after,
                }
            }
            NodeEvent::Delete(node) => {
                self.health.record_sync();

                let removed = self.cache.nodes.remove(&node.name);
                let before = self.contribution(removed.as_ref());
                debug!(node = %node.name, "Node deleted");

                let snapshot = self.recompute();
                Outcome::Updated {
                    snapshot,
                    notify: self.synced && before.is_some(),
                }
            }
        }
    }
}

struct Inner {
    config: WatcherConfig,
    source: Arc<dyn NodeSource>,
    /// `None` until the first full listing completes
    snapshot: RwLock<Option<Vec<String>>>,
    changed_tx: mpsc::UnboundedSender<()>,
    changed_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    fatal_tx: Mutex<Option<oneshot::Sender<()>>>,
    fatal_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Watches control-plane nodes and publishes their ready addresses.
#[derive(Clone)]
pub struct NodeWatcher {
    inner: Arc<Inner>,
}

impl NodeWatcher {
    pub fn new(config: WatcherConfig, source: Arc<dyn NodeSource>) -> Self {
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();

        Self {
            inner: Arc::new(Inner {
                config,
                source,
                snapshot: RwLock::new(None),
                changed_tx,
                changed_rx: Mutex::new(Some(changed_rx)),
                fatal_tx: Mutex::new(Some(fatal_tx)),
                fatal_rx: Mutex::new(Some(fatal_rx)),
            }),
        }
    }

    /// Start watching. Returns once the first full listing has been applied;
    /// the returned task keeps processing events until `cancel` fires or the
    /// error threshold is reached.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<JoinHandle<()>, WatchError> {
        let fatal_tx = self
            .inner
            .fatal_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(WatchError::AlreadyStarted)?;

        info!(
            label_selector = %self.inner.config.label_selector,
            address_type = %self.inner.config.address_type,
            "Starting node watcher"
        );

        let mut events = self.inner.source.watch_nodes(&self.inner.config.label_selector);
        let mut state = WatchState::new(&self.inner.config);
        let mut fatal_tx = Some(fatal_tx);

        self.drive(&mut events, &mut state, &mut fatal_tx, cancel, true)
            .await?;
        info!(addresses = ?state.snapshot, "Node watcher synchronized");

        let watcher = self.clone();
        let cancel = cancel.clone();
        Ok(tokio::spawn(async move {
            match watcher
                .drive(&mut events, &mut state, &mut fatal_tx, &cancel, false)
                .await
            {
                Ok(()) | Err(WatchError::Cancelled) => info!("Node watcher stopped"),
                Err(e) => error!(error = %e, "Node watcher terminated"),
            }
        }))
    }

    /// Process events until cancelled or failed, or, with `until_synced`,
    /// until the first listing has been applied.
    async fn drive(
        &self,
        events: &mut NodeEventStream,
        state: &mut WatchState,
        fatal_tx: &mut Option<oneshot::Sender<()>>,
        cancel: &CancellationToken,
        until_synced: bool,
    ) -> Result<(), WatchError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                event = events.next() => event,
            };

            let Some(event) = event else {
                error!("Node watch stream ended");
                Self::signal_fatal(fatal_tx);
                return Err(WatchError::StreamEnded);
            };

            match state.on_event(event) {
                Outcome::Unchanged => {}
                Outcome::Updated { snapshot, notify } => {
                    *self.inner.snapshot.write().await = Some(snapshot);
                    // Lock released above, so readers woken by this signal
                    // see the new snapshot.
                    if notify {
                        info!(addresses = ?state.snapshot, "Control-plane address set changed");
                        let _ = self.inner.changed_tx.send(());
                    }
                    if until_synced && state.synced {
                        return Ok(());
                    }
                }
                Outcome::Fatal { errors } => {
                    error!(errors = errors, "Node watch error threshold reached, giving up");
                    Self::signal_fatal(fatal_tx);
                    return Err(WatchError::Fatal { errors });
                }
            }
        }
    }

    fn signal_fatal(fatal_tx: &mut Option<oneshot::Sender<()>>) {
        if let Some(tx) = fatal_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Current sorted address set.
    pub async fn host_ips(&self) -> Result<Vec<String>, WatchError> {
        self.inner
            .snapshot
            .read()
            .await
            .clone()
            .ok_or(WatchError::NotSynced)
    }

    /// Receiver for change notifications; available once.
    pub fn take_change_signal(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.inner
            .changed_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Receiver for the fatal notification; available once.
    pub fn take_fatal_signal(&self) -> Option<oneshot::Receiver<()>> {
        self.inner
            .fatal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}
