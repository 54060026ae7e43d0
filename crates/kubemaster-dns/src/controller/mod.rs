//! Reconciliation controller
//!
//! Drives the lease lifecycle from the node watcher's address set. The
//! controller only sees its collaborators through `AddressSource` and
//! `LeaseOps`, so either side can be replaced in tests.

mod reconcile;

pub use reconcile::{ControllerError, ReconcileState, ReconciliationController, Termination};

use crate::entries::Entry;
use crate::etcd::{CoordinationStore, LeaseError, LeaseManager, RenewalInterrupt};
use crate::nodes::{NodeWatcher, WatchError};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Supplies the current address set and its change/failure signals.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Begin watching; returns after the first full synchronization.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), WatchError>;

    /// Sorted address snapshot.
    async fn host_ips(&self) -> Result<Vec<String>, WatchError>;

    /// One message per material change. Can be taken once.
    fn take_change_signal(&self) -> Option<mpsc::UnboundedReceiver<()>>;

    /// Fires once when the source gives up. Can be taken once.
    fn take_fatal_signal(&self) -> Option<oneshot::Receiver<()>>;
}

/// Publishes entries under a renewable lease.
#[async_trait]
pub trait LeaseOps: Send {
    async fn start_lease(
        &mut self,
        cancel: &CancellationToken,
        entries: Vec<Entry>,
        requested_ttl: i64,
    ) -> Result<(), LeaseError>;

    /// Signal for the renewal started by the last successful `start_lease`.
    fn renewal_interrupt(&self) -> Result<RenewalInterrupt, LeaseError>;

    async fn revoke_lease(&mut self, cancel: &CancellationToken) -> Result<(), LeaseError>;
}

#[async_trait]
impl AddressSource for NodeWatcher {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), WatchError> {
        // The watch task observes `cancel` itself; no need to keep its handle.
        NodeWatcher::start(self, cancel).await.map(drop)
    }

    async fn host_ips(&self) -> Result<Vec<String>, WatchError> {
        NodeWatcher::host_ips(self).await
    }

    fn take_change_signal(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        NodeWatcher::take_change_signal(self)
    }

    fn take_fatal_signal(&self) -> Option<oneshot::Receiver<()>> {
        NodeWatcher::take_fatal_signal(self)
    }
}

#[async_trait]
impl<S: CoordinationStore + 'static> LeaseOps for LeaseManager<S> {
    async fn start_lease(
        &mut self,
        cancel: &CancellationToken,
        entries: Vec<Entry>,
        requested_ttl: i64,
    ) -> Result<(), LeaseError> {
        LeaseManager::start_lease(self, cancel, entries, requested_ttl).await
    }

    fn renewal_interrupt(&self) -> Result<RenewalInterrupt, LeaseError> {
        LeaseManager::renewal_interrupt(self)
    }

    async fn revoke_lease(&mut self, cancel: &CancellationToken) -> Result<(), LeaseError> {
        LeaseManager::revoke_lease(self, cancel).await
    }
}
