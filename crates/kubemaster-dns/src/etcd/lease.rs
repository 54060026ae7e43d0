//! Lease management
//!
//! Publishes a set of entries under a single etcd lease and keeps that lease
//! alive in a background task. The task reports loss of the lease through a
//! `RenewalInterrupt` exactly once; a deliberate stop (cancellation, a newer
//! lease, explicit revoke) ends the task silently.

use super::store::{CoordinationStore, KeepAliveStream, LeaseId, StoreError};
use crate::entries::Entry;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),
    #[error("no lease has been started")]
    NotStarted,
    #[error("lease operation cancelled")]
    Cancelled,
}

/// TTL arithmetic for a requested lease duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// TTL requested from the store (seconds)
    pub effective_ttl: i64,
    /// Period of the renewal liveness check (seconds)
    pub renew_interval: i64,
}

impl LeaseTiming {
    /// TTLs of 3s or less collapse to a 1s lease checked every second.
    pub fn from_requested(requested_ttl: i64) -> Self {
        if requested_ttl > 3 {
            Self {
                effective_ttl: requested_ttl,
                renew_interval: requested_ttl / 2,
            }
        } else {
            Self {
                effective_ttl: 1,
                renew_interval: 1,
            }
        }
    }

    fn check_period(&self) -> Duration {
        Duration::from_secs(self.renew_interval as u64)
    }

    fn stall_after(&self) -> Duration {
        Duration::from_secs(self.effective_ttl as u64)
    }
}

/// Fires once when renewal of a lease is lost.
///
/// Cloneable; every clone observes the same signal. If the renewal task is
/// stopped deliberately the signal never fires.
#[derive(Debug, Clone)]
pub struct RenewalInterrupt {
    rx: watch::Receiver<bool>,
}

impl RenewalInterrupt {
    pub(crate) fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Resolves when renewal was lost; pends forever otherwise.
    pub async fn interrupted(&mut self) {
        let stopped = self.rx.wait_for(|lost| *lost).await.is_err();
        if stopped {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }
}

/// State of the lease currently held.
#[derive(Debug, Clone)]
pub struct LeaseState {
    pub lease_id: LeaseId,
    pub timing: LeaseTiming,
    pub entries: Vec<Entry>,
}

struct Renewal {
    interrupt: RenewalInterrupt,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Renewal {
    fn stop(self) {
        self.stop.cancel();
        drop(self.handle);
    }
}

/// Owns the lease handle and its renewal task.
pub struct LeaseManager<S> {
    store: Arc<S>,
    current: Option<LeaseState>,
    renewal: Option<Renewal>,
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, LeaseError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(LeaseError::Cancelled),
        res = fut => res.map_err(LeaseError::from),
    }
}

impl<S: CoordinationStore + 'static> LeaseManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            current: None,
            renewal: None,
        }
    }

    /// The lease currently held, if any.
    pub fn current(&self) -> Option<&LeaseState> {
        self.current.as_ref()
    }

    /// Grant a lease, write every entry bound to it and start renewal.
    ///
    /// Any previous lease stops being renewed and is left to expire. If a
    /// write fails the error is returned and renewal is not started.
    pub async fn start_lease(
        &mut self,
        cancel: &CancellationToken,
        entries: Vec<Entry>,
        requested_ttl: i64,
    ) -> Result<(), LeaseError> {
        self.release();

        let timing = LeaseTiming::from_requested(requested_ttl);
        let lease_id = until_cancelled(cancel, self.store.create_lease(timing.effective_ttl)).await?;
        debug!(lease_id = lease_id, ttl = timing.effective_ttl, "Lease granted");

        for entry in &entries {
            if let Err(e) = until_cancelled(
                cancel,
                self.store.put_with_lease(&entry.key, &entry.value, lease_id),
            )
            .await
            {
                warn!(lease_id = lease_id, key = %entry.key, error = %e, "Failed to write entry");
                return Err(e);
            }
        }

        let count = entries.len();
        self.current = Some(LeaseState {
            lease_id,
            timing,
            entries,
        });

        self.renew_lease(cancel).await?;
        info!(lease_id = lease_id, entries = count, ttl = timing.effective_ttl, "Lease started");
        Ok(())
    }

    /// Open the keep-alive stream for the current lease and spawn the task
    /// that watches it.
    pub async fn renew_lease(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<RenewalInterrupt, LeaseError> {
        let state = self.current.as_ref().ok_or(LeaseError::NotStarted)?;
        let lease_id = state.lease_id;
        let timing = state.timing;

        if let Some(previous) = self.renewal.take() {
            previous.stop();
        }

        let acks = until_cancelled(
            cancel,
            self.store.open_keep_alive(lease_id, timing.effective_ttl),
        )
        .await?;

        let (tx, interrupt) = RenewalInterrupt::channel();
        let stop = cancel.child_token();
        let handle = tokio::spawn(run_renewal(lease_id, timing, acks, stop.clone(), tx));

        self.renewal = Some(Renewal {
            interrupt: interrupt.clone(),
            stop,
            handle,
        });
        Ok(interrupt)
    }

    /// Signal for the most recent successful renewal.
    pub fn renewal_interrupt(&self) -> Result<RenewalInterrupt, LeaseError> {
        self.renewal
            .as_ref()
            .map(|r| r.interrupt.clone())
            .ok_or(LeaseError::NotStarted)
    }

    /// Revoke the current lease, deleting its entries from the store.
    pub async fn revoke_lease(&mut self, cancel: &CancellationToken) -> Result<(), LeaseError> {
        let state = self.current.take().ok_or(LeaseError::NotStarted)?;
        if let Some(renewal) = self.renewal.take() {
            renewal.stop();
        }

        until_cancelled(cancel, self.store.revoke_lease(state.lease_id)).await?;
        info!(lease_id = state.lease_id, "Lease revoked");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.stop();
        }
        if let Some(previous) = self.current.take() {
            debug!(lease_id = previous.lease_id, "Releasing previous lease to expire");
        }
    }
}

impl<S> Drop for LeaseManager<S> {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.stop();
        }
    }
}

/// Consume keep-alive acknowledgements until the lease is lost or the task
/// is stopped.
async fn run_renewal(
    lease_id: LeaseId,
    timing: LeaseTiming,
    mut acks: KeepAliveStream,
    stop: CancellationToken,
    interrupted: watch::Sender<bool>,
) {
    let period = timing.check_period();
    let mut check = tokio::time::interval_at(Instant::now() + period, period);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ack = Instant::now();

    let reason = loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!(lease_id = lease_id, "Renewal stopped");
                return;
            }

            ack = acks.next() => match ack {
                Some(ack) => {
                    trace!(lease_id = lease_id, ttl = ack.ttl, "Lease renewed");
                    last_ack = Instant::now();
                }
                None => break "keep-alive stream closed",
            },

            _ = check.tick() => {
                if last_ack.elapsed() > timing.stall_after() {
                    break "keep-alive stalled";
                }
            }
        }
    };

    warn!(lease_id = lease_id, reason = reason, "Lease renewal interrupted");
    interrupted.send_replace(true);
}
