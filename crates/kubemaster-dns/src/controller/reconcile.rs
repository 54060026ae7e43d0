//! Reconciliation state machine
//!
//! Idle -> Leasing -> WaitingOnLease, with Retrying on failure and a
//! terminal Terminated state. The retry counter resets only after a lease
//! has been started successfully.

use super::{AddressSource, LeaseOps};
use crate::config::ReconcileConfig;
use crate::entries::{build_entries, Entry};
use crate::etcd::LeaseError;
use crate::nodes::WatchError;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Why the controller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Shutdown requested
    Cancelled,
    /// The node watcher gave up
    WatcherFailed,
    /// Too many consecutive failed passes
    RetriesExhausted,
}

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// Fetching addresses and building entries
    Idle,
    /// Publishing entries under a new lease
    Leasing,
    /// Lease is live; waiting for something to change
    WaitingOnLease,
    /// A pass failed; backing off before the next one
    Retrying,
    /// Loop has exited
    Terminated(Termination),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("change signal receiver was already taken")]
    ChangeSignalTaken,
    #[error("fatal signal receiver was already taken")]
    FatalSignalTaken,
    #[error("lease started without a renewal signal: {0}")]
    MissingRenewal(#[source] LeaseError),
}

/// Keeps the published DNS entries in line with the address source.
pub struct ReconciliationController<A, L> {
    config: ReconcileConfig,
    source: A,
    lease: L,
    state: ReconcileState,
    retry_count: u32,
    backoff: ExponentialBackoff,
    pending: Vec<Entry>,
}

impl<A: AddressSource, L: LeaseOps> ReconciliationController<A, L> {
    pub fn new(config: ReconcileConfig, source: A, lease: L) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: config.retry.backoff_initial,
            max_interval: config.retry.backoff_max,
            multiplier: config.retry.backoff_multiplier,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        Self {
            config,
            source,
            lease,
            state: ReconcileState::Idle,
            retry_count: 0,
            backoff,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Lease collaborator, e.g. for a final revoke after shutdown.
    pub fn lease_mut(&mut self) -> &mut L {
        &mut self.lease
    }

    /// Start the address source and run until terminated.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Termination, ControllerError> {
        let mut changes = self
            .source
            .take_change_signal()
            .ok_or(ControllerError::ChangeSignalTaken)?;
        let mut fatal = self
            .source
            .take_fatal_signal()
            .ok_or(ControllerError::FatalSignalTaken)?
            .fuse();

        info!(domain = %self.config.domain_name, root = %self.config.root_path, "Controller started");

        if let Err(e) = self.source.start(cancel).await {
            let reason = match e {
                WatchError::Cancelled => Termination::Cancelled,
                _ => {
                    error!(error = %e, "Address source failed to start");
                    Termination::WatcherFailed
                }
            };
            self.state = ReconcileState::Terminated(reason);
            return Ok(reason);
        }

        loop {
            let next = match self.state {
                ReconcileState::Idle => {
                    // Anything queued so far is covered by the fetch below.
                    while changes.try_recv().is_ok() {}
                    self.idle(cancel).await
                }
                ReconcileState::Leasing => self.leasing(cancel).await,
                ReconcileState::WaitingOnLease => {
                    let mut interrupt = self
                        .lease
                        .renewal_interrupt()
                        .map_err(ControllerError::MissingRenewal)?;

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            info!("Cancelling controller work");
                            ReconcileState::Terminated(Termination::Cancelled)
                        }

                        Ok(()) = &mut fatal => {
                            error!("Node watcher failed, stopping controller");
                            ReconcileState::Terminated(Termination::WatcherFailed)
                        }

                        _ = interrupt.interrupted() => {
                            info!("Lease renewal interrupted, republishing");
                            ReconcileState::Idle
                        }

                        Some(()) = changes.recv() => {
                            info!("Control-plane addresses changed, revoking lease");
                            if let Err(e) = self.lease.revoke_lease(cancel).await {
                                warn!(error = %e, "Failed to revoke lease");
                                self.retry_count += 1;
                            }
                            ReconcileState::Idle
                        }
                    }
                }
                ReconcileState::Retrying => self.retrying(cancel).await,
                ReconcileState::Terminated(reason) => {
                    info!(reason = ?reason, "Controller terminated");
                    return Ok(reason);
                }
            };

            debug!(from = ?self.state, to = ?next, "Controller transition");
            self.state = next;
        }
    }

    #[instrument(skip_all, fields(domain = %self.config.domain_name))]
    async fn idle(&mut self, cancel: &CancellationToken) -> ReconcileState {
        if cancel.is_cancelled() {
            return ReconcileState::Terminated(Termination::Cancelled);
        }

        let addresses = tokio::select! {
            _ = cancel.cancelled() => return ReconcileState::Terminated(Termination::Cancelled),
            res = self.source.host_ips() => res,
        };

        let addresses = match addresses {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "Failed to read control-plane addresses");
                self.retry_count += 1;
                return ReconcileState::Retrying;
            }
        };

        match build_entries(
            &self.config.root_path,
            &self.config.domain_name,
            self.config.dns_ttl,
            &addresses,
        ) {
            Ok(entries) => {
                debug!(addresses = ?addresses, "Built DNS entries");
                self.pending = entries;
                ReconcileState::Leasing
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode DNS entries");
                self.retry_count += 1;
                ReconcileState::Retrying
            }
        }
    }

    async fn leasing(&mut self, cancel: &CancellationToken) -> ReconcileState {
        let entries = std::mem::take(&mut self.pending);
        let count = entries.len();

        match self
            .lease
            .start_lease(cancel, entries, self.config.dns_ttl)
            .await
        {
            Ok(()) => {
                info!(entries = count, "Published DNS entries");
                self.retry_count = 0;
                self.backoff.reset();
                ReconcileState::WaitingOnLease
            }
            Err(LeaseError::Cancelled) => ReconcileState::Terminated(Termination::Cancelled),
            Err(e) => {
                warn!(error = %e, "Failed to start lease");
                self.retry_count += 1;
                ReconcileState::Retrying
            }
        }
    }

    async fn retrying(&mut self, cancel: &CancellationToken) -> ReconcileState {
        let max = self.config.retry.max_retries;
        if self.retry_count >= max {
            error!(retries = self.retry_count, "Retry limit reached, giving up");
            return ReconcileState::Terminated(Termination::RetriesExhausted);
        }

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.retry.backoff_max);
        debug!(attempt = self.retry_count, max = max, delay_ms = delay.as_millis() as u64, "Retrying");

        tokio::select! {
            _ = cancel.cancelled() => ReconcileState::Terminated(Termination::Cancelled),
            _ = tokio::time::sleep(delay) => ReconcileState::Idle,
        }
    }
}
