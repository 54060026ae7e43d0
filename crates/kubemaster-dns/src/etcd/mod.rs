//! etcd coordination
//!
//! Publishes the DNS entries under a renewable lease.

mod lease;
mod store;

pub use lease::{LeaseError, LeaseManager, LeaseState, LeaseTiming, RenewalInterrupt};
pub use store::{
    CoordinationStore, EtcdStore, KeepAliveAck, KeepAliveStream, LeaseId, StoreError,
};

#[cfg(test)]
pub use store::MockCoordinationStore;
