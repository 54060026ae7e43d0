//! kubemaster-dns
//!
//! Publishes the addresses of ready Kubernetes control-plane nodes to etcd as
//! SkyDNS-style records, so a DNS server backed by the same etcd can resolve
//! one name to every live control-plane node.
//!
//! Records are bound to a lease that is kept alive while the process is
//! healthy. If the process dies the lease expires and the records go with it.

pub mod config;
pub mod controller;
pub mod entries;
pub mod etcd;
pub mod nodes;
pub mod version;

pub use config::{EtcdConfig, EtcdTlsConfig, ReconcileConfig, RetryPolicy, WatcherConfig};
pub use controller::{ReconciliationController, Termination};
pub use entries::{build_entries, Entry};
pub use etcd::{EtcdStore, LeaseManager};
pub use nodes::{KubeNodeSource, NodeWatcher};
