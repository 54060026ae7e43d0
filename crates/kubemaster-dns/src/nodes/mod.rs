//! Control-plane node tracking
//!
//! Watches nodes matching a label selector and keeps the sorted set of ready
//! addresses the DNS records are built from.

mod health;
mod source;
mod watcher;

pub use health::WatcherHealth;
pub use source::{KubeNodeSource, NodeEvent, NodeEventStream, NodeInfo, NodeSource, SourceError};
pub use watcher::{NodeWatcher, WatchError};
