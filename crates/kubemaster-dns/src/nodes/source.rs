//! Node event source
//!
//! `NodeSource` yields list+watch events for nodes matching a label selector.
//! `KubeNodeSource` backs it with the kube-rs watcher, which relists on its
//! own after transient errors; those errors are still surfaced so the node
//! watcher can count them.

use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, ResourceExt,
};
use thiserror::Error;

/// The parts of a node the watcher cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// `Ready` condition is `True`
    pub ready: bool,
    /// `(type, address)` pairs, e.g. `("InternalIP", "10.0.0.1")`
    pub addresses: Vec<(String, String)>,
}

impl NodeInfo {
    /// First address of `address_type`.
    pub fn address(&self, address_type: &str) -> Option<&str> {
        self.addresses
            .iter()
            .find(|(kind, _)| kind == address_type)
            .map(|(_, addr)| addr.as_str())
    }

    /// Address this node contributes to the published set: present only
    /// when the node is ready and has an address of `address_type`.
    pub fn published_address(&self, address_type: &str) -> Option<&str> {
        if self.ready {
            self.address(address_type)
        } else {
            None
        }
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let status = node.status.as_ref();

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        let addresses = status
            .and_then(|s| s.addresses.as_ref())
            .map(|addresses| {
                addresses
                    .iter()
                    .map(|a| (a.type_.clone(), a.address.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: node.name_any(),
            ready,
            addresses,
        }
    }
}

/// List+watch event. A full listing is delivered as `Init`, any number of
/// `InitApply`, then `InitDone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Init,
    InitApply(NodeInfo),
    InitDone,
    Apply(NodeInfo),
    Delete(NodeInfo),
}

impl From<watcher::Event<Node>> for NodeEvent {
    fn from(event: watcher::Event<Node>) -> Self {
        match event {
            watcher::Event::Init => NodeEvent::Init,
            watcher::Event::InitApply(node) => NodeEvent::InitApply(NodeInfo::from(&node)),
            watcher::Event::InitDone => NodeEvent::InitDone,
            watcher::Event::Apply(node) => NodeEvent::Apply(NodeInfo::from(&node)),
            watcher::Event::Delete(node) => NodeEvent::Delete(NodeInfo::from(&node)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("node watch failed: {0}")]
    Watch(#[from] watcher::Error),
    #[error("node source unavailable: {0}")]
    Unavailable(String),
}

pub type NodeEventStream = BoxStream<'static, Result<NodeEvent, SourceError>>;

/// Cluster API access needed by the node watcher.
pub trait NodeSource: Send + Sync + 'static {
    fn watch_nodes(&self, label_selector: &str) -> NodeEventStream;
}

/// Watches nodes through the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeSource {
    client: Client,
}

impl KubeNodeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl NodeSource for KubeNodeSource {
    fn watch_nodes(&self, label_selector: &str) -> NodeEventStream {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(label_selector);

        watcher(nodes, config)
            .default_backoff()
            .map(|event| event.map(NodeEvent::from).map_err(SourceError::from))
            .boxed()
    }
}
