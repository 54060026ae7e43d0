//! Runtime configuration
//!
//! Every setting is carried in an explicit value built once by the binary and
//! handed to constructors. Defaults match the command-line defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Settings for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Root of the key space the DNS backend reads (e.g. `skydns`)
    pub root_path: String,

    /// Name the control-plane nodes are published under
    pub domain_name: String,

    /// TTL (seconds) written into every record and requested for the lease
    pub dns_ttl: i64,

    /// Retry bound and backoff between failed passes
    pub retry: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            root_path: "skydns".to_string(),
            domain_name: "kubemaster.local".to_string(),
            dns_ttl: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry policy for the controller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the controller gives up
    pub max_retries: u32,

    /// First delay after a failure
    pub backoff_initial: Duration,

    /// Ceiling for a single delay
    pub backoff_max: Duration,

    /// Growth factor between delays
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Settings for the node watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Label selector for control-plane nodes
    pub label_selector: String,

    /// Node address type to publish (`InternalIP`, `ExternalIP`, ...)
    pub address_type: String,

    /// Consecutive watch errors before the watcher gives up
    pub error_threshold: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            label_selector: "node-role.kubernetes.io/master=".to_string(),
            address_type: "InternalIP".to_string(),
            error_threshold: 3,
        }
    }
}

/// etcd connection settings.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub tls: Option<EtcdTlsConfig>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            tls: None,
        }
    }
}

/// PEM files for talking to a TLS-enabled etcd.
#[derive(Debug, Clone, Default)]
pub struct EtcdTlsConfig {
    /// CA bundle used to verify the server
    pub ca_cert: Option<PathBuf>,

    /// Client certificate and key, both required for mutual TLS
    pub identity: Option<(PathBuf, PathBuf)>,
}

/// Returns true if `name` is a fully qualified DNS name: at least two labels,
/// each 1-63 characters of ASCII alphanumerics or `-`, not starting or ending
/// with `-`. A single trailing dot is accepted.
pub fn is_qualified_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
