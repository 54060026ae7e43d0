//! DNS record entries
//!
//! Each ready control-plane address becomes one key under the reversed domain
//! path, e.g. `/skydns/local/kubemaster/x1`, which is the layout the CoreDNS
//! etcd plugin walks when resolving `kubemaster.local`.

use serde::Serialize;

/// A key/value pair bound to the current lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

/// Record body as read by the DNS backend. Field order is part of the format.
#[derive(Serialize)]
struct DnsRecord<'a> {
    host: &'a str,
    ttl: i64,
}

/// Key prefix for `domain_name` under `root_path`, without the `x<n>` suffix.
///
/// Surrounding slashes on the root and a trailing dot on the domain are
/// ignored, so `/skydns` and `skydns` produce the same keys.
pub fn domain_key_prefix(root_path: &str, domain_name: &str) -> String {
    let root = root_path.trim_matches('/');
    let domain = domain_name.strip_suffix('.').unwrap_or(domain_name);

    let mut labels: Vec<&str> = domain.split('.').collect();
    labels.reverse();

    format!("/{}/{}", root, labels.join("/"))
}

/// Build one entry per address. `addresses` must already be sorted so that
/// indices stay stable between passes.
pub fn build_entries(
    root_path: &str,
    domain_name: &str,
    ttl: i64,
    addresses: &[String],
) -> Result<Vec<Entry>, serde_json::Error> {
    let prefix = domain_key_prefix(root_path, domain_name);

    addresses
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let value = serde_json::to_string(&DnsRecord { host, ttl })?;
            Ok(Entry {
                key: format!("{}/x{}", prefix, i + 1),
                value,
            })
        })
        .collect()
}
