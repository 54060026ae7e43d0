//! Coordination store client
//!
//! `CoordinationStore` is the narrow surface the lease manager needs from
//! etcd. `EtcdStore` implements it over `etcd_client`.

use crate::config::{EtcdConfig, EtcdTlsConfig};
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, Identity, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    TlsOptions,
};
use futures::stream::{BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[cfg(test)]
use mockall::automock;

/// etcd lease identifier.
pub type LeaseId = i64;

/// Acknowledgement of one keep-alive round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    /// Remaining TTL reported by the store
    pub ttl: i64,
}

/// Stream of keep-alive acknowledgements. It ends once the lease can no
/// longer be renewed (expired, revoked elsewhere, connection lost).
pub type KeepAliveStream = BoxStream<'static, KeepAliveAck>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("failed to read {path}: {source}")]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// Lease operations on the coordination store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease of `ttl` seconds.
    async fn create_lease(&self, ttl: i64) -> Result<LeaseId, StoreError>;

    /// Write `key` bound to `lease`.
    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId)
        -> Result<(), StoreError>;

    /// Start renewing `lease` continuously.
    async fn open_keep_alive(&self, lease: LeaseId, ttl: i64)
        -> Result<KeepAliveStream, StoreError>;

    /// Revoke `lease`; the store deletes every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;
}

/// etcd-backed coordination store.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, StoreError> {
        let options = match &config.tls {
            Some(tls) => Some(ConnectOptions::new().with_tls(tls_options(tls).await?)),
            None => None,
        };

        let client = Client::connect(&config.endpoints, options).await?;
        debug!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, StoreError> {
    tokio::fs::read(path).await.map_err(|source| StoreError::Tls {
        path: path.to_path_buf(),
        source,
    })
}

async fn tls_options(tls: &EtcdTlsConfig) -> Result<TlsOptions, StoreError> {
    let mut options = TlsOptions::new();

    if let Some(ca) = &tls.ca_cert {
        options = options.ca_certificate(Certificate::from_pem(read_pem(ca).await?));
    }

    if let Some((cert, key)) = &tls.identity {
        let cert = read_pem(cert).await?;
        let key = read_pem(key).await?;
        options = options.identity(Identity::from_pem(cert, key));
    }

    Ok(options)
}

/// Keep-alive requests go out three times per TTL so a single lost round trip
/// does not let the lease lapse.
fn keep_alive_period(ttl: i64) -> Duration {
    let millis = ttl.max(1) as u64 * 1000 / 3;
    Duration::from_millis(millis.max(250))
}

struct KeepAliveState {
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
    ticker: tokio::time::Interval,
    lease_id: LeaseId,
}

async fn next_ack(mut state: KeepAliveState) -> Option<(KeepAliveAck, KeepAliveState)> {
    state.ticker.tick().await;

    if let Err(e) = state.keeper.keep_alive().await {
        warn!(lease_id = state.lease_id, error = %e, "Keep-alive send failed");
        return None;
    }

    match state.responses.message().await {
        Ok(Some(resp)) if resp.ttl() > 0 => {
            trace!(lease_id = state.lease_id, ttl = resp.ttl(), "Keep-alive OK");
            Some((KeepAliveAck { ttl: resp.ttl() }, state))
        }
        Ok(Some(_)) => {
            warn!(lease_id = state.lease_id, "Lease expired or revoked");
            None
        }
        Ok(None) => {
            warn!(lease_id = state.lease_id, "Keep-alive stream closed");
            None
        }
        Err(e) => {
            warn!(lease_id = state.lease_id, error = %e, "Keep-alive failed");
            None
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn create_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease);
        client.put(key, value, Some(options)).await?;
        Ok(())
    }

    async fn open_keep_alive(
        &self,
        lease: LeaseId,
        ttl: i64,
    ) -> Result<KeepAliveStream, StoreError> {
        let mut client = self.client.clone();
        let (keeper, responses) = client.lease_keep_alive(lease).await?;

        let state = KeepAliveState {
            keeper,
            responses,
            ticker: tokio::time::interval(keep_alive_period(ttl)),
            lease_id: lease,
        };

        Ok(futures::stream::unfold(state, next_ack).boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_period() {
        assert_eq!(keep_alive_period(60), Duration::from_secs(20));
        assert_eq!(keep_alive_period(9), Duration::from_secs(3));
        assert_eq!(keep_alive_period(1), Duration::from_millis(333));
        assert_eq!(keep_alive_period(0), Duration::from_millis(333));
    }

    #[tokio::test]
    async fn test_missing_tls_file_is_reported() {
        let tls = EtcdTlsConfig {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            identity: None,
        };

        match tls_options(&tls).await {
            Err(StoreError::Tls { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/ca.pem"))
            }
            other => panic!("expected TLS read error, got {:?}", other.map(|_| ())),
        }
    }
}
