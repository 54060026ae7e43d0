//! kubemaster-dns
//!
//! Watches control-plane nodes and keeps their addresses published in etcd
//! for SkyDNS-style resolution.

use anyhow::{anyhow, bail, Context as _};
use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kubemaster_dns::{
    config::is_qualified_dns_name, version, EtcdConfig, EtcdStore, EtcdTlsConfig, KubeNodeSource,
    LeaseManager, NodeWatcher, ReconcileConfig, ReconciliationController, Termination,
    WatcherConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Upper bound for the revoke issued on shutdown.
const SHUTDOWN_REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "kubemaster-dns")]
#[command(about = "Publish Kubernetes control-plane node addresses to etcd for DNS")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch control-plane nodes and publish their addresses
    Run(RunArgs),
    /// Print build information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Root of the DNS key space in etcd
    #[arg(long = "rootpath", env = "ROOT_PATH", default_value = "skydns")]
    root_path: String,

    /// Name the control-plane nodes are published under
    #[arg(long = "domainname", env = "DOMAIN_NAME", default_value = "kubemaster.local")]
    domain_name: String,

    /// TTL in seconds for the records and their lease
    #[arg(long = "dns-ttl", env = "DNS_TTL", default_value_t = 10)]
    dns_ttl: i64,

    /// Label selector for control-plane nodes
    #[arg(
        long = "watchlabels",
        env = "WATCH_LABELS",
        default_value = "node-role.kubernetes.io/master="
    )]
    watch_labels: String,

    /// Node address type to publish
    #[arg(long = "address-type", env = "ADDRESS_TYPE", default_value = "InternalIP")]
    address_type: String,

    /// Kubeconfig file, defaults to $HOME/.kube/config
    #[arg(long = "kubeconfigpath", env = "KUBECONFIG_PATH")]
    kubeconfig_path: Option<PathBuf>,

    /// Use the kubeconfig file instead of in-cluster configuration
    #[arg(long = "usekubeconfig", env = "USE_KUBECONFIG")]
    use_kubeconfig: bool,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: String,

    /// CA bundle for verifying etcd
    #[arg(long = "cacerts", env = "ETCD_CA_CERTS")]
    ca_certs: Option<PathBuf>,

    /// Client certificate for etcd
    #[arg(long, env = "ETCD_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// Client key for etcd
    #[arg(long, env = "ETCD_KEY", requires = "cert")]
    key: Option<PathBuf>,
}

impl RunArgs {
    fn validate(&self) -> anyhow::Result<()> {
        if self.root_path.trim_matches('/').is_empty() {
            bail!("--rootpath must not be empty");
        }
        if !is_qualified_dns_name(&self.domain_name) {
            bail!("--domainname {:?} is not a fully qualified DNS name", self.domain_name);
        }
        if self.dns_ttl < 1 {
            bail!("--dns-ttl must be at least 1, got {}", self.dns_ttl);
        }
        if self.use_kubeconfig {
            let path = self.kubeconfig()?;
            if !path.is_file() {
                bail!("kubeconfig {} does not exist", path.display());
            }
        }
        if self.endpoints().is_empty() {
            bail!("--etcd-endpoints must name at least one endpoint");
        }
        Ok(())
    }

    fn kubeconfig(&self) -> anyhow::Result<PathBuf> {
        match &self.kubeconfig_path {
            Some(path) => Ok(path.clone()),
            None => {
                let home = std::env::var_os("HOME")
                    .ok_or_else(|| anyhow!("HOME is not set; pass --kubeconfigpath"))?;
                Ok(PathBuf::from(home).join(".kube").join("config"))
            }
        }
    }

    fn endpoints(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            root_path: self.root_path.clone(),
            domain_name: self.domain_name.clone(),
            dns_ttl: self.dns_ttl,
            ..Default::default()
        }
    }

    fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            label_selector: self.watch_labels.clone(),
            address_type: self.address_type.clone(),
            ..Default::default()
        }
    }

    fn etcd_config(&self) -> EtcdConfig {
        let identity = self.cert.clone().zip(self.key.clone());
        let tls = if self.ca_certs.is_some() || identity.is_some() {
            Some(EtcdTlsConfig {
                ca_cert: self.ca_certs.clone(),
                identity,
            })
        } else {
            None
        };

        EtcdConfig {
            endpoints: self.endpoints(),
            tls,
        }
    }

    async fn kube_client(&self) -> anyhow::Result<kube::Client> {
        if !self.use_kubeconfig {
            return Ok(kube::Client::try_default().await?);
        }

        let path = self.kubeconfig()?;
        let kubeconfig = Kubeconfig::read_from(&path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        Ok(kube::Client::try_from(config)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info());
            Ok(())
        }
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    args.validate()?;
    info!(version = %version::full_version(), "Starting kubemaster-dns");

    let client = args
        .kube_client()
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes");

    let store = EtcdStore::connect(&args.etcd_config())
        .await
        .context("failed to connect to etcd")?;
    info!(endpoints = %args.etcd_endpoints, "Connected to etcd");

    let watcher = NodeWatcher::new(
        args.watcher_config(),
        Arc::new(KubeNodeSource::new(client)),
    );
    let lease = LeaseManager::new(Arc::new(store));
    let mut controller = ReconciliationController::new(args.reconcile_config(), watcher, lease);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    match controller.run(&cancel).await? {
        Termination::Cancelled => {
            revoke_on_shutdown(controller.lease_mut()).await;
            info!("Shutdown complete");
            Ok(())
        }
        reason => {
            error!(reason = ?reason, "Controller stopped");
            Err(anyhow!("controller stopped: {:?}", reason))
        }
    }
}

/// Remove the published records right away instead of waiting for the
/// lease to expire.
async fn revoke_on_shutdown(lease: &mut LeaseManager<EtcdStore>) {
    if lease.current().is_none() {
        return;
    }

    let cancel = CancellationToken::new();
    match tokio::time::timeout(SHUTDOWN_REVOKE_TIMEOUT, lease.revoke_lease(&cancel)).await {
        Ok(Ok(())) => info!("Revoked lease on shutdown"),
        Ok(Err(e)) => warn!(error = %e, "Failed to revoke lease on shutdown"),
        Err(_) => warn!("Timed out revoking lease on shutdown"),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
