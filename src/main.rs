//! Storage Provisioner Operator
//!
//! Deploys CSI drivers and dynamic storage provisioners from custom
//! resources. Runs against a cluster, or standalone with an in-memory store
//! and simulated nodes fed from a manifest file.

use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_provisioner_operator::controller::{
    ProvisionerImages, RetryPolicy, RolloutConfig, SidecarImages, SynthesizerConfig,
};
use storage_provisioner_operator::domain::ports::{NodeDrainerRef, NodePluginsRef, ObjectStoreRef};
use storage_provisioner_operator::{
    crd, Controller, Error, KubeNodeRuntime, KubeObjectStore, MemoryObjectStore, OperatorConfig,
    OperatorMetrics, Result, SimulatedNodes,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Provisioner Operator - CSI drivers and dynamic provisioners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Only watch provisioner resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Full resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "300")]
    resync_interval_secs: u64,

    /// Persist the generation ledger to this file
    #[arg(long, env = "LEDGER_PATH")]
    ledger_path: Option<PathBuf>,

    /// Attempts per child write before giving up for the pass
    #[arg(long, env = "RETRY_ATTEMPTS", default_value = "5")]
    retry_attempts: u32,

    /// Nodes updated at the same time during a node plugin rollout
    #[arg(long, env = "MAX_CONCURRENT_NODES", default_value = "1")]
    max_concurrent_nodes: usize,

    /// Seconds to wait for one pod eviction
    #[arg(long, env = "EVICTION_TIMEOUT", default_value = "300")]
    eviction_timeout_secs: u64,

    /// Seconds to wait for a replaced node plugin to become ready
    #[arg(long, env = "VERIFY_TIMEOUT", default_value = "300")]
    verify_timeout_secs: u64,

    /// Kubelet root directory on the nodes
    #[arg(long, env = "KUBELET_DIR", default_value = "/var/lib/kubelet")]
    kubelet_dir: String,

    /// Driver registrar sidecar image
    #[arg(long, env = "DRIVER_REGISTRAR_IMAGE")]
    driver_registrar_image: Option<String>,

    /// Liveness probe sidecar image
    #[arg(long, env = "LIVENESS_PROBE_IMAGE")]
    liveness_probe_image: Option<String>,

    /// External provisioner sidecar image
    #[arg(long, env = "PROVISIONER_SIDECAR_IMAGE")]
    provisioner_sidecar_image: Option<String>,

    /// External attacher sidecar image
    #[arg(long, env = "ATTACHER_IMAGE")]
    attacher_image: Option<String>,

    /// Default EFS provisioner image
    #[arg(long, env = "EFS_PROVISIONER_IMAGE")]
    efs_image: Option<String>,

    /// Default Manila provisioner image
    #[arg(long, env = "MANILA_PROVISIONER_IMAGE")]
    manila_image: Option<String>,

    /// Default CephFS provisioner image
    #[arg(long, env = "CEPHFS_PROVISIONER_IMAGE")]
    cephfs_image: Option<String>,

    /// Default snapshot controller image
    #[arg(long, env = "SNAPSHOT_CONTROLLER_IMAGE")]
    snapshot_controller_image: Option<String>,

    /// Default snapshot provisioner image
    #[arg(long, env = "SNAPSHOT_PROVISIONER_IMAGE")]
    snapshot_provisioner_image: Option<String>,

    /// Default local volume provisioner image
    #[arg(long, env = "LOCAL_PROVISIONER_IMAGE")]
    local_provisioner_image: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Provisioner resources to load in standalone mode
    #[arg(long, env = "MANIFEST")]
    manifest: Option<PathBuf>,

    /// Simulated nodes in standalone mode
    #[arg(long, env = "SIMULATED_NODES", default_value = "3")]
    simulated_nodes: usize,

    /// Print every CRD as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let mut sidecars = SidecarImages::default();
        override_with(&mut sidecars.driver_registrar, &self.driver_registrar_image);
        override_with(&mut sidecars.liveness_probe, &self.liveness_probe_image);
        override_with(&mut sidecars.provisioner, &self.provisioner_sidecar_image);
        override_with(&mut sidecars.attacher, &self.attacher_image);

        let mut images = ProvisionerImages::default();
        override_with(&mut images.efs, &self.efs_image);
        override_with(&mut images.manila, &self.manila_image);
        override_with(&mut images.cephfs, &self.cephfs_image);
        override_with(&mut images.snapshot_controller, &self.snapshot_controller_image);
        override_with(&mut images.snapshot_provisioner, &self.snapshot_provisioner_image);
        override_with(&mut images.local_provisioner, &self.local_provisioner_image);

        OperatorConfig {
            synthesizer: SynthesizerConfig {
                sidecars,
                provisioner_images: images,
                kubelet_dir: self.kubelet_dir.clone(),
            },
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                ..Default::default()
            },
            rollout: RolloutConfig {
                max_concurrent_nodes: self.max_concurrent_nodes.max(1),
                eviction_timeout: Duration::from_secs(self.eviction_timeout_secs),
                verify_timeout: Duration::from_secs(self.verify_timeout_secs),
                ..Default::default()
            },
            workers: self.workers.max(1),
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
            ledger_path: self.ledger_path.clone(),
            ..Default::default()
        }
    }
}

fn override_with(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        for crd in crd::all_crds() {
            print!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    info!("Starting Storage Provisioner Operator");
    info!("  Version: {}", storage_provisioner_operator::VERSION);
    info!("  Workers: {}", config.workers);
    info!("  Namespace: {}", args.namespace.as_deref().unwrap_or("<all>"));
    info!("  Standalone mode: {}", args.standalone);

    let shutdown = CancellationToken::new();
    let metrics = OperatorMetrics::new()?;
    let ready = Arc::new(AtomicBool::new(false));

    let (store, drainer, plugins) = if args.standalone {
        standalone_ports(&args)?
    } else {
        let client = kube::Client::try_default().await?;
        let store = KubeObjectStore::new(client.clone(), args.namespace.clone());
        store.start_watchers(shutdown.clone());
        let nodes = KubeNodeRuntime::new(client);
        let drainer: NodeDrainerRef = nodes.clone();
        let plugins: NodePluginsRef = nodes;
        let store: ObjectStoreRef = store;
        (store, drainer, plugins)
    };

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal.cancel();
    });

    let controller = Controller::new(config, store, drainer, plugins, metrics, shutdown)?;
    ready.store(true, Ordering::SeqCst);
    controller.run().await?;

    info!("Operator shutdown complete");
    Ok(())
}

/// In-memory store and simulated nodes, seeded from the manifest file
fn standalone_ports(args: &Args) -> Result<(ObjectStoreRef, NodeDrainerRef, NodePluginsRef)> {
    let store = MemoryObjectStore::new();
    if let Some(path) = &args.manifest {
        let yaml = std::fs::read_to_string(path)?;
        let loaded = store.load_manifests(&yaml)?;
        info!("Loaded {} resources from {}", loaded, path.display());
    }

    let nodes = SimulatedNodes::new(store.clone());
    for i in 1..=args.simulated_nodes {
        nodes.add_node(&format!("node-{}", i), BTreeMap::new());
    }
    info!("Simulating {} nodes", args.simulated_nodes);

    let drainer: NodeDrainerRef = nodes.clone();
    let plugins: NodePluginsRef = nodes;
    let store: ObjectStoreRef = store;
    Ok((store, drainer, plugins))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

fn directive(spec: &str) -> Result<Directive> {
    spec.parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", spec, e)))
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

async fn run_metrics_server(addr: &str, metrics: OperatorMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = text_response(StatusCode::OK, buffer);
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
