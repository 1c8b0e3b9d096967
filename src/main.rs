//! OADP Operator
//!
//! Main entry point for the operator. Bootstraps credentials and namespace
//! labels, optionally waits for leadership, then runs the controllers.
//!
//! Exit codes: 0 on clean shutdown, 1 when bootstrap fails, 2 on a runtime
//! failure (including loss of leadership).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use oadp_operator::{
    adapters::object_storage::S3ClientFactory,
    bootstrap::{self, BootstrapSettings, LeaderElector, LeaderGuard},
    config::{parse_bind_address, Args, OperatorEnv},
    controllers::{self, Context},
    metrics::{self, Readiness},
    store::{ClusterStore, KubeStore},
};

enum Failure {
    Bootstrap(anyhow::Error),
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    info!("Starting OADP Operator");

    match run(args).await {
        Ok(()) => {
            info!("OADP Operator stopped");
            ExitCode::SUCCESS
        }
        Err(Failure::Bootstrap(e)) => {
            error!(error = %e, "Bootstrap failed");
            ExitCode::from(1)
        }
        Err(Failure::Runtime(e)) => {
            error!(error = %e, "Operator failed");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<(), Failure> {
    let env = OperatorEnv::from_process();
    let namespace = env
        .require_watch_namespace()
        .map_err(|e| Failure::Bootstrap(e.into()))?
        .to_string();
    let metrics_addr =
        parse_bind_address(&args.metrics_bind_address).map_err(|e| Failure::Bootstrap(e.into()))?;
    let probe_addr = parse_bind_address(&args.health_probe_bind_address)
        .map_err(|e| Failure::Bootstrap(e.into()))?;
    if args.metrics_secure {
        info!("Metrics TLS termination is delegated to the kube-rbac-proxy sidecar");
    }
    if args.enable_http2 {
        warn!("HTTP/2 requested; metrics and probe servers only speak HTTP/1.1");
    }

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .map_err(|e| Failure::Bootstrap(e.into()))?;
    info!("Connected to Kubernetes API server");
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));

    let readiness = Readiness::new();
    let probes_handle = probe_addr.map(|addr| tokio::spawn(metrics::serve_probes(addr, readiness.clone())));
    let metrics_handle = metrics_addr.map(|addr| tokio::spawn(metrics::serve_metrics(addr)));

    let bootstrapped = bootstrap::run(store.as_ref(), &env, &BootstrapSettings::default())
        .await
        .map_err(|e| Failure::Bootstrap(e.into()))?;
    if let Some(secret) = bootstrapped.sts_secret {
        info!(secret, "Short-term credentials secret ready");
    }

    let mut guard: Option<LeaderGuard> = None;
    if args.leader_elect {
        let identity = env
            .pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("oadp-operator-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            store.clone(),
            &namespace,
            &identity,
            bootstrapped.timings,
        ));
        tokio::select! {
            acquired = elector.acquire() => guard = Some(acquired),
            _ = shutdown_signal() => {
                info!("Received shutdown signal before acquiring leadership");
                return Ok(());
            }
        }
    }

    let cancel = CancellationToken::new();
    let context = Arc::new(Context::new(
        client,
        store,
        env,
        Arc::new(S3ClientFactory),
        cancel.clone(),
    ));

    // Run all controllers concurrently
    let dpa_controller = controllers::run_dpa_controller(context.clone());
    let cloud_storage_controller = controllers::run_cloud_storage_controller(context.clone());
    let dpt_controller = controllers::run_dpt_controller(context.clone());
    readiness.set_ready(true);

    let outcome = tokio::select! {
        r = dpa_controller => controller_exit("DataProtectionApplication", r),
        r = cloud_storage_controller => controller_exit("CloudStorage", r),
        r = dpt_controller => controller_exit("DataProtectionTest", r),
        r = server_exit(metrics_handle) => Err(Failure::Runtime(anyhow!("metrics server exited: {r}"))),
        r = server_exit(probes_handle) => Err(Failure::Runtime(anyhow!("probe server exited: {r}"))),
        _ = leadership_lost(&mut guard) => Err(Failure::Runtime(anyhow!("leadership lost"))),
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
            Ok(())
        }
    };

    readiness.set_ready(false);
    cancel.cancel();
    if let Some(guard) = guard {
        if let Err(e) = guard.release_leadership().await {
            warn!(error = %e, "Failed to release leadership");
        }
    }
    outcome
}

fn controller_exit(kind: &str, result: oadp_operator::Result<()>) -> Result<(), Failure> {
    match result {
        Ok(()) => {
            info!(kind, "Controller stopped");
            Ok(())
        }
        Err(e) => Err(Failure::Runtime(anyhow!("{kind} controller failed: {e}"))),
    }
}

/// Resolves when a spawned server stops; never for a disabled one
async fn server_exit(handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(())) => "stopped".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        },
        None => std::future::pending().await,
    }
}

async fn leadership_lost(guard: &mut Option<LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
