//! `cluster-operator` binary
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use cluster_core::ClusterRequest;
use cluster_operator::{
    config::LogFormat, credentials::SecretCredentials, provisioning::DigitalOcean, status::KubeClusterApi,
    Context, OperatorConfig,
};
use cluster_runtime::{ApiLookup, Controller};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, CustomResourceExt,
};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,cluster_operator=debug,cluster_runtime=debug";

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile ClusterRequest objects until interrupted
    Run {
        /// Operator config file
        #[arg(long)]
        config: PathBuf,
        /// Kubeconfig to use instead of the in-cluster or default one
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Print the ClusterRequest CRD as YAML
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&ClusterRequest::crd())?);
            Ok(())
        }
        Command::Run { config, kubeconfig } => {
            let config = OperatorConfig::from_path(&config)?;
            init_tracing(config.log_format);
            run(config, kubeconfig).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn client(kubeconfig: Option<PathBuf>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context("failed to infer kubernetes client config");
    };
    let kubeconfig =
        Kubeconfig::read_from(&path).with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to load kubeconfig")?;
    Client::try_from(config).context("failed to create kubernetes client")
}

async fn run(config: OperatorConfig, kubeconfig: Option<PathBuf>) -> anyhow::Result<()> {
    let client = client(kubeconfig).await?;
    let api: Api<ClusterRequest> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let provisioner =
        DigitalOcean::new(config.provider.api_url.clone()).context("failed to create provisioning client")?;
    let context = Arc::new(Context {
        api: Arc::new(KubeClusterApi::new(client.clone())),
        provisioner: Arc::new(provisioner),
        credentials: Arc::new(SecretCredentials::new(client.clone())),
        readiness: config.readiness(),
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        workers = config.workers,
        "starting operator"
    );
    Controller::new(api, ApiLookup::new(client), config.controller_config())
        .run(
            cluster_operator::reconcile,
            cluster_operator::error_policy,
            context,
            shutdown,
        )
        .await;
    info!("operator stopped");
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown requested, draining in-flight reconciles");
    shutdown.cancel();
}
