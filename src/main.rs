//! Fledge controller - node image cache warming for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fledge::config::{
    ControllerConfig, DEFAULT_BUSYBOX_IMAGE, DEFAULT_CRI_SOCKET_PATH, DEFAULT_IMAGE_MANAGER_IMAGE,
};
use fledge::controller::{build_watchers, Context, Controller, EVENT_CHANNEL_CAPACITY};
use fledge::crd::ImageCache;
use fledge::retry::RetryConfig;

/// Fledge - pre-pull and purge container images on selected nodes
#[derive(Parser, Debug)]
#[command(name = "fledge", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

/// Controller tunables
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "FLEDGE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Seconds between full re-enqueues of every ImageCache
    #[arg(
        long,
        env = "FLEDGE_RESYNC_INTERVAL_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    resync_interval_secs: u64,

    /// Execution deadline for each Job in seconds
    #[arg(
        long,
        env = "FLEDGE_JOB_DEADLINE_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    job_deadline_secs: u64,

    /// Job attempts per item before it is terminally failed
    #[arg(
        long,
        env = "FLEDGE_JOB_RETRY_LIMIT",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    job_retry_limit: u32,

    /// Base delay before retrying a failed Job
    #[arg(long, env = "FLEDGE_JOB_RETRY_BASE_SECS", default_value_t = 30)]
    job_retry_base_secs: u64,

    /// Cap on the Job retry delay
    #[arg(long, env = "FLEDGE_JOB_RETRY_MAX_SECS", default_value_t = 300)]
    job_retry_max_secs: u64,

    /// Transient reconcile failures tolerated before marking a resource Failed
    #[arg(
        long,
        env = "FLEDGE_RECONCILE_RETRY_LIMIT",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    reconcile_retry_limit: u32,

    /// Base queue backoff after a transient failure
    #[arg(long, env = "FLEDGE_RECONCILE_RETRY_BASE_MS", default_value_t = 500)]
    reconcile_retry_base_ms: u64,

    /// Cap on the queue backoff
    #[arg(long, env = "FLEDGE_RECONCILE_RETRY_MAX_SECS", default_value_t = 300)]
    reconcile_retry_max_secs: u64,

    /// Requeue interval while Jobs are running
    #[arg(
        long,
        env = "FLEDGE_JOB_POLL_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    job_poll_secs: u64,

    /// Image run by purge Jobs (must ship crictl)
    #[arg(long, env = "FLEDGE_IMAGE_MANAGER_IMAGE", default_value = DEFAULT_IMAGE_MANAGER_IMAGE)]
    image_manager_image: String,

    /// Image supplying the static echo that pull Jobs exit with
    #[arg(long, env = "FLEDGE_BUSYBOX_IMAGE", default_value = DEFAULT_BUSYBOX_IMAGE)]
    busybox_image: String,

    /// Host path of the container runtime socket
    #[arg(long, env = "FLEDGE_CRI_SOCKET_PATH", default_value = DEFAULT_CRI_SOCKET_PATH)]
    cri_socket_path: String,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl ControllerArgs {
    fn from_config(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            resync_interval_secs: config.resync_interval.as_secs(),
            job_deadline_secs: config.job_deadline.as_secs(),
            job_retry_limit: config.job_retry.max_attempts,
            job_retry_base_secs: config.job_retry.initial_delay.as_secs(),
            job_retry_max_secs: config.job_retry.max_delay.as_secs(),
            reconcile_retry_limit: config.reconcile_retry.max_attempts,
            reconcile_retry_base_ms: config.reconcile_retry.initial_delay.as_millis() as u64,
            reconcile_retry_max_secs: config.reconcile_retry.max_delay.as_secs(),
            job_poll_secs: config.job_poll_interval.as_secs(),
            image_manager_image: config.image_manager_image.clone(),
            busybox_image: config.busybox_image.clone(),
            cri_socket_path: config.cri_socket_path.clone(),
        }
    }

    fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            job_deadline: Duration::from_secs(self.job_deadline_secs),
            job_retry: RetryConfig::exponential(
                self.job_retry_limit,
                Duration::from_secs(self.job_retry_base_secs),
                Duration::from_secs(self.job_retry_max_secs),
            ),
            reconcile_retry: RetryConfig::exponential(
                self.reconcile_retry_limit,
                Duration::from_millis(self.reconcile_retry_base_ms),
                Duration::from_secs(self.reconcile_retry_max_secs),
            ),
            job_poll_interval: Duration::from_secs(self.job_poll_secs),
            image_manager_image: self.image_manager_image,
            busybox_image: self.busybox_image,
            cri_socket_path: self.cri_socket_path,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ImageCache::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    run_controller(args.into_config()).await
}

/// Install or update the ImageCache CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("fledge-controller").force();

    tracing::info!("Installing ImageCache CRD...");
    crds.patch(
        "imagecaches.fledge.dev",
        &params,
        &Patch::Apply(&ImageCache::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ImageCache CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!(?config, "Fledge controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tracing::info!("Starting watchers:");
    let watchers: Vec<_> = build_watchers(client, tx)
        .into_iter()
        .map(tokio::spawn)
        .collect();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    };
    Controller::new(ctx).run(rx, shutdown).await;

    for watcher in watchers {
        watcher.abort();
    }
    tracing::info!("Fledge controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let cli = Cli::parse_from(["fledge", "controller"]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.into_config(), ControllerConfig::default());
        assert_eq!(
            ControllerArgs::default().into_config(),
            ControllerConfig::default()
        );
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "fledge",
            "controller",
            "--workers",
            "8",
            "--job-retry-limit",
            "5",
            "--cri-socket-path",
            "/run/crio/crio.sock",
        ]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        let config = args.into_config();
        assert_eq!(config.workers, 8);
        assert_eq!(config.job_retry.max_attempts, 5);
        assert_eq!(config.cri_socket_path, "/run/crio/crio.sock");
    }

    #[test]
    fn zero_intervals_and_limits_are_rejected() {
        for flag in [
            "--resync-interval-secs",
            "--job-deadline-secs",
            "--job-poll-secs",
            "--job-retry-limit",
            "--reconcile-retry-limit",
        ] {
            let err = Cli::try_parse_from(["fledge", "controller", flag, "0"])
                .expect_err(flag);
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{}", flag);
            assert!(Cli::try_parse_from(["fledge", "controller", flag, "1"]).is_ok());
        }
    }

    #[test]
    fn crd_flag_parses() {
        assert!(Cli::parse_from(["fledge", "--crd"]).crd);
    }
}
