// kube::Error makes most of our error enums large.
#![allow(clippy::result_large_err)]

mod client;
mod context;
mod controller;
mod conventions;
mod dispatcher;
mod event;
mod filter;
mod http;
mod leader;
mod metrics;
mod pump;
mod service;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use futures::{FutureExt, TryFutureExt};
use stackable_operator::{
    kube::Client,
    telemetry::{tracing::TelemetryOptions, Tracing},
    utils::signal::SignalWatcher,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{KubeClusterNameLookup, KubeServiceApi},
    controller::Ctx,
    dispatcher::Dispatcher,
    http::Probes,
    leader::LeaderElector,
    metrics::Metrics,
    pump::EventPump,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    /// Address the metrics endpoint binds to. `:PORT` binds on all interfaces.
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// Address the health and readiness probes bind to. `:PORT` binds on all interfaces.
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Only reconcile while holding the leader election Lease.
    #[arg(long)]
    leader_elect: bool,

    /// Seconds between replays of every cached Service on both clusters.
    #[arg(
        long,
        env = "RESYNC_PERIOD_SECONDS",
        default_value_t = pump::DEFAULT_RESYNC_PERIOD.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    resync_period: u64,

    /// Upper bound in seconds for the delay before a failed request is retried.
    #[arg(
        long,
        default_value_t = dispatcher::DEFAULT_MAX_RETRY_DELAY.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_requeue_delay: u64,

    #[command(flatten)]
    telemetry: TelemetryOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let _tracing_guard = Tracing::pre_configured(built_info::PKG_NAME, opts.telemetry).init()?;

    tracing::info!(
        built_info.pkg_version = built_info::PKG_VERSION,
        built_info.git_version = built_info::GIT_VERSION,
        built_info.target = built_info::TARGET,
        built_info.built_time_utc = built_info::BUILT_TIME_UTC,
        built_info.rustc_version = built_info::RUSTC_VERSION,
        "Starting {description}",
        description = built_info::PKG_DESCRIPTION
    );

    let metrics_address = http::parse_bind_address(&opts.metrics_bind_address)?;
    let probe_address = http::parse_bind_address(&opts.health_probe_bind_address)?;
    let resync_period = Duration::from_secs(opts.resync_period);
    let max_requeue_delay = Duration::from_secs(opts.max_requeue_delay);

    let namespace = context::current_namespace()?;
    let identity = if opts.leader_elect {
        Some(leader::identity()?)
    } else {
        None
    };

    // Cancelled on SIGTERM or SIGINT, which gracefully shuts down all tasks below.
    let shutdown = CancellationToken::new();
    let sigterm_watcher = SignalWatcher::sigterm()?;
    let signals = async {
        tokio::select! {
            _ = sigterm_watcher.handle() => info!("received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("received SIGINT, shutting down"),
                Err(err) => warn!(error = %err, "failed to listen for SIGINT, shutting down"),
            },
        }
        shutdown.cancel();
        anyhow::Ok(())
    };

    // Probes and metrics are served while a standby replica waits for the Lease, too. A standby
    // reports ready so a rolling update is not blocked on the Lease the old pod holds.
    let metrics = Arc::new(Metrics::new());
    let leading = CancellationToken::new();
    if identity.is_none() {
        leading.cancel();
    }
    let hosted_synced = CancellationToken::new();
    let infra_synced = CancellationToken::new();
    let probe_server = http::serve(
        "health probe",
        probe_address,
        http::probe_router(Probes::new(
            leading.clone(),
            vec![hosted_synced.clone(), infra_synced.clone()],
        )),
        shutdown.clone(),
    )
    .map_err(anyhow::Error::from);
    let metrics_server = http::serve(
        "metrics",
        metrics_address,
        http::metrics_router(metrics.clone()),
        shutdown.clone(),
    )
    .map_err(anyhow::Error::from);

    let agent = async {
        let infra_client = Client::try_default().await?;

        let elector = match identity {
            Some(identity) => {
                let elector = LeaderElector::new(infra_client.clone(), &namespace, identity);
                if !elector.acquire(&shutdown).await {
                    return anyhow::Ok(());
                }
                Some(elector)
            }
            None => None,
        };
        leading.cancel();

        // Renewal starts right away, setup below may take longer than the Lease lasts.
        let renewal = async {
            match &elector {
                Some(elector) => elector.hold(&shutdown).await,
                None => Ok(()),
            }
        };
        let reconciler = async {
            let hosted_config = context::load_hosted_config(&infra_client, &namespace)
                .await
                .inspect_err(report_not_ready)?;
            let hosted_client = Client::try_from(hosted_config)?;
            let cluster_name = context::cluster_gen_name(&infra_client, &namespace)
                .await
                .inspect_err(report_not_ready)?;
            info!(%namespace, cluster.name = %cluster_name, "resolved hosted cluster");

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let ctx = Ctx {
                namespace: namespace.clone(),
                infra: Arc::new(KubeServiceApi::new(infra_client.clone())),
                hosted: Arc::new(KubeServiceApi::new(hosted_client.clone())),
                clusters: Arc::new(KubeClusterNameLookup::new(infra_client.clone())),
            };

            let hosted_pump = EventPump::hosted(hosted_client, events_tx.clone(), resync_period)
                .start(hosted_synced.clone(), shutdown.clone())
                .map_err(anyhow::Error::from);
            let infra_watch =
                EventPump::infra(infra_client.clone(), &namespace, events_tx, resync_period)
                    .start(infra_synced.clone(), shutdown.clone())
                    .map_err(anyhow::Error::from);
            let dispatcher = Dispatcher::new(ctx, metrics, events_rx, max_requeue_delay)
                .run(shutdown.clone())
                .map(anyhow::Ok);
            futures::try_join!(hosted_pump, infra_watch, dispatcher)?;
            anyhow::Ok(())
        };

        leader::while_renewing(renewal, reconciler).await?;
        if let Some(elector) = &elector {
            elector.release().await;
        }
        anyhow::Ok(())
    };

    futures::try_join!(signals, probe_server, metrics_server, agent)?;
    info!("shut down");
    Ok(())
}

fn report_not_ready(err: &context::Error) {
    if err.is_not_ready() {
        warn!(
            error = %err,
            "hosted cluster is not fully provisioned yet, exiting so the agent is restarted"
        );
    }
}
