//! Watch sources that feed Service events from both clusters into the reconciler's channel.
use std::time::Duration;

use futures::{Stream, StreamExt};
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::Service,
    kube::{
        runtime::{
            reflector::{self, Store},
            watcher, WatchStreamExt,
        },
        Api, Client,
    },
};
use tokio::{
    sync::mpsc::UnboundedSender,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{Origin, ServiceEvent};

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("the {origin} event channel is closed"))]
    ChannelClosed { origin: Origin },
}

/// Streams every Service add, update and delete seen on one cluster into the event channel,
/// tagged with the cluster it came from, and replays the full cache every resync period.
///
/// No filtering happens here; the consumer applies the same predicate to both sources.
pub struct EventPump {
    origin: Origin,
    api: Api<Service>,
    events: UnboundedSender<ServiceEvent>,
    resync_period: Duration,
}

impl EventPump {
    /// The hosted event pump, watching Services in all namespaces of the hosted cluster.
    pub fn hosted(
        client: Client,
        events: UnboundedSender<ServiceEvent>,
        resync_period: Duration,
    ) -> Self {
        Self {
            origin: Origin::Hosted,
            api: Api::all(client),
            events,
            resync_period,
        }
    }

    /// The infra watch, limited to the namespace the mirrors live in.
    pub fn infra(
        client: Client,
        namespace: &str,
        events: UnboundedSender<ServiceEvent>,
        resync_period: Duration,
    ) -> Self {
        Self {
            origin: Origin::Infra,
            api: Api::namespaced(client, namespace),
            events,
            resync_period,
        }
    }

    /// Runs until `shutdown` fires. `synced` is cancelled once the initial list has been
    /// forwarded.
    pub async fn start(
        self,
        synced: CancellationToken,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        info!(origin = %self.origin, resync_period = ?self.resync_period, "starting Service watch");
        let (store, writer) = reflector::store();
        let stream = watcher(self.api, watcher::Config::default())
            .default_backoff()
            .reflect(writer);
        forward(
            self.origin,
            stream,
            store,
            self.resync_period,
            &self.events,
            synced,
            shutdown,
        )
        .await
    }
}

async fn forward<S>(
    origin: Origin,
    stream: S,
    store: Store<Service>,
    resync_period: Duration,
    events: &UnboundedSender<ServiceEvent>,
    synced: CancellationToken,
    shutdown: CancellationToken,
) -> Result<(), Error>
where
    S: Stream<Item = watcher::Result<watcher::Event<Service>>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut resync = interval_at(Instant::now() + resync_period, resync_period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The reconciler stops first on shutdown, so a closed channel is only an error before that.
    let send = |event: ServiceEvent| {
        if events.send(event).is_err() && !shutdown.is_cancelled() {
            return ChannelClosedSnafu { origin }.fail();
        }
        Ok(())
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(%origin, "stopping Service watch");
                return Ok(());
            }
            _ = resync.tick() => {
                let services = store.state();
                debug!(%origin, services = services.len(), "resyncing cached Services");
                for service in services {
                    send(ServiceEvent::new(origin, service))?;
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if matches!(event, watcher::Event::InitDone) && !synced.is_cancelled() {
                        info!(%origin, "initial Service list forwarded");
                        synced.cancel();
                    }
                    if let Some(event) = ServiceEvent::from_watch(origin, event) {
                        send(event)?;
                    }
                }
                Some(Err(err)) => warn!(%origin, error = %err, "Service watch failed, retrying"),
                None => return Ok(()),
            }
        }
    }
}
