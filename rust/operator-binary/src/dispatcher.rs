//! Feeds events from both watch sources through the filter into the reconciler, one request at a
//! time, and schedules retries for failed requests.
use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use stackable_operator::logging::controller::ReconcilerError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    controller::{self, Ctx, SyncAction},
    event::{Origin, ServiceEvent, SyncRequest},
    filter::{is_annotated_mirror, is_reconcilable},
    metrics::Metrics,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub struct Dispatcher {
    ctx: Ctx,
    metrics: Arc<Metrics>,
    events: UnboundedReceiver<ServiceEvent>,
    max_retry_delay: Duration,
    retries: DelayQueue<SyncRequest>,
    scheduled: HashMap<SyncRequest, delay_queue::Key>,
    /// Delay used for the last retry of each failing request.
    backoff: HashMap<SyncRequest, Duration>,
}

enum Work {
    Event(ServiceEvent),
    Retry(SyncRequest),
}

impl Dispatcher {
    pub fn new(
        ctx: Ctx,
        metrics: Arc<Metrics>,
        events: UnboundedReceiver<ServiceEvent>,
        max_retry_delay: Duration,
    ) -> Self {
        Self {
            ctx,
            metrics,
            events,
            max_retry_delay,
            retries: DelayQueue::new(),
            scheduled: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    /// Processes requests until `shutdown` fires or every event sender is gone. A reconcile in
    /// flight when `shutdown` fires is abandoned.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(controller = controller::CONTROLLER_NAME, "starting dispatcher");
        loop {
            let work = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => Work::Event(event),
                    None => break,
                },
                Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                    Work::Retry(expired.into_inner())
                }
            };
            let request = match work {
                Work::Event(event) => match admit(&event) {
                    Some(request) => request,
                    None => continue,
                },
                Work::Retry(request) => {
                    self.scheduled.remove(&request);
                    request
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.handle(request) => {}
            }
        }
        info!(
            controller = controller::CONTROLLER_NAME,
            pending_retries = self.retries.len(),
            "dispatcher stopped"
        );
    }

    async fn handle(&mut self, request: SyncRequest) {
        // A fresh event supersedes a retry that is still waiting.
        if let Some(key) = self.scheduled.remove(&request) {
            self.retries.remove(&key);
        }

        let span = info_span!(
            "reconcile",
            origin = %request.origin,
            service.namespace = %request.key.namespace,
            service.name = %request.key.name,
        );
        let result = {
            let _timer = self.metrics.measure();
            controller::reconcile(&request, &self.ctx)
                .instrument(span)
                .await
        };

        match result {
            Ok(action) => {
                self.metrics.count_run(request.origin, &action);
                log_action(&request, &action);
                self.backoff.remove(&request);
            }
            Err(err) if !err.is_retryable() => {
                self.metrics.count_failure(request.origin, &err);
                error!(
                    %request,
                    error = ?err,
                    category = err.category(),
                    "failed to reconcile, not retrying until the Service changes"
                );
                self.backoff.remove(&request);
            }
            Err(err) => {
                self.metrics.count_failure(request.origin, &err);
                let delay = next_delay(self.backoff.get(&request).copied(), self.max_retry_delay);
                warn!(
                    %request,
                    error = ?err,
                    category = err.category(),
                    retry_in = ?delay,
                    "failed to reconcile"
                );
                self.backoff.insert(request.clone(), delay);
                let key = self.retries.insert(request.clone(), delay);
                self.scheduled.insert(request, key);
            }
        }
    }
}

/// Applies the reconcile predicate shared by both sources.
fn admit(event: &ServiceEvent) -> Option<SyncRequest> {
    let admitted = match event.origin {
        Origin::Hosted => is_reconcilable(&event.service),
        Origin::Infra => is_reconcilable(&event.service) || is_annotated_mirror(&event.service),
    };
    if !admitted {
        return None;
    }
    let request = event.request();
    if request.is_none() {
        debug!(origin = %event.origin, "dropping event for Service without namespace or name");
    }
    request
}

fn next_delay(previous: Option<Duration>, max: Duration) -> Duration {
    let delay = match previous {
        Some(previous) => previous.saturating_mul(2),
        None => INITIAL_RETRY_DELAY,
    };
    delay.min(max)
}

fn log_action(request: &SyncRequest, action: &SyncAction) {
    let action_name: &'static str = action.into();
    match action {
        SyncAction::Noop | SyncAction::Unmanaged | SyncAction::StatusAlreadySet => {
            debug!(%request, action = action_name, "reconciled")
        }
        _ => info!(%request, action = action_name, "reconciled"),
    }
}
