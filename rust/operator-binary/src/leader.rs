//! Lease based leader election, so that only one replica reconciles at a time.
//!
//! The Lease protocol is left to [`LeaseLock`]; this module only decides when to try again and
//! when leadership counts as lost.
use std::{env::VarError, future::Future, time::Duration};

use futures::TryFutureExt;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conventions::{LEADER_ELECTION_LEASE_NAME, POD_NAME_ENV};

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("environment variable {POD_NAME_ENV} is required for leader election"))]
    IdentityNotSet { source: VarError },
    #[snafu(display("environment variable {POD_NAME_ENV} is empty"))]
    IdentityEmpty,
    #[snafu(display("lost leadership of Lease {lease} to {holder}"))]
    LeaseTaken { lease: String, holder: String },
    #[snafu(display("failed to renew Lease {lease} within {RENEW_DEADLINE:?}"))]
    RenewDeadlineExceeded { lease: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The identity this replica competes with, taken from the downward API.
pub fn identity() -> Result<String> {
    identity_from(std::env::var(POD_NAME_ENV))
}

fn identity_from(value: Result<String, VarError>) -> Result<String> {
    let identity = value.context(IdentityNotSetSnafu)?;
    ensure!(!identity.trim().is_empty(), IdentityEmptySnafu);
    Ok(identity.trim().to_string())
}

fn lease_params(identity: &str) -> LeaseLockParams {
    LeaseLockParams {
        holder_id: identity.to_string(),
        lease_name: LEADER_ELECTION_LEASE_NAME.to_string(),
        lease_ttl: LEASE_DURATION,
    }
}

fn holder_of(result: &LeaseLockResult) -> String {
    result
        .lease
        .as_ref()
        .and_then(|lease| lease.spec.as_ref())
        .and_then(|spec| spec.holder_identity.clone())
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Runs `work` alongside `renewal`. Renewal is polled from the start, so it keeps the Lease alive
/// while `work` is still setting up, and losing the Lease aborts `work`.
pub async fn while_renewing(
    renewal: impl Future<Output = Result<()>>,
    work: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    futures::try_join!(renewal.map_err(anyhow::Error::from), work)?;
    Ok(())
}

pub struct LeaderElector {
    lock: LeaseLock,
    lease: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            lock: LeaseLock::new(client, namespace, lease_params(&identity)),
            lease: format!("{namespace}/{LEADER_ELECTION_LEASE_NAME}"),
            identity,
        }
    }

    /// Blocks until this replica holds the Lease. Returns `false` if `shutdown` fires first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        info!(identity = %self.identity, lease = %self.lease, "waiting for leadership");
        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(identity = %self.identity, lease = %self.lease, "acquired leadership");
                    return true;
                }
                Ok(result) => {
                    debug!(identity = %self.identity, holder = %holder_of(&result), "Lease is held by another replica")
                }
                Err(err) => warn!(identity = %self.identity, error = %err, "failed to acquire Lease"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }
        }
    }

    /// Keeps renewing the Lease until `shutdown` fires. Fails once leadership is lost, either
    /// because another replica took the Lease or because it could not be renewed in time.
    pub async fn hold(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => last_renewal = Instant::now(),
                Ok(result) => {
                    return LeaseTakenSnafu {
                        lease: &self.lease,
                        holder: holder_of(&result),
                    }
                    .fail();
                }
                Err(err) => warn!(identity = %self.identity, error = %err, "failed to renew Lease"),
            }
            if last_renewal.elapsed() >= RENEW_DEADLINE {
                return RenewDeadlineExceededSnafu { lease: &self.lease }.fail();
            }
        }
    }

    /// Gives the Lease up so a standby replica does not have to wait for it to expire.
    pub async fn release(&self) {
        match self.lock.step_down().await {
            Ok(()) => info!(identity = %self.identity, lease = %self.lease, "released leadership"),
            Err(err) => warn!(identity = %self.identity, error = %err, "failed to release Lease"),
        }
    }
}
