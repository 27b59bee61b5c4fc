//! Health, readiness and metrics endpoints.
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::Metrics;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid bind address {address:?}"))]
    InvalidBindAddress {
        source: std::net::AddrParseError,
        address: String,
    },
    #[snafu(display("failed to bind {endpoint} endpoint to {address}"))]
    Bind {
        source: std::io::Error,
        endpoint: &'static str,
        address: SocketAddr,
    },
    #[snafu(display("{endpoint} endpoint failed"))]
    Serve {
        source: std::io::Error,
        endpoint: &'static str,
    },
}

/// Parses a listen address, accepting the `:PORT` shorthand for all interfaces.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, Error> {
    let parsed = match address.strip_prefix(':') {
        Some(port) => port
            .parse::<u16>()
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .or_else(|_| address.parse()),
        None => address.parse(),
    };
    parsed.context(InvalidBindAddressSnafu { address })
}

/// A standby replica is always ready. Once `leading` is cancelled, readiness waits for every
/// watch source to cancel its `synced` token.
#[derive(Clone)]
pub struct Probes {
    leading: CancellationToken,
    synced: Vec<CancellationToken>,
}

impl Probes {
    pub fn new(leading: CancellationToken, synced: Vec<CancellationToken>) -> Self {
        Self { leading, synced }
    }

    fn readiness(&self) -> Readiness {
        if !self.leading.is_cancelled() || self.synced.iter().all(CancellationToken::is_cancelled)
        {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub fn probe_router(probes: Probes) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(Arc::new(probes))
}

pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

pub async fn serve(
    endpoint: &'static str,
    address: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(address)
        .await
        .context(BindSnafu { endpoint, address })?;
    info!(endpoint, %address, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context(ServeSnafu { endpoint })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(probes): State<Arc<Probes>>) -> Readiness {
    probes.readiness()
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(":8080", "0.0.0.0:8080")]
    #[case("0.0.0.0:8081", "0.0.0.0:8081")]
    #[case("127.0.0.1:9090", "127.0.0.1:9090")]
    #[case("[::1]:8080", "[::1]:8080")]
    fn bind_addresses(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(
            parse_bind_address(input).unwrap(),
            expected.parse::<SocketAddr>().unwrap()
        );
    }

    #[rstest]
    #[case("")]
    #[case(":")]
    #[case(":http")]
    #[case("localhost:8080")]
    fn invalid_bind_addresses(#[case] input: &str) {
        assert!(parse_bind_address(input).is_err());
    }

    #[tokio::test]
    async fn ready_once_every_source_synced() {
        let leading = CancellationToken::new();
        leading.cancel();
        let hosted = CancellationToken::new();
        let infra = CancellationToken::new();
        let probes = Arc::new(Probes::new(leading, vec![hosted.clone(), infra.clone()]));

        assert_eq!(readyz(State(probes.clone())).await, Readiness::NotReady);
        hosted.cancel();
        assert_eq!(readyz(State(probes.clone())).await, Readiness::NotReady);
        infra.cancel();
        let response = readyz(State(probes)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn standby_replica_is_ready() {
        let leading = CancellationToken::new();
        let probes = Arc::new(Probes::new(
            leading.clone(),
            vec![CancellationToken::new(), CancellationToken::new()],
        ));

        let response = readyz(State(probes.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        // Leadership acquired, but the watches have not listed yet.
        leading.cancel();
        assert_eq!(readyz(State(probes)).await, Readiness::NotReady);
    }

    #[tokio::test]
    async fn not_ready_is_unavailable() {
        let response = Readiness::NotReady.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_are_rendered() {
        let response = render_metrics(State(Arc::new(Metrics::new()))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
