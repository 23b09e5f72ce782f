use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{default_registry, TextEncoder};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::EventHubCheckpoint;
use crate::errors::JoinerError;

struct State {
    checkpoints: watch::Receiver<EventHubCheckpoint>,
}

/// Serve `/metrics` and `/checkpoint` on `port` until `cancel` fires.
pub async fn run_webserver(
    port: u16,
    checkpoints: watch::Receiver<EventHubCheckpoint>,
    cancel: CancellationToken,
) -> Result<(), JoinerError> {
    let shared_state = Arc::new(State { checkpoints });

    let app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/checkpoint", get(get_checkpoint))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting joiner API server on {addr:?}");

    axum::Server::try_bind(&addr)
        .map_err(|err| {
            JoinerError::Telemetry(format!("unable to bind local webserver at port {port}: {err}"))
        })?
        .serve(app.into_make_service())
        .with_graceful_shutdown(cancel.cancelled())
        .await
        .map_err(|err| JoinerError::Telemetry(format!("local webserver at port {port} failed: {err}")))
}

fn render_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&default_registry().gather())
}

async fn get_metrics() -> Response {
    match render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn get_checkpoint(Extension(state): Extension<Arc<State>>) -> Response {
    // Clone out of the watch so the lock is not held while encoding.
    let checkpoint = state.checkpoints.borrow().clone();
    match checkpoint.to_json() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[test]
fn metrics_render_as_prometheus_text() {
    let metrics = crate::metrics::JoinerMetrics::new();
    metrics
        .merged_batches
        .add(1, &[opentelemetry::KeyValue::new("stream", "interaction")]);
    assert!(render_metrics().is_ok());
}

#[tokio::test]
async fn checkpoint_endpoint_serves_latest() {
    let mut checkpoint = EventHubCheckpoint::default();
    checkpoint
        .advance(&crate::model::PartitionId::from("0"), 7, crate::model::ts(0))
        .unwrap();
    let (_tx, rx) = watch::channel(checkpoint);
    let response = get_checkpoint(Extension(Arc::new(State { checkpoints: rx }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn server_stops_on_cancel() {
    let (_tx, rx) = watch::channel(EventHubCheckpoint::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    // Port 0 binds any free port; the server exits right away.
    run_webserver(0, rx, cancel).await.unwrap();
}
