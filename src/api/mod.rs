use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ApiConfig;
use crate::metric::{ApiResponse, MetricRequest, PathRequest, Status};

/// Shared state for axum handlers.
struct AppState {
    paths_tx: mpsc::Sender<PathRequest>,
    queries_tx: mpsc::Sender<MetricRequest>,
    request_timeout: Duration,
}

/// Starts the HTTP query API. Requests are bridged onto the resolver and
/// query channels; each carries a one-shot reply channel that is dropped
/// if the request times out, so responders must treat delivery as best
/// effort.
pub async fn start(
    cfg: &ApiConfig,
    paths_tx: mpsc::Sender<PathRequest>,
    queries_tx: mpsc::Sender<MetricRequest>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("binding api listener on {}", cfg.addr))?;

    info!(addr = %listener.local_addr().context("getting local address")?, "api server started");

    Ok(spawn(
        listener,
        paths_tx,
        queries_tx,
        cfg.request_timeout,
        cancel,
    ))
}

fn spawn(
    listener: TcpListener,
    paths_tx: mpsc::Sender<PathRequest>,
    queries_tx: mpsc::Sender<MetricRequest>,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let state = Arc::new(AppState {
        paths_tx,
        queries_tx,
        request_timeout,
    });

    let app = Router::new()
        .route("/paths", get(paths_handler))
        .route("/metrics", get(metrics_handler).delete(metrics_delete_handler))
        .with_state(state);

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

        if let Err(e) = result {
            error!(error = %e, "api server error");
        }
    })
}

#[derive(Deserialize)]
struct PathsParams {
    query: Option<String>,
}

/// GET /paths?query=<pattern> - wildcard path discovery.
async fn paths_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PathsParams>,
) -> Response {
    let Some(query) = params.query.filter(|q| !q.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "no query specified").into_response();
    };

    let (reply, response) = oneshot::channel();
    if state
        .paths_tx
        .send(PathRequest { query, reply })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "resolver unavailable").into_response();
    }

    match timeout(state.request_timeout, response).await {
        Ok(Ok(payload)) => (
            [(header::CONTENT_TYPE, "application/json")],
            payload,
        )
            .into_response(),
        Ok(Err(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "resolver dropped request").into_response()
        }
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "path query timed out").into_response(),
    }
}

/// GET /metrics?path=<p>&path=<p>&from=<epoch>&to=<epoch> - range read.
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let mut from = 0i64;
    let mut to = epoch_seconds(SystemTime::now());
    let mut query = Vec::new();

    for (key, value) in params {
        match key.as_str() {
            "from" => match value.parse() {
                Ok(v) => from = v,
                Err(_) => {
                    return (StatusCode::BAD_REQUEST, "unparseable from").into_response();
                }
            },
            "to" => match value.parse() {
                Ok(v) => to = v,
                Err(_) => {
                    return (StatusCode::BAD_REQUEST, "unparseable to").into_response();
                }
            },
            "path" => query.push(value),
            _ => {}
        }
    }

    dispatch_metric_request(&state, from, to, "get", query).await
}

/// DELETE /metrics - accepted and acknowledged as a no-op.
async fn metrics_delete_handler(State(state): State<Arc<AppState>>) -> Response {
    dispatch_metric_request(&state, 0, 0, "delete", vec![String::new()]).await
}

async fn dispatch_metric_request(
    state: &AppState,
    from: i64,
    to: i64,
    method: &str,
    query: Vec<String>,
) -> Response {
    let (reply, response) = oneshot::channel();
    let request = MetricRequest {
        from,
        to,
        method: method.to_string(),
        query,
        reply,
    };

    if state.queries_tx.send(request).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "store manager unavailable").into_response();
    }

    match timeout(state.request_timeout, response).await {
        Ok(Ok(envelope)) => envelope_response(envelope),
        Ok(Err(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "store dropped request").into_response()
        }
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "metric query timed out").into_response(),
    }
}

/// Maps a response envelope onto an HTTP response.
fn envelope_response(envelope: ApiResponse) -> Response {
    match envelope.status {
        Status::Ok => (
            [(header::CONTENT_TYPE, "application/json")],
            envelope.payload,
        )
            .into_response(),
        Status::BadRequest => (StatusCode::BAD_REQUEST, envelope.message).into_response(),
        Status::Error => (StatusCode::INTERNAL_SERVER_ERROR, envelope.message).into_response(),
    }
}

fn epoch_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    /// Raw HTTP/1.1 round trip against the served socket.
    async fn http_get(addr: std::net::SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(
                format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .expect("write request");

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        response
    }

    async fn serve() -> (
        std::net::SocketAddr,
        mpsc::Receiver<PathRequest>,
        mpsc::Receiver<MetricRequest>,
        CancellationToken,
    ) {
        let (paths_tx, paths_rx) = mpsc::channel(4);
        let (queries_tx, queries_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        spawn(
            listener,
            paths_tx,
            queries_tx,
            Duration::from_secs(1),
            cancel.clone(),
        );

        (addr, paths_rx, queries_rx, cancel)
    }

    #[tokio::test]
    async fn test_paths_round_trip() {
        let (addr, mut paths_rx, _queries_rx, cancel) = serve().await;

        // Scripted resolver: echo a fixed payload.
        tokio::spawn(async move {
            let request = paths_rx.recv().await.expect("request");
            assert_eq!(request.query, "a.b.*");
            let _ = request.reply.send(b"[{\"path\":\"a.b.c\"}]".to_vec());
        });

        let response = http_get(addr, "/paths?query=a.b.*").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("a.b.c"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_paths_without_query_is_bad_request() {
        let (addr, _paths_rx, _queries_rx, cancel) = serve().await;

        let response = http_get(addr, "/paths").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_metrics_collects_repeated_path_params() {
        let (addr, _paths_rx, mut queries_rx, cancel) = serve().await;

        tokio::spawn(async move {
            let request = queries_rx.recv().await.expect("request");
            assert_eq!(request.method, "get");
            assert_eq!(request.from, 100);
            assert_eq!(request.to, 200);
            assert_eq!(request.query, vec!["a.b", "a.c"]);
            let _ = request.reply.send(ApiResponse::ok(b"{}".to_vec()));
        });

        let response =
            http_get(addr, "/metrics?from=100&to=200&path=a.b&path=a.c").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_request_envelope_maps_to_http_400() {
        let (addr, _paths_rx, mut queries_rx, cancel) = serve().await;

        tokio::spawn(async move {
            let request = queries_rx.recv().await.expect("request");
            let _ = request
                .reply
                .send(ApiResponse::bad_request("no query specified"));
        });

        let response = http_get(addr, "/metrics?from=100").await;
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("no query specified"));

        cancel.cancel();
    }
}
