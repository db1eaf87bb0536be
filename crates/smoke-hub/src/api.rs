use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::{
    channel::{ChannelError, LocalChannels},
    error::{DataEnvelope, ErrorEnvelope, RelayError, FALLBACK_ERROR_BODY},
    identity::RemoteBinding,
    metrics::HubMetrics,
    rate_limit::RateLimiter,
    relay::Relay,
};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub channels: LocalChannels,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<HubMetrics>,
    pub binding: RemoteBinding,
    pub shutdown: watch::Receiver<bool>,
}

pub fn create_router(state: AppState, max_body_size: usize) -> Router {
    Router::new()
        .route("/connect", get(connect).post(connect))
        .route("/forward", post(forward))
        .route("/channel/:token", get(open_channel))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Pretty-printed JSON with the given status. Falls back to the canned 600
/// envelope when `body` cannot be serialized.
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec_pretty(body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(e) => {
            warn!("Failed to serialize response envelope: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "application/json")],
                FALLBACK_ERROR_BODY,
            )
                .into_response()
        }
    }
}

fn data_response<T: Serialize>(data: T) -> Response {
    json_response(StatusCode::OK, &DataEnvelope { data })
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::from(self.code());
        match self {
            RelayError::RateLimited { retry_after } => {
                let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, &envelope);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            _ => json_response(StatusCode::INTERNAL_SERVER_ERROR, &envelope),
        }
    }
}

fn reject(state: &AppState, remote_addr: &str, err: RelayError) -> Response {
    warn!("Request from {} failed with {}: {}", remote_addr, err.code().code(), err);
    state.metrics.record_error(err.code());
    err.into_response()
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, Accept, X-Requested-With, Content-Type"),
    );
    response
}

// GET|POST /connect
pub async fn connect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let start = Instant::now();
    let remote_addr = state.binding.remote_addr(peer);

    if let Err(retry_after) = state.rate_limiter.check_connect(peer.ip()).await {
        state.metrics.rate_limit_hits.inc();
        return reject(&state, &remote_addr, RelayError::RateLimited { retry_after });
    }

    let response = match state.relay.connect(&remote_addr).await {
        Ok(connected) => data_response(connected),
        Err(e) => reject(&state, &remote_addr, e),
    };

    state.metrics.open_channels.set(state.channels.len() as f64);
    state.metrics.request_latency.observe(start.elapsed().as_secs_f64());
    response
}

// POST /forward
pub async fn forward(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let start = Instant::now();
    let remote_addr = state.binding.remote_addr(peer);

    let result = match body {
        Ok(body) => state.relay.forward(&body, &remote_addr).await,
        Err(rejection) => Err(RelayError::HttpStream(rejection.body_text())),
    };

    let response = match result {
        Ok(forwarded) => data_response(forwarded),
        Err(e) => reject(&state, &remote_addr, e),
    };

    state.metrics.request_latency.observe(start.elapsed().as_secs_f64());
    response
}

// GET /channel/:token
pub async fn open_channel(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    if *state.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    let subscription = match state.channels.subscribe(&token, state.shutdown.clone()) {
        Ok(subscription) => subscription,
        Err(ChannelError::AlreadyOpen) => {
            return (StatusCode::CONFLICT, "channel already open").into_response();
        }
        Err(_) => return (StatusCode::NOT_FOUND, "unknown channel").into_response(),
    };
    debug!("Streaming channel for {}", subscription.address());

    let events = subscription
        .map(|payload| Ok::<_, Infallible>(Event::default().event("message").data(payload)));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

// GET /health
pub async fn get_health() -> Response {
    let response = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, axum::Json(response)).into_response()
}

// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to export metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope_status_and_body() {
        let err = RelayError::IdentityVerification {
            issued_to: "1.2.3.4:9".into(),
            presented_from: "5.6.7.8:9".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], 804);
        assert_eq!(
            json["error"]["message"],
            ErrorCode::ForwardIdentityVerificationError.message()
        );
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = RelayError::RateLimited { retry_after: 17 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
        assert_eq!(body_json(response).await["error"]["code"], 600);
    }

    #[tokio::test]
    async fn test_data_envelope_is_pretty_printed() {
        let response = data_response(crate::relay::ForwardResponse { ok: true });
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains('\n'));
        let json: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(json["data"]["ok"], true);
    }
}
