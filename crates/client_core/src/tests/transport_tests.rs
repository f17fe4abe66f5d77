use super::*;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use shared::error::{ApiError, ErrorCode};

#[derive(Default)]
struct ServerState {
    hits: AtomicUsize,
    failing: AtomicBool,
}

async fn spawn_server() -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());

    async fn slow(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Json(serde_json::json!({ "ok": true }))
    }

    async fn flaky(
        State(state): State<Arc<ServerState>>,
    ) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        if state.failing.load(Ordering::SeqCst) {
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("induced failure")),
            ))
        } else {
            Ok(Json(serde_json::json!({ "ok": true })))
        }
    }

    async fn missing() -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found("no such thing")),
        )
    }

    let app = Router::new()
        .route("/slow", get(slow))
        .route("/flaky", post(flaky).get(flaky))
        .route("/missing", get(missing))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (format!("http://{addr}"), state)
}

fn transport(base: &str, threshold: u32, cooldown: Duration) -> ResilientTransport {
    ResilientTransport::new(TransportConfig {
        base_url: base.to_string(),
        request_timeout: Duration::from_secs(5),
        failure_threshold: threshold,
        cooldown,
    })
}

#[tokio::test]
async fn concurrent_gets_for_one_path_share_a_single_network_call() {
    let (base, state) = spawn_server().await;
    let transport = transport(&base, 5, Duration::from_secs(30));

    let (a, b, c) = tokio::join!(
        transport.get("/slow"),
        transport.get("/slow"),
        transport.get("/slow")
    );
    assert_eq!(a.expect("a")["ok"], true);
    assert_eq!(b.expect("b")["ok"], true);
    assert_eq!(c.expect("c")["ok"], true);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_gets_each_reach_the_network() {
    let (base, state) = spawn_server().await;
    let transport = transport(&base, 5, Duration::from_secs(30));

    transport.get("/slow").await.expect("first");
    transport.get("/slow").await.expect("second");
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_stops_traffic() {
    let (base, state) = spawn_server().await;
    state.failing.store(true, Ordering::SeqCst);
    let transport = transport(&base, 2, Duration::from_secs(60));
    let body = serde_json::json!({});

    for _ in 0..2 {
        let err = transport.post("/flaky", &body).await.expect_err("failure");
        assert!(matches!(err, TransportError::Api { status: 500, .. }));
    }
    assert_eq!(transport.breaker_state(), BreakerState::Open);

    let refused = transport.post("/flaky", &body).await.expect_err("refused");
    assert!(matches!(refused, TransportError::CircuitOpen));
    // The refusal never left the process.
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn half_open_trial_success_closes_the_breaker() {
    let (base, state) = spawn_server().await;
    state.failing.store(true, Ordering::SeqCst);
    let transport = transport(&base, 1, Duration::ZERO);
    let body = serde_json::json!({});

    transport.post("/flaky", &body).await.expect_err("failure");
    assert_eq!(transport.breaker_state(), BreakerState::Open);

    state.failing.store(false, Ordering::SeqCst);
    transport.post("/flaky", &body).await.expect("trial");
    assert_eq!(transport.breaker_state(), BreakerState::Closed);
}

#[tokio::test]
async fn client_rejections_carry_the_server_error_and_are_permanent() {
    let (base, _state) = spawn_server().await;
    let transport = transport(&base, 5, Duration::from_secs(30));

    let err = transport.get("/missing").await.expect_err("missing");
    match &err {
        TransportError::Api { status, error } => {
            assert_eq!(*status, 404);
            assert_eq!(error.code, ErrorCode::NotFound);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_transient());
    // 4xx responses do not count toward opening the breaker.
    assert_eq!(transport.breaker_state(), BreakerState::Closed);
}
