//! End-to-end data-plane tests: real gateway on an ephemeral port,
//! stub upstream nodes behind it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::IntoResponse,
    Json, Router,
};
use reqwest::Client;
use serde_json::{json, Value};

use gateway_config::GatewayConfig;
use gateway_store::NewApp;
use rpc_gate::{metrics::api_key_hash, pool::Layer, AppState};

// ── Stub upstream ────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorded {
    hits: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<(String, String, Vec<u8>)>>>,
}

impl Recorded {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last(&self) -> Option<(String, String, Vec<u8>)> {
        self.last.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct UpstreamBehavior {
    status: StatusCode,
    response: Value,
    recorded: Recorded,
}

async fn upstream_handler(
    State(st): State<UpstreamBehavior>,
    req: Request,
) -> impl IntoResponse {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    st.recorded.hits.fetch_add(1, Ordering::SeqCst);
    *st.recorded.last.lock().unwrap() = Some((
        parts.method.to_string(),
        parts.uri.path().to_string(),
        bytes.to_vec(),
    ));
    (st.status, Json(st.response.clone()))
}

async fn spawn_upstream(status: StatusCode, response: Value) -> (String, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .fallback(upstream_handler)
        .with_state(UpstreamBehavior {
            status,
            response,
            recorded: recorded.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), recorded)
}

fn rpc_ok() -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "result": "0x10d4f"})
}

// ── Gateway harness ──────────────────────────────────────────────────

async fn gateway_with(
    exec_urls: &[String],
) -> (String, AppState, tokio::task::JoinHandle<()>) {
    let mut vars = vec![("JWT_SECRET".to_string(), "test-secret".to_string())];
    if !exec_urls.is_empty() {
        vars.push((
            "ETHEREUM_EXECUTION_RPC_URL".to_string(),
            exec_urls.join(","),
        ));
    }
    let config = GatewayConfig::from_vars(vars).unwrap();
    let state = AppState::new(config).await;
    let (addr, handle) = rpc_gate::test::spawn(state.clone()).await;
    (format!("http://{addr}"), state, handle)
}

async fn make_app(state: &AppState, max_rps: u32, daily_limit: u64) -> gateway_store::App {
    state
        .store
        .create_app(NewApp {
            owner_user_id: "owner".into(),
            name: "test app".into(),
            description: String::new(),
            chain_name: "ethereum".into(),
            chain_id: 1,
            max_rps,
            daily_requests_limit: daily_limit,
        })
        .await
        .unwrap()
}

fn block_number_body() -> Value {
    json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1})
}

// ── S1: valid dispatch ───────────────────────────────────────────────

#[tokio::test]
async fn valid_dispatch_forwards_body_and_counts() {
    let (up, recorded) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 5, 100).await;
    let http = Client::new();

    let sent = serde_json::to_vec(&block_number_body()).unwrap();
    let resp = http
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .header("content-type", "application/json")
        .body(sent.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("x-endpoint-type").unwrap(),
        "execution"
    );
    assert!(resp.headers().get("x-rpc-gateway").is_some());
    assert!(resp.headers().get("x-response-time").is_some());
    assert!(resp.headers().get("x-correlation-id").is_some());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "0x10d4f");

    // Upstream received the identical body on "/".
    let (method, path, bytes) = recorded.last().unwrap();
    assert_eq!(method, "POST");
    assert_eq!(path, "/");
    assert_eq!(bytes, sent);

    // Counters moved.
    let after = state.store.app(&app.id).await.unwrap().unwrap();
    assert_eq!(after.daily_requests, 1);
    assert_eq!(after.requests, 1);

    // The metric series for this key shows exactly this request.
    let text = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let hash = api_key_hash(&app.api_key);
    let line = text
        .lines()
        .find(|l| {
            l.starts_with("rpc_requests_total")
                && l.contains("chain=\"ethereum\"")
                && l.contains("layer=\"execution\"")
                && l.contains("method=\"eth_blockNumber\"")
                && l.contains("status=\"200\"")
                && l.contains(&hash)
        })
        .expect("series for this request");
    assert!(line.trim_end().ends_with(" 1"), "line: {line}");
}

// ── S2: invalid key ──────────────────────────────────────────────────

#[tokio::test]
async fn invalid_key_is_rejected_without_upstream_call() {
    let (up, recorded) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 5, 100).await;
    let http = Client::new();

    let resp = http
        .post(format!("{base}/ethereum/exec/not-a-real-key/"))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_key");
    assert_eq!(recorded.hits(), 0, "no upstream call");
    let after = state.store.app(&app.id).await.unwrap().unwrap();
    assert_eq!(after.daily_requests, 0, "no counter change");
}

#[tokio::test]
async fn inactive_app_is_rejected() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 5, 100).await;
    state
        .store
        .update_app(
            &app.id,
            gateway_store::AppPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let resp = Client::new()
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "inactive_app");
}

// ── S3: RPS limit ────────────────────────────────────────────────────

#[tokio::test]
async fn rps_limit_admits_five_of_six_concurrent() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 5, 100).await;
    let http = Client::new();

    let requests = (0..6).map(|_| {
        http.post(format!("{base}/ethereum/exec/{}/", app.api_key))
            .json(&block_number_body())
            .send()
    });
    let responses = futures_util::future::join_all(requests).await;

    let mut ok = 0;
    let mut limited = 0;
    for resp in responses {
        let resp = resp.unwrap();
        match resp.status().as_u16() {
            200 => ok += 1,
            429 => {
                let body: Value = resp.json().await.unwrap();
                assert_eq!(body["code"], "rate_limited_rps");
                limited += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(limited, 1);

    let after = state.store.app(&app.id).await.unwrap().unwrap();
    assert_eq!(after.daily_requests, 5, "only admitted requests count");
}

// ── S4: daily limit ──────────────────────────────────────────────────

#[tokio::test]
async fn daily_limit_rejects_and_leaves_counter() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 0, 3).await;
    let http = Client::new();

    for _ in 0..3 {
        let resp = http
            .post(format!("{base}/ethereum/exec/{}/", app.api_key))
            .json(&block_number_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = http
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "rate_limited_daily");

    let after = state.store.app(&app.id).await.unwrap().unwrap();
    assert_eq!(after.daily_requests, 3, "counter unchanged by the rejection");
}

// ── S5: upstream failover ────────────────────────────────────────────

#[tokio::test]
async fn failover_retries_once_and_marks_unhealthy() {
    let (bad, bad_rec) = spawn_upstream(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "overloaded"}),
    )
    .await;
    let (good, _good_rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[bad.clone(), good]).await;
    let app = make_app(&state, 0, 0).await;
    let http = Client::new();

    for _ in 0..6 {
        let resp = http
            .post(format!("{base}/ethereum/exec/{}/", app.api_key))
            .json(&block_number_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "every request lands on the good node");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], "0x10d4f", "response body is from the healthy node");
    }

    assert!(bad_rec.hits() >= 2, "the failing node was attempted");
    let endpoints = state.pool.endpoints("ethereum", Layer::Execution);
    let bad_ep = endpoints.iter().find(|ep| ep.url == bad).unwrap();
    assert!(
        !bad_ep.is_healthy(),
        "two 5xx responses flip the endpoint to unhealthy"
    );
}

#[tokio::test]
async fn all_upstreams_down_is_502_with_attempts() {
    let (bad_a, _) = spawn_upstream(StatusCode::BAD_GATEWAY, json!({"error": 1})).await;
    let (bad_b, _) = spawn_upstream(StatusCode::BAD_GATEWAY, json!({"error": 2})).await;
    let (base, state, _h) = gateway_with(&[bad_a, bad_b]).await;
    let app = make_app(&state, 0, 0).await;

    let resp = Client::new()
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "no_healthy_upstream");
    assert_eq!(body["chain"], "ethereum");
    assert_eq!(body["layer"], "execution");
    assert_eq!(body["attempted"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn upstream_4xx_passes_through_without_failover() {
    let (up, rec) = spawn_upstream(
        StatusCode::BAD_REQUEST,
        json!({"jsonrpc": "2.0", "error": {"code": -32600, "message": "invalid request"}}),
    )
    .await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 0, 0).await;

    let resp = Client::new()
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(rec.hits(), 1, "no retry on a 4xx");
}

// ── S6: unknown chain / bad layer / missing key ──────────────────────

#[tokio::test]
async fn unknown_chain_is_404() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 0, 0).await;

    let resp = Client::new()
        .get(format!(
            "{base}/solana/cons/{}/eth/v1/node/health",
            app.api_key
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unknown_chain");
}

#[tokio::test]
async fn missing_api_key_is_400() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, _state, _h) = gateway_with(&[up]).await;

    let resp = Client::new()
        .post(format!("{base}/ethereum/exec"))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "missing_api_key");
}

#[tokio::test]
async fn unknown_layer_is_404() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 0, 0).await;

    let resp = Client::new()
        .post(format!("{base}/ethereum/ws/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn disabled_chain_is_503() {
    let (up, _rec) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let (base, state, _h) = gateway_with(&[up]).await;
    let app = make_app(&state, 0, 0).await;
    let chain = state
        .store
        .chain_by_name("ethereum")
        .await
        .unwrap()
        .unwrap();
    state
        .store
        .update_chain(
            chain.chain_id,
            gateway_store::ChainPatch {
                description: None,
                is_enabled: Some(false),
            },
        )
        .await
        .unwrap();

    let resp = Client::new()
        .post(format!("{base}/ethereum/exec/{}/", app.api_key))
        .json(&block_number_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "chain_disabled");
}

// ── S7: metrics aggregation via chain health ─────────────────────────

#[tokio::test]
async fn chain_health_merges_partial_scrape_failures() {
    let (prom_ok, _rec) = spawn_upstream(StatusCode::OK, json!(null)).await;
    // A closed port: connection refused, not a slow timeout.
    let dead = "http://127.0.0.1:9".to_string();

    let (exec, _) = spawn_upstream(StatusCode::OK, rpc_ok()).await;
    let vars = vec![
        ("JWT_SECRET".to_string(), "test-secret".to_string()),
        ("ETHEREUM_EXECUTION_RPC_URL".to_string(), exec),
        (
            "ETHEREUM_PROMETHEUS_URL".to_string(),
            format!("{dead},{prom_ok}"),
        ),
    ];
    let config = GatewayConfig::from_vars(vars).unwrap();
    let state = AppState::new(config).await;
    let (addr, _h) = rpc_gate::test::spawn(state.clone()).await;
    let base = format!("http://{addr}");

    let resp = Client::new()
        .get(format!("{base}/health/ethereum"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["chain"], "ethereum");
    assert_eq!(body["metrics"]["total_nodes"], 2);
    assert_eq!(body["metrics"]["available_nodes"], 1);
    let nodes = body["metrics"]["nodes"].as_array().unwrap();
    assert_eq!(nodes[0]["status"], "unavailable");
    assert!(nodes[0]["error"].is_string());
    assert_eq!(nodes[1]["status"], "available");
    assert_eq!(body["execution"]["status"], "healthy");
    assert_eq!(body["overall"], "healthy");
}

#[tokio::test]
async fn chain_health_unknown_chain_is_404() {
    let (base, _state, _h) = gateway_with(&[]).await;
    let resp = Client::new()
        .get(format!("{base}/health/solana"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Consensus layer pass-through ─────────────────────────────────────

#[tokio::test]
async fn consensus_requests_are_forwarded_with_path_and_query() {
    let (up, rec) = spawn_upstream(StatusCode::OK, json!({"data": {"head_slot": "123"}})).await;
    let vars = vec![
        ("JWT_SECRET".to_string(), "test-secret".to_string()),
        ("ETHEREUM_CONSENSUS_API_URL".to_string(), up),
    ];
    let config = GatewayConfig::from_vars(vars).unwrap();
    let state = AppState::new(config).await;
    let (addr, _h) = rpc_gate::test::spawn(state.clone()).await;
    let app = make_app(&state, 0, 0).await;

    let resp = Client::new()
        .get(format!(
            "http://{addr}/ethereum/cons/{}/eth/v1/node/syncing?format=json",
            app.api_key
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-endpoint-type").unwrap(), "consensus");

    let (method, path, _body) = rec.last().unwrap();
    assert_eq!(method, "GET");
    assert_eq!(path, "/eth/v1/node/syncing");
}

// ── Gateway self-health ──────────────────────────────────────────────

#[tokio::test]
async fn self_health_reports_services() {
    let (base, _state, _h) = gateway_with(&[]).await;
    let body: Value = Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"]["database"], "ok");
    assert!(body["services"]["uptime_seconds"].is_number());
}
