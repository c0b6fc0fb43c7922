//! HTTP gateway routes over an in-process cluster

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use ringkv::common::{ClientConfig, Op};
use ringkv::coordinator::http::{create_router, GatewayState};
use ringkv::LocalCluster;
use serde_json::Value;
use std::sync::Arc;
use tokio_test::assert_ok;
use tower::ServiceExt;

fn gateway(cluster: &LocalCluster, config: ClientConfig) -> Router {
    let client = assert_ok!(cluster.client(config));
    create_router(GatewayState::new(Arc::new(client)))
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    body: &'static [u8],
) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_put_get_delete() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());

    let (status, body) = call(&router, "PUT", "/kv/users/alice", b"hello").await;
    assert_eq!(status, StatusCode::OK);
    let acks = json(&body);
    assert_eq!(acks["acknowledged"], 3);
    assert_eq!(acks["replicas"], 3);
    assert_eq!(acks["slots"], serde_json::json!([true, true, true]));

    let (status, body) = call(&router, "GET", "/kv/users/alice", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello");

    let (status, _) = call(&router, "DELETE", "/kv/users/alice", b"").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, "GET", "/kv/users/alice", b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json(&body)["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_put_reports_absent_slots() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());
    cluster.set_reachable("node-0", false).unwrap();
    cluster.set_reachable("node-1", false).unwrap();

    let (status, body) = call(&router, "PUT", "/kv/users/bob", b"b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["acknowledged"], 1);
}

#[tokio::test]
async fn test_empty_value_is_bad_request() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());

    let (status, body) = call(&router, "PUT", "/kv/users/empty", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["error"].is_string());
    assert_eq!(cluster.total_requests(Op::Write), 0);
}

#[tokio::test]
async fn test_stream_and_aggregate() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());
    call(&router, "PUT", "/kv/events/a", b"1").await;
    call(&router, "PUT", "/kv/events/b", b"2").await;

    // "b" is 0x62
    let (status, body) = call(&router, "GET", "/stream/events?offset=62", b"").await;
    assert_eq!(status, StatusCode::OK);
    let streamed = json(&body);
    assert_eq!(streamed["truncated"], false);
    assert_eq!(streamed["records"].as_array().unwrap().len(), 1);
    assert_eq!(streamed["records"][0]["key"], "Yg==");
    assert_eq!(streamed["records"][0]["value"], "Mg==");

    let (status, body) = call(&router, "GET", "/aggregate/events", b"").await;
    assert_eq!(status, StatusCode::OK);
    let aggregated = json(&body);
    assert_eq!(aggregated["contributors"], 3);
    assert_eq!(aggregated["dropped"], 0);
    assert_eq!(aggregated["records"].as_array().unwrap().len(), 6);

    let (status, _) = call(&router, "GET", "/stream/events?offset=zz", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_drop_column_family() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());
    call(&router, "PUT", "/kv/tmp/a", b"1").await;

    let (status, body) = call(&router, "DELETE", "/kv/tmp", b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["acknowledged"], 3);

    let (_, body) = call(&router, "GET", "/stream/tmp", b"").await;
    assert_eq!(json(&body)["records"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_append_buffers_then_flushes() {
    let cluster = LocalCluster::with_nodes(3);
    let config = ClientConfig {
        append_flush_threshold: 10,
        ..ClientConfig::default()
    };
    let router = gateway(&cluster, config);

    let (status, body) = call(&router, "POST", "/append/cpu?cf=metrics", b"0.5").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let buffered = json(&body);
    assert_eq!(buffered["status"], "buffered");
    assert_eq!(buffered["pending_bytes"], 6);

    let (status, body) = call(&router, "POST", "/append/cpu?cf=metrics", b"0.7").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let flushed = json(&body);
    assert_eq!(flushed["status"], "flushed");
    assert_eq!(flushed["acks"]["acknowledged"], 3);
    assert_eq!(cluster.total_requests(Op::TsWrite), 3);
}

#[tokio::test(start_paused = true)]
async fn test_members_replicas_health_metrics() {
    let cluster = LocalCluster::with_nodes(3);
    let router = gateway(&cluster, ClientConfig::default());

    let (_, body) = call(&router, "GET", "/members", b"").await;
    assert_eq!(
        json(&body)["members"],
        serde_json::json!(["node-0", "node-1", "node-2"])
    );

    let (_, body) = call(&router, "GET", "/replicas/users", b"").await;
    let placed = json(&body);
    assert_eq!(placed["routing_key"], "users");
    assert_eq!(placed["replicas"].as_array().unwrap().len(), 3);

    let (status, body) = call(&router, "GET", "/health", b"").await;
    assert_eq!(status, StatusCode::OK);
    let health = json(&body);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["members"], 3);
    assert_eq!(health["replicas"], 3);

    call(&router, "GET", "/kv/users/nobody", b"").await;
    let (status, body) = call(&router, "GET", "/metrics", b"").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("ringkv_requests_sent_total 1"));
    assert!(text.contains("# TYPE ringkv_pending_requests gauge"));
}

#[tokio::test]
async fn test_health_degraded_without_members() {
    let cluster = LocalCluster::with_nodes(1);
    let router = gateway(&cluster, ClientConfig::default());
    cluster.deregister("node-0").unwrap();

    let (_, body) = call(&router, "GET", "/health", b"").await;
    assert_eq!(json(&body)["status"], "degraded");

    let (status, _) = call(&router, "GET", "/kv/users/alice", b"").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
