//! HTTP gateway over the replication client
//!
//! Keys and column family names travel as UTF-8 path segments; stream
//! records come back as JSON with base64 keys and values. Write-style calls
//! report every replica slot and leave it to the caller to decide whether
//! enough of them acknowledged.

use crate::common::Error;
use crate::coordinator::client::{AppendAck, ReplicaAcks, ReplicationClient};
use crate::coordinator::pool::Connector;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct GatewayState<C: Connector> {
    pub client: Arc<ReplicationClient<C>>,
}

impl<C: Connector> Clone for GatewayState<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<C: Connector> GatewayState<C> {
    pub fn new(client: Arc<ReplicationClient<C>>) -> Self {
        Self { client }
    }
}

/// Error wrapper that renders as a JSON body with the mapped status code
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Hex-encoded start key
    pub offset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppendQuery {
    pub cf: Option<String>,
}

pub fn create_router<C: Connector>(state: GatewayState<C>) -> Router {
    Router::new()
        .route(
            "/kv/:cf/:key",
            get(get_value::<C>)
                .put(put_value::<C>)
                .delete(delete_value::<C>),
        )
        .route("/kv/:cf", delete(drop_column_family::<C>))
        .route("/stream/:cf", get(stream::<C>))
        .route("/aggregate/:cf", get(aggregate::<C>))
        .route("/append/:key", post(append::<C>))
        .route("/replicas/:routing_key", get(replicas::<C>))
        .route("/members", get(members::<C>))
        .route("/metrics", get(metrics::<C>))
        .route("/health", get(health::<C>))
        .with_state(state)
}

fn acks_json(acks: &ReplicaAcks) -> Value {
    json!({
        "acknowledged": acks.acknowledged(),
        "replicas": acks.len(),
        "slots": acks.slots().iter().map(Option::is_some).collect::<Vec<_>>(),
    })
}

fn decode_offset(offset: Option<&str>) -> ApiResult<Option<Vec<u8>>> {
    offset
        .map(|hex_offset| {
            hex::decode(hex_offset)
                .map_err(|e| ApiError(Error::InvalidArgument(format!("offset: {}", e))))
        })
        .transpose()
}

fn record_json(key: &[u8], value: &[u8]) -> Value {
    json!({
        "key": BASE64.encode(key),
        "value": BASE64.encode(value),
    })
}

async fn put_value<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path((cf, key)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let acks = state
        .client
        .write(cf.as_bytes(), key.as_bytes(), &body)
        .await?;
    Ok(Json(acks_json(&acks)))
}

async fn get_value<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path((cf, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    match state.client.read(cf.as_bytes(), key.as_bytes()).await? {
        Some(value) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            value,
        )
            .into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{}/{} not found", cf, key) })),
        )
            .into_response()),
    }
}

async fn delete_value<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path((cf, key)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let acks = state.client.delete(cf.as_bytes(), key.as_bytes()).await?;
    Ok(Json(acks_json(&acks)))
}

async fn drop_column_family<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path(cf): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let acks = state.client.delete_column_family(cf.as_bytes()).await?;
    Ok(Json(acks_json(&acks)))
}

async fn stream<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path(cf): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<impl IntoResponse> {
    let offset = decode_offset(query.offset.as_deref())?;
    let mut records = state.client.stream(cf.as_bytes(), offset.as_deref()).await?;
    let body: Vec<Value> = records
        .by_ref()
        .map(|record| record_json(&record.key, &record.value))
        .collect();
    Ok(Json(json!({
        "records": body,
        "truncated": records.is_corrupted(),
    })))
}

async fn aggregate<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path(cf): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<impl IntoResponse> {
    let offset = decode_offset(query.offset.as_deref())?;
    let aggregated = state
        .client
        .aggregated_stream(Some(cf.as_bytes()), offset.as_deref())
        .await?;
    let (contributors, dropped) = (aggregated.contributors(), aggregated.dropped());
    let body: Vec<Value> = aggregated
        .map(|record| record_json(&record.key, &record.value))
        .collect();
    Ok(Json(json!({
        "records": body,
        "contributors": contributors,
        "dropped": dropped,
    })))
}

async fn append<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path(key): Path<String>,
    Query(query): Query<AppendQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let ack = state
        .client
        .append(key.as_bytes(), &body, query.cf.as_deref().map(str::as_bytes))
        .await?;
    let body = match ack {
        AppendAck::Buffered { pending_bytes } => json!({
            "status": "buffered",
            "pending_bytes": pending_bytes,
        }),
        AppendAck::Flushed(acks) => json!({
            "status": "flushed",
            "acks": acks_json(&acks),
        }),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn replicas<C: Connector>(
    State(state): State<GatewayState<C>>,
    Path(routing_key): Path<String>,
) -> impl IntoResponse {
    let replicas = state.client.replicas_for(routing_key.as_bytes());
    Json(json!({
        "routing_key": routing_key,
        "replicas": replicas.as_slice(),
    }))
}

async fn members<C: Connector>(State(state): State<GatewayState<C>>) -> impl IntoResponse {
    Json(json!({ "members": state.client.members() }))
}

async fn metrics<C: Connector>(State(state): State<GatewayState<C>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.client.metrics().to_prometheus(),
    )
}

/// Health check endpoint for the gateway and its view of the cluster.
async fn health<C: Connector>(State(state): State<GatewayState<C>>) -> impl IntoResponse {
    let members = state.client.members().len();
    let status = if members == 0 { "degraded" } else { "healthy" };
    Json(json!({
        "status": status,
        "members": members,
        "replicas": state.client.config().replicas,
        "pending_requests": state.client.pending_requests(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
