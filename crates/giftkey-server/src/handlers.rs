use std::collections::HashMap;

use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::{
    error::Error,
    gifts::Partition,
    keys::{format_remaining, DeleteOutcome, HeartbeatOutcome, KeyView, VerifyOutcome},
    store::GiftEvent,
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Gifts: ingest ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct GiftQuery {
    pub partition: Option<String>,
    pub limit: Option<usize>,
}

impl GiftQuery {
    fn partition(&self) -> Result<Partition, Error> {
        match &self.partition {
            Some(name) => Partition::client(name.clone()),
            None => Ok(Partition::Global),
        }
    }
}

/// Webhook entry point for the push source. Accepts JSON or form bodies.
pub async fn ingest_gift(
    State(state): State<AppState>,
    Query(query): Query<GiftQuery>,
    request: Request,
) -> Response {
    ingest(&state, query.partition(), request).await
}

pub async fn ingest_partition_gift(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    request: Request,
) -> Response {
    ingest(&state, Partition::client(partition), request).await
}

async fn ingest(state: &AppState, partition: Result<Partition, Error>, request: Request) -> Response {
    let partition = match partition {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    let payload = match read_payload(request).await {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };

    match state.gifts.ingest(&partition, payload, state.clock.now()) {
        Ok(seq) => Json(json!({"status": "ok", "seq": seq})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn read_payload(request: Request) -> Result<Map<String, Value>, Error> {
    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));

    if is_json {
        let Json(payload) = Json::<Map<String, Value>>::from_request(request, &())
            .await
            .map_err(|e| Error::InvalidInput(e.body_text()))?;
        Ok(payload)
    } else {
        let Form(fields) = Form::<HashMap<String, String>>::from_request(request, &())
            .await
            .map_err(|e| Error::InvalidInput(e.body_text()))?;
        Ok(fields
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect())
    }
}

// ── Gifts: drain ──────────────────────────────────────────────────────────────

/// Polling endpoint. Returns the bare payloads, oldest first, and removes them.
pub async fn drain_gifts(State(state): State<AppState>, Query(query): Query<GiftQuery>) -> Response {
    let partition = match query.partition() {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    match state.gifts.drain(&partition, query.limit) {
        Ok(events) => {
            let payloads: Vec<Value> = events.into_iter().map(|e| Value::Object(e.payload)).collect();
            Json(payloads).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub partition: String,
    pub gifts: Vec<GiftEvent>,
    /// Events still waiting after this drain (non-zero when `limit` cut it
    /// short). `None` if the count could not be read; the drained events are
    /// already removed, so they are returned regardless.
    pub pending: Option<usize>,
}

pub async fn drain_partition_gifts(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    Query(query): Query<GiftQuery>,
) -> Response {
    let partition = match Partition::client(partition) {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    let gifts = match state.gifts.drain(&partition, query.limit) {
        Ok(gifts) => gifts,
        Err(e) => return error_response(e),
    };
    let pending = match state.gifts.pending(&partition) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, %partition, "could not count pending gifts");
            None
        }
    };
    Json(DrainResponse {
        partition: partition.to_string(),
        gifts,
        pending,
    })
    .into_response()
}

// ── Gifts: clear ──────────────────────────────────────────────────────────────

pub async fn clear_gifts(State(state): State<AppState>, Query(query): Query<GiftQuery>) -> Response {
    match query.partition().and_then(|p| state.gifts.clear(&p)) {
        Ok(n) => {
            info!(cleared = n, "audit: gifts.clear");
            Json(json!({"status": "cleared", "cleared": n})).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn clear_partition_gifts(
    State(state): State<AppState>,
    Path(partition): Path<String>,
) -> Response {
    match Partition::client(partition).and_then(|p| state.gifts.clear(&p)) {
        Ok(n) => {
            info!(cleared = n, "audit: gifts.clear");
            Json(json!({"status": "cleared", "cleared": n})).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Keys: admin ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateKeyRequest {
    pub id: Option<String>,
    pub duration_days: Option<u32>,
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    let now = state.clock.now();
    let timeout = state.keys.config().liveness_timeout.as_secs() as i64;
    match state.keys.create(body.id, body.duration_days, now) {
        Ok(record) => {
            info!(
                key = %record.id,
                duration_days = record.duration_days,
                "audit: key.create"
            );
            (StatusCode::CREATED, Json(KeyView::project(&record, now, timeout))).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn list_keys(State(state): State<AppState>) -> Response {
    match state.keys.list(state.clock.now()) {
        Ok(keys) => {
            let online = keys.iter().filter(|k| k.online).count();
            Json(json!({ "keys": keys, "total": keys.len(), "online": online })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn describe_key(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.keys.describe(&id, state.clock.now()) {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => error_response(Error::NotFound),
        Err(e) => error_response(e),
    }
}

pub async fn delete_key(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.keys.delete(&id) {
        Ok(DeleteOutcome::Deleted) => {
            info!(key = %id, "audit: key.delete");
            Json(json!({"deleted": true})).into_response()
        }
        Ok(DeleteOutcome::NotFound) => {
            info!(key = %id, "audit: key.delete.not_found");
            error_response(Error::NotFound)
        }
        Err(e) => error_response(e),
    }
}

pub async fn sweep_keys(State(state): State<AppState>) -> Response {
    match state.keys.sweep_expired(state.clock.now()) {
        Ok(n) => {
            info!(removed = n, "audit: key.sweep");
            Json(json!({"removed": n})).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Keys: client ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientKeyRequest {
    pub key: String,
    pub identity: String,
}

impl ClientKeyRequest {
    fn validate(&self) -> Result<(), Error> {
        if self.key.trim().is_empty() || self.identity.trim().is_empty() {
            return Err(Error::InvalidInput("key and identity are required".into()));
        }
        Ok(())
    }
}

pub async fn verify_key(
    State(state): State<AppState>,
    Json(body): Json<ClientKeyRequest>,
) -> Response {
    if let Err(e) = body.validate() {
        return error_response(e);
    }
    let now = state.clock.now();
    let outcome = match state.keys.verify(body.key.trim(), &body.identity, now) {
        Ok(o) => o,
        Err(e) => return error_response(e),
    };

    let expires_at = match outcome {
        VerifyOutcome::ActivatedNow { expires_at } => Some(expires_at),
        VerifyOutcome::ValidSameIdentity { expires_at } => expires_at,
        _ => None,
    };
    let status = match outcome {
        VerifyOutcome::ActivatedNow { .. } | VerifyOutcome::ValidSameIdentity { .. } => {
            StatusCode::OK
        }
        VerifyOutcome::NotFound => StatusCode::NOT_FOUND,
        VerifyOutcome::Expired => StatusCode::GONE,
        VerifyOutcome::RejectedOtherIdentity => StatusCode::CONFLICT,
    };
    if matches!(outcome, VerifyOutcome::ActivatedNow { .. }) {
        info!(key = %body.key, identity = %body.identity, "audit: key.activate");
    }

    (
        status,
        Json(json!({
            "valid": outcome.is_valid(),
            "outcome": outcome.as_str(),
            "expires_at": expires_at,
            "remaining": expires_at.map(|exp| format_remaining(Some((exp - now).max(0)))),
        })),
    )
        .into_response()
}

pub async fn heartbeat_key(
    State(state): State<AppState>,
    Json(body): Json<ClientKeyRequest>,
) -> Response {
    if let Err(e) = body.validate() {
        return error_response(e);
    }
    let outcome = match state
        .keys
        .heartbeat(body.key.trim(), &body.identity, state.clock.now())
    {
        Ok(o) => o,
        Err(e) => return error_response(e),
    };

    let status = match outcome {
        HeartbeatOutcome::Accepted => StatusCode::OK,
        HeartbeatOutcome::NotFound => StatusCode::NOT_FOUND,
        HeartbeatOutcome::Expired => StatusCode::GONE,
        HeartbeatOutcome::NotActivated | HeartbeatOutcome::RejectedOtherIdentity => {
            StatusCode::CONFLICT
        }
    };
    (
        status,
        Json(json!({
            "accepted": outcome == HeartbeatOutcome::Accepted,
            "outcome": outcome.as_str(),
        })),
    )
        .into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Expired => StatusCode::GONE,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    }
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
