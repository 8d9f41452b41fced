use std::net::IpAddr;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, error};

use super::{ApiError, AppState};
use crate::codec::{self, ENCRYPTED_HEADER, HASH_HEADER, REAL_IP_HEADER};
use crate::metric::wire::{self, MetricJson};
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::storage::{Storage, StorageError};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";
const HTML: &str = "text/html; charset=utf-8";

/// Builds the collector routes over `state`.
pub fn router<S: Storage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/", get(list_page::<S>))
        .route("/ping", get(ping::<S>))
        .route("/update/", post(update_json::<S>))
        .route("/update/:kind/:name/:value", post(update_text::<S>))
        .route("/updates/", post(update_batch::<S>))
        .route("/value/", post(value_json::<S>))
        .route("/value/:kind/:name", get(value_text::<S>))
        .with_state(state)
}

// --- Inbound pipeline ---

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Rejects agents outside the trusted subnet.
fn check_subnet<S>(state: &AppState<S>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(subnet) = &state.subnet else {
        return Ok(());
    };

    let ip: IpAddr = header_str(headers, REAL_IP_HEADER)
        .ok_or_else(|| ApiError::Forbidden(format!("missing {REAL_IP_HEADER}")))?
        .trim()
        .parse()
        .map_err(|_| ApiError::Forbidden(format!("malformed {REAL_IP_HEADER}")))?;

    if !subnet.contains(ip) {
        return Err(ApiError::Forbidden(format!("{ip} is outside {subnet}")));
    }

    Ok(())
}

/// Decrypts, decompresses and verifies a request body, in that order.
fn decode_body<S>(
    state: &AppState<S>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let mut data = body.to_vec();

    if let Some(decryptor) = &state.decryptor {
        if headers.contains_key(ENCRYPTED_HEADER) {
            data = decryptor.decrypt(&data)?;
        }
    }

    let gzip = header_str(headers, CONTENT_ENCODING.as_str())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if gzip {
        data = codec::gzip_decompress(&data)?;
    }

    if !state.key.is_empty() {
        if let Some(signature) = header_str(headers, HASH_HEADER) {
            codec::verify(&state.key, &data, signature)?;
        }
    }

    Ok(data)
}

/// 200 response, signed with `HashSHA256` when a key is configured.
fn respond<S>(
    state: &AppState<S>,
    content_type: &'static str,
    body: Vec<u8>,
) -> Result<Response, ApiError> {
    let signature = if state.key.is_empty() {
        None
    } else {
        Some(codec::sign(&state.key, &body)?)
    };

    let mut resp = (StatusCode::OK, body).into_response();
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    if let Some(signature) = signature {
        let value = HeaderValue::from_str(&signature)
            .map_err(|e| ApiError::BadRequest(format!("signature header: {e}")))?;
        headers.insert(HASH_HEADER, value);
    }

    Ok(resp)
}

fn respond_json<S>(state: &AppState<S>, metric: &Metric) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(&MetricJson::from(metric))
        .map_err(|e| ApiError::BadRequest(format!("encoding response: {e}")))?;
    respond(state, JSON, body)
}

fn record_updates<S>(state: &AppState<S>, batch: &[Metric]) {
    if let Some(h) = &state.health {
        for m in batch {
            h.server_updates.with_label_values(&[m.kind().as_str()]).inc();
        }
    }
}

fn record_storage_error<S>(state: &AppState<S>, operation: &str, err: &StorageError) {
    if err.is_not_found() || err.is_client_error() {
        return;
    }
    if let Some(h) = &state.health {
        h.storage_errors.with_label_values(&[operation]).inc();
    }
}

// --- Handlers ---

/// POST /update/:kind/:name/:value
async fn update_text<S: Storage>(
    State(state): State<AppState<S>>,
    Path((kind, name, raw)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_subnet(&state, &headers)?;

    let kind: MetricKind = kind.parse()?;
    let metric = Metric {
        name,
        value: MetricValue::parse(kind, &raw)?,
    };
    metric.validate()?;

    let stored = state.storage.update(&metric).await.inspect_err(|e| {
        record_storage_error(&state, "update", e);
    })?;
    record_updates(&state, std::slice::from_ref(&metric));

    respond(&state, TEXT, stored.value.to_string().into_bytes())
}

/// POST /update/
async fn update_json<S: Storage>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_subnet(&state, &headers)?;
    let data = decode_body(&state, &headers, body)?;
    let metric = wire::decode_one(&data)?;

    let stored = state.storage.update(&metric).await.inspect_err(|e| {
        record_storage_error(&state, "update", e);
    })?;
    record_updates(&state, std::slice::from_ref(&metric));

    respond_json(&state, &stored)
}

/// POST /updates/
async fn update_batch<S: Storage>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_subnet(&state, &headers)?;
    let data = decode_body(&state, &headers, body)?;
    let batch = wire::decode_batch(&data)?;

    if let Some(h) = &state.health {
        h.batch_size.observe(batch.len() as f64);
    }

    state.storage.add_batch(&batch).await.inspect_err(|e| {
        record_storage_error(&state, "add_batch", e);
    })?;
    record_updates(&state, &batch);

    debug!(metrics = batch.len(), "applied batch");

    respond(&state, JSON, Vec::new())
}

/// POST /value/
async fn value_json<S: Storage>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let data = decode_body(&state, &headers, body)?;
    let lookup: MetricJson = serde_json::from_slice(&data)
        .map_err(|e| ApiError::BadRequest(format!("malformed lookup: {e}")))?;
    let kind = lookup.metric_kind()?;

    let stored = state.storage.get(&lookup.id, kind).await.inspect_err(|e| {
        record_storage_error(&state, "get", e);
    })?;

    respond_json(&state, &stored)
}

/// GET /value/:kind/:name
async fn value_text<S: Storage>(
    State(state): State<AppState<S>>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let kind: MetricKind = kind.parse()?;

    let stored = state.storage.get(&name, kind).await.inspect_err(|e| {
        record_storage_error(&state, "get", e);
    })?;

    respond(&state, TEXT, stored.value.to_string().into_bytes())
}

/// GET /
async fn list_page<S: Storage>(State(state): State<AppState<S>>) -> Result<Response, ApiError> {
    let metrics = state.storage.list().await.inspect_err(|e| {
        record_storage_error(&state, "list", e);
    })?;

    let mut html =
        String::from("<!DOCTYPE html>\n<html><head><title>Metrics</title></head><body>\n<ul>\n");
    for m in &metrics {
        html.push_str(&format!(
            "<li>{} ({}): {}</li>\n",
            escape_html(&m.name),
            m.kind(),
            m.value
        ));
    }
    html.push_str("</ul>\n</body></html>\n");

    respond(&state, HTML, html.into_bytes())
}

/// GET /ping
async fn ping<S: Storage>(State(state): State<AppState<S>>) -> StatusCode {
    match state.storage.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(backend = state.storage.name(), error = %e, "storage ping failed");
            record_storage_error(&state, "ping", &e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
