//! Proxy engine (C7, §4.7): the hot-path request orchestrator. Route
//! resolution, proxy-key auth, the retry loop across keys, streaming vs.
//! buffered forwarding, and error classification all live here.
//!
//! The streaming path pipes upstream bytes straight into the response body
//! (`Body::from_stream` over a mapped `bytes_stream`) rather than buffering,
//! and the retry loop iterates over one group's weighted upstream pool
//! instead of a fixed fallback chain.

pub mod error;

use std::collections::HashMap;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;

use crate::channels::{BaseChannel, Channel};
use crate::db::request_logs::NewRequestLog;
use crate::groups::Group;
use crate::state::AppState;

use self::error::{AttemptRecord, ProxyError};

/// Above this many bytes we stop trying to buffer+JSON-parse the inbound
/// body for stream-flag detection and `param_overrides` merging (§4.7 step
/// 3); headers-based stream detection (`Accept`, path suffix) still applies,
/// but replay across retries is not possible for a body we never buffered,
/// so such requests get exactly one attempt.
const BODY_PREREAD_LIMIT: usize = 10 * 1024 * 1024;

const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &["cookie", "x-real-ip", "x-forwarded-for", "host"];
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length"];

pub async fn handle(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let group_name = params.get("group_name").cloned().unwrap_or_default();
    let rest = params.get("rest").cloned().unwrap_or_default();

    match run(&state, &group_name, &rest, raw_query, method, headers, query, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    state: &AppState,
    group_name: &str,
    rest: &str,
    raw_query: Option<String>,
    method: Method,
    mut headers: HeaderMap,
    query: HashMap<String, String>,
    body: Body,
) -> Result<Response, ProxyError> {
    let group = state
        .groups
        .get_group_by_name(group_name)
        .map_err(|_| ProxyError::GroupNotFound(group_name.to_string()))?;

    let client_key = crate::channels::extract_proxy_key(&headers, &query).ok_or(ProxyError::Unauthorized)?;
    if !group.proxy_keys_map.contains(&client_key) && !system_proxy_keys(state).contains(&client_key) {
        return Err(ProxyError::Unauthorized);
    }

    let content_length: Option<usize> = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let prereadable = content_length.map(|n| n <= BODY_PREREAD_LIMIT).unwrap_or(true);

    let (channel, base) = state
        .channels
        .get(&group)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    let _ = query;
    if prereadable {
        let bytes = axum::body::to_bytes(body, BODY_PREREAD_LIMIT)
            .await
            .map_err(|_| ProxyError::Internal("failed to read request body".to_string()))?;
        forward_with_retry(state, &group, channel, base, &method, rest, &raw_query, &mut headers, Some(bytes)).await
    } else {
        // Oversized body: not buffered, so it can be sent exactly once.
        crate::logger::debug(
            "proxy",
            &format!("group {group_name}: body exceeds pre-read limit, forwarding without retry"),
        );
        forward_with_retry(state, &group, channel, base, &method, rest, &raw_query, &mut headers, None).await
    }
}

fn system_proxy_keys(state: &AppState) -> std::collections::HashSet<String> {
    state
        .settings
        .get_settings()
        .get("proxy_keys")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
async fn forward_with_retry(
    state: &AppState,
    group: &Group,
    channel: std::sync::Arc<dyn Channel>,
    base: std::sync::Arc<BaseChannel>,
    method: &Method,
    rest: &str,
    raw_query: &Option<String>,
    headers: &mut HeaderMap,
    body: Option<axum::body::Bytes>,
) -> Result<Response, ProxyError> {
    let max_retries = group
        .effective_config
        .get("max_retries")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(3);
    let blacklist_threshold = group
        .effective_config
        .get("blacklist_threshold")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(3);

    // An unbuffered (oversized) body can only be sent once: after the first
    // `reqwest` send consumes the stream there is nothing left to replay.
    let attempts_allowed = if body.is_some() { max_retries.max(1) } else { 1 };

    strip_hop_by_hop_request_headers(headers);

    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut last_key_id: Option<i64> = None;

    for attempt in 1..=attempts_allowed {
        let key = match state.keys.select_key(group.id).await {
            Ok(key) => key,
            Err(_) => return Err(ProxyError::NoActiveKeys(group.name.clone())),
        };
        last_key_id = Some(key.id);

        let Some(upstream_url) = base.selector.next() else {
            return Err(ProxyError::NoActiveKeys(group.name.clone()));
        };

        let mut outbound_headers = headers.clone();
        let mut outbound_body = body.clone();

        let path_and_query = build_path_and_query(rest, raw_query);
        let mut url = format!("{}{}", upstream_url.trim_end_matches('/'), path_and_query);
        url = channel.modify_request(&url, &mut outbound_headers, &key.key_string);

        let is_stream = match &outbound_body {
            Some(bytes) if !bytes.is_empty() => {
                let parsed: Value = serde_json::from_slice(bytes).unwrap_or(Value::Null);
                channel.is_stream_request(&outbound_headers, rest, &parsed)
            }
            _ => channel.is_stream_request(&outbound_headers, rest, &Value::Null),
        };

        if let Some(bytes) = outbound_body.take() {
            outbound_body = Some(apply_param_overrides(bytes, &group.param_overrides, method));
        }

        let http_client = if is_stream { &base.streaming_client } else { &base.normal_client };
        let started = Instant::now();

        let mut request = http_client.request(method.clone(), &url).headers(outbound_headers);
        if let Some(bytes) = outbound_body.clone() {
            request = request.body(bytes);
        }

        let sent = request.send().await;

        let outcome = match sent {
            Err(err) => Outcome::Retryable(err.to_string()),
            Ok(response) => {
                let status = response.status();
                if is_stream && status.is_success() {
                    let duration_ms = started.elapsed().as_millis() as i32;
                    dispatch_success(state, &key, group, status, duration_ms, true);
                    return Ok(stream_response(response));
                }
                classify(status, response, base.channel_type.as_str()).await
            }
        };

        match outcome {
            Outcome::Success(status, resp_headers, resp_body) => {
                let duration_ms = started.elapsed().as_millis() as i32;
                dispatch_success(state, &key, group, status, duration_ms, false);
                return Ok(build_buffered_response(status, resp_headers, resp_body));
            }
            Outcome::KeyRevoked { status, message } => {
                dispatch_failure_revoked(state, &key, group, blacklist_threshold);
                record_request_log(state, group, Some(key.id), false, status.as_u16() as i32, 0, Some(message.clone()));
                attempts.push(AttemptRecord {
                    attempt,
                    key_id: Some(key.id),
                    status_code: Some(status.as_u16()),
                    error_message: message,
                });
            }
            Outcome::Retryable(message) => {
                dispatch_failure(state, &key, group, blacklist_threshold);
                attempts.push(AttemptRecord {
                    attempt,
                    key_id: Some(key.id),
                    status_code: None,
                    error_message: message,
                });
            }
            Outcome::Terminal(status, body_text) => {
                let duration_ms = started.elapsed().as_millis() as i32;
                record_request_log(
                    state,
                    group,
                    Some(key.id),
                    false,
                    status.as_u16() as i32,
                    duration_ms,
                    Some(body_text.clone()),
                );
                return Err(terminal_error(status, &body_text));
            }
        }
    }

    let last_status = attempts.last().and_then(|a| a.status_code).unwrap_or(502);
    dispatch_failure_final_log(state, group, last_key_id, last_status as i32);
    Err(ProxyError::UpstreamTerminal {
        status: last_status,
        body: serde_json::json!({"error": "retry_exhausted"}),
        attempts,
    })
}

enum Outcome {
    Success(StatusCode, HeaderMap, axum::body::Bytes),
    KeyRevoked { status: StatusCode, message: String },
    Retryable(String),
    Terminal(StatusCode, String),
}

async fn classify(status: StatusCode, response: reqwest::Response, channel_type: &str) -> Outcome {
    let resp_headers = response.headers().clone();
    let code = status.as_u16();

    if status.is_success() {
        let bytes = response.bytes().await.unwrap_or_default();
        return Outcome::Success(status, resp_headers, bytes);
    }

    let body_text = response.text().await.unwrap_or_default();

    if code == 501 {
        return Outcome::Terminal(status, body_text);
    }
    if (500..600).contains(&code) {
        return Outcome::Retryable(body_text);
    }
    if code == 401 || code == 403 || code == 429 {
        if is_key_revoked(&body_text, channel_type) {
            return Outcome::KeyRevoked { status, message: body_text };
        }
        return Outcome::Retryable(body_text);
    }

    Outcome::Terminal(status, body_text)
}

/// Provider-specific revoked-key markers (§4.6 `ValidateKey`, §7 `KeyRevoked`).
fn is_key_revoked(body: &str, channel_type: &str) -> bool {
    match channel_type {
        "openai" => body.contains("invalid_api_key") || body.contains("account_deactivated"),
        "anthropic" => body.contains("authentication_error"),
        "gemini" => body.contains("API_KEY_INVALID") || body.contains("PERMISSION_DENIED"),
        _ => false,
    }
}

fn terminal_error(status: StatusCode, body_text: &str) -> ProxyError {
    let body = serde_json::from_str::<Value>(body_text)
        .unwrap_or_else(|_| serde_json::json!({"error": body_text}));
    ProxyError::UpstreamTerminal { status: status.as_u16(), body, attempts: Vec::new() }
}

fn build_path_and_query(rest: &str, raw_query: &Option<String>) -> String {
    let mut out = String::from("/");
    out.push_str(rest.trim_start_matches('/'));
    if let Some(q) = raw_query {
        if !q.is_empty() {
            out.push('?');
            out.push_str(q);
        }
    }
    out
}

/// Shallow JSON-object merge of `param_overrides` into the outbound body,
/// only for JSON bodies on write methods (§4.7 step 4b). Deep-merge is
/// left for future tuning; this is intentionally a single-level merge.
fn apply_param_overrides(bytes: axum::body::Bytes, overrides: &Value, method: &Method) -> axum::body::Bytes {
    let writes = matches!(method.as_str(), "POST" | "PUT" | "PATCH");
    let Some(overrides_obj) = overrides.as_object() else { return bytes };
    if !writes || overrides_obj.is_empty() {
        return bytes;
    }

    let Ok(mut parsed) = serde_json::from_slice::<Value>(&bytes) else { return bytes };
    let Some(obj) = parsed.as_object_mut() else { return bytes };
    for (k, v) in overrides_obj {
        obj.insert(k.clone(), v.clone());
    }

    match serde_json::to_vec(&parsed) {
        Ok(out) => axum::body::Bytes::from(out),
        Err(_) => bytes,
    }
}

fn strip_hop_by_hop_request_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_REQUEST_HEADERS {
        headers.remove(*name);
    }
}

fn build_buffered_response(status: StatusCode, mut headers: HeaderMap, body: axum::body::Bytes) -> Response {
    for name in HOP_BY_HOP_RESPONSE_HEADERS {
        headers.remove(*name);
    }
    let mut response = Response::builder().status(status);
    if let Some(h) = response.headers_mut() {
        *h = headers;
    }
    response.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming path (§4.6 "Request forwarding"): pipes upstream bytes to the
/// client as they arrive, never buffering the whole response.
fn stream_response(response: reqwest::Response) -> Response {
    let stream = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Dispatches `UpdateStatus` and the request-log write on the bounded
/// worker pool (§4.7 "Ordering"): the response path never blocks on either.
fn dispatch_success(state: &AppState, key: &crate::keys::ApiKey, group: &Group, status: StatusCode, duration_ms: i32, is_stream: bool) {
    let keys = state.keys.clone();
    let key_id = key.id;
    let group_id = group.id;
    state.workers.submit(key_id, async move {
        if let Err(err) = keys.update_status(key_id, group_id, true, 3).await {
            crate::logger::warn("proxy", &format!("update_status(success) failed for key {key_id}: {err}"));
        }
    });
    record_request_log(state, group, Some(key_id), is_stream, status.as_u16() as i32, duration_ms, None);
}

fn dispatch_failure(state: &AppState, key: &crate::keys::ApiKey, group: &Group, blacklist_threshold: i32) {
    let keys = state.keys.clone();
    let key_id = key.id;
    let group_id = group.id;
    state.workers.submit(key_id, async move {
        if let Err(err) = keys.update_status(key_id, group_id, false, blacklist_threshold).await {
            crate::logger::warn("proxy", &format!("update_status(failure) failed for key {key_id}: {err}"));
        }
    });
}

/// `KeyRevoked` (§7): invalidates the key on the spot, jumping its failure
/// counter by the group's configured `blacklist_threshold` rather than the
/// +1 an ordinary retryable failure applies.
fn dispatch_failure_revoked(state: &AppState, key: &crate::keys::ApiKey, group: &Group, blacklist_threshold: i32) {
    let keys = state.keys.clone();
    let key_id = key.id;
    let group_id = group.id;
    state.workers.submit(key_id, async move {
        if let Err(err) = keys.revoke_key(key_id, group_id, blacklist_threshold).await {
            crate::logger::warn("proxy", &format!("revoke_key failed for key {key_id}: {err}"));
        }
    });
}

fn dispatch_failure_final_log(state: &AppState, group: &Group, key_id: Option<i64>, status: i32) {
    record_request_log(state, group, key_id, false, status, 0, Some("retry_exhausted".to_string()));
}

fn record_request_log(
    state: &AppState,
    group: &Group,
    key_id: Option<i64>,
    is_stream: bool,
    status_code: i32,
    duration_ms: i32,
    error_message: Option<String>,
) {
    let logs = state.request_logs.clone();
    let entry = NewRequestLog {
        group_id: Some(group.id),
        group_name: Some(group.name.clone()),
        key_id,
        is_stream,
        status_code,
        model: None,
        duration_ms,
        error_message,
    };
    state.workers.submit(group.id, async move {
        if let Err(err) = logs.record(entry).await {
            crate::logger::warn("proxy", &format!("request log write failed: {err}"));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoked_markers_are_channel_specific() {
        assert!(is_key_revoked(r#"{"error":{"code":"invalid_api_key"}}"#, "openai"));
        assert!(is_key_revoked(r#"{"error":{"type":"authentication_error"}}"#, "anthropic"));
        assert!(is_key_revoked(r#"{"error":{"status":"API_KEY_INVALID"}}"#, "gemini"));
        assert!(!is_key_revoked("rate limited, try again later", "openai"));
    }

    #[test]
    fn param_overrides_merge_is_shallow_and_only_on_writes() {
        let body = axum::body::Bytes::from(r#"{"model":"gpt-4","temperature":0.5}"#.to_string());
        let overrides = serde_json::json!({"temperature": 0.1, "user": "proxy"});

        let merged = apply_param_overrides(body.clone(), &overrides, &Method::POST);
        let parsed: Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(parsed["temperature"], 0.1);
        assert_eq!(parsed["user"], "proxy");
        assert_eq!(parsed["model"], "gpt-4");

        let unchanged = apply_param_overrides(body, &overrides, &Method::GET);
        assert_eq!(unchanged.as_ref(), br#"{"model":"gpt-4","temperature":0.5}"#);
    }

    #[test]
    fn build_path_and_query_joins_rest_and_raw_query() {
        assert_eq!(build_path_and_query("v1/chat/completions", &None), "/v1/chat/completions");
        assert_eq!(
            build_path_and_query("v1/chat/completions", &Some("stream=true".to_string())),
            "/v1/chat/completions?stream=true"
        );
    }
}
