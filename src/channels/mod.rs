//! Channel factory + channels (C6, §4.6): the protocol-adapter strategy
//! objects, one per `channel_type`, plus the smooth weighted round-robin
//! upstream selector shared by all of them.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde_json::Value;

use crate::groups::Group;
use crate::http_client::{ClientManager, NormalClientConfig};

/// Header/query forms accepted on ingress for the client-facing proxy key
/// (§6.1): channels extract the protocol-natural one, but the system accepts
/// any of these.
pub fn extract_proxy_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(key) = header_value(headers, "x-api-key") {
        return Some(key);
    }
    if let Some(key) = header_value(headers, "x-goog-api-key") {
        return Some(key);
    }
    query.get("key").map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Per-channel behavior (§4.6). Implementors are stateless strategies; all
/// mutable state (WRR counters, client handles) lives in `BaseChannel`.
#[async_trait]
pub trait Channel: Send + Sync {
    fn channel_type(&self) -> &'static str;

    fn extract_key(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
        extract_proxy_key(headers, query)
    }

    /// Rewrites the outbound URL and headers to carry `api_key` as this
    /// protocol's native auth.
    fn modify_request(&self, url: &str, headers: &mut HeaderMap, api_key: &str) -> String;

    fn is_stream_request(&self, headers: &HeaderMap, path: &str, body: &Value) -> bool {
        if headers.get("accept").and_then(|v| v.to_str().ok()).map(|v| v.contains("text/event-stream")).unwrap_or(false) {
            return true;
        }
        match body.get("stream") {
            Some(Value::Bool(b)) => *b,
            _ => path.to_ascii_lowercase().contains(":streamgeneratecontent"),
        }
    }

    /// Minimal live probe against the upstream (§4.6). Returns `Ok(true)` on
    /// HTTP 200, `Ok(false)` with a parsed error message otherwise.
    async fn validate_key(&self, client: &Client, base: &BaseChannel, api_key: &str) -> (bool, Option<String>);
}

pub struct WeightedUpstream {
    pub url: String,
    pub weight: u32,
    current_weight: i64,
}

/// Smooth weighted round-robin selector (§4.6). A fresh instance per
/// `BaseChannel` build; mutex-protected since the critical section is O(n)
/// in the (small) number of upstreams.
pub struct UpstreamSelector {
    upstreams: Mutex<Vec<WeightedUpstream>>,
}

impl UpstreamSelector {
    pub fn new(upstreams: &[crate::groups::Upstream]) -> Self {
        let entries = upstreams
            .iter()
            .map(|u| WeightedUpstream { url: u.url.clone(), weight: u.weight.max(1), current_weight: 0 })
            .collect();
        Self { upstreams: Mutex::new(entries) }
    }

    /// Returns the next upstream URL, or `None` if the group has no
    /// upstreams configured.
    pub fn next(&self) -> Option<String> {
        let mut upstreams = self.upstreams.lock().unwrap();
        if upstreams.is_empty() {
            return None;
        }

        let total: i64 = upstreams.iter().map(|u| u.weight as i64).sum();
        for u in upstreams.iter_mut() {
            u.current_weight += u.weight as i64;
        }

        // `Iterator::max_by_key` keeps the *last* maximal element on ties;
        // §4.6 breaks ties by the first-encountered entry instead.
        let mut best_idx = 0;
        for (idx, u) in upstreams.iter().enumerate().skip(1) {
            if u.current_weight > upstreams[best_idx].current_weight {
                best_idx = idx;
            }
        }

        upstreams[best_idx].current_weight -= total;
        Some(upstreams[best_idx].url.clone())
    }
}

/// Shared state for one group's channel instance (§4.6).
pub struct BaseChannel {
    pub channel_type: String,
    pub selector: UpstreamSelector,
    pub normal_client: Client,
    pub streaming_client: Client,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    /// Snapshot of the fields that, if changed, make a cached channel stale.
    pub fingerprint: ChannelFingerprint,
}

/// Subset of `effective_config` that feeds the group's HTTP clients;
/// part of the fingerprint so a settings change rebuilds the channel.
const CLIENT_CONFIG_KEYS: &[&str] = &[
    "connect_timeout",
    "request_timeout",
    "idle_conn_timeout",
    "response_header_timeout",
    "max_idle_conns",
    "max_idle_conns_per_host",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFingerprint {
    pub channel_type: String,
    pub upstreams: Vec<(String, u32)>,
    pub test_model: String,
    pub client_config: Vec<(String, Option<String>)>,
}

impl ChannelFingerprint {
    pub fn of(group: &Group) -> Self {
        Self {
            channel_type: group.channel_type.clone(),
            upstreams: group.upstreams.iter().map(|u| (u.url.clone(), u.weight)).collect(),
            test_model: group.test_model.clone(),
            client_config: CLIENT_CONFIG_KEYS
                .iter()
                .map(|key| (key.to_string(), group.effective_config.get(*key).cloned()))
                .collect(),
        }
    }
}

/// One cached `(Channel, BaseChannel)` pair per group, rebuilt lazily when
/// stale (§4.6).
struct CachedChannel {
    channel: Arc<dyn Channel>,
    base: Arc<BaseChannel>,
    fingerprint: ChannelFingerprint,
}

pub struct ChannelFactory {
    clients: Arc<ClientManager>,
    cache: std::sync::RwLock<HashMap<i64, CachedChannel>>,
}

impl ChannelFactory {
    pub fn new(clients: Arc<ClientManager>) -> Self {
        Self { clients, cache: std::sync::RwLock::new(HashMap::new()) }
    }

    /// Returns the channel + its shared state for `group`, rebuilding the
    /// cache entry if the group's channel-relevant fields have drifted.
    pub fn get(&self, group: &Group) -> anyhow::Result<(Arc<dyn Channel>, Arc<BaseChannel>)> {
        let fingerprint = ChannelFingerprint::of(group);

        if let Some(entry) = self.cache.read().unwrap().get(&group.id) {
            if entry.fingerprint == fingerprint {
                return Ok((entry.channel.clone(), entry.base.clone()));
            }
        }

        let channel: Arc<dyn Channel> = match group.channel_type.as_str() {
            "openai" => Arc::new(openai::OpenAiChannel),
            "gemini" => Arc::new(gemini::GeminiChannel),
            "anthropic" => Arc::new(anthropic::AnthropicChannel),
            other => anyhow::bail!("unknown channel type: {other}"),
        };

        let client_cfg = NormalClientConfig::from_effective_config(&group.effective_config);
        let base = Arc::new(BaseChannel {
            channel_type: group.channel_type.clone(),
            selector: UpstreamSelector::new(&group.upstreams),
            normal_client: self.clients.normal(&client_cfg)?,
            streaming_client: self.clients.streaming(&client_cfg)?,
            test_model: group.test_model.clone(),
            validation_endpoint: group.validation_endpoint.clone(),
            fingerprint: fingerprint.clone(),
        });

        self.cache.write().unwrap().insert(
            group.id,
            CachedChannel { channel: channel.clone(), base: base.clone(), fingerprint },
        );
        Ok((channel, base))
    }

    pub fn purge(&self, group_id: i64) {
        self.cache.write().unwrap().remove(&group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(url: &str, weight: u32) -> crate::groups::Upstream {
        crate::groups::Upstream { url: url.to_string(), weight }
    }

    #[test]
    fn smooth_wrr_interleaves_by_weight() {
        let selector = UpstreamSelector::new(&[upstream("a", 5), upstream("b", 1), upstream("c", 1)]);
        let picks: Vec<String> = (0..7).map(|_| selector.next().unwrap()).collect();
        let a_count = picks.iter().filter(|p| p.as_str() == "a").count();
        let b_count = picks.iter().filter(|p| p.as_str() == "b").count();
        let c_count = picks.iter().filter(|p| p.as_str() == "c").count();
        assert_eq!(a_count, 5);
        assert_eq!(b_count, 1);
        assert_eq!(c_count, 1);
    }

    #[test]
    fn single_upstream_is_always_selected() {
        let selector = UpstreamSelector::new(&[upstream("only", 3)]);
        for _ in 0..10 {
            assert_eq!(selector.next().unwrap(), "only");
        }
    }

    #[test]
    fn empty_upstream_list_yields_none() {
        let selector = UpstreamSelector::new(&[]);
        assert!(selector.next().is_none());
    }
}
