//! HTTP client manager (C2, §4.2): a fingerprint → reusable `reqwest::Client`
//! cache, with a read-lock fast path and a write-lock slow path so hot
//! requests never pay for client construction.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::Client;

/// Inputs that together determine whether two callers can share a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientFingerprint {
    pub connect_timeout_ms: u64,
    /// 0 = unbounded (streaming clients).
    pub request_timeout_ms: u64,
    pub idle_conn_timeout_ms: u64,
    pub max_idle_conns: u32,
    pub max_idle_conns_per_host: u32,
    pub response_header_timeout_ms: u64,
    pub disable_compression: bool,
}

impl ClientFingerprint {
    /// The *normal* client for a group: bounded request timeout, compression on.
    pub fn normal(cfg: &NormalClientConfig) -> Self {
        Self {
            connect_timeout_ms: cfg.connect_timeout_ms,
            request_timeout_ms: cfg.request_timeout_ms,
            idle_conn_timeout_ms: cfg.idle_conn_timeout_ms,
            max_idle_conns: cfg.max_idle_conns,
            max_idle_conns_per_host: cfg.max_idle_conns_per_host,
            response_header_timeout_ms: cfg.response_header_timeout_ms,
            disable_compression: false,
        }
    }

    /// The *streaming* client for a group: no overall timeout, no
    /// compression, a larger idle pool (>= 2x per-host, floor 50/20, §4.2).
    pub fn streaming(cfg: &NormalClientConfig) -> Self {
        Self {
            connect_timeout_ms: cfg.connect_timeout_ms,
            request_timeout_ms: 0,
            idle_conn_timeout_ms: cfg.idle_conn_timeout_ms,
            max_idle_conns: (cfg.max_idle_conns * 2).max(50),
            max_idle_conns_per_host: (cfg.max_idle_conns_per_host * 2).max(20),
            response_header_timeout_ms: cfg.response_header_timeout_ms,
            disable_compression: true,
        }
    }
}

/// The subset of system settings that feed a client fingerprint (§4.2, §9
/// "System defaults").
#[derive(Debug, Clone)]
pub struct NormalClientConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_conn_timeout_ms: u64,
    pub max_idle_conns: u32,
    pub max_idle_conns_per_host: u32,
    pub response_header_timeout_ms: u64,
}

impl Default for NormalClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            request_timeout_ms: 600_000,
            idle_conn_timeout_ms: 120_000,
            max_idle_conns: 100,
            max_idle_conns_per_host: 50,
            response_header_timeout_ms: 600_000,
        }
    }
}

impl NormalClientConfig {
    /// Derives a per-group client config from `effective_config` (§4.3,
    /// §4.2): the system/group-overridden settings store these fields in
    /// whole seconds, so each is parsed and scaled to milliseconds. A
    /// missing or unparsable entry falls back to the matching default field.
    pub fn from_effective_config(config: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let secs_or = |key: &str, default_ms: u64| -> u64 {
            config.get(key).and_then(|v| v.parse::<u64>().ok()).map(|secs| secs * 1000).unwrap_or(default_ms)
        };
        let count_or = |key: &str, default: u32| -> u32 {
            config.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(default)
        };

        Self {
            connect_timeout_ms: secs_or("connect_timeout", defaults.connect_timeout_ms),
            request_timeout_ms: secs_or("request_timeout", defaults.request_timeout_ms),
            idle_conn_timeout_ms: secs_or("idle_conn_timeout", defaults.idle_conn_timeout_ms),
            max_idle_conns: count_or("max_idle_conns", defaults.max_idle_conns),
            max_idle_conns_per_host: count_or("max_idle_conns_per_host", defaults.max_idle_conns_per_host),
            response_header_timeout_ms: secs_or("response_header_timeout", defaults.response_header_timeout_ms),
        }
    }
}

pub struct ClientManager {
    clients: RwLock<HashMap<ClientFingerprint, Client>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self { clients: RwLock::new(HashMap::new()) }
    }

    /// Returns the client for `fingerprint`, building and caching it on first
    /// use. Read-lock fast path, write-lock slow path (§4.2, §5).
    pub fn get(&self, fingerprint: &ClientFingerprint) -> anyhow::Result<Client> {
        if let Some(client) = self.clients.read().unwrap().get(fingerprint) {
            return Ok(client.clone());
        }

        let mut guard = self.clients.write().unwrap();
        if let Some(client) = guard.get(fingerprint) {
            return Ok(client.clone());
        }

        let client = build_client(fingerprint)?;
        guard.insert(fingerprint.clone(), client.clone());
        Ok(client)
    }

    pub fn normal(&self, cfg: &NormalClientConfig) -> anyhow::Result<Client> {
        self.get(&ClientFingerprint::normal(cfg))
    }

    pub fn streaming(&self, cfg: &NormalClientConfig) -> anyhow::Result<Client> {
        self.get(&ClientFingerprint::streaming(cfg))
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(fp: &ClientFingerprint) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_millis(fp.connect_timeout_ms.max(1)))
        .pool_idle_timeout(Duration::from_millis(fp.idle_conn_timeout_ms.max(1)))
        .pool_max_idle_per_host(fp.max_idle_conns_per_host as usize);

    if fp.request_timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(fp.request_timeout_ms));
    }
    if fp.disable_compression {
        builder = builder.no_gzip().no_brotli().no_deflate();
    }

    builder.build().map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))
}

/// Determine if an upstream status code should trigger a retry (§4.7).
/// Actual "key revoked" classification (which overrides this for 401/403/429)
/// lives in `proxy::classify`, since it needs the response body.
pub fn is_server_error_or_rate_limited(status: u16) -> bool {
    matches!(status, 500..=599 | 429)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_fingerprint_is_cached_once() {
        let manager = ClientManager::new();
        let cfg = NormalClientConfig::default();
        let fp = ClientFingerprint::normal(&cfg);

        manager.get(&fp).unwrap();
        manager.get(&fp).unwrap();
        assert_eq!(manager.clients.read().unwrap().len(), 1);
    }

    #[test]
    fn normal_and_streaming_fingerprints_differ() {
        let cfg = NormalClientConfig::default();
        assert_ne!(ClientFingerprint::normal(&cfg), ClientFingerprint::streaming(&cfg));
    }

    #[test]
    fn effective_config_overrides_scale_seconds_to_millis() {
        let mut overrides = HashMap::new();
        overrides.insert("connect_timeout".to_string(), "5".to_string());
        overrides.insert("max_idle_conns_per_host".to_string(), "20".to_string());

        let cfg = NormalClientConfig::from_effective_config(&overrides);
        assert_eq!(cfg.connect_timeout_ms, 5_000);
        assert_eq!(cfg.max_idle_conns_per_host, 20);
        assert_eq!(cfg.request_timeout_ms, NormalClientConfig::default().request_timeout_ms);
    }

    #[test]
    fn malformed_override_falls_back_to_default() {
        let mut overrides = HashMap::new();
        overrides.insert("connect_timeout".to_string(), "not-a-number".to_string());

        let cfg = NormalClientConfig::from_effective_config(&overrides);
        assert_eq!(cfg.connect_timeout_ms, NormalClientConfig::default().connect_timeout_ms);
    }
}
