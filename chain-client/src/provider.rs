//! Provider pool (C1): holds N upstream RPC endpoints with API keys, hands
//! out a live endpoint per call, and records per-endpoint request/status
//! telemetry for the explorer job.
//!
//! Grounded on the original `web3_client.providers.ProvidersPool` (uniform
//! random choice over enabled providers, one telemetry log per provider) and
//! the teacher's `rpc_fallback::parse_rpc_urls` for the comma-separated URL
//! parsing convention.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;

use crate::error::ChainError;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a comma-separated API key string, positionally matched to the URLs
/// from [`parse_rpc_urls`]. Shorter than the URL list is allowed — remaining
/// providers are simply keyless.
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

const TELEMETRY_WINDOW: Duration = Duration::from_secs(300);

/// One (timestamp, HTTP status) sample in a provider's telemetry log.
struct Sample {
    at: Instant,
    status: u16,
}

/// A single upstream RPC endpoint.
pub struct Endpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    enabled: std::sync::atomic::AtomicBool,
    log: Mutex<VecDeque<Sample>>,
}

impl Endpoint {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            enabled: std::sync::atomic::AtomicBool::new(true),
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record(&self, status: u16) {
        let mut log = self.log.lock().expect("telemetry log poisoned");
        let now = Instant::now();
        log.push_back(Sample { at: now, status });
        while let Some(front) = log.front() {
            if now.duration_since(front.at) > TELEMETRY_WINDOW {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests-per-second over the telemetry window, and a breakdown of
    /// status codes seen in it — used by the `explorer` job (C10).
    pub fn telemetry(&self) -> (f64, Vec<(u16, usize)>) {
        let log = self.log.lock().expect("telemetry log poisoned");
        if log.is_empty() {
            return (0.0, Vec::new());
        }
        let window_secs = TELEMETRY_WINDOW.as_secs_f64();
        let rps = log.len() as f64 / window_secs;
        let mut counts: Vec<(u16, usize)> = Vec::new();
        for sample in log.iter() {
            match counts.iter_mut().find(|(code, _)| *code == sample.status) {
                Some(entry) => entry.1 += 1,
                None => counts.push((sample.status, 1)),
            }
        }
        (rps, counts)
    }

    pub fn url(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => {
                format!("{}/{}", self.base_url.trim_end_matches('/'), key)
            }
            _ => self.base_url.clone(),
        }
    }
}

/// Holds every configured endpoint and hands one out per call.
///
/// `get()` never blocks and never performs I/O; it fails immediately with
/// [`ChainError::NoProviderAvailable`] if every endpoint is disabled.
pub struct ProviderPool {
    endpoints: Vec<Endpoint>,
}

impl ProviderPool {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn from_urls(urls: &[String], api_keys: &[String]) -> Self {
        let endpoints = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let key = api_keys.get(i).filter(|k| !k.is_empty()).cloned();
                Endpoint::new(url.clone(), key)
            })
            .collect();
        Self::new(endpoints)
    }

    /// Uniform-random choice over currently enabled endpoints.
    pub fn get(&self) -> Result<&Endpoint, ChainError> {
        let enabled: Vec<&Endpoint> = self.endpoints.iter().filter(|e| e.is_enabled()).collect();
        enabled
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(ChainError::NoProviderAvailable)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Re-enables any endpoint that has been disabled. Mirrors the
    /// `ProvidersPool.refresh()` hook in the original — currently a no-op
    /// placeholder in the source, kept as a hook for a future health check.
    pub fn refresh(&self) {
        for endpoint in &self.endpoints {
            if !endpoint.is_enabled() {
                tracing::debug!(url = %endpoint.base_url, "provider refresh: leaving disabled endpoint as-is");
            }
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_url() {
        let urls = parse_rpc_urls("https://bsc.publicnode.com");
        assert_eq!(urls, vec!["https://bsc.publicnode.com"]);
    }

    #[test]
    fn test_parse_multiple_urls() {
        let urls = parse_rpc_urls(
            "https://bsc.publicnode.com,https://bsc-dataseed1.binance.org,https://binance.llamarpc.com",
        );
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let urls = parse_rpc_urls(" https://a.com , https://b.com , https://c.com ");
        assert_eq!(
            urls,
            vec!["https://a.com", "https://b.com", "https://c.com"]
        );
    }

    #[test]
    fn test_parse_ignores_empty() {
        let urls = parse_rpc_urls("https://a.com,,https://b.com,");
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_parse_empty_string() {
        let urls = parse_rpc_urls("");
        assert!(urls.is_empty());
    }

    #[test]
    fn test_pool_fails_with_no_enabled_providers() {
        let pool = ProviderPool::from_urls(&[], &[]);
        assert!(matches!(pool.get(), Err(ChainError::NoProviderAvailable)));
    }

    #[test]
    fn test_pool_returns_endpoint_when_available() {
        let pool = ProviderPool::from_urls(
            &["http://localhost:8545".to_string()],
            &["key1".to_string()],
        );
        let endpoint = pool.get().unwrap();
        assert_eq!(endpoint.base_url, "http://localhost:8545");
        assert_eq!(endpoint.url(), "http://localhost:8545/key1");
    }

    #[test]
    fn test_pool_skips_disabled_endpoints() {
        let pool = ProviderPool::from_urls(
            &[
                "http://a.example".to_string(),
                "http://b.example".to_string(),
            ],
            &[],
        );
        pool.endpoints()[0].set_enabled(false);
        for _ in 0..20 {
            let endpoint = pool.get().unwrap();
            assert_eq!(endpoint.base_url, "http://b.example");
        }
    }

    #[test]
    fn test_telemetry_records_status_breakdown() {
        let endpoint = Endpoint::new("http://a.example".to_string(), None);
        endpoint.record(200);
        endpoint.record(200);
        endpoint.record(429);
        let (_, counts) = endpoint.telemetry();
        let ok = counts.iter().find(|(c, _)| *c == 200).unwrap();
        assert_eq!(ok.1, 2);
        let limited = counts.iter().find(|(c, _)| *c == 429).unwrap();
        assert_eq!(limited.1, 1);
    }
}
