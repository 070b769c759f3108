//! Single timeout-bounded liveness probes
//!
//! Each monitored service has one [`ProbeTarget`]. The check performed
//! depends on the kind of target: a write/read/delete round trip for caches,
//! a trivial query for storage engines and a liveness call for external
//! providers. Whatever happens, [`HealthCheckService::probe`] returns a
//! [`HealthCheckResult`]; it never returns an error or panics on a failing
//! target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProbeError;

/// Time-to-live of the key written by the cache round-trip check
pub const CACHE_PROBE_TTL: Duration = Duration::from_secs(10);

/// Extra data attached to a probe result
pub type ProbeExtra = Map<String, Value>;

/// Cache service exposing set/get/delete
#[async_trait]
pub trait CacheTarget: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Storage engine that can run a trivial query
#[async_trait]
pub trait StorageTarget: Send + Sync {
    async fn trivial_query(&self) -> anyhow::Result<()>;
}

/// External provider with a liveness endpoint
#[async_trait]
pub trait ProviderTarget: Send + Sync {
    /// Returns provider-specific details on success
    async fn liveness(&self) -> anyhow::Result<ProbeExtra>;
}

/// Arbitrary health check for services that fit none of the other kinds
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<ProbeExtra>;
}

/// What to probe for a service
#[derive(Clone)]
pub enum ProbeTarget {
    Cache(Arc<dyn CacheTarget>),
    Storage(Arc<dyn StorageTarget>),
    Provider(Arc<dyn ProviderTarget>),
    Custom(Arc<dyn HealthProbe>),
}

impl ProbeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeTarget::Cache(_) => "cache",
            ProbeTarget::Storage(_) => "storage",
            ProbeTarget::Provider(_) => "provider",
            ProbeTarget::Custom(_) => "custom",
        }
    }

    async fn run(&self, service: &str) -> Result<ProbeExtra, ProbeError> {
        match self {
            ProbeTarget::Cache(cache) => cache_round_trip(cache.as_ref(), service).await,
            ProbeTarget::Storage(storage) => {
                storage.trivial_query().await?;
                Ok(ProbeExtra::new())
            }
            ProbeTarget::Provider(provider) => Ok(provider.liveness().await?),
            ProbeTarget::Custom(probe) => Ok(probe.check().await?),
        }
    }
}

impl std::fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProbeTarget::{}", self.kind())
    }
}

async fn cache_round_trip(cache: &dyn CacheTarget, service: &str) -> Result<ProbeExtra, ProbeError> {
    let key = format!("health_check:{}:{}", service, Uuid::new_v4());
    let value = Utc::now().to_rfc3339();

    cache.set(&key, &value, CACHE_PROBE_TTL).await?;
    let read_back = cache.get(&key).await?;
    cache.delete(&key).await?;

    if read_back.as_deref() != Some(value.as_str()) {
        return Err(ProbeError::CacheMismatch);
    }

    let mut extra = ProbeExtra::new();
    extra.insert("round_trip".to_string(), Value::Bool(true));
    Ok(extra)
}

/// Immutable outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub healthy: bool,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extra: ProbeExtra,
    /// Set when the probe was skipped because the breaker is open
    #[serde(default)]
    pub circuit_breaker_open: bool,
}

impl HealthCheckResult {
    pub fn healthy(service: impl Into<String>, latency: Duration, extra: ProbeExtra) -> Self {
        Self {
            service: service.into(),
            healthy: true,
            latency,
            error: None,
            timestamp: Utc::now(),
            extra,
            circuit_breaker_open: false,
        }
    }

    pub fn failed(service: impl Into<String>, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            healthy: false,
            latency,
            error: Some(error.into()),
            timestamp: Utc::now(),
            extra: ProbeExtra::new(),
            circuit_breaker_open: false,
        }
    }

    /// Synthetic result for a probe the breaker refused to send
    pub fn short_circuited(service: impl Into<String>, retry_in: Duration) -> Self {
        let mut result = Self::failed(service, Duration::ZERO, "circuit breaker open");
        result.circuit_breaker_open = true;
        result
            .extra
            .insert("retry_in_ms".to_string(), json!(retry_in.as_millis() as u64));
        result
    }

    pub fn is_short_circuited(&self) -> bool {
        self.circuit_breaker_open
    }
}

/// Runs probes against registered targets
#[derive(Default)]
pub struct HealthCheckService {
    targets: RwLock<HashMap<String, ProbeTarget>>,
}

impl HealthCheckService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the probe target for a service
    pub fn register_target(&self, service: impl Into<String>, target: ProbeTarget) {
        self.targets.write().insert(service.into(), target);
    }

    pub fn remove_target(&self, service: &str) -> Option<ProbeTarget> {
        self.targets.write().remove(service)
    }

    pub fn has_target(&self, service: &str) -> bool {
        self.targets.read().contains_key(service)
    }

    /// Probe `service`, giving up after `timeout`
    pub async fn probe(&self, service: &str, timeout: Duration) -> HealthCheckResult {
        let target = self.targets.read().get(service).cloned();
        let start = Instant::now();

        let outcome = match target {
            Some(target) => {
                let check = AssertUnwindSafe(target.run(service)).catch_unwind();
                match tokio::time::timeout(timeout, check).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(panic)) => Err(ProbeError::Panicked(panic_message(panic.as_ref()))),
                    Err(_) => Err(ProbeError::Timeout),
                }
            }
            None => Err(ProbeError::NoTarget),
        };
        let latency = start.elapsed();

        match outcome {
            Ok(extra) => {
                debug!(service, latency_ms = latency.as_millis() as u64, "Health probe succeeded");
                HealthCheckResult::healthy(service, latency, extra)
            }
            Err(e) => {
                debug!(service, error = %e, "Health probe failed");
                HealthCheckResult::failed(service, latency, e.to_string())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Provider liveness over HTTP: a GET that answers 2xx is alive
#[derive(Debug, Clone)]
pub struct HttpProviderTarget {
    client: reqwest::Client,
    url: String,
}

impl HttpProviderTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProviderTarget for HttpProviderTarget {
    async fn liveness(&self) -> anyhow::Result<ProbeExtra> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        response.error_for_status()?;

        let mut extra = ProbeExtra::new();
        extra.insert("status".to_string(), json!(status.as_u16()));
        extra.insert("url".to_string(), json!(self.url));
        Ok(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<HashMap<String, String>>,
        corrupt: bool,
    }

    #[async_trait]
    impl CacheTarget for MemoryCache {
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            assert_eq!(ttl, CACHE_PROBE_TTL);
            let value = if self.corrupt { "garbage" } else { value };
            self.entries.lock().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.entries.lock().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.entries.lock().remove(key);
            Ok(())
        }
    }

    struct SlowStorage;

    #[async_trait]
    impl StorageTarget for SlowStorage {
        async fn trivial_query(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl ProviderTarget for BrokenProvider {
        async fn liveness(&self) -> anyhow::Result<ProbeExtra> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_cache_round_trip_cleans_up() {
        let cache = Arc::new(MemoryCache::default());
        let service = HealthCheckService::new();
        service.register_target("cache", ProbeTarget::Cache(cache.clone()));

        let result = service.probe("cache", Duration::from_secs(1)).await;
        assert!(result.healthy, "{:?}", result.error);
        assert_eq!(result.extra.get("round_trip"), Some(&Value::Bool(true)));
        assert!(cache.entries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cache_mismatch_is_unhealthy() {
        let cache = Arc::new(MemoryCache {
            corrupt: true,
            ..Default::default()
        });
        let service = HealthCheckService::new();
        service.register_target("cache", ProbeTarget::Cache(cache));

        let result = service.probe("cache", Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("cache round-trip mismatch"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_result() {
        let service = HealthCheckService::new();
        service.register_target("storage", ProbeTarget::Storage(Arc::new(SlowStorage)));

        let result = service.probe("storage", Duration::from_millis(500)).await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(result.latency, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_target_error_text_preserved() {
        let service = HealthCheckService::new();
        service.register_target("embeddings", ProbeTarget::Provider(Arc::new(BrokenProvider)));

        let result = service.probe("embeddings", Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("connection refused"));
        assert!(!result.circuit_breaker_open);
    }

    struct PanickingProbe;

    #[async_trait]
    impl HealthProbe for PanickingProbe {
        async fn check(&self) -> anyhow::Result<ProbeExtra> {
            panic!("driver state poisoned")
        }
    }

    #[tokio::test]
    async fn test_panicking_target_becomes_failed_result() {
        let service = HealthCheckService::new();
        service.register_target("search", ProbeTarget::Custom(Arc::new(PanickingProbe)));

        let result = service.probe("search", Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("probe panicked: driver state poisoned"));
    }

    #[tokio::test]
    async fn test_missing_target() {
        let service = HealthCheckService::new();
        let result = service.probe("ghost", Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert_eq!(result.error.as_deref(), Some("no probe target registered"));
    }

    #[test]
    fn test_short_circuited_result() {
        let result = HealthCheckResult::short_circuited("storage", Duration::from_secs(50));
        assert!(!result.healthy);
        assert!(result.is_short_circuited());
        assert_eq!(result.latency, Duration::ZERO);
        assert_eq!(result.extra.get("retry_in_ms"), Some(&json!(50_000)));
    }

    #[tokio::test]
    async fn test_http_provider_liveness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let service = HealthCheckService::new();
        let target = HttpProviderTarget::new(format!("http://{}/health", addr));
        service.register_target("provider", ProbeTarget::Provider(Arc::new(target)));

        let result = service.probe("provider", Duration::from_secs(5)).await;
        assert!(result.healthy, "{:?}", result.error);
        assert_eq!(result.extra.get("status"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn test_http_provider_error_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let target = HttpProviderTarget::new(format!("http://{}/health", addr));
        let err = target.liveness().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_result_serialization() {
        let result = HealthCheckResult::failed("cache", Duration::from_millis(1500), "timeout");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latency"], "1s 500ms");
        assert_eq!(json["healthy"], false);

        let back: HealthCheckResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
