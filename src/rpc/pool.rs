//! Health-scored, round-robin JSON-RPC provider pool
//!
//! One pool object owns every provider's process-lifetime state (health,
//! latency EMA, counters). It is shared by handle (`Arc<ProviderPool>`) and
//! is safe to call concurrently: the round-robin cursor is atomic and the
//! per-provider state sits behind one mutex that is never held across an
//! await point.
//!
//! Health model (0-100):
//! - error: -20 (floor 0)
//! - success: +2 (ceiling 100)
//! - providers below `failure_threshold` are skipped; when every provider is
//!   below it, counters reset and the first provider is retried
//!
//! Failover: a rate limit, or the third consecutive error on one provider,
//! moves the call to the next provider immediately. Any other error, or a
//! failover with nowhere else to go, retries after `attempt × backoff_step_ms`.

use super::errors::RpcError;
use super::transport::{HttpTransport, RpcTransport};
use super::types::{parse_block, parse_hex_u64, parse_logs, to_hex, LogFilter, RpcBlock, RpcLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const MAX_HEALTH: u8 = 100;

#[derive(Debug, Clone)]
pub struct ProviderPoolConfig {
    /// Hard per-attempt timeout
    pub timeout_ms: u64,
    /// Attempts per call when callers use the default
    pub retries: u32,
    /// Linear backoff unit between same-provider retries
    pub backoff_step_ms: u64,
    /// Providers below this health are skipped
    pub failure_threshold: u8,
    pub error_penalty: u8,
    pub success_recovery: u8,
    /// Consecutive errors that force a failover
    pub failover_after_errors: u32,
    /// Smoothing factor for the latency moving average
    pub latency_alpha: f64,
}

impl Default for ProviderPoolConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retries: 3,
            backoff_step_ms: 1_000,
            failure_threshold: 30,
            error_penalty: 20,
            success_recovery: 2,
            failover_after_errors: 3,
            latency_alpha: 0.1,
        }
    }
}

/// Name + URL of one configured endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
}

impl ProviderEndpoint {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderState {
    pub name: String,
    pub endpoint: String,
    pub health: u8,
    pub avg_latency_ms: f64,
    pub total_calls: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl ProviderState {
    fn new(endpoint: &ProviderEndpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            endpoint: endpoint.url.clone(),
            health: MAX_HEALTH,
            avg_latency_ms: 0.0,
            total_calls: 0,
            total_errors: 0,
            consecutive_errors: 0,
            last_error: None,
        }
    }

    fn record_success(&mut self, latency_ms: u64, config: &ProviderPoolConfig) {
        self.total_calls += 1;
        self.consecutive_errors = 0;
        self.health = self.health.saturating_add(config.success_recovery).min(MAX_HEALTH);
        self.avg_latency_ms = if self.total_calls == 1 {
            latency_ms as f64
        } else {
            config.latency_alpha * latency_ms as f64 + (1.0 - config.latency_alpha) * self.avg_latency_ms
        };
    }

    /// Returns the consecutive error count after this error.
    fn record_error(&mut self, error: &RpcError, config: &ProviderPoolConfig) -> u32 {
        self.total_calls += 1;
        self.total_errors += 1;
        self.consecutive_errors += 1;
        self.health = self.health.saturating_sub(config.error_penalty);
        self.last_error = Some(error.to_string());
        self.consecutive_errors
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_calls as f64
        }
    }
}

/// Successful call result
#[derive(Debug, Clone)]
pub struct RpcSuccess {
    pub data: Value,
    pub provider: String,
    pub latency_ms: u64,
}

pub struct ProviderPool {
    providers: Mutex<Vec<ProviderState>>,
    cursor: AtomicUsize,
    transport: Arc<dyn RpcTransport>,
    config: ProviderPoolConfig,
}

impl ProviderPool {
    /// Fails fast when no endpoints are configured.
    pub fn new(
        endpoints: Vec<ProviderEndpoint>,
        transport: Arc<dyn RpcTransport>,
        config: ProviderPoolConfig,
    ) -> Result<Self, RpcError> {
        if endpoints.is_empty() {
            return Err(RpcError::NoProviders);
        }

        log::info!("🔌 Provider pool: {} endpoint(s)", endpoints.len());
        for endpoint in &endpoints {
            log::info!("   ├─ {}", endpoint.name);
        }

        Ok(Self {
            providers: Mutex::new(endpoints.iter().map(ProviderState::new).collect()),
            cursor: AtomicUsize::new(0),
            transport,
            config,
        })
    }

    /// Pool backed by the reqwest JSON-RPC transport.
    pub fn http(endpoints: Vec<ProviderEndpoint>, config: ProviderPoolConfig) -> Result<Self, RpcError> {
        // Transport ceiling sits above the per-attempt timeout so the pool's own timeout wins
        let transport = HttpTransport::new(Duration::from_millis(config.timeout_ms.saturating_mul(2)))?;
        Self::new(endpoints, Arc::new(transport), config)
    }

    pub fn config(&self) -> &ProviderPoolConfig {
        &self.config
    }

    fn providers(&self) -> MutexGuard<'_, Vec<ProviderState>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every provider's state
    pub fn stats(&self) -> Vec<ProviderState> {
        self.providers().clone()
    }

    fn first_healthy_from(&self, start: usize) -> Option<usize> {
        let providers = self.providers();
        let n = providers.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&idx| providers[idx].health >= self.config.failure_threshold)
    }

    /// Round-robin starting point for a new call.
    fn select_start(&self) -> usize {
        let n = self.providers().len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;

        match self.first_healthy_from(start) {
            Some(idx) => idx,
            None => {
                log::warn!("⚠️  All RPC providers degraded, resetting failure counters");
                for provider in self.providers().iter_mut() {
                    provider.consecutive_errors = 0;
                }
                0
            }
        }
    }

    /// Next provider after `current`, healthy if possible.
    fn failover_from(&self, current: usize) -> usize {
        let n = self.providers().len();
        let next = (current + 1) % n;
        self.first_healthy_from(next).unwrap_or(next)
    }

    /// Call `method` with the pool's default retry budget.
    pub async fn request(&self, method: &str, params: Value) -> Result<RpcSuccess, RpcError> {
        self.call(method, params, self.config.retries).await
    }

    /// Issue one JSON-RPC call with failover across providers.
    ///
    /// `TooManyResults` and client errors return immediately and do not cost
    /// the provider any health.
    pub async fn call(&self, method: &str, params: Value, retries: u32) -> Result<RpcSuccess, RpcError> {
        let attempts = retries.max(1);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut idx = self.select_start();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let (name, endpoint) = {
                let providers = self.providers();
                (providers[idx].name.clone(), providers[idx].endpoint.clone())
            };

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, self.transport.send(&endpoint, method, &params)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(Ok(data)) => {
                    self.providers()[idx].record_success(latency_ms, &self.config);
                    log::debug!("{} via {} in {}ms", method, name, latency_ms);
                    return Ok(RpcSuccess {
                        data,
                        provider: name,
                        latency_ms,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => RpcError::Timeout(self.config.timeout_ms),
            };

            if !error.penalizes_provider() {
                self.providers()[idx].total_calls += 1;
                return Err(error);
            }

            let consecutive = self.providers()[idx].record_error(&error, &self.config);
            let forced = error.is_rate_limit() || consecutive >= self.config.failover_after_errors;

            log::warn!(
                "⚠️  {} failed on {} (attempt {}/{}): {}",
                method,
                name,
                attempt,
                attempts,
                error
            );

            last_error = error.to_string();

            let mut next = idx;
            if forced {
                self.providers()[idx].consecutive_errors = 0;
                next = self.failover_from(idx);
                if next != idx {
                    let providers = self.providers();
                    log::warn!("🔀 Failover {} → {}", providers[idx].name, providers[next].name);
                }
            }

            // Only a switch to another provider retries at once
            if next == idx && attempt < attempts {
                let delay = self.config.backoff_step_ms.saturating_mul(attempt as u64);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            idx = next;
        }

        log::error!("❌ {} exhausted {} attempts: {}", method, attempts, last_error);
        Err(RpcError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let hex = result
            .data
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse("eth_blockNumber: expected hex string".to_string()))?;
        parse_hex_u64(hex)
    }

    /// `TooManyResults` surfaces verbatim so the caller can shrink its range.
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, RpcError> {
        let result = self.request("eth_getLogs", filter.to_params()).await?;
        parse_logs(result.data)
    }

    pub async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, RpcError> {
        let result = self
            .request("eth_getBlockByNumber", json!([to_hex(number), false]))
            .await?;
        parse_block(result.data)
    }
}
