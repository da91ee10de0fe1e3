//! Tiered model routing with retries and failover.
//!
//! Each task is routed to a tier (fast or heavy) by a keyword/length rule
//! table. Transient failures are retried with jittered exponential backoff;
//! a fatal or persistent failure moves the task to the fallback backend, where
//! it stays until the next task starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::routing::{RoutingTable, Tier};
use crate::events::EventSink;
use crate::io::config::LlmConfig;
use crate::llm::http::HttpBackend;
use crate::llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};

/// Backoff schedule for retryable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            rate_limit_base_delay: Duration::from_secs(3),
            rate_limit_max_delay: Duration::from_secs(90),
        }
    }

    /// No sleeping between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_base_delay: Duration::ZERO,
            rate_limit_max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): capped doubling plus up to 50% jitter.
    pub fn delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let (base, cap) = if rate_limited {
            (self.rate_limit_base_delay, self.rate_limit_max_delay)
        } else {
            (self.base_delay, self.max_delay)
        };
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap);
        let jitter_ms = (exp.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

struct RouteState {
    primary: String,
    failed_over: bool,
}

pub struct ModelRouter {
    backends: HashMap<String, Arc<dyn LlmBackend>>,
    tiers: (String, String),
    fallback: Option<String>,
    routing: RoutingTable,
    policy: RetryPolicy,
    events: Arc<EventSink>,
    state: Mutex<RouteState>,
}

impl ModelRouter {
    pub fn new(
        backends: Vec<Arc<dyn LlmBackend>>,
        config: &LlmConfig,
        policy: RetryPolicy,
        events: Arc<EventSink>,
    ) -> Result<Self> {
        let backends: HashMap<String, Arc<dyn LlmBackend>> = backends
            .into_iter()
            .map(|backend| (backend.name().to_string(), backend))
            .collect();
        for name in [Some(&config.fast), Some(&config.heavy), config.fallback.as_ref()]
            .into_iter()
            .flatten()
        {
            if !backends.contains_key(name) {
                return Err(anyhow!("no backend registered for {name:?}"));
            }
        }
        Ok(Self {
            backends,
            tiers: (config.fast.clone(), config.heavy.clone()),
            fallback: config.fallback.clone(),
            routing: config.routing,
            policy,
            events,
            state: Mutex::new(RouteState {
                primary: config.heavy.clone(),
                failed_over: false,
            }),
        })
    }

    /// Build HTTP backends for every configured entry.
    ///
    /// Backends whose API key is missing are skipped as long as the tiers and
    /// fallback they feed are still covered.
    pub fn from_config(config: &LlmConfig, events: Arc<EventSink>) -> Result<Self> {
        let mut backends: Vec<Arc<dyn LlmBackend>> = Vec::new();
        for backend in &config.backends {
            match HttpBackend::from_config(backend, config.request_timeout_secs) {
                Ok(http) => backends.push(Arc::new(http)),
                Err(err) => warn!(backend = %backend.name, err = %err, "backend disabled"),
            }
        }
        Self::new(
            backends,
            config,
            RetryPolicy::new(config.max_retries),
            events,
        )
    }

    fn lock(&self) -> MutexGuard<'_, RouteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tier_name(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.tiers.0,
            Tier::Heavy => &self.tiers.1,
        }
    }

    /// Pick the tier for a new task and clear any failover from the previous one.
    pub fn start_task(&self, task_text: &str) -> Tier {
        let tier = self.routing.route(task_text);
        let primary = self.tier_name(tier).to_string();
        info!(?tier, backend = %primary, "routing task");
        let mut state = self.lock();
        state.primary = primary;
        state.failed_over = false;
        tier
    }

    /// Backend currently serving requests.
    pub fn active_backend(&self) -> String {
        let state = self.lock();
        match (&self.fallback, state.failed_over) {
            (Some(fallback), true) => fallback.clone(),
            _ => state.primary.clone(),
        }
    }

    fn call_with_retries(
        &self,
        backend: &dyn LlmBackend,
        request: &LlmRequest<'_>,
        fail_fast_on_rate_limit: bool,
    ) -> Result<LlmResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match backend.complete(request) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let give_up = !err.is_retryable()
                        || attempt >= self.policy.max_retries
                        || (err.is_rate_limit() && fail_fast_on_rate_limit);
                    if give_up {
                        return Err(err);
                    }
                    let delay = self.policy.delay(attempt, err.is_rate_limit());
                    warn!(backend = backend.name(), attempt, delay_ms = delay.as_millis() as u64, err = %err, "retrying completion");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn fail_over(&self, from: &str, to: &str, err: &LlmError) {
        self.lock().failed_over = true;
        warn!(from, to, err = %err, "failing over to fallback backend");
        self.events.emit(
            "model_failover",
            json!({"from": from, "to": to, "reason": err.to_string()}),
        );
    }
}

impl LlmBackend for ModelRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn begin_task(&self, task_text: &str) {
        self.start_task(task_text);
    }

    fn complete(&self, request: &LlmRequest<'_>) -> Result<LlmResponse, LlmError> {
        let (primary, failed_over) = {
            let state = self.lock();
            (state.primary.clone(), state.failed_over)
        };
        let fallback = self.fallback.as_deref().filter(|f| *f != primary);

        let mut order: Vec<&str> = Vec::with_capacity(2);
        if !failed_over || fallback.is_none() {
            order.push(&primary);
        }
        if let Some(fallback) = fallback {
            order.push(fallback);
        }

        let mut last_err = LlmError::Fatal("no backend available".to_string());
        for (idx, name) in order.iter().enumerate() {
            let Some(backend) = self.backends.get(*name) else {
                continue;
            };
            let has_next = idx + 1 < order.len();
            match self.call_with_retries(backend.as_ref(), request, has_next) {
                Ok(response) => {
                    debug!(backend = %name, "completion ok");
                    self.events.emit(
                        "llm_usage",
                        json!({
                            "backend": name,
                            "input_tokens": response.usage.input_tokens,
                            "output_tokens": response.usage.output_tokens,
                        }),
                    );
                    return Ok(response);
                }
                Err(err) => {
                    if has_next {
                        self.fail_over(name, order[idx + 1], &err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}
