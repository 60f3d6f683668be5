// Fallback Manager
// Wraps fallible operations in a strategy chain (retry / alternatives /
// degraded / fail-fast) behind per-component circuit breakers, so callers
// see typed outcomes instead of raw errors.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use maestro_observability::EventBus;
use maestro_types::{Component, CoreError, RuntimeEvent};

mod breaker;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState};
use breaker::BreakerSet;

/// Recovery strategy applied around an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Exponential backoff with jitter, capped attempts
    Retry,
    /// Try each registered alternative in order, then the degraded handler
    Alternative,
    /// Call the degraded handler for a synthetic result
    Degraded,
    /// No recovery
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// When false the degraded strategy falls through to failure
    pub enable_degraded_mode: bool,
    /// Per-component default strategy; `execute` contexts may override
    pub strategies: HashMap<Component, Strategy>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(Component::Llm, Strategy::Retry);
        strategies.insert(Component::Memory, Strategy::Retry);
        strategies.insert(Component::Tools, Strategy::Retry);
        strategies.insert(Component::Planning, Strategy::Degraded);
        strategies.insert(Component::SubAgents, Strategy::Alternative);
        strategies.insert(Component::Orchestrator, Strategy::FailFast);
        Self {
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            enable_degraded_mode: true,
            strategies,
        }
    }
}

pub type OpFuture<T> = BoxFuture<'static, Result<T, CoreError>>;

/// A named backup implementation of the wrapped operation
pub struct Alternative<T> {
    pub name: String,
    pub run: Box<dyn Fn() -> OpFuture<T> + Send + Sync>,
}

impl<T> Alternative<T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }
}

/// Synthesises a result from a terminal error, or declines.
pub type DegradedHandler<T> = Box<dyn Fn(&CoreError) -> Option<T> + Send + Sync>;

/// Call-site context for one wrapped operation
pub struct FallbackContext<T> {
    pub component: Component,
    /// Informational label carried into logs
    pub operation: String,
    /// Overrides the per-component default when set
    pub strategy: Option<Strategy>,
    pub alternatives: Vec<Alternative<T>>,
    pub degraded: Option<DegradedHandler<T>>,
}

impl<T> FallbackContext<T> {
    pub fn new(component: Component, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            strategy: None,
            alternatives: Vec::new(),
            degraded: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_alternative(mut self, alternative: Alternative<T>) -> Self {
        self.alternatives.push(alternative);
        self
    }

    pub fn with_degraded<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CoreError) -> Option<T> + Send + Sync + 'static,
    {
        self.degraded = Some(Box::new(handler));
        self
    }
}

/// How a successful value was obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPath {
    Primary,
    Retry { attempts: u32 },
    Alternative { name: String },
    Degraded,
}

/// Terminal outcome of a wrapped operation. Never an Err: failure is a value.
#[derive(Debug)]
pub enum FallbackOutcome<T> {
    Success { value: T, via: RecoveryPath },
    Failure { error: CoreError },
}

impl<T> FallbackOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, FallbackOutcome::Success { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            FallbackOutcome::Success {
                via: RecoveryPath::Degraded,
                ..
            }
        )
    }

    pub fn into_result(self) -> Result<T, CoreError> {
        match self {
            FallbackOutcome::Success { value, .. } => Ok(value),
            FallbackOutcome::Failure { error } => Err(error),
        }
    }
}

/// Per-runtime fallback manager. Owns the breaker set; cheap to share.
pub struct FallbackManager {
    config: FallbackConfig,
    breakers: BreakerSet,
    events: EventBus,
}

impl FallbackManager {
    pub fn new(config: FallbackConfig, events: EventBus) -> Self {
        let breakers = BreakerSet::new(config.breaker.clone());
        Self {
            config,
            breakers,
            events,
        }
    }

    pub fn breaker_snapshot(&self, component: Component) -> BreakerSnapshot {
        self.breakers.snapshot(component)
    }

    fn strategy_for<T>(&self, ctx: &FallbackContext<T>) -> Strategy {
        ctx.strategy
            .or_else(|| self.config.strategies.get(&ctx.component).copied())
            .unwrap_or(Strategy::FailFast)
    }

    /// Execute `op` under the context's strategy chain. The breaker is fed
    /// one terminal outcome per logical call: retries collapse into it, and
    /// alternatives/degraded synthesis happen after it is recorded.
    pub async fn execute<T, F, Fut>(&self, ctx: FallbackContext<T>, op: F) -> FallbackOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let strategy = self.strategy_for(&ctx);
        let component = ctx.component;

        let primary_error = if let Err(rejection) = self.breakers.before_call(component) {
            tracing::debug!(
                component = component.as_str(),
                operation = %ctx.operation,
                "circuit open, skipping primary operation"
            );
            rejection
        } else {
            let (outcome, attempts) = match strategy {
                Strategy::Retry => self.run_with_retries(&op).await,
                _ => (op().await, 1),
            };
            match outcome {
                Ok(value) => {
                    self.record_success(component);
                    let via = if attempts > 1 {
                        RecoveryPath::Retry { attempts }
                    } else {
                        RecoveryPath::Primary
                    };
                    return FallbackOutcome::Success { value, via };
                }
                Err(error) => {
                    self.record_failure(component);
                    tracing::warn!(
                        component = component.as_str(),
                        operation = %ctx.operation,
                        error = %error,
                        attempts,
                        "operation failed after primary phase"
                    );
                    error
                }
            }
        };

        if strategy == Strategy::Alternative {
            for alternative in &ctx.alternatives {
                match (alternative.run)().await {
                    Ok(value) => {
                        return FallbackOutcome::Success {
                            value,
                            via: RecoveryPath::Alternative {
                                name: alternative.name.clone(),
                            },
                        };
                    }
                    Err(error) => {
                        tracing::warn!(
                            component = component.as_str(),
                            alternative = %alternative.name,
                            error = %error,
                            "alternative failed"
                        );
                    }
                }
            }
        }

        if matches!(strategy, Strategy::Degraded | Strategy::Alternative)
            && self.config.enable_degraded_mode
        {
            if let Some(handler) = &ctx.degraded {
                if let Some(value) = handler(&primary_error) {
                    return FallbackOutcome::Success {
                        value,
                        via: RecoveryPath::Degraded,
                    };
                }
            }
        }

        FallbackOutcome::Failure {
            error: primary_error,
        }
    }

    async fn run_with_retries<T, F, Fut>(&self, op: &F) -> (Result<T, CoreError>, u32)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) => {
                    let attempts_left = attempt < retry.max_retries.max(1);
                    if !attempts_left || !error.is_retryable() {
                        return (Err(error), attempt);
                    }
                    let delay = backoff_delay(retry, attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn record_success(&self, component: Component) {
        if self.breakers.on_success(component) {
            self.events.publish(RuntimeEvent::CircuitClosed {
                component,
                timestamp: Utc::now(),
            });
        }
    }

    fn record_failure(&self, component: Component) {
        if self.breakers.on_failure(component) {
            self.events.publish(RuntimeEvent::CircuitOpened {
                component,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Delay before attempt `k + 1`: min(base * backoff^(k-1), max) with a
/// uniform +/-25% jitter.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry.backoff.powi(attempt.saturating_sub(1) as i32);
    let raw = (retry.base_delay_ms as f64 * exp).min(retry.max_delay_ms as f64);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((raw * jitter).round() as u64)
}

/// Enforce a deadline on any future, mapping expiry to `CoreError::Timeout`.
pub async fn with_deadline<T, Fut>(deadline_ms: u64, fut: Fut) -> Result<T, CoreError>
where
    Fut: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(Duration::from_millis(deadline_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(deadline_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> FallbackManager {
        FallbackManager::new(FallbackConfig::default(), EventBus::new())
    }

    fn fast_retry_manager(max_retries: u32) -> FallbackManager {
        let mut config = FallbackConfig::default();
        config.retry = RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff: 2.0,
        };
        FallbackManager::new(config, EventBus::new())
    }

    #[tokio::test]
    async fn primary_success_passes_through() {
        let m = manager();
        let outcome = m
            .execute(
                FallbackContext::<u32>::new(Component::Memory, "read"),
                || async { Ok(7u32) },
            )
            .await;
        match outcome {
            FallbackOutcome::Success { value, via } => {
                assert_eq!(value, 7);
                assert_eq!(via, RecoveryPath::Primary);
            }
            FallbackOutcome::Failure { error } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let m = fast_retry_manager(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = m
            .execute(
                FallbackContext::<&'static str>::new(Component::Llm, "complete"),
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(CoreError::Transport("flaky".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            FallbackOutcome::Success { via, .. } => {
                assert_eq!(via, RecoveryPath::Retry { attempts: 3 });
            }
            FallbackOutcome::Failure { error } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_retried() {
        let m = fast_retry_manager(5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let outcome = m
            .execute(
                FallbackContext::<()>::new(Component::Llm, "complete"),
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(CoreError::InvalidOutput("garbage".into()))
                    }
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn alternatives_run_in_order() {
        let m = manager();
        let ctx = FallbackContext::<&'static str>::new(Component::SubAgents, "run_task")
            .with_strategy(Strategy::Alternative)
            .with_alternative(Alternative::new("first", || async {
                Err(CoreError::Internal("still broken".into()))
            }))
            .with_alternative(Alternative::new("second", || async { Ok("recovered") }));
        let outcome = m
            .execute(ctx, || async { Err(CoreError::Internal("primary down".into())) })
            .await;
        match outcome {
            FallbackOutcome::Success { value, via } => {
                assert_eq!(value, "recovered");
                assert_eq!(
                    via,
                    RecoveryPath::Alternative {
                        name: "second".to_string()
                    }
                );
            }
            FallbackOutcome::Failure { error } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn degraded_handler_synthesises_result() {
        let m = manager();
        let ctx = FallbackContext::<String>::new(Component::Planning, "plan")
            .with_strategy(Strategy::Degraded)
            .with_degraded(|err| Some(format!("degraded: {}", err.kind())));
        let outcome = m
            .execute(ctx, || async { Err(CoreError::Transport("llm down".into())) })
            .await;
        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn degraded_mode_can_be_disabled() {
        let mut config = FallbackConfig::default();
        config.enable_degraded_mode = false;
        let m = FallbackManager::new(config, EventBus::new());
        let ctx = FallbackContext::<String>::new(Component::Planning, "plan")
            .with_strategy(Strategy::Degraded)
            .with_degraded(|_| Some("should not appear".to_string()));
        let outcome = m
            .execute(ctx, || async { Err(CoreError::Transport("down".into())) })
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn fail_fast_does_no_recovery() {
        let m = manager();
        let ctx = FallbackContext::<String>::new(Component::Orchestrator, "finalize")
            .with_alternative(Alternative::new("unused", || async { Ok("nope".to_string()) }))
            .with_degraded(|_| Some("nope".to_string()));
        let outcome = m
            .execute(ctx, || async { Err(CoreError::Internal("fatal".into())) })
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_allows_single_probe() {
        let mut config = FallbackConfig::default();
        config.breaker = BreakerConfig {
            failure_threshold: 2,
            failure_window_ms: 10_000,
            cooldown_ms: 100,
        };
        config.retry.max_retries = 1;
        let m = FallbackManager::new(config, EventBus::new());
        let calls = Arc::new(AtomicU32::new(0));

        let failing = |calls: Arc<AtomicU32>| {
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CoreError::Transport("down".into()))
                }
            }
        };

        for _ in 0..2 {
            let outcome = m
                .execute(
                    FallbackContext::<()>::new(Component::Llm, "complete"),
                    failing(calls.clone()),
                )
                .await;
            assert!(!outcome.is_success());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.breaker_snapshot(Component::Llm).state, BreakerState::Open);

        // Third call is rejected without invoking the provider.
        let outcome = m
            .execute(
                FallbackContext::<()>::new(Component::Llm, "complete"),
                failing(calls.clone()),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match outcome {
            FallbackOutcome::Failure { error } => {
                assert!(matches!(error, CoreError::CircuitOpen(Component::Llm)));
            }
            FallbackOutcome::Success { .. } => panic!("expected rejection"),
        }

        // After the cooldown, a single probe goes through; success closes.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = m
            .execute(
                FallbackContext::<&'static str>::new(Component::Llm, "complete"),
                || async { Ok("recovered") },
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(
            m.breaker_snapshot(Component::Llm).state,
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn with_deadline_maps_expiry_to_timeout() {
        let err = with_deadline(10, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(10)));
    }
}
