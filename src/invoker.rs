use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::providers::ProviderError;
use crate::traits::{GenerativeService, StateStore};
use crate::types::{GenerationOutcome, GenerationRequest};

/// Why an invocation was not answered.
#[derive(Debug)]
pub enum InvokeError {
    /// The circuit is open; the external service was not called.
    CircuitOpen,
    /// The call failed after retries (or fatally on the first attempt).
    Provider(ProviderError),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::CircuitOpen => write!(f, "circuit open: generator call rejected"),
            InvokeError::Provider(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for InvokeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Retry + circuit breaker wrapper around every generator call. The single
/// place retry policy lives; call sites never roll their own backoff.
///
/// Retries re-attempt only the *call*; the message-send side effect is
/// guarded separately by [`send_once`] so a retried cycle can never deliver
/// the same message twice.
pub struct ResilientInvoker {
    service: Arc<dyn GenerativeService>,
    retry: RetryConfig,
    breaker_config: BreakerConfig,
    breaker: Mutex<BreakerState>,
}

impl ResilientInvoker {
    pub fn new(
        service: Arc<dyn GenerativeService>,
        retry: RetryConfig,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            service,
            retry,
            breaker_config,
            breaker: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub async fn invoke(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, InvokeError> {
        if !self.admit() {
            debug!(channel = %request.channel_id, "Circuit open, rejecting call");
            return Err(InvokeError::CircuitOpen);
        }

        let mut attempt = 1u32;
        loop {
            match self.service.invoke(request).await {
                Ok(outcome) => {
                    self.on_success();
                    return Ok(outcome);
                }
                Err(e) => {
                    self.on_failure();
                    if !e.is_retryable() {
                        warn!(channel = %request.channel_id, error = %e, "Fatal generator error");
                        return Err(InvokeError::Provider(e));
                    }
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            channel = %request.channel_id,
                            attempts = attempt,
                            error = %e,
                            "Generator call exhausted retries"
                        );
                        return Err(InvokeError::Provider(e));
                    }
                    if !self.admit() {
                        return Err(InvokeError::CircuitOpen);
                    }

                    let delay = self.backoff_delay(attempt, e.retry_after_secs);
                    debug!(
                        channel = %request.channel_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable generator error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Exponential backoff with randomized jitter; a provider-supplied
    /// retry-after floor wins over the computed delay.
    fn backoff_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let base = self.retry.initial_delay_ms as f64
            * self.retry.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min((self.retry.max_delay_secs * 1000) as f64);
        // Half fixed, half jittered, so the delay never collapses to zero.
        let jittered = capped / 2.0 + rand::thread_rng().gen::<f64>() * capped / 2.0;
        let computed = Duration::from_millis(jittered as u64);

        match retry_after_secs {
            Some(secs) => computed.max(Duration::from_secs(secs)),
            None => computed,
        }
    }

    /// Whether a call may proceed under the current breaker phase. An open
    /// circuit past its window transitions to half-open and admits a probe.
    fn admit(&self) -> bool {
        let mut state = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match state.phase {
            BreakerPhase::Closed | BreakerPhase::HalfOpen => true,
            BreakerPhase::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.breaker_config.open_secs) {
                    info!("Circuit half-open, probing");
                    state.phase = BreakerPhase::HalfOpen;
                    state.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures = 0;
        match state.phase {
            BreakerPhase::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.breaker_config.close_successes {
                    info!("Circuit closed");
                    state.phase = BreakerPhase::Closed;
                    state.opened_at = None;
                }
            }
            BreakerPhase::Closed | BreakerPhase::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        match state.phase {
            BreakerPhase::HalfOpen => {
                warn!("Probe failed, circuit re-opened");
                state.phase = BreakerPhase::Open;
                state.opened_at = Some(Instant::now());
            }
            BreakerPhase::Closed
                if state.consecutive_failures >= self.breaker_config.failure_threshold =>
            {
                warn!(
                    failures = state.consecutive_failures,
                    "Failure threshold reached, circuit opened"
                );
                state.phase = BreakerPhase::Open;
                state.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    #[cfg(test)]
    fn phase(&self) -> BreakerPhase {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner()).phase
    }
}

/// Execute a non-repeatable send exactly once per idempotency token.
///
/// The token is recorded *before* the send, so a crash between send and
/// persist is detected on retry: an already-delivered token short-circuits
/// without re-sending. Returns whether this call performed the send.
pub async fn send_once<F, Fut>(
    store: &dyn StateStore,
    token: &str,
    send: F,
) -> anyhow::Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    if store.is_delivered(token).await? {
        debug!(token, "Send already delivered, skipping");
        return Ok(false);
    }
    store.record_send_token(token).await?;
    send().await?;
    store.mark_delivered(token).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SqliteStateStore;
    use crate::types::ContextItem;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedService {
        script: Mutex<VecDeque<Result<GenerationOutcome, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedService {
        fn new(script: Vec<Result<GenerationOutcome, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerativeService for ScriptedService {
        async fn invoke(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::from_status(500, "script exhausted")))
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            channel_id: "chan".into(),
            items: vec![ContextItem {
                kind: crate::types::ContextKind::Message,
                content: "hi".into(),
                tokens: 1,
            }],
            tools: vec![],
            max_tokens: 64,
        }
    }

    fn ok_text() -> Result<GenerationOutcome, ProviderError> {
        Ok(GenerationOutcome::Final {
            text: "ok".into(),
            citations: vec![],
        })
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            multiplier: 1.0,
            max_delay_secs: 1,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_to_success() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ProviderError::from_status(503, "down")),
            Err(ProviderError::from_status(503, "down")),
            ok_text(),
        ]));
        let invoker =
            ResilientInvoker::new(service.clone(), fast_retry(3), BreakerConfig::default());

        let outcome = invoker.invoke(&request()).await.unwrap();
        assert!(matches!(outcome, GenerationOutcome::Final { .. }));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let service = Arc::new(ScriptedService::new(vec![Err(ProviderError::from_status(
            401, "bad key",
        ))]));
        let invoker =
            ResilientInvoker::new(service.clone(), fast_retry(3), BreakerConfig::default());

        let err = invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Provider(_)));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_and_rejects_without_calling() {
        let service = Arc::new(ScriptedService::new(
            (0..5)
                .map(|_| Err(ProviderError::from_status(503, "down")))
                .collect(),
        ));
        let invoker = ResilientInvoker::new(
            service.clone(),
            fast_retry(1),
            BreakerConfig {
                failure_threshold: 5,
                open_secs: 60,
                close_successes: 2,
            },
        );

        for _ in 0..5 {
            let _ = invoker.invoke(&request()).await;
        }
        assert_eq!(invoker.phase(), BreakerPhase::Open);
        assert_eq!(service.calls(), 5);

        // Open window: rejected immediately, service untouched.
        let err = invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, InvokeError::CircuitOpen));
        assert_eq!(service.calls(), 5);
    }

    #[tokio::test]
    async fn breaker_closes_after_half_open_successes() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ProviderError::from_status(503, "down")),
            Err(ProviderError::from_status(503, "down")),
            ok_text(),
            ok_text(),
        ]));
        let invoker = ResilientInvoker::new(
            service.clone(),
            fast_retry(1),
            BreakerConfig {
                failure_threshold: 2,
                open_secs: 0, // window elapses immediately for the test
                close_successes: 2,
            },
        );

        let _ = invoker.invoke(&request()).await;
        let _ = invoker.invoke(&request()).await;
        assert_eq!(invoker.phase(), BreakerPhase::Open);

        // Window (0s) has elapsed: half-open probes.
        invoker.invoke(&request()).await.unwrap();
        assert_eq!(invoker.phase(), BreakerPhase::HalfOpen);
        invoker.invoke(&request()).await.unwrap();
        assert_eq!(invoker.phase(), BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(ProviderError::from_status(503, "down")),
            Err(ProviderError::from_status(503, "down")),
        ]));
        let invoker = ResilientInvoker::new(
            service.clone(),
            fast_retry(1),
            BreakerConfig {
                failure_threshold: 1,
                open_secs: 0,
                close_successes: 2,
            },
        );

        let _ = invoker.invoke(&request()).await;
        assert_eq!(invoker.phase(), BreakerPhase::Open);
        let _ = invoker.invoke(&request()).await; // probe fails
        assert_eq!(invoker.phase(), BreakerPhase::Open);
    }

    #[tokio::test]
    async fn send_once_skips_already_delivered_tokens() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let sends = AtomicU32::new(0);

        let sent = send_once(&store, "tok-a", || async {
            sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert!(sent);
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        // Retry of the same logical send: short-circuits.
        let sent = send_once(&store, "tok-a", || async {
            sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert!(!sent);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_token_undelivered_for_retry() {
        let store = SqliteStateStore::in_memory().await.unwrap();

        let result = send_once(&store, "tok-b", || async {
            Err(anyhow::anyhow!("transport down"))
        })
        .await;
        assert!(result.is_err());

        // The send never completed, so a retry is allowed to send.
        let sent = send_once(&store, "tok-b", || async { Ok(()) }).await.unwrap();
        assert!(sent);
    }
}
