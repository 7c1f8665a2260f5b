//! Guarded model invocation shared by every agent role.
//!
//! One call path: circuit breaker admission, rate-limiter tokens, cost
//! routing with budget reservation, then the provider call with bounded
//! retries and schema validation. Failure modes come back as explicit
//! degradation markers so callers emit the right audit events and fall
//! back to placeholder reasoning instead of crashing the round.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use aegis_events::{EventPayload, EventStore, IncidentId};
use aegis_resilience::{
    retry, Backoff, BreakerRegistry, CostRouter, ModelTier, Priority, RateLimiterRegistry,
    ResilienceError,
};

use crate::interfaces::{InvocationResult, ModelError, ModelInvoker};

const MODEL_DEPENDENCY: &str = "model";

/// Why a guarded call degraded instead of completing.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradeReason {
    /// Breaker open: dependency is known-bad, fail fast.
    CircuitOpen,
    /// Budget envelope refused every admissible tier.
    BudgetDenied { tier: String, estimated_cost: f64 },
    /// Rate limiter shed the request or the deadline lapsed waiting.
    RateLimited,
    /// Transient provider failures exhausted the retry budget.
    Exhausted,
    /// The operation was cancelled cooperatively.
    Cancelled,
}

/// Outcome of a guarded invocation.
pub enum GuardedOutcome {
    Completed {
        result: InvocationResult,
        body: Value,
        tier: ModelTier,
        /// The preferred tier was budget-refused and a cheaper tier ran
        /// instead; callers emit a budget-denied audit event.
        downgraded: bool,
    },
    Degraded(DegradeReason),
}

/// Breaker + limiter + router wrapping of a [`ModelInvoker`].
///
/// Degradations are audited: budget denials append `BUDGET_DENIED` and
/// the other degrade paths append a degradation event to the incident
/// stream, signed by the calling agent.
pub struct GuardedInvoker {
    invoker: Arc<dyn ModelInvoker>,
    breakers: Arc<BreakerRegistry>,
    limits: Arc<RateLimiterRegistry>,
    router: Arc<CostRouter>,
    store: Arc<EventStore>,
    backoff: Backoff,
}

impl GuardedInvoker {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        breakers: Arc<BreakerRegistry>,
        limits: Arc<RateLimiterRegistry>,
        router: Arc<CostRouter>,
        store: Arc<EventStore>,
    ) -> Self {
        Self {
            invoker,
            breakers,
            limits,
            router,
            store,
            backoff: Backoff::default(),
        }
    }

    async fn audit(&self, incident_id: IncidentId, producer: &str, payload: EventPayload) {
        if let Err(err) = self.store.append_next(incident_id, producer, payload).await {
            warn!(error = %err, "failed to append degradation audit event");
        }
    }

    /// Invoke the model for a task needing `required_confidence`, parsing
    /// the response as a JSON object. Every suspension point polls the
    /// cancellation token.
    #[allow(clippy::too_many_arguments)]
    pub async fn invoke_json(
        &self,
        incident_id: IncidentId,
        producer: &str,
        required_confidence: f64,
        complexity: f64,
        prompt: &str,
        max_tokens: u32,
        priority: Priority,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> GuardedOutcome {
        if cancel.is_cancelled() {
            return GuardedOutcome::Degraded(DegradeReason::Cancelled);
        }

        let routed = match self.router.route(required_confidence, complexity) {
            Ok(routed) => routed,
            Err(ResilienceError::BudgetDenied { tier, estimated_cost }) => {
                self.audit(incident_id, producer, EventPayload::BudgetDenied {
                    dependency: MODEL_DEPENDENCY.to_string(),
                    tier: tier.clone(),
                    estimated_cost,
                })
                .await;
                return GuardedOutcome::Degraded(DegradeReason::BudgetDenied {
                    tier,
                    estimated_cost,
                });
            }
            Err(_) => return GuardedOutcome::Degraded(DegradeReason::Exhausted),
        };

        // A downgrade means the preferred tier was refused; that denial
        // is audited even though a cheaper tier is about to run.
        if let Some((tier, estimated_cost)) = &routed.denied {
            self.audit(incident_id, producer, EventPayload::BudgetDenied {
                dependency: MODEL_DEPENDENCY.to_string(),
                tier: tier.clone(),
                estimated_cost: *estimated_cost,
            })
            .await;
        }

        let breaker = self.breakers.get(MODEL_DEPENDENCY);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("model breaker open; degrading");
                self.audit(incident_id, producer, EventPayload::Degraded {
                    dependency: MODEL_DEPENDENCY.to_string(),
                    reason: "circuit open".to_string(),
                })
                .await;
                return GuardedOutcome::Degraded(DegradeReason::CircuitOpen);
            }
        };

        let bucket = self.limits.get(MODEL_DEPENDENCY);
        let admitted = tokio::select! {
            granted = bucket.acquire(1.0, priority, deadline) => granted,
            _ = cancel.cancelled() => {
                return GuardedOutcome::Degraded(DegradeReason::Cancelled);
            }
        };
        if admitted.is_err() {
            self.audit(incident_id, producer, EventPayload::Degraded {
                dependency: MODEL_DEPENDENCY.to_string(),
                reason: "rate limited".to_string(),
            })
            .await;
            return GuardedOutcome::Degraded(DegradeReason::RateLimited);
        }

        let tier = routed.tier;
        let attempt_call = retry(&self.backoff, |attempt| {
            let invoker = self.invoker.clone();
            let prompt = prompt.to_string();
            async move {
                if attempt > 0 {
                    debug!(attempt, "retrying model invocation");
                }
                let result = invoker.invoke(tier, &prompt, max_tokens, deadline).await?;
                // Schema validation at the boundary: a response that is not
                // a JSON object is a transient malformed result.
                let body: Value = serde_json::from_str(&result.content)
                    .map_err(|e| ModelError::Malformed(e.to_string()))?;
                if !body.is_object() {
                    return Err(ModelError::Malformed("expected a JSON object".to_string()));
                }
                Ok::<(InvocationResult, Value), ModelError>((result, body))
            }
        });

        let outcome = tokio::select! {
            outcome = attempt_call => outcome,
            _ = cancel.cancelled() => {
                return GuardedOutcome::Degraded(DegradeReason::Cancelled);
            }
        };

        match outcome {
            Ok((result, body)) => {
                permit.success();
                routed.reservation.commit();
                GuardedOutcome::Completed {
                    result,
                    body,
                    tier,
                    downgraded: routed.downgraded,
                }
            }
            Err(err) => {
                warn!(error = %err, "model invocation exhausted retries; degrading");
                permit.failure();
                self.audit(incident_id, producer, EventPayload::Degraded {
                    dependency: MODEL_DEPENDENCY.to_string(),
                    reason: format!("retries exhausted: {err}"),
                })
                .await;
                // Reservation dropped here: the budget rolls back.
                GuardedOutcome::Degraded(DegradeReason::Exhausted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::ScriptedModelInvoker;
    use aegis_events::MemoryEventSink;
    use aegis_identity::IdentityService;
    use aegis_resilience::{
        BreakerConfig, BudgetConfig, BudgetEnvelope, RateLimitConfig, TierProfile,
    };
    use serde_json::json;

    const TESTER: &str = "tester";

    fn guarded(invoker: Arc<ScriptedModelInvoker>, hourly_cap: f64) -> GuardedInvoker {
        let identity = Arc::new(IdentityService::new());
        identity.register(TESTER).unwrap();
        let store = Arc::new(EventStore::new(Arc::new(MemoryEventSink::new()), identity));
        let budget = Arc::new(BudgetEnvelope::new(BudgetConfig {
            hourly_cap,
            daily_cap: 1_000.0,
        }));
        let router = Arc::new(CostRouter::new(
            vec![
                TierProfile { tier: ModelTier::FastCheap, cost_per_call: 1.0, expected_confidence: 0.6 },
                TierProfile { tier: ModelTier::Balanced, cost_per_call: 4.0, expected_confidence: 0.8 },
                TierProfile { tier: ModelTier::SlowAccurate, cost_per_call: 10.0, expected_confidence: 0.95 },
            ],
            budget,
        ));
        GuardedInvoker::new(
            invoker,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(RateLimiterRegistry::new(RateLimitConfig { rps: 100.0, burst: 100.0 })),
            router,
            store,
        )
    }

    #[tokio::test]
    async fn completes_and_parses_json() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        invoker.push_json(json!({"confidence": 0.9, "severity": "CRITICAL"}));
        let guarded = guarded(invoker, 100.0);

        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.7, 0.2, "classify", 256, Priority::High,
                Duration::from_secs(5), &CancellationToken::new())
            .await;

        match outcome {
            GuardedOutcome::Completed { body, tier, downgraded, .. } => {
                assert_eq!(body["confidence"], json!(0.9));
                assert_eq!(tier, ModelTier::Balanced);
                assert!(!downgraded);
            }
            GuardedOutcome::Degraded(reason) => panic!("unexpected degrade: {reason:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_responses_are_retried_then_exhausted() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        for _ in 0..4 {
            invoker.push(Ok(InvocationResult {
                content: "not json at all".into(),
                prompt_tokens: 1,
                completion_tokens: 1,
                request_id: "r".into(),
            }));
        }
        let mut guarded = guarded(invoker, 100.0);
        guarded.backoff = Backoff {
            base: Duration::from_millis(1),
            factor: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 3,
        };

        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.7, 0.0, "classify", 256, Priority::High,
                Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            GuardedOutcome::Degraded(DegradeReason::Exhausted)
        ));
    }

    #[tokio::test]
    async fn budget_exhaustion_degrades_without_calling_the_provider() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        let guarded = guarded(invoker, 0.1);

        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.9, 0.0, "diagnose", 256, Priority::High,
                Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            GuardedOutcome::Degraded(DegradeReason::BudgetDenied { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        let guarded = guarded(invoker, 100.0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.7, 0.0, "classify", 256, Priority::High,
                Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(
            outcome,
            GuardedOutcome::Degraded(DegradeReason::Cancelled)
        ));
    }

    #[tokio::test]
    async fn failed_call_rolls_budget_back() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        // Script only errors: the call will exhaust retries.
        for _ in 0..4 {
            invoker.push(Err(ModelError::Provider("boom".into())));
        }
        let mut guarded = guarded(invoker.clone(), 4.0);
        guarded.backoff = Backoff {
            base: Duration::from_millis(1),
            factor: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 2,
        };

        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.7, 0.0, "classify", 256, Priority::High,
                Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, GuardedOutcome::Degraded(DegradeReason::Exhausted)));

        // The 4-unit reservation was rolled back: a fresh call can reserve.
        invoker.push_json(json!({"ok": true}));
        let outcome = guarded
            .invoke_json(IncidentId::new(), TESTER, 0.7, 0.0, "classify", 256, Priority::High,
                Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, GuardedOutcome::Completed { .. }));
    }
}
