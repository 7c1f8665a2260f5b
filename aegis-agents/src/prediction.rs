//! Prediction agent: cascade forecasting from historical patterns.
//!
//! Searches the vector memory for incidents similar to the current one and
//! estimates the probability of a cascade within the forecast horizon.
//! Lookups go through the memory dependency's circuit breaker and rate
//! limiter like every other external call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use aegis_events::{EvidenceRef, IncidentId};
use aegis_identity::IdentityService;
use aegis_resilience::{BreakerRegistry, Priority, RateLimiterRegistry};

use crate::interfaces::VectorMemory;
use crate::types::{AgentId, ProposedAction, Recommendation};
use crate::AgentError;

const MEMORY_DEPENDENCY: &str = "memory";

#[derive(Debug, Clone)]
pub struct PredictionConfig {
    /// Forecast horizon in minutes.
    pub horizon_minutes: u32,
    /// Cascade probability at which a prevention measure is recommended.
    pub cascade_threshold: f64,
    pub top_k: usize,
    pub min_similarity: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: 20,
            cascade_threshold: 0.5,
            top_k: 8,
            min_similarity: 0.35,
        }
    }
}

pub struct PredictionAgent {
    id: AgentId,
    identity: Arc<IdentityService>,
    memory: Arc<dyn VectorMemory>,
    breakers: Arc<BreakerRegistry>,
    limits: Arc<RateLimiterRegistry>,
    config: PredictionConfig,
}

impl PredictionAgent {
    pub fn new(
        id: AgentId,
        identity: Arc<IdentityService>,
        memory: Arc<dyn VectorMemory>,
        breakers: Arc<BreakerRegistry>,
        limits: Arc<RateLimiterRegistry>,
        config: PredictionConfig,
    ) -> Self {
        Self {
            id,
            identity,
            memory,
            breakers,
            limits,
            config,
        }
    }

    /// Forecast cascade probability for the incident and recommend a
    /// prevention measure when it clears the threshold.
    pub async fn forecast(
        &self,
        incident_id: IncidentId,
        round: u64,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<Recommendation, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let hits = self.guarded_search(description, cancel).await;

        let (probability, evidence): (f64, Vec<EvidenceRef>) = match &hits {
            Some(hits) if !hits.is_empty() => {
                // Similarity-weighted frequency of historical cascades.
                let mut weight_sum = 0.0;
                let mut cascade_weight = 0.0;
                for hit in hits {
                    weight_sum += hit.similarity;
                    if hit.payload["cascaded"].as_bool().unwrap_or(false) {
                        cascade_weight += hit.similarity;
                    }
                }
                let probability = if weight_sum > 0.0 {
                    cascade_weight / weight_sum
                } else {
                    0.0
                };
                let evidence = hits
                    .iter()
                    .map(|hit| EvidenceRef::Memory {
                        entry_id: hit.entry_id.clone(),
                    })
                    .collect();
                (probability, evidence)
            }
            _ => (0.0, Vec::new()),
        };

        let degraded = hits.is_none();
        let horizon = self.config.horizon_minutes;
        let (action, confidence, reasoning) = if probability >= self.config.cascade_threshold {
            (
                ProposedAction::Prevent {
                    measure: "preemptive_load_shed".to_string(),
                    cascade_probability: probability,
                },
                (0.5 + probability / 2.0).min(0.9),
                format!(
                    "{:.0}% cascade probability within {horizon} minutes across {} similar incidents",
                    probability * 100.0,
                    evidence.len()
                ),
            )
        } else {
            (
                ProposedAction::Prevent {
                    measure: "monitor_only".to_string(),
                    cascade_probability: probability,
                },
                if degraded { 0.25 } else { 0.6 },
                if degraded {
                    "memory lookup degraded; no basis for a cascade forecast".to_string()
                } else {
                    format!("cascade probability {:.2} below threshold", probability)
                },
            )
        };

        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence,
            action,
            evidence,
            reasoning,
            submitted_at: Utc::now(),
            signature: String::new(),
        };

        let bytes = recommendation.encoded_len();
        if bytes > crate::MAX_RECOMMENDATION_BYTES {
            return Err(AgentError::Oversized {
                bytes,
                limit: crate::MAX_RECOMMENDATION_BYTES,
            });
        }
        recommendation.signature = self
            .identity
            .sign(&self.id.to_string(), &recommendation.signable_bytes())?;
        Ok(recommendation)
    }

    /// Memory search behind breaker and limiter; `None` means the lookup
    /// degraded and the forecast has no historical basis.
    async fn guarded_search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Option<Vec<crate::interfaces::MemoryHit>> {
        let breaker = self.breakers.get(MEMORY_DEPENDENCY);
        let permit = breaker.try_acquire().ok()?;

        let bucket = self.limits.get(MEMORY_DEPENDENCY);
        let admitted = tokio::select! {
            granted = bucket.acquire(1.0, Priority::Normal, Duration::from_secs(5)) => granted,
            _ = cancel.cancelled() => return None,
        };
        if admitted.is_err() {
            debug!("memory lookup rate limited; degrading forecast");
            return None;
        }

        let search = self
            .memory
            .search(query, self.config.top_k, self.config.min_similarity);
        let result = tokio::select! {
            result = search => result,
            _ = cancel.cancelled() => return None,
        };

        match result {
            Ok(hits) => {
                permit.success();
                Some(hits)
            }
            Err(err) => {
                debug!(error = %err, "memory backend failure");
                permit.failure();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::StaticVectorMemory;
    use crate::types::AgentRole;
    use aegis_resilience::{BreakerConfig, RateLimitConfig};
    use serde_json::json;

    fn agent(memory: StaticVectorMemory) -> PredictionAgent {
        let identity = Arc::new(IdentityService::new());
        let id = AgentId::new(AgentRole::Prediction, 0);
        identity.register(&id.to_string()).unwrap();
        PredictionAgent::new(
            id,
            identity,
            Arc::new(memory),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(RateLimiterRegistry::new(RateLimitConfig::default())),
            PredictionConfig::default(),
        )
    }

    #[tokio::test]
    async fn historical_cascades_produce_a_prevention_measure() {
        let mut memory = StaticVectorMemory::new();
        memory.insert(
            "m1",
            "database connection pool exhaustion cascade",
            json!({"cascaded": true}),
        );
        memory.insert(
            "m2",
            "database pool saturation resolved quickly",
            json!({"cascaded": true}),
        );
        let agent = agent(memory);

        let rec = agent
            .forecast(
                IncidentId::new(),
                1,
                "database connection pool saturation",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match rec.action {
            ProposedAction::Prevent { measure, cascade_probability } => {
                assert_eq!(measure, "preemptive_load_shed");
                assert!(cascade_probability >= 0.5);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(!rec.evidence.is_empty());
    }

    #[tokio::test]
    async fn no_similar_history_means_monitor_only() {
        let mut memory = StaticVectorMemory::new();
        memory.insert("m1", "dns flake", json!({"cascaded": false}));
        let agent = agent(memory);

        let rec = agent
            .forecast(IncidentId::new(), 1, "database pool saturation", &CancellationToken::new())
            .await
            .unwrap();
        match rec.action {
            ProposedAction::Prevent { measure, cascade_probability } => {
                assert_eq!(measure, "monitor_only");
                assert!(cascade_probability < 0.5);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_forecast_returns_cancelled() {
        let agent = agent(StaticVectorMemory::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            agent
                .forecast(IncidentId::new(), 1, "anything", &cancel)
                .await,
            Err(AgentError::Cancelled)
        ));
    }
}
