//! Cost-aware routing among model tiers under the budget envelope.
//!
//! The router picks the cheapest tier whose expected confidence clears the
//! task's threshold, then reserves the tier's cost. Denied reservations
//! surface as explicit downgrades or `BudgetDenied`; there is no silent
//! fallback path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::budget::{BudgetEnvelope, Reservation};
use crate::ResilienceError;

/// Declared model tiers, ordered cheap-and-fast to slow-and-accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelTier {
    FastCheap,
    Balanced,
    SlowAccurate,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::FastCheap => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::SlowAccurate => "accurate",
        }
    }
}

/// Cost and quality profile for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierProfile {
    pub tier: ModelTier,
    pub cost_per_call: f64,
    /// Confidence this tier is expected to deliver on a baseline task.
    pub expected_confidence: f64,
}

/// A routed invocation: the chosen tier plus the budget reservation that
/// admitted it. Commit the reservation after the call succeeds.
pub struct RoutedCall {
    pub tier: ModelTier,
    pub estimated_cost: f64,
    /// True when the preferred tier was refused by the budget and a
    /// cheaper tier was admitted instead.
    pub downgraded: bool,
    /// The (tier, cost) the budget refused when this call was downgraded;
    /// callers record it in the audit stream.
    pub denied: Option<(String, f64)>,
    pub reservation: Reservation,
}

/// Chooses a tier for each task under the shared budget envelope.
pub struct CostRouter {
    tiers: Vec<TierProfile>,
    budget: Arc<BudgetEnvelope>,
}

impl CostRouter {
    /// `tiers` may arrive in any order; they are kept sorted by cost.
    pub fn new(mut tiers: Vec<TierProfile>, budget: Arc<BudgetEnvelope>) -> Self {
        tiers.sort_by(|a, b| {
            a.cost_per_call
                .partial_cmp(&b.cost_per_call)
                .expect("tier costs are finite")
        });
        Self { tiers, budget }
    }

    /// Route a task that needs `required_confidence`, with a complexity
    /// estimate in [0, 1] discounting each tier's expected confidence.
    ///
    /// Preference order: cheapest adequate tier first; if the budget
    /// refuses it, cheaper tiers are tried as an explicit downgrade. Only
    /// when no tier can reserve does the call fail with `BudgetDenied`.
    pub fn route(
        &self,
        required_confidence: f64,
        complexity: f64,
    ) -> Result<RoutedCall, ResilienceError> {
        let complexity = complexity.clamp(0.0, 1.0);

        let preferred = self
            .tiers
            .iter()
            .position(|t| t.expected_confidence * (1.0 - 0.2 * complexity) >= required_confidence)
            // Nothing clears the bar: take the most accurate tier available.
            .unwrap_or(self.tiers.len().saturating_sub(1));

        // Preferred tier first, then each cheaper tier as a downgrade.
        let preferred_profile = &self.tiers[preferred];
        let mut last_denial: Option<ResilienceError> = None;
        for (attempt, index) in (0..=preferred).rev().enumerate() {
            let profile = &self.tiers[index];
            match self.budget.try_reserve(profile.tier.as_str(), profile.cost_per_call) {
                Ok(reservation) => {
                    let downgraded = attempt > 0;
                    if downgraded {
                        warn!(
                            tier = profile.tier.as_str(),
                            "budget forced downgrade from preferred tier"
                        );
                    } else {
                        debug!(tier = profile.tier.as_str(), "routed invocation");
                    }
                    return Ok(RoutedCall {
                        tier: profile.tier,
                        estimated_cost: profile.cost_per_call,
                        downgraded,
                        denied: downgraded.then(|| {
                            (
                                preferred_profile.tier.as_str().to_string(),
                                preferred_profile.cost_per_call,
                            )
                        }),
                        reservation,
                    });
                }
                Err(err) => last_denial = Some(err),
            }
        }

        Err(last_denial.unwrap_or(ResilienceError::BudgetDenied {
            tier: "none".to_string(),
            estimated_cost: 0.0,
        }))
    }

    pub fn tiers(&self) -> &[TierProfile] {
        &self.tiers
    }
}
