//! Counterfactual synthesizer.
//!
//! A heuristic, not an optimizer: each of the most influential features is
//! pushed against the sign of its contribution, by an amount that grows as
//! the contribution shrinks. Features are treated independently, so combined
//! moves may overshoot or undershoot when features interact.

use crate::config::CounterfactualConfig;
use crate::ranking::RankedFactor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LIMITATIONS: &str = "Suggestions are a per-feature heuristic derived from attribution signs \
     and magnitudes. They do not search over interacting effects, so applying several changes \
     together may not produce the requested change in prediction.";

/// Most suggestions a report carries, whatever the config says.
pub const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDirection {
    Increase,
    Decrease,
}

impl ChangeDirection {
    /// Opposite the contribution's sign; zero contributions suggest an increase.
    pub fn against(contribution: f64) -> Self {
        if contribution > 0.0 {
            Self::Decrease
        } else {
            Self::Increase
        }
    }

    fn sign(&self) -> f64 {
        match self {
            Self::Increase => 1.0,
            Self::Decrease => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualSuggestion {
    pub feature: String,
    pub current_value: f64,
    pub suggested_value: f64,
    pub direction: ChangeDirection,
    /// The feature's signed attribution for the explained instance.
    pub contribution: f64,
    /// 1 = act on this first.
    pub priority: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterfactualReport {
    pub model_id: String,
    pub target_delta: f64,
    pub suggestions: Vec<CounterfactualSuggestion>,
    pub explanation: String,
    pub limitations: String,
    pub generated_at: DateTime<Utc>,
}

/// Build suggestions from factors already ranked by magnitude.
///
/// `value_of` maps a feature name to its current value in the instance;
/// features it does not know are skipped. At most
/// `min(config.max_suggestions, MAX_SUGGESTIONS)` suggestions come back.
pub fn suggest<F>(
    ranked: &[RankedFactor],
    value_of: F,
    target_delta: f64,
    config: &CounterfactualConfig,
) -> Vec<CounterfactualSuggestion>
where
    F: Fn(&str) -> Option<f64>,
{
    let floor = config.contribution_floor.max(f64::MIN_POSITIVE);
    ranked
        .iter()
        .filter_map(|factor| value_of(&factor.feature).map(|current| (factor, current)))
        .take(config.max_suggestions.min(MAX_SUGGESTIONS))
        .enumerate()
        .map(|(rank, (factor, current))| {
            let direction = ChangeDirection::against(factor.importance);
            let required = target_delta.abs() / factor.magnitude.max(floor);
            let scale = if current.abs() > f64::EPSILON {
                current.abs()
            } else {
                1.0
            };
            CounterfactualSuggestion {
                feature: factor.feature.clone(),
                current_value: current,
                suggested_value: current + direction.sign() * required * scale * config.step_scale,
                direction,
                contribution: factor.importance,
                priority: rank + 1,
            }
        })
        .collect()
}

pub fn summary(target_delta: f64) -> String {
    format!("To change the prediction by {target_delta:.3}, consider modifying these features:")
}
