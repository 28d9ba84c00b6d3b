//! Aggregation & ranking: ordering attributions, global importance, and
//! pairwise interaction strength.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a factor pushes the prediction up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increases,
    Decreases,
}

impl Direction {
    /// Strictly positive importance increases; zero counts as decreasing.
    pub fn of(importance: f64) -> Self {
        if importance > 0.0 {
            Self::Increases
        } else {
            Self::Decreases
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increases => "increases",
            Self::Decreases => "decreases",
        }
    }
}

/// One feature's signed contribution, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFactor {
    pub feature: String,
    pub importance: f64,
    pub direction: Direction,
    pub magnitude: f64,
}

impl RankedFactor {
    pub fn new(feature: impl Into<String>, importance: f64) -> Self {
        Self {
            feature: feature.into(),
            importance,
            direction: Direction::of(importance),
            magnitude: importance.abs(),
        }
    }
}

/// Order `per_feature` by magnitude, descending.
///
/// Ties keep `feature_order` order; features missing from `feature_order`
/// follow, sorted by name. The map's own iteration order never matters.
pub fn rank(per_feature: &HashMap<String, f64>, feature_order: &[String]) -> Vec<RankedFactor> {
    let mut factors: Vec<RankedFactor> = feature_order
        .iter()
        .filter_map(|f| per_feature.get(f).map(|v| RankedFactor::new(f.as_str(), *v)))
        .collect();

    let mut extras: Vec<(&String, &f64)> = per_feature
        .iter()
        .filter(|(f, _)| !feature_order.contains(*f))
        .collect();
    extras.sort_by(|a, b| a.0.cmp(b.0));
    factors.extend(extras.into_iter().map(|(f, v)| RankedFactor::new(f.as_str(), *v)));

    // sort_by is stable
    factors.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
    factors
}

/// Rank a value vector aligned with `feature_names`.
pub fn rank_values(values: &[f64], feature_names: &[String]) -> Vec<RankedFactor> {
    let mut factors: Vec<RankedFactor> = feature_names
        .iter()
        .zip(values)
        .map(|(f, v)| RankedFactor::new(f.as_str(), *v))
        .collect();
    factors.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
    factors
}

/// A feature with its mean absolute attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Aggregate importance across many instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalImportance {
    pub model_id: String,
    /// Mean absolute attribution for every feature.
    pub global_importance: HashMap<String, f64>,
    /// Descending by importance, truncated to the requested count.
    pub top_features: Vec<FeatureImportance>,
    /// Rows actually attributed.
    pub sample_size: usize,
    pub generated_at: DateTime<Utc>,
}

/// Mean absolute value per column of an attribution matrix (one row per
/// instance).
pub fn mean_abs_importance(rows: &[Vec<f64>], num_features: usize) -> Vec<f64> {
    let mut acc = vec![0.0; num_features];
    for row in rows {
        for (a, v) in acc.iter_mut().zip(row) {
            *a += v.abs();
        }
    }
    let n = rows.len().max(1) as f64;
    acc.iter_mut().for_each(|a| *a /= n);
    acc
}

/// Features ordered by importance descending, ties in feature order.
pub fn order_importance(values: &[f64], feature_names: &[String], top_n: usize) -> Vec<FeatureImportance> {
    let mut ordered: Vec<FeatureImportance> = feature_names
        .iter()
        .zip(values)
        .map(|(f, v)| FeatureImportance {
            feature: f.clone(),
            importance: *v,
        })
        .collect();
    ordered.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ordered.truncate(top_n);
    ordered
}

/// How interaction strengths were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMethod {
    /// Second-order attribution decomposition from the kernel.
    SecondOrder,
    /// Absolute Pearson correlation between feature columns. Measures
    /// co-movement in the sample, not interaction in the model.
    CorrelationBased,
}

impl InteractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecondOrder => "second_order",
            Self::CorrelationBased => "correlation_based",
        }
    }
}

/// Unordered feature pair; `feature_a` precedes `feature_b` in feature order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPair {
    pub feature_a: String,
    pub feature_b: String,
    pub strength: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionReport {
    pub model_id: String,
    pub method: InteractionMethod,
    pub top_interactions: Vec<InteractionPair>,
    pub sample_size: usize,
    pub generated_at: DateTime<Utc>,
}

/// Upper-triangle pairs of a symmetric strength matrix, strongest first,
/// ties in (i, j) order, truncated to `top_n`.
pub fn top_pairs(strengths: &[Vec<f64>], feature_names: &[String], top_n: usize) -> Vec<InteractionPair> {
    let n = feature_names.len();
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in i + 1..n {
            pairs.push(InteractionPair {
                feature_a: feature_names[i].clone(),
                feature_b: feature_names[j].clone(),
                strength: strengths[i][j].abs(),
            });
        }
    }
    pairs.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    pairs.truncate(top_n);
    pairs
}

/// Absolute Pearson correlation between every pair of columns. Columns with
/// zero variance have no defined correlation and get 0.
pub fn abs_correlation_matrix(columns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = columns.len();
    let centered: Vec<(Vec<f64>, f64)> = columns
        .iter()
        .map(|col| {
            let mean = col.iter().sum::<f64>() / col.len().max(1) as f64;
            let c: Vec<f64> = col.iter().map(|v| v - mean).collect();
            let norm = c.iter().map(|v| v * v).sum::<f64>().sqrt();
            (c, norm)
        })
        .collect();

    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let (ci, ni) = &centered[i];
            let (cj, nj) = &centered[j];
            let r = if *ni <= f64::EPSILON || *nj <= f64::EPSILON {
                0.0
            } else {
                let dot: f64 = ci.iter().zip(cj).map(|(a, b)| a * b).sum();
                (dot / (ni * nj)).abs().min(1.0)
            };
            out[i][j] = r;
            out[j][i] = r;
        }
    }
    out
}
