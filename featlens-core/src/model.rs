//! Model handles: the callable surface the engine explains.
//!
//! Models are owned by the caller and shared with the registry through
//! [`ModelHandle`]. The engine only ever calls [`PredictiveModel::predict`]
//! with whole batches, and only reads output channel 0.

use crate::matrix::Matrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What the model produces, which decides the attribution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Class probabilities (`predict_proba`-style models).
    Probabilistic,
    /// A point estimate; treated purely as a black box.
    PointPrediction,
}

/// Exact linear form of output channel 0: `y = weights · x + intercept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearCoefficients {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

/// An opaque predictive function.
pub trait PredictiveModel: Send + Sync {
    fn capability(&self) -> Capability;

    /// Evaluate every row of `batch`. Returns one output vector per row; the
    /// engine attributes channel 0 only.
    fn predict(&self, batch: &Matrix) -> anyhow::Result<Vec<Vec<f64>>>;

    /// Model internals for the model-aware kernel, when the model is linear in
    /// its inputs on output channel 0.
    fn linear_coefficients(&self) -> Option<LinearCoefficients> {
        None
    }
}

pub type ModelHandle = Arc<dyn PredictiveModel>;

type BatchFn = dyn Fn(&Matrix) -> anyhow::Result<Vec<Vec<f64>>> + Send + Sync;

/// Adapter turning a batch closure into a [`PredictiveModel`].
pub struct FnModel {
    capability: Capability,
    func: Box<BatchFn>,
}

impl FnModel {
    pub fn new<F>(capability: Capability, func: F) -> Self
    where
        F: Fn(&Matrix) -> anyhow::Result<Vec<Vec<f64>>> + Send + Sync + 'static,
    {
        Self {
            capability,
            func: Box::new(func),
        }
    }

    /// Wrap a single-output row function.
    pub fn from_row_fn<F>(capability: Capability, func: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::new(capability, move |batch| {
            Ok(batch.rows().map(|row| vec![func(row)]).collect())
        })
    }
}

impl fmt::Debug for FnModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnModel")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl PredictiveModel for FnModel {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn predict(&self, batch: &Matrix) -> anyhow::Result<Vec<Vec<f64>>> {
        (self.func)(batch)
    }
}

/// Linear regressor that exposes its coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub coefficients: LinearCoefficients,
    #[serde(default = "default_linear_capability")]
    pub capability: Capability,
}

fn default_linear_capability() -> Capability {
    Capability::PointPrediction
}

impl LinearModel {
    pub fn new(weights: Vec<f64>, intercept: f64) -> Self {
        Self {
            coefficients: LinearCoefficients { weights, intercept },
            capability: Capability::PointPrediction,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    fn score(&self, row: &[f64]) -> f64 {
        self.coefficients
            .weights
            .iter()
            .zip(row)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.coefficients.intercept
    }
}

impl PredictiveModel for LinearModel {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn predict(&self, batch: &Matrix) -> anyhow::Result<Vec<Vec<f64>>> {
        anyhow::ensure!(
            batch.ncols() == self.coefficients.weights.len(),
            "linear model expects {} features, got {}",
            self.coefficients.weights.len(),
            batch.ncols()
        );
        Ok(batch.rows().map(|row| vec![self.score(row)]).collect())
    }

    fn linear_coefficients(&self) -> Option<LinearCoefficients> {
        Some(self.coefficients.clone())
    }
}

/// Binary logistic classifier producing `[p, 1 - p]` per row, where
/// `p = sigmoid(weights · x + intercept)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn new(weights: Vec<f64>, intercept: f64) -> Self {
        Self { weights, intercept }
    }

    pub fn probability(&self, row: &[f64]) -> f64 {
        let z = self.weights.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + self.intercept;
        1.0 / (1.0 + (-z).exp())
    }
}

impl PredictiveModel for LogisticModel {
    fn capability(&self) -> Capability {
        Capability::Probabilistic
    }

    fn predict(&self, batch: &Matrix) -> anyhow::Result<Vec<Vec<f64>>> {
        anyhow::ensure!(
            batch.ncols() == self.weights.len(),
            "logistic model expects {} features, got {}",
            self.weights.len(),
            batch.ncols()
        );
        Ok(batch
            .rows()
            .map(|row| {
                let p = self.probability(row);
                vec![p, 1.0 - p]
            })
            .collect())
    }
}
