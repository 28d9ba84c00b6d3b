//! Attribution kernels: strategies that turn one model call into per-feature
//! contribution values.
//!
//! Two implementations sit behind [`AttributionKernel`]:
//! - [`LinearKernel`]: model-aware, exact for models linear in their inputs.
//! - [`SamplingKernel`]: black-box permutation sampling, always applicable.
//!
//! Only output channel [`ATTRIBUTED_CHANNEL`] of multi-output models is
//! attributed. Callers that need per-class attributions must register one
//! model handle per channel.

pub mod linear;
pub mod sampling;

pub use linear::LinearKernel;
pub use sampling::SamplingKernel;

use crate::error::KernelError;
use crate::matrix::Matrix;
use crate::model::PredictiveModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// The model output channel every kernel attributes.
pub const ATTRIBUTED_CHANNEL: usize = 0;

/// Which strategy produced an attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    ModelAwareLinear,
    Sampling,
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelAwareLinear => f.write_str("model_aware_linear"),
            Self::Sampling => f.write_str("sampling"),
        }
    }
}

/// Per-feature values for one instance, in feature order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAttribution {
    pub values: Vec<f64>,
    pub base_value: f64,
    /// Model output (channel 0) for the explained instance.
    pub prediction: f64,
}

impl RawAttribution {
    /// `base_value + Σ values`; approximates `prediction`.
    pub fn reconstructed(&self) -> f64 {
        self.base_value + self.values.iter().sum::<f64>()
    }
}

/// Per-call knobs shared by every kernel.
#[derive(Debug, Clone, Copy)]
pub struct AttributeContext<'a> {
    /// Overrides the kernel's configured evaluation budget.
    pub max_evals: Option<usize>,
    pub cancel: &'a CancellationToken,
}

/// One attribution strategy.
pub trait AttributionKernel: Send + Sync + fmt::Debug {
    fn kind(&self) -> KernelKind;

    fn num_features(&self) -> usize;

    /// Expected model output over the background data.
    fn base_value(&self) -> f64;

    fn attribute(
        &self,
        instance: &[f64],
        ctx: &AttributeContext<'_>,
    ) -> Result<RawAttribution, KernelError>;

    /// Attribute every row independently and sequentially.
    fn attribute_batch(
        &self,
        batch: &Matrix,
        ctx: &AttributeContext<'_>,
    ) -> Result<Vec<RawAttribution>, KernelError> {
        batch.rows().map(|row| self.attribute(row, ctx)).collect()
    }

    /// Mean absolute pairwise interaction matrix (`n x n`, symmetric) over
    /// `sample`, from a second-order decomposition.
    fn interaction_matrix(
        &self,
        _sample: &Matrix,
        _ctx: &AttributeContext<'_>,
    ) -> Result<Vec<Vec<f64>>, KernelError> {
        Err(KernelError::unsupported(format!(
            "{} kernel has no second-order decomposition",
            self.kind()
        )))
    }
}

pub(crate) fn check_width(instance: &[f64], expected: usize) -> Result<(), KernelError> {
    if instance.len() != expected {
        return Err(KernelError::shape(format!(
            "instance has {} features, explainer expects {expected}",
            instance.len()
        )));
    }
    if instance.iter().any(|v| !v.is_finite()) {
        return Err(KernelError::shape("instance contains non-finite values"));
    }
    Ok(())
}

/// Call the model and keep [`ATTRIBUTED_CHANNEL`], refusing anything that
/// would silently corrupt an attribution.
pub(crate) fn evaluate(model: &dyn PredictiveModel, batch: &Matrix) -> Result<Vec<f64>, KernelError> {
    let outputs = model
        .predict(batch)
        .map_err(|e| KernelError::computation(format!("model evaluation failed: {e:#}")))?;
    if outputs.len() != batch.nrows() {
        return Err(KernelError::computation(format!(
            "model returned {} rows for a batch of {}",
            outputs.len(),
            batch.nrows()
        )));
    }
    outputs
        .into_iter()
        .enumerate()
        .map(|(i, row)| match row.get(ATTRIBUTED_CHANNEL) {
            Some(v) if v.is_finite() => Ok(*v),
            Some(v) => Err(KernelError::computation(format!(
                "model returned non-finite output {v} for row {i}"
            ))),
            None => Err(KernelError::computation(format!(
                "model returned no output channels for row {i}"
            ))),
        })
        .collect()
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
