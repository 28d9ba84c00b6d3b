//! Black-box permutation sampling kernel.
//!
//! Each coalition walk starts from one background row and switches the
//! non-constant features to the instance's values one at a time, in a random
//! order. The output change at each switch is that feature's marginal
//! contribution for the coalition of features switched before it. Averaging
//! over walks estimates the Shapley value; a final efficiency correction makes
//! `Σ phi` equal the output change the varying features account for.
//!
//! Constant background columns always take the instance's value and get zero
//! attribution. When the instance moves such a column away from its
//! background value, the resulting output shift belongs to no feature: it is
//! left out of `Σ phi`, so `base_value + Σ phi` then differs from the
//! prediction by exactly that shift, as with the model-aware linear kernel.
//!
//! Randomness comes from a `StdRng` seeded per call, so a given seed, budget,
//! model and instance always produce the same vector.

use super::{AttributeContext, AttributionKernel, KernelKind, RawAttribution, check_width, evaluate, mean};
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::matrix::{ColumnStats, Matrix};
use crate::model::ModelHandle;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;

pub struct SamplingKernel {
    model: ModelHandle,
    background: Arc<Matrix>,
    /// Columns with non-zero background variance.
    active: Vec<usize>,
    base_value: f64,
    max_evals: usize,
    seed: u64,
}

impl fmt::Debug for SamplingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingKernel")
            .field("background_shape", &self.background.shape())
            .field("active", &self.active)
            .field("base_value", &self.base_value)
            .field("max_evals", &self.max_evals)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl SamplingKernel {
    /// Evaluates the model once over the whole background to fix the base
    /// value.
    pub fn new(
        model: ModelHandle,
        background: Arc<Matrix>,
        config: &KernelConfig,
    ) -> Result<Self, KernelError> {
        if background.nrows() == 0 {
            return Err(KernelError::shape("background data has no rows"));
        }
        let active = ColumnStats::compute(&background).active_columns(config.min_variance);
        let base_value = mean(&evaluate(model.as_ref(), &background)?);
        Ok(Self {
            model,
            background,
            active,
            base_value,
            max_evals: config.max_evals,
            seed: config.seed,
        })
    }

    /// Number of walks a budget of `max_evals` model evaluations buys. Each
    /// walk costs `active + 1` evaluations; at least one walk always runs.
    pub fn walks_for(&self, max_evals: usize) -> usize {
        (max_evals / (self.active.len() + 1)).max(1)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl AttributionKernel for SamplingKernel {
    fn kind(&self) -> KernelKind {
        KernelKind::Sampling
    }

    fn num_features(&self) -> usize {
        self.background.ncols()
    }

    fn base_value(&self) -> f64 {
        self.base_value
    }

    fn attribute(
        &self,
        instance: &[f64],
        ctx: &AttributeContext<'_>,
    ) -> Result<RawAttribution, KernelError> {
        let n = self.background.ncols();
        check_width(instance, n)?;

        let mut values = vec![0.0; n];
        if self.active.is_empty() {
            if ctx.cancel.is_cancelled() {
                return Err(KernelError::Cancelled);
            }
            let prediction = evaluate(self.model.as_ref(), &Matrix::from_row(instance)?)?[0];
            return Ok(RawAttribution {
                values,
                base_value: self.base_value,
                prediction,
            });
        }

        let walks = self.walks_for(ctx.max_evals.unwrap_or(self.max_evals));
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut rows: Vec<usize> = (0..self.background.nrows()).collect();
        rows.shuffle(&mut rng);
        let mut order = self.active.clone();

        let steps = self.active.len() + 1;
        let mut prediction = 0.0;
        for walk in 0..walks {
            if ctx.cancel.is_cancelled() {
                return Err(KernelError::Cancelled);
            }
            order.shuffle(&mut rng);

            let mut point = self.background.row(rows[walk % rows.len()]).to_vec();
            for (j, slot) in point.iter_mut().enumerate() {
                if !self.active.contains(&j) {
                    *slot = instance[j];
                }
            }
            let mut batch = Vec::with_capacity(steps * n);
            batch.extend_from_slice(&point);
            for &j in &order {
                point[j] = instance[j];
                batch.extend_from_slice(&point);
            }

            let outputs = evaluate(self.model.as_ref(), &Matrix::from_raw(steps, n, batch))?;
            for (step, &j) in order.iter().enumerate() {
                values[j] += outputs[step + 1] - outputs[step];
            }
            prediction = outputs[steps - 1];
        }

        let walks = walks as f64;
        values.iter_mut().for_each(|v| *v /= walks);
        let reference = self.pinned_base_value(instance)?;
        self.enforce_efficiency(&mut values, prediction - reference);

        Ok(RawAttribution {
            values,
            base_value: self.base_value,
            prediction,
        })
    }
}

impl SamplingKernel {
    /// Mean output over the background with the constant columns set to the
    /// instance's values. Equals the base value, without a model call, unless
    /// the instance differs from the background in some constant column.
    fn pinned_base_value(&self, instance: &[f64]) -> Result<f64, KernelError> {
        let n = self.background.ncols();
        let pinned: Vec<usize> = (0..n)
            .filter(|j| !self.active.contains(j))
            .filter(|&j| self.background.rows().any(|row| row[j] != instance[j]))
            .collect();
        if pinned.is_empty() {
            return Ok(self.base_value);
        }
        let mut data = Vec::with_capacity(self.background.nrows() * n);
        for row in self.background.rows() {
            let start = data.len();
            data.extend_from_slice(row);
            for &j in &pinned {
                data[start + j] = instance[j];
            }
        }
        let shifted = Matrix::from_raw(self.background.nrows(), n, data);
        Ok(mean(&evaluate(self.model.as_ref(), &shifted)?))
    }

    /// Spread `target - Σ phi` over the active features in proportion to
    /// `|phi|`, or evenly when every estimate is zero.
    fn enforce_efficiency(&self, values: &mut [f64], target: f64) {
        let residual = target - values.iter().sum::<f64>();
        if residual == 0.0 {
            return;
        }
        let total: f64 = self.active.iter().map(|&j| values[j].abs()).sum();
        if total > f64::EPSILON {
            for &j in &self.active {
                values[j] += residual * values[j].abs() / total;
            }
        } else {
            let share = residual / self.active.len() as f64;
            for &j in &self.active {
                values[j] += share;
            }
        }
    }
}
