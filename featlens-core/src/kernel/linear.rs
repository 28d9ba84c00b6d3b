//! Model-aware linear kernel.
//!
//! For a model linear in its inputs the Shapley value has a closed form:
//! `phi[i] = w[i] * (x[i] - mean[i])`. Coefficients come from the model when
//! it exposes them, otherwise from a least-squares surrogate fitted on the
//! background data, which must reproduce the model's outputs within
//! `surrogate_tolerance`.

use super::{AttributeContext, AttributionKernel, KernelKind, RawAttribution, check_width, evaluate, mean};
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::matrix::{ColumnStats, Matrix};
use crate::model::ModelHandle;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the kernel's coefficients came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientSource {
    Model,
    Surrogate,
}

pub struct LinearKernel {
    model: ModelHandle,
    /// Zero for constant background columns.
    weights: Vec<f64>,
    means: Vec<f64>,
    base_value: f64,
    source: CoefficientSource,
}

impl fmt::Debug for LinearKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearKernel")
            .field("weights", &self.weights)
            .field("means", &self.means)
            .field("base_value", &self.base_value)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl LinearKernel {
    /// Build the kernel over `background`.
    ///
    /// # Errors
    /// `KernelError::Computation` when the model is not usable as a linear
    /// model: mismatched or non-finite coefficients, too few background rows,
    /// singular normal equations, or a surrogate that does not fit.
    pub fn fit(
        model: ModelHandle,
        background: &Matrix,
        config: &KernelConfig,
    ) -> Result<Self, KernelError> {
        if background.nrows() == 0 {
            return Err(KernelError::shape("background data has no rows"));
        }
        let n = background.ncols();
        let stats = ColumnStats::compute(background);
        let active = stats.active_columns(config.min_variance);

        if let Some(coef) = model.linear_coefficients() {
            if coef.weights.len() != n {
                return Err(KernelError::computation(format!(
                    "model exposes {} coefficients for {n} features",
                    coef.weights.len()
                )));
            }
            if !coef.intercept.is_finite() || coef.weights.iter().any(|w| !w.is_finite()) {
                return Err(KernelError::computation("model coefficients are not finite"));
            }
            let mut weights = vec![0.0; n];
            for &j in &active {
                weights[j] = coef.weights[j];
            }
            let base_value = coef.intercept
                + coef
                    .weights
                    .iter()
                    .zip(&stats.means)
                    .map(|(w, m)| w * m)
                    .sum::<f64>();
            return Ok(Self {
                model,
                weights,
                means: stats.means,
                base_value,
                source: CoefficientSource::Model,
            });
        }

        let y = evaluate(model.as_ref(), background)?;
        let beta = fit_surrogate(background, &y, &stats.means, &active, config.surrogate_tolerance)?;
        let mut weights = vec![0.0; n];
        for (b, &j) in beta.iter().zip(&active) {
            weights[j] = *b;
        }
        Ok(Self {
            model,
            weights,
            means: stats.means,
            base_value: mean(&y),
            source: CoefficientSource::Surrogate,
        })
    }

    pub fn source(&self) -> CoefficientSource {
        self.source
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl AttributionKernel for LinearKernel {
    fn kind(&self) -> KernelKind {
        KernelKind::ModelAwareLinear
    }

    fn num_features(&self) -> usize {
        self.weights.len()
    }

    fn base_value(&self) -> f64 {
        self.base_value
    }

    fn attribute(
        &self,
        instance: &[f64],
        ctx: &AttributeContext<'_>,
    ) -> Result<RawAttribution, KernelError> {
        check_width(instance, self.weights.len())?;
        if ctx.cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        let values = self
            .weights
            .iter()
            .zip(&self.means)
            .zip(instance)
            .map(|((w, m), x)| w * (x - m))
            .collect();
        let prediction = evaluate(self.model.as_ref(), &Matrix::from_row(instance)?)?[0];
        Ok(RawAttribution {
            values,
            base_value: self.base_value,
            prediction,
        })
    }

    fn interaction_matrix(
        &self,
        sample: &Matrix,
        ctx: &AttributeContext<'_>,
    ) -> Result<Vec<Vec<f64>>, KernelError> {
        let n = self.weights.len();
        if sample.ncols() != n {
            return Err(KernelError::shape(format!(
                "sample has {} features, explainer expects {n}",
                sample.ncols()
            )));
        }
        if ctx.cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        // Additive in every feature: all second-order terms vanish.
        Ok(vec![vec![0.0; n]; n])
    }
}

/// Least-squares fit of `y` on the centered `active` columns. Returns one
/// coefficient per active column.
fn fit_surrogate(
    background: &Matrix,
    y: &[f64],
    means: &[f64],
    active: &[usize],
    tolerance: f64,
) -> Result<Vec<f64>, KernelError> {
    let (m, k) = (background.nrows(), active.len());
    if m <= k {
        return Err(KernelError::computation(format!(
            "{m} background rows cannot determine a linear surrogate over {k} varying features"
        )));
    }
    let x = Array2::from_shape_fn((m, k), |(i, a)| {
        let j = active[a];
        background.row(i)[j] - means[j]
    });
    let y_mean = mean(y);
    let yc = Array1::from_iter(y.iter().map(|v| v - y_mean));

    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&yc);
    let beta = cholesky_solve(&xtx, &xty)?;

    let residuals = &yc - &x.dot(&beta);
    let max_residual = residuals.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
    let scale = y.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    if max_residual > tolerance * scale {
        return Err(KernelError::computation(format!(
            "model output is not linear over the background data (max residual {max_residual:.3e})"
        )));
    }
    Ok(beta.to_vec())
}

/// Solve `a x = b` for symmetric positive definite `a` via Cholesky
/// factorization. A pivot that vanishes relative to the diagonal means the
/// normal equations are singular.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, KernelError> {
    let n = a.nrows();
    let scale = a.diag().iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
    let eps = scale.max(f64::MIN_POSITIVE) * 1e-12;

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - dot;
                if diag <= eps {
                    return Err(KernelError::computation(
                        "background distribution is singular; features are linearly dependent",
                    ));
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - dot) / l[[j, j]];
            }
        }
    }

    // L z = b
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let dot: f64 = (0..i).map(|k| l[[i, k]] * z[k]).sum();
        z[i] = (b[i] - dot) / l[[i, i]];
    }
    // L^T x = z
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let dot: f64 = (i + 1..n).map(|k| l[[k, i]] * x[k]).sum();
        x[i] = (z[i] - dot) / l[[i, i]];
    }
    Ok(x)
}
