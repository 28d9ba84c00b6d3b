//! Explanation engine: the public operations.
//!
//! The engine owns the [`ExplainerRegistry`] and routes every request through
//! it: look up the entry, attribute through its kernel, then rank, aggregate,
//! synthesize counterfactuals and render text. Bulk operations attribute rows
//! concurrently on the blocking pool, bounded by a semaphore.

use crate::config::ExplainConfig;
use crate::counterfactual::{self, CounterfactualReport};
use crate::error::{ExplainError, KernelError, Operation, Result};
use crate::kernel::{ATTRIBUTED_CHANNEL, AttributeContext, KernelKind, RawAttribution};
use crate::matrix::Matrix;
use crate::model::ModelHandle;
use crate::ranking::{
    GlobalImportance, InteractionMethod, InteractionReport, RankedFactor, abs_correlation_matrix,
    mean_abs_importance, order_importance, rank_values, top_pairs,
};
use crate::registry::{ExplainerEntry, ExplainerInfo, ExplainerRegistry};
use crate::render::render;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accepted `top_n` for global importance.
pub const GLOBAL_TOP_N: RangeInclusive<usize> = 5..=100;

/// Upper bound on rows used for interaction analysis, whatever the config says.
pub const MAX_INTERACTION_ROWS: usize = 50;

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Overrides `kernel.max_evals` for this request.
    pub max_evals: Option<usize>,
    /// Overrides `batch.max_concurrency` for this request.
    pub max_concurrency: Option<usize>,
    pub cancel: CancellationToken,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_evals: None,
            max_concurrency: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RequestOptions {
    pub fn with_max_evals(mut self, max_evals: usize) -> Self {
        self.max_evals = Some(max_evals);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Per-feature attribution for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionResult {
    pub base_value: f64,
    pub per_feature: HashMap<String, f64>,
    /// Model output for the instance, on `output_channel`.
    pub prediction: f64,
    /// Output channel the values explain. Always
    /// [`ATTRIBUTED_CHANNEL`]; other
    /// channels of multi-output models are not attributed.
    pub output_channel: usize,
    pub kernel: KernelKind,
    pub generated_at: DateTime<Utc>,
}

impl AttributionResult {
    /// `base_value + Σ per_feature`.
    pub fn reconstructed(&self) -> f64 {
        self.base_value + self.per_feature.values().sum::<f64>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub model_id: String,
    pub attribution: AttributionResult,
    pub top_factors: Vec<RankedFactor>,
    pub explanation_text: String,
}

/// A batch result tagged with the row it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedExplanation {
    pub index: usize,
    pub explanation: Explanation,
}

#[derive(Debug, Clone)]
pub struct ExplanationEngine {
    registry: Arc<ExplainerRegistry>,
    config: Arc<ExplainConfig>,
}

impl Default for ExplanationEngine {
    fn default() -> Self {
        Self::new(ExplainConfig::default())
    }
}

impl ExplanationEngine {
    pub fn new(config: ExplainConfig) -> Self {
        Self {
            registry: Arc::new(ExplainerRegistry::new(config.kernel.clone())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExplainerRegistry {
        &self.registry
    }

    /// Register `model` under `model_id`, replacing any previous entry.
    pub fn initialize_explainer(
        &self,
        model_id: &str,
        model: ModelHandle,
        background: Matrix,
        feature_names: Vec<String>,
    ) -> Result<ExplainerInfo> {
        self.registry
            .initialize_explainer(model_id, model, background, feature_names)
            .map(|entry| entry.info())
    }

    pub fn explainer_info(&self, model_id: &str) -> Result<ExplainerInfo> {
        self.registry.get(model_id).map(|entry| entry.info())
    }

    pub fn registered_models(&self) -> Vec<String> {
        self.registry.model_ids()
    }

    pub fn remove_explainer(&self, model_id: &str) -> bool {
        self.registry.remove(model_id)
    }

    /// Attribute one instance and describe it.
    pub fn explain_instance(
        &self,
        model_id: &str,
        instance: &[f64],
        opts: &RequestOptions,
    ) -> Result<Explanation> {
        const OP: Operation = Operation::ExplainInstance;
        let entry = self.registry.get_for(model_id, OP)?;
        check_instance(&entry, instance, OP)?;

        let ctx = AttributeContext {
            max_evals: opts.max_evals,
            cancel: &opts.cancel,
        };
        let (raw, kernel) = entry.attribute(instance, &ctx, OP).inspect_err(log_failure)?;
        debug!(model_id, %kernel, prediction = raw.prediction, "Explained instance");
        Ok(self.build_explanation(&entry, raw, kernel))
    }

    /// Explain every row of `batch`. Rows run concurrently up to the
    /// concurrency cap; any failure fails the whole batch.
    pub async fn explain_batch(
        &self,
        model_id: &str,
        batch: &Matrix,
        opts: &RequestOptions,
    ) -> Result<Vec<IndexedExplanation>> {
        const OP: Operation = Operation::ExplainBatch;
        let entry = self.registry.get_for(model_id, OP)?;
        check_columns(&entry, batch, OP)?;

        let rows = Arc::new(batch.clone());
        let attributed = self
            .attribute_rows(entry.clone(), rows, opts, OP)
            .await
            .inspect_err(log_failure)?;
        debug!(model_id, rows = attributed.len(), "Explained batch");

        Ok(attributed
            .into_iter()
            .enumerate()
            .map(|(index, (raw, kernel))| IndexedExplanation {
                index,
                explanation: self.build_explanation(&entry, raw, kernel),
            })
            .collect())
    }

    /// Mean absolute attribution per feature over (a seeded subsample of)
    /// `sample`, top `top_n` features first.
    pub async fn global_feature_importance(
        &self,
        model_id: &str,
        sample: &Matrix,
        sample_size: usize,
        top_n: usize,
        opts: &RequestOptions,
    ) -> Result<GlobalImportance> {
        const OP: Operation = Operation::GlobalFeatureImportance;
        let entry = self.registry.get_for(model_id, OP)?;
        if !GLOBAL_TOP_N.contains(&top_n) {
            return Err(ExplainError::validation(
                model_id,
                OP,
                format!(
                    "top_n must be between {} and {}, got {top_n}",
                    GLOBAL_TOP_N.start(),
                    GLOBAL_TOP_N.end()
                ),
            ));
        }
        if sample_size == 0 {
            return Err(ExplainError::validation(model_id, OP, "sample_size must be at least 1"));
        }
        check_columns(&entry, sample, OP)?;
        if sample.nrows() == 0 {
            return Err(ExplainError::validation(model_id, OP, "sample has no rows"));
        }

        let rows = Arc::new(subsample(sample, sample_size, self.config.global.seed));
        let used = rows.nrows();
        let attributed = self
            .attribute_rows(entry.clone(), rows, opts, OP)
            .await
            .inspect_err(log_failure)?;

        let values: Vec<Vec<f64>> = attributed.into_iter().map(|(raw, _)| raw.values).collect();
        let means = mean_abs_importance(&values, entry.num_features());
        debug!(model_id, rows = used, "Computed global importance");

        Ok(GlobalImportance {
            model_id: model_id.to_string(),
            global_importance: entry
                .feature_names
                .iter()
                .cloned()
                .zip(means.iter().copied())
                .collect(),
            top_features: order_importance(&means, &entry.feature_names, top_n),
            sample_size: used,
            generated_at: Utc::now(),
        })
    }

    /// Pairwise interaction strengths over at most
    /// `interactions.max_sample_rows` rows of `sample`, capped at
    /// [`MAX_INTERACTION_ROWS`].
    ///
    /// Uses the kernel's second-order decomposition; only when that fails or
    /// is unsupported does it fall back to absolute column correlation, and
    /// the report's `method` says so.
    pub fn analyze_interactions(
        &self,
        model_id: &str,
        sample: &Matrix,
        top_n: usize,
        opts: &RequestOptions,
    ) -> Result<InteractionReport> {
        const OP: Operation = Operation::AnalyzeInteractions;
        let entry = self.registry.get_for(model_id, OP)?;
        if top_n == 0 {
            return Err(ExplainError::validation(model_id, OP, "top_n must be at least 1"));
        }
        check_columns(&entry, sample, OP)?;
        if sample.nrows() == 0 {
            return Err(ExplainError::validation(model_id, OP, "sample has no rows"));
        }

        let cfg = &self.config.interactions;
        let limit = cfg.max_sample_rows.clamp(1, MAX_INTERACTION_ROWS);
        let sample = subsample(sample, limit, cfg.seed);
        let ctx = AttributeContext {
            max_evals: opts.max_evals,
            cancel: &opts.cancel,
        };

        let (method, strengths) = match entry.kernel.interaction_matrix(&sample, &ctx) {
            Ok(matrix) => (InteractionMethod::SecondOrder, matrix),
            Err(KernelError::Cancelled) => return Err(ExplainError::cancelled(model_id, OP)),
            Err(KernelError::Shape(message)) => {
                return Err(ExplainError::validation(model_id, OP, message));
            }
            Err(reason) => {
                if sample.nrows() < 2 {
                    return Err(ExplainError::validation(
                        model_id,
                        OP,
                        format!("{reason}; correlation fallback needs at least two rows"),
                    ));
                }
                warn!(
                    model_id,
                    reason = %reason,
                    method = InteractionMethod::CorrelationBased.as_str(),
                    "Second-order decomposition unavailable, falling back to correlation"
                );
                let columns: Vec<Vec<f64>> =
                    (0..sample.ncols()).map(|j| sample.column(j)).collect();
                (
                    InteractionMethod::CorrelationBased,
                    abs_correlation_matrix(&columns),
                )
            }
        };

        Ok(InteractionReport {
            model_id: model_id.to_string(),
            method,
            top_interactions: top_pairs(&strengths, &entry.feature_names, top_n),
            sample_size: sample.nrows(),
            generated_at: Utc::now(),
        })
    }

    /// Suggest feature changes that should move the prediction by roughly
    /// `target_delta`. See [`counterfactual`] for the heuristic.
    pub fn counterfactual(
        &self,
        model_id: &str,
        instance: &[f64],
        target_delta: f64,
        opts: &RequestOptions,
    ) -> Result<CounterfactualReport> {
        const OP: Operation = Operation::Counterfactual;
        let entry = self.registry.get_for(model_id, OP)?;
        check_instance(&entry, instance, OP)?;
        if !target_delta.is_finite() {
            return Err(ExplainError::validation(model_id, OP, "target_delta must be finite"));
        }

        let ctx = AttributeContext {
            max_evals: opts.max_evals,
            cancel: &opts.cancel,
        };
        let (raw, _) = entry.attribute(instance, &ctx, OP).inspect_err(log_failure)?;
        let ranked = rank_values(&raw.values, &entry.feature_names);
        let suggestions = counterfactual::suggest(
            &ranked,
            |name| entry.feature_index(name).map(|i| instance[i]),
            target_delta,
            &self.config.counterfactual,
        );

        Ok(CounterfactualReport {
            model_id: model_id.to_string(),
            target_delta,
            suggestions,
            explanation: counterfactual::summary(target_delta),
            limitations: counterfactual::LIMITATIONS.to_string(),
            generated_at: Utc::now(),
        })
    }

    fn build_explanation(
        &self,
        entry: &ExplainerEntry,
        raw: RawAttribution,
        kernel: KernelKind,
    ) -> Explanation {
        let mut ranked = rank_values(&raw.values, &entry.feature_names);
        let explanation_text = render(&ranked);
        ranked.truncate(self.config.explanation.top_factors);

        Explanation {
            model_id: entry.model_id.clone(),
            attribution: AttributionResult {
                base_value: raw.base_value,
                per_feature: entry
                    .feature_names
                    .iter()
                    .cloned()
                    .zip(raw.values)
                    .collect(),
                prediction: raw.prediction,
                output_channel: ATTRIBUTED_CHANNEL,
                kernel,
                generated_at: Utc::now(),
            },
            top_factors: ranked,
            explanation_text,
        }
    }

    /// Attribute each row on the blocking pool, at most `max_concurrency` at
    /// a time. Results come back in row order. The first failure cancels the
    /// remaining rows and is returned.
    async fn attribute_rows(
        &self,
        entry: Arc<ExplainerEntry>,
        rows: Arc<Matrix>,
        opts: &RequestOptions,
        operation: Operation,
    ) -> Result<Vec<(RawAttribution, KernelKind)>> {
        let concurrency = opts
            .max_concurrency
            .unwrap_or(self.config.batch.max_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let cancel = opts.cancel.child_token();
        // Stops rows already on the blocking pool if this future is dropped.
        let _guard = cancel.clone().drop_guard();
        let mut tasks = JoinSet::new();

        for index in 0..rows.nrows() {
            let entry = entry.clone();
            let rows = rows.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let max_evals = opts.max_evals;

            tasks.spawn(async move {
                let model_id = entry.model_id.clone();
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ExplainError::cancelled(&model_id, operation))?;
                if cancel.is_cancelled() {
                    return Err(ExplainError::cancelled(&model_id, operation));
                }
                let attributed = tokio::task::spawn_blocking(move || {
                    let ctx = AttributeContext {
                        max_evals,
                        cancel: &cancel,
                    };
                    entry.attribute(rows.row(index), &ctx, operation)
                })
                .await
                .map_err(|e| {
                    ExplainError::computation(&model_id, operation, format!("attribution task failed: {e}"))
                })??;
                Ok::<_, ExplainError>((index, attributed))
            });
        }

        let mut results: Vec<Option<(RawAttribution, KernelKind)>> =
            (0..rows.nrows()).map(|_| None).collect();
        let mut failure: Option<ExplainError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(ExplainError::computation(
                    &entry.model_id,
                    operation,
                    format!("attribution task failed: {e}"),
                ))
            });
            match outcome {
                Ok((index, attributed)) => results[index] = Some(attributed),
                Err(e) => {
                    if failure.is_none() {
                        cancel.cancel();
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ExplainError::computation(&entry.model_id, operation, "missing row result"))
    }
}

fn check_columns(entry: &ExplainerEntry, m: &Matrix, operation: Operation) -> Result<()> {
    if m.ncols() != entry.num_features() && m.nrows() > 0 {
        return Err(ExplainError::validation(
            &entry.model_id,
            operation,
            format!(
                "input has {} columns, explainer expects {} ({})",
                m.ncols(),
                entry.num_features(),
                entry.feature_names.join(", ")
            ),
        ));
    }
    Ok(())
}

fn check_instance(entry: &ExplainerEntry, instance: &[f64], operation: Operation) -> Result<()> {
    if instance.len() != entry.num_features() {
        return Err(ExplainError::validation(
            &entry.model_id,
            operation,
            format!(
                "instance has {} values, explainer expects {}",
                instance.len(),
                entry.num_features()
            ),
        ));
    }
    if instance.iter().any(|v| !v.is_finite()) {
        return Err(ExplainError::validation(
            &entry.model_id,
            operation,
            "instance contains non-finite values",
        ));
    }
    Ok(())
}

/// All of `m` when it fits in `limit` rows, otherwise a seeded uniform
/// subset without replacement, kept in original row order.
fn subsample(m: &Matrix, limit: usize, seed: u64) -> Matrix {
    if m.nrows() <= limit {
        return m.clone();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices = rand::seq::index::sample(&mut rng, m.nrows(), limit).into_vec();
    indices.sort_unstable();
    m.select_rows(&indices)
}

fn log_failure(err: &ExplainError) {
    if err.is_cancelled() {
        debug!(model_id = err.model_id(), operation = %err.operation(), "Request cancelled");
    } else {
        warn!(model_id = err.model_id(), operation = %err.operation(), error = %err, "Request failed");
    }
}
