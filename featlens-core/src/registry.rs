//! Explainer registry: per-model attribution state keyed by model id.
//!
//! Entries are immutable once built. Registration builds the complete entry
//! outside the lock and swaps it in under the write lock, so readers holding
//! an `Arc<ExplainerEntry>` never see a partially written entry and are not
//! disturbed by a concurrent re-registration.

use crate::config::KernelConfig;
use crate::error::{ExplainError, KernelError, Operation, Result};
use crate::kernel::{
    AttributeContext, AttributionKernel, KernelKind, LinearKernel, RawAttribution, SamplingKernel,
};
use crate::matrix::Matrix;
use crate::model::{Capability, ModelHandle, PredictiveModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Everything needed to explain one model.
pub struct ExplainerEntry {
    pub model_id: String,
    pub capability: Capability,
    pub kernel: Arc<dyn AttributionKernel>,
    /// Sampling kernel kept behind a model-aware kernel for the one retry
    /// after a computation failure.
    pub fallback: Option<Arc<dyn AttributionKernel>>,
    pub feature_names: Vec<String>,
    pub background: Arc<Matrix>,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for ExplainerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplainerEntry")
            .field("model_id", &self.model_id)
            .field("capability", &self.capability)
            .field("kernel", &self.kernel.kind())
            .field("fallback", &self.fallback.as_ref().map(|k| k.kind()))
            .field("feature_names", &self.feature_names)
            .field("background_shape", &self.background.shape())
            .finish()
    }
}

impl ExplainerEntry {
    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }

    /// Attribute one instance, retrying once on the fallback kernel when the
    /// primary kernel hits a computation error.
    pub fn attribute(
        &self,
        instance: &[f64],
        ctx: &AttributeContext<'_>,
        operation: Operation,
    ) -> Result<(RawAttribution, KernelKind)> {
        match self.kernel.attribute(instance, ctx) {
            Ok(raw) => Ok((raw, self.kernel.kind())),
            Err(KernelError::Computation(message)) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        model_id = %self.model_id,
                        %operation,
                        error = %message,
                        "Model-aware attribution failed, retrying with sampling kernel"
                    );
                    fallback
                        .attribute(instance, ctx)
                        .map(|raw| (raw, fallback.kind()))
                        .map_err(|e| e.in_context(&self.model_id, operation))
                }
                None => Err(ExplainError::computation(&self.model_id, operation, message)),
            },
            Err(e) => Err(e.in_context(&self.model_id, operation)),
        }
    }

    pub fn info(&self) -> ExplainerInfo {
        ExplainerInfo {
            model_id: self.model_id.clone(),
            kernel: self.kernel.kind(),
            capability: self.capability,
            base_value: self.kernel.base_value(),
            num_features: self.num_features(),
            feature_names: self.feature_names.clone(),
            background_shape: self.background.shape(),
            registered_at: self.registered_at,
            has_fallback: self.fallback.is_some(),
        }
    }
}

/// Introspection view of a registered explainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainerInfo {
    pub model_id: String,
    pub kernel: KernelKind,
    pub capability: Capability,
    /// Expected model output over the background data.
    pub base_value: f64,
    pub num_features: usize,
    pub feature_names: Vec<String>,
    pub background_shape: (usize, usize),
    pub registered_at: DateTime<Utc>,
    pub has_fallback: bool,
}

/// Keyed store of explainer entries.
#[derive(Debug, Default)]
pub struct ExplainerRegistry {
    entries: RwLock<HashMap<String, Arc<ExplainerEntry>>>,
    kernel_config: KernelConfig,
}

impl ExplainerRegistry {
    pub fn new(kernel_config: KernelConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            kernel_config,
        }
    }

    /// Register (or replace) the explainer for `model_id`.
    ///
    /// Probabilistic models get the model-aware linear kernel when it can be
    /// built over the background, with the sampling kernel as fallback;
    /// everything else gets the sampling kernel.
    pub fn initialize_explainer(
        &self,
        model_id: &str,
        model: ModelHandle,
        background: Matrix,
        feature_names: Vec<String>,
    ) -> Result<Arc<ExplainerEntry>> {
        const OP: Operation = Operation::InitializeExplainer;
        validate_registration(model_id, model.as_ref(), &background, &feature_names)?;

        let capability = model.capability();
        let background = Arc::new(background);
        let sampling = |model: ModelHandle| -> Result<Arc<dyn AttributionKernel>> {
            let kernel: Arc<dyn AttributionKernel> = Arc::new(
                SamplingKernel::new(model, background.clone(), &self.kernel_config)
                    .map_err(|e| e.in_context(model_id, OP))?,
            );
            Ok(kernel)
        };

        let (kernel, fallback): (Arc<dyn AttributionKernel>, Option<Arc<dyn AttributionKernel>>) =
            match capability {
                Capability::Probabilistic => {
                    match LinearKernel::fit(model.clone(), &background, &self.kernel_config) {
                        Ok(linear) => {
                            let linear: Arc<dyn AttributionKernel> = Arc::new(linear);
                            (linear, Some(sampling(model)?))
                        }
                        Err(KernelError::Computation(reason)) => {
                            warn!(
                                model_id,
                                reason = %reason,
                                "Model-aware kernel unavailable, using sampling kernel"
                            );
                            (sampling(model)?, None)
                        }
                        Err(e) => return Err(e.in_context(model_id, OP)),
                    }
                }
                Capability::PointPrediction => (sampling(model)?, None),
            };

        let entry = Arc::new(ExplainerEntry {
            model_id: model_id.to_string(),
            capability,
            kernel,
            fallback,
            feature_names,
            background,
            registered_at: Utc::now(),
        });

        let replaced = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model_id.to_string(), entry.clone())
            .is_some();

        info!(
            model_id,
            kernel = %entry.kernel.kind(),
            features = entry.num_features(),
            background_rows = entry.background.nrows(),
            replaced,
            "Explainer initialized"
        );
        Ok(entry)
    }

    pub fn get(&self, model_id: &str) -> Result<Arc<ExplainerEntry>> {
        self.get_for(model_id, Operation::ExplainerInfo)
    }

    /// Look up an entry on behalf of `operation`.
    pub fn get_for(&self, model_id: &str, operation: Operation) -> Result<Arc<ExplainerEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .cloned()
            .ok_or_else(|| ExplainError::not_found(model_id, operation))
    }

    pub fn remove(&self, model_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(model_id)
            .is_some()
    }

    /// Registered model ids, sorted.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_registration(
    model_id: &str,
    model: &dyn PredictiveModel,
    background: &Matrix,
    feature_names: &[String],
) -> Result<()> {
    let fail = |msg: String| Err(ExplainError::validation(model_id, Operation::InitializeExplainer, msg));

    if model_id.trim().is_empty() {
        return fail("model id must not be empty".into());
    }
    if feature_names.is_empty() {
        return fail("at least one feature name is required".into());
    }
    if feature_names.iter().any(|f| f.trim().is_empty()) {
        return fail("feature names must not be empty".into());
    }
    let mut seen = HashSet::with_capacity(feature_names.len());
    for name in feature_names {
        if !seen.insert(name.as_str()) {
            return fail(format!("duplicate feature name '{name}'"));
        }
    }
    if background.nrows() == 0 {
        return fail("background data has no rows".into());
    }
    if background.ncols() != feature_names.len() {
        return fail(format!(
            "background data has {} columns but {} feature names were given",
            background.ncols(),
            feature_names.len()
        ));
    }
    if let Some(coef) = model.linear_coefficients() {
        if coef.weights.len() != feature_names.len() {
            return fail(format!(
                "model has {} coefficients but {} features were given",
                coef.weights.len(),
                feature_names.len()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnModel, LinearModel, LogisticModel};
    use tokio_util::sync::CancellationToken;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("x{i}")).collect()
    }

    fn background() -> Matrix {
        Matrix::from_rows(vec![
            vec![0.1, 0.9, 0.3],
            vec![0.4, 0.2, 0.8],
            vec![0.7, 0.5, 0.1],
            vec![0.9, 0.3, 0.6],
            vec![0.2, 0.7, 0.4],
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_column_mismatch() {
        let registry = ExplainerRegistry::default();
        let model: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0, 1.0], 0.0));
        let err = registry
            .initialize_explainer("m", model, background(), names(2))
            .unwrap_err();
        assert!(matches!(err, ExplainError::Validation { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejects_coefficient_count_mismatch() {
        let registry = ExplainerRegistry::default();
        let model: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0], 0.0));
        let err = registry
            .initialize_explainer("m", model, background(), names(3))
            .unwrap_err();
        assert!(matches!(err, ExplainError::Validation { .. }));
        assert!(err.to_string().contains("2 coefficients"));
        assert!(registry.is_empty());

        let point: ModelHandle =
            Arc::new(LinearModel::new(vec![1.0], 0.0).with_capability(Capability::PointPrediction));
        let err = registry
            .initialize_explainer("m", point, background(), names(3))
            .unwrap_err();
        assert!(matches!(err, ExplainError::Validation { .. }));
    }

    #[test]
    fn test_rejects_duplicate_feature_names() {
        let registry = ExplainerRegistry::default();
        let model: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0, 1.0], 0.0));
        let dupes = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let err = registry
            .initialize_explainer("m", model, background(), dupes)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate feature name 'a'"));
    }

    #[test]
    fn test_kernel_selection_by_capability() {
        let registry = ExplainerRegistry::new(KernelConfig::default());

        let point: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 2.0, 3.0], 0.0));
        let entry = registry
            .initialize_explainer("point", point, background(), names(3))
            .unwrap();
        assert_eq!(entry.kernel.kind(), KernelKind::Sampling);
        assert!(entry.fallback.is_none());

        let linear_proba: ModelHandle = Arc::new(
            LinearModel::new(vec![0.1, 0.2, 0.3], 0.1).with_capability(Capability::Probabilistic),
        );
        let entry = registry
            .initialize_explainer("proba", linear_proba, background(), names(3))
            .unwrap();
        assert_eq!(entry.kernel.kind(), KernelKind::ModelAwareLinear);
        assert!(entry.fallback.is_some());

        // Non-linear probabilistic model falls back at registration.
        let logistic: ModelHandle = Arc::new(LogisticModel::new(vec![4.0, -3.0, 2.0], 0.0));
        let entry = registry
            .initialize_explainer("logit", logistic, background(), names(3))
            .unwrap();
        assert_eq!(entry.kernel.kind(), KernelKind::Sampling);
    }

    #[test]
    fn test_re_registration_replaces_entry() {
        let registry = ExplainerRegistry::default();
        let a: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0, 1.0], 0.0));
        let first = registry
            .initialize_explainer("m", a.clone(), background(), names(3))
            .unwrap();
        let renamed = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        registry
            .initialize_explainer("m", a, background(), renamed)
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("m").unwrap().feature_names[0], "a");
        // Holders of the old entry keep a consistent view.
        assert_eq!(first.feature_names[0], "x0");
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = ExplainerRegistry::default();
        let err = registry.get_for("nope", Operation::ExplainInstance).unwrap_err();
        assert!(matches!(err, ExplainError::NotFound { .. }));
        assert_eq!(err.operation(), Operation::ExplainInstance);
    }

    #[test]
    fn test_runtime_computation_error_retries_on_fallback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        // Coefficients are exposed, so registration never calls predict for the
        // linear kernel; single-row predictions then fail on first use.
        struct Flaky {
            failed_once: AtomicBool,
        }
        impl crate::model::PredictiveModel for Flaky {
            fn capability(&self) -> Capability {
                Capability::Probabilistic
            }
            fn predict(&self, batch: &Matrix) -> anyhow::Result<Vec<Vec<f64>>> {
                if batch.nrows() == 1 && !self.failed_once.swap(true, Ordering::SeqCst) {
                    anyhow::bail!("transient backend failure");
                }
                Ok(batch.rows().map(|r| vec![r[0] + r[1] + r[2]]).collect())
            }
            fn linear_coefficients(&self) -> Option<crate::model::LinearCoefficients> {
                Some(crate::model::LinearCoefficients {
                    weights: vec![1.0, 1.0, 1.0],
                    intercept: 0.0,
                })
            }
        }

        let registry = ExplainerRegistry::default();
        let model: ModelHandle = Arc::new(Flaky {
            failed_once: AtomicBool::new(false),
        });
        let entry = registry
            .initialize_explainer("flaky", model, background(), names(3))
            .unwrap();
        assert_eq!(entry.kernel.kind(), KernelKind::ModelAwareLinear);

        let cancel = CancellationToken::new();
        let ctx = AttributeContext {
            max_evals: Some(100),
            cancel: &cancel,
        };
        let (raw, kind) = entry
            .attribute(&[0.5, 0.5, 0.5], &ctx, Operation::ExplainInstance)
            .unwrap();
        assert_eq!(kind, KernelKind::Sampling);
        assert!((raw.reconstructed() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_model_failure_without_fallback_surfaces() {
        let registry = ExplainerRegistry::default();
        // Accepts the 5-row background evaluation, rejects everything else.
        let broken: ModelHandle = Arc::new(FnModel::new(Capability::PointPrediction, |batch| {
            anyhow::ensure!(batch.nrows() == 5, "backend offline");
            Ok(batch.rows().map(|r| vec![r[0]]).collect())
        }));
        let entry = registry
            .initialize_explainer("broken", broken, background(), names(3))
            .unwrap();
        let cancel = CancellationToken::new();
        let ctx = AttributeContext {
            max_evals: None,
            cancel: &cancel,
        };
        let err = entry
            .attribute(&[0.1, 0.2, 0.3], &ctx, Operation::ExplainInstance)
            .unwrap_err();
        assert!(matches!(err, ExplainError::Computation { .. }));
        assert!(err.to_string().contains("backend offline"));
        assert_eq!(err.model_id(), "broken");
    }
}
