//! Request files: a model description, its background data and the rows to
//! work on.

use anyhow::Context;
use featlens_core::{ExplanationEngine, LinearModel, LogisticModel, Matrix, ModelHandle};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Models a request file can describe.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Linear(LinearModel),
    Logistic(LogisticModel),
}

impl ModelSpec {
    pub fn into_handle(self) -> ModelHandle {
        match self {
            Self::Linear(m) => Arc::new(m),
            Self::Logistic(m) => Arc::new(m),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainRequest {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    pub model: ModelSpec,
    pub feature_names: Vec<String>,
    pub background: Matrix,
    #[serde(default)]
    pub rows: Option<Matrix>,
}

fn default_model_id() -> String {
    "default".to_string()
}

impl ExplainRequest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid request file {}", path.display()))
    }

    /// Register the request's model with `engine`; returns the rows to work on.
    pub fn register(self, engine: &ExplanationEngine) -> anyhow::Result<(String, Matrix)> {
        let rows = self.rows.context("request has no rows to explain")?;
        let info = engine.initialize_explainer(
            &self.model_id,
            self.model.into_handle(),
            self.background,
            self.feature_names,
        )?;
        tracing::debug!(model_id = %info.model_id, kernel = %info.kernel, "Registered request model");
        Ok((info.model_id, rows))
    }
}
