//! Error types for the featlens-core crate.
//!
//! Two layers: [`KernelError`] is what attribution kernels and numeric helpers
//! return (they know nothing about which model or operation they serve), and
//! [`ExplainError`] is what the engine surfaces, always tagged with the model
//! id and the operation that failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Public engine operations, used to tag errors and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    InitializeExplainer,
    ExplainInstance,
    ExplainBatch,
    GlobalFeatureImportance,
    AnalyzeInteractions,
    Counterfactual,
    ExplainerInfo,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitializeExplainer => "initialize_explainer",
            Self::ExplainInstance => "explain_instance",
            Self::ExplainBatch => "explain_batch",
            Self::GlobalFeatureImportance => "global_feature_importance",
            Self::AnalyzeInteractions => "analyze_interactions",
            Self::Counterfactual => "counterfactual",
            Self::ExplainerInfo => "explainer_info",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for explanation operations.
#[derive(Debug, Error)]
pub enum ExplainError {
    /// Malformed shapes, dimension mismatches, duplicate feature names,
    /// out-of-range parameters. Never retried.
    #[error("{operation} rejected input for model '{model_id}': {message}")]
    Validation {
        model_id: String,
        operation: Operation,
        message: String,
    },

    #[error("{operation}: no explainer registered for model '{model_id}'")]
    NotFound {
        model_id: String,
        operation: Operation,
    },

    /// Numeric failure or a failing model call.
    #[error("{operation} failed for model '{model_id}': {message}")]
    Computation {
        model_id: String,
        operation: Operation,
        message: String,
    },

    #[error("{operation} for model '{model_id}' was cancelled")]
    Cancelled {
        model_id: String,
        operation: Operation,
    },
}

impl ExplainError {
    pub fn validation(
        model_id: impl Into<String>,
        operation: Operation,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            model_id: model_id.into(),
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(model_id: impl Into<String>, operation: Operation) -> Self {
        Self::NotFound {
            model_id: model_id.into(),
            operation,
        }
    }

    pub fn computation(
        model_id: impl Into<String>,
        operation: Operation,
        message: impl Into<String>,
    ) -> Self {
        Self::Computation {
            model_id: model_id.into(),
            operation,
            message: message.into(),
        }
    }

    pub fn cancelled(model_id: impl Into<String>, operation: Operation) -> Self {
        Self::Cancelled {
            model_id: model_id.into(),
            operation,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Validation { model_id, .. }
            | Self::NotFound { model_id, .. }
            | Self::Computation { model_id, .. }
            | Self::Cancelled { model_id, .. } => model_id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Validation { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Computation { operation, .. }
            | Self::Cancelled { operation, .. } => *operation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The engine already performed its one internal fallback before
    /// surfacing a computation error, so nothing is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Errors raised below the engine: kernels, matrix construction, numerics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("{0}")]
    Computation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,
}

impl KernelError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Attach the model id and operation the failure belongs to.
    pub fn in_context(self, model_id: &str, operation: Operation) -> ExplainError {
        match self {
            Self::Shape(message) => ExplainError::validation(model_id, operation, message),
            Self::Computation(message) => ExplainError::computation(model_id, operation, message),
            Self::Unsupported(message) => ExplainError::computation(
                model_id,
                operation,
                format!("unsupported: {message}"),
            ),
            Self::Cancelled => ExplainError::cancelled(model_id, operation),
        }
    }
}

/// Matrix construction failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid matrix: {message}")]
pub struct ShapeError {
    pub message: String,
}

impl ShapeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ShapeError> for KernelError {
    fn from(err: ShapeError) -> Self {
        KernelError::Shape(err.message)
    }
}

pub type Result<T, E = ExplainError> = std::result::Result<T, E>;
