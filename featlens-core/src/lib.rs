//! # featlens-core: Model-Agnostic Feature Attribution
//!
//! Explains individual predictions of registered models as additive
//! per-feature contributions, then builds on those attributions:
//!
//! 1. **Explain**: per-instance and batch attribution with ranked factors
//!    and a short natural-language description
//! 2. **Aggregate**: global importance as mean absolute attribution
//! 3. **Interactions**: pairwise strengths, second-order where the kernel
//!    supports it, otherwise an explicitly labeled correlation fallback
//! 4. **Counterfactuals**: heuristic feature changes toward a target shift
//!
//! Models are opaque callables behind [`PredictiveModel`]. Probabilistic
//! models with linear structure get an exact model-aware kernel; everything
//! else goes through the permutation sampling kernel.

// Foundation
pub mod config;
pub mod error;
pub mod matrix;
pub mod model;

// Attribution
pub mod kernel;
pub mod registry;

// Post-processing
pub mod counterfactual;
pub mod ranking;
pub mod render;

// Operations
pub mod engine;

// Re-exports
pub use config::{ExplainConfig, load_config};
pub use counterfactual::{ChangeDirection, CounterfactualReport, CounterfactualSuggestion};
pub use engine::{AttributionResult, Explanation, ExplanationEngine, IndexedExplanation, RequestOptions};
pub use error::{ExplainError, KernelError, Operation, Result};
pub use kernel::{AttributionKernel, KernelKind};
pub use matrix::Matrix;
pub use model::{Capability, FnModel, LinearModel, LogisticModel, ModelHandle, PredictiveModel};
pub use ranking::{
    Direction, FeatureImportance, GlobalImportance, InteractionMethod, InteractionPair, InteractionReport,
    RankedFactor,
};
pub use registry::ExplainerInfo;
pub use tokio_util::sync::CancellationToken;
