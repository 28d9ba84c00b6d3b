//! Configuration for the explanation engine.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment. Configuration is read from
//! `~/.config/featlens/config.toml` and/or `.featlens/config.toml` in the
//! workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainConfig {
    /// Attribution kernel settings.
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Global importance defaults.
    #[serde(default)]
    pub global: GlobalImportanceConfig,
    /// Interaction analysis settings.
    #[serde(default)]
    pub interactions: InteractionConfig,
    /// Counterfactual heuristic settings.
    #[serde(default)]
    pub counterfactual: CounterfactualConfig,
    /// Bulk dispatch settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Explanation assembly settings.
    #[serde(default)]
    pub explanation: ExplanationConfig,
}

/// Attribution kernel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Model evaluations the sampling kernel may spend per instance.
    #[serde(default = "default_max_evals")]
    pub max_evals: usize,
    /// Seed for coalition sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Largest relative residual a fitted linear surrogate may leave.
    #[serde(default = "default_surrogate_tolerance")]
    pub surrogate_tolerance: f64,
    /// Background columns with variance at or below this are constant.
    #[serde(default = "default_min_variance")]
    pub min_variance: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_evals: default_max_evals(),
            seed: default_seed(),
            surrogate_tolerance: default_surrogate_tolerance(),
            min_variance: default_min_variance(),
        }
    }
}

fn default_max_evals() -> usize {
    1000
}

fn default_seed() -> u64 {
    42
}

fn default_surrogate_tolerance() -> f64 {
    1e-6
}

fn default_min_variance() -> f64 {
    1e-12
}

/// Global importance defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalImportanceConfig {
    /// Rows attributed when the caller does not say.
    #[serde(default = "default_sample_size")]
    pub default_sample_size: usize,
    /// Features returned when the caller does not say (5-100).
    #[serde(default = "default_global_top_n")]
    pub default_top_n: usize,
    /// Seed for row subsampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for GlobalImportanceConfig {
    fn default() -> Self {
        Self {
            default_sample_size: default_sample_size(),
            default_top_n: default_global_top_n(),
            seed: default_seed(),
        }
    }
}

fn default_sample_size() -> usize {
    100
}

fn default_global_top_n() -> usize {
    20
}

/// Interaction analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionConfig {
    /// Row cap for interaction analysis.
    #[serde(default = "default_interaction_rows")]
    pub max_sample_rows: usize,
    #[serde(default = "default_interaction_top_n")]
    pub default_top_n: usize,
    /// Seed for row subsampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            max_sample_rows: default_interaction_rows(),
            default_top_n: default_interaction_top_n(),
            seed: default_seed(),
        }
    }
}

fn default_interaction_rows() -> usize {
    50
}

fn default_interaction_top_n() -> usize {
    10
}

/// Counterfactual heuristic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualConfig {
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    /// Smallest contribution magnitude used as a divisor.
    #[serde(default = "default_contribution_floor")]
    pub contribution_floor: f64,
    /// Fraction of the current value moved per unit of required change.
    #[serde(default = "default_step_scale")]
    pub step_scale: f64,
}

impl Default for CounterfactualConfig {
    fn default() -> Self {
        Self {
            max_suggestions: default_max_suggestions(),
            contribution_floor: default_contribution_floor(),
            step_scale: default_step_scale(),
        }
    }
}

fn default_max_suggestions() -> usize {
    5
}

fn default_contribution_floor() -> f64 {
    1e-6
}

fn default_step_scale() -> f64 {
    0.1
}

/// Bulk dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Rows attributed concurrently when the caller sets no cap.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

/// Explanation assembly settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationConfig {
    /// Ranked factors attached to each explanation.
    #[serde(default = "default_top_factors")]
    pub top_factors: usize,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            top_factors: default_top_factors(),
        }
    }
}

fn default_top_factors() -> usize {
    10
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `FEATLENS_`, `__` separates levels)
/// 2. Workspace-local config (`.featlens/config.toml`)
/// 3. User config (`~/.config/featlens/config.toml`)
/// 4. Built-in defaults
pub fn load_config(workspace: Option<&Path>) -> Result<ExplainConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ExplainConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "featlens", "featlens") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".featlens").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // FEATLENS_KERNEL__MAX_EVALS, FEATLENS_BATCH__MAX_CONCURRENCY, ...
    figment = figment.merge(Env::prefixed("FEATLENS_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExplainConfig::default();
        assert_eq!(config.kernel.max_evals, 1000);
        assert_eq!(config.kernel.seed, 42);
        assert_eq!(config.global.default_sample_size, 100);
        assert_eq!(config.interactions.max_sample_rows, 50);
        assert_eq!(config.counterfactual.max_suggestions, 5);
        assert_eq!(config.batch.max_concurrency, 4);
        assert_eq!(config.explanation.top_factors, 10);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ExplainConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ExplainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: ExplainConfig =
            serde_json::from_str(r#"{"kernel": {"max_evals": 200}}"#).unwrap();
        assert_eq!(parsed.kernel.max_evals, 200);
        assert_eq!(parsed.kernel.seed, 42);
        assert_eq!(parsed.global.default_top_n, 20);
    }

    #[test]
    fn test_workspace_config_file_is_layered() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".featlens");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[kernel]\nseed = 7\n\n[batch]\nmax_concurrency = 2\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.kernel.seed, 7);
        assert_eq!(config.batch.max_concurrency, 2);
        assert_eq!(config.kernel.max_evals, 1000);
    }
}
