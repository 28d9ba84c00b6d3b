//! End-to-end scenarios through the public engine API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use featlens_core::{
    Capability, ChangeDirection, Direction, ExplainConfig, ExplainError, ExplanationEngine, FnModel,
    InteractionMethod, KernelKind, LinearModel, LogisticModel, Matrix, ModelHandle, Operation,
    RequestOptions,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("x{i}")).collect()
}

fn uniform(rows: usize, cols: usize, seed: u64) -> Matrix {
    let mut rng = StdRng::seed_from_u64(seed);
    Matrix::from_rows(
        (0..rows)
            .map(|_| (0..cols).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect(),
    )
    .unwrap()
}

/// `y = 2·x0 − x1`, x2 unused, explained with the sampling kernel.
fn engine_with_additive_model() -> ExplanationEngine {
    let engine = ExplanationEngine::new(ExplainConfig::default());
    let model: ModelHandle = Arc::new(FnModel::from_row_fn(Capability::PointPrediction, |r| {
        2.0 * r[0] - r[1]
    }));
    engine
        .initialize_explainer("additive", model, uniform(50, 3, 7), names(3))
        .unwrap();
    engine
}

/// `y = 10·x0 − x1 + 0.5·x2`: x0 dominates by a wide margin.
fn engine_with_dominant_feature() -> ExplanationEngine {
    let engine = ExplanationEngine::default();
    let model: ModelHandle = Arc::new(LinearModel::new(vec![10.0, -1.0, 0.5], 0.0));
    engine
        .initialize_explainer("dominant", model, uniform(50, 3, 21), names(3))
        .unwrap();
    engine
}

#[test]
fn test_additive_model_attribution() {
    let engine = engine_with_additive_model();
    let explanation = engine
        .explain_instance("additive", &[1.0, 1.0, 1.0], &RequestOptions::default())
        .unwrap();

    let phi = &explanation.attribution.per_feature;
    assert!(phi["x0"] > 0.0);
    assert!(phi["x1"] < 0.0);
    assert!(phi["x2"].abs() < 1e-9);
    assert!((explanation.attribution.reconstructed() - 1.0).abs() < 1e-9);
    assert!((explanation.attribution.prediction - 1.0).abs() < 1e-12);
    assert_eq!(explanation.attribution.output_channel, 0);
    assert_eq!(explanation.attribution.kernel, KernelKind::Sampling);

    assert_eq!(explanation.top_factors[0].feature, "x0");
    assert_eq!(explanation.top_factors[0].direction, Direction::Increases);
    assert_eq!(explanation.top_factors[1].feature, "x1");
    assert_eq!(explanation.top_factors[1].direction, Direction::Decreases);
    assert!(
        explanation
            .explanation_text
            .starts_with("The prediction is primarily influenced by:")
    );
}

#[test]
fn test_explanations_are_deterministic() {
    let engine = engine_with_additive_model();
    let opts = RequestOptions::default().with_max_evals(200);
    let a = engine.explain_instance("additive", &[0.3, 0.9, 0.1], &opts).unwrap();
    let b = engine.explain_instance("additive", &[0.3, 0.9, 0.1], &opts).unwrap();
    assert_eq!(a.attribution.per_feature, b.attribution.per_feature);
    assert_eq!(a.explanation_text, b.explanation_text);
}

#[test]
fn test_counterfactual_pushes_against_dominant_feature() {
    let engine = engine_with_additive_model();
    let report = engine
        .counterfactual("additive", &[1.0, 1.0, 1.0], -0.5, &RequestOptions::default())
        .unwrap();

    let first = &report.suggestions[0];
    assert_eq!(first.feature, "x0");
    assert_eq!(first.priority, 1);
    assert_eq!(first.direction, ChangeDirection::Decrease);
    assert!(first.suggested_value < first.current_value);
    assert_eq!(
        report.explanation,
        "To change the prediction by -0.500, consider modifying these features:"
    );
    assert!(!report.limitations.is_empty());
}

#[tokio::test]
async fn test_batch_results_are_index_tagged() {
    let engine = engine_with_additive_model();
    let batch = uniform(6, 3, 99);
    let opts = RequestOptions::default().with_max_concurrency(2);
    let results = engine.explain_batch("additive", &batch, &opts).await.unwrap();

    assert_eq!(results.len(), 6);
    for (i, item) in results.iter().enumerate() {
        assert_eq!(item.index, i);
        let single = engine
            .explain_instance("additive", batch.row(i), &RequestOptions::default())
            .unwrap();
        assert_eq!(item.explanation.attribution.per_feature, single.attribution.per_feature);
    }
}

#[tokio::test]
async fn test_empty_batch_is_empty_result() {
    let engine = engine_with_additive_model();
    let empty = Matrix::new(0, 3, Vec::new()).unwrap();
    let results = engine
        .explain_batch("additive", &empty, &RequestOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_midway_through_batch() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let model: ModelHandle = Arc::new(FnModel::new(Capability::PointPrediction, move |batch| {
        // Call 1 evaluates the background at registration.
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
            trigger.cancel();
        }
        Ok(batch.rows().map(|r| vec![2.0 * r[0] - r[1]]).collect())
    }));
    let engine = ExplanationEngine::default();
    engine
        .initialize_explainer("additive", model, uniform(50, 3, 7), names(3))
        .unwrap();

    let err = engine
        .explain_batch(
            "additive",
            &uniform(4, 3, 1),
            &RequestOptions::default().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.operation(), Operation::ExplainBatch);
    // Four rows of 250 walks each would take 1001 calls.
    assert!(calls.load(Ordering::SeqCst) < 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_batch_stops_running_rows() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let model: ModelHandle = Arc::new(FnModel::new(Capability::PointPrediction, move |batch| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        Ok(batch.rows().map(|r| vec![r[0] + r[1]]).collect())
    }));
    let engine = ExplanationEngine::default();
    engine
        .initialize_explainer("slow", model, uniform(10, 2, 2), names(2))
        .unwrap();

    let rows = uniform(4, 2, 3);
    let opts = RequestOptions::default().with_max_evals(3000);
    let outcome =
        tokio::time::timeout(Duration::from_millis(50), engine.explain_batch("slow", &rows, &opts)).await;
    assert!(outcome.is_err());

    // Rows in flight finish their current walk, then stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_cancelled_batch() {
    let engine = engine_with_additive_model();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .explain_batch(
            "additive",
            &uniform(4, 3, 1),
            &RequestOptions::default().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.operation(), Operation::ExplainBatch);
}

#[tokio::test]
async fn test_global_importance_uses_whole_small_sample() {
    let engine = engine_with_dominant_feature();
    let sample = uniform(12, 3, 5);
    let global = engine
        .global_feature_importance("dominant", &sample, 100, 5, &RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(global.sample_size, 12);
    assert_eq!(global.global_importance.len(), 3);
    assert_eq!(global.top_features.len(), 3);
    assert_eq!(global.top_features[0].feature, "x0");
    assert!(global.global_importance["x1"] < global.global_importance["x0"]);
}

#[tokio::test]
async fn test_global_importance_dominant_feature_stable_as_sample_grows() {
    let engine = engine_with_dominant_feature();
    let sample = uniform(40, 3, 11);
    for size in [5, 10, 20, 40] {
        let global = engine
            .global_feature_importance("dominant", &sample, size, 5, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(global.sample_size, size);
        assert_eq!(global.top_features[0].feature, "x0", "sample size {size}");
    }
}

#[test]
fn test_interactions_fall_back_to_correlation() {
    let engine = engine_with_additive_model();
    let report = engine
        .analyze_interactions("additive", &uniform(80, 3, 3), 2, &RequestOptions::default())
        .unwrap();

    assert_eq!(report.method, InteractionMethod::CorrelationBased);
    assert_eq!(report.method.as_str(), "correlation_based");
    assert_eq!(report.sample_size, 50);
    assert_eq!(report.top_interactions.len(), 2);
    for pair in &report.top_interactions {
        assert!((0.0..=1.0).contains(&pair.strength));
    }
}

#[test]
fn test_configured_limits_are_capped() {
    let mut config = ExplainConfig::default();
    config.interactions.max_sample_rows = 500;
    config.counterfactual.max_suggestions = 8;
    let engine = ExplanationEngine::new(config);
    let model: ModelHandle = Arc::new(FnModel::from_row_fn(Capability::PointPrediction, |r| {
        r.iter().enumerate().map(|(i, v)| (i + 1) as f64 * v).sum()
    }));
    engine
        .initialize_explainer("wide", model, uniform(30, 8, 5), names(8))
        .unwrap();

    let report = engine
        .analyze_interactions("wide", &uniform(200, 8, 6), 3, &RequestOptions::default())
        .unwrap();
    assert_eq!(report.sample_size, 50);

    let counterfactual = engine
        .counterfactual("wide", &[1.0; 8], 0.5, &RequestOptions::default())
        .unwrap();
    assert_eq!(counterfactual.suggestions.len(), 5);
}

#[test]
fn test_multi_output_model_attributes_first_channel() {
    let engine = ExplanationEngine::default();
    let model: ModelHandle = Arc::new(FnModel::new(Capability::PointPrediction, |batch| {
        Ok(batch.rows().map(|r| vec![r[0] - r[1], 100.0 * r[1]]).collect())
    }));
    engine
        .initialize_explainer("two", model, uniform(30, 2, 9), names(2))
        .unwrap();
    let explanation = engine
        .explain_instance("two", &[0.8, 0.2], &RequestOptions::default())
        .unwrap();
    assert_eq!(explanation.attribution.output_channel, 0);
    assert!((explanation.attribution.prediction - 0.6).abs() < 1e-12);
    assert!(explanation.attribution.per_feature["x0"] > 0.0);
    assert!(explanation.attribution.per_feature["x1"] < 0.0);
}

#[test]
fn test_model_aware_interactions_are_second_order() {
    let engine = ExplanationEngine::default();
    let model: ModelHandle = Arc::new(
        LinearModel::new(vec![0.5, -0.25, 0.1], 0.2).with_capability(Capability::Probabilistic),
    );
    let info = engine
        .initialize_explainer("prob", model, uniform(30, 3, 2), names(3))
        .unwrap();
    assert_eq!(info.kernel, KernelKind::ModelAwareLinear);
    assert!(info.has_fallback);

    let report = engine
        .analyze_interactions("prob", &uniform(10, 3, 4), 3, &RequestOptions::default())
        .unwrap();
    assert_eq!(report.method, InteractionMethod::SecondOrder);
    assert!(report.top_interactions.iter().all(|p| p.strength == 0.0));
}

#[test]
fn test_nonlinear_probabilistic_model_uses_sampling() {
    let engine = ExplanationEngine::default();
    let model: ModelHandle = Arc::new(LogisticModel::new(vec![3.0, -2.0], 0.0));
    let info = engine
        .initialize_explainer("logit", model, uniform(40, 2, 8), names(2))
        .unwrap();
    assert_eq!(info.kernel, KernelKind::Sampling);

    let explanation = engine
        .explain_instance("logit", &[1.0, 0.0], &RequestOptions::default())
        .unwrap();
    assert!(explanation.attribution.per_feature["x0"] > 0.0);
    assert!((explanation.attribution.reconstructed() - explanation.attribution.prediction).abs() < 1e-9);
}

#[test]
fn test_unknown_and_removed_models_are_not_found() {
    let engine = engine_with_additive_model();
    let err = engine
        .explain_instance("nope", &[0.0, 0.0, 0.0], &RequestOptions::default())
        .unwrap_err();
    assert!(matches!(err, ExplainError::NotFound { .. }));
    assert_eq!(err.model_id(), "nope");

    assert_eq!(engine.registered_models(), vec!["additive".to_string()]);
    assert!(engine.remove_explainer("additive"));
    assert!(!engine.remove_explainer("additive"));
    let err = engine.explainer_info("additive").unwrap_err();
    assert!(matches!(err, ExplainError::NotFound { .. }));
}

#[test]
fn test_validation_errors() {
    let engine = engine_with_additive_model();
    let err = engine
        .explain_instance("additive", &[1.0], &RequestOptions::default())
        .unwrap_err();
    assert!(matches!(err, ExplainError::Validation { .. }));

    let model: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0], 0.0));
    let err = engine
        .initialize_explainer(
            "dup",
            model,
            uniform(5, 2, 1),
            vec!["a".to_string(), "a".to_string()],
        )
        .unwrap_err();
    assert!(matches!(err, ExplainError::Validation { .. }));
    assert_eq!(err.operation(), Operation::InitializeExplainer);

    let err = engine
        .counterfactual("additive", &[1.0, 1.0, 1.0], f64::NAN, &RequestOptions::default())
        .unwrap_err();
    assert!(matches!(err, ExplainError::Validation { .. }));
}

#[test]
fn test_reregistration_replaces_entry() {
    let engine = engine_with_additive_model();
    let model: ModelHandle = Arc::new(LinearModel::new(vec![1.0, 1.0], 0.0));
    let info = engine
        .initialize_explainer("additive", model, uniform(10, 2, 3), names(2))
        .unwrap();
    assert_eq!(info.num_features, 2);
    assert_eq!(engine.explainer_info("additive").unwrap().num_features, 2);
    assert!(
        engine
            .explain_instance("additive", &[1.0, 1.0], &RequestOptions::default())
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_during_reregistration() {
    let engine = engine_with_additive_model();
    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            if i % 4 == 0 {
                let model: ModelHandle = Arc::new(FnModel::from_row_fn(
                    Capability::PointPrediction,
                    |r| 2.0 * r[0] - r[1],
                ));
                engine
                    .initialize_explainer("additive", model, uniform(50, 3, 7), names(3))
                    .map(|_| ())
            } else {
                engine
                    .explain_instance("additive", &[1.0, 1.0, 1.0], &RequestOptions::default())
                    .map(|e| assert!((e.attribution.reconstructed() - 1.0).abs() < 1e-9))
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}
