//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::request::ExplainRequest;
use featlens_core::{ExplainConfig, ExplanationEngine, RequestOptions};
use serde::Serialize;
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Explain {
            request,
            index,
            max_evals,
        } => {
            let (engine, model_id, rows) = prepare(&request, workspace)?;
            let row = row_at(&rows, index)?;
            let opts = RequestOptions {
                max_evals,
                ..Default::default()
            };
            print_json(&engine.explain_instance(&model_id, row, &opts)?)
        }
        Commands::Batch {
            request,
            concurrency,
            max_evals,
        } => {
            let (engine, model_id, rows) = prepare(&request, workspace)?;
            let opts = RequestOptions {
                max_evals,
                max_concurrency: concurrency,
                ..Default::default()
            };
            print_json(&engine.explain_batch(&model_id, &rows, &opts).await?)
        }
        Commands::Global {
            request,
            sample_size,
            top_n,
        } => {
            let (engine, model_id, rows) = prepare(&request, workspace)?;
            let defaults = &engine.config().global;
            let sample_size = sample_size.unwrap_or(defaults.default_sample_size);
            let top_n = top_n.unwrap_or(defaults.default_top_n);
            let report = engine
                .global_feature_importance(&model_id, &rows, sample_size, top_n, &RequestOptions::default())
                .await?;
            print_json(&report)
        }
        Commands::Interactions { request, top_n } => {
            let (engine, model_id, rows) = prepare(&request, workspace)?;
            let top_n = top_n.unwrap_or(engine.config().interactions.default_top_n);
            print_json(&engine.analyze_interactions(&model_id, &rows, top_n, &RequestOptions::default())?)
        }
        Commands::Counterfactual {
            request,
            index,
            target_delta,
        } => {
            let (engine, model_id, rows) = prepare(&request, workspace)?;
            let row = row_at(&rows, index)?;
            print_json(&engine.counterfactual(&model_id, row, target_delta, &RequestOptions::default())?)
        }
    }
}

fn load(workspace: &Path) -> anyhow::Result<ExplainConfig> {
    featlens_core::load_config(Some(workspace)).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Build an engine from the workspace config and register the request's model.
fn prepare(
    request: &Path,
    workspace: &Path,
) -> anyhow::Result<(ExplanationEngine, String, featlens_core::Matrix)> {
    let engine = ExplanationEngine::new(load(workspace)?);
    let (model_id, rows) = ExplainRequest::load(request)?.register(&engine)?;
    Ok((engine, model_id, rows))
}

fn row_at(rows: &featlens_core::Matrix, index: usize) -> anyhow::Result<&[f64]> {
    anyhow::ensure!(
        index < rows.nrows(),
        "row index {} out of range (request has {} rows)",
        index,
        rows.nrows()
    );
    Ok(rows.row(index))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".featlens");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!("Configuration file already exists at: {}", config_path.display());
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ExplainConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&load(workspace)?)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
