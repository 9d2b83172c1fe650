//! `llamapipe prompt` command: send a batch of prompts and print the responses.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use llamapipe_core::{EngineError, LlamaEngine};

use crate::config::LlamapipeConfig;

/// Run the prompt command.
///
/// Prints one sanitized response per line, in prompt order. Nothing is
/// printed unless every prompt was answered.
pub async fn run_prompt(
    config: LlamapipeConfig,
    prompts: &[String],
    cancel: CancellationToken,
) -> Result<()> {
    let engine = LlamaEngine::new(config.engine).with_options(config.batch, config.streaming);

    info!(
        prompts = prompts.len(),
        engine = %llamapipe_core::command::engine_binary(engine.config()).display(),
        "dispatching prompts"
    );
    let result = engine.prompt_with_cancel(prompts, &cancel).await;
    let responses = match result {
        Ok(responses) => responses,
        Err(EngineError::Cancelled) => {
            warn!("batch dispatch cancelled");
            eprintln!("\nDispatch interrupted. No responses were kept.");
            std::process::exit(130);
        }
        Err(EngineError::Truncated {
            prompt_index,
            partial,
        }) => {
            anyhow::bail!(
                "engine stopped before answering prompt {} (partial output: {partial:?})",
                prompt_index + 1
            );
        }
        Err(e) => return Err(e).context("batch dispatch failed"),
    };

    info!(responses = responses.len(), "batch dispatch complete");
    for response in &responses {
        println!("{response}");
    }
    Ok(())
}
