//! `llamapipe stream` command: type a response to the terminal as it is generated.

use std::io::Write;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use llamapipe_core::{EngineError, LlamaEngine, StreamEnd, sanitize};

use crate::config::LlamapipeConfig;

/// Run the stream command.
///
/// Raw characters go to stdout as they arrive. Once the response is
/// complete the sanitized text is printed again on its own line.
pub async fn run_stream(
    config: LlamapipeConfig,
    prompt: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let boundary = config.streaming.boundary.clone();
    let engine = LlamaEngine::new(config.engine).with_options(config.batch, config.streaming);
    let mut stream = engine.stream(prompt).context("failed to start engine")?;
    info!(bytes = prompt.len(), "streaming prompt");

    let mut stdout = std::io::stdout();
    let mut raw = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancel.is_cancelled() => {}
            ch = stream.next_char() => {
                let Some(ch) = ch else { break };
                print!("{ch}");
                stdout.flush().context("failed to write to stdout")?;
                raw.push_str(&ch);
                continue;
            }
        }
        // Ctrl-C: stop the dispatch and let the channel drain.
        stream.cancel();
    }
    println!();

    let end = stream.finish().await;
    debug!(chars = raw.chars().count(), ?end, "stream finished");
    match end {
        Ok(StreamEnd::Complete) => {
            println!("Response: {}", sanitize(&raw, &boundary));
            Ok(())
        }
        Ok(StreamEnd::Truncated) => {
            anyhow::bail!(
                "engine stopped before the response was complete (partial output: {:?})",
                sanitize(&raw, &boundary)
            );
        }
        Ok(StreamEnd::Detached) => Ok(()),
        Err(EngineError::Cancelled) => {
            eprintln!("Stream interrupted.");
            std::process::exit(130);
        }
        Err(e) => Err(e).context("streaming dispatch failed"),
    }
}
