//! `llamapipe props` command: show the resolved engine configuration.

use anyhow::{Context, Result};

use crate::config::LlamapipeConfig;

/// Render the resolved configuration, as labelled lines or as JSON.
pub fn render_props(config: &LlamapipeConfig, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string_pretty(&config.engine)
            .context("failed to serialize engine config");
    }

    let mut out = config.engine.to_string();
    match config.batch.read_timeout {
        Some(limit) => out.push_str(&format!("\nRead timeout: {}s", limit.as_secs())),
        None => out.push_str("\nRead timeout: none"),
    }
    out.push_str(&format!("\nRead buffer: {} bytes", config.batch.buffer_size));
    Ok(out)
}
