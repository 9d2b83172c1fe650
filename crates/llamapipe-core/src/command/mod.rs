//! Engine command-line construction.
//!
//! Turns a resolved [`EngineConfig`] into the program path and argument
//! vector for llama.cpp's interactive `main` binary.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::EngineConfig;

/// File name of the engine binary inside [`EngineConfig::engine_dir`].
pub const ENGINE_BINARY: &str = "main";

/// Generation-count sentinel meaning "no limit".
pub const UNBOUNDED_GENERATION: &str = "-1";

/// Environment variable the engine reads to pick accelerator devices.
pub const DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Full path of the engine binary.
pub fn engine_binary(config: &EngineConfig) -> PathBuf {
    config.engine_dir.join(ENGINE_BINARY)
}

/// Build the ordered argument vector for the engine.
///
/// The model path is passed through as-is; nothing is validated here.
pub fn build_args(config: &EngineConfig) -> Vec<String> {
    vec![
        "-m".to_string(),
        config.model.to_string_lossy().into_owned(),
        "--color".to_string(),
        "--ctx_size".to_string(),
        config.ctx_size.to_string(),
        "-n".to_string(),
        UNBOUNDED_GENERATION.to_string(),
        "-ins".to_string(),
        "-b".to_string(),
        config.batch_size.to_string(),
        "--top_k".to_string(),
        config.top_k.to_string(),
        "--temp".to_string(),
        config.temperature.to_string(),
        "--repeat_penalty".to_string(),
        config.repeat_penalty.to_string(),
        "--n-gpu-layers".to_string(),
        config.gpu_layers.to_string(),
        "-t".to_string(),
        config.threads.to_string(),
    ]
}

/// Comma-joined device list, or `None` when no devices are configured.
fn devices_value(config: &EngineConfig) -> Option<String> {
    let devices = config.devices();
    if devices.is_empty() {
        return None;
    }
    Some(
        devices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Build the engine subprocess command with all three stdio streams piped.
///
/// The child is killed if the returned handle is dropped without an
/// explicit teardown.
pub fn build_command(config: &EngineConfig) -> Command {
    let mut cmd = Command::new(engine_binary(config));
    cmd.args(build_args(config));

    if let Some(devices) = devices_value(config) {
        cmd.env(DEVICES_ENV, devices);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}
