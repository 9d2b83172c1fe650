//! Engine configuration and default resolution.
//!
//! Callers build an [`EngineConfig`] with whatever fields they care about
//! and leave the rest at their zero value. [`EngineConfig::resolve`] then
//! fills every zero-valued field from the default table below. Resolution
//! is idempotent and never overwrites a value the caller set.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for one engine session.
///
/// Deserializes from partial TOML/JSON: missing fields take their zero
/// value and are filled in by [`EngineConfig::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the model weights, passed through opaquely to the engine.
    pub model: PathBuf,
    /// Directory containing the engine's `main` binary.
    pub engine_dir: PathBuf,
    /// Indices of the accelerator devices the engine may use.
    ///
    /// `None` means unset; an explicit empty list is kept as-is.
    pub cuda_devices: Option<Vec<u32>>,
    /// Size of the prompt context window, in tokens.
    pub ctx_size: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-k sampling width.
    pub top_k: u32,
    /// Penalty applied to repeated token sequences.
    pub repeat_penalty: f64,
    /// Number of layers offloaded to the accelerator.
    pub gpu_layers: u32,
    /// Maximum number of tokens in a response.
    pub max_tokens: u32,
    /// Generation-stopping strings.
    pub stop: Vec<String>,
    /// Prefix prepended to every prompt.
    pub instruction_block: String,
    /// Prompt batch size handed to the engine.
    pub batch_size: u32,
    /// Number of engine worker threads.
    pub threads: u32,
}

impl EngineConfig {
    pub const DEFAULT_MODEL: &str = "./llama.cpp/models/ggml-vocab.bin";
    pub const DEFAULT_ENGINE_DIR: &str = "./llama.cpp";
    pub const DEFAULT_CUDA_DEVICE: u32 = 0;
    pub const DEFAULT_CTX_SIZE: u32 = 2048;
    pub const DEFAULT_TEMPERATURE: f64 = 0.2;
    pub const DEFAULT_TOP_K: u32 = 10_000;
    pub const DEFAULT_REPEAT_PENALTY: f64 = 1.1;
    pub const DEFAULT_MAX_TOKENS: u32 = 1000;
    pub const DEFAULT_BATCH_SIZE: u32 = 128;
    pub const DEFAULT_THREADS: u32 = 8;

    /// Create a config for the given model and engine directory; every
    /// other field is left for [`EngineConfig::resolve`].
    pub fn new(model: impl Into<PathBuf>, engine_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            engine_dir: engine_dir.into(),
            ..Self::default()
        }
    }

    /// Fill every zero-valued field with its default.
    ///
    /// `gpu_layers`, `stop` and `instruction_block` default to their zero
    /// value, so they are never touched.
    pub fn resolve(&mut self) {
        if self.model.as_os_str().is_empty() {
            self.model = PathBuf::from(Self::DEFAULT_MODEL);
        }
        if self.engine_dir.as_os_str().is_empty() {
            self.engine_dir = PathBuf::from(Self::DEFAULT_ENGINE_DIR);
        }
        if self.cuda_devices.is_none() {
            self.cuda_devices = Some(vec![Self::DEFAULT_CUDA_DEVICE]);
        }
        if self.ctx_size == 0 {
            self.ctx_size = Self::DEFAULT_CTX_SIZE;
        }
        if self.temperature == 0.0 {
            self.temperature = Self::DEFAULT_TEMPERATURE;
        }
        if self.top_k == 0 {
            self.top_k = Self::DEFAULT_TOP_K;
        }
        if self.repeat_penalty == 0.0 {
            self.repeat_penalty = Self::DEFAULT_REPEAT_PENALTY;
        }
        if self.max_tokens == 0 {
            self.max_tokens = Self::DEFAULT_MAX_TOKENS;
        }
        if self.batch_size == 0 {
            self.batch_size = Self::DEFAULT_BATCH_SIZE;
        }
        if self.threads == 0 {
            self.threads = Self::DEFAULT_THREADS;
        }
    }

    /// Consuming variant of [`EngineConfig::resolve`].
    pub fn resolved(mut self) -> Self {
        self.resolve();
        self
    }

    /// The accelerator device list, or an empty slice when unset.
    pub fn devices(&self) -> &[u32] {
        self.cuda_devices.as_deref().unwrap_or(&[])
    }
}

/// Resolve a configuration, returning the fully populated record.
pub fn resolve(config: EngineConfig) -> EngineConfig {
    config.resolved()
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model path: {}", self.model.display())?;
        writeln!(f, "Engine path: {}", self.engine_dir.display())?;
        writeln!(f, "Accelerator devices: {:?}", self.devices())?;
        writeln!(f, "Context size: {}", self.ctx_size)?;
        writeln!(f, "Temperature: {}", self.temperature)?;
        writeln!(f, "Top-k sampling: {}", self.top_k)?;
        writeln!(f, "Repeat penalty: {}", self.repeat_penalty)?;
        writeln!(f, "GPU layers: {}", self.gpu_layers)?;
        writeln!(f, "Max response tokens: {}", self.max_tokens)?;
        writeln!(f, "Stop strings: {:?}", self.stop)?;
        writeln!(f, "Batch size: {}", self.batch_size)?;
        write!(f, "Threads: {}", self.threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_fills_every_zero_field() {
        let cfg = EngineConfig::default().resolved();

        assert_eq!(cfg.model, PathBuf::from(EngineConfig::DEFAULT_MODEL));
        assert_eq!(cfg.engine_dir, PathBuf::from(EngineConfig::DEFAULT_ENGINE_DIR));
        assert_eq!(cfg.cuda_devices, Some(vec![0]));
        assert_eq!(cfg.ctx_size, 2048);
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.top_k, 10_000);
        assert_eq!(cfg.repeat_penalty, 1.1);
        assert_eq!(cfg.gpu_layers, 0);
        assert_eq!(cfg.max_tokens, 1000);
        assert!(cfg.stop.is_empty());
        assert!(cfg.instruction_block.is_empty());
        assert_eq!(cfg.batch_size, 128);
        assert_eq!(cfg.threads, 8);
    }

    #[test]
    fn resolve_is_idempotent() {
        let once = EngineConfig {
            ctx_size: 512,
            stop: vec!["###".to_string()],
            ..EngineConfig::default()
        }
        .resolved();
        let twice = once.clone().resolved();
        assert_eq!(once, twice);
    }

    #[test]
    fn resolve_keeps_explicit_values() {
        let cfg = EngineConfig {
            model: PathBuf::from("/models/13b.bin"),
            engine_dir: PathBuf::from("/opt/llama.cpp"),
            cuda_devices: Some(vec![1, 2]),
            ctx_size: 4096,
            temperature: 0.8,
            top_k: 40,
            repeat_penalty: 1.3,
            gpu_layers: 30,
            max_tokens: 64,
            stop: vec!["User:".to_string()],
            instruction_block: "Answer briefly. ".to_string(),
            batch_size: 256,
            threads: 4,
        };
        assert_eq!(cfg.clone().resolved(), cfg);
    }

    #[test]
    fn resolve_keeps_explicit_empty_device_list() {
        let cfg = EngineConfig {
            cuda_devices: Some(vec![]),
            ..EngineConfig::default()
        }
        .resolved();
        assert_eq!(cfg.cuda_devices, Some(vec![]));
        assert!(cfg.devices().is_empty());
    }

    #[test]
    fn free_function_matches_method() {
        let cfg = EngineConfig::new("/m.bin", "/llama");
        assert_eq!(resolve(cfg.clone()), cfg.resolved());
    }

    #[test]
    fn partial_toml_deserializes_with_zero_values() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            model = "/models/7b.bin"
            gpu_layers = 12
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model, PathBuf::from("/models/7b.bin"));
        assert_eq!(cfg.gpu_layers, 12);
        assert_eq!(cfg.ctx_size, 0);
        assert_eq!(cfg.cuda_devices, None);

        let cfg = cfg.resolved();
        assert_eq!(cfg.ctx_size, 2048);
        assert_eq!(cfg.gpu_layers, 12);
    }

    #[test]
    fn sampling_floats_serialize_in_shortest_form() {
        let text = toml::to_string(&EngineConfig::default().resolved()).unwrap();
        assert!(text.contains("temperature = 0.2\n"), "got:\n{text}");
        assert!(text.contains("repeat_penalty = 1.1\n"), "got:\n{text}");
    }

    #[test]
    fn display_lists_every_property() {
        let text = EngineConfig::default().resolved().to_string();
        assert!(text.contains("Model path: ./llama.cpp/models/ggml-vocab.bin"));
        assert!(text.contains("Accelerator devices: [0]"));
        assert!(text.contains("Temperature: 0.2"));
        assert!(text.contains("Repeat penalty: 1.1"));
        assert!(text.contains("Stop strings: []"));
        assert_eq!(text.lines().count(), 12);
    }
}
