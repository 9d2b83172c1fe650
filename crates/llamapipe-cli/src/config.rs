//! Configuration file management for llamapipe.
//!
//! Provides a TOML-based config file at `~/.config/llamapipe/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use llamapipe_core::{DispatchOptions, EngineConfig};

/// Env var overriding the model path.
pub const MODEL_ENV: &str = "LLAMAPIPE_MODEL";
/// Env var overriding the engine directory.
pub const ENGINE_DIR_ENV: &str = "LLAMAPIPE_ENGINE_DIR";
/// Env var overriding the number of offloaded GPU layers.
pub const GPU_LAYERS_ENV: &str = "LLAMAPIPE_GPU_LAYERS";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchSection,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Per-read deadline in seconds; unset means wait indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,
    /// Stdout read buffer size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the llamapipe config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/llamapipe` or
/// `~/.config/llamapipe`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("llamapipe");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("llamapipe")
}

/// Return the path to the llamapipe config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the config file if one exists. A file that exists but does not
/// parse is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    load_config_from(&path).map(Some)
}

/// Serialize and write `config` to `path`, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Write the config file to its default location.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(config, &config_path())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub model: Option<PathBuf>,
    pub engine_dir: Option<PathBuf>,
    pub gpu_layers: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct LlamapipeConfig {
    pub engine: EngineConfig,
    pub batch: DispatchOptions,
    pub streaming: DispatchOptions,
}

impl LlamapipeConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config()?;
        debug!(path = %config_path().display(), found = file.is_some(), "config file checked");
        Self::resolve_with(cli, file)
    }

    /// Resolve against an already-loaded config file.
    ///
    /// - model: `--model` > `LLAMAPIPE_MODEL` > `engine.model` > default
    /// - engine dir: `--engine-dir` > `LLAMAPIPE_ENGINE_DIR` > `engine.engine_dir` > default
    /// - GPU layers: `--gpu-layers` > `LLAMAPIPE_GPU_LAYERS` > `engine.gpu_layers` > 0
    /// - read timeout: `--timeout` > `dispatch.read_timeout_secs` > none
    pub fn resolve_with(cli: &CliOverrides, file: Option<ConfigFile>) -> Result<Self> {
        let ConfigFile {
            mut engine,
            dispatch,
        } = file.unwrap_or_default();

        if let Some(model) = &cli.model {
            engine.model = model.clone();
        } else if let Ok(model) = std::env::var(MODEL_ENV) {
            engine.model = PathBuf::from(model);
        }

        if let Some(dir) = &cli.engine_dir {
            engine.engine_dir = dir.clone();
        } else if let Ok(dir) = std::env::var(ENGINE_DIR_ENV) {
            engine.engine_dir = PathBuf::from(dir);
        }

        if let Some(layers) = cli.gpu_layers {
            engine.gpu_layers = layers;
        } else if let Ok(layers) = std::env::var(GPU_LAYERS_ENV) {
            engine.gpu_layers = layers
                .trim()
                .parse()
                .with_context(|| format!("{GPU_LAYERS_ENV} is not a number: {layers:?}"))?;
        }

        engine.resolve();

        let mut batch = DispatchOptions::batch();
        let mut streaming = DispatchOptions::streaming();
        if let Some(size) = dispatch.buffer_size {
            batch = batch.with_buffer_size(size);
            streaming = streaming.with_buffer_size(size);
        }
        if let Some(secs) = cli.timeout_secs.or(dispatch.read_timeout_secs) {
            let limit = Duration::from_secs(secs);
            batch = batch.with_read_timeout(limit);
            streaming = streaming.with_read_timeout(limit);
        }

        debug!(
            model = %engine.model.display(),
            engine_dir = %engine.engine_dir.display(),
            gpu_layers = engine.gpu_layers,
            read_timeout = ?batch.read_timeout,
            "configuration resolved"
        );
        Ok(Self {
            engine,
            batch,
            streaming,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn clear_env() {
        unsafe { std::env::remove_var(MODEL_ENV) };
        unsafe { std::env::remove_var(ENGINE_DIR_ENV) };
        unsafe { std::env::remove_var(GPU_LAYERS_ENV) };
    }

    fn sample_file() -> ConfigFile {
        ConfigFile {
            engine: EngineConfig {
                model: PathBuf::from("/file/model.bin"),
                engine_dir: PathBuf::from("/file/llama.cpp"),
                gpu_layers: 10,
                ..EngineConfig::default()
            },
            dispatch: DispatchSection {
                read_timeout_secs: Some(30),
                buffer_size: Some(4096),
            },
        }
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("llamapipe").join("config.toml");

        let original = ConfigFile {
            engine: EngineConfig::default().resolved(),
            dispatch: DispatchSection {
                read_timeout_secs: None,
                buffer_size: Some(1024),
            },
        };
        save_config_to(&original, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config_to(&ConfigFile::default(), &path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn partial_config_file_loads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[engine]\nctx_size = 512\n").unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.engine.ctx_size, 512);
        assert_eq!(loaded.dispatch, DispatchSection::default());
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[engine\nctx_size = ").unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(
            format!("{err:#}").contains("failed to parse config file"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(MODEL_ENV, "/env/model.bin") };
        unsafe { std::env::set_var(GPU_LAYERS_ENV, "20") };

        let cli = CliOverrides {
            model: Some(PathBuf::from("/cli/model.bin")),
            gpu_layers: Some(40),
            timeout_secs: Some(5),
            ..CliOverrides::default()
        };
        let config = LlamapipeConfig::resolve_with(&cli, Some(sample_file())).unwrap();

        assert_eq!(config.engine.model, PathBuf::from("/cli/model.bin"));
        assert_eq!(config.engine.gpu_layers, 40);
        assert_eq!(config.batch.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.streaming.read_timeout, Some(Duration::from_secs(5)));

        clear_env();
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENGINE_DIR_ENV, "/env/llama.cpp") };
        unsafe { std::env::set_var(GPU_LAYERS_ENV, "20") };

        let config =
            LlamapipeConfig::resolve_with(&CliOverrides::default(), Some(sample_file())).unwrap();

        assert_eq!(config.engine.engine_dir, PathBuf::from("/env/llama.cpp"));
        assert_eq!(config.engine.gpu_layers, 20);
        assert_eq!(config.engine.model, PathBuf::from("/file/model.bin"));

        clear_env();
    }

    #[test]
    fn resolve_uses_config_file_dispatch_section() {
        let _lock = lock_env();
        clear_env();

        let config =
            LlamapipeConfig::resolve_with(&CliOverrides::default(), Some(sample_file())).unwrap();

        assert_eq!(config.batch.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.batch.buffer_size, 4096);
        assert_eq!(config.streaming.buffer_size, 4096);
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        clear_env();

        let config = LlamapipeConfig::resolve_with(&CliOverrides::default(), None).unwrap();

        assert_eq!(config.engine, EngineConfig::default().resolved());
        assert_eq!(config.batch, DispatchOptions::batch());
        assert_eq!(config.streaming, DispatchOptions::streaming());
    }

    #[test]
    fn resolve_errors_on_bad_gpu_layers_env() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(GPU_LAYERS_ENV, "lots") };

        let result = LlamapipeConfig::resolve_with(&CliOverrides::default(), None);
        clear_env();

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains(GPU_LAYERS_ENV), "unexpected error: {msg}");
    }

    #[test]
    fn resolve_missing_config_file_is_not_an_error() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let result = LlamapipeConfig::resolve(&CliOverrides::default());

        // Restore env before asserting, to avoid poisoning the mutex on failure.
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        let config = result.unwrap();
        assert_eq!(config.engine, EngineConfig::default().resolved());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("llamapipe/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
