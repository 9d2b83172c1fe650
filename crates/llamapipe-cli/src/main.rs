mod config;
mod prompt_cmd;
mod props_cmd;
mod stream_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use llamapipe_core::EngineConfig;

use config::{CliOverrides, LlamapipeConfig};

#[derive(Parser)]
#[command(name = "llamapipe", about = "Drive a local llama.cpp engine over stdin/stdout")]
struct Cli {
    /// Model weights path (overrides LLAMAPIPE_MODEL env var)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Directory containing the engine's `main` binary (overrides LLAMAPIPE_ENGINE_DIR)
    #[arg(long, global = true)]
    engine_dir: Option<PathBuf>,

    /// Layers to offload to the GPU (overrides LLAMAPIPE_GPU_LAYERS)
    #[arg(long, global = true)]
    gpu_layers: Option<u32>,

    /// Give up if the engine is silent for this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            model: self.model.clone(),
            engine_dir: self.engine_dir.clone(),
            gpu_layers: self.gpu_layers,
            timeout_secs: self.timeout,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a llamapipe config file with default engine settings
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved engine configuration
    Props {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send prompts in one session and print one response per line
    Prompt {
        /// Prompts to send, in order
        #[arg(required = true)]
        prompts: Vec<String>,
    },
    /// Stream the response to a single prompt as it is generated
    Stream {
        /// Prompt to send
        prompt: String,
    },
}

/// Execute the `llamapipe init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let engine = EngineConfig::default().resolved();
    let cfg = config::ConfigFile {
        engine,
        dispatch: config::DispatchSection {
            read_timeout_secs: None,
            buffer_size: Some(llamapipe_core::DispatchOptions::DEFAULT_BUFFER_SIZE),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  engine.model = {}", cfg.engine.model.display());
    println!("  engine.engine_dir = {}", cfg.engine.engine_dir.display());
    println!();
    println!("Next: edit the model and engine paths, then run `llamapipe props` to check them.");

    Ok(())
}

/// Cancel the returned token on Ctrl+C; a second Ctrl+C exits at once.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping engine (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Props { json } => {
            let resolved = LlamapipeConfig::resolve(&overrides)?;
            println!("{}", props_cmd::render_props(&resolved, json)?);
        }
        Commands::Prompt { prompts } => {
            let resolved = LlamapipeConfig::resolve(&overrides)?;
            prompt_cmd::run_prompt(resolved, &prompts, cancel_on_ctrl_c()).await?;
        }
        Commands::Stream { prompt } => {
            let resolved = LlamapipeConfig::resolve(&overrides)?;
            stream_cmd::run_stream(resolved, &prompt, cancel_on_ctrl_c()).await?;
        }
    }

    Ok(())
}
