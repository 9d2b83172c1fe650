//! Driver for a local llama.cpp `main` engine running as a subprocess.
//!
//! The engine is launched in interactive instruction mode, prompts are
//! written to its stdin and responses are read back from stdout until a
//! response boundary is detected.
//!
//! - [`config`]: engine settings and default resolution
//! - [`command`]: engine binary path, argument vector and environment
//! - [`session`]: one engine process and its pipes, with ordered teardown
//! - [`dispatch`]: batch and streaming prompt exchanges
//! - [`boundary`]: response boundary detection and output sanitizing
//! - [`engine`]: the [`LlamaEngine`] handle that combines the above

pub mod boundary;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod session;

pub use boundary::{BoundaryDetector, BoundaryPolicy, BoundaryState, sanitize};
pub use config::{EngineConfig, resolve};
pub use dispatch::{DispatchOptions, StreamEnd};
pub use engine::{LlamaEngine, PromptStream};
pub use error::EngineError;
pub use session::{EngineProcess, EngineSession, Session};
