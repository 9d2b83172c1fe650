//! Shared test utilities for llamapipe tests.
//!
//! - **[`EngineScript`]**: an in-memory engine over `tokio::io::duplex`
//!   that replies from a fixed script. Deterministic, no subprocess.
//! - **[`write_engine_script`]**: writes an executable `#!/bin/sh` engine
//!   named `main` into a directory, for tests that spawn a real process.
//! - **[`RecordingWriter`] / [`CallLog`]**: record the order in which an
//!   engine's stdin is shut down and dropped.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// In-memory pipe capacity for scripted engines.
const PIPE_CAPACITY: usize = 64 * 1024;

// -----------------------------------------------------------------------
// Scripted in-memory engine
// -----------------------------------------------------------------------

/// What a scripted engine does once every reply has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhenDone {
    /// Keep reading; exit on the next unanswerable prompt or on EOF.
    ExitOnNextPrompt,
    /// Exit right after writing the last reply.
    ExitImmediately,
    /// Keep reading and never answer; exit only on stdin EOF.
    Stall,
}

/// Builder for an in-memory fake engine.
///
/// The engine writes `greeting` as soon as it starts, then answers each
/// line it receives on stdin with the next reply, chunk by chunk.
#[derive(Debug, Clone)]
pub struct EngineScript {
    greeting: String,
    replies: Vec<Vec<String>>,
    when_done: WhenDone,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineScript {
    /// A script whose greeting is the engine's initial `"\n> "` marker.
    pub fn new() -> Self {
        Self {
            greeting: "\n> ".to_string(),
            replies: Vec::new(),
            when_done: WhenDone::ExitOnNextPrompt,
        }
    }

    pub fn greeting(mut self, greeting: &str) -> Self {
        self.greeting = greeting.to_string();
        self
    }

    /// Queue a reply written in a single chunk.
    pub fn reply(mut self, text: &str) -> Self {
        self.replies.push(vec![text.to_string()]);
        self
    }

    /// Queue a reply written as separate chunks with a yield in between.
    pub fn reply_chunks(mut self, chunks: &[&str]) -> Self {
        self.replies
            .push(chunks.iter().map(|c| (*c).to_string()).collect());
        self
    }

    /// Exit as soon as the last reply is written.
    pub fn exit_after_last_reply(mut self) -> Self {
        self.when_done = WhenDone::ExitImmediately;
        self
    }

    /// Never answer once replies run out; hold stdout open until stdin
    /// closes.
    pub fn stall_when_done(mut self) -> Self {
        self.when_done = WhenDone::Stall;
        self
    }

    /// Start the engine task. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> ScriptedEngine {
        let (client_in, engine_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (engine_out, client_out) = tokio::io::duplex(PIPE_CAPACITY);

        let handle = tokio::spawn(run_script(self, engine_in, engine_out));

        ScriptedEngine {
            stdin: client_in,
            stdout: client_out,
            handle,
        }
    }
}

async fn run_script(
    script: EngineScript,
    engine_in: DuplexStream,
    mut engine_out: DuplexStream,
) -> Vec<String> {
    let mut received = Vec::new();
    if engine_out.write_all(script.greeting.as_bytes()).await.is_err() {
        return received;
    }

    let mut replies = script.replies.into_iter();
    let mut lines = BufReader::new(engine_in).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        received.push(line);

        if script.when_done == WhenDone::Stall && replies.len() == 0 {
            continue;
        }
        let Some(chunks) = replies.next() else {
            break;
        };
        for chunk in chunks {
            if engine_out.write_all(chunk.as_bytes()).await.is_err() {
                return received;
            }
            let _ = engine_out.flush().await;
            tokio::task::yield_now().await;
        }
        if script.when_done == WhenDone::ExitImmediately && replies.len() == 0 {
            break;
        }
    }

    received
}

/// A running scripted engine.
///
/// `stdin` is the client's writing end, `stdout` the client's reading end.
/// The task handle resolves to every line the engine received.
pub struct ScriptedEngine {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub handle: JoinHandle<Vec<String>>,
}

// -----------------------------------------------------------------------
// Shell-script engines
// -----------------------------------------------------------------------

/// Write an executable shell script named `main` into `dir`.
///
/// `dir` can then be used as an engine directory. Returns the script path.
pub fn write_engine_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("main");
    std::fs::write(&path, body).expect("failed to write engine script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make engine script executable");
    }

    path
}

/// Create a temporary engine directory holding a `main` script.
pub fn engine_dir_with_script(body: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("failed to create temp engine dir");
    write_engine_script(dir.path(), body);
    dir
}

// -----------------------------------------------------------------------
// Call-order recording
// -----------------------------------------------------------------------

/// Shared, ordered log of named calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn record(&self, call: &'static str) {
        self.0.lock().expect("call log poisoned").push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().expect("call log poisoned").clone()
    }
}

/// Writer wrapper that logs `close_input` on shutdown and `drop_input`
/// when dropped.
pub struct RecordingWriter<W> {
    inner: W,
    log: CallLog,
    fail_shutdown: bool,
    shutdown_logged: bool,
}

impl<W> RecordingWriter<W> {
    pub fn new(inner: W, log: CallLog) -> Self {
        Self {
            inner,
            log,
            fail_shutdown: false,
            shutdown_logged: false,
        }
    }

    /// Make shutdown fail with an I/O error (after logging it).
    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RecordingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.shutdown_logged {
            self.shutdown_logged = true;
            self.log.record("close_input");
        }
        if self.fail_shutdown {
            return Poll::Ready(Err(std::io::Error::other("stdin already broken")));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<W> Drop for RecordingWriter<W> {
    fn drop(&mut self) {
        self.log.record("drop_input");
    }
}
