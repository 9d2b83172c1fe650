//! Engine process session.
//!
//! A [`Session`] owns one engine process together with its stdin writer
//! and stdout reader. Teardown always closes stdin first (so the engine
//! sees end-of-input) and then terminates the process, on every exit path:
//! explicitly through [`Session::close`], or implicitly when a live session
//! is dropped (including during a panic).
//!
//! The session is generic over its parts so dispatch can run against
//! in-memory pipes in tests; [`EngineSession`] is the real thing.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

use crate::command;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Control over the process behind a session.
#[async_trait]
pub trait EngineProcess: Send {
    /// OS process id, if the process is still known to the OS.
    fn id(&self) -> Option<u32>;

    /// Forcibly terminate the process and reap it.
    async fn terminate(&mut self) -> std::io::Result<()>;

    /// Begin termination without waiting. Used from `Drop`.
    fn start_terminate(&mut self);
}

#[async_trait]
impl EngineProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        self.kill().await
    }

    fn start_terminate(&mut self) {
        if let Err(e) = self.start_kill() {
            debug!(error = %e, "engine already gone at drop");
        }
    }
}

/// A session backed by a real engine subprocess.
pub type EngineSession = Session<ChildStdin, ChildStdout, Child>;

/// One engine process plus its exclusively-owned pipes.
pub struct Session<W, R, P>
where
    W: AsyncWrite + Unpin + Send,
    P: EngineProcess,
{
    input: Option<W>,
    output: R,
    process: Option<P>,
    live: bool,
}

impl<W, R, P> std::fmt::Debug for Session<W, R, P>
where
    W: AsyncWrite + Unpin + Send,
    P: EngineProcess,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.process.as_ref().and_then(|p| p.id()))
            .field("live", &self.live)
            .finish()
    }
}

impl EngineSession {
    /// Spawn the engine described by `config` and attach to its pipes.
    ///
    /// `config` should already be resolved. Must be called from within a
    /// Tokio runtime. The engine's stderr is forwarded to `tracing` at
    /// debug level and never parsed.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let binary = command::engine_binary(config);
        let mut child = command::build_command(config)
            .spawn()
            .map_err(|source| EngineError::ProcessStart {
                binary: binary.clone(),
                source,
            })?;

        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            child.start_terminate();
            return Err(EngineError::Spawn(
                "engine stdin or stdout was not piped".to_string(),
            ));
        };

        // Drain stderr until EOF; a closed pipe would kill the engine on
        // its next diagnostic write.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).split(b'\n');
                loop {
                    match lines.next_segment().await {
                        Ok(Some(line)) => {
                            let line = String::from_utf8_lossy(&line);
                            debug!(target: "llamapipe::engine_stderr", pid, "{}", line.trim_end());
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(pid, error = %e, "engine stderr read failed");
                            break;
                        }
                    }
                }
            });
        }

        info!(pid, binary = %binary.display(), "engine session opened");
        Ok(Session::from_parts(stdin, stdout, child))
    }
}

impl<W, R, P> Session<W, R, P>
where
    W: AsyncWrite + Unpin + Send,
    P: EngineProcess,
{
    /// Assemble a live session from already-connected parts.
    pub fn from_parts(input: W, output: R, process: P) -> Self {
        Self {
            input: Some(input),
            output,
            process: Some(process),
            live: true,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    /// Borrow both pipes for one dispatch exchange.
    pub(crate) fn pipes(&mut self) -> Result<(&mut W, &mut R), EngineError> {
        match (self.live, self.input.as_mut()) {
            (true, Some(input)) => Ok((input, &mut self.output)),
            _ => Err(EngineError::SessionClosed),
        }
    }

    /// Close stdin, then terminate the process.
    ///
    /// Termination happens even if closing stdin fails. A termination
    /// failure takes precedence in the returned error; otherwise a stdin
    /// failure is returned. Closing an already-closed session is a no-op.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        let pid = self.pid();

        let mut input_result = Ok(());
        if let Some(mut input) = self.input.take() {
            input_result = input.shutdown().await;
            drop(input);
        }
        if let Err(e) = &input_result {
            warn!(pid, error = %e, "failed to close engine stdin");
        }

        let mut terminate_result = Ok(());
        if let Some(mut process) = self.process.take() {
            terminate_result = process.terminate().await;
        }

        match (input_result, terminate_result) {
            (_, Err(e)) => {
                warn!(pid, error = %e, "failed to terminate engine");
                Err(EngineError::Teardown(e))
            }
            (Err(e), Ok(())) => Err(EngineError::Teardown(e)),
            (Ok(()), Ok(())) => {
                info!(pid, "engine session closed");
                Ok(())
            }
        }
    }
}

impl<W, R, P> Drop for Session<W, R, P>
where
    W: AsyncWrite + Unpin + Send,
    P: EngineProcess,
{
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        drop(self.input.take());
        if let Some(mut process) = self.process.take() {
            debug!(pid = process.id(), "live session dropped, terminating engine");
            process.start_terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamapipe_test_utils::{CallLog, RecordingWriter};

    /// Process stand-in that records teardown calls into a shared log.
    struct RecordingProcess {
        log: CallLog,
        fail: bool,
    }

    #[async_trait]
    impl EngineProcess for RecordingProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn terminate(&mut self) -> std::io::Result<()> {
            self.log.record("terminate");
            if self.fail {
                return Err(std::io::Error::other("kill failed"));
            }
            Ok(())
        }

        fn start_terminate(&mut self) {
            self.log.record("start_terminate");
        }
    }

    fn mock_session(
        log: &CallLog,
        fail_shutdown: bool,
        fail_kill: bool,
    ) -> Session<RecordingWriter<tokio::io::Sink>, tokio::io::Empty, RecordingProcess> {
        let mut writer = RecordingWriter::new(tokio::io::sink(), log.clone());
        if fail_shutdown {
            writer = writer.failing_shutdown();
        }
        Session::from_parts(
            writer,
            tokio::io::empty(),
            RecordingProcess {
                log: log.clone(),
                fail: fail_kill,
            },
        )
    }

    #[tokio::test]
    async fn close_shuts_input_before_terminating() {
        let log = CallLog::default();
        let mut session = mock_session(&log, false, false);

        session.close().await.unwrap();

        assert_eq!(log.calls(), vec!["close_input", "drop_input", "terminate"]);
        assert!(!session.is_live());
    }

    #[tokio::test]
    async fn close_terminates_even_when_input_close_fails() {
        let log = CallLog::default();
        let mut session = mock_session(&log, true, false);

        let err = session.close().await.unwrap_err();

        assert!(matches!(err, EngineError::Teardown(_)));
        assert_eq!(log.calls(), vec!["close_input", "drop_input", "terminate"]);
    }

    #[tokio::test]
    async fn close_reports_termination_failure() {
        let log = CallLog::default();
        let mut session = mock_session(&log, false, true);

        let err = session.close().await.unwrap_err();
        assert!(err.to_string().contains("kill failed"), "got: {err}");
    }

    #[tokio::test]
    async fn close_twice_is_noop() {
        let log = CallLog::default();
        let mut session = mock_session(&log, false, false);

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(log.calls(), vec!["close_input", "drop_input", "terminate"]);
    }

    #[tokio::test]
    async fn pipes_unavailable_after_close() {
        let log = CallLog::default();
        let mut session = mock_session(&log, false, false);
        assert!(session.pipes().is_ok());

        session.close().await.unwrap();
        assert!(matches!(session.pipes(), Err(EngineError::SessionClosed)));
    }

    #[tokio::test]
    async fn dropping_live_session_drops_input_then_terminates() {
        let log = CallLog::default();
        {
            let _session = mock_session(&log, false, false);
        }
        assert_eq!(log.calls(), vec!["drop_input", "start_terminate"]);
    }

    #[tokio::test]
    async fn dropping_closed_session_does_nothing_more() {
        let log = CallLog::default();
        {
            let mut session = mock_session(&log, false, false);
            session.close().await.unwrap();
        }
        assert_eq!(log.calls(), vec!["close_input", "drop_input", "terminate"]);
    }

    #[tokio::test]
    async fn open_missing_binary_is_process_start_error() {
        let cfg = EngineConfig::new("/models/none.bin", "/nonexistent/llama.cpp").resolved();
        let err = EngineSession::open(&cfg).unwrap_err();
        match err {
            EngineError::ProcessStart { binary, .. } => {
                assert_eq!(binary, std::path::PathBuf::from("/nonexistent/llama.cpp/main"));
            }
            other => panic!("expected ProcessStart, got {other:?}"),
        }
    }

    #[test]
    fn debug_shows_pid_and_liveness() {
        let log = CallLog::default();
        let session = mock_session(&log, false, false);
        let text = format!("{session:?}");
        assert!(text.contains("4242"));
        assert!(text.contains("live: true"));
    }
}
