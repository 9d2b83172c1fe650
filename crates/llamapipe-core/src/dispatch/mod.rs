//! Prompt dispatch over an engine session.
//!
//! Two exchanges are supported:
//!
//! - [`run_all`] writes prompts one at a time, reads until each response
//!   boundary, and returns every sanitized response. It owns the session
//!   and always tears it down.
//! - [`stream`] writes a single prompt and forwards each decoded character
//!   to a channel as soon as it is read. It borrows the session and leaves
//!   teardown to the caller.
//!
//! Every read (and every channel send) races a [`CancellationToken`] and,
//! when configured, a per-read deadline, so a stalled engine cannot hang
//! the caller.

mod decode;

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::boundary::{BoundaryDetector, BoundaryPolicy, BoundaryState, sanitize};
use crate::error::EngineError;
use crate::session::{EngineProcess, Session};

use decode::Utf8Decoder;

/// Tuning for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// How response boundaries are detected.
    pub boundary: BoundaryPolicy,
    /// Size of the stdout read buffer, in bytes.
    pub buffer_size: usize,
    /// Longest wait for a single read before giving up.
    pub read_timeout: Option<Duration>,
}

impl DispatchOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 1024;

    /// Options for batch dispatch: prompt-marker counting, no deadline.
    pub fn batch() -> Self {
        Self {
            boundary: BoundaryPolicy::PromptMarker,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            read_timeout: None,
        }
    }

    /// Options for streaming dispatch: delimiter-pair detection, no deadline.
    pub fn streaming() -> Self {
        Self {
            boundary: BoundaryPolicy::DelimiterPair,
            ..Self::batch()
        }
    }

    pub fn with_boundary(mut self, boundary: BoundaryPolicy) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::batch()
    }
}

/// How a streaming exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The response boundary was reached.
    Complete,
    /// Engine output ended before the boundary.
    Truncated,
    /// The receiving end of the channel was dropped.
    Detached,
}

/// Build the text written to the engine for one prompt.
///
/// The instruction block is prepended and a trailing `\n` is added unless
/// the prompt already ends with one; the engine only acts on whole lines.
pub fn format_prompt(instruction_block: &str, prompt: &str) -> String {
    let mut text = String::with_capacity(instruction_block.len() + prompt.len() + 1);
    text.push_str(instruction_block);
    text.push_str(prompt);
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Race `fut` against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = fut => result,
    }
}

async fn write_prompt<W>(input: &mut W, text: &str) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
{
    input
        .write_all(text.as_bytes())
        .await
        .map_err(EngineError::Write)?;
    input.flush().await.map_err(EngineError::Write)
}

/// Read one chunk; `Ok(0)` means end-of-stream.
async fn read_chunk<R>(
    output: &mut R,
    buf: &mut [u8],
    options: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<usize, EngineError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        match options.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, output.read(buf)).await {
                Ok(result) => result.map_err(EngineError::Read),
                Err(_) => Err(EngineError::TimedOut(limit)),
            },
            None => output.read(buf).await.map_err(EngineError::Read),
        }
    };
    cancellable(cancel, read).await
}

/// Send every prompt in order and collect the sanitized responses, then
/// close the session.
///
/// All-or-nothing: on any error no responses are returned. The session is
/// closed on every path; a teardown failure is logged and never replaces
/// the dispatch outcome.
pub async fn run_all<W, R, P, S>(
    mut session: Session<W, R, P>,
    prompts: &[S],
    instruction_block: &str,
    options: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<Vec<String>, EngineError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    P: EngineProcess,
    S: AsRef<str>,
{
    let result = exchange_all(&mut session, prompts, instruction_block, options, cancel).await;
    let teardown = session.close().await;

    match (result, teardown) {
        (Ok(responses), Ok(())) => Ok(responses),
        (Ok(responses), Err(e)) => {
            warn!(error = %e, "engine teardown failed after batch completed");
            Ok(responses)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            warn!(error = %teardown, "engine teardown failed after dispatch error");
            Err(e)
        }
    }
}

async fn exchange_all<W, R, P, S>(
    session: &mut Session<W, R, P>,
    prompts: &[S],
    instruction_block: &str,
    options: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<Vec<String>, EngineError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    P: EngineProcess,
    S: AsRef<str>,
{
    let (input, output) = session.pipes()?;
    let mut detector = BoundaryDetector::new(options.boundary.clone());
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut responses = Vec::with_capacity(prompts.len());

    for (index, prompt) in prompts.iter().enumerate() {
        let text = format_prompt(instruction_block, prompt.as_ref());
        cancellable(cancel, write_prompt(&mut *input, &text)).await?;
        debug!(prompt_index = index, bytes = text.len(), "prompt written");

        detector.begin(index);
        let mut segment = String::new();
        loop {
            let n = read_chunk(&mut *output, &mut buf, options, cancel).await?;
            if n == 0 {
                segment.push_str(&decoder.finish());
                debug!(prompt_index = index, "engine output ended before boundary");
                return Err(EngineError::Truncated {
                    prompt_index: index,
                    partial: sanitize(&segment, detector.policy()),
                });
            }
            let chunk = decoder.push(&buf[..n]);
            segment.push_str(&chunk);
            if detector.feed(&chunk) == BoundaryState::Complete {
                break;
            }
        }

        debug!(
            prompt_index = index,
            markers = detector.markers_seen(),
            "response boundary reached"
        );
        responses.push(sanitize(&segment, detector.policy()));
    }

    Ok(responses)
}

/// Send one prompt and forward the response to `sink` character by
/// character, in the order read.
///
/// Each character is one `String` item; the next is not sent until the
/// previous one was accepted. The character that completes the boundary
/// is the last one sent. `sink` is dropped (closing the channel) when this
/// returns, whatever the outcome. The session stays open.
///
/// With [`BoundaryPolicy::PromptMarker`] the session must be fresh, since
/// the first response on a session carries one extra marker.
pub async fn stream<W, R, P>(
    session: &mut Session<W, R, P>,
    prompt: &str,
    instruction_block: &str,
    sink: mpsc::Sender<String>,
    options: &DispatchOptions,
    cancel: &CancellationToken,
) -> Result<StreamEnd, EngineError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    P: EngineProcess,
{
    let (input, output) = session.pipes()?;
    let text = format_prompt(instruction_block, prompt);
    cancellable(cancel, write_prompt(&mut *input, &text)).await?;
    debug!(bytes = text.len(), "streaming prompt written");

    let mut detector = BoundaryDetector::new(options.boundary.clone());
    detector.begin(0);
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut delivered = 0usize;

    loop {
        let n = read_chunk(&mut *output, &mut buf, options, cancel).await?;
        let chunk = if n == 0 {
            decoder.finish()
        } else {
            decoder.push(&buf[..n])
        };

        let mut encoded = [0u8; 4];
        for ch in chunk.chars() {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                sent = sink.send(ch.to_string()) => sent,
            };
            if sent.is_err() {
                debug!(delivered, "stream receiver dropped");
                return Ok(StreamEnd::Detached);
            }
            delivered += 1;

            // Nothing past the boundary character reaches the sink.
            if detector.feed(ch.encode_utf8(&mut encoded)) == BoundaryState::Complete {
                debug!(delivered, "streamed response complete");
                return Ok(StreamEnd::Complete);
            }
        }

        if n == 0 {
            debug!(delivered, "engine output ended before boundary");
            return Ok(StreamEnd::Truncated);
        }
    }
}
