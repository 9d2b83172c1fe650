//! High-level engine handle.
//!
//! [`LlamaEngine`] ties the pieces together: it resolves a configuration
//! once, and for each call opens a fresh [`EngineSession`], dispatches, and
//! tears the session down.
//!
//! ```text
//! LlamaEngine::prompt(prompts) --> open --> run_all --> close --> Vec<String>
//!
//! LlamaEngine::stream(prompt)  --> open --> spawn task:
//!                                             stream --> close
//!                                  PromptStream <-- mpsc(1) <-- chars
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{self, DispatchOptions, StreamEnd};
use crate::error::EngineError;
use crate::session::EngineSession;

/// Entry point for prompting a local engine.
#[derive(Debug, Clone)]
pub struct LlamaEngine {
    config: EngineConfig,
    batch: DispatchOptions,
    streaming: DispatchOptions,
}

impl LlamaEngine {
    /// Create an engine handle; `config` is resolved here.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: config.resolved(),
            batch: DispatchOptions::batch(),
            streaming: DispatchOptions::streaming(),
        }
    }

    /// Replace the dispatch options used for batch and streaming calls.
    pub fn with_options(mut self, batch: DispatchOptions, streaming: DispatchOptions) -> Self {
        self.batch = batch;
        self.streaming = streaming;
        self
    }

    /// The resolved configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Send `prompts` to a fresh engine and return one sanitized response
    /// per prompt, in order.
    pub async fn prompt<S>(&self, prompts: &[S]) -> Result<Vec<String>, EngineError>
    where
        S: AsRef<str>,
    {
        self.prompt_with_cancel(prompts, &CancellationToken::new())
            .await
    }

    /// Like [`LlamaEngine::prompt`], stopping early when `cancel` fires.
    pub async fn prompt_with_cancel<S>(
        &self,
        prompts: &[S],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError>
    where
        S: AsRef<str>,
    {
        let session = EngineSession::open(&self.config)?;
        info!(prompts = prompts.len(), "dispatching batch");
        dispatch::run_all(
            session,
            prompts,
            &self.config.instruction_block,
            &self.batch,
            cancel,
        )
        .await
    }

    /// Send one prompt to a fresh engine and stream its raw output
    /// character by character.
    ///
    /// Must be called from within a Tokio runtime. The session is closed by
    /// the background task once the response ends, fails, or the stream is
    /// dropped.
    pub fn stream(&self, prompt: &str) -> Result<PromptStream, EngineError> {
        let mut session = EngineSession::open(&self.config)?;
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let prompt = prompt.to_string();
        let instruction_block = self.config.instruction_block.clone();
        let options = self.streaming.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let result = dispatch::stream(
                &mut session,
                &prompt,
                &instruction_block,
                tx,
                &options,
                &task_cancel,
            )
            .await;
            if let Err(e) = session.close().await {
                warn!(error = %e, "engine teardown failed after stream");
            }
            debug!(?result, "stream task finished");
            result
        });

        Ok(PromptStream {
            chars: ReceiverStream::new(rx),
            task,
            cancel,
        })
    }
}

/// Characters of one streamed response.
///
/// Yields each character as a one-character `String`, in engine order,
/// and ends when the response is complete, the engine goes away, or the
/// stream is cancelled. Dropping it cancels the underlying dispatch.
pub struct PromptStream {
    chars: ReceiverStream<String>,
    task: JoinHandle<Result<StreamEnd, EngineError>>,
    cancel: CancellationToken,
}

impl PromptStream {
    /// Next character, or `None` once the stream has ended.
    pub async fn next_char(&mut self) -> Option<String> {
        futures::StreamExt::next(&mut self.chars).await
    }

    /// Stop the dispatch. Buffered characters may still be yielded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the dispatch to finish and report how it ended.
    ///
    /// Characters not yet taken are drained and discarded.
    pub async fn finish(mut self) -> Result<StreamEnd, EngineError> {
        while self.next_char().await.is_some() {}
        (&mut self.task).await?
    }
}

impl Stream for PromptStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.chars).poll_next(cx)
    }
}

impl Drop for PromptStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PromptStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptStream")
            .field("finished", &self.task.is_finished())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
