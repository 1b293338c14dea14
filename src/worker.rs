//! Comment generation worker.
//!
//! A single OS thread owns the session bridge and serializes every
//! exchange: the client loop enqueues requests and polls outcomes without
//! ever blocking on generation. One worker per session, by construction.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::errors::SessionError;
use crate::extract::extract_comment;
use crate::prompt::build_prompt;
use crate::session::Exchanger;

/// Backpressure bound for pending generation requests; overflow is dropped
/// by the enqueuer, never blocked on.
pub const EXCHANGE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ExchangeRequest {
    /// Generate a comment for a flushed batch. `speaker` is the buffer key
    /// (empty for anonymous) and is echoed back in the outcome.
    Generate { text: String, speaker: String },
    /// Stop the worker after in-flight work; closes the session.
    Shutdown,
}

/// Result of one generation exchange, already reduced to a display comment.
/// An `Ok` with an empty string means the answer had no usable content.
#[derive(Debug)]
pub struct ExchangeOutcome {
    pub speaker: String,
    pub result: Result<String, SessionError>,
}

pub struct CommentWorker {
    request_tx: Sender<ExchangeRequest>,
    outcome_rx: Receiver<ExchangeOutcome>,
    handle: JoinHandle<()>,
}

impl CommentWorker {
    pub fn spawn<S>(
        mut bridge: S,
        prompt_template: Option<String>,
        max_output_chars: i64,
    ) -> Self
    where
        S: Exchanger + Send + 'static,
    {
        let (request_tx, request_rx) = bounded::<ExchangeRequest>(EXCHANGE_QUEUE_CAPACITY);
        let (outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(EXCHANGE_QUEUE_CAPACITY);

        let handle = thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                let (text, speaker) = match request {
                    ExchangeRequest::Generate { text, speaker } => (text, speaker),
                    ExchangeRequest::Shutdown => break,
                };
                let prompt = build_prompt(
                    prompt_template.as_deref(),
                    &text,
                    (!speaker.is_empty()).then_some(speaker.as_str()),
                );
                let result = bridge
                    .exchange(&prompt)
                    .map(|answer| extract_comment(&answer, max_output_chars));
                match &result {
                    Ok(comment) => debug!(%speaker, %comment, "generated comment"),
                    Err(err) => warn!(%speaker, %err, "exchange failed"),
                }
                if outcome_tx.send(ExchangeOutcome { speaker, result }).is_err() {
                    break;
                }
            }
            bridge.shutdown();
        });

        Self {
            request_tx,
            outcome_rx,
            handle,
        }
    }

    pub fn requests(&self) -> Sender<ExchangeRequest> {
        self.request_tx.clone()
    }

    pub fn outcomes(&self) -> Receiver<ExchangeOutcome> {
        self.outcome_rx.clone()
    }

    /// Ask the worker to wind down and wait for the session to close.
    pub fn shutdown(self) {
        let _ = self.request_tx.send(ExchangeRequest::Shutdown);
        if self.handle.join().is_err() {
            warn!("comment worker panicked during shutdown");
        }
    }
}
