//! LLM client with request pacing and a hard per-request timeout.
//!
//! [`LlmClient`] is the only component that performs network I/O. It wraps an
//! [`LlmBackend`] (one per provider) and enforces two constraints:
//!
//! - **Pacing**: request starts are never closer together than the configured
//!   interval, across every clone of the client and every worker using it.
//!   The last-start timestamp lives behind an async mutex that is held while
//!   waiting, so concurrent callers are serialized through the pacing gate.
//! - **Timeout**: each request is bounded; exceeding the bound yields
//!   [`FailureKind::Timeout`].
//!
//! The client never retries. Retry policy belongs to
//! [`PredictionRunner`](crate::runner::PredictionRunner).
//!
//! ## Provider Submodules
//!
//! - [`gemini`] - Google Gemini `generateContent`
//! - [`openai`] - `OpenAI`-compatible chat completions

pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Why a prediction attempt produced no label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request exceeded its timeout
    Timeout,
    /// Network, HTTP status, or authentication failure
    Transport,
    /// The answer contained no recognizable label
    Unparsable,
    /// The strategy's text field was missing on the sample
    MissingField,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Transport => f.write_str("transport"),
            Self::Unparsable => f.write_str("unparsable"),
            Self::MissingField => f.write_str("missing_field"),
        }
    }
}

/// A failed request or parse, recorded as data rather than raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Failure category
    pub kind: FailureKind,
    /// Diagnostic detail
    pub message: String,
}

impl Failure {
    /// Timeout failure
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    /// Transport/auth failure
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
        }
    }

    /// Unparsable answer
    #[must_use]
    pub fn unparsable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unparsable,
            message: message.into(),
        }
    }

    /// Map a `reqwest` error onto a failure kind
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

/// A language-model provider.
///
/// Implementations send exactly one request per call and do not retry.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Send `prompt` to `model` and return the answer text.
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, Failure>;
}

/// Enforces a minimum interval between request starts.
///
/// Clones share the same timestamp.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    last_start: Arc<Mutex<Option<Instant>>>,
}

impl Pacer {
    /// Pacer with the given minimum interval
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait until a request may start, then claim the slot.
    pub async fn wait_turn(&self) {
        let mut last_start = self.last_start.lock().await;
        if let Some(prev) = *last_start {
            let ready = prev + self.interval;
            let now = Instant::now();
            if ready > now {
                debug!("pacing: waiting {:?}", ready - now);
                tokio::time::sleep_until(ready).await;
            }
        }
        *last_start = Some(Instant::now());
    }
}

/// Paced, time-bounded access to one backend
#[derive(Clone)]
pub struct LlmClient {
    backend: Arc<dyn LlmBackend>,
    pacer: Pacer,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("backend", &self.backend.name())
            .field("pacer", &self.pacer)
            .finish()
    }
}

impl LlmClient {
    /// Create a client around `backend` with the given pacing interval
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, pacing: Duration) -> Self {
        Self {
            backend,
            pacer: Pacer::new(pacing),
        }
    }

    /// Backend name
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Send one prompt.
    ///
    /// Waits for the pacing gate, then bounds the request by `timeout`.
    ///
    /// # Errors
    /// Returns [`FailureKind::Timeout`] when the request exceeds `timeout`,
    /// or whatever failure the backend reports.
    pub async fn send(&self, prompt: &str, timeout: Duration, model: &str) -> Result<String, Failure> {
        self.pacer.wait_turn().await;

        match tokio::time::timeout(timeout, self.backend.complete(model, prompt)).await {
            Ok(result) => result,
            Err(_) => Err(Failure::timeout(format!(
                "{} request to {model} timed out after {}s",
                self.backend.name(),
                timeout.as_secs_f64()
            ))),
        }
    }
}
