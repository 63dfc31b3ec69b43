//! Async prompt bridge: runs blocking native generation off the host's async
//! context and streams fragments back in order.
//!
//! Each `submit` returns a [`PromptHandle`] immediately. Behind it:
//! 1. A slot in the model's bounded prompt queue is reserved (`Busy` when full)
//! 2. The prompt waits its turn on a one-permit FIFO gate
//! 3. The native call runs on a blocking worker under the handle's read guard
//! 4. Each fragment is sent over an unbounded channel as it is produced
//! 5. A terminal event and the final [`Completion`] close the stream

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::inference::handle::HandleOwner;
use crate::inference::native::PromptOptions;

/// A generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Prompt text, passed to the engine as-is.
    pub prompt: String,

    /// Sampling parameters.
    #[serde(default)]
    pub options: PromptOptions,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: PromptOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PromptOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle of one prompt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PromptState {
    /// Submitted, waiting for the model.
    Idle = 0,
    /// The native call is running on a worker.
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl PromptState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PromptState::Idle,
            1 => PromptState::Running,
            2 => PromptState::Completed,
            3 => PromptState::Failed,
            _ => PromptState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromptState::Idle | PromptState::Running)
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The engine returned on its own (end of text or `n_predict` reached).
    Stop,
    /// The host cancelled mid-stream.
    Cancelled,
}

/// Final result of a prompt call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Concatenation of every delivered fragment.
    pub text: String,

    /// Number of fragments delivered.
    pub completion_tokens: usize,

    pub finish_reason: FinishReason,
}

/// An event delivered to the host, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptEvent {
    /// A new fragment was generated.
    Token(String),
    /// Generation finished (naturally or by cancellation).
    Done(Completion),
    /// Generation failed or never started.
    Error(Error),
}

/// Serializes prompt calls on one model handle.
pub struct PromptBridge {
    owner: Arc<HandleOwner>,
    gate: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

/// Decrements the pending count when the prompt's task ends.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PromptBridge {
    /// `max_pending` bounds running plus queued prompts; at least one is allowed.
    pub fn new(owner: Arc<HandleOwner>, max_pending: usize) -> Self {
        Self {
            owner,
            gate: Arc::new(Semaphore::new(1)),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: max_pending.max(1),
        }
    }

    /// Prompts submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop admitting queued prompts; they finish with `NotLoaded`.
    pub fn close(&self) {
        self.gate.close();
    }

    /// Start a prompt. Returns as soon as the call is queued.
    ///
    /// Validation, liveness and queue capacity are checked here, before
    /// anything reaches the engine. Must be called within a tokio runtime.
    pub fn submit(&self, request: PromptRequest) -> Result<PromptHandle> {
        if request.prompt.is_empty() {
            return Err(Error::Validation("prompt cannot be empty".into()));
        }
        request.options.validate()?;
        if !self.owner.is_live() || self.gate.is_closed() {
            return Err(Error::NotLoaded);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("prompt requires a tokio runtime: {e}")))?;

        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        let slot = PendingSlot(self.pending.clone());
        if previous >= self.max_pending {
            drop(slot);
            warn!(queued = previous, "Prompt queue full");
            return Err(Error::Busy { queued: previous });
        }

        // Poll once here so the waiter takes its place in the semaphore's
        // FIFO queue at submission time rather than when the task first runs.
        let mut acquire = Box::pin(self.gate.clone().acquire_owned());
        let ready = (&mut acquire).now_or_never();

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(PromptState::Idle as u8));

        let owner = self.owner.clone();
        let task_cancel = cancel.clone();
        let task_state = state.clone();

        let task = runtime.spawn(async move {
            let _slot = slot;

            let permit = match ready {
                Some(permit) => permit,
                None => tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        return finish(&task_state, &tx, Err(Error::Cancelled));
                    }
                    permit = acquire => permit,
                },
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(_) => return finish(&task_state, &tx, Err(Error::NotLoaded)),
            };
            if task_cancel.is_cancelled() {
                return finish(&task_state, &tx, Err(Error::Cancelled));
            }

            task_state.store(PromptState::Running as u8, Ordering::Release);
            debug!(prompt_id = %id, prompt_len = request.prompt.len(), "Prompt running");

            let worker_tx = tx.clone();
            let worker_cancel = task_cancel.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                run_native(&owner, &request, &worker_tx, &worker_cancel)
            })
            .await
            .map_err(|e| Error::Internal(format!("prompt worker failed: {e}")))
            .and_then(|outcome| outcome);

            // The worker has joined; the next prompt may take the model.
            drop(permit);

            match &outcome {
                Ok(completion) => info!(
                    prompt_id = %id,
                    tokens = completion.completion_tokens,
                    finish_reason = ?completion.finish_reason,
                    "Prompt complete"
                ),
                Err(e) => warn!(prompt_id = %id, "Prompt failed: {e}"),
            }
            finish(&task_state, &tx, outcome)
        });

        Ok(PromptHandle {
            id,
            events: rx,
            cancel,
            state,
            task,
        })
    }
}

/// Record the terminal state, emit the terminal event and hand back the outcome.
fn finish(
    state: &AtomicU8,
    tx: &mpsc::UnboundedSender<PromptEvent>,
    outcome: Result<Completion>,
) -> Result<Completion> {
    let (terminal, event) = match &outcome {
        Ok(completion) if completion.finish_reason == FinishReason::Cancelled => {
            (PromptState::Cancelled, PromptEvent::Done(completion.clone()))
        }
        Ok(completion) => (PromptState::Completed, PromptEvent::Done(completion.clone())),
        Err(Error::Cancelled) => (PromptState::Cancelled, PromptEvent::Error(Error::Cancelled)),
        Err(e) => (PromptState::Failed, PromptEvent::Error(e.clone())),
    };
    state.store(terminal as u8, Ordering::Release);
    let _ = tx.send(event);
    outcome
}

/// Runs on the blocking worker. Holds the handle's read guard throughout.
fn run_native(
    owner: &HandleOwner,
    request: &PromptRequest,
    tx: &mpsc::UnboundedSender<PromptEvent>,
    cancel: &CancellationToken,
) -> Result<Completion> {
    owner.with_handle(|engine, raw| {
        let mut text = String::new();
        let mut completion_tokens = 0;
        let mut stopped = false;

        let result = engine.prompt(raw, &request.prompt, &request.options, &mut |fragment: &str| {
            if cancel.is_cancelled() {
                stopped = true;
                return false;
            }
            text.push_str(fragment);
            completion_tokens += 1;
            // A dropped receiver is not a cancellation; keep accumulating.
            let _ = tx.send(PromptEvent::Token(fragment.to_string()));
            true
        });
        result.map_err(Error::Native)?;

        // A cancel that lands after the last fragment does not change the outcome.
        let finish_reason = if stopped {
            FinishReason::Cancelled
        } else {
            FinishReason::Stop
        };
        Ok(Completion {
            text,
            completion_tokens,
            finish_reason,
        })
    })
}

/// The host's view of one in-flight prompt.
///
/// Dropping the handle does not cancel generation; call [`PromptHandle::cancel`].
pub struct PromptHandle {
    id: Uuid,
    events: mpsc::UnboundedReceiver<PromptEvent>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    task: JoinHandle<Result<Completion>>,
}

impl PromptHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PromptState {
        PromptState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ask generation to stop. Fragments produced after this are not delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this prompt, for use from other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event in emission order; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<PromptEvent> {
        self.events.recv().await
    }

    /// Wait for the outcome. Undelivered events are discarded.
    pub async fn finish(self) -> Result<Completion> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("prompt task failed: {e}")))?
    }

    /// Consume the handle as a stream of events; generation keeps running
    /// until it ends or the cancellation token fires.
    pub fn into_stream(self) -> UnboundedReceiverStream<PromptEvent> {
        UnboundedReceiverStream::new(self.events)
    }
}

impl std::fmt::Debug for PromptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
