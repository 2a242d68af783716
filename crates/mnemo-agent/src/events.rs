//! Streaming callback contract.
//!
//! Events are pushed through [`EventCallback::emit`]; a non-ok return means
//! the consumer is gone and the producer must stop. [`SafeCallback`]
//! swallows-and-logs failures for non-critical events (thinking, tool_use,
//! tool_result, hints) — only `answer` and `error` delivery failures abort.

use tokio::sync::mpsc;
use tracing::warn;

use mnemo_blocks::BlockEvent;

use crate::error::{AgentError, Result};

/// Push-model event sink. Implementations must be cheap and non-blocking;
/// persistence happens downstream.
pub trait EventCallback: Send + Sync {
    fn emit(&self, event: BlockEvent) -> Result<()>;
}

/// Callback backed by an unbounded tokio channel.
pub struct MpscCallback {
    tx: mpsc::UnboundedSender<BlockEvent>,
}

impl MpscCallback {
    pub fn new(tx: mpsc::UnboundedSender<BlockEvent>) -> Self {
        Self { tx }
    }

    /// Convenience: build a callback plus its receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BlockEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventCallback for MpscCallback {
    fn emit(&self, event: BlockEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| AgentError::CallbackClosed)
    }
}

/// Wrapper that downgrades delivery failures of non-critical events to a
/// warning. Critical events (`answer`, `error`) still propagate the failure
/// so the producer cancels.
pub struct SafeCallback<'a> {
    inner: &'a dyn EventCallback,
}

impl<'a> SafeCallback<'a> {
    pub fn new(inner: &'a dyn EventCallback) -> Self {
        Self { inner }
    }

    pub fn emit(&self, event: BlockEvent) -> Result<()> {
        let critical = event.event_type.is_critical();
        match self.inner.emit(event) {
            Ok(()) => Ok(()),
            Err(e) if critical => Err(e),
            Err(_) => {
                warn!("dropping non-critical event: stream consumer is gone");
                Ok(())
            }
        }
    }
}
