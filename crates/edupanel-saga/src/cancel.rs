//! Cancellation signal checked at workflow entry.
//!
//! A workflow that has started always runs to completion or compensation;
//! cancelling only stops workflows that have not begun.

use tokio::sync::watch;

/// Sending half, held by whoever may abort the workflow.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half, passed into workflows.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A handle/signal pair.
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| *rx.borrow())
    }
}
