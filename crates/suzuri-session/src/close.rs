//! Closing a document: confirm unsaved work, then shut down every kernel it
//! owns under one aggregate deadline.
//!
//! Per-kernel shutdowns run concurrently, each with its own
//! [`SHUTDOWN_TIMEOUT`](crate::lifecycle::SHUTDOWN_TIMEOUT); the aggregate
//! deadline bounds the whole operation so one hung kernel cannot block a
//! window from closing. [`SessionEvent::DocumentReadyToClose`] always fires
//! once the gate approves, deadline or not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use suzuri_types::{DocumentId, KernelRef, SessionEvent, ShutdownOutcome};

use crate::lifecycle::KernelManager;

/// Upper bound on a whole document close, across all its kernels.
pub const CLOSE_DOCUMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// The document layer's say in whether a close may proceed.
#[async_trait]
pub trait DocumentGate: Send + Sync {
    /// Whether the document has unsaved changes.
    async fn is_dirty(&self, document: DocumentId) -> bool;

    /// Ask the user to confirm discarding unsaved changes. `true` proceeds.
    async fn confirm_discard(&self, document: DocumentId) -> bool;
}

/// A gate for documents that never block closing.
pub struct AlwaysClean;

#[async_trait]
impl DocumentGate for AlwaysClean {
    async fn is_dirty(&self, _document: DocumentId) -> bool {
        false
    }

    async fn confirm_discard(&self, _document: DocumentId) -> bool {
        true
    }
}

/// How a close request resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The user declined to discard unsaved changes; nothing was touched.
    Cancelled,
    /// Shutdown ran. `results` holds the outcome per kernel that resolved
    /// within the aggregate deadline; `timed_out` is set if any did not.
    Ready {
        results: Vec<(KernelRef, ShutdownOutcome)>,
        timed_out: bool,
    },
}

/// Close (or reload) a document, shutting down all kernels it owns.
pub async fn close_document(
    manager: &Arc<KernelManager>,
    gate: &dyn DocumentGate,
    document: DocumentId,
    reloading: bool,
) -> CloseOutcome {
    if gate.is_dirty(document).await && !gate.confirm_discard(document).await {
        debug!(%document, "close cancelled, unsaved changes kept");
        return CloseOutcome::Cancelled;
    }

    let kernels = manager.kernels_for(document);
    let mut expected = 0;
    let (tx, mut rx) = mpsc::unbounded_channel();
    for kernel in kernels {
        let kernel_ref = kernel.kernel_ref();
        if !kernel.kind().supports_kill() {
            warn!(kernel = %kernel_ref, kind = %kernel.kind(), "transport cannot kill, skipping");
            continue;
        }
        expected += 1;
        let manager = Arc::clone(manager);
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = manager.kill(kernel_ref, false).await;
            let _ = tx.send((kernel_ref, outcome));
        });
    }
    drop(tx);

    let deadline = Instant::now() + CLOSE_DOCUMENT_TIMEOUT;
    let mut results = Vec::with_capacity(expected);
    let mut timed_out = false;
    while results.len() < expected {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((kernel_ref, Ok(outcome)))) => results.push((kernel_ref, outcome)),
            // A racing kill already removed it; nothing left to wait for.
            Ok(Some((kernel_ref, Err(e)))) => {
                debug!(kernel = %kernel_ref, error = %e, "kernel already gone during close");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(%document, resolved = results.len(), expected, "document close hit deadline");
                timed_out = true;
                break;
            }
        }
    }

    info!(%document, kernels = results.len(), timed_out, reloading, "document ready to close");
    manager.publish(SessionEvent::DocumentReadyToClose { document, reloading });
    CloseOutcome::Ready { results, timed_out }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    struct DirtyGate {
        confirm: bool,
    }

    #[async_trait]
    impl DocumentGate for DirtyGate {
        async fn is_dirty(&self, _document: DocumentId) -> bool {
            true
        }

        async fn confirm_discard(&self, _document: DocumentId) -> bool {
            self.confirm
        }
    }

    #[tokio::test]
    async fn test_zero_kernel_close_is_immediate() {
        let manager = KernelManager::new();
        let mut events = manager.subscribe();
        let document = DocumentId::new();

        let outcome = close_document(&manager, &AlwaysClean, document, false).await;
        assert_eq!(outcome, CloseOutcome::Ready { results: Vec::new(), timed_out: false });
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::DocumentReadyToClose { document, reloading: false }
        );
    }

    #[tokio::test]
    async fn test_declined_discard_cancels_untouched() {
        let manager = KernelManager::new();
        let mut events = manager.subscribe();

        let outcome =
            close_document(&manager, &DirtyGate { confirm: false }, DocumentId::new(), false).await;
        assert_eq!(outcome, CloseOutcome::Cancelled);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_confirmed_discard_proceeds() {
        let manager = KernelManager::new();
        let document = DocumentId::new();

        let outcome =
            close_document(&manager, &DirtyGate { confirm: true }, document, true).await;
        assert!(matches!(outcome, CloseOutcome::Ready { timed_out: false, .. }));
    }
}
