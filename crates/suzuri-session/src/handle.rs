//! The session actor: a command-channel facade over [`KernelManager`].
//!
//! The document/UI layer holds a cheap, cloneable [`SessionHandle`] and
//! never touches the manager directly. Commands carry a oneshot reply;
//! execution event streams are not handed back across the channel. The
//! actor drains them and fans every [`CellEvent`] out on the session event
//! bus, tagged with its cell.
//!
//! Each command runs in its own task, so a slow launch never blocks an
//! interrupt or kill queued behind it.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot};

use suzuri_protocol::KernelSpec;
use suzuri_types::{
    CellEvent, CellId, DocumentId, KernelRef, OutputHandling, SessionEvent, ShutdownOutcome,
    TransportKind,
};

use crate::close::{CloseOutcome, DocumentGate, close_document};
use crate::error::{ExecuteError, LifecycleError};
use crate::lifecycle::KernelManager;

/// Errors surfaced by [`SessionHandle`] calls.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The session actor is gone; no further commands will be served.
    #[error("session is shut down")]
    Shutdown,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// Commands the session actor serves.
pub enum SessionCommand {
    LaunchKernel {
        spec: KernelSpec,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
        reply: oneshot::Sender<Result<KernelRef, LifecycleError>>,
    },
    LaunchKernelByName {
        name: String,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
        reply: oneshot::Sender<Result<KernelRef, LifecycleError>>,
    },
    ExecuteCell {
        kernel_ref: KernelRef,
        cell: CellId,
        code: String,
        reply: oneshot::Sender<Result<(), ExecuteError>>,
    },
    InterruptKernel {
        kernel_ref: KernelRef,
        reply: oneshot::Sender<Result<(), LifecycleError>>,
    },
    RestartKernel {
        kernel_ref: KernelRef,
        outputs: OutputHandling,
        reply: oneshot::Sender<Result<KernelRef, LifecycleError>>,
    },
    KillKernel {
        kernel_ref: KernelRef,
        restarting: bool,
        reply: oneshot::Sender<Result<ShutdownOutcome, LifecycleError>>,
    },
    CloseDocument {
        document: DocumentId,
        reloading: bool,
        reply: oneshot::Sender<CloseOutcome>,
    },
}

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

/// Start the session actor over `manager` and return its handle.
pub fn spawn_session(manager: Arc<KernelManager>, gate: Arc<dyn DocumentGate>) -> SessionHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = manager.event_sender().clone();

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let manager = Arc::clone(&manager);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { dispatch(manager, gate, command).await });
        }
    });

    SessionHandle { tx, events }
}

async fn dispatch(manager: Arc<KernelManager>, gate: Arc<dyn DocumentGate>, command: SessionCommand) {
    match command {
        SessionCommand::LaunchKernel { spec, cwd, kind, document, kernel_ref, reply } => {
            let result = manager.launch(spec, cwd, kind, document, kernel_ref).await;
            let _ = reply.send(result.map(|kernel| kernel.kernel_ref()));
        }
        SessionCommand::LaunchKernelByName { name, cwd, kind, document, kernel_ref, reply } => {
            let result = manager
                .launch_by_name(&name, cwd, kind, document, kernel_ref)
                .await;
            let _ = reply.send(result.map(|kernel| kernel.kernel_ref()));
        }
        SessionCommand::ExecuteCell { kernel_ref, cell, code, reply } => {
            match manager.execute(kernel_ref, cell, &code) {
                Ok(mut stream) => {
                    let _ = reply.send(Ok(()));
                    while let Some(event) = stream.next().await {
                        manager.publish(SessionEvent::Cell { cell, event });
                    }
                }
                Err(e) => {
                    manager.publish(SessionEvent::Cell {
                        cell,
                        event: CellEvent::Failed(e.to_string()),
                    });
                    let _ = reply.send(Err(e));
                }
            }
        }
        SessionCommand::InterruptKernel { kernel_ref, reply } => {
            let _ = reply.send(manager.interrupt(kernel_ref).await);
        }
        SessionCommand::RestartKernel { kernel_ref, outputs, reply } => {
            let result = manager.restart(kernel_ref, outputs).await;
            let _ = reply.send(result.map(|kernel| kernel.kernel_ref()));
        }
        SessionCommand::KillKernel { kernel_ref, restarting, reply } => {
            let _ = reply.send(manager.kill(kernel_ref, restarting).await);
        }
        SessionCommand::CloseDocument { document, reloading, reply } => {
            let _ = reply.send(close_document(&manager, gate.as_ref(), document, reloading).await);
        }
    }
}

impl SessionHandle {
    /// Subscribe to the session event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn launch_kernel(
        &self,
        spec: KernelSpec,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
    ) -> Result<KernelRef, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::LaunchKernel { spec, cwd, kind, document, kernel_ref, reply })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    pub async fn launch_kernel_by_name(
        &self,
        name: impl Into<String>,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
    ) -> Result<KernelRef, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::LaunchKernelByName {
            name: name.into(),
            cwd,
            kind,
            document,
            kernel_ref,
            reply,
        })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    /// Submit code for a cell. Resolves once the submission is accepted;
    /// the per-cell events arrive on the bus as [`SessionEvent::Cell`].
    pub async fn execute_cell(
        &self,
        kernel_ref: KernelRef,
        cell: CellId,
        code: impl Into<String>,
    ) -> Result<(), HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ExecuteCell { kernel_ref, cell, code: code.into(), reply })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    pub async fn interrupt_kernel(&self, kernel_ref: KernelRef) -> Result<(), HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::InterruptKernel { kernel_ref, reply })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    pub async fn restart_kernel(
        &self,
        kernel_ref: KernelRef,
        outputs: OutputHandling,
    ) -> Result<KernelRef, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::RestartKernel { kernel_ref, outputs, reply })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    pub async fn kill_kernel(
        &self,
        kernel_ref: KernelRef,
        restarting: bool,
    ) -> Result<ShutdownOutcome, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::KillKernel { kernel_ref, restarting, reply })?;
        Ok(rx.await.map_err(|_| HandleError::Shutdown)??)
    }

    pub async fn close_document(
        &self,
        document: DocumentId,
        reloading: bool,
    ) -> Result<CloseOutcome, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::CloseDocument { document, reloading, reply })?;
        rx.await.map_err(|_| HandleError::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> Result<(), HandleError> {
        self.tx.send(command).map_err(|_| HandleError::Shutdown)
    }
}

// ============================================================================
// Tests
// ============================================================================
