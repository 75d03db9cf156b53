//! Kernel lifecycle: launch, readiness, status supervision, interrupt,
//! restart, and the shutdown protocol.
//!
//! [`KernelManager`] owns every live [`Kernel`] and is the entry point the
//! document layer calls. Each kernel gets a monitor task that folds
//! transport events into status transitions and forwards diagnostics; a
//! launch is only complete once the kernel answers `kernel_info_request`.
//!
//! Shutdown is cooperative with a hard backstop: a `shutdown_request` on the
//! control channel, a bounded wait for the ack, then forced teardown no
//! matter what the kernel said. The recorded [`ShutdownOutcome`] is
//! bookkeeping, never a reason to leave the process running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use suzuri_protocol::{
    ChannelKind, ExecutionState, InterruptMode, KernelSpec, KernelSpecRegistry, Message,
    MessageContent,
};
use suzuri_types::{
    CellId, DocumentId, KernelRef, KernelStatus, OutputHandling, RemoteSessionId, SessionEvent,
    ShutdownOutcome, TransportKind, now_millis,
};

use crate::correlator::children_of;
use crate::display::DisplayRegistry;
use crate::error::{ExecuteError, LaunchError, LifecycleError};
use crate::execute::{CellEventStream, ExecutionEngine};
use crate::transport::{Channel, KernelTransport, ProcessHandle, TransportEvent};

/// How long a kernel gets to acknowledge `shutdown_request` before forced
/// teardown proceeds anyway.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a freshly launched kernel gets to answer `kernel_info_request`.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Kernel
// ============================================================================

/// One live kernel: its channel, process/session handle, and status.
#[derive(Debug)]
pub struct Kernel {
    kernel_ref: KernelRef,
    document: DocumentId,
    spec: KernelSpec,
    cwd: PathBuf,
    kind: TransportKind,
    channel: Channel,
    process: Option<ProcessHandle>,
    remote_session: Option<RemoteSessionId>,
    status: watch::Sender<KernelStatus>,
    events: broadcast::Sender<SessionEvent>,
    last_activity: AtomicU64,
}

impl Kernel {
    pub fn kernel_ref(&self) -> KernelRef {
        self.kernel_ref
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn remote_session(&self) -> Option<RemoteSessionId> {
        self.remote_session
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    /// Watch status transitions without subscribing to the full event bus.
    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    /// Milliseconds since epoch of the last message seen from this kernel.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Apply a status transition, enforcing the one-way rules: `Terminated`
    /// is final, and a dead process only moves into shutdown bookkeeping.
    pub(crate) fn set_status(&self, next: KernelStatus) {
        let current = self.status();
        if current == next || current == KernelStatus::Terminated {
            return;
        }
        if matches!(current, KernelStatus::ProcessExited | KernelStatus::ProcessErrored)
            && !matches!(next, KernelStatus::ShuttingDown | KernelStatus::Terminated)
        {
            return;
        }
        self.status.send_replace(next);
        let _ = self.events.send(SessionEvent::KernelStatusChanged {
            kernel: self.kernel_ref,
            status: next,
        });
    }
}

#[cfg(any(test, feature = "test-mock"))]
impl Kernel {
    /// A kernel wired to a [`MockChannel`](crate::transport::mock::MockChannel)
    /// instead of a transport, for exercising the engine without processes.
    pub fn mock(status: KernelStatus) -> (Arc<Self>, crate::transport::mock::MockChannel) {
        let mock = crate::transport::mock::MockChannel::new("mock-sess");
        let (events, _) = broadcast::channel(64);
        let kernel = Arc::new(Self {
            kernel_ref: KernelRef::new(),
            document: DocumentId::new(),
            spec: KernelSpec {
                name: "mock".into(),
                display_name: "Mock".into(),
                language: "mock".into(),
                argv: Vec::new(),
                env: HashMap::new(),
                interrupt_mode: InterruptMode::Signal,
            },
            cwd: std::env::temp_dir(),
            kind: TransportKind::LocalProcess,
            channel: mock.channel.clone(),
            process: None,
            remote_session: None,
            status: watch::channel(status).0,
            events,
            last_activity: AtomicU64::new(now_millis()),
        });
        (kernel, mock)
    }
}

// ============================================================================
// KernelManager
// ============================================================================

/// Owns all live kernels and drives their lifecycle.
pub struct KernelManager {
    kernels: DashMap<KernelRef, Arc<Kernel>>,
    transports: RwLock<HashMap<TransportKind, Arc<dyn KernelTransport>>>,
    specs: RwLock<KernelSpecRegistry>,
    engine: Arc<ExecutionEngine>,
    events: broadcast::Sender<SessionEvent>,
}

impl KernelManager {
    pub fn new() -> Arc<Self> {
        let displays = Arc::new(DisplayRegistry::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            kernels: DashMap::new(),
            transports: RwLock::new(HashMap::new()),
            specs: RwLock::new(KernelSpecRegistry::new()),
            engine: Arc::new(ExecutionEngine::new(displays)),
            events,
        })
    }

    /// Register the transport used for its [`TransportKind`], replacing any
    /// previous one.
    pub fn register_transport(&self, transport: Arc<dyn KernelTransport>) {
        self.transports.write().insert(transport.kind(), transport);
    }

    pub fn register_spec(&self, spec: KernelSpec) {
        self.specs.write().register(spec);
    }

    /// Load kernel specs from a `<dir>/<name>/kernel.json` layout.
    pub fn load_spec_dir(&self, dir: &Path) -> std::io::Result<usize> {
        self.specs.write().load_dir(dir)
    }

    pub fn spec_names(&self) -> Vec<String> {
        self.specs.read().names().iter().map(|s| s.to_string()).collect()
    }

    /// Subscribe to everything the session engine reports.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn kernel(&self, kernel_ref: KernelRef) -> Option<Arc<Kernel>> {
        self.kernels.get(&kernel_ref).map(|entry| Arc::clone(entry.value()))
    }

    /// Every live kernel owned by `document`.
    pub fn kernels_for(&self, document: DocumentId) -> Vec<Arc<Kernel>> {
        self.kernels
            .iter()
            .filter(|entry| entry.value().document() == document)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn event_sender(&self) -> &broadcast::Sender<SessionEvent> {
        &self.events
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launch a kernel under `kernel_ref` for `document`.
    ///
    /// If the ref already names a live kernel, that kernel is killed first;
    /// a ref never maps to two kernels. The returned kernel is ready: the
    /// launch only succeeds after the `kernel_info` handshake.
    pub async fn launch(
        self: &Arc<Self>,
        spec: KernelSpec,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
    ) -> Result<Arc<Kernel>, LifecycleError> {
        let transport = self
            .transports
            .read()
            .get(&kind)
            .cloned()
            .ok_or(LifecycleError::Launch(LaunchError::NoTransport(kind)))?;

        if self.kernels.contains_key(&kernel_ref) {
            debug!(kernel = %kernel_ref, "ref already occupied, killing previous kernel");
            let _ = self.kill(kernel_ref, false).await;
        }

        info!(kernel = %kernel_ref, spec = %spec.name, %kind, "launching kernel");
        self.publish(SessionEvent::KernelStatusChanged {
            kernel: kernel_ref,
            status: KernelStatus::Starting,
        });

        let session = format!("suzuri-{}", kernel_ref.short());
        let opened = match transport.open(&spec, &cwd, &session).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(kernel = %kernel_ref, error = %e, "kernel launch failed");
                self.publish(SessionEvent::KernelLaunchFailed {
                    kernel: kernel_ref,
                    error: e.to_string(),
                });
                self.publish(SessionEvent::KernelStatusChanged {
                    kernel: kernel_ref,
                    status: KernelStatus::ProcessErrored,
                });
                return Err(e.into());
            }
        };

        let kernel = Arc::new(Kernel {
            kernel_ref,
            document,
            spec,
            cwd,
            kind,
            channel: opened.channel,
            process: opened.process,
            remote_session: opened.remote_session,
            status: watch::channel(KernelStatus::Starting).0,
            events: self.events.clone(),
            last_activity: AtomicU64::new(now_millis()),
        });
        self.kernels.insert(kernel_ref, Arc::clone(&kernel));
        self.spawn_monitor(&kernel);

        match self.handshake(&kernel).await {
            Ok(()) => {
                info!(kernel = %kernel_ref, "kernel ready");
                kernel.set_status(KernelStatus::Idle);
                Ok(kernel)
            }
            Err(e) => {
                warn!(kernel = %kernel_ref, error = %e, "kernel never became ready");
                self.publish(SessionEvent::KernelLaunchFailed {
                    kernel: kernel_ref,
                    error: e.to_string(),
                });
                kernel.set_status(KernelStatus::ProcessErrored);
                kernel.channel().close();
                if let Some(process) = kernel.process() {
                    process.terminate();
                }
                self.kernels.remove(&kernel_ref);
                Err(e.into())
            }
        }
    }

    /// Launch by registered spec name.
    pub async fn launch_by_name(
        self: &Arc<Self>,
        name: &str,
        cwd: PathBuf,
        kind: TransportKind,
        document: DocumentId,
        kernel_ref: KernelRef,
    ) -> Result<Arc<Kernel>, LifecycleError> {
        let spec = self
            .specs
            .read()
            .find(name)
            .cloned()
            .ok_or_else(|| LifecycleError::Launch(LaunchError::SpecNotFound(name.to_string())))?;
        self.launch(spec, cwd, kind, document, kernel_ref).await
    }

    async fn handshake(&self, kernel: &Kernel) -> Result<(), LaunchError> {
        let channel = kernel.channel();
        let request = Message::kernel_info_request(channel.session());
        let mut replies = children_of(channel, request.header.msg_id.clone());
        channel
            .send(ChannelKind::Shell, request)
            .map_err(|_| LaunchError::Handshake)?;

        let answered = tokio::time::timeout(STARTUP_TIMEOUT, async {
            while let Some(reply) = replies.next().await {
                if matches!(reply.content, MessageContent::KernelInfoReply(_)) {
                    return true;
                }
            }
            false
        })
        .await;

        match answered {
            Ok(true) => Ok(()),
            _ => Err(LaunchError::Handshake),
        }
    }

    /// Fold transport events into status transitions and diagnostics.
    /// Busy/idle churn from the kernel only applies while it is running;
    /// lifecycle transitions otherwise own the status.
    fn spawn_monitor(&self, kernel: &Arc<Kernel>) {
        let kernel = Arc::clone(kernel);
        let events = self.events.clone();
        let mut rx = kernel.channel().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Message(channel, message)) => {
                        kernel.touch();
                        if channel != ChannelKind::IoPub {
                            continue;
                        }
                        if let MessageContent::Status(status) = &message.content {
                            let next = match status.execution_state {
                                ExecutionState::Busy => KernelStatus::Busy,
                                ExecutionState::Idle => KernelStatus::Idle,
                                ExecutionState::Starting => continue,
                            };
                            let running = matches!(
                                kernel.status(),
                                KernelStatus::Idle
                                    | KernelStatus::Busy
                                    | KernelStatus::StartingInterrupt
                            );
                            if running {
                                kernel.set_status(next);
                            }
                        }
                    }
                    Ok(TransportEvent::Diagnostic(line)) => {
                        let _ = events.send(SessionEvent::KernelDiagnostic {
                            kernel: kernel.kernel_ref(),
                            line,
                        });
                    }
                    Ok(TransportEvent::Exited { code }) => {
                        if kernel.status() != KernelStatus::ShuttingDown {
                            warn!(kernel = %kernel.kernel_ref(), ?code, "kernel process died");
                            kernel.set_status(KernelStatus::ProcessExited);
                        }
                    }
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        if kernel.status() != KernelStatus::ShuttingDown {
                            kernel.set_status(KernelStatus::ProcessErrored);
                        }
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kernel = %kernel.kernel_ref(), skipped, "kernel monitor lagged");
                    }
                }
            }
        });
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Submit `code` for `cell` on the kernel named by `kernel_ref`.
    pub fn execute(
        &self,
        kernel_ref: KernelRef,
        cell: CellId,
        code: &str,
    ) -> Result<CellEventStream, ExecuteError> {
        let kernel = self
            .kernel(kernel_ref)
            .ok_or(ExecuteError::UnknownKernel(kernel_ref))?;
        self.engine.execute(&kernel, cell, code)
    }

    // ========================================================================
    // Interrupt / restart / kill
    // ========================================================================

    /// Interrupt whatever the kernel is doing. Signal delivery for local
    /// kernels (unless the spec opts into message mode), `interrupt_request`
    /// on the control channel otherwise.
    pub async fn interrupt(&self, kernel_ref: KernelRef) -> Result<(), LifecycleError> {
        let kernel = self
            .kernel(kernel_ref)
            .ok_or(LifecycleError::UnknownKernel(kernel_ref))?;

        let by_signal = kernel.kind() == TransportKind::LocalProcess
            && kernel.spec().interrupt_mode == InterruptMode::Signal;

        let delivered: Result<(), LifecycleError> = if by_signal {
            match kernel.process() {
                Some(process) => process.interrupt(),
                None => Err(LifecycleError::UnsupportedOperation(
                    "kernel has no process handle".to_string(),
                )),
            }
        } else {
            let request = Message::interrupt_request(kernel.channel().session());
            kernel
                .channel()
                .send(ChannelKind::Control, request)
                .map_err(LifecycleError::from)
        };

        match delivered {
            Ok(()) => {
                kernel.set_status(KernelStatus::StartingInterrupt);
                self.publish(SessionEvent::KernelInterrupted { kernel: kernel_ref });
                Ok(())
            }
            Err(e) => {
                warn!(kernel = %kernel_ref, error = %e, "interrupt delivery failed");
                self.publish(SessionEvent::KernelInterruptFailed {
                    kernel: kernel_ref,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Kill and relaunch under the same ref, with the same spec and cwd.
    /// `outputs` says whether accumulated outputs (and display locations)
    /// are cleared as part of the transition.
    pub async fn restart(
        self: &Arc<Self>,
        kernel_ref: KernelRef,
        outputs: OutputHandling,
    ) -> Result<Arc<Kernel>, LifecycleError> {
        let kernel = self
            .kernel(kernel_ref)
            .ok_or(LifecycleError::UnknownKernel(kernel_ref))?;
        let spec = kernel.spec().clone();
        let cwd = kernel.cwd().to_path_buf();
        let kind = kernel.kind();
        let document = kernel.document();
        drop(kernel);

        let _ = self.kill(kernel_ref, true).await;
        self.publish(SessionEvent::KernelRestarted { kernel: kernel_ref, outputs });
        if outputs == OutputHandling::Clear {
            self.engine.displays().clear();
        }
        self.launch(spec, cwd, kind, document, kernel_ref).await
    }

    /// Kill a kernel: cooperative shutdown, bounded wait, forced teardown.
    ///
    /// Always ends with the kernel `Terminated` and removed; the returned
    /// outcome records how cooperative the kernel was. Errs only when the
    /// ref names no live kernel.
    pub async fn kill(
        &self,
        kernel_ref: KernelRef,
        restarting: bool,
    ) -> Result<ShutdownOutcome, LifecycleError> {
        let (_, kernel) = self
            .kernels
            .remove(&kernel_ref)
            .ok_or(LifecycleError::UnknownKernel(kernel_ref))?;

        kernel.set_status(KernelStatus::ShuttingDown);
        self.engine.cancel_kernel(kernel_ref);

        let outcome = shutdown_channel(kernel.channel()).await;

        kernel.channel().close();
        if let Some(process) = kernel.process() {
            process.terminate();
        }
        kernel.set_status(KernelStatus::Terminated);
        info!(kernel = %kernel_ref, %outcome, restarting, "kernel killed");
        self.publish(SessionEvent::KernelKilled { kernel: kernel_ref, outcome, restarting });
        Ok(outcome)
    }
}

#[cfg(any(test, feature = "test-mock"))]
impl KernelManager {
    /// Adopt a mock kernel directly, bypassing launch.
    pub fn insert_mock(&self, kernel: Arc<Kernel>) {
        self.kernels.insert(kernel.kernel_ref(), kernel);
    }
}

/// Run the cooperative half of shutdown on an open channel.
async fn shutdown_channel(channel: &Channel) -> ShutdownOutcome {
    let request = Message::shutdown_request(channel.session(), false);
    let mut replies = children_of(channel, request.header.msg_id.clone());
    if channel.send(ChannelKind::Control, request).is_err() {
        return ShutdownOutcome::Errored;
    }

    let acked = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(reply) = replies.next().await {
            if matches!(reply.content, MessageContent::ShutdownReply(_)) {
                return true;
            }
        }
        false
    })
    .await;

    match acked {
        Ok(true) => ShutdownOutcome::Acked,
        // Channel died before any ack arrived.
        Ok(false) => ShutdownOutcome::Errored,
        Err(_) => ShutdownOutcome::TimedOut,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_transitions_publish_watch() {
        let (kernel, _mock) = Kernel::mock(KernelStatus::Idle);
        let mut watch = kernel.watch_status();

        kernel.set_status(KernelStatus::Busy);
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), KernelStatus::Busy);
    }

    #[tokio::test]
    async fn test_terminated_is_final() {
        let (kernel, _mock) = Kernel::mock(KernelStatus::Idle);
        kernel.set_status(KernelStatus::Terminated);
        kernel.set_status(KernelStatus::Idle);
        assert_eq!(kernel.status(), KernelStatus::Terminated);
    }

    #[tokio::test]
    async fn test_dead_process_only_moves_to_teardown() {
        let (kernel, _mock) = Kernel::mock(KernelStatus::ProcessExited);

        kernel.set_status(KernelStatus::Busy);
        assert_eq!(kernel.status(), KernelStatus::ProcessExited);

        kernel.set_status(KernelStatus::ShuttingDown);
        assert_eq!(kernel.status(), KernelStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_monitor_marks_dead_process_exited() {
        let manager = KernelManager::new();
        let (kernel, mock) = Kernel::mock(KernelStatus::Busy);
        manager.insert_mock(Arc::clone(&kernel));
        manager.spawn_monitor(&kernel);
        let mut watch = kernel.watch_status();

        mock.exited(Some(9));

        tokio::time::timeout(Duration::from_secs(5), async {
            while *watch.borrow_and_update() != KernelStatus::ProcessExited {
                watch.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_ignores_exit_during_shutdown() {
        let manager = KernelManager::new();
        let (kernel, mock) = Kernel::mock(KernelStatus::ShuttingDown);
        manager.insert_mock(Arc::clone(&kernel));
        manager.spawn_monitor(&kernel);

        mock.exited(Some(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kernel.status(), KernelStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_acked_on_reply() {
        let (kernel, mut mock) = Kernel::mock(KernelStatus::Idle);
        let channel = kernel.channel().clone();

        let shutdown = tokio::spawn(async move { shutdown_channel(&channel).await });

        let (kind, request) = mock.sent().await.unwrap();
        assert_eq!(kind, ChannelKind::Control);
        assert_eq!(request.header.msg_type, "shutdown_request");

        let reply = Message::child_of(
            &request,
            MessageContent::ShutdownReply(suzuri_protocol::ShutdownReply { restart: false }),
        );
        mock.inject(ChannelKind::Control, reply);

        assert_eq!(shutdown.await.unwrap(), ShutdownOutcome::Acked);
    }

    #[tokio::test]
    async fn test_shutdown_errored_when_channel_already_closed() {
        let (kernel, _mock) = Kernel::mock(KernelStatus::Idle);
        kernel.channel().close();
        assert_eq!(shutdown_channel(kernel.channel()).await, ShutdownOutcome::Errored);
    }
}
