//! The execution engine: submit code, get back a projected event stream.
//!
//! One submission becomes one `execute_request` on the shell channel and one
//! [`CellEventStream`]. A projector task correlates the kernel's replies by
//! parent id and folds them into cell-level events: status transitions,
//! coalesced outputs with stable indices, deferred clears, display updates,
//! paging payloads, and comm traffic.
//!
//! Resubmitting a cell cancels the previous in-flight execution for that
//! cell. The superseded stream ends silently; only the newest submission
//! speaks for the cell.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use suzuri_protocol::{ChannelKind, ExecutionState, Message, MessageContent};
use suzuri_types::{
    CellEvent, CellId, CellStatus, CommEvent, DisplayLocation, KernelRef, Output, push_coalesced,
};

use crate::correlator::correlated_events;
use crate::display::DisplayRegistry;
use crate::error::ExecuteError;
use crate::lifecycle::Kernel;
use crate::transport::TransportEvent;

/// The per-execution event stream handed back by [`ExecutionEngine::execute`].
///
/// Yields [`CellEvent`]s until a terminal event, then ends. If the execution
/// is superseded by a resubmission, the stream ends without a terminal event.
#[derive(Debug)]
pub struct CellEventStream {
    rx: mpsc::UnboundedReceiver<CellEvent>,
}

impl Stream for CellEventStream {
    type Item = CellEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CellEvent>> {
        self.rx.poll_recv(cx)
    }
}

struct Inflight {
    kernel: KernelRef,
    token: CancellationToken,
    seq: u64,
}

/// Tracks in-flight executions and projects kernel replies into cell events.
pub struct ExecutionEngine {
    displays: Arc<DisplayRegistry>,
    inflight: DashMap<CellId, Inflight>,
    seq: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(displays: Arc<DisplayRegistry>) -> Self {
        Self { displays, inflight: DashMap::new(), seq: AtomicU64::new(0) }
    }

    pub fn displays(&self) -> &Arc<DisplayRegistry> {
        &self.displays
    }

    /// Submit `code` for `cell` on `kernel`.
    ///
    /// Fails fast if the kernel cannot accept work; nothing reaches the wire
    /// in that case. On success the previous in-flight execution for the
    /// same cell (if any) is cancelled.
    pub fn execute(
        self: &Arc<Self>,
        kernel: &Kernel,
        cell: CellId,
        code: &str,
    ) -> Result<CellEventStream, ExecuteError> {
        let status = kernel.status();
        if !status.can_execute() {
            return Err(ExecuteError::KernelNotConnected { status });
        }

        let channel = kernel.channel().clone();
        let request = Message::execute_request(channel.session(), code);
        let request_id = request.header.msg_id.clone();

        // Subscribe before sending so no child can slip past the projector.
        let events = correlated_events(&channel, request_id.clone());
        channel.send(ChannelKind::Shell, request)?;

        debug!(%cell, kernel = %kernel.kernel_ref(), request = %request_id, "execution submitted");

        let token = CancellationToken::new();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.displays.forget_cell(cell);
        let entry = Inflight { kernel: kernel.kernel_ref(), token: token.clone(), seq };
        if let Some(previous) = self.inflight.insert(cell, entry) {
            previous.token.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.project(cell, events, token, tx).await;
            engine.inflight.remove_if(&cell, |_, entry| entry.seq == seq);
        });

        Ok(CellEventStream { rx })
    }

    /// Cancel the in-flight execution for `cell`, if any. The stream ends
    /// without a terminal event.
    pub fn cancel_cell(&self, cell: CellId) {
        if let Some((_, entry)) = self.inflight.remove(&cell) {
            entry.token.cancel();
        }
    }

    /// Cancel every in-flight execution owned by `kernel`.
    pub fn cancel_kernel(&self, kernel: KernelRef) {
        self.inflight.retain(|_, entry| {
            if entry.kernel == kernel {
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    // ========================================================================
    // Projection
    // ========================================================================

    async fn project(
        &self,
        cell: CellId,
        mut events: impl Stream<Item = TransportEvent> + Send + Unpin,
        cancelled: CancellationToken,
        tx: mpsc::UnboundedSender<CellEvent>,
    ) {
        let mut outputs: Vec<Output> = Vec::new();
        let mut pending_clear = false;
        let mut saw_reply = false;
        let mut saw_idle = false;

        let _ = tx.send(CellEvent::Status(CellStatus::Queued));

        loop {
            let event = tokio::select! {
                // Biased so a superseded execution stops before it can emit
                // another event, even if replies are already queued.
                biased;
                _ = cancelled.cancelled() => return,
                event = events.next() => event,
            };

            let message = match event {
                Some(TransportEvent::Message(_, msg)) => msg,
                Some(TransportEvent::Exited { code }) => {
                    let _ = tx.send(CellEvent::Failed(match code {
                        Some(code) => format!("kernel process exited with code {code}"),
                        None => "kernel process exited".to_string(),
                    }));
                    return;
                }
                Some(TransportEvent::Closed) | None => {
                    let _ = tx.send(CellEvent::Failed("kernel connection closed".to_string()));
                    return;
                }
                Some(TransportEvent::Diagnostic(_)) => continue,
            };

            match message.content {
                MessageContent::Status(status) => match status.execution_state {
                    ExecutionState::Busy => {
                        let _ = tx.send(CellEvent::Status(CellStatus::Busy));
                    }
                    ExecutionState::Idle => {
                        saw_idle = true;
                        // Terminal only once both the iopub idle and the
                        // shell reply have arrived, in either order.
                        if saw_reply {
                            let _ = tx.send(CellEvent::Status(CellStatus::Idle));
                            return;
                        }
                    }
                    ExecutionState::Starting => {}
                },
                MessageContent::ExecuteInput(input) => {
                    let _ = tx.send(CellEvent::ExecutionCount(input.execution_count));
                }
                MessageContent::Stream(stream) => {
                    let output = Output::stream(stream.name, stream.text);
                    self.append(cell, &mut outputs, &mut pending_clear, output, &tx);
                }
                MessageContent::ExecuteResult(result) => {
                    let output = Output::ExecuteResult {
                        data: result.data,
                        metadata: result.metadata,
                        execution_count: result.execution_count,
                    };
                    self.append(cell, &mut outputs, &mut pending_clear, output, &tx);
                }
                MessageContent::DisplayData(display) => {
                    let output = Output::DisplayData {
                        data: display.data,
                        metadata: display.metadata,
                        display_id: display.transient.display_id,
                    };
                    self.append(cell, &mut outputs, &mut pending_clear, output, &tx);
                }
                MessageContent::Error(error) => {
                    let output = Output::Error {
                        ename: error.ename,
                        evalue: error.evalue,
                        traceback: error.traceback,
                    };
                    self.append(cell, &mut outputs, &mut pending_clear, output, &tx);
                }
                MessageContent::UpdateDisplayData(update) => {
                    let Some(display_id) = update.transient.display_id else {
                        debug!(%cell, "update_display_data without display_id ignored");
                        continue;
                    };
                    match self.displays.targets(&display_id) {
                        Some(locations) => {
                            let _ = tx.send(CellEvent::DisplayUpdated {
                                display_id,
                                locations,
                                data: update.data,
                                metadata: update.metadata,
                            });
                        }
                        // Update for an id never rendered: drop it.
                        None => debug!(%cell, %display_id, "update for unseen display id"),
                    }
                }
                MessageContent::ClearOutput(clear) => {
                    if clear.wait {
                        pending_clear = true;
                    } else {
                        outputs.clear();
                        pending_clear = false;
                        self.displays.forget_cell(cell);
                        let _ = tx.send(CellEvent::Cleared);
                    }
                }
                MessageContent::ExecuteReply(reply) => {
                    saw_reply = true;
                    for payload in reply.payload {
                        if payload.source == "page" {
                            let _ = tx.send(CellEvent::Page(payload.data));
                        }
                    }
                    if saw_idle {
                        let _ = tx.send(CellEvent::Status(CellStatus::Idle));
                        return;
                    }
                }
                MessageContent::CommOpen(comm) => {
                    let _ = tx.send(CellEvent::Comm(CommEvent::Open {
                        comm_id: comm.comm_id,
                        target_name: comm.target_name,
                        data: comm.data,
                    }));
                }
                MessageContent::CommMsg(comm) => {
                    let _ = tx.send(CellEvent::Comm(CommEvent::Msg {
                        comm_id: comm.comm_id,
                        data: comm.data,
                    }));
                }
                MessageContent::CommClose(comm) => {
                    let _ = tx.send(CellEvent::Comm(CommEvent::Close {
                        comm_id: comm.comm_id,
                        data: comm.data,
                    }));
                }
                MessageContent::Ignored { msg_type } => {
                    trace!(%cell, %msg_type, "ignoring unrecognized reply");
                }
                other => {
                    trace!(%cell, msg_type = other.msg_type(), "ignoring reply");
                }
            }
        }
    }

    /// Apply any deferred clear, append with coalescing, record display
    /// locations, and emit the output event.
    fn append(
        &self,
        cell: CellId,
        outputs: &mut Vec<Output>,
        pending_clear: &mut bool,
        output: Output,
        tx: &mpsc::UnboundedSender<CellEvent>,
    ) {
        if *pending_clear {
            *pending_clear = false;
            outputs.clear();
            self.displays.forget_cell(cell);
            let _ = tx.send(CellEvent::Cleared);
        }

        let display_id = output.display_id().map(str::to_string);
        let index = push_coalesced(outputs, output);
        if let Some(display_id) = display_id {
            self.displays.record(&display_id, DisplayLocation { cell, index });
        }
        let _ = tx.send(CellEvent::Output { index, output: outputs[index].clone() });
    }
}

// ============================================================================
// Tests
// ============================================================================
