//! End-to-end tests against a fake compute server speaking the session
//! protocol over a real socket.
//!
//! The server interprets submitted code as a line-oriented script:
//! `stdout <text>`, `stderr <text>`, `result <text>`, `display <id> <text>`,
//! `update <id> <text>`, `clear`, `clear wait`, `page <text>`,
//! `sleep <ms>`, and `drop` (abrupt disconnect mid-execution). Configured
//! with or without shutdown acknowledgement to exercise both kill paths.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use suzuri_protocol::{
    ChannelKind, ClearOutputContent, DisplayDataContent, ExecuteInput, ExecuteReply,
    ExecutionState, InterruptMode, KernelInfoReply, KernelSpec, Message, MessageContent,
    PROTOCOL_VERSION, Payload, ReplyStatus, SessionOp, ShutdownReply, StatusContent,
    StreamContent, Transient, WireFrame,
};
use suzuri_session::{
    AlwaysClean, CellEventStream, CloseOutcome, DocumentGate, Kernel, KernelManager,
    LifecycleError, RemoteSessionTransport, close_document,
};
use suzuri_types::{
    CellEvent, CellId, CellStatus, DisplayLocation, DocumentId, KernelRef, KernelStatus,
    MimeBundle, Output, OutputHandling, RemoteSessionId, SessionEvent, ShutdownOutcome,
    StreamName, TransportKind,
};

// ============================================================================
// Fake compute server
// ============================================================================

async fn start_server(ack_shutdown: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_connection(stream, ack_shutdown));
        }
    });
    addr
}

async fn handle_connection(stream: TcpStream, ack_shutdown: bool) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Ok(Some(first)) = lines.next_line().await else { return };
    match SessionOp::decode(&first) {
        Ok(SessionOp::OpenSession { spec, .. }) if spec == "refused" => {
            send_op(&mut writer, &SessionOp::SessionRefused { reason: "no such spec".into() })
                .await;
            return;
        }
        Ok(SessionOp::OpenSession { .. }) => {
            send_op(
                &mut writer,
                &SessionOp::SessionOpened { session_id: RemoteSessionId::new() },
            )
            .await;
        }
        _ => return,
    }

    let mut execution_count = 0u32;
    while let Ok(Some(line)) = lines.next_line().await {
        if matches!(SessionOp::decode(&line), Ok(SessionOp::CloseSession)) {
            return;
        }
        let Ok((_, request)) = WireFrame::decode(&line).and_then(WireFrame::into_message) else {
            continue;
        };
        match request.content.clone() {
            MessageContent::KernelInfoRequest => {
                send(&mut writer, ChannelKind::IoPub, &status(&request, ExecutionState::Busy))
                    .await;
                let reply = MessageContent::KernelInfoReply(KernelInfoReply {
                    protocol_version: PROTOCOL_VERSION.into(),
                    implementation: "fake".into(),
                    banner: String::new(),
                });
                send(&mut writer, ChannelKind::Shell, &Message::child_of(&request, reply)).await;
                send(&mut writer, ChannelKind::IoPub, &status(&request, ExecutionState::Idle))
                    .await;
            }
            MessageContent::ExecuteRequest(exec) => {
                execution_count += 1;
                if !run_script(&mut writer, &request, &exec.code, execution_count).await {
                    // `drop` directive: vanish mid-execution.
                    return;
                }
            }
            MessageContent::ShutdownRequest(shutdown) => {
                if ack_shutdown {
                    let reply =
                        MessageContent::ShutdownReply(ShutdownReply { restart: shutdown.restart });
                    send(&mut writer, ChannelKind::Control, &Message::child_of(&request, reply))
                        .await;
                    return;
                }
                // Hung kernel: never acknowledge, never exit.
            }
            _ => {}
        }
    }
}

/// Interpret the mini-language. Returns false for `drop`.
async fn run_script(
    writer: &mut OwnedWriteHalf,
    request: &Message,
    code: &str,
    execution_count: u32,
) -> bool {
    send(writer, ChannelKind::IoPub, &status(request, ExecutionState::Busy)).await;
    let input = MessageContent::ExecuteInput(ExecuteInput {
        code: code.to_string(),
        execution_count,
    });
    send(writer, ChannelKind::IoPub, &Message::child_of(request, input)).await;

    let mut payloads = Vec::new();
    for line in code.lines() {
        let line = line.trim();
        let content = if let Some(text) = line.strip_prefix("stdout ") {
            MessageContent::Stream(StreamContent { name: StreamName::Stdout, text: text.into() })
        } else if let Some(text) = line.strip_prefix("stderr ") {
            MessageContent::Stream(StreamContent { name: StreamName::Stderr, text: text.into() })
        } else if let Some(text) = line.strip_prefix("result ") {
            MessageContent::ExecuteResult(suzuri_protocol::ExecuteResultContent {
                execution_count: Some(execution_count),
                data: text_bundle(text),
                metadata: MimeBundle::new(),
            })
        } else if let Some(rest) = line.strip_prefix("display ") {
            let (id, text) = rest.split_once(' ').unwrap();
            MessageContent::DisplayData(DisplayDataContent {
                data: text_bundle(text),
                metadata: MimeBundle::new(),
                transient: Transient { display_id: Some(id.into()) },
            })
        } else if let Some(rest) = line.strip_prefix("update ") {
            let (id, text) = rest.split_once(' ').unwrap();
            MessageContent::UpdateDisplayData(DisplayDataContent {
                data: text_bundle(text),
                metadata: MimeBundle::new(),
                transient: Transient { display_id: Some(id.into()) },
            })
        } else if line == "clear wait" {
            MessageContent::ClearOutput(ClearOutputContent { wait: true })
        } else if line == "clear" {
            MessageContent::ClearOutput(ClearOutputContent { wait: false })
        } else if let Some(text) = line.strip_prefix("page ") {
            payloads.push(Payload { source: "page".into(), data: text_bundle(text), start: None });
            continue;
        } else if let Some(ms) = line.strip_prefix("sleep ") {
            tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
            continue;
        } else if line == "drop" {
            return false;
        } else {
            continue;
        };
        send(writer, ChannelKind::IoPub, &Message::child_of(request, content)).await;
    }

    let reply = MessageContent::ExecuteReply(ExecuteReply {
        status: ReplyStatus::Ok,
        execution_count: Some(execution_count),
        payload: payloads,
    });
    send(writer, ChannelKind::Shell, &Message::child_of(request, reply)).await;
    send(writer, ChannelKind::IoPub, &status(request, ExecutionState::Idle)).await;
    true
}

fn status(request: &Message, state: ExecutionState) -> Message {
    Message::child_of(request, MessageContent::Status(StatusContent { execution_state: state }))
}

fn text_bundle(text: &str) -> MimeBundle {
    let mut data = MimeBundle::new();
    data.insert("text/plain".into(), serde_json::json!(text));
    data
}

async fn send(writer: &mut OwnedWriteHalf, channel: ChannelKind, message: &Message) {
    let line = WireFrame::new(channel, message).unwrap().encode().unwrap();
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
}

async fn send_op(writer: &mut OwnedWriteHalf, op: &SessionOp) {
    writer.write_all(op.encode().unwrap().as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
}

// ============================================================================
// Harness helpers
// ============================================================================

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn manager_with_server(ack_shutdown: bool) -> Arc<KernelManager> {
    init_tracing();
    let addr = start_server(ack_shutdown).await;
    let manager = KernelManager::new();
    manager.register_transport(Arc::new(RemoteSessionTransport::new(addr)));
    manager
}

fn fake_spec(name: &str) -> KernelSpec {
    KernelSpec {
        name: name.into(),
        display_name: "Fake".into(),
        language: "fake".into(),
        argv: Vec::new(),
        env: Default::default(),
        interrupt_mode: InterruptMode::Message,
    }
}

async fn launch(manager: &Arc<KernelManager>, document: DocumentId) -> Arc<Kernel> {
    manager
        .launch(
            fake_spec("fake"),
            std::env::temp_dir(),
            TransportKind::RemoteSession,
            document,
            KernelRef::new(),
        )
        .await
        .unwrap()
}

async fn collect(mut stream: CellEventStream) -> Vec<CellEvent> {
    let mut events = Vec::new();
    let drained = timeout(Duration::from_secs(10), async {
        while let Some(event) = stream.next().await {
            events.push(event);
        }
    })
    .await;
    drained.expect("execution stream never ended");
    events
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected session event never arrived")
}

async fn wait_status(kernel: &Kernel, expect: KernelStatus) {
    let mut watch = kernel.watch_status();
    timeout(Duration::from_secs(5), async {
        while *watch.borrow_and_update() != expect {
            watch.changed().await.unwrap();
        }
    })
    .await
    .expect("kernel never reached expected status");
}

// ============================================================================
// Launch
// ============================================================================

#[tokio::test]
async fn test_launch_reaches_idle() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;

    assert_eq!(kernel.status(), KernelStatus::Idle);
    assert!(kernel.remote_session().is_some());
    assert!(manager.kernel(kernel.kernel_ref()).is_some());
}

#[tokio::test]
async fn test_refused_session_fails_launch() {
    let manager = manager_with_server(true).await;
    let mut events = manager.subscribe();

    let err = manager
        .launch(
            fake_spec("refused"),
            std::env::temp_dir(),
            TransportKind::RemoteSession,
            DocumentId::new(),
            KernelRef::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Launch(suzuri_session::LaunchError::SessionRefused(_))
    ));
    wait_for(&mut events, |e| matches!(e, SessionEvent::KernelLaunchFailed { .. })).await;
}

#[tokio::test]
async fn test_launch_without_transport_fails() {
    let manager = KernelManager::new();
    let err = manager
        .launch(
            fake_spec("fake"),
            std::env::temp_dir(),
            TransportKind::RemoteSession,
            DocumentId::new(),
            KernelRef::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Launch(suzuri_session::LaunchError::NoTransport(
            TransportKind::RemoteSession
        ))
    ));
}

// ============================================================================
// Execute
// ============================================================================

#[tokio::test]
async fn test_execute_streams_coalesced_output() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;

    let stream = manager
        .execute(kernel.kernel_ref(), CellId::new(), "stdout a\nstdout b\nresult done")
        .unwrap();
    let events = collect(stream).await;

    assert_eq!(events.first(), Some(&CellEvent::Status(CellStatus::Queued)));
    assert_eq!(events.last(), Some(&CellEvent::Status(CellStatus::Idle)));
    assert!(events.contains(&CellEvent::ExecutionCount(1)));
    assert!(events.contains(&CellEvent::Output {
        index: 0,
        output: Output::stream(StreamName::Stdout, "a"),
    }));
    // Second fragment lands at the same index with merged text.
    assert!(events.contains(&CellEvent::Output {
        index: 0,
        output: Output::stream(StreamName::Stdout, "ab"),
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        CellEvent::Output { index: 1, output: Output::ExecuteResult { .. } }
    )));
}

#[tokio::test]
async fn test_clear_with_wait_defers_until_next_output() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;

    let stream = manager
        .execute(kernel.kernel_ref(), CellId::new(), "stdout one\nclear wait\nstdout two")
        .unwrap();
    let events = collect(stream).await;

    let cleared = events.iter().position(|e| *e == CellEvent::Cleared).unwrap();
    assert_eq!(
        events[cleared + 1],
        CellEvent::Output { index: 0, output: Output::stream(StreamName::Stdout, "two") }
    );
    // The clear arrived before "two" was emitted, not before "one".
    assert!(events[..cleared].contains(&CellEvent::Output {
        index: 0,
        output: Output::stream(StreamName::Stdout, "one"),
    }));
}

#[tokio::test]
async fn test_display_update_fans_out() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;
    let cell = CellId::new();

    let stream = manager
        .execute(kernel.kernel_ref(), cell, "display plot v1\nupdate plot v2")
        .unwrap();
    let events = collect(stream).await;

    let updated = events
        .iter()
        .find(|e| matches!(e, CellEvent::DisplayUpdated { .. }))
        .unwrap();
    match updated {
        CellEvent::DisplayUpdated { display_id, locations, data, .. } => {
            assert_eq!(display_id, "plot");
            assert_eq!(locations, &vec![DisplayLocation { cell, index: 0 }]);
            assert_eq!(data.get("text/plain"), Some(&serde_json::json!("v2")));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_page_payload_surfaces_separately() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;

    let stream = manager
        .execute(kernel.kernel_ref(), CellId::new(), "stdout out\npage help text")
        .unwrap();
    let events = collect(stream).await;

    assert!(events.contains(&CellEvent::Page(text_bundle("help text"))));
    // The page is not an output entry.
    assert!(!events.iter().any(|e| matches!(
        e,
        CellEvent::Output { index: 1, .. }
    )));
}

#[tokio::test]
async fn test_last_submission_wins() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;
    let cell = CellId::new();

    let first = manager
        .execute(kernel.kernel_ref(), cell, "sleep 200\nstdout first")
        .unwrap();
    let second = manager
        .execute(kernel.kernel_ref(), cell, "stdout second")
        .unwrap();

    let first_events = collect(first).await;
    let second_events = collect(second).await;

    // The superseded stream ended without a terminal event.
    assert!(!first_events.iter().any(CellEvent::is_terminal));
    assert_eq!(second_events.last(), Some(&CellEvent::Status(CellStatus::Idle)));
    assert!(second_events.contains(&CellEvent::Output {
        index: 0,
        output: Output::stream(StreamName::Stdout, "second"),
    }));
}

#[tokio::test]
async fn test_transport_drop_mid_execution() {
    let manager = manager_with_server(true).await;
    let kernel = launch(&manager, DocumentId::new()).await;

    let stream = manager
        .execute(kernel.kernel_ref(), CellId::new(), "stdout partial\ndrop")
        .unwrap();
    let events = collect(stream).await;

    assert!(events.contains(&CellEvent::Output {
        index: 0,
        output: Output::stream(StreamName::Stdout, "partial"),
    }));
    assert!(matches!(events.last(), Some(CellEvent::Failed(_))));

    wait_status(&kernel, KernelStatus::ProcessErrored).await;
    let err = manager
        .execute(kernel.kernel_ref(), CellId::new(), "stdout more")
        .unwrap_err();
    assert!(matches!(err, suzuri_session::ExecuteError::KernelNotConnected { .. }));
}

// ============================================================================
// Kill / restart
// ============================================================================

#[tokio::test]
async fn test_kill_acked_within_timeout() {
    let manager = manager_with_server(true).await;
    let mut events = manager.subscribe();
    let kernel = launch(&manager, DocumentId::new()).await;
    let kernel_ref = kernel.kernel_ref();

    let started = Instant::now();
    let outcome = manager.kill(kernel_ref, false).await.unwrap();

    assert_eq!(outcome, ShutdownOutcome::Acked);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(kernel.status(), KernelStatus::Terminated);
    assert!(manager.kernel(kernel_ref).is_none());
    let killed = wait_for(&mut events, |e| matches!(e, SessionEvent::KernelKilled { .. })).await;
    assert_eq!(
        killed,
        SessionEvent::KernelKilled {
            kernel: kernel_ref,
            outcome: ShutdownOutcome::Acked,
            restarting: false,
        }
    );
}

#[tokio::test]
async fn test_unacked_kill_times_out_but_still_terminates() {
    let manager = manager_with_server(false).await;
    let kernel = launch(&manager, DocumentId::new()).await;
    let kernel_ref = kernel.kernel_ref();

    let started = Instant::now();
    let outcome = manager.kill(kernel_ref, false).await.unwrap();

    assert_eq!(outcome, ShutdownOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(2));
    // Forced teardown ran regardless.
    assert_eq!(kernel.status(), KernelStatus::Terminated);
    assert!(manager.kernel(kernel_ref).is_none());
    assert!(kernel.channel().is_closed());
}

#[tokio::test]
async fn test_kill_unknown_kernel_errors() {
    let manager = manager_with_server(true).await;
    let err = manager.kill(KernelRef::new(), false).await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownKernel(_)));
}

#[tokio::test]
async fn test_restart_relaunches_under_same_ref() {
    let manager = manager_with_server(true).await;
    let mut events = manager.subscribe();
    let kernel = launch(&manager, DocumentId::new()).await;
    let kernel_ref = kernel.kernel_ref();

    let restarted = manager.restart(kernel_ref, OutputHandling::Clear).await.unwrap();

    assert_eq!(restarted.kernel_ref(), kernel_ref);
    assert_eq!(restarted.status(), KernelStatus::Idle);
    wait_for(
        &mut events,
        |e| matches!(e, SessionEvent::KernelKilled { restarting: true, .. }),
    )
    .await;
    wait_for(
        &mut events,
        |e| {
            matches!(
                e,
                SessionEvent::KernelRestarted { outputs: OutputHandling::Clear, .. }
            )
        },
    )
    .await;
}

// ============================================================================
// Document close
// ============================================================================

struct NeverDiscard;

#[async_trait]
impl DocumentGate for NeverDiscard {
    async fn is_dirty(&self, _document: DocumentId) -> bool {
        true
    }

    async fn confirm_discard(&self, _document: DocumentId) -> bool {
        false
    }
}

#[tokio::test]
async fn test_close_document_kills_all_its_kernels() {
    let manager = manager_with_server(true).await;
    let mut events = manager.subscribe();
    let document = DocumentId::new();
    let other = DocumentId::new();

    let first = launch(&manager, document).await;
    let second = launch(&manager, document).await;
    let unrelated = launch(&manager, other).await;

    let outcome = close_document(&manager, &AlwaysClean, document, false).await;
    let CloseOutcome::Ready { results, timed_out } = outcome else {
        panic!("close was cancelled");
    };
    assert!(!timed_out);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, outcome)| *outcome == ShutdownOutcome::Acked));

    assert!(manager.kernel(first.kernel_ref()).is_none());
    assert!(manager.kernel(second.kernel_ref()).is_none());
    // The other document's kernel is untouched.
    assert!(manager.kernel(unrelated.kernel_ref()).is_some());
    assert_eq!(unrelated.status(), KernelStatus::Idle);

    let ready = wait_for(
        &mut events,
        |e| matches!(e, SessionEvent::DocumentReadyToClose { .. }),
    )
    .await;
    assert_eq!(ready, SessionEvent::DocumentReadyToClose { document, reloading: false });
}

#[tokio::test]
async fn test_declined_discard_leaves_kernels_running() {
    let manager = manager_with_server(true).await;
    let document = DocumentId::new();
    let kernel = launch(&manager, document).await;

    let outcome = close_document(&manager, &NeverDiscard, document, false).await;

    assert_eq!(outcome, CloseOutcome::Cancelled);
    assert!(manager.kernel(kernel.kernel_ref()).is_some());
    assert_eq!(kernel.status(), KernelStatus::Idle);
}
