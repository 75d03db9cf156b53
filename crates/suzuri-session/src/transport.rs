//! Kernel transports: how messages reach a kernel and come back.
//!
//! Every transport produces the same [`Channel`] abstraction: an outbound
//! sender accepting `(ChannelKind, Message)` pairs and a broadcast of
//! [`TransportEvent`]s. The engine above never sees sockets or processes.
//!
//! Two transports exist. [`LocalProcessTransport`] spawns a kernel process,
//! hands it a connection file, and dials its shell/iopub/control sockets.
//! [`RemoteSessionTransport`] opens one multiplexed socket to a compute
//! server and performs the [`SessionOp`] handshake before frames flow.
//!
//! Outbound messages queue in an unbounded channel before the sockets are
//! up, so callers may send as soon as [`KernelTransport::open`] returns;
//! delivery happens once the connection completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use suzuri_protocol::{ChannelKind, ConnectionInfo, KernelSpec, Message, SessionOp, WireFrame};
use suzuri_types::{RemoteSessionId, TransportKind};

use crate::error::{LaunchError, LifecycleError, TransportError};

/// How long the local transport keeps dialing a freshly spawned kernel's
/// sockets before giving up and closing the channel.
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Channel
// ============================================================================

/// Something that happened on a kernel connection.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A message arrived from the kernel.
    Message(ChannelKind, Message),
    /// A line of kernel stdout/stderr (local transport only).
    Diagnostic(String),
    /// The kernel process exited (local transport only).
    Exited { code: Option<i32> },
    /// The channel is closed; no further events will follow.
    Closed,
}

/// Handle to a live kernel connection, transport-agnostic.
///
/// Cloneable; all clones share the same connection. Closing is idempotent
/// and publishes a single [`TransportEvent::Closed`] to subscribers.
#[derive(Clone, Debug)]
pub struct Channel {
    kind: TransportKind,
    session: String,
    outbound: mpsc::UnboundedSender<(ChannelKind, Message)>,
    events: broadcast::Sender<TransportEvent>,
    closer: Closer,
}

/// The transport-side ends of a [`Channel`].
pub(crate) struct ChannelParts {
    pub(crate) outbound_rx: mpsc::UnboundedReceiver<(ChannelKind, Message)>,
    pub(crate) events_tx: broadcast::Sender<TransportEvent>,
    pub(crate) closer: Closer,
}

/// The one close path shared by [`Channel`] clones and transport tasks:
/// cancel the token, publish [`TransportEvent::Closed`] exactly once.
#[derive(Clone, Debug)]
pub(crate) struct Closer {
    token: CancellationToken,
    events: broadcast::Sender<TransportEvent>,
    notified: Arc<AtomicBool>,
}

impl Closer {
    pub(crate) fn close(&self) {
        self.token.cancel();
        if !self.notified.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Channel {
    pub(crate) fn new(kind: TransportKind, session: &str) -> (Self, ChannelParts) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closer = Closer {
            token: CancellationToken::new(),
            events: events.clone(),
            notified: Arc::new(AtomicBool::new(false)),
        };

        let channel = Self {
            kind,
            session: session.to_string(),
            outbound,
            events: events.clone(),
            closer: closer.clone(),
        };
        let parts = ChannelParts { outbound_rx, events_tx: events, closer };
        (channel, parts)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Session identity stamped into message headers.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Queue a message for the kernel.
    pub fn send(&self, channel: ChannelKind, message: Message) -> Result<(), TransportError> {
        if self.closer.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send((channel, message))
            .map_err(|_| TransportError::Closed)
    }

    /// Subscribe to transport events. Each subscriber gets every event from
    /// the point of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Tear down the connection. Idempotent.
    pub fn close(&self) {
        self.closer.close();
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Result of opening a kernel connection.
#[derive(Debug)]
pub struct OpenedChannel {
    pub channel: Channel,
    /// Present for locally spawned kernels.
    pub process: Option<ProcessHandle>,
    /// Present for remote sessions.
    pub remote_session: Option<RemoteSessionId>,
}

/// Creates kernel connections of one [`TransportKind`].
#[async_trait]
pub trait KernelTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start (or attach to) a kernel and return its channel.
    async fn open(
        &self,
        spec: &KernelSpec,
        cwd: &Path,
        session: &str,
    ) -> Result<OpenedChannel, LaunchError>;
}

/// Control over a locally spawned kernel process.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver the platform interrupt signal to the kernel process.
    pub fn interrupt(&self) -> Result<(), LifecycleError> {
        #[cfg(unix)]
        {
            use rustix::process::{Pid, Signal, kill_process};
            let raw = self.pid.ok_or_else(|| {
                LifecycleError::UnsupportedOperation("kernel process has no pid".into())
            })?;
            let pid = Pid::from_raw(raw as i32).ok_or_else(|| {
                LifecycleError::UnsupportedOperation("kernel process has no pid".into())
            })?;
            kill_process(pid, Signal::Int)
                .map_err(|e| LifecycleError::Transport(TransportError::Io(e.into())))
        }
        #[cfg(not(unix))]
        {
            Err(LifecycleError::UnsupportedOperation(
                "signal interrupt is only supported on unix".into(),
            ))
        }
    }

    /// Kill the process. Idempotent; the supervisor publishes
    /// [`TransportEvent::Exited`] once the process is reaped.
    pub fn terminate(&self) {
        self.stop.cancel();
    }
}

// ============================================================================
// Local process transport
// ============================================================================

/// Spawns kernel processes and connects to them over localhost TCP.
pub struct LocalProcessTransport {
    ip: String,
    connection_dir: PathBuf,
}

impl LocalProcessTransport {
    pub fn new() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            connection_dir: std::env::temp_dir(),
        }
    }

    /// Write connection files under `dir` instead of the system temp dir.
    pub fn with_connection_dir(dir: impl Into<PathBuf>) -> Self {
        Self { ip: "127.0.0.1".to_string(), connection_dir: dir.into() }
    }
}

impl Default for LocalProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelTransport for LocalProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    async fn open(
        &self,
        spec: &KernelSpec,
        cwd: &Path,
        session: &str,
    ) -> Result<OpenedChannel, LaunchError> {
        if spec.argv.is_empty() {
            return Err(LaunchError::EmptyArgv);
        }

        let info = ConnectionInfo::ephemeral(&self.ip).await?;
        let conn_path = self
            .connection_dir
            .join(format!("suzuri-kernel-{}.json", uuid::Uuid::new_v4().as_simple()));
        info.write_to(&conn_path).await?;

        let argv = spec.resolved_argv(&conn_path);
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyArgv)?;
        let spawned = Command::new(program)
            .args(args)
            .envs(&spec.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let _ = tokio::fs::remove_file(&conn_path).await;
                return Err(LaunchError::Spawn { command: program.clone(), source });
            }
        };

        debug!(kernel = %spec.name, pid = ?child.id(), "spawned kernel process");

        let (channel, parts) = Channel::new(TransportKind::LocalProcess, session);

        if let Some(stdout) = child.stdout.take() {
            pump_stdio(stdout, parts.events_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_stdio(stderr, parts.events_tx.clone());
        }

        let process = ProcessHandle { pid: child.id(), stop: CancellationToken::new() };

        // Supervisor: reaps the child on natural exit or on terminate(),
        // then closes the channel and removes the connection file.
        let stop = process.stop.clone();
        let events = parts.events_tx.clone();
        let closer = parts.closer.clone();
        let cleanup_path = conn_path.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = stop.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "failed to kill kernel process");
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            let _ = events.send(TransportEvent::Exited { code });
            closer.close();
            let _ = tokio::fs::remove_file(&cleanup_path).await;
        });

        // Connector: dial the kernel's sockets (it re-binds the allocated
        // ports after reading the connection file), then route outbound
        // messages by channel tag.
        let closer = parts.closer.clone();
        let events = parts.events_tx.clone();
        let mut outbound_rx = parts.outbound_rx;
        tokio::spawn(async move {
            let mut writers: HashMap<ChannelKind, OwnedWriteHalf> = HashMap::new();
            for kind in [ChannelKind::Shell, ChannelKind::IoPub, ChannelKind::Control] {
                let addr = match info.addr(kind) {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(channel = %kind, error = %e, "bad kernel address");
                        closer.close();
                        return;
                    }
                };
                let Some(stream) = dial_with_retry(addr).await else {
                    warn!(channel = %kind, %addr, "kernel never started listening");
                    closer.close();
                    return;
                };
                let (read_half, write_half) = stream.into_split();
                writers.insert(kind, write_half);
                spawn_frame_reader(kind, read_half, events.clone());
            }
            debug!("kernel channels connected");

            loop {
                tokio::select! {
                    _ = closer.cancelled() => break,
                    item = outbound_rx.recv() => {
                        let Some((kind, message)) = item else { break };
                        let Some(writer) = writers.get_mut(&kind) else {
                            warn!(channel = %kind, "no socket for channel, dropping message");
                            continue;
                        };
                        match WireFrame::new(kind, &message).and_then(|f| f.encode()) {
                            Ok(line) => {
                                if let Err(e) = write_line(writer, &line).await {
                                    warn!(error = %e, "kernel socket write failed");
                                    closer.close();
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode outbound message"),
                        }
                    }
                }
            }
        });

        Ok(OpenedChannel { channel, process: Some(process), remote_session: None })
    }
}

fn pump_stdio<R>(reader: R, events: broadcast::Sender<TransportEvent>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = events.send(TransportEvent::Diagnostic(line));
        }
    });
}

async fn dial_with_retry(addr: SocketAddr) -> Option<TcpStream> {
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(stream),
            Err(_) => tokio::time::sleep(CONNECT_RETRY_DELAY).await,
        }
    }
    None
}

fn spawn_frame_reader<R>(expected: ChannelKind, reader: R, events: broadcast::Sender<TransportEvent>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, LinesCodec::new());
        while let Some(next) = frames.next().await {
            let line = match next {
                Ok(line) => line,
                Err(e) => {
                    warn!(channel = %expected, error = %e, "kernel socket read failed");
                    break;
                }
            };
            match WireFrame::decode(&line).and_then(WireFrame::into_message) {
                Ok((channel, message)) => {
                    let _ = events.send(TransportEvent::Message(channel, message));
                }
                Err(e) => warn!(channel = %expected, error = %e, "dropping malformed frame"),
            }
        }
        trace!(channel = %expected, "kernel socket reader finished");
    });
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

// ============================================================================
// Remote session transport
// ============================================================================

/// Connects to a compute server that hosts kernels on our behalf. One socket
/// carries all channels; frames are routed by their channel tag.
pub struct RemoteSessionTransport {
    addr: String,
}

impl RemoteSessionTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl KernelTransport for RemoteSessionTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteSession
    }

    async fn open(
        &self,
        spec: &KernelSpec,
        cwd: &Path,
        session: &str,
    ) -> Result<OpenedChannel, LaunchError> {
        let connect_err = |source| LaunchError::Connect { addr: self.addr.clone(), source };

        let stream = TcpStream::connect(&self.addr).await.map_err(connect_err)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        let open = SessionOp::OpenSession {
            spec: spec.name.clone(),
            cwd: cwd.to_string_lossy().into_owned(),
        };
        write_line(&mut write_half, &open.encode()?).await.map_err(connect_err)?;

        let reply = reader
            .next_line()
            .await
            .map_err(connect_err)?
            .ok_or(LaunchError::Handshake)?;
        let session_id = match SessionOp::decode(&reply)? {
            SessionOp::SessionOpened { session_id } => session_id,
            SessionOp::SessionRefused { reason } => return Err(LaunchError::SessionRefused(reason)),
            other => {
                return Err(LaunchError::SessionRefused(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
        };
        debug!(%session_id, kernel = %spec.name, "remote session opened");

        let (channel, parts) = Channel::new(TransportKind::RemoteSession, session);

        // Reader: a dropped socket closes the channel, which the lifecycle
        // layer treats as a transport error.
        let events = parts.events_tx.clone();
        let closer = parts.closer.clone();
        tokio::spawn(async move {
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        match WireFrame::decode(&line).and_then(WireFrame::into_message) {
                            Ok((channel, message)) => {
                                let _ = events.send(TransportEvent::Message(channel, message));
                            }
                            Err(e) => warn!(error = %e, "dropping malformed frame"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "session socket read failed");
                        break;
                    }
                }
            }
            closer.close();
        });

        // Writer: on close, tell the server to release the session. Best
        // effort; the server also reaps on disconnect.
        let closer = parts.closer.clone();
        let mut outbound_rx = parts.outbound_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closer.cancelled() => {
                        if let Ok(line) = SessionOp::CloseSession.encode() {
                            let _ = write_line(&mut write_half, &line).await;
                        }
                        break;
                    }
                    item = outbound_rx.recv() => {
                        let Some((kind, message)) = item else { break };
                        match WireFrame::new(kind, &message).and_then(|f| f.encode()) {
                            Ok(line) => {
                                if let Err(e) = write_line(&mut write_half, &line).await {
                                    warn!(error = %e, "session socket write failed");
                                    closer.close();
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode outbound message"),
                        }
                    }
                }
            }
        });

        Ok(OpenedChannel {
            channel,
            process: None,
            remote_session: Some(session_id),
        })
    }
}

// ============================================================================
// Mock
// ============================================================================

#[cfg(any(test, feature = "test-mock"))]
pub mod mock {
    use super::*;

    /// A [`Channel`] with both ends exposed: tests inject transport events
    /// and observe what the engine sent.
    pub struct MockChannel {
        pub channel: Channel,
        outbound_rx: mpsc::UnboundedReceiver<(ChannelKind, Message)>,
        events_tx: broadcast::Sender<TransportEvent>,
    }

    impl MockChannel {
        pub fn new(session: &str) -> Self {
            let (channel, parts) = Channel::new(TransportKind::LocalProcess, session);
            Self { channel, outbound_rx: parts.outbound_rx, events_tx: parts.events_tx }
        }

        /// Deliver a message as if the kernel sent it.
        pub fn inject(&self, channel: ChannelKind, message: Message) {
            let _ = self.events_tx.send(TransportEvent::Message(channel, message));
        }

        pub fn diagnostic(&self, line: &str) {
            let _ = self.events_tx.send(TransportEvent::Diagnostic(line.to_string()));
        }

        pub fn exited(&self, code: Option<i32>) {
            let _ = self.events_tx.send(TransportEvent::Exited { code });
        }

        /// Next message the engine queued for the kernel.
        pub async fn sent(&mut self) -> Option<(ChannelKind, Message)> {
            self.outbound_rx.recv().await
        }

        pub fn try_sent(&mut self) -> Option<(ChannelKind, Message)> {
            self.outbound_rx.try_recv().ok()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockChannel;
    use super::*;
    use suzuri_protocol::InterruptMode;

    fn local_spec(argv: Vec<String>) -> KernelSpec {
        KernelSpec {
            name: "fake".into(),
            display_name: "Fake".into(),
            language: "fake".into(),
            argv,
            env: HashMap::new(),
            interrupt_mode: InterruptMode::Signal,
        }
    }

    #[tokio::test]
    async fn test_local_open_rejects_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalProcessTransport::with_connection_dir(dir.path());

        let err = transport
            .open(&local_spec(Vec::new()), dir.path(), "sess")
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::EmptyArgv));
    }

    #[tokio::test]
    async fn test_local_open_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalProcessTransport::with_connection_dir(dir.path());
        let argv = vec![
            "suzuri-no-such-kernel".to_string(),
            "{connection_file}".to_string(),
        ];

        let err = transport
            .open(&local_spec(argv), dir.path(), "sess")
            .await
            .unwrap_err();
        match err {
            LaunchError::Spawn { command, .. } => assert_eq!(command, "suzuri-no-such-kernel"),
            other => panic!("expected spawn error, got {other}"),
        }
        // The connection file written before the failed spawn is cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mock = MockChannel::new("sess");
        mock.channel.close();

        let err = mock
            .channel
            .send(ChannelKind::Shell, Message::kernel_info_request("sess"))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_publishes_closed_once() {
        let mock = MockChannel::new("sess");
        let mut rx = mock.channel.subscribe();

        mock.channel.close();
        mock.channel.close();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed));
        // No second Closed; the queue is empty again.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_mock_inject_and_sent() {
        let mut mock = MockChannel::new("sess");
        let mut rx = mock.channel.subscribe();

        mock.inject(ChannelKind::IoPub, Message::kernel_info_request("sess"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Message(ChannelKind::IoPub, _)));

        mock.channel
            .send(ChannelKind::Shell, Message::execute_request("sess", "1 + 1"))
            .unwrap();
        let (kind, msg) = mock.sent().await.unwrap();
        assert_eq!(kind, ChannelKind::Shell);
        assert_eq!(msg.header.msg_type, "execute_request");
    }
}
