//! Stream multiplexer
//!
//! [`MuxSession`] runs a yamux connection over any duplex byte stream
//! ([`AsyncIo`]) and carries independent, flow-controlled [`Stream`]s. The
//! same session type serves a raw transport connection and a relay circuit:
//! a circuit is simply a session whose transport is itself a [`Stream`] on
//! the relay connection.
//!
//! yamux gives every stream its own receive window, so a reader that stops
//! draining one stream only ever stalls the writer of that stream. Each
//! stream opens with a short header naming its protocol (see
//! [`crate::protocol`]); a bad header resets that stream alone.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use indras_core::AsyncIo;

use crate::error::{MuxError, StreamError};
use crate::protocol::{MAX_PROTOCOL_LEN, read_hint, write_hint};

/// Configuration for a multiplexed session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Maximum concurrently open streams, both directions combined
    pub max_streams: usize,
    /// Largest data frame written, in bytes
    pub max_frame_size: usize,
    /// Inbound streams queued before the application accepts them
    pub accept_backlog: usize,
    /// How long an inbound stream may take to name its protocol
    pub hint_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 256,
            max_frame_size: 16 * 1024,
            accept_backlog: 64,
            hint_timeout_ms: 10_000,
        }
    }
}

impl MuxConfig {
    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn hint_timeout(&self) -> Duration {
        Duration::from_millis(self.hint_timeout_ms)
    }

    fn yamux(&self) -> yamux::Config {
        let mut config = yamux::Config::default();
        // Our own slot count enforces the ceiling; yamux's limit only backs it
        // up, with headroom for streams it has not yet garbage collected.
        config.set_max_num_streams(self.max_streams.saturating_mul(2).max(1));
        config.set_split_send_size(self.max_frame_size.max(1));
        config
    }
}

/// Which end of the underlying byte stream this session is
///
/// Dialers allocate odd stream ids, listeners even ones, so both sides can
/// open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

impl Role {
    fn mode(self) -> yamux::Mode {
        match self {
            Role::Dialer => yamux::Mode::Client,
            Role::Listener => yamux::Mode::Server,
        }
    }
}

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub open_streams: usize,
    /// Streams opened over the session's lifetime, both directions
    pub streams_opened: u64,
}

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

enum Command {
    Open(OpenReply),
    Close,
}

/// How the driver loop ended
enum Ending {
    Local,
    Remote,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    commands: mpsc::UnboundedSender<Command>,
    accept_tx: mpsc::Sender<Stream>,
    open_streams: AtomicUsize,
    streams_opened: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    going_away: AtomicBool,
    remote_going_away: AtomicBool,
    closed: CancellationToken,
    created: Instant,
    last_active_ms: AtomicU64,
}

impl Shared {
    fn touch(&self) {
        self.last_active_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
            || self.going_away.load(Ordering::SeqCst)
            || self.remote_going_away.load(Ordering::SeqCst)
    }

    fn stream(
        self: &Arc<Self>,
        io: Compat<yamux::Stream>,
        id: u32,
        protocol: String,
        slot: Slot,
    ) -> Stream {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Stream {
            io: Some(io),
            id,
            protocol,
            write_closed: false,
            slot,
        }
    }

    /// Take a yamux stream the remote opened
    ///
    /// Refusing drops it, which resets just that stream.
    fn on_inbound(self: &Arc<Self>, raw: yamux::Stream) {
        let id = raw.id().val();
        if self.going_away.load(Ordering::SeqCst) {
            debug!(stream_id = id, "Refusing inbound stream, session going away");
            return;
        }
        let Some(slot) = Slot::reserve(self) else {
            debug!(stream_id = id, "Refusing inbound stream over the stream limit");
            return;
        };

        let shared = self.clone();
        tokio::spawn(async move {
            match shared.read_inbound(raw, slot).await {
                Ok(stream) => {
                    trace!(stream_id = id, protocol = stream.protocol(), "Inbound stream");
                    if shared.accept_tx.try_send(stream).is_err() {
                        warn!(stream_id = id, "Accept backlog full, resetting stream");
                    }
                }
                Err(e) => debug!(stream_id = id, error = %e, "Resetting inbound stream"),
            }
        });
    }

    async fn read_inbound(
        self: &Arc<Self>,
        raw: yamux::Stream,
        slot: Slot,
    ) -> Result<Stream, MuxError> {
        let id = raw.id().val();
        let mut io = FuturesAsyncReadCompatExt::compat(raw);
        let protocol = tokio::time::timeout(self.config.hint_timeout(), read_hint(&mut io))
            .await
            .map_err(|_| MuxError::HintTimeout)??;
        Ok(self.stream(io, id, protocol, slot))
    }

    fn shutdown(&self) {
        if !self.going_away.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close);
        }
        self.closed.cancel();
    }
}

/// Drive the yamux connection until either side closes it
async fn drive<T: AsyncIo>(
    shared: Arc<Shared>,
    io: T,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut conn = yamux::Connection::new(
        TokioAsyncReadCompatExt::compat(io),
        shared.config.yamux(),
        shared.role.mode(),
    );
    let mut opening: VecDeque<OpenReply> = VecDeque::new();
    let mut closing = false;

    let outcome = poll_fn(|cx| {
        while !closing {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => opening.push_back(reply),
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => closing = true,
                Poll::Pending => break,
            }
        }
        if closing {
            return conn.poll_close(cx).map(|res| res.map(|()| Ending::Local));
        }

        while !opening.is_empty() {
            let Poll::Ready(opened) = conn.poll_new_outbound(cx) else {
                break;
            };
            if let Some(reply) = opening.pop_front() {
                let _ = reply.send(opened);
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => shared.on_inbound(stream),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(Ending::Remote)),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    match outcome {
        Ok(Ending::Local) => trace!("Session closed locally"),
        Ok(Ending::Remote) => {
            debug!("Remote closed the session");
            shared.remote_going_away.store(true, Ordering::SeqCst);
        }
        Err(e) => debug!(error = %MuxError::from(e), "Session failed"),
    }
    shared.closed.cancel();
}

struct SessionHandle {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// A multiplexed session over one duplex byte stream
///
/// Cloning yields another handle to the same session. The session shuts
/// down when [`MuxSession::close`] is called, when the transport fails, or
/// when the last handle is dropped.
#[derive(Clone)]
pub struct MuxSession {
    inner: Arc<SessionHandle>,
}

impl MuxSession {
    /// Start a session over `io`. Must be called within a tokio runtime.
    pub fn new<T: AsyncIo>(io: T, role: Role, config: MuxConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            commands,
            accept_tx,
            open_streams: AtomicUsize::new(0),
            streams_opened: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            going_away: AtomicBool::new(false),
            remote_going_away: AtomicBool::new(false),
            closed: CancellationToken::new(),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            config,
        });

        tokio::spawn(drive(shared.clone(), io, command_rx));

        Self {
            inner: Arc::new(SessionHandle {
                shared,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.shared.role
    }

    /// Open a new outbound stream tagged with a protocol hint
    ///
    /// Fails fast when the hint is too long, the session is closing, or the
    /// session is at its stream ceiling. Other streams are never affected.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, StreamError> {
        if protocol.len() > MAX_PROTOCOL_LEN {
            return Err(StreamError::ProtocolTooLong {
                len: protocol.len(),
                max: MAX_PROTOCOL_LEN,
            });
        }
        let (mut io, id, slot) = self.open_raw().await?;
        if let Err(e) = write_hint(&mut io, protocol).await {
            debug!(stream_id = id, error = %e, "Failed to send protocol hint");
            return Err(StreamError::ConnectionClosing);
        }
        trace!(stream_id = id, protocol, "Opened stream");
        Ok(self.inner.shared.stream(io, id, protocol.to_string(), slot))
    }

    /// Open a yamux stream without writing its header
    async fn open_raw(&self) -> Result<(Compat<yamux::Stream>, u32, Slot), StreamError> {
        let shared = &self.inner.shared;
        if shared.is_closing() {
            return Err(StreamError::ConnectionClosing);
        }
        let slot = Slot::reserve(shared).ok_or(StreamError::StreamLimit {
            max: shared.config.max_streams,
        })?;

        let (reply, opened) = oneshot::channel();
        shared
            .commands
            .send(Command::Open(reply))
            .map_err(|_| StreamError::ConnectionClosing)?;
        match opened.await {
            Ok(Ok(raw)) => {
                let id = raw.id().val();
                Ok((FuturesAsyncReadCompatExt::compat(raw), id, slot))
            }
            Ok(Err(e)) => {
                debug!(error = %e, "yamux refused a new stream");
                Err(StreamError::ConnectionClosing)
            }
            Err(_) => Err(StreamError::ConnectionClosing),
        }
    }

    /// Wait for the next inbound stream
    ///
    /// Returns `None` once the session has closed.
    pub async fn accept(&self) -> Option<Stream> {
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream,
            _ = self.inner.shared.closed.cancelled() => None,
        }
    }

    /// Close the yamux connection and with it every stream
    pub fn close(&self) {
        self.inner.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.is_cancelled()
    }

    /// Resolves once the session has closed
    pub async fn closed(&self) {
        self.inner.shared.closed.cancelled().await
    }

    /// Whether the remote ended the session cleanly
    pub fn remote_went_away(&self) -> bool {
        self.inner.shared.remote_going_away.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MuxStats {
        let shared = &self.inner.shared;
        MuxStats {
            bytes_sent: shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: shared.bytes_received.load(Ordering::Relaxed),
            open_streams: shared.open_streams.load(Ordering::SeqCst),
            streams_opened: shared.streams_opened.load(Ordering::Relaxed),
        }
    }

    /// Time since the last stream open or payload in either direction
    pub fn idle_for(&self) -> Duration {
        let shared = &self.inner.shared;
        let last = Duration::from_millis(shared.last_active_ms.load(Ordering::Relaxed));
        shared.created.elapsed().saturating_sub(last)
    }

    /// Whether two handles refer to the same session
    pub fn ptr_eq(&self, other: &MuxSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("role", &self.inner.shared.role)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

/// One counted place under the session's stream ceiling
struct Slot(Arc<Shared>);

impl Slot {
    fn reserve(shared: &Arc<Shared>) -> Option<Slot> {
        let max = shared.config.max_streams;
        shared
            .open_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Slot(shared.clone()))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One logical channel within a [`MuxSession`]
///
/// Dropping a stream half-closes it; [`Stream::reset`] aborts it.
pub struct Stream {
    io: Option<Compat<yamux::Stream>>,
    id: u32,
    protocol: String,
    write_closed: bool,
    slot: Slot,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Protocol hint the stream was opened with
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Abort the stream in both directions
    pub fn reset(mut self) {
        // yamux resets a stream dropped before it was closed
        drop(self.io.take());
    }

    fn session(&self) -> &Shared {
        &self.slot.0
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn broken_pipe(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg)
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                StreamError::Reset,
            )));
        };
        let before = buf.filled().len();
        let polled = match Pin::new(io).poll_read(cx, buf) {
            // Nothing more will arrive once the session is gone
            Poll::Pending if this.slot.0.closed.is_cancelled() => Poll::Ready(Ok(())),
            polled => polled,
        };
        let n = buf.filled().len() - before;
        if n > 0 {
            this.session()
                .bytes_received
                .fetch_add(n as u64, Ordering::Relaxed);
            this.session().touch();
        }
        polled
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.session().closed.is_cancelled() {
            return Poll::Ready(Err(broken_pipe("session closed")));
        }
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(broken_pipe("stream reset")));
        };
        let polled = Pin::new(io).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            this.session()
                .bytes_sent
                .fetch_add(*n as u64, Ordering::Relaxed);
            this.session().touch();
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let polled = Pin::new(io).poll_shutdown(cx);
        if polled.is_ready() {
            this.write_closed = true;
        }
        polled
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some(mut io) = self.io.take() else {
            return;
        };
        if self.write_closed {
            return;
        }
        // Close in order behind any data still queued, rather than resetting
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = io.shutdown().await;
            });
        }
    }
}
