//! Single-threaded non-blocking socket reactor.
//!
//! One OS thread owns every listener, stream, in-flight connect and
//! per-connection buffer. Other threads talk to it only through two queues:
//! commands go in (each enqueue wakes the selector), events come out and are
//! dispatched by [`Reactor::handle_messages`] on the caller's own thread.
//!
//! Each loop iteration:
//! 1. block until something is ready (a queued command or socket readiness),
//! 2. execute every queued command in FIFO order,
//! 3. service the ready sockets (accept, connect completion, read, write).
//!
//! Streams are framed with [`crate::framing`]; a message is emitted only once
//! its full body has been buffered.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    task::{Context, Poll},
    thread::JoinHandle,
};

use anyhow::Context as _;
use bytes::{Buf, BytesMut};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, trace, warn};

use crate::{framing, packet::Packet};

/// Reads performed per readiness signal before yielding to other sockets.
const MAX_READS_PER_WAKE: usize = 16;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies one connection. Unique across every reactor in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(pub u64);

impl ConnectionKey {
    pub fn new_unique() -> Self {
        ConnectionKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies one listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey(pub u64);

impl ListenerKey {
    pub fn new_unique() -> Self {
        ListenerKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Reactor tuning.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Interface listeners bind to.
    pub bind_host: String,
    /// Largest accepted inbound message, in bytes.
    pub max_frame_len: usize,
    /// Read buffer growth per read call.
    pub read_chunk: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            max_frame_len: 1024 * 1024,
            read_chunk: 8 * 1024,
        }
    }
}

/// Commands sent to the reactor thread.
#[derive(Debug)]
pub enum Command {
    Connect { key: ConnectionKey, addr: String },
    Disconnect { key: ConnectionKey },
    StartListen { key: ListenerKey, port: u16 },
    StopListen { key: ListenerKey },
    Send { key: ConnectionKey, packet: Packet },
    Cancel,
}

/// Events emitted by the reactor thread.
#[derive(Debug)]
pub enum Event {
    Accept {
        listener: ListenerKey,
        key: ConnectionKey,
        peer: SocketAddr,
    },
    Connect {
        key: ConnectionKey,
        peer: SocketAddr,
    },
    AcceptFail {
        listener: ListenerKey,
        cause: io::Error,
    },
    ListenFail {
        listener: ListenerKey,
        cause: io::Error,
    },
    ConnectFail {
        key: ConnectionKey,
        cause: io::Error,
    },
    Listening {
        listener: ListenerKey,
        local_addr: SocketAddr,
    },
    Message {
        key: ConnectionKey,
        packet: Packet,
    },
    /// Inbound bytes could not be framed; the connection is torn down next.
    ReadFail {
        key: ConnectionKey,
        cause: io::Error,
    },
    Close {
        key: ConnectionKey,
        remote: bool,
    },
}

/// Receives reactor events on the draining thread.
pub trait ReactorListener {
    fn on_accept(&mut self, listener: ListenerKey, key: ConnectionKey, peer: SocketAddr);
    fn on_listen_fail(&mut self, listener: ListenerKey, cause: io::Error);
    fn on_connect(&mut self, key: ConnectionKey, peer: SocketAddr);
    fn on_accept_fail(&mut self, listener: ListenerKey, cause: io::Error);
    fn on_connect_fail(&mut self, key: ConnectionKey, cause: io::Error);
    fn on_message(&mut self, key: ConnectionKey, packet: Packet);
    fn on_close(&mut self, key: ConnectionKey, remote: bool);

    fn on_listening(&mut self, _listener: ListenerKey, _local_addr: SocketAddr) {}

    fn on_read_fail(&mut self, _key: ConnectionKey, _cause: io::Error) {}
}

impl Event {
    /// Invokes the matching listener callback.
    pub fn dispatch(self, listener: &mut dyn ReactorListener) {
        match self {
            Event::Accept {
                listener: l,
                key,
                peer,
            } => listener.on_accept(l, key, peer),
            Event::Connect { key, peer } => listener.on_connect(key, peer),
            Event::AcceptFail { listener: l, cause } => listener.on_accept_fail(l, cause),
            Event::ListenFail { listener: l, cause } => listener.on_listen_fail(l, cause),
            Event::ConnectFail { key, cause } => listener.on_connect_fail(key, cause),
            Event::Listening {
                listener: l,
                local_addr,
            } => listener.on_listening(l, local_addr),
            Event::Message { key, packet } => listener.on_message(key, packet),
            Event::ReadFail { key, cause } => listener.on_read_fail(key, cause),
            Event::Close { key, remote } => listener.on_close(key, remote),
        }
    }
}

/// Handle to a reactor thread. All methods are callable from any thread and
/// return without waiting for the reactor.
pub struct Reactor {
    commands: mpsc::UnboundedSender<Command>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Starts the reactor thread.
    pub fn spawn(config: ReactorConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .context("build reactor runtime")?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || runtime.block_on(Selector::new(config, cmd_rx, event_tx).run()))
            .context("spawn reactor thread")?;

        Ok(Self {
            commands: cmd_tx,
            events: Mutex::new(event_rx),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Starts connecting to `host:port`. Completion arrives as a connect or
    /// connect-fail event for the returned key.
    pub fn connect(&self, host: &str, port: u16) -> ConnectionKey {
        let key = ConnectionKey::new_unique();
        self.enqueue(Command::Connect {
            key,
            addr: format!("{host}:{port}"),
        });
        key
    }

    pub fn disconnect(&self, key: ConnectionKey) {
        self.enqueue(Command::Disconnect { key });
    }

    /// Starts listening on `port` (0 picks an ephemeral port, reported by the
    /// listening event).
    pub fn start_listening(&self, port: u16) -> ListenerKey {
        let key = ListenerKey::new_unique();
        self.enqueue(Command::StartListen { key, port });
        key
    }

    pub fn stop_listening(&self, key: ListenerKey) {
        self.enqueue(Command::StopListen { key });
    }

    pub fn send(&self, key: ConnectionKey, packet: Packet) {
        self.enqueue(Command::Send { key, packet });
    }

    /// Stops the reactor after the commands already queued have run.
    ///
    /// Connections still open at that point are dropped without a close event.
    pub fn cancel(&self) {
        self.enqueue(Command::Cancel);
    }

    /// Whether the reactor has stopped accepting commands.
    pub fn is_cancelled(&self) -> bool {
        self.commands.is_closed()
    }

    /// Dispatches every queued event to `listener` on the calling thread.
    /// Returns the number of events dispatched.
    pub fn handle_messages(&self, listener: &mut dyn ReactorListener) -> usize {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            event.dispatch(listener);
            handled += 1;
        }
        handled
    }

    /// Waits for the reactor thread to exit. Call after [`Reactor::cancel`].
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
    }

    fn enqueue(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            debug!(?command, "reactor cancelled; command dropped");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.cancel();
        self.join();
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// A connect still in flight. Sends issued meanwhile are held in `outbound`.
struct Pending {
    connecting: ConnectFuture,
    outbound: BytesMut,
}

/// An established connection and its private accumulation state.
struct Channel {
    stream: TcpStream,
    inbound: BytesMut,
    outbound: BytesMut,
}

enum ReadState {
    Open,
    Eof,
}

impl Channel {
    fn new(stream: TcpStream, outbound: BytesMut) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        Self {
            stream,
            inbound: BytesMut::new(),
            outbound,
        }
    }

    /// Reads whatever is available without blocking.
    fn fill(&mut self, chunk: usize) -> io::Result<ReadState> {
        for _ in 0..MAX_READS_PER_WAKE {
            self.inbound.reserve(chunk);
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => return Ok(ReadState::Eof),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Open),
                Err(e) => return Err(e),
            }
        }
        Ok(ReadState::Open)
    }

    /// Writes as much buffered output as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Something the selector found ready.
enum Ready {
    Accepted(ListenerKey, io::Result<(TcpStream, SocketAddr)>),
    Connected(ConnectionKey, io::Result<TcpStream>),
    Readable(ConnectionKey),
    Writable(ConnectionKey),
}

/// Reactor-thread state. Never leaves the reactor thread.
struct Selector {
    config: ReactorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    queued: VecDeque<Command>,
    listeners: HashMap<ListenerKey, TcpListener>,
    pending: HashMap<ConnectionKey, Pending>,
    channels: HashMap<ConnectionKey, Channel>,
    cancelled: bool,
}

impl Selector {
    fn new(
        config: ReactorConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            queued: VecDeque::new(),
            listeners: HashMap::new(),
            pending: HashMap::new(),
            channels: HashMap::new(),
            cancelled: false,
        }
    }

    async fn run(mut self) {
        debug!("reactor started");
        loop {
            let ready = std::future::poll_fn(|cx| self.poll_select(cx)).await;
            self.drain_commands();
            if self.cancelled {
                break;
            }
            for item in ready {
                self.on_ready(item);
            }
        }
        // Sockets still open here are dropped without close events.
        info!(
            open = self.channels.len(),
            listening = self.listeners.len(),
            "reactor cancelled"
        );
    }

    /// Readiness selection over the command queue and every socket.
    fn poll_select(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Ready>> {
        loop {
            match self.commands.poll_recv(cx) {
                Poll::Ready(Some(command)) => self.queued.push_back(command),
                Poll::Ready(None) => {
                    // Every handle is gone; nobody can cancel explicitly anymore.
                    if !self.cancelled {
                        self.queued.push_back(Command::Cancel);
                    }
                    break;
                }
                Poll::Pending => break,
            }
        }

        let mut ready = Vec::new();
        for (key, listener) in &self.listeners {
            if let Poll::Ready(result) = listener.poll_accept(cx) {
                ready.push(Ready::Accepted(*key, result));
            }
        }
        for (key, pending) in self.pending.iter_mut() {
            if let Poll::Ready(result) = pending.connecting.as_mut().poll(cx) {
                ready.push(Ready::Connected(*key, result));
            }
        }
        for (key, channel) in &self.channels {
            if channel.stream.poll_read_ready(cx).is_ready() {
                ready.push(Ready::Readable(*key));
            }
            if !channel.outbound.is_empty() && channel.stream.poll_write_ready(cx).is_ready() {
                ready.push(Ready::Writable(*key));
            }
        }

        if ready.is_empty() && self.queued.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    fn drain_commands(&mut self) {
        loop {
            let command = match self.queued.pop_front() {
                Some(command) => command,
                None => match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            self.execute(command);
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { key, addr } => {
                debug!(?key, %addr, "connecting");
                let connecting: ConnectFuture = Box::pin(async move { TcpStream::connect(addr).await });
                self.pending.insert(
                    key,
                    Pending {
                        connecting,
                        outbound: BytesMut::new(),
                    },
                );
            }
            Command::Disconnect { key } => self.close(key, false),
            Command::StartListen { key, port } => self.start_listening(key, port),
            Command::StopListen { key } => {
                if self.listeners.remove(&key).is_some() {
                    info!(listener = ?key, "stopped listening");
                }
            }
            Command::Send { key, packet } => self.send(key, &packet),
            Command::Cancel => {
                self.cancelled = true;
                // Commands already in the queue still run; later enqueues fail.
                self.commands.close();
            }
        }
    }

    fn start_listening(&mut self, key: ListenerKey, port: u16) {
        let addr = format!("{}:{}", self.config.bind_host, port);
        let bound = std::net::TcpListener::bind(&addr).and_then(|std_listener| {
            std_listener.set_nonblocking(true)?;
            TcpListener::from_std(std_listener)
        });
        match bound.and_then(|l| l.local_addr().map(|a| (l, a))) {
            Ok((listener, local_addr)) => {
                info!(listener = ?key, %local_addr, "listening");
                self.listeners.insert(key, listener);
                self.emit(Event::Listening {
                    listener: key,
                    local_addr,
                });
            }
            Err(cause) => {
                warn!(listener = ?key, %addr, error = %cause, "listen failed");
                self.emit(Event::ListenFail {
                    listener: key,
                    cause,
                });
            }
        }
    }

    fn send(&mut self, key: ConnectionKey, packet: &Packet) {
        if let Some(pending) = self.pending.get_mut(&key) {
            framing::encode_message(packet, &mut pending.outbound);
            return;
        }
        let Some(channel) = self.channels.get_mut(&key) else {
            trace!(?key, "send to unknown connection ignored");
            return;
        };
        framing::encode_message(packet, &mut channel.outbound);
        if let Err(e) = channel.flush() {
            warn!(?key, error = %e, "write failed; tearing down");
            self.close(key, true);
        }
    }

    fn on_ready(&mut self, item: Ready) {
        match item {
            Ready::Accepted(listener, Ok((stream, peer))) => {
                if !self.listeners.contains_key(&listener) {
                    return;
                }
                let key = ConnectionKey::new_unique();
                info!(?listener, ?key, %peer, "accepted");
                self.channels
                    .insert(key, Channel::new(stream, BytesMut::new()));
                self.emit(Event::Accept {
                    listener,
                    key,
                    peer,
                });
            }
            Ready::Accepted(listener, Err(cause)) => {
                warn!(?listener, error = %cause, "accept failed");
                self.emit(Event::AcceptFail { listener, cause });
            }
            Ready::Connected(key, result) => {
                // Disconnected while the connect was in flight.
                let Some(pending) = self.pending.remove(&key) else {
                    return;
                };
                match result.and_then(|s| s.peer_addr().map(|p| (s, p))) {
                    Ok((stream, peer)) => {
                        info!(?key, %peer, "connected");
                        self.channels
                            .insert(key, Channel::new(stream, pending.outbound));
                        self.emit(Event::Connect { key, peer });
                        self.on_writable(key);
                    }
                    Err(cause) => {
                        warn!(?key, error = %cause, "connect failed");
                        self.emit(Event::ConnectFail { key, cause });
                    }
                }
            }
            Ready::Readable(key) => self.on_readable(key),
            Ready::Writable(key) => self.on_writable(key),
        }
    }

    fn on_readable(&mut self, key: ConnectionKey) {
        let chunk = self.config.read_chunk;
        let max = self.config.max_frame_len;
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        let state = channel.fill(chunk);

        // Messages already buffered go out before any close for this connection.
        let mut messages = Vec::new();
        let mut malformed = None;
        loop {
            match framing::decode_message(&mut channel.inbound, max) {
                Ok(Some(packet)) => messages.push(packet),
                Ok(None) => break,
                Err(e) => {
                    malformed = Some(e);
                    break;
                }
            }
        }
        for packet in messages {
            self.emit(Event::Message { key, packet });
        }

        if let Some(e) = malformed {
            warn!(?key, error = %e, "malformed inbound frame; closing");
            self.emit(Event::ReadFail {
                key,
                cause: io::Error::new(io::ErrorKind::InvalidData, e),
            });
            self.close(key, false);
            return;
        }
        match state {
            Ok(ReadState::Open) => {}
            Ok(ReadState::Eof) => self.close(key, true),
            Err(e) if is_peer_closure(&e) => {
                debug!(?key, error = %e, "peer reset");
                self.close(key, true);
            }
            Err(e) => {
                warn!(?key, error = %e, "read failed; tearing down");
                self.close(key, true);
            }
        }
    }

    fn on_writable(&mut self, key: ConnectionKey) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        if let Err(e) = channel.flush() {
            warn!(?key, error = %e, "write failed; tearing down");
            self.close(key, true);
        }
    }

    /// Deregisters and closes a connection, emitting its single close event.
    fn close(&mut self, key: ConnectionKey, remote: bool) {
        if let Some(mut channel) = self.channels.remove(&key) {
            if !remote {
                // Best effort: hand queued output to the kernel before closing.
                let _ = channel.flush();
            }
            drop(channel);
        } else if self.pending.remove(&key).is_none() {
            trace!(?key, "close for unknown connection ignored");
            return;
        }
        info!(?key, remote, "closed");
        self.emit(Event::Close { key, remote });
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!("event receiver gone");
        }
    }
}

fn is_peer_closure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
