//! Role-agnostic host surface.
//!
//! A `Host` sends packets to connections and reports what happened on them.
//! Client and server roles add their own control operations. `HostAdapter`
//! puts an optional client and an optional server behind one `Host` so a
//! process can dial out and accept at the same time.

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    packet::Packet,
    reactor::{ConnectionKey, ListenerKey, Reactor, ReactorConfig, ReactorListener},
};

/// Which operation an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    Connect(ConnectionKey),
    Listen(ListenerKey),
    Accept(ListenerKey),
    Read(ConnectionKey),
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Connect(key) => write!(f, "connect {}", key.0),
            ErrorContext::Listen(key) => write!(f, "listen {}", key.0),
            ErrorContext::Accept(key) => write!(f, "accept on listener {}", key.0),
            ErrorContext::Read(key) => write!(f, "read {}", key.0),
        }
    }
}

/// Callbacks for host events. Returning an error makes the event fatal for
/// the current drain.
pub trait HostListener {
    fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()>;

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) -> anyhow::Result<()>;

    fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()>;

    fn on_error(&mut self, context: ErrorContext, cause: io::Error) -> anyhow::Result<()> {
        warn!(%context, error = %cause, "host error");
        Ok(())
    }
}

/// One host event, queued until the owning thread drains it.
#[derive(Debug)]
pub enum HostEvent {
    Open(ConnectionKey),
    Message(ConnectionKey, Packet),
    Close { key: ConnectionKey, remote: bool },
    Error { context: ErrorContext, cause: io::Error },
}

impl HostEvent {
    pub fn dispatch(self, listener: &mut dyn HostListener) -> anyhow::Result<()> {
        match self {
            HostEvent::Open(key) => listener.on_open(key),
            HostEvent::Message(key, packet) => listener.on_message(key, packet),
            HostEvent::Close { key, remote } => listener.on_close(key, remote),
            HostEvent::Error { context, cause } => listener.on_error(context, cause),
        }
    }
}

/// Sends packets and yields queued events.
pub trait Host: Send {
    fn send_message(&self, key: ConnectionKey, packet: Packet);

    /// Takes every event queued since the last call.
    fn poll_events(&self) -> Vec<HostEvent>;
}

/// Dialing role.
pub trait Client: Host {
    fn connect(&self, host: &str, port: u16) -> ConnectionKey;

    fn disconnect(&self, key: ConnectionKey);
}

/// Listening role.
pub trait Server: Host {
    fn start_listening(&self, port: u16) -> ListenerKey;

    fn stop_listening(&self, key: ListenerKey);
}

/// Drains `host` and dispatches each event to `listener`. See [`dispatch_all`].
pub fn process_inputs(host: &dyn Host, listener: &mut dyn HostListener) -> anyhow::Result<usize> {
    dispatch_all(host.poll_events(), listener)
}

/// Dispatches a drained batch in order and returns its size.
///
/// Stops at the first listener error; the rest of the batch is dropped.
pub fn dispatch_all(events: Vec<HostEvent>, listener: &mut dyn HostListener) -> anyhow::Result<usize> {
    let count = events.len();
    for event in events {
        event.dispatch(listener)?;
    }
    Ok(count)
}

/// Client and server roles backed by one [`Reactor`].
#[derive(Debug)]
pub struct ReactorHost {
    reactor: Reactor,
    local_addrs: Mutex<HashMap<ListenerKey, SocketAddr>>,
}

impl ReactorHost {
    pub fn spawn(config: ReactorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            reactor: Reactor::spawn(config)?,
            local_addrs: Mutex::new(HashMap::new()),
        })
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Bound address of `listener`, known once a poll has seen it start.
    pub fn local_addr(&self, listener: ListenerKey) -> Option<SocketAddr> {
        lock(&self.local_addrs).get(&listener).copied()
    }
}

/// Maps reactor callbacks onto host events.
#[derive(Default)]
struct Collector {
    events: Vec<HostEvent>,
    listening: Vec<(ListenerKey, SocketAddr)>,
}

impl ReactorListener for Collector {
    fn on_accept(&mut self, listener: ListenerKey, key: ConnectionKey, peer: SocketAddr) {
        debug!(?listener, ?key, %peer, "accepted");
        self.events.push(HostEvent::Open(key));
    }

    fn on_listen_fail(&mut self, listener: ListenerKey, cause: io::Error) {
        self.events.push(HostEvent::Error {
            context: ErrorContext::Listen(listener),
            cause,
        });
    }

    fn on_connect(&mut self, key: ConnectionKey, peer: SocketAddr) {
        debug!(?key, %peer, "connected");
        self.events.push(HostEvent::Open(key));
    }

    fn on_accept_fail(&mut self, listener: ListenerKey, cause: io::Error) {
        self.events.push(HostEvent::Error {
            context: ErrorContext::Accept(listener),
            cause,
        });
    }

    fn on_connect_fail(&mut self, key: ConnectionKey, cause: io::Error) {
        self.events.push(HostEvent::Error {
            context: ErrorContext::Connect(key),
            cause,
        });
    }

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) {
        self.events.push(HostEvent::Message(key, packet));
    }

    fn on_close(&mut self, key: ConnectionKey, remote: bool) {
        self.events.push(HostEvent::Close { key, remote });
    }

    fn on_read_fail(&mut self, key: ConnectionKey, cause: io::Error) {
        self.events.push(HostEvent::Error {
            context: ErrorContext::Read(key),
            cause,
        });
    }

    fn on_listening(&mut self, listener: ListenerKey, local_addr: SocketAddr) {
        debug!(?listener, %local_addr, "listening");
        self.listening.push((listener, local_addr));
    }
}

impl Host for ReactorHost {
    fn send_message(&self, key: ConnectionKey, packet: Packet) {
        self.reactor.send(key, packet);
    }

    fn poll_events(&self) -> Vec<HostEvent> {
        let mut collector = Collector::default();
        self.reactor.handle_messages(&mut collector);
        lock(&self.local_addrs).extend(collector.listening);
        collector.events
    }
}

impl Client for ReactorHost {
    fn connect(&self, host: &str, port: u16) -> ConnectionKey {
        self.reactor.connect(host, port)
    }

    fn disconnect(&self, key: ConnectionKey) {
        self.reactor.disconnect(key);
    }
}

impl Server for ReactorHost {
    fn start_listening(&self, port: u16) -> ListenerKey {
        self.reactor.start_listening(port)
    }

    fn stop_listening(&self, key: ListenerKey) {
        lock(&self.local_addrs).remove(&key);
        self.reactor.stop_listening(key);
    }
}

/// Client role that never connects anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClient;

impl Host for NullClient {
    fn send_message(&self, _key: ConnectionKey, _packet: Packet) {}

    fn poll_events(&self) -> Vec<HostEvent> {
        Vec::new()
    }
}

impl Client for NullClient {
    fn connect(&self, _host: &str, _port: u16) -> ConnectionKey {
        ConnectionKey::new_unique()
    }

    fn disconnect(&self, _key: ConnectionKey) {}
}

/// Server role that never listens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullServer;

impl Host for NullServer {
    fn send_message(&self, _key: ConnectionKey, _packet: Packet) {}

    fn poll_events(&self) -> Vec<HostEvent> {
        Vec::new()
    }
}

impl Server for NullServer {
    fn start_listening(&self, _port: u16) -> ListenerKey {
        ListenerKey::new_unique()
    }

    fn stop_listening(&self, _key: ListenerKey) {}
}

impl<T: Host + Sync> Host for Arc<T> {
    fn send_message(&self, key: ConnectionKey, packet: Packet) {
        (**self).send_message(key, packet);
    }

    fn poll_events(&self) -> Vec<HostEvent> {
        (**self).poll_events()
    }
}

impl<T: Client + Sync> Client for Arc<T> {
    fn connect(&self, host: &str, port: u16) -> ConnectionKey {
        (**self).connect(host, port)
    }

    fn disconnect(&self, key: ConnectionKey) {
        (**self).disconnect(key);
    }
}

impl<T: Server + Sync> Server for Arc<T> {
    fn start_listening(&self, port: u16) -> ListenerKey {
        (**self).start_listening(port)
    }

    fn stop_listening(&self, key: ListenerKey) {
        (**self).stop_listening(key);
    }
}

/// One logical host over an optional client and an optional server.
pub struct HostAdapter {
    client: Box<dyn Client>,
    server: Box<dyn Server>,
}

impl HostAdapter {
    pub fn new(client: Option<Box<dyn Client>>, server: Option<Box<dyn Server>>) -> Self {
        Self {
            client: client.unwrap_or_else(|| Box::new(NullClient)),
            server: server.unwrap_or_else(|| Box::new(NullServer)),
        }
    }

    pub fn client(client: impl Client + 'static) -> Self {
        Self::new(Some(Box::new(client)), None)
    }

    pub fn server(server: impl Server + 'static) -> Self {
        Self::new(None, Some(Box::new(server)))
    }

    pub fn peer(client: impl Client + 'static, server: impl Server + 'static) -> Self {
        Self::new(Some(Box::new(client)), Some(Box::new(server)))
    }
}

impl Host for HostAdapter {
    /// Keys are process-unique, so the role that does not own `key` ignores it.
    fn send_message(&self, key: ConnectionKey, packet: Packet) {
        self.client.send_message(key, packet.clone());
        self.server.send_message(key, packet);
    }

    fn poll_events(&self) -> Vec<HostEvent> {
        let mut events = self.client.poll_events();
        events.extend(self.server.poll_events());
        events
    }
}

impl Client for HostAdapter {
    fn connect(&self, host: &str, port: u16) -> ConnectionKey {
        self.client.connect(host, port)
    }

    fn disconnect(&self, key: ConnectionKey) {
        self.client.disconnect(key);
    }
}

impl Server for HostAdapter {
    fn start_listening(&self, port: u16) -> ListenerKey {
        self.server.start_listening(port)
    }

    fn stop_listening(&self, key: ListenerKey) {
        self.server.stop_listening(key);
    }
}

impl fmt::Debug for HostAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAdapter").finish_non_exhaustive()
    }
}

/// In-memory host: records every send and replays injected events.
///
/// Clones share state, so a test can keep one clone while a Mux owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    sent: Arc<Mutex<Vec<(ConnectionKey, Packet)>>>,
    inbox: Arc<Mutex<Vec<HostEvent>>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the next [`Host::poll_events`].
    pub fn inject(&self, event: HostEvent) {
        lock(&self.inbox).push(event);
    }

    /// Takes every packet sent so far.
    pub fn take_sent(&self) -> Vec<(ConnectionKey, Packet)> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Host for MemoryHost {
    fn send_message(&self, key: ConnectionKey, packet: Packet) {
        lock(&self.sent).push((key, packet));
    }

    fn poll_events(&self) -> Vec<HostEvent> {
        std::mem::take(&mut *lock(&self.inbox))
    }
}

impl Client for MemoryHost {
    fn connect(&self, _host: &str, _port: u16) -> ConnectionKey {
        let key = ConnectionKey::new_unique();
        self.inject(HostEvent::Open(key));
        key
    }

    fn disconnect(&self, key: ConnectionKey) {
        self.inject(HostEvent::Close { key, remote: false });
    }
}

impl Server for MemoryHost {
    fn start_listening(&self, _port: u16) -> ListenerKey {
        ListenerKey::new_unique()
    }

    fn stop_listening(&self, _key: ListenerKey) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tally {
        opened: Vec<ConnectionKey>,
        closed: Vec<(ConnectionKey, bool)>,
        errors: usize,
    }

    impl HostListener for Tally {
        fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
            self.opened.push(key);
            Ok(())
        }
        fn on_message(&mut self, _key: ConnectionKey, _packet: Packet) -> anyhow::Result<()> {
            anyhow::bail!("unexpected message")
        }
        fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()> {
            self.closed.push((key, remote));
            Ok(())
        }
        fn on_error(&mut self, _context: ErrorContext, _cause: io::Error) -> anyhow::Result<()> {
            self.errors += 1;
            Ok(())
        }
    }

    #[test]
    fn adapter_forwards_sends_to_both_roles() {
        let client = MemoryHost::new();
        let server = MemoryHost::new();
        let adapter = HostAdapter::peer(client.clone(), server.clone());

        let key = ConnectionKey::new_unique();
        adapter.send_message(key, Packet::new().push_data(&b"x"[..]));
        assert_eq!(client.take_sent().len(), 1);
        assert_eq!(server.take_sent().len(), 1);
    }

    #[test]
    fn adapter_merges_client_then_server_events() {
        let server = MemoryHost::new();
        let adapter = HostAdapter::peer(MemoryHost::new(), server.clone());
        let accepted = ConnectionKey::new_unique();
        server.inject(HostEvent::Open(accepted));
        let dialed = Client::connect(&adapter, "localhost", 7000);

        let mut tally = Tally::default();
        assert_eq!(process_inputs(&adapter, &mut tally).unwrap(), 2);
        assert_eq!(tally.opened, vec![dialed, accepted]);
    }

    #[test]
    fn missing_roles_default_to_null() {
        let adapter = HostAdapter::client(MemoryHost::new());
        let key = Client::connect(&adapter, "localhost", 7000);
        Client::disconnect(&adapter, key);
        Server::start_listening(&adapter, 7000);

        let mut tally = Tally::default();
        process_inputs(&adapter, &mut tally).unwrap();
        assert_eq!(tally.opened, vec![key]);
        assert_eq!(tally.closed, vec![(key, false)]);
        assert!(adapter.poll_events().is_empty());
    }

    #[test]
    fn listener_error_stops_the_drain() {
        let host = MemoryHost::new();
        let key = ConnectionKey::new_unique();
        host.inject(HostEvent::Message(key, Packet::new()));
        host.inject(HostEvent::Open(key));
        let mut tally = Tally::default();
        assert!(process_inputs(&host, &mut tally).is_err());
        assert!(tally.opened.is_empty());
        // The failed batch is gone, not requeued.
        assert_eq!(process_inputs(&host, &mut tally).unwrap(), 0);
        assert!(tally.opened.is_empty());
    }

    #[test]
    fn dispatch_all_runs_the_batch_in_order() {
        let (a, b) = (ConnectionKey::new_unique(), ConnectionKey::new_unique());
        let mut tally = Tally::default();
        let count = dispatch_all(
            vec![HostEvent::Open(b), HostEvent::Open(a)],
            &mut tally,
        )
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(tally.opened, vec![b, a]);
    }

    #[test]
    fn errors_reach_on_error() {
        let host = MemoryHost::new();
        host.inject(HostEvent::Error {
            context: ErrorContext::Listen(ListenerKey(1)),
            cause: io::ErrorKind::AddrInUse.into(),
        });
        let mut tally = Tally::default();
        process_inputs(&host, &mut tally).unwrap();
        assert_eq!(tally.errors, 1);
    }
}
