//! VRCL server: listeners, the single client connection and its timers.
//!
//! Everything runs on the server's own [`EventQueue`]:
//!
//! ```text
//!   listener fd ──readable──► accept ──► one client slot (others closed)
//!   client fd   ──readable──► TagExtractor ──► VrclSession ──► actions
//!   connect timer (3 s)    ──► drop unauthenticated client
//!   life-check timer (10 s) ─► <IsAlive/> / drop after two misses
//!   notify() from any thread ──post──► write to authenticated client
//!   client fd   ──writable──► flush the outbox
//! ```
//!
//! Writes never block the loop: bytes the socket will not take yet wait
//! in the client's outbox until the descriptor turns writable. Any I/O
//! error, or an outbox past `max_pending_output`, drops the client and
//! resets authentication; the listeners keep running.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::VpError;
use crate::event_queue::EventQueue;
use crate::platform::RestartHandler;
use crate::signal::{ConnectionSet, Signal};
use crate::timer::{Timer, TimerMode};

use super::auth::KeyDerivation;
use super::buffer::{DEFAULT_CAPACITY, Extracted, TagExtractor};
use super::control::RemoteControl;
use super::session::{SessionAction, VrclSession};
use super::version::ApiVersion;
use super::xml::XmlElement;

pub const DEFAULT_PORT: u16 = 15327;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_LIFE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Unsent bytes a client may accumulate before it is dropped.
pub const DEFAULT_MAX_PENDING_OUTPUT: usize = 1024 * 1024;

const LISTEN_BACKLOG: i32 = 4;
const READ_CHUNK: usize = 4096;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VrclServerConfig {
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub bind_v4: Ipv4Addr,
    /// Also listen on `[::]` (v6-only socket, same port).
    pub ipv6: bool,
    pub connect_timeout: Duration,
    pub life_check_interval: Duration,
    pub buffer_capacity: usize,
    /// Outbox limit for a client that stops reading.
    pub max_pending_output: usize,
    pub api_version: ApiVersion,
}

impl Default for VrclServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            ipv6: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            life_check_interval: DEFAULT_LIFE_CHECK_INTERVAL,
            buffer_capacity: DEFAULT_CAPACITY,
            max_pending_output: DEFAULT_MAX_PENDING_OUTPUT,
            api_version: ApiVersion::CURRENT,
        }
    }
}

#[derive(Debug, Default)]
pub struct VrclServerSignals {
    pub client_authenticated: Signal<SocketAddr>,
    pub client_disconnected: Signal<SocketAddr>,
}

// ── Internals ────────────────────────────────────────────────────

struct ClientSlot {
    stream: Arc<TcpStream>,
    fd: RawFd,
    session: VrclSession,
    extractor: TagExtractor,
    /// Bytes accepted for sending that the socket has not taken yet.
    outbox: BytesMut,
}

#[derive(Default)]
struct ServerState {
    listeners: Vec<(Arc<TcpListener>, SocketAddr)>,
    client: Option<ClientSlot>,
}

struct ServerInner {
    me: Weak<ServerInner>,
    queue: EventQueue,
    config: VrclServerConfig,
    keys: Arc<dyn KeyDerivation>,
    remote: Arc<dyn RemoteControl>,
    state: Mutex<ServerState>,
    connect_timer: Timer,
    life_timer: Timer,
    signals: VrclServerSignals,
    refused: AtomicU64,
}

impl ServerInner {
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&ServerInner) + Send + 'static,
    {
        let me = self.me.clone();
        self.queue.post_event(move || {
            if let Some(inner) = me.upgrade() {
                f(&inner);
            }
        });
    }

    /// Take the client out for the duration of one callback.
    fn take_client(&self) -> Option<ClientSlot> {
        self.state.lock().client.take()
    }

    fn settle(&self, slot: ClientSlot, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.state.lock().client = Some(slot),
            Err(reason) => self.drop_client(slot, &reason),
        }
    }

    // ── Accept ───────────────────────────────────────────────────

    fn accept_ready(&self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("vrcl accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let mut state = self.state.lock();
        if state.client.is_some() {
            info!(%peer, "refusing second vrcl connection");
            self.refused.fetch_add(1, Ordering::Relaxed);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, "cannot make client socket non-blocking: {e}");
            return;
        }
        let _ = stream.set_nodelay(true);
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!(%peer, "client socket has no local address: {e}");
                return;
            }
        };

        let stream = Arc::new(stream);
        let fd = stream.as_raw_fd();
        let me = self.me.clone();
        let attached = self.queue.file_descriptor_attach(Arc::clone(&stream), move || {
            if let Some(inner) = me.upgrade() {
                inner.client_readable();
            }
        });
        if !attached {
            warn!(%peer, fd, "cannot watch client socket");
            return;
        }

        state.client = Some(ClientSlot {
            stream,
            fd,
            session: VrclSession::new(
                peer,
                local,
                Arc::clone(&self.keys),
                self.config.api_version,
            ),
            extractor: TagExtractor::new(self.config.buffer_capacity),
            outbox: BytesMut::new(),
        });
        drop(state);

        self.connect_timer.start();
        info!(%peer, "vrcl client connected");
    }

    // ── Client I/O ───────────────────────────────────────────────

    fn client_readable(&self) {
        let Some(mut slot) = self.take_client() else {
            return;
        };
        let outcome = self.service(&mut slot);
        self.settle(slot, outcome);
    }

    /// Drain the socket and run every complete unit through the session.
    fn service(&self, slot: &mut ClientSlot) -> Result<(), String> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match (&*slot.stream).read(&mut buf) {
                Ok(0) => return Err("peer closed the connection".into()),
                Ok(n) => {
                    for item in slot.extractor.push(&buf[..n]) {
                        let actions = match item {
                            Extracted::Tag(unit) => slot.session.handle(&unit, self.remote.as_ref()),
                            Extracted::Invalid(raw) => {
                                slot.session.handle_invalid(&raw);
                                continue;
                            }
                        };
                        self.perform(slot, actions)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(format!("read failed: {e}")),
            }
        }
    }

    fn perform(&self, slot: &mut ClientSlot, actions: Vec<SessionAction>) -> Result<(), String> {
        for action in actions {
            match action {
                SessionAction::Send(message) => self.send(slot, &message)?,
                SessionAction::Authenticated => {
                    self.connect_timer.stop();
                    self.life_timer.start();
                    self.signals.client_authenticated.emit(&slot.session.peer());
                }
                SessionAction::Disconnect(reason) => return Err(reason),
            }
        }
        Ok(())
    }

    fn send(&self, slot: &mut ClientSlot, message: &XmlElement) -> Result<(), String> {
        let xml = message.to_xml();
        debug!(peer = %slot.session.peer(), "vrcl -> {xml}");
        let backlog = slot.outbox.len() + xml.len();
        if backlog > self.config.max_pending_output {
            return Err(format!("peer is not reading ({backlog} bytes pending)"));
        }
        let idle = slot.outbox.is_empty();
        slot.outbox.extend_from_slice(xml.as_bytes());
        if idle {
            self.flush(slot)?;
        }
        Ok(())
    }

    /// Write as much of the outbox as the socket takes; wait for write
    /// readiness when it stops taking bytes.
    fn flush(&self, slot: &mut ClientSlot) -> Result<(), String> {
        while !slot.outbox.is_empty() {
            match (&*slot.stream).write(&slot.outbox) {
                Ok(0) => return Err("write failed: socket closed".into()),
                Ok(n) => slot.outbox.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(
                        peer = %slot.session.peer(),
                        pending = slot.outbox.len(),
                        "vrcl client socket full"
                    );
                    let me = self.me.clone();
                    let armed = self.queue.file_descriptor_await_writable(slot.fd, move || {
                        if let Some(inner) = me.upgrade() {
                            inner.client_writable();
                        }
                    });
                    if !armed {
                        return Err("client socket is no longer watched".into());
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(format!("write failed: {e}")),
            }
        }
        Ok(())
    }

    fn client_writable(&self) {
        let Some(mut slot) = self.take_client() else {
            return;
        };
        let outcome = self.flush(&mut slot);
        self.settle(slot, outcome);
    }

    fn drop_client(&self, mut slot: ClientSlot, reason: &str) {
        let peer = slot.session.peer();
        info!(%peer, %reason, "vrcl client disconnected");
        self.queue.file_descriptor_detach(slot.fd);
        let _ = slot.stream.shutdown(Shutdown::Both);
        slot.session.close();
        self.connect_timer.stop();
        self.life_timer.stop();
        self.signals.client_disconnected.emit(&peer);
    }

    // ── Timers ───────────────────────────────────────────────────

    fn on_connect_timeout(&self) {
        let Some(mut slot) = self.take_client() else {
            return;
        };
        let actions = slot.session.connect_timeout();
        let outcome = self.perform(&mut slot, actions);
        self.settle(slot, outcome);
    }

    fn on_life_check(&self) {
        let Some(mut slot) = self.take_client() else {
            return;
        };
        let actions = slot.session.life_check_tick();
        let outcome = self.perform(&mut slot, actions);
        self.settle(slot, outcome);
    }

    // ── Notifications ────────────────────────────────────────────

    fn deliver(&self, message: &XmlElement, min_version: ApiVersion) {
        let Some(mut slot) = self.take_client() else {
            return;
        };
        if !slot.session.accepts(min_version) {
            self.state.lock().client = Some(slot);
            return;
        }
        let outcome = self.send(&mut slot, message);
        self.settle(slot, outcome);
    }
}

fn bind_listener(addr: SocketAddr, only_v6: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if only_v6 {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ── Notify handle ────────────────────────────────────────────────

/// Cloneable, non-owning handle for pushing notifications.
#[derive(Clone)]
pub struct NotifyHandle {
    inner: Weak<ServerInner>,
}

impl NotifyHandle {
    /// Queue `message` for the client if its negotiated version is at
    /// least `min_version`. Dropped silently when no client qualifies.
    pub fn notify(&self, message: XmlElement, min_version: ApiVersion) {
        if let Some(inner) = self.inner.upgrade() {
            inner.post(move |inner| inner.deliver(&message, min_version));
        }
    }
}

// ── VrclServer ───────────────────────────────────────────────────

pub struct VrclServer {
    inner: Arc<ServerInner>,
    _subscriptions: ConnectionSet,
}

impl VrclServer {
    pub fn new(
        config: VrclServerConfig,
        keys: Arc<dyn KeyDerivation>,
        remote: Arc<dyn RemoteControl>,
    ) -> Self {
        let queue = EventQueue::new("vrcl-server");
        let connect_timer = Timer::new(&queue, config.connect_timeout, TimerMode::OneShot);
        let life_timer = Timer::new(&queue, config.life_check_interval, TimerMode::Repeating);

        let inner = Arc::new_cyclic(|me| ServerInner {
            me: me.clone(),
            queue,
            config,
            keys,
            remote,
            state: Mutex::new(ServerState::default()),
            connect_timer,
            life_timer,
            signals: VrclServerSignals::default(),
            refused: AtomicU64::new(0),
        });

        let subscriptions = ConnectionSet::new();
        let me = Arc::downgrade(&inner);
        subscriptions.push(inner.connect_timer.timeout_signal().connect(move |_| {
            if let Some(inner) = me.upgrade() {
                inner.on_connect_timeout();
            }
        }));
        let me = Arc::downgrade(&inner);
        subscriptions.push(inner.life_timer.timeout_signal().connect(move |_| {
            if let Some(inner) = me.upgrade() {
                inner.on_life_check();
            }
        }));

        Self {
            inner,
            _subscriptions: subscriptions,
        }
    }

    pub fn set_restart_handler(&self, handler: Arc<dyn RestartHandler>) {
        self.inner.queue.set_restart_handler(handler);
    }

    /// Bind the listeners and start the loop. Returns the bound addresses.
    pub fn start(&self) -> Result<Vec<SocketAddr>, VpError> {
        let inner = &self.inner;
        if inner.queue.is_running() {
            return Err(VpError::AlreadyRunning);
        }
        let config = &inner.config;

        let mut listeners = vec![bind_listener(
            SocketAddr::from((config.bind_v4, config.port)),
            false,
        )?];
        if config.ipv6 {
            let port = listeners[0].local_addr()?.port();
            match bind_listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), true) {
                Ok(listener) => listeners.push(listener),
                Err(e) => warn!(port, "ipv6 listener unavailable: {e}"),
            }
        }

        let mut addrs = Vec::new();
        for listener in listeners {
            let addr = listener.local_addr()?;
            let listener = Arc::new(listener);
            let source = Arc::clone(&listener);
            let me = inner.me.clone();
            let attached = inner.queue.file_descriptor_attach(Arc::clone(&listener), move || {
                if let Some(inner) = me.upgrade() {
                    inner.accept_ready(&source);
                }
            });
            if !attached {
                return Err(VpError::Other(format!("cannot watch listener {addr}")));
            }
            inner.state.lock().listeners.push((listener, addr));
            addrs.push(addr);
        }

        if !inner.queue.start_event_loop() {
            return Err(VpError::AlreadyRunning);
        }
        info!(?addrs, "vrcl server listening");
        Ok(addrs)
    }

    /// Stop the loop, drop the client and close the listeners.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.queue.stop_event_loop();
        inner.connect_timer.stop();
        inner.life_timer.stop();

        let (listeners, client) = {
            let mut state = inner.state.lock();
            (std::mem::take(&mut state.listeners), state.client.take())
        };
        if let Some(slot) = client {
            inner.drop_client(slot, "server stopping");
        }
        for (listener, addr) in listeners {
            inner.queue.file_descriptor_detach(listener.as_raw_fd());
            debug!(%addr, "vrcl listener closed");
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    pub fn signals(&self) -> &VrclServerSignals {
        &self.inner.signals
    }

    pub fn notifier(&self) -> NotifyHandle {
        NotifyHandle {
            inner: self.inner.me.clone(),
        }
    }

    pub fn notify(&self, message: XmlElement, min_version: ApiVersion) {
        self.notifier().notify(message, min_version);
    }

    /// Drop the current client, if any.
    pub fn disconnect_client(&self) {
        self.inner.post(|inner| {
            if let Some(slot) = inner.take_client() {
                inner.drop_client(slot, "disconnect requested");
            }
        });
    }

    // ── Accessors ────────────────────────────────────────────────
    //
    // These wait for the loop's current callback, then read the state.

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let _guard = self.inner.queue.lock();
        self.inner
            .state
            .lock()
            .listeners
            .iter()
            .map(|(_, addr)| *addr)
            .collect()
    }

    pub fn is_client_connected(&self) -> bool {
        let _guard = self.inner.queue.lock();
        self.inner.state.lock().client.is_some()
    }

    pub fn is_client_authenticated(&self) -> bool {
        let _guard = self.inner.queue.lock();
        self.inner
            .state
            .lock()
            .client
            .as_ref()
            .is_some_and(|c| c.session.is_authenticated())
    }

    /// Negotiated version of the connected, authenticated client.
    pub fn negotiated_version(&self) -> Option<ApiVersion> {
        let _guard = self.inner.queue.lock();
        self.inner
            .state
            .lock()
            .client
            .as_ref()
            .filter(|c| c.session.is_authenticated())
            .map(|c| c.session.negotiated_version())
    }

    /// Connections closed because a client was already attached.
    pub fn refused_connections(&self) -> u64 {
        self.inner.refused.load(Ordering::Relaxed)
    }
}

impl Drop for VrclServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrcl::auth::Blake3KeyDerivation;
    use crate::vrcl::message::{Reply, VrclCommand};
    use std::net::IpAddr;
    use std::thread;
    use std::time::Instant;

    struct Echo;

    impl RemoteControl for Echo {
        fn execute(&self, command: &VrclCommand) -> Result<Reply, VpError> {
            match command {
                VrclCommand::StatusCheck => Ok(Reply::empty().with_attr("state", "Idle")),
                _ => Err(VpError::NoCall),
            }
        }
    }

    fn test_config(connect_timeout: Duration, life_check: Duration) -> VrclServerConfig {
        VrclServerConfig {
            port: 0,
            bind_v4: Ipv4Addr::LOCALHOST,
            ipv6: false,
            connect_timeout,
            life_check_interval: life_check,
            ..VrclServerConfig::default()
        }
    }

    fn server(connect_timeout: Duration, life_check: Duration) -> (VrclServer, SocketAddr) {
        server_with(test_config(connect_timeout, life_check))
    }

    fn server_with(config: VrclServerConfig) -> (VrclServer, SocketAddr) {
        let server = VrclServer::new(
            config,
            Arc::new(Blake3KeyDerivation::new("secret")),
            Arc::new(Echo),
        );
        let addr = server.start().unwrap()[0];
        (server, addr)
    }

    /// Client socket with a small receive window so the server fills it fast.
    fn connect_narrow(addr: SocketAddr) -> TcpStream {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.connect(&addr.into()).unwrap();
        let stream: TcpStream = socket.into();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// 64 KiB notifications; `count` of them overrun any socket buffering.
    fn flood(server: &VrclServer, count: usize) {
        let payload = "x".repeat(64 * 1024);
        for seq in 0..count {
            server.notify(
                XmlElement::new("Bulk")
                    .with_attr("seq", seq)
                    .with_text(payload.clone()),
                ApiVersion::BASELINE,
            );
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn login(stream: &mut TcpStream) {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let key = Blake3KeyDerivation::new("secret").connect_key(ip, ip);
        stream
            .write_all(format!("<Connect>{key}</Connect>").as_bytes())
            .unwrap();
        assert!(read_until(stream, "<ConnectAck/>").contains("<ConnectAck/>"));
    }

    /// Read until `needle` shows up or the peer closes.
    fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
        seen
    }

    fn closed_by_peer(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }

    fn wait(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn authenticated_client_gets_answers() {
        let (server, addr) = server(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL);
        let mut client = connect(addr);
        login(&mut client);
        assert!(wait(|| server.is_client_authenticated()));

        // Split across writes to exercise reassembly.
        client.write_all(b"<Status").unwrap();
        client.write_all(b"Check/><IsAlive/>").unwrap();
        let seen = read_until(&mut client, "<IsAliveAck/>");
        assert!(seen.contains(r#"<StatusCheckSuccess state="Idle"/>"#));
        assert!(seen.contains("<IsAliveAck/>"));

        client.write_all(b"<CallHold/>").unwrap();
        assert!(read_until(&mut client, "</CallHoldFail>").contains("<CallHoldFail>NoCall</CallHoldFail>"));
    }

    #[test]
    fn second_client_is_closed() {
        let (server, addr) = server(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL);
        let mut first = connect(addr);
        login(&mut first);

        let mut second = connect(addr);
        assert!(closed_by_peer(&mut second));
        assert_eq!(server.refused_connections(), 1);

        first.write_all(b"<IsAlive/>").unwrap();
        assert!(read_until(&mut first, "<IsAliveAck/>").contains("<IsAliveAck/>"));
    }

    #[test]
    fn unauthenticated_client_times_out() {
        let (server, addr) = server(Duration::from_millis(100), DEFAULT_LIFE_CHECK_INTERVAL);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let _c = server.signals().client_disconnected.connect(move |peer| {
            let _ = tx.lock().send(*peer);
        });

        let mut client = connect(addr);
        assert!(closed_by_peer(&mut client));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(wait(|| !server.is_client_connected()));

        // The slot is free again.
        let mut again = connect(addr);
        login(&mut again);
    }

    #[test]
    fn silent_client_fails_life_check() {
        let (server, addr) = server(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis(50));
        let mut client = connect(addr);
        login(&mut client);

        let seen = read_until(&mut client, "<IsAlive/><IsAlive/>");
        assert!(seen.contains("<IsAlive/>"));
        assert!(closed_by_peer(&mut client));
        assert!(wait(|| !server.is_client_connected()));
    }

    #[test]
    fn notifications_respect_negotiated_version() {
        let (server, addr) = server(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL);
        let mut client = connect(addr);
        login(&mut client);
        client.write_all(b"<APIVersionGet>1.1</APIVersionGet>").unwrap();
        read_until(&mut client, "</APIVersion>");
        assert_eq!(server.negotiated_version(), Some(ApiVersion::new(1, 1)));

        server.notify(XmlElement::new("TooNew"), ApiVersion::new(1, 2));
        server.notify(XmlElement::new("Fits"), ApiVersion::new(1, 1));
        let seen = read_until(&mut client, "<Fits/>");
        assert!(!seen.contains("TooNew"));
        assert!(seen.contains("<Fits/>"));
    }

    #[test]
    fn unread_output_does_not_stall_the_loop() {
        let (server, addr) = server_with(VrclServerConfig {
            max_pending_output: 64 * 1024 * 1024,
            ..test_config(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL)
        });
        let mut client = connect_narrow(addr);
        login(&mut client);
        assert!(wait(|| server.is_client_authenticated()));

        flood(&server, 256);
        server.notify(XmlElement::new("Done"), ApiVersion::BASELINE);
        assert!(server.queue().flush(Duration::from_secs(1)));
        assert!(server.is_client_connected());

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0usize;
        let mut tail = String::new();
        while !tail.contains("<Done/>") {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed after {total} bytes");
            total += n;
            tail.push_str(&String::from_utf8_lossy(&buf[..n]));
            let keep = tail.len().saturating_sub(64);
            tail.drain(..keep);
        }
        assert!(total > 256 * 64 * 1024);
    }

    #[test]
    fn client_that_stops_reading_is_dropped() {
        let (server, addr) = server_with(VrclServerConfig {
            max_pending_output: 256 * 1024,
            ..test_config(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL)
        });
        let mut client = connect_narrow(addr);
        login(&mut client);
        assert!(wait(|| server.is_client_authenticated()));

        flood(&server, 256);
        assert!(wait(|| !server.is_client_connected()));
        assert!(closed_by_peer(&mut client));
    }

    #[test]
    fn second_start_is_refused() {
        let (server, _addr) = server(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL);
        assert!(matches!(server.start(), Err(VpError::AlreadyRunning)));
        assert_eq!(server.local_addrs().len(), 1);
    }

    #[test]
    fn stop_closes_client_and_listener() {
        let (server, addr) = server(DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIFE_CHECK_INTERVAL);
        let mut client = connect(addr);
        login(&mut client);
        server.stop();
        assert!(closed_by_peer(&mut client));
        assert!(server.local_addrs().is_empty());
    }
}
