//! Single-threaded non-blocking socket reactor.
//!
//! A [`Link`] multiplexes any number of TCP listeners and outbound
//! connectors on one mio poll. It owns connection establishment, optional
//! TLS, partial-write buffering and automatic reconnection, and reports
//! network activity through user-installed callbacks. Payloads are opaque
//! byte fragments; framing belongs to the layers above.
//!
//! All [`Link`] methods must be called from the thread driving
//! [`Link::run_loop`]. Other threads interact through a [`LinkInterface`],
//! which posts commands to the loop and wakes it.

mod interface;
mod socket;
mod tls;

pub use interface::LinkInterface;
pub use tls::TlsConfig;

use interface::LinkCommand;
use socket::{
    is_connect_failure, is_expected_disconnect, Connection, HandshakeProgress, Phase, RecvOutcome,
    Role, SendProgress,
};

use crate::config::{get_namespaced_f64, get_namespaced_usize};
use crate::error::Error;

use config::Config;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const WAKE_ID: usize = 2;
const TOKEN_RANGE_START: usize = 1000;

/// Default poll timeout for [`Link::run_loop`]; short enough to keep the
/// reconnection schedule responsive.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_RECV_BLOCK_SIZE: usize = 256 * 1024;
const DEFAULT_POLL_CAPACITY: usize = 64;

/// Opaque identifier for an established connection.
///
/// Stable for the lifetime of the connection and never reused within a
/// [`Link`]; address/port pairs are not unique enough across time for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
}

struct Connector {
    /// Token of the live socket for this address, if any. `None` between a
    /// failure and the next scheduled attempt.
    token: Option<Token>,
    tls: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<rustls::pki_types::ServerName<'static>>,
}

#[derive(Default)]
struct Callbacks {
    connect: Option<Box<dyn FnMut(ConnId) + Send>>,
    disconnect: Option<Box<dyn FnMut(ConnId) + Send>>,
    recv: Option<Box<dyn FnMut(ConnId, Vec<u8>) + Send>>,
    ready_to_send: Option<Box<dyn FnMut(ConnId, usize) + Send>>,
    loop_pass: Option<Box<dyn FnMut() + Send>>,
}

/// The socket reactor.
///
/// See the [module documentation](self) for the threading model. Callbacks
/// run on the loop thread and must not call back into the [`Link`]; they use
/// a [`LinkInterface`] to issue commands, which take effect on the next loop
/// iteration.
pub struct Link {
    poll: Poll,
    waker: Arc<Waker>,

    conns: HashMap<Token, Connection>,
    /// Established connections only; a conn id appears here exactly between
    /// its `on_connect` and `on_disconnect`.
    conn_tokens: HashMap<ConnId, Token>,
    /// Connections with a TLS handshake in flight.
    handshaking: HashSet<Token>,

    listeners: HashMap<Token, Listener>,
    listener_tokens: HashMap<SocketAddr, Token>,

    connectors: HashMap<SocketAddr, Connector>,
    reconnect_intervals: HashMap<SocketAddr, Duration>,
    /// Pending connect attempts, sorted by due time, at most one per address.
    planned_connects: Vec<(Instant, SocketAddr)>,

    callbacks: Callbacks,

    sender: Sender<LinkCommand>,
    receiver: Receiver<LinkCommand>,
    stop_requested: Arc<AtomicBool>,

    next_token: usize,
    last_conn_id: u64,

    reconnect_interval: Duration,
    recv_block_size: usize,
    poll_capacity: usize,
}

impl Link {
    /// Creates a link configured from the given configuration.
    ///
    /// Recognized keys (all optional): `reconnect_interval` (seconds, float),
    /// `recv_block_size` (bytes), `poll_capacity` (events per poll).
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a link using `{name}.{key}` configuration entries, falling
    /// back to the bare key when the namespaced one is absent.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let reconnect_interval = get_namespaced_f64(config, name, "reconnect_interval")
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL);
        let recv_block_size =
            get_namespaced_usize(config, name, "recv_block_size").unwrap_or(DEFAULT_RECV_BLOCK_SIZE);
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_ID))?);
        let (sender, receiver) = channel();

        debug!(
            name,
            ?reconnect_interval,
            recv_block_size,
            poll_capacity,
            "created link"
        );

        Ok(Self {
            poll,
            waker,
            conns: HashMap::new(),
            conn_tokens: HashMap::new(),
            handshaking: HashSet::new(),
            listeners: HashMap::new(),
            listener_tokens: HashMap::new(),
            connectors: HashMap::new(),
            reconnect_intervals: HashMap::new(),
            planned_connects: Vec::new(),
            callbacks: Callbacks::default(),
            sender,
            receiver,
            stop_requested: Arc::new(AtomicBool::new(false)),
            next_token: TOKEN_RANGE_START,
            last_conn_id: 0,
            reconnect_interval,
            recv_block_size,
            poll_capacity,
        })
    }

    // ============================================================================
    // Callbacks
    // ============================================================================

    /// Sets the callback fired once a connection becomes usable (after the
    /// TLS handshake, when one is configured).
    pub fn on_connect(&mut self, callback: impl FnMut(ConnId) + Send + 'static) {
        self.callbacks.connect = Some(Box::new(callback));
    }

    /// Sets the callback fired when an established connection goes away.
    ///
    /// Fires exactly once per `on_connect`, regardless of who closed or why.
    /// Connections that never became usable (failed connect or handshake) do
    /// not reach it.
    pub fn on_disconnect(&mut self, callback: impl FnMut(ConnId) + Send + 'static) {
        self.callbacks.disconnect = Some(Box::new(callback));
    }

    /// Sets the callback receiving incoming byte fragments.
    ///
    /// Fragments carry no message boundaries; the payload is never empty.
    pub fn on_recv(&mut self, callback: impl FnMut(ConnId, Vec<u8>) + Send + 'static) {
        self.callbacks.recv = Some(Box::new(callback));
    }

    /// Sets the callback fired when a send completes, with the total number
    /// of bytes delivered. Fires exactly once per [`Link::send`], never
    /// synchronously from within it.
    pub fn on_ready_to_send(&mut self, callback: impl FnMut(ConnId, usize) + Send + 'static) {
        self.callbacks.ready_to_send = Some(Box::new(callback));
    }

    /// Sets the callback fired after every loop iteration, for periodic work
    /// piggybacked on the poll timeout.
    pub fn on_loop_pass(&mut self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.loop_pass = Some(Box::new(callback));
    }

    // ============================================================================
    // Listener and Connector Registration
    // ============================================================================

    /// Starts listening on `addr`, optionally with TLS.
    ///
    /// Returns the actual bound address, which differs from the requested one
    /// when port 0 was asked for.
    #[instrument(skip(self, addr, tls))]
    pub fn add_listener<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        tls: Option<TlsConfig>,
    ) -> Result<SocketAddr, Error> {
        let requested = resolve_addr(addr)?;
        if self.listener_tokens.contains_key(&requested) {
            return Err(Error::ListenerAlreadyRegistered { address: requested });
        }
        let tls_config = match &tls {
            Some(cfg) => Some(cfg.build_server_config()?),
            None => None,
        };
        let mut listener = TcpListener::bind(requested)?;
        let local_addr = listener
            .local_addr()
            .expect("Failed to get local address");
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .expect("Failed to register listener");
        info!(%local_addr, tls = tls_config.is_some(), "listening for connections");
        self.listeners.insert(
            token,
            Listener {
                listener,
                local_addr,
                tls: tls_config,
            },
        );
        self.listener_tokens.insert(local_addr, token);
        Ok(local_addr)
    }

    /// Stops listening on `address`. Connections already accepted from it
    /// are not affected.
    #[instrument(skip(self))]
    pub fn remove_listener(&mut self, address: SocketAddr) -> Result<(), Error> {
        let token = self
            .listener_tokens
            .remove(&address)
            .ok_or(Error::ListenerNotFound { address })?;
        let mut entry = self
            .listeners
            .remove(&token)
            .expect("listener index out of sync");
        self.poll
            .registry()
            .deregister(&mut entry.listener)
            .expect("Failed to deregister listener");
        info!(local_addr = %entry.local_addr, "closed listener");
        Ok(())
    }

    /// Registers a persistent outbound connection to `addr`.
    ///
    /// The link keeps one connection to the address alive for as long as the
    /// connector is registered, retrying every `reconnect_interval` after a
    /// failure or a closure. The first attempt happens on the next loop pass.
    #[instrument(skip(self, addr, reconnect_interval, tls))]
    pub fn add_connector<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        reconnect_interval: Option<Duration>,
        tls: Option<TlsConfig>,
    ) -> Result<SocketAddr, Error> {
        let address = resolve_addr(addr)?;
        if self.connectors.contains_key(&address) {
            return Err(Error::ConnectorAlreadyRegistered { address });
        }
        let (tls_config, server_name) = match &tls {
            Some(cfg) => (
                Some(cfg.build_client_config()?),
                Some(cfg.server_name(address)?),
            ),
            None => (None, None),
        };
        let interval = reconnect_interval.unwrap_or(self.reconnect_interval);
        info!(%address, ?interval, tls = tls_config.is_some(), "adding connector");
        self.connectors.insert(
            address,
            Connector {
                token: None,
                tls: tls_config,
                server_name,
            },
        );
        self.reconnect_intervals.insert(address, interval);
        self.plan_connect(Instant::now(), address);
        Ok(address)
    }

    /// Unregisters the connector for `address`, closing its live connection
    /// and cancelling any scheduled reconnect.
    #[instrument(skip(self))]
    pub fn remove_connector(&mut self, address: SocketAddr) -> Result<(), Error> {
        let connector = self
            .connectors
            .remove(&address)
            .ok_or(Error::ConnectorNotFound { address })?;
        self.reconnect_intervals.remove(&address);
        self.planned_connects.retain(|(_, a)| *a != address);
        if let Some(token) = connector.token {
            // the connector entry is gone, so no reconnect gets planned
            self.handle_close(token);
        }
        info!(%address, "removed connector");
        Ok(())
    }

    /// Addresses of all active listeners.
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.listeners.values().map(|l| l.local_addr).collect()
    }

    // ============================================================================
    // Connection Operations
    // ============================================================================

    /// Queues `data` for sending on a connection and flushes what the socket
    /// accepts immediately.
    ///
    /// Completion is reported asynchronously through `on_ready_to_send` with
    /// the total size, once the whole payload has been handed to the
    /// transport; a second `send` before that fails with
    /// [`Error::SendNotFinished`]. Sends to an unknown conn id are dropped
    /// with a warning, as the connection may have legitimately gone away.
    #[instrument(skip(self, data))]
    pub fn send(&mut self, conn_id: ConnId, data: Vec<u8>) -> Result<(), Error> {
        let Some(token) = self.conn_tokens.get(&conn_id).copied() else {
            warn!(%conn_id, len = data.len(), "send to unknown connection, dropping data");
            return Ok(());
        };
        let flush = {
            let conn = self
                .conns
                .get_mut(&token)
                .expect("connection index out of sync");
            if conn.queue_send(data).is_err() {
                return Err(Error::SendNotFinished { conn_id });
            }
            debug!(%conn_id, "queued data for sending");
            conn.flush_send()
        };
        match flush {
            // completion is always reported from the loop, never from here,
            // so keep watching for writability even when the buffer drained
            Ok(_) => {
                self.set_interest(token, Interest::READABLE | Interest::WRITABLE);
                Ok(())
            }
            Err(err) if is_expected_disconnect(&err) => {
                warn!(%conn_id, ?err, "peer gone during send");
                self.handle_close(token);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Closes a connection. Unknown ids are ignored, so closing twice or
    /// racing a peer-initiated closure is harmless.
    #[instrument(skip(self))]
    pub fn close(&mut self, conn_id: ConnId) {
        match self.conn_tokens.get(&conn_id).copied() {
            Some(token) => self.handle_close(token),
            None => debug!(%conn_id, "close on unknown connection id"),
        }
    }

    // ============================================================================
    // Event Loop
    // ============================================================================

    /// Runs the event loop.
    ///
    /// `max_events` bounds the number of loop passes that dispatched at
    /// least one readiness event, `max_runtime` bounds the wall-clock
    /// duration; `None` means unbounded. Returns when a bound is reached or
    /// [`LinkInterface::stop`] is observed. Errors returned from here are
    /// fatal for the reactor.
    #[instrument(skip(self))]
    pub fn run_loop(
        &mut self,
        poll_timeout: Duration,
        max_events: Option<usize>,
        max_runtime: Option<Duration>,
    ) -> Result<(), Error> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let mut rounds_left = max_events;
        let mut events = Events::with_capacity(self.poll_capacity);

        // catch up on due connect attempts before the first poll
        self.deal_connects()?;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!("event loop stop requested");
                break;
            }
            if rounds_left == Some(0) {
                break;
            }
            if let Some(max_runtime) = max_runtime {
                if started.elapsed() >= max_runtime {
                    break;
                }
            }

            self.process_commands()?;

            if let Err(err) = self.poll.poll(&mut events, Some(poll_timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let had_events = !events.is_empty();
            for event in events.iter() {
                self.handle_event(
                    event.token(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                )?;
            }

            if let Some(callback) = self.callbacks.loop_pass.as_mut() {
                callback();
            }

            if had_events {
                if let Some(n) = rounds_left.as_mut() {
                    *n -= 1;
                }
            }

            self.deal_connects()?;
        }
        Ok(())
    }

    /// Requests the loop to stop at the top of its next iteration. For other
    /// threads use [`LinkInterface::stop`], which also wakes the poll.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Interrupts a blocking poll.
    pub fn wakeup(&self) {
        self.waker.wake().expect("Failed to wake event loop");
    }

    /// Returns a cloneable handle for driving this link from other threads.
    pub fn interface(&self) -> LinkInterface {
        LinkInterface {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
            stop_requested: self.stop_requested.clone(),
        }
    }

    /// Closes everything: connectors, listeners and all open connections.
    ///
    /// `on_disconnect` fires for every established connection. After this
    /// the link holds no sockets and no scheduled work.
    #[instrument(skip(self))]
    pub fn cleanup(&mut self) {
        for address in self.connectors.keys().copied().collect::<Vec<_>>() {
            self.remove_connector(address)
                .expect("connector index out of sync");
        }
        for address in self.listener_tokens.keys().copied().collect::<Vec<_>>() {
            self.remove_listener(address)
                .expect("listener index out of sync");
        }
        for token in self.conns.keys().copied().collect::<Vec<_>>() {
            self.handle_close(token);
        }
        assert!(self.conns.is_empty());
        assert!(self.conn_tokens.is_empty());
        assert!(self.handshaking.is_empty());
        assert!(self.listeners.is_empty());
        assert!(self.listener_tokens.is_empty());
        assert!(self.connectors.is_empty());
        assert!(self.reconnect_intervals.is_empty());
        assert!(self.planned_connects.is_empty());
    }

    // ============================================================================
    // Internal Event Processing
    // ============================================================================

    /// Drains commands posted from other threads, ahead of readiness
    /// dispatch so cross-thread sends keep their ordering relative to it.
    fn process_commands(&mut self) -> Result<(), Error> {
        loop {
            let command = match self.receiver.try_recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            match command {
                LinkCommand::Send { conn_id, data } => match self.send(conn_id, data) {
                    Ok(()) => {}
                    Err(Error::SendNotFinished { conn_id }) => {
                        error!(%conn_id, "cross-thread send while previous send unfinished, dropping data");
                    }
                    Err(err) => return Err(err),
                },
                LinkCommand::Close { conn_id } => self.close(conn_id),
            }
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        errored: bool,
    ) -> Result<(), Error> {
        if token == Token(WAKE_ID) {
            // wake events carry no payload; commands are drained at the top
            // of the iteration
            return Ok(());
        }
        if self.listeners.contains_key(&token) {
            if readable {
                self.handle_accept(token)?;
            }
            return Ok(());
        }
        if !self.conns.contains_key(&token) {
            // closed earlier in this readiness batch
            return Ok(());
        }
        if errored {
            return self.handle_sock_err(token);
        }
        if self.handshaking.contains(&token) {
            return self.drive_handshake(token);
        }
        if writable {
            match self.conns.get(&token).map(|c| c.phase) {
                Some(Phase::Connecting) => self.handle_connect_ready(token)?,
                Some(_) => self.handle_ready_to_send(token)?,
                None => return Ok(()),
            }
        }
        if readable {
            // the writable half may have closed the connection or moved it
            // into a handshake
            if self.conns.get(&token).map(|c| c.phase) == Some(Phase::Established) {
                self.handle_recv(token)?;
            }
        }
        Ok(())
    }

    /// An error readiness event. For in-flight connects the real verdict
    /// comes from `SO_ERROR` in [`Link::handle_connect_ready`]; anything
    /// else is an ordinary closure.
    fn handle_sock_err(&mut self, token: Token) -> Result<(), Error> {
        match self.conns.get(&token).map(|c| c.phase) {
            Some(Phase::Connecting) => self.handle_connect_ready(token),
            Some(_) => {
                debug!("error event on connection, closing");
                self.handle_close(token);
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[instrument(skip(self))]
    fn handle_accept(&mut self, listener_token: Token) -> Result<(), Error> {
        // collect first so the listener borrow stays short
        let (accepted, tls_config) = {
            let entry = self
                .listeners
                .get_mut(&listener_token)
                .expect("listener index out of sync");
            let mut accepted = Vec::new();
            loop {
                match entry.listener.accept() {
                    Ok((stream, peer_addr)) => accepted.push((stream, peer_addr)),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err)
                        if matches!(
                            err.kind(),
                            ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                        ) =>
                    {
                        // the peer vanished between the kernel queue and us
                        warn!(local_addr = %entry.local_addr, ?err, "transient accept error");
                        continue;
                    }
                    Err(err) => {
                        error!(local_addr = %entry.local_addr, ?err, "error accepting connection");
                        return Err(err.into());
                    }
                }
            }
            (accepted, entry.tls.clone())
        };

        for (mut stream, peer_addr) in accepted {
            stream.set_nodelay(true)?;
            let token = self.alloc_token();
            let conn_id = self.next_conn_id();
            let local_addr = stream
                .local_addr()
                .expect("Failed to get local address");
            info!(%conn_id, %local_addr, %peer_addr, "accepted connection");
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
                .expect("Failed to register connection");
            let mut conn = Connection::new(
                stream,
                Role::Accepted,
                Phase::Established,
                Interest::READABLE,
                local_addr,
                peer_addr,
            );
            conn.conn_id = Some(conn_id);
            if let Some(cfg) = tls_config.clone() {
                let session = rustls::ServerConnection::new(cfg)
                    .map_err(|err| Error::TlsServerConfigBuild(err.to_string()))?;
                conn.tls = Some(rustls::Connection::from(session));
                conn.phase = Phase::Handshaking;
                self.conns.insert(token, conn);
                self.handshaking.insert(token);
                self.drive_handshake(token)?;
            } else {
                self.conns.insert(token, conn);
                self.conn_tokens.insert(conn_id, token);
                self.fire_connect(conn_id);
            }
        }
        Ok(())
    }

    /// Writability on a connecting socket: the non-blocking connect has
    /// finished, one way or the other.
    #[instrument(skip(self))]
    fn handle_connect_ready(&mut self, token: Token) -> Result<(), Error> {
        enum Verdict {
            Connected,
            Refused,
            Fatal(std::io::Error),
        }

        let (address, verdict) = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            let Role::Connector { address } = conn.role else {
                // only connectors sit in the connecting phase
                return Ok(());
            };
            let verdict = match conn.stream.take_error()? {
                None => Verdict::Connected,
                Some(err) if is_connect_failure(err.kind()) => {
                    info!(local_addr = %conn.local_addr, peer_addr = %conn.peer_addr, ?err, "connection attempt failed");
                    Verdict::Refused
                }
                Some(err) => Verdict::Fatal(err),
            };
            (address, verdict)
        };
        match verdict {
            Verdict::Connected => {}
            Verdict::Refused => {
                self.handle_conn_refused(token);
                return Ok(());
            }
            Verdict::Fatal(err) => return Err(err.into()),
        }

        // the connector may have been removed while the attempt was in flight
        let tls_session = match self.connectors.get(&address) {
            Some(connector) => match (&connector.tls, &connector.server_name) {
                (Some(cfg), Some(name)) => {
                    let session = rustls::ClientConnection::new(cfg.clone(), name.clone())
                        .map_err(|err| Error::TlsClientConfigBuild(err.to_string()))?;
                    Some(rustls::Connection::from(session))
                }
                _ => None,
            },
            None => None,
        };

        let conn_id = self.next_conn_id();
        let use_tls = tls_session.is_some();
        {
            let conn = self
                .conns
                .get_mut(&token)
                .expect("connection index out of sync");
            conn.conn_id = Some(conn_id);
            info!(%conn_id, local_addr = %conn.local_addr, peer_addr = %conn.peer_addr, "connection established");
            if let Some(session) = tls_session {
                conn.tls = Some(session);
                conn.phase = Phase::Handshaking;
            } else {
                conn.phase = Phase::Established;
            }
        }

        if use_tls {
            self.handshaking.insert(token);
            self.drive_handshake(token)
        } else {
            self.set_interest(token, Interest::READABLE);
            self.conn_tokens.insert(conn_id, token);
            self.fire_connect(conn_id);
            Ok(())
        }
    }

    fn drive_handshake(&mut self, token: Token) -> Result<(), Error> {
        let progress = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            conn.step_handshake()
        };
        match progress {
            Ok(HandshakeProgress::InProgress(interest)) => {
                self.set_interest(token, interest);
                Ok(())
            }
            Ok(HandshakeProgress::Done) => self.finalize_handshake(token),
            Ok(HandshakeProgress::Failed) => {
                // never reached on_connect, so no on_disconnect either
                warn!("TLS handshake failed, closing connection");
                self.handle_close(token);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn finalize_handshake(&mut self, token: Token) -> Result<(), Error> {
        self.handshaking.remove(&token);
        let conn_id = {
            let conn = self
                .conns
                .get_mut(&token)
                .expect("connection index out of sync");
            conn.phase = Phase::Established;
            conn.conn_id
                .expect("established connection must have an id")
        };
        self.set_interest(token, Interest::READABLE);
        self.conn_tokens.insert(conn_id, token);
        info!(%conn_id, "TLS handshake completed");
        self.fire_connect(conn_id);
        // application data may have arrived in the same flight as the final
        // handshake record
        self.handle_recv(token)
    }

    #[instrument(skip(self))]
    fn handle_ready_to_send(&mut self, token: Token) -> Result<(), Error> {
        let finished = match self.conns.get(&token) {
            Some(conn) => conn.send_finished(),
            None => return Ok(()),
        };
        if finished {
            // nothing pending; stop watching for writability
            self.set_interest(token, Interest::READABLE);
            return Ok(());
        }
        let flush = {
            let conn = self
                .conns
                .get_mut(&token)
                .expect("connection index out of sync");
            conn.flush_send()
        };
        match flush {
            Ok(SendProgress::Done) => {
                let (conn_id, sent) = {
                    let conn = self
                        .conns
                        .get_mut(&token)
                        .expect("connection index out of sync");
                    (conn.conn_id, conn.finish_send())
                };
                self.set_interest(token, Interest::READABLE);
                if let Some(conn_id) = conn_id {
                    debug!(%conn_id, len = sent, "send finished");
                    self.fire_ready_to_send(conn_id, sent);
                }
                Ok(())
            }
            Ok(SendProgress::Pending) => {
                self.set_interest(token, Interest::READABLE | Interest::WRITABLE);
                Ok(())
            }
            Err(err) if is_expected_disconnect(&err) => {
                warn!(?err, "peer gone during send, closing connection");
                self.handle_close(token);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    fn handle_recv(&mut self, token: Token) -> Result<(), Error> {
        let recv_block_size = self.recv_block_size;
        let (outcome, conn_id) = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            (conn.recv(recv_block_size), conn.conn_id)
        };
        match outcome {
            Ok(RecvOutcome::Data { data, closed }) => {
                if let Some(conn_id) = conn_id {
                    debug!(%conn_id, len = data.len(), "received data");
                    self.fire_recv(conn_id, data);
                }
                if closed {
                    debug!("connection closed by peer");
                    self.handle_close(token);
                }
                Ok(())
            }
            Ok(RecvOutcome::Closed) => {
                debug!("connection closed by peer");
                self.handle_close(token);
                Ok(())
            }
            Ok(RecvOutcome::NotReady) => Ok(()),
            // InvalidData is the TLS layer rejecting the stream
            Err(err)
                if is_expected_disconnect(&err) || err.kind() == ErrorKind::InvalidData =>
            {
                warn!(?err, "receive failed, closing connection");
                self.handle_close(token);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A refused/unreachable connect attempt: drop the socket without any
    /// callback and schedule the next attempt.
    fn handle_conn_refused(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.handshaking.remove(&token);
        self.poll
            .registry()
            .deregister(&mut conn.stream)
            .expect("Failed to deregister connection");
        let Role::Connector { address } = conn.role else {
            return;
        };
        match self.connectors.get_mut(&address) {
            Some(connector) => connector.token = None,
            None => return,
        }
        let interval = self
            .reconnect_intervals
            .get(&address)
            .copied()
            .unwrap_or(self.reconnect_interval);
        debug!(%address, ?interval, "scheduling reconnect");
        self.plan_connect(Instant::now() + interval, address);
    }

    /// Tears down a connection for any reason: peer closure, local `close`,
    /// handshake failure or cleanup.
    ///
    /// `on_disconnect` fires only for connections that were established.
    /// Connector sockets get a reconnect scheduled as long as their
    /// connector is still registered.
    #[instrument(skip(self))]
    fn handle_close(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.handshaking.remove(&token);
        self.poll
            .registry()
            .deregister(&mut conn.stream)
            .expect("Failed to deregister connection");
        let _ = conn.stream.shutdown(Shutdown::Both);

        if conn.phase == Phase::Established {
            if let Some(conn_id) = conn.conn_id {
                self.conn_tokens.remove(&conn_id);
                info!(%conn_id, local_addr = %conn.local_addr, peer_addr = %conn.peer_addr, "disconnected");
                self.fire_disconnect(conn_id);
            }
        }

        if let Role::Connector { address } = conn.role {
            if let Some(connector) = self.connectors.get_mut(&address) {
                connector.token = None;
            } else {
                return;
            }
            let interval = self
                .reconnect_intervals
                .get(&address)
                .copied()
                .unwrap_or(self.reconnect_interval);
            debug!(%address, ?interval, "scheduling reconnect");
            self.plan_connect(Instant::now() + interval, address);
        }
    }

    // ============================================================================
    // Reconnection Scheduler
    // ============================================================================

    fn plan_connect(&mut self, when: Instant, address: SocketAddr) {
        // at most one scheduled attempt per address
        self.planned_connects.retain(|(_, a)| *a != address);
        let idx = self.planned_connects.partition_point(|(w, _)| *w <= when);
        self.planned_connects.insert(idx, (when, address));
    }

    /// Launches every connect attempt whose due time has passed.
    fn deal_connects(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        let due = self.planned_connects.partition_point(|(when, _)| *when <= now);
        if due == 0 {
            return Ok(());
        }
        let addresses: Vec<SocketAddr> = self
            .planned_connects
            .drain(..due)
            .map(|(_, address)| address)
            .collect();
        for address in addresses {
            self.connect_address(address)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn connect_address(&mut self, address: SocketAddr) -> Result<(), Error> {
        if !self.connectors.contains_key(&address) {
            return Ok(());
        }
        let mut stream = match TcpStream::connect(address) {
            Ok(stream) => stream,
            Err(err) if is_connect_failure(err.kind()) => {
                info!(%address, ?err, "connection attempt failed");
                let interval = self
                    .reconnect_intervals
                    .get(&address)
                    .copied()
                    .unwrap_or(self.reconnect_interval);
                self.plan_connect(Instant::now() + interval, address);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        stream.set_nodelay(true)?;
        let token = self.alloc_token();
        let local_addr = stream
            .local_addr()
            .expect("Failed to get local address");
        debug!(%local_addr, peer_addr = %address, "initiating connection");
        self.poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)
            .expect("Failed to register connection");
        self.conns.insert(
            token,
            Connection::new(
                stream,
                Role::Connector { address },
                Phase::Connecting,
                Interest::WRITABLE,
                local_addr,
                address,
            ),
        );
        if let Some(connector) = self.connectors.get_mut(&address) {
            connector.token = Some(token);
        }
        Ok(())
    }

    // ============================================================================
    // Helpers
    // ============================================================================

    fn alloc_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self
                .next_token
                .checked_add(1)
                .unwrap_or(TOKEN_RANGE_START);
            if !self.conns.contains_key(&token) && !self.listeners.contains_key(&token) {
                return token;
            }
        }
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.last_conn_id += 1;
        ConnId(self.last_conn_id)
    }

    fn set_interest(&mut self, token: Token, interest: Interest) {
        if let Some(conn) = self.conns.get_mut(&token) {
            if conn.interest != interest {
                conn.interest = interest;
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, token, interest)
                    .expect("Failed to reregister connection");
            }
        }
    }

    fn fire_connect(&mut self, conn_id: ConnId) {
        if let Some(callback) = self.callbacks.connect.as_mut() {
            callback(conn_id);
        }
    }

    fn fire_disconnect(&mut self, conn_id: ConnId) {
        if let Some(callback) = self.callbacks.disconnect.as_mut() {
            callback(conn_id);
        }
    }

    fn fire_recv(&mut self, conn_id: ConnId, data: Vec<u8>) {
        if let Some(callback) = self.callbacks.recv.as_mut() {
            callback(conn_id, data);
        }
    }

    fn fire_ready_to_send(&mut self, conn_id: ConnId, size: usize) {
        if let Some(callback) = self.callbacks.ready_to_send.as_mut() {
            callback(conn_id, size);
        }
    }
}

fn resolve_addr<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)
}
