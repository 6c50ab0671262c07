//! Single-threaded, readiness-driven proxy loop.
//!
//! One iteration ([`ProxyLoop::run_once`]):
//!
//! 1. wait on the poller for listeners, accepted connections, the local input
//!    and every destination with queued output;
//! 2. readable dispatch: accept peers, receive peer data, read input lines;
//! 3. writable dispatch: flush queued messages to ready destinations;
//! 4. exceptional dispatch: tear down anything the poller flagged as failed;
//! 5. pacing: sleep for the adaptive delay, then double it.
//!
//! mio is edge-triggered, so every readable source is drained until it would
//! block and every writable destination is flushed until it would block or
//! its queue runs dry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use super::endpoint::{LocalInput, LocalOutput, Readiness};
use super::error::{ProxyError, ProxyResult};
use super::listener::{AcceptOutcome, ChannelListener, Connection, ConnectionId, ConnectionIds, ConnectionRegistry};
use super::queue::{Dequeued, Destination, OutboundQueues};
use super::{Delay, LoopConfig, PendingInput, Role};

/// Bytes taken from a peer socket per receive call; each chunk becomes one
/// queued message.
pub const RECV_CHUNK: usize = 1024;

/// Every this many buffered lines without a STDIN peer, say so at `warn!`.
pub(crate) const BACKLOG_WARN_LINES: usize = 1024;

const WAKER_TOKEN: Token = Token(0);
const LOCAL_INPUT_TOKEN: Token = Token(10);

fn listener_token(role: Role) -> Token {
    Token(1 + role.index())
}

fn local_output_token(role: Role) -> Token {
    Token(11 + role.index())
}

/// Every kind of handle the loop waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Waker,
    Listener(Role),
    Connection(ConnectionId),
    LocalInput,
    LocalOutput(Role),
}

fn classify(token: Token) -> Option<Source> {
    if token == WAKER_TOKEN {
        return Some(Source::Waker);
    }
    if token == LOCAL_INPUT_TOKEN {
        return Some(Source::LocalInput);
    }
    if token.0 >= super::listener::CONNECTION_ID_RANGE_START {
        return Some(Source::Connection(ConnectionId(token.0)));
    }
    Role::ALL.into_iter().find_map(|role| {
        if token == listener_token(role) {
            Some(Source::Listener(role))
        } else if token == local_output_token(role) {
            Some(Source::LocalOutput(role))
        } else {
            None
        }
    })
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Shutdown was requested or nothing is left to wait on.
    Finished,
}

/// Cloneable, thread-safe handle that stops a running [`ProxyLoop`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to stop at its next iteration boundary.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake proxy loop");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct ProxyLoop {
    poll: Poll,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    config: LoopConfig,
    delay: Delay,

    listeners: HashMap<Role, ChannelListener>,
    registry: ConnectionRegistry,
    ids: ConnectionIds,
    connections: HashMap<ConnectionId, Connection>,
    input: Option<LocalInput>,
    input_eof: bool,
    local_outputs: HashMap<Role, LocalOutput>,

    outputs: HashSet<Destination>,
    queues: OutboundQueues,
    backlog: VecDeque<Vec<u8>>,
    write_shut: HashSet<ConnectionId>,
}

impl std::fmt::Debug for ProxyLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLoop")
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Setup
// ============================================================================

impl ProxyLoop {
    pub fn new(config: LoopConfig) -> ProxyResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let delay = Delay::new(config.delay_min, config.delay_max);
        Ok(Self {
            poll,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            delay,
            listeners: HashMap::new(),
            registry: ConnectionRegistry::new(),
            ids: ConnectionIds::default(),
            connections: HashMap::new(),
            input: None,
            input_eof: false,
            local_outputs: HashMap::new(),
            outputs: HashSet::new(),
            queues: OutboundQueues::new(),
            backlog: VecDeque::new(),
            write_shut: HashSet::new(),
        })
    }

    /// Attach the STDIN listener together with the local input it feeds.
    pub fn add_input_channel(&mut self, mut listener: ChannelListener, mut input: LocalInput) -> ProxyResult<()> {
        if listener.role() != Role::Stdin {
            return Err(ProxyError::RoleMismatch {
                role: listener.role(),
                endpoint: "the local input",
            });
        }
        self.register_listener(&mut listener)?;
        input
            .register(self.poll.registry(), LOCAL_INPUT_TOKEN)
            .map_err(|source| ProxyError::Register {
                what: input.name().to_string(),
                source,
            })?;
        info!(endpoint = input.name(), readiness = ?input.readiness(), "Local input attached");
        self.listeners.insert(listener.role(), listener);
        self.input = Some(input);
        self.input_eof = false;
        Ok(())
    }

    /// Attach a STDOUT or STDERR listener together with the local output it
    /// writes to.
    pub fn add_output_channel(&mut self, mut listener: ChannelListener, output: LocalOutput) -> ProxyResult<()> {
        if listener.role() == Role::Stdin {
            return Err(ProxyError::RoleMismatch {
                role: Role::Stdin,
                endpoint: "a local output",
            });
        }
        self.register_listener(&mut listener)?;
        let role = listener.role();
        info!(%role, endpoint = output.name(), "Local output attached");
        self.listeners.insert(role, listener);
        self.local_outputs.insert(role, output);
        Ok(())
    }

    fn register_listener(&mut self, listener: &mut ChannelListener) -> ProxyResult<()> {
        let token = listener_token(listener.role());
        self.poll
            .registry()
            .register(listener.source_mut(), token, Interest::READABLE)
            .map_err(|source| ProxyError::Register {
                what: format!("{} listener", listener.role()),
                source,
            })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl ProxyLoop {
    pub fn listener(&self, role: Role) -> Option<&ChannelListener> {
        self.listeners.get(&role)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn queues(&self) -> &OutboundQueues {
        &self.queues
    }

    pub fn delay(&self) -> &Delay {
        &self.delay
    }

    /// Whether `dest` is currently watched for writability.
    pub fn is_output(&self, dest: Destination) -> bool {
        self.outputs.contains(&dest)
    }

    /// Whether `id` is still an open connection watched for input.
    pub fn is_input_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Lines read before any STDIN peer connected, waiting for one.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn input_active(&self) -> bool {
        self.input.is_some() && !self.input_eof
    }

    fn has_inputs(&self) -> bool {
        !self.listeners.is_empty() || !self.connections.is_empty() || self.input_active()
    }

    // Work that the poller will never announce: always-ready endpoints.
    fn has_unpolled_work(&self) -> bool {
        let input_ready = self.input_active()
            && self
                .input
                .as_ref()
                .is_some_and(|i| i.readiness() == Readiness::AlwaysReady);
        input_ready
            || self.outputs.iter().any(|dest| match dest {
                Destination::Local(role) => self
                    .local_outputs
                    .get(role)
                    .is_some_and(|o| o.readiness() == Readiness::AlwaysReady),
                Destination::Connection(_) => false,
            })
    }
}

// ============================================================================
// Main loop
// ============================================================================

impl ProxyLoop {
    /// Run until shutdown is requested or every input has gone away.
    pub fn run(&mut self) -> ProxyResult<()> {
        info!("Proxy loop started");
        while self.run_once()? == Step::Continue {}
        self.close_all();
        info!("Proxy loop finished");
        Ok(())
    }

    /// Run a single iteration.
    pub fn run_once(&mut self) -> ProxyResult<Step> {
        if self.shutdown.load(Ordering::SeqCst) || !self.has_inputs() {
            return Ok(Step::Finished);
        }

        let timeout = if self.has_unpolled_work() {
            Some(Duration::ZERO)
        } else {
            self.config.wait_timeout
        };

        trace!(?timeout, "Waiting for the next event");
        let mut events = Events::with_capacity(self.config.events_capacity);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        let mut exceptional = Vec::new();
        for event in events.iter() {
            let Some(source) = classify(event.token()) else {
                warn!(token = event.token().0, "Event for unknown token");
                continue;
            };
            if source == Source::Waker {
                continue;
            }
            if event.is_error() {
                exceptional.push(source);
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                readable.push(source);
            }
            if event.is_writable() || event.is_write_closed() {
                match source {
                    Source::Connection(id) => writable.push(Destination::Connection(id)),
                    Source::LocalOutput(role) => writable.push(Destination::Local(role)),
                    _ => {}
                }
            }
        }

        if self.input_active()
            && self.input.as_ref().is_some_and(|i| i.readiness() == Readiness::AlwaysReady)
        {
            readable.push(Source::LocalInput);
        }
        for dest in &self.outputs {
            if let Destination::Local(role) = dest {
                let always = self
                    .local_outputs
                    .get(role)
                    .is_some_and(|o| o.readiness() == Readiness::AlwaysReady);
                if always && !writable.contains(dest) {
                    writable.push(*dest);
                }
            }
        }

        for source in readable {
            self.handle_readable(source);
        }
        for dest in writable {
            self.handle_writable(dest);
        }
        for source in exceptional {
            self.handle_exceptional(source);
        }

        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(Step::Finished);
        }

        self.delay.sleep();
        self.delay.advance();
        Ok(Step::Continue)
    }

    fn activity(&mut self) {
        self.delay.reset_to(Duration::ZERO);
    }
}

// ============================================================================
// Readable dispatch
// ============================================================================

impl ProxyLoop {
    fn handle_readable(&mut self, source: Source) {
        match source {
            Source::Listener(role) => self.accept_peers(role),
            Source::Connection(id) => self.receive_from_peer(id),
            Source::LocalInput => self.read_local_input(),
            Source::Waker | Source::LocalOutput(_) => {}
        }
    }

    fn accept_peers(&mut self, role: Role) {
        loop {
            let Some(listener) = self.listeners.get_mut(&role) else {
                return;
            };
            let outcome = match listener.accept(&mut self.registry, &mut self.ids) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(%role, ?err, "Error accepting connection");
                    return;
                }
            };
            match outcome {
                AcceptOutcome::WouldBlock => return,
                AcceptOutcome::Rejected(_) => continue,
                AcceptOutcome::Accepted(conn) => self.install_connection(conn),
            }
        }
    }

    fn install_connection(&mut self, mut conn: Connection) {
        let id = conn.id;
        let role = conn.role;
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut conn.stream, id.token(), Interest::READABLE)
        {
            error!(%role, %id, ?err, "Failed to register connection, closing it");
            if let Some(listener) = self.listeners.get_mut(&role) {
                listener.remove_connection(&mut self.registry, id);
            }
            return;
        }

        match role {
            Role::Stdin => {
                info!(peer = %conn.peer_addr, %id, "New reverse connection");
                self.connections.insert(id, conn);
                let dest = Destination::Connection(id);
                self.queues.open(dest);
                if !self.backlog.is_empty() {
                    debug!(%id, lines = self.backlog.len(), "Delivering buffered input");
                    for line in self.backlog.drain(..) {
                        self.queues.enqueue(dest, line);
                    }
                }
                if self.queues.has_pending(dest) || self.input_eof {
                    self.watch_output(dest);
                }
            }
            Role::Stdout | Role::Stderr => {
                info!(%role, peer = %conn.peer_addr, %id, "New connection");
                self.connections.insert(id, conn);
                self.queues.open(Destination::Local(role));
            }
        }
        self.activity();
    }

    fn receive_from_peer(&mut self, id: ConnectionId) {
        let Some(role) = self.registry.owner(id) else {
            return;
        };
        let mut buf = [0u8; RECV_CHUNK];
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    info!(%role, peer = %conn.peer_addr, %id, "Closing after reading no data");
                    self.teardown_connection(id);
                    return;
                }
                Ok(n) if role == Role::Stdin => {
                    warn!(peer = %conn.peer_addr, %id, len = n, "Data received on stdin channel, ignored");
                }
                Ok(n) => {
                    debug!(%role, %id, len = n, data = %String::from_utf8_lossy(&buf[..n]).escape_debug(), "Received");
                    let dest = Destination::Local(role);
                    if !self.local_outputs.contains_key(&role) {
                        warn!(%role, len = n, "Local output is gone, dropping data");
                        continue;
                    }
                    self.queues.enqueue(dest, buf[..n].to_vec());
                    self.watch_output(dest);
                    self.activity();
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Torn down exactly like an orderly close, but logged apart.
                    warn!(%role, peer = %conn.peer_addr, %id, ?err, "Read error, closing connection");
                    self.teardown_connection(id);
                    return;
                }
            }
        }
    }

    fn read_local_input(&mut self) {
        if !self.input_active() {
            return;
        }
        let Some(input) = self.input.as_mut() else {
            return;
        };
        let lines = match input.read_lines() {
            Ok(lines) => lines,
            Err(err) => {
                error!(endpoint = input.name(), ?err, "Error reading local input");
                self.close_local_input();
                return;
            }
        };
        let eof = input.is_eof();
        let name = input.name().to_string();

        let peer = self
            .listeners
            .get(&Role::Stdin)
            .and_then(ChannelListener::connection)
            .filter(|id| self.connections.contains_key(id));

        for line in lines {
            match peer {
                Some(id) => {
                    debug!(endpoint = %name, %id, len = line.len(), "Read data from local input");
                    let dest = Destination::Connection(id);
                    self.queues.enqueue(dest, line);
                    self.watch_output(dest);
                    self.activity();
                }
                None => match self.config.pending_input {
                    PendingInput::Buffer => {
                        debug!(endpoint = %name, len = line.len(), "No stdin peer yet, buffering line");
                        self.backlog.push_back(line);
                        if self.backlog.len() % BACKLOG_WARN_LINES == 0 {
                            warn!(
                                endpoint = %name,
                                lines = self.backlog.len(),
                                "Still no stdin peer, buffered input keeps growing"
                            );
                        }
                    }
                    PendingInput::Drop => {
                        warn!(endpoint = %name, len = line.len(), "No stdin peer yet, dropping line");
                    }
                },
            }
        }

        if eof {
            self.close_local_input();
            // Let the peer see end of input once its queue drains.
            if let Some(id) = peer {
                self.watch_output(Destination::Connection(id));
            }
        }
    }

    fn close_local_input(&mut self) {
        if let Some(input) = self.input.as_mut() {
            input.deregister(self.poll.registry());
            info!(endpoint = input.name(), "Local input closed");
        }
        self.input_eof = true;
    }
}

// ============================================================================
// Writable dispatch
// ============================================================================

impl ProxyLoop {
    fn watch_output(&mut self, dest: Destination) {
        if self.outputs.contains(&dest) {
            return;
        }
        let result = match dest {
            Destination::Local(role) => match self.local_outputs.get_mut(&role) {
                Some(out) => out.watch_writable(self.poll.registry(), local_output_token(role)),
                None => return,
            },
            Destination::Connection(id) => match self.connections.get_mut(&id) {
                Some(conn) => self.poll.registry().reregister(
                    &mut conn.stream,
                    id.token(),
                    Interest::READABLE | Interest::WRITABLE,
                ),
                None => return,
            },
        };
        match result {
            Ok(()) => {
                self.outputs.insert(dest);
            }
            Err(err) => error!(%dest, ?err, "Failed to watch for writability"),
        }
    }

    fn unwatch_output(&mut self, dest: Destination) {
        if !self.outputs.remove(&dest) {
            return;
        }
        match dest {
            Destination::Local(role) => {
                if let Some(out) = self.local_outputs.get_mut(&role) {
                    out.unwatch(self.poll.registry());
                }
            }
            Destination::Connection(id) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if let Err(err) =
                        self.poll
                            .registry()
                            .reregister(&mut conn.stream, id.token(), Interest::READABLE)
                    {
                        warn!(%id, ?err, "Failed to drop write interest");
                    }
                }
            }
        }
    }

    fn handle_writable(&mut self, dest: Destination) {
        if !self.outputs.contains(&dest) {
            return;
        }
        loop {
            let msg = match self.queues.dequeue_nowait(dest) {
                Dequeued::Message(msg) => msg,
                Dequeued::Empty | Dequeued::Missing => {
                    debug!(%dest, "Output queue is empty");
                    self.unwatch_output(dest);
                    self.after_drain(dest);
                    return;
                }
            };

            trace!(%dest, data = %String::from_utf8_lossy(&msg).escape_debug(), "Sending");
            let written = match self.write_to(dest, &msg) {
                Ok(n) => n,
                Err(err) => {
                    self.write_failed(dest, err);
                    return;
                }
            };
            if written > 0 {
                self.activity();
            }
            if written < msg.len() {
                self.queues.requeue_front(dest, msg[written..].to_vec());
                return;
            }
        }
    }

    fn write_to(&mut self, dest: Destination, msg: &[u8]) -> std::io::Result<usize> {
        match dest {
            Destination::Local(role) => match self.local_outputs.get_mut(&role) {
                Some(out) => out.write_some(msg),
                None => Err(std::io::Error::from(ErrorKind::NotFound)),
            },
            Destination::Connection(id) => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return Err(std::io::Error::from(ErrorKind::NotConnected));
                };
                let mut written = 0;
                while written < msg.len() {
                    match conn.stream.write(&msg[written..]) {
                        Ok(0) => break,
                        Ok(n) => written += n,
                        Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                }
                Ok(written)
            }
        }
    }

    fn write_failed(&mut self, dest: Destination, err: std::io::Error) {
        match dest {
            Destination::Connection(id) => {
                warn!(%id, ?err, "Write to peer failed, closing connection");
                self.teardown_connection(id);
            }
            Destination::Local(role) => {
                error!(%role, ?err, "Write to local output failed, discarding its queue");
                self.unwatch_output(dest);
                self.queues.discard(dest);
                self.local_outputs.remove(&role);
            }
        }
    }

    // Bookkeeping once a destination has nothing left to send.
    fn after_drain(&mut self, dest: Destination) {
        match dest {
            Destination::Local(role) => {
                let connected = self
                    .listeners
                    .get(&role)
                    .and_then(ChannelListener::connection)
                    .is_some();
                if !connected {
                    self.queues.discard(dest);
                    debug!(%role, "Drained queue of closed connection removed");
                }
            }
            Destination::Connection(id) => {
                if self.input_eof && self.backlog.is_empty() && self.write_shut.insert(id) {
                    if let Some(conn) = self.connections.get(&id) {
                        info!(%id, "Local input finished, shutting down write side");
                        if let Err(err) = conn.stream.shutdown(Shutdown::Write) {
                            warn!(%id, ?err, "Shutdown of write side failed");
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Exceptional dispatch and teardown
// ============================================================================

impl ProxyLoop {
    fn handle_exceptional(&mut self, source: Source) {
        info!(?source, "Handling exceptional condition");
        match source {
            Source::Listener(role) => {
                if let Some(mut listener) = self.listeners.remove(&role) {
                    if let Err(err) = self.poll.registry().deregister(listener.source_mut()) {
                        debug!(%role, ?err, "Deregister failed");
                    }
                    info!(%role, local_addr = %listener.local_addr(), "Listener closed");
                }
            }
            Source::Connection(id) => self.teardown_connection(id),
            Source::LocalInput => self.close_local_input(),
            Source::LocalOutput(role) => {
                let dest = Destination::Local(role);
                self.unwatch_output(dest);
                self.queues.discard(dest);
                self.local_outputs.remove(&role);
            }
            Source::Waker => {}
        }
        self.activity();
    }

    /// Close a connection and remove every trace of it: input and output
    /// watch, registry entry, listener slot and its own queue.
    fn teardown_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        let dest = Destination::Connection(id);
        self.outputs.remove(&dest);
        if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(%id, ?err, "Deregister failed");
        }
        self.write_shut.remove(&id);

        let role = self.registry.owner(id).unwrap_or(conn.role);
        let freed = self
            .listeners
            .get_mut(&role)
            .is_some_and(|listener| listener.remove_connection(&mut self.registry, id));
        if !freed {
            self.registry.forget(id);
        }

        if let Some(dropped) = self.queues.discard(dest) {
            if dropped > 0 {
                warn!(%id, dropped, "Discarded undelivered messages");
            }
        }
        if role != Role::Stdin {
            let local = Destination::Local(role);
            if !self.queues.has_pending(local) {
                self.unwatch_output(local);
                self.queues.discard(local);
            }
        }
        info!(%role, peer = %conn.peer_addr, %id, "Connection torn down");
        drop(conn);
        self.activity();
    }

    fn close_all(&mut self) {
        let ids: Vec<_> = self.connections.keys().copied().collect();
        for id in ids {
            self.teardown_connection(id);
        }
        for (role, mut listener) in self.listeners.drain() {
            if let Err(err) = self.poll.registry().deregister(listener.source_mut()) {
                debug!(%role, ?err, "Deregister failed");
            }
        }
        if self.input_active() {
            self.close_local_input();
        }
        let pending: Vec<_> = self.outputs.iter().copied().collect();
        for dest in pending {
            self.unwatch_output(dest);
        }
    }
}
