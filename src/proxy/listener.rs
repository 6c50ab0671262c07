//! Per-role listening sockets and the connection → listener back-references.
//!
//! Each [`ChannelListener`] accepts at most one peer at a time. The accepted
//! socket itself is owned by the event loop; the listener only remembers the
//! [`ConnectionId`] occupying its slot, and the [`ConnectionRegistry`] maps
//! that id back to the owning role for teardown.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};

use mio::Token;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use super::Role;
use super::error::{ProxyError, ProxyResult};

/// A single counterpart process is expected per stream.
const LISTEN_BACKLOG: i32 = 1;

/// First id handed out to accepted connections. Lower tokens are reserved for
/// listeners, local endpoints and the waker.
pub const CONNECTION_ID_RANGE_START: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out connection ids; never reuses one within a process.
#[derive(Debug)]
pub struct ConnectionIds {
    next: usize,
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self {
            next: CONNECTION_ID_RANGE_START,
        }
    }
}

impl ConnectionIds {
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .unwrap_or(CONNECTION_ID_RANGE_START);
        id
    }
}

/// An accepted, non-blocking peer socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// Back-references from accepted connections to the role of the listener that
/// produced them. Never owns the sockets.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    owners: HashMap<ConnectionId, Role>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: ConnectionId, role: Role) {
        self.owners.insert(id, role);
    }

    /// Drop the entry for `id` without touching any listener. Used when the
    /// owning listener itself has already been closed.
    pub(crate) fn forget(&mut self, id: ConnectionId) -> Option<Role> {
        self.owners.remove(&id)
    }

    pub fn owner(&self, id: ConnectionId) -> Option<Role> {
        self.owners.get(&id).copied()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.owners.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// What a single `accept` call produced.
#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(Connection),
    /// The slot was occupied; the new socket has already been closed.
    Rejected(SocketAddr),
    /// Nothing left in the accept queue.
    WouldBlock,
}

/// Listening socket for one role, with room for exactly one peer.
#[derive(Debug)]
pub struct ChannelListener {
    role: Role,
    listener: TcpListener,
    local_addr: SocketAddr,
    connection: Option<ConnectionId>,
}

impl ChannelListener {
    /// Bind `addr` at `starting_port`, moving one port up after each failed
    /// bind until a free port is found or the port range runs out.
    pub fn bind_and_listen(role: Role, addr: IpAddr, starting_port: u16) -> ProxyResult<Self> {
        for port in starting_port..=u16::MAX {
            let candidate = SocketAddr::new(addr, port);
            match try_bind(candidate) {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    info!(%role, %local_addr, "Listening");
                    return Ok(Self {
                        role,
                        listener: TcpListener::from_std(listener),
                        local_addr,
                        connection: None,
                    });
                }
                Err(err) => {
                    debug!(%role, addr = %candidate, ?err, "Bind failed, trying next port");
                }
            }
        }
        Err(ProxyError::BindExhausted {
            role,
            addr,
            start_port: starting_port,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub(crate) fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept one pending connection.
    ///
    /// When a peer already occupies the slot the new socket is closed
    /// immediately and the existing connection is left untouched.
    pub fn accept(
        &mut self,
        registry: &mut ConnectionRegistry,
        ids: &mut ConnectionIds,
    ) -> std::io::Result<AcceptOutcome> {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return Ok(AcceptOutcome::WouldBlock),
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(role = %self.role, ?err, "Transient accept error");
                        continue;
                    }
                    _ => return Err(err),
                },
            };

            if let Some(existing) = self.connection {
                error!(
                    role = %self.role,
                    peer = %peer_addr,
                    local_addr = %self.local_addr,
                    %existing,
                    "Multiple connections not allowed, closing new peer"
                );
                drop(stream);
                return Ok(AcceptOutcome::Rejected(peer_addr));
            }

            if let Err(err) = stream.set_nodelay(true) {
                debug!(role = %self.role, ?err, "Could not set TCP_NODELAY");
            }
            let id = ids.next_id();
            self.connection = Some(id);
            registry.insert(id, self.role);
            info!(role = %self.role, peer = %peer_addr, %id, "Accepted connection");
            return Ok(AcceptOutcome::Accepted(Connection {
                id,
                role: self.role,
                stream,
                peer_addr,
            }));
        }
    }

    /// Free the slot held by `id` so a replacement peer can be accepted.
    ///
    /// Returns `false` if `id` was not this listener's connection.
    pub fn remove_connection(&mut self, registry: &mut ConnectionRegistry, id: ConnectionId) -> bool {
        if self.connection != Some(id) {
            warn!(role = %self.role, %id, "Connection does not belong to this listener");
            return false;
        }
        self.connection = None;
        registry.forget(id);
        debug!(role = %self.role, %id, "Listener slot freed");
        true
    }
}

fn try_bind(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
