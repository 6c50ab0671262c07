//! Stdio-to-socket proxy.
//!
//! The proxy replaces a supervised program's stdin/stdout/stderr with three
//! TCP listeners so that code running inside the guest VM can dial in and
//! take over the streams:
//!
//! ```text
//!   local stdin  ──lines──►  STDIN listener  ──►  guest reads its input
//!   local stdout ◄─bytes───  STDOUT listener ◄──  guest writes output
//!   local stderr ◄─bytes───  STDERR listener ◄──  guest writes errors
//! ```
//!
//! Everything runs on one thread in [`event_loop::ProxyLoop`]; see that
//! module for the iteration structure.

use std::net::IpAddr;
use std::os::fd::AsFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod delay;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod listener;
pub mod queue;

pub use delay::Delay;
pub use endpoint::{LocalInput, LocalOutput, Readiness};
pub use error::{ProxyError, ProxyResult};
pub use event_loop::{ProxyLoop, ShutdownHandle, Step};
pub use listener::{ChannelListener, ConnectionId, ConnectionRegistry};
pub use queue::{Destination, OutboundQueues};

/// The logical stream a listener/connection pair relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Stdin,
    Stdout,
    Stderr,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Stdin, Role::Stdout, Role::Stderr];

    pub fn index(self) -> usize {
        match self {
            Role::Stdin => 0,
            Role::Stdout => 1,
            Role::Stderr => 2,
        }
    }

    /// Name of the local stream endpoint this role is tied to.
    pub fn endpoint_name(self) -> &'static str {
        match self {
            Role::Stdin => "<stdin>",
            Role::Stdout => "<stdout>",
            Role::Stderr => "<stderr>",
        }
    }

    /// Environment variable through which the guest learns the listener port.
    pub fn port_env_var(self) -> &'static str {
        match self {
            Role::Stdin => "OSV_PROXY_STDIN_PORT",
            Role::Stdout => "OSV_PROXY_STDOUT_PORT",
            Role::Stderr => "OSV_PROXY_STDERR_PORT",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Stdin => "STDIN",
            Role::Stdout => "STDOUT",
            Role::Stderr => "STDERR",
        })
    }
}

/// What to do with local input lines read before any STDIN peer connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingInput {
    /// Hold them and deliver them to the first peer that connects.
    #[default]
    Buffer,
    /// Read and discard them.
    Drop,
}

/// Tunables of the proxy loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub pending_input: PendingInput,
    /// Upper bound on a single readiness wait. `None` blocks until an event
    /// arrives.
    pub wait_timeout: Option<Duration>,
    pub events_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            delay_min: delay::DEFAULT_MIN,
            delay_max: delay::DEFAULT_MAX,
            pending_input: PendingInput::default(),
            wait_timeout: None,
            events_capacity: 64,
        }
    }
}

/// The three listener ports a guest needs to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerPorts {
    pub stdin: u16,
    pub stdout: u16,
    pub stderr: u16,
}

impl ListenerPorts {
    pub fn get(&self, role: Role) -> u16 {
        match role {
            Role::Stdin => self.stdin,
            Role::Stdout => self.stdout,
            Role::Stderr => self.stderr,
        }
    }
}

/// Hand the process's own stdio over to a proxy loop.
///
/// Each listener starts its port search at `base_port`, so on an otherwise
/// free host they end up on three consecutive ports.
pub fn redirect_stdio(
    addr: IpAddr,
    base_port: u16,
    config: LoopConfig,
) -> ProxyResult<(ProxyLoop, ListenerPorts)> {
    let stdin = LocalInput::from_fd(
        Role::Stdin.endpoint_name(),
        std::io::stdin().as_fd().try_clone_to_owned()?,
    )?;
    let stdout = LocalOutput::from_fd(
        Role::Stdout.endpoint_name(),
        std::io::stdout().as_fd().try_clone_to_owned()?,
    )?;
    let stderr = LocalOutput::from_fd(
        Role::Stderr.endpoint_name(),
        std::io::stderr().as_fd().try_clone_to_owned()?,
    )?;

    let server_in = ChannelListener::bind_and_listen(Role::Stdin, addr, base_port)?;
    let server_out = ChannelListener::bind_and_listen(Role::Stdout, addr, base_port)?;
    let server_err = ChannelListener::bind_and_listen(Role::Stderr, addr, base_port)?;
    let ports = ListenerPorts {
        stdin: server_in.port(),
        stdout: server_out.port(),
        stderr: server_err.port(),
    };

    let mut proxy = ProxyLoop::new(config)?;
    proxy.add_input_channel(server_in, stdin)?;
    proxy.add_output_channel(server_out, stdout)?;
    proxy.add_output_channel(server_err, stderr)?;

    info!(
        stdin = ports.stdin,
        stdout = ports.stdout,
        stderr = ports.stderr,
        "Stdio redirected to listeners"
    );
    Ok((proxy, ports))
}
