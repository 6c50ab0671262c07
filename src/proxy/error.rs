//! Error types for the stdio proxy.

use std::net::IpAddr;

use thiserror::Error;

use super::Role;

/// Errors from setting up or running the proxy loop.
///
/// Per-connection failures never surface here: they tear down the one
/// connection involved and the loop keeps running.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Every port from the start port to the top of the 16-bit range failed
    /// to bind.
    #[error("{role} listener: no free port on {addr} at or above {start_port}")]
    BindExhausted {
        role: Role,
        addr: IpAddr,
        start_port: u16,
    },

    /// Registering a handle with the readiness poller failed.
    #[error("Failed to register {what} with the poller: {source}")]
    Register {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// A listener was attached to the wrong kind of local endpoint.
    #[error("{role} listener cannot be paired with {endpoint}")]
    RoleMismatch { role: Role, endpoint: &'static str },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_exhausted_names_role_and_port() {
        let err = ProxyError::BindExhausted {
            role: Role::Stdout,
            addr: IpAddr::from([127, 0, 0, 1]),
            start_port: 65530,
        };
        let msg = err.to_string();
        assert!(msg.contains("STDOUT"));
        assert!(msg.contains("65530"));
    }

    #[test]
    fn register_error_keeps_source() {
        let err = ProxyError::Register {
            what: "<stdin>".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("<stdin>"));
    }

    #[test]
    fn role_mismatch_names_both_sides() {
        let err = ProxyError::RoleMismatch {
            role: Role::Stdin,
            endpoint: "a local output",
        };
        assert_eq!(err.to_string(), "STDIN listener cannot be paired with a local output");
    }
}
