//! Error types for guest management and the guest REST API.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from talking to the guest REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with anything other than 200.
    #[error("HTTP call failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("Unexpected response body: {0}")]
    Parse(String),

    /// The API did not come up within the allotted time.
    #[error("Guest API at {0} not reachable")]
    NotReachable(String),
}

/// Errors from preparing, spawning or supervising a guest.
#[derive(Debug, Error)]
pub enum VmError {
    /// `run.py` (through sudo) could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Copying the disk image for a private guest failed.
    #[error("Failed to copy image {} -> {}: {source}", from.display(), to.display())]
    ImageCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A static address was not `a.b.c.d/bits`.
    #[error("Invalid CIDR address: {0:?}")]
    InvalidCidr(String),

    /// The guest address is not known yet (no static IP, no DHCP lease seen).
    #[error("Guest IP address is not known")]
    NoAddress,

    #[error(transparent)]
    Api(#[from] ApiError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_carries_code() {
        let err = ApiError::Status {
            status: 404,
            body: "no such var".into(),
        };
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn api_error_converts_into_vm_error() {
        let err: VmError = ApiError::NotReachable("http://10.0.0.2:8000/".into()).into();
        assert!(matches!(err, VmError::Api(ApiError::NotReachable(_))));
        assert!(err.to_string().contains("10.0.0.2"));
    }
}
