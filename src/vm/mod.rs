//! OSv guest management.
//!
//! Builds the `scripts/run.py` command line from [`VmParams`], supervises the
//! resulting process, scrapes its console for readiness and talks to the
//! guest's REST API.

pub mod api;
pub mod console;
pub mod error;
pub mod lifecycle;
pub mod params;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use api::{ApiClient, env_var_split};
pub use error::{ApiError, VmError};
pub use lifecycle::{ConsoleMode, VmHandle};
pub use params::{NetMode, VmParams, cidr_to_ip_mask};
