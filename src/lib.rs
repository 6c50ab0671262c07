//! Launch an OSv guest and relay the launcher's stdio to it over TCP.
//!
//! - [`proxy`]: the readiness-driven stdio proxy loop.
//! - [`vm`]: guest parameters, process lifecycle and the guest REST API.
//! - [`settings`]: TOML-backed settings.
//! - [`logging`]: tracing subscriber setup.

pub mod logging;
pub mod proxy;
pub mod settings;
pub mod vm;
