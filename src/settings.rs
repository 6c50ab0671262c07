//! Launcher settings.
//!
//! Every value has a default, so a settings file only needs the keys it
//! changes:
//!
//! ```toml
//! [osv]
//! src = "/home/me/osv"
//!
//! [proxy]
//! base_port = 2400
//! pending_input = "drop"
//! ```
//!
//! Lookup order: an explicit `--config` path, then
//! `$XDG_CONFIG_HOME/osv-proxy/settings.toml` (or
//! `~/.config/osv-proxy/settings.toml`), then built-in defaults.

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::proxy::{LoopConfig, PendingInput};

const APP_NAME: &str = "osv-proxy";
const FILE_NAME: &str = "settings.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub osv: OsvSettings,
    pub network: NetworkSettings,
    pub proxy: ProxySettings,
    pub log: LogSettings,
}

// --- Sections ---

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OsvSettings {
    /// OSv source tree holding `scripts/run.py`.
    pub src: PathBuf,
    /// CLI app path inside the guest.
    pub cli_app: String,
    pub api_port: u16,
}

/// Address pool for statically configured guests: hosts
/// `ip_subnet + [ip_min, ip_max]` inside `ip_subnet/ip_mask`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub ip_subnet: Ipv4Addr,
    pub ip_min: u32,
    pub ip_max: u32,
    pub ip_mask: u8,
    pub gateway: Ipv4Addr,
    pub nameserver: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen_addr: IpAddr,
    pub base_port: u16,
    pub delay_min_us: u64,
    pub delay_max_ms: u64,
    pub pending_input: PendingInput,
    /// Send the guest console to log files instead of this process's own
    /// stdio, which the proxy relays.
    pub redirect_stdio: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    pub file: PathBuf,
    pub level: String,
}

// --- Defaults ---

impl Default for OsvSettings {
    fn default() -> Self {
        Self {
            src: PathBuf::from("/opt/osv/"),
            cli_app: "/cli/cli.so".into(),
            api_port: 8000,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ip_subnet: Ipv4Addr::new(192, 168, 122, 0),
            ip_min: 200,
            ip_max: 250,
            ip_mask: 24,
            gateway: Ipv4Addr::new(192, 168, 122, 1),
            nameserver: Ipv4Addr::new(192, 168, 122, 1),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 2300,
            delay_min_us: 100,
            delay_max_ms: 100,
            pending_input: PendingInput::Buffer,
            redirect_stdio: true,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/tmp/orted_lin_proxy.log"),
            level: "debug".into(),
        }
    }
}

// --- Helpers ---

impl NetworkSettings {
    /// CIDR address of pool host `host`, or `None` outside `[ip_min, ip_max]`.
    pub fn cidr_for(&self, host: u32) -> Option<String> {
        if !(self.ip_min..=self.ip_max).contains(&host) {
            return None;
        }
        let ip = u32::from(self.ip_subnet).checked_add(host)?;
        Some(format!("{}/{}", Ipv4Addr::from(ip), self.ip_mask))
    }
}

impl ProxySettings {
    pub fn to_loop_config(&self) -> LoopConfig {
        LoopConfig {
            delay_min: Duration::from_micros(self.delay_min_us),
            delay_max: Duration::from_millis(self.delay_max_ms),
            pending_input: self.pending_input,
            ..LoopConfig::default()
        }
    }
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load settings from `explicit`, else from the default location if a
    /// file exists there, else return defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.is_file() => path,
                _ => {
                    debug!("No settings file, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings = Self::from_toml(&text)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        debug!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }
}

/// `$XDG_CONFIG_HOME/osv-proxy/settings.toml`, falling back to
/// `~/.config/osv-proxy/settings.toml`.
pub fn default_path() -> Option<PathBuf> {
    resolve_config_file(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
}

fn resolve_config_file(xdg: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    let dir = match xdg.filter(|x| !x.is_empty()) {
        Some(xdg) => PathBuf::from(xdg),
        None => PathBuf::from(home?).join(".config"),
    };
    Some(dir.join(APP_NAME).join(FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_launcher_constants() {
        let s = Settings::default();
        assert_eq!(s.osv.src, PathBuf::from("/opt/osv/"));
        assert_eq!(s.osv.api_port, 8000);
        assert_eq!(s.proxy.base_port, 2300);
        assert_eq!(s.proxy.pending_input, PendingInput::Buffer);
        assert!(s.proxy.redirect_stdio);
        assert_eq!(s.log.file, PathBuf::from("/tmp/orted_lin_proxy.log"));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let s = Settings::from_toml(
            "[proxy]\nbase_port = 2400\npending_input = \"drop\"\n\n[osv]\nsrc = \"/src/osv\"\n",
        )
        .unwrap();
        assert_eq!(s.proxy.base_port, 2400);
        assert_eq!(s.proxy.pending_input, PendingInput::Drop);
        assert_eq!(s.proxy.delay_max_ms, 100);
        assert_eq!(s.osv.src, PathBuf::from("/src/osv"));
        assert_eq!(s.osv.cli_app, "/cli/cli.so");
        assert_eq!(s.network, NetworkSettings::default());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Settings::from_toml("[proxy\nbase_port = ").is_err());
        assert!(Settings::from_toml("[proxy]\nbase_port = \"high\"").is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[log]\nlevel = \"info\"\n").unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.log.level, "info");
    }

    #[test]
    fn load_reports_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn config_file_prefers_xdg() {
        let p = resolve_config_file(Some("/xdg".into()), Some("/home/u".into())).unwrap();
        assert_eq!(p, PathBuf::from("/xdg/osv-proxy/settings.toml"));

        let p = resolve_config_file(None, Some("/home/u".into())).unwrap();
        assert_eq!(p, PathBuf::from("/home/u/.config/osv-proxy/settings.toml"));

        assert!(resolve_config_file(Some("".into()), None).is_none());
    }

    #[test]
    fn loop_config_from_proxy_section() {
        let cfg = ProxySettings::default().to_loop_config();
        assert_eq!(cfg.delay_min, Duration::from_micros(100));
        assert_eq!(cfg.delay_max, Duration::from_millis(100));
        assert_eq!(cfg.wait_timeout, None);
    }

    #[test]
    fn pool_addresses_stay_in_range() {
        let net = NetworkSettings::default();
        assert_eq!(net.cidr_for(200).as_deref(), Some("192.168.122.200/24"));
        assert_eq!(net.cidr_for(250).as_deref(), Some("192.168.122.250/24"));
        assert_eq!(net.cidr_for(199), None);
        assert_eq!(net.cidr_for(251), None);
    }
}
