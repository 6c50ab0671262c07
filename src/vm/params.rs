//! Guest parameters and the `scripts/run.py` command line built from them.

use std::net::Ipv4Addr;

use tracing::{debug, info};
use uuid::Uuid;

use super::error::VmError;

/// Launcher script, relative to the OSv source tree.
pub const RUN_SCRIPT: &str = "./scripts/run.py";

/// `net_mac` value asking for a random locally administered address.
pub const RANDOM_MAC: &str = "rand";

/// How the guest gets its network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    /// Address pushed on the guest command line.
    Static,
    Dhcp,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmParams {
    /// Guest command; empty runs the image's default.
    pub command: String,
    /// Image path, relative to the OSv source or absolute. Empty selects the
    /// build output matching `debug`.
    pub image: String,
    /// Boot a private copy of the image instead of the shared one.
    pub use_image_copy: bool,
    /// 0 keeps the run.py default.
    pub cpus: u32,
    /// MiB; 0 keeps the run.py default.
    pub memory: u32,
    pub networking: bool,
    /// Static address as `ip/bits`. Empty means DHCP (or no network).
    pub net_ip: String,
    /// Empty, an explicit address, or [`RANDOM_MAC`].
    pub net_mac: String,
    pub net_gw: String,
    pub net_dns: String,
    pub vnc: bool,
    pub vnc_port: u16,
    pub gdb: bool,
    pub gdb_port: u16,
    pub verbose: bool,
    pub debug: bool,
    /// Passed through to run.py ahead of the guest command.
    pub extra: Vec<String>,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            command: String::new(),
            image: String::new(),
            use_image_copy: false,
            cpus: 0,
            memory: 512,
            networking: true,
            net_ip: String::new(),
            net_mac: String::new(),
            net_gw: String::new(),
            net_dns: String::new(),
            vnc: false,
            vnc_port: 0,
            gdb: false,
            gdb_port: 0,
            verbose: false,
            debug: false,
            extra: Vec::new(),
        }
    }
}

impl VmParams {
    pub fn net_mode(&self) -> NetMode {
        if !self.net_ip.is_empty() {
            NetMode::Static
        } else if self.networking {
            NetMode::Dhcp
        } else {
            NetMode::None
        }
    }

    pub fn image_path(&self) -> String {
        if self.image.is_empty() {
            let mode = if self.debug { "debug" } else { "release" };
            format!("build/{mode}/usr.img")
        } else {
            self.image.clone()
        }
    }

    /// Address part of `net_ip`, when a static address is configured.
    pub fn static_ip(&self) -> Option<&str> {
        match self.net_mode() {
            NetMode::Static => self.net_ip.split('/').next(),
            _ => None,
        }
    }

    /// Replace a [`RANDOM_MAC`] request with a concrete address.
    pub fn resolve_mac(&mut self) {
        if self.net_mac == RANDOM_MAC {
            self.net_mac = random_mac();
        }
        info!(mac = %self.net_mac, "Guest MAC");
    }

    fn vnc_enabled(&self) -> bool {
        self.vnc || self.vnc_port != 0
    }

    fn gdb_enabled(&self) -> bool {
        self.gdb || self.gdb_port != 0
    }

    /// The run.py argument vector, script path first.
    ///
    /// With a static address the network setup travels in front of the guest
    /// command (or in front of `cli_app` when no command is set).
    pub fn build_run_command(&self, cli_app: &str) -> Result<Vec<String>, VmError> {
        let mut arg = vec![RUN_SCRIPT.to_string(), "--image".into(), self.image_path()];
        if self.cpus != 0 {
            arg.extend(["--vcpus".into(), self.cpus.to_string()]);
        }
        if self.memory != 0 {
            arg.extend(["--memsize".into(), self.memory.to_string()]);
        }
        if self.verbose {
            arg.push("--verbose".into());
        }
        if self.debug {
            arg.push("--debug".into());
        }

        // Both are on by default in run.py.
        if !self.vnc_enabled() {
            arg.push("--novnc".into());
        } else if self.vnc_port != 0 {
            arg.extend(["--vnc".into(), self.vnc_port.to_string()]);
        }
        if !self.gdb_enabled() {
            arg.push("--nogdb".into());
        } else if self.gdb_port != 0 {
            arg.extend(["--gdb".into(), self.gdb_port.to_string()]);
        }

        if !self.extra.is_empty() {
            debug!(extra = ?self.extra, "Adding extra run.py arguments");
            arg.extend(self.extra.iter().cloned());
        }

        let mut cmd_net = String::new();
        let mode = self.net_mode();
        if mode != NetMode::None {
            if !self.net_mac.is_empty() {
                arg.extend(["--mac".into(), self.net_mac.clone()]);
            }
            // -v selects vhost networking, which needs root.
            arg.extend(["-n".into(), "-v".into()]);
            if mode == NetMode::Static {
                let (ip, mask) = cidr_to_ip_mask(&self.net_ip)?;
                cmd_net = format!("--ip=eth0,{ip},{mask}");
                if !self.net_gw.is_empty() {
                    cmd_net.push_str(&format!(" --defaultgw={}", self.net_gw));
                }
                if !self.net_dns.is_empty() {
                    cmd_net.push_str(&format!(" --nameserver={}", self.net_dns));
                }
            }
        }

        let full_command = match (cmd_net.is_empty(), self.command.is_empty()) {
            (false, false) => format!("{cmd_net} {}", self.command),
            (false, true) => format!("{cmd_net} {cli_app}"),
            (true, false) => self.command.clone(),
            (true, true) => String::new(),
        };
        if !full_command.is_empty() {
            arg.extend(["-e".into(), full_command]);
        }
        Ok(arg)
    }
}

/// Split `"192.168.1.2/24"` into `("192.168.1.2", "255.255.255.0")`.
pub fn cidr_to_ip_mask(cidr: &str) -> Result<(String, String), VmError> {
    let invalid = || VmError::InvalidCidr(cidr.to_string());
    let (ip, bits) = cidr.split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
    let bits: u32 = bits.parse().map_err(|_| invalid())?;
    if bits > 32 {
        return Err(invalid());
    }
    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    Ok((ip.to_string(), Ipv4Addr::from(mask).to_string()))
}

/// A random address in the QEMU `52:54:00` prefix.
pub fn random_mac() -> String {
    let b = Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2])
}
