//! Guest management logic that needs neither KVM nor a built OSv tree.
//!
//! Tested in this file:
//! - launcher settings flowing into the `run.py` command line
//! - scraping a recorded boot transcript for the prompt and DHCP address
//! - handles attached to an already-running guest

use osv_proxy::settings::{NetworkSettings, OsvSettings, Settings};
use osv_proxy::vm::console::ConsoleScanner;
use osv_proxy::vm::{NetMode, VmHandle, VmParams};

// Console of a DHCP-configured guest running the CLI app, as run.py prints it.
const BOOT_TRANSCRIPT: &str = "OSv v0.24-103-g5d5a0b7\r\n\
eth0: ethernet address: 52:54:00:12:34:56\r\n\
Booted up in 241.47 ms\r\n\
Cmdline: /cli/cli.so\r\n\
eth0: 192.168.122.89\r\n\
random: device unblocked.\r\n\
\x1b[6n/# ";

#[test]
fn boot_transcript_yields_address_and_prompt() {
    let mut scanner = ConsoleScanner::new();
    // Arrives in arbitrary pieces as the log file grows.
    for piece in BOOT_TRANSCRIPT.as_bytes().chunks(7) {
        scanner.scan(std::str::from_utf8(piece).unwrap());
    }
    assert_eq!(scanner.ip(), Some("192.168.122.89"));
    assert!(scanner.cmdline_up());
}

#[test]
fn transcript_without_prompt_is_not_up() {
    let mut scanner = ConsoleScanner::new();
    scanner.scan("OSv v0.24\r\neth0: ethernet address: 52:54:00:12:34:56\r\nBooted up\r\n");
    assert_eq!(scanner.ip(), None);
    assert!(!scanner.cmdline_up());
}

#[test]
fn pool_address_drives_static_command_line() {
    let settings = Settings::default();
    let net = &settings.network;
    let params = VmParams {
        net_ip: net.cidr_for(net.ip_min).unwrap(),
        net_gw: net.gateway.to_string(),
        net_dns: net.nameserver.to_string(),
        ..VmParams::default()
    };
    assert_eq!(params.net_mode(), NetMode::Static);
    assert_eq!(params.static_ip(), Some("192.168.122.200"));

    let cmd = params.build_run_command(&settings.osv.cli_app).unwrap();
    assert_eq!(
        cmd.last().unwrap(),
        "--ip=eth0,192.168.122.200,255.255.255.0 --defaultgw=192.168.122.1 \
         --nameserver=192.168.122.1 /cli/cli.so"
    );
}

#[test]
fn narrow_pool_mask_is_carried_through() {
    let net = NetworkSettings {
        ip_subnet: "10.1.0.0".parse().unwrap(),
        ip_mask: 16,
        ip_min: 10,
        ip_max: 300,
        ..NetworkSettings::default()
    };
    let params = VmParams {
        net_ip: net.cidr_for(300).unwrap(),
        command: "/hello.so".into(),
        ..VmParams::default()
    };
    let cmd = params.build_run_command("/cli/cli.so").unwrap();
    assert_eq!(cmd.last().unwrap(), "--ip=eth0,10.1.1.44,255.255.0.0 /hello.so");
}

#[test]
fn attached_guest_uses_configured_api_port() {
    let settings = OsvSettings {
        api_port: 8080,
        ..OsvSettings::default()
    };
    let vm = VmHandle::attach("192.168.122.37", &settings);
    assert_eq!(
        vm.api().unwrap().base_url().as_str(),
        "http://192.168.122.37:8080/"
    );
    assert!(vm.console_logs().is_none());
    assert_eq!(vm.pid(), None);
}
