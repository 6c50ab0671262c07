//! Integration tests against a real OSv guest.
//!
//! These boot a guest through `scripts/run.py` (via sudo and KVM), so they
//! are gated with the `vm-integration-tests` feature flag.
//!
//! # Running
//!
//! ```bash
//! OSV_PROXY_TEST_OSV_SRC=/opt/osv \
//!     cargo test --features vm-integration-tests --test vm_integration
//! ```
//!
//! The OSv tree must contain a built `build/release/usr.img` with the CLI
//! and REST server modules, and the default bridge must hand out DHCP leases.

#![cfg(all(feature = "vm-integration-tests", target_os = "linux"))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use osv_proxy::settings::OsvSettings;
use osv_proxy::vm::{ConsoleMode, VmHandle, VmParams};

// ---------------------------------------------------------------------------
// Environment variable helpers
// ---------------------------------------------------------------------------

fn test_osv_src() -> PathBuf {
    std::env::var("OSV_PROXY_TEST_OSV_SRC")
        .map(PathBuf::from)
        .unwrap_or_else(|_| OsvSettings::default().src)
}

fn test_settings() -> OsvSettings {
    OsvSettings {
        src: test_osv_src(),
        ..OsvSettings::default()
    }
}

// ---------------------------------------------------------------------------
// TestVm helper
// ---------------------------------------------------------------------------

/// A booted guest for a single test. `Drop` kills the process if the test
/// panicked before `shutdown`.
struct TestVm {
    vm: Option<VmHandle>,
}

impl TestVm {
    async fn boot(params: VmParams) -> Result<Self> {
        let settings = test_settings();
        if !settings.src.join("scripts").join("run.py").exists() {
            bail!(
                "run.py not found under {}. Set OSV_PROXY_TEST_OSV_SRC.",
                settings.src.display()
            );
        }
        let mut vm = VmHandle::spawn(params, &settings, ConsoleMode::LogFiles)
            .await
            .context("spawning guest")?;
        if !vm.wait_ip(Duration::from_secs(60), Duration::from_millis(200)).await {
            vm.terminate().await;
            bail!("guest did not report an address");
        }
        Ok(Self { vm: Some(vm) })
    }

    fn vm(&mut self) -> &mut VmHandle {
        self.vm.as_mut().expect("guest already shut down")
    }

    async fn shutdown(mut self) {
        if let Some(mut vm) = self.vm.take() {
            vm.terminate().await;
            assert!(!vm.is_up());
        }
    }
}

impl Drop for TestVm {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.as_ref() {
            if let Some(pid) = vm.pid() {
                let _ = std::process::Command::new("sudo")
                    .args(["kill", &pid.to_string()])
                    .status();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dhcp_guest_boots_and_serves_env_api() {
    let mut guest = TestVm::boot(VmParams::default()).await.unwrap();
    assert!(guest.vm().is_up());
    assert!(
        guest
            .vm()
            .wait_cmd_prompt(Duration::from_secs(30), Duration::from_millis(200))
            .await
    );

    let api = guest.vm().api().unwrap();
    let env = api.env_all().await.unwrap();
    assert!(env.contains_key("OSV_VERSION"));

    api.env_set("var2", "123").await.unwrap();
    assert_eq!(api.env_get("var2").await.unwrap(), "123");
    api.env_delete("var2").await.unwrap();

    guest.shutdown().await;
}

#[tokio::test]
async fn attached_handle_talks_to_running_guest() {
    let mut guest = TestVm::boot(VmParams::default()).await.unwrap();
    let ip = guest.vm().ip().unwrap().to_string();

    let mut attached = VmHandle::attach(&format!("{ip}/24"), &test_settings());
    let env = attached.api().unwrap().env_all().await.unwrap();
    assert!(env.contains_key("OSV_VERSION"));

    // Terminating an attached handle leaves the guest alone.
    attached.terminate().await;
    assert!(guest.vm().is_up());

    guest.shutdown().await;
}
