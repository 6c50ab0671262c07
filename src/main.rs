//! osv-proxy: run a program in an OSv guest with this process's stdio
//! relayed to it.
//!
//! Boots (or attaches to) a guest, opens one TCP listener per standard
//! stream, tells the guest the listener ports through its environment, starts
//! the guest app and then relays data until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use osv_proxy::logging;
use osv_proxy::proxy::{self, ListenerPorts, Role};
use osv_proxy::settings::Settings;
use osv_proxy::vm::api::quote_args;
use osv_proxy::vm::{ConsoleMode, VmHandle, VmParams};

/// Run a program in an OSv guest with stdio relayed over TCP
#[derive(Parser, Debug)]
#[command(name = "osv-proxy", version)]
struct Args {
    /// Settings file (default: ~/.config/osv-proxy/settings.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest image, relative to the OSv source tree or absolute
    #[arg(long)]
    image: Option<String>,

    /// Guest memory in MiB
    #[arg(long, default_value_t = 512)]
    memory: u32,

    /// Virtual CPUs (0 keeps the run.py default)
    #[arg(long, default_value_t = 0)]
    cpus: u32,

    /// Static address as ip/bits, or a host number from the configured pool
    #[arg(long)]
    net_ip: Option<String>,

    /// Guest MAC address, or "rand"
    #[arg(long)]
    mac: Option<String>,

    /// Extra run.py argument (repeatable)
    #[arg(long, allow_hyphen_values = true)]
    extra: Vec<String>,

    /// Guest app to start once the listeners are up
    #[arg(long)]
    app: Option<String>,

    /// Boot the debug build
    #[arg(long)]
    debug: bool,

    /// Only run the proxy
    #[arg(long, conflicts_with = "vm_ip")]
    no_vm: bool,

    /// Attach to a running guest instead of booting one
    #[arg(long)]
    vm_ip: Option<String>,

    /// Copy this process's environment into the guest
    #[arg(long)]
    copy_env: bool,

    /// Arguments appended to the guest app command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    app_args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    let _log_guard = logging::init(&settings.log).context("Failed to initialise logging")?;

    info!("Start /*--------------------------------*/");
    for (i, arg) in std::env::args().enumerate() {
        info!("  argv[{i}] = {arg}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let mut vm = if args.no_vm {
        None
    } else {
        Some(runtime.block_on(start_vm(&args, &settings))?)
    };

    let result = run_proxy(&runtime, &args, &settings, vm.as_ref());

    if let Some(vm) = vm.as_mut() {
        runtime.block_on(vm.terminate());
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("Done /*--------------------------------*/");
    result
}

fn vm_params(args: &Args, settings: &Settings) -> Result<VmParams> {
    let net_ip = match args.net_ip.as_deref() {
        None => String::new(),
        Some(spec) => match spec.parse::<u32>() {
            Ok(host) => settings
                .network
                .cidr_for(host)
                .with_context(|| format!("host {host} is outside the configured address pool"))?,
            Err(_) => spec.to_string(),
        },
    };
    let (net_gw, net_dns) = if net_ip.is_empty() {
        (String::new(), String::new())
    } else {
        (
            settings.network.gateway.to_string(),
            settings.network.nameserver.to_string(),
        )
    };
    Ok(VmParams {
        image: args.image.clone().unwrap_or_default(),
        memory: args.memory,
        cpus: args.cpus,
        net_ip,
        net_mac: args.mac.clone().unwrap_or_default(),
        net_gw,
        net_dns,
        debug: args.debug,
        extra: args.extra.clone(),
        ..VmParams::default()
    })
}

async fn start_vm(args: &Args, settings: &Settings) -> Result<VmHandle> {
    if let Some(ip) = args.vm_ip.as_deref() {
        return Ok(VmHandle::attach(ip, &settings.osv));
    }
    let params = vm_params(args, settings)?;
    let console = if settings.proxy.redirect_stdio {
        ConsoleMode::LogFiles
    } else {
        ConsoleMode::Inherit
    };
    let mut vm = VmHandle::spawn(params, &settings.osv, console)
        .await
        .context("Failed to start guest")?;
    if let Some((stdout, stderr)) = vm.console_logs() {
        info!(stdout = %stdout.display(), stderr = %stderr.display(), "Guest console");
    }
    if !vm.wait_up().await {
        warn!("Guest address not known yet");
    }
    if !vm.is_up() {
        vm.terminate().await;
        bail!("Guest exited during startup");
    }
    Ok(vm)
}

fn run_proxy(
    runtime: &tokio::runtime::Runtime,
    args: &Args,
    settings: &Settings,
    vm: Option<&VmHandle>,
) -> Result<()> {
    let (mut proxy, ports) = proxy::redirect_stdio(
        settings.proxy.listen_addr,
        settings.proxy.base_port,
        settings.proxy.to_loop_config(),
    )
    .context("Failed to redirect stdio")?;

    let shutdown = proxy.shutdown_handle();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping proxy");
            shutdown.shutdown();
        }
    });

    // Listeners are up; the guest can dial in from here on.
    if let Some(vm) = vm {
        runtime.block_on(prepare_guest(vm, args, ports))?;
    }

    proxy.run().context("Proxy loop failed")
}

async fn prepare_guest(vm: &VmHandle, args: &Args, ports: ListenerPorts) -> Result<()> {
    let api = vm.api()?;
    if args.copy_env {
        let copied = api.copy_all_env(std::env::vars()).await?;
        info!(copied, "Environment copied to guest");
    }
    for role in Role::ALL {
        api.env_set(role.port_env_var(), &ports.get(role).to_string())
            .await
            .with_context(|| format!("exporting {} port", role))?;
    }
    if let Some(app) = args.app.as_deref() {
        let command = if args.app_args.is_empty() {
            app.to_string()
        } else {
            format!("{app} {}", quote_args(&args.app_args))
        };
        api.app_run(&command)
            .await
            .with_context(|| format!("starting guest app {command}"))?;
    }
    Ok(())
}
