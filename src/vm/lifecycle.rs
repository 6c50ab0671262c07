//! Guest lifecycle: spawning `run.py`, watching its console, shutting it down.
//!
//! ## Architecture
//!
//! ```text
//! VmHandle::spawn(VmParams)
//!     └─► tokio::process::Command  →  sudo <osv>/scripts/run.py ...
//!             ├─► console logs  /tmp/osv-<pid>-<id>-{stdout,stderr}.log
//!             │       └─► ConsoleScanner  (prompt, DHCP address)
//!             └─► terminate()  (POST /os/shutdown, poll, kill)
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::api::ApiClient;
use super::console::{ConsoleLog, ConsoleScanner};
use super::error::VmError;
use super::params::{NetMode, RUN_SCRIPT, VmParams};
use crate::settings::OsvSettings;

const SUDO: &str = "/usr/bin/sudo";

/// Defaults of [`VmHandle::wait_up`].
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

// Without a console there is nothing to scrape; give the CLI a fixed head start.
const UNREDIRECTED_PROMPT_DELAY: Duration = Duration::from_secs(3);

const TERMINATE_POLL: Duration = Duration::from_millis(500);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the guest's console output is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Redirect to per-guest log files and scrape them.
    LogFiles,
    /// Share the launcher's own stdio.
    Inherit,
}

#[derive(Debug)]
struct Console {
    stdout: ConsoleLog,
    stderr: ConsoleLog,
}

/// A guest this process spawned, or an existing guest it attached to.
#[derive(Debug)]
pub struct VmHandle {
    child: Option<Child>,
    pid: Option<u32>,
    params: VmParams,
    cli_app: String,
    api_port: u16,
    ip: Option<String>,
    scanner: ConsoleScanner,
    console: Option<Console>,
    image_copy: Option<PathBuf>,
}

impl VmHandle {
    /// Boot a new guest.
    pub async fn spawn(
        mut params: VmParams,
        settings: &OsvSettings,
        console_mode: ConsoleMode,
    ) -> Result<Self, VmError> {
        params.resolve_mac();
        let image_copy = if params.use_image_copy {
            let copy = copy_image(&settings.src.join(params.image_path())).await?;
            params.image = copy.display().to_string();
            Some(copy)
        } else {
            None
        };

        let mut run_args = params.build_run_command(&settings.cli_app)?;
        run_args[0] = settings
            .src
            .join(RUN_SCRIPT.trim_start_matches("./"))
            .display()
            .to_string();
        let cmdline = format!("{SUDO} {}", run_args.join(" "));
        info!(%cmdline, "Running guest");

        let mut cmd = Command::new(SUDO);
        cmd.args(&run_args).current_dir(&settings.src);

        let console = match console_mode {
            ConsoleMode::LogFiles => {
                let (stdout, stderr, console) = open_console_logs(&cmdline, &run_args)?;
                // The guest must not steal the proxy's input.
                cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
                Some(console)
            }
            ConsoleMode::Inherit => None,
        };

        let child = cmd.spawn().map_err(|source| VmError::Spawn {
            program: SUDO.to_string(),
            source,
        })?;
        let pid = child.id();
        info!(?pid, "Guest process running");

        let ip = match params.net_mode() {
            NetMode::Static => params.static_ip().map(str::to_string),
            _ => None,
        };
        Ok(Self {
            child: Some(child),
            pid,
            params,
            cli_app: settings.cli_app.clone(),
            api_port: settings.api_port,
            ip,
            scanner: ConsoleScanner::new(),
            console,
            image_copy,
        })
    }

    /// Handle for a guest that is already running at `ip` (with or without
    /// `/bits`). Such a guest is never shut down by this handle.
    pub fn attach(ip: &str, settings: &OsvSettings) -> Self {
        let ip = ip.split('/').next().unwrap_or(ip).to_string();
        info!(%ip, "Attached to running guest");
        Self {
            child: None,
            pid: None,
            params: VmParams::default(),
            cli_app: settings.cli_app.clone(),
            api_port: settings.api_port,
            ip: Some(ip),
            scanner: ConsoleScanner::new(),
            console: None,
            image_copy: None,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned(&self) -> bool {
        self.child.is_some()
    }

    pub fn cmdline_up(&self) -> bool {
        self.scanner.cmdline_up()
    }

    pub fn console_logs(&self) -> Option<(&Path, &Path)> {
        self.console
            .as_ref()
            .map(|c| (c.stdout.path(), c.stderr.path()))
    }

    /// REST client for this guest.
    pub fn api(&self) -> Result<ApiClient, VmError> {
        let ip = self.ip.as_deref().ok_or(VmError::NoAddress)?;
        Ok(ApiClient::new(ip, self.api_port)?)
    }

    /// Whether the spawned process is still running.
    pub fn is_up(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | None => false,
            Some(Err(err)) => {
                warn!(pid = ?self.pid, %err, "Could not poll guest process");
                false
            }
        }
    }

    /// Read new console output and scrape it. Returns `(stdout, stderr)`.
    pub fn read_console(&mut self) -> std::io::Result<(String, String)> {
        let Some(console) = self.console.as_mut() else {
            return Ok((String::new(), String::new()));
        };
        let out = console.stdout.read_new()?;
        let err = console.stderr.read_new()?;
        if !self.scanner.cmdline_up() || self.ip.is_none() {
            self.scanner.scan(&out);
            if self.ip.is_none() {
                self.ip = self.scanner.ip().map(str::to_string);
            }
        }
        Ok((out, err))
    }

    /// Wait for the guest address. Static addresses are known immediately.
    pub async fn wait_ip(&mut self, timeout: Duration, interval: Duration) -> bool {
        if self.ip.is_some() {
            return true;
        }
        if self.console.is_none() {
            error!(pid = ?self.pid, "Console is not redirected, guest IP will never be found");
            return false;
        }
        self.poll_console(timeout, interval, |vm| vm.ip.is_some(), "IP")
            .await
    }

    /// Wait for the CLI prompt. Only the CLI app prints one.
    pub async fn wait_cmd_prompt(&mut self, timeout: Duration, interval: Duration) -> bool {
        if !self.params.command.is_empty() && !self.params.command.contains(&self.cli_app) {
            debug!(pid = ?self.pid, "Command prompt only shows up with the CLI app");
            return false;
        }
        if self.scanner.cmdline_up() {
            return true;
        }
        if self.console.is_none() {
            debug!(pid = ?self.pid, "Console is not redirected, waiting a fixed delay");
            tokio::time::sleep(UNREDIRECTED_PROMPT_DELAY).await;
            self.scanner.assume_cmdline_up();
            return true;
        }
        self.poll_console(timeout, interval, |vm| vm.scanner.cmdline_up(), "command prompt")
            .await
    }

    /// [`wait_ip`](Self::wait_ip) then [`wait_cmd_prompt`](Self::wait_cmd_prompt)
    /// with default timing. Returns whether the address is known.
    pub async fn wait_up(&mut self) -> bool {
        let has_ip = self.wait_ip(DEFAULT_WAIT, DEFAULT_WAIT_INTERVAL).await;
        self.wait_cmd_prompt(DEFAULT_WAIT, DEFAULT_WAIT_INTERVAL).await;
        has_ip
    }

    async fn poll_console(
        &mut self,
        timeout: Duration,
        interval: Duration,
        done: impl Fn(&Self) -> bool,
        what: &str,
    ) -> bool {
        let interval = interval.max(Duration::from_millis(1));
        let rounds = timeout.as_nanos().div_ceil(interval.as_nanos()).max(1);
        for _ in 0..rounds {
            if let Err(err) = self.read_console() {
                warn!(%err, "Reading guest console failed");
            }
            if done(self) {
                return true;
            }
            debug!(pid = ?self.pid, what, "Not up yet");
            tokio::time::sleep(interval).await;
        }
        false
    }

    /// Shut the guest down: through the REST API first, killing the process
    /// if it has not exited after a grace period.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!(pid = ?self.pid, "Terminating guest");

        match child.try_wait() {
            Ok(Some(status)) => {
                // run.py rejected its arguments, or the guest command finished.
                info!(pid = ?self.pid, code = ?status.code(), "Guest already exited");
            }
            _ => {
                match self.api() {
                    Ok(api) => {
                        if let Err(err) = api.os_shutdown().await {
                            warn!(%err, "Shutdown request failed");
                        }
                    }
                    Err(err) => warn!(%err, "Cannot request shutdown"),
                }
                wait_or_kill(&mut child, self.pid).await;
            }
        }

        if let Some(copy) = self.image_copy.take() {
            match tokio::fs::remove_file(&copy).await {
                Ok(()) => debug!(path = %copy.display(), "Image copy removed"),
                Err(err) => warn!(path = %copy.display(), %err, "Could not remove image copy"),
            }
        }
        self.console = None;
    }
}

async fn wait_or_kill(child: &mut Child, pid: Option<u32>) {
    let deadline = tokio::time::Instant::now() + TERMINATE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(?pid, code = ?status.code(), "Guest exited");
                return;
            }
            Ok(None) => info!(?pid, "Guest still alive"),
            Err(err) => {
                error!(?pid, %err, "Error waiting for guest process");
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(TERMINATE_POLL).await;
    }
    warn!(?pid, "Guest did not exit in time, killing");
    if let Err(err) = child.kill().await {
        error!(?pid, %err, "Kill failed");
    }
}

async fn copy_image(from: &Path) -> Result<PathBuf, VmError> {
    let n = Uuid::new_v4().as_u128() % 1_000_000_000;
    let to = std::env::temp_dir().join(format!("osv-{n:09}-usr.img"));
    info!(from = %from.display(), to = %to.display(), "Copying image");
    tokio::fs::copy(from, &to)
        .await
        .map_err(|source| VmError::ImageCopy {
            from: from.to_path_buf(),
            to: to.clone(),
            source,
        })?;
    Ok(to)
}

/// Create `/tmp/osv-<pid>-<id>-{stdout,stderr}.log`, write the command line
/// at the top of the stdout log and open both for scraping.
fn open_console_logs(cmdline: &str, run_args: &[String]) -> Result<(Stdio, Stdio, Console), VmError> {
    let id = Uuid::new_v4().simple().to_string();
    let tmpl = std::env::temp_dir().join(format!("osv-{}-{}", std::process::id(), &id[..8]));
    let stdout_path = PathBuf::from(format!("{}-stdout.log", tmpl.display()));
    let stderr_path = PathBuf::from(format!("{}-stderr.log", tmpl.display()));

    let mut fout = std::fs::File::create(&stdout_path)?;
    writeln!(fout, "Started {}", chrono::Local::now().to_rfc3339())?;
    writeln!(fout, "Running command:")?;
    writeln!(fout, "{cmdline}")?;
    writeln!(fout, "{run_args:?}")?;
    writeln!(fout)?;
    fout.flush()?;
    let ferr = std::fs::File::create(&stderr_path)?;

    info!(
        stdout = %stdout_path.display(),
        stderr = %stderr_path.display(),
        "Guest console redirected"
    );
    let console = Console {
        stdout: ConsoleLog::open_at_end(&stdout_path)?,
        stderr: ConsoleLog::open_at_end(&stderr_path)?,
    };
    Ok((Stdio::from(fout), Stdio::from(ferr), console))
}
