//! Guest console scraping.
//!
//! The guest's console output is redirected to log files. Two facts are
//! scraped from it: the CLI prompt showing up, and the `eth0` address a DHCP
//! lease assigned.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// CLI prompt. Terminal garbage may precede it on the same line.
pub const PROMPT: &str = "/# ";

const ETH0: &str = "eth0: ";
const ETH0_MAC: &str = "eth0: ethernet address:";

/// Line separator of the guest console.
const LINE_END: &str = "\r\n";

/// Incremental scanner over console output.
#[derive(Debug, Default)]
pub struct ConsoleScanner {
    cmdline_up: bool,
    ip: Option<String>,
    // Unterminated tail of the previous chunk.
    pending: String,
}

impl ConsoleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmdline_up(&self) -> bool {
        self.cmdline_up
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Mark the prompt as seen without scanning (no console to scan).
    pub fn assume_cmdline_up(&mut self) {
        self.cmdline_up = true;
    }

    /// Feed the next chunk of console output.
    pub fn scan(&mut self, chunk: &str) {
        if self.cmdline_up && self.ip.is_some() {
            return;
        }
        self.pending.push_str(chunk);
        let text = std::mem::take(&mut self.pending);

        let mut lines: Vec<&str> = text.split(LINE_END).collect();
        let tail = lines.pop().unwrap_or_default();
        for line in lines {
            self.scan_line(line, true);
        }
        // The prompt is never followed by a line end.
        self.scan_line(tail, false);
        self.pending = tail.to_string();
    }

    fn scan_line(&mut self, line: &str, complete: bool) {
        if !self.cmdline_up && (line.starts_with(PROMPT) || line.ends_with(PROMPT)) {
            info!("Guest command prompt is up");
            self.cmdline_up = true;
        }
        if complete && self.ip.is_none() {
            if line.starts_with(ETH0_MAC) {
                debug!(line, "Ignoring eth0 hardware address line");
            } else if line.starts_with(ETH0) {
                if let Some(ip) = line.split(' ').nth(1).filter(|ip| !ip.is_empty()) {
                    info!(ip, "Guest IP via DHCP");
                    self.ip = Some(ip.to_string());
                }
            }
        }
    }
}

/// A console log file read from where the previous read stopped.
#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    file: File,
}

impl ConsoleLog {
    /// Open `path` positioned at its current end, so only output written
    /// from now on is returned.
    pub fn open_at_end(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything appended since the last call.
    pub fn read_new(&mut self) -> std::io::Result<String> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn prompt_at_start_or_end_of_line() {
        let mut s = ConsoleScanner::new();
        s.scan("OSv v0.24\r\nBooted up in 300 ms\r\n");
        assert!(!s.cmdline_up());
        s.scan("\x1b[6n/# ");
        assert!(s.cmdline_up());

        let mut s = ConsoleScanner::new();
        s.scan("/# random: device unblocked.\r\n");
        assert!(s.cmdline_up());
    }

    #[test]
    fn dhcp_address_is_second_word() {
        let mut s = ConsoleScanner::new();
        s.scan("eth0: ethernet address: 52:54:00:12:34:56\r\n");
        assert_eq!(s.ip(), None);
        s.scan("eth0: 192.168.122.37\r\n");
        assert_eq!(s.ip(), Some("192.168.122.37"));
    }

    #[test]
    fn address_split_across_chunks() {
        let mut s = ConsoleScanner::new();
        s.scan("eth0: 192.16");
        assert_eq!(s.ip(), None);
        s.scan("8.122.40\r\n/# ");
        assert_eq!(s.ip(), Some("192.168.122.40"));
        assert!(s.cmdline_up());
    }

    #[test]
    fn verbose_dhcp_line_is_not_an_address() {
        let mut s = ConsoleScanner::new();
        s.scan("[I/246 dhcp]: Configuring eth0: ip 192.168.122.37\r\n");
        assert_eq!(s.ip(), None);
    }

    #[test]
    fn log_reads_only_new_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osv-stdout.log");
        let mut writer = File::create(&path).unwrap();
        writeln!(writer, "Running command:").unwrap();

        let mut log = ConsoleLog::open_at_end(&path).unwrap();
        assert_eq!(log.read_new().unwrap(), "");
        write!(writer, "eth0: 10.0.0.7\r\n").unwrap();
        assert_eq!(log.read_new().unwrap(), "eth0: 10.0.0.7\r\n");
        assert_eq!(log.read_new().unwrap(), "");
        assert_eq!(log.path(), path.as_path());
    }
}
