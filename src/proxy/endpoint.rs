//! Local stream endpoints: the proxy's own stdin, stdout and stderr.
//!
//! Endpoints wrap the file descriptor in a mio pipe handle so they can be
//! switched to non-blocking mode and registered with the poller. Regular
//! files and `/dev/null` cannot be registered (`EPERM` from epoll); such an
//! endpoint is marked not pollable and the loop treats it as always ready.
//!
//! A descriptor duplicated from the process's own stdio shares its open file
//! description, and with it `O_NONBLOCK`, with fds 0/1/2 and often with the
//! parent shell's terminal. Endpoints therefore record the status flags they
//! found and put them back when dropped.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use mio::unix::pipe;
use mio::{Interest, Registry, Token};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 4096;

/// Upper bound on bytes pulled from an always-ready input per iteration, so a
/// large redirected file does not monopolise one turn of the loop.
const UNPOLLED_READ_BUDGET: usize = 64 * 1024;

/// How an endpoint participates in readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Polled,
    AlwaysReady,
}

/// Switch `fd` to non-blocking mode, returning the flags it had before.
fn set_nonblocking(fd: BorrowedFd<'_>) -> std::io::Result<OFlag> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(flags)
}

fn restore_flags(name: &str, fd: BorrowedFd<'_>, saved: OFlag) {
    if saved.contains(OFlag::O_NONBLOCK) {
        return;
    }
    match fcntl(fd, FcntlArg::F_SETFL(saved)) {
        Ok(_) => trace!(endpoint = name, "Status flags restored"),
        Err(err) => warn!(endpoint = name, %err, "Failed to restore status flags"),
    }
}

fn register_or_fallback<S: mio::event::Source + ?Sized>(
    name: &str,
    source: &mut S,
    registry: &Registry,
    token: Token,
    interest: Interest,
) -> std::io::Result<Readiness> {
    match registry.register(source, token, interest) {
        Ok(()) => Ok(Readiness::Polled),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            debug!(endpoint = name, "Not pollable, treating as always ready");
            Ok(Readiness::AlwaysReady)
        }
        Err(err) => Err(err),
    }
}

/// Line-buffered local input (the proxy's stdin).
#[derive(Debug)]
pub struct LocalInput {
    name: String,
    source: pipe::Receiver,
    partial: Vec<u8>,
    eof: bool,
    readiness: Readiness,
    saved_flags: OFlag,
}

impl LocalInput {
    pub fn new(name: impl Into<String>, source: pipe::Receiver) -> std::io::Result<Self> {
        let saved_flags = set_nonblocking(source.as_fd())?;
        Ok(Self {
            name: name.into(),
            source,
            partial: Vec::new(),
            eof: false,
            readiness: Readiness::Polled,
            saved_flags,
        })
    }

    /// Take ownership of an arbitrary readable descriptor.
    pub fn from_fd(name: impl Into<String>, fd: OwnedFd) -> std::io::Result<Self> {
        Self::new(name, pipe::Receiver::from(fd))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        self.readiness =
            register_or_fallback(&self.name, &mut self.source, registry, token, Interest::READABLE)?;
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if self.readiness == Readiness::Polled {
            if let Err(err) = registry.deregister(&mut self.source) {
                debug!(endpoint = %self.name, ?err, "Deregister failed");
            }
        }
    }

    /// Read whatever is available and split it into lines.
    ///
    /// Every returned message is one complete line including its `\n`. At end
    /// of stream the unterminated remainder, if any, is returned as a final
    /// message and [`is_eof`](Self::is_eof) turns true.
    pub fn read_lines(&mut self) -> std::io::Result<Vec<Vec<u8>>> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            if self.readiness == Readiness::AlwaysReady && total >= UNPOLLED_READ_BUDGET {
                break;
            }
            match self.source.read(&mut chunk) {
                Ok(0) => {
                    debug!(endpoint = %self.name, "End of stream");
                    self.eof = true;
                }
                Ok(n) => {
                    trace!(endpoint = %self.name, len = n, "Read from local input");
                    total += n;
                    self.partial.extend_from_slice(&chunk[..n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(self.take_lines())
    }

    fn take_lines(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let rest = self.partial.split_off(pos + 1);
            lines.push(std::mem::replace(&mut self.partial, rest));
        }
        if self.eof && !self.partial.is_empty() {
            lines.push(std::mem::take(&mut self.partial));
        }
        lines
    }
}

impl Drop for LocalInput {
    fn drop(&mut self) {
        restore_flags(&self.name, self.source.as_fd(), self.saved_flags);
    }
}

/// Local output stream (the proxy's stdout or stderr).
#[derive(Debug)]
pub struct LocalOutput {
    name: String,
    sink: pipe::Sender,
    readiness: Readiness,
    registered: bool,
    saved_flags: OFlag,
}

impl LocalOutput {
    pub fn new(name: impl Into<String>, sink: pipe::Sender) -> std::io::Result<Self> {
        let saved_flags = set_nonblocking(sink.as_fd())?;
        Ok(Self {
            name: name.into(),
            sink,
            readiness: Readiness::Polled,
            registered: false,
            saved_flags,
        })
    }

    /// Take ownership of an arbitrary writable descriptor.
    pub fn from_fd(name: impl Into<String>, fd: OwnedFd) -> std::io::Result<Self> {
        Self::new(name, pipe::Sender::from(fd))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// Start watching for writability. A no-op for always-ready sinks.
    pub(crate) fn watch_writable(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        if self.registered || self.readiness == Readiness::AlwaysReady {
            return Ok(());
        }
        self.readiness =
            register_or_fallback(&self.name, &mut self.sink, registry, token, Interest::WRITABLE)?;
        self.registered = self.readiness == Readiness::Polled;
        Ok(())
    }

    pub(crate) fn unwatch(&mut self, registry: &Registry) {
        if self.registered {
            if let Err(err) = registry.deregister(&mut self.sink) {
                debug!(endpoint = %self.name, ?err, "Deregister failed");
            }
            self.registered = false;
        }
    }

    /// Write as much of `msg` as the sink accepts without blocking.
    ///
    /// Returns the number of bytes written; the caller keeps the rest.
    pub fn write_some(&mut self, msg: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < msg.len() {
            match self.sink.write(&msg[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.sink.flush()?;
        Ok(written)
    }
}

impl Drop for LocalOutput {
    fn drop(&mut self) {
        restore_flags(&self.name, self.sink.as_fd(), self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines_and_keeps_partial() {
        let (mut tx, rx) = pipe::new().unwrap();
        let mut input = LocalInput::new("<stdin>", rx).unwrap();

        tx.write_all(b"one\ntwo\nthr").unwrap();
        let lines = input.read_lines().unwrap();
        assert_eq!(lines, vec![b"one\n".to_vec(), b"two\n".to_vec()]);
        assert!(!input.is_eof());

        tx.write_all(b"ee\n").unwrap();
        assert_eq!(input.read_lines().unwrap(), vec![b"three\n".to_vec()]);
    }

    #[test]
    fn eof_flushes_unterminated_remainder() {
        let (mut tx, rx) = pipe::new().unwrap();
        let mut input = LocalInput::new("<stdin>", rx).unwrap();

        tx.write_all(b"last").unwrap();
        drop(tx);
        assert_eq!(input.read_lines().unwrap(), vec![b"last".to_vec()]);
        assert!(input.is_eof());
        assert!(input.read_lines().unwrap().is_empty());
    }

    #[test]
    fn empty_pipe_yields_nothing_without_blocking() {
        let (_tx, rx) = pipe::new().unwrap();
        let mut input = LocalInput::new("<stdin>", rx).unwrap();
        assert!(input.read_lines().unwrap().is_empty());
        assert!(!input.is_eof());
    }

    #[test]
    fn write_some_delivers_whole_message() {
        let (tx, mut rx) = pipe::new().unwrap();
        let mut out = LocalOutput::new("<stdout>", tx).unwrap();
        assert_eq!(out.write_some(b"result=42").unwrap(), 9);

        let mut buf = [0u8; 16];
        let n = rx.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"result=42");
    }

    #[test]
    fn regular_file_falls_back_to_always_ready() {
        let file = tempfile::tempfile().unwrap();
        let mut out = LocalOutput::from_fd("<file>", OwnedFd::from(file)).unwrap();
        let poll = mio::Poll::new().unwrap();
        out.watch_writable(poll.registry(), Token(7)).unwrap();
        assert_eq!(out.readiness(), Readiness::AlwaysReady);
        assert_eq!(out.write_some(b"abc").unwrap(), 3);
    }

    fn is_nonblocking(fd: BorrowedFd<'_>) -> bool {
        OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap()).contains(OFlag::O_NONBLOCK)
    }

    #[test]
    fn shared_descriptor_is_blocking_again_after_drop() {
        let (reader, writer) = std::io::pipe().unwrap();
        assert!(!is_nonblocking(reader.as_fd()));

        let input = LocalInput::from_fd("<stdin>", reader.try_clone().unwrap().into()).unwrap();
        let output = LocalOutput::from_fd("<stdout>", writer.try_clone().unwrap().into()).unwrap();
        // The duplicate shares the open file description with the original.
        assert!(is_nonblocking(reader.as_fd()));
        assert!(is_nonblocking(writer.as_fd()));

        drop(input);
        drop(output);
        assert!(!is_nonblocking(reader.as_fd()));
        assert!(!is_nonblocking(writer.as_fd()));
    }

    #[test]
    fn already_nonblocking_descriptor_is_left_nonblocking() {
        let (_tx, rx) = pipe::new().unwrap();
        let same_fd = rx.as_fd().try_clone_to_owned().unwrap();
        drop(LocalInput::new("<stdin>", rx).unwrap());
        assert!(is_nonblocking(same_fd.as_fd()));
    }
}
