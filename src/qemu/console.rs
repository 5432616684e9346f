//! Serial console fabric.
//!
//! The guest's serial console rides on a pseudo-terminal pair: the child
//! side becomes QEMU's stdin/stdout/stderr, the parent side feeds a reader
//! on the blocking pool that tees every byte to the registered
//! [`SerialSink`]s and into an expect buffer.
//!
//! The one invariant that keeps everything from hanging: the supervisor
//! closes the child side in the parent immediately after spawning, so the
//! reader observes EOF (or `EIO` from the ptm, which amounts to the same
//! thing on Linux) as soon as the child exits — and with it every
//! `expect_*` caller and every sink consumer unblocks.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Error;

// ---------------------------------------------------------------------------
// SerialSink
// ---------------------------------------------------------------------------

/// An output target receiving a copy of all guest serial console bytes.
///
/// Sinks are owned by the console reader once the VM starts; they are
/// flushed and closed (dropped) when the reader unblocks at guest exit.
/// Write and close errors are logged, never propagated.
pub struct SerialSink {
    writer: Box<dyn Write + Send>,
}

impl SerialSink {
    /// Wrap a writer as a sink. Dropping the sink closes the writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    fn close(mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "failed to flush serial sink");
        }
    }
}

impl std::fmt::Debug for SerialSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SerialSink")
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BufState {
    buf: Vec<u8>,
    eof: bool,
    read_err: Option<Arc<io::Error>>,
}

/// The guest's serial console, with expect-style matching.
///
/// All accumulated output is kept; `expect_*` calls consume from a cursor,
/// so successive expectations match successive output.
pub struct Console {
    state: Arc<Mutex<BufState>>,
    version: watch::Receiver<u64>,
    writer: std::fs::File,
    pos: usize,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Console")
    }
}

impl Console {
    /// Open the console PTY pair and start the reader.
    ///
    /// Returns the console and the child side of the pair, which the
    /// supervisor passes to QEMU as stdio and then closes in the parent.
    pub(crate) fn open(sinks: Vec<SerialSink>) -> Result<(Console, OwnedFd), Error> {
        let pty = nix::pty::openpty(None, None)
            .map_err(|e| Error::OpenPty(Arc::new(io::Error::from_raw_os_error(e as i32))))?;

        // Pty fds must not leak into other children spawned from this
        // process (a second VM inheriting our pts would delay EOF).
        set_cloexec(&pty.master).map_err(|e| Error::OpenPty(Arc::new(e)))?;
        set_cloexec(&pty.slave).map_err(|e| Error::OpenPty(Arc::new(e)))?;

        let reader = std::fs::File::from(
            pty.master
                .try_clone()
                .map_err(|e| Error::OpenPty(Arc::new(e)))?,
        );
        let writer = std::fs::File::from(pty.master);

        let state = Arc::new(Mutex::new(BufState::default()));
        let (version_tx, version_rx) = watch::channel(0u64);

        let reader_state = state.clone();
        tokio::task::spawn_blocking(move || read_loop(reader, sinks, reader_state, version_tx));

        Ok((
            Console {
                state,
                version: version_rx,
                writer,
                pos: 0,
            },
            pty.slave,
        ))
    }

    /// Wait until the guest prints `needle`, consuming console output up to
    /// and including the match.
    pub async fn expect_string(&mut self, needle: &str) -> Result<String, Error> {
        let needle = needle.as_bytes().to_vec();
        let shown = String::from_utf8_lossy(&needle).into_owned();
        self.expect_inner(shown, move |hay| {
            find_subslice(hay, &needle).map(|i| i + needle.len())
        })
        .await
    }

    /// Wait until the guest output matches the regular expression,
    /// consuming console output up to and including the match.
    pub async fn expect_pattern(&mut self, pattern: &str) -> Result<String, Error> {
        let re = regex::bytes::Regex::new(pattern)
            .map_err(|e| Error::InvalidPattern(e.to_string()))?;
        self.expect_inner(pattern.to_string(), move |hay| {
            re.find(hay).map(|m| m.end())
        })
        .await
    }

    /// Wait for the console to reach EOF and return the remaining output.
    pub async fn expect_eof(&mut self) -> Result<String, Error> {
        self.wait_eof().await?;
        let state = self.state.lock().expect("console state poisoned");
        let rest = String::from_utf8_lossy(&state.buf[self.pos..]).into_owned();
        self.pos = state.buf.len();
        Ok(rest)
    }

    /// Write bytes into the guest console (guest stdin).
    pub fn send(&mut self, input: &str) -> Result<(), Error> {
        self.writer
            .write_all(input.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| Error::ConsoleWrite(Arc::new(e)))
    }

    /// Write a line into the guest console.
    pub fn send_line(&mut self, input: &str) -> Result<(), Error> {
        self.send(&format!("{input}\n"))
    }

    /// Block until the reader has observed EOF; surfaces any read error.
    pub(crate) async fn wait_eof(&self) -> Result<(), Error> {
        let mut version = self.version.clone();
        loop {
            version.borrow_and_update();
            {
                let state = self.state.lock().expect("console state poisoned");
                if state.eof {
                    return match &state.read_err {
                        Some(e) => Err(Error::ConsoleRead(e.clone())),
                        None => Ok(()),
                    };
                }
            }
            if version.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    async fn expect_inner(
        &mut self,
        pattern: String,
        matcher: impl Fn(&[u8]) -> Option<usize>,
    ) -> Result<String, Error> {
        let mut version = self.version.clone();
        loop {
            version.borrow_and_update();
            {
                let state = self.state.lock().expect("console state poisoned");
                if let Some(end) = matcher(&state.buf[self.pos..]) {
                    let matched =
                        String::from_utf8_lossy(&state.buf[self.pos..self.pos + end]).into_owned();
                    self.pos += end;
                    return Ok(matched);
                }
                if state.eof {
                    return match &state.read_err {
                        Some(e) => Err(Error::ConsoleRead(e.clone())),
                        None => Err(Error::ConsoleEof { pattern }),
                    };
                }
            }
            if version.changed().await.is_err() {
                return Err(Error::ConsoleEof { pattern });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

fn read_loop(
    mut reader: std::fs::File,
    mut sinks: Vec<SerialSink>,
    state: Arc<Mutex<BufState>>,
    version: watch::Sender<u64>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for sink in &mut sinks {
                    if let Err(e) = sink.write_all(&buf[..n]) {
                        warn!(error = %e, "failed to write to serial sink");
                    }
                }
                state
                    .lock()
                    .expect("console state poisoned")
                    .buf
                    .extend_from_slice(&buf[..n]);
                version.send_modify(|v| *v += 1);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Reading the ptm after the last pts handle closed fails with
            // EIO on Linux; that is the console's EOF.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                state.lock().expect("console state poisoned").read_err = Some(Arc::new(e));
                break;
            }
        }
    }

    debug!("guest console reached EOF");
    for sink in sinks.drain(..) {
        sink.close();
    }
    {
        let mut state = state.lock().expect("console state poisoned");
        state.eof = true;
    }
    version.send_modify(|v| *v += 1);
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Mark an fd close-on-exec.
pub(crate) fn set_cloexec(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
