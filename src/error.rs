//! Error type for the VM harness.
//!
//! Every fallible public operation in this crate returns [`Error`]. The type
//! is `Clone` (io sources are wrapped in `Arc`) so that
//! [`Vm::wait`](crate::qemu::Vm::wait) can memoize its outcome and hand the
//! same error back on every call.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

/// Errors produced while configuring, starting, or supervising a VM.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The guest architecture could not be determined from the environment.
    #[error(
        "could not determine guest architecture from VMHARNESS_QEMU_ARCH or VMHARNESS_ARCH"
    )]
    NoGuestArch,

    /// The guest architecture string is not one QEMU (or this crate) knows.
    #[error("unsupported guest architecture {0:?}")]
    UnsupportedArch(String),

    /// `VMHARNESS_TIMEOUT` did not parse as a duration.
    #[error("invalid VMHARNESS_TIMEOUT value {value:?}: {reason}")]
    InvalidTimeout { value: String, reason: String },

    /// Kernel arguments were configured, but no kernel image to pass them to.
    #[error("kernel args are required but cannot be added due to bootloader")]
    KernelRequiredForArgs,

    /// A configurator was given an empty directory path.
    #[error("no directory given")]
    InvalidDir,

    /// A 9p configurator was given an empty mount tag.
    #[error("no 9p mount tag given")]
    InvalidTag,

    /// A path that must be a directory is something else.
    #[error("{0:?} is not a directory")]
    IsNotDir(PathBuf),

    /// A configurator-supplied path could not be stat'd.
    #[error("failed to stat {path:?}")]
    Stat {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// A host-network configurator was given an unusable CIDR.
    #[error("invalid network CIDR {0:?}")]
    InvalidCidr(String),

    /// `Console::expect_pattern` was given an invalid regular expression.
    #[error("invalid expect pattern: {0}")]
    InvalidPattern(String),

    /// Opening a pseudo-terminal pair failed.
    #[error("failed to open pty")]
    OpenPty(#[source] Arc<io::Error>),

    /// Creating a host-side pipe failed.
    #[error("failed to create pipe")]
    Pipe(#[source] Arc<io::Error>),

    /// The QEMU child process could not be started.
    #[error("failed to start qemu")]
    Spawn(#[source] Arc<io::Error>),

    /// Waiting on the QEMU child process failed.
    #[error("failed to wait for qemu")]
    Wait(#[source] Arc<io::Error>),

    /// QEMU exited unsuccessfully (non-zero exit code or killed by signal).
    #[error("qemu exited unsuccessfully: {status}")]
    ChildExit { status: ExitStatus },

    /// Delivering a signal to the QEMU child failed.
    #[error("failed to signal qemu: {0}")]
    Signal(nix::errno::Errno),

    /// Reading the guest serial console failed.
    #[error("failed to read guest console")]
    ConsoleRead(#[source] Arc<io::Error>),

    /// Writing to the guest serial console failed.
    #[error("failed to write to guest console")]
    ConsoleWrite(#[source] Arc<io::Error>),

    /// The console reached EOF before the expected output appeared.
    #[error("console closed before matching {pattern:?}")]
    ConsoleEof { pattern: String },

    /// The guest exited without emitting the terminal event-channel event.
    #[error(
        "never received the final event channel event \
         (did the guest close its event channel emitter?)"
    )]
    MissingDoneEvent,

    /// An event file could not be read.
    #[error("failed to read event file {path:?}")]
    EventFile {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// An event-channel line was not a valid event object.
    #[error("invalid event line {line:?}: {reason}")]
    EventDecode { line: String, reason: String },

    /// One or more tasks running alongside the VM returned an error.
    #[error("one or more VM tasks failed: {0}")]
    Task(TaskErrors),
}

impl Error {
    /// Helper for wrapping io errors from stat calls.
    pub(crate) fn stat(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Stat {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

/// Aggregated task failures, in task registration order.
///
/// Individual errors are the `anyhow::Error` values returned by tasks; use
/// [`TaskErrors::contains`] to look for a specific [`Error`] kind (for
/// example [`Error::MissingDoneEvent`] from an event-channel task).
#[derive(Debug, Clone, Default)]
pub struct TaskErrors(pub Vec<Arc<anyhow::Error>>);

impl TaskErrors {
    /// Returns true when any aggregated task error is the given [`Error`]
    /// kind (matched by `std::mem::discriminant`).
    pub fn contains(&self, kind: &Error) -> bool {
        self.0.iter().any(|e| {
            e.chain().any(|cause| {
                cause
                    .downcast_ref::<Error>()
                    .is_some_and(|err| std::mem::discriminant(err) == std::mem::discriminant(kind))
            })
        })
    }
}

impl std::fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err:#}")?;
            first = false;
        }
        Ok(())
    }
}
