//! VM supervisor: spawn, supervise, and tear down the QEMU child.
//!
//! Lifecycle: frozen [`Options`] → [`Options::start`] opens the console
//! PTY, starts all registered tasks, spawns QEMU, closes the child side of
//! the PTY in the parent, and broadcasts *VM started*. A dedicated wait
//! task reaps the child (honoring the VM timeout and cancellation) and
//! broadcasts *VM exited* to every task.
//!
//! Every exit path — clean exit, crash, timeout, kill, spawn failure —
//! funnels through the same teardown: cancel, notify, close the PTY, join
//! tasks. Nothing is left running once [`Vm::wait`] returns.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, TaskErrors};

use super::console::Console;
use super::options::{options_for, quote_cmdline, Configurator, Options};
use super::task::{NotifierHub, TaskResult, VmExit};
use super::Arch;

/// The most extra files a child can inherit. Keeps the post-fork fd shuffle
/// allocation-free.
const MAX_EXTRA_FILES: usize = 64;

/// Configure and start a VM in one call.
pub async fn start(
    arch: Arch,
    configurators: impl IntoIterator<Item = Configurator>,
) -> Result<Vm, Error> {
    options_for(arch, configurators)?.start().await
}

impl Options {
    /// Start the configured VM.
    ///
    /// On success the returned [`Vm`] owns the child process and all task
    /// joins. On spawn failure, every registered task is cancelled,
    /// notified, and joined before the error is returned — nothing leaks.
    pub async fn start(mut self) -> Result<Vm, Error> {
        let cmdline = self.cmdline()?;
        if cmdline.is_empty() {
            return Err(Error::Spawn(Arc::new(io::Error::other(
                "empty qemu command",
            ))));
        }
        if self.extra_files.len() > MAX_EXTRA_FILES {
            return Err(Error::Spawn(Arc::new(io::Error::other(format!(
                "too many inherited files: {} (limit {MAX_EXTRA_FILES})",
                self.extra_files.len()
            )))));
        }

        let sinks = std::mem::take(&mut self.serial_sinks);
        let (console, child_side) = Console::open(sinks)?;

        let cancel = CancellationToken::new();
        let hub = Arc::new(NotifierHub::new());

        // Tasks begin before the child spawns, so they can observe the
        // spawn-failure fast path.
        let mut task_handles: Vec<JoinHandle<TaskResult>> = Vec::new();
        for t in std::mem::take(&mut self.tasks) {
            task_handles.push(tokio::spawn(t.run(cancel.clone(), hub.subscribe())));
        }

        let extra_files = std::mem::take(&mut self.extra_files);
        let spawned = spawn_child(&cmdline, &child_side, &extra_files);

        // Close the child side of the PTY in the parent, synchronously,
        // success or not. This is the invariant that lets every console
        // reader unblock with EOF when the child exits (or never starts).
        drop(child_side);
        drop(extra_files);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = Error::Spawn(Arc::new(e));
                warn!(error = %err, cmdline = %quote_cmdline(&cmdline), "failed to start qemu");

                cancel.cancel();
                hub.vm_exited(Err(err.clone()));
                for handle in task_handles {
                    let _ = handle.await;
                }
                let _ = console.wait_eof().await;
                return Err(err);
            }
        };

        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        info!(pid = ?child.id(), "qemu started");
        debug!(cmdline = %quote_cmdline(&cmdline), "qemu command line");
        hub.vm_started();

        let vm_timeout = self.vm_timeout;
        let wait_hub = hub.clone();
        let wait_cancel = cancel.clone();
        let wait_task = tokio::spawn(async move {
            let exit: VmExit = match wait_child(&mut child, vm_timeout, &wait_cancel).await {
                Ok(status) => Ok(status),
                Err(e) => Err(Error::Wait(Arc::new(e))),
            };
            wait_hub.vm_exited(exit.clone());
            // Stopping: tasks that only watch the cancel signal must end now.
            wait_cancel.cancel();
            exit
        });

        Ok(Vm {
            console,
            cmdline,
            pid,
            wait_task: Some(wait_task),
            task_handles,
            result: None,
        })
    }
}

/// A running QEMU virtual machine.
pub struct Vm {
    /// The guest serial console.
    pub console: Console,
    cmdline: Vec<String>,
    pid: Option<Pid>,
    wait_task: Option<JoinHandle<VmExit>>,
    task_handles: Vec<JoinHandle<TaskResult>>,
    result: Option<Result<(), Error>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("cmdline", &self.cmdline)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// The argv the VM was started with.
    pub fn cmdline(&self) -> &[String] {
        &self.cmdline
    }

    /// The command line with whitespace-containing arguments quoted, for
    /// copy-and-paste into a shell.
    pub fn cmdline_quoted(&self) -> String {
        quote_cmdline(&self.cmdline)
    }

    /// Send SIGKILL to the child. Does not replace [`Vm::wait`].
    pub fn kill(&self) -> Result<(), Error> {
        self.signal(Signal::SIGKILL)
    }

    /// Forward an arbitrary signal to the child. Does not replace
    /// [`Vm::wait`].
    pub fn signal(&self, signal: Signal) -> Result<(), Error> {
        let pid = self.pid.ok_or(Error::Signal(nix::errno::Errno::ESRCH))?;
        nix::sys::signal::kill(pid, signal).map_err(Error::Signal)
    }

    /// Wait for the VM to exit and for all tasks to finish.
    ///
    /// Joins the child's wait result, drains the console to EOF, and joins
    /// every task. The final error is the first of: child exit error,
    /// console read error, aggregated task errors. Idempotent — subsequent
    /// calls return the memoized result.
    pub async fn wait(&mut self) -> Result<(), Error> {
        if let Some(result) = &self.result {
            return result.clone();
        }

        let exit: VmExit = match self.wait_task.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                Err(Error::Wait(Arc::new(io::Error::other(format!(
                    "child wait task failed: {e}"
                )))))
            }),
            None => Err(Error::Wait(Arc::new(io::Error::other(
                "child wait already consumed",
            )))),
        };

        let child_err = match &exit {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Error::ChildExit { status: *status }),
            Err(e) => Some(e.clone()),
        };

        let console_err = self.console.wait_eof().await.err();

        let mut task_errors = Vec::new();
        for handle in self.task_handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => task_errors.push(Arc::new(e)),
                Err(e) => task_errors.push(Arc::new(anyhow::anyhow!("task panicked: {e}"))),
            }
        }

        let result = if let Some(e) = child_err {
            Err(e)
        } else if let Some(e) = console_err {
            Err(e)
        } else if !task_errors.is_empty() {
            Err(Error::Task(TaskErrors(task_errors)))
        } else {
            Ok(())
        };

        match &result {
            Ok(()) => info!("VM exited cleanly"),
            Err(e) => warn!(error = %e, "VM run failed"),
        }
        self.result = Some(result.clone());
        result
    }
}

// ---------------------------------------------------------------------------
// Child process plumbing
// ---------------------------------------------------------------------------

fn spawn_child(
    cmdline: &[String],
    child_side: &OwnedFd,
    extra_files: &[Arc<OwnedFd>],
) -> io::Result<Child> {
    let stdin = child_side.try_clone()?;
    let stdout = child_side.try_clone()?;
    let stderr = child_side.try_clone()?;

    let mut cmd = Command::new(&cmdline[0]);
    cmd.args(&cmdline[1..])
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    if !extra_files.is_empty() {
        let raw_fds: Vec<libc::c_int> = extra_files.iter().map(|f| f.as_raw_fd()).collect();
        // Safety: inherit_extra_files only calls async-signal-safe libc
        // functions (fcntl, dup2, close) and allocates nothing.
        unsafe {
            cmd.pre_exec(move || inherit_extra_files(&raw_fds));
        }
    }

    cmd.spawn()
}

/// Post-fork: pin each inherited file to fd `3 + index` in the child.
///
/// Two passes so a source fd sitting inside the target window is never
/// clobbered before it has been duplicated.
fn inherit_extra_files(fds: &[libc::c_int]) -> io::Result<()> {
    let base = 3 + fds.len() as libc::c_int;
    let mut moved = [-1 as libc::c_int; MAX_EXTRA_FILES];

    for (i, &fd) in fds.iter().enumerate() {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD, base) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        moved[i] = dup;
    }
    for (i, &dup) in moved[..fds.len()].iter().enumerate() {
        if unsafe { libc::dup2(dup, 3 + i as libc::c_int) } < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::close(dup) };
    }
    Ok(())
}

async fn wait_child(
    child: &mut Child,
    vm_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> io::Result<std::process::ExitStatus> {
    let deadline = async {
        match vm_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    // The wait future is dropped when the select resolves, releasing the
    // child borrow for the kill below.
    tokio::select! {
        status = child.wait() => return status,
        _ = cancel.cancelled() => {
            debug!("run cancelled, killing qemu");
        }
        _ = deadline => {
            warn!(timeout = ?vm_timeout, "VM timeout expired, killing qemu");
        }
    }

    let _ = child.start_kill();
    child.wait().await
}
