//! Tasks that run alongside the guest.
//!
//! A task is a future started just before the QEMU child is spawned. Each
//! task gets a [`CancellationToken`] (the harness-wide stop signal) and a
//! [`Notifications`] handle carrying two one-shot signals:
//!
//! - *VM started* — delivered once, after the child spawned successfully.
//!   Never delivered when the spawn fails.
//! - *VM exited* — always delivered once tasks have been started, carrying
//!   the child's wait result (or the spawn error).
//!
//! Tasks end on their own, after observing the exit notification, or after
//! observing cancellation. Their errors are aggregated into
//! [`Error::Task`](crate::Error::Task) by [`Vm::wait`](super::Vm::wait).

use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// The child's wait outcome as delivered to tasks: the exit status, or the
/// error that prevented one (spawn failure, wait failure).
pub type VmExit = Result<ExitStatus, Error>;

/// Result type returned by tasks.
pub type TaskResult = anyhow::Result<()>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// A cooperative worker running concurrently with the guest.
///
/// Build one with [`task`], or use the [`cleanup`] / [`wait_vm_started`]
/// helpers.
pub struct Task(Box<dyn FnOnce(CancellationToken, Notifications) -> TaskFuture + Send>);

impl Task {
    pub(crate) fn run(self, cancel: CancellationToken, n: Notifications) -> TaskFuture {
        (self.0)(cancel, n)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

/// Wrap an async closure as a [`Task`].
pub fn task<F, Fut>(f: F) -> Task
where
    F: FnOnce(CancellationToken, Notifications) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Task(Box::new(move |cancel, n| Box::pin(f(cancel, n))))
}

/// A task that runs `f` during teardown, whether or not the child ever
/// started.
///
/// The function runs once the exit notification arrives (which is also
/// delivered on spawn failure), so it participates in the task-group join on
/// every exit path.
pub fn cleanup<F>(f: F) -> Task
where
    F: FnOnce() -> TaskResult + Send + 'static,
{
    task(move |_cancel, mut n| async move {
        let _ = n.vm_exited().await;
        f()
    })
}

/// Defers `t` until the VM has started.
///
/// If the harness is cancelled (or the spawn fails) before the start
/// notification arrives, the wrapped task never runs and the wrapper returns
/// `Ok(())`.
pub fn wait_vm_started(t: Task) -> Task {
    task(move |cancel, mut n| async move {
        let started = tokio::select! {
            started = n.vm_started() => started,
            _ = cancel.cancelled() => false,
        };
        if started {
            t.run(cancel, n).await
        } else {
            Ok(())
        }
    })
}

/// Per-task lifecycle notifications.
#[derive(Debug, Clone)]
pub struct Notifications {
    started: watch::Receiver<bool>,
    exited: watch::Receiver<Option<VmExit>>,
}

impl Notifications {
    /// Wait until the VM has started.
    ///
    /// Returns `false` when the VM will never start (the spawn failed and the
    /// supervisor tore down the start signal).
    pub async fn vm_started(&mut self) -> bool {
        loop {
            if *self.started.borrow_and_update() {
                return true;
            }
            if self.started.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Wait for the VM exit notification.
    ///
    /// Delivered exactly once per run: after the supervisor has observed the
    /// child's wait result, or immediately with the spawn error when the
    /// child never started. Calling this again returns the same value.
    pub async fn vm_exited(&mut self) -> VmExit {
        loop {
            if let Some(exit) = self.exited.borrow_and_update().clone() {
                return exit;
            }
            if self.exited.changed().await.is_err() {
                // The supervisor dropped without delivering a wait result.
                return Err(Error::Wait(std::sync::Arc::new(std::io::Error::other(
                    "VM supervisor went away before the child was waited on",
                ))));
            }
        }
    }
}

/// Supervisor-side broadcast handles for task notifications.
///
/// One value per VM run; [`Notifications`] handed to tasks are subscriptions
/// to it.
#[derive(Debug)]
pub(crate) struct NotifierHub {
    started: watch::Sender<bool>,
    exited: watch::Sender<Option<VmExit>>,
}

impl NotifierHub {
    pub(crate) fn new() -> Self {
        Self {
            started: watch::Sender::new(false),
            exited: watch::Sender::new(None),
        }
    }

    pub(crate) fn subscribe(&self) -> Notifications {
        Notifications {
            started: self.started.subscribe(),
            exited: self.exited.subscribe(),
        }
    }

    /// Broadcast that the child spawned successfully.
    pub(crate) fn vm_started(&self) {
        self.started.send_replace(true);
    }

    /// Broadcast the child's wait result (or spawn error).
    pub(crate) fn vm_exited(&self, exit: VmExit) {
        self.exited.send_replace(Some(exit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn vm_started_observes_broadcast() {
        let hub = NotifierHub::new();
        let mut n = hub.subscribe();
        hub.vm_started();
        assert!(n.vm_started().await);
    }

    #[tokio::test]
    async fn vm_started_returns_false_when_hub_dropped() {
        let hub = NotifierHub::new();
        let mut n = hub.subscribe();
        drop(hub);
        assert!(!n.vm_started().await);
    }

    #[tokio::test]
    async fn vm_exited_is_repeatable() {
        let hub = NotifierHub::new();
        let mut n = hub.subscribe();
        hub.vm_exited(Err(Error::MissingDoneEvent));
        assert!(matches!(n.vm_exited().await, Err(Error::MissingDoneEvent)));
        assert!(matches!(n.vm_exited().await, Err(Error::MissingDoneEvent)));
    }

    #[tokio::test]
    async fn wait_vm_started_skips_task_on_cancel() {
        let hub = NotifierHub::new();
        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let wrapped = wait_vm_started(task(move |_c, _n| async move {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        }));

        cancel.cancel();
        wrapped.run(cancel, hub.subscribe()).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_runs_after_exit_notification() {
        let hub = NotifierHub::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let t = cleanup(move || {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        });

        let handle = tokio::spawn(t.run(CancellationToken::new(), hub.subscribe()));
        assert!(!ran.load(Ordering::SeqCst));
        hub.vm_exited(Err(Error::MissingDoneEvent));
        handle.await.unwrap().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
