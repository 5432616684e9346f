//! JSON event channel between guest and host.
//!
//! A virtio-serial port carries newline-delimited JSON objects from the
//! guest to the host:
//!
//! ```text
//! {"guestAction":"guestevent","actual":<T-shaped JSON>}
//! {"guestAction":"done"}
//! ```
//!
//! One object per line; the `done` object is terminal and promises that no
//! further events follow. A guest that exits without sending `done` makes
//! the VM run fail with [`Error::MissingDoneEvent`] — that is what
//! distinguishes "the guest finished" from "the guest died mid-stream".
//!
//! The host side of the port is a PTY pair: the child side is handed to
//! QEMU as a pipe chardev through an inherited file descriptor, the parent
//! side is read line-by-line by a channel task.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Error;

use super::console::set_cloexec;
use super::options::{configurator, Configurator};
use super::task::{task, wait_vm_started};

/// Guest actions carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// A regular guest event; `actual` carries the payload.
    #[serde(rename = "guestevent")]
    GuestEvent,
    /// Terminal event: no more events will be sent.
    #[serde(rename = "done")]
    Done,
}

/// The wire object for one event-channel line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Event<T> {
    #[serde(rename = "guestAction")]
    pub guest_action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<T>,
}

fn decode_line<T: DeserializeOwned>(line: &str) -> Result<Event<T>, Error> {
    serde_json::from_str(line).map_err(|e| Error::EventDecode {
        line: line.to_string(),
        reason: e.to_string(),
    })
}

/// Add a virtio-serial-backed channel that delivers guest events of type `T`
/// to `events`.
///
/// The guest finds the port by `name` under `/sys/class/virtio-ports` and
/// writes one JSON event per line. Each decoded event is forwarded on
/// `events`; a bounded channel makes the guest block once the host stops
/// consuming (backpressure is intentional). The sender is dropped — and the
/// receiver therefore closed — when the guest sends `done`, exits, or the
/// channel task fails.
pub fn event_channel<T>(name: impl Into<String>, events: mpsc::Sender<T>) -> Configurator
where
    T: DeserializeOwned + Send + 'static,
{
    let name = name.into();
    configurator(move |alloc, opts| {
        let pipe_id = alloc.id("pipe");

        let pty = nix::pty::openpty(None, None).map_err(|e| {
            Error::OpenPty(Arc::new(std::io::Error::from_raw_os_error(e as i32)))
        })?;
        set_cloexec(&pty.master).map_err(|e| Error::OpenPty(Arc::new(e)))?;
        set_cloexec(&pty.slave).map_err(|e| Error::OpenPty(Arc::new(e)))?;

        let child_side = Arc::new(pty.slave);
        let fd = opts.add_file(child_side.clone());
        opts.append_qemu([
            "-device".to_string(),
            "virtio-serial".to_string(),
            "-device".to_string(),
            format!("virtserialport,chardev={pipe_id},name={name}"),
            "-chardev".to_string(),
            format!("pipe,id={pipe_id},path=/proc/self/fd/{fd}"),
        ]);

        let parent_side = pty.master;
        opts.tasks.push(wait_vm_started(task(move |_cancel, _n| {
            run_channel(parent_side, child_side, events)
        })));
        Ok(())
    })
}

async fn run_channel<T>(
    parent_side: OwnedFd,
    child_side: Arc<OwnedFd>,
    events: mpsc::Sender<T>,
) -> anyhow::Result<()>
where
    T: DeserializeOwned + Send + 'static,
{
    // Release the parent's reference to the child side; the guest holds its
    // own inherited copy, and ours would keep the ptm readable forever.
    drop(child_side);

    let reader = tokio::fs::File::from_std(std::fs::File::from(parent_side));
    let mut lines = BufReader::new(reader).lines();
    let mut got_done = false;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let event: Event<T> = match decode_line(line) {
                    Ok(event) => event,
                    Err(e) => {
                        drop(events);
                        return Err(e.into());
                    }
                };
                match event.guest_action {
                    Action::GuestEvent => {
                        if let Some(actual) = event.actual {
                            // A dropped receiver only means the caller stopped
                            // listening; keep draining so the guest is not
                            // blocked on a full virtio queue.
                            let _ = events.send(actual).await;
                        }
                    }
                    Action::Done => {
                        debug!("event channel received done event");
                        got_done = true;
                        break;
                    }
                }
            }
            Ok(None) => break,
            // EIO from the ptm after the guest side closed is EOF.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                drop(events);
                return Err(anyhow::Error::new(e).context("reading event channel"));
            }
        }
    }

    drop(events);
    if !got_done {
        return Err(Error::MissingDoneEvent.into());
    }
    Ok(())
}

/// Like [`event_channel`], but invokes `callback` for each guest event.
///
/// A second task drains an internal channel and calls the callback; it also
/// exits on cancellation so a VM that never starts does not leak a waiter.
pub fn event_channel_callback<T, F>(name: impl Into<String>, mut callback: F) -> Configurator
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let name = name.into();
    configurator(move |alloc, opts| {
        let (tx, mut rx) = mpsc::channel::<T>(16);
        opts.tasks.push(task(move |cancel, _n| async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => callback(event),
                        None => return Ok(()),
                    },
                    _ = cancel.cancelled() => {
                        // The run is over and the channel task is about to
                        // drop its sender (it does so on EOF, on `done`, and
                        // when the VM never starts). Drain what is already
                        // in flight instead of dropping events on the floor.
                        while let Some(event) = rx.recv().await {
                            callback(event);
                        }
                        return Ok(());
                    }
                }
            }
        }));
        event_channel(name, tx).apply(alloc, opts)
    })
}

/// Read a file full of event-channel JSON lines.
///
/// Used for on-disk event handoff: a guest can write the same wire format to
/// a file (for example on a shared 9p directory) instead of a live channel.
/// The done-event invariant applies here too.
pub fn read_event_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, Error> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| Error::EventFile {
        path: path.to_path_buf(),
        source: Arc::new(e),
    })?;

    let mut out = Vec::new();
    let mut got_done = false;
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let event: Event<T> = decode_line(line)?;
        match event.guest_action {
            Action::GuestEvent => {
                if let Some(actual) = event.actual {
                    out.push(actual);
                }
            }
            Action::Done => {
                got_done = true;
                break;
            }
        }
    }
    if !got_done {
        return Err(Error::MissingDoneEvent);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: u32,
    }

    #[test]
    fn wire_format_round_trips() {
        let event = Event {
            guest_action: Action::GuestEvent,
            actual: Some(Ping { id: 7 }),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(line, r#"{"guestAction":"guestevent","actual":{"id":7}}"#);

        let back: Event<Ping> = decode_line(&line).unwrap();
        assert_eq!(back.guest_action, Action::GuestEvent);
        assert_eq!(back.actual, Some(Ping { id: 7 }));
    }

    #[test]
    fn done_event_carries_no_payload() {
        let event: Event<Ping> = decode_line(r#"{"guestAction":"done"}"#).unwrap();
        assert_eq!(event.guest_action, Action::Done);
        assert!(event.actual.is_none());

        let line = serde_json::to_string(&Event::<Ping> {
            guest_action: Action::Done,
            actual: None,
        })
        .unwrap();
        assert_eq!(line, r#"{"guestAction":"done"}"#);
    }

    #[test]
    fn garbage_lines_are_decode_errors() {
        match decode_line::<Ping>("not json") {
            Err(Error::EventDecode { line, .. }) => assert_eq!(line, "not json"),
            other => panic!("expected EventDecode, got {other:?}"),
        }
    }

    #[test]
    fn read_event_file_collects_events_until_done() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(
            &path,
            concat!(
                "{\"guestAction\":\"guestevent\",\"actual\":{\"id\":0}}\n",
                "{\"guestAction\":\"guestevent\",\"actual\":{\"id\":1}}\n",
                "{\"guestAction\":\"done\"}\n",
            ),
        )
        .unwrap();

        let events: Vec<Ping> = read_event_file(&path).unwrap();
        assert_eq!(events, vec![Ping { id: 0 }, Ping { id: 1 }]);
    }

    #[test]
    fn read_event_file_requires_done() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, "{\"guestAction\":\"guestevent\",\"actual\":{\"id\":0}}\n").unwrap();

        match read_event_file::<Ping>(&path) {
            Err(Error::MissingDoneEvent) => {}
            other => panic!("expected MissingDoneEvent, got {other:?}"),
        }
    }
}
