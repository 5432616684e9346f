//! Process-level integration tests for the VM supervisor.
//!
//! These run without QEMU: the supervisor only needs a child process wired
//! to the console PTY and the inherited event-channel descriptors, so small
//! shell scripts stand in for a guest. They print to the serial console by
//! writing to stdout and emit guest events by writing JSON lines to fd 3.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vmharness::net::serve_http;
use vmharness::qemu::{
    cleanup, event_channel, event_channel_callback, log_serial_by_line, task, with_qemu_command,
    with_task, with_vm_timeout, Arch,
};
use vmharness::{qemu, Error};

#[derive(Debug, Deserialize, PartialEq)]
struct GuestEvent {
    id: u32,
}

/// Write an executable shell script that plays the guest.
fn guest_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

const EMIT_EVENTS: &str = r#"
i=0
while [ $i -lt 1000 ]; do
    printf '{"guestAction":"guestevent","actual":{"id":%d}}\n' "$i" >&3
    i=$((i+1))
done
"#;

#[tokio::test]
async fn console_expect_matches_guest_output() {
    // Idempotent; any test may ask for logging.
    vmharness::logging::init();

    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", "echo 'I AM HERE'");

    let mut vm = qemu::start(
        Arch::X86_64,
        [with_qemu_command(script.to_str().unwrap())],
    )
    .await
    .unwrap();

    vm.console.expect_string("I AM HERE").await.unwrap();
    vm.wait().await.unwrap();
}

#[tokio::test]
async fn serial_lines_reach_the_log_callback() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(
        dir.path(),
        "guest.sh",
        "echo 'first line'\necho 'second line'",
    );

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            log_serial_by_line(move |line| sink.lock().unwrap().push(line.to_string())),
        ],
    )
    .await
    .unwrap();

    vm.wait().await.unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l == "first line"), "lines: {lines:?}");
    assert!(lines.iter().any(|l| l == "second line"), "lines: {lines:?}");
}

#[tokio::test]
async fn event_channel_delivers_all_events_in_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(
        dir.path(),
        "guest.sh",
        &format!("{EMIT_EVENTS}printf '{{\"guestAction\":\"done\"}}\\n' >&3"),
    );

    let (events_tx, mut events_rx) = mpsc::channel::<GuestEvent>(16);
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            event_channel("test", events_tx),
        ],
    )
    .await
    .unwrap();

    let mut next = 0;
    while let Some(event) = events_rx.recv().await {
        assert_eq!(event.id, next, "events out of order");
        next += 1;
    }
    assert_eq!(next, 1000, "expected 1000 events before the channel closed");

    vm.wait().await.unwrap();
}

#[tokio::test]
async fn event_channel_without_done_fails_the_run() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", EMIT_EVENTS);

    let (events_tx, mut events_rx) = mpsc::channel::<GuestEvent>(16);
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            event_channel("test", events_tx),
        ],
    )
    .await
    .unwrap();

    // The channel still closes in the error case.
    let mut count = 0;
    while events_rx.recv().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 1000);

    match vm.wait().await {
        Err(Error::Task(errs)) => assert!(
            errs.contains(&Error::MissingDoneEvent),
            "task errors: {errs}"
        ),
        other => panic!("expected missing-done task error, got {other:?}"),
    }

    // Wait is idempotent and memoizes its result.
    assert!(matches!(vm.wait().await, Err(Error::Task(_))));
}

#[tokio::test]
async fn event_channel_callback_collects_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(
        dir.path(),
        "guest.sh",
        &format!("{EMIT_EVENTS}printf '{{\"guestAction\":\"done\"}}\\n' >&3"),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            event_channel_callback("test", move |e: GuestEvent| sink.lock().unwrap().push(e.id)),
        ],
    )
    .await
    .unwrap();

    vm.wait().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1000);
    assert!(events.iter().copied().eq(0..1000));
}

#[tokio::test]
async fn spawn_failure_cancels_tasks() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let result = timeout(
        Duration::from_secs(10),
        qemu::start(
            Arch::X86_64,
            [
                with_qemu_command("/does/not/exist/qemu"),
                with_task([task(move |cancel, _n| async move {
                    cancel.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })]),
            ],
        ),
    )
    .await
    .expect("start must not hang on spawn failure");

    assert!(matches!(result, Err(Error::Spawn(_))), "got {result:?}");
    assert!(cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn spawn_failure_still_runs_cleanup() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let result = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command("/does/not/exist/qemu"),
            with_task([cleanup(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })]),
        ],
    )
    .await;

    assert!(matches!(result, Err(Error::Spawn(_))));
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn event_channel_callback_does_not_hang_when_spawn_fails() {
    let result = timeout(
        Duration::from_secs(10),
        qemu::start(
            Arch::X86_64,
            [
                with_qemu_command("/does/not/exist/qemu"),
                event_channel_callback("test", |_e: GuestEvent| {}),
            ],
        ),
    )
    .await
    .expect("start must not hang on spawn failure");

    assert!(matches!(result, Err(Error::Spawn(_))));
}

#[tokio::test]
async fn serve_http_unblocks_when_spawn_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let router = axum::Router::new();

    let result = timeout(
        Duration::from_secs(10),
        qemu::start(
            Arch::X86_64,
            [
                with_qemu_command("/does/not/exist/qemu"),
                serve_http(router, listener),
            ],
        ),
    )
    .await
    .expect("start must not hang on spawn failure");

    assert!(matches!(result, Err(Error::Spawn(_))));
}

#[tokio::test]
async fn vm_timeout_kills_the_guest() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", "exec sleep 30");

    let started = Instant::now();
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            with_vm_timeout(Duration::from_millis(500)),
        ],
    )
    .await
    .unwrap();

    match vm.wait().await {
        Err(Error::ChildExit { status }) => {
            assert_eq!(status.signal(), Some(libc::SIGKILL), "status: {status}");
        }
        other => panic!("expected SIGKILL child exit, got {other:?}"),
    }
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "timeout took {:?}",
        started.elapsed()
    );

    // The memoized result comes back on the second call too.
    assert!(matches!(vm.wait().await, Err(Error::ChildExit { .. })));
}

#[tokio::test]
async fn kill_terminates_a_running_guest() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", "exec sleep 30");

    let mut vm = qemu::start(
        Arch::X86_64,
        [with_qemu_command(script.to_str().unwrap())],
    )
    .await
    .unwrap();

    vm.kill().unwrap();
    match vm.wait().await {
        Err(Error::ChildExit { status }) => {
            assert_eq!(status.signal(), Some(libc::SIGKILL));
        }
        other => panic!("expected SIGKILL child exit, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_guest_surfaces_exit_status() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", "exit 3");

    let mut vm = qemu::start(
        Arch::X86_64,
        [with_qemu_command(script.to_str().unwrap())],
    )
    .await
    .unwrap();

    match vm.wait().await {
        Err(Error::ChildExit { status }) => assert_eq!(status.code(), Some(3)),
        other => panic!("expected exit-code-3 child exit, got {other:?}"),
    }
}

#[tokio::test]
async fn tasks_observe_started_then_exited() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = guest_script(dir.path(), "guest.sh", "true");

    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = observed.clone();
    let mut vm = qemu::start(
        Arch::X86_64,
        [
            with_qemu_command(script.to_str().unwrap()),
            with_task([task(move |_cancel, mut n| async move {
                if n.vm_started().await {
                    log.lock().unwrap().push("started");
                }
                let exit = n.vm_exited().await;
                log.lock().unwrap().push("exited");
                assert!(exit.is_ok(), "exit: {exit:?}");
                Ok(())
            })]),
        ],
    )
    .await
    .unwrap();

    vm.wait().await.unwrap();
    assert_eq!(*observed.lock().unwrap(), ["started", "exited"]);
}

#[tokio::test]
async fn guest_stdin_reaches_the_console() {
    let dir = tempfile::TempDir::new().unwrap();
    // `read` pulls one line from the console; the guest echoes it back.
    let script = guest_script(dir.path(), "guest.sh", "read line\necho \"got: $line\"");

    let mut vm = qemu::start(
        Arch::X86_64,
        [with_qemu_command(script.to_str().unwrap())],
    )
    .await
    .unwrap();

    vm.console.send_line("ping").unwrap();
    vm.console.expect_string("got: ping").await.unwrap();
    vm.wait().await.unwrap();
}
