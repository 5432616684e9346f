//! vmharness — a host-side integration-test harness for QEMU guests.
//!
//! Declaratively configure a QEMU guest (kernel, root filesystem, devices,
//! networking), start it, drive it by matching expected text on its serial
//! console, exchange structured JSON events with in-guest code over a
//! virtio-serial port, and tear everything down deterministically — on
//! success, failure, timeout, or when QEMU never starts at all.
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use vmharness::qemu;
//!
//! #[derive(serde::Deserialize)]
//! struct TestEvent {
//!     id: u32,
//! }
//!
//! # async fn example() -> Result<(), vmharness::Error> {
//! let (events_tx, mut events_rx) = mpsc::channel::<TestEvent>(16);
//!
//! let mut vm = qemu::start(
//!     qemu::Arch::UseEnv,
//!     [
//!         qemu::with_kernel("./bzImage"),
//!         qemu::with_initramfs("./initramfs.cpio"),
//!         qemu::log_serial_by_line(|line| println!("vm: {line}")),
//!         qemu::event_channel("test", events_tx),
//!         qemu::with_vm_timeout(std::time::Duration::from_secs(60)),
//!     ],
//! )
//! .await?;
//!
//! while let Some(event) = events_rx.recv().await {
//!     println!("guest event {}", event.id);
//! }
//!
//! vm.console.expect_string("TESTS PASSED").await?;
//! vm.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate is organised around the [`qemu`] supervisor module;
//! [`net`] adds network configurators and a VM-bound HTTP server,
//! [`firmware`] adds UEFI booting, and [`logging`] wires up `tracing` for
//! test binaries.

pub mod error;
pub mod firmware;
pub mod logging;
pub mod net;
pub mod qemu;

pub use error::{Error, TaskErrors};
