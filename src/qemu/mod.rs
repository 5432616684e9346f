//! Host-side QEMU supervisor.
//!
//! Builds a QEMU command line from composable configurators, runs QEMU as a
//! supervised child on a PTY, multiplexes cooperative tasks alongside the
//! guest, and guarantees orderly teardown on every exit path.
//!
//! ## Sub-modules
//!
//! - `arch` — guest architecture selection
//! - `id` — QEMU option ID allocation
//! - `options` — build state, configurator pipeline, argv assembly
//! - `devices` — device configurators
//! - `console` — serial console fabric with expect-style matching
//! - `task` — tasks and lifecycle notifications
//! - `event` — JSON event channel over virtio-serial
//! - `vm` — the supervisor and VM handle
//!
//! ## Typical use
//!
//! ```no_run
//! use vmharness::qemu;
//!
//! # async fn example() -> Result<(), vmharness::Error> {
//! let mut vm = qemu::start(
//!     qemu::Arch::UseEnv,
//!     [
//!         qemu::with_kernel("./bzImage"),
//!         qemu::with_initramfs("./initramfs.cpio"),
//!         qemu::virtio_random(),
//!     ],
//! )
//! .await?;
//!
//! vm.console.expect_string("TESTS PASSED").await?;
//! vm.wait().await?;
//! # Ok(())
//! # }
//! ```

mod arch;
mod console;
mod devices;
mod event;
mod id;
mod options;
mod task;
mod vm;

pub use arch::Arch;
pub use console::{Console, SerialSink};
pub use devices::{
    arbitrary_args, halt_on_kernel_panic, ide_block_device, log_serial_by_line, p9_directory,
    read_only_directory, virtio_random, with_append_kernel, with_initramfs, with_kernel,
    with_qemu_command, with_serial_output, with_task, with_vm_timeout,
};
pub use event::{event_channel, event_channel_callback, read_event_file, Action, Event};
pub use id::IdAllocator;
pub use options::{
    all, by_arch, configurator, if_arch, if_not_arch, options_for, Configurator, Options,
};
pub use task::{cleanup, task, wait_vm_started, Notifications, Task, TaskResult, VmExit};
pub use vm::{start, Vm};

// The signal type accepted by `Vm::signal`.
pub use nix::sys::signal::Signal;
