//! Device and option configurators.
//!
//! Each function returns a [`Configurator`] that translates a high-level
//! device request into [`Options`] mutations. Paths are validated eagerly so
//! a bad configuration fails during pipeline evaluation, before any process
//! is spawned.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

use super::console::SerialSink;
use super::options::{configurator, Configurator};
use super::task::{task, wait_vm_started, Task};
use super::Arch;

// ---------------------------------------------------------------------------
// Direct option mutators
// ---------------------------------------------------------------------------

/// Set the QEMU binary (plus initial flags, whitespace-separated).
pub fn with_qemu_command(cmd: impl Into<String>) -> Configurator {
    let cmd = cmd.into();
    configurator(move |_alloc, opts| {
        opts.qemu_command = cmd;
        Ok(())
    })
}

/// Set the kernel image to boot.
pub fn with_kernel(kernel: impl Into<String>) -> Configurator {
    let kernel = kernel.into();
    configurator(move |_alloc, opts| {
        opts.kernel = kernel;
        Ok(())
    })
}

/// Set the initramfs.
///
/// When `VMHARNESS_INITRAMFS_OVERRIDE` is set, the override path wins and
/// the supplied one is ignored; callers that build initramfs images should
/// check the same variable and skip the build.
pub fn with_initramfs(initramfs: impl Into<String>) -> Configurator {
    let initramfs = initramfs.into();
    configurator(move |_alloc, opts| {
        opts.initramfs = match std::env::var("VMHARNESS_INITRAMFS_OVERRIDE") {
            Ok(o) if !o.is_empty() => o,
            _ => initramfs,
        };
        Ok(())
    })
}

/// Append kernel command-line arguments.
pub fn with_append_kernel<I, S>(args: I) -> Configurator
where
    I: IntoIterator<Item = S> + Send + 'static,
    S: AsRef<str>,
{
    configurator(move |_alloc, opts| {
        opts.append_kernel(args);
        Ok(())
    })
}

/// Append arbitrary QEMU command-line arguments.
pub fn arbitrary_args<I, S>(args: I) -> Configurator
where
    I: IntoIterator<Item = S> + Send + 'static,
    S: AsRef<str>,
{
    configurator(move |_alloc, opts| {
        opts.append_qemu(args);
        Ok(())
    })
}

/// Add sinks that receive a copy of all guest serial output.
pub fn with_serial_output(sinks: impl IntoIterator<Item = SerialSink> + Send + 'static) -> Configurator {
    configurator(move |_alloc, opts| {
        opts.serial_sinks.extend(sinks);
        Ok(())
    })
}

/// Set a hard deadline for the whole VM run.
pub fn with_vm_timeout(timeout: Duration) -> Configurator {
    configurator(move |_alloc, opts| {
        opts.vm_timeout = Some(timeout);
        Ok(())
    })
}

/// Register tasks to run alongside the guest.
pub fn with_task(tasks: impl IntoIterator<Item = Task> + Send + 'static) -> Configurator {
    configurator(move |_alloc, opts| {
        opts.tasks.extend(tasks);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Block devices and shared directories
// ---------------------------------------------------------------------------

fn must_be_dir(dir: &str) -> Result<(), Error> {
    if dir.is_empty() {
        return Err(Error::InvalidDir);
    }
    let md = std::fs::metadata(dir).map_err(|e| Error::stat(dir, e))?;
    if !md.is_dir() {
        return Err(Error::IsNotDir(dir.into()));
    }
    Ok(())
}

fn must_exist(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::InvalidDir);
    }
    std::fs::metadata(path).map_err(|e| Error::stat(path, e))?;
    Ok(())
}

/// Expose `dir` to the guest as a read-only vfat IDE drive (`/dev/sda1`).
pub fn read_only_directory(dir: impl Into<String>) -> Configurator {
    let dir = dir.into();
    configurator(move |alloc, opts| {
        must_be_dir(&dir)?;

        let drive = alloc.id("drive");
        let ahci = alloc.id("ahci");
        opts.append_qemu([
            "-drive".to_string(),
            format!("file=fat:rw:{dir},if=none,id={drive}"),
            "-device".to_string(),
            format!("ich9-ahci,id={ahci}"),
            "-device".to_string(),
            format!("ide-hd,drive={drive},bus={ahci}.0"),
        ]);
        Ok(())
    })
}

/// Expose a disk image file as an AHCI/IDE block device.
pub fn ide_block_device(file: impl Into<String>) -> Configurator {
    let file = file.into();
    configurator(move |alloc, opts| {
        must_exist(&file)?;

        let drive = alloc.id("drive");
        let ahci = alloc.id("ahci");
        opts.append_qemu([
            "-drive".to_string(),
            format!("file={file},if=none,id={drive}"),
            "-device".to_string(),
            format!("ich9-ahci,id={ahci}"),
            "-device".to_string(),
            format!("ide-hd,drive={drive},bus={ahci}.0"),
        ]);
        Ok(())
    })
}

/// Share `dir` with the guest as a read-write 9p filesystem under `tag`.
///
/// The guest mounts it with `mount -t 9p -o trans=virtio,version=9p2000.L
/// <tag> <mountpoint>`; the kernel arg `VMTEST_SHARED_DIR=<tag>` is appended
/// so in-guest mount helpers can discover the share.
pub fn p9_directory(dir: impl Into<String>, tag: impl Into<String>) -> Configurator {
    let dir = dir.into();
    let tag = tag.into();
    configurator(move |alloc, opts| {
        must_be_dir(&dir)?;
        if tag.is_empty() {
            return Err(Error::InvalidTag);
        }

        let id = alloc.id("fsdev");
        let device = match opts.arch {
            Arch::Arm => format!("virtio-9p-device,fsdev={id},mount_tag={tag}"),
            _ => format!("virtio-9p-pci,fsdev={id},mount_tag={tag}"),
        };
        opts.append_qemu([
            // security_model=mapped-file gives control over uid/gid/mode seen
            // in the guest without elevated permissions on the host.
            "-fsdev".to_string(),
            format!("local,id={id},path={dir},security_model=mapped-file"),
            "-device".to_string(),
            device,
        ]);
        opts.append_kernel([format!("VMTEST_SHARED_DIR={tag}")]);
        Ok(())
    })
}

/// Expose a PCI random number generator to the guest.
pub fn virtio_random() -> Configurator {
    arbitrary_args(["-device", "virtio-rng-pci"])
}

// ---------------------------------------------------------------------------
// Serial-line processing
// ---------------------------------------------------------------------------

/// Replace control characters other than TAB and LF with `~` in place.
pub(crate) fn replace_ctl(bytes: &mut [u8]) {
    for b in bytes {
        if *b == b'\t' || *b == b'\n' {
            continue;
        }
        if *b < 32 || *b == 127 {
            *b = b'~';
        }
    }
}

/// Process guest serial output one line at a time.
///
/// Inserts a pipe sink and registers a task that scans the pipe and invokes
/// `callback` on each full line, with control characters scrubbed. The task
/// ends when the serial sinks are closed on VM exit.
pub fn log_serial_by_line<F>(callback: F) -> Configurator
where
    F: FnMut(&str) + Send + 'static,
{
    serial_line_task(callback)
}

/// Kill the VM when the guest reports a kernel panic.
///
/// Scans serial output for the kernel's `Kernel panic` marker and cancels
/// the harness when it appears, so a wedged guest does not sit around until
/// the VM timeout. The run then ends with the kill status, and the task
/// records the panic as its error.
pub fn halt_on_kernel_panic() -> Configurator {
    configurator(move |_alloc, opts| {
        let (reader, writer) = std::io::pipe().map_err(|e| Error::Pipe(Arc::new(e)))?;
        opts.serial_sinks.push(SerialSink::from_writer(writer));
        opts.tasks.push(wait_vm_started(task(move |cancel, _n| async move {
            let panicked = tokio::task::spawn_blocking(move || {
                let mut lines = BufReader::new(reader);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match lines.read_until(b'\n', &mut line) {
                        Ok(0) => return Ok(false),
                        Ok(_) => {
                            if line.windows(12).any(|w| w == b"Kernel panic") {
                                return Ok(true);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!("serial scanner task failed: {e}"))??;

            if panicked {
                cancel.cancel();
                anyhow::bail!("guest kernel panicked");
            }
            Ok(())
        })));
        Ok(())
    })
}

fn serial_line_task<F>(mut callback: F) -> Configurator
where
    F: FnMut(&str) + Send + 'static,
{
    configurator(move |_alloc, opts| {
        let (reader, writer) = std::io::pipe().map_err(|e| Error::Pipe(Arc::new(e)))?;
        opts.serial_sinks.push(SerialSink::from_writer(writer));
        opts.tasks.push(wait_vm_started(task(move |_cancel, _n| async move {
            tokio::task::spawn_blocking(move || scan_lines(reader, &mut callback))
                .await
                .map_err(|e| anyhow::anyhow!("serial scanner task failed: {e}"))?
        })));
        Ok(())
    })
}

fn scan_lines<R: Read, F: FnMut(&str)>(reader: R, callback: &mut F) -> anyhow::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| anyhow::anyhow!("error reading serial from VM: {e}"))?;
        if n == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        replace_ctl(&mut line);
        callback(&String::from_utf8_lossy(&line));
    }
}
