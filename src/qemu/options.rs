//! VM build state and the configurator pipeline.
//!
//! [`Options`] is the single mutable record a VM is built from. It is only
//! visible to [`Configurator`]s during pipeline evaluation
//! ([`options_for`]); afterwards it is frozen and consumed by
//! [`Options::start`](crate::qemu::Vm).
//!
//! Configurators are plain functions over `(&mut IdAllocator, &mut Options)`
//! composed by list order. The pipeline resolves the guest architecture
//! first, seeds defaults from the environment, appends the no-graphics flag,
//! and then applies each configurator until the first error.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

use super::arch::Arch;
use super::console::SerialSink;
use super::id::IdAllocator;
use super::task::Task;

/// A function that mutates [`Options`] or registers [`Task`]s.
///
/// Build one with [`configurator`]; compose with [`all`], [`by_arch`],
/// [`if_arch`] and [`if_not_arch`].
pub struct Configurator(Box<dyn FnOnce(&mut IdAllocator, &mut Options) -> Result<(), Error> + Send>);

impl Configurator {
    pub(crate) fn apply(self, alloc: &mut IdAllocator, opts: &mut Options) -> Result<(), Error> {
        (self.0)(alloc, opts)
    }
}

impl std::fmt::Debug for Configurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Configurator")
    }
}

/// Wrap a closure as a [`Configurator`].
pub fn configurator<F>(f: F) -> Configurator
where
    F: FnOnce(&mut IdAllocator, &mut Options) -> Result<(), Error> + Send + 'static,
{
    Configurator(Box::new(f))
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

/// Apply the given configurators in order, stopping at the first error.
pub fn all(cfgs: impl IntoIterator<Item = Configurator> + Send + 'static) -> Configurator {
    configurator(move |alloc, opts| {
        for cfg in cfgs {
            cfg.apply(alloc, opts)?;
        }
        Ok(())
    })
}

/// Apply the configurator registered for the resolved guest architecture.
///
/// An absent key is a no-op.
pub fn by_arch(mut map: HashMap<Arch, Configurator>) -> Configurator {
    configurator(move |alloc, opts| match map.remove(&opts.arch) {
        Some(cfg) => cfg.apply(alloc, opts),
        None => Ok(()),
    })
}

/// Apply `cfg` only when the guest architecture is `arch`.
pub fn if_arch(arch: Arch, cfg: Configurator) -> Configurator {
    configurator(move |alloc, opts| {
        if opts.arch == arch {
            cfg.apply(alloc, opts)
        } else {
            Ok(())
        }
    })
}

/// Apply `cfg` only when the guest architecture is not `arch`.
pub fn if_not_arch(arch: Arch, cfg: Configurator) -> Configurator {
    configurator(move |alloc, opts| {
        if opts.arch != arch {
            cfg.apply(alloc, opts)
        } else {
            Ok(())
        }
    })
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// VM start-up parameters.
///
/// Seeded from the environment by [`options_for`], then mutated by
/// configurators. Fields are public so tests and advanced callers can
/// inspect or tweak the frozen state before starting the VM.
#[derive(Debug, Default)]
pub struct Options {
    /// QEMU binary plus initial flags, whitespace-split at assembly time.
    ///
    /// Seeded from `VMHARNESS_QEMU`, default `"qemu"`.
    pub qemu_command: String,

    /// The resolved guest architecture.
    pub arch: Arch,

    /// Path to the kernel image to boot, empty for none.
    ///
    /// Seeded from `VMHARNESS_KERNEL`.
    pub kernel: String,

    /// Path to the initramfs, empty for none.
    ///
    /// Seeded from `VMHARNESS_INITRAMFS`.
    pub initramfs: String,

    /// Kernel command line, space-joined.
    ///
    /// Seeded from `VMHARNESS_KERNEL_APPEND` so environment-supplied args
    /// come before configurator-supplied ones. Only usable when `kernel` is
    /// set; enforced at assembly time by [`Options::cmdline`].
    pub kernel_args: String,

    /// QEMU flags, in order. Always starts with `-nographic`.
    pub qemu_args: Vec<String>,

    /// Sinks receiving a copy of all guest serial output.
    pub serial_sinks: Vec<SerialSink>,

    /// Host files inherited by the child; the file at index `i` becomes
    /// child FD `3 + i`.
    pub extra_files: Vec<Arc<OwnedFd>>,

    /// Tasks started alongside the guest.
    pub tasks: Vec<Task>,

    /// Hard deadline for the whole VM run; the child is killed when it
    /// expires. Seeded from `VMHARNESS_TIMEOUT`.
    pub vm_timeout: Option<Duration>,
}

impl Options {
    /// Seed options from the environment.
    fn from_env() -> Result<Self, Error> {
        let qemu_command = std::env::var("VMHARNESS_QEMU")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "qemu".to_string());

        let vm_timeout = match std::env::var("VMHARNESS_TIMEOUT") {
            Ok(value) if !value.is_empty() => {
                Some(
                    humantime::parse_duration(&value).map_err(|e| Error::InvalidTimeout {
                        value,
                        reason: e.to_string(),
                    })?,
                )
            }
            _ => None,
        };

        Ok(Options {
            qemu_command,
            arch: Arch::UseEnv,
            kernel: std::env::var("VMHARNESS_KERNEL").unwrap_or_default(),
            initramfs: std::env::var("VMHARNESS_INITRAMFS").unwrap_or_default(),
            kernel_args: std::env::var("VMHARNESS_KERNEL_APPEND").unwrap_or_default(),
            qemu_args: Vec::new(),
            serial_sinks: Vec::new(),
            extra_files: Vec::new(),
            tasks: Vec::new(),
            vm_timeout,
        })
    }

    /// Append kernel command-line tokens, space-joined.
    pub fn append_kernel<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = args
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            return;
        }
        if !self.kernel_args.is_empty() {
            self.kernel_args.push(' ');
        }
        self.kernel_args.push_str(&joined);
    }

    /// Append QEMU flags.
    pub fn append_qemu<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.qemu_args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
    }

    /// Register a host file to be inherited by the child process.
    ///
    /// Returns the file descriptor number the child will see (`3 + index`).
    /// The caller may keep a clone of the `Arc` to close its side of the
    /// handle later; the supervisor drops its own references right after
    /// spawning the child.
    pub fn add_file(&mut self, file: Arc<OwnedFd>) -> i32 {
        let child_fd = 3 + self.extra_files.len() as i32;
        self.extra_files.push(file);
        child_fd
    }

    /// Assemble the QEMU argv.
    ///
    /// Layout: `<qemu_command fields> <qemu_args> [env append]
    /// [-kernel <kernel> [-append <kernel_args>]] [-initrd <initramfs>]`.
    ///
    /// Fails with [`Error::KernelRequiredForArgs`] when kernel args were
    /// accumulated without a kernel to pass them to.
    pub fn cmdline(&self) -> Result<Vec<String>, Error> {
        let mut args: Vec<String> = self
            .qemu_command
            .split_whitespace()
            .map(str::to_string)
            .collect();

        args.extend(self.qemu_args.iter().cloned());

        if let Ok(extra) = std::env::var("VMHARNESS_QEMU_APPEND") {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        if !self.kernel.is_empty() {
            args.push("-kernel".to_string());
            args.push(self.kernel.clone());
            if !self.kernel_args.is_empty() {
                args.push("-append".to_string());
                args.push(self.kernel_args.clone());
            }
        } else if !self.kernel_args.is_empty() {
            return Err(Error::KernelRequiredForArgs);
        }

        if !self.initramfs.is_empty() {
            args.push("-initrd".to_string());
            args.push(self.initramfs.clone());
        }

        Ok(args)
    }
}

/// Quote argv elements containing whitespace, for copy-and-paste
/// reproduction of a QEMU invocation.
pub(crate) fn quote_cmdline(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.contains(char::is_whitespace) {
                format!("'{arg}'")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Evaluate the configurator pipeline and return frozen [`Options`].
///
/// Seeds from the environment, resolves the architecture, appends the
/// no-graphics flag, then applies each configurator in order; the first
/// error aborts the pipeline.
pub fn options_for(
    arch: Arch,
    configurators: impl IntoIterator<Item = Configurator>,
) -> Result<Options, Error> {
    let mut opts = Options::from_env()?;
    opts.arch = arch.resolve()?;

    // Graphics are never wanted; the guest talks over serial.
    opts.append_qemu(["-nographic"]);

    let mut alloc = IdAllocator::new();
    for cfg in configurators {
        cfg.apply(&mut alloc, &mut opts)?;
    }
    Ok(opts)
}
