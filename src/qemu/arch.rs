//! Guest architecture selection.
//!
//! The architecture decides device-level details of the QEMU command line
//! (for example `virtio-9p-device` on arm versus `virtio-9p-pci` elsewhere),
//! so it is resolved once, before any device configurator runs.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The CPU architecture emulated by the QEMU guest.
///
/// [`Arch::UseEnv`] defers the choice to the `VMHARNESS_QEMU_ARCH` (or
/// `VMHARNESS_ARCH`) environment variable; it is resolved by
/// [`Arch::resolve`] at the start of pipeline evaluation and never appears in
/// a frozen [`Options`](super::Options).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I386,
    Aarch64,
    Arm,
    Riscv64,
    Ppc64,
    /// Resolve the architecture from the environment.
    UseEnv,
}

impl Arch {
    /// Resolve `UseEnv` against the environment.
    ///
    /// Concrete values pass through unchanged. An empty or missing
    /// environment value yields [`Error::NoGuestArch`]; an unknown value
    /// yields [`Error::UnsupportedArch`].
    pub fn resolve(self) -> Result<Arch, Error> {
        match self {
            Arch::UseEnv => {
                let value = std::env::var("VMHARNESS_QEMU_ARCH")
                    .or_else(|_| std::env::var("VMHARNESS_ARCH"))
                    .unwrap_or_default();
                if value.is_empty() {
                    return Err(Error::NoGuestArch);
                }
                value.parse()
            }
            arch => Ok(arch),
        }
    }

    /// The QEMU spelling of the architecture.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I386 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64 => "ppc64",
            Arch::UseEnv => "use-env",
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::UseEnv
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "i386" => Ok(Arch::I386),
            "aarch64" => Ok(Arch::Aarch64),
            "arm" => Ok(Arch::Arm),
            "riscv64" => Ok(Arch::Riscv64),
            "ppc64" => Ok(Arch::Ppc64),
            other => Err(Error::UnsupportedArch(other.to_string())),
        }
    }
}
