//! Environment-driven behavior of the options pipeline.
//!
//! These tests mutate `VMHARNESS_*` variables, so they live in their own
//! test binary and serialize on a shared lock; the in-crate unit tests
//! avoid the environment entirely.

use std::sync::Mutex;
use std::time::Duration;

use vmharness::qemu::{options_for, with_append_kernel, with_kernel, with_qemu_command, Arch};
use vmharness::Error;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let result = f();
    for (key, _) in vars {
        std::env::remove_var(key);
    }
    result
}

#[test]
fn arch_resolves_from_environment() {
    with_env(&[("VMHARNESS_QEMU_ARCH", "aarch64")], || {
        let opts = options_for(Arch::UseEnv, [with_qemu_command("qemu")]).unwrap();
        assert_eq!(opts.arch, Arch::Aarch64);
    });

    with_env(&[("VMHARNESS_ARCH", "riscv64")], || {
        let opts = options_for(Arch::UseEnv, [with_qemu_command("qemu")]).unwrap();
        assert_eq!(opts.arch, Arch::Riscv64);
    });
}

#[test]
fn missing_arch_env_is_an_error() {
    with_env(&[], || {
        std::env::remove_var("VMHARNESS_QEMU_ARCH");
        std::env::remove_var("VMHARNESS_ARCH");
        let err = options_for(Arch::UseEnv, [with_qemu_command("qemu")]).unwrap_err();
        assert!(matches!(err, Error::NoGuestArch), "got {err:?}");
    });
}

#[test]
fn unknown_arch_env_is_an_error() {
    with_env(&[("VMHARNESS_QEMU_ARCH", "vax")], || {
        let err = options_for(Arch::UseEnv, [with_qemu_command("qemu")]).unwrap_err();
        match err {
            Error::UnsupportedArch(s) => assert_eq!(s, "vax"),
            other => panic!("expected UnsupportedArch, got {other:?}"),
        }
    });
}

#[test]
fn invalid_timeout_aborts_the_pipeline() {
    with_env(&[("VMHARNESS_TIMEOUT", "not-a-duration")], || {
        let err = options_for(Arch::X86_64, [with_qemu_command("qemu")]).unwrap_err();
        match err {
            Error::InvalidTimeout { value, .. } => assert_eq!(value, "not-a-duration"),
            other => panic!("expected InvalidTimeout, got {other:?}"),
        }
    });
}

#[test]
fn timeout_env_sets_vm_timeout() {
    with_env(&[("VMHARNESS_TIMEOUT", "90s")], || {
        let opts = options_for(Arch::X86_64, [with_qemu_command("qemu")]).unwrap();
        assert_eq!(opts.vm_timeout, Some(Duration::from_secs(90)));
    });
}

#[test]
fn qemu_env_seeds_the_command() {
    with_env(&[("VMHARNESS_QEMU", "qemu-system-x86_64 -enable-kvm")], || {
        let opts = options_for(Arch::X86_64, []).unwrap();
        assert_eq!(
            opts.cmdline().unwrap(),
            ["qemu-system-x86_64", "-enable-kvm", "-nographic"]
        );
    });
}

#[test]
fn qemu_append_env_extends_the_cmdline() {
    with_env(&[("VMHARNESS_QEMU_APPEND", "-m 1G")], || {
        let opts = options_for(Arch::X86_64, [with_qemu_command("qemu")]).unwrap();
        assert_eq!(opts.cmdline().unwrap(), ["qemu", "-nographic", "-m", "1G"]);
    });
}

#[test]
fn kernel_append_env_comes_before_configured_args() {
    with_env(&[("VMHARNESS_KERNEL_APPEND", "earlycon")], || {
        let opts = options_for(
            Arch::X86_64,
            [
                with_qemu_command("qemu"),
                with_kernel("./kernel"),
                with_append_kernel(["quiet"]),
            ],
        )
        .unwrap();
        let cmdline = opts.cmdline().unwrap();
        let append = cmdline
            .iter()
            .position(|a| a == "-append")
            .map(|i| cmdline[i + 1].as_str());
        assert_eq!(append, Some("earlycon quiet"));
    });
}

#[test]
fn kernel_env_seeds_the_kernel() {
    with_env(&[("VMHARNESS_KERNEL", "./env-kernel")], || {
        let opts = options_for(Arch::X86_64, [with_qemu_command("qemu")]).unwrap();
        assert_eq!(
            opts.cmdline().unwrap(),
            ["qemu", "-nographic", "-kernel", "./env-kernel"]
        );
    });
}
