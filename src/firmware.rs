//! UEFI firmware configurators.

use crate::qemu::{configurator, Configurator};

/// Boot the guest with OVMF UEFI firmware.
///
/// `ovmf_code` and `ovmf_vars` fall back to the `VMHARNESS_OVMF_CODE` and
/// `VMHARNESS_OVMF_VARS` environment variables when empty.
///
/// OVMF needs at least 1 GB of guest memory and a machine type with SMM
/// enabled, e.g.:
///
/// ```text
/// arbitrary_args(["-m", "2G", "-machine", "type=q35,smm=on"])
/// ```
pub fn with_ovmf(ovmf_code: impl Into<String>, ovmf_vars: impl Into<String>) -> Configurator {
    let mut ovmf_code = ovmf_code.into();
    let mut ovmf_vars = ovmf_vars.into();
    if ovmf_code.is_empty() {
        ovmf_code = std::env::var("VMHARNESS_OVMF_CODE").unwrap_or_default();
    }
    if ovmf_vars.is_empty() {
        ovmf_vars = std::env::var("VMHARNESS_OVMF_VARS").unwrap_or_default();
    }
    configurator(move |_alloc, opts| {
        opts.append_qemu([
            "-drive".to_string(),
            format!("if=pflash,format=raw,unit=0,file={ovmf_code},readonly=on"),
            "-drive".to_string(),
            format!("if=pflash,format=raw,unit=1,file={ovmf_vars}"),
        ]);
        Ok(())
    })
}

/// [`with_ovmf`] with both images taken from the environment.
pub fn with_default_ovmf() -> Configurator {
    with_ovmf("", "")
}
