//! Apple Hypervisor.framework backend.
//!
//! Grounded in two reference bindings rather than the teacher crate (which
//! only ever spoke to KVM): the arm64 `hv_vcpu_*` surface mirrors the `ahv`
//! crate's hand-written `extern "C"` block, and the x86_64 surface mirrors
//! the `hv`/`hypervisor-framework` crate's `call!`-wrapped ioctl-style API.
//! Both are FFI-only frameworks with no Rust-native binding shipped by
//! Apple, so — unlike the KVM side — this module owns the `extern "C"`
//! declarations directly instead of depending on a wrapper crate.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use thiserror::Error;

#[cfg(target_arch = "aarch64")]
pub use aarch64::HvfBackend;
#[cfg(target_arch = "x86_64")]
pub use x86_64::HvfBackend;

/// Raw `hv_return_t` status codes (Hypervisor/hv_error.h).
pub type HvReturn = i32;

pub const HV_SUCCESS: HvReturn = 0;
pub const HV_ERROR: HvReturn = -1;
pub const HV_BUSY: HvReturn = -2;
pub const HV_BAD_ARGUMENT: HvReturn = -3;
pub const HV_NO_RESOURCES: HvReturn = -5;
pub const HV_NO_DEVICE: HvReturn = -6;
pub const HV_UNSUPPORTED: HvReturn = -7;
pub const HV_DENIED: HvReturn = -8;

#[derive(Error, Debug)]
#[error("Hypervisor.framework call failed: status {0:#x}")]
pub struct HvfError(pub HvReturn);

/// Translate a raw `hv_return_t` into a `Result`, mirroring the `call!` macro
/// used by the reference x86 bindings.
pub(super) fn hv_call(status: HvReturn) -> Result<(), HvfError> {
    if status == HV_SUCCESS {
        Ok(())
    } else {
        Err(HvfError(status))
    }
}

impl From<HvfError> for super::BackendError {
    fn from(e: HvfError) -> Self {
        super::BackendError::Hvf(e.0 as u32)
    }
}
