//! Top-level error aggregation and the one-line-summary-plus-remediation
//! printing SPEC_FULL §7 asks for on startup failure.

use thiserror::Error;

use crate::backend::BackendError;
use crate::loader::LoaderError;
use crate::memmap::MemError;
use crate::vcpu::VcpuError;
use crate::vm::VmError;

#[derive(Error, Debug)]
pub enum VmmError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Memory(#[from] MemError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Vcpu(#[from] VcpuError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("{0}")]
    Config(String),
}

impl VmmError {
    /// A short remediation hint for errors that commonly occur during init
    /// and have an obvious fix, printed alongside the error summary.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            VmmError::Backend(BackendError::Unavailable(_)) => {
                Some("is /dev/kvm present, or is the Hypervisor.framework entitlement granted?")
            }
            VmmError::Backend(BackendError::PermissionDenied(_)) => {
                Some("try adding this user to the kvm group, or running with elevated privileges")
            }
            VmmError::Loader(LoaderError::ReadImage { .. }) => {
                Some("check that the --kernel/--initrd/--binary/--disk path exists and is readable")
            }
            VmmError::Memory(MemError::NoSlot) => {
                Some("reduce the number of devices or raise the memory slot table's capacity")
            }
            _ => None,
        }
    }
}
