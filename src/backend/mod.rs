//! Hypervisor backend abstraction.
//!
//! A `Backend` is a capability set over the host's virtualization facility,
//! selected once at process start based on the target OS. There is no trait
//! object here: exactly one backend is compiled in per target (`cfg`-selected
//! concrete type), matching the way the teacher crate only ever spoke
//! directly to `kvm-ioctls` rather than through an indirection layer.

#[cfg(target_os = "linux")]
pub mod kvm;
#[cfg(target_os = "macos")]
pub mod hvf;

use thiserror::Error;

use crate::exit::{ExitKind, ExitSink};
use crate::memmap::MemSlot;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0} (is this user privileged to use the hypervisor?)")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend resource exhausted: {0}")]
    OutOfResources(String),
    #[cfg(target_os = "linux")]
    #[error("KVM call failed: {0}")]
    Kvm(#[from] kvm_ioctls::Error),
    #[cfg(target_os = "macos")]
    #[error("Hypervisor.framework call failed: status {0:#x}")]
    Hvf(u32),
}

impl BackendError {
    /// True for a benign EINTR surfaced from a blocking call (chiefly
    /// `Backend::run`): the vCPU loop should retry rather than treat this as
    /// fatal (SPEC_FULL §4.5 loop-body step 1, "benign interruption").
    pub fn is_interrupted(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            matches!(self, BackendError::Kvm(e) if e.errno() == libc::EINTR)
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}

/// The capability set every backend implements. See SPEC_FULL §4.1.
pub trait Backend: Sized {
    type Vm;
    type Vcpu;
    type Regs;
    type Sregs;

    /// One-shot process-wide bring-up; may probe privilege.
    fn init() -> Result<Self, BackendError>;

    fn create_vm(&self) -> Result<Self::Vm, BackendError>;
    fn destroy_vm(&self, _vm: Self::Vm) {}

    /// Whether `create_vcpu` (and the initial register write) must happen on
    /// the thread that will later call `run` for this vCPU. True on Apple's
    /// Hypervisor.framework, false on KVM.
    fn vcpu_is_thread_local(&self) -> bool;

    fn create_vcpu(&self, vm: &Self::Vm, index: u32) -> Result<Self::Vcpu, BackendError>;
    fn destroy_vcpu(&self, _vcpu: Self::Vcpu) {}

    fn map_mem(&self, vm: &Self::Vm, slot: &MemSlot) -> Result<(), BackendError>;
    fn unmap_mem(&self, vm: &Self::Vm, slot_index: u32) -> Result<(), BackendError>;

    fn get_regs(&self, vcpu: &Self::Vcpu) -> Result<Self::Regs, BackendError>;
    fn set_regs(&self, vcpu: &Self::Vcpu, regs: &Self::Regs) -> Result<(), BackendError>;
    fn get_sregs(&self, vcpu: &Self::Vcpu) -> Result<Self::Sregs, BackendError>;
    fn set_sregs(&self, vcpu: &Self::Vcpu, sregs: &Self::Sregs) -> Result<(), BackendError>;

    /// Enter guest mode until an exit is raised, dispatching I/O/MMIO inline
    /// through `sink` (mirroring the teacher's `run_with_io`, which avoids
    /// copying KVM's mmap'd exit buffer through an intermediate step).
    fn run(&self, vcpu: &mut Self::Vcpu, sink: &mut dyn ExitSink) -> Result<ExitKind, BackendError>;

    /// Request that the vCPU leave guest mode as soon as possible. Required
    /// for clean shutdown on backends where `run` would otherwise block.
    fn request_exit(&self, vcpu: &Self::Vcpu) -> Result<(), BackendError>;

    /// Assert/deassert a level-triggered interrupt line. A no-op where the
    /// backend has no line-based interrupt controller (Apple's framework).
    fn irq_line(&self, vm: &Self::Vm, irq: u32, level: bool) -> Result<(), BackendError>;
}

#[cfg(target_os = "linux")]
pub type ActiveBackend = kvm::KvmBackend;
#[cfg(target_os = "macos")]
pub type ActiveBackend = hvf::HvfBackend;
