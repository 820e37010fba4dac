//! Linux boot protocol for 64-bit kernels on the KVM/x86_64 backend.
//!
//! Carried over from the teacher's `boot` module nearly unchanged: the same
//! memory layout, the same bzImage/boot_params/page-table split across three
//! submodules. The only structural change is that guest memory is now a
//! [`crate::memmap::MemoryMap`] slot rather than a `vm_memory::GuestMemoryMmap`
//! region, and registers are set through the portable [`crate::backend::Backend`]
//! trait instead of a bespoke `kvm::VcpuFd` wrapper. ACPI/MP-table synthesis is
//! dropped per SPEC_FULL §1: the guest discovers virtio-mmio devices from a
//! `virtio_mmio.device=` command-line fragment instead.

mod bzimage;
mod params;
mod paging;

use kvm_bindings::kvm_fpu;

use crate::backend::kvm::{KvmBackend, VcpuHandle};
use crate::backend::Backend;
use crate::memmap::MemoryMap;

use super::LoaderError;

/// Guest physical memory layout constants for the Linux boot protocol.
pub mod layout {
    pub const GDT_START: u64 = 0x500;
    pub const IDT_START: u64 = 0x520;
    pub const BOOT_PARAMS_START: u64 = 0x7000;
    pub const BOOT_STACK_POINTER: u64 = 0x8ff0;
    pub const CMDLINE_START: u64 = 0x2_0000;
    pub const CMDLINE_MAX_SIZE: usize = 2048;
    pub const HIMEM_START: u64 = 0x10_0000;
    pub const PML4_START: u64 = 0x9000;
    pub const PDPTE_START: u64 = 0xa000;
    pub const PDE_START: u64 = 0xb000;
}

/// Everything the Linux boot protocol needs beyond the guest's memory and vCPU.
pub struct LinuxBootConfig {
    pub kernel_path: String,
    pub cmdline: String,
    pub mem_size: u64,
}

/// Load the kernel and populate boot_params/E820/page tables in `memory`.
///
/// Must run after the VM controller has mapped guest RAM but before the
/// first vCPU enters guest mode; does not touch the backend at all (register
/// state is set separately by [`setup_vcpu_regs`], since on Apple-style
/// thread-bound backends that has to happen inside the vCPU's own thread —
/// this function has no such restriction and can run on the main thread).
pub fn setup_boot(memory: &mut MemoryMap, config: &LinuxBootConfig) -> Result<(), LoaderError> {
    let loaded_kernel = bzimage::load_kernel(memory, &config.kernel_path)?;
    params::setup_boot_params(memory, config, &loaded_kernel)?;
    paging::setup_page_tables(memory)?;
    Ok(())
}

/// Configure vCPU registers for 64-bit Linux boot: GDT/IDT, FPU, segment and
/// control registers, EFER, and the general-purpose registers the protocol
/// mandates (RIP at the 64-bit entry point, RSI pointing at boot_params).
pub fn setup_vcpu_regs(
    backend: &KvmBackend,
    vcpu: &VcpuHandle,
    memory: &mut MemoryMap,
) -> Result<(), LoaderError> {
    paging::setup_gdt_idt(memory)?;

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    backend.set_boot_state(vcpu, &fpu)?;

    let mut sregs = backend.get_sregs(vcpu)?;
    paging::fill_sregs(&mut sregs);
    backend.set_sregs(vcpu, &sregs)?;

    let regs = paging::boot_regs();
    backend.set_regs(vcpu, &regs)?;

    log::debug!(
        "vcpu boot regs: rip={:#x} rsp={:#x} rsi={:#x}",
        regs.rip,
        regs.rsp,
        regs.rsi
    );

    Ok(())
}
