//! IRQ number allocation and interrupt signalling.
//!
//! The allocator is grounded in the rust-vmm `vm-allocator` GSI-allocator
//! pattern (a monotonic counter with a checked add); the signal primitive is
//! `vmm-sys-util::EventFd` on Linux, degrading to a no-op recorder on
//! backends without a userspace-visible eventfd equivalent (SPEC_FULL §9).

use thiserror::Error;

/// First IRQ number handed out to a registering device.
pub const IRQ_BASE: u32 = 5;

#[derive(Error, Debug)]
pub enum IrqError {
    #[error("IRQ number space exhausted")]
    Overflow,
}

/// Monotonic IRQ number allocator.
pub struct IrqAllocator {
    next_irq: u32,
}

impl IrqAllocator {
    pub fn new() -> Self {
        Self { next_irq: IRQ_BASE }
    }

    pub fn allocate(&mut self) -> Result<u32, IrqError> {
        let irq = self.next_irq;
        self.next_irq = self.next_irq.checked_add(1).ok_or(IrqError::Overflow)?;
        Ok(irq)
    }
}

impl Default for IrqAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot signal a device uses to request interrupt delivery.
///
/// Assert writes a non-zero value; deassert drains it. Whether this
/// translates into a real hardware-visible interrupt is up to the backend's
/// `irq_line` call, which the VM controller invokes when it observes an
/// assert (see `vm::Vm::service_irqs`).
pub trait IrqSignal: Send {
    fn assert(&self);
    fn deassert(&self);
    /// True if an assert is pending and not yet drained.
    fn is_pending(&self) -> bool;
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::IrqSignal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vmm_sys_util::eventfd::EventFd;

    /// `EventFd`-backed signal. The fd itself is handed to the backend's
    /// in-kernel IRQ routing where one exists; `pending` tracks whether a
    /// guest-visible assert is outstanding for devices that poll it directly.
    pub struct EventFdSignal {
        fd: EventFd,
        pending: AtomicBool,
    }

    impl EventFdSignal {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                fd: EventFd::new(0)?,
                pending: AtomicBool::new(false),
            })
        }

        pub fn as_eventfd(&self) -> &EventFd {
            &self.fd
        }
    }

    impl IrqSignal for EventFdSignal {
        fn assert(&self) {
            self.pending.store(true, Ordering::SeqCst);
            let _ = self.fd.write(1);
        }

        fn deassert(&self) {
            self.pending.store(false, Ordering::SeqCst);
        }

        fn is_pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }
    }
}

/// No-op signal for backends with no userspace-visible interrupt line
/// (Apple's Hypervisor.framework). Documents that interrupt delivery is not
/// performed in that configuration rather than silently dropping it.
pub struct NullSignal;

impl IrqSignal for NullSignal {
    fn assert(&self) {}
    fn deassert(&self) {}
    fn is_pending(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic_from_base() {
        let mut alloc = IrqAllocator::new();
        assert_eq!(alloc.allocate().unwrap(), IRQ_BASE);
        assert_eq!(alloc.allocate().unwrap(), IRQ_BASE + 1);
    }

    #[test]
    fn allocator_overflows() {
        let mut alloc = IrqAllocator {
            next_irq: u32::MAX,
        };
        assert!(alloc.allocate().is_ok());
        assert!(matches!(alloc.allocate(), Err(IrqError::Overflow)));
    }
}
