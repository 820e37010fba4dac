//! Portable vCPU exit classification.
//!
//! Every backend (KVM, Apple Hypervisor.framework) translates its own native
//! exit representation into [`ExitKind`] before handing control back to the
//! vCPU loop. This is the one vocabulary the loop, the device table, and the
//! virtio transport all share regardless of which backend produced the exit.

/// Direction of an I/O port or MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Access width in bytes. 8 is permitted for MMIO but not for legacy I/O ports.
pub type Width = u8;

/// Classified result of a single `run` call.
///
/// I/O-port and MMIO variants are already resolved against an [`ExitSink`] by
/// the backend before this value is produced; the vCPU loop only needs to act
/// on the remaining variants (see `vcpu::Loop::dispatch`).
#[derive(Debug)]
pub enum ExitKind {
    /// The backend handled an I/O port or MMIO access inline via the sink.
    Io,
    /// Guest executed HLT (or WFI on arm64).
    Halt,
    /// Guest requested shutdown (triple fault or explicit reset).
    Shutdown,
    /// Host-directed reschedule; nothing to do but run again.
    External,
    /// Entry into guest mode failed outright.
    FailEntry(u64),
    /// Guest produced an architectural exception the backend could not resolve
    /// into MMIO (lifted per the Classification contract when it could).
    Exception { syndrome: u64, address: u64 },
    /// An asynchronous `request_exit` kicked the vCPU out of `run`.
    Canceled,
    /// `run` returned early because of a pending signal or an in-flight
    /// `request_exit` kick (KVM surfaces both as the same benign exit reason).
    /// Not a guest event; the loop retries without counting it as external.
    Interrupted,
    /// Backend virtual timer fired; no injection is performed (see SPEC_FULL §4.5).
    VirtualTimer,
    /// Miscellaneous architectural trap the backend chose to acknowledge itself
    /// (MSR access, interrupt window, bus lock, hypercall, ...).
    Architectural(&'static str),
    /// The backend's own internal-error signal (e.g. KVM's internal error exit).
    InternalError,
    /// Anything the backend could not classify at all. The tag is backend-specific
    /// (see the "unknown exit" Open Question in SPEC_FULL §9).
    Unknown(&'static str),
}

/// Sink for I/O port and MMIO accesses raised during `run`.
///
/// A single implementation (the VM's device dispatcher) is threaded through
/// every backend; this is the seam the device table and legacy serial port
/// hang off of, mirroring the teacher's `IoHandler`/`MmioHandler` split but
/// merged into one trait since both kinds of access end up routed the same way.
pub trait ExitSink {
    /// Legacy I/O port read (x86_64 only; a no-op default suits arm64 backends).
    fn io_read(&mut self, port: u16, data: &mut [u8]) {
        data.fill(0xff);
    }
    /// Legacy I/O port write (x86_64 only; a no-op default suits arm64 backends).
    fn io_write(&mut self, _port: u16, _data: &[u8]) {}

    /// MMIO read at a guest physical address.
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);
    /// MMIO write at a guest physical address.
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}
