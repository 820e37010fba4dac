//! Device emulation for the VMM: the legacy serial port, the MMIO console,
//! IRQ allocation/signalling, the MMIO device table, and the virtio-MMIO
//! transport (block/network/console).

pub mod console;
pub mod irq;
pub mod mmio;
pub mod serial;
#[cfg(target_os = "linux")]
pub mod tap;
pub mod virtio;

pub use console::MmioConsole;
pub use irq::{IrqAllocator, IrqSignal, IRQ_BASE};
pub use mmio::{DeviceTable, MmioDevice};
pub use serial::Serial;
pub use virtio::blk::VirtioBlk;
#[cfg(target_os = "linux")]
pub use virtio::net::VirtioNet;

/// I/O port range for the legacy COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;
pub const SERIAL_COM1_END: u16 = 0x3ff;
