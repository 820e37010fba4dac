//! MMIO console device: the 8250-style TX-only UART from
//! [`crate::devices::serial`], exposed over the virtio-router's MMIO
//! transport instead of x86 I/O ports, for use on backends/architectures
//! that don't give the guest an I/O-port address space (SPEC_FULL §6 enables
//! it via `--console`, independent of the architecture-specific legacy
//! serial port).
//!
//! Each of the 8 UART registers occupies one byte at its offset; only the
//! low byte of any MMIO access is meaningful, matching how a real 8-bit
//! peripheral looks when the guest happens to do a wider load/store.

use crate::devices::mmio::MmioDevice;
use crate::devices::serial::Serial;

pub struct MmioConsole {
    uart: Serial,
}

impl MmioConsole {
    pub fn new() -> Self {
        Self {
            uart: Serial::new(),
        }
    }
}

impl Default for MmioConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioDevice for MmioConsole {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self.uart.read(offset as u16);
        data[0] = value;
        for b in &mut data[1..] {
            *b = 0;
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some(&byte) = data.first() {
            self.uart.write(offset as u16, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_thr_reaches_uart() {
        let mut console = MmioConsole::new();
        console.write(0, &[b'x']);
        let mut buf = [0xffu8; 1];
        console.read(5, &mut buf); // LSR
        assert_ne!(buf[0], 0xff);
    }
}
