//! Virtio console device (virtio-console), transmit-only.
//!
//! Collapsed onto a single virtqueue (SPEC_FULL §4.4): real virtio-console
//! has a separate receiveq (index 0) and transmitq (index 1), but since this
//! device never delivers guest-bound input there is nothing for a receive
//! queue to do, so only one queue is modeled here — matching the teacher's
//! other single-virtqueue devices. Bytes written by the guest go straight to
//! stdout, mirroring [`crate::devices::serial::Serial`]'s TX-only behavior
//! but over the MMIO transport instead of I/O ports.

use std::io::Write;
use std::sync::Arc;

use crate::devices::irq::IrqSignal;
use crate::devices::mmio::MmioDevice;
use crate::memmap::MemoryMap;

use super::{
    Virtqueue, MAX_QUEUE_SIZE, MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID,
    MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_STATUS_ACK, MMIO_MAGIC_VALUE,
    MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX_OR_PAGE_SIZE, MMIO_QUEUE_PFN,
    MMIO_QUEUE_READY, MMIO_QUEUE_SEL_OR_NUM, MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION,
    STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK,
    VIRTIO_DEVICE_ID_CONSOLE, VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION, VIRTIO_VENDOR_ID,
    VIRTQ_DESC_F_NEXT,
};

pub struct VirtioConsole {
    device_features_lo: u32,
    driver_features_lo: u32,
    driver_features_hi: u32,
    features_sel: u32,

    status: u32,
    interrupt_status: u32,

    guest_page_size: u32,
    queue: Virtqueue,

    irq: Arc<dyn IrqSignal>,
    memory: Option<*const MemoryMap>,
}

unsafe impl Send for VirtioConsole {}

impl VirtioConsole {
    pub fn new(irq: Arc<dyn IrqSignal>) -> Self {
        Self {
            device_features_lo: 0,
            driver_features_lo: 0,
            driver_features_hi: 0,
            features_sel: 0,
            status: 0,
            interrupt_status: 0,
            guest_page_size: 0,
            queue: Virtqueue::new(),
            irq,
            memory: None,
        }
    }

    pub fn set_memory(&mut self, memory: &MemoryMap) {
        self.memory = Some(memory as *const MemoryMap);
    }

    fn process_queue(&mut self) {
        let memory_ptr = match self.memory {
            Some(ptr) => ptr as *mut MemoryMap,
            None => return,
        };
        let memory = unsafe { &mut *memory_ptr };
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();

        while self.queue.has_pending(memory) {
            let Some(head) = self.queue.pop_avail(memory) else {
                break;
            };

            let mut desc_idx = head;
            let mut total = 0u32;
            loop {
                let Some(desc) = self.queue.read_desc(memory, desc_idx) else {
                    break;
                };
                let mut buf = vec![0u8; desc.len as usize];
                if memory.read(desc.addr, &mut buf).is_ok() {
                    let _ = lock.write_all(&buf);
                    total += desc.len;
                }
                if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                    break;
                }
                desc_idx = desc.next;
            }
            let _ = lock.flush();

            if self.queue.push_used(memory, head, total).is_err() {
                log::warn!("virtio-console: failed to push tx used entry");
            }
            self.interrupt_status |= 1;
            self.irq.assert();
        }
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => VIRTIO_DEVICE_ID_CONSOLE,
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => {
                if self.features_sel == 0 {
                    self.device_features_lo
                } else {
                    0
                }
            }
            MMIO_QUEUE_NUM_MAX_OR_PAGE_SIZE => MAX_QUEUE_SIZE as u32,
            MMIO_QUEUE_SEL_OR_NUM => self.queue.size as u32,
            MMIO_QUEUE_READY => u32::from(self.queue.ready),
            MMIO_INTERRUPT_STATUS_ACK => self.interrupt_status,
            MMIO_STATUS => self.status,
            _ => {
                log::debug!("virtio-console: unknown register read {:#x}", offset);
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL | MMIO_DRIVER_FEATURES_SEL => {
                self.features_sel = value;
            }
            MMIO_DRIVER_FEATURES => {
                if self.features_sel == 0 {
                    self.driver_features_lo = value;
                } else {
                    self.driver_features_hi = value;
                }
            }
            MMIO_QUEUE_NUM_MAX_OR_PAGE_SIZE => {
                self.guest_page_size = value;
            }
            MMIO_QUEUE_SEL_OR_NUM => {
                // Single queue: selector writes are accepted but ignored.
            }
            MMIO_QUEUE_NUM => {
                if value <= MAX_QUEUE_SIZE as u32 {
                    self.queue.size = value as u16;
                }
            }
            MMIO_QUEUE_PFN => {
                self.queue.set_pfn(value, self.guest_page_size);
            }
            MMIO_QUEUE_READY => {
                self.queue.ready = value != 0;
            }
            MMIO_QUEUE_NOTIFY => {
                if self.status & STATUS_DRIVER_OK != 0 {
                    self.process_queue();
                }
            }
            MMIO_INTERRUPT_STATUS_ACK => {
                self.interrupt_status &= !value;
                self.irq.deassert();
            }
            MMIO_STATUS => {
                self.status = value;
                if value == 0 {
                    self.queue = Virtqueue::new();
                    self.interrupt_status = 0;
                    log::debug!("virtio-console: device reset");
                } else {
                    let mut flags = Vec::new();
                    if value & STATUS_ACKNOWLEDGE != 0 {
                        flags.push("ACK");
                    }
                    if value & STATUS_DRIVER != 0 {
                        flags.push("DRIVER");
                    }
                    if value & STATUS_FEATURES_OK != 0 {
                        flags.push("FEATURES_OK");
                    }
                    if value & STATUS_DRIVER_OK != 0 {
                        flags.push("DRIVER_OK");
                    }
                    log::debug!("virtio-console: status {} ({:#x})", flags.join("|"), value);
                }
            }
            _ => {
                log::debug!(
                    "virtio-console: unknown register write {:#x} = {:#x}",
                    offset,
                    value
                );
            }
        }
    }
}

impl MmioDevice for VirtioConsole {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self.read_register(offset & !0x3);
        let bytes = value.to_le_bytes();
        let start = (offset & 0x3) as usize;
        let len = data.len().min(4 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if data.len() != 4 || offset & 0x3 != 0 {
            log::debug!(
                "virtio-console: non-aligned write offset={:#x} len={}",
                offset,
                data.len()
            );
            return;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::irq::NullSignal;
    use crate::devices::virtio::VirtqDesc;
    use crate::memmap::SlotFlags;

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;
    const BUF_ADDR: u64 = 0x4000;

    fn console_with_one_queued_buffer(payload: &[u8]) -> (VirtioConsole, MemoryMap) {
        let mut memory = MemoryMap::new();
        memory.add_region(0, 0x10000, SlotFlags::default()).unwrap();

        let mut desc = [0u8; VirtqDesc::SIZE];
        desc[0..8].copy_from_slice(&BUF_ADDR.to_le_bytes());
        desc[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        memory.write(DESC_TABLE, &desc).unwrap();
        memory.write(BUF_ADDR, payload).unwrap();
        memory.write(AVAIL_RING + 2, &1u16.to_le_bytes()).unwrap();
        memory.write(AVAIL_RING + 4, &0u16.to_le_bytes()).unwrap();

        let mut console = VirtioConsole::new(Arc::new(NullSignal));
        console.set_memory(&memory);
        console.queue = Virtqueue {
            size: 1,
            ready: true,
            desc_table: DESC_TABLE,
            avail_ring: AVAIL_RING,
            used_ring: USED_RING,
            ..Default::default()
        };
        (console, memory)
    }

    #[test]
    fn queue_notify_before_driver_ok_does_not_process() {
        let (mut console, _memory) = console_with_one_queued_buffer(b"hi\n");
        assert_eq!(console.status, 0);

        console.write_register(MMIO_QUEUE_NOTIFY, 1);

        assert_eq!(console.queue.last_avail_idx, 0);
    }

    #[test]
    fn queue_notify_after_driver_ok_consumes_the_descriptor_chain() {
        let (mut console, memory) = console_with_one_queued_buffer(b"hi\n");
        console.status = STATUS_DRIVER_OK;

        console.write_register(MMIO_QUEUE_NOTIFY, 1);

        assert_eq!(console.queue.last_avail_idx, 1);
        let mut used_idx = [0u8; 2];
        memory.read(USED_RING + 2, &mut used_idx).unwrap();
        assert_eq!(u16::from_le_bytes(used_idx), 1);
    }
}
