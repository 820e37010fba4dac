//! Virtio block device (virtio-blk) over the legacy virtio-mmio transport.
//!
//! # virtio-blk protocol
//!
//! The guest communicates with the device using descriptor chains:
//!
//! 1. **Request header** (16 bytes, device-readable): type (4 bytes,
//!    0=IN/1=OUT/4=FLUSH), reserved (4 bytes), sector (8 bytes).
//! 2. **Data buffer** (device-readable for writes, device-writable for reads).
//! 3. **Status** (1 byte, device-writable): 0=OK, 1=IOERR, 2=UNSUPP.
//!
//! Queue addressing is unchanged from the teacher apart from switching from
//! split 64-bit desc/avail/used registers to the legacy queue-PFN register
//! (see the parent module doc comment); the request-processing logic
//! (`process_queue`/`process_request`/`handle_read`/`handle_write`/
//! `handle_flush`) is the teacher's virtio-blk implementation, retargeted
//! from `vm_memory::GuestMemory` to [`MemoryMap`] and from `eprintln!` to
//! `log`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::devices::irq::IrqSignal;
use crate::devices::mmio::MmioDevice;
use crate::memmap::MemoryMap;

use super::{
    VirtqDesc, Virtqueue, MAX_QUEUE_SIZE, MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL,
    MMIO_DEVICE_ID, MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_STATUS_ACK,
    MMIO_MAGIC_VALUE, MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX_OR_PAGE_SIZE,
    MMIO_QUEUE_PFN, MMIO_QUEUE_READY, MMIO_QUEUE_SEL_OR_NUM, MMIO_STATUS, MMIO_VENDOR_ID,
    MMIO_VERSION, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK,
    VIRTIO_DEVICE_ID_BLOCK, VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION, VIRTIO_VENDOR_ID,
    VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};

const SECTOR_SIZE: u64 = 512;
const BLK_SIZE: u32 = 512;

const VIRTIO_BLK_F_SIZE_MAX: u32 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u32 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u32 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u32 = 1 << 9;

const SIZE_MAX: u32 = 1024 * 1024;
const SEG_MAX: u32 = 128;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// Config space offsets (relative to MMIO_CONFIG_START = 0x100).
const CONFIG_CAPACITY: u64 = 0x100; // 8 bytes
const CONFIG_CAPACITY_HI: u64 = 0x104;
const CONFIG_SIZE_MAX: u64 = 0x108; // 4 bytes
const CONFIG_SEG_MAX: u64 = 0x10c; // 4 bytes
const CONFIG_BLK_SIZE: u64 = 0x114; // 4 bytes

pub struct VirtioBlk {
    disk: File,
    capacity: u64,

    device_features_lo: u32,
    driver_features_lo: u32,
    driver_features_hi: u32,
    features_sel: u32,

    status: u32,
    interrupt_status: u32,

    queue_sel: u32,
    guest_page_size: u32,
    queue: Virtqueue,

    irq: Arc<dyn IrqSignal>,

    /// Raw pointer to guest memory, set once via [`VirtioBlk::set_memory`]
    /// after the device table and memory map are both constructed.
    memory: Option<*const MemoryMap>,

    request_count: u64,
}

// Safety: the raw memory pointer is only dereferenced from MMIO callbacks,
// which the VM controller always drives from the vCPU thread that owns the
// memory map.
unsafe impl Send for VirtioBlk {}

impl VirtioBlk {
    pub fn new(disk_path: &str, irq: Arc<dyn IrqSignal>) -> std::io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(disk_path)?;
        let metadata = disk.metadata()?;
        let capacity = metadata.len() / SECTOR_SIZE;

        log::info!(
            "virtio-blk: opened {} ({} sectors, {} bytes)",
            disk_path,
            capacity,
            metadata.len()
        );

        let device_features_lo =
            VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH;

        Ok(Self {
            disk,
            capacity,
            device_features_lo,
            driver_features_lo: 0,
            driver_features_hi: 0,
            features_sel: 0,
            status: 0,
            interrupt_status: 0,
            queue_sel: 0,
            guest_page_size: 0,
            queue: Virtqueue::new(),
            irq,
            memory: None,
            request_count: 0,
        })
    }

    /// # Safety
    ///
    /// The caller must ensure `memory` outlives this device.
    pub fn set_memory(&mut self, memory: &MemoryMap) {
        self.memory = Some(memory as *const MemoryMap);
    }

    fn process_queue(&mut self) {
        let memory_ptr = match self.memory {
            Some(ptr) => ptr as *mut MemoryMap,
            None => return,
        };
        // Safety: `memory` outlives the device for as long as `set_memory`'s
        // caller guarantees; only this thread dereferences it, and the
        // reborrows below never overlap a shared and a mutable borrow.
        let memory = unsafe { &mut *memory_ptr };

        while self.queue.has_pending(memory) {
            if let Some(desc_idx) = self.queue.pop_avail(memory) {
                let len = self.process_request(memory, desc_idx);
                if self.queue.push_used(memory, desc_idx, len).is_err() {
                    log::warn!("virtio-blk: failed to push to used ring");
                }
                self.request_count += 1;
                self.interrupt_status |= 1;
                self.irq.assert();
            }
        }
    }

    fn process_request(&mut self, memory: &MemoryMap, head_idx: u16) -> u32 {
        let mut desc_idx = head_idx;
        let mut descs = Vec::new();

        loop {
            let desc = match self.queue.read_desc(memory, desc_idx) {
                Some(d) => d,
                None => {
                    log::warn!("virtio-blk: failed to read descriptor {}", desc_idx);
                    return 0;
                }
            };
            descs.push(desc);

            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            desc_idx = desc.next;
        }

        if descs.len() < 2 {
            log::warn!("virtio-blk: request too short: {} descriptors", descs.len());
            return 0;
        }

        let header_desc = &descs[0];
        let mut header_buf = [0u8; 16];
        if memory.read(header_desc.addr, &mut header_buf).is_err() {
            log::warn!("virtio-blk: failed to read request header");
            return 0;
        }

        let req_type =
            u32::from_le_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]]);
        let sector = u64::from_le_bytes([
            header_buf[8],
            header_buf[9],
            header_buf[10],
            header_buf[11],
            header_buf[12],
            header_buf[13],
            header_buf[14],
            header_buf[15],
        ]);

        let status_desc = &descs[descs.len() - 1];
        if status_desc.flags & VIRTQ_DESC_F_WRITE == 0 {
            log::warn!("virtio-blk: status descriptor not writable");
            return 0;
        }

        let data_descs = &descs[1..descs.len() - 1];
        let mut total_written = 0u32;

        let status = match req_type {
            VIRTIO_BLK_T_IN => self.handle_read(memory, sector, data_descs, &mut total_written),
            VIRTIO_BLK_T_OUT => self.handle_write(memory, sector, data_descs),
            VIRTIO_BLK_T_FLUSH => self.handle_flush(),
            _ => {
                log::warn!("virtio-blk: unsupported request type {}", req_type);
                VIRTIO_BLK_S_UNSUPP
            }
        };

        if memory.write(status_desc.addr, &[status]).is_err() {
            log::warn!("virtio-blk: failed to write status");
        }
        total_written += 1;

        log::debug!(
            "virtio-blk: request #{}: type={} sector={} status={} written={}",
            self.request_count,
            req_type,
            sector,
            status,
            total_written
        );

        total_written
    }

    fn handle_read(
        &self,
        memory: &MemoryMap,
        mut sector: u64,
        data_descs: &[VirtqDesc],
        total_written: &mut u32,
    ) -> u8 {
        for desc in data_descs {
            if desc.flags & VIRTQ_DESC_F_WRITE == 0 {
                continue;
            }

            let offset = sector * SECTOR_SIZE;
            let len = desc.len as usize;

            let mut buf = vec![0u8; len];
            if let Err(e) = self.disk.read_at(&mut buf, offset) {
                log::warn!("virtio-blk: read error at offset {}: {}", offset, e);
                return VIRTIO_BLK_S_IOERR;
            }

            if memory.write(desc.addr, &buf).is_err() {
                log::warn!("virtio-blk: failed to write to guest memory");
                return VIRTIO_BLK_S_IOERR;
            }

            *total_written += len as u32;
            sector += (len as u64) / SECTOR_SIZE;
        }

        VIRTIO_BLK_S_OK
    }

    fn handle_write(&self, memory: &MemoryMap, mut sector: u64, data_descs: &[VirtqDesc]) -> u8 {
        for desc in data_descs {
            if desc.flags & VIRTQ_DESC_F_WRITE != 0 {
                continue;
            }

            let offset = sector * SECTOR_SIZE;
            let len = desc.len as usize;

            let mut buf = vec![0u8; len];
            if memory.read(desc.addr, &mut buf).is_err() {
                log::warn!("virtio-blk: failed to read from guest memory");
                return VIRTIO_BLK_S_IOERR;
            }

            if let Err(e) = self.disk.write_at(&buf, offset) {
                log::warn!("virtio-blk: write error at offset {}: {}", offset, e);
                return VIRTIO_BLK_S_IOERR;
            }

            sector += (len as u64) / SECTOR_SIZE;
        }

        VIRTIO_BLK_S_OK
    }

    fn handle_flush(&self) -> u8 {
        match self.disk.sync_all() {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                log::warn!("virtio-blk: flush error: {}", e);
                VIRTIO_BLK_S_IOERR
            }
        }
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => VIRTIO_DEVICE_ID_BLOCK,
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

            CONFIG_CAPACITY => (self.capacity & 0xFFFF_FFFF) as u32,
            CONFIG_CAPACITY_HI => (self.capacity >> 32) as u32,
            CONFIG_SIZE_MAX => SIZE_MAX,
            CONFIG_SEG_MAX => SEG_MAX,
            CONFIG_BLK_SIZE => BLK_SIZE,

            _ => {
                log::debug!("virtio-blk: unknown register read {:#x}", offset);
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
                self.queue_sel = value;
            }
            MMIO_QUEUE_NUM => {
                if value <= MAX_QUEUE_SIZE as u32 {
                    self.queue.size = value as u16;
                }
            }
            MMIO_QUEUE_PFN => {
                self.queue.set_pfn(value, self.guest_page_size);
                if self.queue.desc_table != 0 {
                    log::debug!(
                        "virtio-blk: queue {} addressed: desc={:#x} avail={:#x} used={:#x}",
                        self.queue_sel,
                        self.queue.desc_table,
                        self.queue.avail_ring,
                        self.queue.used_ring
                    );
                }
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
                    log::debug!("virtio-blk: device reset");
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
                    log::debug!("virtio-blk: status {} ({:#x})", flags.join("|"), value);
                }
            }
            _ => {
                log::debug!(
                    "virtio-blk: unknown register write {:#x} = {:#x}",
                    offset,
                    value
                );
            }
        }
    }
}

impl MmioDevice for VirtioBlk {
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
                "virtio-blk: non-aligned write offset={:#x} len={}",
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
    use crate::memmap::SlotFlags;
    use std::io::Read as _;

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;
    const HEADER_ADDR: u64 = 0x4000;
    const DATA_ADDR: u64 = 0x5000;
    const STATUS_ADDR: u64 = 0x6000;

    fn write_desc(memory: &mut MemoryMap, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let gpa = DESC_TABLE + idx as u64 * VirtqDesc::SIZE as u64;
        let mut bytes = [0u8; VirtqDesc::SIZE];
        bytes[0..8].copy_from_slice(&addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&len.to_le_bytes());
        bytes[12..14].copy_from_slice(&flags.to_le_bytes());
        bytes[14..16].copy_from_slice(&next.to_le_bytes());
        memory.write(gpa, &bytes).unwrap();
    }

    /// A single OUT request: header -> 512-byte write buffer -> status byte.
    fn blk_with_queued_write_request(disk_path: &std::path::Path) -> (VirtioBlk, MemoryMap) {
        let mut memory = MemoryMap::new();
        memory.add_region(0, 0x10000, SlotFlags::default()).unwrap();

        write_desc(&mut memory, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(
            &mut memory,
            1,
            DATA_ADDR,
            BLK_SIZE,
            VIRTQ_DESC_F_NEXT,
            2,
        );
        write_desc(&mut memory, 2, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);

        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&VIRTIO_BLK_T_OUT.to_le_bytes());
        memory.write(HEADER_ADDR, &header).unwrap();
        memory.write(DATA_ADDR, &[0xabu8; BLK_SIZE as usize]).unwrap();

        memory.write(AVAIL_RING + 2, &1u16.to_le_bytes()).unwrap();
        memory.write(AVAIL_RING + 4, &0u16.to_le_bytes()).unwrap();

        let mut blk = VirtioBlk::new(disk_path.to_str().unwrap(), Arc::new(NullSignal)).unwrap();
        blk.set_memory(&memory);
        blk.queue = Virtqueue {
            size: 4,
            ready: true,
            desc_table: DESC_TABLE,
            avail_ring: AVAIL_RING,
            used_ring: USED_RING,
            ..Default::default()
        };
        (blk, memory)
    }

    fn make_disk_file(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "aperture-virtio-blk-test-{}-{}.img",
            std::process::id(),
            tag
        ));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(64 * 1024).unwrap();
        path
    }

    #[test]
    fn queue_notify_before_driver_ok_does_not_process() {
        let disk_path = make_disk_file("gate");
        let (mut blk, _memory) = blk_with_queued_write_request(&disk_path);
        assert_eq!(blk.status, 0);

        blk.write_register(MMIO_QUEUE_NOTIFY, 1);

        assert_eq!(blk.queue.last_avail_idx, 0);
        let _ = std::fs::remove_file(&disk_path);
    }

    #[test]
    fn queue_notify_after_driver_ok_writes_sector_and_completes_request() {
        let disk_path = make_disk_file("roundtrip");
        let (mut blk, memory) = blk_with_queued_write_request(&disk_path);
        blk.status = STATUS_DRIVER_OK;

        blk.write_register(MMIO_QUEUE_NOTIFY, 1);

        assert_eq!(blk.queue.last_avail_idx, 1);

        let mut status = [0u8; 1];
        memory.read(STATUS_ADDR, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        let mut used_idx = [0u8; 2];
        memory.read(USED_RING + 2, &mut used_idx).unwrap();
        assert_eq!(u16::from_le_bytes(used_idx), 1);

        let mut disk = File::open(&disk_path).unwrap();
        let mut written = [0u8; BLK_SIZE as usize];
        disk.read_exact(&mut written).unwrap();
        assert!(written.iter().all(|&b| b == 0xab));

        let _ = std::fs::remove_file(&disk_path);
    }
}
