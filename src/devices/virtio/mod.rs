//! Virtio-MMIO transport: legacy (version 1) register layout and virtqueue
//! descriptor/avail/used ring processing.
//!
//! This is a from-scratch rewrite of the teacher's virtio module, which
//! implemented the version-2 split-64-bit-register layout. SPEC_FULL §4.4
//! calls for the legacy (version-1) layout instead, where each queue's
//! descriptor/available/used ring addresses are derived from a single guest
//! page number (queue PFN) rather than communicated as three pairs of 32-bit
//! registers. The ring-processing logic (`Virtqueue::{has_pending, pop_avail,
//! push_used, read_desc}`) is unchanged from the teacher apart from reading
//! through [`MemoryMap`] instead of `vm_memory`.
//!
//! # Register layout
//!
//! SPEC_FULL's register table (§4.4) does not enumerate a distinct slot for
//! the queue PFN alongside the driver-chosen queue size, since the legacy
//! addressing scheme needs both. This implementation resolves that gap by
//! placing QUEUE_PFN at 0x02c, immediately after QUEUE_NUM and before the
//! next documented register at 0x030 — the smallest addition that doesn't
//! collide with anything the table names (recorded as a DESIGN.md decision).

pub mod blk;
pub mod console;
#[cfg(target_os = "linux")]
pub mod net;

use crate::memmap::MemoryMap;

// ============================================================================
// MMIO Register Offsets (virtio-mmio, legacy/version 1)
// ============================================================================

pub const MMIO_MAGIC_VALUE: u64 = 0x000;
pub const MMIO_VERSION: u64 = 0x004;
pub const MMIO_DEVICE_ID: u64 = 0x008;
pub const MMIO_VENDOR_ID: u64 = 0x00c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const MMIO_DRIVER_FEATURES: u64 = 0x018;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x01c;
/// Read: max queue size for the selected queue. Write: guest page size (legacy, global).
pub const MMIO_QUEUE_NUM_MAX_OR_PAGE_SIZE: u64 = 0x020;
/// Write: select a queue by index. Read: the selected queue's configured size.
pub const MMIO_QUEUE_SEL_OR_NUM: u64 = 0x024;
/// Write: driver-chosen size for the selected queue.
pub const MMIO_QUEUE_NUM: u64 = 0x028;
/// Write: guest page number for the selected queue's ring set.
pub const MMIO_QUEUE_PFN: u64 = 0x02c;
pub const MMIO_QUEUE_READY: u64 = 0x030;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x034;
/// Read: interrupt status. Write: interrupt acknowledge.
pub const MMIO_INTERRUPT_STATUS_ACK: u64 = 0x038;
pub const MMIO_STATUS: u64 = 0x040;
pub const MMIO_CONFIG_START: u64 = 0x100;

pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION: u32 = 1;
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

// Device class IDs (SPEC_FULL §4.4).
pub const VIRTIO_DEVICE_ID_NET: u32 = 1;
pub const VIRTIO_DEVICE_ID_BLOCK: u32 = 2;
pub const VIRTIO_DEVICE_ID_CONSOLE: u32 = 3;
#[allow(dead_code)] // enumerated for completeness; no CLI flag constructs one (SPEC_FULL §4.4).
pub const VIRTIO_DEVICE_ID_RNG: u32 = 4;

pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_FAILED: u32 = 0x80;

pub const MAX_QUEUE_SIZE: u16 = 128;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

const DEFAULT_GUEST_PAGE_SIZE: u32 = 4096;

/// One virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: usize = 16;

    pub fn read_from(memory: &MemoryMap, addr: u64) -> Option<Self> {
        let mut buf = [0u8; Self::SIZE];
        memory.read(addr, &mut buf).ok()?;
        Some(Self {
            addr: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_le_bytes([buf[12], buf[13]]),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }
}

/// One virtqueue: descriptor table, available ring, used ring, plus the
/// legacy addressing state (guest page size and queue PFN) needed to derive
/// the three ring base addresses from a single page number.
#[derive(Debug, Default)]
pub struct Virtqueue {
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    pub last_avail_idx: u16,
    pfn: u32,
}

impl Virtqueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive `desc_table`/`avail_ring`/`used_ring` from `pfn` and
    /// `guest_page_size`, following the standard legacy virtio-mmio layout:
    /// descriptors at the page base, the available ring packed right after,
    /// the used ring on the next page boundary.
    pub fn set_pfn(&mut self, pfn: u32, guest_page_size: u32) {
        self.pfn = pfn;
        if pfn == 0 || self.size == 0 {
            self.desc_table = 0;
            self.avail_ring = 0;
            self.used_ring = 0;
            return;
        }

        let page_size = if guest_page_size == 0 {
            DEFAULT_GUEST_PAGE_SIZE
        } else {
            guest_page_size
        } as u64;

        let desc_table = pfn as u64 * page_size;
        let desc_table_size = VirtqDesc::SIZE as u64 * self.size as u64;
        let avail_ring = desc_table + desc_table_size;
        // flags(2) + idx(2) + ring[size](2*size) + used_event(2)
        let avail_ring_size = 6 + 2 * self.size as u64;
        let used_ring = align_up(avail_ring + avail_ring_size, page_size);

        self.desc_table = desc_table;
        self.avail_ring = avail_ring;
        self.used_ring = used_ring;
    }

    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    pub fn has_pending(&self, memory: &MemoryMap) -> bool {
        if !self.ready || self.size == 0 {
            return false;
        }
        let mut idx_buf = [0u8; 2];
        if memory.read(self.avail_ring + 2, &mut idx_buf).is_err() {
            return false;
        }
        u16::from_le_bytes(idx_buf) != self.last_avail_idx
    }

    /// Pop the next descriptor chain head from the available ring.
    pub fn pop_avail(&mut self, memory: &MemoryMap) -> Option<u16> {
        if !self.ready || self.size == 0 {
            return None;
        }

        let mut idx_buf = [0u8; 2];
        memory.read(self.avail_ring + 2, &mut idx_buf).ok()?;
        let avail_idx = u16::from_le_bytes(idx_buf);
        if avail_idx == self.last_avail_idx {
            return None;
        }

        let ring_offset = 4 + (self.last_avail_idx % self.size) as u64 * 2;
        let mut desc_idx_buf = [0u8; 2];
        memory
            .read(self.avail_ring + ring_offset, &mut desc_idx_buf)
            .ok()?;

        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Some(u16::from_le_bytes(desc_idx_buf))
    }

    /// Publish a completed descriptor chain to the used ring.
    pub fn push_used(&self, memory: &mut MemoryMap, desc_idx: u16, len: u32) -> Result<(), ()> {
        let mut idx_buf = [0u8; 2];
        memory
            .read(self.used_ring + 2, &mut idx_buf)
            .map_err(|_| ())?;
        let used_idx = u16::from_le_bytes(idx_buf);

        let elem_addr = self.used_ring + 4 + (used_idx % self.size) as u64 * 8;
        memory
            .write(elem_addr, &(desc_idx as u32).to_le_bytes())
            .map_err(|_| ())?;
        memory
            .write(elem_addr + 4, &len.to_le_bytes())
            .map_err(|_| ())?;

        let new_idx = used_idx.wrapping_add(1);
        memory
            .write(self.used_ring + 2, &new_idx.to_le_bytes())
            .map_err(|_| ())?;

        Ok(())
    }

    pub fn read_desc(&self, memory: &MemoryMap, idx: u16) -> Option<VirtqDesc> {
        if idx >= self.size {
            return None;
        }
        VirtqDesc::read_from(memory, self.desc_table + idx as u64 * VirtqDesc::SIZE as u64)
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfn_addressing_places_used_ring_on_next_page() {
        let mut q = Virtqueue {
            size: 4,
            ..Default::default()
        };
        q.set_pfn(1, 4096);
        assert_eq!(q.desc_table, 4096);
        assert_eq!(q.avail_ring, 4096 + 16 * 4);
        assert!(q.used_ring >= q.avail_ring + 6 + 2 * 4);
        assert_eq!(q.used_ring % 4096, 0);
    }

    #[test]
    fn zero_pfn_clears_addresses() {
        let mut q = Virtqueue {
            size: 4,
            ..Default::default()
        };
        q.set_pfn(1, 4096);
        q.set_pfn(0, 4096);
        assert_eq!(q.desc_table, 0);
        assert_eq!(q.avail_ring, 0);
        assert_eq!(q.used_ring, 0);
    }
}
