//! Guest physical memory map.
//!
//! A small table of GPA→HVA slots, allocated directly with `nix::sys::mman`
//! rather than through `vm-memory`'s region-set abstraction: the spec calls
//! for backend-assigned slot indices, an explicit flag set, and a hard ≤32
//! slot cap, which maps more directly onto a hand-rolled table than onto
//! `GuestMemoryMmap`'s region-set model. `nix` with the `mman` feature is
//! already part of the dependency stack this crate inherited.

use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use thiserror::Error;

/// Maximum number of memory slots a VM may register.
pub const MAX_SLOTS: usize = 32;

/// Guest physical addresses (and region sizes) must be aligned to this.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("memory slot table is full (max {MAX_SLOTS})")]
    NoSlot,
    #[error("failed to allocate {size} bytes of guest memory: {source}")]
    Alloc { size: u64, source: std::io::Error },
    #[error("failed to unmap guest memory: {0}")]
    Unmap(std::io::Error),
    #[error("region [{gpa_base:#x}, {gpa_end:#x}) overlaps existing slot {other}")]
    Overlap {
        gpa_base: u64,
        gpa_end: u64,
        other: u32,
    },
    #[error("access [{gpa:#x}, len {len}) is not contained in any mapped slot")]
    OutOfRange { gpa: u64, len: usize },
    #[error("backend rejected memory mapping: {0}")]
    Backend(String),
}

bitflags::bitflags! {
    /// Per-slot access permissions plus the dirty-log opt-in bit.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const LOG_DIRTY = 1 << 3;
    }
}

impl Default for SlotFlags {
    fn default() -> Self {
        SlotFlags::READ | SlotFlags::WRITE | SlotFlags::EXECUTE
    }
}

/// One contiguous GPA→HVA mapping.
pub struct MemSlot {
    /// Backend-assigned slot index (dense, starts at 0).
    pub index: u32,
    /// Page-aligned guest physical base address.
    pub gpa_base: u64,
    /// Size of the region in bytes (a multiple of [`PAGE_SIZE`]).
    pub size: u64,
    /// Host virtual address backing the region.
    hva: NonNull<u8>,
    pub flags: SlotFlags,
}

impl MemSlot {
    /// Host virtual address backing this slot. Valid until the slot is destroyed.
    pub fn host_base(&self) -> u64 {
        self.hva.as_ptr() as u64
    }

    fn as_byte_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.hva.as_ptr(), self.size as usize) }
    }

    fn as_byte_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.hva.as_ptr(), self.size as usize) }
    }
}

// Safety: the backing mmap region is exclusively owned by this slot and is
// only ever touched from the vCPU thread that owns the memory map.
unsafe impl Send for MemSlot {}

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn page_round_up(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// The VM's guest physical memory map: a small array of slots.
///
/// Slots are only added while the VM is stopped (see SPEC_FULL §3); once a
/// vCPU has entered guest mode the table is treated as immutable.
#[derive(Default)]
pub struct MemoryMap {
    slots: Vec<MemSlot>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocate and register a new region. Returns the installed slot for the
    /// caller to hand to `Backend::map_mem`.
    ///
    /// `gpa_base` is page-aligned down before use; `size` is rounded up to a
    /// page multiple. Overlap with any existing slot is rejected.
    pub fn add_region(
        &mut self,
        gpa_base: u64,
        size: u64,
        flags: SlotFlags,
    ) -> Result<&MemSlot, MemError> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(MemError::NoSlot);
        }

        let gpa_base = page_align_down(gpa_base);
        let size = page_round_up(size);
        let gpa_end = gpa_base + size;

        if let Some(other) = self
            .slots
            .iter()
            .find(|s| gpa_base < s.gpa_base + s.size && s.gpa_base < gpa_end)
        {
            return Err(MemError::Overlap {
                gpa_base,
                gpa_end,
                other: other.index,
            });
        }

        let hva = unsafe {
            mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(size as usize).expect("zero-size region"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            )
        }
        .map_err(|e| MemError::Alloc {
            size,
            source: std::io::Error::from_raw_os_error(e as i32),
        })?;

        let index = self.slots.len() as u32;
        self.slots.push(MemSlot {
            index,
            gpa_base,
            size,
            hva: hva.cast(),
            flags,
        });
        Ok(self.slots.last().unwrap())
    }

    /// Locate the slot containing `[gpa, gpa + len)`.
    fn find(&self, gpa: u64, len: usize) -> Option<&MemSlot> {
        self.slots.iter().find(|s| {
            gpa >= s.gpa_base
                && (gpa - s.gpa_base)
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= s.size)
        })
    }

    fn find_mut(&mut self, gpa: u64, len: usize) -> Option<&mut MemSlot> {
        self.slots.iter_mut().find(|s| {
            gpa >= s.gpa_base
                && (gpa - s.gpa_base)
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= s.size)
        })
    }

    /// Translate a guest physical access into a host virtual address, provided
    /// the whole range lies within a single slot.
    pub fn translate(&self, gpa: u64, len: usize) -> Result<u64, MemError> {
        self.find(gpa, len)
            .map(|s| s.host_base() + (gpa - s.gpa_base))
            .ok_or(MemError::OutOfRange { gpa, len })
    }

    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemError> {
        let slot = self
            .find(gpa, buf.len())
            .ok_or(MemError::OutOfRange { gpa, len: buf.len() })?;
        let off = (gpa - slot.gpa_base) as usize;
        buf.copy_from_slice(&slot.as_byte_slice()[off..off + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, gpa: u64, buf: &[u8]) -> Result<(), MemError> {
        let len = buf.len();
        let slot = self
            .find_mut(gpa, len)
            .ok_or(MemError::OutOfRange { gpa, len })?;
        let off = (gpa - slot.gpa_base) as usize;
        slot.as_byte_slice_mut()[off..off + len].copy_from_slice(buf);
        Ok(())
    }

    pub fn write_u8(&mut self, gpa: u64, value: u8) -> Result<(), MemError> {
        self.write(gpa, &[value])
    }

    pub fn write_u32(&mut self, gpa: u64, value: u32) -> Result<(), MemError> {
        self.write(gpa, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, gpa: u64, value: u64) -> Result<(), MemError> {
        self.write(gpa, &value.to_le_bytes())
    }

    pub fn slots(&self) -> &[MemSlot] {
        &self.slots
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        for slot in &self.slots {
            let _ = unsafe { munmap(slot.hva.cast(), slot.size as usize) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_within_slot() {
        let mut map = MemoryMap::new();
        map.add_region(0, 0x10000, SlotFlags::default()).unwrap();
        let hva = map.translate(0x100, 16).unwrap();
        assert_eq!(hva, map.slots()[0].host_base() + 0x100);
    }

    #[test]
    fn translate_out_of_range_fails() {
        let mut map = MemoryMap::new();
        map.add_region(0, 0x1000, SlotFlags::default()).unwrap();
        assert!(map.translate(0x1000, 1).is_err());
    }

    #[test]
    fn overlap_is_rejected() {
        let mut map = MemoryMap::new();
        map.add_region(0, 0x2000, SlotFlags::default()).unwrap();
        let err = map.add_region(0x1000, 0x1000, SlotFlags::default());
        assert!(matches!(err, Err(MemError::Overlap { .. })));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut map = MemoryMap::new();
        map.add_region(0, 0x1000, SlotFlags::default()).unwrap();
        map.write_u32(0x10, 0xdead_beef).unwrap();
        let mut buf = [0u8; 4];
        map.read(0x10, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xdead_beef);
    }

    #[test]
    fn slot_table_caps_at_max() {
        let mut map = MemoryMap::new();
        for i in 0..MAX_SLOTS {
            map.add_region((i as u64) * 0x10000, PAGE_SIZE, SlotFlags::default())
                .unwrap();
        }
        assert!(matches!(
            map.add_region(MAX_SLOTS as u64 * 0x10000, PAGE_SIZE, SlotFlags::default()),
            Err(MemError::NoSlot)
        ));
    }
}
