//! boot_params ("zero page") and E820 memory map setup.
//!
//! See <https://www.kernel.org/doc/html/latest/x86/zero-page.html>. Unchanged
//! from the teacher's implementation except that the ACPI RSDP pointer field
//! is left zero: this crate doesn't synthesize ACPI tables (SPEC_FULL §1
//! drops them in favor of `virtio_mmio.device=` command-line discovery), so
//! writing a fake RSDP address would point the guest at nothing.

use super::bzimage::LoadedKernel;
use super::layout;
use super::LinuxBootConfig;
use crate::memmap::MemoryMap;

use super::super::LoaderError;

const BOOT_PARAMS_SIZE: usize = 4096;

#[repr(u32)]
#[derive(Clone, Copy)]
enum E820Type {
    Ram = 1,
    Reserved = 2,
}

mod offsets {
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_HEADER: usize = 0x1f1;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const E820_MAP: usize = 0x2d0;
}

pub fn setup_boot_params(
    memory: &mut MemoryMap,
    config: &LinuxBootConfig,
    loaded_kernel: &LoadedKernel,
) -> Result<(), LoaderError> {
    let mut params = [0u8; BOOT_PARAMS_SIZE];

    let header_len = loaded_kernel
        .setup_header
        .len()
        .min(BOOT_PARAMS_SIZE - offsets::SETUP_HEADER);
    params[offsets::SETUP_HEADER..offsets::SETUP_HEADER + header_len]
        .copy_from_slice(&loaded_kernel.setup_header[..header_len]);

    // type_of_loader = 0xFF: undefined loader, use the extended fields.
    params[offsets::TYPE_OF_LOADER] = 0xff;
    // LOADED_HIGH | CAN_USE_HEAP.
    params[offsets::LOADFLAGS] |= 0x01 | 0x80;

    let cmd_line_ptr = (layout::CMDLINE_START as u32).to_le_bytes();
    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4].copy_from_slice(&cmd_line_ptr);

    memory.write(layout::BOOT_PARAMS_START, &params)?;

    setup_cmdline(memory, &config.cmdline)?;

    let e820_entries = setup_e820_map(memory, config.mem_size)?;
    memory.write_u8(
        layout::BOOT_PARAMS_START + offsets::E820_ENTRIES as u64,
        e820_entries,
    )?;

    log::info!(
        "boot_params at {:#x}, cmdline at {:#x}",
        layout::BOOT_PARAMS_START,
        layout::CMDLINE_START
    );

    Ok(())
}

fn setup_cmdline(memory: &mut MemoryMap, cmdline: &str) -> Result<(), LoaderError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(LoaderError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }

    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)?;

    log::debug!("kernel command line: {}", cmdline);
    Ok(())
}

/// Low memory, the EBDA/ROM reserved gap, and the rest of RAM as one usable
/// region above 1MB.
fn setup_e820_map(memory: &mut MemoryMap, mem_size: u64) -> Result<u8, LoaderError> {
    let e820_addr = layout::BOOT_PARAMS_START + offsets::E820_MAP as u64;
    let entry_size = 20u64;
    let mut entry_idx = 0u64;

    write_e820_entry(
        memory,
        e820_addr + entry_idx * entry_size,
        0,
        0x9_fc00,
        E820Type::Ram,
    )?;
    entry_idx += 1;

    write_e820_entry(
        memory,
        e820_addr + entry_idx * entry_size,
        0x9_fc00,
        0x6_0400,
        E820Type::Reserved,
    )?;
    entry_idx += 1;

    write_e820_entry(
        memory,
        e820_addr + entry_idx * entry_size,
        0x10_0000,
        mem_size - 0x10_0000,
        E820Type::Ram,
    )?;
    entry_idx += 1;

    log::debug!(
        "E820 map: {} entries, {} MiB total",
        entry_idx,
        mem_size / (1024 * 1024)
    );

    Ok(entry_idx as u8)
}

fn write_e820_entry(
    memory: &mut MemoryMap,
    addr: u64,
    base: u64,
    size: u64,
    type_: E820Type,
) -> Result<(), LoaderError> {
    memory.write_u64(addr, base)?;
    memory.write_u64(addr + 8, size)?;
    memory.write_u32(addr + 16, type_ as u32)?;
    Ok(())
}
