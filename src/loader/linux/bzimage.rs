//! bzImage parsing: setup-header validation and protected-mode kernel load.
//!
//! See <https://www.kernel.org/doc/html/latest/x86/boot.html>. Unchanged from
//! the teacher's implementation apart from writing through [`MemoryMap`]
//! instead of `vm_memory`.

use std::fs::File;
use std::io::Read;

use super::layout;
use crate::memmap::MemoryMap;

use super::super::LoaderError;

/// Linux boot protocol magic number "HdrS".
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Minimum supported boot protocol version (2.06, required for 64-bit boot).
const MIN_BOOT_VERSION: u16 = 0x0206;

/// Offset of the setup header within the bzImage.
const SETUP_HEADER_OFFSET: usize = 0x1f1;

pub struct LoadedKernel {
    /// Raw setup header bytes to copy into boot_params.
    pub setup_header: Vec<u8>,
}

pub fn load_kernel(memory: &mut MemoryMap, kernel_path: &str) -> Result<LoadedKernel, LoaderError> {
    let mut file = File::open(kernel_path).map_err(|source| LoaderError::ReadImage {
        path: kernel_path.to_string(),
        source,
    })?;
    let mut kernel_data = Vec::new();
    file.read_to_end(&mut kernel_data)
        .map_err(|source| LoaderError::ReadImage {
            path: kernel_path.to_string(),
            source,
        })?;

    log::info!("kernel image size: {} bytes", kernel_data.len());

    if kernel_data.len() < 0x250 {
        return Err(LoaderError::InvalidImage(
            "image too small to contain a setup header".into(),
        ));
    }

    let magic = u32::from_le_bytes([
        kernel_data[0x202],
        kernel_data[0x203],
        kernel_data[0x204],
        kernel_data[0x205],
    ]);
    if magic != BOOT_MAGIC {
        return Err(LoaderError::InvalidImage(format!(
            "invalid boot magic: expected {:#x}, got {:#x}",
            BOOT_MAGIC, magic
        )));
    }

    let version = u16::from_le_bytes([kernel_data[0x206], kernel_data[0x207]]);
    if version < MIN_BOOT_VERSION {
        return Err(LoaderError::InvalidImage(format!(
            "unsupported boot protocol version {:#x} (minimum {:#x} for 64-bit boot)",
            version, MIN_BOOT_VERSION
        )));
    }

    let setup_sects = kernel_data[0x1f1];
    let setup_sects = if setup_sects == 0 { 4 } else { setup_sects };

    log::debug!(
        "setup header: protocol {:#x}, {} setup sectors, loadflags {:#x}",
        version,
        setup_sects,
        kernel_data[0x211]
    );

    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= kernel_data.len() {
        return Err(LoaderError::InvalidImage(
            "setup size exceeds kernel image size".into(),
        ));
    }

    let kernel_code = &kernel_data[setup_size..];
    memory.write(layout::HIMEM_START, kernel_code)?;

    log::info!(
        "loaded {} bytes of kernel code at {:#x}, entry at {:#x}",
        kernel_code.len(),
        layout::HIMEM_START,
        layout::HIMEM_START + 0x200
    );

    let header_end = (SETUP_HEADER_OFFSET + 0x80).min(kernel_data.len());
    let setup_header = kernel_data[SETUP_HEADER_OFFSET..header_end].to_vec();

    Ok(LoadedKernel { setup_header })
}
