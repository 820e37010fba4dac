//! Raw flat-binary loader for the `--binary`/`--entry` CLI flags.
//!
//! Unlike the Linux boot protocol this carries no header or handshake: the
//! file's bytes are copied verbatim to a guest physical address and the
//! caller is responsible for pointing the vCPU's program counter at the
//! requested entry address before the first `run`.

use crate::backend::{ActiveBackend, Backend};
use crate::memmap::MemoryMap;

use super::LoaderError;

/// Point a freshly created vCPU's program counter at `entry`, the way
/// `--binary`/`--entry` boots: no boot protocol, no stack or segment setup,
/// just "start fetching here" (the guest image is responsible for the rest).
pub fn set_entry_point(regs: &mut <ActiveBackend as Backend>::Regs, entry: u64) {
    #[cfg(target_os = "linux")]
    {
        regs.rip = entry;
    }
    #[cfg(target_os = "macos")]
    {
        #[cfg(target_arch = "x86_64")]
        {
            regs.rip = entry;
        }
        #[cfg(target_arch = "aarch64")]
        {
            regs.pc = entry;
        }
    }
}

/// Copy `path`'s contents into `memory` starting at `load_addr`.
pub fn load_binary(memory: &mut MemoryMap, path: &str, load_addr: u64) -> Result<(), LoaderError> {
    let data = std::fs::read(path).map_err(|source| LoaderError::ReadImage {
        path: path.to_string(),
        source,
    })?;

    log::info!(
        "loaded raw binary {} ({} bytes) at {:#x}",
        path,
        data.len(),
        load_addr
    );

    memory.write(load_addr, &data)?;
    Ok(())
}
