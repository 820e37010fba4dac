//! Guest image loading and boot-time CPU/memory setup.
//!
//! Generalizes the teacher's `boot/` module (which only knew how to boot a
//! Linux bzImage on KVM/x86_64) into two independent loaders sharing one
//! error type and the portable [`crate::memmap::MemoryMap`]:
//!
//! - [`linux`]: the Linux boot protocol (bzImage, boot_params/E820, 64-bit
//!   page tables, GDT/IDT) — x86_64/KVM only, exactly as the teacher did it.
//! - [`binary`]: a raw flat-binary loader for the `--binary`/`--entry` CLI
//!   flags, used on both backends and both architectures since it carries no
//!   protocol of its own beyond "copy bytes, then set PC".

#[cfg(target_os = "linux")]
pub mod linux;

pub mod binary;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to read guest image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid guest image: {0}")]
    InvalidImage(String),
    #[error("guest memory error: {0}")]
    Memory(#[from] crate::memmap::MemError),
    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },
    #[error("backend error during boot setup: {0}")]
    Backend(#[from] crate::backend::BackendError),
}
