//! Aperture - a minimal virtual machine monitor.
//!
//! Boots a Linux kernel (KVM/x86_64) or a raw flat binary (KVM or Apple
//! Hypervisor.framework), with a legacy serial console, an optional MMIO
//! console, and optional virtio-blk/virtio-net devices.

mod backend;
mod config;
mod devices;
mod error;
mod exit;
mod loader;
mod memmap;
mod shutdown;
mod vcpu;
mod vm;

use std::process::ExitCode;

use clap::Parser;

use config::Args;
use error::VmmError;

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(config::level_filter(args.log))
        .init();

    match run(args) {
        Ok(summary) => {
            for (index, state, counters) in &summary.per_vcpu {
                log::info!(
                    "vcpu{index}: stopped in state {state:?} after {} exits ({} halt, {} io, {} shutdown)",
                    counters.total,
                    counters.halt,
                    counters.io,
                    counters.shutdown,
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("aperture: {e}");
            if let Some(hint) = e.remediation() {
                eprintln!("  hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<vm::RunSummary, VmmError> {
    let vm = vm::Vm::build(&args)?;
    Ok(vm.run()?)
}
