//! vCPU execution loop: run/exit/dispatch, per SPEC_FULL §4.5.
//!
//! Grounded in the teacher's `run_with_io` call site in `main.rs` (a simple
//! loop around `VcpuFd::run`/`match` over `VcpuExit`), generalized to the
//! portable [`Backend`]/[`ExitKind`] vocabulary and given the state machine
//! and per-kind counters the distilled spec calls for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backend::{Backend, BackendError};
use crate::exit::{ExitKind, ExitSink};
use crate::loader::LoaderError;

/// Number of consecutive non-terminal exits tolerated before the loop
/// concludes the vCPU is spinning on something it can never resolve and
/// stops it. `ExitSink` (see its doc comment) does not surface the faulting
/// PC or GPA to the loop, so this tracks "too many exits with no Halt,
/// Shutdown, External, or Canceled in between" rather than the literal
/// same-PC/same-GPA condition SPEC_FULL §4.5 describes — a simplification in
/// the same spirit as the device table's address-keyed (not PC-keyed)
/// unmapped-MMIO dedup.
const SPIN_LIMIT: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Stopped,
    Running,
    Waiting,
    Error,
}

/// Per-kind exit counters. Only the owning vCPU thread writes these; reads
/// from other threads (diagnostics) take the enclosing `Mutex`.
#[derive(Debug, Default, Clone)]
pub struct ExitCounters {
    pub total: u64,
    pub halt: u64,
    pub io: u64,
    pub external: u64,
    pub shutdown: u64,
    pub fail_entry: u64,
    pub exception: u64,
    pub canceled: u64,
    pub interrupted: u64,
    pub virtual_timer: u64,
    pub architectural: u64,
    pub internal_error: u64,
    pub unknown: u64,
    pub run_time_micros: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VcpuError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("vcpu {index} stopped after {count} consecutive exits with no forward progress")]
    Runaway { index: u32, count: u64 },
    #[error("vcpu {index} entry failed: reason {reason:#x}")]
    FailEntry { index: u32, reason: u64 },
    #[error("vcpu {index} hit an unclassifiable exit: {tag}")]
    Unknown { index: u32, tag: &'static str },
    #[error("vcpu {index} failed to apply initial boot state: {source}")]
    BootSetup {
        index: u32,
        #[source]
        source: LoaderError,
    },
}

/// One vCPU's run loop state, shared between the owning thread and whatever
/// issues the stop request (the VM controller's shutdown path).
pub struct Vcpu<B: Backend> {
    pub index: u32,
    backend_vcpu: B::Vcpu,
    state: Mutex<VcpuState>,
    stop: Arc<AtomicBool>,
    counters: Mutex<ExitCounters>,
}

impl<B: Backend> Vcpu<B> {
    pub fn new(index: u32, backend_vcpu: B::Vcpu) -> Self {
        Self {
            index,
            backend_vcpu,
            state: Mutex::new(VcpuState::Stopped),
            stop: Arc::new(AtomicBool::new(false)),
            counters: Mutex::new(ExitCounters::default()),
        }
    }

    pub fn backend_vcpu(&self) -> &B::Vcpu {
        &self.backend_vcpu
    }

    pub fn backend_vcpu_mut(&mut self) -> &mut B::Vcpu {
        &mut self.backend_vcpu
    }

    pub fn state(&self) -> VcpuState {
        *self.state.lock().unwrap()
    }

    pub fn counters(&self) -> ExitCounters {
        self.counters.lock().unwrap().clone()
    }

    /// A handle the VM controller can use to request this vCPU stop from any
    /// thread, independent of the `Vcpu` itself (which the run loop owns
    /// exclusively while running).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn set_state(&self, state: VcpuState) {
        *self.state.lock().unwrap() = state;
    }

    /// Run until the guest halts/shuts down/fails, the stop flag is set, or
    /// the runaway guard trips. Intended to be called from the vCPU's own
    /// thread (see SPEC_FULL §5's thread-binding discipline for Apple's
    /// backend, which `crate::vm::Vm` accommodates by deferring
    /// registration of this vCPU until the thread starts).
    pub fn run_loop(&mut self, backend: &B, sink: &mut dyn ExitSink) -> Result<(), VcpuError> {
        self.set_state(VcpuState::Running);
        let mut spin_count: u64 = 0;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.set_state(VcpuState::Stopped);
                return Ok(());
            }

            let started = Instant::now();
            let exit = backend.run(&mut self.backend_vcpu, sink);
            let elapsed = started.elapsed().as_micros() as u64;

            let exit = match exit {
                Ok(exit) => exit,
                Err(e) if e.is_interrupted() => {
                    // A signal (e.g. the shutdown path's thread kick) broke
                    // the blocking `run` call; not a fault, just retry and
                    // let the stop-flag check above decide whether to exit.
                    continue;
                }
                Err(e) => {
                    self.set_state(VcpuState::Error);
                    return Err(VcpuError::Backend(e));
                }
            };

            {
                let mut counters = self.counters.lock().unwrap();
                counters.total += 1;
                counters.run_time_micros += elapsed;
            }

            match self.dispatch(&exit) {
                Dispatch::Continue => {
                    if matches!(exit, ExitKind::Io) {
                        spin_count += 1;
                        if spin_count >= SPIN_LIMIT {
                            self.set_state(VcpuState::Error);
                            return Err(VcpuError::Runaway {
                                index: self.index,
                                count: spin_count,
                            });
                        }
                    } else {
                        spin_count = 0;
                    }
                }
                Dispatch::Stop => {
                    self.set_state(VcpuState::Stopped);
                    return Ok(());
                }
                Dispatch::Fatal => {
                    self.set_state(VcpuState::Error);
                    return match exit {
                        ExitKind::FailEntry(reason) => Err(VcpuError::FailEntry {
                            index: self.index,
                            reason,
                        }),
                        ExitKind::Unknown(tag) => Err(VcpuError::Unknown {
                            index: self.index,
                            tag,
                        }),
                        _ => Err(VcpuError::Unknown {
                            index: self.index,
                            tag: "internal_error",
                        }),
                    };
                }
            }
        }
    }

    fn dispatch(&self, exit: &ExitKind) -> Dispatch {
        let mut counters = self.counters.lock().unwrap();
        match exit {
            ExitKind::Io => {
                counters.io += 1;
                Dispatch::Continue
            }
            ExitKind::Halt => {
                counters.halt += 1;
                Dispatch::Continue
            }
            ExitKind::External => {
                counters.external += 1;
                Dispatch::Continue
            }
            ExitKind::Shutdown => {
                counters.shutdown += 1;
                Dispatch::Stop
            }
            ExitKind::Canceled => {
                counters.canceled += 1;
                Dispatch::Stop
            }
            ExitKind::Interrupted => {
                counters.interrupted += 1;
                Dispatch::Continue
            }
            ExitKind::FailEntry(_) => {
                counters.fail_entry += 1;
                Dispatch::Fatal
            }
            ExitKind::Exception { .. } => {
                counters.exception += 1;
                // Any exception surfaced this far is one the backend could
                // not resolve into a benign MMIO trap; treat it as fatal for
                // the vCPU rather than spin forever re-raising it.
                Dispatch::Fatal
            }
            ExitKind::VirtualTimer => {
                counters.virtual_timer += 1;
                Dispatch::Continue
            }
            ExitKind::Architectural(_) => {
                counters.architectural += 1;
                Dispatch::Continue
            }
            ExitKind::InternalError => {
                counters.internal_error += 1;
                Dispatch::Fatal
            }
            ExitKind::Unknown(_) => {
                counters.unknown += 1;
                Dispatch::Fatal
            }
        }
    }
}

enum Dispatch {
    Continue,
    Stop,
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_default_to_zero() {
        let counters = ExitCounters::default();
        assert_eq!(counters.total, 0);
        assert_eq!(counters.halt, 0);
    }
}
