//! The dispatcher: trace lookup/build and the bounded run loop.

use crate::decode::{self, DecodeError, Instr, Op};
use crate::exception::Exception;
use crate::interp::{self, Control};
use crate::interrupts::{self, DeliveryOutcome};
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState};
use crate::trace::{Trace, TraceCache, MAX_TRACE_INSTRS};

/// The platform interrupt complex as the CPU sees it.
pub trait InterruptController {
    fn intr_asserted(&self) -> bool;
    /// Interrupt-acknowledge cycle; resolves the vector.
    fn acknowledge(&mut self) -> u8;
    /// True when a device asked the CPU to leave its run loop.
    fn take_fast_return(&mut self) -> bool;
    fn take_nmi(&mut self) -> bool;
    /// Non-destructive NMI peek, used to split traces at event windows.
    fn nmi_pending(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExit {
    /// Cycle budget exhausted.
    Completed,
    /// Guest executed HLT and waits for an interrupt.
    Halted,
    /// A device requested a fast return.
    Async,
    /// Unrecoverable exception cascade; the machine must reset.
    TripleFault,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub exit: BatchExit,
    pub cycles: u64,
}

pub struct CpuCore {
    pub state: CpuState,
    traces: TraceCache,
}

impl CpuCore {
    pub fn new(mode: CpuMode) -> Self {
        Self {
            state: CpuState::new(mode),
            traces: TraceCache::new(),
        }
    }

    pub fn reset(&mut self, bus: &mut dyn CpuBus) {
        self.state.reset();
        self.traces.clear(bus);
        bus.sync(&self.state);
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn has_cached_trace(&self, phys_eip: u32) -> bool {
        self.traces.contains(phys_eip, self.state.state_hash())
    }

    pub fn flush_traces(&mut self, bus: &mut dyn CpuBus) {
        self.traces.clear(bus);
    }
}

/// True when the op can redirect EIP or change the execution-mode hash;
/// decode never continues a trace past one of these.
fn ends_trace(op: &Op) -> bool {
    matches!(
        op,
        Op::Jmp
            | Op::JmpFar
            | Op::JmpFarInd
            | Op::Jcc(_)
            | Op::Jcxz
            | Op::Loop
            | Op::Loope
            | Op::Loopne
            | Op::Call
            | Op::CallFar
            | Op::CallFarInd
            | Op::Ret { .. }
            | Op::RetFar { .. }
            | Op::Iret
            | Op::Int(_)
            | Op::Int3
            | Op::Into
            | Op::Hlt
            | Op::Sysenter
            | Op::Sysexit
            | Op::MovSeg
            | Op::PopSeg(_)
            | Op::MovToCr
            | Op::Lmsw
            | Op::Popf
            | Op::Strings(_)
    )
}

/// Decodes a run of instructions starting at the current EIP. The trace is
/// page-bounded: only its final instruction may spill into the next page,
/// and both backing pages are version-stamped.
fn build_trace(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    phys_eip: u32,
) -> Result<Trace, Exception> {
    let code32 = state.code32();
    let user = state.user_access();
    let page = phys_eip & !0xFFF;
    let mut pages = vec![(page, bus.code_page_version(page))];
    let mut instrs: Vec<Instr> = Vec::new();
    let mut offset = 0u32;

    loop {
        let fetch_phys = phys_eip + offset;
        let to_page_end = 0x1000 - (fetch_phys & 0xFFF);
        let mut window = [0u8; 16];
        let in_page = to_page_end.min(16) as usize;
        bus.read_phys_code(fetch_phys, &mut window[..in_page]);
        let mut window_len = in_page;
        if in_page < 15 {
            // The next bytes live on the following linear page; translate
            // it so a cross-page instruction can still decode. A fault here
            // only matters if decode actually needs those bytes.
            let next_lin = state
                .linear_eip()
                .wrapping_add(offset)
                .wrapping_add(to_page_end);
            match bus.translate_fetch(next_lin, user) {
                Ok(next_phys) => {
                    let rest = 16 - in_page;
                    bus.read_phys_code(next_phys, &mut window[in_page..in_page + rest]);
                    window_len = 16;
                }
                Err(fault) => {
                    if instrs.is_empty() {
                        // Try decoding with what we have; if it is
                        // incomplete the fetch fault is architectural.
                        match decode::decode(&window[..window_len], code32) {
                            Ok(_) => {}
                            Err(DecodeError::Truncated) => return Err(fault),
                            Err(_) => {}
                        }
                    }
                }
            }
        }

        let instr = match decode::decode(&window[..window_len], code32) {
            Ok(i) => i,
            Err(DecodeError::Ud) => {
                if instrs.is_empty() {
                    return Err(Exception::InvalidOpcode);
                }
                break;
            }
            Err(DecodeError::TooLong) => {
                if instrs.is_empty() {
                    return Err(Exception::gp0());
                }
                break;
            }
            Err(DecodeError::Truncated) => {
                if instrs.is_empty() {
                    return Err(Exception::InvalidOpcode);
                }
                break;
            }
        };

        let crosses_page = (fetch_phys & 0xFFF) + instr.len as u32 > 0x1000;
        if crosses_page {
            // Stamp the spill page as well, then end the trace.
            let next_lin = state
                .linear_eip()
                .wrapping_add(offset)
                .wrapping_add(to_page_end);
            if let Ok(next_phys) = bus.translate_fetch(next_lin, user) {
                let p = next_phys & !0xFFF;
                pages.push((p, bus.code_page_version(p)));
            }
            instrs.push(instr);
            break;
        }

        offset += instr.len as u32;
        let stop = ends_trace(&instr.op);
        instrs.push(instr);
        if stop || instrs.len() >= MAX_TRACE_INSTRS || offset >= 0x1000 - (phys_eip & 0xFFF) {
            break;
        }
    }
    Ok(Trace::new(instrs, &pages))
}

/// Runs up to `budget` instructions, delivering pending events at
/// instruction boundaries only.
pub fn run_batch(
    cpu: &mut CpuCore,
    bus: &mut dyn CpuBus,
    ctrl: &mut dyn InterruptController,
    budget: u64,
) -> BatchOutcome {
    let outcome = run_batch_inner(cpu, bus, ctrl, budget);
    cpu.state.msr.tsc = cpu.state.msr.tsc.wrapping_add(outcome.cycles);
    outcome
}

fn run_batch_inner(
    cpu: &mut CpuCore,
    bus: &mut dyn CpuBus,
    ctrl: &mut dyn InterruptController,
    budget: u64,
) -> BatchOutcome {
    let mut cycles: u64 = 0;

    loop {
        for (begin, end) in bus.take_trace_invalidations() {
            cpu.traces.invalidate_phys_range(bus, begin, end);
        }

        // Event window. A MOV-SS/STI shadow suppresses exactly one
        // boundary.
        if cpu.state.interrupt_shadow {
            cpu.state.interrupt_shadow = false;
        } else if ctrl.take_nmi() {
            if interrupts::inject_nmi(&mut cpu.state, bus) == DeliveryOutcome::TripleFault {
                return BatchOutcome {
                    exit: BatchExit::TripleFault,
                    cycles,
                };
            }
        } else if ctrl.intr_asserted() && cpu.state.if_enabled() {
            let vector = ctrl.acknowledge();
            if interrupts::inject_external(&mut cpu.state, bus, vector)
                == DeliveryOutcome::TripleFault
            {
                return BatchOutcome {
                    exit: BatchExit::TripleFault,
                    cycles,
                };
            }
        }

        if cpu.state.halted {
            return BatchOutcome {
                exit: BatchExit::Halted,
                cycles,
            };
        }
        if cycles >= budget {
            return BatchOutcome {
                exit: BatchExit::Completed,
                cycles,
            };
        }

        // Code-segment limit check happens per trace entry.
        if cpu.state.protected_mode()
            && !cpu.state.vm86()
            && cpu.state.eip() > cpu.state.segments.cs.limit
        {
            if dispatch_fault(cpu, bus, Exception::gp0()) == DeliveryOutcome::TripleFault {
                return BatchOutcome {
                    exit: BatchExit::TripleFault,
                    cycles,
                };
            }
            continue;
        }

        let lin_eip = cpu.state.linear_eip();
        let user = cpu.state.user_access();
        let phys_eip = match bus.translate_fetch(lin_eip, user) {
            Ok(p) => p,
            Err(fault) => {
                if dispatch_fault(cpu, bus, fault) == DeliveryOutcome::TripleFault {
                    return BatchOutcome {
                        exit: BatchExit::TripleFault,
                        cycles,
                    };
                }
                continue;
            }
        };
        let hash = cpu.state.state_hash();

        if cpu.traces.lookup(bus, phys_eip, hash).is_none() {
            match build_trace(&cpu.state, bus, phys_eip) {
                Ok(trace) => cpu.traces.insert(bus, phys_eip, hash, trace),
                Err(fault) => {
                    if dispatch_fault(cpu, bus, fault) == DeliveryOutcome::TripleFault {
                        return BatchOutcome {
                            exit: BatchExit::TripleFault,
                            cycles,
                        };
                    }
                    continue;
                }
            }
        }

        // Execute the trace. The instruction list is copied out so the
        // cache can be mutated by SMC invalidation mid-trace without
        // aliasing; traces are short.
        let instrs: Vec<Instr> = cpu
            .traces
            .lookup(bus, phys_eip, hash)
            .map(|t| t.instrs.clone())
            .unwrap_or_default();

        let mut outcome: Option<BatchExit> = None;
        for (idx, instr) in instrs.iter().enumerate() {
            if cycles >= budget {
                break;
            }
            // Mid-trace boundaries also honor pending events; the outer
            // loop performs the actual delivery.
            if idx > 0
                && !cpu.state.interrupt_shadow
                && (ctrl.nmi_pending() || ctrl.intr_asserted() && cpu.state.if_enabled())
            {
                break;
            }
            let eip = cpu.state.eip();
            let next_eip = if cpu.state.code32() {
                eip.wrapping_add(instr.len as u32)
            } else {
                eip.wrapping_add(instr.len as u32) & 0xFFFF
            };
            match interp::execute(&mut cpu.state, bus, instr, next_eip) {
                Ok(Control::Advance) => {
                    cpu.state.set_eip(next_eip);
                    cycles += 1;
                }
                Ok(Control::Branch) => {
                    cycles += 1;
                    break;
                }
                Ok(Control::Halt) => {
                    cpu.state.set_eip(next_eip);
                    cycles += 1;
                    break;
                }
                Err(fault) => {
                    cycles += 1;
                    if dispatch_fault(cpu, bus, fault) == DeliveryOutcome::TripleFault {
                        return BatchOutcome {
                            exit: BatchExit::TripleFault,
                            cycles,
                        };
                    }
                    break;
                }
            }
            if cpu.state.interrupt_shadow {
                // Shadow-setting ops end their boundary at the trace loop.
                break;
            }
        }

        if ctrl.take_fast_return() {
            outcome = Some(BatchExit::Async);
        }
        if let Some(exit) = outcome {
            return BatchOutcome { exit, cycles };
        }
    }
}

fn dispatch_fault(cpu: &mut CpuCore, bus: &mut dyn CpuBus, fault: Exception) -> DeliveryOutcome {
    tracing::trace!(
        target: "cpu",
        ?fault,
        eip = format_args!("{:#x}", cpu.state.eip()),
        "architectural exception"
    );
    interrupts::raise_exception(&mut cpu.state, bus, fault)
}
