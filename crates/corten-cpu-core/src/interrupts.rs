//! Event injection: external interrupts, NMI, and the exception-delivery
//! escalation chain (fault -> double fault -> triple fault).

use crate::exception::Exception;
use crate::interp::{deliver_interrupt, EventKind};
use crate::mem::CpuBus;
use crate::state::CpuState;

pub const NMI_VECTOR: u8 = 2;

/// Outcome of trying to deliver a CPU exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Delivery failed twice over: the machine must reset.
    TripleFault,
}

pub fn inject_external(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
) -> DeliveryOutcome {
    match deliver_interrupt(state, bus, vector, EventKind::External, None) {
        Ok(()) => DeliveryOutcome::Delivered,
        Err(second) => raise_exception(state, bus, second),
    }
}

pub fn inject_nmi(state: &mut CpuState, bus: &mut dyn CpuBus) -> DeliveryOutcome {
    inject_external(state, bus, NMI_VECTOR)
}

/// Delivers an architectural exception, escalating per the contributory
/// rules. EIP must already point at the faulting instruction boundary.
pub fn raise_exception(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    exc: Exception,
) -> DeliveryOutcome {
    if let Exception::PageFault { addr, .. } = exc {
        state.control.cr2 = addr;
    }
    match deliver_interrupt(state, bus, exc.vector(), EventKind::Exception, exc.error_code()) {
        Ok(()) => DeliveryOutcome::Delivered,
        Err(second) => {
            if matches!(exc, Exception::DoubleFault) {
                // A fault while delivering #DF shuts the machine down.
                return DeliveryOutcome::TripleFault;
            }
            let first_counts = exc.is_contributory() || matches!(exc, Exception::PageFault { .. });
            let second_counts =
                second.is_contributory() || matches!(second, Exception::PageFault { .. });
            if !(first_counts && second_counts) {
                // Benign combinations are handled serially.
                return raise_exception(state, bus, second);
            }
            tracing::debug!(target: "cpu", ?exc, ?second, "escalating to double fault");
            match deliver_interrupt(
                state,
                bus,
                Exception::DoubleFault.vector(),
                EventKind::Exception,
                Some(0),
            ) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(_) => DeliveryOutcome::TripleFault,
            }
        }
    }
}
