/// Architectural exceptions, carried as ordinary values through the
/// dispatcher. A faulting instruction leaves EIP at its own boundary; the
/// executor delivers the vector (and error code, where defined) through
/// the IDT afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    SegmentNotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { addr: u32, error_code: u32 },
    FpuError,
    AlignmentCheck,
    SimdError,
}

impl Exception {
    /// #GP(0), the most common protection fault.
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::FpuError => 16,
            Exception::AlignmentCheck => 17,
            Exception::SimdError => 19,
        }
    }

    /// Error code pushed by the handler frame, when the vector defines one.
    pub fn error_code(&self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(sel)
            | Exception::SegmentNotPresent(sel)
            | Exception::StackFault(sel)
            | Exception::GeneralProtection(sel) => Some(*sel as u32),
            Exception::PageFault { error_code, .. } => Some(*error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    /// Faults that escalate to #DF when raised while delivering another
    /// contributory exception.
    pub fn is_contributory(&self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::InvalidTss(_)
                | Exception::SegmentNotPresent(_)
                | Exception::StackFault(_)
                | Exception::GeneralProtection(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Exception::gp0().vector(), 13);
        assert_eq!(Exception::gp0().error_code(), Some(0));
        assert_eq!(Exception::InvalidOpcode.error_code(), None);
        let pf = Exception::PageFault {
            addr: 0x1000,
            error_code: 0x7,
        };
        assert_eq!(pf.vector(), 14);
        assert_eq!(pf.error_code(), Some(7));
    }
}
