//! # Page-Fault Error Code
//!
//! The CPU pushes a 32-bit error code with every `#PF` and stores the faulting
//! linear address in CR2. Only bit 0 matters for the fault handler: whether
//! the page was absent or an access rule was broken on a present page.

use bitfield_struct::bitfield;

/// Page-fault error code as pushed by the CPU.
///
/// | Bit | Name | Meaning when set |
/// |-----|------|------------------|
/// | 0   | `P`    | Protection violation on a present page |
/// | 1   | `W/R`  | The access was a write |
/// | 2   | `U/S`  | The access came from user mode |
/// | 3   | `RSVD` | A reserved bit was set in an entry |
/// | 4   | `I/D`  | Instruction fetch |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    pub protection_violation: bool,
    pub write: bool,
    pub user_mode: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    #[bits(27)]
    __: u32,
}

/// What a fault means for the handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultCause {
    /// The page (or its table) is absent; demand paging may resolve it.
    NotPresent,
    /// An access rule was violated on a present page.
    ProtectionViolation,
}

impl PageFaultError {
    #[inline]
    #[must_use]
    pub const fn cause(self) -> FaultCause {
        if self.protection_violation() {
            FaultCause::ProtectionViolation
        } else {
            FaultCause::NotPresent
        }
    }

    /// A short human-readable description for diagnostics.
    #[must_use]
    pub const fn explain(self) -> &'static str {
        match (self.protection_violation(), self.write(), self.user_mode()) {
            (false, false, false) => "supervisor read of a non-present page",
            (false, true, false) => "supervisor write to a non-present page",
            (false, false, true) => "user read of a non-present page",
            (false, true, true) => "user write to a non-present page",
            (true, false, false) => "supervisor read protection violation",
            (true, true, false) => "supervisor write protection violation",
            (true, false, true) => "user read protection violation",
            (true, true, true) => "user write protection violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_cause() {
        assert_eq!(PageFaultError::from_bits(0b110).cause(), FaultCause::NotPresent);
        assert_eq!(PageFaultError::from_bits(0b111).cause(), FaultCause::ProtectionViolation);
        assert_eq!(
            PageFaultError::from_bits(0b111).explain(),
            "user write protection violation"
        );
        assert_eq!(
            PageFaultError::from_bits(0).explain(),
            "supervisor read of a non-present page"
        );
    }
}
