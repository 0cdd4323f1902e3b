//! Simulator-internal error conditions.
//!
//! Errors of this kind are fatal to the simulation run: they indicate a
//! malformed elaboration (overlapping address regions, bad geometry) or a
//! broken model (combinational loop, illegal burst). Faults that are visible
//! to the *simulated* program (load/store faults, illegal instructions) are
//! not errors here; they travel on response bundles and become CSR traps.

use thiserror::Error;

/// Fatal simulator errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SocError {
    /// The combinational net did not converge within the iteration bound.
    #[error("combinational loop: no convergence after {iterations} iterations")]
    CombinationalLoop { iterations: usize },

    /// Two slaves claim overlapping address ranges.
    #[error("address region 0x{base:016x}..0x{end:016x} ({name}) overlaps an existing mapping")]
    RegionOverlap { name: &'static str, base: u64, end: u64 },

    /// An AXI burst would cross a 4 KiB boundary or has an unsupported shape.
    #[error("illegal AXI burst: addr=0x{addr:016x} len={len} size=2^{size}")]
    IllegalBurst { addr: u64, len: u8, size: u8 },

    /// A debug-port access targeted an address no slave decodes.
    #[error("unmapped debug access at 0x{addr:016x}")]
    UnmappedDebugAddress { addr: u64 },

    /// A host-driven access never completed.
    #[error("debug access at 0x{addr:016x} did not complete")]
    DebugAccessTimeout { addr: u64 },

    /// Elaboration-time configuration error.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A ROM image does not fit the boot ROM.
    #[error("ROM image of {size} bytes exceeds capacity {capacity}")]
    RomOverflow { size: usize, capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = SocError::CombinationalLoop { iterations: 12 };
        assert_eq!(
            e.to_string(),
            "combinational loop: no convergence after 12 iterations"
        );
    }

    #[test]
    fn test_region_overlap_message() {
        let e = SocError::RegionOverlap { name: "sram", base: 0x0800_0000, end: 0x0820_0000 };
        assert!(e.to_string().contains("sram"));
        assert!(e.to_string().contains("overlaps"));
    }
}
