//! L1 cache cluster.
//!
//! - `lru`: per-set pseudo-LRU replacement tree
//! - `tagmem`: per-way tag + data arrays with a coupled even/odd bank pair
//!   so an instruction fetch can check its line and the next one together
//! - `mpu`: combinational region lookup (cacheable/executable/r/w flags)
//! - `icache` / `dcache`: the two L1 FSMs
//! - `cachetop`: merges both miss streams onto one AXI issue path

pub mod cachetop;
pub mod dcache;
pub mod icache;
pub mod lru;
pub mod mpu;
pub mod tagmem;

pub use cachetop::CacheTop;
pub use dcache::DCacheLru;
pub use icache::ICacheLru;
pub use mpu::{Mpu, MpuFlags};

use crate::config::LINE_BYTES;

bitflags::bitflags! {
    /// Cache line state flags stored alongside the tag.
    ///
    /// A modified line never has `SHARED` set; at most one way per set holds
    /// a given tag with `VALID`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u8 {
        const VALID    = 1 << 0;
        const SHARED   = 1 << 1;
        /// Dirty w.r.t. memory (data cache only).
        const MODIFIED = 1 << 2;
        /// LR/SC reservation covers this line (data cache only).
        const RESERVED = 1 << 3;
    }
}

impl Default for LineFlags {
    fn default() -> Self {
        LineFlags::empty()
    }
}

/// One cache line of backing storage.
pub type Line = [u8; LINE_BYTES];

/// Flush request latched from the CSR `flushi` path or the debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushRequest {
    pub valid: bool,
    /// Address bit 0 set means "flush everything".
    pub address: u64,
}
