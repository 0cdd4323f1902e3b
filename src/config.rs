//! SoC configuration.
//!
//! One plain struct carries the elaboration-time knobs: cache geometry, the
//! reset vector, the memory map bases, and the convergence bound of the tick
//! loop. `validate` runs once at elaboration and rejects geometries the
//! model cannot express.

use crate::error::SocError;
use crate::sim::ResetKind;

/// System bus width in bytes (64-bit data bus).
pub const BUS_DATA_BYTES: usize = 8;
/// log2 of the bus width in bytes.
pub const LOG2_BUS_DATA_BYTES: u32 = 3;
/// Transaction id width on the system bus.
pub const BUS_ID_BITS: u32 = 5;

/// Cache line size in bytes.
pub const LINE_BYTES: usize = 32;
/// log2 of the line size.
pub const LOG2_LINE_BYTES: u32 = 5;
/// Bus beats per cache line.
pub const BEATS_PER_LINE: usize = LINE_BYTES / BUS_DATA_BYTES;

/// Interrupt sources handled by the PLIC model.
pub const PLIC_IRQ_MAX: usize = 1024;
/// PLIC routing contexts (hart x privilege).
pub const PLIC_CTX_MAX: usize = 8;

/// Top-level configuration for [`crate::soc::Soc`].
#[derive(Debug, Clone)]
pub struct SocConfig {
    /// First fetch address after reset; also the reset value of `dpc`.
    pub reset_vector: u64,
    /// Number of harts (bounds CLINT/PLIC context wiring).
    pub harts: usize,
    /// I-cache ways (power of two).
    pub icache_ways: usize,
    /// log2 of lines per I-cache way.
    pub icache_log2_lines: u32,
    /// D-cache ways (power of two).
    pub dcache_ways: usize,
    /// log2 of lines per D-cache way.
    pub dcache_log2_lines: u32,
    /// MPU region table entries.
    pub mpu_regions: usize,
    /// Fixed-point bound of the combinational evaluation loop. Zero means
    /// "number of combinational processes plus a small constant".
    pub comb_iteration_limit: usize,
    /// Reset flavor for the register banks.
    pub reset_kind: ResetKind,
    /// log2 of the SD controller FIFO depth.
    pub sd_log2_fifosz: u32,
}

impl SocConfig {
    /// Default combinational processes in the cluster; the automatic
    /// iteration bound is this plus a small constant.
    pub(crate) const COMB_PROCESSES: usize = 12;

    /// Effective fixed-point bound.
    pub fn comb_limit(&self) -> usize {
        if self.comb_iteration_limit != 0 {
            self.comb_iteration_limit
        } else {
            Self::COMB_PROCESSES + 4
        }
    }

    /// Reject geometries the model cannot express.
    pub fn validate(&self) -> Result<(), SocError> {
        if self.harts == 0 || 2 * self.harts > PLIC_CTX_MAX {
            return Err(SocError::InvalidConfig("hart count out of range"));
        }
        if !self.icache_ways.is_power_of_two() || !self.dcache_ways.is_power_of_two() {
            return Err(SocError::InvalidConfig("cache ways must be a power of two"));
        }
        if self.icache_ways != 4 || self.dcache_ways != 4 {
            // The pseudo-LRU tree is built for 4 ways.
            return Err(SocError::InvalidConfig("only 4-way caches are supported"));
        }
        if self.icache_log2_lines == 0 || self.icache_log2_lines > 16 {
            return Err(SocError::InvalidConfig("icache lines-per-way out of range"));
        }
        if self.dcache_log2_lines == 0 || self.dcache_log2_lines > 16 {
            return Err(SocError::InvalidConfig("dcache lines-per-way out of range"));
        }
        if self.mpu_regions == 0 || self.mpu_regions > 32 {
            return Err(SocError::InvalidConfig("MPU region count out of range"));
        }
        if self.sd_log2_fifosz == 0 || self.sd_log2_fifosz > 12 {
            return Err(SocError::InvalidConfig("SD FIFO depth out of range"));
        }
        if self.reset_vector % 4 != 0 {
            return Err(SocError::InvalidConfig("reset vector must be 4-byte aligned"));
        }
        Ok(())
    }
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            reset_vector: 0x0001_0000,
            harts: 1,
            icache_ways: 4,
            icache_log2_lines: 6,
            dcache_ways: 4,
            dcache_log2_lines: 6,
            mpu_regions: 8,
            comb_iteration_limit: 0,
            reset_kind: ResetKind::Asynchronous,
            sd_log2_fifosz: 9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SocConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut cfg = SocConfig::default();
        cfg.icache_ways = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = SocConfig::default();
        cfg.harts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SocConfig::default();
        cfg.reset_vector = 0x1_0002;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_comb_limit_auto() {
        let cfg = SocConfig::default();
        assert_eq!(cfg.comb_limit(), SocConfig::COMB_PROCESSES + 4);

        let mut cfg2 = SocConfig::default();
        cfg2.comb_iteration_limit = 3;
        assert_eq!(cfg2.comb_limit(), 3);
    }
}
