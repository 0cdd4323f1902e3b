//! Memory protection unit.
//!
//! Purely combinational region lookup. Two address ports are served at once
//! (instruction side and data side). A region matches when
//! `(addr & mask) == (base & mask)`; the flags of every matching enabled
//! region are OR-reduced.
//!
//! When no region matches, the access sees `{enable, r, w, x}` without
//! `CACHEABLE`: memory outside all programmed regions stays visible but
//! uncached.

use crate::bits;

bitflags::bitflags! {
    /// Region attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MpuFlags: u8 {
        const ENA       = 1 << 0;
        const CACHEABLE = 1 << 1;
        const READ      = 1 << 2;
        const WRITE     = 1 << 3;
        const EXEC      = 1 << 4;
    }
}

impl Default for MpuFlags {
    fn default() -> Self {
        MpuFlags::empty()
    }
}

impl MpuFlags {
    /// Flags returned when no region covers the address.
    pub fn no_match_default() -> Self {
        MpuFlags::ENA | MpuFlags::READ | MpuFlags::WRITE | MpuFlags::EXEC
    }
}

/// One programmed region.
#[derive(Debug, Clone, Copy, Default)]
struct MpuRegion {
    base: u64,
    mask: u64,
    flags: MpuFlags,
}

/// Region write command latched from the CSR mirror registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpuRegionWrite {
    pub we: bool,
    pub idx: usize,
    pub addr: u64,
    pub mask: u64,
    pub flags: MpuFlags,
}

/// The region table plus the two lookup ports.
#[derive(Debug, Clone)]
pub struct Mpu {
    regions: Vec<MpuRegion>,
    /// Regions restored after reset (the boot firmware view).
    boot: Vec<MpuRegionWrite>,
}

impl Mpu {
    pub fn new(num_regions: usize) -> Self {
        Self { regions: vec![MpuRegion::default(); num_regions], boot: Vec::new() }
    }

    /// Install the region table the part comes out of reset with.
    pub fn program_boot(&mut self, cmds: &[MpuRegionWrite]) {
        self.boot = cmds.to_vec();
        for c in &self.boot.clone() {
            self.write_region(c);
        }
    }

    pub fn reset(&mut self) {
        for r in &mut self.regions {
            *r = MpuRegion::default();
        }
        for c in &self.boot.clone() {
            self.write_region(c);
        }
    }

    /// Apply a region write from the CSR side (clock edge).
    pub fn write_region(&mut self, cmd: &MpuRegionWrite) {
        if cmd.we && cmd.idx < self.regions.len() {
            self.regions[cmd.idx] = MpuRegion { base: cmd.addr, mask: cmd.mask, flags: cmd.flags };
        }
    }

    /// Combinational lookup for one address.
    pub fn lookup(&self, addr: u64) -> MpuFlags {
        let mut flags = MpuFlags::empty();
        let mut matched = false;
        for r in &self.regions {
            if r.flags.contains(MpuFlags::ENA) && (addr & r.mask) == (r.base & r.mask) {
                flags |= r.flags;
                matched = true;
            }
        }
        if matched {
            flags
        } else {
            MpuFlags::no_match_default()
        }
    }

    /// Both lookup ports in one call (I-side, D-side).
    pub fn lookup2(&self, iaddr: u64, daddr: u64) -> (MpuFlags, MpuFlags) {
        (self.lookup(iaddr), self.lookup(daddr))
    }

    /// Convenience for programming a naturally aligned power-of-two region.
    pub fn region_mask(log2_size: u32) -> u64 {
        !bits::mask(log2_size)
    }
}
