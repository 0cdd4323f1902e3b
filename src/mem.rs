//! Memories.
//!
//! `SyncRam` is the synchronous dual-port block the cache tag/data arrays
//! are built from: the read port is registered (data out reflects the
//! address presented on the previous tick), the write port applies at the
//! clock edge. The bus-facing memories (boot ROM, SRAM, DDR) are plain
//! byte-addressed slaves; no access ever returns undefined bytes.

use crate::axi::AxiResp;
use crate::bus::AxiSlave;
use crate::error::SocError;

use std::collections::HashMap;

/// Synchronous dual-port RAM block.
///
/// One read port with a registered address, one write port applied at
/// `commit`. Reads of a cell written in the same tick observe the old value,
/// matching the underlying hardware block.
#[derive(Debug, Clone)]
pub struct SyncRam<T: Clone + Default> {
    cells: Vec<T>,
    raddr_r: usize,
    raddr_v: usize,
    wpend: Option<(usize, T)>,
}

impl<T: Clone + Default> SyncRam<T> {
    pub fn new(len: usize) -> Self {
        Self {
            cells: vec![T::default(); len],
            raddr_r: 0,
            raddr_v: 0,
            wpend: None,
        }
    }

    /// Present a read address for the next tick.
    pub fn set_raddr(&mut self, addr: usize) {
        debug_assert!(addr < self.cells.len());
        self.raddr_v = addr;
    }

    /// Data for the address registered at the previous tick.
    pub fn rdata(&self) -> &T {
        &self.cells[self.raddr_r]
    }

    /// Stage a write for the coming clock edge.
    pub fn write(&mut self, addr: usize, value: T) {
        debug_assert!(addr < self.cells.len());
        self.wpend = Some((addr, value));
    }

    /// Clock edge: apply the pending write and register the read address.
    pub fn commit(&mut self) {
        if let Some((addr, value)) = self.wpend.take() {
            self.cells[addr] = value;
        }
        self.raddr_r = self.raddr_v;
    }

    /// Clear storage and ports (power-on state).
    pub fn reset(&mut self) {
        for c in &mut self.cells {
            *c = T::default();
        }
        self.raddr_r = 0;
        self.raddr_v = 0;
        self.wpend = None;
    }

    /// Direct cell access bypassing the ports (reset sweeps, tests).
    pub fn cell(&self, addr: usize) -> &T {
        &self.cells[addr]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn read_bytes(bytes: &[u8], offset: u64, size: usize) -> u64 {
    let mut v = 0u64;
    for i in 0..size {
        let idx = offset as usize + i;
        if idx < bytes.len() {
            v |= (bytes[idx] as u64) << (8 * i);
        }
    }
    v
}

fn write_bytes(bytes: &mut [u8], offset: u64, size: usize, data: u64, strb: u8) {
    for i in 0..size {
        let idx = offset as usize + i;
        if idx < bytes.len() && strb & (1 << i) != 0 {
            bytes[idx] = (data >> (8 * i)) as u8;
        }
    }
}

/// Boot ROM. Bus writes are ignored; images are loaded by the host.
#[derive(Debug, Clone)]
pub struct BootRom {
    bytes: Vec<u8>,
}

impl BootRom {
    pub fn new(capacity: usize) -> Self {
        Self { bytes: vec![0; capacity] }
    }

    /// Load a firmware image at offset 0.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), SocError> {
        if image.len() > self.bytes.len() {
            return Err(SocError::RomOverflow { size: image.len(), capacity: self.bytes.len() });
        }
        self.bytes[..image.len()].copy_from_slice(image);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl AxiSlave for BootRom {
    fn read(&mut self, offset: u64, size: usize) -> (u64, AxiResp) {
        (read_bytes(&self.bytes, offset, size), AxiResp::Okay)
    }

    fn write(&mut self, _offset: u64, _size: usize, _data: u64, _strb: u8) -> AxiResp {
        // ROM: write completes on the bus but has no effect.
        AxiResp::Okay
    }
}

/// On-chip SRAM.
#[derive(Debug, Clone)]
pub struct Sram {
    bytes: Vec<u8>,
}

impl Sram {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }
}

impl AxiSlave for Sram {
    fn read(&mut self, offset: u64, size: usize) -> (u64, AxiResp) {
        (read_bytes(&self.bytes, offset, size), AxiResp::Okay)
    }

    fn write(&mut self, offset: u64, size: usize, data: u64, strb: u8) -> AxiResp {
        write_bytes(&mut self.bytes, offset, size, data, strb);
        AxiResp::Okay
    }
}

/// External DDR window, sparsely backed so a multi-hundred-MiB region costs
/// nothing until touched. Untouched bytes read as zero.
#[derive(Debug, Default)]
pub struct DdrMem {
    pages: HashMap<u64, Box<[u8; Self::PAGE]>>,
}

impl DdrMem {
    const PAGE: usize = 4096;

    pub fn new() -> Self {
        Self { pages: HashMap::new() }
    }

    fn page_mut(&mut self, offset: u64) -> &mut [u8; Self::PAGE] {
        self.pages
            .entry(offset / Self::PAGE as u64)
            .or_insert_with(|| Box::new([0; Self::PAGE]))
    }
}

impl AxiSlave for DdrMem {
    fn read(&mut self, offset: u64, size: usize) -> (u64, AxiResp) {
        // Aligned accesses never straddle a page.
        match self.pages.get(&(offset / Self::PAGE as u64)) {
            Some(p) => (read_bytes(&p[..], offset % Self::PAGE as u64, size), AxiResp::Okay),
            None => (0, AxiResp::Okay),
        }
    }

    fn write(&mut self, offset: u64, size: usize, data: u64, strb: u8) -> AxiResp {
        let in_page = offset % Self::PAGE as u64;
        write_bytes(&mut self.page_mut(offset)[..], in_page, size, data, strb);
        AxiResp::Okay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_ram_registered_read() {
        let mut ram: SyncRam<u64> = SyncRam::new(8);
        ram.write(3, 0xAB);
        ram.set_raddr(3);
        // Nothing visible before the edge.
        assert_eq!(*ram.rdata(), 0);
        ram.commit();
        assert_eq!(*ram.rdata(), 0xAB);
    }

    #[test]
    fn test_sync_ram_same_tick_write_read_old() {
        let mut ram: SyncRam<u64> = SyncRam::new(4);
        ram.write(0, 1);
        ram.set_raddr(0);
        ram.commit();
        // Overwrite cell 0 while reading it: read port sees the old value
        // until the next edge.
        ram.write(0, 2);
        assert_eq!(*ram.rdata(), 1);
        ram.commit();
        assert_eq!(*ram.rdata(), 2);
    }

    #[test]
    fn test_rom_load_and_read() {
        let mut rom = BootRom::new(64);
        rom.load_image(&[0x11, 0x22, 0x33, 0x44]).unwrap();
        let (v, resp) = rom.read(0, 4);
        assert_eq!(resp, AxiResp::Okay);
        assert_eq!(v, 0x4433_2211);
        // Unloaded bytes are defined (zero).
        assert_eq!(rom.read(8, 8).0, 0);
    }

    #[test]
    fn test_rom_ignores_writes() {
        let mut rom = BootRom::new(16);
        rom.load_image(&[0xAA]).unwrap();
        assert_eq!(rom.write(0, 8, 0x55, 0xFF), AxiResp::Okay);
        assert_eq!(rom.read(0, 1).0, 0xAA);
    }

    #[test]
    fn test_rom_overflow() {
        let mut rom = BootRom::new(4);
        assert!(matches!(
            rom.load_image(&[0; 5]),
            Err(SocError::RomOverflow { size: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_sram_strobed_write() {
        let mut sram = Sram::new(32);
        sram.write(0, 8, 0x1122_3344_5566_7788, 0xFF);
        // Strobe only the middle bytes.
        sram.write(0, 8, 0xAAAA_AAAA_AAAA_AAAA, 0x3C);
        assert_eq!(sram.read(0, 8).0, 0x1122_AAAA_AAAA_7788);
    }

    #[test]
    fn test_ddr_sparse() {
        let mut ddr = DdrMem::new();
        assert_eq!(ddr.read(0x1F00_0000, 8).0, 0);
        ddr.write(0x1F00_0000, 8, 0xDEAD_BEEF, 0xFF);
        assert_eq!(ddr.read(0x1F00_0000, 8).0, 0xDEAD_BEEF);
        // A single page is materialized.
        assert_eq!(ddr.pages.len(), 1);
    }
}
