//! Debug module interface.
//!
//! The host-side transport into the on-chip debug module: a small register
//! file of `{addr, wdata}` accesses that drives per-hart halt/resume
//! request lines, injects CSR accesses through the hart's debug port, fills
//! the 8-word program buffer, and reaches memory through a system-bus
//! master of its own.
//!
//! | Address | Register                                          |
//! |---------|---------------------------------------------------|
//! | 0x04    | data0: abstract command operand/result            |
//! | 0x10    | dmcontrol: haltreq[31], resumereq[30],            |
//! |         | hartreset[29], resethaltreq[3], dmactive[0]       |
//! | 0x11    | dmstatus: allresumeack[17], allhalted[9],         |
//! |         | allrunning[11]                                    |
//! | 0x16    | abstractcs: cmderr[10:8]                          |
//! | 0x17    | command: write[16], regno[15:0] (CSR space)       |
//! | 0x20-27 | progbuf0..7                                       |
//! | 0x39    | sbaddress0 (+0x3A high half)                      |
//! | 0x3C    | sbdata0 (+0x3D high half): access triggers a bus  |
//! |         | read/write at sbaddress                           |

use crate::cpu::csr::CsrRequest;
use crate::error::SocError;

pub const DMI_DATA0: u32 = 0x04;
pub const DMI_DMCONTROL: u32 = 0x10;
pub const DMI_DMSTATUS: u32 = 0x11;
pub const DMI_ABSTRACTCS: u32 = 0x16;
pub const DMI_COMMAND: u32 = 0x17;
pub const DMI_PROGBUF0: u32 = 0x20;
pub const DMI_SBADDRESS0: u32 = 0x39;
pub const DMI_SBADDRESS1: u32 = 0x3A;
pub const DMI_SBDATA0: u32 = 0x3C;
pub const DMI_SBDATA1: u32 = 0x3D;

/// Side effect a DMI register access asks the SoC to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiAction {
    /// Inject a CSR access through the hart debug port.
    AbstractCsr(CsrRequest),
    /// Run the program buffer on the halted hart.
    ProgbufExec,
    /// Single-beat system-bus read at `sbaddress`.
    SbRead,
    /// Single-beat system-bus write of `data` at `sbaddress`.
    SbWrite(u64),
}

/// The debug module register file and hart request lines.
#[derive(Debug, Default)]
pub struct DebugMod {
    pub haltreq: bool,
    pub resumereq: bool,
    pub hartreset: bool,
    pub resethaltreq: bool,
    pub data0: u64,
    pub progbuf: [u32; 8],
    /// In-flight debug-port injection toward the hart.
    pub dport_req: Option<CsrRequest>,
    /// Program-buffer execution request line.
    pub progbuf_exec: bool,
    /// Abstract command error (1 = exception during access).
    pub cmderr: u8,
    pub sbaddress: u64,
    /// Last value read through the system bus.
    pub sbdata: u64,
    /// Hart status mirrors maintained by the SoC.
    pub allhalted: bool,
    pub allresumeack: bool,
}

impl DebugMod {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Handle a DMI register write; the returned action, if any, is carried
    /// out by the SoC against the live system.
    pub fn write(&mut self, addr: u32, value: u64) -> Result<Option<DmiAction>, SocError> {
        match addr {
            DMI_DATA0 => {
                self.data0 = value;
                Ok(None)
            }
            DMI_DMCONTROL => {
                self.haltreq = value >> 31 & 1 != 0;
                self.resumereq = value >> 30 & 1 != 0;
                self.hartreset = value >> 29 & 1 != 0;
                self.resethaltreq = value >> 3 & 1 != 0;
                if self.resumereq {
                    self.allresumeack = false;
                }
                Ok(None)
            }
            DMI_ABSTRACTCS => {
                // cmderr is write-1-to-clear.
                if value >> 8 & 0x7 != 0 {
                    self.cmderr = 0;
                }
                Ok(None)
            }
            DMI_COMMAND => {
                if value >> 18 & 1 != 0 {
                    // postexec: run the program buffer.
                    self.progbuf_exec = true;
                    return Ok(Some(DmiAction::ProgbufExec));
                }
                let regno = (value & 0xFFFF) as u16;
                let write = value >> 16 & 1 != 0;
                let req = if write {
                    CsrRequest::write(regno, self.data0)
                } else {
                    CsrRequest::read(regno)
                };
                self.dport_req = Some(req);
                Ok(Some(DmiAction::AbstractCsr(req)))
            }
            a if (DMI_PROGBUF0..DMI_PROGBUF0 + 8).contains(&a) => {
                self.progbuf[(a - DMI_PROGBUF0) as usize] = value as u32;
                Ok(None)
            }
            DMI_SBADDRESS0 => {
                self.sbaddress = (self.sbaddress & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF);
                Ok(None)
            }
            DMI_SBADDRESS1 => {
                self.sbaddress = (self.sbaddress & 0xFFFF_FFFF) | (value << 32);
                Ok(None)
            }
            DMI_SBDATA0 => Ok(Some(DmiAction::SbWrite(value))),
            _ => Err(SocError::UnmappedDebugAddress { addr: addr as u64 }),
        }
    }

    /// Handle a DMI register read.
    pub fn read(&mut self, addr: u32) -> Result<(u64, Option<DmiAction>), SocError> {
        match addr {
            DMI_DATA0 => Ok((self.data0, None)),
            DMI_DMCONTROL => {
                let mut v = 0u64;
                v |= (self.haltreq as u64) << 31;
                v |= (self.resumereq as u64) << 30;
                v |= (self.hartreset as u64) << 29;
                v |= (self.resethaltreq as u64) << 3;
                v |= 1; // dmactive
                Ok((v, None))
            }
            DMI_DMSTATUS => {
                let mut v = 0u64;
                v |= (self.allresumeack as u64) << 17;
                v |= (!self.allhalted as u64) << 11; // allrunning
                v |= (self.allhalted as u64) << 9;
                Ok((v, None))
            }
            DMI_ABSTRACTCS => Ok(((self.cmderr as u64) << 8, None)),
            a if (DMI_PROGBUF0..DMI_PROGBUF0 + 8).contains(&a) => {
                Ok((self.progbuf[(a - DMI_PROGBUF0) as usize] as u64, None))
            }
            DMI_SBADDRESS0 => Ok((self.sbaddress & 0xFFFF_FFFF, None)),
            DMI_SBADDRESS1 => Ok((self.sbaddress >> 32, None)),
            DMI_SBDATA0 => Ok((0, Some(DmiAction::SbRead))),
            DMI_SBDATA1 => Ok((self.sbdata >> 32, None)),
            _ => Err(SocError::UnmappedDebugAddress { addr: addr as u64 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dmcontrol_bits() {
        let mut dm = DebugMod::new();
        dm.write(DMI_DMCONTROL, 1 << 31).unwrap();
        assert!(dm.haltreq);
        assert!(!dm.resumereq);

        dm.write(DMI_DMCONTROL, 1 << 30).unwrap();
        assert!(!dm.haltreq);
        assert!(dm.resumereq);

        let (v, _) = dm.read(DMI_DMCONTROL).unwrap();
        assert_ne!(v & 1, 0, "dmactive always reads set");
    }

    #[test]
    fn test_dmstatus_mirrors_halt_state() {
        let mut dm = DebugMod::new();
        let (v, _) = dm.read(DMI_DMSTATUS).unwrap();
        assert_ne!(v & (1 << 11), 0, "running by default");

        dm.allhalted = true;
        let (v, _) = dm.read(DMI_DMSTATUS).unwrap();
        assert_ne!(v & (1 << 9), 0);
        assert_eq!(v & (1 << 11), 0);
    }

    #[test]
    fn test_command_builds_csr_request() {
        let mut dm = DebugMod::new();
        dm.write(DMI_DATA0, 0x1234).unwrap();
        let action = dm.write(DMI_COMMAND, (1 << 16) | 0x305).unwrap();
        match action {
            Some(DmiAction::AbstractCsr(req)) => {
                assert_eq!(req.addr, 0x305);
                assert_eq!(req.data, 0x1234);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_sb_access_actions() {
        let mut dm = DebugMod::new();
        dm.write(DMI_SBADDRESS0, 0x0200_4000).unwrap();
        dm.write(DMI_SBADDRESS1, 0x0).unwrap();
        assert_eq!(dm.sbaddress, 0x0200_4000);

        assert_eq!(dm.write(DMI_SBDATA0, 100).unwrap(), Some(DmiAction::SbWrite(100)));
        let (_, action) = dm.read(DMI_SBDATA0).unwrap();
        assert_eq!(action, Some(DmiAction::SbRead));
    }

    #[test]
    fn test_unmapped_address_is_fatal() {
        let mut dm = DebugMod::new();
        assert!(matches!(
            dm.write(0x7F, 0),
            Err(SocError::UnmappedDebugAddress { addr: 0x7F })
        ));
    }

    #[test]
    fn test_progbuf_words() {
        let mut dm = DebugMod::new();
        for i in 0..8u32 {
            dm.write(DMI_PROGBUF0 + i, 0x100 + i as u64).unwrap();
        }
        assert_eq!(dm.progbuf[7], 0x107);
        let (v, _) = dm.read(DMI_PROGBUF0 + 3).unwrap();
        assert_eq!(v, 0x103);
    }
}
