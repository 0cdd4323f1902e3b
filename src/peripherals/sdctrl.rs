//! SD-card controller, SPI mode.
//!
//! A bit-level serializer: the system clock is divided by `scaler` into an
//! SPI clock (`level`), MOSI shifts out MSB-first on the falling edge, MISO
//! is sampled on the rising edge. CRC7 covers transmitted bits, CRC16
//! covers received data bits; both are register-accessible. Byte traffic
//! goes through two FIFOs.
//!
//! Register map (APB word offsets):
//!
//! | Offset | Register                                               |
//! |--------|--------------------------------------------------------|
//! | 0x00   | sckdiv: clock scaler (31 bits)                         |
//! | 0x08   | watchdog preset (16 bits)                              |
//! | 0x44   | control/status: `{ena_byte_cnt[31:16],                 |
//! |        |  rx_data_block[10], rx_synced[9], rx_ena[8],           |
//! |        |  generate_crc[7], state[6:4], miso[2], protect[1],     |
//! |        |  detected[0]}`                                         |
//! | 0x48   | TX FIFO push; bit 31 = full                            |
//! | 0x4C   | RX FIFO pop; bit 31 = empty                            |
//! | 0x50   | TX watermark                                           |
//! | 0x54   | RX watermark                                           |
//! | 0x58   | CRC16 (read back / seed)                               |
//!
//! The controller also owns a large AXI window mapping the card contents;
//! the baseline model returns all-ones there and ignores writes.

use crate::axi::AxiResp;
use crate::bits;
use crate::bus::{ApbSlave, AxiSlave};
use crate::peripherals::Sfifo;

use log::trace;

/// Serializer states, also visible in the control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SpiState {
    #[default]
    Idle = 0,
    WaitEdge = 1,
    Send = 2,
    Recv = 3,
    RecvSync = 4,
    Ending = 5,
}

/// Data-block start token the RecvSync state hunts for.
const DATA_START_TOKEN: u8 = 0xFE;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Regs {
    scaler: u32,
    scaler_cnt: u32,
    wdog: u16,
    wdog_cnt: u16,
    generate_crc: bool,
    rx_ena: bool,
    rx_synced: bool,
    rx_data_block: bool,
    level: bool,
    cs: bool,
    state: SpiState,
    shiftreg: u8,
    ena_byte_cnt: u16,
    bit_cnt: u8,
    tx_val: u8,
    rx_val: u8,
    rx_ready: bool,
    crc7: u8,
    crc16: u16,
    txmark: u16,
    rxmark: u16,
}

impl Regs {
    fn reset() -> Self {
        Self {
            scaler: 0,
            scaler_cnt: 0,
            wdog: 0,
            wdog_cnt: 0,
            generate_crc: false,
            rx_ena: false,
            rx_synced: false,
            rx_data_block: false,
            level: true,
            cs: false,
            state: SpiState::Idle,
            shiftreg: 0xFF,
            ena_byte_cnt: 0,
            bit_cnt: 0,
            tx_val: 0,
            rx_val: 0,
            rx_ready: false,
            crc7: 0,
            crc16: 0,
            txmark: 0,
            rxmark: 0,
        }
    }
}

/// The SPI-mode SD controller register block and serializer.
#[derive(Debug)]
pub struct SdCtrl {
    r: Regs,
    rxfifo: Sfifo,
    txfifo: Sfifo,
    /// MISO line level driven by the card.
    dat0: bool,
    detected: bool,
    protect: bool,
}

impl SdCtrl {
    pub fn new(log2_fifosz: u32) -> Self {
        Self {
            r: Regs::reset(),
            rxfifo: Sfifo::new(1 << log2_fifosz),
            txfifo: Sfifo::new(1 << log2_fifosz),
            dat0: true,
            detected: false,
            protect: false,
        }
    }

    pub fn reset(&mut self) {
        self.r = Regs::reset();
        self.rxfifo.reset();
        self.txfifo.reset();
    }

    // Pin side.

    /// Card drives the MISO (DAT0) line.
    pub fn set_dat0(&mut self, level: bool) {
        self.dat0 = level;
    }

    pub fn set_detected(&mut self, inserted: bool) {
        self.detected = inserted;
    }

    pub fn set_protect(&mut self, protected: bool) {
        self.protect = protected;
    }

    /// SCLK output: the divided clock, gated by chip-select.
    pub fn sclk(&self) -> bool {
        self.r.level && self.r.cs
    }

    /// MOSI output (the CMD pin in SPI mode); idles high.
    pub fn mosi(&self) -> bool {
        self.r.rx_ena || self.r.shiftreg & 0x80 != 0
    }

    /// Chip select on the DAT3 pin, active low.
    pub fn cs_n(&self) -> bool {
        !self.r.cs
    }

    /// CRC7 polynomial x^7 + x^3 + 1 over the transmitted bit.
    fn next_crc7(crc7: u8, tx_bit: bool) -> u8 {
        let inv = ((crc7 >> 6) & 1 != 0) ^ tx_bit;
        let mut c = (crc7 << 1) & 0x7F;
        if inv {
            c ^= 0x09; // feedback into x^3 and x^0
        }
        c
    }

    /// CRC16 polynomial x^16 + x^12 + x^5 + 1 over the received bit.
    fn next_crc16(crc16: u16, rx_bit: bool) -> u16 {
        let inv = ((crc16 >> 15) & 1 != 0) ^ rx_bit;
        let mut c = crc16 << 1;
        if inv {
            c ^= 0x1021;
        }
        c
    }

    /// One system-clock tick of the serializer.
    pub fn spi_tick(&mut self) {
        let r = self.r.clone();
        let mut v = r.clone();
        let mut txfifo_re = false;
        let mut rxfifo_push = None;

        let vb_crc7 = Self::next_crc7(r.crc7, r.shiftreg & 0x80 != 0);
        let vb_crc16 = Self::next_crc16(r.crc16, self.dat0);

        // Clock scaler.
        let mut posedge = false;
        let mut negedge = false;
        if r.scaler != 0 {
            if r.scaler_cnt == r.scaler - 1 {
                v.scaler_cnt = 0;
                v.level = !r.level;
                posedge = !r.level;
                negedge = r.level;
            } else {
                v.scaler_cnt = r.scaler_cnt + 1;
            }
        }

        let shiftreg_next = if r.rx_ena {
            (r.shiftreg << 1) | self.dat0 as u8
        } else {
            (r.shiftreg << 1) | 1
        };
        if r.cs && ((negedge && !r.rx_ena) || (posedge && r.rx_ena)) {
            v.shiftreg = shiftreg_next;
        }

        if negedge && r.cs {
            if r.bit_cnt != 0 {
                if !r.rx_ena || r.rx_synced {
                    v.bit_cnt = r.bit_cnt - 1;
                }
            } else {
                v.cs = false;
            }
        }

        v.rx_ready = false;
        if posedge && r.cs && (!r.rx_ena || r.rx_synced) {
            v.crc7 = vb_crc7;
            v.crc16 = vb_crc16;
        }

        match r.state {
            SpiState::Idle => {
                v.wdog_cnt = r.wdog;
                if r.ena_byte_cnt != 0 {
                    txfifo_re = !r.rx_ena;
                    if self.txfifo.is_empty() || r.rx_ena {
                        // FIFO empty or receiving: shift out all-ones.
                        v.tx_val = 0xFF;
                    } else {
                        v.tx_val = self.txfifo.rdata();
                    }
                    v.state = SpiState::WaitEdge;
                    v.ena_byte_cnt = r.ena_byte_cnt - 1;
                    v.crc7 = 0;
                } else {
                    v.tx_val = 0xFF;
                    if r.generate_crc {
                        // A CRC request with no bytes left has nothing to
                        // trail: drop it.
                        v.generate_crc = false;
                    }
                }
            }
            SpiState::WaitEdge => {
                if negedge {
                    v.cs = true;
                    v.bit_cnt = 7;
                    if r.rx_ena {
                        v.shiftreg = 0;
                        if r.rx_data_block {
                            v.state = SpiState::RecvSync;
                        } else {
                            v.state = SpiState::Recv;
                        }
                    } else {
                        v.shiftreg = r.tx_val;
                        v.state = SpiState::Send;
                    }
                }
            }
            SpiState::Send => {
                if r.bit_cnt == 0 && posedge {
                    if r.ena_byte_cnt != 0 {
                        txfifo_re = true;
                        if self.txfifo.is_empty() {
                            v.tx_val = 0xFF;
                        } else {
                            v.tx_val = self.txfifo.rdata();
                        }
                        v.state = SpiState::WaitEdge;
                        v.ena_byte_cnt = r.ena_byte_cnt - 1;
                    } else if r.generate_crc {
                        v.tx_val = (vb_crc7 << 1) | 1;
                        v.generate_crc = false;
                        v.state = SpiState::WaitEdge;
                    } else {
                        v.state = SpiState::Ending;
                    }
                }
            }
            SpiState::Recv => {
                if posedge {
                    if !r.rx_synced {
                        v.rx_synced = r.cs && !self.dat0;
                        if r.wdog_cnt != 0 {
                            v.wdog_cnt = r.wdog_cnt - 1;
                        } else if r.wdog == 0 {
                            // Wait for the start bit indefinitely.
                        } else {
                            // Start-bit wait timed out.
                            v.rx_synced = true;
                        }
                    }
                    if r.bit_cnt == 0 {
                        if r.ena_byte_cnt != 0 {
                            v.state = SpiState::WaitEdge;
                            v.ena_byte_cnt = r.ena_byte_cnt - 1;
                        } else {
                            v.state = SpiState::Ending;
                        }
                        v.rx_ready = true;
                        v.rx_val = shiftreg_next;
                    }
                }
            }
            SpiState::RecvSync => {
                if posedge {
                    if shiftreg_next == DATA_START_TOKEN || r.wdog_cnt == 0 {
                        v.state = SpiState::Ending;
                        v.rx_val = shiftreg_next;
                        v.rx_ready = true;
                        v.ena_byte_cnt = 0;
                        v.bit_cnt = 0;
                        v.crc16 = 0;
                    } else {
                        v.wdog_cnt = r.wdog_cnt - 1;
                    }
                }
            }
            SpiState::Ending => {
                if !r.cs {
                    v.state = SpiState::Idle;
                }
            }
        }

        // A completed byte lands in the RX FIFO.
        if r.rx_ready {
            rxfifo_push = Some(r.rx_val);
        }

        if v.state != r.state {
            trace!("sdctrl: {:?} -> {:?}", r.state, v.state);
        }

        self.txfifo.stage(None, txfifo_re);
        self.txfifo.commit();
        self.rxfifo.stage(rxfifo_push, false);
        self.rxfifo.commit();
        self.r = v;
    }

    /// RX FIFO fill level (tests and the host drain path).
    pub fn rx_count(&self) -> usize {
        self.rxfifo.count()
    }

    pub fn crc16(&self) -> u16 {
        self.r.crc16
    }

    fn control_read(&self) -> u32 {
        let mut v = 0u32;
        v |= self.detected as u32;
        v |= (self.protect as u32) << 1;
        v |= (self.dat0 as u32) << 2;
        v |= (self.r.state as u32 & 0x7) << 4;
        v |= (self.r.generate_crc as u32) << 7;
        v |= (self.r.rx_ena as u32) << 8;
        v |= (self.r.rx_synced as u32) << 9;
        v |= (self.r.rx_data_block as u32) << 10;
        v |= (self.r.ena_byte_cnt as u32) << 16;
        v
    }
}

impl ApbSlave for SdCtrl {
    fn read(&mut self, offset: u64) -> (u32, bool) {
        let v = match offset {
            0x00 => self.r.scaler,
            0x08 => self.r.wdog as u32,
            0x44 => self.control_read(),
            0x48 => (self.txfifo.is_full() as u32) << 31,
            0x4C => {
                let empty = self.rxfifo.is_empty();
                let byte = self.rxfifo.pop_now().unwrap_or(0) as u32;
                ((empty as u32) << 31) | byte
            }
            0x50 => self.r.txmark as u32,
            0x54 => self.r.rxmark as u32,
            0x58 => self.r.crc16 as u32,
            _ => return (0, false),
        };
        (v, false)
    }

    fn write(&mut self, offset: u64, value: u32) -> bool {
        match offset {
            0x00 => {
                self.r.scaler = value & 0x7FFF_FFFF;
                self.r.scaler_cnt = 0;
            }
            0x08 => self.r.wdog = value as u16,
            0x44 => {
                self.r.generate_crc = bits::bit(value as u64, 7);
                self.r.rx_ena = bits::bit(value as u64, 8);
                self.r.rx_synced = bits::bit(value as u64, 9);
                self.r.rx_data_block = bits::bit(value as u64, 10);
                self.r.ena_byte_cnt = (value >> 16) as u16;
            }
            0x48 => self.txfifo.push_now(value as u8),
            0x4C => {} // pops happen on the read side
            0x50 => self.r.txmark = value as u16,
            0x54 => self.r.rxmark = value as u16,
            0x58 => self.r.crc16 = value as u16,
            _ => {}
        }
        false
    }

    fn tick(&mut self) {
        self.spi_tick();
    }
}

/// The AXI window over the card contents. The baseline model has no card
/// data behind it: reads return all-ones, writes complete and vanish.
#[derive(Debug, Default)]
pub struct SdMemWindow;

impl AxiSlave for SdMemWindow {
    fn read(&mut self, _offset: u64, _size: usize) -> (u64, AxiResp) {
        (u64::MAX, AxiResp::Okay)
    }

    fn write(&mut self, _offset: u64, _size: usize, _data: u64, _strb: u8) -> AxiResp {
        AxiResp::Okay
    }
}
