//! L1 instruction cache with LRU replacement.
//!
//! Read-only cache in front of the fetch stage. Lookups go through the
//! coupled tag memory so a fetch straddling a line boundary hits only when
//! both lines are resident. Misses consult the MPU: executable cacheable
//! addresses refill a full line with a ReadShared burst, non-cacheable ones
//! issue a short ReadNoSnoop, and non-executable ones synthesize an all-ones
//! line with the load fault latched into the response.
//!
//! The flush engine walks set x way with direct-access invalidate writes;
//! the same sweep implements the post-reset invalidation of every line.

use crate::bits;
use crate::bus::MemReqType;
use crate::cache::mpu::MpuFlags;
use crate::cache::tagmem::TagMemCoupled;
use crate::cache::{FlushRequest, Line, LineFlags};
use crate::config::{BEATS_PER_LINE, LINE_BYTES, LOG2_LINE_BYTES};

use log::trace;

/// Fetch-side and memory-side inputs sampled by the combinational process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ICacheInputs {
    pub req_valid: bool,
    pub req_addr: u64,
    pub resp_ready: bool,
    pub req_mem_ready: bool,
    pub mem_data_valid: bool,
    pub mem_data: [u64; BEATS_PER_LINE],
    pub mem_load_fault: bool,
    pub mpu_flags: MpuFlags,
    pub flush: FlushRequest,
}

/// Outputs driven back to the fetch stage and the cache top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ICacheOutputs {
    pub req_ready: bool,
    pub resp_valid: bool,
    pub resp_addr: u64,
    pub resp_data: u64,
    pub resp_load_fault: bool,
    pub resp_executable: bool,
    pub req_mem_valid: bool,
    pub req_mem_type: MemReqType,
    pub req_mem_size: u8,
    pub req_mem_addr: u64,
    pub mpu_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    Idle,
    CheckHit,
    TranslateAddress,
    WaitGrant,
    WaitResp,
    CheckResp,
    SetupReadAdr,
    FlushAddr,
    FlushCheck,
    #[default]
    Reset,
    ResetWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Regs {
    state: State,
    req_addr: u64,
    req_addr_next: u64,
    write_addr: u64,
    mem_addr: u64,
    req_mem_valid: bool,
    req_mem_type: MemReqType,
    req_mem_size: u8,
    load_fault: bool,
    executable: bool,
    cache_line_i: Line,
    req_flush: bool,
    req_flush_all: bool,
    req_flush_addr: u64,
    req_flush_cnt: u32,
    flush_cnt: u32,
}

/// Staged tag-memory write for the coming edge.
#[derive(Debug, Clone, Copy)]
enum LineOp {
    None,
    Write { addr: u64, data: Line, flags: LineFlags, direct_way: Option<usize> },
    Invalidate { addr: u64, direct_way: Option<usize> },
}

/// The instruction cache module.
#[derive(Debug)]
pub struct ICacheLru {
    r: Regs,
    v: Regs,
    mem: TagMemCoupled,
    line_op: LineOp,
    touch_addr: Option<u64>,
    ways: usize,
    log2_lines: u32,
}

impl ICacheLru {
    pub fn new(log2_lines: u32, ways: usize) -> Self {
        let reset = Self::reset_regs(log2_lines, ways);
        Self {
            r: reset.clone(),
            v: reset,
            mem: TagMemCoupled::new(log2_lines),
            line_op: LineOp::None,
            touch_addr: None,
            ways,
            log2_lines,
        }
    }

    fn reset_regs(log2_lines: u32, ways: usize) -> Regs {
        Regs {
            state: State::Reset,
            req_addr: 0,
            req_addr_next: 0,
            write_addr: 0,
            mem_addr: 0,
            req_mem_valid: false,
            req_mem_type: MemReqType::default(),
            req_mem_size: 0,
            load_fault: false,
            executable: false,
            cache_line_i: [0; LINE_BYTES],
            req_flush: false,
            req_flush_all: false,
            req_flush_addr: 0,
            req_flush_cnt: 0,
            flush_cnt: ((1u32 << log2_lines) * ways as u32) - 1,
        }
    }

    fn sweep_count(&self) -> u32 {
        (1u32 << self.log2_lines) * self.ways as u32 - 1
    }

    /// Next direct-access sweep address: way bits first, then line index.
    fn addr_direct_next(&self, addr: u64) -> u64 {
        let way_mask = self.ways as u64 - 1;
        if addr & way_mask == way_mask {
            (addr + LINE_BYTES as u64) & !bits::mask(LOG2_LINE_BYTES)
        } else {
            addr + 1
        }
    }

    fn uncached_window(line: &Line, addr: u64) -> u64 {
        let off = (addr & 0xC) as usize;
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            if off + i < LINE_BYTES {
                *b = line[off + i];
            }
        }
        u64::from_le_bytes(bytes)
    }

    /// Combinational process: recompute the next register bank and the
    /// module outputs from the current bank and the inputs.
    pub fn comb(&mut self, inp: &ICacheInputs) -> ICacheOutputs {
        let r = self.r.clone();
        let mut v = r.clone();
        let lookup = self.mem.lookup();

        let mut out = ICacheOutputs::default();
        let mut ready_next = false;
        let mut line_addr = r.req_addr;
        self.line_op = LineOp::None;
        self.touch_addr = None;

        // Flush request from the CSR flushi path or the debug interface.
        if inp.flush.valid {
            v.req_flush = true;
            v.req_flush_all = bits::bit(inp.flush.address, 0);
            if bits::bit(inp.flush.address, 0) {
                v.req_flush_cnt = self.sweep_count();
                v.req_flush_addr = 0;
            } else if bits::and_reduce(inp.flush.address >> 1, LOG2_LINE_BYTES - 1) {
                // Address at the very top of a line: the flushed fetch may
                // straddle, take the next line too.
                v.req_flush_cnt = 1;
                v.req_flush_addr = inp.flush.address;
            } else {
                v.req_flush_cnt = 0;
                v.req_flush_addr = inp.flush.address;
            }
        }

        match r.state {
            State::Idle => {
                v.executable = true;
                ready_next = true;
            }
            State::CheckHit => {
                out.resp_data = lookup.rdata64;
                if lookup.hit && lookup.hit_next {
                    out.resp_valid = true;
                    self.touch_addr = Some(r.req_addr);
                    if inp.resp_ready {
                        ready_next = true;
                        v.state = State::Idle;
                    }
                } else {
                    v.state = State::TranslateAddress;
                }
            }
            State::TranslateAddress => {
                if !inp.mpu_flags.contains(MpuFlags::EXEC) {
                    v.cache_line_i = [0xFF; LINE_BYTES];
                    v.load_fault = true;
                    v.state = State::CheckResp;
                } else {
                    v.req_mem_valid = true;
                    v.state = State::WaitGrant;
                    v.write_addr = r.req_addr;
                    v.load_fault = false;

                    if inp.mpu_flags.contains(MpuFlags::CACHEABLE) {
                        if !lookup.hit {
                            v.mem_addr = bits::align_down(r.req_addr, LOG2_LINE_BYTES);
                        } else {
                            // Own line resident, the straddled next line missed.
                            v.write_addr = r.req_addr_next;
                            v.mem_addr = bits::align_down(r.req_addr_next, LOG2_LINE_BYTES);
                        }
                        v.req_mem_type = MemReqType::read_shared();
                        v.req_mem_size = LOG2_LINE_BYTES as u8;
                    } else {
                        v.mem_addr = bits::align_down(r.req_addr, 4);
                        v.req_mem_type = MemReqType::read_no_snoop();
                        v.req_mem_size = 4; // uncached, 16 B
                    }
                }
                v.executable = inp.mpu_flags.contains(MpuFlags::EXEC);
            }
            State::WaitGrant => {
                if inp.req_mem_ready {
                    v.state = State::WaitResp;
                    v.req_mem_valid = false;
                }
            }
            State::WaitResp => {
                if inp.mem_data_valid {
                    let mut line = [0u8; LINE_BYTES];
                    for (i, beat) in inp.mem_data.iter().enumerate() {
                        line[8 * i..8 * (i + 1)].copy_from_slice(&beat.to_le_bytes());
                    }
                    v.cache_line_i = line;
                    v.state = State::CheckResp;
                    // Swap addresses for one tick to write the line.
                    v.write_addr = r.req_addr;
                    v.req_addr = r.write_addr;
                    if inp.mem_load_fault {
                        v.load_fault = true;
                    }
                }
            }
            State::CheckResp => {
                v.req_addr = r.write_addr; // restore after the line write
                if !r.req_mem_type.cached || r.load_fault {
                    out.resp_valid = true;
                    out.resp_data = Self::uncached_window(&r.cache_line_i, r.req_addr);
                    out.resp_load_fault = r.load_fault;
                    if inp.resp_ready {
                        v.state = State::Idle;
                    }
                } else {
                    v.state = State::SetupReadAdr;
                    self.line_op = LineOp::Write {
                        addr: r.req_addr,
                        data: r.cache_line_i,
                        flags: LineFlags::VALID,
                        direct_way: None,
                    };
                    trace!("icache: refill line 0x{:x}", bits::align_down(r.req_addr, LOG2_LINE_BYTES));
                }
            }
            State::SetupReadAdr => {
                v.state = State::CheckHit;
            }
            State::FlushAddr => {
                v.state = State::FlushCheck;
                let direct_way = if r.req_flush_all {
                    Some((r.req_addr & (self.ways as u64 - 1)) as usize)
                } else {
                    None
                };
                self.line_op = LineOp::Invalidate { addr: r.req_addr, direct_way };
                v.cache_line_i = [0; LINE_BYTES];
            }
            State::FlushCheck => {
                v.state = State::FlushAddr;
                if r.flush_cnt != 0 {
                    v.flush_cnt = r.flush_cnt - 1;
                    if r.req_flush_all {
                        v.req_addr = self.addr_direct_next(r.req_addr);
                    } else {
                        v.req_addr = r.req_addr + LINE_BYTES as u64;
                    }
                } else {
                    v.state = State::Idle;
                }
            }
            State::Reset => {
                self.line_op = LineOp::Invalidate {
                    addr: r.req_addr,
                    direct_way: Some((r.req_addr & (self.ways as u64 - 1)) as usize),
                };
                v.state = State::ResetWrite;
            }
            State::ResetWrite => {
                v.state = State::Reset;
                if r.flush_cnt != 0 {
                    v.flush_cnt = r.flush_cnt - 1;
                    v.req_addr = self.addr_direct_next(r.req_addr);
                } else {
                    v.state = State::Idle;
                }
            }
        }

        if ready_next {
            if r.req_flush {
                v.state = State::FlushAddr;
                v.req_flush = false;
                v.cache_line_i = [0; LINE_BYTES];
                v.req_addr = bits::align_down(r.req_flush_addr, LOG2_LINE_BYTES);
                v.flush_cnt = r.req_flush_cnt;
            } else {
                out.req_ready = true;
                if inp.req_valid {
                    line_addr = inp.req_addr;
                    v.req_addr = inp.req_addr;
                    v.req_addr_next = inp.req_addr + LINE_BYTES as u64;
                    v.state = State::CheckHit;
                }
            }
        }

        // Present the lookup address for the next tick.
        self.mem.read(line_addr);

        out.req_mem_valid = r.req_mem_valid;
        out.req_mem_addr = r.mem_addr;
        out.req_mem_type = r.req_mem_type;
        out.req_mem_size = r.req_mem_size;
        out.resp_addr = r.req_addr;
        out.resp_executable = r.executable;
        out.mpu_addr = r.req_addr;

        self.v = v;
        out
    }

    /// Clock edge: publish `v` and apply the staged tag-memory operation.
    pub fn commit(&mut self, nrst: bool) {
        if !nrst {
            self.r = Self::reset_regs(self.log2_lines, self.ways);
            self.v = self.r.clone();
            self.line_op = LineOp::None;
            self.touch_addr = None;
            return;
        }
        match self.line_op {
            LineOp::Write { addr, data, flags, direct_way } => {
                self.mem.write(addr, data, u32::MAX, flags, direct_way);
            }
            LineOp::Invalidate { addr, direct_way } => {
                self.mem.invalidate(addr, direct_way);
            }
            LineOp::None => {}
        }
        if let Some(addr) = self.touch_addr.take() {
            self.mem.touch_hit(addr);
        }
        self.line_op = LineOp::None;
        self.mem.commit();
        self.r = self.v.clone();
    }

    /// True once the post-reset invalidation sweep has finished.
    pub fn ready_after_reset(&self) -> bool {
        !matches!(self.r.state, State::Reset | State::ResetWrite)
    }

    /// Registered address presented to the MPU.
    pub fn mpu_addr(&self) -> u64 {
        self.r.req_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG2_LINES: u32 = 4; // 16 lines per way keeps reset sweeps short

    fn drained(ic: &mut ICacheLru) {
        // Run the reset sweep to completion.
        for _ in 0..(2 * 16 * 4 + 4) {
            ic.comb(&ICacheInputs::default());
            ic.commit(true);
        }
        assert!(ic.ready_after_reset());
    }

    fn exec_flags() -> MpuFlags {
        MpuFlags::ENA | MpuFlags::CACHEABLE | MpuFlags::READ | MpuFlags::EXEC
    }

    /// Drive the cache with a memory stub until a response appears.
    fn fetch(ic: &mut ICacheLru, addr: u64, mpu: MpuFlags, mem_word: u64) -> ICacheOutputs {
        let mut inp = ICacheInputs {
            req_valid: true,
            req_addr: addr,
            resp_ready: true,
            req_mem_ready: true,
            mpu_flags: mpu,
            ..Default::default()
        };
        for _ in 0..64 {
            let out = ic.comb(&inp);
            // Model a single-tick memory: grant, then next tick data.
            let mem_req = out.req_mem_valid;
            ic.commit(true);
            if out.resp_valid {
                return out;
            }
            inp.req_valid = false;
            if mem_req {
                inp.mem_data_valid = true;
                inp.mem_data = [mem_word; BEATS_PER_LINE];
            } else {
                inp.mem_data_valid = false;
            }
        }
        panic!("no response for fetch at 0x{addr:x}");
    }

    #[test]
    fn test_reset_sweep_reaches_idle() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        assert!(!ic.ready_after_reset());
        drained(&mut ic);
    }

    #[test]
    fn test_miss_then_hit() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        drained(&mut ic);

        let first = fetch(&mut ic, 0x1000, exec_flags(), 0x1111_2222_3333_4444);
        assert_eq!(first.resp_data, 0x1111_2222_3333_4444);
        assert!(!first.resp_load_fault);
        assert!(first.resp_executable);

        // Second fetch of the same line must hit without a memory request.
        let mut inp = ICacheInputs {
            req_valid: true,
            req_addr: 0x1008,
            resp_ready: true,
            req_mem_ready: true,
            mpu_flags: exec_flags(),
            ..Default::default()
        };
        let mut saw_mem_req = false;
        for _ in 0..8 {
            let out = ic.comb(&inp);
            saw_mem_req |= out.req_mem_valid;
            ic.commit(true);
            inp.req_valid = false;
            if out.resp_valid {
                assert_eq!(out.resp_data, 0x1111_2222_3333_4444);
                assert!(!saw_mem_req, "hit must not issue a memory request");
                return;
            }
        }
        panic!("no hit response");
    }

    #[test]
    fn test_miss_issues_line_read_shared() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        drained(&mut ic);

        let mut inp = ICacheInputs {
            req_valid: true,
            req_addr: 0x2008,
            resp_ready: true,
            req_mem_ready: false,
            mpu_flags: exec_flags(),
            ..Default::default()
        };
        for _ in 0..8 {
            let out = ic.comb(&inp);
            ic.commit(true);
            inp.req_valid = false;
            if out.req_mem_valid {
                assert_eq!(out.req_mem_addr, 0x2000, "burst aligned to line base");
                assert_eq!(out.req_mem_size, LOG2_LINE_BYTES as u8);
                assert_eq!(out.req_mem_type, MemReqType::read_shared());
                return;
            }
        }
        panic!("no memory request");
    }

    #[test]
    fn test_non_executable_faults_without_refill() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        drained(&mut ic);

        let flags = MpuFlags::ENA | MpuFlags::READ | MpuFlags::WRITE; // no EXEC
        let out = fetch(&mut ic, 0x3000, flags, 0);
        assert!(out.resp_load_fault);
        assert!(!out.resp_executable);
        assert_eq!(out.resp_data, u64::MAX, "all-ones synthesized line");
    }

    #[test]
    fn test_uncached_fetch() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        drained(&mut ic);

        let flags = MpuFlags::ENA | MpuFlags::READ | MpuFlags::EXEC; // not cacheable
        let mut inp = ICacheInputs {
            req_valid: true,
            req_addr: 0x4000,
            resp_ready: true,
            req_mem_ready: true,
            mpu_flags: flags,
            ..Default::default()
        };
        for _ in 0..16 {
            let out = ic.comb(&inp);
            let mem_req = out.req_mem_valid;
            if mem_req {
                assert_eq!(out.req_mem_size, 4, "uncached fetch reads 16 B");
                assert_eq!(out.req_mem_type, MemReqType::read_no_snoop());
            }
            ic.commit(true);
            inp.req_valid = false;
            if mem_req {
                inp.mem_data_valid = true;
                inp.mem_data = [0xAABB_CCDD_EEFF_0011; BEATS_PER_LINE];
            } else {
                inp.mem_data_valid = false;
            }
            if out.resp_valid {
                assert_eq!(out.resp_data, 0xAABB_CCDD_EEFF_0011);
                return;
            }
        }
        panic!("no uncached response");
    }

    #[test]
    fn test_flush_all_invalidate() {
        let mut ic = ICacheLru::new(LOG2_LINES, 4);
        drained(&mut ic);

        fetch(&mut ic, 0x1000, exec_flags(), 0x55);

        // Flush everything (address bit 0 set), then the same fetch must miss.
        let mut inp = ICacheInputs {
            flush: FlushRequest { valid: true, address: 1 },
            resp_ready: true,
            req_mem_ready: true,
            ..Default::default()
        };
        for _ in 0..(2 * 16 * 4 + 8) {
            ic.comb(&inp);
            ic.commit(true);
            inp.flush.valid = false;
        }

        let mut inp = ICacheInputs {
            req_valid: true,
            req_addr: 0x1000,
            resp_ready: true,
            req_mem_ready: false,
            mpu_flags: exec_flags(),
            ..Default::default()
        };
        let mut missed = false;
        for _ in 0..8 {
            let out = ic.comb(&inp);
            ic.commit(true);
            inp.req_valid = false;
            if out.req_mem_valid {
                missed = true;
                break;
            }
        }
        assert!(missed, "flush-all must invalidate the line");
    }
}
