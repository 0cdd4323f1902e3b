//! L1 data cache with LRU replacement.
//!
//! Write-back cache sharing the instruction cache's skeleton, with the
//! data-side extras: byte-strobe stores, store-fault propagation, an LR/SC
//! reservation, and a coherence snoop port. A store hitting a Shared line
//! first gains exclusivity with WriteLineUnique; a Modified victim is
//! written back before its way is refilled. A modified line never carries
//! the shared flag.

use crate::bits;
use crate::bus::MemReqType;
use crate::cache::mpu::MpuFlags;
use crate::cache::tagmem::{AddrMap, TagMem};
use crate::cache::{FlushRequest, Line, LineFlags};
use crate::config::{BEATS_PER_LINE, LINE_BYTES, LOG2_LINE_BYTES};

use log::trace;

/// Data-side request classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataReqType {
    #[default]
    Read,
    Write,
    /// Load-reserved: read plus reservation.
    LoadReserved,
    /// Store-conditional: write only if the reservation still holds.
    StoreConditional,
}

/// Snoop probe classes accepted on the coherence port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopType {
    /// Another cache reads the line shared: provide data, downgrade to
    /// Shared.
    ReadShared,
    /// Another cache gains exclusive ownership: provide data, invalidate.
    ReadUnique,
    /// Invalidate without data.
    MakeInvalid,
}

impl From<crate::axi::AcSnoop> for SnoopType {
    fn from(ac: crate::axi::AcSnoop) -> Self {
        match ac {
            crate::axi::AcSnoop::ReadUnique => SnoopType::ReadUnique,
            crate::axi::AcSnoop::MakeInvalid => SnoopType::MakeInvalid,
        }
    }
}

/// Snoop request wires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoopIn {
    pub valid: bool,
    pub ty: SnoopType,
    pub addr: u64,
}

impl Default for SnoopIn {
    fn default() -> Self {
        Self { valid: false, ty: SnoopType::MakeInvalid, addr: 0 }
    }
}

/// Inputs sampled by the combinational process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DCacheInputs {
    pub req_valid: bool,
    pub req_type: DataReqType,
    pub req_addr: u64,
    /// Write data positioned within its 8-byte lane.
    pub req_wdata: u64,
    /// Byte mask within the 8-byte lane.
    pub req_wstrb: u8,
    /// log2 of the access width in bytes.
    pub req_size: u8,
    pub resp_ready: bool,
    pub req_mem_ready: bool,
    pub mem_data_valid: bool,
    pub mem_data: [u64; BEATS_PER_LINE],
    pub mem_load_fault: bool,
    pub mem_store_fault: bool,
    pub mpu_flags: MpuFlags,
    pub snoop: SnoopIn,
    pub snoop_resp_ready: bool,
    pub flush: FlushRequest,
}

/// Outputs driven to the memaccess stage, the cache top and the snoop port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DCacheOutputs {
    pub req_ready: bool,
    pub resp_valid: bool,
    pub resp_addr: u64,
    pub resp_data: u64,
    pub resp_er_load_fault: bool,
    pub resp_er_store_fault: bool,
    pub resp_er_mpu_load: bool,
    pub resp_er_mpu_store: bool,
    pub resp_fault_addr: u64,
    pub req_mem_valid: bool,
    pub req_mem_type: MemReqType,
    pub req_mem_size: u8,
    pub req_mem_addr: u64,
    pub req_mem_strob: u32,
    pub req_mem_wdata: [u64; BEATS_PER_LINE],
    pub mpu_addr: u64,
    pub snoop_ready: bool,
    pub snoop_resp_valid: bool,
    pub snoop_resp_hit: bool,
    pub snoop_resp_data: [u64; BEATS_PER_LINE],
    pub snoop_resp_flags: LineFlags,
    pub flush_end: bool,
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
    SnoopCheck,
    FlushAddr,
    FlushCheck,
    #[default]
    Reset,
    ResetWrite,
}

/// What the in-flight memory transaction is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MemOp {
    #[default]
    Refill,
    Upgrade,
    Uncached,
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Regs {
    state: State,
    req_type: DataReqType,
    req_addr: u64,
    req_wdata: u64,
    req_wstrb: u8,
    req_size: u8,
    mem_addr: u64,
    req_mem_valid: bool,
    req_mem_type: MemReqType,
    req_mem_size: u8,
    mem_wstrb: u32,
    mem_wdata: [u64; BEATS_PER_LINE],
    mem_op: MemOp,
    /// State to resume after an eviction completes.
    evict_return: State,
    load_fault: bool,
    store_fault: bool,
    mpu_er_load: bool,
    mpu_er_store: bool,
    fault_addr: u64,
    cache_line_i: Line,
    res_valid: bool,
    res_addr: u64,
    sc_fail: bool,
    snoop_ty: SnoopType,
    snoop_addr: u64,
    snoop_resp_valid: bool,
    snoop_resp_hit: bool,
    snoop_resp_data: [u64; BEATS_PER_LINE],
    snoop_resp_flags: LineFlags,
    req_flush: bool,
    req_flush_all: bool,
    req_flush_addr: u64,
    req_flush_cnt: u32,
    flush_cnt: u32,
    flush_end: bool,
}

#[derive(Debug, Clone, Copy)]
enum LineOp {
    None,
    Write { set: usize, tag: u64, data: Line, wstrb: u32, flags: LineFlags, way: Option<usize> },
    Invalidate { set: usize, tag: u64, way: Option<usize> },
    SetFlags { set: usize, way: usize, flags: LineFlags },
}

/// The data cache module.
#[derive(Debug)]
pub struct DCacheLru {
    r: Regs,
    v: Regs,
    mem: TagMem,
    map: AddrMap,
    line_op: LineOp,
    touch: Option<(usize, usize)>,
    ways: usize,
    log2_lines: u32,
    coherence_ena: bool,
}

impl DCacheLru {
    pub fn new(log2_lines: u32, ways: usize, coherence_ena: bool) -> Self {
        let reset = Self::reset_regs(log2_lines, ways);
        Self {
            r: reset.clone(),
            v: reset,
            mem: TagMem::new(1 << log2_lines),
            map: AddrMap { log2_lines },
            line_op: LineOp::None,
            touch: None,
            ways,
            log2_lines,
            coherence_ena,
        }
    }

    fn reset_regs(log2_lines: u32, ways: usize) -> Regs {
        Regs {
            state: State::Reset,
            req_type: DataReqType::Read,
            req_addr: 0,
            req_wdata: 0,
            req_wstrb: 0,
            req_size: 0,
            mem_addr: 0,
            req_mem_valid: false,
            req_mem_type: MemReqType::default(),
            req_mem_size: 0,
            mem_wstrb: 0,
            mem_wdata: [0; BEATS_PER_LINE],
            mem_op: MemOp::Refill,
            evict_return: State::TranslateAddress,
            load_fault: false,
            store_fault: false,
            mpu_er_load: false,
            mpu_er_store: false,
            fault_addr: 0,
            cache_line_i: [0; LINE_BYTES],
            res_valid: false,
            res_addr: 0,
            sc_fail: false,
            snoop_ty: SnoopType::MakeInvalid,
            snoop_addr: 0,
            snoop_resp_valid: false,
            snoop_resp_hit: false,
            snoop_resp_data: [0; BEATS_PER_LINE],
            snoop_resp_flags: LineFlags::empty(),
            req_flush: false,
            req_flush_all: false,
            req_flush_addr: 0,
            req_flush_cnt: 0,
            flush_cnt: ((1u32 << log2_lines) * ways as u32) - 1,
            flush_end: false,
        }
    }

    fn sweep_count(&self) -> u32 {
        (1u32 << self.log2_lines) * self.ways as u32 - 1
    }

    fn addr_direct_next(&self, addr: u64) -> u64 {
        let way_mask = self.ways as u64 - 1;
        if addr & way_mask == way_mask {
            (addr + LINE_BYTES as u64) & !bits::mask(LOG2_LINE_BYTES)
        } else {
            addr + 1
        }
    }

    fn lane(addr: u64) -> usize {
        bits::bits(addr, LOG2_LINE_BYTES - 1, 3) as usize
    }

    /// 8 bytes of `line` at the lane containing `addr`.
    fn word_of(line: &Line, addr: u64) -> u64 {
        let off = Self::lane(addr) * 8;
        u64::from_le_bytes(line[off..off + 8].try_into().unwrap_or([0; 8]))
    }

    fn line_beats(line: &Line) -> [u64; BEATS_PER_LINE] {
        let mut beats = [0u64; BEATS_PER_LINE];
        for (i, b) in beats.iter_mut().enumerate() {
            *b = u64::from_le_bytes(line[8 * i..8 * (i + 1)].try_into().unwrap_or([0; 8]));
        }
        beats
    }

    fn beats_line(beats: &[u64; BEATS_PER_LINE]) -> Line {
        let mut line = [0u8; LINE_BYTES];
        for (i, b) in beats.iter().enumerate() {
            line[8 * i..8 * (i + 1)].copy_from_slice(&b.to_le_bytes());
        }
        line
    }

    /// Merge the latched store bytes into `line`.
    fn merge_store(&self, line: &mut Line, r: &Regs) {
        let base = Self::lane(r.req_addr) * 8;
        for i in 0..8 {
            if r.req_wstrb & (1 << i) != 0 {
                line[base + i] = (r.req_wdata >> (8 * i)) as u8;
            }
        }
    }

    fn is_store(ty: DataReqType) -> bool {
        matches!(ty, DataReqType::Write | DataReqType::StoreConditional)
    }

    /// Combinational process.
    pub fn comb(&mut self, inp: &DCacheInputs) -> DCacheOutputs {
        let r = self.r.clone();
        let mut v = r.clone();
        let lookup = self.mem.lookup();

        let mut out = DCacheOutputs::default();
        let mut ready_next = false;
        let mut line_addr = r.req_addr;
        self.line_op = LineOp::None;
        self.touch = None;

        v.flush_end = false;
        v.snoop_resp_valid = r.snoop_resp_valid && !inp.snoop_resp_ready;

        if inp.flush.valid {
            v.req_flush = true;
            v.req_flush_all = bits::bit(inp.flush.address, 0);
            if bits::bit(inp.flush.address, 0) {
                v.req_flush_cnt = self.sweep_count();
                v.req_flush_addr = 0;
            } else {
                v.req_flush_cnt = 0;
                v.req_flush_addr = inp.flush.address;
            }
        }

        match r.state {
            State::Idle => {
                ready_next = true;
            }
            State::CheckHit => {
                if lookup.hit {
                    match r.req_type {
                        DataReqType::Read | DataReqType::LoadReserved => {
                            out.resp_valid = true;
                            out.resp_data = Self::word_of(&lookup.data, r.req_addr);
                            self.touch = Some((lookup.set, lookup.way));
                            if r.req_type == DataReqType::LoadReserved {
                                v.res_valid = true;
                                v.res_addr = self.map.line_base(r.req_addr);
                            }
                            if inp.resp_ready {
                                ready_next = true;
                                v.state = State::Idle;
                            }
                        }
                        DataReqType::Write | DataReqType::StoreConditional => {
                            let sc = r.req_type == DataReqType::StoreConditional;
                            let sc_ok = !sc
                                || (r.res_valid && r.res_addr == self.map.line_base(r.req_addr));
                            if sc && !sc_ok {
                                out.resp_valid = true;
                                out.resp_data = 1; // SC failure
                                v.res_valid = false;
                                if inp.resp_ready {
                                    ready_next = true;
                                    v.state = State::Idle;
                                }
                            } else if self.coherence_ena && lookup.flags.contains(LineFlags::SHARED)
                            {
                                // Gain exclusivity before modifying.
                                v.state = State::TranslateAddress;
                            } else {
                                let mut line = lookup.data;
                                self.merge_store(&mut line, &r);
                                self.line_op = LineOp::Write {
                                    set: lookup.set,
                                    tag: lookup.tag,
                                    data: line,
                                    wstrb: u32::MAX,
                                    flags: LineFlags::VALID | LineFlags::MODIFIED,
                                    way: Some(lookup.way),
                                };
                                out.resp_valid = true;
                                out.resp_data = 0;
                                if sc {
                                    v.res_valid = false;
                                }
                                if inp.resp_ready {
                                    ready_next = true;
                                    v.state = State::Idle;
                                }
                            }
                        }
                    }
                } else {
                    v.state = State::TranslateAddress;
                }
            }
            State::TranslateAddress => {
                let store = Self::is_store(r.req_type);
                v.load_fault = false;
                v.store_fault = false;
                v.mpu_er_load = false;
                v.mpu_er_store = false;
                if store && !inp.mpu_flags.contains(MpuFlags::WRITE) {
                    v.mpu_er_store = true;
                    v.fault_addr = r.req_addr;
                    v.cache_line_i = [0xFF; LINE_BYTES];
                    v.mem_op = MemOp::Uncached;
                    v.state = State::CheckResp;
                } else if !store && !inp.mpu_flags.contains(MpuFlags::READ) {
                    v.mpu_er_load = true;
                    v.fault_addr = r.req_addr;
                    v.cache_line_i = [0xFF; LINE_BYTES];
                    v.mem_op = MemOp::Uncached;
                    v.state = State::CheckResp;
                } else if !inp.mpu_flags.contains(MpuFlags::CACHEABLE) {
                    v.req_mem_valid = true;
                    v.mem_op = MemOp::Uncached;
                    v.mem_addr = bits::align_down(r.req_addr, 3);
                    v.req_mem_size = 3;
                    v.state = State::WaitGrant;
                    if store {
                        v.req_mem_type = MemReqType::write_no_snoop();
                        let lane = Self::lane(r.req_addr) % BEATS_PER_LINE;
                        let mut wdata = [0u64; BEATS_PER_LINE];
                        wdata[lane] = r.req_wdata;
                        v.mem_wdata = wdata;
                        v.mem_wstrb = (r.req_wstrb as u32) << (8 * lane);
                    } else {
                        v.req_mem_type = MemReqType::read_no_snoop();
                        v.mem_wstrb = 0;
                        v.mem_wdata = [0; BEATS_PER_LINE];
                    }
                } else if lookup.flags.contains(LineFlags::VALID)
                    && lookup.flags.contains(LineFlags::MODIFIED)
                    && !lookup.hit
                {
                    // Dirty victim: write it back, then come back here.
                    let victim_base = (lookup.stored_tag
                        << (self.log2_lines + LOG2_LINE_BYTES))
                        | ((lookup.set as u64) << LOG2_LINE_BYTES);
                    v.req_mem_valid = true;
                    v.mem_op = MemOp::Evict;
                    v.evict_return = State::TranslateAddress;
                    v.mem_addr = victim_base;
                    v.req_mem_size = LOG2_LINE_BYTES as u8;
                    v.req_mem_type = MemReqType::write_back();
                    v.mem_wstrb = u32::MAX;
                    v.mem_wdata = Self::line_beats(&lookup.data);
                    v.state = State::WaitGrant;
                    self.line_op = LineOp::Invalidate {
                        set: lookup.set,
                        tag: lookup.stored_tag,
                        way: Some(lookup.way),
                    };
                    trace!("dcache: evict dirty line 0x{victim_base:x}");
                } else if lookup.hit && lookup.flags.contains(LineFlags::SHARED) && store {
                    // Shared-to-unique upgrade: push the whole merged line.
                    let mut line = lookup.data;
                    self.merge_store(&mut line, &r);
                    v.req_mem_valid = true;
                    v.mem_op = MemOp::Upgrade;
                    v.mem_addr = self.map.line_base(r.req_addr);
                    v.req_mem_size = LOG2_LINE_BYTES as u8;
                    v.req_mem_type = MemReqType::write_line_unique();
                    v.mem_wstrb = u32::MAX;
                    v.mem_wdata = Self::line_beats(&line);
                    v.state = State::WaitGrant;
                } else {
                    v.req_mem_valid = true;
                    v.mem_op = MemOp::Refill;
                    v.mem_addr = self.map.line_base(r.req_addr);
                    v.req_mem_size = LOG2_LINE_BYTES as u8;
                    v.req_mem_type = if store {
                        MemReqType::read_make_unique()
                    } else {
                        MemReqType::read_shared()
                    };
                    v.mem_wstrb = 0;
                    v.mem_wdata = [0; BEATS_PER_LINE];
                    v.state = State::WaitGrant;
                }
            }
            State::WaitGrant => {
                if inp.req_mem_ready {
                    v.state = State::WaitResp;
                    v.req_mem_valid = false;
                }
            }
            State::WaitResp => {
                if inp.mem_data_valid {
                    if inp.mem_load_fault {
                        v.load_fault = true;
                        v.fault_addr = r.mem_addr;
                    }
                    if inp.mem_store_fault {
                        v.store_fault = true;
                        v.fault_addr = r.mem_addr;
                    }
                    match r.mem_op {
                        MemOp::Evict => {
                            v.state = r.evict_return;
                        }
                        _ => {
                            v.cache_line_i = Self::beats_line(&inp.mem_data);
                            v.state = State::CheckResp;
                        }
                    }
                }
            }
            State::CheckResp => {
                let store = Self::is_store(r.req_type);
                let fault = r.load_fault
                    || r.store_fault
                    || r.mpu_er_load
                    || r.mpu_er_store;
                match r.mem_op {
                    MemOp::Uncached => {
                        out.resp_valid = true;
                        // The uncached buffer starts at the aligned request
                        // address, so the word of interest is beat 0.
                        out.resp_data = if store {
                            0
                        } else {
                            u64::from_le_bytes(r.cache_line_i[0..8].try_into().unwrap_or([0; 8]))
                        };
                        if r.req_type == DataReqType::StoreConditional {
                            out.resp_data = if fault { 1 } else { 0 };
                            v.res_valid = false;
                        }
                        if inp.resp_ready {
                            v.state = State::Idle;
                        }
                    }
                    MemOp::Upgrade => {
                        // Exclusivity gained; commit the merged line locally.
                        self.line_op = LineOp::Write {
                            set: self.map.set(r.req_addr),
                            tag: self.map.tag(r.req_addr),
                            data: Self::beats_line(&r.mem_wdata),
                            wstrb: u32::MAX,
                            flags: LineFlags::VALID | LineFlags::MODIFIED,
                            way: None,
                        };
                        out.resp_valid = true;
                        out.resp_data = 0;
                        if r.req_type == DataReqType::StoreConditional {
                            v.res_valid = false;
                        }
                        if inp.resp_ready {
                            v.state = State::Idle;
                        }
                    }
                    MemOp::Refill | MemOp::Evict => {
                        if fault {
                            out.resp_valid = true;
                            out.resp_data = u64::MAX;
                            if inp.resp_ready {
                                v.state = State::Idle;
                            }
                        } else if store {
                            let mut line = r.cache_line_i;
                            self.merge_store(&mut line, &r);
                            self.line_op = LineOp::Write {
                                set: self.map.set(r.req_addr),
                                tag: self.map.tag(r.req_addr),
                                data: line,
                                wstrb: u32::MAX,
                                flags: LineFlags::VALID | LineFlags::MODIFIED,
                                way: None,
                            };
                            out.resp_valid = true;
                            out.resp_data = 0;
                            if r.req_type == DataReqType::StoreConditional {
                                v.res_valid = false;
                            }
                            if inp.resp_ready {
                                v.state = State::Idle;
                            }
                        } else {
                            // Load refill: ReadShared data arrives shared.
                            let flags = if r.req_mem_type.unique {
                                LineFlags::VALID
                            } else {
                                LineFlags::VALID | LineFlags::SHARED
                            };
                            self.line_op = LineOp::Write {
                                set: self.map.set(r.req_addr),
                                tag: self.map.tag(r.req_addr),
                                data: r.cache_line_i,
                                wstrb: u32::MAX,
                                flags,
                                way: None,
                            };
                            v.state = State::SetupReadAdr;
                        }
                    }
                }
            }
            State::SetupReadAdr => {
                v.state = State::CheckHit;
            }
            State::SnoopCheck => {
                let set = self.map.set(r.snoop_addr);
                let tag = self.map.tag(r.snoop_addr);
                v.snoop_resp_valid = true;
                match self.mem.probe(set, tag) {
                    Some((way, data, flags)) => {
                        v.snoop_resp_hit = true;
                        v.snoop_resp_data = Self::line_beats(&data);
                        v.snoop_resp_flags = flags;
                        match r.snoop_ty {
                            SnoopType::ReadShared => {
                                self.line_op = LineOp::SetFlags {
                                    set,
                                    way,
                                    flags: LineFlags::VALID | LineFlags::SHARED,
                                };
                            }
                            SnoopType::ReadUnique | SnoopType::MakeInvalid => {
                                self.line_op = LineOp::Invalidate { set, tag, way: Some(way) };
                            }
                        }
                        if r.res_valid && r.res_addr == self.map.line_base(r.snoop_addr) {
                            v.res_valid = false;
                        }
                    }
                    None => {
                        v.snoop_resp_hit = false;
                        v.snoop_resp_data = [0; BEATS_PER_LINE];
                        v.snoop_resp_flags = LineFlags::empty();
                    }
                }
                v.state = State::Idle;
            }
            State::FlushAddr => {
                v.state = State::FlushCheck;
                let set = self.map.set(r.req_addr);
                let tag = self.map.tag(r.req_addr);
                let probed = if r.req_flush_all {
                    let way = (r.req_addr & (self.ways as u64 - 1)) as usize;
                    self.mem.probe_way(set, way)
                } else {
                    self.mem.probe(set, tag)
                };
                if let Some((way, data, flags)) = probed {
                    if flags.contains(LineFlags::VALID) && flags.contains(LineFlags::MODIFIED) {
                        // Push the dirty line out before invalidating it.
                        let base = if r.req_flush_all {
                            let stored = self.mem.stored_tag(set, way);
                            (stored << (self.log2_lines + LOG2_LINE_BYTES))
                                | ((set as u64) << LOG2_LINE_BYTES)
                        } else {
                            self.map.line_base(r.req_addr)
                        };
                        v.req_mem_valid = true;
                        v.mem_op = MemOp::Evict;
                        v.evict_return = State::FlushCheck;
                        v.mem_addr = base;
                        v.req_mem_size = LOG2_LINE_BYTES as u8;
                        v.req_mem_type = MemReqType::write_back();
                        v.mem_wstrb = u32::MAX;
                        v.mem_wdata = Self::line_beats(&data);
                        v.state = State::WaitGrant;
                    }
                    self.line_op = LineOp::Invalidate {
                        set,
                        tag: self.mem.stored_tag(set, way),
                        way: Some(way),
                    };
                }
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
                    v.flush_end = true;
                }
            }
            State::Reset => {
                self.line_op = LineOp::Invalidate {
                    set: self.map.set(r.req_addr),
                    tag: 0,
                    way: Some((r.req_addr & (self.ways as u64 - 1)) as usize),
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
                v.req_addr = bits::align_down(r.req_flush_addr, LOG2_LINE_BYTES);
                v.flush_cnt = r.req_flush_cnt;
            } else {
                out.snoop_ready = true;
                if inp.snoop.valid {
                    v.snoop_ty = inp.snoop.ty;
                    v.snoop_addr = inp.snoop.addr;
                    v.state = State::SnoopCheck;
                } else {
                    out.req_ready = true;
                    if inp.req_valid {
                        line_addr = inp.req_addr;
                        v.req_type = inp.req_type;
                        v.req_addr = inp.req_addr;
                        v.req_wdata = inp.req_wdata;
                        v.req_wstrb = inp.req_wstrb;
                        v.req_size = inp.req_size;
                        v.load_fault = false;
                        v.store_fault = false;
                        v.mpu_er_load = false;
                        v.mpu_er_store = false;
                        v.state = State::CheckHit;
                    }
                }
            }
        }

        self.mem.read(self.map.set(line_addr), self.map.tag(line_addr));

        out.req_mem_valid = r.req_mem_valid;
        out.req_mem_addr = r.mem_addr;
        out.req_mem_type = r.req_mem_type;
        out.req_mem_size = r.req_mem_size;
        out.req_mem_strob = r.mem_wstrb;
        out.req_mem_wdata = r.mem_wdata;
        out.resp_addr = r.req_addr;
        out.resp_er_load_fault = out.resp_valid && r.load_fault;
        out.resp_er_store_fault = out.resp_valid && r.store_fault;
        out.resp_er_mpu_load = out.resp_valid && r.mpu_er_load;
        out.resp_er_mpu_store = out.resp_valid && r.mpu_er_store;
        out.resp_fault_addr = r.fault_addr;
        out.mpu_addr = r.req_addr;
        out.snoop_resp_valid = r.snoop_resp_valid;
        out.snoop_resp_hit = r.snoop_resp_hit;
        out.snoop_resp_data = r.snoop_resp_data;
        out.snoop_resp_flags = r.snoop_resp_flags;
        out.flush_end = r.flush_end;

        self.v = v;
        out
    }

    /// Clock edge.
    pub fn commit(&mut self, nrst: bool) {
        if !nrst {
            self.r = Self::reset_regs(self.log2_lines, self.ways);
            self.v = self.r.clone();
            self.line_op = LineOp::None;
            self.touch = None;
            return;
        }
        match self.line_op {
            LineOp::Write { set, tag, data, wstrb, flags, way } => {
                self.mem.write(set, tag, data, wstrb, flags, way);
            }
            LineOp::Invalidate { set, tag, way } => {
                self.mem.invalidate(set, tag, way);
            }
            LineOp::SetFlags { set, way, flags } => {
                self.mem.set_flags(set, way, flags);
            }
            LineOp::None => {}
        }
        if let Some((set, way)) = self.touch.take() {
            self.mem.touch(set, way);
        }
        self.line_op = LineOp::None;
        self.mem.commit();
        self.r = self.v.clone();
    }

    pub fn ready_after_reset(&self) -> bool {
        !matches!(self.r.state, State::Reset | State::ResetWrite)
    }

    /// Registered address presented to the MPU.
    pub fn mpu_addr(&self) -> u64 {
        self.r.req_addr
    }
}
