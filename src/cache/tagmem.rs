//! Cache tag + data arrays.
//!
//! `TagMem` is one bank: per-way tag and line storage built on the
//! synchronous RAM block, plus the per-set replacement tree. The read port
//! is registered, so a lookup presented this tick answers on the next one.
//!
//! `TagMemCoupled` pairs two banks on the line-index LSB so an instruction
//! fetch can interrogate its own line and the following one in the same
//! lookup; that is what makes fetches that straddle a line boundary hit in
//! a single pass.

use crate::cache::lru::LruTable;
use crate::cache::{Line, LineFlags};
use crate::config::{LINE_BYTES, LOG2_LINE_BYTES};
use crate::mem::SyncRam;

/// One way of one bank: tag cells plus line data cells.
#[derive(Debug, Clone)]
struct WayMem {
    tags: SyncRam<u64>,
    flags: SyncRam<LineFlags>,
    data: SyncRam<Line>,
}

impl WayMem {
    fn new(sets: usize) -> Self {
        Self {
            tags: SyncRam::new(sets),
            flags: SyncRam::new(sets),
            data: SyncRam::new(sets),
        }
    }

    fn commit(&mut self) {
        self.tags.commit();
        self.flags.commit();
        self.data.commit();
    }

    fn reset(&mut self) {
        self.tags.reset();
        self.flags.reset();
        self.data.reset();
    }
}

/// Result of the registered lookup: state of the set addressed last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub hit: bool,
    /// Hit way, or the victim way a refill would use.
    pub way: usize,
    pub data: Line,
    pub flags: LineFlags,
    pub set: usize,
    pub tag: u64,
    /// Tag stored in the returned way (equals `tag` on a hit; on a miss it
    /// names the victim line about to be evicted).
    pub stored_tag: u64,
}

impl Default for Lookup {
    fn default() -> Self {
        Self {
            hit: false,
            way: 0,
            data: [0; LINE_BYTES],
            flags: LineFlags::empty(),
            set: 0,
            tag: 0,
            stored_tag: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingWrite {
    Line { set: usize, tag: u64, data: Line, wstrb: u32, flags: LineFlags, way: Option<usize> },
    Invalidate { set: usize, tag: u64, way: Option<usize> },
}

/// One cache bank: 4 ways of tag/flag/line arrays plus pLRU state.
#[derive(Debug, Clone)]
pub struct TagMem {
    ways: Vec<WayMem>,
    lru: LruTable,
    sets: usize,
    rset: usize,
    rtag: u64,
    pending: Option<PendingWrite>,
}

pub const WAYS: usize = 4;

impl TagMem {
    pub fn new(sets: usize) -> Self {
        Self {
            ways: (0..WAYS).map(|_| WayMem::new(sets)).collect(),
            lru: LruTable::new(sets),
            sets,
            rset: 0,
            rtag: 0,
            pending: None,
        }
    }

    pub fn sets(&self) -> usize {
        self.sets
    }

    /// Present a lookup for the next tick.
    pub fn read(&mut self, set: usize, tag: u64) {
        debug_assert!(set < self.sets);
        for w in &mut self.ways {
            w.tags.set_raddr(set);
            w.flags.set_raddr(set);
            w.data.set_raddr(set);
        }
        self.rset = set;
        self.rtag = tag;
    }

    /// Answer for the lookup registered at the previous edge.
    pub fn lookup(&self) -> Lookup {
        let mut out = Lookup { set: self.rset, tag: self.rtag, ..Default::default() };
        for (i, w) in self.ways.iter().enumerate() {
            if w.flags.rdata().contains(LineFlags::VALID) && *w.tags.rdata() == self.rtag {
                out.hit = true;
                out.way = i;
                out.data = *w.data.rdata();
                out.flags = *w.flags.rdata();
                out.stored_tag = self.rtag;
                return out;
            }
        }
        // Miss: surface the victim way so the caller can write it back.
        let victim = self.refill_way(self.rset, self.rtag);
        out.way = victim;
        out.data = *self.ways[victim].data.cell(self.rset);
        out.flags = *self.ways[victim].flags.cell(self.rset);
        out.stored_tag = *self.ways[victim].tags.cell(self.rset);
        out
    }

    /// Combinational probe of the committed arrays (snoop path): does any
    /// way of `set` hold `tag`?
    pub fn probe(&self, set: usize, tag: u64) -> Option<(usize, Line, LineFlags)> {
        for (i, w) in self.ways.iter().enumerate() {
            let fl = *w.flags.cell(set);
            if fl.contains(LineFlags::VALID) && *w.tags.cell(set) == tag {
                return Some((i, *w.data.cell(set), fl));
            }
        }
        None
    }

    /// Combinational probe of one specific way; `Some` only for valid lines.
    pub fn probe_way(&self, set: usize, way: usize) -> Option<(usize, Line, LineFlags)> {
        let fl = *self.ways[way].flags.cell(set);
        if fl.contains(LineFlags::VALID) {
            Some((way, *self.ways[way].data.cell(set), fl))
        } else {
            None
        }
    }

    /// Tag currently stored in `(set, way)`.
    pub fn stored_tag(&self, set: usize, way: usize) -> u64 {
        *self.ways[way].tags.cell(set)
    }

    /// Way a refill of `(set, tag)` would land in: the way already holding
    /// the tag, else an invalid way, else the pLRU victim.
    fn refill_way(&self, set: usize, tag: u64) -> usize {
        for (i, w) in self.ways.iter().enumerate() {
            if w.flags.cell(set).contains(LineFlags::VALID) && *w.tags.cell(set) == tag {
                return i;
            }
        }
        for (i, w) in self.ways.iter().enumerate() {
            if !w.flags.cell(set).contains(LineFlags::VALID) {
                return i;
            }
        }
        self.lru.victim(set)
    }

    /// Mark a way most-recently-used (hit path).
    pub fn touch(&mut self, set: usize, way: usize) {
        self.lru.touch(set, way);
    }

    /// Stage a line write for the coming edge. `way` of `None` selects the
    /// refill way; flags replace the stored flags for strobed bytes' line.
    pub fn write(
        &mut self,
        set: usize,
        tag: u64,
        data: Line,
        wstrb: u32,
        flags: LineFlags,
        way: Option<usize>,
    ) {
        self.pending = Some(PendingWrite::Line { set, tag, data, wstrb, flags, way });
    }

    /// Stage an invalidate. `way` of `None` clears only a matching line.
    pub fn invalidate(&mut self, set: usize, tag: u64, way: Option<usize>) {
        self.pending = Some(PendingWrite::Invalidate { set, tag, way });
    }

    /// Clock edge.
    pub fn commit(&mut self) {
        match self.pending.take() {
            Some(PendingWrite::Line { set, tag, data, wstrb, flags, way }) => {
                let way = way.unwrap_or_else(|| self.refill_way(set, tag));
                let w = &mut self.ways[way];
                let mut line = *w.data.cell(set);
                for (i, b) in line.iter_mut().enumerate() {
                    if wstrb & (1 << i) != 0 {
                        *b = data[i];
                    }
                }
                w.tags.write(set, tag);
                w.flags.write(set, flags);
                w.data.write(set, line);
                self.lru.touch(set, way);
            }
            Some(PendingWrite::Invalidate { set, tag, way }) => {
                let target = match way {
                    Some(w) => Some(w),
                    None => self.probe(set, tag).map(|(w, _, _)| w),
                };
                if let Some(w) = target {
                    self.ways[w].flags.write(set, LineFlags::empty());
                }
            }
            None => {}
        }
        for w in &mut self.ways {
            w.commit();
        }
    }

    /// Replace the flags of a known way (snoop downgrades).
    pub fn set_flags(&mut self, set: usize, way: usize, flags: LineFlags) {
        self.ways[way].flags.write(set, flags);
    }

    pub fn reset(&mut self) {
        for w in &mut self.ways {
            w.reset();
        }
        self.lru.reset();
        self.rset = 0;
        self.rtag = 0;
        self.pending = None;
    }
}

/// Address split helper shared by both caches.
#[derive(Debug, Clone, Copy)]
pub struct AddrMap {
    pub log2_lines: u32,
}

impl AddrMap {
    pub fn set(&self, addr: u64) -> usize {
        crate::bits::bits(addr, self.log2_lines + LOG2_LINE_BYTES - 1, LOG2_LINE_BYTES) as usize
    }

    pub fn tag(&self, addr: u64) -> u64 {
        addr >> (self.log2_lines + LOG2_LINE_BYTES)
    }

    pub fn offset(&self, addr: u64) -> usize {
        crate::bits::bits(addr, LOG2_LINE_BYTES - 1, 0) as usize
    }

    pub fn line_base(&self, addr: u64) -> u64 {
        crate::bits::align_down(addr, LOG2_LINE_BYTES)
    }
}

/// Two banks coupled on the line-index LSB. Fetch lookups check the line at
/// `addr` and the one at `addr + LINE_BYTES` together.
#[derive(Debug, Clone)]
pub struct TagMemCoupled {
    banks: [TagMem; 2],
    map: AddrMap,
    raddr: u64,
}

/// Coupled lookup answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoupledLookup {
    pub hit: bool,
    pub hit_next: bool,
    /// 8 bytes starting at the requested offset, spilling into the next
    /// line when the fetch straddles.
    pub rdata64: u64,
    pub raddr: u64,
}

impl TagMemCoupled {
    pub fn new(log2_lines: u32) -> Self {
        let sets = 1usize << (log2_lines - 1);
        Self {
            banks: [TagMem::new(sets), TagMem::new(sets)],
            map: AddrMap { log2_lines },
            raddr: 0,
        }
    }

    fn line_index(&self, addr: u64) -> usize {
        AddrMap { log2_lines: self.map.log2_lines }.set(addr)
    }

    /// Bank and bank-local set of the line containing `addr`.
    fn locate(&self, addr: u64) -> (usize, usize, u64) {
        let li = self.line_index(addr);
        (li & 1, li >> 1, self.map.tag(addr))
    }

    /// Present a fetch lookup: line at `addr` plus the following line.
    pub fn read(&mut self, addr: u64) {
        let next = self.map.line_base(addr) + LINE_BYTES as u64;
        let (b0, s0, t0) = self.locate(addr);
        let (b1, s1, t1) = self.locate(next);
        debug_assert_ne!(b0, b1);
        self.banks[b0].read(s0, t0);
        self.banks[b1].read(s1, t1);
        self.raddr = addr;
    }

    /// Answer for the lookup presented last tick.
    pub fn lookup(&self) -> CoupledLookup {
        let addr = self.raddr;
        let next = self.map.line_base(addr) + LINE_BYTES as u64;
        let (b0, ..) = self.locate(addr);
        let (b1, ..) = self.locate(next);
        let cur = self.banks[b0].lookup();
        let nxt = self.banks[b1].lookup();

        let offset = self.map.offset(addr);
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            let pos = offset + i;
            *b = if pos < LINE_BYTES {
                cur.data[pos]
            } else {
                nxt.data[pos - LINE_BYTES]
            };
        }
        let straddles = offset + 8 > LINE_BYTES;

        CoupledLookup {
            hit: cur.hit,
            // A fetch wholly inside one line only needs that line resident.
            hit_next: if straddles { nxt.hit } else { cur.hit },
            rdata64: u64::from_le_bytes(bytes),
            raddr: addr,
        }
    }

    /// Stage a refill write of the line containing `addr`.
    pub fn write(&mut self, addr: u64, data: Line, wstrb: u32, flags: LineFlags, direct_way: Option<usize>) {
        let (b, s, t) = self.locate(addr);
        self.banks[b].write(s, t, data, wstrb, flags, direct_way);
    }

    /// Stage an invalidate of the line containing `addr`.
    pub fn invalidate(&mut self, addr: u64, direct_way: Option<usize>) {
        let (b, s, t) = self.locate(addr);
        self.banks[b].invalidate(s, t, direct_way);
    }

    /// Hit-path LRU update for the line containing `addr`.
    pub fn touch_hit(&mut self, addr: u64) {
        let (b, s, t) = self.locate(addr);
        if let Some((way, _, _)) = self.banks[b].probe(s, t) {
            self.banks[b].touch(s, way);
        }
    }

    pub fn commit(&mut self) {
        for b in &mut self.banks {
            b.commit();
        }
    }

    pub fn reset(&mut self) {
        for b in &mut self.banks {
            b.reset();
        }
        self.raddr = 0;
    }
}
