//! SoC top level.
//!
//! Owns the hart, its CSR unit, the cache cluster, both AXI master ports
//! (CPU cluster and debug module) and the interconnect with every slave.
//! `tick` is the clock kernel: the combinational net is re-evaluated until
//! the inter-module wires converge (bounded, non-convergence is fatal),
//! then every register bank commits atomically and the step callbacks run.
//!
//! Memory map (bus 0):
//!
//! | Slave         | Base          | Size    |
//! |---------------|---------------|---------|
//! | Boot ROM      | 0x0001_0000   | 256 KiB |
//! | CLINT         | 0x0200_0000   | 64 KiB  |
//! | SRAM          | 0x0800_0000   | 2 MiB   |
//! | PLIC          | 0x0C00_0000   | 64 MiB  |
//! | APB bridge    | 0x1000_0000   | 1 MiB   |
//! | DDR           | 0x8000_0000   | 512 MiB |
//! | SD window     | 0x8_0000_0000 | 32 GiB  |
//!
//! Inside the APB bridge window: UART at +0x10000, SPI/SD registers at
//! +0x50000, GPIO at +0x60000.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::axi::AxiResp;
use crate::bus::{ApbBridge, ApbSlave, AxiMasterPort, AxiSlave, Interconnect, MemPath, MemReqType, MemRequest, MemResponse};
use crate::cache::cachetop::{CacheTop, CacheTopInputs, CacheTopOutputs, CtrlPortIn, DataPortIn};
use crate::cache::dcache::DataReqType;
use crate::cache::mpu::{Mpu, MpuFlags, MpuRegionWrite};
use crate::cache::FlushRequest;
use crate::config::SocConfig;
use crate::cpu::csr::{CsrInputs, CsrOutputs, CsrRegs, CsrRequest, IrqPins};
use crate::cpu::{Hart, HartInputs, HartOutputs};
use crate::dmi::{DebugMod, DmiAction};
use crate::error::SocError;
use crate::mem::{BootRom, DdrMem, Sram};
use crate::peripherals::{Clint, Gpio, Plic, SdCtrl, SdMemWindow, Uart};
use crate::sim::{StepCallback, StepQueue, StopReason};

use log::{debug, info};

// Bus-0 map.
pub const BOOTROM_BASE: u64 = 0x0001_0000;
pub const BOOTROM_SIZE: u64 = 256 * 1024;
pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 64 * 1024;
pub const SRAM_BASE: u64 = 0x0800_0000;
pub const SRAM_SIZE: u64 = 2 * 1024 * 1024;
pub const PLIC_BASE: u64 = 0x0C00_0000;
pub const PLIC_SIZE: u64 = 64 * 1024 * 1024;
pub const APB_BASE: u64 = 0x1000_0000;
pub const APB_SIZE: u64 = 1024 * 1024;
pub const DDR_BASE: u64 = 0x8000_0000;
pub const DDR_SIZE: u64 = 512 * 1024 * 1024;
pub const SDMEM_BASE: u64 = 0x8_0000_0000;
pub const SDMEM_SIZE: u64 = 32 * 1024 * 1024 * 1024;

// Offsets inside the APB window.
pub const APB_UART0: u64 = 0x1_0000;
pub const APB_SDCTRL: u64 = 0x5_0000;
pub const APB_GPIO: u64 = 0x6_0000;

// PLIC source numbers of the on-chip peripherals.
pub const IRQ_UART0: usize = 1;
pub const IRQ_GPIO: usize = 2;
pub const IRQ_SDCTRL: usize = 3;

/// Shared handle adapter so the SoC keeps typed access to slaves the
/// interconnect owns behind `dyn`.
struct Shared<T>(Rc<RefCell<T>>);

impl<T: AxiSlave> AxiSlave for Shared<T> {
    fn read(&mut self, offset: u64, size: usize) -> (u64, AxiResp) {
        self.0.borrow_mut().read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, data: u64, strb: u8) -> AxiResp {
        self.0.borrow_mut().write(offset, size, data, strb)
    }

    fn tick(&mut self) {
        self.0.borrow_mut().tick()
    }
}

struct SharedApb<T>(Rc<RefCell<T>>);

impl<T: ApbSlave> ApbSlave for SharedApb<T> {
    fn read(&mut self, offset: u64) -> (u32, bool) {
        self.0.borrow_mut().read(offset)
    }

    fn write(&mut self, offset: u64, value: u32) -> bool {
        self.0.borrow_mut().write(offset, value)
    }

    fn tick(&mut self) {
        self.0.borrow_mut().tick()
    }
}

/// Inter-module wires re-evaluated to convergence each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Wires {
    hart: HartOutputs,
    csr: CsrOutputs,
    cache: CacheTopOutputs,
}

/// The simulator top module.
pub struct Soc {
    cfg: SocConfig,
    hart: Hart,
    csr: CsrRegs,
    cachetop: CacheTop,
    mst: AxiMasterPort,
    dmi_mst: AxiMasterPort,
    bus: Interconnect,
    debug: DebugMod,

    rom: Rc<RefCell<BootRom>>,
    clint: Rc<RefCell<Clint>>,
    plic: Rc<RefCell<Plic>>,
    uart: Rc<RefCell<Uart>>,
    gpio: Rc<RefCell<Gpio>>,
    sdctrl: Rc<RefCell<SdCtrl>>,

    wires: Wires,
    /// Response latched from the CPU master port for the next tick.
    mem_resp: Option<MemResponse>,
    /// Pending host/debug access on the data port.
    data_req: Option<DataPortIn>,
    data_wait: bool,
    data_resp: Option<crate::cache::dcache::DCacheOutputs>,
    /// Pending system-bus access from the debug module.
    sb_req: Option<MemRequest>,
    sb_resp: Option<MemResponse>,
    /// Stack-pointer shadow fed to the CSR stack guards.
    sp_shadow: u64,

    ticks: u64,
    reset_hold: u64,
    step_queue: StepQueue,
    shutdown: Arc<AtomicBool>,
    /// First accepted cluster memory requests (bounded probe for tests and
    /// trace consumers).
    mem_trace: Vec<MemRequest>,
}

impl Soc {
    const MEM_TRACE_CAP: usize = 64;
    /// Bound on internal ticking for host-driven accesses.
    const ACCESS_TICK_BOUND: usize = 4096;

    /// Elaborate the SoC. Fails on invalid geometry or an inconsistent
    /// address map.
    pub fn new(cfg: SocConfig) -> Result<Self, SocError> {
        cfg.validate()?;

        let rom = Rc::new(RefCell::new(BootRom::new(BOOTROM_SIZE as usize)));
        let clint = Rc::new(RefCell::new(Clint::new(cfg.harts)));
        let plic = Rc::new(RefCell::new(Plic::new()));
        let uart = Rc::new(RefCell::new(Uart::new()));
        let gpio = Rc::new(RefCell::new(Gpio::new()));
        let sdctrl = Rc::new(RefCell::new(SdCtrl::new(cfg.sd_log2_fifosz)));

        let mut apb = ApbBridge::new();
        apb.map("uart0", APB_UART0, 0x1000, Box::new(SharedApb(uart.clone())))?;
        apb.map("sdctrl", APB_SDCTRL, 0x1000, Box::new(SharedApb(sdctrl.clone())))?;
        apb.map("gpio", APB_GPIO, 0x1000, Box::new(SharedApb(gpio.clone())))?;

        let mut bus = Interconnect::new(2);
        bus.map("bootrom", BOOTROM_BASE, BOOTROM_SIZE, Box::new(Shared(rom.clone())))?;
        bus.map("clint", CLINT_BASE, CLINT_SIZE, Box::new(Shared(clint.clone())))?;
        bus.map("sram", SRAM_BASE, SRAM_SIZE, Box::new(Sram::new(SRAM_SIZE as usize)))?;
        bus.map("plic", PLIC_BASE, PLIC_SIZE, Box::new(Shared(plic.clone())))?;
        bus.map("apb", APB_BASE, APB_SIZE, Box::new(apb))?;
        bus.map("ddr", DDR_BASE, DDR_SIZE, Box::new(DdrMem::new()))?;
        bus.map("sdmem", SDMEM_BASE, SDMEM_SIZE, Box::new(SdMemWindow))?;

        let mut cachetop = CacheTop::new(&cfg);
        cachetop.program_boot_regions(&Self::boot_regions());

        info!("soc: elaborated, reset vector 0x{:x}", cfg.reset_vector);

        Ok(Self {
            hart: Hart::new(cfg.reset_vector),
            csr: CsrRegs::new(0, cfg.reset_vector),
            cachetop,
            mst: AxiMasterPort::new(),
            dmi_mst: AxiMasterPort::new(),
            bus,
            debug: DebugMod::new(),
            rom,
            clint,
            plic,
            uart,
            gpio,
            sdctrl,
            wires: Wires::default(),
            mem_resp: None,
            data_req: None,
            data_wait: false,
            data_resp: None,
            sb_req: None,
            sb_resp: None,
            sp_shadow: 0,
            ticks: 0,
            reset_hold: 0,
            step_queue: StepQueue::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            mem_trace: Vec::new(),
            cfg,
        })
    }

    /// MPU view the part boots with: ROM, SRAM and DDR cacheable; all other
    /// windows fall through to the uncached no-match default.
    fn boot_regions() -> [MpuRegionWrite; 3] {
        let cached = MpuFlags::ENA | MpuFlags::CACHEABLE | MpuFlags::READ | MpuFlags::WRITE | MpuFlags::EXEC;
        [
            MpuRegionWrite { we: true, idx: 0, addr: 0, mask: Mpu::region_mask(20), flags: cached },
            MpuRegionWrite { we: true, idx: 1, addr: SRAM_BASE, mask: Mpu::region_mask(21), flags: cached },
            MpuRegionWrite { we: true, idx: 2, addr: DDR_BASE, mask: Mpu::region_mask(29), flags: cached },
        ]
    }

    /// Load a firmware image into the boot ROM.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), SocError> {
        self.rom.borrow_mut().load_image(image)
    }

    /// Hold `nrst` low for `ticks` clock edges. Registers sit at their
    /// reset values the whole time; `dpc` comes back as the reset vector.
    pub fn reset(&mut self, ticks: u64) {
        self.reset_hold = ticks.max(1);
        self.clint.borrow_mut().reset();
        self.plic.borrow_mut().reset();
        self.uart.borrow_mut().reset();
        self.gpio.borrow_mut().reset();
        self.sdctrl.borrow_mut().reset();
        self.debug.reset();
        self.mst.reset();
        self.dmi_mst.reset();
        self.mem_resp = None;
        self.data_req = None;
        self.data_wait = false;
        self.data_resp = None;
        self.sb_req = None;
        self.sb_resp = None;
        self.wires = Wires::default();
        self.mem_trace.clear();
    }

    fn eval_comb(&mut self, cpu_mem_ready: bool) -> Wires {
        let prev = self.wires;

        let (msip, mtip, mtimer) = {
            let clint = self.clint.borrow();
            (clint.msip(0), clint.mtip(0), clint.mtime())
        };
        let (meip, seip) = {
            let plic = self.plic.borrow();
            (plic.ip(0), plic.ip(1))
        };

        let csr = self.csr.comb(&CsrInputs {
            req_valid: prev.hart.csr_req_valid,
            req: prev.hart.csr_req,
            resp_ready: prev.hart.csr_resp_ready,
            sp: self.sp_shadow,
            e_halted: prev.hart.e_halted,
            e_pc: prev.hart.e_pc,
            e_instr: 0,
            e_valid: prev.hart.e_valid,
            irq_pins: IrqPins { msip, mtip, meip, seip },
            dbg_progbuf_ena: prev.hart.dbg_progbuf_ena,
            mtimer,
        });

        let mut data = self.data_req.unwrap_or_default();
        // The host harness is always ready to take its response.
        data.resp_ready = true;
        let cache = self.cachetop.comb(&CacheTopInputs {
            ctrl: CtrlPortIn {
                req_valid: prev.hart.ctrl_req_valid,
                req_addr: prev.hart.ctrl_req_addr,
                resp_ready: prev.hart.ctrl_resp_ready,
            },
            data,
            req_mem_ready: cpu_mem_ready,
            resp_mem: self.mem_resp,
            mpu_write: csr.mpu_region,
            snoop: Default::default(),
            snoop_resp_ready: true,
            flush_i: FlushRequest { valid: csr.flushi_valid, address: csr.flush_addr },
            flush_d: FlushRequest { valid: csr.flushd_valid, address: csr.flush_addr },
        });

        let hart = self.hart.comb(&HartInputs {
            ctrl_req_ready: cache.ctrl.req_ready,
            ctrl_resp_valid: cache.ctrl.resp_valid,
            ctrl_resp_addr: cache.ctrl.resp_addr,
            ctrl_resp_data: cache.ctrl.resp_data,
            ctrl_resp_load_fault: cache.ctrl.resp_load_fault,
            ctrl_resp_executable: cache.ctrl.resp_executable,
            csr_req_ready: csr.req_ready,
            csr_resp_valid: csr.resp_valid,
            csr_resp_data: csr.resp_data,
            csr_resp_exception: csr.resp_exception,
            irq_cause: csr.irq_cause,
            step: csr.step,
            haltreq: self.debug.haltreq,
            resumereq: self.debug.resumereq,
            dport_req: self.debug.dport_req,
            progbuf_exec: self.debug.progbuf_exec,
            progbuf: self.debug.progbuf,
        });

        Wires { hart, csr, cache }
    }

    /// One rising clock edge.
    pub fn tick(&mut self) -> Result<(), SocError> {
        if self.reset_hold > 0 {
            // Asynchronous reset: registers continuously hold their reset
            // values while nrst is low.
            self.hart.commit(false);
            self.csr.commit(false);
            self.cachetop.commit(false);
            self.reset_hold -= 1;
            self.ticks += 1;
            return Ok(());
        }

        // Deterministic round-robin between the two bus masters, decided
        // from registered state.
        let cpu_wants = !self.mst.req_ready() || self.cachetop.mem_req_pending();
        let dmi_wants = !self.dmi_mst.req_ready() || self.sb_req.is_some();
        let grant = self.bus.grant(&[cpu_wants, dmi_wants]);
        let cpu_granted = grant == Some(0);
        let dmi_granted = grant == Some(1);

        // Combinational convergence.
        let limit = self.cfg.comb_limit();
        let mut iterations = 0;
        loop {
            let w = self.eval_comb(self.mst.req_ready() && cpu_granted);
            iterations += 1;
            if w == self.wires {
                break;
            }
            self.wires = w;
            if iterations > limit {
                return Err(SocError::CombinationalLoop { iterations });
            }
        }
        let w = self.wires;

        // Bus beats for the granted master.
        self.mem_resp = None;
        if cpu_granted {
            let req = if self.mst.req_ready() { w.cache.req_mem } else { None };
            if let Some(r) = req.as_ref() {
                if self.mem_trace.len() < Self::MEM_TRACE_CAP {
                    self.mem_trace.push(*r);
                }
            }
            self.mem_resp = self.mst.tick(&mut self.bus, req.as_ref())?;
        }
        if dmi_granted {
            let was_ready = self.dmi_mst.req_ready();
            let req = if was_ready { self.sb_req } else { None };
            let resp = self.dmi_mst.tick(&mut self.bus, req.as_ref())?;
            if was_ready && req.is_some() {
                self.sb_req = None;
            }
            if resp.is_some() {
                self.sb_resp = resp;
            }
        }

        // Register commit, atomic across the design.
        self.hart.commit(true);
        self.csr.commit(true);
        self.cachetop.commit(true);

        // Host data-port bookkeeping.
        if let Some(req) = &self.data_req {
            if req.req_valid && w.cache.data.req_ready {
                self.data_req = None;
                self.data_wait = true;
            }
        }
        if self.data_wait && w.cache.data.resp_valid {
            self.data_resp = Some(w.cache.data);
            self.data_wait = false;
        }

        // Debug module bookkeeping.
        self.debug.allhalted = self.hart.halted();
        if self.debug.resumereq && !self.hart.halted() {
            self.debug.resumereq = false;
            self.debug.allresumeack = true;
        }
        if let Some((data, exception)) = w.hart.dport_resp {
            self.debug.data0 = data;
            self.debug.cmderr = exception as u8;
            self.debug.dport_req = None;
        }
        if w.hart.progbuf_done {
            self.debug.progbuf_exec = false;
        }
        if w.csr.progbuf_error {
            self.debug.cmderr = 1;
            self.debug.progbuf_exec = false;
        }

        // Peripheral interrupt lines into the PLIC, then the slave ticks.
        {
            let mut plic = self.plic.borrow_mut();
            plic.set_irq(IRQ_UART0, self.uart.borrow().irq_pending());
            plic.set_irq(IRQ_GPIO, self.gpio.borrow().irq_pending());
        }
        self.bus.tick();

        self.ticks += 1;
        self.step_queue.dispatch(self.ticks - 1);
        Ok(())
    }

    /// Run until `max_ticks` more edges have passed, the hart halts (when
    /// `stop_on_halt`), or the shutdown flag is raised.
    pub fn run(&mut self, max_ticks: u64, stop_on_halt: bool) -> Result<StopReason, SocError> {
        for _ in 0..max_ticks {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(StopReason::Shutdown);
            }
            self.tick()?;
            if stop_on_halt && self.hart.halted() {
                return Ok(StopReason::Hap);
            }
        }
        Ok(StopReason::TickLimit)
    }

    /// Register a callback dispatched after each register commit.
    pub fn register_step_callback(&mut self, cb: StepCallback) {
        self.step_queue.register(cb);
    }

    /// Flag checked at every tick boundary; safe to set from another
    /// thread.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    // ===== debug interface =====

    /// DMI register write. Accesses that reach hart or bus state advance
    /// simulated time until the effect completes.
    pub fn dmi_write(&mut self, addr: u32, value: u64) -> Result<(), SocError> {
        let action = self.debug.write(addr, value)?;
        self.run_dmi_action(action)
    }

    /// DMI register read.
    pub fn dmi_read(&mut self, addr: u32) -> Result<u64, SocError> {
        let (value, action) = self.debug.read(addr)?;
        match action {
            Some(DmiAction::SbRead) => {
                self.sb_access(false, 0)?;
                Ok(self.debug.sbdata)
            }
            Some(other) => {
                self.run_dmi_action(Some(other))?;
                Ok(value)
            }
            None => Ok(value),
        }
    }

    fn run_dmi_action(&mut self, action: Option<DmiAction>) -> Result<(), SocError> {
        match action {
            None => Ok(()),
            Some(DmiAction::AbstractCsr(_)) => {
                for _ in 0..Self::ACCESS_TICK_BOUND {
                    self.tick()?;
                    if self.debug.dport_req.is_none() {
                        return Ok(());
                    }
                }
                debug!("dmi: abstract command stalled");
                self.debug.cmderr = 1;
                self.debug.dport_req = None;
                Ok(())
            }
            Some(DmiAction::ProgbufExec) => {
                for _ in 0..Self::ACCESS_TICK_BOUND {
                    self.tick()?;
                    if !self.debug.progbuf_exec {
                        return Ok(());
                    }
                }
                self.debug.cmderr = 1;
                self.debug.progbuf_exec = false;
                Ok(())
            }
            Some(DmiAction::SbRead) => self.sb_access(false, 0),
            Some(DmiAction::SbWrite(v)) => self.sb_access(true, v),
        }
    }

    /// Single 32-bit system-bus access through the debug master.
    fn sb_access(&mut self, write: bool, value: u64) -> Result<(), SocError> {
        let addr = self.debug.sbaddress;
        let lane = ((addr >> 3) & 0x3) as u32;
        let off = (addr & 0x7) as u32;
        let mut wdata = [0u64; crate::config::BEATS_PER_LINE];
        wdata[lane as usize] = (value & 0xFFFF_FFFF) << (8 * off);
        self.sb_req = Some(MemRequest {
            path: MemPath::Ctrl,
            rtype: if write { MemReqType::write_no_snoop() } else { MemReqType::read_no_snoop() },
            size_log2: 2,
            addr,
            wstrb: 0xFu32 << (8 * lane + off),
            wdata,
        });
        self.sb_resp = None;
        for _ in 0..Self::ACCESS_TICK_BOUND {
            self.tick()?;
            if let Some(resp) = self.sb_resp.take() {
                if !write {
                    self.debug.sbdata = resp.data[0] & 0xFFFF_FFFF;
                }
                return Ok(());
            }
        }
        Err(SocError::DebugAccessTimeout { addr })
    }

    /// Inject one CSR command through the hart debug port, as the debugger
    /// (or the pipeline's executor) would, returning `(data, exception)`.
    pub fn inject_csr_request(&mut self, req: CsrRequest) -> Result<(u64, bool), SocError> {
        self.debug.cmderr = 0;
        self.debug.dport_req = Some(req);
        for _ in 0..Self::ACCESS_TICK_BOUND {
            self.tick()?;
            if self.debug.dport_req.is_none() {
                return Ok((self.debug.data0, self.debug.cmderr != 0));
            }
        }
        Err(SocError::DebugAccessTimeout { addr: req.addr as u64 })
    }

    // ===== host harness access =====

    /// Load through the data cache (advances simulated time).
    pub fn data_load(&mut self, addr: u64) -> Result<(u64, bool), SocError> {
        self.data_access(DataPortIn {
            req_valid: true,
            req_type: DataReqType::Read,
            req_addr: addr,
            req_size: 3,
            resp_ready: true,
            ..Default::default()
        })
    }

    /// Store through the data cache (advances simulated time).
    pub fn data_store(&mut self, addr: u64, data: u64, wstrb: u8) -> Result<bool, SocError> {
        let (_, fault) = self.data_access(DataPortIn {
            req_valid: true,
            req_type: DataReqType::Write,
            req_addr: addr,
            req_wdata: data,
            req_wstrb: wstrb,
            req_size: 3,
            resp_ready: true,
        })?;
        Ok(fault)
    }

    fn data_access(&mut self, req: DataPortIn) -> Result<(u64, bool), SocError> {
        self.data_req = Some(req);
        self.data_resp = None;
        self.data_wait = false;
        for _ in 0..Self::ACCESS_TICK_BOUND {
            self.tick()?;
            if let Some(resp) = self.data_resp.take() {
                let fault = resp.resp_er_load_fault
                    || resp.resp_er_store_fault
                    || resp.resp_er_mpu_load
                    || resp.resp_er_mpu_store;
                return Ok((resp.resp_data, fault));
            }
        }
        Err(SocError::DebugAccessTimeout { addr: req.req_addr })
    }

    /// Backdoor bus read (no timing, but device side effects apply as on
    /// any bus read).
    pub fn peek_mem(&mut self, addr: u64, size: usize) -> u64 {
        self.bus.read_beat(addr, size).0
    }

    /// Backdoor bus write.
    pub fn poke_mem(&mut self, addr: u64, size: usize, data: u64) {
        self.bus.write_beat(addr, size, data, 0xFF);
    }

    /// Drive an external PLIC interrupt line.
    pub fn set_ext_irq(&mut self, src: usize, level: bool) {
        self.plic.borrow_mut().set_irq(src, level);
    }

    /// Stack-pointer shadow for the CSR stack guards.
    pub fn set_sp(&mut self, sp: u64) {
        self.sp_shadow = sp;
    }

    // Observability.

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn hart_pc(&self) -> u64 {
        self.hart.pc()
    }

    pub fn hart_halted(&self) -> bool {
        self.hart.halted()
    }

    pub fn csr_mode(&self) -> u8 {
        self.csr.mode()
    }

    /// Test hook: force the hart privilege mode.
    pub fn force_mode(&mut self, mode: u8) {
        self.csr.set_mode(mode);
    }

    pub fn mcycle(&self) -> u64 {
        self.csr.mcycle()
    }

    pub fn minstret(&self) -> u64 {
        self.csr.minstret()
    }

    /// Accepted cluster memory requests, oldest first (bounded).
    pub fn mem_trace(&self) -> &[MemRequest] {
        &self.mem_trace
    }

    pub fn clear_mem_trace(&mut self) {
        self.mem_trace.clear();
    }

    // Typed peripheral handles for hosts and tests.

    pub fn uart(&self) -> Rc<RefCell<Uart>> {
        self.uart.clone()
    }

    pub fn gpio(&self) -> Rc<RefCell<Gpio>> {
        self.gpio.clone()
    }

    pub fn sdctrl(&self) -> Rc<RefCell<SdCtrl>> {
        self.sdctrl.clone()
    }

    pub fn clint(&self) -> Rc<RefCell<Clint>> {
        self.clint.clone()
    }

    pub fn plic(&self) -> Rc<RefCell<Plic>> {
        self.plic.clone()
    }
}

impl std::fmt::Debug for Soc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Soc")
            .field("ticks", &self.ticks)
            .field("pc", &self.hart.pc())
            .field("halted", &self.hart.halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmi::{DMI_DATA0, DMI_DMCONTROL, DMI_DMSTATUS, DMI_SBADDRESS0, DMI_SBDATA0};

    fn small_soc() -> Soc {
        let cfg = SocConfig {
            icache_log2_lines: 4,
            dcache_log2_lines: 4,
            ..Default::default()
        };
        let mut soc = Soc::new(cfg).unwrap();
        soc.load_rom(&[0x13; 4096]).unwrap(); // a ROM full of addi nops
        soc
    }

    #[test]
    fn test_elaboration_validates_config() {
        let mut cfg = SocConfig::default();
        cfg.icache_ways = 8;
        assert!(Soc::new(cfg).is_err());
    }

    #[test]
    fn test_reset_then_first_fetch_is_line_read_shared() {
        let mut soc = small_soc();
        soc.reset(10);
        soc.run(3000, false).unwrap();

        let first = soc.mem_trace().first().expect("a memory request");
        assert_eq!(first.addr, 0x0001_0000, "line burst at the reset vector");
        assert_eq!(first.rtype, MemReqType::read_shared());
        assert_eq!(first.size_log2 as u32, crate::config::LOG2_LINE_BYTES);
        assert_eq!(first.path, MemPath::Ctrl);
    }

    #[test]
    fn test_hart_retires_and_counters_advance() {
        let mut soc = small_soc();
        soc.reset(2);
        soc.run(2000, false).unwrap();
        assert!(soc.minstret() > 0, "hart must retire instructions");
        assert!(soc.mcycle() > 0);
        assert!(soc.hart_pc() > 0x0001_0000);
    }

    #[test]
    fn test_dmi_halt_and_resume() {
        let mut soc = small_soc();
        soc.reset(2);
        soc.run(1500, false).unwrap();

        soc.dmi_write(DMI_DMCONTROL, 1 << 31).unwrap();
        soc.run(200, true).unwrap();
        assert!(soc.hart_halted());
        let status = soc.dmi_read(DMI_DMSTATUS).unwrap();
        assert_ne!(status & (1 << 9), 0, "allhalted");

        // minstret frozen? Not unless stopcount; but the pc is stable.
        let pc = soc.hart_pc();
        soc.run(50, false).unwrap();
        assert_eq!(soc.hart_pc(), pc);

        soc.dmi_write(DMI_DMCONTROL, 1 << 30).unwrap();
        soc.run(200, false).unwrap();
        assert!(!soc.hart_halted());
        let status = soc.dmi_read(DMI_DMSTATUS).unwrap();
        assert_ne!(status & (1 << 17), 0, "resume acknowledged");
    }

    #[test]
    fn test_dmi_abstract_csr_access() {
        let mut soc = small_soc();
        soc.reset(2);
        soc.run(1500, false).unwrap();
        soc.dmi_write(DMI_DMCONTROL, 1 << 31).unwrap();
        soc.run(200, true).unwrap();

        // Write mscratch through the debug port, read it back.
        soc.dmi_write(DMI_DATA0, 0xCAFE_F00D).unwrap();
        soc.dmi_write(crate::dmi::DMI_COMMAND, (1 << 16) | 0x340).unwrap();
        soc.dmi_write(crate::dmi::DMI_COMMAND, 0x340).unwrap();
        assert_eq!(soc.dmi_read(DMI_DATA0).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn test_dmi_system_bus_access() {
        let mut soc = small_soc();
        soc.reset(2);

        soc.dmi_write(DMI_SBADDRESS0, SRAM_BASE).unwrap();
        soc.dmi_write(DMI_SBDATA0, 0x1234_5678).unwrap();
        assert_eq!(soc.dmi_read(DMI_SBDATA0).unwrap(), 0x1234_5678);
        assert_eq!(soc.peek_mem(SRAM_BASE, 4), 0x1234_5678);
    }

    #[test]
    fn test_unmapped_dmi_address_is_fatal() {
        let mut soc = small_soc();
        assert!(matches!(
            soc.dmi_read(0x70),
            Err(SocError::UnmappedDebugAddress { .. })
        ));
    }

    #[test]
    fn test_uncached_bypass_then_cached_read_roundtrip() {
        let mut soc = small_soc();
        soc.reset(2);
        // Fill a line in SRAM through the uncached backdoor.
        for i in 0..4u64 {
            soc.poke_mem(SRAM_BASE + 0x100 + 8 * i, 8, 0x1111_0000_0000_0000 * (i + 1) + i);
        }
        // Read it back through the data cache.
        for i in 0..4u64 {
            let (v, fault) = soc.data_load(SRAM_BASE + 0x100 + 8 * i).unwrap();
            assert!(!fault);
            assert_eq!(v, 0x1111_0000_0000_0000 * (i + 1) + i);
        }
    }

    #[test]
    fn test_step_callback_runs_after_commit() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut soc = small_soc();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        soc.register_step_callback(Box::new(move |_t| {
            *h.borrow_mut() += 1;
            false
        }));
        soc.run(3, false).unwrap();
        assert_eq!(*hits.borrow(), 1, "one-shot callback runs exactly once");
    }

    #[test]
    fn test_shutdown_flag_stops_run() {
        let mut soc = small_soc();
        let flag = soc.shutdown_handle();
        flag.store(true, Ordering::Relaxed);
        assert_eq!(soc.run(100, false).unwrap(), StopReason::Shutdown);
    }
}
