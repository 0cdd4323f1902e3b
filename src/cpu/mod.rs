//! Hart front-end.
//!
//! The execution model is a fetch/retire skeleton: instructions are fetched
//! through the cache cluster's control port and retired in order; the CSR
//! unit beside it owns every architectural consequence (traps, interrupts,
//! privilege, counters). There is no instruction decode beyond the few
//! encodings the debug program buffer cares about, which is all the
//! simulation core needs - the ISA semantics live with the external
//! executor this repo does not model.
//!
//! Debug behavior: `haltreq` drains into a Halt command, `resumereq` resumes
//! from `dpc`, single-step retires exactly one instruction before halting
//! again, and program-buffer execution runs with `dbg_progbuf_ena` raised so
//! CSR faults are flagged instead of redirecting control.

pub mod csr;

use crate::cpu::csr::{CsrRequest, HALT_CAUSE_HALTREQ, HALT_CAUSE_STEP};
use crate::cpu::csr::{EXC_ILLEGAL_INSTR, EXC_INSTR_FAULT};

use log::debug;

/// `ebreak` ends a debug program-buffer run.
const INSTR_EBREAK: u32 = 0x0010_0073;

/// Where a CSR command originated, so the response lands back there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdSrc {
    Pipeline,
    Dport,
}

/// What the in-flight CSR command does to the control flow once answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdKind {
    Redirect,
    Halt,
    Resume,
    Plain,
}

/// Inputs sampled by the hart each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HartInputs {
    pub ctrl_req_ready: bool,
    pub ctrl_resp_valid: bool,
    pub ctrl_resp_addr: u64,
    pub ctrl_resp_data: u64,
    pub ctrl_resp_load_fault: bool,
    pub ctrl_resp_executable: bool,
    pub csr_req_ready: bool,
    pub csr_resp_valid: bool,
    pub csr_resp_data: u64,
    pub csr_resp_exception: bool,
    /// Gated pending interrupt from the CSR unit.
    pub irq_cause: Option<u8>,
    /// `dcsr.step` view.
    pub step: bool,
    pub haltreq: bool,
    pub resumereq: bool,
    /// Debug-port CSR access injection.
    pub dport_req: Option<CsrRequest>,
    /// Debug request to execute the program buffer.
    pub progbuf_exec: bool,
    /// The program buffer contents (eight 32-bit words).
    pub progbuf: [u32; 8],
}

/// Outputs driven by the hart each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HartOutputs {
    pub ctrl_req_valid: bool,
    pub ctrl_req_addr: u64,
    pub ctrl_resp_ready: bool,
    pub csr_req_valid: bool,
    pub csr_req: CsrRequest,
    pub csr_resp_ready: bool,
    pub e_halted: bool,
    pub e_pc: u64,
    /// One-tick retire pulse.
    pub e_valid: bool,
    pub dbg_progbuf_ena: bool,
    /// Completed debug-port access: `(data, exception)`.
    pub dport_resp: Option<(u64, bool)>,
    /// Program-buffer run finished.
    pub progbuf_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Fetch,
    WaitFetch,
    CsrIssue,
    CsrWait,
    Halted,
    ProgBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Regs {
    state: State,
    pc: u64,
    halted: bool,
    /// Retire exactly one instruction, then halt (single-step).
    step_armed: bool,
    cmd: CsrRequest,
    cmd_src: CmdSrc,
    cmd_kind: CmdKind,
    progbuf_idx: usize,
    dport_data: u64,
    dport_exception: bool,
    dport_resp_valid: bool,
}

/// One hart of the cluster.
#[derive(Debug)]
pub struct Hart {
    r: Regs,
    v: Regs,
    reset_vector: u64,
}

impl Hart {
    pub fn new(reset_vector: u64) -> Self {
        let r = Self::reset_regs(reset_vector);
        Self { r: r.clone(), v: r, reset_vector }
    }

    fn reset_regs(reset_vector: u64) -> Regs {
        Regs {
            state: State::Fetch,
            pc: reset_vector,
            halted: false,
            step_armed: false,
            cmd: CsrRequest::default(),
            cmd_src: CmdSrc::Pipeline,
            cmd_kind: CmdKind::Plain,
            progbuf_idx: 0,
            dport_data: 0,
            dport_exception: false,
            dport_resp_valid: false,
        }
    }

    fn issue(v: &mut Regs, cmd: CsrRequest, kind: CmdKind, src: CmdSrc) {
        v.cmd = cmd;
        v.cmd_kind = kind;
        v.cmd_src = src;
        v.state = State::CsrIssue;
    }

    /// Combinational process.
    pub fn comb(&mut self, inp: &HartInputs) -> HartOutputs {
        let r = self.r.clone();
        let mut v = r.clone();
        let mut out = HartOutputs::default();

        out.e_pc = r.pc;
        out.e_halted = r.halted;

        match r.state {
            State::Fetch => {
                if inp.haltreq {
                    Self::issue(&mut v, CsrRequest::halt(HALT_CAUSE_HALTREQ), CmdKind::Halt, CmdSrc::Pipeline);
                } else if let Some(cause) = inp.irq_cause {
                    Self::issue(&mut v, CsrRequest::interrupt(cause), CmdKind::Redirect, CmdSrc::Pipeline);
                } else if let Some(req) = inp.dport_req {
                    Self::issue(&mut v, req, CmdKind::Plain, CmdSrc::Dport);
                } else {
                    out.ctrl_req_valid = true;
                    out.ctrl_req_addr = r.pc;
                    if inp.ctrl_req_ready {
                        v.state = State::WaitFetch;
                    }
                }
            }
            State::WaitFetch => {
                out.ctrl_resp_ready = true;
                if inp.ctrl_resp_valid {
                    if inp.ctrl_resp_load_fault || !inp.ctrl_resp_executable {
                        Self::issue(
                            &mut v,
                            CsrRequest::exception(EXC_INSTR_FAULT, inp.ctrl_resp_addr),
                            CmdKind::Redirect,
                            CmdSrc::Pipeline,
                        );
                    } else {
                        out.e_valid = true;
                        v.pc = r.pc.wrapping_add(4);
                        if inp.haltreq {
                            Self::issue(&mut v, CsrRequest::halt(HALT_CAUSE_HALTREQ), CmdKind::Halt, CmdSrc::Pipeline);
                        } else if r.step_armed {
                            v.step_armed = false;
                            Self::issue(&mut v, CsrRequest::halt(HALT_CAUSE_STEP), CmdKind::Halt, CmdSrc::Pipeline);
                        } else {
                            v.state = State::Fetch;
                        }
                    }
                }
            }
            State::CsrIssue => {
                out.csr_req_valid = true;
                out.csr_req = r.cmd;
                if inp.csr_req_ready {
                    v.state = State::CsrWait;
                }
            }
            State::CsrWait => {
                out.csr_resp_ready = true;
                if inp.csr_resp_valid {
                    match r.cmd_kind {
                        CmdKind::Redirect => {
                            v.pc = inp.csr_resp_data;
                            v.state = State::Fetch;
                        }
                        CmdKind::Halt => {
                            v.halted = true;
                            v.state = State::Halted;
                        }
                        CmdKind::Resume => {
                            v.pc = inp.csr_resp_data;
                            v.halted = false;
                            v.step_armed = inp.step;
                            v.state = State::Fetch;
                        }
                        CmdKind::Plain => {
                            if r.cmd_src == CmdSrc::Dport {
                                v.dport_data = inp.csr_resp_data;
                                v.dport_exception = inp.csr_resp_exception;
                                v.dport_resp_valid = true;
                            }
                            v.state = if r.halted { State::Halted } else { State::Fetch };
                        }
                    }
                }
            }
            State::Halted => {
                if inp.resumereq {
                    Self::issue(&mut v, CsrRequest::resume(), CmdKind::Resume, CmdSrc::Pipeline);
                } else if let Some(req) = inp.dport_req {
                    Self::issue(&mut v, req, CmdKind::Plain, CmdSrc::Dport);
                } else if inp.progbuf_exec {
                    v.progbuf_idx = 0;
                    v.state = State::ProgBuf;
                }
            }
            State::ProgBuf => {
                out.dbg_progbuf_ena = true;
                if r.progbuf_idx >= inp.progbuf.len() {
                    out.progbuf_done = true;
                    v.state = State::Halted;
                } else {
                    let word = inp.progbuf[r.progbuf_idx];
                    if word == INSTR_EBREAK {
                        out.progbuf_done = true;
                        v.state = State::Halted;
                    } else if word == 0 || word == u32::MAX {
                        // Not a valid encoding: raise it with progbuf_ena so
                        // the CSR unit flags the error instead of trapping.
                        v.progbuf_idx = inp.progbuf.len();
                        Self::issue(
                            &mut v,
                            CsrRequest::exception(EXC_ILLEGAL_INSTR, word as u64),
                            CmdKind::Plain,
                            CmdSrc::Pipeline,
                        );
                    } else {
                        out.e_valid = true;
                        v.progbuf_idx = r.progbuf_idx + 1;
                    }
                }
            }
        }

        if r.dport_resp_valid {
            out.dport_resp = Some((r.dport_data, r.dport_exception));
            v.dport_resp_valid = false;
        }

        // Keep progbuf_ena up while its CSR exception is being reported.
        if matches!(r.state, State::CsrIssue | State::CsrWait)
            && r.cmd.ty.contains(crate::cpu::csr::CsrReqType::EXCEPTION)
            && r.progbuf_idx != 0
        {
            out.dbg_progbuf_ena = true;
        }

        if r.halted != v.halted {
            debug!("hart: {}", if v.halted { "halted" } else { "resumed" });
        }

        self.v = v;
        out
    }

    /// Clock edge.
    pub fn commit(&mut self, nrst: bool) {
        if !nrst {
            self.r = Self::reset_regs(self.reset_vector);
            self.v = self.r.clone();
        } else {
            self.r = self.v.clone();
        }
    }

    pub fn pc(&self) -> u64 {
        self.r.pc
    }

    pub fn halted(&self) -> bool {
        self.r.halted
    }
}
