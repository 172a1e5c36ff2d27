//! Intel x86 CPU implementation (8086/8088 through 80386)
//!
//! The CPU is a fetch/decode/execute loop over the linear address space the
//! [`Bus`] exposes, gated by the segmentation unit. A call to
//! [`Cpu::step_cpu`] runs one burst of instructions against a cycle budget;
//! burst boundaries always fall on instruction boundaries, so external
//! interrupts and snapshots only ever observe whole instructions.
//!
//! # Module Organization
//!
//! - `flags`: PS/EFLAGS bits and the lazy flag engine
//! - `helpers`: register file, fetch, stack, ModR/M, the width-parametric ALU
//! - `execute`: opcode dispatch and instruction semantics
//! - `segments`: segment registers, descriptor loading, paging
//! - `faults`: exception machinery and interrupt dispatch
//! - `tasks`: TSS task switching

use bitflags::bitflags;
use thiserror::Error;

use crate::bus::Bus;

mod execute;
pub mod faults;
pub mod flags;
mod helpers;
pub mod segments;
mod tasks;

#[cfg(test)]
mod tests;

pub use faults::Fault;
pub use segments::{DescTableReg, SegReg, CS, DS, ES, FS, GS, SS};

use faults::{vector, IntSource};

/// CPU model being emulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    I8086,
    I8088,
    I80186,
    I80188,
    I80286,
    I80386,
}

impl CpuModel {
    /// Parse the model number used in machine descriptions
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            8086 => Some(CpuModel::I8086),
            8088 => Some(CpuModel::I8088),
            80186 => Some(CpuModel::I80186),
            80188 => Some(CpuModel::I80188),
            80286 => Some(CpuModel::I80286),
            80386 => Some(CpuModel::I80386),
            _ => None,
        }
    }

    /// Model number for snapshots and diagnostics
    pub fn number(self) -> u32 {
        match self {
            CpuModel::I8086 => 8086,
            CpuModel::I8088 => 8088,
            CpuModel::I80186 => 80186,
            CpuModel::I80188 => 80188,
            CpuModel::I80286 => 80286,
            CpuModel::I80386 => 80386,
        }
    }

    /// 80386 feature level (32-bit registers, FS/GS, paging)
    #[inline]
    pub fn is_386(self) -> bool {
        self == CpuModel::I80386
    }

    /// Protected-mode capable (80286+)
    #[inline]
    pub fn has_protected_mode(self) -> bool {
        matches!(self, CpuModel::I80286 | CpuModel::I80386)
    }

    /// 80186 instruction set additions (PUSHA, BOUND, shift imm, ...)
    #[inline]
    pub fn has_186_ops(self) -> bool {
        !matches!(self, CpuModel::I8086 | CpuModel::I8088)
    }

    /// Physical address wrap mask (20, 24 or 32 bits)
    pub fn bus_mask(self) -> u32 {
        match self {
            CpuModel::I8086 | CpuModel::I8088 | CpuModel::I80186 | CpuModel::I80188 => 0xF_FFFF,
            CpuModel::I80286 => 0xFF_FFFF,
            CpuModel::I80386 => 0xFFFF_FFFF,
        }
    }

    /// Default installed memory for a machine of this model
    pub fn default_mem_size(self) -> usize {
        match self {
            CpuModel::I8086 | CpuModel::I8088 | CpuModel::I80186 | CpuModel::I80188 => 0x10_0000,
            _ => 0x100_0000,
        }
    }

    /// PS bits this model stores (writes outside the mask are dropped)
    pub(crate) fn ps_direct(self) -> u32 {
        const BASE: u32 = flags::CF
            | flags::PF
            | flags::AF
            | flags::ZF
            | flags::SF
            | flags::TF
            | flags::IF
            | flags::DF
            | flags::OF;
        match self {
            CpuModel::I8086 | CpuModel::I8088 | CpuModel::I80186 | CpuModel::I80188 => BASE,
            CpuModel::I80286 => BASE | flags::IOPL | flags::NT,
            CpuModel::I80386 => BASE | flags::IOPL | flags::NT | flags::RF | flags::VM,
        }
    }

    /// PS bits this model forces set (bit 1 everywhere; the 8086 family
    /// reads bits 12-15 as ones)
    pub(crate) fn ps_set(self) -> u32 {
        match self {
            CpuModel::I8086 | CpuModel::I8088 | CpuModel::I80186 | CpuModel::I80188 => {
                flags::BIT1 | flags::IOPL | flags::NT | flags::BIT15
            }
            _ => flags::BIT1,
        }
    }

    /// Per-model cycle cost table
    pub(crate) fn cycles(self) -> &'static CycleTable {
        match self {
            CpuModel::I8086 | CpuModel::I8088 => &CYCLES_8086,
            CpuModel::I80186 | CpuModel::I80188 => &CYCLES_8086,
            CpuModel::I80286 => &CYCLES_80286,
            CpuModel::I80386 => &CYCLES_80386,
        }
    }
}

/// Cycle costs by operation class. These are per-instruction tallies, not
/// bus-accurate timings; the prefetch queue is modelled only as a flush.
pub(crate) struct CycleTable {
    pub base: u32,
    pub ea: u32,
    pub push_pop: u32,
    pub jcc_taken: u32,
    pub transfer_near: u32,
    pub transfer_far: u32,
    pub int: u32,
    pub iret: u32,
    pub mul: u32,
    pub div: u32,
    pub shift: u32,
    pub string: u32,
    pub io: u32,
    pub seg_load: u32,
    pub task_switch: u32,
}

static CYCLES_8086: CycleTable = CycleTable {
    base: 3,
    ea: 6,
    push_pop: 10,
    jcc_taken: 12,
    transfer_near: 15,
    transfer_far: 28,
    int: 51,
    iret: 32,
    mul: 70,
    div: 80,
    shift: 8,
    string: 17,
    io: 10,
    seg_load: 2,
    task_switch: 0,
};

static CYCLES_80286: CycleTable = CycleTable {
    base: 2,
    ea: 3,
    push_pop: 5,
    jcc_taken: 7,
    transfer_near: 7,
    transfer_far: 13,
    int: 23,
    iret: 17,
    mul: 21,
    div: 25,
    shift: 5,
    string: 8,
    io: 5,
    seg_load: 17,
    task_switch: 180,
};

static CYCLES_80386: CycleTable = CycleTable {
    base: 2,
    ea: 2,
    push_pop: 4,
    jcc_taken: 7,
    transfer_near: 7,
    transfer_far: 13,
    int: 37,
    iret: 22,
    mul: 17,
    div: 38,
    shift: 3,
    string: 7,
    io: 12,
    seg_load: 18,
    task_switch: 300,
};

bitflags! {
    /// Per-instruction dispatcher state. The prefix subset accumulates
    /// across prefix bytes and is preserved into `op_prefixes` for REP
    /// resumption; everything else resets every instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// A segment override prefix is active (`seg_override` says which)
        const SEG = 1 << 0;
        const LOCK = 1 << 1;
        const REPZ = 1 << 2;
        const REPNZ = 1 << 3;
        /// 0x66 operand-size prefix seen
        const DATASIZE = 1 << 4;
        /// 0x67 address-size prefix seen
        const ADDRSIZE = 1 << 5;
        /// Suppress the dispatcher's operand write-back
        const NOWRITE = 1 << 6;
        /// Suppress further operand reads
        const NOREAD = 1 << 7;
        /// Hold off interrupt acceptance until after the next instruction
        const NOINTR = 1 << 8;
    }
}

impl OpFlags {
    /// The prefix bits carried into `op_prefixes`
    pub const PREFIXES: OpFlags = OpFlags::SEG
        .union(OpFlags::LOCK)
        .union(OpFlags::REPZ)
        .union(OpFlags::REPNZ)
        .union(OpFlags::DATASIZE)
        .union(OpFlags::ADDRSIZE);
}

bitflags! {
    /// External event request bits, set by the surrounding machine and
    /// consumed at instruction boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntFlags: u32 {
        /// Maskable interrupt requested
        const INTR = 1 << 0;
        /// Single-step trap armed (TF was set when an instruction started)
        const TRAP = 1 << 1;
    }
}

/// Snapshot (de)serialisation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot buffer too small: {0} bytes")]
    Truncated(usize),
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("snapshot holds unknown CPU model {0}")]
    BadModel(u32),
}

/// x86 CPU state
pub struct Cpu {
    /// Model being emulated
    pub model: CpuModel,

    /// General registers in ModR/M encoding order:
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI
    pub regs: [u32; 8],
    /// Segment registers in sreg encoding order: ES, CS, SS, DS, FS, GS
    pub segs: [SegReg; 6],
    /// Instruction pointer (EIP); 16-bit code masks it at use sites
    pub ip: u32,

    // Lazy flag engine (see flags.rs)
    pub(crate) ps: u32,
    pub(crate) result_dst: u32,
    pub(crate) result_src: u32,
    pub(crate) result_arith: u32,
    pub(crate) result_logic: u32,
    pub(crate) result_type: u32,

    // System registers
    pub cr0: u32,
    /// Page fault linear address
    pub cr2: u32,
    /// Page directory base
    pub cr3: u32,
    /// Debug registers DR0-DR7 (stored; breakpoints are not evaluated)
    pub dr: [u32; 8],
    pub gdt: DescTableReg,
    pub idt: DescTableReg,
    /// Local descriptor table shadow (selector + hidden state)
    pub ldt: SegReg,
    /// Task register shadow (selector + hidden state)
    pub tr: SegReg,
    /// Current privilege level, from CS's DPL after a successful load
    pub cpl: u8,

    // Dispatcher state
    pub(crate) op_flags: OpFlags,
    /// Prefix bits of the instruction being (or last) executed
    pub(crate) op_prefixes: OpFlags,
    /// IP of the current instruction's first prefix/opcode byte, for fault
    /// restart and REP resumption
    pub(crate) op_ip: u32,
    /// Segment index named by an active override prefix
    pub(crate) seg_override: usize,
    /// External event requests
    pub int_flags: IntFlags,
    /// Vector supplied with the INTR request
    pub(crate) intr_vector: Option<u8>,
    /// Vector of the fault being serviced, or -1
    pub n_fault: i16,
    /// HLT state; cleared by interrupt delivery
    pub halted: bool,

    /// Remaining cycle budget of the current burst
    pub(crate) n_step_cycles: i64,
}

impl Cpu {
    /// Create a CPU at the architectural reset state
    pub fn new(model: CpuModel) -> Self {
        let mut cpu = Self {
            model,
            regs: [0; 8],
            segs: [SegReg::null(); 6],
            ip: 0,
            ps: 0,
            result_dst: 0,
            result_src: 0,
            result_arith: 0,
            result_logic: 0,
            result_type: flags::result::WORD,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            dr: [0; 8],
            gdt: DescTableReg::default(),
            idt: DescTableReg::default(),
            ldt: SegReg::null(),
            tr: SegReg::null(),
            cpl: 0,
            op_flags: OpFlags::empty(),
            op_prefixes: OpFlags::empty(),
            op_ip: 0,
            seg_override: DS,
            int_flags: IntFlags::empty(),
            intr_vector: None,
            n_fault: -1,
            halted: false,
            n_step_cycles: 0,
        };
        cpu.reset_regs();
        cpu
    }

    /// Return every register to its architectural reset value. Also the
    /// triple-fault landing point.
    pub fn reset_regs(&mut self) {
        self.regs = [0; 8];
        for i in 0..6 {
            self.segs[i] = SegReg::real(0);
        }
        if self.model.has_protected_mode() {
            self.load_seg_real(CS, 0xF000);
            self.ip = 0xFFF0;
        } else {
            self.load_seg_real(CS, 0xFFFF);
            self.ip = 0x0000;
        }
        self.ps = 0;
        self.set_ps(0);
        self.result_dst = 0;
        self.result_src = 0;
        self.result_arith = 0;
        self.result_logic = 0;
        self.result_type = flags::result::WORD;
        self.cr0 = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.dr = [0; 8];
        self.gdt = DescTableReg::default();
        // Real-mode vector table: 256 four-byte vectors at linear 0
        self.idt = DescTableReg { base: 0, limit: 0x3FF };
        self.ldt = SegReg::null();
        self.tr = SegReg::null();
        self.cpl = 0;
        self.op_flags = OpFlags::empty();
        self.op_prefixes = OpFlags::empty();
        self.op_ip = self.ip;
        self.seg_override = DS;
        self.int_flags = IntFlags::empty();
        self.intr_vector = None;
        self.n_fault = -1;
        self.halted = false;
    }

    /// Request a maskable interrupt with its vector. The dispatcher accepts
    /// it at the next instruction boundary with IF set and no shadow.
    pub fn request_interrupt(&mut self, vec: u8) {
        self.int_flags.insert(IntFlags::INTR);
        self.intr_vector = Some(vec);
    }

    /// Whether maskable interrupts are enabled
    #[inline]
    pub fn intr_enabled(&self) -> bool {
        self.ps & flags::IF != 0
    }

    // ========== Burst Execution ==========

    /// Run instructions until the cycle budget is exhausted or the CPU
    /// halts. Returns the cycles consumed.
    pub fn step_cpu(&mut self, bus: &mut Bus, burst: u32) -> u32 {
        self.n_step_cycles = burst as i64;

        while self.n_step_cycles > 0 {
            // Event window between instructions. The previous instruction's
            // flags are still live here, so a NOINTR shadow (prefix, STI,
            // POP SS) pushes acceptance past the following instruction.
            if !self.op_flags.contains(OpFlags::NOINTR) {
                if self.int_flags.contains(IntFlags::TRAP) {
                    self.int_flags.remove(IntFlags::TRAP);
                    self.charge(self.model.cycles().int);
                    if let Err(f) = self.do_interrupt(bus, vector::DEBUG, IntSource::Exception, None)
                    {
                        self.raise_fault(bus, f);
                    }
                    continue;
                }
                if self.int_flags.contains(IntFlags::INTR) && self.intr_enabled() {
                    self.int_flags.remove(IntFlags::INTR);
                    if let Some(vec) = self.intr_vector.take() {
                        self.halted = false;
                        self.charge(self.model.cycles().int);
                        if let Err(f) = self.do_interrupt(bus, vec, IntSource::Hardware, None) {
                            self.raise_fault(bus, f);
                        }
                        continue;
                    }
                }
            }

            if self.halted {
                // HLT yields the rest of the burst to the scheduler
                break;
            }

            let trap_armed = self.ps & flags::TF != 0;

            self.op_ip = self.ip;
            self.op_flags = OpFlags::empty();
            self.charge(self.model.cycles().base);

            match self.step_instruction(bus) {
                Ok(()) => {
                    if trap_armed && self.ps & flags::TF != 0 {
                        // Single-step reports after the instruction retires
                        self.int_flags.insert(IntFlags::TRAP);
                    }
                }
                Err(f) => self.raise_fault(bus, f),
            }
        }

        (burst as i64 - self.n_step_cycles).max(0) as u32
    }

    // ========== State Persistence ==========

    /// Size of a CPU state snapshot in bytes
    pub const SNAPSHOT_SIZE: usize = 352;

    const SNAPSHOT_MAGIC: u32 = 0x5058_3836; // "PX86"

    /// Save CPU state as the flat little-endian record
    pub fn to_bytes(&self) -> [u8; Self::SNAPSHOT_SIZE] {
        fn put16(buf: &mut [u8], pos: &mut usize, v: u16) {
            buf[*pos..*pos + 2].copy_from_slice(&v.to_le_bytes());
            *pos += 2;
        }
        fn put32(buf: &mut [u8], pos: &mut usize, v: u32) {
            buf[*pos..*pos + 4].copy_from_slice(&v.to_le_bytes());
            *pos += 4;
        }
        fn put_seg(buf: &mut [u8], pos: &mut usize, s: &SegReg) {
            put16(buf, pos, s.sel);
            put32(buf, pos, s.base);
            put32(buf, pos, s.limit);
            put16(buf, pos, s.acc);
            put16(buf, pos, s.ext);
            buf[*pos] = s.dpl;
            *pos += 1;
            put32(buf, pos, s.desc);
        }

        let mut buf = [0u8; Self::SNAPSHOT_SIZE];
        let mut pos = 0;
        put32(&mut buf, &mut pos, Self::SNAPSHOT_MAGIC);
        put32(&mut buf, &mut pos, self.model.number());
        put32(&mut buf, &mut pos, self.ps);
        put32(&mut buf, &mut pos, self.result_dst);
        put32(&mut buf, &mut pos, self.result_src);
        put32(&mut buf, &mut pos, self.result_arith);
        put32(&mut buf, &mut pos, self.result_logic);
        put32(&mut buf, &mut pos, self.result_type);
        for r in &self.regs {
            put32(&mut buf, &mut pos, *r);
        }
        put32(&mut buf, &mut pos, self.ip);
        for s in &self.segs {
            put_seg(&mut buf, &mut pos, s);
        }
        put_seg(&mut buf, &mut pos, &self.ldt);
        put_seg(&mut buf, &mut pos, &self.tr);
        put32(&mut buf, &mut pos, self.cr0);
        put32(&mut buf, &mut pos, self.cr2);
        put32(&mut buf, &mut pos, self.cr3);
        put32(&mut buf, &mut pos, self.gdt.base);
        put32(&mut buf, &mut pos, self.gdt.limit);
        put32(&mut buf, &mut pos, self.idt.base);
        put32(&mut buf, &mut pos, self.idt.limit);
        for d in &self.dr {
            put32(&mut buf, &mut pos, *d);
        }
        put32(&mut buf, &mut pos, self.int_flags.bits());
        put32(&mut buf, &mut pos, self.op_flags.bits());
        put32(&mut buf, &mut pos, self.op_prefixes.bits());
        put32(&mut buf, &mut pos, self.op_ip);
        put16(&mut buf, &mut pos, self.n_fault as u16);
        buf[pos] = self.cpl;
        pos += 1;
        buf[pos] = self.halted as u8;
        pos += 1;
        buf[pos] = self.seg_override as u8;
        pos += 1;
        match self.intr_vector {
            Some(v) => {
                buf[pos] = 1;
                buf[pos + 1] = v;
            }
            None => {
                buf[pos] = 0;
            }
        }
        pos += 2;
        debug_assert!(pos <= Self::SNAPSHOT_SIZE);
        buf
    }

    /// Restore CPU state from a snapshot record
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<(), SnapshotError> {
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(SnapshotError::Truncated(buf.len()));
        }
        fn get16(buf: &[u8], pos: &mut usize) -> u16 {
            let v = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]);
            *pos += 2;
            v
        }
        fn get32(buf: &[u8], pos: &mut usize) -> u32 {
            let v = u32::from_le_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
            *pos += 4;
            v
        }
        fn get_seg(buf: &[u8], pos: &mut usize) -> SegReg {
            let sel = get16(buf, pos);
            let base = get32(buf, pos);
            let limit = get32(buf, pos);
            let acc = get16(buf, pos);
            let ext = get16(buf, pos);
            let dpl = buf[*pos];
            *pos += 1;
            let desc = get32(buf, pos);
            SegReg {
                sel,
                base,
                limit,
                acc,
                ext,
                dpl,
                desc,
            }
        }

        let mut pos = 0;
        if get32(buf, &mut pos) != Self::SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let model_num = get32(buf, &mut pos);
        self.model =
            CpuModel::from_number(model_num).ok_or(SnapshotError::BadModel(model_num))?;
        self.ps = get32(buf, &mut pos);
        self.result_dst = get32(buf, &mut pos);
        self.result_src = get32(buf, &mut pos);
        self.result_arith = get32(buf, &mut pos);
        self.result_logic = get32(buf, &mut pos);
        self.result_type = get32(buf, &mut pos);
        for r in &mut self.regs {
            *r = get32(buf, &mut pos);
        }
        self.ip = get32(buf, &mut pos);
        for i in 0..6 {
            self.segs[i] = get_seg(buf, &mut pos);
        }
        self.ldt = get_seg(buf, &mut pos);
        self.tr = get_seg(buf, &mut pos);
        self.cr0 = get32(buf, &mut pos);
        self.cr2 = get32(buf, &mut pos);
        self.cr3 = get32(buf, &mut pos);
        self.gdt.base = get32(buf, &mut pos);
        self.gdt.limit = get32(buf, &mut pos);
        self.idt.base = get32(buf, &mut pos);
        self.idt.limit = get32(buf, &mut pos);
        for d in &mut self.dr {
            *d = get32(buf, &mut pos);
        }
        self.int_flags = IntFlags::from_bits_retain(get32(buf, &mut pos));
        self.op_flags = OpFlags::from_bits_retain(get32(buf, &mut pos));
        self.op_prefixes = OpFlags::from_bits_retain(get32(buf, &mut pos));
        self.op_ip = get32(buf, &mut pos);
        self.n_fault = get16(buf, &mut pos) as i16;
        self.cpl = buf[pos];
        pos += 1;
        self.halted = buf[pos] != 0;
        pos += 1;
        self.seg_override = (buf[pos] as usize).min(5);
        pos += 1;
        self.intr_vector = if buf[pos] != 0 {
            Some(buf[pos + 1])
        } else {
            None
        };
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CpuModel::I80286)
    }
}
