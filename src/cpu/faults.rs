//! Exception and interrupt machinery
//!
//! Architectural exceptions travel through helper code as `Result<_, Fault>`
//! and re-enter the dispatcher here. `n_fault` tracks the fault currently
//! in flight: a second fault before the matching IRET escalates to a double
//! fault, and a fault while dispatching the double fault resets the CPU
//! (triple fault). Error codes follow Intel's EXT/IDT/LDT/index encoding.

use log::{trace, warn};

use super::flags;
use super::segments::{desc, CS, SS};
use super::Cpu;
use crate::bus::Bus;

/// Exception vector numbers
pub mod vector {
    pub const DIVIDE: u8 = 0x00;
    pub const DEBUG: u8 = 0x01;
    pub const NMI: u8 = 0x02;
    pub const BREAKPOINT: u8 = 0x03;
    pub const OVERFLOW: u8 = 0x04;
    pub const BOUND: u8 = 0x05;
    pub const UD: u8 = 0x06;
    pub const NM: u8 = 0x07;
    pub const DF: u8 = 0x08;
    pub const TS: u8 = 0x0A;
    pub const NP: u8 = 0x0B;
    pub const SS: u8 = 0x0C;
    pub const GP: u8 = 0x0D;
    pub const PF: u8 = 0x0E;
    pub const MF: u8 = 0x10;
}

/// An architectural exception in flight.
///
/// Selector-qualified variants carry the Intel error code already encoded
/// (selector index with TI, plus the IDT/EXT bits where the raise site knows
/// them); page faults carry the error code and the faulting linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    DivideError,
    Bound,
    Undefined,
    NoDevice,
    Double,
    InvalidTss(u16),
    NotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { code: u32, addr: u32 },
    FpError,
}

impl Fault {
    /// Exception vector this fault dispatches through
    pub fn vector(&self) -> u8 {
        match self {
            Fault::DivideError => vector::DIVIDE,
            Fault::Bound => vector::BOUND,
            Fault::Undefined => vector::UD,
            Fault::NoDevice => vector::NM,
            Fault::Double => vector::DF,
            Fault::InvalidTss(_) => vector::TS,
            Fault::NotPresent(_) => vector::NP,
            Fault::StackFault(_) => vector::SS,
            Fault::GeneralProtection(_) => vector::GP,
            Fault::PageFault { .. } => vector::PF,
            Fault::FpError => vector::MF,
        }
    }

    /// Error code pushed on the handler's stack, for vectors that carry one
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Fault::Double => Some(0),
            Fault::InvalidTss(e) => Some(e as u32),
            Fault::NotPresent(e) => Some(e as u32),
            Fault::StackFault(e) => Some(e as u32),
            Fault::GeneralProtection(e) => Some(e as u32),
            Fault::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// What initiated an interrupt, for privilege and error-code purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IntSource {
    /// External INTR/NMI: no gate DPL check, EXT bit in nested error codes
    Hardware,
    /// INT n / INT3 / INTO: gate DPL must admit CPL
    Software,
    /// Processor exception
    Exception,
}

impl Cpu {
    // ========== Fault Entry ==========

    /// Re-enter the dispatcher for a fault raised mid-instruction.
    /// The instruction pointer is rewound to the start of the faulting
    /// instruction so it can restart after the handler corrects the cause.
    pub(super) fn raise_fault(&mut self, bus: &mut Bus, f: Fault) {
        if let Fault::PageFault { addr, .. } = f {
            self.cr2 = addr;
        }
        self.ip = self.op_ip;
        trace!(
            "fault {:?} at {:04X}:{:08X}",
            f,
            self.segs[CS].sel,
            self.ip
        );

        if self.n_fault < 0 {
            self.n_fault = f.vector() as i16;
            if self
                .do_interrupt(bus, f.vector(), IntSource::Exception, f.error_code())
                .is_err()
            {
                self.escalate_double_fault(bus);
            }
        } else if self.n_fault != vector::DF as i16 {
            self.escalate_double_fault(bus);
        } else {
            self.triple_fault(bus);
        }
    }

    /// Synthesise a double fault (vector 0x08, error code 0).
    fn escalate_double_fault(&mut self, bus: &mut Bus) {
        warn!("double fault");
        self.n_fault = vector::DF as i16;
        if self
            .do_interrupt(bus, vector::DF, IntSource::Exception, Some(0))
            .is_err()
        {
            self.triple_fault(bus);
        }
    }

    /// A fault during double-fault dispatch shuts the machine down.
    fn triple_fault(&mut self, bus: &mut Bus) {
        warn!("triple fault, resetting CPU");
        let _ = bus;
        self.reset_regs();
    }

    // ========== Interrupt Dispatch ==========

    /// Dispatch an interrupt or exception through the IDT (or the real-mode
    /// vector table). Faults raised while dispatching propagate to the
    /// caller; `raise_fault` turns them into double faults.
    pub(super) fn do_interrupt(
        &mut self,
        bus: &mut Bus,
        vec: u8,
        source: IntSource,
        err: Option<u32>,
    ) -> Result<(), Fault> {
        if self.prot_mode() {
            self.interrupt_prot(bus, vec, source, err)
        } else {
            self.interrupt_real(bus, vec)
        }
    }

    /// Real mode: vector table of (offset, segment) pairs at IDT base.
    fn interrupt_real(&mut self, bus: &mut Bus, vec: u8) -> Result<(), Fault> {
        let off = (vec as u32) * 4;
        if off.wrapping_add(3) > self.idt.limit {
            return Err(Fault::GeneralProtection(0));
        }
        let new_ip = self.sys_read_word(bus, self.idt.base.wrapping_add(off))?;
        let new_cs = self.sys_read_word(bus, self.idt.base.wrapping_add(off + 2))?;

        let ps = self.get_ps();
        self.push_word(bus, ps as u16)?;
        self.push_word(bus, self.segs[CS].sel)?;
        self.push_word(bus, self.ip as u16)?;

        self.ps &= !(flags::IF | flags::TF);
        self.load_seg_real(CS, new_cs);
        self.ip = new_ip as u32;
        Ok(())
    }

    /// Protected mode: classify the IDT gate and dispatch through it.
    fn interrupt_prot(
        &mut self,
        bus: &mut Bus,
        vec: u8,
        source: IntSource,
        err: Option<u32>,
    ) -> Result<(), Fault> {
        let ext: u16 = if source == IntSource::Software { 0 } else { 1 };
        let idt_err = ((vec as u16) << 3) | 2 | ext;

        let off = (vec as u32) * 8;
        if off.wrapping_add(7) > self.idt.limit {
            return Err(Fault::GeneralProtection(idt_err));
        }
        let addr = self.idt.base.wrapping_add(off);
        let gate = super::segments::Descriptor {
            sel: vec as u16,
            addr,
            w0: self.sys_read_word(bus, addr)?,
            w1: self.sys_read_word(bus, addr.wrapping_add(2))?,
            acc: self.sys_read_word(bus, addr.wrapping_add(4))?,
            ext: self.sys_read_word(bus, addr.wrapping_add(6))?,
        };

        // Software interrupts may not reach through a more privileged gate
        if source == IntSource::Software && gate.dpl() < self.cpl {
            return Err(Fault::GeneralProtection(((vec as u16) << 3) | 2));
        }
        if !gate.present() {
            return Err(Fault::NotPresent(idt_err));
        }

        match gate.typ() {
            desc::SYS_GATE_TASK => {
                self.task_gate_dispatch(bus, gate.gate_selector(), err)
            }
            desc::SYS_GATE_INT286 | desc::SYS_GATE_TRAP286 | desc::SYS_GATE_INT386
            | desc::SYS_GATE_TRAP386 => {
                let clear_if = matches!(
                    gate.typ(),
                    desc::SYS_GATE_INT286 | desc::SYS_GATE_INT386
                );
                let gate32 = matches!(
                    gate.typ(),
                    desc::SYS_GATE_INT386 | desc::SYS_GATE_TRAP386
                );
                self.interrupt_gate(bus, &gate, gate32, clear_if, ext, err)
            }
            _ => Err(Fault::GeneralProtection(idt_err)),
        }
    }

    /// Transfer through an interrupt or trap gate, switching stacks when
    /// the target code segment is more privileged.
    fn interrupt_gate(
        &mut self,
        bus: &mut Bus,
        gate: &super::segments::Descriptor,
        gate32: bool,
        clear_if: bool,
        ext: u16,
        err: Option<u32>,
    ) -> Result<(), Fault> {
        let sel = gate.gate_selector();
        if sel & !3 == 0 {
            return Err(Fault::GeneralProtection(ext));
        }
        let d = self.fetch_descriptor(bus, sel)?;
        if !d.is_code() || d.dpl() > self.cpl {
            return Err(Fault::GeneralProtection((sel & !3) | ext));
        }
        if !d.present() {
            return Err(Fault::NotPresent((sel & !3) | ext));
        }

        let ps = self.get_ps();
        let old_cs = self.segs[CS].sel;
        let old_ip = self.ip;

        if !d.is_conforming() && d.dpl() < self.cpl {
            // Inter-privilege: pick up the handler's stack from the TSS
            let new_cpl = d.dpl();
            let (ss_sel, new_sp) = self.tss_stack(bus, new_cpl)?;
            let old_ss = self.segs[SS].sel;
            let old_sp = self.stack_ptr();

            self.commit_cs(bus, &d, new_cpl)?;
            self.load_ss_checked(bus, ss_sel, new_cpl)?;
            self.set_stack_ptr(new_sp);

            if gate32 {
                self.push_dword(bus, old_ss as u32)?;
                self.push_dword(bus, old_sp)?;
            } else {
                self.push_word(bus, old_ss)?;
                self.push_word(bus, old_sp as u16)?;
            }
        } else {
            self.commit_cs(bus, &d, self.cpl)?;
        }

        if gate32 {
            self.push_dword(bus, ps)?;
            self.push_dword(bus, old_cs as u32)?;
            self.push_dword(bus, old_ip)?;
            if let Some(code) = err {
                self.push_dword(bus, code)?;
            }
        } else {
            self.push_word(bus, ps as u16)?;
            self.push_word(bus, old_cs)?;
            self.push_word(bus, old_ip as u16)?;
            if let Some(code) = err {
                self.push_word(bus, code as u16)?;
            }
        }

        if clear_if {
            self.ps &= !flags::IF;
        }
        self.ps &= !(flags::TF | flags::NT);
        self.ip = gate.gate_offset(self.model);
        if !gate32 {
            self.ip &= 0xFFFF;
        }
        Ok(())
    }

    // ========== IRET ==========

    /// IRET: return from interrupt. With NT set in protected mode this is a
    /// task switch back through the TSS back-link; otherwise the saved
    /// IP/CS/PS are popped, plus SS:SP on an outward privilege change.
    pub(super) fn op_iret(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if self.prot_mode() && self.ps & flags::NT != 0 {
            self.task_return(bus)?;
            self.n_fault = -1;
            return Ok(());
        }

        let d32 = self.data_32();
        let new_ip;
        let new_cs;
        let new_ps;
        if d32 {
            new_ip = self.pop_dword(bus)?;
            new_cs = self.pop_dword(bus)? as u16;
            new_ps = self.pop_dword(bus)?;
        } else {
            new_ip = self.pop_word(bus)? as u32;
            new_cs = self.pop_word(bus)?;
            new_ps = self.pop_word(bus)? as u32;
        }

        if !self.prot_mode() {
            self.load_seg_real(CS, new_cs);
            self.ip = new_ip;
            if d32 {
                self.set_ps(new_ps);
            } else {
                self.set_ps((self.get_ps() & 0xFFFF_0000) | (new_ps & 0xFFFF));
            }
            self.n_fault = -1;
            return Ok(());
        }

        let entry_cpl = self.cpl;
        let rpl = (new_cs & 3) as u8;
        if rpl < self.cpl {
            return Err(Fault::GeneralProtection(new_cs & !3));
        }
        if rpl > self.cpl {
            // Outward return: the interrupted stack comes back from ours
            let new_sp;
            let new_ss;
            if d32 {
                new_sp = self.pop_dword(bus)?;
                new_ss = self.pop_dword(bus)? as u16;
            } else {
                new_sp = self.pop_word(bus)? as u32;
                new_ss = self.pop_word(bus)?;
            }
            self.load_cs_return(bus, new_cs, rpl)?;
            self.load_ss_checked(bus, new_ss, rpl)?;
            self.set_stack_ptr(new_sp);
            self.zero_data_segs(rpl);
        } else {
            self.load_cs_return(bus, new_cs, self.cpl)?;
        }

        self.ip = if d32 { new_ip } else { new_ip & 0xFFFF };
        self.write_ps_checked(new_ps, d32, entry_cpl);
        self.n_fault = -1;
        Ok(())
    }

    /// CS load for RETF/IRET: the target may be less privileged than the
    /// returner but never more.
    pub(super) fn load_cs_return(&mut self, bus: &mut Bus, sel: u16, cpl: u8) -> Result<(), Fault> {
        if sel & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let d = self.fetch_descriptor(bus, sel)?;
        if !d.is_code() {
            return Err(Fault::GeneralProtection(sel & !3));
        }
        if d.is_conforming() {
            if d.dpl() > cpl {
                return Err(Fault::GeneralProtection(sel & !3));
            }
        } else if d.dpl() != cpl {
            return Err(Fault::GeneralProtection(sel & !3));
        }
        if !d.present() {
            return Err(Fault::NotPresent(sel & !3));
        }
        self.commit_cs(bus, &d, cpl)
    }

    /// Merge a popped status word, honoring the IOPL/IF write rules at the
    /// writer's privilege: IOPL changes require CPL 0, IF changes require
    /// CPL <= IOPL.
    pub(super) fn write_ps_checked(&mut self, value: u32, d32: bool, cpl: u8) {
        let mut keep = 0;
        if self.prot_mode() {
            if cpl > 0 {
                keep |= flags::IOPL;
            }
            if cpl > self.iopl() {
                keep |= flags::IF;
            }
        }
        let old = self.get_ps();
        let mut merged = (old & keep) | (value & !keep);
        if !d32 {
            // 16-bit writes leave the high EFLAGS half alone
            merged = (old & 0xFFFF_0000) | (merged & 0xFFFF);
        }
        self.set_ps(merged);
    }
}
