//! Task State Segment switching
//!
//! A task switch is triggered by a far JMP/CALL to a TSS descriptor or task
//! gate, by an interrupt through a task gate, or by IRET with NT set. The
//! outgoing machine state is written to the current TSS, the incoming state
//! is read from the new one, and the busy bits, back-link and NT flag are
//! maintained according to how the switch was initiated.

use log::debug;

use super::faults::Fault;
use super::flags;
use super::segments::{desc, Descriptor, SegLoad, CS, DS, ES, FS, GS, SS};
use super::Cpu;
use crate::bus::Bus;

// 80286 TSS field offsets
const TSS286_BACKLINK: u32 = 0x00;
const TSS286_SP0: u32 = 0x02;
const TSS286_IP: u32 = 0x0E;
const TSS286_FLAGS: u32 = 0x10;
const TSS286_REGS: u32 = 0x12;
const TSS286_ES: u32 = 0x22;
const TSS286_CS: u32 = 0x24;
const TSS286_SS: u32 = 0x26;
const TSS286_DS: u32 = 0x28;
const TSS286_LDT: u32 = 0x2A;
/// Minimum limit of a valid 286 TSS
const TSS286_MIN_LIMIT: u32 = 0x2B;

// 80386 TSS field offsets
const TSS386_BACKLINK: u32 = 0x00;
const TSS386_ESP0: u32 = 0x04;
const TSS386_CR3: u32 = 0x1C;
const TSS386_EIP: u32 = 0x20;
const TSS386_EFLAGS: u32 = 0x24;
const TSS386_REGS: u32 = 0x28;
const TSS386_ES: u32 = 0x48;
const TSS386_CS: u32 = 0x4C;
const TSS386_SS: u32 = 0x50;
const TSS386_DS: u32 = 0x54;
const TSS386_FS: u32 = 0x58;
const TSS386_GS: u32 = 0x5C;
const TSS386_LDT: u32 = 0x60;
/// Minimum limit of a valid 386 TSS
const TSS386_MIN_LIMIT: u32 = 0x67;

/// How a task switch was initiated. Controls busy-bit handling and whether
/// the new task is linked back to the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TaskSource {
    /// Far JMP: old task unbusied, no back-link
    Jump,
    /// Far CALL or interrupt: tasks nest; back-link and NT are set
    CallOrInt,
    /// IRET with NT: unwinding a nested task
    Iret,
}

impl Cpu {
    /// Whether the loaded TSS uses the 386 layout
    fn tr_is_386(&self) -> bool {
        matches!(
            ((self.tr.acc >> 8) as u8) & desc::TYPE_MASK & !desc::TSS_BUSY,
            desc::SYS_TSS386
        )
    }

    /// Read the inner stack pointer (SS:SP) for a privilege level from the
    /// current TSS.
    pub(super) fn tss_stack(&mut self, bus: &mut Bus, cpl: u8) -> Result<(u16, u32), Fault> {
        if !self.tr.present() {
            return Err(Fault::InvalidTss(self.tr.sel & !3));
        }
        if self.tr_is_386() {
            let off = TSS386_ESP0 + (cpl as u32) * 8;
            if off + 5 > self.tr.limit {
                return Err(Fault::InvalidTss(self.tr.sel & !3));
            }
            let sp = self.sys_read_dword(bus, self.tr.base.wrapping_add(off))?;
            let ss = self.sys_read_word(bus, self.tr.base.wrapping_add(off + 4))?;
            Ok((ss, sp))
        } else {
            let off = TSS286_SP0 + (cpl as u32) * 4;
            if off + 3 > self.tr.limit {
                return Err(Fault::InvalidTss(self.tr.sel & !3));
            }
            let sp = self.sys_read_word(bus, self.tr.base.wrapping_add(off))?;
            let ss = self.sys_read_word(bus, self.tr.base.wrapping_add(off + 2))?;
            Ok((ss, sp as u32))
        }
    }

    /// Interrupt through a task gate: switch to the gate's TSS, then push
    /// the error code (if any) on the incoming task's stack.
    pub(super) fn task_gate_dispatch(
        &mut self,
        bus: &mut Bus,
        tss_sel: u16,
        err: Option<u32>,
    ) -> Result<(), Fault> {
        if tss_sel & 4 != 0 || tss_sel & !3 == 0 {
            return Err(Fault::InvalidTss(tss_sel & !3));
        }
        let d = self.fetch_descriptor(bus, tss_sel)?;
        self.task_switch(bus, &d, TaskSource::CallOrInt)?;
        if let Some(code) = err {
            if self.tr_is_386() {
                self.push_dword(bus, code)?;
            } else {
                self.push_word(bus, code as u16)?;
            }
        }
        Ok(())
    }

    /// IRET with NT set: resume the task named by the current TSS's
    /// back-link.
    pub(super) fn task_return(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if !self.tr.present() {
            return Err(Fault::InvalidTss(self.tr.sel & !3));
        }
        let back = self.sys_read_word(bus, self.tr.base)?;
        if back & 4 != 0 || back & !3 == 0 {
            return Err(Fault::InvalidTss(back & !3));
        }
        let d = self.fetch_descriptor(bus, back)?;
        self.task_switch(bus, &d, TaskSource::Iret)
    }

    /// Switch tasks: save the outgoing state into the old TSS, then load
    /// the incoming task from `nd`.
    pub(super) fn task_switch(
        &mut self,
        bus: &mut Bus,
        nd: &Descriptor,
        source: TaskSource,
    ) -> Result<(), Fault> {
        let sel = nd.sel;
        let new_386 = match nd.typ() {
            desc::SYS_TSS286 | desc::SYS_TSS286_BUSY => false,
            desc::SYS_TSS386 | desc::SYS_TSS386_BUSY => true,
            _ => return Err(Fault::GeneralProtection(sel & !3)),
        };
        let busy = nd.typ() & desc::TSS_BUSY != 0;
        match source {
            // An incoming task must not already be running...
            TaskSource::Jump | TaskSource::CallOrInt => {
                if busy {
                    return Err(Fault::GeneralProtection(sel & !3));
                }
            }
            // ...except when unwinding to it, where busy proves the link
            TaskSource::Iret => {
                if !busy {
                    return Err(Fault::InvalidTss(sel & !3));
                }
            }
        }
        if !nd.present() {
            return Err(Fault::NotPresent(sel & !3));
        }
        let min_limit = if new_386 { TSS386_MIN_LIMIT } else { TSS286_MIN_LIMIT };
        if nd.limit(self.model) < min_limit {
            return Err(Fault::InvalidTss(sel & !3));
        }

        debug!(
            "task switch {:04X} -> {:04X} ({:?})",
            self.tr.sel, sel, source
        );

        // 1. Save the outgoing state into the old TSS
        let old_base = self.tr.base;
        let old_386 = self.tr_is_386();
        let mut old_ps = self.get_ps();
        if source == TaskSource::Iret {
            old_ps &= !flags::NT;
        }
        if old_386 {
            self.sys_write_dword(bus, old_base + TSS386_CR3, self.cr3)?;
            self.sys_write_dword(bus, old_base + TSS386_EIP, self.ip)?;
            self.sys_write_dword(bus, old_base + TSS386_EFLAGS, old_ps)?;
            let regs_snapshot = self.regs;
            for (i, r) in regs_snapshot.iter().enumerate() {
                self.sys_write_dword(bus, old_base + TSS386_REGS + (i as u32) * 4, *r)?;
            }
            self.sys_write_word(bus, old_base + TSS386_ES, self.segs[ES].sel)?;
            self.sys_write_word(bus, old_base + TSS386_CS, self.segs[CS].sel)?;
            self.sys_write_word(bus, old_base + TSS386_SS, self.segs[SS].sel)?;
            self.sys_write_word(bus, old_base + TSS386_DS, self.segs[DS].sel)?;
            self.sys_write_word(bus, old_base + TSS386_FS, self.segs[FS].sel)?;
            self.sys_write_word(bus, old_base + TSS386_GS, self.segs[GS].sel)?;
            self.sys_write_word(bus, old_base + TSS386_LDT, self.ldt.sel)?;
        } else {
            self.sys_write_word(bus, old_base + TSS286_IP, self.ip as u16)?;
            self.sys_write_word(bus, old_base + TSS286_FLAGS, old_ps as u16)?;
            let regs_snapshot = self.regs;
            for (i, r) in regs_snapshot.iter().enumerate() {
                self.sys_write_word(bus, old_base + TSS286_REGS + (i as u32) * 2, *r as u16)?;
            }
            self.sys_write_word(bus, old_base + TSS286_ES, self.segs[ES].sel)?;
            self.sys_write_word(bus, old_base + TSS286_CS, self.segs[CS].sel)?;
            self.sys_write_word(bus, old_base + TSS286_SS, self.segs[SS].sel)?;
            self.sys_write_word(bus, old_base + TSS286_DS, self.segs[DS].sel)?;
            self.sys_write_word(bus, old_base + TSS286_LDT, self.ldt.sel)?;
        }

        // 2. Busy-bit bookkeeping: JMP and IRET leave the old task; a
        // nesting CALL/INT keeps it busy so the back-link stays valid
        let old_sel = self.tr.sel;
        if source != TaskSource::CallOrInt && self.tr.desc != super::segments::ADDR_INVALID {
            let access = self.sys_read_word(bus, self.tr.desc.wrapping_add(4))?;
            let cleared = ((access >> 8) as u8) & !desc::TSS_BUSY;
            self.sys_write_byte(bus, self.tr.desc.wrapping_add(5), cleared)?;
        }
        if source != TaskSource::Iret {
            self.set_tss_busy(bus, nd, true)?;
        }

        // 3. Make the new TSS current
        let new_base = nd.base(self.model);
        let new_limit = nd.limit(self.model);
        self.tr = super::segments::SegReg {
            sel,
            base: new_base,
            limit: new_limit,
            acc: (nd.acc & 0xFF00) | ((desc::TSS_BUSY as u16) << 8),
            ext: nd.ext & !0xFF00,
            dpl: nd.dpl(),
            desc: nd.addr,
        };

        // 4. Load the incoming state: LDT, CR3, EIP/EFLAGS/regs, then the
        // segment selectors (whose loads may fault inside the new task)
        let new_ldt;
        let new_ps;
        let mut sels = [0u16; 6];
        if new_386 {
            new_ldt = self.sys_read_word(bus, new_base + TSS386_LDT)?;
            self.cr3 = self.sys_read_dword(bus, new_base + TSS386_CR3)?;
            self.ip = self.sys_read_dword(bus, new_base + TSS386_EIP)?;
            new_ps = self.sys_read_dword(bus, new_base + TSS386_EFLAGS)?;
            for i in 0..8 {
                self.regs[i] = self.sys_read_dword(bus, new_base + TSS386_REGS + (i as u32) * 4)?;
            }
            sels[ES] = self.sys_read_word(bus, new_base + TSS386_ES)?;
            sels[CS] = self.sys_read_word(bus, new_base + TSS386_CS)?;
            sels[SS] = self.sys_read_word(bus, new_base + TSS386_SS)?;
            sels[DS] = self.sys_read_word(bus, new_base + TSS386_DS)?;
            sels[FS] = self.sys_read_word(bus, new_base + TSS386_FS)?;
            sels[GS] = self.sys_read_word(bus, new_base + TSS386_GS)?;
        } else {
            new_ldt = self.sys_read_word(bus, new_base + TSS286_LDT)?;
            self.ip = self.sys_read_word(bus, new_base + TSS286_IP)? as u32;
            new_ps = self.sys_read_word(bus, new_base + TSS286_FLAGS)? as u32;
            for i in 0..8 {
                let v = self.sys_read_word(bus, new_base + TSS286_REGS + (i as u32) * 2)?;
                self.regs[i] = v as u32;
            }
            sels[ES] = self.sys_read_word(bus, new_base + TSS286_ES)?;
            sels[CS] = self.sys_read_word(bus, new_base + TSS286_CS)?;
            sels[SS] = self.sys_read_word(bus, new_base + TSS286_SS)?;
            sels[DS] = self.sys_read_word(bus, new_base + TSS286_DS)?;
        }

        self.set_ps(new_ps);
        if source == TaskSource::CallOrInt {
            self.sys_write_word(bus, new_base + if new_386 { TSS386_BACKLINK } else { TSS286_BACKLINK }, old_sel)?;
            self.ps |= flags::NT;
        }

        self.load_seg(bus, 0, new_ldt, SegLoad::Ldt)?;

        // The incoming CPL comes from the saved CS selector's RPL
        self.cpl = (sels[CS] & 3) as u8;
        self.load_seg(bus, CS, sels[CS], SegLoad::Code)?;
        self.load_seg(bus, SS, sels[SS], SegLoad::Stack)?;
        self.load_seg(bus, ES, sels[ES], SegLoad::Data)?;
        self.load_seg(bus, DS, sels[DS], SegLoad::Data)?;
        if new_386 {
            self.load_seg(bus, FS, sels[FS], SegLoad::Data)?;
            self.load_seg(bus, GS, sels[GS], SegLoad::Data)?;
        }
        Ok(())
    }
}
