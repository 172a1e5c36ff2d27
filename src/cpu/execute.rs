//! Instruction dispatch and execution
//!
//! `step_instruction` consumes prefix bytes, then decodes one opcode and
//! executes it. Group opcodes (0x80-0x83, 0xC0/0xC1, 0xD0-0xD3, 0xF6/0xF7,
//! 0xFE/0xFF and the 0x0F map) subdispatch on the ModR/M `reg` field.
//! Architectural faults propagate out as `Err(Fault)` and re-enter the
//! dispatcher through `raise_fault`; no observable state changes before the
//! faulting access.

use super::faults::{Fault, IntSource};
use super::flags;
use super::helpers::{Operand, Width, REG_AX, REG_BP, REG_BX, REG_CX, REG_DI, REG_DX, REG_SI, REG_SP};
use super::segments::{
    desc, DescTableReg, SegLoad, CR0_EM, CR0_MP, CR0_MSW_MASK, CR0_PE, CR0_TS, CS, DS, ES, FS,
    GS, SS,
};
use super::tasks::TaskSource;
use super::{Cpu, CpuModel, IntFlags, OpFlags};
use crate::bus::Bus;

impl Cpu {
    /// Decode prefixes, then execute one instruction.
    pub(super) fn step_instruction(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        loop {
            let opcode = self.fetch_byte(bus)?;
            match opcode {
                0x26 => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = ES;
                }
                0x2E => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = CS;
                }
                0x36 => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = SS;
                }
                0x3E => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = DS;
                }
                0x64 if self.model.is_386() => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = FS;
                }
                0x65 if self.model.is_386() => {
                    self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
                    self.seg_override = GS;
                }
                0x66 if self.model.is_386() => {
                    self.op_flags.insert(OpFlags::DATASIZE | OpFlags::NOINTR);
                }
                0x67 if self.model.is_386() => {
                    self.op_flags.insert(OpFlags::ADDRSIZE | OpFlags::NOINTR);
                }
                0xF0 => {
                    self.op_flags.insert(OpFlags::LOCK | OpFlags::NOINTR);
                }
                0xF2 => {
                    self.op_flags.insert(OpFlags::REPNZ | OpFlags::NOINTR);
                }
                0xF3 => {
                    self.op_flags.insert(OpFlags::REPZ | OpFlags::NOINTR);
                }
                _ => {
                    self.op_prefixes = self.op_flags & OpFlags::PREFIXES;
                    return self.execute(bus, opcode);
                }
            }
        }
    }

    /// Width selected by bit 0 of an opcode
    #[inline]
    fn opcode_width(&self, opcode: u8) -> Width {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            self.op_width()
        }
    }

    /// Execute one non-prefix opcode.
    fn execute(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), Fault> {
        // The 8086/8088 decode 0x60-0x6F as aliases of the short Jcc range
        let opcode = if !self.model.has_186_ops() && (0x60..=0x6F).contains(&opcode) {
            opcode + 0x10
        } else {
            opcode
        };

        match opcode {
            // ========== ALU rm/reg/imm families ==========
            0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25
            | 0x28..=0x2D | 0x30..=0x35 | 0x38..=0x3D => self.alu_family(bus, opcode),

            // ========== Segment register push/pop ==========
            0x06 => self.push_seg(bus, ES),
            0x07 => self.pop_seg(bus, ES),
            0x0E => self.push_seg(bus, CS),
            0x0F => {
                if self.model.has_protected_mode() {
                    self.execute_0f(bus)
                } else if !self.model.has_186_ops() {
                    // POP CS, 8086/8088 only
                    let v = self.pop_wv(bus)? as u16;
                    self.load_seg_real(CS, v);
                    Ok(())
                } else {
                    Err(Fault::Undefined)
                }
            }
            0x16 => self.push_seg(bus, SS),
            0x17 => {
                self.op_flags.insert(OpFlags::NOINTR);
                self.pop_seg(bus, SS)
            }
            0x1E => self.push_seg(bus, DS),
            0x1F => self.pop_seg(bus, DS),

            // ========== BCD adjust ==========
            0x27 => self.op_daa(),
            0x2F => self.op_das(),
            0x37 => self.op_aaa(),
            0x3F => self.op_aas(),

            // ========== INC/DEC r ==========
            0x40..=0x47 => {
                let w = self.op_width();
                let r = opcode & 7;
                let v = self.alu_inc(self.get_reg(r, w), w);
                self.set_reg(r, v, w);
                Ok(())
            }
            0x48..=0x4F => {
                let w = self.op_width();
                let r = opcode & 7;
                let v = self.alu_dec(self.get_reg(r, w), w);
                self.set_reg(r, v, w);
                Ok(())
            }

            // ========== PUSH/POP r ==========
            0x50..=0x57 => {
                self.charge(self.model.cycles().push_pop);
                let r = opcode & 7;
                let w = self.op_width();
                let v = if r as usize == REG_SP
                    && matches!(self.model, CpuModel::I8086 | CpuModel::I8088)
                {
                    // The 8086/8088 push the already-decremented SP
                    self.get_reg(r, w).wrapping_sub(w.bytes()) & w.mask()
                } else {
                    self.get_reg(r, w)
                };
                self.push_wv(bus, v)
            }
            0x58..=0x5F => {
                self.charge(self.model.cycles().push_pop);
                let w = self.op_width();
                let v = self.pop_wv(bus)?;
                self.set_reg(opcode & 7, v, w);
                Ok(())
            }

            // ========== 80186+ block ==========
            0x60 => self.op_pusha(bus),
            0x61 => self.op_popa(bus),
            0x62 => self.op_bound(bus),
            0x63 => self.op_arpl(bus),
            0x68 => {
                let v = self.fetch_wv(bus)?;
                self.push_wv(bus, v)
            }
            0x69 => {
                let w = self.op_width();
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let a = self.read_op(bus, op, w)?;
                let b = self.fetch_wv(bus)?;
                let v = self.alu_imul_trunc(a, b, w);
                self.set_reg(reg, v, w);
                Ok(())
            }
            0x6A => {
                let v = self.fetch_byte(bus)? as i8 as i32 as u32;
                self.push_wv(bus, v)
            }
            0x6B => {
                let w = self.op_width();
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let a = self.read_op(bus, op, w)?;
                let b = self.fetch_byte(bus)? as i8 as i32 as u32;
                let v = self.alu_imul_trunc(a, b, w);
                self.set_reg(reg, v, w);
                Ok(())
            }
            0x6C..=0x6F => self.op_string(bus, opcode),

            // ========== Jcc short ==========
            0x70..=0x7F => {
                let rel = self.fetch_byte(bus)? as i8 as i32;
                if self.test_cc(opcode & 0x0F) {
                    self.charge(self.model.cycles().jcc_taken);
                    self.jump_relative(rel);
                }
                Ok(())
            }

            // ========== Group 1: ALU rm, imm ==========
            0x80..=0x83 => self.group1(bus, opcode),

            // ========== TEST/XCHG/MOV/LEA ==========
            0x84 | 0x85 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let a = self.read_op(bus, op, w)?;
                self.alu_test(a, self.get_reg(reg, w), w);
                Ok(())
            }
            0x86 | 0x87 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let a = self.read_op(bus, op, w)?;
                let b = self.get_reg(reg, w);
                self.write_op(bus, op, b, w)?;
                self.set_reg(reg, a, w);
                Ok(())
            }
            0x88 | 0x89 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                self.write_op(bus, op, self.get_reg(reg, w), w)
            }
            0x8A | 0x8B => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let v = self.read_op(bus, op, w)?;
                self.set_reg(reg, v, w);
                Ok(())
            }
            0x8C => {
                // MOV rm, sreg: memory stores are always 16-bit
                let m = self.fetch_byte(bus)?;
                let sreg = ((m >> 3) & 7) as usize;
                if sreg > GS || (sreg > DS && !self.model.is_386()) {
                    return Err(Fault::Undefined);
                }
                let op = self.decode_modrm(bus, m)?;
                let sel = self.segs[sreg].sel;
                match op {
                    Operand::Reg(r) => {
                        self.set_reg(r, sel as u32, self.op_width());
                        Ok(())
                    }
                    _ => self.write_op(bus, op, sel as u32, Width::Word),
                }
            }
            0x8D => {
                // LEA: the undecorated effective address; a register operand
                // has none and is undefined
                let w = self.op_width();
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                match self.decode_modrm(bus, m)? {
                    Operand::Mem { off, .. } => {
                        self.set_reg(reg, off & w.mask(), w);
                        Ok(())
                    }
                    Operand::Reg(_) => Err(Fault::Undefined),
                }
            }
            0x8E => {
                // MOV sreg, rm
                let m = self.fetch_byte(bus)?;
                let sreg = ((m >> 3) & 7) as usize;
                if sreg == CS || sreg > GS || (sreg > DS && !self.model.is_386()) {
                    return Err(Fault::Undefined);
                }
                let op = self.decode_modrm(bus, m)?;
                let sel = self.read_op(bus, op, Width::Word)? as u16;
                let kind = if sreg == SS {
                    self.op_flags.insert(OpFlags::NOINTR);
                    SegLoad::Stack
                } else {
                    SegLoad::Data
                };
                self.charge(self.model.cycles().seg_load);
                self.load_seg(bus, sreg, sel, kind)
            }
            0x8F => {
                // POP rm
                self.charge(self.model.cycles().push_pop);
                let w = self.op_width();
                let v = self.pop_wv(bus)?;
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                self.write_op(bus, op, v, w)
            }

            // ========== XCHG acc / misc transfers ==========
            0x90 => Ok(()), // NOP (XCHG AX,AX)
            0x91..=0x97 => {
                let w = self.op_width();
                let r = opcode & 7;
                let a = self.get_reg(REG_AX as u8, w);
                let b = self.get_reg(r, w);
                self.set_reg(0, b, w);
                self.set_reg(r, a, w);
                Ok(())
            }
            0x98 => {
                // CBW / CWDE
                if self.data_32() {
                    let v = self.get_reg16(0) as i16 as i32 as u32;
                    self.set_reg32(0, v);
                } else {
                    let v = self.get_reg8(0) as i8 as i16;
                    self.set_reg16(0, v as u16);
                }
                Ok(())
            }
            0x99 => {
                // CWD / CDQ
                if self.data_32() {
                    let fill = if self.get_reg32(0) & 0x8000_0000 != 0 {
                        0xFFFF_FFFF
                    } else {
                        0
                    };
                    self.set_reg32(2, fill);
                } else {
                    let fill = if self.get_reg16(0) & 0x8000 != 0 { 0xFFFF } else { 0 };
                    self.set_reg16(2, fill);
                }
                Ok(())
            }
            0x9A => {
                // CALL far ptr16:16/32
                let off = self.fetch_wv(bus)?;
                let sel = self.fetch_word(bus)?;
                self.far_transfer(bus, sel, off, true)
            }
            0x9B => {
                // WAIT: trap to the exception handler when a coprocessor
                // context switch is pending
                if self.cr0 & CR0_MP != 0 && self.cr0 & CR0_TS != 0 {
                    return Err(Fault::NoDevice);
                }
                Ok(())
            }
            0x9C => {
                self.charge(self.model.cycles().push_pop);
                let ps = self.get_ps();
                self.push_wv(bus, ps)
            }
            0x9D => {
                self.charge(self.model.cycles().push_pop);
                let v = self.pop_wv(bus)?;
                let d32 = self.data_32();
                self.write_ps_checked(v, d32, self.cpl);
                Ok(())
            }
            0x9E => {
                // SAHF
                let ah = self.get_reg8(4) as u32;
                let keep = !(flags::CF | flags::PF | flags::AF | flags::ZF | flags::SF);
                let ps = (self.get_ps() & keep) | (ah & !keep);
                self.set_ps(ps);
                Ok(())
            }
            0x9F => {
                // LAHF
                let v = (self.get_ps() & 0xFF) as u8;
                self.set_reg8(4, v);
                Ok(())
            }

            // ========== MOV accumulator <-> moffs ==========
            0xA0..=0xA3 => {
                let w = self.opcode_width(opcode);
                let off = if self.addr_32() {
                    self.fetch_dword(bus)?
                } else {
                    self.fetch_word(bus)? as u32
                };
                let seg = if self.op_flags.contains(OpFlags::SEG) {
                    self.seg_override
                } else {
                    DS
                };
                if opcode < 0xA2 {
                    let v = match w {
                        Width::Byte => self.read_seg_byte(bus, seg, off)? as u32,
                        Width::Word => self.read_seg_word(bus, seg, off)? as u32,
                        Width::Dword => self.read_seg_dword(bus, seg, off)?,
                    };
                    self.set_reg(REG_AX as u8, v, w);
                } else {
                    let v = self.get_reg(REG_AX as u8, w);
                    match w {
                        Width::Byte => self.write_seg_byte(bus, seg, off, v as u8)?,
                        Width::Word => self.write_seg_word(bus, seg, off, v as u16)?,
                        Width::Dword => self.write_seg_dword(bus, seg, off, v)?,
                    }
                }
                Ok(())
            }

            // ========== String operations ==========
            0xA4..=0xA7 | 0xAA..=0xAF => self.op_string(bus, opcode),

            0xA8 | 0xA9 => {
                let w = self.opcode_width(opcode);
                let imm = self.fetch_width(bus, w)?;
                self.alu_test(self.get_reg(REG_AX as u8, w), imm, w);
                Ok(())
            }

            // ========== MOV r, imm ==========
            0xB0..=0xB7 => {
                let v = self.fetch_byte(bus)?;
                self.set_reg8(opcode & 7, v);
                Ok(())
            }
            0xB8..=0xBF => {
                let w = self.op_width();
                let v = self.fetch_wv(bus)?;
                self.set_reg(opcode & 7, v, w);
                Ok(())
            }

            // ========== Shift groups ==========
            0xC0 | 0xC1 if self.model.has_186_ops() => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                let count = self.fetch_byte(bus)?;
                self.group2(bus, m, op, count, w)
            }
            0xD0 | 0xD1 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                self.group2(bus, m, op, 1, w)
            }
            0xD2 | 0xD3 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                let count = self.get_reg8(1);
                self.group2(bus, m, op, count, w)
            }

            // ========== Near/far returns, MOV imm, frames ==========
            0xC2 => {
                let n = self.fetch_word(bus)? as u32;
                self.op_ret_near(bus, n)
            }
            0xC3 => self.op_ret_near(bus, 0),
            0xC4 => self.op_load_far_pair(bus, ES),
            0xC5 => self.op_load_far_pair(bus, DS),
            0xC6 | 0xC7 => {
                let w = self.opcode_width(opcode);
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                let v = self.fetch_width(bus, w)?;
                self.write_op(bus, op, v, w)
            }
            0xC8 if self.model.has_186_ops() => self.op_enter(bus),
            0xC9 if self.model.has_186_ops() => self.op_leave(bus),
            0xCA => {
                let n = self.fetch_word(bus)? as u32;
                self.op_ret_far(bus, n)
            }
            0xCB => self.op_ret_far(bus, 0),

            // ========== Software interrupts ==========
            0xCC => {
                self.charge(self.model.cycles().int);
                self.do_interrupt(bus, super::faults::vector::BREAKPOINT, IntSource::Software, None)
            }
            0xCD => {
                let vec = self.fetch_byte(bus)?;
                self.charge(self.model.cycles().int);
                self.do_interrupt(bus, vec, IntSource::Software, None)
            }
            0xCE => {
                if self.get_of() {
                    self.charge(self.model.cycles().int);
                    self.do_interrupt(bus, super::faults::vector::OVERFLOW, IntSource::Software, None)
                } else {
                    Ok(())
                }
            }
            0xCF => {
                self.charge(self.model.cycles().iret);
                self.op_iret(bus)
            }

            // ========== BCD multiply/divide, XLAT ==========
            0xD4 => self.op_aam(bus),
            0xD5 => self.op_aad(bus),
            0xD6 => Err(Fault::Undefined),
            0xD7 => {
                // XLAT: AL = [BX + AL]
                let seg = if self.op_flags.contains(OpFlags::SEG) {
                    self.seg_override
                } else {
                    DS
                };
                let off = self
                    .get_index(REG_BX)
                    .wrapping_add(self.get_reg8(0) as u32)
                    & self.addr_mask();
                let v = self.read_seg_byte(bus, seg, off)?;
                self.set_reg8(0, v);
                Ok(())
            }

            // ========== x87 escape range ==========
            0xD8..=0xDF => {
                // No coprocessor numerics; fault when trapped, else consume
                // the ModR/M and carry on
                if self.cr0 & (CR0_EM | CR0_TS) != 0 && self.model.has_protected_mode() {
                    return Err(Fault::NoDevice);
                }
                let m = self.fetch_byte(bus)?;
                let _ = self.decode_modrm(bus, m)?;
                Ok(())
            }

            // ========== Loops and port I/O ==========
            0xE0..=0xE2 => {
                let rel = self.fetch_byte(bus)? as i8 as i32;
                let cx = self.get_index(REG_CX).wrapping_sub(1) & self.addr_mask();
                self.set_index(REG_CX, cx);
                let go = cx != 0
                    && match opcode {
                        0xE0 => !self.get_zf(),
                        0xE1 => self.get_zf(),
                        _ => true,
                    };
                if go {
                    self.charge(self.model.cycles().jcc_taken);
                    self.jump_relative(rel);
                }
                Ok(())
            }
            0xE3 => {
                let rel = self.fetch_byte(bus)? as i8 as i32;
                if self.get_index(REG_CX) == 0 {
                    self.charge(self.model.cycles().jcc_taken);
                    self.jump_relative(rel);
                }
                Ok(())
            }
            0xE4 | 0xE5 => {
                let w = self.opcode_width(opcode);
                let port = self.fetch_byte(bus)? as u16;
                self.check_io()?;
                self.charge(self.model.cycles().io);
                let v = bus.port_read(port, w.bytes() as u8);
                self.set_reg(REG_AX as u8, v, w);
                Ok(())
            }
            0xE6 | 0xE7 => {
                let w = self.opcode_width(opcode);
                let port = self.fetch_byte(bus)? as u16;
                self.check_io()?;
                self.charge(self.model.cycles().io);
                bus.port_write(port, w.bytes() as u8, self.get_reg(REG_AX as u8, w));
                Ok(())
            }
            0xE8 => {
                // CALL rel16/32
                self.charge(self.model.cycles().transfer_near);
                let rel = self.fetch_rel_wv(bus)?;
                self.push_wv(bus, self.ip)?;
                self.jump_relative(rel);
                Ok(())
            }
            0xE9 => {
                let rel = self.fetch_rel_wv(bus)?;
                self.jump_relative(rel);
                Ok(())
            }
            0xEA => {
                // JMP far ptr16:16/32
                let off = self.fetch_wv(bus)?;
                let sel = self.fetch_word(bus)?;
                self.far_transfer(bus, sel, off, false)
            }
            0xEB => {
                let rel = self.fetch_byte(bus)? as i8 as i32;
                self.jump_relative(rel);
                Ok(())
            }
            0xEC | 0xED => {
                let w = self.opcode_width(opcode);
                self.check_io()?;
                self.charge(self.model.cycles().io);
                let port = self.get_reg16(REG_DX as u8);
                let v = bus.port_read(port, w.bytes() as u8);
                self.set_reg(REG_AX as u8, v, w);
                Ok(())
            }
            0xEE | 0xEF => {
                let w = self.opcode_width(opcode);
                self.check_io()?;
                self.charge(self.model.cycles().io);
                let port = self.get_reg16(REG_DX as u8);
                bus.port_write(port, w.bytes() as u8, self.get_reg(REG_AX as u8, w));
                Ok(())
            }

            // ========== Flag and CPU control ==========
            0xF1 => Err(Fault::Undefined),
            0xF4 => {
                // HLT
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                self.halted = true;
                Ok(())
            }
            0xF5 => {
                let c = self.get_cf();
                self.set_cf(!c);
                Ok(())
            }
            0xF6 | 0xF7 => self.group3(bus, opcode),
            0xF8 => {
                self.set_cf(false);
                Ok(())
            }
            0xF9 => {
                self.set_cf(true);
                Ok(())
            }
            0xFA => {
                self.check_iopl()?;
                self.ps &= !flags::IF;
                Ok(())
            }
            0xFB => {
                self.check_iopl()?;
                // Interrupts stay blocked until after the next instruction
                self.ps |= flags::IF;
                self.op_flags.insert(OpFlags::NOINTR);
                Ok(())
            }
            0xFC => {
                self.ps &= !flags::DF;
                Ok(())
            }
            0xFD => {
                self.ps |= flags::DF;
                Ok(())
            }
            0xFE => self.group4(bus),
            0xFF => self.group5(bus),

            _ => Err(Fault::Undefined),
        }
    }

    // ========== Common helpers ==========

    /// Relative displacement at the operand size, sign-extended
    fn fetch_rel_wv(&mut self, bus: &mut Bus) -> Result<i32, Fault> {
        if self.data_32() {
            Ok(self.fetch_dword(bus)? as i32)
        } else {
            Ok(self.fetch_word(bus)? as i16 as i32)
        }
    }

    /// Apply a relative jump at the current operand size
    fn jump_relative(&mut self, rel: i32) {
        let ip = self.ip.wrapping_add(rel as u32);
        self.ip = if self.data_32() { ip } else { ip & 0xFFFF };
    }

    /// Evaluate a condition code nibble
    fn test_cc(&self, cc: u8) -> bool {
        match cc & 0x0F {
            0x0 => self.get_of(),
            0x1 => !self.get_of(),
            0x2 => self.get_cf(),
            0x3 => !self.get_cf(),
            0x4 => self.get_zf(),
            0x5 => !self.get_zf(),
            0x6 => self.get_cf() || self.get_zf(),
            0x7 => !self.get_cf() && !self.get_zf(),
            0x8 => self.get_sf(),
            0x9 => !self.get_sf(),
            0xA => self.get_pf(),
            0xB => !self.get_pf(),
            0xC => self.get_sf() != self.get_of(),
            0xD => self.get_sf() == self.get_of(),
            0xE => self.get_zf() || self.get_sf() != self.get_of(),
            _ => !self.get_zf() && self.get_sf() == self.get_of(),
        }
    }

    /// Index-register value at the current address size
    fn get_index(&self, r: usize) -> u32 {
        self.regs[r] & self.addr_mask()
    }

    /// Replace an index register under the address mask
    fn set_index(&mut self, r: usize, v: u32) {
        let m = self.addr_mask();
        self.regs[r] = (self.regs[r] & !m) | (v & m);
    }

    /// IN/OUT privilege gate
    fn check_io(&self) -> Result<(), Fault> {
        if self.prot_mode() && self.cpl > self.iopl() {
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    /// CLI/STI privilege gate
    fn check_iopl(&self) -> Result<(), Fault> {
        if self.prot_mode() && self.cpl > self.iopl() {
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    fn push_seg(&mut self, bus: &mut Bus, seg: usize) -> Result<(), Fault> {
        self.charge(self.model.cycles().push_pop);
        let sel = self.segs[seg].sel;
        self.push_wv(bus, sel as u32)
    }

    fn pop_seg(&mut self, bus: &mut Bus, seg: usize) -> Result<(), Fault> {
        self.charge(self.model.cycles().push_pop);
        let v = self.pop_wv(bus)? as u16;
        let kind = if seg == SS { SegLoad::Stack } else { SegLoad::Data };
        self.charge(self.model.cycles().seg_load);
        self.load_seg(bus, seg, v, kind)
    }

    // ========== ALU family dispatch (0x00-0x3D) ==========

    fn alu_family(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), Fault> {
        let kind = (opcode >> 3) & 7;
        let form = opcode & 7;
        let w = self.opcode_width(opcode);
        let (target, dst, src) = match form {
            0 | 1 => {
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                (op, self.read_op(bus, op, w)?, self.get_reg(reg, w))
            }
            2 | 3 => {
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                (Operand::Reg(reg), self.get_reg(reg, w), self.read_op(bus, op, w)?)
            }
            _ => (Operand::Reg(0), self.get_reg(REG_AX as u8, w), self.fetch_width(bus, w)?),
        };
        let res = match kind {
            0 => self.alu_add(dst, src, w),
            1 => self.alu_or(dst, src, w),
            2 => self.alu_adc(dst, src, w),
            3 => self.alu_sbb(dst, src, w),
            4 => self.alu_and(dst, src, w),
            5 => self.alu_sub(dst, src, w),
            6 => self.alu_xor(dst, src, w),
            _ => {
                self.alu_cmp(dst, src, w);
                return Ok(());
            }
        };
        self.write_op(bus, target, res, w)
    }

    /// Group 1: ALU rm, imm (0x80-0x83). 0x83 sign-extends a byte.
    fn group1(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), Fault> {
        let w = self.opcode_width(opcode);
        let m = self.fetch_byte(bus)?;
        let kind = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let dst = self.read_op(bus, op, w)?;
        let src = if opcode == 0x83 {
            self.fetch_byte(bus)? as i8 as i32 as u32 & w.mask()
        } else {
            self.fetch_width(bus, w)?
        };
        let res = match kind {
            0 => self.alu_add(dst, src, w),
            1 => self.alu_or(dst, src, w),
            2 => self.alu_adc(dst, src, w),
            3 => self.alu_sbb(dst, src, w),
            4 => self.alu_and(dst, src, w),
            5 => self.alu_sub(dst, src, w),
            6 => self.alu_xor(dst, src, w),
            _ => {
                self.alu_cmp(dst, src, w);
                return Ok(());
            }
        };
        self.write_op(bus, op, res, w)
    }

    /// Group 2: shifts and rotates
    fn group2(
        &mut self,
        bus: &mut Bus,
        modrm: u8,
        op: Operand,
        count: u8,
        w: Width,
    ) -> Result<(), Fault> {
        let dst = self.read_op(bus, op, w)?;
        let res = match (modrm >> 3) & 7 {
            0 => self.alu_rol(dst, count, w),
            1 => self.alu_ror(dst, count, w),
            2 => self.alu_rcl(dst, count, w),
            3 => self.alu_rcr(dst, count, w),
            4 | 6 => self.alu_shl(dst, count, w),
            5 => self.alu_shr(dst, count, w),
            _ => self.alu_sar(dst, count, w),
        };
        self.write_op(bus, op, res, w)
    }

    /// Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
    fn group3(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), Fault> {
        let w = self.opcode_width(opcode);
        let m = self.fetch_byte(bus)?;
        let op = self.decode_modrm(bus, m)?;
        match (m >> 3) & 7 {
            0 | 1 => {
                let dst = self.read_op(bus, op, w)?;
                let imm = self.fetch_width(bus, w)?;
                self.alu_test(dst, imm, w);
                Ok(())
            }
            2 => {
                let v = self.read_op(bus, op, w)?;
                self.write_op(bus, op, !v & w.mask(), w)
            }
            3 => {
                let v = self.read_op(bus, op, w)?;
                let res = self.alu_neg(v, w);
                self.write_op(bus, op, res, w)
            }
            4 => {
                let v = self.read_op(bus, op, w)?;
                self.alu_mul(v, w);
                Ok(())
            }
            5 => {
                let v = self.read_op(bus, op, w)?;
                self.alu_imul(v, w);
                Ok(())
            }
            6 => {
                let v = self.read_op(bus, op, w)?;
                self.alu_div(v, w)
            }
            _ => {
                let v = self.read_op(bus, op, w)?;
                self.alu_idiv(v, w)
            }
        }
    }

    /// Group 4: INC/DEC rm8
    fn group4(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let m = self.fetch_byte(bus)?;
        let op = self.decode_modrm(bus, m)?;
        let v = self.read_op(bus, op, Width::Byte)?;
        match (m >> 3) & 7 {
            0 => {
                let res = self.alu_inc(v, Width::Byte);
                self.write_op(bus, op, res, Width::Byte)
            }
            1 => {
                let res = self.alu_dec(v, Width::Byte);
                self.write_op(bus, op, res, Width::Byte)
            }
            _ => Err(Fault::Undefined),
        }
    }

    /// Group 5: INC/DEC/CALL/CALLF/JMP/JMPF/PUSH rm
    fn group5(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let op = self.decode_modrm(bus, m)?;
        match (m >> 3) & 7 {
            0 => {
                let v = self.read_op(bus, op, w)?;
                let res = self.alu_inc(v, w);
                self.write_op(bus, op, res, w)
            }
            1 => {
                let v = self.read_op(bus, op, w)?;
                let res = self.alu_dec(v, w);
                self.write_op(bus, op, res, w)
            }
            2 => {
                // CALL near rm
                self.charge(self.model.cycles().transfer_near);
                let target = self.read_op(bus, op, w)?;
                self.push_wv(bus, self.ip)?;
                self.ip = target & w.mask();
                Ok(())
            }
            3 => {
                // CALL far m16:16/32
                let (sel, off) = self.read_far_pointer(bus, op, w)?;
                self.far_transfer(bus, sel, off, true)
            }
            4 => {
                // JMP near rm
                let target = self.read_op(bus, op, w)?;
                self.ip = target & w.mask();
                Ok(())
            }
            5 => {
                // JMP far m16:16/32
                let (sel, off) = self.read_far_pointer(bus, op, w)?;
                self.far_transfer(bus, sel, off, false)
            }
            6 => {
                self.charge(self.model.cycles().push_pop);
                let v = self.read_op(bus, op, w)?;
                self.push_wv(bus, v)
            }
            _ => Err(Fault::Undefined),
        }
    }

    /// Read a far pointer operand (offset then selector); requires memory
    fn read_far_pointer(
        &mut self,
        bus: &mut Bus,
        op: Operand,
        w: Width,
    ) -> Result<(u16, u32), Fault> {
        match op {
            Operand::Mem { seg, off } => {
                let target = match w {
                    Width::Dword => self.read_seg_dword(bus, seg, off)?,
                    _ => self.read_seg_word(bus, seg, off)? as u32,
                };
                let sel = self.read_seg_word(bus, seg, off.wrapping_add(w.bytes()))?;
                Ok((sel, target))
            }
            Operand::Reg(_) => Err(Fault::Undefined),
        }
    }

    // ========== BCD Adjust ==========

    fn op_daa(&mut self) -> Result<(), Fault> {
        let old_al = self.get_reg8(0) as u32;
        let old_cf = self.get_cf();
        let mut al = old_al;
        let mut cf = false;
        let af = (old_al & 0x0F) > 9 || self.get_af();
        if af {
            al = al.wrapping_add(6);
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_add(0x60);
            cf = true;
        }
        let al = (al & 0xFF) as u8;
        self.set_reg8(0, al);
        self.set_logic_result(al as u32, flags::result::BYTE);
        self.set_cf(cf);
        self.set_af(af);
        self.set_of(false);
        Ok(())
    }

    fn op_das(&mut self) -> Result<(), Fault> {
        let old_al = self.get_reg8(0) as u32;
        let old_cf = self.get_cf();
        let mut al = old_al;
        let mut cf = false;
        let af = (old_al & 0x0F) > 9 || self.get_af();
        if af {
            al = al.wrapping_sub(6);
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60);
            cf = true;
        }
        let al = (al & 0xFF) as u8;
        self.set_reg8(0, al);
        self.set_logic_result(al as u32, flags::result::BYTE);
        self.set_cf(cf);
        self.set_af(af);
        self.set_of(false);
        Ok(())
    }

    fn op_aaa(&mut self) -> Result<(), Fault> {
        let carry = (self.get_reg8(0) & 0x0F) > 9 || self.get_af();
        if carry {
            let ax = self.get_reg16(0).wrapping_add(0x106);
            self.set_reg16(0, ax);
        }
        self.set_reg8(0, self.get_reg8(0) & 0x0F);
        self.set_af(carry);
        self.set_cf(carry);
        Ok(())
    }

    fn op_aas(&mut self) -> Result<(), Fault> {
        let borrow = (self.get_reg8(0) & 0x0F) > 9 || self.get_af();
        if borrow {
            let ax = self.get_reg16(0).wrapping_sub(6);
            self.set_reg16(0, ax);
            self.set_reg8(4, self.get_reg8(4).wrapping_sub(1));
        }
        self.set_reg8(0, self.get_reg8(0) & 0x0F);
        self.set_af(borrow);
        self.set_cf(borrow);
        Ok(())
    }

    fn op_aam(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let base = self.fetch_byte(bus)?;
        if base == 0 {
            return Err(Fault::DivideError);
        }
        let al = self.get_reg8(0);
        self.set_reg8(4, al / base);
        self.set_reg8(0, al % base);
        self.set_logic_result((al % base) as u32, flags::result::BYTE);
        Ok(())
    }

    fn op_aad(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let base = self.fetch_byte(bus)?;
        let al = self
            .get_reg8(0)
            .wrapping_add(self.get_reg8(4).wrapping_mul(base));
        self.set_reg8(0, al);
        self.set_reg8(4, 0);
        self.set_logic_result(al as u32, flags::result::BYTE);
        Ok(())
    }

    // ========== PUSHA/POPA/BOUND/ARPL ==========

    fn op_pusha(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        self.charge(self.model.cycles().push_pop * 2);
        let w = self.op_width();
        let sp = self.get_reg(REG_SP as u8, w);
        for r in 0..8 {
            let v = if r == REG_SP { sp } else { self.get_reg(r as u8, w) };
            self.push_wv(bus, v)?;
        }
        Ok(())
    }

    fn op_popa(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        self.charge(self.model.cycles().push_pop * 2);
        let w = self.op_width();
        for r in (0..8).rev() {
            let v = self.pop_wv(bus)?;
            if r != REG_SP {
                // The pushed SP image is discarded
                self.set_reg(r as u8, v, w);
            }
        }
        Ok(())
    }

    fn op_bound(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        match self.decode_modrm(bus, m)? {
            Operand::Mem { seg, off } => {
                let idx = w.sext(self.get_reg(reg, w)) as i32;
                let (lower, upper) = match w {
                    Width::Dword => (
                        self.read_seg_dword(bus, seg, off)? as i32,
                        self.read_seg_dword(bus, seg, off.wrapping_add(4))? as i32,
                    ),
                    _ => (
                        self.read_seg_word(bus, seg, off)? as i16 as i32,
                        self.read_seg_word(bus, seg, off.wrapping_add(2))? as i16 as i32,
                    ),
                };
                if idx < lower || idx > upper {
                    return Err(Fault::Bound);
                }
                Ok(())
            }
            Operand::Reg(_) => Err(Fault::Undefined),
        }
    }

    fn op_arpl(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::Undefined);
        }
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let dst = self.read_op(bus, op, Width::Word)? as u16;
        let src = self.get_reg16(reg);
        if (dst & 3) < (src & 3) {
            self.set_zf(true);
            self.write_op(bus, op, ((dst & !3) | (src & 3)) as u32, Width::Word)
        } else {
            self.set_zf(false);
            Ok(())
        }
    }

    // ========== Stack frames ==========

    fn op_enter(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let size = self.fetch_word(bus)? as u32;
        let level = (self.fetch_byte(bus)? & 0x1F) as u32;
        let w = self.op_width();
        self.push_wv(bus, self.get_reg(REG_BP as u8, w))?;
        let frame = self.stack_ptr();
        if level > 0 {
            let mut bp = self.get_reg(REG_BP as u8, w);
            for _ in 1..level {
                bp = bp.wrapping_sub(w.bytes()) & w.mask();
                let link = match w {
                    Width::Dword => self.read_seg_dword(bus, SS, bp)?,
                    _ => self.read_seg_word(bus, SS, bp)? as u32,
                };
                self.push_wv(bus, link)?;
            }
            self.push_wv(bus, frame)?;
        }
        self.set_reg(REG_BP as u8, frame, w);
        self.set_stack_ptr(self.stack_ptr().wrapping_sub(size));
        Ok(())
    }

    fn op_leave(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let w = self.op_width();
        self.set_stack_ptr(self.get_reg(REG_BP as u8, w));
        let bp = self.pop_wv(bus)?;
        self.set_reg(REG_BP as u8, bp, w);
        Ok(())
    }

    // ========== Near/far returns ==========

    fn op_ret_near(&mut self, bus: &mut Bus, release: u32) -> Result<(), Fault> {
        self.charge(self.model.cycles().transfer_near);
        let w = self.op_width();
        let ip = self.pop_wv(bus)?;
        self.ip = ip & w.mask();
        self.set_stack_ptr(self.stack_ptr().wrapping_add(release));
        Ok(())
    }

    fn op_ret_far(&mut self, bus: &mut Bus, release: u32) -> Result<(), Fault> {
        self.charge(self.model.cycles().transfer_far);
        let w = self.op_width();
        let new_ip = self.pop_wv(bus)?;
        let new_cs = self.pop_wv(bus)? as u16;

        if !self.prot_mode() {
            self.load_seg_real(CS, new_cs);
            self.ip = new_ip & w.mask();
            self.set_stack_ptr(self.stack_ptr().wrapping_add(release));
            return Ok(());
        }

        let rpl = (new_cs & 3) as u8;
        if rpl < self.cpl {
            return Err(Fault::GeneralProtection(new_cs & !3));
        }
        if rpl > self.cpl {
            // Outward return: release the caller's parameters from the
            // inner stack, then restore the outer stack and re-check the
            // data segments against the lowered privilege
            self.load_cs_return(bus, new_cs, rpl)?;
            self.set_stack_ptr(self.stack_ptr().wrapping_add(release));
            let new_sp = self.pop_wv(bus)?;
            let new_ss = self.pop_wv(bus)? as u16;
            self.load_ss_checked(bus, new_ss, rpl)?;
            self.set_stack_ptr(new_sp.wrapping_add(release));
            self.zero_data_segs(rpl);
        } else {
            self.load_cs_return(bus, new_cs, self.cpl)?;
            self.set_stack_ptr(self.stack_ptr().wrapping_add(release));
        }
        self.ip = new_ip & w.mask();
        Ok(())
    }

    // ========== LES/LDS/LSS/LFS/LGS ==========

    fn op_load_far_pair(&mut self, bus: &mut Bus, seg: usize) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        match self.decode_modrm(bus, m)? {
            Operand::Mem { seg: mseg, off } => {
                let val = match w {
                    Width::Dword => self.read_seg_dword(bus, mseg, off)?,
                    _ => self.read_seg_word(bus, mseg, off)? as u32,
                };
                let sel = self.read_seg_word(bus, mseg, off.wrapping_add(w.bytes()))?;
                let kind = if seg == SS { SegLoad::Stack } else { SegLoad::Data };
                self.charge(self.model.cycles().seg_load);
                self.load_seg(bus, seg, sel, kind)?;
                self.set_reg(reg, val, w);
                Ok(())
            }
            Operand::Reg(_) => Err(Fault::Undefined),
        }
    }

    // ========== String operations ==========

    /// MOVS/CMPS/STOS/LODS/SCAS/INS/OUTS, with REP/REPZ/REPNZ repetition.
    /// A repeated instruction is interruptible at every iteration: the IP
    /// rewinds to the prefix byte so it resumes after IRET.
    fn op_string(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), Fault> {
        let w = self.opcode_width(opcode);
        let bytes = w.bytes() as i32;
        let delta = if self.ps & flags::DF != 0 { -bytes } else { bytes };
        let rep = self.op_flags.intersects(OpFlags::REPZ | OpFlags::REPNZ);
        let src_seg = if self.op_flags.contains(OpFlags::SEG) {
            self.seg_override
        } else {
            DS
        };
        if (0x6C..=0x6F).contains(&opcode) {
            self.check_io()?;
        }

        loop {
            if rep && self.get_index(REG_CX) == 0 {
                break;
            }

            match opcode {
                0xA4 | 0xA5 => {
                    // MOVS
                    let si = self.get_index(REG_SI);
                    let di = self.get_index(REG_DI);
                    let v = self.read_string(bus, src_seg, si, w)?;
                    self.write_string(bus, ES, di, v, w)?;
                    self.bump_index(REG_SI, delta);
                    self.bump_index(REG_DI, delta);
                }
                0xA6 | 0xA7 => {
                    // CMPS
                    let si = self.get_index(REG_SI);
                    let di = self.get_index(REG_DI);
                    let a = self.read_string(bus, src_seg, si, w)?;
                    let b = self.read_string(bus, ES, di, w)?;
                    self.alu_cmp(a, b, w);
                    self.bump_index(REG_SI, delta);
                    self.bump_index(REG_DI, delta);
                }
                0xAA | 0xAB => {
                    // STOS
                    let di = self.get_index(REG_DI);
                    let v = self.get_reg(REG_AX as u8, w);
                    self.write_string(bus, ES, di, v, w)?;
                    self.bump_index(REG_DI, delta);
                }
                0xAC | 0xAD => {
                    // LODS
                    let si = self.get_index(REG_SI);
                    let v = self.read_string(bus, src_seg, si, w)?;
                    self.set_reg(REG_AX as u8, v, w);
                    self.bump_index(REG_SI, delta);
                }
                0xAE | 0xAF => {
                    // SCAS
                    let di = self.get_index(REG_DI);
                    let v = self.read_string(bus, ES, di, w)?;
                    self.alu_cmp(self.get_reg(REG_AX as u8, w), v, w);
                    self.bump_index(REG_DI, delta);
                }
                0x6C | 0x6D => {
                    // INS
                    let di = self.get_index(REG_DI);
                    let port = self.get_reg16(REG_DX as u8);
                    let v = bus.port_read(port, w.bytes() as u8);
                    self.write_string(bus, ES, di, v, w)?;
                    self.bump_index(REG_DI, delta);
                }
                _ => {
                    // OUTS
                    let si = self.get_index(REG_SI);
                    let v = self.read_string(bus, src_seg, si, w)?;
                    let port = self.get_reg16(REG_DX as u8);
                    bus.port_write(port, w.bytes() as u8, v);
                    self.bump_index(REG_SI, delta);
                }
            }

            if !rep {
                break;
            }

            self.charge(self.model.cycles().string);
            let cx = self.get_index(REG_CX).wrapping_sub(1) & self.addr_mask();
            self.set_index(REG_CX, cx);
            if cx == 0 {
                break;
            }
            if matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF) {
                let zf = self.get_zf();
                if self.op_flags.contains(OpFlags::REPZ) && !zf {
                    break;
                }
                if self.op_flags.contains(OpFlags::REPNZ) && zf {
                    break;
                }
            }
            let pending = (self.int_flags.contains(IntFlags::INTR) && self.intr_enabled())
                || self.int_flags.contains(IntFlags::TRAP);
            if self.n_step_cycles <= 0 || pending {
                // Re-point at the prefix so the instruction resumes later
                self.ip = self.op_ip;
                self.op_flags.remove(OpFlags::NOINTR);
                break;
            }
        }
        Ok(())
    }

    fn read_string(&mut self, bus: &mut Bus, seg: usize, off: u32, w: Width) -> Result<u32, Fault> {
        match w {
            Width::Byte => Ok(self.read_seg_byte(bus, seg, off)? as u32),
            Width::Word => Ok(self.read_seg_word(bus, seg, off)? as u32),
            Width::Dword => self.read_seg_dword(bus, seg, off),
        }
    }

    fn write_string(
        &mut self,
        bus: &mut Bus,
        seg: usize,
        off: u32,
        v: u32,
        w: Width,
    ) -> Result<(), Fault> {
        match w {
            Width::Byte => self.write_seg_byte(bus, seg, off, v as u8),
            Width::Word => self.write_seg_word(bus, seg, off, v as u16),
            Width::Dword => self.write_seg_dword(bus, seg, off, v),
        }
    }

    /// Advance an index register by the string delta
    fn bump_index(&mut self, r: usize, delta: i32) {
        let v = self.get_index(r).wrapping_add(delta as u32);
        self.set_index(r, v);
    }

    // ========== Far control transfers ==========

    /// Far CALL/JMP to selector:offset. In protected mode the destination
    /// may be a code segment, a call gate, a TSS or a task gate; the target
    /// CS is validated before any observable state changes.
    pub(super) fn far_transfer(
        &mut self,
        bus: &mut Bus,
        sel: u16,
        off: u32,
        call: bool,
    ) -> Result<(), Fault> {
        self.charge(self.model.cycles().transfer_far);
        let w = self.op_width();

        if !self.prot_mode() {
            if call {
                self.push_wv(bus, self.segs[CS].sel as u32)?;
                self.push_wv(bus, self.ip)?;
            }
            self.load_seg_real(CS, sel);
            self.ip = off & w.mask();
            return Ok(());
        }

        if sel & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let d = self.fetch_descriptor(bus, sel)?;

        if d.is_seg() {
            let old_cs = self.segs[CS].sel;
            let old_ip = self.ip;
            self.charge(self.model.cycles().seg_load);
            self.load_cs_checked(bus, sel, self.cpl)?;
            if call {
                self.push_wv(bus, old_cs as u32)?;
                self.push_wv(bus, old_ip)?;
            }
            self.ip = off & w.mask();
            return Ok(());
        }

        match d.typ() {
            desc::SYS_GATE_CALL286 | desc::SYS_GATE_CALL386 => {
                self.call_gate_transfer(bus, &d, call)
            }
            desc::SYS_TSS286 | desc::SYS_TSS386 => {
                let rpl = (sel & 3) as u8;
                if d.dpl() < self.cpl || d.dpl() < rpl {
                    return Err(Fault::GeneralProtection(sel & !3));
                }
                self.charge(self.model.cycles().task_switch);
                let source = if call { TaskSource::CallOrInt } else { TaskSource::Jump };
                self.task_switch(bus, &d, source)
            }
            desc::SYS_GATE_TASK => {
                let rpl = (sel & 3) as u8;
                if d.dpl() < self.cpl || d.dpl() < rpl {
                    return Err(Fault::GeneralProtection(sel & !3));
                }
                if !d.present() {
                    return Err(Fault::NotPresent(sel & !3));
                }
                let tss_sel = d.gate_selector();
                if tss_sel & 4 != 0 || tss_sel & !3 == 0 {
                    return Err(Fault::InvalidTss(tss_sel & !3));
                }
                let td = self.fetch_descriptor(bus, tss_sel)?;
                self.charge(self.model.cycles().task_switch);
                let source = if call { TaskSource::CallOrInt } else { TaskSource::Jump };
                self.task_switch(bus, &td, source)
            }
            _ => Err(Fault::GeneralProtection(sel & !3)),
        }
    }

    /// Transfer through a call gate, copying the parameter words across on
    /// an inter-privilege call.
    fn call_gate_transfer(
        &mut self,
        bus: &mut Bus,
        gate: &super::segments::Descriptor,
        call: bool,
    ) -> Result<(), Fault> {
        let gate32 = gate.typ() == desc::SYS_GATE_CALL386;
        let rpl = (gate.sel & 3) as u8;
        if gate.dpl() < self.cpl || gate.dpl() < rpl {
            return Err(Fault::GeneralProtection(gate.sel & !3));
        }
        if !gate.present() {
            return Err(Fault::NotPresent(gate.sel & !3));
        }
        let sel = gate.gate_selector();
        if sel & !3 == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let d = self.fetch_descriptor(bus, sel)?;
        if !d.is_code() || d.dpl() > self.cpl {
            return Err(Fault::GeneralProtection(sel & !3));
        }
        if !d.present() {
            return Err(Fault::NotPresent(sel & !3));
        }
        let off = gate.gate_offset(self.model);
        let old_cs = self.segs[CS].sel;
        let old_ip = self.ip;

        if !d.is_conforming() && d.dpl() < self.cpl {
            if !call {
                // JMP may never lower the privilege level
                return Err(Fault::GeneralProtection(sel & !3));
            }
            let new_cpl = d.dpl();
            let count = (gate.gate_param_count() & 0x1F) as u32;
            let unit = if gate32 { 4u32 } else { 2 };

            // Capture the caller's parameters before the stack goes away
            let mut params = [0u32; 32];
            let old_sp = self.stack_ptr();
            let old_ss = self.segs[SS].sel;
            for (i, slot) in params.iter_mut().take(count as usize).enumerate() {
                let p = old_sp.wrapping_add(i as u32 * unit);
                *slot = if gate32 {
                    self.read_seg_dword(bus, SS, p)?
                } else {
                    self.read_seg_word(bus, SS, p)? as u32
                };
            }

            let (ss_sel, new_sp) = self.tss_stack(bus, new_cpl)?;
            self.charge(self.model.cycles().seg_load * 2);
            self.commit_cs(bus, &d, new_cpl)?;
            self.load_ss_checked(bus, ss_sel, new_cpl)?;
            self.set_stack_ptr(new_sp);

            if gate32 {
                self.push_dword(bus, old_ss as u32)?;
                self.push_dword(bus, old_sp)?;
                for i in (0..count as usize).rev() {
                    self.push_dword(bus, params[i])?;
                }
                self.push_dword(bus, old_cs as u32)?;
                self.push_dword(bus, old_ip)?;
            } else {
                self.push_word(bus, old_ss)?;
                self.push_word(bus, old_sp as u16)?;
                for i in (0..count as usize).rev() {
                    self.push_word(bus, params[i] as u16)?;
                }
                self.push_word(bus, old_cs)?;
                self.push_word(bus, old_ip as u16)?;
            }
        } else {
            self.charge(self.model.cycles().seg_load);
            self.commit_cs(bus, &d, self.cpl)?;
            if call {
                if gate32 {
                    self.push_dword(bus, old_cs as u32)?;
                    self.push_dword(bus, old_ip)?;
                } else {
                    self.push_word(bus, old_cs)?;
                    self.push_word(bus, old_ip as u16)?;
                }
            }
        }

        self.ip = if gate32 { off } else { off & 0xFFFF };
        Ok(())
    }

    // ========== Two-byte opcode map (0x0F, 80286+) ==========

    fn execute_0f(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let op2 = self.fetch_byte(bus)?;
        let is386 = self.model.is_386();
        match op2 {
            0x00 => self.group6(bus),
            0x01 => self.group7(bus),
            0x02 => self.op_lar(bus),
            0x03 => self.op_lsl(bus),
            0x06 => {
                // CLTS
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                self.cr0 &= !CR0_TS;
                Ok(())
            }
            0x20..=0x23 if is386 => self.op_mov_cr_dr(bus, op2),

            0x80..=0x8F if is386 => {
                let rel = self.fetch_rel_wv(bus)?;
                if self.test_cc(op2 & 0x0F) {
                    self.charge(self.model.cycles().jcc_taken);
                    self.jump_relative(rel);
                }
                Ok(())
            }
            0x90..=0x9F if is386 => {
                let cond = self.test_cc(op2 & 0x0F);
                let m = self.fetch_byte(bus)?;
                let op = self.decode_modrm(bus, m)?;
                self.write_op(bus, op, cond as u32, Width::Byte)
            }

            0xA0 if is386 => self.push_seg(bus, FS),
            0xA1 if is386 => self.pop_seg(bus, FS),
            0xA8 if is386 => self.push_seg(bus, GS),
            0xA9 if is386 => self.pop_seg(bus, GS),

            0xA3 | 0xAB | 0xB3 | 0xBB if is386 => self.op_bit_test(bus, op2),
            0xA4 | 0xA5 | 0xAC | 0xAD if is386 => self.op_shift_double(bus, op2),
            0xAF if is386 => {
                let w = self.op_width();
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let a = self.get_reg(reg, w);
                let b = self.read_op(bus, op, w)?;
                let v = self.alu_imul_trunc(a, b, w);
                self.set_reg(reg, v, w);
                Ok(())
            }

            0xB2 if is386 => self.op_load_far_pair(bus, SS),
            0xB4 if is386 => self.op_load_far_pair(bus, FS),
            0xB5 if is386 => self.op_load_far_pair(bus, GS),

            0xB6 | 0xB7 | 0xBE | 0xBF if is386 => {
                // MOVZX/MOVSX
                let w = self.op_width();
                let src_w = if op2 & 1 == 0 { Width::Byte } else { Width::Word };
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let v = self.read_op(bus, op, src_w)?;
                let v = if op2 >= 0xBE {
                    src_w.sext(v) & w.mask()
                } else {
                    v
                };
                self.set_reg(reg, v, w);
                Ok(())
            }

            0xBA if is386 => self.group8(bus),
            0xBC | 0xBD if is386 => {
                // BSF/BSR
                let w = self.op_width();
                let m = self.fetch_byte(bus)?;
                let reg = (m >> 3) & 7;
                let op = self.decode_modrm(bus, m)?;
                let v = self.read_op(bus, op, w)? & w.mask();
                if v == 0 {
                    self.set_zf(true);
                } else {
                    self.set_zf(false);
                    let bit = if op2 == 0xBC {
                        v.trailing_zeros()
                    } else {
                        31 - v.leading_zeros()
                    };
                    self.set_reg(reg, bit, w);
                }
                Ok(())
            }

            _ => Err(Fault::Undefined),
        }
    }

    /// Group 6: SLDT/STR/LLDT/LTR/VERR/VERW (protected mode only)
    fn group6(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::Undefined);
        }
        let m = self.fetch_byte(bus)?;
        let op = self.decode_modrm(bus, m)?;
        match (m >> 3) & 7 {
            0 => self.write_op(bus, op, self.ldt.sel as u32, Width::Word),
            1 => self.write_op(bus, op, self.tr.sel as u32, Width::Word),
            2 => {
                if self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                let sel = self.read_op(bus, op, Width::Word)? as u16;
                self.charge(self.model.cycles().seg_load);
                self.load_seg(bus, 0, sel, SegLoad::Ldt)
            }
            3 => {
                if self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                let sel = self.read_op(bus, op, Width::Word)? as u16;
                self.charge(self.model.cycles().seg_load);
                self.load_seg(bus, 0, sel, SegLoad::Task)
            }
            4 | 5 => {
                let want_write = (m >> 3) & 7 == 5;
                let sel = self.read_op(bus, op, Width::Word)? as u16;
                let ok = match self.load_ver(bus, sel) {
                    Some(d) if d.is_seg() => {
                        let rpl = (sel & 3) as u8;
                        let priv_ok =
                            d.is_conforming() || d.dpl() >= self.cpl.max(rpl);
                        let access_ok = if want_write {
                            d.is_writable_data()
                        } else {
                            d.is_readable()
                        };
                        d.present() && priv_ok && access_ok
                    }
                    _ => false,
                };
                self.set_zf(ok);
                Ok(())
            }
            _ => Err(Fault::Undefined),
        }
    }

    /// Group 7: SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG
    fn group7(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        match reg {
            0 | 1 => {
                // SGDT/SIDT: word limit + dword base. The 80286 forces the
                // sixth byte to 0xFF (PC-DOS 7.0 keys its CPU detection on
                // it); a 16-bit 80386 store clears it instead.
                let table = if reg == 0 { self.gdt } else { self.idt };
                match op {
                    Operand::Mem { seg, off } => {
                        self.write_seg_word(bus, seg, off, table.limit as u16)?;
                        let base = if !self.model.is_386() {
                            table.base & 0x00FF_FFFF | 0xFF00_0000
                        } else if self.data_32() {
                            table.base
                        } else {
                            table.base & 0x00FF_FFFF
                        };
                        self.write_seg_dword(bus, seg, off.wrapping_add(2), base)
                    }
                    Operand::Reg(_) => Err(Fault::Undefined),
                }
            }
            2 | 3 => {
                // LGDT/LIDT
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                match op {
                    Operand::Mem { seg, off } => {
                        let limit = self.read_seg_word(bus, seg, off)? as u32;
                        let mut base = self.read_seg_dword(bus, seg, off.wrapping_add(2))?;
                        if !self.model.is_386() || !self.data_32() {
                            base &= 0x00FF_FFFF;
                        }
                        let table = DescTableReg { base, limit };
                        if reg == 2 {
                            self.gdt = table;
                        } else {
                            self.idt = table;
                        }
                        Ok(())
                    }
                    Operand::Reg(_) => Err(Fault::Undefined),
                }
            }
            4 => self.write_op(bus, op, self.cr0 & 0xFFFF, Width::Word),
            6 => {
                // LMSW: can set PE but never clear it
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                let v = self.read_op(bus, op, Width::Word)? as u32 & CR0_MSW_MASK;
                if v & CR0_PE != 0 {
                    self.set_prot_mode(true);
                }
                self.cr0 = (self.cr0 & !(CR0_MSW_MASK & !CR0_PE)) | (v & !CR0_PE);
                Ok(())
            }
            7 => {
                // INVLPG: no TLB is modelled, so this is only a privilege
                // and operand check
                if !self.model.is_386() {
                    return Err(Fault::Undefined);
                }
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::GeneralProtection(0));
                }
                match op {
                    Operand::Mem { .. } => Ok(()),
                    Operand::Reg(_) => Err(Fault::Undefined),
                }
            }
            _ => Err(Fault::Undefined),
        }
    }

    /// LAR: load access rights, permissively
    fn op_lar(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::Undefined);
        }
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let sel = self.read_op(bus, op, Width::Word)? as u16;
        let rpl = (sel & 3) as u8;
        let ok = match self.load_ver(bus, sel) {
            Some(d) if d.present() => {
                let type_ok = if d.is_seg() {
                    true
                } else {
                    matches!(
                        d.typ(),
                        desc::SYS_TSS286
                            | desc::SYS_LDT
                            | desc::SYS_TSS286_BUSY
                            | desc::SYS_GATE_CALL286
                            | desc::SYS_GATE_TASK
                            | desc::SYS_TSS386
                            | desc::SYS_TSS386_BUSY
                            | desc::SYS_GATE_CALL386
                    )
                };
                // Conforming code ignores the privilege test
                let priv_ok = d.is_conforming() || d.dpl() >= self.cpl.max(rpl);
                if type_ok && priv_ok {
                    let v = if w == Width::Dword {
                        ((d.ext as u32 & 0xF0) << 16) | (d.acc as u32 & 0xFF00)
                    } else {
                        d.acc as u32 & 0xFF00
                    };
                    self.set_reg(reg, v, w);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        self.set_zf(ok);
        Ok(())
    }

    /// LSL: load segment limit, permissively
    fn op_lsl(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::Undefined);
        }
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let sel = self.read_op(bus, op, Width::Word)? as u16;
        let rpl = (sel & 3) as u8;
        let ok = match self.load_ver(bus, sel) {
            Some(d) if d.present() => {
                let type_ok = d.is_seg()
                    || matches!(
                        d.typ(),
                        desc::SYS_TSS286
                            | desc::SYS_LDT
                            | desc::SYS_TSS286_BUSY
                            | desc::SYS_TSS386
                            | desc::SYS_TSS386_BUSY
                    );
                let priv_ok = d.is_conforming() || d.dpl() >= self.cpl.max(rpl);
                if type_ok && priv_ok {
                    self.set_reg(reg, d.limit(self.model) & w.mask(), w);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        self.set_zf(ok);
        Ok(())
    }

    /// MOV to/from CR0/CR2/CR3 and DR0-DR7 (80386)
    fn op_mov_cr_dr(&mut self, bus: &mut Bus, op2: u8) -> Result<(), Fault> {
        let m = self.fetch_byte(bus)?;
        if m >> 6 != 3 {
            return Err(Fault::Undefined);
        }
        if self.prot_mode() && self.cpl != 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let reg = (m >> 3) & 7;
        let rm = m & 7;
        match op2 {
            0x20 => {
                let v = match reg {
                    0 => self.cr0,
                    2 => self.cr2,
                    3 => self.cr3,
                    _ => return Err(Fault::Undefined),
                };
                self.set_reg32(rm, v);
                Ok(())
            }
            0x21 => {
                self.set_reg32(rm, self.dr[(reg & 7) as usize]);
                Ok(())
            }
            0x22 => {
                let v = self.get_reg32(rm);
                match reg {
                    0 => {
                        if (v ^ self.cr0) & CR0_PE != 0 {
                            self.set_prot_mode(v & CR0_PE != 0);
                        }
                        self.cr0 = v;
                    }
                    2 => self.cr2 = v,
                    3 => self.cr3 = v,
                    _ => return Err(Fault::Undefined),
                }
                Ok(())
            }
            _ => {
                self.dr[(reg & 7) as usize] = self.get_reg32(rm);
                Ok(())
            }
        }
    }

    /// BT/BTS/BTR/BTC with a register bit index. Memory forms address the
    /// bit string: the index's sign-extended word/dword part selects the
    /// unit, the remainder the bit.
    fn op_bit_test(&mut self, bus: &mut Bus, op2: u8) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let idx = self.get_reg(reg, w);
        let bits = w.bits();
        let (op, bitpos) = match op {
            Operand::Mem { seg, off } => {
                let sidx = w.sext(idx) as i32;
                let unit = (sidx >> if bits == 16 { 4 } else { 5 }) * w.bytes() as i32;
                let off = off.wrapping_add(unit as u32) & self.addr_mask();
                (Operand::Mem { seg, off }, idx & (bits - 1))
            }
            r => (r, idx & (bits - 1)),
        };
        self.bit_test_finish(bus, op2, op, bitpos, w)
    }

    /// Group 8: BT/BTS/BTR/BTC with an immediate bit index
    fn group8(&mut self, bus: &mut Bus) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let op = self.decode_modrm(bus, m)?;
        let imm = self.fetch_byte(bus)? as u32;
        let bitpos = imm & (w.bits() - 1);
        let kind = match (m >> 3) & 7 {
            4 => 0xA3,
            5 => 0xAB,
            6 => 0xB3,
            7 => 0xBB,
            _ => return Err(Fault::Undefined),
        };
        self.bit_test_finish(bus, kind, op, bitpos, w)
    }

    fn bit_test_finish(
        &mut self,
        bus: &mut Bus,
        kind: u8,
        op: Operand,
        bitpos: u32,
        w: Width,
    ) -> Result<(), Fault> {
        let v = self.read_op(bus, op, w)?;
        let mask = 1u32 << bitpos;
        self.set_cf(v & mask != 0);
        let new = match kind {
            0xAB => v | mask,
            0xB3 => v & !mask,
            0xBB => v ^ mask,
            _ => return Ok(()),
        };
        self.write_op(bus, op, new, w)
    }

    /// SHLD/SHRD double-precision shifts
    fn op_shift_double(&mut self, bus: &mut Bus, op2: u8) -> Result<(), Fault> {
        let w = self.op_width();
        let m = self.fetch_byte(bus)?;
        let reg = (m >> 3) & 7;
        let op = self.decode_modrm(bus, m)?;
        let count = if op2 & 1 == 0 {
            self.fetch_byte(bus)?
        } else {
            self.get_reg8(1)
        } & 0x1F;
        if count == 0 {
            return Ok(());
        }
        self.charge(self.model.cycles().shift);
        let dst = self.read_op(bus, op, w)?;
        let src = self.get_reg(reg, w);
        let bits = w.bits();
        let (res, cf) = if op2 < 0xA8 {
            // SHLD: bits shift in from the source's top. The carry is the
            // last bit shifted out, read in place so no shift ever reaches
            // the full u64 width (count is 1..=31 here).
            let combined = ((dst as u64) << bits) | src as u64;
            (
                (((combined << count) >> bits) as u32) & w.mask(),
                (combined >> (2 * bits - count as u32)) & 1 != 0,
            )
        } else {
            // SHRD: bits shift in from the source's bottom
            let combined = ((src as u64) << bits) | dst as u64;
            (
                ((combined >> count) as u32) & w.mask(),
                (combined >> (count - 1)) & 1 != 0,
            )
        };
        self.set_logic_result(res, w.sign());
        self.set_cf(cf);
        // Defined for count 1: a sign change
        self.set_of((res ^ dst) & w.sign() != 0);
        self.write_op(bus, op, res, w)
    }
}
