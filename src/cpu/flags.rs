//! x86 status word (PS/EFLAGS) bits and the lazy flag engine.
//!
//! Arithmetic and logical helpers do not update PS directly. They deposit the
//! operands and result of the last operation into a small cache
//! (`result_dst`, `result_src`, `result_arith`, `result_logic`,
//! `result_type`) and the six arithmetic flags are derived on demand.
//! `result_type` carries the operation width (the sign-bit mask of the
//! operand size) plus a bitmask of which flags the cache currently
//! represents; everything else lives directly in `ps`.

use super::Cpu;

/// Carry flag (bit 0)
pub const CF: u32 = 0x0001;
/// Bit 1 reads as set on every model
pub const BIT1: u32 = 0x0002;
/// Parity flag (bit 2)
pub const PF: u32 = 0x0004;
/// Auxiliary carry flag (bit 4)
pub const AF: u32 = 0x0010;
/// Zero flag (bit 6)
pub const ZF: u32 = 0x0040;
/// Sign flag (bit 7)
pub const SF: u32 = 0x0080;
/// Trap (single-step) flag (bit 8)
pub const TF: u32 = 0x0100;
/// Interrupt enable flag (bit 9)
pub const IF: u32 = 0x0200;
/// Direction flag (bit 10)
pub const DF: u32 = 0x0400;
/// Overflow flag (bit 11)
pub const OF: u32 = 0x0800;
/// I/O privilege level field (bits 12-13, 80286+)
pub const IOPL: u32 = 0x3000;
/// Nested task flag (bit 14, 80286+)
pub const NT: u32 = 0x4000;
/// Bit 15 (reads as set on 8086/8088/80186/80188, clear on 80286+)
pub const BIT15: u32 = 0x8000;
/// Resume flag (bit 16, 80386)
pub const RF: u32 = 0x0001_0000;
/// Virtual-8086 mode flag (bit 17, 80386)
pub const VM: u32 = 0x0002_0000;

/// The six flags the lazy cache can represent
pub const ARITH: u32 = CF | PF | AF | ZF | SF | OF;

/// Number of bits to shift IOPL into place
pub const IOPL_SHIFT: u32 = 12;

/// `result_type` encoding.
///
/// The width component is the sign-bit mask of the operand size; the low six
/// bits (disjoint from every width mask) say which of CF/PF/AF/ZF/SF/OF are
/// currently held by the cache rather than by `ps`.
pub mod result {
    /// Byte-wide result
    pub const BYTE: u32 = 0x80;
    /// Word-wide result
    pub const WORD: u32 = 0x8000;
    /// Dword-wide result
    pub const DWORD: u32 = 0x8000_0000;

    pub const CF: u32 = 0x01;
    pub const PF: u32 = 0x02;
    pub const AF: u32 = 0x04;
    pub const ZF: u32 = 0x08;
    pub const SF: u32 = 0x10;
    pub const OF: u32 = 0x20;

    /// All six cacheable flags
    pub const ALL: u32 = 0x3F;
    /// Everything but CF, for INC/DEC which preserve the carry
    pub const NOTCF: u32 = ALL & !CF;
    /// The flags a logical operation defines from its result
    pub const LOGIC: u32 = PF | AF | ZF | SF;
}

impl Cpu {
    /// Width mask of the cached result (one of BYTE/WORD/DWORD)
    #[inline]
    fn result_size(&self) -> u32 {
        self.result_type & !result::ALL
    }

    // ========== Flag Reads ==========

    /// Check if carry flag is set
    #[inline]
    pub fn get_cf(&self) -> bool {
        if self.result_type & result::CF != 0 {
            let d = self.result_dst;
            let s = self.result_src;
            let a = self.result_arith;
            ((d ^ ((d ^ s) & (s ^ a))) & self.result_size()) != 0
        } else {
            self.ps & CF != 0
        }
    }

    /// Check if parity flag is set (even number of ones in the low byte)
    #[inline]
    pub fn get_pf(&self) -> bool {
        if self.result_type & result::PF != 0 {
            (self.result_logic as u8).count_ones() & 1 == 0
        } else {
            self.ps & PF != 0
        }
    }

    /// Check if auxiliary carry flag is set
    #[inline]
    pub fn get_af(&self) -> bool {
        if self.result_type & result::AF != 0 {
            ((self.result_arith ^ (self.result_dst ^ self.result_src)) & 0x10) != 0
        } else {
            self.ps & AF != 0
        }
    }

    /// Check if zero flag is set
    #[inline]
    pub fn get_zf(&self) -> bool {
        if self.result_type & result::ZF != 0 {
            let size = self.result_size();
            (self.result_logic & ((size - 1) | size)) == 0
        } else {
            self.ps & ZF != 0
        }
    }

    /// Check if sign flag is set
    #[inline]
    pub fn get_sf(&self) -> bool {
        if self.result_type & result::SF != 0 {
            (self.result_logic & self.result_size()) != 0
        } else {
            self.ps & SF != 0
        }
    }

    /// Check if overflow flag is set
    #[inline]
    pub fn get_of(&self) -> bool {
        if self.result_type & result::OF != 0 {
            let d = self.result_dst;
            let s = self.result_src;
            let a = self.result_arith;
            (((d ^ a) & (s ^ a)) & self.result_size()) != 0
        } else {
            self.ps & OF != 0
        }
    }

    // ========== Flag Writes ==========
    // Writing a flag moves it out of the cache and into direct storage.

    /// Set or clear carry flag
    #[inline]
    pub fn set_cf(&mut self, on: bool) {
        self.result_type &= !result::CF;
        if on {
            self.ps |= CF;
        } else {
            self.ps &= !CF;
        }
    }

    /// Set or clear parity flag
    #[inline]
    pub fn set_pf(&mut self, on: bool) {
        self.result_type &= !result::PF;
        if on {
            self.ps |= PF;
        } else {
            self.ps &= !PF;
        }
    }

    /// Set or clear auxiliary carry flag
    #[inline]
    pub fn set_af(&mut self, on: bool) {
        self.result_type &= !result::AF;
        if on {
            self.ps |= AF;
        } else {
            self.ps &= !AF;
        }
    }

    /// Set or clear zero flag
    #[inline]
    pub fn set_zf(&mut self, on: bool) {
        self.result_type &= !result::ZF;
        if on {
            self.ps |= ZF;
        } else {
            self.ps &= !ZF;
        }
    }

    /// Set or clear sign flag
    #[inline]
    pub fn set_sf(&mut self, on: bool) {
        self.result_type &= !result::SF;
        if on {
            self.ps |= SF;
        } else {
            self.ps &= !SF;
        }
    }

    /// Set or clear overflow flag
    #[inline]
    pub fn set_of(&mut self, on: bool) {
        self.result_type &= !result::OF;
        if on {
            self.ps |= OF;
        } else {
            self.ps &= !OF;
        }
    }

    // ========== Cache Management ==========

    /// Materialise every cached flag that the next cache (covering
    /// `new_cached`) will not redefine. Must run before any cache overwrite,
    /// otherwise a preserved flag (e.g. CF across INC) silently changes.
    fn commit_flags(&mut self, new_cached: u32) {
        let lost = (self.result_type & result::ALL) & !new_cached;
        if lost == 0 {
            return;
        }
        if lost & result::CF != 0 {
            let v = self.get_cf();
            self.set_cf(v);
        }
        if lost & result::PF != 0 {
            let v = self.get_pf();
            self.set_pf(v);
        }
        if lost & result::AF != 0 {
            let v = self.get_af();
            self.set_af(v);
        }
        if lost & result::ZF != 0 {
            let v = self.get_zf();
            self.set_zf(v);
        }
        if lost & result::SF != 0 {
            let v = self.get_sf();
            self.set_sf(v);
        }
        if lost & result::OF != 0 {
            let v = self.get_of();
            self.set_of(v);
        }
    }

    /// Record an arithmetic result in the flag cache.
    ///
    /// `rtype` is a width mask ORed with the flags this operation defines.
    /// For subtraction the cached words are adjusted so that the addition
    /// formulas read out borrow/overflow correctly: `dst - src = value`
    /// is cached as the addition `value + src = dst`.
    pub(super) fn set_arith_result(
        &mut self,
        dst: u32,
        src: u32,
        value: u32,
        rtype: u32,
        subtract: bool,
    ) {
        self.commit_flags(rtype & result::ALL);
        if subtract {
            self.result_dst = value;
            self.result_arith = dst;
        } else {
            self.result_dst = dst;
            self.result_arith = value;
        }
        self.result_src = src;
        self.result_logic = value;
        self.result_type = rtype;
    }

    /// Record a logical result in the flag cache. Defines PF/AF/ZF/SF from
    /// the value; the caller sets CF and OF explicitly (normally to zero).
    /// AF is architecturally undefined here and reads as bit 4 of the value.
    pub(super) fn set_logic_result(&mut self, value: u32, size: u32) {
        let rtype = size | result::LOGIC;
        self.commit_flags(rtype & result::ALL);
        self.result_dst = value;
        self.result_src = value;
        self.result_arith = value;
        self.result_logic = value;
        self.result_type = rtype;
    }

    /// Record a rotate result: CF takes the last bit rotated out, OF becomes
    /// CF XOR the new most-significant bit (defined for count 1).
    pub(super) fn set_rotate_result(&mut self, value: u32, carry_out: bool, size: u32) {
        self.set_cf(carry_out);
        let msb = value & size != 0;
        self.set_of(carry_out ^ msb);
    }

    // ========== PS Assembly ==========

    /// Read the full status word: cached flags materialised over the direct
    /// bits, masked and forced per the CPU model.
    pub fn get_ps(&self) -> u32 {
        let mut ps = self.ps & !ARITH;
        if self.get_cf() {
            ps |= CF;
        }
        if self.get_pf() {
            ps |= PF;
        }
        if self.get_af() {
            ps |= AF;
        }
        if self.get_zf() {
            ps |= ZF;
        }
        if self.get_sf() {
            ps |= SF;
        }
        if self.get_of() {
            ps |= OF;
        }
        (ps & self.model.ps_direct()) | self.model.ps_set()
    }

    /// Replace the status word. Every flag becomes directly stored; the
    /// lazy cache is emptied.
    pub fn set_ps(&mut self, value: u32) {
        self.result_type &= !result::ALL;
        self.ps = (value & self.model.ps_direct()) | self.model.ps_set();
    }

    /// Current I/O privilege level field
    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.ps & IOPL) >> IOPL_SHIFT) as u8
    }
}
