//! x86 CPU tests
//!
//! Test suite for the CPU core, organized into:
//! - instructions.rs: instruction-level tests in real mode (ALU, flags,
//!   stack, strings, control transfers, faults)
//! - modes.rs: protected-mode behavior (descriptor loads, privilege
//!   checks, gates, task switching, paging)
//! - parity.rs: property tests for the lazy flag engine against the
//!   reference Intel formulas

use super::*;
use crate::bus::Bus;

mod modes;
mod parity;

/// Build a real-mode machine with `code` assembled at CS:0.
///
/// CS = 0x0100 (code at linear 0x1000), DS = ES = 0x0200 (data at linear
/// 0x2000), SS = 0x0300 with SP = 0x1000 (stack top at linear 0x4000).
pub(super) fn machine(model: CpuModel, code: &[u8]) -> (Cpu, Bus) {
    let mut cpu = Cpu::new(model);
    let mut bus = Bus::new(model.default_mem_size(), model.bus_mask());
    cpu.load_seg_real(CS, 0x0100);
    cpu.load_seg_real(DS, 0x0200);
    cpu.load_seg_real(ES, 0x0200);
    cpu.load_seg_real(SS, 0x0300);
    cpu.regs[4] = 0x1000;
    cpu.ip = 0;
    bus.load_image(0x1000, code).unwrap();
    (cpu, bus)
}

/// Execute one instruction
pub(super) fn step(cpu: &mut Cpu, bus: &mut Bus) {
    cpu.step_cpu(bus, 1);
}

/// Execute `n` instructions
pub(super) fn run(cpu: &mut Cpu, bus: &mut Bus, n: usize) {
    for _ in 0..n {
        cpu.step_cpu(bus, 1);
    }
}

/// Assert the six arithmetic flags with detailed output
#[track_caller]
pub(super) fn assert_arith_flags(
    cpu: &Cpu,
    cf: bool,
    of: bool,
    sf: bool,
    zf: bool,
    af: bool,
    pf: bool,
    context: &str,
) {
    let actual = (
        cpu.get_cf(),
        cpu.get_of(),
        cpu.get_sf(),
        cpu.get_zf(),
        cpu.get_af(),
        cpu.get_pf(),
    );
    let expected = (cf, of, sf, zf, af, pf);
    assert_eq!(
        actual, expected,
        "{}: flags mismatch (CF, OF, SF, ZF, AF, PF): got {:?}, want {:?}",
        context, actual, expected
    );
}
