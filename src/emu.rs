//! Emulator orchestrator
//!
//! Coordinates the CPU and the bus, owns the machine description, and
//! publishes the hooks an external debugger reads: the execution history
//! ring, register dumps and the flat state snapshot.

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::bus::{Bus, BusError};
use crate::cpu::{segments, Cpu, CpuModel, SnapshotError};

/// Number of entries in the CS:IP/opcode history ring buffer
const HISTORY_SIZE: usize = 64;

/// Host-level failures surfaced to the embedder. Guest-visible exceptions
/// never appear here; they dispatch through the IDT inside the core.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("malformed machine description: {0}")]
    MachineDesc(#[from] serde_json::Error),
    #[error("unknown CPU model {0}")]
    UnknownModel(u32),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("state buffer too small ({0} bytes)")]
    BufferTooSmall(usize),
}

/// The `cpu` component of a machine description
#[derive(Debug, Clone, Deserialize)]
pub struct CpuDesc {
    /// Model number: 8086, 8088, 80186, 80188, 80286 or 80386
    #[serde(default = "default_model")]
    pub model: u32,
    /// Start executing immediately once the machine powers on. Forced
    /// false when the machine is constructed programmatically.
    #[serde(default, rename = "autoStart")]
    pub auto_start: bool,
}

fn default_model() -> u32 {
    80286
}

impl Default for CpuDesc {
    fn default() -> Self {
        Self {
            model: default_model(),
            auto_start: false,
        }
    }
}

/// Machine description document, keyed by component name. Components the
/// core does not own (video, disks, ...) are ignored here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineDesc {
    #[serde(default)]
    pub cpu: CpuDesc,
}

/// Reason the last `run_cycles` stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Completed the requested cycles
    CyclesComplete,
    /// CPU executed HLT and no interrupt is pending
    Halted,
}

/// Single entry in the execution history
#[derive(Clone, Copy, Default)]
struct HistoryEntry {
    cs: u16,
    ip: u32,
    /// Leading code bytes (prefixes included)
    opcode: [u8; 4],
    opcode_len: u8,
}

/// Execution history ring buffer for crash diagnostics
struct ExecutionHistory {
    entries: [HistoryEntry; HISTORY_SIZE],
    write_idx: usize,
    count: usize,
}

impl ExecutionHistory {
    fn new() -> Self {
        Self {
            entries: [HistoryEntry::default(); HISTORY_SIZE],
            write_idx: 0,
            count: 0,
        }
    }

    fn record(&mut self, cs: u16, ip: u32, opcode: [u8; 4], opcode_len: u8) {
        self.entries[self.write_idx] = HistoryEntry {
            cs,
            ip,
            opcode,
            opcode_len,
        };
        self.write_idx = (self.write_idx + 1) % HISTORY_SIZE;
        if self.count < HISTORY_SIZE {
            self.count += 1;
        }
    }

    /// History entries in execution order (oldest to newest)
    fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        let start = if self.count < HISTORY_SIZE {
            0
        } else {
            self.write_idx
        };
        (0..self.count).map(move |i| {
            let idx = (start + i) % HISTORY_SIZE;
            &self.entries[idx]
        })
    }

    fn clear(&mut self) {
        self.write_idx = 0;
        self.count = 0;
    }
}

/// Main emulator state: one CPU on one bus
pub struct Emu {
    cpu: Cpu,
    bus: Bus,
    history: ExecutionHistory,
    last_stop: StopReason,
    total_cycles: u64,
    auto_start: bool,
}

impl Emu {
    /// Create a machine with the given CPU model and its default memory
    pub fn new(model: CpuModel) -> Self {
        Self {
            cpu: Cpu::new(model),
            bus: Bus::new(model.default_mem_size(), model.bus_mask()),
            history: ExecutionHistory::new(),
            last_stop: StopReason::CyclesComplete,
            total_cycles: 0,
            auto_start: false,
        }
    }

    /// Create a machine from a JSON machine description. Unknown keys are
    /// ignored; `autoStart` is honored from the document.
    pub fn from_desc(json: &str) -> Result<Self, EmuError> {
        let desc: MachineDesc = serde_json::from_str(json)?;
        let model =
            CpuModel::from_number(desc.cpu.model).ok_or(EmuError::UnknownModel(desc.cpu.model))?;
        let mut emu = Self::new(model);
        emu.auto_start = desc.cpu.auto_start;
        Ok(emu)
    }

    /// Whether the description asked for execution on power-on
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    /// Copy an image (ROM, boot sector, test program) into memory
    pub fn load_image(&mut self, addr: u32, data: &[u8]) -> Result<(), EmuError> {
        self.bus.load_image(addr, data)?;
        Ok(())
    }

    /// Reset the machine to power-on state (memory survives)
    pub fn reset(&mut self) {
        self.cpu.reset_regs();
        self.history.clear();
        self.last_stop = StopReason::CyclesComplete;
        self.total_cycles = 0;
    }

    /// Run for the given cycle budget; returns the cycles actually
    /// executed. Stops early when the CPU halts with nothing pending.
    pub fn run_cycles(&mut self, cycles: u32) -> u32 {
        let start = self.total_cycles;
        let mut remaining = cycles as i64;

        while remaining > 0 {
            if self.cpu.halted && !self.pending_wake() {
                self.last_stop = StopReason::Halted;
                return (self.total_cycles - start) as u32;
            }

            let (bytes, len) = self.peek_opcode();
            self.history
                .record(self.cpu.segs[segments::CS].sel, self.cpu.ip, bytes, len);

            let used = self.cpu.step_cpu(&mut self.bus, 1);
            if used == 0 {
                // Halted inside the burst without consuming anything
                self.last_stop = StopReason::Halted;
                return (self.total_cycles - start) as u32;
            }
            remaining -= used as i64;
            self.total_cycles += used as u64;
        }

        self.last_stop = StopReason::CyclesComplete;
        (self.total_cycles - start) as u32
    }

    fn pending_wake(&self) -> bool {
        self.cpu.int_flags.contains(crate::cpu::IntFlags::INTR) && self.cpu.intr_enabled()
    }

    /// Request a maskable interrupt with its vector
    pub fn request_interrupt(&mut self, vector: u8) {
        self.cpu.request_interrupt(vector);
    }

    /// Peek the leading code bytes at CS:IP without side effects
    fn peek_opcode(&self) -> ([u8; 4], u8) {
        let mut bytes = [0u8; 4];
        let base = self.cpu.segs[segments::CS].base;
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self
                .bus
                .read_byte_direct(base.wrapping_add(self.cpu.ip).wrapping_add(i as u32));
        }
        (bytes, 4)
    }

    /// CPU access for the embedder and the debugger
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Reason the last run stopped
    pub fn last_stop_reason(&self) -> StopReason {
        self.last_stop
    }

    /// Total cycles executed since reset
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    // ========== State Persistence ==========

    /// Size needed for a save-state buffer
    pub fn save_state_size(&self) -> usize {
        Cpu::SNAPSHOT_SIZE
    }

    /// Save machine state (CPU registers; memory is the embedder's to
    /// persist). Returns bytes written.
    pub fn save_state(&self, out: &mut [u8]) -> Result<usize, EmuError> {
        if out.len() < Cpu::SNAPSHOT_SIZE {
            return Err(EmuError::BufferTooSmall(out.len()));
        }
        out[..Cpu::SNAPSHOT_SIZE].copy_from_slice(&self.cpu.to_bytes());
        Ok(Cpu::SNAPSHOT_SIZE)
    }

    /// Restore machine state from a snapshot
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), EmuError> {
        self.cpu.from_bytes(data)?;
        Ok(())
    }

    // ========== Debugger Hooks ==========

    /// Register dump for diagnostics
    pub fn dump_registers(&self) -> String {
        let c = &self.cpu;
        let ps = c.get_ps();
        if c.model.is_386() {
            format!(
                "EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X}\n\
                 ESP={:08X} EBP={:08X} ESI={:08X} EDI={:08X}\n\
                 ES={:04X} CS={:04X} SS={:04X} DS={:04X} FS={:04X} GS={:04X}\n\
                 EIP={:08X} EFL={:08X} CR0={:08X} CPL={} {}",
                c.regs[0],
                c.regs[3],
                c.regs[1],
                c.regs[2],
                c.regs[4],
                c.regs[5],
                c.regs[6],
                c.regs[7],
                c.segs[0].sel,
                c.segs[1].sel,
                c.segs[2].sel,
                c.segs[3].sel,
                c.segs[4].sel,
                c.segs[5].sel,
                c.ip,
                ps,
                c.cr0,
                c.cpl,
                flag_string(ps),
            )
        } else {
            format!(
                "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SP={:04X} BP={:04X} SI={:04X} DI={:04X}\n\
                 ES={:04X} CS={:04X} SS={:04X} DS={:04X} IP={:04X} MSW={:04X} {}",
                c.regs[0] as u16,
                c.regs[3] as u16,
                c.regs[1] as u16,
                c.regs[2] as u16,
                c.regs[4] as u16,
                c.regs[5] as u16,
                c.regs[6] as u16,
                c.regs[7] as u16,
                c.segs[0].sel,
                c.segs[1].sel,
                c.segs[2].sel,
                c.segs[3].sel,
                c.ip as u16,
                c.cr0 as u16,
                flag_string(ps),
            )
        }
    }

    /// Dump the execution history for debugging
    pub fn dump_history(&self) -> String {
        let mut output = String::new();
        output.push_str("Execution history (oldest to newest):\n");

        for entry in self.history.iter() {
            let opcode_str: String = entry.opcode[..entry.opcode_len as usize]
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ");
            output.push_str(&format!(
                "  {:04X}:{:08X}  {:12}  {}\n",
                entry.cs,
                entry.ip,
                opcode_str,
                disassemble_lite(&entry.opcode[..entry.opcode_len as usize]),
            ));
        }

        output.push_str(&format!(
            "\nCurrent CS:IP: {:04X}:{:08X}\n",
            self.cpu.segs[segments::CS].sel,
            self.cpu.ip
        ));
        output.push_str(&format!("Total cycles: {}\n", self.total_cycles));
        output.push_str(&format!("Stop reason: {:?}\n", self.last_stop));
        if self.cpu.n_fault >= 0 {
            warn!("dumping history with fault {} in flight", self.cpu.n_fault);
            output.push_str(&format!("Fault in flight: {:#04X}\n", self.cpu.n_fault));
        }
        output
    }
}

/// Render the arithmetic/control flags as a short tag string
fn flag_string(ps: u32) -> String {
    use crate::cpu::flags;
    let mut s = String::new();
    for (bit, name) in [
        (flags::OF, 'O'),
        (flags::DF, 'D'),
        (flags::IF, 'I'),
        (flags::TF, 'T'),
        (flags::SF, 'S'),
        (flags::ZF, 'Z'),
        (flags::AF, 'A'),
        (flags::PF, 'P'),
        (flags::CF, 'C'),
    ] {
        if ps & bit != 0 {
            s.push(name);
        } else {
            s.push('-');
        }
    }
    s
}

/// Mnemonics for the common single-byte opcodes, for history dumps
fn disassemble_lite(opcode: &[u8]) -> &'static str {
    if opcode.is_empty() {
        return "???";
    }
    match opcode[0] {
        0x06 => "PUSH ES",
        0x0E => "PUSH CS",
        0x0F => "0F ...",
        0x16 => "PUSH SS",
        0x1E => "PUSH DS",
        0x26 => "ES:",
        0x2E => "CS:",
        0x36 => "SS:",
        0x3E => "DS:",
        0x40..=0x47 => "INC r",
        0x48..=0x4F => "DEC r",
        0x50..=0x57 => "PUSH r",
        0x58..=0x5F => "POP r",
        0x70..=0x7F => "Jcc",
        0x80..=0x83 => "grp1",
        0x88..=0x8B => "MOV",
        0x8D => "LEA",
        0x8E => "MOV sreg",
        0x90 => "NOP",
        0x9C => "PUSHF",
        0x9D => "POPF",
        0xA4 => "MOVSB",
        0xA5 => "MOVSW",
        0xAA => "STOSB",
        0xAB => "STOSW",
        0xB0..=0xBF => "MOV r,imm",
        0xC2 | 0xC3 => "RET",
        0xC6 | 0xC7 => "MOV rm,imm",
        0xCA | 0xCB => "RETF",
        0xCC => "INT3",
        0xCD => "INT n",
        0xCF => "IRET",
        0xE2 => "LOOP",
        0xE8 => "CALL",
        0xE9 | 0xEB => "JMP",
        0xEA => "JMPF",
        0xF3 => "REP",
        0xF4 => "HLT",
        0xFA => "CLI",
        0xFB => "STI",
        0xFF => "grp5",
        _ => "...",
    }
}

impl Default for Emu {
    fn default() -> Self {
        Self::new(CpuModel::I80286)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_emu() {
        let emu = Emu::new(CpuModel::I80286);
        assert_eq!(emu.cpu().segs[segments::CS].sel, 0xF000);
        assert_eq!(emu.cpu().ip, 0xFFF0);
    }

    #[test]
    fn test_from_desc() {
        let emu = Emu::from_desc(r#"{"cpu":{"model":8086,"autoStart":true},"video":{}}"#).unwrap();
        assert_eq!(emu.cpu().model, CpuModel::I8086);
        assert!(emu.auto_start());
    }

    #[test]
    fn test_from_desc_defaults() {
        let emu = Emu::from_desc("{}").unwrap();
        assert_eq!(emu.cpu().model, CpuModel::I80286);
        assert!(!emu.auto_start());
    }

    #[test]
    fn test_bad_model_rejected() {
        assert!(Emu::from_desc(r#"{"cpu":{"model":6502}}"#).is_err());
    }

    #[test]
    fn test_run_halt() {
        let mut emu = Emu::new(CpuModel::I8086);
        // Reset vector FFFF:0000 -> linear 0xFFFF0
        emu.load_image(0xFFFF0, &[0x90, 0x90, 0xF4]).unwrap(); // NOP, NOP, HLT
        let used = emu.run_cycles(1000);
        assert!(used > 0);
        assert_eq!(emu.last_stop_reason(), StopReason::Halted);
        assert!(emu.cpu().halted);
    }

    #[test]
    fn test_save_load_state() {
        let mut emu = Emu::new(CpuModel::I80286);
        emu.cpu_mut().regs[0] = 0x1234;
        let mut buf = vec![0u8; emu.save_state_size()];
        let n = emu.save_state(&mut buf).unwrap();
        assert_eq!(n, Cpu::SNAPSHOT_SIZE);

        let mut emu2 = Emu::new(CpuModel::I80286);
        emu2.load_state(&buf).unwrap();
        assert_eq!(emu2.cpu().regs[0], 0x1234);
    }

    #[test]
    fn test_history_records() {
        let mut emu = Emu::new(CpuModel::I8086);
        emu.load_image(0xFFFF0, &[0x90, 0xF4]).unwrap();
        emu.run_cycles(100);
        let dump = emu.dump_history();
        assert!(dump.contains("NOP"));
        assert!(dump.contains("HLT"));
    }
}
