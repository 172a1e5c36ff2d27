//! Intel x86 PC Emulator Core
//!
//! This crate provides a platform-agnostic emulator core for the Intel
//! 8086/8088 through early 80386 processors, suitable for booting the
//! contemporary PC operating systems (PC-DOS, early OS/2). It exposes a
//! stable C ABI alongside the Rust API; no OS facilities are used and all
//! I/O happens through byte buffers and the port space.
//!
//! # Architecture
//!
//! The emulator is organized into several modules:
//! - `bus`: linear memory and port I/O behind the model's address mask
//! - `cpu`: the x86 CPU (registers, lazy flags, segmentation, faults)
//! - `emu`: machine orchestrator, snapshots and debugger hooks
//!
//! # Address Space
//!
//! | Model         | Linear addresses | Default memory |
//! |---------------|------------------|----------------|
//! | 8086 - 80188  | 20-bit (1MB)     | 1MB            |
//! | 80286         | 24-bit (16MB)    | 16MB           |
//! | 80386         | 32-bit (4GB)     | 16MB installed |

pub mod bus;
pub mod cpu;
mod emu;

use std::ptr;
use std::slice;

pub use emu::{CpuDesc, Emu, EmuError, MachineDesc, StopReason};

use cpu::CpuModel;

/// Create a new emulator instance for a model number (8086, 8088, 80186,
/// 80188, 80286 or 80386). Returns null for an unknown model.
#[no_mangle]
pub extern "C" fn emu_create(model: u32) -> *mut Emu {
    match CpuModel::from_number(model) {
        Some(m) => Box::into_raw(Box::new(Emu::new(m))),
        None => ptr::null_mut(),
    }
}

/// Create an emulator from a JSON machine description.
/// Returns null on a malformed description.
#[no_mangle]
pub extern "C" fn emu_create_from_desc(json: *const u8, len: usize) -> *mut Emu {
    if json.is_null() {
        return ptr::null_mut();
    }
    let bytes = unsafe { slice::from_raw_parts(json, len) };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return ptr::null_mut();
    };
    match Emu::from_desc(text) {
        Ok(emu) => Box::into_raw(Box::new(emu)),
        Err(_) => ptr::null_mut(),
    }
}

/// Destroy an emulator instance.
/// Safe to call with null pointer.
#[no_mangle]
pub extern "C" fn emu_destroy(emu: *mut Emu) {
    if !emu.is_null() {
        unsafe {
            drop(Box::from_raw(emu));
        }
    }
}

/// Copy an image (ROM, boot sector, test program) into memory at a
/// physical address. Returns 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_load_image(emu: *mut Emu, addr: u32, data: *const u8, len: usize) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let image = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_image(addr, image) {
        Ok(()) => 0,
        Err(_) => -2,
    }
}

/// Reset the emulator to the architectural power-on state.
#[no_mangle]
pub extern "C" fn emu_reset(emu: *mut Emu) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &mut *emu };
    emu.reset();
}

/// Run the emulator for the specified number of cycles.
/// Returns the number of cycles actually executed.
#[no_mangle]
pub extern "C" fn emu_run_cycles(emu: *mut Emu, cycles: i32) -> i32 {
    if emu.is_null() || cycles <= 0 {
        return 0;
    }
    let emu = unsafe { &mut *emu };
    emu.run_cycles(cycles as u32) as i32
}

/// Request a maskable interrupt with its vector number.
#[no_mangle]
pub extern "C" fn emu_request_interrupt(emu: *mut Emu, vector: u8) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &mut *emu };
    emu.request_interrupt(vector);
}

/// Get the size needed for a save state buffer.
#[no_mangle]
pub extern "C" fn emu_save_state_size(emu: *const Emu) -> usize {
    if emu.is_null() {
        return 0;
    }
    let emu = unsafe { &*emu };
    emu.save_state_size()
}

/// Save emulator state to a buffer.
/// Returns bytes written on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_save_state(emu: *const Emu, out: *mut u8, cap: usize) -> i32 {
    if emu.is_null() || out.is_null() {
        return -1;
    }
    let emu = unsafe { &*emu };
    let buffer = unsafe { slice::from_raw_parts_mut(out, cap) };
    match emu.save_state(buffer) {
        Ok(size) => size as i32,
        Err(_) => -2,
    }
}

/// Load emulator state from a buffer.
/// Returns 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_load_state(emu: *mut Emu, data: *const u8, len: usize) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let buffer = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_state(buffer) {
        Ok(()) => 0,
        Err(_) => -2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_destroy() {
        let emu = emu_create(80286);
        assert!(!emu.is_null());
        emu_destroy(emu);
    }

    #[test]
    fn test_create_unknown_model() {
        assert!(emu_create(6502).is_null());
    }

    #[test]
    fn test_run_cycles() {
        let emu = emu_create(8086);
        // Memory starts zeroed, so the CPU chews through ADD [BX+SI],AL
        let executed = emu_run_cycles(emu, 100);
        assert!(executed >= 0);
        emu_destroy(emu);
    }

    #[test]
    fn test_state_round_trip() {
        let emu = emu_create(80286);
        let size = emu_save_state_size(emu);
        assert!(size > 0);
        let mut buf = vec![0u8; size];
        let written = emu_save_state(emu, buf.as_mut_ptr(), buf.len());
        assert_eq!(written as usize, size);
        assert_eq!(emu_load_state(emu, buf.as_ptr(), buf.len()), 0);
        emu_destroy(emu);
    }
}
