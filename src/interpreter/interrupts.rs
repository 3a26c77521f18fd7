//! Interrupt delivery through the IDT.
//!
//! Host-raised vectors sit in the CPU's FIFO queue until a step begins with
//! IF=1; synchronous faults (#PF) are delivered directly, bypassing the
//! queue. Delivery pushes an all-qword frame:
//!
//! ```text
//! RFLAGS, CS, RIP, [error code], vector
//! ```
//!
//! The trailing vector push is a convention shared with IRETQ, which pops it
//! first to know whether an error-code slot follows.

use crate::cpu::registers::RFlags;
use crate::cpu::{Cpu, OpSize, SegReg};
use crate::error::EmuError;
use crate::mem::Access;

/// Vector for page faults.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Vectors whose hardware frame includes an error code.
pub fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

/// One decoded 16-byte IDT gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtGate {
    /// 64-bit handler address (three offset fields concatenated).
    pub handler: u64,
    /// Code-segment selector.
    pub selector: u16,
    /// Present bit from the type/attributes byte.
    pub present: bool,
}

impl IdtGate {
    /// Decode from the raw 16 gate bytes, low qword first.
    pub fn from_raw(low: u64, high: u64) -> Self {
        let offset_low = low & 0xFFFF;
        let selector = ((low >> 16) & 0xFFFF) as u16;
        let attributes = (low >> 40) & 0xFF;
        let offset_mid = (low >> 48) & 0xFFFF;
        let offset_high = high & 0xFFFF_FFFF;
        Self {
            handler: offset_low | (offset_mid << 16) | (offset_high << 32),
            selector,
            present: attributes & 0x80 != 0,
        }
    }
}

/// Read the gate for `vector` from the table at IDTR.base.
fn read_gate(cpu: &Cpu, vector: u8) -> Result<IdtGate, EmuError> {
    let gate_addr = cpu.regs.idtr.base.wrapping_add(vector as u64 * 16);
    let low = cpu.read_virt(gate_addr, OpSize::Qword, Access::Read)?;
    let high = cpu.read_virt(gate_addr + 8, OpSize::Qword, Access::Read)?;
    Ok(IdtGate::from_raw(low, high))
}

/// Deliver `vector` through the IDT, pushing the frame and redirecting RIP.
///
/// Clears `halted`. A missing or non-present gate is fatal.
pub fn deliver(cpu: &mut Cpu, vector: u8, err_code: Option<u64>) -> Result<(), EmuError> {
    let gate = read_gate(cpu, vector)?;
    if !gate.present {
        log::error!(
            "vector {} has no present IDT gate (IDTR.base=0x{:X})",
            vector,
            cpu.regs.idtr.base
        );
        return Err(EmuError::DoubleFault { vector });
    }

    cpu.push64(cpu.regs.flags.assemble())?;
    cpu.push64(cpu.regs.seg(SegReg::Cs) as u64)?;
    cpu.push64(cpu.regs.rip)?;
    if let Some(code) = err_code {
        cpu.push64(code)?;
    }
    cpu.push64(vector as u64)?;

    log::debug!(
        "interrupt {} -> handler 0x{:016X} (err_code={:?})",
        vector,
        gate.handler,
        err_code
    );
    cpu.regs.rip = gate.handler;
    cpu.halted = false;
    Ok(())
}

/// IRETQ: unwind the delivery frame.
///
/// Pops the vector, discards the error-code slot when that vector pushes
/// one, then restores RIP, discards the selector, and restores RFLAGS.
pub fn iretq(cpu: &mut Cpu) -> Result<(), EmuError> {
    let vector = cpu.pop64()? as u8;
    if has_error_code(vector) {
        let _err_code = cpu.pop64()?;
    }
    let rip = cpu.pop64()?;
    let _selector = cpu.pop64()?;
    let rflags = cpu.pop64()?;

    cpu.regs.rip = rip;
    cpu.regs.flags = RFlags::disassemble(rflags);
    log::trace!("iretq from vector {} -> 0x{:016X}", vector, rip);
    Ok(())
}
