//! Decoded operands.
//!
//! An operand is either a register view or a resolved virtual memory
//! location. Immediates never appear here; handlers fetch them from the
//! instruction stream directly.

use crate::cpu::{Cpu, GprView, OpSize};
use crate::error::EmuError;
use crate::mem::Access;

/// A source or destination for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A sub-register view.
    Register(GprView),
    /// A virtual memory location of a fixed width.
    Memory {
        /// Resolved virtual address.
        addr: u64,
        /// Access width.
        size: OpSize,
    },
}

impl Operand {
    /// The operand width.
    pub fn size(&self) -> OpSize {
        match self {
            Operand::Register(view) => view.view.size(),
            Operand::Memory { size, .. } => *size,
        }
    }

    /// Read the operand, zero-extended to 64 bits.
    pub fn read(&self, cpu: &Cpu) -> Result<u64, EmuError> {
        match *self {
            Operand::Register(view) => Ok(cpu.regs.read_gpr(view)),
            Operand::Memory { addr, size } => cpu.read_virt(addr, size, Access::Read),
        }
    }

    /// Write the operand; `value` is truncated to the operand width and
    /// register aliasing rules apply.
    pub fn write(&self, cpu: &mut Cpu, value: u64) -> Result<(), EmuError> {
        match *self {
            Operand::Register(view) => {
                cpu.regs.write_gpr(view, value);
                Ok(())
            }
            Operand::Memory { addr, size } => cpu.write_virt(addr, value, size),
        }
    }
}
