//! Instruction execution.
//!
//! One `step` delivers a pending interrupt (when IF=1), reports `Halted`, or
//! decodes and executes exactly one instruction. Page faults raised anywhere
//! during decode or execution restore RIP to the instruction start and are
//! delivered as vector 14 within the same step; every other error is fatal
//! and leaves RIP at the instruction start for the host to inspect.
//!
//! Dispatch is two-level: the opcode selects a handler, and group opcodes
//! (0x80/0x81/0x83, 0x8F, 0xC0/0xC1, 0xC6/0xC7, 0xFE, 0xFF, 0x0F 0x01)
//! match exhaustively on the ModR/M reg field, so no handler can shadow
//! another for the same byte.

use crate::cpu::flags::{
    add_with_flags, logic_flags, sar_with_flags, shl_with_flags, shr_with_flags, sub_with_flags,
};
use crate::cpu::registers::{gpr, RFlags};
use crate::cpu::{Cpu, CpuMode, OpSize, SegReg, StepResult};
use crate::error::EmuError;
use crate::mem::Access;

use super::decode::{self, Instruction, OpcodeTable};
use super::interrupts::{self, PAGE_FAULT_VECTOR};
use super::operand::Operand;

/// Execute one step. See the module docs for the full contract.
pub fn step(cpu: &mut Cpu) -> Result<StepResult, EmuError> {
    if cpu.regs.flags.iflag {
        if let Some(vector) = cpu.take_pending_interrupt() {
            interrupts::deliver(cpu, vector, None)?;
            cpu.steps += 1;
            return Ok(StepResult::Running);
        }
    }
    if cpu.halted {
        return Ok(StepResult::Halted);
    }

    let rip_start = cpu.regs.rip;
    match execute_one(cpu) {
        Ok(()) => {
            cpu.steps += 1;
            Ok(StepResult::Running)
        }
        Err(EmuError::PageFault { addr, err_code }) => {
            cpu.regs.rip = rip_start;
            cpu.regs.cr2 = addr;
            log::debug!(
                "page fault at 0x{:016X} (err_code={}) on instruction at 0x{:016X}",
                addr,
                err_code,
                rip_start
            );
            interrupts::deliver(cpu, PAGE_FAULT_VECTOR, Some(err_code))?;
            cpu.steps += 1;
            Ok(StepResult::Running)
        }
        Err(other) => {
            cpu.regs.rip = rip_start;
            Err(other)
        }
    }
}

fn execute_one(cpu: &mut Cpu) -> Result<(), EmuError> {
    let instr = decode::decode_instruction(cpu)?;
    match instr.table {
        OpcodeTable::OneByte => dispatch_one_byte(cpu, &instr),
        OpcodeTable::TwoByte => dispatch_two_byte(cpu, &instr),
    }
}

fn dispatch_one_byte(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    match instr.opcode {
        // Classic ALU grid: rows select the operation, columns the forms.
        op if op <= 0x3D && op & 7 <= 5 => alu_family(cpu, instr),

        0x50..=0x57 => push_reg(cpu, instr),
        0x58..=0x5F => pop_reg(cpu, instr),

        0x70..=0x7F => jcc_rel8(cpu, instr),

        0x80 | 0x81 | 0x83 => group1_imm(cpu, instr),
        0x84 | 0x85 => test_rm_r(cpu, instr),

        0x88..=0x8B => mov_rm_r(cpu, instr),
        0x8D => lea(cpu, instr),
        0x8E => mov_sreg(cpu, instr),
        0x8F => group1a_pop(cpu, instr),

        0x90 => Ok(()),

        0xA8 | 0xA9 => test_acc_imm(cpu, instr),
        0xAC => lodsb(cpu),

        0xB0..=0xB7 => mov_reg_imm8(cpu, instr),
        0xB8..=0xBF => mov_reg_imm(cpu, instr),

        0xC0 | 0xC1 => group2_shift(cpu, instr),
        0xC2 | 0xC3 => ret(cpu, instr),
        0xC6 | 0xC7 => group11_mov_imm(cpu, instr),

        0xCF => interrupts::iretq(cpu),

        0xE4..=0xE7 => port_io_imm(cpu, instr),
        0xE8 => call_rel(cpu, instr),
        0xE9 => jmp_rel(cpu, instr),
        0xEA => jmp_far(cpu, instr),
        0xEB => jmp_rel8(cpu),
        0xEC..=0xEF => port_io_dx(cpu, instr),

        0xF4 => hlt(cpu),
        0xFA => {
            cpu.regs.flags.iflag = false;
            Ok(())
        }
        0xFB => {
            cpu.regs.flags.iflag = true;
            Ok(())
        }

        0xFE => group4_incdec(cpu, instr),
        0xFF => group5(cpu, instr),

        _ => Err(EmuError::UnknownOpcode {
            opcode: instr.opcode16(),
            rip: instr.rip_start,
        }),
    }
}

fn dispatch_two_byte(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    match instr.opcode {
        0x01 => group_system(cpu, instr),
        0x20 => mov_from_cr(cpu, instr),
        0x22 => mov_to_cr(cpu, instr),
        0x30 => wrmsr(cpu),
        0x32 => rdmsr(cpu),
        0x80..=0x8F => jcc_rel32(cpu, instr),
        0xB6 | 0xB7 => movzx(cpu, instr),
        0xBE | 0xBF => movsx(cpu, instr),
        _ => Err(EmuError::UnknownOpcode {
            opcode: instr.opcode16(),
            rip: instr.rip_start,
        }),
    }
}

// ---------------------------------------------------------------------------
// ALU operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_row(row: u8) -> Self {
        match row & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    fn writes_back(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Compute one ALU operation and update the arithmetic flags.
fn alu_compute(cpu: &mut Cpu, op: AluOp, a: u64, b: u64, size: OpSize) -> u64 {
    let carry = cpu.regs.flags.cf;
    let (result, flags) = match op {
        AluOp::Add => add_with_flags(a, b, false, size),
        AluOp::Adc => add_with_flags(a, b, carry, size),
        AluOp::Sub | AluOp::Cmp => sub_with_flags(a, b, false, size),
        AluOp::Sbb => sub_with_flags(a, b, carry, size),
        AluOp::And => {
            let r = a & b & size.mask();
            (r, logic_flags(r, size))
        }
        AluOp::Or => {
            let r = (a | b) & size.mask();
            (r, logic_flags(r, size))
        }
        AluOp::Xor => {
            let r = (a ^ b) & size.mask();
            (r, logic_flags(r, size))
        }
    };
    cpu.regs.flags.apply_arith(flags);
    result
}

/// The 0x00..0x3D grid: `op r/m,r`, `op r,r/m`, `op AL/rAX,imm`.
fn alu_family(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let op = AluOp::from_row(instr.opcode >> 3);
    let form = instr.opcode & 7;
    let osize = instr.operand_size(cpu.mode);
    let size = if form & 1 == 0 { OpSize::Byte } else { osize };

    let (dst, src_value) = match form {
        0 | 1 => {
            let modrm = decode::fetch_modrm(cpu)?;
            let rm = decode::rm_operand(cpu, instr, modrm, size, 0)?;
            let reg = decode::reg_operand(instr, modrm, size);
            let value = reg.read(cpu)?;
            (rm, value)
        }
        2 | 3 => {
            let modrm = decode::fetch_modrm(cpu)?;
            let rm = decode::rm_operand(cpu, instr, modrm, size, 0)?;
            let reg = decode::reg_operand(instr, modrm, size);
            let value = rm.read(cpu)?;
            (reg, value)
        }
        _ => {
            let imm = decode::fetch_imm_for(cpu, size)?;
            let acc = Operand::Register(decode::gpr_view(&instr.prefixes, 0, false, size));
            (acc, imm)
        }
    };

    let a = dst.read(cpu)?;
    let result = alu_compute(cpu, op, a, src_value, size);
    if op.writes_back() {
        dst.write(cpu, result)?;
    }
    Ok(())
}

/// Group 1: `op r/m, imm` with the operation in the reg field.
fn group1_imm(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let size = if instr.opcode == 0x80 {
        OpSize::Byte
    } else {
        osize
    };
    let imm_len = if instr.opcode == 0x81 {
        decode::imm_len_for(size)
    } else {
        1
    };

    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, size, imm_len)?;
    let imm = match instr.opcode {
        0x81 => decode::fetch_imm_for(cpu, size)?,
        // 0x80 and 0x83: imm8, sign-extended for 0x83.
        0x80 => decode::fetch_u8(cpu)? as u64,
        _ => decode::fetch_i8(cpu)? as u64,
    };

    let op = AluOp::from_row(modrm.reg);
    let a = rm.read(cpu)?;
    let result = alu_compute(cpu, op, a, imm, size);
    if op.writes_back() {
        rm.write(cpu, result)?;
    }
    Ok(())
}

/// TEST r/m, r (0x84/0x85).
fn test_rm_r(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let size = if instr.opcode == 0x84 {
        OpSize::Byte
    } else {
        instr.operand_size(cpu.mode)
    };
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, size, 0)?;
    let reg = decode::reg_operand(instr, modrm, size);
    let a = rm.read(cpu)?;
    let b = reg.read(cpu)?;
    let flags = logic_flags(a & b, size);
    cpu.regs.flags.apply_arith(flags);
    Ok(())
}

/// TEST AL/rAX, imm (0xA8/0xA9).
fn test_acc_imm(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let size = if instr.opcode == 0xA8 {
        OpSize::Byte
    } else {
        instr.operand_size(cpu.mode)
    };
    let imm = decode::fetch_imm_for(cpu, size)?;
    let acc = decode::gpr_view(&instr.prefixes, 0, false, size);
    let a = cpu.regs.read_gpr(acc);
    let flags = logic_flags(a & imm, size);
    cpu.regs.flags.apply_arith(flags);
    Ok(())
}

// ---------------------------------------------------------------------------
// Data movement
// ---------------------------------------------------------------------------

/// MOV between register and r/m (0x88..0x8B).
fn mov_rm_r(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let form = instr.opcode & 3;
    let size = if form & 1 == 0 {
        OpSize::Byte
    } else {
        instr.operand_size(cpu.mode)
    };
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, size, 0)?;
    let reg = decode::reg_operand(instr, modrm, size);

    let (dst, src) = if form < 2 { (rm, reg) } else { (reg, rm) };
    let value = src.read(cpu)?;
    dst.write(cpu, value)
}

/// LEA: write the effective address without touching memory.
fn lea(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let modrm = decode::fetch_modrm(cpu)?;
    if modrm.md == 3 {
        return Err(EmuError::UnknownOpcode {
            opcode: instr.opcode16(),
            rip: instr.rip_start,
        });
    }
    let addr = decode::effective_address(cpu, instr, modrm, 0)?;
    let dst = decode::reg_operand(instr, modrm, osize);
    dst.write(cpu, addr)
}

/// MOV Sreg, r/m16.
fn mov_sreg(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, OpSize::Word, 0)?;
    let Some(seg) = SegReg::from_modrm_reg(modrm.reg) else {
        return Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg: modrm.reg,
            rip: instr.rip_start,
        });
    };
    let selector = rm.read(cpu)? as u16;
    cpu.regs.set_seg(seg, selector);
    log::trace!("selector load: {:?} <- 0x{:04X}", seg, selector);
    Ok(())
}

/// MOV r8, imm8 (0xB0+r).
fn mov_reg_imm8(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let view = decode::gpr_view(
        &instr.prefixes,
        instr.opcode & 7,
        instr.prefixes.rex_b(),
        OpSize::Byte,
    );
    let imm = decode::fetch_u8(cpu)?;
    cpu.regs.write_gpr(view, imm as u64);
    Ok(())
}

/// MOV r, imm (0xB8+r); the only form with a true 64-bit immediate.
fn mov_reg_imm(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let view = decode::gpr_view(
        &instr.prefixes,
        instr.opcode & 7,
        instr.prefixes.rex_b(),
        osize,
    );
    let imm = match osize {
        OpSize::Word => decode::fetch_u16(cpu)? as u64,
        OpSize::Dword => decode::fetch_u32(cpu)? as u64,
        OpSize::Qword => decode::fetch_u64(cpu)?,
        OpSize::Byte => decode::fetch_u8(cpu)? as u64,
    };
    cpu.regs.write_gpr(view, imm);
    Ok(())
}

/// Group 11: MOV r/m, imm (0xC6 /0, 0xC7 /0).
fn group11_mov_imm(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let size = if instr.opcode == 0xC6 {
        OpSize::Byte
    } else {
        instr.operand_size(cpu.mode)
    };
    let modrm = decode::fetch_modrm(cpu)?;
    match modrm.reg {
        0 => {
            let imm_len = decode::imm_len_for(size);
            let rm = decode::rm_operand(cpu, instr, modrm, size, imm_len)?;
            let imm = decode::fetch_imm_for(cpu, size)?;
            rm.write(cpu, imm)
        }
        reg => Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg,
            rip: instr.rip_start,
        }),
    }
}

/// LODSB: AL <- [RSI], RSI += 1 (direction flag is not modeled).
fn lodsb(cpu: &mut Cpu) -> Result<(), EmuError> {
    let rsi = cpu.regs.gpr64(gpr::RSI);
    let value = cpu.read_virt(rsi, OpSize::Byte, Access::Read)?;
    let al = crate::cpu::GprView {
        index: gpr::RAX,
        view: crate::cpu::WidthView::Byte { high: false },
    };
    cpu.regs.write_gpr(al, value);
    cpu.regs.set_gpr64(gpr::RSI, rsi.wrapping_add(1));
    Ok(())
}

// ---------------------------------------------------------------------------
// Stack operations
// ---------------------------------------------------------------------------

/// Stack slot width: always 8 bytes in long mode.
fn stack_slot(mode: CpuMode, osize: OpSize) -> OpSize {
    if mode.is_long() {
        OpSize::Qword
    } else {
        osize
    }
}

fn push_slot(cpu: &mut Cpu, value: u64, slot: OpSize) -> Result<(), EmuError> {
    let rsp = cpu.regs.rsp().wrapping_sub(slot.bytes());
    cpu.regs.set_rsp(rsp);
    cpu.write_virt(rsp, value, slot)
}

fn pop_slot(cpu: &mut Cpu, slot: OpSize) -> Result<u64, EmuError> {
    let rsp = cpu.regs.rsp();
    let value = cpu.read_virt(rsp, slot, Access::Read)?;
    cpu.regs.set_rsp(rsp.wrapping_add(slot.bytes()));
    Ok(value)
}

/// PUSH r (0x50+r).
fn push_reg(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let slot = stack_slot(cpu.mode, osize);
    let index = (instr.opcode as usize & 7) + if instr.prefixes.rex_b() { 8 } else { 0 };
    let value = if slot == OpSize::Qword {
        cpu.regs.gpr64(index)
    } else {
        cpu.regs.read_gpr(decode::gpr_view(
            &instr.prefixes,
            instr.opcode & 7,
            instr.prefixes.rex_b(),
            slot,
        ))
    };
    push_slot(cpu, value, slot)
}

/// POP r (0x58+r).
fn pop_reg(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let slot = stack_slot(cpu.mode, osize);
    let value = pop_slot(cpu, slot)?;
    let view = decode::gpr_view(
        &instr.prefixes,
        instr.opcode & 7,
        instr.prefixes.rex_b(),
        slot,
    );
    cpu.regs.write_gpr(view, value);
    Ok(())
}

/// Group 1A: POP r/m (0x8F /0).
///
/// The value is read from `[RSP]` first, then RSP is adjusted, then the
/// operand is written; the effective address sees the pre-pop RSP.
fn group1a_pop(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let slot = stack_slot(cpu.mode, osize);
    let modrm = decode::fetch_modrm(cpu)?;
    match modrm.reg {
        0 => {
            let rm = decode::rm_operand(cpu, instr, modrm, slot, 0)?;
            let value = pop_slot(cpu, slot)?;
            rm.write(cpu, value)
        }
        reg => Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg,
            rip: instr.rip_start,
        }),
    }
}

// ---------------------------------------------------------------------------
// Control transfer
// ---------------------------------------------------------------------------

/// Evaluate a condition code; `None` for the parity conditions, which the
/// modeled flags cannot answer.
fn condition(flags: RFlags, cc: u8) -> Option<bool> {
    let value = match cc {
        0x0 => flags.of,
        0x1 => !flags.of,
        0x2 => flags.cf,
        0x3 => !flags.cf,
        0x4 => flags.zf,
        0x5 => !flags.zf,
        0x6 => flags.cf || flags.zf,
        0x7 => !flags.cf && !flags.zf,
        0x8 => flags.sf,
        0x9 => !flags.sf,
        0xC => flags.sf != flags.of,
        0xD => flags.sf == flags.of,
        0xE => flags.zf || (flags.sf != flags.of),
        0xF => !flags.zf && (flags.sf == flags.of),
        _ => return None,
    };
    Some(value)
}

/// Jcc rel8 (0x70..0x7F).
fn jcc_rel8(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let disp = decode::fetch_i8(cpu)?;
    let Some(take) = condition(cpu.regs.flags, instr.opcode & 0xF) else {
        return Err(EmuError::UnknownOpcode {
            opcode: instr.opcode16(),
            rip: instr.rip_start,
        });
    };
    if take {
        cpu.regs.rip = cpu.regs.rip.wrapping_add(disp as u64);
    }
    Ok(())
}

/// Jcc rel32 (0x0F 0x80..0x8F).
fn jcc_rel32(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let disp = decode::fetch_i32(cpu)?;
    let Some(take) = condition(cpu.regs.flags, instr.opcode & 0xF) else {
        return Err(EmuError::UnknownOpcode {
            opcode: instr.opcode16(),
            rip: instr.rip_start,
        });
    };
    if take {
        cpu.regs.rip = cpu.regs.rip.wrapping_add(disp as u64);
    }
    Ok(())
}

/// JMP rel8 (0xEB).
fn jmp_rel8(cpu: &mut Cpu) -> Result<(), EmuError> {
    let disp = decode::fetch_i8(cpu)?;
    cpu.regs.rip = cpu.regs.rip.wrapping_add(disp as u64);
    Ok(())
}

/// JMP rel16/rel32 (0xE9).
fn jmp_rel(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let disp = if instr.operand_size(cpu.mode) == OpSize::Word {
        decode::fetch_i16(cpu)?
    } else {
        decode::fetch_i32(cpu)?
    };
    cpu.regs.rip = cpu.regs.rip.wrapping_add(disp as u64);
    Ok(())
}

/// CALL rel16/rel32 (0xE8): pushes the RIP after the full instruction.
fn call_rel(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let disp = if osize == OpSize::Word {
        decode::fetch_i16(cpu)?
    } else {
        decode::fetch_i32(cpu)?
    };
    let return_rip = cpu.regs.rip;
    push_slot(cpu, return_rip, stack_slot(cpu.mode, osize))?;
    cpu.regs.rip = return_rip.wrapping_add(disp as u64);
    Ok(())
}

/// RET / RET imm16 (0xC3/0xC2).
fn ret(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let slot = stack_slot(cpu.mode, osize);
    let adjust = if instr.opcode == 0xC2 {
        decode::fetch_u16(cpu)? as u64
    } else {
        0
    };
    let rip = pop_slot(cpu, slot)?;
    cpu.regs.rip = rip;
    cpu.regs.set_rsp(cpu.regs.rsp().wrapping_add(adjust));
    Ok(())
}

/// Far JMP ptr16:16 / ptr16:32 (0xEA): trivial selector load plus jump.
fn jmp_far(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let offset = if instr.operand_size(cpu.mode) == OpSize::Word {
        decode::fetch_u16(cpu)? as u64
    } else {
        decode::fetch_u32(cpu)? as u64
    };
    let selector = decode::fetch_u16(cpu)?;
    cpu.regs.set_seg(SegReg::Cs, selector);
    cpu.regs.rip = offset;
    log::trace!("far jump to 0x{:04X}:0x{:X}", selector, offset);
    Ok(())
}

/// HLT (0xF4).
fn hlt(cpu: &mut Cpu) -> Result<(), EmuError> {
    log::info!("hlt at 0x{:016X}", cpu.regs.rip);
    cpu.halted = true;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shifts and INC/DEC groups
// ---------------------------------------------------------------------------

/// Group 2: SHL/SHR/SAR r/m, imm8 (0xC0/0xC1).
fn group2_shift(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let size = if instr.opcode == 0xC0 {
        OpSize::Byte
    } else {
        instr.operand_size(cpu.mode)
    };
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, size, 1)?;
    let raw_count = decode::fetch_u8(cpu)?;

    let count_mask = if size == OpSize::Qword { 63 } else { 31 };
    let count = (raw_count & count_mask) as u32;
    let a = rm.read(cpu)?;

    let shifted = match modrm.reg {
        4 => shl_with_flags(a, count, size),
        5 => shr_with_flags(a, count, size),
        7 => sar_with_flags(a, count, size),
        reg => {
            return Err(EmuError::UnknownGroupOp {
                opcode: instr.opcode16(),
                reg,
                rip: instr.rip_start,
            })
        }
    };
    // A masked count of zero leaves the operand and flags untouched.
    if let Some((result, flags)) = shifted {
        rm.write(cpu, result)?;
        cpu.regs.flags.apply_arith(flags);
    }
    Ok(())
}

/// INC/DEC share ADD/SUB flag rules but preserve CF.
fn inc_dec(cpu: &mut Cpu, rm: Operand, size: OpSize, dec: bool) -> Result<(), EmuError> {
    let a = rm.read(cpu)?;
    let saved_cf = cpu.regs.flags.cf;
    let (result, flags) = if dec {
        sub_with_flags(a, 1, false, size)
    } else {
        add_with_flags(a, 1, false, size)
    };
    rm.write(cpu, result)?;
    cpu.regs.flags.apply_arith(flags);
    cpu.regs.flags.cf = saved_cf;
    Ok(())
}

/// Group 4: INC/DEC r/m8 (0xFE).
fn group4_incdec(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, OpSize::Byte, 0)?;
    match modrm.reg {
        0 => inc_dec(cpu, rm, OpSize::Byte, false),
        1 => inc_dec(cpu, rm, OpSize::Byte, true),
        reg => Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg,
            rip: instr.rip_start,
        }),
    }
}

/// Group 5: INC/DEC/CALL/JMP/PUSH r/m (0xFF).
fn group5(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let modrm = decode::fetch_modrm(cpu)?;
    match modrm.reg {
        0 => {
            let rm = decode::rm_operand(cpu, instr, modrm, osize, 0)?;
            inc_dec(cpu, rm, osize, false)
        }
        1 => {
            let rm = decode::rm_operand(cpu, instr, modrm, osize, 0)?;
            inc_dec(cpu, rm, osize, true)
        }
        2 => {
            // Near indirect call: 64-bit target in long mode.
            let tsize = if cpu.mode.is_long() { OpSize::Qword } else { osize };
            let rm = decode::rm_operand(cpu, instr, modrm, tsize, 0)?;
            let target = rm.read(cpu)?;
            let return_rip = cpu.regs.rip;
            push_slot(cpu, return_rip, stack_slot(cpu.mode, osize))?;
            cpu.regs.rip = target;
            Ok(())
        }
        4 => {
            let tsize = if cpu.mode.is_long() { OpSize::Qword } else { osize };
            let rm = decode::rm_operand(cpu, instr, modrm, tsize, 0)?;
            cpu.regs.rip = rm.read(cpu)?;
            Ok(())
        }
        6 => {
            let slot = stack_slot(cpu.mode, osize);
            let rm = decode::rm_operand(cpu, instr, modrm, slot, 0)?;
            let value = rm.read(cpu)?;
            push_slot(cpu, value, slot)
        }
        reg => Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg,
            rip: instr.rip_start,
        }),
    }
}

// ---------------------------------------------------------------------------
// Port I/O
// ---------------------------------------------------------------------------

fn io_size(instr: &Instruction, mode: CpuMode) -> u8 {
    // Byte forms are the even opcodes; word/dword forms cap at 4 bytes.
    if instr.opcode & 1 == 0 {
        1
    } else {
        instr.operand_size(mode).bytes().min(4) as u8
    }
}

/// IN/OUT with an immediate port (0xE4..0xE7).
fn port_io_imm(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let port = decode::fetch_u8(cpu)? as u16;
    port_io(cpu, instr, port)
}

/// IN/OUT with the port in DX (0xEC..0xEF).
fn port_io_dx(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let port = (cpu.regs.gpr64(gpr::RDX) & 0xFFFF) as u16;
    port_io(cpu, instr, port)
}

fn port_io(cpu: &mut Cpu, instr: &Instruction, port: u16) -> Result<(), EmuError> {
    let size = io_size(instr, cpu.mode);
    let acc = decode::gpr_view(
        &instr.prefixes,
        0,
        false,
        OpSize::from_bytes(size)?,
    );
    // Bit 1 of the opcode distinguishes IN (0xE4/E5, 0xEC/ED) from OUT.
    let is_out = instr.opcode & 2 != 0;
    if is_out {
        let value = cpu.regs.read_gpr(acc);
        cpu.bus.port_out(port, value, size);
    } else {
        let value = cpu.bus.port_in(port, size);
        cpu.regs.write_gpr(acc, value);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// System instructions
// ---------------------------------------------------------------------------

/// 0x0F 0x01 group: LGDT (/2) and LIDT (/3) from m16&64.
fn group_system(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let modrm = decode::fetch_modrm(cpu)?;
    if modrm.md == 3 || !matches!(modrm.reg, 2 | 3) {
        return Err(EmuError::UnknownGroupOp {
            opcode: instr.opcode16(),
            reg: modrm.reg,
            rip: instr.rip_start,
        });
    }
    let addr = decode::effective_address(cpu, instr, modrm, 0)?;
    let limit = cpu.read_virt(addr, OpSize::Word, Access::Read)? as u16;
    let base = cpu.read_virt(addr.wrapping_add(2), OpSize::Qword, Access::Read)?;

    match modrm.reg {
        2 => {
            cpu.regs.gdtr.base = base;
            cpu.regs.gdtr.limit = limit;
            log::debug!("lgdt base=0x{:016X} limit=0x{:04X}", base, limit);
        }
        _ => {
            cpu.regs.idtr.base = base;
            cpu.regs.idtr.limit = limit;
            log::debug!("lidt base=0x{:016X} limit=0x{:04X}", base, limit);
        }
    }
    Ok(())
}

fn cr_number(instr: &Instruction, modrm: decode::ModRm) -> u8 {
    (modrm.reg & 7) + if instr.prefixes.rex_r() { 8 } else { 0 }
}

/// MOV r64, CRn (0x0F 0x20).
fn mov_from_cr(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let modrm = decode::fetch_modrm(cpu)?;
    let index = (modrm.rm as usize & 7) + if instr.prefixes.rex_b() { 8 } else { 0 };
    let value = match cr_number(instr, modrm) {
        0 => cpu.regs.cr0,
        2 => cpu.regs.cr2,
        3 => cpu.regs.cr3,
        4 => cpu.regs.cr4,
        reg => {
            return Err(EmuError::UnknownGroupOp {
                opcode: instr.opcode16(),
                reg,
                rip: instr.rip_start,
            })
        }
    };
    cpu.regs.set_gpr64(index, value);
    Ok(())
}

/// MOV CRn, r64 (0x0F 0x22): recomputes the mode.
fn mov_to_cr(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let modrm = decode::fetch_modrm(cpu)?;
    let index = (modrm.rm as usize & 7) + if instr.prefixes.rex_b() { 8 } else { 0 };
    let value = cpu.regs.gpr64(index);
    match cr_number(instr, modrm) {
        0 => cpu.regs.cr0 = value,
        2 => cpu.regs.cr2 = value,
        3 => cpu.regs.cr3 = value,
        4 => cpu.regs.cr4 = value,
        reg => {
            return Err(EmuError::UnknownGroupOp {
                opcode: instr.opcode16(),
                reg,
                rip: instr.rip_start,
            })
        }
    }
    log::debug!("cr{} <- 0x{:016X}", cr_number(instr, modrm), value);
    cpu.update_mode();
    Ok(())
}

/// EFER, the one MSR with architectural meaning here.
const MSR_EFER: u32 = 0xC000_0080;

/// WRMSR (0x0F 0x30): ECX selects, EDX:EAX supplies the value.
fn wrmsr(cpu: &mut Cpu) -> Result<(), EmuError> {
    let msr = cpu.regs.gpr64(gpr::RCX) as u32;
    let value =
        (cpu.regs.gpr64(gpr::RDX) & 0xFFFF_FFFF) << 32 | (cpu.regs.gpr64(gpr::RAX) & 0xFFFF_FFFF);
    if msr == MSR_EFER {
        cpu.regs.efer = value;
        log::debug!("wrmsr EFER <- 0x{:016X}", value);
        cpu.update_mode();
    } else {
        log::warn!("wrmsr to unrecognized MSR 0x{:08X} (value 0x{:016X}) dropped", msr, value);
    }
    Ok(())
}

/// RDMSR (0x0F 0x32): unrecognized MSRs read as 0.
fn rdmsr(cpu: &mut Cpu) -> Result<(), EmuError> {
    let msr = cpu.regs.gpr64(gpr::RCX) as u32;
    let value = if msr == MSR_EFER {
        cpu.regs.efer
    } else {
        log::warn!("rdmsr of unrecognized MSR 0x{:08X} reads 0", msr);
        0
    };
    // 32-bit writes zero the upper halves, as hardware does.
    cpu.regs.write_gpr(
        crate::cpu::GprView {
            index: gpr::RAX,
            view: crate::cpu::WidthView::Dword,
        },
        value & 0xFFFF_FFFF,
    );
    cpu.regs.write_gpr(
        crate::cpu::GprView {
            index: gpr::RDX,
            view: crate::cpu::WidthView::Dword,
        },
        value >> 32,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Extensions (MOVZX/MOVSX)
// ---------------------------------------------------------------------------

/// MOVZX r, r/m8 / r/m16 (0x0F 0xB6/0xB7).
fn movzx(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let src_size = if instr.opcode == 0xB6 {
        OpSize::Byte
    } else {
        OpSize::Word
    };
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, src_size, 0)?;
    let value = rm.read(cpu)?;
    let dst = decode::reg_operand(instr, modrm, osize);
    dst.write(cpu, value)
}

/// MOVSX r, r/m8 / r/m16 (0x0F 0xBE/0xBF).
fn movsx(cpu: &mut Cpu, instr: &Instruction) -> Result<(), EmuError> {
    let osize = instr.operand_size(cpu.mode);
    let src_size = if instr.opcode == 0xBE {
        OpSize::Byte
    } else {
        OpSize::Word
    };
    let modrm = decode::fetch_modrm(cpu)?;
    let rm = decode::rm_operand(cpu, instr, modrm, src_size, 0)?;
    let value = rm.read(cpu)?;
    let extended = if value & src_size.sign_bit() != 0 {
        value | !src_size.mask()
    } else {
        value
    };
    let dst = decode::reg_operand(instr, modrm, osize);
    dst.write(cpu, extended)
}
