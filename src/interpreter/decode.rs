//! Instruction stream decoding.
//!
//! All fetches go through the MMU with Execute access and advance RIP as
//! bytes are consumed. Decoding is deterministic: identical CPU state yields
//! an identical instruction stream.
//!
//! # Layout of one instruction
//!
//! ```text
//! [prefixes]* [0F] opcode [ModR/M] [SIB] [disp] [imm]
//! ```
//!
//! RIP-relative addressing is measured from the RIP *after* the full
//! instruction; handlers that fetch an immediate after the memory operand
//! tell the resolver how many immediate bytes are still outstanding.

use crate::cpu::registers::gpr;
use crate::cpu::{Cpu, CpuMode, GprView, OpSize, SegReg, WidthView};
use crate::error::EmuError;
use crate::mem::Access;

use super::operand::Operand;
use super::prefixes::{Prefixes, Rex};

/// Which opcode table the opcode byte indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeTable {
    /// Single-byte opcodes.
    OneByte,
    /// 0x0F-escaped opcodes.
    TwoByte,
}

/// Transient per-instruction decode state.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    /// RIP at the first prefix byte (restored on a page fault).
    pub rip_start: u64,
    /// Consumed prefix state.
    pub prefixes: Prefixes,
    /// Opcode table selector.
    pub table: OpcodeTable,
    /// Opcode byte within the table.
    pub opcode: u8,
}

impl Instruction {
    /// Opcode with the 0x0F escape folded in, for diagnostics.
    pub fn opcode16(&self) -> u16 {
        match self.table {
            OpcodeTable::OneByte => self.opcode as u16,
            OpcodeTable::TwoByte => 0x0F00 | self.opcode as u16,
        }
    }

    /// Effective operand size under the current mode.
    ///
    /// Byte-width opcodes ignore this and use [`OpSize::Byte`] directly.
    pub fn operand_size(&self, mode: CpuMode) -> OpSize {
        if mode.is_long() {
            if self.prefixes.rex_w() {
                OpSize::Qword
            } else if self.prefixes.operand_size_override {
                OpSize::Word
            } else {
                OpSize::Dword
            }
        } else if self.prefixes.operand_size_override {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }

    /// Effective address size under the current mode.
    pub fn address_size(&self, mode: CpuMode) -> AddrSize {
        let toggled = self.prefixes.address_size_override;
        match mode {
            CpuMode::Real => {
                if toggled {
                    AddrSize::A32
                } else {
                    AddrSize::A16
                }
            }
            CpuMode::Long => {
                if toggled {
                    AddrSize::A32
                } else {
                    AddrSize::A64
                }
            }
            _ => {
                if toggled {
                    AddrSize::A16
                } else {
                    AddrSize::A32
                }
            }
        }
    }
}

/// Effective address width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSize {
    /// 16-bit addressing (classic base table, no SIB).
    A16,
    /// 32-bit addressing.
    A32,
    /// 64-bit addressing.
    A64,
}

impl AddrSize {
    /// Truncation mask for the final address.
    #[inline]
    pub fn mask(self) -> u64 {
        match self {
            AddrSize::A16 => 0xFFFF,
            AddrSize::A32 => 0xFFFF_FFFF,
            AddrSize::A64 => u64::MAX,
        }
    }
}

/// ModR/M byte split into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    /// Addressing mode, 2 bits.
    pub md: u8,
    /// Register / opcode-extension field, 3 bits (before REX.R).
    pub reg: u8,
    /// Register-or-memory field, 3 bits (before REX.B).
    pub rm: u8,
}

/// Fetch one byte at RIP (Execute access) and advance.
pub fn fetch_u8(cpu: &mut Cpu) -> Result<u8, EmuError> {
    let value = cpu.read_virt(cpu.regs.rip, OpSize::Byte, Access::Execute)?;
    cpu.regs.rip = cpu.regs.rip.wrapping_add(1);
    Ok(value as u8)
}

/// Fetch a little-endian 16-bit value and advance.
pub fn fetch_u16(cpu: &mut Cpu) -> Result<u16, EmuError> {
    let value = cpu.read_virt(cpu.regs.rip, OpSize::Word, Access::Execute)?;
    cpu.regs.rip = cpu.regs.rip.wrapping_add(2);
    Ok(value as u16)
}

/// Fetch a little-endian 32-bit value and advance.
pub fn fetch_u32(cpu: &mut Cpu) -> Result<u32, EmuError> {
    let value = cpu.read_virt(cpu.regs.rip, OpSize::Dword, Access::Execute)?;
    cpu.regs.rip = cpu.regs.rip.wrapping_add(4);
    Ok(value as u32)
}

/// Fetch a little-endian 64-bit value and advance.
pub fn fetch_u64(cpu: &mut Cpu) -> Result<u64, EmuError> {
    let value = cpu.read_virt(cpu.regs.rip, OpSize::Qword, Access::Execute)?;
    cpu.regs.rip = cpu.regs.rip.wrapping_add(8);
    Ok(value)
}

/// Fetch a sign-extended 8-bit displacement.
pub fn fetch_i8(cpu: &mut Cpu) -> Result<i64, EmuError> {
    Ok(fetch_u8(cpu)? as i8 as i64)
}

/// Fetch a sign-extended 16-bit displacement.
pub fn fetch_i16(cpu: &mut Cpu) -> Result<i64, EmuError> {
    Ok(fetch_u16(cpu)? as i16 as i64)
}

/// Fetch a sign-extended 32-bit displacement.
pub fn fetch_i32(cpu: &mut Cpu) -> Result<i64, EmuError> {
    Ok(fetch_u32(cpu)? as i32 as i64)
}

/// Fetch the default-size immediate for the operand width: imm16 for word,
/// imm32 for dword, imm32 sign-extended for qword.
pub fn fetch_imm_for(cpu: &mut Cpu, size: OpSize) -> Result<u64, EmuError> {
    Ok(match size {
        OpSize::Byte => fetch_u8(cpu)? as u64,
        OpSize::Word => fetch_u16(cpu)? as u64,
        OpSize::Dword => fetch_u32(cpu)? as u64,
        OpSize::Qword => fetch_i32(cpu)? as u64,
    })
}

/// Byte count [`fetch_imm_for`] will consume, for RIP-relative accounting.
pub fn imm_len_for(size: OpSize) -> u64 {
    match size {
        OpSize::Byte => 1,
        OpSize::Word => 2,
        OpSize::Dword | OpSize::Qword => 4,
    }
}

/// Consume prefixes and the opcode byte(s).
pub fn decode_instruction(cpu: &mut Cpu) -> Result<Instruction, EmuError> {
    let rip_start = cpu.regs.rip;
    let mut prefixes = Prefixes::default();

    let opcode = loop {
        let byte = fetch_u8(cpu)?;
        match byte {
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0xF0 => prefixes.lock = true,
            0xF2 => {
                prefixes.repne = true;
                prefixes.rep = false;
            }
            0xF3 => {
                prefixes.rep = true;
                prefixes.repne = false;
            }
            0x26 => prefixes.segment = Some(SegReg::Es),
            0x2E => prefixes.segment = Some(SegReg::Cs),
            0x36 => prefixes.segment = Some(SegReg::Ss),
            0x3E => prefixes.segment = Some(SegReg::Ds),
            0x64 => prefixes.segment = Some(SegReg::Fs),
            0x65 => prefixes.segment = Some(SegReg::Gs),
            0x40..=0x4F => prefixes.rex = Rex::new(byte),
            _ => break byte,
        }
    };

    let (table, opcode) = if opcode == 0x0F {
        (OpcodeTable::TwoByte, fetch_u8(cpu)?)
    } else {
        (OpcodeTable::OneByte, opcode)
    };

    Ok(Instruction {
        rip_start,
        prefixes,
        table,
        opcode,
    })
}

/// Fetch and split a ModR/M byte.
pub fn fetch_modrm(cpu: &mut Cpu) -> Result<ModRm, EmuError> {
    let byte = fetch_u8(cpu)?;
    Ok(ModRm {
        md: byte >> 6,
        reg: (byte >> 3) & 7,
        rm: byte & 7,
    })
}

/// Build the register view for a 3-bit encoding field.
///
/// `extend` is the relevant REX bit (R for reg, B for rm/base/opcode). In
/// byte context without REX, encodings 4..8 address the legacy high bytes.
pub fn gpr_view(prefixes: &Prefixes, raw: u8, extend: bool, size: OpSize) -> GprView {
    let index = (raw as usize & 7) + if extend { 8 } else { 0 };
    match size {
        OpSize::Byte => {
            if !prefixes.has_rex() && (4..8).contains(&index) {
                GprView {
                    index: index - 4,
                    view: WidthView::Byte { high: true },
                }
            } else {
                GprView {
                    index,
                    view: WidthView::Byte { high: false },
                }
            }
        }
        OpSize::Word => GprView {
            index,
            view: WidthView::Word,
        },
        OpSize::Dword => GprView {
            index,
            view: WidthView::Dword,
        },
        OpSize::Qword => GprView {
            index,
            view: WidthView::Qword,
        },
    }
}

/// The register operand selected by the ModR/M reg field.
pub fn reg_operand(instr: &Instruction, modrm: ModRm, size: OpSize) -> Operand {
    Operand::Register(gpr_view(
        &instr.prefixes,
        modrm.reg,
        instr.prefixes.rex_r(),
        size,
    ))
}

/// The r/m operand: register-direct for mod=3, resolved memory otherwise.
///
/// `imm_bytes` is the number of immediate bytes the handler will fetch after
/// this operand (needed for RIP-relative resolution).
pub fn rm_operand(
    cpu: &mut Cpu,
    instr: &Instruction,
    modrm: ModRm,
    size: OpSize,
    imm_bytes: u64,
) -> Result<Operand, EmuError> {
    if modrm.md == 3 {
        return Ok(Operand::Register(gpr_view(
            &instr.prefixes,
            modrm.rm,
            instr.prefixes.rex_b(),
            size,
        )));
    }
    let addr = effective_address(cpu, instr, modrm, imm_bytes)?;
    Ok(Operand::Memory { addr, size })
}

/// Resolve the effective address of a memory r/m operand.
pub fn effective_address(
    cpu: &mut Cpu,
    instr: &Instruction,
    modrm: ModRm,
    imm_bytes: u64,
) -> Result<u64, EmuError> {
    let asize = instr.address_size(cpu.mode);
    match asize {
        AddrSize::A16 => effective_address_16(cpu, modrm),
        AddrSize::A32 | AddrSize::A64 => effective_address_sib(cpu, instr, modrm, asize, imm_bytes),
    }
}

fn word_reg(cpu: &Cpu, index: usize) -> u64 {
    cpu.regs.gpr64(index) & 0xFFFF
}

/// Classic 16-bit base table: {BX+SI, BX+DI, BP+SI, BP+DI, SI, DI, BP, BX}.
fn effective_address_16(cpu: &mut Cpu, modrm: ModRm) -> Result<u64, EmuError> {
    let mut addr = match modrm.rm {
        0 => word_reg(cpu, gpr::RBX).wrapping_add(word_reg(cpu, gpr::RSI)),
        1 => word_reg(cpu, gpr::RBX).wrapping_add(word_reg(cpu, gpr::RDI)),
        2 => word_reg(cpu, gpr::RBP).wrapping_add(word_reg(cpu, gpr::RSI)),
        3 => word_reg(cpu, gpr::RBP).wrapping_add(word_reg(cpu, gpr::RDI)),
        4 => word_reg(cpu, gpr::RSI),
        5 => word_reg(cpu, gpr::RDI),
        6 => {
            if modrm.md == 0 {
                // Pure disp16.
                return Ok(fetch_u16(cpu)? as u64);
            }
            word_reg(cpu, gpr::RBP)
        }
        _ => word_reg(cpu, gpr::RBX),
    };

    match modrm.md {
        1 => addr = addr.wrapping_add(fetch_i8(cpu)? as u64),
        2 => addr = addr.wrapping_add(fetch_i16(cpu)? as u64),
        _ => {}
    }
    Ok(addr & 0xFFFF)
}

/// 32/64-bit addressing with optional SIB and RIP-relative form.
fn effective_address_sib(
    cpu: &mut Cpu,
    instr: &Instruction,
    modrm: ModRm,
    asize: AddrSize,
    imm_bytes: u64,
) -> Result<u64, EmuError> {
    let prefixes = instr.prefixes;
    let mut addr: u64;
    let mut disp: i64 = 0;

    if modrm.rm == 4 {
        // SIB byte follows.
        let sib = fetch_u8(cpu)?;
        let scale = 1u64 << (sib >> 6);
        let index_raw = (sib >> 3) & 7;
        let base_raw = sib & 7;

        addr = 0;
        // index=4 without REX.X means "no index"; with REX.X it is R12.
        if index_raw != 4 || prefixes.rex_x() {
            let index = (index_raw as usize) + if prefixes.rex_x() { 8 } else { 0 };
            addr = cpu.regs.gpr64(index).wrapping_mul(scale);
        }
        if modrm.md == 0 && base_raw == 5 {
            // No base; disp32 follows immediately.
            disp = fetch_i32(cpu)?;
        } else {
            let base = (base_raw as usize) + if prefixes.rex_b() { 8 } else { 0 };
            addr = addr.wrapping_add(cpu.regs.gpr64(base));
        }
    } else if modrm.md == 0 && modrm.rm == 5 {
        let d = fetch_i32(cpu)?;
        if asize == AddrSize::A64 {
            // RIP-relative, measured from the end of the instruction.
            let end_rip = cpu.regs.rip.wrapping_add(imm_bytes);
            return Ok(end_rip.wrapping_add(d as u64));
        }
        // 32-bit addressing: absolute disp32.
        addr = 0;
        disp = d;
    } else {
        let base = (modrm.rm as usize) + if prefixes.rex_b() { 8 } else { 0 };
        addr = cpu.regs.gpr64(base);
    }

    match modrm.md {
        1 => disp = disp.wrapping_add(fetch_i8(cpu)?),
        2 => disp = disp.wrapping_add(fetch_i32(cpu)?),
        _ => {}
    }

    Ok(addr.wrapping_add(disp as u64) & asize.mask())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_cpu_with_code(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(1024 * 1024);
        cpu.mem.load(0x7C00, code).unwrap();
        cpu.regs.rip = 0x7C00;
        cpu
    }

    #[test]
    fn test_prefix_loop_collects_everything() {
        // 66 67 F3 48 0F B6 ...
        let mut cpu = real_cpu_with_code(&[0x66, 0x67, 0xF3, 0x48, 0x0F, 0xB6]);
        let instr = decode_instruction(&mut cpu).unwrap();
        assert!(instr.prefixes.operand_size_override);
        assert!(instr.prefixes.address_size_override);
        assert!(instr.prefixes.rep);
        assert!(instr.prefixes.rex_w());
        assert_eq!(instr.table, OpcodeTable::TwoByte);
        assert_eq!(instr.opcode, 0xB6);
        assert_eq!(instr.opcode16(), 0x0FB6);
        assert_eq!(instr.rip_start, 0x7C00);
        assert_eq!(cpu.regs.rip, 0x7C06);
    }

    #[test]
    fn test_operand_size_rules() {
        let mut instr = Instruction {
            rip_start: 0,
            prefixes: Prefixes::default(),
            table: OpcodeTable::OneByte,
            opcode: 0x89,
        };
        assert_eq!(instr.operand_size(CpuMode::Long), OpSize::Dword);
        assert_eq!(instr.operand_size(CpuMode::Real), OpSize::Word);
        assert_eq!(instr.operand_size(CpuMode::Protected), OpSize::Word);

        instr.prefixes.operand_size_override = true;
        assert_eq!(instr.operand_size(CpuMode::Long), OpSize::Word);
        assert_eq!(instr.operand_size(CpuMode::Real), OpSize::Dword);

        instr.prefixes.rex = Rex::new(0x48);
        // REX.W wins over 0x66 in long mode.
        assert_eq!(instr.operand_size(CpuMode::Long), OpSize::Qword);
    }

    #[test]
    fn test_address_size_rules() {
        let mut instr = Instruction {
            rip_start: 0,
            prefixes: Prefixes::default(),
            table: OpcodeTable::OneByte,
            opcode: 0x8B,
        };
        assert_eq!(instr.address_size(CpuMode::Real), AddrSize::A16);
        assert_eq!(instr.address_size(CpuMode::Protected), AddrSize::A32);
        assert_eq!(instr.address_size(CpuMode::Long), AddrSize::A64);

        instr.prefixes.address_size_override = true;
        assert_eq!(instr.address_size(CpuMode::Real), AddrSize::A32);
        assert_eq!(instr.address_size(CpuMode::Protected), AddrSize::A16);
        assert_eq!(instr.address_size(CpuMode::Long), AddrSize::A32);
    }

    #[test]
    fn test_high_byte_aliases_without_rex() {
        let prefixes = Prefixes::default();
        let view = gpr_view(&prefixes, 4, false, OpSize::Byte);
        assert_eq!(view.to_string(), "ah");
        let view = gpr_view(&prefixes, 7, false, OpSize::Byte);
        assert_eq!(view.to_string(), "bh");
    }

    #[test]
    fn test_rex_switches_to_spl_family() {
        let prefixes = Prefixes {
            rex: Rex::new(0x40),
            ..Prefixes::default()
        };
        let view = gpr_view(&prefixes, 4, false, OpSize::Byte);
        assert_eq!(view.to_string(), "spl");
        let view = gpr_view(&prefixes, 6, true, OpSize::Byte);
        assert_eq!(view.to_string(), "r14b");
    }

    #[test]
    fn test_16bit_base_table() {
        // 8B 00: mov ax, [bx+si] in real mode.
        let mut cpu = real_cpu_with_code(&[0x8B, 0x00]);
        cpu.regs.set_gpr64(gpr::RBX, 0x1000);
        cpu.regs.set_gpr64(gpr::RSI, 0x0234);
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Word, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x1234,
                size: OpSize::Word
            }
        );
    }

    #[test]
    fn test_16bit_pure_disp16() {
        // 8B 06 00 7D: mov ax, [0x7D00].
        let mut cpu = real_cpu_with_code(&[0x8B, 0x06, 0x00, 0x7D]);
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Word, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x7D00,
                size: OpSize::Word
            }
        );
    }

    #[test]
    fn test_16bit_address_wraps() {
        let mut cpu = real_cpu_with_code(&[0x8B, 0x40, 0x10]);
        // mod=01 rm=0 (bx+si+disp8); force a wrap past 0xFFFF.
        cpu.regs.set_gpr64(gpr::RBX, 0xFFF0);
        cpu.regs.set_gpr64(gpr::RSI, 0x0008);
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Word, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x0008,
                size: OpSize::Word
            }
        );
    }

    #[test]
    fn test_sib_scaled_index() {
        // In protected mode (A32): 8B 04 8B -> mov eax, [ebx + ecx*4].
        let mut cpu = real_cpu_with_code(&[0x8B, 0x04, 0x8B]);
        cpu.regs.cr0 = crate::cpu::mode::CR0_PE;
        cpu.update_mode();
        cpu.regs.set_gpr64(gpr::RBX, 0x1000);
        cpu.regs.set_gpr64(gpr::RCX, 0x10);
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Dword, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x1040,
                size: OpSize::Dword
            }
        );
    }

    #[test]
    fn test_sib_index_none_encoding() {
        // SIB index=4 without REX.X contributes nothing: 8B 04 24 -> [esp].
        let mut cpu = real_cpu_with_code(&[0x8B, 0x04, 0x24]);
        cpu.regs.cr0 = crate::cpu::mode::CR0_PE;
        cpu.update_mode();
        cpu.regs.set_gpr64(gpr::RSP, 0x2000);
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Dword, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x2000,
                size: OpSize::Dword
            }
        );
    }

    #[test]
    fn test_disp32_absolute_in_32bit_addressing() {
        // mod=0 rm=5 in protected mode is absolute disp32, not RIP-relative.
        let mut cpu = real_cpu_with_code(&[0x8B, 0x05, 0x00, 0x00, 0x20, 0x00]);
        cpu.regs.cr0 = crate::cpu::mode::CR0_PE;
        cpu.update_mode();
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Dword, 0).unwrap();
        assert_eq!(
            op,
            Operand::Memory {
                addr: 0x20_0000,
                size: OpSize::Dword
            }
        );
    }

    #[test]
    fn test_register_direct() {
        let mut cpu = real_cpu_with_code(&[0x01, 0xD8]); // add eax, ebx (mod=3)
        let instr = decode_instruction(&mut cpu).unwrap();
        let modrm = fetch_modrm(&mut cpu).unwrap();
        assert_eq!(modrm.md, 3);
        let op = rm_operand(&mut cpu, &instr, modrm, OpSize::Word, 0).unwrap();
        assert_eq!(
            op,
            Operand::Register(GprView {
                index: gpr::RAX,
                view: WidthView::Word
            })
        );
        let reg = reg_operand(&instr, modrm, OpSize::Word);
        assert_eq!(
            reg,
            Operand::Register(GprView {
                index: gpr::RBX,
                view: WidthView::Word
            })
        );
    }
}
