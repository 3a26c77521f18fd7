//! End-to-end execution scenarios.
//!
//! Each test builds a complete CPU, loads a program, and drives it through
//! `step` the way a host would, checking the architectural outcome rather
//! than any internal state.

#[cfg(test)]
mod tests {
    use crate::cpu::registers::gpr;
    use crate::cpu::{Cpu, CpuMode, StepResult};
    use crate::error::EmuError;
    use crate::mem::{setup_identity_paging, Access};
    use crate::testing::{long_mode_cpu, write_idt_gate, ProgramBuilder, IDT_BASE, STACK_TOP};

    const MEM: usize = 8 * 1024 * 1024;
    const LOAD: u64 = 0x7C00;

    fn load_program(cpu: &mut Cpu, program: &ProgramBuilder) {
        cpu.mem.load(LOAD, program.bytes()).unwrap();
        cpu.regs.rip = LOAD;
    }

    fn run_until_halt(cpu: &mut Cpu, max_steps: u32) {
        for _ in 0..max_steps {
            match cpu.step().expect("fatal error during scenario") {
                StepResult::Running => {}
                StepResult::Halted => return,
            }
        }
        panic!("program did not halt within {} steps", max_steps);
    }

    #[test]
    fn test_arithmetic_and_compares() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program
            .mov_ri64(gpr::RAX as u8, 5)
            .mov_ri64(gpr::RBX as u8, 3)
            .add_rr64(gpr::RAX as u8, gpr::RBX as u8)
            .mov_ri32(gpr::RCX as u8, 0xFFFF_FFFF)
            .mov_ri32(gpr::RDX as u8, 1)
            .sub_rr32(gpr::RCX as u8, gpr::RDX as u8)
            .hlt();
        load_program(&mut cpu, &program);

        run_until_halt(&mut cpu, 32);

        assert_eq!(cpu.regs.gpr64(gpr::RAX), 8);
        // The 32-bit SUB zero-extends into the full register.
        assert_eq!(cpu.regs.gpr64(gpr::RCX), 0x0000_0000_FFFF_FFFE);
        // 0xFFFFFFFF - 1 borrows nothing; the sign bit of the result is set.
        assert!(!cpu.regs.flags.cf);
        assert!(cpu.regs.flags.sf);
        assert!(!cpu.regs.flags.zf);
    }

    #[test]
    fn test_conditional_jump_taken_on_equal() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program
            .mov_ri64(gpr::RAX as u8, 5)
            .mov_ri64(gpr::RBX as u8, 5)
            .cmp_rr64(gpr::RAX as u8, gpr::RBX as u8)
            // Skip the marker write when equal.
            .je(5)
            .mov_ri32(gpr::RDI as u8, 1)
            .hlt();
        load_program(&mut cpu, &program);

        run_until_halt(&mut cpu, 32);

        assert!(cpu.regs.flags.zf);
        assert_eq!(cpu.regs.gpr64(gpr::RDI), 0, "je must skip the marker");
    }

    #[test]
    fn test_conditional_jump_taken_on_not_equal() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program
            .mov_ri64(gpr::RAX as u8, 0x10)
            .mov_ri64(gpr::RBX as u8, 5)
            .cmp_rr64(gpr::RAX as u8, gpr::RBX as u8)
            .jne(5)
            .mov_ri32(gpr::RDI as u8, 1)
            .hlt();
        load_program(&mut cpu, &program);

        run_until_halt(&mut cpu, 32);

        assert!(!cpu.regs.flags.zf);
        assert_eq!(cpu.regs.gpr64(gpr::RDI), 0, "jne must skip the marker");
    }

    #[test]
    fn test_paging_smoke() {
        let mut cpu = Cpu::new(MEM);
        let pml4 = setup_identity_paging(&mut cpu.mem, 0, 0, 0x20_0000, 0x20_0000).unwrap();
        cpu.regs.cr3 = pml4;
        cpu.regs.cr0 = crate::cpu::mode::CR0_PE | crate::cpu::mode::CR0_PG;
        cpu.regs.cr4 = crate::cpu::mode::CR4_PAE;
        cpu.regs.efer = crate::cpu::mode::EFER_LME;
        cpu.update_mode();

        assert_eq!(cpu.translate(0x7C00, Access::Execute).unwrap(), 0x7C00);

        cpu.write_virt(0x1000, 0xDEAD, crate::cpu::OpSize::Word).unwrap();
        assert_eq!(
            cpu.read_virt(0x1000, crate::cpu::OpSize::Word, Access::Read)
                .unwrap(),
            0xDEAD
        );
    }

    #[test]
    fn test_page_fault_delivery() {
        let mut cpu = long_mode_cpu(MEM);
        cpu.regs.idtr.base = IDT_BASE;
        cpu.regs.idtr.limit = 255 * 16 + 15;
        let handler = 0x8000u64;
        write_idt_gate(&mut cpu, 14, handler);
        // Handler just halts.
        cpu.mem.write_u8(handler, 0xF4).unwrap();

        let unmapped = 0x4000_0000u64;
        let mut program = ProgramBuilder::new();
        program
            .mov_ri64(gpr::RAX as u8, unmapped)
            .load64(gpr::RBX as u8, gpr::RAX as u8)
            .hlt();
        load_program(&mut cpu, &program);

        let rsp_before = cpu.regs.rsp();
        // mov rax; then the faulting load is retired as a delivered #PF.
        assert_eq!(cpu.step().unwrap(), StepResult::Running);
        assert_eq!(cpu.step().unwrap(), StepResult::Running);

        assert_eq!(cpu.regs.rip, handler);
        // RFLAGS, CS, RIP, error code, vector: five qwords.
        assert_eq!(cpu.regs.rsp(), rsp_before - 40);
        assert_eq!(cpu.regs.cr2, unmapped);
        assert_eq!(cpu.mem.read_u64(rsp_before - 32).unwrap(), 0);
        assert_eq!(cpu.mem.read_u64(rsp_before - 40).unwrap(), 14);

        run_until_halt(&mut cpu, 4);
    }

    #[test]
    fn test_call_ret_round_trip() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program
            .call_rel32(1) // over the hlt, to the ret
            .hlt()
            .ret();
        load_program(&mut cpu, &program);

        let rsp_before = cpu.regs.rsp();
        run_until_halt(&mut cpu, 8);

        // Returned to the instruction after the call, then halted there.
        assert_eq!(cpu.regs.rip, LOAD + 6);
        assert_eq!(cpu.regs.rsp(), rsp_before);
    }

    #[test]
    fn test_stack_round_trip() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program
            .mov_ri64(gpr::R8 as u8, 0x1111_2222_3333_4444)
            .mov_ri64(gpr::R9 as u8, 0x5555_6666_7777_8888)
            .push_r(gpr::R8 as u8)
            .push_r(gpr::R9 as u8)
            .pop_r(gpr::RSI as u8)
            .pop_r(gpr::RDI as u8)
            .hlt();
        load_program(&mut cpu, &program);

        run_until_halt(&mut cpu, 16);

        assert_eq!(cpu.regs.gpr64(gpr::RSI), 0x5555_6666_7777_8888);
        assert_eq!(cpu.regs.gpr64(gpr::RDI), 0x1111_2222_3333_4444);
        assert_eq!(cpu.regs.rsp(), STACK_TOP);
    }

    #[test]
    fn test_hlt_wakes_on_pending_interrupt() {
        let mut cpu = long_mode_cpu(MEM);
        cpu.regs.idtr.base = IDT_BASE;
        let handler = 0x8000u64;
        write_idt_gate(&mut cpu, 32, handler);
        cpu.mem.write_u8(handler, 0xF4).unwrap();

        let mut program = ProgramBuilder::new();
        program.sti().hlt().hlt();
        load_program(&mut cpu, &program);

        run_until_halt(&mut cpu, 4);
        assert!(cpu.halted);
        assert_eq!(cpu.step().unwrap(), StepResult::Halted);

        cpu.raise_interrupt(32);
        assert_eq!(cpu.step().unwrap(), StepResult::Running);
        assert!(!cpu.halted);
        assert_eq!(cpu.regs.rip, handler);
        // The vector number tops the frame.
        assert_eq!(cpu.mem.read_u64(cpu.regs.rsp()).unwrap(), 32);
    }

    #[test]
    fn test_unknown_opcode_leaves_rip() {
        let mut cpu = long_mode_cpu(MEM);
        let mut program = ProgramBuilder::new();
        program.raw(&[0x0F, 0xA2]); // cpuid is outside the subset
        load_program(&mut cpu, &program);

        let err = cpu.step().unwrap_err();
        assert_eq!(
            err,
            EmuError::UnknownOpcode {
                opcode: 0x0FA2,
                rip: LOAD
            }
        );
        assert_eq!(cpu.regs.rip, LOAD);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let build = || {
            let mut cpu = long_mode_cpu(MEM);
            let mut program = ProgramBuilder::new();
            program
                .mov_ri64(gpr::RAX as u8, 0x1234)
                .push_r(gpr::RAX as u8)
                .pop_r(gpr::RBX as u8)
                .add_rr64(gpr::RBX as u8, gpr::RAX as u8)
                .shl_ri64(gpr::RBX as u8, 3)
                .hlt();
            load_program(&mut cpu, &program);
            cpu
        };

        let mut a = build();
        let mut b = build();
        run_until_halt(&mut a, 32);
        run_until_halt(&mut b, 32);

        assert_eq!(a.steps, b.steps);
        for index in 0..16 {
            assert_eq!(a.regs.gpr64(index), b.regs.gpr64(index));
        }
        assert_eq!(a.regs.rip, b.regs.rip);
        assert_eq!(a.regs.flags, b.regs.flags);
    }

    /// The canonical boot flow: real mode -> paging armed by the guest ->
    /// long mode, all driven by executed instructions.
    #[test]
    fn test_real_mode_to_long_mode_boot() {
        let mut cpu = Cpu::new(MEM);
        // The host prepares identity tables; the guest arms them.
        let pml4 = setup_identity_paging(&mut cpu.mem, 0, 0, 0x20_0000, 0x20_0000).unwrap();

        let mut program = ProgramBuilder::new();
        program.cli();
        // mov ebx, pml4
        program.raw(&[0x66, 0xBB]);
        program.raw(&(pml4 as u32).to_le_bytes());
        // mov cr3, ebx
        program.raw(&[0x0F, 0x22, 0xDB]);
        // mov eax, CR4_PAE; mov cr4, eax
        program.raw(&[0x66, 0xB8, 0x20, 0x00, 0x00, 0x00]);
        program.raw(&[0x0F, 0x22, 0xE0]);
        // mov ecx, EFER; mov eax, LME; xor edx, edx; wrmsr
        program.raw(&[0x66, 0xB9, 0x80, 0x00, 0x00, 0xC0]);
        program.raw(&[0x66, 0xB8, 0x00, 0x01, 0x00, 0x00]);
        program.raw(&[0x66, 0x31, 0xD2]);
        program.raw(&[0x0F, 0x30]);
        // mov eax, PG|PE; mov cr0, eax
        program.raw(&[0x66, 0xB8, 0x01, 0x00, 0x00, 0x80]);
        program.raw(&[0x0F, 0x22, 0xC0]);
        // Long mode from here on.
        program.mov_ri64(gpr::RAX as u8, 0x1234_5678_9ABC_DEF0);
        program.hlt();

        let image = program.boot_sector();
        crate::emu::load_boot_image(&mut cpu, &image, LOAD).unwrap();
        cpu.regs.set_rsp(STACK_TOP);

        assert_eq!(cpu.mode, CpuMode::Real);
        run_until_halt(&mut cpu, 64);

        assert_eq!(cpu.mode, CpuMode::Long);
        assert_eq!(cpu.regs.cr3, pml4);
        assert_eq!(cpu.regs.gpr64(gpr::RAX), 0x1234_5678_9ABC_DEF0);
        assert_eq!(cpu.translate(0x7C00, Access::Execute).unwrap(), 0x7C00);
    }
}
