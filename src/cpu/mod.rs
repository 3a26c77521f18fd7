//! CPU state and the host-facing execution surface.
//!
//! A [`Cpu`] is a plain value owned by the host: register file, physical
//! memory, I/O bus, and the pending-interrupt queue. One [`Cpu::step`] call
//! decodes and executes one instruction (or delivers one interrupt), exactly
//! as the interpreter defines it.

pub mod flags;
pub mod mode;
pub mod registers;

use std::collections::VecDeque;

use crate::error::EmuError;
use crate::io::IoBus;
use crate::mem::mmu::{self, Access, PAGE_SIZE};
use crate::mem::PhysicalMemory;

pub use mode::CpuMode;
pub use registers::{GprView, OpSize, RegisterFile, SegReg, WidthView};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// An instruction (or interrupt delivery) retired; more work may follow.
    Running,
    /// The CPU is halted with nothing pending.
    Halted,
}

/// One emulated processor plus its memory and I/O fabric.
pub struct Cpu {
    /// Architectural register state.
    pub regs: RegisterFile,
    /// Flat physical memory.
    pub mem: PhysicalMemory,
    /// Port-mapped I/O bus.
    pub bus: IoBus,
    /// Current operating mode, derived from CR0/CR4/EFER.
    pub mode: CpuMode,
    /// Set by HLT; cleared by interrupt delivery.
    pub halted: bool,
    /// Instructions retired (interrupt deliveries count as one).
    pub steps: u64,
    interrupt_queue: VecDeque<u8>,
}

impl Cpu {
    /// Create a CPU with `memory_bytes` of zeroed physical memory, in real
    /// mode with all registers clear.
    pub fn new(memory_bytes: usize) -> Self {
        Self {
            regs: RegisterFile::new(),
            mem: PhysicalMemory::new(memory_bytes),
            bus: IoBus::new(),
            mode: CpuMode::Real,
            halted: false,
            steps: 0,
            interrupt_queue: VecDeque::new(),
        }
    }

    /// Execute one step. See `interpreter::exec` for the full contract.
    pub fn step(&mut self) -> Result<StepResult, EmuError> {
        crate::interpreter::exec::step(self)
    }

    /// Queue an interrupt vector for delivery at the next step with IF=1.
    pub fn raise_interrupt(&mut self, vector: u8) {
        log::trace!("interrupt {} queued", vector);
        self.interrupt_queue.push_back(vector);
    }

    /// Dequeue the next pending vector, if any.
    pub(crate) fn take_pending_interrupt(&mut self) -> Option<u8> {
        self.interrupt_queue.pop_front()
    }

    /// True when at least one interrupt is queued.
    pub fn has_pending_interrupt(&self) -> bool {
        !self.interrupt_queue.is_empty()
    }

    /// Recompute the operating mode after a CR0/CR4/EFER write.
    pub fn update_mode(&mut self) {
        let new_mode = CpuMode::from_control(self.regs.cr0, self.regs.cr4, self.regs.efer);
        if new_mode != self.mode {
            log::info!("mode change: {:?} -> {:?}", self.mode, new_mode);
            self.mode = new_mode;
        }
    }

    /// Translate a virtual address under the current mode and CR3.
    pub fn translate(&self, vaddr: u64, access: Access) -> Result<u64, EmuError> {
        mmu::translate(&self.mem, self.mode, self.regs.cr3, vaddr, access)
    }

    /// Read `size` bytes at a virtual address, little-endian, zero-extended.
    ///
    /// Accesses that cross a page boundary are split and each page is
    /// translated on its own, so a fault can land on either half.
    pub fn read_virt(&self, vaddr: u64, size: OpSize, access: Access) -> Result<u64, EmuError> {
        let total = size.bytes();
        let end = vaddr.wrapping_add(total - 1);
        if vaddr & !(PAGE_SIZE - 1) == end & !(PAGE_SIZE - 1) {
            let phys = self.translate(vaddr, access)?;
            return self.mem.read(phys, size);
        }

        let mut value = 0u64;
        let mut done = 0u64;
        while done < total {
            let addr = vaddr.wrapping_add(done);
            let phys = self.translate(addr, access)?;
            let in_page = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))).min(total - done);
            for i in 0..in_page {
                value |= (self.mem.read_u8(phys + i)? as u64) << (8 * (done + i));
            }
            done += in_page;
        }
        Ok(value)
    }

    /// Write `size` bytes at a virtual address, little-endian, splitting at
    /// page boundaries like [`Cpu::read_virt`].
    pub fn write_virt(&mut self, vaddr: u64, value: u64, size: OpSize) -> Result<(), EmuError> {
        let total = size.bytes();
        let end = vaddr.wrapping_add(total - 1);
        if vaddr & !(PAGE_SIZE - 1) == end & !(PAGE_SIZE - 1) {
            let phys = self.translate(vaddr, Access::Write)?;
            return self.mem.write(phys, value, size);
        }

        let mut done = 0u64;
        while done < total {
            let addr = vaddr.wrapping_add(done);
            let phys = self.translate(addr, Access::Write)?;
            let in_page = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))).min(total - done);
            for i in 0..in_page {
                self.mem.write_u8(phys + i, (value >> (8 * (done + i))) as u8)?;
            }
            done += in_page;
        }
        Ok(())
    }

    /// Push an 8-byte value (interrupt frames are always qword-sized).
    pub(crate) fn push64(&mut self, value: u64) -> Result<(), EmuError> {
        let rsp = self.regs.rsp().wrapping_sub(8);
        self.regs.set_rsp(rsp);
        self.write_virt(rsp, value, OpSize::Qword)
    }

    /// Pop an 8-byte value.
    pub(crate) fn pop64(&mut self) -> Result<u64, EmuError> {
        let rsp = self.regs.rsp();
        let value = self.read_virt(rsp, OpSize::Qword, Access::Read)?;
        self.regs.set_rsp(rsp.wrapping_add(8));
        Ok(value)
    }

    /// Print a register dump to stdout.
    pub fn print_summary(&self) {
        println!("CPU state ({:?} mode, {} steps, halted={})", self.mode, self.steps, self.halted);
        for row in 0..4 {
            let mut line = String::new();
            for col in 0..4 {
                let index = row * 4 + col;
                line.push_str(&format!(
                    "{:>4}=0x{:016X} ",
                    registers::GprView::qword(index).to_string(),
                    self.regs.gpr64(index)
                ));
            }
            println!("  {}", line.trim_end());
        }
        println!(
            "  rip=0x{:016X} rflags=0x{:X} (CF={} ZF={} SF={} OF={} IF={})",
            self.regs.rip,
            self.regs.flags.assemble(),
            self.regs.flags.cf as u8,
            self.regs.flags.zf as u8,
            self.regs.flags.sf as u8,
            self.regs.flags.of as u8,
            self.regs.flags.iflag as u8,
        );
        println!(
            "  cr0=0x{:X} cr2=0x{:X} cr3=0x{:X} cr4=0x{:X} efer=0x{:X}",
            self.regs.cr0, self.regs.cr2, self.regs.cr3, self.regs.cr4, self.regs.efer
        );
        println!(
            "  idtr={{base=0x{:X} limit=0x{:X}}} gdtr={{base=0x{:X} limit=0x{:X}}}",
            self.regs.idtr.base, self.regs.idtr.limit, self.regs.gdtr.base, self.regs.gdtr.limit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::setup_identity_paging;

    fn long_mode_cpu() -> Cpu {
        let mut cpu = Cpu::new(8 * 1024 * 1024);
        let pml4 =
            setup_identity_paging(&mut cpu.mem, 0, 0, 0x20_0000, 0x40_0000).unwrap();
        cpu.regs.cr3 = pml4;
        cpu.regs.cr0 = mode::CR0_PE | mode::CR0_PG;
        cpu.regs.cr4 = mode::CR4_PAE;
        cpu.regs.efer = mode::EFER_LME;
        cpu.update_mode();
        cpu
    }

    #[test]
    fn test_virtual_round_trip() {
        let mut cpu = long_mode_cpu();
        cpu.write_virt(0x1000, 0xDEAD, OpSize::Word).unwrap();
        assert_eq!(
            cpu.read_virt(0x1000, OpSize::Word, Access::Read).unwrap(),
            0xDEAD
        );
    }

    #[test]
    fn test_cross_page_access_splits() {
        let mut cpu = long_mode_cpu();
        // Straddles the 0x1000 page boundary.
        cpu.write_virt(0x1FFC, 0x1122_3344_5566_7788, OpSize::Qword)
            .unwrap();
        assert_eq!(
            cpu.read_virt(0x1FFC, OpSize::Qword, Access::Read).unwrap(),
            0x1122_3344_5566_7788
        );
        // Both halves landed at their identity-mapped physical addresses.
        assert_eq!(cpu.mem.read_u32(0x1FFC).unwrap(), 0x5566_7788);
        assert_eq!(cpu.mem.read_u32(0x2000).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_cross_page_fault_on_unmapped_half() {
        let mut cpu = long_mode_cpu();
        // The mapped region ends at 0x20_0000; the second half faults.
        let err = cpu
            .write_virt(0x1F_FFFC, 0, OpSize::Qword)
            .unwrap_err();
        assert!(matches!(err, EmuError::PageFault { err_code: 0, .. }));
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut cpu = long_mode_cpu();
        cpu.regs.set_rsp(0x8000);
        cpu.push64(0x1111).unwrap();
        cpu.push64(0x2222).unwrap();
        assert_eq!(cpu.regs.rsp(), 0x8000 - 16);
        assert_eq!(cpu.pop64().unwrap(), 0x2222);
        assert_eq!(cpu.pop64().unwrap(), 0x1111);
        assert_eq!(cpu.regs.rsp(), 0x8000);
    }

    #[test]
    fn test_interrupt_queue_is_fifo() {
        let mut cpu = Cpu::new(4096);
        cpu.raise_interrupt(32);
        cpu.raise_interrupt(33);
        assert_eq!(cpu.take_pending_interrupt(), Some(32));
        assert_eq!(cpu.take_pending_interrupt(), Some(33));
        assert_eq!(cpu.take_pending_interrupt(), None);
    }

    #[test]
    fn test_mode_update_follows_control_registers() {
        let mut cpu = Cpu::new(4096);
        assert_eq!(cpu.mode, CpuMode::Real);
        cpu.regs.cr0 = mode::CR0_PE;
        cpu.update_mode();
        assert_eq!(cpu.mode, CpuMode::Protected);
        cpu.regs.cr0 |= mode::CR0_PG;
        cpu.regs.cr4 = mode::CR4_PAE;
        cpu.regs.efer = mode::EFER_LME;
        cpu.update_mode();
        assert_eq!(cpu.mode, CpuMode::Long);
    }
}
