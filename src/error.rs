//! Error taxonomy for the emulator core.
//!
//! Page faults are the only recoverable error: the executor catches them,
//! restores RIP, and delivers vector 14 through the IDT. Everything else
//! terminates the run and is reported to the host.

use thiserror::Error;

/// Errors produced by the emulator core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmuError {
    /// Paging translation failed. Caught inside `step`; never escapes to the
    /// host unless delivery of the fault itself faults.
    #[error("page fault at 0x{addr:016X} (error code {err_code})")]
    PageFault {
        /// Faulting virtual address (becomes CR2).
        addr: u64,
        /// Page-fault error code pushed to the handler.
        err_code: u64,
    },

    /// Physical access past the end of memory. Distinct from a page fault:
    /// the translation succeeded but the physical address is bogus.
    #[error("physical access out of bounds: 0x{addr:016X}+{len} (memory size 0x{size:X})")]
    OutOfBounds {
        /// Offending physical address.
        addr: u64,
        /// Access length in bytes.
        len: usize,
        /// Total memory size.
        size: usize,
    },

    /// Opcode byte(s) with no handler. Two-byte opcodes are reported with
    /// the 0x0F escape folded in (e.g. 0x0FA2).
    #[error("unknown opcode 0x{opcode:02X} at RIP 0x{rip:016X}")]
    UnknownOpcode {
        /// Opcode value, 0x0F00-based for the two-byte table.
        opcode: u16,
        /// Address of the instruction that failed to decode.
        rip: u64,
    },

    /// Group opcode with an unimplemented /reg extension.
    #[error("unknown opcode 0x{opcode:02X} /{reg} at RIP 0x{rip:016X}")]
    UnknownGroupOp {
        /// Opcode value, 0x0F00-based for the two-byte table.
        opcode: u16,
        /// ModR/M reg field selecting the sub-operation.
        reg: u8,
        /// Address of the instruction that failed to decode.
        rip: u64,
    },

    /// Register name lookup failed (diagnostics path only).
    #[error("unknown register name: {name}")]
    BadRegister {
        /// The name that failed to parse.
        name: String,
    },

    /// Operand size not in {1, 2, 4, 8}. Indicates an implementation bug.
    #[error("unsupported operand size: {size} bytes")]
    BadOperandSize {
        /// The rejected size in bytes.
        size: u8,
    },

    /// Interrupt delivery found no present gate for the vector.
    #[error("double fault: no IDT gate present for vector {vector}")]
    DoubleFault {
        /// Vector whose gate was missing or not present.
        vector: u8,
    },

    /// `setup_identity_paging` was handed a region that is not page-granular.
    #[error("mapping size 0x{size:X} is not a multiple of 4 KiB")]
    UnalignedPagingSize {
        /// The rejected size in bytes.
        size: u64,
    },
}
