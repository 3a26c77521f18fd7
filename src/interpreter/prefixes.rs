//! Instruction prefix state.
//!
//! The decoder consumes legacy prefixes and REX in a loop until it reads a
//! non-prefix byte; "last prefix wins" within each group. Only the prefixes
//! the ISA subset reacts to are kept; segment overrides and REP/LOCK are
//! recorded but have no effect on flat memory.

use crate::cpu::SegReg;

/// REX prefix byte (0x40..=0x4F) with bit accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rex {
    /// Raw prefix byte.
    pub byte: u8,
}

impl Rex {
    /// Wrap a byte if it is in the REX range.
    #[inline]
    pub fn new(byte: u8) -> Option<Self> {
        if (0x40..=0x4F).contains(&byte) {
            Some(Self { byte })
        } else {
            None
        }
    }

    /// REX.W: 64-bit operand size.
    #[inline]
    pub fn w(self) -> bool {
        self.byte & 0b1000 != 0
    }

    /// REX.R: extends ModR/M.reg.
    #[inline]
    pub fn r(self) -> bool {
        self.byte & 0b0100 != 0
    }

    /// REX.X: extends SIB.index.
    #[inline]
    pub fn x(self) -> bool {
        self.byte & 0b0010 != 0
    }

    /// REX.B: extends ModR/M.rm, SIB.base, or the opcode register field.
    #[inline]
    pub fn b(self) -> bool {
        self.byte & 0b0001 != 0
    }
}

/// Collected prefix state for one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    /// REX prefix, if present.
    pub rex: Option<Rex>,
    /// 0x66 operand-size override.
    pub operand_size_override: bool,
    /// 0x67 address-size override.
    pub address_size_override: bool,
    /// Segment override (recorded; memory is flat).
    pub segment: Option<SegReg>,
    /// F3 REP/REPE.
    pub rep: bool,
    /// F2 REPNE.
    pub repne: bool,
    /// F0 LOCK.
    pub lock: bool,
}

impl Prefixes {
    /// Any REX prefix present (switches byte encodings 4..8 from AH/CH/DH/BH
    /// to SPL/BPL/SIL/DIL).
    #[inline]
    pub fn has_rex(&self) -> bool {
        self.rex.is_some()
    }

    /// REX.W set.
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.map_or(false, Rex::w)
    }

    /// REX.R set.
    #[inline]
    pub fn rex_r(&self) -> bool {
        self.rex.map_or(false, Rex::r)
    }

    /// REX.X set.
    #[inline]
    pub fn rex_x(&self) -> bool {
        self.rex.map_or(false, Rex::x)
    }

    /// REX.B set.
    #[inline]
    pub fn rex_b(&self) -> bool {
        self.rex.map_or(false, Rex::b)
    }
}
