//! Arithmetic flag computation.
//!
//! All helpers are width-parametric: operands are masked to the operand
//! width, the result is computed with enough headroom that carries past the
//! top bit are observable, and CF/ZF/SF/OF fall out of the masked values.
//!
//! CF and OF follow the usual asymmetry: CF is the unsigned overflow of the
//! exact operation, OF compares the signs of the operands against the sign
//! of the result.

use super::registers::{OpSize, RFlags};

/// The four arithmetic flags an ALU operation produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AluFlags {
    /// Carry flag: unsigned overflow.
    pub cf: bool,
    /// Zero flag: masked result is zero.
    pub zf: bool,
    /// Sign flag: top bit of the masked result.
    pub sf: bool,
    /// Overflow flag: signed overflow.
    pub of: bool,
}

impl RFlags {
    /// Copy arithmetic flags in, leaving IF untouched.
    pub fn apply_arith(&mut self, f: AluFlags) {
        self.cf = f.cf;
        self.zf = f.zf;
        self.sf = f.sf;
        self.of = f.of;
    }
}

#[inline]
fn zf_sf(result: u64, size: OpSize) -> (bool, bool) {
    (result == 0, result & size.sign_bit() != 0)
}

/// `a + b + carry_in` at the given width. Returns the masked result and
/// flags. ADC passes the incoming CF as `carry_in`.
pub fn add_with_flags(a: u64, b: u64, carry_in: bool, size: OpSize) -> (u64, AluFlags) {
    let mask = size.mask();
    let a = a & mask;
    let b = b & mask;
    let carry = carry_in as u128;

    let wide = a as u128 + b as u128 + carry;
    let result = (wide as u64) & mask;

    let (zf, sf) = zf_sf(result, size);
    let cf = wide > mask as u128;

    // Effective second operand for the sign comparison (ADC semantics).
    let b_eff = (b.wrapping_add(carry_in as u64)) & mask;
    let sign = size.sign_bit();
    let of = (a & sign) == (b_eff & sign) && (a & sign) != (result & sign);

    (result, AluFlags { cf, zf, sf, of })
}

/// `a - b - borrow_in` at the given width. Returns the masked result and
/// flags. SBB passes the incoming CF as `borrow_in`.
pub fn sub_with_flags(a: u64, b: u64, borrow_in: bool, size: OpSize) -> (u64, AluFlags) {
    let mask = size.mask();
    let a = a & mask;
    let b = b & mask;

    let b_eff_wide = b as u128 + borrow_in as u128;
    let result = a
        .wrapping_sub(b)
        .wrapping_sub(borrow_in as u64)
        & mask;

    let (zf, sf) = zf_sf(result, size);
    let cf = (a as u128) < b_eff_wide;

    let b_eff = (b.wrapping_add(borrow_in as u64)) & mask;
    let sign = size.sign_bit();
    let of = (a & sign) != (b_eff & sign) && (a & sign) != (result & sign);

    (result, AluFlags { cf, zf, sf, of })
}

/// Flags for AND/OR/XOR/TEST: CF and OF clear, ZF/SF from the result.
pub fn logic_flags(result: u64, size: OpSize) -> AluFlags {
    let (zf, sf) = zf_sf(result & size.mask(), size);
    AluFlags {
        cf: false,
        zf,
        sf,
        of: false,
    }
}

/// SHL by a pre-masked count. Returns `None` for count 0 (flags untouched,
/// value unchanged).
pub fn shl_with_flags(a: u64, count: u32, size: OpSize) -> Option<(u64, AluFlags)> {
    if count == 0 {
        return None;
    }
    let mask = size.mask();
    let a = a & mask;
    let bits = size.bits();

    let wide = (a as u128) << count;
    let result = (wide as u64) & mask;
    let cf = (wide >> bits) & 1 != 0;
    let (zf, sf) = zf_sf(result, size);
    // OF is defined for 1-bit shifts only.
    let of = count == 1 && (result & size.sign_bit() != 0) != cf;

    Some((result, AluFlags { cf, zf, sf, of }))
}

/// SHR by a pre-masked count. Returns `None` for count 0.
pub fn shr_with_flags(a: u64, count: u32, size: OpSize) -> Option<(u64, AluFlags)> {
    if count == 0 {
        return None;
    }
    let mask = size.mask();
    let a = a & mask;

    let cf = if count <= 64 {
        (a >> (count - 1)) & 1 != 0
    } else {
        false
    };
    let result = if count < 64 { a >> count } else { 0 };
    let (zf, sf) = zf_sf(result, size);
    let of = count == 1 && a & size.sign_bit() != 0;

    Some((result, AluFlags { cf, zf, sf, of }))
}

/// SAR by a pre-masked count. Returns `None` for count 0.
pub fn sar_with_flags(a: u64, count: u32, size: OpSize) -> Option<(u64, AluFlags)> {
    if count == 0 {
        return None;
    }
    let mask = size.mask();
    let a = a & mask;

    // Sign-extend the masked operand before shifting.
    let sign_extended = if a & size.sign_bit() != 0 {
        (a | !mask) as i64 as i128
    } else {
        a as i128
    };

    let cf = (sign_extended >> (count.min(127) - 1).min(127)) & 1 != 0;
    let result = ((sign_extended >> count.min(127)) as u64) & mask;
    let (zf, sf) = zf_sf(result, size);

    Some((
        result,
        AluFlags {
            cf,
            zf,
            sf,
            of: false,
        },
    ))
}
