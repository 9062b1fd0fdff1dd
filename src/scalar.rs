//! Scalar (`bool`, integer, and floating-point) types and associated functionality.
//!
//! Unlike hardware registers, scalar integers here may have *any* bit width in
//! `1..=128`: the whole point of the width legalizer is that the incoming IR
//! routinely contains types like `i5`, `i48` or `i70`, which the target cannot
//! operate on natively. Whether a given width is "legal" is a property of the
//! platform (see [`crate::platform::PlatformCaps`]), not of the type itself.

use crate::{BinOp, IcmpPred};

// HACK this could be some `struct` with private fields, but this `enum`
// is only 2 bytes in size, and has better ergonomics overall.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    Bool,
    Int(IntWidth),
    Float(FloatWidth),
}

impl Type {
    // HACK only common widths, as a convenience, expand as-needed.
    pub const I8: Type = Type::Int(IntWidth::I8);
    pub const I16: Type = Type::Int(IntWidth::I16);
    pub const I32: Type = Type::Int(IntWidth::I32);
    pub const I64: Type = Type::Int(IntWidth::I64);
    pub const F32: Type = Type::Float(FloatWidth::F32);

    pub const fn int(bits: u32) -> Type {
        match IntWidth::try_from_bits(bits) {
            Some(w) => Type::Int(w),
            None => panic!("scalar::Type::int: width out of range"),
        }
    }

    pub const fn bit_width(self) -> u32 {
        match self {
            Type::Bool => 1,
            Type::Int(w) => w.bits(),
            Type::Float(w) => w.bits(),
        }
    }

    pub const fn is_int(self) -> bool {
        matches!(self, Type::Int(_))
    }
}

/// Bit-width of an integer type: anything in `1..=128`, with no implied
/// claim of hardware support.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct IntWidth {
    bits: u8,
}

impl IntWidth {
    pub const I8: Self = Self::try_from_bits_unwrap(8);
    pub const I16: Self = Self::try_from_bits_unwrap(16);
    pub const I32: Self = Self::try_from_bits_unwrap(32);
    pub const I64: Self = Self::try_from_bits_unwrap(64);

    const fn try_from_bits_unwrap(bits: u32) -> Self {
        match Self::try_from_bits(bits) {
            Some(w) => w,
            None => unreachable!(),
        }
    }

    pub const fn try_from_bits(bits: u32) -> Option<Self> {
        if bits == 0 || bits > 128 {
            return None;
        }
        Some(Self { bits: bits as u8 })
    }

    pub const fn bits(self) -> u32 {
        self.bits as u32
    }
}

/// Bit-width of a supported floating-point type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FloatWidth(u8);

impl FloatWidth {
    pub const F16: Self = Self(16);
    pub const F32: Self = Self(32);
    pub const F64: Self = Self(64);

    pub const fn try_from_bits(bits: u32) -> Option<Self> {
        match bits {
            16 | 32 | 64 => Some(Self(bits as u8)),
            _ => None,
        }
    }

    pub const fn bits(self) -> u32 {
        self.0 as u32
    }
}

/// A typed scalar constant, stored as its (zero-extended) raw bit pattern.
///
/// All integer arithmetic on `Const`s wraps at the type's bit width, i.e. it
/// follows two's-complement semantics at width `W` regardless of how the
/// value happens to be stored in the `u128`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Const {
    ty: Type,
    bits: u128,
}

impl Const {
    pub const FALSE: Const = Const::from_bool(false);
    pub const TRUE: Const = Const::from_bool(true);

    const fn from_bits_trunc(ty: Type, bits: u128) -> Const {
        let width = ty.bit_width();
        assert!(width <= 128);

        Const { ty, bits: bits & (!0u128 >> (128 - width)) }
    }

    pub const fn from_bits(ty: Type, bits: u128) -> Const {
        let ct_trunc = Const::from_bits_trunc(ty, bits);
        assert!(ct_trunc.bits == bits);
        ct_trunc
    }

    pub const fn try_from_bits(ty: Type, bits: u128) -> Option<Const> {
        let ct_trunc = Const::from_bits_trunc(ty, bits);
        if ct_trunc.bits == bits { Some(ct_trunc) } else { None }
    }

    pub const fn from_bool(v: bool) -> Const {
        Const::from_bits(Type::Bool, v as u128)
    }

    pub const fn from_u32(v: u32) -> Const {
        Const::from_bits(Type::I32, v as u128)
    }

    pub const fn from_u64(v: u64) -> Const {
        Const::from_bits(Type::I64, v as u128)
    }

    /// Returns `Some(ct)` iff `ty` is an integer type that can represent
    /// `v: i128` (i.e. `ct` has the same sign and absolute value as `v` does).
    pub fn int_try_from_i128(ty: Type, v: i128) -> Option<Const> {
        let ct_trunc = Const::from_bits_trunc(ty, v as u128);
        (ct_trunc.int_as_i128() == Some(v)).then_some(ct_trunc)
    }

    /// The two's-complement wrap of `v` at `ty`'s width.
    pub fn int_from_i128_wrapping(ty: Type, v: i128) -> Const {
        Const::from_bits_trunc(ty, v as u128)
    }

    pub const fn ty(&self) -> Type {
        self.ty
    }

    pub const fn bits(&self) -> u128 {
        self.bits
    }

    pub const fn is_zero(&self) -> bool {
        self.bits == 0
    }

    /// Returns `Some(v)` iff `self` is an integer (or bool) representable by
    /// `v: i128`, with the sign taken from the top bit at `self`'s width.
    pub fn int_as_i128(&self) -> Option<i128> {
        match self.ty {
            Type::Float(_) => None,
            Type::Bool => Some(self.bits as i128),
            Type::Int(_) => {
                let width = self.ty.bit_width();
                Some((self.bits as i128) << (128 - width) >> (128 - width))
            }
        }
    }

    pub fn int_as_u128(&self) -> Option<u128> {
        match self.ty {
            Type::Float(_) => None,
            Type::Bool | Type::Int(_) => Some(self.bits),
        }
    }

    pub fn int_as_u32(&self) -> Option<u32> {
        self.int_as_u128()?.try_into().ok()
    }

    /// `log2` of `self`, iff `self` is an integer power of two.
    pub fn int_log2_exact(&self) -> Option<u32> {
        let v = self.int_as_u128()?;
        (v != 0 && v.is_power_of_two()).then(|| v.trailing_zeros())
    }

    /// `log2` of `-self` (at `self`'s width), iff `-self` is a power of two.
    pub fn int_neg_log2_exact(&self) -> Option<u32> {
        let v = self.int_as_i128()?;
        let neg = v.checked_neg()?;
        (neg > 0 && (neg as u128).is_power_of_two()).then(|| (neg as u128).trailing_zeros())
    }

    /// Evaluate `op` over two constants of the same integer type, with
    /// two's-complement wraparound at the type's width.
    ///
    /// Division by zero (and any type mismatch) yields `None` rather than a
    /// panic, so constant folding can simply decline.
    pub fn int_binop(op: BinOp, a: Const, b: Const) -> Option<Const> {
        if a.ty != b.ty || matches!(a.ty, Type::Float(_)) {
            return None;
        }
        let ty = a.ty;
        let w = ty.bit_width();
        let (ua, ub) = (a.bits, b.bits);
        let bits = match op {
            BinOp::Add => ua.wrapping_add(ub),
            BinOp::Sub => ua.wrapping_sub(ub),
            BinOp::Mul => ua.wrapping_mul(ub),
            BinOp::And => ua & ub,
            BinOp::Or => ua | ub,
            BinOp::Xor => ua ^ ub,
            BinOp::UDiv => {
                if ub == 0 {
                    return None;
                }
                ua / ub
            }
            BinOp::SDiv => {
                let (sa, sb) = (a.int_as_i128()?, b.int_as_i128()?);
                if sb == 0 {
                    return None;
                }
                sa.wrapping_div(sb) as u128
            }
            BinOp::Shl => {
                let sh = ub as u32 % w;
                ua << sh
            }
            BinOp::LShr => {
                let sh = ub as u32 % w;
                ua >> sh
            }
            BinOp::AShr => {
                let sh = ub as u32 % w;
                (a.int_as_i128()? >> sh) as u128
            }
        };
        Some(Const::from_bits_trunc(ty, bits))
    }

    /// Evaluate an integer comparison over two constants of the same type.
    pub fn int_icmp(pred: IcmpPred, a: Const, b: Const) -> Option<bool> {
        if a.ty != b.ty || matches!(a.ty, Type::Float(_)) {
            return None;
        }
        let (ua, ub) = (a.bits, b.bits);
        let (sa, sb) = (a.int_as_i128()?, b.int_as_i128()?);
        Some(match pred {
            IcmpPred::Eq => ua == ub,
            IcmpPred::Ne => ua != ub,
            IcmpPred::Ult => ua < ub,
            IcmpPred::Ule => ua <= ub,
            IcmpPred::Ugt => ua > ub,
            IcmpPred::Uge => ua >= ub,
            IcmpPred::Slt => sa < sb,
            IcmpPred::Sle => sa <= sb,
            IcmpPred::Sgt => sa > sb,
            IcmpPred::Sge => sa >= sb,
        })
    }

    /// Zero-extend (or reinterpret) to a wider integer type.
    pub fn int_zext(&self, to: Type) -> Option<Const> {
        (to.is_int() && to.bit_width() >= self.ty.bit_width())
            .then(|| Const::from_bits_trunc(to, self.bits))
    }

    /// Sign-extend to a wider integer type.
    pub fn int_sext(&self, to: Type) -> Option<Const> {
        if !(to.is_int() && to.bit_width() >= self.ty.bit_width()) {
            return None;
        }
        Some(Const::from_bits_trunc(to, self.int_as_i128()? as u128))
    }

    /// Truncate to a narrower integer (or bool) type.
    pub fn int_trunc(&self, to: Type) -> Option<Const> {
        (!matches!(to, Type::Float(_)) && to.bit_width() <= self.ty.bit_width())
            .then(|| Const::from_bits_trunc(to, self.bits))
    }
}
