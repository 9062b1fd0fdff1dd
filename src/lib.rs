//! GPIR: the middle-end optimization layer of a GPU shader compiler.
//!
//! The crate owns a compact, mutable instruction graph (entities allocated by
//! a [`Context`], definitions stored in per-function arenas) and a family of
//! rewriting passes over it:
//!
//! * peephole pattern rewrites ([`passes::peephole`], [`passes::dp4a`],
//!   [`passes::narrow64`], [`passes::shrink_alloca`]),
//! * URB write coalescing ([`passes::urb_merge`]),
//! * integer bit-width legalization ([`passes::legalize`]).
//!
//! Every pass has the same contract: `run(...) -> bool`, where the return
//! value reports whether the function body was modified at all. Passes only
//! communicate through the mutated IR; there is no shared side-channel state
//! and no intra-pass concurrency.

use bitflags::bitflags;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;

// HACK deterministic-iteration-order maps/sets, with the ambient interning
// making the "keys are small indices" pattern pervasive enough that the
// default hasher is just wasted work.
pub type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

mod context;
pub use context::{AttrSet, Block, Const, Context, EntityDefs, Func, Inst, InternInCx, InternedStr, Type};

mod func;
pub use func::{FuncDefBody, Use};

pub mod builder;
pub mod interp;
pub mod pattern;
pub mod platform;
pub mod print;
pub mod scalar;

pub mod passes {
    // NOTE inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod dp4a;
    pub mod legalize;
    pub mod narrow64;
    pub mod peephole;
    pub mod shrink_alloca;
    pub mod urb_merge;

    use crate::platform::{PassFlags, PlatformCaps};
    use crate::{Context, FuncDefBody};

    /// Run the full middle-end pipeline over one function, in its fixed order.
    ///
    /// Returns whether anything changed, so callers can invalidate whatever
    /// analyses they cache across passes.
    pub fn run_function_pipeline(
        cx: &Context,
        func: &mut FuncDefBody,
        caps: &PlatformCaps,
        flags: &PassFlags,
    ) -> bool {
        let mut changed = false;
        changed |= peephole::run(cx, func, caps, flags);
        changed |= dp4a::run(cx, func, caps, flags);
        changed |= narrow64::run(cx, func, flags);
        changed |= shrink_alloca::run(cx, func, flags);
        changed |= urb_merge::run(cx, func, caps, flags);
        changed |= legalize::run(cx, func, caps, flags);
        changed
    }
}

// HACK this only serves to disallow modifying the `cx` field of `Module`.
mod sealed {
    use super::*;
    use std::rc::Rc;

    pub struct Module {
        /// Context used for everything interned, in this module.
        ///
        /// Notable choices made for this field:
        /// * private to disallow switching the context of a module
        /// * `Rc` sharing to allow multiple modules to use the same context
        ///   (`Context: !Sync` because of the interners so it can't be `Arc`)
        cx: Rc<Context>,

        pub funcs: EntityDefs<Func, FuncDecl>,
        pub func_order: Vec<Func>,
    }

    impl Module {
        pub fn new(cx: Rc<Context>) -> Self {
            Self { cx, funcs: Default::default(), func_order: Default::default() }
        }

        pub fn cx(&self) -> Rc<Context> {
            self.cx.clone()
        }

        pub fn cx_ref(&self) -> &Rc<Context> {
            &self.cx
        }
    }
}
pub use sealed::Module;

#[derive(Default, PartialEq, Eq, Hash)]
pub struct AttrSetDef {
    pub attrs: BTreeSet<Attr>,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attr {
    /// A human-readable name, carried purely for diagnostics and printing.
    Name(OrdAssertEq<InternedStr>),

    /// A debugger-visible binding of a source variable to this instruction's
    /// value. `inverted` records an extra XOR-with-1 the debugger must apply,
    /// used when a rewrite replaces a boolean with its complement but the
    /// debug info still describes the original.
    DebugValue { name: OrdAssertEq<InternedStr>, inverted: bool },
}

impl AttrSet {
    /// Intern a new set with `attr` added to `self`'s attributes.
    pub fn append(self, cx: &Context, attr: Attr) -> AttrSet {
        let mut attrs = cx[self].attrs.clone();
        attrs.insert(attr);
        cx.intern(AttrSetDef { attrs })
    }
}

// HACK wrapper to limit `Ord` for interned index types (e.g. `InternedStr`)
// to only situations where the interned index reflects contents (i.e. equality).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct OrdAssertEq<T>(pub T);

impl<T: Eq> PartialOrd for OrdAssertEq<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Eq> Ord for OrdAssertEq<T> {
    #[track_caller]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        assert!(
            self == other,
            "OrdAssertEq<{}>::cmp called with unequal values",
            std::any::type_name::<T>(),
        );
        std::cmp::Ordering::Equal
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
pub enum TypeDef {
    /// The unit of instructions executed only for their effect (stores, URB
    /// writes, barriers, control transfers).
    Void,
    Scalar(scalar::Type),
    Vector { elem: scalar::Type, count: u8 },
    /// A pointer into private (scratch) memory; the only address space the
    /// middle-end manipulates directly.
    Ptr,
}

impl TypeDef {
    pub fn as_scalar(&self) -> Option<scalar::Type> {
        match *self {
            TypeDef::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<(scalar::Type, u8)> {
        match *self {
            TypeDef::Vector { elem, count } => Some((elem, count)),
            _ => None,
        }
    }

    /// Total number of value bits (`None` for `Void`/`Ptr`).
    pub fn bit_width(&self) -> Option<u32> {
        match *self {
            TypeDef::Void | TypeDef::Ptr => None,
            TypeDef::Scalar(s) => Some(s.bit_width()),
            TypeDef::Vector { elem, count } => Some(elem.bit_width() * count as u32),
        }
    }
}

impl Context {
    pub fn type_void(&self) -> Type {
        self.intern(TypeDef::Void)
    }

    pub fn type_scalar(&self, s: scalar::Type) -> Type {
        self.intern(TypeDef::Scalar(s))
    }

    pub fn type_int(&self, bits: u32) -> Type {
        self.intern(TypeDef::Scalar(scalar::Type::int(bits)))
    }

    pub fn type_bool(&self) -> Type {
        self.intern(TypeDef::Scalar(scalar::Type::Bool))
    }

    pub fn type_vector(&self, elem: scalar::Type, count: u8) -> Type {
        self.intern(TypeDef::Vector { elem, count })
    }

    pub fn type_ptr(&self) -> Type {
        self.intern(TypeDef::Ptr)
    }

    pub fn const_scalar(&self, ct: scalar::Const) -> Const {
        self.intern(ConstDef { ty: self.type_scalar(ct.ty()), kind: ConstKind::Scalar(ct) })
    }

    pub fn const_int(&self, ty: scalar::Type, bits: u128) -> Const {
        self.const_scalar(scalar::Const::from_bits(ty, bits))
    }

    pub fn const_bool(&self, v: bool) -> Const {
        self.const_scalar(scalar::Const::from_bool(v))
    }

    pub fn const_undef(&self, ty: Type) -> Const {
        self.intern(ConstDef { ty, kind: ConstKind::Undef })
    }
}

#[derive(PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(PartialEq, Eq, Hash)]
pub enum ConstKind {
    Scalar(scalar::Const),
    /// One scalar constant per vector lane, in lane order.
    Vector(SmallVec<[Const; 4]>),
    Undef,
}

pub struct FuncDecl {
    pub attrs: AttrSet,

    pub name: InternedStr,

    pub ret_type: Type,

    pub def: FuncDefBody,
}

#[derive(Copy, Clone)]
pub struct FuncParam {
    pub attrs: AttrSet,

    pub ty: Type,
}

pub struct BlockDef {
    /// Instructions in program order; the last one is always the block's
    /// terminator (`Branch` or `Return`).
    pub insts: Vec<Inst>,
}

pub struct InstDef {
    pub attrs: AttrSet,

    pub kind: InstKind,

    /// Result type (`Void` for pure-effect instructions).
    pub ty: Type,

    pub operands: SmallVec<[Value; 2]>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    Binary(BinOp),

    ICmp(IcmpPred),

    /// Operands: `[cond, on_true, on_false]`.
    Select,

    /// Operands: `[src]`.
    Cast(CastOp),

    /// Operands are the incoming values, parallel to `incoming_blocks`.
    Phi { incoming_blocks: SmallVec<[Block; 2]> },

    /// Operands: `[vector, index]`.
    ExtractElement,

    /// Operands: `[vector, element, index]`.
    InsertElement,

    /// A private array of `len` elements of type `elem`; result is a `Ptr`.
    Alloca { elem: Type, len: u32 },

    /// Single-level, zero-based element address: operands `[base_ptr, index]`.
    Gep,

    /// Operands: `[ptr]`.
    Load,

    /// Operands: `[ptr, value]`.
    Store,

    /// A call to a target intrinsic; operand order is fixed per intrinsic and
    /// getting it wrong silently produces wrong results, so the vocabulary is
    /// a closed enum rather than interned names.
    Call(Intrinsic),

    /// A write of up to 8 dword channels into the Unified Return Buffer.
    ///
    /// Operands: `[dynamic_base,] data...` with one data operand per set
    /// `channel_mask` bit, in ascending channel order. The effective row is
    /// `dynamic_base + imm_offset` (or just `imm_offset` when there is no
    /// dynamic base).
    UrbWrite { imm_offset: u32, channel_mask: ChannelMask, has_dynamic_base: bool },

    /// A read of 4 dword channels; operands: `[dynamic_base]` or none.
    UrbRead { imm_offset: u32, has_dynamic_base: bool },

    /// Thread-group execution barrier; a synchronization point URB traffic
    /// must never be merged across.
    Barrier,

    /// Unconditional (`targets.len() == 1`, no operands) or conditional
    /// (`targets.len() == 2`, operand `[cond]`, taken order: true, false).
    Branch { targets: SmallVec<[Block; 2]> },

    /// Operands: `[value]` (or none for `Void` functions).
    Return,
}

impl InstKind {
    /// Whether erasing an unused instance would change program behavior.
    pub fn has_side_effects(&self) -> bool {
        match self {
            InstKind::Binary(_)
            | InstKind::ICmp(_)
            | InstKind::Select
            | InstKind::Cast(_)
            | InstKind::Phi { .. }
            | InstKind::ExtractElement
            | InstKind::InsertElement
            | InstKind::Gep
            | InstKind::Load
            | InstKind::Call(_) => false,

            // An unused alloca is removable, but only via `shrink_alloca`'s
            // use analysis, not blind dead-code erasure.
            InstKind::Alloca { .. } => true,

            InstKind::Store
            | InstKind::UrbWrite { .. }
            | InstKind::UrbRead { .. }
            | InstKind::Barrier
            | InstKind::Branch { .. }
            | InstKind::Return => true,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, InstKind::Branch { .. } | InstKind::Return)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IcmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl IcmpPred {
    /// The predicate computing the boolean complement.
    pub fn inverse(self) -> IcmpPred {
        match self {
            IcmpPred::Eq => IcmpPred::Ne,
            IcmpPred::Ne => IcmpPred::Eq,
            IcmpPred::Ult => IcmpPred::Uge,
            IcmpPred::Ule => IcmpPred::Ugt,
            IcmpPred::Ugt => IcmpPred::Ule,
            IcmpPred::Uge => IcmpPred::Ult,
            IcmpPred::Slt => IcmpPred::Sge,
            IcmpPred::Sle => IcmpPred::Sgt,
            IcmpPred::Sgt => IcmpPred::Sle,
            IcmpPred::Sge => IcmpPred::Slt,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IcmpPred::Slt | IcmpPred::Sle | IcmpPred::Sgt | IcmpPred::Sge)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    BitCast,
}

/// The target intrinsics the rewrite rules emit.
///
/// Operand orders (all results are single values):
/// * `Dp4a{SS,SU,US,UU}`: `(acc: i32, a: i32 as <4 x i8>, b: i32 as <4 x i8>)`,
///   result `acc + sum(ext(a[i]) * ext(b[i]))`; first letter is `a`'s
///   signedness, second is `b`'s.
/// * `Bfrev`: `(x: i32)`, result is `x` bit-reversed.
/// * `Uaddc`: `(a: i32, b: i32)`, result `<2 x i32>` of `(a + b, carry)`.
/// * `UMulH`: `(a: iN, b: iN)`, result is the high half of the `2N`-bit
///   unsigned product.
/// * `SimdShuffleXor`: `(x: i32, mask: i32)`, cross-lane value exchange.
/// * `TypedRead`: `(surface: i32, u: i32, v: i32)`, typed surface read.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Intrinsic {
    Dp4aSS,
    Dp4aSU,
    Dp4aUS,
    Dp4aUU,
    Bfrev,
    Uaddc,
    UMulH,
    SimdShuffleXor,
    TypedRead,
}

impl Intrinsic {
    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::Dp4aSS => "dp4a.ss",
            Intrinsic::Dp4aSU => "dp4a.su",
            Intrinsic::Dp4aUS => "dp4a.us",
            Intrinsic::Dp4aUU => "dp4a.uu",
            Intrinsic::Bfrev => "bfrev",
            Intrinsic::Uaddc => "uaddc",
            Intrinsic::UMulH => "umulh",
            Intrinsic::SimdShuffleXor => "simd.shuffle.xor",
            Intrinsic::TypedRead => "typed.read",
        }
    }
}

bitflags! {
    /// Which of up to 8 dword lanes of a URB write carry live data.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
    pub struct ChannelMask: u8 {
        const C0 = 1 << 0;
        const C1 = 1 << 1;
        const C2 = 1 << 2;
        const C3 = 1 << 3;
        const C4 = 1 << 4;
        const C5 = 1 << 5;
        const C6 = 1 << 6;
        const C7 = 1 << 7;
    }
}

impl ChannelMask {
    pub fn channel(i: u32) -> ChannelMask {
        assert!(i < 8);
        ChannelMask::from_bits_truncate(1 << i)
    }

    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }

    /// Set channel indices, in ascending order.
    pub fn channels(self) -> impl Iterator<Item = u32> {
        (0..8).filter(move |&i| self.bits() & (1 << i) != 0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    Const(Const),
    FuncParam { idx: u32 },
    Inst(Inst),
}

impl Value {
    pub fn as_inst(self) -> Option<Inst> {
        match self {
            Value::Inst(i) => Some(i),
            _ => None,
        }
    }
}
