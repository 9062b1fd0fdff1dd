//! Instruction builder with an insertion point and constant folding.
//!
//! Rewrite rules construct replacement subgraphs through a [`Builder`]; any
//! operation over interned constants folds on the spot, so passes never
//! materialize `zext(const)`-style scaffolding.

use crate::scalar;
use crate::{
    AttrSet, BinOp, Block, CastOp, ChannelMask, Const, ConstDef, ConstKind, Context, FuncDefBody,
    IcmpPred, Inst, InstDef, InstKind, Intrinsic, Type, TypeDef, Value,
};
use smallvec::SmallVec;

#[derive(Copy, Clone)]
enum InsertPt {
    /// Keeps inserting immediately before the anchor, so consecutively
    /// emitted instructions stay in emission order.
    Before(Inst),
    End(Block),
}

pub struct Builder<'a, 'cx> {
    cx: &'cx Context,
    pub func: &'a mut FuncDefBody,
    attrs: AttrSet,
    point: InsertPt,
}

impl<'a, 'cx> Builder<'a, 'cx> {
    pub fn before(cx: &'cx Context, func: &'a mut FuncDefBody, anchor: Inst) -> Self {
        Builder { cx, func, attrs: AttrSet::default(), point: InsertPt::Before(anchor) }
    }

    pub fn at_end(cx: &'cx Context, func: &'a mut FuncDefBody, block: Block) -> Self {
        Builder { cx, func, attrs: AttrSet::default(), point: InsertPt::End(block) }
    }

    /// Attach `attrs` to every instruction emitted from now on.
    pub fn with_attrs(mut self, attrs: AttrSet) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn cx(&self) -> &'cx Context {
        self.cx
    }

    fn emit(&mut self, kind: InstKind, ty: Type, operands: SmallVec<[Value; 2]>) -> Value {
        let def = InstDef { attrs: self.attrs, kind, ty, operands };
        let inst = match self.point {
            InsertPt::Before(anchor) => self.func.insert_inst_before(self.cx, anchor, def),
            InsertPt::End(block) => self.func.append_inst(self.cx, block, def),
        };
        Value::Inst(inst)
    }

    // --- constants ---

    pub fn const_scalar(&self, ct: scalar::Const) -> Value {
        Value::Const(self.cx.const_scalar(ct))
    }

    pub fn const_int(&self, ty: scalar::Type, bits: u128) -> Value {
        self.const_scalar(scalar::Const::from_bits(ty, bits))
    }

    pub fn const_bool(&self, v: bool) -> Value {
        self.const_scalar(scalar::Const::from_bool(v))
    }

    pub fn undef(&self, ty: Type) -> Value {
        Value::Const(self.cx.const_undef(ty))
    }

    fn scalar_const_of(&self, v: Value) -> Option<scalar::Const> {
        self.func.as_const_scalar(self.cx, v)
    }

    // --- data ops ---

    pub fn binop(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        let ty = self.func.value_type(self.cx, a);
        debug_assert_eq!(ty, self.func.value_type(self.cx, b));
        if let (Some(ca), Some(cb)) = (self.scalar_const_of(a), self.scalar_const_of(b)) {
            if let Some(ct) = scalar::Const::int_binop(op, ca, cb) {
                return self.const_scalar(ct);
            }
        }
        self.emit(InstKind::Binary(op), ty, [a, b].into_iter().collect())
    }

    pub fn icmp(&mut self, pred: IcmpPred, a: Value, b: Value) -> Value {
        if let (Some(ca), Some(cb)) = (self.scalar_const_of(a), self.scalar_const_of(b)) {
            if let Some(r) = scalar::Const::int_icmp(pred, ca, cb) {
                return self.const_bool(r);
            }
        }
        let bool_ty = self.cx.type_bool();
        self.emit(InstKind::ICmp(pred), bool_ty, [a, b].into_iter().collect())
    }

    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> Value {
        if let Some(c) = self.scalar_const_of(cond) {
            return if c.bits() != 0 { on_true } else { on_false };
        }
        let ty = self.func.value_type(self.cx, on_true);
        self.emit(InstKind::Select, ty, [cond, on_true, on_false].into_iter().collect())
    }

    pub fn cast(&mut self, op: CastOp, to: Type, v: Value) -> Value {
        let from = self.func.value_type(self.cx, v);
        if from == to {
            return v;
        }
        if let Value::Const(ct) = v {
            if let Some(folded) = const_cast(self.cx, op, to, ct) {
                return Value::Const(folded);
            }
        }
        self.emit(InstKind::Cast(op), to, [v].into_iter().collect())
    }

    pub fn zext(&mut self, to: Type, v: Value) -> Value {
        self.cast(CastOp::ZExt, to, v)
    }

    pub fn sext(&mut self, to: Type, v: Value) -> Value {
        self.cast(CastOp::SExt, to, v)
    }

    pub fn trunc(&mut self, to: Type, v: Value) -> Value {
        self.cast(CastOp::Trunc, to, v)
    }

    pub fn bitcast(&mut self, to: Type, v: Value) -> Value {
        self.cast(CastOp::BitCast, to, v)
    }

    pub fn extract(&mut self, vec: Value, idx: Value) -> Value {
        let (elem, _) = self.cx[self.func.value_type(self.cx, vec)]
            .as_vector()
            .expect("extractelement from non-vector");
        if let (Value::Const(cv), Some(ci)) = (vec, self.scalar_const_of(idx)) {
            let i = ci.int_as_u32().unwrap() as usize;
            match &self.cx[cv].kind {
                ConstKind::Vector(lanes) => return Value::Const(lanes[i]),
                ConstKind::Undef => {
                    let elem_ty = self.cx.type_scalar(elem);
                    return self.undef(elem_ty);
                }
                ConstKind::Scalar(_) => unreachable!(),
            }
        }
        let elem_ty = self.cx.type_scalar(elem);
        self.emit(InstKind::ExtractElement, elem_ty, [vec, idx].into_iter().collect())
    }

    pub fn insert_elem(&mut self, vec: Value, elem: Value, idx: Value) -> Value {
        let ty = self.func.value_type(self.cx, vec);
        if let (Value::Const(cv), Value::Const(ce), Some(ci)) =
            (vec, elem, self.scalar_const_of(idx))
        {
            let (elem_scalar, count) = self.cx[ty].as_vector().unwrap();
            let i = ci.int_as_u32().unwrap() as usize;
            assert!(i < count as usize);
            let mut lanes: SmallVec<[Const; 4]> = match &self.cx[cv].kind {
                ConstKind::Vector(lanes) => lanes.clone(),
                ConstKind::Undef => {
                    let elem_ty = self.cx.type_scalar(elem_scalar);
                    (0..count).map(|_| self.cx.const_undef(elem_ty)).collect()
                }
                ConstKind::Scalar(_) => unreachable!(),
            };
            lanes[i] = ce;
            return Value::Const(self.cx.intern(ConstDef { ty, kind: ConstKind::Vector(lanes) }));
        }
        self.emit(InstKind::InsertElement, ty, [vec, elem, idx].into_iter().collect())
    }

    pub fn call(&mut self, intr: Intrinsic, ret: Type, args: &[Value]) -> Value {
        self.emit(InstKind::Call(intr), ret, args.iter().copied().collect())
    }

    pub fn phi(&mut self, ty: Type, incoming: &[(Value, Block)]) -> Value {
        let incoming_blocks = incoming.iter().map(|&(_, b)| b).collect();
        let operands = incoming.iter().map(|&(v, _)| v).collect();
        self.emit(InstKind::Phi { incoming_blocks }, ty, operands)
    }

    // --- memory ---

    pub fn alloca(&mut self, elem: Type, len: u32) -> Value {
        let ptr = self.cx.type_ptr();
        self.emit(InstKind::Alloca { elem, len }, ptr, SmallVec::new())
    }

    pub fn gep(&mut self, base: Value, idx: Value) -> Value {
        let ptr = self.cx.type_ptr();
        self.emit(InstKind::Gep, ptr, [base, idx].into_iter().collect())
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.emit(InstKind::Load, ty, [ptr].into_iter().collect())
    }

    pub fn store(&mut self, ptr: Value, v: Value) -> Value {
        let void = self.cx.type_void();
        self.emit(InstKind::Store, void, [ptr, v].into_iter().collect())
    }

    // --- URB & control ---

    pub fn urb_write(
        &mut self,
        imm_offset: u32,
        channel_mask: ChannelMask,
        dynamic_base: Option<Value>,
        data: &[Value],
    ) -> Value {
        assert_eq!(channel_mask.count() as usize, data.len());
        let void = self.cx.type_void();
        let operands = dynamic_base.into_iter().chain(data.iter().copied()).collect();
        self.emit(
            InstKind::UrbWrite {
                imm_offset,
                channel_mask,
                has_dynamic_base: dynamic_base.is_some(),
            },
            void,
            operands,
        )
    }

    pub fn urb_read(&mut self, imm_offset: u32, dynamic_base: Option<Value>) -> Value {
        let ty = self.cx.type_vector(scalar::Type::I32, 4);
        let operands = dynamic_base.into_iter().collect();
        self.emit(
            InstKind::UrbRead { imm_offset, has_dynamic_base: dynamic_base.is_some() },
            ty,
            operands,
        )
    }

    pub fn barrier(&mut self) -> Value {
        let void = self.cx.type_void();
        self.emit(InstKind::Barrier, void, SmallVec::new())
    }

    pub fn br(&mut self, target: Block) -> Value {
        let void = self.cx.type_void();
        self.emit(
            InstKind::Branch { targets: [target].into_iter().collect() },
            void,
            SmallVec::new(),
        )
    }

    pub fn cond_br(&mut self, cond: Value, on_true: Block, on_false: Block) -> Value {
        let void = self.cx.type_void();
        self.emit(
            InstKind::Branch { targets: [on_true, on_false].into_iter().collect() },
            void,
            [cond].into_iter().collect(),
        )
    }

    pub fn ret(&mut self, v: Option<Value>) -> Value {
        let void = self.cx.type_void();
        self.emit(InstKind::Return, void, v.into_iter().collect())
    }
}

/// Fold a cast of an interned constant, if the combination is expressible.
pub fn const_cast(cx: &Context, op: CastOp, to: Type, ct: Const) -> Option<Const> {
    if let ConstKind::Undef = cx[ct].kind {
        return Some(cx.const_undef(to));
    }
    match op {
        CastOp::ZExt | CastOp::SExt | CastOp::Trunc => {
            let s = match &cx[ct].kind {
                ConstKind::Scalar(s) => *s,
                _ => return None,
            };
            let to_scalar = cx[to].as_scalar()?;
            let folded = match op {
                CastOp::ZExt => s.int_zext(to_scalar)?,
                CastOp::SExt => s.int_sext(to_scalar)?,
                CastOp::Trunc => s.int_trunc(to_scalar)?,
                CastOp::BitCast => unreachable!(),
            };
            Some(cx.const_scalar(folded))
        }
        CastOp::BitCast => {
            let from_ty = cx[ct].ty;
            let width = cx[from_ty].bit_width()?;
            if width != cx[to].bit_width()? || width > 128 {
                return None;
            }
            let bits = const_to_bits(cx, ct)?;
            const_from_bits(cx, to, bits)
        }
    }
}

/// Raw little-endian-lane bit pattern of an integer scalar/vector constant.
pub fn const_to_bits(cx: &Context, ct: Const) -> Option<u128> {
    match &cx[ct].kind {
        ConstKind::Scalar(s) => match s.ty() {
            scalar::Type::Float(_) => None,
            _ => Some(s.bits()),
        },
        ConstKind::Vector(lanes) => {
            let (elem, _) = cx[cx[ct].ty].as_vector()?;
            let ew = elem.bit_width();
            let mut bits = 0u128;
            for (i, &lane) in lanes.iter().enumerate() {
                let lane_bits = match &cx[lane].kind {
                    ConstKind::Scalar(s) => s.bits(),
                    // An undef lane poisons bit-level reinterpretation.
                    _ => return None,
                };
                bits |= lane_bits << (i as u32 * ew);
            }
            Some(bits)
        }
        ConstKind::Undef => None,
    }
}

/// Rebuild a constant of type `to` from a raw bit pattern.
pub fn const_from_bits(cx: &Context, to: Type, bits: u128) -> Option<Const> {
    match &cx[to] {
        TypeDef::Scalar(s) => match s {
            scalar::Type::Float(_) => None,
            _ => Some(cx.const_scalar(scalar::Const::from_bits(*s, bits))),
        },
        TypeDef::Vector { elem, count } => {
            if matches!(elem, scalar::Type::Float(_)) {
                return None;
            }
            let ew = elem.bit_width();
            let mask = if ew == 128 { !0u128 } else { (1u128 << ew) - 1 };
            let lanes: SmallVec<[Const; 4]> = (0..*count)
                .map(|i| {
                    cx.const_scalar(scalar::Const::from_bits(*elem, (bits >> (i as u32 * ew)) & mask))
                })
                .collect();
            Some(cx.intern(ConstDef { ty: to, kind: ConstKind::Vector(lanes) }))
        }
        TypeDef::Void | TypeDef::Ptr => None,
    }
}
