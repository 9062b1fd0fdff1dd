//! Declarative shape matching over the instruction graph.
//!
//! A [`Matcher`] is a read-only view; every method either returns `None`
//! (the overwhelmingly common, silent "no match" path) or a binding of `Copy`
//! handles/values that outlives the matcher, so a rule can finish matching
//! before it starts mutating.

use crate::scalar;
use crate::{
    BinOp, Block, CastOp, Context, FuncDefBody, IcmpPred, Inst, InstKind, Type, Value,
};

#[derive(Copy, Clone)]
pub struct Matcher<'a> {
    pub cx: &'a Context,
    pub func: &'a FuncDefBody,
}

impl<'a> Matcher<'a> {
    pub fn new(cx: &'a Context, func: &'a FuncDefBody) -> Self {
        Matcher { cx, func }
    }

    /// The defining instruction of `v`, if it is an instruction result.
    pub fn inst(&self, v: Value) -> Option<Inst> {
        v.as_inst().filter(|&i| self.func.insts.contains(i))
    }

    pub fn ty(&self, v: Value) -> Type {
        self.func.value_type(self.cx, v)
    }

    pub fn scalar_ty(&self, v: Value) -> Option<scalar::Type> {
        self.cx[self.ty(v)].as_scalar()
    }

    pub fn int_width(&self, v: Value) -> Option<u32> {
        match self.scalar_ty(v)? {
            scalar::Type::Int(w) => Some(w.bits()),
            _ => None,
        }
    }

    /// Whether `inst`'s value is consumed by exactly one operand edge.
    pub fn one_use(&self, inst: Inst) -> bool {
        self.func.use_count(inst) == 1
    }

    // --- opcode shapes ---

    pub fn binop(&self, v: Value, op: BinOp) -> Option<(Inst, Value, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Binary(o) if o == op => {
                let ops = &self.func.insts[inst].operands;
                Some((inst, ops[0], ops[1]))
            }
            _ => None,
        }
    }

    pub fn any_binop(&self, v: Value) -> Option<(Inst, BinOp, Value, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Binary(op) => {
                let ops = &self.func.insts[inst].operands;
                Some((inst, op, ops[0], ops[1]))
            }
            _ => None,
        }
    }

    pub fn icmp(&self, v: Value) -> Option<(Inst, IcmpPred, Value, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::ICmp(pred) => {
                let ops = &self.func.insts[inst].operands;
                Some((inst, pred, ops[0], ops[1]))
            }
            _ => None,
        }
    }

    pub fn cast(&self, v: Value, op: CastOp) -> Option<(Inst, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Cast(o) if o == op => Some((inst, self.func.insts[inst].operands[0])),
            _ => None,
        }
    }

    pub fn any_cast(&self, v: Value) -> Option<(Inst, CastOp, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Cast(op) => Some((inst, op, self.func.insts[inst].operands[0])),
            _ => None,
        }
    }

    /// Either `zext` or `sext`; the `bool` is `true` for `sext`.
    pub fn ext(&self, v: Value) -> Option<(Inst, bool, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Cast(CastOp::SExt) => Some((inst, true, self.func.insts[inst].operands[0])),
            InstKind::Cast(CastOp::ZExt) => Some((inst, false, self.func.insts[inst].operands[0])),
            _ => None,
        }
    }

    pub fn select(&self, v: Value) -> Option<(Inst, Value, Value, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::Select => {
                let ops = &self.func.insts[inst].operands;
                Some((inst, ops[0], ops[1], ops[2]))
            }
            _ => None,
        }
    }

    pub fn phi(&self, v: Value) -> Option<(Inst, Vec<(Value, Block)>)> {
        let inst = self.inst(v)?;
        match &self.func.insts[inst].kind {
            InstKind::Phi { incoming_blocks } => {
                let incoming = self.func.insts[inst]
                    .operands
                    .iter()
                    .copied()
                    .zip(incoming_blocks.iter().copied())
                    .collect();
                Some((inst, incoming))
            }
            _ => None,
        }
    }

    pub fn extract(&self, v: Value) -> Option<(Inst, Value, Value)> {
        let inst = self.inst(v)?;
        match self.func.insts[inst].kind {
            InstKind::ExtractElement => {
                let ops = &self.func.insts[inst].operands;
                Some((inst, ops[0], ops[1]))
            }
            _ => None,
        }
    }

    // --- constants ---

    pub fn const_scalar(&self, v: Value) -> Option<scalar::Const> {
        self.func.as_const_scalar(self.cx, v)
    }

    pub fn const_uint(&self, v: Value) -> Option<u128> {
        self.const_scalar(v)?.int_as_u128()
    }

    pub fn const_int(&self, v: Value) -> Option<i128> {
        self.const_scalar(v)?.int_as_i128()
    }

    pub fn is_const_uint(&self, v: Value, expected: u128) -> bool {
        self.const_uint(v) == Some(expected)
    }

    /// Matches `xor v, true` over booleans (the canonical "logical not").
    pub fn bool_not(&self, v: Value) -> Option<(Inst, Value)> {
        let (inst, a, b) = self.binop(v, BinOp::Xor)?;
        if self.scalar_ty(v)? != scalar::Type::Bool {
            return None;
        }
        // Commuted constant operand.
        if self.const_uint(b) == Some(1) {
            Some((inst, a))
        } else if self.const_uint(a) == Some(1) {
            Some((inst, b))
        } else {
            None
        }
    }

    /// A binary op with one constant operand: returns (inst, op, non-const,
    /// const, const-is-rhs).
    pub fn binop_with_const(
        &self,
        v: Value,
    ) -> Option<(Inst, BinOp, Value, scalar::Const, bool)> {
        let (inst, op, a, b) = self.any_binop(v)?;
        if let Some(cb) = self.const_scalar(b) {
            Some((inst, op, a, cb, true))
        } else if let Some(ca) = self.const_scalar(a) {
            Some((inst, op, b, ca, false))
        } else {
            None
        }
    }
}
