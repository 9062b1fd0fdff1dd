//! 64-to-32-bit truncating-AND narrowing.
//!
//! `(tree) & 0xFFFFFFFF` where `tree` is an i64 op-tree of
//! add/sub/mul/and/or/xor collapses to the same tree computed in i32 with one
//! final zero-extend: the mask makes the upper 32 bits of every interior
//! result unobservable, and all six ops commute with truncation. Interior
//! nodes must be single-use, otherwise narrowing would change a value some
//! other consumer still reads at full width.

use crate::builder::Builder;
use crate::pattern::Matcher;
use crate::platform::PassFlags;
use crate::scalar;
use crate::{BinOp, Context, FuncDefBody, Inst, Value};
use tracing::trace;

pub fn run(cx: &Context, func: &mut FuncDefBody, flags: &PassFlags) -> bool {
    if !flags.narrow_i64 {
        return false;
    }
    let mut changed = false;
    for block in func.block_order.clone() {
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            changed |= narrow_masked_tree(cx, func, inst);
        }
    }
    changed
}

fn narrowable_op(op: BinOp) -> bool {
    matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor)
}

/// Whether `v` is an interior node of a narrowable i64 op-tree (as opposed to
/// a leaf fed in from outside the tree).
fn is_interior(m: &Matcher<'_>, v: Value, is_root: bool) -> bool {
    match m.any_binop(v) {
        Some((inst, op, ..)) => {
            narrowable_op(op)
                && m.int_width(v) == Some(64)
                && (is_root || m.one_use(inst))
        }
        None => false,
    }
}

/// Rebuild the tree under `v` at i32, truncating at the leaves.
fn build_narrow(b: &mut Builder<'_, '_>, i32_ty: crate::Type, v: Value, is_root: bool) -> Value {
    let (op, lhs, rhs) = {
        let m = Matcher::new(b.cx(), b.func);
        if !is_interior(&m, v, is_root) {
            return v;
        }
        let (_, op, lhs, rhs) = m.any_binop(v).unwrap();
        (op, lhs, rhs)
    };
    let nl = build_narrow(b, i32_ty, lhs, false);
    let nl = b.trunc(i32_ty, nl);
    let nr = build_narrow(b, i32_ty, rhs, false);
    let nr = b.trunc(i32_ty, nr);
    b.binop(op, nl, nr)
}

fn narrow_masked_tree(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (root_and, _, tree, mask, _) = match m.binop_with_const(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    if !matches!(func.insts[inst].kind, crate::InstKind::Binary(BinOp::And))
        || m.int_width(Value::Inst(inst)) != Some(64)
        || mask.int_as_u128() != Some(0xFFFF_FFFF)
        || !is_interior(&m, tree, true)
    {
        return false;
    }
    // The tree root must feed only the mask.
    let tree_inst = m.inst(tree).unwrap();
    if !m.one_use(tree_inst) {
        return false;
    }

    let i32_ty = cx.type_scalar(scalar::Type::I32);
    let i64_ty = cx.type_scalar(scalar::Type::I64);
    let mut b = Builder::before(cx, func, root_and);
    let narrow = build_narrow(&mut b, i32_ty, tree, true);
    let widened = b.zext(i64_ty, narrow);

    func.replace_all_uses_with(root_and, widened);
    func.erase(root_and);
    func.erase_dead([tree]);
    trace!("narrowed masked i64 op-tree to i32");
    true
}
