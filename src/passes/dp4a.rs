//! Recognition of the 4-way dot-product-accumulate shape.
//!
//! A chain of `add i32` whose leaves are exactly four `mul(ext(i8), ext(i8))`
//! products plus at most one accumulator collapses to a single fused `dp4a`
//! intrinsic call over two packed `<4 x i8>`-as-`i32` operands. Extension
//! signedness must be uniform per operand column (each side independently),
//! which selects among the four intrinsic variants.

use crate::builder::Builder;
use crate::pattern::Matcher;
use crate::platform::{PassFlags, PlatformCaps};
use crate::scalar;
use crate::{BinOp, Context, FuncDefBody, Inst, InstKind, Intrinsic, Value};
use itertools::Itertools;
use tracing::trace;

pub fn run(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, flags: &PassFlags) -> bool {
    if !flags.match_dp4a || !caps.has_dp4a {
        return false;
    }
    let mut changed = false;
    for block in func.block_order.clone() {
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            changed |= match_dp4a(cx, func, inst);
        }
    }
    changed
}

/// One product leaf: the pre-extension i8 sources and their signedness.
#[derive(Copy, Clone)]
struct ProductLeaf {
    a: Value,
    a_signed: bool,
    b: Value,
    b_signed: bool,
}

impl ProductLeaf {
    fn swapped(self) -> ProductLeaf {
        ProductLeaf { a: self.b, a_signed: self.b_signed, b: self.a, b_signed: self.a_signed }
    }
}

/// Collect the leaves of an add chain rooted at `root`. Interior adds must be
/// single-use so the whole chain dies once the root is replaced.
fn gather_chain_leaves(m: &Matcher<'_>, root: Inst, v: Value, out: &mut Vec<Value>) {
    if let Some((add, lhs, rhs)) = m.binop(v, BinOp::Add) {
        if add == root || m.one_use(add) {
            gather_chain_leaves(m, root, lhs, out);
            gather_chain_leaves(m, root, rhs, out);
            return;
        }
    }
    out.push(v);
}

fn match_product_leaf(m: &Matcher<'_>, v: Value) -> Option<ProductLeaf> {
    let (mul, lhs, rhs) = m.binop(v, BinOp::Mul)?;
    if !m.one_use(mul) {
        return None;
    }
    let (_, a_signed, a) = m.ext(lhs)?;
    let (_, b_signed, b) = m.ext(rhs)?;
    if m.int_width(a) != Some(8) || m.int_width(b) != Some(8) {
        return None;
    }
    Some(ProductLeaf { a, a_signed, b, b_signed })
}

/// Constant extract index of `v` from a shared source vector, if `v` is an
/// `extractelement` of exactly that vector.
fn shared_extract_index(m: &Matcher<'_>, shared: Value, v: Value) -> Option<u128> {
    let (_, vec, idx) = m.extract(v)?;
    if vec != shared {
        return None;
    }
    m.const_uint(idx)
}

fn match_dp4a(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    if !matches!(func.insts[inst].kind, InstKind::Binary(BinOp::Add))
        || m.int_width(Value::Inst(inst)) != Some(32)
    {
        return false;
    }
    // Only start from the topmost add of a chain.
    if let Some(u) = func.single_use(inst) {
        if matches!(func.insts[u.consumer].kind, InstKind::Binary(BinOp::Add)) {
            return false;
        }
    }

    let mut leaves = Vec::new();
    gather_chain_leaves(&m, inst, Value::Inst(inst), &mut leaves);

    let mut products = Vec::new();
    let mut accumulators = Vec::new();
    for &leaf in &leaves {
        match match_product_leaf(&m, leaf) {
            Some(p) => products.push(p),
            None => accumulators.push(leaf),
        }
    }
    if products.len() != 4 || accumulators.len() > 1 {
        return false;
    }

    // Per-column signedness must be uniform; individual products may be
    // commuted to line up with the first one.
    let (a_signed, b_signed) = (products[0].a_signed, products[0].b_signed);
    for p in &mut products[1..] {
        if (p.a_signed, p.b_signed) == (a_signed, b_signed) {
            continue;
        }
        let sw = p.swapped();
        if (sw.a_signed, sw.b_signed) == (a_signed, b_signed) {
            *p = sw;
        } else {
            return false;
        }
    }
    let intr = match (a_signed, b_signed) {
        (true, true) => Intrinsic::Dp4aSS,
        (true, false) => Intrinsic::Dp4aSU,
        (false, true) => Intrinsic::Dp4aUS,
        (false, false) => Intrinsic::Dp4aUU,
    };

    // If all 8 sources extract from one shared vector, packing the pairs in
    // ascending lhs-index order avoids a shuffle at emission time.
    if let Some((_, shared, _)) = m.extract(products[0].a) {
        let indices: Option<Vec<u128>> = products
            .iter()
            .map(|p| {
                let ia = shared_extract_index(&m, shared, p.a)?;
                shared_extract_index(&m, shared, p.b)?;
                Some(ia)
            })
            .collect();
        if let Some(indices) = indices {
            let mut order: Vec<usize> = (0..4).collect();
            order.sort_by_key(|&i| indices[i]);
            let distinct = order.iter().map(|&i| indices[i]).tuple_windows().all(|(x, y)| x < y);
            if distinct {
                products = order.into_iter().map(|i| products[i]).collect();
            }
        }
    }

    let i32_ty = cx.type_scalar(scalar::Type::I32);
    let i8x4_ty = cx.type_vector(scalar::Type::Int(scalar::IntWidth::I8), 4);
    let (root_lhs, root_rhs) = {
        let ops = &func.insts[inst].operands;
        (ops[0], ops[1])
    };
    let acc = accumulators
        .first()
        .copied()
        .unwrap_or(Value::Const(cx.const_int(scalar::Type::I32, 0)));

    let mut b = Builder::before(cx, func, inst);
    let pack = |b: &mut Builder<'_, '_>, pick: fn(&ProductLeaf) -> Value| -> Value {
        let mut vec = b.undef(i8x4_ty);
        for (j, p) in products.iter().enumerate() {
            let idx = b.const_int(scalar::Type::I32, j as u128);
            vec = b.insert_elem(vec, pick(p), idx);
        }
        b.bitcast(i32_ty, vec)
    };
    let packed_a = pack(&mut b, |p| p.a);
    let packed_b = pack(&mut b, |p| p.b);
    let call = b.call(intr, i32_ty, &[acc, packed_a, packed_b]);

    func.replace_all_uses_with(inst, call);
    func.erase(inst);
    func.erase_dead([root_lhs, root_rhs]);
    trace!(intr = intr.name(), "recomposed add chain into dp4a");
    true
}
