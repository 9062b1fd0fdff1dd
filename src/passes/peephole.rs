//! Local pattern rewrites: boolean-not canonicalization, power-of-two
//! strength reduction, cast hoisting over `select`/`phi`, and the bit-trick
//! recompositions (`bfrev`, `uaddc`).
//!
//! Each rule checks every precondition before its first mutation; a failed
//! match is a silent no-op. Rules must also recognize their own output as
//! already-canonical, so a second sweep over rewritten IR reports no change.

use crate::builder::{const_cast, Builder};
use crate::pattern::Matcher;
use crate::platform::{PassFlags, PlatformCaps};
use crate::scalar;
use crate::{
    Attr, AttrSetDef, BinOp, CastOp, Const, Context, FuncDefBody, IcmpPred, Inst, InstKind,
    Intrinsic, Type, Value,
};
use tracing::trace;

pub fn run(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, flags: &PassFlags) -> bool {
    let mut changed = false;
    for block in func.block_order.clone() {
        // Snapshot: rules may erase instructions behind the cursor.
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            changed |= rewrite_inst(cx, func, caps, flags, inst);
        }
    }
    changed
}

fn rewrite_inst(
    cx: &Context,
    func: &mut FuncDefBody,
    caps: &PlatformCaps,
    flags: &PassFlags,
    inst: Inst,
) -> bool {
    if flags.canonicalize_bool_not && canonicalize_bool_not(cx, func, inst) {
        return true;
    }
    if flags.strength_reduce && strength_reduce(cx, func, inst) {
        return true;
    }
    if flags.hoist_casts && hoist_cast_over_select(cx, func, inst) {
        return true;
    }
    if flags.hoist_casts && hoist_cast_over_phi(cx, func, inst) {
        return true;
    }
    if flags.match_bfrev && match_bfrev(cx, func, inst) {
        return true;
    }
    if flags.match_uaddc && caps.has_uaddc && match_uaddc(cx, func, inst) {
        return true;
    }
    false
}

/// `c = icmp P a, b; x = xor c, true` where every use of `c` is the xor, a
/// branch condition, or a select condition: invert `P` in place, compensate
/// `c`'s direct consumers (swap successors / swap select arms), and redirect
/// the xor's consumers to the now-complemented compare.
fn canonicalize_bool_not(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (xor_inst, src) = match m.bool_not(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    let cmp = match m.icmp(src) {
        Some((cmp, ..)) => cmp,
        None => return false,
    };

    // Every use of the compare must be compensatable.
    for u in func.uses_of(cmp) {
        if u.consumer == xor_inst {
            continue;
        }
        let ok = match &func.insts[u.consumer].kind {
            InstKind::Branch { targets } => targets.len() == 2 && u.operand_idx == 0,
            InstKind::Select => u.operand_idx == 0,
            _ => false,
        };
        if !ok {
            return false;
        }
    }

    let pred = match func.insts[cmp].kind {
        InstKind::ICmp(p) => p,
        _ => unreachable!(),
    };
    let cmp_users: Vec<crate::Use> = func.uses_of(cmp).to_vec();

    func.insts[cmp].kind = InstKind::ICmp(pred.inverse());

    // The compare now computes the complement: its own debug values need an
    // extra inversion, while the xor's describe exactly the new value and
    // migrate as-is.
    let mut attrs = std::collections::BTreeSet::new();
    for attr in &cx[func.insts[cmp].attrs].attrs {
        attrs.insert(match attr.clone() {
            Attr::DebugValue { name, inverted } => Attr::DebugValue { name, inverted: !inverted },
            other => other,
        });
    }
    for attr in &cx[func.insts[xor_inst].attrs].attrs {
        if let Attr::DebugValue { .. } = attr {
            attrs.insert(attr.clone());
        }
    }
    func.insts[cmp].attrs = cx.intern(AttrSetDef { attrs });

    for u in cmp_users {
        if u.consumer == xor_inst {
            continue;
        }
        match &mut func.insts[u.consumer].kind {
            InstKind::Branch { targets } => targets.swap(0, 1),
            InstKind::Select => {
                let on_true = func.insts[u.consumer].operands[1];
                let on_false = func.insts[u.consumer].operands[2];
                func.set_operand(u.consumer, 1, on_false);
                func.set_operand(u.consumer, 2, on_true);
            }
            _ => unreachable!(),
        }
    }

    func.replace_all_uses_with(xor_inst, Value::Inst(cmp));
    func.erase(xor_inst);
    trace!(?cmp, "canonicalized boolean not into inverted compare");
    true
}

/// `mul x, ±2^k` and `sdiv x, 2^k` over scalar integers.
fn strength_reduce(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (_, op, x, c, const_is_rhs) = match m.binop_with_const(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    let w = match m.scalar_ty(Value::Inst(inst)) {
        Some(scalar::Type::Int(w)) => w.bits(),
        _ => return false,
    };
    let ty = c.ty();

    let replacement = match op {
        BinOp::Mul => {
            if let Some(k) = c.int_log2_exact() {
                if k == 0 {
                    Some(x)
                } else {
                    let mut b = Builder::before(cx, func, inst);
                    let amt = b.const_int(ty, k as u128);
                    Some(b.binop(BinOp::Shl, x, amt))
                }
            } else if let Some(k) = c.int_neg_log2_exact() {
                let mut b = Builder::before(cx, func, inst);
                let shifted = if k == 0 {
                    x
                } else {
                    let amt = b.const_int(ty, k as u128);
                    b.binop(BinOp::Shl, x, amt)
                };
                let zero = b.const_int(ty, 0);
                Some(b.binop(BinOp::Sub, zero, shifted))
            } else {
                None
            }
        }
        // The divisor must be positive as a signed value: 2^(w-1) is a power
        // of two in raw bits but reads as the minimum value at width w, and
        // the bias/shift sequence below does not divide by that.
        BinOp::SDiv if const_is_rhs && c.int_as_i128().map_or(false, |v| v > 0) => {
            match c.int_log2_exact() {
                Some(0) => Some(x),
                // x / 2^k == (x + ((x >> w-1) >>u w-k)) >>s k, rounding toward
                // zero for negative x.
                Some(k) => {
                    let mut b = Builder::before(cx, func, inst);
                    let sign = {
                        let amt = b.const_int(ty, (w - 1) as u128);
                        b.binop(BinOp::AShr, x, amt)
                    };
                    let bias = {
                        let amt = b.const_int(ty, (w - k) as u128);
                        b.binop(BinOp::LShr, sign, amt)
                    };
                    let biased = b.binop(BinOp::Add, x, bias);
                    let amt = b.const_int(ty, k as u128);
                    Some(b.binop(BinOp::AShr, biased, amt))
                }
                None => None,
            }
        }
        _ => None,
    };

    match replacement {
        Some(v) => {
            func.replace_all_uses_with(inst, v);
            func.erase(inst);
            trace!(op = ?op, width = w, "strength-reduced power-of-two arithmetic");
            true
        }
        None => false,
    }
}

/// The constant that `cast op` maps onto `ct`, if one exists at `src_ty`.
fn uncast_const(cx: &Context, op: CastOp, src_ty: Type, ct: Const) -> Option<Const> {
    let candidate = match op {
        CastOp::ZExt | CastOp::SExt => const_cast(cx, CastOp::Trunc, src_ty, ct)?,
        CastOp::Trunc => const_cast(cx, CastOp::ZExt, src_ty, ct)?,
        CastOp::BitCast => const_cast(cx, CastOp::BitCast, src_ty, ct)?,
    };
    (const_cast(cx, op, cx[ct].ty, candidate) == Some(ct)).then_some(candidate)
}

/// One incoming value of a hoistable select/phi: either a cast instruction of
/// the required kind, or a constant expressible at the cast's source type.
fn uncast_incoming(
    cx: &Context,
    func: &FuncDefBody,
    op: CastOp,
    src_ty: Type,
    v: Value,
) -> Option<Value> {
    let m = Matcher::new(cx, func);
    if let Some((_, src)) = m.cast(v, op) {
        return (m.ty(src) == src_ty).then_some(src);
    }
    if let Value::Const(ct) = v {
        return uncast_const(cx, op, src_ty, ct).map(Value::Const);
    }
    None
}

/// The cast kind/source type shared by a set of incoming values, requiring at
/// least one actual cast instruction among them.
fn common_cast_shape(cx: &Context, func: &FuncDefBody, values: &[Value]) -> Option<(CastOp, Type)> {
    let m = Matcher::new(cx, func);
    values.iter().find_map(|&v| {
        let (_, op, src) = m.any_cast(v)?;
        Some((op, m.ty(src)))
    })
}

/// Casts commute with value selection: `select(c, cast a, cast b)` becomes
/// `cast(select(c, a, b))`, one cast instead of two.
fn hoist_cast_over_select(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (sel, cond, on_true, on_false) = match m.select(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    let (op, src_ty) = match common_cast_shape(cx, func, &[on_true, on_false]) {
        Some(r) => r,
        None => return false,
    };
    let (src_t, src_f) = match (
        uncast_incoming(cx, func, op, src_ty, on_true),
        uncast_incoming(cx, func, op, src_ty, on_false),
    ) {
        (Some(t), Some(f)) => (t, f),
        _ => return false,
    };
    let dest_ty = func.insts[sel].ty;

    let mut b = Builder::before(cx, func, sel);
    let narrow_sel = b.select(cond, src_t, src_f);
    let hoisted = b.cast(op, dest_ty, narrow_sel);
    func.replace_all_uses_with(sel, hoisted);
    func.erase(sel);
    func.erase_dead([on_true, on_false]);
    trace!(?op, "hoisted cast below select");
    // Nested cast chains surface again on the narrower select, which the
    // sweep's snapshot never visits; chase them here so one sweep reaches
    // the fixpoint.
    if let Value::Inst(narrow_sel) = narrow_sel {
        hoist_cast_over_select(cx, func, narrow_sel);
    }
    true
}

fn hoist_cast_over_phi(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (phi, incoming) = match m.phi(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    let values: Vec<Value> = incoming.iter().map(|&(v, _)| v).collect();
    let (op, src_ty) = match common_cast_shape(cx, func, &values) {
        Some(r) => r,
        None => return false,
    };
    let mut narrow_incoming = Vec::with_capacity(incoming.len());
    for &(v, block) in &incoming {
        match uncast_incoming(cx, func, op, src_ty, v) {
            Some(src) => narrow_incoming.push((src, block)),
            None => return false,
        }
    }
    let dest_ty = func.insts[phi].ty;
    let block = func.parent_block(phi);

    let narrow_phi = Builder::before(cx, func, phi).phi(src_ty, &narrow_incoming);
    // The cast goes after the whole phi cluster.
    let anchor = func.blocks[block].insts[func.first_non_phi_index(block)];
    let hoisted = Builder::before(cx, func, anchor).cast(op, dest_ty, narrow_phi);
    func.replace_all_uses_with(phi, hoisted);
    func.erase(phi);
    func.erase_dead(values);
    trace!(?op, "hoisted cast below phi");
    if let Value::Inst(narrow_phi) = narrow_phi {
        hoist_cast_over_phi(cx, func, narrow_phi);
    }
    true
}

/// One butterfly stage `((x >> s) & m) | ((x & m) << s)`, returning `x`.
///
/// Every interior node must be single-use so the whole ladder dies with the
/// final `or`.
fn match_bfrev_stage(m: &Matcher<'_>, v: Value, s: u128, mask: u128) -> Option<Value> {
    let (_, lhs, rhs) = m.binop(v, BinOp::Or)?;
    let try_pair = |hi: Value, lo: Value| -> Option<Value> {
        // hi = and(lshr(x, s), mask)
        let (and_hi, a, b) = m.binop(hi, BinOp::And)?;
        if !m.one_use(and_hi) {
            return None;
        }
        let (shr_v, shr_c) = if m.is_const_uint(b, mask) { (a, b) } else { (b, a) };
        if !m.is_const_uint(shr_c, mask) {
            return None;
        }
        let (shr_inst, x1, amt1) = m.binop(shr_v, BinOp::LShr)?;
        if !m.one_use(shr_inst) || !m.is_const_uint(amt1, s) {
            return None;
        }
        // lo = shl(and(x, mask), s)
        let (shl_inst, masked, amt2) = m.binop(lo, BinOp::Shl)?;
        if !m.one_use(shl_inst) || !m.is_const_uint(amt2, s) {
            return None;
        }
        let (and_lo, c, d) = m.binop(masked, BinOp::And)?;
        if !m.one_use(and_lo) {
            return None;
        }
        let x2 = if m.is_const_uint(d, mask) {
            c
        } else if m.is_const_uint(c, mask) {
            d
        } else {
            return None;
        };
        (x1 == x2).then_some(x1)
    };
    try_pair(lhs, rhs).or_else(|| try_pair(rhs, lhs))
}

/// The full 32-bit shift/mask butterfly (swap distances 1, 2, 4, 8, 16)
/// collapses to a single `bfrev` intrinsic call.
fn match_bfrev(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    const STAGES: [(u128, u128); 5] = [
        (16, 0x0000_FFFF),
        (8, 0x00FF_00FF),
        (4, 0x0F0F_0F0F),
        (2, 0x3333_3333),
        (1, 0x5555_5555),
    ];

    let m = Matcher::new(cx, func);
    if m.int_width(Value::Inst(inst)) != Some(32) {
        return false;
    }
    let mut v = Value::Inst(inst);
    for (i, &(s, mask)) in STAGES.iter().enumerate() {
        // An interior stage result feeds exactly the next stage's two reads
        // of it (the shifted copy and the masked copy).
        if i > 0 {
            match m.inst(v) {
                Some(stage) if m.func.use_count(stage) == 2 => {}
                _ => return false,
            }
        }
        v = match match_bfrev_stage(&m, v, s, mask) {
            Some(x) => x,
            None => return false,
        };
    }
    let source = v;
    let (or_lhs, or_rhs) = {
        let ops = &func.insts[inst].operands;
        (ops[0], ops[1])
    };

    let i32_ty = cx.type_scalar(scalar::Type::I32);
    let call = Builder::before(cx, func, inst).call(Intrinsic::Bfrev, i32_ty, &[source]);
    func.replace_all_uses_with(inst, call);
    func.erase(inst);
    func.erase_dead([or_lhs, or_rhs]);
    trace!("recomposed bit-reversal butterfly into bfrev");
    true
}

/// `s = add a, b; c = icmp ult s, a` is an add-with-carry in disguise.
fn match_uaddc(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (cmp, pred, lhs, rhs) = match m.icmp(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    if pred != IcmpPred::Ult {
        return false;
    }
    let (sum, a, b) = match m.binop(lhs, BinOp::Add) {
        Some(r) => r,
        None => return false,
    };
    if m.int_width(lhs) != Some(32) || (rhs != a && rhs != b) {
        return false;
    }

    let pair_ty = cx.type_vector(scalar::Type::I32, 2);
    let mut bld = Builder::before(cx, func, sum);
    let pair = bld.call(Intrinsic::Uaddc, pair_ty, &[a, b]);
    let idx0 = bld.const_int(scalar::Type::I32, 0);
    let idx1 = bld.const_int(scalar::Type::I32, 1);
    let new_sum = bld.extract(pair, idx0);
    let carry = bld.extract(pair, idx1);
    let zero = bld.const_int(scalar::Type::I32, 0);
    let new_cmp = bld.icmp(IcmpPred::Ne, carry, zero);

    func.replace_all_uses_with(cmp, new_cmp);
    func.erase(cmp);
    func.replace_all_uses_with(sum, new_sum);
    func.erase(sum);
    trace!("recomposed carry-out compare into uaddc");
    true
}
