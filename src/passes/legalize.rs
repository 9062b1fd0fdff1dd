//! Integer bit-width legalization.
//!
//! The target only operates natively at the widths `PlatformCaps` declares
//! legal; incoming IR routinely computes at widths like `i5`, `i48` or `i70`.
//! Legalization runs four sweeps in a fixed order, each exactly once:
//!
//! 1. `Promote`: re-express every illegal-width phi/binary/compare/select/
//!    extractelement at a legal scalar width, or at a vector of legal lanes
//!    with explicit multi-precision carry/shift/compare sequences.
//! 2. `CleanZExt`: fold `zext`s whose illegal-width sources are themselves
//!    trunc/zext/bitcast/load scaffolding.
//! 3. `CleanTrunc`: fold cast chains consuming an illegal-width `trunc`.
//! 4. `CleanBitcast`: collapse bitcast pairs and lower `<N x i1>`
//!    insertelement chains feeding a bitcast into a select/OR reduction.
//!
//! Promotion always bottoms out at vectors of the configured lane width, so
//! one sweep per phase suffices; the driver deliberately does not iterate to
//! a fixpoint. Shapes with no implemented legalization panic with a
//! descriptive message rather than silently miscompiling.

use crate::builder::Builder;
use crate::pattern::Matcher;
use crate::platform::{PassFlags, PlatformCaps};
use crate::scalar;
use crate::{
    BinOp, Block, CastOp, ConstKind, Context, FuncDefBody, IcmpPred, Inst, InstKind, Intrinsic,
    Type, TypeDef, Value,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LegalizePhase {
    Promote,
    CleanZExt,
    CleanTrunc,
    CleanBitcast,
}

pub fn run(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, flags: &PassFlags) -> bool {
    if !flags.legalize_int_widths {
        return false;
    }
    let mut changed = false;
    for phase in [
        LegalizePhase::Promote,
        LegalizePhase::CleanZExt,
        LegalizePhase::CleanTrunc,
        LegalizePhase::CleanBitcast,
    ] {
        let phase_changed = sweep(cx, func, caps, phase);
        if phase_changed {
            debug!(?phase, "legalization sweep changed the function");
        }
        changed |= phase_changed;
    }
    changed
}

/// One full instruction sweep of a single phase.
pub fn sweep(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, phase: LegalizePhase) -> bool {
    let mut changed = false;
    for block in func.block_order.clone() {
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            changed |= match phase {
                LegalizePhase::Promote => promote_inst(cx, func, caps, inst),
                LegalizePhase::CleanZExt => clean_zext(cx, func, caps, inst),
                LegalizePhase::CleanTrunc => clean_trunc(cx, func, caps, inst),
                LegalizePhase::CleanBitcast => clean_bitcast(cx, func, inst),
            };
        }
    }
    changed
}

fn illegal_int_width(cx: &Context, caps: &PlatformCaps, ty: Type) -> Option<u32> {
    match cx[ty].as_scalar()? {
        scalar::Type::Int(w) if !caps.is_legal_int_width(w.bits()) => Some(w.bits()),
        _ => None,
    }
}

fn quotient(w: u32, lane: u32) -> u32 {
    (w + lane - 1) / lane
}

/// Re-sign the top `w` bits of a `p`-wide zero-extended value.
fn sign_adjust(bld: &mut Builder<'_, '_>, v: Value, p: u32, w: u32) -> Value {
    if p == w {
        return v;
    }
    let sh = bld.const_int(scalar::Type::int(p), (p - w) as u128);
    let up = bld.binop(BinOp::Shl, v, sh);
    bld.binop(BinOp::AShr, up, sh)
}

/// Zero-extend `v` (width `w`) to `q` lanes of width `lane`.
fn promote_to_lanes(bld: &mut Builder<'_, '_>, v: Value, lane: u32, q: u32) -> Value {
    let wide_ty = bld.cx().type_int(q * lane);
    let vec_ty = bld.cx().type_vector(scalar::Type::int(lane), q as u8);
    let wide = bld.zext(wide_ty, v);
    bld.bitcast(vec_ty, wide)
}

fn demote_from_lanes(bld: &mut Builder<'_, '_>, vecv: Value, ty_w: Type, lane: u32, q: u32) -> Value {
    let wide_ty = bld.cx().type_int(q * lane);
    let wide = bld.bitcast(wide_ty, vecv);
    bld.trunc(ty_w, wide)
}

fn extract_lanes(bld: &mut Builder<'_, '_>, vecv: Value, q: u32) -> Vec<Value> {
    (0..q)
        .map(|i| {
            let idx = bld.const_int(scalar::Type::I32, i as u128);
            bld.extract(vecv, idx)
        })
        .collect()
}

fn pack_lanes(bld: &mut Builder<'_, '_>, lane: u32, lanes: &[Value]) -> Value {
    let vec_ty = bld.cx().type_vector(scalar::Type::int(lane), lanes.len() as u8);
    let mut vec = bld.undef(vec_ty);
    for (i, &l) in lanes.iter().enumerate() {
        let idx = bld.const_int(scalar::Type::I32, i as u128);
        vec = bld.insert_elem(vec, l, idx);
    }
    vec
}

fn promote_inst(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, inst: Inst) -> bool {
    match func.insts[inst].kind {
        InstKind::Binary(op) => {
            match illegal_int_width(cx, caps, func.insts[inst].ty) {
                Some(w) => promote_binary(cx, func, caps, inst, op, w),
                None => false,
            }
        }
        InstKind::ICmp(pred) => {
            let operand_ty = func.value_type(cx, func.insts[inst].operands[0]);
            match illegal_int_width(cx, caps, operand_ty) {
                Some(w) => promote_icmp(cx, func, caps, inst, pred, w),
                None => false,
            }
        }
        InstKind::Select => {
            match illegal_int_width(cx, caps, func.insts[inst].ty) {
                Some(w) => promote_select(cx, func, caps, inst, w),
                None => false,
            }
        }
        InstKind::Phi { .. } => {
            match illegal_int_width(cx, caps, func.insts[inst].ty) {
                Some(w) => promote_phi(cx, func, caps, inst, w),
                None => false,
            }
        }
        InstKind::ExtractElement => promote_extract(cx, func, caps, inst),
        _ => false,
    }
}

fn promote_binary(
    cx: &Context,
    func: &mut FuncDefBody,
    caps: &PlatformCaps,
    inst: Inst,
    op: BinOp,
    w: u32,
) -> bool {
    let lane = caps.legal_lane_width();
    let q = quotient(w, lane);
    let ty_w = func.insts[inst].ty;
    let (a, b) = (func.insts[inst].operands[0], func.insts[inst].operands[1]);

    let narrow = if q == 1 {
        let p = caps
            .smallest_legal_int_width_holding(w)
            .unwrap_or_else(|| panic!("no legal width can hold i{w}"));
        let pty = cx.type_int(p);
        let mut bld = Builder::before(cx, func, inst);
        let mut wa = bld.zext(pty, a);
        let mut wb = bld.zext(pty, b);
        match op {
            // The promoted value is zero-filled; signed ops need real sign
            // bits at the promoted width.
            BinOp::AShr => wa = sign_adjust(&mut bld, wa, p, w),
            BinOp::SDiv => {
                wa = sign_adjust(&mut bld, wa, p, w);
                wb = sign_adjust(&mut bld, wb, p, w);
            }
            _ => {}
        }
        let res = bld.binop(op, wa, wb);
        bld.trunc(ty_w, res)
    } else {
        let lane_ty = scalar::Type::int(lane);
        // A constant shift amount must be read off before the builder
        // borrows the body.
        let lshr_amount = match op {
            BinOp::LShr => Some(
                func.as_const_scalar(cx, b).and_then(|c| c.int_as_u128()).unwrap_or_else(
                    || panic!("non-constant shift amount in i{w} LShr legalization"),
                ) as u32,
            ),
            _ => None,
        };
        let mut bld = Builder::before(cx, func, inst);
        let va = promote_to_lanes(&mut bld, a, lane, q);
        let vec = match op {
            BinOp::And | BinOp::Or | BinOp::Xor => {
                let vb = promote_to_lanes(&mut bld, b, lane, q);
                bld.binop(op, va, vb)
            }
            BinOp::Add | BinOp::Sub => {
                let vb = promote_to_lanes(&mut bld, b, lane, q);
                let la = extract_lanes(&mut bld, va, q);
                let lb = extract_lanes(&mut bld, vb, q);
                let lanes = if op == BinOp::Add {
                    add_with_carry(&mut bld, lane_ty, &la, &lb)
                } else {
                    sub_with_borrow(&mut bld, lane_ty, &la, &lb)
                };
                pack_lanes(&mut bld, lane, &lanes)
            }
            BinOp::Mul => {
                if q != 2 {
                    panic!("Mul legalization for width {w} (more than 2 lanes of {lane}) not supported");
                }
                let vb = promote_to_lanes(&mut bld, b, lane, q);
                let la = extract_lanes(&mut bld, va, q);
                let lb = extract_lanes(&mut bld, vb, q);
                let lane_ty_i = cx.type_scalar(lane_ty);
                let lo = bld.binop(BinOp::Mul, la[0], lb[0]);
                let hi_mul = bld.call(Intrinsic::UMulH, lane_ty_i, &[la[0], lb[0]]);
                let cross1 = bld.binop(BinOp::Mul, la[0], lb[1]);
                let cross2 = bld.binop(BinOp::Mul, la[1], lb[0]);
                let hi = {
                    let t = bld.binop(BinOp::Add, hi_mul, cross1);
                    bld.binop(BinOp::Add, t, cross2)
                };
                pack_lanes(&mut bld, lane, &[lo, hi])
            }
            BinOp::LShr => {
                let la = extract_lanes(&mut bld, va, q);
                let lanes = long_lshr(&mut bld, lane_ty, &la, lshr_amount.unwrap());
                pack_lanes(&mut bld, lane, &lanes)
            }
            BinOp::Shl | BinOp::UDiv | BinOp::SDiv | BinOp::AShr => {
                panic!("{op:?} legalization for width {w} not supported")
            }
        };
        demote_from_lanes(&mut bld, vec, ty_w, lane, q)
    };

    func.replace_all_uses_with(inst, narrow);
    func.erase(inst);
    trace!(op = ?op, width = w, lanes = q, "promoted illegal-width binary op");
    true
}

fn add_with_carry(
    bld: &mut Builder<'_, '_>,
    lane_ty: scalar::Type,
    la: &[Value],
    lb: &[Value],
) -> Vec<Value> {
    let q = la.len();
    let mut out = Vec::with_capacity(q);
    let mut carry: Option<Value> = None;
    for i in 0..q {
        let s1 = bld.binop(BinOp::Add, la[i], lb[i]);
        let c1 = bld.icmp(IcmpPred::Ult, s1, la[i]);
        let (sum, cout) = match carry {
            None => (s1, c1),
            Some(cin) => {
                let s2 = bld.binop(BinOp::Add, s1, cin);
                let c2 = bld.icmp(IcmpPred::Ult, s2, s1);
                (s2, bld.binop(BinOp::Or, c1, c2))
            }
        };
        out.push(sum);
        if i + 1 < q {
            let lane_i = bld.cx().type_scalar(lane_ty);
            carry = Some(bld.zext(lane_i, cout));
        }
    }
    out
}

fn sub_with_borrow(
    bld: &mut Builder<'_, '_>,
    lane_ty: scalar::Type,
    la: &[Value],
    lb: &[Value],
) -> Vec<Value> {
    let q = la.len();
    let mut out = Vec::with_capacity(q);
    let mut borrow: Option<Value> = None;
    for i in 0..q {
        let d1 = bld.binop(BinOp::Sub, la[i], lb[i]);
        let b1 = bld.icmp(IcmpPred::Ult, la[i], lb[i]);
        let (diff, bout) = match borrow {
            None => (d1, b1),
            Some(bin) => {
                let d2 = bld.binop(BinOp::Sub, d1, bin);
                let b2 = bld.icmp(IcmpPred::Ult, d1, bin);
                (d2, bld.binop(BinOp::Or, b1, b2))
            }
        };
        out.push(diff);
        if i + 1 < q {
            let lane_i = bld.cx().type_scalar(lane_ty);
            borrow = Some(bld.zext(lane_i, bout));
        }
    }
    out
}

/// Long logical right shift by a constant: each result lane combines two
/// adjacent source lanes with an intra-lane shift-and-or.
fn long_lshr(
    bld: &mut Builder<'_, '_>,
    lane_ty: scalar::Type,
    la: &[Value],
    k: u32,
) -> Vec<Value> {
    let q = la.len() as u32;
    let lane = lane_ty.bit_width();
    let (skip, rem) = (k / lane, k % lane);
    (0..q)
        .map(|i| {
            let src = i + skip;
            if src >= q {
                return bld.const_int(lane_ty, 0);
            }
            if rem == 0 {
                return la[src as usize];
            }
            let sh_lo = bld.const_int(lane_ty, rem as u128);
            let lo = bld.binop(BinOp::LShr, la[src as usize], sh_lo);
            if src + 1 < q {
                let sh_hi = bld.const_int(lane_ty, (lane - rem) as u128);
                let hi = bld.binop(BinOp::Shl, la[(src + 1) as usize], sh_hi);
                bld.binop(BinOp::Or, lo, hi)
            } else {
                lo
            }
        })
        .collect()
}

fn promote_icmp(
    cx: &Context,
    func: &mut FuncDefBody,
    caps: &PlatformCaps,
    inst: Inst,
    pred: IcmpPred,
    w: u32,
) -> bool {
    let lane = caps.legal_lane_width();
    let q = quotient(w, lane);
    let (a, b) = (func.insts[inst].operands[0], func.insts[inst].operands[1]);

    let result = if q == 1 {
        let p = caps
            .smallest_legal_int_width_holding(w)
            .unwrap_or_else(|| panic!("no legal width can hold i{w}"));
        let pty = cx.type_int(p);
        let mut bld = Builder::before(cx, func, inst);
        let mut wa = bld.zext(pty, a);
        let mut wb = bld.zext(pty, b);
        if pred.is_signed() {
            wa = sign_adjust(&mut bld, wa, p, w);
            wb = sign_adjust(&mut bld, wb, p, w);
        }
        bld.icmp(pred, wa, wb)
    } else {
        let mut bld = Builder::before(cx, func, inst);
        let va = promote_to_lanes(&mut bld, a, lane, q);
        let vb = promote_to_lanes(&mut bld, b, lane, q);
        let la = extract_lanes(&mut bld, va, q);
        let lb = extract_lanes(&mut bld, vb, q);
        match pred {
            IcmpPred::Eq | IcmpPred::Ne => {
                let mut acc = bld.icmp(IcmpPred::Eq, la[0], lb[0]);
                for i in 1..q as usize {
                    let eq_i = bld.icmp(IcmpPred::Eq, la[i], lb[i]);
                    acc = bld.binop(BinOp::And, acc, eq_i);
                }
                if pred == IcmpPred::Ne {
                    let t = bld.const_bool(true);
                    acc = bld.binop(BinOp::Xor, acc, t);
                }
                acc
            }
            _ => lexicographic_cmp(&mut bld, pred, &la, &lb, lane, w),
        }
    };

    func.replace_all_uses_with(inst, result);
    func.erase(inst);
    trace!(pred = ?pred, width = w, lanes = q, "promoted illegal-width compare");
    true
}

/// Ordered comparison over lane vectors: strict compare from the top lane
/// down, chained through prefix equality. Only the top lane sees the sign,
/// and only after re-signing its zero-filled upper bits.
fn lexicographic_cmp(
    bld: &mut Builder<'_, '_>,
    pred: IcmpPred,
    la: &[Value],
    lb: &[Value],
    lane: u32,
    w: u32,
) -> Value {
    let q = la.len();
    let (strict, include_eq) = match pred {
        IcmpPred::Ult => (IcmpPred::Ult, false),
        IcmpPred::Ule => (IcmpPred::Ult, true),
        IcmpPred::Ugt => (IcmpPred::Ugt, false),
        IcmpPred::Uge => (IcmpPred::Ugt, true),
        IcmpPred::Slt => (IcmpPred::Slt, false),
        IcmpPred::Sle => (IcmpPred::Slt, true),
        IcmpPred::Sgt => (IcmpPred::Sgt, false),
        IcmpPred::Sge => (IcmpPred::Sgt, true),
        IcmpPred::Eq | IcmpPred::Ne => unreachable!(),
    };
    let lower_strict = match strict {
        IcmpPred::Slt => IcmpPred::Ult,
        IcmpPred::Sgt => IcmpPred::Ugt,
        p => p,
    };

    let top = q - 1;
    let rem = w - (top as u32) * lane;
    let (ta, tb) = if strict.is_signed() {
        (
            sign_adjust(bld, la[top], lane, rem),
            sign_adjust(bld, lb[top], lane, rem),
        )
    } else {
        (la[top], lb[top])
    };
    let mut acc = bld.icmp(strict, ta, tb);
    let mut prefix_eq = bld.icmp(IcmpPred::Eq, la[top], lb[top]);
    for j in (0..top).rev() {
        let strict_j = bld.icmp(lower_strict, la[j], lb[j]);
        let term = bld.binop(BinOp::And, prefix_eq, strict_j);
        acc = bld.binop(BinOp::Or, acc, term);
        let eq_j = bld.icmp(IcmpPred::Eq, la[j], lb[j]);
        prefix_eq = bld.binop(BinOp::And, prefix_eq, eq_j);
    }
    if include_eq {
        acc = bld.binop(BinOp::Or, acc, prefix_eq);
    }
    acc
}

fn promote_select(
    cx: &Context,
    func: &mut FuncDefBody,
    caps: &PlatformCaps,
    inst: Inst,
    w: u32,
) -> bool {
    let lane = caps.legal_lane_width();
    let q = quotient(w, lane);
    let ty_w = func.insts[inst].ty;
    let ops = &func.insts[inst].operands;
    let (cond, on_true, on_false) = (ops[0], ops[1], ops[2]);

    let mut bld = Builder::before(cx, func, inst);
    let narrow = if q == 1 {
        let p = caps
            .smallest_legal_int_width_holding(w)
            .unwrap_or_else(|| panic!("no legal width can hold i{w}"));
        let pty = cx.type_int(p);
        let wt = bld.zext(pty, on_true);
        let wf = bld.zext(pty, on_false);
        let sel = bld.select(cond, wt, wf);
        bld.trunc(ty_w, sel)
    } else {
        let vt = promote_to_lanes(&mut bld, on_true, lane, q);
        let vf = promote_to_lanes(&mut bld, on_false, lane, q);
        let sel = bld.select(cond, vt, vf);
        demote_from_lanes(&mut bld, sel, ty_w, lane, q)
    };
    func.replace_all_uses_with(inst, narrow);
    func.erase(inst);
    trace!(width = w, lanes = q, "promoted illegal-width select");
    true
}

fn promote_phi(
    cx: &Context,
    func: &mut FuncDefBody,
    caps: &PlatformCaps,
    inst: Inst,
    w: u32,
) -> bool {
    let lane = caps.legal_lane_width();
    let q = quotient(w, lane);
    let ty_w = func.insts[inst].ty;
    let block = func.parent_block(inst);
    let incoming_blocks: SmallVec<[Block; 2]> = match &func.insts[inst].kind {
        InstKind::Phi { incoming_blocks } => incoming_blocks.clone(),
        _ => unreachable!(),
    };
    let incoming_values: Vec<Value> = func.insts[inst].operands.to_vec();

    let promoted_ty = if q == 1 {
        let p = caps
            .smallest_legal_int_width_holding(w)
            .unwrap_or_else(|| panic!("no legal width can hold i{w}"));
        cx.type_int(p)
    } else {
        cx.type_vector(scalar::Type::int(lane), q as u8)
    };

    // Promote each incoming value in its predecessor, just before the
    // terminator; the phi itself stays block-local.
    let mut wide_incoming = Vec::with_capacity(incoming_values.len());
    for (&v, &pred) in incoming_values.iter().zip(&incoming_blocks) {
        let term = func.terminator(pred);
        let mut bld = Builder::before(cx, func, term);
        let wv = if q == 1 {
            bld.zext(promoted_ty, v)
        } else {
            promote_to_lanes(&mut bld, v, lane, q)
        };
        wide_incoming.push((wv, pred));
    }

    let wide_phi = Builder::before(cx, func, inst).phi(promoted_ty, &wide_incoming);
    // The demotion goes after the whole phi cluster.
    let anchor = func.blocks[block].insts[func.first_non_phi_index(block)];
    let mut bld = Builder::before(cx, func, anchor);
    let narrow = if q == 1 {
        bld.trunc(ty_w, wide_phi)
    } else {
        demote_from_lanes(&mut bld, wide_phi, ty_w, lane, q)
    };
    func.replace_all_uses_with(inst, narrow);
    func.erase(inst);
    trace!(width = w, lanes = q, "promoted illegal-width phi");
    true
}

fn promote_extract(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, inst: Inst) -> bool {
    let src = func.insts[inst].operands[0];
    let idx = func.insts[inst].operands[1];
    let src_ty = func.value_type(cx, src);
    let (elem, count) = match cx[src_ty].as_vector() {
        Some(v) => v,
        None => return false,
    };

    if let scalar::Type::Int(ew) = elem {
        let w = ew.bits();
        if !caps.is_legal_int_width(w) {
            let lane = caps.legal_lane_width();
            let q = quotient(w, lane);
            if w % lane != 0 {
                panic!("extractelement of i{w} element requires a lane-divisible width");
            }
            let wide_count = count as u32 * q;
            assert!(wide_count <= u8::MAX as u32, "promoted vector too long");
            let wide_vec_ty = cx.type_vector(scalar::Type::int(lane), wide_count as u8);
            let ty_w = func.insts[inst].ty;

            let mut bld = Builder::before(cx, func, inst);
            let wv = bld.bitcast(wide_vec_ty, src);
            let qc = bld.const_int(scalar::Type::I32, q as u128);
            let idx32 = resize(&mut bld, cx.type_scalar(scalar::Type::I32), idx);
            let base = bld.binop(BinOp::Mul, idx32, qc);
            let lanes: Vec<Value> = (0..q)
                .map(|j| {
                    let jc = bld.const_int(scalar::Type::I32, j as u128);
                    let lane_idx = bld.binop(BinOp::Add, base, jc);
                    bld.extract(wv, lane_idx)
                })
                .collect();
            let packed = pack_lanes(&mut bld, lane, &lanes);
            let narrow = bld.bitcast(ty_w, packed);
            func.replace_all_uses_with(inst, narrow);
            func.erase(inst);
            trace!(width = w, lanes = q, "promoted illegal-element extractelement");
            return true;
        }
    }

    // Element type is fine; an illegal-width index still needs widening.
    let idx_ty = func.value_type(cx, idx);
    if let Some(wi) = illegal_int_width(cx, caps, idx_ty) {
        let to = if wi <= 16 && caps.is_legal_int_width(16) { 16 } else { 32 };
        let to_ty = cx.type_int(to);
        let wide_idx = Builder::before(cx, func, inst).zext(to_ty, idx);
        func.set_operand(inst, 1, wide_idx);
        trace!(from = wi, to, "widened illegal-width extract index");
        return true;
    }
    false
}

/// Erase `producer` if the cleanup left it unused.
fn erase_if_dead(func: &mut FuncDefBody, producer: Inst) {
    if func.insts.contains(producer) && func.use_empty(producer) {
        func.erase(producer);
    }
}

/// Resize `v` to `to_ty` with zero extension or truncation, whichever applies.
fn resize(bld: &mut Builder<'_, '_>, to_ty: Type, v: Value) -> Value {
    let from_w = bld.cx()[bld.func.value_type(bld.cx(), v)].bit_width().unwrap();
    let to_w = bld.cx()[to_ty].bit_width().unwrap();
    if from_w < to_w {
        bld.zext(to_ty, v)
    } else {
        bld.trunc(to_ty, v)
    }
}

fn clean_zext(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (_, src) = match m.cast(Value::Inst(inst), CastOp::ZExt) {
        Some(r) => r,
        None => return false,
    };
    let wi = match illegal_int_width(cx, caps, m.ty(src)) {
        Some(w) => w,
        None => return false,
    };
    let dst_ty = func.insts[inst].ty;
    let producer = match m.inst(src) {
        Some(p) => p,
        None => return false,
    };
    let mask_bits = (1u128 << wi) - 1;

    match func.insts[producer].kind.clone() {
        InstKind::Cast(CastOp::Trunc) => {
            // zext(trunc(x)) keeps only the low `wi` bits of x: mask at x's
            // width, then resize, skipping the illegal intermediate entirely.
            let x = func.insts[producer].operands[0];
            let x_scalar = match cx[func.value_type(cx, x)].as_scalar() {
                Some(s) => s,
                None => return false,
            };
            let mut bld = Builder::before(cx, func, inst);
            let mask = bld.const_int(x_scalar, mask_bits);
            let masked = bld.binop(BinOp::And, x, mask);
            let resized = resize(&mut bld, dst_ty, masked);
            func.replace_all_uses_with(inst, resized);
            func.erase(inst);
            erase_if_dead(func, producer);
            trace!(width = wi, "folded zext of illegal trunc into mask+resize");
            true
        }
        InstKind::Cast(CastOp::ZExt) => {
            let x = func.insts[producer].operands[0];
            let merged = Builder::before(cx, func, inst).zext(dst_ty, x);
            func.replace_all_uses_with(inst, merged);
            func.erase(inst);
            erase_if_dead(func, producer);
            trace!(width = wi, "merged zext chain over illegal intermediate");
            true
        }
        InstKind::Cast(CastOp::BitCast) => {
            let vec = func.insts[producer].operands[0];
            let (elem, count) = match cx[func.value_type(cx, vec)].as_vector() {
                Some(v) => v,
                None => return false,
            };
            let ew = elem.bit_width();
            if !elem.is_int() || !caps.is_legal_int_width(ew) || ew * count as u32 != wi {
                return false;
            }
            // Repack the legal lanes straight at the destination width.
            let mut bld = Builder::before(cx, func, inst);
            let mut acc = bld.const_int(cx[dst_ty].as_scalar().unwrap(), 0);
            for i in 0..count as u32 {
                let idx = bld.const_int(scalar::Type::I32, i as u128);
                let l = bld.extract(vec, idx);
                let wl = bld.zext(dst_ty, l);
                let sh = bld.const_int(cx[dst_ty].as_scalar().unwrap(), (i * ew) as u128);
                let shifted = bld.binop(BinOp::Shl, wl, sh);
                acc = bld.binop(BinOp::Or, acc, shifted);
            }
            func.replace_all_uses_with(inst, acc);
            func.erase(inst);
            erase_if_dead(func, producer);
            trace!(width = wi, "lowered zext of lane bitcast into shift/or packing");
            true
        }
        InstKind::Load => {
            let ptr = func.insts[producer].operands[0];
            // Widen the load itself, then mask off the bits the illegal
            // width never held.
            let mut bld = Builder::before(cx, func, producer);
            let wide_load = bld.load(dst_ty, ptr);
            let mut bld = Builder::before(cx, func, inst);
            let mask = bld.const_int(cx[dst_ty].as_scalar().unwrap(), mask_bits);
            let masked = bld.binop(BinOp::And, wide_load, mask);
            func.replace_all_uses_with(inst, masked);
            func.erase(inst);
            erase_if_dead(func, producer);
            trace!(width = wi, "widened illegal-width load under zext");
            true
        }
        _ => false,
    }
}

fn clean_trunc(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (_, op, src) = match m.any_cast(Value::Inst(inst)) {
        Some(r) => r,
        None => return false,
    };
    // Only chains consuming an illegal-width trunc are phase-3 business.
    let producer = match m.cast(src, CastOp::Trunc) {
        Some((t, _)) => t,
        None => return false,
    };
    let wi = match illegal_int_width(cx, caps, m.ty(src)) {
        Some(w) => w,
        None => return false,
    };
    let x = func.insts[producer].operands[0];
    let dst_ty = func.insts[inst].ty;
    let dst_w = match cx[dst_ty].bit_width() {
        Some(w) => w,
        None => return false,
    };

    let replacement = match op {
        CastOp::ZExt => {
            let x_scalar = match cx[func.value_type(cx, x)].as_scalar() {
                Some(s) => s,
                None => return false,
            };
            let mut bld = Builder::before(cx, func, inst);
            let mask = bld.const_int(x_scalar, (1u128 << wi) - 1);
            let masked = bld.binop(BinOp::And, x, mask);
            resize(&mut bld, dst_ty, masked)
        }
        CastOp::SExt => {
            // Resize first, then recreate the sign of the illegal width with
            // a shift pair at the legal destination width.
            let mut bld = Builder::before(cx, func, inst);
            let resized = resize(&mut bld, dst_ty, x);
            let sh = bld.const_int(cx[dst_ty].as_scalar().unwrap(), (dst_w - wi) as u128);
            let up = bld.binop(BinOp::Shl, resized, sh);
            bld.binop(BinOp::AShr, up, sh)
        }
        CastOp::Trunc => Builder::before(cx, func, inst).trunc(dst_ty, x),
        CastOp::BitCast => return false,
    };
    func.replace_all_uses_with(inst, replacement);
    func.erase(inst);
    erase_if_dead(func, producer);
    trace!(width = wi, op = ?op, "folded cast chain over illegal trunc");
    true
}

fn clean_bitcast(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    let (_, src) = match m.cast(Value::Inst(inst), CastOp::BitCast) {
        Some(r) => r,
        None => return false,
    };
    let dst_ty = func.insts[inst].ty;

    // bitcast(bitcast(x)): identity if the types round-trip, otherwise one
    // direct bitcast.
    if let Some((inner, x)) = m.cast(src, CastOp::BitCast) {
        let replacement = if m.ty(x) == dst_ty {
            x
        } else {
            Builder::before(cx, func, inst).bitcast(dst_ty, x)
        };
        func.replace_all_uses_with(inst, replacement);
        func.erase(inst);
        erase_if_dead(func, inner);
        trace!("collapsed bitcast pair");
        return true;
    }

    lower_bool_vector_bitcast(cx, func, inst, src, dst_ty)
}

/// `bitcast(<N x i1> built by insertelement chain) to iN`: single-bit lanes
/// have no legal hardware representation, so build the integer directly as an
/// OR-reduction of `select(cond, 1<<i, 0)`.
fn lower_bool_vector_bitcast(
    cx: &Context,
    func: &mut FuncDefBody,
    inst: Inst,
    src: Value,
    dst_ty: Type,
) -> bool {
    let m = Matcher::new(cx, func);
    let n = match (&cx[m.ty(src)], &cx[dst_ty]) {
        (
            TypeDef::Vector { elem: scalar::Type::Bool, count },
            TypeDef::Scalar(scalar::Type::Int(w)),
        ) if w.bits() == *count as u32 => *count as u32,
        _ => return false,
    };

    // Walk the insertelement chain down to a constant base.
    let mut chain = Vec::new();
    let mut cur = src;
    let base = loop {
        match m.inst(cur) {
            Some(ins) if matches!(func.insts[ins].kind, InstKind::InsertElement) => {
                if cur != src && !m.one_use(ins) {
                    return false;
                }
                let ops = &func.insts[ins].operands;
                let idx = match m.const_uint(ops[2]) {
                    Some(i) if i < n as u128 => i as u32,
                    _ => return false,
                };
                chain.push((idx, ops[1]));
                cur = ops[0];
            }
            Some(_) => return false,
            None => match cur {
                Value::Const(ct) => break ct,
                _ => return false,
            },
        }
    };
    // Later inserts at a repeated index would have to override earlier ones,
    // which an OR-reduction cannot express.
    let mut seen = 0u128;
    for &(idx, _) in &chain {
        if seen & (1 << idx) != 0 {
            return false;
        }
        seen |= 1 << idx;
    }

    let dst_scalar = cx[dst_ty].as_scalar().unwrap();
    let base_bits = match &cx[base].kind {
        ConstKind::Undef => 0u128,
        ConstKind::Vector(lanes) => lanes
            .iter()
            .enumerate()
            .filter(|&(i, _)| seen & (1 << i) == 0)
            .filter_map(|(i, &l)| match &cx[l].kind {
                ConstKind::Scalar(s) if s.bits() != 0 => Some(1u128 << i),
                _ => None,
            })
            .sum(),
        ConstKind::Scalar(_) => return false,
    };

    let mut bld = Builder::before(cx, func, inst);
    let mut acc = bld.const_int(dst_scalar, base_bits);
    for &(idx, cond) in chain.iter().rev() {
        let one = bld.const_int(dst_scalar, 1u128 << idx);
        let zero = bld.const_int(dst_scalar, 0);
        let bit = bld.select(cond, one, zero);
        acc = bld.binop(BinOp::Or, acc, bit);
    }
    func.replace_all_uses_with(inst, acc);
    func.erase(inst);
    func.erase_dead([src]);
    trace!(n, "lowered bool-vector bitcast into select/or reduction");
    true
}
