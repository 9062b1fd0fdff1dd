//! Shrinking private arrays to their actually-indexed range.
//!
//! An alloca accessed only through constant-index GEPs used purely by
//! loads/stores is resized to `[min, max]` of those indices, with every GEP
//! re-indexed by `-min`. A load through a two-way-select index is first split
//! into two direct loads plus a select over the results, which makes the
//! remaining indices constant.

use crate::builder::Builder;
use crate::pattern::Matcher;
use crate::platform::PassFlags;
use crate::{Context, FuncDefBody, Inst, InstKind, Value};
use tracing::{debug, trace};

pub fn run(cx: &Context, func: &mut FuncDefBody, flags: &PassFlags) -> bool {
    if !flags.shrink_allocas {
        return false;
    }
    let mut changed = false;

    // Split select-indexed loads first so their GEPs become constant-indexed
    // before the range analysis below runs.
    for block in func.block_order.clone() {
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            changed |= split_select_indexed_load(cx, func, inst);
        }
    }

    let allocas: Vec<Inst> = func
        .block_order
        .iter()
        .flat_map(|&b| func.blocks[b].insts.iter().copied())
        .filter(|&i| matches!(func.insts[i].kind, InstKind::Alloca { .. }))
        .collect();
    for alloca in allocas {
        changed |= shrink(cx, func, alloca);
    }
    changed
}

/// `load(gep(base, select(c, k1, k2)))` with constant `k1`/`k2` becomes
/// `select(c, load(gep(base, k1)), load(gep(base, k2)))`.
fn split_select_indexed_load(cx: &Context, func: &mut FuncDefBody, inst: Inst) -> bool {
    let m = Matcher::new(cx, func);
    if !matches!(func.insts[inst].kind, InstKind::Load) {
        return false;
    }
    let ptr = func.insts[inst].operands[0];
    let gep = match m.inst(ptr) {
        Some(g) if matches!(func.insts[g].kind, InstKind::Gep) && m.one_use(g) => g,
        _ => return false,
    };
    let base = func.insts[gep].operands[0];
    let idx = func.insts[gep].operands[1];
    let (sel, cond, k1, k2) = match m.select(idx) {
        Some(r) => r,
        None => return false,
    };
    if m.const_scalar(k1).is_none() || m.const_scalar(k2).is_none() {
        return false;
    }
    let load_ty = func.insts[inst].ty;

    let mut b = Builder::before(cx, func, inst);
    let gep1 = b.gep(base, k1);
    let load1 = b.load(load_ty, gep1);
    let gep2 = b.gep(base, k2);
    let load2 = b.load(load_ty, gep2);
    let merged = b.select(cond, load1, load2);
    func.replace_all_uses_with(inst, merged);
    func.erase(inst);
    func.erase_dead([ptr, Value::Inst(sel)]);
    trace!("split select-indexed load into two direct loads");
    true
}

/// Whether every use of `gep` is a load, or a store using it as the address
/// (a stored pointer value would escape the alloca).
fn gep_uses_are_memory_ops(func: &FuncDefBody, gep: Inst) -> bool {
    func.uses_of(gep).iter().all(|u| match func.insts[u.consumer].kind {
        InstKind::Load => true,
        InstKind::Store => u.operand_idx == 0,
        _ => false,
    })
}

fn shrink(cx: &Context, func: &mut FuncDefBody, alloca: Inst) -> bool {
    let (elem, len) = match func.insts[alloca].kind {
        InstKind::Alloca { elem, len } => (elem, len),
        _ => unreachable!(),
    };

    if func.use_empty(alloca) {
        // Dead private arrays only die here; blind DCE treats allocas as
        // side-effecting.
        func.erase(alloca);
        debug!("erased unused alloca");
        return true;
    }

    let m = Matcher::new(cx, func);
    let mut geps = Vec::new();
    let mut min = u128::MAX;
    let mut max = 0u128;
    for u in func.uses_of(alloca) {
        let gep = u.consumer;
        if !matches!(func.insts[gep].kind, InstKind::Gep) || u.operand_idx != 0 {
            return false;
        }
        let idx = match m.const_uint(func.insts[gep].operands[1]) {
            Some(i) if i < len as u128 => i,
            _ => return false,
        };
        if !gep_uses_are_memory_ops(func, gep) {
            return false;
        }
        min = min.min(idx);
        max = max.max(idx);
        geps.push((gep, idx));
    }
    let new_len = (max - min + 1) as u32;
    if new_len == len {
        return false;
    }

    let idx_scalar = match m.scalar_ty(func.insts[geps[0].0].operands[1]) {
        Some(s) => s,
        None => return false,
    };

    let new_alloca = Builder::before(cx, func, alloca).alloca(elem, new_len);
    for (gep, idx) in geps {
        func.set_operand(gep, 0, new_alloca);
        let rebased = Value::Const(cx.const_int(idx_scalar, idx - min));
        func.set_operand(gep, 1, rebased);
    }
    func.erase(alloca);
    debug!(old_len = len, new_len, "shrank alloca to used range");
    true
}
