//! Coalescing of URB writes within a basic block.
//!
//! The scan keeps, per `(dynamic base, immediate offset)` key, the most recent
//! mergeable write since the last synchronization point. Same-key overlaps are
//! resolved by copying the not-overwritten channels of the older write into
//! the newer one; at a read, a barrier, or block end the accumulated map is
//! flushed, pairing up writes at adjacent offsets into single 8-channel
//! writes. A channel mask bit of a surviving write always carries the most
//! recently written value for that channel in program order.

use crate::builder::Builder;
use crate::platform::{PassFlags, PlatformCaps};
use crate::scalar;
use crate::{ChannelMask, Context, FuncDefBody, FxIndexMap, Inst, InstKind, Value};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Bookkeeping record of one merged 8-channel write.
///
/// Populated by the flush path but consumed by nothing; kept as a latent
/// extension point for a later wide-write scheduling pass.
pub struct WideWrite {
    pub inst: Inst,
    pub imm_offset: u32,
    pub channel_mask: ChannelMask,
}

#[derive(Copy, Clone)]
struct Entry {
    inst: Inst,
    /// Monotonic program-order stamp, assigned at visit time; survives the
    /// position churn caused by erasures.
    seq: usize,
    mask: ChannelMask,
}

type AccMap = FxIndexMap<Option<Value>, BTreeMap<u32, Entry>>;

pub fn run(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps, flags: &PassFlags) -> bool {
    if !flags.merge_urb_writes {
        return false;
    }
    // Write-combining may pad merged masks with undef channels, which is only
    // safe when nothing in the function can observe URB state mid-stream.
    let combine = caps.supports_write_combining && write_combining_safe(func);

    let mut changed = false;
    let mut wide_writes: Vec<WideWrite> = Vec::new();
    for block in func.block_order.clone() {
        let mut acc = AccMap::default();
        let mut seq = 0usize;
        for inst in func.blocks[block].insts.clone() {
            if !func.insts.contains(inst) {
                continue;
            }
            seq += 1;
            match func.insts[inst].kind {
                InstKind::UrbWrite { imm_offset, channel_mask, has_dynamic_base } => {
                    // Only narrow low-half writes accumulate; anything wider
                    // is treated as an opaque access.
                    if channel_mask.bits() & 0xF0 != 0 || channel_mask.count() > 4 {
                        changed |= flush(cx, func, &mut acc, combine, &mut wide_writes);
                        continue;
                    }
                    let base = has_dynamic_base.then(|| func.insts[inst].operands[0]);
                    let per_base = acc.entry(base).or_default();
                    let entry = match per_base.get(&imm_offset).copied() {
                        Some(old) => {
                            changed = true;
                            merge_same_key(cx, func, base, imm_offset, old, inst, seq)
                        }
                        None => Entry { inst, seq, mask: channel_mask },
                    };
                    per_base.insert(imm_offset, entry);
                }
                InstKind::UrbRead { .. } | InstKind::Barrier => {
                    changed |= flush(cx, func, &mut acc, combine, &mut wide_writes);
                }
                _ => {}
            }
        }
        changed |= flush(cx, func, &mut acc, combine, &mut wide_writes);
    }
    let _wide_writes = wide_writes;
    changed
}

fn write_combining_safe(func: &FuncDefBody) -> bool {
    if func.block_order.len() != 1 {
        return false;
    }
    func.block_order.iter().flat_map(|&b| &func.blocks[b].insts).all(|&inst| {
        match func.insts[inst].kind {
            InstKind::Barrier | InstKind::UrbRead { .. } => false,
            InstKind::UrbWrite { has_dynamic_base, .. } => !has_dynamic_base,
            _ => true,
        }
    })
}

/// The data operand of `inst` carrying channel `ch`.
fn channel_operand(func: &FuncDefBody, inst: Inst, ch: u32) -> Value {
    match func.insts[inst].kind {
        InstKind::UrbWrite { channel_mask, has_dynamic_base, .. } => {
            let rank = channel_mask.channels().position(|c| c == ch).unwrap();
            func.insts[inst].operands[has_dynamic_base as usize + rank]
        }
        _ => unreachable!(),
    }
}

/// A newer write at the same key supersedes the older one, but channels only
/// the older write covered must be carried over, not dropped.
fn merge_same_key(
    cx: &Context,
    func: &mut FuncDefBody,
    base: Option<Value>,
    imm_offset: u32,
    old: Entry,
    new: Inst,
    seq: usize,
) -> Entry {
    let new_mask = match func.insts[new].kind {
        InstKind::UrbWrite { channel_mask, .. } => channel_mask,
        _ => unreachable!(),
    };
    let merged_mask = old.mask | new_mask;

    let surviving = if merged_mask == new_mask {
        // Full overwrite: the old data is entirely superseded.
        new
    } else {
        let data: Vec<Value> = merged_mask
            .channels()
            .map(|ch| {
                let from = if new_mask.channels().any(|c| c == ch) { new } else { old.inst };
                channel_operand(func, from, ch)
            })
            .collect();
        let merged =
            Builder::before(cx, func, new).urb_write(imm_offset, merged_mask, base, &data);
        let merged = merged.as_inst().unwrap();
        func.erase(new);
        merged
    };
    let old_operands: Vec<Value> = func.insts[old.inst].operands.to_vec();
    func.erase(old.inst);
    func.erase_dead(old_operands);
    trace!(imm_offset, mask = ?merged_mask, "merged same-offset urb writes");
    Entry { inst: surviving, seq, mask: merged_mask }
}

/// Pair up accumulated writes at adjacent offsets (same base) into single
/// 8-channel writes, then drop the map's claim on everything.
fn flush(
    cx: &Context,
    func: &mut FuncDefBody,
    acc: &mut AccMap,
    combine: bool,
    wide_writes: &mut Vec<WideWrite>,
) -> bool {
    let mut changed = false;
    for (&base, per_base) in acc.iter() {
        let entries: Vec<(u32, Entry)> = per_base.iter().map(|(&o, &e)| (o, e)).collect();
        let mut i = 0;
        while i + 1 < entries.len() {
            let (off_lo, lower) = entries[i];
            let (off_hi, upper) = entries[i + 1];
            if off_hi != off_lo + 1 {
                i += 1;
                continue;
            }
            let mut mask = ChannelMask::from_bits_truncate(
                lower.mask.bits() | (upper.mask.bits() << 4),
            );
            if combine {
                mask = ChannelMask::all();
            }
            let i32_ty = cx.type_scalar(scalar::Type::I32);
            let data: Vec<Value> = mask
                .channels()
                .map(|ch| {
                    let (src, src_mask, src_ch) = if ch < 4 {
                        (lower.inst, lower.mask, ch)
                    } else {
                        (upper.inst, upper.mask, ch - 4)
                    };
                    if src_mask.channels().any(|c| c == src_ch) {
                        channel_operand(func, src, src_ch)
                    } else {
                        Value::Const(cx.const_undef(i32_ty))
                    }
                })
                .collect();

            // The merged write takes the later instruction's place; both
            // halves' operands are already defined by that point.
            let later = if lower.seq > upper.seq { lower.inst } else { upper.inst };
            let merged = Builder::before(cx, func, later).urb_write(off_lo, mask, base, &data);
            let merged = merged.as_inst().unwrap();
            let dead_operands: Vec<Value> = func.insts[lower.inst]
                .operands
                .iter()
                .chain(&func.insts[upper.inst].operands)
                .copied()
                .collect();
            func.erase(lower.inst);
            func.erase(upper.inst);
            func.erase_dead(dead_operands);
            wide_writes.push(WideWrite { inst: merged, imm_offset: off_lo, channel_mask: mask });
            changed = true;
            debug!(imm_offset = off_lo, mask = ?mask, "merged adjacent urb writes");
            i += 2;
        }
    }
    acc.clear();
    changed
}
