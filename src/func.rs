//! Function bodies and the mutation API over their instruction graphs.
//!
//! All operand edits must go through [`FuncDefBody`] methods
//! ([`set_operand`](FuncDefBody::set_operand),
//! [`replace_all_uses_with`](FuncDefBody::replace_all_uses_with), etc.), which
//! keep the reverse use-index consistent with the operand edges. The use-index
//! is the only legitimate way to discover who reads a value, and erasure is
//! only allowed once it is empty for the erased instruction.

use crate::{
    Block, BlockDef, ConstDef, Context, EntityDefs, FuncParam, Inst, InstDef, InstKind, Type, Value,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// One use-edge: `consumer`'s operand number `operand_idx` reads the value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Use {
    pub consumer: Inst,
    pub operand_idx: u32,
}

pub struct FuncDefBody {
    pub params: SmallVec<[FuncParam; 2]>,

    pub insts: EntityDefs<Inst, InstDef>,
    pub blocks: EntityDefs<Block, BlockDef>,

    /// Blocks in program order; the first is the entry block.
    pub block_order: Vec<Block>,

    /// Reverse index over operand edges, keyed by the defining instruction.
    uses: FxHashMap<Inst, SmallVec<[Use; 4]>>,

    /// Owning block of every linked instruction.
    parent: FxHashMap<Inst, Block>,
}

impl FuncDefBody {
    /// A new body with an (empty, unterminated) entry block.
    pub fn new(cx: &Context) -> Self {
        let mut body = FuncDefBody {
            params: Default::default(),
            insts: Default::default(),
            blocks: Default::default(),
            block_order: Default::default(),
            uses: Default::default(),
            parent: Default::default(),
        };
        body.add_block(cx);
        body
    }

    pub fn entry_block(&self) -> Block {
        self.block_order[0]
    }

    pub fn add_block(&mut self, cx: &Context) -> Block {
        let block = self.blocks.define(cx, BlockDef { insts: Vec::new() });
        self.block_order.push(block);
        block
    }

    // --- queries ---

    pub fn uses_of(&self, inst: Inst) -> &[Use] {
        self.uses.get(&inst).map_or(&[], |v| v)
    }

    pub fn use_count(&self, inst: Inst) -> usize {
        self.uses_of(inst).len()
    }

    pub fn use_empty(&self, inst: Inst) -> bool {
        self.uses_of(inst).is_empty()
    }

    /// The single use-edge, iff there is exactly one.
    pub fn single_use(&self, inst: Inst) -> Option<Use> {
        match self.uses_of(inst) {
            &[u] => Some(u),
            _ => None,
        }
    }

    pub fn parent_block(&self, inst: Inst) -> Block {
        self.parent[&inst]
    }

    /// Program-order index of `inst` within its block.
    pub fn position_of(&self, inst: Inst) -> usize {
        let block = self.parent_block(inst);
        self.blocks[block].insts.iter().position(|&i| i == inst).unwrap()
    }

    pub fn terminator(&self, block: Block) -> Inst {
        let inst = *self.blocks[block].insts.last().expect("unterminated block");
        assert!(self.insts[inst].kind.is_terminator());
        inst
    }

    /// Index of the first non-phi instruction of `block` (phis always lead).
    pub fn first_non_phi_index(&self, block: Block) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|&i| !matches!(self.insts[i].kind, InstKind::Phi { .. }))
            .unwrap_or(self.blocks[block].insts.len())
    }

    pub fn value_type(&self, cx: &Context, v: Value) -> Type {
        match v {
            Value::Const(ct) => cx[ct].ty,
            Value::FuncParam { idx } => self.params[idx as usize].ty,
            Value::Inst(inst) => self.insts[inst].ty,
        }
    }

    // --- insertion ---

    fn link_new_inst(&mut self, inst: Inst, block: Block) {
        self.parent.insert(inst, block);
        let operands: SmallVec<[Value; 2]> = self.insts[inst].operands.clone();
        for (idx, v) in operands.into_iter().enumerate() {
            if let Value::Inst(def) = v {
                self.uses
                    .entry(def)
                    .or_default()
                    .push(Use { consumer: inst, operand_idx: idx as u32 });
            }
        }
    }

    pub fn append_inst(&mut self, cx: &Context, block: Block, def: InstDef) -> Inst {
        let inst = self.insts.define(cx, def);
        self.blocks[block].insts.push(inst);
        self.link_new_inst(inst, block);
        inst
    }

    pub fn insert_inst_at(&mut self, cx: &Context, block: Block, index: usize, def: InstDef) -> Inst {
        let inst = self.insts.define(cx, def);
        self.blocks[block].insts.insert(index, inst);
        self.link_new_inst(inst, block);
        inst
    }

    pub fn insert_inst_before(&mut self, cx: &Context, before: Inst, def: InstDef) -> Inst {
        let block = self.parent_block(before);
        let index = self.position_of(before);
        self.insert_inst_at(cx, block, index, def)
    }

    // --- mutation ---

    /// Rewrite one operand edge, keeping the use-index consistent.
    pub fn set_operand(&mut self, inst: Inst, operand_idx: u32, new: Value) {
        let old = self.insts[inst].operands[operand_idx as usize];
        if old == new {
            return;
        }
        if let Value::Inst(old_def) = old {
            let list = self.uses.get_mut(&old_def).unwrap();
            let pos = list
                .iter()
                .position(|u| u.consumer == inst && u.operand_idx == operand_idx)
                .expect("use-index out of sync with operand edge");
            list.swap_remove(pos);
        }
        self.insts[inst].operands[operand_idx as usize] = new;
        if let Value::Inst(new_def) = new {
            self.uses.entry(new_def).or_default().push(Use { consumer: inst, operand_idx });
        }
    }

    /// Redirect every use-edge of `old` to `new`.
    ///
    /// Must precede erasing `old`; erasure with live uses is a hard error.
    pub fn replace_all_uses_with(&mut self, old: Inst, new: Value) {
        assert!(new != Value::Inst(old), "instruction replaced with itself");
        let old_uses = self.uses.remove(&old).unwrap_or_default();
        for u in &old_uses {
            self.insts[u.consumer].operands[u.operand_idx as usize] = new;
        }
        if let Value::Inst(new_def) = new {
            self.uses.entry(new_def).or_default().extend(old_uses);
        }
    }

    /// Unlink and destroy `inst`. The instruction must have no remaining uses;
    /// its own operand use-edges are dropped here.
    pub fn erase(&mut self, inst: Inst) {
        assert!(
            self.use_empty(inst),
            "erasing an instruction that still has uses (dangling references)"
        );
        self.uses.remove(&inst);
        let operands = std::mem::take(&mut self.insts[inst].operands);
        for v in operands {
            if let Value::Inst(def) = v {
                if let Some(list) = self.uses.get_mut(&def) {
                    list.retain(|u| u.consumer != inst);
                }
            }
        }
        let block = self.parent.remove(&inst).unwrap();
        let pos = self.blocks[block].insts.iter().position(|&i| i == inst).unwrap();
        self.blocks[block].insts.remove(pos);
        self.insts.remove(inst);
    }

    /// Erase `seed` instructions that became dead, then transitively their
    /// newly-dead operand producers. Side-effecting instructions are skipped.
    pub fn erase_dead(&mut self, seed: impl IntoIterator<Item = Value>) {
        let mut worklist: Vec<Inst> = seed.into_iter().filter_map(Value::as_inst).collect();
        while let Some(inst) = worklist.pop() {
            if !self.insts.contains(inst) {
                continue;
            }
            if !self.use_empty(inst) || self.insts[inst].kind.has_side_effects() {
                continue;
            }
            worklist.extend(self.insts[inst].operands.iter().copied().filter_map(Value::as_inst));
            self.erase(inst);
        }
    }

    // --- auditing ---

    /// Walk the whole body and panic on any structural violation: a dangling
    /// operand edge, an out-of-sync use-index entry, a misplaced terminator,
    /// or a phi whose incoming lists disagree in length.
    pub fn assert_valid(&self, cx: &Context) {
        let mut expected_uses: FxHashMap<Inst, Vec<Use>> = FxHashMap::default();
        for &block in &self.block_order {
            let insts = &self.blocks[block].insts;
            for (pos, &inst) in insts.iter().enumerate() {
                assert!(self.insts.contains(inst), "block references an erased instruction");
                assert_eq!(self.parent[&inst], block, "parent map out of sync");
                let def = &self.insts[inst];
                let is_last = pos + 1 == insts.len();
                assert_eq!(
                    def.kind.is_terminator(),
                    is_last,
                    "terminator must be exactly the last instruction of its block"
                );
                if let InstKind::Phi { incoming_blocks } = &def.kind {
                    assert_eq!(
                        incoming_blocks.len(),
                        def.operands.len(),
                        "phi incoming blocks and values must be parallel"
                    );
                }
                for (idx, &v) in def.operands.iter().enumerate() {
                    // Interned constants are always live; only instruction
                    // operands can dangle.
                    if let Value::Inst(producer) = v {
                        assert!(
                            self.insts.contains(producer),
                            "operand references an erased instruction"
                        );
                        expected_uses
                            .entry(producer)
                            .or_default()
                            .push(Use { consumer: inst, operand_idx: idx as u32 });
                    }
                    let _ = self.value_type(cx, v);
                }
            }
        }
        // `Inst` has no `Ord` (entity allocation order is unobservable), so
        // the two sides are compared as multisets.
        for (inst, expected) in expected_uses {
            let count = |uses: &[Use]| {
                let mut counts: FxHashMap<(Inst, u32), usize> = FxHashMap::default();
                for u in uses {
                    *counts.entry((u.consumer, u.operand_idx)).or_default() += 1;
                }
                counts
            };
            assert_eq!(
                count(&expected),
                count(self.uses_of(inst)),
                "use-index out of sync for {inst:?}"
            );
        }
        for (&inst, list) in &self.uses {
            if !list.is_empty() {
                assert!(self.insts.contains(inst), "use-index entry for erased instruction");
            }
        }
    }

    /// Convenience for tests and matchers: the scalar constant behind `v`.
    pub fn as_const_scalar(&self, cx: &Context, v: Value) -> Option<crate::scalar::Const> {
        match v {
            Value::Const(ct) => match &cx[ct] {
                ConstDef { kind: crate::ConstKind::Scalar(s), .. } => Some(*s),
                _ => None,
            },
            _ => None,
        }
    }
}
