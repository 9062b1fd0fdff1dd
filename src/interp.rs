//! A reference interpreter over function bodies.
//!
//! Used by the property tests to check semantic equivalence of a rewrite: the
//! same function is evaluated before and after a pass over concrete operand
//! values, and the results (including the replayed URB state) must agree
//! bit-for-bit. This is a test oracle, not a shipping execution engine, so it
//! panics on anything malformed rather than diagnosing it.

use crate::scalar;
use crate::{
    BinOp, Block, CastOp, ConstKind, Context, FuncDefBody, Inst, InstKind, Intrinsic, Type,
    TypeDef, Value,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// A concrete runtime value: either raw lanes of bits, or a pointer into one
/// private array.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EvalValue {
    Bits { ty: Type, lanes: SmallVec<[u128; 4]> },
    Ptr { alloca: Inst, index: i64 },
}

impl EvalValue {
    pub fn scalar(ty: Type, bits: u128) -> EvalValue {
        EvalValue::Bits { ty, lanes: [bits].into_iter().collect() }
    }

    pub fn as_scalar_bits(&self) -> u128 {
        match self {
            EvalValue::Bits { lanes, .. } => {
                assert_eq!(lanes.len(), 1);
                lanes[0]
            }
            EvalValue::Ptr { .. } => panic!("pointer where bits expected"),
        }
    }
}

/// Replayed URB contents: `(dynamic base, row, channel) -> dword`.
///
/// A write with `imm_offset = o` and mask bit `i` set lands in row
/// `o + i / 4`, channel `i % 4`, which is exactly how the hardware decodes a
/// merged 8-channel write spanning two consecutive rows.
pub type UrbState = BTreeMap<(u128, u32, u32), u128>;

pub struct Machine<'a> {
    cx: &'a Context,
    func: &'a FuncDefBody,
    args: Vec<EvalValue>,

    env: FxHashMap<Inst, EvalValue>,
    mem: FxHashMap<(Inst, i64), u128>,
    pub urb: UrbState,

    steps_left: u64,
}

impl<'a> Machine<'a> {
    pub fn new(cx: &'a Context, func: &'a FuncDefBody, args: Vec<EvalValue>) -> Self {
        Machine {
            cx,
            func,
            args,
            env: FxHashMap::default(),
            mem: FxHashMap::default(),
            urb: BTreeMap::new(),
            steps_left: 1 << 20,
        }
    }

    /// Execute from the entry block to the first `Return`.
    pub fn run(&mut self) -> Option<EvalValue> {
        let mut block = self.func.entry_block();
        let mut prev_block: Option<Block> = None;
        loop {
            let insts = self.func.blocks[block].insts.clone();
            let mut next: Option<Block> = None;
            for inst in insts {
                self.steps_left =
                    self.steps_left.checked_sub(1).expect("interpreter step budget exceeded");
                let def = &self.func.insts[inst];
                match &def.kind {
                    InstKind::Phi { incoming_blocks } => {
                        let pred = prev_block.expect("phi in entry block");
                        let idx = incoming_blocks
                            .iter()
                            .position(|&b| b == pred)
                            .expect("phi has no incoming entry for predecessor");
                        let v = self.value(def.operands[idx]);
                        self.env.insert(inst, v);
                    }
                    InstKind::Branch { targets } => {
                        next = Some(if targets.len() == 1 {
                            targets[0]
                        } else {
                            let cond = self.value(def.operands[0]).as_scalar_bits();
                            if cond != 0 { targets[0] } else { targets[1] }
                        });
                    }
                    InstKind::Return => {
                        return def.operands.first().map(|&v| self.value(v));
                    }
                    _ => {
                        if let Some(v) = self.eval_data_inst(inst) {
                            self.env.insert(inst, v);
                        }
                    }
                }
            }
            prev_block = Some(block);
            block = next.expect("block fell through without a terminator");
        }
    }

    fn value(&self, v: Value) -> EvalValue {
        match v {
            Value::Const(ct) => self.const_value(ct),
            Value::FuncParam { idx } => self.args[idx as usize].clone(),
            Value::Inst(inst) => self.env[&inst].clone(),
        }
    }

    fn const_value(&self, ct: crate::Const) -> EvalValue {
        let ty = self.cx[ct].ty;
        match &self.cx[ct].kind {
            ConstKind::Scalar(s) => EvalValue::scalar(ty, s.bits()),
            ConstKind::Vector(lanes) => EvalValue::Bits {
                ty,
                lanes: lanes.iter().map(|&l| self.const_value(l).as_scalar_bits()).collect(),
            },
            // Undef evaluates as zero; good enough for an oracle whose inputs
            // never make a result depend on it.
            ConstKind::Undef => match &self.cx[ty] {
                TypeDef::Vector { count, .. } => {
                    EvalValue::Bits { ty, lanes: (0..*count).map(|_| 0).collect() }
                }
                _ => EvalValue::scalar(ty, 0),
            },
        }
    }

    fn elem_scalar_ty(&self, ty: Type) -> scalar::Type {
        match &self.cx[ty] {
            TypeDef::Scalar(s) => *s,
            TypeDef::Vector { elem, .. } => *elem,
            _ => panic!("expected a value type"),
        }
    }

    fn eval_data_inst(&mut self, inst: Inst) -> Option<EvalValue> {
        let def = &self.func.insts[inst];
        let ty = def.ty;
        Some(match &def.kind {
            InstKind::Binary(op) => {
                let a = self.value(def.operands[0]);
                let b = self.value(def.operands[1]);
                let elem = self.elem_scalar_ty(ty);
                let (la, lb) = match (a, b) {
                    (EvalValue::Bits { lanes: la, .. }, EvalValue::Bits { lanes: lb, .. }) => {
                        (la, lb)
                    }
                    _ => panic!("pointer operand in binary op"),
                };
                assert_eq!(la.len(), lb.len());
                let lanes = la
                    .iter()
                    .zip(&lb)
                    .map(|(&x, &y)| {
                        let cx_ = scalar::Const::from_bits(elem, x);
                        let cy = scalar::Const::from_bits(elem, y);
                        scalar::Const::int_binop(*op, cx_, cy)
                            .expect("division by zero reached the interpreter")
                            .bits()
                    })
                    .collect();
                EvalValue::Bits { ty, lanes }
            }
            InstKind::ICmp(pred) => {
                let a = self.value(def.operands[0]).as_scalar_bits();
                let b = self.value(def.operands[1]).as_scalar_bits();
                let elem = self.elem_scalar_ty(self.func.value_type(self.cx, def.operands[0]));
                let r = scalar::Const::int_icmp(
                    *pred,
                    scalar::Const::from_bits(elem, a),
                    scalar::Const::from_bits(elem, b),
                )
                .unwrap();
                EvalValue::scalar(ty, r as u128)
            }
            InstKind::Select => {
                let cond = self.value(def.operands[0]).as_scalar_bits();
                if cond != 0 {
                    self.value(def.operands[1])
                } else {
                    self.value(def.operands[2])
                }
            }
            InstKind::Cast(op) => {
                let src_ty = self.func.value_type(self.cx, def.operands[0]);
                let src = self.value(def.operands[0]);
                match op {
                    CastOp::ZExt | CastOp::SExt | CastOp::Trunc => {
                        let from = self.cx[src_ty].as_scalar().unwrap();
                        let to = self.cx[ty].as_scalar().unwrap();
                        let s = scalar::Const::from_bits(from, src.as_scalar_bits());
                        let folded = match op {
                            CastOp::ZExt => s.int_zext(to),
                            CastOp::SExt => s.int_sext(to),
                            CastOp::Trunc => s.int_trunc(to),
                            CastOp::BitCast => unreachable!(),
                        }
                        .expect("malformed cast reached the interpreter");
                        EvalValue::scalar(ty, folded.bits())
                    }
                    CastOp::BitCast => {
                        let lanes = match src {
                            EvalValue::Bits { lanes, .. } => lanes,
                            _ => panic!("bitcast of pointer"),
                        };
                        let from_elem = self.elem_scalar_ty(src_ty);
                        let ew = from_elem.bit_width();
                        let total = self.cx[src_ty].bit_width().unwrap();
                        assert!(total <= 128, "bitcast wider than 128 bits in the interpreter");
                        assert_eq!(Some(total), self.cx[ty].bit_width());
                        let mut bits = 0u128;
                        for (i, &l) in lanes.iter().enumerate() {
                            bits |= l << (i as u32 * ew);
                        }
                        match &self.cx[ty] {
                            TypeDef::Scalar(s) => {
                                EvalValue::scalar(ty, bits & width_mask(s.bit_width()))
                            }
                            TypeDef::Vector { elem, count } => {
                                let ew2 = elem.bit_width();
                                EvalValue::Bits {
                                    ty,
                                    lanes: (0..*count)
                                        .map(|i| (bits >> (i as u32 * ew2)) & width_mask(ew2))
                                        .collect(),
                                }
                            }
                            _ => panic!("bitcast to non-value type"),
                        }
                    }
                }
            }
            InstKind::ExtractElement => {
                let vec = self.value(def.operands[0]);
                let idx = self.value(def.operands[1]).as_scalar_bits() as usize;
                match vec {
                    EvalValue::Bits { lanes, .. } => EvalValue::scalar(ty, lanes[idx]),
                    _ => panic!("extractelement of pointer"),
                }
            }
            InstKind::InsertElement => {
                let vec = self.value(def.operands[0]);
                let elem = self.value(def.operands[1]).as_scalar_bits();
                let idx = self.value(def.operands[2]).as_scalar_bits() as usize;
                match vec {
                    EvalValue::Bits { mut lanes, .. } => {
                        lanes[idx] = elem;
                        EvalValue::Bits { ty, lanes }
                    }
                    _ => panic!("insertelement into pointer"),
                }
            }
            InstKind::Alloca { .. } => EvalValue::Ptr { alloca: inst, index: 0 },
            InstKind::Gep => {
                let base = self.value(def.operands[0]);
                let idx = {
                    let v = self.value(def.operands[1]);
                    let elem = self.elem_scalar_ty(self.func.value_type(self.cx, def.operands[1]));
                    scalar::Const::from_bits(elem, v.as_scalar_bits()).int_as_i128().unwrap()
                        as i64
                };
                match base {
                    EvalValue::Ptr { alloca, index } => {
                        EvalValue::Ptr { alloca, index: index + idx }
                    }
                    _ => panic!("gep of non-pointer"),
                }
            }
            InstKind::Load => {
                let (alloca, index) = match self.value(def.operands[0]) {
                    EvalValue::Ptr { alloca, index } => (alloca, index),
                    _ => panic!("load from non-pointer"),
                };
                let bits = self.mem.get(&(alloca, index)).copied().unwrap_or(0);
                let w = self.cx[ty].bit_width().unwrap();
                EvalValue::scalar(ty, bits & width_mask(w))
            }
            InstKind::Store => {
                let (alloca, index) = match self.value(def.operands[0]) {
                    EvalValue::Ptr { alloca, index } => (alloca, index),
                    _ => panic!("store to non-pointer"),
                };
                let bits = self.value(def.operands[1]).as_scalar_bits();
                self.mem.insert((alloca, index), bits);
                return None;
            }
            InstKind::Call(intr) => self.eval_intrinsic(*intr, inst),
            InstKind::UrbWrite { imm_offset, channel_mask, has_dynamic_base } => {
                let base_operands = *has_dynamic_base as usize;
                let base = if *has_dynamic_base {
                    self.value(def.operands[0]).as_scalar_bits()
                } else {
                    0
                };
                for (di, ch) in channel_mask.channels().enumerate() {
                    let data =
                        self.value(def.operands[base_operands + di]).as_scalar_bits();
                    self.urb.insert((base, imm_offset + ch / 4, ch % 4), data);
                }
                return None;
            }
            InstKind::UrbRead { imm_offset, has_dynamic_base } => {
                let base = if *has_dynamic_base {
                    self.value(def.operands[0]).as_scalar_bits()
                } else {
                    0
                };
                EvalValue::Bits {
                    ty,
                    lanes: (0..4)
                        .map(|ch| self.urb.get(&(base, *imm_offset, ch)).copied().unwrap_or(0))
                        .collect(),
                }
            }
            InstKind::Barrier => return None,
            InstKind::Phi { .. } | InstKind::Branch { .. } | InstKind::Return => {
                unreachable!("control handled by the run loop")
            }
        })
    }

    fn eval_intrinsic(&mut self, intr: Intrinsic, inst: Inst) -> EvalValue {
        let def = &self.func.insts[inst];
        let ty = def.ty;
        let arg = |m: &Self, i: usize| m.value(def.operands[i]).as_scalar_bits();
        match intr {
            Intrinsic::Dp4aSS | Intrinsic::Dp4aSU | Intrinsic::Dp4aUS | Intrinsic::Dp4aUU => {
                let acc = arg(self, 0) as u32;
                let a = arg(self, 1) as u32;
                let b = arg(self, 2) as u32;
                let a_signed = matches!(intr, Intrinsic::Dp4aSS | Intrinsic::Dp4aSU);
                let b_signed = matches!(intr, Intrinsic::Dp4aSS | Intrinsic::Dp4aUS);
                let lane = |packed: u32, i: u32, signed: bool| -> i64 {
                    let byte = (packed >> (8 * i)) as u8;
                    if signed { byte as i8 as i64 } else { byte as i64 }
                };
                let mut sum = acc as i32 as i64;
                for i in 0..4 {
                    sum = sum.wrapping_add(lane(a, i, a_signed) * lane(b, i, b_signed));
                }
                EvalValue::scalar(ty, (sum as u32) as u128)
            }
            Intrinsic::Bfrev => {
                let x = arg(self, 0) as u32;
                EvalValue::scalar(ty, x.reverse_bits() as u128)
            }
            Intrinsic::Uaddc => {
                let a = arg(self, 0) as u32;
                let b = arg(self, 1) as u32;
                let (sum, carry) = a.overflowing_add(b);
                EvalValue::Bits {
                    ty,
                    lanes: [sum as u128, carry as u128].into_iter().collect(),
                }
            }
            Intrinsic::UMulH => {
                let w = self.cx[ty].bit_width().unwrap();
                assert!(w <= 64);
                let a = arg(self, 0);
                let b = arg(self, 1);
                EvalValue::scalar(ty, ((a * b) >> w) & width_mask(w))
            }
            Intrinsic::SimdShuffleXor | Intrinsic::TypedRead => {
                panic!("{} has no single-thread semantics to interpret", intr.name())
            }
        }
    }
}

fn width_mask(w: u32) -> u128 {
    if w == 128 { !0 } else { (1u128 << w) - 1 }
}

/// Evaluate `func` over `args`, returning the result value and URB replay.
pub fn eval_func(
    cx: &Context,
    func: &FuncDefBody,
    args: Vec<EvalValue>,
) -> (Option<EvalValue>, UrbState) {
    let mut m = Machine::new(cx, func, args);
    let ret = m.run();
    (ret, m.urb)
}
