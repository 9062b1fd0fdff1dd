//! Plain-text printing of function bodies, for diagnostics and test output.
//!
//! The output is deliberately close to LLVM-assembler conventions
//! (`%N = add i32 %a, %b`), but it is not a parseable format; nothing in the
//! crate reads it back.

use crate::{
    ConstKind, Context, FuncDefBody, Inst, InstKind, TypeDef, Value,
};
use rustc_hash::FxHashMap;
use std::fmt::Write;

pub fn type_to_string(cx: &Context, ty: crate::Type) -> String {
    match &cx[ty] {
        TypeDef::Void => "void".into(),
        TypeDef::Scalar(s) => scalar_type_to_string(*s),
        TypeDef::Vector { elem, count } => {
            format!("<{} x {}>", count, scalar_type_to_string(*elem))
        }
        TypeDef::Ptr => "ptr".into(),
    }
}

fn scalar_type_to_string(s: crate::scalar::Type) -> String {
    match s {
        crate::scalar::Type::Bool => "i1".into(),
        crate::scalar::Type::Int(w) => format!("i{}", w.bits()),
        crate::scalar::Type::Float(w) => format!("f{}", w.bits()),
    }
}

pub fn const_to_string(cx: &Context, ct: crate::Const) -> String {
    match &cx[ct].kind {
        ConstKind::Scalar(s) => {
            // Signed rendering reads better for small negative values.
            match s.int_as_i128() {
                Some(v) if v < 0 && v > -1024 => format!("{v}"),
                _ => format!("{}", s.bits()),
            }
        }
        ConstKind::Vector(lanes) => {
            let inner: Vec<String> = lanes.iter().map(|&l| const_to_string(cx, l)).collect();
            format!("<{}>", inner.join(", "))
        }
        ConstKind::Undef => "undef".into(),
    }
}

struct Namer {
    inst_names: FxHashMap<Inst, usize>,
    block_names: FxHashMap<crate::Block, usize>,
}

impl Namer {
    fn value(&self, cx: &Context, v: Value) -> String {
        match v {
            Value::Const(ct) => const_to_string(cx, ct),
            Value::FuncParam { idx } => format!("%p{idx}"),
            Value::Inst(inst) => format!("%{}", self.inst_names[&inst]),
        }
    }

    fn block(&self, b: crate::Block) -> String {
        format!("bb{}", self.block_names[&b])
    }
}

pub fn func_body_to_string(cx: &Context, func: &FuncDefBody) -> String {
    let mut namer =
        Namer { inst_names: FxHashMap::default(), block_names: FxHashMap::default() };
    for (bi, &block) in func.block_order.iter().enumerate() {
        namer.block_names.insert(block, bi);
        for &inst in &func.blocks[block].insts {
            let n = namer.inst_names.len();
            namer.inst_names.insert(inst, n);
        }
    }

    let mut out = String::new();
    for &block in &func.block_order {
        let _ = writeln!(out, "{}:", namer.block(block));
        for &inst in &func.blocks[block].insts {
            let def = &func.insts[inst];
            let ops: Vec<String> =
                def.operands.iter().map(|&v| namer.value(cx, v)).collect();
            let ty = type_to_string(cx, def.ty);
            let lhs = if matches!(cx[def.ty], TypeDef::Void) {
                "  ".to_string()
            } else {
                format!("  %{} = ", namer.inst_names[&inst])
            };
            let body = match &def.kind {
                InstKind::Binary(op) => format!("{} {ty} {}", binop_name(*op), ops.join(", ")),
                InstKind::ICmp(pred) => {
                    format!("icmp {} {}", icmp_name(*pred), ops.join(", "))
                }
                InstKind::Select => format!("select {ty} {}", ops.join(", ")),
                InstKind::Cast(op) => format!("{} {} to {ty}", cast_name(*op), ops[0]),
                InstKind::Phi { incoming_blocks } => {
                    let arms: Vec<String> = ops
                        .iter()
                        .zip(incoming_blocks)
                        .map(|(v, &b)| format!("[{v}, {}]", namer.block(b)))
                        .collect();
                    format!("phi {ty} {}", arms.join(", "))
                }
                InstKind::ExtractElement => format!("extractelement {}", ops.join(", ")),
                InstKind::InsertElement => format!("insertelement {}", ops.join(", ")),
                InstKind::Alloca { elem, len } => {
                    format!("alloca [{} x {}]", len, type_to_string(cx, *elem))
                }
                InstKind::Gep => format!("gep {}", ops.join(", ")),
                InstKind::Load => format!("load {ty}, {}", ops[0]),
                InstKind::Store => format!("store {}", ops.join(", ")),
                InstKind::Call(intr) => {
                    format!("call {ty} @{}({})", intr.name(), ops.join(", "))
                }
                InstKind::UrbWrite { imm_offset, channel_mask, has_dynamic_base: _ } => format!(
                    "urb.write off={imm_offset} mask={:#04x} {}",
                    channel_mask.bits(),
                    ops.join(", ")
                ),
                InstKind::UrbRead { imm_offset, has_dynamic_base: _ } => {
                    format!("urb.read off={imm_offset} {}", ops.join(", "))
                }
                InstKind::Barrier => "barrier".into(),
                InstKind::Branch { targets } => {
                    let tgts: Vec<String> = targets.iter().map(|&b| namer.block(b)).collect();
                    if ops.is_empty() {
                        format!("br {}", tgts.join(", "))
                    } else {
                        format!("br {} ? {}", ops[0], tgts.join(", "))
                    }
                }
                InstKind::Return => {
                    if ops.is_empty() {
                        "ret".into()
                    } else {
                        format!("ret {}", ops[0])
                    }
                }
            };
            let _ = writeln!(out, "{lhs}{body}");
        }
    }
    out
}

fn binop_name(op: crate::BinOp) -> &'static str {
    match op {
        crate::BinOp::Add => "add",
        crate::BinOp::Sub => "sub",
        crate::BinOp::Mul => "mul",
        crate::BinOp::UDiv => "udiv",
        crate::BinOp::SDiv => "sdiv",
        crate::BinOp::And => "and",
        crate::BinOp::Or => "or",
        crate::BinOp::Xor => "xor",
        crate::BinOp::Shl => "shl",
        crate::BinOp::LShr => "lshr",
        crate::BinOp::AShr => "ashr",
    }
}

fn icmp_name(pred: crate::IcmpPred) -> &'static str {
    match pred {
        crate::IcmpPred::Eq => "eq",
        crate::IcmpPred::Ne => "ne",
        crate::IcmpPred::Ult => "ult",
        crate::IcmpPred::Ule => "ule",
        crate::IcmpPred::Ugt => "ugt",
        crate::IcmpPred::Uge => "uge",
        crate::IcmpPred::Slt => "slt",
        crate::IcmpPred::Sle => "sle",
        crate::IcmpPred::Sgt => "sgt",
        crate::IcmpPred::Sge => "sge",
    }
}

fn cast_name(op: crate::CastOp) -> &'static str {
    match op {
        crate::CastOp::ZExt => "zext",
        crate::CastOp::SExt => "sext",
        crate::CastOp::Trunc => "trunc",
        crate::CastOp::BitCast => "bitcast",
    }
}
