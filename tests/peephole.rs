//! Pattern-rewrite pass tests: concrete rewrite shapes, semantic equivalence
//! under the reference interpreter, and idempotence of every rule.

use gpir::builder::Builder;
use gpir::interp::{eval_func, EvalValue};
use gpir::passes;
use gpir::platform::{PassFlags, PlatformCaps};
use gpir::scalar;
use gpir::{
    AttrSet, BinOp, CastOp, Context, FuncDefBody, FuncParam, IcmpPred, InstKind, Intrinsic, Type,
    Value,
};
use proptest::prelude::*;

fn new_func(cx: &Context, params: &[Type]) -> FuncDefBody {
    let mut func = FuncDefBody::new(cx);
    for &ty in params {
        func.params.push(FuncParam { attrs: AttrSet::default(), ty });
    }
    func
}

fn run_peephole(cx: &Context, func: &mut FuncDefBody) -> bool {
    passes::peephole::run(cx, func, &PlatformCaps::default(), &PassFlags::default())
}

fn run_dp4a(cx: &Context, func: &mut FuncDefBody) -> bool {
    passes::dp4a::run(cx, func, &PlatformCaps::default(), &PassFlags::default())
}

fn param(idx: u32) -> Value {
    Value::FuncParam { idx }
}

fn eval_i32(cx: &Context, func: &FuncDefBody, args: &[u32]) -> u128 {
    let i32t = cx.type_int(32);
    let args = args.iter().map(|&a| EvalValue::scalar(i32t, a as u128)).collect();
    eval_func(cx, func, args).0.unwrap().as_scalar_bits()
}

fn count_kind(func: &FuncDefBody, pred: impl Fn(&InstKind) -> bool) -> usize {
    func.block_order
        .iter()
        .flat_map(|&b| &func.blocks[b].insts)
        .filter(|&&i| pred(&func.insts[i].kind))
        .count()
}

#[test]
fn inverted_compare_select_scenario() {
    let cx = Context::new();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[i32t, i32t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let cmp = bld.icmp(IcmpPred::Eq, param(0), param(1));
    let t = bld.const_bool(true);
    let not = bld.binop(BinOp::Xor, cmp, t);
    let k0 = bld.const_int(scalar::Type::I8, 0);
    let k1 = bld.const_int(scalar::Type::I8, 1);
    let sel = bld.select(cmp, k0, k1);
    bld.ret(Some(sel));

    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);

    // The xor is gone, the compare is inverted in place, and the select's
    // arms compensated.
    assert!(!func.insts.contains(not.as_inst().unwrap()));
    let cmp_inst = cmp.as_inst().unwrap();
    assert_eq!(func.insts[cmp_inst].kind, InstKind::ICmp(IcmpPred::Ne));
    let sel_inst = sel.as_inst().unwrap();
    assert_eq!(func.insts[sel_inst].operands[0], cmp);
    assert_eq!(func.insts[sel_inst].operands[1], k1);
    assert_eq!(func.insts[sel_inst].operands[2], k0);

    for (a, b) in [(3u32, 3u32), (3, 4), (0, u32::MAX)] {
        let expected = if a == b { 0 } else { 1 };
        assert_eq!(eval_i32(&cx, &func, &[a, b]), expected);
    }

    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn mul_by_negative_power_of_two_negates() {
    let cx = Context::new();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[i32t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let c = bld.const_scalar(scalar::Const::int_try_from_i128(scalar::Type::I32, -8).unwrap());
    let m = bld.binop(BinOp::Mul, param(0), c);
    bld.ret(Some(m));

    let before: Vec<u128> = [0u32, 1, 7, 0x8000_0001].iter().map(|&x| eval_i32(&cx, &func, &[x])).collect();
    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(BinOp::Mul))), 0);
    let after: Vec<u128> = [0u32, 1, 7, 0x8000_0001].iter().map(|&x| eval_i32(&cx, &func, &[x])).collect();
    assert_eq!(before, after);
    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn sdiv_by_nonpositive_divisor_is_left_alone() {
    // 0x8000_0000 is a power of two in raw bits but INT_MIN as a signed i32;
    // neither it nor any other non-positive divisor may strength-reduce.
    let cx = Context::new();
    let i32t = cx.type_int(32);
    for divisor_bits in [0x8000_0000u128, (-8i32) as u32 as u128] {
        let mut func = new_func(&cx, &[i32t]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let c = bld.const_int(scalar::Type::I32, divisor_bits);
        let d = bld.binop(BinOp::SDiv, param(0), c);
        bld.ret(Some(d));

        let cases = [i32::MIN, -24, -1, 0, 7, i32::MAX];
        let before: Vec<u128> = cases.iter().map(|&x| eval_i32(&cx, &func, &[x as u32])).collect();
        assert!(!run_peephole(&cx, &mut func));
        func.assert_valid(&cx);
        assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(BinOp::SDiv))), 1);
        let after: Vec<u128> = cases.iter().map(|&x| eval_i32(&cx, &func, &[x as u32])).collect();
        assert_eq!(before, after);
    }

    // Spot-check the division the rewrite would have gotten wrong.
    let mut func = new_func(&cx, &[i32t]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let c = bld.const_int(scalar::Type::I32, 0x8000_0000);
    let d = bld.binop(BinOp::SDiv, param(0), c);
    bld.ret(Some(d));
    assert!(!run_peephole(&cx, &mut func));
    assert_eq!(eval_i32(&cx, &func, &[i32::MIN as u32]), 1);
    assert_eq!(eval_i32(&cx, &func, &[5]), 0);
}

#[test]
fn cast_hoists_below_select() {
    let cx = Context::new();
    let boolt = cx.type_bool();
    let i8t = cx.type_int(8);
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[boolt, i8t, i8t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let wa = bld.zext(i32t, param(1));
    let wb = bld.zext(i32t, param(2));
    let sel = bld.select(param(0), wa, wb);
    bld.ret(Some(sel));

    let eval = |func: &FuncDefBody, c: bool, a: u8, b: u8| {
        let args = vec![
            EvalValue::scalar(boolt, c as u128),
            EvalValue::scalar(i8t, a as u128),
            EvalValue::scalar(i8t, b as u128),
        ];
        eval_func(&cx, func, args).0.unwrap().as_scalar_bits()
    };
    let before = [eval(&func, true, 200, 3), eval(&func, false, 200, 3)];

    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);
    // One cast left, above a narrow select.
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Cast(CastOp::ZExt))), 1);
    let after = [eval(&func, true, 200, 3), eval(&func, false, 200, 3)];
    assert_eq!(before, after);
    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn nested_cast_chain_hoists_in_one_sweep() {
    // Hoisting the outer trunc exposes a select of i64->i32 truncs; the pass
    // must chase that in the same sweep instead of leaving work for a rerun.
    let cx = Context::new();
    let boolt = cx.type_bool();
    let i16t = cx.type_int(16);
    let i32t = cx.type_int(32);
    let i64t = cx.type_int(64);
    let mut func = new_func(&cx, &[boolt, i64t, i64t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let ma = bld.cast(CastOp::Trunc, i32t, param(1));
    let mb = bld.cast(CastOp::Trunc, i32t, param(2));
    let na = bld.cast(CastOp::Trunc, i16t, ma);
    let nb = bld.cast(CastOp::Trunc, i16t, mb);
    let sel = bld.select(param(0), na, nb);
    bld.ret(Some(sel));

    let eval = |func: &FuncDefBody, c: bool, a: u64, b: u64| {
        let args = vec![
            EvalValue::scalar(boolt, c as u128),
            EvalValue::scalar(i64t, a as u128),
            EvalValue::scalar(i64t, b as u128),
        ];
        eval_func(&cx, func, args).0.unwrap().as_scalar_bits()
    };
    let cases = [(true, 0x1234_5678_9ABCu64, 0xFFFFu64), (false, u64::MAX, 7)];
    let before: Vec<u128> = cases.iter().map(|&(c, a, b)| eval(&func, c, a, b)).collect();

    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);
    // The wide select is gone; what remains is one i64 select under the cast
    // chain, so a second sweep has nothing left to do.
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Select)), 1);
    let after: Vec<u128> = cases.iter().map(|&(c, a, b)| eval(&func, c, a, b)).collect();
    assert_eq!(before, after);
    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn bit_reversal_butterfly_becomes_bfrev() {
    let cx = Context::new();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[i32t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let mut v = param(0);
    for (s, m) in [
        (1u128, 0x5555_5555u128),
        (2, 0x3333_3333),
        (4, 0x0F0F_0F0F),
        (8, 0x00FF_00FF),
        (16, 0x0000_FFFF),
    ] {
        let sc = bld.const_int(scalar::Type::I32, s);
        let mc = bld.const_int(scalar::Type::I32, m);
        let hi = {
            let sh = bld.binop(BinOp::LShr, v, sc);
            bld.binop(BinOp::And, sh, mc)
        };
        let lo = {
            let masked = bld.binop(BinOp::And, v, mc);
            bld.binop(BinOp::Shl, masked, sc)
        };
        v = bld.binop(BinOp::Or, hi, lo);
    }
    bld.ret(Some(v));

    for x in [0u32, 1, 0xDEAD_BEEF, u32::MAX] {
        assert_eq!(eval_i32(&cx, &func, &[x]), x.reverse_bits() as u128);
    }

    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Call(Intrinsic::Bfrev))), 1);
    // The whole ladder died with the final or.
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(_))), 0);
    for x in [0u32, 1, 0xDEAD_BEEF, u32::MAX] {
        assert_eq!(eval_i32(&cx, &func, &[x]), x.reverse_bits() as u128);
    }
    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn carry_out_compare_becomes_uaddc() {
    let cx = Context::new();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[i32t, i32t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let s = bld.binop(BinOp::Add, param(0), param(1));
    let c = bld.icmp(IcmpPred::Ult, s, param(0));
    let cz = bld.zext(i32t, c);
    let total = bld.binop(BinOp::Add, s, cz);
    bld.ret(Some(total));

    let cases = [(0u32, 0u32), (1, 2), (u32::MAX, 1), (u32::MAX, u32::MAX)];
    let before: Vec<u128> = cases.iter().map(|&(a, b)| eval_i32(&cx, &func, &[a, b])).collect();

    assert!(run_peephole(&cx, &mut func));
    func.assert_valid(&cx);
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Call(Intrinsic::Uaddc))), 1);
    let after: Vec<u128> = cases.iter().map(|&(a, b)| eval_i32(&cx, &func, &[a, b])).collect();
    assert_eq!(before, after);
    assert!(!run_peephole(&cx, &mut func));
}

#[test]
fn dp4a_scenario_with_zero_accumulator() {
    let cx = Context::new();
    let i8t = cx.type_int(8);
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[i8t; 8]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let mut sum: Option<Value> = None;
    for i in 0..4 {
        let ea = bld.sext(i32t, param(i));
        let eb = bld.sext(i32t, param(i + 4));
        let m = bld.binop(BinOp::Mul, ea, eb);
        sum = Some(match sum {
            None => m,
            Some(s) => bld.binop(BinOp::Add, s, m),
        });
    }
    let zero = bld.const_int(scalar::Type::I32, 0);
    let root = bld.binop(BinOp::Add, sum.unwrap(), zero);
    bld.ret(Some(root));

    let eval = |func: &FuncDefBody, vals: [i8; 8]| {
        let args = vals.iter().map(|&v| EvalValue::scalar(i8t, v as u8 as u128)).collect();
        eval_func(&cx, func, args).0.unwrap().as_scalar_bits()
    };
    let cases = [[0i8; 8], [1, 2, 3, 4, 5, 6, 7, 8], [-1, -128, 127, 3, -5, 9, -100, 44]];
    let before: Vec<u128> = cases.iter().map(|&c| eval(&func, c)).collect();
    // Reference: plain signed dot product.
    for (&c, &got) in cases.iter().zip(&before) {
        let expected: i64 = (0..4).map(|i| c[i] as i64 * c[i + 4] as i64).sum();
        assert_eq!(got, (expected as i32) as u32 as u128);
    }

    assert!(run_dp4a(&cx, &mut func));
    func.assert_valid(&cx);
    let calls: Vec<_> = func.block_order
        .iter()
        .flat_map(|&b| &func.blocks[b].insts)
        .filter(|&&i| matches!(func.insts[i].kind, InstKind::Call(Intrinsic::Dp4aSS)))
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(func.insts[*calls[0]].operands[0], zero);
    assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(BinOp::Mul))), 0);

    let after: Vec<u128> = cases.iter().map(|&c| eval(&func, c)).collect();
    assert_eq!(before, after);
    assert!(!run_dp4a(&cx, &mut func));
}

#[test]
fn masked_i64_tree_narrows_to_i32() {
    let cx = Context::new();
    let i64t = cx.type_int(64);
    let mut func = new_func(&cx, &[i64t, i64t]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let s = bld.binop(BinOp::Add, param(0), param(1));
    let p = bld.binop(BinOp::Mul, s, param(0));
    let mask = bld.const_int(scalar::Type::I64, 0xFFFF_FFFF);
    let masked = bld.binop(BinOp::And, p, mask);
    bld.ret(Some(masked));

    let eval = |func: &FuncDefBody, a: u64, b: u64| {
        let args = vec![EvalValue::scalar(i64t, a as u128), EvalValue::scalar(i64t, b as u128)];
        eval_func(&cx, func, args).0.unwrap().as_scalar_bits()
    };
    let cases = [(0u64, 0u64), (1 << 40, 3), (u64::MAX, u64::MAX), (0xABCD_EF01_2345, 99)];
    let before: Vec<u128> = cases.iter().map(|&(a, b)| eval(&func, a, b)).collect();

    assert!(passes::narrow64::run(&cx, &mut func, &PassFlags::default()));
    func.assert_valid(&cx);
    // Everything arithmetic now happens at i32.
    let i32t = cx.type_int(32);
    for &b in &func.block_order {
        for &i in &func.blocks[b].insts {
            if matches!(func.insts[i].kind, InstKind::Binary(_)) {
                assert_eq!(func.insts[i].ty, i32t);
            }
        }
    }
    let after: Vec<u128> = cases.iter().map(|&(a, b)| eval(&func, a, b)).collect();
    assert_eq!(before, after);
    assert!(!passes::narrow64::run(&cx, &mut func, &PassFlags::default()));
}

#[test]
fn alloca_shrinks_to_used_range() {
    let cx = Context::new();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let arr = bld.alloca(i32t, 10);
    let i4 = bld.const_int(scalar::Type::I32, 4);
    let i6 = bld.const_int(scalar::Type::I32, 6);
    let g4 = bld.gep(arr, i4);
    let v11 = bld.const_int(scalar::Type::I32, 11);
    bld.store(g4, v11);
    let g6 = bld.gep(arr, i6);
    let v22 = bld.const_int(scalar::Type::I32, 22);
    bld.store(g6, v22);
    let l = bld.load(i32t, g4);
    bld.ret(Some(l));

    assert_eq!(eval_i32(&cx, &func, &[]), 11);
    assert!(passes::shrink_alloca::run(&cx, &mut func, &PassFlags::default()));
    func.assert_valid(&cx);
    let allocas: Vec<_> = func.block_order
        .iter()
        .flat_map(|&b| &func.blocks[b].insts)
        .filter(|&&i| matches!(func.insts[i].kind, InstKind::Alloca { .. }))
        .collect();
    assert_eq!(allocas.len(), 1);
    assert!(matches!(func.insts[*allocas[0]].kind, InstKind::Alloca { len: 3, .. }));
    assert_eq!(eval_i32(&cx, &func, &[]), 11);
    assert!(!passes::shrink_alloca::run(&cx, &mut func, &PassFlags::default()));
}

#[test]
fn select_indexed_load_duplicates_then_shrinks() {
    let cx = Context::new();
    let boolt = cx.type_bool();
    let i32t = cx.type_int(32);
    let mut func = new_func(&cx, &[boolt]);
    let entry = func.entry_block();

    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let arr = bld.alloca(i32t, 10);
    let k2 = bld.const_int(scalar::Type::I32, 2);
    let k7 = bld.const_int(scalar::Type::I32, 7);
    let g2 = bld.gep(arr, k2);
    let v5 = bld.const_int(scalar::Type::I32, 5);
    bld.store(g2, v5);
    let g7 = bld.gep(arr, k7);
    let v9 = bld.const_int(scalar::Type::I32, 9);
    bld.store(g7, v9);
    let idx = bld.select(param(0), k2, k7);
    let g = bld.gep(arr, idx);
    let l = bld.load(i32t, g);
    bld.ret(Some(l));

    let eval = |func: &FuncDefBody, c: bool| {
        let args = vec![EvalValue::scalar(boolt, c as u128)];
        eval_func(&cx, func, args).0.unwrap().as_scalar_bits()
    };
    assert_eq!(eval(&func, true), 5);
    assert_eq!(eval(&func, false), 9);

    assert!(passes::shrink_alloca::run(&cx, &mut func, &PassFlags::default()));
    func.assert_valid(&cx);
    assert!(matches!(
        func.insts[func.block_order
            .iter()
            .flat_map(|&b| &func.blocks[b].insts)
            .copied()
            .find(|&i| matches!(func.insts[i].kind, InstKind::Alloca { .. }))
            .unwrap()]
        .kind,
        InstKind::Alloca { len: 6, .. }
    ));
    assert_eq!(eval(&func, true), 5);
    assert_eq!(eval(&func, false), 9);
    assert!(!passes::shrink_alloca::run(&cx, &mut func, &PassFlags::default()));
}

proptest! {
    #[test]
    fn mul_pow2_strength_reduction_is_exact(x in any::<u32>(), k in 1u32..31) {
        let cx = Context::new();
        let i32t = cx.type_int(32);
        let mut func = new_func(&cx, &[i32t]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let c = bld.const_int(scalar::Type::I32, 1u128 << k);
        let m = bld.binop(BinOp::Mul, param(0), c);
        bld.ret(Some(m));

        let before = eval_i32(&cx, &func, &[x]);
        prop_assert!(run_peephole(&cx, &mut func));
        func.assert_valid(&cx);
        prop_assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(BinOp::Mul))), 0);
        prop_assert_eq!(eval_i32(&cx, &func, &[x]), before);
        prop_assert_eq!(before, (x.wrapping_shl(k)) as u128);
        prop_assert!(!run_peephole(&cx, &mut func));
    }

    #[test]
    fn sdiv_pow2_rounds_toward_zero(x in any::<i32>(), k in 1u32..31) {
        let cx = Context::new();
        let i32t = cx.type_int(32);
        let mut func = new_func(&cx, &[i32t]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let c = bld.const_int(scalar::Type::I32, 1u128 << k);
        let d = bld.binop(BinOp::SDiv, param(0), c);
        bld.ret(Some(d));

        let before = eval_i32(&cx, &func, &[x as u32]);
        prop_assert!(run_peephole(&cx, &mut func));
        func.assert_valid(&cx);
        prop_assert_eq!(count_kind(&func, |k| matches!(k, InstKind::Binary(BinOp::SDiv))), 0);
        let after = eval_i32(&cx, &func, &[x as u32]);
        prop_assert_eq!(after, before);
        prop_assert_eq!(after, (x / (1i32 << k)) as u32 as u128);
        prop_assert!(!run_peephole(&cx, &mut func));
    }
}
