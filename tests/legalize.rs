//! Width-legalization tests: randomized round-trips against the constant
//! evaluator at the original width, structural checks that no illegal-width
//! compute survives, and the deliberate panics for unsupported shapes.

use gpir::builder::Builder;
use gpir::interp::{eval_func, EvalValue};
use gpir::passes::legalize;
use gpir::platform::{PassFlags, PlatformCaps};
use gpir::scalar;
use gpir::{
    AttrSet, BinOp, Context, FuncDefBody, FuncParam, IcmpPred, InstKind, Type, TypeDef, Value,
};
use proptest::prelude::*;

fn new_func(cx: &Context, params: &[Type]) -> FuncDefBody {
    let mut func = FuncDefBody::new(cx);
    for &ty in params {
        func.params.push(FuncParam { attrs: AttrSet::default(), ty });
    }
    func
}

fn caps_with_max(max_legal_int_width: u32) -> PlatformCaps {
    PlatformCaps { max_legal_int_width, ..Default::default() }
}

fn run_legalize(cx: &Context, func: &mut FuncDefBody, caps: &PlatformCaps) -> bool {
    legalize::run(cx, func, caps, &PassFlags::default())
}

fn param(idx: u32) -> Value {
    Value::FuncParam { idx }
}

fn width_mask(w: u32) -> u128 {
    if w == 128 { !0 } else { (1u128 << w) - 1 }
}

/// `fn(a: iW, b: iW) -> iW { a <op> b }`
fn binop_func(cx: &Context, w: u32, op: BinOp) -> FuncDefBody {
    let ty = cx.type_int(w);
    let mut func = new_func(cx, &[ty, ty]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(cx, &mut func, entry);
    let r = bld.binop(op, param(0), param(1));
    bld.ret(Some(r));
    func
}

/// No binary/select/phi result, and no compare operand, is left at an
/// integer width the platform cannot operate on (casts are exempt; they are
/// the currency legalized code is written in).
fn assert_no_illegal_compute(cx: &Context, func: &FuncDefBody, caps: &PlatformCaps) {
    let scalar_ok = |s: scalar::Type| match s {
        scalar::Type::Int(w) => caps.is_legal_int_width(w.bits()),
        _ => true,
    };
    let ty_ok = |ty| match &cx[ty] {
        TypeDef::Scalar(s) => scalar_ok(*s),
        TypeDef::Vector { elem, .. } => scalar_ok(*elem),
        _ => true,
    };
    for &block in &func.block_order {
        for &inst in &func.blocks[block].insts {
            let def = &func.insts[inst];
            match def.kind {
                InstKind::Binary(_) | InstKind::Select | InstKind::Phi { .. } => {
                    assert!(ty_ok(def.ty), "illegal-width compute survived legalization");
                }
                InstKind::ICmp(_) => {
                    let operand_ty = func.value_type(cx, def.operands[0]);
                    assert!(ty_ok(operand_ty), "illegal-width compare survived legalization");
                }
                _ => {}
            }
        }
    }
}

fn eval2(cx: &Context, func: &FuncDefBody, ty: Type, a: u128, b: u128) -> u128 {
    let args = vec![EvalValue::scalar(ty, a), EvalValue::scalar(ty, b)];
    eval_func(cx, func, args).0.unwrap().as_scalar_bits()
}

const WIDTHS: [u32; 10] = [5, 7, 9, 13, 17, 24, 33, 48, 65, 70];

proptest! {
    #[test]
    fn promoted_binops_match_reference(
        w in proptest::sample::select(WIDTHS.to_vec()),
        op in proptest::sample::select(
            vec![BinOp::Add, BinOp::Sub, BinOp::And, BinOp::Or, BinOp::Xor],
        ),
        max_legal in proptest::sample::select(vec![32u32, 64]),
        a in any::<u128>(),
        b in any::<u128>(),
    ) {
        let caps = caps_with_max(max_legal);
        let cx = Context::new();
        let ty = cx.type_int(w);
        let mut func = binop_func(&cx, w, op);

        prop_assert!(run_legalize(&cx, &mut func, &caps));
        func.assert_valid(&cx);
        assert_no_illegal_compute(&cx, &func, &caps);

        let (a, b) = (a & width_mask(w), b & width_mask(w));
        let swt = scalar::Type::int(w);
        let expected = scalar::Const::int_binop(
            op,
            scalar::Const::from_bits(swt, a),
            scalar::Const::from_bits(swt, b),
        )
        .unwrap()
        .bits();
        prop_assert_eq!(eval2(&cx, &func, ty, a, b), expected);
    }

    #[test]
    fn promoted_mul_matches_reference(
        w in proptest::sample::select(vec![5u32, 9, 17, 24, 33, 48]),
        max_legal in proptest::sample::select(vec![32u32, 64]),
        a in any::<u128>(),
        b in any::<u128>(),
    ) {
        let caps = caps_with_max(max_legal);
        let cx = Context::new();
        let ty = cx.type_int(w);
        let mut func = binop_func(&cx, w, BinOp::Mul);

        prop_assert!(run_legalize(&cx, &mut func, &caps));
        func.assert_valid(&cx);
        assert_no_illegal_compute(&cx, &func, &caps);

        let (a, b) = (a & width_mask(w), b & width_mask(w));
        let swt = scalar::Type::int(w);
        let expected = scalar::Const::int_binop(
            BinOp::Mul,
            scalar::Const::from_bits(swt, a),
            scalar::Const::from_bits(swt, b),
        )
        .unwrap()
        .bits();
        prop_assert_eq!(eval2(&cx, &func, ty, a, b), expected);
    }

    #[test]
    fn promoted_lshr_by_const_matches_reference(
        (w, k) in proptest::sample::select(WIDTHS.to_vec()).prop_flat_map(|w| (Just(w), 0..w)),
        max_legal in proptest::sample::select(vec![32u32, 64]),
        a in any::<u128>(),
    ) {
        let caps = caps_with_max(max_legal);
        let cx = Context::new();
        let ty = cx.type_int(w);
        let mut func = new_func(&cx, &[ty]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let amt = bld.const_int(scalar::Type::int(w), k as u128);
        let r = bld.binop(BinOp::LShr, param(0), amt);
        bld.ret(Some(r));

        prop_assert!(run_legalize(&cx, &mut func, &caps));
        func.assert_valid(&cx);
        assert_no_illegal_compute(&cx, &func, &caps);

        let a = a & width_mask(w);
        let got = eval_func(&cx, &func, vec![EvalValue::scalar(ty, a)])
            .0
            .unwrap()
            .as_scalar_bits();
        prop_assert_eq!(got, a >> k);
    }

    #[test]
    fn promoted_icmp_matches_reference(
        w in proptest::sample::select(WIDTHS.to_vec()),
        pred in proptest::sample::select(vec![
            IcmpPred::Eq, IcmpPred::Ne,
            IcmpPred::Ult, IcmpPred::Ule, IcmpPred::Ugt, IcmpPred::Uge,
            IcmpPred::Slt, IcmpPred::Sle, IcmpPred::Sgt, IcmpPred::Sge,
        ]),
        max_legal in proptest::sample::select(vec![32u32, 64]),
        a in any::<u128>(),
        b in any::<u128>(),
    ) {
        let caps = caps_with_max(max_legal);
        let cx = Context::new();
        let ty = cx.type_int(w);
        let mut func = new_func(&cx, &[ty, ty]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let r = bld.icmp(pred, param(0), param(1));
        bld.ret(Some(r));

        prop_assert!(run_legalize(&cx, &mut func, &caps));
        func.assert_valid(&cx);
        assert_no_illegal_compute(&cx, &func, &caps);

        let (a, b) = (a & width_mask(w), b & width_mask(w));
        let swt = scalar::Type::int(w);
        let expected = scalar::Const::int_icmp(
            pred,
            scalar::Const::from_bits(swt, a),
            scalar::Const::from_bits(swt, b),
        )
        .unwrap();
        prop_assert_eq!(eval2(&cx, &func, ty, a, b), expected as u128);
    }
}

#[test]
fn select_promotes_at_both_lane_counts() {
    for (w, max_legal) in [(17u32, 32u32), (48, 32), (70, 64)] {
        let caps = caps_with_max(max_legal);
        let cx = Context::new();
        let boolt = cx.type_bool();
        let ty = cx.type_int(w);
        let mut func = new_func(&cx, &[boolt, ty, ty]);
        let entry = func.entry_block();
        let mut bld = Builder::at_end(&cx, &mut func, entry);
        let sel = bld.select(param(0), param(1), param(2));
        bld.ret(Some(sel));

        assert!(run_legalize(&cx, &mut func, &caps));
        func.assert_valid(&cx);
        assert_no_illegal_compute(&cx, &func, &caps);

        let (a, b) = (width_mask(w) - 3, 5u128);
        for cond in [true, false] {
            let args = vec![
                EvalValue::scalar(boolt, cond as u128),
                EvalValue::scalar(ty, a),
                EvalValue::scalar(ty, b),
            ];
            let got = eval_func(&cx, &func, args).0.unwrap().as_scalar_bits();
            assert_eq!(got, if cond { a } else { b });
        }
        assert!(!run_legalize(&cx, &mut func, &caps));
    }
}

#[test]
fn phi_promotes_across_a_diamond() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let boolt = cx.type_bool();
    let ty = cx.type_int(48);
    let mut func = new_func(&cx, &[boolt, ty, ty]);
    let entry = func.entry_block();
    let left = func.add_block(&cx);
    let right = func.add_block(&cx);
    let join = func.add_block(&cx);

    Builder::at_end(&cx, &mut func, entry).cond_br(param(0), left, right);
    Builder::at_end(&cx, &mut func, left).br(join);
    Builder::at_end(&cx, &mut func, right).br(join);
    let mut bld = Builder::at_end(&cx, &mut func, join);
    let merged = bld.phi(ty, &[(param(1), left), (param(2), right)]);
    bld.ret(Some(merged));

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    assert_no_illegal_compute(&cx, &func, &caps);

    let (a, b) = (0xABCD_1234_5678u128, 0x0FFF_0000_0001u128);
    for cond in [true, false] {
        let args = vec![
            EvalValue::scalar(boolt, cond as u128),
            EvalValue::scalar(ty, a),
            EvalValue::scalar(ty, b),
        ];
        let got = eval_func(&cx, &func, args).0.unwrap().as_scalar_bits();
        assert_eq!(got, if cond { a } else { b });
    }
    assert!(!run_legalize(&cx, &mut func, &caps));
}

#[test]
fn extract_of_wide_elements_splits_into_lanes() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let vec_ty = cx.type_vector(scalar::Type::I64, 2);
    let mut func = new_func(&cx, &[vec_ty]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let idx = bld.const_int(scalar::Type::I32, 1);
    let e = bld.extract(param(0), idx);
    bld.ret(Some(e));

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    assert_no_illegal_compute(&cx, &func, &caps);

    let lanes = [0x1111_2222_3333_4444u128, 0xAAAA_BBBB_CCCC_DDDDu128];
    let arg = EvalValue::Bits { ty: vec_ty, lanes: lanes.into_iter().collect() };
    let got = eval_func(&cx, &func, vec![arg]).0.unwrap().as_scalar_bits();
    assert_eq!(got, lanes[1]);
}

#[test]
fn zext_of_illegal_trunc_becomes_mask() {
    let caps = caps_with_max(64);
    let cx = Context::new();
    let i64t = cx.type_int(64);
    let i40t = cx.type_int(40);
    let mut func = new_func(&cx, &[i64t]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let t = bld.trunc(i40t, param(0));
    let z = bld.zext(i64t, t);
    bld.ret(Some(z));

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    // The illegal intermediate is gone entirely; what remains is one mask.
    for &block in &func.block_order {
        for &inst in &func.blocks[block].insts {
            assert!(!matches!(func.insts[inst].kind, InstKind::Cast(_)));
        }
    }
    let x = 0xFFEE_DDCC_BBAA_9988u128;
    let got = eval_func(&cx, &func, vec![EvalValue::scalar(i64t, x)])
        .0
        .unwrap()
        .as_scalar_bits();
    assert_eq!(got, x & width_mask(40));
    assert!(!run_legalize(&cx, &mut func, &caps));
}

#[test]
fn sext_of_illegal_trunc_becomes_shift_pair() {
    let caps = caps_with_max(64);
    let cx = Context::new();
    let i64t = cx.type_int(64);
    let i40t = cx.type_int(40);
    let mut func = new_func(&cx, &[i64t]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let t = bld.trunc(i40t, param(0));
    let s = bld.sext(i64t, t);
    bld.ret(Some(s));

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    assert_no_illegal_compute(&cx, &func, &caps);

    for x in [0u128, 1, 0x80_0000_0000, 0xFF_FFFF_FFFF, 0x1234_5678_9ABC_DEF0] {
        let got = eval_func(&cx, &func, vec![EvalValue::scalar(i64t, x)])
            .0
            .unwrap()
            .as_scalar_bits();
        let trunc40 = x & width_mask(40);
        let sign_extended = if trunc40 & (1 << 39) != 0 {
            trunc40 | (width_mask(64) ^ width_mask(40))
        } else {
            trunc40
        };
        assert_eq!(got, sign_extended);
    }
}

#[test]
fn bool_vector_bitcast_lowers_to_select_or() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let boolt = cx.type_bool();
    let vec_ty = cx.type_vector(scalar::Type::Bool, 4);
    let i4t = cx.type_int(4);
    let mut func = new_func(&cx, &[boolt; 4]);
    let entry = func.entry_block();
    let mut bld = Builder::at_end(&cx, &mut func, entry);
    let mut vec = bld.undef(vec_ty);
    for i in 0..4u32 {
        let idx = bld.const_int(scalar::Type::I32, i as u128);
        vec = bld.insert_elem(vec, param(i), idx);
    }
    let packed = bld.bitcast(i4t, vec);
    bld.ret(Some(packed));

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    for &block in &func.block_order {
        for &inst in &func.blocks[block].insts {
            assert!(!matches!(
                func.insts[inst].kind,
                InstKind::InsertElement | InstKind::Cast(_)
            ));
        }
    }

    for bits in 0u32..16 {
        let args = (0..4)
            .map(|i| EvalValue::scalar(boolt, ((bits >> i) & 1) as u128))
            .collect();
        let got = eval_func(&cx, &func, args).0.unwrap().as_scalar_bits();
        assert_eq!(got, bits as u128);
    }
}

#[test]
fn mul_i70_splits_into_two_64bit_lanes() {
    let caps = caps_with_max(64);
    let cx = Context::new();
    let ty = cx.type_int(70);
    let mut func = binop_func(&cx, 70, BinOp::Mul);

    assert!(run_legalize(&cx, &mut func, &caps));
    func.assert_valid(&cx);
    assert_no_illegal_compute(&cx, &func, &caps);

    let swt = scalar::Type::int(70);
    for (a, b) in [
        (3u128, 5u128),
        (width_mask(70), width_mask(70)),
        (0x3_FFFF_FFFF_FFFF_FFFF, 0x1234_5678),
    ] {
        let expected = scalar::Const::int_binop(
            BinOp::Mul,
            scalar::Const::from_bits(swt, a),
            scalar::Const::from_bits(swt, b),
        )
        .unwrap()
        .bits();
        assert_eq!(eval2(&cx, &func, ty, a, b), expected);
    }
}

#[test]
#[should_panic(expected = "Mul legalization for width 70")]
fn mul_over_two_lanes_panics() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let mut func = binop_func(&cx, 70, BinOp::Mul);
    run_legalize(&cx, &mut func, &caps);
}

#[test]
#[should_panic(expected = "Shl legalization for width 48 not supported")]
fn multi_lane_shl_panics() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let mut func = binop_func(&cx, 48, BinOp::Shl);
    run_legalize(&cx, &mut func, &caps);
}

#[test]
#[should_panic(expected = "non-constant shift amount")]
fn multi_lane_lshr_by_dynamic_amount_panics() {
    let caps = caps_with_max(32);
    let cx = Context::new();
    let mut func = binop_func(&cx, 48, BinOp::LShr);
    run_legalize(&cx, &mut func, &caps);
}
