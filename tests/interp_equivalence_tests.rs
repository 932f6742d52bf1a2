//! Optimized traces compute what the traces they came from compute

mod common;
use common::{optimize, run_ints, LINEAR};
use pretty_assertions::assert_eq;
use tracejit::ir::interp::{Interpreter, Object, Outcome};
use tracejit::ir::{parse, Const, Opcode};
use tracejit::Namespace;

const COUNTING: &str = "
    [i0, i1]
    i2 = int_mul(i1, 3)
    i3 = int_add(i0, i2)
    i4 = int_lt(i3, 1000)
    guard_true(i4) [i3, i1]
    jump(i3, i1)";

fn assert_same_outcome(text: &str, passes: &str, inputs: &[i64]) -> Outcome {
    let (original, _) = parse(text).unwrap();
    let (optimized, _) = optimize(text, passes);
    let want = run_ints(&original, inputs, 10_000);
    let got = run_ints(&optimized, inputs, 10_000);
    assert_eq!(want, got);
    got
}

#[test]
fn test_counting_loop_linear() {
    let outcome = assert_same_outcome(COUNTING, LINEAR, &[0, 2]);
    assert_eq!(
        outcome,
        Outcome::GuardFailed {
            guard: Opcode::GuardTrue,
            values: vec![Const::Int(1002), Const::Int(2)],
        }
    );
}

#[test]
fn test_counting_loop_peeled() {
    assert_same_outcome(COUNTING, "all", &[0, 2]);
    assert_same_outcome(COUNTING, "all", &[995, 7]);
}

#[test]
fn test_guard_failing_in_preamble() {
    // the very first comparison already fails
    assert_same_outcome(COUNTING, "all", &[2000, 1]);
}

#[test]
fn test_overflow_checked_counter() {
    let text = "
        [i0]
        i1 = int_lt(i0, 100)
        guard_true(i1) [i0]
        i2 = int_add_ovf(i0, 1)
        guard_no_overflow() [i0]
        jump(i2)";
    for passes in [LINEAR, "all"] {
        let outcome = assert_same_outcome(text, passes, &[3]);
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                guard: Opcode::GuardTrue,
                values: vec![Const::Int(100)],
            }
        );
    }
}

#[test]
fn test_wrapping_arithmetic_at_the_extremes() {
    let cases = [
        (
            "[i0]
            i1 = int_ge(i0, 0)
            guard_true(i1) [i0]
            i2 = int_add(i0, 1)
            i3 = int_gt(i2, 0)
            guard_true(i3) [i2]
            finish(i2)",
            i64::MAX,
        ),
        (
            "[i0]
            i1 = int_le(i0, 0)
            guard_true(i1) [i0]
            i2 = int_sub(i0, 1)
            i3 = int_lt(i2, 0)
            guard_true(i3) [i2]
            finish(i2)",
            i64::MIN,
        ),
        (
            "[i0]
            i1 = int_le(i0, 0)
            guard_true(i1) [i0]
            i2 = int_neg(i0)
            i3 = int_ge(i2, 0)
            guard_true(i3) [i2]
            finish(i2)",
            i64::MIN,
        ),
    ];
    for (text, input) in cases {
        for passes in [LINEAR, "all"] {
            let outcome = assert_same_outcome(text, passes, &[input]);
            assert!(matches!(outcome, Outcome::GuardFailed { .. }), "{:?}", outcome);
        }
    }
}

#[test]
fn test_budget_exhausted_at_jump() {
    let text = "
        [i0, i1]
        i2 = int_add(i0, i1)
        jump(i2, i1)";
    let (optimized, _) = optimize(text, "all");
    // the preamble's jump counts as one iteration
    assert_eq!(run_ints(&optimized, &[0, 5], 4), Outcome::Jumped(vec![Const::Int(25), Const::Int(5)]));
}

fn node_run(text: &str, passes: Option<&str>, start: i64) -> (Outcome, Interpreter, Namespace) {
    let (trace, ns) = match passes {
        Some(passes) => optimize(text, passes),
        None => parse(text).unwrap(),
    };
    let value = ns.descr("valuedescr").unwrap();
    let mut interp = Interpreter::new();
    let mut fields = rustc_hash::FxHashMap::default();
    fields.insert(value, Const::Int(start));
    let node = interp.alloc(Object::Struct { class: None, fields });
    let outcome = interp.run(&trace, &[node], 1_000).unwrap();
    (outcome, interp, ns)
}

#[test]
fn test_virtual_rebuilt_when_guard_fails() {
    let text = "
        descr nodesize = size()
        descr valuedescr = field(node, int)
        [p0]
        i1 = getfield_gc(p0, descr=valuedescr)
        i2 = int_add(i1, 1)
        i3 = int_lt(i2, 50)
        guard_true(i3) [p0, i2]
        p4 = new(descr=nodesize)
        setfield_gc(p4, i2, descr=valuedescr)
        jump(p4)";
    let mut expected = None;
    for passes in [None, Some(LINEAR), Some("all")] {
        let (outcome, interp, ns) = node_run(text, passes, 10);
        let Outcome::GuardFailed { values, .. } = outcome else {
            panic!("expected a guard failure, got {:?}", outcome);
        };
        let value = ns.descr("valuedescr").unwrap();
        let observed = (interp.field(values[0], &value).unwrap(), values[1]);
        assert_eq!(observed, (Const::Int(49), Const::Int(50)));
        match &expected {
            None => expected = Some(observed),
            Some(e) => assert_eq!(e, &observed),
        }
    }
}

#[test]
fn test_pending_store_replayed_on_guard_failure() {
    let text = "
        descr valuedescr = field(node, int)
        [p0]
        i1 = getfield_gc(p0, descr=valuedescr)
        i2 = int_add(i1, 1)
        setfield_gc(p0, i2, descr=valuedescr)
        i3 = int_lt(i2, 20)
        guard_true(i3) [p0]
        jump(p0)";
    for passes in [None, Some(LINEAR), Some("all")] {
        let (outcome, interp, ns) = node_run(text, passes, 0);
        let Outcome::GuardFailed { values, .. } = outcome else {
            panic!("expected a guard failure, got {:?}", outcome);
        };
        let value = ns.descr("valuedescr").unwrap();
        assert_eq!(interp.field(values[0], &value).unwrap(), Const::Int(20));
    }
}
