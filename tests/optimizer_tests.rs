//! Integration tests for the trace optimizer

mod common;
use common::{assert_equiv, assert_optimized, count, opcodes, optimize, optimize_bridge_into, LINEAR};
use tracejit::ir::{parse, Opcode};
use tracejit::{equivalent, optimize_loop, parse_with, ErrorKind, OptimizerConfig, Policy};

const NODE: &str = "
descr nodesize = size()
descr valuedescr = field(node, int)
descr otherdescr = field(node, int)
descr nextdescr = field(node, ptr)
descr arraydescr = array(int)
descr escape = call(void, effect=random)
";

fn with_node(body: &str) -> String {
    format!("{}{}", NODE, body)
}

mod equality {
    use super::*;

    const ADDS: &str = "
        [i0]
        i1 = int_add(i0, 1)
        i2 = int_add(i1, 1)
        guard_true(i1) [i2]
        jump(i1)";

    #[test]
    fn test_non_constant_adds_survive_in_order() {
        assert_optimized(
            ADDS,
            "intbounds:pure",
            "[i0]
            i1 = int_add(i0, 1)
            i2 = int_add(i1, 1)
            guard_true(i1) [i2]
            jump(i1)",
        );
    }

    #[test]
    fn test_changed_opcode_is_a_mismatch() {
        let (trace, mut ns) = optimize(ADDS, "intbounds:pure");
        let expected = parse_with(
            "[i0]
            i1 = int_add(i0, 1)
            i2 = int_sub(i1, 1)
            guard_true(i1) [i2]
            jump(i1)",
            &mut ns,
        )
        .unwrap();
        let mismatch = equivalent(&expected, &trace).unwrap_err();
        assert_eq!(mismatch.index, 1);
    }

    #[test]
    fn test_swapped_operands_are_a_mismatch() {
        let (trace, mut ns) = optimize(ADDS, "intbounds:pure");
        let expected = parse_with(
            "[i0]
            i1 = int_add(1, i0)
            i2 = int_add(i1, 1)
            guard_true(i1) [i2]
            jump(i1)",
            &mut ns,
        )
        .unwrap();
        assert!(equivalent(&expected, &trace).is_err());
    }
}

mod bounds {
    use super::*;

    #[test]
    fn test_implied_comparison_is_folded() {
        assert_optimized(
            "[i0]
            i1 = int_lt(i0, 10)
            guard_true(i1) []
            i2 = int_lt(i0, 20)
            guard_true(i2) []
            jump(i0)",
            "intbounds:rewrite:pure",
            "[i0]
            i1 = int_lt(i0, 10)
            guard_true(i1) []
            jump(i0)",
        );
    }

    #[test]
    fn test_bounded_add_drops_overflow_check() {
        assert_optimized(
            "[i0]
            i1 = int_lt(i0, 10)
            guard_true(i1) []
            i2 = int_add_ovf(i0, 1)
            guard_no_overflow() []
            jump(i2)",
            "intbounds:rewrite:pure",
            "[i0]
            i1 = int_lt(i0, 10)
            guard_true(i1) []
            i2 = int_add(i0, 1)
            jump(i2)",
        );
    }

    #[test]
    fn test_guard_on_constant_condition_is_invalid() {
        let (mut trace, _) = parse(
            "[i0]
            guard_false(1) []
            jump(i0)",
        )
        .unwrap();
        let err = optimize_loop(&mut trace, &OptimizerConfig::with_passes(LINEAR)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLoop);
    }
}

mod virtuals {
    use super::*;

    #[test]
    fn test_unescaped_struct_vanishes() {
        assert_optimized(
            &with_node(
                "[i0, i1]
                p2 = new(descr=nodesize)
                setfield_gc(p2, i0, descr=valuedescr)
                setfield_gc(p2, i1, descr=otherdescr)
                jump(i0, i1)",
            ),
            "virtualize",
            "[i0, i1]
            jump(i0, i1)",
        );
    }

    #[test]
    fn test_field_reads_of_virtual_are_forwarded() {
        assert_optimized(
            &with_node(
                "[i0]
                p1 = new(descr=nodesize)
                setfield_gc(p1, i0, descr=valuedescr)
                i2 = getfield_gc(p1, descr=valuedescr)
                i3 = int_add(i2, 1)
                jump(i3)",
            ),
            LINEAR,
            "[i0]
            i1 = int_add(i0, 1)
            jump(i1)",
        );
    }

    #[test]
    fn test_escaping_struct_is_allocated_once() {
        let (trace, _) = optimize(
            &with_node(
                "[i0]
                p1 = new(descr=nodesize)
                setfield_gc(p1, i0, descr=valuedescr)
                call(1, p1, descr=escape)
                jump(i0)",
            ),
            LINEAR,
        );
        assert_eq!(
            opcodes(&trace.ops),
            vec![Opcode::New, Opcode::SetfieldGc, Opcode::Call, Opcode::Jump]
        );
    }

    #[test]
    fn test_virtual_carried_around_loop_is_never_allocated() {
        let (trace, _) = optimize(
            &with_node(
                "[p0]
                i1 = getfield_gc(p0, descr=valuedescr)
                i2 = int_add(i1, 1)
                p3 = new(descr=nodesize)
                setfield_gc(p3, i2, descr=valuedescr)
                jump(p3)",
            ),
            "all",
        );
        let preamble = trace.preamble.as_ref().unwrap();
        assert_eq!(count(&preamble.ops, Opcode::New), 0);
        assert_eq!(count(&trace.ops, Opcode::New), 0);
        assert_eq!(count(&trace.ops, Opcode::GetfieldGc), 0);
        // the virtual's one field is all the loop carries
        assert_eq!(trace.inputargs.len(), 1);
    }
}

mod heap {
    use super::*;

    #[test]
    fn test_repeated_read_and_forwarded_store() {
        assert_optimized(
            &with_node(
                "[p0, i1]
                i2 = getfield_gc(p0, descr=valuedescr)
                i3 = getfield_gc(p0, descr=valuedescr)
                setfield_gc(p0, i1, descr=otherdescr)
                i4 = getfield_gc(p0, descr=otherdescr)
                i5 = int_add(i3, i4)
                jump(p0, i5)",
            ),
            LINEAR,
            "[p0, i1]
            i2 = getfield_gc(p0, descr=valuedescr)
            i5 = int_add(i2, i1)
            setfield_gc(p0, i1, descr=otherdescr)
            jump(p0, i5)",
        );
    }

    #[test]
    fn test_initializing_store_keeps_other_arrays_cached() {
        assert_optimized(
            &with_node(
                "[p0, i1, i2]
                i3 = getarrayitem_gc(p0, 0, descr=arraydescr)
                p4 = new_array(10, descr=arraydescr)
                setarrayitem_gc(p4, i1, i2, descr=arraydescr)
                i5 = getarrayitem_gc(p0, 0, descr=arraydescr)
                jump(p0, i1, i5)",
            ),
            LINEAR,
            "[p0, i1, i2]
            i3 = getarrayitem_gc(p0, 0, descr=arraydescr)
            p4 = new_array(10, descr=arraydescr)
            setarrayitem_gc(p4, i1, i2, descr=arraydescr)
            jump(p0, i1, i3)",
        );
    }

    #[test]
    fn test_store_into_escaped_array_invalidates() {
        let (trace, _) = optimize(
            &with_node(
                "[p0, p1, i2, i3]
                i4 = getarrayitem_gc(p0, 0, descr=arraydescr)
                setarrayitem_gc(p1, i2, i3, descr=arraydescr)
                i5 = getarrayitem_gc(p0, 0, descr=arraydescr)
                jump(p0, p1, i4, i5)",
            ),
            LINEAR,
        );
        assert_eq!(count(&trace.ops, Opcode::GetarrayitemGc), 2);
    }

    #[test]
    fn test_call_drops_cached_fields() {
        let (trace, _) = optimize(
            &with_node(
                "[p0]
                i1 = getfield_gc(p0, descr=valuedescr)
                call(1, descr=escape)
                i2 = getfield_gc(p0, descr=valuedescr)
                jump(p0)",
            ),
            LINEAR,
        );
        assert_eq!(count(&trace.ops, Opcode::GetfieldGc), 2);
    }
}

mod strings {
    use super::*;
    use tracejit::ir::interp::{Interpreter, Outcome};
    use tracejit::ir::{BoxKind, Const, Descr, OopSpec, Operand};
    use tracejit::Trace;

    const STR: &str = "
        descr strconcat = call(ptr, effect=elidable, oopspec=str_concat)
        descr strslice = call(ptr, effect=elidable, oopspec=str_slice)
        descr strequal = call(int, effect=elidable, oopspec=str_equal)
        ";

    fn with_str(body: &str) -> String {
        format!("{}{}", STR, body)
    }

    /// Run `trace`, feeding strings to pointer inputs and integers to the rest
    fn run_on(trace: &Trace, strings: &[&str], ints: &[i64]) -> Outcome {
        let mut interp = Interpreter::new();
        let (mut strings, mut ints) = (strings.iter(), ints.iter());
        let inputs: Vec<Const> = trace
            .inputargs
            .iter()
            .map(|b| match b.kind {
                BoxKind::Ptr => interp.alloc_str(strings.next().unwrap()),
                _ => Const::Int(*ints.next().unwrap()),
            })
            .collect();
        interp.run(trace, &inputs, 10).unwrap()
    }

    /// Optimize `text` and check both versions agree on every input set
    fn optimize_agreeing(text: &str, inputs: &[(&[&str], &[i64], i64)]) -> Trace {
        let (original, _) = parse(text).unwrap();
        let (optimized, _) = optimize(text, LINEAR);
        for (strings, ints, want) in inputs {
            let outcome = run_on(&original, strings, ints);
            assert_eq!(outcome, Outcome::Finished(vec![Const::Int(*want)]));
            assert_eq!(run_on(&optimized, strings, ints), outcome, "{}", optimized);
        }
        optimized
    }

    fn helper_calls(trace: &Trace, helper: OopSpec) -> usize {
        let descr = Descr::helper(helper);
        trace
            .ops
            .iter()
            .filter(|op| op.opcode == Opcode::Call && op.descr.as_ref() == Some(&descr))
            .count()
    }

    #[test]
    fn test_character_of_virtual_string_is_forwarded() {
        assert_optimized(
            "[i0]
            p1 = newstr(1)
            strsetitem(p1, 0, i0)
            i2 = strgetitem(p1, 0)
            jump(i2)",
            LINEAR,
            "[i0]
            jump(i0)",
        );
    }

    #[test]
    fn test_length_of_virtual_string_is_constant() {
        assert_optimized(
            "[i0]
            p1 = newstr(3)
            i2 = strlen(p1)
            i3 = int_add(i0, i2)
            jump(i3)",
            LINEAR,
            "[i0]
            i1 = int_add(i0, 3)
            jump(i1)",
        );
    }

    #[test]
    fn test_concat_length_and_characters_are_known() {
        let text = with_str(
            "[i0, i1]
            p2 = newstr(1)
            strsetitem(p2, 0, i0)
            p3 = newstr(2)
            strsetitem(p3, 0, 120)
            strsetitem(p3, 1, i1)
            p4 = call(1, p2, p3, descr=strconcat)
            i5 = strlen(p4)
            i6 = strgetitem(p4, 2)
            i7 = strgetitem(p4, 0)
            i8 = int_add(i5, i6)
            i9 = int_add(i8, i7)
            finish(i9)",
        );
        let trace = optimize_agreeing(&text, &[(&[], &[5, 7], 15)]);
        for opcode in [Opcode::Newstr, Opcode::Call, Opcode::Strlen, Opcode::Strgetitem] {
            assert_eq!(count(&trace.ops, opcode), 0, "{}", trace);
        }
    }

    #[test]
    fn test_slice_of_slice_reads_the_base_string() {
        let text = with_str(
            "[p0, i1]
            p2 = call(1, p0, 1, 5, descr=strslice)
            p3 = call(1, p2, 1, 3, descr=strslice)
            i4 = strlen(p3)
            i5 = strgetitem(p3, i1)
            i6 = int_add(i4, i5)
            finish(i6)",
        );
        // "abcdefg"[1:5][1:3] is "cd"
        let trace = optimize_agreeing(
            &text,
            &[(&["abcdefg"], &[1], 2 + 'd' as i64), (&["abcdefg"], &[0], 2 + 'c' as i64)],
        );
        assert_eq!(count(&trace.ops, Opcode::Call), 0, "{}", trace);
        assert_eq!(count(&trace.ops, Opcode::Strlen), 0, "{}", trace);
        let read = trace.ops.iter().find(|op| op.opcode == Opcode::Strgetitem).unwrap();
        assert_eq!(read.args[0], Operand::Box(trace.inputargs[0]));
    }

    #[test]
    fn test_slice_equal_to_one_char_uses_slice_char_helper() {
        let text = with_str(
            "[p0, i1, i2, i3]
            p4 = call(1, p0, i1, i2, descr=strslice)
            p5 = newstr(1)
            strsetitem(p5, 0, i3)
            i6 = call(1, p4, p5, descr=strequal)
            finish(i6)",
        );
        let trace = optimize_agreeing(
            &text,
            &[
                (&["hello"], &[1, 2, 'e' as i64], 1),
                (&["hello"], &[1, 2, 'x' as i64], 0),
                (&["hello"], &[1, 3, 'e' as i64], 0),
            ],
        );
        assert_eq!(helper_calls(&trace, OopSpec::StreqSliceChar), 1, "{}", trace);
        assert_eq!(count(&trace.ops, Opcode::Newstr), 0, "{}", trace);
    }

    #[test]
    fn test_string_equal_to_one_char_checks_nullness_only_when_unknown() {
        let body = "
            p2 = newstr(1)
            strsetitem(p2, 0, i1)
            i3 = call(1, p0, p2, descr=strequal)
            finish(i3)";
        let cases: &[(&[&str], &[i64], i64)] = &[(&["a"], &['a' as i64], 1), (&["ab"], &['a' as i64], 0)];

        let unknown = optimize_agreeing(&with_str(&format!("[p0, i1]{}", body)), cases);
        assert_eq!(helper_calls(&unknown, OopSpec::StreqChecknullChar), 1, "{}", unknown);

        let nonnull = optimize_agreeing(&with_str(&format!("[p0, i1]\nguard_nonnull(p0) []{}", body)), cases);
        assert_eq!(helper_calls(&nonnull, OopSpec::StreqNonnullChar), 1, "{}", nonnull);
    }

    #[test]
    fn test_equality_of_nonnull_strings_uses_nonnull_helper() {
        let text = with_str(
            "[p0, p1]
            guard_nonnull(p0) []
            guard_nonnull(p1) []
            i2 = call(1, p0, p1, descr=strequal)
            finish(i2)",
        );
        let trace = optimize_agreeing(&text, &[(&["abc", "abc"], &[], 1), (&["abc", "abd"], &[], 0)]);
        assert_eq!(helper_calls(&trace, OopSpec::StreqNonnull), 1, "{}", trace);
        assert_eq!(
            opcodes(&trace.ops),
            vec![Opcode::GuardNonnull, Opcode::GuardNonnull, Opcode::Call, Opcode::Finish]
        );
    }
}

mod unroll {
    use super::*;

    #[test]
    fn test_invariant_read_moves_out_of_the_loop() {
        let (trace, _) = optimize(
            &with_node(
                "[p0, i1]
                i2 = getfield_gc(p0, descr=valuedescr)
                i3 = int_add(i1, i2)
                jump(p0, i3)",
            ),
            "all",
        );
        let preamble = trace.preamble.as_ref().unwrap();
        assert_eq!(count(&preamble.ops, Opcode::GetfieldGc), 1);
        assert_eq!(opcodes(&trace.ops), vec![Opcode::Label, Opcode::IntAdd, Opcode::Jump]);

        let token = trace.token.as_ref().unwrap();
        assert_eq!(token.short_preambles.len(), 1);
        let sp = &token.short_preambles[0];
        assert_eq!(count(&sp.ops, Opcode::GetfieldGc), 1);
        assert_eq!(sp.jump_args.len(), trace.inputargs.len());
    }

    #[test]
    fn test_finish_ending_trace_is_not_peeled() {
        let (trace, _) = optimize(
            "[i0]
            i1 = int_add(i0, 1)
            finish(i1)",
            "all",
        );
        assert!(trace.preamble.is_none());
        assert_eq!(opcodes(&trace.ops), vec![Opcode::IntAdd, Opcode::Finish]);
    }

    #[test]
    fn test_loop_token_names_both_entries() {
        let (trace, _) = optimize(
            "descr outer = target()
            [i0]
            i1 = int_add(i0, 1)
            jump(i1, descr=outer)",
            "all",
        );
        let token = trace.token.as_ref().unwrap();
        assert_eq!(token.name, "outer");
        assert_eq!(token.preamble_target.name(), "outer_preamble");
        assert_eq!(trace.ops[0].descr.as_ref(), Some(&token.target));
    }
}

mod bridges {
    use super::*;

    const COUNTER: &str = "
        descr loop = target()
        [i0, i1]
        i2 = int_mul(i1, 3)
        i3 = int_add(i0, i2)
        jump(i3, i1, descr=loop)";

    const VIRTUAL_LOOP: &str = "
        [p0]
        i1 = getfield_gc(p0, descr=valuedescr)
        i2 = int_add(i1, 1)
        p3 = new(descr=nodesize)
        setfield_gc(p3, i2, descr=valuedescr)
        jump(p3, descr=loop)";

    fn virtual_loop() -> (tracejit::Trace, tracejit::Namespace) {
        optimize(&with_node(&format!("descr loop = target(){}", VIRTUAL_LOOP)), "all")
    }

    #[test]
    fn test_short_preamble_is_inlined() {
        let (looped, mut ns) = optimize(COUNTER, "all");
        let bridge = optimize_bridge_into(
            &looped,
            &mut ns,
            "[i0]
            i1 = int_add(i0, 1)
            jump(i1, 7, descr=loop)",
            &OptimizerConfig::default(),
        )
        .unwrap();
        assert_equiv(
            &bridge,
            &mut ns,
            "[i0]
            i1 = int_add(i0, 1)
            jump(i1, 7, 21)",
        );
        let token = looped.token.as_ref().unwrap();
        assert_eq!(bridge.final_op().unwrap().descr.as_ref(), Some(&token.target));
    }

    #[test]
    fn test_virtual_bridge_enters_virtual_loop() {
        let (looped, mut ns) = virtual_loop();
        let bridge = optimize_bridge_into(
            &looped,
            &mut ns,
            "[i0]
            p1 = new(descr=nodesize)
            setfield_gc(p1, i0, descr=valuedescr)
            jump(p1, descr=loop)",
            &OptimizerConfig::default(),
        )
        .unwrap();
        assert_equiv(
            &bridge,
            &mut ns,
            "[i0]
            jump(i0)",
        );
    }

    #[test]
    fn test_mismatching_bridge_asks_for_retrace() {
        let (looped, mut ns) = virtual_loop();
        let err = optimize_bridge_into(
            &looped,
            &mut ns,
            "[p0]
            jump(p0, descr=loop)",
            &OptimizerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetraceLoop);
        assert_eq!(looped.token.as_ref().unwrap().retrace_count(), 1);
    }

    #[test]
    fn test_retrace_limit_falls_back_to_preamble() {
        let (looped, mut ns) = virtual_loop();
        let config = OptimizerConfig {
            policy: Policy {
                retrace_limit: 0,
                ..Policy::default()
            },
            ..OptimizerConfig::default()
        };
        let bridge = optimize_bridge_into(
            &looped,
            &mut ns,
            "[p0]
            jump(p0, descr=loop)",
            &config,
        )
        .unwrap();
        let token = looped.token.as_ref().unwrap();
        assert_eq!(bridge.final_op().unwrap().descr.as_ref(), Some(&token.preamble_target));
        assert_eq!(token.num_failed_states(), 1);
    }

    #[test]
    fn test_bridge_into_linear_loop_uses_its_start() {
        let (looped, mut ns) = optimize(COUNTER, LINEAR);
        let bridge = optimize_bridge_into(
            &looped,
            &mut ns,
            "[i0]
            jump(i0, 2, descr=loop)",
            &OptimizerConfig::default(),
        )
        .unwrap();
        let token = looped.token.as_ref().unwrap();
        assert!(token.short_preambles.is_empty());
        assert_eq!(bridge.final_op().unwrap().descr.as_ref(), Some(&token.preamble_target));
        assert_eq!(bridge.ops.len(), 1);
    }
}

mod idempotence {
    use super::*;

    #[test]
    fn test_second_run_changes_nothing() {
        let input = with_node(
            "[i0, p1]
            i2 = getfield_gc(p1, descr=valuedescr)
            i3 = getfield_gc(p1, descr=valuedescr)
            i4 = int_add(i3, 0)
            i5 = int_add(i4, i0)
            i6 = int_lt(i5, 100)
            guard_true(i6) [i0, p1]
            p7 = new(descr=nodesize)
            setfield_gc(p7, i5, descr=valuedescr)
            i8 = getfield_gc(p7, descr=valuedescr)
            jump(i8, p1)",
        );
        let config = OptimizerConfig::with_passes(LINEAR);
        let (mut once, _) = parse(&input).unwrap();
        optimize_loop(&mut once, &config).unwrap();
        let mut twice = once.clone();
        optimize_loop(&mut twice, &config).unwrap();
        assert!(equivalent(&once, &twice).is_ok(), "{}\n---\n{}", once, twice);
        assert_eq!(once.ops.len(), twice.ops.len());
        assert_eq!(opcodes(&once.ops), vec![
            Opcode::GetfieldGc,
            Opcode::IntAdd,
            Opcode::IntLt,
            Opcode::GuardTrue,
            Opcode::Jump,
        ]);
    }
}
