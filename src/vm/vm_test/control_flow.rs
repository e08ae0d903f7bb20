use super::{ints, run_ok};
use crate::graph::Graph;
use crate::val::{TypeTag, Val};
use crate::vm::Vm;

#[test]
fn calling_a_function_block() {
    let mut g = Graph::new();
    let f = g.new_major_block("add_one");
    {
        let mut b = g.builder(f);
        let x = b.input(TypeTag::Int);
        let one = b.int(1);
        let r = b.add_(x, one);
        b.output(r);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let five = b.int(5);
        let r = b.call(f, &[five]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(6));
    // The lazy call site was patched to a direct call.
    let bc = vm.bytecode();
    let f_addr = bc.find_compiled(f).unwrap();
    assert!(bc
        .ops
        .iter()
        .any(|op| op.opcode == crate::vm::Opcode::Call && op.c as u32 == f_addr));
}

#[test]
fn precompiled_callees_get_direct_calls() {
    let mut g = Graph::new();
    let f = g.new_major_block("add_one");
    {
        let mut b = g.builder(f);
        let x = b.input(TypeTag::Any);
        let one = b.int(1);
        let r = b.add_(x, one);
        b.output(r);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let nine = b.int(9);
        let r = b.call(f, &[nine]);
        b.output(r);
    }
    // Compile the callee first, so the caller's unit is emitted with a
    // direct call and then relocated behind the callee's code.
    let mut vm = Vm::new(main);
    let f_addr = vm.compile(&g, f);
    vm.run(&g);
    assert!(!vm.has_error());
    assert_eq!(vm.output(), &Val::Int(10));
    let bc = vm.bytecode();
    assert_eq!(bc.find_compiled(f), Some(f_addr));
    assert!(bc
        .ops
        .iter()
        .any(|op| op.opcode == crate::vm::Opcode::Call && op.c as u32 == f_addr));
}

#[test]
fn no_effect_skips_effectful_blocks() {
    let mut g = Graph::new();
    let emit = g.new_major_block("emit");
    {
        let mut b = g.builder(emit);
        let v = b.int(7);
        b.output(v);
    }
    g.set_has_effects(emit, true);
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let r = b.call(emit, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(7));

    let mut quiet = Vm::new(main);
    quiet.no_effect = true;
    quiet.run(&g);
    assert!(!quiet.has_error());
    assert_eq!(quiet.output(), &Val::Null, "effectful call was not skipped");
}

#[test]
fn for_loop_maps_a_list() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[0, 1, 2]);
        let t = b.for_loop(list, &[], |inner, elem, _| {
            let four = inner.int(4);
            Some(inner.add_(elem, four))
        });
        b.output(t);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &ints(&[4, 5, 6]));
}

#[test]
fn for_loop_over_an_empty_list() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[]);
        let t = b.for_loop(list, &[], |inner, elem, _| {
            let four = inner.int(4);
            Some(inner.add_(elem, four))
        });
        b.output(t);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &ints(&[]));
}

#[test]
fn while_loop_counts_up() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let zero = b.int(0);
        let t = b.while_loop(&[("i", zero)], |inner, loops| {
            let three = inner.int(3);
            let c = inner.lt_(loops[0], three);
            inner.loop_condition(c);
            let one = inner.int(1);
            let next = inner.add_(loops[0], one);
            inner.named(next, "i");
        });
        let i_final = b.graph().extra_output(t, 1).unwrap();
        b.output(i_final);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(3));
}

#[test]
fn break_stops_before_preserving_the_iteration() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[1, 2, 3]);
        let t = b.for_loop(list, &[], |inner, elem, _| {
            let two = inner.int(2);
            let hit = inner.eq_(elem, two);
            inner.if_else(
                hit,
                |th| {
                    th.brk();
                    None
                },
                |_| None,
            );
            Some(elem)
        });
        b.output(t);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &ints(&[1]));
}

#[test]
fn continue_skips_an_element() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[1, 2, 3]);
        let zero = b.int(0);
        let t = b.for_loop(list, &[("sum", zero)], |inner, elem, loops| {
            let two = inner.int(2);
            let hit = inner.eq_(elem, two);
            inner.if_else(
                hit,
                |th| {
                    th.cont();
                    None
                },
                |_| None,
            );
            let next = inner.add_(loops[0], elem);
            inner.named(next, "sum");
            None
        });
        let sum = b.graph().extra_output(t, 1).unwrap();
        b.output(sum);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(4));
}

#[test]
fn conditional_picks_the_live_arm() {
    for (cond, expected) in [(true, 1i64), (false, 2i64)] {
        let mut g = Graph::new();
        let main = g.new_major_block("main");
        {
            let mut b = g.builder(main);
            let c = b.bool_(cond);
            let t = b.if_else(c, |th| Some(th.int(1)), |el| Some(el.int(2)));
            b.output(t);
        }
        let vm = run_ok(&g, main);
        assert_eq!(vm.output(), &Val::Int(expected), "condition {cond}");
    }
}

#[test]
fn conditional_with_one_silent_arm_yields_null() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.bool_(false);
        let t = b.if_else(c, |th| Some(th.int(1)), |_| None);
        b.output(t);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Null);
}

#[test]
fn early_return_short_circuits_a_function() {
    let mut g = Graph::new();
    let f = g.new_major_block("guarded");
    {
        let mut b = g.builder(f);
        let x = b.input(TypeTag::Any);
        let zero = b.int(0);
        let is_zero = b.eq_(x, zero);
        b.if_else(
            is_zero,
            |th| {
                let v = th.int(99);
                th.ret(Some(v));
                None
            },
            |_| None,
        );
        let one = b.int(1);
        let r = b.add_(x, one);
        b.output(r);
    }
    let main_zero = g.new_major_block("main_zero");
    {
        let mut b = g.builder(main_zero);
        let arg = b.int(0);
        let r = b.call(f, &[arg]);
        b.output(r);
    }
    let main_five = g.new_major_block("main_five");
    {
        let mut b = g.builder(main_five);
        let arg = b.int(5);
        let r = b.call(f, &[arg]);
        b.output(r);
    }
    let mut vm = run_ok(&g, main_zero);
    assert_eq!(vm.output(), &Val::Int(99));
    vm.set_main(main_five);
    vm.run(&g);
    assert!(!vm.has_error());
    assert_eq!(vm.output(), &Val::Int(6));
}

#[test]
fn nested_loops_accumulate() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let outer_list = b.list_of_ints(&[10, 20]);
        let zero = b.int(0);
        let t = b.for_loop(outer_list, &[("total", zero)], |inner, _elem, loops| {
            let total = loops[0];
            let inner_list = inner.list_of_ints(&[1, 2]);
            let t2 = inner.for_loop(inner_list, &[("acc", total)], |in2, elem2, loops2| {
                let s = in2.add_(loops2[0], elem2);
                in2.named(s, "acc");
                None
            });
            let acc_final = inner.graph().extra_output(t2, 1).unwrap();
            inner.named(acc_final, "total");
            None
        });
        let total = b.graph().extra_output(t, 1).unwrap();
        b.output(total);
    }
    // 0 + (1+2) + (1+2) = 6
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(6));
}

#[test]
fn division_by_zero_is_a_user_error() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let a = b.int(1);
        let z = b.int(0);
        let div_i = b.graph().builtins().div_i;
        let r = b.call(div_i, &[a, z]);
        b.output(r);
    }
    // Both operands are declared ints, so this exercises the inline op.
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(vm.has_error());
    assert_eq!(vm.error_value(), Some(&Val::str("Division by zero")));
}
