use crate::graph::{BlockId, Graph};
use crate::val::Val;
use crate::vm::Vm;

/// `counter = state 0; counter = counter + 1; -> counter`
fn counter_program(g: &mut Graph) -> BlockId {
    let main = g.new_major_block("main");
    let mut b = g.builder(main);
    let zero = b.int(0);
    let c = b.declared_state("counter", zero);
    let one = b.int(1);
    let next = b.add_(c, one);
    b.named(next, "counter");
    b.output(next);
    main
}

#[test]
fn counter_advances_across_runs() {
    let mut g = Graph::new();
    let main = counter_program(&mut g);
    let mut vm = Vm::new(main);
    for expected in 1..=3 {
        vm.run(&g);
        assert!(!vm.has_error());
        assert_eq!(vm.output(), &Val::Int(expected));
    }
    let m = vm.get_state().as_map().unwrap();
    assert_eq!(m["counter"], Val::Int(3));
}

#[test]
fn resetting_state_restarts_the_counter() {
    let mut g = Graph::new();
    let main = counter_program(&mut g);
    let mut vm = Vm::new(main);
    vm.run(&g);
    vm.run(&g);
    assert_eq!(vm.output(), &Val::Int(2));
    vm.set_state(Val::Null);
    vm.run(&g);
    assert_eq!(vm.output(), &Val::Int(1));
}

#[test]
fn state_transplants_to_a_fresh_vm() {
    let mut g = Graph::new();
    let main = counter_program(&mut g);
    let mut vm = Vm::new(main);
    vm.run(&g);
    vm.run(&g);

    let mut other = Vm::new(main);
    other.set_state(vm.get_state().clone());
    other.run(&g);
    assert_eq!(other.output(), &Val::Int(3));
    // The donor VM is unaffected.
    let m = vm.get_state().as_map().unwrap();
    assert_eq!(m["counter"], Val::Int(2));
}

#[test]
fn state_snapshots_serialize_as_plain_data() {
    let mut g = Graph::new();
    let main = counter_program(&mut g);
    let mut vm = Vm::new(main);
    vm.run(&g);
    vm.run(&g);
    let snapshot = serde_json::to_value(vm.get_state()).unwrap();
    assert_eq!(snapshot, serde_json::json!({ "counter": 2 }));
}

#[test]
fn no_save_state_leaves_nothing_behind() {
    let mut g = Graph::new();
    let main = counter_program(&mut g);
    let mut vm = Vm::new(main);
    vm.no_save_state = true;
    vm.run(&g);
    assert_eq!(vm.output(), &Val::Int(1));
    vm.run(&g);
    assert_eq!(vm.output(), &Val::Int(1));
    assert!(vm.get_state().is_null());
}

#[test]
fn loop_iterations_get_their_own_state() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[10, 20]);
        let t = b.for_loop(list, &[], |inner, _elem, _| {
            let zero = inner.int(0);
            let s = inner.declared_state("s", zero);
            let one = inner.int(1);
            let next = inner.add_(s, one);
            inner.named(next, "s");
            None
        });
        b.named(t, "each");
    }
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(!vm.has_error());
    let each = vm.get_state().as_map().unwrap()["each"].clone();
    let each = each.as_map().unwrap();
    assert_eq!(each["0"].as_map().unwrap()["s"], Val::Int(1));
    assert_eq!(each["1"].as_map().unwrap()["s"], Val::Int(1));

    // Each iteration reads back its own slot on the next run.
    vm.run(&g);
    let each = vm.get_state().as_map().unwrap()["each"].clone();
    let each = each.as_map().unwrap();
    assert_eq!(each["0"].as_map().unwrap()["s"], Val::Int(2));
    assert_eq!(each["1"].as_map().unwrap()["s"], Val::Int(2));
}

#[test]
fn discarded_iterations_leave_no_state() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let list = b.list_of_ints(&[10, 20, 30]);
        let t = b.for_loop(list, &[], |inner, elem, _| {
            let zero = inner.int(0);
            let s = inner.declared_state("s", zero);
            let one = inner.int(1);
            let next = inner.add_(s, one);
            inner.named(next, "s");
            let twenty = inner.int(20);
            let hit = inner.eq_(elem, twenty);
            inner.if_else(
                hit,
                |th| {
                    th.discard();
                    None
                },
                |_| None,
            );
            None
        });
        b.named(t, "each");
    }
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(!vm.has_error());
    let each = vm.get_state().as_map().unwrap()["each"].clone();
    let each = each.as_map().unwrap();
    assert_eq!(each["0"].as_map().unwrap()["s"], Val::Int(1));
    assert!(!each.contains_key("1"), "discarded iteration left state");
    assert_eq!(each["2"].as_map().unwrap()["s"], Val::Int(1));
}

#[test]
fn stateful_calls_are_keyed_by_the_call_site() {
    let mut g = Graph::new();
    let f = g.new_major_block("tick");
    {
        let mut b = g.builder(f);
        let zero = b.int(0);
        let c = b.declared_state("counter", zero);
        let one = b.int(1);
        let next = b.add_(c, one);
        b.named(next, "counter");
        b.output(next);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let r1 = b.call(f, &[]);
        b.named(r1, "first");
        let r2 = b.call(f, &[]);
        b.named(r2, "second");
        b.output(r2);
    }
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(!vm.has_error());
    let m = vm.get_state().as_map().unwrap();
    assert_eq!(m["first"].as_map().unwrap()["counter"], Val::Int(1));
    assert_eq!(m["second"].as_map().unwrap()["counter"], Val::Int(1));

    // Independent counters: both advance on the next run.
    vm.run(&g);
    let m = vm.get_state().as_map().unwrap();
    assert_eq!(m["first"].as_map().unwrap()["counter"], Val::Int(2));
    assert_eq!(m["second"].as_map().unwrap()["counter"], Val::Int(2));
}

#[test]
fn conditional_arms_key_state_by_case_index() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.bool_(true);
        let t = b.if_else(
            c,
            |th| {
                let zero = th.int(0);
                let s = th.declared_state("s", zero);
                let one = th.int(1);
                let next = th.add_(s, one);
                th.named(next, "s");
                Some(next)
            },
            |_| None,
        );
        b.named(t, "branch");
        b.output(t);
    }
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(!vm.has_error());
    assert_eq!(vm.output(), &Val::Int(1));
    let branch = vm.get_state().as_map().unwrap()["branch"].clone();
    assert_eq!(branch.as_map().unwrap()["0"].as_map().unwrap()["s"], Val::Int(1));

    vm.run(&g);
    assert_eq!(vm.output(), &Val::Int(2));
}
