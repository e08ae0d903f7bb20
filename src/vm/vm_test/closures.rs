use super::{ints, run_err, run_ok};
use crate::graph::Graph;
use crate::val::Val;

#[test]
fn a_closure_outlives_its_defining_frame() {
    let mut g = Graph::new();
    let f = g.new_major_block("make");
    {
        let mut b = g.builder(f);
        let five = b.int(5);
        let six = b.int(6);
        let x = b.add_(five, six);
        let c = b.closure(0, &[x], |_, _, ups| Some(ups[0]));
        b.output(c);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let made = b.call(f, &[]);
        let r = b.func_call(made, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(11));
}

#[test]
fn closure_parameters_combine_with_captures() {
    let mut g = Graph::new();
    let adder = g.new_major_block("adder");
    {
        let mut b = g.builder(adder);
        let n = b.input(crate::val::TypeTag::Any);
        let c = b.closure(1, &[n], |inner, params, ups| {
            Some(inner.add_(params[0], ups[0]))
        });
        b.output(c);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let three = b.int(3);
        let add3 = b.call(adder, &[three]);
        let ten = b.int(10);
        let r = b.func_call(add3, &[ten]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(13));
}

#[test]
fn apply_spreads_a_list_of_arguments() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.closure(2, &[], |inner, params, _| {
            Some(inner.add_(params[0], params[1]))
        });
        let args = b.list_of_ints(&[10, 3]);
        let r = b.func_apply(c, args);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(13));
}

#[test]
fn captures_are_copied_at_creation_time() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let x = b.int(1);
        b.named(x, "x");
        let c = b.closure(0, &[x], |_, _, ups| Some(ups[0]));
        // Rebinding the name after capture must not affect the closure.
        let x2 = b.int(2);
        b.named(x2, "x");
        let r = b.func_call(c, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(1));
}

#[test]
fn calling_with_too_few_arguments_errors() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.closure(1, &[], |_, params, _| Some(params[0]));
        let r = b.func_call(c, &[]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(e.to_string().contains("Not enough inputs"), "got: {e}");
}

#[test]
fn calling_with_too_many_arguments_errors() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.closure(1, &[], |_, params, _| Some(params[0]));
        let a = b.int(1);
        let extra = b.int(2);
        let r = b.func_call(c, &[a, extra]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(e.to_string().contains("Too many inputs"), "got: {e}");
}

#[test]
fn calling_a_non_function_errors() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let v = b.int(7);
        let r = b.func_call(v, &[]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(
        e.to_string().contains("Tried to call a non-function value"),
        "got: {e}"
    );
}

#[test]
fn applying_a_non_list_errors() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.closure(0, &[], |inner, _, _| Some(inner.int(1)));
        let not_a_list = b.int(9);
        let r = b.func_apply(c, not_a_list);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(e.to_string().contains("Tried to apply a non-list value"), "got: {e}");
}

#[test]
fn closure_bodies_reject_direct_calls() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    let body = {
        let mut b = g.builder(main);
        let x = b.int(5);
        let c = b.closure(0, &[x], |_, _, ups| Some(ups[0]));
        b.graph().term(c).contents.unwrap()
    };
    {
        let mut b = g.builder(main);
        let r = b.call(body, &[]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(e.to_string().contains("without upvalues"), "got: {e}");
}

#[test]
fn bodies_read_enclosing_frames_without_captures() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let two = b.int(2);
        let three = b.int(3);
        let y = b.add_(two, three);
        let c = b.closure(0, &[], |_, _, _| Some(y));
        let r = b.func_call(c, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(5));
}

#[test]
fn closures_returning_lists() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let c = b.closure(0, &[], |inner, _, _| Some(inner.list_of_ints(&[1, 2])));
        let r = b.func_call(c, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &ints(&[1, 2]));
}
