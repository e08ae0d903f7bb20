use std::sync::Arc;

use super::{ints, run_err, run_ok};
use crate::graph::Graph;
use crate::val::{MapVal, TypeTag, Val};
use crate::vm::Vm;

#[test]
fn methods_dispatch_on_the_receiver_type() {
    let mut g = Graph::new();
    let double = g.new_major_block("double");
    {
        let mut b = g.builder(double);
        let x = b.input(TypeTag::Any);
        let r = b.add_(x, x);
        b.output(r);
    }
    g.register_method(TypeTag::Int, "double", double);
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let ten = b.int(10);
        let r = b.dyn_method("double", ten, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(20));
}

#[test]
fn missing_methods_raise_without_crashing() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let ten = b.int(10);
        let r = b.dyn_method("missing", ten, &[]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert_eq!(e, Val::str("Method 'missing' not found on int"));
}

#[test]
fn module_functions_drop_the_receiver() {
    let mut g = Graph::new();
    let greet = g.new_major_block("greet");
    {
        let mut b = g.builder(greet);
        let x = b.input(TypeTag::Any);
        b.output(x);
    }
    g.register_module_func("m", "greet", greet);
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let recv = b.value(Val::Module(Arc::from("m")));
        let arg = b.int(7);
        let r = b.dyn_method("greet", recv, &[arg]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(7));
}

#[test]
fn module_values_resolve_without_a_call() {
    let mut g = Graph::new();
    g.register_module_value("m", "version", Val::Int(42));
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let recv = b.value(Val::Module(Arc::from("m")));
        let r = b.dyn_method("version", recv, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(42));
}

#[test]
fn map_receivers_fall_back_to_field_reads() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let mut m = MapVal::default();
        m.insert(Arc::from("size"), Val::Int(42));
        let recv = b.value(Val::Map(Arc::new(m)));
        let r = b.dyn_method("size", recv, &[]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(42));
}

#[test]
fn failed_input_casts_raise() {
    let mut g = Graph::new();
    let f = g.new_major_block("wants_int");
    {
        let mut b = g.builder(f);
        let x = b.input(TypeTag::Int);
        b.output(x);
    }
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let s = b.str_("nope");
        let r = b.call(f, &[s]);
        b.output(r);
    }
    let (_, e) = run_err(&g, main);
    assert!(e.to_string().contains("Couldn't cast"), "got: {e}");
}

#[test]
fn variadic_natives_collect_trailing_arguments() {
    let mut g = Graph::new();
    let pack = g.add_native_block("pack", 1, true, |vm| {
        let v = vm.input(0).clone();
        vm.set_output(v);
        Ok(())
    });
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let a = b.int(1);
        let c = b.int(2);
        let d = b.int(3);
        let r = b.call(pack, &[a, c, d]);
        b.output(r);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &ints(&[1, 2, 3]));
}

#[test]
fn forks_share_the_compiled_buffer() {
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
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(10));
    let ops_before = vm.bytecode().ops.len();

    let mut nested = vm.fork();
    nested.run(&g);
    assert!(!nested.has_error());
    assert_eq!(nested.output(), &Val::Int(10));
    assert_eq!(vm.bytecode().ops.len(), ops_before, "fork recompiled");
}

#[test]
fn frame_walks_attribute_errors_to_the_call_site() {
    let mut g = Graph::new();
    let f = g.new_major_block("wants_int");
    {
        let mut b = g.builder(f);
        let x = b.input(TypeTag::Int);
        b.output(x);
    }
    let main = g.new_major_block("main");
    let call_term = {
        let mut b = g.builder(main);
        let s = b.str_("nope");
        let r = b.call(f, &[s]);
        b.output(r);
        r
    };
    let mut vm = Vm::new(main);
    vm.run(&g);
    assert!(vm.has_error());
    let frames = vm.frame_list();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].block, Some(main));
    assert_eq!(frames[0].term, Some(call_term));
    assert_eq!(frames[1].block, Some(f));
    assert_eq!(vm.calling_term(), Some(call_term));
}

#[test]
fn run_nested_inherits_the_caller_environment() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let v = b.int(1);
        b.output(v);
    }
    let mut outer = Vm::new(main);
    outer.set_env("mode", Val::str("live"));
    outer.run(&g);

    let mut inner = outer.fork();
    inner.set_env("mode", Val::str("preview"));
    inner.run_nested(&g, &outer);
    // Its own entry wins; missing entries show through.
    assert_eq!(inner.env_val("mode"), Some(&Val::str("preview")));
    outer.set_env("extra", Val::Int(3));
    let mut second = Vm::new(main);
    second.run_nested(&g, &outer);
    assert_eq!(second.env_val("extra"), Some(&Val::Int(3)));
}
