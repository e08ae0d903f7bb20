//! End-to-end tests: build a program graph, run it, check outputs,
//! errors and persisted state.

mod closures;
mod control_flow;
mod dispatch;
mod state;

use crate::graph::{BlockId, Graph};
use crate::val::Val;
use crate::vm::Vm;

/// Run `main` and assert it finished cleanly.
fn run_ok(graph: &Graph, main: BlockId) -> Vm {
    let mut vm = Vm::new(main);
    vm.run(graph);
    assert!(
        !vm.has_error(),
        "unexpected error: {}",
        vm.error_value().cloned().unwrap_or(Val::Null)
    );
    vm
}

/// Run `main` and return the raised error value.
fn run_err(graph: &Graph, main: BlockId) -> (Vm, Val) {
    let mut vm = Vm::new(main);
    vm.run(graph);
    assert!(vm.has_error(), "expected an error, got {}", vm.output());
    let e = vm.error_value().cloned().unwrap_or(Val::Null);
    (vm, e)
}

fn ints(items: &[i64]) -> Val {
    Val::list(items.iter().map(|&i| Val::Int(i)).collect())
}

#[test]
fn literal_output() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let v = b.int(42);
        b.output(v);
    }
    let vm = run_ok(&g, main);
    assert_eq!(vm.output(), &Val::Int(42));
}

#[test]
fn typed_input_addition() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let x = b.input(crate::val::TypeTag::Int);
        let one = b.int(1);
        let r = b.add_(x, one);
        b.output(r);
    }
    let mut vm = Vm::new(main);
    vm.set_input(0, Val::Int(5));
    vm.run(&g);
    assert!(!vm.has_error());
    assert_eq!(vm.output(), &Val::Int(6));
}

#[test]
fn environment_values_pass_to_forks() {
    let mut g = Graph::new();
    let main = g.new_major_block("main");
    {
        let mut b = g.builder(main);
        let v = b.int(0);
        b.output(v);
    }
    let mut vm = Vm::new(main);
    vm.set_env("who", Val::str("tester"));
    vm.run(&g);
    let nested = vm.fork();
    assert_eq!(nested.env_val("who"), Some(&Val::str("tester")));
    assert_eq!(vm.env_val("missing"), None);
}
