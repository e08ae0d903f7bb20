//! Native library functions and the builtin blocks the compiler leans on.
//!
//! A native runs with the frame already set up: inputs in `top+1..`,
//! result written to the output slot at `top`. Returning `Err` raises a
//! user-level VM error; it never unwinds the host.

use anyhow::{Result, bail};

use crate::graph::{Builtins, Graph};
use crate::val::Val;
use crate::vm::Vm;

pub type NativeFn = fn(&mut Vm) -> Result<()>;

pub(crate) fn install_builtins(g: &mut Graph) -> Builtins {
    Builtins {
        add: g.add_native_block("add", 2, false, native_add),
        sub: g.add_native_block("sub", 2, false, native_sub),
        mult: g.add_native_block("mult", 2, false, native_mult),
        div: g.add_native_block("div", 2, false, native_div),
        div_i: g.add_native_block("div_i", 2, false, native_div_i),
        lt: g.add_native_block("lt", 2, false, native_lt),
        eq: g.add_native_block("eq", 2, false, native_eq),
        blank_list: g.add_native_block("blank_list", 1, false, native_blank_list),
        list_append: g.add_native_block("list_append", 2, false, native_list_append),
        map_get: g.add_native_block("map_get", 2, false, native_map_get),
        declared_state: g.add_native_block("declared_state", 2, false, native_declared_state),
        iter_new: g.add_native_block("iter_new", 1, false, native_iter_new),
        loop_done: g.add_native_block("loop_done", 1, false, native_loop_done),
        loop_key: g.add_native_block("loop_key", 1, false, native_loop_key),
        loop_get: g.add_native_block("loop_get", 1, false, native_loop_get),
        loop_advance: g.add_native_block("loop_advance", 1, false, native_loop_advance),
    }
}

fn arith(vm: &mut Vm, fi: fn(i64, i64) -> i64, ff: fn(f64, f64) -> f64) -> Result<()> {
    let out = match (vm.input(0), vm.input(1)) {
        (Val::Int(a), Val::Int(b)) => Val::Int(fi(*a, *b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Val::Float(ff(a, b)),
            _ => bail!(
                "Type error: expected numbers, got {} and {}",
                a.type_tag(),
                b.type_tag()
            ),
        },
    };
    vm.set_output(out);
    Ok(())
}

fn native_add(vm: &mut Vm) -> Result<()> {
    arith(vm, i64::wrapping_add, |a, b| a + b)
}

fn native_sub(vm: &mut Vm) -> Result<()> {
    arith(vm, i64::wrapping_sub, |a, b| a - b)
}

fn native_mult(vm: &mut Vm) -> Result<()> {
    arith(vm, i64::wrapping_mul, |a, b| a * b)
}

/// True division; always yields a float.
fn native_div(vm: &mut Vm) -> Result<()> {
    let (a, b) = match (vm.input(0).as_f64(), vm.input(1).as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => bail!(
            "Type error: expected numbers, got {} and {}",
            vm.input(0).type_tag(),
            vm.input(1).type_tag()
        ),
    };
    if b == 0.0 {
        bail!("Division by zero");
    }
    vm.set_output(Val::Float(a / b));
    Ok(())
}

/// Integer division. Must error exactly like the inline `DivInt` op.
fn native_div_i(vm: &mut Vm) -> Result<()> {
    let (a, b) = match (vm.input(0).as_int(), vm.input(1).as_int()) {
        (Some(a), Some(b)) => (a, b),
        _ => bail!(
            "Type error: expected ints, got {} and {}",
            vm.input(0).type_tag(),
            vm.input(1).type_tag()
        ),
    };
    if b == 0 {
        bail!("Division by zero");
    }
    vm.set_output(Val::Int(a.wrapping_div(b)));
    Ok(())
}

fn native_lt(vm: &mut Vm) -> Result<()> {
    let out = match (vm.input(0).as_f64(), vm.input(1).as_f64()) {
        (Some(a), Some(b)) => Val::Bool(a < b),
        _ => bail!(
            "Type error: expected numbers, got {} and {}",
            vm.input(0).type_tag(),
            vm.input(1).type_tag()
        ),
    };
    vm.set_output(out);
    Ok(())
}

fn native_eq(vm: &mut Vm) -> Result<()> {
    let out = Val::Bool(vm.input(0) == vm.input(1));
    vm.set_output(out);
    Ok(())
}

fn native_blank_list(vm: &mut Vm) -> Result<()> {
    let n = match vm.input(0).as_int() {
        Some(n) if n >= 0 => n as usize,
        _ => bail!("Type error: expected a non-negative int, got {}", vm.input(0)),
    };
    vm.set_output(Val::list(vec![Val::Null; n]));
    Ok(())
}

fn native_list_append(vm: &mut Vm) -> Result<()> {
    let item = vm.input(1).clone();
    let mut list = match vm.input(0) {
        Val::List(l) => l.clone(),
        other => bail!("Type error: expected a list, got {}", other.type_tag()),
    };
    std::sync::Arc::make_mut(&mut list).push(item);
    vm.set_output(Val::List(list));
    Ok(())
}

fn native_map_get(vm: &mut Vm) -> Result<()> {
    let key = vm.input(1).state_key();
    let out = match vm.input(0) {
        Val::Map(m) => m.get(&key).cloned().unwrap_or(Val::Null),
        other => bail!("Type error: expected a map, got {}", other.type_tag()),
    };
    vm.set_output(out);
    Ok(())
}

/// Pick the persisted value if one exists, otherwise the initial value.
fn native_declared_state(vm: &mut Vm) -> Result<()> {
    let out = if vm.input(0).is_null() {
        vm.input(1).clone()
    } else {
        vm.input(0).clone()
    };
    vm.set_output(out);
    Ok(())
}

// Loop iterators are a [list, index] pair; only compiler-generated code
// touches them, so a malformed one is a fatal invariant break.

fn iter_parts(v: &Val) -> (&[Val], i64) {
    let parts = match v.as_list() {
        Some(p) if p.len() == 2 => p,
        _ => panic!("internal error: malformed loop iterator: {v}"),
    };
    let idx = match parts[1].as_int() {
        Some(i) => i,
        None => panic!("internal error: malformed loop iterator index: {}", parts[1]),
    };
    let list = match parts[0].as_list() {
        Some(l) => l,
        None => panic!("internal error: malformed loop iterator list: {}", parts[0]),
    };
    (list, idx)
}

fn native_iter_new(vm: &mut Vm) -> Result<()> {
    let list = match vm.input(0) {
        Val::List(_) => vm.input(0).clone(),
        other => bail!("Cannot iterate over a {}", other.type_tag()),
    };
    vm.set_output(Val::list(vec![list, Val::Int(0)]));
    Ok(())
}

fn native_loop_done(vm: &mut Vm) -> Result<()> {
    let (list, idx) = iter_parts(vm.input(0));
    let out = Val::Bool(idx as usize >= list.len());
    vm.set_output(out);
    Ok(())
}

fn native_loop_key(vm: &mut Vm) -> Result<()> {
    let (_, idx) = iter_parts(vm.input(0));
    vm.set_output(Val::Int(idx));
    Ok(())
}

fn native_loop_get(vm: &mut Vm) -> Result<()> {
    let (list, idx) = iter_parts(vm.input(0));
    let out = match list.get(idx as usize) {
        Some(v) => v.clone(),
        None => panic!("internal error: loop iterator out of range"),
    };
    vm.set_output(out);
    Ok(())
}

fn native_loop_advance(vm: &mut Vm) -> Result<()> {
    let (_, idx) = iter_parts(vm.input(0));
    let list = vm.input(0).as_list().map(|p| p[0].clone());
    let list = match list {
        Some(l) => l,
        None => panic!("internal error: malformed loop iterator"),
    };
    vm.set_output(Val::list(vec![list, Val::Int(idx + 1)]));
    Ok(())
}
