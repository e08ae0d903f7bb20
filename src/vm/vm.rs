//! The virtual machine: a flat slot stack, a dispatch loop over the
//! shared bytecode buffer, and the embedding API.
//!
//! The buffer is behind `Rc<RefCell<_>>` so nested VMs made with
//! [`Vm::fork`] reuse already-compiled blocks; the `Rc` also makes the
//! whole machine `!Send`/`!Sync`, which is the intended single-threaded
//! contract. The only writers of the buffer are lazy compilation and the
//! in-place `UncompiledCall` → `Call` patch, both performed from the
//! dispatch loop between instructions.
//!
//! Two error channels, never mixed: user-level errors set the error flag
//! and leave an error value in the active output slot; broken VM
//! invariants (malformed stack, bad liveness) panic with an internal
//! error, because the bytecode itself is wrong and no user-visible
//! recovery is meaningful.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use super::bytecode::{Bytecode, Op, Opcode};
use super::compiler;
use super::state::StateStack;
use crate::graph::{BlockId, Graph, ModuleMember, TermId};
use crate::util::fast_map::FastHashMap;
use crate::val::{ClosureVal, Val};

/// One entry of a stack walk, attributed via the metadata log.
#[derive(Debug, Clone, Copy)]
pub struct FrameDump {
    pub block: Option<BlockId>,
    pub term: Option<TermId>,
    pub top: usize,
    pub pc: usize,
}

pub struct Vm {
    bc: Rc<RefCell<Bytecode>>,
    main: BlockId,
    stack: Vec<Val>,
    top: usize,
    pc: usize,
    error: bool,
    input_count: usize,
    /// Persisted state; replaced wholesale when the root frame pops.
    state: Val,
    state_frames: StateStack,
    incoming_upvalues: Option<Vec<Val>>,
    env: FastHashMap<Arc<str>, Val>,
    /// Skip all state saves (run the program as if stateless).
    pub no_save_state: bool,
    /// Skip calls to blocks marked as effectful.
    pub no_effect: bool,
    /// Compile diagnostic comment ops into the buffer.
    pub verbose_bytecode: bool,
}

impl Vm {
    pub fn new(main: BlockId) -> Vm {
        Vm {
            bc: Rc::new(RefCell::new(Bytecode::new())),
            main,
            stack: vec![Val::Null],
            top: 0,
            pc: 0,
            error: false,
            input_count: 0,
            state: Val::Null,
            state_frames: StateStack::default(),
            incoming_upvalues: None,
            env: FastHashMap::default(),
            no_save_state: false,
            no_effect: false,
            verbose_bytecode: false,
        }
    }

    /// A nested VM sharing this one's compiled buffer (and config), with
    /// its own stack and state.
    pub fn fork(&self) -> Vm {
        Vm {
            bc: Rc::clone(&self.bc),
            main: self.main,
            stack: vec![Val::Null],
            top: 0,
            pc: 0,
            error: false,
            input_count: 0,
            state: Val::Null,
            state_frames: StateStack::default(),
            incoming_upvalues: None,
            env: self.env.clone(),
            no_save_state: self.no_save_state,
            no_effect: self.no_effect,
            verbose_bytecode: self.verbose_bytecode,
        }
    }

    pub fn main_block(&self) -> BlockId {
        self.main
    }

    pub fn set_main(&mut self, main: BlockId) {
        self.main = main;
    }

    /// Compile a block ahead of time; returns its address.
    pub fn compile(&mut self, graph: &Graph, block: BlockId) -> u32 {
        let mut bc = self.bc.borrow_mut();
        bc.verbose = self.verbose_bytecode;
        bc.no_save_state = self.no_save_state;
        bc.no_effect = self.no_effect;
        compiler::find_or_compile(&mut bc, graph, block)
    }

    /// Read-only view of the shared buffer, for diagnostics and tests.
    pub fn bytecode(&self) -> Ref<'_, Bytecode> {
        self.bc.borrow()
    }

    pub fn disassemble(&self) -> String {
        self.bc.borrow().disassemble()
    }

    pub fn set_input(&mut self, i: usize, v: Val) {
        self.grow_stack(2 + i);
        self.stack[1 + i] = v;
        self.input_count = self.input_count.max(i + 1);
    }

    /// The main block's result after a run.
    pub fn output(&self) -> &Val {
        &self.stack[0]
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn error_value(&self) -> Option<&Val> {
        self.error.then(|| &self.stack[self.top])
    }

    pub fn get_state(&self) -> &Val {
        &self.state
    }

    pub fn set_state(&mut self, state: Val) {
        self.state = state;
    }

    pub fn set_env(&mut self, name: &str, v: Val) {
        self.env.insert(Arc::from(name), v);
    }

    pub fn env_val(&self, name: &str) -> Option<&Val> {
        self.env.get(name)
    }

    /// Raw slot view of the current frame, for introspection.
    pub fn slot(&self, i: usize) -> &Val {
        &self.stack[self.top + i]
    }

    // Accessors for native functions: the frame is already set up, with
    // inputs above the output slot.

    pub fn input(&self, i: usize) -> &Val {
        &self.stack[self.top + 1 + i]
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn set_output(&mut self, v: Val) {
        self.stack[self.top] = v;
    }

    /// Term whose call created the current frame.
    pub fn calling_term(&self) -> Option<TermId> {
        if self.top == 0 {
            return None;
        }
        let saved_pc = as_saved_int(&self.stack[self.top - 1]);
        let addr = saved_pc.checked_sub(1)?;
        self.bc.borrow().find_active_term(addr as u32)
    }

    /// Walk the saved top/pc chain, bottom frame first.
    pub fn frame_list(&self) -> Vec<FrameDump> {
        let bc = self.bc.borrow();
        let mut frames = Vec::new();
        let mut top = self.top;
        let mut pc = self.pc;
        loop {
            let addr = pc.saturating_sub(1) as u32;
            frames.push(FrameDump {
                block: bc.find_active_major_block(addr),
                term: bc.find_active_term(addr),
                top,
                pc,
            });
            if top == 0 {
                break;
            }
            let next_pc = as_saved_int(&self.stack[top - 1]);
            let next_top = as_saved_int(&self.stack[top - 2]);
            if next_top >= top {
                panic!("internal error: malformed stack while walking frames");
            }
            top = next_top;
            pc = next_pc;
        }
        frames.reverse();
        frames
    }

    pub fn run(&mut self, graph: &Graph) {
        self.prepare(graph);
        self.dispatch(graph);
    }

    /// Run as a nested VM: the caller's env entries show through where
    /// this VM has none of its own.
    pub fn run_nested(&mut self, graph: &Graph, caller: &Vm) {
        for (k, v) in &caller.env {
            self.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.run(graph);
    }

    fn prepare(&mut self, graph: &Graph) {
        {
            let mut bc = self.bc.borrow_mut();
            bc.verbose = self.verbose_bytecode;
            bc.no_save_state = self.no_save_state;
            bc.no_effect = self.no_effect;
            self.pc = compiler::find_or_compile(&mut bc, graph, self.main) as usize;
        }
        self.top = 0;
        self.error = false;
        self.state_frames.clear();
        self.grow_stack(1);
    }

    fn dispatch(&mut self, graph: &Graph) {
        loop {
            let op = {
                let bc = self.bc.borrow();
                match bc.ops.get(self.pc) {
                    Some(op) => *op,
                    None => panic!("internal error: pc {} out of range", self.pc),
                }
            };
            self.pc += 1;
            trace!(pc = self.pc - 1, top = self.top, ?op, "exec");
            match op.opcode {
                Opcode::Nope => {}
                Opcode::Comment => {
                    let bc = self.bc.borrow();
                    trace!(note = %bc.consts[op.a as usize], "comment");
                }
                Opcode::UncompiledCall => {
                    // Stay on this op; patch it and re-dispatch.
                    self.pc -= 1;
                    let block = {
                        let bc = self.bc.borrow();
                        bc.consts[op.c as usize].as_block()
                    };
                    let block = match block {
                        Some(b) => b,
                        None => panic!("internal error: uncompiled call without a block const"),
                    };
                    let addr = self.find_or_compile(graph, block);
                    let mut bc = self.bc.borrow_mut();
                    bc.ops[self.pc] = Op::new(Opcode::Call, op.a, op.b, addr as u16);
                }
                Opcode::Call => self.begin_frame(op.a, op.b, op.c as u32),
                Opcode::FuncCallD => {
                    if let Err(e) = self.do_func_call(graph, op) {
                        self.raise(e);
                        return;
                    }
                }
                Opcode::FuncApplyD => {
                    if let Err(e) = self.do_func_apply(graph, op) {
                        self.raise(e);
                        return;
                    }
                }
                Opcode::DynMethod => {
                    if let Err(e) = self.do_dyn_method(graph, op) {
                        self.raise(e);
                        return;
                    }
                }
                Opcode::Jump => self.pc = op.c as usize,
                Opcode::JumpIf => {
                    if self.bool_at(op.a) {
                        self.pc = op.c as usize;
                    }
                }
                Opcode::JumpIfNot => {
                    if !self.bool_at(op.a) {
                        self.pc = op.c as usize;
                    }
                }
                Opcode::GrowFrame => self.grow_stack(self.top + op.a as usize),
                Opcode::LoadConst => {
                    let v = self.bc.borrow().consts[op.a as usize].clone();
                    self.stack[self.top + op.b as usize] = v;
                }
                Opcode::LoadInt => {
                    self.stack[self.top + op.b as usize] = Val::Int(op.a as i64);
                }
                Opcode::Native => {
                    let f = graph.native(op.a);
                    if let Err(e) = f(self) {
                        self.raise(Val::str(e.to_string()));
                        return;
                    }
                }
                Opcode::RetOrStop => {
                    if self.top == 0 {
                        self.cleanup_on_stop();
                        return;
                    }
                    let saved_top = as_saved_int(&self.stack[self.top - 2]);
                    let saved_pc = as_saved_int(&self.stack[self.top - 1]);
                    self.top = saved_top;
                    self.pc = saved_pc;
                }
                Opcode::VarargsToList => {
                    let first = op.a as usize;
                    let count = self.input_count.saturating_sub(first);
                    let base = self.top + 1 + first;
                    self.grow_stack(base + count.max(1));
                    let items: Vec<Val> = (0..count)
                        .map(|i| std::mem::take(&mut self.stack[base + i]))
                        .collect();
                    self.stack[base] = Val::list(items);
                    self.input_count = first + 1;
                }
                Opcode::SplatUpvalues => {
                    let expected = op.b as usize;
                    match self.incoming_upvalues.take() {
                        None => {
                            self.raise(Val::str(
                                "internal error: closure block called without upvalues",
                            ));
                            return;
                        }
                        Some(vals) => {
                            if vals.len() != expected {
                                self.raise(Val::str(format!(
                                    "internal error: wrong upvalue count: got {}, expected {expected}",
                                    vals.len()
                                )));
                                return;
                            }
                            let base = self.top + op.a as usize;
                            for (i, v) in vals.into_iter().enumerate() {
                                self.stack[base + i] = v;
                            }
                        }
                    }
                }
                Opcode::Copy => {
                    let v = self.stack[self.top + op.a as usize].clone();
                    self.stack[self.top + op.b as usize] = v;
                }
                Opcode::SetNull => self.stack[self.top + op.a as usize] = Val::Null,
                Opcode::CopyUp => {
                    let mut t = self.top;
                    for _ in 0..op.a {
                        if t == 0 {
                            panic!("internal error: copy_up walked past the bottom frame");
                        }
                        t = as_saved_int(&self.stack[t - 2]);
                    }
                    let v = self.stack[t + op.b as usize].clone();
                    self.stack[self.top + op.c as usize] = v;
                }
                Opcode::CastFixedType => {
                    let tag = {
                        let bc = self.bc.borrow();
                        match bc.consts[op.b as usize] {
                            Val::Type(t) => t,
                            ref other => {
                                panic!("internal error: cast against a non-type const {other}")
                            }
                        }
                    };
                    let idx = self.top + op.a as usize;
                    match self.stack[idx].clone().cast(tag) {
                        Some(v) => self.stack[idx] = v,
                        None => {
                            let msg =
                                format!("Couldn't cast {} to type {}", self.stack[idx], tag.name());
                            self.raise(Val::str(msg));
                            return;
                        }
                    }
                }
                Opcode::MakeList => {
                    let first = self.top + op.a as usize;
                    let items: Vec<Val> = (0..op.b as usize)
                        .map(|i| std::mem::take(&mut self.stack[first + i]))
                        .collect();
                    self.stack[first] = Val::list(items);
                }
                Opcode::MakeFunc => {
                    let block_idx = self.top + op.a as usize;
                    let block = match self.stack[block_idx].as_block() {
                        Some(b) => b,
                        None => panic!("internal error: make_func without a block ref"),
                    };
                    let bindings =
                        match std::mem::take(&mut self.stack[self.top + op.b as usize]) {
                            Val::List(l) => l.as_ref().clone(),
                            other => {
                                panic!("internal error: make_func bindings are not a list: {other}")
                            }
                        };
                    self.stack[block_idx] = Val::Closure(Arc::new(ClosureVal { block, bindings }));
                }
                Opcode::AddInt => self.int_binop(op, i64::wrapping_add),
                Opcode::SubInt => self.int_binop(op, i64::wrapping_sub),
                Opcode::MultInt => self.int_binop(op, i64::wrapping_mul),
                Opcode::DivInt => {
                    let b = self.int_at(op.b);
                    if b == 0 {
                        self.raise(Val::str("Division by zero"));
                        return;
                    }
                    let a = self.int_at(op.a);
                    self.stack[self.top + op.c as usize] = Val::Int(a.wrapping_div(b));
                }
                Opcode::PushStateFrame => {
                    let key = self.calling_term().map(|t| graph.unique_name(t));
                    self.state_frames.push(key, &self.state);
                }
                Opcode::PushStateFrameDKey => {
                    let key = self.stack[self.top + op.a as usize].state_key();
                    self.state_frames.push(Some(key), &self.state);
                }
                Opcode::PopStateFrame => self.state_frames.pop(&mut self.state),
                Opcode::PopDiscardStateFrame => self.state_frames.pop_discard(),
                Opcode::GetStateValue => {
                    let key = self.stack[self.top + op.a as usize].state_key();
                    self.stack[self.top + op.b as usize] = self.state_frames.get(&key);
                }
                Opcode::SaveStateValue => {
                    let key = self.stack[self.top + op.a as usize].state_key();
                    let v = self.stack[self.top + op.b as usize].clone();
                    self.state_frames.save(key, v);
                }
            }
        }
    }

    // Frame mechanics.

    fn begin_frame(&mut self, rel_top: u16, count: u16, addr: u32) {
        let new_top = self.top + rel_top as usize;
        self.grow_stack(new_top + 1);
        self.stack[new_top - 2] = Val::Int(self.top as i64);
        self.stack[new_top - 1] = Val::Int(self.pc as i64);
        self.top = new_top;
        self.input_count = count as usize;
        self.pc = addr as usize;
    }

    fn find_or_compile(&self, graph: &Graph, block: BlockId) -> u32 {
        let mut bc = self.bc.borrow_mut();
        compiler::find_or_compile(&mut bc, graph, block)
    }

    fn do_func_call(&mut self, graph: &Graph, op: Op) -> Result<(), Val> {
        let closure = match self.stack[self.top + op.a as usize].clone() {
            Val::Closure(c) => c,
            other => {
                return Err(Val::str(format!("Tried to call a non-function value: {other}")));
            }
        };
        self.check_arity(graph, closure.block, op.b as usize)?;
        let addr = self.find_or_compile(graph, closure.block);
        self.incoming_upvalues = Some(closure.bindings.clone());
        self.begin_frame(op.a, op.b, addr);
        Ok(())
    }

    fn do_func_apply(&mut self, graph: &Graph, op: Op) -> Result<(), Val> {
        let base = self.top + op.a as usize;
        let closure = match self.stack[base + 1].clone() {
            Val::Closure(c) => c,
            other => {
                return Err(Val::str(format!("Tried to call a non-function value: {other}")));
            }
        };
        let args = match self.stack[base + 2].clone() {
            Val::List(l) => l,
            other => {
                return Err(Val::str(format!(
                    "Tried to apply a non-list value: {other}"
                )));
            }
        };
        let count = args.len();
        self.check_arity(graph, closure.block, count)?;
        let addr = self.find_or_compile(graph, closure.block);
        self.grow_stack(base + 1 + count.max(2));
        for (i, v) in args.iter().enumerate() {
            self.stack[base + 1 + i] = v.clone();
        }
        self.incoming_upvalues = Some(closure.bindings.clone());
        self.begin_frame(op.a, count as u16, addr);
        Ok(())
    }

    fn check_arity(&self, graph: &Graph, block: BlockId, supplied: usize) -> Result<(), Val> {
        let expected = graph.input_placeholders(block).len();
        let variadic = graph.block(block).variadic;
        let name = graph
            .block(block)
            .name
            .clone()
            .unwrap_or_else(|| Arc::from("<anon>"));
        let min = if variadic { expected - 1 } else { expected };
        if supplied < min {
            return Err(Val::str(format!(
                "Not enough inputs for function '{name}': {supplied} given, {min} expected"
            )));
        }
        if !variadic && supplied > expected {
            return Err(Val::str(format!(
                "Too many inputs for function '{name}': {supplied} given, {expected} expected"
            )));
        }
        Ok(())
    }

    /// Dynamic dispatch with the fallback chain: type method, module
    /// free function (receiver dropped), module member value, map field
    /// read, then a user-level error.
    fn do_dyn_method(&mut self, graph: &Graph, op: Op) -> Result<(), Val> {
        let base = self.top + op.a as usize;
        let name: Arc<str> = {
            let bc = self.bc.borrow();
            match &bc.consts[op.c as usize] {
                Val::Str(s) => s.clone(),
                other => panic!("internal error: dyn method name is not a string: {other}"),
            }
        };
        let receiver = self.stack[base + 1].clone();
        if let Some(block) = graph.find_method(receiver.type_tag(), &name) {
            let addr = self.find_or_compile(graph, block);
            self.begin_frame(op.a, op.b, addr);
            return Ok(());
        }
        if let Val::Module(module) = &receiver {
            match graph.module_member(module, &name) {
                Some(ModuleMember::Func(block)) => {
                    let block = *block;
                    let count = op.b - 1;
                    for i in 0..count as usize {
                        let v = self.stack[base + 2 + i].clone();
                        self.stack[base + 1 + i] = v;
                    }
                    let addr = self.find_or_compile(graph, block);
                    self.begin_frame(op.a, count, addr);
                    return Ok(());
                }
                Some(ModuleMember::Value(v)) => {
                    self.stack[base] = v.clone();
                    return Ok(());
                }
                None => {}
            }
        }
        if matches!(receiver, Val::Map(_)) {
            self.grow_stack(base + 3);
            self.stack[base + 2] = Val::Str(name);
            let map_get = graph.builtins().map_get;
            let addr = self.find_or_compile(graph, map_get);
            self.begin_frame(op.a, 2, addr);
            return Ok(());
        }
        Err(Val::str(format!(
            "Method '{name}' not found on {}",
            receiver.type_tag()
        )))
    }

    fn raise(&mut self, v: Val) {
        trace!(error = %v, "raised");
        self.error = true;
        self.grow_stack(self.top + 1);
        self.stack[self.top] = v;
    }

    fn cleanup_on_stop(&mut self) {
        for s in self.stack.iter_mut().skip(1) {
            *s = Val::Null;
        }
        self.input_count = 0;
        self.incoming_upvalues = None;
    }

    fn grow_stack(&mut self, n: usize) {
        if self.stack.len() < n {
            self.stack.resize(n, Val::Null);
        }
    }

    fn bool_at(&self, slot: u16) -> bool {
        match &self.stack[self.top + slot as usize] {
            Val::Bool(b) => *b,
            other => panic!("internal error: conditional on a non-bool value: {other}"),
        }
    }

    fn int_at(&self, slot: u16) -> i64 {
        match &self.stack[self.top + slot as usize] {
            Val::Int(i) => *i,
            other => panic!("internal error: int op on a non-int value: {other}"),
        }
    }

    fn int_binop(&mut self, op: Op, f: fn(i64, i64) -> i64) {
        let a = self.int_at(op.a);
        let b = self.int_at(op.b);
        self.stack[self.top + op.c as usize] = Val::Int(f(a, b));
    }
}

fn as_saved_int(v: &Val) -> usize {
    match v {
        Val::Int(i) if *i >= 0 => *i as usize,
        other => panic!("internal error: malformed stack: expected a saved index, got {other}"),
    }
}
