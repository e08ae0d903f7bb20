//! The program graph: an arena of blocks and terms with stable identity.
//!
//! This is the compiler's input. Hosts (and tests) construct programs
//! through [`BlockBuilder`] rather than a parser; the graph stays mutable
//! between runs, which is what makes live editing possible — block and
//! term ids survive edits, and the state-frame keys derived from term
//! names survive recompilation.

use std::sync::Arc;

use serde::Serialize;

use crate::util::fast_map::{FastHashMap, FastHashSet};
use crate::val::{TypeTag, Val};
use crate::vm::natives::{self, NativeFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TermId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TermId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a term does. The compiler matches on this exhaustively; there is
/// no "compare the function pointer" fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum TermFunc {
    /// Literal; the value lives in `TermData::value`.
    Value,
    /// Input placeholder. Function inputs have one slot; looped values
    /// have two inputs: initial (outer scope) and next-iteration (inner).
    Input,
    /// Output placeholder; input 0 is the term whose value is produced.
    Output,
    /// Captured-variable placeholder in a closure body; input 0 is the
    /// captured term in the defining scope.
    Upvalue,
    /// The loop's iterator register; input 0 is the initial iterator.
    LoopIterator,
    /// Extra result of the preceding term (looped-value rebinding).
    ExtraOutput(usize),
    /// Statically-bound call to a block.
    Call(BlockId),
    /// Dynamically-dispatched method call; input 0 is the receiver.
    DynMethod(Arc<str>),
    /// Call a closure value; input 0 is the closure, rest are arguments.
    FuncCall,
    /// Call a closure value with an argument list; inputs: closure, list.
    FuncApply,
    /// Make a closure from `contents` plus the captures it declares.
    Closure,
    ForLoop,
    WhileLoop,
    /// While-loop condition; input 0 must be true to continue the loop.
    LoopConditionBool,
    /// If/switch chain; `contents` holds the case terms.
    Conditional,
    /// One arm of a conditional; only valid inside a Conditional block.
    Case,
    Break,
    Continue,
    Discard,
    /// Early return; input 0 (optional) is the result.
    Return,
    /// Persistent slot; input 0 is the initial value. The term's name is
    /// the state key.
    DeclaredState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Major,
    ForLoop,
    WhileLoop,
    Conditional,
    Case,
}

#[derive(Debug)]
pub struct TermData {
    pub func: TermFunc,
    pub inputs: Vec<Option<TermId>>,
    pub contents: Option<BlockId>,
    pub name: Option<Arc<str>>,
    pub value: Option<Val>,
    pub declared_type: TypeTag,
    pub owner: BlockId,
    unique_name: Arc<str>,
}

impl TermData {
    pub fn input(&self, i: usize) -> Option<TermId> {
        self.inputs.get(i).copied().flatten()
    }

    /// Terms that never produce a value; using one as an input loads null.
    pub fn is_exit(&self) -> bool {
        matches!(
            self.func,
            TermFunc::Break | TermFunc::Continue | TermFunc::Discard | TermFunc::Return
        )
    }

    /// Placeholder-ish terms that evaluate to nothing at their position.
    pub fn needs_no_evaluation(&self) -> bool {
        matches!(
            self.func,
            TermFunc::Value
                | TermFunc::Input
                | TermFunc::Output
                | TermFunc::Upvalue
                | TermFunc::LoopIterator
                | TermFunc::ExtraOutput(_)
        )
    }
}

#[derive(Debug)]
pub struct BlockData {
    pub kind: BlockKind,
    pub owner: Option<TermId>,
    pub parent: Option<BlockId>,
    pub terms: Vec<TermId>,
    pub name: Option<Arc<str>>,
    /// Index into the native table; compiled as a single native op.
    pub native: Option<u16>,
    /// Last input placeholder collects trailing arguments into a list.
    pub variadic: bool,
    /// Skipped entirely when the VM runs with `no_effect`.
    pub has_effects: bool,
    /// For Case blocks: the condition term (in an enclosing scope), or
    /// None for the else-arm.
    pub case_condition: Option<TermId>,
}

pub enum ModuleMember {
    Func(BlockId),
    Value(Val),
}

/// Blocks for the library functions the compiler emits calls to.
#[derive(Clone, Copy)]
pub struct Builtins {
    pub add: BlockId,
    pub sub: BlockId,
    pub mult: BlockId,
    pub div: BlockId,
    pub div_i: BlockId,
    pub lt: BlockId,
    pub eq: BlockId,
    pub blank_list: BlockId,
    pub list_append: BlockId,
    pub map_get: BlockId,
    pub declared_state: BlockId,
    pub iter_new: BlockId,
    pub loop_done: BlockId,
    pub loop_key: BlockId,
    pub loop_get: BlockId,
    pub loop_advance: BlockId,
}

/// Where a name lookup starts: just before a term, or at a block's end.
#[derive(Debug, Clone, Copy)]
pub enum NameLoc {
    Before(TermId),
    EndOfBlock(BlockId),
}

pub struct Graph {
    blocks: Vec<BlockData>,
    terms: Vec<TermData>,
    natives: Vec<NativeFn>,
    methods: FastHashMap<(TypeTag, Arc<str>), BlockId>,
    modules: FastHashMap<Arc<str>, FastHashMap<Arc<str>, ModuleMember>>,
    builtins: Builtins,
}

impl Graph {
    pub fn new() -> Graph {
        let placeholder = BlockId(0);
        let mut g = Graph {
            blocks: Vec::new(),
            terms: Vec::new(),
            natives: Vec::new(),
            methods: FastHashMap::default(),
            modules: FastHashMap::default(),
            builtins: Builtins {
                add: placeholder,
                sub: placeholder,
                mult: placeholder,
                div: placeholder,
                div_i: placeholder,
                lt: placeholder,
                eq: placeholder,
                blank_list: placeholder,
                list_append: placeholder,
                map_get: placeholder,
                declared_state: placeholder,
                iter_new: placeholder,
                loop_done: placeholder,
                loop_key: placeholder,
                loop_get: placeholder,
                loop_advance: placeholder,
            },
        };
        g.builtins = natives::install_builtins(&mut g);
        g
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.index()]
    }

    pub fn term(&self, id: TermId) -> &TermData {
        &self.terms[id.index()]
    }

    pub(crate) fn term_mut(&mut self, id: TermId) -> &mut TermData {
        &mut self.terms[id.index()]
    }

    /// Name used for state-frame keys. Stable across recompilation as
    /// long as the term survives the edit.
    pub fn unique_name(&self, id: TermId) -> Arc<str> {
        self.term(id).unique_name.clone()
    }

    fn add_block(&mut self, kind: BlockKind, parent: Option<BlockId>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            kind,
            owner: None,
            parent,
            terms: Vec::new(),
            name: None,
            native: None,
            variadic: false,
            has_effects: false,
            case_condition: None,
        });
        id
    }

    /// A fresh top-level major block (a function, or a program's main).
    pub fn new_major_block(&mut self, name: &str) -> BlockId {
        let id = self.add_block(BlockKind::Major, None);
        self.blocks[id.index()].name = Some(Arc::from(name));
        id
    }

    pub fn builder(&mut self, block: BlockId) -> BlockBuilder<'_> {
        BlockBuilder { graph: self, block }
    }

    fn add_term(&mut self, owner: BlockId, func: TermFunc, inputs: Vec<Option<TermId>>) -> TermId {
        let id = TermId(self.terms.len() as u32);
        let unique_name = Arc::from(format!("_t{}", id.0).as_str());
        self.terms.push(TermData {
            func,
            inputs,
            contents: None,
            name: None,
            value: None,
            declared_type: TypeTag::Any,
            owner,
            unique_name,
        });
        self.blocks[owner.index()].terms.push(id);
        id
    }

    fn set_name(&mut self, term: TermId, name: &str) {
        let owner = self.term(term).owner;
        let taken = self
            .block(owner)
            .terms
            .iter()
            .any(|&t| t != term && &*self.term(t).unique_name == name);
        let unique: Arc<str> = if taken {
            Arc::from(format!("{name}_{}", term.0).as_str())
        } else {
            Arc::from(name)
        };
        let td = self.term_mut(term);
        td.name = Some(Arc::from(name));
        td.unique_name = unique;
    }

    // Structure queries used by the compiler.

    pub fn input_placeholders(&self, block: BlockId) -> Vec<TermId> {
        self.block(block)
            .terms
            .iter()
            .copied()
            .filter(|&t| self.term(t).func == TermFunc::Input)
            .collect()
    }

    pub fn output_placeholders(&self, block: BlockId) -> Vec<TermId> {
        self.block(block)
            .terms
            .iter()
            .copied()
            .filter(|&t| self.term(t).func == TermFunc::Output)
            .collect()
    }

    pub fn output_placeholder(&self, block: BlockId, i: usize) -> Option<TermId> {
        self.output_placeholders(block).get(i).copied()
    }

    pub fn upvalue_placeholders(&self, block: BlockId) -> Vec<TermId> {
        self.block(block)
            .terms
            .iter()
            .copied()
            .filter(|&t| self.term(t).func == TermFunc::Upvalue)
            .collect()
    }

    pub fn loop_iterator(&self, block: BlockId) -> Option<TermId> {
        self.block(block)
            .terms
            .iter()
            .copied()
            .find(|&t| self.term(t).func == TermFunc::LoopIterator)
    }

    fn find_call_to(&self, block: BlockId, target: BlockId) -> Option<TermId> {
        self.block(block)
            .terms
            .iter()
            .copied()
            .find(|&t| self.term(t).func == TermFunc::Call(target))
    }

    pub fn loop_done_call(&self, block: BlockId) -> Option<TermId> {
        self.find_call_to(block, self.builtins.loop_done)
    }

    pub fn loop_key_call(&self, block: BlockId) -> Option<TermId> {
        self.find_call_to(block, self.builtins.loop_key)
    }

    pub fn loop_advance_call(&self, block: BlockId) -> Option<TermId> {
        self.find_call_to(block, self.builtins.loop_advance)
    }

    /// The i'th result of a term: the term itself for i = 0, otherwise
    /// the ExtraOutput terms immediately following it.
    pub fn extra_output(&self, term: TermId, index: usize) -> Option<TermId> {
        if index == 0 {
            return Some(term);
        }
        let owner = self.term(term).owner;
        let terms = &self.block(owner).terms;
        let pos = terms.iter().position(|&t| t == term)?;
        for &t in &terms[pos + 1..] {
            match self.term(t).func {
                TermFunc::ExtraOutput(i) if self.term(t).input(0) == Some(term) => {
                    if i == index {
                        return Some(t);
                    }
                }
                _ => break,
            }
        }
        None
    }

    pub fn enclosing_major_block(&self, block: BlockId) -> BlockId {
        let mut b = block;
        while self.block(b).kind != BlockKind::Major {
            b = self
                .block(b)
                .parent
                .unwrap_or_else(|| panic!("internal error: minor block {} has no parent", b.0));
        }
        b
    }

    /// The major block lexically enclosing `block`, if any.
    pub fn parent_major_block(&self, block: BlockId) -> Option<BlockId> {
        let p = self.block(block).parent?;
        Some(self.enclosing_major_block(p))
    }

    pub fn major_block_of(&self, term: TermId) -> BlockId {
        self.enclosing_major_block(self.term(term).owner)
    }

    /// Nearest enclosing loop block of a term, not crossing a major
    /// block boundary.
    pub fn enclosing_loop(&self, term: TermId) -> Option<BlockId> {
        let mut b = self.term(term).owner;
        loop {
            match self.block(b).kind {
                BlockKind::ForLoop | BlockKind::WhileLoop => return Some(b),
                BlockKind::Major => return None,
                _ => b = self.block(b).parent?,
            }
        }
    }

    /// Whether running this block can touch persistent state, directly or
    /// through anything it calls.
    pub fn block_has_state(&self, block: BlockId) -> bool {
        let mut visited = FastHashSet::default();
        self.has_state_inner(block, &mut visited)
    }

    fn has_state_inner(&self, block: BlockId, visited: &mut FastHashSet<BlockId>) -> bool {
        if !visited.insert(block) {
            return false;
        }
        for &t in &self.block(block).terms {
            let td = self.term(t);
            match &td.func {
                TermFunc::DeclaredState => return true,
                TermFunc::Call(target) => {
                    if self.has_state_inner(*target, visited) {
                        return true;
                    }
                }
                _ => {
                    if let Some(c) = td.contents {
                        if self.has_state_inner(c, visited) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Backward name resolution: scan the enclosing terms before `loc`,
    /// walking out of minor blocks but stopping at the major boundary.
    pub fn find_name_at(&self, loc: NameLoc, name: &str) -> Option<TermId> {
        let (mut block, mut idx) = match loc {
            NameLoc::Before(t) => {
                let owner = self.term(t).owner;
                let pos = self.block(owner).terms.iter().position(|&x| x == t)?;
                (owner, pos)
            }
            NameLoc::EndOfBlock(b) => (b, self.block(b).terms.len()),
        };
        loop {
            let terms = &self.block(block).terms;
            for &t in terms[..idx].iter().rev() {
                if self.term(t).name.as_deref() == Some(name) {
                    return Some(t);
                }
            }
            if self.block(block).kind == BlockKind::Major {
                return None;
            }
            let parent = self.block(block).parent?;
            let owner = self.block(block).owner?;
            idx = self.block(parent).terms.iter().position(|&x| x == owner)?;
            block = parent;
        }
    }

    // Dynamic-dispatch tables.

    pub fn register_method(&mut self, tag: TypeTag, name: &str, block: BlockId) {
        self.methods.insert((tag, Arc::from(name)), block);
    }

    pub fn find_method(&self, tag: TypeTag, name: &str) -> Option<BlockId> {
        self.methods.get(&(tag, Arc::from(name))).copied()
    }

    pub fn register_module_func(&mut self, module: &str, name: &str, block: BlockId) {
        self.modules
            .entry(Arc::from(module))
            .or_default()
            .insert(Arc::from(name), ModuleMember::Func(block));
    }

    pub fn register_module_value(&mut self, module: &str, name: &str, value: Val) {
        self.modules
            .entry(Arc::from(module))
            .or_default()
            .insert(Arc::from(name), ModuleMember::Value(value));
    }

    pub fn module_member(&self, module: &str, name: &str) -> Option<&ModuleMember> {
        self.modules.get(module)?.get(name)
    }

    // Native-backed blocks.

    /// Register a native function as a callable major block.
    pub fn add_native_block(&mut self, name: &str, inputs: usize, variadic: bool, f: NativeFn) -> BlockId {
        let native_id = self.natives.len() as u16;
        self.natives.push(f);
        let block = self.new_major_block(name);
        for _ in 0..inputs {
            self.add_term(block, TermFunc::Input, vec![]);
        }
        self.add_term(block, TermFunc::Output, vec![None]);
        let bd = self.block_mut(block);
        bd.native = Some(native_id);
        bd.variadic = variadic;
        block
    }

    pub fn set_has_effects(&mut self, block: BlockId, has_effects: bool) {
        self.block_mut(block).has_effects = has_effects;
    }

    pub(crate) fn native(&self, id: u16) -> NativeFn {
        self.natives[id as usize]
    }
}

impl Default for Graph {
    fn default() -> Graph {
        Graph::new()
    }
}

/// Cursor for appending terms to one block. Stands in for the parser.
pub struct BlockBuilder<'g> {
    graph: &'g mut Graph,
    block: BlockId,
}

impl<'g> BlockBuilder<'g> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    fn add(&mut self, func: TermFunc, inputs: Vec<Option<TermId>>) -> TermId {
        self.graph.add_term(self.block, func, inputs)
    }

    pub fn value(&mut self, v: Val) -> TermId {
        let ty = v.type_tag();
        let t = self.add(TermFunc::Value, vec![]);
        let td = self.graph.term_mut(t);
        td.value = Some(v);
        td.declared_type = ty;
        t
    }

    pub fn int(&mut self, i: i64) -> TermId {
        self.value(Val::Int(i))
    }

    pub fn float(&mut self, f: f64) -> TermId {
        self.value(Val::Float(f))
    }

    pub fn bool_(&mut self, b: bool) -> TermId {
        self.value(Val::Bool(b))
    }

    pub fn str_(&mut self, s: &str) -> TermId {
        self.value(Val::str(s))
    }

    pub fn list_of_ints(&mut self, items: &[i64]) -> TermId {
        self.value(Val::list(items.iter().map(|&i| Val::Int(i)).collect()))
    }

    /// Function input placeholder. Typed inputs get a cast at entry.
    pub fn input(&mut self, ty: TypeTag) -> TermId {
        let t = self.add(TermFunc::Input, vec![]);
        self.graph.term_mut(t).declared_type = ty;
        t
    }

    /// Trailing variadic input: collects the remaining call arguments
    /// into a list.
    pub fn varargs_input(&mut self) -> TermId {
        let t = self.input(TypeTag::Any);
        self.graph.block_mut(self.block).variadic = true;
        t
    }

    pub fn output(&mut self, result: TermId) {
        self.add(TermFunc::Output, vec![Some(result)]);
    }

    pub fn named(&mut self, term: TermId, name: &str) -> TermId {
        self.graph.set_name(term, name);
        term
    }

    pub fn call(&mut self, target: BlockId, inputs: &[TermId]) -> TermId {
        let t = self.add(
            TermFunc::Call(target),
            inputs.iter().map(|&i| Some(i)).collect(),
        );
        let bt = self.graph.builtins;
        let all_int = inputs
            .iter()
            .all(|&i| self.graph.term(i).declared_type == TypeTag::Int);
        let ty = if target == bt.lt || target == bt.eq {
            TypeTag::Bool
        } else if all_int
            && (target == bt.add || target == bt.sub || target == bt.mult || target == bt.div_i)
        {
            TypeTag::Int
        } else {
            TypeTag::Any
        };
        self.graph.term_mut(t).declared_type = ty;
        t
    }

    pub fn add_(&mut self, a: TermId, b: TermId) -> TermId {
        let target = self.graph.builtins.add;
        self.call(target, &[a, b])
    }

    pub fn sub_(&mut self, a: TermId, b: TermId) -> TermId {
        let target = self.graph.builtins.sub;
        self.call(target, &[a, b])
    }

    pub fn mult_(&mut self, a: TermId, b: TermId) -> TermId {
        let target = self.graph.builtins.mult;
        self.call(target, &[a, b])
    }

    pub fn lt_(&mut self, a: TermId, b: TermId) -> TermId {
        let target = self.graph.builtins.lt;
        self.call(target, &[a, b])
    }

    pub fn eq_(&mut self, a: TermId, b: TermId) -> TermId {
        let target = self.graph.builtins.eq;
        self.call(target, &[a, b])
    }

    pub fn dyn_method(&mut self, name: &str, receiver: TermId, args: &[TermId]) -> TermId {
        let mut inputs = vec![Some(receiver)];
        inputs.extend(args.iter().map(|&a| Some(a)));
        self.add(TermFunc::DynMethod(Arc::from(name)), inputs)
    }

    pub fn func_call(&mut self, func: TermId, args: &[TermId]) -> TermId {
        let mut inputs = vec![Some(func)];
        inputs.extend(args.iter().map(|&a| Some(a)));
        self.add(TermFunc::FuncCall, inputs)
    }

    pub fn func_apply(&mut self, func: TermId, arg_list: TermId) -> TermId {
        self.add(TermFunc::FuncApply, vec![Some(func), Some(arg_list)])
    }

    pub fn ret(&mut self, result: Option<TermId>) -> TermId {
        self.add(TermFunc::Return, vec![result])
    }

    pub fn brk(&mut self) -> TermId {
        self.add(TermFunc::Break, vec![])
    }

    pub fn cont(&mut self) -> TermId {
        self.add(TermFunc::Continue, vec![])
    }

    pub fn discard(&mut self) -> TermId {
        self.add(TermFunc::Discard, vec![])
    }

    pub fn declared_state(&mut self, name: &str, initial: TermId) -> TermId {
        let t = self.add(TermFunc::DeclaredState, vec![Some(initial)]);
        self.named(t, name)
    }

    /// Make a closure capturing `captures` by value, with `params` input
    /// placeholders. The body callback receives builders for the body
    /// block, the parameter terms and the upvalue terms, and returns the
    /// result term.
    pub fn closure(
        &mut self,
        params: usize,
        captures: &[TermId],
        body: impl FnOnce(&mut BlockBuilder, &[TermId], &[TermId]) -> Option<TermId>,
    ) -> TermId {
        let outer = self.block;
        let body_block = self.graph.add_block(BlockKind::Major, Some(outer));
        let t = self.add(TermFunc::Closure, vec![]);
        self.graph.term_mut(t).contents = Some(body_block);
        self.graph.block_mut(body_block).owner = Some(t);

        let mut inner = BlockBuilder {
            graph: &mut *self.graph,
            block: body_block,
        };
        let param_terms: Vec<TermId> = (0..params).map(|_| inner.input(TypeTag::Any)).collect();
        let upvalue_terms: Vec<TermId> = captures
            .iter()
            .map(|&c| inner.add(TermFunc::Upvalue, vec![Some(c)]))
            .collect();
        if let Some(result) = body(&mut inner, &param_terms, &upvalue_terms) {
            inner.output(result);
        }
        t
    }

    /// For-each over a list. `loops` declares looped values: name plus
    /// initial term; each iteration rebinds them from the latest term of
    /// that name in the body. The body returns the per-iteration result,
    /// accumulated into the loop's output list (or None for a loop with
    /// no output).
    pub fn for_loop(
        &mut self,
        list: TermId,
        loops: &[(&str, TermId)],
        body: impl FnOnce(&mut BlockBuilder, TermId, &[TermId]) -> Option<TermId>,
    ) -> TermId {
        let bt = self.graph.builtins;
        let iter_init = self.call(bt.iter_new, &[list]);

        let outer = self.block;
        let loop_block = self.graph.add_block(BlockKind::ForLoop, Some(outer));
        let t = self.add(TermFunc::ForLoop, vec![]);
        self.graph.term_mut(t).contents = Some(loop_block);
        self.graph.block_mut(loop_block).owner = Some(t);

        let placeholders = {
            let mut inner = BlockBuilder {
                graph: &mut *self.graph,
                block: loop_block,
            };
            let placeholders: Vec<TermId> = loops
                .iter()
                .map(|&(name, init)| {
                    let ph = inner.add(TermFunc::Input, vec![Some(init), None]);
                    inner.named(ph, name)
                })
                .collect();
            let iterator = inner.add(TermFunc::LoopIterator, vec![Some(iter_init)]);
            let _done = inner.call(bt.loop_done, &[iterator]);
            let _key = inner.call(bt.loop_key, &[iterator]);
            let element = inner.call(bt.loop_get, &[iterator]);
            let result = body(&mut inner, element, &placeholders);
            let _advance = inner.call(bt.loop_advance, &[iterator]);
            if let Some(result) = result {
                inner.output(result);
            }
            placeholders
        };

        // Looped values feed back from the latest same-named term.
        for (i, &(name, _)) in loops.iter().enumerate() {
            let last = self
                .graph
                .find_name_at(NameLoc::EndOfBlock(loop_block), name)
                .unwrap_or(placeholders[i]);
            self.graph.term_mut(placeholders[i]).inputs[1] = Some(last);
        }
        for i in 0..loops.len() {
            self.add(TermFunc::ExtraOutput(i + 1), vec![Some(t)]);
        }
        t
    }

    /// Condition-at-top loop. The body callback must call
    /// [`BlockBuilder::loop_condition`] once to mark the exit test.
    pub fn while_loop(
        &mut self,
        loops: &[(&str, TermId)],
        body: impl FnOnce(&mut BlockBuilder, &[TermId]),
    ) -> TermId {
        let outer = self.block;
        let loop_block = self.graph.add_block(BlockKind::WhileLoop, Some(outer));
        let t = self.add(TermFunc::WhileLoop, vec![]);
        self.graph.term_mut(t).contents = Some(loop_block);
        self.graph.block_mut(loop_block).owner = Some(t);

        let placeholders = {
            let mut inner = BlockBuilder {
                graph: &mut *self.graph,
                block: loop_block,
            };
            let placeholders: Vec<TermId> = loops
                .iter()
                .map(|&(name, init)| {
                    let ph = inner.add(TermFunc::Input, vec![Some(init), None]);
                    inner.named(ph, name)
                })
                .collect();
            body(&mut inner, &placeholders);
            placeholders
        };

        for (i, &(name, _)) in loops.iter().enumerate() {
            let last = self
                .graph
                .find_name_at(NameLoc::EndOfBlock(loop_block), name)
                .unwrap_or(placeholders[i]);
            self.graph.term_mut(placeholders[i]).inputs[1] = Some(last);
        }
        for i in 0..loops.len() {
            self.add(TermFunc::ExtraOutput(i + 1), vec![Some(t)]);
        }
        t
    }

    pub fn loop_condition(&mut self, cond: TermId) -> TermId {
        self.add(TermFunc::LoopConditionBool, vec![Some(cond)])
    }

    /// Two-arm conditional. Each arm returns its result term; if either
    /// arm produces a value the conditional produces one (a missing side
    /// yields null).
    pub fn if_else(
        &mut self,
        cond: TermId,
        then_arm: impl FnOnce(&mut BlockBuilder) -> Option<TermId>,
        else_arm: impl FnOnce(&mut BlockBuilder) -> Option<TermId>,
    ) -> TermId {
        let outer = self.block;
        let cond_block = self.graph.add_block(BlockKind::Conditional, Some(outer));
        let t = self.add(TermFunc::Conditional, vec![]);
        self.graph.term_mut(t).contents = Some(cond_block);
        self.graph.block_mut(cond_block).owner = Some(t);

        let mut make_case = |graph: &mut Graph, condition: Option<TermId>| {
            let case_block = graph.add_block(BlockKind::Case, Some(cond_block));
            let case_term = graph.add_term(cond_block, TermFunc::Case, vec![]);
            graph.term_mut(case_term).contents = Some(case_block);
            let bd = graph.block_mut(case_block);
            bd.owner = Some(case_term);
            bd.case_condition = condition;
            case_block
        };
        let case0 = make_case(self.graph, Some(cond));
        let case1 = make_case(self.graph, None);
        let r0 = then_arm(&mut BlockBuilder {
            graph: &mut *self.graph,
            block: case0,
        });
        let r1 = else_arm(&mut BlockBuilder {
            graph: &mut *self.graph,
            block: case1,
        });
        if r0.is_some() || r1.is_some() {
            for (case_block, r) in [(case0, r0), (case1, r1)] {
                let mut inner = BlockBuilder {
                    graph: &mut *self.graph,
                    block: case_block,
                };
                let result = match r {
                    Some(r) => r,
                    None => inner.value(Val::Null),
                };
                inner.output(result);
            }
            self.graph.add_term(cond_block, TermFunc::Output, vec![None]);
        }
        t
    }
}
