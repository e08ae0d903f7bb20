//! Lowering from the program graph to bytecode, one major block at a time.
//!
//! Slot allocation is liveness-as-metadata: nothing is ever freed inside
//! a frame, and "where does term X live right now" is answered by
//! scanning the metadata log backward for the nearest `TermLive` record.
//! Forward jumps (break, continue, next-case, conditional-done) are
//! recorded unresolved and patched when their target address is known;
//! a finished block has none left.
//!
//! Compilation never recurses into callees. A call to a block with no
//! code yet becomes `UncompiledCall`, which the VM patches in place the
//! first time it executes.

use tracing::trace;

use super::bytecode::{BlockEntry, Bytecode, Mop, Mopcode, Opcode};
use crate::graph::{BlockId, BlockKind, Graph, NameLoc, TermFunc, TermId};
use crate::util::fast_map::FastHashMap;
use crate::val::{TypeTag, Val};

/// Compile `block` into `bc` if it isn't there yet; returns its address.
pub fn find_or_compile(bc: &mut Bytecode, graph: &Graph, block: BlockId) -> u32 {
    match bc.block_to_addr.get(&block) {
        Some(BlockEntry::At(addr)) => return *addr,
        Some(BlockEntry::InProgress) => {
            panic!("internal error: recursive compile of block {}", block.index())
        }
        None => {}
    }
    bc.block_to_addr.insert(block, BlockEntry::InProgress);
    let unit = Compiler::new(graph, bc, block).compile();
    let addr = bc.append_unit(block, unit);
    trace!(block = block.index(), addr, "compiled major block");
    addr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpKind {
    Break,
    Continue,
    NextCase,
    ConditionalDone,
}

struct Unresolved {
    addr: u32,
    kind: JumpKind,
    /// The conditional block a NextCase/ConditionalDone belongs to, so
    /// nested chains don't steal each other's jumps.
    block: Option<BlockId>,
}

#[derive(Debug, Default, Clone, Copy)]
struct MinorBlockInfo {
    first_local_slot: u16,
    iterator_slot: u16,
    output_slot: u16,
    produce_output: bool,
}

struct Compiler<'a> {
    graph: &'a Graph,
    /// The shared buffer, read for already-compiled ancestors (cross
    /// frame loads and direct call addresses). Never written here.
    assembled: &'a Bytecode,
    /// The private per-block buffer being built.
    bc: Bytecode,
    major: BlockId,
    unresolved: Vec<Unresolved>,
    minor_info: FastHashMap<BlockId, MinorBlockInfo>,
}

impl<'a> Compiler<'a> {
    fn new(graph: &'a Graph, assembled: &'a Bytecode, block: BlockId) -> Compiler<'a> {
        let mut bc = Bytecode::new();
        bc.verbose = assembled.verbose;
        bc.no_save_state = assembled.no_save_state;
        bc.no_effect = assembled.no_effect;
        Compiler {
            graph,
            assembled,
            bc,
            major: block,
            unresolved: Vec::new(),
            minor_info: FastHashMap::default(),
        }
    }

    fn compile(mut self) -> Bytecode {
        let block = self.major;
        self.comment(|g| format!("block {}: {}", block.index(), block_name(g, block)));
        let start_maddr = self.bc.append_metadata(Mop {
            mopcode: Mopcode::MajorBlockStart,
            addr: 0,
            slot: 0,
            related: 0,
            term: None,
            block: Some(block),
        });
        let grow_addr = self.bc.append_op(Opcode::GrowFrame, 0, 0, 0);
        self.major_block_contents(block);
        self.bc.ops[grow_addr as usize].a = self.bc.slot_count;
        self.bc.append_metadata(Mop {
            mopcode: Mopcode::MajorBlockEnd,
            addr: 0,
            slot: 0,
            related: start_maddr,
            term: None,
            block: Some(block),
        });
        assert!(
            self.unresolved.is_empty(),
            "internal error: unresolved jumps left after compiling block {}",
            block.index()
        );
        self.bc
    }

    fn major_block_contents(&mut self, block: BlockId) {
        self.bc.slot_count = 1; // slot 0 is the output
        self.handle_function_inputs(block);
        if let Some(native) = self.graph.block(block).native {
            self.bc.append_op(Opcode::Native, native, 0, 0);
            self.bc.append_op(Opcode::RetOrStop, 0, 0, 0);
            return;
        }
        let stateful = self.should_write_state_header(block);
        if stateful {
            self.bc.append_op(Opcode::PushStateFrame, 0, 0, 0);
        }
        for &t in &self.graph.block(block).terms {
            self.write_term(t);
        }
        self.close_state_frame(block, None);
        let result = self
            .graph
            .output_placeholder(block, 0)
            .and_then(|p| self.graph.term(p).input(0));
        self.set_subroutine_output(block, result);
        self.bc.append_op(Opcode::RetOrStop, 0, 0, 0);
    }

    /// Inputs arrive in slots 1.. from the caller; record their liveness,
    /// apply declared-type casts, and splat upvalues for closure bodies.
    fn handle_function_inputs(&mut self, block: BlockId) {
        let placeholders = self.graph.input_placeholders(block);
        let variadic = self.graph.block(block).variadic;
        for (i, &ph) in placeholders.iter().enumerate() {
            let slot = (1 + i) as u16;
            self.bc.slot_count = slot + 1;
            if variadic && i == placeholders.len() - 1 {
                self.bc.append_op(Opcode::VarargsToList, i as u16, 0, 0);
                self.bc.append_liveness(ph, slot);
                break;
            }
            let ty = self.graph.term(ph).declared_type;
            if ty != TypeTag::Any {
                self.cast_fixed_type(slot, ty);
            }
            self.bc.append_liveness(ph, slot);
        }
        let upvalues = self.graph.upvalue_placeholders(block);
        if !upvalues.is_empty() {
            let n = upvalues.len() as u16;
            let first = self.reserve_slots(n);
            self.bc.append_op(Opcode::SplatUpvalues, first, n, 0);
            for (i, &uv) in upvalues.iter().enumerate() {
                self.bc.append_liveness(uv, first + i as u16);
            }
        }
    }

    fn reserve_slots(&mut self, n: u16) -> u16 {
        let first = self.bc.slot_count;
        self.bc.slot_count += n;
        first
    }

    /// Reserve the stack shape for a nested call frame: two saved-state
    /// slots, the output slot at `top`, and the input row above it.
    fn reserve_new_frame_slots(&mut self, input_count: u16) -> u16 {
        let top = self.bc.slot_count + 2;
        self.bc.slot_count += input_count + 3;
        top
    }

    /// Materialize a term's value in `slot`.
    fn load_term(&mut self, term: Option<TermId>, slot: u16) {
        let Some(t) = term else {
            self.bc.append_op(Opcode::SetNull, slot, 0, 0);
            return;
        };
        let td = self.graph.term(t);
        if td.is_exit() {
            self.bc.append_op(Opcode::SetNull, slot, 0, 0);
            return;
        }
        if let Some(live) = self.bc.find_live_slot(t) {
            if live != slot {
                self.bc.append_op(Opcode::Copy, live, slot, 0);
            }
            return;
        }
        if td.func == TermFunc::Value {
            let v = td.value.clone().unwrap_or(Val::Null);
            match v {
                Val::Int(i) if (0..=u16::MAX as i64).contains(&i) => {
                    self.bc.append_op(Opcode::LoadInt, i as u16, slot, 0);
                }
                v => {
                    let c = self.bc.append_const(v);
                    self.bc.append_op(Opcode::LoadConst, c, slot, 0);
                }
            }
            return;
        }
        self.load_outer(t, slot);
    }

    /// Cross-frame load: the term lives in a lexically enclosing major
    /// block. Count the frame distance and resolve the source slot from
    /// the ancestor's recorded liveness in the assembled buffer.
    fn load_outer(&mut self, t: TermId, slot: u16) {
        let owner_major = self.graph.major_block_of(t);
        let mut distance: u16 = 0;
        let mut cur = self.major;
        while cur != owner_major {
            cur = match self.graph.parent_major_block(cur) {
                Some(p) => p,
                None => panic!(
                    "internal error: term {} is not reachable from block {}",
                    t.index(),
                    self.major.index()
                ),
            };
            distance += 1;
        }
        if distance == 0 {
            panic!("internal error: term {} has no live slot", t.index());
        }
        let src = match self.assembled.find_live_slot_in_block(owner_major, t) {
            Some(s) => s,
            None => panic!(
                "internal error: no recorded slot for term {} in block {}",
                t.index(),
                owner_major.index()
            ),
        };
        self.bc.append_op(Opcode::CopyUp, distance, src, slot);
    }

    /// Emit a call to `target`: direct if its code is already assembled,
    /// otherwise an uncompiled call the VM patches on first execution.
    fn call(&mut self, top: u16, count: u16, target: BlockId) {
        if let Some(addr) = self.assembled.find_compiled(target) {
            self.bc.append_op(Opcode::Call, top, count, addr as u16);
        } else {
            let c = self.bc.append_const(Val::Block(target));
            self.bc.append_op(Opcode::UncompiledCall, top, count, c);
        }
    }

    fn cast_fixed_type(&mut self, slot: u16, ty: TypeTag) {
        let c = self.bc.append_const(Val::Type(ty));
        self.bc.append_op(Opcode::CastFixedType, slot, c, 0);
    }

    fn comment(&mut self, text: impl FnOnce(&Graph) -> String) {
        if !self.bc.verbose {
            return;
        }
        let c = self.bc.append_const(Val::str(text(self.graph)));
        self.bc.append_op(Opcode::Comment, c, 0, 0);
    }

    fn should_write_state_header(&self, block: BlockId) -> bool {
        let bd = self.graph.block(block);
        if bd.native.is_some() || bd.kind == BlockKind::WhileLoop {
            return false;
        }
        self.graph.block_has_state(block)
    }

    fn write_term(&mut self, t: TermId) {
        let td = self.graph.term(t);
        if td.needs_no_evaluation() {
            return;
        }
        self.comment(|g| format!("term {}: {:?}", g.unique_name(t), g.term(t).func));
        let start_maddr = self.bc.append_metadata(Mop {
            mopcode: Mopcode::TermEvalStart,
            addr: 0,
            slot: 0,
            related: 0,
            term: Some(t),
            block: None,
        });
        match td.func.clone() {
            TermFunc::Call(target) => {
                if !self.try_inline(t, target) {
                    self.write_normal_call(t, target);
                }
            }
            TermFunc::DynMethod(name) => self.write_dyn_method(t, &name),
            TermFunc::FuncCall => self.write_func_call(t),
            TermFunc::FuncApply => self.write_func_apply(t),
            TermFunc::Closure => self.write_closure_value(t),
            TermFunc::ForLoop | TermFunc::WhileLoop => {
                let contents = self.contents_of(t);
                self.write_loop(contents);
            }
            TermFunc::LoopConditionBool => self.write_loop_condition(t),
            TermFunc::Conditional => self.write_conditional_chain(t),
            TermFunc::Break => self.write_break(t),
            TermFunc::Continue => self.write_continue(t),
            TermFunc::Discard => self.write_discard(t),
            TermFunc::Return => self.write_return(t),
            TermFunc::DeclaredState => self.write_declared_state(t),
            TermFunc::Case => panic!("internal error: case term outside a conditional"),
            TermFunc::Value
            | TermFunc::Input
            | TermFunc::Output
            | TermFunc::Upvalue
            | TermFunc::LoopIterator
            | TermFunc::ExtraOutput(_) => unreachable!(),
        }
        self.bc.append_metadata(Mop {
            mopcode: Mopcode::TermEvalEnd,
            addr: 0,
            slot: 0,
            related: start_maddr,
            term: Some(t),
            block: None,
        });
    }

    fn contents_of(&self, t: TermId) -> BlockId {
        match self.graph.term(t).contents {
            Some(c) => c,
            None => panic!("internal error: term {} has no contents block", t.index()),
        }
    }

    /// Int arithmetic on statically-int operands compiles to a single
    /// op instead of a frame and a native call. Must stay semantically
    /// identical to the library function it replaces.
    fn try_inline(&mut self, t: TermId, target: BlockId) -> bool {
        let bt = self.graph.builtins();
        let opcode = if target == bt.add {
            Opcode::AddInt
        } else if target == bt.sub {
            Opcode::SubInt
        } else if target == bt.mult {
            Opcode::MultInt
        } else if target == bt.div_i {
            Opcode::DivInt
        } else {
            return false;
        };
        let td = self.graph.term(t);
        if td.inputs.len() != 2 {
            return false;
        }
        let (Some(a), Some(b)) = (td.input(0), td.input(1)) else {
            return false;
        };
        if self.graph.term(a).declared_type != TypeTag::Int
            || self.graph.term(b).declared_type != TypeTag::Int
        {
            return false;
        }
        let top = self.reserve_slots(3);
        self.load_term(Some(a), top);
        self.load_term(Some(b), top + 1);
        self.bc.append_op(opcode, top, top + 1, top + 2);
        self.bc.append_liveness(t, top + 2);
        true
    }

    fn write_normal_call(&mut self, t: TermId, target: BlockId) {
        if self.bc.no_effect && self.graph.block(target).has_effects {
            let slot = self.reserve_slots(1);
            self.bc.append_op(Opcode::SetNull, slot, 0, 0);
            self.bc.append_liveness(t, slot);
            return;
        }
        let inputs = self.graph.term(t).inputs.clone();
        let count = inputs.len() as u16;
        let top = self.reserve_new_frame_slots(count);
        for (i, input) in inputs.iter().enumerate() {
            self.load_term(*input, top + 1 + i as u16);
        }
        self.call(top, count, target);
        self.bc.append_liveness(t, top);
    }

    fn write_dyn_method(&mut self, t: TermId, name: &str) {
        let inputs = self.graph.term(t).inputs.clone();
        let count = inputs.len() as u16;
        let top = self.reserve_new_frame_slots(count);
        for (i, input) in inputs.iter().enumerate() {
            self.load_term(*input, top + 1 + i as u16);
        }
        let c = self.bc.append_const(Val::str(name));
        self.bc.append_op(Opcode::DynMethod, top, count, c);
        self.bc.append_liveness(t, top);
    }

    fn write_func_call(&mut self, t: TermId) {
        let inputs = self.graph.term(t).inputs.clone();
        let count = (inputs.len() - 1) as u16;
        let top = self.reserve_new_frame_slots(count);
        for (i, input) in inputs[1..].iter().enumerate() {
            self.load_term(*input, top + 1 + i as u16);
        }
        // The closure rides in the output slot until the call replaces it.
        self.load_term(inputs[0], top);
        self.bc.append_op(Opcode::FuncCallD, top, count, 0);
        self.bc.append_liveness(t, top);
    }

    fn write_func_apply(&mut self, t: TermId) {
        let td = self.graph.term(t);
        let (func, list) = (td.input(0), td.input(1));
        let top = self.reserve_new_frame_slots(2);
        self.load_term(func, top + 1);
        self.load_term(list, top + 2);
        self.bc.append_op(Opcode::FuncApplyD, top, 0, 0);
        self.bc.append_liveness(t, top);
    }

    fn write_closure_value(&mut self, t: TermId) {
        let body = self.contents_of(t);
        let block_slot = self.reserve_slots(1);
        let upvalues = self.graph.upvalue_placeholders(body);
        let n = upvalues.len() as u16;
        let first = self.reserve_slots(n.max(1));
        for (i, &uv) in upvalues.iter().enumerate() {
            let captured = self.graph.term(uv).input(0);
            self.load_term(captured, first + i as u16);
        }
        self.bc.append_op(Opcode::MakeList, first, n, 0);
        let c = self.bc.append_const(Val::Block(body));
        self.bc.append_op(Opcode::LoadConst, c, block_slot, 0);
        self.bc.append_op(Opcode::MakeFunc, block_slot, first, 0);
        self.bc.append_liveness(t, block_slot);
    }

    // Loops.

    fn write_loop(&mut self, loop_block: BlockId) {
        let owner = match self.graph.block(loop_block).owner {
            Some(o) => o,
            None => panic!("internal error: loop block {} has no owner", loop_block.index()),
        };
        let is_for = self.graph.block(loop_block).kind == BlockKind::ForLoop;
        let stateful = self.should_write_state_header(loop_block);
        if stateful {
            self.write_state_header_named(owner);
        }
        let produce_output = self
            .graph
            .output_placeholder(loop_block, 0)
            .is_some_and(|p| self.graph.term(p).input(0).is_some());

        let placeholders = self.graph.input_placeholders(loop_block);
        let first_local = self.reserve_slots(placeholders.len() as u16);
        for (i, &ph) in placeholders.iter().enumerate() {
            let init = self.graph.term(ph).input(0);
            self.load_term(init, first_local + i as u16);
            self.bc.append_liveness(ph, first_local + i as u16);
        }

        let mut info = MinorBlockInfo {
            first_local_slot: first_local,
            ..Default::default()
        };
        if is_for {
            let iterator = match self.graph.loop_iterator(loop_block) {
                Some(it) => it,
                None => panic!("internal error: for loop {} has no iterator", loop_block.index()),
            };
            let it_slot = self.reserve_slots(1);
            let init = self.graph.term(iterator).input(0);
            self.load_term(init, it_slot);
            self.bc.append_liveness(iterator, it_slot);
            info.iterator_slot = it_slot;
        }
        if produce_output {
            let out_top = self.reserve_new_frame_slots(1);
            self.bc.append_op(Opcode::LoadInt, 0, out_top + 1, 0);
            self.call(out_top, 1, self.graph.builtins().blank_list);
            info.output_slot = out_top;
            info.produce_output = true;
        }
        self.minor_info.insert(loop_block, info);

        let loop_start = self.bc.next_addr();
        let done = self.graph.loop_done_call(loop_block);
        let key = self.graph.loop_key_call(loop_block);
        let advance = self.graph.loop_advance_call(loop_block);
        if is_for {
            let done_term = match done {
                Some(d) => d,
                None => panic!("internal error: for loop {} has no done check", loop_block.index()),
            };
            self.write_term(done_term);
            let done_slot = match self.bc.find_live_slot(done_term) {
                Some(s) => s,
                None => panic!("internal error: loop done check has no slot"),
            };
            let addr = self.bc.append_op(Opcode::JumpIf, done_slot, 0, 0);
            self.unresolved.push(Unresolved {
                addr,
                kind: JumpKind::Break,
                block: None,
            });
            if let Some(key_term) = key {
                self.write_term(key_term);
                if stateful {
                    let key_slot = match self.bc.find_live_slot(key_term) {
                        Some(s) => s,
                        None => panic!("internal error: loop key has no slot"),
                    };
                    self.bc.append_op(Opcode::PushStateFrameDKey, key_slot, 0, 0);
                }
            }
        }

        for &t in &self.graph.block(loop_block).terms {
            if Some(t) == done || Some(t) == key || Some(t) == advance {
                continue;
            }
            self.write_term(t);
        }

        self.close_state_frame(loop_block, None);
        if is_for {
            self.loop_advance_iterator(loop_block);
        }
        self.loop_move_locals_back(loop_block, None);
        self.loop_preserve_iteration_result(loop_block);
        self.bc.append_op(Opcode::Jump, 0, 0, loop_start as u16);
        let loop_fin = self.bc.next_addr();
        self.resolve_jumps(JumpKind::Continue, None, loop_start, loop_start);
        self.resolve_jumps(JumpKind::Break, None, loop_start, loop_fin);

        if info.produce_output {
            self.bc.append_liveness(owner, info.output_slot);
        }
        for i in 0..placeholders.len() {
            if let Some(extra) = self.graph.extra_output(owner, i + 1) {
                self.bc.append_liveness(extra, first_local + i as u16);
            }
        }
        if stateful {
            self.bc.append_op(Opcode::PopStateFrame, 0, 0, 0);
        }
    }

    fn loop_advance_iterator(&mut self, loop_block: BlockId) {
        let advance = match self.graph.loop_advance_call(loop_block) {
            Some(a) => a,
            None => panic!("internal error: for loop {} has no advance", loop_block.index()),
        };
        self.write_term(advance);
        let slot = match self.bc.find_live_slot(advance) {
            Some(s) => s,
            None => panic!("internal error: loop advance has no slot"),
        };
        let info = self.minor_info[&loop_block];
        if slot != info.iterator_slot {
            self.bc.append_op(Opcode::Copy, slot, info.iterator_slot, 0);
        }
        if let Some(it) = self.graph.loop_iterator(loop_block) {
            self.bc.append_liveness(it, info.iterator_slot);
        }
    }

    /// Re-seed looped values for the next iteration from the latest
    /// same-named term (or the placeholder's declared feedback input when
    /// closing the iteration normally).
    fn loop_move_locals_back(&mut self, loop_block: BlockId, at_term: Option<TermId>) {
        let info = self.minor_info[&loop_block];
        let placeholders = self.graph.input_placeholders(loop_block);
        for (i, &ph) in placeholders.iter().enumerate() {
            let slot = info.first_local_slot + i as u16;
            let source = match at_term {
                None => self.graph.term(ph).input(1),
                Some(at) => match self.graph.term(ph).name.clone() {
                    Some(name) => self.graph.find_name_at(NameLoc::Before(at), &name),
                    None => self.graph.term(ph).input(1),
                },
            }
            .or(Some(ph));
            self.load_term(source, slot);
            self.bc.append_liveness(ph, slot);
        }
    }

    fn loop_preserve_iteration_result(&mut self, loop_block: BlockId) {
        let info = self.minor_info[&loop_block];
        if !info.produce_output {
            return;
        }
        let result = self
            .graph
            .output_placeholder(loop_block, 0)
            .and_then(|p| self.graph.term(p).input(0));
        let top = self.reserve_new_frame_slots(2);
        self.bc.append_op(Opcode::Copy, info.output_slot, top + 1, 0);
        self.load_term(result, top + 2);
        self.call(top, 2, self.graph.builtins().list_append);
        self.bc.append_op(Opcode::Copy, top, info.output_slot, 0);
    }

    fn write_loop_condition(&mut self, t: TermId) {
        let cond = self.graph.term(t).input(0);
        let slot = self.reserve_slots(1);
        self.load_term(cond, slot);
        if cond.map(|c| self.graph.term(c).declared_type) != Some(TypeTag::Bool) {
            self.cast_fixed_type(slot, TypeTag::Bool);
        }
        let addr = self.bc.append_op(Opcode::JumpIfNot, slot, 0, 0);
        self.unresolved.push(Unresolved {
            addr,
            kind: JumpKind::Break,
            block: None,
        });
    }

    // Conditionals.

    fn write_conditional_chain(&mut self, t: TermId) {
        let cond_block = self.contents_of(t);
        let start = self.bc.next_addr();
        let stateful = self.should_write_state_header(cond_block);
        if stateful {
            self.write_state_header_named(t);
        }
        let outputs = self.graph.output_placeholders(cond_block);
        let first_output = self.reserve_slots(outputs.len() as u16);
        self.minor_info.insert(
            cond_block,
            MinorBlockInfo {
                first_local_slot: first_output,
                ..Default::default()
            },
        );
        let mut case_index = 0u16;
        for &case_term in &self.graph.block(cond_block).terms.clone() {
            if self.graph.term(case_term).func == TermFunc::Case {
                self.write_conditional_case(case_term, case_index);
                case_index += 1;
            }
        }
        let fin = self.bc.next_addr();
        self.resolve_jumps(JumpKind::NextCase, Some(cond_block), start, fin);
        self.resolve_jumps(JumpKind::ConditionalDone, Some(cond_block), start, fin);
        self.close_state_frame(cond_block, None);
        for (i, _) in outputs.iter().enumerate() {
            if let Some(out_term) = self.graph.extra_output(t, i) {
                self.bc.append_liveness(out_term, first_output + i as u16);
            }
        }
    }

    fn write_conditional_case(&mut self, case_term: TermId, index: u16) {
        let case_block = self.contents_of(case_term);
        let cond_block = self.graph.term(case_term).owner;
        let case_start = self.bc.next_addr();
        self.resolve_jumps(JumpKind::NextCase, Some(cond_block), 0, case_start);

        if let Some(cond) = self.graph.block(case_block).case_condition {
            let slot = self.reserve_slots(1);
            self.load_term(Some(cond), slot);
            if self.graph.term(cond).declared_type != TypeTag::Bool {
                self.cast_fixed_type(slot, TypeTag::Bool);
            }
            let addr = self.bc.append_op(Opcode::JumpIfNot, slot, 0, 0);
            self.unresolved.push(Unresolved {
                addr,
                kind: JumpKind::NextCase,
                block: Some(cond_block),
            });
        }
        if self.should_write_state_header(case_block) {
            let key_slot = self.reserve_slots(1);
            self.bc.append_op(Opcode::LoadInt, index, key_slot, 0);
            self.bc.append_op(Opcode::PushStateFrameDKey, key_slot, 0, 0);
        }
        for &t in &self.graph.block(case_block).terms.clone() {
            self.write_term(t);
        }
        self.close_conditional_case(case_term, case_block);
        let addr = self.bc.append_op(Opcode::Jump, 0, 0, 0);
        self.unresolved.push(Unresolved {
            addr,
            kind: JumpKind::ConditionalDone,
            block: Some(cond_block),
        });
    }

    /// Save and pop the case's state frame, then move the case's outputs
    /// into the chain's shared output slots.
    fn close_conditional_case(&mut self, case_term: TermId, case_block: BlockId) {
        self.close_state_frame(case_block, None);
        let cond_block = self.graph.term(case_term).owner;
        let info = self.minor_info[&cond_block];
        for (i, &ph) in self.graph.output_placeholders(case_block).iter().enumerate() {
            let result = self.graph.term(ph).input(0);
            self.load_term(result, info.first_local_slot + i as u16);
        }
    }

    // State.

    /// Push a state frame keyed by a term's unique name (loops and
    /// conditionals; the key is a compile-time constant).
    fn write_state_header_named(&mut self, owner: TermId) {
        let key_slot = self.reserve_slots(1);
        let c = self.bc.append_const(Val::Str(self.graph.unique_name(owner)));
        self.bc.append_op(Opcode::LoadConst, c, key_slot, 0);
        self.bc.append_op(Opcode::PushStateFrameDKey, key_slot, 0, 0);
    }

    fn write_declared_state(&mut self, t: TermId) {
        let name = match self.graph.term(t).name.clone() {
            Some(n) => n,
            None => panic!("internal error: declared state term {} has no name", t.index()),
        };
        let name_slot = self.reserve_slots(1);
        let c = self.bc.append_const(Val::Str(name));
        self.bc.append_op(Opcode::LoadConst, c, name_slot, 0);
        let top = self.reserve_new_frame_slots(2);
        self.bc.append_op(Opcode::GetStateValue, name_slot, top + 1, 0);
        let initial = self.graph.term(t).input(0);
        self.load_term(initial, top + 2);
        self.call(top, 2, self.graph.builtins().declared_state);
        self.bc.append_liveness(t, top);
    }

    /// Persist each declared-state slot of `block` under its name, using
    /// the latest same-named term visible at the exit point.
    fn save_declared_state(&mut self, block: BlockId, at_term: Option<TermId>) {
        if self.bc.no_save_state {
            return;
        }
        for &t in &self.graph.block(block).terms.clone() {
            if self.graph.term(t).func != TermFunc::DeclaredState {
                continue;
            }
            let Some(name) = self.graph.term(t).name.clone() else {
                continue;
            };
            let loc = match at_term {
                Some(at) => NameLoc::Before(at),
                None => NameLoc::EndOfBlock(block),
            };
            let result = self.graph.find_name_at(loc, &name).unwrap_or(t);
            let key_slot = self.reserve_slots(2);
            let c = self.bc.append_const(Val::Str(name));
            self.bc.append_op(Opcode::LoadConst, c, key_slot, 0);
            self.load_term(Some(result), key_slot + 1);
            self.bc.append_op(Opcode::SaveStateValue, key_slot, key_slot + 1, 0);
        }
    }

    fn close_state_frame(&mut self, block: BlockId, at_term: Option<TermId>) {
        if !self.should_write_state_header(block) {
            return;
        }
        self.save_declared_state(block, at_term);
        self.bc.append_op(Opcode::PopStateFrame, 0, 0, 0);
    }

    // Early exits. Each one compiles the full save-and-pop sequence for
    // every state frame between the exit term and its target block; the
    // VM never unwinds at runtime.

    /// Pop the frames of every minor block between `t` and `until`,
    /// exclusive of `until` itself.
    fn pop_frames_for_early_exit(&mut self, t: TermId, until: BlockId, discard: bool) {
        let mut b = self.graph.term(t).owner;
        while b != until {
            let kind = self.graph.block(b).kind;
            if self.should_write_state_header(b) {
                if discard {
                    self.bc.append_op(Opcode::PopDiscardStateFrame, 0, 0, 0);
                } else {
                    self.close_state_frame(b, Some(t));
                }
                // Loops passed through hold a second, named frame.
                if matches!(kind, BlockKind::ForLoop | BlockKind::WhileLoop) {
                    let op = if discard {
                        Opcode::PopDiscardStateFrame
                    } else {
                        Opcode::PopStateFrame
                    };
                    self.bc.append_op(op, 0, 0, 0);
                }
            }
            b = match self.graph.block(b).parent {
                Some(p) => p,
                None => panic!("internal error: exit target not found walking up from term {}", t.index()),
            };
        }
    }

    fn enclosing_loop_of(&self, t: TermId) -> BlockId {
        match self.graph.enclosing_loop(t) {
            Some(b) => b,
            None => panic!("internal error: loop exit term {} outside a loop", t.index()),
        }
    }

    fn write_break(&mut self, t: TermId) {
        let loop_block = self.enclosing_loop_of(t);
        self.pop_frames_for_early_exit(t, loop_block, false);
        self.close_state_frame(loop_block, Some(t));
        self.loop_move_locals_back(loop_block, Some(t));
        let addr = self.bc.append_op(Opcode::Jump, 0, 0, 0);
        self.unresolved.push(Unresolved {
            addr,
            kind: JumpKind::Break,
            block: None,
        });
    }

    fn write_continue(&mut self, t: TermId) {
        let loop_block = self.enclosing_loop_of(t);
        self.pop_frames_for_early_exit(t, loop_block, false);
        self.close_state_frame(loop_block, Some(t));
        if self.graph.block(loop_block).kind == BlockKind::ForLoop {
            self.loop_advance_iterator(loop_block);
        }
        self.loop_move_locals_back(loop_block, Some(t));
        self.loop_preserve_iteration_result(loop_block);
        let addr = self.bc.append_op(Opcode::Jump, 0, 0, 0);
        self.unresolved.push(Unresolved {
            addr,
            kind: JumpKind::Continue,
            block: None,
        });
    }

    /// Like continue, but the iteration's state frame is dropped without
    /// merging, so this iteration leaves no trace in persisted state.
    fn write_discard(&mut self, t: TermId) {
        let loop_block = self.enclosing_loop_of(t);
        self.pop_frames_for_early_exit(t, loop_block, true);
        if self.should_write_state_header(loop_block) {
            self.bc.append_op(Opcode::PopDiscardStateFrame, 0, 0, 0);
        }
        if self.graph.block(loop_block).kind == BlockKind::ForLoop {
            self.loop_advance_iterator(loop_block);
        }
        self.loop_move_locals_back(loop_block, Some(t));
        self.loop_preserve_iteration_result(loop_block);
        let addr = self.bc.append_op(Opcode::Jump, 0, 0, 0);
        self.unresolved.push(Unresolved {
            addr,
            kind: JumpKind::Continue,
            block: None,
        });
    }

    fn write_return(&mut self, t: TermId) {
        let major = self.major;
        self.pop_frames_for_early_exit(t, major, false);
        self.close_state_frame(major, Some(t));
        self.set_subroutine_output(major, self.graph.term(t).input(0));
        self.bc.append_op(Opcode::RetOrStop, 0, 0, 0);
    }

    fn set_subroutine_output(&mut self, block: BlockId, result: Option<TermId>) {
        self.load_term(result, 0);
        if let Some(ph) = self.graph.output_placeholder(block, 0) {
            let ty = self.graph.term(ph).declared_type;
            if ty != TypeTag::Any {
                self.cast_fixed_type(0, ty);
            }
        }
    }

    /// Patch every pending jump of `kind` at or after `after` (and for
    /// conditional jumps, belonging to `block`) to `target`.
    fn resolve_jumps(&mut self, kind: JumpKind, block: Option<BlockId>, after: u32, target: u32) {
        let mut kept = Vec::new();
        for u in std::mem::take(&mut self.unresolved) {
            let hit = u.kind == kind && u.addr >= after && (block.is_none() || u.block == block);
            if hit {
                self.bc.ops[u.addr as usize].c = target as u16;
            } else {
                kept.push(u);
            }
        }
        self.unresolved = kept;
    }
}

fn block_name(graph: &Graph, block: BlockId) -> String {
    match &graph.block(block).name {
        Some(n) => n.to_string(),
        None => String::from("<anon>"),
    }
}
