//! Bytecode containers: the op record, the metadata log, and buffer
//! assembly with relocation.
//!
//! Compilation happens one major block at a time into a private buffer;
//! [`Bytecode::append_unit`] splices a finished buffer onto the shared
//! one, shifting const indices and op addresses exactly once. The
//! metadata log is the source of truth for slot liveness (the compiler
//! re-derives "where does term X live" by scanning it backward) and for
//! attributing a pc to a term or block after the fact.

use std::fmt;

use crate::graph::{BlockId, TermId};
use crate::util::fast_map::FastHashMap;
use crate::val::Val;

/// One instruction. Operand meaning depends on the opcode; addresses and
/// const-pool indices both ride in `u16`, which caps a buffer at 65535
/// ops and consts.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub opcode: Opcode,
    pub a: u16,
    pub b: u16,
    pub c: u16,
}

impl Op {
    pub fn new(opcode: Opcode, a: u16, b: u16, c: u16) -> Op {
        Op { opcode, a, b, c }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Nope,
    /// a=top, b=input count, c=const holding the target block ref.
    /// Patched in place to `Call` by the VM on first execution.
    UncompiledCall,
    /// a=top, b=input count, c=absolute address in the assembled buffer.
    Call,
    /// Dynamic closure call: a=top (closure in slot `top`), b=input count.
    FuncCallD,
    /// Closure apply: a=top, closure at a+1, argument list at a+2.
    FuncApplyD,
    /// a=top, b=input count (receiver at top+1), c=const method name.
    DynMethod,
    /// c=address.
    Jump,
    /// a=condition slot, c=address.
    JumpIf,
    /// a=condition slot, c=address.
    JumpIfNot,
    /// a=frame slot count; first op of every major block.
    GrowFrame,
    /// a=const index, b=slot.
    LoadConst,
    /// a=small non-negative int value, b=slot.
    LoadInt,
    /// a=native table index.
    Native,
    /// Return to the saved frame, or stop the VM if this is the bottom
    /// frame.
    RetOrStop,
    /// Collapse inputs [a..] into a list at input position a.
    VarargsToList,
    /// Copy incoming upvalues into slots a..a+b.
    SplatUpvalues,
    /// a=source slot, b=destination slot.
    Copy,
    /// a=slot.
    SetNull,
    /// Read a slot from an ancestor frame: a=frame distance, b=source
    /// slot in that frame, c=destination slot here.
    CopyUp,
    /// a=slot, b=const holding the target type.
    CastFixedType,
    /// Collapse slots a..a+b into a list at a.
    MakeList,
    /// a=slot holding block ref (result goes here), b=slot holding
    /// bindings list.
    MakeFunc,
    /// a,b=operand slots, c=destination.
    AddInt,
    SubInt,
    MultInt,
    DivInt,
    /// Push a state frame keyed by the calling term's unique name.
    PushStateFrame,
    /// Push a state frame keyed by the value in slot a.
    PushStateFrameDKey,
    PopStateFrame,
    PopDiscardStateFrame,
    /// a=key slot, b=destination slot.
    GetStateValue,
    /// a=key slot, b=value slot.
    SaveStateValue,
    /// a=const holding a diagnostic string; only present in verbose
    /// buffers.
    Comment,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Op { opcode, a, b, c } = *self;
        match opcode {
            Opcode::Nope | Opcode::RetOrStop => write!(f, "{opcode:?}"),
            Opcode::UncompiledCall => write!(f, "UncompiledCall top:{a} inputs:{b} block_const:{c}"),
            Opcode::Call => write!(f, "Call top:{a} inputs:{b} addr:{c}"),
            Opcode::FuncCallD => write!(f, "FuncCallD top:{a} inputs:{b}"),
            Opcode::FuncApplyD => write!(f, "FuncApplyD top:{a}"),
            Opcode::DynMethod => write!(f, "DynMethod top:{a} inputs:{b} name_const:{c}"),
            Opcode::Jump => write!(f, "Jump addr:{c}"),
            Opcode::JumpIf => write!(f, "JumpIf cond:{a} addr:{c}"),
            Opcode::JumpIfNot => write!(f, "JumpIfNot cond:{a} addr:{c}"),
            Opcode::GrowFrame => write!(f, "GrowFrame slots:{a}"),
            Opcode::LoadConst => write!(f, "LoadConst const:{a} -> {b}"),
            Opcode::LoadInt => write!(f, "LoadInt {a} -> {b}"),
            Opcode::Native => write!(f, "Native fn:{a}"),
            Opcode::VarargsToList => write!(f, "VarargsToList from_input:{a}"),
            Opcode::SplatUpvalues => write!(f, "SplatUpvalues first:{a} count:{b}"),
            Opcode::Copy => write!(f, "Copy {a} -> {b}"),
            Opcode::SetNull => write!(f, "SetNull {a}"),
            Opcode::CopyUp => write!(f, "CopyUp dist:{a} src:{b} -> {c}"),
            Opcode::CastFixedType => write!(f, "CastFixedType slot:{a} type_const:{b}"),
            Opcode::MakeList => write!(f, "MakeList first:{a} count:{b}"),
            Opcode::MakeFunc => write!(f, "MakeFunc block:{a} bindings:{b}"),
            Opcode::AddInt => write!(f, "AddInt {a} {b} -> {c}"),
            Opcode::SubInt => write!(f, "SubInt {a} {b} -> {c}"),
            Opcode::MultInt => write!(f, "MultInt {a} {b} -> {c}"),
            Opcode::DivInt => write!(f, "DivInt {a} {b} -> {c}"),
            Opcode::PushStateFrame => write!(f, "PushStateFrame"),
            Opcode::PushStateFrameDKey => write!(f, "PushStateFrameDKey key:{a}"),
            Opcode::PopStateFrame => write!(f, "PopStateFrame"),
            Opcode::PopDiscardStateFrame => write!(f, "PopDiscardStateFrame"),
            Opcode::GetStateValue => write!(f, "GetStateValue key:{a} -> {b}"),
            Opcode::SaveStateValue => write!(f, "SaveStateValue key:{a} value:{b}"),
            Opcode::Comment => write!(f, "Comment const:{a}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mopcode {
    TermEvalStart,
    TermEvalEnd,
    /// Term's value lives in `slot` from this address on.
    TermLive,
    MajorBlockStart,
    MajorBlockEnd,
}

/// Metadata record. `related` links an End back to the metadata index of
/// its matching Start.
#[derive(Debug, Clone, Copy)]
pub struct Mop {
    pub mopcode: Mopcode,
    pub addr: u32,
    pub slot: u16,
    pub related: u32,
    pub term: Option<TermId>,
    pub block: Option<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    /// Being compiled right now; hitting this again is a compiler cycle.
    InProgress,
    At(u32),
}

#[derive(Default)]
pub struct Bytecode {
    pub ops: Vec<Op>,
    pub consts: Vec<Val>,
    pub metadata: Vec<Mop>,
    /// Frame slots used; only meaningful on a per-block compile buffer.
    pub slot_count: u16,
    pub block_to_addr: FastHashMap<BlockId, BlockEntry>,
    pub verbose: bool,
    pub no_save_state: bool,
    pub no_effect: bool,
}

impl Bytecode {
    pub fn new() -> Bytecode {
        Bytecode::default()
    }

    pub fn append_op(&mut self, opcode: Opcode, a: u16, b: u16, c: u16) -> u32 {
        let addr = self.ops.len() as u32;
        self.ops.push(Op::new(opcode, a, b, c));
        addr
    }

    pub fn append_const(&mut self, v: Val) -> u16 {
        let idx = self.consts.len() as u16;
        self.consts.push(v);
        idx
    }

    pub fn next_addr(&self) -> u32 {
        self.ops.len() as u32
    }

    pub fn append_metadata(&mut self, mut mop: Mop) -> u32 {
        mop.addr = self.ops.len() as u32;
        let maddr = self.metadata.len() as u32;
        self.metadata.push(mop);
        maddr
    }

    /// Record that `term` is readable from `slot` from here on.
    pub fn append_liveness(&mut self, term: TermId, slot: u16) {
        self.append_metadata(Mop {
            mopcode: Mopcode::TermLive,
            addr: 0,
            slot,
            related: 0,
            term: Some(term),
            block: None,
        });
    }

    /// Most recent slot binding for `term`, scanning the log backward and
    /// not crossing into a previous major block.
    pub fn find_live_slot(&self, term: TermId) -> Option<u16> {
        for m in self.metadata.iter().rev() {
            match m.mopcode {
                Mopcode::TermLive if m.term == Some(term) => return Some(m.slot),
                Mopcode::MajorBlockStart => return None,
                _ => {}
            }
        }
        None
    }

    /// Liveness lookup inside an already-assembled block's region, used
    /// for cross-frame loads. The last binding in the region wins.
    pub fn find_live_slot_in_block(&self, block: BlockId, term: TermId) -> Option<u16> {
        let mut inside = false;
        let mut found = None;
        for m in &self.metadata {
            match m.mopcode {
                Mopcode::MajorBlockStart => inside = m.block == Some(block),
                Mopcode::MajorBlockEnd => {
                    if inside && m.block == Some(block) {
                        return found;
                    }
                }
                Mopcode::TermLive if inside && m.term == Some(term) => found = Some(m.slot),
                _ => {}
            }
        }
        found
    }

    pub fn find_compiled(&self, block: BlockId) -> Option<u32> {
        match self.block_to_addr.get(&block) {
            Some(BlockEntry::At(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Splice a finished per-block buffer onto this one. Const indices
    /// and op addresses are shifted here, exactly once.
    pub fn append_unit(&mut self, block: BlockId, mut unit: Bytecode) -> u32 {
        let addr_delta = self.ops.len() as u16;
        let const_delta = self.consts.len() as u16;
        for op in &mut unit.ops {
            relocate(op, const_delta, addr_delta);
        }
        self.ops.append(&mut unit.ops);
        self.consts.append(&mut unit.consts);
        let maddr_delta = self.metadata.len() as u32;
        for mut m in unit.metadata {
            m.addr += addr_delta as u32;
            m.related += maddr_delta;
            self.metadata.push(m);
        }
        self.block_to_addr.insert(block, BlockEntry::At(addr_delta as u32));
        addr_delta as u32
    }

    /// Term under evaluation at `addr`, via the metadata log.
    pub fn find_active_term(&self, addr: u32) -> Option<TermId> {
        let mut i = self.metadata.partition_point(|m| m.addr <= addr);
        while i > 0 {
            i -= 1;
            let m = self.metadata[i];
            match m.mopcode {
                Mopcode::TermEvalStart => return m.term,
                // A closed region before addr; skip over it wholesale.
                Mopcode::TermEvalEnd => i = m.related as usize,
                Mopcode::MajorBlockStart => return None,
                _ => {}
            }
        }
        None
    }

    pub fn find_active_major_block(&self, addr: u32) -> Option<BlockId> {
        let i = self.metadata.partition_point(|m| m.addr <= addr);
        self.metadata[..i]
            .iter()
            .rev()
            .find(|m| m.mopcode == Mopcode::MajorBlockStart)
            .and_then(|m| m.block)
    }

    pub fn disassemble(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (addr, op) in self.ops.iter().enumerate() {
            let _ = write!(out, "{addr:4}: {op:?}");
            match op.opcode {
                Opcode::Comment | Opcode::LoadConst | Opcode::UncompiledCall | Opcode::DynMethod => {
                    let idx = if op.opcode == Opcode::LoadConst || op.opcode == Opcode::Comment {
                        op.a
                    } else {
                        op.c
                    };
                    if let Some(v) = self.consts.get(idx as usize) {
                        let _ = write!(out, "    ; {v}");
                    }
                }
                _ => {}
            }
            out.push('\n');
        }
        out
    }
}

/// Shift one op's operands when its buffer moves. Each operand is either
/// a const index, a unit-relative address, or neither; nothing is shifted
/// twice. `Call` is absent on purpose: its target is already an absolute
/// address in the assembled buffer (a unit can only direct-call blocks
/// assembled before it), so shifting it again would corrupt it.
fn relocate(op: &mut Op, const_delta: u16, addr_delta: u16) {
    match op.opcode {
        Opcode::UncompiledCall | Opcode::DynMethod => op.c += const_delta,
        Opcode::LoadConst | Opcode::Comment => op.a += const_delta,
        Opcode::CastFixedType => op.b += const_delta,
        Opcode::Jump | Opcode::JumpIf | Opcode::JumpIfNot => op.c += addr_delta,
        _ => {}
    }
}
