//! Execution core for a live-editing dynamic language.
//!
//! A program is a mutable graph of blocks and terms ([`graph`]). The
//! compiler ([`vm::compiler`]) lowers one major block at a time into
//! slot-addressed bytecode; compilation is lazy, driven by the VM hitting
//! call sites for blocks that have no code yet. The VM ([`vm`]) runs the
//! shared buffer on a flat slot stack and carries a keyed state-frame
//! stack so that per-term persistent state survives recompilation.

pub mod graph;
pub mod util;
pub mod val;
pub mod vm;

pub use graph::{BlockBuilder, BlockId, Graph, TermId};
pub use val::{TypeTag, Val};
pub use vm::Vm;
