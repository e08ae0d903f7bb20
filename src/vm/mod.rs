pub mod bytecode;
pub mod compiler;
pub mod natives;
mod state;
#[allow(clippy::module_inception)]
mod vm;

pub use bytecode::{BlockEntry, Bytecode, Mop, Mopcode, Op, Opcode};
pub use vm::{FrameDump, Vm};

#[cfg(test)]
mod vm_test;
