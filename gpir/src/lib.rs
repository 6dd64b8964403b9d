//! A scheduling and register-allocating backend for the Mali "GP" geometry processor.
//!
//! A program is built as a DAG of scalar operations with [Prog]'s `push_*` functions and then
//! handed to [Compiler::compile], which lowers it, schedules it into instruction bundles, and
//! allocates its value and physical registers.

pub mod compile;
mod log;

pub use compile::{
    CompilationError, Compiler, Config,
    instr::Instr,
    node::{BlockIdx, DepKind, Loc, NodeIdx, NodeKind, Prog, Src, VRegIdx},
    op::{File, Op, OpKind, Slot},
};
