//! Staged compiler from lazily-built array command graphs to fused
//! data-parallel kernels.
//!
//! A [`CommandGraph`] records array operations (index spaces, element-wise
//! `combine`, `zip`, `reduce`, `stencil`) without running them. Compiling a
//! root command infers a type for every body, fuses element-wise chains into
//! as few kernels as their data dependencies allow and returns a
//! [`Program`]: the kernel source, a launch plan, device allocations and the
//! environment struct the host must populate.
//!
//! ```ignore
//! let compiler = ikra::Compiler::default();
//! let mut graph = compiler.new_graph();
//! let a = graph.index(vec![1_000_000])?;
//! let sum = graph.reduce(a, None, Some("+"))?;
//! let program = compiler.compile(&graph, sum)?;
//! ```

pub mod api;
pub mod ast;
pub mod codegen;
pub mod config;
pub mod diagnostic;
pub mod env;
pub mod error;
pub mod graph;
pub mod interp;
pub mod program;
pub mod span;
pub mod translate;
pub mod typeck;
pub mod types;

pub use api::{CompileOptions, Compiler};
pub use ast::{Ast, Block, Node, NodeId};
pub use config::ProjectConfig;
pub use diagnostic::{render_diagnostics, Diagnostic, Severity};
pub use error::{CompileError, Result};
pub use graph::{
    offsets_1d, Command, CommandGraph, CommandId, CommandSpec, DevicePtr, GeneratorSite,
    StencilStrategy, DEFAULT_BLOCK_SIZE,
};
pub use program::{Backend, BackendOutput, Program};
pub use span::Span;
pub use typeck::classes::ClassDef;
pub use types::{ConcreteType, UnionType, Value};
