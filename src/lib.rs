//! A programmatic assembler for WebAssembly modules.
//!
//! stackasm builds functions instruction by instruction while type-checking
//! them against a virtual operand stack, tracks every module-level entity a
//! function touches in a dependency [`Graph`], and assembles whatever is
//! reachable from a set of roots into an indexed [`Module`] that encodes to
//! (and decodes from) the binary format.
//!
//! # Modules
//!
//! - [`binary`] -- Bidirectional codecs and their combinators, LEB128 and float primitives.
//! - [`types`] -- Value, function, table, memory and global types.
//! - [`instruction`] -- The instruction registry, immediates and the expression codec.
//! - [`dependency`] -- The node arena and entity constructors.
//! - [`builder`] -- The stack-typed function builder.
//! - [`assembler`] -- Index assignment and operand resolution.
//! - [`module`] -- The structured module and its section layout.
//!
//! # Example
//!
//! ```
//! use stackasm::{FuncDecl, Graph, Module, ModuleRoots};
//! use stackasm::types::ValueType::I32;
//!
//! # fn main() -> stackasm::Result<()> {
//! let mut graph = Graph::new();
//! let add = graph.func(FuncDecl::new(&[I32, I32], &[I32]), |ctx, params, _| {
//!     ctx.op("i32.add", &[params[0].into(), params[1].into()])?;
//!     Ok(())
//! })?;
//! let assembled = graph.assemble(ModuleRoots::new().export("add", add))?;
//! let bytes = assembled.to_bytes()?;
//! assert_eq!(&Module::from_bytes(&bytes)?, assembled.module());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod binary;
pub mod builder;
pub mod dependency;
pub mod error;
pub mod instruction;
pub mod module;
pub mod types;

pub use crate::assembler::{Assembled, AssemblyError, Host, MemoryRoot, ModuleRoots};
pub use crate::binary::{Codec, CodecError};
pub use crate::builder::{BuildContext, BuildError, FuncDecl, Local, MemAccess, Operand, StackVar};
pub use crate::dependency::{ConstExpr, Graph, ImportPath, NodeId};
pub use crate::error::{Error, Result};
pub use crate::module::Module;
