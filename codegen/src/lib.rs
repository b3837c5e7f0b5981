//! Dropforge code generator.
//!
//! A just-in-time machine-code generator: clients build functions from
//! architecture-level instructions over *virtual* registers through the
//! [`Compiler`] builder; the library resolves calling conventions,
//! allocates physical registers, lays out the stack frame, patches
//! relative offsets and produces a [`FinalizedCode`] blob ready for an
//! executable-memory runtime to map.
//!
//! The pipeline, in pass order: builder → node IR → invoke lowering →
//! liveness → bundle bin-packing → local allocation → frame layout →
//! serialization → relocation resolution.
//!
//! ```
//! use dropforge_codegen::{Compiler, Arch, CallConv, FuncSignature, TypeId};
//!
//! let mut c = Compiler::new(Arch::X64)?;
//! c.func(FuncSignature::new(CallConv::X64SystemV, TypeId::I64,
//!     &[TypeId::I64, TypeId::I64]))?;
//! let a = c.get_arg(0)?;
//! let b = c.get_arg(1)?;
//! c.add(a, b)?;
//! c.func_ret(Some(a.into()))?;
//! c.end_func()?;
//! let code = c.finalize()?;
//! assert!(!code.bytes.is_empty());
//! # Ok::<(), dropforge_codegen::Error>(())
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod callconv;
pub mod context;
pub mod entity;
pub mod frame;
pub mod func;
pub mod ir;
pub mod isa;
pub mod label;
pub mod operand;
pub mod regalloc;
pub mod result;
pub mod support;

pub use buffer::{BaseReloc, CodeBuffer, CodeOffset, Section, SectionFlags, SectionId};
pub use callconv::{CallConv, CallConvScheme};
pub use context::{Compiler, FinalizedCode, FinalizedSection};
pub use frame::FuncFrame;
pub use func::{FuncDetail, FuncSignature, FuncValue, TypeId};
pub use ir::builder::CondCode;
pub use ir::{AlignMode, InstId, InstNode, NodeData, NodeId};
pub use isa::Arch;
pub use label::{Label, LabelManager, RelocKind};
pub use operand::{Imm, Mem, Operand, Reg, RegGroup, RegType, VirtReg};
pub use result::{CodegenResult, Error, ErrorHandler};
