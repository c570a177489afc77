//! Decoder, linker, validator and interpreter for Infinity Notes bytecode.
//!
//! A host embeds this crate to run small architecture-neutral bytecode
//! programs carried in ELF notes: [`context::Context`] interns and links
//! [`funcref::FuncRef`]s, [`note::Note`] decodes the wire format,
//! [`context::Context::call`] runs a linked [`function::Function`] against
//! a host-supplied [`inferior::Inferior`].

mod code;
pub mod context;
mod dispatch;
pub mod error;
pub mod funcref;
pub mod function;
pub mod inferior;
mod instruction;
mod interp;
pub mod log;
pub mod note;
mod opcode;
mod readbuf;
pub mod reloc;
pub mod ty;
mod validator;
pub mod value;
pub mod xctx;

pub mod prelude {
    pub use crate::context::{Context, ContextOptions};
    pub use crate::error::{Error, LastError, Result};
    pub use crate::funcref::FuncRef;
    pub use crate::function::{Function, NativeFn};
    pub use crate::inferior::Inferior;
    pub use crate::log::{LogPriority, LogRecord, LogSink};
    pub use crate::note::Note;
    pub use crate::reloc::Reloc;
    pub use crate::ty::{FunctionType, Type};
    pub use crate::value::Value;
    pub use crate::xctx::Xctx;
}
