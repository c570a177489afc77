//! Runtime values: what lives on the interpreter's value stack
//!
//! The design describes `Value` as a machine-word-sized union of signed,
//! unsigned, pointer and function-reference views over the same bits. Rust
//! has no safe union with a non-`Copy`, refcounted variant, so this models
//! the same idea as a two-variant enum: plain words (used for both the
//! `i`/integer and `p`/pointer core types, which share a representation and
//! differ only in which operations are legal — that's the validator's job,
//! not this type's) and function references (the `o`/opaque value an
//! `I8_OP_load_external` pushes).

use std::rc::Rc;

use crate::funcref::FuncRef;

/// A single interpreter stack slot.
#[derive(Clone)]
pub enum Value {
    /// An integer or pointer bit pattern; which it is is tracked by the
    /// validator's stack of [`Type`](crate::ty::Type), not by this value.
    Word(u64),
    /// A function reference, as pushed by `I8_OP_load_external`.
    Func(Rc<FuncRef>),
}

impl Value {
    pub const fn word(v: u64) -> Self {
        Self::Word(v)
    }

    pub fn int(v: i64) -> Self {
        Self::Word(v as u64)
    }

    pub fn func(f: Rc<FuncRef>) -> Self {
        Self::Func(f)
    }

    /// View as an unsigned word. Panics on a `Func` value — callers must
    /// only reach arithmetic/deref opcodes after the validator has proven
    /// the slot holds a word.
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Word(v) => *v,
            Self::Func(_) => panic!("Value::as_u64 called on a function reference"),
        }
    }

    /// View as a signed word.
    pub fn as_i64(&self) -> i64 {
        self.as_u64() as i64
    }

    /// View as a function reference.
    pub fn as_func(&self) -> &Rc<FuncRef> {
        match self {
            Self::Func(f) => f,
            Self::Word(_) => panic!("Value::as_func called on a word"),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(v) => write!(f, "Word(0x{v:x})"),
            Self::Func(fr) => write!(f, "Func({fr})"),
        }
    }
}
