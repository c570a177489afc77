//! Decoded bytecode instructions: the itable's element type
//!
//! One [`Instruction`] is built per instruction-start byte of a function's
//! bytecode, plus one synthetic trailing `Return`. Slots that aren't an
//! instruction start hold [`Instruction::empty`] (design §3's `EMPTY_SLOT`,
//! opcode 0) so that a branch target can be validated by a single array
//! index rather than a search.
//!
//! Rather than raw pointers for `fall_through`/`branch_next` (design §3 and
//! §9's "arenas + indices" note), both are indices into the owning
//! [`Code`](crate::code::Code)'s itable. Likewise `impl_std`/`impl_dbg`
//! aren't label addresses — there's no computed goto in safe Rust — but a
//! single dispatch-table slot (design §9), resolved once by
//! [`crate::code::Code`]'s final phase and consulted against whichever of
//! the two parallel tables the interpreter is currently using.

use std::rc::Rc;

use crate::funcref::FuncRef;
use crate::opcode::Op;
use crate::reloc::Reloc;
use crate::ty::Type;
use crate::value::Value;

/// One decoded instruction.
pub struct Instruction {
    pub opcode: Op,
    /// First operand. For `Const`, the constant value; for `PlusUconst`,
    /// the addend; for `Pick`, the stack depth; for `Lit`/`Bra`/etc, unused
    /// (the literal lives in `opcode` itself, the branch target in
    /// `branch_next`).
    pub arg1: Value,
    /// Second operand; used only by `Deref`'s (unused here — sign/size live
    /// in `opcode`) and reserved for future multi-operand forms.
    #[allow(dead_code)] // no opcode in this dialect's op-table declares a second operand
    pub arg2: Value,
    /// The relocatable address for `Addr`.
    pub addr1: Option<Rc<Reloc>>,
    /// The callee for `Call`/`LoadExternal`.
    pub ext1: Option<Rc<FuncRef>>,
    /// The resolved message string for `Warn`'s `Strp` operand.
    pub warn_message: Option<Rc<str>>,
    /// Index of the next instruction in straight-line order, `None` only
    /// for the trailing `Return`.
    pub fall_through: Option<usize>,
    /// Index of a `Bra`'s taken-branch target.
    pub branch_next: Option<usize>,
    /// Dispatch-table slot, set by the final decode phase. `None` until
    /// then, and for erased instructions.
    pub dispatch_slot: Option<usize>,
    /// Whether flow analysis or the validator has walked this slot.
    pub is_visited: bool,
    /// Validator scratch: the operand-stack type state on entry, filled in
    /// the first time this instruction is reached and checked for a match
    /// on every subsequent visit (a join-point mismatch is `INVALID`).
    pub entry_stack: Option<Vec<Type>>,
}

impl Instruction {
    /// `EMPTY_SLOT`: a non-instruction-start itable slot.
    pub fn empty() -> Self {
        Self {
            opcode: Op::Empty,
            arg1: Value::word(0),
            arg2: Value::word(0),
            addr1: None,
            ext1: None,
            warn_message: None,
            fall_through: None,
            branch_next: None,
            dispatch_slot: None,
            is_visited: false,
            entry_stack: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.opcode, Op::Empty)
    }

    /// Erase this slot back to `EMPTY_SLOT` in place, preserving nothing —
    /// used both for dead code after the validator's walk and for
    /// `skip`/`nop`/cast instructions a rewrite pass has consumed.
    pub fn erase(&mut self) {
        *self = Self::empty();
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("opcode", &self.opcode)
            .field("fall_through", &self.fall_through)
            .field("branch_next", &self.branch_next)
            .field("is_visited", &self.is_visited)
            .finish()
    }
}
