//! Dispatch-table bookkeeping
//!
//! The reference interpreter is built twice from the same source, once
//! with tracing/assertions compiled in and once without, and threads
//! through whichever resulting function-pointer table (`impl_std` /
//! `impl_dbg`) matches the interpreter in use. Safe Rust has no
//! computed-goto and, more importantly, no need for one: `match`ing on
//! [`Op`] already compiles to a dense jump table, so [`crate::interp`]
//! dispatches that way directly rather than through a hand-rolled
//! function-pointer array.
//!
//! What's still useful from the original design is the *shape*:
//! [`Instruction::dispatch_slot`](crate::instruction::Instruction::dispatch_slot)
//! is populated for every live instruction by
//! [`Code`](crate::code::Code)'s final decode phase, and [`build_table`]
//! exists so that invariant — every reachable opcode has a slot, and every
//! slot in `0..Op::TABLE_SIZE` is reachable from some valid program — can
//! be checked structurally instead of by trusting the interpreter's
//! `match` to be exhaustive.

use crate::opcode::{DerefSign, DerefSize, Op};

/// A placeholder table entry: `true` once [`build_table`] has confirmed
/// some `Op` value maps to this slot.
pub(crate) fn build_table() -> [bool; Op::TABLE_SIZE] {
    let mut table = [false; Op::TABLE_SIZE];
    let mut mark = |op: Op| table[op.slot()] = true;

    mark(Op::Empty);
    mark(Op::Addr);
    mark(Op::Const);
    for n in 0..32u8 {
        mark(Op::Lit(n));
    }
    mark(Op::Dup);
    mark(Op::Drop);
    mark(Op::Over);
    mark(Op::Pick);
    mark(Op::Swap);
    mark(Op::Rot);
    mark(Op::And);
    mark(Op::Or);
    mark(Op::Xor);
    mark(Op::Shl);
    mark(Op::Shr);
    mark(Op::Shra);
    mark(Op::Mul);
    mark(Op::Div);
    mark(Op::Mod);
    mark(Op::PlusUconst);
    mark(Op::Minus);
    mark(Op::Eq);
    mark(Op::Ne);
    mark(Op::Lt);
    mark(Op::Le);
    mark(Op::Gt);
    mark(Op::Ge);
    mark(Op::Bra);
    mark(Op::Call);
    mark(Op::LoadExternal);
    for sign in [DerefSign::Unsigned, DerefSign::Signed] {
        for size in [
            DerefSize::S8,
            DerefSize::S16Native,
            DerefSize::S16Reversed,
            DerefSize::S32Native,
            DerefSize::S32Reversed,
            DerefSize::S64Native,
            DerefSize::S64Reversed,
        ] {
            mark(Op::Deref { sign, size });
        }
    }
    mark(Op::Warn);
    mark(Op::Return);

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_slot_is_reachable_from_some_final_op() {
        let table = build_table();
        assert!(table.iter().all(|&reachable| reachable), "every dispatch slot should be reachable");
    }
}
