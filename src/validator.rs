//! Abstract type-stack interpretation
//!
//! [`validate`] walks every reachable instruction starting at a function's
//! entry point, tracking an abstract stack of [`Type`]s rather than real
//! values. A join point (an instruction reached by more than one path)
//! must see the same abstract stack on every visit after the first —
//! mismatched types there are `INVALID`, not a crash waiting to happen at
//! interpret time. Dead instructions (never reached by this walk) are
//! erased to `EMPTY_SLOT` once the walk completes.

use crate::code::Code;
use crate::error::{DResult, Error, Located};
use crate::funcref::FuncRef;
use crate::opcode::Op;
use crate::ty::Type;

pub(crate) fn validate(code: &mut Code, funcref: &FuncRef) -> DResult<()> {
    let mut stack = Vec::new();
    for param in funcref.ty().params() {
        push(code, &mut stack, param.clone(), code.entry_point())?;
    }

    for instr in &mut code.itable {
        instr.is_visited = false;
        instr.entry_stack = None;
    }

    let entry = code.entry_point();
    validate_from(code, funcref, entry, stack)?;

    for instr in &mut code.itable {
        if instr.is_visited {
            instr.entry_stack = None;
        } else if !instr.is_empty() {
            instr.erase();
        }
    }

    Ok(())
}

fn push(code: &Code, stack: &mut Vec<Type>, ty: Type, op: usize) -> DResult<()> {
    if stack.len() >= code.max_stack() as usize {
        return Err(Located::new(Error::Invalid("operand stack exceeds max_stack".into()), op));
    }
    stack.push(ty);
    Ok(())
}

fn ensure_depth(stack: &[Type], n: usize, op: usize) -> DResult<()> {
    if stack.len() < n {
        return Err(Located::new(Error::Invalid("operand stack underflow".into()), op));
    }
    Ok(())
}

fn ensure_type(ty: &Type, want: &Type, op: usize) -> DResult<()> {
    if ty.matches(want) {
        Ok(())
    } else {
        Err(Located::new(Error::Invalid(format!("type mismatch: expected {want}, found {ty}")), op))
    }
}

/// Walk instructions from `op`, mutating `stack` in place, until a `Return`
/// is checked and accepted or a join-point/underflow/type error aborts the
/// whole validation. Recurses once per `Bra`, each time with its own cloned
/// stack so the taken branch can never leave the fall-through path's state
/// clobbered (design's single-buffer save/restore dance isn't needed once
/// each path owns its stack).
fn validate_from(code: &mut Code, funcref: &FuncRef, mut op: usize, mut stack: Vec<Type>) -> DResult<()> {
    loop {
        if matches!(code.itable[op].opcode, Op::Return) {
            let returns = funcref.ty().returns();
            ensure_depth(&stack, returns.len(), op)?;
            for (slot, want) in returns.iter().enumerate() {
                let actual = &stack[stack.len() - 1 - slot];
                ensure_type(actual, want, op)?;
            }
            code.itable[op].is_visited = true;
            return Ok(());
        }

        if !code.itable[op].is_visited {
            code.itable[op].is_visited = true;
            code.itable[op].entry_stack = Some(stack.clone());
        } else {
            let entry = code.itable[op]
                .entry_stack
                .as_ref()
                .expect("a visited non-return instruction always has an entry_stack");
            let matches = entry.len() == stack.len() && entry.iter().zip(stack.iter()).all(|(a, b)| a.matches(b));
            if !matches {
                return Err(Located::new(Error::Invalid("operand stack types differ at a join point".into()), op));
            }
            return Ok(());
        }

        match code.itable[op].opcode {
            Op::Empty => return Err(Located::new(Error::Invalid("control flow reached an empty slot".into()), op)),

            Op::Addr => push(code, &mut stack, Type::Pointer, op)?,

            Op::DerefRaw => {
                ensure_depth(&stack, 1, op)?;
                let top = stack.last().unwrap();
                ensure_type(top, &Type::Pointer, op)?;
                *stack.last_mut().unwrap() = Type::Pointer;
            }

            Op::DerefIntRaw => {
                ensure_depth(&stack, 1, op)?;
                let top = stack.last().unwrap();
                ensure_type(top, &Type::Pointer, op)?;
                *stack.last_mut().unwrap() = Type::Integer;
            }

            Op::CastInt2Ptr => {
                ensure_depth(&stack, 1, op)?;
                let top = stack.last().unwrap();
                ensure_type(top, &Type::Integer, op)?;
                *stack.last_mut().unwrap() = Type::Pointer;
            }

            Op::CastPtr2Int => {
                ensure_depth(&stack, 1, op)?;
                let top = stack.last().unwrap();
                ensure_type(top, &Type::Pointer, op)?;
                *stack.last_mut().unwrap() = Type::Integer;
            }

            Op::Const => push(code, &mut stack, Type::Integer, op)?,

            Op::Lit(0) => push(code, &mut stack, Type::IntOrPtr, op)?,
            Op::Lit(_) => push(code, &mut stack, Type::Integer, op)?,

            Op::Dup => {
                ensure_depth(&stack, 1, op)?;
                let top = stack.last().unwrap().clone();
                push(code, &mut stack, top, op)?;
            }

            Op::Drop => {
                ensure_depth(&stack, 1, op)?;
                stack.pop();
            }

            Op::Over => {
                ensure_depth(&stack, 2, op)?;
                let second = stack[stack.len() - 2].clone();
                push(code, &mut stack, second, op)?;
            }

            Op::Pick => {
                let n = code.itable[op].arg1.as_u64() as usize;
                ensure_depth(&stack, n + 1, op)?;
                let val = stack[stack.len() - 1 - n].clone();
                push(code, &mut stack, val, op)?;
            }

            Op::Swap => {
                ensure_depth(&stack, 2, op)?;
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }

            Op::Rot => {
                ensure_depth(&stack, 3, op)?;
                let len = stack.len();
                let top = stack[len - 1].clone();
                stack[len - 1] = stack[len - 2].clone();
                stack[len - 2] = stack[len - 3].clone();
                stack[len - 3] = top;
            }

            Op::And | Op::Or | Op::Xor | Op::Shl | Op::Shr | Op::Shra | Op::Mul | Op::Div | Op::Mod => {
                ensure_depth(&stack, 2, op)?;
                let len = stack.len();
                ensure_type(&stack[len - 1], &Type::Integer, op)?;
                ensure_type(&stack[len - 2], &Type::Integer, op)?;
                stack.pop();
                stack.pop();
                push(code, &mut stack, Type::Integer, op)?;
            }

            Op::Minus => {
                ensure_depth(&stack, 2, op)?;
                let len = stack.len();
                ensure_type(&stack[len - 1], &Type::Integer, op)?;
                ensure_type(&stack[len - 2], &Type::IntOrPtr, op)?;
                let base = stack[len - 2].clone();
                stack.pop();
                stack.pop();
                let result = if base == Type::Pointer { Type::Pointer } else { Type::Integer };
                push(code, &mut stack, result, op)?;
            }

            Op::PlusUconst => {
                ensure_depth(&stack, 1, op)?;
                ensure_type(stack.last().unwrap(), &Type::IntOrPtr, op)?;
            }

            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                ensure_depth(&stack, 2, op)?;
                let len = stack.len();
                ensure_type(&stack[len - 1], &Type::IntOrPtr, op)?;
                let top_ty = stack[len - 1].clone();
                ensure_type(&stack[len - 2], &top_ty, op)?;
                stack.pop();
                stack.pop();
                push(code, &mut stack, Type::Integer, op)?;
            }

            Op::Bra => {
                ensure_depth(&stack, 1, op)?;
                ensure_type(stack.last().unwrap(), &Type::IntOrPtr, op)?;
                stack.pop();
                let branch_next = code.itable[op].branch_next.expect("bra always has a branch target");
                validate_from(code, funcref, branch_next, stack.clone())?;
            }

            Op::Call => {
                ensure_depth(&stack, 1, op)?;
                let callee = stack.pop().unwrap();
                let Type::Function(ft) = callee else {
                    return Err(Located::new(Error::Invalid("call target is not a function reference".into()), op));
                };
                for want in ft.params().iter().rev() {
                    ensure_depth(&stack, 1, op)?;
                    let actual = stack.pop().unwrap();
                    ensure_type(&actual, want, op)?;
                }
                for ret in ft.returns().iter().rev() {
                    push(code, &mut stack, ret.clone(), op)?;
                }
            }

            Op::LoadExternal => {
                let ext = code.itable[op].ext1.clone().expect("load_external always has ext1 by this phase");
                push(code, &mut stack, Type::Function(ext.ty().clone()), op)?;
            }

            Op::Warn => {}

            Op::Return => unreachable!("handled above"),
            Op::ConstRaw | Op::Skip | Op::Nop | Op::Deref { .. } => {
                unreachable!("opcode not yet produced at validation time")
            }
        }

        op = code.itable[op].fall_through.expect("non-return, non-empty instruction always has a fall_through");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use std::rc::Rc;

    fn straight_line(ops: Vec<Op>) -> Code {
        let mut itable: Vec<Instruction> = ops
            .into_iter()
            .enumerate()
            .map(|(i, opcode)| Instruction {
                opcode,
                fall_through: Some(i + 1),
                ..Instruction::empty()
            })
            .collect();
        itable.push(Instruction {
            opcode: Op::Return,
            ..Instruction::empty()
        });
        Code::for_test(itable, 0, 8)
    }

    #[test]
    fn lit1_return_as_integer_validates() {
        let mut code = straight_line(vec![Op::Lit(1)]);
        let funcref = FuncRef::new("", "f", vec![], vec![Type::Integer], true).unwrap();
        validate(&mut code, &funcref).unwrap();
        assert!(!code.itable()[0].is_empty());
    }

    #[test]
    fn lit1_return_as_pointer_is_rejected() {
        let mut code = straight_line(vec![Op::Lit(1)]);
        let funcref = FuncRef::new("", "f", vec![], vec![Type::Pointer], true).unwrap();
        assert!(validate(&mut code, &funcref).is_err());
    }

    #[test]
    fn stack_underflow_on_drop_is_invalid() {
        let mut code = straight_line(vec![Op::Drop]);
        let funcref = FuncRef::new("", "f", vec![], vec![], true).unwrap();
        let err = validate(&mut code, &funcref).unwrap_err();
        assert!(matches!(err.error, Error::Invalid(_)));
    }

    #[test]
    fn minus_on_pointer_base_stays_pointer() {
        // addr 0 ; lit1 ; minus -> pointer
        let mut itable = vec![
            Instruction {
                opcode: Op::Addr,
                fall_through: Some(1),
                ..Instruction::empty()
            },
            Instruction {
                opcode: Op::Lit(1),
                fall_through: Some(2),
                ..Instruction::empty()
            },
            Instruction {
                opcode: Op::Minus,
                fall_through: Some(3),
                ..Instruction::empty()
            },
        ];
        itable.push(Instruction {
            opcode: Op::Return,
            ..Instruction::empty()
        });
        let mut code = Code::for_test(itable, 0, 8);
        let funcref = FuncRef::new("", "f", vec![], vec![Type::Pointer], true).unwrap();
        validate(&mut code, &funcref).unwrap();
    }

    #[test]
    fn call_checks_params_in_reverse_and_pushes_returns() {
        // Build: lit1 (param) ; load_external 1 ; call -> returns integer
        let target = Rc::new(FuncRef::new("lib", "callee", vec![Type::Integer], vec![Type::Pointer], false).unwrap());
        let mut itable = vec![
            Instruction {
                opcode: Op::Lit(1),
                fall_through: Some(1),
                ..Instruction::empty()
            },
            Instruction {
                opcode: Op::LoadExternal,
                ext1: Some(target),
                fall_through: Some(2),
                ..Instruction::empty()
            },
            Instruction {
                opcode: Op::Call,
                fall_through: Some(3),
                ..Instruction::empty()
            },
        ];
        itable.push(Instruction {
            opcode: Op::Return,
            ..Instruction::empty()
        });
        let mut code = Code::for_test(itable, 0, 8);
        let funcref = FuncRef::new("", "f", vec![], vec![Type::Pointer], true).unwrap();
        validate(&mut code, &funcref).unwrap();
    }

}
