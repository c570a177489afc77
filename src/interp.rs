//! The threaded-dispatch interpreter
//!
//! [`call`] runs one [`Function`] to completion against a host-supplied
//! [`Inferior`], synchronously, on the calling thread — there is no
//! scheduler and no async boundary here (design §1 Non-goals).
//!
//! The value stack and the call stack are modelled as two independent
//! growable `Vec`s rather than the reference interpreter's single
//! fixed-size, two-ends-growing-towards-each-other buffer: safe Rust has
//! no portable way to carve one allocation into a stack growing up and a
//! stack growing down, and a `Vec` already gives bounds-checked access for
//! free. `stack_limit` stands in for where the two ends would have met,
//! checked at every call site the way `csp`/`vsp_floor` comparison was.
//!
//! A bytecode call does not recurse into this function: [`Op::Call`]
//! pushes a [`Frame`] recording where to resume and switches `pc`/the
//! active [`Code`] in place, exactly like the reference interpreter's
//! `SETUP_CALL` + `DISPATCH(code->entry_point)`. Only a *native* callee
//! runs via an actual Rust call, since it's the host's code and may do
//! anything (including calling back in).
//!
//! Dispatch itself is a `match` on [`Op`] rather than a function-pointer
//! table indexed by [`Instruction::dispatch_slot`]: LLVM already lowers a
//! dense match like this one to a jump table, which is exactly what the
//! reference interpreter's hand-built table bought it. `dispatch_slot`
//! still gets populated and checked (see [`crate::dispatch`]) as the
//! structural half of that invariant.
//!
//! Every dispatched instruction also emits a `tracing::trace!` event
//! (opcode, `vsp`, `csp`, `pc`) — off by default, but a `RUST_LOG=trace`
//! subscriber gets a full execution trace with no host callback needed.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::funcref::FuncRef;
use crate::function::Function;
use crate::inferior::Inferior;
use crate::instruction::Instruction;
use crate::log::{self, LogPriority, LogSink};
use crate::opcode::Op;
use crate::value::Value;
use crate::xctx::Xctx;

/// One entry of the call stack: where to resume, and whose operand-stack
/// window to restore, when the callee returns.
struct Frame {
    caller: Rc<FuncRef>,
    callsite: usize,
    vsp_floor: usize,
}

/// Run `func` to completion with `args` on its operand stack, against
/// `inferior`. Returns its declared return values in order.
///
/// `stack_limit` bounds the combined depth of the operand stack and the
/// call stack (three [`Value`]-sized slots per call-stack frame, matching
/// the reference interpreter's `CS_FRAME_SIZE`), the same resource the
/// reference interpreter's `I8X_CTX_STACK_SIZE` environment variable
/// configures.
pub(crate) fn call(
    func: &Rc<Function>,
    inferior: &Rc<dyn Inferior>,
    args: &[Value],
    stack_limit: usize,
    log_sink: Option<&LogSink>,
    log_min: LogPriority,
) -> Result<Vec<Value>> {
    call_with_budget_floor(func, inferior, args, stack_limit, 0, log_sink, log_min)
}

/// As [`call`], but charging `budget_floor` extra slots against
/// `stack_limit` before this call's own operand/call stack even starts —
/// the stack already consumed by an enclosing call chain a native function
/// re-entered from (design §4.6, §6; see [`Xctx::call`]).
pub(crate) fn call_with_budget_floor(
    func: &Rc<Function>,
    inferior: &Rc<dyn Inferior>,
    args: &[Value],
    stack_limit: usize,
    budget_floor: usize,
    log_sink: Option<&LogSink>,
    log_min: LogPriority,
) -> Result<Vec<Value>> {
    if let Some(native) = func.native() {
        let mut rets = vec![Value::word(0); func.funcref().num_returns()];
        let xctx = Xctx {
            inferior,
            stack_limit,
            budget_floor,
            log_sink,
            log_priority: log_min,
        };
        native(&xctx, args, &mut rets).map_err(Error::NatcallFailed)?;
        return Ok(rets);
    }

    const FRAME_SLOTS: usize = 3;

    let mut current = func.clone();
    let entry_max_stack = current.code().expect("bytecode function has code").max_stack() as usize;
    if budget_floor + args.len() + entry_max_stack > stack_limit {
        return Err(Error::StackOverflow);
    }

    let mut value_stack: Vec<Value> = args.to_vec();
    let mut call_stack: Vec<Frame> = Vec::new();
    let mut vsp_floor = 0usize;
    let mut pc = current.code().expect("bytecode function has code").entry_point();

    loop {
        let (opcode, arg1, addr1, ext1, warn_message, fall_through, branch_next) = {
            let code = current.code().expect("interpreter pc always belongs to a bytecode function");
            let instr: &Instruction = &code.itable()[pc];
            (
                instr.opcode,
                instr.arg1.clone(),
                instr.addr1.clone(),
                instr.ext1.clone(),
                instr.warn_message.clone(),
                instr.fall_through,
                instr.branch_next,
            )
        };

        tracing::trace!(
            opcode = ?opcode,
            vsp = value_stack.len(),
            csp = call_stack.len(),
            pc,
            "dispatch"
        );

        let mut next_pc = fall_through;

        match opcode {
            Op::Addr => {
                let addr = addr1.expect("addr instruction always carries a reloc").resolve(inferior)?;
                value_stack.push(Value::word(addr));
            }
            Op::Const => value_stack.push(arg1),
            Op::Lit(n) => value_stack.push(Value::int(n as i64)),
            Op::Dup => {
                let top = value_stack.last().expect("validator guarantees depth").clone();
                value_stack.push(top);
            }
            Op::Drop => {
                value_stack.pop().expect("validator guarantees depth");
            }
            Op::Over => {
                let len = value_stack.len();
                value_stack.push(value_stack[len - 2].clone());
            }
            Op::Pick => {
                let n = arg1.as_u64() as usize;
                let len = value_stack.len();
                value_stack.push(value_stack[len - 1 - n].clone());
            }
            Op::Swap => {
                let len = value_stack.len();
                value_stack.swap(len - 1, len - 2);
            }
            Op::Rot => {
                let len = value_stack.len();
                let top = value_stack[len - 1].clone();
                let second = value_stack[len - 2].clone();
                let third = value_stack[len - 3].clone();
                value_stack[len - 1] = second;
                value_stack[len - 2] = third;
                value_stack[len - 3] = top;
            }
            Op::And | Op::Or | Op::Xor | Op::Shl | Op::Shr | Op::Shra | Op::Mul | Op::Minus => {
                let rhs = value_stack.pop().expect("validator guarantees depth").as_u64();
                let base = value_stack.last().expect("validator guarantees depth").as_u64();
                let result = match opcode {
                    Op::And => base & rhs,
                    Op::Or => base | rhs,
                    Op::Xor => base ^ rhs,
                    Op::Shl => base.wrapping_shl(rhs as u32),
                    Op::Shr => base.wrapping_shr(rhs as u32),
                    Op::Shra => (base as i64).wrapping_shr(rhs as u32) as u64,
                    Op::Mul => base.wrapping_mul(rhs),
                    Op::Minus => base.wrapping_sub(rhs),
                    _ => unreachable!(),
                };
                *value_stack.last_mut().unwrap() = Value::word(result);
            }
            Op::Div => {
                let rhs = value_stack.pop().expect("validator guarantees depth").as_i64();
                if rhs == 0 {
                    return Err(Error::DivideByZero);
                }
                let lhs = value_stack.last().expect("validator guarantees depth").as_i64();
                *value_stack.last_mut().unwrap() = Value::int(lhs.wrapping_div(rhs));
            }
            Op::Mod => {
                let rhs = value_stack.pop().expect("validator guarantees depth").as_u64();
                if rhs == 0 {
                    return Err(Error::DivideByZero);
                }
                let lhs = value_stack.last().expect("validator guarantees depth").as_u64();
                *value_stack.last_mut().unwrap() = Value::word(lhs % rhs);
            }
            Op::PlusUconst => {
                let addend = arg1.as_u64();
                let top = value_stack.last().expect("validator guarantees depth").as_u64();
                *value_stack.last_mut().unwrap() = Value::word(top.wrapping_add(addend));
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let rhs = value_stack.pop().expect("validator guarantees depth").as_i64();
                let lhs = value_stack.last().expect("validator guarantees depth").as_i64();
                let result = match opcode {
                    Op::Eq => lhs == rhs,
                    Op::Ne => lhs != rhs,
                    Op::Lt => lhs < rhs,
                    Op::Le => lhs <= rhs,
                    Op::Gt => lhs > rhs,
                    Op::Ge => lhs >= rhs,
                    _ => unreachable!(),
                };
                *value_stack.last_mut().unwrap() = Value::int(result as i64);
            }
            Op::Bra => {
                let cond = value_stack.pop().expect("validator guarantees depth").as_i64();
                next_pc = Some(if cond != 0 {
                    branch_next.expect("bra always carries a branch target")
                } else {
                    fall_through.expect("bra always falls through")
                });
            }
            Op::LoadExternal => {
                value_stack.push(Value::func(ext1.expect("load_external always carries a target")));
            }
            Op::Warn => {
                log::emit(
                    log_sink,
                    log_min,
                    LogPriority::Warning,
                    file!(),
                    line!(),
                    "interp::call",
                    format_args!("{}: {}", current.funcref().signature(), warn_message.as_deref().unwrap_or("")),
                );
            }
            Op::Deref { sign, size } => {
                let addr = value_stack.last().expect("validator guarantees depth").as_u64();
                let nbytes = size.bytes();
                let mut buf = [0u8; 8];
                inferior.read_memory(addr, &mut buf[..nbytes]).map_err(Error::ReadMemFailed)?;
                if size.needs_swap() {
                    buf[..nbytes].reverse();
                }
                let raw = u64::from_le_bytes(buf);
                let result = match sign {
                    crate::opcode::DerefSign::Unsigned => raw,
                    crate::opcode::DerefSign::Signed => sign_extend(raw, size.bits()),
                };
                *value_stack.last_mut().unwrap() = Value::word(result);
            }
            Op::Call => {
                let callee_ref = match value_stack.pop().expect("validator guarantees depth") {
                    Value::Func(f) => f,
                    Value::Word(_) => unreachable!("validator guarantees a call target is a function reference"),
                };
                let resolved = callee_ref
                    .resolved_function()
                    .ok_or_else(|| Error::UnresolvedFunction(callee_ref.signature()))?;
                let num_params = callee_ref.num_params();
                let num_returns = callee_ref.num_returns();
                let args_start = value_stack.len() - num_params;

                if let Some(native) = resolved.native() {
                    let args: Vec<Value> = value_stack[args_start..].to_vec();
                    let mut rets = vec![Value::word(0); num_returns];
                    let xctx = Xctx {
                        inferior,
                        stack_limit,
                        budget_floor: budget_floor + value_stack.len() + call_stack.len() * FRAME_SLOTS,
                        log_sink,
                        log_priority: log_min,
                    };
                    native(&xctx, &args, &mut rets).map_err(Error::NatcallFailed)?;
                    value_stack.truncate(args_start);
                    value_stack.extend(rets);
                } else {
                    let callee_code = resolved.code().expect("non-native function is bytecode");
                    let new_vsp_floor = args_start;
                    let budget_used = budget_floor + new_vsp_floor + (call_stack.len() + 1) * FRAME_SLOTS;
                    if budget_used + callee_code.max_stack() as usize > stack_limit {
                        return Err(Error::StackOverflow);
                    }
                    call_stack.push(Frame {
                        caller: current.funcref().clone(),
                        callsite: fall_through.expect("call always falls through"),
                        vsp_floor,
                    });
                    vsp_floor = new_vsp_floor;
                    next_pc = Some(callee_code.entry_point());
                    current = resolved;
                }
            }
            Op::Return => {
                let num_returns = current.funcref().num_returns();
                match call_stack.pop() {
                    None => {
                        let rets = value_stack.split_off(value_stack.len() - num_returns);
                        return Ok(rets);
                    }
                    Some(frame) => {
                        let have = value_stack.len() - vsp_floor;
                        if have != num_returns {
                            let ret_start = value_stack.len() - num_returns;
                            value_stack.drain(vsp_floor..ret_start);
                        }
                        current = frame.caller.resolved_function().expect("a caller frame's function is always still resolved");
                        next_pc = Some(frame.callsite);
                        vsp_floor = frame.vsp_floor;
                    }
                }
            }
            Op::Empty | Op::ConstRaw | Op::Skip | Op::Nop | Op::DerefRaw | Op::DerefIntRaw | Op::CastInt2Ptr | Op::CastPtr2Int => {
                unreachable!("{opcode:?} does not survive Code::new's rewrite passes")
            }
        }

        pc = next_pc.expect("every opcode but a taken bra sets its own pc or falls through");
    }
}

/// Sign-extend the low `bits` bits of `raw` to a full 64-bit word.
fn sign_extend(raw: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    (((raw << shift) as i64) >> shift) as u64
}
