//! The re-entrant call handle a native function receives
//!
//! Design §6 documents a native implementation's signature as `native_fn(xctx,
//! inferior, args, rets)`: alongside its arguments and return slots, a native
//! function is handed the inferior it's running against and a handle back
//! into the interpreter, so it can read inferior memory and — per §5's
//! suspension-points note ("it may call back into the library... re-entrantly")
//! — call another `FuncRef` without the host needing a separate top-level
//! [`Context::call`](crate::context::Context::call).
//!
//! [`Xctx`] is only ever handed to a native function by this crate; hosts
//! consume it, they don't build one.

use std::rc::Rc;

use crate::error::Result;
use crate::function::Function;
use crate::inferior::Inferior;
use crate::log::{LogPriority, LogSink};
use crate::value::Value;

/// The capability a running native function has to read the inferior and
/// call back into the interpreter, sharing the enclosing call's stack
/// budget (design §4.6, §5, §6).
pub struct Xctx<'a> {
    pub(crate) inferior: &'a Rc<dyn Inferior>,
    pub(crate) stack_limit: usize,
    pub(crate) budget_floor: usize,
    pub(crate) log_sink: Option<&'a LogSink>,
    pub(crate) log_priority: LogPriority,
}

impl<'a> Xctx<'a> {
    /// The inferior this call is running against.
    pub fn inferior(&self) -> &Rc<dyn Inferior> {
        self.inferior
    }

    /// Call `func` re-entrantly, against the same inferior and the same
    /// overall stack budget as the call this native function is itself
    /// running inside — a nested call chain can't bypass `stack_limit` by
    /// calling back in.
    pub fn call(&self, func: &Rc<Function>, args: &[Value]) -> Result<Vec<Value>> {
        crate::interp::call_with_budget_floor(
            func,
            self.inferior,
            args,
            self.stack_limit,
            self.budget_floor,
            self.log_sink,
            self.log_priority,
        )
    }
}
