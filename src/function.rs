//! Functions: the thing a resolved `FuncRef` points at
//!
//! A [`Function`] is either bytecode (owns a [`Note`], the external
//! `FuncRef`s its code calls out to, and its decoded [`Code`]) or native (a
//! host-supplied callback). Either way it carries a back-reference to its
//! own [`FuncRef`] and an `observed_available` bit recording the last
//! availability state the host was told about, so [`Context`] can
//! edge-trigger the callback instead of re-notifying on every registration
//! pass (design §3, §4.7).
//!
//! [`Context`]: crate::context::Context

use std::cell::Cell;
use std::rc::Rc;

use crate::code::Code;
use crate::funcref::FuncRef;
use crate::note::Note;
use crate::xctx::Xctx;

/// Signature of a host-supplied native function implementation: `native_fn(xctx,
/// inferior, args, rets)` (design §6).
///
/// `xctx` gives access to the inferior this call is running against
/// ([`Xctx::inferior`]) and a re-entrant call handle back into the
/// interpreter ([`Xctx::call`]); `args`/`rets` are ordered and typed per the
/// `FuncRef`'s signature. Returns `Err` on failure, surfaced to the caller
/// as [`Error::NatcallFailed`].
///
/// [`Error::NatcallFailed`]: crate::error::Error::NatcallFailed
pub type NativeFn =
    Rc<dyn Fn(&Xctx<'_>, &[crate::value::Value], &mut [crate::value::Value]) -> Result<(), String>>;

enum Body {
    Bytecode {
        note: Rc<Note>,
        externals: Vec<Rc<FuncRef>>,
        code: Code,
    },
    Native(NativeFn),
}

/// A concrete implementation satisfying some [`FuncRef`].
pub struct Function {
    funcref: Rc<FuncRef>,
    body: Body,
    observed_available: Cell<bool>,
}

impl Function {
    pub(crate) fn new_bytecode(funcref: Rc<FuncRef>, note: Rc<Note>, externals: Vec<Rc<FuncRef>>, code: Code) -> Rc<Self> {
        Rc::new(Self {
            funcref,
            body: Body::Bytecode { note, externals, code },
            observed_available: Cell::new(false),
        })
    }

    pub(crate) fn new_native(funcref: Rc<FuncRef>, implementation: NativeFn) -> Rc<Self> {
        Rc::new(Self {
            funcref,
            body: Body::Native(implementation),
            observed_available: Cell::new(false),
        })
    }

    /// The `FuncRef` this function implements.
    pub fn funcref(&self) -> &Rc<FuncRef> {
        &self.funcref
    }

    pub fn is_bytecode(&self) -> bool {
        matches!(self.body, Body::Bytecode { .. })
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, Body::Native(_))
    }

    /// The externals this bytecode function's code calls out to, in the
    /// order its `Externals` chunk listed them. `&[]` for a native
    /// function.
    pub fn externals(&self) -> &[Rc<FuncRef>] {
        match &self.body {
            Body::Bytecode { externals, .. } => externals,
            Body::Native(_) => &[],
        }
    }

    pub(crate) fn code(&self) -> Option<&Code> {
        match &self.body {
            Body::Bytecode { code, .. } => Some(code),
            Body::Native(_) => None,
        }
    }

    pub(crate) fn native(&self) -> Option<&NativeFn> {
        match &self.body {
            Body::Native(f) => Some(f),
            Body::Bytecode { .. } => None,
        }
    }

    pub fn note(&self) -> Option<&Rc<Note>> {
        match &self.body {
            Body::Bytecode { note, .. } => Some(note),
            Body::Native(_) => None,
        }
    }

    /// Whether this function is available: every external it calls is
    /// itself resolved. Always `true` for a native function, which has no
    /// externals.
    pub fn is_available(&self) -> bool {
        self.externals().iter().all(|ext| ext.is_resolved())
    }

    /// The availability state the host was last notified of.
    pub(crate) fn observed_available(&self) -> bool {
        self.observed_available.get()
    }

    pub(crate) fn set_observed_available(&self, available: bool) {
        self.observed_available.set(available);
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("funcref", &self.funcref.signature())
            .field("kind", &if self.is_bytecode() { "bytecode" } else { "native" })
            .field("observed_available", &self.observed_available.get())
            .finish()
    }
}
