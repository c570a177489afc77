//! The function registry: interning, linking and dispatch
//!
//! A [`Context`] is the top-level handle a host holds: it interns
//! [`FuncRef`]s and [`FunctionType`]s, owns every registered [`Function`],
//! and keeps them linked by re-running a small fixpoint over the registry
//! whenever one is added or removed (design §4.7). It also carries the
//! ambient stack the distilled spec leaves implicit: a log sink, a
//! last-error slot, and (optionally) debug-allocator bookkeeping.
//!
//! Unlike the reference implementation's incremental `regcount`/`unique`
//! bookkeeping on every [`FuncRef`], [`Context::resolve`] recomputes
//! resolution from scratch on every call. This crate's registries are not a
//! hot path — `register_func`/`unregister_func` are host-driven, not called
//! per instruction — so the simpler, harder-to-get-wrong algorithm wins.

use std::cell::RefCell;
use std::env;
use std::rc::Rc;

use crate::error::{Error, LastError, Locate, Located, Result};
use crate::funcref::{FuncRef, FuncRefRegistry};
use crate::function::{Function, NativeFn};
use crate::inferior::Inferior;
use crate::interp;
use crate::log::{LogPriority, LogSink};
use crate::note::{ChunkKind, Note};
use crate::readbuf::{ByteOrder, ReadBuf};
use crate::ty::{Type, TypeRegistry};
use crate::value::Value;

/// Construction-time configuration for a [`Context`].
pub struct ContextOptions {
    pub log_priority: LogPriority,
    pub debug_alloc: bool,
    /// Combined operand-stack/call-stack budget passed to every [`interp::call`].
    pub stack_limit: usize,
}

impl ContextOptions {
    /// Defaults matching the reference implementation's own: `Warning`
    /// priority, debug-allocator checks off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `I8X_LOG` and `I8X_DBG_MEM` the way `libi8x/context.c`'s
    /// `i8x_ctx_new` reads its environment, falling back to
    /// [`ContextOptions::new`]'s defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut opts = Self::new();
        if let Ok(text) = env::var("I8X_LOG") {
            if let Some(priority) = LogPriority::parse(&text) {
                opts.log_priority = priority;
            }
        }
        if let Ok(text) = env::var("I8X_DBG_MEM") {
            opts.debug_alloc = strtobool(&text);
        }
        opts
    }
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            log_priority: LogPriority::default(),
            debug_alloc: false,
            stack_limit: 4096,
        }
    }
}

/// `strtobool`: numeric non-zero, or a case-insensitive prefix of `"yes"`/`"true"`.
fn strtobool(text: &str) -> bool {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return n != 0;
    }
    let lower = text.to_ascii_lowercase();
    !lower.is_empty() && ("yes".starts_with(&lower) || "true".starts_with(&lower))
}

type AvailabilityObserver = Box<dyn Fn(&Rc<Function>, bool)>;

/// The function registry and link-time fixpoint engine.
pub struct Context {
    funcrefs: RefCell<FuncRefRegistry>,
    /// Every `FuncRef` ever created through this `Context`, global or
    /// local, in creation order — mirrors the reference implementation's
    /// single `ctx->funcrefs` list, which accumulates both kinds and only
    /// deduplicates the global ones. The resolution fixpoint walks this
    /// list, not just the interned globals, so a bytecode function's own
    /// (often-local) `FuncRef` gets resolved too.
    all_funcrefs: RefCell<Vec<Rc<FuncRef>>>,
    types: RefCell<TypeRegistry>,
    functions: RefCell<Vec<Rc<Function>>>,
    observer: RefCell<Option<AvailabilityObserver>>,
    log_sink: Option<LogSink>,
    log_priority: LogPriority,
    debug_alloc: bool,
    stack_limit: usize,
    last_error: RefCell<Option<LastError>>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        Self::with_log_sink(options, None)
    }

    pub fn with_log_sink(options: ContextOptions, log_sink: Option<LogSink>) -> Self {
        debug_assert!(
            crate::dispatch::build_table().iter().all(|&reachable| reachable),
            "every dispatch slot should be reachable from some Op"
        );
        Self {
            funcrefs: RefCell::new(FuncRefRegistry::new()),
            all_funcrefs: RefCell::new(Vec::new()),
            types: RefCell::new(TypeRegistry::new()),
            functions: RefCell::new(Vec::new()),
            observer: RefCell::new(None),
            log_sink,
            log_priority: options.log_priority,
            debug_alloc: options.debug_alloc,
            stack_limit: options.stack_limit,
            last_error: RefCell::new(None),
        }
    }

    /// The most recent failure recorded by any fallible method on this
    /// `Context`, overwritten on every subsequent failure.
    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.borrow().clone()
    }

    /// Install the callback fired when a registered function's observable
    /// availability changes (design §4.7's edge-triggered observer).
    pub fn set_availability_observer<F>(&self, observer: F)
    where
        F: Fn(&Rc<Function>, bool) + 'static,
    {
        *self.observer.borrow_mut() = Some(Box::new(observer));
    }

    pub fn registered_functions(&self) -> Vec<Rc<Function>> {
        self.functions.borrow().clone()
    }

    fn log(&self, priority: LogPriority, function: &str, message: std::fmt::Arguments<'_>) {
        crate::log::emit(self.log_sink.as_ref(), self.log_priority, priority, file!(), line!(), function, message);
    }

    fn fail(&self, note: Option<&Note>, located: Located) -> Error {
        let note_source = note.and_then(Note::source).map(Rc::from);
        let last = located.error.clone().at(note_source, located.offset);
        self.log(LogPriority::Err, "Context", format_args!("{last}"));
        *self.last_error.borrow_mut() = Some(last);
        located.error
    }

    /// Find or intern a global `FuncRef`, or wrap a local one, from its four
    /// decoded parts.
    fn make_funcref(&self, provider: &str, name: &str, params: Vec<Type>, returns: Vec<Type>) -> Result<Rc<FuncRef>> {
        let local = provider.is_empty();
        let ty = self.types.borrow_mut().intern(crate::ty::FunctionType::new(params, returns));
        let funcref = FuncRef::with_ty(provider, name, ty, local)?;
        let rc = if funcref.is_global() {
            self.funcrefs.borrow_mut().intern(funcref)
        } else {
            Rc::new(funcref)
        };
        let mut all = self.all_funcrefs.borrow_mut();
        if !all.iter().any(|f| Rc::ptr_eq(f, &rc)) {
            all.push(rc.clone());
        }
        Ok(rc)
    }

    /// Parse one `(provider_off, name_off, ptypes_off, rtypes_off)` entry
    /// from a Signature/Externals chunk cursor and intern it.
    fn read_signature_entry(&self, note: &Note, cur: &mut ReadBuf<'_>) -> crate::error::DResult<Rc<FuncRef>> {
        let offset = cur.current_offset();
        let provider_off = cur.read_uleb128().locate(offset)?;
        let name_off = cur.read_uleb128().locate(offset)?;
        let ptypes_off = cur.read_uleb128().locate(offset)?;
        let rtypes_off = cur.read_uleb128().locate(offset)?;

        let provider = note.string_at(provider_off as usize).locate(offset)?;
        let name = note.string_at(name_off as usize).locate(offset)?;
        let ptypes_str = note.string_at(ptypes_off as usize).locate(offset)?;
        let rtypes_str = note.string_at(rtypes_off as usize).locate(offset)?;

        let params = Type::parse_sequence(ptypes_str).locate(offset)?;
        let returns = Type::parse_sequence(rtypes_str).locate(offset)?;

        self.make_funcref(provider, name, params, returns).locate(offset)
    }

    /// Decode a note's Signature and Externals chunks into interned
    /// `FuncRef`s: the function's own signature, plus each external in
    /// order.
    fn read_signatures(&self, note: &Note) -> crate::error::DResult<(Rc<FuncRef>, Vec<Rc<FuncRef>>)> {
        let sig_chunk = note.require_unique(ChunkKind::Signature)?;
        let mut cur = note.reader(sig_chunk, ByteOrder::Native);
        let own_ref = self.read_signature_entry(note, &mut cur)?;

        let mut externals = Vec::new();
        if let Some(chunk) = note.find_unique(ChunkKind::Externals)? {
            let mut cur = note.reader(chunk, ByteOrder::Native);
            while cur.bytes_left() > 0 {
                externals.push(self.read_signature_entry(note, &mut cur)?);
            }
        }
        Ok((own_ref, externals))
    }

    /// Decode a bytecode note, build a bytecode [`Function`] from it, and
    /// register it.
    pub fn import_bytecode(&self, bytes: &[u8], source: Option<Rc<str>>, base_offset: usize) -> Result<Rc<Function>> {
        let note = Note::parse(bytes, source, base_offset).inspect_err(|error| {
            let last = error.clone().at(None, base_offset);
            self.log(LogPriority::Err, "Context::import_bytecode", format_args!("{last}"));
            *self.last_error.borrow_mut() = Some(last);
        })?;
        let note = Rc::new(note);

        let build = || -> crate::error::DResult<Rc<Function>> {
            let (funcref, externals) = self.read_signatures(&note)?;
            let code = crate::code::Code::new(&note, &funcref, &externals)?;
            Ok(Function::new_bytecode(funcref, note.clone(), externals, code))
        };

        match build() {
            Ok(func) => {
                self.register_func(func.clone());
                Ok(func)
            }
            Err(located) => Err(self.fail(Some(&note), located)),
        }
    }

    /// Build a native [`Function`] for `signature` and register it.
    pub fn import_native(&self, signature: &str, implementation: NativeFn) -> Result<Rc<Function>> {
        let funcref = self.get_funcref(signature)?;
        let func = Function::new_native(funcref, implementation);
        self.register_func(func.clone());
        Ok(func)
    }

    /// Find or build the `FuncRef` named by a `provider::name(ptypes)rtypes`
    /// signature string, interning it if global.
    pub fn get_funcref(&self, signature: &str) -> Result<Rc<FuncRef>> {
        if let Some(existing) = self.funcrefs.borrow().lookup(signature) {
            return Ok(existing);
        }
        let (provider, name, params, returns) = parse_signature(signature)?;
        self.make_funcref(&provider, &name, params, returns)
    }

    /// Register `func`, then re-run the resolution fixpoint over the whole
    /// registry.
    pub fn register_func(&self, func: Rc<Function>) {
        self.functions.borrow_mut().push(func);
        let functions = self.functions.borrow().clone();
        self.recompute_funcref_resolution(&functions);
        self.cascade_and_notify(&functions);
    }

    /// Remove `func` from the registry (by `Rc::ptr_eq`), then re-run the
    /// resolution fixpoint.
    ///
    /// `func` itself no longer appears in the registry the fixpoint walks,
    /// so its own availability transition (almost always true → false,
    /// since removing it leaves no candidate for its signature) is reported
    /// directly, before the cascade over the surviving registry runs — this
    /// crate's settled resolution of the design's open question about
    /// `unregister_func`'s exact behaviour, chosen so the edge-triggered
    /// observer sees the removed function's own unavailability rather than
    /// silently dropping it.
    pub fn unregister_func(&self, func: &Rc<Function>) {
        self.functions.borrow_mut().retain(|f| !Rc::ptr_eq(f, func));
        let functions = self.functions.borrow().clone();
        self.recompute_funcref_resolution(&functions);
        self.notify_if_changed(func);
        self.cascade_and_notify(&functions);
    }

    /// Phase 1: for each `FuncRef` ever created (global or local), is there
    /// exactly one function in `functions` with its signature?
    fn recompute_funcref_resolution(&self, functions: &[Rc<Function>]) {
        for funcref in self.all_funcrefs.borrow().iter() {
            let candidates: Vec<&Rc<Function>> =
                functions.iter().filter(|f| f.funcref().signature() == funcref.signature()).collect();
            match candidates.as_slice() {
                [only] => funcref.set_resolved(Some(only)),
                _ => funcref.set_resolved(None),
            }
        }
    }

    /// Fire the availability observer for `func` if its funcref's resolved
    /// state (as last recomputed) differs from what the host was last told.
    fn notify_if_changed(&self, func: &Rc<Function>) {
        let available = func.funcref().is_resolved();
        if available != func.observed_available() {
            if let Some(observer) = self.observer.borrow().as_ref() {
                observer(func, available);
            }
            func.set_observed_available(available);
        }
    }

    /// Phase 2: silently downgrade every function whose funcref is tentatively
    /// resolved (per phase 1) but whose own externals aren't all available,
    /// repeating until a full scan makes no further change.
    ///
    /// This has to run to a complete fixpoint before any notification goes
    /// out: phase 1 optimistically resolves every funcref by signature alone,
    /// so mid-scan a function can still see a stale "resolved" reading on
    /// something it depends on. Reporting off of that would tell the host a
    /// function is available only to immediately correct itself.
    fn downgrade_to_fixpoint(&self, functions: &[Rc<Function>]) {
        loop {
            let mut changed = false;
            for func in functions {
                if func.funcref().is_resolved() && !func.is_available() {
                    func.funcref().set_resolved(None);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Phase 3: report every function whose resolved state (now stable)
    /// disagrees with what the host was last told.
    ///
    /// Functions newly becoming available are reported in registration
    /// order; functions newly becoming unavailable are reported in reverse
    /// registration order. The latter is what gives a dependency chain's
    /// unavailability cascade its natural, root-cause-first firing order:
    /// unregistering the bottom of a chain is reported before each of its
    /// dependents, which (in this crate) tend to have been registered after
    /// what they depend on.
    fn cascade_and_notify(&self, functions: &[Rc<Function>]) {
        self.downgrade_to_fixpoint(functions);
        for func in functions {
            if func.funcref().is_resolved() {
                self.notify_if_changed(func);
            }
        }
        for func in functions.iter().rev() {
            if !func.funcref().is_resolved() {
                self.notify_if_changed(func);
            }
        }
    }

    /// Run `func` to completion against `inferior`, using this `Context`'s
    /// configured stack budget and log sink.
    pub fn call(&self, func: &Rc<Function>, inferior: &Rc<dyn Inferior>, args: &[Value]) -> Result<Vec<Value>> {
        interp::call(func, inferior, args, self.stack_limit, self.log_sink.as_ref(), self.log_priority).inspect_err(|error| {
            let last = error.clone().at(func.note().and_then(|n| n.source()).map(Rc::from), 0);
            self.log(LogPriority::Err, "Context::call", format_args!("{last}"));
            *self.last_error.borrow_mut() = Some(last);
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextOptions::default())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.debug_alloc {
            return;
        }
        for func in self.functions.borrow().iter() {
            let extra = Rc::strong_count(func) - 1;
            if extra > 0 {
                let message = format!("{} still has {extra} outstanding reference(s) at Context drop", func.funcref());
                tracing::warn!("{message}");
                debug_assert!(extra == 0, "{message}");
            }
        }
    }
}

/// Parse `provider::name(ptypes)rtypes`, balancing parens so a nested
/// function-type parameter's own `(...)` doesn't terminate the list early.
fn parse_signature(signature: &str) -> Result<(String, String, Vec<Type>, Vec<Type>)> {
    let (provider, rest) = signature
        .split_once("::")
        .ok_or_else(|| Error::InvalidArgument(format!("missing '::' in signature '{signature}'")))?;
    let paren = rest
        .find('(')
        .ok_or_else(|| Error::InvalidArgument(format!("missing '(' in signature '{signature}'")))?;
    let name = &rest[..paren];
    let after_paren = &rest[paren + 1..];
    let (ptypes_str, rtypes_str) = split_at_matching_paren(after_paren)
        .ok_or_else(|| Error::InvalidArgument(format!("unbalanced parentheses in '{signature}'")))?;

    let params = Type::parse_sequence(ptypes_str)?;
    let returns = Type::parse_sequence(rtypes_str)?;
    Ok((provider.to_string(), name.to_string(), params, returns))
}

fn split_at_matching_paren(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn strtobool_accepts_numbers_and_name_prefixes() {
        assert!(strtobool("1"));
        assert!(!strtobool("0"));
        assert!(strtobool("yes"));
        assert!(strtobool("TRUE"));
        assert!(!strtobool("no"));
    }

    #[test]
    fn import_native_then_native_resolves_and_calls() {
        let ctx = Context::new(ContextOptions::new());
        let doubler: NativeFn = Rc::new(|_xctx, args, rets| {
            rets[0] = Value::int(args[0].as_i64() * 2);
            Ok(())
        });
        let func = ctx.import_native("host::double(i)i", doubler).unwrap();
        assert!(func.funcref().is_resolved());
    }

    #[test]
    fn unregister_drops_resolution() {
        let ctx = Context::new(ContextOptions::new());
        let noop: NativeFn = Rc::new(|_xctx, _args, _rets| Ok(()));
        let func = ctx.import_native("host::noop()", noop).unwrap();
        let funcref = func.funcref().clone();
        assert!(funcref.is_resolved());
        ctx.unregister_func(&func);
        assert!(!funcref.is_resolved());
    }

    #[test]
    fn duplicate_registration_leaves_funcref_unresolved() {
        let ctx = Context::new(ContextOptions::new());
        let noop: NativeFn = Rc::new(|_xctx, _args, _rets| Ok(()));
        let a = ctx.import_native("host::dup()", noop.clone()).unwrap();
        assert!(a.funcref().is_resolved());
        let b = ctx.import_native("host::dup()", noop).unwrap();
        assert!(!a.funcref().is_resolved());
        assert!(!b.funcref().is_resolved());
    }

    #[test]
    fn availability_observer_fires_on_change() {
        let ctx = Context::new(ContextOptions::new());
        let seen = Rc::new(Cell::new(0usize));
        let seen2 = seen.clone();
        ctx.set_availability_observer(move |_func, available| {
            if available {
                seen2.set(seen2.get() + 1);
            }
        });
        let noop: NativeFn = Rc::new(|_xctx, _args, _rets| Ok(()));
        ctx.import_native("host::fire()", noop).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn bad_signature_is_invalid_argument() {
        let ctx = Context::new(ContextOptions::new());
        let err = ctx.get_funcref("not-a-signature").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn import_bytecode_rejects_note_missing_signature_chunk() {
        let ctx = Context::new(ContextOptions::new());
        let err = ctx.import_bytecode(&[], None, 0).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(ctx.last_error().is_some());
    }
}
