//! Function references: signature handles that may or may not be resolved
//!
//! A [`FuncRef`] names a function by its canonical signature
//! `provider::name(ptypes)rtypes`. Global `FuncRef`s (non-empty provider)
//! are interned per [`Context`] by that string; a `FuncRef` is *resolved*
//! iff exactly one registered [`Function`] carries this signature and every
//! one of that function's externals is itself resolved (design §3, §4.7).
//!
//! [`Context`]: crate::context::Context

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::function::Function;
use crate::ty::{FunctionType, Type};

fn valid_identifier(s: &str, allow_empty: bool) -> bool {
    if s.is_empty() {
        return allow_empty;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if first.is_ascii_digit() {
        return false;
    }
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A function reference: `provider::name(ptypes)rtypes`.
#[derive(Debug)]
pub struct FuncRef {
    provider: String,
    name: String,
    ty: Rc<FunctionType>,
    /// `true` iff built from a Signature chunk whose provider was empty —
    /// such a reference is never interned into a [`Context`]'s registry.
    local: bool,
    resolved: RefCell<Option<Weak<Function>>>,
}

impl FuncRef {
    /// Build a `FuncRef` from its four string parts, validating the
    /// provider/name character classes from design §4.3.
    ///
    /// `provider` may be empty only when `local` is `true`.
    pub fn new(provider: &str, name: &str, params: Vec<Type>, returns: Vec<Type>, local: bool) -> Result<Self> {
        Self::with_ty(provider, name, Rc::new(FunctionType::new(params, returns)), local)
    }

    /// As [`FuncRef::new`], but taking an already-built (and possibly
    /// already-interned) [`FunctionType`] rather than constructing a fresh
    /// one.
    pub(crate) fn with_ty(provider: &str, name: &str, ty: Rc<FunctionType>, local: bool) -> Result<Self> {
        if !valid_identifier(provider, local) {
            return Err(Error::InvalidArgument(format!("invalid provider '{provider}'")));
        }
        if !valid_identifier(name, false) {
            return Err(Error::InvalidArgument(format!("invalid function name '{name}'")));
        }
        Ok(Self {
            provider: provider.to_string(),
            name: name.to_string(),
            ty,
            local,
            resolved: RefCell::new(None),
        })
    }

    /// The canonical signature string: `provider::name(ptypes)rtypes`.
    pub fn signature(&self) -> String {
        let ptypes: String = self.ty.params().iter().map(Type::encode).collect();
        let rtypes: String = self.ty.returns().iter().map(Type::encode).collect();
        format!("{}::{}({ptypes}){rtypes}", self.provider, self.name)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` iff this reference's provider is non-empty, i.e. it is
    /// eligible for interning in a [`Context`]'s global registry.
    ///
    /// [`Context`]: crate::context::Context
    pub fn is_global(&self) -> bool {
        !self.local
    }

    /// `true` iff the name part begins with `__`.
    pub fn is_private(&self) -> bool {
        self.name.starts_with("__")
    }

    pub fn ty(&self) -> &Rc<FunctionType> {
        &self.ty
    }

    pub fn num_params(&self) -> usize {
        self.ty.params().len()
    }

    pub fn num_returns(&self) -> usize {
        self.ty.returns().len()
    }

    /// The `Function` currently satisfying this reference, if resolved.
    pub fn resolved_function(&self) -> Option<Rc<Function>> {
        self.resolved.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// `true` iff this reference is resolved (design §3's invariant is
    /// enforced by [`Context`]'s resolution fixpoint, not by this getter —
    /// this simply reports the last-computed state).
    ///
    /// [`Context`]: crate::context::Context
    pub fn is_resolved(&self) -> bool {
        self.resolved_function().is_some()
    }

    pub(crate) fn set_resolved(&self, function: Option<&Rc<Function>>) {
        *self.resolved.borrow_mut() = function.map(Rc::downgrade);
    }
}

impl fmt::Display for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature())
    }
}

/// Per-[`Context`] interning table for global `FuncRef`s, keyed by
/// signature.
///
/// [`Context`]: crate::context::Context
#[derive(Debug, Default)]
pub struct FuncRefRegistry {
    interned: Vec<Rc<FuncRef>>,
}

impl FuncRefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or intern a global `FuncRef` for this signature.
    ///
    /// Panics (a programmer error, not a host-facing one) if `funcref` is
    /// local — callers must check [`FuncRef::is_global`] first.
    pub fn intern(&mut self, funcref: FuncRef) -> Rc<FuncRef> {
        assert!(funcref.is_global(), "attempted to intern a local FuncRef");
        let sig = funcref.signature();
        if let Some(existing) = self.interned.iter().find(|f| f.signature() == sig) {
            return existing.clone();
        }
        let rc = Rc::new(funcref);
        self.interned.push(rc.clone());
        rc
    }

    pub fn lookup(&self, signature: &str) -> Option<Rc<FuncRef>> {
        self.interned.iter().find(|f| f.signature() == signature).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<FuncRef>> {
        self.interned.iter()
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_encodes_provider_name_and_type() {
        let f = FuncRef::new("libfoo", "bar", vec![Type::Pointer], vec![Type::Integer], false).unwrap();
        assert_eq!(f.signature(), "libfoo::bar(p)i");
    }

    #[test]
    fn private_names_start_with_double_underscore() {
        let f = FuncRef::new("libfoo", "__priv", vec![], vec![], false).unwrap();
        assert!(f.is_private());
        let g = FuncRef::new("libfoo", "pub_fn", vec![], vec![], false).unwrap();
        assert!(!g.is_private());
    }

    #[test]
    fn empty_provider_rejected_unless_local() {
        assert!(FuncRef::new("", "bar", vec![], vec![], false).is_err());
        assert!(FuncRef::new("", "bar", vec![], vec![], true).is_ok());
    }

    #[test]
    fn rejects_names_starting_with_digit() {
        assert!(FuncRef::new("libfoo", "1bad", vec![], vec![], false).is_err());
    }

    #[test]
    fn registry_interns_by_signature() {
        let mut reg = FuncRefRegistry::new();
        let a = reg.intern(FuncRef::new("libfoo", "bar", vec![], vec![], false).unwrap());
        let b = reg.intern(FuncRef::new("libfoo", "bar", vec![], vec![], false).unwrap());
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }
}
