//! Types: core types and function types
//!
//! A [`Type`] is either a *core type* (integer, pointer, opaque, or the
//! validator-internal "int-or-ptr") or a function type. Function types are
//! interned per [`Context`] by their canonical encoded string; identity is
//! then by pointer ([`Rc::ptr_eq`]) rather than structural comparison,
//! matching the design's §3/§4.3.
//!
//! [`Context`]: crate::context::Context

use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};

/// A function's parameter and return types, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    params: Vec<Type>,
    returns: Vec<Type>,
}

impl FunctionType {
    pub fn new(params: Vec<Type>, returns: Vec<Type>) -> Self {
        Self { params, returns }
    }

    pub fn params(&self) -> &[Type] {
        &self.params
    }

    pub fn returns(&self) -> &[Type] {
        &self.returns
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F")?;
        for t in &self.returns {
            write!(f, "{t}")?;
        }
        write!(f, "(")?;
        for t in &self.params {
            write!(f, "{t}")?;
        }
        write!(f, ")")
    }
}

/// Either a core type or an interned function type.
#[derive(Debug, Clone)]
pub enum Type {
    /// `i`: a signed or unsigned machine word.
    Integer,
    /// `p`: an opaque-to-arithmetic pointer value.
    Pointer,
    /// `o`: an opaque handle, e.g. a function reference on the stack.
    Opaque,
    /// `x`: validator-internal "could be integer or pointer" — the type of
    /// `DW_OP_lit0`, never written to the wire.
    IntOrPtr,
    /// A function type, interned and shared by pointer.
    Function(Rc<FunctionType>),
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer, Self::Integer) => true,
            (Self::Pointer, Self::Pointer) => true,
            (Self::Opaque, Self::Opaque) => true,
            (Self::IntOrPtr, Self::IntOrPtr) => true,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}
impl Eq for Type {}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "i"),
            Self::Pointer => write!(f, "p"),
            Self::Opaque => write!(f, "o"),
            Self::IntOrPtr => write!(f, "x"),
            Self::Function(ft) => write!(f, "{ft}"),
        }
    }
}

impl Type {
    /// Encode to the flat ASCII form used on the wire and in signatures.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// The validator's type-matching rule: identical types match, and
    /// `IntOrPtr` matches either `Integer` or `Pointer`.
    pub fn matches(&self, other: &Type) -> bool {
        match (self, other) {
            (Self::IntOrPtr, Self::Integer | Self::Pointer) => true,
            (Self::Integer | Self::Pointer, Self::IntOrPtr) => true,
            _ => self == other,
        }
    }

    /// Parse one type (core or function) from the front of `s`, returning
    /// it and the unconsumed remainder.
    pub fn parse(s: &str) -> Result<(Type, &str)> {
        let mut chars = s.char_indices();
        let (_, c) = chars
            .next()
            .ok_or_else(|| Error::Corrupt("empty type string".into()))?;
        match c {
            'i' => Ok((Type::Integer, &s[1..])),
            'p' => Ok((Type::Pointer, &s[1..])),
            'o' => Ok((Type::Opaque, &s[1..])),
            'x' => Ok((Type::IntOrPtr, &s[1..])),
            'F' => {
                let mut rest = &s[1..];
                let mut returns = Vec::new();
                while !rest.starts_with('(') {
                    let (t, next) = Type::parse(rest)?;
                    returns.push(t);
                    rest = next;
                }
                rest = &rest[1..]; // consume '('
                let mut params = Vec::new();
                while !rest.starts_with(')') {
                    let (t, next) = Type::parse(rest)?;
                    params.push(t);
                    rest = next;
                }
                rest = &rest[1..]; // consume ')'
                Ok((Type::Function(Rc::new(FunctionType::new(params, returns))), rest))
            }
            other => Err(Error::Unhandled(format!("unknown type character '{other}'"))),
        }
    }

    /// Parse a sequence of types until the end of `s`.
    pub fn parse_sequence(mut s: &str) -> Result<Vec<Type>> {
        let mut out = Vec::new();
        while !s.is_empty() {
            let (t, rest) = Type::parse(s)?;
            out.push(t);
            s = rest;
        }
        Ok(out)
    }
}

/// Per-`Context` interning table for function types, keyed by canonical
/// encoded string.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    interned: Vec<Rc<FunctionType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `ft`, returning the canonical shared instance. Subsequent
    /// calls with an equal-by-string type return the same `Rc`.
    pub fn intern(&mut self, ft: FunctionType) -> Rc<FunctionType> {
        let encoded = ft.to_string();
        if let Some(existing) = self.interned.iter().find(|f| f.to_string() == encoded) {
            return existing.clone();
        }
        let arc = Rc::new(ft);
        self.interned.push(arc.clone());
        arc
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
    fn round_trips_function_type_encoding() {
        let (t, rest) = Type::parse("Fi(po)").unwrap();
        assert_eq!(rest, "");
        assert_eq!(t.encode(), "Fi(po)");
    }

    #[test]
    fn int_or_ptr_matches_both() {
        assert!(Type::IntOrPtr.matches(&Type::Integer));
        assert!(Type::IntOrPtr.matches(&Type::Pointer));
        assert!(!Type::IntOrPtr.matches(&Type::Opaque));
        assert!(!Type::Integer.matches(&Type::Pointer));
    }

    #[test]
    fn interning_is_idempotent() {
        let mut reg = TypeRegistry::new();
        let (Type::Function(ft1), _) = Type::parse("Fi(po)").unwrap() else {
            unreachable!()
        };
        let (Type::Function(ft2), _) = Type::parse("Fi(po)").unwrap() else {
            unreachable!()
        };
        let a = reg.intern((*ft1).clone());
        let b = reg.intern((*ft2).clone());
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }
}
