//! Address relocation: as-stored-in-a-note to as-lives-in-the-inferior
//!
//! A [`Reloc`] remembers one unrelocated address and caches the last
//! inferior it was relocated against. The cache is single-slot: asking
//! against a different inferior invalidates it (design §3, §4.6, §5). This
//! makes the interpreter not re-entrant across inferiors sharing the same
//! `Code`, but relocations remain correct — they just thrash.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::inferior::{self, Inferior};

struct Cache {
    value: u64,
    from: *const (),
}

/// An address as it appears in a note, plus a single-slot relocated-value
/// cache.
pub struct Reloc {
    unrelocated: u64,
    cache: RefCell<Option<Cache>>,
}

impl Reloc {
    pub fn new(unrelocated: u64) -> Self {
        Self {
            unrelocated,
            cache: RefCell::new(None),
        }
    }

    /// The address exactly as it appeared in the note.
    pub const fn unrelocated(&self) -> u64 {
        self.unrelocated
    }

    /// Resolve against `inf`, using the cached value if `inf` is the same
    /// inferior as the last call, otherwise invoking `inf.relocate` and
    /// refreshing the cache.
    pub fn resolve(&self, inf: &Rc<dyn Inferior>) -> Result<u64> {
        let key = inferior::identity(inf);
        if let Some(cache) = self.cache.borrow().as_ref() {
            if cache.from == key {
                return Ok(cache.value);
            }
        }
        let value = inf.relocate(self).map_err(Error::RelocFailed)?;
        *self.cache.borrow_mut() = Some(Cache { value, from: key });
        Ok(value)
    }
}

impl std::fmt::Debug for Reloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloc").field("unrelocated", &self.unrelocated).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingInferior {
        calls: Rc<Cell<u32>>,
        base: u64,
    }

    impl Inferior for CountingInferior {
        fn read_memory(&self, _address: u64, _out: &mut [u8]) -> std::result::Result<(), i32> {
            unimplemented!()
        }

        fn relocate(&self, reloc: &Reloc) -> std::result::Result<u64, i32> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.base + reloc.unrelocated())
        }
    }

    #[test]
    fn caches_against_same_inferior() {
        let reloc = Reloc::new(0x10);
        let calls = Rc::new(Cell::new(0));
        let inf: Rc<dyn Inferior> = Rc::new(CountingInferior {
            calls: calls.clone(),
            base: 0x1000,
        });
        assert_eq!(reloc.resolve(&inf).unwrap(), 0x1010);
        assert_eq!(reloc.resolve(&inf).unwrap(), 0x1010);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn invalidates_on_different_inferior() {
        let reloc = Reloc::new(0x10);
        let a: Rc<dyn Inferior> = Rc::new(CountingInferior {
            calls: Rc::new(Cell::new(0)),
            base: 0x1000,
        });
        let b: Rc<dyn Inferior> = Rc::new(CountingInferior {
            calls: Rc::new(Cell::new(0)),
            base: 0x2000,
        });
        assert_eq!(reloc.resolve(&a).unwrap(), 0x1010);
        assert_eq!(reloc.resolve(&b).unwrap(), 0x2010);
        assert_eq!(reloc.resolve(&a).unwrap(), 0x1010);
    }
}
