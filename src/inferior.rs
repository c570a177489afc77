//! The host collaborator interface: the process under inspection
//!
//! The core never touches `/proc`, ptrace, or any other OS facility to
//! learn about the inferior (design §1 Non-goals). Everything it knows
//! comes through this trait, supplied by the host once per call.

use crate::error::HostStatus;
use crate::reloc::Reloc;

/// The process being inspected, as seen through host-supplied callbacks.
///
/// Implementations are expected to be cheap to pass by reference; the
/// interpreter invokes both methods synchronously and may invoke
/// `read_memory` many times per call.
pub trait Inferior {
    /// Read `out.len()` bytes from `address` in the inferior.
    ///
    /// A non-OK `HostStatus` is surfaced as [`Error::ReadMemFailed`].
    ///
    /// [`Error::ReadMemFailed`]: crate::error::Error::ReadMemFailed
    fn read_memory(&self, address: u64, out: &mut [u8]) -> Result<(), HostStatus>;

    /// Relocate an as-stored-in-a-note address to where it lives in this
    /// inferior.
    ///
    /// A non-OK `HostStatus` is surfaced as [`Error::RelocFailed`].
    ///
    /// [`Error::RelocFailed`]: crate::error::Error::RelocFailed
    fn relocate(&self, reloc: &Reloc) -> Result<u64, HostStatus>;
}

/// A pointer-identity key for an `Rc<dyn Inferior>`, used by [`Reloc`]'s
/// single-slot cache to detect "a different inferior is asking" (design
/// §4.6, §5).
pub(crate) fn identity(inferior: &std::rc::Rc<dyn Inferior>) -> *const () {
    std::rc::Rc::as_ptr(inferior) as *const ()
}
