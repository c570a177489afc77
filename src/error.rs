//! Error taxonomy and last-error bookkeeping
//!
//! Every fallible operation in this crate returns [`Result`]. Failures are
//! grouped into the categories from the design: resource errors, note
//! parsing errors, linking errors and runtime errors. A [`Context`] keeps the
//! most recent [`LastError`] around so a host can ask "what, and where, after
//! the fact" instead of threading diagnostics through every call site.
//!
//! [`Context`]: crate::context::Context

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A host-supplied status code, surfaced back through [`Error::ReadMemFailed`]
/// or [`Error::RelocFailed`].
pub type HostStatus = i32;

/// Error taxonomy for the note/bytecode subsystem.
///
/// Variants are grouped, in source order, the way the design's §7 groups
/// them: resource, note parsing, linking, runtime.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Allocation failed. The crate itself never allocates unboundedly, so
    /// this generally means a host-supplied capacity was exceeded.
    #[error("out of memory")]
    OutOfMemory,
    /// A caller passed an argument outside its documented domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The byte stream was truncated or otherwise malformed.
    #[error("corrupt note data: {0}")]
    Corrupt(String),
    /// The byte stream was well-formed but describes something this
    /// implementation does not support (unknown opcode, LEB128 overflow,
    /// unsupported wordsize, unknown chunk version...).
    #[error("unhandled: {0}")]
    Unhandled(String),
    /// The byte stream was well-formed and within supported limits, but
    /// semantically wrong (branch to a non-instruction, stack type
    /// mismatch, `max_stack` below `num_params`...).
    #[error("invalid: {0}")]
    Invalid(String),

    /// A call was attempted through a [`FuncRef`] with no registered
    /// implementation.
    ///
    /// [`FuncRef`]: crate::funcref::FuncRef
    #[error("unresolved function: {0}")]
    UnresolvedFunction(String),

    /// The value stack and call stack met.
    #[error("stack overflow")]
    StackOverflow,
    /// The host's `relocate` callback returned a non-OK status.
    #[error("relocation failed (host status {0})")]
    RelocFailed(HostStatus),
    /// The host's `read_memory` callback returned a non-OK status.
    #[error("memory read failed (host status {0})")]
    ReadMemFailed(HostStatus),
    /// A `div`/`mod` instruction saw a zero divisor.
    #[error("division by zero")]
    DivideByZero,
    /// A native function call failed to complete.
    #[error("native call failed: {0}")]
    NatcallFailed(String),
    /// A native function returned a value through a return slot typed as a
    /// function reference, but did not return a resolvable [`FuncRef`].
    ///
    /// [`FuncRef`]: crate::funcref::FuncRef
    #[error("native call returned a bad function reference")]
    NatcallBadFuncrefRet,
}

impl Error {
    /// Wrap this error with the note offset of the construct that caused it,
    /// producing a [`LastError`] suitable for storing on a [`Context`].
    ///
    /// [`Context`]: crate::context::Context
    pub fn at(self, note: Option<Rc<str>>, offset: usize) -> LastError {
        LastError {
            error: self,
            note_source: note,
            offset,
            #[cfg(feature = "backtrace")]
            backtrace: Rc::new(backtrace::Backtrace::new_unresolved()),
        }
    }
}

/// The last error recorded on a [`Context`]: the failure itself, plus enough
/// location to point a host at the failing construct.
///
/// Overwritten by every failing operation (design §7, §9): a host that wants
/// the detail behind a non-OK return must read this before making another
/// call.
///
/// [`Context`]: crate::context::Context
#[derive(Debug, Clone)]
pub struct LastError {
    error: Error,
    note_source: Option<Rc<str>>,
    offset: usize,
    #[cfg(feature = "backtrace")]
    backtrace: Rc<backtrace::Backtrace>,
}

impl LastError {
    /// The error itself.
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// The source filename of the note that caused this error, if known.
    pub fn note_source(&self) -> Option<&str> {
        self.note_source.as_deref()
    }

    /// The byte offset within that note of the failing construct.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// The captured backtrace, when the `backtrace` feature is enabled.
    #[cfg(feature = "backtrace")]
    pub fn backtrace(&self) -> &backtrace::Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.note_source {
            Some(src) => write!(f, "{src}+0x{:x}: {}", self.offset, self.error),
            None => write!(f, "+0x{:x}: {}", self.offset, self.error),
        }
    }
}

/// An [`Error`] paired with the byte offset of the construct that caused it.
///
/// Used internally while decoding a note, where the offset is known at the
/// point of failure but the owning [`Note`]/[`Context`] isn't yet in scope
/// to build a full [`LastError`].
///
/// [`Note`]: crate::note::Note
/// [`Context`]: crate::context::Context
#[derive(Debug, Clone)]
pub(crate) struct Located {
    pub error: Error,
    pub offset: usize,
}

impl Located {
    pub fn new(error: Error, offset: usize) -> Self {
        Self { error, offset }
    }
}

/// Alias for decode-phase functions that need to carry a failure offset.
pub(crate) type DResult<T> = std::result::Result<T, Located>;

/// Attaches an offset to a plain [`Result`], turning it into a [`DResult`].
pub(crate) trait Locate<T> {
    fn locate(self, offset: usize) -> DResult<T>;
}

impl<T> Locate<T> for Result<T> {
    fn locate(self, offset: usize) -> DResult<T> {
        self.map_err(|error| Located::new(error, offset))
    }
}
