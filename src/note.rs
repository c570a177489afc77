//! Note decoding: a byte slice to an ordered list of chunks
//!
//! A [`Note`] owns a copy of the raw note bytes (plus a source name and
//! offset, for diagnostics) and an ordered list of [`Chunk`]s sliced out of
//! them. It is immutable once built: [`Note::parse`] is the only
//! constructor.

use std::ops::Range;
use std::rc::Rc;

use crate::error::{DResult, Error, Located, Result};
use crate::readbuf::{ByteOrder, ReadBuf};

/// A chunk's type, identifying what its payload means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Signature,
    Bytecode,
    Externals,
    Strings,
    CodeInfo,
    /// A type-id this crate doesn't know about; carried so that
    /// `get_unique_chunk` still sees it for duplicate detection, but never
    /// otherwise consulted.
    Unknown(u64),
}

impl ChunkKind {
    fn from_type_id(type_id: u64) -> Self {
        match type_id {
            1 => Self::Signature,
            2 => Self::Bytecode,
            3 => Self::Externals,
            4 => Self::Strings,
            5 => Self::CodeInfo,
            other => Self::Unknown(other),
        }
    }

    const fn type_id(self) -> u64 {
        match self {
            Self::Signature => 1,
            Self::Bytecode => 2,
            Self::Externals => 3,
            Self::Strings => 4,
            Self::CodeInfo => 5,
            Self::Unknown(id) => id,
        }
    }
}

/// One `(type_id, version, payload)` triple decoded from a note.
#[derive(Debug, Clone)]
pub struct Chunk {
    kind: ChunkKind,
    version: u64,
    payload: Range<usize>,
    /// Offset of this chunk's header within the owning note, for
    /// diagnostics.
    note_offset: usize,
}

impl Chunk {
    pub const fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub const fn note_offset(&self) -> usize {
        self.note_offset
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// An Infinity Note: a self-contained list of chunks decoded from one ELF
/// note body.
#[derive(Debug)]
pub struct Note {
    bytes: Vec<u8>,
    source: Option<Rc<str>>,
    base_offset: usize,
    chunks: Vec<Chunk>,
    strings: Option<Range<usize>>,
}

impl Note {
    /// Decode `bytes` into a [`Note`]. `source` and `base_offset` are
    /// carried purely for diagnostics (they appear in [`LastError`]
    /// messages).
    ///
    /// Chunks of zero payload size are dropped. The `Strings` chunk
    /// (type 4, version 1), if present, must have a trailing NUL byte.
    ///
    /// [`LastError`]: crate::error::LastError
    pub fn parse(bytes: &[u8], source: Option<Rc<str>>, base_offset: usize) -> Result<Self> {
        let mut chunks = Vec::new();
        let mut cur = ReadBuf::new(bytes, ByteOrder::Native);
        while cur.bytes_left() > 0 {
            let header_offset = cur.current_offset();
            let type_id = cur.read_uleb128()?;
            let version = cur.read_uleb128()?;
            let size = cur.read_uleb128()? as usize;
            let payload_start = cur.current_offset();
            cur.read_bytes(size)?;
            if size == 0 {
                continue;
            }
            chunks.push(Chunk {
                kind: ChunkKind::from_type_id(type_id),
                version,
                payload: payload_start..payload_start + size,
                note_offset: header_offset,
            });
        }

        let mut note = Self {
            bytes: bytes.to_vec(),
            source,
            base_offset,
            chunks,
            strings: None,
        };

        if let Some(strings) = note.find_unique(ChunkKind::Strings).map_err(|l| l.error)? {
            if strings.version() != 1 {
                return Err(Error::Unhandled(format!(
                    "unsupported Strings chunk version {}",
                    strings.version()
                )));
            }
            let range = strings.payload.clone();
            if note.bytes[range.clone()].last() != Some(&0) {
                return Err(Error::Corrupt("string table is not NUL-terminated".into()));
            }
            note.strings = Some(range);
        }

        Ok(note)
    }

    /// This note's source filename, if the host supplied one.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Offset within `source` of this note's first byte.
    pub const fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// All decoded chunks, in wire order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// This chunk's payload bytes.
    pub fn payload(&self, chunk: &Chunk) -> &[u8] {
        &self.bytes[chunk.payload.clone()]
    }

    /// Resolve a string-table offset to the NUL-terminated string found
    /// there.
    pub(crate) fn string_at(&self, offset: usize) -> Result<&str> {
        let range = self
            .strings
            .as_ref()
            .ok_or_else(|| Error::Invalid("no Strings chunk present".into()))?;
        let table = &self.bytes[range.clone()];
        let start = offset;
        let end = table[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| Error::Corrupt("string-table offset has no terminating NUL".into()))?;
        std::str::from_utf8(&table[start..end]).map_err(|_| Error::Corrupt("string table entry is not UTF-8".into()))
    }

    /// Find the unique chunk with the given kind, returning `Ok(None)` if
    /// absent. Duplicates fail with [`Error::Unhandled`], the offset
    /// carried in the returned [`Located`] being that of the second
    /// occurrence.
    pub(crate) fn find_unique(&self, kind: ChunkKind) -> DResult<Option<&Chunk>> {
        let mut found: Option<&Chunk> = None;
        for chunk in &self.chunks {
            if chunk.kind().type_id() != kind.type_id() {
                continue;
            }
            if found.is_some() {
                return Err(Located::new(
                    Error::Unhandled(format!("duplicate chunk with type id {}", kind.type_id())),
                    chunk.note_offset(),
                ));
            }
            found = Some(chunk);
        }
        Ok(found)
    }

    /// As [`Note::find_unique`], but fails with [`Error::Invalid`] at the
    /// note's base offset if the chunk is required and absent.
    pub(crate) fn require_unique(&self, kind: ChunkKind) -> DResult<&Chunk> {
        match self.find_unique(kind)? {
            Some(chunk) => Ok(chunk),
            None => Err(Located::new(
                Error::Invalid(format!("required chunk with type id {} is absent", kind.type_id())),
                0,
            )),
        }
    }

    pub(crate) fn reader<'a>(&'a self, chunk: &Chunk, byte_order: ByteOrder) -> ReadBuf<'a> {
        ReadBuf::with_note(self, self.payload(chunk), byte_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    fn chunk_bytes(type_id: u64, version: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        uleb(type_id, &mut out);
        uleb(version, &mut out);
        uleb(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn drops_zero_length_chunks() {
        let mut bytes = chunk_bytes(5, 1, &[]);
        bytes.extend(chunk_bytes(4, 1, b"\0"));
        let note = Note::parse(&bytes, None, 0).unwrap();
        assert_eq!(note.chunks().len(), 1);
    }

    #[test]
    fn requires_nul_terminated_strings_chunk() {
        let bytes = chunk_bytes(4, 1, b"hello");
        assert!(matches!(Note::parse(&bytes, None, 0), Err(Error::Corrupt(_))));
    }

    #[test]
    fn duplicate_chunk_is_unhandled() {
        let mut bytes = chunk_bytes(5, 1, &[0x10]);
        bytes.extend(chunk_bytes(5, 1, &[0x20]));
        let note = Note::parse(&bytes, None, 0).unwrap();
        let err = note.find_unique(ChunkKind::CodeInfo).unwrap_err();
        assert!(matches!(err.error, Error::Unhandled(_)));
        assert_eq!(err.offset, bytes_header_len(&bytes));
    }

    fn bytes_header_len(bytes: &[u8]) -> usize {
        // the second chunk's header starts right after the first chunk
        // (tag=1, version=1, size=1, payload=1) = 4 bytes
        let _ = bytes;
        4
    }

    #[test]
    fn string_table_lookup() {
        let bytes = chunk_bytes(4, 1, b"foo\0bar\0");
        let note = Note::parse(&bytes, None, 0).unwrap();
        assert_eq!(note.string_at(0).unwrap(), "foo");
        assert_eq!(note.string_at(4).unwrap(), "bar");
    }
}
