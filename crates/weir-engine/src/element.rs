//! Elements exchanged between operators.
//!
//! Adjacent operators agree on one of three element kinds: `void` (nothing
//! in-band), `bytes` (opaque chunks), or `events` (columnar batches).

use std::fmt;

use bytes::Bytes;
use weir_types::Batch;

/// The element kind an operator consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Void,
    Bytes,
    Events,
}

impl ElementKind {
    /// The unit name used in metric records.
    pub fn unit(&self) -> &'static str {
        match self {
            ElementKind::Void => "void",
            ElementKind::Bytes => "bytes",
            ElementKind::Events => "events",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.unit())
    }
}

/// Provenance of a byte chunk, when it was read from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOrigin {
    pub file: String,
    pub offset: u64,
}

/// An immutable byte chunk, shared by reference between operators.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Bytes,
    origin: Option<ChunkOrigin>,
}

impl Chunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), origin: None }
    }

    pub fn with_origin(data: impl Into<Bytes>, file: impl Into<String>, offset: u64) -> Self {
        Self {
            data: data.into(),
            origin: Some(ChunkOrigin { file: file.into(), offset }),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn origin(&self) -> Option<&ChunkOrigin> {
        self.origin.as_ref()
    }
}

/// One element moving through a pipeline. `void` streams carry no elements.
#[derive(Debug, Clone)]
pub enum Element {
    Bytes(Chunk),
    Events(Batch),
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Bytes(_) => ElementKind::Bytes,
            Element::Events(_) => ElementKind::Events,
        }
    }

    /// The element count used for demand accounting: rows for events, bytes
    /// for chunks.
    pub fn size(&self) -> u64 {
        match self {
            Element::Bytes(chunk) => chunk.len() as u64,
            Element::Events(batch) => batch.rows() as u64,
        }
    }

    pub fn approx_bytes(&self) -> u64 {
        match self {
            Element::Bytes(chunk) => chunk.len() as u64,
            Element::Events(batch) => batch.approx_bytes(),
        }
    }
}
