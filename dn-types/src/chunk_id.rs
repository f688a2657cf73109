use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What kind of payload a chunk id refers to.
///
/// Encoded in the two high bits of a [`ChunkId`] so that a node can tell a
/// chunk's storage discipline apart from its raw bits alone, without a
/// registry lookup (needed e.g. to decide whether `SendBlocks` is even legal
/// before a session exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    /// A regular, non-erasure-coded blob chunk.
    Blob = 0,
    /// One part of an erasure-coded blob chunk.
    ErasurePart = 1,
    /// A journal (append-only changelog) chunk.
    Journal = 2,
    /// One part of an erasure-coded journal chunk.
    ErasureJournalPart = 3,
}

impl ObjectType {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => ObjectType::Blob,
            1 => ObjectType::ErasurePart,
            2 => ObjectType::Journal,
            3 => ObjectType::ErasureJournalPart,
            _ => unreachable!("object type tag is only ever 2 bits"),
        }
    }

    fn tag(self) -> u8 {
        self as u8
    }

    pub fn is_erasure_part(self) -> bool {
        matches!(self, ObjectType::ErasurePart | ObjectType::ErasureJournalPart)
    }

    pub fn is_journal(self) -> bool {
        matches!(self, ObjectType::Journal | ObjectType::ErasureJournalPart)
    }
}

const OBJECT_TYPE_SHIFT: u32 = 126;
const CELL_SHIFT: u32 = 114;
const CELL_BITS: u32 = 12;
const CELL_MASK: u128 = (1u128 << CELL_BITS) - 1;
const PART_INDEX_BITS: u32 = 8;
const PART_INDEX_MASK: u128 = (1u128 << PART_INDEX_BITS) - 1;

/// 128-bit chunk identifier.
///
/// Bit layout (high to low):
///
/// ```text
/// [127:126] object type tag (2 bits)
/// [125:114] originating cell id (12 bits)
/// [113:0]   per-chunk unique payload; for an erasure part, the low 8 bits
///           of this payload are overwritten with the part index, the
///           remaining bits are inherited unchanged from the parent chunk.
/// ```
///
/// This layout is an implementation decision (spec.md leaves the exact bit
/// positions unspecified); see `DESIGN.md` for the rationale.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(u128);

impl ChunkId {
    pub fn from_raw(raw: u128) -> Self {
        ChunkId(raw)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn new(object_type: ObjectType, cell: u16, unique: u128) -> Self {
        assert!((cell as u128) <= CELL_MASK, "cell id does not fit in 12 bits");
        let raw = ((object_type.tag() as u128) << OBJECT_TYPE_SHIFT)
            | ((cell as u128 & CELL_MASK) << CELL_SHIFT)
            | (unique & ((1u128 << CELL_SHIFT) - 1));
        ChunkId(raw)
    }

    pub fn object_type(self) -> ObjectType {
        ObjectType::from_tag((self.0 >> OBJECT_TYPE_SHIFT) as u8 & 0b11)
    }

    pub fn cell(self) -> u16 {
        ((self.0 >> CELL_SHIFT) & CELL_MASK) as u16
    }

    /// Derive the id of one locally-stored part of an erasure-coded chunk.
    ///
    /// Every part is an independent chunk with its own lifecycle (I8); the
    /// part index is recoverable from the id alone so a location scan can
    /// reconstruct `(parent, part_index)` without consulting the registry.
    pub fn derive_erasure_part(parent: ChunkId, part_index: u8) -> ChunkId {
        let object_type = match parent.object_type() {
            ObjectType::Blob | ObjectType::ErasurePart => ObjectType::ErasurePart,
            ObjectType::Journal | ObjectType::ErasureJournalPart => ObjectType::ErasureJournalPart,
        };
        let cleared = parent.0 & !(PART_INDEX_MASK);
        let raw = (cleared & !((0b11u128) << OBJECT_TYPE_SHIFT))
            | ((object_type.tag() as u128) << OBJECT_TYPE_SHIFT)
            | (part_index as u128 & PART_INDEX_MASK);
        ChunkId(raw)
    }

    /// The part index of an erasure-part chunk id, or `None` for non-erasure
    /// object types.
    pub fn erasure_part_index(self) -> Option<u8> {
        if self.object_type().is_erasure_part() {
            Some((self.0 & PART_INDEX_MASK) as u8)
        } else {
            None
        }
    }

    /// Low byte of the id, used by the location manager to fan out chunk
    /// files across `hh/` subdirectories (see `get_chunk_path`).
    pub fn low_byte(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({:032x})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(ChunkId)
    }
}

/// The pair `(chunk_id, block_index)` addressing one block inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub chunk_id: ChunkId,
    pub block_index: u32,
}

impl BlockId {
    pub fn new(chunk_id: ChunkId, block_index: u32) -> Self {
        Self {
            chunk_id,
            block_index,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.chunk_id, self.block_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_type_roundtrips_through_bits() {
        let id = ChunkId::new(ObjectType::Journal, 42, 0xdead_beef);
        assert_eq!(id.object_type(), ObjectType::Journal);
        assert_eq!(id.cell(), 42);
    }

    #[test]
    fn erasure_part_derivation_preserves_parent_identity() {
        let parent = ChunkId::new(ObjectType::Blob, 7, 0x1234_5678_9abc);
        let part0 = ChunkId::derive_erasure_part(parent, 0);
        let part5 = ChunkId::derive_erasure_part(parent, 5);

        assert_eq!(part0.object_type(), ObjectType::ErasurePart);
        assert_eq!(part0.cell(), 7);
        assert_eq!(part0.erasure_part_index(), Some(0));
        assert_eq!(part5.erasure_part_index(), Some(5));
        assert_ne!(part0, part5);

        // both parts still trace back to the same "family" modulo part index
        assert_eq!(part0.as_u128() & !0xff, part5.as_u128() & !0xff);
    }

    #[test]
    fn non_erasure_chunk_has_no_part_index() {
        let id = ChunkId::new(ObjectType::Blob, 1, 1);
        assert_eq!(id.erasure_part_index(), None);
    }

    #[test]
    fn display_and_parse_roundtrip() {
        let id = ChunkId::new(ObjectType::Blob, 1, 0xabc);
        let text = id.to_string();
        let parsed: ChunkId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
