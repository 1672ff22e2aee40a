//! Pointer metadata: the durable record of a committed segment.

use std::collections::HashSet;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MetainfoError;
use crate::redundancy::{RedundancyScheme, MAX_TOTAL_PIECES};
use crate::types::{NodeId, PieceId, Timestamp};

/// Ways a pointer's piece set can be corrupt.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PointerViolation {
    /// Two pieces claim the same piece number.
    #[error("duplicate piece number {piece_number}")]
    DuplicatePiece {
        /// The repeated piece number.
        piece_number: u32,
    },
    /// A piece number is outside `[0, total)`.
    #[error("piece number {piece_number} out of range for {total} pieces")]
    PieceOutOfRange {
        /// The offending piece number.
        piece_number: u32,
        /// The redundancy total.
        total: u32,
    },
    /// The redundancy total is larger than any erasure code produces.
    #[error("{total} pieces exceeds the limit of {max}")]
    TooManyPieces {
        /// The claimed total.
        total: u32,
        /// The largest accepted total.
        max: u32,
    },
}

/// Assignment of one erasure share to the node storing it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePiece {
    /// Erasure share index, in `[0, total)`.
    pub piece_number: u32,
    /// Node holding the share.
    pub node_id: NodeId,
}

impl RemotePiece {
    /// Creates a piece assignment.
    pub fn new(piece_number: u32, node_id: NodeId) -> Self {
        Self {
            piece_number,
            node_id,
        }
    }
}

/// Checks that every piece number is unique and below `total`, and that `total`
/// is one a real scheme can have.
pub fn check_pieces(pieces: &[RemotePiece], total: u32) -> Result<(), PointerViolation> {
    if total > MAX_TOTAL_PIECES {
        return Err(PointerViolation::TooManyPieces {
            total,
            max: MAX_TOTAL_PIECES,
        });
    }
    let mut seen = HashSet::with_capacity(pieces.len());
    for piece in pieces {
        if piece.piece_number >= total {
            return Err(PointerViolation::PieceOutOfRange {
                piece_number: piece.piece_number,
                total,
            });
        }
        if !seen.insert(piece.piece_number) {
            return Err(PointerViolation::DuplicatePiece {
                piece_number: piece.piece_number,
            });
        }
    }
    Ok(())
}

/// Committed segment record. The coordinator owns it; clients hold copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    /// Encrypted segment size in bytes.
    pub segment_size: i64,
    /// Scheme the segment was encoded with.
    pub redundancy: RedundancyScheme,
    /// Root from which per-node piece IDs are derived.
    pub root_piece_id: PieceId,
    /// Node assignments, ordered by piece number.
    pub pieces: Vec<RemotePiece>,
    /// When the coordinator accepted the commit.
    pub creation_time: Timestamp,
    /// When the segment may be garbage collected, if ever.
    pub expiration_time: Option<Timestamp>,
    /// Opaque, caller-encrypted object metadata.
    pub metadata: Vec<u8>,
}

impl Pointer {
    /// Builds a pointer for commit. Pieces are sorted by piece number.
    pub fn new(
        segment_size: i64,
        redundancy: RedundancyScheme,
        root_piece_id: PieceId,
        mut pieces: Vec<RemotePiece>,
    ) -> Self {
        pieces.sort_by_key(|p| p.piece_number);
        Self {
            segment_size,
            redundancy,
            root_piece_id,
            pieces,
            creation_time: Timestamp::default(),
            expiration_time: None,
            metadata: Vec::new(),
        }
    }

    /// Validates the redundancy scheme and the piece set.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        self.redundancy.validate()?;
        check_pieces(&self.pieces, self.redundancy.total)?;
        Ok(())
    }

    /// The piece assigned to `piece_number`, if any.
    pub fn piece(&self, piece_number: u32) -> Option<&RemotePiece> {
        self.pieces.iter().find(|p| p.piece_number == piece_number)
    }
}

/// Selects which pointer fields a listing returns.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaFlags(u32);

impl MetaFlags {
    /// No pointer is returned with list items.
    pub const NONE: MetaFlags = MetaFlags(0);
    /// Creation time.
    pub const MODIFIED: MetaFlags = MetaFlags(1);
    /// Expiration time.
    pub const EXPIRATION: MetaFlags = MetaFlags(1 << 1);
    /// Segment size.
    pub const SIZE: MetaFlags = MetaFlags(1 << 2);
    /// Caller metadata.
    pub const USER_DEFINED: MetaFlags = MetaFlags(1 << 4);
    /// Every field.
    pub const ALL: MetaFlags = MetaFlags(u32::MAX);

    /// Wraps raw wire bits.
    pub fn from_bits(bits: u32) -> Self {
        MetaFlags(bits)
    }

    /// Raw wire bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: MetaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the subset of `pointer` these flags ask for; `None` for `NONE`.
    ///
    /// Placement fields (redundancy, root piece ID, pieces) are returned whenever
    /// any flag is set.
    pub fn project(self, pointer: &Pointer) -> Option<Pointer> {
        if self == MetaFlags::NONE {
            return None;
        }
        let mut out = pointer.clone();
        if !self.contains(MetaFlags::MODIFIED) {
            out.creation_time = Timestamp::default();
        }
        if !self.contains(MetaFlags::EXPIRATION) {
            out.expiration_time = None;
        }
        if !self.contains(MetaFlags::SIZE) {
            out.segment_size = 0;
        }
        if !self.contains(MetaFlags::USER_DEFINED) {
            out.metadata.clear();
        }
        Some(out)
    }
}

impl BitOr for MetaFlags {
    type Output = MetaFlags;

    fn bitor(self, rhs: MetaFlags) -> MetaFlags {
        MetaFlags(self.0 | rhs.0)
    }
}

/// One entry of a segment listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    /// Path relative to the listing prefix.
    pub path: Vec<u8>,
    /// Pointer projection; absent for prefixes and for `MetaFlags::NONE`.
    pub pointer: Option<Pointer>,
    /// True when this entry groups every path sharing `path` as a prefix.
    pub is_prefix: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> NodeId {
        NodeId::new([i; 32])
    }

    fn sample_pointer(pieces: Vec<RemotePiece>) -> Pointer {
        let mut p = Pointer::new(
            4096,
            RedundancyScheme::new(2, 3, 4, 5, 256),
            PieceId::new([9; 32]),
            pieces,
        );
        p.creation_time = Timestamp::from_secs(1_700_000_000);
        p.expiration_time = Some(Timestamp::from_secs(1_800_000_000));
        p.metadata = b"enc-meta".to_vec();
        p
    }

    #[test]
    fn test_new_sorts_pieces() {
        let p = sample_pointer(vec![RemotePiece::new(3, node(3)), RemotePiece::new(0, node(0))]);
        assert_eq!(p.pieces[0].piece_number, 0);
        assert_eq!(p.pieces[1].piece_number, 3);
        assert_eq!(p.piece(3).unwrap().node_id, node(3));
        assert!(p.piece(1).is_none());
    }

    #[test]
    fn test_validate_ok() {
        let p = sample_pointer((0..5).map(|i| RemotePiece::new(i, node(i as u8))).collect());
        p.validate().unwrap();
    }

    #[test]
    fn test_validate_duplicate_piece() {
        let p = sample_pointer(vec![RemotePiece::new(1, node(1)), RemotePiece::new(1, node(2))]);
        let err = p.validate().unwrap_err();
        assert!(matches!(
            err,
            MetainfoError::MalformedPointer(PointerViolation::DuplicatePiece { piece_number: 1 })
        ));
    }

    #[test]
    fn test_validate_out_of_range() {
        let p = sample_pointer(vec![RemotePiece::new(5, node(1))]);
        assert!(matches!(
            p.validate().unwrap_err(),
            MetainfoError::MalformedPointer(PointerViolation::PieceOutOfRange {
                piece_number: 5,
                total: 5
            })
        ));
    }

    #[test]
    fn test_validate_bad_redundancy() {
        let mut p = sample_pointer(vec![]);
        p.redundancy.repair_threshold = 1;
        assert!(matches!(
            p.validate().unwrap_err(),
            MetainfoError::InvalidRedundancy { .. }
        ));
    }

    #[test]
    fn test_huge_total_is_refused() {
        let pieces = vec![RemotePiece::new(1, node(1)), RemotePiece::new(9, node(2))];
        assert_eq!(
            check_pieces(&pieces, u32::MAX),
            Err(PointerViolation::TooManyPieces {
                total: u32::MAX,
                max: MAX_TOTAL_PIECES
            })
        );
        check_pieces(&pieces, MAX_TOTAL_PIECES).unwrap();

        let mut p = sample_pointer(pieces);
        p.redundancy.total = u32::MAX;
        assert!(matches!(
            p.validate().unwrap_err(),
            MetainfoError::InvalidRedundancy { .. }
        ));
    }

    #[test]
    fn test_meta_flags_projection() {
        let p = sample_pointer(vec![RemotePiece::new(0, node(0))]);
        assert!(MetaFlags::NONE.project(&p).is_none());
        assert_eq!(MetaFlags::ALL.project(&p).unwrap(), p);

        let sized = (MetaFlags::SIZE | MetaFlags::MODIFIED).project(&p).unwrap();
        assert_eq!(sized.segment_size, 4096);
        assert_eq!(sized.creation_time, p.creation_time);
        assert!(sized.expiration_time.is_none());
        assert!(sized.metadata.is_empty());
        assert_eq!(sized.pieces, p.pieces);
    }

    #[test]
    fn test_meta_flags_bits() {
        let flags = MetaFlags::from_bits(0b10110);
        assert!(flags.contains(MetaFlags::EXPIRATION));
        assert!(flags.contains(MetaFlags::SIZE));
        assert!(flags.contains(MetaFlags::USER_DEFINED));
        assert!(!flags.contains(MetaFlags::MODIFIED));
        assert_eq!(flags.bits(), 0b10110);
    }
}
