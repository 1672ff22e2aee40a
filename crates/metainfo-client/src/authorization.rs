//! Piece authorizations ("order limits") and their alignment to piece numbers.
//!
//! The coordinator hands out authorizations as an unordered list keyed by node.
//! Erasure decoding addresses shares by piece number, so before an authorization
//! list reaches the transfer layer it is re-indexed through the pointer's
//! piece-to-node assignment by [`align`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pointer::{check_pieces, PointerViolation, RemotePiece};
use crate::types::{NodeId, PieceId, Timestamp};

/// What an authorization allows the bearer to do with a piece.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceAction {
    /// Upload a new piece.
    Put,
    /// Download an existing piece.
    Get,
    /// Remove a piece.
    Delete,
}

/// Coordinator-signed permission for a single piece transfer with a single node.
///
/// Each authorization is consumed at most once by the transfer layer and is never
/// persisted here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceAuthorization {
    /// Piece number the coordinator assigned to this node.
    pub piece_number: u32,
    /// Node the authorization is addressed to.
    pub storage_node_id: NodeId,
    /// Derived piece ID the node stores the share under.
    pub piece_id: PieceId,
    /// Permitted action.
    pub action: PieceAction,
    /// Unique serial, used by nodes to reject replays.
    pub serial_number: [u8; 16],
    /// Opaque signed token presented to the node.
    pub limit_token: Vec<u8>,
    /// After this instant the node rejects the authorization.
    pub expires_at: Timestamp,
    /// Dial address of the node, when the coordinator knows it.
    pub address: Option<String>,
}

impl PieceAuthorization {
    /// True once `now` is at or past the expiration.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Authorizations indexed by piece number; unresolved pieces are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlignedAuthorizations {
    slots: Vec<Option<PieceAuthorization>>,
}

impl AlignedAuthorizations {
    /// Number of slots, equal to the redundancy total.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if there are no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Authorization for `piece_number`, if one was resolved.
    pub fn get(&self, piece_number: usize) -> Option<&PieceAuthorization> {
        self.slots.get(piece_number).and_then(Option::as_ref)
    }

    /// Count of resolved slots.
    pub fn present(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterates slots in piece-number order.
    pub fn iter(&self) -> impl Iterator<Item = Option<&PieceAuthorization>> {
        self.slots.iter().map(Option::as_ref)
    }
}

/// Places each authorization at the piece number the pointer assigns to its node.
///
/// The result always has `total` slots. A slot stays empty when the pointer has no
/// piece with that number or when no authorization names the piece's node. If the
/// list names a node twice, the first authorization wins. Duplicate or out-of-range
/// piece numbers in `pieces` are rejected.
pub fn align(
    authorizations: Vec<PieceAuthorization>,
    pieces: &[RemotePiece],
    total: u32,
) -> Result<AlignedAuthorizations, PointerViolation> {
    check_pieces(pieces, total)?;

    let mut by_node: HashMap<NodeId, PieceAuthorization> =
        HashMap::with_capacity(authorizations.len());
    for auth in authorizations {
        by_node.entry(auth.storage_node_id).or_insert(auth);
    }

    let mut slots = vec![None; total as usize];
    for piece in pieces {
        slots[piece.piece_number as usize] = by_node.get(&piece.node_id).cloned();
    }
    Ok(AlignedAuthorizations { slots })
}
