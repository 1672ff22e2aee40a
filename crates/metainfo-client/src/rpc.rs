//! Coordinator RPC surface.
//!
//! Defines the request/response pairs exchanged with the metadata coordinator and
//! the [`Coordinator`] trait that any transport (network channel or in-memory
//! fake) implements. Authentication is not part of the messages: the channel
//! returned by a [`crate::connection::Dialer`] attaches the API key to every call.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::authorization::PieceAuthorization;
use crate::error::Status;
use crate::pointer::{ListItem, MetaFlags, Pointer};
use crate::redundancy::RedundancyScheme;
use crate::types::{PieceId, Timestamp};

/// Client-visible operations, used for error context, logging and metrics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    /// Request placement for a new segment.
    CreateSegment,
    /// Persist a pointer after upload.
    CommitSegment,
    /// Fetch a pointer.
    SegmentInfo,
    /// Fetch a pointer plus download authorizations.
    ReadSegment,
    /// Remove a pointer and obtain delete authorizations.
    DeleteSegment,
    /// Page through pointers under a prefix.
    ListSegments,
    /// Tag a bucket with a partner.
    SetAttribution,
    /// Fetch project information for the API key.
    ProjectInfo,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Operation; 8] = [
        Operation::CreateSegment,
        Operation::CommitSegment,
        Operation::SegmentInfo,
        Operation::ReadSegment,
        Operation::DeleteSegment,
        Operation::ListSegments,
        Operation::SetAttribution,
        Operation::ProjectInfo,
    ];

    /// Stable name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Operation::CreateSegment => "create_segment",
            Operation::CommitSegment => "commit_segment",
            Operation::SegmentInfo => "segment_info",
            Operation::ReadSegment => "read_segment",
            Operation::DeleteSegment => "delete_segment",
            Operation::ListSegments => "list_segments",
            Operation::SetAttribution => "set_attribution",
            Operation::ProjectInfo => "project_info",
        }
    }

    /// Returns true if a coordinator `NotFound` means the addressed segment is absent.
    pub fn maps_not_found(self) -> bool {
        matches!(
            self,
            Operation::SegmentInfo | Operation::ReadSegment | Operation::DeleteSegment
        )
    }

    /// Position in [`Operation::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement request for a new segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSegmentRequest {
    /// Bucket name.
    pub bucket: Vec<u8>,
    /// Object path.
    pub path: Vec<u8>,
    /// Wire segment index (`-1` for the last segment).
    pub segment: i64,
    /// Scheme the segment will be encoded with.
    pub redundancy: RedundancyScheme,
    /// Upper bound on the encrypted segment size.
    pub max_encrypted_segment_size: i64,
    /// Point in time after which the segment may be collected.
    pub expiration: Option<Timestamp>,
}

/// Upload authorizations for a new segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSegmentResponse {
    /// One `Put` authorization per placed piece.
    pub addressed_limits: Vec<PieceAuthorization>,
    /// Root the piece IDs are derived from.
    pub root_piece_id: PieceId,
}

/// Commit of an uploaded segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSegmentRequest {
    /// Bucket name.
    pub bucket: Vec<u8>,
    /// Object path.
    pub path: Vec<u8>,
    /// Wire segment index.
    pub segment: i64,
    /// Pointer describing the stored pieces.
    pub pointer: Pointer,
    /// Authorizations returned by `create_segment`, as proof of placement.
    pub original_limits: Vec<PieceAuthorization>,
}

/// Pointer as stored by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSegmentResponse {
    /// The accepted pointer.
    pub pointer: Pointer,
}

/// Addresses a single segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRequest {
    /// Bucket name.
    pub bucket: Vec<u8>,
    /// Object path.
    pub path: Vec<u8>,
    /// Wire segment index.
    pub segment: i64,
}

/// Pointer lookup result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfoResponse {
    /// The stored pointer.
    pub pointer: Pointer,
}

/// Pointer plus download authorizations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSegmentResponse {
    /// The stored pointer.
    pub pointer: Pointer,
    /// `Get` authorizations in no particular order.
    pub addressed_limits: Vec<PieceAuthorization>,
}

/// Delete authorizations for a removed segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSegmentResponse {
    /// `Delete` authorizations for nodes holding pieces.
    pub addressed_limits: Vec<PieceAuthorization>,
}

/// One page of a pointer listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSegmentsRequest {
    /// Bucket name.
    pub bucket: Vec<u8>,
    /// Path prefix; item paths are returned relative to it.
    pub prefix: Vec<u8>,
    /// Exclusive lower bound (relative path); empty for none.
    pub start_after: Vec<u8>,
    /// Exclusive upper bound (relative path); empty for none.
    pub end_before: Vec<u8>,
    /// Descend into sub-prefixes instead of collapsing them.
    pub recursive: bool,
    /// Maximum number of items; `0` lets the coordinator choose.
    pub limit: i32,
    /// Raw [`MetaFlags`] bits.
    pub meta_flags: u32,
}

/// A page of listed items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSegmentsResponse {
    /// Items in ascending path order.
    pub items: Vec<ListItem>,
    /// True if more items follow the last one returned.
    pub more: bool,
}

/// Bucket attribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttributionRequest {
    /// Bucket name.
    pub bucket_name: Vec<u8>,
    /// Partner UUID bytes.
    pub partner_id: Vec<u8>,
}

/// Project information for the calling API key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfoResponse {
    /// Per-project salt used for path encryption key derivation.
    pub project_salt: Vec<u8>,
}

/// Coordinator RPC surface. Implemented by network channels and by
/// [`crate::memory::MemoryChannel`].
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Allocate placement and return upload authorizations.
    async fn create_segment(&self, req: CreateSegmentRequest)
        -> Result<CreateSegmentResponse, Status>;

    /// Persist a pointer.
    async fn commit_segment(&self, req: CommitSegmentRequest)
        -> Result<CommitSegmentResponse, Status>;

    /// Look up a pointer.
    async fn segment_info(&self, req: SegmentRequest) -> Result<SegmentInfoResponse, Status>;

    /// Look up a pointer and issue download authorizations.
    async fn download_segment(&self, req: SegmentRequest)
        -> Result<DownloadSegmentResponse, Status>;

    /// Remove a pointer and issue delete authorizations.
    async fn delete_segment(&self, req: SegmentRequest) -> Result<DeleteSegmentResponse, Status>;

    /// List pointers under a prefix.
    async fn list_segments(&self, req: ListSegmentsRequest)
        -> Result<ListSegmentsResponse, Status>;

    /// Attach a partner attribution to a bucket.
    async fn set_attribution(&self, req: SetAttributionRequest) -> Result<(), Status>;

    /// Project information for the calling key.
    async fn project_info(&self) -> Result<ProjectInfoResponse, Status>;
}
