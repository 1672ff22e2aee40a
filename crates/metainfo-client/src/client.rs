//! Segment lifecycle protocol driver.
//!
//! [`MetainfoClient`] turns each public operation into one round trip against a
//! [`Coordinator`], validating what goes out and what comes back. It keeps no
//! per-segment state and never retries; a failed call is reported to the caller,
//! who decides whether repeating it is safe.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::authorization::{align, AlignedAuthorizations, PieceAuthorization};
use crate::context::{CancelToken, Context};
use crate::error::{MetainfoError, Status};
use crate::monitor::{OperationMonitor, Outcome};
use crate::pointer::{ListItem, MetaFlags, Pointer};
use crate::redundancy::RedundancyScheme;
use crate::rpc::{
    CommitSegmentRequest, Coordinator, CreateSegmentRequest, ListSegmentsRequest, Operation,
    SegmentRequest, SetAttributionRequest,
};
use crate::types::{PieceId, SegmentIndex, SegmentLocator, Timestamp};

/// Page size used when neither the caller nor the configuration picks one.
pub const DEFAULT_LIST_LIMIT: u32 = 1000;

/// Parameters of a single listing call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Path prefix; returned paths are relative to it.
    pub prefix: Vec<u8>,
    /// Exclusive cursor: only paths after this one are returned.
    pub start_after: Vec<u8>,
    /// Exclusive upper bound; empty means unbounded.
    pub end_before: Vec<u8>,
    /// Descend into sub-prefixes instead of collapsing them.
    pub recursive: bool,
    /// Maximum items; `0` uses the client's default page size.
    pub limit: u32,
    /// Pointer fields to return with each item.
    pub meta_flags: MetaFlags,
}

impl ListOptions {
    /// Options listing everything under `prefix`.
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Resume after `cursor`.
    pub fn start_after(mut self, cursor: impl Into<Vec<u8>>) -> Self {
        self.start_after = cursor.into();
        self
    }

    /// Stop before `bound`.
    pub fn end_before(mut self, bound: impl Into<Vec<u8>>) -> Self {
        self.end_before = bound.into();
        self
    }

    /// Set recursive listing.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set the page size.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Set the pointer fields to return.
    pub fn meta_flags(mut self, flags: MetaFlags) -> Self {
        self.meta_flags = flags;
        self
    }
}

/// One page of a listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Items in ascending path order.
    pub items: Vec<ListItem>,
    /// True if the listing was truncated.
    pub more: bool,
}

impl ListPage {
    /// Cursor for the next page, when there is one.
    pub fn next_cursor(&self) -> Option<&[u8]> {
        if self.more {
            self.items.last().map(|item| item.path.as_slice())
        } else {
            None
        }
    }
}

/// Project information for the calling API key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectInfo {
    /// Salt for deriving path encryption keys.
    pub project_salt: [u8; 32],
}

/// Cloneable, concurrency-safe client for the segment coordination protocol.
///
/// Obtained from [`crate::connection::Connection::client`], or built directly
/// over any [`Coordinator`] with [`MetainfoClient::new`].
#[derive(Clone)]
pub struct MetainfoClient {
    coordinator: Arc<dyn Coordinator>,
    connection: Option<CancelToken>,
    monitor: Option<Arc<dyn OperationMonitor>>,
    request_timeout: Option<Duration>,
    default_list_limit: u32,
}

impl fmt::Debug for MetainfoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetainfoClient")
            .field("connection", &self.connection)
            .field("monitored", &self.monitor.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("default_list_limit", &self.default_list_limit)
            .finish()
    }
}

impl MetainfoClient {
    /// A client over `coordinator` with no fallback deadline and no monitor.
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            connection: None,
            monitor: None,
            request_timeout: None,
            default_list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    /// Reports every operation to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<dyn OperationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Deadline for operations whose context has none.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Page size substituted for `limit = 0`.
    pub fn with_default_list_limit(mut self, limit: u32) -> Self {
        self.default_list_limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };
        self
    }

    pub(crate) fn with_connection(mut self, token: CancelToken) -> Self {
        self.connection = Some(token);
        self
    }

    /// Requests placement for a new segment.
    ///
    /// Returns one `Put` authorization per placed piece and the segment's root
    /// piece ID. Fewer than `min_required` placements is
    /// [`MetainfoError::PlacementFailed`].
    #[instrument(skip_all, fields(bucket = %loc.bucket, segment = %loc.segment, total = redundancy.total))]
    pub async fn create_segment(
        &self,
        ctx: &Context,
        loc: &SegmentLocator,
        redundancy: &RedundancyScheme,
        max_encrypted_segment_size: i64,
        expiration: Option<Timestamp>,
    ) -> Result<(Vec<PieceAuthorization>, PieceId), MetainfoError> {
        let op = Operation::CreateSegment;
        self.observe(op, async {
            check_locator(op, loc)?;
            redundancy.validate()?;
            let req = CreateSegmentRequest {
                bucket: loc.bucket.as_bytes().to_vec(),
                path: loc.path.clone(),
                segment: loc.segment.to_wire(),
                redundancy: *redundancy,
                max_encrypted_segment_size,
                expiration,
            };
            let resp = self
                .call(ctx, op, self.coordinator.create_segment(req))
                .await?;
            check_placement(redundancy, &resp.addressed_limits)?;
            debug!(placed = resp.addressed_limits.len(), "placement granted");
            Ok::<_, MetainfoError>((resp.addressed_limits, resp.root_piece_id))
        })
        .await
    }

    /// Commits the pointer built after upload and returns the coordinator's copy.
    ///
    /// Never retried here: a commit that timed out may still have been applied.
    #[instrument(skip_all, fields(bucket = %loc.bucket, segment = %loc.segment, pieces = pointer.pieces.len()))]
    pub async fn commit_segment(
        &self,
        ctx: &Context,
        loc: &SegmentLocator,
        pointer: Pointer,
        original_limits: Vec<PieceAuthorization>,
    ) -> Result<Pointer, MetainfoError> {
        let op = Operation::CommitSegment;
        self.observe(op, async {
            check_locator(op, loc)?;
            pointer.validate()?;
            let req = CommitSegmentRequest {
                bucket: loc.bucket.as_bytes().to_vec(),
                path: loc.path.clone(),
                segment: loc.segment.to_wire(),
                pointer,
                original_limits,
            };
            let resp = self
                .call(ctx, op, self.coordinator.commit_segment(req))
                .await?;
            resp.pointer.validate()?;
            Ok::<_, MetainfoError>(resp.pointer)
        })
        .await
    }

    /// Fetches a committed pointer.
    #[instrument(skip_all, fields(bucket = %loc.bucket, segment = %loc.segment))]
    pub async fn segment_info(
        &self,
        ctx: &Context,
        loc: &SegmentLocator,
    ) -> Result<Pointer, MetainfoError> {
        let op = Operation::SegmentInfo;
        self.observe(op, async {
            check_locator(op, loc)?;
            let resp = self
                .call(ctx, op, self.coordinator.segment_info(segment_request(loc)))
                .await?;
            resp.pointer.validate()?;
            Ok::<_, MetainfoError>(resp.pointer)
        })
        .await
    }

    /// Fetches a pointer with download authorizations indexed by piece number.
    #[instrument(skip_all, fields(bucket = %loc.bucket, segment = %loc.segment))]
    pub async fn read_segment(
        &self,
        ctx: &Context,
        loc: &SegmentLocator,
    ) -> Result<(Pointer, AlignedAuthorizations), MetainfoError> {
        let op = Operation::ReadSegment;
        self.observe(op, async {
            check_locator(op, loc)?;
            let resp = self
                .call(ctx, op, self.coordinator.download_segment(segment_request(loc)))
                .await?;
            resp.pointer.validate()?;
            let aligned = align(
                resp.addressed_limits,
                &resp.pointer.pieces,
                resp.pointer.redundancy.total,
            )?;
            debug!(
                pieces = resp.pointer.pieces.len(),
                authorized = aligned.present(),
                "segment read"
            );
            Ok::<_, MetainfoError>((resp.pointer, aligned))
        })
        .await
    }

    /// Removes a pointer and returns delete authorizations for its pieces.
    #[instrument(skip_all, fields(bucket = %loc.bucket, segment = %loc.segment))]
    pub async fn delete_segment(
        &self,
        ctx: &Context,
        loc: &SegmentLocator,
    ) -> Result<Vec<PieceAuthorization>, MetainfoError> {
        let op = Operation::DeleteSegment;
        self.observe(op, async {
            check_locator(op, loc)?;
            let resp = self
                .call(ctx, op, self.coordinator.delete_segment(segment_request(loc)))
                .await?;
            debug!(limits = resp.addressed_limits.len(), "segment deleted");
            Ok::<_, MetainfoError>(resp.addressed_limits)
        })
        .await
    }

    /// Lists one page of pointers in a bucket.
    ///
    /// Pass the last returned path as `start_after` to fetch the next page while
    /// [`ListPage::more`] is set.
    #[instrument(skip_all, fields(bucket = %bucket, recursive = opts.recursive, limit = opts.limit))]
    pub async fn list_segments(
        &self,
        ctx: &Context,
        bucket: &str,
        opts: ListOptions,
    ) -> Result<ListPage, MetainfoError> {
        let op = Operation::ListSegments;
        self.observe(op, async {
            let limit = if opts.limit == 0 {
                self.default_list_limit
            } else {
                opts.limit
            };
            let req = ListSegmentsRequest {
                bucket: bucket.as_bytes().to_vec(),
                prefix: opts.prefix,
                start_after: opts.start_after,
                end_before: opts.end_before,
                recursive: opts.recursive,
                limit: i32::try_from(limit).unwrap_or(i32::MAX),
                meta_flags: opts.meta_flags.bits(),
            };
            let resp = self
                .call(ctx, op, self.coordinator.list_segments(req))
                .await?;
            if resp.items.len() > limit as usize {
                return Err(MetainfoError::InvalidResponse {
                    op,
                    reason: format!("{} items for a limit of {}", resp.items.len(), limit),
                });
            }
            Ok::<_, MetainfoError>(ListPage {
                items: resp.items,
                more: resp.more,
            })
        })
        .await
    }

    /// Attributes a bucket to a partner.
    #[instrument(skip_all, fields(bucket = %bucket, partner = %partner_id))]
    pub async fn set_attribution(
        &self,
        ctx: &Context,
        bucket: &str,
        partner_id: Uuid,
    ) -> Result<(), MetainfoError> {
        let op = Operation::SetAttribution;
        self.observe(op, async {
            let req = SetAttributionRequest {
                bucket_name: bucket.as_bytes().to_vec(),
                partner_id: partner_id.as_bytes().to_vec(),
            };
            self.call(ctx, op, self.coordinator.set_attribution(req))
                .await
        })
        .await
    }

    /// Fetches project information for the connection's API key.
    #[instrument(skip_all)]
    pub async fn project_info(&self, ctx: &Context) -> Result<ProjectInfo, MetainfoError> {
        let op = Operation::ProjectInfo;
        self.observe(op, async {
            let resp = self.call(ctx, op, self.coordinator.project_info()).await?;
            let project_salt: [u8; 32] = resp.project_salt.as_slice().try_into().map_err(|_| {
                MetainfoError::InvalidResponse {
                    op,
                    reason: format!("project salt is {} bytes", resp.project_salt.len()),
                }
            })?;
            Ok::<_, MetainfoError>(ProjectInfo { project_salt })
        })
        .await
    }

    /// Runs one coordinator request under the caller's context, the fallback
    /// deadline and the connection's lifetime.
    async fn call<T, F>(&self, ctx: &Context, op: Operation, request: F) -> Result<T, MetainfoError>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let scoped;
        let ctx = match self.request_timeout {
            Some(timeout) if ctx.deadline().is_none() => {
                scoped = ctx.clone().timeout(timeout);
                &scoped
            }
            _ => ctx,
        };
        let released = async {
            match &self.connection {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            reason = released => Err(reason),
            out = ctx.run(request) => out,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(MetainfoError::from_status(op, status)),
            Err(reason) => Err(MetainfoError::Cancelled { op, reason }),
        }
    }

    async fn observe<T, F>(&self, op: Operation, fut: F) -> Result<T, MetainfoError>
    where
        F: Future<Output = Result<T, MetainfoError>>,
    {
        let start = Instant::now();
        let result = fut.await;
        match &result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => debug!(%op, "segment not found"),
            Err(e) if e.is_cancelled() => debug!(%op, error = %e, "operation abandoned"),
            Err(e) => warn!(%op, error = %e, "operation failed"),
        }
        if let Some(monitor) = &self.monitor {
            monitor.record(op, start.elapsed(), Outcome::of(&result));
        }
        result
    }
}

/// Refuses numbered segments below zero before anything is sent; on the wire
/// they would collide with the last-segment sentinel.
fn check_locator(op: Operation, loc: &SegmentLocator) -> Result<(), MetainfoError> {
    match loc.segment {
        SegmentIndex::Index(index) if !loc.segment.is_valid() => {
            Err(MetainfoError::InvalidSegmentIndex { op, index })
        }
        _ => Ok(()),
    }
}

fn segment_request(loc: &SegmentLocator) -> SegmentRequest {
    SegmentRequest {
        bucket: loc.bucket.as_bytes().to_vec(),
        path: loc.path.clone(),
        segment: loc.segment.to_wire(),
    }
}

/// Checks a placement response against the scheme it was requested for.
///
/// Piece numbers must be unique and in range and there may be at most `total`
/// authorizations; those are protocol violations. Fewer than `min_required` is a
/// placement failure the caller may retry.
fn check_placement(
    scheme: &RedundancyScheme,
    limits: &[PieceAuthorization],
) -> Result<(), MetainfoError> {
    let op = Operation::CreateSegment;
    let placed = limits.len();
    if placed > scheme.total as usize {
        return Err(MetainfoError::InvalidResponse {
            op,
            reason: format!("{} authorizations for {} pieces", placed, scheme.total),
        });
    }
    let mut seen = vec![false; scheme.total as usize];
    for limit in limits {
        let Some(slot) = seen.get_mut(limit.piece_number as usize) else {
            return Err(MetainfoError::InvalidResponse {
                op,
                reason: format!(
                    "piece number {} out of range for {} pieces",
                    limit.piece_number, scheme.total
                ),
            });
        };
        if *slot {
            return Err(MetainfoError::InvalidResponse {
                op,
                reason: format!("duplicate piece number {}", limit.piece_number),
            });
        }
        *slot = true;
    }
    if placed < scheme.min_required as usize {
        return Err(MetainfoError::PlacementFailed {
            requested: scheme.total,
            placed,
            min_required: scheme.min_required,
        });
    }
    Ok(())
}
