//! In-process coordinator over a [`KvStore`].
//!
//! [`MemoryCoordinator`] implements the coordinator side of every RPC against a
//! local key-value store, with a registry of storage nodes that can be taken
//! offline to simulate scarcity. Clients reach it through a [`MemoryChannel`],
//! which carries an API key the way a network channel does, or through
//! [`MemoryDialer`] and a [`crate::connection::Connection`].
//!
//! Pointers are stored bincode-encoded under `<segment>/<bucket>/<path>`, where
//! `<segment>` is `l` for the last segment and `s<N>` otherwise. Because keys are
//! ordered, listing a prefix is a bounded range scan over the `l/` keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use metainfo_kv::{KvError, KvStore, MemoryKvStore};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info};
use uuid::Uuid;

use crate::authorization::{PieceAction, PieceAuthorization};
use crate::config::{AttributionPolicy, MemoryCoordinatorConfig};
use crate::connection::{ApiKey, Dialer};
use crate::error::{Status, StatusCode};
use crate::pointer::{ListItem, MetaFlags, Pointer};
use crate::rpc::{
    CommitSegmentRequest, CommitSegmentResponse, Coordinator, CreateSegmentRequest,
    CreateSegmentResponse, DeleteSegmentResponse, DownloadSegmentResponse, ListSegmentsRequest,
    ListSegmentsResponse, Operation, ProjectInfoResponse, SegmentInfoResponse, SegmentRequest,
    SetAttributionRequest,
};
use crate::types::{NodeId, PieceId, SegmentIndex, Timestamp};

type HmacSha512 = Hmac<Sha512>;

/// Keys fetched from the store per scan step while listing.
const SCAN_BATCH: usize = 256;

/// A storage node known to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageNode {
    /// Node identity.
    pub id: NodeId,
    /// Dial address placed into authorizations.
    pub address: String,
}

impl StorageNode {
    /// The `index`-th node of a simulated fleet, with a deterministic ID.
    pub fn simulated(index: u32) -> Self {
        let digest = Sha256::digest(format!("storage-node-{index}").as_bytes());
        Self {
            id: NodeId::new(digest.into()),
            address: format!("10.0.{}.{}:28967", index / 256, index % 256),
        }
    }
}

#[derive(Clone, Debug)]
struct NodeState {
    address: String,
    online: bool,
}

fn kv_status(e: KvError) -> Status {
    match e {
        KvError::KeyNotFound(_) => Status::not_found("segment not found"),
        KvError::Closed => Status::new(StatusCode::Unavailable, "metadata store closed"),
        other => Status::internal(other.to_string()),
    }
}

fn segment_key(segment: SegmentIndex, bucket: &[u8], path: &[u8]) -> Vec<u8> {
    let component = segment.key_component();
    let mut key = Vec::with_capacity(component.len() + bucket.len() + path.len() + 2);
    key.extend_from_slice(component.as_bytes());
    key.push(b'/');
    key.extend_from_slice(bucket);
    key.push(b'/');
    key.extend_from_slice(path);
    key
}

fn wire_segment(segment: i64) -> Result<SegmentIndex, Status> {
    SegmentIndex::from_wire(segment)
        .ok_or_else(|| Status::invalid_argument(format!("invalid segment index {segment}")))
}

/// First key ordered after every key starting with `prefix` followed by `/`.
fn seek_past(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.push(b'/' + 1);
    key
}

/// Coordinator implementation backed by a [`KvStore`].
pub struct MemoryCoordinator {
    kv: Arc<dyn KvStore>,
    config: MemoryCoordinatorConfig,
    nodes: DashMap<NodeId, NodeState>,
    api_keys: DashSet<String>,
    attributions: DashMap<Vec<u8>, Uuid>,
    failures: DashMap<Operation, Status>,
    latency_us: AtomicU64,
    project_id: Uuid,
    signing_key: [u8; 32],
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("nodes", &self.nodes.len())
            .field("project_id", &self.project_id)
            .field("config", &self.config)
            .finish()
    }
}

impl MemoryCoordinator {
    /// A coordinator over `kv` with no nodes and no API keys.
    pub fn new(kv: Arc<dyn KvStore>, config: MemoryCoordinatorConfig) -> Self {
        Self {
            kv,
            config,
            nodes: DashMap::new(),
            api_keys: DashSet::new(),
            attributions: DashMap::new(),
            failures: DashMap::new(),
            latency_us: AtomicU64::new(0),
            project_id: Uuid::new_v4(),
            signing_key: rand::random(),
        }
    }

    /// A coordinator over a fresh [`MemoryKvStore`] with `count` online nodes.
    pub fn with_nodes(count: u32) -> Self {
        let coordinator = Self::new(
            Arc::new(MemoryKvStore::new()),
            MemoryCoordinatorConfig::default(),
        );
        for i in 0..count {
            coordinator.add_node(StorageNode::simulated(i));
        }
        coordinator
    }

    /// Registers (or re-registers) an online node.
    pub fn add_node(&self, node: StorageNode) {
        self.nodes.insert(
            node.id,
            NodeState {
                address: node.address,
                online: true,
            },
        );
    }

    /// Marks a node online or offline. Returns false for unknown nodes.
    pub fn set_online(&self, id: &NodeId, online: bool) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut state) => {
                state.online = online;
                true
            }
            None => false,
        }
    }

    /// Registered nodes, in no particular order.
    pub fn nodes(&self) -> Vec<StorageNode> {
        self.nodes
            .iter()
            .map(|e| StorageNode {
                id: *e.key(),
                address: e.value().address.clone(),
            })
            .collect()
    }

    /// Number of nodes currently online.
    pub fn online_count(&self) -> usize {
        self.nodes.iter().filter(|e| e.value().online).count()
    }

    /// Accepts `key` on subsequent calls.
    pub fn register_api_key(&self, key: impl Into<String>) {
        self.api_keys.insert(key.into());
    }

    /// Partner a bucket is attributed to.
    pub fn attribution(&self, bucket: &[u8]) -> Option<Uuid> {
        self.attributions.get(bucket).map(|e| *e.value())
    }

    /// Delay applied to every call before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// The next call of `op` fails with `status` instead of being served.
    pub fn fail_next(&self, op: Operation, status: Status) {
        self.failures.insert(op, status);
    }

    /// An authenticated channel to this coordinator.
    pub fn channel(self: &Arc<Self>, api_key: ApiKey) -> MemoryChannel {
        MemoryChannel {
            coordinator: self.clone(),
            api_key,
        }
    }

    fn authenticate(&self, api_key: &ApiKey) -> Result<(), Status> {
        if api_key.is_empty() {
            return Err(Status::new(StatusCode::Unauthenticated, "missing API key"));
        }
        if !self.api_keys.contains(api_key.as_str()) {
            return Err(Status::new(StatusCode::Unauthenticated, "unknown API key"));
        }
        Ok(())
    }

    async fn admit(&self, api_key: &ApiKey, op: Operation) -> Result<(), Status> {
        self.authenticate(api_key)?;
        let latency = self.latency_us.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if let Some((_, status)) = self.failures.remove(&op) {
            debug!(%op, code = %status.code, "injected failure");
            return Err(status);
        }
        Ok(())
    }

    fn sign(&self, limit: &PieceAuthorization) -> Vec<u8> {
        let mut key = Key::<HmacSha512>::default();
        key[..self.signing_key.len()].copy_from_slice(&self.signing_key);
        let mut mac = <HmacSha512 as KeyInit>::new(&key);
        mac.update(&limit.serial_number);
        mac.update(limit.storage_node_id.as_bytes());
        mac.update(&limit.piece_number.to_be_bytes());
        mac.update(limit.piece_id.as_bytes());
        mac.update(&[limit.action as u8]);
        mac.update(&limit.expires_at.secs.to_be_bytes());
        mac.update(&limit.expires_at.nanos.to_be_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, limit: &PieceAuthorization) -> bool {
        !limit.limit_token.is_empty() && self.sign(limit) == limit.limit_token
    }

    fn issue(
        &self,
        root: &PieceId,
        piece_number: u32,
        node: NodeId,
        address: &str,
        action: PieceAction,
    ) -> PieceAuthorization {
        let expires_at = Timestamp::now()
            .saturating_add(Duration::from_secs(self.config.order_expiration_secs));
        let mut limit = PieceAuthorization {
            piece_number,
            storage_node_id: node,
            piece_id: root.derive(&node, piece_number),
            action,
            serial_number: rand::random(),
            limit_token: Vec::new(),
            expires_at,
            address: Some(address.to_string()),
        };
        limit.limit_token = self.sign(&limit);
        limit
    }

    /// Online nodes in random order.
    fn shuffled_online(&self) -> Vec<(NodeId, String)> {
        let mut online: Vec<(NodeId, String)> = self
            .nodes
            .iter()
            .filter(|e| e.value().online)
            .map(|e| (*e.key(), e.value().address.clone()))
            .collect();
        online.shuffle(&mut rand::thread_rng());
        online
    }

    /// Authorizations for the online nodes holding `pointer`'s pieces, unordered.
    fn limits_for(&self, pointer: &Pointer, action: PieceAction) -> Vec<PieceAuthorization> {
        let mut limits: Vec<PieceAuthorization> = pointer
            .pieces
            .iter()
            .filter_map(|piece| {
                let state = self.nodes.get(&piece.node_id)?;
                if !state.online {
                    return None;
                }
                Some(self.issue(
                    &pointer.root_piece_id,
                    piece.piece_number,
                    piece.node_id,
                    &state.address,
                    action,
                ))
            })
            .collect();
        limits.shuffle(&mut rand::thread_rng());
        limits
    }

    fn load(&self, key: &[u8]) -> Result<Pointer, Status> {
        let value = self.kv.get(key).map_err(kv_status)?;
        bincode::deserialize(&value)
            .map_err(|e| Status::internal(format!("corrupt pointer record: {e}")))
    }

    /// Serves `CreateSegment`.
    pub async fn create_segment(
        &self,
        api_key: &ApiKey,
        req: CreateSegmentRequest,
    ) -> Result<CreateSegmentResponse, Status> {
        self.admit(api_key, Operation::CreateSegment).await?;
        if req.bucket.is_empty() {
            return Err(Status::invalid_argument("bucket name is empty"));
        }
        wire_segment(req.segment)?;
        req.redundancy
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if req.max_encrypted_segment_size <= 0 {
            return Err(Status::invalid_argument("max segment size must be positive"));
        }
        if let Some(expiration) = req.expiration {
            if expiration <= Timestamp::now() {
                return Err(Status::invalid_argument("expiration is not in the future"));
            }
        }

        let root = PieceId::random();
        let addressed_limits: Vec<PieceAuthorization> = self
            .shuffled_online()
            .into_iter()
            .take(req.redundancy.total as usize)
            .zip(0u32..)
            .map(|((node, address), piece_number)| {
                self.issue(&root, piece_number, node, &address, PieceAction::Put)
            })
            .collect();
        debug!(
            requested = req.redundancy.total,
            placed = addressed_limits.len(),
            "placement allocated"
        );
        Ok(CreateSegmentResponse {
            addressed_limits,
            root_piece_id: root,
        })
    }

    /// Serves `CommitSegment`.
    pub async fn commit_segment(
        &self,
        api_key: &ApiKey,
        req: CommitSegmentRequest,
    ) -> Result<CommitSegmentResponse, Status> {
        self.admit(api_key, Operation::CommitSegment).await?;
        let mut pointer = req.pointer;
        pointer
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if pointer.pieces.len() < pointer.redundancy.min_required as usize {
            return Err(Status::invalid_argument(format!(
                "{} pieces committed, {} required",
                pointer.pieces.len(),
                pointer.redundancy.min_required
            )));
        }

        let now = Timestamp::now();
        for piece in &pointer.pieces {
            let authorized = req.original_limits.iter().any(|limit| {
                limit.storage_node_id == piece.node_id
                    && limit.piece_number == piece.piece_number
                    && limit.action == PieceAction::Put
                    && limit.piece_id == pointer.root_piece_id.derive(&piece.node_id, piece.piece_number)
                    && !limit.is_expired(now)
                    && self.verify(limit)
            });
            if !authorized {
                return Err(Status::invalid_argument(format!(
                    "piece {} on node {} was not authorized",
                    piece.piece_number, piece.node_id
                )));
            }
        }

        pointer.creation_time = now;
        let segment = wire_segment(req.segment)?;
        let key = segment_key(segment, &req.bucket, &req.path);
        let value = bincode::serialize(&pointer)
            .map_err(|e| Status::internal(format!("encode pointer: {e}")))?;
        self.kv.put(key, value).map_err(kv_status)?;
        debug!(%segment, pieces = pointer.pieces.len(), "pointer committed");
        Ok(CommitSegmentResponse { pointer })
    }

    /// Serves `SegmentInfo`.
    pub async fn segment_info(
        &self,
        api_key: &ApiKey,
        req: SegmentRequest,
    ) -> Result<SegmentInfoResponse, Status> {
        self.admit(api_key, Operation::SegmentInfo).await?;
        let key = segment_key(wire_segment(req.segment)?, &req.bucket, &req.path);
        Ok(SegmentInfoResponse {
            pointer: self.load(&key)?,
        })
    }

    /// Serves `DownloadSegment`.
    pub async fn download_segment(
        &self,
        api_key: &ApiKey,
        req: SegmentRequest,
    ) -> Result<DownloadSegmentResponse, Status> {
        self.admit(api_key, Operation::ReadSegment).await?;
        let key = segment_key(wire_segment(req.segment)?, &req.bucket, &req.path);
        let pointer = self.load(&key)?;
        let addressed_limits = self.limits_for(&pointer, PieceAction::Get);
        Ok(DownloadSegmentResponse {
            pointer,
            addressed_limits,
        })
    }

    /// Serves `DeleteSegment`. The pointer is gone once this returns; pieces
    /// are removed by nodes honoring the returned authorizations.
    pub async fn delete_segment(
        &self,
        api_key: &ApiKey,
        req: SegmentRequest,
    ) -> Result<DeleteSegmentResponse, Status> {
        self.admit(api_key, Operation::DeleteSegment).await?;
        let key = segment_key(wire_segment(req.segment)?, &req.bucket, &req.path);
        let pointer = self.load(&key)?;
        let addressed_limits = self.limits_for(&pointer, PieceAction::Delete);
        self.kv.delete(&key).map_err(kv_status)?;
        debug!(limits = addressed_limits.len(), "pointer deleted");
        Ok(DeleteSegmentResponse { addressed_limits })
    }

    /// Serves `ListSegments` over last-segment pointers.
    pub async fn list_segments(
        &self,
        api_key: &ApiKey,
        req: ListSegmentsRequest,
    ) -> Result<ListSegmentsResponse, Status> {
        self.admit(api_key, Operation::ListSegments).await?;
        if req.bucket.is_empty() {
            return Err(Status::invalid_argument("bucket name is empty"));
        }
        self.scan(&req)
    }

    fn scan(&self, req: &ListSegmentsRequest) -> Result<ListSegmentsResponse, Status> {
        let max = self.config.max_list_limit.max(1) as usize;
        let limit = if req.limit <= 0 {
            max
        } else {
            (req.limit as usize).min(max)
        };
        let flags = MetaFlags::from_bits(req.meta_flags);
        let base = segment_key(SegmentIndex::Last, &req.bucket, &req.prefix);

        let mut cursor = base.clone();
        let mut exclusive = false;
        if !req.start_after.is_empty() {
            cursor.extend_from_slice(&req.start_after);
            exclusive = true;
        }

        let mut items = Vec::new();
        'scan: loop {
            let keys = self.kv.list(Some(cursor.as_slice()), SCAN_BATCH).map_err(kv_status)?;
            let exhausted = keys.len() < SCAN_BATCH;
            let last = keys.last().cloned();
            let mut seek = None;

            for key in &keys {
                if exclusive && *key == cursor {
                    continue;
                }
                if !key.starts_with(&base) {
                    break 'scan;
                }
                let rel = &key[base.len()..];
                let delimiter = if req.recursive {
                    None
                } else {
                    rel.iter().position(|b| *b == b'/')
                };
                let path = match delimiter {
                    Some(pos) => &rel[..=pos],
                    None => rel,
                };
                if !req.end_before.is_empty() && path >= req.end_before.as_slice() {
                    break 'scan;
                }
                if !req.start_after.is_empty() && path <= req.start_after.as_slice() {
                    if let Some(pos) = delimiter {
                        seek = Some(seek_past(&key[..base.len() + pos]));
                        break;
                    }
                    continue;
                }
                if items.len() == limit {
                    return Ok(ListSegmentsResponse { items, more: true });
                }
                match delimiter {
                    Some(pos) => {
                        items.push(ListItem {
                            path: path.to_vec(),
                            pointer: None,
                            is_prefix: true,
                        });
                        seek = Some(seek_past(&key[..base.len() + pos]));
                        break;
                    }
                    None => {
                        let pointer = self.load(key)?;
                        items.push(ListItem {
                            path: path.to_vec(),
                            pointer: flags.project(&pointer),
                            is_prefix: false,
                        });
                    }
                }
            }

            match (seek, last) {
                (Some(next), _) => {
                    cursor = next;
                    exclusive = false;
                }
                (None, Some(last)) if !exhausted => {
                    cursor = last;
                    exclusive = true;
                }
                _ => break,
            }
        }
        Ok(ListSegmentsResponse { items, more: false })
    }

    /// Serves `SetAttribution` under the configured policy.
    pub async fn set_attribution(
        &self,
        api_key: &ApiKey,
        req: SetAttributionRequest,
    ) -> Result<(), Status> {
        self.admit(api_key, Operation::SetAttribution).await?;
        if req.bucket_name.is_empty() {
            return Err(Status::invalid_argument("bucket name is empty"));
        }
        let partner = Uuid::from_slice(&req.partner_id)
            .map_err(|e| Status::invalid_argument(format!("partner id: {e}")))?;

        match self.config.attribution_policy {
            AttributionPolicy::Overwrite => {
                self.attributions.insert(req.bucket_name, partner);
            }
            AttributionPolicy::RejectConflicting => {
                let existing = *self
                    .attributions
                    .entry(req.bucket_name)
                    .or_insert(partner)
                    .value();
                if existing != partner {
                    return Err(Status::new(
                        StatusCode::AlreadyExists,
                        format!("bucket already attributed to {existing}"),
                    ));
                }
            }
        }
        info!(%partner, "bucket attributed");
        Ok(())
    }

    /// Serves `ProjectInfo`.
    pub async fn project_info(&self, api_key: &ApiKey) -> Result<ProjectInfoResponse, Status> {
        self.admit(api_key, Operation::ProjectInfo).await?;
        Ok(ProjectInfoResponse {
            project_salt: Sha256::digest(self.project_id.as_bytes()).to_vec(),
        })
    }
}

/// Authenticated channel to a [`MemoryCoordinator`].
#[derive(Clone, Debug)]
pub struct MemoryChannel {
    coordinator: Arc<MemoryCoordinator>,
    api_key: ApiKey,
}

impl MemoryChannel {
    /// A channel presenting `api_key` on every call.
    pub fn new(coordinator: Arc<MemoryCoordinator>, api_key: ApiKey) -> Self {
        Self {
            coordinator,
            api_key,
        }
    }
}

#[async_trait]
impl Coordinator for MemoryChannel {
    async fn create_segment(
        &self,
        req: CreateSegmentRequest,
    ) -> Result<CreateSegmentResponse, Status> {
        self.coordinator.create_segment(&self.api_key, req).await
    }

    async fn commit_segment(
        &self,
        req: CommitSegmentRequest,
    ) -> Result<CommitSegmentResponse, Status> {
        self.coordinator.commit_segment(&self.api_key, req).await
    }

    async fn segment_info(&self, req: SegmentRequest) -> Result<SegmentInfoResponse, Status> {
        self.coordinator.segment_info(&self.api_key, req).await
    }

    async fn download_segment(
        &self,
        req: SegmentRequest,
    ) -> Result<DownloadSegmentResponse, Status> {
        self.coordinator.download_segment(&self.api_key, req).await
    }

    async fn delete_segment(&self, req: SegmentRequest) -> Result<DeleteSegmentResponse, Status> {
        self.coordinator.delete_segment(&self.api_key, req).await
    }

    async fn list_segments(
        &self,
        req: ListSegmentsRequest,
    ) -> Result<ListSegmentsResponse, Status> {
        self.coordinator.list_segments(&self.api_key, req).await
    }

    async fn set_attribution(&self, req: SetAttributionRequest) -> Result<(), Status> {
        self.coordinator.set_attribution(&self.api_key, req).await
    }

    async fn project_info(&self) -> Result<ProjectInfoResponse, Status> {
        self.coordinator.project_info(&self.api_key).await
    }
}

/// Dials a single in-process coordinator regardless of address.
#[derive(Clone, Debug)]
pub struct MemoryDialer {
    coordinator: Arc<MemoryCoordinator>,
}

impl MemoryDialer {
    /// A dialer handing out channels to `coordinator`.
    pub fn new(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str, api_key: &ApiKey) -> Result<Arc<dyn Coordinator>, Status> {
        self.coordinator.authenticate(api_key)?;
        debug!(address, "in-memory channel opened");
        Ok(Arc::new(self.coordinator.channel(api_key.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::RemotePiece;
    use crate::redundancy::RedundancyScheme;

    const KEY: &str = "test-key";

    fn coordinator(nodes: u32) -> Arc<MemoryCoordinator> {
        let c = Arc::new(MemoryCoordinator::with_nodes(nodes));
        c.register_api_key(KEY);
        c
    }

    fn key() -> ApiKey {
        ApiKey::new(KEY)
    }

    fn scheme() -> RedundancyScheme {
        RedundancyScheme::new(2, 3, 4, 5, 256)
    }

    fn create_req(path: &[u8]) -> CreateSegmentRequest {
        CreateSegmentRequest {
            bucket: b"bucket".to_vec(),
            path: path.to_vec(),
            segment: -1,
            redundancy: scheme(),
            max_encrypted_segment_size: 1 << 20,
            expiration: None,
        }
    }

    async fn put(c: &MemoryCoordinator, path: &[u8]) -> Pointer {
        put_segment(c, path, -1).await
    }

    async fn put_segment(c: &MemoryCoordinator, path: &[u8], segment: i64) -> Pointer {
        let mut req = create_req(path);
        req.segment = segment;
        let created = c.create_segment(&key(), req).await.unwrap();
        let pieces = created
            .addressed_limits
            .iter()
            .map(|l| RemotePiece::new(l.piece_number, l.storage_node_id))
            .collect();
        let pointer = Pointer::new(100, scheme(), created.root_piece_id, pieces);
        c.commit_segment(
            &key(),
            CommitSegmentRequest {
                bucket: b"bucket".to_vec(),
                path: path.to_vec(),
                segment,
                pointer,
                original_limits: created.addressed_limits,
            },
        )
        .await
        .unwrap()
        .pointer
    }

    fn list_req(prefix: &[u8], recursive: bool, limit: i32) -> ListSegmentsRequest {
        ListSegmentsRequest {
            bucket: b"bucket".to_vec(),
            prefix: prefix.to_vec(),
            start_after: Vec::new(),
            end_before: Vec::new(),
            recursive,
            limit,
            meta_flags: MetaFlags::ALL.bits(),
        }
    }

    fn paths(resp: &ListSegmentsResponse) -> Vec<String> {
        resp.items
            .iter()
            .map(|i| String::from_utf8_lossy(&i.path).into_owned())
            .collect()
    }

    #[test]
    fn test_segment_key_layout() {
        assert_eq!(segment_key(SegmentIndex::Last, b"b", b"x/y"), b"l/b/x/y".to_vec());
        assert_eq!(
            segment_key(SegmentIndex::Index(3), b"b", b"x"),
            b"s3/b/x".to_vec()
        );
        assert_eq!(seek_past(b"l/b/dir"), b"l/b/dir0".to_vec());
    }

    #[tokio::test]
    async fn test_authentication() {
        let c = coordinator(1);
        let err = c.project_info(&ApiKey::new("")).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
        let err = c.project_info(&ApiKey::new("other")).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unauthenticated);
        let info = c.project_info(&key()).await.unwrap();
        assert_eq!(info.project_salt.len(), 32);
    }

    #[tokio::test]
    async fn test_placement_uses_online_nodes_only() {
        let c = coordinator(5);
        let nodes = c.nodes();
        c.set_online(&nodes[0].id, false);
        c.set_online(&nodes[1].id, false);
        assert_eq!(c.online_count(), 3);

        let created = c.create_segment(&key(), create_req(b"p")).await.unwrap();
        assert_eq!(created.addressed_limits.len(), 3);
        for limit in &created.addressed_limits {
            assert_ne!(limit.storage_node_id, nodes[0].id);
            assert_ne!(limit.storage_node_id, nodes[1].id);
            assert_eq!(limit.action, PieceAction::Put);
            assert_eq!(
                limit.piece_id,
                created.root_piece_id.derive(&limit.storage_node_id, limit.piece_number)
            );
            assert!(limit.address.is_some());
        }
        let mut numbers: Vec<u32> = created.addressed_limits.iter().map(|l| l.piece_number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_create_rejects_past_expiration() {
        let c = coordinator(5);
        let mut req = create_req(b"p");
        req.expiration = Some(Timestamp::from_secs(1));
        assert_eq!(
            c.create_segment(&key(), req).await.unwrap_err().code,
            StatusCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_commit_and_lookup() {
        let c = coordinator(5);
        let committed = put(&c, b"obj").await;
        assert!(committed.creation_time > Timestamp::from_secs(0));

        let req = SegmentRequest {
            bucket: b"bucket".to_vec(),
            path: b"obj".to_vec(),
            segment: -1,
        };
        let info = c.segment_info(&key(), req.clone()).await.unwrap();
        assert_eq!(info.pointer, committed);

        let download = c.download_segment(&key(), req.clone()).await.unwrap();
        assert_eq!(download.addressed_limits.len(), 5);
        assert!(download
            .addressed_limits
            .iter()
            .all(|l| l.action == PieceAction::Get));

        let deleted = c.delete_segment(&key(), req.clone()).await.unwrap();
        assert_eq!(deleted.addressed_limits.len(), 5);
        assert_eq!(
            c.segment_info(&key(), req).await.unwrap_err().code,
            StatusCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_download_skips_offline_nodes() {
        let c = coordinator(5);
        let pointer = put(&c, b"obj").await;
        c.set_online(&pointer.pieces[2].node_id, false);
        let download = c
            .download_segment(
                &key(),
                SegmentRequest {
                    bucket: b"bucket".to_vec(),
                    path: b"obj".to_vec(),
                    segment: -1,
                },
            )
            .await
            .unwrap();
        assert_eq!(download.addressed_limits.len(), 4);
    }

    #[tokio::test]
    async fn test_commit_rejects_forged_limits() {
        let c = coordinator(5);
        let created = c.create_segment(&key(), create_req(b"p")).await.unwrap();
        let pieces: Vec<RemotePiece> = created
            .addressed_limits
            .iter()
            .map(|l| RemotePiece::new(l.piece_number, l.storage_node_id))
            .collect();
        let mut forged = created.addressed_limits.clone();
        forged[0].limit_token = vec![0; 64];

        let err = c
            .commit_segment(
                &key(),
                CommitSegmentRequest {
                    bucket: b"bucket".to_vec(),
                    path: b"p".to_vec(),
                    segment: -1,
                    pointer: Pointer::new(1, scheme(), created.root_piece_id, pieces),
                    original_limits: forged,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_commit_rejects_too_few_pieces() {
        let c = coordinator(5);
        let created = c.create_segment(&key(), create_req(b"p")).await.unwrap();
        let one = &created.addressed_limits[0];
        let err = c
            .commit_segment(
                &key(),
                CommitSegmentRequest {
                    bucket: b"bucket".to_vec(),
                    path: b"p".to_vec(),
                    segment: -1,
                    pointer: Pointer::new(
                        1,
                        scheme(),
                        created.root_piece_id,
                        vec![RemotePiece::new(one.piece_number, one.storage_node_id)],
                    ),
                    original_limits: created.addressed_limits.clone(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_collapses_prefixes() {
        let c = coordinator(5);
        for path in ["a/1", "a/2", "b", "c/x/y", "d"] {
            put(&c, path.as_bytes()).await;
        }

        let flat = c
            .list_segments(&key(), list_req(b"", false, 0))
            .await
            .unwrap();
        assert_eq!(paths(&flat), vec!["a/", "b", "c/", "d"]);
        assert!(flat.items[0].is_prefix);
        assert!(flat.items[0].pointer.is_none());
        assert!(flat.items[1].pointer.is_some());
        assert!(!flat.more);

        let deep = c
            .list_segments(&key(), list_req(b"", true, 0))
            .await
            .unwrap();
        assert_eq!(paths(&deep), vec!["a/1", "a/2", "b", "c/x/y", "d"]);

        let under_c = c
            .list_segments(&key(), list_req(b"c/", false, 0))
            .await
            .unwrap();
        assert_eq!(paths(&under_c), vec!["x/"]);
    }

    #[tokio::test]
    async fn test_list_cursor_after_prefix() {
        let c = coordinator(5);
        for path in ["a/1", "a/2", "b", "c"] {
            put(&c, path.as_bytes()).await;
        }
        let first = c
            .list_segments(&key(), list_req(b"", false, 1))
            .await
            .unwrap();
        assert_eq!(paths(&first), vec!["a/"]);
        assert!(first.more);

        let mut req = list_req(b"", false, 10);
        req.start_after = b"a/".to_vec();
        req.end_before = b"c".to_vec();
        let rest = c.list_segments(&key(), req).await.unwrap();
        assert_eq!(paths(&rest), vec!["b"]);
        assert!(!rest.more);
    }

    #[tokio::test]
    async fn test_list_meta_flags_and_cap() {
        let config = MemoryCoordinatorConfig {
            max_list_limit: 2,
            ..MemoryCoordinatorConfig::default()
        };
        let c = Arc::new(MemoryCoordinator::new(Arc::new(MemoryKvStore::new()), config));
        c.register_api_key(KEY);
        for i in 0..5 {
            c.add_node(StorageNode::simulated(i));
        }
        for path in ["x", "y", "z"] {
            put(&c, path.as_bytes()).await;
        }

        let mut req = list_req(b"", true, 100);
        req.meta_flags = MetaFlags::NONE.bits();
        let resp = c.list_segments(&key(), req).await.unwrap();
        assert_eq!(resp.items.len(), 2);
        assert!(resp.more);
        assert!(resp.items.iter().all(|i| i.pointer.is_none()));
    }

    #[tokio::test]
    async fn test_list_ignores_numbered_segments() {
        let c = coordinator(5);
        put(&c, b"obj").await;
        put_segment(&c, b"obj", 0).await;
        put_segment(&c, b"other", 1).await;
        let resp = c
            .list_segments(&key(), list_req(b"", true, 0))
            .await
            .unwrap();
        assert_eq!(paths(&resp), vec!["obj"]);
    }

    #[tokio::test]
    async fn test_negative_wire_segment_is_rejected() {
        let c = coordinator(5);
        let last = put(&c, b"obj").await;

        let mut req = create_req(b"obj");
        req.segment = -7;
        assert_eq!(
            c.create_segment(&key(), req).await.unwrap_err().code,
            StatusCode::InvalidArgument
        );

        let created = c.create_segment(&key(), create_req(b"obj")).await.unwrap();
        let pieces = created
            .addressed_limits
            .iter()
            .map(|l| RemotePiece::new(l.piece_number, l.storage_node_id))
            .collect();
        let err = c
            .commit_segment(
                &key(),
                CommitSegmentRequest {
                    bucket: b"bucket".to_vec(),
                    path: b"obj".to_vec(),
                    segment: -7,
                    pointer: Pointer::new(7, scheme(), created.root_piece_id, pieces),
                    original_limits: created.addressed_limits,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);

        let lookup = SegmentRequest {
            bucket: b"bucket".to_vec(),
            path: b"obj".to_vec(),
            segment: -7,
        };
        assert_eq!(
            c.segment_info(&key(), lookup).await.unwrap_err().code,
            StatusCode::InvalidArgument
        );
        let req = SegmentRequest {
            bucket: b"bucket".to_vec(),
            path: b"obj".to_vec(),
            segment: -1,
        };
        assert_eq!(c.segment_info(&key(), req).await.unwrap().pointer, last);
    }

    #[tokio::test]
    async fn test_attribution_policies() {
        let c = coordinator(1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let req = |partner: Uuid| SetAttributionRequest {
            bucket_name: b"bucket".to_vec(),
            partner_id: partner.as_bytes().to_vec(),
        };
        c.set_attribution(&key(), req(first)).await.unwrap();
        c.set_attribution(&key(), req(first)).await.unwrap();
        let err = c.set_attribution(&key(), req(second)).await.unwrap_err();
        assert_eq!(err.code, StatusCode::AlreadyExists);
        assert_eq!(c.attribution(b"bucket"), Some(first));

        let overwrite = Arc::new(MemoryCoordinator::new(
            Arc::new(MemoryKvStore::new()),
            MemoryCoordinatorConfig {
                attribution_policy: AttributionPolicy::Overwrite,
                ..MemoryCoordinatorConfig::default()
            },
        ));
        overwrite.register_api_key(KEY);
        overwrite.set_attribution(&key(), req(first)).await.unwrap();
        overwrite.set_attribution(&key(), req(second)).await.unwrap();
        assert_eq!(overwrite.attribution(b"bucket"), Some(second));

        let bad = SetAttributionRequest {
            bucket_name: b"bucket".to_vec(),
            partner_id: vec![1, 2, 3],
        };
        assert_eq!(
            c.set_attribution(&key(), bad).await.unwrap_err().code,
            StatusCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let c = coordinator(1);
        c.fail_next(
            Operation::ProjectInfo,
            Status::new(StatusCode::Unavailable, "maintenance"),
        );
        assert_eq!(
            c.project_info(&key()).await.unwrap_err().code,
            StatusCode::Unavailable
        );
        c.project_info(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dialer_checks_key() {
        let c = coordinator(1);
        let dialer = MemoryDialer::new(c);
        assert!(dialer.dial("sat:7777", &key()).await.is_ok());
        let err = dialer.dial("sat:7777", &ApiKey::new("")).await.err().unwrap();
        assert_eq!(err.code, StatusCode::Unauthenticated);
    }
}
