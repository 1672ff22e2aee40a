//! Identifiers, timestamps and segment addressing.

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha512 = Hmac<Sha512>;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// Identity of a storage node holding pieces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Creates a NodeId from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }

    /// Returns the raw bytes of this node ID.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Identifier of a segment's pieces.
///
/// The coordinator allocates one root ID per segment; the ID a node stores a
/// piece under is derived from the root, the node ID and the piece number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PieceId([u8; 32]);

impl PieceId {
    /// Creates a PieceId from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        PieceId(bytes)
    }

    /// Generates a new random root piece ID.
    pub fn random() -> Self {
        PieceId(rand::random())
    }

    /// Returns the raw bytes of this piece ID.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives the per-node piece ID: HMAC-SHA512(root, node || piece_number_be), truncated.
    pub fn derive(&self, node: &NodeId, piece_number: u32) -> PieceId {
        // zero-padding to the block size leaves the HMAC unchanged
        let mut key = Key::<HmacSha512>::default();
        key[..self.0.len()].copy_from_slice(&self.0);
        let mut mac = <HmacSha512 as KeyInit>::new(&key);
        mac.update(node.as_bytes());
        mac.update(&piece_number.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        PieceId(out)
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// A timestamp at whole seconds since the Unix epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Returns this timestamp shifted forward by `d`.
    pub fn saturating_add(self, d: Duration) -> Self {
        let total = Duration::new(self.secs, self.nanos).saturating_add(d);
        Self {
            secs: total.as_secs(),
            nanos: total.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Position of a segment within its object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentIndex {
    /// A numbered segment.
    Index(i64),
    /// The reserved last-segment slot, which also carries object-level metadata.
    Last,
}

impl SegmentIndex {
    /// Encodes the index as sent on the wire; `Last` is `-1`.
    pub fn to_wire(self) -> i64 {
        match self {
            SegmentIndex::Index(i) => i,
            SegmentIndex::Last => -1,
        }
    }

    /// Decodes a wire index. `-1` is the last-segment sentinel; any other
    /// negative value addresses nothing and yields `None`.
    pub fn from_wire(i: i64) -> Option<Self> {
        match i {
            -1 => Some(SegmentIndex::Last),
            i if i >= 0 => Some(SegmentIndex::Index(i)),
            _ => None,
        }
    }

    /// False for a numbered index below zero, which has no wire encoding.
    pub fn is_valid(self) -> bool {
        !matches!(self, SegmentIndex::Index(i) if i < 0)
    }

    /// Storage key component: `l` for the last segment, `s<N>` otherwise.
    pub fn key_component(self) -> String {
        match self {
            SegmentIndex::Index(i) => format!("s{}", i),
            SegmentIndex::Last => "l".to_string(),
        }
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_component())
    }
}

/// Address of a segment: bucket, encrypted object path and segment index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentLocator {
    /// Bucket name.
    pub bucket: String,
    /// Object path within the bucket.
    pub path: Vec<u8>,
    /// Segment position within the object.
    pub segment: SegmentIndex,
}

impl SegmentLocator {
    /// Creates a locator.
    pub fn new(bucket: impl Into<String>, path: impl Into<Vec<u8>>, segment: SegmentIndex) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            segment,
        }
    }

    /// Locator of the last segment of an object.
    pub fn last(bucket: impl Into<String>, path: impl Into<Vec<u8>>) -> Self {
        Self::new(bucket, path, SegmentIndex::Last)
    }
}

impl fmt::Display for SegmentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.segment,
            self.bucket,
            String::from_utf8_lossy(&self.path)
        )
    }
}
