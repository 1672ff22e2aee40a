#![warn(missing_docs)]

//! Metainfo client: segment metadata coordination for an erasure-coded object store.
//!
//! Segments are created, committed, read, deleted and listed through a remote
//! coordinator that hands out per-piece authorizations. This crate drives that
//! protocol ([`MetainfoClient`]), validates redundancy schemes and pointers, and
//! re-indexes download authorizations by piece number ([`align`]) so erasure
//! decoding can address shares directly.

pub mod authorization;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod pointer;
pub mod redundancy;
pub mod rpc;
pub mod types;

pub use authorization::{align, AlignedAuthorizations, PieceAction, PieceAuthorization};
pub use client::{ListOptions, ListPage, MetainfoClient, ProjectInfo};
pub use config::{AttributionPolicy, ClientConfig, ConfigError, MemoryCoordinatorConfig};
pub use connection::{ApiKey, Connection, Dialer};
pub use context::{CancelHandle, CancelReason, Context, Deadline};
pub use error::{MetainfoError, Status, StatusCode};
pub use memory::{MemoryChannel, MemoryCoordinator, MemoryDialer, StorageNode};
pub use monitor::{ClientMetrics, MetricsSnapshot, OperationMonitor, Outcome};
pub use pointer::{ListItem, MetaFlags, Pointer, PointerViolation, RemotePiece};
pub use redundancy::{RedundancyAlgorithm, RedundancyScheme, MAX_TOTAL_PIECES};
pub use rpc::{Coordinator, Operation};
pub use types::{NodeId, PieceId, SegmentIndex, SegmentLocator, Timestamp};
