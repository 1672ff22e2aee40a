//! Test harness: an in-process coordinator with a dialed connection.

use std::sync::Arc;

use metainfo_client::{
    ApiKey, ClientConfig, ClientMetrics, Connection, Context, MemoryCoordinator, MemoryDialer,
    MetainfoClient, MetainfoError, Pointer, RedundancyScheme, RemotePiece, SegmentLocator,
};

/// API key every harness coordinator accepts.
pub const TEST_API_KEY: &str = "metainfo-test-key";

/// 2-of-5 scheme for tests that create many segments.
pub fn small_scheme() -> RedundancyScheme {
    RedundancyScheme::new(2, 3, 4, 5, 256)
}

/// The 29/35/50/80 production-shaped scheme.
pub fn wide_scheme() -> RedundancyScheme {
    RedundancyScheme::new(29, 35, 50, 80, 256)
}

/// A coordinator, an open connection to it and the metrics of that connection.
#[derive(Debug)]
pub struct TestEnv {
    coordinator: Arc<MemoryCoordinator>,
    connection: Connection,
    metrics: Arc<ClientMetrics>,
}

impl TestEnv {
    /// A fresh in-memory coordinator with `nodes` online nodes.
    pub async fn new(nodes: u32) -> Self {
        Self::with_coordinator(Arc::new(MemoryCoordinator::with_nodes(nodes))).await
    }

    /// Connects to an existing coordinator, registering the test key on it.
    pub async fn with_coordinator(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self::with_config(coordinator, ClientConfig::default()).await
    }

    /// Connects with a custom client configuration; the API key is overridden.
    pub async fn with_config(coordinator: Arc<MemoryCoordinator>, mut config: ClientConfig) -> Self {
        coordinator.register_api_key(TEST_API_KEY);
        config.api_key = TEST_API_KEY.to_string();
        let metrics = Arc::new(ClientMetrics::new());
        let dialer = MemoryDialer::new(coordinator.clone());
        let connection = Connection::dial(&Context::background(), &dialer, &config)
            .await
            .expect("failed to dial in-memory coordinator")
            .with_monitor(metrics.clone());
        Self {
            coordinator,
            connection,
            metrics,
        }
    }

    /// A client on the harness connection.
    pub fn client(&self) -> MetainfoClient {
        self.connection.client()
    }

    /// The coordinator behind the connection.
    pub fn coordinator(&self) -> &Arc<MemoryCoordinator> {
        &self.coordinator
    }

    /// The harness connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Metrics recorded by clients of the connection.
    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Keeps exactly `online` nodes online and takes the rest offline.
    pub fn set_online_nodes(&self, online: usize) {
        for (i, node) in self.coordinator.nodes().iter().enumerate() {
            self.coordinator.set_online(&node.id, i < online);
        }
    }

    /// A client that bypasses the connection, presenting `key`.
    pub fn raw_client(&self, key: &str) -> MetainfoClient {
        MetainfoClient::new(Arc::new(self.coordinator.channel(ApiKey::new(key))))
    }
}

/// Creates a segment and commits a pointer covering every placed piece.
pub async fn upload(
    client: &MetainfoClient,
    ctx: &Context,
    loc: &SegmentLocator,
    scheme: &RedundancyScheme,
) -> Result<Pointer, MetainfoError> {
    let (limits, root) = client
        .create_segment(ctx, loc, scheme, 1 << 20, None)
        .await?;
    let pieces = limits
        .iter()
        .map(|l| RemotePiece::new(l.piece_number, l.storage_node_id))
        .collect();
    let pointer = Pointer::new(4096, *scheme, root, pieces);
    client.commit_segment(ctx, loc, pointer, limits).await
}
