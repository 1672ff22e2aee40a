//! Authenticated channel to the coordinator and its scoped release.
//!
//! A [`Dialer`] produces a [`Coordinator`] channel that carries the API key on
//! every call. [`Connection`] owns that channel for its lifetime: clients handed
//! out by [`Connection::client`] share it, and [`Connection::close`] (or dropping
//! the connection) aborts anything still running on it. There is no implicit
//! reconnection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::client::MetainfoClient;
use crate::config::ClientConfig;
use crate::context::{new_cancel_pair, CancelHandle, CancelReason, CancelToken, Context};
use crate::error::{MetainfoError, Status, StatusCode};
use crate::monitor::OperationMonitor;
use crate::rpc::Coordinator;

/// API key presented as channel metadata. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wraps a serialized key.
    pub fn new(key: impl Into<String>) -> Self {
        ApiKey(key.into())
    }

    /// The serialized key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Establishes authenticated coordinator channels.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `address`; the returned channel attaches `api_key` to every call.
    async fn dial(&self, address: &str, api_key: &ApiKey) -> Result<Arc<dyn Coordinator>, Status>;
}

/// An open coordinator channel.
pub struct Connection {
    coordinator: Arc<dyn Coordinator>,
    token: CancelToken,
    handle: CancelHandle,
    address: String,
    config: ClientConfig,
    monitor: Option<Arc<dyn OperationMonitor>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Dials the coordinator named by `config`.
    ///
    /// Bounded by the caller's context and by `dial_timeout_ms`, whichever ends first.
    #[instrument(skip_all, fields(address = %config.coordinator_addr))]
    pub async fn dial(
        ctx: &Context,
        dialer: &dyn Dialer,
        config: &ClientConfig,
    ) -> Result<Self, MetainfoError> {
        let address = config.coordinator_addr.clone();
        let api_key = ApiKey::new(config.api_key.clone());
        let ctx = match config.dial_timeout() {
            Some(timeout) => ctx.clone().timeout(timeout),
            None => ctx.clone(),
        };

        let coordinator = match ctx.run(dialer.dial(&address, &api_key)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(status)) => return Err(MetainfoError::Dial { address, status }),
            Err(reason) => {
                let code = match reason {
                    CancelReason::DeadlineExceeded => StatusCode::DeadlineExceeded,
                    _ => StatusCode::Cancelled,
                };
                return Err(MetainfoError::Dial {
                    address,
                    status: Status::new(code, format!("dial abandoned: {reason}")),
                });
            }
        };

        let (token, handle) = new_cancel_pair();
        info!("connected to coordinator");
        Ok(Self {
            coordinator,
            token,
            handle,
            address,
            config: config.clone(),
            monitor: None,
        })
    }

    /// Reports every operation of clients created afterwards to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<dyn OperationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// A client sharing this connection. Cheap to create and to clone.
    pub fn client(&self) -> MetainfoClient {
        let client = MetainfoClient::new(self.coordinator.clone())
            .with_connection(self.token.clone())
            .with_request_timeout(self.config.request_timeout())
            .with_default_list_limit(self.config.default_list_limit);
        match &self.monitor {
            Some(monitor) => client.with_monitor(monitor.clone()),
            None => client,
        }
    }

    /// Coordinator address this connection was dialed to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Releases the connection. In-flight and later operations on its clients
    /// fail with `Cancelled(ConnectionClosed)`. Safe to call more than once.
    pub fn close(&self) {
        if self.handle.is_cancelled() {
            return;
        }
        self.handle.cancel(CancelReason::ConnectionClosed);
        info!(address = %self.address, "connection closed");
    }

    /// True once the connection has been released.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.handle.is_cancelled() {
            debug!(address = %self.address, "releasing connection on drop");
            self.handle.cancel(CancelReason::ConnectionClosed);
        }
    }
}
