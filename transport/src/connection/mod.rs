//! Point-to-point connections between RUM instances. Streams of both engines ride on these
//!  connections; the [handler::ConnectionManager] establishes, supervises and tears them down.

pub mod connection;
pub mod handler;
pub mod listeners;

use crate::codec::connection_packet::MAX_CONNECT_MESSAGE_LEN;
use crate::events::{ConnectionEventType, ConnectionId, ConnectionListener};
use crate::connection::connection::Connection;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Where stream packets received on a connection go, i.e. the seam between the connection
///  layer and the transmitter / receiver engines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketRouter: Send + Sync + 'static {
    async fn on_stream_packet(&self, connection: &Arc<Connection>, packet: BytesMut);

    /// called after a connection was removed; `reason` is the connection event its owner
    ///  receives
    async fn on_connection_down(&self, connection_id: ConnectionId, reason: ConnectionEventType);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EstablishMethod {
    /// reuse an active connection to the same address and port if there is one
    UseExisting,
    CreateNew,
}

#[derive(Clone)]
pub struct EstablishParams {
    pub address: IpAddr,
    pub port: u16,
    pub method: EstablishMethod,
    /// `None` disables heartbeats on the connection
    pub heartbeat_timeout: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    pub one_way_heartbeat: bool,
    pub establish_timeout: Duration,
    pub connect_message: Option<Vec<u8>>,
    /// receives the establish outcome and all later events of the connection
    pub listener: Arc<dyn ConnectionListener>,
}

impl EstablishParams {
    pub fn new(address: IpAddr, port: u16, listener: Arc<dyn ConnectionListener>) -> EstablishParams {
        EstablishParams {
            address,
            port,
            method: EstablishMethod::CreateNew,
            heartbeat_timeout: Some(Duration::from_secs(10)),
            heartbeat_interval: Some(Duration::from_millis(1000)),
            one_way_heartbeat: false,
            establish_timeout: Duration::from_secs(10),
            connect_message: None,
            listener,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must not be 0");
        }
        if self.address.is_unspecified() {
            anyhow::bail!("address {} is not a valid connection target", self.address);
        }
        if let (Some(timeout), Some(interval)) = (self.heartbeat_timeout, self.heartbeat_interval) {
            if interval >= timeout {
                anyhow::bail!("heartbeat interval {:?} must be shorter than the heartbeat timeout {:?}", interval, timeout);
            }
        }
        if self.establish_timeout.is_zero() {
            anyhow::bail!("establish timeout must be positive");
        }
        if let Some(msg) = &self.connect_message {
            if msg.len() > MAX_CONNECT_MESSAGE_LEN {
                anyhow::bail!("connect message has {} bytes, maximum is {}", msg.len(), MAX_CONNECT_MESSAGE_LEN);
            }
        }
        Ok(())
    }
}
