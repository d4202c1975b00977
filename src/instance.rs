use rum_transport::codec::packet_header::Gsi;
use rum_transport::config::{LogLevel, LogLevelCell, RumConfig};
use rum_transport::connection::handler::ConnectionManager;
use rum_transport::connection::listeners::ListenerId;
use rum_transport::connection::EstablishParams;
use rum_transport::dispatch::StreamDispatcher;
use rum_transport::error::{RumError, RumResult};
use rum_transport::events::{ConnectionId, ConnectionListener, EventAnnouncer};
use rum_transport::receiver::rx_stream::RxStreamStats;
use rum_transport::receiver::{Receiver, RxQueueHandle, RxQueueParams};
use rum_transport::transmitter::tx_stream::TxStreamStats;
use rum_transport::transmitter::{SubmitOptions, Transmitter, TxQueueParams, TxStreamHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

/// One RUM instance: a connection manager plus the engines its direction calls for, sharing
///  one event announcer
pub struct Instance {
    config: Arc<RumConfig>,
    instance_id: u32,
    log_level: LogLevelCell,
    announcer: Arc<EventAnnouncer>,
    connections: ConnectionManager,
    transmitter: Option<Arc<Transmitter>>,
    receiver: Option<Arc<Receiver>>,
    is_stopped: AtomicBool,
}

impl Instance {
    pub async fn start(config: RumConfig) -> RumResult<Instance> {
        config.validate()
            .map_err(|e| RumError::ConfigEntry(e.to_string()))?;
        let config = Arc::new(config);

        let instance_id = Uuid::new_v4().as_u128() as u32;
        let announcer = Arc::new(EventAnnouncer::start());

        let transmitter = config.direction.can_transmit()
            .then(|| Arc::new(Transmitter::start(config.clone(), instance_id, announcer.clone())));
        let receiver = config.direction.can_receive()
            .then(|| Arc::new(Receiver::start(config.clone(), announcer.clone())));

        let router = Arc::new(StreamDispatcher::new(transmitter.clone(), receiver.clone()));
        let connections = ConnectionManager::start(config.clone(), instance_id, announcer.clone(), router).await?;

        info!(msg_key = 5000, "instance {} ({:08x}) started on {:?} with direction {:?}", config.display_name(), instance_id, connections.local_addr(), config.direction);
        Ok(Instance {
            log_level: LogLevelCell::new(config.log_level),
            config,
            instance_id,
            announcer,
            connections,
            transmitter,
            receiver,
            is_stopped: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn config(&self) -> &RumConfig {
        &self.config
    }

    /// the address inbound connections are accepted on
    pub fn local_addr(&self) -> SocketAddr {
        self.connections.local_addr()
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.get()
    }

    pub fn change_log_level(&self, level: LogLevel) {
        info!(msg_key = 5001, "{}: log level changed from {:?} to {:?}", self.config.display_name(), self.log_level.get(), level);
        self.log_level.set(level);
    }

    fn check_running(&self) -> RumResult<()> {
        if self.is_stopped.load(Ordering::Acquire) {
            return Err(RumError::InstanceClosed);
        }
        Ok(())
    }

    fn transmitter(&self) -> RumResult<&Arc<Transmitter>> {
        self.check_running()?;
        self.transmitter.as_ref()
            .ok_or_else(|| RumError::BadParameter(format!("instance {} does not transmit", self.config.display_name())))
    }

    fn receiver(&self) -> RumResult<&Arc<Receiver>> {
        self.check_running()?;
        self.receiver.as_ref()
            .ok_or_else(|| RumError::BadParameter(format!("instance {} does not receive", self.config.display_name())))
    }

    pub fn establish_connection(&self, params: EstablishParams) -> RumResult<ConnectionId> {
        self.check_running()?;
        self.connections.establish(params)
    }

    pub async fn close_connection(&self, connection_id: ConnectionId) -> RumResult<()> {
        self.check_running()?;
        self.connections.close(connection_id).await
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> RumResult<ListenerId> {
        self.check_running()?;
        self.connections.add_listener(listener)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> RumResult<()> {
        self.check_running()?;
        self.connections.remove_listener(id)
    }

    pub fn create_tx_stream(&self, params: TxQueueParams, connection_id: ConnectionId) -> RumResult<TxStreamHandle> {
        let transmitter = self.transmitter()?;
        let connection = self.connections.connection(connection_id)
            .ok_or(RumError::ConnectionInvalid)?;
        transmitter.create_stream(params, connection)
    }

    pub async fn close_tx_stream(&self, handle: TxStreamHandle) -> RumResult<()> {
        self.transmitter()?.close_stream(handle).await
    }

    pub async fn submit(&self, handle: TxStreamHandle, message: &[u8], options: SubmitOptions) -> RumResult<u64> {
        let msg_sqn = self.transmitter()?.submit(handle, message, options).await?;
        if self.log_level.enabled(LogLevel::Xtrace) {
            trace!("{}: {:?} message {} submitted", self.config.display_name(), handle.gsi, msg_sqn);
        }
        Ok(msg_sqn)
    }

    pub fn tx_stream_stats(&self, handle: TxStreamHandle) -> RumResult<TxStreamStats> {
        self.transmitter()?.stats(handle)
    }

    pub fn create_rx_stream(&self, params: RxQueueParams) -> RumResult<RxQueueHandle> {
        self.receiver()?.create_queue(params)
    }

    pub fn close_rx_stream(&self, handle: RxQueueHandle) -> RumResult<()> {
        self.receiver()?.close_queue(handle)
    }

    pub fn remove_stream(&self, gsi: Gsi) -> RumResult<()> {
        self.receiver()?.remove_stream(gsi)
    }

    pub fn clear_rejected_streams(&self) -> RumResult<()> {
        self.receiver()?.clear_rejected_streams()
    }

    pub fn rx_stream_stats(&self, gsi: Gsi) -> RumResult<RxStreamStats> {
        self.receiver()?.stats(gsi)
    }

    /// Stops all engines, each bounded by `stop_timeout`. Teardown goes on when an engine does
    ///  not stop in time, and the engines that did not are reported in the error.
    pub async fn stop(&self) -> RumResult<()> {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return Err(RumError::InstanceClosed);
        }
        let max_wait = self.config.advanced.stop_timeout;
        info!(msg_key = 5002, "stopping instance {}", self.config.display_name());

        let mut timed_out = Vec::new();
        if let Some(transmitter) = &self.transmitter {
            if !transmitter.stop(max_wait).await {
                timed_out.push("transmitter");
            }
        }
        if !self.connections.stop(max_wait).await {
            timed_out.push("connection handler");
        }
        if let Some(receiver) = &self.receiver {
            if !receiver.stop(max_wait).await {
                timed_out.push("receiver");
            }
        }
        if !self.announcer.stop(max_wait).await {
            timed_out.push("event announcer");
        }

        if timed_out.is_empty() {
            info!(msg_key = 5003, "instance {} stopped", self.config.display_name());
            Ok(())
        }
        else {
            let engines = timed_out.join(", ");
            error!(msg_key = 1003, "instance {}: {} did not stop in time", self.config.display_name(), engines);
            Err(RumError::StopTimeout(engines))
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if !self.is_stopped.load(Ordering::Acquire) {
            warn!("instance {} dropped without being stopped", self.config.display_name());
        }
    }
}
