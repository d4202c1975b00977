//! RUM: reliable multicast messaging over point-to-point connections.
//!
//! [Rum] is the application's entry point. It manages up to [registry::MAX_INSTANCES]
//!  instances, each with its own listening port, connections, transmit streams and receive
//!  queues. Instances are referred to by [InstanceHandle]; every operation checks the handle
//!  first and fails with [RumError::InstanceInvalid] for an instance that was stopped.
//!
//! The protocol and its engines live in the `rum-transport` crate; see its documentation for
//!  the wire format.

pub mod instance;
pub mod registry;

pub use registry::InstanceHandle;
pub use rum_transport::codec::message_record::{MessageProperty, PropertyValue};
pub use rum_transport::codec::options::Reliability;
pub use rum_transport::codec::packet_header::Gsi;
pub use rum_transport::config::{AdvancedConfig, Direction, LogLevel, RateLimit, RumConfig};
pub use rum_transport::connection::listeners::ListenerId;
pub use rum_transport::connection::{EstablishMethod, EstablishParams};
pub use rum_transport::error::{ErrorKind, RumError, RumResult};
pub use rum_transport::events::{ConnectionEvent, ConnectionEventType, ConnectionId, ConnectionInfo, ConnectionListener, ConnectionVerdict, EventType, StreamEvent, StreamEventHandler};
pub use rum_transport::receiver::rx_stream::{RxMessage, RxPacket, RxStreamStats};
pub use rum_transport::receiver::{DeliveryHandler, MessageHandler, NewStreamInfo, PacketHandler, RxQueueHandle, RxQueueParams, StreamAcceptor};
pub use rum_transport::transmitter::tx_stream::TxStreamStats;
pub use rum_transport::transmitter::{SubmitOptions, TxQueueParams, TxStreamHandle};

use crate::instance::Instance;
use crate::registry::{InstanceRegistry, MAX_INSTANCES};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

pub struct Rum {
    instances: InstanceRegistry<Instance>,
}

impl Default for Rum {
    fn default() -> Self {
        Rum::new()
    }
}

impl Rum {
    pub fn new() -> Rum {
        Self::with_max_instances(MAX_INSTANCES)
    }

    pub fn with_max_instances(max_instances: usize) -> Rum {
        Rum {
            instances: InstanceRegistry::new(max_instances),
        }
    }

    fn instance(&self, handle: InstanceHandle) -> RumResult<Arc<Instance>> {
        self.instances.get(handle)
    }

    /// Validates the configuration and starts an instance
    pub async fn init(&self, config: RumConfig) -> RumResult<InstanceHandle> {
        if !self.instances.has_room() {
            return Err(RumError::TooManyInstances(self.instances.capacity()));
        }

        let instance = Arc::new(Instance::start(config).await?);
        match self.instances.insert(instance.clone()) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // another instance took the last slot while this one was starting
                if let Err(stop_error) = instance.stop().await {
                    warn!("stopping surplus instance failed: {}", stop_error);
                }
                Err(e)
            }
        }
    }

    /// Stops an instance. Its handle is invalid afterwards, even if stopping reports an engine
    ///  that did not stop in time.
    pub async fn stop(&self, handle: InstanceHandle) -> RumResult<()> {
        let instance = self.instances.remove(handle)?;
        instance.stop().await
    }

    pub fn local_addr(&self, handle: InstanceHandle) -> RumResult<SocketAddr> {
        Ok(self.instance(handle)?.local_addr())
    }

    pub fn establish_connection(&self, handle: InstanceHandle, params: EstablishParams) -> RumResult<ConnectionId> {
        self.instance(handle)?.establish_connection(params)
    }

    pub async fn close_connection(&self, handle: InstanceHandle, connection_id: ConnectionId) -> RumResult<()> {
        self.instance(handle)?.close_connection(connection_id).await
    }

    pub fn add_connection_listener(&self, handle: InstanceHandle, listener: Arc<dyn ConnectionListener>) -> RumResult<ListenerId> {
        self.instance(handle)?.add_connection_listener(listener)
    }

    pub fn remove_connection_listener(&self, handle: InstanceHandle, listener_id: ListenerId) -> RumResult<()> {
        self.instance(handle)?.remove_connection_listener(listener_id)
    }

    pub fn create_tx_stream(&self, handle: InstanceHandle, params: TxQueueParams, connection_id: ConnectionId) -> RumResult<TxStreamHandle> {
        self.instance(handle)?.create_tx_stream(params, connection_id)
    }

    pub async fn close_tx_stream(&self, handle: InstanceHandle, stream: TxStreamHandle) -> RumResult<()> {
        self.instance(handle)?.close_tx_stream(stream).await
    }

    /// Submits a message on a transmit stream, returning its message sequence number
    pub async fn submit(&self, handle: InstanceHandle, stream: TxStreamHandle, message: &[u8], options: SubmitOptions) -> RumResult<u64> {
        self.instance(handle)?.submit(stream, message, options).await
    }

    pub fn tx_stream_stats(&self, handle: InstanceHandle, stream: TxStreamHandle) -> RumResult<TxStreamStats> {
        self.instance(handle)?.tx_stream_stats(stream)
    }

    pub fn create_rx_stream(&self, handle: InstanceHandle, params: RxQueueParams) -> RumResult<RxQueueHandle> {
        self.instance(handle)?.create_rx_stream(params)
    }

    pub fn close_rx_stream(&self, handle: InstanceHandle, queue: RxQueueHandle) -> RumResult<()> {
        self.instance(handle)?.close_rx_stream(queue)
    }

    /// Rejects a receive stream; its packets are ignored until [Rum::clear_rejected_streams]
    pub fn remove_stream(&self, handle: InstanceHandle, gsi: Gsi) -> RumResult<()> {
        self.instance(handle)?.remove_stream(gsi)
    }

    pub fn clear_rejected_streams(&self, handle: InstanceHandle) -> RumResult<()> {
        self.instance(handle)?.clear_rejected_streams()
    }

    pub fn rx_stream_stats(&self, handle: InstanceHandle, gsi: Gsi) -> RumResult<RxStreamStats> {
        self.instance(handle)?.rx_stream_stats(gsi)
    }

    pub fn change_log_level(&self, handle: InstanceHandle, level: LogLevel) -> RumResult<()> {
        self.instance(handle)?.change_log_level(level);
        Ok(())
    }

    pub fn log_level(&self, handle: InstanceHandle) -> RumResult<LogLevel> {
        Ok(self.instance(handle)?.log_level())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }

    struct ChannelListener {
        verdict: ConnectionVerdict,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    }

    impl ConnectionListener for ChannelListener {
        fn on_connection_event(&self, event: &ConnectionEvent) -> ConnectionVerdict {
            let _ = self.events.send(event.clone());
            self.verdict
        }
    }

    fn channel_listener() -> (Arc<dyn ConnectionListener>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelListener { verdict: ConnectionVerdict::Accept, events }), receiver)
    }

    struct ChannelHandler {
        messages: mpsc::UnboundedSender<Bytes>,
        events: mpsc::UnboundedSender<EventType>,
    }

    impl MessageHandler for ChannelHandler {
        fn on_message(&self, message: &RxMessage) {
            let _ = self.messages.send(message.data.clone());
        }
    }

    impl StreamEventHandler for ChannelHandler {
        fn on_event(&self, event: &StreamEvent) {
            let _ = self.events.send(event.event_type);
        }
    }

    fn channel_handler() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<Bytes>, mpsc::UnboundedReceiver<EventType>) {
        let (messages, message_receiver) = mpsc::unbounded_channel();
        let (events, event_receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelHandler { messages, events }), message_receiver, event_receiver)
    }

    fn config(direction: Direction) -> RumConfig {
        let mut config = RumConfig::default_ipv4();
        config.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.server_port = 0;
        config.max_memory_bytes = 16 * 1024 * 1024;
        config.direction = direction;
        config
    }

    async fn next<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), receiver.recv()).await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_messages_end_to_end() {
        let rum = Rum::new();
        let receiving = rum.init(config(Direction::RxOnly)).await.unwrap();
        let transmitting = rum.init(config(Direction::TxOnly)).await.unwrap();

        let (acceptor, mut acceptor_events) = channel_listener();
        rum.add_connection_listener(receiving, acceptor).unwrap();

        let (handler, mut messages, mut stream_events) = channel_handler();
        let params = RxQueueParams::new("prices", DeliveryHandler::Messages(handler.clone()), handler.clone());
        rum.create_rx_stream(receiving, params).unwrap();

        let (initiator, mut initiator_events) = channel_listener();
        let port = rum.local_addr(receiving).unwrap().port();
        let connection_id = rum.establish_connection(transmitting, EstablishParams::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, initiator)).unwrap();
        assert_eq!(next(&mut initiator_events).await.event_type, ConnectionEventType::EstablishSuccess);
        assert_eq!(next(&mut acceptor_events).await.event_type, ConnectionEventType::NewConnection);

        let (tx_events, _, _) = channel_handler();
        let stream = rum.create_tx_stream(transmitting, TxQueueParams::new("prices", tx_events), connection_id).unwrap();
        for msg in ["a", "bb", "ccc"] {
            let options = SubmitOptions { dont_batch: true, ..Default::default() };
            rum.submit(transmitting, stream, msg.as_bytes(), options).await.unwrap();
        }

        assert_eq!(next(&mut messages).await, Bytes::from_static(b"a"));
        assert_eq!(next(&mut messages).await, Bytes::from_static(b"bb"));
        assert_eq!(next(&mut messages).await, Bytes::from_static(b"ccc"));
        assert_eq!(next(&mut stream_events).await, EventType::NewSource);
        assert_eq!(next(&mut stream_events).await, EventType::FirstMessage);

        let stats = rum.rx_stream_stats(receiving, stream.gsi).unwrap();
        assert_eq!(stats.messages_delivered, 3);
        assert_eq!(stats.lost_packets, 0);

        rum.close_tx_stream(transmitting, stream).await.unwrap();
        rum.stop(transmitting).await.unwrap();
        rum.stop(receiving).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_instance_is_invalid() {
        let rum = Rum::new();
        let handle = rum.init(config(Direction::TxRx)).await.unwrap();
        rum.change_log_level(handle, LogLevel::Trace).unwrap();
        assert_eq!(rum.log_level(handle).unwrap(), LogLevel::Trace);

        rum.stop(handle).await.unwrap();
        assert!(matches!(rum.stop(handle).await, Err(RumError::InstanceInvalid)));
        assert!(matches!(rum.clear_rejected_streams(handle), Err(RumError::InstanceInvalid)));
        assert!(matches!(rum.change_log_level(handle, LogLevel::Info), Err(RumError::InstanceInvalid)));
    }

    #[tokio::test]
    async fn test_too_many_instances() {
        let rum = Rum::with_max_instances(1);
        let first = rum.init(config(Direction::TxRx)).await.unwrap();
        assert!(matches!(rum.init(config(Direction::TxRx)).await, Err(RumError::TooManyInstances(1))));

        rum.stop(first).await.unwrap();
        let second = rum.init(config(Direction::TxRx)).await.unwrap();
        rum.stop(second).await.unwrap();
    }

    #[rstest]
    #[case::packet_size_too_small(|c: &mut RumConfig| c.packet_size = 100)]
    #[case::memory_too_small(|c: &mut RumConfig| c.max_memory_bytes = 1000)]
    #[case::bad_alert_marks(|c: &mut RumConfig| { c.advanced.memory_alert_pct_hi = 50; c.advanced.memory_alert_pct_lo = 60; })]
    fn test_bad_config(#[case] f: fn(&mut RumConfig)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut config = config(Direction::TxRx);
            f(&mut config);
            let rum = Rum::new();
            assert!(matches!(rum.init(config).await, Err(RumError::ConfigEntry(_))));
        });
    }

    #[tokio::test]
    async fn test_direction_checks() {
        let rum = Rum::new();
        let tx_only = rum.init(config(Direction::TxOnly)).await.unwrap();
        let rx_only = rum.init(config(Direction::RxOnly)).await.unwrap();

        let (handler, _, _) = channel_handler();
        let params = RxQueueParams::new("q", DeliveryHandler::Messages(handler.clone()), handler.clone());
        assert!(matches!(rum.create_rx_stream(tx_only, params), Err(RumError::BadParameter(_))));
        assert!(matches!(rum.remove_stream(tx_only, Gsi::new(1, 1)), Err(RumError::BadParameter(_))));

        let params = TxQueueParams::new("q", handler);
        assert!(matches!(rum.create_tx_stream(rx_only, params, ConnectionId(1)), Err(RumError::BadParameter(_))));

        rum.stop(tx_only).await.unwrap();
        rum.stop(rx_only).await.unwrap();
    }

    #[tokio::test]
    async fn test_tx_stream_needs_connection() {
        let rum = Rum::new();
        let handle = rum.init(config(Direction::TxRx)).await.unwrap();
        let (handler, _, _) = channel_handler();
        let result = rum.create_tx_stream(handle, TxQueueParams::new("q", handler), ConnectionId(42));
        assert!(matches!(result, Err(RumError::ConnectionInvalid)));
        rum.stop(handle).await.unwrap();
    }
}
