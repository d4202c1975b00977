use crate::codec::packet_header::Gsi;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Stream level events, with the numeric codes RUM applications know. Codes 3 (version
///  conflict), 8 (stream not present) and 23 (repair delay) are reserved and never raised.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EventType {
    PacketLoss = 1,
    HeartbeatTimeout = 2,
    /// the queue's reliability differs from the transmitter's
    Reliability = 4,
    ClosedTransmitter = 5,
    StreamError = 6,
    StreamBroke = 7,
    NewSourceFailed = 9,
    NewSource = 10,
    /// buffered data was given up to free receive memory
    ReceiveQueueTrimmed = 11,
    FirstMessage = 20,
    LateJoinFailure = 21,
    MessageLoss = 22,
    MemoryAlertOn = 24,
    MemoryAlertOff = 25,
    ReliabilityChanged = 26,
}

impl EventType {
    /// What streams riding on a connection see when it is removed for `reason`
    pub fn for_connection_down(reason: ConnectionEventType) -> EventType {
        match reason {
            ConnectionEventType::ConnectionHeartbeatTimeout => EventType::HeartbeatTimeout,
            _ => EventType::StreamBroke,
        }
    }
}

/// Connection events. Code 53 (establish in process) is reserved and never raised.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ConnectionEventType {
    EstablishSuccess = 50,
    EstablishFailure = 51,
    EstablishTimeout = 52,
    NewConnection = 60,
    ConnectionReady = 61,
    ConnectionHeartbeatTimeout = 62,
    ConnectionBroke = 63,
    ConnectionClosed = 64,
}

/// Identifies a connection within an instance
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub gsi: Option<Gsi>,
    pub queue_name: Option<String>,
    pub connection_id: Option<ConnectionId>,
    /// number of lost packets or messages for loss events
    pub lost: u32,
    pub details: String,
}

impl StreamEvent {
    pub fn new(event_type: EventType) -> StreamEvent {
        StreamEvent {
            event_type,
            gsi: None,
            queue_name: None,
            connection_id: None,
            lost: 0,
            details: String::new(),
        }
    }

    pub fn with_gsi(mut self, gsi: Gsi) -> StreamEvent {
        self.gsi = Some(gsi);
        self
    }

    pub fn with_queue_name(mut self, queue_name: &str) -> StreamEvent {
        self.queue_name = Some(queue_name.to_string());
        self
    }

    pub fn with_connection(mut self, connection_id: ConnectionId) -> StreamEvent {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_lost(mut self, lost: u32) -> StreamEvent {
        self.lost = lost;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> StreamEvent {
        self.details = details.into();
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub remote_instance_id: Option<u32>,
    pub is_inbound: bool,
    pub connect_message: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionEvent {
    pub event_type: ConnectionEventType,
    pub connection: ConnectionInfo,
    pub details: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionVerdict {
    Accept,
    Reject,
}

/// Application callback for connection events. For [ConnectionEventType::NewConnection] the
///  verdict decides whether this listener takes ownership of the inbound connection; it is
///  ignored for all other events.
#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connection_event(&self, event: &ConnectionEvent) -> ConnectionVerdict;
}

#[cfg_attr(test, automock)]
pub trait StreamEventHandler: Send + Sync + 'static {
    fn on_event(&self, event: &StreamEvent);
}

enum Announcement {
    Stream {
        handler: Arc<dyn StreamEventHandler>,
        event: StreamEvent,
    },
    Connection {
        listener: Arc<dyn ConnectionListener>,
        event: ConnectionEvent,
    },
    Offer {
        listeners: Vec<Arc<dyn ConnectionListener>>,
        event: ConnectionEvent,
        owner: oneshot::Sender<Option<Arc<dyn ConnectionListener>>>,
    },
    Shutdown,
}

/// Serializes all application callbacks of an instance on a single task, so callbacks never
///  run concurrently and never run while engine locks are held.
///
/// Listeners are held by `Arc` in queued announcements, so removing a listener while an event
///  for it is in flight is safe.
pub struct EventAnnouncer {
    sender: mpsc::UnboundedSender<Announcement>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EventAnnouncer {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_handle().take() {
            handle.abort();
        }
    }
}

impl EventAnnouncer {
    pub fn start() -> EventAnnouncer {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventAnnouncer {
            sender,
            handle: Mutex::new(Some(tokio::spawn(Self::do_loop(receiver)))),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn announce_stream_event(&self, handler: &Arc<dyn StreamEventHandler>, event: StreamEvent) {
        trace!("queueing stream event {:?}", event.event_type);
        if self.sender.send(Announcement::Stream { handler: handler.clone(), event }).is_err() {
            debug!("event announcer stopped - dropping stream event");
        }
    }

    pub fn announce_connection_event(&self, listener: &Arc<dyn ConnectionListener>, event: ConnectionEvent) {
        trace!("queueing connection event {:?} for {:?}", event.event_type, event.connection.connection_id);
        if self.sender.send(Announcement::Connection { listener: listener.clone(), event }).is_err() {
            debug!("event announcer stopped - dropping connection event");
        }
    }

    /// Offers an inbound connection to `listeners` in order. The returned receiver yields the
    ///  first listener that accepted, or `None` if all rejected.
    pub fn offer_connection(&self, listeners: Vec<Arc<dyn ConnectionListener>>, event: ConnectionEvent) -> oneshot::Receiver<Option<Arc<dyn ConnectionListener>>> {
        let (owner, result) = oneshot::channel();
        if let Err(mpsc::error::SendError(Announcement::Offer { owner, .. })) = self.sender.send(Announcement::Offer { listeners, event, owner }) {
            let _ = owner.send(None);
        }
        result
    }

    /// Processes all announcements queued so far, then terminates the announcer task
    pub async fn stop(&self, max_wait: Duration) -> bool {
        let handle = match self.lock_handle().take() {
            Some(handle) => handle,
            None => return true,
        };
        let _ = self.sender.send(Announcement::Shutdown);

        match timeout(max_wait, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("event announcer did not drain within {:?}", max_wait);
                false
            }
        }
    }

    async fn do_loop(mut receiver: mpsc::UnboundedReceiver<Announcement>) {
        while let Some(announcement) = receiver.recv().await {
            match announcement {
                Announcement::Stream { handler, event } => {
                    handler.on_event(&event);
                }
                Announcement::Connection { listener, event } => {
                    let _ = listener.on_connection_event(&event);
                }
                Announcement::Offer { listeners, event, owner } => {
                    let accepted = listeners.into_iter()
                        .find(|l| l.on_connection_event(&event) == ConnectionVerdict::Accept);
                    if owner.send(accepted).is_err() {
                        debug!("connection offer was abandoned");
                    }
                }
                Announcement::Shutdown => break,
            }
        }
        debug!("event announcer terminated");
    }
}
