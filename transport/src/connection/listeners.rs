use crate::error::{RumError, RumResult};
use crate::events::ConnectionListener;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const MAX_CONNECTION_LISTENERS: usize = 8;

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ListenerId(pub u32);

/// The instance-wide connection listeners that inbound connections are offered to, in
///  registration order
#[derive(Default)]
pub struct ConnectionListeners {
    inner: Mutex<ListenersInner>,
}

#[derive(Default)]
struct ListenersInner {
    next_id: u32,
    listeners: Vec<(ListenerId, Arc<dyn ConnectionListener>)>,
}

impl ConnectionListeners {
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) -> RumResult<ListenerId> {
        let mut inner = self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.listeners.len() >= MAX_CONNECTION_LISTENERS {
            return Err(RumError::InternalLimit(format!("at most {} connection listeners", MAX_CONNECTION_LISTENERS)));
        }
        let id = ListenerId(inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.listeners.push((id, listener));
        debug!("added connection listener {:?}", id);
        Ok(id)
    }

    /// Events already queued for the listener are still delivered since they hold their own
    ///  reference
    pub fn remove(&self, id: ListenerId) -> RumResult<()> {
        let mut inner = self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        if inner.listeners.len() == before {
            return Err(RumError::BadParameter(format!("connection listener {:?} is not registered", id)));
        }
        debug!("removed connection listener {:?}", id);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners.iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
