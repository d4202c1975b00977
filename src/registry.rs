use rum_transport::error::{RumError, RumResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const MAX_INSTANCES: usize = 100;

/// Refers to an instance in an [InstanceRegistry]. The generation keeps a handle invalid after
///  its instance was removed, even when the slot is reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct InstanceHandle {
    slot: usize,
    generation: u64,
}

struct Slot<T> {
    generation: u64,
    value: Arc<T>,
}

/// Fixed capacity table of live instances
pub struct InstanceRegistry<T> {
    capacity: usize,
    inner: Mutex<RegistryInner<T>>,
}

struct RegistryInner<T> {
    slots: Vec<Option<Slot<T>>>,
    next_generation: u64,
}

impl<T> InstanceRegistry<T> {
    pub fn new(capacity: usize) -> InstanceRegistry<T> {
        InstanceRegistry {
            capacity,
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                next_generation: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_room(&self) -> bool {
        self.len() < self.capacity
    }

    pub fn insert(&self, value: Arc<T>) -> RumResult<InstanceHandle> {
        let mut inner = self.lock();
        let generation = inner.next_generation;

        let slot = match inner.slots.iter().position(|s| s.is_none()) {
            Some(free) => free,
            None if inner.slots.len() < self.capacity => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
            None => return Err(RumError::TooManyInstances(self.capacity)),
        };

        inner.next_generation += 1;
        inner.slots[slot] = Some(Slot { generation, value });
        debug!("registered instance in slot {} with generation {}", slot, generation);
        Ok(InstanceHandle { slot, generation })
    }

    pub fn get(&self, handle: InstanceHandle) -> RumResult<Arc<T>> {
        match self.lock().slots.get(handle.slot) {
            Some(Some(slot)) if slot.generation == handle.generation => Ok(slot.value.clone()),
            _ => Err(RumError::InstanceInvalid),
        }
    }

    pub fn remove(&self, handle: InstanceHandle) -> RumResult<Arc<T>> {
        let mut inner = self.lock();
        let slot = inner.slots.get_mut(handle.slot)
            .ok_or(RumError::InstanceInvalid)?;
        if slot.as_ref().map(|s| s.generation) != Some(handle.generation) {
            return Err(RumError::InstanceInvalid);
        }
        slot.take()
            .map(|s| s.value)
            .ok_or(RumError::InstanceInvalid)
    }
}
