use crate::seq::Sqn;
use crate::safe_converter::SafeCast;
use std::collections::VecDeque;

/// A window of slots that is directly addressable by sequence number, starting at a base
///  sequence number. This is the sorted-by-sequence queue for both the transmit history and
///  the receive window: lookup, insert and removal by sequence number are O(1), and the window
///  is advanced from the front.
///
/// Slots may be empty (`None`), e.g. for sequence numbers that are missing on the receiver side.
#[derive(Debug)]
pub struct SeqWindow<T> {
    base: Sqn,
    slots: VecDeque<Option<T>>,
}

impl<T> SeqWindow<T> {
    pub fn new(base: Sqn) -> SeqWindow<T> {
        SeqWindow {
            base,
            slots: VecDeque::new(),
        }
    }

    /// the lowest sequence number covered by the window
    pub fn base(&self) -> Sqn {
        self.base
    }

    /// the sequence number *after* the highest slot
    pub fn end(&self) -> Sqn {
        self.base + self.slots.len() as u32
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// number of occupied slots
    pub fn num_present(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn index_of(&self, sqn: Sqn) -> Option<usize> {
        if sqn.is_before(self.base) {
            return None;
        }
        Some(self.base.distance_to(sqn).safe_cast())
    }

    pub fn get(&self, sqn: Sqn) -> Option<&T> {
        self.index_of(sqn)
            .and_then(|idx| self.slots.get(idx))
            .and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, sqn: Sqn) -> Option<&mut T> {
        self.index_of(sqn)
            .and_then(|idx| self.slots.get_mut(idx))
            .and_then(|slot| slot.as_mut())
    }

    pub fn contains(&self, sqn: Sqn) -> bool {
        self.get(sqn).is_some()
    }

    /// Stores a value, growing the window with empty slots as needed. Returns the previous value
    ///  of the slot, or the value itself as `Err` if the sequence number is below the window.
    pub fn insert(&mut self, sqn: Sqn, value: T) -> Result<Option<T>, T> {
        let idx = match self.index_of(sqn) {
            Some(idx) => idx,
            None => return Err(value),
        };

        while self.slots.len() <= idx {
            self.slots.push_back(None);
        }
        Ok(self.slots[idx].replace(value))
    }

    /// takes the value out of a slot, leaving the slot empty
    pub fn remove(&mut self, sqn: Sqn) -> Option<T> {
        let idx = self.index_of(sqn)?;
        self.slots.get_mut(idx)
            .and_then(|slot| slot.take())
    }

    /// the value at the base position, if present
    pub fn front(&self) -> Option<&T> {
        self.slots.front()
            .and_then(|slot| slot.as_ref())
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.slots.front_mut()
            .and_then(|slot| slot.as_mut())
    }

    /// Removes the base slot and advances the base by one. Returns `None` if the window is empty,
    ///  leaving the base unchanged.
    pub fn pop_front(&mut self) -> Option<(Sqn, Option<T>)> {
        let slot = self.slots.pop_front()?;
        let sqn = self.base;
        self.base += 1;
        Some((sqn, slot))
    }

    /// Moves the base to `new_base`, returning the values of all slots that drop out of the
    ///  window. `new_base` may be beyond the current end of the window. Moving the base
    ///  backwards is a no-op.
    pub fn advance_to(&mut self, new_base: Sqn) -> Vec<(Sqn, T)> {
        let mut result = Vec::new();
        while self.base.is_before(new_base) {
            match self.pop_front() {
                Some((sqn, Some(value))) => result.push((sqn, value)),
                Some((_, None)) => {}
                None => {
                    self.base = new_base;
                    break;
                }
            }
        }
        result
    }

    /// Drops all slots and restarts the window at `base`, returning the dropped values
    pub fn reset(&mut self, base: Sqn) -> Vec<(Sqn, T)> {
        let old_base = self.base;
        let result = self.slots.drain(..)
            .enumerate()
            .filter_map(|(idx, slot)| slot.map(|v| (old_base + idx as u32, v)))
            .collect();
        self.base = base;
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sqn, &T)> {
        let base = self.base;
        self.slots.iter()
            .enumerate()
            .filter_map(move |(idx, slot)| slot.as_ref().map(|v| (base + idx as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Sqn, &mut T)> {
        let base = self.base;
        self.slots.iter_mut()
            .enumerate()
            .filter_map(move |(idx, slot)| slot.as_mut().map(|v| (base + idx as u32, v)))
    }
}
