use crate::error::BufferError;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Keys already taken, kept as one contiguous run plus the stragglers
/// taken out of order
///
/// Keys are taken roughly in ascending order, so the run absorbs almost
/// every key and `scattered` only holds those ahead of (or behind) a gap.
#[derive(Debug, Default)]
struct ConsumedKeys {
    run: Option<(usize, usize)>,
    scattered: BTreeSet<usize>,
}

impl ConsumedKeys {
    fn contains(&self, key: usize) -> bool {
        matches!(self.run, Some((start, end)) if (start..end).contains(&key))
            || self.scattered.contains(&key)
    }

    fn insert(&mut self, key: usize) {
        let (mut start, mut end) = match self.run {
            None => (key, key + 1),
            Some((start, end)) if key == end => (start, end + 1),
            Some((start, end)) if key + 1 == start => (key, end),
            Some(_) => {
                self.scattered.insert(key);
                return;
            }
        };

        while self.scattered.remove(&end) {
            end += 1;
        }
        while start > 0 && self.scattered.remove(&(start - 1)) {
            start -= 1;
        }
        self.run = Some((start, end));
    }
}

struct BufferState<V> {
    entries: HashMap<usize, V>,
    consumed: ConsumedKeys,
    closed: bool,
}

/// Integer-keyed handoff store shared between pipeline stages
///
/// Every key is published once by its producer and taken once by its
/// consumer. Waiters block on a condition variable instead of polling, and
/// `close` wakes all of them so a failure anywhere unblocks every stage.
///
/// With a capacity set, `publish` blocks while the buffer is full.
pub struct KeyedBuffer<V> {
    state: Mutex<BufferState<V>>,
    changed: Condvar,
    capacity: Option<usize>,
}

impl<V> KeyedBuffer<V> {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                entries: HashMap::new(),
                consumed: ConsumedKeys::default(),
                closed: false,
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    // Each operation leaves the state consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BufferState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, key: usize, value: V) -> Result<(), BufferError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(BufferError::Closed);
            }
            if state.entries.contains_key(&key) || state.consumed.contains(key) {
                return Err(BufferError::Duplicate(key));
            }
            match self.capacity {
                Some(capacity) if state.entries.len() >= capacity => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                _ => break,
            }
        }

        state.entries.insert(key, value);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Block until `key` is present, the buffer closes, or `timeout` elapses
    pub fn wait_for(&self, key: usize, timeout: Duration) -> Result<(), BufferError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(BufferError::Closed);
            }
            if state.entries.contains_key(&key) {
                return Ok(());
            }
            if state.consumed.contains(key) {
                return Err(BufferError::Evicted(key));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BufferError::TimedOut {
                    key,
                    waited: now - started,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Remove `key` without blocking
    pub fn take(&self, key: usize) -> Result<V, BufferError> {
        let mut state = self.lock();
        let value = match state.entries.remove(&key) {
            Some(value) => value,
            None if state.consumed.contains(key) => return Err(BufferError::Evicted(key)),
            None => return Err(BufferError::NotYetProduced(key)),
        };
        state.consumed.insert(key);
        drop(state);
        self.changed.notify_all();
        Ok(value)
    }

    pub fn wait_take(&self, key: usize, timeout: Duration) -> Result<V, BufferError> {
        self.wait_for(key, timeout)?;
        self.take(key)
    }

    /// Wake every waiter and publisher; all later operations fail with `Closed`
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, key: usize) -> bool {
        self.lock().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for KeyedBuffer<V> {
    fn default() -> Self {
        Self::new()
    }
}
