//! Fixed-size slot container backing [`crate::ConnectionPool`].
//!
//! Slots live in a lock-free `ArrayQueue`. A semaphore counts the slots that
//! are resident in the queue so a take can wait for one, while a put never
//! waits: it either fits or hands the slot back.
//!
//! Invariant: available permits never exceed the number of queued slots. A put
//! pushes before adding its permit and a take forgets its permit before it
//! pops, so a take holding a permit always finds a slot.

use crossbeam::queue::ArrayQueue;
use tokio::sync::Semaphore;

/// One unit of tracked capacity.
#[derive(Debug)]
pub enum Slot<C> {
    /// Capacity is reserved but no connection has been made for it yet.
    Empty,
    Occupied(C),
}

impl<C> Slot<C> {
    pub fn into_inner(self) -> Option<C> {
        match self {
            Slot::Empty => None,
            Slot::Occupied(conn) => Some(conn),
        }
    }
}

pub struct Slots<C> {
    queue: ArrayQueue<Slot<C>>,
    resident: Semaphore,
}

impl<C> Slots<C> {
    /// A container holding `capacity` empty slots. `capacity` must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(Slot::Empty);
        }

        Self {
            queue,
            resident: Semaphore::new(capacity),
        }
    }

    /// Wait until a slot is resident and take it.
    pub async fn take(&self) -> Slot<C> {
        match self.resident.acquire().await {
            Ok(permit) => permit.forget(),
            // Never closed while `self` is alive.
            Err(_) => return Slot::Empty,
        }
        self.queue.pop().unwrap_or(Slot::Empty)
    }

    /// Take a slot if one is resident right now.
    pub fn try_take(&self) -> Option<Slot<C>> {
        self.resident.try_acquire().ok()?.forget();
        Some(self.queue.pop().unwrap_or(Slot::Empty))
    }

    /// Put a slot back without waiting. Returns it if the container is full.
    pub fn put(&self, slot: Slot<C>) -> Result<(), Slot<C>> {
        self.queue.push(slot)?;
        self.resident.add_permits(1);
        Ok(())
    }

    /// Number of slots currently resident.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
