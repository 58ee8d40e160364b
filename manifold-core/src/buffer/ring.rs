//! Ring-backed message buffer.
//!
//! Slots circulate between two lock-free queues: `published` (filled,
//! waiting for the consumer) and `free` (recycled, waiting for a
//! producer). Claim and publish are plain queue pops and pushes, so the
//! selector-thread side never takes a lock. The blocking paths spin a
//! short while and then park on a condition variable.
//!
//! Capacity is rounded up to the next power of two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::buffer::{fire, MessageConsumer, MessageProducer, QueueClosed, Wakeup};
use crate::payload::Payload;

const SPIN_LIMIT: u32 = 64;
const PARK_INTERVAL: Duration = Duration::from_millis(50);

struct RingShared {
    published: ArrayQueue<Payload>,
    free: ArrayQueue<Payload>,
    closed: AtomicBool,
    space_lock: Mutex<()>,
    space_cond: Condvar,
    data_lock: Mutex<()>,
    data_cond: Condvar,
    /// Fired on the full -> non-full edge (a slot was recycled).
    space_wakeup: Mutex<Vec<Wakeup>>,
    /// Fired on the empty -> non-empty edge (a slot was published).
    data_wakeup: Mutex<Vec<Wakeup>>,
}

impl RingShared {
    fn notify_space(&self) {
        // Taking the lock pairs the notification with a waiter that is
        // between its emptiness check and the wait.
        drop(self.space_lock.lock());
        self.space_cond.notify_all();
    }

    fn notify_data(&self) {
        drop(self.data_lock.lock());
        self.data_cond.notify_all();
    }

    fn recycle(&self, slot: Payload) {
        let was_starved = self.free.is_empty();
        if self.free.push(slot).is_err() {
            unreachable!("ring capacity invariant: free queue overflow");
        }
        self.notify_space();
        if was_starved {
            fire(&self.space_wakeup);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify_space();
        self.notify_data();
        fire(&self.space_wakeup);
        fire(&self.data_wakeup);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Producer handle for a ring buffer.
pub struct RingProducer {
    shared: Arc<RingShared>,
    current: Option<Payload>,
}

/// Consumer handle for a ring buffer.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    current: Option<Payload>,
}

/// Build a ring buffer of `capacity` slots (rounded up to a power of
/// two), each able to hold `slot_capacity` bytes.
#[must_use]
pub fn ring_buffer(capacity: usize, slot_capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be positive");
    let capacity = capacity.next_power_of_two();

    let shared = Arc::new(RingShared {
        published: ArrayQueue::new(capacity),
        free: ArrayQueue::new(capacity),
        closed: AtomicBool::new(false),
        space_lock: Mutex::new(()),
        space_cond: Condvar::new(),
        data_lock: Mutex::new(()),
        data_cond: Condvar::new(),
        space_wakeup: Mutex::new(Vec::new()),
        data_wakeup: Mutex::new(Vec::new()),
    });
    for _ in 0..capacity {
        if shared.free.push(Payload::with_capacity(slot_capacity)).is_err() {
            unreachable!("ring capacity invariant: seeding overflow");
        }
    }

    (
        RingProducer {
            shared: Arc::clone(&shared),
            current: None,
        },
        RingConsumer {
            shared,
            current: None,
        },
    )
}

impl MessageProducer for RingProducer {
    fn claim(&mut self) -> Result<&mut Payload, QueueClosed> {
        loop {
            if self.try_claim()?.is_some() {
                return Ok(self.current.as_mut().expect("slot claimed above"));
            }
            let mut spins = 0;
            while self.shared.free.is_empty() && !self.shared.is_closed() {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    std::hint::spin_loop();
                    continue;
                }
                let mut guard = self.shared.space_lock.lock();
                if self.shared.free.is_empty() && !self.shared.is_closed() {
                    self.shared
                        .space_cond
                        .wait_for(&mut guard, PARK_INTERVAL);
                }
            }
            if self.shared.is_closed() {
                return Err(QueueClosed);
            }
        }
    }

    fn try_claim(&mut self) -> Result<Option<&mut Payload>, QueueClosed> {
        if self.shared.is_closed() {
            return Err(QueueClosed);
        }
        if self.current.is_none() {
            match self.shared.free.pop() {
                Some(mut slot) => {
                    slot.clear();
                    self.current = Some(slot);
                }
                None => return Ok(None),
            }
        }
        Ok(self.current.as_mut())
    }

    fn publish(&mut self) {
        let slot = self
            .current
            .take()
            .expect("publish() without a claimed slot");
        let was_empty = self.shared.published.is_empty();
        if self.shared.published.push(slot).is_err() {
            unreachable!("ring capacity invariant: published queue overflow");
        }
        self.shared.notify_data();
        if was_empty {
            fire(&self.shared.data_wakeup);
        }
    }

    fn attach_wakeup(&mut self, wakeup: Wakeup) {
        self.shared.space_wakeup.lock().push(wakeup);
    }

    fn close(&self) {
        self.shared.close();
    }

    fn clone_producer(&self) -> Box<dyn MessageProducer> {
        Box::new(RingProducer {
            shared: Arc::clone(&self.shared),
            current: None,
        })
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        if let Some(slot) = self.current.take() {
            self.shared.recycle(slot);
        }
    }
}

impl MessageConsumer for RingConsumer {
    fn acquire(&mut self) -> Result<&mut Payload, QueueClosed> {
        loop {
            if self.try_acquire()?.is_some() {
                return Ok(self.current.as_mut().expect("slot acquired above"));
            }
            let mut spins = 0;
            while self.shared.published.is_empty() && !self.shared.is_closed() {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    std::hint::spin_loop();
                    continue;
                }
                let mut guard = self.shared.data_lock.lock();
                if self.shared.published.is_empty() && !self.shared.is_closed() {
                    self.shared.data_cond.wait_for(&mut guard, PARK_INTERVAL);
                }
            }
            if self.shared.published.is_empty() && self.shared.is_closed() {
                return Err(QueueClosed);
            }
        }
    }

    fn try_acquire(&mut self) -> Result<Option<&mut Payload>, QueueClosed> {
        if self.current.is_none() {
            match self.shared.published.pop() {
                Some(slot) => self.current = Some(slot),
                None => {
                    if self.shared.is_closed() {
                        return Err(QueueClosed);
                    }
                    return Ok(None);
                }
            }
        }
        Ok(self.current.as_mut())
    }

    fn release(&mut self) {
        let mut slot = self
            .current
            .take()
            .expect("release() without an acquired slot");
        slot.clear();
        self.shared.recycle(slot);
    }

    fn attach_wakeup(&mut self, wakeup: Wakeup) {
        self.shared.data_wakeup.lock().push(wakeup);
    }

    fn close(&self) {
        self.shared.close();
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        if let Some(mut slot) = self.current.take() {
            slot.clear();
            self.shared.recycle(slot);
        }
    }
}
