//! Mutex-and-condvar message buffer.
//!
//! Same interface and recycling scheme as the ring variant, implemented
//! with a single mutex and two condition variables. Simpler to reason
//! about, and the baseline the ring is benchmarked against.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::{fire, MessageConsumer, MessageProducer, QueueClosed, Wakeup};
use crate::payload::Payload;

const PARK_INTERVAL: Duration = Duration::from_millis(50);

struct State {
    published: VecDeque<Payload>,
    free: Vec<Payload>,
    closed: bool,
}

struct QueueShared {
    state: Mutex<State>,
    space_cond: Condvar,
    data_cond: Condvar,
    space_wakeup: Mutex<Vec<Wakeup>>,
    data_wakeup: Mutex<Vec<Wakeup>>,
}

impl QueueShared {
    fn recycle(&self, slot: Payload) {
        let was_starved;
        {
            let mut state = self.state.lock();
            was_starved = state.free.is_empty();
            state.free.push(slot);
        }
        self.space_cond.notify_all();
        if was_starved {
            fire(&self.space_wakeup);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.space_cond.notify_all();
        self.data_cond.notify_all();
        fire(&self.space_wakeup);
        fire(&self.data_wakeup);
    }
}

/// Producer handle for a blocking queue.
pub struct BlockingProducer {
    shared: Arc<QueueShared>,
    current: Option<Payload>,
}

/// Consumer handle for a blocking queue.
pub struct BlockingConsumer {
    shared: Arc<QueueShared>,
    current: Option<Payload>,
}

/// Build a blocking queue of `capacity` slots, each able to hold
/// `slot_capacity` bytes.
#[must_use]
pub fn blocking_queue(capacity: usize, slot_capacity: usize) -> (BlockingProducer, BlockingConsumer) {
    assert!(capacity > 0, "queue capacity must be positive");

    let mut free = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        free.push(Payload::with_capacity(slot_capacity));
    }
    let shared = Arc::new(QueueShared {
        state: Mutex::new(State {
            published: VecDeque::with_capacity(capacity),
            free,
            closed: false,
        }),
        space_cond: Condvar::new(),
        data_cond: Condvar::new(),
        space_wakeup: Mutex::new(Vec::new()),
        data_wakeup: Mutex::new(Vec::new()),
    });

    (
        BlockingProducer {
            shared: Arc::clone(&shared),
            current: None,
        },
        BlockingConsumer {
            shared,
            current: None,
        },
    )
}

impl MessageProducer for BlockingProducer {
    fn claim(&mut self) -> Result<&mut Payload, QueueClosed> {
        if self.current.is_none() {
            let mut state = self.shared.state.lock();
            loop {
                if state.closed {
                    return Err(QueueClosed);
                }
                if let Some(mut slot) = state.free.pop() {
                    slot.clear();
                    self.current = Some(slot);
                    break;
                }
                self.shared.space_cond.wait_for(&mut state, PARK_INTERVAL);
            }
        }
        Ok(self.current.as_mut().expect("slot claimed above"))
    }

    fn try_claim(&mut self) -> Result<Option<&mut Payload>, QueueClosed> {
        if self.current.is_none() {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            match state.free.pop() {
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
        let was_empty;
        {
            let mut state = self.shared.state.lock();
            was_empty = state.published.is_empty();
            state.published.push_back(slot);
        }
        self.shared.data_cond.notify_all();
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
        Box::new(BlockingProducer {
            shared: Arc::clone(&self.shared),
            current: None,
        })
    }
}

impl Drop for BlockingProducer {
    fn drop(&mut self) {
        if let Some(slot) = self.current.take() {
            self.shared.recycle(slot);
        }
    }
}

impl MessageConsumer for BlockingConsumer {
    fn acquire(&mut self) -> Result<&mut Payload, QueueClosed> {
        if self.current.is_none() {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(slot) = state.published.pop_front() {
                    self.current = Some(slot);
                    break;
                }
                if state.closed {
                    return Err(QueueClosed);
                }
                self.shared.data_cond.wait_for(&mut state, PARK_INTERVAL);
            }
        }
        Ok(self.current.as_mut().expect("slot acquired above"))
    }

    fn try_acquire(&mut self) -> Result<Option<&mut Payload>, QueueClosed> {
        if self.current.is_none() {
            let mut state = self.shared.state.lock();
            match state.published.pop_front() {
                Some(slot) => self.current = Some(slot),
                None => {
                    if state.closed {
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

impl Drop for BlockingConsumer {
    fn drop(&mut self) {
        if let Some(mut slot) = self.current.take() {
            slot.clear();
            self.shared.recycle(slot);
        }
    }
}
