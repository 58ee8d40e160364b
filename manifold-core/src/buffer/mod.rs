//! Bounded message buffers.
//!
//! A message buffer is the only data path between a selector thread and
//! the application: a bounded queue of reusable [`Payload`] slots with a
//! producer side (claim, fill, publish) and a consumer side (acquire,
//! read, release). Two interchangeable implementations are provided:
//!
//! - [`ring`] — lock-free claim/publish over slot-recycling queues,
//!   spin-then-block when full or empty
//! - [`blocking`] — a mutex and two condition variables
//!
//! Released slots are recycled to the producer; publish order is total
//! per queue and slots are never lost, duplicated, or reordered.
//!
//! Both implementations tolerate multiple producer handles, which is what
//! makes the fan-in (single input buffer) server mode work.

use std::sync::Arc;

use thiserror::Error;

use crate::payload::Payload;

pub mod blocking;
pub mod ring;

pub use blocking::blocking_queue;
pub use ring::ring_buffer;

/// The queue was closed and drained; no further slots will move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message buffer closed")]
pub struct QueueClosed;

/// Callback invoked on queue state transitions.
///
/// Wakeups may fire spuriously; the registered closure must be
/// idempotent. Selector-side closures submit an interest-toggle task to
/// the channel's owning event-loop thread.
pub type Wakeup = Arc<dyn Fn() + Send + Sync>;

/// Producer side of a message buffer.
///
/// Between a successful claim and the matching [`publish`](Self::publish)
/// the producer has exclusive access to the slot. Claiming again before
/// publishing returns the same slot.
pub trait MessageProducer: Send {
    /// Claim the next free slot, blocking (spin-then-park) while the
    /// queue is full.
    fn claim(&mut self) -> Result<&mut Payload, QueueClosed>;

    /// Claim the next free slot without blocking. `Ok(None)` means the
    /// queue is full — the caller should back off and wait for the
    /// space wakeup.
    fn try_claim(&mut self) -> Result<Option<&mut Payload>, QueueClosed>;

    /// Make the claimed slot visible to the consumer.
    ///
    /// # Panics
    ///
    /// Panics if no slot is currently claimed.
    fn publish(&mut self);

    /// Attach a callback fired when a full queue gains space (consumer
    /// released a slot). Every attached callback fires; fan-in queues
    /// carry one per producer.
    fn attach_wakeup(&mut self, wakeup: Wakeup);

    /// Close the queue: waiters are woken, further claims fail.
    fn close(&self);

    /// A second producer handle feeding the same queue (fan-in).
    fn clone_producer(&self) -> Box<dyn MessageProducer>;
}

/// Consumer side of a message buffer.
///
/// Acquire has peek semantics: until [`release`](Self::release) is
/// called, repeated acquires return the same published slot.
pub trait MessageConsumer: Send {
    /// Acquire the next published slot, blocking while the queue is
    /// empty. Returns `Err(QueueClosed)` once the queue is closed and
    /// fully drained.
    fn acquire(&mut self) -> Result<&mut Payload, QueueClosed>;

    /// Acquire without blocking. `Ok(None)` means nothing is published.
    fn try_acquire(&mut self) -> Result<Option<&mut Payload>, QueueClosed>;

    /// Return the acquired slot to the producer.
    ///
    /// # Panics
    ///
    /// Panics if no slot is currently acquired.
    fn release(&mut self);

    /// Attach a callback fired when an empty queue gains data (producer
    /// published a slot).
    fn attach_wakeup(&mut self, wakeup: Wakeup);

    /// Close the queue: waiters are woken, published slots may still be
    /// drained before `Err(QueueClosed)` is reported.
    fn close(&self);
}

pub(crate) fn fire(callbacks: &parking_lot::Mutex<Vec<Wakeup>>) {
    let callbacks = callbacks.lock().clone();
    for callback in callbacks {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn fill(p: &mut Payload, data: &[u8]) {
        p.set_from(data).unwrap();
    }

    fn exercise_fifo(
        mut producer: Box<dyn MessageProducer>,
        mut consumer: Box<dyn MessageConsumer>,
    ) {
        for i in 0..100u8 {
            let slot = producer.claim().unwrap();
            fill(slot, &[i, i.wrapping_add(1)]);
            producer.publish();
        }
        for i in 0..100u8 {
            let slot = consumer.acquire().unwrap();
            assert_eq!(slot.as_slice(), &[i, i.wrapping_add(1)]);
            consumer.release();
        }
        assert!(consumer.try_acquire().unwrap().is_none());
    }

    fn exercise_backpressure(
        mut producer: Box<dyn MessageProducer>,
        mut consumer: Box<dyn MessageConsumer>,
    ) {
        // Fill the queue to capacity without consuming.
        let mut published = 0usize;
        loop {
            match producer.try_claim().unwrap() {
                Some(slot) => {
                    fill(slot, &[published as u8]);
                    producer.publish();
                    published += 1;
                }
                None => break,
            }
        }
        assert!(published >= 4);

        // A blocked producer must resume once the consumer releases.
        let handle = thread::spawn(move || {
            let slot = producer.claim().unwrap();
            fill(slot, b"late");
            producer.publish();
        });
        thread::sleep(Duration::from_millis(50));
        let slot = consumer.acquire().unwrap();
        assert_eq!(slot.as_slice(), &[0]);
        consumer.release();
        handle.join().unwrap();

        for i in 1..published {
            let slot = consumer.acquire().unwrap();
            assert_eq!(slot.as_slice(), &[i as u8]);
            consumer.release();
        }
        let slot = consumer.acquire().unwrap();
        assert_eq!(slot.as_slice(), b"late");
        consumer.release();
    }

    fn exercise_close(mut producer: Box<dyn MessageProducer>, mut consumer: Box<dyn MessageConsumer>) {
        let slot = producer.claim().unwrap();
        fill(slot, b"x");
        producer.publish();
        producer.close();

        // Published data drains before the closed state is reported.
        assert_eq!(consumer.acquire().unwrap().as_slice(), b"x");
        consumer.release();
        assert_eq!(consumer.acquire().unwrap_err(), QueueClosed);
        assert_eq!(producer.claim().unwrap_err(), QueueClosed);
    }

    fn exercise_wakeups(
        mut producer: Box<dyn MessageProducer>,
        mut consumer: Box<dyn MessageConsumer>,
    ) {
        let data_wakes = Arc::new(AtomicUsize::new(0));
        let space_wakes = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&data_wakes);
        let s = Arc::clone(&space_wakes);
        consumer.attach_wakeup(Arc::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        producer.attach_wakeup(Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        // empty -> non-empty fires the consumer-side wakeup
        let slot = producer.claim().unwrap();
        fill(slot, b"a");
        producer.publish();
        assert!(data_wakes.load(Ordering::SeqCst) >= 1);

        // fill up, then a release fires the producer-side wakeup
        while let Some(slot) = producer.try_claim().unwrap() {
            fill(slot, b"b");
            producer.publish();
        }
        consumer.acquire().unwrap();
        consumer.release();
        assert!(space_wakes.load(Ordering::SeqCst) >= 1);
    }

    fn exercise_fan_in(producer: Box<dyn MessageProducer>, mut consumer: Box<dyn MessageConsumer>) {
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let mut p = producer.clone_producer();
            handles.push(thread::spawn(move || {
                for i in 0..25u8 {
                    let slot = p.claim().unwrap();
                    fill(slot, &[t, i]);
                    p.publish();
                }
            }));
        }
        let mut seen = 0;
        while seen < 100 {
            let slot = consumer.acquire().unwrap();
            assert_eq!(slot.as_slice().len(), 2);
            consumer.release();
            seen += 1;
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn ring_fifo() {
        let (p, c) = ring_buffer(8, 16);
        exercise_fifo(Box::new(p), Box::new(c));
    }

    #[test]
    fn blocking_fifo() {
        let (p, c) = blocking_queue(8, 16);
        exercise_fifo(Box::new(p), Box::new(c));
    }

    #[test]
    fn ring_backpressure() {
        let (p, c) = ring_buffer(8, 16);
        exercise_backpressure(Box::new(p), Box::new(c));
    }

    #[test]
    fn blocking_backpressure() {
        let (p, c) = blocking_queue(8, 16);
        exercise_backpressure(Box::new(p), Box::new(c));
    }

    #[test]
    fn ring_close() {
        let (p, c) = ring_buffer(4, 16);
        exercise_close(Box::new(p), Box::new(c));
    }

    #[test]
    fn blocking_close() {
        let (p, c) = blocking_queue(4, 16);
        exercise_close(Box::new(p), Box::new(c));
    }

    #[test]
    fn ring_wakeups() {
        let (p, c) = ring_buffer(4, 16);
        exercise_wakeups(Box::new(p), Box::new(c));
    }

    #[test]
    fn blocking_wakeups() {
        let (p, c) = blocking_queue(4, 16);
        exercise_wakeups(Box::new(p), Box::new(c));
    }

    #[test]
    fn ring_fan_in() {
        let (p, c) = ring_buffer(8, 16);
        exercise_fan_in(Box::new(p), Box::new(c));
    }

    #[test]
    fn blocking_fan_in() {
        let (p, c) = blocking_queue(8, 16);
        exercise_fan_in(Box::new(p), Box::new(c));
    }
}
