//! Selector pool.
//!
//! A fixed number of event-loop threads, each owning a `mio::Poll`, a
//! task queue, and the drivers of the channels registered with it. Each
//! loop iteration drains the task queue, polls readiness with a finite
//! timeout, dispatches ready tokens to their drivers, and fires due
//! timers.
//!
//! Everything that touches a channel's socket or registration runs as a
//! task on the owning thread; cross-thread callers only ever enqueue.
//! Submitting a task arms the selector waker so a sleeping poll returns
//! immediately.
//!
//! A driver failure terminates that channel, never the thread. A thread
//! failure (the poll itself breaking) completes the pool close future
//! with the cause.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace};

use crate::error::{cause_from, Cause, ChannelFuture};

/// Token reserved for the selector waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Upper bound on one poll sleep; readiness and task wakeups interrupt
/// it, timers shorten it.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

const EVENTS_CAPACITY: usize = 256;

/// A unit of work executed on an event-loop thread.
pub(crate) type Task = Box<dyn FnOnce(&mut SelectorLoop) + Send>;

/// What a driver wants after handling an event.
pub(crate) enum Drive {
    Continue,
    Close(Option<Cause>),
}

/// Per-channel event processor, owned by exactly one event-loop thread.
pub(crate) trait Driver: Send {
    /// Register the underlying socket with the loop's selector.
    fn install(&mut self, registry: &Registry) -> io::Result<()>;

    /// Readiness arrived for the driver's token.
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, writable: bool) -> Drive;

    /// A timer armed by this driver fired (rate-limit retry).
    fn timer(&mut self, ctx: &mut LoopCtx<'_>) -> Drive;

    /// The application published output; re-arm the write side.
    fn wake_write(&mut self, ctx: &mut LoopCtx<'_>) -> Drive;

    /// The application released an input slot; re-arm the read side.
    fn wake_read(&mut self, ctx: &mut LoopCtx<'_>) -> Drive;

    /// Tear the channel down: deregister, close the socket and queues,
    /// complete the lifecycle futures exactly once.
    fn shutdown(&mut self, registry: &Registry, cause: Option<Cause>);
}

/// Loop-side context handed to drivers while they run.
pub(crate) struct LoopCtx<'a> {
    timers: &'a mut BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: &'a mut u64,
    token: Token,
}

impl LoopCtx<'_> {
    /// Arm a one-shot timer for the current driver.
    pub fn arm_timer(&mut self, after: Duration) {
        let entry = TimerEntry {
            deadline: Instant::now() + after,
            seq: *self.timer_seq,
            token: self.token.0,
        };
        *self.timer_seq += 1;
        self.timers.push(Reverse(entry));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    token: usize,
}

/// Handle for submitting tasks to one event-loop thread.
#[derive(Clone)]
pub struct SelectorExecutor {
    sender: flume::Sender<Task>,
    waker: Arc<Waker>,
}

impl SelectorExecutor {
    /// Enqueue `task` and wake the selector. Silently ignored once the
    /// thread has exited; anything it would have done is covered by the
    /// thread's own teardown.
    pub(crate) fn execute(&self, task: Task) {
        if self.sender.send(task).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

struct PoolInner {
    name: String,
    executors: Vec<SelectorExecutor>,
    next: AtomicUsize,
    tokens: AtomicUsize,
    close_future: ChannelFuture,
}

/// A fixed pool of selector threads that channels are distributed over.
#[derive(Clone)]
pub struct SelectorPool {
    inner: Arc<PoolInner>,
}

impl SelectorPool {
    /// Start `threads` event-loop threads named `{name}-{index}`.
    pub fn open(name: &str, threads: usize) -> io::Result<Self> {
        assert!(threads >= 1, "pool needs at least one thread");

        let mut executors = Vec::with_capacity(threads);
        let mut thread_futures = Vec::with_capacity(threads);
        for index in 0..threads {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (sender, receiver) = flume::unbounded();
            let done = ChannelFuture::new();

            let thread_done = done.clone();
            // Threads are detached; close_future() is the join point.
            let _ = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run_loop(poll, registry, &receiver, &thread_done))?;

            executors.push(SelectorExecutor { sender, waker });
            thread_futures.push(done);
        }

        debug!(name, threads, "selector pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                executors,
                next: AtomicUsize::new(0),
                tokens: AtomicUsize::new(0),
                close_future: ChannelFuture::merge(&thread_futures),
            }),
        })
    }

    /// The pool's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Executor for the next thread, round-robin.
    #[must_use]
    pub fn next(&self) -> SelectorExecutor {
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.executors.len();
        self.inner.executors[index].clone()
    }

    /// A pool-unique channel token.
    pub(crate) fn token(&self) -> Token {
        let token = self.inner.tokens.fetch_add(1, Ordering::Relaxed);
        assert!(token < WAKE_TOKEN.0, "token space exhausted");
        Token(token)
    }

    /// Stop every thread. Channels still registered are shut down with
    /// a pool-terminated cause.
    pub fn close(&self) {
        for executor in &self.inner.executors {
            executor.execute(Box::new(|lp| lp.running = false));
        }
    }

    /// Completes once every thread has exited; fails with the first
    /// thread-fatal cause.
    #[must_use]
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_future.clone()
    }
}

/// The mutable state of one event-loop thread.
pub(crate) struct SelectorLoop {
    registry: Registry,
    drivers: HashMap<Token, Box<dyn Driver>>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    closing: Vec<(Token, Option<Cause>)>,
    pub(crate) running: bool,
}

impl SelectorLoop {
    /// Register a freshly built driver with this thread's selector.
    pub(crate) fn install(&mut self, token: Token, mut driver: Box<dyn Driver>) {
        match driver.install(&self.registry) {
            Ok(()) => {
                trace!(token = token.0, "channel installed");
                self.drivers.insert(token, driver);
            }
            Err(err) => {
                debug!(token = token.0, %err, "channel registration failed");
                driver.shutdown(&self.registry, Some(cause_from(err.into())));
            }
        }
    }

    /// Initiate channel shutdown; the driver is reaped after the
    /// current batch of work.
    pub(crate) fn close(&mut self, token: Token, cause: Option<Cause>) {
        if self.drivers.contains_key(&token) {
            self.closing.push((token, cause));
        }
    }

    pub(crate) fn wake_write(&mut self, token: Token) {
        self.with_driver(token, |driver, ctx| driver.wake_write(ctx));
    }

    pub(crate) fn wake_read(&mut self, token: Token) {
        self.with_driver(token, |driver, ctx| driver.wake_read(ctx));
    }

    fn with_driver(
        &mut self,
        token: Token,
        run: impl FnOnce(&mut dyn Driver, &mut LoopCtx<'_>) -> Drive,
    ) {
        let Some(driver) = self.drivers.get_mut(&token) else {
            return;
        };
        let mut ctx = LoopCtx {
            timers: &mut self.timers,
            timer_seq: &mut self.timer_seq,
            token,
        };
        if let Drive::Close(cause) = run(driver.as_mut(), &mut ctx) {
            self.closing.push((token, cause));
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        self.with_driver(token, |driver, ctx| driver.ready(ctx, readable, writable));
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timers.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.timers.pop();
            self.with_driver(Token(entry.token), |driver, ctx| driver.timer(ctx));
        }
    }

    fn poll_timeout(&self) -> Duration {
        match self.timers.peek() {
            Some(Reverse(entry)) => entry
                .deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_TIMEOUT),
            None => POLL_TIMEOUT,
        }
    }

    /// Shut down every channel whose close was requested.
    fn reap(&mut self) {
        while let Some((token, cause)) = self.closing.pop() {
            if let Some(mut driver) = self.drivers.remove(&token) {
                driver.shutdown(&self.registry, cause);
            }
        }
    }

    fn shutdown_all(&mut self, cause: Option<&Cause>) {
        for (token, mut driver) in self.drivers.drain() {
            trace!(token = token.0, "channel shut down with pool");
            driver.shutdown(&self.registry, cause.cloned());
        }
        self.timers.clear();
        self.closing.clear();
    }
}

fn run_loop(
    mut poll: Poll,
    registry: Registry,
    tasks: &flume::Receiver<Task>,
    done: &ChannelFuture,
) {
    let mut lp = SelectorLoop {
        registry,
        drivers: HashMap::new(),
        timers: BinaryHeap::new(),
        timer_seq: 0,
        closing: Vec::new(),
        running: true,
    };
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let failure: Option<Cause> = loop {
        // 1. Drain cross-thread tasks; they mutate registrations and
        //    must run here, on the owning thread.
        for task in tasks.try_iter() {
            task(&mut lp);
        }
        lp.reap();
        if !lp.running {
            break None;
        }

        // 2. Poll readiness with a finite timeout.
        if let Err(err) = poll.poll(&mut events, Some(lp.poll_timeout())) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "selector poll failed; terminating event loop");
            break Some(cause_from(err.into()));
        }

        // 3. Dispatch each ready token to its driver. Error and
        //    half-closed states are folded into the two directions so
        //    the next read/write surfaces the failure.
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_error() || event.is_read_closed();
            let writable = event.is_writable() || event.is_error() || event.is_write_closed();
            lp.dispatch(token, readable, writable);
        }

        // 4. Rate-limit retries and other due timers.
        lp.fire_timers();
        lp.reap();
    };

    let channel_cause = match &failure {
        Some(cause) => Some(cause.clone()),
        None => Some(cause_from(crate::error::ChannelError::PoolTerminated)),
    };
    lp.shutdown_all(channel_cause.as_ref());

    match failure {
        None => {
            done.succeed(());
        }
        Some(cause) => {
            done.fail(cause);
        }
    }
}

// Shared across builder and acceptor: wakeup closures are stored in the
// queues and must reach the owning thread through the executor.
pub(crate) fn write_wakeup(executor: &SelectorExecutor, token: Token) -> Arc<dyn Fn() + Send + Sync> {
    let executor = executor.clone();
    Arc::new(move || {
        executor.execute(Box::new(move |lp| lp.wake_write(token)));
    })
}

pub(crate) fn read_wakeup(executor: &SelectorExecutor, token: Token) -> Arc<dyn Fn() + Send + Sync> {
    let executor = executor.clone();
    Arc::new(move || {
        executor.execute(Box::new(move |lp| lp.wake_read(token)));
    })
}
