//! One-shot completions.
//!
//! A `Completion` is a plain promise handle: whoever holds a clone can
//! observe the outcome, exactly one `succeed`/`fail` wins, and callbacks
//! registered before completion run on the completing thread. A merging
//! completion composes children: success when all succeed, failure on
//! the first failure with that cause.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Callback<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

enum State<T, E> {
    Pending(Vec<Callback<T, E>>),
    Done(Result<T, E>),
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
    cond: Condvar,
}

/// One-shot settable future.
///
/// Clones share the same underlying promise.
pub struct Completion<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Completion<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Completion<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Completion<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                cond: Condvar::new(),
            }),
        }
    }

    /// Complete successfully. Returns `false` if already completed.
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with a failure cause. Returns `false` if already
    /// completed.
    pub fn fail(&self, cause: E) -> bool {
        self.complete(Err(cause))
    }

    fn complete(&self, result: Result<T, E>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    callbacks
                }
            }
        };
        self.inner.cond.notify_all();
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// The outcome, if completed.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T, E>> {
        match &*self.inner.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Block until completed.
    pub fn wait(&self) -> Result<T, E> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block until completed or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => Some(result.clone()),
                    State::Pending(_) => None,
                };
            }
        }
    }

    /// Run `callback` when the completion resolves. Runs inline,
    /// immediately, if it already has.
    pub fn on_complete(&self, callback: impl FnOnce(&Result<T, E>) + Send + 'static) {
        let mut callback = Some(callback);
        let resolved = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(result) => Some(result.clone()),
                State::Pending(callbacks) => {
                    let callback = callback.take().expect("callback taken once");
                    callbacks.push(Box::new(callback));
                    None
                }
            }
        };
        if let Some(result) = resolved {
            if let Some(callback) = callback.take() {
                callback(&result);
            }
        }
    }
}

impl<E> Completion<(), E>
where
    E: Clone + Send + 'static,
{
    /// A completion that succeeds when every child succeeds and fails
    /// with the first child failure.
    #[must_use]
    pub fn merge(children: &[Completion<(), E>]) -> Completion<(), E> {
        let merged = Completion::new();
        if children.is_empty() {
            merged.succeed(());
            return merged;
        }
        let remaining = Arc::new(AtomicUsize::new(children.len()));
        for child in children {
            let merged = merged.clone();
            let remaining = Arc::clone(&remaining);
            child.on_complete(move |result| match result {
                Ok(()) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        merged.succeed(());
                    }
                }
                Err(cause) => {
                    merged.fail(cause.clone());
                }
            });
        }
        merged
    }
}
