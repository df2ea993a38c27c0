//! One-shot deferred completion tokens, executed by the event loop.

use crate::{errors::HandlerError, rt::event_loop::EventLoop};
use std::{
    cell::RefCell,
    mem,
    rc::{Rc, Weak},
};

type Waiter = Box<dyn FnOnce(&Result<(), HandlerError>)>;

enum CompletionState {
    Pending(Vec<Waiter>),
    Settled(Result<(), HandlerError>),
}

/// A one-shot completion carrying success or a [`HandlerError`].
///
/// Handlers return one of these to signal when their response work is
/// done. The token is a cheap clonable handle: any clone may settle it,
/// and the first settle wins; later calls are no-ops.
///
/// The executor is the event loop the token was created on: every
/// continuation registered with [`on_settled`](Completion::on_settled)
/// runs as a microtask, so deferred-work callbacks interleave with the
/// loop's phases exactly like [`next_tick`](EventLoop::next_tick).
///
/// # Examples
/// ```no_run
/// use solo_web::{Completion, EventLoop};
/// use std::rc::Rc;
///
/// let lp = Rc::new(EventLoop::new().unwrap());
/// let completion = Completion::pending(&lp);
///
/// let later = completion.clone();
/// lp.set_timeout(std::time::Duration::from_millis(100), move || {
///     later.complete();
/// });
/// ```
#[derive(Clone)]
pub struct Completion {
    lp: Weak<EventLoop>,
    state: Rc<RefCell<CompletionState>>,
}

impl Completion {
    /// Creates an unsettled completion bound to `lp`.
    pub fn pending(lp: &Rc<EventLoop>) -> Self {
        Self {
            lp: Rc::downgrade(lp),
            state: Rc::new(RefCell::new(CompletionState::Pending(Vec::new()))),
        }
    }

    /// Creates an already-successful completion.
    pub fn done(lp: &Rc<EventLoop>) -> Self {
        Self {
            lp: Rc::downgrade(lp),
            state: Rc::new(RefCell::new(CompletionState::Settled(Ok(())))),
        }
    }

    /// Creates an already-failed completion.
    pub fn failed<E: Into<HandlerError>>(lp: &Rc<EventLoop>, error: E) -> Self {
        Self {
            lp: Rc::downgrade(lp),
            state: Rc::new(RefCell::new(CompletionState::Settled(Err(error.into())))),
        }
    }

    /// Settles with success. No-op if already settled.
    #[inline]
    pub fn complete(&self) {
        self.settle(Ok(()));
    }

    /// Settles with failure. No-op if already settled.
    #[inline]
    pub fn fail<E: Into<HandlerError>>(&self, error: E) {
        self.settle(Err(error.into()));
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(*self.state.borrow(), CompletionState::Settled(_))
    }

    /// Runs `f` with the outcome once settled, as a loop microtask.
    ///
    /// If the token is already settled the continuation is scheduled
    /// immediately (still as a microtask, never inline).
    pub fn on_settled<F>(&self, f: F)
    where
        F: FnOnce(&Result<(), HandlerError>) + 'static,
    {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            CompletionState::Pending(waiters) => waiters.push(Box::new(f)),
            CompletionState::Settled(result) => {
                let result = result.clone();
                drop(state);
                self.schedule(Box::new(f), result);
            }
        }
    }

    fn settle(&self, result: Result<(), HandlerError>) {
        let mut state = self.state.borrow_mut();
        let waiters = match &mut *state {
            CompletionState::Pending(waiters) => mem::take(waiters),
            CompletionState::Settled(_) => return,
        };
        *state = CompletionState::Settled(result.clone());
        drop(state);

        for waiter in waiters {
            self.schedule(waiter, result.clone());
        }
    }

    fn schedule(&self, waiter: Waiter, result: Result<(), HandlerError>) {
        // If the loop is gone there is nothing left to run the waiter on.
        if let Some(lp) = self.lp.upgrade() {
            lp.next_tick(move || waiter(&result));
        }
    }
}
