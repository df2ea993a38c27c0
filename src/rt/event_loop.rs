//! Single-threaded cooperative event loop.
//!
//! One iteration works through four task classes in a fixed phase order:
//! microtasks drain to empty, the poller sleeps until I/O or the nearest
//! timer, expired timers fire in deadline order, ready I/O handlers
//! dispatch, and immediates run last, with the microtask queue drained
//! again after every single macrotask. The loop keeps running while its
//! reference count is positive or queued work remains.

use crossbeam::queue::SegQueue;
use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

/// Upper bound on a poll when no timer is armed, so `stop()` and remote
/// enqueues never wait on a silent socket forever.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3);

const WAKER_TOKEN: Token = Token(0);

type Thunk = Box<dyn FnOnce()>;
type SendThunk = Box<dyn FnOnce() + Send>;

enum RemoteTask {
    Tick(SendThunk),
    Immediate(SendThunk),
    Timeout(Duration, SendThunk),
}

/// The cooperative scheduler everything in this crate runs on.
///
/// Create one per server (or per test), wrap it in an [`Rc`], and call
/// [`run`](EventLoop::run) from the thread that owns it. All callbacks
/// (microtasks, timers, I/O handlers, immediates, handler continuations)
/// execute on that thread; the only cross-thread facility is the
/// [`LoopRemote`] handle, which enqueues work and wakes the poller.
///
/// Ordering guarantees:
/// - [`next_tick`](EventLoop::next_tick) callbacks run FIFO and always
///   before any timer or immediate queued alongside them.
/// - Timers fire in deadline order, ties broken by insertion order.
/// - Microtasks enqueued inside a macrotask run before the next
///   macrotask.
/// - [`set_immediate`](EventLoop::set_immediate) callbacks run after the
///   I/O poll of the iteration that queued them.
///
/// A panic inside any callback is caught at the loop boundary, reported
/// through `tracing`, and never aborts the loop.
pub struct EventLoop {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    waker: Arc<Waker>,

    microtasks: RefCell<VecDeque<Thunk>>,
    immediates: RefCell<VecDeque<Thunk>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    remote_tasks: Arc<SegQueue<RemoteTask>>,

    io_handlers: RefCell<HashMap<Token, Rc<dyn Fn(&EventLoop)>>>,
    next_token: Cell<usize>,

    refs: Rc<Cell<i64>>,
    stopped: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(256)),
            waker,
            microtasks: RefCell::new(VecDeque::new()),
            immediates: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            remote_tasks: Arc::new(SegQueue::new()),
            io_handlers: RefCell::new(HashMap::new()),
            next_token: Cell::new(WAKER_TOKEN.0 + 1),
            refs: Rc::new(Cell::new(0)),
            stopped: Cell::new(false),
        })
    }
}

// Scheduling
impl EventLoop {
    /// Appends a microtask. Microtasks drain to empty, including ones
    /// enqueued while draining, before the loop does anything else.
    #[inline]
    pub fn next_tick<F: FnOnce() + 'static>(&self, f: F) {
        self.microtasks.borrow_mut().push_back(Box::new(f));
    }

    /// Appends an immediate: runs after this iteration's I/O poll.
    #[inline]
    pub fn set_immediate<F: FnOnce() + 'static>(&self, f: F) {
        self.immediates.borrow_mut().push_back(Box::new(f));
    }

    /// Arms a one-shot timer. Holds one loop reference until it fires or
    /// is cancelled; exactly one of the two releases it.
    pub fn set_timeout<F: FnOnce() + 'static>(&self, delay: Duration, f: F) -> TimerHandle {
        let state = Rc::new(Cell::new(TimerState::Armed));
        self.refs.set(self.refs.get() + 1);
        self.push_timer(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.next_seq(),
            state: Rc::clone(&state),
            kind: TimerKind::Once(Box::new(f)),
        });

        TimerHandle {
            state,
            refs: Rc::clone(&self.refs),
        }
    }

    /// Arms a repeating timer: after each firing it is re-enqueued at
    /// `now + period`. The interval holds a single loop reference for its
    /// whole life, released only by cancelling.
    pub fn set_interval<F: FnMut() + 'static>(&self, period: Duration, f: F) -> TimerHandle {
        let state = Rc::new(Cell::new(TimerState::Armed));
        self.refs.set(self.refs.get() + 1);
        self.push_timer(TimerEntry {
            deadline: Instant::now() + period,
            seq: self.next_seq(),
            state: Rc::clone(&state),
            kind: TimerKind::Interval {
                period,
                callback: Rc::new(RefCell::new(f)),
            },
        });

        TimerHandle {
            state,
            refs: Rc::clone(&self.refs),
        }
    }

    /// Takes a liveness reference: `run` keeps going while the count is
    /// positive.
    #[inline(always)]
    pub fn ref_(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    /// Releases a liveness reference. Going negative is a caller bug.
    #[inline(always)]
    pub fn unref(&self) {
        self.refs.set(self.refs.get() - 1);
        debug_assert!(self.refs.get() >= 0, "loop reference count went negative");
    }

    #[inline(always)]
    pub fn ref_count(&self) -> i64 {
        self.refs.get()
    }

    /// Returns a `Send + Sync` handle for enqueueing work from other
    /// threads; every enqueue wakes the poller.
    pub fn remote(&self) -> LoopRemote {
        LoopRemote {
            tasks: Arc::clone(&self.remote_tasks),
            waker: Arc::clone(&self.waker),
        }
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        seq
    }

    #[inline]
    fn push_timer(&self, entry: TimerEntry) {
        self.timers.borrow_mut().push(entry);
    }
}

// I/O registration
impl EventLoop {
    /// Registers a non-blocking source for readiness; `handler` is
    /// invoked (on the loop thread) whenever the source signals ready.
    pub fn register<S, F>(&self, source: &mut S, interest: Interest, handler: F) -> io::Result<Token>
    where
        S: Source + ?Sized,
        F: Fn(&EventLoop) + 'static,
    {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);

        self.registry.register(source, token, interest)?;
        self.io_handlers.borrow_mut().insert(token, Rc::new(handler));
        Ok(token)
    }

    /// Removes a source and its handler from the loop.
    pub fn deregister<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.io_handlers.borrow_mut().remove(&token);
        self.registry.deregister(source)
    }
}

// Driving
impl EventLoop {
    /// Drives the loop until it is quiescent: reference count at zero
    /// with no pending microtasks or immediates. [`stop`](EventLoop::stop)
    /// forces an earlier exit at the end of the current iteration.
    pub fn run(&self) {
        self.stopped.set(false);

        loop {
            self.drain_remote();
            self.drain_microtasks();

            if self.stopped.get() {
                break;
            }
            if self.refs.get() <= 0
                && self.microtasks.borrow().is_empty()
                && self.immediates.borrow().is_empty()
            {
                break;
            }

            let ready = self.poll_io(self.poll_timeout());

            self.drain_remote();
            self.fire_timers();

            for token in ready {
                // Look the handler up at dispatch time: an earlier handler
                // in this batch may have deregistered it.
                let handler = self.io_handlers.borrow().get(&token).cloned();
                if let Some(handler) = handler {
                    run_guarded(|| handler(self));
                    self.drain_microtasks();
                }
            }

            self.run_immediates();

            if self.stopped.get() {
                break;
            }
        }
    }

    /// Flags the loop to exit after the current iteration, regardless of
    /// pending work, and wakes the poller.
    pub fn stop(&self) {
        self.stopped.set(true);
        let _ = self.waker.wake();
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.microtasks.borrow().is_empty()
            || !self.immediates.borrow().is_empty()
            || !self.remote_tasks.is_empty()
        {
            return Some(Duration::ZERO);
        }

        match self.timers.borrow().peek() {
            Some(entry) => Some(entry.deadline.saturating_duration_since(Instant::now())),
            None => Some(DEFAULT_POLL_TIMEOUT),
        }
    }

    fn poll_io(&self, timeout: Option<Duration>) -> Vec<Token> {
        let mut events = self.events.borrow_mut();
        let mut poll = self.poll.borrow_mut();

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => tracing::error!(error = %err, "poll failed"),
        }

        events
            .iter()
            .map(|event| event.token())
            .filter(|&token| token != WAKER_TOKEN)
            .collect()
    }

    fn drain_remote(&self) {
        while let Some(task) = self.remote_tasks.pop() {
            match task {
                RemoteTask::Tick(f) => self.microtasks.borrow_mut().push_back(f),
                RemoteTask::Immediate(f) => self.immediates.borrow_mut().push_back(f),
                RemoteTask::Timeout(delay, f) => {
                    // The handle is dropped: a remote timeout cannot be
                    // cancelled, its reference is released when it fires.
                    let _ = self.set_timeout(delay, f);
                }
            }
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let task = self.microtasks.borrow_mut().pop_front();
            match task {
                Some(f) => run_guarded(f),
                None => break,
            }
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();

        // Collect the due batch first: a zero-period interval re-arms at
        // "now" and must not fire twice in one iteration.
        let mut due = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            while let Some(entry) = timers.peek() {
                if entry.deadline > now {
                    break;
                }
                due.push(timers.pop().expect("peeked entry"));
            }
        }

        for entry in due {
            if entry.state.get() == TimerState::Cancelled {
                // Tombstone: drained without invoking.
                continue;
            }

            match entry.kind {
                TimerKind::Once(f) => {
                    entry.state.set(TimerState::Fired);
                    self.unref();
                    run_guarded(f);
                    self.drain_microtasks();
                }
                TimerKind::Interval { period, callback } => {
                    run_guarded(|| (&mut *callback.borrow_mut())());
                    self.drain_microtasks();

                    if entry.state.get() != TimerState::Cancelled {
                        self.push_timer(TimerEntry {
                            deadline: Instant::now() + period,
                            seq: self.next_seq(),
                            state: entry.state,
                            kind: TimerKind::Interval { period, callback },
                        });
                    }
                }
            }
        }
    }

    fn run_immediates(&self) {
        // Snapshot: immediates enqueued by an immediate run next iteration.
        let batch: Vec<Thunk> = self.immediates.borrow_mut().drain(..).collect();
        for f in batch {
            run_guarded(f);
            self.drain_microtasks();
        }
    }
}

/// Runs a callback with the loop's panic boundary: a panic is reported
/// and swallowed so the loop survives.
fn run_guarded<F: FnOnce()>(f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(panic = %panic_message(payload.as_ref()), "callback panicked");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

// TIMERS

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Armed,
    Fired,
    Cancelled,
}

enum TimerKind {
    Once(Thunk),
    Interval {
        period: Duration,
        callback: Rc<RefCell<dyn FnMut()>>,
    },
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    state: Rc<Cell<TimerState>>,
    kind: TimerKind,
}

// Min-heap order on (deadline, insertion seq).
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

/// Cancellation handle for a timer.
///
/// `cancel` is idempotent and race-free with firing: exactly one of
/// {cancel, fire} takes effect, and only that one releases the timer's
/// loop reference. Dropping the handle does not cancel.
pub struct TimerHandle {
    state: Rc<Cell<TimerState>>,
    refs: Rc<Cell<i64>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if self.state.get() == TimerState::Armed {
            self.state.set(TimerState::Cancelled);
            self.refs.set(self.refs.get() - 1);
        }
    }
}

// REMOTE

/// Cross-thread handle to an [`EventLoop`].
///
/// Enqueueing from the loop thread itself is allowed but pointless: the
/// loop cannot be sleeping while its own callbacks run.
#[derive(Clone)]
pub struct LoopRemote {
    tasks: Arc<SegQueue<RemoteTask>>,
    waker: Arc<Waker>,
}

impl LoopRemote {
    pub fn next_tick<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.tasks.push(RemoteTask::Tick(Box::new(f)));
        let _ = self.waker.wake();
    }

    pub fn set_immediate<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.tasks.push(RemoteTask::Immediate(Box::new(f)));
        let _ = self.waker.wake();
    }

    pub fn set_timeout<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) {
        self.tasks.push(RemoteTask::Timeout(delay, Box::new(f)));
        let _ = self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;

    fn new_loop() -> Rc<EventLoop> {
        Rc::new(EventLoop::new().unwrap())
    }

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let order = Rc::new(RefCell::new(Vec::new()));
        let push = {
            let order = Rc::clone(&order);
            move |label| order.borrow_mut().push(label)
        };
        (order, push)
    }

    #[test]
    fn ticks_run_fifo() {
        let lp = new_loop();
        let (order, push) = recorder();

        for label in ["a", "b", "c"] {
            let push = push.clone();
            lp.next_tick(move || push(label));
        }

        lp.run();
        assert_eq!(*order.borrow(), ["a", "b", "c"]);
        assert_eq!(lp.ref_count(), 0);
    }

    #[test]
    fn tick_runs_before_zero_timeout() {
        let lp = new_loop();
        let (order, push) = recorder();

        {
            let push = push.clone();
            lp.set_timeout(Duration::ZERO, move || push("timeout"));
        }
        lp.next_tick(move || push("tick"));

        lp.run();
        assert_eq!(*order.borrow(), ["tick", "timeout"]);
    }

    #[test]
    fn tick_runs_before_immediate() {
        let lp = new_loop();
        let (order, push) = recorder();

        {
            let push = push.clone();
            lp.set_immediate(move || push("immediate"));
        }
        lp.next_tick(move || push("tick"));

        lp.run();
        assert_eq!(*order.borrow(), ["tick", "immediate"]);
    }

    #[test]
    fn timers_fire_before_immediates_in_one_iteration() {
        let lp = new_loop();
        let (order, push) = recorder();

        {
            let push = push.clone();
            lp.set_immediate(move || push("immediate"));
        }
        lp.set_timeout(Duration::ZERO, move || push("timeout"));

        lp.run();
        assert_eq!(*order.borrow(), ["timeout", "immediate"]);
    }

    #[test]
    fn microtasks_drain_between_timers() {
        let lp = new_loop();
        let (order, push) = recorder();

        {
            let push = push.clone();
            let lp2 = Rc::clone(&lp);
            lp.set_timeout(Duration::ZERO, move || {
                push("t1");
                let push = push.clone();
                lp2.next_tick(move || push("tick-from-t1"));
            });
        }
        {
            let push = push.clone();
            lp.set_timeout(Duration::ZERO, move || push("t2"));
        }

        lp.run();
        assert_eq!(*order.borrow(), ["t1", "tick-from-t1", "t2"]);
    }

    #[test]
    fn microtasks_drain_between_immediates() {
        let lp = new_loop();
        let (order, push) = recorder();

        {
            let push = push.clone();
            let lp2 = Rc::clone(&lp);
            lp.set_immediate(move || {
                push("im1");
                let push = push.clone();
                lp2.next_tick(move || push("tick-from-im1"));
            });
        }
        {
            let push = push.clone();
            lp.set_immediate(move || push("im2"));
        }

        lp.run();
        assert_eq!(*order.borrow(), ["im1", "tick-from-im1", "im2"]);
    }

    #[test]
    fn same_deadline_timers_keep_insertion_order() {
        let lp = new_loop();
        let (order, push) = recorder();

        for label in ["first", "second", "third"] {
            let push = push.clone();
            lp.set_timeout(Duration::ZERO, move || push(label));
        }

        lp.run();
        assert_eq!(*order.borrow(), ["first", "second", "third"]);
    }

    #[test]
    fn timeout_holds_exactly_one_ref() {
        let lp = new_loop();

        let handle = lp.set_timeout(Duration::from_secs(60), || {});
        assert_eq!(lp.ref_count(), 1);

        handle.cancel();
        assert_eq!(lp.ref_count(), 0);

        // Idempotent: no double release.
        handle.cancel();
        assert_eq!(lp.ref_count(), 0);

        lp.run();
        assert_eq!(lp.ref_count(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let lp = new_loop();
        let fired = Rc::new(Cell::new(false));

        let handle = lp.set_timeout(Duration::ZERO, {
            let fired = Rc::clone(&fired);
            move || fired.set(true)
        });
        handle.cancel();

        lp.run();
        assert!(!fired.get());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let lp = new_loop();

        let handle = lp.set_timeout(Duration::ZERO, || {});
        lp.run();
        assert_eq!(lp.ref_count(), 0);

        handle.cancel();
        assert_eq!(lp.ref_count(), 0);
    }

    #[test]
    fn interval_repeats_and_holds_one_ref() {
        let lp = new_loop();
        let counts: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));

        let handle = lp.set_interval(Duration::from_millis(1), {
            let counts = Rc::clone(&counts);
            let slot = Rc::clone(&slot);
            let lp2 = Rc::clone(&lp);
            move || {
                counts.borrow_mut().push(lp2.ref_count());
                if counts.borrow().len() == 3 {
                    slot.borrow_mut().take().unwrap().cancel();
                }
            }
        });
        *slot.borrow_mut() = Some(handle);

        lp.run();
        // Three firings, each observing the interval's single ref.
        assert_eq!(*counts.borrow(), [1, 1, 1]);
        assert_eq!(lp.ref_count(), 0);
    }

    #[test]
    fn stop_exits_with_pending_work() {
        let lp = new_loop();

        let _interval = lp.set_interval(Duration::from_secs(60), || {});
        lp.set_timeout(Duration::from_millis(5), {
            let lp2 = Rc::clone(&lp);
            move || lp2.stop()
        });

        lp.run();
        assert_eq!(lp.ref_count(), 1, "interval ref survives a forced stop");
    }

    #[test]
    fn panicking_callback_does_not_abort_the_loop() {
        let lp = new_loop();
        let survived = Rc::new(Cell::new(false));

        lp.next_tick(|| panic!("boom"));
        lp.next_tick({
            let survived = Rc::clone(&survived);
            move || survived.set(true)
        });

        lp.run();
        assert!(survived.get());
    }

    #[test]
    fn remote_enqueue_wakes_the_poller() {
        let lp = new_loop();
        let remote = lp.remote();
        let seen = Arc::new(AtomicBool::new(false));
        let done = Rc::new(Cell::new(false));

        // Watchdog so the test fails fast instead of hanging.
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let handle = lp.set_interval(Duration::from_millis(1), {
            let seen = Arc::clone(&seen);
            let done = Rc::clone(&done);
            let slot = Rc::clone(&slot);
            move || {
                if seen.load(AtomicOrdering::SeqCst) {
                    done.set(true);
                    slot.borrow_mut().take().unwrap().cancel();
                }
            }
        });
        *slot.borrow_mut() = Some(handle);

        let worker = thread::spawn({
            let seen = Arc::clone(&seen);
            move || {
                thread::sleep(Duration::from_millis(20));
                remote.next_tick(move || seen.store(true, AtomicOrdering::SeqCst));
            }
        });

        lp.run();
        worker.join().unwrap();
        assert!(done.get());
    }

    #[test]
    fn io_readiness_dispatches_handler() {
        let lp = new_loop();
        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = Rc::new(RefCell::new(listener));
        let accepted = Rc::new(Cell::new(false));

        lp.register(&mut *listener.borrow_mut(), Interest::READABLE, {
            let listener = Rc::clone(&listener);
            let accepted = Rc::clone(&accepted);
            move |lp| {
                listener.borrow_mut().accept().unwrap();
                accepted.set(true);
                lp.stop();
            }
        })
        .unwrap();
        lp.ref_();

        let client = thread::spawn(move || {
            std::net::TcpStream::connect(addr).unwrap();
        });

        lp.run();
        client.join().unwrap();
        assert!(accepted.get());
    }
}
