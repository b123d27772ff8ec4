//! The owner worker: a single thread that owns all engine state.
//!
//! Every externally-originating callback is posted here as a task; timers
//! are deadlines drained by the same loop. This replaces shared-mutex
//! discipline with message passing: state is only ever touched from the
//! worker thread.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub(crate) type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Revocable handle for posting tasks onto the owner worker.
///
/// Outgoing async calls capture a ticket; when the reply arrives it is
/// posted back through it. Posting after the worker has finished is a
/// silent no-op, which is how replies to a stopped engine die.
pub(crate) struct Ticket<C> {
    tx: Sender<Task<C>>,
}

impl<C> Clone for Ticket<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: 'static> Ticket<C> {
    /// Enqueue `f` to run on the worker. Returns false if the worker is gone.
    pub fn post(&self, f: impl FnOnce(&mut C) + Send + 'static) -> bool {
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Run `f` on the worker and wait for its result. `None` if the worker
    /// is gone. Must not be called from the worker thread itself.
    pub fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut C) -> R + Send + 'static,
    ) -> Option<R> {
        let (tx, rx) = bounded(1);
        if !self.post(move |c| {
            let _ = tx.send(f(c));
        }) {
            return None;
        }
        rx.recv().ok()
    }
}

/// Timers the engine arms. Singleton keys replace any previously armed
/// timer of the same kind; confirmation timers are keyed per delta UUID.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    FastForwardGrace,
    StallGrace,
    SnapshotTick,
    SnapshotFetch,
    Confirm(Uuid),
    Stop,
}

/// Deadline queue drained by the worker loop.
///
/// Cancellation is lazy: the heap keeps stale entries, and tokens decide
/// which ones are still live.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerKey>,
    by_key: HashMap<TimerKey, u64>,
    next_token: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            by_key: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm (or re-arm) `key` to fire after `delay`.
    pub fn schedule(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(&key);
        let token = self.next_token;
        self.next_token += 1;
        self.live.insert(token, key.clone());
        self.by_key.insert(key, token);
        self.heap.push(Reverse((Instant::now() + delay, token)));
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some(token) = self.by_key.remove(key) {
            self.live.remove(&token);
        }
    }

    pub fn is_active(&self, key: &TimerKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.by_key.clear();
    }

    /// Earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if self.live.contains_key(&token) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one timer due at `now`, removing it from the queue.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(key) = self.live.remove(&token) {
                self.by_key.remove(&key);
                return Some(key);
            }
        }
        None
    }
}

/// Exponential backoff between retries, doubling up to a cap.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to use for the next attempt; doubles the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// State driven by a worker loop.
pub(crate) trait WorkerState: Sized + 'static {
    fn on_timer(&mut self, key: TimerKey);
    fn timers(&mut self) -> &mut TimerQueue;
    /// When true the loop exits after the current iteration.
    fn finished(&self) -> bool;
}

/// Spawn the owner worker. `init` builds the state on the worker thread,
/// receiving a ticket it can hand to external callbacks.
pub(crate) fn spawn<C, F>(name: &str, init: F) -> (Ticket<C>, JoinHandle<()>)
where
    C: WorkerState,
    F: FnOnce(Ticket<C>) -> C + Send + 'static,
{
    let (tx, rx) = unbounded::<Task<C>>();
    let ticket = Ticket { tx };
    let worker_ticket = ticket.clone();

    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut state = init(worker_ticket);
            run_loop(&mut state, rx);
        })
        .expect("failed to spawn owner worker thread");

    (ticket, join)
}

fn run_loop<C: WorkerState>(state: &mut C, rx: Receiver<Task<C>>) {
    loop {
        let now = Instant::now();
        while let Some(key) = state.timers().pop_due(now) {
            state.on_timer(key);
            if state.finished() {
                return;
            }
        }
        if state.finished() {
            return;
        }

        let task = match state.timers().next_deadline() {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(task) => Some(task),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(task) => Some(task),
                Err(_) => return,
            },
        };

        if let Some(task) = task {
            task(state);
            if state.finished() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_queue_fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(TimerKey::StallGrace, Duration::from_millis(20));
        timers.schedule(TimerKey::FastForwardGrace, Duration::from_millis(5));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(timers.pop_due(later), Some(TimerKey::FastForwardGrace));
        assert_eq!(timers.pop_due(later), Some(TimerKey::StallGrace));
        assert_eq!(timers.pop_due(later), None);
    }

    #[test]
    fn test_timer_queue_cancel_and_rearm() {
        let mut timers = TimerQueue::new();
        timers.schedule(TimerKey::SnapshotTick, Duration::from_millis(1));
        assert!(timers.is_active(&TimerKey::SnapshotTick));

        timers.cancel(&TimerKey::SnapshotTick);
        assert!(!timers.is_active(&TimerKey::SnapshotTick));
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.pop_due(later), None);

        // Re-arming replaces the stale heap entry.
        timers.schedule(TimerKey::SnapshotTick, Duration::from_millis(1));
        timers.schedule(TimerKey::SnapshotTick, Duration::from_millis(2));
        assert_eq!(timers.pop_due(later), Some(TimerKey::SnapshotTick));
        assert_eq!(timers.pop_due(later), None);
    }

    #[test]
    fn test_timer_queue_not_due_yet() {
        let mut timers = TimerQueue::new();
        timers.schedule(TimerKey::StallGrace, Duration::from_secs(60));
        assert_eq!(timers.pop_due(Instant::now()), None);
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    struct Counter {
        timers: TimerQueue,
        fired: Vec<TimerKey>,
        done: bool,
    }

    impl WorkerState for Counter {
        fn on_timer(&mut self, key: TimerKey) {
            self.fired.push(key);
            if self.fired.len() == 2 {
                self.done = true;
            }
        }
        fn timers(&mut self) -> &mut TimerQueue {
            &mut self.timers
        }
        fn finished(&self) -> bool {
            self.done
        }
    }

    #[test]
    fn test_worker_runs_tasks_and_timers() {
        let (ticket, join) = spawn("test-worker", |_ticket| Counter {
            timers: TimerQueue::new(),
            fired: Vec::new(),
            done: false,
        });

        assert!(ticket.post(|c: &mut Counter| {
            c.timers.schedule(TimerKey::StallGrace, Duration::from_millis(5));
            c.timers
                .schedule(TimerKey::SnapshotTick, Duration::from_millis(10));
        }));

        join.join().unwrap();
        // The worker exits via finished(); posting afterwards is a no-op.
        assert!(!ticket.post(|_c: &mut Counter| {}));
    }

    #[test]
    fn test_call_roundtrip() {
        let (ticket, join) = spawn("test-call", |_ticket| Counter {
            timers: TimerQueue::new(),
            fired: Vec::new(),
            done: false,
        });

        let n = ticket.call(|c: &mut Counter| {
            c.fired.push(TimerKey::Stop);
            c.fired.len()
        });
        assert_eq!(n, Some(1));

        ticket.post(|c: &mut Counter| c.done = true);
        join.join().unwrap();
    }
}
