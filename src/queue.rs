use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // The set of queue ids the current OS thread is presently executing
    // a task for. Used to make `dispatch_sync` reentrant: a nested call
    // targeting a queue already held by this thread runs inline instead
    // of deadlocking against itself.
    static HELD_QUEUES: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// A FIFO serial execution scope, corresponding to either a `Collection` or
/// the `Store`. At most one task runs on a given queue at a time; tasks on
/// different queues run independently.
///
/// `SerialQueue` is a ticket lock rather than a plain mutex: each dispatch
/// (sync or async) draws a ticket at submission time, in submission order,
/// and waits for its ticket to come up before running. A plain
/// `std::sync::Mutex` makes no FIFO guarantee about which waiter it wakes
/// next, which would let two `dispatch_async` calls submitted in order run
/// out of order; the ticket scheme fixes the order regardless of which
/// thread actually ends up executing each task.
#[derive(Clone)]
pub struct SerialQueue(Arc<Inner>);

struct Inner {
    id: u64,
    state: Mutex<TicketState>,
    turn_taken: Condvar,
}

struct TicketState {
    next_ticket: u64,
    now_serving: u64,
}

/// Advances `now_serving` and wakes waiters when a ticket's task finishes,
/// whether it returns normally or unwinds via panic.
struct AdvanceTicketOnDrop<'a>(&'a SerialQueue);

impl Drop for AdvanceTicketOnDrop<'_> {
    fn drop(&mut self) {
        HELD_QUEUES.with(|held| {
            held.borrow_mut().remove(&self.0 .0.id);
        });
        let mut state = self.0 .0.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.now_serving += 1;
        self.0 .0.turn_taken.notify_all();
    }
}

impl SerialQueue {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TicketState { next_ticket: 0, now_serving: 0 }),
            turn_taken: Condvar::new(),
        }))
    }

    fn held_by_current_thread(&self) -> bool {
        HELD_QUEUES.with(|held| held.borrow().contains(&self.0.id))
    }

    /// Draws the next ticket, in call order. Call sites that must preserve
    /// submission order across both `dispatch_sync` and `dispatch_async`
    /// (the latter drawing its ticket before spawning) rely on this being
    /// taken under the same lock every time.
    fn take_ticket(&self) -> u64 {
        let mut state = self.0.state.lock().unwrap_or_else(|poison| poison.into_inner());
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    /// Blocks until `ticket` is being served, runs `f`, then advances
    /// service to the next ticket and wakes any other waiters. Advancement
    /// happens via a drop guard so a panicking `f` still releases the next
    /// ticket instead of wedging every later waiter forever.
    fn run_ticket<F, T>(&self, ticket: u64, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        {
            let mut state = self.0.state.lock().unwrap_or_else(|poison| poison.into_inner());
            while state.now_serving != ticket {
                state = self
                    .0
                    .turn_taken
                    .wait(state)
                    .unwrap_or_else(|poison| poison.into_inner());
            }
        }

        HELD_QUEUES.with(|held| held.borrow_mut().insert(self.0.id));
        let _advance_on_drop = AdvanceTicketOnDrop(self);
        f()
    }

    /// Runs `f` on this queue, blocking the caller until it completes.
    /// Reentrant: if the calling thread is already executing on this queue,
    /// `f` runs inline rather than drawing a new ticket (which would
    /// otherwise deadlock waiting on itself).
    pub fn dispatch_sync<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        if self.held_by_current_thread() {
            return f();
        }

        let ticket = self.take_ticket();
        self.run_ticket(ticket, f)
    }

    /// Enqueues `f` to run on this queue without blocking the caller. The
    /// ticket is drawn here, synchronously, so that two `dispatch_async`
    /// calls (or a `dispatch_async` interleaved with a `dispatch_sync`) run
    /// in the order they were submitted rather than the order their spawned
    /// threads happen to get scheduled.
    pub fn dispatch_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.clone();
        let ticket = self.take_ticket();
        std::thread::spawn(move || queue.run_ticket(ticket, f));
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Where to run the completion callback of a `begin*` operation. Abstracts
/// the "pass the internal serial queue, or nil for a sensible default"
/// pattern of the original callback-queue API as an explicit target enum.
#[derive(Clone)]
pub enum DispatchTarget {
    /// Run the completion inline, on whichever thread finished the work.
    Inline,
    /// Run the completion on a freshly spawned background thread.
    Background,
    /// Run the completion on the given serial queue (e.g. the collection's
    /// own queue, or a queue owned by the caller's application).
    Custom(SerialQueue),
}

impl DispatchTarget {
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            DispatchTarget::Inline => f(),
            DispatchTarget::Background => {
                std::thread::spawn(f);
            }
            DispatchTarget::Custom(queue) => queue.dispatch_async(f),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn dispatch_sync_runs_inline_and_returns_value() {
        let queue = SerialQueue::new();
        let result = queue.dispatch_sync(|| 2 + 2);
        assert_eq!(result, 4);
    }

    #[test]
    fn dispatch_sync_is_reentrant() {
        let queue = SerialQueue::new();
        let result = queue.dispatch_sync(|| queue.dispatch_sync(|| queue.dispatch_sync(|| 7)));
        assert_eq!(result, 7);
    }

    #[test]
    fn dispatch_sync_serializes_concurrent_callers() {
        let queue = SerialQueue::new();
        let counter = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                let overlap = overlap.clone();
                std::thread::spawn(move || {
                    queue.dispatch_sync(|| {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        if before != 0 {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_millis(2));
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst), "tasks overlapped on one queue");
    }

    #[test]
    fn dispatch_async_eventually_runs() {
        let queue = SerialQueue::new();
        let (tx, rx) = std::sync::mpsc::channel();
        queue.dispatch_async(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn dispatch_async_calls_run_in_submission_order() {
        let queue = SerialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            queue.dispatch_async(move || {
                order.lock().unwrap().push(i);
            });
        }

        // Draining a `dispatch_sync` after the loop waits for every prior
        // ticket (including the 20 async ones) to be served before running.
        queue.dispatch_sync(|| {});

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }
}
