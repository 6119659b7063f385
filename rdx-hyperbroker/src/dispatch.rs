//! Executes batches of subscriber callbacks on behalf of raised channels.
//!
//! A raise never runs callbacks itself. It hands a snapshot of its subscribers
//! to whatever [`Dispatch`] implementation is installed. The stock
//! implementation, [`TickDispatcher`], keeps an explicit queue of pending
//! batches that is drained by an externally driven [`TickDispatcher::tick`],
//! usually called once per engine tick by the `BrokerEngine`.

use crate::common::{BatchId, Callback};
use parking_lot::Mutex;
use serde::Deserialize;
use slotmap::SlotMap;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Anything that can take ownership of a batch of callbacks and run them.
///
/// Returns the id of the queued batch, or `None` when nothing was left
/// pending (the batch was empty or ran synchronously).
pub trait Dispatch: Send + Sync {
    /// Takes ownership of `batch`, running it now or queueing it for later.
    fn dispatch(&self, batch: Vec<Callback>) -> Option<BatchId>;
}

impl<F> Dispatch for F
where
    F: Fn(Vec<Callback>) -> Option<BatchId> + Send + Sync,
{
    fn dispatch(&self, batch: Vec<Callback>) -> Option<BatchId> {
        self(batch)
    }
}

/// How a `TickDispatcher` spreads a raised batch over ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Run the whole batch inside `dispatch`. Nothing is ever queued.
    Immediate,
    /// Each tick runs a single callback from the oldest pending batch.
    #[default]
    OnePerTick,
    /// Each tick runs the whole of the oldest pending batch.
    Batched,
}

/// What a call to `tick` or `drain` actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Callbacks executed, including those that panicked.
    pub invoked: usize,
    /// Callbacks that panicked. Their panics were caught and logged.
    pub panicked: usize,
    /// Callbacks still queued afterwards.
    pub pending: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.invoked += other.invoked;
        self.panicked += other.panicked;
        self.pending = other.pending;
    }
}

#[derive(Default)]
struct DispatchQueue {
    batches: SlotMap<BatchId, VecDeque<Callback>>,
    order: VecDeque<BatchId>,
}

impl DispatchQueue {
    fn push(&mut self, batch: Vec<Callback>) -> BatchId {
        let id = self.batches.insert(batch.into());
        self.order.push_back(id);
        id
    }

    /// Pops the front of the oldest live batch. Cancelled ids are skipped.
    fn next_callback(&mut self) -> Option<Callback> {
        loop {
            let id = *self.order.front()?;
            let Some(batch) = self.batches.get_mut(id) else {
                self.order.pop_front();
                continue;
            };
            let callback = batch.pop_front();
            if batch.is_empty() {
                self.batches.remove(id);
                self.order.pop_front();
            }
            if callback.is_some() {
                return callback;
            }
        }
    }

    fn next_batch(&mut self) -> Option<VecDeque<Callback>> {
        while let Some(id) = self.order.pop_front() {
            if let Some(batch) = self.batches.remove(id) {
                return Some(batch);
            }
        }
        None
    }

    fn cancel(&mut self, id: BatchId) -> Option<usize> {
        self.batches.remove(id).map(|batch| batch.len())
    }

    fn pending_callbacks(&self) -> usize {
        self.batches.values().map(VecDeque::len).sum()
    }
}

/// A queue of pending callback batches drained by explicit ticks.
///
/// Cloning a `TickDispatcher` yields another handle to the same queue, so the
/// broker can hold one handle while the engine ticks another.
#[derive(Clone, Default)]
pub struct TickDispatcher {
    policy: DispatchPolicy,
    queue: Arc<Mutex<DispatchQueue>>,
}

impl TickDispatcher {
    /// Creates an empty dispatcher with the given policy.
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            queue: Arc::new(Mutex::new(DispatchQueue::default())),
        }
    }

    /// The policy this dispatcher was created with.
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Returns a shareable handle suitable for `Broker::set_dispatcher`.
    pub fn as_dispatch(&self) -> Arc<dyn Dispatch> {
        Arc::new(self.clone())
    }

    /// Advances the queue by one tick according to the policy.
    ///
    /// Callbacks run with no lock held, so they are free to raise channels
    /// (which enqueues new batches behind the current ones).
    pub fn tick(&self) -> TickReport {
        let work: Vec<Callback> = {
            let mut queue = self.queue.lock();
            match self.policy {
                DispatchPolicy::Immediate => Vec::new(),
                DispatchPolicy::OnePerTick => queue.next_callback().into_iter().collect(),
                DispatchPolicy::Batched => queue.next_batch().map(Vec::from).unwrap_or_default(),
            }
        };
        let mut report = execute(&work);
        report.pending = self.pending_callbacks();
        report
    }

    /// Runs every pending batch in FIFO order, regardless of policy.
    ///
    /// Batches raised by callbacks during the drain are drained as well.
    pub fn drain(&self) -> TickReport {
        let mut report = TickReport::default();
        loop {
            let batch = self.queue.lock().next_batch();
            let Some(batch) = batch else { break };
            report.merge(execute(&Vec::from(batch)));
        }
        report.pending = self.pending_callbacks();
        report
    }

    /// Drops a pending batch before it runs.
    ///
    /// Returns `false` when the batch already finished or was never queued.
    /// A batch already partially drained under `OnePerTick` loses only its
    /// remaining callbacks.
    pub fn cancel(&self, id: BatchId) -> bool {
        match self.queue.lock().cancel(id) {
            Some(dropped) => {
                warn!(?id, dropped, "pending batch cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of batches still waiting, partially drained ones included.
    pub fn pending_batches(&self) -> usize {
        self.queue.lock().batches.len()
    }

    /// Number of callbacks still waiting across all batches.
    pub fn pending_callbacks(&self) -> usize {
        self.queue.lock().pending_callbacks()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().batches.is_empty()
    }
}

impl Dispatch for TickDispatcher {
    fn dispatch(&self, batch: Vec<Callback>) -> Option<BatchId> {
        if batch.is_empty() {
            return None;
        }
        if self.policy == DispatchPolicy::Immediate {
            execute(&batch);
            return None;
        }
        let size = batch.len();
        let id = self.queue.lock().push(batch);
        debug!(?id, size, policy = ?self.policy, "batch queued");
        Some(id)
    }
}

/// Runs every callback in order, isolating each one's panic.
fn execute(callbacks: &[Callback]) -> TickReport {
    let mut report = TickReport::default();
    for callback in callbacks {
        report.invoked += 1;
        if !invoke_isolated(callback) {
            report.panicked += 1;
        }
    }
    report
}

/// Invokes one callback. Returns `false` if it panicked.
fn invoke_isolated(callback: &Callback) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(()) => true,
        Err(cause) => {
            error!(cause = %panic_message(cause.as_ref()), "subscriber callback panicked");
            false
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Callback {
        let log = log.clone();
        Arc::new(move || log.lock().push(tag))
    }

    #[test]
    fn one_per_tick_runs_a_single_callback_each_tick() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::OnePerTick);
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.dispatch(vec![recorder(&log, 1), recorder(&log, 2)]);
        dispatcher.dispatch(vec![recorder(&log, 3)]);
        assert_eq!(dispatcher.pending_callbacks(), 3);

        let report = dispatcher.tick();
        assert_eq!(report.invoked, 1);
        assert_eq!(report.pending, 2);
        assert_eq!(*log.lock(), vec![1]);

        dispatcher.tick();
        dispatcher.tick();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert!(dispatcher.is_idle());
        assert_eq!(dispatcher.tick(), TickReport::default());
    }

    #[test]
    fn batched_runs_one_batch_each_tick() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::Batched);
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.dispatch(vec![recorder(&log, 1), recorder(&log, 2)]);
        dispatcher.dispatch(vec![recorder(&log, 3)]);

        assert_eq!(dispatcher.tick().invoked, 2);
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(dispatcher.pending_batches(), 1);
        dispatcher.tick();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn immediate_runs_inside_dispatch() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::Immediate);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = dispatcher.dispatch(vec![recorder(&log, 7), recorder(&log, 8)]);
        assert!(id.is_none());
        assert_eq!(*log.lock(), vec![7, 8]);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn empty_batches_are_not_queued() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::OnePerTick);
        assert!(dispatcher.dispatch(Vec::new()).is_none());
        assert_eq!(dispatcher.pending_batches(), 0);
    }

    #[test]
    fn cancelled_batch_never_runs() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::OnePerTick);
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = dispatcher.dispatch(vec![recorder(&log, 1), recorder(&log, 2)]).unwrap();
        dispatcher.dispatch(vec![recorder(&log, 3)]);

        dispatcher.tick();
        assert!(dispatcher.cancel(first));
        assert!(!dispatcher.cancel(first));

        let report = dispatcher.drain();
        assert_eq!(report.invoked, 1);
        assert_eq!(*log.lock(), vec![1, 3]);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_batch() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::Batched);
        let hits = Arc::new(AtomicUsize::new(0));
        let before = hits.clone();
        let after = hits.clone();
        let batch: Vec<Callback> = vec![
            Arc::new(move || {
                before.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|| panic!("subscriber blew up")),
            Arc::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
            }),
        ];
        dispatcher.dispatch(batch);

        let report = dispatcher.tick();
        assert_eq!(report.invoked, 3);
        assert_eq!(report.panicked, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_picks_up_batches_raised_while_draining() {
        let dispatcher = TickDispatcher::new(DispatchPolicy::OnePerTick);
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = dispatcher.clone();
        let nested = recorder(&log, 2);
        let outer_log = log.clone();
        dispatcher.dispatch(vec![Arc::new(move || {
            outer_log.lock().push(1);
            inner.dispatch(vec![nested.clone()]);
        })]);

        let report = dispatcher.drain();
        assert_eq!(report.invoked, 2);
        assert_eq!(report.pending, 0);
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn closures_are_dispatchers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let dispatch = move |batch: Vec<Callback>| -> Option<BatchId> {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            None
        };
        let batch: Vec<Callback> = vec![Arc::new(|| {}), Arc::new(|| {})];
        dispatch.dispatch(batch);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
