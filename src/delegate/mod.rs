// # Delegated Scan
//
// A helper thread walks a relation and streams tuple identifiers back
// to the executing thread through a bounded batch. The two sides meet
// over one mutex/condvar pair:
//
// - the producer appends to the shared batch, blocking while the batch
//   would exceed the transfer cap;
// - the consumer swaps the whole batch out when its private copy runs
//   dry;
// - shutdown is a two-phase handshake (`collector_done`, then
//   `delegate_done`) so neither side exits with the other still
//   parked.
//
// Every wait is time-bounded and re-checks the query-cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::common::ItemPointer;
use crate::error::{DbError, Result};

/// Default cap on tuple ids buffered between the threads.
pub const DEFAULT_TRANSFER_MAX: usize = 16 * 1024;

const DELEGATE_WAIT_CYCLE: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideState {
    Running,
    Waiting,
    Signaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Collector,
    Delegate,
}

struct DelegateState {
    items: Vec<ItemPointer>,
    /// Producer has no more batches to offer.
    producer_finished: bool,
    /// Consumer has shut the channel.
    collector_done: bool,
    /// Producer acknowledged the shutdown.
    delegate_done: bool,
    collector_state: SideState,
    delegate_state: SideState,
}

/// The shared channel object.
pub struct Delegate {
    state: Mutex<DelegateState>,
    gate: Condvar,
    transfer_max: usize,
    cancel: Arc<AtomicBool>,
}

impl Delegate {
    fn new(transfer_max: usize, cancel: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(DelegateState {
                items: Vec::new(),
                producer_finished: false,
                collector_done: false,
                delegate_done: false,
                collector_state: SideState::Running,
                delegate_state: SideState::Running,
            }),
            gate: Condvar::new(),
            transfer_max,
            cancel,
        }
    }

    fn signal(&self, st: &mut DelegateState, side: Side) {
        let slot = match side {
            Side::Collector => &mut st.collector_state,
            Side::Delegate => &mut st.delegate_state,
        };
        if *slot == SideState::Waiting {
            *slot = SideState::Signaled;
        }
        self.gate.notify_all();
    }

    /// Park `side` until signaled. With `cancellable`, a pending query
    /// cancel aborts the wait.
    fn wait(
        &self,
        st: &mut MutexGuard<'_, DelegateState>,
        side: Side,
        cancellable: bool,
    ) -> Result<()> {
        {
            let slot = match side {
                Side::Collector => &mut st.collector_state,
                Side::Delegate => &mut st.delegate_state,
            };
            *slot = SideState::Waiting;
        }
        loop {
            let timed_out = self.gate.wait_for(st, DELEGATE_WAIT_CYCLE).timed_out();
            if cancellable && self.cancel.load(Ordering::Acquire) {
                let slot = match side {
                    Side::Collector => &mut st.collector_state,
                    Side::Delegate => &mut st.delegate_state,
                };
                *slot = SideState::Running;
                return Err(DbError::Cancelled);
            }
            let state = match side {
                Side::Collector => st.collector_state,
                Side::Delegate => st.delegate_state,
            };
            if state == SideState::Signaled || !timed_out {
                break;
            }
        }
        let slot = match side {
            Side::Collector => &mut st.collector_state,
            Side::Delegate => &mut st.delegate_state,
        };
        *slot = SideState::Running;
        Ok(())
    }
}

/// Producer-side view of the channel, handed to the scan function.
pub struct DelegateHandle {
    delegate: Arc<Delegate>,
}

impl DelegateHandle {
    /// Append a batch of tuple ids, blocking while the shared batch is
    /// at capacity. Returns false once the consumer has shut down; the
    /// scan should stop promptly.
    pub fn transfer_pointers(&self, items: &[ItemPointer]) -> Result<bool> {
        if self.delegate.cancel.load(Ordering::Acquire) {
            return Err(DbError::Cancelled);
        }
        let d = &self.delegate;
        let mut st = d.state.lock();

        if st.collector_done {
            return Ok(false);
        }
        while st.items.len() + items.len() > d.transfer_max {
            d.wait(&mut st, Side::Delegate, true)?;
            if st.collector_done {
                return Ok(false);
            }
        }
        st.items.extend_from_slice(items);
        trace!(batch = items.len(), buffered = st.items.len(), "tids transferred");
        d.signal(&mut st, Side::Collector);
        Ok(true)
    }

    /// True if the consumer is currently blocked waiting for tids; a
    /// producer can use this to favor shipping a partial batch early.
    pub fn collector_waiting(&self) -> bool {
        match self.delegate.state.try_lock() {
            Some(st) => st.collector_state == SideState::Waiting,
            None => false,
        }
    }

    /// Producer-side shutdown handshake: waits for the final batch to
    /// be picked up (or the consumer to quit), then acknowledges.
    fn done(&self) {
        let d = &self.delegate;
        let mut st = d.state.lock();
        while !st.collector_done {
            if st.items.is_empty() {
                st.producer_finished = true;
            }
            d.signal(&mut st, Side::Collector);
            if st.collector_done {
                break;
            }
            // Shutdown must finish even under cancellation.
            let _ = d.wait(&mut st, Side::Delegate, false);
        }
        st.items.clear();
        st.producer_finished = true;
        st.delegate_done = true;
        d.signal(&mut st, Side::Collector);
    }
}

/// Consumer-side scan state.
pub struct DelegatedScan {
    delegate: Arc<Delegate>,
    helper: Option<JoinHandle<Result<()>>>,
    local: Vec<ItemPointer>,
    pos: usize,
    total: usize,
}

impl DelegatedScan {
    /// Launch the helper thread running `scan_fn` and return the
    /// consumer handle.
    pub fn start<F>(cancel: Arc<AtomicBool>, scan_fn: F) -> Self
    where
        F: FnOnce(&DelegateHandle) -> Result<()> + Send + 'static,
    {
        Self::start_with_cap(cancel, DEFAULT_TRANSFER_MAX, scan_fn)
    }

    pub fn start_with_cap<F>(cancel: Arc<AtomicBool>, transfer_max: usize, scan_fn: F) -> Self
    where
        F: FnOnce(&DelegateHandle) -> Result<()> + Send + 'static,
    {
        let delegate = Arc::new(Delegate::new(transfer_max.max(1), cancel));
        let producer = DelegateHandle {
            delegate: delegate.clone(),
        };
        let helper = std::thread::Builder::new()
            .name("delegated-scan".into())
            .spawn(move || {
                // The shutdown handshake must run even if the scan
                // panics, or the consumer would wait on it forever.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    scan_fn(&producer)
                }));
                producer.done();
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DbError::Internal("delegated scan panicked".into())),
                }
            })
            .expect("spawn delegated-scan helper");

        Self {
            delegate,
            helper: Some(helper),
            local: Vec::new(),
            pos: 0,
            total: 0,
        }
    }

    /// Pop the next tuple id in producer-emission order. `Ok(None)`
    /// marks the end of the scan.
    pub fn next(&mut self) -> Result<Option<ItemPointer>> {
        if self.delegate.cancel.load(Ordering::Acquire) {
            return Err(DbError::Cancelled);
        }
        if self.pos == self.local.len() && !self.collect_pointers()? {
            return Ok(None);
        }
        let tid = self.local[self.pos];
        self.pos += 1;
        Ok(Some(tid))
    }

    /// Tuple ids delivered so far.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Refill the private batch from the shared one, blocking on the
    /// producer. Returns false at end of scan.
    fn collect_pointers(&mut self) -> Result<bool> {
        let d = self.delegate.clone();
        let mut st = d.state.lock();

        self.local.clear();
        self.pos = 0;

        // The producer may be parked waiting for pickup.
        d.signal(&mut st, Side::Delegate);

        while st.items.is_empty() {
            if st.producer_finished {
                return Ok(false);
            }
            d.wait(&mut st, Side::Collector, true)?;
        }

        std::mem::swap(&mut self.local, &mut st.items);
        self.total += self.local.len();
        d.signal(&mut st, Side::Delegate);
        Ok(true)
    }

    /// Shut the channel down and join the helper thread, returning the
    /// scan function's result.
    pub fn end(mut self) -> Result<()> {
        self.shutdown();
        match self.helper.take() {
            Some(helper) => helper
                .join()
                .map_err(|_| DbError::Internal("delegated-scan helper panicked".into()))?,
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        let d = self.delegate.clone();
        let mut st = d.state.lock();
        st.collector_done = true;
        d.signal(&mut st, Side::Delegate);
        while !st.delegate_done {
            let _ = d.wait(&mut st, Side::Collector, false);
        }
    }
}

impl Drop for DelegatedScan {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.take() {
            self.shutdown();
            let _ = helper.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(block: u32, off: u16) -> ItemPointer {
        ItemPointer::new(block, off)
    }

    #[test]
    fn test_tids_arrive_in_emission_order() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut scan = DelegatedScan::start(cancel, |handle| {
            handle.transfer_pointers(&[tid(1, 1), tid(1, 2)])?;
            handle.transfer_pointers(&[tid(2, 1)])?;
            Ok(())
        });

        assert_eq!(scan.next().unwrap(), Some(tid(1, 1)));
        assert_eq!(scan.next().unwrap(), Some(tid(1, 2)));
        assert_eq!(scan.next().unwrap(), Some(tid(2, 1)));
        assert_eq!(scan.next().unwrap(), None);
        assert_eq!(scan.total(), 3);
        scan.end().unwrap();
    }

    #[test]
    fn test_backpressure_bounds_buffered_batch() {
        let cancel = Arc::new(AtomicBool::new(false));
        // Tiny cap: the producer must block until the consumer drains.
        let mut scan = DelegatedScan::start_with_cap(cancel, 4, |handle| {
            for block in 0..32u32 {
                if !handle.transfer_pointers(&[tid(block, 1), tid(block, 2)])? {
                    break;
                }
            }
            Ok(())
        });

        let mut seen = Vec::new();
        while let Some(t) = scan.next().unwrap() {
            seen.push(t);
        }
        assert_eq!(seen.len(), 64);
        for (i, t) in seen.iter().enumerate() {
            assert_eq!(t.block, (i / 2) as u32);
        }
        scan.end().unwrap();
    }

    #[test]
    fn test_early_end_stops_producer() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut scan = DelegatedScan::start_with_cap(cancel, 8, |handle| {
            let mut block = 0u32;
            loop {
                if !handle.transfer_pointers(&[tid(block, 1)])? {
                    return Ok(());
                }
                block += 1;
            }
        });

        // Take a few and bail out; end() must terminate the producer.
        for _ in 0..3 {
            scan.next().unwrap().unwrap();
        }
        scan.end().unwrap();
    }

    #[test]
    fn test_cancellation_unblocks_consumer() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut scan = DelegatedScan::start(cancel.clone(), |handle| {
            handle.transfer_pointers(&[tid(1, 1)])?;
            Ok(())
        });
        assert_eq!(scan.next().unwrap(), Some(tid(1, 1)));

        cancel.store(true, Ordering::Release);
        assert!(matches!(scan.next(), Err(DbError::Cancelled)));
        // Shutdown still joins the helper cleanly.
        let _ = scan.end();
    }

    #[test]
    fn test_drop_joins_helper() {
        let cancel = Arc::new(AtomicBool::new(false));
        let scan = DelegatedScan::start(cancel, |handle| {
            let _ = handle.transfer_pointers(&[tid(9, 9)]);
            Ok(())
        });
        drop(scan);
    }
}
