//! Weighted fair queue for the blob scheduler.
//!
//! Pops favor the highest weight; entries of equal weight leave in arrival
//! order. `add_weight` hands back a future that resolves once a consumer
//! has finished processing the entry, and every pop carries a finish token
//! the consumer must release.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

struct Entry<T> {
    weight: i64,
    seq: u64,
    item: T,
    done: oneshot::Sender<()>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher weight first, then earlier arrival.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
}

/// Resolves when the queued item has been fully processed (or the queue was
/// dropped with the item still in it).
pub struct Finished {
    rx: oneshot::Receiver<()>,
}

impl Finished {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Must be released by the consumer; dropping it releases it too, so a
/// panicking worker does not strand waiters.
pub struct FinishGuard {
    tx: Option<oneshot::Sender<()>>,
}

impl FinishGuard {
    pub fn finish(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct WeightQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Default for WeightQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeightQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_weight(&self, item: T, weight: i64) -> Finished {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            state.heap.push(Entry {
                weight,
                seq,
                item,
                done: tx,
            });
        }
        self.notify.notify_one();
        Finished { rx }
    }

    /// Pop the heaviest entry, waiting for one to arrive. Returns `None`
    /// once `cancel` fires.
    pub async fn get_or_wait(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(T, i64, FinishGuard)> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.heap.pop() {
                    // Chain the wakeup: a single permit may have covered
                    // several pushes.
                    if !state.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some((
                        entry.item,
                        entry.weight,
                        FinishGuard {
                            tx: Some(entry.done),
                        },
                    ));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}
