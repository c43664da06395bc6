use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use events::{SnapshotEnvelope, StatusEnvelope};
use log::{debug, warn};

use super::Transport;
use crate::{config::DeliverySettings, helpers::signals::Running};

/// Receives the events produced by probes. Must not block.
pub trait EventSink: Send + Sync {
    fn add_status(&self, status: StatusEnvelope);
    fn add_snapshot(&self, snapshot: SnapshotEnvelope);
}

/// Bounded queue, dropping new events when full.
struct Queue<T> {
    name: &'static str,
    tx: SyncSender<T>,
    dropped: AtomicU64,
}

impl<T> Queue<T> {
    fn new(name: &'static str, capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (
            Self {
                name,
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    fn push(&self, event: T) {
        match self.tx.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("The {} queue is full, dropping event", self.name);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Delivery stopped, dropping {} event", self.name);
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Hand a batch to the transport. A failing transport, panicking included,
/// only loses the batch.
fn dispatch<T, F>(kind: &str, batch: &[T], send: F)
where
    F: FnOnce(&[T]) -> crate::error::Result<()>,
{
    if batch.is_empty() {
        return;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| send(batch))) {
        Ok(Ok(())) => (),
        Ok(Err(e)) => warn!("Could not send {} {kind}(s): {e}", batch.len()),
        Err(_) => warn!("Transport panicked sending {} {kind}(s)", batch.len()),
    }
}

/// Ships status and snapshot events from a dedicated thread.
///
/// Events are queued without blocking; the thread drains both queues in
/// batches and hands them to the transport. A failed batch is dropped.
/// Events still queued when the worker stops are dropped too.
pub struct DeliveryWorker {
    statuses: Queue<StatusEnvelope>,
    snapshots: Queue<SnapshotEnvelope>,
    run_state: Running,
    stop_timeout: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<Receiver<()>>>,
}

impl DeliveryWorker {
    pub fn start(transport: Box<dyn Transport>, settings: &DeliverySettings) -> Result<Self> {
        let capacity = settings.queue_capacity;
        let (statuses, status_rx) = Queue::new("status", capacity);
        let (snapshots, snapshot_rx) = Queue::new("snapshot", capacity);
        let run_state = Running::new();
        let (done_tx, done_rx) = mpsc::channel();

        let running = run_state.clone();
        let idle = settings.idle_interval;
        let thread = thread::Builder::new()
            .name("probekit-delivery".into())
            .spawn(move || {
                while running.running() {
                    // Bounded by the capacity so producers can't keep us
                    // draining forever.
                    let status_batch: Vec<_> = status_rx.try_iter().take(capacity).collect();
                    let snapshot_batch: Vec<_> = snapshot_rx.try_iter().take(capacity).collect();

                    if status_batch.is_empty() && snapshot_batch.is_empty() {
                        thread::park_timeout(idle);
                        continue;
                    }

                    dispatch("status event", &status_batch, |b| transport.send_statuses(b));
                    dispatch("snapshot", &snapshot_batch, |b| transport.send_snapshots(b));
                }
                let _ = done_tx.send(());
            })?;

        debug!("Delivery worker started");
        Ok(Self {
            statuses,
            snapshots,
            run_state,
            stop_timeout: settings.stop_timeout,
            thread: Mutex::new(Some(thread)),
            done: Mutex::new(Some(done_rx)),
        })
    }

    /// Number of status and snapshot events dropped so far.
    pub fn dropped(&self) -> (u64, u64) {
        (self.statuses.dropped(), self.snapshots.dropped())
    }

    /// Stop the worker thread, waiting for it up to the stop timeout. Queued
    /// events are not delivered. Can be called more than once.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().unwrap().take() else {
            return;
        };

        self.run_state.terminate();
        thread.thread().unpark();

        let finished = match self.done.lock().unwrap().take() {
            Some(done) => done.recv_timeout(self.stop_timeout).is_ok(),
            None => false,
        };
        if finished {
            if thread.join().is_err() {
                warn!("Delivery worker panicked");
            }
        } else {
            warn!(
                "Delivery worker did not stop within {}ms, leaving it behind",
                self.stop_timeout.as_millis()
            );
        }

        let (statuses, snapshots) = self.dropped();
        if statuses > 0 || snapshots > 0 {
            warn!("Dropped {statuses} status event(s) and {snapshots} snapshot(s)");
        }
        debug!("Delivery worker stopped");
    }
}

impl EventSink for DeliveryWorker {
    fn add_status(&self, status: StatusEnvelope) {
        self.statuses.push(status);
    }

    fn add_snapshot(&self, snapshot: SnapshotEnvelope) {
        self.snapshots.push(snapshot);
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
