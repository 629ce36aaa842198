use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use strum::IntoStaticStr;
use time::OffsetDateTime;

use crate::app::state::{Note, NoteId};
use crate::config::SyncOptions;
use crate::remote::{DocumentStore, RemoteResult};
use crate::session::UserId;

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RemoteOp {
    PutAll(Vec<Note>),
    Put(Note),
    Patch(Note),
    Remove(NoteId),
}

impl RemoteOp {
    pub fn label(&self) -> &'static str {
        self.into()
    }

    fn apply(&self, store: &dyn DocumentStore, user: &UserId) -> RemoteResult<()> {
        match self {
            RemoteOp::PutAll(notes) => store.put_all(user, notes),
            RemoteOp::Put(note) => store.put(user, note),
            RemoteOp::Patch(note) => store.patch(user, note),
            RemoteOp::Remove(note_id) => store.remove(user, *note_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteJob {
    pub seq: u64,
    pub epoch: u64,
    pub user: UserId,
    pub op: RemoteOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Applied {
        seq: u64,
        op: &'static str,
        attempts: u32,
    },
    Retrying {
        seq: u64,
        op: &'static str,
        attempt: u32,
        message: String,
    },
    Failed {
        seq: u64,
        op: &'static str,
        attempts: u32,
        message: String,
    },
    /// The session changed after the job was queued; it was never sent.
    Discarded {
        seq: u64,
        op: &'static str,
        epoch: u64,
        current_epoch: u64,
    },
}

#[derive(Debug, Clone)]
pub enum SyncStatus {
    Idle,
    Pending {
        queued: usize,
    },
    Error {
        message: String,
        occurred_at: OffsetDateTime,
    },
}

#[derive(Debug, Clone)]
struct SyncFailure {
    message: String,
    occurred_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Shared {
    epoch: AtomicU64,
    pending: Mutex<usize>,
    idle: Condvar,
    last_error: Mutex<Option<SyncFailure>>,
    subscribers: Mutex<Vec<Sender<SyncEvent>>>,
}

impl Shared {
    fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber and forgets dropped ones.
    fn publish(&self, event: SyncEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Serial background writer for remote document operations. Jobs carry the
/// session epoch they were queued under and are dropped once it goes stale.
pub struct WriteQueue {
    sender: Option<Sender<RemoteJob>>,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl WriteQueue {
    pub fn spawn(store: Arc<dyn DocumentStore>, options: &SyncOptions) -> Result<Self> {
        let (sender, jobs) = bounded::<RemoteJob>(options.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());

        let worker = {
            let shared = Arc::clone(&shared);
            let options = options.clone();
            thread::Builder::new()
                .name("notesync-remote-writer".into())
                .spawn(move || {
                    for job in jobs.iter() {
                        run_job(store.as_ref(), &shared, &options, job);
                        shared.finish_one();
                    }
                    tracing::debug!("remote writer stopped");
                })
                .context("spawning remote writer thread")?
        };

        Ok(Self {
            sender: Some(sender),
            shared,
            next_seq: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Invalidates every job queued so far.
    pub fn advance_epoch(&self) -> u64 {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues `op` for `user` under the current epoch without waiting for it.
    pub fn submit(&self, user: UserId, op: RemoteOp) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let job = RemoteJob {
            seq,
            epoch: self.epoch(),
            user,
            op,
        };
        let label = job.op.label();
        let Some(sender) = self.sender.as_ref() else {
            return seq;
        };

        *self.shared.pending.lock() += 1;
        match sender.try_send(job) {
            Ok(()) => {
                tracing::debug!(seq, op = label, "queued remote write");
            }
            Err(err) => {
                let message = match err {
                    TrySendError::Full(_) => "remote write queue is full".to_string(),
                    TrySendError::Disconnected(_) => "remote writer has stopped".to_string(),
                };
                tracing::error!(seq, op = label, %message, "dropping remote write");
                record_failure(&self.shared, &message);
                self.shared.publish(SyncEvent::Failed {
                    seq,
                    op: label,
                    attempts: 0,
                    message,
                });
                self.shared.finish_one();
            }
        }
        seq
    }

    /// Subscribes to outcomes of jobs finishing from now on. Each call gets
    /// its own channel; dropping the receiver unsubscribes.
    pub fn events(&self) -> Receiver<SyncEvent> {
        self.shared.subscribe()
    }

    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    pub fn status(&self) -> SyncStatus {
        if let Some(failure) = self.shared.last_error.lock().clone() {
            return SyncStatus::Error {
                message: failure.message,
                occurred_at: failure.occurred_at,
            };
        }
        match self.pending() {
            0 => SyncStatus::Idle,
            queued => SyncStatus::Pending { queued },
        }
    }

    /// Blocks until every queued job has finished or `timeout` elapses.
    /// Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self
                .shared
                .idle
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return *pending == 0;
            }
        }
        true
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("remote writer thread panicked");
            }
        }
    }
}

fn run_job(
    store: &dyn DocumentStore,
    shared: &Shared,
    options: &SyncOptions,
    job: RemoteJob,
) {
    let label = job.op.label();
    let mut attempt = 0;
    loop {
        let current_epoch = shared.epoch.load(Ordering::SeqCst);
        if job.epoch != current_epoch {
            tracing::info!(
                seq = job.seq,
                op = label,
                epoch = job.epoch,
                current_epoch,
                "discarding remote write from a previous session"
            );
            record_failure(
                shared,
                &format!("{label} for {} dropped after the session changed", job.user),
            );
            shared.publish(SyncEvent::Discarded {
                seq: job.seq,
                op: label,
                epoch: job.epoch,
                current_epoch,
            });
            return;
        }

        attempt += 1;
        match job.op.apply(store, &job.user) {
            Ok(()) => {
                tracing::debug!(seq = job.seq, op = label, attempt, "remote write applied");
                shared.last_error.lock().take();
                shared.publish(SyncEvent::Applied {
                    seq: job.seq,
                    op: label,
                    attempts: attempt,
                });
                return;
            }
            Err(err) if err.is_retryable() && attempt < options.max_attempts => {
                let message = err.to_string();
                tracing::warn!(seq = job.seq, op = label, attempt, %message, "remote write failed, retrying");
                shared.publish(SyncEvent::Retrying {
                    seq: job.seq,
                    op: label,
                    attempt,
                    message,
                });
                thread::sleep(options.backoff(attempt));
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(seq = job.seq, op = label, attempts = attempt, %message, "remote write failed");
                record_failure(shared, &message);
                shared.publish(SyncEvent::Failed {
                    seq: job.seq,
                    op: label,
                    attempts: attempt,
                    message,
                });
                return;
            }
        }
    }
}

fn record_failure(shared: &Shared, message: &str) {
    *shared.last_error.lock() = Some(SyncFailure {
        message: message.to_string(),
        occurred_at: OffsetDateTime::now_utc(),
    });
}
