mod error;
mod ledger;

pub use error::StoreError;
pub use ledger::Ledger;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

// ── Store seam ───────────────────────────────────────────

/// Durable booking storage. The reservation core relies on it for atomicity: a
/// transaction's overlap read and its insert are indivisible with respect to every
/// other transaction and every cancel.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Open a transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError>;

    /// Confirmed bookings overlapping `span`, sorted by start.
    async fn confirmed_overlapping(&self, span: Span) -> Result<Vec<Booking>, StoreError>;

    /// Single-row conditional update: `status = CANCELLED WHERE id = ? AND status = CONFIRMED`.
    async fn cancel_if_confirmed(&self, id: Ulid) -> Result<CancelOutcome, StoreError>;

    /// A user's bookings, newest first.
    async fn bookings_for_user(&self, user_id: &str) -> Result<Vec<BookingRecord>, StoreError>;

    /// All bookings matching `filter`, newest first.
    async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>, StoreError>;
}

#[async_trait]
pub trait StoreTxn: Send {
    /// Confirmed bookings overlapping `span`, as seen by this transaction.
    async fn confirmed_overlapping(&mut self, span: Span) -> Result<Vec<Booking>, StoreError>;

    /// Stage a booking and its payment. Constraints are checked immediately.
    /// One reservation per transaction.
    fn insert_reservation(&mut self, booking: Booking, payment: Payment) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Booking),
    NotFound,
    NotConfirmed(BookingStatus),
}

/// Operator listing filter. Dates compare against `resource_date`, both ends inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.from.is_none_or(|d| booking.resource_date >= d)
            && self.to.is_none_or(|d| booking.resource_date <= d)
            && self.status.is_none_or(|s| booking.status == s)
    }
}

fn newest_first(records: &mut [BookingRecord]) {
    records.sort_by(|a, b| {
        b.booking
            .created_at
            .cmp(&a.booking.created_at)
            .then(b.booking.id.cmp(&a.booking.id))
    });
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, fsync once,
/// answer everyone in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                if handle_non_append(&mut wal, other) {
                    return;
                }
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred
            && handle_non_append(&mut wal, cmd)
        {
            return;
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

/// Returns true when the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
            false
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            false
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            true
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::WalError(e.to_string()))
}

/// Append `event` and apply it to the ledger while holding `guard`, on a task of its
/// own. Once the event is handed to the writer it may become durable, so the apply
/// must happen even if the caller is dropped mid-await.
async fn append_and_apply(
    guard: OwnedRwLockWriteGuard<Ledger>,
    wal_tx: mpsc::Sender<WalCommand>,
    event: Event,
) -> Result<OwnedRwLockWriteGuard<Ledger>, StoreError> {
    let task = tokio::spawn(async move {
        let mut guard = guard;
        wal_append(&wal_tx, event.clone()).await?;
        guard.apply(&event);
        Ok::<_, StoreError>(guard)
    });
    task.await
        .map_err(|e| StoreError::WalError(format!("append task failed: {e}")))?
}

// ── WAL-backed store ─────────────────────────────────────

/// Single-resource store: one ledger behind one lock, persisted to one WAL.
///
/// Transactions take the ledger's write lock for their whole lifetime (the
/// equivalent of `SELECT ... FOR UPDATE` on the resource row). Waiting longer than
/// `lock_timeout` aborts the transaction.
pub struct WalStore {
    ledger: Arc<RwLock<Ledger>>,
    wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a tokio runtime.
    ///
    /// Records that would break a store constraint are logged and skipped.
    pub fn open(path: &Path, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let mut ledger = Ledger::new();
        let mut skipped = 0usize;
        for event in &events {
            if let Err(e) = ledger.replay(event) {
                tracing::warn!("skipping WAL record that violates a store constraint: {e}");
                skipped += 1;
            }
        }
        tracing::info!(
            "replayed {} WAL records ({skipped} skipped), {} bookings",
            events.len(),
            ledger.len()
        );

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            ledger: Arc::new(RwLock::new(ledger)),
            wal_tx,
            lock_timeout,
        })
    }

    async fn lock_write(&self) -> Result<OwnedRwLockWriteGuard<Ledger>, StoreError> {
        tokio::time::timeout(self.lock_timeout, self.ledger.clone().write_owned())
            .await
            .map_err(|_| StoreError::Aborted("lock wait timeout"))
    }

    /// Rewrite the WAL as one record per booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // Every append happens under the write lock, so holding the read lock across
        // snapshot and swap keeps appends from landing in the discarded file.
        let guard = self.ledger.read().await;
        let events = guard.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Flush and stop the writer. Later writes fail with `WalError`.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        // Writers hold the lock until their append is acknowledged.
        let _guard = self.ledger.write().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer already stopped".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError> {
        let guard = self.lock_write().await?;
        Ok(Box::new(WalTxn {
            guard,
            wal_tx: self.wal_tx.clone(),
            staged: None,
        }))
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self.ledger.read().await.record(&id))
    }

    async fn confirmed_overlapping(&self, span: Span) -> Result<Vec<Booking>, StoreError> {
        let guard = self.ledger.read().await;
        Ok(guard.overlapping_confirmed(&span).cloned().collect())
    }

    async fn cancel_if_confirmed(&self, id: Ulid) -> Result<CancelOutcome, StoreError> {
        let guard = self.lock_write().await?;
        let status = match guard.booking(&id) {
            None => return Ok(CancelOutcome::NotFound),
            Some(b) => b.status,
        };
        if status != BookingStatus::Confirmed {
            return Ok(CancelOutcome::NotConfirmed(status));
        }
        let event = Event::BookingCancelled { id };
        let guard = append_and_apply(guard, self.wal_tx.clone(), event).await?;
        match guard.booking(&id) {
            Some(b) => Ok(CancelOutcome::Cancelled(b.clone())),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn bookings_for_user(&self, user_id: &str) -> Result<Vec<BookingRecord>, StoreError> {
        let guard = self.ledger.read().await;
        let mut records: Vec<BookingRecord> =
            guard.records().filter(|r| r.booking.user_id == user_id).collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>, StoreError> {
        let guard = self.ledger.read().await;
        let mut records: Vec<BookingRecord> =
            guard.records().filter(|r| filter.matches(&r.booking)).collect();
        newest_first(&mut records);
        Ok(records)
    }
}

pub struct WalTxn {
    guard: OwnedRwLockWriteGuard<Ledger>,
    wal_tx: mpsc::Sender<WalCommand>,
    staged: Option<Event>,
}

#[async_trait]
impl StoreTxn for WalTxn {
    async fn confirmed_overlapping(&mut self, span: Span) -> Result<Vec<Booking>, StoreError> {
        Ok(self.guard.overlapping_confirmed(&span).cloned().collect())
    }

    fn insert_reservation(&mut self, booking: Booking, payment: Payment) -> Result<(), StoreError> {
        if self.staged.is_some() {
            return Err(StoreError::UniqueViolation("transaction.reservation"));
        }
        self.guard.check_insert(&booking, &payment)?;
        self.staged = Some(Event::ReservationCommitted { booking, payment });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let WalTxn { guard, wal_tx, staged } = *self;
        let Some(event) = staged else {
            return Ok(());
        };
        append_and_apply(guard, wal_tx, event).await.map(drop)
    }
}
