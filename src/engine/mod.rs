mod booking;
mod bulk;
mod conflict;
mod error;
mod materialize;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::{EngineError, ErrorKind};

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::journal::Journal;
use crate::model::*;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite the journal as a snapshot of the state it describes.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut journal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut journal, other);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_batch(journal: &mut Journal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event))
        .and_then(|()| journal.flush_sync());
    if result.is_err() {
        roll_back(journal);
    }
    result
}

/// The whole batch failed, so none of it may survive a replay.
fn roll_back(journal: &mut Journal) {
    if let Err(e) = journal.rollback() {
        error!(error = %e, "journal rollback failed, refusing further appends");
    } else {
        warn!("journal batch rolled back");
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { response } => {
            let _ = response.send(compact(journal));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { event, response } => {
            let result = journal
                .append_buffered(&event)
                .and_then(|()| journal.flush_sync());
            if result.is_err() {
                roll_back(journal);
            }
            let _ = response.send(result);
        }
    }
}

/// Runs on the writer task, so no append can land between reading the
/// journal and swapping in the snapshot.
fn compact(journal: &mut Journal) -> io::Result<usize> {
    let events = Journal::replay(journal.path())?;
    let snapshot = snapshot_events(&rebuild(&events));
    Journal::write_compact_file(journal.path(), &snapshot)?;
    journal.swap_compact_file()?;
    Ok(snapshot.len())
}

async fn journal_append(tx: &mpsc::Sender<JournalCommand>, event: &Event) -> Result<(), EngineError> {
    let (response, rx) = oneshot::channel();
    tx.send(JournalCommand::Append {
        event: event.clone(),
        response,
    })
    .await
    .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
        .map_err(|e| EngineError::Journal(e.to_string()))
}

// ── Cross-provider indexes ───────────────────────────────

/// A confirmed booking as seen from its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ClientBooking {
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Default)]
pub(super) struct ClientEntry {
    /// Every booking the client ever made, with the provider holding it.
    pub all: Vec<(Ulid, Ulid)>,
    pub confirmed: Vec<ClientBooking>,
}

/// Lookups that cut across provider partitions. Mutated only while the
/// owning provider's partition is write-locked.
#[derive(Debug, Default)]
pub(super) struct Index {
    /// slot or booking id → provider id
    pub entity_to_provider: DashMap<Ulid, Ulid>,
    pub clients: DashMap<Ulid, ClientEntry>,
}

impl Index {
    fn confirm(&self, client_id: Ulid, provider_id: Ulid, entry: ClientBooking) {
        let mut client = self.clients.entry(client_id).or_default();
        if !client.all.iter().any(|(b, _)| *b == entry.booking_id) {
            client.all.push((entry.booking_id, provider_id));
        }
        client.confirmed.push(entry);
    }

    fn record(&self, client_id: Ulid, provider_id: Ulid, booking_id: Ulid) {
        let mut client = self.clients.entry(client_id).or_default();
        if !client.all.iter().any(|(b, _)| *b == booking_id) {
            client.all.push((booking_id, provider_id));
        }
    }

    fn release(&self, client_id: Ulid, booking_id: Ulid) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.confirmed.retain(|c| c.booking_id != booking_id);
        }
    }

    pub fn client_confirmed(&self, client_id: &Ulid) -> Vec<ClientBooking> {
        self.clients
            .get(client_id)
            .map(|c| c.confirmed.clone())
            .unwrap_or_default()
    }

    pub fn client_bookings(&self, client_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        self.clients
            .get(client_id)
            .map(|c| c.all.clone())
            .unwrap_or_default()
    }
}

fn cancel_booking_record(
    ps: &mut ProviderState,
    booking_id: &Ulid,
    at: Ms,
    comment: Option<&String>,
    index: &Index,
) -> Option<Ulid> {
    let booking = ps.bookings.get_mut(booking_id)?;
    if booking.status == BookingStatus::Cancelled {
        return None;
    }
    booking.status = BookingStatus::Cancelled;
    booking.cancelled_at = Some(at);
    if let Some(reason) = comment {
        booking.comment = reason.clone();
    }
    let (slot_id, client_id) = (booking.slot_id, booking.client_id);
    ps.active_by_slot.remove(&slot_id);
    index.release(client_id, *booking_id);
    Some(slot_id)
}

/// Apply an event to a provider partition (no locking, the caller holds the lock).
pub(super) fn apply_event(ps: &mut ProviderState, event: &Event, index: &Index) {
    match event {
        Event::SlotsCreated { slots, .. } => {
            for slot in slots {
                index.entity_to_provider.insert(slot.id, ps.id);
                ps.insert_slot(slot.clone());
            }
        }
        Event::SlotDeleted { slot_id, .. } => {
            ps.remove_slot(*slot_id);
            index.entity_to_provider.remove(slot_id);
        }
        Event::SlotWithdrawn {
            slot_id,
            booking_id,
            at,
            ..
        } => {
            if let Some(bid) = booking_id {
                cancel_booking_record(ps, bid, *at, None, index);
            }
            if let Some(slot) = ps.slot_mut(slot_id) {
                slot.status = SlotStatus::Cancelled;
            }
        }
        Event::BookingConfirmed { booking, .. } => {
            let span = match ps.slot_mut(&booking.slot_id) {
                Some(slot) => {
                    slot.status = SlotStatus::Booked;
                    slot.span
                }
                None => return,
            };
            index.entity_to_provider.insert(booking.id, ps.id);
            index.confirm(
                booking.client_id,
                ps.id,
                ClientBooking {
                    booking_id: booking.id,
                    slot_id: booking.slot_id,
                    span,
                },
            );
            ps.active_by_slot.insert(booking.slot_id, booking.id);
            ps.bookings.insert(booking.id, booking.clone());
        }
        Event::BookingCancelled { booking_id, at, .. } => {
            if let Some(slot_id) = cancel_booking_record(ps, booking_id, *at, None, index)
                && let Some(slot) = ps.slot_mut(&slot_id)
                && slot.status == SlotStatus::Booked
            {
                slot.status = SlotStatus::Planned;
            }
        }
        Event::ProviderSlotsCancelled {
            slot_ids,
            booking_ids,
            reason,
            at,
            ..
        } => {
            for bid in booking_ids {
                cancel_booking_record(ps, bid, *at, reason.as_ref(), index);
            }
            for sid in slot_ids {
                if let Some(slot) = ps.slot_mut(sid) {
                    slot.status = SlotStatus::Cancelled;
                }
            }
        }
        Event::BookingsRestored { bookings, .. } => {
            for booking in bookings {
                index.entity_to_provider.insert(booking.id, ps.id);
                index.record(booking.client_id, ps.id, booking.id);
                if booking.is_active() {
                    ps.active_by_slot.insert(booking.slot_id, booking.id);
                    if booking.status == BookingStatus::Confirmed
                        && let Some(slot) = ps.slot(&booking.slot_id)
                    {
                        let span = slot.span;
                        index.confirm(
                            booking.client_id,
                            ps.id,
                            ClientBooking {
                                booking_id: booking.id,
                                slot_id: booking.slot_id,
                                span,
                            },
                        );
                    }
                }
                ps.bookings.insert(booking.id, booking.clone());
            }
        }
    }
}

fn replay_into(events: &[Event], index: &Index) -> HashMap<Ulid, ProviderState> {
    let mut providers: HashMap<Ulid, ProviderState> = HashMap::new();
    for event in events {
        let pid = event.provider_id();
        let ps = providers
            .entry(pid)
            .or_insert_with(|| ProviderState::new(pid));
        apply_event(ps, event, index);
    }
    providers
}

/// Provider states described by a journal's events.
pub fn rebuild(events: &[Event]) -> HashMap<Ulid, ProviderState> {
    replay_into(events, &Index::default())
}

/// Minimal event list recreating `providers`: one `SlotsCreated` carrying
/// current statuses and one `BookingsRestored` per provider.
pub fn snapshot_events(providers: &HashMap<Ulid, ProviderState>) -> Vec<Event> {
    let mut ids: Vec<&Ulid> = providers.keys().collect();
    ids.sort();
    let mut events = Vec::new();
    for id in ids {
        let ps = &providers[id];
        if !ps.slots.is_empty() {
            events.push(Event::SlotsCreated {
                provider_id: ps.id,
                slots: ps.slots.clone(),
            });
        }
        if !ps.bookings.is_empty() {
            let mut bookings: Vec<Booking> = ps.bookings.values().cloned().collect();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            events.push(Event::BookingsRestored {
                provider_id: ps.id,
                bookings,
            });
        }
    }
    events
}

// ── Per-client booking locks ─────────────────────────────

type ClientLocks = DashMap<Ulid, Arc<Mutex<()>>>;

/// One client's booking mutex, held. On drop the mutex is released and the
/// client's entry removed unless another attempt is already waiting on it.
pub(super) struct ClientPermit {
    client_id: Ulid,
    locks: Arc<ClientLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ClientPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Cloning a mutex out of the map takes the same shard lock, so a
        // count of one here means no attempt holds or awaits it.
        self.locks
            .remove_if(&self.client_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) providers: DashMap<Ulid, SharedProviderState>,
    pub(super) index: Arc<Index>,
    client_locks: Arc<ClientLocks>,
    journal_tx: mpsc::Sender<JournalCommand>,
    span: tracing::Span,
}

impl Engine {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        Self::open_with_span(path, tracing::info_span!("slotbook_engine"))
    }

    /// Replays the journal at `path` and starts its writer task. Must be
    /// called inside a tokio runtime. Every event the engine logs is a child
    /// of `span`.
    pub fn open_with_span(path: &Path, span: tracing::Span) -> Result<Self, EngineError> {
        let events = Journal::replay(path).map_err(|e| EngineError::Journal(e.to_string()))?;
        let journal = Journal::open(path).map_err(|e| EngineError::Journal(e.to_string()))?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let index = Arc::new(Index::default());
        let providers = DashMap::new();
        for (id, ps) in replay_into(&events, &index) {
            providers.insert(id, Arc::new(RwLock::new(ps)));
        }
        info!(parent: &span, events = events.len(), providers = providers.len(), "journal replayed");

        Ok(Self {
            providers,
            index,
            client_locks: Arc::new(ClientLocks::new()),
            journal_tx,
            span,
        })
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn provider_or_create(&self, id: Ulid) -> SharedProviderState {
        self.providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .clone()
    }

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// Lookup entity → provider, get the partition, acquire its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: Ulid,
        entity: &'static str,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .provider_for_entity(&entity_id)
            .ok_or_else(|| EngineError::not_found(entity, entity_id))?;
        let ps = self
            .provider(&provider_id)
            .ok_or_else(|| EngineError::not_found(entity, entity_id))?;
        Ok(ps.write_owned().await)
    }

    /// Serializes every booking attempt of one client. Taken before any
    /// provider lock, never while holding one.
    pub(super) async fn lock_client(&self, client_id: Ulid) -> ClientPermit {
        let mutex = self.client_locks.entry(client_id).or_default().clone();
        ClientPermit {
            client_id,
            locks: self.client_locks.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Journal `event`, then apply it to the locked partition.
    ///
    /// Runs on its own task which owns the partition guard and `held` (other
    /// guards the transaction needs kept until it lands). If the caller is
    /// dropped mid-commit the commit still finishes, so journal and memory
    /// never disagree.
    pub(super) async fn commit<H: Send + 'static>(
        &self,
        mut guard: OwnedRwLockWriteGuard<ProviderState>,
        event: Event,
        held: H,
    ) -> Result<(), EngineError> {
        let tx = self.journal_tx.clone();
        let index = self.index.clone();
        let task = tokio::spawn(async move {
            let _held = held;
            journal_append(&tx, &event).await?;
            apply_event(&mut guard, &event, &index);
            Ok::<(), EngineError>(())
        });
        task.await
            .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))?
    }

    /// Rewrites the journal as a snapshot. Returns the number of events written.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let (response, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { response })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        let written = rx
            .await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| {
                warn!(parent: &self.span, error = %e, "journal compaction failed");
                EngineError::Journal(e.to_string())
            })?;
        info!(parent: &self.span, events = written, "journal compacted");
        Ok(written)
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn stats(&self) -> EngineStats {
        let partitions: Vec<SharedProviderState> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let mut stats = EngineStats {
            providers: partitions.len(),
            ..EngineStats::default()
        };
        for ps in partitions {
            let guard = ps.read().await;
            stats.slots += guard.slots.len();
            stats.free_slots += guard.slots.iter().filter(|s| s.is_free()).count();
            stats.bookings += guard.bookings.len();
            stats.active_bookings += guard.active_by_slot.len();
        }
        stats
    }
}
