mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{first_conflict, free_spans, is_available, merge_overlapping, subtract_intervals};
pub use error::{EngineError, Outcome};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::auth::AuthService;
use crate::model::*;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Commit what we have before touching the file for anything else.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are always batched by the caller.
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub spaces: DashMap<Ulid, SharedSpaceState>,
    pub users: DashMap<Ulid, User>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) auth: Arc<dyn AuthService>,
    /// Email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → space id.
    pub(super) reservation_to_space: DashMap<Ulid, Ulid>,
    /// Serializes user writes so email uniqueness holds across the WAL append.
    pub(super) user_write: Mutex<()>,
    /// Serializes space creation and deletion.
    pub(super) catalog_write: Mutex<()>,
    /// Every mutation holds this shared for its whole duration; compaction
    /// takes it exclusively so its snapshot never misses an append.
    pub(super) write_gate: RwLock<()>,
}

/// Apply an event directly to a SpaceState (no locking, caller holds the lock).
fn apply_to_space(ss: &mut SpaceState, event: &Event, reservation_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SpaceUpdated { space } => {
            ss.space = space.clone();
        }
        Event::SpaceDeactivated { .. } => {
            ss.space.is_active = false;
        }
        Event::ReservationCreated { reservation } => {
            reservation_index.insert(reservation.id, reservation.space_id);
            ss.insert_reservation(reservation.clone());
        }
        Event::ReservationUpdated {
            id,
            status,
            notes,
            updated_at,
            ..
        } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = *status;
                r.notes = notes.clone();
                r.updated_at = Some(*updated_at);
            }
        }
        Event::ReservationCanceled { id, updated_at, .. } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = ReservationStatus::Canceled;
                r.updated_at = Some(*updated_at);
            }
        }
        // Created/Deleted are handled at the DashMap level, users never touch a space.
        Event::SpaceCreated { .. }
        | Event::SpaceDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserUpdated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, auth: Arc<dyn AuthService>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spaces: DashMap::new(),
            users: DashMap::new(),
            wal_tx,
            auth,
            emails: DashMap::new(),
            reservation_to_space: DashMap::new(),
            user_write: Mutex::new(()),
            catalog_write: Mutex::new(()),
            write_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            match event {
                Event::SpaceCreated { space } => {
                    engine
                        .spaces
                        .insert(space.id, Arc::new(RwLock::new(SpaceState::new(space.clone()))));
                }
                Event::SpaceDeleted { id } => {
                    engine.spaces.remove(id);
                }
                Event::UserRegistered { user } | Event::UserUpdated { user } => {
                    engine.apply_user(user.clone());
                }
                other => {
                    let Some(space_id) = event_space_id(other) else { continue };
                    let Some(ss) = engine.get_space_state(&space_id) else { continue };
                    if let Ok(mut guard) = ss.try_write() {
                        apply_to_space(&mut guard, other, &engine.reservation_to_space);
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events: {} spaces, {} users, {} reservations",
            events.len(),
            engine.spaces.len(),
            engine.users.len(),
            engine.reservation_to_space.len()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_space_state(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn get_space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_space.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.reservation_to_space);
        Ok(())
    }

    pub(super) fn apply_user(&self, user: User) {
        if let Some(previous) = self.users.get(&user.id)
            && previous.email != user.email
        {
            self.emails.remove(&previous.email);
        }
        self.emails.insert(user.email.clone(), user.id);
        self.users.insert(user.id, user);
    }

    /// Lookup reservation → space, acquire the space's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let ss = self.resolve_reservation_space(reservation_id)?;
        Ok(ss.write_owned().await)
    }

    pub(super) async fn resolve_reservation_read(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<SpaceState>, EngineError> {
        let ss = self.resolve_reservation_space(reservation_id)?;
        Ok(ss.read_owned().await)
    }

    fn resolve_reservation_space(&self, reservation_id: &Ulid) -> Result<SharedSpaceState, EngineError> {
        let space_id = self
            .get_space_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        self.get_space_state(&space_id)
            .ok_or(EngineError::NotFound(*reservation_id))
    }

    /// Snapshot every space's lock handle so no DashMap shard guard is held
    /// across an await.
    pub(super) fn space_handles(&self) -> Vec<SharedSpaceState> {
        self.spaces.iter().map(|e| e.value().clone()).collect()
    }
}

/// The space a space-scoped event applies to.
fn event_space_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SpaceUpdated { space } => Some(space.id),
        Event::SpaceDeactivated { id } => Some(*id),
        Event::ReservationCreated { reservation } => Some(reservation.space_id),
        Event::ReservationUpdated { space_id, .. } | Event::ReservationCanceled { space_id, .. } => {
            Some(*space_id)
        }
        Event::SpaceCreated { .. }
        | Event::SpaceDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserUpdated { .. } => None,
    }
}
