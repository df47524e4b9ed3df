mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use conflict::admit;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
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
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The relational store: directory data (permissions, roles, accounts) in
/// flat maps, each room's bookings behind the room's own lock.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) room_names: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    pub(super) accounts: DashMap<Ulid, Account>,
    pub(super) usernames: DashMap<String, Ulid>,
    pub(super) roles: DashMap<Ulid, Role>,
    pub(super) role_names: DashMap<String, Ulid>,
    pub(super) permissions: DashMap<Ulid, Permission>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared across WAL append + apply; compaction
    /// holds it exclusively while snapshotting. Always taken before any room
    /// lock.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a room-scoped event (no locking, caller holds the room lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated { spec, .. } => rs.spec = spec.clone(),
        Event::BookingRequested { booking } => {
            booking_index.insert(booking.id, rs.id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingRescheduled { id, span, .. } => {
            if let Some(mut booking) = rs.remove_booking(*id) {
                booking.span = *span;
                rs.insert_booking(booking);
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = rs.booking_mut(*id) {
                booking.status = *status;
            }
        }
        _ => {}
    }
}

/// Extract the room id from a room-scoped event.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::BookingRequested { booking } => Some(booking.room_id),
        Event::BookingRescheduled { room_id, .. } | Event::BookingStatusChanged { room_id, .. } => {
            Some(*room_id)
        }
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            room_names: DashMap::new(),
            booking_to_room: DashMap::new(),
            accounts: DashMap::new(),
            usernames: DashMap::new(),
            roles: DashMap::new(),
            role_names: DashMap::new(),
            permissions: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events from {}: {} accounts, {} rooms, {} bookings",
            events.len(),
            wal_path.display(),
            engine.accounts.len(),
            engine.rooms.len(),
            engine.booking_to_room.len()
        );
        Ok(engine)
    }

    // We're the sole owner of these Arcs during replay, so try_write always
    // succeeds. Never block here: this runs inside the async runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomCreated { id, spec } => {
                self.room_names.insert(spec.name.clone(), *id);
                let rs = RoomState::new(*id, spec.clone());
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::RoomDeleted { id } => {
                if let Some(rs) = self.get_room(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.forget_room(&guard);
                }
            }
            Event::RoomUpdated { id, spec } => {
                if let Some(rs) = self.get_room(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.reindex_room_name(&guard.spec.name, &spec.name, *id);
                    apply_to_room(&mut guard, event, &self.booking_to_room);
                }
            }
            other => match event_room_id(other) {
                Some(room_id) => {
                    if let Some(rs) = self.get_room(&room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        apply_to_room(&mut guard, other, &self.booking_to_room);
                    }
                }
                None => self.apply_directory(other),
            },
        }
    }

    /// Apply a directory event (permissions, roles, accounts).
    pub(super) fn apply_directory(&self, event: &Event) {
        match event {
            Event::PermissionDefined { id, name, description } => {
                self.permissions.insert(
                    *id,
                    Permission {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                    },
                );
            }
            Event::RoleDefined { id, name, permission_ids } => {
                self.role_names.insert(name.clone(), *id);
                self.roles.insert(
                    *id,
                    Role {
                        id: *id,
                        name: name.clone(),
                        permission_ids: permission_ids.clone(),
                    },
                );
            }
            Event::AccountRegistered { account } => {
                self.usernames.insert(account.username.clone(), account.id);
                self.accounts.insert(account.id, account.clone());
            }
            Event::AccountFrozen { id, frozen } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    account.is_frozen = *frozen;
                }
            }
            Event::RoleGranted { account_id, role_id } => {
                if let Some(mut account) = self.accounts.get_mut(account_id)
                    && !account.role_ids.contains(role_id)
                {
                    account.role_ids.push(*role_id);
                }
            }
            _ => {}
        }
    }

    /// Remove a room and every index entry pointing into it.
    pub(super) fn forget_room(&self, rs: &RoomState) {
        for booking in &rs.bookings {
            self.booking_to_room.remove(&booking.id);
        }
        self.room_names.remove_if(&rs.spec.name, |_, id| *id == rs.id);
        self.rooms.remove(&rs.id);
    }

    pub(super) fn reindex_room_name(&self, old: &str, new: &str, id: Ulid) {
        if old != new {
            self.room_names.remove_if(old, |_, owner| *owner == id);
            self.room_names.insert(new.to_string(), id);
        }
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

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Acquire a room's write lock, re-checking that it wasn't deleted while
    /// we waited.
    pub(super) async fn room_write(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.write_owned().await;
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::RoomNotFound(room_id));
        }
        Ok(guard)
    }

    /// Lookup booking → room, acquire the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .room_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let guard = self.room_write(room_id).await?;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::BookingNotFound(booking_id));
        }
        Ok(guard)
    }

    /// WAL-append + apply for a room-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        Ok(())
    }
}
