use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{admit, now_ms, validate_span};
use super::queries::room_info;
use super::{Engine, EngineError, SharedRoomState, WalCommand};

fn validate_room_spec(spec: &RoomSpec) -> Result<(), EngineError> {
    if spec.name.trim().is_empty() {
        return Err(EngineError::Invalid("room name must not be empty".into()));
    }
    if spec.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if spec.capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1".into()));
    }
    if spec.capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    let texts = [&spec.location, &spec.equipment, &spec.description];
    if texts.into_iter().flatten().any(|t| t.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("room attribute too long"));
    }
    Ok(())
}

fn validate_account_fields(username: &str, email: &str) -> Result<(), EngineError> {
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(EngineError::Invalid(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters"
        )));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(EngineError::Invalid("username must not contain whitespace".into()));
    }
    if email.len() > MAX_EMAIL_LEN || !email.contains('@') {
        return Err(EngineError::Invalid(format!("invalid email address: {email}")));
    }
    Ok(())
}

impl Engine {
    /// Define the reference permissions and the `admin` / `user` roles if
    /// they are missing. Safe to call on every start.
    pub async fn seed_reference_data(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut all_permissions = Vec::with_capacity(PERMISSIONS.len());
        for (name, description) in PERMISSIONS {
            let existing = self
                .permissions
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.id);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = Ulid::new();
                    let event = Event::PermissionDefined {
                        id,
                        name: name.to_string(),
                        description: description.to_string(),
                    };
                    self.wal_append(&event).await?;
                    self.apply_directory(&event);
                    tracing::info!("seeded permission {name}");
                    id
                }
            };
            all_permissions.push(id);
        }

        for (name, permission_ids) in [(ROLE_ADMIN, all_permissions), (ROLE_USER, Vec::new())] {
            if self.role_names.contains_key(name) {
                continue;
            }
            let event = Event::RoleDefined {
                id: Ulid::new(),
                name: name.to_string(),
                permission_ids,
            };
            self.wal_append(&event).await?;
            self.apply_directory(&event);
            tracing::info!("seeded role {name}");
        }
        Ok(())
    }

    /// Store a new account holding the `admin` or `user` role. The caller
    /// hashes the password.
    pub async fn register_account(
        &self,
        username: &str,
        password_hash: String,
        email: &str,
        is_admin: bool,
    ) -> Result<Account, EngineError> {
        validate_account_fields(username, email)?;
        if self.accounts.len() >= MAX_ACCOUNTS {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        let role_name = if is_admin { ROLE_ADMIN } else { ROLE_USER };
        let role_id = self
            .role_names
            .get(role_name)
            .map(|r| *r.value())
            .ok_or_else(|| EngineError::RoleNotFound(role_name.to_string()))?;

        let _gate = self.commit_gate.read().await;
        let id = Ulid::new();
        match self.usernames.entry(username.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(format!("username {username}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let account = Account {
            id,
            username: username.to_string(),
            password_hash,
            email: email.to_string(),
            is_admin,
            is_frozen: false,
            role_ids: vec![role_id],
            created_at: now_ms(),
        };
        let event = Event::AccountRegistered {
            account: account.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.usernames.remove(username);
            return Err(e);
        }
        self.apply_directory(&event);
        Ok(account)
    }

    pub async fn set_account_frozen(&self, id: Ulid, frozen: bool) -> Result<Account, EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.accounts.contains_key(&id) {
            return Err(EngineError::AccountNotFound(id.to_string()));
        }
        let event = Event::AccountFrozen { id, frozen };
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        self.account(&id)
            .ok_or_else(|| EngineError::AccountNotFound(id.to_string()))
    }

    /// Grant a role by name. Returns `false` when the account already held it.
    pub async fn grant_role(&self, account_id: Ulid, role_name: &str) -> Result<bool, EngineError> {
        let role_id = self
            .role_names
            .get(role_name)
            .map(|r| *r.value())
            .ok_or_else(|| EngineError::RoleNotFound(role_name.to_string()))?;
        let _gate = self.commit_gate.read().await;
        let already = self
            .accounts
            .get(&account_id)
            .map(|a| a.role_ids.contains(&role_id))
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;
        if already {
            return Ok(false);
        }
        let event = Event::RoleGranted { account_id, role_id };
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        Ok(true)
    }

    pub async fn create_room(&self, id: Ulid, spec: RoomSpec) -> Result<(), EngineError> {
        validate_room_spec(&spec)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let _gate = self.commit_gate.read().await;

        // Publish the room write-locked so nothing books into it before the
        // WAL append lands.
        let rs: SharedRoomState = Arc::new(RwLock::new(RoomState::new(id, spec.clone())));
        let guard = rs
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::Invalid("room state unexpectedly locked".into()))?;
        match self.rooms.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(format!("room {id}"))),
            Entry::Vacant(slot) => {
                slot.insert(rs);
            }
        }
        match self.room_names.entry(spec.name.clone()) {
            Entry::Occupied(_) => {
                self.rooms.remove(&id);
                return Err(EngineError::AlreadyExists(format!("room name {}", spec.name)));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::RoomCreated { id, spec };
        if let Err(e) = self.wal_append(&event).await {
            self.forget_room(&guard);
            return Err(e);
        }
        drop(guard);
        Ok(())
    }

    /// Apply a partial update under the room lock; returns the room as
    /// stored afterwards.
    pub async fn patch_room(&self, id: Ulid, patch: RoomPatch) -> Result<RoomInfo, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.room_write(id).await?;
        let spec = patch.apply(guard.spec.clone());
        validate_room_spec(&spec)?;

        let old_name = guard.spec.name.clone();
        let renamed = old_name != spec.name;
        if renamed {
            match self.room_names.entry(spec.name.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::AlreadyExists(format!("room name {}", spec.name)));
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let new_name = spec.name.clone();
        let event = Event::RoomUpdated { id, spec };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if renamed {
                self.room_names.remove_if(&new_name, |_, owner| *owner == id);
            }
            return Err(e);
        }
        if renamed {
            self.room_names.remove_if(&old_name, |_, owner| *owner == id);
        }
        Ok(room_info(&guard, now_ms()))
    }

    /// Delete a room and every booking on it. Returns the number of bookings
    /// removed.
    pub async fn delete_room(&self, id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = self.room_write(id).await?;
        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.forget_room(&guard);
        Ok(guard.bookings.len())
    }

    /// Admit a new booking in `Requested` status.
    ///
    /// Checks run in order: span validity, room, account, booking id, then
    /// conflicts against the room's active bookings.
    pub async fn request_booking(
        &self,
        id: Ulid,
        room_id: Ulid,
        account_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        if let Some(ref n) = note
            && n.len() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let _gate = self.commit_gate.read().await;
        let mut guard = self.room_write(room_id).await?;

        let frozen = self
            .accounts
            .get(&account_id)
            .map(|a| a.is_frozen)
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;
        if frozen {
            return Err(EngineError::AccountFrozen(account_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        match self.booking_to_room.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(format!("booking {id}"))),
            Entry::Vacant(slot) => {
                slot.insert(room_id);
            }
        }
        if let Err(e) = admit(&guard, &span, None) {
            self.booking_to_room.remove(&id);
            return Err(e);
        }

        let booking = Booking {
            id,
            room_id,
            account_id,
            span,
            status: BookingStatus::Requested,
            note,
            created_at: now_ms(),
        };
        let event = Event::BookingRequested {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.booking_to_room.remove(&id);
            return Err(e);
        }
        Ok(booking)
    }

    /// Move an active booking to a new span, ignoring its own old slot.
    pub async fn reschedule_booking(&self, id: Ulid, start: Ms, end: Ms) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))?;
        if !current.status.is_active() {
            return Err(EngineError::Invalid(format!(
                "booking {id} is {} and cannot be rescheduled",
                current.status
            )));
        }
        admit(&guard, &span, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            room_id: guard.id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking { span, ..current })
    }

    /// Unconditional status setter; approving does not re-check conflicts.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let event = Event::BookingStatusChanged {
            id,
            room_id: guard.id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Rewrite the WAL as the minimal event sequence reproducing current
    /// state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut permissions: Vec<Permission> = self.permissions.iter().map(|p| p.value().clone()).collect();
        permissions.sort_by_key(|p| p.id);
        events.extend(permissions.into_iter().map(|p| Event::PermissionDefined {
            id: p.id,
            name: p.name,
            description: p.description,
        }));

        let mut roles: Vec<Role> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by_key(|r| r.id);
        events.extend(roles.into_iter().map(|r| Event::RoleDefined {
            id: r.id,
            name: r.name,
            permission_ids: r.permission_ids,
        }));

        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by_key(|a| a.id);
        events.extend(accounts.into_iter().map(|account| Event::AccountRegistered { account }));

        let mut rooms: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);
        for (_, rs) in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                spec: guard.spec.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingRequested { booking: b.clone() }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
}
