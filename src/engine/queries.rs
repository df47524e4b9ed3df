use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_spans;
use super::conflict::now_ms;
use super::{Engine, EngineError, SharedRoomState};

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub(super) fn room_info(rs: &RoomState, now: Ms) -> RoomInfo {
    RoomInfo {
        id: rs.id,
        name: rs.spec.name.clone(),
        capacity: rs.spec.capacity,
        location: rs.spec.location.clone(),
        equipment: rs.spec.equipment.clone(),
        description: rs.spec.description.clone(),
        is_booked: rs.is_booked_at(now),
    }
}

impl Engine {
    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|a| a.value().clone())
    }

    pub fn account_by_username(&self, username: &str) -> Option<Account> {
        let id = *self.usernames.get(username)?.value();
        self.account(&id)
    }

    fn role_names_of(&self, account: &Account) -> Vec<String> {
        account
            .role_ids
            .iter()
            .filter_map(|id| self.roles.get(id).map(|r| r.name.clone()))
            .collect()
    }

    /// Flatten an account's roles into an [`Identity`]. Permissions are
    /// de-duplicated by id, first-seen order.
    pub fn resolve_identity(&self, account: &Account) -> Identity {
        let mut seen = HashSet::new();
        let mut permissions = Vec::new();
        for role_id in &account.role_ids {
            let Some(role) = self.roles.get(role_id) else {
                continue;
            };
            for pid in &role.permission_ids {
                if !seen.insert(*pid) {
                    continue;
                }
                if let Some(p) = self.permissions.get(pid) {
                    permissions.push(PermissionGrant {
                        id: p.id,
                        name: p.name.clone(),
                        description: p.description.clone(),
                    });
                }
            }
        }
        Identity {
            id: account.id,
            username: account.username.clone(),
            email: account.email.clone(),
            is_admin: account.is_admin,
            roles: self.role_names_of(account),
            permissions,
        }
    }

    /// Email of the oldest active admin account.
    pub fn admin_email(&self) -> Option<String> {
        self.accounts
            .iter()
            .filter(|a| a.is_admin && !a.is_frozen)
            .min_by_key(|a| a.id)
            .map(|a| a.email.clone())
    }

    pub fn list_accounts(&self, username: Option<&str>, page: Pagination) -> Page<AccountInfo> {
        let mut matches: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| username.is_none_or(|u| contains_ci(&a.username, u)))
            .map(|a| a.value().clone())
            .collect();
        matches.sort_by_key(|a| a.id);
        let page = page.apply(matches);
        Page {
            total: page.total,
            items: page.items.iter().map(|a| self.account_info(a)).collect(),
        }
    }

    pub fn account_info(&self, account: &Account) -> AccountInfo {
        AccountInfo {
            id: account.id,
            username: account.username.clone(),
            email: account.email.clone(),
            is_admin: account.is_admin,
            is_frozen: account.is_frozen,
            roles: self.role_names_of(account),
            created_at: account.created_at,
        }
    }

    fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_rooms(
        &self,
        name: Option<&str>,
        location: Option<&str>,
        page: Pagination,
    ) -> Page<RoomInfo> {
        let now = now_ms();
        let mut rooms = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            let spec = &guard.spec;
            if name.is_some_and(|n| !contains_ci(&spec.name, n)) {
                continue;
            }
            if location.is_some_and(|l| !spec.location.as_deref().is_some_and(|loc| contains_ci(loc, l))) {
                continue;
            }
            rooms.push(room_info(&guard, now));
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        page.apply(rooms)
    }

    pub async fn room(&self, id: Ulid) -> Option<RoomInfo> {
        let rs = self.get_room(&id)?;
        let guard = rs.read().await;
        Some(room_info(&guard, now_ms()))
    }

    fn booking_info(&self, booking: &Booking, room_name: &str) -> BookingInfo {
        let username = self
            .accounts
            .get(&booking.account_id)
            .map(|a| a.username.clone())
            .unwrap_or_default();
        BookingInfo {
            id: booking.id,
            room_id: booking.room_id,
            room_name: room_name.to_string(),
            account_id: booking.account_id,
            username,
            start: booking.span.start,
            end: booking.span.end,
            status: booking.status,
            note: booking.note.clone(),
            created_at: booking.created_at,
        }
    }

    pub async fn booking(&self, id: Ulid) -> Option<BookingInfo> {
        let room_id = self.room_for_booking(&id)?;
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        let booking = guard.booking(id)?;
        Some(self.booking_info(booking, &guard.spec.name))
    }

    /// Bookings matching every filter, ordered by start time.
    pub async fn list_bookings(&self, filter: &BookingFilter, page: Pagination) -> Page<BookingInfo> {
        let handles: Vec<SharedRoomState> = match filter.room_id {
            Some(room_id) => self.get_room(&room_id).into_iter().collect(),
            None => self.room_handles(),
        };
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            if filter.room_name.as_deref().is_some_and(|n| !contains_ci(&guard.spec.name, n))
                || filter
                    .location
                    .as_deref()
                    .is_some_and(|l| !guard.spec.location.as_deref().is_some_and(|loc| contains_ci(loc, l)))
            {
                continue;
            }
            for b in &guard.bookings {
                if filter.account_id.is_some_and(|a| a != b.account_id)
                    || filter.status.is_some_and(|s| s != b.status)
                    || filter.start_from.is_some_and(|t| b.span.start < t)
                    || filter.start_to.is_some_and(|t| b.span.start > t)
                {
                    continue;
                }
                let info = self.booking_info(b, &guard.spec.name);
                if let Some(ref u) = filter.username
                    && !contains_ci(&info.username, u)
                {
                    continue;
                }
                out.push(info);
            }
        }
        out.sort_by_key(|b| (b.start, b.id));
        page.apply(out)
    }

    /// Free spans of a room inside `[start, end)`.
    pub async fn availability(&self, room_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        if start >= end {
            return Err(EngineError::Invalid(format!(
                "window must end after it starts (start={start}, end={end})"
            )));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        Ok(free_spans(&guard, &Span::new(start, end)))
    }
}
