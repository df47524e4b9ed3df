use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const PERM_ROOM_MANAGE: &str = "room:manage";
pub const PERM_BOOKING_REVIEW: &str = "booking:review";
pub const PERM_ACCOUNT_MANAGE: &str = "account:manage";

/// Reference permissions seeded on first start, with their descriptions.
pub const PERMISSIONS: [(&str, &str); 3] = [
    (PERM_ROOM_MANAGE, "create, edit and delete rooms"),
    (PERM_BOOKING_REVIEW, "approve or reject booking requests"),
    (PERM_ACCOUNT_MANAGE, "list, freeze and grant roles to accounts"),
];

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Adjacent spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Lifecycle of a booking. Only `Requested` and `Approved` hold the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Requested,
    Approved,
    Rejected,
    Released,
}

impl BookingStatus {
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Requested | BookingStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Released => "released",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "requested" => Ok(BookingStatus::Requested),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            "released" => Ok(BookingStatus::Released),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub account_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub note: Option<String>,
    pub created_at: Ms,
}

/// Mutable room attributes, shared by create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub equipment: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub spec: RoomSpec,
    /// Every booking of the room regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(id: Ulid, spec: RoomSpec) -> Self {
        Self {
            id,
            spec,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Derived "currently booked" flag.
    pub fn is_booked_at(&self, now: Ms) -> bool {
        self.bookings
            .iter()
            .any(|b| b.status.is_active() && b.span.contains_instant(now))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub is_admin: bool,
    pub is_frozen: bool,
    pub role_ids: Vec<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Ulid,
    pub name: String,
    pub permission_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Ulid,
    pub name: String,
    pub description: String,
}

/// A permission as it appears inside token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: Ulid,
    pub name: String,
    pub description: String,
}

/// Flattened identity of an account: role names plus the de-duplicated
/// permission set, resolved once per login or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<PermissionGrant>,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PermissionDefined {
        id: Ulid,
        name: String,
        description: String,
    },
    RoleDefined {
        id: Ulid,
        name: String,
        permission_ids: Vec<Ulid>,
    },
    AccountRegistered {
        account: Account,
    },
    AccountFrozen {
        id: Ulid,
        frozen: bool,
    },
    RoleGranted {
        account_id: Ulid,
        role_id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        spec: RoomSpec,
    },
    RoomUpdated {
        id: Ulid,
        spec: RoomSpec,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingRequested {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        room_id: Ulid,
        span: Span,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
    },
}

/// Partial room update; `None` leaves the attribute unchanged, `Some(None)`
/// clears an optional one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub location: Option<Option<String>>,
    pub equipment: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

impl From<RoomSpec> for RoomPatch {
    fn from(spec: RoomSpec) -> Self {
        Self {
            name: Some(spec.name),
            capacity: Some(spec.capacity),
            location: Some(spec.location),
            equipment: Some(spec.equipment),
            description: Some(spec.description),
        }
    }
}

impl RoomPatch {
    pub fn apply(self, mut spec: RoomSpec) -> RoomSpec {
        if let Some(name) = self.name {
            spec.name = name;
        }
        if let Some(capacity) = self.capacity {
            spec.capacity = capacity;
        }
        if let Some(location) = self.location {
            spec.location = location;
        }
        if let Some(equipment) = self.equipment {
            spec.equipment = equipment;
        }
        if let Some(description) = self.description {
            spec.description = description;
        }
        spec
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub equipment: Option<String>,
    pub description: Option<String>,
    pub is_booked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub room_id: Ulid,
    pub room_name: String,
    pub account_id: Ulid,
    pub username: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub note: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub is_frozen: bool,
    pub roles: Vec<String>,
    pub created_at: Ms,
}

/// A page of results plus the total number of matches before paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Filters for booking listings; every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Ulid>,
    /// Case-insensitive substrings of the room's name and location.
    pub room_name: Option<String>,
    pub location: Option<String>,
    pub account_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    /// Case-insensitive substring of the owner's username.
    pub username: Option<String>,
    /// Inclusive bounds on `start`.
    pub start_from: Option<Ms>,
    pub start_to: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page_no: usize,
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_no: 1,
            page_size: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn apply<T>(&self, all: Vec<T>) -> Page<T> {
        let total = all.len();
        let skip = (self.page_no.saturating_sub(1)).saturating_mul(self.page_size);
        let items = all.into_iter().skip(skip).take(self.page_size).collect();
        Page { items, total }
    }
}
