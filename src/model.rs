use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

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

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Money ────────────────────────────────────────────────────────

/// Fixed-point amount with two fraction digits, stored in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Hourly rate applied to a span, fractional hours included.
    /// Rounded half-up to the cent. `None` when the total leaves the `i64` range.
    pub fn for_span(&self, span: &Span) -> Option<Money> {
        let product = self.0 as i128 * span.duration_ms() as i128;
        let half = HOUR_MS as i128 / 2;
        let cents = if product >= 0 {
            (product + half) / HOUR_MS as i128
        } else {
            (product - half) / HOUR_MS as i128
        };
        i64::try_from(cents).ok().map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("bad amount: {s:?}"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("bad amount: {s:?}"));
        }
        if frac.len() > 2 {
            return Err(format!("bad amount: {s:?} (at most two decimals)"));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|e| format!("bad amount: {e}"))?
        };
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|e| format!("bad amount: {e}"))? * 10,
            _ => frac.parse().map_err(|e| format!("bad amount: {e}"))?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(|| format!("amount out of range: {s}"))?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

// ── Roles and requesters ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" | "role_user" => Ok(Role::User),
            "admin" | "role_admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Identity and capabilities of whoever issued an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Requester {
    pub user_id: Option<Ulid>,
    pub roles: BTreeSet<Role>,
}

impl Requester {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: Some(user.id),
            roles: user.roles.clone(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    pub fn owns(&self, reservation: &Reservation) -> bool {
        self.user_id == Some(reservation.user_id)
    }
}

// ── Reservation status ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Canceled => "canceled",
        }
    }

    /// pending → approved | rejected | canceled, approved → canceled.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Canceled) | (Approved, Canceled)
        )
    }

    /// Canceled reservations never block the interval they used to hold.
    pub fn holds_interval(&self) -> bool {
        !matches!(self, ReservationStatus::Canceled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "approved" => Ok(ReservationStatus::Approved),
            "rejected" => Ok(ReservationStatus::Rejected),
            "canceled" => Ok(ReservationStatus::Canceled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    /// Per hour.
    pub price: Money,
    pub capacity: u32,
    pub location: Option<String>,
    pub amenities: Vec<String>,
    pub image_url: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    /// Unique, compared case-sensitively.
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub roles: BTreeSet<Role>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub space_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    /// Checked against capacity once, at creation.
    pub attendees: u32,
    /// Computed once at creation.
    pub total_price: Money,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Option<Ms>,
}

/// A space together with every reservation ever made on it.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub space: Space,
    /// Sorted by `span.start`; canceled entries are kept for history.
    pub reservations: Vec<Reservation>,
}

impl SpaceState {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

// ── Patches ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpacePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Money>,
    pub capacity: Option<u32>,
    pub location: Option<String>,
    pub amenities: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub is_active: Option<bool>,
}

impl SpacePatch {
    pub fn apply(&self, space: &mut Space) {
        if let Some(ref v) = self.name {
            space.name = v.clone();
        }
        if let Some(ref v) = self.description {
            space.description = v.clone();
        }
        if let Some(v) = self.price {
            space.price = v;
        }
        if let Some(v) = self.capacity {
            space.capacity = v;
        }
        if let Some(ref v) = self.location {
            space.location = Some(v.clone());
        }
        if let Some(ref v) = self.amenities {
            space.amenities = v.clone();
        }
        if let Some(ref v) = self.image_url {
            space.image_url = Some(v.clone());
        }
        if let Some(v) = self.is_active {
            space.is_active = v;
        }
    }
}

/// Requested change to a reservation. `status` stays raw text so the
/// lifecycle rules decide whether it names a real status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub new_password: Option<String>,
    pub current_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub span: Span,
    pub attendees: u32,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

/// What `delete_space` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRemoval {
    Deleted,
    /// Reservations reference the space, so it was only deactivated.
    Disabled,
}

impl SpaceRemoval {
    pub fn message(&self) -> &'static str {
        match self {
            SpaceRemoval::Deleted => "space deleted",
            SpaceRemoval::Disabled => "space disabled: it has associated reservations",
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        space: Space,
    },
    SpaceUpdated {
        space: Space,
    },
    SpaceDeactivated {
        id: Ulid,
    },
    SpaceDeleted {
        id: Ulid,
    },
    UserRegistered {
        user: User,
    },
    UserUpdated {
        user: User,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        space_id: Ulid,
        status: ReservationStatus,
        notes: Option<String>,
        updated_at: Ms,
    },
    ReservationCanceled {
        id: Ulid,
        space_id: Ulid,
        updated_at: Ms,
    },
}
