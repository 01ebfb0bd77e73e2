use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC), the only time type.
pub type Ms = i64;

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

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Principals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

/// The identity the engine acts on behalf of. Consumed, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
    pub active: bool,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Slots & bookings ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub max_participants: u32,
    /// Always equal to the number of active bookings on this slot.
    pub current_participants: u32,
    pub is_available: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Slot {
    pub fn available_spots(&self) -> u32 {
        self.max_participants.saturating_sub(self.current_participants)
    }

    pub fn is_full(&self) -> bool {
        self.current_participants >= self.max_participants
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub user_id: Ulid,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub booked_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// Whether a (slot, user) pair may hold more than one booking row over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebookPolicy {
    /// Any existing row for the pair blocks a new booking, cancelled or not.
    #[default]
    Never,
    /// Only an active row blocks; a cancelled row may be followed by a new one.
    AfterCancel,
}

/// A slot row together with every booking row that references it.
/// This is the unit the capacity lock protects.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    /// Booking rows in insertion order, cancelled ones included.
    pub bookings: Vec<Booking>,
    /// Set when the slot is deleted while other tasks still hold its `Arc`.
    pub deleted: bool,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
            deleted: false,
        }
    }

    pub fn active_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.is_active()).count() as u32
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| &b.id == id)
    }

    /// The capacity invariant: `current == active rows <= max`.
    pub fn is_consistent(&self) -> bool {
        self.slot.current_participants == self.active_count()
            && self.slot.current_participants <= self.slot.max_participants
    }
}

/// One entry of an owner's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub slot_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
}

/// The time ranges of every slot one owner has created, sorted by start.
/// Guarded by a per-owner mutex; conflict checks read it, slot
/// creation/update/deletion write it.
#[derive(Debug, Clone)]
pub struct OwnerSchedule {
    pub owner_id: Ulid,
    pub entries: Vec<ScheduledSpan>,
}

impl OwnerSchedule {
    pub fn new(owner_id: Ulid) -> Self {
        Self {
            owner_id,
            entries: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `span.start`.
    pub fn insert(&mut self, slot_id: Ulid, span: Span) {
        let pos = self
            .entries
            .binary_search_by_key(&span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(
            pos,
            ScheduledSpan {
                slot_id,
                owner_id: self.owner_id,
                span,
            },
        );
    }

    pub fn remove(&mut self, slot_id: Ulid) -> Option<ScheduledSpan> {
        let pos = self.entries.iter().position(|e| e.slot_id == slot_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduledSpan> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
/// One record is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        owner_id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
        max_participants: u32,
        is_available: bool,
        created_at: Ms,
        updated_at: Ms,
    },
    SlotUpdated {
        id: Ulid,
        title: String,
        description: Option<String>,
        span: Span,
        max_participants: u32,
        is_available: bool,
        updated_at: Ms,
    },
    /// Removes the slot and every booking on it.
    SlotDeleted {
        id: Ulid,
    },
    BookingReserved {
        id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
        notes: Option<String>,
        booked_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        cancelled_at: Ms,
    },
    /// Removes the slots the user owned and the bookings the user held
    /// elsewhere. Both sets are fixed at commit time, so replay removes
    /// exactly what the live purge removed.
    UserPurged {
        user_id: Ulid,
        slot_ids: Vec<Ulid>,
        booking_ids: Vec<Ulid>,
    },
}

// ── Operation inputs & query results ─────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDraft {
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub max_participants: u32,
}

/// Partial update; `None` leaves a field unchanged.
/// `description: Some(None)` clears the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub max_participants: Option<u32>,
    pub is_available: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub available_only: bool,
    /// Keep slots with `start >= from`.
    pub from: Option<Ms>,
    /// Keep slots with `end <= until`.
    pub until: Option<Ms>,
}

impl SlotFilter {
    pub fn matches(&self, slot: &Slot) -> bool {
        (!self.available_only || slot.is_available)
            && self.from.is_none_or(|from| slot.span.start >= from)
            && self.until.is_none_or(|until| slot.span.end <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub take: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            take: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

/// A booking joined with its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetail {
    pub booking: Booking,
    pub slot: Slot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub slots_removed: usize,
    pub bookings_removed: usize,
}
