use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedOwnerSchedule = Arc<Mutex<OwnerSchedule>>;

/// Build the slot row for a `SlotCreated` event.
fn slot_from_created(event: &Event) -> Option<SlotState> {
    match event {
        Event::SlotCreated {
            id,
            owner_id,
            title,
            description,
            span,
            max_participants,
            is_available,
            created_at,
            updated_at,
        } => Some(SlotState::new(Slot {
            id: *id,
            owner_id: *owner_id,
            title: title.clone(),
            description: description.clone(),
            span: *span,
            max_participants: *max_participants,
            current_participants: 0,
            is_available: *is_available,
            created_at: *created_at,
            updated_at: *updated_at,
        })),
        _ => None,
    }
}

/// Apply an event to one slot's rows (caller holds the slot lock).
/// Returns the booking rows the event removed.
pub(crate) fn apply_to_slot(state: &mut SlotState, event: &Event) -> Vec<Booking> {
    let mut removed = Vec::new();
    match event {
        Event::SlotUpdated {
            title,
            description,
            span,
            max_participants,
            is_available,
            updated_at,
            ..
        } => {
            let slot = &mut state.slot;
            slot.title = title.clone();
            slot.description = description.clone();
            slot.span = *span;
            slot.max_participants = *max_participants;
            slot.is_available = *is_available;
            slot.updated_at = *updated_at;
        }
        Event::SlotDeleted { .. } => {
            removed.append(&mut state.bookings);
            state.slot.current_participants = 0;
            state.deleted = true;
        }
        Event::BookingReserved {
            id,
            slot_id,
            user_id,
            notes,
            booked_at,
        } => {
            state.bookings.push(Booking {
                id: *id,
                slot_id: *slot_id,
                user_id: *user_id,
                status: BookingStatus::Active,
                notes: notes.clone(),
                booked_at: *booked_at,
                cancelled_at: None,
            });
            state.slot.current_participants += 1;
        }
        Event::BookingCancelled {
            id, cancelled_at, ..
        } => {
            if let Some(booking) = state.booking_mut(id)
                && booking.is_active()
            {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
                state.slot.current_participants -= 1;
            }
        }
        Event::UserPurged {
            slot_ids,
            booking_ids,
            ..
        } => {
            if slot_ids.contains(&state.slot.id) {
                removed.append(&mut state.bookings);
                state.slot.current_participants = 0;
                state.deleted = true;
            } else {
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.bookings)
                    .into_iter()
                    .partition(|b| booking_ids.contains(&b.id));
                state.bookings = kept;
                state.slot.current_participants = state.active_count();
                removed = gone;
            }
        }
        Event::SlotCreated { .. } => {}
    }
    debug_assert!(state.deleted || state.is_consistent(), "capacity invariant broken by {event:?}");
    removed
}

/// Apply an event to an owner's schedule (caller holds the owner mutex).
pub(crate) fn apply_to_schedule(schedule: &mut OwnerSchedule, event: &Event) {
    match event {
        Event::SlotCreated { id, span, .. } => schedule.insert(*id, *span),
        Event::SlotUpdated { id, span, .. } => {
            if schedule.remove(*id).is_some() {
                schedule.insert(*id, *span);
            }
        }
        Event::SlotDeleted { id } => {
            schedule.remove(*id);
        }
        Event::UserPurged { slot_ids, .. } => {
            schedule.entries.retain(|e| !slot_ids.contains(&e.slot_id));
        }
        Event::BookingReserved { .. } | Event::BookingCancelled { .. } => {}
    }
}

/// Lock-free fold of an event log. Used to rebuild state at startup and to
/// compute the minimal log during compaction.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub slots: BTreeMap<Ulid, SlotState>,
    pub schedules: HashMap<Ulid, OwnerSchedule>,
}

impl Snapshot {
    pub fn from_events(events: &[Event]) -> Self {
        let mut snapshot = Self::default();
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::SlotCreated { id, owner_id, .. } => {
                if let Some(state) = slot_from_created(event) {
                    apply_to_schedule(
                        self.schedules
                            .entry(*owner_id)
                            .or_insert_with(|| OwnerSchedule::new(*owner_id)),
                        event,
                    );
                    self.slots.insert(*id, state);
                }
            }
            Event::SlotUpdated { id, .. } | Event::SlotDeleted { id } => {
                if let Some(state) = self.slots.get_mut(id) {
                    if let Some(schedule) = self.schedules.get_mut(&state.slot.owner_id) {
                        apply_to_schedule(schedule, event);
                    }
                    apply_to_slot(state, event);
                    if state.deleted {
                        self.slots.remove(id);
                    }
                }
            }
            Event::BookingReserved { slot_id, .. } | Event::BookingCancelled { slot_id, .. } => {
                if let Some(state) = self.slots.get_mut(slot_id) {
                    apply_to_slot(state, event);
                }
            }
            Event::UserPurged { user_id, .. } => {
                for state in self.slots.values_mut() {
                    apply_to_slot(state, event);
                }
                self.slots.retain(|_, state| !state.deleted);
                if let Some(schedule) = self.schedules.get_mut(user_id) {
                    apply_to_schedule(schedule, event);
                }
            }
        }
    }

    /// The minimal event sequence that recreates this snapshot.
    pub fn into_events(self) -> Vec<Event> {
        let mut events = Vec::new();
        for state in self.slots.into_values() {
            let slot = state.slot;
            events.push(Event::SlotCreated {
                id: slot.id,
                owner_id: slot.owner_id,
                title: slot.title,
                description: slot.description,
                span: slot.span,
                max_participants: slot.max_participants,
                is_available: slot.is_available,
                created_at: slot.created_at,
                updated_at: slot.updated_at,
            });
            for booking in state.bookings {
                events.push(Event::BookingReserved {
                    id: booking.id,
                    slot_id: booking.slot_id,
                    user_id: booking.user_id,
                    notes: booking.notes,
                    booked_at: booking.booked_at,
                });
                if let Some(cancelled_at) = booking.cancelled_at {
                    events.push(Event::BookingCancelled {
                        id: booking.id,
                        slot_id: booking.slot_id,
                        cancelled_at,
                    });
                }
            }
        }
        events
    }
}

/// Rewrite an event log as the shortest log with the same end state.
pub(crate) fn compact_events(events: &[Event]) -> Vec<Event> {
    Snapshot::from_events(events).into_events()
}

/// The slot and booking tables plus their indexes.
///
/// Each slot's rows sit behind their own `RwLock` (the capacity
/// serialization point); each owner's schedule behind its own `Mutex`
/// (the conflict-check serialization point). The indexes are only written
/// from inside a commit, while the relevant locks are held.
pub struct Store {
    slots: DashMap<Ulid, SharedSlotState>,
    owners: DashMap<Ulid, SharedOwnerSchedule>,
    /// Reverse lookup: booking id → slot id.
    booking_to_slot: DashMap<Ulid, Ulid>,
    /// user id → ids of every booking row the user holds.
    user_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Slot ids claimed by a create that has not been applied yet.
    pending_slots: DashSet<Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            owners: DashMap::new(),
            booking_to_slot: DashMap::new(),
            user_bookings: DashMap::new(),
            pending_slots: DashSet::new(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        for (owner_id, schedule) in snapshot.schedules {
            store.owners.insert(owner_id, Arc::new(Mutex::new(schedule)));
        }
        for (id, state) in snapshot.slots {
            for booking in &state.bookings {
                store.index_booking(booking.id, booking.slot_id, booking.user_id);
            }
            store.slots.insert(id, Arc::new(RwLock::new(state)));
        }
        store
    }

    // ── Slot table ───────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_handles(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    /// Claim `id` for a new slot. `None` when the slot exists or another
    /// create holds the claim.
    pub(crate) fn claim_slot_id(self: &Arc<Self>, id: Ulid) -> Option<SlotIdClaim> {
        if !self.pending_slots.insert(id) {
            return None;
        }
        let claim = SlotIdClaim {
            store: Arc::clone(self),
            id,
        };
        if self.slots.contains_key(&id) {
            return None;
        }
        Some(claim)
    }

    // ── Owner schedules ──────────────────────────────────────

    /// The owner's schedule, created empty on first use.
    pub fn owner_schedule(&self, owner_id: Ulid) -> SharedOwnerSchedule {
        self.owners
            .entry(owner_id)
            .or_insert_with(|| Arc::new(Mutex::new(OwnerSchedule::new(owner_id))))
            .value()
            .clone()
    }

    // ── Booking indexes ──────────────────────────────────────

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn bookings_of_user(&self, user_id: &Ulid) -> Vec<Ulid> {
        self.user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Claim `id` in the booking index for `slot_id`. `None` when the id is
    /// taken. Caller holds the slot's write lock.
    pub(crate) fn claim_booking_id(
        self: &Arc<Self>,
        id: Ulid,
        slot_id: Ulid,
    ) -> Option<BookingIdClaim> {
        match self.booking_to_slot.entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => {
                entry.insert(slot_id);
            }
        }
        Some(BookingIdClaim {
            store: Arc::clone(self),
            id,
            kept: false,
        })
    }

    fn index_booking(&self, booking_id: Ulid, slot_id: Ulid, user_id: Ulid) {
        self.booking_to_slot.insert(booking_id, slot_id);
        self.user_bookings.entry(user_id).or_default().push(booking_id);
    }

    fn unindex_booking(&self, booking: &Booking) {
        self.booking_to_slot.remove(&booking.id);
        if let Some(mut ids) = self.user_bookings.get_mut(&booking.user_id) {
            ids.retain(|id| id != &booking.id);
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed `SlotCreated` (caller holds the owner mutex).
    pub(crate) fn apply_created(&self, schedule: &mut OwnerSchedule, event: &Event) {
        if let (Event::SlotCreated { id, .. }, Some(state)) = (event, slot_from_created(event)) {
            apply_to_schedule(schedule, event);
            self.slots.insert(*id, Arc::new(RwLock::new(state)));
        }
    }

    /// Apply a committed event to one slot and keep the indexes in step
    /// (caller holds the slot's write lock).
    pub(crate) fn apply_to_slot(&self, state: &mut SlotState, event: &Event) {
        for booking in apply_to_slot(state, event) {
            self.unindex_booking(&booking);
        }
        if let Event::BookingReserved {
            id,
            slot_id,
            user_id,
            ..
        } = event
        {
            self.index_booking(*id, *slot_id, *user_id);
        }
        if state.deleted {
            self.slots.remove(&state.slot.id);
        }
    }
}

/// A slot id held between the duplicate check and the slot's insertion.
/// Dropping it frees the id.
pub(crate) struct SlotIdClaim {
    store: Arc<Store>,
    id: Ulid,
}

impl Drop for SlotIdClaim {
    fn drop(&mut self) {
        self.store.pending_slots.remove(&self.id);
    }
}

/// A booking id entered in the reverse index ahead of its commit. Dropped
/// without `keep`, it removes the entry again.
pub(crate) struct BookingIdClaim {
    store: Arc<Store>,
    id: Ulid,
    kept: bool,
}

impl BookingIdClaim {
    pub(crate) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for BookingIdClaim {
    fn drop(&mut self) {
        if !self.kept {
            self.store.booking_to_slot.remove(&self.id);
        }
    }
}
