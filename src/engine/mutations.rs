use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, now_ms, validate_capacity, validate_span, validate_text, validate_title,
};
use super::store::apply_to_schedule;
use super::{Engine, EngineError, Store};

pub(super) fn require_active(principal: &Principal) -> Result<(), EngineError> {
    if !principal.active {
        return Err(EngineError::InactiveAccount(principal.id));
    }
    Ok(())
}

pub(super) fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    require_active(principal)?;
    if !principal.is_admin() {
        return Err(EngineError::Forbidden("admin role required"));
    }
    Ok(())
}

fn record_slot_gauge(store: &Store) {
    metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(store.slot_count() as f64);
}

impl Engine {
    pub async fn create_slot(
        &self,
        principal: &Principal,
        id: Ulid,
        draft: SlotDraft,
    ) -> Result<Slot, EngineError> {
        require_admin(principal)?;
        validate_title(&draft.title)?;
        validate_text(draft.description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;
        validate_capacity(draft.max_participants)?;
        let span = validate_span(draft.start, draft.end)?;
        if self.store.slot_count() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let schedule = self.store.owner_schedule(principal.id);
        let mut sched = schedule.lock_owned().await;
        let claim = self
            .store
            .claim_slot_id(id)
            .ok_or(EngineError::AlreadyExists(id))?;
        if let Err(e) = check_no_conflict(&sched, &span, None) {
            tracing::debug!("slot {id} for owner {} rejected: {e}", principal.id);
            return Err(e);
        }

        let now = now_ms();
        let slot = Slot {
            id,
            owner_id: principal.id,
            title: draft.title,
            description: draft.description,
            span,
            max_participants: draft.max_participants,
            current_participants: 0,
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        let event = Event::SlotCreated {
            id,
            owner_id: slot.owner_id,
            title: slot.title.clone(),
            description: slot.description.clone(),
            span,
            max_participants: slot.max_participants,
            is_available: slot.is_available,
            created_at: now,
            updated_at: now,
        };
        self.commit(event, move |store, event| {
            store.apply_created(&mut sched, event);
            drop(claim);
            record_slot_gauge(store);
        })
        .await?;

        tracing::debug!("slot {id} created by {}", principal.id);
        Ok(slot)
    }

    pub async fn update_slot(
        &self,
        principal: &Principal,
        id: Ulid,
        patch: SlotPatch,
    ) -> Result<Slot, EngineError> {
        require_admin(principal)?;
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        if let Some(description) = &patch.description {
            validate_text(description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;
        }
        if let Some(max) = patch.max_participants {
            validate_capacity(max)?;
        }
        if let (Some(start), Some(end)) = (patch.start, patch.end) {
            validate_span(start, end)?;
        }

        let rs = self
            .store
            .get_slot(&id)
            .ok_or(EngineError::SlotNotFound(id))?;
        let owner_id = rs.read().await.slot.owner_id;
        let schedule = self.store.owner_schedule(owner_id);
        let mut sched = schedule.lock_owned().await;
        let mut guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::SlotNotFound(id));
        }

        let current = &guard.slot;
        let span = validate_span(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;
        if span != current.span
            && let Err(e) = check_no_conflict(&sched, &span, Some(id))
        {
            tracing::debug!("update of slot {id} rejected: {e}");
            return Err(e);
        }
        let max_participants = patch.max_participants.unwrap_or(current.max_participants);
        if max_participants < current.current_participants {
            return Err(EngineError::CapacityBelowParticipants {
                requested: max_participants,
                current: current.current_participants,
            });
        }

        let event = Event::SlotUpdated {
            id,
            title: patch.title.unwrap_or_else(|| current.title.clone()),
            description: patch.description.unwrap_or_else(|| current.description.clone()),
            span,
            max_participants,
            is_available: patch.is_available.unwrap_or(current.is_available),
            updated_at: now_ms(),
        };
        let slot = self
            .commit(event, move |store, event| {
                apply_to_schedule(&mut sched, event);
                store.apply_to_slot(&mut guard, event);
                guard.slot.clone()
            })
            .await?;

        tracing::debug!("slot {id} updated by {}", principal.id);
        Ok(slot)
    }

    /// Remove a slot and every booking on it in one commit.
    pub async fn delete_slot(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(principal)?;
        let rs = self
            .store
            .get_slot(&id)
            .ok_or(EngineError::SlotNotFound(id))?;
        let owner_id = rs.read().await.slot.owner_id;
        let schedule = self.store.owner_schedule(owner_id);
        let mut sched = schedule.lock_owned().await;
        let mut guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::SlotNotFound(id));
        }

        let removed = guard.bookings.len();
        let event = Event::SlotDeleted { id };
        self.commit(event, move |store, event| {
            apply_to_schedule(&mut sched, event);
            store.apply_to_slot(&mut guard, event);
            record_slot_gauge(store);
        })
        .await?;

        tracing::debug!("slot {id} deleted by {} ({removed} bookings removed)", principal.id);
        Ok(())
    }

    pub async fn book_slot(
        &self,
        principal: &Principal,
        id: Ulid,
        slot_id: Ulid,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        Ok(self.book_slot_detail(principal, id, slot_id, notes).await?.booking)
    }

    /// Like `book_slot`, also returning the slot as the booking left it.
    pub async fn book_slot_detail(
        &self,
        principal: &Principal,
        id: Ulid,
        slot_id: Ulid,
        notes: Option<String>,
    ) -> Result<BookingDetail, EngineError> {
        require_active(principal)?;
        self.reserve(id, slot_id, principal.id, notes).await
    }

    pub async fn cancel_booking(
        &self,
        principal: &Principal,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        require_active(principal)?;
        self.release(booking_id, principal).await
    }

    /// Remove every slot `user_id` owns and every booking `user_id` holds,
    /// as one commit.
    ///
    /// Lock order: the user's schedule mutex, then the affected slots in
    /// ascending id order.
    pub async fn purge_user(
        &self,
        principal: &Principal,
        user_id: Ulid,
    ) -> Result<PurgeReport, EngineError> {
        require_admin(principal)?;

        let schedule = self.store.owner_schedule(user_id);
        let mut sched = schedule.lock_owned().await;

        let mut slot_ids: Vec<Ulid> = sched.entries.iter().map(|e| e.slot_id).collect();
        slot_ids.extend(
            self.store
                .bookings_of_user(&user_id)
                .iter()
                .filter_map(|b| self.store.slot_for_booking(b)),
        );
        slot_ids.sort();
        slot_ids.dedup();

        let mut guards = Vec::with_capacity(slot_ids.len());
        for sid in &slot_ids {
            if let Some(rs) = self.store.get_slot(sid) {
                let guard = rs.write_owned().await;
                if !guard.deleted {
                    guards.push(guard);
                }
            }
        }

        let mut owned = Vec::new();
        let mut booking_ids = Vec::new();
        let mut report = PurgeReport::default();
        for guard in &guards {
            if guard.slot.owner_id == user_id {
                owned.push(guard.slot.id);
                report.slots_removed += 1;
                report.bookings_removed += guard.bookings.len();
            } else {
                let held: Vec<Ulid> = guard
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == user_id)
                    .map(|b| b.id)
                    .collect();
                report.bookings_removed += held.len();
                booking_ids.extend(held);
            }
        }
        if owned.is_empty() && booking_ids.is_empty() {
            return Ok(report);
        }

        let event = Event::UserPurged {
            user_id,
            slot_ids: owned,
            booking_ids,
        };
        self.commit(event, move |store, event| {
            apply_to_schedule(&mut sched, event);
            for guard in guards.iter_mut() {
                store.apply_to_slot(guard, event);
            }
            record_slot_gauge(store);
        })
        .await?;

        tracing::info!(
            "user {user_id} purged by {}: {} slots, {} bookings",
            principal.id,
            report.slots_removed,
            report.bookings_removed
        );
        Ok(report)
    }
}
