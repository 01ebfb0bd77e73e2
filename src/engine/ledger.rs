use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_text};
use super::{Engine, EngineError};

/// Can `user_id` take a seat in this slot right now?
///
/// Must be evaluated under the slot's write lock, immediately before the
/// reservation is committed.
pub fn check_reservable(
    state: &SlotState,
    user_id: Ulid,
    policy: RebookPolicy,
) -> Result<(), EngineError> {
    let slot = &state.slot;
    if state.deleted {
        return Err(EngineError::SlotNotFound(slot.id));
    }
    if !slot.is_available || slot.is_full() {
        return Err(EngineError::SlotUnavailable(slot.id));
    }
    let duplicate = state
        .bookings
        .iter()
        .filter(|b| b.user_id == user_id)
        .any(|b| match policy {
            RebookPolicy::Never => true,
            RebookPolicy::AfterCancel => b.is_active(),
        });
    if duplicate {
        return Err(EngineError::DuplicateBooking {
            slot_id: slot.id,
            user_id,
        });
    }
    if state.bookings.len() >= MAX_BOOKING_ROWS_PER_SLOT {
        return Err(EngineError::LimitExceeded("too many bookings on slot"));
    }
    Ok(())
}

/// Can `requester` cancel `booking_id`? Returns the booking row on success.
pub fn check_releasable<'a>(
    state: &'a SlotState,
    booking_id: Ulid,
    requester: &Principal,
) -> Result<&'a Booking, EngineError> {
    let booking = state
        .booking(&booking_id)
        .filter(|_| !state.deleted)
        .ok_or(EngineError::BookingNotFound(booking_id))?;
    if booking.user_id != requester.id && !requester.is_admin() {
        return Err(EngineError::Forbidden("not your booking"));
    }
    if !booking.is_active() {
        return Err(EngineError::AlreadyCancelled(booking_id));
    }
    Ok(booking)
}

impl Engine {
    /// Insert an active booking and bump the slot's count, as one commit.
    /// Returns the booking with the slot as it stood after the commit.
    pub async fn reserve(
        &self,
        id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
        notes: Option<String>,
    ) -> Result<BookingDetail, EngineError> {
        validate_text(notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        let rs = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let mut guard = rs.write_owned().await;
        let claim = self
            .store
            .claim_booking_id(id, slot_id)
            .ok_or(EngineError::AlreadyExists(id))?;

        if let Err(e) = check_reservable(&guard, user_id, self.rebook_policy()) {
            tracing::debug!("reservation on {slot_id} by {user_id} rejected: {e}");
            metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind())
                .increment(1);
            return Err(e);
        }

        let event = Event::BookingReserved {
            id,
            slot_id,
            user_id,
            notes,
            booked_at: now_ms(),
        };
        let detail = self
            .commit(event, move |store, event| {
                store.apply_to_slot(&mut guard, event);
                claim.keep();
                guard.booking(&id).cloned().map(|booking| BookingDetail {
                    booking,
                    slot: guard.slot.clone(),
                })
            })
            .await?
            .ok_or(EngineError::BookingNotFound(id))?;

        tracing::debug!("booking {id} reserved on slot {slot_id} by {user_id}");
        metrics::counter!(crate::observability::BOOKINGS_RESERVED_TOTAL).increment(1);
        Ok(detail)
    }

    /// Cancel an active booking and drop the slot's count, as one commit.
    pub async fn release(&self, booking_id: Ulid, requester: &Principal) -> Result<Booking, EngineError> {
        let slot_id = self
            .store
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut guard = rs.write_owned().await;

        check_releasable(&guard, booking_id, requester)?;

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            cancelled_at: now_ms(),
        };
        let booking = self
            .commit(event, move |store, event| {
                store.apply_to_slot(&mut guard, event);
                guard.booking(&booking_id).cloned()
            })
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))?;

        tracing::debug!("booking {booking_id} on slot {slot_id} cancelled by {}", requester.id);
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        Ok(booking)
    }
}
