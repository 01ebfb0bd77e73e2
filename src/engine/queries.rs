use std::cmp::Reverse;
use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::mutations::{require_active, require_admin};
use super::{Engine, EngineError};

/// Build a page from optional client-supplied values.
/// `skip` defaults to 0 and must not be negative; `take` defaults to
/// `DEFAULT_PAGE_SIZE` and must lie in `1..=MAX_PAGE_SIZE`.
pub fn page_from(skip: Option<i64>, take: Option<i64>) -> Result<Page, EngineError> {
    let skip = match skip {
        None => 0,
        Some(n) => usize::try_from(n).map_err(|_| EngineError::InvalidPage("skip must be >= 0"))?,
    };
    let take = match take {
        None => DEFAULT_PAGE_SIZE,
        Some(n) => usize::try_from(n).map_err(|_| EngineError::InvalidPage("take must be >= 1"))?,
    };
    let page = Page { skip, take };
    check_page(&page)?;
    Ok(page)
}

fn check_page(page: &Page) -> Result<(), EngineError> {
    if page.take == 0 || page.take > MAX_PAGE_SIZE {
        return Err(EngineError::InvalidPage("take must be between 1 and 100"));
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, page: &Page) -> Vec<T> {
    items.into_iter().skip(page.skip).take(page.take).collect()
}

/// Newest first; id breaks ties so paging is stable.
fn sort_newest_first(details: &mut [BookingDetail]) {
    details.sort_by_key(|d| Reverse((d.booking.booked_at, d.booking.id)));
}

impl Engine {
    pub async fn get_slot(&self, principal: &Principal, id: Ulid) -> Result<Slot, EngineError> {
        require_active(principal)?;
        let rs = self
            .store
            .get_slot(&id)
            .ok_or(EngineError::SlotNotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::SlotNotFound(id));
        }
        Ok(guard.slot.clone())
    }

    /// Slots matching `filter`, ordered by start time.
    pub async fn list_slots(
        &self,
        principal: &Principal,
        filter: SlotFilter,
        page: Page,
    ) -> Result<Vec<Slot>, EngineError> {
        require_active(principal)?;
        check_page(&page)?;

        let mut slots = Vec::new();
        for rs in self.store.slot_handles() {
            let guard = rs.read().await;
            if !guard.deleted && filter.matches(&guard.slot) {
                slots.push(guard.slot.clone());
            }
        }
        slots.sort_by_key(|s| (s.span.start, s.id));
        Ok(paginate(slots, &page))
    }

    /// A booking with its slot. Visible to the booking's user and to admins.
    pub async fn get_booking(
        &self,
        principal: &Principal,
        booking_id: Ulid,
    ) -> Result<BookingDetail, EngineError> {
        require_active(principal)?;
        let slot_id = self
            .store
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let guard = rs.read().await;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if booking.user_id != principal.id && !principal.is_admin() {
            return Err(EngineError::Forbidden("not your booking"));
        }
        Ok(BookingDetail {
            booking: booking.clone(),
            slot: guard.slot.clone(),
        })
    }

    /// The caller's bookings, newest first.
    pub async fn list_my_bookings(
        &self,
        principal: &Principal,
        page: Page,
    ) -> Result<Vec<BookingDetail>, EngineError> {
        require_active(principal)?;
        check_page(&page)?;

        let mut by_slot: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for booking_id in self.store.bookings_of_user(&principal.id) {
            if let Some(slot_id) = self.store.slot_for_booking(&booking_id) {
                by_slot.entry(slot_id).or_default().push(booking_id);
            }
        }

        let mut details = Vec::new();
        for (slot_id, booking_ids) in by_slot {
            let Some(rs) = self.store.get_slot(&slot_id) else {
                continue;
            };
            let guard = rs.read().await;
            details.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| booking_ids.contains(&b.id) && b.user_id == principal.id)
                    .map(|b| BookingDetail {
                        booking: b.clone(),
                        slot: guard.slot.clone(),
                    }),
            );
        }
        sort_newest_first(&mut details);
        Ok(paginate(details, &page))
    }

    /// Every booking in the system, newest first. Admin only.
    pub async fn list_all_bookings(
        &self,
        principal: &Principal,
        page: Page,
    ) -> Result<Vec<BookingDetail>, EngineError> {
        require_admin(principal)?;
        check_page(&page)?;

        let mut details = Vec::new();
        for rs in self.store.slot_handles() {
            let guard = rs.read().await;
            details.extend(guard.bookings.iter().map(|b| BookingDetail {
                booking: b.clone(),
                slot: guard.slot.clone(),
            }));
        }
        sort_newest_first(&mut details);
        Ok(paginate(details, &page))
    }
}
