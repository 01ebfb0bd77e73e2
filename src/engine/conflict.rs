use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// `end > start`, both inside the accepted timestamp window.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_capacity(max_participants: u32) -> Result<(), EngineError> {
    if max_participants == 0 || max_participants > MAX_PARTICIPANTS {
        return Err(EngineError::InvalidCapacity(max_participants));
    }
    Ok(())
}

pub(crate) fn validate_title(title: &str) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::LimitExceeded("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

pub(crate) fn validate_text(
    text: Option<&str>,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// First slot of `owner_id` in `existing` whose range overlaps `candidate`.
///
/// Ranges are half-open, so a slot ending exactly when the candidate starts
/// is not a conflict. Slots of other owners never conflict. `exclude` skips
/// the slot being edited.
pub fn find_conflict<'a, I>(
    owner_id: Ulid,
    candidate: &Span,
    existing: I,
    exclude: Option<Ulid>,
) -> Option<Ulid>
where
    I: IntoIterator<Item = &'a ScheduledSpan>,
{
    existing
        .into_iter()
        .filter(|e| e.owner_id == owner_id && Some(e.slot_id) != exclude)
        .find(|e| e.span.overlaps(candidate))
        .map(|e| e.slot_id)
}

/// Does `[candidate_start, candidate_end)` overlap any slot `owner_id` already has?
pub fn conflicts<'a, I>(owner_id: Ulid, candidate_start: Ms, candidate_end: Ms, existing: I) -> bool
where
    I: IntoIterator<Item = &'a ScheduledSpan>,
{
    let candidate = Span {
        start: candidate_start,
        end: candidate_end,
    };
    find_conflict(owner_id, &candidate, existing, None).is_some()
}

/// Conflict check against an owner's locked schedule.
pub(crate) fn check_no_conflict(
    schedule: &OwnerSchedule,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(
        schedule.owner_id,
        candidate,
        schedule.overlapping(candidate),
        exclude,
    ) {
        Some(slot_id) => Err(EngineError::SlotConflict(slot_id)),
        None => Ok(()),
    }
}
