use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve_day;
use super::slots::is_slot_bookable;
use super::EngineError;

/// Source of "now" in the canonical local time zone.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

/// A clock frozen at `at`.
pub fn fixed_clock(at: NaiveDateTime) -> Clock {
    Arc::new(move || at)
}

pub(crate) fn validate_range(start: Minute, end: Minute) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or_else(|| {
        EngineError::InvalidInput(format!(
            "time range must satisfy 00:00 <= start < end <= 24:00, got {start}..{end}"
        ))
    })
}

pub(crate) fn validate_duration(duration: Minute) -> Result<(), EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "slot duration must be positive, got {duration}"
        )));
    }
    if duration > MAX_SLOT_MINUTES {
        return Err(EngineError::LimitExceeded("slot duration longer than a day"));
    }
    Ok(())
}

/// Validate a booking request's bounds and build its span.
/// A slot running past midnight can never be free, so it maps to `SlotUnavailable`.
pub(crate) fn requested_span(
    professional_id: Ulid,
    date: NaiveDate,
    start: Minute,
    duration: Minute,
) -> Result<Span, EngineError> {
    validate_duration(duration)?;
    let at = instant(date, start).ok_or_else(|| {
        EngineError::InvalidInput(format!("start must be within the day, got {start}"))
    })?;
    let end = start + duration;
    if end > MINUTES_PER_DAY {
        return Err(EngineError::SlotUnavailable { professional_id, at });
    }
    Ok(Span::new(start, end))
}

/// Write-time check run under the professional's write lock: the requested
/// span must be a free, future slot and its start must not be held by another
/// active appointment.
pub(crate) fn check_bookable(
    ps: &ProfessionalState,
    date: NaiveDate,
    span: Span,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    let professional_id = ps.id();
    let unavailable = || EngineError::SlotUnavailable {
        professional_id,
        at: instant(date, span.start).unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN)),
    };

    if ps.professional.status != ProfessionalStatus::Valid {
        return Err(EngineError::ProfessionalNotBookable(professional_id));
    }
    let free = resolve_day(&ps.windows, &ps.exceptions, date);
    if !is_slot_bookable(&free, ps.appointments_on(date), date, span, now) {
        return Err(unavailable());
    }
    if ps.slot_holder(date, span.start).is_some() {
        return Err(unavailable());
    }
    Ok(())
}
