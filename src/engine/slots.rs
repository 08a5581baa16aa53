use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

/// Candidate slot starts at a fixed stride from each free interval's start,
/// keeping only slots that end by the interval's end.
///
/// The iterator is `Clone`, so the sequence can be restarted, and finite.
/// A non-positive `duration` yields nothing.
pub fn slot_starts(free: &[Span], duration: Minute) -> impl Iterator<Item = Minute> + Clone + '_ {
    free.iter()
        .filter(move |_| duration > 0)
        .flat_map(move |f| (f.start..=f.end - duration).step_by(duration as usize))
}

/// Whether a slot starting at `start` on `date` begins before `now`.
pub fn is_past(date: NaiveDate, start: Minute, now: NaiveDateTime) -> bool {
    match instant(date, start) {
        Some(at) => at < now,
        None => true,
    }
}

/// Bookable slot starts for `date`: the stride over `free`, minus slots that
/// overlap an active appointment on that date, minus slots already in the past.
pub fn generate_slots(
    free: &[Span],
    date: NaiveDate,
    duration: Minute,
    appointments: &[Appointment],
    now: NaiveDateTime,
) -> Vec<Minute> {
    let booked: Vec<Span> = appointments
        .iter()
        .filter(|a| a.date == date && a.status.is_active())
        .map(|a| a.span)
        .collect();

    slot_starts(free, duration)
        .filter(|&start| {
            let slot = Span::new(start, start + duration);
            !booked.iter().any(|b| b.overlaps(&slot))
        })
        .filter(|&start| !is_past(date, start, now))
        .collect()
}

/// Single-slot form of [`generate_slots`]: the range must sit inside one free
/// interval, overlap no active appointment on `date`, and not start in the past.
pub fn is_slot_bookable(
    free: &[Span],
    appointments: &[Appointment],
    date: NaiveDate,
    span: Span,
    now: NaiveDateTime,
) -> bool {
    free.iter().any(|f| f.contains_span(&span))
        && !appointments
            .iter()
            .any(|a| a.date == date && a.status.is_active() && a.span.overlaps(&span))
        && !is_past(date, span.start, now)
}
