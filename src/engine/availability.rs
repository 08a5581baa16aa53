use chrono::NaiveDate;
use tracing::warn;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Resolve one date's free intervals from recurring windows and dated exceptions.
///
/// Windows for the date's weekday with `is_available` are unioned; exceptions
/// on the exact date are unioned and then subtracted. Exceptions always win.
/// Malformed records (empty, inverted, outside the day) are logged and skipped.
/// Output is sorted, disjoint, and free of zero-length intervals.
pub fn resolve_day(
    windows: &[AvailabilityWindow],
    exceptions: &[UnavailableSlot],
    date: NaiveDate,
) -> Vec<Span> {
    let day = weekday_index(date);

    let mut open: Vec<Span> = windows
        .iter()
        .filter(|w| w.day_of_week == day && w.is_available)
        .filter_map(|w| {
            let span = w.span();
            if span.is_none() {
                warn!(window = %w.id, start = w.start, end = w.end, "skipping malformed availability window");
            }
            span
        })
        .collect();
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    let mut closed: Vec<Span> = exceptions
        .iter()
        .filter(|e| e.date == date)
        .filter_map(|e| {
            let span = e.span();
            if span.is_none() {
                warn!(exception = %e.id, start = e.start, end = e.end, "skipping malformed unavailable slot");
            }
            span
        })
        .collect();
    if closed.is_empty() {
        return open;
    }
    closed.sort_by_key(|s| s.start);
    let closed = merge_overlapping(&closed);

    subtract_intervals(&open, &closed)
}

/// Collapse sorted spans into disjoint ones. Touching spans join.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    sorted.iter().fold(Vec::with_capacity(sorted.len()), |mut acc: Vec<Span>, &span| {
        if let Some(last) = acc.last_mut().filter(|last| span.start <= last.end) {
            last.end = last.end.max(span.end);
        } else {
            acc.push(span);
        }
        acc
    })
}

/// Cut `holes` out of `base`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], holes: &[Span]) -> Vec<Span> {
    let mut out = Vec::with_capacity(base.len());
    let mut pending = holes.iter().peekable();

    for b in base {
        // Holes ending by this span's start cannot reach any later span either.
        while pending.next_if(|h| h.end <= b.start).is_some() {}

        let mut cursor = b.start;
        for h in pending.clone().take_while(|h| h.start < b.end) {
            if h.start > cursor {
                out.push(Span::new(cursor, h.start));
            }
            cursor = cursor.max(h.end);
        }
        if cursor < b.end {
            out.push(Span::new(cursor, b.end));
        }
    }

    out
}
