use ulid::Ulid;

use crate::model::*;

// ── Availability Checker ──────────────────────────────────────────

/// First non-canceled reservation on the space overlapping `span`, skipping
/// `exclude` (a reservation re-validating its own interval).
///
/// Overlap is half-open: `existing.end > span.start && existing.start < span.end`.
/// The caller guarantees `span.start < span.end`.
pub fn first_conflict<'a>(
    space: &'a SpaceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    space
        .overlapping(span)
        .filter(|r| r.status.holds_interval())
        .find(|r| Some(r.id) != exclude)
}

/// True iff no non-canceled reservation (other than `exclude`) overlaps `span`.
pub fn is_available(space: &SpaceState, span: &Span, exclude: Option<Ulid>) -> bool {
    first_conflict(space, span, exclude).is_none()
}

/// Free sub-intervals of `query` once every non-canceled reservation is
/// subtracted.
pub fn free_spans(space: &SpaceState, query: &Span) -> Vec<Span> {
    let mut taken: Vec<Span> = space
        .overlapping(query)
        .filter(|r| r.status.holds_interval())
        .map(|r| Span::new(r.span.start.max(query.start), r.span.end.min(query.end)))
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&[*query], &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
