use crate::model::*;

// ── Availability ─────────────────────────────────────────────────

/// Mark each candidate slot booked iff a confirmed booking overlaps it.
///
/// `confirmed` need not be sorted. Slots come back in the order given.
pub fn mark_booked(mut slots: Vec<TimeSlot>, confirmed: &[Span]) -> Vec<TimeSlot> {
    let mut taken = confirmed.to_vec();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);

    for slot in &mut slots {
        // Everything at index >= right_bound starts at or after slot.end.
        let right_bound = taken.partition_point(|b| b.start < slot.span.end);
        slot.booked = taken[..right_bound]
            .iter()
            .any(|b| b.overlaps(&slot.span));
    }
    slots
}

/// Free ranges of `session` once `confirmed` bookings are removed.
pub fn free_spans(session: &Span, confirmed: &[Span]) -> Vec<Span> {
    let mut taken: Vec<Span> = confirmed
        .iter()
        .filter(|b| b.overlaps(session))
        .copied()
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&[*session], &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
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
