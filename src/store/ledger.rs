use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::model::*;

use super::StoreError;

/// In-memory image of the log: every booking ever committed, its payment, and a
/// start-sorted index of the confirmed ones.
#[derive(Debug, Default)]
pub struct Ledger {
    bookings: HashMap<Ulid, Booking>,
    /// Keyed by booking id.
    payments: HashMap<Ulid, Payment>,
    gateway_payment_ids: HashSet<String>,
    /// Confirmed `(span, booking id)`, sorted by `span.start`.
    confirmed: Vec<(Span, Ulid)>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    pub fn record(&self, id: &Ulid) -> Option<BookingRecord> {
        self.bookings.get(id).map(|b| BookingRecord {
            booking: b.clone(),
            payment: self.payments.get(id).cloned(),
        })
    }

    pub fn records(&self) -> impl Iterator<Item = BookingRecord> + '_ {
        self.bookings.values().map(|b| BookingRecord {
            booking: b.clone(),
            payment: self.payments.get(&b.id).cloned(),
        })
    }

    /// Confirmed bookings overlapping `query`. Binary search skips those starting at or
    /// after `query.end`.
    pub fn overlapping_confirmed(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.confirmed.partition_point(|(s, _)| s.start < query.end);
        self.confirmed[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
            .filter_map(move |(_, id)| self.bookings.get(id))
    }

    /// Constraints a commit must satisfy: unique ids, one payment per booking, one booking
    /// per gateway payment, no overlap between confirmed bookings.
    pub fn check_insert(&self, booking: &Booking, payment: &Payment) -> Result<(), StoreError> {
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::UniqueViolation("booking.id"));
        }
        if payment.booking_id != booking.id || self.payments.contains_key(&payment.booking_id) {
            return Err(StoreError::UniqueViolation("payment.booking_id"));
        }
        if self.gateway_payment_ids.contains(&payment.gateway_payment_id) {
            return Err(StoreError::UniqueViolation("payment.gateway_payment_id"));
        }
        if booking.is_confirmed()
            && let Some(existing) = self.overlapping_confirmed(&booking.span).next()
        {
            return Err(StoreError::ExclusionViolation(existing.id));
        }
        Ok(())
    }

    /// Apply a logged event, rejecting a commit the live store would have refused.
    pub fn replay(&mut self, event: &Event) -> Result<(), StoreError> {
        if let Event::ReservationCommitted { booking, payment } = event {
            self.check_insert(booking, payment)?;
        }
        self.apply(event);
        Ok(())
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCommitted { booking, payment } => {
                if booking.is_confirmed() {
                    self.index_confirmed(booking.span, booking.id);
                }
                self.gateway_payment_ids.insert(payment.gateway_payment_id.clone());
                self.payments.insert(payment.booking_id, payment.clone());
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled { id } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Cancelled;
                }
                if let Some(p) = self.payments.get_mut(id)
                    && p.status == PaymentStatus::Paid
                {
                    p.status = PaymentStatus::Refunded;
                }
                self.confirmed.retain(|(_, bid)| bid != id);
            }
        }
    }

    /// Minimal log that rebuilds this ledger: one committed record per booking,
    /// carrying its current status.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut bookings: Vec<&Booking> = self.bookings.values().collect();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        bookings
            .into_iter()
            .filter_map(|b| {
                self.payments.get(&b.id).map(|p| Event::ReservationCommitted {
                    booking: b.clone(),
                    payment: p.clone(),
                })
            })
            .collect()
    }

    fn index_confirmed(&mut self, span: Span, id: Ulid) {
        let pos = self
            .confirmed
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.confirmed.insert(pos, (span, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const H: Ms = HOUR_MS;

    fn pair(start: Ms, end: Ms, pay: &str) -> (Booking, Payment) {
        let id = Ulid::new();
        (
            Booking {
                id,
                user_id: "u".into(),
                resource_date: NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
                span: Span::new(start, end),
                slot_count: ((end - start) / H) as u32,
                amount_minor: 1500,
                status: BookingStatus::Confirmed,
                created_at: start,
            },
            Payment {
                id: Ulid::new(),
                booking_id: id,
                gateway_order_id: format!("order_{pay}"),
                gateway_payment_id: pay.into(),
                gateway_signature: String::new(),
                amount_minor: 1500,
                status: PaymentStatus::Paid,
            },
        )
    }

    fn commit(ledger: &mut Ledger, (booking, payment): (Booking, Payment)) -> Ulid {
        let id = booking.id;
        ledger.check_insert(&booking, &payment).unwrap();
        ledger.apply(&Event::ReservationCommitted { booking, payment });
        id
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut l = Ledger::new();
        commit(&mut l, pair(0, H, "p1"));
        let mid = commit(&mut l, pair(4 * H, 6 * H, "p2"));
        commit(&mut l, pair(10 * H, 11 * H, "p3"));

        let hits: Vec<Ulid> = l.overlapping_confirmed(&Span::new(5 * H, 8 * H)).map(|b| b.id).collect();
        assert_eq!(hits, vec![mid]);
    }

    #[test]
    fn adjacent_not_overlapping() {
        let mut l = Ledger::new();
        commit(&mut l, pair(H, 2 * H, "p1"));
        assert_eq!(l.overlapping_confirmed(&Span::new(2 * H, 3 * H)).count(), 0);
        assert_eq!(l.overlapping_confirmed(&Span::new(0, H)).count(), 0);
    }

    #[test]
    fn exclusion_rejects_overlap() {
        let mut l = Ledger::new();
        let first = commit(&mut l, pair(H, 3 * H, "p1"));
        let (b, p) = pair(2 * H, 4 * H, "p2");
        assert!(matches!(l.check_insert(&b, &p), Err(StoreError::ExclusionViolation(id)) if id == first));
    }

    #[test]
    fn gateway_payment_id_unique() {
        let mut l = Ledger::new();
        commit(&mut l, pair(H, 2 * H, "p1"));
        let (b, p) = pair(5 * H, 6 * H, "p1");
        assert!(matches!(
            l.check_insert(&b, &p),
            Err(StoreError::UniqueViolation("payment.gateway_payment_id"))
        ));
    }

    #[test]
    fn cancel_frees_range_and_refunds() {
        let mut l = Ledger::new();
        let id = commit(&mut l, pair(H, 2 * H, "p1"));
        l.apply(&Event::BookingCancelled { id });

        assert_eq!(l.booking(&id).unwrap().status, BookingStatus::Cancelled);
        assert_eq!(l.record(&id).unwrap().payment.unwrap().status, PaymentStatus::Refunded);
        assert_eq!(l.overlapping_confirmed(&Span::new(0, 10 * H)).count(), 0);

        // The range can be booked again; the gateway payment cannot be reused.
        let (b, p) = pair(H, 2 * H, "p2");
        assert!(l.check_insert(&b, &p).is_ok());
    }

    #[test]
    fn replay_rejects_overlapping_commit() {
        let mut l = Ledger::new();
        let (b1, p1) = pair(H, 2 * H, "p1");
        let (b2, p2) = pair(H, 2 * H, "p2");
        let first = b1.id;
        l.replay(&Event::ReservationCommitted { booking: b1, payment: p1 }).unwrap();
        let err = l.replay(&Event::ReservationCommitted { booking: b2, payment: p2 }).unwrap_err();
        assert!(matches!(err, StoreError::ExclusionViolation(id) if id == first));
        assert_eq!(l.len(), 1);
        assert!(!l.gateway_payment_ids.contains("p2"));
    }

    #[test]
    fn snapshot_rebuilds_same_state() {
        let mut l = Ledger::new();
        let a = commit(&mut l, pair(H, 2 * H, "p1"));
        let b = commit(&mut l, pair(3 * H, 5 * H, "p2"));
        l.apply(&Event::BookingCancelled { id: a });

        let mut rebuilt = Ledger::new();
        for e in l.snapshot_events() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.booking(&a).unwrap().status, BookingStatus::Cancelled);
        let hits: Vec<Ulid> = rebuilt
            .overlapping_confirmed(&Span::new(0, 10 * H))
            .map(|x| x.id)
            .collect();
        assert_eq!(hits, vec![b]);
    }
}
