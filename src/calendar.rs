use chrono::{Days, NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::error::ReservationError;
use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

/// Hours a session is open, in the resource's local time.
///
/// `close_hour <= open_hour` means the session runs past midnight and closes on the
/// following calendar day; `close_hour == open_hour` is a 24-hour session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingWindow {
    open_hour: u32,
    close_hour: u32,
}

impl OperatingWindow {
    pub fn new(open_hour: u32, close_hour: u32) -> Result<Self, ReservationError> {
        if open_hour > 23 || close_hour > 23 {
            return Err(ReservationError::invalid("operating hours must be within 0..=23"));
        }
        Ok(Self { open_hour, close_hour })
    }

    /// `(day_offset, hour)` for every slot of a session, in order.
    fn hours(&self) -> Vec<(u64, u32)> {
        if self.close_hour > self.open_hour {
            return (self.open_hour..self.close_hour).map(|h| (0, h)).collect();
        }
        (self.open_hour..24)
            .map(|h| (0, h))
            .chain((0..self.close_hour).map(|h| (1, h)))
            .collect()
    }
}

/// Price of one slot keyed by its local starting hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTable {
    by_hour: [Minor; 24],
}

impl PriceTable {
    /// Two bands: `night` for hours in `[night_start, night_end)` (wrapping past
    /// midnight when `night_end <= night_start`), `day` for everything else.
    pub fn day_night(day: Minor, night: Minor, night_start: u32, night_end: u32) -> Self {
        let mut by_hour = [day; 24];
        for (hour, price) in by_hour.iter_mut().enumerate() {
            let h = hour as u32;
            let is_night = match night_start.cmp(&night_end) {
                std::cmp::Ordering::Less => h >= night_start && h < night_end,
                std::cmp::Ordering::Greater => h >= night_start || h < night_end,
                std::cmp::Ordering::Equal => false,
            };
            if is_night {
                *price = night;
            }
        }
        Self { by_hour }
    }

    pub fn price_for_hour(&self, hour: u32) -> Minor {
        self.by_hour[(hour % 24) as usize]
    }
}

/// Total for a contiguous run of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub slot_count: u32,
    pub amount_minor: Minor,
}

/// Generates the canonical bookable slots of the turf. Pure: no clock, no I/O.
#[derive(Debug, Clone)]
pub struct SlotCalendar {
    tz: Tz,
    window: OperatingWindow,
    prices: PriceTable,
}

impl Default for SlotCalendar {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            window: OperatingWindow { open_hour: 7, close_hour: 2 },
            prices: PriceTable::day_night(1500, 1600, 23, 2),
        }
    }
}

impl SlotCalendar {
    pub fn new(tz: Tz, window: OperatingWindow, prices: PriceTable) -> Self {
        Self { tz, window, prices }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn price_for_hour(&self, hour: u32) -> Minor {
        self.prices.price_for_hour(hour)
    }

    /// Slots of the session that opens on `date`, including hours that wrap into the
    /// next calendar day. Local hours skipped by a DST transition produce no slot.
    pub fn slots(&self, date: NaiveDate) -> Vec<TimeSlot> {
        let mut slots = Vec::new();
        for (day_offset, hour) in self.window.hours() {
            let Some(day) = date.checked_add_days(Days::new(day_offset)) else {
                continue;
            };
            let Some(naive) = day.and_hms_opt(hour, 0, 0) else {
                continue;
            };
            let Some(local) = self.tz.from_local_datetime(&naive).earliest() else {
                continue;
            };
            let start = local.timestamp_millis();
            slots.push(TimeSlot {
                hour,
                label: local.format("%-I:00 %p").to_string(),
                price_per_hour_minor: self.prices.price_for_hour(hour),
                span: Span::new(start, start + HOUR_MS),
                booked: false,
            });
        }
        slots
    }

    /// Slots for every session in `[from, to]`, in order.
    pub fn slots_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TimeSlot>, ReservationError> {
        if to < from {
            return Err(ReservationError::invalid("end date before start date"));
        }
        if (to - from).num_days() >= MAX_QUERY_DAYS {
            return Err(ReservationError::invalid("date range too wide"));
        }
        let mut slots = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            slots.extend(self.slots(date));
        }
        Ok(slots)
    }

    /// UTC range from the first slot's start to the last slot's end.
    pub fn session_span(&self, date: NaiveDate) -> Option<Span> {
        let slots = self.slots(date);
        match (slots.first(), slots.last()) {
            (Some(first), Some(last)) => Some(Span::new(first.span.start, last.span.end)),
            _ => None,
        }
    }

    /// Price a proposed booking. `span` must be a contiguous run of whole slots inside
    /// the session of `date`.
    pub fn quote(&self, date: NaiveDate, span: &Span) -> Result<Quote, ReservationError> {
        if span.start >= span.end {
            return Err(ReservationError::invalid("start must be before end"));
        }
        let slots = self.slots(date);
        let first = slots
            .iter()
            .position(|s| s.span.start == span.start)
            .ok_or_else(|| {
                ReservationError::invalid("start is not a slot boundary within operating hours")
            })?;

        let mut slot_count = 0u32;
        let mut amount_minor: Minor = 0;
        let mut cursor = span.start;
        for slot in &slots[first..] {
            if slot.span.start != cursor {
                break;
            }
            slot_count += 1;
            amount_minor += slot.price_per_hour_minor;
            cursor = slot.span.end;
            if cursor == span.end {
                return Ok(Quote { slot_count, amount_minor });
            }
        }
        Err(ReservationError::invalid(
            "end is not a slot boundary within operating hours",
        ))
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, ReservationError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| ReservationError::invalid(format!("invalid date {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc_calendar() -> SlotCalendar {
        SlotCalendar::new(
            chrono_tz::UTC,
            OperatingWindow::new(7, 2).unwrap(),
            PriceTable::day_night(1500, 1600, 23, 2),
        )
    }

    fn utc_ms(s: &str) -> Ms {
        chrono::DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    #[test]
    fn session_covers_wraparound_hours() {
        let slots = SlotCalendar::default().slots(date(2026, 2, 12));
        let hours: Vec<u32> = slots.iter().map(|s| s.hour).collect();
        let mut expected: Vec<u32> = (7..24).collect();
        expected.extend([0, 1]);
        assert_eq!(hours, expected);
        assert!(slots.iter().all(|s| !s.booked));
        assert!(slots.iter().all(|s| s.span.end - s.span.start == HOUR_MS));
    }

    #[test]
    fn slots_are_contiguous_and_ordered() {
        let slots = SlotCalendar::default().slots(date(2026, 2, 12));
        for pair in slots.windows(2) {
            assert_eq!(pair[0].span.end, pair[1].span.start);
        }
    }

    #[test]
    fn kolkata_offset_applied_at_boundary() {
        let slots = SlotCalendar::default().slots(date(2026, 2, 12));
        // 07:00 IST == 01:30Z
        assert_eq!(slots[0].span.start, utc_ms("2026-02-12T01:30:00Z"));
        assert_eq!(slots[0].label, "7:00 AM");
        // 01:00 IST on the 13th closes the session
        let last = slots.last().unwrap();
        assert_eq!(last.label, "1:00 AM");
        assert_eq!(last.span.end, utc_ms("2026-02-12T20:30:00Z"));
    }

    #[test]
    fn generation_is_deterministic() {
        let cal = SlotCalendar::default();
        assert_eq!(cal.slots(date(2026, 3, 1)), cal.slots(date(2026, 3, 1)));
    }

    #[test]
    fn day_and_night_prices() {
        let cal = SlotCalendar::default();
        assert_eq!(cal.price_for_hour(7), 1500);
        assert_eq!(cal.price_for_hour(22), 1500);
        assert_eq!(cal.price_for_hour(23), 1600);
        assert_eq!(cal.price_for_hour(0), 1600);
        assert_eq!(cal.price_for_hour(1), 1600);
        assert_eq!(cal.price_for_hour(2), 1500);
    }

    #[test]
    fn price_table_non_wrapping_band() {
        let table = PriceTable::day_night(100, 200, 18, 21);
        assert_eq!(table.price_for_hour(17), 100);
        assert_eq!(table.price_for_hour(18), 200);
        assert_eq!(table.price_for_hour(20), 200);
        assert_eq!(table.price_for_hour(21), 100);
    }

    #[test]
    fn quote_two_late_slots() {
        let cal = utc_calendar();
        let span = Span::new(utc_ms("2026-02-12T22:00:00Z"), utc_ms("2026-02-13T00:00:00Z"));
        let q = cal.quote(date(2026, 2, 12), &span).unwrap();
        assert_eq!(q, Quote { slot_count: 2, amount_minor: 3100 });
    }

    #[test]
    fn quote_across_midnight_belongs_to_queried_date() {
        let cal = utc_calendar();
        let span = Span::new(utc_ms("2026-02-12T23:00:00Z"), utc_ms("2026-02-13T02:00:00Z"));
        let q = cal.quote(date(2026, 2, 12), &span).unwrap();
        assert_eq!(q.slot_count, 3);
        assert_eq!(q.amount_minor, 4800);
        // The same range is not part of the 13th's session.
        assert!(cal.quote(date(2026, 2, 13), &span).is_err());
    }

    #[test]
    fn quote_rejects_misaligned_and_out_of_hours() {
        let cal = utc_calendar();
        let d = date(2026, 2, 12);
        let half = Span::new(utc_ms("2026-02-12T08:30:00Z"), utc_ms("2026-02-12T09:30:00Z"));
        assert!(matches!(cal.quote(d, &half), Err(ReservationError::InvalidInput(_))));
        let early = Span::new(utc_ms("2026-02-12T05:00:00Z"), utc_ms("2026-02-12T08:00:00Z"));
        assert!(cal.quote(d, &early).is_err());
        let late = Span::new(utc_ms("2026-02-13T01:00:00Z"), utc_ms("2026-02-13T03:00:00Z"));
        assert!(cal.quote(d, &late).is_err());
        let short = Span::new(utc_ms("2026-02-12T08:00:00Z"), utc_ms("2026-02-12T08:30:00Z"));
        assert!(cal.quote(d, &short).is_err());
    }

    #[test]
    fn session_span_bounds() {
        let cal = utc_calendar();
        let span = cal.session_span(date(2026, 2, 12)).unwrap();
        assert_eq!(span.start, utc_ms("2026-02-12T07:00:00Z"));
        assert_eq!(span.end, utc_ms("2026-02-13T02:00:00Z"));
    }

    #[test]
    fn daytime_window_stays_on_one_day() {
        let cal = SlotCalendar::new(
            chrono_tz::UTC,
            OperatingWindow::new(9, 17).unwrap(),
            PriceTable::day_night(10, 10, 0, 0),
        );
        let slots = cal.slots(date(2026, 2, 12));
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[0].hour, 9);
        assert_eq!(slots[7].hour, 16);
    }

    #[test]
    fn dst_gap_hour_is_skipped() {
        // 2026-03-08 02:00 does not exist in New York.
        let cal = SlotCalendar::new(
            chrono_tz::America::New_York,
            OperatingWindow::new(0, 5).unwrap(),
            PriceTable::day_night(10, 10, 0, 0),
        );
        let hours: Vec<u32> = cal.slots(date(2026, 3, 8)).iter().map(|s| s.hour).collect();
        assert_eq!(hours, vec![0, 1, 3, 4]);
    }

    #[test]
    fn range_query_concatenates_sessions() {
        let cal = SlotCalendar::default();
        let slots = cal.slots_between(date(2026, 2, 12), date(2026, 2, 13)).unwrap();
        assert_eq!(slots.len(), 38);
        assert!(cal.slots_between(date(2026, 2, 13), date(2026, 2, 12)).is_err());
        assert!(cal.slots_between(date(2026, 1, 1), date(2026, 3, 1)).is_err());
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert_eq!(parse_date("2026-02-12").unwrap(), date(2026, 2, 12));
        assert!(matches!(parse_date("2026-13-01"), Err(ReservationError::InvalidInput(_))));
        assert!(parse_date("12/02/2026").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn window_rejects_bad_hours() {
        assert!(OperatingWindow::new(24, 2).is_err());
        assert!(OperatingWindow::new(7, 30).is_err());
    }
}
