//! Bucket planning: which calendar days a backfill run visits, oldest first.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::Bucket;

/// Calendar date of `now` in the backfill timezone.
pub fn today_in(offset: FixedOffset, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// The `days` completed days before `today`: `today - days ..= today - 1`.
/// Days before the earliest representable date are skipped.
pub fn plan(today: NaiveDate, days: u32) -> Vec<Bucket> {
    let available = today.signed_duration_since(NaiveDate::MIN).num_days();
    (1..=i64::from(days).min(available))
        .rev()
        .filter_map(|back| today.checked_sub_signed(Duration::days(back)))
        .map(Bucket::new)
        .collect()
}

/// Every day from `from` to `to` inclusive; reversed bounds are swapped.
pub fn plan_range(from: NaiveDate, to: NaiveDate) -> Vec<Bucket> {
    let (first, last) = if to < from { (to, from) } else { (from, to) };
    first
        .iter_days()
        .take_while(|day| *day <= last)
        .map(Bucket::new)
        .collect()
}

/// Explicit day list, sorted and de-duplicated.
pub fn plan_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Vec<Bucket> {
    dates
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(Bucket::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kst;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn plan_excludes_today_and_runs_oldest_first() {
        let buckets = plan(day(2025, 3, 4), 3);
        let dates: Vec<_> = buckets.iter().map(Bucket::date).collect();
        assert_eq!(dates, vec![day(2025, 3, 1), day(2025, 3, 2), day(2025, 3, 3)]);
    }

    #[test]
    fn plan_crosses_month_and_year_boundaries() {
        let buckets = plan(day(2025, 1, 1), 2);
        assert_eq!(buckets[0].date(), day(2024, 12, 30));
        assert_eq!(buckets[1].date(), day(2024, 12, 31));
        assert_eq!(plan(day(2025, 1, 1), 180).len(), 180);
        assert!(plan(day(2025, 1, 1), 0).is_empty());
    }

    #[test]
    fn huge_day_counts_stop_at_the_earliest_date() {
        let today = NaiveDate::MIN + Duration::days(3);
        let dates: Vec<_> = plan(today, u32::MAX).iter().map(Bucket::date).collect();
        assert_eq!(dates.len(), 3);
        assert_eq!(dates[0], NaiveDate::MIN);
        assert_eq!(dates[2], today - Duration::days(1));
    }

    #[test]
    fn today_follows_the_fixed_offset() {
        // 2025-03-01 16:30 UTC is already 2025-03-02 in Seoul.
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 16, 30, 0).unwrap();
        assert_eq!(today_in(kst(), now), day(2025, 3, 2));
        assert_eq!(today_in(FixedOffset::east_opt(0).unwrap(), now), day(2025, 3, 1));
    }

    #[test]
    fn range_is_inclusive_and_order_insensitive() {
        let forward = plan_range(day(2025, 2, 27), day(2025, 3, 1));
        let backward = plan_range(day(2025, 3, 1), day(2025, 2, 27));
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
        assert_eq!(forward[2].date(), day(2025, 3, 1));
    }

    #[test]
    fn explicit_dates_are_sorted_and_unique() {
        let buckets = plan_dates([day(2025, 3, 2), day(2025, 3, 1), day(2025, 3, 2)]);
        assert_eq!(buckets, vec![Bucket::new(day(2025, 3, 1)), Bucket::new(day(2025, 3, 2))]);
    }
}
