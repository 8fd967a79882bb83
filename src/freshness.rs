//! Freshness policies
//!
//! A freshness policy turns "now" and freshly fetched data into the instant
//! the data stops being servable as current. Most sources use a flat TTL;
//! sources whose upstream publishes at fixed local times use
//! [`PublicationCutoff`] so that a re-fetch happens exactly when new data
//! should exist.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Computes when freshly fetched data expires
pub trait FreshnessPolicy<T: ?Sized> {
    /// Expiration instant for `data` fetched at `now`
    fn expires_at(&self, now: DateTime<Utc>, data: &T) -> DateTime<Utc>;
}

/// Constant time-to-live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatTtl(pub Duration);

impl<T: ?Sized> FreshnessPolicy<T> for FlatTtl {
    fn expires_at(&self, now: DateTime<Utc>, _data: &T) -> DateTime<Utc> {
        now + self.0
    }
}

/// Flat TTL that never runs past the next local midnight
///
/// For payloads filtered relative to the current local day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidnightCapped {
    /// Regular time-to-live
    pub ttl: Duration,
    /// Timezone defining midnight
    pub timezone: Tz,
}

impl<T: ?Sized> FreshnessPolicy<T> for MidnightCapped {
    fn expires_at(&self, now: DateTime<Utc>, _data: &T) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let midnight = today
            .succ_opt()
            .zip(NaiveTime::from_hms_opt(0, 0, 0))
            .map(|(tomorrow, start)| local_instant(self.timezone, tomorrow, start));
        match midnight {
            Some(midnight) => (now + self.ttl).min(midnight),
            None => now + self.ttl,
        }
    }
}

/// Policy for data published at known local times each day
///
/// - before `first_cutoff`: the data is provisional, expire at today's
///   `first_cutoff`
/// - once `published` confirms the expected data is in, or at/after
///   `final_cutoff`: expire at tomorrow's `first_cutoff`
/// - otherwise: retry after `retry_ttl`, since the exact publication instant
///   is not guaranteed
///
/// All cutoffs are wall-clock times in `timezone`.
#[derive(Debug, Clone)]
pub struct PublicationCutoff<T: ?Sized> {
    /// Civil timezone the cutoffs are defined in
    pub timezone: Tz,
    /// Time from which new data may appear
    pub first_cutoff: NaiveTime,
    /// Time from which the day's data is definitive, if any
    pub final_cutoff: Option<NaiveTime>,
    /// Retry interval while waiting for publication
    pub retry_ttl: Duration,
    /// Whether `data` already includes what is expected on local day `today`
    pub published: fn(&T, NaiveDate) -> bool,
}

impl<T: ?Sized> PublicationCutoff<T> {
    /// Builds a policy from whole cutoff hours
    ///
    /// Returns `None` if an hour is outside `0..24`.
    pub fn at_hours(
        timezone: Tz,
        first_hour: u32,
        final_hour: Option<u32>,
        retry_ttl: Duration,
        published: fn(&T, NaiveDate) -> bool,
    ) -> Option<Self> {
        let first_cutoff = NaiveTime::from_hms_opt(first_hour, 0, 0)?;
        let final_cutoff = match final_hour {
            Some(hour) => Some(NaiveTime::from_hms_opt(hour, 0, 0)?),
            None => None,
        };
        Some(Self {
            timezone,
            first_cutoff,
            final_cutoff,
            retry_ttl,
            published,
        })
    }
}

impl<T: ?Sized> FreshnessPolicy<T> for PublicationCutoff<T> {
    fn expires_at(&self, now: DateTime<Utc>, data: &T) -> DateTime<Utc> {
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();
        let time = local.time();

        if time < self.first_cutoff {
            return local_instant(self.timezone, today, self.first_cutoff);
        }

        let past_final = self.final_cutoff.is_some_and(|cutoff| time >= cutoff);
        if past_final || (self.published)(data, today) {
            return match today.succ_opt() {
                Some(tomorrow) => local_instant(self.timezone, tomorrow, self.first_cutoff),
                None => now + self.retry_ttl,
            };
        }

        now + self.retry_ttl
    }
}

/// Converts a local wall-clock time to an instant
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant; times that
/// do not exist (DST spring-forward gap) resolve to the same wall-clock time
/// one hour later.
pub fn local_instant(timezone: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
        })
        .map(|instant| instant.with_timezone(&Utc))
        .unwrap_or_else(|| timezone.from_utc_datetime(&naive).with_timezone(&Utc))
}

/// Local midnight starting `date`, as an instant carrying the local offset
pub fn local_day_start(timezone: Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default();
    local_instant(timezone, date, midnight).with_timezone(&timezone)
}
