// Earliest permissible delivery time for a candidate: quiet hours, per-kind
// base delay and, for low priority, the recipient's peak hours.
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc};

use crate::models::{QuietHours, RecipientPreferences};
use crate::policy::{KindPolicy, Priority};

pub fn local_offset(prefs: &RecipientPreferences) -> FixedOffset {
    // Garbage offsets fall back to UTC
    prefs
        .utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

fn minute_of_day(at: DateTime<FixedOffset>) -> u16 {
    (at.hour() * 60 + at.minute()) as u16
}

/// Both ends are inclusive. A window with `start > end` spans midnight.
pub fn is_quiet(quiet: &QuietHours, minute: u16) -> bool {
    if quiet.wraps_midnight() {
        minute >= quiet.start_minute || minute <= quiet.end_minute
    } else {
        quiet.start_minute <= minute && minute <= quiet.end_minute
    }
}

// `minute` on the local calendar day of `day`, shifted by `days_ahead`
fn local_time_on(day: DateTime<FixedOffset>, days_ahead: i64, minute: u16) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(minute / 60), u32::from(minute % 60), 0)?;
    let date = day.date_naive() + Duration::days(days_ahead);
    day.offset()
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|at| at.with_timezone(&Utc))
}

/// Moves `now` to the end of the recipient's quiet window if it falls inside one.
pub fn clamp_to_quiet_end(now: DateTime<Utc>, prefs: &RecipientPreferences) -> DateTime<Utc> {
    let Some(quiet) = prefs.quiet_hours else {
        return now;
    };
    let local = now.with_timezone(&local_offset(prefs));
    let minute = minute_of_day(local);
    if !is_quiet(&quiet, minute) {
        return now;
    }
    // Already in the final quiet minute
    if minute == quiet.end_minute {
        return now;
    }

    match local_time_on(local, 0, quiet.end_minute) {
        Some(end_today) if end_today > now => end_today,
        _ => local_time_on(local, 1, quiet.end_minute).unwrap_or(now),
    }
}

/// First peak hour at or after `base`, at most one day later and outside quiet hours.
pub fn next_peak_hour(
    base: DateTime<Utc>,
    peak_hours: &[u32],
    prefs: &RecipientPreferences,
) -> Option<DateTime<Utc>> {
    let local = base.with_timezone(&local_offset(prefs));
    let limit = base + Duration::days(1);

    (0..=1)
        .flat_map(|days_ahead| {
            peak_hours
                .iter()
                .filter(|hour| **hour < 24)
                .filter_map(move |hour| local_time_on(local, days_ahead, (*hour * 60) as u16))
        })
        .filter(|at| *at >= base && *at <= limit)
        .filter(|at| match prefs.quiet_hours {
            Some(quiet) => !is_quiet(&quiet, minute_of_day(at.with_timezone(&local_offset(prefs)))),
            None => true,
        })
        .min()
}

pub fn plan_delivery_time(
    policy: &KindPolicy,
    prefs: &RecipientPreferences,
    peak_hours: Option<&[u32]>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    // Quiet hours never hold back urgent notifications
    if policy.priority == Priority::Urgent {
        return now;
    }

    let clamped = clamp_to_quiet_end(now, prefs);
    if policy.priority == Priority::High {
        return clamped;
    }

    let base = clamped + policy.base_delay;
    if policy.priority == Priority::Low {
        if let Some(peak) = peak_hours.and_then(|hours| next_peak_hour(base, hours, prefs)) {
            return peak;
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;
    use crate::policy::PolicyTable;
    use crate::testing::{at, on_day};

    fn quiet_prefs(start: &str, end: &str) -> RecipientPreferences {
        RecipientPreferences {
            quiet_hours: QuietHours::parse(start, end),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_quiet_wraparound() {
        let quiet = QuietHours::parse("22:00", "07:00").unwrap();
        assert!(is_quiet(&quiet, 23 * 60 + 30));
        assert!(is_quiet(&quiet, 3 * 60));
        assert!(is_quiet(&quiet, 7 * 60));
        assert!(!is_quiet(&quiet, 7 * 60 + 1));
        assert!(!is_quiet(&quiet, 12 * 60));

        let daytime = QuietHours::parse("13:00", "15:00").unwrap();
        assert!(is_quiet(&daytime, 14 * 60));
        assert!(!is_quiet(&daytime, 12 * 60 + 59));
    }

    #[test]
    fn test_late_evening_moves_to_next_morning() {
        let prefs = quiet_prefs("22:00", "07:00");
        assert_eq!(clamp_to_quiet_end(at(23, 30), &prefs), on_day(2, 7, 0));
        assert_eq!(clamp_to_quiet_end(at(6, 0), &prefs), at(7, 0));
        assert_eq!(clamp_to_quiet_end(at(12, 0), &prefs), at(12, 0));
    }

    #[test]
    fn test_non_wrapping_window_ends_same_day() {
        let prefs = quiet_prefs("13:00", "15:00");
        assert_eq!(clamp_to_quiet_end(at(14, 0), &prefs), at(15, 0));
    }

    #[test]
    fn test_quiet_hours_use_recipient_offset() {
        // 21:30 UTC is 23:30 at UTC+2
        let prefs = RecipientPreferences {
            utc_offset_minutes: 120,
            ..quiet_prefs("22:00", "07:00")
        };
        // 07:00 local on day 2 is 05:00 UTC
        assert_eq!(clamp_to_quiet_end(at(21, 30), &prefs), on_day(2, 5, 0));
    }

    #[test]
    fn test_out_of_range_offset_falls_back_to_utc() {
        for utc_offset_minutes in [i32::MAX, i32::MIN, 24 * 60] {
            let prefs = RecipientPreferences {
                utc_offset_minutes,
                ..quiet_prefs("22:00", "07:00")
            };
            assert_eq!(local_offset(&prefs), Utc.fix());
            assert_eq!(clamp_to_quiet_end(at(23, 30), &prefs), on_day(2, 7, 0));
        }
    }

    #[test]
    fn test_priorities() {
        let table = PolicyTable::default();
        let prefs = quiet_prefs("22:00", "07:00");
        let night = at(23, 30);

        let urgent = table.get(NotificationKind::SystemAlert);
        assert_eq!(plan_delivery_time(urgent, &prefs, None, night), night);

        let high = table.get(NotificationKind::FriendRequest);
        assert_eq!(plan_delivery_time(high, &prefs, None, at(14, 0)), at(14, 0));
        assert_eq!(plan_delivery_time(high, &prefs, None, night), on_day(2, 7, 0));

        let delayed = table.get(NotificationKind::FriendPost);
        assert_eq!(plan_delivery_time(delayed, &prefs, None, at(14, 0)), at(14, 5));
        assert_eq!(plan_delivery_time(delayed, &prefs, None, night), on_day(2, 7, 5));
    }

    #[test]
    fn test_low_priority_waits_for_peak_hour() {
        let table = PolicyTable::default();
        let prefs = RecipientPreferences::default();
        let low = table.get(NotificationKind::WeeklyProgress);

        assert_eq!(plan_delivery_time(low, &prefs, Some(&[18, 8]), at(14, 0)), at(18, 0));
        assert_eq!(plan_delivery_time(low, &prefs, Some(&[8]), at(14, 0)), on_day(2, 8, 0));
        assert_eq!(plan_delivery_time(low, &prefs, None, at(14, 0)), at(14, 0));
        assert_eq!(plan_delivery_time(low, &prefs, Some(&[]), at(14, 0)), at(14, 0));
    }

    #[test]
    fn test_peak_hours_never_delay_higher_priorities() {
        let table = PolicyTable::default();
        let prefs = RecipientPreferences::default();
        let normal = table.get(NotificationKind::GoalReminder);
        let high = table.get(NotificationKind::AchievementUnlocked);

        assert_eq!(plan_delivery_time(normal, &prefs, Some(&[18]), at(14, 0)), at(14, 0));
        assert_eq!(plan_delivery_time(high, &prefs, Some(&[18]), at(14, 0)), at(14, 0));
    }

    #[test]
    fn test_peak_hour_inside_quiet_hours_is_skipped() {
        let prefs = quiet_prefs("22:00", "07:00");
        assert_eq!(next_peak_hour(at(14, 0), &[23, 19], &prefs), Some(at(19, 0)));
        assert_eq!(next_peak_hour(at(14, 0), &[23], &prefs), None);
    }
}
