//! Adaptive polling cadence — pure policy, no IO.
//!
//! The jitter sample is passed in as a unit float so every branch is exactly
//! testable; callers draw it from their RNG once per computation.

use chrono::Duration;

/// What the last completed poll observed, reduced to the inputs the cadence
/// table cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSignal {
    /// Transcript available (and any analysis request already queued); the
    /// row stays warm for follow-ups within the quarter.
    Available,
    /// Upcoming with a known event horizon.
    Upcoming { event_in: Duration },
    /// Upcoming with no event date — treated like a far-out event.
    UpcomingNoDate,
    /// Nothing yet, and the row's quarter is the current fiscal target.
    NoneActiveQuarter,
    /// Nothing yet, quarter already superseded.
    NoneOffQuarter,
}

/// Base delta before jitter.
fn base_delta(signal: PollSignal) -> Duration {
    match signal {
        PollSignal::Available => Duration::hours(24),
        PollSignal::Upcoming { event_in } => {
            if event_in <= Duration::hours(24) {
                Duration::minutes(10)
            } else if event_in <= Duration::days(7) {
                Duration::minutes(60)
            } else {
                Duration::hours(4)
            }
        }
        PollSignal::UpcomingNoDate => Duration::hours(4),
        PollSignal::NoneActiveQuarter => Duration::hours(4),
        PollSignal::NoneOffQuarter => Duration::hours(24),
    }
}

/// Next-check delta for a completed poll.
///
/// `jitter01` is uniform in `[0, 1)`. The standard arm adds up to 20% of the
/// base; the none-during-active-quarter arm spreads uniformly across 4–6 h
/// per the cadence table. Jitter exists to break thundering herds, so zero
/// jitter (tests) reproduces the base exactly.
pub fn next_delta(signal: PollSignal, jitter01: f64) -> Duration {
    debug_assert!((0.0..1.0).contains(&jitter01));
    let base = base_delta(signal);
    let spread = match signal {
        PollSignal::NoneActiveQuarter => Duration::hours(2),
        _ => base / 5,
    };
    let jitter_secs = (spread.num_seconds() as f64 * jitter01) as i64;
    base + Duration::seconds(jitter_secs)
}

/// Backoff for consecutive transient poll errors:
/// `min(2^attempts · 30 s, 1 h)`.
pub fn transient_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 12) as u32;
    let secs = 30i64.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(3600))
}

/// Park delta after a permanent oracle error.
pub fn permanent_error_delta() -> Duration {
    Duration::hours(24)
}

/// Cadence of a soft-retired row.
pub fn retired_delta() -> Duration {
    Duration::days(7)
}

/// Retention window after the last `available` observation before a row is
/// soft-retired.
pub fn retirement_window() -> Duration {
    Duration::days(90)
}
