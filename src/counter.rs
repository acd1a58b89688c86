//! Revolution counters and 16-bit event times for crank and wheel data.
//!
//! The cycling characteristics carry a cumulative revolution count plus the
//! timestamp of the last revolution, not an absolute clock. Receivers derive
//! cadence and speed by differencing successive `(count, time)` pairs, so the
//! counters here keep count and time consistent with each other while the
//! simulated cadence changes.

use std::time::Duration;

/// Crank event time resolution (1/1024 s)
pub const CRANK_TICKS_PER_SECOND: u32 = 1024;

/// Wheel event time resolution (1/2048 s)
pub const WHEEL_TICKS_PER_SECOND: u32 = 2048;

const EVENT_TIME_MODULUS: u64 = 1 << 16;

/// Crank revolution data for one encode tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrankEvent {
    /// Cumulative crank revolutions
    pub rev_count: u32,
    /// Last crank event time in 1/1024 s
    pub event_time: u16,
}

/// Wheel revolution data for one encode tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelEvent {
    /// Cumulative wheel revolutions
    pub wheel_count: u32,
    /// Last wheel event time in 1/2048 s
    pub event_time: u16,
}

/// Time between two crank revolutions in 1/1024 s
///
/// Returns `None` for a stalled crank: zero, negative or non-finite cadence, or
/// a cadence so low that one revolution does not fit the 16-bit time field.
#[must_use]
pub fn crank_interval(cadence_rpm: f64) -> Option<u16> {
    if !cadence_rpm.is_finite() || cadence_rpm <= 0.0 {
        return None;
    }
    let interval = (60.0 * f64::from(CRANK_TICKS_PER_SECOND) / cadence_rpm).round();
    if interval > f64::from(u16::MAX) {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let interval = interval as u16;
    Some(interval)
}

/// Time for one wheel revolution in 1/2048 s
///
/// Returns `None` when the bike is not moving.
#[must_use]
pub fn wheel_interval(circumference_mm: u32, speed_kmh: f64) -> Option<u32> {
    if !speed_kmh.is_finite() || speed_kmh <= 0.0 {
        return None;
    }
    let interval = (f64::from(circumference_mm) * f64::from(WHEEL_TICKS_PER_SECOND) * 3600.0
        / (1_000_000.0 * speed_kmh))
        .round();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let interval = interval.min(f64::from(u32::MAX)) as u32;
    Some(interval)
}

/// Convert an elapsed duration to a wrapping 16-bit event time
#[must_use]
pub fn event_time(elapsed: Duration, ticks_per_second: u32) -> u16 {
    let ticks = elapsed.as_nanos() * u128::from(ticks_per_second) / 1_000_000_000;
    #[allow(clippy::cast_possible_truncation)]
    let wrapped = (ticks % u128::from(EVENT_TIME_MODULUS)) as u16;
    wrapped
}

fn scaled_time(count: u32, interval: u32) -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let wrapped = ((u64::from(count) * u64::from(interval)) % EVENT_TIME_MODULUS) as u16;
    wrapped
}

/// Persistent counter state for one cycling characteristic
///
/// Starts at zero and only moves forward; there is no reset short of creating
/// a new instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevolutionCounters {
    stroke_count: u32,
    wheel_count: u32,
    prev_cadence_event_time: u16,
    prev_cadence_interval: u16,
}

impl RevolutionCounters {
    /// Create zeroed counters
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stroke_count: 0,
            wheel_count: 0,
            prev_cadence_event_time: 0,
            prev_cadence_interval: 0,
        }
    }

    /// Cumulative crank revolutions so far
    #[must_use]
    pub const fn stroke_count(&self) -> u32 {
        self.stroke_count
    }

    /// Cumulative wheel revolutions so far
    #[must_use]
    pub const fn wheel_count(&self) -> u32 {
        self.wheel_count
    }

    /// Advance the crank by one tick at the given cadence
    ///
    /// While the derived interval is unchanged every tick adds one revolution.
    /// When it changes, the event time is recomputed from the stroke count at
    /// the new interval and, if that jumps more than one interval ahead of the
    /// previous event, the stroke count catches up.
    ///
    /// A stalled crank holds every counter and returns `None`.
    pub fn advance_crank(&mut self, cadence_rpm: f64) -> Option<CrankEvent> {
        let interval = crank_interval(cadence_rpm)?;

        let event_time = if interval == self.prev_cadence_interval {
            self.stroke_count = self.stroke_count.wrapping_add(1);
            scaled_time(self.stroke_count, u32::from(interval))
        } else {
            let mut candidate = scaled_time(self.stroke_count, u32::from(interval));
            let delta = i32::from(candidate) - i32::from(self.prev_cadence_event_time);
            let ratio = f64::from(delta) / f64::from(interval);
            if ratio > 1.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let catch_up = ratio.round() as u32;
                self.stroke_count = self.stroke_count.wrapping_add(catch_up);
                candidate = candidate.wrapping_add(interval);
            }
            candidate
        };

        self.prev_cadence_event_time = event_time;
        self.prev_cadence_interval = interval;

        Some(CrankEvent {
            rev_count: self.stroke_count,
            event_time,
        })
    }

    /// Count one crank revolution without deriving an event time
    ///
    /// Used when the revolution is stamped with the wall clock instead.
    pub fn advance_stroke(&mut self) -> u32 {
        self.stroke_count = self.stroke_count.wrapping_add(1);
        self.stroke_count
    }

    /// Advance the wheel by one revolution at the given speed
    ///
    /// A stationary wheel holds the counters and returns `None`.
    pub fn advance_wheel(&mut self, circumference_mm: u32, speed_kmh: f64) -> Option<WheelEvent> {
        let interval = wheel_interval(circumference_mm, speed_kmh)?;
        self.wheel_count = self.wheel_count.wrapping_add(1);
        Some(WheelEvent {
            wheel_count: self.wheel_count,
            event_time: scaled_time(self.wheel_count, interval),
        })
    }
}
