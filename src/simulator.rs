//! Simulated rider and runner.
//!
//! [`SimulatorState`] holds the nominal values a user adjusts and the targets
//! a controlling client sets. Each family's task samples it through a
//! [`NoiseModel`] and turns the sample into a [`SensorReading`] for its encoder.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tracing::debug;

use crate::{
    counter::{crank_interval, wheel_interval, CrankEvent, RevolutionCounters, WheelEvent},
    noise::NoiseModel,
    types::{CyclingPowerMode, DomainEvent, NoiseConfig, SensorReading, SimulationParameters},
};

/// Highest cadence the simulator accepts, in rpm
pub const MAX_CADENCE_RPM: u16 = 200;

/// Highest power the simulator accepts, in watts
pub const MAX_POWER_WATTS: u16 = 2500;

/// Step for speed and running cadence adjustments
pub const RUNNING_INCREMENT: f64 = 0.5;

/// Convert miles per hour to meters per second
#[must_use]
pub fn mph_to_mps(mph: f64) -> f64 {
    mph * 1.60934 / 3.6
}

/// Running pace in `mm:ss` per mile for a speed in miles per hour
#[must_use]
pub fn speed_to_pace(mph: f64) -> String {
    if mph <= 0.0 {
        return "00:00".to_string();
    }
    let minutes_per_mile = 60.0 / mph;
    let minutes = minutes_per_mile.floor();
    let seconds = ((minutes_per_mile - minutes) * 60.0).floor();
    format!("{minutes:02}:{seconds:02}")
}

/// A user-adjustable simulator parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// Cycling cadence, by the current increment
    Cadence,
    /// Cycling power, by the current increment
    Power,
    /// Running speed and cycling wheel speed, by half a unit
    Speed,
    /// Running cadence, by half a step per minute
    RunningCadence,
    /// The increment itself, by one
    Increment,
}

/// Direction of an adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Raise the value
    Increase,
    /// Lower the value
    Decrease,
}

impl Direction {
    const fn sign(self) -> f64 {
        match self {
            Self::Increase => 1.0,
            Self::Decrease => -1.0,
        }
    }
}

/// Nominal values the simulated sensors report around
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorState {
    cadence_rpm: u16,
    power_watts: u16,
    speed_kmh: f64,
    running_cadence_spm: f64,
    running_speed_mph: f64,
    increment: u16,
    noise: NoiseConfig,
    target_power: Option<i16>,
    simulation: Option<SimulationParameters>,
    workout_running: bool,
}

impl Default for SimulatorState {
    fn default() -> Self {
        Self::new(NoiseConfig::default())
    }
}

impl SimulatorState {
    /// Default rider: 90 rpm, 100 W, 18 km/h; default runner: 180 spm at 10 mph
    #[must_use]
    pub const fn new(noise: NoiseConfig) -> Self {
        Self {
            cadence_rpm: 90,
            power_watts: 100,
            speed_kmh: 18.0,
            running_cadence_spm: 180.0,
            running_speed_mph: 10.0,
            increment: 10,
            noise,
            target_power: None,
            simulation: None,
            workout_running: false,
        }
    }

    /// Cycling cadence in rpm
    #[must_use]
    pub const fn cadence_rpm(&self) -> u16 {
        self.cadence_rpm
    }

    /// Cycling power in watts
    #[must_use]
    pub const fn power_watts(&self) -> u16 {
        self.power_watts
    }

    /// Cycling speed in km/h
    #[must_use]
    pub const fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    /// Running cadence in steps per minute
    #[must_use]
    pub const fn running_cadence_spm(&self) -> f64 {
        self.running_cadence_spm
    }

    /// Running speed in miles per hour
    #[must_use]
    pub const fn running_speed_mph(&self) -> f64 {
        self.running_speed_mph
    }

    /// Step used for cadence and power adjustments
    #[must_use]
    pub const fn increment(&self) -> u16 {
        self.increment
    }

    /// Whether noise is applied to samples
    #[must_use]
    pub const fn noise_enabled(&self) -> bool {
        self.noise.enabled
    }

    /// Last target power set by a controlling client
    #[must_use]
    pub const fn target_power(&self) -> Option<i16> {
        self.target_power
    }

    /// Last simulation parameters set by a controlling client
    #[must_use]
    pub const fn simulation(&self) -> Option<SimulationParameters> {
        self.simulation
    }

    /// Whether a controlling client has started the workout
    #[must_use]
    pub const fn workout_running(&self) -> bool {
        self.workout_running
    }

    /// Set cycling cadence, clamped to 0..=200 rpm
    pub fn set_cadence(&mut self, rpm: u16) {
        self.cadence_rpm = rpm.min(MAX_CADENCE_RPM);
    }

    /// Set cycling power, clamped to 0..=2500 W
    pub fn set_power(&mut self, watts: u16) {
        self.power_watts = watts.min(MAX_POWER_WATTS);
    }

    /// Set cycling speed, negative values become zero
    pub fn set_speed_kmh(&mut self, kmh: f64) {
        self.speed_kmh = kmh.max(0.0);
    }

    /// Turn noise on or off, returning the new setting
    pub fn toggle_noise(&mut self) -> bool {
        self.noise.enabled = !self.noise.enabled;
        self.noise.enabled
    }

    /// Nudge one parameter up or down
    pub fn adjust(&mut self, parameter: Parameter, direction: Direction) {
        let step = f64::from(self.increment) * direction.sign();
        let half = RUNNING_INCREMENT * direction.sign();

        match parameter {
            Parameter::Cadence => {
                self.cadence_rpm = clamp_u16(f64::from(self.cadence_rpm) + step, MAX_CADENCE_RPM);
            }
            Parameter::Power => {
                self.power_watts = clamp_u16(f64::from(self.power_watts) + step, MAX_POWER_WATTS);
            }
            Parameter::Speed => {
                self.running_speed_mph = (self.running_speed_mph + half).max(0.0);
                self.speed_kmh = (self.speed_kmh + half).max(0.0);
            }
            Parameter::RunningCadence => {
                self.running_cadence_spm = (self.running_cadence_spm + half).max(0.0);
            }
            Parameter::Increment => {
                self.increment = match direction {
                    Direction::Increase => self.increment.saturating_add(1),
                    Direction::Decrease => self.increment.saturating_sub(1).max(1),
                };
            }
        }
    }

    /// Apply an accepted control point command
    pub fn apply(&mut self, event: &DomainEvent) {
        match *event {
            DomainEvent::ControlAcquired => {}
            DomainEvent::Reset => {
                self.target_power = None;
                self.simulation = None;
                self.workout_running = false;
            }
            DomainEvent::TargetPowerSet(watts) => {
                self.target_power = Some(watts);
                self.set_power(u16::try_from(watts).unwrap_or(0));
            }
            DomainEvent::Started => self.workout_running = true,
            DomainEvent::Stopped => self.workout_running = false,
            DomainEvent::SimulationParamsSet(params) => self.simulation = Some(params),
        }
        debug!("Simulator applied {event}");
    }

    fn perturb<R: Rng>(&self, noise: &mut NoiseModel<R>, mean: f64, relative_percent: f64) -> f64 {
        if self.noise.enabled {
            noise.sample(mean, relative_percent)
        } else {
            mean
        }
    }

    /// Noisy instantaneous power, floored to whole watts and never negative
    pub fn power_sample<R: Rng>(&self, noise: &mut NoiseModel<R>) -> i16 {
        let watts = self.perturb(noise, f64::from(self.power_watts), self.noise.power_percent);
        #[allow(clippy::cast_possible_truncation)]
        let watts = watts.floor().clamp(0.0, f64::from(i16::MAX)) as i16;
        watts
    }

    /// Noisy cadence in rpm, never negative and not rounded
    pub fn cadence_sample<R: Rng>(&self, noise: &mut NoiseModel<R>) -> f64 {
        self.perturb(noise, f64::from(self.cadence_rpm), self.noise.cadence_percent)
            .max(0.0)
    }

    /// Indoor bike reading for the Fitness Machine Service
    pub fn indoor_bike_reading<R: Rng>(&self, noise: &mut NoiseModel<R>) -> SensorReading {
        let watts = self.power_sample(noise);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cadence_rpm = self.cadence_sample(noise).floor().min(f64::from(u16::MAX)) as u16;
        SensorReading::IndoorBike {
            watts,
            cadence_rpm,
            speed_kmh: self.speed_kmh,
        }
    }

    /// Running reading for the RSC service
    pub fn running_reading<R: Rng>(&self, noise: &mut NoiseModel<R>) -> SensorReading {
        let speed_mph = self
            .perturb(noise, self.running_speed_mph, self.noise.cadence_percent)
            .max(0.0);
        let cadence = self.perturb(noise, self.running_cadence_spm, self.noise.cadence_percent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cadence_spm = cadence.floor().clamp(0.0, f64::from(u8::MAX)) as u8;
        SensorReading::RunningDynamics {
            speed_mps: mph_to_mps(speed_mph),
            cadence_spm,
        }
    }
}

impl fmt::Display for SimulatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cycling:")?;
        writeln!(f, "    Cadence: {} RPM", self.cadence_rpm)?;
        writeln!(f, "      Power: {} W", self.power_watts)?;
        writeln!(f, "      Speed: {} km/h", self.speed_kmh)?;
        writeln!(f, "Running:")?;
        writeln!(
            f,
            "    Speed: {} m/h, Pace: {} min/mi",
            self.running_speed_mph,
            speed_to_pace(self.running_speed_mph)
        )?;
        writeln!(f, "    Cadence: {} steps/min", self.running_cadence_spm.floor())?;
        writeln!(f, "Noise: {}", if self.noise.enabled { "ON" } else { "OFF" })?;
        write!(f, "Increment: {}", self.increment)
    }
}

fn clamp_u16(value: f64, max: u16) -> u16 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = value.clamp(0.0, f64::from(max)) as u16;
    value
}

/// One step of a cycling power task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclingTick {
    /// Reading to notify, `None` while the simulated rider is stalled
    pub reading: Option<SensorReading>,
    /// Delay before the next step
    pub next_in: Duration,
}

/// Turns simulator samples into cycling power readings for one mode
///
/// Owns the revolution counters, so one feed serves one characteristic.
#[derive(Debug, Clone)]
pub struct CyclingPowerFeed {
    mode: CyclingPowerMode,
    wheel_circumference_mm: u32,
    counters: RevolutionCounters,
    last_events: (WheelEvent, CrankEvent),
}

impl CyclingPowerFeed {
    /// Create a feed with zeroed counters
    #[must_use]
    pub const fn new(mode: CyclingPowerMode, wheel_circumference_mm: u32) -> Self {
        Self {
            mode,
            wheel_circumference_mm,
            counters: RevolutionCounters::new(),
            last_events: (
                WheelEvent {
                    wheel_count: 0,
                    event_time: 0,
                },
                CrankEvent {
                    rev_count: 0,
                    event_time: 0,
                },
            ),
        }
    }

    /// Broadcast mode
    #[must_use]
    pub const fn mode(&self) -> CyclingPowerMode {
        self.mode
    }

    /// Counter state so far
    #[must_use]
    pub const fn counters(&self) -> &RevolutionCounters {
        &self.counters
    }

    /// Produce the next reading and the delay until the following one
    ///
    /// Power-only and power+cadence+speed run at `interval`. Power+cadence
    /// runs once per simulated crank revolution, so its delay follows the
    /// noisy cadence.
    pub fn tick<R: Rng>(
        &mut self,
        state: &SimulatorState,
        noise: &mut NoiseModel<R>,
        interval: Duration,
    ) -> CyclingTick {
        let stalled = CyclingTick {
            reading: None,
            next_in: interval,
        };

        match self.mode {
            CyclingPowerMode::PowerOnly => CyclingTick {
                reading: Some(SensorReading::Power {
                    watts: state.power_sample(noise),
                }),
                next_in: interval,
            },
            CyclingPowerMode::PowerCadence => {
                if state.cadence_rpm() == 0 {
                    return stalled;
                }
                let watts = state.power_sample(noise);
                let rev_count = self.counters.advance_stroke();
                let cadence = state.cadence_sample(noise).max(1.0);
                CyclingTick {
                    reading: Some(SensorReading::PowerCadence { watts, rev_count }),
                    next_in: Duration::from_secs_f64(60.0 / cadence),
                }
            }
            CyclingPowerMode::PowerCadenceSpeed => {
                let cadence = f64::from(state.cadence_rpm());
                let speed = state.speed_kmh();
                if crank_interval(cadence).is_none()
                    || wheel_interval(self.wheel_circumference_mm, speed).is_none()
                {
                    return stalled;
                }

                let watts = state.power_sample(noise);
                let (Some(wheel), Some(crank)) = (
                    self.counters.advance_wheel(self.wheel_circumference_mm, speed),
                    self.counters.advance_crank(cadence),
                ) else {
                    return stalled;
                };
                self.last_events = (wheel, crank);
                CyclingTick {
                    reading: Some(SensorReading::PowerCadenceSpeed {
                        watts,
                        rev_count: crank.rev_count,
                        wheel_count: wheel.wheel_count,
                        speed_event_time: wheel.event_time,
                        cadence_event_time: crank.event_time,
                    }),
                    next_in: interval,
                }
            }
        }
    }

    /// Zero-power reading carrying the last revolution data
    ///
    /// Counts and event times repeat the last reading sent, so a receiver
    /// differencing them sees no movement.
    #[must_use]
    pub const fn keepalive_reading(&self) -> SensorReading {
        match self.mode {
            CyclingPowerMode::PowerOnly => SensorReading::Power { watts: 0 },
            CyclingPowerMode::PowerCadence => SensorReading::PowerCadence {
                watts: 0,
                rev_count: self.counters.stroke_count(),
            },
            CyclingPowerMode::PowerCadenceSpeed => {
                let (wheel, crank) = self.last_events;
                SensorReading::PowerCadenceSpeed {
                    watts: 0,
                    rev_count: crank.rev_count,
                    wheel_count: wheel.wheel_count,
                    speed_event_time: wheel.event_time,
                    cadence_event_time: crank.event_time,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn seeded() -> NoiseModel<ChaCha8Rng> {
        NoiseModel::new(ChaCha8Rng::seed_from_u64(42))
    }

    fn quiet() -> SimulatorState {
        SimulatorState::new(NoiseConfig {
            enabled: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_defaults() {
        let state = SimulatorState::default();
        assert_eq!(state.cadence_rpm(), 90);
        assert_eq!(state.power_watts(), 100);
        assert!((state.speed_kmh() - 18.0).abs() < f64::EPSILON);
        assert!((state.running_speed_mph() - 10.0).abs() < f64::EPSILON);
        assert_eq!(state.increment(), 10);
        assert!(state.noise_enabled());
    }

    #[test]
    fn test_adjust_clamps() {
        let mut state = SimulatorState::default();
        for _ in 0..20 {
            state.adjust(Parameter::Cadence, Direction::Increase);
        }
        assert_eq!(state.cadence_rpm(), MAX_CADENCE_RPM);
        for _ in 0..30 {
            state.adjust(Parameter::Cadence, Direction::Decrease);
        }
        assert_eq!(state.cadence_rpm(), 0);

        for _ in 0..300 {
            state.adjust(Parameter::Power, Direction::Increase);
        }
        assert_eq!(state.power_watts(), MAX_POWER_WATTS);

        for _ in 0..50 {
            state.adjust(Parameter::Speed, Direction::Decrease);
        }
        assert!(state.running_speed_mph().abs() < f64::EPSILON);
        assert!(state.speed_kmh().abs() < f64::EPSILON);

        for _ in 0..20 {
            state.adjust(Parameter::Increment, Direction::Decrease);
        }
        assert_eq!(state.increment(), 1);
        state.adjust(Parameter::Increment, Direction::Increase);
        assert_eq!(state.increment(), 2);

        state.adjust(Parameter::RunningCadence, Direction::Increase);
        assert!((state.running_cadence_spm() - 180.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_events() {
        let mut state = SimulatorState::default();

        state.apply(&DomainEvent::TargetPowerSet(250));
        assert_eq!(state.power_watts(), 250);
        assert_eq!(state.target_power(), Some(250));

        state.apply(&DomainEvent::TargetPowerSet(4000));
        assert_eq!(state.power_watts(), MAX_POWER_WATTS);

        state.apply(&DomainEvent::TargetPowerSet(-20));
        assert_eq!(state.power_watts(), 0);

        state.apply(&DomainEvent::Started);
        assert!(state.workout_running());
        state.apply(&DomainEvent::Stopped);
        assert!(!state.workout_running());

        state.apply(&DomainEvent::SimulationParamsSet(SimulationParameters::default()));
        assert!(state.simulation().is_some());

        state.apply(&DomainEvent::Reset);
        assert_eq!(state.target_power(), None);
        assert_eq!(state.simulation(), None);
    }

    #[test]
    fn test_power_sample_never_negative() {
        let mut state = SimulatorState::default();
        state.set_power(1);
        let mut noise = seeded();
        for _ in 0..1_000 {
            assert!(state.power_sample(&mut noise) >= 0);
        }
    }

    #[test]
    fn test_running_reading_without_noise() {
        let state = quiet();
        let reading = state.running_reading(&mut seeded());
        let SensorReading::RunningDynamics {
            speed_mps,
            cadence_spm,
        } = reading
        else {
            panic!("expected running dynamics, got {reading:?}");
        };
        assert!((speed_mps - 4.4704).abs() < 1e-3);
        assert_eq!(cadence_spm, 180);
    }

    #[test]
    fn test_running_cadence_saturates() {
        let mut state = quiet();
        for _ in 0..400 {
            state.adjust(Parameter::RunningCadence, Direction::Increase);
        }
        let SensorReading::RunningDynamics { cadence_spm, .. } = state.running_reading(&mut seeded())
        else {
            panic!("expected running dynamics");
        };
        assert_eq!(cadence_spm, u8::MAX);
    }

    #[test]
    fn test_indoor_bike_reading_without_noise() {
        let reading = quiet().indoor_bike_reading(&mut seeded());
        assert_eq!(
            reading,
            SensorReading::IndoorBike {
                watts: 100,
                cadence_rpm: 90,
                speed_kmh: 18.0,
            }
        );
    }

    #[test]
    fn test_speed_to_pace() {
        assert_eq!(speed_to_pace(10.0), "06:00");
        assert_eq!(speed_to_pace(8.0), "07:30");
        assert_eq!(speed_to_pace(0.0), "00:00");
    }

    #[test]
    fn test_power_cadence_feed() {
        let state = quiet();
        let mut noise = seeded();
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerCadence, 2096);

        let tick = feed.tick(&state, &mut noise, INTERVAL);
        assert_eq!(
            tick.reading,
            Some(SensorReading::PowerCadence {
                watts: 100,
                rev_count: 1
            })
        );
        // one revolution at 90 rpm
        assert_eq!(tick.next_in.as_millis(), 666);

        let tick = feed.tick(&state, &mut noise, INTERVAL);
        assert_eq!(tick.reading.and_then(|r| r.rev_count()), Some(2));
    }

    #[test]
    fn test_power_cadence_feed_stalls_at_zero_cadence() {
        let mut state = quiet();
        state.set_cadence(0);
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerCadence, 2096);

        let tick = feed.tick(&state, &mut seeded(), INTERVAL);
        assert_eq!(tick.reading, None);
        assert_eq!(tick.next_in, INTERVAL);
        assert_eq!(feed.counters().stroke_count(), 0);
        assert_eq!(
            feed.keepalive_reading(),
            SensorReading::PowerCadence {
                watts: 0,
                rev_count: 0
            }
        );
    }

    #[test]
    fn test_power_cadence_speed_feed() {
        let state = quiet();
        let mut noise = seeded();
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerCadenceSpeed, 2096);

        let first = feed.tick(&state, &mut noise, INTERVAL);
        assert_eq!(
            first.reading,
            Some(SensorReading::PowerCadenceSpeed {
                watts: 100,
                rev_count: 0,
                wheel_count: 1,
                speed_event_time: 859,
                cadence_event_time: 0,
            })
        );

        let second = feed.tick(&state, &mut noise, INTERVAL);
        assert_eq!(
            second.reading,
            Some(SensorReading::PowerCadenceSpeed {
                watts: 100,
                rev_count: 1,
                wheel_count: 2,
                speed_event_time: 1718,
                cadence_event_time: 683,
            })
        );
        assert_eq!(second.next_in, INTERVAL);
    }

    #[test]
    fn test_power_cadence_speed_feed_holds_when_stopped() {
        let mut state = quiet();
        let mut noise = seeded();
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerCadenceSpeed, 2096);
        feed.tick(&state, &mut noise, INTERVAL);
        let before = *feed.counters();

        state.set_speed_kmh(0.0);
        assert_eq!(feed.tick(&state, &mut noise, INTERVAL).reading, None);

        state.set_speed_kmh(18.0);
        state.set_cadence(0);
        assert_eq!(feed.tick(&state, &mut noise, INTERVAL).reading, None);
        assert_eq!(*feed.counters(), before);
    }

    #[test]
    fn test_power_cadence_speed_keepalive_repeats_last_events() {
        let mut state = quiet();
        let mut noise = seeded();
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerCadenceSpeed, 2096);
        assert_eq!(
            feed.keepalive_reading(),
            SensorReading::PowerCadenceSpeed {
                watts: 0,
                rev_count: 0,
                wheel_count: 0,
                speed_event_time: 0,
                cadence_event_time: 0,
            }
        );

        feed.tick(&state, &mut noise, INTERVAL);
        feed.tick(&state, &mut noise, INTERVAL);
        state.set_cadence(0);
        assert_eq!(feed.tick(&state, &mut noise, INTERVAL).reading, None);

        assert_eq!(
            feed.keepalive_reading(),
            SensorReading::PowerCadenceSpeed {
                watts: 0,
                rev_count: 1,
                wheel_count: 2,
                speed_event_time: 1718,
                cadence_event_time: 683,
            }
        );
    }

    #[test]
    fn test_power_only_feed() {
        let mut feed = CyclingPowerFeed::new(CyclingPowerMode::PowerOnly, 2096);
        let tick = feed.tick(&quiet(), &mut seeded(), INTERVAL);
        assert_eq!(tick.reading, Some(SensorReading::Power { watts: 100 }));
        assert_eq!(feed.keepalive_reading(), SensorReading::Power { watts: 0 });
    }
}
