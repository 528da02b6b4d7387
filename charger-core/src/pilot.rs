//! Charge connector: presence, control pilot decoding, AC output control.
//!
//! The pilot is a PWM signal whose duty cycle advertises how much AC current
//! the supply can deliver. Anything outside the recognised frequency band or
//! duty bands decodes to zero amps.

use portable_atomic::{AtomicU64, Ordering};

/// Lowest accepted pilot frequency (Hz).
pub const PILOT_MIN_HZ: f32 = 600.0;
/// Highest accepted pilot frequency (Hz).
pub const PILOT_MAX_HZ: f32 = 1400.0;

/// Duty cycle and frequency of the control pilot.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PilotMeasurement {
    /// Fraction of the period the pilot is high, `0.0..=1.0`.
    pub duty: f32,
    pub frequency_hz: f32,
}

impl PilotMeasurement {
    #[must_use]
    pub const fn new(duty: f32, frequency_hz: f32) -> Self {
        Self { duty, frequency_hz }
    }

    /// Converts raw input-capture counts into a measurement.
    ///
    /// `timer_hz` is the capture timer's counting frequency. A zero period
    /// (no edges seen) yields an all-zero measurement.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_capture(period_ticks: u32, high_ticks: u32, timer_hz: u32) -> Self {
        if period_ticks == 0 {
            return Self::default();
        }
        let period = period_ticks as f32;
        let low = period_ticks.saturating_sub(high_ticks) as f32;
        Self {
            duty: 1.0 - low / period,
            frequency_hz: timer_hz as f32 / period,
        }
    }
}

/// Current the supply advertises through the pilot, in amps.
#[must_use]
pub fn current_limit(present: bool, measurement: PilotMeasurement) -> f32 {
    if !present {
        return 0.0;
    }
    let PilotMeasurement { duty, frequency_hz } = measurement;
    if !(PILOT_MIN_HZ..=PILOT_MAX_HZ).contains(&frequency_hz) {
        return 0.0;
    }
    if duty > 0.1 && duty < 0.86 {
        duty * 60.0
    } else if (0.86..=0.96).contains(&duty) {
        (duty * 100.0 - 64.0) * 2.5
    } else {
        0.0
    }
}

/// Latest pilot measurement, written by the periodic capture trigger and
/// read by the poll loop.
pub struct PilotCell {
    bits: AtomicU64,
}

impl PilotCell {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    pub fn store(&self, measurement: PilotMeasurement) {
        let packed = u64::from(measurement.duty.to_bits())
            | (u64::from(measurement.frequency_hz.to_bits()) << 32);
        self.bits.store(packed, Ordering::Release);
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn load(&self) -> PilotMeasurement {
        let packed = self.bits.load(Ordering::Acquire);
        PilotMeasurement {
            duty: f32::from_bits(packed as u32),
            frequency_hz: f32::from_bits((packed >> 32) as u32),
        }
    }
}

impl Default for PilotCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector GPIO collaborator.
pub trait ChargePort {
    /// `true` while the connector is seated (proximity asserted).
    fn is_present(&self) -> bool;

    /// Energises the AC output at the connector.
    fn output_ac(&mut self);

    /// De-energises the AC output at the connector.
    fn isolate(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(duty: f32, hz: f32) -> f32 {
        current_limit(true, PilotMeasurement::new(duty, hz))
    }

    #[test]
    fn absent_connector_yields_zero() {
        assert!(current_limit(false, PilotMeasurement::new(0.5, 1000.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn lower_duty_bound_is_exclusive() {
        assert!(limit(0.10, 1000.0).abs() < f32::EPSILON);
        assert!((limit(0.25, 1000.0) - 15.0).abs() < 1e-4);
    }

    #[test]
    fn upper_band_starts_inclusive_at_86_percent() {
        assert!((limit(0.86, 1000.0) - 55.0).abs() < 1e-3);
        assert!((limit(0.96, 1000.0) - 80.0).abs() < 1e-3);
        assert!(limit(0.97, 1000.0).abs() < f32::EPSILON);
    }

    #[test]
    fn frequency_band_is_inclusive() {
        assert!((limit(0.5, 1400.0) - 30.0).abs() < 1e-4);
        assert!((limit(0.5, 600.0) - 30.0).abs() < 1e-4);
        assert!(limit(0.5, 1500.0).abs() < f32::EPSILON);
        assert!(limit(0.9, 599.0).abs() < f32::EPSILON);
    }

    #[test]
    fn capture_counts_convert_to_duty_and_frequency() {
        let measurement = PilotMeasurement::from_capture(1000, 400, 1_000_000);
        assert!((measurement.duty - 0.4).abs() < 1e-6);
        assert!((measurement.frequency_hz - 1000.0).abs() < 1e-3);
        assert_eq!(PilotMeasurement::from_capture(0, 0, 1_000_000), PilotMeasurement::default());
    }

    #[test]
    fn cell_preserves_both_fields() {
        let cell = PilotCell::new();
        cell.store(PilotMeasurement::new(0.27, 998.5));
        assert_eq!(cell.load(), PilotMeasurement::new(0.27, 998.5));
    }
}
