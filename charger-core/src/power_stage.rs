//! Power stage adapter.
//!
//! Owns the outbound control frame and folds the stage status broadcasts into
//! output voltage, output current, and module temperature. Control frame
//! changes are local until the periodic stage broadcast publishes them.

use core::fmt;
use core::time::Duration;

use crate::can::CanFrame;
use crate::config::PowerStageLimits;
use crate::protocol::stage::{StageControl, StageStatus};
use crate::time::{ChargerInstant, is_fresh};
use crate::transport::SlotReader;

/// Power stage fault, worst first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerStageFault {
    #[default]
    None,
    Overvolt,
    Overtemp,
    CommsTimeout,
}

impl PowerStageFault {
    #[must_use]
    pub const fn is_fault(self) -> bool {
        !matches!(self, PowerStageFault::None)
    }
}

impl fmt::Display for PowerStageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerStageFault::None => "none",
            PowerStageFault::Overvolt => "overvolt",
            PowerStageFault::Overtemp => "overtemp",
            PowerStageFault::CommsTimeout => "comms-timeout",
        })
    }
}

/// Latest stage readings.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerStageTelemetry {
    pub output_voltage: f32,
    pub output_current: f32,
    /// Unknown until a status arrives, and forgotten again when comms drop.
    pub temperature: Option<f32>,
}

/// Power stage peer adapter.
pub struct PowerStage<'a, I> {
    status: SlotReader<'a, StageStatus>,
    limits: PowerStageLimits,
    timeout: Duration,
    telemetry: PowerStageTelemetry,
    last_status: Option<I>,
    control: StageControl,
}

impl<'a, I> PowerStage<'a, I>
where
    I: ChargerInstant,
{
    #[must_use]
    pub fn new(
        status: SlotReader<'a, StageStatus>,
        limits: PowerStageLimits,
        timeout: Duration,
    ) -> Self {
        Self {
            status,
            limits,
            timeout,
            telemetry: PowerStageTelemetry::default(),
            last_status: None,
            control: StageControl::default(),
        }
    }

    /// Drains the status slot.
    pub fn update(&mut self, now: I) {
        if let Some(status) = self.status.take() {
            self.telemetry.output_voltage = status.output_voltage_volts();
            self.telemetry.output_current = status.output_current_amps();
            self.telemetry.temperature = Some(status.temperature_celsius());
            self.last_status = Some(now);
        }
    }

    #[must_use]
    pub fn is_live(&self, now: I) -> bool {
        is_fresh(now, self.last_status, self.timeout)
    }

    /// Highest priority fault currently present.
    ///
    /// A stale temperature is discarded rather than trusted, and a stage that
    /// never reported is not considered timed out.
    pub fn fault(&mut self, now: I) -> PowerStageFault {
        if self.telemetry.output_voltage >= self.limits.output_voltage_max {
            return PowerStageFault::Overvolt;
        }

        let live = self.is_live(now);
        if !live {
            self.telemetry.temperature = None;
        }
        if self
            .telemetry
            .temperature
            .is_some_and(|celsius| celsius >= self.limits.temperature_max)
        {
            return PowerStageFault::Overtemp;
        }

        if self.last_status.is_some() && !live {
            return PowerStageFault::CommsTimeout;
        }

        PowerStageFault::None
    }

    /// Sets the enable byte. Disabling also forgets the last status time so a
    /// deliberately stopped stage is not reported as timed out.
    pub fn enable(&mut self, enabled: bool) {
        self.control.set_enabled(enabled);
        if !enabled {
            self.last_status = None;
        }
    }

    pub fn set_voltage_limit(&mut self, volts: f32) {
        self.control.set_voltage_limit(volts);
    }

    pub fn set_current_limit(&mut self, amps: f32) {
        self.control.set_current_limit(amps);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    #[must_use]
    pub fn control(&self) -> &StageControl {
        &self.control
    }

    /// Frame carrying the current control contents.
    #[must_use]
    pub fn control_frame(&self) -> CanFrame {
        self.control.encode()
    }

    #[must_use]
    pub fn telemetry(&self) -> &PowerStageTelemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn output_voltage(&self) -> f32 {
        self.telemetry.output_voltage
    }

    #[must_use]
    pub fn output_current(&self) -> f32 {
        self.telemetry.output_current
    }

    #[must_use]
    pub fn temperature(&self) -> Option<f32> {
        self.telemetry.temperature
    }

    /// Temperature for the outbound state frame; zero when unknown.
    #[must_use]
    pub fn temperature_or_zero(&self) -> f32 {
        self.telemetry.temperature.unwrap_or(0.0)
    }
}
