//! Charge state machine.
//!
//! [`Charger`] owns both peer adapters and runs one iteration of the charge
//! logic per [`Charger::poll`]: drain telemetry, derive faults, step the state
//! machine on connector presence, then perform the action for the resulting
//! state. The periodic bus triggers only ever see the payloads published to
//! the [`Outbox`] at the end of each iteration.

mod outbox;

use core::fmt;
use core::time::Duration;

pub use outbox::Outbox;

use crate::bms::{BatteryFault, BatteryTelemetry, Bms};
use crate::config::ChargerConfig;
use crate::indicators::StatusIndicators;
use crate::pilot::{self, ChargePort, PilotCell, PilotMeasurement};
use crate::power_stage::{PowerStage, PowerStageFault, PowerStageTelemetry};
use crate::protocol::car::{BmsInbox, ChargerState, FaultFlags};
use crate::protocol::stage::StageStatus;
use crate::telemetry::{ChargeEvent, EventLog};
use crate::time::{ChargerInstant, Clock};
use crate::transport::SlotReader;

/// Charger lifecycle state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeState {
    #[default]
    Idle,
    Connected,
    PowerStageStarting,
    Charging,
    ChargingDone,
    /// Needs a power cycle to leave.
    FaultLatching,
    /// Clears once unplugged with no fault present.
    FaultResettable,
}

impl ChargeState {
    #[must_use]
    pub const fn is_fault(self) -> bool {
        matches!(
            self,
            ChargeState::FaultLatching | ChargeState::FaultResettable
        )
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChargeState::Idle => "idle",
            ChargeState::Connected => "connected",
            ChargeState::PowerStageStarting => "power-stage-starting",
            ChargeState::Charging => "charging",
            ChargeState::ChargingDone => "charging-done",
            ChargeState::FaultLatching => "fault-latching",
            ChargeState::FaultResettable => "fault-resettable",
        })
    }
}

/// Receive-side and shared handles the charger consumes.
pub struct ChargerLinks<'a> {
    pub bms: BmsInbox<'a>,
    pub stage: SlotReader<'a, StageStatus>,
    pub pilot: &'a PilotCell,
    pub outbox: &'a Outbox,
}

/// Result of one isolation procedure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IsolationOutcome {
    /// Time spent waiting for the stage output current to decay.
    pub waited: Duration,
    /// The wait hit its bound and the output was opened anyway.
    pub timed_out: bool,
}

/// Point-in-time view of the charger for status reporting.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerSnapshot {
    pub state: ChargeState,
    pub battery_fault: BatteryFault,
    pub stage_fault: PowerStageFault,
    pub plugged: bool,
    pub battery: BatteryTelemetry,
    pub stage: PowerStageTelemetry,
    pub stage_enabled: bool,
    pub charge_requested: bool,
    pub pilot: PilotMeasurement,
    /// AC current the connector advertises (A).
    pub advertised_current: f32,
    /// DC current limit last written to the stage control frame (A).
    pub commanded_current: f32,
    pub dropped_frames: u32,
}

/// DC current the stages may deliver for a given advertised AC current.
///
/// The AC figure is capped at the configured ceiling, the nominal line voltage
/// is chosen from it, and the converted DC figure is split across the stages
/// and clamped to the provisional DC ceiling.
#[must_use]
pub fn dc_current_limit(ac_advertised: f32, pack_voltage: f32, config: &ChargerConfig) -> f32 {
    if pack_voltage <= 0.0 {
        return 0.0;
    }
    let stage = &config.stage;
    let ac_current = ac_advertised.min(config.ac_current_ceiling);
    let ac_voltage = if ac_current <= stage.ac_changeover_current {
        stage.ac_voltage_low
    } else {
        stage.ac_voltage_high
    };
    let available =
        (stage.efficiency * ac_voltage * ac_current) / (pack_voltage * f32::from(stage.stage_count));
    available.min(config.dc_current_ceiling)
}

/// Charge controller.
pub struct Charger<'a, C, P, L>
where
    C: Clock,
{
    clock: C,
    port: P,
    indicators: L,
    config: ChargerConfig,
    pilot: &'a PilotCell,
    outbox: &'a Outbox,
    bms: Bms<'a, C::Instant>,
    stage: PowerStage<'a, C::Instant>,
    state: ChargeState,
    battery_fault: BatteryFault,
    stage_fault: PowerStageFault,
    plugged: bool,
    events: EventLog<C::Instant>,
}

impl<'a, C, P, L> Charger<'a, C, P, L>
where
    C: Clock,
    P: ChargePort,
    L: StatusIndicators,
{
    #[must_use]
    pub fn new(
        config: ChargerConfig,
        links: ChargerLinks<'a>,
        clock: C,
        port: P,
        indicators: L,
    ) -> Self {
        let ChargerLinks {
            bms,
            stage,
            pilot,
            outbox,
        } = links;
        Self {
            bms: Bms::new(bms, config.battery, config.battery_timeout),
            stage: PowerStage::new(stage, config.stage, config.stage_timeout),
            clock,
            port,
            indicators,
            config,
            pilot,
            outbox,
            state: ChargeState::Idle,
            battery_fault: BatteryFault::None,
            stage_fault: PowerStageFault::None,
            plugged: false,
            events: EventLog::new(),
        }
    }

    /// Spins on battery telemetry until the battery is live.
    ///
    /// With a `limit`, gives up once it has elapsed and returns `false` so the
    /// caller can log and retry.
    pub fn wait_for_battery(&mut self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|limit| self.clock.now() + limit);
        loop {
            let now = self.clock.now();
            self.bms.update(now);
            if self.bms.is_live(now) {
                return true;
            }
            if deadline.is_some_and(|deadline| now > deadline) {
                return false;
            }
            self.clock.relax();
        }
    }

    /// Runs one iteration of the charge logic.
    pub fn poll(&mut self) {
        let now = self.clock.now();
        self.stage.update(now);
        self.bms.update(now);

        // A latched fault must not be downgraded by a lesser classification.
        if self.state != ChargeState::FaultLatching {
            self.check_faults(now);
        }

        self.plugged = self.port.is_present();
        self.indicators.indicate_proximity(self.plugged);
        if self.plugged {
            self.update_connected(now);
        } else {
            self.update_disconnected(now);
        }

        self.state_action();
        self.publish();
    }

    fn check_faults(&mut self, now: C::Instant) {
        let battery = self.bms.fault(now);
        let stage = self.stage.fault(now);

        if battery != self.battery_fault {
            self.events.record(ChargeEvent::BatteryFault(battery), now);
            self.battery_fault = battery;
        }
        if stage != self.stage_fault {
            self.events.record(ChargeEvent::PowerStageFault(stage), now);
            self.stage_fault = stage;
        }

        if stage.is_fault() {
            self.set_state(ChargeState::FaultResettable, now);
        }
        match battery {
            BatteryFault::None => {}
            BatteryFault::Killed | BatteryFault::Undervolt | BatteryFault::CommsTimeout => {
                self.set_state(ChargeState::FaultLatching, now);
            }
            BatteryFault::Overvolt | BatteryFault::CellOvertemp => {
                self.set_state(ChargeState::FaultResettable, now);
            }
        }
    }

    fn update_connected(&mut self, now: C::Instant) {
        let next = match self.state {
            ChargeState::Idle => ChargeState::Connected,
            ChargeState::Connected => {
                if self.bms.within_charge_bounds() && self.bms.is_ready_to_charge() {
                    ChargeState::PowerStageStarting
                } else {
                    ChargeState::Connected
                }
            }
            ChargeState::PowerStageStarting => {
                if !self.bms.is_ready_to_charge() {
                    ChargeState::Connected
                } else if self.stage.is_live(now) {
                    ChargeState::Charging
                } else {
                    ChargeState::PowerStageStarting
                }
            }
            ChargeState::Charging => {
                if !self.bms.is_ready_to_charge() {
                    ChargeState::Connected
                } else if self.is_charge_complete() {
                    ChargeState::ChargingDone
                } else {
                    ChargeState::Charging
                }
            }
            ChargeState::ChargingDone
            | ChargeState::FaultLatching
            | ChargeState::FaultResettable => self.state,
        };
        self.set_state(next, now);
    }

    fn update_disconnected(&mut self, now: C::Instant) {
        let next = match self.state {
            ChargeState::FaultLatching => ChargeState::FaultLatching,
            ChargeState::FaultResettable => {
                if self.battery_fault.is_fault() || self.stage_fault.is_fault() {
                    ChargeState::FaultResettable
                } else {
                    ChargeState::Idle
                }
            }
            ChargeState::Idle
            | ChargeState::Connected
            | ChargeState::PowerStageStarting
            | ChargeState::Charging
            | ChargeState::ChargingDone => ChargeState::Idle,
        };
        self.set_state(next, now);
    }

    fn is_charge_complete(&self) -> bool {
        let limits = &self.config.battery;
        self.bms.pack_current() <= limits.charge_done_current
            && limits.pack_charge_target - self.bms.pack_voltage() <= limits.full_voltage_tolerance
    }

    fn state_action(&mut self) {
        match self.state {
            ChargeState::Connected => {
                if self.bms.within_charge_bounds()
                    && self.bms.capacity_kwh() < self.config.energy_cap_kwh
                {
                    self.bms.request_charge(true);
                }
            }
            ChargeState::PowerStageStarting => {
                self.port.output_ac();
                self.stage
                    .set_voltage_limit(self.config.battery.pack_voltage_max);
                self.indicators.indicate_ac(true);
            }
            ChargeState::Charging => {
                let limit = self.find_current_limit();
                self.stage.set_current_limit(limit);
                self.stage
                    .set_voltage_limit(self.config.battery.pack_charge_target);
                self.stage.enable(true);
            }
            ChargeState::FaultLatching | ChargeState::FaultResettable => {
                self.indicators.indicate_fault();
                self.isolate();
            }
            ChargeState::Idle | ChargeState::ChargingDone => {
                self.isolate();
            }
        }
    }

    /// DC current limit for the present connector advertisement and pack voltage.
    #[must_use]
    pub fn find_current_limit(&self) -> f32 {
        dc_current_limit(
            self.advertised_current(),
            self.bms.pack_voltage(),
            &self.config,
        )
    }

    /// AC current the connector currently advertises (A).
    #[must_use]
    pub fn advertised_current(&self) -> f32 {
        pilot::current_limit(self.port.is_present(), self.pilot.load())
    }

    /// Disables the stages, waits a bounded time for their output current to
    /// decay, then opens the AC output and withdraws the charge request.
    ///
    /// The disabled control payload is published before the wait so the stage
    /// broadcast can carry it while this loop spins.
    pub fn isolate(&mut self) -> IsolationOutcome {
        let was_enabled = self.stage.is_enabled();
        self.stage.enable(false);
        self.outbox.publish_stage(self.stage.control());

        let start = self.clock.now();
        let deadline = start + self.config.isolation_wait;
        let mut timed_out = false;
        let mut now = start;
        while self.stage.output_current() > self.config.isolation_current_threshold {
            if now > deadline {
                timed_out = true;
                break;
            }
            self.clock.relax();
            now = self.clock.now();
            self.stage.update(now);
        }

        self.port.isolate();
        self.bms.request_charge(false);
        self.indicators.indicate_ac(false);

        let outcome = IsolationOutcome {
            waited: now.saturating_duration_since(start),
            timed_out,
        };
        if was_enabled || timed_out {
            self.events.record(
                ChargeEvent::IsolationComplete {
                    waited_ms: u32::try_from(outcome.waited.as_millis()).unwrap_or(u32::MAX),
                    timed_out,
                },
                now,
            );
        }
        outcome
    }

    fn set_state(&mut self, next: ChargeState, now: C::Instant) {
        if next != self.state {
            self.events.record(
                ChargeEvent::StateChanged {
                    from: self.state,
                    to: next,
                },
                now,
            );
            self.state = next;
        }
    }

    fn publish(&self) {
        let faults = FaultFlags::from_faults(self.battery_fault, self.stage_fault);
        let charging_current =
            self.stage.output_current() * f32::from(self.config.stage.stage_count);
        let state = ChargerState::new(
            faults,
            self.plugged,
            charging_current,
            self.stage.temperature_or_zero(),
        );
        self.outbox.publish_car(self.bms.request_status(), &state);
        self.outbox.publish_stage(self.stage.control());
    }

    #[must_use]
    pub fn snapshot(&self) -> ChargerSnapshot {
        let pilot = self.pilot.load();
        ChargerSnapshot {
            state: self.state,
            battery_fault: self.battery_fault,
            stage_fault: self.stage_fault,
            plugged: self.plugged,
            battery: *self.bms.telemetry(),
            stage: *self.stage.telemetry(),
            stage_enabled: self.stage.is_enabled(),
            charge_requested: self.bms.charge_requested(),
            pilot,
            advertised_current: pilot::current_limit(self.plugged, pilot),
            commanded_current: self.stage.control().current_limit(),
            dropped_frames: self.outbox.dropped_frames(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ChargeState {
        self.state
    }

    #[must_use]
    pub fn battery_fault(&self) -> BatteryFault {
        self.battery_fault
    }

    #[must_use]
    pub fn stage_fault(&self) -> PowerStageFault {
        self.stage_fault
    }

    #[must_use]
    pub fn config(&self) -> &ChargerConfig {
        &self.config
    }

    #[must_use]
    pub fn bms(&self) -> &Bms<'a, C::Instant> {
        &self.bms
    }

    #[must_use]
    pub fn stage(&self) -> &PowerStage<'a, C::Instant> {
        &self.stage
    }

    #[must_use]
    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    #[must_use]
    pub fn indicators(&self) -> &L {
        &self.indicators
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub fn events(&self) -> &EventLog<C::Instant> {
        &self.events
    }
}
