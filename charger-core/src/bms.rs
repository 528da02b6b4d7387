//! Battery management system adapter.
//!
//! Drains the BMS broadcasts from their telemetry slots, keeps the latest
//! value of each field, and derives a single fault verdict from them. Until a
//! broadcast arrives its fields hold worst-case defaults: cells at their rated
//! maximum, pack at its maximum voltage, not ready, not killed.

use core::fmt;
use core::time::Duration;

use crate::can::CanFrame;
use crate::config::BatteryLimits;
use crate::protocol::car::{BmsInbox, ChargeRequest};
use crate::time::{ChargerInstant, is_fresh};

const PACK_VOLTAGE_SCALE: f32 = 0.01;
const CELL_VOLTAGE_SCALE: f32 = 0.001;
const CELL_TEMP_SCALE: f32 = 0.01;
const WH_PER_KWH: f32 = 1000.0;

/// Battery fault, worst first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryFault {
    #[default]
    None,
    Killed,
    Undervolt,
    Overvolt,
    CellOvertemp,
    CommsTimeout,
}

impl BatteryFault {
    #[must_use]
    pub const fn is_fault(self) -> bool {
        !matches!(self, BatteryFault::None)
    }
}

impl fmt::Display for BatteryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatteryFault::None => "none",
            BatteryFault::Killed => "killed",
            BatteryFault::Undervolt => "undervolt",
            BatteryFault::Overvolt => "overvolt",
            BatteryFault::CellOvertemp => "cell-overtemp",
            BatteryFault::CommsTimeout => "comms-timeout",
        })
    }
}

/// Latest values reported by the BMS, in engineering units.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryTelemetry {
    pub max_cell_voltage: f32,
    pub max_cell_temp: f32,
    pub pack_voltage: f32,
    pub pack_current: f32,
    pub capacity_kwh: f32,
    pub charge_ready: bool,
    pub killed: bool,
}

impl BatteryTelemetry {
    #[must_use]
    pub const fn worst_case(limits: &BatteryLimits) -> Self {
        Self {
            max_cell_voltage: limits.max_cell_voltage,
            max_cell_temp: limits.cell_temp_limit,
            pack_voltage: limits.pack_voltage_max,
            pack_current: 0.0,
            capacity_kwh: 0.0,
            charge_ready: false,
            killed: false,
        }
    }
}

/// Receive times of the four broadcasts that make up battery liveness.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Stamps<I> {
    min_max: Option<I>,
    charging_ready: Option<I>,
    killed: Option<I>,
    pack_voltage: Option<I>,
}

/// Battery peer adapter.
pub struct Bms<'a, I> {
    inbox: BmsInbox<'a>,
    limits: BatteryLimits,
    timeout: Duration,
    telemetry: BatteryTelemetry,
    stamps: Stamps<I>,
    charge_requested: bool,
}

impl<'a, I> Bms<'a, I>
where
    I: ChargerInstant,
{
    #[must_use]
    pub fn new(inbox: BmsInbox<'a>, limits: BatteryLimits, timeout: Duration) -> Self {
        Self {
            inbox,
            telemetry: BatteryTelemetry::worst_case(&limits),
            limits,
            timeout,
            stamps: Stamps {
                min_max: None,
                charging_ready: None,
                killed: None,
                pack_voltage: None,
            },
            charge_requested: false,
        }
    }

    /// Drains every pending broadcast and stamps the channels that arrived.
    pub fn update(&mut self, now: I) {
        if let Some(msg) = self.inbox.min_max.take() {
            self.telemetry.max_cell_voltage = f32::from(msg.max_cell_voltage) * CELL_VOLTAGE_SCALE;
            self.telemetry.max_cell_temp = f32::from(msg.max_temp) * CELL_TEMP_SCALE;
            self.stamps.min_max = Some(now);
        }

        if let Some(msg) = self.inbox.response.take() {
            self.telemetry.charge_ready = msg.charging_ready;
            self.stamps.charging_ready = Some(now);
        }

        if let Some(msg) = self.inbox.status.take() {
            self.telemetry.killed = msg.killed;
            self.stamps.killed = Some(now);
        }

        if let Some(msg) = self.inbox.measurement.take() {
            self.telemetry.pack_voltage = f32::from(msg.voltage) * PACK_VOLTAGE_SCALE;
            self.telemetry.pack_current = msg.current;
            self.stamps.pack_voltage = Some(now);
        }

        // Capacity carries no liveness stamp.
        if let Some(msg) = self.inbox.capacity.take() {
            self.telemetry.capacity_kwh = msg.watt_hours / WH_PER_KWH;
        }
    }

    /// `true` only when all four liveness channels arrived within the timeout.
    #[must_use]
    pub fn is_live(&self, now: I) -> bool {
        let Stamps {
            min_max,
            charging_ready,
            killed,
            pack_voltage,
        } = self.stamps;
        [min_max, charging_ready, killed, pack_voltage]
            .into_iter()
            .all(|stamp| is_fresh(now, stamp, self.timeout))
    }

    /// Highest priority fault currently present.
    #[must_use]
    pub fn fault(&self, now: I) -> BatteryFault {
        let t = &self.telemetry;
        if t.killed {
            BatteryFault::Killed
        } else if t.pack_voltage <= self.limits.pack_voltage_min {
            BatteryFault::Undervolt
        } else if t.pack_voltage >= self.limits.pack_voltage_max {
            BatteryFault::Overvolt
        } else if t.max_cell_temp >= self.limits.cell_temp_limit {
            BatteryFault::CellOvertemp
        } else if !self.is_live(now) {
            BatteryFault::CommsTimeout
        } else {
            BatteryFault::None
        }
    }

    /// Cells and temperature are far enough from their limits to start charging.
    #[must_use]
    pub fn within_charge_bounds(&self) -> bool {
        self.telemetry.max_cell_voltage < self.limits.cell_charge_target
            && self.telemetry.max_cell_temp < self.limits.cell_temp_limit
    }

    #[must_use]
    pub fn is_ready_to_charge(&self) -> bool {
        self.telemetry.charge_ready
    }

    #[must_use]
    pub fn telemetry(&self) -> &BatteryTelemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn max_cell_voltage(&self) -> f32 {
        self.telemetry.max_cell_voltage
    }

    #[must_use]
    pub fn max_cell_temp(&self) -> f32 {
        self.telemetry.max_cell_temp
    }

    #[must_use]
    pub fn pack_voltage(&self) -> f32 {
        self.telemetry.pack_voltage
    }

    #[must_use]
    pub fn pack_current(&self) -> f32 {
        self.telemetry.pack_current
    }

    #[must_use]
    pub fn capacity_kwh(&self) -> f32 {
        self.telemetry.capacity_kwh
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.telemetry.killed
    }

    /// Sets the intent echoed by the next charge request frame.
    pub fn request_charge(&mut self, requested: bool) {
        self.charge_requested = requested;
    }

    #[must_use]
    pub fn charge_requested(&self) -> bool {
        self.charge_requested
    }

    #[must_use]
    pub fn request_status(&self) -> ChargeRequest {
        ChargeRequest {
            charging_requested: self.charge_requested,
        }
    }

    #[must_use]
    pub fn request_status_frame(&self) -> CanFrame {
        self.request_status().encode()
    }
}

#[cfg(test)]
mod tests {
    use core::ops::Add;

    use super::*;
    use crate::protocol::car::{
        BatteryStatus, CarBusSlots, ChargerResponse, ModuleMinMax, PackCapacity, PackMeasurement,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl Add<Duration> for MockInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self {
            MockInstant(self.0 + u64::try_from(rhs.as_millis()).unwrap())
        }
    }

    impl ChargerInstant for MockInstant {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_millis(self.0.saturating_sub(earlier.0))
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(2500);

    fn healthy_frames() -> [CanFrame; 4] {
        [
            ModuleMinMax {
                max_temp: 2500,
                min_temp: 2000,
                max_cell_voltage: 3900,
                min_cell_voltage: 3800,
            }
            .encode(),
            ChargerResponse {
                charging_ready: true,
            }
            .encode(),
            BatteryStatus { killed: false }.encode(),
            PackMeasurement {
                voltage: 37_440,
                current: 2.0,
            }
            .encode(),
        ]
    }

    #[test]
    fn defaults_assume_worst_case() {
        let mut slots = CarBusSlots::new();
        let (_router, inbox) = slots.split();
        let bms: Bms<'_, MockInstant> = Bms::new(inbox, BatteryLimits::default(), TIMEOUT);

        assert!(!bms.is_ready_to_charge());
        assert!((bms.max_cell_voltage() - 4.2).abs() < 1e-6);
        assert!(!bms.within_charge_bounds());
        // Pack defaults to its rated maximum, which reads as overvoltage.
        assert_eq!(bms.fault(MockInstant(0)), BatteryFault::Overvolt);
        assert!(!bms.is_live(MockInstant(0)));
    }

    #[test]
    fn update_applies_unit_conversions() {
        let mut slots = CarBusSlots::new();
        let (mut router, inbox) = slots.split();
        let mut bms = Bms::new(inbox, BatteryLimits::default(), TIMEOUT);

        for frame in healthy_frames() {
            assert!(router.dispatch(&frame));
        }
        router.dispatch(&PackCapacity { watt_hours: 12_500.0 }.encode());
        bms.update(MockInstant(10));

        assert!((bms.max_cell_voltage() - 3.9).abs() < 1e-5);
        assert!((bms.max_cell_temp() - 25.0).abs() < 1e-5);
        assert!((bms.pack_voltage() - 374.4).abs() < 1e-3);
        assert!((bms.pack_current() - 2.0).abs() < 1e-6);
        assert!((bms.capacity_kwh() - 12.5).abs() < 1e-5);
        assert!(bms.is_ready_to_charge());
        assert!(bms.within_charge_bounds());
        assert_eq!(bms.fault(MockInstant(10)), BatteryFault::None);
    }

    #[test]
    fn one_stale_channel_breaks_liveness() {
        let mut slots = CarBusSlots::new();
        let (mut router, inbox) = slots.split();
        let mut bms = Bms::new(inbox, BatteryLimits::default(), TIMEOUT);

        for frame in healthy_frames() {
            router.dispatch(&frame);
        }
        bms.update(MockInstant(0));
        assert!(bms.is_live(MockInstant(2499)));

        // Refresh everything except the kill-status broadcast.
        let [min_max, response, _status, measurement] = healthy_frames();
        for frame in [min_max, response, measurement] {
            router.dispatch(&frame);
        }
        bms.update(MockInstant(2000));
        assert!(bms.is_live(MockInstant(2499)));
        assert!(!bms.is_live(MockInstant(2500)));
        assert_eq!(bms.fault(MockInstant(2500)), BatteryFault::CommsTimeout);
    }

    #[test]
    fn fault_priority_is_fixed() {
        let mut slots = CarBusSlots::new();
        let (mut router, inbox) = slots.split();
        let mut bms = Bms::new(inbox, BatteryLimits::default(), TIMEOUT);

        // Killed, undervolt, and hot at once, with no liveness.
        router.dispatch(&BatteryStatus { killed: true }.encode());
        router.dispatch(
            &PackMeasurement {
                voltage: 20_000,
                current: 0.0,
            }
            .encode(),
        );
        router.dispatch(
            &ModuleMinMax {
                max_temp: 6000,
                ..ModuleMinMax::default()
            }
            .encode(),
        );
        bms.update(MockInstant(0));
        assert_eq!(bms.fault(MockInstant(0)), BatteryFault::Killed);

        router.dispatch(&BatteryStatus { killed: false }.encode());
        bms.update(MockInstant(1));
        assert_eq!(bms.fault(MockInstant(1)), BatteryFault::Undervolt);

        router.dispatch(
            &PackMeasurement {
                voltage: 41_000,
                current: 0.0,
            }
            .encode(),
        );
        bms.update(MockInstant(2));
        assert_eq!(bms.fault(MockInstant(2)), BatteryFault::Overvolt);

        router.dispatch(
            &PackMeasurement {
                voltage: 38_000,
                current: 0.0,
            }
            .encode(),
        );
        bms.update(MockInstant(3));
        assert_eq!(bms.fault(MockInstant(3)), BatteryFault::CellOvertemp);
    }

    #[test]
    fn request_intent_is_echoed_in_frame() {
        let mut slots = CarBusSlots::new();
        let (_router, inbox) = slots.split();
        let mut bms: Bms<'_, MockInstant> = Bms::new(inbox, BatteryLimits::default(), TIMEOUT);

        bms.request_charge(true);
        let frame = bms.request_status_frame();
        assert!(ChargeRequest::decode(&frame).unwrap().charging_requested);
        bms.request_charge(false);
        assert!(!bms.charge_requested());
    }
}
