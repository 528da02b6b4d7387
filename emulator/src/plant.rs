//! Simulated peers and wiring around the charger core.
//!
//! Time is simulated in whole milliseconds. Advancing it runs the same three
//! periodic triggers the firmware schedules, delivers queued frames to the
//! simulated BMS and power stages, and lets those peers broadcast back.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ops::Add;
use std::time::Duration;

use charger_core::can::{BusError, CanFrame, CanTransmit};
use charger_core::charger::{ChargerLinks, Outbox};
use charger_core::pilot::{PilotCell, PilotMeasurement};
use charger_core::protocol::car::{
    BatteryStatus, CarBusRouter, CarBusSlots, ChargeRequest, ChargerResponse, ChargerState,
    ModuleMinMax, PackCapacity, PackMeasurement,
};
use charger_core::protocol::stage::{StageBusRouter, StageBusSlots, StageControl, StageStatus};
use charger_core::time::{ChargerInstant, Clock};
use charger_core::transport::{DrainOutcome, TxConsumer, TxProducer, TxQueue};

/// Simulated time advanced by each busy-wait iteration and each polled step.
pub const POLL_STEP_MS: u64 = 10;

const CAR_BROADCAST_MS: u64 = 1000;
const STAGE_BROADCAST_MS: u64 = 100;
const PILOT_SAMPLE_MS: u64 = 50;
const BMS_BROADCAST_MS: u64 = 100;
// Offset so the stage reports land between charger control broadcasts.
const STAGE_REPORT_MS: u64 = 100;
const STAGE_REPORT_PHASE_MS: u64 = 50;

/// Milliseconds since the session started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(pub u64);

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        SimInstant(
            self.0
                .saturating_add(u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX)),
        )
    }
}

impl ChargerInstant for SimInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

/// Storage the charger and its peers borrow from.
#[derive(Default)]
pub struct Bench {
    car: CarBusSlots,
    stage: StageBusSlots,
    car_tx: TxQueue,
    stage_tx: TxQueue,
    outbox: Outbox,
    pilot: PilotCell,
}

impl Bench {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits the storage into the simulated plant and the charger's links.
    pub fn wire(&mut self) -> (Plant<'_>, ChargerLinks<'_>) {
        let Bench {
            car,
            stage,
            car_tx,
            stage_tx,
            outbox,
            pilot,
        } = self;
        let outbox: &Outbox = outbox;
        let pilot: &PilotCell = pilot;
        let (car_router, bms) = car.split();
        let (stage_router, status) = stage.split();
        let (car_out, car_in) = car_tx.split();
        let (stage_out, stage_in) = stage_tx.split();

        let plant = Plant {
            now: Cell::new(0),
            battery: RefCell::new(BatteryModel::default()),
            stages: RefCell::new(StageModel::default()),
            pilot_signal: Cell::new(PilotMeasurement::default()),
            car_bus: RefCell::new(Bus::new(car_out, car_in)),
            stage_bus: RefCell::new(Bus::new(stage_out, stage_in)),
            car_router: RefCell::new(car_router),
            stage_router: RefCell::new(stage_router),
            outbox,
            pilot,
        };
        let links = ChargerLinks {
            bms,
            stage: status,
            pilot,
            outbox,
        };
        (plant, links)
    }
}

/// Scripted battery management system.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryModel {
    pub ready: bool,
    pub killed: bool,
    pub pack_volts: f32,
    pub pack_amps: f32,
    pub cell_millivolts: f32,
    pub cell_celsius: f32,
    pub watt_hours: f32,
    pub silent: bool,
    /// Last charge request heard from the charger.
    pub charge_requested: bool,
    /// Last charger state frame heard from the charger.
    pub charger_state: Option<ChargerState>,
}

impl Default for BatteryModel {
    fn default() -> Self {
        Self {
            ready: false,
            killed: false,
            pack_volts: 380.0,
            pack_amps: 0.0,
            cell_millivolts: 3950.0,
            cell_celsius: 25.0,
            watt_hours: 10_000.0,
            silent: false,
            charge_requested: false,
            charger_state: None,
        }
    }
}

impl BatteryModel {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn broadcast(&self) -> [CanFrame; 5] {
        let millivolts = self.cell_millivolts.clamp(0.0, f32::from(u16::MAX)) as u16;
        let centi_celsius = (self.cell_celsius * 100.0)
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        [
            ModuleMinMax {
                max_temp: centi_celsius,
                min_temp: centi_celsius,
                max_cell_voltage: millivolts,
                min_cell_voltage: millivolts,
            }
            .encode(),
            ChargerResponse {
                charging_ready: self.ready,
            }
            .encode(),
            BatteryStatus {
                killed: self.killed,
            }
            .encode(),
            PackMeasurement {
                voltage: (self.pack_volts * 100.0).clamp(0.0, f32::from(u16::MAX)) as u16,
                current: self.pack_amps,
            }
            .encode(),
            PackCapacity {
                watt_hours: self.watt_hours,
            }
            .encode(),
        ]
    }

    fn hear(&mut self, frame: &CanFrame) {
        if let Ok(request) = ChargeRequest::decode(frame) {
            self.charge_requested = request.charging_requested;
        } else if let Ok(state) = ChargerState::decode(frame) {
            self.charger_state = Some(state);
        }
    }
}

/// Power stage modules; they all follow the same control frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StageModel {
    pub online: bool,
    pub celsius: f32,
    /// Last control frame heard from the charger.
    pub control: StageControl,
}

impl Default for StageModel {
    fn default() -> Self {
        Self {
            online: false,
            celsius: 30.0,
            control: StageControl::default(),
        }
    }
}

impl StageModel {
    #[allow(clippy::cast_possible_truncation)]
    fn report(&self, pack_volts: f32) -> StageStatus {
        let (volts, amps) = if self.control.is_enabled() {
            (pack_volts, self.control.current_limit())
        } else {
            (0.0, 0.0)
        };
        StageStatus::from_readings(volts, amps, self.celsius.round() as i16)
    }

    fn hear(&mut self, frame: &CanFrame) {
        if let Ok(control) = StageControl::decode(frame) {
            self.control = control;
        }
    }
}

/// Transmit queue plus the wire it drains onto.
pub struct Bus<'a> {
    producer: TxProducer<'a>,
    consumer: TxConsumer<'a>,
    wire: Wire,
}

impl<'a> Bus<'a> {
    fn new(
        producer: TxProducer<'a>,
        consumer: TxConsumer<'a>,
    ) -> Self {
        Self {
            producer,
            consumer,
            wire: Wire::default(),
        }
    }

    /// Drains the queue onto the wire and returns what was delivered.
    fn deliver(&mut self) -> Vec<CanFrame> {
        while self.consumer.drain_one(&mut self.wire) == DrainOutcome::Sent {}
        std::mem::take(&mut self.wire.delivered)
    }

    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.wire.sent
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.consumer.len()
    }
}

#[derive(Default)]
struct Wire {
    delivered: Vec<CanFrame>,
    sent: u64,
}

impl CanTransmit for Wire {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        self.delivered.push(*frame);
        self.sent += 1;
        Ok(())
    }
}

/// Everything on the far side of the charger's bus and GPIO seams.
pub struct Plant<'a> {
    now: Cell<u64>,
    battery: RefCell<BatteryModel>,
    stages: RefCell<StageModel>,
    pilot_signal: Cell<PilotMeasurement>,
    car_bus: RefCell<Bus<'a>>,
    stage_bus: RefCell<Bus<'a>>,
    car_router: RefCell<CarBusRouter<'a>>,
    stage_router: RefCell<StageBusRouter<'a>>,
    outbox: &'a Outbox,
    pilot: &'a PilotCell,
}

impl<'a> Plant<'a> {
    #[must_use]
    pub fn now(&self) -> SimInstant {
        SimInstant(self.now.get())
    }

    /// Moves simulated time forward one millisecond at a time.
    pub fn advance(&self, millis: u64) {
        for _ in 0..millis {
            self.now.set(self.now.get() + 1);
            self.tick(self.now.get());
        }
    }

    fn tick(&self, now: u64) {
        if now.is_multiple_of(BMS_BROADCAST_MS) {
            let battery = *self.battery.borrow();
            if !battery.silent {
                let mut router = self.car_router.borrow_mut();
                for frame in &battery.broadcast() {
                    router.dispatch(frame);
                }
            }
        }
        if now % STAGE_REPORT_MS == STAGE_REPORT_PHASE_MS {
            let stages = *self.stages.borrow();
            if stages.online {
                let pack_volts = self.battery.borrow().pack_volts;
                self.stage_router
                    .borrow_mut()
                    .dispatch(&stages.report(pack_volts).encode());
            }
        }

        if now.is_multiple_of(PILOT_SAMPLE_MS) {
            self.pilot.store(self.pilot_signal.get());
        }
        if now.is_multiple_of(STAGE_BROADCAST_MS) {
            // Overflow is counted by the outbox.
            let _ = self
                .outbox
                .broadcast_stage_bus(&mut self.stage_bus.borrow_mut().producer);
        }
        if now.is_multiple_of(CAR_BROADCAST_MS) {
            let _ = self
                .outbox
                .broadcast_car_bus(&mut self.car_bus.borrow_mut().producer);
        }

        for frame in self.stage_bus.borrow_mut().deliver() {
            self.stages.borrow_mut().hear(&frame);
        }
        for frame in self.car_bus.borrow_mut().deliver() {
            self.battery.borrow_mut().hear(&frame);
        }
    }

    pub fn set_pilot(&self, measurement: PilotMeasurement) {
        self.pilot_signal.set(measurement);
    }

    #[must_use]
    pub fn pilot_signal(&self) -> PilotMeasurement {
        self.pilot_signal.get()
    }

    #[must_use]
    pub fn battery(&self) -> RefMut<'_, BatteryModel> {
        self.battery.borrow_mut()
    }

    #[must_use]
    pub fn stages(&self) -> RefMut<'_, StageModel> {
        self.stages.borrow_mut()
    }

    #[must_use]
    pub fn car_bus(&self) -> Ref<'_, Bus<'a>> {
        self.car_bus.borrow()
    }

    #[must_use]
    pub fn stage_bus(&self) -> Ref<'_, Bus<'a>> {
        self.stage_bus.borrow()
    }
}

/// Charger clock; each busy-wait iteration lets the plant run one poll step.
#[derive(Clone, Copy)]
pub struct SimClock<'p, 'a> {
    plant: &'p Plant<'a>,
}

impl<'p, 'a> SimClock<'p, 'a> {
    #[must_use]
    pub fn new(plant: &'p Plant<'a>) -> Self {
        Self { plant }
    }
}

impl Clock for SimClock<'_, '_> {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        self.plant.now()
    }

    fn relax(&self) {
        self.plant.advance(POLL_STEP_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bms_broadcasts_every_hundred_milliseconds() {
        let mut bench = Bench::new();
        let (plant, mut links) = bench.wire();
        plant.advance(99);
        assert!(links.bms.min_max.take().is_none());
        plant.advance(1);
        assert!(links.bms.min_max.take().is_some());
        assert!(links.bms.measurement.take().is_some());
    }

    #[test]
    fn silent_battery_sends_nothing() {
        let mut bench = Bench::new();
        let (plant, mut links) = bench.wire();
        plant.battery().silent = true;
        plant.advance(500);
        assert!(links.bms.response.take().is_none());
    }

    #[test]
    fn stage_follows_broadcast_control() {
        let mut bench = Bench::new();
        let (plant, mut links) = bench.wire();
        plant.stages().online = true;

        let mut control = StageControl::default();
        control.set_enabled(true);
        control.set_current_limit(6.0);
        links.outbox.publish_stage(&control);

        plant.advance(150);
        assert!(plant.stages().control.is_enabled());
        let status = links.stage.take().expect("stage reported");
        assert!((status.output_current_amps() - 6.0).abs() < 0.05);
        assert!(plant.stage_bus().frames_sent() >= 1);
    }

    #[test]
    fn car_bus_carries_the_charge_request() {
        let mut bench = Bench::new();
        let (plant, links) = bench.wire();
        links.outbox.publish_car(
            ChargeRequest {
                charging_requested: true,
            },
            &ChargerState::default(),
        );
        plant.advance(CAR_BROADCAST_MS);
        assert!(plant.battery().charge_requested);
        assert!(plant.battery().charger_state.is_some());
        assert_eq!(plant.car_bus().frames_sent(), 2);
        assert_eq!(plant.car_bus().queued(), 0);
    }

    #[test]
    fn pilot_capture_refreshes_on_its_period() {
        let mut bench = Bench::new();
        let (plant, links) = bench.wire();
        plant.set_pilot(PilotMeasurement::new(0.5, 1000.0));
        plant.advance(49);
        assert_eq!(links.pilot.load(), PilotMeasurement::default());
        plant.advance(1);
        assert_eq!(links.pilot.load(), PilotMeasurement::new(0.5, 1000.0));
    }
}
