use core::cell::Cell;
use core::ops::Add;
use core::time::Duration;

use charger_core::can::{BusError, CanFrame, CanTransmit};
use charger_core::charger::{ChargeState, Charger, ChargerLinks, Outbox};
use charger_core::config::ChargerConfig;
use charger_core::indicators::StatusIndicators;
use charger_core::pilot::{ChargePort, PilotCell, PilotMeasurement};
use charger_core::protocol::car::{
    BatteryStatus, CarBusRouter, CarBusSlots, ChargeRequest, ChargerResponse, ModuleMinMax,
    PackCapacity, PackMeasurement,
};
use charger_core::protocol::stage::{StageBusRouter, StageBusSlots, StageControl, StageStatus};
use charger_core::telemetry::ChargeEvent;
use charger_core::time::{ChargerInstant, Clock};
use charger_core::transport::{DrainOutcome, TxQueue};

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

/// Millisecond clock; each busy-wait iteration costs 10 ms.
#[derive(Default)]
struct MockClock {
    now: Cell<u64>,
}

impl MockClock {
    fn advance(&self, millis: u64) {
        self.now.set(self.now.get() + millis);
    }
}

impl Clock for MockClock {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        MockInstant(self.now.get())
    }

    fn relax(&self) {
        self.advance(10);
    }
}

#[derive(Default)]
struct FakePort {
    present: bool,
    ac_on: bool,
    isolations: u32,
}

impl ChargePort for FakePort {
    fn is_present(&self) -> bool {
        self.present
    }

    fn output_ac(&mut self) {
        self.ac_on = true;
    }

    fn isolate(&mut self) {
        self.ac_on = false;
        self.isolations += 1;
    }
}

#[derive(Default)]
struct FakeLights {
    proximity: bool,
    ac: bool,
    fault: bool,
}

impl StatusIndicators for FakeLights {
    fn indicate_fault(&mut self) {
        self.fault = true;
    }

    fn indicate_proximity(&mut self, connected: bool) {
        self.proximity = connected;
    }

    fn indicate_ac(&mut self, connected: bool) {
        self.ac = connected;
    }
}

#[derive(Clone, Copy)]
struct Battery {
    cell_millivolts: u16,
    temp_centi: i16,
    pack_volts: f32,
    pack_amps: f32,
    ready: bool,
    watt_hours: f32,
}

impl Battery {
    fn healthy() -> Self {
        Self {
            cell_millivolts: 3900,
            temp_centi: 2500,
            pack_volts: 380.0,
            pack_amps: 0.0,
            ready: true,
            watt_hours: 12_000.0,
        }
    }
}

struct Rig<'a> {
    charger: Charger<'a, &'a MockClock, FakePort, FakeLights>,
    car_bus: CarBusRouter<'a>,
    stage_bus: StageBusRouter<'a>,
    clock: &'a MockClock,
    pilot: &'a PilotCell,
    outbox: &'a Outbox,
}

impl Rig<'_> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn battery(&mut self, battery: &Battery) {
        let frames = [
            ModuleMinMax {
                max_temp: battery.temp_centi,
                min_temp: battery.temp_centi,
                max_cell_voltage: battery.cell_millivolts,
                min_cell_voltage: battery.cell_millivolts,
            }
            .encode(),
            ChargerResponse {
                charging_ready: battery.ready,
            }
            .encode(),
            BatteryStatus { killed: false }.encode(),
            PackMeasurement {
                voltage: (battery.pack_volts * 100.0).round() as u16,
                current: battery.pack_amps,
            }
            .encode(),
            PackCapacity {
                watt_hours: battery.watt_hours,
            }
            .encode(),
        ];
        for frame in &frames {
            assert!(self.car_bus.dispatch(frame));
        }
    }

    fn stage_status(&mut self, volts: f32, amps: f32) {
        assert!(
            self.stage_bus
                .dispatch(&StageStatus::from_readings(volts, amps, 30).encode())
        );
    }

    fn plug(&mut self, present: bool) {
        self.charger.port_mut().present = present;
    }

    fn poll(&mut self) -> ChargeState {
        self.charger.poll();
        self.charger.state()
    }
}

fn with_rig(test: impl FnOnce(&mut Rig<'_>)) {
    let clock = MockClock::default();
    let pilot = PilotCell::new();
    let outbox = Outbox::new();
    let mut car = CarBusSlots::new();
    let mut stage = StageBusSlots::new();
    let (car_bus, bms) = car.split();
    let (stage_bus, status) = stage.split();

    let charger = Charger::new(
        ChargerConfig::default(),
        ChargerLinks {
            bms,
            stage: status,
            pilot: &pilot,
            outbox: &outbox,
        },
        &clock,
        FakePort::default(),
        FakeLights::default(),
    );
    let mut rig = Rig {
        charger,
        car_bus,
        stage_bus,
        clock: &clock,
        pilot: &pilot,
        outbox: &outbox,
    };
    test(&mut rig);
}

/// Drives a rig from plug-in to `Charging` with a 16 A pilot.
fn start_charging(rig: &mut Rig<'_>) {
    rig.pilot.store(PilotMeasurement::new(16.0 / 60.0, 1000.0));
    rig.battery(&Battery::healthy());
    rig.plug(true);

    assert_eq!(rig.poll(), ChargeState::Connected);
    assert_eq!(rig.poll(), ChargeState::PowerStageStarting);
    rig.stage_status(380.0, 0.0);
    assert_eq!(rig.poll(), ChargeState::Charging);
}

#[test]
fn plug_in_walks_through_to_charging() {
    with_rig(|rig| {
        rig.pilot.store(PilotMeasurement::new(16.0 / 60.0, 1000.0));
        rig.battery(&Battery::healthy());
        rig.plug(true);

        assert_eq!(rig.poll(), ChargeState::Connected);
        assert!(rig.charger.bms().charge_requested());
        assert!(rig.charger.indicators().proximity);

        assert_eq!(rig.poll(), ChargeState::PowerStageStarting);
        assert!(rig.charger.port().ac_on);
        assert!(rig.charger.indicators().ac);
        assert!(!rig.charger.stage().is_enabled(), "stage waits for comms");

        // Stage still silent: stay put.
        assert_eq!(rig.poll(), ChargeState::PowerStageStarting);

        rig.stage_status(380.0, 0.0);
        assert_eq!(rig.poll(), ChargeState::Charging);
        assert!(rig.charger.stage().is_enabled());
        assert!((rig.charger.find_current_limit() - 2.2).abs() < 1e-3);
        assert!((rig.charger.stage().control().current_limit() - 2.2).abs() < 0.11);
        assert!((rig.charger.stage().control().voltage_limit() - 398.4).abs() < 0.11);
    });
}

#[test]
fn readiness_revoked_before_stage_start_regresses() {
    with_rig(|rig| {
        rig.battery(&Battery::healthy());
        rig.plug(true);
        assert_eq!(rig.poll(), ChargeState::Connected);
        assert_eq!(rig.poll(), ChargeState::PowerStageStarting);

        rig.battery(&Battery {
            ready: false,
            ..Battery::healthy()
        });
        assert_eq!(rig.poll(), ChargeState::Connected);
    });
}

#[test]
fn unsafe_cells_never_start_charging() {
    with_rig(|rig| {
        rig.battery(&Battery {
            temp_centi: 4600,
            ..Battery::healthy()
        });
        rig.plug(true);
        // 46 °C is a resettable battery fault, not a start condition.
        assert_eq!(rig.poll(), ChargeState::FaultResettable);
    });

    with_rig(|rig| {
        rig.battery(&Battery {
            cell_millivolts: 4160,
            ..Battery::healthy()
        });
        rig.plug(true);
        assert_eq!(rig.poll(), ChargeState::Connected);
        assert_eq!(rig.poll(), ChargeState::Connected);
        assert!(!rig.charger.bms().charge_requested());
    });
}

#[test]
fn energy_cap_withholds_charge_request() {
    with_rig(|rig| {
        rig.battery(&Battery {
            watt_hours: 20_500.0,
            ..Battery::healthy()
        });
        rig.plug(true);
        assert_eq!(rig.poll(), ChargeState::Connected);
        assert!(!rig.charger.bms().charge_requested());
        assert_eq!(rig.outbox.charge_request(), ChargeRequest::default());
    });
}

#[test]
fn unplug_while_charging_returns_to_idle() {
    with_rig(|rig| {
        start_charging(rig);
        rig.plug(false);
        assert_eq!(rig.poll(), ChargeState::Idle);

        let port = rig.charger.port();
        assert!(!port.ac_on);
        assert!(!rig.charger.stage().is_enabled());
        assert!(!rig.charger.bms().charge_requested());
        assert!(!rig.outbox.stage_control().is_enabled());
    });
}

#[test]
fn readiness_revoked_while_charging_regresses() {
    with_rig(|rig| {
        start_charging(rig);
        rig.battery(&Battery {
            ready: false,
            ..Battery::healthy()
        });
        assert_eq!(rig.poll(), ChargeState::Connected);
    });
}

#[test]
fn trickle_current_near_target_finishes_charge() {
    with_rig(|rig| {
        start_charging(rig);
        rig.battery(&Battery {
            pack_volts: 397.0,
            pack_amps: 0.3,
            ..Battery::healthy()
        });
        assert_eq!(rig.poll(), ChargeState::ChargingDone);
        assert!(!rig.charger.stage().is_enabled());

        // Done is sticky until unplugged.
        assert_eq!(rig.poll(), ChargeState::ChargingDone);
        rig.plug(false);
        assert_eq!(rig.poll(), ChargeState::Idle);
    });
}

#[test]
fn charging_current_is_reported_across_stages() {
    with_rig(|rig| {
        start_charging(rig);
        rig.stage_status(381.0, 5.0);
        rig.poll();

        let state = rig.outbox.charger_state();
        assert!(state.plugged);
        assert!((state.charging_current - 10.0).abs() < 0.2);
        assert_eq!(state.max_temp, 30_000);
        assert!(state.faults.0 == 0);
    });
}

#[test]
fn state_changes_are_recorded_in_order() {
    with_rig(|rig| {
        start_charging(rig);
        let transitions: Vec<(ChargeState, ChargeState)> = rig
            .charger
            .events()
            .oldest_first()
            .filter_map(|record| match record.event {
                ChargeEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (ChargeState::Idle, ChargeState::Connected),
                (ChargeState::Connected, ChargeState::PowerStageStarting),
                (ChargeState::PowerStageStarting, ChargeState::Charging),
            ]
        );
    });
}

struct FlakyBus {
    busy_first: bool,
    sent: Vec<CanFrame>,
}

impl CanTransmit for FlakyBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        if self.busy_first {
            self.busy_first = false;
            return Err(BusError::Busy);
        }
        self.sent.push(*frame);
        Ok(())
    }
}

#[test]
fn stage_broadcast_reaches_the_bus_after_retry() {
    with_rig(|rig| {
        start_charging(rig);

        let mut queue: TxQueue = TxQueue::new();
        let (mut tx, mut rx) = queue.split();
        rig.outbox.broadcast_stage_bus(&mut tx).unwrap();

        let mut bus = FlakyBus {
            busy_first: true,
            sent: Vec::new(),
        };
        assert_eq!(rx.drain_one(&mut bus), DrainOutcome::Retry(BusError::Busy));
        assert_eq!(rx.drain_one(&mut bus), DrainOutcome::Sent);
        assert_eq!(rx.drain_one(&mut bus), DrainOutcome::Idle);

        let control = StageControl::decode(&bus.sent[0]).unwrap();
        assert!(control.is_enabled());
    });
}

#[test]
fn wait_for_battery_is_bounded() {
    with_rig(|rig| {
        assert!(!rig.charger.wait_for_battery(Some(Duration::from_millis(200))));
        assert!(rig.clock.now().0 > 200);

        rig.battery(&Battery::healthy());
        assert!(rig.charger.wait_for_battery(None));
    });
}
