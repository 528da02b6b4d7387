use core::cell::{Cell, RefCell};
use core::ops::Add;
use core::time::Duration;

use charger_core::charger::{ChargeState, Charger, ChargerLinks, IsolationOutcome, Outbox};
use charger_core::config::ChargerConfig;
use charger_core::indicators::NoopIndicators;
use charger_core::pilot::{ChargePort, PilotCell, PilotMeasurement};
use charger_core::protocol::car::{
    BatteryStatus, CarBusRouter, CarBusSlots, ChargerResponse, ModuleMinMax, PackCapacity,
    PackMeasurement,
};
use charger_core::protocol::stage::{StageBusRouter, StageBusSlots, StageStatus};
use charger_core::telemetry::ChargeEvent;
use charger_core::time::{ChargerInstant, Clock};

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

/// Millisecond clock that also plays the stage peer during busy waits: once
/// `decays_at` is reached, every wait iteration reports zero output current.
struct DecayingClock<'a> {
    now: Cell<u64>,
    stage: RefCell<StageBusRouter<'a>>,
    decays_at: Cell<Option<u64>>,
}

impl DecayingClock<'_> {
    fn report(&self, amps: f32) {
        assert!(
            self.stage
                .borrow_mut()
                .dispatch(&StageStatus::from_readings(380.0, amps, 30).encode())
        );
    }
}

impl Clock for DecayingClock<'_> {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        MockInstant(self.now.get())
    }

    fn relax(&self) {
        self.now.set(self.now.get() + 10);
        if self.decays_at.get().is_some_and(|at| self.now.get() >= at) {
            self.report(0.0);
        }
    }
}

#[derive(Default)]
struct CountingPort {
    present: bool,
    isolations: u32,
}

impl ChargePort for CountingPort {
    fn is_present(&self) -> bool {
        self.present
    }

    fn output_ac(&mut self) {}

    fn isolate(&mut self) {
        self.isolations += 1;
    }
}

type TestCharger<'a> = Charger<'a, &'a DecayingClock<'a>, CountingPort, NoopIndicators>;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn healthy_battery(bus: &mut CarBusRouter<'_>) {
    let frames = [
        ModuleMinMax {
            max_temp: 2500,
            min_temp: 2400,
            max_cell_voltage: 3900,
            min_cell_voltage: 3880,
        }
        .encode(),
        ChargerResponse {
            charging_ready: true,
        }
        .encode(),
        BatteryStatus { killed: false }.encode(),
        PackMeasurement {
            voltage: 38_000,
            current: 0.0,
        }
        .encode(),
        PackCapacity {
            watt_hours: 10_000.0,
        }
        .encode(),
    ];
    for frame in &frames {
        assert!(bus.dispatch(frame));
    }
}

fn with_charger(test: impl FnOnce(&mut TestCharger<'_>, &DecayingClock<'_>)) {
    let pilot = PilotCell::new();
    pilot.store(PilotMeasurement::new(0.5, 1000.0));
    let outbox = Outbox::new();
    let mut car = CarBusSlots::new();
    let mut stage = StageBusSlots::new();
    let (mut car_bus, bms) = car.split();
    let (stage_bus, status) = stage.split();
    healthy_battery(&mut car_bus);

    let clock = DecayingClock {
        now: Cell::new(0),
        stage: RefCell::new(stage_bus),
        decays_at: Cell::new(None),
    };
    let mut charger = Charger::new(
        ChargerConfig::default(),
        ChargerLinks {
            bms,
            stage: status,
            pilot: &pilot,
            outbox: &outbox,
        },
        &clock,
        CountingPort {
            present: true,
            isolations: 0,
        },
        NoopIndicators,
    );
    test(&mut charger, &clock);
}

/// Plugs in and runs to `Charging` with the stage delivering `amps`.
fn charge_at(charger: &mut TestCharger<'_>, clock: &DecayingClock<'_>, amps: f32) {
    assert_eq!(poll(charger), ChargeState::Connected);
    assert_eq!(poll(charger), ChargeState::PowerStageStarting);
    clock.report(amps);
    assert_eq!(poll(charger), ChargeState::Charging);
    assert!(charger.stage().is_enabled());
}

fn poll(charger: &mut TestCharger<'_>) -> ChargeState {
    charger.poll();
    charger.state()
}

fn isolation_events(charger: &TestCharger<'_>) -> Vec<(u32, bool)> {
    charger
        .events()
        .oldest_first()
        .filter_map(|record| match record.event {
            ChargeEvent::IsolationComplete {
                waited_ms,
                timed_out,
            } => Some((waited_ms, timed_out)),
            _ => None,
        })
        .collect()
}

#[test]
fn repeated_isolation_with_no_current_does_not_wait() {
    with_charger(|charger, clock| {
        let first = charger.isolate();
        let second = charger.isolate();

        let immediate = IsolationOutcome {
            waited: Duration::ZERO,
            timed_out: false,
        };
        assert_eq!(first, immediate);
        assert_eq!(second, immediate);
        assert_eq!(clock.now(), MockInstant(0));
        assert_eq!(charger.port().isolations, 2);
        assert!(
            isolation_events(charger).is_empty(),
            "isolating an idle charger is not worth recording"
        );
    });
}

#[test]
fn isolation_waits_for_current_to_decay() {
    with_charger(|charger, clock| {
        charge_at(charger, clock, 8.0);

        let start = clock.now().0;
        clock.decays_at.set(Some(start + 120));
        charger.port_mut().present = false;
        assert_eq!(poll(charger), ChargeState::Idle);

        assert_eq!(clock.now().0 - start, 120);
        assert_eq!(charger.port().isolations, 1);
        assert_eq!(isolation_events(charger), vec![(120, false)]);
        assert!(charger.stage().output_current() < 0.01);
    });
}

#[test]
fn isolation_gives_up_after_the_wait_bound() {
    with_charger(|charger, clock| {
        charge_at(charger, clock, 8.0);

        charger.port_mut().present = false;
        assert_eq!(poll(charger), ChargeState::Idle);

        let events = isolation_events(charger);
        assert_eq!(events.len(), 1);
        let (waited_ms, timed_out) = events[0];
        assert!(timed_out);
        assert!(waited_ms > 500, "waited {waited_ms} ms");
        assert!(waited_ms <= 520, "waited {waited_ms} ms");

        // Contactor is opened and the charge request withdrawn regardless.
        assert_eq!(charger.port().isolations, 1);
        assert!(!charger.bms().charge_requested());
    });
}

#[test]
fn second_isolation_after_decay_is_immediate() {
    with_charger(|charger, clock| {
        charge_at(charger, clock, 8.0);
        clock.decays_at.set(Some(clock.now().0));

        let first = charger.isolate();
        assert!(!first.timed_out);
        assert!(first.waited > Duration::ZERO);

        let second = charger.isolate();
        assert_eq!(second.waited, Duration::ZERO);
        assert!(!second.timed_out);
    });
}
