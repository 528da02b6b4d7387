use core::time::Duration;

use charger_core::charger::{Charger, ChargerLinks, Outbox};
use charger_core::config::ChargerConfig;
use charger_core::pilot::PilotCell;
use charger_core::protocol::car::CarBusSlots;
use charger_core::protocol::stage::StageBusSlots;
use charger_core::transport::TxQueue;
use cortex_m::interrupt as cm_interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_futures::yield_now;
use embassy_stm32 as hal;
use embassy_stm32::can::filter::Mask32;
use embassy_stm32::can::{
    Can, Fifo, Rx0InterruptHandler, Rx1InterruptHandler, SceInterruptHandler, TxInterruptHandler,
};
use embassy_stm32::gpio::{Input, Level, Output, OutputOpenDrain, Pull, Speed};
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::peripherals::{CAN1, CAN2};
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::pwm_input::PwmInput;
use static_cell::StaticCell;

use crate::board::{BoardClock, CAR_BUS_BITRATE, PILOT_TIMER_HZ, STAGE_BUS_BITRATE};
use crate::can::BusTransmitter;
use crate::hw::{ConnectorPort, PanelLights};
use crate::telemetry::EventDrain;

mod broadcast_task;
mod can_task;

use can_task::TxReady;

/// Bound on each startup wait for battery telemetry before logging and retrying.
const BATTERY_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        cm_interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                cm_interrupt::enable();
            }
        }
    }
}

hal::bind_interrupts!(struct CanIrqs {
    CAN1_RX0 => Rx0InterruptHandler<CAN1>;
    CAN1_RX1 => Rx1InterruptHandler<CAN1>;
    CAN1_SCE => SceInterruptHandler<CAN1>;
    CAN1_TX => TxInterruptHandler<CAN1>;
    CAN2_RX0 => Rx0InterruptHandler<CAN2>;
    CAN2_RX1 => Rx1InterruptHandler<CAN2>;
    CAN2_SCE => SceInterruptHandler<CAN2>;
    CAN2_TX => TxInterruptHandler<CAN2>;
});

/// Runs the bus tasks and periodic triggers above the poll loop.
static EXECUTOR_BUS: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn UART5() {
    unsafe { EXECUTOR_BUS.on_interrupt() }
}

static CAR_SLOTS: StaticCell<CarBusSlots> = StaticCell::new();
static STAGE_SLOTS: StaticCell<StageBusSlots> = StaticCell::new();
static CAR_TX: StaticCell<TxQueue> = StaticCell::new();
static STAGE_TX: StaticCell<TxQueue> = StaticCell::new();
static OUTBOX: StaticCell<Outbox> = StaticCell::new();
static PILOT: PilotCell = PilotCell::new();
static CAR_TX_READY: TxReady = TxReady::new();
static STAGE_TX_READY: TxReady = TxReady::new();

#[embassy_executor::main]
pub async fn main(_spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA1,
        PA2,
        PA4,
        PA6,
        PA8,
        PA11,
        PA12,
        PB12,
        PB13,
        PB14,
        PB15,
        PC6,
        CAN1,
        CAN2,
        TIM1,
        ..
    } = hal::init(config);

    let mut car_can = Can::new(CAN1, PA11, PA12, CanIrqs);
    let mut stage_can = Can::new(CAN2, PB12, PB13, CanIrqs);
    // CAN2 shares the CAN1 filter banks: 0..14 for the car bus, 14.. for the stage bus.
    car_can
        .modify_filters()
        .set_split(14)
        .enable_bank(0, Fifo::Fifo0, Mask32::accept_all())
        .slave_filters()
        .enable_bank(14, Fifo::Fifo0, Mask32::accept_all());
    car_can.modify_config().set_bitrate(CAR_BUS_BITRATE);
    stage_can.modify_config().set_bitrate(STAGE_BUS_BITRATE);
    car_can.enable().await;
    stage_can.enable().await;
    let (car_tx, car_rx) = car_can.split();
    let (stage_tx, stage_rx) = stage_can.split();

    let (car_router, bms) = CAR_SLOTS.init(CarBusSlots::new()).split();
    let (stage_router, stage_status) = STAGE_SLOTS.init(StageBusSlots::new()).split();
    let (car_queue, car_drain) = CAR_TX.init(TxQueue::new()).split();
    let (stage_queue, stage_drain) = STAGE_TX.init(TxQueue::new()).split();
    let outbox: &'static Outbox = OUTBOX.init(Outbox::new());

    let port = ConnectorPort::new(
        Input::new(PA6, Pull::None),
        Output::new(PA4, Level::Low, Speed::Low),
    );
    let lights = PanelLights::new(
        OutputOpenDrain::new(PA1, Level::High, Speed::Low),
        Output::new(PA2, Level::High, Speed::Low),
        Output::new(PC6, Level::High, Speed::Low),
    );
    let capture = PwmInput::new_ch1(TIM1, PA8, Pull::None, Hertz(PILOT_TIMER_HZ));

    interrupt::UART5.set_priority(Priority::P6);
    let spawner = EXECUTOR_BUS.start(interrupt::UART5);
    spawner
        .spawn(can_task::car_rx(car_rx, car_router))
        .expect("failed to spawn car bus receive task");
    spawner
        .spawn(can_task::stage_rx(stage_rx, stage_router))
        .expect("failed to spawn stage bus receive task");
    spawner
        .spawn(can_task::drain(
            "car",
            BusTransmitter::new(car_tx),
            car_drain,
            &CAR_TX_READY,
        ))
        .expect("failed to spawn car bus transmit task");
    spawner
        .spawn(can_task::drain(
            "stage",
            BusTransmitter::new(stage_tx),
            stage_drain,
            &STAGE_TX_READY,
        ))
        .expect("failed to spawn stage bus transmit task");
    spawner
        .spawn(broadcast_task::car_broadcast(
            outbox,
            car_queue,
            &CAR_TX_READY,
            Output::new(PB14, Level::Low, Speed::Low),
        ))
        .expect("failed to spawn car broadcast task");
    spawner
        .spawn(broadcast_task::stage_broadcast(
            outbox,
            stage_queue,
            &STAGE_TX_READY,
            Output::new(PB15, Level::Low, Speed::Low),
        ))
        .expect("failed to spawn stage broadcast task");
    spawner
        .spawn(broadcast_task::pilot_sample(&PILOT, capture))
        .expect("failed to spawn pilot capture task");

    let mut charger = Charger::new(
        ChargerConfig::default(),
        ChargerLinks {
            bms,
            stage: stage_status,
            pilot: &PILOT,
            outbox,
        },
        BoardClock,
        port,
        lights,
    );

    defmt::info!("charger: waiting for battery telemetry");
    while !charger.wait_for_battery(Some(BATTERY_WAIT_LOG_INTERVAL)) {
        defmt::warn!("charger: battery still silent");
    }
    defmt::info!("charger: battery live, entering poll loop");

    let mut events = EventDrain::new();
    loop {
        charger.poll();
        events.drain(charger.events());
        yield_now().await;
    }
}
