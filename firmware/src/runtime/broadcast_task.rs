use charger_core::charger::Outbox;
use charger_core::pilot::{PilotCell, PilotMeasurement};
use charger_core::transport::TxProducer;
use embassy_stm32::gpio::Output;
use embassy_stm32::peripherals::TIM1;
use embassy_stm32::timer::pwm_input::PwmInput;
use embassy_time::Ticker;

use super::can_task::TxReady;
use crate::board::{
    CAR_BROADCAST_PERIOD, PILOT_SAMPLE_PERIOD, PILOT_TIMER_HZ, STAGE_BROADCAST_PERIOD,
};

#[embassy_executor::task]
pub async fn car_broadcast(
    outbox: &'static Outbox,
    mut queue: TxProducer<'static>,
    ready: &'static TxReady,
    mut activity: Output<'static>,
) -> ! {
    let mut ticker = Ticker::every(CAR_BROADCAST_PERIOD);
    loop {
        ticker.next().await;
        if let Err(error) = outbox.broadcast_car_bus(&mut queue) {
            defmt::warn!("car bus: {} ({} dropped)", error, outbox.dropped_frames());
        }
        ready.signal(());
        activity.toggle();
    }
}

#[embassy_executor::task]
pub async fn stage_broadcast(
    outbox: &'static Outbox,
    mut queue: TxProducer<'static>,
    ready: &'static TxReady,
    mut activity: Output<'static>,
) -> ! {
    let mut ticker = Ticker::every(STAGE_BROADCAST_PERIOD);
    loop {
        ticker.next().await;
        if let Err(error) = outbox.broadcast_stage_bus(&mut queue) {
            defmt::warn!("stage bus: {} ({} dropped)", error, outbox.dropped_frames());
        }
        ready.signal(());
        activity.toggle();
    }
}

#[embassy_executor::task]
pub async fn pilot_sample(cell: &'static PilotCell, mut capture: PwmInput<'static, TIM1>) -> ! {
    capture.enable();
    let mut ticker = Ticker::every(PILOT_SAMPLE_PERIOD);
    loop {
        ticker.next().await;
        cell.store(PilotMeasurement::from_capture(
            capture.get_period_ticks(),
            capture.get_width_ticks(),
            PILOT_TIMER_HZ,
        ));
    }
}
