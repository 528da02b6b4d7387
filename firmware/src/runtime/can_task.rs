use charger_core::can::BusError;
use charger_core::protocol::car::CarBusRouter;
use charger_core::protocol::stage::StageBusRouter;
use charger_core::transport::{DrainOutcome, TxConsumer};
use embassy_stm32::can::CanRx;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::can::{BusTransmitter, from_driver};

/// Raised by the periodic triggers after queueing frames for a bus.
pub type TxReady = Signal<CriticalSectionRawMutex, ()>;

#[embassy_executor::task]
pub async fn car_rx(mut rx: CanRx<'static>, mut router: CarBusRouter<'static>) -> ! {
    loop {
        match rx.read().await {
            Ok(envelope) => {
                if let Some(frame) = from_driver(&envelope.frame) {
                    router.dispatch(&frame);
                }
            }
            Err(error) => defmt::warn!("car bus: receive error {}", error),
        }
    }
}

#[embassy_executor::task]
pub async fn stage_rx(mut rx: CanRx<'static>, mut router: StageBusRouter<'static>) -> ! {
    loop {
        match rx.read().await {
            Ok(envelope) => {
                if let Some(frame) = from_driver(&envelope.frame) {
                    router.dispatch(&frame);
                }
            }
            Err(error) => defmt::warn!("stage bus: receive error {}", error),
        }
    }
}

#[embassy_executor::task(pool_size = 2)]
pub async fn drain(
    bus: &'static str,
    mut tx: BusTransmitter<'static>,
    mut queue: TxConsumer<'static>,
    ready: &'static TxReady,
) -> ! {
    loop {
        tx.mailbox_free().await;
        match queue.drain_one(&mut tx) {
            DrainOutcome::Sent | DrainOutcome::Retry(BusError::Busy) => {}
            DrainOutcome::Retry(BusError::Rejected) => {
                // A rejected head frame would otherwise block the queue forever.
                if let Some(frame) = queue.pop() {
                    defmt::error!("{} bus: dropped unsendable frame {}", bus, frame.id());
                }
            }
            DrainOutcome::Idle => ready.wait().await,
        }
    }
}
