//! Periodic outbound frames.
//!
//! The poll loop publishes the latest payload of each periodic frame here;
//! the car-bus and stage-bus triggers read them and queue frames for
//! transmission. Neither side ever waits on the other.

use crate::can::CanFrame;
use crate::protocol::car::{CHARGE_REQUEST_ID, CHARGER_STATE_ID, ChargeRequest, ChargerState};
use crate::protocol::stage::{CONTROL_ID, StageControl};
use crate::transport::{EnqueueError, PayloadCell, TxProducer};

/// Latest payloads of the three periodic frames.
pub struct Outbox {
    charge_request: PayloadCell,
    charger_state: PayloadCell,
    stage_control: PayloadCell,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            charge_request: PayloadCell::new(ChargeRequest::default().to_payload()),
            charger_state: PayloadCell::new(ChargerState::default().to_payload()),
            stage_control: PayloadCell::new(StageControl::default().to_payload()),
        }
    }

    pub fn publish_car(&self, request: ChargeRequest, state: &ChargerState) {
        self.charge_request.store(request.to_payload());
        self.charger_state.store(state.to_payload());
    }

    pub fn publish_stage(&self, control: &StageControl) {
        self.stage_control.store(control.to_payload());
    }

    #[must_use]
    pub fn charge_request(&self) -> ChargeRequest {
        ChargeRequest::from_payload(&self.charge_request.load())
    }

    #[must_use]
    pub fn charger_state(&self) -> ChargerState {
        ChargerState::from_payload(&self.charger_state.load())
    }

    #[must_use]
    pub fn stage_control(&self) -> StageControl {
        StageControl::from_payload(&self.stage_control.load())
    }

    /// Car-bus trigger: queues the charge request and charger state frames.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if either frame was dropped.
    pub fn broadcast_car_bus(&self, tx: &mut TxProducer<'_>) -> Result<(), EnqueueError> {
        let request = push(
            tx,
            &self.charge_request,
            CanFrame::new(CHARGE_REQUEST_ID, self.charge_request.load()),
        );
        let state = push(
            tx,
            &self.charger_state,
            CanFrame::new(CHARGER_STATE_ID, self.charger_state.load()),
        );
        request.and(state)
    }

    /// Stage-bus trigger: queues the control frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the frame was dropped.
    pub fn broadcast_stage_bus(&self, tx: &mut TxProducer<'_>) -> Result<(), EnqueueError> {
        push(
            tx,
            &self.stage_control,
            CanFrame::new(CONTROL_ID, self.stage_control.load()),
        )
    }

    /// Frames dropped on full transmit queues since start-up.
    #[must_use]
    pub fn dropped_frames(&self) -> u32 {
        self.charge_request.dropped() + self.charger_state.dropped() + self.stage_control.dropped()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

fn push(
    tx: &mut TxProducer<'_>,
    cell: &PayloadCell,
    frame: CanFrame,
) -> Result<(), EnqueueError> {
    tx.push(frame).inspect_err(|_| cell.note_dropped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::car::FaultFlags;
    use crate::transport::TxQueue;

    #[test]
    fn stage_broadcast_sends_latest_control() {
        let outbox = Outbox::new();
        let mut queue: TxQueue<8> = TxQueue::new();
        let (mut tx, mut rx) = queue.split();

        let mut control = StageControl::default();
        control.set_enabled(true);
        outbox.publish_stage(&control);
        outbox.broadcast_stage_bus(&mut tx).unwrap();

        let frame = rx.pop().unwrap();
        assert!(StageControl::decode(&frame).unwrap().is_enabled());
    }

    #[test]
    fn car_broadcast_queues_request_then_state() {
        let outbox = Outbox::new();
        let mut queue: TxQueue<8> = TxQueue::new();
        let (mut tx, mut rx) = queue.split();

        outbox.publish_car(
            ChargeRequest {
                charging_requested: true,
            },
            &ChargerState::new(FaultFlags(FaultFlags::STAGE_OVERTEMP), true, 3.0, 20.0),
        );
        outbox.broadcast_car_bus(&mut tx).unwrap();

        assert_eq!(rx.pop().map(|frame| frame.id()), Some(CHARGE_REQUEST_ID));
        let state = ChargerState::decode(&rx.pop().unwrap()).unwrap();
        assert!(state.faults.contains(FaultFlags::STAGE_OVERTEMP));
    }

    #[test]
    fn full_queue_counts_drops() {
        let outbox = Outbox::new();
        let mut queue: TxQueue<2> = TxQueue::new();
        let (mut tx, _rx) = queue.split();
        let capacity = tx.capacity();

        for _ in 0..capacity {
            let _ = outbox.broadcast_stage_bus(&mut tx);
        }
        assert_eq!(outbox.broadcast_stage_bus(&mut tx), Err(EnqueueError::Full));
        assert_eq!(outbox.dropped_frames(), 1);
    }
}
