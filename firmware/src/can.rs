//! bxCAN driver glue: frame conversion and the transmit seam.

use charger_core::can::{BusError, CanFrame, CanId, CanTransmit};
use embassy_stm32::can::{CanTx, Frame, TryWriteError};
use embedded_can::Id;

/// Converts a received driver frame. Remote frames and oversize payloads are
/// not part of either bus protocol and yield `None`.
pub fn from_driver(frame: &Frame) -> Option<CanFrame> {
    let id = match frame.id() {
        Id::Standard(id) => CanId::Standard(id.as_raw()),
        Id::Extended(id) => CanId::Extended(id.as_raw()),
    };
    CanFrame::from_slice(id, frame.data()).ok()
}

/// Builds a driver frame from a core frame.
///
/// # Errors
///
/// [`BusError::Rejected`] if the identifier is out of range for its kind.
pub fn to_driver(frame: &CanFrame) -> Result<Frame, BusError> {
    let built = match frame.id() {
        CanId::Standard(id) => Frame::new_standard(id, frame.data()),
        CanId::Extended(id) => Frame::new_extended(id, frame.data()),
    };
    built.map_err(|_| BusError::Rejected)
}

/// Non-blocking transmit half of one bus.
pub struct BusTransmitter<'d> {
    tx: CanTx<'d>,
}

impl<'d> BusTransmitter<'d> {
    pub fn new(tx: CanTx<'d>) -> Self {
        Self { tx }
    }

    /// Resolves once at least one transmit mailbox is free.
    pub async fn mailbox_free(&mut self) {
        self.tx.flush_any().await;
    }
}

impl CanTransmit for BusTransmitter<'_> {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let frame = to_driver(frame)?;
        match self.tx.try_write(&frame) {
            // A lower-priority frame may be displaced; the mailbox wait in
            // the drain task keeps that from happening.
            Ok(_) => Ok(()),
            Err(TryWriteError::Full) => Err(BusError::Busy),
        }
    }
}
