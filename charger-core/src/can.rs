//! Minimal CAN frame model for the two charger buses.
//!
//! Only classic 8-byte data frames are modelled; the bus drivers on each
//! target convert to and from their native frame types.

use core::fmt;

/// Maximum payload length of a classic CAN data frame.
pub const MAX_PAYLOAD: usize = 8;

/// 11-bit standard or 29-bit extended identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    Standard(u16),
    Extended(u32),
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanId::Standard(id) => write!(f, "{id:#05x}"),
            CanId::Extended(id) => write!(f, "{id:#010x}"),
        }
    }
}

/// Data frame with up to eight payload bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    id: CanId,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl CanFrame {
    /// Creates a full-length frame.
    #[must_use]
    pub const fn new(id: CanId, data: [u8; MAX_PAYLOAD]) -> Self {
        Self {
            id,
            len: 8,
            data,
        }
    }

    /// Creates a frame from a payload slice of at most eight bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLong`] when `payload` exceeds eight bytes.
    pub fn from_slice(id: CanId, payload: &[u8]) -> Result<Self, FrameError> {
        let len = u8::try_from(payload.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_PAYLOAD)
            .ok_or(FrameError::TooLong { len: payload.len() })?;
        let mut data = [0; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self { id, len, data })
    }

    #[must_use]
    pub const fn id(&self) -> CanId {
        self.id
    }

    /// Payload bytes actually carried by the frame.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// Returns the payload if the frame carries `id` and at least `min_len` bytes.
    ///
    /// # Errors
    ///
    /// [`FrameError::UnexpectedId`] or [`FrameError::ShortPayload`].
    pub fn expect(&self, id: CanId, min_len: u8) -> Result<&[u8; MAX_PAYLOAD], FrameError> {
        if self.id != id {
            return Err(FrameError::UnexpectedId {
                expected: id,
                found: self.id,
            });
        }
        if self.len < min_len {
            return Err(FrameError::ShortPayload {
                expected: min_len,
                found: self.len,
            });
        }
        Ok(&self.data)
    }
}

/// Errors raised while building or decoding frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    UnexpectedId { expected: CanId, found: CanId },
    ShortPayload { expected: u8, found: u8 },
    TooLong { len: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnexpectedId { expected, found } => {
                write!(f, "expected frame {expected}, found {found}")
            }
            FrameError::ShortPayload { expected, found } => {
                write!(f, "payload of {found} bytes, need {expected}")
            }
            FrameError::TooLong { len } => write!(f, "payload of {len} bytes exceeds 8"),
        }
    }
}

/// Transmit failures reported by a bus driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// All transmit mailboxes are occupied.
    Busy,
    /// The controller refused the frame (bus-off, error passive).
    Rejected,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Busy => f.write_str("transmit mailboxes full"),
            BusError::Rejected => f.write_str("frame rejected by controller"),
        }
    }
}

/// Non-blocking transmit side of a CAN controller.
pub trait CanTransmit {
    /// Hands `frame` to the controller.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] when the controller cannot accept the frame now.
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError>;
}

impl<T> CanTransmit for &mut T
where
    T: CanTransmit + ?Sized,
{
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        (**self).transmit(frame)
    }
}
