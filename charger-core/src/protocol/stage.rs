//! Power stage bus: one control frame out, one status frame back.
//!
//! Both frames are 8 bytes, little-endian, on 29-bit identifiers. Current is
//! carried in 100 mA units subtracted from a fixed offset, so a raw value of
//! 3200 means zero amps. The same offset applies to the commanded limit and
//! to the reported output current.

use crate::can::{CanFrame, CanId, FrameError};
use crate::transport::{SlotReader, SlotWriter, TelemetrySlot};

use super::{read_u16, write};

pub const CONTROL_ID: CanId = CanId::Extended(0x18E5_4024);
pub const STATUS_ID: CanId = CanId::Extended(0x18EB_2440);

/// Enable byte commanding the modules to deliver power.
pub const ENABLE: u8 = 0xFC;
/// Enable byte commanding the modules off.
pub const DISABLE: u8 = 0xFF;

/// Raw current value corresponding to zero amps.
pub const CURRENT_OFFSET: u16 = 3200;
/// Offset subtracted from the raw temperature byte (°C).
pub const TEMPERATURE_OFFSET: i16 = 40;

const DECI: f32 = 10.0;

/// Control frame held locally and sent by the periodic stage broadcast.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StageControl {
    pub enable: u8,
    /// Voltage limit in 100 mV.
    pub charge_voltage: u16,
    /// Offset-encoded current limit in 100 mA.
    pub charge_current: u16,
    pub led_pattern: u8,
    pub reserved: u16,
}

impl Default for StageControl {
    fn default() -> Self {
        Self {
            enable: DISABLE,
            charge_voltage: 0,
            charge_current: CURRENT_OFFSET,
            led_pattern: 0,
            reserved: 0,
        }
    }
}

impl StageControl {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enable == ENABLE
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enable = if enabled { ENABLE } else { DISABLE };
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_voltage_limit(&mut self, volts: f32) {
        self.charge_voltage = (volts * DECI) as u16;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_current_limit(&mut self, amps: f32) {
        self.charge_current = CURRENT_OFFSET.saturating_sub((amps * DECI) as u16);
    }

    #[must_use]
    pub fn voltage_limit(&self) -> f32 {
        f32::from(self.charge_voltage) / DECI
    }

    #[must_use]
    pub fn current_limit(&self) -> f32 {
        offset_current(self.charge_current)
    }

    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        let mut data = [0; 8];
        data[0] = self.enable;
        write(&mut data, 1, &self.charge_voltage.to_le_bytes());
        write(&mut data, 3, &self.charge_current.to_le_bytes());
        data[5] = self.led_pattern;
        write(&mut data, 6, &self.reserved.to_le_bytes());
        data
    }

    #[must_use]
    pub fn from_payload(data: &[u8; 8]) -> Self {
        Self {
            enable: data[0],
            charge_voltage: read_u16(data, 1),
            charge_current: read_u16(data, 3),
            led_pattern: data[5],
            reserved: read_u16(data, 6),
        }
    }

    #[must_use]
    pub fn encode(&self) -> CanFrame {
        CanFrame::new(CONTROL_ID, self.to_payload())
    }

    /// # Errors
    ///
    /// Fails when `frame` is not a full control frame.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        frame.expect(CONTROL_ID, 8).map(Self::from_payload)
    }
}

/// Status frame reported by the power stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StageStatus {
    pub status_flags: u8,
    pub charge_flags: u8,
    /// Output voltage in 100 mV.
    pub output_voltage: u16,
    /// Offset-encoded output current in 100 mA.
    pub output_current: u16,
    /// Temperature in °C plus [`TEMPERATURE_OFFSET`].
    pub temperature: u8,
    pub reserved: u8,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self {
            status_flags: 0,
            charge_flags: 0,
            output_voltage: 0,
            output_current: CURRENT_OFFSET,
            temperature: 0,
            reserved: 0,
        }
    }
}

impl StageStatus {
    /// Builds a status frame from engineering units; used by simulated stages.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_readings(volts: f32, amps: f32, celsius: i16) -> Self {
        let raw_current = i32::from(CURRENT_OFFSET) - (amps * DECI) as i32;
        Self {
            output_voltage: (volts * DECI) as u16,
            output_current: u16::try_from(raw_current.max(0)).unwrap_or(u16::MAX),
            temperature: u8::try_from(celsius.saturating_add(TEMPERATURE_OFFSET).clamp(0, 255))
                .unwrap_or(u8::MAX),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn output_voltage_volts(&self) -> f32 {
        f32::from(self.output_voltage) / DECI
    }

    #[must_use]
    pub fn output_current_amps(&self) -> f32 {
        offset_current(self.output_current)
    }

    #[must_use]
    pub fn temperature_celsius(&self) -> f32 {
        f32::from(i16::from(self.temperature) - TEMPERATURE_OFFSET)
    }

    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        let mut data = [0; 8];
        data[0] = self.status_flags;
        data[1] = self.charge_flags;
        write(&mut data, 2, &self.output_voltage.to_le_bytes());
        write(&mut data, 4, &self.output_current.to_le_bytes());
        data[6] = self.temperature;
        data[7] = self.reserved;
        data
    }

    #[must_use]
    pub fn encode(&self) -> CanFrame {
        CanFrame::new(STATUS_ID, self.to_payload())
    }

    /// # Errors
    ///
    /// Fails when `frame` is not a full status frame.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(STATUS_ID, 8)?;
        Ok(Self {
            status_flags: data[0],
            charge_flags: data[1],
            output_voltage: read_u16(data, 2),
            output_current: read_u16(data, 4),
            temperature: data[6],
            reserved: data[7],
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn offset_current(raw: u16) -> f32 {
    (i32::from(CURRENT_OFFSET) - i32::from(raw)) as f32 / DECI
}

/// Receive-side slots for the power stage bus.
#[derive(Default)]
pub struct StageBusSlots {
    status: TelemetrySlot<StageStatus>,
}

impl StageBusSlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(&mut self) -> (StageBusRouter<'_>, SlotReader<'_, StageStatus>) {
        let (writer, reader) = self.status.split();
        (StageBusRouter { status: writer }, reader)
    }
}

/// Receive path for the power stage bus.
pub struct StageBusRouter<'a> {
    status: SlotWriter<'a, StageStatus>,
}

impl StageBusRouter<'_> {
    /// Decodes `frame` into its slot. Returns `false` for frames this core ignores.
    pub fn dispatch(&mut self, frame: &CanFrame) -> bool {
        match StageStatus::decode(frame) {
            Ok(status) => {
                self.status.push(status);
                true
            }
            Err(_) => false,
        }
    }
}
