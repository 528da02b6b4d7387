//! Vehicle bus messages exchanged with the battery management system.
//!
//! All multi-byte fields are little-endian. The charger consumes five BMS
//! broadcasts and produces two frames of its own: the charge request and the
//! charger state summary.

use crate::bms::BatteryFault;
use crate::can::{CanFrame, CanId, FrameError};
use crate::power_stage::PowerStageFault;
use crate::transport::{SlotReader, SlotWriter, TelemetrySlot};

use super::{read_f32, read_i16, read_u16, write};

pub const MODULE_MIN_MAX_ID: CanId = CanId::Standard(0x612);
pub const CHARGER_RESPONSE_ID: CanId = CanId::Standard(0x613);
pub const BATTERY_STATUS_ID: CanId = CanId::Standard(0x614);
pub const MEASUREMENT_ID: CanId = CanId::Standard(0x615);
pub const CAPACITY_ID: CanId = CanId::Standard(0x616);
pub const CHARGE_REQUEST_ID: CanId = CanId::Standard(0x620);
pub const CHARGER_STATE_ID: CanId = CanId::Standard(0x621);

/// Module extremes: temperatures in 0.01 °C, cell voltages in mV.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleMinMax {
    pub max_temp: i16,
    pub min_temp: i16,
    pub max_cell_voltage: u16,
    pub min_cell_voltage: u16,
}

impl ModuleMinMax {
    #[must_use]
    pub fn encode(&self) -> CanFrame {
        let mut data = [0; 8];
        write(&mut data, 0, &self.max_temp.to_le_bytes());
        write(&mut data, 2, &self.min_temp.to_le_bytes());
        write(&mut data, 4, &self.max_cell_voltage.to_le_bytes());
        write(&mut data, 6, &self.min_cell_voltage.to_le_bytes());
        CanFrame::new(MODULE_MIN_MAX_ID, data)
    }

    /// # Errors
    ///
    /// Fails on a foreign id or a short payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(MODULE_MIN_MAX_ID, 8)?;
        Ok(Self {
            max_temp: read_i16(data, 0),
            min_temp: read_i16(data, 2),
            max_cell_voltage: read_u16(data, 4),
            min_cell_voltage: read_u16(data, 6),
        })
    }
}

/// BMS answer to the charge request.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerResponse {
    pub charging_ready: bool,
}

impl ChargerResponse {
    #[must_use]
    pub fn encode(&self) -> CanFrame {
        flag_frame(CHARGER_RESPONSE_ID, self.charging_ready)
    }

    /// # Errors
    ///
    /// Fails on a foreign id or an empty payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(CHARGER_RESPONSE_ID, 1)?;
        Ok(Self {
            charging_ready: data[0] & 1 == 1,
        })
    }
}

/// Battery state flags; only the kill flag matters to the charger.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryStatus {
    pub killed: bool,
}

impl BatteryStatus {
    #[must_use]
    pub fn encode(&self) -> CanFrame {
        flag_frame(BATTERY_STATUS_ID, self.killed)
    }

    /// # Errors
    ///
    /// Fails on a foreign id or an empty payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(BATTERY_STATUS_ID, 1)?;
        Ok(Self {
            killed: data[0] & 1 == 1,
        })
    }
}

/// Pack voltage in 10 mV and pack current in amps.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PackMeasurement {
    pub voltage: u16,
    pub current: f32,
}

impl PackMeasurement {
    #[must_use]
    pub fn encode(&self) -> CanFrame {
        let mut data = [0; 8];
        write(&mut data, 0, &self.voltage.to_le_bytes());
        write(&mut data, 4, &self.current.to_le_bytes());
        CanFrame::new(MEASUREMENT_ID, data)
    }

    /// # Errors
    ///
    /// Fails on a foreign id or a short payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(MEASUREMENT_ID, 8)?;
        Ok(Self {
            voltage: read_u16(data, 0),
            current: read_f32(data, 4),
        })
    }
}

/// Energy currently stored in the pack, in Wh.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PackCapacity {
    pub watt_hours: f32,
}

impl PackCapacity {
    #[must_use]
    pub fn encode(&self) -> CanFrame {
        let mut data = [0; 8];
        write(&mut data, 0, &self.watt_hours.to_le_bytes());
        CanFrame::new(CAPACITY_ID, data)
    }

    /// # Errors
    ///
    /// Fails on a foreign id or a short payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(CAPACITY_ID, 4)?;
        Ok(Self {
            watt_hours: read_f32(data, 0),
        })
    }
}

/// Charger to BMS: please close the charge contactors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeRequest {
    pub charging_requested: bool,
}

impl ChargeRequest {
    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        let mut data = [0; 8];
        data[0] = u8::from(self.charging_requested);
        data
    }

    #[must_use]
    pub fn from_payload(data: &[u8; 8]) -> Self {
        Self {
            charging_requested: data[0] & 1 == 1,
        }
    }

    #[must_use]
    pub fn encode(&self) -> CanFrame {
        CanFrame::new(CHARGE_REQUEST_ID, self.to_payload())
    }

    /// # Errors
    ///
    /// Fails on a foreign id or an empty payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(CHARGE_REQUEST_ID, 1)?;
        Ok(Self::from_payload(data))
    }
}

/// One bit per fault kind, battery and power stage merged.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultFlags(pub u8);

impl FaultFlags {
    pub const BATTERY_KILLED: u8 = 1 << 0;
    pub const BATTERY_UNDERVOLT: u8 = 1 << 1;
    pub const BATTERY_OVERVOLT: u8 = 1 << 2;
    pub const BATTERY_CELL_OVERTEMP: u8 = 1 << 3;
    pub const BATTERY_COMMS_TIMEOUT: u8 = 1 << 4;
    pub const STAGE_OVERVOLT: u8 = 1 << 5;
    pub const STAGE_OVERTEMP: u8 = 1 << 6;
    pub const STAGE_COMMS_TIMEOUT: u8 = 1 << 7;

    #[must_use]
    pub const fn from_faults(battery: BatteryFault, stage: PowerStageFault) -> Self {
        let battery_bit = match battery {
            BatteryFault::None => 0,
            BatteryFault::Killed => Self::BATTERY_KILLED,
            BatteryFault::Undervolt => Self::BATTERY_UNDERVOLT,
            BatteryFault::Overvolt => Self::BATTERY_OVERVOLT,
            BatteryFault::CellOvertemp => Self::BATTERY_CELL_OVERTEMP,
            BatteryFault::CommsTimeout => Self::BATTERY_COMMS_TIMEOUT,
        };
        let stage_bit = match stage {
            PowerStageFault::None => 0,
            PowerStageFault::Overvolt => Self::STAGE_OVERVOLT,
            PowerStageFault::Overtemp => Self::STAGE_OVERTEMP,
            PowerStageFault::CommsTimeout => Self::STAGE_COMMS_TIMEOUT,
        };
        Self(battery_bit | stage_bit)
    }

    #[must_use]
    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Charger summary broadcast to the rest of the vehicle.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerState {
    pub faults: FaultFlags,
    pub plugged: bool,
    /// Total output current across all stages (A).
    pub charging_current: f32,
    /// Hottest stage temperature in m°C; saturates above 65.535 °C.
    pub max_temp: u16,
}

impl ChargerState {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(
        faults: FaultFlags,
        plugged: bool,
        charging_current: f32,
        max_temp_celsius: f32,
    ) -> Self {
        Self {
            faults,
            plugged,
            charging_current,
            max_temp: (max_temp_celsius * 1000.0) as u16,
        }
    }

    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        let mut data = [0; 8];
        data[0] = self.faults.0;
        data[1] = u8::from(self.plugged);
        write(&mut data, 2, &self.charging_current.to_le_bytes());
        write(&mut data, 6, &self.max_temp.to_le_bytes());
        data
    }

    #[must_use]
    pub fn from_payload(data: &[u8; 8]) -> Self {
        Self {
            faults: FaultFlags(data[0]),
            plugged: data[1] & 1 == 1,
            charging_current: read_f32(data, 2),
            max_temp: read_u16(data, 6),
        }
    }

    #[must_use]
    pub fn encode(&self) -> CanFrame {
        CanFrame::new(CHARGER_STATE_ID, self.to_payload())
    }

    /// # Errors
    ///
    /// Fails on a foreign id or a short payload.
    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        let data = frame.expect(CHARGER_STATE_ID, 8)?;
        Ok(Self::from_payload(data))
    }
}

fn flag_frame(id: CanId, flag: bool) -> CanFrame {
    let mut data = [0; 8];
    data[0] = u8::from(flag);
    CanFrame::new(id, data)
}

/// Receive-side slots for the vehicle bus, one per BMS broadcast.
#[derive(Default)]
pub struct CarBusSlots {
    min_max: TelemetrySlot<ModuleMinMax>,
    response: TelemetrySlot<ChargerResponse>,
    status: TelemetrySlot<BatteryStatus>,
    measurement: TelemetrySlot<PackMeasurement>,
    capacity: TelemetrySlot<PackCapacity>,
}

impl CarBusSlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(&mut self) -> (CarBusRouter<'_>, BmsInbox<'_>) {
        let (min_max_tx, min_max_rx) = self.min_max.split();
        let (response_tx, response_rx) = self.response.split();
        let (status_tx, status_rx) = self.status.split();
        let (measurement_tx, measurement_rx) = self.measurement.split();
        let (capacity_tx, capacity_rx) = self.capacity.split();
        (
            CarBusRouter {
                min_max: min_max_tx,
                response: response_tx,
                status: status_tx,
                measurement: measurement_tx,
                capacity: capacity_tx,
            },
            BmsInbox {
                min_max: min_max_rx,
                response: response_rx,
                status: status_rx,
                measurement: measurement_rx,
                capacity: capacity_rx,
            },
        )
    }
}

/// Receive path for the vehicle bus.
pub struct CarBusRouter<'a> {
    min_max: SlotWriter<'a, ModuleMinMax>,
    response: SlotWriter<'a, ChargerResponse>,
    status: SlotWriter<'a, BatteryStatus>,
    measurement: SlotWriter<'a, PackMeasurement>,
    capacity: SlotWriter<'a, PackCapacity>,
}

impl CarBusRouter<'_> {
    /// Decodes `frame` into its slot. Returns `false` for ids the charger
    /// does not consume or for malformed payloads.
    pub fn dispatch(&mut self, frame: &CanFrame) -> bool {
        let id = frame.id();
        let routed = if id == MODULE_MIN_MAX_ID {
            ModuleMinMax::decode(frame).map(|msg| self.min_max.push(msg))
        } else if id == CHARGER_RESPONSE_ID {
            ChargerResponse::decode(frame).map(|msg| self.response.push(msg))
        } else if id == BATTERY_STATUS_ID {
            BatteryStatus::decode(frame).map(|msg| self.status.push(msg))
        } else if id == MEASUREMENT_ID {
            PackMeasurement::decode(frame).map(|msg| self.measurement.push(msg))
        } else if id == CAPACITY_ID {
            PackCapacity::decode(frame).map(|msg| self.capacity.push(msg))
        } else {
            return false;
        };
        routed.is_ok()
    }
}

/// Consumer ends of the vehicle bus slots, drained by the battery adapter.
pub struct BmsInbox<'a> {
    pub min_max: SlotReader<'a, ModuleMinMax>,
    pub response: SlotReader<'a, ChargerResponse>,
    pub status: SlotReader<'a, BatteryStatus>,
    pub measurement: SlotReader<'a, PackMeasurement>,
    pub capacity: SlotReader<'a, PackCapacity>,
}
