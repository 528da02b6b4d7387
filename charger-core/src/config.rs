//! Compile-time charge limits and timing parameters.
//!
//! Every threshold the charge logic compares against lives here. Values are
//! fixed at build time; the structs are `const`-constructible so the firmware
//! can place them in statics, and tests can tweak single fields.

use core::time::Duration;

/// Number of series cells in the pack.
pub const SERIES_CELLS: u16 = 96;
/// Maximum rated cell voltage.
pub const MAX_CELL_VOLTAGE: f32 = 4.2;

/// Battery pack thresholds.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatteryLimits {
    pub series_cells: u16,
    /// Rated maximum per-cell voltage (V). Default for an unreported cell maximum.
    pub max_cell_voltage: f32,
    /// Cells must read strictly below this (V) before charging is attempted.
    pub cell_charge_target: f32,
    /// Pack voltage at or below this (V) latches an undervoltage fault.
    pub pack_voltage_min: f32,
    /// Pack voltage at or above this (V) raises an overvoltage fault.
    pub pack_voltage_max: f32,
    /// Voltage limit requested from the power stage while charging (V).
    pub pack_charge_target: f32,
    /// Pack current (A) at or below which charging is considered done.
    pub charge_done_current: f32,
    /// Cell temperature limit (°C).
    pub cell_temp_limit: f32,
    /// Allowed gap (V) between the charge target and the pack voltage when done.
    pub full_voltage_tolerance: f32,
}

impl BatteryLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            series_cells: SERIES_CELLS,
            max_cell_voltage: MAX_CELL_VOLTAGE,
            cell_charge_target: 4.15,
            pack_voltage_min: 240.0,
            pack_voltage_max: 403.2,
            pack_charge_target: 398.4,
            charge_done_current: 0.5,
            cell_temp_limit: 45.0,
            full_voltage_tolerance: 2.0,
        }
    }
}

impl Default for BatteryLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Power stage ratings.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PowerStageLimits {
    /// Output voltage at or above this (V) is an overvoltage.
    pub output_voltage_max: f32,
    /// Module temperature at or above this (°C) is an overtemperature.
    pub temperature_max: f32,
    /// AC to DC conversion efficiency of one module.
    pub efficiency: f32,
    /// Number of modules sharing the load.
    pub stage_count: u8,
    /// Nominal AC line voltage for level 1 supplies.
    pub ac_voltage_low: f32,
    /// Nominal AC line voltage for level 2 supplies.
    pub ac_voltage_high: f32,
    /// Advertised AC current above which the supply is assumed to be level 2.
    pub ac_changeover_current: f32,
}

impl PowerStageLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            output_voltage_max: MAX_CELL_VOLTAGE * SERIES_CELLS as f32,
            temperature_max: 54.0,
            efficiency: 0.95,
            stage_count: 2,
            ac_voltage_low: 110.0,
            ac_voltage_high: 240.0,
            ac_changeover_current: 17.3,
        }
    }
}

impl Default for PowerStageLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Operator supplied current and energy caps.
///
/// Not wired in yet; nothing reads it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OperatorOverride {
    pub max_current: f32,
    pub max_capacity_kwh: f32,
}

/// Top-level charger configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChargerConfig {
    pub battery: BatteryLimits,
    pub stage: PowerStageLimits,
    /// Hard ceiling applied to the connector-advertised AC current (A).
    pub ac_current_ceiling: f32,
    /// Provisional DC current ceiling (A) until the battery reports its own limit.
    pub dc_current_ceiling: f32,
    /// No charge is requested once the pack holds this much energy (kWh).
    pub energy_cap_kwh: f32,
    /// Upper bound on the wait for output current to decay before isolating.
    pub isolation_wait: Duration,
    /// Output current (A) considered safe to open the AC contactor under.
    pub isolation_current_threshold: f32,
    pub battery_timeout: Duration,
    pub stage_timeout: Duration,
    pub operator_override: Option<OperatorOverride>,
}

impl ChargerConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            battery: BatteryLimits::new(),
            stage: PowerStageLimits::new(),
            ac_current_ceiling: 30.0,
            dc_current_ceiling: 30.0,
            energy_cap_kwh: 20.15,
            isolation_wait: Duration::from_millis(500),
            isolation_current_threshold: 0.01,
            battery_timeout: Duration::from_millis(2500),
            stage_timeout: Duration::from_millis(2000),
            operator_override: None,
        }
    }
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self::new()
    }
}
