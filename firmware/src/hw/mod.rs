//! GPIO collaborators for the charge logic.
//!
//! Pin map:
//!
//! | Signal | Pin | Notes |
//! |---|---|---|
//! | Proximity sense | PA6 | input, high while the connector is seated |
//! | AC control | PA4 | push-pull, high energises the contactor |
//! | Pilot capture | PA8 | TIM1 CH1 |
//! | Proximity light | PA1 | open-drain, active low |
//! | Contactor light | PA2 | active low |
//! | Fault light | PC6 | active low |
//! | Car bus activity | PB14 | toggled per car broadcast |
//! | Stage bus activity | PB15 | toggled per stage broadcast |

use charger_core::indicators::StatusIndicators;
use charger_core::pilot::ChargePort;
use embassy_stm32::gpio::{Input, Level, Output, OutputOpenDrain};

/// Connector proximity input and AC contactor output.
pub struct ConnectorPort<'d> {
    proximity: Input<'d>,
    ac_control: Output<'d>,
}

impl<'d> ConnectorPort<'d> {
    pub fn new(proximity: Input<'d>, ac_control: Output<'d>) -> Self {
        Self {
            proximity,
            ac_control,
        }
    }
}

impl ChargePort for ConnectorPort<'_> {
    fn is_present(&self) -> bool {
        self.proximity.is_high()
    }

    fn output_ac(&mut self) {
        self.ac_control.set_high();
    }

    fn isolate(&mut self) {
        self.ac_control.set_low();
    }
}

/// Front panel status lights.
pub struct PanelLights<'d> {
    proximity: OutputOpenDrain<'d>,
    contactor: Output<'d>,
    fault: Output<'d>,
}

impl<'d> PanelLights<'d> {
    pub fn new(proximity: OutputOpenDrain<'d>, contactor: Output<'d>, fault: Output<'d>) -> Self {
        Self {
            proximity,
            contactor,
            fault,
        }
    }
}

// All three lights sink current: a low pin lights the LED.
fn lit(on: bool) -> Level {
    if on { Level::Low } else { Level::High }
}

impl StatusIndicators for PanelLights<'_> {
    fn indicate_fault(&mut self) {
        self.fault.set_level(lit(true));
    }

    fn indicate_proximity(&mut self, connected: bool) {
        self.proximity.set_level(lit(connected));
    }

    fn indicate_ac(&mut self, connected: bool) {
        self.contactor.set_level(lit(connected));
    }
}
