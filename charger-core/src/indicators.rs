//! Status light collaborator.

/// Front panel lights driven by the charge logic.
pub trait StatusIndicators {
    /// Latches the fault light on.
    fn indicate_fault(&mut self);

    fn indicate_proximity(&mut self, connected: bool);

    /// AC contactor light: on while AC is delivered to the stages.
    fn indicate_ac(&mut self, connected: bool);
}

/// Indicator sink for targets without lights.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopIndicators;

impl StatusIndicators for NoopIndicators {
    fn indicate_fault(&mut self) {}

    fn indicate_proximity(&mut self, _connected: bool) {}

    fn indicate_ac(&mut self, _connected: bool) {}
}
