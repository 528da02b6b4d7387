#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Mirrors the charger's event history to the log.
//!
//! The poll loop calls [`EventDrain::drain`] after every iteration; records
//! are emitted through `defmt` on target and stdout on the host.

use charger_core::telemetry::{EventId, EventLog, EventRecord};

use crate::board::BoardInstant;

/// Tracks the last record already logged.
#[derive(Debug, Default)]
pub struct EventDrain {
    seen: Option<EventId>,
}

impl EventDrain {
    #[must_use]
    pub const fn new() -> Self {
        Self { seen: None }
    }

    /// Logs every record newer than the last drain. Returns how many were logged.
    pub fn drain(&mut self, log: &EventLog<BoardInstant>) -> usize {
        let mut logged = 0;
        for record in log.drain_since(self.seen) {
            let expected = self.seen.map_or(0, |seen| seen.wrapping_add(1));
            if record.id != expected {
                emit_gap(record.id.wrapping_sub(expected));
            }
            emit_record(record);
            self.seen = Some(record.id);
            logged += 1;
        }
        logged
    }
}

#[cfg(target_os = "none")]
fn emit_record(record: &EventRecord<BoardInstant>) {
    defmt::info!(
        "charger: #{} t={}ms {}",
        record.id,
        record.timestamp.as_millis(),
        record.event
    );
}

#[cfg(not(target_os = "none"))]
fn emit_record(record: &EventRecord<BoardInstant>) {
    println!(
        "charger: #{} t={}ms {}",
        record.id,
        record.timestamp.as_millis(),
        record.event
    );
}

#[cfg(target_os = "none")]
fn emit_gap(missed: u32) {
    defmt::warn!("charger: {} events overwritten before logging", missed);
}

#[cfg(not(target_os = "none"))]
fn emit_gap(missed: u32) {
    println!("charger: {missed} events overwritten before logging");
}
