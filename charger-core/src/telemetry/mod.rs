//! Charge event history shared by firmware and host targets.
//!
//! The core never logs directly. It records what happened into a bounded ring
//! with monotonically increasing ids; the firmware drains new records into
//! `defmt`, and the emulator prints them and appends them to its transcript.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::bms::BatteryFault;
use crate::charger::ChargeState;
use crate::power_stage::PowerStageFault;

/// Default number of records retained.
pub const EVENT_LOG_CAPACITY: usize = 32;

/// Identifier assigned to each record, increasing by one per record.
pub type EventId = u32;

/// Something the charge logic did or observed.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeEvent {
    StateChanged { from: ChargeState, to: ChargeState },
    BatteryFault(BatteryFault),
    PowerStageFault(PowerStageFault),
    /// The stage was disabled and the AC output opened.
    IsolationComplete { waited_ms: u32, timed_out: bool },
}

impl fmt::Display for ChargeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargeEvent::StateChanged { from, to } => write!(f, "state {from} -> {to}"),
            ChargeEvent::BatteryFault(fault) => write!(f, "battery-fault {fault}"),
            ChargeEvent::PowerStageFault(fault) => write!(f, "stage-fault {fault}"),
            ChargeEvent::IsolationComplete {
                waited_ms,
                timed_out,
            } => {
                write!(f, "isolated after {waited_ms}ms")?;
                if *timed_out {
                    f.write_str(" (timed out)")?;
                }
                Ok(())
            }
        }
    }
}

/// Record stored in the ring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EventRecord<I> {
    pub id: EventId,
    pub timestamp: I,
    pub event: ChargeEvent,
}

/// Bounded event ring; the oldest records are overwritten first.
pub struct EventLog<I, const CAPACITY: usize = EVENT_LOG_CAPACITY> {
    ring: HistoryBuf<EventRecord<I>, CAPACITY>,
    next_id: EventId,
}

impl<I, const CAPACITY: usize> EventLog<I, CAPACITY>
where
    I: Copy,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_id: 0,
        }
    }

    pub fn record(&mut self, event: ChargeEvent, timestamp: I) -> EventId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.ring.write(EventRecord {
            id,
            timestamp,
            event,
        });
        id
    }

    /// Records in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, EventRecord<I>> {
        self.ring.oldest_ordered()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&EventRecord<I>> {
        self.ring.recent()
    }

    /// Records newer than `seen`, oldest first. `None` yields everything retained.
    ///
    /// Ids wrap, so "newer" means within one ring's worth of ids after `seen`.
    pub fn drain_since(&self, seen: Option<EventId>) -> impl Iterator<Item = &EventRecord<I>> {
        let window = EventId::try_from(CAPACITY).unwrap_or(EventId::MAX);
        self.ring.oldest_ordered().filter(move |record| {
            seen.is_none_or(|seen| record.id.wrapping_sub(seen).wrapping_sub(1) < window)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<I, const CAPACITY: usize> Default for EventLog<I, CAPACITY>
where
    I: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}
