//! Bench console shared by the host emulator and its tests.
//!
//! [`grammar`] turns a line into a [`grammar::Command`]; the catalog below
//! backs `help`.

pub mod grammar;

pub use grammar::{BmsCommand, Command, HelpCommand, ParseError, PilotCommand, StageCommand, parse};

/// One entry of the console help catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHelp {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
}

pub const CATALOG: &[CommandHelp] = &[
    CommandHelp {
        name: "plug",
        usage: "plug in|out",
        summary: "seat or remove the connector",
    },
    CommandHelp {
        name: "pilot",
        usage: "pilot duty=<0-100> freq=<hz>",
        summary: "set the control pilot duty cycle (percent) and frequency",
    },
    CommandHelp {
        name: "bms",
        usage: "bms ready on|off | kill on|off | pack volts=<v> amps=<a> | cells mv=<mv> temp=<c> | capacity wh=<wh> | silent | resume",
        summary: "drive the simulated battery",
    },
    CommandHelp {
        name: "stage",
        usage: "stage online|offline | temp=<c>",
        summary: "drive the simulated power stages",
    },
    CommandHelp {
        name: "step",
        usage: "step [<n>]",
        summary: "run poll iterations without advancing time",
    },
    CommandHelp {
        name: "advance",
        usage: "advance <n>ms|<n>s",
        summary: "advance simulated time, polling every 10 ms",
    },
    CommandHelp {
        name: "status",
        usage: "status",
        summary: "show charger state, faults, and telemetry",
    },
    CommandHelp {
        name: "history",
        usage: "history",
        summary: "show recorded charge events",
    },
    CommandHelp {
        name: "help",
        usage: "help [<command>]",
        summary: "list commands or describe one",
    },
];

/// Catalog entry for `topic`, matched case-insensitively.
#[must_use]
pub fn lookup(topic: &str) -> Option<&'static CommandHelp> {
    CATALOG
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(topic))
}
