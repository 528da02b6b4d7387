#![no_std]

// Control core for the EV charger controller.
//
// The crate stays portable across the MCU firmware and the host emulator by
// avoiding the Rust standard library. Hardware collaborators (CAN drivers,
// GPIO, clocks) are reached through the traits exposed here so every piece of
// charge logic can be exercised on the host with fakes.

pub mod bms;
pub mod can;
pub mod charger;
pub mod config;
pub mod console;
pub mod indicators;
pub mod pilot;
pub mod power_stage;
pub mod protocol;
pub mod telemetry;
pub mod time;
pub mod transport;
