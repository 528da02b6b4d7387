//! Wire codecs for the two charger buses.
//!
//! `car` covers the vehicle bus shared with the battery management system;
//! `stage` covers the dedicated bus to the power stage modules. Each module
//! also provides the receive-path router that decodes frames into their
//! telemetry slots.

pub mod car;
pub mod stage;

fn read_u16(data: &[u8; 8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_i16(data: &[u8; 8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

fn read_f32(data: &[u8; 8], at: usize) -> f32 {
    f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn write(data: &mut [u8; 8], at: usize, bytes: &[u8]) {
    data[at..at + bytes.len()].copy_from_slice(bytes);
}
