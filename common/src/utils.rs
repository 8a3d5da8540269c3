//! Common Utilities
//!
//! Power unit conversions and slot timing helpers used across the simulator

/// Number of subcarriers in one resource block
pub const SUBCARRIERS_PER_RB: u32 = 12;

/// Convert dBm to Watts
pub fn dbm_to_watts(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) / 1000.0
}

/// Convert Watts to dBm
pub fn watts_to_dbm(watts: f64) -> f64 {
    10.0 * (watts * 1000.0).log10()
}

/// Convert a ratio in dB to linear scale
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Convert a linear ratio to dB
pub fn linear_to_db(linear: f64) -> f64 {
    10.0 * linear.log10()
}

/// Time utilities for slot/frame calculations
pub mod time {
    use crate::sim::SimTime;

    /// Slot duration for numerology `mu` (1 ms / 2^mu)
    pub fn slot_period(numerology: u8) -> SimTime {
        SimTime::from_nanos(1_000_000 >> numerology)
    }

    /// OFDM symbol duration, slot period divided evenly over the symbols
    pub fn symbol_period(numerology: u8, symbols_per_slot: u8) -> SimTime {
        SimTime::from_nanos(slot_period(numerology).as_nanos() / symbols_per_slot as u64)
    }
}
