//! Common Utilities and Types Library
//!
//! This crate provides shared types, simulated time and the event queue used
//! across the NR PHY simulator.

pub mod sim;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use sim::*;
pub use types::*;
pub use utils::*;
