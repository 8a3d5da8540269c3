//! NR PHY Simulation Layers Library
//!
//! This crate implements the spectrum-level physical layer of a 5G NR base
//! station and terminal (cellular uplink/downlink and sidelink), the slot
//! timing engine that drives it, and the MAC stand-ins and simulation driver
//! used to exercise it.

pub mod mac;
pub mod phy;
pub mod simulation;

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid TDD pattern: {0}")]
    InvalidPattern(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}
