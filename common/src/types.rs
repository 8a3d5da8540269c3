//! Common Types for the NR PHY Simulator
//!
//! Defines fundamental types used throughout the protocol stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// RNTI used for broadcast and not-yet-attached messages
    pub const BROADCAST: Rnti = Rnti(0);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Bandwidth part identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BwpId(pub u16);

/// Simulated device (node) identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Subcarrier spacing for numerology `mu` (15 kHz * 2^mu)
    pub fn from_numerology(mu: u8) -> Option<Self> {
        match mu {
            0 => Some(Self::Scs15),
            1 => Some(Self::Scs30),
            2 => Some(Self::Scs60),
            3 => Some(Self::Scs120),
            4 => Some(Self::Scs240),
            _ => None,
        }
    }

    /// Numerology index
    pub fn numerology(&self) -> u8 {
        match self {
            Self::Scs15 => 0,
            Self::Scs30 => 1,
            Self::Scs60 => 2,
            Self::Scs120 => 3,
            Self::Scs240 => 4,
        }
    }

    pub fn as_hz(&self) -> u32 {
        *self as u32 * 1000
    }
}

/// Slot type of a TDD/FDD pattern position.
///
/// The discriminants order the types from "most downlink" to "most uplink";
/// comparisons such as `slot < TddSlotType::F` rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum TddSlotType {
    /// Downlink only
    Dl = 0,
    /// Special slot: downlink control and data, uplink control
    S = 1,
    /// Flexible: can host either direction
    F = 2,
    /// Uplink only
    Ul = 3,
}

impl fmt::Display for TddSlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dl => "DL",
            Self::S => "S",
            Self::F => "F",
            Self::Ul => "UL",
        };
        f.write_str(s)
    }
}

/// Frame / subframe / slot identifier for a given numerology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SfnSf {
    /// System frame number
    pub frame: u32,
    /// Subframe within the frame (0..10)
    pub subframe: u8,
    /// Slot within the subframe (0..2^numerology)
    pub slot: u16,
    /// Numerology the slot index refers to
    pub numerology: u8,
}

impl SfnSf {
    pub const SUBFRAMES_PER_FRAME: u32 = 10;

    pub fn new(frame: u32, subframe: u8, slot: u16, numerology: u8) -> Self {
        Self { frame, subframe, slot, numerology }
    }

    /// Number of slots in one subframe
    pub fn slots_per_subframe(&self) -> u32 {
        1u32 << self.numerology
    }

    /// Number of slots in one frame
    pub fn slots_per_frame(&self) -> u32 {
        self.slots_per_subframe() * Self::SUBFRAMES_PER_FRAME
    }

    /// Absolute slot count since frame 0
    pub fn normalize(&self) -> u64 {
        let spsf = self.slots_per_subframe() as u64;
        (self.frame as u64 * Self::SUBFRAMES_PER_FRAME as u64 + self.subframe as u64) * spsf
            + self.slot as u64
    }

    /// Build from an absolute slot count
    pub fn from_normalized(slots: u64, numerology: u8) -> Self {
        let spsf = 1u64 << numerology;
        let slot = (slots % spsf) as u16;
        let subframes = slots / spsf;
        let subframe = (subframes % Self::SUBFRAMES_PER_FRAME as u64) as u8;
        let frame = (subframes / Self::SUBFRAMES_PER_FRAME as u64) as u32;
        Self { frame, subframe, slot, numerology }
    }

    /// Advance by `slots` slots
    pub fn add(&mut self, slots: u32) {
        *self = self.future(slots);
    }

    /// The slot `slots` slots after this one
    pub fn future(&self, slots: u32) -> SfnSf {
        Self::from_normalized(self.normalize() + slots as u64, self.numerology)
    }

    /// Position of this slot in a repeating pattern of `pattern_len` slots
    pub fn pattern_position(&self, pattern_len: usize) -> usize {
        (self.normalize() % pattern_len as u64) as usize
    }
}

impl fmt::Display for SfnSf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}/{}]", self.frame, self.subframe, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rnti() {
        let rnti = Rnti::new(0x4601);
        assert_eq!(rnti.value(), 0x4601);
        assert_ne!(rnti, Rnti::BROADCAST);
    }

    #[test]
    fn test_numerology() {
        assert_eq!(SubcarrierSpacing::from_numerology(1), Some(SubcarrierSpacing::Scs30));
        assert_eq!(SubcarrierSpacing::Scs120.numerology(), 3);
        assert_eq!(SubcarrierSpacing::Scs60.as_hz(), 60_000);
        assert!(SubcarrierSpacing::from_numerology(5).is_none());
    }

    #[test]
    fn test_slot_type_order() {
        assert!(TddSlotType::Dl < TddSlotType::S);
        assert!(TddSlotType::S < TddSlotType::F);
        assert!(TddSlotType::F < TddSlotType::Ul);
    }

    #[test]
    fn test_sfnsf_wraps_subframe_and_frame() {
        let mut sfn = SfnSf::new(0, 9, 1, 1);
        sfn.add(1);
        assert_eq!(sfn, SfnSf::new(1, 0, 0, 1));

        let far = SfnSf::new(2, 3, 0, 0).future(17);
        assert_eq!(far, SfnSf::new(4, 0, 0, 0));
        assert_eq!(far.normalize(), 40);
    }

    #[test]
    fn test_pattern_position() {
        let sfn = SfnSf::new(1, 2, 0, 0);
        assert_eq!(sfn.normalize(), 12);
        assert_eq!(sfn.pattern_position(10), 2);
        assert_eq!(sfn.pattern_position(5), 2);
    }
}
