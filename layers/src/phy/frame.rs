//! Over-the-air Frames
//!
//! Packets, packet tags, sidelink control information headers, control
//! messages and the signal frames a spectrum PHY hands to the channel.

use super::spectrum_value::SpectrumValue;
use super::PhyAddr;
use crate::mac::{DciInfo, DlCqiInfo, DlHarqInfo};
use bytes::Bytes;
use common::sim::SimTime;
use common::types::{BwpId, CellId, Rnti, SfnSf};
use std::sync::Arc;

// ============================================================================
// Packet tags
// ============================================================================

/// Identifies the UE and logical channel a MAC PDU belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioBearerTag {
    pub rnti: Rnti,
    pub lcid: u8,
    pub layer: u8,
}

/// Sidelink MAC PDU metadata carried by PSCCH and PSSCH packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlMacPduTag {
    /// Transmitting UE
    pub rnti: Rnti,
    pub sfn: SfnSf,
    /// First PSSCH symbol
    pub sym_start: u8,
    /// PSSCH symbols
    pub num_sym: u8,
    pub tb_size: u32,
    pub dst_l2_id: u32,
}

// ============================================================================
// Sidelink control information
// ============================================================================

/// SCI format 1-A, sent on the PSCCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SciF1aHeader {
    pub priority: u8,
    pub mcs: u8,
    /// Resource reservation period in ms
    pub sl_resource_reserve_period: u16,
    pub total_sub_channels: u16,
    pub index_start_sub_channel: u8,
    pub length_sub_channel: u8,
    pub sl_max_num_per_reserve: u8,
    /// Slots to the first retransmission, [`SciF1aHeader::NO_RETX`] if none
    pub gap_retx1: u8,
    pub index_start_sb_ch_retx1: u8,
    pub gap_retx2: u8,
    pub index_start_sb_ch_retx2: u8,
}

impl SciF1aHeader {
    pub const NO_RETX: u8 = u8::MAX;

    /// priority, mcs, period (2), total (2), start, length, max num,
    /// then gap and start subchannel of both retransmissions
    pub const SERIALIZED_SIZE: u32 = 13;
}

/// SCI format 2-A, first packet of every PSSCH burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SciF2aHeader {
    pub harq_id: u8,
    /// New data indicator, 1 for the first transmission of a TB
    pub ndi: u8,
    pub rv: u8,
    pub src_id: u32,
    pub dst_id: u32,
}

impl SciF2aHeader {
    pub const SERIALIZED_SIZE: u32 = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    None,
    SciF1a(SciF1aHeader),
    SciF2a(SciF2aHeader),
}

impl PacketHeader {
    pub fn serialized_size(&self) -> u32 {
        match self {
            PacketHeader::None => 0,
            PacketHeader::SciF1a(_) => SciF1aHeader::SERIALIZED_SIZE,
            PacketHeader::SciF2a(_) => SciF2aHeader::SERIALIZED_SIZE,
        }
    }
}

// ============================================================================
// Packets
// ============================================================================

/// MAC PDU as seen by the PHY: opaque payload plus tags
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub payload: Bytes,
    pub header: PacketHeader,
    pub bearer: Option<RadioBearerTag>,
    pub sl_tag: Option<SlMacPduTag>,
}

impl Packet {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            header: PacketHeader::None,
            bearer: None,
            sl_tag: None,
        }
    }

    pub fn with_bearer(mut self, bearer: RadioBearerTag) -> Self {
        self.bearer = Some(bearer);
        self
    }

    pub fn with_header(mut self, header: PacketHeader) -> Self {
        self.header = header;
        self
    }

    pub fn with_sl_tag(mut self, tag: SlMacPduTag) -> Self {
        self.sl_tag = Some(tag);
        self
    }

    /// Size in bytes, header included
    pub fn size(&self) -> u32 {
        self.payload.len() as u32 + self.header.serialized_size()
    }

    pub fn sci_f1a(&self) -> Option<&SciF1aHeader> {
        match &self.header {
            PacketHeader::SciF1a(h) => Some(h),
            _ => None,
        }
    }

    pub fn sci_f2a(&self) -> Option<&SciF2aHeader> {
        match &self.header {
            PacketHeader::SciF2a(h) => Some(h),
            _ => None,
        }
    }
}

pub type PacketBurst = Vec<Packet>;

/// Total size of a burst in bytes
pub fn burst_size(burst: &[Packet]) -> u32 {
    burst.iter().map(Packet::size).sum()
}

// ============================================================================
// Control messages
// ============================================================================

/// L1/L2 control messages exchanged on the control channels
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// DL grant, data `k0` slots and HARQ feedback `k1` slots after reception
    DlDci { dci: Arc<DciInfo>, k0: u32, k1: u32 },
    /// UL grant, data `k2` slots after reception
    UlDci { dci: Arc<DciInfo>, k2: u32 },
    DlCqi(DlCqiInfo),
    DlHarq(DlHarqInfo),
    /// Sounding reference signal
    Srs { rnti: Rnti },
    /// Buffer status report
    Bsr { rnti: Rnti, buffer_bytes: u32 },
    Mib { system_frame_number: u32, num_rbs: u16 },
    Sib1 { cell_id: CellId },
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::DlDci { .. } => "DL_DCI",
            ControlMessage::UlDci { .. } => "UL_DCI",
            ControlMessage::DlCqi(_) => "DL_CQI",
            ControlMessage::DlHarq(_) => "DL_HARQ",
            ControlMessage::Srs { .. } => "SRS",
            ControlMessage::Bsr { .. } => "BSR",
            ControlMessage::Mib { .. } => "MIB",
            ControlMessage::Sib1 { .. } => "SIB1",
        }
    }

    pub fn is_srs(&self) -> bool {
        matches!(self, ControlMessage::Srs { .. })
    }
}

/// True when the list carries exactly one SRS message
pub fn is_only_srs(msgs: &[ControlMessage]) -> bool {
    assert!(!msgs.is_empty(), "Passed an empty uplink control list");
    msgs.len() == 1 && msgs[0].is_srs()
}

// ============================================================================
// Signal frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    DlCtrl,
    UlCtrl,
    SlCtrl,
    SlData,
}

impl FrameKind {
    pub fn is_sidelink(&self) -> bool {
        matches!(self, FrameKind::SlCtrl | FrameKind::SlData)
    }
}

/// One transmission on the channel. Shared immutably by every receiver.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub kind: FrameKind,
    pub source: PhyAddr,
    pub cell_id: CellId,
    pub bwp_id: BwpId,
    pub duration: SimTime,
    /// Transmitted PSD
    pub psd: SpectrumValue,
    pub packets: Option<PacketBurst>,
    pub ctrl_msgs: Vec<ControlMessage>,
}

impl SignalFrame {
    pub fn source_stream(&self) -> u8 {
        self.source.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{DciFormat, VarTtiType};

    #[test]
    fn test_packet_size_includes_header() {
        let sci2 = SciF2aHeader { harq_id: 1, ndi: 1, rv: 0, src_id: 3, dst_id: 7 };
        let packet = Packet::new(Bytes::new()).with_header(PacketHeader::SciF2a(sci2));
        assert_eq!(packet.size(), 5);
        assert_eq!(packet.sci_f2a(), Some(&sci2));
        assert!(packet.sci_f1a().is_none());

        let data = Packet::new(Bytes::from(vec![0u8; 100])).with_bearer(RadioBearerTag {
            rnti: Rnti(1),
            lcid: 3,
            layer: 0,
        });
        assert_eq!(burst_size(&[packet, data]), 105);
    }

    #[test]
    fn test_only_srs() {
        let srs = ControlMessage::Srs { rnti: Rnti(4) };
        assert!(is_only_srs(&[srs.clone()]));
        let bsr = ControlMessage::Bsr { rnti: Rnti(4), buffer_bytes: 10 };
        assert!(!is_only_srs(&[srs, bsr.clone()]));
        assert!(!is_only_srs(&[bsr]));
    }

    #[test]
    #[should_panic(expected = "empty uplink control list")]
    fn test_only_srs_rejects_empty() {
        is_only_srs(&[]);
    }

    #[test]
    fn test_message_names() {
        let dci = Arc::new(DciInfo::ctrl(0, 1, DciFormat::Dl, VarTtiType::Ctrl, vec![true]));
        assert_eq!(ControlMessage::DlDci { dci: dci.clone(), k0: 0, k1: 2 }.name(), "DL_DCI");
        assert_eq!(ControlMessage::UlDci { dci, k2: 2 }.name(), "UL_DCI");
        assert_eq!(ControlMessage::Sib1 { cell_id: CellId(1) }.name(), "SIB1");
    }
}
