//! Medium Access Control (MAC) Interface
//!
//! Scheduling types exchanged between the MAC and the PHY (DCIs, var-TTI
//! and slot allocations, HARQ/CQI reports, sidelink allocations) and the
//! service access points each side implements.

pub mod scheduler;

use crate::phy::frame::{ControlMessage, Packet, PacketBurst};
use common::sim::SimTime;
use common::types::{BwpId, CellId, Rnti, SfnSf, TddSlotType};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

pub use scheduler::{GnbMac, GnbMacConfig, MacStats, SlTrafficConfig, UeMac, UeMacConfig, UeMacStats};

/// Direction of a DCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DciFormat {
    Dl,
    Ul,
}

/// What a var-TTI carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarTtiType {
    /// Sounding reference signal
    Srs,
    Data,
    Ctrl,
}

impl fmt::Display for VarTtiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarTtiType::Srs => "SRS",
            VarTtiType::Data => "DATA",
            VarTtiType::Ctrl => "CTRL",
        };
        f.write_str(s)
    }
}

/// TDMA downlink/uplink control information
///
/// Per-stream vectors (`mcs`, `tb_size`, `ndi`, `rv`) have one entry per
/// stream; a stream with `tb_size == 0` is not scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct DciInfo {
    pub rnti: Rnti,
    pub format: DciFormat,
    pub sym_start: u8,
    pub num_sym: u8,
    pub mcs: Vec<u8>,
    pub tb_size: Vec<u32>,
    pub ndi: Vec<u8>,
    pub rv: Vec<u8>,
    pub var_tti_type: VarTtiType,
    pub bwp_index: BwpId,
    pub harq_process: u8,
    /// One entry per RBG, `true` when the RBG is assigned
    pub rbg_bitmask: Vec<bool>,
    /// Transmit power control command
    pub tpc: u8,
}

impl DciInfo {
    /// DCI of a control (or SRS) var-TTI, addressed to every device
    pub fn ctrl(sym_start: u8, num_sym: u8, format: DciFormat, var_tti_type: VarTtiType, rbg_bitmask: Vec<bool>) -> Self {
        Self {
            rnti: Rnti::BROADCAST,
            format,
            sym_start,
            num_sym,
            mcs: Vec::new(),
            tb_size: Vec::new(),
            ndi: Vec::new(),
            rv: Vec::new(),
            var_tti_type,
            bwp_index: BwpId(0),
            harq_process: 0,
            rbg_bitmask,
            tpc: 1,
        }
    }

    /// Number of streams carrying a TB
    pub fn active_streams(&self) -> u8 {
        self.tb_size.iter().filter(|&&tbs| tbs > 0).count() as u8
    }

    /// Number of assigned RBGs
    pub fn assigned_rbgs(&self) -> usize {
        self.rbg_bitmask.iter().filter(|&&b| b).count()
    }
}

impl fmt::Display for DciInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.format {
            DciFormat::Dl => "DL",
            DciFormat::Ul => "UL",
        };
        write!(
            f,
            "[{} {} rnti={} sym {}..{} harq={}]",
            dir,
            self.var_tti_type,
            self.rnti,
            self.sym_start,
            self.sym_start + self.num_sym,
            self.harq_process
        )
    }
}

/// One var-TTI of a slot
#[derive(Debug, Clone, PartialEq)]
pub struct VarTtiAllocInfo {
    pub dci: Arc<DciInfo>,
    pub is_omni: bool,
}

impl VarTtiAllocInfo {
    pub fn new(dci: Arc<DciInfo>) -> Self {
        Self { dci, is_omni: false }
    }
}

/// Directions present in a slot allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    None,
    Dl,
    Ul,
    Both,
}

/// Everything scheduled in one slot, var-TTIs ordered by starting symbol
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAllocInfo {
    pub sfn: SfnSf,
    /// Symbols in use (a symbol shared by OFDMA allocations counts once)
    pub num_sym_alloc: u32,
    pub var_tti_alloc_info: VecDeque<VarTtiAllocInfo>,
    pub alloc_type: AllocationType,
}

impl SlotAllocInfo {
    pub fn new(sfn: SfnSf) -> Self {
        Self {
            sfn,
            num_sym_alloc: 0,
            var_tti_alloc_info: VecDeque::new(),
            alloc_type: AllocationType::None,
        }
    }

    /// Merge the allocations of `other`, which targets the same slot
    pub fn merge(&mut self, other: &SlotAllocInfo) {
        assert!(
            self.alloc_type != AllocationType::None && other.alloc_type != AllocationType::None,
            "Cannot merge an allocation without a direction"
        );
        assert_eq!(self.sfn, other.sfn, "Merging allocations of different slots");

        if self.alloc_type != other.alloc_type {
            self.alloc_type = AllocationType::Both;
        }
        self.num_sym_alloc += other.num_sym_alloc;

        for alloc in other.var_tti_alloc_info.iter() {
            self.var_tti_alloc_info.push_front(alloc.clone());
        }
        self.sort();
    }

    /// Stable sort of the var-TTIs by starting symbol
    pub fn sort(&mut self) {
        self.var_tti_alloc_info
            .make_contiguous()
            .sort_by_key(|alloc| alloc.dci.sym_start);
    }

    pub fn contains_data_allocation(&self) -> bool {
        self.var_tti_alloc_info
            .iter()
            .any(|alloc| alloc.dci.var_tti_type == VarTtiType::Data)
    }

    pub fn contains_dl_ctrl_allocation(&self) -> bool {
        self.var_tti_alloc_info
            .iter()
            .any(|alloc| alloc.dci.var_tti_type == VarTtiType::Ctrl && alloc.dci.format == DciFormat::Dl)
    }

    /// UL control scheduled by the MAC (SRS)
    pub fn contains_ul_ctrl_allocation(&self) -> bool {
        self.var_tti_alloc_info
            .iter()
            .any(|alloc| alloc.dci.var_tti_type == VarTtiType::Srs)
    }
}

impl fmt::Display for SlotAllocInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {} symbols:", self.sfn, self.alloc_type, self.num_sym_alloc)?;
        for alloc in &self.var_tti_alloc_info {
            write!(f, " {}", alloc.dci)?;
        }
        Ok(())
    }
}

/// Per-stream DL HARQ outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqStatus {
    Ack,
    Nack,
    /// Stream not scheduled / no feedback yet
    None,
}

/// DL HARQ feedback of one process, aggregated over the streams
#[derive(Debug, Clone, PartialEq)]
pub struct DlHarqInfo {
    pub rnti: Rnti,
    pub harq_process_id: u8,
    pub bwp_index: BwpId,
    pub harq_status: Vec<HarqStatus>,
    pub num_retx: Vec<u8>,
}

impl DlHarqInfo {
    /// True unless at least one stream reported a NACK
    pub fn is_received_ok(&self) -> bool {
        !self.harq_status.iter().any(|status| *status == HarqStatus::Nack)
    }
}

/// UL reception outcome at the gNB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionStatus {
    Ok,
    NotOk,
    NotValid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UlHarqInfo {
    pub rnti: Rnti,
    pub harq_process_id: u8,
    pub reception_status: ReceptionStatus,
    pub tpc: u8,
    pub num_retx: u8,
}

impl UlHarqInfo {
    pub fn is_received_ok(&self) -> bool {
        self.reception_status == ReceptionStatus::Ok
    }
}

/// Wideband DL CQI report of a UE
#[derive(Debug, Clone, PartialEq)]
pub struct DlCqiInfo {
    pub rnti: Rnti,
    /// Rank indicator
    pub ri: u8,
    /// One wideband CQI per stream
    pub wb_cqi: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlCqiType {
    Pusch,
    Srs,
}

/// Per-RB UL SINR measured on a data var-TTI
#[derive(Debug, Clone, PartialEq)]
pub struct UlCqiInfo {
    pub sinr: Vec<f64>,
    pub kind: UlCqiType,
}

/// Sidelink channel of a var-TTI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlVarTtiType {
    Ctrl,
    Data,
}

/// One sidelink var-TTI of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlVarTtiAllocInfo {
    pub sym_start: u8,
    pub sym_length: u8,
    pub rb_start: u16,
    pub rb_length: u16,
    pub kind: SlVarTtiType,
}

impl SlVarTtiAllocInfo {
    pub fn rbs(&self) -> Vec<usize> {
        (self.rb_start as usize..(self.rb_start + self.rb_length) as usize).collect()
    }
}

/// Sensing information extracted from a received SCI stage 1
#[derive(Debug, Clone, PartialEq)]
pub struct SensingData {
    pub sfn: SfnSf,
    pub rsvp: u16,
    pub sb_ch_length: u8,
    pub sb_ch_start: u8,
    pub prio: u8,
    pub sl_rsrp: f64,
    pub gap_retx1: u8,
    pub sb_ch_start_retx1: u8,
    pub gap_retx2: u8,
    pub sb_ch_start_retx2: u8,
}

/// Services the PHY offers to its MAC
pub trait PhySapProvider {
    /// Queue a MAC PDU for transmission in `sfn` at `sym_start` on `stream`
    fn send_mac_pdu(&mut self, packet: Packet, sfn: SfnSf, sym_start: u8, stream: u8);

    /// Queue a control message for the control channel, L1/L2 latency slots
    /// from now
    fn send_control_message(&mut self, msg: ControlMessage);

    /// Hand over the allocation of a future slot
    fn set_slot_alloc_info(&mut self, alloc: SlotAllocInfo);

    fn slot_period(&self) -> SimTime;

    fn cell_id(&self) -> CellId;

    /// Bandwidth in RBs
    fn bw_in_rbs(&self) -> usize;

    fn num_rbg(&self) -> usize;

    fn send_pscch_mac_pdu(&mut self, packet: Packet);

    fn send_pssch_mac_pdu(&mut self, packet: Packet);

    /// Add a sidelink var-TTI to the allocation of the current slot
    fn set_sl_var_tti_alloc_info(&mut self, sfn: SfnSf, info: SlVarTtiAllocInfo);
}

/// gNB MAC as seen from the gNB PHY
pub trait GnbMacSapUser: fmt::Debug {
    /// A UE joined the cell
    fn add_ue(&mut self, _rnti: Rnti) {}

    fn remove_ue(&mut self, _rnti: Rnti) {}

    fn set_current_sfn(&mut self, sfn: SfnSf);

    /// Generate the DL allocation of `sfn`
    fn slot_dl_indication(&mut self, sfn: SfnSf, slot_type: TddSlotType, phy: &mut dyn PhySapProvider);

    /// Generate the UL allocation of `sfn`
    fn slot_ul_indication(&mut self, sfn: SfnSf, slot_type: TddSlotType, phy: &mut dyn PhySapProvider);

    fn receive_phy_pdu(&mut self, packet: Packet);

    fn receive_control_message(&mut self, msg: ControlMessage);

    fn ul_cqi_report(&mut self, cqi: UlCqiInfo, sfn: SfnSf, sym_start: u8);

    fn ul_harq_feedback(&mut self, info: UlHarqInfo);

    /// Average SRS SINR (linear) measured for `rnti`
    fn srs_sinr_report(&mut self, rnti: Rnti, sinr: f64);

    fn dl_ctrl_dci(&self) -> Arc<DciInfo>;

    fn ul_ctrl_dci(&self) -> Arc<DciInfo>;

    fn stats(&self) -> MacStats;
}

/// UE MAC as seen from the UE PHY
pub trait UeMacSapUser: fmt::Debug {
    fn slot_indication(&mut self, sfn: SfnSf, phy: &mut dyn PhySapProvider);

    fn receive_phy_pdu(&mut self, packet: Packet);

    fn receive_control_message(&mut self, msg: ControlMessage, phy: &mut dyn PhySapProvider);

    /// Sidelink destinations this UE listens to
    fn sl_rx_destinations(&self) -> HashSet<u32>;

    fn receive_sensing_data(&mut self, data: SensingData);

    fn receive_pssch_phy_pdu(&mut self, burst: PacketBurst);

    fn stats(&self) -> UeMacStats;
}
