//! MAC Scheduler Implementation
//!
//! Round-robin stand-ins that keep the PHY busy: the gNB MAC fills every
//! slot with its control var-TTIs and one DL and one UL data grant, the UE
//! MAC answers UL grants, reports its buffer and drives a periodic sidelink
//! flow.

use super::{
    AllocationType, DciFormat, DciInfo, GnbMacSapUser, PhySapProvider, SensingData,
    SlVarTtiAllocInfo, SlVarTtiType, SlotAllocInfo, UeMacSapUser, UlCqiInfo, UlHarqInfo,
    VarTtiAllocInfo, VarTtiType,
};
use crate::phy::error_model::{tb_size_bytes, MAX_MCS};
use crate::phy::frame::{
    ControlMessage, Packet, PacketBurst, PacketHeader, RadioBearerTag, SciF1aHeader, SciF2aHeader,
    SlMacPduTag,
};
use crate::phy::PhyConfig;
use crate::LayerError;
use bytes::Bytes;
use common::types::{BwpId, Rnti, SfnSf, TddSlotType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Logical channel of the generated traffic
const DATA_LCID: u8 = 4;
const NUM_HARQ_PROCESSES: u8 = 16;

/// Highest MCS whose index scales linearly with the reported CQI
fn mcs_from_cqi(cqi: u8) -> u8 {
    ((cqi.min(15) as u32 * MAX_MCS as u32) / 15) as u8
}

fn payload(size: u32) -> Bytes {
    Bytes::from(vec![0u8; size as usize])
}

/// Symbols of a slot usable for data in one direction
#[derive(Debug, Clone, Copy)]
struct SymbolLayout {
    symbols_per_slot: u8,
    dl_ctrl_symbols: u8,
    ul_ctrl_symbols: u8,
}

impl SymbolLayout {
    fn from_phy(config: &PhyConfig) -> Self {
        Self {
            symbols_per_slot: config.symbols_per_slot,
            dl_ctrl_symbols: config.dl_ctrl_symbols,
            ul_ctrl_symbols: config.ul_ctrl_symbols,
        }
    }

    /// F slots are split in half between the directions
    fn dl_data(&self, slot_type: TddSlotType) -> Option<(u8, u8)> {
        let start = self.dl_ctrl_symbols;
        let len = match slot_type {
            TddSlotType::Dl => self.symbols_per_slot - start,
            TddSlotType::S => self.symbols_per_slot - start - self.ul_ctrl_symbols,
            TddSlotType::F => (self.symbols_per_slot - start - self.ul_ctrl_symbols) / 2,
            TddSlotType::Ul => return None,
        };
        (len > 0).then_some((start, len))
    }

    fn ul_data(&self, slot_type: TddSlotType) -> Option<(u8, u8)> {
        let end = self.symbols_per_slot - self.ul_ctrl_symbols;
        let start = match slot_type {
            TddSlotType::Ul => 0,
            TddSlotType::F => self.dl_ctrl_symbols + (end - self.dl_ctrl_symbols) / 2,
            TddSlotType::Dl | TddSlotType::S => return None,
        };
        (end > start).then_some((start, end - start))
    }

    fn srs_symbol(&self) -> u8 {
        self.symbols_per_slot - self.ul_ctrl_symbols - 1
    }
}

// ============================================================================
// gNB MAC
// ============================================================================

/// gNB scheduler configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GnbMacConfig {
    /// MCS used until (or instead of) CQI feedback
    pub mcs: u8,
    /// Derive the DL MCS from the last wideband CQI
    pub adaptive_mcs: bool,
    /// Every attached UE always has DL data
    pub dl_full_buffer: bool,
    /// SRS periodicity in slots, 0 disables SRS
    pub srs_periodicity: u32,
}

impl Default for GnbMacConfig {
    fn default() -> Self {
        Self {
            mcs: 10,
            adaptive_mcs: false,
            dl_full_buffer: true,
            srs_periodicity: 0,
        }
    }
}

impl GnbMacConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.mcs > MAX_MCS {
            return Err(LayerError::InvalidConfiguration(format!(
                "MCS {} out of range 0..={}",
                self.mcs, MAX_MCS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MacStats {
    pub dl_allocations: u64,
    pub ul_allocations: u64,
    pub srs_allocations: u64,
    pub dl_bytes_scheduled: u64,
    pub ul_bytes_scheduled: u64,
    pub ul_pdus_received: u64,
    pub ul_bytes_received: u64,
    pub dl_harq_acks: u64,
    pub dl_harq_nacks: u64,
    pub ul_harq_ok: u64,
    pub ul_harq_errors: u64,
    pub dl_cqi_reports: u64,
    pub ul_cqi_reports: u64,
    pub srs_reports: u64,
    pub bsrs_received: u64,
}

/// Next UE after `cursor` (in RNTI order) that `wants` a grant
fn pick_round_robin(
    ues: &BTreeMap<Rnti, UeContext>,
    cursor: &mut usize,
    wants: impl Fn(&UeContext) -> bool,
) -> Option<Rnti> {
    if ues.is_empty() {
        return None;
    }
    let start = *cursor % ues.len();
    let found = ues
        .iter()
        .cycle()
        .skip(start)
        .take(ues.len())
        .position(|(_, ue)| wants(ue))?;
    let index = (start + found) % ues.len();
    *cursor = (index + 1) % ues.len();
    ues.keys().nth(index).copied()
}

#[derive(Debug, Clone, Default)]
struct UeContext {
    dl_buffer: u64,
    ul_buffer: u64,
    wb_cqi: Vec<u8>,
    ri: u8,
    next_dl_harq: u8,
    next_ul_harq: u8,
    /// Bytes sent per DL HARQ process, put back in the buffer on NACK
    dl_harq_bytes: BTreeMap<u8, u64>,
    srs_sinr: Option<f64>,
}

/// Round-robin TDMA scheduler: at most one DL and one UL data grant per slot
#[derive(Debug)]
pub struct GnbMac {
    config: GnbMacConfig,
    layout: SymbolLayout,
    num_rbs: usize,
    num_rbg: usize,
    num_streams: u8,
    bwp_id: BwpId,

    current_sfn: Option<SfnSf>,
    ues: BTreeMap<Rnti, UeContext>,
    next_dl_ue: usize,
    next_ul_ue: usize,
    next_srs_ue: usize,

    stats: MacStats,
}

impl GnbMac {
    pub fn new(config: GnbMacConfig, phy: &PhyConfig, bwp_id: BwpId) -> Result<Self, LayerError> {
        config.validate()?;
        Ok(Self {
            config,
            layout: SymbolLayout::from_phy(phy),
            num_rbs: phy.num_rbs,
            num_rbg: phy.num_rbg(),
            num_streams: phy.num_streams,
            bwp_id,
            current_sfn: None,
            ues: BTreeMap::new(),
            next_dl_ue: 0,
            next_ul_ue: 0,
            next_srs_ue: 0,
            stats: MacStats::default(),
        })
    }

    pub fn add_ue(&mut self, rnti: Rnti) {
        info!("gNB MAC attaching {}", rnti);
        self.ues.insert(
            rnti,
            UeContext {
                ri: 1,
                ..UeContext::default()
            },
        );
    }

    pub fn remove_ue(&mut self, rnti: Rnti) {
        if self.ues.remove(&rnti).is_none() {
            warn!("gNB MAC removing unknown {}", rnti);
        }
    }

    /// Queue DL bytes for `rnti`. Ignored with a full buffer.
    pub fn enqueue_dl(&mut self, rnti: Rnti, bytes: u64) {
        match self.ues.get_mut(&rnti) {
            Some(ue) => ue.dl_buffer += bytes,
            None => warn!("gNB MAC DL data for unknown {}", rnti),
        }
    }

    pub fn current_sfn(&self) -> Option<SfnSf> {
        self.current_sfn
    }

    pub fn srs_sinr(&self, rnti: Rnti) -> Option<f64> {
        self.ues.get(&rnti).and_then(|ue| ue.srs_sinr)
    }

    fn ctrl_dci(&self, sym_start: u8, num_sym: u8, format: DciFormat) -> Arc<DciInfo> {
        let mut dci = DciInfo::ctrl(sym_start, num_sym, format, VarTtiType::Ctrl, vec![true; self.num_rbg]);
        dci.bwp_index = self.bwp_id;
        Arc::new(dci)
    }

    fn dl_mcs(&self, ue: &UeContext, stream: usize) -> u8 {
        if !self.config.adaptive_mcs {
            return self.config.mcs;
        }
        ue.wb_cqi.get(stream).map_or(self.config.mcs, |&cqi| mcs_from_cqi(cqi))
    }

    fn data_dci(&self, rnti: Rnti, format: DciFormat, (sym_start, num_sym): (u8, u8), harq: u8) -> DciInfo {
        let mut dci = DciInfo::ctrl(sym_start, num_sym, format, VarTtiType::Data, vec![true; self.num_rbg]);
        dci.rnti = rnti;
        dci.bwp_index = self.bwp_id;
        dci.harq_process = harq;
        dci
    }

    fn schedule_dl_data(&mut self, sfn: SfnSf, span: (u8, u8), alloc: &mut SlotAllocInfo, phy: &mut dyn PhySapProvider) {
        let full_buffer = self.config.dl_full_buffer;
        let Some(rnti) = pick_round_robin(&self.ues, &mut self.next_dl_ue, |ue| full_buffer || ue.dl_buffer > 0) else {
            return;
        };
        let Some(ue) = self.ues.get(&rnti) else {
            return;
        };
        let streams = ue.ri.clamp(1, self.num_streams) as usize;
        let harq = ue.next_dl_harq;
        let mcs: Vec<u8> = (0..streams).map(|s| self.dl_mcs(ue, s)).collect();

        let mut remaining = if full_buffer { u64::MAX } else { ue.dl_buffer };
        let mut tb_size = Vec::with_capacity(streams);
        for &m in &mcs {
            let tbs = (tb_size_bytes(m, self.num_rbs) as u64).min(remaining) as u32;
            remaining -= tbs as u64;
            tb_size.push(tbs);
        }
        if tb_size.iter().all(|&t| t == 0) {
            return;
        }

        let mut dci = self.data_dci(rnti, DciFormat::Dl, span, harq);
        dci.ndi = vec![1; streams];
        dci.rv = vec![0; streams];
        dci.mcs = mcs;
        dci.tb_size = tb_size.clone();

        for (stream, &tbs) in tb_size.iter().enumerate() {
            if tbs == 0 {
                continue;
            }
            let packet = Packet::new(payload(tbs)).with_bearer(RadioBearerTag {
                rnti,
                lcid: DATA_LCID,
                layer: stream as u8,
            });
            phy.send_mac_pdu(packet, sfn, span.0, stream as u8);
        }

        let total: u64 = tb_size.iter().map(|&t| t as u64).sum();
        if let Some(ue) = self.ues.get_mut(&rnti) {
            if !full_buffer {
                ue.dl_buffer -= total;
            }
            ue.dl_harq_bytes.insert(harq, total);
            ue.next_dl_harq = (harq + 1) % NUM_HARQ_PROCESSES;
        }
        debug!("gNB MAC DL grant {} for {}: symbols {:?} tbs {:?}", sfn, rnti, span, tb_size);
        self.stats.dl_allocations += 1;
        self.stats.dl_bytes_scheduled += total;
        alloc.num_sym_alloc += span.1 as u32;
        alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(Arc::new(dci)));
    }

    fn schedule_ul_data(&mut self, sfn: SfnSf, span: (u8, u8), alloc: &mut SlotAllocInfo) {
        let Some(rnti) = pick_round_robin(&self.ues, &mut self.next_ul_ue, |ue| ue.ul_buffer > 0) else {
            return;
        };
        let Some(ue) = self.ues.get_mut(&rnti) else {
            return;
        };
        let tbs = (tb_size_bytes(self.config.mcs, self.num_rbs) as u64).min(ue.ul_buffer) as u32;
        ue.ul_buffer -= tbs as u64;
        let harq = ue.next_ul_harq;
        ue.next_ul_harq = (harq + 1) % NUM_HARQ_PROCESSES;

        let mut dci = self.data_dci(rnti, DciFormat::Ul, span, harq);
        dci.ndi = vec![1];
        dci.rv = vec![0];
        dci.mcs = vec![self.config.mcs];
        dci.tb_size = vec![tbs];

        debug!("gNB MAC UL grant {} for {}: symbols {:?} tbs {}", sfn, rnti, span, tbs);
        self.stats.ul_allocations += 1;
        self.stats.ul_bytes_scheduled += tbs as u64;
        alloc.num_sym_alloc += span.1 as u32;
        alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(Arc::new(dci)));
    }

    fn schedule_srs(&mut self, sfn: SfnSf, alloc: &mut SlotAllocInfo) -> bool {
        let period = self.config.srs_periodicity as u64;
        if period == 0 || sfn.normalize() % period != 0 {
            return false;
        }
        let Some(rnti) = pick_round_robin(&self.ues, &mut self.next_srs_ue, |_| true) else {
            return false;
        };
        let mut dci = DciInfo::ctrl(self.layout.srs_symbol(), 1, DciFormat::Ul, VarTtiType::Srs, vec![true; self.num_rbg]);
        dci.rnti = rnti;
        dci.bwp_index = self.bwp_id;
        trace!("gNB MAC SRS of {} in {}", rnti, sfn);
        self.stats.srs_allocations += 1;
        alloc.num_sym_alloc += 1;
        alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(Arc::new(dci)));
        true
    }
}

impl GnbMacSapUser for GnbMac {
    fn add_ue(&mut self, rnti: Rnti) {
        GnbMac::add_ue(self, rnti);
    }

    fn remove_ue(&mut self, rnti: Rnti) {
        GnbMac::remove_ue(self, rnti);
    }

    fn set_current_sfn(&mut self, sfn: SfnSf) {
        self.current_sfn = Some(sfn);
    }

    fn slot_dl_indication(&mut self, sfn: SfnSf, slot_type: TddSlotType, phy: &mut dyn PhySapProvider) {
        if slot_type == TddSlotType::Ul {
            return;
        }
        let mut alloc = SlotAllocInfo::new(sfn);
        alloc.alloc_type = AllocationType::Dl;
        let dl_ctrl = self.ctrl_dci(0, self.layout.dl_ctrl_symbols, DciFormat::Dl);
        alloc.num_sym_alloc += dl_ctrl.num_sym as u32;
        alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(dl_ctrl));

        if let Some(span) = self.layout.dl_data(slot_type) {
            self.schedule_dl_data(sfn, span, &mut alloc, phy);
        }
        alloc.sort();
        phy.set_slot_alloc_info(alloc);
    }

    fn slot_ul_indication(&mut self, sfn: SfnSf, slot_type: TddSlotType, phy: &mut dyn PhySapProvider) {
        if slot_type == TddSlotType::Dl {
            return;
        }
        let mut alloc = SlotAllocInfo::new(sfn);
        alloc.alloc_type = AllocationType::Ul;

        // SRS takes the symbol before the UL CTRL, and only where it does
        // not cut into DL data
        let has_srs = slot_type != TddSlotType::S && self.schedule_srs(sfn, &mut alloc);
        if let Some((start, mut len)) = self.layout.ul_data(slot_type) {
            if has_srs {
                len -= 1;
            }
            if len > 0 {
                self.schedule_ul_data(sfn, (start, len), &mut alloc);
            }
        }

        let ul_ctrl = self.ul_ctrl_dci();
        alloc.num_sym_alloc += ul_ctrl.num_sym as u32;
        alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(ul_ctrl));
        alloc.sort();
        phy.set_slot_alloc_info(alloc);
    }

    fn receive_phy_pdu(&mut self, packet: Packet) {
        self.stats.ul_pdus_received += 1;
        self.stats.ul_bytes_received += packet.size() as u64;
        trace!("gNB MAC received {} bytes from {:?}", packet.size(), packet.bearer.map(|b| b.rnti));
    }

    fn receive_control_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::DlCqi(cqi) => {
                self.stats.dl_cqi_reports += 1;
                if let Some(ue) = self.ues.get_mut(&cqi.rnti) {
                    debug!("gNB MAC DL CQI of {}: ri {} wb {:?}", cqi.rnti, cqi.ri, cqi.wb_cqi);
                    ue.ri = cqi.ri;
                    ue.wb_cqi = cqi.wb_cqi;
                }
            }
            ControlMessage::DlHarq(harq) => {
                let Some(ue) = self.ues.get_mut(&harq.rnti) else {
                    return;
                };
                let sent = ue.dl_harq_bytes.remove(&harq.harq_process_id).unwrap_or(0);
                if harq.is_received_ok() {
                    self.stats.dl_harq_acks += 1;
                } else {
                    self.stats.dl_harq_nacks += 1;
                    // Retransmitted as new data
                    if !self.config.dl_full_buffer {
                        ue.dl_buffer += sent;
                    }
                }
                trace!("gNB MAC DL HARQ of {} process {}: {:?}", harq.rnti, harq.harq_process_id, harq.harq_status);
            }
            ControlMessage::Bsr { rnti, buffer_bytes } => {
                self.stats.bsrs_received += 1;
                match self.ues.get_mut(&rnti) {
                    Some(ue) => ue.ul_buffer = buffer_bytes as u64,
                    None => warn!("gNB MAC BSR from unknown {}", rnti),
                }
            }
            other => trace!("gNB MAC ignoring {}", other.name()),
        }
    }

    fn ul_cqi_report(&mut self, cqi: UlCqiInfo, sfn: SfnSf, sym_start: u8) {
        self.stats.ul_cqi_reports += 1;
        trace!("gNB MAC UL CQI ({:?}) of {} symbol {}: {} RBs", cqi.kind, sfn, sym_start, cqi.sinr.len());
    }

    fn ul_harq_feedback(&mut self, info: UlHarqInfo) {
        if info.is_received_ok() {
            self.stats.ul_harq_ok += 1;
        } else {
            self.stats.ul_harq_errors += 1;
        }
    }

    fn srs_sinr_report(&mut self, rnti: Rnti, sinr: f64) {
        self.stats.srs_reports += 1;
        if let Some(ue) = self.ues.get_mut(&rnti) {
            ue.srs_sinr = Some(sinr);
        }
    }

    fn dl_ctrl_dci(&self) -> Arc<DciInfo> {
        self.ctrl_dci(0, self.layout.dl_ctrl_symbols, DciFormat::Dl)
    }

    fn ul_ctrl_dci(&self) -> Arc<DciInfo> {
        let start = self.layout.symbols_per_slot - self.layout.ul_ctrl_symbols;
        self.ctrl_dci(start, self.layout.ul_ctrl_symbols, DciFormat::Ul)
    }

    fn stats(&self) -> MacStats {
        self.stats.clone()
    }
}

// ============================================================================
// UE MAC
// ============================================================================

/// Periodic sidelink flow toward one destination
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SlTrafficConfig {
    pub dst_l2_id: u32,
    /// Slots between two new TBs
    pub period_slots: u32,
    pub offset_slots: u32,
    pub mcs: u8,
    pub priority: u8,
    pub sb_ch_start: u8,
    pub sb_ch_length: u8,
    /// Resource reservation period announced in the SCI, ms
    pub resource_reserve_period_ms: u16,
    /// Slots from a new TB to its blind retransmission
    pub retx_gap: Option<u8>,
}

impl Default for SlTrafficConfig {
    fn default() -> Self {
        Self {
            dst_l2_id: 255,
            period_slots: 10,
            offset_slots: 0,
            mcs: 10,
            priority: 1,
            sb_ch_start: 0,
            sb_ch_length: 1,
            resource_reserve_period_ms: 100,
            retx_gap: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UeMacConfig {
    /// Bytes of UL data generated every `ul_period_slots`
    pub ul_bytes: u32,
    /// 0 disables UL traffic
    pub ul_period_slots: u32,
    pub sl_traffic: Option<SlTrafficConfig>,
    pub sl_rx_destinations: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UeMacStats {
    pub slots: u64,
    pub dl_dcis: u64,
    pub ul_dcis: u64,
    pub ul_pdus_sent: u64,
    pub ul_bytes_sent: u64,
    pub bsrs_sent: u64,
    pub dl_pdus_received: u64,
    pub dl_bytes_received: u64,
    pub pscch_sent: u64,
    pub pssch_sent: u64,
    pub sl_retx_sent: u64,
    pub sl_tx_skipped: u64,
    pub sl_pdus_received: u64,
    pub sl_bytes_received: u64,
    pub sensing_reports: u64,
}

#[derive(Debug, Clone, Copy)]
struct SlRetx {
    sfn: SfnSf,
    harq_id: u8,
}

#[derive(Debug)]
pub struct UeMac {
    rnti: Rnti,
    config: UeMacConfig,
    layout: SymbolLayout,
    num_rbs: usize,
    sub_channel_size: u16,

    current_sfn: Option<SfnSf>,
    ul_buffer: u64,
    /// Slots with a known UL grant, where no sidelink can be sent
    ul_grant_slots: BTreeSet<SfnSf>,
    next_sl_harq: u8,
    sl_retx: VecDeque<SlRetx>,
    last_sensing: Option<SensingData>,

    stats: UeMacStats,
}

impl UeMac {
    pub fn new(rnti: Rnti, config: UeMacConfig, phy: &PhyConfig) -> Result<Self, LayerError> {
        let num_sub_channels = phy.num_rbs / phy.sl_sub_channel_size.max(1) as usize;
        if let Some(sl) = &config.sl_traffic {
            if sl.period_slots == 0 {
                return Err(LayerError::InvalidConfiguration(
                    "sidelink period must be at least one slot".to_string(),
                ));
            }
            if sl.sb_ch_length == 0 || sl.sb_ch_start as usize + sl.sb_ch_length as usize > num_sub_channels {
                return Err(LayerError::InvalidConfiguration(format!(
                    "sidelink sub-channels {}+{} exceed the {} available",
                    sl.sb_ch_start, sl.sb_ch_length, num_sub_channels
                )));
            }
            if sl.mcs > MAX_MCS {
                return Err(LayerError::InvalidConfiguration(format!("sidelink MCS {} out of range", sl.mcs)));
            }
            if sl.retx_gap == Some(0) || sl.retx_gap == Some(SciF1aHeader::NO_RETX) {
                return Err(LayerError::InvalidConfiguration(
                    "sidelink retransmission gap must be 1..255".to_string(),
                ));
            }
        }
        Ok(Self {
            rnti,
            config,
            layout: SymbolLayout::from_phy(phy),
            num_rbs: phy.num_rbs,
            sub_channel_size: phy.sl_sub_channel_size,
            current_sfn: None,
            ul_buffer: 0,
            ul_grant_slots: BTreeSet::new(),
            next_sl_harq: 0,
            sl_retx: VecDeque::new(),
            last_sensing: None,
            stats: UeMacStats::default(),
        })
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn ul_buffer(&self) -> u64 {
        self.ul_buffer
    }

    pub fn last_sensing(&self) -> Option<&SensingData> {
        self.last_sensing.as_ref()
    }

    /// Queue UL bytes and report them in the next UL CTRL
    pub fn enqueue_ul(&mut self, bytes: u64, phy: &mut dyn PhySapProvider) {
        self.ul_buffer += bytes;
        self.send_bsr(phy);
    }

    fn send_bsr(&mut self, phy: &mut dyn PhySapProvider) {
        self.stats.bsrs_sent += 1;
        phy.send_control_message(ControlMessage::Bsr {
            rnti: self.rnti,
            buffer_bytes: self.ul_buffer.min(u32::MAX as u64) as u32,
        });
    }

    fn sl_var_ttis(&self, sl: &SlTrafficConfig) -> (SlVarTtiAllocInfo, SlVarTtiAllocInfo) {
        let size = self.sub_channel_size;
        let rb_start = sl.sb_ch_start as u16 * size;
        let rb_length = sl.sb_ch_length as u16 * size;
        // Symbol 0 is left for AGC, the last one is the guard
        let ctrl = SlVarTtiAllocInfo {
            sym_start: 1,
            sym_length: 2,
            rb_start,
            rb_length,
            kind: SlVarTtiType::Ctrl,
        };
        let data = SlVarTtiAllocInfo {
            sym_start: 3,
            sym_length: self.layout.symbols_per_slot - 4,
            rb_start,
            rb_length,
            kind: SlVarTtiType::Data,
        };
        (ctrl, data)
    }

    fn sl_tag(&self, sfn: SfnSf, data: &SlVarTtiAllocInfo, tb_size: u32, dst: u32) -> SlMacPduTag {
        SlMacPduTag {
            rnti: self.rnti,
            sfn,
            sym_start: data.sym_start,
            num_sym: data.sym_length,
            tb_size,
            dst_l2_id: dst,
        }
    }

    fn pssch_pdus(&self, tag: SlMacPduTag, harq_id: u8, new_data: bool) -> (Packet, Packet) {
        let sci2 = SciF2aHeader {
            harq_id,
            ndi: u8::from(new_data),
            rv: if new_data { 0 } else { 1 },
            src_id: self.rnti.value() as u32,
            dst_id: tag.dst_l2_id,
        };
        let sci2 = Packet::new(Bytes::new())
            .with_header(PacketHeader::SciF2a(sci2))
            .with_sl_tag(tag);
        let data = Packet::new(payload(tag.tb_size.saturating_sub(SciF2aHeader::SERIALIZED_SIZE)))
            .with_bearer(RadioBearerTag {
                rnti: self.rnti,
                lcid: DATA_LCID,
                layer: 0,
            })
            .with_sl_tag(tag);
        (sci2, data)
    }

    fn transmit_sl(&mut self, sfn: SfnSf, sl: &SlTrafficConfig, phy: &mut dyn PhySapProvider) {
        let (ctrl, data) = self.sl_var_ttis(sl);
        let tb_size = tb_size_bytes(sl.mcs, data.rb_length as usize);
        let tag = self.sl_tag(sfn, &data, tb_size, sl.dst_l2_id);
        let harq_id = self.next_sl_harq;
        self.next_sl_harq = (harq_id + 1) % NUM_HARQ_PROCESSES;

        let sci1 = SciF1aHeader {
            priority: sl.priority,
            mcs: sl.mcs,
            sl_resource_reserve_period: sl.resource_reserve_period_ms,
            total_sub_channels: (self.num_rbs / self.sub_channel_size.max(1) as usize) as u16,
            index_start_sub_channel: sl.sb_ch_start,
            length_sub_channel: sl.sb_ch_length,
            sl_max_num_per_reserve: if sl.retx_gap.is_some() { 2 } else { 1 },
            gap_retx1: sl.retx_gap.unwrap_or(SciF1aHeader::NO_RETX),
            index_start_sb_ch_retx1: sl.sb_ch_start,
            gap_retx2: SciF1aHeader::NO_RETX,
            index_start_sb_ch_retx2: 0,
        };
        let pscch = Packet::new(Bytes::new())
            .with_header(PacketHeader::SciF1a(sci1))
            .with_sl_tag(tag);
        let (sci2, data_pdu) = self.pssch_pdus(tag, harq_id, true);

        phy.set_sl_var_tti_alloc_info(sfn, ctrl);
        phy.set_sl_var_tti_alloc_info(sfn, data);
        phy.send_pscch_mac_pdu(pscch);
        phy.send_pssch_mac_pdu(sci2);
        phy.send_pssch_mac_pdu(data_pdu);
        self.stats.pscch_sent += 1;
        self.stats.pssch_sent += 1;
        debug!("UE MAC {} SL TB of {} bytes to {} in {}", self.rnti, tb_size, sl.dst_l2_id, sfn);

        if let Some(gap) = sl.retx_gap {
            let retx = SlRetx {
                sfn: sfn.future(gap as u32),
                harq_id,
            };
            let pos = self.sl_retx.partition_point(|r| r.sfn <= retx.sfn);
            self.sl_retx.insert(pos, retx);
        }
    }

    /// Blind retransmission: PSSCH only, announced by the first SCI
    fn retransmit_sl(&mut self, retx: SlRetx, sl: &SlTrafficConfig, phy: &mut dyn PhySapProvider) {
        let (_, data) = self.sl_var_ttis(sl);
        let tb_size = tb_size_bytes(sl.mcs, data.rb_length as usize);
        let tag = self.sl_tag(retx.sfn, &data, tb_size, sl.dst_l2_id);
        let (sci2, data_pdu) = self.pssch_pdus(tag, retx.harq_id, false);
        phy.set_sl_var_tti_alloc_info(retx.sfn, data);
        phy.send_pssch_mac_pdu(sci2);
        phy.send_pssch_mac_pdu(data_pdu);
        self.stats.pssch_sent += 1;
        self.stats.sl_retx_sent += 1;
        debug!("UE MAC {} SL retransmission of process {} in {}", self.rnti, retx.harq_id, retx.sfn);
    }

    fn sidelink_slot(&mut self, sfn: SfnSf, phy: &mut dyn PhySapProvider) {
        let Some(sl) = self.config.sl_traffic.clone() else {
            return;
        };

        while self.sl_retx.front().is_some_and(|r| r.sfn < sfn) {
            self.sl_retx.pop_front();
        }
        let retx_due = self.sl_retx.front().is_some_and(|r| r.sfn == sfn);
        let new_tx_due = sfn.normalize() % sl.period_slots as u64 == (sl.offset_slots % sl.period_slots) as u64;
        if !retx_due && !new_tx_due {
            return;
        }

        if self.ul_grant_slots.contains(&sfn) {
            warn!("UE MAC {} sidelink skipped in {}: UL grant in the same slot", self.rnti, sfn);
            self.stats.sl_tx_skipped += 1;
            if retx_due {
                self.sl_retx.pop_front();
            }
            return;
        }

        if new_tx_due {
            if retx_due {
                // One TB per slot, the new one wins
                self.sl_retx.pop_front();
            }
            self.transmit_sl(sfn, &sl, phy);
        } else if let Some(retx) = self.sl_retx.pop_front() {
            self.retransmit_sl(retx, &sl, phy);
        }
    }
}

impl UeMacSapUser for UeMac {
    fn slot_indication(&mut self, sfn: SfnSf, phy: &mut dyn PhySapProvider) {
        self.current_sfn = Some(sfn);
        self.stats.slots += 1;
        self.ul_grant_slots = self.ul_grant_slots.split_off(&sfn);

        let period = self.config.ul_period_slots as u64;
        if period > 0 && self.config.ul_bytes > 0 && sfn.normalize() % period == 0 {
            self.enqueue_ul(self.config.ul_bytes as u64, phy);
        }

        self.sidelink_slot(sfn, phy);
    }

    fn receive_phy_pdu(&mut self, packet: Packet) {
        self.stats.dl_pdus_received += 1;
        self.stats.dl_bytes_received += packet.size() as u64;
    }

    fn receive_control_message(&mut self, msg: ControlMessage, phy: &mut dyn PhySapProvider) {
        match msg {
            ControlMessage::DlDci { .. } => self.stats.dl_dcis += 1,
            ControlMessage::UlDci { dci, k2 } => {
                self.stats.ul_dcis += 1;
                let Some(now) = self.current_sfn else {
                    warn!("UE MAC {} UL DCI before the first slot", self.rnti);
                    return;
                };
                let ul_sfn = now.future(k2);
                self.ul_grant_slots.insert(ul_sfn);

                let tbs = dci.tb_size.first().copied().unwrap_or(0);
                if self.ul_buffer < tbs as u64 {
                    trace!("UE MAC {} padding UL grant of {} bytes", self.rnti, tbs);
                }
                self.ul_buffer = self.ul_buffer.saturating_sub(tbs as u64);
                let packet = Packet::new(payload(tbs)).with_bearer(RadioBearerTag {
                    rnti: self.rnti,
                    lcid: DATA_LCID,
                    layer: 0,
                });
                phy.send_mac_pdu(packet, ul_sfn, dci.sym_start, 0);
                self.stats.ul_pdus_sent += 1;
                self.stats.ul_bytes_sent += tbs as u64;
                debug!("UE MAC {} UL PDU of {} bytes for {}", self.rnti, tbs, ul_sfn);
            }
            other => trace!("UE MAC {} ignoring {}", self.rnti, other.name()),
        }
    }

    fn sl_rx_destinations(&self) -> HashSet<u32> {
        self.config.sl_rx_destinations.iter().copied().collect()
    }

    fn receive_sensing_data(&mut self, data: SensingData) {
        self.stats.sensing_reports += 1;
        trace!("UE MAC {} sensing: {:?}", self.rnti, data);
        self.last_sensing = Some(data);
    }

    fn receive_pssch_phy_pdu(&mut self, burst: PacketBurst) {
        for packet in burst.iter().filter(|p| p.bearer.is_some()) {
            self.stats.sl_pdus_received += 1;
            self.stats.sl_bytes_received += packet.size() as u64;
        }
    }

    fn stats(&self) -> UeMacStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{DlCqiInfo, DlHarqInfo, HarqStatus};
    use common::sim::SimTime;
    use common::types::CellId;

    #[derive(Default)]
    struct RecordingPhy {
        pdus: Vec<(Packet, SfnSf, u8, u8)>,
        ctrl: Vec<ControlMessage>,
        allocs: Vec<SlotAllocInfo>,
        pscch: Vec<Packet>,
        pssch: Vec<Packet>,
        sl_allocs: Vec<(SfnSf, SlVarTtiAllocInfo)>,
    }

    impl PhySapProvider for RecordingPhy {
        fn send_mac_pdu(&mut self, packet: Packet, sfn: SfnSf, sym_start: u8, stream: u8) {
            self.pdus.push((packet, sfn, sym_start, stream));
        }

        fn send_control_message(&mut self, msg: ControlMessage) {
            self.ctrl.push(msg);
        }

        fn set_slot_alloc_info(&mut self, alloc: SlotAllocInfo) {
            self.allocs.push(alloc);
        }

        fn slot_period(&self) -> SimTime {
            SimTime::from_micros(500)
        }

        fn cell_id(&self) -> CellId {
            CellId(1)
        }

        fn bw_in_rbs(&self) -> usize {
            52
        }

        fn num_rbg(&self) -> usize {
            52
        }

        fn send_pscch_mac_pdu(&mut self, packet: Packet) {
            self.pscch.push(packet);
        }

        fn send_pssch_mac_pdu(&mut self, packet: Packet) {
            self.pssch.push(packet);
        }

        fn set_sl_var_tti_alloc_info(&mut self, sfn: SfnSf, info: SlVarTtiAllocInfo) {
            self.sl_allocs.push((sfn, info));
        }
    }

    fn shape(alloc: &SlotAllocInfo) -> Vec<(VarTtiType, DciFormat, u8, u8)> {
        alloc
            .var_tti_alloc_info
            .iter()
            .map(|a| (a.dci.var_tti_type, a.dci.format, a.dci.sym_start, a.dci.num_sym))
            .collect()
    }

    fn gnb_mac(config: GnbMacConfig) -> GnbMac {
        let mut mac = GnbMac::new(config, &PhyConfig::default(), BwpId(0)).unwrap();
        mac.add_ue(Rnti(1));
        mac.add_ue(Rnti(2));
        mac
    }

    #[test]
    fn test_symbol_layout_per_slot_type() {
        let layout = SymbolLayout::from_phy(&PhyConfig::default());
        assert_eq!(layout.dl_data(TddSlotType::Dl), Some((1, 13)));
        assert_eq!(layout.dl_data(TddSlotType::S), Some((1, 12)));
        assert_eq!(layout.dl_data(TddSlotType::F), Some((1, 6)));
        assert_eq!(layout.dl_data(TddSlotType::Ul), None);
        assert_eq!(layout.ul_data(TddSlotType::Ul), Some((0, 13)));
        assert_eq!(layout.ul_data(TddSlotType::F), Some((7, 6)));
        assert_eq!(layout.ul_data(TddSlotType::S), None);
    }

    #[test]
    fn test_dl_round_robin_with_ctrl() {
        let mut mac = gnb_mac(GnbMacConfig::default());
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        mac.slot_dl_indication(sfn, TddSlotType::Dl, &mut phy);
        mac.slot_dl_indication(sfn.future(1), TddSlotType::Dl, &mut phy);
        mac.slot_dl_indication(sfn.future(2), TddSlotType::Ul, &mut phy);

        assert_eq!(phy.allocs.len(), 2);
        assert_eq!(
            shape(&phy.allocs[0]),
            vec![(VarTtiType::Ctrl, DciFormat::Dl, 0, 1), (VarTtiType::Data, DciFormat::Dl, 1, 13)]
        );
        assert_eq!(phy.allocs[0].alloc_type, AllocationType::Dl);
        assert_eq!(phy.allocs[0].var_tti_alloc_info[1].dci.rnti, Rnti(1));
        assert_eq!(phy.allocs[1].var_tti_alloc_info[1].dci.rnti, Rnti(2));

        // One PDU per grant, as big as the TB, queued at the data symbol
        assert_eq!(phy.pdus.len(), 2);
        let (packet, pdu_sfn, sym, stream) = &phy.pdus[0];
        assert_eq!((*pdu_sfn, *sym, *stream), (sfn, 1, 0));
        assert_eq!(packet.size(), tb_size_bytes(10, 52));
        assert_eq!(mac.stats().dl_allocations, 2);
    }

    #[test]
    fn test_dl_buffer_limits_grants() {
        let config = GnbMacConfig {
            dl_full_buffer: false,
            ..GnbMacConfig::default()
        };
        let mut mac = gnb_mac(config);
        let mut phy = RecordingPhy::default();
        mac.enqueue_dl(Rnti(2), 30);

        let sfn = SfnSf::new(0, 0, 0, 1);
        mac.slot_dl_indication(sfn, TddSlotType::Dl, &mut phy);
        mac.slot_dl_indication(sfn.future(1), TddSlotType::Dl, &mut phy);

        assert_eq!(phy.pdus.len(), 1);
        assert_eq!(phy.pdus[0].0.size(), 30);
        assert_eq!(phy.allocs[1].var_tti_alloc_info.len(), 1);

        // A NACK puts the bytes back
        mac.receive_control_message(ControlMessage::DlHarq(DlHarqInfo {
            rnti: Rnti(2),
            harq_process_id: 0,
            bwp_index: BwpId(0),
            harq_status: vec![HarqStatus::Nack],
            num_retx: vec![0],
        }));
        assert_eq!(mac.stats().dl_harq_nacks, 1);
        mac.slot_dl_indication(sfn.future(2), TddSlotType::Dl, &mut phy);
        assert_eq!(phy.pdus.len(), 2);
    }

    #[test]
    fn test_ul_grant_after_bsr_with_srs() {
        let config = GnbMacConfig {
            srs_periodicity: 2,
            ..GnbMacConfig::default()
        };
        let mut mac = gnb_mac(config);
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        mac.slot_ul_indication(sfn, TddSlotType::Ul, &mut phy);
        assert_eq!(
            shape(&phy.allocs[0]),
            vec![(VarTtiType::Srs, DciFormat::Ul, 12, 1), (VarTtiType::Ctrl, DciFormat::Ul, 13, 1)]
        );

        mac.receive_control_message(ControlMessage::Bsr {
            rnti: Rnti(2),
            buffer_bytes: 50,
        });
        mac.slot_ul_indication(sfn.future(2), TddSlotType::Ul, &mut phy);
        assert_eq!(
            shape(&phy.allocs[1]),
            vec![
                (VarTtiType::Data, DciFormat::Ul, 0, 12),
                (VarTtiType::Srs, DciFormat::Ul, 12, 1),
                (VarTtiType::Ctrl, DciFormat::Ul, 13, 1)
            ]
        );
        let data = &phy.allocs[1].var_tti_alloc_info[0].dci;
        assert_eq!(data.rnti, Rnti(2));
        assert_eq!(data.tb_size, vec![50]);
        // SRS alternates between the UEs
        assert_eq!(phy.allocs[1].var_tti_alloc_info[1].dci.rnti, Rnti(2));
        // Nothing left to grant
        mac.slot_ul_indication(sfn.future(3), TddSlotType::Ul, &mut phy);
        assert_eq!(phy.allocs[2].var_tti_alloc_info.len(), 1);
    }

    #[test]
    fn test_cqi_drives_mcs_and_rank() {
        let config = GnbMacConfig {
            adaptive_mcs: true,
            ..GnbMacConfig::default()
        };
        let phy_config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        let mut mac = GnbMac::new(config, &phy_config, BwpId(0)).unwrap();
        mac.add_ue(Rnti(1));
        mac.receive_control_message(ControlMessage::DlCqi(DlCqiInfo {
            rnti: Rnti(1),
            ri: 2,
            wb_cqi: vec![15, 0],
        }));

        let mut phy = RecordingPhy::default();
        mac.slot_dl_indication(SfnSf::new(0, 0, 0, 1), TddSlotType::Dl, &mut phy);
        let dci = &phy.allocs[0].var_tti_alloc_info[1].dci;
        assert_eq!(dci.mcs, vec![MAX_MCS, 0]);
        assert_eq!(dci.active_streams(), 2);
        assert_eq!(phy.pdus.len(), 2);
        assert_eq!(phy.pdus[1].3, 1);
    }

    #[test]
    fn test_mac_config_validation() {
        let bad = GnbMacConfig {
            mcs: 40,
            ..GnbMacConfig::default()
        };
        assert!(GnbMac::new(bad, &PhyConfig::default(), BwpId(0)).is_err());

        let sl = UeMacConfig {
            sl_traffic: Some(SlTrafficConfig {
                sb_ch_start: 4,
                sb_ch_length: 2,
                ..SlTrafficConfig::default()
            }),
            ..UeMacConfig::default()
        };
        // 52 RBs hold 5 sub-channels of 10 RBs
        assert!(UeMac::new(Rnti(1), sl, &PhyConfig::default()).is_err());
    }

    #[test]
    fn test_ue_answers_ul_grant_and_reports_buffer() {
        let config = UeMacConfig {
            ul_bytes: 80,
            ul_period_slots: 4,
            ..UeMacConfig::default()
        };
        let mut mac = UeMac::new(Rnti(3), config, &PhyConfig::default()).unwrap();
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        mac.slot_indication(sfn, &mut phy);
        assert_eq!(
            phy.ctrl,
            vec![ControlMessage::Bsr {
                rnti: Rnti(3),
                buffer_bytes: 80
            }]
        );

        let mut dci = DciInfo::ctrl(0, 13, DciFormat::Ul, VarTtiType::Data, vec![true; 52]);
        dci.rnti = Rnti(3);
        dci.tb_size = vec![50];
        mac.receive_control_message(ControlMessage::UlDci { dci: Arc::new(dci), k2: 2 }, &mut phy);

        assert_eq!(mac.ul_buffer(), 30);
        let (packet, pdu_sfn, sym, _) = &phy.pdus[0];
        assert_eq!((*pdu_sfn, *sym), (sfn.future(2), 0));
        assert_eq!(packet.size(), 50);
        assert_eq!(packet.bearer.map(|b| b.rnti), Some(Rnti(3)));
    }

    fn sl_mac(retx_gap: Option<u8>) -> UeMac {
        let config = UeMacConfig {
            sl_traffic: Some(SlTrafficConfig {
                period_slots: 4,
                sb_ch_start: 1,
                sb_ch_length: 2,
                retx_gap,
                ..SlTrafficConfig::default()
            }),
            ..UeMacConfig::default()
        };
        UeMac::new(Rnti(5), config, &PhyConfig::default()).unwrap()
    }

    #[test]
    fn test_sidelink_new_transmission() {
        let mut mac = sl_mac(None);
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        mac.slot_indication(sfn, &mut phy);
        mac.slot_indication(sfn.future(1), &mut phy);

        assert_eq!(phy.pscch.len(), 1);
        assert_eq!(phy.pssch.len(), 2);
        assert_eq!(phy.sl_allocs.len(), 2);
        let (alloc_sfn, ctrl) = phy.sl_allocs[0];
        assert_eq!(alloc_sfn, sfn);
        assert_eq!((ctrl.kind, ctrl.rb_start, ctrl.rb_length), (SlVarTtiType::Ctrl, 10, 20));

        let Some(sci) = phy.pscch[0].sci_f1a() else {
            panic!("PSCCH without SCI 1-A");
        };
        assert_eq!(sci.total_sub_channels, 5);
        assert_eq!(sci.gap_retx1, SciF1aHeader::NO_RETX);
        assert!(phy.pssch[0].sci_f2a().is_some());
        assert_eq!(phy.pssch[1].sl_tag.map(|t| t.dst_l2_id), Some(255));
    }

    #[test]
    fn test_sidelink_blind_retransmission() {
        let mut mac = sl_mac(Some(2));
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        for k in 0..3 {
            mac.slot_indication(sfn.future(k), &mut phy);
        }
        assert_eq!(phy.pscch.len(), 1);
        assert_eq!(phy.pssch.len(), 4);
        assert_eq!(mac.stats().sl_retx_sent, 1);
        let (retx_sfn, info) = phy.sl_allocs[2];
        assert_eq!((retx_sfn, info.kind), (sfn.future(2), SlVarTtiType::Data));
        let Some(sci2) = phy.pssch[2].sci_f2a() else {
            panic!("retransmission without SCI 2-A");
        };
        assert_eq!((sci2.ndi, sci2.rv), (0, 1));
    }

    #[test]
    fn test_sidelink_skipped_on_ul_grant() {
        let mut mac = sl_mac(None);
        let mut phy = RecordingPhy::default();
        let sfn = SfnSf::new(0, 0, 0, 1);

        mac.slot_indication(sfn.future(2), &mut phy);
        let mut dci = DciInfo::ctrl(0, 13, DciFormat::Ul, VarTtiType::Data, vec![true; 52]);
        dci.rnti = Rnti(5);
        dci.tb_size = vec![10];
        mac.receive_control_message(ControlMessage::UlDci { dci: Arc::new(dci), k2: 2 }, &mut phy);

        mac.slot_indication(sfn.future(4), &mut phy);
        assert!(phy.pscch.is_empty());
        assert_eq!(mac.stats().sl_tx_skipped, 1);
    }

    #[test]
    fn test_mac_config_from_toml() {
        let config: UeMacConfig = toml::from_str(
            r#"
            sl_rx_destinations = [255]
            [sl_traffic]
            dst_l2_id = 255
            period_slots = 20
            retx_gap = 3
            "#,
        )
        .unwrap();
        let Some(sl) = &config.sl_traffic else {
            panic!("sidelink traffic missing");
        };
        assert_eq!(sl.period_slots, 20);
        assert_eq!(sl.retx_gap, Some(3));
        assert_eq!(sl.mcs, 10);
        assert_eq!(config.ul_period_slots, 0);
        assert_eq!(config.sl_rx_destinations, vec![255]);
    }
}
