//! UE PHY
//!
//! Slot engine of the terminal. The UE knows the pattern of its cell and
//! frames every slot with a DL CTRL at the beginning (DL-capable slots) and
//! an UL CTRL at the end (UL-capable slots). Data var-TTIs come from the
//! DCIs it decodes. Sidelink slots replace the cellular slot entirely.

use super::beam::BeamformingVector;
use super::cam::{AccessResponse, ChannelAccessManager};
use super::config::PhyConfig;
use super::error_model::wideband_cqi;
use super::frame::{ControlMessage, Packet, PacketBurst, SignalFrame, SlMacPduTag, SciF1aHeader};
use super::frame_structure::{parse_pattern, pattern_to_string};
use super::phy_core::PhyCore;
use super::spectrum::{sidelink_rsrp_dbm, DeviceRole, PhyIndication, PsschRxInfo, SpectrumTimer};
use super::spectrum_value::SpectrumValue;
use super::tb_registry::{ExpectedTb, SlExpectedTb, SlTbKey};
use super::{PhyEvent, SimContext};
use crate::mac::{
    DciFormat, DciInfo, DlCqiInfo, DlHarqInfo, HarqStatus, SensingData, SlVarTtiAllocInfo,
    SlVarTtiType, SlotAllocInfo, UeMacSapUser, VarTtiAllocInfo, VarTtiType,
};
use crate::LayerError;
use common::sim::{EventId, SimTime};
use common::types::{BwpId, CellId, NodeId, Rnti, SfnSf, TddSlotType};
use common::utils::linear_to_db;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Events handled by a UE PHY
#[derive(Debug, Clone)]
pub enum UeEvent {
    StartSlot(SfnSf),
    StartVarTti(Arc<DciInfo>),
    EndVarTti(Arc<DciInfo>),
    SendDataChannels { packets: PacketBurst, duration: SimTime },
    /// Listen-before-talk ahead of the UL CTRL
    RequestAccess,
    /// Control message for the current slot, e.g. DL HARQ feedback due now
    SendCtrlMessageNow(ControlMessage),
    DeliverPdu(Packet),
    DeliverPsschPdu(PacketBurst),
    StartSlVarTti(SlVarTtiAllocInfo),
    EndSlVarTti(SlVarTtiAllocInfo),
    SendSlDataChannels {
        packets: PacketBurst,
        duration: SimTime,
        info: SlVarTtiAllocInfo,
    },
}

/// Rank indicator selection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankIndicatorConfig {
    /// Report `fixed_ri` instead of adapting to the SINR
    pub use_fixed_ri: bool,
    pub fixed_ri: u8,
    /// dB, to switch from one stream to two
    pub sinr_threshold_1: f64,
    /// dB, to stay on two streams
    pub sinr_threshold_2: f64,
}

impl Default for RankIndicatorConfig {
    fn default() -> Self {
        Self {
            use_fixed_ri: true,
            fixed_ri: 1,
            sinr_threshold_1: 10.0,
            sinr_threshold_2: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UePhyStats {
    pub slots: u64,
    pub sl_slots: u64,
    pub dl_dcis: u64,
    pub ul_dcis: u64,
    pub mibs: u64,
    pub sib1s: u64,
    pub ul_ctrl_tx: u64,
    pub srs_tx: u64,
    pub ul_data_tx: u64,
    pub dl_harq_feedbacks: u64,
    pub dl_cqi_reports: u64,
    pub lbt_requests: u64,
    pub pscch_tx: u64,
    pub pssch_tx: u64,
    pub pscch_rx: u64,
    pub pssch_rx: u64,
    pub pdus_delivered: u64,
    /// RSRP of the last decoded PSCCH, dBm
    pub last_sl_rsrp_dbm: Option<f64>,
}

/// Retransmission announced by an SCI stage 1, received without a new SCI
#[derive(Debug, Clone)]
struct SlRxGrant {
    key: SlTbKey,
    expected: SlExpectedTb,
}

#[derive(Debug)]
pub struct UePhy {
    core: PhyCore,
    mac: Box<dyn UeMacSapUser>,
    cam: Box<dyn ChannelAccessManager>,

    rnti: Rnti,
    /// Node of the serving gNB, once registered
    serving_gnb: Option<NodeId>,
    pattern: Vec<TddSlotType>,

    current_slot: SfnSf,
    last_slot_start: SimTime,
    curr_slot_alloc: SlotAllocInfo,
    /// Control messages to transmit in the UL CTRL
    ctrl_msgs: Vec<ControlMessage>,

    channel_granted: bool,
    try_to_perform_lbt: bool,
    lbt_event: Option<EventId>,

    reception_enabled: bool,
    active_dl_streams: u8,
    harq_id_to_k1: HashMap<u8, u32>,
    dl_harq_info: Option<DlHarqInfo>,

    prev_dl_wb_cqi: Vec<u8>,
    dl_cqi_feedback_counter: u8,
    reported_ri2: bool,
    ri_config: RankIndicatorConfig,

    sl_current: VecDeque<SlVarTtiAllocInfo>,
    sl_rx_grants: VecDeque<SlRxGrant>,

    stats: UePhyStats,
}

impl UePhy {
    pub fn new(
        config: PhyConfig,
        node: NodeId,
        rnti: Rnti,
        bwp_id: BwpId,
        mac: Box<dyn UeMacSapUser>,
        cam: Box<dyn ChannelAccessManager>,
        seed: u64,
    ) -> Result<Self, LayerError> {
        let pattern = parse_pattern(&config.pattern)?;
        let core = PhyCore::new(config, node, CellId(0), bwp_id, DeviceRole::Ue, seed)?;
        let numerology = core.config().numerology;
        Ok(Self {
            core,
            mac,
            cam,
            rnti,
            serving_gnb: None,
            pattern,
            current_slot: SfnSf::new(0, 0, 0, numerology),
            last_slot_start: SimTime::ZERO,
            curr_slot_alloc: SlotAllocInfo::new(SfnSf::new(0, 0, 0, numerology)),
            ctrl_msgs: Vec::new(),
            channel_granted: false,
            try_to_perform_lbt: false,
            lbt_event: None,
            reception_enabled: false,
            active_dl_streams: 0,
            harq_id_to_k1: HashMap::new(),
            dl_harq_info: None,
            prev_dl_wb_cqi: Vec::new(),
            dl_cqi_feedback_counter: 0,
            reported_ri2: false,
            ri_config: RankIndicatorConfig::default(),
            sl_current: VecDeque::new(),
            sl_rx_grants: VecDeque::new(),
            stats: UePhyStats::default(),
        })
    }

    /// Validate `config` and install it with the pattern it carries. On
    /// error nothing changes.
    pub fn reconfigure(&mut self, config: PhyConfig) -> Result<(), LayerError> {
        config.validate()?;
        let pattern = parse_pattern(&config.pattern)?;
        if config.numerology != self.core.config().numerology {
            return Err(LayerError::InvalidConfiguration(
                "numerology cannot change at runtime".to_string(),
            ));
        }
        self.core.set_config(config)?;
        debug!("UE {} reconfigured, pattern {}", self.rnti, pattern_to_string(&pattern));
        self.pattern = pattern;
        Ok(())
    }

    /// Install the beam of every stream toward `peer`
    pub fn set_beam(&mut self, peer: NodeId, beam: BeamformingVector) {
        for phy in self.core.spectrum_phys_mut() {
            phy.beam_manager_mut().set_beam(peer, beam.clone());
        }
    }

    pub fn set_rank_indicator_config(&mut self, ri_config: RankIndicatorConfig) {
        self.ri_config = ri_config;
    }

    /// Attach to the cell of `gnb`. Data var-TTIs are beamed toward it.
    pub fn register_to_gnb(&mut self, cell_id: CellId, gnb: NodeId) {
        info!("UE {} (node {}) registered to cell {}", self.rnti, self.core.node(), cell_id.0);
        self.core.init_ctrl_queue();
        self.core.set_cell_id(cell_id);
        self.serving_gnb = Some(gnb);
    }

    pub fn core(&self) -> &PhyCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut PhyCore {
        &mut self.core
    }

    pub fn mac(&self) -> &dyn UeMacSapUser {
        self.mac.as_ref()
    }

    pub fn node(&self) -> NodeId {
        self.core.node()
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn cell_id(&self) -> CellId {
        self.core.cell_id()
    }

    pub fn pattern(&self) -> &[TddSlotType] {
        &self.pattern
    }

    pub fn current_slot(&self) -> SfnSf {
        self.current_slot
    }

    pub fn stats(&self) -> &UePhyStats {
        &self.stats
    }

    /// Future sidelink retransmissions this UE waits for
    pub fn pending_sl_rx_grants(&self) -> usize {
        self.sl_rx_grants.len()
    }

    fn schedule(&self, ctx: &mut SimContext, delay: SimTime, event: UeEvent) -> EventId {
        ctx.queue.schedule(
            delay,
            PhyEvent::Ue {
                node: self.core.node(),
                event,
            },
        )
    }

    pub fn start_event_loop(&mut self, ctx: &mut SimContext, start: SfnSf) {
        info!(
            "UE {} PHY starting at {}: {} RBs, pattern {}, {} stream(s)",
            self.rnti,
            start,
            self.core.config().num_rbs,
            pattern_to_string(&self.pattern),
            self.core.num_streams()
        );
        self.schedule(ctx, SimTime::ZERO, UeEvent::StartSlot(start));
    }

    pub fn handle_event(&mut self, ctx: &mut SimContext, event: UeEvent) {
        match event {
            UeEvent::StartSlot(sfn) => self.start_slot(ctx, sfn),
            UeEvent::StartVarTti(dci) => self.start_var_tti(ctx, dci),
            UeEvent::EndVarTti(dci) => self.end_var_tti(ctx, &dci),
            UeEvent::SendDataChannels { packets, duration } => {
                self.stats.ul_data_tx += 1;
                // UL data only goes through the first stream
                self.core.spectrum_mut(0).start_tx_data_frames(ctx, packets, Vec::new(), duration);
            }
            UeEvent::RequestAccess => self.request_access(ctx),
            UeEvent::SendCtrlMessageNow(msg) => self.core.enqueue_ctrl_msg_now(msg),
            UeEvent::DeliverPdu(packet) => {
                self.stats.pdus_delivered += 1;
                self.mac.receive_phy_pdu(packet);
            }
            UeEvent::DeliverPsschPdu(burst) => self.mac.receive_pssch_phy_pdu(burst),
            UeEvent::StartSlVarTti(info) => self.start_sl_var_tti(ctx, info),
            UeEvent::EndSlVarTti(info) => self.end_sl_var_tti(ctx, &info),
            UeEvent::SendSlDataChannels { packets, duration, info } => {
                self.core.set_sub_channels(&info.rbs(), 1);
                debug!("UE {} sending PSSCH in {}", self.rnti, self.current_slot);
                self.stats.pssch_tx += 1;
                self.core.spectrum_mut(0).start_tx_sl_data_frames(ctx, packets, duration);
            }
        }
    }

    pub fn receive_signal(
        &mut self,
        ctx: &mut SimContext,
        stream: u8,
        psd: SpectrumValue,
        frame: Arc<SignalFrame>,
    ) {
        self.core.spectrum_mut(stream).start_rx(ctx, psd, frame);
        self.process_indications(ctx);
    }

    pub fn handle_spectrum_timer(&mut self, ctx: &mut SimContext, stream: u8, timer: SpectrumTimer) {
        self.core.spectrum_mut(stream).handle_timer(ctx, timer);
        self.process_indications(ctx);
    }

    // ------------------------------------------------------------------------
    // Slot loop
    // ------------------------------------------------------------------------

    fn start_slot(&mut self, ctx: &mut SimContext, sfn: SfnSf) {
        self.current_slot = sfn;
        self.last_slot_start = ctx.now();
        self.stats.slots += 1;

        // The MAC goes first
        self.mac.slot_indication(sfn, &mut self.core);

        let nr_alloc_exists = self.core.slot_alloc_info_exists(sfn);
        let sl_alloc = self.core.take_sl_slot_alloc(sfn);

        // A TB expected in the previous slot and not received (we were
        // transmitting) is stale now
        for phy in self.core.spectrum_phys_mut() {
            phy.clear_expected_sl_tb();
        }
        self.send_sl_expected_tb_info(sfn);

        if let Some(sl_alloc) = sl_alloc {
            assert!(!nr_alloc_exists, "Can not start SL slot when there is UL allocation");
            self.start_sl_slot(ctx, sl_alloc.var_ttis);
            return;
        }

        self.curr_slot_alloc = self
            .core
            .retrieve_slot_alloc_info(sfn)
            .unwrap_or_else(|| SlotAllocInfo::new(sfn));
        self.push_ctrl_allocations(sfn);
        assert_eq!(self.curr_slot_alloc.sfn, sfn);

        debug!(
            "UE {} start slot {} with {} allocations",
            self.rnti,
            sfn,
            self.curr_slot_alloc.var_tti_alloc_info.len()
        );
        trace!("UE {} allocations: {}", self.rnti, self.curr_slot_alloc);

        self.try_to_perform_lbt(ctx);

        let msgs = self.core.pop_current_slot_ctrl_msgs();
        self.ctrl_msgs.extend(msgs);

        let Some(first) = self.curr_slot_alloc.var_tti_alloc_info.pop_front() else {
            return;
        };
        let start = self.core.symbol_period() * first.dci.sym_start as u64;
        self.schedule(ctx, start, UeEvent::StartVarTti(first.dci));
    }

    /// DL CTRL at the first symbol of DL-capable slots, UL CTRL at the last
    /// symbols of UL-capable slots
    fn push_ctrl_allocations(&mut self, sfn: SfnSf) {
        let config = self.core.config();
        let rbg_bitmask = vec![true; config.num_rbg()];
        let dl_ctrl = || {
            VarTtiAllocInfo::new(Arc::new(DciInfo::ctrl(
                0,
                config.dl_ctrl_symbols,
                DciFormat::Dl,
                VarTtiType::Ctrl,
                rbg_bitmask.clone(),
            )))
        };

        if self.pattern.is_empty() {
            trace!("UE {} pattern unknown, DL CTRL at the beginning of the slot", self.rnti);
            let alloc = dl_ctrl();
            self.curr_slot_alloc.var_tti_alloc_info.push_front(alloc);
            return;
        }

        let slot_type = self.pattern[sfn.pattern_position(self.pattern.len())];
        let mut front = None;
        let mut back = None;
        if slot_type < TddSlotType::Ul {
            front = Some(dl_ctrl());
        }
        if slot_type > TddSlotType::Dl {
            back = Some(VarTtiAllocInfo::new(Arc::new(DciInfo::ctrl(
                config.symbols_per_slot - config.ul_ctrl_symbols,
                config.ul_ctrl_symbols,
                DciFormat::Ul,
                VarTtiType::Ctrl,
                rbg_bitmask.clone(),
            ))));
        }
        if let Some(alloc) = front {
            self.curr_slot_alloc.var_tti_alloc_info.push_front(alloc);
        }
        if let Some(alloc) = back {
            self.curr_slot_alloc.var_tti_alloc_info.push_back(alloc);
        }
    }

    fn end_var_tti(&mut self, ctx: &mut SimContext, dci: &DciInfo) {
        trace!(
            "UE {} DCI started at symbol {} which lasted for {} symbols finished",
            self.rnti,
            dci.sym_start,
            dci.num_sym
        );

        if self.try_to_perform_lbt {
            self.try_to_perform_lbt(ctx);
            self.try_to_perform_lbt = false;
        }

        let now = ctx.now();
        match self.curr_slot_alloc.var_tti_alloc_info.pop_front() {
            None => {
                self.current_slot.add(1);
                let delay = (self.last_slot_start + self.core.slot_period()).saturating_sub(now);
                self.schedule(ctx, delay, UeEvent::StartSlot(self.current_slot));
            }
            Some(next) => {
                let start = self.last_slot_start + self.core.symbols(next.dci.sym_start);
                self.schedule(ctx, start.saturating_sub(now), UeEvent::StartVarTti(next.dci));
            }
        }

        self.reception_enabled = false;
    }

    fn start_var_tti(&mut self, ctx: &mut SimContext, dci: Arc<DciInfo>) {
        self.reception_enabled = false;

        let period = match (dci.var_tti_type, dci.format) {
            (VarTtiType::Ctrl, DciFormat::Dl) => self.dl_ctrl(ctx, &dci),
            (VarTtiType::Ctrl, DciFormat::Ul) => self.ul_ctrl(ctx, &dci),
            (VarTtiType::Srs, DciFormat::Ul) => self.ul_srs(ctx, &dci),
            (VarTtiType::Data, DciFormat::Dl) => self.dl_data(ctx, &dci),
            (VarTtiType::Data, DciFormat::Ul) => self.ul_data(ctx, &dci),
            (VarTtiType::Srs, DciFormat::Dl) => panic!("SRS allocation must be in the uplink"),
        };

        self.schedule(ctx, period, UeEvent::EndVarTti(dci));
    }

    fn quasi_omni(&mut self, ctx: &mut SimContext) {
        for stream in 0..self.core.num_streams() as u8 {
            self.core.spectrum_mut(stream).change_to_quasi_omni(ctx);
        }
    }

    fn beam_to_serving_gnb(&mut self, ctx: &mut SimContext) {
        let Some(gnb) = self.serving_gnb else {
            return;
        };
        for stream in 0..self.core.num_streams() as u8 {
            self.core.spectrum_mut(stream).change_beam(ctx, gnb);
        }
    }

    fn dl_ctrl(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        self.quasi_omni(ctx);
        let period = self.core.symbols(dci.num_sym);
        trace!(
            "UE {} RXing DL CTRL frame symbols {}-{}",
            self.rnti,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        self.try_to_perform_lbt = true;
        period
    }

    fn ul_ctrl(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        self.quasi_omni(ctx);
        let period = self.core.symbols(dci.num_sym);

        if self.ctrl_msgs.is_empty() {
            trace!("UE {} reserved space for UL CTRL but nothing to transmit", self.rnti);
            self.cam.cancel();
            self.channel_granted = false;
            return period;
        }
        if !self.channel_granted {
            debug!("UE {} has to transmit CTRL but channel not granted", self.rnti);
            self.cam.cancel();
            return period;
        }

        for msg in &self.ctrl_msgs {
            if let ControlMessage::DlHarq(info) = msg {
                if let Some(k1) = self.harq_id_to_k1.get(&info.harq_process_id) {
                    trace!(
                        "UE {} TXing DL HARQ feedback of process {} (k1 {})",
                        self.rnti,
                        info.harq_process_id,
                        k1
                    );
                }
            }
        }

        let full_bw = self.core.full_bandwidth_rbs();
        // UL control only goes through the first stream
        self.core.set_sub_channels(&full_bw, 1);
        debug!(
            "UE {} TXing UL CTRL frame with {} msgs, symbols {}-{}",
            self.rnti,
            self.ctrl_msgs.len(),
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        let msgs = std::mem::take(&mut self.ctrl_msgs);
        self.stats.ul_ctrl_tx += 1;
        self.core
            .spectrum_mut(0)
            .start_tx_ul_control_frames(ctx, msgs, period.saturating_sub(SimTime::from_nanos(1)));

        self.channel_granted = false;
        period
    }

    fn ul_srs(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        self.beam_to_serving_gnb(ctx);
        let period = self.core.symbols(dci.num_sym);
        let full_bw = self.core.full_bandwidth_rbs();
        let streams = self.core.num_streams() as u8;

        // SRS is the only uplink transmission over every stream
        self.core.set_sub_channels(&full_bw, streams);
        for stream in 0..streams {
            let msgs = vec![ControlMessage::Srs { rnti: self.rnti }];
            self.core
                .spectrum_mut(stream)
                .start_tx_ul_control_frames(ctx, msgs, period.saturating_sub(SimTime::from_nanos(1)));
        }
        self.stats.srs_tx += 1;
        debug!(
            "UE {} TXing UL SRS frame symbols {}-{}",
            self.rnti,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );

        self.channel_granted = false;
        period
    }

    fn dl_data(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        self.beam_to_serving_gnb(ctx);
        self.reception_enabled = true;
        let period = self.core.symbols(dci.num_sym);
        let rb_bitmap = self.core.rbg_to_rbs(&dci.rbg_bitmask);

        self.active_dl_streams = 0;
        for (stream, &tb_size) in dci.tb_size.iter().enumerate() {
            if tb_size == 0 {
                continue;
            }
            assert!(
                stream < self.core.num_streams(),
                "DCI schedules stream {} but the UE has {} streams",
                stream,
                self.core.num_streams()
            );
            self.active_dl_streams += 1;
            let expected = ExpectedTb {
                ndi: dci.ndi.get(stream).copied().unwrap_or(1),
                tb_size,
                mcs: dci.mcs.get(stream).copied().unwrap_or(0),
                rb_bitmap: rb_bitmap.clone(),
                harq_process_id: dci.harq_process,
                rv: dci.rv.get(stream).copied().unwrap_or(0),
                is_downlink: true,
                sym_start: dci.sym_start,
                num_sym: dci.num_sym,
                sfn: self.current_slot,
            };
            self.core.spectrum_mut(stream as u8).add_expected_tb(dci.rnti, expected);
            debug!(
                "UE {} stream {} RXing DL DATA frame symbols {}-{}, {} RBs",
                self.rnti,
                stream,
                dci.sym_start,
                dci.sym_start + dci.num_sym - 1,
                rb_bitmap.len()
            );
        }
        period
    }

    fn ul_data(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        self.beam_to_serving_gnb(ctx);
        let rbs = self.core.rbg_to_rbs(&dci.rbg_bitmask);
        // UL data is single stream
        self.core.set_sub_channels(&rbs, 1);
        let period = self.core.symbols(dci.num_sym);

        let packets = self
            .core
            .take_packet_burst(self.current_slot, dci.sym_start, 0)
            .filter(|burst| !burst.is_empty());
        let Some(packets) = packets else {
            panic!("The UE {} has been scheduled without data", dci.rnti);
        };
        if packets[0].bearer.is_none() {
            panic!("No radio bearer tag");
        }

        debug!(
            "UE {} TXing UL DATA frame symbols {}-{}",
            self.rnti,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        self.schedule(
            ctx,
            SimTime::from_nanos(1),
            UeEvent::SendDataChannels {
                packets,
                duration: period.saturating_sub(SimTime::from_nanos(2)),
            },
        );
        period
    }

    // ------------------------------------------------------------------------
    // Channel access for the UL CTRL
    // ------------------------------------------------------------------------

    /// A data var-TTI ending close enough to the UL CTRL shares its channel
    /// occupancy; otherwise an access request is scheduled right before it.
    fn try_to_perform_lbt(&mut self, ctx: &mut SimContext) {
        let ul_ctrl = self
            .curr_slot_alloc
            .var_tti_alloc_info
            .iter()
            .find(|a| a.dci.var_tti_type == VarTtiType::Ctrl && a.dci.format == DciFormat::Ul)
            .map(|a| (a.dci.sym_start, a.dci.num_sym));

        let Some((ul_ctrl_start, _)) = ul_ctrl else {
            trace!("UE {} no UL CTRL in this slot, no LBT", self.rnti);
            return;
        };

        let symbols_per_slot = self.core.config().symbols_per_slot;
        let limit = (self.last_slot_start + self.core.slot_period())
            .saturating_sub(self.core.symbols(symbols_per_slot - ul_ctrl_start))
            .saturating_sub(self.core.config().lbt_threshold_for_ctrl());

        for alloc in &self.curr_slot_alloc.var_tti_alloc_info {
            if alloc.dci.var_tti_type != VarTtiType::Data {
                continue;
            }
            let ends_at = self.last_slot_start + self.core.symbols(alloc.dci.sym_start + alloc.dci.num_sym);
            if limit < ends_at {
                trace!(
                    "UE {} data ends at {}, inside the shared occupancy (limit {}): no LBT",
                    self.rnti,
                    ends_at,
                    limit
                );
                if let Some(id) = self.lbt_event.take() {
                    ctx.queue.cancel(id);
                }
                self.channel_granted = true;
            }
        }

        if self.channel_granted {
            trace!("UE {} channel already granted, no LBT", self.rnti);
            return;
        }

        let at = (self.last_slot_start + self.core.symbols(ul_ctrl_start))
            .saturating_sub(self.core.config().lbt_threshold_for_ctrl());
        let delay = at.saturating_sub(ctx.now());
        trace!("UE {} LBT for the UL CTRL at {}", self.rnti, at);
        if let Some(id) = self.lbt_event.take() {
            ctx.queue.cancel(id);
        }
        self.lbt_event = Some(self.schedule(ctx, delay, UeEvent::RequestAccess));
    }

    fn request_access(&mut self, ctx: &mut SimContext) {
        self.lbt_event = None;
        self.stats.lbt_requests += 1;
        trace!("UE {} requesting access for the UL CTRL", self.rnti);
        match self.cam.request_access(ctx.now()) {
            // Valid until the end of the slot
            AccessResponse::Granted(_) => self.channel_granted = true,
            AccessResponse::Denied => self.channel_granted = false,
            AccessResponse::Pending => {}
        }
    }

    // ------------------------------------------------------------------------
    // Control messages from the gNB
    // ------------------------------------------------------------------------

    fn insert_allocation(&mut self, dci: Arc<DciInfo>) {
        self.curr_slot_alloc.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(dci));
        self.curr_slot_alloc.sort();
    }

    fn insert_future_allocation(&mut self, sfn: SfnSf, dci: Arc<DciInfo>) {
        if let Some(slot) = self.core.peek_slot_alloc_info_mut(sfn) {
            slot.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(dci));
            slot.sort();
            return;
        }
        let mut slot = SlotAllocInfo::new(sfn);
        slot.var_tti_alloc_info.push_back(VarTtiAllocInfo::new(dci));
        self.core.push_back_slot_alloc_info(slot);
    }

    fn insert_at(&mut self, sfn: SfnSf, dci: Arc<DciInfo>) {
        if sfn == self.current_slot {
            self.insert_allocation(dci);
        } else {
            self.insert_future_allocation(sfn, dci);
        }
    }

    fn is_for_me(&self, dci: &DciInfo) -> bool {
        dci.rnti == Rnti::BROADCAST || dci.rnti == self.rnti
    }

    fn phy_ctrl_message_received(&mut self, msg: ControlMessage) {
        match &msg {
            ControlMessage::DlDci { dci, k0, k1 } => {
                if !self.is_for_me(dci) {
                    return;
                }
                let dci_sfn = self.current_slot.future(*k0);
                debug!(
                    "UE {} DL-DCI received for slot {} symStart {} numSym {} tbs {:?} harqId {}",
                    self.rnti,
                    dci_sfn,
                    dci.sym_start,
                    dci.num_sym,
                    dci.tb_size,
                    dci.harq_process
                );
                self.stats.dl_dcis += 1;
                self.harq_id_to_k1.insert(dci.harq_process, *k1);
                self.insert_at(dci_sfn, Arc::clone(dci));
                self.mac.receive_control_message(msg, &mut self.core);
            }
            ControlMessage::UlDci { dci, k2 } => {
                if !self.is_for_me(dci) {
                    return;
                }
                let ul_sfn = self.current_slot.future(*k2);
                self.stats.ul_dcis += 1;
                let kind = dci.var_tti_type;
                match kind {
                    VarTtiType::Data => {
                        debug!(
                            "UE {} UL-DCI received for slot {} symStart {} numSym {} tbs {:?} harqId {}",
                            self.rnti,
                            ul_sfn,
                            dci.sym_start,
                            dci.num_sym,
                            dci.tb_size,
                            dci.harq_process
                        );
                        self.insert_at(ul_sfn, Arc::clone(dci));
                        self.mac.receive_control_message(msg, &mut self.core);
                    }
                    // The MAC does not see SRS grants
                    VarTtiType::Srs => self.insert_at(ul_sfn, Arc::clone(dci)),
                    VarTtiType::Ctrl => warn!("UE {} UL DCI for a control var-TTI ignored", self.rnti),
                }
            }
            ControlMessage::Mib { system_frame_number, num_rbs } => {
                info!(
                    "UE {} received MIB: sfn {} bandwidth {} RBs",
                    self.rnti, system_frame_number, num_rbs
                );
                self.stats.mibs += 1;
            }
            ControlMessage::Sib1 { cell_id } => {
                info!("UE {} received SIB1 of cell {}", self.rnti, cell_id.0);
                self.stats.sib1s += 1;
            }
            _ => {
                trace!("UE {} passing {} to the MAC", self.rnti, msg.name());
                self.mac.receive_control_message(msg, &mut self.core);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------------

    fn notify_dl_harq_feedback(&mut self, ctx: &mut SimContext, stream: u8, status: HarqStatus, harq_id: u8, rv: u8) {
        let num_streams = self.core.num_streams();
        let rnti = self.rnti;
        let bwp_index = self.core.bwp_id();
        let info = self.dl_harq_info.get_or_insert_with(|| DlHarqInfo {
            rnti,
            harq_process_id: harq_id,
            bwp_index,
            harq_status: vec![HarqStatus::None; num_streams],
            num_retx: vec![u8::MAX; num_streams],
        });
        assert_eq!(info.harq_process_id, harq_id, "DL HARQ feedback of two processes mixed");
        let index = stream as usize;
        assert!(
            index < info.harq_status.len() && info.harq_status[index] == HarqStatus::None,
            "Duplicated DL HARQ feedback for stream {}",
            stream
        );
        info.harq_status[index] = status;
        info.num_retx[index] = rv;

        let received = info.harq_status.iter().filter(|s| **s != HarqStatus::None).count();
        if received == self.active_dl_streams as usize {
            if let Some(info) = self.dl_harq_info.take() {
                self.enqueue_dl_harq_feedback(ctx, info);
            }
        }
    }

    /// Send the feedback in the slot K1 slots after the data
    fn enqueue_dl_harq_feedback(&mut self, ctx: &mut SimContext, info: DlHarqInfo) {
        let Some(&k1) = self.harq_id_to_k1.get(&info.harq_process_id) else {
            panic!("No K1 known for HARQ process {}", info.harq_process_id);
        };
        debug!(
            "UE {} DL HARQ feedback of process {} with K1 {} in {}",
            self.rnti, info.harq_process_id, k1, self.current_slot
        );
        self.stats.dl_harq_feedbacks += 1;
        let at = self.last_slot_start + self.core.slot_period() * k1 as u64;
        let delay = at.saturating_sub(ctx.now());
        self.schedule(ctx, delay, UeEvent::SendCtrlMessageNow(ControlMessage::DlHarq(info)));
    }

    fn generate_dl_cqi_report(&mut self, sinr: &SpectrumValue, stream: u8) {
        if self.serving_gnb.is_none() || self.rnti == Rnti::BROADCAST || !self.reception_enabled {
            return;
        }

        let num_streams = self.core.num_streams();
        if self.prev_dl_wb_cqi.is_empty() {
            // CQI 0 until measured, the scheduler uses MCS 0 for it
            self.prev_dl_wb_cqi = vec![0; num_streams];
            self.reported_ri2 = false;
        }

        let wb_cqi = wideband_cqi(sinr);
        let avg_sinr_db = linear_to_db(sinr.mean());
        let mut avg_sinr = vec![None; num_streams];
        avg_sinr[stream as usize] = Some(avg_sinr_db);
        self.prev_dl_wb_cqi[stream as usize] = wb_cqi;
        debug!("UE {} stream {} WB CQI {} avg SINR {:.2} dB", self.rnti, stream, wb_cqi, avg_sinr_db);

        self.dl_cqi_feedback_counter += 1;
        if self.dl_cqi_feedback_counter != self.active_dl_streams {
            return;
        }

        let ri = if num_streams == 1 { 1 } else { self.select_ri(&avg_sinr) };
        let cqi = DlCqiInfo {
            rnti: self.rnti,
            ri,
            wb_cqi: self.prev_dl_wb_cqi.clone(),
        };
        assert!(
            ri as usize <= cqi.wb_cqi.len(),
            "Mismatch between the RI and the number of CQIs in a CQI report"
        );
        self.stats.dl_cqi_reports += 1;
        self.core.enqueue_ctrl_msg(ControlMessage::DlCqi(cqi));
        self.dl_cqi_feedback_counter = 0;
    }

    /// Rank indicator from the average SINR (dB) of the streams measured
    /// in this report
    fn select_ri(&mut self, avg_sinr: &[Option<f64>]) -> u8 {
        let config = &self.ri_config;
        if config.use_fixed_ri {
            return config.fixed_ri;
        }

        if !self.reported_ri2 {
            return match avg_sinr.first().copied().flatten() {
                Some(sinr) if sinr > config.sinr_threshold_1 => {
                    self.reported_ri2 = true;
                    2
                }
                _ => 1,
            };
        }

        let measured: Vec<f64> = avg_sinr.iter().flatten().copied().collect();
        assert!(!measured.is_empty(), "Unable to find valid average SINR");
        if measured.len() == avg_sinr.len() {
            if measured.iter().all(|&sinr| sinr > config.sinr_threshold_2) {
                2
            } else {
                1
            }
        } else if measured[0] > config.sinr_threshold_1 {
            // One stream could not be measured: do not get stuck on one stream
            2
        } else {
            1
        }
    }

    // ------------------------------------------------------------------------
    // Sidelink
    // ------------------------------------------------------------------------

    fn start_sl_slot(&mut self, ctx: &mut SimContext, var_ttis: Vec<SlVarTtiAllocInfo>) {
        self.stats.sl_slots += 1;
        self.sl_current = var_ttis.into();
        let Some(first) = self.sl_current.pop_front() else {
            panic!("Unable to find NR SL slot allocation");
        };
        let start = self.core.symbols(first.sym_start);
        self.schedule(ctx, start, UeEvent::StartSlVarTti(first));
    }

    fn start_sl_var_tti(&mut self, ctx: &mut SimContext, info: SlVarTtiAllocInfo) {
        self.quasi_omni(ctx);
        let period = match info.kind {
            SlVarTtiType::Ctrl => self.sl_ctrl(ctx, &info),
            SlVarTtiType::Data => self.sl_data(ctx, info),
        };
        self.schedule(ctx, period, UeEvent::EndSlVarTti(info));
    }

    fn end_sl_var_tti(&mut self, ctx: &mut SimContext, info: &SlVarTtiAllocInfo) {
        trace!(
            "UE {} SL var-TTI started at symbol {} which lasted for {} symbols finished",
            self.rnti,
            info.sym_start,
            info.sym_length
        );
        let now = ctx.now();
        match self.sl_current.pop_front() {
            None => {
                self.current_slot.add(1);
                let delay = (self.last_slot_start + self.core.slot_period()).saturating_sub(now);
                self.schedule(ctx, delay, UeEvent::StartSlot(self.current_slot));
            }
            Some(next) => {
                let start = self.last_slot_start + self.core.symbols(next.sym_start);
                self.schedule(ctx, start.saturating_sub(now), UeEvent::StartSlVarTti(next));
            }
        }
    }

    fn sl_ctrl(&mut self, ctx: &mut SimContext, info: &SlVarTtiAllocInfo) -> SimTime {
        let burst = self.core.pop_pscch_burst().filter(|b| !b.is_empty());
        let Some(burst) = burst else {
            panic!("No NR SL CTRL packet to transmit");
        };
        let period = self.core.symbols(info.sym_length);
        self.core.set_sub_channels(&info.rbs(), 1);
        debug!("UE {} sending PSCCH in {}", self.rnti, self.current_slot);
        self.stats.pscch_tx += 1;
        // Ends 1 ns early so that control never overlaps the data
        self.core
            .spectrum_mut(0)
            .start_tx_sl_ctrl_frames(ctx, burst, period.saturating_sub(SimTime::from_nanos(1)));
        period
    }

    fn sl_data(&mut self, ctx: &mut SimContext, info: SlVarTtiAllocInfo) -> SimTime {
        let period = self.core.symbols(info.sym_length);
        let burst = self.core.pop_pssch_burst().filter(|b| !b.is_empty());
        let Some(packets) = burst else {
            panic!("The UE {} has been scheduled without NR SL data", self.rnti);
        };
        debug!(
            "UE {} TXing NR SL DATA frame symbols {}-{}",
            self.rnti,
            info.sym_start,
            info.sym_start + info.sym_length - 1
        );
        self.schedule(
            ctx,
            SimTime::from_nanos(1),
            UeEvent::SendSlDataChannels {
                packets,
                duration: period.saturating_sub(SimTime::from_nanos(2)),
                info,
            },
        );
        period
    }

    fn sl_rbs(&self, sb_ch_start: u8, sb_ch_length: u8) -> Vec<usize> {
        let size = self.core.config().sl_sub_channel_size as usize;
        let rb_start = sb_ch_start as usize * size;
        (rb_start..rb_start + sb_ch_length as usize * size).collect()
    }

    fn phy_pscch_pdu_received(&mut self, packet: &Packet, psd: &SpectrumValue) {
        let Some(sci) = packet.sci_f1a().copied() else {
            panic!("PSCCH packet without SCI stage 1");
        };
        let Some(tag) = packet.sl_tag else {
            panic!("Did not find sidelink MAC PDU tag on PSCCH packet");
        };
        self.stats.pscch_rx += 1;

        let rsrp_dbm = sidelink_rsrp_dbm(psd);
        self.stats.last_sl_rsrp_dbm = Some(rsrp_dbm);
        debug!("UE {} sensing data to the MAC, RSRP {:.2} dBm in {}", self.rnti, rsrp_dbm, self.current_slot);

        self.mac.receive_sensing_data(SensingData {
            sfn: self.current_slot,
            rsvp: sci.sl_resource_reserve_period,
            sb_ch_length: sci.length_sub_channel,
            sb_ch_start: sci.index_start_sub_channel,
            prio: sci.priority,
            sl_rsrp: rsrp_dbm,
            gap_retx1: sci.gap_retx1,
            sb_ch_start_retx1: sci.index_start_sb_ch_retx1,
            gap_retx2: sci.gap_retx2,
            sb_ch_start_retx2: sci.index_start_sb_ch_retx2,
        });

        if !self.mac.sl_rx_destinations().contains(&tag.dst_l2_id) {
            debug!(
                "UE {} ignoring PSCCH: destination {} is not monitored",
                self.rnti, tag.dst_l2_id
            );
            return;
        }

        info!(
            "UE {} received first stage SCI for destination {} from {}",
            self.rnti, tag.dst_l2_id, tag.rnti
        );
        let key = SlTbKey {
            rnti: tag.rnti,
            dst_l2_id: tag.dst_l2_id,
        };
        let expected = self.sl_expected_tb(&tag, &sci, sci.index_start_sub_channel, tag.sfn);
        // PSSCH goes through the first stream
        self.core.spectrum_mut(0).add_sl_expected_tb(key, expected);
        self.save_future_sl_rx_grants(key, &tag, &sci);
    }

    fn sl_expected_tb(&self, tag: &SlMacPduTag, sci: &SciF1aHeader, sb_ch_start: u8, sfn: SfnSf) -> SlExpectedTb {
        SlExpectedTb {
            tb_size: tag.tb_size,
            mcs: sci.mcs,
            rb_bitmap: self.sl_rbs(sb_ch_start, sci.length_sub_channel),
            sym_start: tag.sym_start,
            num_sym: tag.num_sym,
            sfn,
        }
    }

    fn save_future_sl_rx_grants(&mut self, key: SlTbKey, tag: &SlMacPduTag, sci: &SciF1aHeader) {
        let retx = [
            (sci.gap_retx1, sci.index_start_sb_ch_retx1),
            (sci.gap_retx2, sci.index_start_sb_ch_retx2),
        ];
        for (gap, sb_ch_start) in retx {
            if gap == SciF1aHeader::NO_RETX {
                continue;
            }
            let sfn = tag.sfn.future(gap as u32);
            let grant = SlRxGrant {
                key,
                expected: self.sl_expected_tb(tag, sci, sb_ch_start, sfn),
            };
            let pos = self.sl_rx_grants.partition_point(|g| g.expected.sfn <= sfn);
            self.sl_rx_grants.insert(pos, grant);
        }
        debug!("UE {} expecting {} future PSSCH without SCI 1-A", self.rnti, self.sl_rx_grants.len());
    }

    /// Register the retransmissions due in `sfn`
    fn send_sl_expected_tb_info(&mut self, sfn: SfnSf) {
        while let Some(front) = self.sl_rx_grants.front() {
            if front.expected.sfn > sfn {
                break;
            }
            let Some(grant) = self.sl_rx_grants.pop_front() else {
                break;
            };
            if grant.expected.sfn < sfn {
                debug!("UE {} SL retransmission grant for {} expired", self.rnti, grant.expected.sfn);
                continue;
            }
            self.core.spectrum_mut(0).add_sl_expected_tb(grant.key, grant.expected);
        }
    }

    // ------------------------------------------------------------------------
    // Upward path
    // ------------------------------------------------------------------------

    fn process_indications(&mut self, ctx: &mut SimContext) {
        for stream in 0..self.core.num_streams() as u8 {
            for indication in self.core.spectrum_mut(stream).take_indications() {
                self.handle_indication(ctx, stream, indication);
            }
        }
    }

    fn handle_indication(&mut self, ctx: &mut SimContext, stream: u8, indication: PhyIndication) {
        match indication {
            PhyIndication::DataReceived(packet) => {
                let latency = self.core.config().tb_decode_latency();
                self.schedule(ctx, latency, UeEvent::DeliverPdu(packet));
            }
            PhyIndication::CtrlMessages { msgs, .. } => {
                for msg in msgs {
                    self.phy_ctrl_message_received(msg);
                }
            }
            PhyIndication::DlHarqFeedback {
                stream,
                status,
                harq_id,
                rv,
                ..
            } => self.notify_dl_harq_feedback(ctx, stream, status, harq_id, rv),
            PhyIndication::DataSinr(sinr) => self.generate_dl_cqi_report(&sinr, stream),
            PhyIndication::DlCtrlSinr(sinr) => {
                let used: Vec<f64> = sinr.values().iter().copied().filter(|v| *v != 0.0).collect();
                if !used.is_empty() {
                    let avg = used.iter().sum::<f64>() / used.len() as f64;
                    trace!("UE {} DL CTRL SINR {:.2} dB", self.rnti, linear_to_db(avg));
                }
            }
            PhyIndication::PscchReceived { packet, psd } => self.phy_pscch_pdu_received(&packet, &psd),
            PhyIndication::PsschReceived(PsschRxInfo { burst, sinr_db, .. }) => {
                self.stats.pssch_rx += 1;
                trace!("UE {} PSSCH received, SINR {:.2} dB", self.rnti, sinr_db);
                let latency = self.core.config().tb_decode_latency();
                self.schedule(ctx, latency, UeEvent::DeliverPsschPdu(burst));
            }
            other => trace!("UE {} ignoring {:?}", self.rnti, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{PhySapProvider, UeMacStats};
    use crate::phy::cam::AlwaysOnAccessManager;
    use crate::phy::frame::{PacketHeader, RadioBearerTag};
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct MacLog {
        slots: Vec<SfnSf>,
        ctrl: Vec<ControlMessage>,
        sensing: Vec<SensingData>,
    }

    #[derive(Debug)]
    struct TestMac {
        log: Rc<RefCell<MacLog>>,
        destinations: HashSet<u32>,
    }

    impl UeMacSapUser for TestMac {
        fn slot_indication(&mut self, sfn: SfnSf, _phy: &mut dyn PhySapProvider) {
            self.log.borrow_mut().slots.push(sfn);
        }

        fn receive_phy_pdu(&mut self, _packet: Packet) {}

        fn receive_control_message(&mut self, msg: ControlMessage, _phy: &mut dyn PhySapProvider) {
            self.log.borrow_mut().ctrl.push(msg);
        }

        fn sl_rx_destinations(&self) -> HashSet<u32> {
            self.destinations.clone()
        }

        fn receive_sensing_data(&mut self, data: SensingData) {
            self.log.borrow_mut().sensing.push(data);
        }

        fn receive_pssch_phy_pdu(&mut self, _burst: PacketBurst) {}

        fn stats(&self) -> UeMacStats {
            UeMacStats::default()
        }
    }

    fn ue_with(config: PhyConfig, destinations: &[u32]) -> (UePhy, Rc<RefCell<MacLog>>) {
        let log = Rc::new(RefCell::new(MacLog::default()));
        let mac = TestMac {
            log: Rc::clone(&log),
            destinations: destinations.iter().copied().collect(),
        };
        let cam = Box::new(AlwaysOnAccessManager::default());
        let mut phy = UePhy::new(config, NodeId(10), Rnti(3), BwpId(0), Box::new(mac), cam, 7).unwrap();
        phy.register_to_gnb(CellId(1), NodeId(1));
        (phy, log)
    }

    fn ue(pattern: &str) -> (UePhy, Rc<RefCell<MacLog>>) {
        let config = PhyConfig {
            pattern: pattern.to_string(),
            ..PhyConfig::default()
        };
        ue_with(config, &[])
    }

    fn data_dci(rnti: u16, format: DciFormat, sym_start: u8, num_sym: u8, harq: u8) -> Arc<DciInfo> {
        let mut dci = DciInfo::ctrl(sym_start, num_sym, format, VarTtiType::Data, vec![true; 52]);
        dci.rnti = Rnti(rnti);
        dci.tb_size = vec![100];
        dci.mcs = vec![5];
        dci.ndi = vec![1];
        dci.rv = vec![0];
        dci.harq_process = harq;
        Arc::new(dci)
    }

    fn types_of(alloc: &SlotAllocInfo) -> Vec<(VarTtiType, DciFormat, u8)> {
        alloc
            .var_tti_alloc_info
            .iter()
            .map(|a| (a.dci.var_tti_type, a.dci.format, a.dci.sym_start))
            .collect()
    }

    #[test]
    fn test_ctrl_allocations_follow_pattern() {
        let (mut phy, _log) = ue("DL|S|UL|F|");
        let expected = [
            vec![(VarTtiType::Ctrl, DciFormat::Dl, 0)],
            vec![(VarTtiType::Ctrl, DciFormat::Dl, 0), (VarTtiType::Ctrl, DciFormat::Ul, 13)],
            vec![(VarTtiType::Ctrl, DciFormat::Ul, 13)],
            vec![(VarTtiType::Ctrl, DciFormat::Dl, 0), (VarTtiType::Ctrl, DciFormat::Ul, 13)],
        ];
        for (slot, want) in expected.iter().enumerate() {
            let sfn = SfnSf::new(0, 0, slot as u16, 1);
            phy.curr_slot_alloc = SlotAllocInfo::new(sfn);
            phy.push_ctrl_allocations(sfn);
            assert_eq!(&types_of(&phy.curr_slot_alloc), want, "slot {}", slot);
        }
    }

    #[test]
    fn test_dl_dci_filtering_and_k1() {
        let (mut phy, log) = ue("F|F|F|F|");
        phy.curr_slot_alloc = SlotAllocInfo::new(phy.current_slot);

        let other = ControlMessage::DlDci {
            dci: data_dci(9, DciFormat::Dl, 1, 12, 4),
            k0: 0,
            k1: 2,
        };
        phy.phy_ctrl_message_received(other);
        assert!(phy.curr_slot_alloc.var_tti_alloc_info.is_empty());
        assert!(log.borrow().ctrl.is_empty());

        let mine = ControlMessage::DlDci {
            dci: data_dci(3, DciFormat::Dl, 1, 12, 4),
            k0: 0,
            k1: 3,
        };
        phy.phy_ctrl_message_received(mine);
        assert_eq!(phy.curr_slot_alloc.var_tti_alloc_info.len(), 1);
        assert_eq!(phy.harq_id_to_k1.get(&4), Some(&3));
        assert_eq!(log.borrow().ctrl.len(), 1);
        assert_eq!(phy.stats().dl_dcis, 1);
    }

    #[test]
    fn test_ul_dci_goes_to_future_slot() {
        let (mut phy, log) = ue("F|F|F|F|");
        let now = phy.current_slot;

        phy.phy_ctrl_message_received(ControlMessage::UlDci {
            dci: data_dci(3, DciFormat::Ul, 1, 12, 0),
            k2: 2,
        });
        let mut srs = DciInfo::ctrl(12, 1, DciFormat::Ul, VarTtiType::Srs, vec![true; 52]);
        srs.rnti = Rnti(3);
        phy.phy_ctrl_message_received(ControlMessage::UlDci {
            dci: Arc::new(srs),
            k2: 2,
        });

        let Some(slot) = phy.core().peek_slot_alloc_info(now.future(2)) else {
            panic!("no allocation for the UL slot");
        };
        assert_eq!(slot.var_tti_alloc_info.len(), 2);
        assert_eq!(slot.var_tti_alloc_info[0].dci.var_tti_type, VarTtiType::Data);
        assert_eq!(slot.var_tti_alloc_info[1].dci.var_tti_type, VarTtiType::Srs);
        // The SRS grant stays in the PHY
        assert_eq!(log.borrow().ctrl.len(), 1);
    }

    #[test]
    fn test_dl_harq_feedback_aggregated_over_streams() {
        let config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        let (mut phy, _log) = ue_with(config, &[]);
        let mut ctx = SimContext::detached();
        phy.harq_id_to_k1.insert(5, 2);
        phy.active_dl_streams = 2;

        phy.notify_dl_harq_feedback(&mut ctx, 0, HarqStatus::Ack, 5, 0);
        assert!(ctx.queue.is_empty());
        phy.notify_dl_harq_feedback(&mut ctx, 1, HarqStatus::Nack, 5, 1);
        assert_eq!(ctx.queue.len(), 1);

        let Some((time, PhyEvent::Ue { event: UeEvent::SendCtrlMessageNow(msg), .. })) = ctx.queue.pop() else {
            panic!("expected the HARQ feedback event");
        };
        assert_eq!(time, phy.core().slot_period() * 2);
        let ControlMessage::DlHarq(info) = msg else {
            panic!("expected DL HARQ");
        };
        assert_eq!(info.harq_status, vec![HarqStatus::Ack, HarqStatus::Nack]);
        assert_eq!(info.num_retx, vec![0, 1]);
        assert!(!info.is_received_ok());
        assert!(phy.dl_harq_info.is_none());
    }

    #[test]
    #[should_panic(expected = "Duplicated DL HARQ feedback")]
    fn test_duplicated_harq_feedback_panics() {
        let config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        let (mut phy, _log) = ue_with(config, &[]);
        let mut ctx = SimContext::detached();
        phy.harq_id_to_k1.insert(1, 2);
        phy.active_dl_streams = 2;
        phy.notify_dl_harq_feedback(&mut ctx, 0, HarqStatus::Ack, 1, 0);
        phy.notify_dl_harq_feedback(&mut ctx, 0, HarqStatus::Ack, 1, 0);
    }

    #[test]
    fn test_cqi_only_while_receiving_data() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let sinr = SpectrumValue::from_values(vec![100.0; 52], 360e3);

        phy.active_dl_streams = 1;
        phy.generate_dl_cqi_report(&sinr, 0);
        assert_eq!(phy.stats().dl_cqi_reports, 0);

        phy.reception_enabled = true;
        phy.generate_dl_cqi_report(&sinr, 0);
        assert_eq!(phy.stats().dl_cqi_reports, 1);

        let l1l2 = phy.core().config().l1l2_ctrl_latency;
        let msgs: Vec<ControlMessage> = (0..=l1l2)
            .flat_map(|_| phy.core_mut().pop_current_slot_ctrl_msgs())
            .collect();
        let Some(ControlMessage::DlCqi(cqi)) = msgs.first() else {
            panic!("expected a DL CQI");
        };
        assert_eq!(cqi.ri, 1);
        assert_eq!(cqi.wb_cqi, vec![wideband_cqi(&sinr)]);
    }

    #[test]
    fn test_adaptive_rank_indicator() {
        let config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        let (mut phy, _log) = ue_with(config, &[]);
        phy.set_rank_indicator_config(RankIndicatorConfig {
            use_fixed_ri: false,
            ..RankIndicatorConfig::default()
        });

        assert_eq!(phy.select_ri(&[Some(5.0), None]), 1);
        assert_eq!(phy.select_ri(&[Some(12.0), None]), 2);
        // Once on two streams, both must stay above the second threshold
        assert_eq!(phy.select_ri(&[Some(12.0), Some(8.0)]), 1);
        assert_eq!(phy.select_ri(&[Some(12.0), Some(11.0)]), 2);
        assert_eq!(phy.select_ri(&[None, Some(4.0)]), 1);
    }

    #[test]
    fn test_lbt_skipped_when_data_reaches_ul_ctrl() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let mut ctx = SimContext::detached();
        let sfn = phy.current_slot;

        phy.curr_slot_alloc = SlotAllocInfo::new(sfn);
        phy.push_ctrl_allocations(sfn);
        phy.insert_allocation(data_dci(3, DciFormat::Dl, 1, 12, 0));
        phy.try_to_perform_lbt(&mut ctx);
        assert!(phy.channel_granted);
        assert!(ctx.queue.is_empty());
    }

    #[test]
    fn test_lbt_scheduled_before_ul_ctrl() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let mut ctx = SimContext::detached();
        let sfn = phy.current_slot;

        phy.curr_slot_alloc = SlotAllocInfo::new(sfn);
        phy.push_ctrl_allocations(sfn);
        phy.try_to_perform_lbt(&mut ctx);
        assert!(!phy.channel_granted);

        let expected = phy.core().symbols(13).saturating_sub(SimTime::from_micros(25));
        assert_eq!(ctx.queue.peek_time(), Some(expected));
        let Some((_, PhyEvent::Ue { event, .. })) = ctx.queue.pop() else {
            panic!("expected the LBT event");
        };
        phy.handle_event(&mut ctx, event);
        assert!(phy.channel_granted);
        assert_eq!(phy.stats().lbt_requests, 1);
    }

    #[test]
    fn test_ul_ctrl_needs_grant() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let mut ctx = SimContext::detached();
        let ul_ctrl = DciInfo::ctrl(13, 1, DciFormat::Ul, VarTtiType::Ctrl, vec![true; 52]);

        phy.ctrl_msgs.push(ControlMessage::Bsr {
            rnti: Rnti(3),
            buffer_bytes: 10,
        });
        phy.ul_ctrl(&mut ctx, &ul_ctrl);
        assert_eq!(phy.stats().ul_ctrl_tx, 0);
        assert_eq!(phy.ctrl_msgs.len(), 1);

        phy.channel_granted = true;
        phy.ul_ctrl(&mut ctx, &ul_ctrl);
        assert_eq!(phy.stats().ul_ctrl_tx, 1);
        assert!(phy.ctrl_msgs.is_empty());
        assert!(!phy.channel_granted);
        assert_eq!(phy.core().spectrum(0).stats().frames_transmitted, 1);
    }

    #[test]
    #[should_panic(expected = "has been scheduled without data")]
    fn test_ul_data_without_burst_panics() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let mut ctx = SimContext::detached();
        phy.ul_data(&mut ctx, &data_dci(3, DciFormat::Ul, 1, 12, 0));
    }

    #[test]
    fn test_ul_data_sent_after_one_ns() {
        let (mut phy, _log) = ue("F|F|F|F|");
        let mut ctx = SimContext::detached();
        let sfn = phy.current_slot;
        let packet = Packet::new(Bytes::from_static(&[0u8; 100])).with_bearer(RadioBearerTag {
            rnti: Rnti(3),
            lcid: 4,
            layer: 0,
        });
        phy.core_mut().set_mac_pdu(packet, sfn, 1, 0);

        let period = phy.ul_data(&mut ctx, &data_dci(3, DciFormat::Ul, 1, 12, 0));
        assert_eq!(period, phy.core().symbols(12));
        assert_eq!(ctx.queue.peek_time(), Some(SimTime::from_nanos(1)));
    }

    fn pscch_packet(dst: u32, gap_retx1: u8) -> Packet {
        let sci = SciF1aHeader {
            priority: 1,
            mcs: 10,
            sl_resource_reserve_period: 100,
            total_sub_channels: 5,
            index_start_sub_channel: 1,
            length_sub_channel: 2,
            sl_max_num_per_reserve: 2,
            gap_retx1,
            index_start_sb_ch_retx1: 3,
            gap_retx2: SciF1aHeader::NO_RETX,
            index_start_sb_ch_retx2: 0,
        };
        Packet::new(Bytes::new())
            .with_header(PacketHeader::SciF1a(sci))
            .with_sl_tag(SlMacPduTag {
                rnti: Rnti(8),
                sfn: SfnSf::new(0, 0, 0, 1),
                sym_start: 3,
                num_sym: 10,
                tb_size: 200,
                dst_l2_id: dst,
            })
    }

    #[test]
    fn test_pscch_for_monitored_destination() {
        let (mut phy, log) = ue_with(PhyConfig::default(), &[255]);
        let psd = SpectrumValue::from_values(vec![1e-18; 52], 360e3);

        phy.phy_pscch_pdu_received(&pscch_packet(77, SciF1aHeader::NO_RETX), &psd);
        assert_eq!(log.borrow().sensing.len(), 1);
        assert_eq!(phy.core().spectrum(0).expected_sl_tbs(), 0);

        phy.phy_pscch_pdu_received(&pscch_packet(255, 2), &psd);
        assert_eq!(log.borrow().sensing.len(), 2);
        assert_eq!(log.borrow().sensing[1].sb_ch_start, 1);
        assert_eq!(phy.core().spectrum(0).expected_sl_tbs(), 1);
        assert_eq!(phy.pending_sl_rx_grants(), 1);
        assert!(phy.stats().last_sl_rsrp_dbm.is_some());
    }

    #[test]
    fn test_sl_retransmission_registered_in_its_slot() {
        let (mut phy, _log) = ue_with(PhyConfig::default(), &[255]);
        let psd = SpectrumValue::from_values(vec![1e-18; 52], 360e3);
        phy.phy_pscch_pdu_received(&pscch_packet(255, 2), &psd);
        for p in phy.core_mut().spectrum_phys_mut() {
            p.clear_expected_sl_tb();
        }

        let tx_slot = SfnSf::new(0, 0, 0, 1);
        phy.send_sl_expected_tb_info(tx_slot.future(1));
        assert_eq!(phy.core().spectrum(0).expected_sl_tbs(), 0);
        assert_eq!(phy.pending_sl_rx_grants(), 1);

        phy.send_sl_expected_tb_info(tx_slot.future(2));
        assert_eq!(phy.core().spectrum(0).expected_sl_tbs(), 1);
        assert_eq!(phy.pending_sl_rx_grants(), 0);
    }

    #[test]
    fn test_slot_loop_runs_var_ttis() {
        let (mut phy, log) = ue("DL|F|UL|F|");
        let mut ctx = SimContext::detached();
        phy.start_event_loop(&mut ctx, SfnSf::new(0, 0, 0, 1));

        // Stop in the middle of the fourth slot
        let until = phy.core().slot_period() * 3 + phy.core().symbols(7);
        while ctx.queue.peek_time().is_some_and(|t| t < until) {
            let Some((_, event)) = ctx.queue.pop() else { break };
            match event {
                PhyEvent::Ue { event, .. } => phy.handle_event(&mut ctx, event),
                PhyEvent::Spectrum { to, timer } => phy.handle_spectrum_timer(&mut ctx, to.stream, timer),
                _ => {}
            }
        }

        assert_eq!(phy.stats().slots, 4);
        assert_eq!(log.borrow().slots.len(), 4);
        assert_eq!(phy.current_slot(), SfnSf::new(0, 1, 1, 1));
        // Nothing to say in the UL CTRL
        assert_eq!(phy.stats().ul_ctrl_tx, 0);
    }
}
