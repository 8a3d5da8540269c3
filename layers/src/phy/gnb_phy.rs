//! gNB PHY
//!
//! Slot engine of the base station. At every slot it asks the MAC for the
//! allocations of future slots (following the generate tables), sends the
//! DCIs due in this slot (following the send tables), and executes the
//! var-TTIs of the current allocation on its spectrum PHYs.

use super::beam::BeamformingVector;
use super::cam::{AccessResponse, ChannelAccessManager};
use super::config::PhyConfig;
use super::frame::{ControlMessage, Packet, PacketBurst, SignalFrame};
use super::frame_structure::{parse_pattern, pattern_to_string, SlotTables};
use super::phy_core::PhyCore;
use super::spectrum::{DeviceRole, PhyIndication, SpectrumTimer};
use super::spectrum_value::SpectrumValue;
use super::tb_registry::ExpectedTb;
use super::{PhyEvent, SimContext};
use crate::mac::{
    DciFormat, DciInfo, GnbMacSapUser, SlotAllocInfo, UlCqiInfo, UlCqiType, UlHarqInfo,
    VarTtiAllocInfo, VarTtiType,
};
use crate::LayerError;
use common::sim::{EventId, SimTime};
use common::types::{BwpId, CellId, NodeId, Rnti, SfnSf, TddSlotType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Data ending closer than this to the slot boundary keeps the channel
const CHANNEL_RELEASE_GUARD: SimTime = SimTime::from_micros(25);

/// Events handled by a gNB PHY
#[derive(Debug, Clone)]
pub enum GnbEvent {
    StartSlot(SfnSf),
    StartVarTti(Arc<DciInfo>),
    EndVarTti(Arc<DciInfo>),
    EndSlot,
    SendDataChannels {
        stream: u8,
        packets: PacketBurst,
        duration: SimTime,
        dci: Arc<DciInfo>,
    },
    ChannelAccessLost,
    /// Decoded PDU handed to the MAC once the decode latency elapsed
    DeliverPdu(Packet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    None,
    Requested,
    Granted,
    /// Granted, released at the end of the slot
    ToLose,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GnbPhyStats {
    pub slots: u64,
    pub mibs: u64,
    pub sib1s: u64,
    pub dl_ctrl_tx: u64,
    pub dl_data_tx: u64,
    pub ul_tbs_expected: u64,
    pub dcis_sent: u64,
    pub allocations_requeued: u64,
    pub pdus_delivered: u64,
}

#[derive(Debug)]
pub struct GnbPhy {
    core: PhyCore,
    mac: Box<dyn GnbMacSapUser>,
    cam: Box<dyn ChannelAccessManager>,

    pattern: Vec<TddSlotType>,
    tables: SlotTables,

    current_slot: SfnSf,
    last_slot_start: SimTime,
    curr_slot_alloc: SlotAllocInfo,
    curr_sym_start: u8,
    /// Control messages to transmit in the DL CTRL of this slot
    ctrl_msgs: Vec<ControlMessage>,
    /// DL RBGs in use, per starting symbol
    rbg_alloc_per_sym: BTreeMap<u8, Vec<bool>>,

    channel_status: ChannelStatus,
    channel_lost_timer: Option<EventId>,

    attached_rntis: BTreeSet<Rnti>,
    ue_nodes: BTreeMap<Rnti, NodeId>,

    stats: GnbPhyStats,
}

impl GnbPhy {
    pub fn new(
        config: PhyConfig,
        node: NodeId,
        cell_id: CellId,
        bwp_id: BwpId,
        mac: Box<dyn GnbMacSapUser>,
        cam: Box<dyn ChannelAccessManager>,
        seed: u64,
    ) -> Result<Self, LayerError> {
        let pattern = parse_pattern(&config.pattern)?;
        let tables = Self::build_tables(&pattern, &config)?;
        let core = PhyCore::new(config, node, cell_id, bwp_id, DeviceRole::Gnb, seed)?;
        let numerology = core.config().numerology;

        info!(
            "gNB PHY {} cell {}: numerology {}, {} RBs, pattern {}, {} stream(s)",
            node,
            cell_id.0,
            numerology,
            core.config().num_rbs,
            pattern_to_string(&pattern),
            core.num_streams()
        );

        Ok(Self {
            core,
            mac,
            cam,
            pattern,
            tables,
            current_slot: SfnSf::new(0, 0, 0, numerology),
            last_slot_start: SimTime::ZERO,
            curr_slot_alloc: SlotAllocInfo::new(SfnSf::new(0, 0, 0, numerology)),
            curr_sym_start: 0,
            ctrl_msgs: Vec::new(),
            rbg_alloc_per_sym: BTreeMap::new(),
            channel_status: ChannelStatus::None,
            channel_lost_timer: None,
            attached_rntis: BTreeSet::new(),
            ue_nodes: BTreeMap::new(),
            stats: GnbPhyStats::default(),
        })
    }

    fn build_tables(pattern: &[TddSlotType], config: &PhyConfig) -> Result<SlotTables, LayerError> {
        SlotTables::build(pattern, config.n0, config.n1, config.n2, config.l1l2_ctrl_latency)
    }

    /// Validate `config` and install it together with the slot tables it
    /// implies. On error nothing changes.
    pub fn reconfigure(&mut self, config: PhyConfig) -> Result<(), LayerError> {
        config.validate()?;
        let pattern = parse_pattern(&config.pattern)?;
        let tables = Self::build_tables(&pattern, &config)?;
        if config.numerology != self.core.config().numerology {
            return Err(LayerError::InvalidConfiguration(
                "numerology cannot change at runtime".to_string(),
            ));
        }
        self.core.set_config(config)?;
        debug!(
            "gNB PHY {} reconfigured, pattern {}",
            self.core.node(),
            pattern_to_string(&pattern)
        );
        self.pattern = pattern;
        self.tables = tables;
        Ok(())
    }

    pub fn core(&self) -> &PhyCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut PhyCore {
        &mut self.core
    }

    pub fn mac(&self) -> &dyn GnbMacSapUser {
        self.mac.as_ref()
    }

    pub fn node(&self) -> NodeId {
        self.core.node()
    }

    pub fn cell_id(&self) -> CellId {
        self.core.cell_id()
    }

    pub fn pattern(&self) -> &[TddSlotType] {
        &self.pattern
    }

    pub fn tables(&self) -> &SlotTables {
        &self.tables
    }

    pub fn current_slot(&self) -> SfnSf {
        self.current_slot
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel_status
    }

    pub fn stats(&self) -> &GnbPhyStats {
        &self.stats
    }

    /// Register a UE served by this cell
    pub fn add_ue(&mut self, rnti: Rnti, node: NodeId) {
        info!("gNB PHY {} attaching {} (node {})", self.core.node(), rnti, node);
        self.attached_rntis.insert(rnti);
        self.ue_nodes.insert(rnti, node);
        self.mac.add_ue(rnti);
    }

    pub fn remove_ue(&mut self, rnti: Rnti) {
        if !self.attached_rntis.remove(&rnti) {
            panic!("Impossible to remove UE, not attached!");
        }
        self.ue_nodes.remove(&rnti);
        self.mac.remove_ue(rnti);
    }

    /// Install the beam of every stream toward `peer`
    pub fn set_beam(&mut self, peer: NodeId, beam: BeamformingVector) {
        for phy in self.core.spectrum_phys_mut() {
            phy.beam_manager_mut().set_beam(peer, beam.clone());
        }
    }

    fn schedule(&self, ctx: &mut SimContext, delay: SimTime, event: GnbEvent) -> EventId {
        ctx.queue.schedule(
            delay,
            PhyEvent::Gnb {
                node: self.core.node(),
                event,
            },
        )
    }

    /// Reset the control pipeline and start the slot loop at `start`
    pub fn start_event_loop(&mut self, ctx: &mut SimContext, start: SfnSf) {
        info!("gNB PHY {} starting at {}", self.core.node(), start);
        self.core.init_ctrl_queue();
        self.schedule(ctx, SimTime::ZERO, GnbEvent::StartSlot(start));
    }

    pub fn handle_event(&mut self, ctx: &mut SimContext, event: GnbEvent) {
        match event {
            GnbEvent::StartSlot(sfn) => self.start_slot(ctx, sfn),
            GnbEvent::StartVarTti(dci) => self.start_var_tti(ctx, dci),
            GnbEvent::EndVarTti(dci) => trace!(
                "gNB PHY {} DCI started at symbol {} which lasted for {} symbols finished",
                self.core.node(),
                dci.sym_start,
                dci.num_sym
            ),
            GnbEvent::EndSlot => self.end_slot(ctx),
            GnbEvent::SendDataChannels {
                stream,
                packets,
                duration,
                dci,
            } => self.send_data_channels(ctx, stream, packets, duration, &dci),
            GnbEvent::ChannelAccessLost => self.channel_access_lost(),
            GnbEvent::DeliverPdu(packet) => {
                self.stats.pdus_delivered += 1;
                self.mac.receive_phy_pdu(packet);
            }
        }
    }

    /// A signal reached the spectrum PHY of `stream`
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
        assert!(
            self.channel_status != ChannelStatus::ToLose,
            "Slot started while the channel is being released"
        );
        let now = ctx.now();
        self.current_slot = sfn;
        self.last_slot_start = now;
        self.stats.slots += 1;

        let slot_period = self.core.slot_period();
        self.schedule(ctx, slot_period, GnbEvent::EndSlot);

        self.curr_slot_alloc = match self.core.retrieve_slot_alloc_info(sfn) {
            Some(alloc) => alloc,
            None => {
                trace!("gNB PHY {} no allocation for {}", self.core.node(), sfn);
                SlotAllocInfo::new(sfn)
            }
        };

        if self.core.config().is_primary && sfn.slot == 0 {
            let mut mib_or_sib = false;
            if sfn.subframe == 0 {
                self.queue_mib();
                mib_or_sib = true;
            } else if sfn.subframe == 5 {
                self.queue_sib();
                mib_or_sib = true;
            }
            if mib_or_sib && !self.curr_slot_alloc.contains_dl_ctrl_allocation() {
                let dci = self.mac.dl_ctrl_dci();
                self.curr_slot_alloc.num_sym_alloc += dci.num_sym as u32;
                self.curr_slot_alloc
                    .var_tti_alloc_info
                    .push_front(VarTtiAllocInfo::new(dci));
            }
        }

        if self.channel_status == ChannelStatus::Granted {
            trace!("gNB PHY {} channel granted", self.core.node());
            self.call_mac_for_slot_indication(sfn);
            self.do_start_slot(ctx);
            return;
        }

        let n2 = self.core.config().n2;
        let has_ul_dci = n2 > 0
            && self
                .core
                .peek_slot_alloc_info(sfn.future(n2))
                .is_some_and(|ul| ul.contains_data_allocation() || ul.contains_ul_ctrl_allocation());

        if self.curr_slot_alloc.contains_data_allocation()
            || self.curr_slot_alloc.contains_dl_ctrl_allocation()
            || has_ul_dci
        {
            if self.channel_status == ChannelStatus::None {
                debug!("gNB PHY {} channel not granted, request the channel", self.core.node());
                self.channel_status = ChannelStatus::Requested;
                match self.cam.request_access(now) {
                    AccessResponse::Granted(duration) => self.channel_access_granted(ctx, duration),
                    AccessResponse::Denied => self.channel_access_lost(),
                    AccessResponse::Pending => {}
                }
                if self.channel_status == ChannelStatus::Granted {
                    self.call_mac_for_slot_indication(sfn);
                    self.do_start_slot(ctx);
                    return;
                }
            }

            // Nothing is lost while waiting: the allocation moves one slot later
            let new_sfn = sfn.future(1);
            debug!(
                "gNB PHY {} queueing allocation of {} in front for {}",
                self.core.node(),
                sfn,
                new_sfn
            );
            self.stats.allocations_requeued += 1;
            let alloc = self.curr_slot_alloc.clone();
            self.core.push_front_slot_alloc_info(new_sfn, alloc);
            self.call_mac_for_slot_indication(sfn);
        } else {
            trace!("gNB PHY {} empty slot {}", self.core.node(), sfn);
            self.call_mac_for_slot_indication(sfn);
        }

        // Receiving needs no grant
        let symbol = self.core.symbol_period();
        let ul_rx: Vec<Arc<DciInfo>> = self
            .curr_slot_alloc
            .var_tti_alloc_info
            .iter()
            .filter(|alloc| {
                alloc.dci.format == DciFormat::Ul
                    && matches!(alloc.dci.var_tti_type, VarTtiType::Ctrl | VarTtiType::Srs)
            })
            .map(|alloc| Arc::clone(&alloc.dci))
            .collect();
        for dci in ul_rx {
            let start = symbol * dci.sym_start as u64;
            self.schedule(ctx, start, GnbEvent::StartVarTti(dci));
        }
    }

    fn call_mac_for_slot_indication(&mut self, sfn: SfnSf) {
        assert!(
            !self.tables.generate_dl.is_empty() || !self.tables.generate_ul.is_empty(),
            "No slot to generate for pattern {}",
            pattern_to_string(&self.pattern)
        );

        self.mac.set_current_sfn(sfn);
        let pos = sfn.pattern_position(self.pattern.len());

        let ul_ks = self.tables.generate_ul.get(&pos).cloned().unwrap_or_default();
        for k in ul_ks {
            let target = sfn.future(k);
            let slot_type = self.pattern[target.pattern_position(self.pattern.len())];
            trace!("gNB PHY {} in {} generate UL for {} ({})", self.core.node(), sfn, target, slot_type);
            self.mac.slot_ul_indication(target, slot_type, &mut self.core);
        }

        let dl_ks = self.tables.generate_dl.get(&pos).cloned().unwrap_or_default();
        for k in dl_ks {
            let target = sfn.future(k);
            let slot_type = self.pattern[target.pattern_position(self.pattern.len())];
            trace!("gNB PHY {} in {} generate DL for {} ({})", self.core.node(), sfn, target, slot_type);
            self.mac.slot_dl_indication(target, slot_type, &mut self.core);
        }
    }

    fn do_start_slot(&mut self, ctx: &mut SimContext) {
        let pos = self.current_slot.pattern_position(self.pattern.len());
        debug!(
            "gNB PHY {} start slot {} of type {}",
            self.core.node(),
            self.current_slot,
            self.pattern[pos]
        );

        if self.curr_slot_alloc.var_tti_alloc_info.is_empty() {
            return;
        }
        trace!("gNB PHY {} allocations: {}", self.core.node(), self.curr_slot_alloc);

        self.do_check_or_release_channel();
        self.retrieve_prepare_encode_ctrl_msgs();
        self.prepare_rbg_allocation_map();
        self.fill_the_event(ctx);
    }

    /// Keep the channel into the next slot only if DL data reaches the
    /// end of this one
    fn do_check_or_release_channel(&mut self) {
        assert_eq!(self.channel_status, ChannelStatus::Granted, "Checking a channel not granted");

        let last_dl_symbol = self
            .curr_slot_alloc
            .var_tti_alloc_info
            .iter()
            .filter(|a| a.dci.var_tti_type == VarTtiType::Data && a.dci.format == DciFormat::Dl)
            .map(|a| a.dci.sym_start + a.dci.num_sym)
            .max()
            .unwrap_or(0);

        let last_data_time = self.core.symbols(last_dl_symbol);
        let remaining = self.core.slot_period().saturating_sub(last_data_time);
        if remaining > CHANNEL_RELEASE_GUARD {
            trace!(
                "gNB PHY {} last data symbol {}, {} to the end of the slot: losing the channel",
                self.core.node(),
                last_dl_symbol,
                remaining
            );
            self.channel_status = ChannelStatus::ToLose;
        }
    }

    fn retrieve_prepare_encode_ctrl_msgs(&mut self) {
        if !self.ctrl_msgs.is_empty() {
            debug!(
                "gNB PHY {} {} control messages left from a previous slot",
                self.core.node(),
                self.ctrl_msgs.len()
            );
        }
        let mut msgs = self.core.pop_current_slot_ctrl_msgs();
        msgs.extend(self.retrieve_msgs_from_dcis(self.current_slot));
        self.ctrl_msgs.extend(msgs);
    }

    /// DCIs to send in `current`, following the send tables
    fn retrieve_msgs_from_dcis(&mut self, current: SfnSf) -> Vec<ControlMessage> {
        let pos = current.pattern_position(self.pattern.len());
        let k1 = self.tables.harq_k1(pos).unwrap_or(0);
        let mut msgs = Vec::new();

        let dl_ks = self.tables.to_send_dl.get(&pos).cloned().unwrap_or_default();
        for k0 in dl_ks {
            let target = current.future(k0);
            let alloc = if target == current {
                Some(&self.curr_slot_alloc)
            } else {
                self.core.peek_slot_alloc_info(target)
            };
            match alloc {
                Some(alloc) => msgs.extend(self.dcis_of(alloc, DciFormat::Dl, k0, k1)),
                None => trace!("gNB PHY {} no allocation found for {}", self.core.node(), target),
            }
        }

        let ul_ks = self.tables.to_send_ul.get(&pos).cloned().unwrap_or_default();
        for k2 in ul_ks {
            let target = current.future(k2);
            let alloc = if target == current {
                Some(&self.curr_slot_alloc)
            } else {
                self.core.peek_slot_alloc_info(target)
            };
            match alloc {
                Some(alloc) => msgs.extend(self.dcis_of(alloc, DciFormat::Ul, k2, k1)),
                None => trace!("gNB PHY {} no allocation found for {}", self.core.node(), target),
            }
        }

        self.stats.dcis_sent += msgs.len() as u64;
        msgs
    }

    fn dcis_of(&self, alloc: &SlotAllocInfo, format: DciFormat, k: u32, k1: u32) -> Vec<ControlMessage> {
        let symbols_per_slot = self.core.config().symbols_per_slot;
        alloc
            .var_tti_alloc_info
            .iter()
            .filter(|a| a.dci.var_tti_type != VarTtiType::Ctrl && a.dci.format == format)
            .map(|a| {
                let dci = &a.dci;
                assert!(
                    dci.sym_start + dci.num_sym <= symbols_per_slot,
                    "symStart: {} numSym: {} symPerSlot: {}",
                    dci.sym_start,
                    dci.num_sym,
                    symbols_per_slot
                );
                trace!(
                    "gNB PHY {} send DCI to {} from sym {} to {}",
                    self.core.node(),
                    dci.rnti,
                    dci.sym_start,
                    dci.sym_start + dci.num_sym
                );
                match format {
                    DciFormat::Dl => ControlMessage::DlDci {
                        dci: Arc::clone(dci),
                        k0: k,
                        k1,
                    },
                    DciFormat::Ul => ControlMessage::UlDci {
                        dci: Arc::clone(dci),
                        k2: k,
                    },
                }
            })
            .collect()
    }

    fn prepare_rbg_allocation_map(&mut self) {
        self.rbg_alloc_per_sym.clear();
        for alloc in &self.curr_slot_alloc.var_tti_alloc_info {
            let dci = &alloc.dci;
            if dci.var_tti_type == VarTtiType::Ctrl || dci.format != DciFormat::Dl {
                continue;
            }
            let entry = self
                .rbg_alloc_per_sym
                .entry(dci.sym_start)
                .or_insert_with(|| vec![false; dci.rbg_bitmask.len()]);
            assert_eq!(entry.len(), dci.rbg_bitmask.len(), "RBG bitmasks of different sizes");
            for (used, assigned) in entry.iter_mut().zip(&dci.rbg_bitmask) {
                *used |= *assigned;
            }
        }
    }

    /// Schedule the var-TTIs of the slot. DL allocations sharing a symbol
    /// are executed once (OFDMA): the first one transmits for all.
    fn fill_the_event(&mut self, ctx: &mut SimContext) {
        let symbol = self.core.symbol_period();
        let mut last_sym_start = 0;
        let mut use_next_allocation_same_symbol = true;

        let allocations = std::mem::take(&mut self.curr_slot_alloc.var_tti_alloc_info);
        for alloc in allocations {
            let dci = alloc.dci;
            assert!(last_sym_start <= dci.sym_start, "Allocations are not sorted by symbol");

            if last_sym_start == dci.sym_start && !use_next_allocation_same_symbol {
                trace!("gNB PHY {} ignored allocation {} (OFDMA DL)", self.core.node(), dci);
                continue;
            }
            use_next_allocation_same_symbol = true;

            let start = symbol * dci.sym_start as u64;
            last_sym_start = dci.sym_start;
            if dci.format == DciFormat::Dl {
                use_next_allocation_same_symbol = false;
            }
            trace!("gNB PHY {} scheduled allocation {} at {}", self.core.node(), dci, start);
            self.schedule(ctx, start, GnbEvent::StartVarTti(dci));
        }
    }

    fn end_slot(&mut self, ctx: &mut SimContext) {
        let next_start = (self.last_slot_start + self.core.slot_period()).saturating_sub(ctx.now());

        if self.channel_status == ChannelStatus::ToLose {
            trace!("gNB PHY {} release the channel", self.core.node());
            self.channel_status = ChannelStatus::None;
            if let Some(id) = self.channel_lost_timer.take() {
                ctx.queue.cancel(id);
            }
        }

        self.current_slot.add(1);
        self.schedule(ctx, next_start, GnbEvent::StartSlot(self.current_slot));
    }

    // ------------------------------------------------------------------------
    // Var-TTIs
    // ------------------------------------------------------------------------

    fn start_var_tti(&mut self, ctx: &mut SimContext, dci: Arc<DciInfo>) {
        for stream in 0..self.core.num_streams() as u8 {
            self.core.spectrum_mut(stream).change_to_quasi_omni(ctx);
        }
        self.curr_sym_start = dci.sym_start;

        let period = match (dci.var_tti_type, dci.format) {
            (VarTtiType::Ctrl, DciFormat::Dl) => self.dl_ctrl(ctx, &dci),
            (VarTtiType::Ctrl, DciFormat::Ul) => self.ul_ctrl(&dci),
            (VarTtiType::Data, DciFormat::Dl) => self.dl_data(ctx, &dci),
            (VarTtiType::Data, DciFormat::Ul) => self.ul_data(ctx, &dci),
            (VarTtiType::Srs, DciFormat::Ul) => self.ul_srs(ctx, &dci),
            (VarTtiType::Srs, DciFormat::Dl) => panic!("SRS allocation must be in the uplink"),
        };

        self.schedule(ctx, period, GnbEvent::EndVarTti(dci));
    }

    fn dl_ctrl(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        let period = self.core.symbols(dci.num_sym);
        if self.ctrl_msgs.is_empty() {
            trace!("gNB PHY {} no DL CTRL message to send, skipping", self.core.node());
            return period;
        }

        debug!(
            "gNB PHY {} TXing DL CTRL with {} msgs, frame {} symbols {}-{}",
            self.core.node(),
            self.ctrl_msgs.len(),
            self.current_slot,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        // Ends 1 ns early so that control never overlaps the data that follows
        self.send_ctrl_channels(ctx, period.saturating_sub(SimTime::from_nanos(1)));
        period
    }

    fn send_ctrl_channels(&mut self, ctx: &mut SimContext, duration: SimTime) {
        let full_bw = self.core.full_bandwidth_rbs();
        self.core.set_sub_channels(&full_bw, 1);
        let msgs = std::mem::take(&mut self.ctrl_msgs);
        self.stats.dl_ctrl_tx += 1;
        // DL control only goes through the first stream
        self.core.spectrum_mut(0).start_tx_dl_control_frames(ctx, msgs, duration);
    }

    fn ul_ctrl(&mut self, dci: &DciInfo) -> SimTime {
        let period = self.core.symbols(dci.num_sym);
        trace!(
            "gNB PHY {} RXing UL CTRL frame {} symbols {}-{}",
            self.core.node(),
            self.current_slot,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        period
    }

    fn dl_data(&mut self, ctx: &mut SimContext, dci: &Arc<DciInfo>) -> SimTime {
        let period = self.core.symbols(dci.num_sym);
        for stream in 0..self.core.num_streams() as u8 {
            let Some(packets) = self
                .core
                .take_packet_burst(self.current_slot, dci.sym_start, stream)
                .filter(|burst| !burst.is_empty())
            else {
                // Scheduled without queued data: no power on this stream
                continue;
            };
            debug!(
                "gNB PHY {} TXing DL DATA frame {} symbols {}-{} stream {}",
                self.core.node(),
                self.current_slot,
                dci.sym_start,
                dci.sym_start + dci.num_sym - 1,
                stream
            );
            self.schedule(
                ctx,
                SimTime::from_nanos(1),
                GnbEvent::SendDataChannels {
                    stream,
                    packets,
                    duration: period.saturating_sub(SimTime::from_nanos(2)),
                    dci: Arc::clone(dci),
                },
            );
        }
        period
    }

    fn ul_data(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        let period = self.core.symbols(dci.num_sym);

        // UL is single stream
        if dci.tb_size.first().copied().unwrap_or(0) > 0 {
            let expected = ExpectedTb {
                ndi: dci.ndi.first().copied().unwrap_or(1),
                tb_size: dci.tb_size[0],
                mcs: dci.mcs.first().copied().unwrap_or(0),
                rb_bitmap: self.core.rbg_to_rbs(&dci.rbg_bitmask),
                harq_process_id: dci.harq_process,
                rv: dci.rv.first().copied().unwrap_or(0),
                is_downlink: false,
                sym_start: dci.sym_start,
                num_sym: dci.num_sym,
                sfn: self.current_slot,
            };
            self.stats.ul_tbs_expected += 1;
            self.core.spectrum_mut(0).add_expected_tb(dci.rnti, expected);
        }

        let Some(&peer) = self.ue_nodes.get(&dci.rnti) else {
            panic!("UL data scheduled for {} which is not attached to this gNB", dci.rnti);
        };
        self.change_beam(ctx, peer);

        trace!(
            "gNB PHY {} RXing UL DATA frame {} symbols {}-{}",
            self.core.node(),
            self.current_slot,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        period
    }

    fn ul_srs(&mut self, ctx: &mut SimContext, dci: &DciInfo) -> SimTime {
        let period = self.core.symbols(dci.num_sym);
        for phy in self.core.spectrum_phys_mut() {
            phy.add_expected_srs_rnti(dci.rnti);
        }
        match self.ue_nodes.get(&dci.rnti) {
            Some(&peer) => self.change_beam(ctx, peer),
            None => warn!(
                "gNB PHY {} SRS scheduled for {} which is not attached yet",
                self.core.node(),
                dci.rnti
            ),
        }
        trace!(
            "gNB PHY {} RXing UL SRS frame {} symbols {}-{}",
            self.core.node(),
            self.current_slot,
            dci.sym_start,
            dci.sym_start + dci.num_sym - 1
        );
        period
    }

    fn change_beam(&mut self, ctx: &mut SimContext, peer: NodeId) {
        for stream in 0..self.core.num_streams() as u8 {
            self.core.spectrum_mut(stream).change_beam(ctx, peer);
        }
    }

    fn send_data_channels(
        &mut self,
        ctx: &mut SimContext,
        stream: u8,
        packets: PacketBurst,
        duration: SimTime,
        dci: &DciInfo,
    ) {
        let Some(&peer) = self.ue_nodes.get(&dci.rnti) else {
            panic!("DL data scheduled for {} which is not attached to this gNB", dci.rnti);
        };
        self.change_beam(ctx, peer);

        let Some(rbgs) = self.rbg_alloc_per_sym.get(&dci.sym_start) else {
            panic!("No RBG allocation stored for symbol {}", dci.sym_start);
        };
        let rbs = self.core.rbg_to_rbs(rbgs);
        self.core.set_sub_channels(&rbs, dci.active_streams());

        self.stats.dl_data_tx += 1;
        self.core
            .spectrum_mut(stream)
            .start_tx_data_frames(ctx, packets, Vec::new(), duration);
    }

    // ------------------------------------------------------------------------
    // Channel access
    // ------------------------------------------------------------------------

    fn channel_access_granted(&mut self, ctx: &mut SimContext, duration: SimTime) {
        let slot_period = self.core.slot_period();
        if duration < slot_period {
            debug!(
                "gNB PHY {} grant of {} is shorter than a slot, ignored",
                self.core.node(),
                duration
            );
            self.channel_status = ChannelStatus::None;
            return;
        }

        self.channel_status = ChannelStatus::Granted;

        let to_next_slot = (self.last_slot_start + slot_period).saturating_sub(ctx.now());
        let grant = duration.saturating_sub(to_next_slot);
        let slots_granted = (grant.as_nanos() / slot_period.as_nanos()).max(1);
        debug!(
            "gNB PHY {} channel access granted for {}, i.e. {} slots",
            self.core.node(),
            duration,
            slots_granted
        );

        assert!(
            !self.channel_lost_timer.is_some_and(|id| ctx.queue.is_pending(id)),
            "Channel granted while the previous grant is still running"
        );
        let expiry = (slot_period * slots_granted).saturating_sub(SimTime::from_nanos(1));
        self.channel_lost_timer = Some(self.schedule(ctx, expiry, GnbEvent::ChannelAccessLost));
    }

    fn channel_access_lost(&mut self) {
        trace!("gNB PHY {} channel access lost", self.core.node());
        self.channel_status = ChannelStatus::None;
        self.channel_lost_timer = None;
    }

    // ------------------------------------------------------------------------
    // Upward path
    // ------------------------------------------------------------------------

    fn process_indications(&mut self, ctx: &mut SimContext) {
        for stream in 0..self.core.num_streams() as u8 {
            for indication in self.core.spectrum_mut(stream).take_indications() {
                self.handle_indication(ctx, indication);
            }
        }
    }

    fn handle_indication(&mut self, ctx: &mut SimContext, indication: PhyIndication) {
        match indication {
            PhyIndication::DataReceived(packet) => {
                let latency = self.core.config().tb_decode_latency();
                self.schedule(ctx, latency, GnbEvent::DeliverPdu(packet));
            }
            PhyIndication::CtrlMessages { msgs, .. } => {
                for msg in msgs {
                    self.phy_ctrl_message_received(msg);
                }
            }
            PhyIndication::UlHarqFeedback(info) => self.report_ul_harq_feedback(info),
            PhyIndication::SrsSinr { rnti, sinr } => self.mac.srs_sinr_report(rnti, sinr),
            PhyIndication::DataSinr(sinr) => self.generate_data_cqi_report(&sinr),
            other => trace!("gNB PHY {} ignoring {:?}", self.core.node(), other),
        }
    }

    fn generate_data_cqi_report(&mut self, sinr: &SpectrumValue) {
        let cqi = UlCqiInfo {
            sinr: sinr.values().to_vec(),
            kind: UlCqiType::Pusch,
        };
        self.mac.ul_cqi_report(cqi, self.current_slot, self.curr_sym_start);
    }

    fn phy_ctrl_message_received(&mut self, msg: ControlMessage) {
        match &msg {
            ControlMessage::DlHarq(info) if !self.attached_rntis.contains(&info.rnti) => {
                debug!(
                    "gNB PHY {} DL HARQ feedback of {} which is not attached, dropped",
                    self.core.node(),
                    info.rnti
                );
            }
            _ => {
                trace!("gNB PHY {} received {} in {}", self.core.node(), msg.name(), self.current_slot);
                self.mac.receive_control_message(msg);
            }
        }
    }

    fn report_ul_harq_feedback(&mut self, info: UlHarqInfo) {
        if self.attached_rntis.contains(&info.rnti) {
            trace!("gNB PHY {} UL HARQ feedback of {} to the scheduler", self.core.node(), info.rnti);
            self.mac.ul_harq_feedback(info);
        }
    }

    fn queue_mib(&mut self) {
        self.stats.mibs += 1;
        let msg = ControlMessage::Mib {
            system_frame_number: 1,
            num_rbs: self.core.config().num_rbs as u16,
        };
        self.core.enqueue_ctrl_msg_now(msg);
    }

    fn queue_sib(&mut self) {
        self.stats.sib1s += 1;
        let msg = ControlMessage::Sib1 {
            cell_id: self.core.cell_id(),
        };
        self.core.enqueue_ctrl_msg_now(msg);
    }
}
