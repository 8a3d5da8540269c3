//! PHY Core
//!
//! State shared by the gNB and UE PHYs: the spectrum PHYs of the device
//! (one per stream), the control-message pipeline, the queue of slot
//! allocations handed over by the MAC and the packet bursts waiting for
//! their var-TTI.

use super::config::PhyConfig;
use super::frame::{ControlMessage, Packet, PacketBurst};
use super::spectrum::{DeviceRole, SpectrumPhy};
use super::spectrum_value::SpectrumValue;
use super::PhyAddr;
use crate::mac::{PhySapProvider, SlVarTtiAllocInfo, SlotAllocInfo, VarTtiType};
use crate::LayerError;
use common::sim::SimTime;
use common::types::{BwpId, CellId, NodeId, SfnSf};
use common::utils::{linear_to_db, SUBCARRIERS_PER_RB};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Sidelink var-TTIs of one slot, ordered by starting symbol
#[derive(Debug, Clone, PartialEq)]
pub struct SlSlotAlloc {
    pub sfn: SfnSf,
    pub var_ttis: Vec<SlVarTtiAllocInfo>,
}

/// Packet bursts are looked up by slot, starting symbol and stream
type BurstKey = (SfnSf, u8, u8);

#[derive(Debug)]
pub struct PhyCore {
    config: PhyConfig,
    node: NodeId,
    cell_id: CellId,
    bwp_id: BwpId,
    noise_psd: SpectrumValue,
    spectrum: Vec<SpectrumPhy>,

    /// One list per slot, front is the current slot
    ctrl_msg_queue: VecDeque<Vec<ControlMessage>>,
    /// Sorted by slot
    slot_alloc_info: VecDeque<SlotAllocInfo>,
    packet_bursts: HashMap<BurstKey, PacketBurst>,

    pscch_bursts: VecDeque<PacketBurst>,
    pssch_bursts: VecDeque<PacketBurst>,
    sl_alloc_queue: VecDeque<SlSlotAlloc>,
}

impl PhyCore {
    /// Build the core and one spectrum PHY per configured stream
    pub fn new(
        config: PhyConfig,
        node: NodeId,
        cell_id: CellId,
        bwp_id: BwpId,
        role: DeviceRole,
        seed: u64,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        let noise_psd = Self::make_noise_psd(&config)?;

        let spectrum = (0..config.num_streams)
            .map(|stream| {
                SpectrumPhy::new(
                    PhyAddr::new(node, stream),
                    role,
                    cell_id,
                    bwp_id,
                    config.spectrum.clone(),
                    noise_psd.clone(),
                    seed,
                )
            })
            .collect();

        let mut core = Self {
            config,
            node,
            cell_id,
            bwp_id,
            noise_psd,
            spectrum,
            ctrl_msg_queue: VecDeque::new(),
            slot_alloc_info: VecDeque::new(),
            packet_bursts: HashMap::new(),
            pscch_bursts: VecDeque::new(),
            pssch_bursts: VecDeque::new(),
            sl_alloc_queue: VecDeque::new(),
        };
        core.init_ctrl_queue();
        Ok(core)
    }

    fn make_noise_psd(config: &PhyConfig) -> Result<SpectrumValue, LayerError> {
        let scs = config.subcarrier_spacing()?;
        let rb_width = SpectrumValue::rb_width_for_scs(scs.as_hz());
        Ok(SpectrumValue::noise_psd(config.noise_figure_db, config.num_rbs, rb_width))
    }

    /// Install a new configuration. The number of streams cannot change.
    pub fn set_config(&mut self, config: PhyConfig) -> Result<(), LayerError> {
        config.validate()?;
        if config.num_streams as usize != self.spectrum.len() {
            return Err(LayerError::InvalidConfiguration(format!(
                "cannot change the number of streams from {} to {} at runtime",
                self.spectrum.len(),
                config.num_streams
            )));
        }
        let noise_psd = Self::make_noise_psd(&config)?;
        for phy in self.spectrum.iter_mut() {
            phy.set_config(config.spectrum.clone());
            phy.set_noise_psd(noise_psd.clone());
        }
        self.noise_psd = noise_psd;
        self.config = config;
        self.resize_ctrl_queue();
        Ok(())
    }

    /// Adapt the pipeline depth to a new L1/L2 latency, keeping queued messages
    fn resize_ctrl_queue(&mut self) {
        let depth = self.config.l1l2_ctrl_latency as usize + 1;
        while self.ctrl_msg_queue.len() < depth {
            self.ctrl_msg_queue.push_back(Vec::new());
        }
        while self.ctrl_msg_queue.len() > depth {
            let Some(last) = self.ctrl_msg_queue.pop_back() else {
                break;
            };
            if let Some(back) = self.ctrl_msg_queue.back_mut() {
                back.extend(last);
            }
        }
    }

    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn set_cell_id(&mut self, cell_id: CellId) {
        self.cell_id = cell_id;
        for phy in self.spectrum.iter_mut() {
            phy.set_cell_id(cell_id);
        }
    }

    pub fn bwp_id(&self) -> BwpId {
        self.bwp_id
    }

    pub fn noise_psd(&self) -> &SpectrumValue {
        &self.noise_psd
    }

    pub fn slot_period(&self) -> SimTime {
        self.config.slot_period()
    }

    pub fn symbol_period(&self) -> SimTime {
        self.config.symbol_period()
    }

    /// Duration of `num_sym` symbols
    pub fn symbols(&self, num_sym: u8) -> SimTime {
        self.symbol_period() * num_sym as u64
    }

    // ------------------------------------------------------------------------
    // Spectrum PHYs
    // ------------------------------------------------------------------------

    pub fn num_streams(&self) -> usize {
        self.spectrum.len()
    }

    pub fn spectrum(&self, stream: u8) -> &SpectrumPhy {
        &self.spectrum[stream as usize]
    }

    pub fn spectrum_mut(&mut self, stream: u8) -> &mut SpectrumPhy {
        &mut self.spectrum[stream as usize]
    }

    pub fn spectrum_phys(&self) -> &[SpectrumPhy] {
        &self.spectrum
    }

    pub fn spectrum_phys_mut(&mut self) -> &mut [SpectrumPhy] {
        &mut self.spectrum
    }

    /// Tx PSD over `rbs`, the power being split among `active_streams`
    pub fn tx_psd(&self, rbs: &[usize], active_streams: u8) -> SpectrumValue {
        let streams = active_streams.max(1) as f64;
        let power_dbm = self.config.tx_power_dbm - linear_to_db(streams);
        let rb_width = self.noise_psd.rb_width_hz();
        SpectrumValue::tx_psd(power_dbm, rbs, self.config.num_rbs, rb_width)
    }

    /// Set the tx PSD of every stream
    pub fn set_sub_channels(&mut self, rbs: &[usize], active_streams: u8) {
        let psd = self.tx_psd(rbs, active_streams);
        for phy in self.spectrum.iter_mut() {
            phy.set_tx_psd(psd.clone());
        }
    }

    /// Every RB of the bandwidth
    pub fn full_bandwidth_rbs(&self) -> Vec<usize> {
        (0..self.config.num_rbs).collect()
    }

    /// Expand an RBG bitmask into the assigned RB indices
    pub fn rbg_to_rbs(&self, rbg_bitmask: &[bool]) -> Vec<usize> {
        let per_rbg = self.config.num_rb_per_rbg;
        rbg_bitmask
            .iter()
            .enumerate()
            .filter(|(_, &assigned)| assigned)
            .flat_map(|(rbg, _)| rbg * per_rbg..(rbg + 1) * per_rbg)
            .filter(|&rb| rb < self.config.num_rbs)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Control messages
    // ------------------------------------------------------------------------

    /// Reset the control pipeline to L1/L2 latency + 1 empty slots
    pub fn init_ctrl_queue(&mut self) {
        self.ctrl_msg_queue.clear();
        for _ in 0..=self.config.l1l2_ctrl_latency {
            self.ctrl_msg_queue.push_back(Vec::new());
        }
    }

    /// Queue a message for the slot L1/L2 latency slots from now
    pub fn enqueue_ctrl_msg(&mut self, msg: ControlMessage) {
        trace!("{} enqueue {} for a future slot", self.node, msg.name());
        match self.ctrl_msg_queue.back_mut() {
            Some(list) => list.push(msg),
            None => self.ctrl_msg_queue.push_back(vec![msg]),
        }
    }

    /// Queue a message for the current slot
    pub fn enqueue_ctrl_msg_now(&mut self, msg: ControlMessage) {
        trace!("{} enqueue {} for the current slot", self.node, msg.name());
        match self.ctrl_msg_queue.front_mut() {
            Some(list) => list.push(msg),
            None => self.ctrl_msg_queue.push_front(vec![msg]),
        }
    }

    /// Take the messages of the current slot and open a new future slot
    pub fn pop_current_slot_ctrl_msgs(&mut self) -> Vec<ControlMessage> {
        match self.ctrl_msg_queue.pop_front() {
            Some(msgs) => {
                self.ctrl_msg_queue.push_back(Vec::new());
                msgs
            }
            None => Vec::new(),
        }
    }

    pub fn is_ctrl_msg_list_empty(&self) -> bool {
        self.ctrl_msg_queue.front().map_or(true, |msgs| msgs.is_empty())
    }

    // ------------------------------------------------------------------------
    // Slot allocations
    // ------------------------------------------------------------------------

    /// Store an allocation, merging it with the one of the same slot
    pub fn push_back_slot_alloc_info(&mut self, mut alloc: SlotAllocInfo) {
        alloc.sort();
        if let Some(existing) = self.slot_alloc_info.iter_mut().find(|a| a.sfn == alloc.sfn) {
            trace!("{} merge allocation of {}", self.node, alloc.sfn);
            existing.merge(&alloc);
            return;
        }
        let pos = self.slot_alloc_info.partition_point(|a| a.sfn < alloc.sfn);
        debug!("{} store allocation {}", self.node, alloc);
        self.slot_alloc_info.insert(pos, alloc);
    }

    /// Requeue an allocation that could not be executed at `new_sfn`.
    /// Every queued allocation from `new_sfn` on moves one slot later,
    /// together with its packet bursts.
    pub fn push_front_slot_alloc_info(&mut self, new_sfn: SfnSf, mut alloc: SlotAllocInfo) {
        let old_sfn = alloc.sfn;
        let mut moves = Vec::new();
        for queued in self.slot_alloc_info.iter_mut().rev() {
            if queued.sfn < new_sfn {
                break;
            }
            let shifted = queued.sfn.future(1);
            moves.push((queued.sfn, shifted));
            queued.sfn = shifted;
        }
        moves.push((old_sfn, new_sfn));

        for (from, to) in moves {
            self.rekey_bursts(from, to);
        }

        alloc.sfn = new_sfn;
        debug!("{} allocation of {} queued again for {}", self.node, old_sfn, new_sfn);
        let pos = self.slot_alloc_info.partition_point(|a| a.sfn < new_sfn);
        self.slot_alloc_info.insert(pos, alloc);
    }

    fn rekey_bursts(&mut self, from: SfnSf, to: SfnSf) {
        let keys: Vec<BurstKey> = self
            .packet_bursts
            .keys()
            .filter(|(sfn, _, _)| *sfn == from)
            .copied()
            .collect();
        for key in keys {
            if let Some(burst) = self.packet_bursts.remove(&key) {
                self.packet_bursts.insert((to, key.1, key.2), burst);
            }
        }
    }

    pub fn slot_alloc_info_exists(&self, sfn: SfnSf) -> bool {
        self.slot_alloc_info.iter().any(|a| a.sfn == sfn)
    }

    /// Remove and return the allocation of `sfn`
    pub fn retrieve_slot_alloc_info(&mut self, sfn: SfnSf) -> Option<SlotAllocInfo> {
        let pos = self.slot_alloc_info.iter().position(|a| a.sfn == sfn)?;
        self.slot_alloc_info.remove(pos)
    }

    pub fn peek_slot_alloc_info(&self, sfn: SfnSf) -> Option<&SlotAllocInfo> {
        self.slot_alloc_info.iter().find(|a| a.sfn == sfn)
    }

    pub fn peek_slot_alloc_info_mut(&mut self, sfn: SfnSf) -> Option<&mut SlotAllocInfo> {
        self.slot_alloc_info.iter_mut().find(|a| a.sfn == sfn)
    }

    pub fn slot_alloc_info_len(&self) -> usize {
        self.slot_alloc_info.len()
    }

    // ------------------------------------------------------------------------
    // Packet bursts
    // ------------------------------------------------------------------------

    /// Append a MAC PDU to the burst of (`sfn`, `sym_start`, `stream`)
    pub fn set_mac_pdu(&mut self, packet: Packet, sfn: SfnSf, sym_start: u8, stream: u8) {
        assert!(
            (stream as usize) < self.spectrum.len(),
            "MAC PDU for stream {} but only {} streams",
            stream,
            self.spectrum.len()
        );
        self.packet_bursts
            .entry((sfn, sym_start, stream))
            .or_default()
            .push(packet);
    }

    pub fn take_packet_burst(&mut self, sfn: SfnSf, sym_start: u8, stream: u8) -> Option<PacketBurst> {
        self.packet_bursts.remove(&(sfn, sym_start, stream))
    }

    pub fn pending_packet_bursts(&self) -> usize {
        self.packet_bursts.len()
    }

    // ------------------------------------------------------------------------
    // Sidelink
    // ------------------------------------------------------------------------

    /// Each PSCCH PDU is a burst of its own
    pub fn set_pscch_mac_pdu(&mut self, packet: Packet) {
        self.pscch_bursts.push_back(vec![packet]);
    }

    /// A PSSCH PDU carrying an SCI stage 2 opens a new burst, the data
    /// PDUs that follow join it
    pub fn set_pssch_mac_pdu(&mut self, packet: Packet) {
        if packet.sci_f2a().is_some() {
            self.pssch_bursts.push_back(vec![packet]);
            return;
        }
        match self.pssch_bursts.back_mut() {
            Some(burst) => burst.push(packet),
            None => panic!("PSSCH data PDU received before its SCI stage 2"),
        }
    }

    pub fn pop_pscch_burst(&mut self) -> Option<PacketBurst> {
        self.pscch_bursts.pop_front()
    }

    pub fn pop_pssch_burst(&mut self) -> Option<PacketBurst> {
        self.pssch_bursts.pop_front()
    }

    pub fn set_sl_var_tti_alloc_info(&mut self, sfn: SfnSf, info: SlVarTtiAllocInfo) {
        let slot = match self.sl_alloc_queue.iter().position(|s| s.sfn == sfn) {
            Some(pos) => &mut self.sl_alloc_queue[pos],
            None => {
                let pos = self.sl_alloc_queue.partition_point(|s| s.sfn < sfn);
                self.sl_alloc_queue.insert(
                    pos,
                    SlSlotAlloc {
                        sfn,
                        var_ttis: Vec::new(),
                    },
                );
                &mut self.sl_alloc_queue[pos]
            }
        };
        let pos = slot.var_ttis.partition_point(|v| v.sym_start <= info.sym_start);
        slot.var_ttis.insert(pos, info);
    }

    /// Sidelink allocation of `sfn`. Allocations of past slots are dropped.
    pub fn take_sl_slot_alloc(&mut self, sfn: SfnSf) -> Option<SlSlotAlloc> {
        while let Some(front) = self.sl_alloc_queue.front() {
            if front.sfn >= sfn {
                break;
            }
            warn!("{} dropping stale sidelink allocation of {}", self.node, front.sfn);
            self.sl_alloc_queue.pop_front();
        }
        if self.sl_alloc_queue.front().is_some_and(|s| s.sfn == sfn) {
            self.sl_alloc_queue.pop_front()
        } else {
            None
        }
    }

    /// True if the allocation of `sfn` contains a var-TTI of `kind`
    pub fn slot_has_var_tti(&self, sfn: SfnSf, kind: VarTtiType) -> bool {
        self.peek_slot_alloc_info(sfn)
            .is_some_and(|a| a.var_tti_alloc_info.iter().any(|v| v.dci.var_tti_type == kind))
    }

    /// Bandwidth of one RB in Hz
    pub fn rb_width_hz(&self) -> f64 {
        self.noise_psd.rb_width_hz()
    }

    /// Subcarriers in the bandwidth
    pub fn num_subcarriers(&self) -> u32 {
        self.config.num_rbs as u32 * SUBCARRIERS_PER_RB
    }
}

impl PhySapProvider for PhyCore {
    fn send_mac_pdu(&mut self, packet: Packet, sfn: SfnSf, sym_start: u8, stream: u8) {
        self.set_mac_pdu(packet, sfn, sym_start, stream);
    }

    fn send_control_message(&mut self, msg: ControlMessage) {
        self.enqueue_ctrl_msg(msg);
    }

    fn set_slot_alloc_info(&mut self, alloc: SlotAllocInfo) {
        self.push_back_slot_alloc_info(alloc);
    }

    fn slot_period(&self) -> SimTime {
        PhyCore::slot_period(self)
    }

    fn cell_id(&self) -> CellId {
        self.cell_id
    }

    fn bw_in_rbs(&self) -> usize {
        self.config.num_rbs
    }

    fn num_rbg(&self) -> usize {
        self.config.num_rbg()
    }

    fn send_pscch_mac_pdu(&mut self, packet: Packet) {
        self.set_pscch_mac_pdu(packet);
    }

    fn send_pssch_mac_pdu(&mut self, packet: Packet) {
        self.set_pssch_mac_pdu(packet);
    }

    fn set_sl_var_tti_alloc_info(&mut self, sfn: SfnSf, info: SlVarTtiAllocInfo) {
        PhyCore::set_sl_var_tti_alloc_info(self, sfn, info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{AllocationType, DciFormat, DciInfo, SlVarTtiType, VarTtiAllocInfo};
    use crate::phy::frame::{PacketHeader, SciF2aHeader};
    use bytes::Bytes;
    use common::types::Rnti;
    use common::utils::dbm_to_watts;
    use std::sync::Arc;

    fn core(config: PhyConfig) -> PhyCore {
        PhyCore::new(config, NodeId(1), CellId(1), BwpId(0), DeviceRole::Gnb, 7).unwrap()
    }

    fn alloc(sfn: SfnSf, sym_start: u8, format: DciFormat, kind: VarTtiType) -> SlotAllocInfo {
        let mut alloc = SlotAllocInfo::new(sfn);
        alloc.alloc_type = match format {
            DciFormat::Dl => AllocationType::Dl,
            DciFormat::Ul => AllocationType::Ul,
        };
        alloc.num_sym_alloc = 1;
        alloc
            .var_tti_alloc_info
            .push_back(VarTtiAllocInfo::new(Arc::new(DciInfo::ctrl(sym_start, 1, format, kind, vec![true; 4]))));
        alloc
    }

    #[test]
    fn test_ctrl_msgs_wait_l1l2_latency() {
        let mut core = core(PhyConfig::default());
        core.enqueue_ctrl_msg(ControlMessage::Sib1 { cell_id: CellId(1) });
        core.enqueue_ctrl_msg_now(ControlMessage::Srs { rnti: Rnti(3) });

        let now = core.pop_current_slot_ctrl_msgs();
        assert_eq!(now.len(), 1);
        assert!(now[0].is_srs());

        // Default L1/L2 latency is 2 slots
        assert!(core.pop_current_slot_ctrl_msgs().is_empty());
        let later = core.pop_current_slot_ctrl_msgs();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].name(), "SIB1");
        assert!(core.is_ctrl_msg_list_empty());
    }

    #[test]
    fn test_slot_allocs_sorted_and_merged() {
        let mut core = core(PhyConfig::default());
        let s1 = SfnSf::new(0, 0, 1, 1);
        let s3 = SfnSf::new(0, 1, 1, 1);

        core.push_back_slot_alloc_info(alloc(s3, 0, DciFormat::Dl, VarTtiType::Ctrl));
        core.push_back_slot_alloc_info(alloc(s1, 0, DciFormat::Dl, VarTtiType::Ctrl));
        core.push_back_slot_alloc_info(alloc(s1, 13, DciFormat::Ul, VarTtiType::Ctrl));
        assert_eq!(core.slot_alloc_info_len(), 2);

        let first = core.retrieve_slot_alloc_info(s1).unwrap();
        assert_eq!(first.alloc_type, AllocationType::Both);
        assert_eq!(first.var_tti_alloc_info.len(), 2);
        assert_eq!(first.var_tti_alloc_info[0].dci.sym_start, 0);
        assert!(!core.slot_alloc_info_exists(s1));
        assert!(core.slot_alloc_info_exists(s3));
    }

    #[test]
    fn test_push_front_shifts_queue_and_bursts() {
        let mut core = core(PhyConfig::default());
        let s0 = SfnSf::new(0, 0, 0, 1);
        let s1 = s0.future(1);

        core.push_back_slot_alloc_info(alloc(s1, 1, DciFormat::Dl, VarTtiType::Data));
        core.set_mac_pdu(Packet::new(Bytes::from_static(b"queued")), s1, 1, 0);
        core.set_mac_pdu(Packet::new(Bytes::from_static(b"late")), s0, 1, 0);

        let current = alloc(s0, 1, DciFormat::Dl, VarTtiType::Data);
        core.push_front_slot_alloc_info(s1, current);

        assert!(core.slot_alloc_info_exists(s1));
        assert!(core.slot_alloc_info_exists(s1.future(1)));
        let late = core.take_packet_burst(s1, 1, 0).unwrap();
        assert_eq!(late[0].payload, Bytes::from_static(b"late"));
        let queued = core.take_packet_burst(s1.future(1), 1, 0).unwrap();
        assert_eq!(queued[0].payload, Bytes::from_static(b"queued"));
    }

    #[test]
    fn test_rbg_to_rbs() {
        let config = PhyConfig {
            num_rbs: 10,
            num_rb_per_rbg: 4,
            ..PhyConfig::default()
        };
        let core = core(config);
        assert_eq!(core.rbg_to_rbs(&[true, false, true]), vec![0, 1, 2, 3, 8, 9]);
    }

    #[test]
    fn test_tx_power_split_among_streams() {
        let config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        let core = core(config);
        let rbs = core.full_bandwidth_rbs();
        let one = core.tx_psd(&rbs, 1).integral();
        let two = core.tx_psd(&rbs, 2).integral();
        assert!((one - dbm_to_watts(30.0)).abs() / one < 1e-9);
        assert!((one / two - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_pssch_grouped_by_sci2() {
        let mut core = core(PhyConfig::default());
        let sci2 = PacketHeader::SciF2a(SciF2aHeader {
            harq_id: 0,
            ndi: 1,
            rv: 0,
            src_id: 1,
            dst_id: 2,
        });
        core.set_pssch_mac_pdu(Packet::new(Bytes::new()).with_header(sci2.clone()));
        core.set_pssch_mac_pdu(Packet::new(Bytes::from_static(b"a")));
        core.set_pssch_mac_pdu(Packet::new(Bytes::new()).with_header(sci2));
        core.set_pscch_mac_pdu(Packet::new(Bytes::from_static(b"c")));
        core.set_pscch_mac_pdu(Packet::new(Bytes::from_static(b"d")));

        assert_eq!(core.pop_pssch_burst().unwrap().len(), 2);
        assert_eq!(core.pop_pssch_burst().unwrap().len(), 1);
        assert!(core.pop_pssch_burst().is_none());
        assert_eq!(core.pop_pscch_burst().unwrap().len(), 1);
    }

    #[test]
    #[should_panic(expected = "before its SCI stage 2")]
    fn test_pssch_data_without_sci2_panics() {
        let mut core = core(PhyConfig::default());
        core.set_pssch_mac_pdu(Packet::new(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_sl_alloc_queue() {
        let mut core = core(PhyConfig::default());
        let s0 = SfnSf::new(0, 0, 0, 1);
        let data = SlVarTtiAllocInfo {
            sym_start: 4,
            sym_length: 9,
            rb_start: 0,
            rb_length: 10,
            kind: SlVarTtiType::Data,
        };
        let ctrl = SlVarTtiAllocInfo {
            sym_start: 1,
            sym_length: 3,
            kind: SlVarTtiType::Ctrl,
            ..data
        };
        core.set_sl_var_tti_alloc_info(s0.future(2), data);
        core.set_sl_var_tti_alloc_info(s0, data);
        core.set_sl_var_tti_alloc_info(s0, ctrl);

        let slot = core.take_sl_slot_alloc(s0).unwrap();
        assert_eq!(slot.var_ttis[0].kind, SlVarTtiType::Ctrl);
        assert_eq!(slot.var_ttis[1].kind, SlVarTtiType::Data);
        assert!(core.take_sl_slot_alloc(s0.future(1)).is_none());
        assert!(core.take_sl_slot_alloc(s0.future(2)).is_some());
    }

    #[test]
    fn test_set_config_keeps_queued_ctrl_msgs() {
        let mut core = core(PhyConfig::default());
        core.enqueue_ctrl_msg(ControlMessage::Sib1 { cell_id: CellId(1) });
        let config = PhyConfig {
            l1l2_ctrl_latency: 0,
            ..PhyConfig::default()
        };
        core.set_config(config).unwrap();
        assert_eq!(core.pop_current_slot_ctrl_msgs().len(), 1);
    }

    #[test]
    fn test_set_config_rejects_stream_change() {
        let mut core = core(PhyConfig::default());
        let config = PhyConfig {
            num_streams: 2,
            ..PhyConfig::default()
        };
        assert!(core.set_config(config).is_err());
        assert_eq!(core.num_streams(), 1);
    }
}
