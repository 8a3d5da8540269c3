//! Spectrum PHY
//!
//! Half-duplex radio state machine of one stream of a device. It receives
//! the signals the channel delivers, classifies them, feeds the interference
//! accumulators and, when a reception window closes, decodes the expected
//! TBs and reports upward through [`PhyIndication`]s.
//!
//! Contract violations (TX while receiving, misaligned concurrent
//! receptions, ...) are programming errors and panic.

mod sidelink;

pub use sidelink::{sidelink_rsrp_dbm, PsschRxInfo};

use super::beam::BeamManager;
use super::config::SpectrumPhyConfig;
use super::error_model::{draw_corruption, wideband_cqi, ErrorModel};
use super::frame::{is_only_srs, ControlMessage, FrameKind, PacketBurst, SignalFrame};
use super::harq::HarqPhy;
use super::interference::{Interference, RxSinr, SlInterference};
use super::spectrum_value::SpectrumValue;
use super::tb_registry::{
    sinr_stats, ExpectedTb, SlExpectedTb, SlTbKey, SlTransportBlockInfo, TbRegistry,
    TransportBlockInfo,
};
use super::trace::{RxPacketTrace, TraceRecord};
use super::{PhyAddr, PhyEvent, SimContext};
use crate::mac::{HarqStatus, ReceptionStatus, UlHarqInfo};
use common::sim::{EventId, SimTime};
use common::types::{BwpId, CellId, NodeId, Rnti};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Redundancy version of the last retransmission
const MAX_RV: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    Idle,
    Tx,
    RxData,
    RxDlCtrl,
    RxUlCtrl,
    RxUlSrs,
    CcaBusy,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RadioState::Idle => "IDLE",
            RadioState::Tx => "TX",
            RadioState::RxData => "RX_DATA",
            RadioState::RxDlCtrl => "RX_DL_CTRL",
            RadioState::RxUlCtrl => "RX_UL_CTRL",
            RadioState::RxUlSrs => "RX_UL_SRS",
            RadioState::CcaBusy => "CCA_BUSY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Gnb,
    Ue,
}

/// Timers a spectrum PHY schedules for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumTimer {
    EndTx,
    EndRxData,
    EndRxCtrl,
    EndRxSrs,
    EndRxSlFrame,
    CheckIfStillBusy,
}

/// Upward notifications, drained by the owning PHY after every call
#[derive(Debug, Clone)]
pub enum PhyIndication {
    /// Correctly decoded data packet
    DataReceived(super::frame::Packet),
    CtrlMessages { msgs: Vec<ControlMessage>, bwp_id: BwpId },
    UlHarqFeedback(UlHarqInfo),
    DlHarqFeedback {
        stream: u8,
        rnti: Rnti,
        status: HarqStatus,
        harq_id: u8,
        rv: u8,
    },
    SrsSinr { rnti: Rnti, sinr: f64 },
    DlCtrlSinr(SpectrumValue),
    /// Per-RB SINR of the data window that just closed
    DataSinr(SpectrumValue),
    PscchReceived {
        packet: super::frame::Packet,
        psd: SpectrumValue,
    },
    PsschReceived(PsschRxInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpectrumPhyStats {
    pub frames_transmitted: u64,
    pub tbs_received: u64,
    pub tbs_corrupted: u64,
    pub ctrl_lists_delivered: u64,
    /// Sidelink frames that arrived while transmitting
    pub sl_half_duplex_drops: u64,
    pub sl_tbs_received: u64,
    pub sl_tbs_corrupted: u64,
}

/// One sidelink signal of the current reception window
#[derive(Debug, Clone)]
struct SlRxSignal {
    frame: Arc<SignalFrame>,
    rb_bitmap: Vec<usize>,
    psd: SpectrumValue,
}

#[derive(Debug)]
pub struct SpectrumPhy {
    addr: PhyAddr,
    role: DeviceRole,
    cell_id: CellId,
    bwp_id: BwpId,
    config: SpectrumPhyConfig,
    state: RadioState,

    tx_psd: SpectrumValue,
    data_interference: Interference,
    ctrl_interference: Interference,
    srs_interference: Interference,
    sl_interference: SlInterference,

    error_model: Box<dyn ErrorModel>,
    sl_error_model: Box<dyn ErrorModel>,
    harq: HarqPhy,
    rng: ChaCha8Rng,
    beam: BeamManager,

    transport_blocks: TbRegistry<Rnti, TransportBlockInfo>,
    rx_packet_bursts: Vec<PacketBurst>,
    rx_ctrl_msgs: Vec<ControlMessage>,
    first_rx_start: SimTime,
    first_rx_duration: SimTime,
    current_srs_rnti: Option<Rnti>,

    busy_time_ends: SimTime,
    check_if_busy_event: Option<EventId>,

    sl_transport_blocks: TbRegistry<SlTbKey, SlTransportBlockInfo>,
    sl_rx_signals: Vec<SlRxSignal>,
    sl_rsrp_samples: Vec<f64>,

    stats: SpectrumPhyStats,
    indications: Vec<PhyIndication>,
}

impl SpectrumPhy {
    pub fn new(
        addr: PhyAddr,
        role: DeviceRole,
        cell_id: CellId,
        bwp_id: BwpId,
        config: SpectrumPhyConfig,
        noise: SpectrumValue,
        seed: u64,
    ) -> Self {
        let stream_seed = seed
            ^ ((addr.node.0 as u64) << 8 | addr.stream as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            addr,
            role,
            cell_id,
            bwp_id,
            error_model: config.error_model_type.create(),
            sl_error_model: config.sl_error_model_type.create(),
            config,
            state: RadioState::Idle,
            tx_psd: SpectrumValue::zeros(noise.num_rbs(), noise.rb_width_hz()),
            data_interference: Interference::new(noise.clone()),
            ctrl_interference: Interference::new(noise.clone()),
            srs_interference: Interference::new(noise.clone()),
            sl_interference: SlInterference::new(noise),
            harq: HarqPhy::new(),
            rng: ChaCha8Rng::seed_from_u64(stream_seed),
            beam: BeamManager::new(),
            transport_blocks: TbRegistry::new(),
            rx_packet_bursts: Vec::new(),
            rx_ctrl_msgs: Vec::new(),
            first_rx_start: SimTime::ZERO,
            first_rx_duration: SimTime::ZERO,
            current_srs_rnti: None,
            busy_time_ends: SimTime::ZERO,
            check_if_busy_event: None,
            sl_transport_blocks: TbRegistry::new(),
            sl_rx_signals: Vec::new(),
            sl_rsrp_samples: Vec::new(),
            stats: SpectrumPhyStats::default(),
            indications: Vec::new(),
        }
    }

    pub fn addr(&self) -> PhyAddr {
        self.addr
    }

    pub fn stream_id(&self) -> u8 {
        self.addr.stream
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// A UE learns its serving cell when attaching
    pub fn set_cell_id(&mut self, cell_id: CellId) {
        self.cell_id = cell_id;
    }

    pub fn bwp_id(&self) -> BwpId {
        self.bwp_id
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn stats(&self) -> &SpectrumPhyStats {
        &self.stats
    }

    pub fn config(&self) -> &SpectrumPhyConfig {
        &self.config
    }

    /// Replace the configuration, recreating the error models
    pub fn set_config(&mut self, config: SpectrumPhyConfig) {
        self.error_model = config.error_model_type.create();
        self.sl_error_model = config.sl_error_model_type.create();
        self.config = config;
    }

    /// Replace the noise PSD. Drops every tracked signal.
    pub fn set_noise_psd(&mut self, noise: SpectrumValue) {
        self.data_interference.set_noise_psd(noise.clone());
        self.ctrl_interference.set_noise_psd(noise.clone());
        self.srs_interference.set_noise_psd(noise.clone());
        self.sl_interference.set_noise_psd(noise);
    }

    pub fn set_tx_psd(&mut self, psd: SpectrumValue) {
        self.tx_psd = psd;
    }

    pub fn tx_psd(&self) -> &SpectrumValue {
        &self.tx_psd
    }

    pub fn harq(&self) -> &HarqPhy {
        &self.harq
    }

    pub fn beam_manager_mut(&mut self) -> &mut BeamManager {
        &mut self.beam
    }

    /// Point the antenna at `peer` if a vector toward it is known
    pub fn change_beam(&mut self, ctx: &mut SimContext, peer: NodeId) {
        if self.beam.change_beam(peer) {
            self.sync_beam(ctx);
        }
    }

    pub fn change_to_quasi_omni(&mut self, ctx: &mut SimContext) {
        self.beam.change_to_quasi_omni();
        self.sync_beam(ctx);
    }

    fn sync_beam(&self, ctx: &mut SimContext) {
        if let Some(channel) = ctx.channel.as_mut() {
            channel.set_beam(self.addr, self.beam.current().clone());
        }
    }

    pub fn take_indications(&mut self) -> Vec<PhyIndication> {
        std::mem::take(&mut self.indications)
    }

    fn change_state(&mut self, new_state: RadioState) {
        trace!("{} state {} -> {}", self.addr, self.state, new_state);
        self.state = new_state;
    }

    fn schedule_timer(&self, ctx: &mut SimContext, delay: SimTime, timer: SpectrumTimer) -> EventId {
        ctx.queue.schedule(
            delay,
            PhyEvent::Spectrum {
                to: self.addr,
                timer,
            },
        )
    }

    // ------------------------------------------------------------------------
    // Expected receptions
    // ------------------------------------------------------------------------

    /// Announce the TB `rnti` will receive in the next data window. A TB
    /// still expected for the same RNTI is dropped.
    pub fn add_expected_tb(&mut self, rnti: Rnti, expected: ExpectedTb) {
        debug!(
            "{} expects TB from/to {}: size {} mcs {} harq {} rv {} RBs {}",
            self.addr,
            rnti,
            expected.tb_size,
            expected.mcs,
            expected.harq_process_id,
            expected.rv,
            expected.rb_bitmap.len()
        );
        self.transport_blocks
            .add_expected(rnti, TransportBlockInfo::new(expected));
    }

    pub fn expected_tbs(&self) -> usize {
        self.transport_blocks.len()
    }

    pub fn add_expected_srs_rnti(&mut self, rnti: Rnti) {
        self.current_srs_rnti = Some(rnti);
    }

    /// Announce a sidelink TB. Two TBs for the same key in the same slot
    /// is a contract violation.
    pub fn add_sl_expected_tb(&mut self, key: SlTbKey, expected: SlExpectedTb) {
        if let Some(existing) = self.sl_transport_blocks.get(&key) {
            assert!(
                existing.expected.sfn != expected.sfn,
                "I did not expect two TBs from a same RNTI in the same slot"
            );
        }
        debug!(
            "{} expects SL TB from {} for {} at {}",
            self.addr, key.rnti, key.dst_l2_id, expected.sfn
        );
        self.sl_transport_blocks
            .add_expected(key, SlTransportBlockInfo::new(expected));
    }

    pub fn expected_sl_tbs(&self) -> usize {
        self.sl_transport_blocks.len()
    }

    pub fn clear_expected_sl_tb(&mut self) {
        self.sl_transport_blocks.clear_all();
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    pub fn start_tx_data_frames(
        &mut self,
        ctx: &mut SimContext,
        packets: PacketBurst,
        ctrl_msgs: Vec<ControlMessage>,
        duration: SimTime,
    ) {
        self.start_tx(ctx, FrameKind::Data, Some(packets), ctrl_msgs, duration);
    }

    pub fn start_tx_dl_control_frames(
        &mut self,
        ctx: &mut SimContext,
        ctrl_msgs: Vec<ControlMessage>,
        duration: SimTime,
    ) {
        self.start_tx(ctx, FrameKind::DlCtrl, None, ctrl_msgs, duration);
    }

    pub fn start_tx_ul_control_frames(
        &mut self,
        ctx: &mut SimContext,
        ctrl_msgs: Vec<ControlMessage>,
        duration: SimTime,
    ) {
        self.start_tx(ctx, FrameKind::UlCtrl, None, ctrl_msgs, duration);
    }

    pub fn start_tx_sl_ctrl_frames(&mut self, ctx: &mut SimContext, packets: PacketBurst, duration: SimTime) {
        self.start_tx(ctx, FrameKind::SlCtrl, Some(packets), Vec::new(), duration);
    }

    pub fn start_tx_sl_data_frames(&mut self, ctx: &mut SimContext, packets: PacketBurst, duration: SimTime) {
        self.start_tx(ctx, FrameKind::SlData, Some(packets), Vec::new(), duration);
    }

    fn start_tx(
        &mut self,
        ctx: &mut SimContext,
        kind: FrameKind,
        packets: Option<PacketBurst>,
        ctrl_msgs: Vec<ControlMessage>,
        duration: SimTime,
    ) {
        match self.state {
            RadioState::RxData | RadioState::RxDlCtrl | RadioState::RxUlCtrl | RadioState::RxUlSrs => {
                panic!("Cannot TX while RX.")
            }
            RadioState::Tx => panic!("Cannot TX while already TX."),
            RadioState::CcaBusy => warn!("Start transmitting {:?} while in CCA_BUSY state.", kind),
            RadioState::Idle => {}
        }

        self.change_state(RadioState::Tx);
        self.stats.frames_transmitted += 1;

        let frame = SignalFrame {
            kind,
            source: self.addr,
            cell_id: self.cell_id,
            bwp_id: self.bwp_id,
            duration,
            psd: self.tx_psd.clone(),
            packets,
            ctrl_msgs,
        };

        match ctx.channel.as_mut() {
            Some(channel) => channel.start_tx(&mut ctx.queue, frame),
            None => warn!("Working without channel (i.e., under test)"),
        }

        self.schedule_timer(ctx, duration, SpectrumTimer::EndTx);
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    /// Entry point for every signal the channel delivers to this PHY
    pub fn start_rx(&mut self, ctx: &mut SimContext, psd: SpectrumValue, frame: Arc<SignalFrame>) {
        let now = ctx.now();
        let duration = frame.duration;

        self.sl_interference.add_signal(now, &psd, duration);

        let same_cell = frame.cell_id == self.cell_id;
        let same_stream = frame.source_stream() == self.addr.stream;

        if same_cell && !same_stream && matches!(frame.kind, FrameKind::Data | FrameKind::DlCtrl) {
            let scaled = psd.scaled(self.config.inter_stream_interference_ratio);
            trace!(
                "{} inter-stream interference from {}, ratio {}",
                self.addr,
                frame.source,
                self.config.inter_stream_interference_ratio
            );
            if frame.kind == FrameKind::Data {
                self.data_interference.add_signal(now, &scaled, duration);
            } else {
                self.ctrl_interference.add_signal(now, &scaled, duration);
            }
            return;
        }

        self.data_interference.add_signal(now, &psd, duration);
        self.srs_interference.add_signal(now, &psd, duration);

        match frame.kind {
            FrameKind::Data => {
                if same_cell && same_stream {
                    self.start_rx_data(ctx, &psd, &frame);
                } else {
                    info!(
                        "{} received DATA not in sync with this signal (cellId={}, streamId={})",
                        self.addr,
                        frame.cell_id.0,
                        frame.source_stream()
                    );
                }
            }
            FrameKind::DlCtrl => {
                self.ctrl_interference.add_signal(now, &psd, duration);
                match self.role {
                    DeviceRole::Ue if same_cell && same_stream => {
                        self.ctrl_interference.start_rx(now, &psd);
                        self.start_rx_dl_ctrl(ctx, &frame);
                    }
                    DeviceRole::Ue => {
                        info!("{} received DL CTRL not in sync with this signal", self.addr)
                    }
                    DeviceRole::Gnb => debug!("{} DL CTRL ignored at gNB", self.addr),
                }
            }
            FrameKind::UlCtrl => match self.role {
                DeviceRole::Gnb if same_cell && same_stream => {
                    if is_only_srs(&frame.ctrl_msgs) {
                        self.start_rx_srs(ctx, &psd, &frame);
                    } else {
                        self.start_rx_ul_ctrl(ctx, &frame);
                    }
                }
                DeviceRole::Gnb => {
                    info!("{} received UL CTRL not in sync with this signal", self.addr)
                }
                DeviceRole::Ue => debug!("{} UL CTRL ignored at UE", self.addr),
            },
            FrameKind::SlCtrl | FrameKind::SlData => match self.role {
                DeviceRole::Gnb => debug!("{} sidelink frame ignored at gNB", self.addr),
                DeviceRole::Ue if self.state == RadioState::Tx => {
                    self.stats.sl_half_duplex_drops += 1;
                    debug!(
                        "{} sidelink {:?} from {} dropped: transmitting (half duplex)",
                        self.addr, frame.kind, frame.source
                    );
                }
                DeviceRole::Ue => self.start_rx_sl_frame(ctx, psd, frame),
            },
        }

        if self.config.unlicensed_mode && self.state == RadioState::Idle {
            self.maybe_cca_busy(ctx);
        }
    }

    fn start_rx_data(&mut self, ctx: &mut SimContext, psd: &SpectrumValue, frame: &SignalFrame) {
        let now = ctx.now();
        match self.state {
            RadioState::Tx => {
                if self.role == DeviceRole::Gnb {
                    panic!(
                        "eNB transmission overlaps in time with UE transmission. CellId:{}",
                        frame.cell_id.0
                    );
                }
                let overlap = self.tx_psd.product(psd).sum();
                assert!(
                    overlap == 0.0,
                    "Transmissions overlap in frequency. Their power product is {}",
                    overlap
                );
            }
            RadioState::RxDlCtrl | RadioState::RxUlCtrl | RadioState::RxUlSrs => {
                panic!("Cannot receive DATA while receiving CTRL.")
            }
            RadioState::Idle | RadioState::RxData | RadioState::CcaBusy => {
                if self.state == RadioState::CcaBusy {
                    debug!("{} start receiving DATA while in CCA_BUSY state", self.addr);
                }
                self.data_interference.start_rx(now, psd);

                if self.state != RadioState::RxData {
                    self.first_rx_start = now;
                    self.first_rx_duration = frame.duration;
                    self.schedule_timer(ctx, frame.duration, SpectrumTimer::EndRxData);
                } else {
                    assert!(
                        self.first_rx_start == now && self.first_rx_duration == frame.duration,
                        "Concurrent data receptions must share start time and duration: \
                         first started at {} for {}, this one at {} for {}",
                        self.first_rx_start,
                        self.first_rx_duration,
                        now,
                        frame.duration
                    );
                }

                self.change_state(RadioState::RxData);

                if let Some(packets) = frame.packets.as_ref().filter(|p| !p.is_empty()) {
                    self.rx_packet_bursts.push(packets.clone());
                }
                self.rx_ctrl_msgs.extend(frame.ctrl_msgs.iter().cloned());
            }
        }
    }

    fn start_rx_dl_ctrl(&mut self, ctx: &mut SimContext, frame: &SignalFrame) {
        match self.state {
            RadioState::Tx => panic!("Cannot RX while TX."),
            RadioState::RxData => panic!("Cannot RX CTRL while receiving DATA."),
            RadioState::RxDlCtrl => panic!("Cannot RX DL CTRL while already receiving DL CTRL."),
            RadioState::RxUlCtrl | RadioState::RxUlSrs => {
                panic!("UE should never be in RX_UL_CTRL or RX_UL_SRS state.")
            }
            RadioState::Idle | RadioState::CcaBusy => {
                self.rx_ctrl_msgs = frame.ctrl_msgs.clone();
                self.schedule_timer(ctx, frame.duration, SpectrumTimer::EndRxCtrl);
                self.change_state(RadioState::RxDlCtrl);
            }
        }
    }

    fn start_rx_ul_ctrl(&mut self, ctx: &mut SimContext, frame: &SignalFrame) {
        let now = ctx.now();
        match self.state {
            RadioState::Tx => panic!("Cannot RX UL CTRL while TX."),
            RadioState::RxData => panic!("Cannot RX UL CTRL while receiving DATA."),
            RadioState::RxUlSrs => panic!("Cannot start RX UL CTRL while already receiving SRS."),
            RadioState::RxDlCtrl => panic!("gNB should not be in RX_DL_CTRL state."),
            RadioState::Idle | RadioState::CcaBusy => {
                self.first_rx_start = now;
                self.first_rx_duration = frame.duration;
                self.rx_ctrl_msgs = frame.ctrl_msgs.clone();
                self.schedule_timer(ctx, frame.duration, SpectrumTimer::EndRxCtrl);
                self.change_state(RadioState::RxUlCtrl);
            }
            RadioState::RxUlCtrl => {
                assert!(
                    self.first_rx_start == now && self.first_rx_duration == frame.duration,
                    "Concurrent UL CTRL receptions must share start time and duration: \
                     first started at {} for {}, this one at {} for {}",
                    self.first_rx_start,
                    self.first_rx_duration,
                    now,
                    frame.duration
                );
                self.rx_ctrl_msgs.extend(frame.ctrl_msgs.iter().cloned());
            }
        }
    }

    fn start_rx_srs(&mut self, ctx: &mut SimContext, psd: &SpectrumValue, frame: &SignalFrame) {
        let now = ctx.now();
        match self.state {
            RadioState::RxUlSrs => {
                panic!("Cannot receive two SRS at the same time: one SRS reception is already ongoing.")
            }
            RadioState::Tx => panic!("Cannot RX SRS while TX."),
            RadioState::RxData => panic!("Cannot RX SRS while receiving DATA."),
            RadioState::RxUlCtrl => panic!(
                "gNB should not receive simultaneously non SRS and SRS uplink control signals"
            ),
            RadioState::RxDlCtrl => panic!("gNB should not be in RX_DL_CTRL state."),
            RadioState::Idle | RadioState::CcaBusy => {
                self.srs_interference.start_rx(now, psd);
                self.first_rx_start = now;
                self.first_rx_duration = frame.duration;
                self.rx_ctrl_msgs = frame.ctrl_msgs.clone();
                self.schedule_timer(ctx, frame.duration, SpectrumTimer::EndRxSrs);
                self.change_state(RadioState::RxUlSrs);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    pub fn handle_timer(&mut self, ctx: &mut SimContext, timer: SpectrumTimer) {
        match timer {
            SpectrumTimer::EndTx => self.end_tx(ctx),
            SpectrumTimer::EndRxData => self.end_rx_data(ctx),
            SpectrumTimer::EndRxCtrl => self.end_rx_ctrl(ctx),
            SpectrumTimer::EndRxSrs => self.end_rx_srs(ctx),
            SpectrumTimer::EndRxSlFrame => self.end_rx_sl_frame(ctx),
            SpectrumTimer::CheckIfStillBusy => self.check_if_still_busy(ctx),
        }
    }

    fn return_to_idle(&mut self, ctx: &mut SimContext) {
        if self.config.unlicensed_mode {
            self.maybe_cca_busy(ctx);
        } else {
            self.change_state(RadioState::Idle);
        }
    }

    fn end_tx(&mut self, ctx: &mut SimContext) {
        assert_eq!(self.state, RadioState::Tx, "End of transmission while not in TX state");
        self.return_to_idle(ctx);
    }

    fn end_rx_data(&mut self, ctx: &mut SimContext) {
        let now = ctx.now();
        let RxSinr { sinr, .. } = self.data_interference.end_rx(now);
        assert_eq!(self.state, RadioState::RxData, "End of data reception while not in RX_DATA state");

        self.indications.push(PhyIndication::DataSinr(sinr.clone()));
        let cqi = match self.role {
            DeviceRole::Ue => wideband_cqi(&sinr),
            DeviceRole::Gnb => 0,
        };

        let use_error_model = self.config.data_error_model_enabled && !self.rx_packet_bursts.is_empty();

        for (rnti, tb) in self.transport_blocks.iter_mut() {
            let stats = sinr_stats(&sinr, &tb.expected.rb_bitmap);
            tb.sinr_avg = stats.avg;
            tb.sinr_min = stats.min;

            if !use_error_model {
                continue;
            }

            let process = tb.expected.harq_process_id;
            let history = if tb.expected.is_downlink {
                self.harq.dl_history(*rnti, process)
            } else {
                self.harq.ul_history(*rnti, process)
            };
            let output = self.error_model.tb_decodification_stats(
                &sinr,
                &tb.expected.rb_bitmap,
                tb.expected.tb_size,
                tb.expected.mcs,
                &history,
            );
            tb.is_corrupted = draw_corruption(&mut self.rng, output.tbler);
            trace!(
                "{} TB of {}: sinr avg {:.3} min {:.3} tbler {:.4} corrupted {}",
                self.addr,
                rnti,
                tb.sinr_avg,
                tb.sinr_min,
                output.tbler,
                tb.is_corrupted
            );
            tb.output = Some(Arc::new(output));
        }

        let bursts = std::mem::take(&mut self.rx_packet_bursts);
        for packet in bursts.iter().flatten() {
            if packet.size() == 0 {
                continue;
            }
            let Some(bearer) = packet.bearer else {
                panic!("No radio bearer tag found");
            };
            let rnti = bearer.rnti;
            let Some(tb) = self.transport_blocks.get_mut(&rnti) else {
                trace!("{} packet of {} not expected here", self.addr, rnti);
                continue;
            };

            if !tb.is_corrupted {
                self.indications.push(PhyIndication::DataReceived(packet.clone()));
            }

            let expected = &tb.expected;
            let mut record = RxPacketTrace::header(now, self.cell_id, self.bwp_id, rnti, expected.sfn);
            record.downlink = expected.is_downlink;
            record.stream = self.addr.stream;
            record.sym_start = expected.sym_start;
            record.num_sym = expected.num_sym;
            record.tb_size = expected.tb_size;
            record.mcs = expected.mcs;
            record.rv = expected.rv;
            record.sinr = tb.sinr_avg;
            record.sinr_min = tb.sinr_min;
            record.tbler = tb.output.as_ref().map_or(0.0, |o| o.tbler);
            record.corrupt = tb.is_corrupted;
            record.rb_assigned_num = expected.rb_bitmap.len();
            record.cqi = cqi;
            ctx.traces.push(TraceRecord::RxData(record));

            if tb.harq_feedback_sent {
                continue;
            }
            tb.harq_feedback_sent = true;

            self.stats.tbs_received += 1;
            if tb.is_corrupted {
                self.stats.tbs_corrupted += 1;
            }

            let process = expected.harq_process_id;
            let rv = expected.rv;
            let ok = !tb.is_corrupted;

            if expected.is_downlink {
                self.indications.push(PhyIndication::DlHarqFeedback {
                    stream: self.addr.stream,
                    rnti,
                    status: if ok { HarqStatus::Ack } else { HarqStatus::Nack },
                    harq_id: process,
                    rv,
                });
                if ok || rv == MAX_RV {
                    self.harq.reset_dl(rnti, process);
                } else if let Some(output) = &tb.output {
                    self.harq.update_dl(rnti, process, Arc::clone(output));
                }
            } else {
                self.indications.push(PhyIndication::UlHarqFeedback(UlHarqInfo {
                    rnti,
                    harq_process_id: process,
                    reception_status: if ok { ReceptionStatus::Ok } else { ReceptionStatus::NotOk },
                    tpc: 0,
                    num_retx: rv,
                }));
                if ok || rv == MAX_RV {
                    self.harq.reset_ul(rnti, process);
                } else if let Some(output) = &tb.output {
                    self.harq.update_ul(rnti, process, Arc::clone(output));
                }
            }
        }

        self.deliver_ctrl_msgs();
        self.return_to_idle(ctx);
        self.transport_blocks.clear_all();
    }

    fn deliver_ctrl_msgs(&mut self) {
        let msgs = std::mem::take(&mut self.rx_ctrl_msgs);
        if !msgs.is_empty() {
            self.stats.ctrl_lists_delivered += 1;
            self.indications.push(PhyIndication::CtrlMessages {
                msgs,
                bwp_id: self.bwp_id,
            });
        }
    }

    fn end_rx_ctrl(&mut self, ctx: &mut SimContext) {
        assert!(
            matches!(self.state, RadioState::RxDlCtrl | RadioState::RxUlCtrl),
            "End of control reception while in {} state",
            self.state
        );

        // Only DL control opens a window on the control accumulator
        if self.ctrl_interference.is_receiving() {
            let RxSinr { sinr, .. } = self.ctrl_interference.end_rx(ctx.now());
            self.indications.push(PhyIndication::DlCtrlSinr(sinr));
        }

        self.deliver_ctrl_msgs();
        self.return_to_idle(ctx);
    }

    fn end_rx_srs(&mut self, ctx: &mut SimContext) {
        assert_eq!(self.state, RadioState::RxUlSrs, "End of SRS reception while not in RX_UL_SRS state");
        assert_eq!(self.rx_ctrl_msgs.len(), 1, "Did not receive exactly one SRS");

        let RxSinr { sinr, .. } = self.srs_interference.end_rx(ctx.now());
        match self.current_srs_rnti.take() {
            Some(rnti) => self.indications.push(PhyIndication::SrsSinr {
                rnti,
                sinr: sinr.mean(),
            }),
            None => debug!("{} SRS received without an expected RNTI", self.addr),
        }

        self.deliver_ctrl_msgs();
        self.return_to_idle(ctx);
    }

    // ------------------------------------------------------------------------
    // Clear channel assessment
    // ------------------------------------------------------------------------

    /// Go to CCA_BUSY while the received energy exceeds the CCA threshold,
    /// otherwise to IDLE
    pub fn maybe_cca_busy(&mut self, ctx: &mut SimContext) {
        let now = ctx.now();
        let delay = self
            .data_interference
            .energy_duration(now, self.config.cca_threshold_w());

        if !delay.is_zero() {
            self.change_state(RadioState::CcaBusy);
            let ends = now + delay;
            if self.busy_time_ends < ends {
                self.busy_time_ends = ends;
                if let Some(id) = self.check_if_busy_event.take() {
                    ctx.queue.cancel(id);
                }
                debug!("{} CCA busy until {}", self.addr, ends);
                self.check_if_busy_event =
                    Some(self.schedule_timer(ctx, delay, SpectrumTimer::CheckIfStillBusy));
            }
        } else {
            let pending = self
                .check_if_busy_event
                .is_some_and(|id| ctx.queue.is_pending(id));
            assert!(
                !pending,
                "Unexpected state: returning to IDLE while there is an event running that should switch from CCA_BUSY to IDLE ?!"
            );
            self.change_state(RadioState::Idle);
        }
    }

    fn check_if_still_busy(&mut self, ctx: &mut SimContext) {
        self.check_if_busy_event = None;
        match self.state {
            RadioState::Idle => panic!("This function should not be called when in IDLE state."),
            RadioState::CcaBusy => self.maybe_cca_busy(ctx),
            other => debug!("{} CCA recheck ignored in {} state", self.addr, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{DciFormat, DciInfo, VarTtiType};
    use crate::phy::frame::{Packet, RadioBearerTag};
    use bytes::Bytes;
    use common::types::SfnSf;

    const NUM_RBS: usize = 4;

    fn spectrum(role: DeviceRole, node: u32, stream: u8, config: SpectrumPhyConfig) -> SpectrumPhy {
        let noise = SpectrumValue::from_values(vec![1e-15; NUM_RBS], 1.0);
        SpectrumPhy::new(
            PhyAddr::new(NodeId(node), stream),
            role,
            CellId(5),
            BwpId(0),
            config,
            noise,
            42,
        )
    }

    fn frame(kind: FrameKind, node: u32, stream: u8, cell: u16, duration: SimTime) -> SignalFrame {
        SignalFrame {
            kind,
            source: PhyAddr::new(NodeId(node), stream),
            cell_id: CellId(cell),
            bwp_id: BwpId(0),
            duration,
            psd: SpectrumValue::zeros(NUM_RBS, 1.0),
            packets: None,
            ctrl_msgs: Vec::new(),
        }
    }

    fn psd(watts: f64) -> SpectrumValue {
        SpectrumValue::from_values(vec![watts, 0.0, 0.0, 0.0], 1.0)
    }

    fn run(ctx: &mut SimContext, phy: &mut SpectrumPhy) -> Vec<SimTime> {
        let mut fired = Vec::new();
        while let Some((t, event)) = ctx.queue.pop() {
            match event {
                PhyEvent::Spectrum { timer, .. } => {
                    fired.push(t);
                    phy.handle_timer(ctx, timer);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        fired
    }

    fn expected_tb(rb_bitmap: Vec<usize>, is_downlink: bool) -> ExpectedTb {
        ExpectedTb {
            ndi: 1,
            tb_size: 100,
            mcs: 5,
            rb_bitmap,
            harq_process_id: 2,
            rv: 0,
            is_downlink,
            sym_start: 1,
            num_sym: 12,
            sfn: SfnSf::new(0, 0, 1, 1),
        }
    }

    fn data_packet(rnti: u16) -> Packet {
        Packet::new(Bytes::from(vec![7u8; 40])).with_bearer(RadioBearerTag {
            rnti: Rnti(rnti),
            lcid: 3,
            layer: 0,
        })
    }

    #[test]
    fn test_other_stream_is_interference_only() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());

        let f = frame(FrameKind::Data, 1, 1, 5, SimTime::from_micros(100));
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));

        assert_eq!(phy.state(), RadioState::Idle);
        assert!(ctx.queue.is_empty());
        assert!(phy.take_indications().is_empty());
    }

    #[test]
    fn test_tx_then_idle() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());

        phy.start_tx_dl_control_frames(&mut ctx, Vec::new(), SimTime::from_micros(36));
        assert_eq!(phy.state(), RadioState::Tx);
        assert_eq!(phy.stats().frames_transmitted, 1);

        let fired = run(&mut ctx, &mut phy);
        assert_eq!(fired, vec![SimTime::from_micros(36)]);
        assert_eq!(phy.state(), RadioState::Idle);
    }

    #[test]
    #[should_panic(expected = "Cannot TX while already TX.")]
    fn test_double_tx_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        phy.start_tx_dl_control_frames(&mut ctx, Vec::new(), SimTime::from_micros(36));
        phy.start_tx_dl_control_frames(&mut ctx, Vec::new(), SimTime::from_micros(36));
    }

    #[test]
    #[should_panic(expected = "Cannot TX while RX.")]
    fn test_tx_while_rx_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());
        let mut f = frame(FrameKind::DlCtrl, 1, 0, 5, SimTime::from_micros(36));
        f.ctrl_msgs.push(ControlMessage::Sib1 { cell_id: CellId(5) });
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        assert_eq!(phy.state(), RadioState::RxDlCtrl);
        phy.start_tx_ul_control_frames(&mut ctx, Vec::new(), SimTime::from_micros(36));
    }

    #[test]
    fn test_dl_ctrl_is_delivered_once() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());
        let mut f = frame(FrameKind::DlCtrl, 1, 0, 5, SimTime::from_micros(36));
        let dci = Arc::new(DciInfo::ctrl(0, 1, DciFormat::Dl, VarTtiType::Ctrl, vec![true]));
        f.ctrl_msgs.push(ControlMessage::DlDci { dci, k0: 0, k1: 2 });
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        run(&mut ctx, &mut phy);

        let indications = phy.take_indications();
        let lists: Vec<_> = indications
            .iter()
            .filter_map(|i| match i {
                PhyIndication::CtrlMessages { msgs, .. } => Some(msgs.len()),
                _ => None,
            })
            .collect();
        assert_eq!(lists, vec![1]);
        assert!(indications.iter().any(|i| matches!(i, PhyIndication::DlCtrlSinr(_))));
        assert_eq!(phy.state(), RadioState::Idle);
    }

    #[test]
    fn test_gnb_ignores_dl_ctrl() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 3, 0, SpectrumPhyConfig::default());
        let f = frame(FrameKind::DlCtrl, 1, 0, 5, SimTime::from_micros(36));
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        assert_eq!(phy.state(), RadioState::Idle);
        assert!(ctx.queue.is_empty());
    }

    #[test]
    fn test_ul_ctrl_from_two_ues_is_merged() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        let duration = SimTime::from_micros(36);

        for (node, rnti) in [(2, 1), (3, 2)] {
            let mut f = frame(FrameKind::UlCtrl, node, 0, 5, duration);
            f.ctrl_msgs.push(ControlMessage::Bsr { rnti: Rnti(rnti), buffer_bytes: 100 });
            phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        }
        assert_eq!(phy.state(), RadioState::RxUlCtrl);
        assert_eq!(ctx.queue.len(), 1);

        run(&mut ctx, &mut phy);
        let lists: Vec<_> = phy
            .take_indications()
            .into_iter()
            .filter_map(|i| match i {
                PhyIndication::CtrlMessages { msgs, .. } => Some(msgs),
                _ => None,
            })
            .collect();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].len(), 2);
        assert_eq!(phy.stats().ctrl_lists_delivered, 1);
    }

    #[test]
    #[should_panic(expected = "must share start time and duration")]
    fn test_ul_ctrl_with_other_duration_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        for (node, micros) in [(2, 36), (3, 36), (4, 72)] {
            let mut f = frame(FrameKind::UlCtrl, node, 0, 5, SimTime::from_micros(micros));
            f.ctrl_msgs.push(ControlMessage::Bsr { rnti: Rnti(node as u16), buffer_bytes: 1 });
            phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        }
    }

    #[test]
    fn test_srs_report() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        phy.add_expected_srs_rnti(Rnti(9));

        let mut f = frame(FrameKind::UlCtrl, 2, 0, 5, SimTime::from_micros(36));
        f.ctrl_msgs.push(ControlMessage::Srs { rnti: Rnti(9) });
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        assert_eq!(phy.state(), RadioState::RxUlSrs);
        run(&mut ctx, &mut phy);

        let indications = phy.take_indications();
        assert!(indications
            .iter()
            .any(|i| matches!(i, PhyIndication::SrsSinr { rnti, sinr } if *rnti == Rnti(9) && *sinr > 0.0)));
        assert_eq!(phy.state(), RadioState::Idle);
    }

    #[test]
    #[should_panic(expected = "gNB should not receive simultaneously non SRS and SRS")]
    fn test_srs_during_ul_ctrl_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        let mut ctrl = frame(FrameKind::UlCtrl, 2, 0, 5, SimTime::from_micros(36));
        ctrl.ctrl_msgs.push(ControlMessage::Bsr { rnti: Rnti(1), buffer_bytes: 1 });
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(ctrl));
        let mut srs = frame(FrameKind::UlCtrl, 3, 0, 5, SimTime::from_micros(36));
        srs.ctrl_msgs.push(ControlMessage::Srs { rnti: Rnti(2) });
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(srs));
    }

    #[test]
    fn test_ul_data_without_error_model() {
        let config = SpectrumPhyConfig {
            data_error_model_enabled: false,
            ..SpectrumPhyConfig::default()
        };
        let mut ctx = SimContext::new(None, crate::phy::trace::TraceSink::new(true));
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, config);
        phy.add_expected_tb(Rnti(1), expected_tb(vec![0, 1], false));

        let mut f = frame(FrameKind::Data, 2, 0, 5, SimTime::from_micros(400));
        f.packets = Some(vec![data_packet(1), data_packet(1), data_packet(4)]);
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        run(&mut ctx, &mut phy);

        let indications = phy.take_indications();
        let delivered = indications
            .iter()
            .filter(|i| matches!(i, PhyIndication::DataReceived(_)))
            .count();
        let feedback: Vec<_> = indications
            .iter()
            .filter_map(|i| match i {
                PhyIndication::UlHarqFeedback(info) => Some(info.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, 2);
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].is_received_ok());
        assert_eq!(feedback[0].harq_process_id, 2);
        assert_eq!(ctx.traces.records().len(), 2);
        assert_eq!(phy.expected_tbs(), 0);
        assert_eq!(phy.stats().tbs_received, 1);
    }

    #[test]
    fn test_dl_data_high_sinr_is_acked() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());
        phy.add_expected_tb(Rnti(1), expected_tb(vec![0], true));

        let mut f = frame(FrameKind::Data, 1, 0, 5, SimTime::from_micros(400));
        f.packets = Some(vec![data_packet(1)]);
        phy.start_rx(&mut ctx, psd(1e-6), Arc::new(f));
        run(&mut ctx, &mut phy);

        let indications = phy.take_indications();
        assert!(indications.iter().any(|i| matches!(
            i,
            PhyIndication::DlHarqFeedback { status: HarqStatus::Ack, harq_id: 2, .. }
        )));
        assert!(indications.iter().any(|i| matches!(i, PhyIndication::DataReceived(_))));
        assert!(phy.harq().dl_history(Rnti(1), 2).is_empty());
    }

    /// Receive one DL TB of RNTI 1 on process 2 at about -20 dB SINR
    fn receive_weak_dl_tb(ctx: &mut SimContext, phy: &mut SpectrumPhy, rv: u8) -> Vec<PhyIndication> {
        let mut tb = expected_tb(vec![0], true);
        tb.rv = rv;
        phy.add_expected_tb(Rnti(1), tb);

        let mut f = frame(FrameKind::Data, 1, 0, 5, SimTime::from_micros(400));
        f.packets = Some(vec![data_packet(1)]);
        phy.start_rx(ctx, psd(1e-17), Arc::new(f));
        run(ctx, phy);
        phy.take_indications()
    }

    fn is_dl_nack(indication: &PhyIndication) -> bool {
        matches!(
            indication,
            PhyIndication::DlHarqFeedback { status: HarqStatus::Nack, harq_id: 2, .. }
        )
    }

    #[test]
    fn test_dl_nack_extends_harq_history() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());

        let indications = receive_weak_dl_tb(&mut ctx, &mut phy, 0);
        assert!(indications.iter().any(is_dl_nack));
        assert!(!indications.iter().any(|i| matches!(i, PhyIndication::DataReceived(_))));
        assert_eq!(phy.harq().dl_history(Rnti(1), 2).len(), 1);

        let indications = receive_weak_dl_tb(&mut ctx, &mut phy, 1);
        assert!(indications.iter().any(is_dl_nack));
        let history = phy.harq().dl_history(Rnti(1), 2);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.tbler > 0.99));
        assert!(phy.harq().dl_history(Rnti(1), 3).is_empty());
    }

    #[test]
    fn test_dl_nack_at_last_rv_clears_harq_history() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());

        receive_weak_dl_tb(&mut ctx, &mut phy, 0);
        receive_weak_dl_tb(&mut ctx, &mut phy, 1);
        assert_eq!(phy.harq().dl_history(Rnti(1), 2).len(), 2);

        let indications = receive_weak_dl_tb(&mut ctx, &mut phy, MAX_RV);
        assert!(indications.iter().any(is_dl_nack));
        assert!(phy.harq().dl_history(Rnti(1), 2).is_empty());
        assert_eq!(phy.stats().tbs_corrupted, 3);
    }

    #[test]
    #[should_panic(expected = "End of transmission while not in TX state")]
    fn test_end_tx_while_idle_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        phy.handle_timer(&mut ctx, SpectrumTimer::EndTx);
    }

    #[test]
    #[should_panic(expected = "No radio bearer tag found")]
    fn test_packet_without_bearer_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        let mut f = frame(FrameKind::Data, 2, 0, 5, SimTime::from_micros(400));
        f.packets = Some(vec![Packet::new(Bytes::from_static(b"abc"))]);
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        run(&mut ctx, &mut phy);
    }

    #[test]
    #[should_panic(expected = "eNB transmission overlaps in time with UE transmission")]
    fn test_gnb_data_while_tx_panics() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Gnb, 1, 0, SpectrumPhyConfig::default());
        phy.start_tx_data_frames(&mut ctx, Vec::new(), Vec::new(), SimTime::from_micros(400));
        let f = frame(FrameKind::Data, 2, 0, 5, SimTime::from_micros(400));
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
    }

    #[test]
    fn test_cca_busy_until_last_expiry() {
        let config = SpectrumPhyConfig {
            unlicensed_mode: true,
            cca_threshold_dbm: -62.0,
            ..SpectrumPhyConfig::default()
        };
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, config);

        // 0.3 nW for 10 us, then 0.7 nW for 15 us: -60 dBm in total
        let first = frame(FrameKind::Data, 7, 0, 9, SimTime::from_micros(10));
        phy.start_rx(&mut ctx, psd(3e-10), Arc::new(first));
        assert_eq!(phy.state(), RadioState::Idle);

        let second = frame(FrameKind::Data, 8, 0, 9, SimTime::from_micros(15));
        phy.start_rx(&mut ctx, psd(7e-10), Arc::new(second));
        assert_eq!(phy.state(), RadioState::CcaBusy);
        assert_eq!(ctx.queue.len(), 1);

        phy.maybe_cca_busy(&mut ctx);
        assert_eq!(ctx.queue.len(), 1);
        assert_eq!(ctx.queue.peek_time(), Some(SimTime::from_micros(15)));

        let fired = run(&mut ctx, &mut phy);
        assert_eq!(fired, vec![SimTime::from_micros(15)]);
        assert_eq!(phy.state(), RadioState::Idle);
    }

    #[test]
    fn test_sidelink_dropped_while_transmitting() {
        let mut ctx = SimContext::detached();
        let mut phy = spectrum(DeviceRole::Ue, 2, 0, SpectrumPhyConfig::default());
        phy.start_tx_sl_ctrl_frames(&mut ctx, Vec::new(), SimTime::from_micros(71));
        let f = frame(FrameKind::SlCtrl, 3, 0, 5, SimTime::from_micros(71));
        phy.start_rx(&mut ctx, psd(1e-9), Arc::new(f));
        assert_eq!(phy.stats().sl_half_duplex_drops, 1);
        assert_eq!(phy.state(), RadioState::Tx);
    }
}
