//! Sidelink reception
//!
//! PSCCH and PSSCH signals of one window are collected together and
//! evaluated when the window closes. Control is decoded greedily in
//! descending SINR order; data is decoded in two stages (SCI 2, then the TB).

use super::{PhyIndication, RadioState, SlRxSignal, SpectrumPhy, SpectrumTimer};
use crate::phy::error_model::{draw_corruption, tb_size_bytes, ErrorModelHistory};
use crate::phy::frame::{FrameKind, Packet, PacketBurst, SciF2aHeader, SignalFrame};
use crate::phy::spectrum_value::SpectrumValue;
use crate::phy::tb_registry::{sinr_stats, SlTbKey};
use crate::phy::trace::{SlRxCtrlTrace, SlRxDataTrace, TraceRecord};
use crate::phy::SimContext;
use common::sim::SimTime;
use common::types::Rnti;
use common::utils::{linear_to_db, watts_to_dbm, SUBCARRIERS_PER_RB};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SCI stage 1 and stage 2 are sent with QPSK
const SCI_MCS: u8 = 0;

/// DMRS resource elements per RB used for the RSRP measurement
const DMRS_RE_PER_RB: f64 = 3.0;

/// Correctly decoded PSSCH burst with its reception measurements
#[derive(Debug, Clone)]
pub struct PsschRxInfo {
    pub burst: PacketBurst,
    /// Average SINR over the TB RBs, dB
    pub sinr_db: f64,
    /// Average RSRP of the PSCCHs decoded since the previous PSSCH
    pub rsrp_dbm: Option<f64>,
    pub time: SimTime,
}

/// Sidelink RSRP of a received PSD, measured on the DMRS resource elements
/// of the occupied RBs. Negative infinity for an empty PSD.
pub fn sidelink_rsrp_dbm(psd: &SpectrumValue) -> f64 {
    let re_per_rb = SUBCARRIERS_PER_RB as f64;
    let mut total = 0.0;
    let mut num_rbs = 0usize;
    for &value in psd.values().iter().filter(|v| **v != 0.0) {
        let power_rb = value * psd.rb_width_hz();
        let power_re = power_rb / re_per_rb;
        total += power_re * DMRS_RE_PER_RB;
        num_rbs += 1;
    }
    if num_rbs == 0 {
        return f64::NEG_INFINITY;
    }
    watts_to_dbm(total / (num_rbs as f64 * DMRS_RE_PER_RB))
}

/// Transmitting RNTI of a PSSCH burst
fn pssch_tx_rnti(burst: &[Packet]) -> Option<Rnti> {
    burst
        .iter()
        .find_map(|p| p.bearer.map(|b| b.rnti))
        .or_else(|| burst.iter().find_map(|p| p.sl_tag.map(|t| t.rnti)))
}

/// SCI stage 2 of a PSSCH burst: the one packet without a bearer tag
fn sci2_of(burst: &[Packet]) -> SciF2aHeader {
    let Some(sci2) = burst
        .iter()
        .filter(|p| p.bearer.is_none())
        .find_map(|p| p.sci_f2a().copied())
    else {
        panic!("Did not find SCI stage 2 in PSSCH packet burst");
    };
    sci2
}

impl SpectrumPhy {
    pub(super) fn start_rx_sl_frame(
        &mut self,
        ctx: &mut crate::phy::SimContext,
        psd: SpectrumValue,
        frame: Arc<SignalFrame>,
    ) {
        let now = ctx.now();
        match self.state {
            RadioState::Tx => panic!("Cannot RX NR Sidelink frame while TX."),
            RadioState::RxUlCtrl | RadioState::RxUlSrs => {
                panic!("Cannot RX NR Sidelink frame while receiving UL CTRL.")
            }
            RadioState::RxDlCtrl => panic!("Cannot RX NR Sidelink frame while receiving DL CTRL."),
            RadioState::CcaBusy | RadioState::RxData | RadioState::Idle => {
                if self.state == RadioState::CcaBusy {
                    warn!("Start receiving NR Sidelink frame while channel in CCA_BUSY state.");
                }
                debug!("{} SL signal from {}", self.addr, frame.source);

                if self.sl_rx_signals.is_empty() {
                    assert!(
                        self.state != RadioState::RxData,
                        "Sidelink frame arrived during a cellular data reception"
                    );
                    self.first_rx_start = now;
                    self.first_rx_duration = frame.duration;
                    self.schedule_timer(ctx, frame.duration, SpectrumTimer::EndRxSlFrame);
                } else {
                    assert!(
                        self.first_rx_start == now && self.first_rx_duration == frame.duration,
                        "Concurrent sidelink receptions must share start time and duration: \
                         first started at {} for {}, this one at {} for {}",
                        self.first_rx_start,
                        self.first_rx_duration,
                        now,
                        frame.duration
                    );
                }

                self.change_state(RadioState::RxData);
                self.sl_interference.start_rx(now, &psd);
                let rb_bitmap = psd.active_rbs();
                self.sl_rx_signals.push(SlRxSignal { frame, rb_bitmap, psd });
            }
        }
    }

    pub(super) fn end_rx_sl_frame(&mut self, ctx: &mut SimContext) {
        let sinrs = self.sl_interference.end_rx(ctx.now());

        let (pscch, pssch): (Vec<usize>, Vec<usize>) = (0..self.sl_rx_signals.len())
            .filter(|&i| self.sl_rx_signals[i].frame.kind.is_sidelink())
            .partition(|&i| self.sl_rx_signals[i].frame.kind == FrameKind::SlCtrl);

        if !pscch.is_empty() {
            self.rx_sl_pscch(ctx, &pscch, &sinrs);
        }
        if !pssch.is_empty() {
            self.rx_sl_pssch(ctx, &pssch, &sinrs);
        }

        self.sl_rx_signals.clear();
        self.return_to_idle(ctx);
    }

    fn rx_sl_pscch(&mut self, ctx: &mut SimContext, indexes: &[usize], sinrs: &[SpectrumValue]) {
        debug!("{} evaluating {} PSCCH", self.addr, indexes.len());

        // Highest SINR first; the sort is stable so ties keep arrival order
        let mut sorted: Vec<(usize, f64, f64)> = indexes
            .iter()
            .map(|&i| {
                let signal = &self.sl_rx_signals[i];
                let burst_len = signal.frame.packets.as_ref().map_or(0, Vec::len);
                assert_eq!(burst_len, 1, "Received PSCCH burst with more than one packet");
                let stats = sinr_stats(&sinrs[i], &signal.rb_bitmap);
                (i, stats.avg, stats.min)
            })
            .collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut collided: HashSet<usize> = HashSet::new();
        if self.config.drop_tb_on_rb_collision {
            let mut seen: HashSet<usize> = HashSet::new();
            for &(i, _, _) in &sorted {
                for &rb in &self.sl_rx_signals[i].rb_bitmap {
                    if !seen.insert(rb) {
                        collided.insert(rb);
                        break;
                    }
                }
            }
        }

        let mut decoded_rbs: HashSet<usize> = HashSet::new();
        let now = ctx.now();

        for (i, sinr_avg, sinr_min) in sorted {
            let rb_bitmap = self.sl_rx_signals[i].rb_bitmap.clone();
            let tb_size = tb_size_bytes(SCI_MCS, rb_bitmap.len());
            let mut corrupt = false;
            let mut tbler = 0.0;

            if self.config.sl_ctrl_error_model_enabled {
                for rb in &rb_bitmap {
                    if collided.contains(rb) {
                        debug!("{} RB {} has collided", self.addr, rb);
                        corrupt = true;
                        break;
                    }
                    if decoded_rbs.contains(rb) {
                        debug!("{} RB {} already decoded for another SCI 1", self.addr, rb);
                        corrupt = true;
                        break;
                    }
                }
                let output = self.sl_error_model.tb_decodification_stats(
                    &sinrs[i],
                    &rb_bitmap,
                    tb_size,
                    SCI_MCS,
                    &ErrorModelHistory::new(),
                );
                tbler = output.tbler;
                let corrupt_decode = draw_corruption(&mut self.rng, output.tbler);
                corrupt |= corrupt_decode;
                debug!(
                    "{} PSCCH decoding {}, error rate {}",
                    self.addr,
                    if corrupt { "failed" } else { "successful" },
                    output.tbler
                );
            } else if self.config.drop_tb_on_rb_collision {
                corrupt = rb_bitmap.iter().any(|rb| collided.contains(rb));
            }

            let signal = &self.sl_rx_signals[i];
            let Some(packet) = signal.frame.packets.as_ref().and_then(|b| b.first()).cloned() else {
                continue;
            };
            let Some(tag) = packet.sl_tag else {
                panic!("Did not find sidelink MAC PDU tag on PSCCH packet");
            };
            let Some(sci) = packet.sci_f1a().copied() else {
                panic!("PSCCH packet without SCI stage 1");
            };

            if !corrupt {
                decoded_rbs.extend(rb_bitmap.iter().copied());
                self.sl_rsrp_samples.push(sidelink_rsrp_dbm(&signal.psd));
                self.indications.push(PhyIndication::PscchReceived {
                    packet,
                    psd: signal.psd.clone(),
                });
            }

            ctx.traces.push(TraceRecord::RxPscch(SlRxCtrlTrace {
                time_ns: now.as_nanos(),
                rnti: tag.rnti.value(),
                frame: tag.sfn.frame,
                subframe: tag.sfn.subframe,
                slot: tag.sfn.slot,
                sym_start: tag.sym_start,
                num_sym: tag.num_sym,
                tb_size,
                sinr: sinr_avg,
                sinr_min,
                tbler,
                corrupt,
                bwp_id: self.bwp_id.0,
                index_start_sub_channel: sci.index_start_sub_channel,
                length_sub_channel: sci.length_sub_channel,
                sl_resource_reserve_period: sci.sl_resource_reserve_period,
                max_num_per_reserve: sci.sl_max_num_per_reserve,
                dst_l2_id: tag.dst_l2_id,
                rb_start: rb_bitmap.first().copied().unwrap_or(0),
                rb_end: rb_bitmap.last().copied().unwrap_or(0),
                rb_assigned_num: rb_bitmap.len(),
            }));
        }
    }

    fn take_average_rsrp(&mut self) -> Option<f64> {
        if self.sl_rsrp_samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.sl_rsrp_samples);
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    fn rx_sl_pssch(&mut self, ctx: &mut SimContext, indexes: &[usize], sinrs: &[SpectrumValue]) {
        assert_eq!(self.state, RadioState::RxData, "PSSCH evaluated outside a data reception");
        debug!(
            "{} evaluating {} PSSCH, {} expected",
            self.addr,
            indexes.len(),
            self.sl_transport_blocks.len()
        );

        let rsrp_dbm = self.take_average_rsrp();

        for &i in indexes {
            let burst = self.sl_rx_signals[i].frame.packets.as_deref().unwrap_or(&[]);
            let Some(first) = burst.first() else {
                continue;
            };
            if first.bearer.is_none() && first.sci_f2a().is_none() {
                panic!(
                    "Invalid PSSCH packet type! I didn't find any radio bearer tag neither any SCI stage 2 header"
                );
            }
            let sci2 = sci2_of(burst);
            let Some(rnti) = pssch_tx_rnti(burst) else {
                continue;
            };
            let key = SlTbKey {
                rnti,
                dst_l2_id: sci2.dst_id,
            };
            // Only TBs announced by a decoded SCI 1 are of interest
            let Some(tb) = self.sl_transport_blocks.get_mut(&key) else {
                continue;
            };
            let stats = sinr_stats(&sinrs[i], &tb.expected.rb_bitmap);
            tb.sinr_perceived = Some(sinrs[i].clone());
            tb.pkt_index = i;
            tb.sinr_avg = stats.avg;
            tb.sinr_min = stats.min;
            info!(
                "{} PSSCH from {}: sinr avg {:.3} min {:.3} ({:.2} dB)",
                self.addr,
                rnti,
                stats.avg,
                stats.min,
                linear_to_db(stats.avg)
            );
        }

        let mut collided: HashSet<usize> = HashSet::new();
        if self.config.drop_tb_on_rb_collision {
            let mut seen: HashSet<usize> = HashSet::new();
            for (_, tb) in self.sl_transport_blocks.iter() {
                for &rb in &tb.expected.rb_bitmap {
                    if !seen.insert(rb) {
                        collided.insert(rb);
                    }
                }
            }
        }

        let now = ctx.now();
        let data_em = self.config.sl_data_error_model_enabled;
        let drop_on_collision = self.config.drop_tb_on_rb_collision;

        for (key, tb) in self.sl_transport_blocks.iter_mut() {
            let Some(sinr) = tb.sinr_perceived.clone() else {
                debug!("{} no PSSCH received for the TB of {}", self.addr, key.rnti);
                continue;
            };
            let signal = &self.sl_rx_signals[tb.pkt_index];
            let burst = signal.frame.packets.as_deref().unwrap_or(&[]);
            let sci2 = sci2_of(burst);
            let rnti = key.rnti;

            if sci2.ndi != 0 {
                self.harq.remove_prev_decoded(rnti, sci2.harq_id);
            }
            // Blind retransmissions of a TB already decoded are not delivered twice
            if self.harq.is_prev_decoded(rnti, sci2.harq_id) {
                debug!("{} TB of {} harq {} already decoded", self.addr, rnti, sci2.harq_id);
                continue;
            }

            let rb_collided = drop_on_collision && tb.expected.rb_bitmap.iter().any(|rb| collided.contains(rb));
            if rb_collided {
                debug!("{} PSSCH of {} collided, labeled as corrupted", self.addr, rnti);
                tb.is_sci2_corrupted = true;
                tb.is_data_corrupted = true;
            }

            if data_em {
                let sci2_output = self.sl_error_model.tb_decodification_stats(
                    &sinr,
                    &tb.expected.rb_bitmap,
                    SciF2aHeader::SERIALIZED_SIZE,
                    SCI_MCS,
                    &ErrorModelHistory::new(),
                );
                // A new TB starts a fresh history
                if sci2.ndi != 0 && !self.harq.sl_data_history(rnti, sci2.harq_id).is_empty() {
                    self.harq.reset_sl_data(rnti, sci2.harq_id);
                }
                let history = self.harq.sl_data_history(rnti, sci2.harq_id);
                let data_output = Arc::new(self.sl_error_model.tb_decodification_stats(
                    &sinr,
                    &tb.expected.rb_bitmap,
                    tb.expected.tb_size,
                    tb.expected.mcs,
                    &history,
                ));

                if !rb_collided {
                    tb.is_sci2_corrupted = draw_corruption(&mut self.rng, sci2_output.tbler);
                    tb.is_data_corrupted = draw_corruption(&mut self.rng, data_output.tbler);
                    if tb.is_sci2_corrupted || tb.is_data_corrupted {
                        tb.is_data_corrupted = true;
                        info!(
                            "{} PSSCH of {} harq {} size {} mcs {} rv {} history {} tbler {:.4} corrupted",
                            self.addr,
                            rnti,
                            sci2.harq_id,
                            tb.expected.tb_size,
                            tb.expected.mcs,
                            sci2.rv,
                            history.len(),
                            data_output.tbler
                        );
                        self.harq.update_sl_data(rnti, sci2.harq_id, Arc::clone(&data_output));
                    } else {
                        self.harq.indicate_prev_decoded(rnti, sci2.harq_id);
                        self.harq.reset_sl_data(rnti, sci2.harq_id);
                    }
                }
                tb.output_sci2 = Some(Arc::new(sci2_output));
                tb.output_data = Some(data_output);
            }

            self.stats.sl_tbs_received += 1;
            if tb.is_data_corrupted {
                self.stats.sl_tbs_corrupted += 1;
            }

            ctx.traces.push(TraceRecord::RxPssch(SlRxDataTrace {
                time_ns: now.as_nanos(),
                rnti: rnti.value(),
                frame: tb.expected.sfn.frame,
                subframe: tb.expected.sfn.subframe,
                slot: tb.expected.sfn.slot,
                sym_start: tb.expected.sym_start,
                num_sym: tb.expected.num_sym,
                tb_size: tb.expected.tb_size,
                mcs: tb.expected.mcs,
                rv: sci2.rv,
                ndi: sci2.ndi,
                harq_id: sci2.harq_id,
                src_l2_id: sci2.src_id,
                dst_l2_id: sci2.dst_id,
                sinr: tb.sinr_avg,
                sinr_min: tb.sinr_min,
                tbler: tb.output_data.as_ref().map_or(0.0, |o| o.tbler),
                corrupt: tb.is_data_corrupted,
                tbler_sci2: tb.output_sci2.as_ref().map_or(0.0, |o| o.tbler),
                sci2_corrupted: tb.is_sci2_corrupted,
                collided: rb_collided,
                bwp_id: self.bwp_id.0,
                rb_assigned_num: tb.expected.rb_bitmap.len(),
            }));

            if !tb.is_data_corrupted {
                debug!("{} dispatching PSSCH TB of {}", self.addr, rnti);
                self.indications.push(PhyIndication::PsschReceived(PsschRxInfo {
                    burst: burst.to_vec(),
                    sinr_db: linear_to_db(tb.sinr_avg),
                    rsrp_dbm,
                    time: now,
                }));
            }
        }

        self.sl_transport_blocks.clear_all();
    }
}
