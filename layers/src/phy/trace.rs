//! Reception Traces
//!
//! One record per evaluated TB, collected by a [`TraceSink`] and written out
//! by the binary as JSON lines.

use common::sim::SimTime;
use common::types::{BwpId, CellId, Rnti, SfnSf};
use serde::Serialize;

/// Cellular data reception
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RxPacketTrace {
    pub time_ns: u64,
    pub downlink: bool,
    pub cell_id: u16,
    pub bwp_id: u16,
    pub stream: u8,
    pub rnti: u16,
    pub frame: u32,
    pub subframe: u8,
    pub slot: u16,
    pub sym_start: u8,
    pub num_sym: u8,
    pub tb_size: u32,
    pub mcs: u8,
    pub rv: u8,
    /// Average SINR over the TB RBs, linear
    pub sinr: f64,
    pub sinr_min: f64,
    pub tbler: f64,
    pub corrupt: bool,
    pub rb_assigned_num: usize,
    /// Wideband CQI seen by a UE, zero at the gNB
    pub cqi: u8,
}

impl RxPacketTrace {
    pub fn header(time: SimTime, cell_id: CellId, bwp_id: BwpId, rnti: Rnti, sfn: SfnSf) -> Self {
        Self {
            time_ns: time.as_nanos(),
            downlink: false,
            cell_id: cell_id.0,
            bwp_id: bwp_id.0,
            stream: 0,
            rnti: rnti.value(),
            frame: sfn.frame,
            subframe: sfn.subframe,
            slot: sfn.slot,
            sym_start: 0,
            num_sym: 0,
            tb_size: 0,
            mcs: 0,
            rv: 0,
            sinr: 0.0,
            sinr_min: 0.0,
            tbler: 0.0,
            corrupt: false,
            rb_assigned_num: 0,
            cqi: 0,
        }
    }
}

/// PSCCH reception
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlRxCtrlTrace {
    pub time_ns: u64,
    pub rnti: u16,
    pub frame: u32,
    pub subframe: u8,
    pub slot: u16,
    pub sym_start: u8,
    pub num_sym: u8,
    pub tb_size: u32,
    pub sinr: f64,
    pub sinr_min: f64,
    pub tbler: f64,
    pub corrupt: bool,
    pub bwp_id: u16,
    pub index_start_sub_channel: u8,
    pub length_sub_channel: u8,
    pub sl_resource_reserve_period: u16,
    pub max_num_per_reserve: u8,
    pub dst_l2_id: u32,
    pub rb_start: usize,
    pub rb_end: usize,
    pub rb_assigned_num: usize,
}

/// PSSCH reception
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlRxDataTrace {
    pub time_ns: u64,
    pub rnti: u16,
    pub frame: u32,
    pub subframe: u8,
    pub slot: u16,
    pub sym_start: u8,
    pub num_sym: u8,
    pub tb_size: u32,
    pub mcs: u8,
    pub rv: u8,
    pub ndi: u8,
    pub harq_id: u8,
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
    pub sinr: f64,
    pub sinr_min: f64,
    pub tbler: f64,
    pub corrupt: bool,
    pub tbler_sci2: f64,
    pub sci2_corrupted: bool,
    pub collided: bool,
    pub bwp_id: u16,
    pub rb_assigned_num: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    RxData(RxPacketTrace),
    RxPscch(SlRxCtrlTrace),
    RxPssch(SlRxDataTrace),
}

/// Collector shared by all PHYs of a run
#[derive(Debug, Clone, Default)]
pub struct TraceSink {
    enabled: bool,
    records: Vec<TraceRecord>,
}

impl TraceSink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, record: TraceRecord) {
        if self.enabled {
            self.records.push(record);
        }
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn take(&mut self) -> Vec<TraceRecord> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sink_drops_records() {
        let record = TraceRecord::RxData(RxPacketTrace::header(
            SimTime::from_micros(10),
            CellId(1),
            BwpId(0),
            Rnti(3),
            SfnSf::new(0, 1, 0, 1),
        ));
        let mut sink = TraceSink::new(false);
        sink.push(record.clone());
        assert!(sink.records().is_empty());

        let mut sink = TraceSink::new(true);
        sink.push(record);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_record_is_tagged() {
        let record = TraceRecord::RxData(RxPacketTrace::header(
            SimTime::ZERO,
            CellId(2),
            BwpId(0),
            Rnti(7),
            SfnSf::default(),
        ));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "rx_data");
        assert_eq!(json["rnti"], 7);
        assert_eq!(json["cell_id"], 2);
    }
}
