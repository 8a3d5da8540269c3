//! HARQ Soft-Combining Store
//!
//! Keeps, per RNTI and HARQ process, the error model outputs of previous
//! failed attempts so the next attempt can be combined with them.

use super::error_model::{ErrorModelHistory, ErrorModelOutput};
use common::types::Rnti;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

type ProcessHistories = HashMap<Rnti, HashMap<u8, ErrorModelHistory>>;

/// Per-direction HARQ histories owned by one Spectrum PHY
#[derive(Debug, Default)]
pub struct HarqPhy {
    dl: ProcessHistories,
    ul: ProcessHistories,
    sl_data: ProcessHistories,
    /// Sidelink (rnti, process) pairs whose TB was already decoded
    sl_prev_decoded: HashSet<(Rnti, u8)>,
}

fn history(map: &ProcessHistories, rnti: Rnti, process: u8) -> ErrorModelHistory {
    map.get(&rnti)
        .and_then(|procs| procs.get(&process))
        .cloned()
        .unwrap_or_default()
}

fn reset(map: &mut ProcessHistories, rnti: Rnti, process: u8) {
    map.entry(rnti).or_default().entry(process).or_default().clear();
}

fn update(map: &mut ProcessHistories, rnti: Rnti, process: u8, output: Arc<ErrorModelOutput>) {
    map.entry(rnti).or_default().entry(process).or_default().push(output);
}

impl HarqPhy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dl_history(&self, rnti: Rnti, process: u8) -> ErrorModelHistory {
        history(&self.dl, rnti, process)
    }

    pub fn ul_history(&self, rnti: Rnti, process: u8) -> ErrorModelHistory {
        history(&self.ul, rnti, process)
    }

    pub fn sl_data_history(&self, rnti: Rnti, process: u8) -> ErrorModelHistory {
        history(&self.sl_data, rnti, process)
    }

    pub fn reset_dl(&mut self, rnti: Rnti, process: u8) {
        trace!("HARQ DL reset rnti={} process={}", rnti, process);
        reset(&mut self.dl, rnti, process);
    }

    pub fn reset_ul(&mut self, rnti: Rnti, process: u8) {
        trace!("HARQ UL reset rnti={} process={}", rnti, process);
        reset(&mut self.ul, rnti, process);
    }

    pub fn reset_sl_data(&mut self, rnti: Rnti, process: u8) {
        reset(&mut self.sl_data, rnti, process);
    }

    pub fn update_dl(&mut self, rnti: Rnti, process: u8, output: Arc<ErrorModelOutput>) {
        update(&mut self.dl, rnti, process, output);
    }

    pub fn update_ul(&mut self, rnti: Rnti, process: u8, output: Arc<ErrorModelOutput>) {
        update(&mut self.ul, rnti, process, output);
    }

    pub fn update_sl_data(&mut self, rnti: Rnti, process: u8, output: Arc<ErrorModelOutput>) {
        update(&mut self.sl_data, rnti, process, output);
    }

    pub fn indicate_prev_decoded(&mut self, rnti: Rnti, process: u8) {
        self.sl_prev_decoded.insert((rnti, process));
    }

    pub fn is_prev_decoded(&self, rnti: Rnti, process: u8) -> bool {
        self.sl_prev_decoded.contains(&(rnti, process))
    }

    pub fn remove_prev_decoded(&mut self, rnti: Rnti, process: u8) {
        self.sl_prev_decoded.remove(&(rnti, process));
    }
}
