//! Expected Transport Block Registry
//!
//! Holds, per receiver key, the single TB a Spectrum PHY expects to decode
//! in the current reception window.

use super::error_model::ErrorModelOutput;
use super::spectrum_value::SpectrumValue;
use common::types::{Rnti, SfnSf};
use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;
use tracing::debug;

/// Metadata of a cellular TB announced by a DCI
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedTb {
    pub ndi: u8,
    /// TB size in bytes
    pub tb_size: u32,
    pub mcs: u8,
    pub rb_bitmap: Vec<usize>,
    pub harq_process_id: u8,
    pub rv: u8,
    pub is_downlink: bool,
    pub sym_start: u8,
    pub num_sym: u8,
    pub sfn: SfnSf,
}

/// Expected TB plus the results of its evaluation at window end
#[derive(Debug, Clone)]
pub struct TransportBlockInfo {
    pub expected: ExpectedTb,
    pub sinr_avg: f64,
    pub sinr_min: f64,
    pub is_corrupted: bool,
    pub harq_feedback_sent: bool,
    pub output: Option<Arc<ErrorModelOutput>>,
}

impl TransportBlockInfo {
    pub fn new(expected: ExpectedTb) -> Self {
        Self {
            expected,
            sinr_avg: 0.0,
            sinr_min: 0.0,
            is_corrupted: false,
            harq_feedback_sent: false,
            output: None,
        }
    }
}

/// Sidelink TBs are keyed by transmitter and destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlTbKey {
    pub rnti: Rnti,
    pub dst_l2_id: u32,
}

/// Metadata of a sidelink TB announced by an SCI stage 1
#[derive(Debug, Clone, PartialEq)]
pub struct SlExpectedTb {
    pub tb_size: u32,
    pub mcs: u8,
    pub rb_bitmap: Vec<usize>,
    pub sym_start: u8,
    pub num_sym: u8,
    pub sfn: SfnSf,
}

/// Sidelink expected TB plus its evaluation state
#[derive(Debug, Clone)]
pub struct SlTransportBlockInfo {
    pub expected: SlExpectedTb,
    pub sinr_perceived: Option<SpectrumValue>,
    pub sinr_avg: f64,
    pub sinr_min: f64,
    /// Index of the matching signal in the reception window
    pub pkt_index: usize,
    pub is_sci2_corrupted: bool,
    pub is_data_corrupted: bool,
    pub output_sci2: Option<Arc<ErrorModelOutput>>,
    pub output_data: Option<Arc<ErrorModelOutput>>,
}

impl SlTransportBlockInfo {
    pub fn new(expected: SlExpectedTb) -> Self {
        Self {
            expected,
            sinr_perceived: None,
            sinr_avg: 0.0,
            sinr_min: 0.0,
            pkt_index: 0,
            is_sci2_corrupted: false,
            is_data_corrupted: false,
            output_sci2: None,
            output_data: None,
        }
    }
}

/// At most one expected TB per key. Iteration is in key order so decoding
/// consumes random draws deterministically.
#[derive(Debug, Clone)]
pub struct TbRegistry<K: Ord, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for TbRegistry<K, V> {
    fn default() -> Self {
        Self { entries: BTreeMap::new() }
    }
}

impl<K: Ord + Copy + std::fmt::Debug, V> TbRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the expectation for `key`. A previous entry for the same key
    /// is dropped and returned: that TB never arrived.
    pub fn add_expected(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key, value);
        if previous.is_some() {
            debug!("Expected TB for {:?} replaced before it was received", key);
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, K, V> {
        self.entries.iter_mut()
    }
}

/// Average and minimum SINR over a set of RBs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinrStats {
    pub avg: f64,
    pub min: f64,
}

pub fn sinr_stats(sinr: &SpectrumValue, rb_bitmap: &[usize]) -> SinrStats {
    let mut sum = 0.0;
    let mut min = f64::MAX;
    for &rb in rb_bitmap {
        let value = sinr.value_at(rb);
        sum += value;
        if value < min {
            min = value;
        }
    }
    SinrStats {
        avg: sum / rb_bitmap.len() as f64,
        min,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(tb_size: u32) -> ExpectedTb {
        ExpectedTb {
            ndi: 1,
            tb_size,
            mcs: 5,
            rb_bitmap: vec![0, 1],
            harq_process_id: 2,
            rv: 0,
            is_downlink: true,
            sym_start: 1,
            num_sym: 12,
            sfn: SfnSf::default(),
        }
    }

    #[test]
    fn test_latest_expectation_wins() {
        let mut registry: TbRegistry<Rnti, TransportBlockInfo> = TbRegistry::new();
        assert!(registry.add_expected(Rnti(1), TransportBlockInfo::new(expected(10))).is_none());
        let dropped = registry.add_expected(Rnti(1), TransportBlockInfo::new(expected(20)));
        assert_eq!(dropped.map(|tb| tb.expected.tb_size), Some(10));
        registry.add_expected(Rnti(1), TransportBlockInfo::new(expected(30)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&Rnti(1)).map(|tb| tb.expected.tb_size), Some(30));
        assert!(registry.get(&Rnti(2)).is_none());

        registry.clear_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sidelink_keys_are_per_destination() {
        let mut registry: TbRegistry<SlTbKey, u32> = TbRegistry::new();
        registry.add_expected(SlTbKey { rnti: Rnti(1), dst_l2_id: 10 }, 1);
        registry.add_expected(SlTbKey { rnti: Rnti(1), dst_l2_id: 11 }, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_sinr_stats() {
        let sinr = SpectrumValue::from_values(vec![1.0, 4.0, 7.0, 100.0], 1.0);
        let stats = sinr_stats(&sinr, &[0, 1, 2]);
        assert_eq!(stats.avg, 4.0);
        assert_eq!(stats.min, 1.0);
    }
}
