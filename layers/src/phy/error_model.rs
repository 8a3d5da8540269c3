//! Transport Block Error Model
//!
//! EESM (exponential effective SINR mapping) error model with chase
//! combining and incremental redundancy HARQ variants, plus the AMC helpers
//! (TB size, wideband CQI) built on the same MCS table.

use super::spectrum_value::SpectrumValue;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// MCS table 1 (TS 38.214 Table 5.1.3.1-1): modulation order and target
/// code rate x 1024
const MCS_TABLE: [(u8, u16); 29] = [
    (2, 120), (2, 157), (2, 193), (2, 251), (2, 308), (2, 379), (2, 449), (2, 526),
    (2, 602), (2, 679), (4, 340), (4, 378), (4, 434), (4, 490), (4, 553), (4, 616),
    (4, 658), (6, 438), (6, 466), (6, 517), (6, 567), (6, 616), (6, 666), (6, 719),
    (6, 772), (6, 822), (6, 873), (6, 910), (6, 948),
];

/// EESM beta per MCS
const BETA_TABLE: [f64; 29] = [
    1.60, 1.61, 1.63, 1.65, 1.67, 1.70, 1.73, 1.76, 1.79, 1.82, 3.97, 4.27, 4.71, 5.16,
    5.66, 6.16, 6.50, 9.95, 10.97, 12.92, 14.96, 17.06, 19.33, 21.85, 24.51, 27.14, 29.94,
    32.05, 34.28,
];

/// CQI table 1 spectral efficiencies (TS 38.214 Table 5.2.2.1-2)
const CQI_SPECTRAL_EFFICIENCY: [f64; 16] = [
    0.0, 0.1523, 0.2344, 0.3770, 0.6016, 0.8770, 1.1758, 1.4766, 1.9141, 2.4063, 2.7305,
    3.3223, 3.9023, 4.5234, 5.1152, 5.5547,
];

/// Maximum LDPC code block size (base graph 1)
const MAX_CODE_BLOCK_BITS: u32 = 8448;

/// Data REs per RB assumed by the TB size computation (12 data symbols)
const DATA_RE_PER_RB: u32 = 12 * 12;

/// Highest valid MCS index
pub const MAX_MCS: u8 = 28;

/// Statistics of one decoding attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorModelOutput {
    /// Transport block error rate
    pub tbler: f64,
    /// Effective SINR after HARQ combining (linear)
    pub sinr_eff: f64,
    /// Effective SINR of this attempt alone (linear)
    pub sinr_attempt: f64,
    /// Spectral efficiency the decoder has to achieve
    pub spectral_efficiency: f64,
    /// TB size in bytes
    pub tb_size: u32,
    /// Number of RBs used by the attempt
    pub num_rbs: usize,
}

/// Previous failed attempts of one HARQ process, oldest first
pub type ErrorModelHistory = Vec<Arc<ErrorModelOutput>>;

/// Error model selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorModelType {
    /// EESM with incremental redundancy combining
    EesmIr,
    /// EESM with chase combining
    EesmCc,
}

impl ErrorModelType {
    pub fn create(&self) -> Box<dyn ErrorModel> {
        match self {
            ErrorModelType::EesmIr => Box::new(EesmErrorModel::new(HarqCombining::IncrementalRedundancy)),
            ErrorModelType::EesmCc => Box::new(EesmErrorModel::new(HarqCombining::Chase)),
        }
    }
}

/// Maps SINR to a transport block error rate
pub trait ErrorModel: Debug + Send + Sync {
    /// Decoding statistics of a TB received with `sinr` over `rb_map`
    fn tb_decodification_stats(
        &self,
        sinr: &SpectrumValue,
        rb_map: &[usize],
        tb_size: u32,
        mcs: u8,
        history: &ErrorModelHistory,
    ) -> ErrorModelOutput;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqCombining {
    Chase,
    IncrementalRedundancy,
}

/// EESM error model
#[derive(Debug, Clone)]
pub struct EesmErrorModel {
    combining: HarqCombining,
}

impl EesmErrorModel {
    pub fn new(combining: HarqCombining) -> Self {
        Self { combining }
    }

    /// EESM effective SINR over `rb_map`
    pub fn effective_sinr(sinr: &SpectrumValue, rb_map: &[usize], mcs: u8) -> f64 {
        if rb_map.is_empty() {
            return 0.0;
        }
        let beta = BETA_TABLE[mcs.min(MAX_MCS) as usize];
        let mean = rb_map
            .iter()
            .map(|&rb| (-sinr.value_at(rb) / beta).exp())
            .sum::<f64>()
            / rb_map.len() as f64;
        -beta * mean.ln()
    }

    /// Logistic BLER curve around the SINR a capacity-approaching code needs
    /// for `spectral_efficiency`; longer code blocks give a steeper curve.
    fn bler(sinr_eff: f64, spectral_efficiency: f64, tb_size: u32) -> f64 {
        if sinr_eff <= 0.0 {
            return 1.0;
        }
        // 1.5 dB gap to Shannon capacity
        let threshold_db = 10.0 * (2f64.powf(spectral_efficiency) - 1.0).log10() + 1.5;
        let sinr_db = 10.0 * sinr_eff.log10();
        let code_block_bits = (tb_size * 8).clamp(40, MAX_CODE_BLOCK_BITS) as f64;
        let slope = 1.5 + code_block_bits / 2000.0;
        1.0 / (1.0 + (slope * (sinr_db - threshold_db)).exp())
    }
}

impl ErrorModel for EesmErrorModel {
    fn tb_decodification_stats(
        &self,
        sinr: &SpectrumValue,
        rb_map: &[usize],
        tb_size: u32,
        mcs: u8,
        history: &ErrorModelHistory,
    ) -> ErrorModelOutput {
        let current = Self::effective_sinr(sinr, rb_map, mcs);
        let se = spectral_efficiency(mcs);

        let (sinr_eff, spectral_efficiency) = match self.combining {
            // Same coded bits every attempt: energies add up
            HarqCombining::Chase => (current + history.iter().map(|h| h.sinr_attempt).sum::<f64>(), se),
            // New parity bits every attempt: the effective code rate drops
            HarqCombining::IncrementalRedundancy => {
                let attempts = history.len() as f64 + 1.0;
                let mean = (current + history.iter().map(|h| h.sinr_attempt).sum::<f64>()) / attempts;
                (mean, se / attempts)
            }
        };

        ErrorModelOutput {
            tbler: Self::bler(sinr_eff, spectral_efficiency, tb_size),
            sinr_eff,
            sinr_attempt: current,
            spectral_efficiency,
            tb_size,
            num_rbs: rb_map.len(),
        }
    }
}

/// Corruption draw: corrupted unless the uniform draw exceeds the TBLER
pub fn draw_corruption<R: Rng + ?Sized>(rng: &mut R, tbler: f64) -> bool {
    let draw: f64 = rng.gen();
    draw <= tbler
}

/// Spectral efficiency (bits/RE) of an MCS
pub fn spectral_efficiency(mcs: u8) -> f64 {
    let (qm, rate) = MCS_TABLE[mcs.min(MAX_MCS) as usize];
    qm as f64 * rate as f64 / 1024.0
}

/// Transport block size in bytes for `mcs` over `num_rbs` RBs
pub fn tb_size_bytes(mcs: u8, num_rbs: usize) -> u32 {
    let bits = (num_rbs as u32 * DATA_RE_PER_RB) as f64 * spectral_efficiency(mcs);
    // 24-bit TB CRC
    let payload_bits = (bits as u32).saturating_sub(24);
    payload_bits / 8
}

/// Wideband CQI from per-RB SINR (Shannon with a BER-target gap)
pub fn wideband_cqi(sinr: &SpectrumValue) -> u8 {
    const BER: f64 = 0.00005;
    let gap = -(5.0 * BER).ln() / 1.5;
    let mean = sinr.mean();
    let se = (1.0 + mean / gap).log2();
    CQI_SPECTRAL_EFFICIENCY
        .iter()
        .rposition(|&cqi_se| cqi_se <= se)
        .unwrap_or(0) as u8
}
