//! Power Spectral Density Values
//!
//! A PSD sampled once per resource block, in W/Hz.

use common::utils::{db_to_linear, dbm_to_watts, SUBCARRIERS_PER_RB};
use serde::Serialize;
use std::ops::{AddAssign, SubAssign};

/// Boltzmann constant times the 290 K reference temperature, in W/Hz
const KT_W_PER_HZ: f64 = 1.380_649e-23 * 290.0;

/// Per-RB power spectral density
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumValue {
    values: Vec<f64>,
    rb_width_hz: f64,
}

impl SpectrumValue {
    /// All-zero PSD over `num_rbs` resource blocks
    pub fn zeros(num_rbs: usize, rb_width_hz: f64) -> Self {
        Self {
            values: vec![0.0; num_rbs],
            rb_width_hz,
        }
    }

    pub fn from_values(values: Vec<f64>, rb_width_hz: f64) -> Self {
        Self { values, rb_width_hz }
    }

    /// RB width for a subcarrier spacing in Hz
    pub fn rb_width_for_scs(scs_hz: u32) -> f64 {
        (scs_hz * SUBCARRIERS_PER_RB) as f64
    }

    /// Transmit PSD with `tx_power_dbm` spread uniformly over `active_rbs`
    pub fn tx_psd(tx_power_dbm: f64, active_rbs: &[usize], num_rbs: usize, rb_width_hz: f64) -> Self {
        let mut psd = Self::zeros(num_rbs, rb_width_hz);
        if active_rbs.is_empty() {
            return psd;
        }
        let density = dbm_to_watts(tx_power_dbm) / (active_rbs.len() as f64 * rb_width_hz);
        for &rb in active_rbs {
            psd.values[rb] = density;
        }
        psd
    }

    /// Thermal noise PSD for a receiver noise figure
    pub fn noise_psd(noise_figure_db: f64, num_rbs: usize, rb_width_hz: f64) -> Self {
        let density = KT_W_PER_HZ * db_to_linear(noise_figure_db);
        Self {
            values: vec![density; num_rbs],
            rb_width_hz,
        }
    }

    pub fn num_rbs(&self) -> usize {
        self.values.len()
    }

    pub fn rb_width_hz(&self) -> f64 {
        self.rb_width_hz
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value_at(&self, rb: usize) -> f64 {
        self.values[rb]
    }

    pub fn set(&mut self, rb: usize, value: f64) {
        self.values[rb] = value;
    }

    /// Total power in Watts
    pub fn integral(&self) -> f64 {
        self.values.iter().sum::<f64>() * self.rb_width_hz
    }

    /// Plain sum of the per-RB values
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Mean of the per-RB values
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum() / self.values.len() as f64
        }
    }

    /// Copy scaled by a linear factor
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            values: self.values.iter().map(|v| v * factor).collect(),
            rb_width_hz: self.rb_width_hz,
        }
    }

    /// Indices of the RBs carrying non-zero power
    pub fn active_rbs(&self) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// True if both PSDs carry power on at least one common RB
    pub fn overlaps(&self, other: &SpectrumValue) -> bool {
        self.values
            .iter()
            .zip(other.values.iter())
            .any(|(a, b)| a * b != 0.0)
    }

    /// Element-wise `self / (other)`, used for SINR/SNR computation
    pub fn ratio(&self, denominator: &SpectrumValue) -> Self {
        self.check_model(denominator);
        Self {
            values: self
                .values
                .iter()
                .zip(denominator.values.iter())
                .map(|(n, d)| n / d)
                .collect(),
            rb_width_hz: self.rb_width_hz,
        }
    }

    /// Element-wise product
    pub fn product(&self, other: &SpectrumValue) -> Self {
        self.check_model(other);
        Self {
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| a * b)
                .collect(),
            rb_width_hz: self.rb_width_hz,
        }
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_model(&self, other: &SpectrumValue) {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "spectrum values defined over different RB sets"
        );
    }
}

impl AddAssign<&SpectrumValue> for SpectrumValue {
    fn add_assign(&mut self, rhs: &SpectrumValue) {
        self.check_model(rhs);
        for (a, b) in self.values.iter_mut().zip(rhs.values.iter()) {
            *a += b;
        }
    }
}

impl SubAssign<&SpectrumValue> for SpectrumValue {
    fn sub_assign(&mut self, rhs: &SpectrumValue) {
        self.check_model(rhs);
        for (a, b) in self.values.iter_mut().zip(rhs.values.iter()) {
            *a -= b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_psd_spreads_power() {
        let rb_width = SpectrumValue::rb_width_for_scs(15_000);
        assert_eq!(rb_width, 180_000.0);

        let psd = SpectrumValue::tx_psd(30.0, &[1, 2], 4, rb_width);
        assert_eq!(psd.value_at(0), 0.0);
        assert_eq!(psd.active_rbs(), vec![1, 2]);
        assert!((psd.integral() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_noise_psd() {
        let noise = SpectrumValue::noise_psd(0.0, 3, 180_000.0);
        assert!((noise.value_at(2) - 4.003_882_1e-21).abs() < 1e-27);
    }

    #[test]
    fn test_overlap_and_arithmetic() {
        let a = SpectrumValue::from_values(vec![1.0, 0.0, 2.0], 1.0);
        let b = SpectrumValue::from_values(vec![0.0, 3.0, 0.0], 1.0);
        assert!(!a.overlaps(&b));

        let mut c = a.clone();
        c += &b;
        assert_eq!(c.values(), &[1.0, 3.0, 2.0]);
        assert!(c.overlaps(&b));
        c -= &a;
        assert_eq!(c, b);
        assert_eq!(a.scaled(0.5).values(), &[0.5, 0.0, 1.0]);
    }
}
