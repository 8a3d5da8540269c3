//! PHY Configuration
//!
//! Plain configuration structures for the spectrum PHY and the gNB/UE PHY,
//! deserializable from TOML with defaults for every field.

use super::error_model::ErrorModelType;
use super::frame_structure::parse_pattern;
use crate::LayerError;
use common::sim::SimTime;
use common::types::SubcarrierSpacing;
use common::utils::{dbm_to_watts, time};
use serde::{Deserialize, Serialize};

/// Highest number of streams the beam configuration supports
pub const MAX_STREAMS: u8 = 2;

/// Spectrum PHY configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpectrumPhyConfig {
    /// When disabled every expected TB is received correctly
    #[serde(default = "default_true")]
    pub data_error_model_enabled: bool,
    #[serde(default = "default_error_model")]
    pub error_model_type: ErrorModelType,
    /// Listen-before-talk operation with energy-detection CCA
    #[serde(default)]
    pub unlicensed_mode: bool,
    /// CCA mode 1 energy threshold in dBm
    #[serde(default = "default_cca_threshold_dbm")]
    pub cca_threshold_dbm: f64,
    /// Scaling applied to same-cell signals of another stream (0..1)
    #[serde(default)]
    pub inter_stream_interference_ratio: f64,
    #[serde(default = "default_error_model")]
    pub sl_error_model_type: ErrorModelType,
    #[serde(default = "default_true")]
    pub sl_ctrl_error_model_enabled: bool,
    #[serde(default = "default_true")]
    pub sl_data_error_model_enabled: bool,
    /// Treat sidelink TBs sharing an RB with another TB as lost
    #[serde(default)]
    pub drop_tb_on_rb_collision: bool,
}

fn default_true() -> bool {
    true
}

fn default_error_model() -> ErrorModelType {
    ErrorModelType::EesmIr
}

fn default_cca_threshold_dbm() -> f64 {
    -62.0
}

impl Default for SpectrumPhyConfig {
    fn default() -> Self {
        Self {
            data_error_model_enabled: true,
            error_model_type: default_error_model(),
            unlicensed_mode: false,
            cca_threshold_dbm: default_cca_threshold_dbm(),
            inter_stream_interference_ratio: 0.0,
            sl_error_model_type: default_error_model(),
            sl_ctrl_error_model_enabled: true,
            sl_data_error_model_enabled: true,
            drop_tb_on_rb_collision: false,
        }
    }
}

impl SpectrumPhyConfig {
    pub fn cca_threshold_w(&self) -> f64 {
        dbm_to_watts(self.cca_threshold_dbm)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if !(0.0..=1.0).contains(&self.inter_stream_interference_ratio) {
            return Err(LayerError::InvalidConfiguration(format!(
                "inter_stream_interference_ratio {} outside [0, 1]",
                self.inter_stream_interference_ratio
            )));
        }
        if !self.cca_threshold_dbm.is_finite() {
            return Err(LayerError::InvalidConfiguration(
                "cca_threshold_dbm must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// gNB / UE PHY configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PhyConfig {
    #[serde(default = "default_numerology")]
    pub numerology: u8,
    #[serde(default = "default_symbols_per_slot")]
    pub symbols_per_slot: u8,
    /// Bandwidth in resource blocks
    #[serde(default = "default_num_rbs")]
    pub num_rbs: usize,
    #[serde(default = "default_num_rb_per_rbg")]
    pub num_rb_per_rbg: usize,
    /// TDD pattern, e.g. "DL|S|UL|UL|"
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// DL grant to DL data, in slots
    #[serde(default)]
    pub n0: u32,
    /// DL data to HARQ feedback, in slots
    #[serde(default = "default_n1")]
    pub n1: u32,
    /// UL grant to UL data, in slots
    #[serde(default = "default_n2")]
    pub n2: u32,
    /// Slots between MAC scheduling and transmission
    #[serde(default = "default_l1l2_latency")]
    pub l1l2_ctrl_latency: u32,
    #[serde(default = "default_ctrl_symbols")]
    pub dl_ctrl_symbols: u8,
    #[serde(default = "default_ctrl_symbols")]
    pub ul_ctrl_symbols: u8,
    #[serde(default = "default_tx_power_dbm")]
    pub tx_power_dbm: f64,
    #[serde(default = "default_noise_figure_db")]
    pub noise_figure_db: f64,
    /// Delay between the end of a reception and the MAC delivery
    #[serde(default = "default_tb_decode_latency_us")]
    pub tb_decode_latency_us: u64,
    #[serde(default = "default_num_streams")]
    pub num_streams: u8,
    /// Primary carrier transmits MIB and SIB1
    #[serde(default = "default_true")]
    pub is_primary: bool,
    /// Guard before UL control within which a UE needs a fresh LBT
    #[serde(default = "default_lbt_threshold_us")]
    pub lbt_threshold_for_ctrl_us: u64,
    /// Grant duration of the channel access manager
    #[serde(default = "default_grant_duration_ms")]
    pub cam_grant_duration_ms: u64,
    /// Sidelink subchannel size in RBs
    #[serde(default = "default_sl_sub_channel_size")]
    pub sl_sub_channel_size: u16,
    #[serde(default)]
    pub spectrum: SpectrumPhyConfig,
}

fn default_numerology() -> u8 {
    1
}

fn default_symbols_per_slot() -> u8 {
    14
}

fn default_num_rbs() -> usize {
    52
}

fn default_num_rb_per_rbg() -> usize {
    1
}

fn default_pattern() -> String {
    "F|F|F|F|F|F|F|F|F|F|".to_string()
}

fn default_n1() -> u32 {
    2
}

fn default_n2() -> u32 {
    2
}

fn default_l1l2_latency() -> u32 {
    2
}

fn default_ctrl_symbols() -> u8 {
    1
}

fn default_tx_power_dbm() -> f64 {
    30.0
}

fn default_noise_figure_db() -> f64 {
    5.0
}

fn default_tb_decode_latency_us() -> u64 {
    100
}

fn default_num_streams() -> u8 {
    1
}

fn default_lbt_threshold_us() -> u64 {
    25
}

fn default_grant_duration_ms() -> u64 {
    1000
}

fn default_sl_sub_channel_size() -> u16 {
    10
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            numerology: default_numerology(),
            symbols_per_slot: default_symbols_per_slot(),
            num_rbs: default_num_rbs(),
            num_rb_per_rbg: default_num_rb_per_rbg(),
            pattern: default_pattern(),
            n0: 0,
            n1: default_n1(),
            n2: default_n2(),
            l1l2_ctrl_latency: default_l1l2_latency(),
            dl_ctrl_symbols: default_ctrl_symbols(),
            ul_ctrl_symbols: default_ctrl_symbols(),
            tx_power_dbm: default_tx_power_dbm(),
            noise_figure_db: default_noise_figure_db(),
            tb_decode_latency_us: default_tb_decode_latency_us(),
            num_streams: default_num_streams(),
            is_primary: true,
            lbt_threshold_for_ctrl_us: default_lbt_threshold_us(),
            cam_grant_duration_ms: default_grant_duration_ms(),
            sl_sub_channel_size: default_sl_sub_channel_size(),
            spectrum: SpectrumPhyConfig::default(),
        }
    }
}

impl PhyConfig {
    pub fn subcarrier_spacing(&self) -> Result<SubcarrierSpacing, LayerError> {
        SubcarrierSpacing::from_numerology(self.numerology).ok_or_else(|| {
            LayerError::InvalidConfiguration(format!("numerology {} not supported", self.numerology))
        })
    }

    pub fn slot_period(&self) -> SimTime {
        time::slot_period(self.numerology)
    }

    pub fn symbol_period(&self) -> SimTime {
        time::symbol_period(self.numerology, self.symbols_per_slot)
    }

    pub fn tb_decode_latency(&self) -> SimTime {
        SimTime::from_micros(self.tb_decode_latency_us)
    }

    pub fn lbt_threshold_for_ctrl(&self) -> SimTime {
        SimTime::from_micros(self.lbt_threshold_for_ctrl_us)
    }

    pub fn cam_grant_duration(&self) -> SimTime {
        SimTime::from_millis(self.cam_grant_duration_ms)
    }

    /// Number of RBGs in the bandwidth
    pub fn num_rbg(&self) -> usize {
        self.num_rbs.div_ceil(self.num_rb_per_rbg.max(1))
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        self.subcarrier_spacing()?;
        if self.num_rbs == 0 {
            return Err(LayerError::InvalidConfiguration("num_rbs must be positive".to_string()));
        }
        if self.num_rb_per_rbg == 0 || self.num_rb_per_rbg > self.num_rbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "num_rb_per_rbg {} must be in 1..={}",
                self.num_rb_per_rbg, self.num_rbs
            )));
        }
        if self.num_streams == 0 || self.num_streams > MAX_STREAMS {
            return Err(LayerError::InvalidConfiguration(format!(
                "num_streams {} not supported, at most {} streams",
                self.num_streams, MAX_STREAMS
            )));
        }
        let ctrl = self.dl_ctrl_symbols as u32 + self.ul_ctrl_symbols as u32;
        if self.symbols_per_slot == 0 || ctrl >= self.symbols_per_slot as u32 {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} control symbols leave no data symbol in a {}-symbol slot",
                ctrl, self.symbols_per_slot
            )));
        }
        if self.sl_sub_channel_size == 0 {
            return Err(LayerError::InvalidConfiguration(
                "sl_sub_channel_size must be positive".to_string(),
            ));
        }
        if self.cam_grant_duration_ms == 0 {
            return Err(LayerError::InvalidConfiguration(
                "cam_grant_duration_ms must be positive".to_string(),
            ));
        }
        parse_pattern(&self.pattern)?;
        self.spectrum.validate()
    }
}
