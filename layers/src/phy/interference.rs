//! Interference Accumulation
//!
//! Tracks the sum of all concurrently received PSDs plus thermal noise and
//! produces time-averaged per-RB SINR over a reception window. Signal expiry
//! is processed lazily: every operation takes the current simulated time and
//! first applies the contributions that ended before it.

use super::spectrum_value::SpectrumValue;
use common::sim::SimTime;
use std::collections::VecDeque;
use tracing::trace;

/// A contribution that leaves the channel at `time`
#[derive(Debug, Clone)]
struct PendingExpiry {
    time: SimTime,
    psd: SpectrumValue,
}

/// Running sum of active signals with their scheduled expiries
#[derive(Debug, Clone)]
struct SignalSum {
    noise: SpectrumValue,
    all_signals: SpectrumValue,
    expiries: VecDeque<PendingExpiry>,
    last_change: SimTime,
}

impl SignalSum {
    fn new(noise: SpectrumValue) -> Self {
        let all_signals = SpectrumValue::zeros(noise.num_rbs(), noise.rb_width_hz());
        Self {
            noise,
            all_signals,
            expiries: VecDeque::new(),
            last_change: SimTime::ZERO,
        }
    }

    /// Apply every expiry up to `now`, reporting each elapsed chunk
    /// (duration, signals active during it, noise) to `on_chunk`.
    fn advance<F>(&mut self, now: SimTime, mut on_chunk: F)
    where
        F: FnMut(SimTime, &SpectrumValue, &SpectrumValue),
    {
        while self.expiries.front().map_or(false, |e| e.time <= now) {
            if let Some(expiry) = self.expiries.pop_front() {
                self.chunk_until(expiry.time, &mut on_chunk);
                self.all_signals -= &expiry.psd;
            }
        }
        self.chunk_until(now, &mut on_chunk);
    }

    fn chunk_until<F>(&mut self, t: SimTime, on_chunk: &mut F)
    where
        F: FnMut(SimTime, &SpectrumValue, &SpectrumValue),
    {
        if t > self.last_change {
            on_chunk(t - self.last_change, &self.all_signals, &self.noise);
        }
        self.last_change = t;
    }

    fn add(&mut self, now: SimTime, psd: &SpectrumValue, duration: SimTime) {
        self.all_signals += psd;
        let time = now + duration;
        let index = self.expiries.partition_point(|e| e.time <= time);
        self.expiries.insert(index, PendingExpiry { time, psd: psd.clone() });
    }

    fn is_busy(&self, threshold_w: f64) -> bool {
        self.all_signals.integral() > threshold_w
    }

    fn energy_duration(&self, now: SimTime, threshold_w: f64) -> SimTime {
        if !self.is_busy(threshold_w) {
            return SimTime::ZERO;
        }
        let mut power = self.all_signals.integral();
        let mut end = now;
        for expiry in &self.expiries {
            power -= expiry.psd.integral();
            end = expiry.time;
            if power < threshold_w {
                break;
            }
        }
        end.saturating_sub(now)
    }
}

/// Time-averaged SINR and SNR of one reception window
#[derive(Debug, Clone)]
pub struct RxSinr {
    pub sinr: SpectrumValue,
    pub snr: SpectrumValue,
}

/// Interference accumulator for cellular reception.
///
/// Concurrent receptions (OFDMA uplink at a gNB) are summed into one wanted
/// signal.
#[derive(Debug, Clone)]
pub struct Interference {
    signals: SignalSum,
    receiving: bool,
    rx_signal: SpectrumValue,
    sinr_sum: SpectrumValue,
    snr_sum: SpectrumValue,
    rx_duration: SimTime,
}

impl Interference {
    pub fn new(noise: SpectrumValue) -> Self {
        let zeros = SpectrumValue::zeros(noise.num_rbs(), noise.rb_width_hz());
        Self {
            signals: SignalSum::new(noise),
            receiving: false,
            rx_signal: zeros.clone(),
            sinr_sum: zeros.clone(),
            snr_sum: zeros,
            rx_duration: SimTime::ZERO,
        }
    }

    /// Replace the noise PSD. Drops all tracked signals.
    pub fn set_noise_psd(&mut self, noise: SpectrumValue) {
        *self = Self::new(noise);
    }

    pub fn noise_psd(&self) -> &SpectrumValue {
        &self.signals.noise
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    fn advance(&mut self, now: SimTime) {
        let receiving = self.receiving;
        let rx = &self.rx_signal;
        let sinr_sum = &mut self.sinr_sum;
        let snr_sum = &mut self.snr_sum;
        let rx_duration = &mut self.rx_duration;
        self.signals.advance(now, |duration, all, noise| {
            if !receiving {
                return;
            }
            let (sinr, snr) = chunk_sinr(rx, all, noise);
            let weight = duration.as_nanos() as f64;
            *sinr_sum += &sinr.scaled(weight);
            *snr_sum += &snr.scaled(weight);
            *rx_duration += duration;
        });
    }

    /// Register a contribution present on the channel for `duration`
    pub fn add_signal(&mut self, now: SimTime, psd: &SpectrumValue, duration: SimTime) {
        self.advance(now);
        self.signals.add(now, psd, duration);
        trace!("Interference: signal added, total power {:e} W", self.signals.all_signals.integral());
    }

    /// Start (or join) a reception window with `psd` as wanted signal
    pub fn start_rx(&mut self, now: SimTime, psd: &SpectrumValue) {
        self.advance(now);
        if self.receiving {
            self.rx_signal += psd;
        } else {
            self.receiving = true;
            self.rx_signal = psd.clone();
            self.sinr_sum.reset();
            self.snr_sum.reset();
            self.rx_duration = SimTime::ZERO;
        }
    }

    /// Close the reception window and return its averaged SINR.
    ///
    /// Panics if no reception is in progress.
    pub fn end_rx(&mut self, now: SimTime) -> RxSinr {
        assert!(self.receiving, "EndRx was already evaluated or RX was aborted");
        self.advance(now);
        self.receiving = false;

        if self.rx_duration.is_zero() {
            let (sinr, snr) = chunk_sinr(&self.rx_signal, &self.signals.all_signals, &self.signals.noise);
            return RxSinr { sinr, snr };
        }
        let norm = 1.0 / self.rx_duration.as_nanos() as f64;
        RxSinr {
            sinr: self.sinr_sum.scaled(norm),
            snr: self.snr_sum.scaled(norm),
        }
    }

    /// Total received power right now exceeds `threshold_w`
    pub fn is_channel_busy_now(&mut self, now: SimTime, threshold_w: f64) -> bool {
        self.advance(now);
        self.signals.is_busy(threshold_w)
    }

    /// Time until the received energy falls below `threshold_w`, zero if it
    /// already is below.
    pub fn energy_duration(&mut self, now: SimTime, threshold_w: f64) -> SimTime {
        self.advance(now);
        self.signals.energy_duration(now, threshold_w)
    }
}

/// Interference accumulator for sidelink reception.
///
/// Every concurrently received signal is evaluated separately against all
/// the others.
#[derive(Debug, Clone)]
pub struct SlInterference {
    signals: SignalSum,
    receiving: bool,
    rx_signals: Vec<SpectrumValue>,
    sinr_sums: Vec<SpectrumValue>,
    rx_duration: SimTime,
}

impl SlInterference {
    pub fn new(noise: SpectrumValue) -> Self {
        Self {
            signals: SignalSum::new(noise),
            receiving: false,
            rx_signals: Vec::new(),
            sinr_sums: Vec::new(),
            rx_duration: SimTime::ZERO,
        }
    }

    /// Replace the noise PSD. Drops all tracked signals.
    pub fn set_noise_psd(&mut self, noise: SpectrumValue) {
        *self = Self::new(noise);
    }

    fn advance(&mut self, now: SimTime) {
        let receiving = self.receiving;
        let rx_signals = &self.rx_signals;
        let sinr_sums = &mut self.sinr_sums;
        let rx_duration = &mut self.rx_duration;
        self.signals.advance(now, |duration, all, noise| {
            if !receiving {
                return;
            }
            let weight = duration.as_nanos() as f64;
            for (rx, sum) in rx_signals.iter().zip(sinr_sums.iter_mut()) {
                let (sinr, _) = chunk_sinr(rx, all, noise);
                *sum += &sinr.scaled(weight);
            }
            *rx_duration += duration;
        });
    }

    pub fn add_signal(&mut self, now: SimTime, psd: &SpectrumValue, duration: SimTime) {
        self.advance(now);
        self.signals.add(now, psd, duration);
    }

    /// Add a signal to the current reception window. The caller guarantees
    /// that all signals of one window start at the same instant.
    pub fn start_rx(&mut self, now: SimTime, psd: &SpectrumValue) {
        self.advance(now);
        if !self.receiving {
            self.receiving = true;
            self.rx_signals.clear();
            self.sinr_sums.clear();
            self.rx_duration = SimTime::ZERO;
        }
        self.rx_signals.push(psd.clone());
        self.sinr_sums
            .push(SpectrumValue::zeros(psd.num_rbs(), psd.rb_width_hz()));
    }

    /// Close the window; returns the averaged SINR of each signal in
    /// arrival order.
    pub fn end_rx(&mut self, now: SimTime) -> Vec<SpectrumValue> {
        assert!(self.receiving, "EndRx was already evaluated or RX was aborted");
        self.advance(now);
        self.receiving = false;

        if self.rx_duration.is_zero() {
            return self
                .rx_signals
                .iter()
                .map(|rx| chunk_sinr(rx, &self.signals.all_signals, &self.signals.noise).0)
                .collect();
        }
        let norm = 1.0 / self.rx_duration.as_nanos() as f64;
        self.sinr_sums.iter().map(|s| s.scaled(norm)).collect()
    }

    /// Received PSD of each signal of the last window, in arrival order
    pub fn rx_signals(&self) -> &[SpectrumValue] {
        &self.rx_signals
    }
}

/// SINR = S / (I + N) and SNR = S / N for one chunk, where the interference
/// is everything on air except the wanted signal.
fn chunk_sinr(rx: &SpectrumValue, all: &SpectrumValue, noise: &SpectrumValue) -> (SpectrumValue, SpectrumValue) {
    let mut denominator = all.clone();
    denominator -= rx;
    denominator += noise;
    (rx.ratio(&denominator), rx.ratio(noise))
}
