//! Beamforming Vectors
//!
//! Antenna weight vectors and the per-PHY store of the vector to use toward
//! each peer device. Beam search is not modelled: vectors toward peers are
//! installed from outside with [`BeamManager::set_beam`].

use common::types::NodeId;
use num_complex::Complex64;
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

/// Beam identifier (sector and elevation of the steering direction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct BeamId {
    pub sector: u16,
    pub elevation: i16,
}

impl BeamId {
    pub const OMNI: BeamId = BeamId { sector: u16::MAX, elevation: 0 };
}

/// Complex antenna weights, optionally steered at one device
#[derive(Debug, Clone, PartialEq)]
pub struct BeamformingVector {
    pub id: BeamId,
    pub weights: Vec<Complex64>,
    /// Device the beam is steered at, `None` for quasi-omni
    pub target: Option<NodeId>,
}

impl BeamformingVector {
    /// Single-element vector with unit gain in every direction
    pub fn quasi_omni() -> Self {
        Self {
            id: BeamId::OMNI,
            weights: vec![Complex64::new(1.0, 0.0)],
            target: None,
        }
    }

    /// Uniform, unit-norm weights over `num_elements` steered at `target`
    pub fn directional(id: BeamId, target: NodeId, num_elements: usize) -> Self {
        let n = num_elements.max(1);
        let w = 1.0 / (n as f64).sqrt();
        Self {
            id,
            weights: vec![Complex64::new(w, 0.0); n],
            target: Some(target),
        }
    }

    /// Array gain in the steering direction: (sum |w|)^2
    pub fn coherent_gain(&self) -> f64 {
        let s: f64 = self.weights.iter().map(|w| w.norm()).sum();
        s * s
    }

    /// Linear power gain toward `peer`. Off-target devices see the
    /// reciprocal of the main-lobe gain.
    pub fn gain_toward(&self, peer: NodeId) -> f64 {
        let coherent = self.coherent_gain();
        match self.target {
            Some(target) if target != peer => 1.0 / coherent,
            _ => coherent,
        }
    }
}

impl Default for BeamformingVector {
    fn default() -> Self {
        Self::quasi_omni()
    }
}

/// Beamforming state of one spectrum PHY
#[derive(Debug, Clone, Default)]
pub struct BeamManager {
    current: BeamformingVector,
    peers: HashMap<NodeId, BeamformingVector>,
}

impl BeamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the vector to use toward `peer`
    pub fn set_beam(&mut self, peer: NodeId, beam: BeamformingVector) {
        self.peers.insert(peer, beam);
    }

    pub fn beam_toward(&self, peer: NodeId) -> Option<&BeamformingVector> {
        self.peers.get(&peer)
    }

    /// Switch to the stored vector toward `peer`. Returns false, keeping
    /// the current vector, when none is stored.
    pub fn change_beam(&mut self, peer: NodeId) -> bool {
        match self.peers.get(&peer) {
            Some(beam) => {
                trace!("Beam changed toward {} ({:?})", peer, beam.id);
                self.current = beam.clone();
                true
            }
            None => false,
        }
    }

    pub fn change_to_quasi_omni(&mut self) {
        self.current = BeamformingVector::quasi_omni();
    }

    pub fn current(&self) -> &BeamformingVector {
        &self.current
    }

    pub fn beam_gain_toward(&self, peer: NodeId) -> f64 {
        self.current.gain_toward(peer)
    }
}
