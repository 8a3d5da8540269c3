//! Spectrum Channel
//!
//! Fan-out of transmitted frames to every attached spectrum PHY of other
//! devices. The received PSD is the transmitted one scaled by the
//! propagation gain and both ends' beamforming gains.

use super::beam::BeamformingVector;
use super::frame::SignalFrame;
use super::{PhyAddr, PhyEvent};
use common::sim::{EventQueue, SimTime};
use common::types::NodeId;
use common::utils::db_to_linear;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, trace};

/// Path loss between two devices
pub trait PropagationLossModel: Debug + Send {
    /// Loss in dB (positive values attenuate)
    fn loss_db(&self, tx: NodeId, rx: NodeId) -> f64;
}

/// Loss looked up per unordered device pair, with a default for the rest
#[derive(Debug, Clone)]
pub struct FixedLossModel {
    default_db: f64,
    pairs: HashMap<(NodeId, NodeId), f64>,
}

impl FixedLossModel {
    pub fn new(default_db: f64) -> Self {
        Self {
            default_db,
            pairs: HashMap::new(),
        }
    }

    /// Set the loss between `a` and `b` in both directions
    pub fn set_loss(&mut self, a: NodeId, b: NodeId, loss_db: f64) {
        self.pairs.insert(Self::key(a, b), loss_db);
    }

    fn key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

impl PropagationLossModel for FixedLossModel {
    fn loss_db(&self, tx: NodeId, rx: NodeId) -> f64 {
        self.pairs
            .get(&Self::key(tx, rx))
            .copied()
            .unwrap_or(self.default_db)
    }
}

/// Publish/subscribe channel shared by all spectrum PHYs of a run
#[derive(Debug)]
pub struct SpectrumChannel {
    receivers: Vec<PhyAddr>,
    beams: HashMap<PhyAddr, BeamformingVector>,
    loss: Box<dyn PropagationLossModel>,
    delay: SimTime,
    tx_count: u64,
}

impl SpectrumChannel {
    pub fn new(loss: Box<dyn PropagationLossModel>) -> Self {
        Self {
            receivers: Vec::new(),
            beams: HashMap::new(),
            loss,
            delay: SimTime::ZERO,
            tx_count: 0,
        }
    }

    /// Propagation delay applied to every signal
    pub fn with_delay(mut self, delay: SimTime) -> Self {
        self.delay = delay;
        self
    }

    /// Replace the propagation model, e.g. once the node identities are known
    pub fn set_loss_model(&mut self, loss: Box<dyn PropagationLossModel>) {
        self.loss = loss;
    }

    pub fn attach(&mut self, addr: PhyAddr) {
        if !self.receivers.contains(&addr) {
            debug!("Spectrum PHY {} attached to the channel", addr);
            self.receivers.push(addr);
        }
    }

    pub fn detach(&mut self, addr: PhyAddr) {
        self.receivers.retain(|a| *a != addr);
        self.beams.remove(&addr);
    }

    pub fn is_attached(&self, addr: PhyAddr) -> bool {
        self.receivers.contains(&addr)
    }

    /// Record the beamforming vector a PHY currently uses
    pub fn set_beam(&mut self, addr: PhyAddr, beam: BeamformingVector) {
        self.beams.insert(addr, beam);
    }

    fn beam_gain(&self, addr: PhyAddr, peer: NodeId) -> f64 {
        self.beams
            .get(&addr)
            .map(|b| b.gain_toward(peer))
            .unwrap_or(1.0)
    }

    /// Number of frames transmitted so far
    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    /// Deliver `frame` to every attached PHY of the other devices
    pub fn start_tx(&mut self, queue: &mut EventQueue<PhyEvent>, frame: SignalFrame) {
        self.tx_count += 1;
        let source = frame.source;
        let frame = Arc::new(frame);

        for &rx in self.receivers.iter().filter(|rx| rx.node != source.node) {
            let gain = db_to_linear(-self.loss.loss_db(source.node, rx.node))
                * self.beam_gain(source, rx.node)
                * self.beam_gain(rx, source.node);
            let psd = frame.psd.scaled(gain);
            trace!(
                "{:?} from {} to {} with gain {:.3e}, arriving in {}",
                frame.kind,
                source,
                rx,
                gain,
                self.delay
            );
            queue.schedule(
                self.delay,
                PhyEvent::SignalArrival {
                    to: rx,
                    psd,
                    frame: Arc::clone(&frame),
                },
            );
        }
    }
}
