//! Physical Layer (PHY) Submodules
//!
//! Spectrum-level model of the NR physical layer: interference and SINR
//! computation, error model, the half-duplex spectrum PHY state machine and
//! the slot engines of the gNB and the UE.
//!
//! Everything runs on one [`SimContext`]: a discrete-event queue of
//! [`PhyEvent`]s, the shared spectrum channel and the trace sink. Handlers
//! never block; they schedule future events and return.

pub mod beam;
pub mod cam;
pub mod channel;
pub mod config;
pub mod error_model;
pub mod frame;
pub mod frame_structure;
pub mod gnb_phy;
pub mod harq;
pub mod interference;
pub mod phy_core;
pub mod spectrum;
pub mod spectrum_value;
pub mod tb_registry;
pub mod trace;
pub mod ue_phy;

// Re-export commonly used types
pub use channel::{FixedLossModel, PropagationLossModel, SpectrumChannel};
pub use config::{PhyConfig, SpectrumPhyConfig};
pub use frame::{ControlMessage, FrameKind, Packet, PacketBurst, SignalFrame};
pub use frame_structure::SlotTables;
pub use gnb_phy::{GnbEvent, GnbPhy};
pub use spectrum::{DeviceRole, PhyIndication, RadioState, SpectrumPhy, SpectrumTimer};
pub use spectrum_value::SpectrumValue;
pub use trace::{TraceRecord, TraceSink};
pub use ue_phy::{UeEvent, UePhy};

use common::sim::{EventQueue, SimTime};
use common::types::NodeId;
use std::fmt;
use std::sync::Arc;

/// Address of one spectrum PHY: the device and the stream it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhyAddr {
    pub node: NodeId,
    pub stream: u8,
}

impl PhyAddr {
    pub fn new(node: NodeId, stream: u8) -> Self {
        Self { node, stream }
    }
}

impl fmt::Display for PhyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s{}", self.node, self.stream)
    }
}

/// Every event of a run
#[derive(Debug, Clone)]
pub enum PhyEvent {
    /// A frame reaches a spectrum PHY, with the PSD seen by that receiver
    SignalArrival {
        to: PhyAddr,
        psd: SpectrumValue,
        frame: Arc<SignalFrame>,
    },
    /// Timer owned by a spectrum PHY
    Spectrum { to: PhyAddr, timer: SpectrumTimer },
    Gnb { node: NodeId, event: GnbEvent },
    Ue { node: NodeId, event: UeEvent },
}

impl PhyEvent {
    /// Device that handles the event
    pub fn node(&self) -> NodeId {
        match self {
            PhyEvent::SignalArrival { to, .. } | PhyEvent::Spectrum { to, .. } => to.node,
            PhyEvent::Gnb { node, .. } | PhyEvent::Ue { node, .. } => *node,
        }
    }
}

/// State shared by every handler: clock and queue, channel, traces
#[derive(Debug)]
pub struct SimContext {
    pub queue: EventQueue<PhyEvent>,
    /// `None` when running a PHY in isolation
    pub channel: Option<SpectrumChannel>,
    pub traces: TraceSink,
}

impl SimContext {
    pub fn new(channel: Option<SpectrumChannel>, traces: TraceSink) -> Self {
        Self {
            queue: EventQueue::new(),
            channel,
            traces,
        }
    }

    /// Context without channel and with tracing disabled
    pub fn detached() -> Self {
        Self::new(None, TraceSink::default())
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }
}
