//! Simulation Driver
//!
//! Builds a topology of gNBs and UEs on one spectrum channel, wires each UE
//! to its serving cell and runs the event loop, handing every event to the
//! node that owns it.
//!
//! A scenario is normally described by a [`ScenarioConfig`] loaded from TOML:
//!
//! ```toml
//! seed = 7
//! duration_ms = 50
//!
//! [phy]
//! pattern = "DL|S|UL|UL|"
//!
//! [[gnbs]]
//! cell_id = 1
//!
//! [[ues]]
//! rnti = 10
//! serving_cell = 1
//!
//! [[losses]]
//! a = { gnb = 1 }
//! b = { ue = 10 }
//! loss_db = 85.0
//! ```

use crate::mac::{GnbMac, GnbMacConfig, GnbMacSapUser, MacStats, UeMac, UeMacConfig, UeMacSapUser, UeMacStats};
use crate::phy::beam::{BeamId, BeamformingVector};
use crate::phy::cam::{AlwaysOnAccessManager, ChannelAccessManager};
use crate::phy::gnb_phy::GnbPhyStats;
use crate::phy::spectrum::SpectrumPhyStats;
use crate::phy::ue_phy::{RankIndicatorConfig, UePhyStats};
use crate::phy::{
    FixedLossModel, GnbPhy, PhyAddr, PhyConfig, PhyEvent, PropagationLossModel, SimContext,
    SpectrumChannel, TraceRecord, TraceSink, UePhy,
};
use crate::LayerError;
use common::sim::SimTime;
use common::types::{BwpId, CellId, NodeId, Rnti, SfnSf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

// ============================================================================
// Scenario configuration
// ============================================================================

/// One end of a propagation link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// gNB serving the given cell id
    Gnb(u16),
    /// UE with the given RNTI
    Ue(u16),
}

/// Fixed loss between two devices, both directions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LinkLoss {
    pub a: Endpoint,
    pub b: Endpoint,
    pub loss_db: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GnbSpec {
    pub cell_id: u16,
    #[serde(default)]
    pub mac: GnbMacConfig,
    /// Overrides the scenario PHY configuration
    #[serde(default)]
    pub phy: Option<PhyConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UeSpec {
    pub rnti: u16,
    /// Cell to attach to; sidelink-only UEs have none
    #[serde(default)]
    pub serving_cell: Option<u16>,
    #[serde(default)]
    pub mac: UeMacConfig,
    #[serde(default)]
    pub phy: Option<PhyConfig>,
    #[serde(default)]
    pub rank_indicator: RankIndicatorConfig,
}

/// Complete description of a run
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Collect RX trace records
    #[serde(default = "default_true")]
    pub trace: bool,
    /// Loss of every link not listed in `losses`
    #[serde(default = "default_loss_db")]
    pub default_loss_db: f64,
    #[serde(default)]
    pub propagation_delay_ns: u64,
    /// Steer directional beams between each UE and its gNB
    #[serde(default)]
    pub antenna_elements: Option<usize>,
    #[serde(default)]
    pub phy: PhyConfig,
    #[serde(default)]
    pub gnbs: Vec<GnbSpec>,
    #[serde(default)]
    pub ues: Vec<UeSpec>,
    #[serde(default)]
    pub losses: Vec<LinkLoss>,
}

fn default_seed() -> u64 {
    1
}

fn default_duration_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_loss_db() -> f64 {
    100.0
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            duration_ms: default_duration_ms(),
            trace: true,
            default_loss_db: default_loss_db(),
            propagation_delay_ns: 0,
            antenna_elements: None,
            phy: PhyConfig::default(),
            gnbs: Vec::new(),
            ues: Vec::new(),
            losses: Vec::new(),
        }
    }
}

impl ScenarioConfig {
    pub fn duration(&self) -> SimTime {
        SimTime::from_millis(self.duration_ms)
    }

    /// PHY configuration of a node: its own override or the scenario one
    fn phy_for(&self, custom: &Option<PhyConfig>) -> PhyConfig {
        custom.clone().unwrap_or_else(|| self.phy.clone())
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if self.duration_ms == 0 {
            return Err(LayerError::InvalidConfiguration(
                "duration must be at least 1 ms".to_string(),
            ));
        }
        if self.antenna_elements == Some(0) {
            return Err(LayerError::InvalidConfiguration(
                "antenna_elements must be positive".to_string(),
            ));
        }
        self.phy.validate()?;

        let mut cells = BTreeSet::new();
        for gnb in &self.gnbs {
            if gnb.cell_id == 0 {
                return Err(LayerError::InvalidConfiguration(
                    "cell id 0 is reserved for unattached UEs".to_string(),
                ));
            }
            if !cells.insert(gnb.cell_id) {
                return Err(LayerError::InvalidConfiguration(format!(
                    "duplicate cell id {}",
                    gnb.cell_id
                )));
            }
            gnb.mac.validate()?;
            self.phy_for(&gnb.phy).validate()?;
        }

        let mut rntis = BTreeSet::new();
        for ue in &self.ues {
            if !rntis.insert(ue.rnti) {
                return Err(LayerError::InvalidConfiguration(format!("duplicate RNTI {}", ue.rnti)));
            }
            if let Some(cell) = ue.serving_cell {
                if !cells.contains(&cell) {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "UE {} served by unknown cell {}",
                        ue.rnti, cell
                    )));
                }
            }
            self.phy_for(&ue.phy).validate()?;
        }

        for link in &self.losses {
            for endpoint in [link.a, link.b] {
                let known = match endpoint {
                    Endpoint::Gnb(cell) => cells.contains(&cell),
                    Endpoint::Ue(rnti) => rntis.contains(&rnti),
                };
                if !known {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "loss refers to unknown {:?}",
                        endpoint
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Run summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GnbSummary {
    pub cell_id: u16,
    pub node: u32,
    pub phy: GnbPhyStats,
    pub mac: MacStats,
    pub spectrum: Vec<SpectrumPhyStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UeSummary {
    pub rnti: u16,
    pub node: u32,
    /// 0 when not attached
    pub cell_id: u16,
    pub phy: UePhyStats,
    pub mac: UeMacStats,
    pub spectrum: Vec<SpectrumPhyStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sim_time_ms: f64,
    pub events: u64,
    pub frames_transmitted: u64,
    pub trace_records: usize,
    pub gnbs: Vec<GnbSummary>,
    pub ues: Vec<UeSummary>,
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug)]
enum Node {
    Gnb(Box<GnbPhy>),
    Ue(Box<UePhy>),
}

/// Owner of the event queue, the channel and every device of a run
#[derive(Debug)]
pub struct Simulation {
    ctx: SimContext,
    nodes: BTreeMap<NodeId, Node>,
    cells: BTreeMap<CellId, NodeId>,
    ues: BTreeMap<Rnti, NodeId>,
    next_node: u32,
    seed: u64,
    started: bool,
    events_processed: u64,
}

impl Simulation {
    pub fn new(loss: Box<dyn PropagationLossModel>, propagation_delay: SimTime, seed: u64, trace: bool) -> Self {
        let channel = SpectrumChannel::new(loss).with_delay(propagation_delay);
        Self {
            ctx: SimContext::new(Some(channel), TraceSink::new(trace)),
            nodes: BTreeMap::new(),
            cells: BTreeMap::new(),
            ues: BTreeMap::new(),
            next_node: 1,
            seed,
            started: false,
            events_processed: 0,
        }
    }

    /// Build every node of `config`, attach the UEs to their cells and
    /// install the link losses
    pub fn from_config(config: &ScenarioConfig) -> Result<Self, LayerError> {
        config.validate()?;
        let mut sim = Self::new(
            Box::new(FixedLossModel::new(config.default_loss_db)),
            SimTime::from_nanos(config.propagation_delay_ns),
            config.seed,
            config.trace,
        );

        for spec in &config.gnbs {
            let phy = config.phy_for(&spec.phy);
            let mac = GnbMac::new(spec.mac.clone(), &phy, BwpId(0))?;
            let cam = AlwaysOnAccessManager::new(phy.cam_grant_duration());
            sim.add_gnb(phy, CellId(spec.cell_id), Box::new(mac), Box::new(cam))?;
        }

        for spec in &config.ues {
            let phy = config.phy_for(&spec.phy);
            let rnti = Rnti(spec.rnti);
            let mac = UeMac::new(rnti, spec.mac.clone(), &phy)?;
            let cam = AlwaysOnAccessManager::new(phy.cam_grant_duration());
            sim.add_ue(phy, rnti, Box::new(mac), Box::new(cam))?;
            if let Some(ue) = sim.ue_mut(rnti) {
                ue.set_rank_indicator_config(spec.rank_indicator.clone());
            }
        }

        let mut loss = FixedLossModel::new(config.default_loss_db);
        for link in &config.losses {
            let a = sim.endpoint_node(link.a)?;
            let b = sim.endpoint_node(link.b)?;
            loss.set_loss(a, b, link.loss_db);
        }
        if let Some(channel) = sim.ctx.channel.as_mut() {
            channel.set_loss_model(Box::new(loss));
        }

        for spec in &config.ues {
            if let Some(cell) = spec.serving_cell {
                sim.attach_ue(Rnti(spec.rnti), CellId(cell))?;
                if let Some(elements) = config.antenna_elements {
                    sim.steer_beams(Rnti(spec.rnti), elements)?;
                }
            }
        }
        Ok(sim)
    }

    fn allocate_node(&mut self) -> NodeId {
        let node = NodeId(self.next_node);
        self.next_node += 1;
        node
    }

    fn attach_streams(&mut self, node: NodeId, num_streams: usize) {
        if let Some(channel) = self.ctx.channel.as_mut() {
            for stream in 0..num_streams {
                channel.attach(PhyAddr::new(node, stream as u8));
            }
        }
    }

    pub fn add_gnb(
        &mut self,
        config: PhyConfig,
        cell_id: CellId,
        mac: Box<dyn GnbMacSapUser>,
        cam: Box<dyn ChannelAccessManager>,
    ) -> Result<NodeId, LayerError> {
        if self.cells.contains_key(&cell_id) {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {} already has a gNB",
                cell_id.0
            )));
        }
        let node = self.allocate_node();
        let phy = GnbPhy::new(config, node, cell_id, BwpId(0), mac, cam, self.seed)?;
        self.attach_streams(node, phy.core().num_streams());
        self.nodes.insert(node, Node::Gnb(Box::new(phy)));
        self.cells.insert(cell_id, node);
        Ok(node)
    }

    pub fn add_ue(
        &mut self,
        config: PhyConfig,
        rnti: Rnti,
        mac: Box<dyn UeMacSapUser>,
        cam: Box<dyn ChannelAccessManager>,
    ) -> Result<NodeId, LayerError> {
        if self.ues.contains_key(&rnti) {
            return Err(LayerError::InvalidConfiguration(format!("RNTI {} already in use", rnti)));
        }
        let node = self.allocate_node();
        let phy = UePhy::new(config, node, rnti, BwpId(0), mac, cam, self.seed)?;
        self.attach_streams(node, phy.core().num_streams());
        self.nodes.insert(node, Node::Ue(Box::new(phy)));
        self.ues.insert(rnti, node);
        Ok(node)
    }

    fn endpoint_node(&self, endpoint: Endpoint) -> Result<NodeId, LayerError> {
        match endpoint {
            Endpoint::Gnb(cell) => self.cell_node(CellId(cell)),
            Endpoint::Ue(rnti) => self.ue_node(Rnti(rnti)),
        }
    }

    fn cell_node(&self, cell_id: CellId) -> Result<NodeId, LayerError> {
        self.cells
            .get(&cell_id)
            .copied()
            .ok_or_else(|| LayerError::UnknownNode(format!("cell {}", cell_id.0)))
    }

    fn ue_node(&self, rnti: Rnti) -> Result<NodeId, LayerError> {
        self.ues
            .get(&rnti)
            .copied()
            .ok_or_else(|| LayerError::UnknownNode(format!("UE {}", rnti)))
    }

    /// Register the UE to the cell and the cell's MAC to the UE
    pub fn attach_ue(&mut self, rnti: Rnti, cell_id: CellId) -> Result<(), LayerError> {
        let gnb_node = self.cell_node(cell_id)?;
        let ue_node = self.ue_node(rnti)?;
        if let Some(Node::Ue(ue)) = self.nodes.get_mut(&ue_node) {
            ue.register_to_gnb(cell_id, gnb_node);
        }
        if let Some(Node::Gnb(gnb)) = self.nodes.get_mut(&gnb_node) {
            gnb.add_ue(rnti, ue_node);
        }
        Ok(())
    }

    /// Install directional beams between an attached UE and its gNB
    pub fn steer_beams(&mut self, rnti: Rnti, num_elements: usize) -> Result<(), LayerError> {
        let ue_node = self.ue_node(rnti)?;
        let cell_id = self
            .ue(rnti)
            .map(|ue| ue.cell_id())
            .filter(|cell| cell.0 != 0)
            .ok_or_else(|| LayerError::InvalidState(format!("UE {} is not attached", rnti)))?;
        let gnb_node = self.cell_node(cell_id)?;

        let toward_ue = BeamformingVector::directional(
            BeamId {
                sector: rnti.value(),
                elevation: 0,
            },
            ue_node,
            num_elements,
        );
        let toward_gnb = BeamformingVector::directional(
            BeamId {
                sector: cell_id.0,
                elevation: 0,
            },
            gnb_node,
            num_elements,
        );
        if let Some(Node::Gnb(gnb)) = self.nodes.get_mut(&gnb_node) {
            gnb.set_beam(ue_node, toward_ue);
        }
        if let Some(Node::Ue(ue)) = self.nodes.get_mut(&ue_node) {
            ue.set_beam(gnb_node, toward_gnb);
        }
        debug!("Beams steered between UE {} and cell {}", rnti, cell_id.0);
        Ok(())
    }

    /// Start the slot loop of every node. Called by the first `run_until`.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!(
            "Starting simulation: {} gNB(s), {} UE(s), seed {}",
            self.cells.len(),
            self.ues.len(),
            self.seed
        );
        for node in self.nodes.values_mut() {
            match node {
                Node::Gnb(phy) => {
                    let start = SfnSf::new(0, 0, 0, phy.core().config().numerology);
                    phy.start_event_loop(&mut self.ctx, start);
                }
                Node::Ue(phy) => {
                    let start = SfnSf::new(0, 0, 0, phy.core().config().numerology);
                    phy.start_event_loop(&mut self.ctx, start);
                }
            }
        }
    }

    /// Process every event scheduled before `end`
    pub fn run_until(&mut self, end: SimTime) {
        self.start();
        while self.ctx.queue.peek_time().is_some_and(|t| t < end) {
            let Some((_, event)) = self.ctx.queue.pop() else {
                break;
            };
            self.dispatch(event);
            self.events_processed += 1;
        }
        debug!(
            "Simulation paused at {} after {} events",
            self.ctx.now(),
            self.events_processed
        );
    }

    fn dispatch(&mut self, event: PhyEvent) {
        let node_id = event.node();
        let Some(node) = self.nodes.get_mut(&node_id) else {
            warn!("Dropping event for unknown {}", node_id);
            return;
        };
        let ctx = &mut self.ctx;
        match (node, event) {
            (Node::Gnb(phy), PhyEvent::Gnb { event, .. }) => phy.handle_event(ctx, event),
            (Node::Ue(phy), PhyEvent::Ue { event, .. }) => phy.handle_event(ctx, event),
            (Node::Gnb(phy), PhyEvent::SignalArrival { to, psd, frame }) => {
                phy.receive_signal(ctx, to.stream, psd, frame)
            }
            (Node::Ue(phy), PhyEvent::SignalArrival { to, psd, frame }) => {
                phy.receive_signal(ctx, to.stream, psd, frame)
            }
            (Node::Gnb(phy), PhyEvent::Spectrum { to, timer }) => phy.handle_spectrum_timer(ctx, to.stream, timer),
            (Node::Ue(phy), PhyEvent::Spectrum { to, timer }) => phy.handle_spectrum_timer(ctx, to.stream, timer),
            (_, event) => panic!("Event {:?} routed to the wrong kind of node {}", event, node_id),
        }
    }

    pub fn now(&self) -> SimTime {
        self.ctx.now()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn channel(&self) -> Option<&SpectrumChannel> {
        self.ctx.channel.as_ref()
    }

    pub fn traces(&self) -> &[TraceRecord] {
        self.ctx.traces.records()
    }

    pub fn take_traces(&mut self) -> Vec<TraceRecord> {
        self.ctx.traces.take()
    }

    pub fn gnb(&self, cell_id: CellId) -> Option<&GnbPhy> {
        match self.nodes.get(self.cells.get(&cell_id)?)? {
            Node::Gnb(phy) => Some(phy.as_ref()),
            Node::Ue(_) => None,
        }
    }

    pub fn gnb_mut(&mut self, cell_id: CellId) -> Option<&mut GnbPhy> {
        match self.nodes.get_mut(self.cells.get(&cell_id)?)? {
            Node::Gnb(phy) => Some(phy.as_mut()),
            Node::Ue(_) => None,
        }
    }

    pub fn ue(&self, rnti: Rnti) -> Option<&UePhy> {
        match self.nodes.get(self.ues.get(&rnti)?)? {
            Node::Ue(phy) => Some(phy.as_ref()),
            Node::Gnb(_) => None,
        }
    }

    pub fn ue_mut(&mut self, rnti: Rnti) -> Option<&mut UePhy> {
        match self.nodes.get_mut(self.ues.get(&rnti)?)? {
            Node::Ue(phy) => Some(phy.as_mut()),
            Node::Gnb(_) => None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        let spectrum_stats =
            |phys: &[crate::phy::SpectrumPhy]| phys.iter().map(|p| p.stats().clone()).collect::<Vec<_>>();

        let gnbs = self
            .cells
            .iter()
            .filter_map(|(cell, node)| {
                let phy = self.gnb(*cell)?;
                Some(GnbSummary {
                    cell_id: cell.0,
                    node: node.0,
                    phy: phy.stats().clone(),
                    mac: phy.mac().stats(),
                    spectrum: spectrum_stats(phy.core().spectrum_phys()),
                })
            })
            .collect();

        let ues = self
            .ues
            .iter()
            .filter_map(|(rnti, node)| {
                let phy = self.ue(*rnti)?;
                Some(UeSummary {
                    rnti: rnti.value(),
                    node: node.0,
                    cell_id: phy.cell_id().0,
                    phy: phy.stats().clone(),
                    mac: phy.mac().stats(),
                    spectrum: spectrum_stats(phy.core().spectrum_phys()),
                })
            })
            .collect();

        RunSummary {
            sim_time_ms: self.now().as_millis_f64(),
            events: self.events_processed,
            frames_transmitted: self.channel().map(|c| c.tx_count()).unwrap_or(0),
            trace_records: self.traces().len(),
            gnbs,
            ues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::SlTrafficConfig;

    const SCENARIO: &str = r#"
        seed = 3
        duration_ms = 20
        default_loss_db = 140.0

        [phy]
        pattern = "DL|S|UL|UL|"
        num_rbs = 24

        [[gnbs]]
        cell_id = 1
        mac = { mcs = 5 }

        [[ues]]
        rnti = 10
        serving_cell = 1
        mac = { ul_bytes = 200, ul_period_slots = 4 }

        [[ues]]
        rnti = 11

        [[losses]]
        a = { gnb = 1 }
        b = { ue = 10 }
        loss_db = 80.0
    "#;

    fn cellular_scenario() -> ScenarioConfig {
        ScenarioConfig {
            seed: 5,
            duration_ms: 20,
            default_loss_db: 80.0,
            phy: PhyConfig {
                num_rbs: 24,
                ..PhyConfig::default()
            },
            gnbs: vec![GnbSpec {
                cell_id: 1,
                mac: GnbMacConfig::default(),
                phy: None,
            }],
            ues: vec![UeSpec {
                rnti: 10,
                serving_cell: Some(1),
                mac: UeMacConfig {
                    ul_bytes: 300,
                    ul_period_slots: 5,
                    ..UeMacConfig::default()
                },
                phy: None,
                rank_indicator: RankIndicatorConfig::default(),
            }],
            ..ScenarioConfig::default()
        }
    }

    fn sidelink_ue(rnti: u16, sl_traffic: Option<SlTrafficConfig>, rx: Vec<u32>) -> UeSpec {
        UeSpec {
            rnti,
            serving_cell: None,
            mac: UeMacConfig {
                sl_traffic,
                sl_rx_destinations: rx,
                ..UeMacConfig::default()
            },
            phy: None,
            rank_indicator: RankIndicatorConfig::default(),
        }
    }

    fn sidelink_scenario(ues: Vec<UeSpec>) -> ScenarioConfig {
        ScenarioConfig {
            duration_ms: 10,
            default_loss_db: 80.0,
            phy: PhyConfig {
                pattern: "UL|UL|UL|UL|UL|".to_string(),
                num_rbs: 20,
                sl_sub_channel_size: 10,
                ..PhyConfig::default()
            },
            ues,
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn test_scenario_from_toml() {
        let config: ScenarioConfig = toml::from_str(SCENARIO).unwrap();
        assert_eq!(config.seed, 3);
        assert_eq!(config.duration(), SimTime::from_millis(20));
        assert_eq!(config.phy.num_rbs, 24);
        assert_eq!(config.gnbs[0].mac.mcs, 5);
        assert!(config.gnbs[0].mac.dl_full_buffer);
        assert_eq!(config.ues[0].serving_cell, Some(1));
        assert_eq!(config.ues[1].serving_cell, None);
        assert_eq!(config.losses[0].a, Endpoint::Gnb(1));
        assert_eq!(config.losses[0].b, Endpoint::Ue(10));

        let sim = Simulation::from_config(&config).unwrap();
        let gnb = sim.gnb(CellId(1)).unwrap();
        let ue = sim.ue(Rnti(10)).unwrap();
        assert_eq!(ue.cell_id(), CellId(1));
        assert_eq!(sim.ue(Rnti(11)).unwrap().cell_id(), CellId(0));

        let channel = sim.channel().unwrap();
        assert!(channel.is_attached(PhyAddr::new(gnb.node(), 0)));
        assert!(channel.is_attached(PhyAddr::new(ue.node(), 0)));
        assert!(!channel.is_attached(PhyAddr::new(ue.node(), 1)));
    }

    #[test]
    fn test_validate_rejects_bad_topologies() {
        let mut config = cellular_scenario();
        config.gnbs.push(config.gnbs[0].clone());
        assert!(matches!(config.validate(), Err(LayerError::InvalidConfiguration(_))));

        let mut config = cellular_scenario();
        config.ues[0].serving_cell = Some(9);
        assert!(config.validate().is_err());

        let mut config = cellular_scenario();
        config.losses.push(LinkLoss {
            a: Endpoint::Gnb(1),
            b: Endpoint::Ue(99),
            loss_db: 70.0,
        });
        assert!(config.validate().is_err());

        let mut config = cellular_scenario();
        config.ues[0].phy = Some(PhyConfig {
            num_streams: 3,
            ..PhyConfig::default()
        });
        assert!(Simulation::from_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_nodes_rejected() {
        let mut sim = Simulation::new(Box::new(FixedLossModel::new(80.0)), SimTime::ZERO, 1, false);
        let phy = PhyConfig::default();
        let mac = GnbMac::new(GnbMacConfig::default(), &phy, BwpId(0)).unwrap();
        sim.add_gnb(phy.clone(), CellId(1), Box::new(mac), Box::new(AlwaysOnAccessManager::default()))
            .unwrap();
        let mac = GnbMac::new(GnbMacConfig::default(), &phy, BwpId(0)).unwrap();
        let again = sim.add_gnb(phy.clone(), CellId(1), Box::new(mac), Box::new(AlwaysOnAccessManager::default()));
        assert!(again.is_err());

        assert!(matches!(
            sim.attach_ue(Rnti(4), CellId(1)),
            Err(LayerError::UnknownNode(_))
        ));
        assert!(sim.steer_beams(Rnti(4), 4).is_err());
    }

    #[test]
    fn test_cellular_dl_and_ul_end_to_end() {
        let mut sim = Simulation::from_config(&cellular_scenario()).unwrap();
        sim.run_until(SimTime::from_millis(20));
        assert!(sim.now() < SimTime::from_millis(20));
        assert!(sim.events_processed() > 0);

        let summary = sim.summary();
        let gnb = &summary.gnbs[0];
        let ue = &summary.ues[0];
        assert_eq!(ue.cell_id, 1);

        // 20 ms at 0.5 ms per slot
        assert_eq!(gnb.phy.slots, 40);
        assert_eq!(ue.phy.slots, 40);
        assert!(gnb.phy.mibs > 0);

        assert!(gnb.mac.dl_allocations > 0);
        assert!(ue.phy.dl_dcis > 0);
        assert!(ue.mac.dl_pdus_received > 0);
        assert!(gnb.mac.dl_harq_acks > 0);
        assert_eq!(gnb.mac.dl_harq_nacks, 0);

        assert!(gnb.mac.bsrs_received > 0);
        assert!(ue.mac.ul_pdus_sent > 0);
        assert!(gnb.mac.ul_pdus_received > 0);

        let dl_traces: Vec<_> = sim
            .traces()
            .iter()
            .filter_map(|r| match r {
                TraceRecord::RxData(t) if t.downlink => Some(t),
                _ => None,
            })
            .collect();
        assert!(!dl_traces.is_empty());
        assert!(dl_traces.iter().all(|t| !t.corrupt && t.rnti == 10 && t.cell_id == 1));
        assert_eq!(summary.trace_records, sim.traces().len());
    }

    #[test]
    fn test_run_is_reproducible() {
        let mut config = cellular_scenario();
        config.default_loss_db = 120.0;
        let run = |config: &ScenarioConfig| {
            let mut sim = Simulation::from_config(config).unwrap();
            sim.run_until(SimTime::from_millis(10));
            sim.take_traces()
        };
        let first = run(&config);
        assert!(!first.is_empty());
        assert_eq!(first, run(&config));
    }

    #[test]
    fn test_run_until_resumes() {
        let mut sim = Simulation::from_config(&cellular_scenario()).unwrap();
        sim.run_until(SimTime::from_millis(5));
        let events = sim.events_processed();
        let slots = sim.gnb(CellId(1)).unwrap().stats().slots;
        assert_eq!(slots, 10);

        sim.run_until(SimTime::from_millis(10));
        assert!(sim.events_processed() > events);
        assert_eq!(sim.gnb(CellId(1)).unwrap().stats().slots, 20);
    }

    #[test]
    fn test_directional_beams_installed() {
        let mut config = cellular_scenario();
        config.antenna_elements = Some(4);
        let mut sim = Simulation::from_config(&config).unwrap();
        sim.run_until(SimTime::from_millis(5));
        assert!(sim.summary().ues[0].mac.dl_pdus_received > 0);
    }

    #[test]
    fn test_sidelink_end_to_end() {
        let tx_flow = SlTrafficConfig {
            dst_l2_id: 7,
            period_slots: 4,
            ..SlTrafficConfig::default()
        };
        let config = sidelink_scenario(vec![sidelink_ue(1, Some(tx_flow), vec![]), sidelink_ue(2, None, vec![7])]);
        let mut sim = Simulation::from_config(&config).unwrap();
        sim.run_until(SimTime::from_millis(10));

        let tx = sim.ue(Rnti(1)).unwrap();
        let rx = sim.ue(Rnti(2)).unwrap();
        assert!(tx.stats().pscch_tx > 0);
        assert_eq!(tx.stats().pscch_tx, tx.stats().pssch_tx);
        assert!(rx.stats().pscch_rx > 0);
        assert!(rx.stats().pssch_rx > 0);
        assert!(rx.stats().last_sl_rsrp_dbm.is_some());
        assert!(rx.mac().stats().sl_pdus_received > 0);
        assert_eq!(tx.mac().stats().sl_pdus_received, 0);

        let pssch: Vec<_> = sim
            .traces()
            .iter()
            .filter_map(|r| match r {
                TraceRecord::RxPssch(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(!pssch.is_empty());
        assert!(pssch.iter().all(|t| t.dst_l2_id == 7 && t.src_l2_id == 1 && !t.corrupt));
    }

    #[test]
    fn test_sidelink_destination_filter() {
        let tx_flow = SlTrafficConfig {
            dst_l2_id: 7,
            period_slots: 4,
            ..SlTrafficConfig::default()
        };
        let config = sidelink_scenario(vec![sidelink_ue(1, Some(tx_flow), vec![]), sidelink_ue(2, None, vec![8])]);
        let mut sim = Simulation::from_config(&config).unwrap();
        sim.run_until(SimTime::from_millis(10));

        let rx = sim.ue(Rnti(2)).unwrap();
        assert_eq!(rx.stats().pssch_rx, 0);
        assert_eq!(rx.mac().stats().sl_pdus_received, 0);
    }

    #[test]
    fn test_sidelink_half_duplex() {
        let flow = |dst| SlTrafficConfig {
            dst_l2_id: dst,
            period_slots: 4,
            ..SlTrafficConfig::default()
        };
        let config = sidelink_scenario(vec![
            sidelink_ue(1, Some(flow(2)), vec![1]),
            sidelink_ue(2, Some(flow(1)), vec![2]),
        ]);
        let mut sim = Simulation::from_config(&config).unwrap();
        sim.run_until(SimTime::from_millis(10));

        for rnti in [Rnti(1), Rnti(2)] {
            let ue = sim.ue(rnti).unwrap();
            assert!(ue.stats().pscch_tx > 0);
            assert!(ue.core().spectrum(0).stats().sl_half_duplex_drops > 0);
            assert_eq!(ue.stats().pssch_rx, 0);
        }
    }
}
