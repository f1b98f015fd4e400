//! The extracellular matrix
//!
//! The matrix owns every neuron and synapse. It is the position
//! authority, the axonal-delay provider, the chemical orchestrator, and
//! the only component allowed to create or destroy synapses. Neurons and
//! synapses reach each other through non-owning handles resolved here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use somata_core::{
    Clock, Ligand, MatrixConfig, NeuronConfig, NeuronId, Position, SynapseConfig, SynapseId, Time,
};

use crate::chemistry::ChemicalField;
use crate::error::{Result, RuntimeError};
use crate::neuron::{NeuronHandle, StructuralContext};
use crate::scheduler::DeliveryScheduler;
use crate::spatial::SpatialIndex;
use crate::synapse::{ChemicalSynapse, DelayProvider, Synapse};

/// Constructor for a neuron variant
pub type NeuronFactory =
    Box<dyn Fn(NeuronId, NeuronConfig, Clock) -> Result<Arc<NeuronHandle>> + Send + Sync>;

/// Everything a synapse factory needs to wire a new synapse
pub struct SynapseContext {
    /// Allocated synapse ID
    pub id: SynapseId,
    /// Synapse configuration
    pub config: SynapseConfig,
    /// Axonal-delay provider backed by the matrix
    pub delays: Arc<dyn DelayProvider>,
    /// The pre-neuron's delivery scheduler
    pub scheduler: DeliveryScheduler,
    /// The post-neuron's input channel
    pub target: tokio::sync::mpsc::Sender<somata_core::NeuralSignal>,
    /// Creation timestamp
    pub created: Time,
}

/// Constructor for a synapse variant
pub type SynapseFactory = Box<dyn Fn(SynapseContext) -> Result<Arc<dyn Synapse>> + Send + Sync>;

/// Which endpoint of a synapse a query is anchored at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Match on the post side (synapses into `target_id`)
    Incoming,
    /// Match on the pre side (synapses out of `source_id`)
    Outgoing,
    /// Match on either side
    #[default]
    Both,
}

/// Filter for [`ExtracellularMatrix::list_synapses`]
///
/// `source_id` and `target_id` are independent, disjunctive filters: with
/// `Direction::Both` and both ids set to the same neuron, the criteria
/// matches every synapse touching that neuron.
#[derive(Debug, Clone, Default)]
pub struct SynapseCriteria {
    /// Endpoint selector
    pub direction: Direction,
    /// Pre-side neuron filter
    pub source_id: Option<NeuronId>,
    /// Post-side neuron filter
    pub target_id: Option<NeuronId>,
    /// Factory tag filter
    pub synapse_type: Option<String>,
}

impl SynapseCriteria {
    /// Criteria matching every synapse touching a neuron
    pub fn touching(neuron: NeuronId) -> Self {
        Self {
            direction: Direction::Both,
            source_id: Some(neuron),
            target_id: Some(neuron),
            synapse_type: None,
        }
    }

    /// Criteria matching synapses out of a neuron
    pub fn outgoing(neuron: NeuronId) -> Self {
        Self {
            direction: Direction::Outgoing,
            source_id: Some(neuron),
            target_id: None,
            synapse_type: None,
        }
    }

    /// Criteria matching synapses into a neuron
    pub fn incoming(neuron: NeuronId) -> Self {
        Self {
            direction: Direction::Incoming,
            source_id: None,
            target_id: Some(neuron),
            synapse_type: None,
        }
    }

    fn matches(&self, synapse: &dyn Synapse) -> bool {
        if let Some(tag) = &self.synapse_type {
            if synapse.synapse_type() != tag {
                return false;
            }
        }
        let pre_matches = |id: Option<NeuronId>| id.map_or(true, |n| synapse.pre_id() == n);
        let post_matches = |id: Option<NeuronId>| id.map_or(true, |n| synapse.post_id() == n);
        match self.direction {
            Direction::Outgoing => pre_matches(self.source_id),
            Direction::Incoming => post_matches(self.target_id),
            Direction::Both => {
                if self.source_id.is_none() && self.target_id.is_none() {
                    true
                } else {
                    self.source_id.map_or(false, |n| synapse.pre_id() == n)
                        || self.target_id.map_or(false, |n| synapse.post_id() == n)
                }
            }
        }
    }
}

/// Aggregate counters for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MatrixStats {
    /// Registered neurons
    pub neurons: usize,
    /// Registered synapses
    pub synapses: usize,
    /// Active chemical emissions
    pub active_emissions: usize,
    /// Chemical bindings skipped because the local concentration fell
    /// below epsilon
    pub below_epsilon_skips: u64,
    /// Whether the background loop is running
    pub running: bool,
}

struct MatrixInner {
    config: MatrixConfig,
    clock: Clock,
    self_weak: Weak<MatrixInner>,
    neurons: RwLock<HashMap<NeuronId, Arc<NeuronHandle>>>,
    synapses: RwLock<BTreeMap<SynapseId, Arc<dyn Synapse>>>,
    spatial: SpatialIndex,
    field: ChemicalField,
    neuron_factories: RwLock<HashMap<String, NeuronFactory>>,
    synapse_factories: RwLock<HashMap<String, SynapseFactory>>,
    axon_speed: AtomicU32,
    next_neuron: AtomicU32,
    next_synapse: AtomicU64,
    below_epsilon_skips: AtomicU64,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl fmt::Debug for MatrixInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixInner")
            .field("neurons", &self.neurons.read().len())
            .field("synapses", &self.synapses.read().len())
            .finish()
    }
}

impl MatrixInner {
    fn axon_speed(&self) -> f32 {
        f32::from_bits(self.axon_speed.load(Ordering::Relaxed))
    }

    fn component_count(&self) -> usize {
        self.neurons.read().len() + self.synapses.read().len()
    }

    fn spatial_delay_between(&self, pre: NeuronId, post: NeuronId) -> Duration {
        if !self.config.spatial_enabled {
            return Duration::ZERO;
        }
        match self.spatial.distance(pre, post) {
            Some(distance) => {
                let millis = distance / self.axon_speed();
                Duration::from_secs_f32(millis / 1_000.0)
            }
            None => Duration::ZERO,
        }
    }

    fn release(&self, ligand: Ligand, source: NeuronId, concentration: f32) -> Result<()> {
        if !self.config.chemical_enabled {
            return Ok(());
        }
        let position = self
            .spatial
            .position(source)
            .ok_or(RuntimeError::NeuronNotFound { id: source })?;
        let now = self.clock.now();
        self.field
            .release(ligand, source, position, concentration, now)?;

        // Diffusion feeds binding: every receptive neuron samples the
        // field at its own position.
        let neurons: Vec<Arc<NeuronHandle>> = self.neurons.read().values().cloned().collect();
        for neuron in neurons {
            if neuron.id() == source || !neuron.binds(ligand) {
                continue;
            }
            let local = self
                .field
                .concentration(ligand, neuron.position(), now);
            if local < self.config.eviction_epsilon {
                // Below-epsilon contribution: counted, not reported
                self.below_epsilon_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(e) = neuron.bind(ligand, source, local) {
                log::debug!("binding {} on {} failed: {}", ligand, neuron.id(), e);
            }
        }
        Ok(())
    }

    fn delete_synapse(&self, id: SynapseId) -> Result<()> {
        let synapse = self
            .synapses
            .write()
            .remove(&id)
            .ok_or(RuntimeError::SynapseNotFound { id })?;
        let neurons = self.neurons.read();
        if let Some(pre) = neurons.get(&synapse.pre_id()) {
            pre.detach_synapse(id);
        }
        if let Some(post) = neurons.get(&synapse.post_id()) {
            post.detach_synapse(id);
        }
        log::debug!(
            "synapse {} ({} -> {}) deleted",
            id,
            synapse.pre_id(),
            synapse.post_id()
        );
        Ok(())
    }

    fn create_synapse(&self, config: SynapseConfig) -> Result<Arc<dyn Synapse>> {
        config.validate()?;
        if self.component_count() >= self.config.max_components {
            return Err(RuntimeError::capacity_exceeded(
                "components",
                self.config.max_components,
            ));
        }
        let neurons = self.neurons.read();
        let pre = neurons
            .get(&config.pre_id)
            .ok_or(RuntimeError::NeuronNotFound { id: config.pre_id })?
            .clone();
        let post = neurons
            .get(&config.post_id)
            .ok_or(RuntimeError::NeuronNotFound { id: config.post_id })?
            .clone();
        drop(neurons);

        let factories = self.synapse_factories.read();
        let factory = factories.get(&config.synapse_type).ok_or_else(|| {
            RuntimeError::factory_not_found("synapse", config.synapse_type.clone())
        })?;

        let id = SynapseId::new(self.next_synapse.fetch_add(1, Ordering::Relaxed));
        let context = SynapseContext {
            id,
            config,
            delays: Arc::new(MatrixDelayProvider {
                inner: self.self_weak.clone(),
            }),
            scheduler: pre.delivery_scheduler(),
            target: post.input_sender(),
            created: self.clock.now(),
        };
        let synapse = factory(context)?;
        drop(factories);

        pre.attach_outgoing(synapse.clone());
        post.attach_incoming(synapse.clone());
        self.synapses.write().insert(id, synapse.clone());
        log::debug!(
            "synapse {} ({} -> {}) created",
            id,
            synapse.pre_id(),
            synapse.post_id()
        );
        Ok(synapse)
    }
}

impl StructuralContext for MatrixInner {
    fn connect(
        &self,
        pre: NeuronId,
        post: NeuronId,
        weight: f32,
        synapse_type: &str,
    ) -> Result<SynapseId> {
        let mut config = SynapseConfig::new(pre, post, weight);
        config.synapse_type = synapse_type.to_string();
        Ok(self.create_synapse(config)?.id())
    }

    fn delete_synapse(&self, id: SynapseId) -> Result<()> {
        MatrixInner::delete_synapse(self, id)
    }

    fn update_position(&self, id: NeuronId, position: Position) {
        self.spatial.set_position(id, position);
    }
}

/// Axonal-delay provider handed to synapses; weak so synapses never keep
/// the matrix alive
struct MatrixDelayProvider {
    inner: Weak<MatrixInner>,
}

impl fmt::Debug for MatrixDelayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MatrixDelayProvider")
    }
}

impl DelayProvider for MatrixDelayProvider {
    fn spatial_delay(&self, pre: NeuronId, post: NeuronId) -> Duration {
        self.inner
            .upgrade()
            .map(|inner| inner.spatial_delay_between(pre, post))
            .unwrap_or(Duration::ZERO)
    }
}

/// The extracellular matrix: registries, factories, chemistry, geometry
pub struct ExtracellularMatrix {
    inner: Arc<MatrixInner>,
}

impl fmt::Debug for ExtracellularMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtracellularMatrix")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ExtracellularMatrix {
    /// Create a matrix with a validated config and default factories
    pub fn new(config: MatrixConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        let clock = Clock::new();
        let axon_speed = config.axon_speed;
        let release_min_gap = config.release_min_gap;
        let inner = Arc::new_cyclic(|weak| MatrixInner {
            config,
            clock,
            self_weak: weak.clone(),
            neurons: RwLock::new(HashMap::new()),
            synapses: RwLock::new(BTreeMap::new()),
            spatial: SpatialIndex::new(),
            field: ChemicalField::new(release_min_gap),
            neuron_factories: RwLock::new(HashMap::new()),
            synapse_factories: RwLock::new(HashMap::new()),
            axon_speed: AtomicU32::new(axon_speed.to_bits()),
            next_neuron: AtomicU32::new(0),
            next_synapse: AtomicU64::new(0),
            below_epsilon_skips: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
        });
        let matrix = Self { inner };
        matrix.register_default_factories();
        Ok(matrix)
    }

    fn register_default_factories(&self) {
        self.register_neuron_type("lif", |id, config, clock| {
            NeuronHandle::new(id, config, clock)
        });
        self.register_synapse_type("chemical", |context| {
            Ok(Arc::new(ChemicalSynapse::new(
                context.id,
                context.config,
                context.delays,
                context.scheduler,
                context.target,
                context.created,
            )?))
        });
        self.register_synapse_type("excitatory", |mut context| {
            context.config.ligand = Ligand::Glutamate;
            context.config.initial_weight = context.config.initial_weight.abs();
            Ok(Arc::new(ChemicalSynapse::new(
                context.id,
                context.config,
                context.delays,
                context.scheduler,
                context.target,
                context.created,
            )?))
        });
        self.register_synapse_type("inhibitory", |mut context| {
            context.config.ligand = Ligand::Gaba;
            let magnitude = context.config.initial_weight.abs();
            context.config.stdp.min_weight = -context.config.stdp.max_weight.abs();
            context.config.stdp.max_weight = 0.0;
            context.config.initial_weight = -magnitude;
            Ok(Arc::new(ChemicalSynapse::new(
                context.id,
                context.config,
                context.delays,
                context.scheduler,
                context.target,
                context.created,
            )?))
        });
    }

    /// The clock all substrate timestamps are measured against
    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    /// The matrix configuration
    pub fn config(&self) -> &MatrixConfig {
        &self.inner.config
    }

    /// Register a neuron variant constructor under a tag
    pub fn register_neuron_type(
        &self,
        tag: impl Into<String>,
        factory: impl Fn(NeuronId, NeuronConfig, Clock) -> Result<Arc<NeuronHandle>>
            + Send
            + Sync
            + 'static,
    ) {
        self.inner
            .neuron_factories
            .write()
            .insert(tag.into(), Box::new(factory));
    }

    /// Register a synapse variant constructor under a tag
    pub fn register_synapse_type(
        &self,
        tag: impl Into<String>,
        factory: impl Fn(SynapseContext) -> Result<Arc<dyn Synapse>> + Send + Sync + 'static,
    ) {
        self.inner
            .synapse_factories
            .write()
            .insert(tag.into(), Box::new(factory));
    }

    /// Create a neuron through the factory selected by its config
    ///
    /// The matrix sets the neuron's position from `config.position` after
    /// the factory returns; factories need not place the neuron.
    pub fn create_neuron(&self, config: NeuronConfig) -> Result<Arc<NeuronHandle>> {
        config.validate()?;
        if self.inner.component_count() >= self.inner.config.max_components {
            return Err(RuntimeError::capacity_exceeded(
                "components",
                self.inner.config.max_components,
            ));
        }

        let factories = self.inner.neuron_factories.read();
        let factory = factories
            .get(&config.neuron_type)
            .ok_or_else(|| RuntimeError::factory_not_found("neuron", config.neuron_type.clone()))?;
        let id = NeuronId::new(self.inner.next_neuron.fetch_add(1, Ordering::Relaxed));
        let position = config.position;
        let handle = factory(id, config, self.inner.clock)?;
        drop(factories);

        // Integration: wire the matrix-facing callbacks, then take
        // position authority before the neuron is exposed.
        let structural: Arc<dyn StructuralContext> = self.inner.clone();
        handle.set_structural_context(Arc::downgrade(&structural));
        let weak = Arc::downgrade(&self.inner);
        handle.set_chemical_sink(Arc::new(move |source, ligand, concentration| {
            match weak.upgrade() {
                Some(inner) => inner.release(ligand, source, concentration),
                None => Err(RuntimeError::channel_closed("matrix")),
            }
        }));
        handle.set_position(position);

        self.inner.neurons.write().insert(id, handle.clone());
        log::debug!("neuron {} created at {}", id, position);
        Ok(handle)
    }

    /// Look up a neuron handle
    pub fn get_neuron(&self, id: NeuronId) -> Option<Arc<NeuronHandle>> {
        self.inner.neurons.read().get(&id).cloned()
    }

    /// All registered neuron ids
    pub fn neuron_ids(&self) -> Vec<NeuronId> {
        let mut ids: Vec<NeuronId> = self.inner.neurons.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a synapse through the factory selected by its config
    pub fn create_synapse(&self, config: SynapseConfig) -> Result<Arc<dyn Synapse>> {
        self.inner.create_synapse(config)
    }

    /// Create and register a synapse between two neurons
    pub fn connect(
        &self,
        pre: NeuronId,
        post: NeuronId,
        weight: f32,
        synapse_type: &str,
    ) -> Result<SynapseId> {
        let mut config = SynapseConfig::new(pre, post, weight);
        config.synapse_type = synapse_type.to_string();
        Ok(self.create_synapse(config)?.id())
    }

    /// Look up a synapse handle
    pub fn get_synapse(&self, id: SynapseId) -> Option<Arc<dyn Synapse>> {
        self.inner.synapses.read().get(&id).cloned()
    }

    /// Synapse handles matching the criteria, ordered by synapse id
    pub fn list_synapses(&self, criteria: &SynapseCriteria) -> Vec<Arc<dyn Synapse>> {
        self.inner
            .synapses
            .read()
            .values()
            .filter(|s| criteria.matches(s.as_ref()))
            .cloned()
            .collect()
    }

    /// Remove a synapse from the substrate
    pub fn delete_synapse(&self, id: SynapseId) -> Result<()> {
        self.inner.delete_synapse(id)
    }

    /// Stop a neuron and remove it with every synapse touching it
    pub fn remove_neuron(&self, id: NeuronId) -> Result<()> {
        let handle = self
            .inner
            .neurons
            .write()
            .remove(&id)
            .ok_or(RuntimeError::NeuronNotFound { id })?;
        handle.stop();
        self.inner.spatial.remove(id);

        let doomed: Vec<SynapseId> = self
            .list_synapses(&SynapseCriteria::touching(id))
            .iter()
            .map(|s| s.id())
            .collect();
        for synapse_id in doomed {
            let _ = self.inner.delete_synapse(synapse_id);
        }
        log::debug!("neuron {} removed", id);
        Ok(())
    }

    /// Record a chemical release from a registered neuron
    ///
    /// No-op when the chemical field is disabled. Rate-limit violations
    /// return a non-fatal error. Receptive neurons are bound with the
    /// concentration sampled at their own position.
    pub fn release(&self, ligand: Ligand, source: NeuronId, concentration: f32) -> Result<()> {
        self.inner.release(ligand, source, concentration)
    }

    /// Concentration of a ligand at a point
    pub fn concentration(&self, ligand: Ligand, position: Position) -> f32 {
        if !self.inner.config.chemical_enabled {
            return 0.0;
        }
        self.inner
            .field
            .concentration(ligand, position, self.inner.clock.now())
    }

    /// Direct access to the chemical field
    pub fn chemical_field(&self) -> &ChemicalField {
        &self.inner.field
    }

    /// Euclidean distance between two registered neurons (um)
    pub fn distance(&self, a: NeuronId, b: NeuronId) -> Result<f32> {
        self.inner
            .spatial
            .distance(a, b)
            .ok_or(RuntimeError::NeuronNotFound {
                id: if self.inner.spatial.position(a).is_none() { a } else { b },
            })
    }

    /// Total transmission delay: base plus axonal distance over speed
    ///
    /// Falls back to `base` alone when either neuron is unplaced.
    pub fn synaptic_delay(&self, pre: NeuronId, post: NeuronId, base: Duration) -> Duration {
        base + self.inner.spatial_delay_between(pre, post)
    }

    /// Set the axonal conduction speed (um/ms)
    pub fn set_axon_speed(&self, speed: f32) -> Result<()> {
        if speed <= 0.0 || !speed.is_finite() {
            return Err(somata_core::CoreError::invalid_parameter(
                "axon_speed",
                speed.to_string(),
                "> 0.0",
            )
            .into());
        }
        self.inner.axon_speed.store(speed.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Current axonal conduction speed (um/ms)
    pub fn axon_speed(&self) -> f32 {
        self.inner.axon_speed()
    }

    /// Aggregate counters
    pub fn stats(&self) -> MatrixStats {
        MatrixStats {
            neurons: self.inner.neurons.read().len(),
            synapses: self.inner.synapses.read().len(),
            active_emissions: self.inner.field.active_emissions(),
            below_epsilon_skips: self.inner.below_epsilon_skips.load(Ordering::Relaxed),
            running: self.inner.running.load(Ordering::Acquire),
        }
    }

    /// Boot the background update loop
    ///
    /// Errors if already started. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::already_started("matrix"));
        }
        let weak = Arc::downgrade(&self.inner);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(background_loop(weak, shutdown_rx));
        log::info!("matrix started");
        Ok(())
    }

    /// Stop the background loop and every owned neuron; idempotent
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        let _ = self.inner.shutdown_tx.send(true);
        let neurons: Vec<Arc<NeuronHandle>> =
            self.inner.neurons.read().values().cloned().collect();
        for neuron in neurons {
            neuron.stop();
        }
        if was_running {
            log::info!("matrix stopped");
        }
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl Drop for ExtracellularMatrix {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn background_loop(weak: Weak<MatrixInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let (update_interval, scaling) = match weak.upgrade() {
        Some(inner) => (inner.config.update_interval, inner.config.scaling),
        None => return,
    };
    let mut ticker = tokio::time::interval(update_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_scaling: Option<Time> = None;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                let now = inner.clock.now();
                if inner.config.chemical_enabled {
                    inner.field.evict_depleted(now, inner.config.eviction_epsilon);
                }
                if scaling.enabled {
                    let due = last_scaling
                        .map(|t| now.since(t) >= scaling.interval)
                        .unwrap_or(true);
                    if due {
                        last_scaling = Some(now);
                        run_scaling_pass(&inner);
                    }
                }
            }
        }
    }
    log::debug!("matrix background loop stopped");
}

/// One synaptic-scaling pass: nudge each neuron's total incoming drive
/// toward the target while preserving weight ratios
fn run_scaling_pass(inner: &MatrixInner) {
    let scaling = inner.config.scaling;
    let neurons: Vec<Arc<NeuronHandle>> = inner.neurons.read().values().cloned().collect();
    for neuron in neurons {
        let incoming = neuron.incoming_synapses();
        if incoming.is_empty() {
            continue;
        }
        let drive: f32 = incoming.iter().map(|s| s.weight().abs()).sum();
        if drive <= f32::EPSILON {
            continue;
        }
        let factor = (scaling.target_drive / drive).powf(scaling.beta);
        if (factor - 1.0).abs() < 1e-4 {
            continue;
        }
        for synapse in incoming {
            synapse.scale_weight(factor);
        }
        log::trace!(
            "scaled incoming weights of {} by {:.4} (drive {:.4})",
            neuron.id(),
            factor,
            drive
        );
    }
}
