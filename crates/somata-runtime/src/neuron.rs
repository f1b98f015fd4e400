//! Autonomous neuron execution
//!
//! Every neuron owns one executor task, the sole writer of its state.
//! Everything else interacts with a neuron through its bounded input
//! channel, its unbounded control channel, or lock-free telemetry reads.
//! A full input buffer drops the signal and counts it; this is vesicle
//! failure, not an error.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};

use somata_core::{
    Clock, DendriteMode, Ligand, NeuralSignal, NeuronConfig, NeuronId, Position, SynapseId, Time,
};

use crate::dendrite::{self, DendriticIntegrator};
use crate::error::{Result, RuntimeError};
use crate::scheduler::{self, DeliveryScheduler, SchedulerInlet};
use crate::synapse::Synapse;

/// Callback deciding a chemical release from (activity rate, output value)
pub type ReleaseRule = dyn Fn(f32, f32) -> Option<(Ligand, f32)> + Send + Sync;

/// Sink accepting a neuron's chemical release; wired up by the matrix
pub type ChemicalSink = dyn Fn(NeuronId, Ligand, f32) -> Result<()> + Send + Sync;

/// Structural-plasticity operations a neuron reaches through its matrix
pub trait StructuralContext: Send + Sync {
    /// Create and register a synapse between two neurons
    fn connect(
        &self,
        pre: NeuronId,
        post: NeuronId,
        weight: f32,
        synapse_type: &str,
    ) -> Result<SynapseId>;

    /// Remove a synapse from the substrate
    fn delete_synapse(&self, id: SynapseId) -> Result<()>;

    /// Record a neuron's new position in the spatial index
    fn update_position(&self, id: NeuronId, position: Position);
}

fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

const NEVER_FIRED: u64 = u64::MAX;

/// Read-mostly scalars the executor publishes for observers
#[derive(Debug)]
pub struct NeuronTelemetry {
    accumulator: AtomicU32,
    calcium: AtomicU32,
    threshold: AtomicU32,
    activity: AtomicU32,
    last_fire_ns: AtomicU64,
    fires: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    running: AtomicBool,
}

impl NeuronTelemetry {
    fn new(threshold: f32) -> Self {
        let telemetry = Self {
            accumulator: AtomicU32::new(0),
            calcium: AtomicU32::new(0),
            threshold: AtomicU32::new(0),
            activity: AtomicU32::new(0),
            last_fire_ns: AtomicU64::new(NEVER_FIRED),
            fires: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            running: AtomicBool::new(false),
        };
        store_f32(&telemetry.threshold, threshold);
        telemetry
    }
}

/// Point-in-time view of a neuron's published state
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct NeuronSnapshot {
    /// Accumulator value at the last integration tick
    pub accumulator: f32,
    /// Calcium level at the last integration tick
    pub calcium: f32,
    /// Current firing threshold
    pub threshold: f32,
    /// Firing rate over the history window (Hz)
    pub activity_level: f32,
    /// Last fire time, if the neuron has ever fired
    pub last_fire_time: Option<Time>,
    /// Total fires
    pub fires: u64,
    /// Total signals drained from the input channel
    pub received: u64,
    /// Signals dropped because the input buffer was full
    pub dropped_signals: u64,
    /// Whether the executor is running
    pub running: bool,
}

/// State shared between the handle, the executor, and the matrix
struct NeuronShared {
    position: RwLock<Position>,
    outgoing: RwLock<BTreeMap<SynapseId, Arc<dyn Synapse>>>,
    incoming: RwLock<BTreeMap<SynapseId, Arc<dyn Synapse>>>,
    receptors: RwLock<SmallVec<[Ligand; 8]>>,
    release_rule: RwLock<Option<Arc<ReleaseRule>>>,
    chemical_sink: RwLock<Option<Arc<ChemicalSink>>>,
    structural: RwLock<Option<Weak<dyn StructuralContext>>>,
    stdp_gain: AtomicU32,
}

/// Control messages consumed by the executor
enum NeuronCommand {
    SetDendrite(Box<dyn DendriticIntegrator>),
    Chemical { delta: f32 },
    EnableStdp { delay: Duration },
    TriggerStdpFeedback,
}

struct Inlets {
    signal_rx: mpsc::Receiver<NeuralSignal>,
    control_rx: mpsc::UnboundedReceiver<NeuronCommand>,
    scheduler_inlet: SchedulerInlet,
}

/// Handle to an autonomous neuron
///
/// Created by the matrix factory; `start` spawns the executor and the
/// pre-side delivery scheduler. All methods are safe to call from any
/// task.
pub struct NeuronHandle {
    id: NeuronId,
    config: NeuronConfig,
    clock: Clock,
    signal_tx: mpsc::Sender<NeuralSignal>,
    control_tx: mpsc::UnboundedSender<NeuronCommand>,
    inlets: Mutex<Option<Inlets>>,
    telemetry: Arc<NeuronTelemetry>,
    shared: Arc<NeuronShared>,
    scheduler: DeliveryScheduler,
    shutdown_tx: watch::Sender<bool>,
}

impl fmt::Debug for NeuronHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuronHandle")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("threshold", &self.threshold())
            .finish()
    }
}

impl NeuronHandle {
    /// Create a neuron from a validated config
    pub fn new(id: NeuronId, config: NeuronConfig, clock: Clock) -> Result<Arc<Self>> {
        config.validate()?;
        let (signal_tx, signal_rx) = mpsc::channel(config.input_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (scheduler, scheduler_inlet) = DeliveryScheduler::new(clock);
        let (shutdown_tx, _) = watch::channel(false);
        let telemetry = Arc::new(NeuronTelemetry::new(config.threshold));
        let shared = Arc::new(NeuronShared {
            position: RwLock::new(config.position),
            outgoing: RwLock::new(BTreeMap::new()),
            incoming: RwLock::new(BTreeMap::new()),
            receptors: RwLock::new(config.receptors.clone()),
            release_rule: RwLock::new(None),
            chemical_sink: RwLock::new(None),
            structural: RwLock::new(None),
            stdp_gain: AtomicU32::new(1.0f32.to_bits()),
        });
        Ok(Arc::new(Self {
            id,
            config,
            clock,
            signal_tx,
            control_tx,
            inlets: Mutex::new(Some(Inlets {
                signal_rx,
                control_rx,
                scheduler_inlet,
            })),
            telemetry,
            shared,
            scheduler,
            shutdown_tx,
        }))
    }

    /// Neuron ID
    pub fn id(&self) -> NeuronId {
        self.id
    }

    /// The neuron configuration
    pub fn config(&self) -> &NeuronConfig {
        &self.config
    }

    /// The clock this neuron's timestamps are measured against
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Current position
    pub fn position(&self) -> Position {
        *self.shared.position.read()
    }

    /// Move the neuron, updating the spatial index when integrated
    pub fn set_position(&self, position: Position) {
        *self.shared.position.write() = position;
        if let Some(structural) = self.structural() {
            structural.update_position(self.id, position);
        }
    }

    /// Spawn the executor and delivery scheduler
    ///
    /// Errors if the neuron was already started. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inlets = self
            .inlets
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::already_started(format!("neuron {}", self.id)))?;

        self.telemetry.running.store(true, Ordering::Release);
        tokio::spawn(scheduler::run(
            inlets.scheduler_inlet,
            self.clock,
            self.shutdown_tx.subscribe(),
        ));

        let executor = Executor::new(
            self.id,
            self.config.clone(),
            self.clock,
            self.telemetry.clone(),
            self.shared.clone(),
        );
        tokio::spawn(executor.run(
            inlets.signal_rx,
            inlets.control_rx,
            self.shutdown_tx.subscribe(),
        ));
        log::debug!("neuron {} started", self.id);
        Ok(())
    }

    /// Stop the executor and scheduler; idempotent
    pub fn stop(&self) {
        if self.telemetry.running.swap(false, Ordering::AcqRel) {
            log::debug!("neuron {} stopping", self.id);
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the executor is running
    pub fn is_running(&self) -> bool {
        self.telemetry.running.load(Ordering::Acquire)
    }

    /// Enqueue a signal; full buffers drop it and count the drop
    pub fn receive(&self, signal: NeuralSignal) -> Result<()> {
        if !self.is_running() {
            return Err(RuntimeError::not_running(format!("neuron {}", self.id)));
        }
        match self.signal_tx.try_send(signal) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.telemetry.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("neuron {} input buffer full, signal dropped", self.id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RuntimeError::channel_closed(format!("neuron {}", self.id)))
            }
        }
    }

    /// Firing rate over the history window (Hz)
    pub fn activity_level(&self) -> f32 {
        load_f32(&self.telemetry.activity)
    }

    /// Alias for [`activity_level`](Self::activity_level)
    pub fn firing_rate(&self) -> f32 {
        self.activity_level()
    }

    /// Current firing threshold
    pub fn threshold(&self) -> f32 {
        load_f32(&self.telemetry.threshold)
    }

    /// Accumulator value at the last integration tick
    pub fn accumulator(&self) -> f32 {
        load_f32(&self.telemetry.accumulator)
    }

    /// Calcium level at the last integration tick
    pub fn calcium(&self) -> f32 {
        load_f32(&self.telemetry.calcium)
    }

    /// Last fire time, if any
    pub fn last_fire_time(&self) -> Option<Time> {
        match self.telemetry.last_fire_ns.load(Ordering::Relaxed) {
            NEVER_FIRED => None,
            ns => Some(Time::from_nanos(ns)),
        }
    }

    /// Signals dropped on the input buffer
    pub fn dropped_signals(&self) -> u64 {
        self.telemetry.dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time view of the published state
    pub fn snapshot(&self) -> NeuronSnapshot {
        NeuronSnapshot {
            accumulator: self.accumulator(),
            calcium: self.calcium(),
            threshold: self.threshold(),
            activity_level: self.activity_level(),
            last_fire_time: self.last_fire_time(),
            fires: self.telemetry.fires.load(Ordering::Relaxed),
            received: self.telemetry.received.load(Ordering::Relaxed),
            dropped_signals: self.dropped_signals(),
            running: self.is_running(),
        }
    }

    /// Replace the dendritic integration mode
    pub fn set_dendritic_mode(&self, mode: DendriteMode) -> Result<()> {
        mode.validate()?;
        self.set_dendritic_integrator(dendrite::from_mode(mode))
    }

    /// Replace the dendritic integrator with a custom strategy
    pub fn set_dendritic_integrator(
        &self,
        integrator: Box<dyn DendriticIntegrator>,
    ) -> Result<()> {
        self.control_tx
            .send(NeuronCommand::SetDendrite(integrator))
            .map_err(|_| RuntimeError::channel_closed(format!("neuron {}", self.id)))
    }

    /// Replace the bound receptor set
    pub fn set_receptors(&self, receptors: impl IntoIterator<Item = Ligand>) {
        *self.shared.receptors.write() = receptors.into_iter().collect();
    }

    /// Ligands this neuron binds
    pub fn receptors(&self) -> Vec<Ligand> {
        self.shared.receptors.read().to_vec()
    }

    /// Whether the neuron binds the given ligand
    pub fn binds(&self, ligand: Ligand) -> bool {
        self.shared.receptors.read().contains(&ligand)
    }

    /// Chemical binding callback, invoked by the matrix
    ///
    /// Excitatory ligands depolarize, inhibitory ligands hyperpolarize,
    /// modulatory ligands are scaled by the configured modulation gain.
    /// Ligands the neuron has no receptor for are ignored.
    pub fn bind(&self, ligand: Ligand, source: NeuronId, concentration: f32) -> Result<()> {
        if !self.binds(ligand) {
            return Ok(());
        }
        let delta = if ligand.is_modulatory() {
            self.config.modulation_gain * concentration
        } else {
            ligand.polarity() * concentration
        };
        if delta == 0.0 {
            return Ok(());
        }
        log::trace!(
            "neuron {} binding {} from {} (delta {:.4})",
            self.id,
            ligand,
            source,
            delta
        );
        self.control_tx
            .send(NeuronCommand::Chemical { delta })
            .map_err(|_| RuntimeError::channel_closed(format!("neuron {}", self.id)))
    }

    /// Set the callback deciding chemical releases on fire
    pub fn set_release_rule(
        &self,
        rule: impl Fn(f32, f32) -> Option<(Ligand, f32)> + Send + Sync + 'static,
    ) {
        *self.shared.release_rule.write() = Some(Arc::new(rule));
    }

    /// Enable post-fire STDP feedback broadcast
    ///
    /// `learning_rate_gain` scales every incoming synapse's adjustment;
    /// pass 1.0 to use each synapse's own learning rate unchanged.
    pub fn enable_stdp_feedback(&self, delay: Duration, learning_rate_gain: f32) -> Result<()> {
        store_f32(&self.shared.stdp_gain, learning_rate_gain);
        self.control_tx
            .send(NeuronCommand::EnableStdp { delay })
            .map_err(|_| RuntimeError::channel_closed(format!("neuron {}", self.id)))
    }

    /// Broadcast STDP feedback for the most recent fire immediately
    pub fn send_stdp_feedback(&self) -> Result<()> {
        self.control_tx
            .send(NeuronCommand::TriggerStdpFeedback)
            .map_err(|_| RuntimeError::channel_closed(format!("neuron {}", self.id)))
    }

    /// Create a synapse from this neuron to a target via the matrix
    pub fn connect_to(
        &self,
        target: NeuronId,
        weight: f32,
        synapse_type: &str,
    ) -> Result<SynapseId> {
        let structural = self.structural().ok_or_else(|| {
            RuntimeError::invalid_config(format!("neuron {} is not integrated into a matrix", self.id))
        })?;
        structural.connect(self.id, target, weight, synapse_type)
    }

    /// Remove every synapse touching this neuron that is prune-eligible
    ///
    /// Returns the number of synapses removed.
    pub fn prune_dysfunctional_synapses(&self) -> Result<usize> {
        let structural = self.structural().ok_or_else(|| {
            RuntimeError::invalid_config(format!("neuron {} is not integrated into a matrix", self.id))
        })?;
        let now = self.clock.now();
        let mut doomed: Vec<SynapseId> = Vec::new();
        for synapse in self.outgoing_synapses() {
            if synapse.should_prune(now) {
                doomed.push(synapse.id());
            }
        }
        for synapse in self.incoming_synapses() {
            if synapse.should_prune(now) {
                doomed.push(synapse.id());
            }
        }
        doomed.sort_unstable();
        doomed.dedup();
        let mut removed = 0;
        for id in doomed {
            match structural.delete_synapse(id) {
                Ok(()) => removed += 1,
                Err(RuntimeError::SynapseNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            log::debug!("neuron {} pruned {} synapses", self.id, removed);
        }
        Ok(removed)
    }

    /// Outgoing synapse handles, ordered by synapse id
    pub fn outgoing_synapses(&self) -> Vec<Arc<dyn Synapse>> {
        self.shared.outgoing.read().values().cloned().collect()
    }

    /// Incoming synapse handles, ordered by synapse id
    pub fn incoming_synapses(&self) -> Vec<Arc<dyn Synapse>> {
        self.shared.incoming.read().values().cloned().collect()
    }

    /// (outgoing, incoming) connection counts
    pub fn connection_counts(&self) -> (usize, usize) {
        (
            self.shared.outgoing.read().len(),
            self.shared.incoming.read().len(),
        )
    }

    fn structural(&self) -> Option<Arc<dyn StructuralContext>> {
        self.shared.structural.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_structural_context(&self, context: Weak<dyn StructuralContext>) {
        *self.shared.structural.write() = Some(context);
    }

    pub(crate) fn set_chemical_sink(&self, sink: Arc<ChemicalSink>) {
        *self.shared.chemical_sink.write() = Some(sink);
    }

    pub(crate) fn attach_outgoing(&self, synapse: Arc<dyn Synapse>) {
        self.shared.outgoing.write().insert(synapse.id(), synapse);
    }

    pub(crate) fn attach_incoming(&self, synapse: Arc<dyn Synapse>) {
        self.shared.incoming.write().insert(synapse.id(), synapse);
    }

    pub(crate) fn detach_synapse(&self, id: SynapseId) {
        self.shared.outgoing.write().remove(&id);
        self.shared.incoming.write().remove(&id);
    }

    pub(crate) fn delivery_scheduler(&self) -> DeliveryScheduler {
        self.scheduler.clone()
    }

    pub(crate) fn input_sender(&self) -> mpsc::Sender<NeuralSignal> {
        self.signal_tx.clone()
    }
}

impl Drop for NeuronHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Executor-owned neuron state; nothing outside the task touches it
struct Executor {
    id: NeuronId,
    config: NeuronConfig,
    clock: Clock,
    telemetry: Arc<NeuronTelemetry>,
    shared: Arc<NeuronShared>,
    accumulator: f32,
    calcium: f32,
    threshold: f32,
    last_fire: Option<Time>,
    history: VecDeque<Time>,
    dendrite: Box<dyn DendriticIntegrator>,
    pending_feedback: VecDeque<(Time, Time)>,
    stdp_enabled: bool,
    stdp_delay: Duration,
}

impl Executor {
    fn new(
        id: NeuronId,
        config: NeuronConfig,
        clock: Clock,
        telemetry: Arc<NeuronTelemetry>,
        shared: Arc<NeuronShared>,
    ) -> Self {
        let dendrite = dendrite::from_mode(config.dendritic_mode);
        Self {
            id,
            threshold: config.threshold,
            stdp_enabled: config.stdp_enabled,
            stdp_delay: config.stdp_feedback_delay,
            config,
            clock,
            telemetry,
            shared,
            accumulator: 0.0,
            calcium: 0.0,
            last_fire: None,
            history: VecDeque::new(),
            dendrite,
            pending_feedback: VecDeque::new(),
        }
    }

    async fn run(
        mut self,
        mut signal_rx: mpsc::Receiver<NeuralSignal>,
        mut control_rx: mpsc::UnboundedReceiver<NeuronCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // First ticks land one period after start, not immediately
        let start = tokio::time::Instant::now();
        let mut integration = tokio::time::interval_at(
            start + self.config.integration_interval,
            self.config.integration_interval,
        );
        integration.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut homeostasis = tokio::time::interval_at(
            start + self.config.homeostasis_interval,
            self.config.homeostasis_interval,
        );
        homeostasis.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let next_feedback = self.pending_feedback.front().map(|(due, _)| *due);
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => self.on_signal(signal),
                        None => break,
                    }
                }
                command = control_rx.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
                _ = integration.tick() => {
                    self.on_integration_tick();
                }
                _ = homeostasis.tick() => {
                    self.on_homeostasis_tick();
                }
                _ = sleep_until_due(self.clock, next_feedback), if next_feedback.is_some() => {
                    self.broadcast_stdp_feedback();
                }
            }

            if !self.accumulator.is_finite() || !self.calcium.is_finite() {
                // Invariant violation is fatal to this executor only
                log::error!(
                    "neuron {} executor terminating: non-finite state (accumulator {}, calcium {})",
                    self.id,
                    self.accumulator,
                    self.calcium
                );
                break;
            }
        }

        self.telemetry.running.store(false, Ordering::Release);
        log::debug!("neuron {} executor stopped", self.id);
    }

    fn on_signal(&mut self, signal: NeuralSignal) {
        self.telemetry.received.fetch_add(1, Ordering::Relaxed);
        if !signal.success {
            log::trace!("neuron {} ignoring failed signal", self.id);
            return;
        }
        self.dendrite.push(signal.value, self.clock.now());
    }

    fn on_command(&mut self, command: NeuronCommand) {
        match command {
            NeuronCommand::SetDendrite(integrator) => {
                self.dendrite = integrator;
            }
            NeuronCommand::Chemical { delta } => {
                self.accumulator += delta;
            }
            NeuronCommand::EnableStdp { delay } => {
                self.stdp_enabled = true;
                self.stdp_delay = delay;
            }
            NeuronCommand::TriggerStdpFeedback => {
                if let Some(fire_time) = self.last_fire {
                    self.feedback_to_incoming(fire_time);
                }
            }
        }
    }

    fn on_integration_tick(&mut self) {
        let now = self.clock.now();
        let input = self.dendrite.current(now);

        self.calcium = self.calcium * self.config.calcium_decay + input.abs() * 0.01;

        let refractory = self
            .last_fire
            .map(|t| now.since(t) < self.config.refractory_duration)
            .unwrap_or(false);
        if refractory {
            self.accumulator = 0.0;
        } else {
            self.accumulator = self.accumulator * self.config.decay_rate + input;
            if self.accumulator >= self.threshold {
                self.fire(now);
            }
        }
        self.publish(now);
    }

    fn fire(&mut self, now: Time) {
        self.last_fire = Some(now);
        self.accumulator = 0.0;
        self.calcium += 0.5;
        self.history.push_back(now);
        self.trim_history(now);
        self.telemetry.fires.fetch_add(1, Ordering::Relaxed);
        self.telemetry
            .last_fire_ns
            .store(now.nanos(), Ordering::Relaxed);

        let outgoing: Vec<Arc<dyn Synapse>> =
            self.shared.outgoing.read().values().cloned().collect();
        for synapse in outgoing {
            if let Err(e) = synapse.transmit(self.config.fire_factor, now) {
                log::debug!("neuron {} transmit on {} failed: {}", self.id, synapse.id(), e);
            }
        }

        let rate = self.activity_level(now);
        let rule = self.shared.release_rule.read().clone();
        let release = rule.and_then(|rule| rule(rate, self.config.fire_factor));
        if let Some((ligand, concentration)) = release {
            let sink = self.shared.chemical_sink.read().clone();
            if let Some(sink) = sink {
                if let Err(e) = sink(self.id, ligand, concentration) {
                    log::debug!("neuron {} release of {} rejected: {}", self.id, ligand, e);
                }
            }
        }

        if self.stdp_enabled {
            self.pending_feedback.push_back((now + self.stdp_delay, now));
        }
    }

    fn on_homeostasis_tick(&mut self) {
        if self.config.homeostasis_disabled() {
            return;
        }
        let now = self.clock.now();
        let rate = self.activity_level(now);
        let error = rate - self.config.target_firing_rate;
        let adjusted =
            self.threshold + self.config.homeostasis_strength * error * self.threshold;
        self.threshold = adjusted.clamp(self.config.threshold_min, self.config.threshold_max);
        self.publish(now);
        log::trace!(
            "neuron {} homeostasis: rate {:.2}Hz threshold {:.4}",
            self.id,
            rate,
            self.threshold
        );
    }

    fn broadcast_stdp_feedback(&mut self) {
        let now = self.clock.now();
        while let Some((due, fire_time)) = self.pending_feedback.front().copied() {
            if due > now {
                break;
            }
            self.pending_feedback.pop_front();
            self.feedback_to_incoming(fire_time);
        }
    }

    fn feedback_to_incoming(&self, fire_time: Time) {
        let gain = load_f32(&self.shared.stdp_gain);
        let incoming: Vec<Arc<dyn Synapse>> =
            self.shared.incoming.read().values().cloned().collect();
        for synapse in incoming {
            synapse.on_post_spike(fire_time, gain);
        }
    }

    fn trim_history(&mut self, now: Time) {
        let cutoff = self.config.firing_window;
        while let Some(oldest) = self.history.front() {
            if now.since(*oldest) > cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn activity_level(&mut self, now: Time) -> f32 {
        self.trim_history(now);
        self.history.len() as f32 / self.config.firing_window.as_secs_f32()
    }

    fn publish(&mut self, now: Time) {
        store_f32(&self.telemetry.accumulator, self.accumulator);
        store_f32(&self.telemetry.calcium, self.calcium);
        store_f32(&self.telemetry.threshold, self.threshold);
        let activity = self.activity_level(now);
        store_f32(&self.telemetry.activity, activity);
    }
}

async fn sleep_until_due(clock: Clock, deadline: Option<Time>) {
    if let Some(t) = deadline {
        let instant = tokio::time::Instant::from_std(clock.to_instant(t));
        tokio::time::sleep_until(instant).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use somata_core::NeuronConfig;

    fn started(config: NeuronConfig) -> Arc<NeuronHandle> {
        let handle = NeuronHandle::new(NeuronId::new(0), config, Clock::new()).unwrap();
        handle.start().unwrap();
        handle
    }

    fn input(handle: &NeuronHandle, value: f32) -> NeuralSignal {
        NeuralSignal::input(value, handle.id(), handle.clock().now())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    #[tokio::test]
    async fn test_fires_at_threshold() {
        let handle = started(NeuronConfig::new(1.5).unwrap());
        handle.receive(input(&handle, 1.5)).unwrap();
        settle().await;
        let snap = handle.snapshot();
        assert_eq!(snap.fires, 1, "exactly-at-threshold input must fire");
        assert!(snap.last_fire_time.is_some());
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_fire() {
        let handle = started(NeuronConfig::new(1.5).unwrap());
        handle.receive(input(&handle, 1.4)).unwrap();
        settle().await;
        assert_eq!(handle.snapshot().fires, 0);
        handle.stop();
    }

    #[tokio::test]
    async fn test_accumulator_resets_after_fire() {
        let handle = started(NeuronConfig::new(1.0).unwrap());
        handle.receive(input(&handle, 2.0)).unwrap();
        settle().await;
        let snap = handle.snapshot();
        assert_eq!(snap.fires, 1);
        assert!(snap.accumulator.abs() < 0.1);
        assert!(snap.calcium > 0.4, "fire bumps calcium, got {}", snap.calcium);
    }

    #[tokio::test]
    async fn test_refractory_suppresses_second_fire() {
        let config = NeuronConfig::new(1.0)
            .unwrap()
            .with_refractory(Duration::from_millis(100));
        let handle = started(config);
        handle.receive(input(&handle, 2.0)).unwrap();
        settle().await;
        handle.receive(input(&handle, 2.0)).unwrap();
        settle().await;
        assert_eq!(handle.snapshot().fires, 1, "refractory must suppress");
        handle.stop();
    }

    #[tokio::test]
    async fn test_start_twice_errors() {
        let handle = NeuronHandle::new(NeuronId::new(0), NeuronConfig::default(), Clock::new())
            .unwrap();
        handle.start().unwrap();
        assert!(matches!(
            handle.start(),
            Err(RuntimeError::AlreadyStarted { .. })
        ));
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = started(NeuronConfig::default());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_receive_after_stop_errors() {
        let handle = started(NeuronConfig::default());
        handle.stop();
        let result = handle.receive(input(&handle, 1.0));
        assert!(matches!(result, Err(RuntimeError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let mut config = NeuronConfig::default();
        config.input_capacity = 2;
        // Slow ticks so the buffer is not drained between sends
        config.integration_interval = Duration::from_secs(1);
        let handle = started(config);
        for _ in 0..5 {
            handle.receive(input(&handle, 0.1)).unwrap();
        }
        assert_eq!(handle.dropped_signals(), 3);
        handle.stop();
    }

    #[tokio::test]
    async fn test_homeostasis_lowers_threshold() {
        let config = NeuronConfig::new(1.5)
            .unwrap()
            .with_homeostasis(2.0, 0.2);
        let handle = started(config);
        // Sub-threshold drive only; the firing rate stays at zero and the
        // threshold must fall toward threshold_min
        for _ in 0..8 {
            handle.receive(input(&handle, 1.0)).unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        let threshold = handle.threshold();
        assert!(threshold < 1.5, "threshold should fall, got {}", threshold);
        assert!(handle.snapshot().fires > 0, "lowered threshold enables firing");
        handle.stop();
    }

    #[tokio::test]
    async fn test_chemical_binding_folds_into_accumulator() {
        let config = NeuronConfig::new(1.0)
            .unwrap()
            .with_receptors([Ligand::Glutamate]);
        let handle = started(config);
        handle.bind(Ligand::Glutamate, NeuronId::new(9), 2.0).unwrap();
        settle().await;
        assert_eq!(handle.snapshot().fires, 1, "excitatory binding can fire");
        handle.stop();
    }

    #[tokio::test]
    async fn test_binding_without_receptor_is_ignored() {
        let handle = started(NeuronConfig::new(1.0).unwrap());
        handle.bind(Ligand::Glutamate, NeuronId::new(9), 5.0).unwrap();
        settle().await;
        assert_eq!(handle.snapshot().fires, 0);
        handle.stop();
    }

    #[tokio::test]
    async fn test_inhibitory_binding_hyperpolarizes() {
        let config = NeuronConfig::new(1.0)
            .unwrap()
            .with_receptors([Ligand::Gaba]);
        let handle = started(config);
        handle.bind(Ligand::Gaba, NeuronId::new(9), 0.6).unwrap();
        // Let the hyperpolarization fold in before the excitatory input
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.receive(input(&handle, 1.2)).unwrap();
        settle().await;
        assert_eq!(
            handle.snapshot().fires,
            0,
            "inhibition should cancel the supra-threshold input"
        );
        handle.stop();
    }

    #[tokio::test]
    async fn test_connect_without_matrix_errors() {
        let handle = started(NeuronConfig::default());
        let result = handle.connect_to(NeuronId::new(1), 0.5, "chemical");
        assert!(matches!(
            result,
            Err(RuntimeError::InvalidConfiguration { .. })
        ));
        handle.stop();
    }

    #[test]
    fn test_position_roundtrip() {
        let handle = NeuronHandle::new(
            NeuronId::new(0),
            NeuronConfig::default().with_position(Position::new(1.0, 2.0, 3.0)),
            Clock::new(),
        )
        .unwrap();
        assert_eq!(handle.position(), Position::new(1.0, 2.0, 3.0));
        handle.set_position(Position::new(4.0, 5.0, 6.0));
        assert_eq!(handle.position(), Position::new(4.0, 5.0, 6.0));
    }
}
