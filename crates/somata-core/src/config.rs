//! Validated configuration for substrate components
//!
//! Every component is constructed from a config struct following the same
//! discipline: `Default` gives biologically reasonable values, `new`
//! validates the parameters callers most often get wrong, `validate`
//! re-checks the full struct, and `with_*` builders adjust single fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::ids::NeuronId;
use crate::ligand::Ligand;
use crate::space::Position;

/// Conduction speed archetypes (um/ms)
pub mod axon_speed {
    /// Local cortical axons (~2 mm/ms)
    pub const CORTICAL_LOCAL: f32 = 2_000.0;
    /// Long-range myelinated projections (~15 mm/ms)
    pub const LONG_RANGE: f32 = 15_000.0;
    /// Unmyelinated slow fibers (~0.5 mm/ms)
    pub const UNMYELINATED: f32 = 500.0;
    /// Fast myelinated fibers (~80 mm/ms)
    pub const FAST_MYELINATED: f32 = 80_000.0;
}

/// Dendritic integration strategy selected per neuron
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DendriteMode {
    /// Exponential traces summed over a sliding window
    TemporalSummation {
        /// Membrane time constant; valid range 10-50 ms
        tau_m: Duration,
    },
    /// Plain summation cleared on every integration tick
    Passive,
}

impl Default for DendriteMode {
    fn default() -> Self {
        Self::TemporalSummation {
            tau_m: Duration::from_millis(20),
        }
    }
}

impl DendriteMode {
    /// Validate mode parameters
    pub fn validate(&self) -> Result<()> {
        if let DendriteMode::TemporalSummation { tau_m } = self {
            let ms = tau_m.as_secs_f32() * 1_000.0;
            if !(10.0..=50.0).contains(&ms) {
                return Err(CoreError::invalid_parameter(
                    "tau_m",
                    format!("{}ms", ms),
                    "10ms <= tau_m <= 50ms",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for a neuron
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronConfig {
    /// Firing threshold for the accumulator
    pub threshold: f32,
    /// Lower clamp for homeostatic threshold adjustment
    pub threshold_min: f32,
    /// Upper clamp for homeostatic threshold adjustment
    pub threshold_max: f32,
    /// Accumulator retention per integration tick, in (0, 1]
    pub decay_rate: f32,
    /// Calcium retention per integration tick, in (0, 1]
    pub calcium_decay: f32,
    /// Suppression interval after a fire
    pub refractory_duration: Duration,
    /// Output magnitude transmitted on fire
    pub fire_factor: f32,
    /// Homeostatic target firing rate in Hz; 0 disables
    pub target_firing_rate: f32,
    /// Homeostatic adjustment strength; 0 disables
    pub homeostasis_strength: f32,
    /// Interval between integration ticks
    pub integration_interval: Duration,
    /// Interval between homeostatic updates
    pub homeostasis_interval: Duration,
    /// Window over which the firing history is kept
    pub firing_window: Duration,
    /// Input channel capacity; overflow drops signals
    pub input_capacity: usize,
    /// Ligands this neuron binds
    pub receptors: SmallVec<[Ligand; 8]>,
    /// Gain applied to modulatory ligand binding
    pub modulation_gain: f32,
    /// Initial position, applied by the matrix on creation
    pub position: Position,
    /// Dendritic integration strategy
    pub dendritic_mode: DendriteMode,
    /// Whether the neuron broadcasts STDP feedback after firing
    pub stdp_enabled: bool,
    /// Delay between a fire and its STDP feedback broadcast
    pub stdp_feedback_delay: Duration,
    /// Factory tag selecting the neuron variant
    pub neuron_type: String,
}

impl Default for NeuronConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            threshold_min: 0.1,
            threshold_max: 10.0,
            decay_rate: 0.95,
            calcium_decay: 0.95,
            refractory_duration: Duration::from_millis(5),
            fire_factor: 1.0,
            target_firing_rate: 0.0,
            homeostasis_strength: 0.0,
            integration_interval: Duration::from_micros(500),
            homeostasis_interval: Duration::from_millis(100),
            firing_window: Duration::from_secs(10),
            input_capacity: 256,
            receptors: SmallVec::new(),
            modulation_gain: 0.1,
            position: Position::ORIGIN,
            dendritic_mode: DendriteMode::default(),
            stdp_enabled: false,
            stdp_feedback_delay: Duration::from_millis(1),
            neuron_type: "lif".to_string(),
        }
    }
}

impl NeuronConfig {
    /// Create a config with the given threshold, validating it
    pub fn new(threshold: f32) -> Result<Self> {
        let config = Self {
            threshold,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the firing threshold
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the accumulator decay rate
    pub fn with_decay_rate(mut self, decay_rate: f32) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    /// Set the refractory duration
    pub fn with_refractory(mut self, refractory: Duration) -> Self {
        self.refractory_duration = refractory;
        self
    }

    /// Set the fire factor
    pub fn with_fire_factor(mut self, fire_factor: f32) -> Self {
        self.fire_factor = fire_factor;
        self
    }

    /// Enable homeostasis with a target rate (Hz) and strength
    pub fn with_homeostasis(mut self, target_rate: f32, strength: f32) -> Self {
        self.target_firing_rate = target_rate;
        self.homeostasis_strength = strength;
        self
    }

    /// Set the initial position
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// Set the dendritic integration mode
    pub fn with_dendritic_mode(mut self, mode: DendriteMode) -> Self {
        self.dendritic_mode = mode;
        self
    }

    /// Set the bound receptor ligands
    pub fn with_receptors(mut self, receptors: impl IntoIterator<Item = Ligand>) -> Self {
        self.receptors = receptors.into_iter().collect();
        self
    }

    /// Enable STDP feedback broadcast with the given delay
    pub fn with_stdp_feedback(mut self, delay: Duration) -> Self {
        self.stdp_enabled = true;
        self.stdp_feedback_delay = delay;
        self
    }

    /// Whether homeostatic adjustment is disabled
    pub fn homeostasis_disabled(&self) -> bool {
        self.target_firing_rate == 0.0 && self.homeostasis_strength == 0.0
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.threshold <= 0.0 || !self.threshold.is_finite() {
            return Err(CoreError::invalid_parameter(
                "threshold",
                self.threshold.to_string(),
                "> 0.0",
            ));
        }
        if self.threshold_min <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "threshold_min",
                self.threshold_min.to_string(),
                "> 0.0",
            ));
        }
        if self.threshold_max < self.threshold_min {
            return Err(CoreError::invalid_parameter(
                "threshold_max",
                format!("{} (with threshold_min={})", self.threshold_max, self.threshold_min),
                ">= threshold_min",
            ));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) || self.decay_rate == 0.0 {
            return Err(CoreError::invalid_parameter(
                "decay_rate",
                self.decay_rate.to_string(),
                "0.0 < d <= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.calcium_decay) || self.calcium_decay == 0.0 {
            return Err(CoreError::invalid_parameter(
                "calcium_decay",
                self.calcium_decay.to_string(),
                "0.0 < d <= 1.0",
            ));
        }
        if self.target_firing_rate < 0.0 {
            return Err(CoreError::invalid_parameter(
                "target_firing_rate",
                self.target_firing_rate.to_string(),
                ">= 0.0",
            ));
        }
        if self.homeostasis_strength < 0.0 {
            return Err(CoreError::invalid_parameter(
                "homeostasis_strength",
                self.homeostasis_strength.to_string(),
                ">= 0.0",
            ));
        }
        if self.integration_interval.is_zero() {
            return Err(CoreError::invalid_parameter(
                "integration_interval",
                "0",
                "> 0",
            ));
        }
        if self.input_capacity == 0 {
            return Err(CoreError::invalid_parameter("input_capacity", "0", "> 0"));
        }
        if !self.position.is_finite() {
            return Err(CoreError::invalid_parameter(
                "position",
                format!("{}", self.position),
                "finite coordinates",
            ));
        }
        self.dendritic_mode.validate()?;
        Ok(())
    }
}

/// STDP learning configuration for a synapse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StdpConfig {
    /// Whether plasticity adjustments are applied
    pub enabled: bool,
    /// Learning rate eta
    pub learning_rate: f32,
    /// Exponential time constant tau
    pub time_constant: Duration,
    /// Maximum |delta t| considered for adjustment
    pub window: Duration,
    /// Lower weight bound
    pub min_weight: f32,
    /// Upper weight bound
    pub max_weight: f32,
    /// LTD/LTP asymmetry ratio alpha, >= 1
    pub asymmetry_ratio: f32,
}

impl Default for StdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_rate: 0.01,
            time_constant: Duration::from_millis(20),
            window: Duration::from_millis(100),
            min_weight: 0.0,
            max_weight: 1.0,
            asymmetry_ratio: 1.2,
        }
    }
}

impl StdpConfig {
    /// Create a validated STDP config
    pub fn new(learning_rate: f32, time_constant: Duration, window: Duration) -> Result<Self> {
        let config = Self {
            learning_rate,
            time_constant,
            window,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the weight bounds
    pub fn with_bounds(mut self, min_weight: f32, max_weight: f32) -> Self {
        self.min_weight = min_weight;
        self.max_weight = max_weight;
        self
    }

    /// Set the asymmetry ratio
    pub fn with_asymmetry(mut self, ratio: f32) -> Self {
        self.asymmetry_ratio = ratio;
        self
    }

    /// Disable plasticity
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "learning_rate",
                self.learning_rate.to_string(),
                "> 0.0",
            ));
        }
        if self.time_constant.is_zero() {
            return Err(CoreError::invalid_parameter("time_constant", "0", "> 0"));
        }
        if self.window.is_zero() {
            return Err(CoreError::invalid_parameter("window", "0", "> 0"));
        }
        if self.max_weight <= self.min_weight {
            return Err(CoreError::invalid_parameter(
                "max_weight",
                format!("{} (with min_weight={})", self.max_weight, self.min_weight),
                "> min_weight",
            ));
        }
        if self.asymmetry_ratio < 1.0 {
            return Err(CoreError::invalid_parameter(
                "asymmetry_ratio",
                self.asymmetry_ratio.to_string(),
                ">= 1.0",
            ));
        }
        Ok(())
    }
}

/// Activity-based pruning configuration for a synapse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Whether this synapse may be pruned
    pub enabled: bool,
    /// Weight below which the synapse is a pruning candidate
    pub weight_threshold: f32,
    /// Inactivity beyond which the candidate becomes eligible
    pub inactivity_threshold: Duration,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight_threshold: 0.1,
            inactivity_threshold: Duration::from_secs(5),
        }
    }
}

impl PruningConfig {
    /// Create an enabled pruning config
    pub fn new(weight_threshold: f32, inactivity_threshold: Duration) -> Self {
        Self {
            enabled: true,
            weight_threshold,
            inactivity_threshold,
        }
    }
}

/// Configuration for a synapse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseConfig {
    /// Pre-synaptic neuron
    pub pre_id: NeuronId,
    /// Post-synaptic neuron
    pub post_id: NeuronId,
    /// Initial weight
    pub initial_weight: f32,
    /// Delay contributed by the synapse regardless of distance
    pub base_delay: Duration,
    /// Transmitter carried by this synapse
    pub ligand: Ligand,
    /// STDP configuration
    pub stdp: StdpConfig,
    /// Pruning configuration
    pub pruning: PruningConfig,
    /// Spike timestamps kept per side for plasticity
    pub max_spikes_kept: usize,
    /// Uniform transmission noise amplitude; 0 disables
    pub noise_amplitude: f32,
    /// Factory tag selecting the synapse variant
    pub synapse_type: String,
}

impl SynapseConfig {
    /// Create a config connecting two neurons with the given weight
    pub fn new(pre_id: NeuronId, post_id: NeuronId, initial_weight: f32) -> Self {
        Self {
            pre_id,
            post_id,
            initial_weight,
            base_delay: Duration::from_millis(1),
            ligand: Ligand::Glutamate,
            stdp: StdpConfig::default(),
            pruning: PruningConfig::default(),
            max_spikes_kept: 64,
            noise_amplitude: 0.0,
            synapse_type: "chemical".to_string(),
        }
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the STDP configuration
    pub fn with_stdp(mut self, stdp: StdpConfig) -> Self {
        self.stdp = stdp;
        self
    }

    /// Set the pruning configuration
    pub fn with_pruning(mut self, pruning: PruningConfig) -> Self {
        self.pruning = pruning;
        self
    }

    /// Set the transmitter species
    pub fn with_ligand(mut self, ligand: Ligand) -> Self {
        self.ligand = ligand;
        self
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if !self.pre_id.is_valid() || !self.post_id.is_valid() {
            return Err(CoreError::invalid_parameter(
                "pre_id/post_id",
                format!("{}/{}", self.pre_id, self.post_id),
                "valid neuron ids",
            ));
        }
        if !self.initial_weight.is_finite() {
            return Err(CoreError::invalid_parameter(
                "initial_weight",
                self.initial_weight.to_string(),
                "finite",
            ));
        }
        if self.max_spikes_kept == 0 {
            return Err(CoreError::invalid_parameter("max_spikes_kept", "0", "> 0"));
        }
        if self.noise_amplitude < 0.0 {
            return Err(CoreError::invalid_parameter(
                "noise_amplitude",
                self.noise_amplitude.to_string(),
                ">= 0.0",
            ));
        }
        self.stdp.validate()?;
        Ok(())
    }
}

/// Slow synaptic scaling configuration, driven by the matrix loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Whether scaling runs
    pub enabled: bool,
    /// Interval between scaling passes
    pub interval: Duration,
    /// Target total incoming drive per neuron (sum of |w|)
    pub target_drive: f32,
    /// Convergence exponent beta, in (0, 1]
    pub beta: f32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            target_drive: 1.0,
            beta: 0.1,
        }
    }
}

impl ScalingConfig {
    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.target_drive <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "target_drive",
                self.target_drive.to_string(),
                "> 0.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.beta) || self.beta == 0.0 {
            return Err(CoreError::invalid_parameter(
                "beta",
                self.beta.to_string(),
                "0.0 < beta <= 1.0",
            ));
        }
        Ok(())
    }
}

/// Configuration for the extracellular matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Whether the chemical field is active
    pub chemical_enabled: bool,
    /// Whether spatial delays are applied
    pub spatial_enabled: bool,
    /// Background update loop interval
    pub update_interval: Duration,
    /// Maximum registered components
    pub max_components: usize,
    /// Axonal conduction speed (um/ms)
    pub axon_speed: f32,
    /// Minimum gap between releases per (source, ligand)
    pub release_min_gap: Duration,
    /// Concentration below which emissions are evicted
    pub eviction_epsilon: f32,
    /// Synaptic scaling configuration
    pub scaling: ScalingConfig,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            chemical_enabled: true,
            spatial_enabled: true,
            update_interval: Duration::from_millis(10),
            max_components: 100_000,
            axon_speed: axon_speed::CORTICAL_LOCAL,
            release_min_gap: Duration::from_millis(3),
            eviction_epsilon: 1e-4,
            scaling: ScalingConfig::default(),
        }
    }
}

impl MatrixConfig {
    /// Set the axonal conduction speed
    pub fn with_axon_speed(mut self, speed: f32) -> Self {
        self.axon_speed = speed;
        self
    }

    /// Set the component capacity
    pub fn with_max_components(mut self, max: usize) -> Self {
        self.max_components = max;
        self
    }

    /// Enable synaptic scaling
    pub fn with_scaling(mut self, scaling: ScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.axon_speed <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "axon_speed",
                self.axon_speed.to_string(),
                "> 0.0",
            ));
        }
        if self.update_interval.is_zero() {
            return Err(CoreError::invalid_parameter("update_interval", "0", "> 0"));
        }
        if self.max_components == 0 {
            return Err(CoreError::invalid_parameter("max_components", "0", "> 0"));
        }
        if self.eviction_epsilon <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "eviction_epsilon",
                self.eviction_epsilon.to_string(),
                "> 0.0",
            ));
        }
        self.scaling.validate()?;
        Ok(())
    }
}

/// Configuration for the glial monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Accumulator/threshold ratio counted as activity
    pub activity_threshold: f32,
    /// Polling interval for tracked state
    pub state_update_interval: Duration,
    /// Territorial capacity: maximum monitored neurons
    pub max_monitored: usize,
    /// Default timeout for completion waits
    pub processing_timeout: Duration,
    /// Default timeout for quiescence waits
    pub quiescence_timeout: Duration,
    /// Minimum processing time before a message can complete
    pub min_processing_time: Duration,
    /// Settling timeout for weak signals
    pub weak_signal_timeout: Duration,
    /// Hard cap after which any message is forced complete
    pub max_processing_time: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            activity_threshold: 0.1,
            state_update_interval: Duration::from_millis(2),
            max_monitored: 1_000,
            processing_timeout: Duration::from_millis(500),
            quiescence_timeout: Duration::from_secs(1),
            min_processing_time: Duration::from_millis(5),
            weak_signal_timeout: Duration::from_millis(50),
            max_processing_time: Duration::from_millis(200),
        }
    }
}

impl MonitorConfig {
    /// Set the territorial capacity
    pub fn with_max_monitored(mut self, max: usize) -> Self {
        self.max_monitored = max;
        self
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.activity_threshold <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "activity_threshold",
                self.activity_threshold.to_string(),
                "> 0.0",
            ));
        }
        if self.max_monitored == 0 {
            return Err(CoreError::invalid_parameter("max_monitored", "0", "> 0"));
        }
        if self.min_processing_time < Duration::from_millis(5) {
            return Err(CoreError::invalid_parameter(
                "min_processing_time",
                format!("{:?}", self.min_processing_time),
                ">= 5ms",
            ));
        }
        if self.max_processing_time <= self.min_processing_time {
            return Err(CoreError::invalid_parameter(
                "max_processing_time",
                format!("{:?}", self.max_processing_time),
                "> min_processing_time",
            ));
        }
        Ok(())
    }
}
