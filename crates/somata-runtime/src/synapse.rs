//! Synaptic transmission and spike-timing-dependent plasticity
//!
//! A synapse is shared between three parties: the pre-neuron's executor
//! (transmit path), the post-neuron's executor (STDP feedback path), and
//! the matrix (pruning and scaling). Its mutable core sits behind a short
//! mutex; handles are `Arc<dyn Synapse>` and never own the endpoints.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use somata_core::{Ligand, NeuralSignal, NeuronId, SynapseConfig, SynapseId, Time};

use crate::error::Result;
use crate::scheduler::DeliveryScheduler;

/// Provider of the axonal-distance delay between two neurons
///
/// Implemented by the matrix; synapses consult it on every transmission so
/// that position changes take effect immediately.
pub trait DelayProvider: Send + Sync + fmt::Debug {
    /// Spatial delay from `pre` to `post`; zero when either is unplaced
    fn spatial_delay(&self, pre: NeuronId, post: NeuronId) -> Duration;
}

/// Delay provider that reports no spatial separation
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroDelay;

impl DelayProvider for ZeroDelay {
    fn spatial_delay(&self, _pre: NeuronId, _post: NeuronId) -> Duration {
        Duration::ZERO
    }
}

/// Read-only view of a synapse's state, for debugging and stats
#[derive(Debug, Clone, serde::Serialize)]
pub struct SynapseSnapshot {
    /// Synapse ID
    pub id: SynapseId,
    /// Pre-synaptic neuron
    pub pre_id: NeuronId,
    /// Post-synaptic neuron
    pub post_id: NeuronId,
    /// Current weight
    pub weight: f32,
    /// Transmitter species
    pub ligand: Ligand,
    /// Last transmission time
    pub last_activity: Time,
    /// Last plasticity adjustment time
    pub last_plasticity: Time,
    /// Total transmissions
    pub transmissions: u64,
    /// Plasticity adjustments that fell outside the STDP window
    pub missed_plasticity_windows: u64,
    /// Recorded pre-side spikes
    pub pre_spikes: usize,
    /// Recorded post-side spikes
    pub post_spikes: usize,
}

/// Contract every synapse variant satisfies
pub trait Synapse: Send + Sync + fmt::Debug {
    /// Synapse ID
    fn id(&self) -> SynapseId;

    /// Pre-synaptic neuron
    fn pre_id(&self) -> NeuronId;

    /// Post-synaptic neuron
    fn post_id(&self) -> NeuronId;

    /// Transmitter species carried by this synapse
    fn ligand(&self) -> Ligand;

    /// Factory tag this synapse was created under
    fn synapse_type(&self) -> &str;

    /// Current weight
    fn weight(&self) -> f32;

    /// Set the weight, clamped to the configured bounds
    fn set_weight(&self, weight: f32);

    /// Multiply the weight by a factor, clamped to the configured bounds
    fn scale_weight(&self, factor: f32);

    /// Delay contributed by the synapse regardless of distance
    fn base_delay(&self) -> Duration;

    /// Transmit a value from the pre-neuron at time `now`
    fn transmit(&self, value: f32, now: Time) -> Result<()>;

    /// Apply an STDP adjustment for the given timing difference
    ///
    /// `delta_t_ms` is `t_pre - t_post` in milliseconds: negative values
    /// (pre before post) potentiate, positive values depress. Returns the
    /// weight after the adjustment.
    fn apply_plasticity(&self, delta_t_ms: f32, now: Time) -> f32;

    /// Post-fire feedback: record the post spike and apply STDP against
    /// the most recent pre spike that precedes it
    ///
    /// `gain` scales the adjustment; the post-neuron passes its own STDP
    /// learning-rate gain (1.0 when unconfigured).
    fn on_post_spike(&self, t_post: Time, gain: f32);

    /// Record a pre-side spike time
    fn record_pre_spike(&self, t: Time);

    /// Record a post-side spike time
    fn record_post_spike(&self, t: Time);

    /// Recorded pre-side spike times, oldest first
    fn pre_spike_times(&self) -> Vec<Time>;

    /// Recorded post-side spike times, oldest first
    fn post_spike_times(&self) -> Vec<Time>;

    /// Time of the last transmission
    fn last_activity(&self) -> Time;

    /// Whether the synapse transmitted within the given window
    fn is_active(&self, window: Duration, now: Time) -> bool;

    /// Whether the synapse is eligible for pruning at time `now`
    fn should_prune(&self, now: Time) -> bool;

    /// Read-only state view
    fn snapshot(&self) -> SynapseSnapshot;
}

/// Mutable core guarded by the synapse mutex
#[derive(Debug)]
struct SynapseState {
    weight: f32,
    pre_spikes: VecDeque<Time>,
    post_spikes: VecDeque<Time>,
    last_activity: Time,
    last_plasticity: Time,
    transmissions: u64,
    missed_windows: u64,
}

/// Default synapse: weighted, delayed chemical transmission with STDP
pub struct ChemicalSynapse {
    id: SynapseId,
    config: SynapseConfig,
    state: Mutex<SynapseState>,
    delays: std::sync::Arc<dyn DelayProvider>,
    scheduler: DeliveryScheduler,
    target: mpsc::Sender<NeuralSignal>,
}

impl fmt::Debug for ChemicalSynapse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChemicalSynapse")
            .field("id", &self.id)
            .field("pre", &self.config.pre_id)
            .field("post", &self.config.post_id)
            .field("weight", &self.weight())
            .finish()
    }
}

impl ChemicalSynapse {
    /// Create a synapse with a validated config
    ///
    /// `target` is the post-neuron's input channel; `scheduler` is the
    /// pre-neuron's delivery scheduler. `created` stamps the initial
    /// activity time so a fresh synapse is not immediately prunable.
    pub fn new(
        id: SynapseId,
        config: SynapseConfig,
        delays: std::sync::Arc<dyn DelayProvider>,
        scheduler: DeliveryScheduler,
        target: mpsc::Sender<NeuralSignal>,
        created: Time,
    ) -> Result<Self> {
        config.validate()?;
        let weight = config
            .initial_weight
            .clamp(config.stdp.min_weight, config.stdp.max_weight);
        Ok(Self {
            id,
            state: Mutex::new(SynapseState {
                weight,
                pre_spikes: VecDeque::with_capacity(config.max_spikes_kept),
                post_spikes: VecDeque::with_capacity(config.max_spikes_kept),
                last_activity: created,
                last_plasticity: created,
                transmissions: 0,
                missed_windows: 0,
            }),
            config,
            delays,
            scheduler,
            target,
        })
    }

    /// The synapse configuration
    pub fn config(&self) -> &SynapseConfig {
        &self.config
    }

    fn clamp_weight(&self, weight: f32) -> f32 {
        weight.clamp(self.config.stdp.min_weight, self.config.stdp.max_weight)
    }

    fn push_bounded(ring: &mut VecDeque<Time>, t: Time, cap: usize) {
        if ring.len() == cap {
            ring.pop_front();
        }
        ring.push_back(t);
    }

    /// Compute the STDP weight delta for a timing difference, without
    /// applying it
    fn stdp_delta(&self, delta_t_ms: f32) -> f32 {
        let stdp = &self.config.stdp;
        let window_ms = stdp.window.as_secs_f32() * 1_000.0;
        let tau_ms = stdp.time_constant.as_secs_f32() * 1_000.0;
        if delta_t_ms.abs() > window_ms || delta_t_ms == 0.0 {
            return 0.0;
        }
        if delta_t_ms < 0.0 {
            // Pre before post: potentiate
            stdp.learning_rate * (delta_t_ms / tau_ms).exp()
        } else {
            // Post before pre: depress
            -stdp.learning_rate * stdp.asymmetry_ratio * (-delta_t_ms / tau_ms).exp()
        }
    }
}

impl Synapse for ChemicalSynapse {
    fn id(&self) -> SynapseId {
        self.id
    }

    fn pre_id(&self) -> NeuronId {
        self.config.pre_id
    }

    fn post_id(&self) -> NeuronId {
        self.config.post_id
    }

    fn ligand(&self) -> Ligand {
        self.config.ligand
    }

    fn synapse_type(&self) -> &str {
        &self.config.synapse_type
    }

    fn weight(&self) -> f32 {
        self.state.lock().weight
    }

    fn set_weight(&self, weight: f32) {
        self.state.lock().weight = self.clamp_weight(weight);
    }

    fn scale_weight(&self, factor: f32) {
        let mut state = self.state.lock();
        state.weight = self.clamp_weight(state.weight * factor);
    }

    fn base_delay(&self) -> Duration {
        self.config.base_delay
    }

    fn transmit(&self, value: f32, now: Time) -> Result<()> {
        let (weighted, noise) = {
            let mut state = self.state.lock();
            let noise = if self.config.noise_amplitude > 0.0 {
                (rand::thread_rng().gen::<f32>() - 0.5) * 2.0 * self.config.noise_amplitude
            } else {
                0.0
            };
            let weighted = value * state.weight + noise;
            Self::push_bounded(&mut state.pre_spikes, now, self.config.max_spikes_kept);
            state.last_activity = now;
            state.transmissions += 1;
            (weighted, noise)
        };

        let spatial = self
            .delays
            .spatial_delay(self.config.pre_id, self.config.post_id);
        let signal = NeuralSignal::input(value, self.config.post_id, now)
            .with_weighted_value(weighted)
            .with_source(self.config.pre_id)
            .with_synapse(self.id)
            .with_ligand(self.config.ligand)
            .with_delays(self.config.base_delay, spatial)
            .with_noise(noise);

        self.scheduler.schedule(signal, self.target.clone())
    }

    fn apply_plasticity(&self, delta_t_ms: f32, now: Time) -> f32 {
        if !self.config.stdp.enabled {
            return self.weight();
        }
        let delta = self.stdp_delta(delta_t_ms);
        let mut state = self.state.lock();
        if delta != 0.0 {
            state.weight = self.clamp_weight(state.weight + delta);
            state.last_plasticity = now;
        } else {
            // Outside the STDP window: counted, not reported
            state.missed_windows += 1;
        }
        state.weight
    }

    fn on_post_spike(&self, t_post: Time, gain: f32) {
        let delta_t_ms = {
            let mut state = self.state.lock();
            Self::push_bounded(&mut state.post_spikes, t_post, self.config.max_spikes_kept);
            // Only pre spikes that arrived before the post fire participate
            state
                .pre_spikes
                .iter()
                .rev()
                .find(|t| **t <= t_post)
                .map(|t| t.signed_diff_millis(t_post))
        };

        if !self.config.stdp.enabled {
            return;
        }
        if let Some(delta_t_ms) = delta_t_ms {
            let delta = self.stdp_delta(delta_t_ms) * gain;
            let mut state = self.state.lock();
            if delta != 0.0 {
                state.weight = self.clamp_weight(state.weight + delta);
                state.last_plasticity = t_post;
            } else {
                state.missed_windows += 1;
            }
        }
    }

    fn record_pre_spike(&self, t: Time) {
        let mut state = self.state.lock();
        Self::push_bounded(&mut state.pre_spikes, t, self.config.max_spikes_kept);
    }

    fn record_post_spike(&self, t: Time) {
        let mut state = self.state.lock();
        Self::push_bounded(&mut state.post_spikes, t, self.config.max_spikes_kept);
    }

    fn pre_spike_times(&self) -> Vec<Time> {
        self.state.lock().pre_spikes.iter().copied().collect()
    }

    fn post_spike_times(&self) -> Vec<Time> {
        self.state.lock().post_spikes.iter().copied().collect()
    }

    fn last_activity(&self) -> Time {
        self.state.lock().last_activity
    }

    fn is_active(&self, window: Duration, now: Time) -> bool {
        now.since(self.last_activity()) <= window
    }

    fn should_prune(&self, now: Time) -> bool {
        let pruning = &self.config.pruning;
        if !pruning.enabled {
            return false;
        }
        let state = self.state.lock();
        state.weight < pruning.weight_threshold
            && now.since(state.last_activity) > pruning.inactivity_threshold
    }

    fn snapshot(&self) -> SynapseSnapshot {
        let state = self.state.lock();
        SynapseSnapshot {
            id: self.id,
            pre_id: self.config.pre_id,
            post_id: self.config.post_id,
            weight: state.weight,
            ligand: self.config.ligand,
            last_activity: state.last_activity,
            last_plasticity: state.last_plasticity,
            transmissions: state.transmissions,
            missed_plasticity_windows: state.missed_windows,
            pre_spikes: state.pre_spikes.len(),
            post_spikes: state.post_spikes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use somata_core::{Clock, PruningConfig, StdpConfig};
    use std::sync::Arc;

    fn test_synapse(
        config: SynapseConfig,
    ) -> (ChemicalSynapse, crate::scheduler::SchedulerInlet) {
        let clock = Clock::new();
        let (scheduler, inlet) = DeliveryScheduler::new(clock);
        let (tx, rx) = mpsc::channel(16);
        // The receiver is leaked so undelivered test signals don't error
        std::mem::forget(rx);
        let synapse = ChemicalSynapse::new(
            SynapseId::new(1),
            config,
            Arc::new(ZeroDelay),
            scheduler,
            tx,
            Time::ZERO,
        )
        .unwrap();
        (synapse, inlet)
    }

    fn scenario_config() -> SynapseConfig {
        // weight 0.5, eta 0.1, tau 20ms, alpha 1.05, window 100ms
        SynapseConfig::new(NeuronId::new(0), NeuronId::new(1), 0.5).with_stdp(StdpConfig {
            enabled: true,
            learning_rate: 0.1,
            time_constant: Duration::from_millis(20),
            window: Duration::from_millis(100),
            min_weight: 0.0,
            max_weight: 1.0,
            asymmetry_ratio: 1.05,
        })
    }

    #[test]
    fn test_ltp_increases_weight() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        let w = synapse.apply_plasticity(-15.0, Time::from_millis(50));
        let expected = 0.5 + 0.1 * (-15.0f32 / 20.0).exp();
        assert!((w - expected).abs() < 1e-5, "got {}", w);
        assert!(w > 0.5);
    }

    #[test]
    fn test_ltd_decreases_weight() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        let w = synapse.apply_plasticity(15.0, Time::from_millis(50));
        let expected = 0.5 - 0.1 * 1.05 * (-15.0f32 / 20.0).exp();
        assert!((w - expected).abs() < 1e-5, "got {}", w);
        assert!(w < 0.5);
    }

    #[test]
    fn test_outside_window_counted_not_applied() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        assert_eq!(synapse.apply_plasticity(150.0, Time::ZERO), 0.5);
        assert_eq!(synapse.apply_plasticity(-150.0, Time::ZERO), 0.5);
        assert_eq!(synapse.apply_plasticity(0.0, Time::ZERO), 0.5);
        assert_eq!(synapse.snapshot().missed_plasticity_windows, 3);

        // An in-window adjustment leaves the counter alone
        synapse.apply_plasticity(-15.0, Time::ZERO);
        assert_eq!(synapse.snapshot().missed_plasticity_windows, 3);
    }

    #[test]
    fn test_post_spike_outside_window_counted() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.record_pre_spike(Time::from_millis(0));
        // 200ms gap is beyond the 100ms window
        synapse.on_post_spike(Time::from_millis(200), 1.0);
        assert_eq!(synapse.weight(), 0.5);
        assert_eq!(synapse.snapshot().missed_plasticity_windows, 1);
    }

    #[test]
    fn test_ltd_dominates_roundtrip() {
        // With alpha > 1 a symmetric pair of adjustments nets depression
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.apply_plasticity(-15.0, Time::ZERO);
        let w = synapse.apply_plasticity(15.0, Time::ZERO);
        assert!(w < 0.5, "net change should be dominated by LTD, got {}", w);
    }

    #[test]
    fn test_weight_clamped() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.set_weight(5.0);
        assert_eq!(synapse.weight(), 1.0);
        synapse.set_weight(-1.0);
        assert_eq!(synapse.weight(), 0.0);
        synapse.set_weight(0.99);
        let w = synapse.apply_plasticity(-1.0, Time::ZERO);
        assert!(w <= 1.0);
    }

    #[test]
    fn test_disabled_stdp_is_inert() {
        let config = scenario_config().with_stdp(StdpConfig::disabled());
        let (synapse, _inlet) = test_synapse(config);
        assert_eq!(synapse.apply_plasticity(-15.0, Time::ZERO), 0.5);
    }

    #[test]
    fn test_spike_rings_bounded() {
        let mut config = scenario_config();
        config.max_spikes_kept = 4;
        let (synapse, _inlet) = test_synapse(config);
        for i in 0..10 {
            synapse.record_pre_spike(Time::from_millis(i));
        }
        let times = synapse.pre_spike_times();
        assert_eq!(times.len(), 4);
        assert_eq!(times[0], Time::from_millis(6));
        assert_eq!(times[3], Time::from_millis(9));
    }

    #[test]
    fn test_on_post_spike_uses_last_pre_before_post() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.record_pre_spike(Time::from_millis(10));
        // This pre spike is after the post fire and must not participate
        synapse.record_pre_spike(Time::from_millis(40));
        synapse.on_post_spike(Time::from_millis(25), 1.0);
        // delta_t = 10 - 25 = -15ms: potentiation
        let expected = 0.5 + 0.1 * (-15.0f32 / 20.0).exp();
        assert!((synapse.weight() - expected).abs() < 1e-5);
        assert_eq!(synapse.post_spike_times().len(), 1);
    }

    #[test]
    fn test_transmit_weights_and_stamps() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        let now = Time::from_millis(7);
        synapse.transmit(2.0, now).unwrap();
        assert_eq!(synapse.last_activity(), now);
        assert_eq!(synapse.pre_spike_times(), vec![now]);
        let snap = synapse.snapshot();
        assert_eq!(snap.transmissions, 1);
    }

    #[test]
    fn test_pruning_law() {
        let config = scenario_config()
            .with_pruning(PruningConfig::new(0.3, Duration::from_millis(200)));
        let (synapse, _inlet) = test_synapse(config);
        synapse.set_weight(0.1);

        // Inactivity not yet exceeded
        assert!(!synapse.should_prune(Time::from_millis(100)));
        // Both conditions met
        assert!(synapse.should_prune(Time::from_millis(300)));

        // Heavy weight protects the synapse
        synapse.set_weight(0.8);
        assert!(!synapse.should_prune(Time::from_millis(300)));

        // Recent activity protects the synapse
        synapse.set_weight(0.1);
        synapse.transmit(1.0, Time::from_millis(250)).unwrap();
        assert!(!synapse.should_prune(Time::from_millis(300)));
    }

    #[test]
    fn test_pruning_disabled() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.set_weight(0.0);
        assert!(!synapse.should_prune(Time::from_secs(3600)));
    }

    #[test]
    fn test_is_active_window() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.transmit(1.0, Time::from_millis(100)).unwrap();
        assert!(synapse.is_active(Duration::from_millis(50), Time::from_millis(120)));
        assert!(!synapse.is_active(Duration::from_millis(50), Time::from_millis(200)));
    }

    #[test]
    fn test_scale_weight_preserves_bounds() {
        let (synapse, _inlet) = test_synapse(scenario_config());
        synapse.scale_weight(3.0);
        assert_eq!(synapse.weight(), 1.0);
        synapse.set_weight(0.5);
        synapse.scale_weight(0.5);
        assert!((synapse.weight() - 0.25).abs() < 1e-6);
    }
}
