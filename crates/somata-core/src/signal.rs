//! The unit of transmission between neurons
//!
//! A [`NeuralSignal`] is immutable once emitted: the sender constructs it
//! with the builder methods and everything downstream only reads it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{NeuronId, SynapseId};
use crate::ligand::Ligand;
use crate::time::Time;

/// A single transmission event traveling between neurons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralSignal {
    /// Final magnitude after synaptic weighting and noise
    pub value: f32,
    /// Magnitude as emitted by the source, before weighting
    pub original_value: f32,
    /// Emission timestamp (monotonic substrate time)
    pub timestamp: Time,
    /// Delay contributed by the synapse itself
    pub synaptic_delay: Duration,
    /// Delay contributed by axonal distance
    pub spatial_delay: Duration,
    /// Total scheduled delay (synaptic + spatial)
    pub total_delay: Duration,
    /// Emitting neuron, if any (external stimuli have none)
    pub source_id: Option<NeuronId>,
    /// Receiving neuron
    pub target_id: NeuronId,
    /// Carrying synapse, if any
    pub synapse_id: Option<SynapseId>,
    /// Transmitter species carried by this signal
    pub neurotransmitter: Ligand,
    /// Whether a vesicle was actually released at the terminal
    pub vesicle_released: bool,
    /// Calcium level at the terminal at emission time
    pub calcium_level: f32,
    /// Whether transmission succeeded
    pub success: bool,
    /// Failure description when `success` is false
    pub failure_reason: Option<String>,
    /// Gaussian noise magnitude applied to `value`
    pub noise_level: f32,
}

impl NeuralSignal {
    /// Create an external input signal addressed to a neuron
    pub fn input(value: f32, target: NeuronId, timestamp: Time) -> Self {
        Self {
            value,
            original_value: value,
            timestamp,
            synaptic_delay: Duration::ZERO,
            spatial_delay: Duration::ZERO,
            total_delay: Duration::ZERO,
            source_id: None,
            target_id: target,
            synapse_id: None,
            neurotransmitter: Ligand::None,
            vesicle_released: true,
            calcium_level: 0.0,
            success: true,
            failure_reason: None,
            noise_level: 0.0,
        }
    }

    /// Set the emitting neuron
    pub fn with_source(mut self, source: NeuronId) -> Self {
        self.source_id = Some(source);
        self
    }

    /// Set the carrying synapse
    pub fn with_synapse(mut self, synapse: SynapseId) -> Self {
        self.synapse_id = Some(synapse);
        self
    }

    /// Set the weighted value while preserving the original magnitude
    pub fn with_weighted_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    /// Set synaptic and spatial delays; the total is their sum
    pub fn with_delays(mut self, synaptic: Duration, spatial: Duration) -> Self {
        self.synaptic_delay = synaptic;
        self.spatial_delay = spatial;
        self.total_delay = synaptic + spatial;
        self
    }

    /// Set the transmitter species
    pub fn with_ligand(mut self, ligand: Ligand) -> Self {
        self.neurotransmitter = ligand;
        self
    }

    /// Set the terminal calcium level
    pub fn with_calcium(mut self, calcium: f32) -> Self {
        self.calcium_level = calcium;
        self
    }

    /// Set the applied noise magnitude
    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise_level = noise;
        self
    }

    /// Mark the signal as a failed transmission
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.vesicle_released = false;
        self.failure_reason = Some(reason.into());
        self
    }

    /// Scheduled delivery time (emission + total delay)
    pub fn delivery_time(&self) -> Time {
        self.timestamp + self.total_delay
    }

    /// Whether the emitted magnitude counts as a weak stimulus
    pub fn is_weak(&self) -> bool {
        self.original_value.abs() < 0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_signal() {
        let s = NeuralSignal::input(1.5, NeuronId::new(3), Time::from_millis(10));
        assert_eq!(s.value, 1.5);
        assert_eq!(s.original_value, 1.5);
        assert_eq!(s.target_id, NeuronId::new(3));
        assert!(s.source_id.is_none());
        assert!(s.success);
    }

    #[test]
    fn test_builder_delays() {
        let s = NeuralSignal::input(1.0, NeuronId::new(0), Time::from_millis(5))
            .with_delays(Duration::from_millis(1), Duration::from_micros(250));
        assert_eq!(s.total_delay, Duration::from_micros(1250));
        assert_eq!(s.delivery_time(), Time::from_micros(6250));
    }

    #[test]
    fn test_weighted_value_preserves_original() {
        let s = NeuralSignal::input(2.0, NeuronId::new(0), Time::ZERO).with_weighted_value(0.8);
        assert_eq!(s.value, 0.8);
        assert_eq!(s.original_value, 2.0);
    }

    #[test]
    fn test_failed_signal() {
        let s = NeuralSignal::input(1.0, NeuronId::new(0), Time::ZERO).failed("vesicle depletion");
        assert!(!s.success);
        assert!(!s.vesicle_released);
        assert_eq!(s.failure_reason.as_deref(), Some("vesicle depletion"));
    }

    #[test]
    fn test_weak_classification() {
        assert!(NeuralSignal::input(0.5, NeuronId::new(0), Time::ZERO).is_weak());
        assert!(!NeuralSignal::input(0.9, NeuronId::new(0), Time::ZERO).is_weak());
    }
}
