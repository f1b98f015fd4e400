//! Event-driven spiking neural substrate engine
//!
//! This crate provides the concurrent runtime of the Somata substrate:
//! autonomous neurons with one executor task each, synapses with delayed
//! weighted transmission and spike-timing-dependent plasticity, an
//! extracellular matrix coordinating geometry, chemistry, and structural
//! plasticity, and a glial monitor observing processing phases.

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export essential types from the foundation layer
pub use somata_core::{
    axon_speed, Clock, CoreError, DendriteMode, Ligand, MatrixConfig, MessageId, MonitorConfig,
    NeuralSignal, NeuronConfig, NeuronId, Position, PruningConfig, Result as CoreResult,
    ScalingConfig, StdpConfig, SynapseConfig, SynapseId, Time,
};

// Core modules
pub mod chemistry;
pub mod dendrite;
pub mod error;
pub mod matrix;
pub mod monitor;
pub mod neuron;
pub mod scheduler;
pub mod spatial;
pub mod synapse;

// Re-export essential types
pub use chemistry::{ChemicalField, LigandKinetics};
pub use dendrite::{DendriticIntegrator, PassiveSummation, TemporalSummation};
pub use error::{Result, RuntimeError};
pub use matrix::{
    Direction, ExtracellularMatrix, MatrixStats, NeuronFactory, SynapseContext, SynapseCriteria,
    SynapseFactory,
};
pub use monitor::{classify_phase, CompletionOutcome, GlialMonitor, MonitorStatus, ProcessingPhase};
pub use neuron::{NeuronHandle, NeuronSnapshot, StructuralContext};
pub use scheduler::DeliveryScheduler;
pub use spatial::SpatialIndex;
pub use synapse::{ChemicalSynapse, DelayProvider, Synapse, SynapseSnapshot, ZeroDelay};

/// Runtime crate version for compatibility checking
pub const RUNTIME_VERSION: u32 = 1;

/// Default integration tick (500 microseconds in nanoseconds)
pub const DEFAULT_INTEGRATION_TICK_NS: u64 = 500_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_integration() {
        // All components can be imported and basic objects created
        let config = NeuronConfig::default();
        assert!(config.validate().is_ok());

        let matrix = ExtracellularMatrix::new(MatrixConfig::default()).unwrap();
        assert_eq!(matrix.stats().neurons, 0);

        let monitor = GlialMonitor::new(MonitorConfig::default(), matrix.clock()).unwrap();
        assert_eq!(monitor.status().monitored, 0);
    }
}
