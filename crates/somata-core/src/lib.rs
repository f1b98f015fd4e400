//! Foundation types for the Somata event-driven neural substrate
//!
//! This crate provides the shared vocabulary of the substrate: component
//! ids, monotonic time, spatial coordinates, the neural signal unit of
//! transmission, the ligand polarity table, and validated configuration
//! structs. The engine lives in `somata-runtime`.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod ligand;
pub mod signal;
pub mod space;
pub mod time;

// Re-export essential types
pub use config::{
    axon_speed, DendriteMode, MatrixConfig, MonitorConfig, NeuronConfig, PruningConfig,
    ScalingConfig, StdpConfig, SynapseConfig,
};
pub use error::{CoreError, Result};
pub use ids::{MessageId, NeuronId, SynapseId};
pub use ligand::Ligand;
pub use signal::NeuralSignal;
pub use space::Position;
pub use time::{Clock, Time};

/// Core crate version for compatibility checking
pub const CORE_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_integration() {
        // All essential types are importable and constructible
        let config = NeuronConfig::default();
        assert!(config.validate().is_ok());

        let signal = NeuralSignal::input(1.0, NeuronId::new(0), Time::ZERO);
        assert!(signal.success);

        assert_eq!(Ligand::Glutamate.polarity(), 1.0);
    }
}
