//! Error types for the substrate engine

use somata_core::{Ligand, NeuronId, SynapseId};
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur in the substrate engine
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Foundation layer error
    #[error("Core error: {source}")]
    Core {
        #[from]
        /// Source core error
        source: somata_core::CoreError,
    },

    /// Invalid component configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Reason for invalid configuration
        reason: String,
    },

    /// Neuron not found in the registry
    #[error("Neuron {id} not found")]
    NeuronNotFound {
        /// Neuron ID that was not found
        id: NeuronId,
    },

    /// Synapse not found in the registry
    #[error("Synapse {id} not found")]
    SynapseNotFound {
        /// Synapse ID that was not found
        id: SynapseId,
    },

    /// No factory registered for a component tag
    #[error("No {kind} factory registered for type \"{tag}\"")]
    FactoryNotFound {
        /// Component kind ("neuron" or "synapse")
        kind: String,
        /// Requested factory tag
        tag: String,
    },

    /// Component or monitoring capacity exceeded
    #[error("Capacity exceeded: {resource} (limit: {limit})")]
    CapacityExceeded {
        /// Resource name
        resource: String,
        /// Resource limit
        limit: usize,
    },

    /// Component started twice
    #[error("{component} is already started")]
    AlreadyStarted {
        /// Component description
        component: String,
    },

    /// Operation on a component that is not running
    #[error("{component} is not running")]
    NotRunning {
        /// Component description
        component: String,
    },

    /// Chemical release rejected by the per-(source, ligand) rate limit
    #[error("Release of {ligand} from {neuron} rate-limited: {elapsed_ms:.2}ms since last (min gap {min_gap_ms:.2}ms)")]
    ReleaseRateLimited {
        /// Releasing neuron
        neuron: NeuronId,
        /// Released ligand
        ligand: Ligand,
        /// Elapsed time since the previous release (ms)
        elapsed_ms: f32,
        /// Configured minimum gap (ms)
        min_gap_ms: f32,
    },

    /// A wait operation timed out
    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    WaitTimeout {
        /// What was being waited for
        what: String,
        /// Timeout that elapsed (ms)
        timeout_ms: u64,
    },

    /// Monitoring was stopped while a wait was in flight
    #[error("Monitoring stopped")]
    MonitoringStopped,

    /// An internal channel closed unexpectedly
    #[error("Channel to {component} closed")]
    ChannelClosed {
        /// Component whose channel closed
        component: String,
    },
}

impl RuntimeError {
    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Create a factory-not-found error
    pub fn factory_not_found(kind: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::FactoryNotFound {
            kind: kind.into(),
            tag: tag.into(),
        }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(resource: impl Into<String>, limit: usize) -> Self {
        Self::CapacityExceeded {
            resource: resource.into(),
            limit,
        }
    }

    /// Create an already-started error
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Create a not-running error
    pub fn not_running(component: impl Into<String>) -> Self {
        Self::NotRunning {
            component: component.into(),
        }
    }

    /// Create a wait timeout error
    pub fn wait_timeout(what: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::WaitTimeout {
            what: what.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(component: impl Into<String>) -> Self {
        Self::ChannelClosed {
            component: component.into(),
        }
    }
}
