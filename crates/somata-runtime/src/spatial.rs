//! Spatial index over substrate components
//!
//! The matrix is the position authority: it writes positions here when
//! components are created or moved, and everything else queries. Writes
//! take a short exclusive lock; queries take the read side.

use std::collections::HashMap;

use parking_lot::RwLock;

use somata_core::{NeuronId, Position};

/// 3-D positions of registered components with distance queries
#[derive(Debug, Default)]
pub struct SpatialIndex {
    positions: RwLock<HashMap<NeuronId, Position>>,
}

impl SpatialIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or update a component's position
    pub fn set_position(&self, id: NeuronId, position: Position) {
        self.positions.write().insert(id, position);
    }

    /// Get a component's position
    pub fn position(&self, id: NeuronId) -> Option<Position> {
        self.positions.read().get(&id).copied()
    }

    /// Remove a component from the index
    pub fn remove(&self, id: NeuronId) {
        self.positions.write().remove(&id);
    }

    /// Euclidean distance between two registered components (um)
    ///
    /// `None` when either component is unregistered.
    pub fn distance(&self, a: NeuronId, b: NeuronId) -> Option<f32> {
        let positions = self.positions.read();
        let pa = positions.get(&a)?;
        let pb = positions.get(&b)?;
        Some(pa.distance_to(pb))
    }

    /// Components within `radius` um of a point, with their distances
    pub fn within_radius(&self, center: Position, radius: f32) -> Vec<(NeuronId, f32)> {
        let positions = self.positions.read();
        let mut hits: Vec<(NeuronId, f32)> = positions
            .iter()
            .filter_map(|(id, p)| {
                let d = center.distance_to(p);
                (d <= radius).then_some((*id, d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }

    /// Number of registered components
    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }
}
