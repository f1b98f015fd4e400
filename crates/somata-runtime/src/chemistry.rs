//! The diffusing chemical field
//!
//! Releases record point emissions; a query at position `p` sums every
//! active emission's contribution `c0 * exp(-lambda * d) * exp(-age / tau)`.
//! Spatial falloff (`lambda`) and temporal decay (`tau`) are per-ligand.
//! The matrix's background loop evicts emissions whose remaining peak
//! amplitude has fallen below a configured epsilon. Releases are
//! rate-limited per (source, ligand).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use somata_core::{Ligand, NeuronId, Position, Time};

use crate::error::{Result, RuntimeError};

/// Per-ligand diffusion kinetics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LigandKinetics {
    /// Spatial decay constant (1/um): larger means steeper falloff
    pub lambda: f32,
    /// Temporal decay constant
    pub tau: Duration,
}

impl LigandKinetics {
    /// Default kinetics for a ligand species
    ///
    /// Fast transmitters are cleared quickly and act locally; modulators
    /// diffuse wider; neurotrophins spread furthest and persist longest.
    pub fn for_ligand(ligand: Ligand) -> Self {
        if ligand.is_neurotrophic() {
            Self {
                lambda: 0.05,
                tau: Duration::from_secs(5),
            }
        } else if ligand.is_modulatory() {
            Self {
                lambda: 0.1,
                tau: Duration::from_secs(1),
            }
        } else {
            Self {
                lambda: 0.5,
                tau: Duration::from_millis(200),
            }
        }
    }
}

/// One recorded release
#[derive(Debug, Clone)]
struct Emission {
    source: NeuronId,
    position: Position,
    concentration: f32,
    emitted: Time,
    kinetics: LigandKinetics,
}

impl Emission {
    /// Contribution at a query point and time
    fn contribution_at(&self, point: Position, now: Time) -> f32 {
        let d = self.position.distance_to(&point);
        let age = now.since(self.emitted).as_secs_f32();
        let tau = self.kinetics.tau.as_secs_f32();
        self.concentration * (-self.kinetics.lambda * d).exp() * (-age / tau).exp()
    }

    /// Remaining peak amplitude (at the source point)
    fn peak(&self, now: Time) -> f32 {
        let age = now.since(self.emitted).as_secs_f32();
        self.concentration * (-age / self.kinetics.tau.as_secs_f32()).exp()
    }
}

/// Per-ligand concentration field with rate-limited releases
#[derive(Debug)]
pub struct ChemicalField {
    emissions: RwLock<HashMap<Ligand, Vec<Emission>>>,
    last_release: Mutex<HashMap<(NeuronId, Ligand), Time>>,
    min_gap: Duration,
    kinetics_overrides: RwLock<HashMap<Ligand, LigandKinetics>>,
}

impl ChemicalField {
    /// Create a field with the given minimum inter-release gap
    pub fn new(min_gap: Duration) -> Self {
        Self {
            emissions: RwLock::new(HashMap::new()),
            last_release: Mutex::new(HashMap::new()),
            min_gap,
            kinetics_overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Override diffusion kinetics for a ligand
    pub fn set_kinetics(&self, ligand: Ligand, kinetics: LigandKinetics) {
        self.kinetics_overrides.write().insert(ligand, kinetics);
    }

    fn kinetics(&self, ligand: Ligand) -> LigandKinetics {
        self.kinetics_overrides
            .read()
            .get(&ligand)
            .copied()
            .unwrap_or_else(|| LigandKinetics::for_ligand(ligand))
    }

    /// Record a release from a source at its current position
    ///
    /// Rejects releases closer than the minimum gap to the source's
    /// previous release of the same ligand; the rejection is non-fatal
    /// and leaves the field unchanged.
    pub fn release(
        &self,
        ligand: Ligand,
        source: NeuronId,
        position: Position,
        concentration: f32,
        now: Time,
    ) -> Result<()> {
        if ligand == Ligand::None || concentration <= 0.0 {
            return Ok(());
        }

        {
            let mut last = self.last_release.lock();
            if let Some(previous) = last.get(&(source, ligand)) {
                let elapsed = now.since(*previous);
                if elapsed < self.min_gap {
                    return Err(RuntimeError::ReleaseRateLimited {
                        neuron: source,
                        ligand,
                        elapsed_ms: elapsed.as_secs_f32() * 1_000.0,
                        min_gap_ms: self.min_gap.as_secs_f32() * 1_000.0,
                    });
                }
            }
            last.insert((source, ligand), now);
        }

        let emission = Emission {
            source,
            position,
            concentration,
            emitted: now,
            kinetics: self.kinetics(ligand),
        };
        self.emissions.write().entry(ligand).or_default().push(emission);
        log::trace!(
            "release: {} from {} at {} (c0 {:.3})",
            ligand,
            source,
            position,
            concentration
        );
        Ok(())
    }

    /// Concentration of a ligand at a point
    pub fn concentration(&self, ligand: Ligand, point: Position, now: Time) -> f32 {
        self.emissions
            .read()
            .get(&ligand)
            .map(|emissions| {
                emissions
                    .iter()
                    .map(|e| e.contribution_at(point, now))
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Evict emissions whose remaining peak amplitude fell below epsilon
    ///
    /// Returns the number of evicted emissions.
    pub fn evict_depleted(&self, now: Time, epsilon: f32) -> usize {
        let mut emissions = self.emissions.write();
        let mut evicted = 0;
        emissions.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.peak(now) >= epsilon);
            evicted += before - list.len();
            !list.is_empty()
        });
        if evicted > 0 {
            log::trace!("evicted {} depleted emissions", evicted);
        }
        evicted
    }

    /// Active emission count across all ligands
    pub fn active_emissions(&self) -> usize {
        self.emissions.read().values().map(Vec::len).sum()
    }

    /// Sources with at least one active emission of a ligand
    pub fn active_sources(&self, ligand: Ligand) -> Vec<NeuronId> {
        let emissions = self.emissions.read();
        let mut sources: Vec<NeuronId> = emissions
            .get(&ligand)
            .map(|list| list.iter().map(|e| e.source).collect())
            .unwrap_or_default();
        sources.sort_unstable();
        sources.dedup();
        sources
    }

    /// Drop all emissions and release stamps
    pub fn clear(&self) {
        self.emissions.write().clear();
        self.last_release.lock().clear();
    }
}
