//! Ligand tags and their polarity table
//!
//! A ligand is a chemical species released into and queried from the
//! extracellular field. Each tag carries a fixed polarity: excitatory
//! binding depolarizes (+), inhibitory binding hyperpolarizes (-), and
//! modulatory or neurotrophic species act through separate pathways.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Chemical species recognized by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Ligand {
    /// No ligand (electrical or unspecified transmission)
    #[default]
    None,
    /// Primary excitatory transmitter
    Glutamate,
    /// Primary inhibitory transmitter
    Gaba,
    /// Inhibitory transmitter (spinal/brainstem)
    Glycine,
    /// Modulatory transmitter (reward signaling)
    Dopamine,
    /// Modulatory transmitter (mood/state)
    Serotonin,
    /// Context-dependent transmitter (excitatory or modulatory)
    Acetylcholine,
    /// Modulatory transmitter (arousal)
    Norepinephrine,
    /// Modulatory transmitter
    Histamine,
    /// Brain-derived neurotrophic factor (growth signaling)
    Bdnf,
    /// Nerve growth factor (growth signaling)
    Ngf,
}

impl Ligand {
    /// All ligand tags
    pub const ALL: [Ligand; 11] = [
        Ligand::None,
        Ligand::Glutamate,
        Ligand::Gaba,
        Ligand::Glycine,
        Ligand::Dopamine,
        Ligand::Serotonin,
        Ligand::Acetylcholine,
        Ligand::Norepinephrine,
        Ligand::Histamine,
        Ligand::Bdnf,
        Ligand::Ngf,
    ];

    /// Binding polarity: +1 excitatory, -1 inhibitory, 0 otherwise
    ///
    /// Acetylcholine is context-dependent and reports 0 here; receivers
    /// that treat it as excitatory apply their own gain.
    pub const fn polarity(&self) -> f32 {
        match self {
            Ligand::Glutamate => 1.0,
            Ligand::Gaba | Ligand::Glycine => -1.0,
            _ => 0.0,
        }
    }

    /// Whether binding this ligand acts through the modulatory pathway
    pub const fn is_modulatory(&self) -> bool {
        matches!(
            self,
            Ligand::Dopamine
                | Ligand::Serotonin
                | Ligand::Acetylcholine
                | Ligand::Norepinephrine
                | Ligand::Histamine
        )
    }

    /// Whether this ligand is a neurotrophic growth factor
    pub const fn is_neurotrophic(&self) -> bool {
        matches!(self, Ligand::Bdnf | Ligand::Ngf)
    }

    /// Canonical lowercase name
    pub const fn name(&self) -> &'static str {
        match self {
            Ligand::None => "none",
            Ligand::Glutamate => "glutamate",
            Ligand::Gaba => "gaba",
            Ligand::Glycine => "glycine",
            Ligand::Dopamine => "dopamine",
            Ligand::Serotonin => "serotonin",
            Ligand::Acetylcholine => "acetylcholine",
            Ligand::Norepinephrine => "norepinephrine",
            Ligand::Histamine => "histamine",
            Ligand::Bdnf => "bdnf",
            Ligand::Ngf => "ngf",
        }
    }
}

impl fmt::Display for Ligand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Ligand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Ligand::ALL
            .iter()
            .find(|l| l.name() == lower)
            .copied()
            .ok_or_else(|| CoreError::unknown_ligand(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarity_table() {
        assert_eq!(Ligand::Glutamate.polarity(), 1.0);
        assert_eq!(Ligand::Gaba.polarity(), -1.0);
        assert_eq!(Ligand::Glycine.polarity(), -1.0);
        assert_eq!(Ligand::Dopamine.polarity(), 0.0);
        assert_eq!(Ligand::Bdnf.polarity(), 0.0);
    }

    #[test]
    fn test_classification() {
        assert!(Ligand::Dopamine.is_modulatory());
        assert!(Ligand::Acetylcholine.is_modulatory());
        assert!(!Ligand::Glutamate.is_modulatory());
        assert!(Ligand::Bdnf.is_neurotrophic());
        assert!(Ligand::Ngf.is_neurotrophic());
        assert!(!Ligand::Gaba.is_neurotrophic());
    }

    #[test]
    fn test_name_roundtrip() {
        for ligand in Ligand::ALL {
            let parsed: Ligand = ligand.name().parse().unwrap();
            assert_eq!(parsed, ligand);
        }
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("GABA".parse::<Ligand>().unwrap(), Ligand::Gaba);
        assert_eq!("Glutamate".parse::<Ligand>().unwrap(), Ligand::Glutamate);
    }

    #[test]
    fn test_parse_unknown() {
        assert!("cortisol".parse::<Ligand>().is_err());
    }
}
