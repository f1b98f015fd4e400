//! Dendritic integration strategies
//!
//! A dendritic integrator buffers timestamped synaptic inputs between
//! integration ticks and hands the executor one effective input per tick.
//! Inputs are consumed by [`DendriticIntegrator::current`]; persistence
//! across ticks is the accumulator's job, not the dendrite's.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use somata_core::{DendriteMode, Time};

/// Strategy turning timestamped synaptic inputs into an effective input
pub trait DendriticIntegrator: Send + fmt::Debug {
    /// Buffer an input that arrived at time `t`
    fn push(&mut self, value: f32, t: Time);

    /// Effective input for the tick at `now`; consumes buffered inputs
    fn current(&mut self, now: Time) -> f32;

    /// Discard all buffered inputs
    fn reset(&mut self);

    /// Number of buffered, not-yet-integrated inputs
    fn pending(&self) -> usize;
}

/// Construct the integrator selected by a [`DendriteMode`]
pub fn from_mode(mode: DendriteMode) -> Box<dyn DendriticIntegrator> {
    match mode {
        DendriteMode::TemporalSummation { tau_m } => Box::new(TemporalSummation::new(tau_m)),
        DendriteMode::Passive => Box::new(PassiveSummation::new()),
    }
}

/// Default mode: per-input exponential traces summed over a sliding window
///
/// Traces decay relative to the newest buffered input, so the most recent
/// arrival always contributes at full strength and earlier arrivals in the
/// same batch are attenuated by `exp(-(t_newest - t) / tau_m)`. Inputs
/// older than five time constants contribute nothing and are dropped.
/// Persistence across ticks is the accumulator's leak, not the trace's.
pub struct TemporalSummation {
    tau_m: Duration,
    window: Duration,
    inputs: VecDeque<(Time, f32)>,
}

impl TemporalSummation {
    /// Create a temporal-summation integrator with the given time constant
    pub fn new(tau_m: Duration) -> Self {
        Self {
            tau_m,
            window: tau_m * 5,
            inputs: VecDeque::new(),
        }
    }

    /// The membrane time constant
    pub fn tau_m(&self) -> Duration {
        self.tau_m
    }
}

impl fmt::Debug for TemporalSummation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporalSummation")
            .field("tau_m", &self.tau_m)
            .field("pending", &self.inputs.len())
            .finish()
    }
}

impl DendriticIntegrator for TemporalSummation {
    fn push(&mut self, value: f32, t: Time) {
        self.inputs.push_back((t, value));
    }

    fn current(&mut self, now: Time) -> f32 {
        let anchor = self.inputs.back().map(|(t, _)| *t).unwrap_or(now);
        let tau_s = self.tau_m.as_secs_f32();
        let mut sum = 0.0;
        for (t, v) in self.inputs.drain(..) {
            let age = anchor.since(t);
            if age > self.window {
                continue;
            }
            sum += v * (-age.as_secs_f32() / tau_s).exp();
        }
        sum
    }

    fn reset(&mut self) {
        self.inputs.clear();
    }

    fn pending(&self) -> usize {
        self.inputs.len()
    }
}

/// Plain summation: buffered inputs are summed untraced and cleared
pub struct PassiveSummation {
    inputs: Vec<f32>,
}

impl PassiveSummation {
    /// Create a passive integrator
    pub fn new() -> Self {
        Self { inputs: Vec::new() }
    }
}

impl Default for PassiveSummation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PassiveSummation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveSummation")
            .field("pending", &self.inputs.len())
            .finish()
    }
}

impl DendriticIntegrator for PassiveSummation {
    fn push(&mut self, value: f32, _t: Time) {
        self.inputs.push(value);
    }

    fn current(&mut self, _now: Time) -> f32 {
        let sum = self.inputs.iter().sum();
        self.inputs.clear();
        sum
    }

    fn reset(&mut self) {
        self.inputs.clear();
    }

    fn pending(&self) -> usize {
        self.inputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_single_input_full_strength() {
        let mut d = TemporalSummation::new(Duration::from_millis(20));
        d.push(1.5, Time::from_millis(10));
        // The newest input is never attenuated, even if the tick lags
        let i = d.current(Time::from_millis(11));
        assert_eq!(i, 1.5);
        // Consumed: second tick sees nothing
        assert_eq!(d.current(Time::from_millis(12)), 0.0);
    }

    #[test]
    fn test_temporal_trace_decay() {
        let mut d = TemporalSummation::new(Duration::from_millis(20));
        d.push(1.0, Time::from_millis(0));
        d.push(1.0, Time::from_millis(20));
        // The older input has decayed by one time constant
        let i = d.current(Time::from_millis(20));
        assert!((i - (1.0 + (-1.0f32).exp())).abs() < 1e-3);
    }

    #[test]
    fn test_temporal_window_cutoff() {
        let mut d = TemporalSummation::new(Duration::from_millis(20));
        d.push(1.0, Time::from_millis(0));
        d.push(1.0, Time::from_millis(200));
        // The first input is older than 5 * tau_m relative to the newest
        assert_eq!(d.current(Time::from_millis(200)), 1.0);
    }

    #[test]
    fn test_temporal_summation_of_burst() {
        let mut d = TemporalSummation::new(Duration::from_millis(20));
        d.push(0.8, Time::from_millis(0));
        d.push(0.8, Time::from_millis(1));
        d.push(0.8, Time::from_millis(2));
        let i = d.current(Time::from_millis(2));
        assert!(i > 2.2 && i <= 2.4);
    }

    #[test]
    fn test_passive_sums_and_clears() {
        let mut d = PassiveSummation::new();
        d.push(0.5, Time::ZERO);
        d.push(0.25, Time::ZERO);
        assert_eq!(d.pending(), 2);
        assert_eq!(d.current(Time::from_millis(1)), 0.75);
        assert_eq!(d.pending(), 0);
        assert_eq!(d.current(Time::from_millis(2)), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut d = TemporalSummation::new(Duration::from_millis(20));
        d.push(1.0, Time::ZERO);
        d.reset();
        assert_eq!(d.pending(), 0);
        assert_eq!(d.current(Time::from_millis(1)), 0.0);
    }

    #[test]
    fn test_from_mode() {
        let d = from_mode(DendriteMode::default());
        assert_eq!(d.pending(), 0);
        let d = from_mode(DendriteMode::Passive);
        assert_eq!(d.pending(), 0);
    }
}
