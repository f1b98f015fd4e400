//! Glial monitoring of neuron processing
//!
//! The monitor watches a bounded territory of neurons through their
//! published telemetry, classifies what phase each is in, tracks test
//! messages to completion, and offers wait primitives. It never touches
//! neuron state; everything is read from snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use somata_core::{Clock, MessageId, MonitorConfig, NeuralSignal, NeuronId, Time};

use crate::error::{Result, RuntimeError};
use crate::neuron::{NeuronHandle, NeuronSnapshot};

/// Processing phase classified from published telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ProcessingPhase {
    /// No appreciable activity
    Idle,
    /// Input present but not yet integrating strongly
    Receiving,
    /// Accumulator charging with elevated calcium
    Integrating,
    /// Accumulator at or near threshold
    Firing,
    /// Low accumulator with residual calcium after activity
    Recovery,
}

/// Classify a snapshot into a processing phase
pub fn classify_phase(snapshot: &NeuronSnapshot, activity_threshold: f32) -> ProcessingPhase {
    let threshold = snapshot.threshold.max(f32::EPSILON);
    let ratio = snapshot.accumulator / threshold;
    if ratio >= 0.95 {
        ProcessingPhase::Firing
    } else if ratio >= 0.1 && snapshot.calcium > 0.05 {
        ProcessingPhase::Integrating
    } else if ratio >= activity_threshold.min(0.1) {
        ProcessingPhase::Receiving
    } else if snapshot.calcium > 0.02 {
        ProcessingPhase::Recovery
    } else {
        ProcessingPhase::Idle
    }
}

/// How a tracked message reached completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CompletionOutcome {
    /// The neuron fired and recovered
    Fired,
    /// A weak signal settled below the activity thresholds
    Settled,
    /// A weak signal ran out its settling window
    WeakTimeout,
    /// The hard processing cap forced completion
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TrackState {
    Pending,
    Complete(CompletionOutcome),
    Stopped,
}

struct TrackedMessage {
    neuron: NeuronId,
    sent_at: Time,
    original_value: f32,
    baseline_fires: u64,
    saw_fire: bool,
    refractory: Duration,
    done_tx: watch::Sender<TrackState>,
}

/// Aggregate monitor counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MonitorStatus {
    /// Neurons in the territory
    pub monitored: usize,
    /// Messages still in flight
    pub tracked_in_flight: usize,
    /// Whether the poll loop is running
    pub running: bool,
}

struct MonitorInner {
    config: MonitorConfig,
    clock: Clock,
    neurons: RwLock<HashMap<NeuronId, Arc<NeuronHandle>>>,
    tracked: Mutex<HashMap<MessageId, TrackedMessage>>,
    next_message: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Glial monitor over a territory of neurons
pub struct GlialMonitor {
    inner: Arc<MonitorInner>,
    shutdown_tx: watch::Sender<bool>,
}

impl fmt::Debug for GlialMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlialMonitor")
            .field("status", &self.status())
            .finish()
    }
}

impl GlialMonitor {
    /// Create a monitor with a validated config
    pub fn new(config: MonitorConfig, clock: Clock) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                clock,
                neurons: RwLock::new(HashMap::new()),
                tracked: Mutex::new(HashMap::new()),
                next_message: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            shutdown_tx,
        })
    }

    /// The monitor configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Boot the completion-detector poll loop
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::already_started("monitor"));
        }
        self.inner.stopped.store(false, Ordering::Release);
        tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            self.shutdown_tx.subscribe(),
        ));
        log::debug!("monitor started");
        Ok(())
    }

    /// Stop monitoring; wakes every waiter with a monitoring-stopped error
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        let mut tracked = self.inner.tracked.lock();
        for (_, message) in tracked.drain() {
            let _ = message.done_tx.send(TrackState::Stopped);
        }
        log::debug!("monitor stopped");
    }

    /// Add a neuron to the territory
    ///
    /// Fails when the territorial capacity is reached.
    pub fn monitor_neuron(&self, neuron: Arc<NeuronHandle>) -> Result<()> {
        let mut neurons = self.inner.neurons.write();
        if neurons.len() >= self.inner.config.max_monitored
            && !neurons.contains_key(&neuron.id())
        {
            return Err(RuntimeError::capacity_exceeded(
                "monitored neurons",
                self.inner.config.max_monitored,
            ));
        }
        neurons.insert(neuron.id(), neuron);
        Ok(())
    }

    /// Remove a neuron from the territory
    pub fn stop_monitoring_neuron(&self, id: NeuronId) -> Result<()> {
        self.inner
            .neurons
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(RuntimeError::NeuronNotFound { id })
    }

    /// Ids of all monitored neurons
    pub fn get_monitored_neurons(&self) -> Vec<NeuronId> {
        let mut ids: Vec<NeuronId> = self.inner.neurons.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current processing phase of a monitored neuron
    pub fn get_processing_state(&self, id: NeuronId) -> Result<ProcessingPhase> {
        let neuron = self.lookup(id)?;
        Ok(classify_phase(
            &neuron.snapshot(),
            self.inner.config.activity_threshold,
        ))
    }

    /// Whether a monitored neuron is doing anything right now
    pub fn is_processing(&self, id: NeuronId) -> Result<bool> {
        let phase = self.get_processing_state(id)?;
        if phase != ProcessingPhase::Idle {
            return Ok(true);
        }
        let tracked = self.inner.tracked.lock();
        Ok(tracked.values().any(|m| m.neuron == id))
    }

    /// Inject a signal into a monitored neuron and track its processing
    pub fn send_test_message(&self, id: NeuronId, signal: NeuralSignal) -> Result<MessageId> {
        let neuron = self.lookup(id)?;
        let baseline = neuron.snapshot();
        let original_value = signal.original_value;
        neuron.receive(signal)?;

        let message_id = MessageId::new(self.inner.next_message.fetch_add(1, Ordering::Relaxed));
        let (done_tx, _) = watch::channel(TrackState::Pending);
        self.inner.tracked.lock().insert(
            message_id,
            TrackedMessage {
                neuron: id,
                sent_at: self.inner.clock.now(),
                original_value,
                baseline_fires: baseline.fires,
                saw_fire: false,
                refractory: neuron.config().refractory_duration,
                done_tx,
            },
        );
        log::trace!("tracking message {} into {}", message_id, id);
        Ok(message_id)
    }

    /// Wait until a tracked message completes
    ///
    /// Errors with a timeout if the message does not complete in time and
    /// with [`RuntimeError::MonitoringStopped`] if the monitor stops.
    pub async fn wait_for_processing_complete(
        &self,
        id: NeuronId,
        message: MessageId,
        timeout: Duration,
    ) -> Result<CompletionOutcome> {
        let mut rx = {
            let tracked = self.inner.tracked.lock();
            let entry = tracked.get(&message).ok_or_else(|| {
                RuntimeError::invalid_config(format!("message {} is not tracked", message))
            })?;
            if entry.neuron != id {
                return Err(RuntimeError::invalid_config(format!(
                    "message {} does not target {}",
                    message, id
                )));
            }
            entry.done_tx.subscribe()
        };

        let wait = async {
            loop {
                match *rx.borrow() {
                    TrackState::Complete(outcome) => return Ok(outcome),
                    TrackState::Stopped => return Err(RuntimeError::MonitoringStopped),
                    TrackState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(RuntimeError::MonitoringStopped);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::wait_timeout(
                format!("processing of message {}", message),
                timeout,
            )),
        }
    }

    /// Wait until a neuron is quiescent
    ///
    /// Quiescence: accumulator and calcium below strict thresholds and no
    /// tracked message in flight.
    pub async fn wait_for_quiescence(&self, id: NeuronId, timeout: Duration) -> Result<()> {
        let neuron = self.lookup(id)?;
        let poll = self.inner.config.state_update_interval;
        let wait = async {
            loop {
                if self.inner.stopped.load(Ordering::Acquire) {
                    return Err(RuntimeError::MonitoringStopped);
                }
                let snapshot = neuron.snapshot();
                let ratio = snapshot.accumulator / snapshot.threshold.max(f32::EPSILON);
                let in_flight = {
                    let tracked = self.inner.tracked.lock();
                    tracked.values().any(|m| m.neuron == id)
                };
                if ratio < 0.05 && snapshot.calcium < 0.02 && !in_flight {
                    return Ok(());
                }
                tokio::time::sleep(poll).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::wait_timeout(
                format!("quiescence of {}", id),
                timeout,
            )),
        }
    }

    /// Aggregate counters
    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            monitored: self.inner.neurons.read().len(),
            tracked_in_flight: self.inner.tracked.lock().len(),
            running: self.inner.running.load(Ordering::Acquire),
        }
    }

    fn lookup(&self, id: NeuronId) -> Result<Arc<NeuronHandle>> {
        self.inner
            .neurons
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::NeuronNotFound { id })
    }
}

impl Drop for GlialMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn poll_loop(weak: Weak<MonitorInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.config.state_update_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                evaluate_tracked(&inner);
            }
        }
    }
    log::debug!("monitor poll loop stopped");
}

/// One detector pass over every in-flight message
fn evaluate_tracked(inner: &MonitorInner) {
    let now = inner.clock.now();
    let config = &inner.config;
    let neurons = inner.neurons.read();
    let mut tracked = inner.tracked.lock();

    tracked.retain(|message_id, message| {
        let Some(neuron) = neurons.get(&message.neuron) else {
            // Territory changed underneath the message
            let _ = message.done_tx.send(TrackState::Stopped);
            return false;
        };
        let snapshot = neuron.snapshot();
        if snapshot.fires > message.baseline_fires {
            message.saw_fire = true;
        }

        let outcome = completion_outcome(message, &snapshot, now, config);
        match outcome {
            Some(outcome) => {
                log::trace!("message {} complete: {:?}", message_id, outcome);
                let _ = message.done_tx.send(TrackState::Complete(outcome));
                false
            }
            None => true,
        }
    });
}

/// The completion detector for a single tracked message
fn completion_outcome(
    message: &TrackedMessage,
    snapshot: &NeuronSnapshot,
    now: Time,
    config: &MonitorConfig,
) -> Option<CompletionOutcome> {
    let elapsed = now.since(message.sent_at);
    if elapsed >= config.max_processing_time {
        return Some(CompletionOutcome::Forced);
    }
    if elapsed < config.min_processing_time {
        return None;
    }

    if message.saw_fire {
        let recovered = snapshot.accumulator.abs() < 0.1
            && snapshot
                .last_fire_time
                .map(|t| now.since(t) >= message.refractory)
                .unwrap_or(true);
        return recovered.then_some(CompletionOutcome::Fired);
    }

    if message.original_value.abs() < 0.7 {
        let ratio = snapshot.accumulator / snapshot.threshold.max(f32::EPSILON);
        if ratio < config.activity_threshold && snapshot.calcium < 0.05 {
            return Some(CompletionOutcome::Settled);
        }
        if elapsed >= config.weak_signal_timeout {
            return Some(CompletionOutcome::WeakTimeout);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use somata_core::NeuronConfig;

    fn snapshot(accumulator: f32, threshold: f32, calcium: f32) -> NeuronSnapshot {
        NeuronSnapshot {
            accumulator,
            calcium,
            threshold,
            activity_level: 0.0,
            last_fire_time: None,
            fires: 0,
            received: 0,
            dropped_signals: 0,
            running: true,
        }
    }

    #[test]
    fn test_phase_classifier() {
        assert_eq!(
            classify_phase(&snapshot(1.0, 1.0, 0.0), 0.1),
            ProcessingPhase::Firing
        );
        assert_eq!(
            classify_phase(&snapshot(0.5, 1.0, 0.2), 0.1),
            ProcessingPhase::Integrating
        );
        assert_eq!(
            classify_phase(&snapshot(0.5, 1.0, 0.01), 0.1),
            ProcessingPhase::Receiving
        );
        assert_eq!(
            classify_phase(&snapshot(0.01, 1.0, 0.1), 0.1),
            ProcessingPhase::Recovery
        );
        assert_eq!(
            classify_phase(&snapshot(0.0, 1.0, 0.0), 0.1),
            ProcessingPhase::Idle
        );
    }

    fn monitored_neuron(config: NeuronConfig) -> (GlialMonitor, Arc<NeuronHandle>) {
        let clock = Clock::new();
        let neuron = NeuronHandle::new(NeuronId::new(0), config, clock).unwrap();
        neuron.start().unwrap();
        let monitor = GlialMonitor::new(MonitorConfig::default(), clock).unwrap();
        monitor.start().unwrap();
        monitor.monitor_neuron(neuron.clone()).unwrap();
        (monitor, neuron)
    }

    #[tokio::test]
    async fn test_completion_for_firing_signal() {
        let (monitor, neuron) = monitored_neuron(NeuronConfig::new(1.0).unwrap());
        let signal = NeuralSignal::input(2.0, neuron.id(), neuron.clock().now());
        let message = monitor.send_test_message(neuron.id(), signal).unwrap();

        let outcome = monitor
            .wait_for_processing_complete(neuron.id(), message, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Fired);
        monitor.stop();
        neuron.stop();
    }

    #[tokio::test]
    async fn test_weak_signal_times_out_short_wait() {
        let (monitor, neuron) = monitored_neuron(NeuronConfig::new(10.0).unwrap());
        // Sub-activity signal: keeps the neuron busy below thresholds
        let signal = NeuralSignal::input(0.5, neuron.id(), neuron.clock().now());
        let message = monitor.send_test_message(neuron.id(), signal).unwrap();

        // Waiting for less than the weak-signal settling window
        let result = monitor
            .wait_for_processing_complete(neuron.id(), message, Duration::from_millis(2))
            .await;
        assert!(matches!(result, Err(RuntimeError::WaitTimeout { .. })));
        monitor.stop();
        neuron.stop();
    }

    #[tokio::test]
    async fn test_stop_wakes_waiters() {
        let (monitor, neuron) = monitored_neuron(NeuronConfig::new(10.0).unwrap());
        let signal = NeuralSignal::input(0.1, neuron.id(), neuron.clock().now());
        let message = monitor.send_test_message(neuron.id(), signal).unwrap();

        let monitor = Arc::new(monitor);
        let waiter = {
            let monitor = monitor.clone();
            let id = neuron.id();
            tokio::spawn(async move {
                monitor
                    .wait_for_processing_complete(id, message, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        monitor.stop();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RuntimeError::MonitoringStopped)));
        neuron.stop();
    }

    #[tokio::test]
    async fn test_quiescence_wait() {
        let (monitor, neuron) = monitored_neuron(NeuronConfig::new(1.0).unwrap());
        // Idle neuron is quiescent almost immediately
        monitor
            .wait_for_quiescence(neuron.id(), Duration::from_millis(200))
            .await
            .unwrap();
        monitor.stop();
        neuron.stop();
    }

    #[tokio::test]
    async fn test_territorial_capacity() {
        let clock = Clock::new();
        let monitor =
            GlialMonitor::new(MonitorConfig::default().with_max_monitored(1), clock).unwrap();
        let a = NeuronHandle::new(NeuronId::new(0), NeuronConfig::default(), clock).unwrap();
        let b = NeuronHandle::new(NeuronId::new(1), NeuronConfig::default(), clock).unwrap();

        monitor.monitor_neuron(a).unwrap();
        assert!(matches!(
            monitor.monitor_neuron(b),
            Err(RuntimeError::CapacityExceeded { .. })
        ));
        assert_eq!(monitor.get_monitored_neurons(), vec![NeuronId::new(0)]);
    }

    #[tokio::test]
    async fn test_unmonitored_neuron_errors() {
        let clock = Clock::new();
        let monitor = GlialMonitor::new(MonitorConfig::default(), clock).unwrap();
        assert!(matches!(
            monitor.get_processing_state(NeuronId::new(5)),
            Err(RuntimeError::NeuronNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_monitoring_neuron() {
        let clock = Clock::new();
        let monitor = GlialMonitor::new(MonitorConfig::default(), clock).unwrap();
        let a = NeuronHandle::new(NeuronId::new(0), NeuronConfig::default(), clock).unwrap();
        monitor.monitor_neuron(a).unwrap();
        monitor.stop_monitoring_neuron(NeuronId::new(0)).unwrap();
        assert!(monitor.get_monitored_neurons().is_empty());
        assert!(matches!(
            monitor.stop_monitoring_neuron(NeuronId::new(0)),
            Err(RuntimeError::NeuronNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_status() {
        let clock = Clock::new();
        let monitor = GlialMonitor::new(MonitorConfig::default(), clock).unwrap();
        let status = monitor.status();
        assert_eq!(status.monitored, 0);
        assert_eq!(status.tracked_in_flight, 0);
        assert!(!status.running);
    }
}
