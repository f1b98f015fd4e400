//! Delayed signal delivery
//!
//! Each neuron owns one [`DeliveryScheduler`] on its pre-synaptic side.
//! Outgoing transmissions are queued with their scheduled deadline and a
//! single task sleeps until the earliest one is due, so honoring per-edge
//! delays never costs a task per signal. Deliveries due at the same
//! instant are ordered by synapse id.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use somata_core::{Clock, NeuralSignal, Time};

use crate::error::{Result, RuntimeError};

/// A transmission waiting for its deadline
struct Scheduled {
    deadline: Time,
    tie: u64,
    seq: u64,
    signal: NeuralSignal,
    target: mpsc::Sender<NeuralSignal>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.tie == other.tie && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.tie.cmp(&other.tie))
            .then(self.seq.cmp(&other.seq))
    }
}

impl std::fmt::Debug for Scheduled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduled")
            .field("deadline", &self.deadline)
            .field("tie", &self.tie)
            .finish()
    }
}

/// Handle for submitting delayed deliveries
#[derive(Debug, Clone)]
pub struct DeliveryScheduler {
    tx: mpsc::UnboundedSender<Scheduled>,
    dropped: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    clock: Clock,
}

/// Receiving half consumed by the scheduler task
#[derive(Debug)]
pub struct SchedulerInlet {
    rx: mpsc::UnboundedReceiver<Scheduled>,
    dropped: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

impl DeliveryScheduler {
    /// Create a scheduler handle and the inlet its task will consume
    pub fn new(clock: Clock) -> (Self, SchedulerInlet) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        (
            Self {
                tx,
                dropped: dropped.clone(),
                delivered: delivered.clone(),
                clock,
            },
            SchedulerInlet {
                rx,
                dropped,
                delivered,
            },
        )
    }

    /// Queue a signal for delivery at its scheduled time
    ///
    /// The deadline is the signal's emission timestamp plus its total
    /// delay. Ties are broken by the carrying synapse id.
    pub fn schedule(&self, signal: NeuralSignal, target: mpsc::Sender<NeuralSignal>) -> Result<()> {
        let deadline = signal.delivery_time();
        let tie = signal.synapse_id.map(|s| s.raw()).unwrap_or(u64::MAX);
        self.tx
            .send(Scheduled {
                deadline,
                tie,
                seq: 0,
                signal,
                target,
            })
            .map_err(|_| RuntimeError::channel_closed("delivery scheduler"))
    }

    /// Signals dropped because a target buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    /// Signals delivered on schedule
    pub fn delivered(&self) -> u64 {
        self.delivered.load(AtomicOrdering::Relaxed)
    }

    /// The clock deadlines are interpreted against
    pub fn clock(&self) -> Clock {
        self.clock
    }
}

/// Scheduler task body; runs until shutdown or all handles drop
pub(crate) async fn run(inlet: SchedulerInlet, clock: Clock, mut shutdown: watch::Receiver<bool>) {
    let SchedulerInlet {
        mut rx,
        dropped,
        delivered,
    } = inlet;
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let next_deadline = heap.peek().map(|Reverse(s)| s.deadline);

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => {
                match item {
                    Some(mut scheduled) => {
                        seq += 1;
                        scheduled.seq = seq;
                        heap.push(Reverse(scheduled));
                    }
                    None => break,
                }
            }
            _ = sleep_until_due(clock, next_deadline), if next_deadline.is_some() => {
                let now = clock.now();
                loop {
                    match heap.peek() {
                        Some(Reverse(s)) if s.deadline <= now => {}
                        _ => break,
                    }
                    let Some(Reverse(due)) = heap.pop() else { break };
                    match due.target.try_send(due.signal) {
                        Ok(()) => {
                            delivered.fetch_add(1, AtomicOrdering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Full(signal)) => {
                            // Vesicle failure at the target: dropped, counted, never retried
                            dropped.fetch_add(1, AtomicOrdering::Relaxed);
                            log::debug!(
                                "delivery to {} dropped: input buffer full",
                                signal.target_id
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(signal)) => {
                            dropped.fetch_add(1, AtomicOrdering::Relaxed);
                            log::debug!("delivery to {} dropped: target stopped", signal.target_id);
                        }
                    }
                }
            }
        }
    }

    if !heap.is_empty() {
        log::debug!("scheduler stopping with {} undelivered signals", heap.len());
    }
}

async fn sleep_until_due(clock: Clock, deadline: Option<Time>) {
    if let Some(t) = deadline {
        let instant = tokio::time::Instant::from_std(clock.to_instant(t));
        tokio::time::sleep_until(instant).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use somata_core::{NeuronId, SynapseId};
    use std::time::Duration;

    fn signal_with_delay(target: NeuronId, synapse: u64, clock: &Clock, delay: Duration) -> NeuralSignal {
        NeuralSignal::input(1.0, target, clock.now())
            .with_synapse(SynapseId::new(synapse))
            .with_delays(delay, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_delivery_honors_delay() {
        let clock = Clock::new();
        let (scheduler, inlet) = DeliveryScheduler::new(clock);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(inlet, clock, shutdown_rx));

        let (tx, mut rx) = mpsc::channel(8);
        let sent_at = clock.now();
        scheduler
            .schedule(
                signal_with_delay(NeuronId::new(0), 1, &clock, Duration::from_millis(20)),
                tx,
            )
            .unwrap();

        let signal = rx.recv().await.unwrap();
        let elapsed = clock.now().since(sent_at);
        assert!(elapsed >= Duration::from_millis(19), "arrived at {:?}", elapsed);
        assert_eq!(signal.synapse_id, Some(SynapseId::new(1)));
    }

    #[tokio::test]
    async fn test_ordering_by_deadline() {
        let clock = Clock::new();
        let (scheduler, inlet) = DeliveryScheduler::new(clock);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(inlet, clock, shutdown_rx));

        let (tx, mut rx) = mpsc::channel(8);
        // Later deadline scheduled first
        scheduler
            .schedule(
                signal_with_delay(NeuronId::new(0), 1, &clock, Duration::from_millis(30)),
                tx.clone(),
            )
            .unwrap();
        scheduler
            .schedule(
                signal_with_delay(NeuronId::new(0), 2, &clock, Duration::from_millis(10)),
                tx,
            )
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.synapse_id, Some(SynapseId::new(2)));
        assert_eq!(second.synapse_id, Some(SynapseId::new(1)));
    }

    #[tokio::test]
    async fn test_full_target_drops_and_counts() {
        let clock = Clock::new();
        let (scheduler, inlet) = DeliveryScheduler::new(clock);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(inlet, clock, shutdown_rx));

        // Capacity-1 target that is never drained
        let (tx, _rx) = mpsc::channel(1);
        for i in 0..3 {
            scheduler
                .schedule(
                    signal_with_delay(NeuronId::new(0), i, &clock, Duration::from_millis(1)),
                    tx.clone(),
                )
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.delivered(), 1);
        assert_eq!(scheduler.dropped(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let clock = Clock::new();
        let (scheduler, inlet) = DeliveryScheduler::new(clock);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(inlet, clock, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let result = scheduler.schedule(
            signal_with_delay(NeuronId::new(0), 0, &clock, Duration::ZERO),
            tx,
        );
        // Channel may report closed only after the receiver drops; either way
        // no delivery happens after shutdown.
        drop(result);
        assert_eq!(scheduler.delivered(), 0);
    }

    #[test]
    fn test_tie_break_by_synapse_id() {
        let a = Scheduled {
            deadline: Time::from_millis(5),
            tie: 2,
            seq: 0,
            signal: NeuralSignal::input(0.0, NeuronId::new(0), Time::ZERO),
            target: mpsc::channel(1).0,
        };
        let b = Scheduled {
            deadline: Time::from_millis(5),
            tie: 7,
            seq: 1,
            signal: NeuralSignal::input(0.0, NeuronId::new(0), Time::ZERO),
            target: mpsc::channel(1).0,
        };
        assert!(a < b);
    }
}
