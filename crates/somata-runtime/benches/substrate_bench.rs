use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::sync::mpsc;

use somata_runtime::{
    ChemicalField, ChemicalSynapse, Clock, DeliveryScheduler, Ligand, NeuronId, Position,
    Synapse, SynapseConfig, SynapseId, Time, ZeroDelay,
};

fn bench_synapse(weight: f32) -> Arc<ChemicalSynapse> {
    let clock = Clock::new();
    let (scheduler, inlet) = DeliveryScheduler::new(clock);
    std::mem::forget(inlet);
    let (tx, rx) = mpsc::channel(1024);
    std::mem::forget(rx);
    Arc::new(
        ChemicalSynapse::new(
            SynapseId::new(0),
            SynapseConfig::new(NeuronId::new(0), NeuronId::new(1), weight),
            Arc::new(ZeroDelay),
            scheduler,
            tx,
            Time::ZERO,
        )
        .expect("bench synapse build"),
    )
}

fn bench_stdp(c: &mut Criterion) {
    let mut group = c.benchmark_group("stdp_adjustment");
    let synapse = bench_synapse(0.5);
    for &delta in &[-15.0f32, 15.0, 150.0] {
        group.bench_with_input(BenchmarkId::from_parameter(delta), &delta, |b, &delta| {
            b.iter(|| synapse.apply_plasticity(delta, Time::ZERO));
        });
    }
    group.finish();
}

fn bench_chemical_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("chemical_concentration");
    // Keep source counts small to stay fast in CI
    for &sources in &[4usize, 32, 128] {
        let field = ChemicalField::new(Duration::from_millis(3));
        for i in 0..sources {
            field
                .release(
                    Ligand::Bdnf,
                    NeuronId::new(i as u32),
                    Position::new(i as f32 * 10.0, 0.0, 0.0),
                    1.0,
                    Time::ZERO,
                )
                .expect("bench release");
        }
        group.throughput(Throughput::Elements(sources as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sources),
            &sources,
            |b, _| {
                b.iter(|| field.concentration(Ligand::Bdnf, Position::ORIGIN, Time::from_millis(1)))
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_stdp, bench_chemical_query);
criterion_main!(benches);
