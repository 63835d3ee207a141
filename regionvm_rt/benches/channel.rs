use criterion::{Criterion, criterion_group, criterion_main};
use regionvm_rt::{Channel, Configuration, RegionId, RegionObject};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Payload {
    region: Mutex<Option<RegionId>>,
}

impl Payload {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            region: Mutex::new(None),
        })
    }
}

impl RegionObject for Payload {
    fn region(&self) -> Option<RegionId> {
        *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_region(&self, region: Option<RegionId>) {
        *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = region;
    }

    fn children(&self) -> Vec<Arc<dyn RegionObject>> {
        Vec::new()
    }

    fn clone_shallow(&self, _children: Vec<Arc<dyn RegionObject>>) -> Arc<dyn RegionObject> {
        Payload::new()
    }
}

fn benchmarks(criterion: &mut Criterion) {
    bench_send_receive(criterion);
}

fn bench_send_receive(criterion: &mut Criterion) {
    let channel = Channel::new(Some(64), Configuration::default());

    criterion.bench_function("channel_send_receive", |bencher| {
        bencher.iter(|| round_trip(&channel));
    });
}

fn round_trip(channel: &Channel) {
    for _ in 0..1_000 {
        channel.send(1, Payload::new()).expect("send succeeds");
        channel.receive(1, None).expect("receive succeeds");
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmarks
);
criterion_main!(benches);
