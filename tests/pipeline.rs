//! End-to-end scenarios against an in-memory test topology: routing,
//! batching (size- and timeout-bounded), at-least-once-exactly-once ack
//! delivery, crash scoping, and graceful shutdown.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use conveyor::core::registry::StageRegistry;
use conveyor::{
    AckHandler, Acknowledger, BatchAck, BatchInfo, Message, PipelineModule, ProcessorOptions,
    ProducerDriver, ProducerOptions, PublisherOptions, TopologyBuilder,
};

const KILL_PROCESSOR: i64 = -1;
const KILL_BATCHER: i64 = -2;

#[derive(Default)]
struct Recorded {
    successful_ids: Vec<u64>,
    successful_data: Vec<i64>,
    failed_ids: Vec<u64>,
    batches: Vec<(String, usize)>,
    processor_incarnations: Vec<u64>,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Recorded>>);

impl Recorder {
    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.0.lock().unwrap()
    }
}

#[derive(Clone)]
struct TestContext {
    recorder: Recorder,
    registry: StageRegistry,
}

struct TestModule;

#[async_trait]
impl PipelineModule for TestModule {
    type Data = i64;
    type AckState = ();
    type Context = TestContext;

    async fn handle_message(
        &self,
        mut message: Message<i64, ()>,
        context: &TestContext,
    ) -> anyhow::Result<Message<i64, ()>> {
        if message.data == KILL_PROCESSOR {
            anyhow::bail!("poisoned message, killing this processor worker");
        }
        if let Some(pid) = &message.processor_pid {
            context.recorder.lock().processor_incarnations.push(pid.incarnation);
        }
        message.publisher = if message.data % 2 == 0 { "even" } else { "odd" }.to_string();
        Ok(message)
    }

    async fn handle_batch(
        &self,
        publisher_key: &str,
        messages: Vec<Message<i64, ()>>,
        info: &BatchInfo,
        context: &TestContext,
    ) -> anyhow::Result<BatchAck<i64, ()>> {
        context
            .recorder
            .lock()
            .batches
            .push((publisher_key.to_string(), messages.len()));

        if messages.iter().any(|m| m.data == KILL_BATCHER) {
            context.registry.kill(&info.batcher.name);
        }

        Ok(BatchAck::all_successful(messages))
    }
}

struct RecordingAckHandler {
    recorder: Recorder,
}

#[async_trait]
impl AckHandler<i64, ()> for RecordingAckHandler {
    async fn ack(&self, successful: Vec<Message<i64, ()>>, failed: Vec<Message<i64, ()>>) {
        let mut rec = self.recorder.lock();
        rec.successful_ids.extend(successful.iter().map(|m| m.id));
        rec.successful_data.extend(successful.iter().map(|m| m.data));
        rec.failed_ids.extend(failed.iter().map(|m| m.id));
    }
}

struct VecDriver {
    queue: VecDeque<i64>,
}

#[async_trait]
impl ProducerDriver for VecDriver {
    type Data = i64;
    type AckState = ();

    async fn handle_demand(&mut self, n: usize) -> anyhow::Result<Vec<Message<i64, ()>>> {
        let mut events = Vec::new();
        for _ in 0..n {
            match self.queue.pop_front() {
                Some(value) => {
                    events.push(Message::new(value, Acknowledger::new("main", ())));
                }
                None => break,
            }
        }
        Ok(events)
    }
}

fn driver_factory(
    values: Vec<i64>,
) -> conveyor::DriverFactory<i64, ()> {
    Arc::new(move || {
        Box::new(VecDriver {
            queue: values.clone().into(),
        }) as Box<dyn ProducerDriver<Data = i64, AckState = ()>>
    })
}

fn main_ack_handler(recorder: &Recorder) -> Arc<dyn AckHandler<i64, ()>> {
    Arc::new(RecordingAckHandler {
        recorder: recorder.clone(),
    })
}

// --- pool sizing / naming (no runtime needed) ---

#[test]
fn default_pool_sizes_are_derived() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder, registry: registry.clone() };

    let topology = TopologyBuilder::new("sizing", TestModule, context)
        .producer_group("main", driver_factory(vec![]), ProducerOptions::default())
        .registry(registry)
        .build()
        .expect("valid topology");

    let names = topology.stage_names();
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    assert_eq!(
        names.iter().filter(|n| n.contains(".Processor_")).count(),
        cpus * 2
    );
    assert!(names.contains(&"sizing.Producer_main_1".to_string()));
    assert!(names.contains(&"sizing.Batcher_default".to_string()));
    assert!(names.contains(&"sizing.Consumer_default_1".to_string()));
}

#[test]
fn explicit_pool_sizes_and_zero_padded_names() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder, registry: registry.clone() };

    let topology = TopologyBuilder::new("sizing2", TestModule, context)
        .producer_group("main", driver_factory(vec![]), ProducerOptions { stages: 3 })
        .processors(ProcessorOptions { stages: 4, min_demand: 5, max_demand: 10 })
        .destination(
            "even",
            PublisherOptions { stages: 2, ..PublisherOptions::default() },
        )
        .destination(
            "odd",
            PublisherOptions { stages: 1, ..PublisherOptions::default() },
        )
        .registry(registry)
        .build()
        .expect("valid topology");

    let names = topology.stage_names();
    for i in 1..=3 {
        assert!(names.contains(&format!("sizing2.Producer_main_{i}")));
    }
    for i in 1..=4 {
        assert!(names.contains(&format!("sizing2.Processor_{i}")));
    }
    assert!(names.contains(&"sizing2.Batcher_even".to_string()));
    assert!(names.contains(&"sizing2.Consumer_even_1".to_string()));
    assert!(names.contains(&"sizing2.Consumer_even_2".to_string()));
    assert!(names.contains(&"sizing2.Batcher_odd".to_string()));
    assert!(names.contains(&"sizing2.Consumer_odd_1".to_string()));
}

#[test]
fn duplicate_destination_keys_are_rejected() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder, registry: registry.clone() };

    let result = TopologyBuilder::new("dupes", TestModule, context)
        .producer_group("main", driver_factory(vec![]), ProducerOptions::default())
        .destination("even", PublisherOptions::default())
        .destination("even", PublisherOptions::default())
        .registry(registry)
        .build();

    assert!(matches!(
        result,
        Err(conveyor::ConfigError::DuplicateDestinationKey(key)) if key == "even"
    ));
}

#[test]
fn missing_producer_group_is_rejected() {
    let context = TestContext {
        recorder: Recorder::default(),
        registry: StageRegistry::new(),
    };
    let result = TopologyBuilder::new("no-producer", TestModule, context).build();
    assert!(matches!(result, Err(conveyor::ConfigError::MissingProducerGroup)));
}

// --- end-to-end scenarios ---

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn routes_messages_by_destination_key() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let topology = TopologyBuilder::new("routing", TestModule, context)
        .producer_group("main", driver_factory(vec![1, 2, 3, 4, 5, 6]), ProducerOptions::default())
        .processors(ProcessorOptions { stages: 2, min_demand: 2, max_demand: 8 })
        .destination("even", PublisherOptions { batch_size: 1, ..PublisherOptions::default() })
        .destination("odd", PublisherOptions { batch_size: 1, ..PublisherOptions::default() })
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 6, Duration::from_secs(2)).await;

    {
        let rec = recorder.lock();
        let even_batches: usize = rec.batches.iter().filter(|(k, _)| k == "even").map(|(_, n)| n).sum();
        let odd_batches: usize = rec.batches.iter().filter(|(k, _)| k == "odd").map(|(_, n)| n).sum();
        assert_eq!(even_batches, 3);
        assert_eq!(odd_batches, 3);
    }

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn batches_flush_at_batch_size() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let values: Vec<i64> = (0..7).map(|i| i * 2).collect(); // all even values, all route to the "even" destination
    let topology = TopologyBuilder::new("batch-size", TestModule, context)
        .producer_group("main", driver_factory(values), ProducerOptions::default())
        .destination(
            "even",
            PublisherOptions { batch_size: 3, batch_timeout: Duration::from_millis(200), ..PublisherOptions::default() },
        )
        .destination("odd", PublisherOptions::default())
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 7, Duration::from_secs(2)).await;

    let rec = recorder.lock();
    let sizes: Vec<usize> = rec.batches.iter().filter(|(k, _)| k == "even").map(|(_, n)| *n).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 7);
    assert!(sizes.iter().take(sizes.len().saturating_sub(1)).all(|&n| n == 3));
    drop(rec);

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn partial_batch_flushes_on_timeout() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let topology = TopologyBuilder::new("batch-timeout", TestModule, context)
        .producer_group("main", driver_factory(vec![2, 4]), ProducerOptions::default())
        .destination(
            "even",
            PublisherOptions { batch_size: 100, batch_timeout: Duration::from_millis(50), ..PublisherOptions::default() },
        )
        .destination("odd", PublisherOptions::default())
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 2, Duration::from_secs(2)).await;

    let rec = recorder.lock();
    let even_batches: Vec<usize> = rec.batches.iter().filter(|(k, _)| k == "even").map(|(_, n)| *n).collect();
    assert_eq!(even_batches, vec![2]);
    drop(rec);

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn acknowledges_every_message_exactly_once() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let values: Vec<i64> = (0..40).collect();
    let topology = TopologyBuilder::new("ack-once", TestModule, context)
        .producer_group("main", driver_factory(values), ProducerOptions::default())
        .processors(ProcessorOptions { stages: 3, min_demand: 2, max_demand: 8 })
        .destination("even", PublisherOptions { batch_size: 4, ..PublisherOptions::default() })
        .destination("odd", PublisherOptions { batch_size: 4, ..PublisherOptions::default() })
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 40, Duration::from_secs(3)).await;

    let rec = recorder.lock();
    assert!(rec.failed_ids.is_empty());
    let unique: HashSet<u64> = rec.successful_ids.iter().copied().collect();
    assert_eq!(unique.len(), 40);
    assert_eq!(rec.successful_ids.len(), 40);
    drop(rec);

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn processor_crash_is_isolated_and_restarts() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let mut values = vec![2]; // prime a first successful message to observe its incarnation
    values.push(KILL_PROCESSOR);
    values.extend((0..10).map(|i| i * 2));

    let topology = TopologyBuilder::new("processor-crash", TestModule, context)
        .producer_group("main", driver_factory(values), ProducerOptions::default())
        .processors(ProcessorOptions { stages: 1, min_demand: 1, max_demand: 4 })
        .destination("even", PublisherOptions { batch_size: 1, ..PublisherOptions::default() })
        .destination("odd", PublisherOptions::default())
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    // 1 successful message before the kill switch, plus 10 after the
    // processor pool restarts; the poisoned message itself is never acked.
    wait_until(|| recorder.lock().successful_ids.len() >= 11, Duration::from_secs(3)).await;

    let rec = recorder.lock();
    let first = *rec.processor_incarnations.first().expect("saw at least one message");
    let last = *rec.processor_incarnations.last().expect("saw at least one message");
    assert!(
        last > first,
        "processor incarnation should increase after the crash (first={first}, last={last})"
    );
    drop(rec);

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn batcher_crash_only_restarts_its_own_destination() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let mut values = vec![KILL_BATCHER];
    values.extend((0..10).map(|i| i * 2)); // more "even" traffic after the kill
    values.push(1); // "odd" traffic, unaffected by the "even" batcher's crash

    let topology = TopologyBuilder::new("batcher-crash", TestModule, context)
        .producer_group("main", driver_factory(values), ProducerOptions::default())
        .destination("even", PublisherOptions { batch_size: 1, ..PublisherOptions::default() })
        .destination("odd", PublisherOptions { batch_size: 1, ..PublisherOptions::default() })
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 12, Duration::from_secs(3)).await;

    let rec = recorder.lock();
    let odd_batches: usize = rec.batches.iter().filter(|(k, _)| k == "odd").count();
    assert_eq!(odd_batches, 1, "the odd destination should be unaffected by the even batcher's crash");
    let even_total: usize = rec
        .batches
        .iter()
        .filter(|(k, _)| k == "even")
        .map(|(_, n)| n)
        .sum();
    assert_eq!(even_total, 11, "the poisoned message plus the 10 that followed should all still land");
    drop(rec);

    topology.handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn shuts_down_gracefully() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let topology = TopologyBuilder::new("shutdown", TestModule, context)
        .producer_group("main", driver_factory(vec![2, 4, 6]), ProducerOptions::default())
        .destination("even", PublisherOptions::default())
        .destination("odd", PublisherOptions::default())
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    wait_until(|| recorder.lock().successful_ids.len() >= 3, Duration::from_secs(2)).await;

    tokio::time::timeout(Duration::from_secs(2), topology.handle.shutdown())
        .await
        .expect("shutdown should complete promptly")
        .expect("shutdown should not report a supervisor failure");
}

#[tokio::test]
async fn push_messages_injects_alongside_driver_output() {
    let recorder = Recorder::default();
    let registry = StageRegistry::new();
    let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

    let topology = TopologyBuilder::new("inject", TestModule, context)
        .producer_group("main", driver_factory(vec![2]), ProducerOptions::default())
        .destination("even", PublisherOptions::default())
        .destination("odd", PublisherOptions::default())
        .ack_handler("main", main_ack_handler(&recorder))
        .registry(registry)
        .build()
        .expect("valid topology")
        .start();

    let extra = vec![Message::new(4i64, Acknowledger::new("main", ()))];
    topology.producers[0]
        .push_messages(extra)
        .await
        .expect("producer should accept injected messages");

    wait_until(|| recorder.lock().successful_ids.len() >= 2, Duration::from_secs(2)).await;

    topology.handle.shutdown().await.expect("clean shutdown");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Every value pushed through a topology comes back out through some
    /// `AckHandler::ack` exactly once, regardless of how the processor and
    /// batcher pools interleave it — the multiset of acked data always
    /// equals the multiset sent in, independent of order.
    #[test]
    fn round_trips_arbitrary_payloads(values in prop_vec(0i64..1_000_000i64, 0..30usize)) {
        let expected_len = values.len();

        let (failed_empty, mut sent, mut received) = tokio_test::block_on(async move {
            let recorder = Recorder::default();
            let registry = StageRegistry::new();
            let context = TestContext { recorder: recorder.clone(), registry: registry.clone() };

            let topology = TopologyBuilder::new("roundtrip", TestModule, context)
                .producer_group("main", driver_factory(values.clone()), ProducerOptions::default())
                .destination(
                    "even",
                    PublisherOptions { batch_size: 4, batch_timeout: Duration::from_millis(100), ..PublisherOptions::default() },
                )
                .destination(
                    "odd",
                    PublisherOptions { batch_size: 4, batch_timeout: Duration::from_millis(100), ..PublisherOptions::default() },
                )
                .ack_handler("main", main_ack_handler(&recorder))
                .registry(registry)
                .build()
                .expect("valid topology")
                .start();

            wait_until(
                || recorder.lock().successful_ids.len() >= expected_len,
                Duration::from_secs(5),
            )
            .await;

            topology.handle.shutdown().await.expect("clean shutdown");

            let rec = recorder.lock();
            (rec.failed_ids.is_empty(), values.clone(), rec.successful_data.clone())
        });

        sent.sort_unstable();
        received.sort_unstable();
        prop_assert!(failed_empty);
        prop_assert_eq!(sent, received);
    }
}
