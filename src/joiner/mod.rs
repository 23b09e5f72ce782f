//! Orchestration of a whole joiner pipeline.
//!
//! Architecture
//! ------------
//!
//! ```text
//! transport -> PartitionReceiver -> PartitionSource (per partition, per stream)
//!           -> EventMergeSortBlock (per stream)
//!           -> LeftOuterJoinBlock -> outputs (+ BillingBlock)
//! ```
//!
//! [`JoinerEventHub::start`] does everything that can fail on bad
//! configuration before any task is spawned: it validates the config,
//! checks that both streams have the same number of partitions,
//! resolves resume points and opens every partition. Then it spawns
//! one task per component and a supervisor over them.
//!
//! The supervisor fails fast. The first component error or panic
//! cancels every other component and is what the pipeline completes
//! with. When the join block finishes because both streams ended,
//! anything still running upstream is cancelled too. Downstream
//! stages finish once they have drained what the join emitted,
//! unless a component failed, in which case they stop right away.
//!
//! The [`EventHubCheckpoint`] is owned by a separate actor reached
//! through [`CheckpointHandle`]; it outlives the pipeline so consumers
//! can commit the tail of the output.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::checkpoint::EventHubCheckpoint;
use crate::checkpoint::PartitionCheckpoint;
use crate::config::JoinerConfig;
use crate::errors::JoinerError;
use crate::errors::ResultExt;
use crate::inputs::PartitionReceiver;
use crate::inputs::StartPosition;
use crate::inputs::Transport;
use crate::metrics::JoinerMetrics;
use crate::model::BillingRecord;
use crate::model::JoinerOutput;
use crate::model::PartitionId;
use crate::operators::BillingBlock;
use crate::operators::EventMergeSortBlock;
use crate::operators::LeftOuterJoinBlock;
use crate::operators::UsageReporter;
use crate::recovery::BlobStore;
use crate::recovery::CheckpointStore;
use crate::source::PartitionSource;
use crate::window::WallClock;

pub mod checkpointer;

pub use checkpointer::CheckpointHandle;
use checkpointer::Checkpointer;

/// Most joined batches billed in one unit of work.
const BILLING_CHUNK: usize = 64;

/// Where each interaction partition starts reading.
///
/// A checkpointed offset wins, then a checkpointed enqueued time,
/// then `fallback`.
pub fn resolve_start_positions(
    partition_ids: &[PartitionId],
    checkpoint: Option<&EventHubCheckpoint>,
    fallback: DateTime<Utc>,
) -> Vec<(PartitionId, StartPosition)> {
    partition_ids
        .iter()
        .map(|partition_id| {
            let start = match checkpoint.and_then(|cp| cp.get(partition_id)) {
                Some(PartitionCheckpoint {
                    offset: Some(offset),
                    ..
                }) => StartPosition::AfterOffset(*offset),
                Some(PartitionCheckpoint {
                    enqueued_time_utc: Some(time),
                    ..
                }) => StartPosition::EnqueuedTime(*time),
                _ => StartPosition::EnqueuedTime(fallback),
            };
            (partition_id.clone(), start)
        })
        .collect()
}

/// Where every observation partition starts reading.
///
/// With a checkpoint this is one join window before the earliest
/// interaction resume time, so observations of replayed interactions
/// are read again.
pub fn observation_start_time(
    partition_ids: &[PartitionId],
    checkpoint: Option<&EventHubCheckpoint>,
    window: chrono::Duration,
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    let Some(checkpoint) = checkpoint else {
        return fallback;
    };
    let earliest = partition_ids
        .iter()
        .map(|partition_id| {
            checkpoint
                .get(partition_id)
                .and_then(|saved| saved.enqueued_time_utc)
                .unwrap_or(fallback)
        })
        .min()
        .unwrap_or(fallback);
    earliest
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone)]
enum Component {
    Receiver {
        stream: String,
        partition_id: PartitionId,
    },
    Merge(String),
    Join,
    FanOut,
    Billing,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receiver {
                stream,
                partition_id,
            } => write!(f, "receiver for {stream} partition {partition_id}"),
            Self::Merge(stream) => write!(f, "merge of {stream}"),
            Self::Join => write!(f, "join"),
            Self::FanOut => write!(f, "output fan-out"),
            Self::Billing => write!(f, "billing"),
        }
    }
}

type ComponentResult = (Component, std::thread::Result<Result<(), JoinerError>>);

fn spawn_component<F>(tasks: &mut JoinSet<ComponentResult>, component: Component, fut: F)
where
    F: std::future::Future<Output = Result<(), JoinerError>> + Send + 'static,
{
    tasks.spawn(async move {
        let res = AssertUnwindSafe(fut).catch_unwind().await;
        (component, res)
    });
}

/// `upstream` stops the stages up to the join, `fault` is cancelled
/// only when a component fails and stops everything.
async fn supervise(
    mut tasks: JoinSet<ComponentResult>,
    upstream: CancellationToken,
    fault: CancellationToken,
) -> Result<(), JoinerError> {
    let fail = |err: JoinerError, first_error: &mut Option<JoinerError>| {
        first_error.get_or_insert(err);
        fault.cancel();
        upstream.cancel();
    };
    let mut first_error: Option<JoinerError> = None;
    while let Some(joined) = tasks.join_next().await {
        let (component, res) = match joined {
            Ok(finished) => finished,
            Err(err) => {
                tracing::error!("Pipeline task failed: {err}");
                fail(
                    JoinerError::ComponentFailed {
                        component: "pipeline task".to_string(),
                        reason: err.to_string(),
                    },
                    &mut first_error,
                );
                continue;
            }
        };
        match res {
            Ok(Ok(())) => {
                tracing::debug!(%component, "Component finished");
                if matches!(component, Component::Join) && !upstream.is_cancelled() {
                    tracing::info!("Join finished; stopping the rest of the pipeline");
                    upstream.cancel();
                }
            }
            Ok(Err(err)) => {
                tracing::error!(%component, "Component failed: {err}");
                fail(err, &mut first_error);
            }
            Err(_) => {
                tracing::error!(%component, "Component panicked");
                fail(
                    JoinerError::ComponentPanicked {
                        component: component.to_string(),
                    },
                    &mut first_error,
                );
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => {
            tracing::info!("Joiner pipeline complete");
            Ok(())
        }
    }
}

/// Forward join output to the consumer and billable batches to
/// billing, one chunk of immediately available output at a time.
///
/// Stops waiting on a slow consumer as soon as `cancel` fires.
async fn fan_out(
    mut input: mpsc::Receiver<JoinerOutput>,
    output: mpsc::Sender<JoinerOutput>,
    billing: mpsc::Sender<Vec<BillingRecord>>,
    cancel: CancellationToken,
) -> Result<(), JoinerError> {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            item = input.recv() => item,
        };
        let Some(first) = first else {
            break;
        };
        let mut chunk = vec![first];
        while chunk.len() < BILLING_CHUNK {
            match input.try_recv() {
                Ok(item) => chunk.push(item),
                Err(_) => break,
            }
        }

        let records: Vec<BillingRecord> = chunk
            .iter()
            .filter_map(|item| match item {
                JoinerOutput::Joined(batch) => Some(BillingRecord::from(batch)),
                JoinerOutput::Orphan(_) => None,
            })
            .collect();
        if !records.is_empty() {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = billing.send(records) => res,
            };
            if sent.is_err() {
                tracing::warn!("Billing stopped; not forwarding more output");
                break;
            }
        }
        for item in chunk {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Fan-out cancelled while the consumer was not reading");
                    return Ok(());
                }
                res = output.send(item) => res,
            };
            if sent.is_err() {
                tracing::info!("Joiner output closed; stopping fan-out");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn wait_for_first_batches(
    stream: &str,
    sources: &mut [PartitionSource],
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let ready = join_all(
        sources
            .iter_mut()
            .map(|source| source.wait_for_data(timeout, cancel)),
    )
    .await;
    let waiting: Vec<String> = sources
        .iter()
        .zip(ready)
        .filter(|(_, ready)| !ready)
        .map(|(source, _)| source.partition_id().to_string())
        .collect();
    if waiting.is_empty() {
        tracing::info!(stream, "Every partition has data");
    } else {
        tracing::info!(stream, ?waiting, "Starting merge without data from some partitions");
    }
}

/// Resolves when every pipeline component has stopped.
pub struct Completion {
    handle: JoinHandle<Result<(), JoinerError>>,
}

impl Completion {
    /// The first component failure, or `Ok` on a clean finish.
    pub async fn wait(self) -> Result<(), JoinerError> {
        self.handle
            .await
            .map_err(|err| JoinerError::ComponentFailed {
                component: "supervisor".to_string(),
                reason: err.to_string(),
            })?
    }
}

/// A started pipeline.
pub struct RunningJoiner {
    /// Joined batches and orphan observations, in join order.
    pub outputs: mpsc::Receiver<JoinerOutput>,
    pub checkpoints: CheckpointHandle,
    pub completion: Completion,
}

/// Builds and starts joiner pipelines.
pub struct JoinerEventHub {
    config: JoinerConfig,
    transport: Arc<dyn Transport>,
    store: CheckpointStore,
    wall_clock: Arc<dyn WallClock>,
    reporter: Option<Arc<dyn UsageReporter>>,
    receiver_backoff: Backoff,
    metrics: JoinerMetrics,
}

impl JoinerEventHub {
    /// Call [`crate::metrics::initialize_metrics`] before this if
    /// metrics should be exported.
    pub fn new(
        config: JoinerConfig,
        transport: Arc<dyn Transport>,
        blobs: Arc<dyn BlobStore>,
        wall_clock: Arc<dyn WallClock>,
    ) -> Self {
        let store = CheckpointStore::new(blobs, config.storage_max_attempts);
        Self {
            config,
            transport,
            store,
            wall_clock,
            reporter: None,
            receiver_backoff: Backoff::default(),
            metrics: JoinerMetrics::new(),
        }
    }

    /// Bill joined batches through `reporter`.
    pub fn with_usage_reporter(mut self, reporter: Arc<dyn UsageReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_receiver_backoff(mut self, backoff: Backoff) -> Self {
        self.receiver_backoff = backoff;
        self
    }

    pub fn with_storage_backoff(mut self, backoff: Backoff) -> Self {
        self.store = self.store.with_backoff(backoff);
        self
    }

    /// The last persisted joiner checkpoint, if there is one.
    pub async fn load_checkpoint(&self) -> Result<Option<EventHubCheckpoint>, JoinerError> {
        let checkpoint = self
            .store
            .load_joiner(&self.config.checkpoint_blob_name)
            .await?;
        Ok((!checkpoint.is_empty()).then_some(checkpoint))
    }

    async fn partition_ids(&self, stream: &str) -> Result<Vec<PartitionId>, JoinerError> {
        let partition_ids = self
            .transport
            .partition_ids(stream)
            .await
            .reraise(&format!("error listing partitions of {stream}"))?;
        if partition_ids.is_empty() {
            return Err(JoinerError::NoPartitions(stream.to_string()));
        }
        Ok(partition_ids)
    }

    /// Open every partition of `stream` and build its receivers and
    /// sources.
    async fn open_stream(
        &self,
        stream: &str,
        starts: Vec<(PartitionId, StartPosition)>,
    ) -> Result<(Vec<PartitionReceiver>, Vec<PartitionSource>), JoinerError> {
        let mut receivers = Vec::with_capacity(starts.len());
        let mut sources = Vec::with_capacity(starts.len());
        for (partition_id, start) in starts {
            tracing::info!(stream, %partition_id, ?start, "Resuming partition");
            let client = self
                .transport
                .create_receiver(stream, &partition_id, start)
                .await
                .reraise(&format!("error opening {stream} partition {partition_id}"))?;
            let (writer, source) =
                crate::source::channel(partition_id, self.config.partition_queue_capacity);
            receivers.push(
                PartitionReceiver::new(
                    stream.to_string(),
                    client,
                    writer,
                    self.config.receiver_config(),
                    self.metrics.clone(),
                )
                .with_backoff(self.receiver_backoff.clone()),
            );
            sources.push(source);
        }
        Ok((receivers, sources))
    }

    /// Start the pipeline, resuming from `checkpoint` if given.
    ///
    /// Cancelling `cancel` stops the pipeline and the checkpoint
    /// actor.
    pub async fn start(
        &self,
        checkpoint: Option<EventHubCheckpoint>,
        cancel: CancellationToken,
    ) -> Result<RunningJoiner, JoinerError> {
        let config = &self.config;
        config.validate()?;
        let merge_config = config.merge_sort_config()?;
        let join_config = config.join_config()?;

        let interaction_ids = self.partition_ids(&config.interaction_stream).await?;
        let observation_ids = self.partition_ids(&config.observation_stream).await?;
        if interaction_ids.len() != observation_ids.len() {
            return Err(JoinerError::PartitionCountMismatch {
                interactions: interaction_ids.len(),
                observations: observation_ids.len(),
            });
        }

        let fallback = config
            .warmstart_start_date_time
            .unwrap_or_else(|| self.wall_clock.now());
        let interaction_starts =
            resolve_start_positions(&interaction_ids, checkpoint.as_ref(), fallback);
        let observation_start = observation_start_time(
            &interaction_ids,
            checkpoint.as_ref(),
            join_config.window,
            fallback,
        );
        tracing::info!(
            partitions = interaction_ids.len(),
            resumed = checkpoint.is_some(),
            "Reading observations from {observation_start:?}"
        );
        let observation_starts = observation_ids
            .iter()
            .map(|partition_id| {
                (
                    partition_id.clone(),
                    StartPosition::EnqueuedTime(observation_start),
                )
            })
            .collect();

        let (interaction_receivers, mut interaction_sources) = self
            .open_stream(&config.interaction_stream, interaction_starts)
            .await?;
        let (observation_receivers, mut observation_sources) = self
            .open_stream(&config.observation_stream, observation_starts)
            .await?;

        let billing = match &self.reporter {
            Some(reporter) => Some(
                BillingBlock::resume(
                    self.store.clone(),
                    config.billing_blob_name.clone(),
                    reporter.clone(),
                    self.metrics.clone(),
                )
                .await?,
            ),
            None => None,
        };

        let (checkpointer, checkpoints, commands) = Checkpointer::new(
            self.store.clone(),
            config.checkpoint_blob_name.clone(),
            config.checkpoint_interval,
            checkpoint.unwrap_or_default(),
        );
        let checkpoint_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = checkpointer.run(commands, checkpoint_cancel).await {
                tracing::error!("Joiner checkpoint actor failed: {err}");
            }
        });

        if let Some(port) = config.metrics_port {
            let latest = checkpoints.subscribe();
            let server_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = crate::webserver::run_webserver(port, latest, server_cancel).await {
                    tracing::error!("Metrics server failed: {err}");
                }
            });
        }

        let pipeline = cancel.child_token();
        let fault = cancel.child_token();
        let mut tasks = JoinSet::new();
        for receiver in interaction_receivers
            .into_iter()
            .chain(observation_receivers)
        {
            let component = Component::Receiver {
                stream: receiver.stream().to_string(),
                partition_id: receiver.partition_id().clone(),
            };
            spawn_component(&mut tasks, component, receiver.run(pipeline.clone()));
        }

        wait_for_first_batches(
            &config.interaction_stream,
            &mut interaction_sources,
            config.startup_timeout,
            &pipeline,
        )
        .await;
        wait_for_first_batches(
            &config.observation_stream,
            &mut observation_sources,
            config.startup_timeout,
            &pipeline,
        )
        .await;

        let mut merges = Vec::with_capacity(2);
        for (stream, sources) in [
            (&config.interaction_stream, interaction_sources),
            (&config.observation_stream, observation_sources),
        ] {
            let mut merge = EventMergeSortBlock::new(
                stream.clone(),
                merge_config.clone(),
                self.wall_clock.clone(),
                self.metrics.clone(),
            );
            for source in sources {
                merge.add(source);
            }
            let (tx, rx) = mpsc::channel(config.merge_output_capacity);
            spawn_component(
                &mut tasks,
                Component::Merge(stream.clone()),
                merge.run(tx, pipeline.clone()),
            );
            merges.push(rx);
        }
        let observations = merges.pop();
        let interactions = merges.pop();
        let (Some(interactions), Some(observations)) = (interactions, observations) else {
            return Err(JoinerError::ComponentFailed {
                component: "merge".to_string(),
                reason: "missing merge output".to_string(),
            });
        };

        let join = LeftOuterJoinBlock::new(join_config, self.wall_clock.clone(), self.metrics.clone());
        let (outputs_tx, outputs) = mpsc::channel(config.join_output_capacity);
        match billing {
            Some(billing) => {
                let (join_tx, join_rx) = mpsc::channel(config.join_output_capacity);
                let (billing_tx, billing_rx) = mpsc::channel(config.join_output_capacity);
                spawn_component(
                    &mut tasks,
                    Component::Join,
                    join.run(interactions, observations, join_tx, pipeline.clone()),
                );
                spawn_component(
                    &mut tasks,
                    Component::FanOut,
                    fan_out(join_rx, outputs_tx, billing_tx, fault.clone()),
                );
                spawn_component(
                    &mut tasks,
                    Component::Billing,
                    billing.run(billing_rx, fault.clone()),
                );
            }
            None => {
                spawn_component(
                    &mut tasks,
                    Component::Join,
                    join.run(interactions, observations, outputs_tx, pipeline.clone()),
                );
            }
        }

        let handle = tokio::spawn(supervise(tasks, pipeline, fault));
        Ok(RunningJoiner {
            outputs,
            checkpoints,
            completion: Completion { handle },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::TransportError;
    use crate::inputs::MemoryTransport;
    use crate::model::{test_message, ts, JoinedBatch, PayloadType};
    use crate::recovery::InMemBlobStore;
    use crate::window::TestingClock;

    fn pid(id: &str) -> PartitionId {
        PartitionId::from(id)
    }

    fn config() -> JoinerConfig {
        JoinerConfig {
            backward_event_join_window: Duration::from_secs(10),
            active_partition_read_timeout: Duration::from_millis(50),
            historical_partition_read_timeout: Duration::from_millis(50),
            event_hub_receive_timeout: Duration::from_millis(20),
            startup_timeout: Duration::from_millis(200),
            punctuation_interval: Duration::from_millis(10),
            interaction_wait_timeout: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(3600),
            warmstart_start_date_time: Some(ts(-100)),
            max_receive_retries: 2,
            ..JoinerConfig::default()
        }
    }

    fn hub(transport: &MemoryTransport, blobs: &Arc<InMemBlobStore>) -> JoinerEventHub {
        JoinerEventHub::new(
            config(),
            Arc::new(transport.clone()),
            blobs.clone(),
            Arc::new(TestingClock::new(ts(60))),
        )
        .with_receiver_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(2)))
        .with_storage_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(2)))
    }

    fn append(transport: &MemoryTransport, stream: &str, partition: &str, secs: i64, ids: &[&str]) {
        let payload_type = if stream == "interaction" {
            PayloadType::Interaction
        } else {
            PayloadType::Observation
        };
        let messages: Vec<_> = ids
            .iter()
            .map(|id| test_message(id, payload_type, secs))
            .collect();
        transport
            .append(stream, &pid(partition), ts(secs), &messages)
            .unwrap();
    }

    fn two_partition_transport() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 2);
        transport.add_stream("observation", 2);
        transport
    }

    #[test]
    fn start_positions_prefer_offsets() {
        let mut checkpoint = EventHubCheckpoint::default();
        checkpoint.advance(&pid("0"), 42, ts(30)).unwrap();
        checkpoint.0.insert(
            pid("1"),
            PartitionCheckpoint {
                offset: None,
                enqueued_time_utc: Some(ts(20)),
            },
        );
        let ids = [pid("0"), pid("1"), pid("2")];
        let starts = resolve_start_positions(&ids, Some(&checkpoint), ts(50));
        assert_eq!(
            starts,
            vec![
                (pid("0"), StartPosition::AfterOffset(42)),
                (pid("1"), StartPosition::EnqueuedTime(ts(20))),
                (pid("2"), StartPosition::EnqueuedTime(ts(50))),
            ]
        );

        let window = chrono::Duration::seconds(10);
        assert_eq!(
            observation_start_time(&ids, Some(&checkpoint), window, ts(50)),
            ts(10)
        );
        assert_eq!(observation_start_time(&ids, None, window, ts(50)), ts(50));
    }

    #[tokio::test]
    async fn mismatched_partition_counts_fail_before_starting() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 2);
        transport.add_stream("observation", 3);
        let blobs = Arc::new(InMemBlobStore::new());
        let err = hub(&transport, &blobs)
            .start(None, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            JoinerError::PartitionCountMismatch {
                interactions: 2,
                observations: 3
            }
        ));
    }

    #[tokio::test]
    async fn missing_stream_fails_before_starting() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let blobs = Arc::new(InMemBlobStore::new());
        let err = hub(&transport, &blobs)
            .start(None, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JoinerError::Context { .. }));
        assert!(err
            .to_string()
            .contains("error listing partitions of observation"));
    }

    #[tokio::test]
    async fn stream_without_partitions_fails_before_starting() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        transport.add_stream("observation", 0);
        let blobs = Arc::new(InMemBlobStore::new());
        let err = hub(&transport, &blobs)
            .start(None, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JoinerError::NoPartitions(stream) if stream == "observation"));
    }

    #[derive(Default)]
    struct CountingReporter {
        total: Mutex<u64>,
    }

    #[async_trait]
    impl UsageReporter for CountingReporter {
        async fn report(&self, billable_events: u64) -> Result<(), JoinerError> {
            *self.total.lock().unwrap() += billable_events;
            Ok(())
        }
    }

    #[tokio::test]
    async fn joins_bills_and_checkpoints_end_to_end() {
        let transport = two_partition_transport();
        append(&transport, "interaction", "0", 0, &["a"]);
        append(&transport, "interaction", "1", 1, &["c"]);
        append(&transport, "interaction", "0", 2, &["b"]);
        append(&transport, "observation", "0", 3, &["a"]);
        append(&transport, "observation", "1", 4, &["c", "x"]);
        transport.close_stream("interaction");
        transport.close_stream("observation");

        let blobs = Arc::new(InMemBlobStore::new());
        let reporter = Arc::new(CountingReporter::default());
        let hub = hub(&transport, &blobs).with_usage_reporter(reporter.clone());
        let RunningJoiner {
            mut outputs,
            checkpoints,
            completion,
        } = hub.start(None, CancellationToken::new()).await.unwrap();

        let mut joined: Vec<JoinedBatch> = Vec::new();
        let mut orphans = Vec::new();
        while let Some(out) = outputs.recv().await {
            match out {
                JoinerOutput::Joined(batch) => {
                    checkpoints.commit(&batch).await.unwrap();
                    joined.push(batch);
                }
                JoinerOutput::Orphan(orphan) => orphans.push(orphan.message.event_id),
            }
        }
        tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .unwrap()
            .unwrap();

        let order: Vec<_> = joined
            .iter()
            .map(|batch| (batch.partition_id.to_string(), batch.observation_count()))
            .collect();
        assert_eq!(
            order,
            vec![("0".to_string(), 1), ("1".to_string(), 1), ("0".to_string(), 0)]
        );
        assert_eq!(orphans, vec!["x".to_string()]);
        assert_eq!(*reporter.total.lock().unwrap(), 3);

        checkpoints.flush().await.unwrap();
        let hub = self::hub(&transport, &blobs);
        let resumed = hub.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(
            resumed.get(&pid("0")).unwrap().enqueued_time_utc,
            Some(ts(2))
        );
        assert_eq!(resumed.get(&pid("1")).unwrap().enqueued_time_utc, Some(ts(1)));
    }

    #[tokio::test]
    async fn receiver_failure_tears_down_the_pipeline() {
        let transport = two_partition_transport();
        transport.inject_failures(
            "interaction",
            &pid("1"),
            (0..10)
                .map(|_| TransportError::Transient("throttled".into()))
                .collect(),
        );
        let blobs = Arc::new(InMemBlobStore::new());
        let running = hub(&transport, &blobs)
            .start(None, CancellationToken::new())
            .await
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), running.completion.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            JoinerError::RetriesExhausted { ref partition_id, attempts: 3, .. } if *partition_id == pid("1")
        ));
    }

    #[tokio::test]
    async fn receiver_failure_completes_while_consumer_is_not_reading() {
        let transport = two_partition_transport();
        for secs in 0..6 {
            append(&transport, "interaction", "0", secs, &["a"]);
            append(&transport, "interaction", "1", secs, &["b"]);
        }
        transport.close_stream("observation");
        let blobs = Arc::new(InMemBlobStore::new());
        let reporter = Arc::new(CountingReporter::default());
        let config = JoinerConfig {
            join_output_capacity: 1,
            ..config()
        };
        let hub = JoinerEventHub::new(
            config,
            Arc::new(transport.clone()),
            blobs.clone(),
            Arc::new(TestingClock::new(ts(60))),
        )
        .with_receiver_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(2)))
        .with_usage_reporter(reporter);
        let RunningJoiner {
            outputs,
            checkpoints: _checkpoints,
            completion,
        } = hub.start(None, CancellationToken::new()).await.unwrap();

        // Let the join fill every channel up to the unread output.
        tokio::time::sleep(Duration::from_millis(300)).await;
        transport.inject_failures(
            "interaction",
            &pid("1"),
            vec![TransportError::Fatal("partition deleted".into())],
        );
        let err = tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("partition deleted"));
        drop(outputs);
    }

    #[tokio::test]
    async fn cancel_stops_every_component() {
        let transport = two_partition_transport();
        append(&transport, "interaction", "0", 0, &["a"]);
        let blobs = Arc::new(InMemBlobStore::new());
        let cancel = CancellationToken::new();
        let running = hub(&transport, &blobs)
            .start(None, cancel.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), running.completion.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
