//! Windowed left outer join of interactions with observations.
//!
//! Interactions are buffered per batch in arrival order. Each
//! observation is attached to the buffered interaction with the same
//! event id. An interaction batch is flushed once the observation
//! watermark passes its deadline, the latest interaction time in the
//! batch plus the join window. Observations that find nothing to
//! attach to are emitted as orphans.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::errors::JoinerError;
use crate::metrics::JoinerMetrics;
use crate::model::JoinedBatch;
use crate::model::JoinerOutput;
use crate::model::Message;
use crate::model::MessageBatch;
use crate::model::OrphanObservation;
use crate::model::PartitionId;
use crate::window::Clock;
use crate::window::ObservationClock;
use crate::window::PunctuationConfig;
use crate::window::WallClock;
use crate::with_timer;

#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// How long after an interaction observations may still join.
    pub window: chrono::Duration,
    pub punctuation: PunctuationConfig,
    /// How often to check for punctuation while idle.
    pub punctuation_interval: Duration,
    /// How long the interaction stream may stay idle while an
    /// observation batch waits for it before the batch is joined
    /// anyway.
    pub interaction_wait_timeout: Duration,
}

/// An interaction batch waiting for its window to close.
struct PendingBatch {
    serial: u64,
    offset: i64,
    sequence_number: i64,
    partition_id: PartitionId,
    enqueued_time_utc: DateTime<Utc>,
    source_message_event_count: usize,
    groups: Vec<Vec<Message>>,
    deadline: DateTime<Utc>,
}

impl From<PendingBatch> for JoinedBatch {
    fn from(pending: PendingBatch) -> Self {
        Self {
            offset: pending.offset,
            sequence_number: pending.sequence_number,
            partition_id: pending.partition_id,
            enqueued_time_utc: pending.enqueued_time_utc,
            source_message_event_count: pending.source_message_event_count,
            messages: pending.groups,
        }
    }
}

pub struct LeftOuterJoinBlock {
    config: JoinConfig,
    clock: ObservationClock,
    /// Unflushed interaction batches, oldest first. Serials are
    /// contiguous so a serial maps to a position.
    pending: VecDeque<PendingBatch>,
    next_serial: u64,
    /// Event id to (batch serial, group index) of every open
    /// interaction with that id, oldest first.
    index: HashMap<String, VecDeque<(u64, usize)>>,
    latest_interaction_time: Option<DateTime<Utc>>,
    metrics: JoinerMetrics,
}

impl LeftOuterJoinBlock {
    pub fn new(config: JoinConfig, wall_clock: Arc<dyn WallClock>, metrics: JoinerMetrics) -> Self {
        let clock = ObservationClock::new(config.punctuation, wall_clock);
        Self {
            config,
            clock,
            pending: VecDeque::new(),
            next_serial: 0,
            index: HashMap::new(),
            latest_interaction_time: None,
            metrics,
        }
    }

    /// Number of interaction batches still buffered.
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.clock.current()
    }

    /// Buffer an interaction batch.
    pub fn on_interaction(&mut self, batch: MessageBatch) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let use_client_timestamp = self.config.punctuation.use_client_timestamp;

        let mut groups = Vec::with_capacity(batch.messages.len());
        let mut latest: Option<DateTime<Utc>> = None;
        for msg in batch.messages {
            if !msg.is_dictionary() {
                let time = msg.event_time(use_client_timestamp);
                latest = Some(latest.map_or(time, |latest| latest.max(time)));
                match self.index.entry(msg.event_id.clone()) {
                    Entry::Occupied(mut entry) => {
                        tracing::warn!(
                            partition_id = %batch.partition_id,
                            sequence_number = batch.sequence_number,
                            event_id = %msg.event_id,
                            "Duplicate interaction event id; observations join the oldest open one"
                        );
                        entry.get_mut().push_back((serial, groups.len()));
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(VecDeque::from([(serial, groups.len())]));
                    }
                }
            }
            groups.push(vec![msg]);
        }

        let base = latest.unwrap_or(batch.enqueued_time_utc);
        let deadline = base
            .checked_add_signed(self.config.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.latest_interaction_time = Some(
            self.latest_interaction_time
                .map_or(batch.enqueued_time_utc, |t| t.max(batch.enqueued_time_utc)),
        );
        tracing::trace!(
            partition_id = %batch.partition_id,
            sequence_number = batch.sequence_number,
            groups = groups.len(),
            "Buffered interactions until {deadline:?}"
        );
        self.pending.push_back(PendingBatch {
            serial,
            offset: batch.offset,
            sequence_number: batch.sequence_number,
            partition_id: batch.partition_id,
            enqueued_time_utc: batch.enqueued_time_utc,
            source_message_event_count: batch.original_event_count,
            groups,
            deadline,
        });
    }

    /// Advance the watermark with an observation batch, flush what
    /// closed, then attach or orphan each observation.
    pub fn on_observation(&mut self, batch: MessageBatch) -> Vec<JoinerOutput> {
        let watermark = self.clock.watermark(&Poll::Ready(Some(&batch)));
        let mut out = self.flush(watermark);
        let labels = [KeyValue::new("partition_id", batch.partition_id.0.clone())];
        for msg in batch.messages {
            if msg.is_dictionary() {
                continue;
            }
            let open = self
                .index
                .get(&msg.event_id)
                .and_then(|entries| entries.front().copied());
            match open {
                Some((serial, group)) => {
                    let front = self.pending.front().map_or(serial, |front| front.serial);
                    let position = (serial - front) as usize;
                    if let Some(pending) = self.pending.get_mut(position) {
                        pending.groups[group].push(msg);
                        self.metrics.joined_observations.add(1, &labels);
                    }
                }
                None => {
                    tracing::debug!(
                        partition_id = %batch.partition_id,
                        sequence_number = batch.sequence_number,
                        event_id = %msg.event_id,
                        "Observation has no open interaction"
                    );
                    self.metrics.orphan_observations.add(1, &labels);
                    out.push(JoinerOutput::Orphan(OrphanObservation {
                        partition_id: batch.partition_id.clone(),
                        sequence_number: batch.sequence_number,
                        offset: batch.offset,
                        message: msg,
                    }));
                }
            }
        }
        out
    }

    /// Let the watermark advance while observations are idle.
    pub fn on_punctuation(&mut self) -> Vec<JoinerOutput> {
        let watermark = self.clock.watermark(&Poll::Pending);
        self.flush(watermark)
    }

    /// The observation stream ended; close every window.
    pub fn on_observation_end(&mut self) -> Vec<JoinerOutput> {
        let watermark = self.clock.watermark(&Poll::Ready(None));
        self.flush(watermark)
    }

    fn interactions_caught_up(&self, observation: &MessageBatch) -> bool {
        self.latest_interaction_time
            .map_or(false, |t| t >= observation.enqueued_time_utc)
    }

    /// Flush, in arrival order, every batch whose deadline is before
    /// the watermark.
    fn flush(&mut self, watermark: DateTime<Utc>) -> Vec<JoinerOutput> {
        let labels: [KeyValue; 0] = [];
        with_timer!(self.metrics.join_flush_duration, labels, {
            let mut out = Vec::new();
            while self
                .pending
                .front()
                .map_or(false, |front| front.deadline < watermark)
            {
                let Some(pending) = self.pending.pop_front() else {
                    break;
                };
                for (group_index, group) in pending.groups.iter().enumerate() {
                    let Some(first) = group.first() else {
                        continue;
                    };
                    if let Some(entries) = self.index.get_mut(&first.event_id) {
                        entries.retain(|open| *open != (pending.serial, group_index));
                        if entries.is_empty() {
                            self.index.remove(&first.event_id);
                        }
                    }
                }
                let partition_labels = [KeyValue::new("partition_id", pending.partition_id.0.clone())];
                self.metrics
                    .joined_interactions
                    .add(pending.groups.len() as u64, &partition_labels);
                tracing::trace!(
                    partition_id = %pending.partition_id,
                    sequence_number = pending.sequence_number,
                    "Flushing joined batch at watermark {watermark:?}"
                );
                out.push(JoinerOutput::Joined(pending.into()));
            }
            out
        })
    }

    /// Join until both inputs end or `cancel` fires.
    ///
    /// Observation batches are held until the interaction stream has
    /// reached their enqueued time, so interactions they match are
    /// already buffered. A held batch is released early once the
    /// interaction stream has been idle for the wait timeout.
    pub async fn run(
        mut self,
        mut interactions: mpsc::Receiver<MessageBatch>,
        mut observations: mpsc::Receiver<MessageBatch>,
        output: mpsc::Sender<JoinerOutput>,
        cancel: CancellationToken,
    ) -> Result<(), JoinerError> {
        tracing::info!(window = ?self.config.window, "Starting join");
        let mut interactions_open = true;
        let mut observations_open = true;
        let mut held: Option<MessageBatch> = None;
        let mut last_interaction = Instant::now();
        let wait_timeout = self.config.interaction_wait_timeout;
        let mut punctuation = tokio::time::interval(self.config.punctuation_interval);
        punctuation.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut out = Vec::new();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(pending = self.pending.len(), "Join cancelled");
                    break;
                }
                batch = interactions.recv(), if interactions_open => match batch {
                    Some(batch) => {
                        last_interaction = Instant::now();
                        self.on_interaction(batch);
                    }
                    None => {
                        tracing::info!("Interaction stream ended");
                        interactions_open = false;
                    }
                },
                batch = observations.recv(), if observations_open && held.is_none() => match batch {
                    Some(batch) => held = Some(batch),
                    None => {
                        tracing::info!("Observation stream ended");
                        observations_open = false;
                        out.extend(self.on_observation_end());
                    }
                },
                _ = tokio::time::sleep_until(last_interaction + wait_timeout),
                    if interactions_open && held.is_some() => {}
                _ = punctuation.tick() => out.extend(self.on_punctuation()),
            }

            let release = held.as_ref().map_or(false, |batch| {
                !interactions_open
                    || self.interactions_caught_up(batch)
                    || last_interaction.elapsed() >= wait_timeout
            });
            if release {
                if let Some(batch) = held.take() {
                    out.extend(self.on_observation(batch));
                }
            }

            let finished = !interactions_open && !observations_open && held.is_none();
            if finished {
                out.extend(self.on_observation_end());
            }

            for item in out {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    res = output.send(item) => res,
                };
                if sent.is_err() {
                    tracing::info!("Join output closed; stopping");
                    return Ok(());
                }
            }

            if finished {
                tracing::info!("Both streams ended; join complete");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_batch, test_message, ts, PayloadType, DICTIONARY_EVENT_ID};
    use crate::window::TestingClock;

    fn config() -> JoinConfig {
        JoinConfig {
            window: chrono::Duration::seconds(10),
            punctuation: PunctuationConfig {
                timeout: chrono::Duration::seconds(30),
                slack: chrono::Duration::seconds(1),
                add_slack: false,
                use_client_timestamp: false,
            },
            punctuation_interval: Duration::from_millis(10),
            interaction_wait_timeout: Duration::from_secs(5),
        }
    }

    fn join() -> (TestingClock, LeftOuterJoinBlock) {
        let wall = TestingClock::new(ts(0));
        let block = LeftOuterJoinBlock::new(config(), Arc::new(wall.clone()), JoinerMetrics::new());
        (wall, block)
    }

    fn interaction(seq: i64, secs: i64, ids: &[&str]) -> MessageBatch {
        let msgs = ids
            .iter()
            .map(|id| test_message(id, PayloadType::Interaction, secs))
            .collect();
        test_batch("0", seq, secs, msgs)
    }

    fn observation(seq: i64, secs: i64, ids: &[&str]) -> MessageBatch {
        let msgs = ids
            .iter()
            .map(|id| test_message(id, PayloadType::Observation, secs))
            .collect();
        test_batch("0", seq, secs, msgs)
    }

    fn joined(outputs: &[JoinerOutput]) -> Vec<&JoinedBatch> {
        outputs
            .iter()
            .filter_map(|out| match out {
                JoinerOutput::Joined(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    fn group_ids(batch: &JoinedBatch) -> Vec<Vec<(&str, PayloadType)>> {
        batch
            .messages
            .iter()
            .map(|g| g.iter().map(|m| (m.event_id.as_str(), m.payload_type)).collect())
            .collect()
    }

    #[test]
    fn observation_inside_window_joins() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a"]));
        assert!(join.on_observation(observation(0, 9, &["a"])).is_empty());
        assert_eq!(join.pending_batches(), 1);

        let out = join.on_observation(observation(1, 11, &[]));
        let batches = joined(&out);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            group_ids(batches[0]),
            vec![vec![
                ("a", PayloadType::Interaction),
                ("a", PayloadType::Observation)
            ]]
        );
        assert_eq!(batches[0].observation_count(), 1);
    }

    #[test]
    fn observation_at_deadline_still_joins() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a"]));
        assert!(join.on_observation(observation(0, 10, &["a"])).is_empty());
        let out = join.on_observation_end();
        assert_eq!(joined(&out)[0].observation_count(), 1);
    }

    #[test]
    fn observation_after_window_is_orphaned() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(3, 0, &["a"]));
        let out = join.on_observation(observation(7, 11, &["a"]));
        assert_eq!(out.len(), 2);
        match &out[0] {
            JoinerOutput::Joined(batch) => {
                assert_eq!(batch.sequence_number, 3);
                assert_eq!(batch.observation_count(), 0);
            }
            other => panic!("expected joined batch, got {other:?}"),
        }
        match &out[1] {
            JoinerOutput::Orphan(orphan) => {
                assert_eq!(orphan.message.event_id, "a");
                assert_eq!(orphan.sequence_number, 7);
            }
            other => panic!("expected orphan, got {other:?}"),
        }
    }

    #[test]
    fn flushes_keep_arrival_order_and_positions() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a", "b"]));
        join.on_interaction(interaction(1, 2, &["c"]));
        join.on_interaction(interaction(2, 20, &["d"]));
        join.on_observation(observation(0, 5, &["b", "c"]));

        let out = join.on_observation(observation(1, 13, &["d"]));
        let batches = joined(&out);
        assert_eq!(
            batches.iter().map(|b| b.sequence_number).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(batches[0].offset, 0);
        assert_eq!(batches[1].offset, 100);
        assert_eq!(
            group_ids(batches[0]),
            vec![
                vec![("a", PayloadType::Interaction)],
                vec![
                    ("b", PayloadType::Interaction),
                    ("b", PayloadType::Observation)
                ],
            ]
        );
        assert_eq!(batches[1].observation_count(), 1);
        assert_eq!(join.pending_batches(), 1);
    }

    #[test]
    fn dictionary_messages_pass_through() {
        let (_wall, mut join) = join();
        let mut batch = interaction(0, 0, &["a"]);
        batch
            .messages
            .push(test_message(DICTIONARY_EVENT_ID, PayloadType::Dictionary, 0));
        join.on_interaction(batch);
        join.on_observation(observation(0, 1, &[DICTIONARY_EVENT_ID]));
        let out = join.on_observation_end();
        let batches = joined(&out);
        assert_eq!(
            group_ids(batches[0]),
            vec![
                vec![("a", PayloadType::Interaction)],
                vec![(DICTIONARY_EVENT_ID, PayloadType::Dictionary)],
            ]
        );
    }

    #[test]
    fn duplicate_event_ids_join_the_first() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a"]));
        join.on_interaction(interaction(1, 1, &["a"]));
        join.on_observation(observation(0, 2, &["a"]));
        let out = join.on_observation_end();
        let batches = joined(&out);
        assert_eq!(batches[0].observation_count(), 1);
        assert_eq!(batches[1].observation_count(), 0);
    }

    #[test]
    fn later_duplicate_stays_joinable_after_first_flushes() {
        let (_wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a"]));
        join.on_interaction(interaction(1, 8, &["a"]));

        let out = join.on_observation(observation(0, 11, &["a"]));
        assert_eq!(out.len(), 1);
        let batches = joined(&out);
        assert_eq!(batches[0].sequence_number, 0);
        assert_eq!(batches[0].observation_count(), 0);
        assert_eq!(join.pending_batches(), 1);

        let out = join.on_observation_end();
        let batches = joined(&out);
        assert_eq!(batches[0].sequence_number, 1);
        assert_eq!(batches[0].observation_count(), 1);
    }

    #[test]
    fn punctuation_flushes_without_observations() {
        let (wall, mut join) = join();
        join.on_interaction(interaction(0, 0, &["a"]));
        assert!(join.on_punctuation().is_empty());

        wall.advance(chrono::Duration::seconds(30));
        let out = join.on_punctuation();
        assert_eq!(joined(&out).len(), 1);
        assert_eq!(join.watermark(), ts(29));
    }

    #[tokio::test]
    async fn run_joins_and_completes_when_inputs_end() {
        let (_wall, join) = join();
        let (itx, irx) = mpsc::channel(16);
        let (otx, orx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);

        // Observation first: it is held until the interaction stream
        // reaches its time.
        otx.send(observation(0, 5, &["a", "z"])).await.unwrap();
        itx.send(interaction(0, 1, &["a"])).await.unwrap();
        itx.send(interaction(1, 6, &["b"])).await.unwrap();
        drop(itx);
        drop(otx);

        join.run(irx, orx, tx, CancellationToken::new()).await.unwrap();
        let mut outputs = Vec::new();
        while let Some(out) = rx.recv().await {
            outputs.push(out);
        }
        let batches = joined(&outputs);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].observation_count(), 1);
        assert_eq!(batches[1].observation_count(), 0);
        let orphans: Vec<_> = outputs
            .iter()
            .filter_map(|out| match out {
                JoinerOutput::Orphan(orphan) => Some(orphan.message.event_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(orphans, vec!["z"]);
    }

    #[tokio::test]
    async fn idle_interaction_stream_does_not_serialize_held_observations() {
        let wall = TestingClock::new(ts(0));
        let mut config = config();
        config.interaction_wait_timeout = Duration::from_millis(200);
        let join = LeftOuterJoinBlock::new(config, Arc::new(wall), JoinerMetrics::new());
        let (itx, irx) = mpsc::channel(16);
        let (otx, orx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);

        itx.send(interaction(0, 0, &["a"])).await.unwrap();
        for secs in 1..=5 {
            let id = format!("o{secs}");
            otx.send(observation(secs, secs, &[id.as_str()])).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let handle = tokio::spawn(join.run(irx, orx, tx, cancel.clone()));

        let mut orphans = Vec::new();
        while orphans.len() < 5 {
            match rx.recv().await {
                Some(JoinerOutput::Orphan(orphan)) => orphans.push(orphan.message.event_id),
                Some(JoinerOutput::Joined(_)) => {}
                None => break,
            }
        }
        // One idle wait releases every queued batch, not one per batch.
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(orphans, vec!["o1", "o2", "o3", "o4", "o5"]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        drop(itx);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_wall, join) = join();
        let (_itx, irx) = mpsc::channel(16);
        let (_otx, orx) = mpsc::channel(16);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(join.run(irx, orx, tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
