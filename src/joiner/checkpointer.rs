//! The actor owning the joiner checkpoint.
//!
//! Consumers commit joined batches once they have durably handled
//! them. The actor folds commits into the [`EventHubCheckpoint`],
//! publishes every change on a `watch` channel and persists the
//! checkpoint on an interval, on [`CheckpointHandle::flush`] and on
//! shutdown.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::EventHubCheckpoint;
use crate::errors::JoinerError;
use crate::model::JoinedBatch;
use crate::model::PartitionId;
use crate::recovery::CheckpointStore;

const COMMAND_CAPACITY: usize = 64;

pub(crate) enum Command {
    Commit {
        partition_id: PartitionId,
        offset: i64,
        enqueued_time_utc: DateTime<Utc>,
    },
    Flush(oneshot::Sender<Result<(), JoinerError>>),
    Shutdown(oneshot::Sender<Result<(), JoinerError>>),
}

fn actor_stopped() -> JoinerError {
    JoinerError::ComponentFailed {
        component: "checkpointer".to_string(),
        reason: "checkpoint actor has stopped".to_string(),
    }
}

/// Handle to the checkpoint actor. Clones talk to the same actor.
#[derive(Clone)]
pub struct CheckpointHandle {
    commands: mpsc::Sender<Command>,
    latest: watch::Receiver<EventHubCheckpoint>,
}

impl CheckpointHandle {
    /// Record that `batch` has been consumed.
    pub async fn commit(&self, batch: &JoinedBatch) -> Result<(), JoinerError> {
        self.commands
            .send(Command::Commit {
                partition_id: batch.partition_id.clone(),
                offset: batch.offset,
                enqueued_time_utc: batch.enqueued_time_utc,
            })
            .await
            .map_err(|_| actor_stopped())
    }

    /// Persist now if anything changed since the last write.
    pub async fn flush(&self) -> Result<(), JoinerError> {
        self.request(Command::Flush).await
    }

    /// Persist and stop the actor.
    pub async fn shutdown(self) -> Result<(), JoinerError> {
        self.request(Command::Shutdown).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), JoinerError>>) -> Command,
    ) -> Result<(), JoinerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| actor_stopped())?;
        rx.await.map_err(|_| actor_stopped())?
    }

    /// The latest checkpoint, persisted or not.
    pub fn latest(&self) -> EventHubCheckpoint {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EventHubCheckpoint> {
        self.latest.clone()
    }
}

pub(crate) struct Checkpointer {
    store: CheckpointStore,
    blob_name: String,
    interval: Duration,
    checkpoint: EventHubCheckpoint,
    dirty: bool,
    latest: watch::Sender<EventHubCheckpoint>,
}

impl Checkpointer {
    pub(crate) fn new(
        store: CheckpointStore,
        blob_name: String,
        interval: Duration,
        initial: EventHubCheckpoint,
    ) -> (Self, CheckpointHandle, mpsc::Receiver<Command>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (latest_tx, latest_rx) = watch::channel(initial.clone());
        let actor = Self {
            store,
            blob_name,
            interval,
            checkpoint: initial,
            dirty: false,
            latest: latest_tx,
        };
        let handle = CheckpointHandle {
            commands: commands_tx,
            latest: latest_rx,
        };
        (actor, handle, commands_rx)
    }

    fn apply(&mut self, partition_id: PartitionId, offset: i64, enqueued_time_utc: DateTime<Utc>) {
        match self.checkpoint.advance(&partition_id, offset, enqueued_time_utc) {
            Ok(()) => {
                self.dirty = true;
                self.latest.send_replace(self.checkpoint.clone());
            }
            Err(err) => {
                tracing::warn!(%partition_id, offset, "Ignoring checkpoint commit: {err}");
            }
        }
    }

    async fn persist(&mut self) -> Result<(), JoinerError> {
        if !self.dirty {
            return Ok(());
        }
        self.store
            .save_joiner(&self.blob_name, &self.checkpoint)
            .await?;
        self.dirty = false;
        tracing::debug!(partitions = self.checkpoint.0.len(), "Persisted joiner checkpoint");
        Ok(())
    }

    /// Run until shut down, every handle is dropped, or `cancel`
    /// fires. Persists pending changes on the way out.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> Result<(), JoinerError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.persist().await {
                        tracing::warn!("Could not persist joiner checkpoint; will retry: {err}");
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Commit { partition_id, offset, enqueued_time_utc }) => {
                        self.apply(partition_id, offset, enqueued_time_utc);
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.persist().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.persist().await);
                        return Ok(());
                    }
                    None => break,
                },
            }
        }
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backoff::Backoff;
    use crate::model::ts;
    use crate::recovery::InMemBlobStore;

    fn joined(partition: &str, offset: i64, secs: i64) -> JoinedBatch {
        JoinedBatch {
            offset,
            sequence_number: offset,
            partition_id: PartitionId::from(partition),
            enqueued_time_utc: ts(secs),
            source_message_event_count: 1,
            messages: Vec::new(),
        }
    }

    fn spawn(
        blobs: &Arc<InMemBlobStore>,
        interval: Duration,
    ) -> (CheckpointHandle, tokio::task::JoinHandle<Result<(), JoinerError>>) {
        let store = CheckpointStore::new(blobs.clone(), 1)
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(1)));
        let (actor, handle, commands) =
            Checkpointer::new(store, "cp".to_string(), interval, EventHubCheckpoint::default());
        let task = tokio::spawn(actor.run(commands, CancellationToken::new()));
        (handle, task)
    }

    #[tokio::test]
    async fn commits_are_published_and_flushed() {
        let blobs = Arc::new(InMemBlobStore::new());
        let (handle, task) = spawn(&blobs, Duration::from_secs(3600));
        let mut updates = handle.subscribe();

        handle.commit(&joined("0", 10, 1)).await.unwrap();
        updates.changed().await.unwrap();
        assert_eq!(
            handle.latest().get(&PartitionId::from("0")).unwrap().offset,
            Some(10)
        );
        assert_eq!(blobs.writes(), 0);

        handle.flush().await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(blobs.writes(), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn regressions_are_ignored() {
        let blobs = Arc::new(InMemBlobStore::new());
        let (handle, _task) = spawn(&blobs, Duration::from_secs(3600));
        handle.commit(&joined("0", 10, 5)).await.unwrap();
        handle.commit(&joined("0", 4, 6)).await.unwrap();
        handle.flush().await.unwrap();
        let persisted = EventHubCheckpoint::from_json(&blobs.get("cp").unwrap()).unwrap();
        assert_eq!(persisted.get(&PartitionId::from("0")).unwrap().offset, Some(10));
    }

    #[tokio::test]
    async fn dropping_every_handle_persists() {
        let blobs = Arc::new(InMemBlobStore::new());
        let (handle, task) = spawn(&blobs, Duration::from_secs(3600));
        handle.commit(&joined("1", 3, 2)).await.unwrap();
        drop(handle);
        task.await.unwrap().unwrap();
        assert_eq!(blobs.writes(), 1);
    }

    #[tokio::test]
    async fn persists_on_interval() {
        let blobs = Arc::new(InMemBlobStore::new());
        let (handle, _task) = spawn(&blobs, Duration::from_millis(20));
        handle.commit(&joined("0", 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(blobs.writes(), 1);
    }
}
