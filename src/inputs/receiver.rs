use std::time::Duration;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;

use super::PartitionClient;
use super::ReceiveOutcome;
use crate::backoff::Backoff;
use crate::codec::decode_batch;
use crate::errors::JoinerError;
use crate::errors::ResultExt;
use crate::metrics::JoinerMetrics;
use crate::model::PartitionId;
use crate::source::PartitionWriter;
use crate::source::ReceiverStatus;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Timeout of each receive call.
    pub receive_timeout: Duration,
    /// Max events per receive call.
    pub batch_size: usize,
    /// Consecutive transient failures tolerated before giving up.
    pub max_retries: u32,
}

/// Pulls one partition from the transport into its source.
pub struct PartitionReceiver {
    stream: String,
    partition_id: PartitionId,
    client: Box<dyn PartitionClient>,
    writer: PartitionWriter,
    config: ReceiverConfig,
    backoff: Backoff,
    metrics: JoinerMetrics,
}

impl PartitionReceiver {
    pub fn new(
        stream: String,
        client: Box<dyn PartitionClient>,
        writer: PartitionWriter,
        config: ReceiverConfig,
        metrics: JoinerMetrics,
    ) -> Self {
        Self {
            stream,
            partition_id: writer.partition_id().clone(),
            client,
            writer,
            config,
            backoff: Backoff::default(),
            metrics,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Receive until cancelled, the partition ends, or a fatal error.
    ///
    /// Dropping `self` at the end closes the partition's source.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), JoinerError> {
        tracing::info!(stream = %self.stream, partition_id = %self.partition_id, "Starting partition receiver");
        let labels = [
            KeyValue::new("stream", self.stream.clone()),
            KeyValue::new("partition_id", self.partition_id.0.clone()),
        ];
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(stream = %self.stream, partition_id = %self.partition_id, "Receiver cancelled");
                    return Ok(());
                }
                res = self.client.receive(self.config.batch_size, self.config.receive_timeout) => res,
            };
            match res {
                Ok(ReceiveOutcome::Events(events)) => {
                    if self.backoff.attempts() > 0 {
                        tracing::info!(
                            stream = %self.stream,
                            partition_id = %self.partition_id,
                            attempts = self.backoff.attempts(),
                            "Partition receiver recovered"
                        );
                    }
                    self.backoff.reset();
                    self.writer.set_status(ReceiverStatus::Receiving);
                    for raw in events {
                        let (offset, sequence_number) = (raw.offset, raw.sequence_number);
                        let batch = match decode_batch(raw) {
                            Ok(batch) => batch,
                            Err(err) => {
                                tracing::warn!(
                                    stream = %self.stream,
                                    partition_id = %self.partition_id,
                                    offset,
                                    sequence_number,
                                    %err,
                                    "Skipping undecodable event"
                                );
                                self.metrics.skipped_batches.add(1, &labels);
                                continue;
                            }
                        };
                        tracing::trace!(
                            stream = %self.stream,
                            partition_id = %self.partition_id,
                            sequence_number,
                            messages = batch.messages.len(),
                            "Received batch"
                        );
                        let pushed = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(()),
                            res = self.writer.push(batch) => res,
                        };
                        if pushed.is_err() {
                            tracing::debug!(partition_id = %self.partition_id, "Source dropped; stopping receiver");
                            return Ok(());
                        }
                    }
                }
                Ok(ReceiveOutcome::EndOfStream) => {
                    tracing::info!(stream = %self.stream, partition_id = %self.partition_id, "Partition reached end of stream");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    self.metrics.receive_errors.add(1, &labels);
                    if self.backoff.attempts() >= self.config.max_retries {
                        tracing::error!(
                            stream = %self.stream,
                            partition_id = %self.partition_id,
                            %err,
                            "Receive retries exhausted"
                        );
                        return Err(JoinerError::RetriesExhausted {
                            partition_id: self.partition_id.clone(),
                            attempts: self.backoff.attempts() + 1,
                            last: err.to_string(),
                        });
                    }
                    self.writer.set_status(ReceiverStatus::BackingOff);
                    tracing::warn!(
                        stream = %self.stream,
                        partition_id = %self.partition_id,
                        attempt = self.backoff.attempts() + 1,
                        %err,
                        "Transient receive error; backing off"
                    );
                    if !self.backoff.wait(&cancel).await {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::error!(stream = %self.stream, partition_id = %self.partition_id, %err, "Fatal receive error");
                    return Err(err).reraise(&format!(
                        "error receiving from {} partition {}",
                        self.stream, self.partition_id
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::inputs::{MemoryTransport, StartPosition, Transport};
    use crate::model::{test_message, ts, PayloadType};
    use crate::source;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            receive_timeout: Duration::from_millis(20),
            batch_size: 10,
            max_retries: 3,
        }
    }

    async fn receiver(
        transport: &MemoryTransport,
    ) -> (PartitionReceiver, source::PartitionSource) {
        let pid = PartitionId::from("0");
        let client = transport
            .create_receiver("interaction", &pid, StartPosition::AfterOffset(-1))
            .await
            .unwrap();
        let (writer, source) = source::channel(pid, 16);
        let receiver = PartitionReceiver::new(
            "interaction".to_string(),
            client,
            writer,
            config(),
            JoinerMetrics::new(),
        )
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(2)));
        (receiver, source)
    }

    #[tokio::test]
    async fn receiver_forwards_batches_until_end_of_stream() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let pid = PartitionId::from("0");
        for secs in 0..3 {
            let msg = test_message(&format!("e{secs}"), PayloadType::Interaction, secs);
            transport.append("interaction", &pid, ts(secs), &[msg]).unwrap();
        }
        transport.append_raw("interaction", &pid, ts(3), vec![9, 9, 9]);
        transport.close_partition("interaction", &pid);

        let (receiver, mut source) = receiver(&transport).await;
        receiver.run(CancellationToken::new()).await.unwrap();

        let mut seqs = Vec::new();
        while let Some(batch) = source.pop() {
            seqs.push(batch.sequence_number);
        }
        // The undecodable event is skipped.
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(source.is_drained());
    }

    #[tokio::test]
    async fn receiver_retries_transient_errors() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let pid = PartitionId::from("0");
        transport.inject_failures(
            "interaction",
            &pid,
            vec![
                TransportError::Transient("busy".into()),
                TransportError::Transient("busy".into()),
            ],
        );
        let msg = test_message("e", PayloadType::Interaction, 0);
        transport.append("interaction", &pid, ts(0), &[msg]).unwrap();
        transport.close_partition("interaction", &pid);

        let (receiver, mut source) = receiver(&transport).await;
        receiver.run(CancellationToken::new()).await.unwrap();
        assert_eq!(source.pop().map(|b| b.sequence_number), Some(0));
        assert_eq!(source.receiver_status(), ReceiverStatus::Receiving);
    }

    #[tokio::test]
    async fn receiver_gives_up_after_max_retries() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let pid = PartitionId::from("0");
        let failures = (0..10)
            .map(|_| TransportError::Transient("busy".into()))
            .collect();
        transport.inject_failures("interaction", &pid, failures);

        let (receiver, source) = receiver(&transport).await;
        let err = receiver.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            JoinerError::RetriesExhausted { attempts: 4, .. }
        ));
        assert_eq!(source.receiver_status(), ReceiverStatus::BackingOff);
    }

    #[tokio::test]
    async fn receiver_fails_on_fatal_error() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let pid = PartitionId::from("0");
        transport.inject_failures("interaction", &pid, vec![TransportError::Fatal("auth".into())]);

        let (receiver, _source) = receiver(&transport).await;
        let err = receiver.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("error receiving from interaction partition 0"));
    }

    #[tokio::test]
    async fn receiver_stops_on_cancel() {
        let transport = MemoryTransport::new();
        transport.add_stream("interaction", 1);
        let (receiver, _source) = receiver(&transport).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receiver.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
