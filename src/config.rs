//! Joiner configuration.
//!
//! Every field has a default, so a config file only needs the values
//! it changes. Durations are integer milliseconds.

use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::tracked_config_err;
use crate::errors::JoinerError;
use crate::errors::ResultExt;
use crate::inputs::ReceiverConfig;
use crate::operators::JoinConfig;
use crate::operators::MergeSortConfig;
use crate::tracing::TracingConfig;
use crate::window::PunctuationConfig;

mod duration_ms {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinerConfig {
    pub interaction_stream: String,
    pub observation_stream: String,
    /// How long after an interaction its observations may arrive.
    #[serde(with = "duration_ms")]
    pub backward_event_join_window: Duration,
    #[serde(with = "duration_ms")]
    pub punctuation_slack: Duration,
    pub add_punctuation_slack: bool,
    /// Observation idleness before punctuation starts.
    #[serde(with = "duration_ms")]
    pub punctuation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub punctuation_interval: Duration,
    #[serde(with = "duration_ms")]
    pub active_partition_read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub historical_partition_read_timeout: Duration,
    /// Batch age beyond which a partition counts as historical.
    #[serde(with = "duration_ms")]
    pub historical_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub event_hub_receive_timeout: Duration,
    pub receive_batch_size: usize,
    pub max_receive_retries: u32,
    /// How long to wait for every partition's first batch.
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
    pub partition_queue_capacity: usize,
    pub merge_output_capacity: usize,
    pub join_output_capacity: usize,
    #[serde(with = "duration_ms")]
    pub interaction_wait_timeout: Duration,
    /// Where to start reading when there is no checkpoint.
    pub warmstart_start_date_time: Option<DateTime<Utc>>,
    pub use_client_timestamp: bool,
    #[serde(with = "duration_ms")]
    pub checkpoint_interval: Duration,
    pub checkpoint_blob_name: String,
    pub billing_blob_name: String,
    pub storage_max_attempts: u32,
    pub metrics_port: Option<u16>,
    pub log_level: Option<String>,
    pub tracing: Option<TracingConfig>,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            interaction_stream: "interaction".to_string(),
            observation_stream: "observation".to_string(),
            backward_event_join_window: Duration::from_secs(60 * 60),
            punctuation_slack: Duration::from_secs(5),
            add_punctuation_slack: true,
            punctuation_timeout: Duration::from_secs(10),
            punctuation_interval: Duration::from_secs(1),
            active_partition_read_timeout: Duration::from_secs(1),
            historical_partition_read_timeout: Duration::from_secs(10),
            historical_threshold: Duration::from_secs(5 * 60),
            event_hub_receive_timeout: Duration::from_secs(5),
            receive_batch_size: 100,
            max_receive_retries: 30,
            startup_timeout: Duration::from_secs(30),
            partition_queue_capacity: crate::source::DEFAULT_CAPACITY,
            merge_output_capacity: 64,
            join_output_capacity: 64,
            interaction_wait_timeout: Duration::from_secs(5),
            warmstart_start_date_time: None,
            use_client_timestamp: false,
            checkpoint_interval: Duration::from_secs(30),
            checkpoint_blob_name: "joiner-checkpoint.json".to_string(),
            billing_blob_name: "billing-checkpoint.json".to_string(),
            storage_max_attempts: 5,
            metrics_port: None,
            log_level: None,
            tracing: None,
        }
    }
}

fn to_chrono(value: Duration, name: &str) -> Result<chrono::Duration, JoinerError> {
    chrono::Duration::from_std(value).map_err(|_| tracked_config_err(&format!("{name} is too large")))
}

impl JoinerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, JoinerError> {
        let config: Self = serde_json::from_str(json).reraise("error parsing joiner config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, JoinerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(crate::errors::StorageError::from)
            .reraise(&format!("error reading joiner config {path:?}"))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), JoinerError> {
        if self.interaction_stream.is_empty() || self.observation_stream.is_empty() {
            return Err(tracked_config_err("stream names must not be empty"));
        }
        if self.interaction_stream == self.observation_stream {
            return Err(tracked_config_err(&format!(
                "interaction and observation streams are both {:?}",
                self.interaction_stream
            )));
        }
        if self.backward_event_join_window.is_zero() {
            return Err(tracked_config_err("backward_event_join_window must be positive"));
        }
        let timeouts = [
            ("punctuation_timeout", self.punctuation_timeout),
            ("punctuation_interval", self.punctuation_interval),
            ("active_partition_read_timeout", self.active_partition_read_timeout),
            ("historical_partition_read_timeout", self.historical_partition_read_timeout),
            ("event_hub_receive_timeout", self.event_hub_receive_timeout),
            ("startup_timeout", self.startup_timeout),
            ("interaction_wait_timeout", self.interaction_wait_timeout),
            ("checkpoint_interval", self.checkpoint_interval),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(tracked_config_err(&format!("{name} must be positive")));
        }
        let capacities = [
            ("receive_batch_size", self.receive_batch_size),
            ("partition_queue_capacity", self.partition_queue_capacity),
            ("merge_output_capacity", self.merge_output_capacity),
            ("join_output_capacity", self.join_output_capacity),
            ("storage_max_attempts", self.storage_max_attempts as usize),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(tracked_config_err(&format!("{name} must be positive")));
        }
        crate::tracing::get_log_level(self.log_level.as_deref())?;
        self.join_window()?;
        Ok(())
    }

    pub fn join_window(&self) -> Result<chrono::Duration, JoinerError> {
        to_chrono(self.backward_event_join_window, "backward_event_join_window")
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            receive_timeout: self.event_hub_receive_timeout,
            batch_size: self.receive_batch_size,
            max_retries: self.max_receive_retries,
        }
    }

    pub fn merge_sort_config(&self) -> Result<MergeSortConfig, JoinerError> {
        Ok(MergeSortConfig {
            active_read_timeout: self.active_partition_read_timeout,
            historical_read_timeout: self.historical_partition_read_timeout,
            historical_threshold: to_chrono(self.historical_threshold, "historical_threshold")?,
        })
    }

    pub fn join_config(&self) -> Result<JoinConfig, JoinerError> {
        Ok(JoinConfig {
            window: self.join_window()?,
            punctuation: PunctuationConfig {
                timeout: to_chrono(self.punctuation_timeout, "punctuation_timeout")?,
                slack: to_chrono(self.punctuation_slack, "punctuation_slack")?,
                add_slack: self.add_punctuation_slack,
                use_client_timestamp: self.use_client_timestamp,
            },
            punctuation_interval: self.punctuation_interval,
            interaction_wait_timeout: self.interaction_wait_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config = JoinerConfig::from_json_str(
            r#"{
                "backward_event_join_window": 600000,
                "add_punctuation_slack": false,
                "warmstart_start_date_time": "2023-11-14T22:13:20Z"
            }"#,
        )
        .unwrap();
        assert_eq!(config.backward_event_join_window, Duration::from_secs(600));
        assert!(!config.add_punctuation_slack);
        assert_eq!(config.interaction_stream, "interaction");
        assert_eq!(config.punctuation_slack, Duration::from_secs(5));
        assert_eq!(
            config.warmstart_start_date_time,
            Some(crate::model::ts(0))
        );
        assert_eq!(config.join_window().unwrap(), chrono::Duration::minutes(10));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(JoinerConfig::default()).unwrap();
        assert_eq!(json["punctuation_timeout"], 10_000);
        assert_eq!(json["checkpoint_blob_name"], "joiner-checkpoint.json");
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let same_streams = r#"{"interaction_stream": "a", "observation_stream": "a"}"#;
        let err = JoinerConfig::from_json_str(same_streams).unwrap_err();
        assert!(err.to_string().contains("both \"a\""));

        let zero_window = r#"{"backward_event_join_window": 0}"#;
        assert!(JoinerConfig::from_json_str(zero_window).is_err());

        let zero_capacity = r#"{"merge_output_capacity": 0}"#;
        let err = JoinerConfig::from_json_str(zero_capacity).unwrap_err();
        assert!(err.to_string().contains("merge_output_capacity must be positive"));

        let bad_level = r#"{"log_level": "chatty"}"#;
        assert!(JoinerConfig::from_json_str(bad_level).is_err());

        assert!(JoinerConfig::from_json_str("{").is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joiner.json");
        std::fs::write(&path, r#"{"receive_batch_size": 7}"#).unwrap();
        let config = JoinerConfig::from_file(&path).unwrap();
        assert_eq!(config.receiver_config().batch_size, 7);
        assert!(JoinerConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
