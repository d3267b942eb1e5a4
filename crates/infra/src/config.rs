//! Pipeline configuration.
//!
//! Built once at process start-up and passed to every constructor. Values come
//! from `GAS_*` environment variables:
//!
//! | Variable | Default |
//! |---|---|
//! | `GAS_REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `GAS_NAMESPACE` | `gas` |
//! | `GAS_DATA_DIR` | `./data/jobs` |
//! | `GAS_BLOB_ROOT` | `./data/blobs` |
//! | `GAS_ARCHIVE_ROOT` | `./data/archive` |
//! | `GAS_RESULTS_BUCKET` | `gas-results` |
//! | `GAS_KEY_PREFIX` | `gas` |
//! | `GAS_REQUESTS_QUEUE` / `GAS_RESULTS_QUEUE` / `GAS_ARCHIVE_QUEUE` / `GAS_RESTORE_QUEUE` / `GAS_THAW_QUEUE` | `job-requests` / `job-results` / `job-archive` / `job-restore` / `job-thaw` |
//! | `GAS_REQUESTS_TOPIC` / `GAS_RESULTS_TOPIC` / `GAS_ARCHIVE_TOPIC` | `job-requests` / `job-results` / `job-archive` |
//! | `GAS_POLL_WAIT_SECS` | `20` |
//! | `GAS_VISIBILITY_TIMEOUT_SECS` | `300` |
//! | `GAS_MAX_RECEIVE_COUNT` | `5` |
//! | `GAS_LEASE_TTL_SECS` | `3600` |
//! | `GAS_ENGINE_PROGRAM` | `annotate` |
//! | `GAS_ENGINE_ARGS` | empty (whitespace separated) |
//! | `GAS_RUNNER_PROGRAM` | `gas-annotate` |
//! | `GAS_ARCHIVE_RETRIEVAL_DELAY_SECS` | `0` |
//! | `GAS_RECORD_ENGINE_FAILURES` | `false` |
//!
//! Dead-letter queues are named `<queue>-dlq`.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub requests: String,
    /// Subscribed to the results topic; read by the user-notification consumer.
    pub results: String,
    pub archive: String,
    pub restore: String,
    pub thaw: String,
}

impl QueueNames {
    pub fn dead_letter(queue: &str) -> String {
        format!("{queue}-dlq")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub requests: String,
    pub results: String,
    pub archive: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub redis_url: String,
    /// Prefix for every Redis key.
    pub namespace: String,
    /// Local working directory for job files.
    pub data_dir: PathBuf,
    pub blob_root: PathBuf,
    pub archive_root: PathBuf,
    pub results_bucket: String,
    /// First path segment of result object keys.
    pub key_prefix: String,
    pub queues: QueueNames,
    pub topics: TopicNames,
    pub poll_wait: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub lease_ttl: Duration,
    pub engine_program: String,
    pub engine_args: Vec<String>,
    pub runner_program: PathBuf,
    pub archive_retrieval_delay: Duration,
    /// Mark a job FAILED when the annotation engine fails.
    pub record_engine_failures: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "gas".to_string(),
            data_dir: PathBuf::from("./data/jobs"),
            blob_root: PathBuf::from("./data/blobs"),
            archive_root: PathBuf::from("./data/archive"),
            results_bucket: "gas-results".to_string(),
            key_prefix: "gas".to_string(),
            queues: QueueNames {
                requests: "job-requests".to_string(),
                results: "job-results".to_string(),
                archive: "job-archive".to_string(),
                restore: "job-restore".to_string(),
                thaw: "job-thaw".to_string(),
            },
            topics: TopicNames {
                requests: "job-requests".to_string(),
                results: "job-results".to_string(),
                archive: "job-archive".to_string(),
            },
            poll_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 5,
            lease_ttl: Duration::from_secs(3600),
            engine_program: "annotate".to_string(),
            engine_args: Vec::new(),
            runner_program: PathBuf::from("gas-annotate"),
            archive_retrieval_delay: Duration::ZERO,
            record_engine_failures: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `GAS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let d = Self::default();

        let config = Self {
            redis_url: env.string("GAS_REDIS_URL", d.redis_url),
            namespace: env.string("GAS_NAMESPACE", d.namespace),
            data_dir: env.path("GAS_DATA_DIR", d.data_dir),
            blob_root: env.path("GAS_BLOB_ROOT", d.blob_root),
            archive_root: env.path("GAS_ARCHIVE_ROOT", d.archive_root),
            results_bucket: env.string("GAS_RESULTS_BUCKET", d.results_bucket),
            key_prefix: env.string("GAS_KEY_PREFIX", d.key_prefix),
            queues: QueueNames {
                requests: env.string("GAS_REQUESTS_QUEUE", d.queues.requests),
                results: env.string("GAS_RESULTS_QUEUE", d.queues.results),
                archive: env.string("GAS_ARCHIVE_QUEUE", d.queues.archive),
                restore: env.string("GAS_RESTORE_QUEUE", d.queues.restore),
                thaw: env.string("GAS_THAW_QUEUE", d.queues.thaw),
            },
            topics: TopicNames {
                requests: env.string("GAS_REQUESTS_TOPIC", d.topics.requests),
                results: env.string("GAS_RESULTS_TOPIC", d.topics.results),
                archive: env.string("GAS_ARCHIVE_TOPIC", d.topics.archive),
            },
            poll_wait: env.secs("GAS_POLL_WAIT_SECS", d.poll_wait)?,
            visibility_timeout: env.secs("GAS_VISIBILITY_TIMEOUT_SECS", d.visibility_timeout)?,
            max_receive_count: env.parse("GAS_MAX_RECEIVE_COUNT", d.max_receive_count)?,
            lease_ttl: env.secs("GAS_LEASE_TTL_SECS", d.lease_ttl)?,
            engine_program: env.string("GAS_ENGINE_PROGRAM", d.engine_program),
            engine_args: lookup("GAS_ENGINE_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(d.engine_args),
            runner_program: env.path("GAS_RUNNER_PROGRAM", d.runner_program),
            archive_retrieval_delay: env.secs("GAS_ARCHIVE_RETRIEVAL_DELAY_SECS", d.archive_retrieval_delay)?,
            record_engine_failures: env.flag("GAS_RECORD_ENGINE_FAILURES", d.record_engine_failures)?,
        };

        Ok(config)
    }

    /// Reject configurations no worker could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names = [
            ("GAS_REDIS_URL", &self.redis_url),
            ("GAS_NAMESPACE", &self.namespace),
            ("GAS_RESULTS_BUCKET", &self.results_bucket),
            ("GAS_KEY_PREFIX", &self.key_prefix),
            ("GAS_REQUESTS_QUEUE", &self.queues.requests),
            ("GAS_RESULTS_QUEUE", &self.queues.results),
            ("GAS_ARCHIVE_QUEUE", &self.queues.archive),
            ("GAS_RESTORE_QUEUE", &self.queues.restore),
            ("GAS_THAW_QUEUE", &self.queues.thaw),
            ("GAS_REQUESTS_TOPIC", &self.topics.requests),
            ("GAS_RESULTS_TOPIC", &self.topics.results),
            ("GAS_ARCHIVE_TOPIC", &self.topics.archive),
            ("GAS_ENGINE_PROGRAM", &self.engine_program),
        ];
        for (var, value) in names {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(var, "must not be empty"));
            }
        }

        if self.key_prefix.contains('/') || self.results_bucket.contains('/') {
            return Err(ConfigError::invalid("GAS_KEY_PREFIX", "bucket and key prefix must not contain '/'"));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::invalid("GAS_VISIBILITY_TIMEOUT_SECS", "must be positive"));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::invalid("GAS_LEASE_TTL_SECS", "must be positive"));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::invalid("GAS_MAX_RECEIVE_COUNT", "must be at least 1"));
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str, default: String) -> String {
        (self.0)(var).unwrap_or(default)
    }

    fn path(&self, var: &str, default: PathBuf) -> PathBuf {
        (self.0)(var).map(PathBuf::from).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.0)(var) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(var, format!("'{raw}': {e}"))),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }

    fn flag(&self, var: &str, default: bool) -> Result<bool, ConfigError> {
        match (self.0)(var).as_deref().map(str::trim) {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off" | "") => Ok(false),
            Some(other) => Err(ConfigError::invalid(var, format!("'{other}' is not a boolean"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PipelineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = load(&[]).unwrap();
        assert_eq!(config, PipelineConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("GAS_RESULTS_BUCKET", "results"),
            ("GAS_POLL_WAIT_SECS", "1"),
            ("GAS_ENGINE_ARGS", "--fast  --db hg19"),
            ("GAS_RECORD_ENGINE_FAILURES", "true"),
            ("GAS_RESULTS_QUEUE", "notify"),
        ])
        .unwrap();

        assert_eq!(config.queues.results, "notify");

        assert_eq!(config.results_bucket, "results");
        assert_eq!(config.poll_wait, Duration::from_secs(1));
        assert_eq!(config.engine_args, vec!["--fast", "--db", "hg19"]);
        assert!(config.record_engine_failures);
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        let err = load(&[("GAS_MAX_RECEIVE_COUNT", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == "GAS_MAX_RECEIVE_COUNT"));
        assert!(load(&[("GAS_RECORD_ENGINE_FAILURES", "maybe")]).is_err());
    }

    #[test]
    fn validation_rejects_empty_names_and_zero_durations() {
        assert!(load(&[("GAS_THAW_QUEUE", " ")]).unwrap().validate().is_err());
        assert!(load(&[("GAS_RESULTS_QUEUE", "")]).unwrap().validate().is_err());
        assert!(load(&[("GAS_VISIBILITY_TIMEOUT_SECS", "0")]).unwrap().validate().is_err());
        assert!(load(&[("GAS_MAX_RECEIVE_COUNT", "0")]).unwrap().validate().is_err());
    }
}
