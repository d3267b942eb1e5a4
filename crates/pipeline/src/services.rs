//! Backend wiring for the worker binaries and tests.

use std::sync::Arc;

use gas_events::{FanoutBus, InMemoryQueue, MessageQueue, RedrivePolicy};
use gas_infra::{
    BlobStore, ColdArchive, FsArchive, FsBlobStore, InMemoryArchive, InMemoryBlobStore, InMemoryJobStore,
    InMemoryProfiles, JobStore, PipelineConfig, ProfileDirectory, QueueNames, RedisJobStore, RedisProfiles,
    RedisStreamsQueue,
};

use crate::archiver::Archiver;
use crate::dispatcher::Dispatcher;
use crate::launcher::TaskLauncher;
use crate::restorer::{RestoreRequester, Thawer};
use crate::runner::{AnnotationEngine, RunnerSettings, TaskRunner};
use crate::worker::{MessageHandler, PollLoop};
use crate::workspace::JobWorkspace;

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("bus wiring: {0}")]
    Bus(#[from] gas_events::BusError),
}

#[derive(Clone)]
pub struct Queues {
    pub requests: Arc<dyn MessageQueue>,
    pub results: Arc<dyn MessageQueue>,
    pub archive: Arc<dyn MessageQueue>,
    pub restore: Arc<dyn MessageQueue>,
    pub thaw: Arc<dyn MessageQueue>,
}

/// Every backend a worker may need.
#[derive(Clone)]
pub struct Services {
    pub config: PipelineConfig,
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub archive: Arc<dyn ColdArchive>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub bus: Arc<FanoutBus>,
    pub queues: Queues,
}

/// Concrete in-memory backends behind [`Services::in_memory`], for tests to
/// seed and inspect.
#[derive(Clone)]
pub struct InMemoryBackends {
    pub jobs: Arc<InMemoryJobStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub archive: Arc<InMemoryArchive>,
    pub profiles: Arc<InMemoryProfiles>,
    pub requests: Arc<InMemoryQueue>,
    pub results: Arc<InMemoryQueue>,
    pub archive_queue: Arc<InMemoryQueue>,
    pub restore: Arc<InMemoryQueue>,
    pub thaw: Arc<InMemoryQueue>,
    pub dead_letters: Arc<InMemoryQueue>,
}

/// Each topic feeds the queue of the same role. The results queue is read by
/// the user-notification consumer outside this pipeline.
fn wire_bus(config: &PipelineConfig, queues: &Queues) -> Result<FanoutBus, ServicesError> {
    let bus = FanoutBus::new();
    bus.subscribe(config.topics.requests.clone(), queues.requests.clone())?;
    bus.subscribe(config.topics.results.clone(), queues.results.clone())?;
    bus.subscribe(config.topics.archive.clone(), queues.archive.clone())?;
    Ok(bus)
}

impl Services {
    /// Connect to Redis and the filesystem stores.
    ///
    /// `consumer` identifies this process within each queue's consumer group.
    pub fn connect(config: &PipelineConfig, consumer: &str) -> Result<Self, ServicesError> {
        let client = Arc::new(redis::Client::open(config.redis_url.as_str())?);
        let ns = config.namespace.as_str();

        let queue = |name: &str, redrive: bool| -> Arc<dyn MessageQueue> {
            let mut q = RedisStreamsQueue::new(client.clone(), name, consumer)
                .with_namespace(ns)
                .with_visibility_timeout(config.visibility_timeout);
            if redrive {
                let dlq = RedisStreamsQueue::new(client.clone(), QueueNames::dead_letter(name), consumer)
                    .with_namespace(ns);
                q = q.with_redrive(RedrivePolicy::new(config.max_receive_count, Arc::new(dlq)));
            }
            Arc::new(q)
        };

        // Thaw messages are retained while retrievals are in progress, so
        // they must not count toward a redrive limit.
        let queues = Queues {
            requests: queue(&config.queues.requests, true),
            results: queue(&config.queues.results, true),
            archive: queue(&config.queues.archive, true),
            restore: queue(&config.queues.restore, true),
            thaw: queue(&config.queues.thaw, false),
        };
        let bus = wire_bus(config, &queues)?;

        Ok(Self {
            config: config.clone(),
            jobs: Arc::new(RedisJobStore::from_client(client.clone(), Some(config.namespace.clone()))),
            blobs: Arc::new(FsBlobStore::new(&config.blob_root)),
            archive: Arc::new(FsArchive::new(&config.archive_root, config.archive_retrieval_delay)),
            profiles: Arc::new(RedisProfiles::from_client(client, config.namespace.clone())),
            bus: Arc::new(bus),
            queues,
        })
    }

    /// Fully in-memory services. All queues share one dead-letter queue.
    pub fn in_memory(config: &PipelineConfig) -> Result<(Self, InMemoryBackends), ServicesError> {
        let dead_letters = Arc::new(InMemoryQueue::new("dead-letters"));
        let queue = |name: &str, redrive: bool| {
            let mut q = InMemoryQueue::new(name).with_visibility_timeout(config.visibility_timeout);
            if redrive {
                q = q.with_redrive(RedrivePolicy::new(config.max_receive_count, dead_letters.clone()));
            }
            Arc::new(q)
        };

        let backends = InMemoryBackends {
            jobs: InMemoryJobStore::arc(),
            blobs: Arc::new(InMemoryBlobStore::new()),
            archive: Arc::new(InMemoryArchive::new().with_retrieval_delay(config.archive_retrieval_delay)),
            profiles: Arc::new(InMemoryProfiles::new()),
            requests: queue(&config.queues.requests, true),
            results: queue(&config.queues.results, true),
            archive_queue: queue(&config.queues.archive, true),
            restore: queue(&config.queues.restore, true),
            thaw: queue(&config.queues.thaw, false),
            dead_letters: dead_letters.clone(),
        };

        let queues = Queues {
            requests: backends.requests.clone(),
            results: backends.results.clone(),
            archive: backends.archive_queue.clone(),
            restore: backends.restore.clone(),
            thaw: backends.thaw.clone(),
        };
        let bus = wire_bus(config, &queues)?;

        let services = Self {
            config: config.clone(),
            jobs: backends.jobs.clone(),
            blobs: backends.blobs.clone(),
            archive: backends.archive.clone(),
            profiles: backends.profiles.clone(),
            bus: Arc::new(bus),
            queues,
        };
        Ok((services, backends))
    }

    pub fn workspace(&self) -> JobWorkspace {
        JobWorkspace::new(&self.config.data_dir)
    }

    pub fn task_runner(&self, engine: Arc<dyn AnnotationEngine>) -> TaskRunner {
        TaskRunner::new(
            self.jobs.clone(),
            self.blobs.clone(),
            self.bus.clone(),
            engine,
            RunnerSettings {
                results_bucket: self.config.results_bucket.clone(),
                key_prefix: self.config.key_prefix.clone(),
                results_topic: self.config.topics.results.clone(),
                archive_topic: self.config.topics.archive.clone(),
                lease_ttl: self.config.lease_ttl,
                record_engine_failures: self.config.record_engine_failures,
            },
        )
    }

    pub fn dispatcher(&self, launcher: Arc<dyn TaskLauncher>) -> Dispatcher {
        Dispatcher::new(self.jobs.clone(), self.blobs.clone(), launcher, self.workspace())
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(
            self.jobs.clone(),
            self.blobs.clone(),
            self.archive.clone(),
            self.profiles.clone(),
            self.config.results_bucket.clone(),
        )
    }

    pub fn restore_requester(&self) -> RestoreRequester {
        RestoreRequester::new(
            self.jobs.clone(),
            self.archive.clone(),
            self.queues.thaw.clone(),
            self.config.results_bucket.clone(),
            self.config.key_prefix.clone(),
        )
    }

    pub fn thawer(&self) -> Thawer {
        Thawer::new(self.jobs.clone(), self.blobs.clone(), self.archive.clone())
    }

    pub fn poll_loop<H: MessageHandler>(&self, queue: Arc<dyn MessageQueue>, handler: H) -> PollLoop<H> {
        PollLoop::new(queue, handler, self.config.poll_wait)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use gas_events::{NotificationBus, unwrap_body};

    use super::*;

    #[test]
    fn every_topic_is_delivered_to_a_wired_queue() {
        let config = PipelineConfig::default();
        let (services, backends) = Services::in_memory(&config).unwrap();

        for (topic, queue) in [
            (&config.topics.requests, &backends.requests),
            (&config.topics.results, &backends.results),
            (&config.topics.archive, &backends.archive_queue),
        ] {
            services.bus.publish(topic, None, &json!({"topic": topic})).unwrap();
            let got = queue.receive(1, Duration::ZERO).unwrap();
            assert_eq!(got.len(), 1, "nothing delivered for {topic}");
            assert_eq!(unwrap_body(&got[0].body).unwrap(), json!({"topic": topic}));
        }
    }
}
