//! Queue polling loop shared by every worker.
//!
//! Each worker is a single-threaded loop: long-poll one message, hand it to a
//! [`MessageHandler`], and delete it only when the handler says so. Handler
//! errors leave the message in the queue for redelivery and never stop the
//! loop.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use gas_events::{EnvelopeError, MessageQueue, QueueError, ReceivedMessage};
use gas_infra::{ArchiveError, BlobError, JobStoreError, ProfileError};

use crate::launcher::LaunchError;

const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What to do with a message once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing is finished (or was a duplicate); remove the message.
    Delete,
    /// Leave the message to become visible again after its timeout.
    Retain,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] EnvelopeError),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("{0}")]
    Other(String),
}

/// Processes one message at a time.
pub trait MessageHandler: Send {
    /// Worker name (used in logs and thread names).
    fn name(&self) -> &str;

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError>;
}

impl<H> MessageHandler for Box<H>
where
    H: MessageHandler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
        (**self).handle(message)
    }
}

/// Loop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub deleted: u64,
    pub retained: u64,
    pub failed: u64,
    pub receive_errors: u64,
}

/// Result of one poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// The wait elapsed without a message.
    Empty,
    Handled(Disposition),
    Failed(HandlerError),
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<LoopStats>>,
}

impl WorkerHandle {
    /// Current loop statistics.
    pub fn stats(&self) -> LoopStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The loop notices the request after its current receive returns.
    pub fn shutdown(mut self) -> LoopStats {
        let _ = self.shutdown.send(());
        self.wait()
    }

    /// Wait for the worker to stop on its own.
    pub fn join(mut self) -> LoopStats {
        self.wait()
    }

    fn wait(&mut self) -> LoopStats {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("worker thread panicked");
            }
        }
        self.stats()
    }
}

pub struct PollLoop<H> {
    queue: Arc<dyn MessageQueue>,
    handler: H,
    wait: Duration,
    error_backoff: Duration,
    stats: Arc<Mutex<LoopStats>>,
}

impl<H: MessageHandler> PollLoop<H> {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: H, wait: Duration) -> Self {
        Self {
            queue,
            handler,
            wait,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            stats: Arc::new(Mutex::new(LoopStats::default())),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, update: impl FnOnce(&mut LoopStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Receive and process at most one message.
    pub fn run_once(&mut self) -> Result<PollOutcome, QueueError> {
        let received = self.queue.receive(1, self.wait).inspect_err(|_| {
            self.record(|s| s.receive_errors += 1);
        })?;

        let Some(message) = received.into_iter().next() else {
            return Ok(PollOutcome::Empty);
        };
        self.record(|s| s.received += 1);

        let worker = self.handler.name().to_string();
        debug!(
            worker = %worker,
            message_id = %message.message_id,
            receive_count = message.receive_count,
            "message received"
        );

        match self.handler.handle(&message) {
            Ok(Disposition::Delete) => {
                // An expired receipt means the message will be seen again; the
                // handlers tolerate that.
                match self.queue.delete(&message.receipt) {
                    Ok(()) => self.record(|s| s.deleted += 1),
                    Err(err) => warn!(
                        worker = %worker,
                        message_id = %message.message_id,
                        error = %err,
                        "failed to delete message"
                    ),
                }
                Ok(PollOutcome::Handled(Disposition::Delete))
            }
            Ok(Disposition::Retain) => {
                self.record(|s| s.retained += 1);
                Ok(PollOutcome::Handled(Disposition::Retain))
            }
            Err(err) => {
                self.record(|s| s.failed += 1);
                warn!(
                    worker = %worker,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %err,
                    "message handler failed; leaving message for redelivery"
                );
                Ok(PollOutcome::Failed(err))
            }
        }
    }

    /// Poll until a shutdown request arrives (or its sender is dropped).
    pub fn run_until(&mut self, shutdown: &mpsc::Receiver<()>) {
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            if let Err(err) = self.run_once() {
                error!(worker = self.handler.name(), queue = self.queue.name(), error = %err, "receive failed");
                thread::sleep(self.error_backoff);
            }
        }
    }

    /// Poll until the process exits.
    pub fn run_forever(&mut self) {
        let (_keep_alive, shutdown) = mpsc::channel();
        self.run_until(&shutdown);
    }
}

impl<H> PollLoop<H>
where
    H: MessageHandler + 'static,
{
    /// Run the loop on a named background thread.
    pub fn spawn(mut self) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.handler.name().to_string())
            .spawn(move || self.run_until(&shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use gas_events::InMemoryQueue;

    use super::*;

    struct Scripted {
        outcomes: Vec<Result<Disposition, HandlerError>>,
        seen: Vec<String>,
    }

    impl MessageHandler for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
            self.seen.push(message.body.clone());
            self.outcomes.remove(0)
        }
    }

    fn scripted(outcomes: Vec<Result<Disposition, HandlerError>>) -> Scripted {
        Scripted { outcomes, seen: Vec::new() }
    }

    #[test]
    fn delete_and_retain_dispositions() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        queue.send("a").unwrap();
        queue.send("b").unwrap();

        let handler = scripted(vec![Ok(Disposition::Delete), Ok(Disposition::Retain)]);
        let mut poll = PollLoop::new(queue.clone(), handler, Duration::ZERO);

        assert!(matches!(poll.run_once().unwrap(), PollOutcome::Handled(Disposition::Delete)));
        assert!(matches!(poll.run_once().unwrap(), PollOutcome::Handled(Disposition::Retain)));
        assert!(matches!(poll.run_once().unwrap(), PollOutcome::Empty));

        assert_eq!(queue.bodies(), vec!["b".to_string()]);
        let stats = poll.stats();
        assert_eq!((stats.received, stats.deleted, stats.retained), (2, 1, 1));
    }

    #[test]
    fn handler_errors_do_not_stop_the_loop() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        queue.send("bad").unwrap();
        queue.send("good").unwrap();

        let handler = scripted(vec![
            Err(HandlerError::Other("boom".to_string())),
            Ok(Disposition::Delete),
        ]);
        let mut poll = PollLoop::new(queue.clone(), handler, Duration::ZERO);

        assert!(matches!(poll.run_once().unwrap(), PollOutcome::Failed(_)));
        assert!(matches!(poll.run_once().unwrap(), PollOutcome::Handled(_)));
        assert_eq!(poll.handler().seen, vec!["bad", "good"]);
        assert_eq!(queue.bodies(), vec!["bad".to_string()]);
        assert_eq!(poll.stats().failed, 1);
    }

    #[test]
    fn spawned_worker_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        let handler = scripted(vec![Ok(Disposition::Delete)]);
        let handle = PollLoop::new(queue.clone(), handler, Duration::from_millis(10))
            .spawn()
            .unwrap();

        queue.send("one").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handle.stats().deleted == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.shutdown();
        assert_eq!(stats.deleted, 1);
        assert!(queue.is_empty());
    }
}
