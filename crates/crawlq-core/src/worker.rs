use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::handler::ResultHandler;
use crate::plan::{PlanFailure, PlanResult};
use crate::queue::{Ack, Delivery, MessageQueue};
use crate::record::RecordStore;
use crate::registry::PlanRegistry;
use crate::task::Task;

/// Events emitted by the worker pool for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    MessageReceived {
        worker_id: &'a str,
    },
    MalformedMessage {
        worker_id: &'a str,
        error: &'a str,
    },
    TaskStarted {
        worker_id: &'a str,
        task: &'a Task,
    },
    PlanNotFound {
        worker_id: &'a str,
        url: &'a str,
        plan: &'a str,
    },
    TaskCompleted {
        worker_id: &'a str,
        url: &'a str,
        published: usize,
    },
    TaskFailed {
        worker_id: &'a str,
        url: &'a str,
        plan: &'a str,
        error: &'a str,
        ack: Ack,
    },
    AckFailed {
        worker_id: &'a str,
        ack: Ack,
        error: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync + 'static {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::MessageReceived { worker_id } => {
                tracing::debug!(%worker_id, "Message received");
            }
            WorkerEvent::MalformedMessage { worker_id, error } => {
                tracing::warn!(%worker_id, %error, "Rejecting malformed message");
            }
            WorkerEvent::TaskStarted { worker_id, task } => {
                tracing::info!(
                    %worker_id,
                    url = %task.url,
                    plan = %task.plan,
                    depth = task.depth,
                    max_depth = task.max_depth,
                    "Processing task"
                );
            }
            WorkerEvent::PlanNotFound {
                worker_id,
                url,
                plan,
            } => {
                tracing::warn!(%worker_id, %url, %plan, "No plan registered, rejecting");
            }
            WorkerEvent::TaskCompleted {
                worker_id,
                url,
                published,
            } => {
                tracing::info!(%worker_id, %url, %published, "Task completed");
            }
            WorkerEvent::TaskFailed {
                worker_id,
                url,
                plan,
                error,
                ack,
            } => {
                tracing::warn!(%worker_id, %url, %plan, %error, %ack, "Task failed");
            }
            WorkerEvent::AckFailed {
                worker_id,
                ack,
                error,
            } => {
                tracing::error!(%worker_id, %ack, %error, "Failed to acknowledge message");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers sharing the inbound channel.
    pub workers: usize,
    /// Deadline for a single plan execution. `None` waits forever.
    pub plan_timeout: Option<Duration>,
    pub worker_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            plan_timeout: None,
            worker_prefix: format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = Some(timeout);
        self
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }
}

/// Fixed-size set of workers competing for deliveries on one inbound channel.
///
/// Each message runs deserialize → resolve plan → execute → acknowledge,
/// and receives exactly one acknowledgement.
#[derive(Clone)]
pub struct WorkerPool<S, Q>
where
    S: RecordStore,
    Q: MessageQueue,
{
    registry: Arc<PlanRegistry>,
    handler: ResultHandler<S, Q>,
    config: WorkerConfig,
}

impl<S, Q> WorkerPool<S, Q>
where
    S: RecordStore,
    Q: MessageQueue,
{
    pub fn new(registry: Arc<PlanRegistry>, handler: ResultHandler<S, Q>, config: WorkerConfig) -> Self {
        Self {
            registry,
            handler,
            config,
        }
    }

    /// Run all workers until `cancel` fires or the inbound channel closes.
    ///
    /// Cancellation is observed between messages; a worker finishes the
    /// message it holds before stopping.
    pub async fn run<D, WR>(
        &self,
        inbound: mpsc::Receiver<D>,
        cancel: CancellationToken,
        reporter: Arc<WR>,
    ) -> Result<(), AppError>
    where
        D: Delivery,
        WR: WorkerReporter,
    {
        let inbound = Arc::new(Mutex::new(inbound));
        let mut workers = JoinSet::new();

        for i in 0..self.config.workers.max(1) {
            let pool = self.clone();
            let inbound = Arc::clone(&inbound);
            let cancel = cancel.clone();
            let reporter = Arc::clone(&reporter);
            let worker_id = format!("{}-{}", self.config.worker_prefix, i);
            workers.spawn(async move {
                pool.worker_loop(&worker_id, &inbound, &cancel, reporter.as_ref())
                    .await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task aborted");
            }
        }

        Ok(())
    }

    async fn worker_loop<D, WR>(
        &self,
        worker_id: &str,
        inbound: &Mutex<mpsc::Receiver<D>>,
        cancel: &CancellationToken,
        reporter: &WR,
    ) where
        D: Delivery,
        WR: WorkerReporter,
    {
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = {
                let mut rx = inbound.lock().await;
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    delivery = rx.recv() => delivery,
                }
            };
            let Some(delivery) = next else {
                break;
            };

            reporter.report(WorkerEvent::MessageReceived { worker_id });
            let ack = self.process(worker_id, delivery.body(), reporter).await;
            if let Err(e) = ack.apply(delivery).await {
                let error = e.to_string();
                reporter.report(WorkerEvent::AckFailed {
                    worker_id,
                    ack,
                    error: &error,
                });
            }
        }

        reporter.report(WorkerEvent::Stopped { worker_id });
    }

    /// Run one message body through the pipeline and decide its acknowledgement.
    pub async fn process<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        body: &[u8],
        reporter: &WR,
    ) -> Ack {
        // 1. Deserialize
        let task = match Task::from_message(body) {
            Ok(task) => task,
            Err(e) => {
                let error = e.to_string();
                reporter.report(WorkerEvent::MalformedMessage {
                    worker_id,
                    error: &error,
                });
                return Ack::Reject;
            }
        };
        reporter.report(WorkerEvent::TaskStarted {
            worker_id,
            task: &task,
        });

        // 2. Resolve plan
        let plan = match self.registry.get(&task.plan) {
            Ok(plan) => plan,
            Err(e) => {
                reporter.report(WorkerEvent::PlanNotFound {
                    worker_id,
                    url: &task.url,
                    plan: &task.plan,
                });
                let result = PlanResult::failed(&task, &e);
                let _ = self.handler.handle_result(result, Vec::new(), Some(e)).await;
                return Ack::Reject;
            }
        };

        // 3. Execute
        let started = Instant::now();
        let outcome = match self.config.plan_timeout {
            None => plan.execute(&task).await,
            Some(limit) => match tokio::time::timeout(limit, plan.execute(&task)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let e = AppError::Timeout(duration_ms(limit));
                    let error = e.to_string();
                    let mut result = PlanResult::failed(&task, &e);
                    result.duration_ms = elapsed_ms(started);
                    let _ = self.handler.handle_result(result, Vec::new(), Some(e)).await;
                    reporter.report(WorkerEvent::TaskFailed {
                        worker_id,
                        url: &task.url,
                        plan: &task.plan,
                        error: &error,
                        ack: Ack::Reject,
                    });
                    return Ack::Reject;
                }
            },
        };

        let (result, found_urls, err) = match outcome {
            Ok((mut result, found_urls)) => {
                stamp_result(&mut result, &task, started);
                (result, found_urls, None)
            }
            Err(PlanFailure { error, partial }) => {
                let mut result = match partial {
                    Some(partial) => *partial,
                    None => PlanResult::failed(&task, &error),
                };
                if result.url.is_empty() {
                    result.url = task.url.clone();
                }
                result.error = Some(error.to_string());
                stamp_result(&mut result, &task, started);
                (result, Vec::new(), Some(error))
            }
        };
        let extraction_failed = err.is_some();

        // 4. Acknowledge
        match self.handler.handle_result(result, found_urls, err).await {
            Ok(published) => {
                reporter.report(WorkerEvent::TaskCompleted {
                    worker_id,
                    url: &task.url,
                    published,
                });
                Ack::Success
            }
            Err(e) => {
                // A failed extraction is recorded and final; only handler
                // failures are retried.
                let ack = if extraction_failed {
                    Ack::Success
                } else if e.is_permanent() {
                    Ack::Reject
                } else {
                    Ack::TryAgain
                };
                let error = e.to_string();
                reporter.report(WorkerEvent::TaskFailed {
                    worker_id,
                    url: &task.url,
                    plan: &task.plan,
                    error: &error,
                    ack,
                });
                ack
            }
        }
    }
}

/// The task is the source of truth for depth and ceiling.
fn stamp_result(result: &mut PlanResult, task: &Task, started: Instant) {
    result.depth = task.depth;
    result.max_depth = task.max_depth;
    if result.plan_name.is_empty() {
        result.plan_name = task.plan.clone();
    }
    result.duration_ms = elapsed_ms(started);
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
