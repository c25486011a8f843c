//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::plan::{FoundUrl, Plan, PlanFailure, PlanOutput, PlanResult};
use crate::queue::{Ack, Delivery, MessageQueue};
use crate::record::{FindOptions, Filter, Record, RecordStore, SortOrder};
use crate::task::Task;
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockPlan
// ---------------------------------------------------------------------------

/// Mock plan with queued or default outputs.
#[derive(Clone)]
pub struct MockPlan {
    name: String,
    pattern: Option<String>,
    /// Queue of outputs. Each call pops the first element; when empty the
    /// plan returns an empty result for the task.
    outputs: Arc<Mutex<Vec<PlanOutput>>>,
    failure: Option<String>,
    partial: Option<PlanResult>,
    delay: Option<Duration>,
    pub executed: Arc<Mutex<Vec<Task>>>,
}

impl MockPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            outputs: Arc::new(Mutex::new(Vec::new())),
            failure: None,
            partial: None,
            delay: None,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Match URLs containing `pattern`.
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_output(self, result: PlanResult, found: Vec<FoundUrl>) -> Self {
        self.outputs.lock().unwrap().push((result, found));
        self
    }

    /// Every execution fails with an HTTP error carrying `message`.
    pub fn always_failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Failures hand `partial` back alongside the error.
    pub fn failing_with_partial(mut self, message: impl Into<String>, partial: PlanResult) -> Self {
        self.failure = Some(message.into());
        self.partial = Some(partial);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Plan for MockPlan {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, url: &str) -> bool {
        self.pattern.as_deref().is_some_and(|p| url.contains(p))
    }

    async fn execute(&self, task: &Task) -> Result<PlanOutput, PlanFailure> {
        self.executed.lock().unwrap().push(task.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            let error = AppError::HttpError(message.clone());
            return Err(match &self.partial {
                Some(partial) => PlanFailure::with_partial(error, partial.clone()),
                None => error.into(),
            });
        }

        let mut outputs = self.outputs.lock().unwrap();
        if outputs.is_empty() {
            Ok((PlanResult::for_task(task, self.name.clone()), Vec::new()))
        } else {
            Ok(outputs.remove(0))
        }
    }
}

// ---------------------------------------------------------------------------
// MockRecordStore
// ---------------------------------------------------------------------------

/// In-memory record store with an optional one-shot create failure.
#[derive(Clone)]
pub struct MockRecordStore {
    records: Arc<Mutex<Vec<Record>>>,
    create_error: Arc<Mutex<Option<AppError>>>,
}

impl MockRecordStore {
    pub fn empty() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            create_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Store whose next `create` fails with `error`.
    pub fn with_create_error(error: AppError) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            create_error: Arc::new(Mutex::new(Some(error))),
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordStore for MockRecordStore {
    async fn create(&self, record: &Record) -> Result<String, AppError> {
        if let Some(e) = self.create_error.lock().unwrap().take() {
            return Err(e);
        }
        let mut record = record.clone();
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        self.records.lock().unwrap().push(record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, AppError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn update(&self, record: &Record) -> Result<(), AppError> {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(AppError::RecordNotFound(record.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(AppError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Record>, AppError> {
        let mut found: Vec<Record> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        if !options.sort.is_empty() {
            found.sort_by(|a, b| {
                let (a, b) = (serde_json::to_value(a).unwrap(), serde_json::to_value(b).unwrap());
                options
                    .sort
                    .iter()
                    .map(|(field, order)| {
                        let ordering = cmp_json(&a[field.as_str()], &b[field.as_str()]);
                        match order {
                            SortOrder::Asc => ordering,
                            SortOrder::Desc => ordering.reverse(),
                        }
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map_or(usize::MAX, |l| l as usize);
        Ok(found.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, AppError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|r| filter.matches(r)).cloned())
    }

    async fn count(&self, filter: &Filter) -> Result<u64, AppError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().filter(|r| filter.matches(r)).count() as u64)
    }
}

fn cmp_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

// ---------------------------------------------------------------------------
// MockDelivery
// ---------------------------------------------------------------------------

/// Shared log of acknowledgements applied to one [`MockDelivery`].
pub type AckLog = Arc<Mutex<Vec<Ack>>>;

/// Delivery that records which acknowledgement it received.
pub struct MockDelivery {
    body: Vec<u8>,
    log: AckLog,
}

impl MockDelivery {
    pub fn new(body: Vec<u8>) -> (Self, AckLog) {
        let log: AckLog = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                body,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl Delivery for MockDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn success(self) -> Result<(), AppError> {
        self.log.lock().unwrap().push(Ack::Success);
        Ok(())
    }

    async fn try_again(self) -> Result<(), AppError> {
        self.log.lock().unwrap().push(Ack::TryAgain);
        Ok(())
    }

    async fn reject(self) -> Result<(), AppError> {
        self.log.lock().unwrap().push(Ack::Reject);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockQueue
// ---------------------------------------------------------------------------

/// Recorded publish: (queue, body, persistent).
pub type PublishedMessage = (String, Vec<u8>, bool);

/// Mock queue that records publishes and replays seeded deliveries.
#[derive(Clone)]
pub struct MockQueue {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub declared: Arc<Mutex<Vec<String>>>,
    /// 1-based publish call that fails, with its error.
    fail_at: Arc<Mutex<Option<(usize, AppError)>>>,
    calls: Arc<Mutex<usize>>,
    pending: Arc<Mutex<Vec<MockDelivery>>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            declared: Arc::new(Mutex::new(Vec::new())),
            fail_at: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue whose `call`-th publish (1-based) fails with `error`.
    pub fn failing_at(call: usize, error: AppError) -> Self {
        let queue = Self::new();
        *queue.fail_at.lock().unwrap() = Some((call, error));
        queue
    }

    /// Queue that hands out `deliveries` to the next consumer.
    pub fn with_deliveries(deliveries: Vec<MockDelivery>) -> Self {
        let queue = Self::new();
        *queue.pending.lock().unwrap() = deliveries;
        queue
    }

    /// Decode every body published to `queue` as a task.
    pub fn published_tasks(&self, queue: &str) -> Vec<Task> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, body, _)| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

impl Default for MockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue for MockQueue {
    type Delivery = MockDelivery;

    async fn declare_queue(&self, queue: &str) -> Result<(), AppError> {
        let mut declared = self.declared.lock().unwrap();
        if !declared.iter().any(|q| q == queue) {
            declared.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<(), AppError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        let mut fail_at = self.fail_at.lock().unwrap();
        if fail_at.as_ref().is_some_and(|(n, _)| *n == call) {
            if let Some((_, e)) = fail_at.take() {
                return Err(e);
            }
        }
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), body.to_vec(), persistent));
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<MockDelivery>, AppError> {
        let pending: Vec<MockDelivery> = self.pending.lock().unwrap().drain(..).collect();
        let (tx, rx) = mpsc::channel(pending.len().max(1));
        for delivery in pending {
            tx.try_send(delivery)
                .map_err(|e| AppError::QueueError(e.to_string()))?;
        }
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records events.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::MessageReceived { .. } => "MessageReceived",
            WorkerEvent::MalformedMessage { .. } => "MalformedMessage",
            WorkerEvent::TaskStarted { .. } => "TaskStarted",
            WorkerEvent::PlanNotFound { .. } => "PlanNotFound",
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted",
            WorkerEvent::TaskFailed { .. } => "TaskFailed",
            WorkerEvent::AckFailed { .. } => "AckFailed",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a dummy root Task for testing.
pub fn make_test_task() -> Task {
    Task::new("https://example.com", "test_plan", 1)
}

/// Create an empty successful PlanResult at depth 0 with `max_depth` 1.
pub fn make_test_result(url: &str, plan: &str) -> PlanResult {
    let mut task = Task::new(url, plan, 1);
    task.depth = 0;
    PlanResult::for_task(&task, plan)
}
