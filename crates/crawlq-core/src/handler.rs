use chrono::Utc;

use crate::error::AppError;
use crate::plan::{FoundUrl, PlanResult};
use crate::queue::MessageQueue;
use crate::record::{Record, RecordStore};
use crate::task::{Task, TaskStatus};

/// Turns one extraction outcome into a persisted record plus the next
/// frontier of tasks on the queue.
#[derive(Clone)]
pub struct ResultHandler<S, Q>
where
    S: RecordStore,
    Q: MessageQueue,
{
    store: S,
    queue: Q,
    queue_name: String,
}

impl<S, Q> ResultHandler<S, Q>
where
    S: RecordStore,
    Q: MessageQueue,
{
    pub fn new(store: S, queue: Q, queue_name: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Persist the outcome and publish its children.
    ///
    /// With `err` set, an error record is written and `err` is returned
    /// unchanged, even if that write fails. Output that fails validation is
    /// recorded the same way as an `InvalidPlanOutput` error. Otherwise the
    /// success record must be stored before any child task is published.
    /// Returns the number of child tasks published.
    pub async fn handle_result(
        &self,
        result: PlanResult,
        found_urls: Vec<FoundUrl>,
        err: Option<AppError>,
    ) -> Result<usize, AppError> {
        if let Some(err) = err {
            return Err(self.handle_error(&result, err).await);
        }

        if let Err(invalid) = validate_output(&result, &found_urls) {
            return Err(self.handle_error(&result, invalid).await);
        }

        let record = Record::from_result(&result, &found_urls);
        let record_id = self
            .store
            .create(&record)
            .await
            .map_err(|e| AppError::PersistFailed {
                url: result.url.clone(),
                source: Box::new(e),
            })?;

        let tasks = expand_frontier(&result, &found_urls);
        self.send_tasks(&tasks).await?;

        tracing::info!(
            url = %result.url,
            plan = %result.plan_name,
            depth = result.depth,
            %record_id,
            links = found_urls.len(),
            published = tasks.len(),
            duration_ms = result.duration_ms,
            "Result stored"
        );

        Ok(tasks.len())
    }

    async fn handle_error(&self, result: &PlanResult, err: AppError) -> AppError {
        let record = Record::from_error(result, &err);
        if let Err(save_err) = self.store.create(&record).await {
            tracing::error!(
                url = %result.url,
                plan = %result.plan_name,
                error = %save_err,
                "Failed to store error record"
            );
        }

        tracing::error!(url = %result.url, plan = %result.plan_name, error = %err, "Extraction failed");
        err
    }

    /// Publish in discovery order, stopping at the first failure.
    /// Tasks already sent stay on the queue.
    async fn send_tasks(&self, tasks: &[Task]) -> Result<(), AppError> {
        for task in tasks {
            let body = task.to_message()?;
            self.queue
                .publish(&self.queue_name, &body, true)
                .await
                .map_err(|e| AppError::PublishFailed {
                    url: task.url.clone(),
                    source: Box::new(e),
                })?;
            tracing::debug!(url = %task.url, plan = %task.plan, depth = task.depth, "Task enqueued");
        }
        Ok(())
    }
}

/// Child tasks for the found URLs that still fit under the depth ceiling.
///
/// Children sit one level below the parent and inherit its `max_depth`;
/// when that level exceeds the ceiling nothing is produced.
pub fn expand_frontier(result: &PlanResult, found_urls: &[FoundUrl]) -> Vec<Task> {
    let Some(depth) = result.depth.checked_add(1) else {
        return Vec::new();
    };
    if depth > result.max_depth {
        return Vec::new();
    }

    let now = Utc::now();
    found_urls
        .iter()
        .map(|found| Task {
            url: found.url.clone(),
            plan: found.effective_plan(&result.plan_name).to_string(),
            depth,
            max_depth: result.max_depth,
            parent_url: Some(result.url.clone()),
            options: found.context.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            retry_count: 0,
        })
        .collect()
}

fn validate_output(result: &PlanResult, found_urls: &[FoundUrl]) -> Result<(), AppError> {
    if result.url.trim().is_empty() {
        return Err(AppError::InvalidPlanOutput("result has an empty url".into()));
    }
    if result.plan_name.trim().is_empty() {
        return Err(AppError::InvalidPlanOutput(format!(
            "result for {} has no plan name",
            result.url
        )));
    }
    for found in found_urls {
        if let Err(e) = url::Url::parse(&found.url) {
            return Err(AppError::InvalidPlanOutput(format!(
                "found url '{}' is not absolute: {e}",
                found.url
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::INHERIT_PLAN;
    use crate::testutil::{MockQueue, MockRecordStore, make_test_result};
    use serde_json::json;

    const QUEUE: &str = "crawl";

    fn handler(store: &MockRecordStore, queue: &MockQueue) -> ResultHandler<MockRecordStore, MockQueue> {
        ResultHandler::new(store.clone(), queue.clone(), QUEUE)
    }

    fn front_page(max_depth: u32) -> (PlanResult, Vec<FoundUrl>) {
        let mut result = make_test_result("https://news.ycombinator.com/", "hackernews");
        result.max_depth = max_depth;
        result.insert("post_count", json!(30));

        let mut found: Vec<FoundUrl> = (1..=29)
            .map(|i| {
                FoundUrl::new(format!("https://news.ycombinator.com/item?id={i}"), "comments")
                    .with_plan("hackernews")
                    .with_priority(1)
                    .with_context("post_id", json!(i.to_string()))
            })
            .collect();
        found.push(
            FoundUrl::new("https://news.ycombinator.com/?p=2", "pagination").with_priority(2),
        );
        (result, found)
    }

    #[tokio::test]
    async fn test_publishes_children_within_depth() {
        let store = MockRecordStore::empty();
        let queue = MockQueue::new();
        let (result, found) = front_page(1);

        let published = handler(&store, &queue)
            .handle_result(result, found, None)
            .await
            .unwrap();

        assert_eq!(published, 30);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records()[0].data["post_count"], 30);

        let tasks = queue.published_tasks(QUEUE);
        assert_eq!(tasks.len(), 30);
        assert!(tasks.iter().all(|t| t.depth == 1 && t.max_depth == 1));
        assert!(tasks.iter().all(|t| t.depth <= t.max_depth));
        assert_eq!(tasks[0].url, "https://news.ycombinator.com/item?id=1");
        assert_eq!(tasks[0].options["post_id"], "1");
        assert_eq!(tasks[29].url, "https://news.ycombinator.com/?p=2");
        assert_eq!(
            tasks[29].parent_url.as_deref(),
            Some("https://news.ycombinator.com/")
        );
    }

    #[tokio::test]
    async fn test_max_depth_zero_publishes_nothing() {
        let store = MockRecordStore::empty();
        let queue = MockQueue::new();
        let (result, found) = front_page(0);

        let published = handler(&store, &queue)
            .handle_result(result, found, None)
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert_eq!(store.records().len(), 1);
        assert!(queue.published_tasks(QUEUE).is_empty());
    }

    #[test]
    fn test_children_inherit_plan() {
        let result = make_test_result("https://a.test/", "parent-plan");
        let found = vec![
            FoundUrl::new("https://a.test/1", "detail-page"),
            FoundUrl::new("https://a.test/2", "detail-page").with_plan(INHERIT_PLAN),
            FoundUrl::new("https://a.test/3", "detail-page").with_plan("other"),
        ];

        let tasks = expand_frontier(&result, &found);
        let plans: Vec<_> = tasks.iter().map(|t| t.plan.as_str()).collect();
        assert_eq!(plans, vec!["parent-plan", "parent-plan", "other"]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let store = MockRecordStore::with_create_error(AppError::DatabaseError("down".into()));
        let queue = MockQueue::new();
        let (result, found) = front_page(1);

        let err = handler(&store, &queue)
            .handle_result(result, found, None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PersistFailed { .. }));
        assert!(err.is_retryable());
        assert!(queue.published_tasks(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_extraction_error_writes_error_record_and_returns_it() {
        let store = MockRecordStore::empty();
        let queue = MockQueue::new();
        let result = make_test_result("https://a.test/missing", "x");

        let err = handler(&store, &queue)
            .handle_result(result, vec![], Some(AppError::HttpError("HTTP 404".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::HttpError(ref m) if m == "HTTP 404"));
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://a.test/missing");
        assert_eq!(records[0].error.as_deref(), Some("HTTP error: HTTP 404"));
        assert!(queue.published_tasks(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_mask_extraction_error() {
        let store = MockRecordStore::with_create_error(AppError::DatabaseError("down".into()));
        let queue = MockQueue::new();
        let result = make_test_result("https://a.test/", "x");

        let err = handler(&store, &queue)
            .handle_result(result, vec![], Some(AppError::ParseError("no posts".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_publish_failure_stops_and_names_url() {
        let store = MockRecordStore::empty();
        let queue = MockQueue::failing_at(2, AppError::QueueError("connection closed".into()));
        let result = make_test_result("https://a.test/", "x");
        let found = vec![
            FoundUrl::new("https://a.test/1", "detail-page"),
            FoundUrl::new("https://a.test/2", "detail-page"),
            FoundUrl::new("https://a.test/3", "detail-page"),
        ];

        let err = handler(&store, &queue)
            .handle_result(result, found, None)
            .await
            .unwrap_err();

        match &err {
            AppError::PublishFailed { url, .. } => assert_eq!(url, "https://a.test/2"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        let sent = queue.published_tasks(QUEUE);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://a.test/1");
    }

    #[tokio::test]
    async fn test_relative_found_url_is_invalid_output() {
        let store = MockRecordStore::empty();
        let queue = MockQueue::new();
        let result = make_test_result("https://a.test/", "x");
        let found = vec![FoundUrl::new("/relative/path", "detail-page")];

        let err = handler(&store, &queue)
            .handle_result(result, found, None)
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://a.test/");
        assert!(records[0].links.is_empty());
        assert!(records[0].error.as_deref().unwrap().contains("/relative/path"));
        assert!(queue.published_tasks(QUEUE).is_empty());
    }
}
