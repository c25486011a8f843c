use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::task::{Options, Task};

/// Plan name on a [`FoundUrl`] meaning "use the parent result's plan".
pub const INHERIT_PLAN: &str = "auto";

/// What a successful plan execution produces: the extraction result and
/// the candidate URLs for the next frontier, in discovery order.
pub type PlanOutput = (PlanResult, Vec<FoundUrl>);

/// Error returned by [`Plan::execute`].
///
/// `partial` is whatever the plan had filled in before failing (status code,
/// title). The worker forwards it to the result handler in place of an empty
/// result, so the error record describes the page the plan actually saw.
#[derive(Debug)]
pub struct PlanFailure {
    pub error: AppError,
    pub partial: Option<Box<PlanResult>>,
}

impl PlanFailure {
    pub fn with_partial(error: AppError, partial: PlanResult) -> Self {
        Self {
            error,
            partial: Some(Box::new(partial)),
        }
    }
}

impl From<AppError> for PlanFailure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// A named, site-specific extraction strategy.
///
/// Plans never see the queue or the record store. An `Err` from
/// [`execute`](Plan::execute) fails only the task at hand and is never
/// retried by the worker pool; internal retries are the plan's business.
#[async_trait]
pub trait Plan: Send + Sync {
    /// Stable identifier used for dispatch and for resolving [`FoundUrl::plan`].
    fn name(&self) -> &str;

    /// Whether this plan knows how to handle `url`.
    ///
    /// Dispatch is strictly by name; this is for classification only.
    fn matches(&self, url: &str) -> bool;

    async fn execute(&self, task: &Task) -> Result<PlanOutput, PlanFailure>;
}

/// Output of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub url: String,
    pub plan_name: String,
    pub depth: u32,
    pub max_depth: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default)]
    pub data: Options,
    #[serde(default)]
    pub status_code: u16,
    pub parsed_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanResult {
    /// Empty result stamped with the task's identity.
    pub fn for_task(task: &Task, plan_name: impl Into<String>) -> Self {
        Self {
            url: task.url.clone(),
            plan_name: plan_name.into(),
            depth: task.depth,
            max_depth: task.max_depth,
            title: String::new(),
            content: None,
            html: None,
            data: Options::new(),
            status_code: 0,
            parsed_at: Utc::now(),
            duration_ms: 0,
            error: None,
        }
    }

    /// Result describing a task that could not be extracted.
    pub fn failed(task: &Task, error: &AppError) -> Self {
        let mut result = Self::for_task(task, task.plan.clone());
        result.error = Some(error.to_string());
        result
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }
}

/// A candidate entry for the next crawl frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundUrl {
    pub url: String,
    /// Plan for the child task; empty or [`INHERIT_PLAN`] inherits the parent's.
    #[serde(default)]
    pub plan: String,
    /// Lower is more urgent. Advisory only.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub context: Options,
    pub found_at: DateTime<Utc>,
}

impl FoundUrl {
    pub fn new(url: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            plan: String::new(),
            priority: 0,
            kind: kind.into(),
            context: Options::new(),
            found_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Plan name the child task should run under.
    pub fn effective_plan<'a>(&'a self, parent_plan: &'a str) -> &'a str {
        if self.plan.is_empty() || self.plan == INHERIT_PLAN {
            parent_plan
        } else {
            &self.plan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_plan_inherits_when_empty_or_auto() {
        let empty = FoundUrl::new("https://a.test/1", "detail-page");
        let auto = FoundUrl::new("https://a.test/2", "detail-page").with_plan(INHERIT_PLAN);
        let explicit = FoundUrl::new("https://a.test/3", "detail-page").with_plan("other");

        assert_eq!(empty.effective_plan("parent"), "parent");
        assert_eq!(auto.effective_plan("parent"), "parent");
        assert_eq!(explicit.effective_plan("parent"), "other");
    }

    #[test]
    fn test_failed_result_carries_task_identity() {
        let task = Task::new("https://a.test", "missing", 2);
        let result = PlanResult::failed(&task, &AppError::PlanNotFound("missing".into()));

        assert_eq!(result.url, "https://a.test");
        assert_eq!(result.plan_name, "missing");
        assert_eq!(result.max_depth, 2);
        assert!(result.data.is_empty());
        assert_eq!(result.error.as_deref(), Some("Plan 'missing' not found"));
    }

    #[test]
    fn test_found_url_kind_serializes_as_type() {
        let found = FoundUrl::new("https://a.test/?p=2", "pagination").with_priority(2);
        let json = serde_json::to_value(&found).unwrap();
        assert_eq!(json["type"], "pagination");
        assert_eq!(json["priority"], 2);
    }
}
