use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::plan::{FoundUrl, PlanResult};
use crate::task::Options;

/// Persisted, queryable form of one extraction outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque id; the store assigns one on create when empty.
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub domain: String,
    pub plan_name: String,
    pub depth: u32,
    #[serde(default)]
    pub data: Options,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the serialized `data`
    #[serde(default)]
    pub data_hash: String,
    pub parsed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Record for a successful extraction.
    pub fn from_result(result: &PlanResult, found_urls: &[FoundUrl]) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            url: result.url.clone(),
            domain: domain_of(&result.url),
            plan_name: result.plan_name.clone(),
            depth: result.depth,
            data_hash: hash_data(&result.data),
            data: result.data.clone(),
            links: found_urls.iter().map(|f| f.url.clone()).collect(),
            error: None,
            parsed_at: result.parsed_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for a failed extraction. Data holds only the error text.
    pub fn from_error(result: &PlanResult, error: &AppError) -> Self {
        let now = Utc::now();
        let message = error.to_string();
        let mut data = Options::new();
        data.insert("error".into(), Value::String(message.clone()));
        Self {
            id: String::new(),
            url: result.url.clone(),
            domain: domain_of(&result.url),
            plan_name: result.plan_name.clone(),
            depth: result.depth,
            data_hash: hash_data(&data),
            data,
            links: Vec::new(),
            error: Some(message),
            parsed_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn hash_data(data: &Options) -> String {
    compute_hash(&Value::Object(data.clone()).to_string())
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Comparison operator inside a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
        }
    }

    /// SQL spelling of the operator.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "IS DISTINCT FROM",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CompareOp {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('$') {
            "eq" => Ok(CompareOp::Eq),
            "ne" => Ok(CompareOp::Ne),
            "gt" => Ok(CompareOp::Gt),
            "gte" => Ok(CompareOp::Gte),
            "lt" => Ok(CompareOp::Lt),
            "lte" => Ok(CompareOp::Lte),
            other => Err(AppError::InvalidFilter(format!(
                "unknown operator '{other}'"
            ))),
        }
    }
}

/// Constraint on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Compare(Vec<(CompareOp, Value)>),
}

impl Condition {
    /// Flatten into `(op, value)` pairs.
    pub fn clauses(&self) -> Vec<(CompareOp, &Value)> {
        match self {
            Condition::Eq(v) => vec![(CompareOp::Eq, v)],
            Condition::Compare(ops) => ops.iter().map(|(op, v)| (*op, v)).collect(),
        }
    }
}

/// Field name to condition mapping; all conditions must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(field.into(), Condition::Eq(value.into()));
        self
    }

    pub fn compare(mut self, field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        let field = field.into();
        let mut ops = match self.conditions.remove(&field) {
            Some(Condition::Compare(ops)) => ops,
            Some(Condition::Eq(prev)) => vec![(CompareOp::Eq, prev)],
            None => Vec::new(),
        };
        ops.push((op, value.into()));
        self.conditions.insert(field, Condition::Compare(ops));
        self
    }

    /// Parse the document form `{"depth": {"gt": 0}, "plan_name": "hackernews"}`.
    ///
    /// A nested object is read as operator → value; anything else is equality.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let object = match value {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            _ => {
                return Err(AppError::InvalidFilter(
                    "filter must be a JSON object".into(),
                ));
            }
        };

        let mut filter = Self::new();
        for (field, condition) in object {
            match condition {
                Value::Object(ops) => {
                    if ops.is_empty() {
                        return Err(AppError::InvalidFilter(format!(
                            "no operators given for '{field}'"
                        )));
                    }
                    for (op, operand) in ops {
                        filter = filter.compare(field.clone(), op.parse()?, operand.clone());
                    }
                }
                literal => filter = filter.eq(field.clone(), literal.clone()),
            }
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Evaluate against a record. Unknown top-level fields are looked up in `data`.
    pub fn matches(&self, record: &Record) -> bool {
        let Ok(Value::Object(doc)) = serde_json::to_value(record) else {
            return false;
        };
        self.conditions.iter().all(|(field, condition)| {
            let actual = doc
                .get(field)
                .or_else(|| record.data.get(field))
                .unwrap_or(&Value::Null);
            condition
                .clauses()
                .into_iter()
                .all(|(op, expected)| match compare_values(actual, expected) {
                    Some(ordering) => op.holds(ordering),
                    None => op == CompareOp::Ne,
                })
        })
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// Sort direction for [`FindOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Paging and ordering for [`RecordStore::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub sort: Vec<(String, SortOrder)>,
}

impl FindOptions {
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }
}

/// Persists and queries extraction records.
pub trait RecordStore: Send + Sync + Clone + 'static {
    /// Insert a record, assigning an id when empty. Returns the id.
    fn create(&self, record: &Record) -> impl Future<Output = Result<String, AppError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Record>, AppError>> + Send;

    /// Replace the stored record with the same id.
    fn update(&self, record: &Record) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn find(
        &self,
        filter: &Filter,
        options: &FindOptions,
    ) -> impl Future<Output = Result<Vec<Record>, AppError>> + Send;

    fn find_one(
        &self,
        filter: &Filter,
    ) -> impl Future<Output = Result<Option<Record>, AppError>> + Send;

    fn count(&self, filter: &Filter) -> impl Future<Output = Result<u64, AppError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_test_result;
    use serde_json::json;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        assert_eq!(h1, compute_hash("hello world"));
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_hash("hello"));
    }

    #[test]
    fn test_success_record_from_result() {
        let mut result = make_test_result("https://news.ycombinator.com/news?p=2", "hackernews");
        result.insert("post_count", json!(30));
        let found = vec![FoundUrl::new("https://news.ycombinator.com/item?id=1", "comments")];

        let record = Record::from_result(&result, &found);
        assert_eq!(record.domain, "news.ycombinator.com");
        assert_eq!(record.data["post_count"], 30);
        assert_eq!(record.links, vec!["https://news.ycombinator.com/item?id=1"]);
        assert!(record.error.is_none());
        assert!(record.id.is_empty());
    }

    #[test]
    fn test_error_record_keeps_only_error_text() {
        let mut result = make_test_result("https://a.test/", "x");
        result.insert("partial", json!(true));
        let record = Record::from_error(&result, &AppError::HttpError("HTTP 404".into()));

        assert_eq!(record.error.as_deref(), Some("HTTP error: HTTP 404"));
        assert_eq!(record.data.len(), 1);
        assert_eq!(record.data["error"], "HTTP error: HTTP 404");
    }

    #[test]
    fn test_filter_from_json() {
        let filter =
            Filter::from_json(&json!({"depth": {"gt": 0, "lte": 2}, "plan_name": "hackernews"}))
                .unwrap();
        let expected = Filter::new()
            .compare("depth", CompareOp::Gt, 0)
            .compare("depth", CompareOp::Lte, 2)
            .eq("plan_name", "hackernews");
        assert_eq!(filter, expected);
    }

    #[test]
    fn test_filter_rejects_unknown_operator() {
        let err = Filter::from_json(&json!({"depth": {"near": 1}})).unwrap_err();
        assert!(matches!(err, AppError::InvalidFilter(_)));
        assert!(Filter::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_filter_matches_columns_and_data() {
        let mut result = make_test_result("https://a.test/", "hackernews");
        result.depth = 1;
        result.insert("post_count", json!(30));
        let record = Record::from_result(&result, &[]);

        assert!(Filter::new().eq("plan_name", "hackernews").matches(&record));
        assert!(Filter::new().compare("depth", CompareOp::Gte, 1).matches(&record));
        assert!(!Filter::new().compare("depth", CompareOp::Gt, 1).matches(&record));
        assert!(Filter::new().compare("post_count", CompareOp::Lt, 31).matches(&record));
        assert!(!Filter::new().eq("missing", "x").matches(&record));
        assert!(Filter::new().compare("missing", CompareOp::Ne, "x").matches(&record));
        assert!(Filter::new().matches(&record));
    }
}
