pub mod error;
pub mod handler;
pub mod plan;
pub mod queue;
pub mod record;
pub mod registry;
pub mod task;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod traits;
pub mod worker;

pub use error::AppError;
pub use handler::{ResultHandler, expand_frontier};
pub use plan::{FoundUrl, INHERIT_PLAN, Plan, PlanFailure, PlanOutput, PlanResult};
pub use queue::{Ack, Delivery, MessageQueue};
pub use record::{CompareOp, Condition, Filter, FindOptions, Record, RecordStore, SortOrder, compute_hash};
pub use registry::PlanRegistry;
pub use task::{Options, Task, TaskStatus};
pub use traits::{Fetcher, Page};
pub use worker::{TracingWorkerReporter, WorkerConfig, WorkerEvent, WorkerPool, WorkerReporter};
