use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::AppError;
use crate::plan::Plan;

/// Name-keyed set of extraction plans shared by all workers.
///
/// Registration usually happens once at startup while lookups run
/// continuously, so entries sit behind a reader-writer lock.
#[derive(Default)]
pub struct PlanRegistry {
    plans: RwLock<HashMap<String, Arc<dyn Plan>>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plan. Fails if its name is taken; the existing entry is kept.
    pub fn register(&self, plan: Arc<dyn Plan>) -> Result<(), AppError> {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        let name = plan.name().to_string();
        if plans.contains_key(&name) {
            return Err(AppError::DuplicatePlan(name));
        }
        tracing::debug!(plan = %name, "Plan registered");
        plans.insert(name, plan);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plan>, AppError> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::PlanNotFound(name.to_string()))
    }

    /// Snapshot of registered plan names, in no particular order.
    pub fn list(&self) -> Vec<String> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// A registered plan whose [`Plan::matches`] accepts `url`. Which one wins
    /// when several match is unspecified.
    pub fn find_for_url(&self, url: &str) -> Option<Arc<dyn Plan>> {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|plan| plan.matches(url))
            .cloned()
    }
}
