pub mod fetcher;
pub mod hackernews;

use std::sync::Arc;

use crawlq_core::error::AppError;
use crawlq_core::registry::PlanRegistry;
use crawlq_core::traits::Fetcher;

pub use fetcher::ReqwestFetcher;
pub use hackernews::HackerNewsPlan;

/// Register every built-in plan, all sharing `fetcher`.
pub fn register_builtin<F: Fetcher>(registry: &PlanRegistry, fetcher: F) -> Result<(), AppError> {
    registry.register(Arc::new(HackerNewsPlan::new(fetcher)?))?;
    Ok(())
}
