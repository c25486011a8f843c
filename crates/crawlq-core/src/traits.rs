use std::future::Future;

use crate::error::AppError;

/// A fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Final URL after redirects.
    pub url: String,
    pub status_code: u16,
    pub body: String,
}

/// Fetches raw HTML for plans.
pub trait Fetcher: Send + Sync + Clone + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Page, AppError>> + Send;
}
