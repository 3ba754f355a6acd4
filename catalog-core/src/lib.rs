mod backoff;
mod client;
mod rate_limit;
mod window;

pub use backoff::Backoff;
pub use client::{
    ApiErrorClass, CatalogClient, CatalogError, ClientConfig, Page, SortOrder, extract_batch,
};
pub use rate_limit::RateLimiter;
pub use window::RequestWindow;
pub use reqwest::StatusCode;
