use std::future::Future;
use std::sync::Arc;

use catalog_core::{CatalogClient, CatalogError};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::mirror::{
    ExactKey, MirrorError, MirrorStore, ProductView, QueryKind, classify_query, normalize_batch,
};

/// Remote lookups used when the mirror has no answer.
pub trait RemoteFetch: Send + Sync {
    fn by_barcode(
        &self,
        barcode: &str,
    ) -> impl Future<Output = Result<Option<Value>, CatalogError>> + Send;

    fn by_sku(&self, sku: &str) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send;

    fn by_query(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send;
}

impl RemoteFetch for CatalogClient {
    fn by_barcode(
        &self,
        barcode: &str,
    ) -> impl Future<Output = Result<Option<Value>, CatalogError>> + Send {
        self.fetch_by_barcode(barcode)
    }

    fn by_sku(&self, sku: &str) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send {
        self.fetch_by_sku(sku)
    }

    fn by_query(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send {
        self.fetch_by_query(query)
    }
}

impl<T: RemoteFetch> RemoteFetch for Arc<T> {
    fn by_barcode(
        &self,
        barcode: &str,
    ) -> impl Future<Output = Result<Option<Value>, CatalogError>> + Send {
        (**self).by_barcode(barcode)
    }

    fn by_sku(&self, sku: &str) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send {
        (**self).by_sku(sku)
    }

    fn by_query(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<Value>, CatalogError>> + Send {
        (**self).by_query(query)
    }
}

/// Local-first product search with remote fallback and backfill.
///
/// Exact keys (barcode, SKU) go to the network only on a local miss. Free
/// text falls back to the network only for the first page; later pages trust
/// the mirror.
pub struct SearchResolver<R> {
    store: MirrorStore,
    remote: Option<R>,
}

impl<R: RemoteFetch> SearchResolver<R> {
    pub fn new(store: MirrorStore, remote: R) -> Self {
        Self {
            store,
            remote: Some(remote),
        }
    }

    pub fn local_only(store: MirrorStore) -> Self {
        Self {
            store,
            remote: None,
        }
    }

    pub async fn search(&self, query: &str, page: u32) -> Result<Vec<ProductView>, MirrorError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        match classify_query(query) {
            QueryKind::Barcode => self.exact(ExactKey::Barcode, query).await,
            QueryKind::Sku => self.exact(ExactKey::Sku, query).await,
            QueryKind::Text => self.text(query, page.max(1)).await,
        }
    }

    async fn exact(&self, key: ExactKey, value: &str) -> Result<Vec<ProductView>, MirrorError> {
        let local = self.store.lookup_by_exact_key(key, value).await?;
        if !local.is_empty() {
            debug!(?key, value, hits = local.len(), "exact lookup served locally");
            return Ok(local.iter().map(|item| item.view()).collect());
        }
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };

        let fetched: Result<Vec<Value>, CatalogError> = match key {
            ExactKey::Barcode => remote
                .by_barcode(value)
                .await
                .map(|found| found.into_iter().collect()),
            ExactKey::Sku => remote.by_sku(value).await,
        };
        self.backfill(value, fetched).await
    }

    async fn text(&self, query: &str, page: u32) -> Result<Vec<ProductView>, MirrorError> {
        let local = self.store.text_search_page(query, page).await?;
        if !local.is_empty() || page > 1 {
            return Ok(local.iter().map(|item| item.view()).collect());
        }
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };
        let fetched = remote.by_query(query).await;
        self.backfill(query, fetched).await
    }

    async fn backfill(
        &self,
        query: &str,
        fetched: Result<Vec<Value>, CatalogError>,
    ) -> Result<Vec<ProductView>, MirrorError> {
        let raw = match fetched {
            Ok(raw) => raw,
            Err(err) => {
                warn!(query, "remote search fallback failed: {err}");
                return Ok(Vec::new());
            }
        };
        let items = normalize_batch(&raw);
        self.store.upsert_items(&items).await?;
        if !items.is_empty() {
            info!(query, backfilled = items.len(), "search results backfilled from remote");
        }
        Ok(items
            .iter()
            .filter(|item| !item.disabled)
            .map(ProductView::from)
            .collect())
    }
}

#[cfg(test)]
#[path = "search_tests.rs"]
mod tests;
