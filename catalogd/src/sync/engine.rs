use std::sync::Arc;

use catalog_core::{CatalogClient, CatalogError, SortOrder};
use futures_util::{TryStreamExt, pin_mut};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::mirror::{
    ItemInput, MirrorError, MirrorStore, SyncStatePatch, normalize_batch, now_unix,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upstream page size; a shorter page marks the end of the listing.
    pub page_size: usize,
    /// Pages re-checked per quick sync.
    pub audit_pages: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            audit_pages: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FullSyncReport {
    pub pages: u32,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickSyncReport {
    pub new: usize,
    pub updated: usize,
    pub checked: usize,
    pub next_audit_page: u32,
}

pub struct SyncEngine {
    client: Arc<CatalogClient>,
    store: MirrorStore,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(client: Arc<CatalogClient>, store: MirrorStore, config: SyncConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn client(&self) -> &Arc<CatalogClient> {
        &self.client
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Walks the whole catalog in ascending id order, resuming from the
    /// persisted page checkpoint when a previous run was interrupted.
    pub async fn full_sync(&self) -> Result<FullSyncReport, SyncError> {
        let state = self.store.sync_state().await?;
        let start_page = state.full_sync_next_page.max(1);
        info!(start_page, "full sync started");

        let pages = self.client.products_pages(SortOrder::IdAsc, start_page);
        pin_mut!(pages);

        let mut report = FullSyncReport::default();
        let mut max_seen = state.max_product_id_seen;
        while let Some(page) = pages.try_next().await? {
            let items = normalize_batch(&page.items);
            self.store.upsert_items(&items).await?;
            max_seen = items.iter().map(|item| item.id).fold(max_seen, i64::max);
            report.pages += 1;
            report.total += items.len();

            self.store
                .update_sync_state(&SyncStatePatch {
                    full_sync_next_page: Some(page.number + 1),
                    ..SyncStatePatch::default()
                })
                .await?;
            info!(
                page = page.number,
                items = items.len(),
                rpm = self.client.current_rpm(),
                "full sync page stored"
            );

            if page.items.len() < self.config.page_size {
                break;
            }
        }

        self.store
            .update_sync_state(&SyncStatePatch {
                last_full_sync_at: Some(now_unix()),
                full_sync_next_page: Some(1),
                max_product_id_seen: Some(max_seen),
                ..SyncStatePatch::default()
            })
            .await?;
        info!(
            pages = report.pages,
            total = report.total,
            max_product_id = max_seen,
            "full sync finished"
        );
        Ok(report)
    }

    /// Picks up items newer than the known watermark, then re-checks a
    /// rolling window of pages for edits.
    pub async fn quick_sync(&self) -> Result<QuickSyncReport, SyncError> {
        let state = self.store.sync_state().await?;
        let mut report = QuickSyncReport {
            new: self.discover_new_items(state.max_product_id_seen).await?,
            ..QuickSyncReport::default()
        };

        let mut page = state.next_audit_page.max(1);
        for _ in 0..self.config.audit_pages {
            let batch = self
                .client
                .fetch_products_page(page, SortOrder::IdAsc)
                .await?;
            if batch.is_empty() {
                page = 1;
                break;
            }

            let items = normalize_batch(&batch);
            let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
            let stored = self.store.checksums_for(&ids).await?;
            let changed: Vec<ItemInput> = items
                .into_iter()
                .filter(|item| stored.get(&item.id) != Some(&item.checksum()))
                .collect();
            self.store.upsert_items(&changed).await?;
            report.checked += ids.len();
            report.updated += changed.len();

            // Short page ends the listing; keep auditing from page 1.
            page = if batch.len() < self.config.page_size {
                1
            } else {
                page + 1
            };
        }
        report.next_audit_page = page;

        self.store
            .update_sync_state(&SyncStatePatch {
                last_quick_check_at: Some(now_unix()),
                next_audit_page: Some(page),
                ..SyncStatePatch::default()
            })
            .await?;
        info!(
            new = report.new,
            updated = report.updated,
            checked = report.checked,
            next_audit_page = report.next_audit_page,
            rpm = self.client.current_rpm(),
            "quick sync finished"
        );
        Ok(report)
    }

    async fn discover_new_items(&self, known_max: i64) -> Result<usize, SyncError> {
        let mut newest = known_max;
        let mut inserted = 0;
        let mut page = 1;
        loop {
            let batch = self
                .client
                .fetch_products_page(page, SortOrder::IdDesc)
                .await?;
            let items = normalize_batch(&batch);
            let fresh: Vec<ItemInput> = items
                .iter()
                .filter(|item| item.id > known_max)
                .cloned()
                .collect();
            if !fresh.is_empty() {
                self.store.upsert_items(&fresh).await?;
                inserted += fresh.len();
                newest = fresh.iter().map(|item| item.id).fold(newest, i64::max);
            }

            let reached_known = items
                .iter()
                .map(|item| item.id)
                .min()
                .is_none_or(|lowest| lowest <= known_max);
            if reached_known || batch.len() < self.config.page_size {
                break;
            }
            page += 1;
        }

        if newest > known_max {
            self.store
                .update_sync_state(&SyncStatePatch {
                    max_product_id_seen: Some(newest),
                    ..SyncStatePatch::default()
                })
                .await?;
        }
        debug!(inserted, newest, "new item scan finished");
        Ok(inserted)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
