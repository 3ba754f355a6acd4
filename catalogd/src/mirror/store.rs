use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::item::{CatalogItem, ItemInput};
use super::now_unix;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Fixed page size of local text search.
pub const SEARCH_PAGE_SIZE: u32 = 25;

const ITEM_COLUMNS: &str = "p.id, p.name, p.sku, p.barcode, p.category_id, p.price_cents, \
     p.disabled, p.quantity, p.last_seen_at, p.checksum, p.raw_payload";

// Trigram tokens need at least three characters; shorter queries use LIKE.
const MIN_INDEXED_QUERY_CHARS: usize = 3;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("product payload has no usable id")]
    MissingId,
}

/// Indexed columns usable for exact lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactKey {
    Barcode,
    Sku,
}

impl ExactKey {
    fn column(&self) -> &'static str {
        match self {
            ExactKey::Barcode => "barcode",
            ExactKey::Sku => "sku",
        }
    }
}

/// Singleton synchronization record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub last_full_sync_at: Option<i64>,
    pub last_quick_check_at: Option<i64>,
    pub max_product_id_seen: i64,
    pub next_audit_page: u32,
    pub full_sync_next_page: u32,
    pub sync_running: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub last_job_result: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_full_sync_at: None,
            last_quick_check_at: None,
            max_product_id_seen: 0,
            next_audit_page: 1,
            full_sync_next_page: 1,
            sync_running: false,
            last_error: None,
            last_error_at: None,
            last_job_result: None,
        }
    }
}

/// Partial update of [`SyncState`]; `None` leaves a field untouched.
///
/// The running flag is absent on purpose: it only changes through
/// [`MirrorStore::try_begin_sync`] and [`MirrorStore::finish_sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatePatch {
    pub last_full_sync_at: Option<i64>,
    pub last_quick_check_at: Option<i64>,
    pub max_product_id_seen: Option<i64>,
    pub next_audit_page: Option<u32>,
    pub full_sync_next_page: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub last_job_result: Option<String>,
}

impl SyncStatePatch {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) a store file in WAL mode so readers keep
    /// working while a sync writes.
    pub async fn open(path: &Path) -> Result<Self, MirrorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-20000");
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), MirrorError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces every item by id inside one transaction.
    pub async fn upsert_items(&self, items: &[ItemInput]) -> Result<usize, MirrorError> {
        self.upsert_items_at(items, now_unix()).await
    }

    pub(crate) async fn upsert_items_at(
        &self,
        items: &[ItemInput],
        seen_at: i64,
    ) -> Result<usize, MirrorError> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for item in items {
            let raw_payload = serde_json::to_string(&item.raw_payload)?;
            sqlx::query(
                "INSERT INTO products (
                    id, name, sku, barcode, category_id, price_cents, disabled,
                    quantity, last_seen_at, checksum, raw_payload
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    sku = excluded.sku,
                    barcode = excluded.barcode,
                    category_id = excluded.category_id,
                    price_cents = excluded.price_cents,
                    disabled = excluded.disabled,
                    quantity = excluded.quantity,
                    last_seen_at = MAX(products.last_seen_at, excluded.last_seen_at),
                    checksum = excluded.checksum,
                    raw_payload = excluded.raw_payload",
            )
            .bind(item.id)
            .bind(&item.name)
            .bind(&item.sku)
            .bind(&item.barcode)
            .bind(item.category_id)
            .bind(item.price_cents)
            .bind(if item.disabled { 1 } else { 0 })
            .bind(item.quantity)
            .bind(seen_at)
            .bind(item.checksum())
            .bind(raw_payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(items.len())
    }

    pub async fn get_item(&self, id: i64) -> Result<Option<CatalogItem>, MirrorError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM products p WHERE p.id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Stored checksums for whichever of `ids` are mirrored.
    pub async fn checksums_for(&self, ids: &[i64]) -> Result<HashMap<i64, String>, MirrorError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id, checksum FROM products WHERE id IN (");
        let mut list = builder.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        builder.push(")");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(i64, String), MirrorError> {
                Ok((row.try_get("id")?, row.try_get("checksum")?))
            })
            .collect()
    }

    /// Enabled items whose barcode or SKU equals `value` exactly.
    pub async fn lookup_by_exact_key(
        &self,
        key: ExactKey,
        value: &str,
    ) -> Result<Vec<CatalogItem>, MirrorError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM products p WHERE p.{} = ?1 AND p.disabled = 0 ORDER BY p.id",
            key.column()
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Substring match on name or SKU among enabled items, ordered by id.
    pub async fn text_search(
        &self,
        query: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CatalogItem>, MirrorError> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let rows = if query.chars().count() >= MIN_INDEXED_QUERY_CHARS {
            sqlx::query(&format!(
                "SELECT {ITEM_COLUMNS}
                 FROM products_fts
                 JOIN products p ON p.id = products_fts.rowid
                 WHERE products_fts MATCH ?1 AND p.disabled = 0
                 ORDER BY p.id
                 LIMIT ?2 OFFSET ?3"
            ))
            .bind(fts_phrase(query))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {ITEM_COLUMNS}
                 FROM products p
                 WHERE (p.name LIKE ?1 ESCAPE '\\' OR p.sku LIKE ?1 ESCAPE '\\')
                    AND p.disabled = 0
                 ORDER BY p.id
                 LIMIT ?2 OFFSET ?3"
            ))
            .bind(like_pattern(query))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(item_from_row).collect()
    }

    /// One fixed-size page (1-based) of [`Self::text_search`].
    pub async fn text_search_page(
        &self,
        query: &str,
        page: u32,
    ) -> Result<Vec<CatalogItem>, MirrorError> {
        let offset = page.max(1).saturating_sub(1).saturating_mul(SEARCH_PAGE_SIZE);
        self.text_search(query, SEARCH_PAGE_SIZE, offset).await
    }

    /// Every mirrored item, disabled ones included, ordered by id.
    pub async fn list_items(&self) -> Result<Vec<CatalogItem>, MirrorError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM products p ORDER BY p.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn count_items(&self) -> Result<i64, MirrorError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn sync_state(&self) -> Result<SyncState, MirrorError> {
        let row = sqlx::query(
            "SELECT last_full_sync_at, last_quick_check_at, max_product_id_seen, next_audit_page,
                    full_sync_next_page, sync_running, last_error, last_error_at, last_job_result
             FROM sync_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncState::default());
        };

        let max_seen: Option<i64> = row.try_get("max_product_id_seen")?;
        let next_audit: Option<i64> = row.try_get("next_audit_page")?;
        let full_next: Option<i64> = row.try_get("full_sync_next_page")?;
        let running: i64 = row.try_get("sync_running")?;
        Ok(SyncState {
            last_full_sync_at: row.try_get("last_full_sync_at")?,
            last_quick_check_at: row.try_get("last_quick_check_at")?,
            max_product_id_seen: max_seen.unwrap_or(0),
            next_audit_page: page_number(next_audit),
            full_sync_next_page: page_number(full_next),
            sync_running: running != 0,
            last_error: row.try_get("last_error")?,
            last_error_at: row.try_get("last_error_at")?,
            last_job_result: row.try_get("last_job_result")?,
        })
    }

    /// Applies only the fields present in `patch`.
    pub async fn update_sync_state(&self, patch: &SyncStatePatch) -> Result<(), MirrorError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO sync_state (id) VALUES (1)")
            .execute(&mut *tx)
            .await?;

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE sync_state SET ");
        let mut set = builder.separated(", ");
        if let Some(at) = patch.last_full_sync_at {
            set.push("last_full_sync_at = ").push_bind_unseparated(at);
        }
        if let Some(at) = patch.last_quick_check_at {
            set.push("last_quick_check_at = ").push_bind_unseparated(at);
        }
        if let Some(max_seen) = patch.max_product_id_seen {
            set.push("max_product_id_seen = ")
                .push_bind_unseparated(max_seen);
        }
        if let Some(page) = patch.next_audit_page {
            set.push("next_audit_page = ")
                .push_bind_unseparated(i64::from(page.max(1)));
        }
        if let Some(page) = patch.full_sync_next_page {
            set.push("full_sync_next_page = ")
                .push_bind_unseparated(i64::from(page.max(1)));
        }
        if let Some(error) = &patch.last_error {
            set.push("last_error = ").push_bind_unseparated(error.clone());
        }
        if let Some(result) = &patch.last_job_result {
            set.push("last_job_result = ")
                .push_bind_unseparated(result.clone());
        }
        builder.push(" WHERE id = 1");
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Claims the process-wide sync slot. Returns `false` when another job
    /// already holds it.
    pub async fn try_begin_sync(&self) -> Result<bool, MirrorError> {
        sqlx::query("INSERT OR IGNORE INTO sync_state (id) VALUES (1)")
            .execute(&self.pool)
            .await?;
        let result =
            sqlx::query("UPDATE sync_state SET sync_running = 1 WHERE id = 1 AND sync_running = 0")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases the sync slot and records the job outcome in one statement.
    pub async fn finish_sync(
        &self,
        job_result: &str,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<(), MirrorError> {
        sqlx::query(
            "UPDATE sync_state
             SET sync_running = 0, last_job_result = ?1, last_error = ?2, last_error_at = ?3
             WHERE id = 1",
        )
        .bind(job_result)
        .bind(error)
        .bind(error.map(|_| finished_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clears the running flag unconditionally. Returns whether it was set.
    pub async fn clear_sync_flag(&self) -> Result<bool, MirrorError> {
        let result = sqlx::query("UPDATE sync_state SET sync_running = 0 WHERE id = 1 AND sync_running = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn item_from_row(row: &SqliteRow) -> Result<CatalogItem, MirrorError> {
    let disabled: i64 = row.try_get("disabled")?;
    let raw_payload: String = row.try_get("raw_payload")?;
    Ok(CatalogItem {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        sku: row.try_get("sku")?,
        barcode: row.try_get("barcode")?,
        category_id: row.try_get("category_id")?,
        price_cents: row.try_get("price_cents")?,
        disabled: disabled != 0,
        quantity: row.try_get("quantity")?,
        last_seen_at: row.try_get("last_seen_at")?,
        checksum: row.try_get("checksum")?,
        raw_payload: serde_json::from_str(&raw_payload)?,
    })
}

fn page_number(value: Option<i64>) -> u32 {
    value
        .and_then(|page| u32::try_from(page).ok())
        .filter(|page| *page > 0)
        .unwrap_or(1)
}

fn fts_phrase(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// `$XDG_DATA_HOME/catalog-mirror/inventory.db`.
pub fn default_db_path() -> Result<PathBuf, MirrorError> {
    let mut path = dirs::data_dir().ok_or(MirrorError::MissingDataDir)?;
    path.push("catalog-mirror");
    path.push("inventory.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
