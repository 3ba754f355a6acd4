mod item;
mod query;
mod store;

pub use item::{
    CatalogItem, ItemInput, ProductView, item_checksum, normalize_batch, normalize_product,
};
pub use query::{QueryKind, classify_query};
pub use store::{
    ExactKey, MirrorError, MirrorStore, SEARCH_PAGE_SIZE, SyncState, SyncStatePatch,
    default_db_path,
};

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
