use std::path::Path;

use tracing::info;

use crate::mirror::{CatalogItem, MirrorError, MirrorStore};

const CSV_HEADER: &str = "id,name,sku,quantity";

/// Renders mirrored items as CSV with `id,name,sku,quantity` columns.
pub fn render_csv(items: &[CatalogItem]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + items.len() * 32);
    out.push_str(CSV_HEADER);
    out.push_str("\r\n");
    for item in items {
        let quantity = item.quantity.map(|q| q.to_string()).unwrap_or_default();
        let fields = [
            item.id.to_string(),
            csv_field(item.name.as_deref().unwrap_or_default()),
            csv_field(item.sku.as_deref().unwrap_or_default()),
            quantity,
        ];
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

/// Writes every mirrored item to `path`. Returns the number of rows.
pub async fn export_csv(store: &MirrorStore, path: &Path) -> Result<usize, MirrorError> {
    let items = store.list_items().await?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, render_csv(&items)).await?;
    info!(rows = items.len(), path = %path.display(), "catalog exported");
    Ok(items.len())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::normalize_batch;
    use serde_json::json;
    use sqlx::SqlitePool;

    #[test]
    fn quotes_fields_that_need_it() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("27\" screen"), "\"27\"\" screen\"");
    }

    #[tokio::test]
    async fn exports_all_items_in_id_order() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MirrorStore::from_pool(pool);
        store.init().await.unwrap();
        store
            .upsert_items(&normalize_batch(&[
                json!({"id": 2, "name": "Cable, USB-C", "sku": "CB-2", "quantity": 7}),
                json!({"id": 1, "name": "Fuse", "active": false}),
            ]))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("catalog.csv");
        let rows = export_csv(&store, &path).await.unwrap();

        assert_eq!(rows, 2);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "id,name,sku,quantity\r\n1,Fuse,,\r\n2,\"Cable, USB-C\",CB-2,7\r\n"
        );
    }
}
