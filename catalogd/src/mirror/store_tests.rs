use super::*;
use crate::mirror::normalize_product;
use serde_json::json;
use sqlx::SqlitePool;

async fn make_store() -> MirrorStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MirrorStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn product(raw: serde_json::Value) -> ItemInput {
    normalize_product(&raw).unwrap()
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let store = make_store().await;
    let item = product(json!({"id": 1, "name": "Widget", "sku": "W-1", "price": 4}));

    store.upsert_items_at(&[item.clone()], 100).await.unwrap();
    let first = store.get_item(1).await.unwrap().unwrap();
    store.upsert_items_at(&[item], 100).await.unwrap();
    let second = store.get_item(1).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(store.count_items().await.unwrap(), 1);
}

#[tokio::test]
async fn upsert_overwrites_fields_and_keeps_latest_seen_time() {
    let store = make_store().await;
    store
        .upsert_items_at(&[product(json!({"id": 1, "name": "Old"}))], 200)
        .await
        .unwrap();
    store
        .upsert_items_at(&[product(json!({"id": 1, "name": "New"}))], 150)
        .await
        .unwrap();

    let item = store.get_item(1).await.unwrap().unwrap();
    assert_eq!(item.name.as_deref(), Some("New"));
    assert_eq!(item.last_seen_at, 200);
    assert_eq!(item.raw_payload, json!({"id": 1, "name": "New"}));
}

#[tokio::test]
async fn stored_checksum_matches_input_checksum() {
    let store = make_store().await;
    let item = product(json!({"id": 9, "name": "Case", "sku": "C-9", "price": "12.50"}));
    store.upsert_items(&[item.clone()]).await.unwrap();

    let checksums = store.checksums_for(&[9, 10]).await.unwrap();
    assert_eq!(checksums.len(), 1);
    assert_eq!(checksums.get(&9), Some(&item.checksum()));
}

#[tokio::test]
async fn exact_lookup_skips_disabled_items() {
    let store = make_store().await;
    store
        .upsert_items(&[
            product(json!({"id": 1, "sku": "ABC123", "upc_code": "87654321"})),
            product(json!({"id": 2, "sku": "ABC123", "active": false})),
        ])
        .await
        .unwrap();

    let by_sku = store
        .lookup_by_exact_key(ExactKey::Sku, "ABC123")
        .await
        .unwrap();
    assert_eq!(by_sku.len(), 1);
    assert_eq!(by_sku[0].id, 1);

    let by_barcode = store
        .lookup_by_exact_key(ExactKey::Barcode, "87654321")
        .await
        .unwrap();
    assert_eq!(by_barcode.len(), 1);

    assert!(
        store
            .lookup_by_exact_key(ExactKey::Barcode, "8765432")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn text_search_pages_through_matches_in_id_order() {
    let store = make_store().await;
    let items: Vec<_> = (1..=30)
        .map(|i| product(json!({"id": i, "name": format!("Widget {i}")})))
        .collect();
    store.upsert_items(&items).await.unwrap();
    store
        .upsert_items(&[product(json!({"id": 31, "name": "Gadget"}))])
        .await
        .unwrap();

    let first = store.text_search_page("widget", 1).await.unwrap();
    let second = store.text_search_page("widget", 2).await.unwrap();

    assert_eq!(first.len(), 25);
    assert_eq!(second.len(), 5);
    assert_eq!(first[0].id, 1);
    assert_eq!(second[4].id, 30);
}

#[tokio::test]
async fn text_search_matches_substrings_of_name_and_sku() {
    let store = make_store().await;
    store
        .upsert_items(&[
            product(json!({"id": 1, "name": "Lightning cable", "sku": "LC-100"})),
            product(json!({"id": 2, "name": "Charger", "sku": "CHG-200"})),
            product(json!({"id": 3, "name": "Hidden cable", "disabled": true})),
        ])
        .await
        .unwrap();

    let hits = store.text_search("cabl", 25, 0).await.unwrap();
    assert_eq!(hits.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1]);

    let hits = store.text_search("G-2", 25, 0).await.unwrap();
    assert_eq!(hits.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn text_search_follows_renames() {
    let store = make_store().await;
    store
        .upsert_items(&[product(json!({"id": 1, "name": "Adapter"}))])
        .await
        .unwrap();
    store
        .upsert_items(&[product(json!({"id": 1, "name": "Dongle"}))])
        .await
        .unwrap();

    assert!(store.text_search("Adapter", 25, 0).await.unwrap().is_empty());
    assert_eq!(store.text_search("Dongle", 25, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn short_queries_use_like_and_escape_wildcards() {
    let store = make_store().await;
    store
        .upsert_items(&[
            product(json!({"id": 1, "name": "TV stand"})),
            product(json!({"id": 2, "name": "100% cotton"})),
        ])
        .await
        .unwrap();

    let hits = store.text_search("tv", 25, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);

    let hits = store.text_search("%", 25, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 2);
}

#[tokio::test]
async fn quotes_in_queries_do_not_break_matching() {
    let store = make_store().await;
    store
        .upsert_items(&[product(json!({"id": 1, "name": "27\" monitor"}))])
        .await
        .unwrap();

    let hits = store.text_search("27\" mon", 25, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn sync_state_defaults_before_first_write() {
    let store = make_store().await;
    let state = store.sync_state().await.unwrap();

    assert_eq!(state, SyncState::default());
    assert_eq!(state.next_audit_page, 1);
    assert_eq!(state.max_product_id_seen, 0);
}

#[tokio::test]
async fn partial_patch_only_touches_supplied_fields() {
    let store = make_store().await;
    store
        .update_sync_state(&SyncStatePatch {
            max_product_id_seen: Some(50),
            next_audit_page: Some(4),
            last_error: Some(Some("boom".into())),
            ..SyncStatePatch::default()
        })
        .await
        .unwrap();
    store
        .update_sync_state(&SyncStatePatch {
            last_quick_check_at: Some(1_700_000_000),
            last_error: Some(None),
            ..SyncStatePatch::default()
        })
        .await
        .unwrap();

    let state = store.sync_state().await.unwrap();
    assert_eq!(state.max_product_id_seen, 50);
    assert_eq!(state.next_audit_page, 4);
    assert_eq!(state.last_quick_check_at, Some(1_700_000_000));
    assert_eq!(state.last_error, None);
    assert_eq!(state.last_full_sync_at, None);
}

#[tokio::test]
async fn only_one_sync_can_hold_the_flag() {
    let store = make_store().await;

    assert!(store.try_begin_sync().await.unwrap());
    assert!(!store.try_begin_sync().await.unwrap());
    assert!(store.sync_state().await.unwrap().sync_running);

    store
        .finish_sync(r#"{"outcome":"failed"}"#, Some("401"), 1_700_000_100)
        .await
        .unwrap();
    let state = store.sync_state().await.unwrap();
    assert!(!state.sync_running);
    assert_eq!(state.last_error.as_deref(), Some("401"));
    assert_eq!(state.last_error_at, Some(1_700_000_100));

    assert!(store.try_begin_sync().await.unwrap());
    store
        .finish_sync(r#"{"outcome":"completed"}"#, None, 1_700_000_200)
        .await
        .unwrap();
    let state = store.sync_state().await.unwrap();
    assert_eq!(state.last_error, None);
    assert_eq!(state.last_error_at, None);
    assert_eq!(
        state.last_job_result.as_deref(),
        Some(r#"{"outcome":"completed"}"#)
    );
}

#[tokio::test]
async fn clear_sync_flag_reports_stale_flag() {
    let store = make_store().await;
    assert!(!store.clear_sync_flag().await.unwrap());

    store.try_begin_sync().await.unwrap();
    assert!(store.clear_sync_flag().await.unwrap());
    assert!(!store.sync_state().await.unwrap().sync_running);
}

#[tokio::test]
async fn readers_are_not_blocked_by_an_open_write_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = MirrorStore::open(&dir.path().join("nested").join("inventory.db"))
        .await
        .unwrap();
    store
        .upsert_items(&[product(json!({"id": 1, "name": "Before"}))])
        .await
        .unwrap();

    let mut tx = store.pool.begin().await.unwrap();
    sqlx::query("UPDATE products SET name = 'During' WHERE id = 1")
        .execute(&mut *tx)
        .await
        .unwrap();

    let seen = store.get_item(1).await.unwrap().unwrap();
    assert_eq!(seen.name.as_deref(), Some("Before"));

    tx.commit().await.unwrap();
    let seen = store.get_item(1).await.unwrap().unwrap();
    assert_eq!(seen.name.as_deref(), Some("During"));
}
