use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::store::MirrorError;

const DESCRIPTION_PREVIEW_CHARS: usize = 100;

/// Upstream product reduced to the columns the mirror indexes.
///
/// Built only by [`normalize_product`]; the checksum is derived from the
/// fields at write time and never stored on the input itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInput {
    pub id: i64,
    pub name: Option<String>,
    pub sku: Option<String>,
    pub barcode: Option<String>,
    pub category_id: Option<i64>,
    pub price_cents: i64,
    pub disabled: bool,
    pub quantity: Option<i64>,
    pub raw_payload: Value,
}

impl ItemInput {
    pub fn checksum(&self) -> String {
        item_checksum(
            self.name.as_deref(),
            self.sku.as_deref(),
            self.barcode.as_deref(),
            self.category_id,
            self.price_cents,
            self.disabled,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: i64,
    pub name: Option<String>,
    pub sku: Option<String>,
    pub barcode: Option<String>,
    pub category_id: Option<i64>,
    pub price_cents: i64,
    pub disabled: bool,
    pub quantity: Option<i64>,
    pub last_seen_at: i64,
    pub checksum: String,
    pub raw_payload: Value,
}

impl CatalogItem {
    pub fn view(&self) -> ProductView {
        ProductView::from_parts(
            self.id,
            self.name.as_deref(),
            self.price_cents,
            &self.raw_payload,
        )
    }
}

/// Search result shape handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductView {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub cost: f64,
    pub retail: f64,
}

impl ProductView {
    fn from_parts(id: i64, name: Option<&str>, price_cents: i64, raw: &Value) -> Self {
        let description = raw
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .chars()
            .take(DESCRIPTION_PREVIEW_CHARS)
            .collect();
        let retail = raw
            .get("price_retail")
            .and_then(number_field)
            .unwrap_or(price_cents as f64 / 100.0);
        Self {
            id,
            name: name.unwrap_or_default().to_string(),
            description,
            cost: raw.get("price_cost").and_then(number_field).unwrap_or(0.0),
            retail,
        }
    }
}

impl From<&ItemInput> for ProductView {
    fn from(item: &ItemInput) -> Self {
        Self::from_parts(
            item.id,
            item.name.as_deref(),
            item.price_cents,
            &item.raw_payload,
        )
    }
}

/// Maps a loosely typed upstream product into [`ItemInput`].
///
/// Accepts `price_retail` or `price` (number or numeric string), `upc_code` or
/// `barcode`, and treats an item as disabled when `active` is false or
/// `disabled` is true.
pub fn normalize_product(raw: &Value) -> Result<ItemInput, MirrorError> {
    let id = raw
        .get("id")
        .and_then(integer_field)
        .ok_or(MirrorError::MissingId)?;
    let price = raw
        .get("price_retail")
        .filter(|value| !value.is_null())
        .or_else(|| raw.get("price"))
        .and_then(number_field)
        .unwrap_or(0.0);
    let active = raw.get("active").and_then(bool_field).unwrap_or(true);
    let disabled = raw.get("disabled").and_then(bool_field).unwrap_or(false);

    Ok(ItemInput {
        id,
        name: raw.get("name").and_then(text_field),
        sku: raw.get("sku").and_then(text_field),
        barcode: raw
            .get("upc_code")
            .and_then(text_field)
            .or_else(|| raw.get("barcode").and_then(text_field)),
        category_id: raw.get("category_id").and_then(integer_field),
        price_cents: (price * 100.0).round() as i64,
        disabled: !active || disabled,
        quantity: raw.get("quantity").and_then(integer_field),
        raw_payload: raw.clone(),
    })
}

/// Normalizes a raw page, dropping entries the mirror cannot key.
pub fn normalize_batch(batch: &[Value]) -> Vec<ItemInput> {
    batch
        .iter()
        .filter_map(|raw| match normalize_product(raw) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("skipping product: {err}");
                None
            }
        })
        .collect()
}

/// Fingerprint over the fields that matter for change detection.
pub fn item_checksum(
    name: Option<&str>,
    sku: Option<&str>,
    barcode: Option<&str>,
    category_id: Option<i64>,
    price_cents: i64,
    disabled: bool,
) -> String {
    let mut hasher = Sha256::new();
    for field in [name, sku, barcode] {
        hash_optional(&mut hasher, field.map(str::as_bytes));
    }
    hash_optional(
        &mut hasher,
        category_id.map(|id| id.to_le_bytes()).as_ref().map(|b| &b[..]),
    );
    hasher.update(price_cents.to_le_bytes());
    hasher.update([u8::from(disabled)]);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn hash_optional(hasher: &mut Sha256, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            hasher.update([1u8]);
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        None => hasher.update([0u8]),
    }
}

fn text_field(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn integer_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_price_and_flags() {
        let item = normalize_product(&json!({
            "id": 10,
            "name": "Screen protector",
            "sku": "SP-10",
            "upc_code": "012345678905",
            "category_id": 4,
            "price_retail": "19.99",
            "price": 5,
            "active": true,
            "quantity": 12
        }))
        .unwrap();

        assert_eq!(item.id, 10);
        assert_eq!(item.price_cents, 1999);
        assert_eq!(item.barcode.as_deref(), Some("012345678905"));
        assert_eq!(item.category_id, Some(4));
        assert_eq!(item.quantity, Some(12));
        assert!(!item.disabled);
    }

    #[test]
    fn falls_back_to_plain_price_field() {
        let item = normalize_product(&json!({"id": 1, "price": 2.5})).unwrap();
        assert_eq!(item.price_cents, 250);

        let item = normalize_product(&json!({"id": 1, "price_retail": null, "price": 3})).unwrap();
        assert_eq!(item.price_cents, 300);

        let item = normalize_product(&json!({"id": 1})).unwrap();
        assert_eq!(item.price_cents, 0);
    }

    #[test]
    fn inactive_or_disabled_items_are_disabled() {
        assert!(normalize_product(&json!({"id": 1, "active": false})).unwrap().disabled);
        assert!(normalize_product(&json!({"id": 1, "disabled": true})).unwrap().disabled);
        assert!(!normalize_product(&json!({"id": 1})).unwrap().disabled);
    }

    #[test]
    fn rejects_payload_without_id() {
        assert!(matches!(
            normalize_product(&json!({"name": "orphan"})),
            Err(MirrorError::MissingId)
        ));
    }

    #[test]
    fn normalize_batch_drops_entries_without_id() {
        let items = normalize_batch(&[json!({"id": 1}), json!({"name": "orphan"}), json!({"id": "2"})]);
        assert_eq!(items.iter().map(|item| item.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn checksum_ignores_fields_outside_the_fingerprint() {
        let a = normalize_product(&json!({"id": 1, "name": "Cable", "price": 1})).unwrap();
        let b = normalize_product(&json!({
            "id": 1,
            "name": "Cable",
            "price": 1,
            "description": "extra detail"
        }))
        .unwrap();
        assert_eq!(a.checksum(), b.checksum());

        let c = normalize_product(&json!({"id": 1, "name": "Cable", "price": 2})).unwrap();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn checksum_distinguishes_missing_from_empty_neighbours() {
        let left = item_checksum(Some("ab"), None, None, None, 0, false);
        let right = item_checksum(Some("a"), Some("b"), None, None, 0, false);
        assert_ne!(left, right);
    }

    #[test]
    fn view_reads_extra_fields_from_raw_payload() {
        let long = "x".repeat(150);
        let item = normalize_product(&json!({
            "id": 5,
            "name": "Battery",
            "description": long,
            "price_cost": "4.25",
            "price": 9
        }))
        .unwrap();

        let view = ProductView::from(&item);
        assert_eq!(view.description.len(), 100);
        assert_eq!(view.cost, 4.25);
        assert_eq!(view.retail, 9.0);
    }
}
