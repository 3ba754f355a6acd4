/// Lookup shape chosen for a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Barcode,
    Sku,
    Text,
}

/// Classifies a trimmed query. Barcode wins over SKU, SKU over free text.
pub fn classify_query(query: &str) -> QueryKind {
    if is_barcode(query) {
        QueryKind::Barcode
    } else if is_sku(query) {
        QueryKind::Sku
    } else {
        QueryKind::Text
    }
}

fn is_barcode(query: &str) -> bool {
    (8..=14).contains(&query.len()) && query.bytes().all(|b| b.is_ascii_digit())
}

fn is_sku(query: &str) -> bool {
    !query.is_empty()
        && query
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        && query
            .chars()
            .any(|c| c.is_ascii_digit() || c == '_' || c == '-')
}
