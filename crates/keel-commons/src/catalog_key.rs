//! Key encoding for catalog sub-store entries.
//!
//! Catalog entries are stored under `"<table>/<attribute>"`. A bare
//! `"<attribute>"` key (no table segment) denotes the default table of a legacy
//! single-table root store.

use crate::errors::{CommonError, Result};
use crate::names::{AttributeName, TableName};

/// Encode a catalog key: `{table}/{attribute}`, or bare `{attribute}` for the
/// default table of a legacy single-table store.
///
/// # Examples
///
/// ```
/// use keel_commons::catalog_key::catalog_key;
/// use keel_commons::{TableName, AttributeName};
///
/// let table = TableName::new("orders");
/// let key = catalog_key(Some(&table), &AttributeName::new("customerId"));
/// assert_eq!(key, b"orders/customerId");
///
/// let bare = catalog_key(None, &AttributeName::new("id"));
/// assert_eq!(bare, b"id");
/// ```
pub fn catalog_key(table: Option<&TableName>, attribute: &AttributeName) -> Vec<u8> {
    match table {
        Some(table) => {
            let mut key = Vec::with_capacity(table.as_str().len() + 1 + attribute.as_str().len());
            key.extend_from_slice(table.as_str().as_bytes());
            key.push(b'/');
            key.extend_from_slice(attribute.as_str().as_bytes());
            key
        }
        None => attribute.as_str().as_bytes().to_vec(),
    }
}

/// Prefix under which every entry of `table` lives: `{table}/`.
pub fn table_prefix(table: &TableName) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(table.as_str().len() + 1);
    prefix.extend_from_slice(table.as_str().as_bytes());
    prefix.push(b'/');
    prefix
}

/// Parse a catalog key into `(table, attribute)`. `table` is `None` for bare
/// keys of a legacy single-table store.
///
/// # Examples
///
/// ```
/// use keel_commons::catalog_key::parse_catalog_key;
///
/// let (table, attr) = parse_catalog_key(b"orders/customerId").unwrap();
/// assert_eq!(table.unwrap().as_str(), "orders");
/// assert_eq!(attr.as_str(), "customerId");
///
/// let (table, attr) = parse_catalog_key(b"id").unwrap();
/// assert!(table.is_none());
/// assert_eq!(attr.as_str(), "id");
/// ```
pub fn parse_catalog_key(key: &[u8]) -> Result<(Option<TableName>, AttributeName)> {
    let key = std::str::from_utf8(key)
        .map_err(|_| CommonError::invalid_input("catalog key is not valid UTF-8"))?;
    match key.split_once('/') {
        Some((table, attribute)) => {
            if table.is_empty() || attribute.is_empty() {
                return Err(CommonError::invalid_input(format!(
                    "malformed catalog key: {}",
                    key
                )));
            }
            Ok((Some(TableName::new(table)), AttributeName::new(attribute)))
        }
        None => {
            if key.is_empty() {
                return Err(CommonError::invalid_input("empty catalog key"));
            }
            Ok((None, AttributeName::new(key)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let table = TableName::new("orders");
        let attr = AttributeName::new("status");
        let key = catalog_key(Some(&table), &attr);
        let (t, a) = parse_catalog_key(&key).unwrap();
        assert_eq!(t, Some(table));
        assert_eq!(a, attr);
    }

    #[test]
    fn test_bare_key_roundtrip() {
        let attr = AttributeName::new("id");
        let key = catalog_key(None, &attr);
        let (t, a) = parse_catalog_key(&key).unwrap();
        assert!(t.is_none());
        assert_eq!(a, attr);
    }

    #[test]
    fn test_table_prefix_covers_keys() {
        let table = TableName::new("orders");
        let key = catalog_key(Some(&table), &AttributeName::new("x"));
        assert!(key.starts_with(&table_prefix(&table)));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(parse_catalog_key(b"").is_err());
        assert!(parse_catalog_key(b"/attr").is_err());
        assert!(parse_catalog_key(b"table/").is_err());
    }
}
