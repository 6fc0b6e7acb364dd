//! Secondary indexes stored as `key -> msgpack Vec<id>`.

use redb::{ReadableTable, Table};

use super::db::DatabaseError;

/// Ids listed under `key`, in insertion order.
pub(crate) fn index_get<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    key: &str,
) -> Result<Vec<String>, DatabaseError> {
    match table.get(key)? {
        Some(data) => Ok(rmp_serde::from_slice(data.value())?),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn index_add(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    id: &str,
) -> Result<(), DatabaseError> {
    let mut ids: Vec<String> = match table.get(key)? {
        Some(data) => rmp_serde::from_slice(data.value())?,
        None => Vec::new(),
    };

    if !ids.iter().any(|fid| fid == id) {
        ids.push(id.to_string());
        let data = rmp_serde::to_vec_named(&ids)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}

pub(crate) fn index_remove(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    id: &str,
) -> Result<(), DatabaseError> {
    let existing: Option<Vec<String>> = match table.get(key)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };

    if let Some(mut ids) = existing {
        ids.retain(|fid| fid != id);
        if ids.is_empty() {
            table.remove(key)?;
        } else {
            let data = rmp_serde::to_vec_named(&ids)?;
            table.insert(key, data.as_slice())?;
        }
    }
    Ok(())
}
