//! Trait interfaces between crates.
//!
//! - [`Record`]: a value that can be persisted under a namespaced content id
//! - [`RecordStore`]: async key-value persistence (weft-node implements)

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::Hash256;

/// A persistable value identified by a content hash.
pub trait Record:
    bincode::Encode + bincode::Decode<()> + Clone + Send + Sync + 'static
{
    /// Key namespace, e.g. `smartContract`.
    const NAMESPACE: &'static str;

    /// Content identifier of this record.
    fn id(&self) -> Hash256;

    /// The full storage key for `id`: `<namespace>:<hex id>`.
    fn storage_key(id: &Hash256) -> String {
        format!("{}:{}", Self::NAMESPACE, id)
    }
}

/// Async persistence of [`Record`]s.
///
/// Missing records are not errors: `get` returns `None` and `get_all`
/// silently omits them.
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert or overwrite a record under its content id.
    async fn save(&self, record: &R) -> Result<(), StorageError>;

    /// Fetch one record by id.
    async fn get(&self, id: &Hash256) -> Result<Option<R>, StorageError>;

    /// Fetch every record that exists among `ids`, in request order.
    async fn get_all(&self, ids: &[Hash256]) -> Result<Vec<R>, StorageError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id).await? {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Remove a record. Removing an absent id is a no-op.
    async fn delete(&self, id: &Hash256) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SmartContract;

    #[test]
    fn storage_key_is_namespaced_hex() {
        let key = SmartContract::storage_key(&Hash256([0x01; 32]));
        assert_eq!(key, format!("smartContract:{}", "01".repeat(32)));
    }
}
