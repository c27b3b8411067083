//! Record storage backends.
//!
//! Both stores keep bincode-encoded [`Record`]s under `<namespace>:<hex id>`
//! keys and implement [`RecordStore`] for every record type.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{Options, DB};

use weft_core::error::StorageError;
use weft_core::traits::{Record, RecordStore};
use weft_core::types::Hash256;

fn encode_record<R: Record>(record: &R) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StorageError::Encode(e.to_string()))
}

fn decode_record<R: Record>(key: &str, bytes: &[u8]) -> Result<R, StorageError> {
    let (record, _) = bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(
        |e| StorageError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        },
    )?;
    Ok(record)
}

/// In-process store, for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all namespaces.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore {
    async fn save(&self, record: &R) -> Result<(), StorageError> {
        let bytes = encode_record(record)?;
        self.records
            .write()
            .insert(R::storage_key(&record.id()), bytes);
        Ok(())
    }

    async fn get(&self, id: &Hash256) -> Result<Option<R>, StorageError> {
        let key = R::storage_key(id);
        let bytes = self.records.read().get(&key).cloned();
        bytes.map(|b| decode_record(&key, &b)).transpose()
    }

    async fn delete(&self, id: &Hash256) -> Result<(), StorageError> {
        self.records.write().remove(&R::storage_key(id));
        Ok(())
    }
}

/// RocksDB-backed persistent record storage.
///
/// Uses the default column family; the key namespace keeps record types apart.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for RocksStore {
    async fn save(&self, record: &R) -> Result<(), StorageError> {
        let bytes = encode_record(record)?;
        self.db
            .put(R::storage_key(&record.id()).as_bytes(), bytes)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn get(&self, id: &Hash256) -> Result<Option<R>, StorageError> {
        let key = R::storage_key(id);
        let bytes = self
            .db
            .get(key.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        bytes.map(|b| decode_record(&key, &b)).transpose()
    }

    async fn delete(&self, id: &Hash256) -> Result<(), StorageError> {
        self.db
            .delete(R::storage_key(id).as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::SmartContract;

    fn contract(n: u8) -> SmartContract {
        SmartContract::new(format!("author-{n}"), vec![n; 16], 1_700_000_000 + i64::from(n))
    }

    async fn exercise(store: &dyn RecordStore<SmartContract>) {
        let a = contract(1);
        let b = contract(2);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        assert_eq!(store.get(&a.hash).await.unwrap(), Some(a.clone()));
        assert_eq!(store.get(&Hash256([9; 32])).await.unwrap(), None);

        let all = store
            .get_all(&[b.hash, Hash256([9; 32]), a.hash])
            .await
            .unwrap();
        assert_eq!(all, vec![b.clone(), a.clone()]);

        store.delete(&a.hash).await.unwrap();
        assert_eq!(store.get(&a.hash).await.unwrap(), None);
        // Deleting again is a no-op.
        store.delete(&a.hash).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn rocks_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("records")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn rocks_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        let c = contract(5);
        {
            let store = RocksStore::open(&path).unwrap();
            RecordStore::<SmartContract>::save(&store, &c).await.unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        let loaded = RecordStore::<SmartContract>::get(&store, &c.hash).await.unwrap();
        assert_eq!(loaded, Some(c));
    }

    #[tokio::test]
    async fn save_overwrites_same_id() {
        let store = MemoryStore::new();
        let c = contract(3);
        RecordStore::<SmartContract>::save(&store, &c).await.unwrap();
        RecordStore::<SmartContract>::save(&store, &c).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_value_is_decode_error() {
        let store = MemoryStore::new();
        let id = Hash256([4; 32]);
        store
            .records
            .write()
            .insert(SmartContract::storage_key(&id), vec![0xFF, 0xFF]);
        let err = RecordStore::<SmartContract>::get(&store, &id).await.unwrap_err();
        assert!(matches!(err, StorageError::Decode { .. }));
    }
}
