//! In-memory storage backend.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use vellum_error::Result;

use crate::Storage;

/// Ordered in-memory byte store with a buffered write batch, used by
/// engine tests and ephemeral namespaces.
#[derive(Debug, Default)]
pub struct MemStorage {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Buffered writes: `None` value marks a pending delete.
    pending: Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Storage for MemStorage {
    fn write(&self, key: &[u8], value: &[u8]) {
        self.pending.lock().push((key.to_vec(), Some(value.to_vec())));
    }

    fn write_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // pending writes are visible to reads, newest first
        for (k, v) in self.pending.lock().iter().rev() {
            if k == key {
                return Ok(v.clone());
            }
        }
        Ok(self.data.lock().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) {
        self.pending.lock().push((key.to_vec(), None));
    }

    fn cursor(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.lock();
        data.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn flush(&self) -> Result<()> {
        let mut data = self.data.lock();
        for (key, value) in self.pending.lock().drain(..) {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.data.lock().clear();
        self.pending.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_writes_reach_data_on_flush() {
        let storage = MemStorage::new();
        storage.write(b"a", b"1");
        assert!(storage.is_empty());
        assert_eq!(storage.read(b"a").unwrap(), Some(b"1".to_vec()));
        storage.flush().unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn pending_delete_shadows_data() {
        let storage = MemStorage::new();
        storage.write_sync(b"a", b"1").unwrap();
        storage.remove(b"a");
        assert_eq!(storage.read(b"a").unwrap(), None);
        storage.flush().unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn cursor_respects_prefix_and_order() {
        let storage = MemStorage::new();
        storage.write_sync(b"meta.a", b"1").unwrap();
        storage.write_sync(b"meta.b", b"2").unwrap();
        storage.write_sync(b"other", b"3").unwrap();
        let entries = storage.cursor(b"meta.");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"meta.a");
        assert_eq!(entries[1].0, b"meta.b");
    }

    #[test]
    fn destroy_clears_everything() {
        let storage = MemStorage::new();
        storage.write_sync(b"a", b"1").unwrap();
        storage.write(b"b", b"2");
        storage.destroy().unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.read(b"b").unwrap(), None);
    }
}
