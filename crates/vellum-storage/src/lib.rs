//! Pluggable byte-store contract.
//!
//! The engine core treats durable storage as an opaque ordered key-value
//! store. Namespace data lives under fixed key prefixes (`I` + id for
//! item CJSON, `indexes.<n>` / `tags.<n>` / `schema.<n>` / `repl.<n>`
//! system records, `meta<key>` for user metadata). System records are
//! N-buffered: 8 backup slots with an 8-byte version prefix, the highest
//! version winning on load.

pub mod mem;
pub mod sysrec;

pub use mem::MemStorage;
pub use sysrec::{
    check_storage_header, load_latest_sys_record, storage_header, write_sys_record,
    SYS_RECORDS_BACKUP_COUNT, SYS_RECORDS_FIRST_WRITE_COPIES,
};

use vellum_error::Result;

/// Key prefix of item records: `I` + big-endian row id.
pub const ITEM_PREFIX: u8 = b'I';
pub const INDEXES_PREFIX: &str = "indexes";
pub const TAGS_PREFIX: &str = "tags";
pub const SCHEMA_PREFIX: &str = "schema";
pub const REPL_PREFIX: &str = "repl";
pub const META_PREFIX: &str = "meta";

/// Storage format magic.
pub const STORAGE_MAGIC: u32 = 0x1234_FEDC;
/// Storage format version; a mismatch aborts namespace load.
pub const STORAGE_VERSION: u32 = 0x8;

/// Key of an item record.
#[must_use]
pub fn item_key(id: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(ITEM_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// The byte-store contract the core requires.
///
/// `write` is buffered until `flush`; `write_sync` reaches the backend
/// immediately. `cursor` iterates keys with a prefix in ascending order.
pub trait Storage: Send + Sync {
    fn write(&self, key: &[u8], value: &[u8]);
    fn write_sync(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &[u8]);
    fn cursor(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
    fn flush(&self) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_keys_sort_by_id() {
        // big-endian ids keep cursor order aligned with id order
        assert!(item_key(1) < item_key(2));
        assert!(item_key(255) < item_key(256));
        assert_eq!(item_key(7)[0], b'I');
    }
}
