//! N-buffered system records.
//!
//! A system record (`indexes`, `tags`, `schema`, `repl`) is written to
//! `prefix.<version % 8>` with an 8-byte little-endian version prefix.
//! Loading scans all slots and takes the highest version, so a torn
//! write of one slot never loses the record. The first write fans out
//! to three slots to survive early crashes.

use vellum_error::{Result, VellumError};

use crate::{Storage, STORAGE_MAGIC, STORAGE_VERSION};

pub const SYS_RECORDS_BACKUP_COUNT: u64 = 8;
pub const SYS_RECORDS_FIRST_WRITE_COPIES: u64 = 3;

const _: () = assert!(
    SYS_RECORDS_BACKUP_COUNT.is_power_of_two(),
    "backup slot index uses a bit mask"
);

fn slot_key(prefix: &str, slot: u64) -> Vec<u8> {
    format!("{prefix}.{slot}").into_bytes()
}

/// Write one system record at `version`; when `version == 0` the record
/// fans out to the first-write copy count.
pub fn write_sys_record(
    storage: &dyn Storage,
    prefix: &str,
    version: u64,
    data: &[u8],
) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(data);

    let copies = if version == 0 {
        SYS_RECORDS_FIRST_WRITE_COPIES
    } else {
        1
    };
    for i in 0..copies {
        let slot = (version + i) & (SYS_RECORDS_BACKUP_COUNT - 1);
        storage.write_sync(&slot_key(prefix, slot), &buf)?;
    }
    Ok(())
}

/// Load the record with the highest version across all slots.
pub fn load_latest_sys_record(
    storage: &dyn Storage,
    prefix: &str,
) -> Result<Option<(u64, Vec<u8>)>> {
    let mut best: Option<(u64, Vec<u8>)> = None;
    for slot in 0..SYS_RECORDS_BACKUP_COUNT {
        let Some(raw) = storage.read(&slot_key(prefix, slot))? else {
            continue;
        };
        if raw.len() < 8 {
            continue;
        }
        let version = u64::from_le_bytes(raw[..8].try_into().expect("length checked"));
        if best.as_ref().map_or(true, |(v, _)| version > *v) {
            best = Some((version, raw[8..].to_vec()));
        }
    }
    Ok(best)
}

/// The 8-byte header stored with the `indexes` record: magic + format
/// version.
#[must_use]
pub fn storage_header() -> [u8; 8] {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&STORAGE_MAGIC.to_le_bytes());
    header[4..].copy_from_slice(&STORAGE_VERSION.to_le_bytes());
    header
}

/// Verify a loaded header; a mismatch aborts namespace load.
pub fn check_storage_header(raw: &[u8]) -> Result<()> {
    if raw.len() < 8 {
        return Err(VellumError::not_valid("storage header is truncated"));
    }
    let magic = u32::from_le_bytes(raw[..4].try_into().expect("length checked"));
    let version = u32::from_le_bytes(raw[4..8].try_into().expect("length checked"));
    if magic != STORAGE_MAGIC {
        return Err(VellumError::not_valid(format!(
            "storage magic mismatch: want {STORAGE_MAGIC:08X}, got {magic:08X}"
        )));
    }
    if version != STORAGE_VERSION {
        return Err(VellumError::not_valid(format!(
            "storage version mismatch: want {STORAGE_VERSION:08X}, got {version:08X}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStorage;

    #[test]
    fn highest_version_wins() {
        let storage = MemStorage::new();
        for version in 0..12u64 {
            write_sys_record(&storage, "tags", version, format!("v{version}").as_bytes())
                .unwrap();
        }
        let (version, data) = load_latest_sys_record(&storage, "tags").unwrap().unwrap();
        assert_eq!(version, 11);
        assert_eq!(data, b"v11");
    }

    #[test]
    fn first_write_fans_out() {
        let storage = MemStorage::new();
        write_sys_record(&storage, "repl", 0, b"x").unwrap();
        let mut found = 0;
        for slot in 0..SYS_RECORDS_BACKUP_COUNT {
            if storage
                .read(format!("repl.{slot}").as_bytes())
                .unwrap()
                .is_some()
            {
                found += 1;
            }
        }
        assert_eq!(found, SYS_RECORDS_FIRST_WRITE_COPIES);
    }

    #[test]
    fn missing_record_is_none() {
        let storage = MemStorage::new();
        assert!(load_latest_sys_record(&storage, "schema").unwrap().is_none());
    }

    #[test]
    fn header_round_trip() {
        let header = storage_header();
        check_storage_header(&header).unwrap();

        let mut bad = header;
        bad[0] ^= 0xFF;
        let err = check_storage_header(&bad).unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::NotValid);
        assert!(err.to_string().contains("magic"));

        let mut bad_version = header;
        bad_version[4] = 0x7;
        assert!(check_storage_header(&bad_version).is_err());
    }
}
