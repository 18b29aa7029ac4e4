//! WAL record model.

use vellum_types::Lsn;

/// Public, numeric record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
    Empty = 0,
    /// Full item payload (CJSON) written by upsert.
    ItemUpdate = 1,
    /// Item modified in place (update-query row mode).
    ItemModify = 2,
    ItemDelete = 3,
    /// Statement-level update query (SQL text).
    UpdateQuery = 4,
    DeleteQuery = 5,
    IndexAdd = 6,
    IndexUpdate = 7,
    IndexDrop = 8,
    PutMeta = 9,
    SetSchema = 10,
    InitTransaction = 11,
    CommitTransaction = 12,
    Truncate = 13,
}

impl WalRecordType {
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Empty,
            1 => Self::ItemUpdate,
            2 => Self::ItemModify,
            3 => Self::ItemDelete,
            4 => Self::UpdateQuery,
            5 => Self::DeleteQuery,
            6 => Self::IndexAdd,
            7 => Self::IndexUpdate,
            8 => Self::IndexDrop,
            9 => Self::PutMeta,
            10 => Self::SetSchema,
            11 => Self::InitTransaction,
            12 => Self::CommitTransaction,
            13 => Self::Truncate,
            _ => return None,
        })
    }
}

/// One WAL entry: kind, opaque payload and the LSN it was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: WalRecordType,
    pub data: Vec<u8>,
    pub lsn: Lsn,
}

impl WalRecord {
    #[must_use]
    pub fn new(kind: WalRecordType, data: Vec<u8>) -> Self {
        Self {
            kind,
            data,
            lsn: Lsn::EMPTY,
        }
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.data.len() + std::mem::size_of::<Self>()
    }
}
