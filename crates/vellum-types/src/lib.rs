//! Core value, payload and tag types for the Vellum engine.
//!
//! Everything that both the index layer and the query layer need to agree
//! on lives here: the dynamically-typed [`Variant`] scalar, collation
//! rules, the tag dictionary ([`TagsMatcher`]) mapping JSON paths to
//! compact ids, the column-struct payload model ([`PayloadType`] /
//! [`PayloadValue`]), the CJSON binary codec, LSNs and the cancellation
//! context threaded through blocking calls.

pub mod cjson;
pub mod context;
pub mod geometry;
pub mod key_string;
pub mod lsn;
pub mod payload;
pub mod tags;
pub mod variant;

pub use context::VxContext;
pub use geometry::Point;
pub use key_string::{CollateMode, KeyString};
pub use lsn::Lsn;
pub use payload::{FieldRef, FieldsSet, PayloadFieldType, PayloadType, PayloadValue};
pub use tags::{TagsMatcher, TagsPath};
pub use variant::{KvType, Variant, VariantArray};

/// Row id: a 32-bit signed index into a namespace's items vector.
pub type IdType = i32;

/// Identifier of a sort order built by an ordered index. `0` means
/// "no sort order"; ordered indexes get ids `1..` in registration order.
pub type SortType = u32;

/// Maximum number of non-composite indexes per namespace.
pub const MAX_INDEXES: usize = 64;
