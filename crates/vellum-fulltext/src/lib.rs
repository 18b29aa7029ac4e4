//! Full-text search engine for the Vellum document database.
//!
//! Pipeline: tokenized field texts build a word map (up to 8 worker
//! threads), a suffix array and deletion-signature typo maps; queries
//! expand each term into variants (translit, keyboard layout, stems,
//! synonyms), look up exact/prefix/suffix/typo matches and merge per
//! virtual document with BM25, positional and proximity ranking.

pub mod config;
pub mod dsl;
pub mod holder;
pub mod index;
pub mod select;
pub mod tokenizer;
pub mod typos;
pub mod variants;

pub use config::{FtConfig, FtFieldConfig};
pub use dsl::{parse_dsl, FtDslTerm, FtOp};
pub use index::FulltextIndex;
pub use select::{FtArea, FtMergeInfo};
