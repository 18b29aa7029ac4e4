//! Index definitions as stored in namespace metadata.

use serde::{Deserialize, Serialize};
use vellum_error::{Result, VellumError};
use vellum_types::{CollateMode, KvType};

/// Index kind, using the public string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// Unordered hash map.
    #[serde(rename = "hash")]
    Hash,
    /// Ordered b-tree map.
    #[serde(rename = "tree")]
    Tree,
    /// Column store: comparator-only, no structural select.
    #[serde(rename = "-")]
    Store,
    /// Ordered int64 with expiration.
    #[serde(rename = "ttl")]
    Ttl,
    /// Fast fulltext.
    #[serde(rename = "text")]
    FulltextFast,
    /// Typo-heavy fulltext profile.
    #[serde(rename = "fuzzytext")]
    FulltextFuzzy,
    /// Geo point index.
    #[serde(rename = "rtree")]
    Rtree,
}

impl IndexType {
    #[must_use]
    pub fn is_fulltext(self) -> bool {
        matches!(self, Self::FulltextFast | Self::FulltextFuzzy)
    }

    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Tree | Self::Ttl)
    }
}

/// Index options; the serialized form is wire-stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOpts {
    pub pk: bool,
    pub dense: bool,
    pub array: bool,
    pub sparse: bool,
    #[serde(with = "collate_serde")]
    pub collate: CollateMode,
    /// Seconds after which ttl-indexed items expire.
    pub expire_after: Option<i64>,
    /// JSON blob with fulltext configuration.
    pub config: Option<String>,
}

mod collate_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use vellum_types::CollateMode;

    pub fn serialize<S: Serializer>(mode: &CollateMode, s: S) -> Result<S::Ok, S::Error> {
        match mode {
            CollateMode::None => "none".serialize(s),
            CollateMode::Ascii => "ascii".serialize(s),
            CollateMode::Utf8 => "utf8".serialize(s),
            CollateMode::Numeric => "numeric".serialize(s),
            CollateMode::Custom(order) => format!("custom:{order}").serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CollateMode, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(match raw.as_str() {
            "" | "none" => CollateMode::None,
            "ascii" => CollateMode::Ascii,
            "utf8" => CollateMode::Utf8,
            "numeric" => CollateMode::Numeric,
            other => match other.strip_prefix("custom:") {
                Some(order) => CollateMode::Custom(order.to_owned()),
                None => return Err(serde::de::Error::custom(format!("bad collate '{raw}'"))),
            },
        })
    }
}

/// Full index definition: name, source json paths, kind and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    #[serde(default)]
    pub json_paths: Vec<String>,
    pub field_type: KvType,
    pub index_type: IndexType,
    #[serde(default)]
    pub opts: IndexOpts,
}

impl IndexDef {
    #[must_use]
    pub fn new(name: impl Into<String>, index_type: IndexType, field_type: KvType) -> Self {
        let name = name.into();
        Self {
            json_paths: vec![name.clone()],
            name,
            field_type,
            index_type,
            opts: IndexOpts::default(),
        }
    }

    #[must_use]
    pub fn with_opts(mut self, opts: IndexOpts) -> Self {
        self.opts = opts;
        self
    }

    #[must_use]
    pub fn pk(mut self) -> Self {
        self.opts.pk = true;
        self
    }

    /// Composite indexes are named `a+b`; components reference other
    /// indexes or json paths.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.name.contains('+')
    }

    #[must_use]
    pub fn components(&self) -> Vec<&str> {
        if self.is_composite() {
            self.name.split('+').collect()
        } else {
            Vec::new()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VellumError::params("index name is empty"));
        }
        if self.opts.pk && self.opts.sparse {
            return Err(VellumError::params(format!(
                "PK index '{}' can not be sparse",
                self.name
            )));
        }
        if self.opts.pk && self.opts.array {
            return Err(VellumError::params(format!(
                "PK index '{}' can not be an array",
                self.name
            )));
        }
        if self.is_composite() && self.opts.array && !self.index_type.is_fulltext() {
            return Err(VellumError::params(format!(
                "composite index '{}' can not be an array",
                self.name
            )));
        }
        if self.index_type == IndexType::Ttl && self.field_type != KvType::Int64 {
            return Err(VellumError::params(format!(
                "ttl index '{}' must be int64",
                self.name
            )));
        }
        if self.index_type == IndexType::Rtree && self.opts.sparse {
            return Err(VellumError::params(format!(
                "rtree index '{}' can not be sparse",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let def = IndexDef::new("price", IndexType::Tree, KvType::Int64).with_opts(IndexOpts {
            dense: true,
            collate: CollateMode::Numeric,
            ..IndexOpts::default()
        });
        let json = serde_json::to_string(&def).unwrap();
        let back: IndexDef = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
        assert!(json.contains("\"tree\""));
        assert!(json.contains("numeric"));
    }

    #[test]
    fn store_type_serializes_as_dash() {
        let def = IndexDef::new("blob", IndexType::Store, KvType::String);
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("\"-\""));
    }

    #[test]
    fn composite_detection() {
        let def = IndexDef::new("price+pages", IndexType::Hash, KvType::Composite);
        assert!(def.is_composite());
        assert_eq!(def.components(), vec!["price", "pages"]);
    }

    #[test]
    fn validation_rules() {
        let mut def = IndexDef::new("id", IndexType::Hash, KvType::Int).pk();
        def.opts.array = true;
        assert!(def.validate().is_err());

        let def = IndexDef::new("ttl_at", IndexType::Ttl, KvType::String);
        assert!(def.validate().is_err());

        let mut def = IndexDef::new("price+pages", IndexType::Hash, KvType::Composite);
        def.opts.array = true;
        assert!(def.validate().is_err());
    }

    #[test]
    fn custom_collate_round_trip() {
        let def = IndexDef::new("name", IndexType::Tree, KvType::String).with_opts(IndexOpts {
            collate: CollateMode::Custom("яюэ".into()),
            ..IndexOpts::default()
        });
        let json = serde_json::to_string(&def).unwrap();
        let back: IndexDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.opts.collate, CollateMode::Custom("яюэ".into()));
    }
}
