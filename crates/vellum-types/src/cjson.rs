//! CJSON: compact binary JSON keyed by tag ids.
//!
//! Wire shape per node: a varint header `(tag << 3) | kind`, then the
//! kind-specific body. Object members are encoded in the (sorted) key
//! order of `serde_json::Map`, which makes the encoding canonical:
//! `encode(decode(bytes)) == bytes` for any stream this module produced
//! under an unchanged tags matcher.

use serde_json::Value;
use vellum_error::{Result, VellumError};

use crate::tags::{TagsMatcher, TUPLE_TAG};
use crate::variant::{KvType, Variant, VariantArray};

const KIND_NULL: u64 = 0;
const KIND_BOOL: u64 = 1;
const KIND_INT: u64 = 2;
const KIND_DOUBLE: u64 = 3;
const KIND_STRING: u64 = 4;
const KIND_OBJECT: u64 = 5;
const KIND_ARRAY: u64 = 6;

// ---------------------------------------------------------------------------
// Varint primitives
// ---------------------------------------------------------------------------

pub fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| VellumError::parse_bin("truncated varint"))?;
        *pos += 1;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(VellumError::parse_bin("varint overflow"));
        }
    }
}

pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

// ---------------------------------------------------------------------------
// Encoder / decoder
// ---------------------------------------------------------------------------

/// Encode a document, registering new keys in the tags matcher.
pub fn encode(value: &Value, tm: &mut TagsMatcher) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_node(value, TUPLE_TAG, tm, &mut out)?;
    Ok(out)
}

fn encode_node(value: &Value, tag: u16, tm: &mut TagsMatcher, out: &mut Vec<u8>) -> Result<()> {
    let header = |kind: u64| (u64::from(tag) << 3) | kind;
    match value {
        Value::Null => put_varint(out, header(KIND_NULL)),
        Value::Bool(b) => {
            put_varint(out, header(KIND_BOOL));
            out.push(u8::from(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                put_varint(out, header(KIND_INT));
                put_varint(out, zigzag(i));
            } else {
                let d = n
                    .as_f64()
                    .ok_or_else(|| VellumError::params("unrepresentable number"))?;
                put_varint(out, header(KIND_DOUBLE));
                out.extend_from_slice(&d.to_le_bytes());
            }
        }
        Value::String(s) => {
            put_varint(out, header(KIND_STRING));
            put_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            put_varint(out, header(KIND_ARRAY));
            put_varint(out, items.len() as u64);
            for item in items {
                encode_node(item, TUPLE_TAG, tm, out)?;
            }
        }
        Value::Object(map) => {
            put_varint(out, header(KIND_OBJECT));
            put_varint(out, map.len() as u64);
            for (key, child) in map {
                let child_tag = tm.name_to_tag_mut(key)?;
                encode_node(child, child_tag, tm, out)?;
            }
        }
    }
    Ok(())
}

/// Decode a CJSON stream back into a JSON value.
pub fn decode(bytes: &[u8], tm: &TagsMatcher) -> Result<Value> {
    let mut pos = 0;
    let (_, value) = decode_node(bytes, &mut pos, tm)?;
    if pos != bytes.len() {
        return Err(VellumError::parse_bin("trailing bytes after cjson document"));
    }
    Ok(value)
}

fn decode_node(buf: &[u8], pos: &mut usize, tm: &TagsMatcher) -> Result<(u16, Value)> {
    let header = get_varint(buf, pos)?;
    let kind = header & 0x7;
    let tag = u16::try_from(header >> 3)
        .map_err(|_| VellumError::parse_bin("cjson tag out of range"))?;
    let value = match kind {
        KIND_NULL => Value::Null,
        KIND_BOOL => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| VellumError::parse_bin("truncated bool"))?;
            *pos += 1;
            Value::Bool(b != 0)
        }
        KIND_INT => {
            let raw = get_varint(buf, pos)?;
            Value::from(unzigzag(raw))
        }
        KIND_DOUBLE => {
            let end = *pos + 8;
            let bytes: [u8; 8] = buf
                .get(*pos..end)
                .ok_or_else(|| VellumError::parse_bin("truncated double"))?
                .try_into()
                .expect("slice length checked");
            *pos = end;
            serde_json::Number::from_f64(f64::from_le_bytes(bytes))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        KIND_STRING => {
            let len = get_varint(buf, pos)? as usize;
            let end = *pos + len;
            let s = buf
                .get(*pos..end)
                .ok_or_else(|| VellumError::parse_bin("truncated string"))?;
            *pos = end;
            Value::String(
                std::str::from_utf8(s)
                    .map_err(|_| VellumError::parse_bin("invalid utf-8 in cjson string"))?
                    .to_owned(),
            )
        }
        KIND_ARRAY => {
            let count = get_varint(buf, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_node(buf, pos, tm)?.1);
            }
            Value::Array(items)
        }
        KIND_OBJECT => {
            let count = get_varint(buf, pos)? as usize;
            let mut map = serde_json::Map::new();
            for _ in 0..count {
                let (child_tag, child) = decode_node(buf, pos, tm)?;
                let name = tm
                    .tag_to_name(child_tag)
                    .ok_or_else(|| {
                        VellumError::parse_bin(format!("unknown cjson tag {child_tag}"))
                    })?
                    .to_owned();
                map.insert(name, child);
            }
            Value::Object(map)
        }
        _ => return Err(VellumError::parse_bin(format!("bad cjson kind {kind}"))),
    };
    Ok((tag, value))
}

// ---------------------------------------------------------------------------
// JSON <-> Variant bridges
// ---------------------------------------------------------------------------

/// Scalar conversion; arrays become tuples, objects are not representable
/// as index keys and collapse to their canonical JSON string.
#[must_use]
pub fn json_to_variant(value: &Value) -> Variant {
    match value {
        Value::Null => Variant::Null,
        Value::Bool(b) => Variant::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Variant::Int(small)
                } else {
                    Variant::Int64(i)
                }
            } else {
                Variant::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Variant::from(s.as_str()),
        Value::Array(items) => Variant::Tuple(items.iter().map(json_to_variant).collect()),
        Value::Object(_) => Variant::from(value.to_string()),
    }
}

#[must_use]
pub fn variant_to_json(value: &Variant) -> Value {
    match value {
        Variant::Null => Value::Null,
        Variant::Bool(b) => Value::Bool(*b),
        Variant::Int(v) => Value::from(*v),
        Variant::Int64(v) => Value::from(*v),
        Variant::Double(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Variant::String(s) => Value::String(s.as_str().to_owned()),
        Variant::Tuple(items) => Value::Array(items.iter().map(variant_to_json).collect()),
    }
}

/// Walk a dotted JSON path, flattening arrays along the way, and collect
/// every scalar found into a variant array.
#[must_use]
pub fn extract_json_path(doc: &Value, path: &str) -> VariantArray {
    let mut out = VariantArray::new();
    collect_path(doc, &path.split('.').collect::<Vec<_>>(), &mut out);
    out
}

fn collect_path(node: &Value, segs: &[&str], out: &mut VariantArray) {
    if segs.is_empty() {
        match node {
            Value::Array(items) => {
                for item in items {
                    out.push(json_to_variant(item));
                }
            }
            Value::Null => {}
            other => out.push(json_to_variant(other)),
        }
        return;
    }
    match node {
        Value::Object(map) => {
            if let Some(child) = map.get(segs[0]) {
                collect_path(child, &segs[1..], out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_path(item, segs, out);
            }
        }
        _ => {}
    }
}

/// Convert extracted values to a field's declared type.
pub fn convert_values(values: &VariantArray, target: KvType) -> Result<VariantArray> {
    values.iter().map(|v| v.convert(target)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cjson_round_trip_is_byte_identical() {
        let doc = json!({
            "id": 1,
            "name": "first book",
            "price": 500,
            "tags": ["a", "b"],
            "nested": {"deep": {"x": 1.5}},
            "flag": true,
            "none": null
        });
        let mut tm = TagsMatcher::new();
        let bytes = encode(&doc, &mut tm).unwrap();
        let decoded = decode(&bytes, &tm).unwrap();
        assert_eq!(decoded, doc);
        let bytes2 = encode(&decoded, &mut tm).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn decode_under_merged_matcher() {
        let doc = json!({"a": 1});
        let mut tm_a = TagsMatcher::new();
        let bytes = encode(&doc, &mut tm_a).unwrap();

        let mut tm_b = TagsMatcher::new();
        tm_b.name_to_tag_mut("a").unwrap();
        tm_b.name_to_tag_mut("b").unwrap();
        tm_b.try_merge(&tm_a).unwrap();
        assert_eq!(decode(&bytes, &tm_b).unwrap(), doc);
    }

    #[test]
    fn unknown_tag_is_parse_bin() {
        let doc = json!({"a": 1});
        let mut tm = TagsMatcher::new();
        let bytes = encode(&doc, &mut tm).unwrap();
        let empty = TagsMatcher::new();
        let err = decode(&bytes, &empty).unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::ParseBin);
    }

    #[test]
    fn varint_extremes() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, u64::MAX] {
            buf.clear();
            put_varint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(get_varint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn zigzag_round_trip() {
        for v in [0i64, -1, 1, i64::MIN, i64::MAX, -123_456] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn extract_nested_and_array_paths() {
        let doc = json!({
            "a": {"b": [ {"c": 1}, {"c": 2} ]},
            "s": "x"
        });
        let vals = extract_json_path(&doc, "a.b.c");
        assert_eq!(vals.as_slice(), &[Variant::Int(1), Variant::Int(2)]);
        let vals = extract_json_path(&doc, "s");
        assert_eq!(vals.as_slice(), &[Variant::from("x")]);
        assert!(extract_json_path(&doc, "missing.path").is_empty());
    }

    #[test]
    fn number_widths() {
        assert_eq!(json_to_variant(&json!(5)), Variant::Int(5));
        assert_eq!(
            json_to_variant(&json!(5_000_000_000i64)),
            Variant::Int64(5_000_000_000)
        );
        assert_eq!(json_to_variant(&json!(1.25)), Variant::Double(1.25));
    }
}
