//! Property tests for the binary primitives and the CJSON codec.

use proptest::prelude::*;
use serde_json::{json, Value};
use vellum_types::cjson::{decode, encode, get_varint, put_varint, unzigzag, zigzag};
use vellum_types::TagsMatcher;

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        // finite doubles only: NaN is not representable in json
        (-1.0e12f64..1.0e12).prop_map(Value::from),
        "[a-zA-Z0-9 _-]{0,24}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_][a-z0-9_]{0,10}", inner, 0..6)
                .prop_map(|m| { json!(m) }),
        ]
    })
}

proptest! {
    #[test]
    fn varint_round_trip(v in any::<u64>()) {
        let mut buf = Vec::new();
        put_varint(&mut buf, v);
        let mut pos = 0;
        prop_assert_eq!(get_varint(&buf, &mut pos).unwrap(), v);
        prop_assert_eq!(pos, buf.len());
    }

    #[test]
    fn zigzag_round_trip(v in any::<i64>()) {
        prop_assert_eq!(unzigzag(zigzag(v)), v);
    }

    #[test]
    fn cjson_decode_restores_document(doc in arb_json()) {
        let mut tm = TagsMatcher::new();
        let bytes = encode(&doc, &mut tm).unwrap();
        let decoded = decode(&bytes, &tm).unwrap();
        prop_assert_eq!(&decoded, &doc);
    }

    #[test]
    fn cjson_reencode_is_byte_identical(doc in arb_json()) {
        let mut tm = TagsMatcher::new();
        let bytes = encode(&doc, &mut tm).unwrap();
        let decoded = decode(&bytes, &tm).unwrap();
        let bytes2 = encode(&decoded, &mut tm).unwrap();
        prop_assert_eq!(bytes, bytes2);
    }
}
