//! Property tests: generated queries survive the binary wire format and
//! the JSON DSL unchanged.

use proptest::prelude::*;
use smallvec::SmallVec;
use vellum_ast::{
    dsl, wire, CalcTotalMode, CondType, EntryNode, EntryTree, OpType, Query, QueryEntry,
    SortEntry,
};
use vellum_types::{Variant, VariantArray};

fn arb_variant() -> impl Strategy<Value = Variant> {
    prop_oneof![
        any::<i32>().prop_map(Variant::Int),
        any::<i64>().prop_map(Variant::Int64),
        (-1.0e9f64..1.0e9).prop_map(Variant::Double),
        any::<bool>().prop_map(Variant::Bool),
        "[a-z0-9 ]{0,12}".prop_map(Variant::from),
    ]
}

fn arb_cond() -> impl Strategy<Value = CondType> {
    prop_oneof![
        Just(CondType::Eq),
        Just(CondType::Lt),
        Just(CondType::Le),
        Just(CondType::Gt),
        Just(CondType::Ge),
        Just(CondType::Set),
        Just(CondType::Range),
        Just(CondType::AllSet),
    ]
}

fn arb_op() -> impl Strategy<Value = OpType> {
    prop_oneof![Just(OpType::And), Just(OpType::Or), Just(OpType::Not)]
}

fn arb_entry() -> impl Strategy<Value = (OpType, EntryNode)> {
    (
        arb_op(),
        "[a-z][a-z0-9_]{0,8}",
        arb_cond(),
        prop::collection::vec(arb_variant(), 1..4),
    )
        .prop_map(|(op, field, cond, values)| {
            let values: VariantArray = SmallVec::from_vec(values);
            (
                op,
                EntryNode::Condition(QueryEntry {
                    field,
                    cond,
                    values,
                }),
            )
        })
}

fn arb_query() -> impl Strategy<Value = Query> {
    (
        "[a-z][a-z0-9_]{0,10}",
        prop::collection::vec(arb_entry(), 0..5),
        prop::option::of(0usize..1000),
        0usize..100,
        prop_oneof![
            Just(CalcTotalMode::None),
            Just(CalcTotalMode::Accurate),
            Just(CalcTotalMode::Cached)
        ],
        prop::collection::vec(("[a-z][a-z0-9_]{0,6}", any::<bool>()), 0..3),
        any::<bool>(),
    )
        .prop_map(
            |(namespace, entries, limit, offset, calc_total, sort, explain)| {
                let mut q = Query::new(namespace);
                for (op, node) in entries {
                    q.entries.push(op, node);
                }
                q.limit = limit;
                q.offset = offset;
                q.calc_total = calc_total;
                for (expression, desc) in sort {
                    q.sort.push(SortEntry { expression, desc });
                }
                q.explain = explain;
                q
            },
        )
}

proptest! {
    #[test]
    fn wire_round_trip(q in arb_query()) {
        let bytes = wire::serialize(&q);
        let parsed = wire::parse(&bytes).unwrap();
        prop_assert_eq!(&parsed, &q);
        prop_assert_eq!(wire::serialize(&parsed), bytes);
    }

    #[test]
    fn dsl_round_trip(q in arb_query()) {
        let rendered = dsl::to_dsl_string(&q);
        let parsed = dsl::from_dsl_string(&rendered).unwrap();
        prop_assert_eq!(&parsed, &q);
        prop_assert_eq!(dsl::to_dsl_string(&parsed), rendered);
    }

    #[test]
    fn nested_brackets_survive_the_wire(
        outer in prop::collection::vec(arb_entry(), 1..3),
        inner in prop::collection::vec(arb_entry(), 1..3),
        op in arb_op(),
    ) {
        let mut tree = EntryTree::default();
        for (op, node) in inner {
            tree.push(op, node);
        }
        let mut q = Query::new("ns");
        for (op, node) in outer {
            q.entries.push(op, node);
        }
        q.entries.push(op, EntryNode::Bracket(tree));

        let parsed = wire::parse(&wire::serialize(&q)).unwrap();
        prop_assert_eq!(parsed, q);
    }
}
