//! SQL surface for the Vellum engine: lexer, recursive-descent parser and
//! the canonical SQL emitter.

mod emit;
mod lexer;
mod parser;
mod token;

pub use emit::to_sql;
pub use lexer::Lexer;
pub use parser::Parser;
pub use token::{Token, TokenKind};

use vellum_ast::Query;
use vellum_error::Result;

/// Parse one SQL statement.
pub fn parse_sql(sql: &str) -> Result<Query> {
    Parser::parse(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_ast::{
        AggType, CalcTotalMode, CondType, EntryNode, JoinType, OpType, QueryType, UpdateMode,
    };
    use vellum_types::Variant;

    /// SQL -> AST -> SQL -> AST: the two trees must agree and the second
    /// rendering must be stable.
    fn round_trip(sql: &str) -> Query {
        let q = parse_sql(sql).unwrap_or_else(|e| panic!("parse '{sql}': {e}"));
        let emitted = to_sql(&q);
        let q2 = parse_sql(&emitted).unwrap_or_else(|e| panic!("reparse '{emitted}': {e}"));
        assert_eq!(q, q2, "round trip changed the query:\n  in: {sql}\n out: {emitted}");
        assert_eq!(to_sql(&q2), emitted);
        q
    }

    #[test]
    fn select_star() {
        let q = round_trip("SELECT * FROM books");
        assert_eq!(q.namespace, "books");
        assert_eq!(q.query_type, QueryType::Select);
        assert!(q.entries.is_empty());
    }

    #[test]
    fn select_with_conditions() {
        let q = round_trip(
            "SELECT * FROM books WHERE price > 500 AND genre IN ('sf', 'prose') OR pages <= 100",
        );
        assert_eq!(q.entries.items.len(), 3);
        assert_eq!(q.entries.items[2].op, OpType::Or);
        let EntryNode::Condition(qe) = &q.entries.items[1].node else {
            panic!("expected condition")
        };
        assert_eq!(qe.cond, CondType::Set);
        assert_eq!(qe.values.len(), 2);
    }

    #[test]
    fn not_and_brackets() {
        let q = round_trip("SELECT * FROM items WHERE NOT (a = 1 AND b = 2) AND c = 3");
        assert_eq!(q.entries.items[0].op, OpType::Not);
        assert!(matches!(q.entries.items[0].node, EntryNode::Bracket(_)));
    }

    #[test]
    fn diamond_condition_flips_op() {
        let q = round_trip("SELECT * FROM items WHERE a <> 1");
        assert_eq!(q.entries.items[0].op, OpType::Not);
        let EntryNode::Condition(qe) = &q.entries.items[0].node else {
            panic!("expected condition")
        };
        assert_eq!(qe.cond, CondType::Eq);
    }

    #[test]
    fn null_forms() {
        let q = round_trip("SELECT * FROM items WHERE a IS NULL AND b IS NOT NULL");
        let EntryNode::Condition(first) = &q.entries.items[0].node else {
            panic!()
        };
        let EntryNode::Condition(second) = &q.entries.items[1].node else {
            panic!()
        };
        assert_eq!(first.cond, CondType::Empty);
        assert_eq!(second.cond, CondType::Any);
    }

    #[test]
    fn count_and_count_cached() {
        let q = round_trip("SELECT COUNT(*) FROM books");
        assert_eq!(q.calc_total, CalcTotalMode::Accurate);
        assert_eq!(q.limit, Some(0));

        let q = round_trip("SELECT COUNT_CACHED(*) FROM books");
        assert_eq!(q.calc_total, CalcTotalMode::Cached);
    }

    #[test]
    fn aggregations() {
        let q = round_trip("SELECT SUM(price) FROM books WHERE pages > 10");
        assert_eq!(q.aggregations.len(), 1);
        assert_eq!(q.aggregations[0].agg_type, AggType::Sum);

        let q = round_trip("SELECT FACET(genre, year ORDER BY year DESC LIMIT 20) FROM books");
        assert_eq!(q.aggregations[0].fields, vec!["genre", "year"]);
        assert_eq!(q.aggregations[0].limit, Some(20));
        assert!(q.aggregations[0].sort[0].desc);
    }

    #[test]
    fn order_by_and_forced_order() {
        let q = round_trip("SELECT * FROM books ORDER BY price DESC, name");
        assert_eq!(q.sort.len(), 2);
        assert!(q.sort[0].desc);

        let q = round_trip("SELECT * FROM books ORDER BY FIELD(genre, 'sf', 'prose')");
        assert_eq!(q.forced_order.len(), 2);
        assert_eq!(q.sort[0].expression, "genre");
    }

    #[test]
    fn limit_offset() {
        let q = round_trip("SELECT * FROM books LIMIT 10 OFFSET 40");
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, 40);
    }

    #[test]
    fn composite_index_condition() {
        let q = round_trip("SELECT * FROM books WHERE \"price+pages\" = [77777, 88888]");
        let EntryNode::Condition(qe) = &q.entries.items[0].node else {
            panic!()
        };
        assert_eq!(qe.field, "price+pages");
        assert_eq!(
            qe.values[0],
            Variant::Tuple(vec![Variant::Int64(77777), Variant::Int64(88888)])
        );
    }

    #[test]
    fn inner_join() {
        let q = round_trip(
            "SELECT * FROM books INNER JOIN authors ON books.author_id = authors.id WHERE price > 500",
        );
        assert_eq!(q.joins.len(), 1);
        assert_eq!(q.joins[0].join_type, JoinType::InnerJoin);
        assert_eq!(q.joins[0].on[0].left_field, "author_id");
        assert_eq!(q.joins[0].on[0].right_field, "id");
    }

    #[test]
    fn reversed_on_sides_invert() {
        let q = parse_sql(
            "SELECT * FROM books INNER JOIN authors ON authors.id < books.author_id",
        )
        .unwrap();
        assert_eq!(q.joins[0].on[0].left_field, "author_id");
        assert_eq!(q.joins[0].on[0].cond, CondType::Gt);
    }

    #[test]
    fn left_join_and_or_inner() {
        let q = round_trip("SELECT * FROM books LEFT JOIN reviews ON books.id = reviews.book_id");
        assert_eq!(q.joins[0].join_type, JoinType::LeftJoin);
        assert!(q.entries.is_empty());

        let q = round_trip(
            "SELECT * FROM books WHERE price > 1 OR INNER JOIN authors ON books.author_id = authors.id",
        );
        assert_eq!(q.joins[0].join_type, JoinType::OrInnerJoin);
    }

    #[test]
    fn merge_query() {
        let q = round_trip("SELECT * FROM books MERGE(SELECT * FROM old_books WHERE price > 1)");
        assert_eq!(q.merges.len(), 1);
        assert_eq!(q.merges[0].query.namespace, "old_books");
    }

    #[test]
    fn equal_position() {
        let q = round_trip(
            "SELECT * FROM items WHERE sizes = 10 AND prices = 20 equal_position(sizes, prices)",
        );
        assert_eq!(q.entries.equal_positions.len(), 1);

        let err =
            parse_sql("SELECT * FROM items WHERE a = 1 equal_position(a, missing)").unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::ParseSql);
    }

    #[test]
    fn dwithin() {
        let q = round_trip(
            "SELECT * FROM places WHERE ST_DWithin(location, ST_GeomFromText('point (1.0 2.0)'), 5.0)",
        );
        let EntryNode::Condition(qe) = &q.entries.items[0].node else {
            panic!()
        };
        assert_eq!(qe.cond, CondType::DWithin);
    }

    #[test]
    fn update_set_forms() {
        let q = round_trip("UPDATE books SET price = 990 WHERE id = 7");
        assert_eq!(q.query_type, QueryType::Update);
        assert_eq!(q.updates[0].mode, UpdateMode::Set);

        let q = round_trip("UPDATE books SET tags = ['a', 'b'] WHERE id = 7");
        assert!(q.updates[0].is_array);
        assert_eq!(q.updates[0].values.len(), 2);

        let q = round_trip("UPDATE books SET price = price + 10 WHERE id = 7");
        assert!(q.updates[0].is_expression);

        let q = round_trip("UPDATE books SET info = {\"a\": 1} WHERE id = 7");
        assert_eq!(q.updates[0].mode, UpdateMode::SetJson);
    }

    #[test]
    fn update_drop() {
        let q = round_trip("UPDATE books DROP stale, old_price WHERE id > 0");
        assert_eq!(q.updates.len(), 2);
        assert!(q.updates.iter().all(|u| u.mode == UpdateMode::Drop));
    }

    #[test]
    fn delete_and_truncate() {
        let q = round_trip("DELETE FROM books WHERE price = 0");
        assert_eq!(q.query_type, QueryType::Delete);

        let q = round_trip("TRUNCATE books");
        assert_eq!(q.query_type, QueryType::Truncate);
    }

    #[test]
    fn explain_prefix() {
        let q = round_trip("EXPLAIN SELECT * FROM books WHERE price > 1");
        assert!(q.explain);
    }

    #[test]
    fn rank_in_select_list() {
        let q = round_trip("SELECT RANK(), * FROM books WHERE name LIKE 'war%'");
        assert!(q.with_rank);
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = parse_sql("SELEC * FROM books").unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::ParseSql);

        let err = parse_sql("SELECT * FROM books WHERE").unwrap_err();
        assert_eq!(err.code(), vellum_error::ErrorCode::ParseSql);

        let err = parse_sql("SELECT * books").unwrap_err();
        assert!(err.to_string().contains("FROM"));
    }

    #[test]
    fn sql_to_dsl_and_back() {
        let sql = "SELECT * FROM books WHERE price > 500 AND genre IN ('sf') ORDER BY price DESC LIMIT 5";
        let q = parse_sql(sql).unwrap();
        let dsl = vellum_ast::dsl::to_dsl_string(&q);
        let q2 = vellum_ast::dsl::from_dsl_string(&dsl).unwrap();
        assert_eq!(q, q2);
        assert_eq!(to_sql(&q2), to_sql(&q));
    }
}
