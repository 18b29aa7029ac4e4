//! End-to-end engine scenarios: item CRUD, composite filters, joins,
//! aggregations, WAL observation and boundary behaviors.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use vellum::{
    Database, IndexDef, IndexType, KvType, Lsn, NamespaceConfig, UpdatesObserver, Variant,
    VxContext, WalRecord, WalRecordType,
};

fn books_db() -> Database {
    let db = Database::new();
    db.open_namespace("books", None).unwrap();
    db.add_index("books", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db.add_index("books", IndexDef::new("price", IndexType::Tree, KvType::Int64))
        .unwrap();
    db.add_index("books", IndexDef::new("pages", IndexType::Hash, KvType::Int64))
        .unwrap();
    db
}

#[test]
fn pk_upsert_idempotence() {
    let db = books_db();
    db.upsert("books", json!({"id": 1, "name": "a"})).unwrap();
    db.upsert("books", json!({"id": 1, "name": "a"})).unwrap();

    let cx = VxContext::new();
    let results = db.query_sql("SELECT * FROM books WHERE id = 1", &cx).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["name"], json!("a"));
}

#[test]
fn composite_index_filter() {
    let db = books_db();
    db.add_index(
        "books",
        IndexDef::new("price+pages", IndexType::Hash, KvType::Composite),
    )
    .unwrap();

    for i in 0..100 {
        db.upsert(
            "books",
            json!({"id": i, "price": 1000 + i, "pages": 100 + i}),
        )
        .unwrap();
    }
    db.upsert(
        "books",
        json!({
            "id": 300,
            "price": 77777,
            "pages": 88888,
            "title": "test book1 title",
            "name": "test book1 name"
        }),
    )
    .unwrap();

    let cx = VxContext::new();
    let results = db
        .query_sql(
            "SELECT * FROM books WHERE \"price+pages\" = [77777, 88888]",
            &cx,
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["id"], json!(300));
    assert_eq!(results.items[0].doc["title"], json!("test book1 title"));
}

#[test]
fn join_pushdown_equivalence() {
    let db = books_db();
    db.open_namespace("authors", None).unwrap();
    db.add_index("authors", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db.add_index(
        "authors",
        IndexDef::new("rating", IndexType::Tree, KvType::Int64),
    )
    .unwrap();
    db.add_index(
        "books",
        IndexDef::new("author_id", IndexType::Hash, KvType::Int),
    )
    .unwrap();

    // the right side yields exactly 10 ids
    for i in 0..10 {
        db.upsert("authors", json!({"id": i, "rating": 5})).unwrap();
    }
    // books reference 30 author ids, so 2/3 dangle
    for i in 0..200 {
        db.upsert(
            "books",
            json!({"id": i, "author_id": i % 30, "price": 400 + (i % 20) * 10}),
        )
        .unwrap();
    }

    let cx = VxContext::new();
    let joined = db
        .query_sql(
            "SELECT * FROM books INNER JOIN authors ON books.author_id = authors.id \
             WHERE price > 500",
            &cx,
        )
        .unwrap();

    let expected = db
        .query_sql(
            "SELECT * FROM books WHERE author_id IN (0, 1, 2, 3, 4, 5, 6, 7, 8, 9) \
             AND price > 500",
            &cx,
        )
        .unwrap();

    let mut join_ids: Vec<i32> = joined.items.iter().map(|i| i.id).collect();
    let mut in_ids: Vec<i32> = expected.items.iter().map(|i| i.id).collect();
    join_ids.sort_unstable();
    in_ids.sort_unstable();
    assert!(!in_ids.is_empty());
    assert_eq!(join_ids, in_ids);
}

#[test]
fn left_join_attaches_rows() {
    let db = books_db();
    db.open_namespace("reviews", None).unwrap();
    db.add_index("reviews", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db.add_index(
        "reviews",
        IndexDef::new("book_id", IndexType::Hash, KvType::Int),
    )
    .unwrap();

    db.upsert("books", json!({"id": 1, "price": 10})).unwrap();
    db.upsert("books", json!({"id": 2, "price": 20})).unwrap();
    db.upsert("reviews", json!({"id": 100, "book_id": 1, "stars": 5}))
        .unwrap();

    let cx = VxContext::new();
    let results = db
        .query_sql(
            "SELECT * FROM books LEFT JOIN reviews ON books.id = reviews.book_id",
            &cx,
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    let with_reviews = results
        .items
        .iter()
        .find(|item| item.doc["id"] == json!(1))
        .unwrap();
    assert_eq!(with_reviews.joined[0].len(), 1);
    assert_eq!(with_reviews.joined[0][0]["stars"], json!(5));
    let without = results
        .items
        .iter()
        .find(|item| item.doc["id"] == json!(2))
        .unwrap();
    assert!(without.joined[0].is_empty());
}

struct LsnCollector {
    seen: Mutex<Vec<Lsn>>,
}

impl UpdatesObserver for LsnCollector {
    fn on_wal_record(&self, lsn: Lsn, _origin: Lsn, _ns: &str, record: &WalRecord) {
        if record.kind == WalRecordType::ItemUpdate || record.kind == WalRecordType::ItemDelete {
            self.seen.lock().push(lsn);
        }
    }
}

#[test]
fn wal_lsn_monotonicity_with_server_id() {
    let db = Database::with_config(NamespaceConfig::default(), 7);
    let collector = Arc::new(LsnCollector {
        seen: Mutex::new(Vec::new()),
    });
    db.subscribe_updates(collector.clone());

    db.open_namespace("events", None).unwrap();
    db.add_index("events", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();

    for i in 0..20 {
        if i % 5 == 4 {
            db.delete("events", json!({"id": i - 1})).unwrap();
        } else {
            db.upsert("events", json!({"id": i, "n": i})).unwrap();
        }
    }

    let seen = collector.seen.lock();
    assert!(!seen.is_empty());
    let start = seen[0].counter();
    for (offset, lsn) in seen.iter().enumerate() {
        assert_eq!(lsn.counter(), start + offset as i64, "lsn gap at {offset}");
        assert_eq!(lsn.server_id(), 7);
    }
}

#[test]
fn empty_namespace_boundaries() {
    let db = books_db();
    let cx = VxContext::new();

    let results = db.query_sql("SELECT COUNT(*) FROM books", &cx).unwrap();
    assert_eq!(results.total_count, Some(0));
    assert!(results.is_empty());

    let results = db.query_sql("SELECT * FROM books", &cx).unwrap();
    assert!(results.is_empty());

    let results = db.query_sql("SELECT SUM(price) FROM books", &cx).unwrap();
    assert_eq!(results.aggregations[0].value, Some(0.0));

    let results = db.query_sql("SELECT MIN(price) FROM books", &cx).unwrap();
    assert_eq!(results.aggregations[0].value, None);
}

#[test]
fn sorting_and_forced_order() {
    let db = books_db();
    for (id, price, genre) in [(1, 30, "sf"), (2, 10, "prose"), (3, 20, "poetry")] {
        db.upsert("books", json!({"id": id, "price": price, "genre": genre}))
            .unwrap();
    }
    let cx = VxContext::new();

    let results = db
        .query_sql("SELECT * FROM books ORDER BY price DESC", &cx)
        .unwrap();
    let prices: Vec<i64> = results
        .items
        .iter()
        .map(|i| i.doc["price"].as_i64().unwrap())
        .collect();
    assert_eq!(prices, vec![30, 20, 10]);

    let results = db
        .query_sql(
            "SELECT * FROM books ORDER BY FIELD(genre, 'poetry', 'prose')",
            &cx,
        )
        .unwrap();
    let genres: Vec<&str> = results
        .items
        .iter()
        .map(|i| i.doc["genre"].as_str().unwrap())
        .collect();
    assert_eq!(genres[0], "poetry");
    assert_eq!(genres[1], "prose");
    assert_eq!(genres[2], "sf");

    let results = db
        .query_sql("SELECT * FROM books ORDER BY 'price * 2' DESC LIMIT 1", &cx)
        .unwrap();
    assert_eq!(results.items[0].doc["id"], json!(1));
}

#[test]
fn aggregations_and_facets() {
    let db = books_db();
    for (id, price, genre) in [
        (1, 100, "sf"),
        (2, 200, "sf"),
        (3, 300, "prose"),
        (4, 400, "sf"),
    ] {
        db.upsert("books", json!({"id": id, "price": price, "genre": genre}))
            .unwrap();
    }
    let cx = VxContext::new();

    let results = db
        .query_sql("SELECT SUM(price), AVG(price) FROM books", &cx)
        .unwrap();
    assert_eq!(results.aggregations[0].value, Some(1000.0));
    assert_eq!(results.aggregations[1].value, Some(250.0));

    let results = db
        .query_sql("SELECT FACET(genre ORDER BY count DESC) FROM books", &cx)
        .unwrap();
    let facets = &results.aggregations[0].facets;
    assert_eq!(facets[0].values[0], Variant::from("sf"));
    assert_eq!(facets[0].count, 3);
    assert_eq!(facets[1].count, 1);

    let results = db
        .query_sql("SELECT DISTINCT(genre) FROM books", &cx)
        .unwrap();
    assert_eq!(results.aggregations[0].distinct.len(), 2);
}

#[test]
fn update_and_delete_queries() {
    let db = books_db();
    for i in 0..10 {
        db.upsert("books", json!({"id": i, "price": i * 100})).unwrap();
    }
    let cx = VxContext::new();

    let updated = db
        .query_sql("UPDATE books SET price = 1 WHERE price >= 500", &cx)
        .unwrap();
    assert_eq!(updated.len(), 5);
    let check = db
        .query_sql("SELECT COUNT(*) FROM books WHERE price = 1", &cx)
        .unwrap();
    assert_eq!(check.total_count, Some(5));

    let updated = db
        .query_sql("UPDATE books SET price = price + 10 WHERE id = 0", &cx)
        .unwrap();
    assert_eq!(updated.items[0].doc["price"], json!(11));

    let deleted = db
        .query_sql("DELETE FROM books WHERE price = 1", &cx)
        .unwrap();
    assert_eq!(deleted.len(), 5);
    let rest = db.query_sql("SELECT COUNT(*) FROM books", &cx).unwrap();
    assert_eq!(rest.total_count, Some(5));
}

#[test]
fn update_drop_field() {
    let db = books_db();
    db.upsert("books", json!({"id": 1, "stale": "x", "keep": 1}))
        .unwrap();
    let cx = VxContext::new();
    db.query_sql("UPDATE books DROP stale WHERE id = 1", &cx)
        .unwrap();
    let results = db.query_sql("SELECT * FROM books WHERE id = 1", &cx).unwrap();
    assert!(results.items[0].doc.get("stale").is_none());
    assert_eq!(results.items[0].doc["keep"], json!(1));
}

#[test]
fn brackets_and_not() {
    let db = books_db();
    for i in 0..10 {
        db.upsert("books", json!({"id": i, "price": i, "pages": 10 - i}))
            .unwrap();
    }
    let cx = VxContext::new();
    let results = db
        .query_sql(
            "SELECT * FROM books WHERE NOT (price < 3 OR pages < 3) AND id < 9",
            &cx,
        )
        .unwrap();
    for item in &results.items {
        let price = item.doc["price"].as_i64().unwrap();
        let pages = item.doc["pages"].as_i64().unwrap();
        assert!(price >= 3 && pages >= 3);
    }
    assert_eq!(results.len(), 5);
}

#[test]
fn between_fields_condition() {
    let db = books_db();
    for (id, price, pages) in [(1, 10, 20), (2, 30, 20), (3, 20, 20)] {
        db.upsert("books", json!({"id": id, "price": price, "pages": pages}))
            .unwrap();
    }
    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM books WHERE price > pages", &cx)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["id"], json!(2));
}

#[test]
fn meta_and_schema_round_trip() {
    let db = Database::new();
    let storage = Arc::new(vellum::MemStorage::new());
    db.open_namespace("cfg", Some(storage)).unwrap();
    db.add_index("cfg", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();

    db.put_meta("cfg", "version", "42").unwrap();
    assert_eq!(db.get_meta("cfg", "version").unwrap().as_deref(), Some("42"));
    assert_eq!(db.enum_meta("cfg").unwrap(), vec!["version".to_owned()]);

    let schema = json!({"type": "object", "properties": {"id": {"type": "integer"}}});
    db.set_schema("cfg", schema.clone()).unwrap();
    assert_eq!(db.get_schema("cfg").unwrap(), Some(schema));
}

#[test]
fn rename_and_stats() {
    let db = books_db();
    db.upsert("books", json!({"id": 1, "price": 1})).unwrap();
    db.rename_namespace("books", "library").unwrap();
    let cx = VxContext::new();
    let results = db.query_sql("SELECT * FROM library", &cx).unwrap();
    assert_eq!(results.len(), 1);

    let mem = db.get_mem_stat("library").unwrap();
    assert_eq!(mem.items_count, 1);
    assert!(mem.items_size > 0);
    let perf = db.get_perf_stat("library").unwrap();
    assert!(perf.selects >= 1);
    assert!(perf.updates >= 1);
}

#[test]
fn equal_position_requires_same_array_slot() {
    let db = Database::new();
    db.open_namespace("items", None).unwrap();
    db.add_index("items", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();

    // sizes/prices are parallel arrays: the pair (10, 100) exists only
    // in the first document
    db.upsert(
        "items",
        json!({"id": 1, "sizes": [10, 20], "prices": [100, 200]}),
    )
    .unwrap();
    db.upsert(
        "items",
        json!({"id": 2, "sizes": [10, 20], "prices": [200, 100]}),
    )
    .unwrap();

    let cx = VxContext::new();
    let results = db
        .query_sql(
            "SELECT * FROM items WHERE sizes = 10 AND prices = 100 equal_position(sizes, prices)",
            &cx,
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["id"], json!(1));

    // without the constraint both match
    let results = db
        .query_sql("SELECT * FROM items WHERE sizes = 10 AND prices = 100", &cx)
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn dwithin_geo_query() {
    let db = Database::new();
    db.open_namespace("places", None).unwrap();
    db.add_index("places", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db.add_index(
        "places",
        IndexDef::new("location", IndexType::Rtree, KvType::Double),
    )
    .unwrap();

    db.upsert("places", json!({"id": 1, "location": [0.5, 0.5]}))
        .unwrap();
    db.upsert("places", json!({"id": 2, "location": [50.0, 50.0]}))
        .unwrap();

    let cx = VxContext::new();
    let results = db
        .query_sql(
            "SELECT * FROM places WHERE ST_DWithin(location, ST_GeomFromText('point (0.0 0.0)'), 2.0)",
            &cx,
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["id"], json!(1));
}

#[test]
fn explain_reports_plan() {
    let db = books_db();
    db.upsert("books", json!({"id": 1, "price": 5})).unwrap();
    let cx = VxContext::new();
    let results = db
        .query_sql("EXPLAIN SELECT * FROM books WHERE price > 1", &cx)
        .unwrap();
    let explain = results.explain.expect("explain requested");
    assert!(!explain.selectors.is_empty());
}

#[test]
fn merge_queries_combine_namespaces() {
    let db = books_db();
    db.open_namespace("old_books", None).unwrap();
    db.add_index(
        "old_books",
        IndexDef::new("id", IndexType::Hash, KvType::Int).pk(),
    )
    .unwrap();

    db.upsert("books", json!({"id": 1, "price": 10})).unwrap();
    db.upsert("old_books", json!({"id": 100, "price": 1})).unwrap();

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM books MERGE(SELECT * FROM old_books)", &cx)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.items.iter().any(|i| i.ns_id == 1));
}
