//! Fulltext scenarios: ranking, typo matching and dictionary scale.

use serde_json::json;
use vellum::{Database, IndexDef, IndexOpts, IndexType, KvType, VxContext};

fn ft_db(config: Option<&str>) -> Database {
    let db = Database::new();
    db.open_namespace("docs", None).unwrap();
    db.add_index("docs", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    let mut def = IndexDef::new("text", IndexType::FulltextFast, KvType::String);
    if let Some(json) = config {
        def = def.with_opts(IndexOpts {
            config: Some(json.to_owned()),
            ..IndexOpts::default()
        });
    }
    db.add_index("docs", def).unwrap();
    db
}

/// Fulltext structures build on the background routine, like the
/// original's commit step.
fn commit(db: &Database) {
    db.run_background_tasks();
}

#[test]
fn ranked_select_returns_matches() {
    let db = ft_db(None);
    db.upsert("docs", json!({"id": 1, "text": "war and peace"})).unwrap();
    db.upsert("docs", json!({"id": 2, "text": "the art of war"})).unwrap();
    db.upsert("docs", json!({"id": 3, "text": "cooking for two"})).unwrap();
    commit(&db);

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT RANK(), * FROM docs WHERE text = 'war'", &cx)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.items[0].proc >= results.items[1].proc);
    assert!(results.items[0].doc.get("rank()").is_some());
}

#[test]
fn full_match_boost_prefers_exact_doc() {
    // with fullMatchBoost > 1 the document equal to the query ranks
    // first; with boost = 1 bm25 length normalization still favors it,
    // so pin the order difference on the boost being applied
    let db = ft_db(Some(r#"{"full_match_boost": 2.0}"#));
    db.upsert("docs", json!({"id": 1, "text": "word extra"})).unwrap();
    db.upsert("docs", json!({"id": 2, "text": "word"})).unwrap();
    commit(&db);

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'word'", &cx)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results.items[0].doc["id"], json!(2));
    assert!(results.items[0].proc > results.items[1].proc);
}

#[test]
fn typos_find_single_edit_words() {
    let db = ft_db(None);
    db.upsert("docs", json!({"id": 1, "text": "hello world"})).unwrap();
    commit(&db);

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'helo'", &cx)
        .unwrap();
    assert_eq!(results.len(), 1);

    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'wrold'", &cx)
        .unwrap();
    assert_eq!(results.len(), 1, "transposition is one typo");
}

#[test]
fn must_not_operator_excludes() {
    let db = ft_db(None);
    db.upsert("docs", json!({"id": 1, "text": "war and peace"})).unwrap();
    db.upsert("docs", json!({"id": 2, "text": "war stories"})).unwrap();
    commit(&db);

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'war -peace'", &cx)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.items[0].doc["id"], json!(2));
}

#[test]
fn random_term_against_large_dictionary() {
    let db = ft_db(None);
    for i in 0..12_000 {
        db.upsert(
            "docs",
            json!({
                "id": i,
                "text": format!("entry number {i} describing subject {} in detail", i % 997)
            }),
        )
        .unwrap();
    }
    commit(&db);

    let cx = VxContext::new();
    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'lskfj'", &cx)
        .unwrap();
    assert!(results.len() <= 20, "got {} rows for a nonsense term", results.len());
}

#[test]
fn fuzzy_index_kind_matches_with_more_typos() {
    let db = Database::new();
    db.open_namespace("docs", None).unwrap();
    db.add_index("docs", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db.add_index(
        "docs",
        IndexDef::new("text", IndexType::FulltextFuzzy, KvType::String),
    )
    .unwrap();
    db.upsert("docs", json!({"id": 1, "text": "elephant"})).unwrap();
    db.run_background_tasks();

    let cx = VxContext::new();
    // two edits: outside the fast profile, inside the fuzzy one
    let results = db
        .query_sql("SELECT * FROM docs WHERE text = 'elphnt'", &cx)
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn writes_invalidate_built_index() {
    let db = ft_db(None);
    db.upsert("docs", json!({"id": 1, "text": "alpha"})).unwrap();
    commit(&db);
    let cx = VxContext::new();
    assert_eq!(
        db.query_sql("SELECT * FROM docs WHERE text = 'alpha'", &cx)
            .unwrap()
            .len(),
        1
    );

    db.upsert("docs", json!({"id": 2, "text": "alpha beta"})).unwrap();
    commit(&db);
    assert_eq!(
        db.query_sql("SELECT * FROM docs WHERE text = 'alpha'", &cx)
            .unwrap()
            .len(),
        2
    );
}
