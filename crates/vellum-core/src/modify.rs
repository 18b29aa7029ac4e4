//! Update and delete query execution.
//!
//! Both reuse the select executor for row discovery. Replication mode:
//! a pure statement update touching at least the threshold row count
//! (and no limit/offset/json-object/expression) replicates as one WAL
//! record; everything else replicates row by row as CJSON.

use serde_json::Value;
use tracing::debug;
use vellum_ast::{Query, QueryType, UpdateEntry, UpdateMode};
use vellum_error::{Result, VellumError};
use vellum_types::cjson::{self, variant_to_json};
use vellum_types::{IdType, Lsn, VariantArray, VxContext};
use vellum_wal::WalRecordType;

use crate::item::ItemData;
use crate::namespace::NamespaceImpl;
use crate::query_results::QueryResults;
use crate::selecter::{execute_select, JoinedNamespaces};
use crate::sortexpr::SortExpr;

fn as_select(q: &Query) -> Query {
    let mut select = q.clone();
    select.query_type = QueryType::Select;
    select.updates.clear();
    select
}

/// Execute `DELETE FROM ... WHERE ...`.
pub fn execute_delete(ns: &mut NamespaceImpl, q: &Query, cx: &VxContext) -> Result<QueryResults> {
    cx.check()?;
    ns.repl.check_write(false)?;
    let selected = execute_select(ns, &as_select(q), &JoinedNamespaces::new(), cx)?;
    let ids: Vec<IdType> = selected.items.iter().map(|item| item.id).collect();

    let statement_mode = ids.len() >= ns.config.statement_replication_threshold
        && q.limit.is_none()
        && q.offset == 0;
    if statement_mode {
        let sql = vellum_parser::to_sql(q);
        ns.wal_append(WalRecordType::DeleteQuery, sql.into_bytes(), Lsn::EMPTY);
    }
    for &id in &ids {
        ns.delete_id_internal(id, Lsn::EMPTY, !statement_mode)?;
    }
    debug!(namespace = %ns.name(), rows = ids.len(), statement_mode, "delete query executed");
    Ok(selected)
}

/// Execute `UPDATE ... SET ... / DROP ... WHERE ...`.
pub fn execute_update(ns: &mut NamespaceImpl, q: &Query, cx: &VxContext) -> Result<QueryResults> {
    cx.check()?;
    ns.repl.check_write(false)?;
    if q.updates.is_empty() {
        return Err(VellumError::params("update query has no SET or DROP entries"));
    }
    let selected = execute_select(ns, &as_select(q), &JoinedNamespaces::new(), cx)?;
    let ids: Vec<IdType> = selected.items.iter().map(|item| item.id).collect();

    // expressions and json objects force row-by-row replication
    let pure_statement = q
        .updates
        .iter()
        .all(|u| u.mode != UpdateMode::SetJson && !u.is_expression);
    let statement_mode = pure_statement
        && ids.len() >= ns.config.statement_replication_threshold
        && q.limit.is_none()
        && q.offset == 0;
    if statement_mode {
        let sql = vellum_parser::to_sql(q);
        ns.wal_append(WalRecordType::UpdateQuery, sql.into_bytes(), Lsn::EMPTY);
    }

    let mut results = QueryResults {
        namespaces: vec![ns.name().to_owned()],
        ..QueryResults::default()
    };
    for &id in &ids {
        let Some(item) = ns.items.get(id) else { continue };
        let mut doc = item.doc.clone();
        for entry in &q.updates {
            apply_update_entry(&mut doc, entry)?;
        }
        let updated = replace_row(ns, id, doc, !statement_mode)?;
        results.items.push(updated);
    }
    debug!(namespace = %ns.name(), rows = ids.len(), statement_mode, "update query executed");
    Ok(results)
}

/// Swap a row's document in place, reindexing and (optionally) emitting
/// the per-row WAL record.
fn replace_row(
    ns: &mut NamespaceImpl,
    id: IdType,
    doc: Value,
    emit_wal: bool,
) -> Result<crate::query_results::ItemRef> {
    let old_hash = ns
        .items
        .get(id)
        .map(|item| item.payload.hash())
        .unwrap_or_default();

    ns.delete_row_keys(id)?;
    let payload = ns.build_payload(&doc)?;
    let cjson = cjson::encode(&doc, &mut ns.tags)?;
    let lsn = if emit_wal {
        ns.wal_append(WalRecordType::ItemModify, cjson.clone(), Lsn::EMPTY)
    } else {
        ns.items
            .get(id)
            .map(|item| item.payload.lsn)
            .unwrap_or(Lsn::EMPTY)
    };

    let mut item = ItemData {
        payload,
        doc,
        cjson,
        free: false,
    };
    item.payload.lsn = lsn;
    let new_hash = item.payload.hash();

    ns.insert_row_keys(id, &item)?;
    let doc_copy = item.doc.clone();
    ns.items.place_at(id, item);

    ns.repl.toggle_item_hash(old_hash);
    ns.repl.toggle_item_hash(new_hash);
    if emit_wal {
        ns.repl.last_lsn = lsn;
    }
    if let Some(blob) = ns.items.get(id).map(|item| {
        let mut blob = Vec::with_capacity(8 + item.cjson.len());
        blob.extend_from_slice(&lsn.into_raw().to_le_bytes());
        blob.extend_from_slice(&item.cjson);
        blob
    }) {
        ns.storage_write_item(id, &blob);
    }
    ns.on_modified();

    Ok(crate::query_results::ItemRef {
        id,
        proc: 0,
        ns_id: 0,
        lsn,
        doc: doc_copy,
        joined: Vec::new(),
    })
}

/// Apply one SET/DROP entry to a document.
pub fn apply_update_entry(doc: &mut Value, entry: &UpdateEntry) -> Result<()> {
    let segments: Vec<&str> = entry.column.split('.').collect();
    match entry.mode {
        UpdateMode::Drop => {
            json_drop_path(doc, &segments);
            Ok(())
        }
        UpdateMode::SetJson => {
            let Some(vellum_types::Variant::String(raw)) = entry.values.first() else {
                return Err(VellumError::params("json update entry has no object value"));
            };
            let object: Value = serde_json::from_str(raw)
                .map_err(|e| VellumError::params(format!("bad json object in update: {e}")))?;
            json_set_path(doc, &segments, object);
            Ok(())
        }
        UpdateMode::Set => {
            if entry.is_expression {
                let Some(vellum_types::Variant::String(expr)) = entry.values.first() else {
                    return Err(VellumError::params("expression update entry has no text"));
                };
                let compiled = SortExpr::parse(expr)?;
                let result = compiled.evaluate(doc, 0)?;
                let rendered = if result.fract() == 0.0 && result.abs() < 9.0e15 {
                    Value::from(result as i64)
                } else {
                    Value::from(result)
                };
                json_set_path(doc, &segments, rendered);
                return Ok(());
            }
            let rendered = render_values(&entry.values, entry.is_array);
            json_set_path(doc, &segments, rendered);
            Ok(())
        }
    }
}

fn render_values(values: &VariantArray, is_array: bool) -> Value {
    if is_array {
        Value::Array(values.iter().map(variant_to_json).collect())
    } else {
        values
            .first()
            .map(variant_to_json)
            .unwrap_or(Value::Null)
    }
}

fn json_set_path(doc: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *doc = value;
        return;
    };
    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    let map = doc.as_object_mut().expect("object ensured");
    if rest.is_empty() {
        map.insert((*head).to_owned(), value);
    } else {
        let child = map
            .entry((*head).to_owned())
            .or_insert(Value::Object(serde_json::Map::new()));
        json_set_path(child, rest, value);
    }
}

fn json_drop_path(doc: &mut Value, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(map) = doc.as_object_mut() else { return };
    if rest.is_empty() {
        map.remove(*head);
    } else if let Some(child) = map.get_mut(*head) {
        json_drop_path(child, rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smallvec::smallvec;
    use vellum_types::Variant;

    fn set_entry(column: &str, value: Variant) -> UpdateEntry {
        UpdateEntry {
            column: column.into(),
            values: smallvec![value],
            mode: UpdateMode::Set,
            is_expression: false,
            is_array: false,
        }
    }

    #[test]
    fn set_scalar_and_nested() {
        let mut doc = json!({"a": 1});
        apply_update_entry(&mut doc, &set_entry("a", Variant::Int(2))).unwrap();
        apply_update_entry(&mut doc, &set_entry("nested.deep", Variant::from("x"))).unwrap();
        assert_eq!(doc, json!({"a": 2, "nested": {"deep": "x"}}));
    }

    #[test]
    fn set_array_replaces_elements() {
        let mut doc = json!({"tags": ["old"]});
        let entry = UpdateEntry {
            column: "tags".into(),
            values: smallvec![Variant::from("a"), Variant::from("b")],
            mode: UpdateMode::Set,
            is_expression: false,
            is_array: true,
        };
        apply_update_entry(&mut doc, &entry).unwrap();
        assert_eq!(doc, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn expression_update() {
        let mut doc = json!({"price": 100, "margin": 10});
        let entry = UpdateEntry {
            column: "price".into(),
            values: smallvec![Variant::from("price + margin * 2")],
            mode: UpdateMode::Set,
            is_expression: true,
            is_array: false,
        };
        apply_update_entry(&mut doc, &entry).unwrap();
        assert_eq!(doc["price"], json!(120));
    }

    #[test]
    fn json_object_update() {
        let mut doc = json!({"info": {"old": true}});
        let entry = UpdateEntry {
            column: "info".into(),
            values: smallvec![Variant::from(r#"{"pages": 5}"#)],
            mode: UpdateMode::SetJson,
            is_expression: false,
            is_array: false,
        };
        apply_update_entry(&mut doc, &entry).unwrap();
        assert_eq!(doc, json!({"info": {"pages": 5}}));
    }

    #[test]
    fn drop_removes_nested_path() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        let entry = UpdateEntry {
            column: "a.b".into(),
            values: VariantArray::new(),
            mode: UpdateMode::Drop,
            is_expression: false,
            is_array: false,
        };
        apply_update_entry(&mut doc, &entry).unwrap();
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }
}
