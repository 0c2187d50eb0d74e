//! Merger / conflict resolution (spec §4.4, component E).
//!
//! Generalizes the teacher crate's HLC-string `should_overwrite`/`parse_hlc`
//! into the full tag-set CRDT merge: local and incoming state are each
//! folded into one `Fold` per `(namespace, table, primaryKey)`, then
//! resolved by set arithmetic over tag sets (spec §4.2, §4.4 step 4).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::client::{DataChange, RecordType, Transaction};
use crate::oplog::OplogEntry;
use crate::tag::{Tag, TagSet};

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub namespace: String,
    pub tablename: String,
    pub primary_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOp {
    Upsert,
    Delete,
}

/// `ShadowEntryChanges` (spec §4.4 step 4): one side's folded view of all
/// operations touching a key.
#[derive(Debug, Clone)]
pub struct Fold {
    pub optype: FoldOp,
    pub full_row: Option<Value>,
    pub tags: TagSet,
    pub clear_tags: TagSet,
    /// Set only when `optype == Delete`: the timestamp of the delete
    /// itself, used as an additional temporal clear bound (see `resolve`
    /// below and DESIGN.md's note on this open question).
    pub delete_timestamp: Option<DateTime<Utc>>,
}

impl Fold {
    fn upsert(tag: Tag, row: Option<Value>) -> Self {
        Fold {
            optype: FoldOp::Upsert,
            full_row: row,
            tags: TagSet::single(tag),
            clear_tags: TagSet::new(),
            delete_timestamp: None,
        }
    }

    fn delete(at: DateTime<Utc>) -> Self {
        Fold {
            optype: FoldOp::Delete,
            full_row: None,
            tags: TagSet::new(),
            clear_tags: TagSet::new(),
            delete_timestamp: Some(at),
        }
    }
}

fn key_for(namespace: &str, tablename: &str, pk: &Value) -> RowKey {
    RowKey {
        namespace: namespace.to_string(),
        tablename: tablename.to_string(),
        primary_key: serde_json::to_string(pk).unwrap_or_default(),
    }
}

/// Fold local pending oplog entries (ordered by rowid) into one `Fold` per
/// key, replaying the observation rule in §4.2: a non-delete op's shadow
/// becomes `{tag(O)}`; a delete op's shadow becomes absent.
pub fn fold_local(entries: &[OplogEntry], local_client_id: &str) -> HashMap<RowKey, Fold> {
    let mut folds: HashMap<RowKey, Fold> = HashMap::new();

    for entry in entries {
        let key = key_for(&entry.namespace, &entry.tablename, &entry.primary_key);
        let ts_ms = entry.timestamp.unwrap_or(0);
        let ts = ms_to_datetime(ts_ms);

        let fold = folds.entry(key).or_insert_with(|| Fold {
            optype: FoldOp::Upsert,
            full_row: None,
            tags: TagSet::new(),
            clear_tags: TagSet::new(),
            delete_timestamp: None,
        });

        fold.clear_tags = fold.clear_tags.merge(&entry.clear_tags);

        if entry.optype.is_delete() {
            fold.optype = FoldOp::Delete;
            fold.full_row = None;
            fold.tags = TagSet::new();
            fold.delete_timestamp = Some(ts);
        } else {
            let tag = Tag::generate(local_client_id, ts);
            fold.optype = FoldOp::Upsert;
            fold.full_row = entry.new_row.clone();
            fold.tags = TagSet::single(tag);
            fold.delete_timestamp = None;
        }
    }

    folds
}

/// Fold incoming `DataChange`s from one transaction into one `Fold` per key.
/// The wire format carries only each op's resolved `tags` (spec §3); a
/// delete's own "moment" has no tag of its own, so the transaction's commit
/// timestamp stands in for it.
///
/// `pk_of` extracts just the primary-key columns from a change's full row,
/// so incoming keys line up with `fold_local`'s keys (which are already
/// pk-only, per the trigger's `primaryKey` JSON). The applier supplies this
/// from its `RelationCache`.
pub fn fold_incoming(
    tx: &Transaction,
    changes: &[DataChange],
    pk_of: impl Fn(&str, &str, &Value) -> Value,
) -> HashMap<RowKey, Fold> {
    let mut folds: HashMap<RowKey, Fold> = HashMap::new();
    let commit_ts = ms_to_datetime(tx.commit_timestamp_ms);

    for change in changes {
        let full_row = change
            .new_record
            .as_ref()
            .or(change.old_record.as_ref())
            .cloned()
            .unwrap_or(Value::Null);
        let pk = pk_of(&change.schema, &change.table, &full_row);
        let key = key_for(&change.schema, &change.table, &pk);

        let fold = match change.record_type {
            RecordType::Delete => Fold::delete(commit_ts),
            RecordType::Insert | RecordType::Update => {
                let tags = if change.tags.is_empty() {
                    TagSet::single(Tag::generate(&tx.origin, commit_ts))
                } else {
                    change.tags.clone()
                };
                Fold {
                    optype: FoldOp::Upsert,
                    full_row: change.new_record.clone(),
                    tags,
                    clear_tags: TagSet::new(),
                    delete_timestamp: None,
                }
            }
        };
        folds.insert(key, fold);
    }

    folds
}

#[derive(Debug, Clone)]
pub enum Resolved {
    Delete,
    Upsert { row: Value, tags: TagSet },
}

/// Resolve one key's local and incoming folds into a single outcome (spec
/// §4.4 step 4).
///
/// `resolved = (localTags ∪ incomingTags) \ (localClear ∪ incomingClear)`.
/// When one side is a delete, its own timestamp additionally clears any tag
/// on the other side whose timestamp does not exceed the delete's — the
/// resolution chosen here for the open question in spec §9 about the exact
/// tie-break rule: a delete beats any write that causally precedes it; a
/// write beats a delete it precedes.
pub fn resolve(local: Option<&Fold>, incoming: Option<&Fold>) -> Resolved {
    let empty = Fold {
        optype: FoldOp::Delete,
        full_row: None,
        tags: TagSet::new(),
        clear_tags: TagSet::new(),
        delete_timestamp: None,
    };
    let local = local.unwrap_or(&empty);
    let incoming = incoming.unwrap_or(&empty);

    let mut local_clear = local.clear_tags.clone();
    let mut incoming_clear = incoming.clear_tags.clone();

    if let Some(del_ts) = local.delete_timestamp {
        for tag in incoming.tags.iter() {
            if tag.timestamp() <= del_ts {
                local_clear.insert(tag.clone());
            }
        }
    }
    if let Some(del_ts) = incoming.delete_timestamp {
        for tag in local.tags.iter() {
            if tag.timestamp() <= del_ts {
                incoming_clear.insert(tag.clone());
            }
        }
    }

    let resolved_tags = local.tags.merge(&incoming.tags).difference(&local_clear.merge(&incoming_clear));

    if resolved_tags.is_empty() {
        return Resolved::Delete;
    }

    let local_survives = local.tags.iter().any(|t| resolved_tags.contains(t));
    let incoming_survives = incoming.tags.iter().any(|t| resolved_tags.contains(t));

    let row = match (local_survives, incoming_survives, &local.full_row, &incoming.full_row) {
        (true, true, Some(l), Some(i)) => merge_rows_column_wise(l, local.tags.latest(), i, incoming.tags.latest()),
        (true, _, Some(l), _) => l.clone(),
        (_, true, _, Some(i)) => i.clone(),
        (_, _, Some(l), None) => l.clone(),
        (_, _, None, Some(i)) => i.clone(),
        _ => Value::Null,
    };

    Resolved::Upsert { row, tags: resolved_tags }
}

/// Column-wise reconstruction (spec §4.4 step 4): for each column, pick the
/// value from whichever side's representative tag is later, ties broken by
/// clientId lexical order (via `Tag`'s `Ord`).
fn merge_rows_column_wise(local_row: &Value, local_tag: Option<&Tag>, incoming_row: &Value, incoming_tag: Option<&Tag>) -> Value {
    let local_wins_ties = match (local_tag, incoming_tag) {
        (Some(l), Some(i)) => l >= i,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    };

    match (local_row.as_object(), incoming_row.as_object()) {
        (Some(l), Some(i)) => {
            let mut out = serde_json::Map::new();
            let mut keys: Vec<&String> = l.keys().chain(i.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                let chosen = match (l.get(k), i.get(k)) {
                    (Some(lv), Some(iv)) => Some(if local_wins_ties { lv.clone() } else { iv.clone() }),
                    (Some(lv), None) => Some(lv.clone()),
                    (None, Some(iv)) => Some(iv.clone()),
                    (None, None) => None,
                };
                if let Some(v) = chosen {
                    out.insert(k.clone(), v);
                }
            }
            Value::Object(out)
        }
        _ => {
            if local_wins_ties {
                local_row.clone()
            } else {
                incoming_row.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(client: &str, ms: i64) -> Tag {
        Tag::generate(client, ms_to_datetime(ms))
    }

    fn delete_fold(ts_ms: i64) -> Fold {
        Fold::delete(ms_to_datetime(ts_ms))
    }

    fn upsert_fold(client: &str, ts_ms: i64, row: Value) -> Fold {
        Fold::upsert(tag(client, ts_ms), Some(row))
    }

    #[test]
    fn local_delete_beats_earlier_remote_insert() {
        // scenario 3, row 1: local delete at t1, remote insert tagged t1-1.
        let local = delete_fold(1_000);
        let incoming = upsert_fold("remote", 999, serde_json::json!({"id": 1, "value": "remote"}));
        match resolve(Some(&local), Some(&incoming)) {
            Resolved::Delete => {}
            other => panic!("expected delete to win, got {other:?}"),
        }
    }

    #[test]
    fn later_remote_insert_resurrects_over_local_delete() {
        // scenario 3, row 2: local delete at t1, remote insert tagged t1+1.
        let local = delete_fold(1_000);
        let incoming = upsert_fold("remote", 1_001, serde_json::json!({"id": 2, "value": "remote"}));
        match resolve(Some(&local), Some(&incoming)) {
            Resolved::Upsert { row, .. } => {
                assert_eq!(row["value"], "remote");
            }
            Resolved::Delete => panic!("expected remote insert to resurrect the row"),
        }
    }

    #[test]
    fn pure_local_upsert_with_no_incoming_keeps_local_row() {
        let local = upsert_fold("local", 5, serde_json::json!({"id": 1, "value": "local1"}));
        match resolve(Some(&local), None) {
            Resolved::Upsert { row, tags } => {
                assert_eq!(row["value"], "local1");
                assert_eq!(tags.len(), 1);
            }
            Resolved::Delete => panic!("expected upsert"),
        }
    }

    #[test]
    fn concurrent_upserts_pick_latest_per_column() {
        let local = upsert_fold("a", 10, serde_json::json!({"id": 1, "x": "local", "y": "only_local"}));
        let incoming = upsert_fold("b", 20, serde_json::json!({"id": 1, "x": "remote", "z": "only_remote"}));
        match resolve(Some(&local), Some(&incoming)) {
            Resolved::Upsert { row, .. } => {
                assert_eq!(row["x"], "remote", "later tag wins on shared column");
                assert_eq!(row["y"], "only_local");
                assert_eq!(row["z"], "only_remote");
            }
            Resolved::Delete => panic!("expected upsert"),
        }
    }

    #[test]
    fn fold_incoming_derives_tag_from_origin_and_commit_ts_when_untagged() {
        let tx = Transaction {
            origin: "remote-client".to_string(),
            commit_timestamp_ms: 42,
            lsn: vec![],
            changes: vec![],
        };
        let change = DataChange {
            schema: "main".to_string(),
            table: "parent".to_string(),
            record_type: RecordType::Insert,
            new_record: Some(serde_json::json!({"id": 1})),
            old_record: None,
            tags: TagSet::new(),
        };
        let folds = fold_incoming(&tx, &[change], |_, _, row| row.clone());
        assert_eq!(folds.len(), 1);
        let fold = folds.values().next().unwrap();
        assert_eq!(fold.tags.len(), 1);
        assert_eq!(fold.tags.iter().next().unwrap().client_id(), "remote-client");
    }
}
