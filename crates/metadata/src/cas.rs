//! Pure mutation logic for the metadata record: revision bookkeeping and
//! CAS checks, kept free of any store access so the properties in spec §8
//! (revision monotonicity, round-trip values) are unit-testable without a
//! live connection.

use std::collections::HashMap;

use pulsemesh_common::{EngineError, MetadataEventItem, PreconditionCode};

use crate::params::ItemPatch;
use crate::record::{MetadataItem, MetadataRecord};

/// Precondition (ii): the caller's expected `majorRevision` must match the
/// stored one when supplied at all.
pub fn check_major_revision_cas(current: &MetadataRecord, expected: Option<u64>) -> Result<(), EngineError> {
    match expected {
        Some(want) if want != current.major_revision => Err(EngineError::precondition(
            PreconditionCode::MetadataConflict,
            format!(
                "major_revision mismatch: expected {want}, found {}",
                current.major_revision
            ),
        )),
        _ => Ok(()),
    }
}

/// `set`: replaces the whole record. New items start at revision 1.
pub fn apply_set(
    current: &MetadataRecord,
    data: &HashMap<String, String>,
    add_timestamp: bool,
    add_user_id: bool,
    actor_user_id: Option<&str>,
    now_iso: &str,
) -> (MetadataRecord, Vec<MetadataEventItem>) {
    let mut items = std::collections::BTreeMap::new();
    let mut touched = Vec::with_capacity(data.len());

    for (key, value) in data {
        let item = MetadataItem {
            value: value.clone(),
            revision: 1,
            updated_iso: add_timestamp.then(|| now_iso.to_string()),
            author_uid: add_user_id.then(|| actor_user_id.unwrap_or_default().to_string()),
        };
        touched.push(MetadataEventItem {
            key: key.clone(),
            value: item.value.clone(),
            revision: item.revision,
        });
        items.insert(key.clone(), item);
    }

    let record = MetadataRecord {
        items,
        major_revision: current.major_revision + 1,
    };
    (record, touched)
}

/// `update`: every targeted key must already exist; each touched item's
/// revision increments by 1 and `majorRevision` bumps once for the whole
/// call.
pub fn apply_update(
    current: &MetadataRecord,
    data: &HashMap<String, ItemPatch>,
    add_timestamp: bool,
    add_user_id: bool,
    actor_user_id: Option<&str>,
    now_iso: &str,
) -> Result<(MetadataRecord, Vec<MetadataEventItem>), EngineError> {
    if data.is_empty() {
        return Err(EngineError::Validation(
            "update requires at least one item".to_string(),
        ));
    }

    for key in data.keys() {
        if !current.items.contains_key(key) {
            return Err(EngineError::precondition(
                PreconditionCode::MetadataInvalid,
                format!("update target '{key}' does not exist"),
            ));
        }
    }

    for (key, patch) in data {
        // Existence already checked above, so this lookup cannot miss.
        if let (Some(expected), Some(existing)) = (patch.expected_revision, current.items.get(key)) {
            if expected != existing.revision {
                return Err(EngineError::precondition(
                    PreconditionCode::MetadataConflict,
                    format!(
                        "item '{key}' revision mismatch: expected {expected}, found {}",
                        existing.revision
                    ),
                ));
            }
        }
    }

    let mut items = current.items.clone();
    let mut touched = Vec::with_capacity(data.len());
    for (key, patch) in data {
        let Some(existing) = items.get(key) else {
            // Existence of every key was validated in the loop above; this
            // branch would mean `items` and `data` disagree, which cannot
            // happen since `items` is a clone of `current.items`.
            unreachable!("existence validated above for every key in data")
        };
        let updated = MetadataItem {
            value: patch.value.clone(),
            revision: existing.revision + 1,
            updated_iso: if add_timestamp {
                Some(now_iso.to_string())
            } else {
                existing.updated_iso.clone()
            },
            author_uid: if add_user_id {
                Some(actor_user_id.unwrap_or_default().to_string())
            } else {
                existing.author_uid.clone()
            },
        };
        touched.push(MetadataEventItem {
            key: key.clone(),
            value: updated.value.clone(),
            revision: updated.revision,
        });
        items.insert(key.clone(), updated);
    }

    let record = MetadataRecord {
        items,
        major_revision: current.major_revision + 1,
    };
    Ok((record, touched))
}

/// `remove`: with no keys, clears the whole record (keeping `majorRevision`'s
/// lineage intact); with keys, removes only those that exist.
/// `majorRevision` only bumps (the returned record's `major_revision`
/// advances past `current`'s) when at least one key was actually removed —
/// callers detect "bumped" by comparing the two, same as `set`/`update`.
pub fn apply_remove(current: &MetadataRecord, keys: Option<&[String]>) -> (MetadataRecord, Vec<MetadataEventItem>) {
    let targets: Vec<String> = match keys {
        None => current.items.keys().cloned().collect(),
        Some(keys) => keys
            .iter()
            .filter(|k| current.items.contains_key(k.as_str()))
            .cloned()
            .collect(),
    };

    if targets.is_empty() {
        return (current.clone(), Vec::new());
    }

    let mut items = current.items.clone();
    let mut removed = Vec::with_capacity(targets.len());
    for key in &targets {
        if let Some(item) = items.remove(key) {
            removed.push(MetadataEventItem {
                key: key.clone(),
                value: item.value,
                revision: item.revision,
            });
        }
    }

    let record = MetadataRecord {
        items,
        major_revision: current.major_revision + 1,
    };
    (record, removed)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn item(value: &str, revision: u64) -> MetadataItem {
        MetadataItem {
            value: value.to_string(),
            revision,
            updated_iso: None,
            author_uid: None,
        }
    }

    #[test]
    fn set_starts_items_at_revision_one_and_bumps_major() {
        let current = MetadataRecord::default();
        let mut data = HashMap::new();
        data.insert("topic".to_string(), "a".to_string());
        let (record, touched) = apply_set(&current, &data, false, false, None, "2026-01-01T00:00:00Z");
        assert_eq!(record.major_revision, 1);
        assert_eq!(record.items.get("topic").unwrap().revision, 1);
        assert_eq!(touched.len(), 1);
    }

    #[test]
    fn set_stamps_timestamp_and_author_when_requested() {
        let current = MetadataRecord::default();
        let mut data = HashMap::new();
        data.insert("topic".to_string(), "a".to_string());
        let (record, _) = apply_set(&current, &data, true, true, Some("u1"), "2026-01-01T00:00:00Z");
        let stored = record.items.get("topic").unwrap();
        assert_eq!(stored.updated_iso.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(stored.author_uid.as_deref(), Some("u1"));
    }

    #[test]
    fn update_rejects_unknown_key() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 1));
        let mut data = HashMap::new();
        data.insert(
            "missing".to_string(),
            ItemPatch {
                value: "b".to_string(),
                expected_revision: None,
            },
        );
        let result = apply_update(&current, &data, false, false, None, "ts");
        assert!(matches!(
            result,
            Err(EngineError::Precondition {
                code: PreconditionCode::MetadataInvalid,
                ..
            })
        ));
    }

    #[test]
    fn update_rejects_empty_data() {
        let current = MetadataRecord::default();
        let result = apply_update(&current, &HashMap::new(), false, false, None, "ts");
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn update_detects_per_item_revision_conflict() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 3));
        let mut data = HashMap::new();
        data.insert(
            "topic".to_string(),
            ItemPatch {
                value: "b".to_string(),
                expected_revision: Some(1),
            },
        );
        let result = apply_update(&current, &data, false, false, None, "ts");
        assert!(matches!(
            result,
            Err(EngineError::Precondition {
                code: PreconditionCode::MetadataConflict,
                ..
            })
        ));
    }

    #[test]
    fn update_increments_revision_and_bumps_major() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 1));
        current.major_revision = 5;
        let mut data = HashMap::new();
        data.insert(
            "topic".to_string(),
            ItemPatch {
                value: "b".to_string(),
                expected_revision: None,
            },
        );
        let (record, touched) = apply_update(&current, &data, false, false, None, "ts").unwrap();
        assert_eq!(record.items.get("topic").unwrap().revision, 2);
        assert_eq!(record.major_revision, 6);
        assert_eq!(touched[0].revision, 2);
    }

    #[test]
    fn update_preserves_timestamp_unless_overridden() {
        let mut current = MetadataRecord::default();
        current.items.insert(
            "topic".to_string(),
            MetadataItem {
                value: "a".to_string(),
                revision: 1,
                updated_iso: Some("old".to_string()),
                author_uid: Some("orig".to_string()),
            },
        );
        let mut data = HashMap::new();
        data.insert(
            "topic".to_string(),
            ItemPatch {
                value: "b".to_string(),
                expected_revision: None,
            },
        );
        let (record, _) = apply_update(&current, &data, false, false, None, "new").unwrap();
        let stored = record.items.get("topic").unwrap();
        assert_eq!(stored.updated_iso.as_deref(), Some("old"));
        assert_eq!(stored.author_uid.as_deref(), Some("orig"));
    }

    #[test]
    fn remove_without_keys_clears_whole_record() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 1));
        current.items.insert("other".to_string(), item("b", 2));
        current.major_revision = 1;
        let (record, removed) = apply_remove(&current, None);
        assert!(record.items.is_empty());
        assert_eq!(record.major_revision, 2);
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn remove_with_unmatched_keys_does_not_bump() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 1));
        current.major_revision = 3;
        let keys = vec!["missing".to_string()];
        let (record, removed) = apply_remove(&current, Some(&keys));
        assert_eq!(record.major_revision, 3);
        assert!(removed.is_empty());
    }

    #[test]
    fn remove_lists_pre_delete_value_and_revision() {
        let mut current = MetadataRecord::default();
        current.items.insert("topic".to_string(), item("a", 4));
        let keys = vec!["topic".to_string()];
        let (record, removed) = apply_remove(&current, Some(&keys));
        assert_eq!(record.major_revision, current.major_revision + 1);
        assert_eq!(removed[0].value, "a");
        assert_eq!(removed[0].revision, 4);
    }

    #[test]
    fn major_revision_cas_passes_when_unspecified() {
        let current = MetadataRecord::default();
        assert!(check_major_revision_cas(&current, None).is_ok());
    }

    #[test]
    fn major_revision_cas_fails_on_mismatch() {
        let mut current = MetadataRecord::default();
        current.major_revision = 2;
        let err = check_major_revision_cas(&current, Some(1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition {
                code: PreconditionCode::MetadataConflict,
                ..
            }
        ));
    }
}
