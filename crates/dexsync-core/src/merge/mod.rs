//! Ownership merge engine.
//!
//! Every path that changes the ownership map (catch-up fetch, live updates,
//! local edits) goes through [`merge`]. The rule is last-write-wins per key on
//! `last_update`, with variant-level pruning and the at-most-one-unowned
//! invariant enforced on the result.
//!
//! The function is not associative: merging two batches one after the other
//! can keep different records than merging their union. Always merge against
//! the current full map.

use std::collections::{HashMap, HashSet};

use crate::models::{InstanceRecord, OwnershipMap};

/// Combine the current map with an incoming batch.
///
/// 1. Keys present in `incoming` keep whichever record has the greater
///    `last_update`; ties go to `incoming`.
/// 2. Existing keys whose variant has no incoming activity are kept.
/// 3. Existing keys whose variant does have incoming activity survive only if
///    they are significant and no incoming record of that variant is.
/// 4. Within each variant only the first `is_unowned` record keeps the flag.
pub fn merge(existing: &OwnershipMap, incoming: &OwnershipMap) -> OwnershipMap {
    // variant prefix -> whether any incoming record of it is significant
    let mut incoming_variants: HashMap<&str, bool> = HashMap::new();
    for (key, record) in incoming {
        *incoming_variants.entry(key.variant_prefix()).or_default() |= record.is_significant();
    }

    let mut merged = OwnershipMap::new();

    for (key, incoming_record) in incoming {
        let winner = match existing.get(key) {
            Some(existing_record) if existing_record.last_update > incoming_record.last_update => {
                existing_record
            }
            _ => incoming_record,
        };
        merged.insert(key.clone(), winner.clone());
    }

    let mut dropped = 0_usize;
    for (key, record) in existing {
        if incoming.contains_key(key) {
            continue;
        }
        let keep = match incoming_variants.get(key.variant_prefix()) {
            None => true,
            Some(&incoming_significant) => record.is_significant() && !incoming_significant,
        };
        if keep {
            merged.insert(key.clone(), record.clone());
        } else {
            dropped += 1;
        }
    }

    let demoted = enforce_single_unowned(&mut merged);

    tracing::debug!(
        existing = existing.len(),
        incoming = incoming.len(),
        merged = merged.len(),
        dropped,
        demoted,
        "Merged ownership batch"
    );
    merged
}

/// [`merge`] restricted to one account: records tagged with another
/// `username` are discarded from both sides first.
pub fn merge_for_owner(existing: &OwnershipMap, incoming: &OwnershipMap, owner: &str) -> OwnershipMap {
    let own = |map: &OwnershipMap| -> OwnershipMap {
        map.iter()
            .filter(|(key, record)| {
                let foreign = record.is_foreign_to(owner);
                if foreign {
                    tracing::debug!(key = %key, "Discarding record owned by another account");
                }
                !foreign
            })
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    };

    merge(&own(existing), &own(incoming))
}

/// Clear `is_unowned` on every record after the first one of its variant.
///
/// Returns how many records were demoted.
pub fn enforce_single_unowned(map: &mut OwnershipMap) -> usize {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut demoted = 0;
    for (key, record) in map.iter_mut() {
        if record.flags.is_unowned && !seen.insert(key.variant_prefix()) {
            record.flags.is_unowned = false;
            demoted += 1;
        }
    }
    demoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceKey, OwnershipFlags};
    use pretty_assertions::assert_eq;

    fn unowned_counts(map: &OwnershipMap) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for (key, record) in map {
            if record.flags.is_unowned {
                *counts.entry(key.variant_prefix()).or_default() += 1;
            }
        }
        counts
    }

    fn record(last_update: i64, flags: OwnershipFlags) -> InstanceRecord {
        InstanceRecord {
            flags,
            ..InstanceRecord::new(last_update)
        }
    }

    const OWNED: OwnershipFlags = OwnershipFlags {
        is_owned: true,
        is_for_trade: false,
        is_wanted: false,
        is_unowned: false,
    };

    const UNOWNED: OwnershipFlags = OwnershipFlags {
        is_owned: false,
        is_for_trade: false,
        is_wanted: false,
        is_unowned: true,
    };

    const PLAIN: OwnershipFlags = OwnershipFlags {
        is_owned: false,
        is_for_trade: false,
        is_wanted: false,
        is_unowned: false,
    };

    fn map(entries: &[(&str, InstanceRecord)]) -> OwnershipMap {
        entries
            .iter()
            .map(|(key, record)| (InstanceKey::from(*key), record.clone()))
            .collect()
    }

    #[test]
    fn newer_record_wins_from_either_side() {
        let old = record(100, OWNED);
        let new = record(200, PLAIN);

        let from_incoming = merge(&map(&[("042_foo_a", old.clone())]), &map(&[("042_foo_a", new.clone())]));
        assert_eq!(from_incoming[&InstanceKey::from("042_foo_a")], new);

        let from_existing = merge(&map(&[("042_foo_a", new.clone())]), &map(&[("042_foo_a", old)]));
        assert_eq!(from_existing[&InstanceKey::from("042_foo_a")], new);
    }

    #[test]
    fn ties_favor_incoming() {
        let mut existing = record(100, OWNED);
        existing.details.insert("nickname".to_string(), "old".into());
        let mut incoming = record(100, OWNED);
        incoming.details.insert("nickname".to_string(), "new".into());

        let merged = merge(&map(&[("042_foo_a", existing)]), &map(&[("042_foo_a", incoming.clone())]));
        assert_eq!(merged["042_foo_a"], incoming);
    }

    #[test]
    fn untouched_variants_are_retained() {
        let existing = map(&[("001_bar_x", record(5, PLAIN)), ("042_foo_a", record(5, OWNED))]);
        let incoming = map(&[("042_foo_a", record(6, OWNED))]);

        let merged = merge(&existing, &incoming);
        assert_eq!(merged["001_bar_x"], record(5, PLAIN));
    }

    #[test]
    fn significant_sibling_survives_insignificant_incoming() {
        let existing = map(&[("042_foo_a", record(5, OWNED))]);
        let incoming = map(&[("042_foo_b", record(6, UNOWNED))]);

        let merged = merge(&existing, &incoming);
        assert!(merged.contains_key("042_foo_a"));
        assert!(merged.contains_key("042_foo_b"));
    }

    #[test]
    fn significant_incoming_drops_significant_sibling() {
        // Incoming activity on a variant supersedes existing records of it,
        // even when the sibling was never mentioned by the batch.
        let existing = map(&[("042_foo_a", record(5, OWNED))]);
        let incoming = map(&[("042_foo_b", record(6, OWNED))]);

        let merged = merge(&existing, &incoming);
        assert!(!merged.contains_key("042_foo_a"));
        assert!(merged.contains_key("042_foo_b"));
    }

    #[test]
    fn insignificant_sibling_is_dropped_on_variant_activity() {
        let existing = map(&[("042_foo_a", record(5, UNOWNED))]);
        let incoming = map(&[("042_foo_b", record(6, PLAIN))]);

        let merged = merge(&existing, &incoming);
        assert!(!merged.contains_key("042_foo_a"));
    }

    #[test]
    fn unowned_collision_keeps_exactly_one() {
        let incoming = map(&[("042_foo_a", record(1, UNOWNED)), ("042_foo_b", record(1, UNOWNED))]);

        let merged = merge(&OwnershipMap::new(), &incoming);
        assert_eq!(merged.len(), 2);
        assert!(merged["042_foo_a"].flags.is_unowned);
        assert!(!merged["042_foo_b"].flags.is_unowned);
        assert_eq!(unowned_counts(&merged).get("042_foo"), Some(&1));
    }

    #[test]
    fn unowned_invariant_holds_across_many_variants() {
        let existing = map(&[
            ("001_a_1", record(1, UNOWNED)),
            ("002_b_1", record(1, UNOWNED)),
            ("003_c_1", record(1, OWNED)),
        ]);
        let incoming = map(&[
            ("001_a_2", record(2, UNOWNED)),
            ("001_a_3", record(2, UNOWNED)),
            ("002_b_2", record(2, UNOWNED)),
            ("003_c_2", record(2, UNOWNED)),
            ("003_c_3", record(2, UNOWNED)),
        ]);

        let merged = merge(&existing, &incoming);
        for count in unowned_counts(&merged).values() {
            assert!(*count <= 1);
        }
    }

    #[test]
    fn empty_incoming_leaves_map_unchanged() {
        let existing = map(&[
            ("001_bar_x", record(5, PLAIN)),
            ("042_foo_a", record(7, OWNED)),
            ("042_foo_b", record(9, UNOWNED)),
        ]);

        let merged = merge(&existing, &OwnershipMap::new());
        assert_eq!(merged, existing);
        assert_eq!(
            serde_json::to_string(&merged).unwrap(),
            serde_json::to_string(&existing).unwrap()
        );
    }

    #[test]
    fn disjoint_batches_commute() {
        let existing = map(&[
            ("001_bar_x", record(5, OWNED)),
            ("042_foo_a", record(5, OWNED)),
            ("077_baz_q", record(5, UNOWNED)),
        ]);
        let batch_a = map(&[("001_bar_y", record(6, OWNED)), ("001_bar_x", record(4, PLAIN))]);
        let batch_b = map(&[("042_foo_b", record(8, UNOWNED)), ("077_baz_r", record(9, UNOWNED))]);

        let a_then_b = merge(&merge(&existing, &batch_a), &batch_b);
        let b_then_a = merge(&merge(&existing, &batch_b), &batch_a);
        assert_eq!(a_then_b, b_then_a);
    }

    #[test]
    fn newer_local_edit_beats_older_incoming() {
        let existing = map(&[("042_foo_uuid1", record(100, OWNED))]);
        let edit = record(200, OWNED);
        let after_edit = merge(&existing, &map(&[("042_foo_uuid1", edit.clone())]));

        let after_live = merge(&after_edit, &map(&[("042_foo_uuid1", record(150, PLAIN))]));
        assert_eq!(after_live["042_foo_uuid1"], edit);
        assert_eq!(after_live["042_foo_uuid1"].last_update, 200);
    }

    #[test]
    fn merge_for_owner_discards_foreign_records() {
        let mut foreign = record(10, OWNED);
        foreign.username = Some("misty".to_string());
        let mut own = record(10, OWNED);
        own.username = Some("ash".to_string());

        let existing = map(&[("001_bar_x", foreign.clone())]);
        let incoming = map(&[("042_foo_a", own.clone()), ("077_baz_q", foreign)]);

        let merged = merge_for_owner(&existing, &incoming, "ash");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["042_foo_a"], own);
    }

    #[test]
    fn enforce_single_unowned_reports_demotions() {
        let mut collided = map(&[
            ("042_foo_a", record(1, UNOWNED)),
            ("042_foo_b", record(1, UNOWNED)),
            ("042_foo_c", record(1, UNOWNED)),
        ]);
        assert_eq!(enforce_single_unowned(&mut collided), 2);
        assert_eq!(enforce_single_unowned(&mut collided), 0);
    }
}
