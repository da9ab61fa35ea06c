//! Reconciliation properties over arbitrary templates and persisted progress.

use std::collections::{HashMap, HashSet};

use ob_stage_core::{
    reconcile_progress, sanitize_progress, StageDefinition, StageProgress, StageStatus,
};
use proptest::prelude::*;

// -- Strategy helpers --

fn arb_template() -> impl Strategy<Value = Vec<StageDefinition>> {
    prop::collection::btree_set(1i64..40, 0..12)
        .prop_map(|ids| ids.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
        .prop_map(|ids| {
            ids.into_iter()
                .enumerate()
                .map(|(i, id)| StageDefinition::new(id, 1, format!("S{}", id), (i as i32 + 1) * 10))
                .collect()
        })
}

fn arb_status() -> impl Strategy<Value = StageStatus> {
    prop_oneof![
        Just(StageStatus::Pending),
        Just(StageStatus::InProgress),
        Just(StageStatus::Skipped),
        Just(StageStatus::Completed),
        Just(StageStatus::Other("On Hold".to_string())),
    ]
}

fn arb_progress() -> impl Strategy<Value = Vec<StageProgress>> {
    let row = (-2i64..40, arb_status(), any::<bool>(), 0i32..50);
    prop::collection::vec(row, 0..20).prop_map(|rows| {
        rows.into_iter()
            .map(|(id, status, completed, order)| {
                let stage = StageDefinition::new(id, 1, format!("S{}", id), order);
                let mut entry = StageProgress::pending(&stage, order);
                entry.status = status;
                entry.is_completed = completed;
                entry
            })
            .collect()
    })
}

fn completed_ids(progress: &[StageProgress]) -> HashSet<i64> {
    progress
        .iter()
        .filter(|p| p.is_completed)
        .map(|p| p.stage_id)
        .collect()
}

proptest! {
    #[test]
    fn reconcile_is_idempotent(template in arb_template(), progress in arb_progress()) {
        let once = reconcile_progress(progress, &template);
        let twice = reconcile_progress(once.progress.clone(), &template);
        prop_assert_eq!(once.progress, twice.progress);
        prop_assert_eq!(twice.created, 0);
        prop_assert_eq!(twice.removed, 0);
    }

    #[test]
    fn stage_order_matches_template_position(
        template in arb_template(),
        progress in arb_progress(),
    ) {
        let out = reconcile_progress(progress, &template).progress;

        prop_assert_eq!(out.len(), template.len());
        for (i, (entry, stage)) in out.iter().zip(&template).enumerate() {
            prop_assert_eq!(entry.stage_id, stage.id);
            prop_assert_eq!(entry.stage_order, i as i32 + 1);
        }
    }

    #[test]
    fn one_entry_per_template_stage(template in arb_template(), progress in arb_progress()) {
        let out = reconcile_progress(progress, &template).progress;
        let ids: HashSet<i64> = out.iter().map(|p| p.stage_id).collect();
        let expected: HashSet<i64> = template.iter().map(|s| s.id).collect();
        prop_assert_eq!(ids.len(), out.len());
        prop_assert_eq!(ids, expected);
    }

    #[test]
    fn completion_survives_template_edits(
        progress in arb_progress(),
        edits in prop::collection::vec(arb_template(), 1..5),
    ) {
        let mut current = progress;
        for template in &edits {
            let before = completed_ids(&sanitize_progress(current.clone()));
            let after = reconcile_progress(current, template).progress;
            let completed_after = completed_ids(&after);

            for stage in template {
                if before.contains(&stage.id) {
                    prop_assert!(completed_after.contains(&stage.id));
                }
            }
            current = after;
        }
    }

    #[test]
    fn sanitize_keeps_first_seen(progress in arb_progress()) {
        let mut first: HashMap<i64, StageProgress> = HashMap::new();
        for entry in &progress {
            if entry.stage_id > 0 {
                first.entry(entry.stage_id).or_insert_with(|| entry.clone());
            }
        }

        let clean = sanitize_progress(progress);
        prop_assert_eq!(clean.len(), first.len());
        for entry in &clean {
            prop_assert_eq!(Some(entry), first.get(&entry.stage_id));
        }
    }
}

#[test]
fn duplicate_stage_keeps_first_entry() {
    let template = vec![StageDefinition::new(5, 1, "KYC", 1)];
    let mut first = StageProgress::pending(&template[0], 1);
    first.status = StageStatus::Completed;
    first.is_completed = true;
    let mut second = StageProgress::pending(&template[0], 1);
    second.status = StageStatus::InProgress;

    let out = reconcile_progress(vec![first, second], &template).progress;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].status, StageStatus::Completed);
    assert!(out[0].is_completed);
}
