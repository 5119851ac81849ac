mod common;

use chrono::{TimeDelta, Utc};
use common::{Harness, vpc_and_subnet, with_vpc_cidr};
use reconcile::{
    ConflictError, LockMode, LockRecord, NoProgress, PlanMode, ReconcileError,
};
use std::fs;

fn lock_path(h: &Harness) -> std::path::PathBuf {
    h.dir.path().join("state.json.lock")
}

#[test]
fn test_live_lock_blocks_apply_without_provider_calls() {
    let h = Harness::new();
    let _held = h.locks().acquire("ci-job-17").unwrap();

    let err = h.engine.apply(&vpc_and_subnet(), PlanMode::Normal).unwrap_err();
    match err {
        ReconcileError::Conflict(ConflictError::LockHeld { owner, .. }) => {
            assert_eq!(owner, "ci-job-17");
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }
    assert!(h.provider.calls().is_empty());
}

#[test]
fn test_plan_fails_under_exclusive_lock() {
    let h = Harness::new();
    let held = h.locks().acquire("ci-job-17").unwrap();
    assert!(matches!(
        h.engine.plan(&vpc_and_subnet(), PlanMode::Normal),
        Err(ReconcileError::Conflict(ConflictError::LockHeld { .. }))
    ));

    held.release().unwrap();
    assert!(h.engine.plan(&vpc_and_subnet(), PlanMode::Normal).is_ok());
}

#[test]
fn test_stale_lock_is_broken() {
    let h = Harness::new();
    let old = Utc::now() - TimeDelta::hours(3);
    let record = LockRecord {
        owner_id: "crashed-run".to_string(),
        acquired_at: old,
        heartbeat_at: old,
        mode: LockMode::Exclusive,
    };
    fs::write(lock_path(&h), serde_json::to_vec(&record).unwrap()).unwrap();

    let report = h.engine.apply(&vpc_and_subnet(), PlanMode::Normal).unwrap();
    assert!(report.is_success());
    assert!(h.engine.locks().status().unwrap().is_unlocked());
}

#[test]
fn test_lock_released_after_failed_validation() {
    let h = Harness::new();
    let model = reconcile::ResourceSet::from_resources([reconcile::Resource::new(
        common::key("dns.zone"),
    )])
    .unwrap();
    assert!(h.engine.apply(&model, PlanMode::Normal).is_err());
    assert!(h.engine.locks().status().unwrap().is_unlocked());
}

#[test]
fn test_saved_plan_goes_stale_after_another_apply() {
    let h = Harness::new();
    h.engine.apply(&vpc_and_subnet(), PlanMode::Normal).unwrap();

    let plan = h
        .engine
        .plan(&with_vpc_cidr("10.1.0.0/16"), PlanMode::Normal)
        .unwrap();
    h.engine
        .apply(&with_vpc_cidr("10.2.0.0/16"), PlanMode::Normal)
        .unwrap();
    let mutations = h.provider.mutations().len();

    let err = h.engine.apply_plan(plan, &mut NoProgress).unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Conflict(ConflictError::StalePlan { .. })
    ));
    assert_eq!(h.provider.mutations().len(), mutations);
}

#[test]
fn test_saved_plan_applies_when_state_unchanged() {
    let h = Harness::new();
    h.engine.apply(&vpc_and_subnet(), PlanMode::Normal).unwrap();

    let plan = h
        .engine
        .plan(&with_vpc_cidr("10.1.0.0/16"), PlanMode::Normal)
        .unwrap();
    let report = h.engine.apply_plan(plan, &mut NoProgress).unwrap();
    assert!(report.is_success());

    let vpc = h
        .engine
        .state()
        .record(&common::key("network.vpc1"))
        .unwrap();
    assert_eq!(vpc.inputs["cidr"], serde_json::json!("10.1.0.0/16"));
}

#[test]
fn test_force_unlock_clears_held_lock() {
    let h = Harness::new();
    let held = h.locks().acquire("ci-job-17").unwrap();

    assert!(h.engine.locks().force_unlock("ci-job-17").unwrap());
    assert!(h.engine.apply(&vpc_and_subnet(), PlanMode::Normal).is_ok());
    assert!(held.verify().is_err());
}
