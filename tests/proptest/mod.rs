// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for classification and condition bookkeeping
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Every selected claim lands in exactly one backend list
//! 2. Classification is deterministic (same input = same output)
//! 3. Replaying a protection record only ever yields recorded claims
//! 4. A condition set never holds two entries of one type

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use proptest::prelude::*;

use vrg_operator::controller::classification::{partition_by_provisioner, partition_by_status};
use vrg_operator::crd::{
    Condition, ConditionStatus, Conditions, ProtectedPvc, VolumeReplicationClass,
    VolumeReplicationClassSpec,
};

const STORAGE_CLASSES: [&str; 3] = ["rbd", "nfs", "local"];

fn claim(name: &str, storage_class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn provisioners() -> BTreeMap<String, String> {
    STORAGE_CLASSES
        .iter()
        .map(|sc| (sc.to_string(), format!("{}.csi.example.com", sc)))
        .collect()
}

fn classes(provisioner_subset: &[bool]) -> Vec<VolumeReplicationClass> {
    STORAGE_CLASSES
        .iter()
        .zip(provisioner_subset)
        .filter(|(_, on)| **on)
        .map(|(sc, _)| {
            VolumeReplicationClass::new(
                &format!("{}-replication", sc),
                VolumeReplicationClassSpec {
                    provisioner: format!("{}.csi.example.com", sc),
                    parameters: Default::default(),
                },
            )
        })
        .collect()
}

/// Claims with unique names, in name order, each on one of the storage classes
fn claims_strategy() -> impl Strategy<Value = Vec<PersistentVolumeClaim>> {
    prop::collection::btree_map("[a-z]{1,8}", 0..STORAGE_CLASSES.len(), 0..12).prop_map(
        |claims| {
            claims
                .into_iter()
                .map(|(name, sc)| claim(&name, STORAGE_CLASSES[sc]))
                .collect()
        },
    )
}

fn status_strategy() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

fn names(claims: &[PersistentVolumeClaim]) -> Vec<String> {
    claims.iter().map(|c| c.name_any()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn classification_is_a_partition(
        claims in claims_strategy(),
        subset in prop::collection::vec(any::<bool>(), STORAGE_CLASSES.len()),
        snapshot_disabled in any::<bool>(),
    ) {
        let all = names(&claims);
        let sets = partition_by_provisioner(
            claims,
            &provisioners(),
            &classes(&subset),
            snapshot_disabled,
        ).unwrap();

        let block: BTreeSet<String> = names(&sets.block).into_iter().collect();
        let snapshot: BTreeSet<String> = names(&sets.snapshot).into_iter().collect();
        prop_assert!(block.is_disjoint(&snapshot));
        prop_assert_eq!(block.len() + snapshot.len(), all.len());
        prop_assert_eq!(block.union(&snapshot).cloned().collect::<Vec<_>>(), all);

        if snapshot_disabled {
            prop_assert!(sets.snapshot.is_empty());
        }
        for name in sets.block_classes.keys() {
            prop_assert!(block.contains(name));
        }
    }

    #[test]
    fn classification_is_deterministic(
        claims in claims_strategy(),
        subset in prop::collection::vec(any::<bool>(), STORAGE_CLASSES.len()),
        snapshot_disabled in any::<bool>(),
    ) {
        let classes = classes(&subset);
        let first = partition_by_provisioner(claims.clone(), &provisioners(), &classes, snapshot_disabled).unwrap();
        let second = partition_by_provisioner(claims, &provisioners(), &classes, snapshot_disabled).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn status_replay_only_yields_recorded_claims(
        claims in claims_strategy(),
        recorded in prop::collection::vec(any::<(bool, bool)>(), 12),
    ) {
        let protected: Vec<ProtectedPvc> = claims
            .iter()
            .zip(&recorded)
            .filter(|(_, (keep, _))| *keep)
            .map(|(claim, (_, by_snapshot))| ProtectedPvc {
                name: claim.name_any(),
                protected_by_snapshot: *by_snapshot,
                ..Default::default()
            })
            .collect();

        let sets = partition_by_status(claims, &protected);

        prop_assert_eq!(sets.block.len() + sets.snapshot.len(), protected.len());
        for claim in &sets.snapshot {
            let name = claim.name_any();
            prop_assert!(protected.iter().any(|p| p.name == name && p.protected_by_snapshot));
        }
        for claim in &sets.block {
            let name = claim.name_any();
            prop_assert!(protected.iter().any(|p| p.name == name && !p.protected_by_snapshot));
        }
    }

    #[test]
    fn conditions_hold_one_entry_per_type(
        updates in prop::collection::vec((0usize..4, status_strategy()), 0..32),
    ) {
        let types = ["DataReady", "DataProtected", "ClusterDataReady", "ClusterDataProtected"];
        let mut conditions = Conditions::new();
        let mut last = BTreeMap::new();

        for (index, status) in updates {
            conditions.upsert_by_type(Condition::new(types[index], status, "Reason", "message", Some(1)));
            last.insert(types[index], status);
        }

        prop_assert_eq!(conditions.len(), last.len());
        for (type_, status) in last {
            prop_assert_eq!(conditions.find_by_type(type_).map(|c| c.status), Some(status));
        }
    }
}
